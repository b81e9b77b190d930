//! pnCCD converter.
//!
//! The camera delivers four quarter-frame segments of 14 bit samples packed
//! into 16 bit words. The segments are reassembled into one linearized frame:
//! segments 0 and 3 are copied in natural order into the top half, segments 1
//! and 2 in reverse order into the bottom half, interleaving one segment-row
//! of each per frame-row.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::error;
use ndarray::{s, Array2};

use crate::event::pixeldetector::{Pixel, PixelDetector};
use crate::event::{CassEvent, Device, DeviceKind};
use crate::xtc::{TypeKind, XtcNode};

use super::store::{ConfigStore, PnccdConfig};
use super::{CassIdMap, ConversionError, Converter};

/// The two status bits above the 14 bit sample are masked off.
const DATA_MASK: u16 = 0x3fff;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawConfigV2 {
    nbr_links: u32,
    payload_size_per_link: u32,
    nbr_channels: u32,
    nbr_rows: u32,
    nbr_submodule_channels: u32,
    nbr_submodule_rows: u32,
    camex_magic: u32,
    info: [u8; 64],
    timing_fname: [u8; 64],
}

const RAW_CONFIG_V2_SIZE: usize = std::mem::size_of::<RawConfigV2>();

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawFrameHeader {
    special: u32,
    frame_number: u32,
    timestamp_hi: u32,
    timestamp_lo: u32,
}

const RAW_FRAME_HEADER_SIZE: usize = std::mem::size_of::<RawFrameHeader>();

fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Converter for pnCCD configuration and frame payloads.
pub struct PnccdConverter {
    store: Arc<ConfigStore>,
    ids: Arc<CassIdMap>,
}

impl PnccdConverter {
    /// Creates the converter over the shared configuration store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, ids: Arc<CassIdMap>) -> PnccdConverter {
        PnccdConverter { store, ids }
    }

    fn convert_config(&self, node: &XtcNode) -> Result<(), ConversionError> {
        let config = match node.type_id.version() {
            1 => PnccdConfig::default(),
            _ => {
                if node.payload.len() < RAW_CONFIG_V2_SIZE {
                    return Err(ConversionError::PayloadTooSmall {
                        converter: "PnccdConverter",
                        need: RAW_CONFIG_V2_SIZE,
                        have: node.payload.len(),
                    });
                }
                let raw: RawConfigV2 =
                    bytemuck::pod_read_unaligned(&node.payload[..RAW_CONFIG_V2_SIZE]);
                let config = PnccdConfig {
                    rows: raw.nbr_rows as usize,
                    columns: raw.nbr_channels as usize,
                    rows_of_segment: raw.nbr_submodule_rows as usize,
                    columns_of_segment: raw.nbr_submodule_channels as usize,
                    nbr_links: raw.nbr_links as usize,
                    camex_magic: raw.camex_magic,
                    info: fixed_str(&raw.info),
                    timing_filename: fixed_str(&raw.timing_fname),
                };
                let defaults = PnccdConfig::default();
                if config.rows > defaults.rows
                    || config.columns > defaults.columns
                    || config.rows_of_segment > defaults.rows_of_segment
                    || config.columns_of_segment > defaults.columns_of_segment
                {
                    error!(
                        "pnCCD configuration {}x{} (segments {}x{}) exceeds the detector, \
                         falling back to defaults",
                        config.columns,
                        config.rows,
                        config.columns_of_segment,
                        config.rows_of_segment
                    );
                    PnccdConfig {
                        camex_magic: config.camex_magic,
                        info: config.info,
                        timing_filename: config.timing_filename,
                        ..defaults
                    }
                } else {
                    config
                }
            }
        };
        self.store.put_pnccd(node.src.phy, config);
        Ok(())
    }

    fn convert_frame(&self, node: &XtcNode, event: &mut CassEvent) -> Result<(), ConversionError> {
        let config =
            self.store
                .pnccd(node.src.phy)
                .ok_or(ConversionError::MissingConfig {
                    converter: "PnccdConverter",
                    src: node.src.phy,
                })?;

        let seg_rows = config.rows_of_segment;
        let seg_cols = config.columns_of_segment;
        let seg_len = seg_rows * seg_cols;
        let link_size = RAW_FRAME_HEADER_SIZE + seg_len * 2;
        let need = link_size * config.nbr_links;
        if node.payload.len() < need {
            return Err(ConversionError::PayloadTooSmall {
                converter: "PnccdConverter",
                need,
                have: node.payload.len(),
            });
        }
        if config.nbr_links != 4 {
            return Err(ConversionError::Inconsistent {
                converter: "PnccdConverter",
                reason: format!("expected 4 segments, configuration has {}", config.nbr_links),
            });
        }

        // decode each segment into its own masked tile
        let segment = |index: usize| -> Array2<Pixel> {
            let begin = index * link_size + RAW_FRAME_HEADER_SIZE;
            let samples: Vec<Pixel> = node.payload[begin..begin + seg_len * 2]
                .chunks_exact(2)
                .map(|pair| Pixel::from(u16::from_le_bytes([pair[0], pair[1]]) & DATA_MASK))
                .collect();
            Array2::from_shape_vec((seg_rows, seg_cols), samples)
                .expect("segment shape matches the sample count")
        };
        let (tile_a, tile_b) = (segment(0), segment(3));
        let (tile_c, tile_d) = (segment(1), segment(2));

        // segments 0 and 3 keep their orientation in the top half; 1 and 2
        // enter the bottom half rotated by 180 degrees
        let mut assembled = Array2::<Pixel>::zeros((seg_rows * 2, seg_cols * 2));
        assembled
            .slice_mut(s![..seg_rows, ..seg_cols])
            .assign(&tile_a);
        assembled
            .slice_mut(s![..seg_rows, seg_cols..])
            .assign(&tile_b);
        assembled
            .slice_mut(s![seg_rows.., ..seg_cols])
            .assign(&tile_c.slice(s![..;-1, ..;-1]));
        assembled
            .slice_mut(s![seg_rows.., seg_cols..])
            .assign(&tile_d.slice(s![..;-1, ..;-1]));
        let frame = assembled.into_raw_vec();

        let id = self.ids.resolve(TypeKind::PnccdFrame, node.src.phy);
        if let Device::PixelDetectors(dev) = event.device_mut(DeviceKind::PixelDetectors) {
            dev.dets.insert(
                id,
                PixelDetector {
                    columns: seg_cols * 2,
                    rows: seg_rows * 2,
                    frame,
                    camax_magic: config.camex_magic,
                    info: config.info.clone(),
                    timing_filename: config.timing_filename.clone(),
                },
            );
        }
        Ok(())
    }
}

impl Converter for PnccdConverter {
    fn type_list(&self) -> Vec<(TypeKind, u16)> {
        vec![
            (TypeKind::PnccdConfig, 1),
            (TypeKind::PnccdConfig, 2),
            (TypeKind::PnccdFrame, 1),
        ]
    }

    fn convert(&self, node: &XtcNode, event: &mut CassEvent) -> Result<(), ConversionError> {
        match node.type_id.kind() {
            Some(TypeKind::PnccdConfig) => self.convert_config(node),
            Some(TypeKind::PnccdFrame) => self.convert_frame(node, event),
            _ => Ok(()),
        }
    }
}

/// Serializes a version 2 configuration payload.
#[must_use]
pub fn encode_config_v2(
    columns: u32,
    rows: u32,
    seg_columns: u32,
    seg_rows: u32,
    camex_magic: u32,
) -> Vec<u8> {
    let raw = RawConfigV2 {
        nbr_links: 4,
        payload_size_per_link: RAW_FRAME_HEADER_SIZE as u32 + seg_columns * seg_rows * 2,
        nbr_channels: columns,
        nbr_rows: rows,
        nbr_submodule_channels: seg_columns,
        nbr_submodule_rows: seg_rows,
        camex_magic,
        info: [0; 64],
        timing_fname: [0; 64],
    };
    bytemuck::bytes_of(&raw).to_vec()
}

/// Serializes a four-segment frame payload from per-segment sample slices.
#[must_use]
pub fn encode_frame(segments: &[&[u16]; 4]) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, segment) in segments.iter().enumerate() {
        let header = RawFrameHeader {
            special: 0,
            frame_number: index as u32,
            timestamp_hi: 0,
            timestamp_lo: 0,
        };
        out.extend_from_slice(bytemuck::bytes_of(&header));
        for sample in *segment {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xtc::{Damage, Level, Src, TypeId};

    fn node<'a>(kind: TypeKind, version: u16, payload: &'a [u8]) -> XtcNode<'a> {
        XtcNode {
            type_id: TypeId::new(kind, version),
            damage: Damage(0),
            src: Src { level: Level::Source, phy: 0x1100 },
            payload,
        }
    }

    /// Four 2x2 segments exercise the reassembly orientation on a 4x4 frame.
    #[test]
    fn reassembly_orientation() {
        let store = Arc::new(ConfigStore::new());
        let converter = PnccdConverter::new(Arc::clone(&store), Arc::new(CassIdMap::new()));
        let mut event = CassEvent::allocate(64);

        let config = encode_config_v2(4, 4, 2, 2, 0);
        converter.convert(&node(TypeKind::PnccdConfig, 2, &config), &mut event).unwrap();

        let seg0: Vec<u16> = vec![1, 2, 3, 4];
        let seg1: Vec<u16> = vec![11, 12, 13, 14];
        let seg2: Vec<u16> = vec![21, 22, 23, 24];
        let seg3: Vec<u16> = vec![31, 32, 33, 34];
        let data = encode_frame(&[&seg0, &seg1, &seg2, &seg3]);
        converter.convert(&node(TypeKind::PnccdFrame, 1, &data), &mut event).unwrap();

        let dev = event.pixel_detectors(DeviceKind::PixelDetectors).unwrap();
        let det = dev.dets.values().next().unwrap();
        assert_eq!(det.shape(), (4, 4));
        let frame: Vec<u16> = det.frame.iter().map(|&p| p as u16).collect();
        assert_eq!(
            frame,
            vec![
                1, 2, 31, 32, // seg0 row 0, seg3 row 0
                3, 4, 33, 34, // seg0 row 1, seg3 row 1
                14, 13, 24, 23, // seg1 reversed, seg2 reversed
                12, 11, 22, 21,
            ]
        );
    }

    #[test]
    fn status_bits_are_masked() {
        let store = Arc::new(ConfigStore::new());
        let converter = PnccdConverter::new(Arc::clone(&store), Arc::new(CassIdMap::new()));
        let mut event = CassEvent::allocate(64);

        let config = encode_config_v2(2, 2, 1, 1, 0);
        converter.convert(&node(TypeKind::PnccdConfig, 2, &config), &mut event).unwrap();

        let segs: [Vec<u16>; 4] = [vec![0x4001], vec![0x8002], vec![0xc003], vec![0x0004]];
        let data = encode_frame(&[&segs[0], &segs[1], &segs[2], &segs[3]]);
        converter.convert(&node(TypeKind::PnccdFrame, 1, &data), &mut event).unwrap();

        let dev = event.pixel_detectors(DeviceKind::PixelDetectors).unwrap();
        let det = dev.dets.values().next().unwrap();
        let frame: Vec<u16> = det.frame.iter().map(|&p| p as u16).collect();
        assert_eq!(frame, vec![1, 4, 2, 3]);
    }

    #[test]
    fn oversized_config_falls_back_to_defaults() {
        let store = Arc::new(ConfigStore::new());
        let converter = PnccdConverter::new(Arc::clone(&store), Arc::new(CassIdMap::new()));
        let mut event = CassEvent::allocate(64);

        let config = encode_config_v2(4096, 4096, 2048, 2048, 7);
        converter.convert(&node(TypeKind::PnccdConfig, 2, &config), &mut event).unwrap();

        let stored = store.pnccd(0x1100).unwrap();
        assert_eq!(stored.rows, 1024);
        assert_eq!(stored.columns_of_segment, 512);
        assert_eq!(stored.camex_magic, 7);
    }
}
