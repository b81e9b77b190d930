//! CsPad converter.
//!
//! The detector delivers up to four quadrants, each carrying eight two-asic
//! sections. Sections are written contiguously into one linear frame of
//! 2·194 columns and 4·8·185 rows, all sections stacked above each other.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::event::pixeldetector::{Pixel, PixelDetector};
use crate::event::{CassEvent, Device, DeviceKind};
use crate::xtc::{TypeKind, XtcNode};

use super::store::{ConfigStore, CspadConfig};
use super::{CassIdMap, ConversionError, Converter};

/// Rows of one asic.
pub const ASIC_NX: usize = 194;
/// Columns of one asic.
pub const ASIC_NY: usize = 185;
/// Sections per quadrant.
pub const SECTIONS_PER_QUAD: usize = 8;
/// Quadrants per detector.
pub const QUADS: usize = 4;

/// Pixels of one two-asic section.
pub const PIXELS_PER_SECTION: usize = 2 * ASIC_NX * ASIC_NY;
/// Pixels of one quadrant.
pub const PIXELS_PER_QUAD: usize = SECTIONS_PER_QUAD * PIXELS_PER_SECTION;
/// Columns of the assembled frame.
pub const FRAME_COLUMNS: usize = 2 * ASIC_NX;
/// Rows of the assembled frame.
pub const FRAME_ROWS: usize = QUADS * SECTIONS_PER_QUAD * ASIC_NY;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawConfig {
    quad_mask: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawElementHeader {
    quad: u32,
    seq_count: u32,
}

const RAW_ELEMENT_HEADER_SIZE: usize = std::mem::size_of::<RawElementHeader>();

/// Walks the quadrant elements and their sections of one data payload.
///
/// The iterator is stateful: [`SectionIterator::next_quad`] positions on the
/// next element header, [`SectionIterator::next_section`] yields the section
/// sample slices of that quadrant until they are exhausted.
struct SectionIterator<'a> {
    payload: &'a [u8],
    offset: usize,
    sections_left: usize,
    quad: usize,
}

impl<'a> SectionIterator<'a> {
    fn new(payload: &'a [u8]) -> SectionIterator<'a> {
        SectionIterator {
            payload,
            offset: 0,
            sections_left: 0,
            quad: 0,
        }
    }

    fn next_quad(&mut self) -> Result<Option<usize>, ConversionError> {
        if self.offset == self.payload.len() {
            return Ok(None);
        }
        if self.payload.len() < self.offset + RAW_ELEMENT_HEADER_SIZE {
            return Err(ConversionError::PayloadTooSmall {
                converter: "CspadConverter",
                need: self.offset + RAW_ELEMENT_HEADER_SIZE,
                have: self.payload.len(),
            });
        }
        let header: RawElementHeader = bytemuck::pod_read_unaligned(
            &self.payload[self.offset..self.offset + RAW_ELEMENT_HEADER_SIZE],
        );
        self.offset += RAW_ELEMENT_HEADER_SIZE;
        self.quad = header.quad as usize;
        self.sections_left = SECTIONS_PER_QUAD;
        if self.quad >= QUADS {
            return Err(ConversionError::Inconsistent {
                converter: "CspadConverter",
                reason: format!("element names quadrant {}", self.quad),
            });
        }
        Ok(Some(self.quad))
    }

    fn next_section(&mut self) -> Result<Option<&'a [u8]>, ConversionError> {
        if self.sections_left == 0 {
            return Ok(None);
        }
        let bytes = PIXELS_PER_SECTION * 2;
        if self.payload.len() < self.offset + bytes {
            return Err(ConversionError::PayloadTooSmall {
                converter: "CspadConverter",
                need: self.offset + bytes,
                have: self.payload.len(),
            });
        }
        let section = &self.payload[self.offset..self.offset + bytes];
        self.offset += bytes;
        self.sections_left -= 1;
        Ok(Some(section))
    }
}

/// Converter for CsPad configuration and element payloads.
pub struct CspadConverter {
    store: Arc<ConfigStore>,
    ids: Arc<CassIdMap>,
}

impl CspadConverter {
    /// Creates the converter over the shared configuration store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, ids: Arc<CassIdMap>) -> CspadConverter {
        CspadConverter { store, ids }
    }

    fn convert_elements(
        &self,
        node: &XtcNode,
        event: &mut CassEvent,
    ) -> Result<(), ConversionError> {
        // config presence is required even though only the mask is buffered
        self.store
            .cspad(node.src.phy)
            .ok_or(ConversionError::MissingConfig {
                converter: "CspadConverter",
                src: node.src.phy,
            })?;

        let mut frame: Vec<Pixel> = vec![0.0; QUADS * PIXELS_PER_QUAD];
        let mut iter = SectionIterator::new(node.payload);
        while let Some(quad) = iter.next_quad()? {
            let mut write = quad * PIXELS_PER_QUAD;
            while let Some(section) = iter.next_section()? {
                for pair in section.chunks_exact(2) {
                    frame[write] = Pixel::from(u16::from_le_bytes([pair[0], pair[1]]));
                    write += 1;
                }
            }
        }

        let id = self.ids.resolve(TypeKind::CspadElement, node.src.phy);
        if let Device::PixelDetectors(dev) = event.device_mut(DeviceKind::PixelDetectors) {
            dev.dets.insert(
                id,
                PixelDetector {
                    columns: FRAME_COLUMNS,
                    rows: FRAME_ROWS,
                    frame,
                    camax_magic: 0,
                    info: String::new(),
                    timing_filename: String::new(),
                },
            );
        }
        Ok(())
    }
}

impl Converter for CspadConverter {
    fn type_list(&self) -> Vec<(TypeKind, u16)> {
        vec![(TypeKind::CspadConfig, 1), (TypeKind::CspadElement, 1)]
    }

    fn convert(&self, node: &XtcNode, event: &mut CassEvent) -> Result<(), ConversionError> {
        match node.type_id.kind() {
            Some(TypeKind::CspadConfig) => {
                if node.payload.len() < std::mem::size_of::<RawConfig>() {
                    return Err(ConversionError::PayloadTooSmall {
                        converter: "CspadConverter",
                        need: std::mem::size_of::<RawConfig>(),
                        have: node.payload.len(),
                    });
                }
                let raw: RawConfig = bytemuck::pod_read_unaligned(
                    &node.payload[..std::mem::size_of::<RawConfig>()],
                );
                self.store.put_cspad(
                    node.src.phy,
                    CspadConfig {
                        quad_mask: raw.quad_mask,
                    },
                );
                Ok(())
            }
            Some(TypeKind::CspadElement) => self.convert_elements(node, event),
            _ => Ok(()),
        }
    }
}

/// Serializes a configuration payload.
#[must_use]
pub fn encode_config(quad_mask: u32) -> Vec<u8> {
    bytemuck::bytes_of(&RawConfig { quad_mask }).to_vec()
}

/// Appends one quadrant element with constant-valued sections.
pub fn encode_quad(out: &mut Vec<u8>, quad: u32, section_value: u16) {
    out.extend_from_slice(bytemuck::bytes_of(&RawElementHeader {
        quad,
        seq_count: 0,
    }));
    for _ in 0..SECTIONS_PER_QUAD * PIXELS_PER_SECTION {
        out.extend_from_slice(&section_value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xtc::{Damage, Level, Src, TypeId};

    #[test]
    fn quadrants_land_in_their_frame_slice() {
        let store = Arc::new(ConfigStore::new());
        let converter = CspadConverter::new(Arc::clone(&store), Arc::new(CassIdMap::new()));
        let mut event = CassEvent::allocate(64);

        let config = encode_config(0b0101);
        let config_node = XtcNode {
            type_id: TypeId::new(TypeKind::CspadConfig, 1),
            damage: Damage(0),
            src: Src { level: Level::Source, phy: 0x3 },
            payload: &config,
        };
        converter.convert(&config_node, &mut event).unwrap();

        // quadrants 0 and 2 present, out of order on the wire
        let mut data = Vec::new();
        encode_quad(&mut data, 2, 22);
        encode_quad(&mut data, 0, 11);
        let data_node = XtcNode {
            type_id: TypeId::new(TypeKind::CspadElement, 1),
            damage: Damage(0),
            src: Src { level: Level::Source, phy: 0x3 },
            payload: &data,
        };
        converter.convert(&data_node, &mut event).unwrap();

        let dev = event.pixel_detectors(DeviceKind::PixelDetectors).unwrap();
        let det = dev.dets.values().next().unwrap();
        assert_eq!(det.columns, 388);
        assert_eq!(det.rows, 5920);
        assert_eq!(det.frame.len(), det.columns * det.rows);
        assert_eq!(det.frame[0] as u16, 11);
        assert_eq!(det.frame[2 * PIXELS_PER_QUAD] as u16, 22);
        // quadrants 1 and 3 were absent and stay zero
        assert_eq!(det.frame[PIXELS_PER_QUAD] as u16, 0);
        assert_eq!(det.frame[3 * PIXELS_PER_QUAD] as u16, 0);
    }
}
