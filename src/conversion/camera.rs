//! Commercial camera converter.
//!
//! The payload is already one linear frame. The first eight pixels carry
//! status words; they are overwritten with the value of the ninth pixel. A
//! constant offset announced in the frame header is subtracted from every
//! pixel.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::event::pixeldetector::{Pixel, PixelDetector};
use crate::event::{CassEvent, Device, DeviceKind};
use crate::xtc::{TypeKind, XtcNode};

use super::{CassIdMap, ConversionError, Converter};

/// Number of status pixels at the start of the frame.
const STATUS_PIXELS: usize = 8;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawFrameHeader {
    width: u32,
    height: u32,
    depth: u32,
    offset: u32,
}

const RAW_FRAME_HEADER_SIZE: usize = std::mem::size_of::<RawFrameHeader>();

/// Converter for camera frame payloads.
pub struct CameraConverter {
    ids: Arc<CassIdMap>,
}

impl CameraConverter {
    /// Creates the converter.
    #[must_use]
    pub fn new(ids: Arc<CassIdMap>) -> CameraConverter {
        CameraConverter { ids }
    }
}

impl Converter for CameraConverter {
    fn type_list(&self) -> Vec<(TypeKind, u16)> {
        vec![(TypeKind::Frame, 1)]
    }

    fn convert(&self, node: &XtcNode, event: &mut CassEvent) -> Result<(), ConversionError> {
        if node.payload.len() < RAW_FRAME_HEADER_SIZE {
            return Err(ConversionError::PayloadTooSmall {
                converter: "CameraConverter",
                need: RAW_FRAME_HEADER_SIZE,
                have: node.payload.len(),
            });
        }
        let header: RawFrameHeader =
            bytemuck::pod_read_unaligned(&node.payload[..RAW_FRAME_HEADER_SIZE]);
        let columns = header.width as usize;
        let rows = header.height as usize;
        let need = RAW_FRAME_HEADER_SIZE + columns * rows * 2;
        if node.payload.len() < need {
            return Err(ConversionError::PayloadTooSmall {
                converter: "CameraConverter",
                need,
                have: node.payload.len(),
            });
        }
        if columns * rows <= STATUS_PIXELS {
            return Err(ConversionError::Inconsistent {
                converter: "CameraConverter",
                reason: format!("frame of {columns}x{rows} pixels is all status words"),
            });
        }

        let offset = Pixel::from(header.offset as u16);
        let mut frame: Vec<Pixel> = node.payload[RAW_FRAME_HEADER_SIZE..need]
            .chunks_exact(2)
            .map(|pair| Pixel::from(u16::from_le_bytes([pair[0], pair[1]])) - offset)
            .collect();
        let replacement = frame[STATUS_PIXELS];
        for status in frame.iter_mut().take(STATUS_PIXELS) {
            *status = replacement;
        }

        let id = self.ids.resolve(TypeKind::Frame, node.src.phy);
        if let Device::Ccd(dev) = event.device_mut(DeviceKind::Ccd) {
            dev.dets.insert(
                id,
                PixelDetector {
                    columns,
                    rows,
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

/// Serializes a camera frame payload.
#[must_use]
pub fn encode_frame(columns: u32, rows: u32, offset: u32, pixels: &[u16]) -> Vec<u8> {
    let header = RawFrameHeader {
        width: columns,
        height: rows,
        depth: 16,
        offset,
    };
    let mut out = bytemuck::bytes_of(&header).to_vec();
    for pixel in pixels {
        out.extend_from_slice(&pixel.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xtc::{Damage, Level, Src, TypeId};

    #[test]
    fn status_pixels_are_replaced_and_offset_subtracted() {
        let converter = CameraConverter::new(Arc::new(CassIdMap::new()));
        let mut event = CassEvent::allocate(64);

        let mut pixels = vec![9999u16; 16];
        for (i, px) in pixels.iter_mut().enumerate().skip(STATUS_PIXELS) {
            *px = 100 + i as u16;
        }
        let payload = encode_frame(4, 4, 100, &pixels);
        let node = XtcNode {
            type_id: TypeId::new(TypeKind::Frame, 1),
            damage: Damage(0),
            src: Src { level: Level::Source, phy: 0x7 },
            payload: &payload,
        };
        converter.convert(&node, &mut event).unwrap();

        let dev = event.pixel_detectors(DeviceKind::Ccd).unwrap();
        let det = dev.dets.values().next().unwrap();
        // pixel 8 was 108, offset 100 -> 8; the status pixels copy it
        assert_eq!(det.frame[0], 8.0);
        assert_eq!(det.frame[7], 8.0);
        assert_eq!(det.frame[8], 8.0);
        assert_eq!(det.frame[15], 15.0);
    }
}
