//! Pixel detector payload.
//!
//! A detector frame is stored as one contiguous row-major array regardless of
//! the physical tile layout; the converters do the tile-to-linear remapping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::serializer::Serializable;

/// Type of one pixel of a linearized frame.
pub type Pixel = f32;

/// One detector of one shot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PixelDetector {
    /// Number of columns of the linearized frame.
    pub columns: usize,

    /// Number of rows of the linearized frame.
    pub rows: usize,

    /// Row-major pixel data; `frame.len() == columns * rows`.
    pub frame: Vec<Pixel>,

    /// Magic camex value from the configuration transition.
    pub camax_magic: u32,

    /// Free-form info string from the configuration transition.
    pub info: String,

    /// Name of the timing file from the configuration transition.
    pub timing_filename: String,
}

impl PixelDetector {
    /// The (columns, rows) shape.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.columns, self.rows)
    }
}

/// All pixel detectors of one shot, keyed by their dense id.
///
/// Tile ids inside a set are dense from 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PixelDetectorDevice {
    /// Detectors keyed by their dense id.
    pub dets: BTreeMap<u32, PixelDetector>,
}

impl Serializable for PixelDetectorDevice {
    const VERSION: u16 = 3;
    const NAME: &'static str = "PixelDetectorDevice";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_keeps_frame_shape() {
        let mut dev = PixelDetectorDevice::default();
        dev.dets.insert(
            1,
            PixelDetector {
                columns: 2,
                rows: 3,
                frame: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
                camax_magic: 0xdead,
                info: "pnCCD".to_string(),
                timing_filename: String::new(),
            },
        );
        let mut buf = Vec::new();
        Serializable::serialize(&dev, &mut buf).unwrap();
        let copy = <PixelDetectorDevice as Serializable>::deserialize(&mut buf.as_slice()).unwrap();
        let det = &copy.dets[&1];
        assert_eq!(det.shape(), (2, 3));
        assert_eq!(det.frame.len(), det.columns * det.rows);
        assert_eq!(det.camax_magic, 0xdead);
    }
}
