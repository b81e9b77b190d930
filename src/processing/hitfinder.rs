//! Peak finding on 2-D results and visualisation of the found peaks.

use std::sync::OnceLock;

use crate::event::CassEvent;
use crate::settings::Settings;

use super::result::ResultData;
use super::{Input, Operation, ProcessorError, Wiring};

/// Column order of the peak table.
#[allow(missing_docs)]
pub mod peak_columns {
    pub const CENTROID_COLUMN: usize = 0;
    pub const CENTROID_ROW: usize = 1;
    pub const INTENSITY: usize = 2;
    pub const NBR_OF_PIXELS: usize = 3;
    pub const SIGNAL_TO_NOISE: usize = 4;
    pub const MAX_RADIUS: usize = 5;
    pub const MIN_RADIUS: usize = 6;
    pub const INDEX: usize = 7;
    pub const COLUMN: usize = 8;
    pub const ROW: usize = 9;
    pub const MAX_ADU: usize = 10;
    pub const LOCAL_BACKGROUND: usize = 11;
    pub const LOCAL_BACKGROUND_DEVIATION: usize = 12;
    pub const NBR_OF_BACKGROUND_PIXELS: usize = 13;
    pub const NBR_OF: usize = 14;
}

struct BoxStatistics {
    mean: f64,
    stdv: f64,
    count: usize,
}

/// Finds peaks in a 2-D result and emits one table row per peak.
///
/// A candidate pixel must lie above the threshold, be the local maximum of
/// its box, have enough clean background samples outside the peak radius
/// and stand out from that background by at least the configured
/// signal-to-noise ratio. The peak is then grown over the 8-neighbours that
/// clear a lower per-neighbour ratio and centroided by intensity.
pub struct PeakFinder {
    hist_name: String,
    box_size: (usize, usize),
    section_size: (usize, usize),
    threshold: f64,
    min_snr: f64,
    min_neighbour_snr: f64,
    min_bckgnd_pixels: usize,
    peak_radius_sq: i64,
    hist: OnceLock<Input>,
}

impl PeakFinder {
    /// Parses `HistName`, `BraggPeakRadius`, `BoxSizeX`/`BoxSizeY`,
    /// `SectionSizeX`/`SectionSizeY`, `Threshold`, `MinSignalToNoiseRatio`,
    /// `MinNeighbourSNR`, `MinNbrBackgrndPixels`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> PeakFinder {
        let peak_radius = s.value_f64("BraggPeakRadius", 2.0);
        let good_box_size = (std::f64::consts::PI.sqrt() * peak_radius) as usize;
        PeakFinder {
            hist_name: s.value_str("HistName", ""),
            box_size: (
                s.value_usize("BoxSizeX", good_box_size).max(1),
                s.value_usize("BoxSizeY", good_box_size).max(1),
            ),
            section_size: (
                s.value_usize("SectionSizeX", 1024),
                s.value_usize("SectionSizeY", 512),
            ),
            threshold: s.value_f64("Threshold", 300.0),
            min_snr: s.value_f64("MinSignalToNoiseRatio", 20.0),
            min_neighbour_snr: s.value_f64("MinNeighbourSNR", 3.0),
            min_bckgnd_pixels: s.value_usize("MinNbrBackgrndPixels", 10),
            peak_radius_sq: (peak_radius * peak_radius) as i64,
            hist: OnceLock::new(),
        }
    }

    /// Statistics over the box pixels outside the peak radius. `None` when
    /// the candidate is not the local maximum or a bad pixel lies within
    /// the radius.
    fn box_statistics(
        &self,
        image: &[f64],
        ncols: usize,
        col: usize,
        row: usize,
    ) -> Option<BoxStatistics> {
        let center = image[row * ncols + col];
        let (boxw, boxh) = (self.box_size.0 as i64, self.box_size.1 as i64);
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut count = 0usize;
        for box_row in -boxh..=boxh {
            for box_col in -boxw..=boxw {
                if box_row == 0 && box_col == 0 {
                    continue;
                }
                let idx = ((row as i64 + box_row) * ncols as i64 + col as i64 + box_col) as usize;
                let pixel = image[idx];
                if center < pixel {
                    return None;
                }
                let radius_sq = box_row * box_row + box_col * box_col;
                if self.peak_radius_sq < radius_sq {
                    sum += pixel;
                    sum_sq += pixel * pixel;
                    count += 1;
                } else if pixel == 0.0 {
                    // bad pixels must not be part of a peak
                    return None;
                }
            }
        }
        let n = count as f64;
        let mean = if count > 0 { sum / n } else { 0.0 };
        let stdv = if count > 1 {
            ((sum_sq - n * mean * mean) / (n - 1.0)).max(0.0).sqrt()
        } else {
            0.0
        };
        Some(BoxStatistics { mean, stdv, count })
    }
}

impl Operation for PeakFinder {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        if hist.template().axes_2d().is_none() {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!("input '{}' is not two dimensional", self.hist_name),
            });
        }
        let _ = self.hist.set(hist);
        Ok(ResultData::new_table("", peak_columns::NBR_OF))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let input = self
            .hist
            .get()
            .expect("input wired before processing")
            .result(event.id())?;
        let input = input.read().expect("result lock poisoned");
        let (x, y) = input.axes_2d().expect("shape checked at wiring");
        let (ncols, nrows) = (x.nbins, y.nbins);
        let image = input.bins();

        result.clear();
        result.set_event_id(event.id());

        let (boxw, boxh) = self.box_size;
        let (xsec, ysec) = (self.section_size.0.max(1), self.section_size.1.max(1));
        let neighbour_offsets: [(i64, i64); 8] = [
            (-1, -1),
            (0, -1),
            (1, -1),
            (-1, 0),
            (1, 0),
            (-1, 1),
            (0, 1),
            (1, 1),
        ];

        let mut checked = vec![false; image.len()];
        let mut row_buf = [0.0; peak_columns::NBR_OF];

        for idx in 0..image.len() {
            if checked[idx] || image[idx] < self.threshold {
                continue;
            }
            let col = idx % ncols;
            let row = idx / ncols;

            // the box must fit the image and stay within one section
            if col < boxw
                || ncols - boxw <= col
                || row < boxh
                || nrows - boxh <= row
                || (col - boxw) / xsec != (col + boxw) / xsec
                || (row - boxh) / ysec != (row + boxh) / ysec
            {
                continue;
            }

            let stats = match self.box_statistics(image, ncols, col, row) {
                Some(stats) => stats,
                None => continue,
            };
            if stats.count < self.min_bckgnd_pixels {
                continue;
            }
            let snr = (image[idx] - stats.mean) / stats.stdv;
            if snr < self.min_snr {
                continue;
            }

            // grow the peak over 8-neighbours above the per-neighbour ratio,
            // staying within the box
            let mut peak_pixels = vec![idx];
            checked[idx] = true;
            let mut cursor = 0;
            while cursor < peak_pixels.len() {
                let pos = peak_pixels[cursor] as i64;
                cursor += 1;
                for (dc, dr) in neighbour_offsets {
                    let n_idx = pos + dr * ncols as i64 + dc;
                    if n_idx < 0 || n_idx as usize >= image.len() {
                        continue;
                    }
                    let n_idx = n_idx as usize;
                    let n_col = (n_idx % ncols) as i64;
                    let n_row = (n_idx / ncols) as i64;
                    if checked[n_idx]
                        || (col as i64 - n_col).unsigned_abs() > boxw as u64
                        || (row as i64 - n_row).unsigned_abs() > boxh as u64
                    {
                        continue;
                    }
                    let n_snr = (image[n_idx] - stats.mean) / stats.stdv;
                    if self.min_neighbour_snr < n_snr {
                        peak_pixels.push(n_idx);
                        checked[n_idx] = true;
                    }
                }
            }

            // centroid the found cluster by background-subtracted intensity;
            // every box pixel counts as visited afterwards
            let mut integral = 0.0;
            let mut weight_col = 0.0;
            let mut weight_row = 0.0;
            let mut n_pix = 0usize;
            let mut max_radius_sq: i64 = 0;
            let mut min_radius_sq: i64 =
                (boxw.max(boxh) * boxw.max(boxh)) as i64;
            for box_row in -(boxh as i64)..=boxh as i64 {
                for box_col in -(boxw as i64)..=boxw as i64 {
                    let b_idx =
                        ((row as i64 + box_row) * ncols as i64 + col as i64 + box_col) as usize;
                    let cleaned = image[b_idx] - stats.mean;
                    if checked[b_idx] {
                        let radius_sq = box_row * box_row + box_col * box_col;
                        max_radius_sq = max_radius_sq.max(radius_sq);
                        min_radius_sq = min_radius_sq.min(radius_sq);
                        integral += cleaned;
                        weight_col += cleaned * (box_col + col as i64) as f64;
                        weight_row += cleaned * (box_row + row as i64) as f64;
                        n_pix += 1;
                    }
                    checked[b_idx] = true;
                }
            }
            if integral == 0.0 {
                continue;
            }

            row_buf[peak_columns::CENTROID_COLUMN] = weight_col / integral;
            row_buf[peak_columns::CENTROID_ROW] = weight_row / integral;
            row_buf[peak_columns::INTENSITY] = integral;
            row_buf[peak_columns::NBR_OF_PIXELS] = n_pix as f64;
            row_buf[peak_columns::SIGNAL_TO_NOISE] = snr;
            row_buf[peak_columns::MAX_RADIUS] = (max_radius_sq as f64).sqrt();
            row_buf[peak_columns::MIN_RADIUS] = (min_radius_sq as f64).sqrt();
            row_buf[peak_columns::INDEX] = idx as f64;
            row_buf[peak_columns::COLUMN] = col as f64;
            row_buf[peak_columns::ROW] = row as f64;
            row_buf[peak_columns::MAX_ADU] = image[idx];
            row_buf[peak_columns::LOCAL_BACKGROUND] = stats.mean;
            row_buf[peak_columns::LOCAL_BACKGROUND_DEVIATION] = stats.stdv;
            row_buf[peak_columns::NBR_OF_BACKGROUND_PIXELS] = stats.count as f64;
            result.append_row(&row_buf);
        }

        result.add_fill();
        Ok(())
    }
}

/// Draws a box and/or circle around every peak of a table into a copy of
/// the image the peaks were found in.
pub struct PeakDisplay {
    hist_name: String,
    table_name: String,
    box_size: (usize, usize),
    draw_value: f64,
    radius: f64,
    index_column: usize,
    draw_circle: bool,
    draw_box: bool,
    hist: OnceLock<Input>,
    table: OnceLock<Input>,
}

impl PeakDisplay {
    /// Parses `HistName`, `TableName`, `BoxSizeX`/`BoxSizeY`,
    /// `DrawPixelValue`, `Radius`, `IndexColumn`, `DrawCircle`, `DrawBox`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> PeakDisplay {
        PeakDisplay {
            hist_name: s.value_str("HistName", ""),
            table_name: s.value_str("TableName", ""),
            box_size: (
                s.value_usize("BoxSizeX", 10),
                s.value_usize("BoxSizeY", 10),
            ),
            draw_value: s.value_f64("DrawPixelValue", 16000.0),
            radius: s.value_f64("Radius", 2.0),
            index_column: s.value_usize("IndexColumn", peak_columns::INDEX),
            draw_circle: s.value_bool("DrawCircle", true),
            draw_box: s.value_bool("DrawBox", true),
            hist: OnceLock::new(),
            table: OnceLock::new(),
        }
    }
}

impl Operation for PeakDisplay {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone(), self.table_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let table = wiring.input(&self.table_name)?;
        if hist.template().axes_2d().is_none() {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!("input '{}' is not two dimensional", self.hist_name),
            });
        }
        let columns = match &table.template().value {
            super::result::Value::Table { columns, .. } => *columns,
            _ => {
                return Err(ProcessorError::ShapeMismatch {
                    name: wiring.node_name().to_string(),
                    reason: format!("input '{}' is not a table", self.table_name),
                })
            }
        };
        if self.index_column >= columns {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!(
                    "index column {} exceeds the table width {columns}",
                    self.index_column
                ),
            });
        }
        let template = hist.template().clone();
        let _ = self.hist.set(hist);
        let _ = self.table.set(table);
        Ok(template)
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let id = event.id();
        let image = self
            .hist
            .get()
            .expect("input wired before processing")
            .result(id)?;
        let table = self
            .table
            .get()
            .expect("input wired before processing")
            .result(id)?;
        let image = image.read().expect("result lock poisoned");
        let table = table.read().expect("result lock poisoned");
        let (x, y) = image.axes_2d().expect("shape checked at wiring");
        let (ncols, nrows) = (x.nbins, y.nbins);

        result.bins_mut().copy_from_slice(image.bins());
        let out = result.bins_mut();
        let mut paint = |col: i64, row: i64| {
            if col >= 0 && row >= 0 && (col as usize) < ncols && (row as usize) < nrows {
                out[row as usize * ncols + col as usize] = self.draw_value;
            }
        };

        let (boxw, boxh) = (self.box_size.0 as i64, self.box_size.1 as i64);
        for row_idx in 0..table.table_rows() {
            let table_row = table.table_row(row_idx);
            let center = table_row[self.index_column] as usize;
            let center_col = (center % ncols) as i64;
            let center_row = (center / ncols) as i64;

            if self.draw_box {
                for box_col in -boxw..=boxw {
                    paint(center_col + box_col, center_row - boxh);
                    paint(center_col + box_col, center_row + boxh);
                }
                for box_row in -boxh..=boxh {
                    paint(center_col - boxw, center_row + box_row);
                    paint(center_col + boxw, center_row + box_row);
                }
            }
            if self.draw_circle {
                for angle_deg in 0..360 {
                    let angle = std::f64::consts::PI * f64::from(angle_deg) / 180.0;
                    let col = center_col + (self.radius * angle.sin()).round() as i64;
                    let row = center_row + (self.radius * angle.cos()).round() as i64;
                    paint(col, row);
                }
            }
        }
        result.add_fill();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::result::Axis;
    use crate::processing::{GraphContext, ProcessorGraph};
    use crate::settings::Settings as S;
    use std::sync::atomic::AtomicBool;

    /// A small synthetic peak on a flat background exercises the finder
    /// directly, without going through a device.
    #[test]
    fn finds_a_single_synthetic_peak() {
        let mut finder = PeakFinder::from_settings(
            &S::from_str(
                r#"
[PostProcessor.x]
"#,
            )
            .unwrap()
            .group("PostProcessor")
            .group("x"),
        );
        // defaults: threshold 300, box from radius 2, min snr 20

        let ncols = 64;
        let nrows = 64;
        let mut image = ResultData::new_2d(
            "img",
            Axis::new(ncols, 0.0, ncols as f64, "cols"),
            Axis::new(nrows, 0.0, nrows as f64, "rows"),
        );
        {
            let bins = image.bins_mut();
            // flat background with a little deterministic ripple so the
            // background deviation is non-zero
            for (i, b) in bins.iter_mut().enumerate() {
                *b = 10.0 + 0.1 * ((i % 7) as f64 - 3.0);
            }
            let (pc, pr) = (30usize, 20usize);
            bins[pr * ncols + pc] = 500.0;
            bins[pr * ncols + pc + 1] = 260.0;
            bins[pr * ncols + pc - 1] = 260.0;
            bins[(pr + 1) * ncols + pc] = 260.0;
            bins[(pr - 1) * ncols + pc] = 260.0;
        }
        image.set_fills(1);

        // wire the finder against a graph holding the image as a constant
        let settings = S::from_str(
            r#"
[PostProcessor.img]
Kind = "constant"
Value = 10.0
Dimension = 2
XNbrBins = 64
XUp = 64.0
YNbrBins = 64
YUp = 64.0
"#,
        )
        .unwrap();
        let graph = ProcessorGraph::load(&settings, &GraphContext::new(), 1).unwrap();
        let mut event = crate::event::CassEvent::allocate(16);
        event.set_id(1);
        graph.process_event(&event, &AtomicBool::new(false));

        // place the synthetic image into the wired node's result
        let node = graph.find("img").unwrap();
        {
            let handle = node.result(1).unwrap();
            let mut slot = handle.write().unwrap();
            let bins_src = image.bins().to_vec();
            slot.bins_mut().copy_from_slice(&bins_src);
        }

        let nodes = [(String::from("img"), node)].into_iter().collect();
        let wiring = crate::processing::Wiring {
            nodes: &nodes,
            name: "peaks",
        };
        let mut table = finder.wire(&wiring).unwrap();
        finder.process(&event, &mut table).unwrap();

        assert_eq!(table.table_rows(), 1);
        let row = table.table_row(0);
        assert!((row[peak_columns::CENTROID_COLUMN] - 30.0).abs() < 0.5);
        assert!((row[peak_columns::CENTROID_ROW] - 20.0).abs() < 0.5);
        assert!(row[peak_columns::SIGNAL_TO_NOISE] > 20.0);
        assert_eq!(row[peak_columns::MAX_ADU], 500.0);
        assert!(row[peak_columns::NBR_OF_PIXELS] >= 5.0);
    }
}
