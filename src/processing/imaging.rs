//! Image-wide operations over 2-D results.

use std::sync::OnceLock;

use rayon::prelude::*;

use crate::event::CassEvent;
use crate::settings::Settings;

use super::{Input, Operation, ProcessorError, Wiring};
use super::result::ResultData;

/// Replaces every non-zero pixel by the median of the non-zero pixels in a
/// box around it, with the box clipped to a fixed-size subsection of the
/// image. Pixels of value zero are treated as bad and left untouched.
pub struct LocalMedianBackground {
    hist_name: String,
    box_size: (usize, usize),
    section_size: (usize, usize),
    hist: OnceLock<Input>,
}

impl LocalMedianBackground {
    /// Parses `HistName`, `BoxSizeX`/`BoxSizeY`, `SectionSizeX`/`SectionSizeY`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> LocalMedianBackground {
        LocalMedianBackground {
            hist_name: s.value_str("HistName", ""),
            box_size: (
                s.value_usize("BoxSizeX", 10),
                s.value_usize("BoxSizeY", 10),
            ),
            section_size: (
                s.value_usize("SectionSizeX", 1024),
                s.value_usize("SectionSizeY", 512),
            ),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for LocalMedianBackground {
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
        let template = hist.template().clone();
        let _ = self.hist.set(hist);
        Ok(template)
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
        let (xbox, ybox) = self.box_size;
        let (xsec, ysec) = (self.section_size.0.max(1), self.section_size.1.max(1));

        result
            .bins_mut()
            .par_chunks_mut(ncols)
            .enumerate()
            .for_each(|(row, out_row)| {
                let sec_row_begin = (row / ysec) * ysec;
                let sec_row_end = (sec_row_begin + ysec).min(nrows);
                let box_row_begin = sec_row_begin.max(row.saturating_sub(ybox));
                let box_row_end = sec_row_end.min(row + ybox);
                let mut box_values: Vec<f64> = Vec::with_capacity((2 * xbox) * (2 * ybox));

                for (col, out) in out_row.iter_mut().enumerate() {
                    let pixel = image[row * ncols + col];
                    if pixel == 0.0 {
                        *out = pixel;
                        continue;
                    }
                    let sec_col_begin = (col / xsec) * xsec;
                    let sec_col_end = (sec_col_begin + xsec).min(ncols);
                    let box_col_begin = sec_col_begin.max(col.saturating_sub(xbox));
                    let box_col_end = sec_col_end.min(col + xbox);

                    box_values.clear();
                    for box_row in box_row_begin..box_row_end {
                        for box_col in box_col_begin..box_col_end {
                            let v = image[box_row * ncols + box_col];
                            if v != 0.0 {
                                box_values.push(v);
                            }
                        }
                    }
                    if box_values.is_empty() {
                        *out = pixel;
                    } else {
                        let mid = box_values.len() / 2;
                        box_values
                            .select_nth_unstable_by(mid, |a, b| {
                                a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
                            });
                        *out = box_values[mid];
                    }
                }
            });

        result.add_fill();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{GraphContext, ProcessorGraph};
    use crate::settings::Settings as S;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn constant_image_is_its_own_median() {
        let settings = S::from_str(
            r#"
[PostProcessor.img]
Kind = "constant"
Value = 3.0
Dimension = 2
XNbrBins = 8
XUp = 8.0
YNbrBins = 8
YUp = 8.0
[PostProcessor.flat]
Kind = "local_median_background"
HistName = "img"
BoxSizeX = 2
BoxSizeY = 2
SectionSizeX = 8
SectionSizeY = 8
"#,
        )
        .unwrap();
        let graph = ProcessorGraph::load(&settings, &GraphContext::new(), 1).unwrap();
        let mut event = crate::event::CassEvent::allocate(16);
        event.set_id(1);
        graph.process_event(&event, &AtomicBool::new(false));
        let out = graph.find("flat").unwrap().latest();
        assert!(out.read().unwrap().bins().iter().all(|&v| v == 3.0));
    }
}
