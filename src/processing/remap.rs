//! Time-of-flight to energy rebinning.

use std::sync::OnceLock;

use crate::event::CassEvent;
use crate::settings::Settings;

use super::result::{Axis, ResultData};
use super::{Input, Operation, ProcessorError, Wiring};

/// Area-preserving rebinning of a time-of-flight trace onto an energy axis.
///
/// The flight time of energy `E` is `t(E) = alpha / sqrt(E + e0) + t0`; the
/// time interval of each energy bin is intersected with the time bins and
/// each time bin's content is distributed proportionally to the overlap.
/// Times outside the configured range contribute nothing. A baseline,
/// averaged over the `tb1..tb2` window, is subtracted from every time bin.
pub struct TofToEnergy {
    hist_name: String,
    tof_low: f64,
    tof_up: f64,
    t0: f64,
    e0: f64,
    alpha: f64,
    nbr_bins: usize,
    tb1: f64,
    tb2: f64,
    hist: OnceLock<Input>,
    e_low: f64,
    e_up: f64,
}

impl TofToEnergy {
    /// Parses `HistName`, `TofLow`, `TofUp`, `t0`, `e0`, `alpha`,
    /// `NbrBins`, `tb1`, `tb2`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> TofToEnergy {
        TofToEnergy {
            hist_name: s.value_str("HistName", ""),
            tof_low: s.value_f64("TofLow", 0.0),
            tof_up: s.value_f64("TofUp", 1.0),
            t0: s.value_f64("t0", 0.0),
            e0: s.value_f64("e0", 0.0),
            alpha: s.value_f64("alpha", 1.0),
            nbr_bins: s.value_usize("NbrBins", 100).max(1),
            tb1: s.value_f64("tb1", 0.0),
            tb2: s.value_f64("tb2", 0.0),
            hist: OnceLock::new(),
            e_low: 0.0,
            e_up: 0.0,
        }
    }

    /// Flight time of energy `energy`.
    fn energy_to_tof(&self, energy: f64) -> f64 {
        let energy = energy.max(0.0);
        self.alpha / (energy + self.e0).sqrt() + self.t0
    }
}

impl Operation for TofToEnergy {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        if hist.template().axis_1d().is_none() {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!("input '{}' is not one dimensional", self.hist_name),
            });
        }
        if self.tof_low <= self.t0 || self.tof_up <= self.tof_low {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: "need t0 < TofLow < TofUp".to_string(),
            });
        }
        self.e_low = (self.alpha / (self.tof_up - self.t0)).powi(2) - self.e0;
        self.e_up = (self.alpha / (self.tof_low - self.t0)).powi(2) - self.e0;
        let _ = self.hist.set(hist);
        Ok(ResultData::new_1d(
            "",
            Axis::new(self.nbr_bins, self.e_low, self.e_up, "energy"),
        ))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let input = self
            .hist
            .get()
            .expect("input wired before processing")
            .result(event.id())?;
        let input = input.read().expect("result lock poisoned");
        let axis = input.axis_1d().expect("shape checked at wiring").clone();
        let tof = input.bins();
        let bin_width = axis.bin_width();

        // baseline over the configured window
        let base_lo = axis.bin_clipped(self.tb1);
        let base_up = axis.bin_clipped(self.tb2).max(base_lo);
        let offset =
            tof[base_lo..=base_up].iter().sum::<f64>() / (base_up - base_lo + 1) as f64;

        let energy_step = (self.e_up - self.e_low) / self.nbr_bins as f64;
        let clip = |t: f64| t.clamp(self.tof_low, self.tof_up);
        let out = result.bins_mut();
        for (i, out_bin) in out.iter_mut().enumerate() {
            // the energy bin maps to a time interval, higher energy first
            let t_lo = clip(self.energy_to_tof(self.e_low + energy_step * (i + 1) as f64));
            let t_up = clip(self.energy_to_tof(self.e_low + energy_step * i as f64));
            *out_bin = 0.0;
            if t_up <= t_lo {
                continue;
            }
            let k_lo = axis.bin_clipped(t_lo);
            let k_up = axis.bin_clipped(t_up);
            for k in k_lo..=k_up {
                let bin_begin = axis.position(k);
                let bin_end = bin_begin + bin_width;
                let overlap = (t_up.min(bin_end) - t_lo.max(bin_begin)).max(0.0);
                if overlap > 0.0 {
                    *out_bin += (tof[k] - offset) * overlap / bin_width;
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
    use crate::processing::Node;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// The total content over the covered time range survives the remap.
    #[test]
    fn rebinning_preserves_the_total_content() {
        let samples = [0.0, 0.0, 10.0, 20.0, 30.0, 20.0, 10.0, 0.0];
        let settings = crate::settings::Settings::from_str(
            r#"
[PostProcessor.wave]
Kind = "constant"
Value = 0.0
Dimension = 1
XNbrBins = 8
XUp = 8.0
[PostProcessor.energy]
Kind = "tof_to_energy"
HistName = "wave"
TofLow = 2.0
TofUp = 7.0
alpha = 1.0
NbrBins = 4
"#,
        )
        .unwrap();
        let graph = crate::processing::ProcessorGraph::load(
            &settings,
            &crate::processing::GraphContext::new(),
            1,
        )
        .unwrap();
        let mut event = crate::event::CassEvent::allocate(16);
        event.set_id(1);
        graph.process_event(&event, &std::sync::atomic::AtomicBool::new(false));

        let wave = graph.find("wave").unwrap();
        {
            let handle = wave.result(1).unwrap();
            handle.write().unwrap().bins_mut().copy_from_slice(&samples);
        }

        let nodes: HashMap<String, Arc<Node>> = [(String::from("wave"), wave)].into_iter().collect();
        let wiring = crate::processing::Wiring {
            nodes: &nodes,
            name: "energy",
        };
        let mut op = TofToEnergy::from_settings(
            &settings.group("PostProcessor").group("energy"),
        );
        let mut out = op.wire(&wiring).unwrap();
        op.process(&event, &mut out).unwrap();

        let active: f64 = samples[2..7].iter().sum();
        let remapped: f64 = out.bins().iter().sum();
        assert!((remapped - active).abs() < 1e-6, "remapped {remapped}");
    }
}
