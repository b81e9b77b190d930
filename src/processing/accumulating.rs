//! Operations that keep running state across events: moving averages and
//! covariance matrices.

use std::sync::OnceLock;

use crate::event::CassEvent;
use crate::settings::Settings;

use super::result::ResultData;
use super::{Input, Operation, ProcessorError, Wiring};

fn read(
    input: &OnceLock<Input>,
    id: crate::EventId,
) -> Result<super::result::ResultHandle, ProcessorError> {
    input.get().expect("input wired before processing").result(id)
}

/// Moving average of an upstream result: cumulative up to `NbrOfAverages`
/// samples, exponential with `alpha = 2/(N+1)` afterwards. The square
/// variant averages the squared values.
pub struct Average {
    hist_name: String,
    nbr_of_averages: u64,
    square: bool,
    hist: OnceLock<Input>,
}

impl Average {
    /// Parses `HistName` and `NbrOfAverages`.
    #[must_use]
    pub fn from_settings(s: &Settings, square: bool) -> Average {
        Average {
            hist_name: s.value_str("HistName", ""),
            nbr_of_averages: s.value_usize("NbrOfAverages", 1) as u64,
            square,
            hist: OnceLock::new(),
        }
    }
}

impl Operation for Average {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let template = hist.template().clone();
        let _ = self.hist.set(hist);
        Ok(template)
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let n = result.add_fill();
        let alpha = if n <= self.nbr_of_averages {
            1.0 / n as f64
        } else {
            2.0 / (self.nbr_of_averages as f64 + 1.0)
        };
        let value = |x: f64| if self.square { x * x } else { x };
        match hist.scalar() {
            Some(x) => {
                let previous = result.scalar().unwrap_or(0.0);
                let updated = previous + alpha * (value(x) - previous);
                // set_scalar resets the fill count, keep the running one
                let fills = result.fills();
                result.set_scalar(updated);
                result.set_fills(fills);
            }
            None => {
                for (avg, &x) in result.bins_mut().iter_mut().zip(hist.bins()) {
                    *avg += alpha * (value(x) - *avg);
                }
            }
        }
        Ok(())
    }

    fn accumulating(&self) -> bool {
        true
    }
}

/// Running covariance matrix of a 1-D result with itself, updated with a
/// Welford-style recurrence against the running average of the same input.
///
/// After `N` events the matrix equals the sample covariance
/// `1/(N-1) sum (x_k - mean)(x_k - mean)^T` of the inputs.
pub struct Covariance {
    hist_name: String,
    ave_name: String,
    hist: OnceLock<Input>,
    ave: OnceLock<Input>,
}

impl Covariance {
    /// Parses `HistName` and `AveHistName`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Covariance {
        Covariance {
            hist_name: s.value_str("HistName", ""),
            ave_name: s.value_str("AveHistName", ""),
            hist: OnceLock::new(),
            ave: OnceLock::new(),
        }
    }
}

impl Operation for Covariance {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone(), self.ave_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let ave = wiring.input(&self.ave_name)?;
        let axis = hist
            .template()
            .axis_1d()
            .cloned()
            .ok_or_else(|| ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!("input '{}' is not one dimensional", self.hist_name),
            })?;
        if !hist.template().same_shape(ave.template()) {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!("average '{}' does not match the input shape", self.ave_name),
            });
        }
        let _ = self.hist.set(hist);
        let _ = self.ave.set(ave);
        Ok(ResultData::new_2d("", axis.clone(), axis))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let ave = read(&self.ave, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let ave = ave.read().expect("result lock poisoned");
        let data = hist.bins();
        let mean_new = ave.bins();

        let n = result.add_fill() as f64;
        if n < 2.0 {
            return Ok(());
        }
        // the average node ran before us, so its value already includes this
        // event; recover the mean over the previous events from it
        let mean_old: Vec<f64> = mean_new
            .iter()
            .zip(data)
            .map(|(&m, &x)| m + (m - x) / (n - 1.0))
            .collect();

        let nbins = data.len();
        let out = result.bins_mut();
        for i in 0..nbins {
            let di = data[i] - mean_old[i];
            for j in 0..nbins {
                let dj = data[j] - mean_new[j];
                out[i * nbins + j] = ((n - 2.0) * out[i * nbins + j] + di * dj) / (n - 1.0);
            }
        }
        Ok(())
    }

    fn accumulating(&self) -> bool {
        true
    }
}

/// Running covariance of each bin of a 1-D result with a scalar, e.g. for
/// intensity corrections.
pub struct CovarianceWeighted {
    hist_name: String,
    ave_hist_name: String,
    scalar_name: String,
    ave_scalar_name: String,
    hist: OnceLock<Input>,
    ave_hist: OnceLock<Input>,
    scalar: OnceLock<Input>,
    ave_scalar: OnceLock<Input>,
}

impl CovarianceWeighted {
    /// Parses `HistName`, `AveHistName`, `ScalarName`, `AveScalarName`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> CovarianceWeighted {
        CovarianceWeighted {
            hist_name: s.value_str("HistName", ""),
            ave_hist_name: s.value_str("AveHistName", ""),
            scalar_name: s.value_str("ScalarName", ""),
            ave_scalar_name: s.value_str("AveScalarName", ""),
            hist: OnceLock::new(),
            ave_hist: OnceLock::new(),
            scalar: OnceLock::new(),
            ave_scalar: OnceLock::new(),
        }
    }
}

impl Operation for CovarianceWeighted {
    fn dependencies(&self) -> Vec<String> {
        vec![
            self.hist_name.clone(),
            self.ave_hist_name.clone(),
            self.scalar_name.clone(),
            self.ave_scalar_name.clone(),
        ]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let ave_hist = wiring.input(&self.ave_hist_name)?;
        let scalar = wiring.input(&self.scalar_name)?;
        let ave_scalar = wiring.input(&self.ave_scalar_name)?;
        if hist.template().axis_1d().is_none()
            || !hist.template().same_shape(ave_hist.template())
        {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: "trace inputs must be matching 1-D results".to_string(),
            });
        }
        if scalar.template().dimension() != 0 || ave_scalar.template().dimension() != 0 {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: "weight inputs must be scalars".to_string(),
            });
        }
        let template = hist.template().clone();
        let _ = self.hist.set(hist);
        let _ = self.ave_hist.set(ave_hist);
        let _ = self.scalar.set(scalar);
        let _ = self.ave_scalar.set(ave_scalar);
        Ok(template)
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let id = event.id();
        let hist = read(&self.hist, id)?;
        let ave_hist = read(&self.ave_hist, id)?;
        let scalar = read(&self.scalar, id)?;
        let ave_scalar = read(&self.ave_scalar, id)?;
        let hist = hist.read().expect("result lock poisoned");
        let ave_hist = ave_hist.read().expect("result lock poisoned");
        let y = scalar
            .read()
            .expect("result lock poisoned")
            .scalar()
            .unwrap_or(0.0);
        let y_mean_new = ave_scalar
            .read()
            .expect("result lock poisoned")
            .scalar()
            .unwrap_or(0.0);

        let n = result.add_fill() as f64;
        if n < 2.0 {
            return Ok(());
        }
        let y_mean_old = y_mean_new + (y_mean_new - y) / (n - 1.0);
        let dy = y - y_mean_old;
        let data = hist.bins();
        let mean_new = ave_hist.bins();
        for ((out, &x), &m) in result.bins_mut().iter_mut().zip(data).zip(mean_new) {
            let dx = x - m;
            *out = ((n - 2.0) * *out + dx * dy) / (n - 1.0);
        }
        Ok(())
    }

    fn accumulating(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{GraphContext, ProcessorGraph};
    use crate::settings::Settings as S;
    use std::sync::atomic::AtomicBool;

    fn run(toml: &str, events: u64) -> ProcessorGraph {
        let settings = S::from_str(toml).unwrap();
        let graph = ProcessorGraph::load(&settings, &GraphContext::new(), 2).unwrap();
        let shutdown = AtomicBool::new(false);
        for id in 1..=events {
            let mut event = crate::event::CassEvent::allocate(16);
            event.set_id(id);
            graph.process_event(&event, &shutdown);
            graph.release_event(id);
        }
        graph
    }

    #[test]
    fn cumulative_average_of_a_counter_is_the_midpoint() {
        let graph = run(
            r#"
[PostProcessor.count]
Kind = "counter"
[PostProcessor.avg]
Kind = "average"
HistName = "count"
NbrOfAverages = 100
"#,
            5,
        );
        // mean of 1..=5
        let avg = graph.find("avg").unwrap().latest();
        assert!((avg.read().unwrap().scalar().unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn square_average_averages_squares() {
        let graph = run(
            r#"
[PostProcessor.count]
Kind = "counter"
[PostProcessor.sq]
Kind = "square_average"
HistName = "count"
NbrOfAverages = 100
"#,
            3,
        );
        // mean of 1, 4, 9
        let avg = graph.find("sq").unwrap().latest();
        assert!((avg.read().unwrap().scalar().unwrap() - 14.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn covariance_of_a_deterministic_sequence() {
        // the 1-bin "wave" is the event counter itself; covariance of the
        // sequence 1..=4 with itself is its sample variance 5/3
        let graph = run(
            r#"
[PostProcessor.count]
Kind = "counter"
[PostProcessor.wave]
Kind = "history"
HistName = "count"
Size = 1
[PostProcessor.wave_ave]
Kind = "average"
HistName = "wave"
NbrOfAverages = 1000
[PostProcessor.cov]
Kind = "covariance"
HistName = "wave"
AveHistName = "wave_ave"
"#,
            4,
        );
        let cov = graph.find("cov").unwrap().latest();
        let cov = cov.read().unwrap();
        let sample_variance = 5.0 / 3.0;
        assert!((cov.bins()[0] - sample_variance).abs() < 1e-9);
    }
}
