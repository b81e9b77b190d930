//! Histogram-shaped operations: projections, integrals, scatter and outer
//! products, subsets, per-bin statistics and 1-D curve measures.

use std::sync::{Mutex, OnceLock};

use crate::event::CassEvent;
use crate::settings::Settings;

use super::result::{Axis, ResultData};
use super::{Input, Operation, ProcessorError, Wiring};

fn read(input: &OnceLock<Input>, id: crate::EventId) -> Result<super::result::ResultHandle, ProcessorError> {
    input.get().expect("input wired before processing").result(id)
}

fn require_1d(wiring: &Wiring, input: &Input) -> Result<Axis, ProcessorError> {
    input
        .template()
        .axis_1d()
        .cloned()
        .ok_or_else(|| ProcessorError::ShapeMismatch {
            name: wiring.node_name().to_string(),
            reason: format!("input '{}' is not one dimensional", input.name()),
        })
}

fn require_2d(wiring: &Wiring, input: &Input) -> Result<(Axis, Axis), ProcessorError> {
    input
        .template()
        .axes_2d()
        .map(|(x, y)| (x.clone(), y.clone()))
        .ok_or_else(|| ProcessorError::ShapeMismatch {
            name: wiring.node_name().to_string(),
            reason: format!("input '{}' is not two dimensional", input.name()),
        })
}

/// The axis a 2-D result is projected onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionAxis {
    /// Collapse rows, keep columns.
    X,
    /// Collapse columns, keep rows.
    Y,
}

impl ProjectionAxis {
    fn from_settings(s: &Settings) -> ProjectionAxis {
        match s.value_str("Axis", "x").to_lowercase().as_str() {
            "y" | "1" => ProjectionAxis::Y,
            _ => ProjectionAxis::X,
        }
    }
}

/// Projection of a 2-D result onto one axis over a restricted range in the
/// other axis. The range is clipped to the axis bounds.
pub struct Projection {
    hist_name: String,
    axis: ProjectionAxis,
    low: f64,
    up: f64,
    hist: OnceLock<Input>,
}

impl Projection {
    /// Parses `HistName`, `Axis`, `LowerBound`, `UpperBound`.
    pub fn from_settings(_name: &str, s: &Settings) -> Result<Projection, ProcessorError> {
        Ok(Projection {
            hist_name: s.value_str("HistName", ""),
            axis: ProjectionAxis::from_settings(s),
            low: s.value_f64("LowerBound", -1e6),
            up: s.value_f64("UpperBound", 1e6),
            hist: OnceLock::new(),
        })
    }
}

impl Operation for Projection {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let (x, y) = require_2d(wiring, &hist)?;
        let axis = match self.axis {
            ProjectionAxis::X => x,
            ProjectionAxis::Y => y,
        };
        let _ = self.hist.set(hist);
        Ok(ResultData::new_1d("", axis))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let (x, y) = hist.axes_2d().expect("shape checked at wiring");
        let bins = hist.bins();
        let out = result.bins_mut();
        match self.axis {
            ProjectionAxis::X => {
                let row_lo = y.bin_clipped(self.low);
                let row_up = y.bin_clipped(self.up);
                for row in row_lo..=row_up {
                    for (col, out_bin) in out.iter_mut().enumerate() {
                        *out_bin += bins[row * x.nbins + col];
                    }
                }
            }
            ProjectionAxis::Y => {
                let col_lo = x.bin_clipped(self.low);
                let col_up = x.bin_clipped(self.up);
                for (row, out_bin) in out.iter_mut().enumerate() {
                    for col in col_lo..=col_up {
                        *out_bin += bins[row * x.nbins + col];
                    }
                }
            }
        }
        result.add_fill();
        Ok(())
    }
}

/// Projection averaging only cells different from an exclusion value.
pub struct WeightedProjection {
    hist_name: String,
    axis: ProjectionAxis,
    low: f64,
    up: f64,
    exclusion: f64,
    hist: OnceLock<Input>,
}

impl WeightedProjection {
    /// Parses `HistName`, `Axis`, `LowerBound`, `UpperBound`,
    /// `ExclusionValue`.
    pub fn from_settings(_name: &str, s: &Settings) -> Result<WeightedProjection, ProcessorError> {
        Ok(WeightedProjection {
            hist_name: s.value_str("HistName", ""),
            axis: ProjectionAxis::from_settings(s),
            low: s.value_f64("LowerBound", -1e6),
            up: s.value_f64("UpperBound", 1e6),
            exclusion: s.value_f64("ExclusionValue", 0.0),
            hist: OnceLock::new(),
        })
    }
}

impl Operation for WeightedProjection {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let (x, y) = require_2d(wiring, &hist)?;
        let axis = match self.axis {
            ProjectionAxis::X => x,
            ProjectionAxis::Y => y,
        };
        let _ = self.hist.set(hist);
        Ok(ResultData::new_1d("", axis))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let (x, y) = hist.axes_2d().expect("shape checked at wiring");
        let bins = hist.bins();
        let nbins = result.bins().len();
        let mut sums = vec![0.0; nbins];
        let mut counts = vec![0usize; nbins];
        match self.axis {
            ProjectionAxis::X => {
                let row_lo = y.bin_clipped(self.low);
                let row_up = y.bin_clipped(self.up);
                for row in row_lo..=row_up {
                    for col in 0..x.nbins {
                        let v = bins[row * x.nbins + col];
                        if v != self.exclusion {
                            sums[col] += v;
                            counts[col] += 1;
                        }
                    }
                }
            }
            ProjectionAxis::Y => {
                let col_lo = x.bin_clipped(self.low);
                let col_up = x.bin_clipped(self.up);
                for row in 0..y.nbins {
                    for col in col_lo..=col_up {
                        let v = bins[row * x.nbins + col];
                        if v != self.exclusion {
                            sums[row] += v;
                            counts[row] += 1;
                        }
                    }
                }
            }
        }
        for ((out, sum), count) in result.bins_mut().iter_mut().zip(sums).zip(counts) {
            *out = if count > 0 { sum / count as f64 } else { 0.0 };
        }
        result.add_fill();
        Ok(())
    }
}

/// Sum of a 1-D result over a position range, clipped to the axis bounds.
pub struct Integral {
    hist_name: String,
    low: f64,
    up: f64,
    hist: OnceLock<Input>,
}

impl Integral {
    /// Parses `HistName`, `LowerBound`, `UpperBound`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Integral {
        Integral {
            hist_name: s.value_str("HistName", ""),
            low: s.value_f64("LowerBound", -1e6),
            up: s.value_f64("UpperBound", 1e6),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for Integral {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        require_1d(wiring, &hist)?;
        let _ = self.hist.set(hist);
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let axis = hist.axis_1d().expect("shape checked at wiring");
        let lo = axis.bin_clipped(self.low);
        let up = axis.bin_clipped(self.up);
        let sum: f64 = hist.bins()[lo..=up].iter().sum();
        result.set_scalar(sum);
        Ok(())
    }
}

/// Average of a 2-D result over rings around a configured center.
pub struct RadialAverage {
    hist_name: String,
    center: (f64, f64),
    hist: OnceLock<Input>,
    radius: usize,
}

impl RadialAverage {
    /// Parses `HistName`, `XCenter`, `YCenter`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> RadialAverage {
        RadialAverage {
            hist_name: s.value_str("HistName", ""),
            center: (s.value_f64("XCenter", 512.0), s.value_f64("YCenter", 512.0)),
            hist: OnceLock::new(),
            radius: 0,
        }
    }
}

impl Operation for RadialAverage {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let (x, y) = require_2d(wiring, &hist)?;
        let xc = self.center.0 as usize;
        let yc = self.center.1 as usize;
        if xc >= x.nbins || yc >= y.nbins {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!("center ({xc}, {yc}) lies outside the image"),
            });
        }
        // the largest ring fully contained in the image
        self.radius = [xc, x.nbins - xc - 1, yc, y.nbins - yc - 1]
            .into_iter()
            .min()
            .unwrap_or(0)
            .max(1);
        let _ = self.hist.set(hist);
        Ok(ResultData::new_1d(
            "",
            Axis::new(self.radius, 0.0, self.radius as f64, "radius"),
        ))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let (x, _) = hist.axes_2d().expect("shape checked at wiring");
        let bins = hist.bins();
        let nbins = result.bins().len();
        let mut sums = vec![0.0; nbins];
        let mut counts = vec![0usize; nbins];
        let (xc, yc) = (self.center.0, self.center.1);
        for (idx, &v) in bins.iter().enumerate() {
            let col = (idx % x.nbins) as f64;
            let row = (idx / x.nbins) as f64;
            let r = ((col - xc).powi(2) + (row - yc).powi(2)).sqrt() as usize;
            if r < nbins {
                sums[r] += v;
                counts[r] += 1;
            }
        }
        for ((out, sum), count) in result.bins_mut().iter_mut().zip(sums).zip(counts) {
            *out = if count > 0 { sum / count as f64 } else { 0.0 };
        }
        result.add_fill();
        Ok(())
    }
}

/// Rotates the latest scalar values into a fixed-length ring.
pub struct History {
    hist_name: String,
    size: usize,
    hist: OnceLock<Input>,
}

impl History {
    /// Parses `HistName` and `Size`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> History {
        History {
            hist_name: s.value_str("HistName", ""),
            size: s.value_usize("Size", 100).max(1),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for History {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        if hist.template().dimension() != 0 {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!("input '{}' is not a scalar", self.hist_name),
            });
        }
        let _ = self.hist.set(hist);
        Ok(ResultData::new_1d(
            "",
            Axis::new(self.size, 0.0, self.size as f64, "event"),
        ))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let value = hist
            .read()
            .expect("result lock poisoned")
            .scalar()
            .unwrap_or(0.0);
        let bins = result.bins_mut();
        bins.rotate_left(1);
        if let Some(last) = bins.last_mut() {
            *last = value;
        }
        result.add_fill();
        Ok(())
    }

    fn accumulating(&self) -> bool {
        true
    }
}

/// Accumulating 2-D scatter of two scalars with weight one.
pub struct Scatter {
    x_name: String,
    y_name: String,
    x_axis: Axis,
    y_axis: Axis,
    x: OnceLock<Input>,
    y: OnceLock<Input>,
}

impl Scatter {
    /// Parses `XName`, `YName` and the axis keys.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Scatter {
        Scatter {
            x_name: s.value_str("XName", ""),
            y_name: s.value_str("YName", ""),
            x_axis: super::axis_from_settings(s, "X", 100),
            y_axis: super::axis_from_settings(s, "Y", 100),
            x: OnceLock::new(),
            y: OnceLock::new(),
        }
    }
}

impl Operation for Scatter {
    fn dependencies(&self) -> Vec<String> {
        vec![self.x_name.clone(), self.y_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let x = wiring.input(&self.x_name)?;
        let y = wiring.input(&self.y_name)?;
        if x.template().dimension() != 0 || y.template().dimension() != 0 {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: "scatter inputs must be scalars".to_string(),
            });
        }
        let _ = self.x.set(x);
        let _ = self.y.set(y);
        Ok(ResultData::new_2d(
            "",
            self.x_axis.clone(),
            self.y_axis.clone(),
        ))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let x = read(&self.x, event.id())?;
        let y = read(&self.y, event.id())?;
        let xv = x.read().expect("result lock poisoned").scalar().unwrap_or(0.0);
        let yv = y.read().expect("result lock poisoned").scalar().unwrap_or(0.0);
        result.fill_2d(xv, yv, 1.0);
        result.add_fill();
        Ok(())
    }

    fn accumulating(&self) -> bool {
        true
    }
}

/// Outer product of two 1-D results.
pub struct Cross {
    one_name: String,
    two_name: String,
    one: OnceLock<Input>,
    two: OnceLock<Input>,
}

impl Cross {
    /// Parses `HistOne` and `HistTwo`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Cross {
        Cross {
            one_name: s.value_str("HistOne", ""),
            two_name: s.value_str("HistTwo", ""),
            one: OnceLock::new(),
            two: OnceLock::new(),
        }
    }
}

impl Operation for Cross {
    fn dependencies(&self) -> Vec<String> {
        vec![self.one_name.clone(), self.two_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let one = wiring.input(&self.one_name)?;
        let two = wiring.input(&self.two_name)?;
        let x = require_1d(wiring, &one)?;
        let y = require_1d(wiring, &two)?;
        let _ = self.one.set(one);
        let _ = self.two.set(two);
        Ok(ResultData::new_2d("", x, y))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let one = read(&self.one, event.id())?;
        let two = read(&self.two, event.id())?;
        let one = one.read().expect("result lock poisoned");
        let two = two.read().expect("result lock poisoned");
        let h1 = one.bins();
        let h2 = two.bins();
        let n = h1.len();
        let out = result.bins_mut();
        for (j, &b) in h2.iter().enumerate() {
            for (i, &a) in h1.iter().enumerate() {
                out[j * n + i] = a * b;
            }
        }
        result.add_fill();
        Ok(())
    }
}

/// Accumulating 1-D fill of a scalar position with a scalar weight; weights
/// and counts live in two parallel bin blocks.
pub struct WeightedHist1D {
    x_name: String,
    weight_name: String,
    axis: Axis,
    x: OnceLock<Input>,
    weight: OnceLock<Input>,
}

impl WeightedHist1D {
    /// Parses `XName`, `WeightName` and the axis keys.
    #[must_use]
    pub fn from_settings(s: &Settings) -> WeightedHist1D {
        WeightedHist1D {
            x_name: s.value_str("XName", ""),
            weight_name: s.value_str("WeightName", ""),
            axis: super::axis_from_settings(s, "X", 100),
            x: OnceLock::new(),
            weight: OnceLock::new(),
        }
    }
}

impl Operation for WeightedHist1D {
    fn dependencies(&self) -> Vec<String> {
        vec![self.x_name.clone(), self.weight_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let x = wiring.input(&self.x_name)?;
        let weight = wiring.input(&self.weight_name)?;
        if x.template().dimension() != 0 || weight.template().dimension() != 0 {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: "weighted fill inputs must be scalars".to_string(),
            });
        }
        let _ = self.x.set(x);
        let _ = self.weight.set(weight);
        // twice the bins: the upper block counts the fills per bin
        Ok(ResultData::new_1d(
            "",
            Axis::new(self.axis.nbins * 2, self.axis.low, self.axis.up, &*self.axis.title),
        ))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let x = read(&self.x, event.id())?;
        let weight = read(&self.weight, event.id())?;
        let xv = x.read().expect("result lock poisoned").scalar().unwrap_or(0.0);
        let wv = weight
            .read()
            .expect("result lock poisoned")
            .scalar()
            .unwrap_or(0.0);
        if let Some(bin) = self.axis.bin(xv) {
            let n = self.axis.nbins;
            let bins = result.bins_mut();
            bins[bin] += wv;
            bins[n + bin] += 1.0;
        }
        result.add_fill();
        Ok(())
    }

    fn accumulating(&self) -> bool {
        true
    }
}

/// A user-ranged subset of a 1-D or 2-D result.
pub struct Subset {
    hist_name: String,
    x_low: f64,
    x_up: f64,
    y_low: f64,
    y_up: f64,
    hist: OnceLock<Input>,
    x_bins: (usize, usize),
    y_bins: (usize, usize),
}

impl Subset {
    /// Parses `HistName` and the `XLow`/`XUp` (`YLow`/`YUp`) range keys.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Subset {
        Subset {
            hist_name: s.value_str("HistName", ""),
            x_low: s.value_f64("XLow", 0.0),
            x_up: s.value_f64("XUp", 1.0),
            y_low: s.value_f64("YLow", 0.0),
            y_up: s.value_f64("YUp", 1.0),
            hist: OnceLock::new(),
            x_bins: (0, 0),
            y_bins: (0, 0),
        }
    }

    fn sub_axis(axis: &Axis, low: f64, up: f64) -> (Axis, (usize, usize)) {
        let lo = axis.bin_clipped(low);
        let up = axis.bin_clipped(up).max(lo);
        let sub = Axis::new(
            up - lo + 1,
            axis.position(lo),
            axis.position(up + 1),
            &*axis.title,
        );
        (sub, (lo, up))
    }
}

impl Operation for Subset {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let template = match (hist.template().axis_1d(), hist.template().axes_2d()) {
            (Some(axis), _) => {
                let (sub, bins) = Subset::sub_axis(axis, self.x_low, self.x_up);
                self.x_bins = bins;
                ResultData::new_1d("", sub)
            }
            (None, Some((x, y))) => {
                let (sub_x, x_bins) = Subset::sub_axis(x, self.x_low, self.x_up);
                let (sub_y, y_bins) = Subset::sub_axis(y, self.y_low, self.y_up);
                self.x_bins = x_bins;
                self.y_bins = y_bins;
                ResultData::new_2d("", sub_x, sub_y)
            }
            _ => {
                return Err(ProcessorError::ShapeMismatch {
                    name: wiring.node_name().to_string(),
                    reason: format!("input '{}' is a scalar", self.hist_name),
                })
            }
        };
        let _ = self.hist.set(hist);
        Ok(template)
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        match hist.axes_2d() {
            None => {
                let bins = hist.bins();
                let (lo, up) = self.x_bins;
                result.bins_mut().copy_from_slice(&bins[lo..=up]);
            }
            Some((x, _)) => {
                let bins = hist.bins();
                let (x_lo, x_up) = self.x_bins;
                let (y_lo, y_up) = self.y_bins;
                let width = x_up - x_lo + 1;
                let out = result.bins_mut();
                for (row_idx, row) in (y_lo..=y_up).enumerate() {
                    let src = row * x.nbins + x_lo;
                    out[row_idx * width..(row_idx + 1) * width]
                        .copy_from_slice(&bins[src..src + width]);
                }
            }
        }
        result.add_fill();
        Ok(())
    }
}

/// Which axis property an [`AxisParameter`] node reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisProperty {
    /// Number of bins.
    NBins,
    /// Lower limit.
    Low,
    /// Upper limit.
    Up,
}

/// Reports one axis property of an upstream result as a scalar.
pub struct AxisParameter {
    hist_name: String,
    axis: ProjectionAxis,
    property: AxisProperty,
    hist: OnceLock<Input>,
}

impl AxisParameter {
    /// Parses `HistName`, `Axis` and `Parameter` (nbins/low/up).
    pub fn from_settings(name: &str, s: &Settings) -> Result<AxisParameter, ProcessorError> {
        let property = match s.value_str("Parameter", "nbins").as_str() {
            "nbins" => AxisProperty::NBins,
            "low" => AxisProperty::Low,
            "up" => AxisProperty::Up,
            other => {
                return Err(ProcessorError::ShapeMismatch {
                    name: name.to_string(),
                    reason: format!("unknown axis parameter '{other}'"),
                })
            }
        };
        Ok(AxisParameter {
            hist_name: s.value_str("HistName", ""),
            axis: ProjectionAxis::from_settings(s),
            property,
            hist: OnceLock::new(),
        })
    }
}

impl Operation for AxisParameter {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        if hist.template().dimension() == 0 {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!("input '{}' has no axes", self.hist_name),
            });
        }
        let _ = self.hist.set(hist);
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let axis = match (hist.axis_1d(), hist.axes_2d(), self.axis) {
            (Some(axis), _, _) => axis.clone(),
            (None, Some((x, _)), ProjectionAxis::X) => x.clone(),
            (None, Some((_, y)), ProjectionAxis::Y) => y.clone(),
            _ => {
                return Err(ProcessorError::InvalidData {
                    name: result.name().to_string(),
                    reason: "input lost its axes".to_string(),
                })
            }
        };
        result.set_scalar(match self.property {
            AxisProperty::NBins => axis.nbins as f64,
            AxisProperty::Low => axis.low,
            AxisProperty::Up => axis.up,
        });
        Ok(())
    }
}

/// Minimum or maximum over all bins.
pub struct Extremum {
    hist_name: String,
    take_max: bool,
    hist: OnceLock<Input>,
}

impl Extremum {
    /// The minimum variant.
    #[must_use]
    pub fn minimum(s: &Settings) -> Extremum {
        Extremum {
            hist_name: s.value_str("HistName", ""),
            take_max: false,
            hist: OnceLock::new(),
        }
    }

    /// The maximum variant.
    #[must_use]
    pub fn maximum(s: &Settings) -> Extremum {
        Extremum {
            hist_name: s.value_str("HistName", ""),
            take_max: true,
            hist: OnceLock::new(),
        }
    }
}

impl Operation for Extremum {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let _ = self.hist.set(wiring.input(&self.hist_name)?);
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let iter = hist.bins().iter().copied();
        let value = if self.take_max {
            iter.fold(f64::NEG_INFINITY, f64::max)
        } else {
            iter.fold(f64::INFINITY, f64::min)
        };
        result.set_scalar(value);
        Ok(())
    }
}

/// Which reduction a [`Statistics`] node applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    /// Sum over all bins.
    Sum,
    /// Mean over all bins.
    Mean,
    /// Standard deviation over all bins.
    StdDev,
    /// Variance over all bins.
    Variance,
}

/// Reduction of all bins to one scalar.
pub struct Statistics {
    hist_name: String,
    statistic: Statistic,
    hist: OnceLock<Input>,
}

impl Statistics {
    /// Parses `HistName` and `Statistic` (sum/mean/stddev/variance).
    pub fn from_settings(name: &str, s: &Settings) -> Result<Statistics, ProcessorError> {
        let statistic = match s.value_str("Statistic", "sum").as_str() {
            "sum" => Statistic::Sum,
            "mean" => Statistic::Mean,
            "stddev" => Statistic::StdDev,
            "variance" => Statistic::Variance,
            other => {
                return Err(ProcessorError::ShapeMismatch {
                    name: name.to_string(),
                    reason: format!("unknown statistic '{other}'"),
                })
            }
        };
        Ok(Statistics {
            hist_name: s.value_str("HistName", ""),
            statistic,
            hist: OnceLock::new(),
        })
    }
}

impl Operation for Statistics {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let _ = self.hist.set(wiring.input(&self.hist_name)?);
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let bins = hist.bins();
        let n = bins.len() as f64;
        let sum: f64 = bins.iter().sum();
        let value = match self.statistic {
            Statistic::Sum => sum,
            Statistic::Mean => {
                if n > 0.0 {
                    sum / n
                } else {
                    0.0
                }
            }
            Statistic::StdDev | Statistic::Variance => {
                if n > 1.0 {
                    let mean = sum / n;
                    let variance =
                        bins.iter().map(|&b| (b - mean) * (b - mean)).sum::<f64>() / (n - 1.0);
                    if self.statistic == Statistic::Variance {
                        variance
                    } else {
                        variance.sqrt()
                    }
                } else {
                    0.0
                }
            }
        };
        result.set_scalar(value);
        Ok(())
    }
}

fn range_bins(axis: &Axis, low: f64, up: f64) -> (usize, usize) {
    let lo = axis.bin_clipped(low);
    let up = axis.bin_clipped(up).max(lo);
    (lo, up)
}

/// Width of a 1-D peak at a fraction of its maximum, within a range.
pub struct WidthAtFraction {
    hist_name: String,
    low: f64,
    up: f64,
    fraction: f64,
    hist: OnceLock<Input>,
}

impl WidthAtFraction {
    /// Parses `HistName`, `XLow`, `XUp`, `Fraction` (default 0.5).
    #[must_use]
    pub fn from_settings(s: &Settings) -> WidthAtFraction {
        WidthAtFraction {
            hist_name: s.value_str("HistName", ""),
            low: s.value_f64("XLow", -1e6),
            up: s.value_f64("XUp", 1e6),
            fraction: s.value_f64("Fraction", 0.5),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for WidthAtFraction {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        require_1d(wiring, &hist)?;
        let _ = self.hist.set(hist);
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let axis = hist.axis_1d().expect("shape checked at wiring");
        let bins = hist.bins();
        let (lo, up) = range_bins(axis, self.low, self.up);

        let (max_bin, max_val) = bins[lo..=up]
            .iter()
            .enumerate()
            .fold((lo, f64::NEG_INFINITY), |acc, (i, &v)| {
                if v > acc.1 {
                    (lo + i, v)
                } else {
                    acc
                }
            });
        let level = self.fraction * max_val;

        // walk outwards from the maximum to the crossings, interpolating
        let mut left = axis.position(lo);
        for bin in (lo..=max_bin).rev() {
            if bins[bin] < level {
                let span = bins[bin + 1] - bins[bin];
                let frac = if span != 0.0 { (level - bins[bin]) / span } else { 0.0 };
                left = axis.center(bin) + frac * axis.bin_width();
                break;
            }
        }
        let mut right = axis.position(up + 1);
        for bin in max_bin..=up {
            if bins[bin] < level {
                let span = bins[bin - 1] - bins[bin];
                let frac = if span != 0.0 { (level - bins[bin]) / span } else { 0.0 };
                right = axis.center(bin) - frac * axis.bin_width();
                break;
            }
        }
        result.set_scalar(right - left);
        Ok(())
    }
}

/// Position where a 1-D curve first exceeds a fraction of its maximum.
pub struct StepPosition {
    hist_name: String,
    low: f64,
    up: f64,
    fraction: f64,
    hist: OnceLock<Input>,
}

impl StepPosition {
    /// Parses `HistName`, `XLow`, `XUp`, `Fraction` (default 0.5).
    #[must_use]
    pub fn from_settings(s: &Settings) -> StepPosition {
        StepPosition {
            hist_name: s.value_str("HistName", ""),
            low: s.value_f64("XLow", -1e6),
            up: s.value_f64("XUp", 1e6),
            fraction: s.value_f64("Fraction", 0.5),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for StepPosition {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        require_1d(wiring, &hist)?;
        let _ = self.hist.set(hist);
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let axis = hist.axis_1d().expect("shape checked at wiring");
        let bins = hist.bins();
        let (lo, up) = range_bins(axis, self.low, self.up);
        let max_val = bins[lo..=up].iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let level = self.fraction * max_val;
        let position = (lo..=up)
            .find(|&bin| bins[bin] > level)
            .map_or(axis.position(lo), |bin| axis.center(bin));
        result.set_scalar(position);
        Ok(())
    }
}

/// Intensity-weighted mean position over a range of a 1-D result.
pub struct CenterOfMass {
    hist_name: String,
    low: f64,
    up: f64,
    hist: OnceLock<Input>,
}

impl CenterOfMass {
    /// Parses `HistName`, `XLow`, `XUp`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> CenterOfMass {
        CenterOfMass {
            hist_name: s.value_str("HistName", ""),
            low: s.value_f64("XLow", -1e6),
            up: s.value_f64("XUp", 1e6),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for CenterOfMass {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        require_1d(wiring, &hist)?;
        let _ = self.hist.set(hist);
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let axis = hist.axis_1d().expect("shape checked at wiring");
        let bins = hist.bins();
        let (lo, up) = range_bins(axis, self.low, self.up);
        let mut integral = 0.0;
        let mut weight = 0.0;
        for bin in lo..=up {
            integral += bins[bin];
            weight += bins[bin] * axis.center(bin);
        }
        result.set_scalar(if integral != 0.0 { weight / integral } else { 0.0 });
        Ok(())
    }
}

/// Geometric rebinning of a 2-D result by integer factors.
pub struct Rebin {
    hist_name: String,
    x_factor: usize,
    y_factor: usize,
    hist: OnceLock<Input>,
}

impl Rebin {
    /// Parses `HistName`, `XFactor`, `YFactor`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Rebin {
        Rebin {
            hist_name: s.value_str("HistName", ""),
            x_factor: s.value_usize("XFactor", 1).max(1),
            y_factor: s.value_usize("YFactor", 1).max(1),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for Rebin {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let (x, y) = require_2d(wiring, &hist)?;
        let nx = (x.nbins / self.x_factor).max(1);
        let ny = (y.nbins / self.y_factor).max(1);
        let _ = self.hist.set(hist);
        Ok(ResultData::new_2d(
            "",
            Axis::new(nx, x.low, x.up, &*x.title),
            Axis::new(ny, y.low, y.up, &*y.title),
        ))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let (x, _) = hist.axes_2d().expect("shape checked at wiring");
        let bins = hist.bins();
        let (out_x, _) = result.axes_2d().expect("shape fixed at wiring");
        let nx = out_x.nbins;
        let out = result.bins_mut();
        out.iter_mut().for_each(|b| *b = 0.0);
        for (out_row, row_chunk) in out.chunks_mut(nx).enumerate() {
            for sub_row in 0..self.y_factor {
                let row = out_row * self.y_factor + sub_row;
                for (out_col, out_bin) in row_chunk.iter_mut().enumerate() {
                    for sub_col in 0..self.x_factor {
                        let col = out_col * self.x_factor + sub_col;
                        *out_bin += bins[row * x.nbins + col];
                    }
                }
            }
        }
        result.add_fill();
        Ok(())
    }
}

/// Hands out the upstream result of the previous event.
pub struct Previous {
    hist_name: String,
    stored: Mutex<Option<ResultData>>,
    hist: OnceLock<Input>,
}

impl Previous {
    /// Parses `HistName`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Previous {
        Previous {
            hist_name: s.value_str("HistName", ""),
            stored: Mutex::new(None),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for Previous {
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
        let current = hist.read().expect("result lock poisoned").clone();
        let mut stored = self.stored.lock().expect("state lock poisoned");
        if let Some(previous) = stored.replace(current) {
            let name = result.name().to_string();
            let id = result.event_id();
            *result = previous;
            result.set_name(name);
            result.set_event_id(id);
        }
        Ok(())
    }
}

/// Which response an [`IirFilter`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// `y[n] = a (y[n-1] + x[n] - x[n-1])`, `a = RC/(RC+dt)`.
    HighPass,
    /// `y[n] = y[n-1] + a (x[n] - y[n-1])`, `a = dt/(RC+dt)`.
    LowPass,
}

/// Single-pole IIR filter over a 1-D result, with `RC = 1/(2 pi cutoff)`
/// and `dt` taken from the input axis binning.
pub struct IirFilter {
    hist_name: String,
    kind: FilterKind,
    cutoff: f64,
    hist: OnceLock<Input>,
}

impl IirFilter {
    /// Parses `HistName`, `FilterType` (highpass/lowpass), `Cutoff`.
    pub fn from_settings(name: &str, s: &Settings) -> Result<IirFilter, ProcessorError> {
        let kind = match s.value_str("FilterType", "lowpass").as_str() {
            "lowpass" => FilterKind::LowPass,
            "highpass" => FilterKind::HighPass,
            other => {
                return Err(ProcessorError::ShapeMismatch {
                    name: name.to_string(),
                    reason: format!("unknown filter type '{other}'"),
                })
            }
        };
        Ok(IirFilter {
            hist_name: s.value_str("HistName", ""),
            kind,
            cutoff: s.value_f64("Cutoff", 1.0),
            hist: OnceLock::new(),
        })
    }
}

impl Operation for IirFilter {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let axis = require_1d(wiring, &hist)?;
        let _ = self.hist.set(hist);
        Ok(ResultData::new_1d("", axis))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let axis = hist.axis_1d().expect("shape checked at wiring");
        let x = hist.bins();
        let dt = axis.bin_width();
        let rc = 1.0 / (2.0 * std::f64::consts::PI * self.cutoff);
        let out = result.bins_mut();
        if x.is_empty() {
            return Ok(());
        }
        out[0] = x[0];
        match self.kind {
            FilterKind::HighPass => {
                let alpha = rc / (rc + dt);
                for n in 1..x.len() {
                    out[n] = alpha * (out[n - 1] + x[n] - x[n - 1]);
                }
            }
            FilterKind::LowPass => {
                let alpha = dt / (rc + dt);
                for n in 1..x.len() {
                    out[n] = out[n - 1] + alpha * (x[n] - out[n - 1]);
                }
            }
        }
        result.add_fill();
        Ok(())
    }
}

/// Table of local minima of a 1-D result: bins smaller than every
/// neighbour within a radius and not NaN.
pub struct LocalMinima1D {
    hist_name: String,
    radius: usize,
    hist: OnceLock<Input>,
}

/// Column order of the local-minima table.
#[allow(missing_docs)]
pub mod minima_columns {
    pub const INDEX: usize = 0;
    pub const POSITION: usize = 1;
    pub const VALUE: usize = 2;
    pub const NBR_OF: usize = 3;
}

impl LocalMinima1D {
    /// Parses `HistName` and `Radius`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> LocalMinima1D {
        LocalMinima1D {
            hist_name: s.value_str("HistName", ""),
            radius: s.value_usize("Radius", 10).max(1),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for LocalMinima1D {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        require_1d(wiring, &hist)?;
        let _ = self.hist.set(hist);
        Ok(ResultData::new_table("", minima_columns::NBR_OF))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let axis = hist.axis_1d().expect("shape checked at wiring");
        let bins = hist.bins();
        result.clear();
        result.set_event_id(event.id());
        for bin in self.radius..bins.len().saturating_sub(self.radius) {
            let candidate = bins[bin];
            if candidate.is_nan() {
                continue;
            }
            let is_minimum = (bin - self.radius..=bin + self.radius)
                .filter(|&other| other != bin)
                .all(|other| candidate < bins[other]);
            if is_minimum {
                result.append_row(&[bin as f64, axis.center(bin), candidate]);
            }
        }
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

    /// Builds a graph whose leaf is a constant 2-D image filled via
    /// `constant`, then applies the operation under test.
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

    fn scalar_of(graph: &ProcessorGraph, name: &str) -> f64 {
        graph.find(name).unwrap().latest().read().unwrap().scalar().unwrap()
    }

    #[test]
    fn projection_collapses_the_other_axis() {
        let graph = run(
            r#"
[PostProcessor.img]
Kind = "constant"
Value = 2.0
Dimension = 2
XNbrBins = 3
XUp = 3.0
YNbrBins = 4
YUp = 4.0
[PostProcessor.proj]
Kind = "projection"
HistName = "img"
Axis = "x"
"#,
            1,
        );
        let result = graph.find("proj").unwrap().latest();
        let result = result.read().unwrap();
        // 4 rows of 2.0 collapse onto each of the 3 columns
        assert_eq!(result.bins(), &[8.0, 8.0, 8.0]);
    }

    #[test]
    fn integral_clips_to_axis_bounds() {
        let graph = run(
            r#"
[PostProcessor.wave]
Kind = "constant"
Value = 1.5
Dimension = 1
XNbrBins = 4
XUp = 4.0
[PostProcessor.area]
Kind = "integral"
HistName = "wave"
LowerBound = -100.0
UpperBound = 100.0
"#,
            1,
        );
        assert_eq!(scalar_of(&graph, "area"), 6.0);
    }

    #[test]
    fn history_rotates_values_in() {
        let graph = run(
            r#"
[PostProcessor.count]
Kind = "counter"
[PostProcessor.trend]
Kind = "history"
HistName = "count"
Size = 3
"#,
            5,
        );
        let result = graph.find("trend").unwrap().latest();
        assert_eq!(result.read().unwrap().bins(), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn cross_is_the_outer_product() {
        let graph = run(
            r#"
[PostProcessor.a]
Kind = "constant"
Value = 2.0
Dimension = 1
XNbrBins = 2
XUp = 2.0
[PostProcessor.b]
Kind = "constant"
Value = 3.0
Dimension = 1
XNbrBins = 3
XUp = 3.0
[PostProcessor.outer]
Kind = "cross"
HistOne = "a"
HistTwo = "b"
"#,
            1,
        );
        let result = graph.find("outer").unwrap().latest();
        let result = result.read().unwrap();
        assert_eq!(result.bins().len(), 6);
        assert!(result.bins().iter().all(|&v| v == 6.0));
    }

    #[test]
    fn statistics_mean_and_stddev() {
        let graph = run(
            r#"
[PostProcessor.wave]
Kind = "constant"
Value = 4.0
Dimension = 1
XNbrBins = 8
XUp = 8.0
[PostProcessor.avg]
Kind = "statistics"
HistName = "wave"
Statistic = "mean"
[PostProcessor.spread]
Kind = "statistics"
HistName = "wave"
Statistic = "stddev"
"#,
            1,
        );
        assert_eq!(scalar_of(&graph, "avg"), 4.0);
        assert_eq!(scalar_of(&graph, "spread"), 0.0);
    }

    #[test]
    fn subset_extracts_the_requested_window() {
        let graph = run(
            r#"
[PostProcessor.wave]
Kind = "constant"
Value = 1.0
Dimension = 1
XNbrBins = 10
XUp = 10.0
[PostProcessor.window]
Kind = "subset"
HistName = "wave"
XLow = 2.0
XUp = 5.0
"#,
            1,
        );
        let result = graph.find("window").unwrap().latest();
        let result = result.read().unwrap();
        let axis = result.axis_1d().unwrap();
        assert_eq!(axis.nbins, 4);
        assert!((axis.low - 2.0).abs() < 1e-12);
    }

    #[test]
    fn low_pass_filter_preserves_a_constant_signal() {
        let graph = run(
            r#"
[PostProcessor.wave]
Kind = "constant"
Value = 5.0
Dimension = 1
XNbrBins = 16
XUp = 16.0
[PostProcessor.smooth]
Kind = "iir_filter"
HistName = "wave"
FilterType = "lowpass"
Cutoff = 0.01
"#,
            1,
        );
        let result = graph.find("smooth").unwrap().latest();
        let result = result.read().unwrap();
        for &v in result.bins() {
            assert!((v - 5.0).abs() < 1e-9);
        }
    }
}
