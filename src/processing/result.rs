//! Typed processor results.
//!
//! Every node produces one [`ResultData`] per accepted event: a scalar, a 1-D
//! histogram with over/underflow sentinels, a 2-D histogram, or a table (a
//! 2-D result whose rows accumulate). Results carry their name, the event id
//! of the latest fill and a fill count; they are shared behind an `RwLock`
//! ([`ResultHandle`]) with writers holding the write side during
//! `process()` and readers the read side.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::EventId;

/// A shared, lockable result.
pub type ResultHandle = Arc<RwLock<ResultData>>;

/// One axis of a histogram result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Axis {
    /// Number of bins.
    pub nbins: usize,
    /// Lower edge of the first bin.
    pub low: f64,
    /// Upper edge of the last bin.
    pub up: f64,
    /// Axis title.
    pub title: String,
}

impl Axis {
    /// Creates an axis.
    #[must_use]
    pub fn new(nbins: usize, low: f64, up: f64, title: impl Into<String>) -> Axis {
        Axis {
            nbins,
            low,
            up,
            title: title.into(),
        }
    }

    /// Width of one bin.
    #[must_use]
    pub fn bin_width(&self) -> f64 {
        (self.up - self.low) / self.nbins as f64
    }

    /// The bin containing `pos`, or `None` outside the axis range.
    #[must_use]
    pub fn bin(&self, pos: f64) -> Option<usize> {
        if pos < self.low || pos >= self.up {
            return None;
        }
        let bin = ((pos - self.low) / self.bin_width()) as usize;
        Some(bin.min(self.nbins - 1))
    }

    /// The bin containing `pos`, clipped into the axis range.
    #[must_use]
    pub fn bin_clipped(&self, pos: f64) -> usize {
        if pos <= self.low {
            0
        } else {
            self.bin(pos).unwrap_or(self.nbins - 1)
        }
    }

    /// Lower edge of bin `bin`.
    #[must_use]
    pub fn position(&self, bin: usize) -> f64 {
        self.low + bin as f64 * self.bin_width()
    }

    /// Center of bin `bin`.
    #[must_use]
    pub fn center(&self, bin: usize) -> f64 {
        self.position(bin) + 0.5 * self.bin_width()
    }
}

/// The value payload of a result.
#[derive(Debug, Clone, Serialize)]
pub enum Value {
    /// A single number.
    Scalar(
        /// The value.
        f64,
    ),
    /// A 1-D histogram with over/underflow sentinels.
    OneD {
        /// The single axis.
        axis: Axis,
        /// The in-range bins.
        bins: Vec<f64>,
        /// Weight collected below the axis.
        underflow: f64,
        /// Weight collected above the axis.
        overflow: f64,
    },
    /// A 2-D histogram.
    TwoD {
        /// Horizontal axis (columns).
        x: Axis,
        /// Vertical axis (rows).
        y: Axis,
        /// Row-major bins, `x.nbins * y.nbins` of them.
        bins: Vec<f64>,
        /// Weight collected outside either axis.
        outside: f64,
    },
    /// A variable-height log of rows with a fixed column count.
    Table {
        /// Number of columns.
        columns: usize,
        /// Row-major cells, `columns * rows()` of them.
        cells: Vec<f64>,
    },
}

/// One processor result.
#[derive(Debug, Clone, Serialize)]
pub struct ResultData {
    name: String,
    event_id: EventId,
    fills: u64,
    /// The payload.
    pub value: Value,
}

impl ResultData {
    /// A scalar result.
    #[must_use]
    pub fn new_scalar(name: impl Into<String>) -> ResultData {
        ResultData {
            name: name.into(),
            event_id: 0,
            fills: 0,
            value: Value::Scalar(0.0),
        }
    }

    /// A 1-D result over `axis`.
    #[must_use]
    pub fn new_1d(name: impl Into<String>, axis: Axis) -> ResultData {
        let bins = vec![0.0; axis.nbins];
        ResultData {
            name: name.into(),
            event_id: 0,
            fills: 0,
            value: Value::OneD {
                axis,
                bins,
                underflow: 0.0,
                overflow: 0.0,
            },
        }
    }

    /// A 2-D result over `x` and `y`.
    #[must_use]
    pub fn new_2d(name: impl Into<String>, x: Axis, y: Axis) -> ResultData {
        let bins = vec![0.0; x.nbins * y.nbins];
        ResultData {
            name: name.into(),
            event_id: 0,
            fills: 0,
            value: Value::TwoD {
                x,
                y,
                bins,
                outside: 0.0,
            },
        }
    }

    /// An empty table of `columns` columns.
    #[must_use]
    pub fn new_table(name: impl Into<String>, columns: usize) -> ResultData {
        ResultData {
            name: name.into(),
            event_id: 0,
            fills: 0,
            value: Value::Table {
                columns,
                cells: Vec::new(),
            },
        }
    }

    /// The node name this result belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the result (used when templates are cloned into caches).
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Event id of the latest fill.
    #[must_use]
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Sets the event id of the latest fill.
    pub fn set_event_id(&mut self, id: EventId) {
        self.event_id = id;
    }

    /// Number of fills since the last clear.
    #[must_use]
    pub fn fills(&self) -> u64 {
        self.fills
    }

    /// Sets the fill count.
    pub fn set_fills(&mut self, fills: u64) {
        self.fills = fills;
    }

    /// Increments the fill count and returns the new value.
    pub fn add_fill(&mut self) -> u64 {
        self.fills += 1;
        self.fills
    }

    /// Dimension of the result: 0, 1 or 2. Tables count as 2.
    #[must_use]
    pub fn dimension(&self) -> usize {
        match &self.value {
            Value::Scalar(_) => 0,
            Value::OneD { .. } => 1,
            Value::TwoD { .. } | Value::Table { .. } => 2,
        }
    }

    /// The boolean reading of the result: a scalar is true when non-zero,
    /// everything else is true once filled.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match &self.value {
            Value::Scalar(v) => *v != 0.0,
            _ => self.fills > 0,
        }
    }

    /// The scalar value, or `None` for array results.
    #[must_use]
    pub fn scalar(&self) -> Option<f64> {
        match &self.value {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// Sets a scalar value and counts the fill.
    pub fn set_scalar(&mut self, v: f64) {
        self.value = Value::Scalar(v);
        self.fills = 1;
    }

    /// The flat bin storage of any array result.
    #[must_use]
    pub fn bins(&self) -> &[f64] {
        match &self.value {
            Value::Scalar(_) => &[],
            Value::OneD { bins, .. } => bins,
            Value::TwoD { bins, .. } => bins,
            Value::Table { cells, .. } => cells,
        }
    }

    /// Mutable flat bin storage of any array result.
    pub fn bins_mut(&mut self) -> &mut [f64] {
        match &mut self.value {
            Value::Scalar(_) => &mut [],
            Value::OneD { bins, .. } => bins,
            Value::TwoD { bins, .. } => bins,
            Value::Table { cells, .. } => cells,
        }
    }

    /// The single axis of a 1-D result.
    #[must_use]
    pub fn axis_1d(&self) -> Option<&Axis> {
        match &self.value {
            Value::OneD { axis, .. } => Some(axis),
            _ => None,
        }
    }

    /// The axes of a 2-D result.
    #[must_use]
    pub fn axes_2d(&self) -> Option<(&Axis, &Axis)> {
        match &self.value {
            Value::TwoD { x, y, .. } => Some((x, y)),
            _ => None,
        }
    }

    /// Fills `pos` with `weight` into a 1-D result, routing out-of-range
    /// weight to the sentinels.
    pub fn fill_1d(&mut self, pos: f64, weight: f64) {
        if let Value::OneD {
            axis,
            bins,
            underflow,
            overflow,
        } = &mut self.value
        {
            match axis.bin(pos) {
                Some(bin) => bins[bin] += weight,
                None if pos < axis.low => *underflow += weight,
                None => *overflow += weight,
            }
        }
    }

    /// Fills `(x, y)` with `weight` into a 2-D result; out-of-range weight
    /// lands in the outside sentinel.
    pub fn fill_2d(&mut self, xpos: f64, ypos: f64, weight: f64) {
        if let Value::TwoD { x, y, bins, outside } = &mut self.value {
            match (x.bin(xpos), y.bin(ypos)) {
                (Some(xb), Some(yb)) => bins[yb * x.nbins + xb] += weight,
                _ => *outside += weight,
            }
        }
    }

    /// Appends one row to a table result.
    pub fn append_row(&mut self, row: &[f64]) {
        if let Value::Table { columns, cells } = &mut self.value {
            debug_assert_eq!(row.len(), *columns);
            cells.extend_from_slice(row);
        }
    }

    /// Number of rows of a table result.
    #[must_use]
    pub fn table_rows(&self) -> usize {
        match &self.value {
            Value::Table { columns, cells } if *columns > 0 => cells.len() / columns,
            _ => 0,
        }
    }

    /// One row of a table result.
    #[must_use]
    pub fn table_row(&self, row: usize) -> &[f64] {
        match &self.value {
            Value::Table { columns, cells } => &cells[row * columns..(row + 1) * columns],
            _ => &[],
        }
    }

    /// Resets the result to its type's zero with a fill count of zero.
    pub fn clear(&mut self) {
        self.fills = 0;
        self.event_id = 0;
        match &mut self.value {
            Value::Scalar(v) => *v = 0.0,
            Value::OneD {
                bins,
                underflow,
                overflow,
                ..
            } => {
                bins.iter_mut().for_each(|b| *b = 0.0);
                *underflow = 0.0;
                *overflow = 0.0;
            }
            Value::TwoD { bins, outside, .. } => {
                bins.iter_mut().for_each(|b| *b = 0.0);
                *outside = 0.0;
            }
            Value::Table { cells, .. } => cells.clear(),
        }
    }

    /// True when `other` has the same dimension and axis binning.
    #[must_use]
    pub fn same_shape(&self, other: &ResultData) -> bool {
        match (&self.value, &other.value) {
            (Value::Scalar(_), Value::Scalar(_)) => true,
            (Value::OneD { axis: a, .. }, Value::OneD { axis: b, .. }) => a.nbins == b.nbins,
            (Value::TwoD { x: ax, y: ay, .. }, Value::TwoD { x: bx, y: by, .. }) => {
                ax.nbins == bx.nbins && ay.nbins == by.nbins
            }
            (Value::Table { columns: a, .. }, Value::Table { columns: b, .. }) => a == b,
            _ => false,
        }
    }

    /// Wraps the result into its shared lockable form.
    #[must_use]
    pub fn into_handle(self) -> ResultHandle {
        Arc::new(RwLock::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_binning() {
        let axis = Axis::new(4, 0.0, 4.0, "x");
        assert_eq!(axis.bin(-0.1), None);
        assert_eq!(axis.bin(0.0), Some(0));
        assert_eq!(axis.bin(3.999), Some(3));
        assert_eq!(axis.bin(4.0), None);
        assert_eq!(axis.bin_clipped(-5.0), 0);
        assert_eq!(axis.bin_clipped(99.0), 3);
        assert!((axis.center(1) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn sentinels_collect_out_of_range_weight() {
        let mut hist = ResultData::new_1d("h", Axis::new(2, 0.0, 2.0, ""));
        hist.fill_1d(0.5, 1.0);
        hist.fill_1d(-1.0, 2.0);
        hist.fill_1d(7.0, 3.0);
        match &hist.value {
            Value::OneD {
                bins,
                underflow,
                overflow,
                ..
            } => {
                assert_eq!(bins, &vec![1.0, 0.0]);
                assert_eq!(*underflow, 2.0);
                assert_eq!(*overflow, 3.0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn tables_grow_by_rows() {
        let mut table = ResultData::new_table("t", 3);
        table.append_row(&[1.0, 2.0, 3.0]);
        table.append_row(&[4.0, 5.0, 6.0]);
        assert_eq!(table.table_rows(), 2);
        assert_eq!(table.table_row(1), &[4.0, 5.0, 6.0]);
        table.clear();
        assert_eq!(table.table_rows(), 0);
    }

    #[test]
    fn scalar_truth_is_non_zero() {
        let mut s = ResultData::new_scalar("s");
        assert!(!s.is_true());
        s.set_scalar(-2.0);
        assert!(s.is_true());
        s.set_scalar(0.0);
        assert!(!s.is_true());
    }

    #[test]
    fn shape_comparison() {
        let a = ResultData::new_1d("a", Axis::new(4, 0.0, 1.0, ""));
        let b = ResultData::new_1d("b", Axis::new(4, -5.0, 5.0, ""));
        let c = ResultData::new_1d("c", Axis::new(8, 0.0, 1.0, ""));
        assert!(a.same_shape(&b));
        assert!(!a.same_shape(&c));
        assert!(!a.same_shape(&ResultData::new_scalar("s")));
    }
}
