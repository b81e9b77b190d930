//! Elementary operations on upstream results: arithmetic, boolean logic,
//! comparisons, thresholds and a handful of per-event utilities.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::event::CassEvent;
use crate::settings::Settings;
use crate::EventId;

use super::result::{Axis, ResultData, Value};
use super::{Input, Operation, ProcessorError, Wiring};

/// The pointwise operators shared by the binary and constant operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Addition.
    Plus,
    /// Subtraction.
    Minus,
    /// Multiplication.
    Times,
    /// Division.
    Divide,
    /// Boolean and of the non-zero readings.
    And,
    /// Boolean or of the non-zero readings.
    Or,
    /// Less than.
    Less,
    /// Less or equal.
    LessEqual,
    /// Greater than.
    Greater,
    /// Greater or equal.
    GreaterEqual,
    /// Equality.
    Equal,
    /// Inequality.
    NotEqual,
}

impl Operator {
    fn parse(name: &str, text: &str) -> Result<Operator, ProcessorError> {
        Ok(match text {
            "+" => Operator::Plus,
            "-" => Operator::Minus,
            "*" => Operator::Times,
            "/" => Operator::Divide,
            "AND" => Operator::And,
            "OR" => Operator::Or,
            "<" => Operator::Less,
            "<=" => Operator::LessEqual,
            ">" => Operator::Greater,
            ">=" => Operator::GreaterEqual,
            "==" => Operator::Equal,
            "!=" => Operator::NotEqual,
            other => {
                return Err(ProcessorError::ShapeMismatch {
                    name: name.to_string(),
                    reason: format!("unknown operator '{other}'"),
                })
            }
        })
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Operator::Plus => a + b,
            Operator::Minus => a - b,
            Operator::Times => a * b,
            Operator::Divide => a / b,
            Operator::And => f64::from(a != 0.0 && b != 0.0),
            Operator::Or => f64::from(a != 0.0 || b != 0.0),
            Operator::Less => f64::from(a < b),
            Operator::LessEqual => f64::from(a <= b),
            Operator::Greater => f64::from(a > b),
            Operator::GreaterEqual => f64::from(a >= b),
            Operator::Equal => f64::from(a == b),
            Operator::NotEqual => f64::from(a != b),
        }
    }
}

fn read_input(
    input: &OnceLock<Input>,
    id: EventId,
) -> Result<super::result::ResultHandle, ProcessorError> {
    input
        .get()
        .expect("input wired before processing")
        .result(id)
}

/// Pointwise operation over two results of matching shape.
pub struct BinaryOperation {
    one_name: String,
    two_name: String,
    operator: Operator,
    one: OnceLock<Input>,
    two: OnceLock<Input>,
}

impl BinaryOperation {
    /// Parses `HistOne`, `HistTwo` and `Operation`.
    pub fn from_settings(name: &str, s: &Settings) -> Result<BinaryOperation, ProcessorError> {
        Ok(BinaryOperation {
            one_name: s.value_str("HistOne", ""),
            two_name: s.value_str("HistTwo", ""),
            operator: Operator::parse(name, &s.value_str("Operation", "+"))?,
            one: OnceLock::new(),
            two: OnceLock::new(),
        })
    }
}

impl Operation for BinaryOperation {
    fn dependencies(&self) -> Vec<String> {
        vec![self.one_name.clone(), self.two_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let one = wiring.input(&self.one_name)?;
        let two = wiring.input(&self.two_name)?;
        if !one.template().same_shape(two.template()) {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!(
                    "inputs '{}' and '{}' have different shapes",
                    self.one_name, self.two_name
                ),
            });
        }
        let template = one.template().clone();
        let _ = self.one.set(one);
        let _ = self.two.set(two);
        Ok(template)
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let one = read_input(&self.one, event.id())?;
        let two = read_input(&self.two, event.id())?;
        let one = one.read().expect("result lock poisoned");
        let two = two.read().expect("result lock poisoned");
        match (one.scalar(), two.scalar()) {
            (Some(a), Some(b)) => result.set_scalar(self.operator.apply(a, b)),
            _ => {
                let out = result.bins_mut();
                for ((r, a), b) in out.iter_mut().zip(one.bins()).zip(two.bins()) {
                    *r = self.operator.apply(*a, *b);
                }
                result.add_fill();
            }
        }
        Ok(())
    }
}

/// Which side of the operator a configured value takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValuePosition {
    /// `op(value, H[i])`
    First,
    /// `op(H[i], value)`
    Second,
}

/// Pointwise operation of one result against a constant or a referenced
/// scalar result.
pub struct ConstantOperation {
    hist_name: String,
    value_name: Option<String>,
    value: f64,
    position: ValuePosition,
    operator: Operator,
    hist: OnceLock<Input>,
    value_input: OnceLock<Input>,
}

impl ConstantOperation {
    /// Parses `HistName`, `Operation`, `Value` or `ValueName`, `ValuePos`.
    pub fn from_settings(name: &str, s: &Settings) -> Result<ConstantOperation, ProcessorError> {
        let position = match s.value_str("ValuePos", "second").as_str() {
            "first" => ValuePosition::First,
            _ => ValuePosition::Second,
        };
        let value_name = if s.contains("ValueName") {
            Some(s.value_str("ValueName", ""))
        } else {
            None
        };
        Ok(ConstantOperation {
            hist_name: s.value_str("HistName", ""),
            value_name,
            value: s.value_f64("Value", 1.0),
            position,
            operator: Operator::parse(name, &s.value_str("Operation", "*"))?,
            hist: OnceLock::new(),
            value_input: OnceLock::new(),
        })
    }

    fn value_for(&self, id: EventId) -> Result<f64, ProcessorError> {
        match self.value_input.get() {
            Some(input) => {
                let result = input.result(id)?;
                let result = result.read().expect("result lock poisoned");
                Ok(result.scalar().unwrap_or(0.0))
            }
            None => Ok(self.value),
        }
    }
}

impl Operation for ConstantOperation {
    fn dependencies(&self) -> Vec<String> {
        let mut deps = vec![self.hist_name.clone()];
        if let Some(value_name) = &self.value_name {
            deps.push(value_name.clone());
        }
        deps
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        if let Some(value_name) = &self.value_name {
            let value = wiring.input(value_name)?;
            if value.template().dimension() != 0 {
                return Err(ProcessorError::ShapeMismatch {
                    name: wiring.node_name().to_string(),
                    reason: format!("value source '{value_name}' is not a scalar"),
                });
            }
            let _ = self.value_input.set(value);
        }
        let template = hist.template().clone();
        let _ = self.hist.set(hist);
        Ok(template)
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let value = self.value_for(event.id())?;
        let hist = read_input(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let apply = |h: f64| match self.position {
            ValuePosition::First => self.operator.apply(value, h),
            ValuePosition::Second => self.operator.apply(h, value),
        };
        match hist.scalar() {
            Some(h) => result.set_scalar(apply(h)),
            None => {
                for (r, h) in result.bins_mut().iter_mut().zip(hist.bins()) {
                    *r = apply(*h);
                }
                result.add_fill();
            }
        }
        Ok(())
    }
}

/// Boolean negation of a scalar.
pub struct Not {
    hist_name: String,
    hist: OnceLock<Input>,
}

impl Not {
    /// Parses `HistName`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Not {
        Not {
            hist_name: s.value_str("HistName", ""),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for Not {
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
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read_input(&self.hist, event.id())?;
        let value = hist.read().expect("result lock poisoned").is_true();
        result.set_scalar(f64::from(!value));
        Ok(())
    }
}

/// True when the summed input lies strictly inside a range.
pub struct RangeCheck {
    hist_name: String,
    lower: f64,
    upper: f64,
    hist: OnceLock<Input>,
}

impl RangeCheck {
    /// Parses `HistName`, `LowerLimit`, `UpperLimit`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> RangeCheck {
        RangeCheck {
            hist_name: s.value_str("HistName", ""),
            lower: s.value_f64("LowerLimit", 0.0),
            upper: s.value_f64("UpperLimit", 0.0),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for RangeCheck {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let _ = self.hist.set(wiring.input(&self.hist_name)?);
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read_input(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let sum = match hist.scalar() {
            Some(v) => v,
            None => hist.bins().iter().sum(),
        };
        result.set_scalar(f64::from(self.lower < sum && sum < self.upper));
        Ok(())
    }
}

/// A result filled with one constant value. Always hidden.
pub struct Constant {
    value: f64,
    dimension: usize,
    x: Axis,
    y: Axis,
}

impl Constant {
    /// Parses `Value`, `Dimension` and the axis keys.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Constant {
        Constant {
            value: s.value_f64("Value", 0.0),
            dimension: s.value_usize("Dimension", 0),
            x: super::axis_from_settings(s, "X", 1),
            y: super::axis_from_settings(s, "Y", 1),
        }
    }
}

impl Operation for Constant {
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn wire(&mut self, _wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        Ok(match self.dimension {
            0 => ResultData::new_scalar(""),
            1 => ResultData::new_1d("", self.x.clone()),
            _ => ResultData::new_2d("", self.x.clone(), self.y.clone()),
        })
    }

    fn process(&self, _event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        if let Value::Scalar(v) = &mut result.value {
            *v = self.value;
        } else {
            result.bins_mut().iter_mut().for_each(|b| *b = self.value);
        }
        result.set_fills(1);
        Ok(())
    }
}

/// Passes a copy of the upstream result for this event.
pub struct Identity {
    hist_name: String,
    hist: OnceLock<Input>,
}

impl Identity {
    /// Parses `HistName`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Identity {
        Identity {
            hist_name: s.value_str("HistName", ""),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for Identity {
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
        let hist = read_input(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let id = result.event_id();
        let name = result.name().to_string();
        *result = hist.clone();
        result.set_name(name);
        result.set_event_id(id);
        Ok(())
    }
}

/// True when a scalar moved by more than a configured difference since the
/// previous event.
pub struct Changed {
    hist_name: String,
    difference: f64,
    previous: Mutex<f64>,
    hist: OnceLock<Input>,
}

impl Changed {
    /// Parses `HistName` and `Difference`; a difference of 0 falls back to
    /// the smallest positive representable value.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Changed {
        let mut difference = s.value_f64("Difference", 0.0);
        if difference == 0.0 {
            difference = f64::MIN_POSITIVE;
        }
        Changed {
            hist_name: s.value_str("HistName", ""),
            difference,
            previous: Mutex::new(0.0),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for Changed {
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
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read_input(&self.hist, event.id())?;
        let current = hist
            .read()
            .expect("result lock poisoned")
            .scalar()
            .unwrap_or(0.0);
        let mut previous = self.previous.lock().expect("state lock poisoned");
        let changed = (current - *previous).abs() > self.difference;
        *previous = current;
        result.set_scalar(f64::from(changed));
        Ok(())
    }
}

/// Zeroes every bin at or below a threshold.
pub struct Threshold {
    hist_name: String,
    threshold: f64,
    hist: OnceLock<Input>,
}

impl Threshold {
    /// Parses `HistName` and `Threshold`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Threshold {
        Threshold {
            hist_name: s.value_str("HistName", ""),
            threshold: s.value_f64("Threshold", 0.0),
            hist: OnceLock::new(),
        }
    }
}

impl Operation for Threshold {
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
        let hist = read_input(&self.hist, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        match hist.scalar() {
            Some(v) => result.set_scalar(if v > self.threshold { v } else { 0.0 }),
            None => {
                for (r, &h) in result.bins_mut().iter_mut().zip(hist.bins()) {
                    *r = if h > self.threshold { h } else { 0.0 };
                }
                result.add_fill();
            }
        }
        Ok(())
    }
}

/// Replaces pixels whose value in a reference image lies inside a range.
pub struct ThresholdImage {
    hist_name: String,
    reference_name: String,
    lower: f64,
    upper: f64,
    user_value: f64,
    hist: OnceLock<Input>,
    reference: OnceLock<Input>,
}

impl ThresholdImage {
    /// Parses `HistName`, `ReferenceName`, `LowerLimit`, `UpperLimit`,
    /// `UserValue`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> ThresholdImage {
        ThresholdImage {
            hist_name: s.value_str("HistName", ""),
            reference_name: s.value_str("ReferenceName", ""),
            lower: s.value_f64("LowerLimit", 0.0),
            upper: s.value_f64("UpperLimit", 0.0),
            user_value: s.value_f64("UserValue", 0.0),
            hist: OnceLock::new(),
            reference: OnceLock::new(),
        }
    }
}

impl Operation for ThresholdImage {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone(), self.reference_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let reference = wiring.input(&self.reference_name)?;
        if !hist.template().same_shape(reference.template()) {
            return Err(ProcessorError::ShapeMismatch {
                name: wiring.node_name().to_string(),
                reason: format!(
                    "reference '{}' does not match the input shape",
                    self.reference_name
                ),
            });
        }
        let template = hist.template().clone();
        let _ = self.hist.set(hist);
        let _ = self.reference.set(reference);
        Ok(template)
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let hist = read_input(&self.hist, event.id())?;
        let reference = read_input(&self.reference, event.id())?;
        let hist = hist.read().expect("result lock poisoned");
        let reference = reference.read().expect("result lock poisoned");
        for ((r, &h), &m) in result
            .bins_mut()
            .iter_mut()
            .zip(hist.bins())
            .zip(reference.bins())
        {
            *r = if self.lower < m && m < self.upper {
                self.user_value
            } else {
                h
            };
        }
        result.add_fill();
        Ok(())
    }
}

/// Counts invocations into an accumulating scalar.
pub struct Counter;

impl Counter {
    /// No parameters.
    #[must_use]
    pub fn from_settings(_s: &Settings) -> Counter {
        Counter
    }
}

impl Operation for Counter {
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn wire(&mut self, _wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, _event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let value = result.scalar().unwrap_or(0.0);
        result.set_scalar(value + 1.0);
        Ok(())
    }

    fn accumulating(&self) -> bool {
        true
    }
}

/// True when the current event id is listed in a file.
pub struct EventIdFilter {
    ids: HashSet<EventId>,
}

impl EventIdFilter {
    /// Parses `FileName` and loads the id list (one decimal id per line).
    pub fn from_settings(name: &str, s: &Settings) -> Result<EventIdFilter, ProcessorError> {
        let filename = s.value_str("FileName", "");
        let text = std::fs::read_to_string(&filename).map_err(|source| ProcessorError::Io {
            name: name.to_string(),
            source,
        })?;
        let ids = text
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();
        Ok(EventIdFilter { ids })
    }
}

impl Operation for EventIdFilter {
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn wire(&mut self, _wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        result.set_scalar(f64::from(self.ids.contains(&event.id())));
        Ok(())
    }
}

/// Terminates the input loop when its condition fires.
pub struct Quit {
    quit: Arc<AtomicBool>,
}

impl Quit {
    /// Creates the sink around the shared quit flag.
    #[must_use]
    pub fn new(quit: Arc<AtomicBool>) -> Quit {
        Quit { quit }
    }
}

impl Operation for Quit {
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn wire(&mut self, _wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, _event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        self.quit.store(true, Ordering::SeqCst);
        result.set_scalar(1.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{GraphContext, ProcessorGraph, DEFAULT_FALSE};
    use crate::settings::Settings as S;

    fn run_graph(toml: &str, ids: &[EventId]) -> ProcessorGraph {
        let settings = S::from_str(toml).unwrap();
        let graph = ProcessorGraph::load(&settings, &GraphContext::new(), 2).unwrap();
        let shutdown = AtomicBool::new(false);
        for &id in ids {
            let mut event = crate::event::CassEvent::allocate(16);
            event.set_id(id);
            graph.process_event(&event, &shutdown);
            graph.release_event(id);
        }
        graph
    }

    fn scalar_of(graph: &ProcessorGraph, name: &str) -> f64 {
        graph
            .find(name)
            .unwrap()
            .latest()
            .read()
            .unwrap()
            .scalar()
            .unwrap()
    }

    #[test]
    fn binary_operation_adds_constants() {
        let graph = run_graph(
            r#"
[PostProcessor.a]
Kind = "constant"
Value = 2.0
[PostProcessor.b]
Kind = "constant"
Value = 0.5
[PostProcessor.sum]
Kind = "operation"
HistOne = "a"
HistTwo = "b"
Operation = "+"
"#,
            &[1],
        );
        assert_eq!(scalar_of(&graph, "sum"), 2.5);
    }

    #[test]
    fn comparison_yields_boolean_scalars() {
        let graph = run_graph(
            r#"
[PostProcessor.a]
Kind = "constant"
Value = 2.0
[PostProcessor.check]
Kind = "operation_constant"
HistName = "a"
Operation = ">"
Value = 1.0
"#,
            &[1],
        );
        assert_eq!(scalar_of(&graph, "check"), 1.0);
    }

    #[test]
    fn value_position_matters_for_subtraction() {
        let graph = run_graph(
            r#"
[PostProcessor.a]
Kind = "constant"
Value = 2.0
[PostProcessor.sub]
Kind = "operation_constant"
HistName = "a"
Operation = "-"
Value = 5.0
ValuePos = "first"
"#,
            &[1],
        );
        // op(value, H) = 5 - 2
        assert_eq!(scalar_of(&graph, "sub"), 3.0);
    }

    #[test]
    fn not_negates() {
        let graph = run_graph(
            r#"
[PostProcessor.a]
Kind = "constant"
Value = 1.0
[PostProcessor.na]
Kind = "not"
HistName = "a"
"#,
            &[1],
        );
        assert_eq!(scalar_of(&graph, "na"), 0.0);
    }

    #[test]
    fn changed_by_more_than_tracks_previous_value() {
        let graph = run_graph(
            r#"
[PostProcessor.count]
Kind = "counter"
[PostProcessor.moved]
Kind = "changed"
HistName = "count"
Difference = 0.5
"#,
            &[1, 2],
        );
        // the counter moved 1 -> 2 between the events, more than 0.5
        assert_eq!(scalar_of(&graph, "moved"), 1.0);
    }

    #[test]
    fn condition_false_leaves_the_zero_result() {
        let graph = run_graph(
            &format!(
                r#"
[PostProcessor.a]
Kind = "constant"
Value = 7.0
[PostProcessor.gated]
Kind = "identity"
HistName = "a"
ConditionName = "{DEFAULT_FALSE}"
"#
            ),
            &[11],
        );
        let node = graph.find("gated").unwrap();
        let result = node.result(11).unwrap();
        let result = result.read().unwrap();
        assert_eq!(result.scalar(), Some(0.0));
        assert_eq!(result.fills(), 0);
    }

    #[test]
    fn counter_accumulates_across_events() {
        let graph = run_graph(
            r#"
[PostProcessor.count]
Kind = "counter"
"#,
            &[1, 2, 3],
        );
        assert_eq!(scalar_of(&graph, "count"), 3.0);
    }

    #[test]
    fn quit_sets_the_flag() {
        let settings = S::from_str(
            r#"
[PostProcessor.stop]
Kind = "quit"
"#,
        )
        .unwrap();
        let ctx = GraphContext::new();
        let graph = ProcessorGraph::load(&settings, &ctx, 1).unwrap();
        let mut event = crate::event::CassEvent::allocate(16);
        event.set_id(9);
        graph.process_event(&event, &AtomicBool::new(false));
        assert!(ctx.quit.load(Ordering::SeqCst));
    }
}
