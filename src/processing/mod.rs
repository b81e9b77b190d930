//! The processor graph.
//!
//! Processors ("nodes") are configured declaratively in the `PostProcessor`
//! settings group: one sub-table per node naming its `Kind`, its parameters,
//! its inputs and an optional gating condition. Loading instantiates every
//! node, resolves dependencies, sorts topologically and allocates each
//! node's result cache; per event, a worker walks the nodes in topological
//! order.

pub mod accumulating;
pub mod cache;
pub mod hitfinder;
pub mod histogramming;
pub mod imaging;
pub mod operations;
pub mod output;
pub mod remap;
pub mod result;
pub mod retrieval;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use thiserror::Error;

use crate::event::CassEvent;
use crate::settings::Settings;
use crate::EventId;

use cache::CachedList;
use result::{Axis, ResultData, ResultHandle};

/// Name of the built-in always-true condition node.
pub const DEFAULT_TRUE: &str = "DefaultTrueHist";
/// Name of the built-in always-false condition node.
pub const DEFAULT_FALSE: &str = "DefaultFalseHist";

/// Errors raised while loading or running the graph.
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// The configured kind has no factory.
    #[error("'{name}': unknown processor kind '{kind}'")]
    UnknownKind {
        /// Node name.
        name: String,
        /// The unknown kind string.
        kind: String,
    },

    /// A dependency name does not exist.
    #[error("'{name}': unknown dependency '{dependency}'")]
    UnknownDependency {
        /// Node name.
        name: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A node depends on itself.
    #[error("'{name}': a processor cannot depend on itself")]
    SelfDependency {
        /// Node name.
        name: String,
    },

    /// The dependency graph has a cycle.
    #[error("dependency cycle involving '{name}'")]
    DependencyCycle {
        /// A node on the cycle.
        name: String,
    },

    /// Input shapes do not fit the operation.
    #[error("'{name}': {reason}")]
    ShapeMismatch {
        /// Node name.
        name: String,
        /// What does not fit.
        reason: String,
    },

    /// Bad data for one event; the event continues through other nodes.
    #[error("'{name}': {reason}")]
    InvalidData {
        /// Node name.
        name: String,
        /// What was wrong.
        reason: String,
    },

    /// A result for an event id did not complete within the bounded wait.
    #[error("'{name}': result for event {id} not available in time")]
    ResultTimeout {
        /// Node name.
        name: String,
        /// The requested event id.
        id: EventId,
    },

    /// A required file could not be read.
    #[error("'{name}': {source}")]
    Io {
        /// Node name.
        name: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Shared state the graph hands to operations that need it.
#[derive(Clone)]
pub struct GraphContext {
    /// Set by the quit sink to terminate the input loop.
    pub quit: Arc<AtomicBool>,
}

impl GraphContext {
    /// A fresh context.
    #[must_use]
    pub fn new() -> GraphContext {
        GraphContext {
            quit: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        GraphContext::new()
    }
}

/// A wired upstream input of a node.
#[derive(Clone)]
pub struct Input {
    node: Arc<Node>,
}

impl Input {
    /// Name of the upstream node.
    #[must_use]
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Shape template of the upstream output, for load-time checks.
    #[must_use]
    pub fn template(&self) -> &ResultData {
        self.node.template()
    }

    /// The upstream result of event `id` (0 selects the latest).
    pub fn result(&self, id: EventId) -> Result<ResultHandle, ProcessorError> {
        self.node.result(id)
    }
}

/// Name resolution during the wiring phase.
pub struct Wiring<'a> {
    nodes: &'a HashMap<String, Arc<Node>>,
    name: &'a str,
}

impl<'a> Wiring<'a> {
    /// Name of the node being wired, for error messages.
    #[must_use]
    pub fn node_name(&self) -> &str {
        self.name
    }

    /// Resolves the dependency `dep` of the node being wired.
    pub fn input(&self, dep: &str) -> Result<Input, ProcessorError> {
        self.nodes
            .get(dep)
            .map(|node| Input {
                node: Arc::clone(node),
            })
            .ok_or_else(|| ProcessorError::UnknownDependency {
                name: self.name.to_string(),
                dependency: dep.to_string(),
            })
    }
}

/// The behavior of one node kind.
pub trait Operation: Send + Sync {
    /// Names of the upstream inputs (the condition is handled separately).
    fn dependencies(&self) -> Vec<String>;

    /// Resolves inputs, validates shapes and returns the output template.
    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError>;

    /// Produces the result for one event.
    fn process(&self, event: &CassEvent, result: &mut ResultData)
        -> Result<(), ProcessorError>;

    /// Accumulating operations keep one running result across events.
    fn accumulating(&self) -> bool {
        false
    }

    /// Called once at shutdown with the node's latest result.
    fn about_to_quit(&self, _latest: &ResultHandle) {}
}

/// One node of the graph.
pub struct Node {
    name: String,
    hide: bool,
    comment: String,
    condition: Option<Arc<Node>>,
    cache: CachedList,
    template: ResultData,
    op: Box<dyn Operation>,
    constant: bool,
}

impl Node {
    /// The node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the node is hidden from listings.
    #[must_use]
    pub fn hide(&self) -> bool {
        self.hide
    }

    /// The user comment.
    #[must_use]
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// The output shape template.
    #[must_use]
    pub fn template(&self) -> &ResultData {
        &self.template
    }

    /// The result of event `id`; `id` 0 selects the latest.
    pub fn result(&self, id: EventId) -> Result<ResultHandle, ProcessorError> {
        if id == 0 || self.constant {
            Ok(self.cache.latest())
        } else {
            self.cache.item(id)
        }
    }

    /// The latest completed result.
    #[must_use]
    pub fn latest(&self) -> ResultHandle {
        self.cache.latest()
    }

    /// Runs the node for one event: reserve a cache slot, gate on the
    /// condition, process under the write lock, publish as latest.
    ///
    /// Returns false when the node reported bad data for this event.
    pub fn process_event(&self, event: &CassEvent) -> bool {
        if self.constant {
            return true;
        }
        let id = event.id();
        let handle = self.cache.reserve(id);

        let condition_true = match &self.condition {
            Some(cond) => match cond.result(id) {
                Ok(result) => result.read().expect("result lock poisoned").is_true(),
                Err(err) => {
                    error!("event {id}: '{}': condition unavailable: {err}", self.name);
                    false
                }
            },
            None => true,
        };

        if !condition_true {
            // the reserved slot already holds the type's zero with no fills
            self.cache.publish(id, false);
            return true;
        }

        let mut clean = true;
        {
            let mut result = handle.write().expect("result lock poisoned");
            result.set_event_id(id);
            if let Err(err) = self.op.process(event, &mut result) {
                error!("event {id}: '{}': {err}", self.name);
                clean = false;
            }
        }
        self.cache.publish(id, true);
        clean
    }

    /// Drops the cache reservation of event `id`.
    pub fn release_event(&self, id: EventId) {
        if !self.constant {
            self.cache.release(id);
        }
    }

    /// Zeroes the node's cached results.
    pub fn clear(&self) {
        if !self.constant {
            self.cache.clear_all();
        }
    }

    /// Shutdown hook.
    pub fn about_to_quit(&self) {
        self.op.about_to_quit(&self.cache.latest());
    }
}

struct ConstantValue {
    value: f64,
}

impl Operation for ConstantValue {
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn wire(&mut self, _wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        Ok(ResultData::new_scalar(""))
    }

    fn process(
        &self,
        _event: &CassEvent,
        result: &mut ResultData,
    ) -> Result<(), ProcessorError> {
        result.set_scalar(self.value);
        Ok(())
    }
}

fn constant_node(name: &str, value: f64) -> Arc<Node> {
    let mut template = ResultData::new_scalar(name);
    template.set_scalar(value);
    let cache = CachedList::new(template.clone(), 1, true);
    Arc::new(Node {
        name: name.to_string(),
        hide: true,
        comment: String::new(),
        condition: None,
        cache,
        template,
        op: Box::new(ConstantValue { value }),
        constant: true,
    })
}

/// Reads a 1-D axis description (`XNbrBins`, `XLow`, `XUp`, `XTitle`) from a
/// node's settings group.
#[must_use]
pub fn axis_from_settings(s: &Settings, prefix: &str, default_bins: usize) -> Axis {
    Axis::new(
        s.value_usize(&format!("{prefix}NbrBins"), default_bins).max(1),
        s.value_f64(&format!("{prefix}Low"), 0.0),
        s.value_f64(&format!("{prefix}Up"), 1.0),
        s.value_str(&format!("{prefix}Title"), prefix.to_lowercase().as_str()),
    )
}

/// Builds a 1-D template from a node's settings group.
#[must_use]
pub fn hist_1d_from_settings(s: &Settings, name: &str) -> ResultData {
    ResultData::new_1d(name, axis_from_settings(s, "X", 1))
}

/// Builds a 2-D template from a node's settings group.
#[must_use]
pub fn hist_2d_from_settings(s: &Settings, name: &str) -> ResultData {
    ResultData::new_2d(
        name,
        axis_from_settings(s, "X", 1),
        axis_from_settings(s, "Y", 1),
    )
}

fn make_operation(
    kind: &str,
    name: &str,
    s: &Settings,
    ctx: &GraphContext,
) -> Result<Box<dyn Operation>, ProcessorError> {
    let op: Box<dyn Operation> = match kind {
        "operation" => Box::new(operations::BinaryOperation::from_settings(name, s)?),
        "operation_constant" => Box::new(operations::ConstantOperation::from_settings(name, s)?),
        "not" => Box::new(operations::Not::from_settings(s)),
        "range_check" => Box::new(operations::RangeCheck::from_settings(s)),
        "constant" => Box::new(operations::Constant::from_settings(s)),
        "identity" => Box::new(operations::Identity::from_settings(s)),
        "changed" => Box::new(operations::Changed::from_settings(s)),
        "threshold" => Box::new(operations::Threshold::from_settings(s)),
        "threshold_image" => Box::new(operations::ThresholdImage::from_settings(s)),
        "counter" => Box::new(operations::Counter::from_settings(s)),
        "event_id_filter" => Box::new(operations::EventIdFilter::from_settings(name, s)?),
        "quit" => Box::new(operations::Quit::new(ctx.quit.clone())),

        "projection" => Box::new(histogramming::Projection::from_settings(name, s)?),
        "weighted_projection" => {
            Box::new(histogramming::WeightedProjection::from_settings(name, s)?)
        }
        "integral" => Box::new(histogramming::Integral::from_settings(s)),
        "radial_average" => Box::new(histogramming::RadialAverage::from_settings(s)),
        "history" => Box::new(histogramming::History::from_settings(s)),
        "scatter" => Box::new(histogramming::Scatter::from_settings(s)),
        "cross" => Box::new(histogramming::Cross::from_settings(s)),
        "weighted_1d" => Box::new(histogramming::WeightedHist1D::from_settings(s)),
        "subset" => Box::new(histogramming::Subset::from_settings(s)),
        "axis_parameter" => Box::new(histogramming::AxisParameter::from_settings(name, s)?),
        "minimum" => Box::new(histogramming::Extremum::minimum(s)),
        "maximum" => Box::new(histogramming::Extremum::maximum(s)),
        "statistics" => Box::new(histogramming::Statistics::from_settings(name, s)?),
        "fwhm" => Box::new(histogramming::WidthAtFraction::from_settings(s)),
        "step" => Box::new(histogramming::StepPosition::from_settings(s)),
        "center_of_mass" => Box::new(histogramming::CenterOfMass::from_settings(s)),
        "rebin" => Box::new(histogramming::Rebin::from_settings(s)),
        "previous" => Box::new(histogramming::Previous::from_settings(s)),
        "iir_filter" => Box::new(histogramming::IirFilter::from_settings(name, s)?),

        "waveform" => Box::new(retrieval::Waveform::from_settings(s)),
        "tdc_hits" => Box::new(retrieval::TdcHits::from_settings(s)),
        "machine_value" => Box::new(retrieval::MachineValue::from_settings(s)),
        "image" => Box::new(retrieval::Image::from_settings(name, s)?),

        "average" => Box::new(accumulating::Average::from_settings(s, false)),
        "square_average" => Box::new(accumulating::Average::from_settings(s, true)),
        "covariance" => Box::new(accumulating::Covariance::from_settings(s)),
        "covariance_weighted" => Box::new(accumulating::CovarianceWeighted::from_settings(s)),

        "local_median_background" => Box::new(imaging::LocalMedianBackground::from_settings(s)),
        "local_minima" => Box::new(histogramming::LocalMinima1D::from_settings(s)),

        "peakfind" => Box::new(hitfinder::PeakFinder::from_settings(s)),
        "peak_display" => Box::new(hitfinder::PeakDisplay::from_settings(s)),

        "tof_to_energy" => Box::new(remap::TofToEnergy::from_settings(s)),

        "cbf_writer" => Box::new(output::CbfWriter::from_settings(s)),

        _ => {
            return Err(ProcessorError::UnknownKind {
                name: name.to_string(),
                kind: kind.to_string(),
            })
        }
    };
    Ok(op)
}

struct Builder {
    name: String,
    hide: bool,
    comment: String,
    condition_name: String,
    op: Box<dyn Operation>,
    force_hide: bool,
}

/// The loaded, wired graph.
pub struct ProcessorGraph {
    nodes: HashMap<String, Arc<Node>>,
    order: Vec<Arc<Node>>,
}

impl std::fmt::Debug for ProcessorGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorGraph")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("order", &self.order.iter().map(|n| &n.name).collect::<Vec<_>>())
            .finish()
    }
}

impl ProcessorGraph {
    /// Loads the graph from the `PostProcessor` settings group.
    pub fn load(
        settings: &Settings,
        ctx: &GraphContext,
        workers: usize,
    ) -> Result<ProcessorGraph, ProcessorError> {
        let pp = settings.group("PostProcessor");
        let names = pp.child_groups();

        let mut builders: Vec<Builder> = Vec::with_capacity(names.len());
        for name in &names {
            let s = pp.group(name);
            let kind = s.value_str("Kind", "");
            let op = make_operation(&kind, name, &s, ctx)?;
            let force_hide = matches!(kind.as_str(), "constant" | "cbf_writer");
            let condition_name = s.value_str("ConditionName", DEFAULT_TRUE);
            builders.push(Builder {
                name: name.clone(),
                hide: s.value_bool("Hide", false),
                comment: s.value_str("Comment", ""),
                condition_name,
                op,
                force_hide,
            });
        }

        // dependency validation
        let known: std::collections::HashSet<&str> = names
            .iter()
            .map(String::as_str)
            .chain([DEFAULT_TRUE, DEFAULT_FALSE])
            .collect();
        for builder in &builders {
            let mut deps = builder.op.dependencies();
            deps.push(builder.condition_name.clone());
            for dep in &deps {
                if dep.eq_ignore_ascii_case(&builder.name) {
                    return Err(ProcessorError::SelfDependency {
                        name: builder.name.clone(),
                    });
                }
                if !known.contains(dep.as_str()) {
                    return Err(ProcessorError::UnknownDependency {
                        name: builder.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // topological order (Kahn), defaults have no dependencies
        let index_of: HashMap<&str, usize> = builders
            .iter()
            .enumerate()
            .map(|(i, b)| (b.name.as_str(), i))
            .collect();
        let mut indegree = vec![0usize; builders.len()];
        let mut dependants: Vec<Vec<usize>> = vec![Vec::new(); builders.len()];
        for (i, builder) in builders.iter().enumerate() {
            let mut deps = builder.op.dependencies();
            deps.push(builder.condition_name.clone());
            for dep in deps {
                if let Some(&j) = index_of.get(dep.as_str()) {
                    indegree[i] += 1;
                    dependants[j].push(i);
                }
            }
        }
        drop(index_of);
        let mut queue: Vec<usize> = (0..builders.len()).filter(|&i| indegree[i] == 0).collect();
        let mut topo: Vec<usize> = Vec::with_capacity(builders.len());
        while let Some(i) = queue.pop() {
            topo.push(i);
            for &j in &dependants[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    queue.push(j);
                }
            }
        }
        if topo.len() != builders.len() {
            let on_cycle = (0..builders.len())
                .find(|&i| indegree[i] > 0)
                .map(|i| builders[i].name.clone())
                .unwrap_or_default();
            return Err(ProcessorError::DependencyCycle { name: on_cycle });
        }

        // wiring, upstream before downstream
        let mut nodes: HashMap<String, Arc<Node>> = HashMap::new();
        nodes.insert(DEFAULT_TRUE.to_string(), constant_node(DEFAULT_TRUE, 1.0));
        nodes.insert(DEFAULT_FALSE.to_string(), constant_node(DEFAULT_FALSE, 0.0));

        let mut order: Vec<Arc<Node>> = Vec::with_capacity(builders.len());
        let mut builders: Vec<Option<Builder>> = builders.into_iter().map(Some).collect();
        for i in topo {
            let mut builder = builders[i].take().expect("each builder wired once");
            let wiring = Wiring {
                nodes: &nodes,
                name: &builder.name,
            };
            let mut template = builder.op.wire(&wiring)?;
            template.set_name(builder.name.clone());
            let condition = Arc::clone(
                nodes
                    .get(&builder.condition_name)
                    .expect("condition existence checked above"),
            );
            let accumulating = builder.op.accumulating();
            let cache = CachedList::new(template.clone(), workers + 2, accumulating);
            let node = Arc::new(Node {
                name: builder.name.clone(),
                hide: builder.hide || builder.force_hide,
                comment: builder.comment,
                condition: Some(condition),
                cache,
                template,
                op: builder.op,
                constant: false,
            });
            debug!("wired processor '{}'", node.name);
            nodes.insert(builder.name, Arc::clone(&node));
            order.push(node);
        }

        info!("processor graph loaded: {} nodes", order.len());
        Ok(ProcessorGraph { nodes, order })
    }

    /// Runs every node on `event` in topological order; `shutdown` is
    /// polled at each node boundary. Returns the number of per-node errors.
    pub fn process_event(&self, event: &CassEvent, shutdown: &AtomicBool) -> usize {
        let mut errors = 0;
        for node in &self.order {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if !node.process_event(event) {
                errors += 1;
            }
        }
        errors
    }

    /// Releases the cache reservations of event `id` on every node.
    pub fn release_event(&self, id: EventId) {
        for node in &self.order {
            node.release_event(id);
        }
    }

    /// The node called `name`.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(name).cloned()
    }

    /// Names of the non-hidden nodes.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .order
            .iter()
            .filter(|n| !n.hide())
            .map(|n| n.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Zeroes the cached results of node `name`.
    pub fn clear(&self, name: &str) -> bool {
        match self.nodes.get(name) {
            Some(node) => {
                node.clear();
                true
            }
            None => false,
        }
    }

    /// Shutdown hook for every node, in topological order.
    pub fn about_to_quit(&self) {
        for node in &self.order {
            node.about_to_quit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(toml: &str) -> Result<ProcessorGraph, ProcessorError> {
        let settings = Settings::from_str(toml).unwrap();
        ProcessorGraph::load(&settings, &GraphContext::new(), 2)
    }

    #[test]
    fn unknown_kind_fails_load() {
        let err = graph(
            r#"
[PostProcessor.bad]
Kind = "no_such_kind"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProcessorError::UnknownKind { .. }));
    }

    #[test]
    fn unknown_dependency_fails_load() {
        let err = graph(
            r#"
[PostProcessor.t]
Kind = "threshold"
HistName = "missing"
Threshold = 1.0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProcessorError::UnknownDependency { .. }));
    }

    #[test]
    fn self_dependency_fails_load() {
        let err = graph(
            r#"
[PostProcessor.loop]
Kind = "threshold"
HistName = "LOOP"
Threshold = 1.0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProcessorError::SelfDependency { .. }));
    }

    #[test]
    fn cycles_fail_load() {
        let err = graph(
            r#"
[PostProcessor.a]
Kind = "threshold"
HistName = "b"
[PostProcessor.b]
Kind = "threshold"
HistName = "a"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProcessorError::DependencyCycle { .. }));
    }

    #[test]
    fn defaults_are_present_and_constant() {
        let graph = graph(
            r#"
[PostProcessor.c]
Kind = "constant"
Value = 2.5
"#,
        )
        .unwrap();
        let yes = graph.find(DEFAULT_TRUE).unwrap();
        assert!(yes.result(1234).unwrap().read().unwrap().is_true());
        let no = graph.find(DEFAULT_FALSE).unwrap();
        assert!(!no.result(1234).unwrap().read().unwrap().is_true());
        // constants are forced hidden
        let c = graph.find("c").unwrap();
        assert!(c.hide());
    }
}
