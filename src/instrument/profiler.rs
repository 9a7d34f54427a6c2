//! Attach and detach observation points on a [`ModuleGraph`].
//!
//! Observed modules are wrapped in decorators that time each call and summarise
//! its output; the originals are kept and put back on detach. At operation depth
//! the attention cores additionally compute through [`ProfiledOps`], either by
//! swapping the graph's tensor ops (interception) or by substituting a wrapper
//! that hands profiled ops to the core (substitution).

use super::capture::CaptureBuffer;
use super::graph::{Module, ModuleGraph};
use super::layout::{ComponentKind, ComponentLayout, ComponentPath};
use super::ops::{Device, TensorOps};
use super::profiled::ProfiledOps;
use super::stats::ActivationStats;
use super::tensor::Tensor;
use crate::config::ProfilerConfig;
use crate::errors::InstrumentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How much of the graph is observed. Ordered from least to most detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfilingDepth {
    /// Nothing attached; phase and token timing only.
    Off,
    /// Component timing without activation statistics.
    Minimal,
    Module,
    /// Module level plus micro-operations inside attention.
    Operation,
}

impl ProfilingDepth {
    /// Next depth to try after a failed attach.
    pub fn lower(self) -> ProfilingDepth {
        match self {
            ProfilingDepth::Operation => ProfilingDepth::Module,
            ProfilingDepth::Module => ProfilingDepth::Minimal,
            ProfilingDepth::Minimal | ProfilingDepth::Off => ProfilingDepth::Off,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfilingDepth::Off => "off",
            ProfilingDepth::Minimal => "minimal",
            ProfilingDepth::Module => "module",
            ProfilingDepth::Operation => "operation",
        }
    }
}

impl fmt::Display for ProfilingDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfilingDepth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(ProfilingDepth::Off),
            "minimal" => Ok(ProfilingDepth::Minimal),
            "module" => Ok(ProfilingDepth::Module),
            "operation" | "deep" => Ok(ProfilingDepth::Operation),
            other => Err(format!(
                "unknown profiling depth '{other}' (expected off, minimal, module or operation)"
            )),
        }
    }
}

/// How operation-level observation is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationStrategy {
    /// Replace the graph-wide tensor ops with a recording wrapper.
    #[default]
    Interception,
    /// Wrap each attention core so it computes with recording ops.
    Substitution,
}

impl FromStr for OperationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interception" => Ok(OperationStrategy::Interception),
            "substitution" => Ok(OperationStrategy::Substitution),
            other => Err(format!("unknown operation strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentationSettings {
    pub depth: ProfilingDepth,
    pub strategy: OperationStrategy,
    pub capture_activations: bool,
    pub sparsity_threshold: f32,
}

impl InstrumentationSettings {
    pub fn from_config(config: &ProfilerConfig) -> Self {
        Self {
            depth: config.depth,
            strategy: config.operation_strategy,
            capture_activations: config.capture_activations,
            sparsity_threshold: config.sparsity_threshold,
        }
    }
}

impl Default for InstrumentationSettings {
    fn default() -> Self {
        Self::from_config(&ProfilerConfig::default())
    }
}

/// Decorator that times a module and summarises its output.
#[derive(Debug)]
struct ObservedModule {
    inner: Arc<dyn Module>,
    target: ComponentPath,
    capture: Arc<CaptureBuffer>,
    device: Arc<dyn Device>,
    capture_stats: bool,
    sparsity_threshold: f32,
}

impl Module for ObservedModule {
    fn forward(&self, inputs: &[&Tensor], ops: &dyn TensorOps) -> Result<Tensor, InstrumentError> {
        self.device.synchronize();
        self.capture.enter(&self.target);
        let start = Instant::now();
        let out = self.inner.forward(inputs, ops);
        self.device.synchronize();
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        let stats = match (&out, self.capture_stats) {
            (Ok(t), true) => Some(ActivationStats::from_slice(t.data(), self.sparsity_threshold)),
            _ => None,
        };
        self.capture.exit(ms, stats);
        out
    }

    fn parameter_count(&self) -> usize {
        self.inner.parameter_count()
    }
}

/// Structural substitute for an attention core: ignores the caller's ops and
/// computes with the recording ones.
#[derive(Debug)]
struct SubstitutedCore {
    inner: Arc<dyn Module>,
    ops: Arc<ProfiledOps>,
}

impl Module for SubstitutedCore {
    fn forward(&self, inputs: &[&Tensor], _ops: &dyn TensorOps) -> Result<Tensor, InstrumentError> {
        self.inner.forward(inputs, self.ops.as_ref())
    }

    fn parameter_count(&self) -> usize {
        self.inner.parameter_count()
    }
}

#[derive(Debug)]
struct Attached {
    originals: Vec<(String, Arc<dyn Module>)>,
    original_ops: Option<Arc<dyn TensorOps>>,
    depth: ProfilingDepth,
}

/// Observation points for one session.
#[derive(Debug)]
pub struct Instrumentation {
    settings: InstrumentationSettings,
    capture: Arc<CaptureBuffer>,
    attached: Option<Attached>,
    layout: Option<ComponentLayout>,
}

impl Instrumentation {
    pub fn new(settings: InstrumentationSettings) -> Self {
        Self {
            settings,
            capture: Arc::new(CaptureBuffer::new()),
            attached: None,
            layout: None,
        }
    }

    pub fn settings(&self) -> &InstrumentationSettings {
        &self.settings
    }

    pub fn capture(&self) -> &Arc<CaptureBuffer> {
        &self.capture
    }

    pub fn layout(&self) -> Option<&ComponentLayout> {
        self.layout.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    /// Depth actually in effect (`Off` when detached).
    pub fn effective_depth(&self) -> ProfilingDepth {
        self.attached
            .as_ref()
            .map(|a| a.depth)
            .unwrap_or(ProfilingDepth::Off)
    }

    /// Install observation points at the configured depth, falling back one depth
    /// at a time when installation fails. Returns the depth in effect.
    pub fn attach(&mut self, graph: &mut ModuleGraph) -> Result<ProfilingDepth, InstrumentError> {
        if self.attached.is_some() {
            return Err(InstrumentError::AlreadyAttached);
        }
        let mut depth = self.settings.depth;
        loop {
            if depth == ProfilingDepth::Off {
                self.attached = Some(Attached {
                    originals: Vec::new(),
                    original_ops: None,
                    depth,
                });
                info!("instrumentation off");
                return Ok(depth);
            }
            match self.try_attach(graph, depth) {
                Ok(attached) => {
                    info!(
                        depth = %depth,
                        components = attached.originals.len(),
                        "instrumentation attached"
                    );
                    self.attached = Some(attached);
                    return Ok(depth);
                }
                Err(e) => {
                    let lower = depth.lower();
                    warn!(depth = %depth, fallback = %lower, error = %e, "attach failed, degrading");
                    depth = lower;
                }
            }
        }
    }

    fn try_attach(
        &mut self,
        graph: &mut ModuleGraph,
        depth: ProfilingDepth,
    ) -> Result<Attached, InstrumentError> {
        let layout = ComponentLayout::detect(graph.paths())?;
        if depth == ProfilingDepth::Operation && layout.attention_cores().next().is_none() {
            return Err(InstrumentError::ComponentNotFound(
                "self_attn.core (attention core)".to_string(),
            ));
        }
        let capture_stats = self.settings.capture_activations && depth != ProfilingDepth::Minimal;
        let device = Arc::clone(graph.device());
        let profiled = (depth == ProfilingDepth::Operation).then(|| {
            Arc::new(ProfiledOps::new(
                Arc::clone(graph.ops()),
                Arc::clone(&self.capture),
                Arc::clone(&device),
                capture_stats,
                self.settings.sparsity_threshold,
            ))
        });

        let mut attached = Attached {
            originals: Vec::new(),
            original_ops: None,
            depth,
        };
        for target in layout.targets(depth) {
            let original = match graph.get(&target.path) {
                Ok(m) => Arc::clone(m),
                Err(e) => {
                    restore(graph, &mut attached);
                    return Err(e);
                }
            };
            let mut inner = Arc::clone(&original);
            if let (Some(ops), OperationStrategy::Substitution) = (&profiled, self.settings.strategy)
            {
                if target.kind == ComponentKind::AttentionCore {
                    inner = Arc::new(SubstitutedCore {
                        inner,
                        ops: Arc::clone(ops),
                    });
                }
            }
            let observed = Arc::new(ObservedModule {
                inner,
                target: target.clone(),
                capture: Arc::clone(&self.capture),
                device: Arc::clone(&device),
                capture_stats,
                sparsity_threshold: self.settings.sparsity_threshold,
            });
            if let Err(e) = graph.replace(&target.path, observed) {
                restore(graph, &mut attached);
                return Err(e);
            }
            debug!(component = %target.path, "observer installed");
            attached.originals.push((target.path.clone(), original));
        }
        if let (Some(ops), OperationStrategy::Interception) = (profiled, self.settings.strategy) {
            attached.original_ops = Some(graph.set_ops(ops));
        }
        self.layout = Some(layout);
        Ok(attached)
    }

    /// Remove every observation point, restoring the graph's original modules and ops.
    pub fn detach(&mut self, graph: &mut ModuleGraph) {
        if let Some(mut attached) = self.attached.take() {
            let n = attached.originals.len();
            restore(graph, &mut attached);
            info!(components = n, "instrumentation detached");
        }
    }
}

fn restore(graph: &mut ModuleGraph, attached: &mut Attached) {
    for (path, original) in attached.originals.drain(..).rev() {
        if let Err(e) = graph.replace(&path, original) {
            warn!(component = %path, error = %e, "could not restore module");
        }
    }
    if let Some(ops) = attached.original_ops.take() {
        graph.set_ops(ops);
    }
}
