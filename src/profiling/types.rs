//! The profiled hierarchy: run → sections / tokens → layers → components → operations.

use crate::instrument::{ActivationStats, ComponentKind, OpKind, OperationExtras, ProfilingDepth};
use crate::model::ModelFeatures;
use crate::power::{IdleBaseline, PowerSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Pipeline phase. Variants are declared in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Outside any phase.
    Idle,
    PreInference,
    Prefill,
    Decode,
    PostInference,
}

impl Phase {
    pub const ACTIVE: [Phase; 4] = [
        Phase::PreInference,
        Phase::Prefill,
        Phase::Decode,
        Phase::PostInference,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::PreInference => "pre_inference",
            Phase::Prefill => "prefill",
            Phase::Decode => "decode",
            Phase::PostInference => "post_inference",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Phase::Idle),
            "pre_inference" => Ok(Phase::PreInference),
            "prefill" => Ok(Phase::Prefill),
            "decode" => Ok(Phase::Decode),
            "post_inference" => Ok(Phase::PostInference),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// One phase (depth 0) or nested sub-phase interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    pub phase: Phase,
    pub name: String,
    /// 0 for a phase, 1.. for sections opened inside it.
    pub depth: u32,
    pub start_ms: f64,
    pub end_ms: f64,
    pub duration_ms: f64,
    /// `None` when no power samples were available.
    pub energy_mj: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepOperationMetric {
    pub name: String,
    pub kind: OpKind,
    pub duration_ms: f64,
    pub calls: u32,
    pub flops: u64,
    pub stats: Option<ActivationStats>,
    pub extras: OperationExtras,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetric {
    pub name: String,
    pub path: String,
    pub kind: ComponentKind,
    pub duration_ms: f64,
    pub calls: u32,
    pub stats: Option<ActivationStats>,
    pub operations: Vec<DeepOperationMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerMetric {
    pub layer_index: u32,
    pub total_ms: f64,
    pub attention_ms: f64,
    pub mlp_ms: f64,
    pub norm_ms: f64,
    /// Pooled statistics over the layer's observed component outputs.
    pub stats: Option<ActivationStats>,
    pub components: Vec<ComponentMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub position: u32,
    pub text: String,
    pub phase: Phase,
    pub start_ms: f64,
    pub end_ms: f64,
    pub duration_ms: f64,
    pub energy_mj: Option<f64>,
    /// Latest power sample at emission time.
    pub power_snapshot: Option<PowerSample>,
    pub layers: Vec<LayerMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub duration_ms: f64,
    pub energy_mj: Option<f64>,
}

/// Run-level aggregates, computed once at close.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub duration_ms: f64,
    pub energy_mj: Option<f64>,
    pub avg_power_mw: Option<f64>,
    pub peak_power_mw: Option<f64>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub tokens_per_joule: Option<f64>,
    pub joules_per_token: Option<f64>,
    pub joules_per_input_token: Option<f64>,
    pub joules_per_output_token: Option<f64>,
    /// Millijoules per million model parameters.
    pub energy_per_million_params_mj: Option<f64>,
    pub baseline_power_mw: Option<f64>,
    /// Energy above the idle baseline.
    pub net_energy_mj: Option<f64>,
    pub sample_count: u32,
    pub phases: Vec<PhaseSummary>,
}

impl RunSummary {
    pub fn energy_j(&self) -> Option<f64> {
        self.energy_mj.map(|mj| mj / 1000.0)
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseSummary> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// Descriptive attributes of a run, without its child rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOverview {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub model_id: String,
    pub prompt: String,
    pub experiment: Option<String>,
    pub tags: Vec<String>,
    pub requested_depth: ProfilingDepth,
    pub effective_depth: ProfilingDepth,
    /// Aborted, degraded, or missing power data.
    pub partial: bool,
    pub summary: RunSummary,
}

/// One complete profiling session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilingRun {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub model_id: String,
    pub prompt: String,
    pub experiment: Option<String>,
    pub tags: Vec<String>,
    pub requested_depth: ProfilingDepth,
    pub effective_depth: ProfilingDepth,
    pub partial: bool,
    pub sample_interval_ms: f64,
    pub model_features: Option<ModelFeatures>,
    pub baseline: Option<IdleBaseline>,
    pub summary: RunSummary,
    pub power_samples: Vec<PowerSample>,
    pub sections: Vec<PipelineSection>,
    pub tokens: Vec<Token>,
}

impl ProfilingRun {
    pub fn overview(&self) -> RunOverview {
        RunOverview {
            id: self.id,
            created_at: self.created_at,
            model_id: self.model_id.clone(),
            prompt: self.prompt.clone(),
            experiment: self.experiment.clone(),
            tags: self.tags.clone(),
            requested_depth: self.requested_depth,
            effective_depth: self.effective_depth,
            partial: self.partial,
            summary: self.summary.clone(),
        }
    }

    pub fn layer_metric_count(&self) -> usize {
        self.tokens.iter().map(|t| t.layers.len()).sum()
    }

    pub fn component_metric_count(&self) -> usize {
        self.tokens
            .iter()
            .flat_map(|t| &t.layers)
            .map(|l| l.components.len())
            .sum()
    }

    pub fn operation_metric_count(&self) -> usize {
        self.tokens
            .iter()
            .flat_map(|t| &t.layers)
            .flat_map(|l| &l.components)
            .map(|c| c.operations.len())
            .sum()
    }

    /// Top-level (phase) sections.
    pub fn phase_sections(&self) -> impl Iterator<Item = &PipelineSection> {
        self.sections.iter().filter(|s| s.depth == 0)
    }
}

/// Normalise free-form tags: trimmed, non-empty, sorted, unique.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = tags
        .into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
