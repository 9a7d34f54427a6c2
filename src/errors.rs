//! Central error types for energy-profiler.

use std::fmt;
use thiserror::Error;

/// Errors raised while starting or stopping the power sampler.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("power sampler requires passwordless privilege: {0}")]
    PermissionDenied(String),

    #[error("power sampling utility unavailable: {0}")]
    Unavailable(String),

    #[error("power monitor is already running")]
    AlreadyRunning,

    #[error("power monitor is not running")]
    NotRunning,

    #[error("power sampler terminated immediately ({status}): {stderr}")]
    TerminatedImmediately { status: String, stderr: String },

    #[error("failed to spawn power sampler: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A single power record that could not be turned into a sample.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("malformed power record: {0}")]
    Malformed(String),

    #[error("power record contains no recognised power domain")]
    MissingDomain,

    #[error("plist decode: {0}")]
    Plist(#[from] plist::Error),

    #[error("json decode: {0}")]
    Json(#[from] serde_json::Error),

    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from attaching instrumentation or evaluating the module graph.
#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("module '{0}' not found in graph")]
    ComponentNotFound(String),

    #[error("no transformer layers found among {0} module paths")]
    NoLayers(usize),

    #[error("instrumentation is already attached")]
    AlreadyAttached,

    #[error("shape mismatch in {op}: {detail}")]
    ShapeMismatch { op: &'static str, detail: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Errors raised by the profiling session state machine.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("phase '{requested}' is not open (open: {open})")]
    PhaseMismatch { requested: String, open: String },

    #[error("no phase is open")]
    NoOpenPhase,

    #[error("section '{0}' is not open")]
    SectionNotOpen(String),

    #[error("session already closed")]
    Closed,

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

/// Delivery failure of one event to one sink. Always logged and skipped.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("event channel full")]
    Full,

    #[error("event consumer disconnected")]
    Disconnected,

    #[error("event encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("event write: {0}")]
    Io(#[from] std::io::Error),
}

/// Entity kinds of the persisted hierarchy, used to name what failed to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Run,
    Tag,
    PowerSample,
    Section,
    Token,
    LayerMetric,
    ComponentMetric,
    OperationMetric,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Run => "run",
            EntityKind::Tag => "tag",
            EntityKind::PowerSample => "power_sample",
            EntityKind::Section => "pipeline_section",
            EntityKind::Token => "token",
            EntityKind::LayerMetric => "layer_metric",
            EntityKind::ComponentMetric => "component_metric",
            EntityKind::OperationMetric => "operation_metric",
        };
        f.write_str(s)
    }
}

/// Errors from the profile store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable at {location}: {source}")]
    StorageUnavailable {
        location: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to persist {entity}: {source}")]
    Persistence {
        entity: EntityKind,
        #[source]
        source: sqlx::Error,
    },

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
