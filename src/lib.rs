//! # energy-profiler
//!
//! Hierarchical power and energy profiling for transformer inference pipelines.
//!
//! ## Architecture
//!
//! - **Power**: a background sampler (`powermetrics` or any JSON-lines program) feeds a
//!   bounded, strictly ordered sample buffer; energy is integrated over arbitrary intervals
//! - **Instrumentation**: reversible decorators on a named module graph record per-component
//!   timing and activation statistics, optionally down to attention-core operations
//! - **Profiling**: a session state machine turns phase, section and token boundaries into a
//!   run tree with apportioned energies and streams events while it runs
//! - **Store**: SQLite persistence, historical queries, JSON/CSV export and an HTTP API

pub mod config;
pub mod errors;
pub mod instrument;
pub mod model;
pub mod power;
pub mod profiling;
pub mod server;
pub mod store;
pub mod tokenizer;

pub use config::ProfilerConfig;
pub use errors::{
    InstrumentError, MonitorError, ProfilerError, RecordError, SessionError, SinkError, StoreError,
};
pub use instrument::{Instrumentation, ModuleGraph, OperationStrategy, ProfilingDepth};
pub use model::{DemoTransformer, ModelFeatures};
pub use power::{PowerMonitor, PowerSample, PowerSource};
pub use profiling::{Phase, PowerMode, ProfilingRun, ProfilingSession};
pub use store::{ProfileStore, RunFilter, SqliteStore};
