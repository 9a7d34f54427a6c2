//! Session orchestration: phases, tokens, energy attribution and the event stream.

pub mod aggregate;
pub mod clock;
pub mod events;
pub mod session;
pub mod types;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use events::{
    ChannelSink, EventDispatcher, EventSink, JsonLinesSink, MemorySink, ProfilingEvent,
    StreamEvent,
};
pub use session::{LiveView, PowerMode, ProfilingSession, SessionBuilder};
pub use types::{
    normalize_tags, ComponentMetric, DeepOperationMetric, LayerMetric, Phase, PhaseSummary,
    PipelineSection, ProfilingRun, RunOverview, RunSummary, Token,
};
