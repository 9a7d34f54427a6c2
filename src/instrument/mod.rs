//! Observation of an externally owned module graph.

pub mod capture;
pub mod graph;
pub mod layout;
pub mod ops;
pub mod profiled;
pub mod profiler;
pub mod stats;
pub mod tensor;

pub use capture::{CaptureBuffer, ComponentRecord, OperationRecord};
pub use graph::{Module, ModuleGraph};
pub use layout::{ComponentKind, ComponentLayout, ComponentPath};
pub use ops::{CpuDevice, CpuOps, Device, OpKind, OperationExtras, TensorOps};
pub use profiled::ProfiledOps;
pub use profiler::{Instrumentation, InstrumentationSettings, OperationStrategy, ProfilingDepth};
pub use stats::ActivationStats;
pub use tensor::Tensor;
