//! Model description and the built-in demo workload.

pub mod config;
pub mod demo;
pub mod features;
pub mod transformer;

pub use config::ArchitectureConfig;
pub use demo::{populate_graph, AttentionCore, Linear, RmsNorm};
pub use features::{AttentionMechanism, ModelFeatures};
pub use transformer::{argmax, DemoTransformer};
