//! Live event stream emitted by a profiling session.
//!
//! Delivery is fire-and-forget: a sink that fails for one event is logged and
//! skipped, and the session never waits on a consumer.

use super::types::{DeepOperationMetric, PipelineSection, Phase, RunSummary};
use crate::errors::SinkError;
use crate::instrument::{ActivationStats, ComponentKind};
use crate::power::PowerSample;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfilingEvent {
    PowerSample {
        sample: PowerSample,
    },
    SectionStart {
        phase: Phase,
        name: String,
        depth: u32,
        start_ms: f64,
    },
    SectionEnd {
        section: PipelineSection,
    },
    TokenComplete {
        position: u32,
        text: String,
        phase: Phase,
        duration_ms: f64,
        energy_mj: Option<f64>,
        power_snapshot: Option<PowerSample>,
    },
    LayerMetrics {
        token_position: u32,
        layer_index: u32,
        total_ms: f64,
        attention_ms: f64,
        mlp_ms: f64,
        norm_ms: f64,
        stats: Option<ActivationStats>,
    },
    ComponentMetrics {
        token_position: u32,
        layer_index: u32,
        component: String,
        kind: ComponentKind,
        duration_ms: f64,
        calls: u32,
        stats: Option<ActivationStats>,
    },
    OperationMetrics {
        token_position: u32,
        layer_index: u32,
        component: String,
        operation: DeepOperationMetric,
    },
    InferenceComplete {
        run_id: Uuid,
        partial: bool,
        summary: RunSummary,
    },
}

impl ProfilingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProfilingEvent::PowerSample { .. } => "power_sample",
            ProfilingEvent::SectionStart { .. } => "section_start",
            ProfilingEvent::SectionEnd { .. } => "section_end",
            ProfilingEvent::TokenComplete { .. } => "token_complete",
            ProfilingEvent::LayerMetrics { .. } => "layer_metrics",
            ProfilingEvent::ComponentMetrics { .. } => "component_metrics",
            ProfilingEvent::OperationMetrics { .. } => "operation_metrics",
            ProfilingEvent::InferenceComplete { .. } => "inference_complete",
        }
    }
}

/// An event with its position in the session's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: ProfilingEvent,
}

pub trait EventSink: Send {
    fn send(&mut self, event: &StreamEvent) -> Result<(), SinkError>;
}

/// Bounded tokio channel; full or closed channels drop the event.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&mut self, event: &StreamEvent) -> Result<(), SinkError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Disconnected,
        })
    }
}

/// Newline-delimited JSON to any writer.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn send(&mut self, event: &StreamEvent) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

/// Keeps every event in memory; clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event.name()).collect()
    }
}

impl EventSink for MemorySink {
    fn send(&mut self, event: &StreamEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Fans one event out to every registered sink with a shared sequence number.
#[derive(Default)]
pub struct EventDispatcher {
    sinks: Vec<Box<dyn EventSink>>,
    sequence: u64,
    failures: u64,
}

impl EventDispatcher {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            sinks,
            sequence: 0,
            failures: 0,
        }
    }

    pub fn add(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn has_sinks(&self) -> bool {
        !self.sinks.is_empty()
    }

    pub fn emit(&mut self, event: ProfilingEvent) {
        if self.sinks.is_empty() {
            return;
        }
        let event = StreamEvent {
            sequence: self.sequence,
            event,
        };
        self.sequence += 1;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.send(&event) {
                self.failures += 1;
                warn!(event = event.event.name(), sequence = event.sequence, error = %e, "event sink failed, skipping");
            }
        }
    }

    /// Sink deliveries that failed.
    pub fn failures(&self) -> u64 {
        self.failures
    }
}
