//! A profiling session: one run from `start` to `close`.
//!
//! The session owns its power monitor, its instrumentation and the in-progress run
//! tree. Only the workload thread mutates it, through the boundary hooks. Readers on
//! other threads see a [`LiveView`] snapshot.
//!
//! Phases move strictly forward (`pre_inference → prefill → decode → post_inference`,
//! any of them may be skipped). Nested sections may be opened inside the current phase
//! and close in LIFO order.

use super::aggregate::{self, SummaryInputs};
use super::clock::{MonotonicClock, SharedClock};
use super::events::{ChannelSink, EventDispatcher, EventSink, ProfilingEvent, StreamEvent};
use super::types::{normalize_tags, Phase, PipelineSection, ProfilingRun, Token};
use crate::config::ProfilerConfig;
use crate::errors::SessionError;
use crate::instrument::{Instrumentation, InstrumentationSettings, ModuleGraph, ProfilingDepth};
use crate::model::ModelFeatures;
use crate::power::{command_source, covering, integrate_energy_mj, IdleBaseline, PowerMonitor, PowerSample, PowerSource};
use crate::store::ProfileStore;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What to do when power sampling cannot start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PowerMode {
    /// Refuse to start the session.
    Required,
    /// Continue with timing only; the run is marked partial.
    #[default]
    Optional,
    /// Do not start a sampler. Samples may still be fed manually.
    Disabled,
}

/// Snapshot of a session in progress, safe to read from any thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveView {
    pub run_id: Uuid,
    pub phase: Option<Phase>,
    pub closed: bool,
    pub elapsed_ms: f64,
    pub sections: u32,
    pub tokens: u32,
    /// Sum of provisional token energies so far.
    pub token_energy_mj: Option<f64>,
    pub latest_power: Option<PowerSample>,
}

pub struct SessionBuilder {
    config: ProfilerConfig,
    prompt: String,
    model_id: String,
    experiment: Option<String>,
    tags: Vec<String>,
    clock: Option<SharedClock>,
    power_source: Option<Box<dyn PowerSource>>,
    power_mode: PowerMode,
    sinks: Vec<Box<dyn EventSink>>,
    store: Option<Arc<dyn ProfileStore>>,
    model_features: Option<ModelFeatures>,
    input_tokens: Option<u32>,
}

impl SessionBuilder {
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn experiment(mut self, name: impl Into<String>) -> Self {
        self.experiment = Some(name.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sample from this source instead of the configured command.
    pub fn power_source(mut self, source: impl PowerSource + 'static) -> Self {
        self.power_source = Some(Box::new(source));
        self
    }

    pub fn power_mode(mut self, mode: PowerMode) -> Self {
        self.power_mode = mode;
        self
    }

    pub fn sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Add a bounded channel sink sized by `event_channel_capacity`.
    pub fn channel(mut self) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (sink, rx) = ChannelSink::new(self.config.event_channel_capacity);
        self.sinks.push(Box::new(sink));
        (self, rx)
    }

    pub fn store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn model_features(mut self, features: ModelFeatures) -> Self {
        self.model_features = Some(features);
        self
    }

    /// Prompt length in tokens, when prefill does not emit one boundary per token.
    pub fn input_tokens(mut self, count: u32) -> Self {
        self.input_tokens = Some(count);
        self
    }

    /// Start power sampling and open the session.
    ///
    /// With [`PowerMode::Required`] a sampler that cannot start is an error and no
    /// session is created.
    pub fn start(self) -> Result<ProfilingSession, SessionError> {
        let clock = self.clock.unwrap_or_else(MonotonicClock::shared);
        let interval = self.config.sample_interval();
        let capacity = self.config.sample_buffer_capacity;
        let mut monitor = match (self.power_mode, self.power_source) {
            (PowerMode::Disabled, _) => PowerMonitor::without_source(Arc::clone(&clock), interval, capacity),
            (_, Some(source)) => PowerMonitor::new(source, Arc::clone(&clock), interval, capacity),
            (_, None) => PowerMonitor::new(
                Box::new(command_source(&self.config.power_command, self.config.power_format)),
                Arc::clone(&clock),
                interval,
                capacity,
            ),
        };

        match self.power_mode {
            PowerMode::Disabled => debug!("power sampling disabled"),
            PowerMode::Required => monitor.start()?,
            PowerMode::Optional => {
                if let Err(e) = monitor.start() {
                    warn!(error = %e, "power sampling unavailable, profiling timing only");
                }
            }
        }

        let baseline = match self.config.idle_baseline_ms {
            Some(ms) if monitor.has_worker() => {
                match monitor.measure_idle_baseline(std::time::Duration::from_millis(ms)) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "idle baseline measurement failed");
                        None
                    }
                }
            }
            _ => None,
        };

        let id = Uuid::new_v4();
        let started_ms = clock.now_ms();
        let live = Arc::new(RwLock::new(LiveView {
            run_id: id,
            ..Default::default()
        }));
        info!(
            run_id = %id,
            model = %self.model_id,
            depth = %self.config.depth,
            power = %monitor.source_name(),
            sampling = monitor.has_worker(),
            "profiling session started"
        );

        Ok(ProfilingSession {
            id,
            created_at: Utc::now().trunc_subsecs(3),
            model_id: self.model_id,
            prompt: self.prompt,
            experiment: self.experiment,
            tags: normalize_tags(&self.tags),
            instrumentation: Instrumentation::new(InstrumentationSettings::from_config(&self.config)),
            requested_depth: self.config.depth,
            effective_depth: ProfilingDepth::Off,
            degraded: false,
            config: self.config,
            clock,
            monitor,
            power_mode: self.power_mode,
            events: EventDispatcher::new(self.sinks),
            store: self.store,
            model_features: self.model_features,
            input_tokens: self.input_tokens,
            baseline,
            started_ms,
            last_token_ms: started_ms,
            last_power_offset: f64::NEG_INFINITY,
            samples: Vec::new(),
            open_phase: None,
            open_sections: Vec::new(),
            last_phase: None,
            sections: Vec::new(),
            tokens: Vec::new(),
            closed: false,
            live,
        })
    }
}

#[derive(Debug, Clone)]
struct OpenSection {
    phase: Phase,
    name: String,
    depth: u32,
    start_ms: f64,
}

pub struct ProfilingSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    model_id: String,
    prompt: String,
    experiment: Option<String>,
    tags: Vec<String>,
    config: ProfilerConfig,
    clock: SharedClock,
    monitor: PowerMonitor,
    power_mode: PowerMode,
    instrumentation: Instrumentation,
    requested_depth: ProfilingDepth,
    effective_depth: ProfilingDepth,
    degraded: bool,
    events: EventDispatcher,
    store: Option<Arc<dyn ProfileStore>>,
    model_features: Option<ModelFeatures>,
    input_tokens: Option<u32>,
    baseline: Option<IdleBaseline>,
    started_ms: f64,
    last_token_ms: f64,
    last_power_offset: f64,
    /// Every sample drained from the monitor. The monitor buffer is bounded and
    /// evicts; this series is what the run is integrated over.
    samples: Vec<PowerSample>,
    open_phase: Option<OpenSection>,
    open_sections: Vec<OpenSection>,
    last_phase: Option<Phase>,
    sections: Vec<PipelineSection>,
    tokens: Vec<Token>,
    closed: bool,
    live: Arc<RwLock<LiveView>>,
}

impl fmt::Debug for ProfilingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilingSession")
            .field("id", &self.id)
            .field("model_id", &self.model_id)
            .field("phase", &self.current_phase())
            .field("tokens", &self.tokens.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl ProfilingSession {
    pub fn builder(config: ProfilerConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            prompt: String::new(),
            model_id: "unknown".to_string(),
            experiment: None,
            tags: Vec::new(),
            clock: None,
            power_source: None,
            power_mode: PowerMode::default(),
            sinks: Vec::new(),
            store: None,
            model_features: None,
            input_tokens: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn monitor(&self) -> &PowerMonitor {
        &self.monitor
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The open phase, `Idle` between phases.
    pub fn current_phase(&self) -> Phase {
        self.open_phase.as_ref().map(|p| p.phase).unwrap_or(Phase::Idle)
    }

    pub fn effective_depth(&self) -> ProfilingDepth {
        self.effective_depth
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn sections(&self) -> &[PipelineSection] {
        &self.sections
    }

    pub fn live_view(&self) -> Arc<RwLock<LiveView>> {
        Arc::clone(&self.live)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn hold_ms(&self) -> f64 {
        self.monitor.interval_ms()
    }

    fn provisional_energy(&self, start_ms: f64, end_ms: f64) -> Option<f64> {
        let window = covering(&self.samples, start_ms, end_ms);
        integrate_energy_mj(window, start_ms, end_ms, self.hold_ms())
    }

    /// Move samples that arrived since the last call into the run's series and emit a
    /// `power_sample` event for each.
    pub fn poll_power(&mut self) {
        let fresh = self.monitor.drain_since(self.last_power_offset);
        let Some(last) = fresh.last().cloned() else {
            return;
        };
        self.last_power_offset = last.offset_ms;
        for sample in &fresh {
            self.events.emit(ProfilingEvent::PowerSample {
                sample: sample.clone(),
            });
        }
        self.samples.extend(fresh);
        let elapsed = self.clock.now_ms() - self.started_ms;
        let mut live = self.live.write();
        live.latest_power = Some(last);
        live.elapsed_ms = elapsed;
    }

    /// Instrument `graph` at the configured depth. Failures degrade the depth and are
    /// logged; the depth actually installed is returned.
    pub fn attach(&mut self, graph: &mut ModuleGraph) -> ProfilingDepth {
        if self.closed {
            warn!(run_id = %self.id, "attach after close ignored");
            return ProfilingDepth::Off;
        }
        match self.instrumentation.attach(graph) {
            Ok(depth) => {
                if depth < self.requested_depth {
                    self.degraded = true;
                    warn!(
                        run_id = %self.id,
                        requested = %self.requested_depth,
                        effective = %depth,
                        "instrumentation degraded"
                    );
                }
                self.effective_depth = depth;
                depth
            }
            Err(e) => {
                warn!(run_id = %self.id, error = %e, "attach failed");
                self.instrumentation.effective_depth()
            }
        }
    }

    /// Remove every observation point from `graph`.
    pub fn detach(&mut self, graph: &mut ModuleGraph) {
        self.instrumentation.detach(graph);
    }

    pub fn enter_phase(&mut self, phase: Phase) -> Result<(), SessionError> {
        self.ensure_open()?;
        if let Some(open) = &self.open_phase {
            return Err(SessionError::InvalidTransition {
                from: open.phase.to_string(),
                to: phase.to_string(),
            });
        }
        let from = self.last_phase.unwrap_or(Phase::Idle);
        if phase == Phase::Idle || phase <= from {
            return Err(SessionError::InvalidTransition {
                from: from.to_string(),
                to: phase.to_string(),
            });
        }
        self.poll_power();
        let now = self.clock.now_ms();
        self.open_phase = Some(OpenSection {
            phase,
            name: phase.to_string(),
            depth: 0,
            start_ms: now,
        });
        self.last_phase = Some(phase);
        // A phase boundary also bounds the next token.
        self.last_token_ms = self.last_token_ms.max(now);
        debug!(run_id = %self.id, phase = %phase, start_ms = now, "phase entered");
        self.events.emit(ProfilingEvent::SectionStart {
            phase,
            name: phase.to_string(),
            depth: 0,
            start_ms: now,
        });
        self.live.write().phase = Some(phase);
        Ok(())
    }

    pub fn exit_phase(&mut self, phase: Phase) -> Result<(), SessionError> {
        self.ensure_open()?;
        match &self.open_phase {
            None => return Err(SessionError::NoOpenPhase),
            Some(open) if open.phase != phase => {
                return Err(SessionError::PhaseMismatch {
                    requested: phase.to_string(),
                    open: open.phase.to_string(),
                })
            }
            Some(_) => {}
        }
        self.poll_power();
        let now = self.clock.now_ms();
        while let Some(sub) = self.open_sections.pop() {
            warn!(run_id = %self.id, section = %sub.name, "section left open at phase exit, closing");
            self.finish_section(sub, now);
        }
        if let Some(open) = self.open_phase.take() {
            self.finish_section(open, now);
        }
        self.live.write().phase = None;
        Ok(())
    }

    /// Open a named section nested inside the current phase.
    pub fn begin_section(&mut self, name: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        let phase = match &self.open_phase {
            Some(open) => open.phase,
            None => return Err(SessionError::NoOpenPhase),
        };
        self.poll_power();
        let now = self.clock.now_ms();
        let depth = self.open_sections.len() as u32 + 1;
        self.open_sections.push(OpenSection {
            phase,
            name: name.to_string(),
            depth,
            start_ms: now,
        });
        self.events.emit(ProfilingEvent::SectionStart {
            phase,
            name: name.to_string(),
            depth,
            start_ms: now,
        });
        Ok(())
    }

    /// Close the innermost open section, which must be `name`.
    pub fn end_section(&mut self, name: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.open_sections.last().map(|s| s.name.as_str()) != Some(name) {
            return Err(SessionError::SectionNotOpen(name.to_string()));
        }
        self.poll_power();
        let now = self.clock.now_ms();
        if let Some(sub) = self.open_sections.pop() {
            self.finish_section(sub, now);
        }
        Ok(())
    }

    fn finish_section(&mut self, open: OpenSection, end_ms: f64) {
        let section = PipelineSection {
            phase: open.phase,
            name: open.name,
            depth: open.depth,
            start_ms: open.start_ms,
            end_ms,
            duration_ms: end_ms - open.start_ms,
            energy_mj: self.provisional_energy(open.start_ms, end_ms),
        };
        debug!(
            run_id = %self.id,
            section = %section.name,
            duration_ms = section.duration_ms,
            energy_mj = ?section.energy_mj,
            "section closed"
        );
        self.events.emit(ProfilingEvent::SectionEnd {
            section: section.clone(),
        });
        self.sections.push(section);
        self.live.write().sections = self.sections.len() as u32;
    }

    /// Token boundary: collect everything observed since the previous boundary into
    /// one token.
    pub fn token_emitted(&mut self, position: u32, text: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.poll_power();
        let now = self.clock.now_ms();
        let (phase, phase_start) = match &self.open_phase {
            Some(open) => (open.phase, open.start_ms),
            None => (Phase::Idle, f64::NEG_INFINITY),
        };
        let start = self.last_token_ms.max(phase_start).min(now);
        let layers = aggregate::layers_from_records(self.instrumentation.capture().take());
        let token = Token {
            position,
            text: text.to_string(),
            phase,
            start_ms: start,
            end_ms: now,
            duration_ms: now - start,
            energy_mj: self.provisional_energy(start, now),
            power_snapshot: self.monitor.read_latest(),
            layers,
        };
        self.last_token_ms = now;

        self.events.emit(ProfilingEvent::TokenComplete {
            position,
            text: token.text.clone(),
            phase,
            duration_ms: token.duration_ms,
            energy_mj: token.energy_mj,
            power_snapshot: token.power_snapshot.clone(),
        });
        if self.effective_depth == ProfilingDepth::Operation {
            self.emit_token_detail(&token);
        }

        {
            let mut live = self.live.write();
            live.tokens += 1;
            if let Some(e) = token.energy_mj {
                live.token_energy_mj = Some(live.token_energy_mj.unwrap_or(0.0) + e);
            }
            live.elapsed_ms = now - self.started_ms;
        }
        self.tokens.push(token);
        Ok(())
    }

    fn emit_token_detail(&mut self, token: &Token) {
        for layer in &token.layers {
            self.events.emit(ProfilingEvent::LayerMetrics {
                token_position: token.position,
                layer_index: layer.layer_index,
                total_ms: layer.total_ms,
                attention_ms: layer.attention_ms,
                mlp_ms: layer.mlp_ms,
                norm_ms: layer.norm_ms,
                stats: layer.stats,
            });
            for component in &layer.components {
                self.events.emit(ProfilingEvent::ComponentMetrics {
                    token_position: token.position,
                    layer_index: layer.layer_index,
                    component: component.path.clone(),
                    kind: component.kind,
                    duration_ms: component.duration_ms,
                    calls: component.calls,
                    stats: component.stats,
                });
                for op in &component.operations {
                    self.events.emit(ProfilingEvent::OperationMetrics {
                        token_position: token.position,
                        layer_index: layer.layer_index,
                        component: component.path.clone(),
                        operation: op.clone(),
                    });
                }
            }
        }
    }

    /// Assemble the run. Open sections are closed at the current time, the sampler is
    /// stopped and every energy is recomputed over the samples drained during the run.
    fn finalize(&mut self, aborted: bool) -> Result<ProfilingRun, SessionError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        while let Some(sub) = self.open_sections.pop() {
            warn!(run_id = %self.id, section = %sub.name, "section still open at close");
            self.finish_section(sub, now);
        }
        if let Some(open) = self.open_phase.take() {
            warn!(run_id = %self.id, phase = %open.phase, "phase still open at close");
            self.finish_section(open, now);
        }

        let capture = self.instrumentation.capture();
        let residual = capture.take();
        if !residual.is_empty() {
            debug!(
                run_id = %self.id,
                components = residual.len(),
                "discarding observations after the last token"
            );
        }
        capture.seal();
        if self.instrumentation.is_attached() {
            warn!(run_id = %self.id, "instrumentation still attached at close; capture sealed");
        }

        if self.monitor.has_worker() {
            if let Err(e) = self.monitor.stop() {
                warn!(run_id = %self.id, error = %e, "failed to stop power monitor");
            }
        }
        self.poll_power();

        let mut samples = std::mem::take(&mut self.samples);
        let hold = self.hold_ms();
        self.sections
            .sort_by(|a, b| a.start_ms.total_cmp(&b.start_ms).then(a.depth.cmp(&b.depth)));
        aggregate::reintegrate(&samples, hold, &mut self.sections, &mut self.tokens);
        aggregate::tag_sample_phases(&mut samples, &self.sections);

        let mut phases = self.sections.iter().filter(|s| s.depth == 0);
        let (active_start, active_end) = match phases.next() {
            Some(first) => {
                let end = phases.last().map(|s| s.end_ms).unwrap_or(first.end_ms);
                (first.start_ms, end)
            }
            None => (self.started_ms, now),
        };
        let summary = aggregate::summarize(&SummaryInputs {
            samples: &samples,
            sections: &self.sections,
            tokens: &self.tokens,
            active_start_ms: active_start,
            active_end_ms: active_end,
            hold_ms: hold,
            input_tokens: self.input_tokens,
            model_features: self.model_features.as_ref(),
            baseline: self.baseline.as_ref(),
        });

        let missing_power = self.power_mode != PowerMode::Disabled && samples.is_empty();
        let partial = aborted || self.degraded || missing_power;
        self.closed = true;

        let run = ProfilingRun {
            id: self.id,
            created_at: self.created_at,
            model_id: self.model_id.clone(),
            prompt: self.prompt.clone(),
            experiment: self.experiment.clone(),
            tags: self.tags.clone(),
            requested_depth: self.requested_depth,
            effective_depth: self.effective_depth,
            partial,
            sample_interval_ms: hold,
            model_features: self.model_features.clone(),
            baseline: self.baseline,
            summary,
            power_samples: samples,
            sections: std::mem::take(&mut self.sections),
            tokens: std::mem::take(&mut self.tokens),
        };

        self.events.emit(ProfilingEvent::InferenceComplete {
            run_id: run.id,
            partial,
            summary: run.summary.clone(),
        });
        {
            let mut live = self.live.write();
            live.closed = true;
            live.phase = None;
            live.elapsed_ms = run.summary.duration_ms;
        }
        info!(
            run_id = %run.id,
            duration_ms = run.summary.duration_ms,
            energy_mj = ?run.summary.energy_mj,
            tokens = run.tokens.len(),
            partial,
            aborted,
            dropped_events = self.events.failures(),
            "profiling session closed"
        );
        Ok(run)
    }

    async fn persist(&self, run: &ProfilingRun) {
        let Some(store) = &self.store else {
            return;
        };
        match store.save(run).await {
            Ok(()) => info!(run_id = %run.id, "run persisted"),
            Err(e) => error!(
                run_id = %run.id,
                error = %e,
                "failed to persist run; returning in-memory result"
            ),
        }
    }

    /// Close the session and hand the run to the store. A store failure is logged;
    /// the run is returned either way.
    pub async fn close(&mut self) -> Result<ProfilingRun, SessionError> {
        let run = self.finalize(false)?;
        self.persist(&run).await;
        Ok(run)
    }

    /// Stop mid-flight. Everything recorded so far is kept and the run is partial.
    pub async fn abort(&mut self) -> Result<ProfilingRun, SessionError> {
        warn!(run_id = %self.id, phase = %self.current_phase(), "profiling session aborted");
        let run = self.finalize(true)?;
        self.persist(&run).await;
        Ok(run)
    }
}

impl Drop for ProfilingSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(run_id = %self.id, "profiling session dropped without close");
        let run = match self.finalize(true) {
            Ok(run) => run,
            Err(_) => return,
        };
        let Some(store) = self.store.clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.save(&run).await {
                        error!(run_id = %run.id, error = %e, "failed to persist dropped run");
                    }
                });
            }
            Err(_) => warn!(run_id = %run.id, "no async runtime, dropped run not persisted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MonitorError;
    use crate::power::CommandSource;
    use crate::profiling::clock::ManualClock;
    use crate::profiling::events::MemorySink;

    fn manual() -> (Arc<ManualClock>, SharedClock) {
        let clock = Arc::new(ManualClock::new(0.0));
        let shared: SharedClock = clock.clone();
        (clock, shared)
    }

    fn session(clock: SharedClock) -> ProfilingSession {
        ProfilingSession::builder(ProfilerConfig::default())
            .clock(clock)
            .power_mode(PowerMode::Disabled)
            .start()
            .unwrap()
    }

    #[test]
    fn phases_only_move_forward() {
        let (_, shared) = manual();
        let mut s = session(shared);
        s.enter_phase(Phase::Prefill).unwrap();
        assert!(matches!(
            s.enter_phase(Phase::Decode),
            Err(SessionError::InvalidTransition { .. })
        ));
        assert!(matches!(
            s.exit_phase(Phase::Decode),
            Err(SessionError::PhaseMismatch { .. })
        ));
        s.exit_phase(Phase::Prefill).unwrap();
        assert!(matches!(s.exit_phase(Phase::Prefill), Err(SessionError::NoOpenPhase)));
        assert!(matches!(
            s.enter_phase(Phase::PreInference),
            Err(SessionError::InvalidTransition { .. })
        ));
        s.enter_phase(Phase::Decode).unwrap();
        assert_eq!(s.current_phase(), Phase::Decode);
    }

    #[test]
    fn nested_sections_close_lifo() {
        let (clock, shared) = manual();
        let mut s = session(shared);
        assert!(matches!(s.begin_section("tokenize"), Err(SessionError::NoOpenPhase)));
        s.enter_phase(Phase::PreInference).unwrap();
        s.begin_section("tokenize").unwrap();
        s.begin_section("normalize").unwrap();
        assert!(matches!(
            s.end_section("tokenize"),
            Err(SessionError::SectionNotOpen(_))
        ));
        clock.advance(5.0);
        s.end_section("normalize").unwrap();
        s.end_section("tokenize").unwrap();
        s.exit_phase(Phase::PreInference).unwrap();
        let depths: Vec<u32> = s.sections().iter().map(|x| x.depth).collect();
        assert_eq!(depths, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn token_intervals_start_at_phase_entry() {
        let (clock, shared) = manual();
        let mut s = session(shared);
        clock.set(10.0);
        s.enter_phase(Phase::Decode).unwrap();
        clock.set(30.0);
        s.token_emitted(0, "a").unwrap();
        clock.set(45.0);
        s.token_emitted(1, "b").unwrap();
        s.exit_phase(Phase::Decode).unwrap();
        let run = s.close().await.unwrap();
        assert_eq!(run.tokens[0].start_ms, 10.0);
        assert_eq!(run.tokens[0].duration_ms, 20.0);
        assert_eq!(run.tokens[1].start_ms, 30.0);
        assert_eq!(run.summary.output_tokens, 2);
        assert!(!run.partial);
        assert!(matches!(s.token_emitted(2, "c"), Err(SessionError::Closed)));
        assert!(matches!(s.close().await, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn open_phase_closed_at_close_and_events_ordered() {
        let (clock, shared) = manual();
        let sink = MemorySink::new();
        let mut s = ProfilingSession::builder(ProfilerConfig::default())
            .clock(shared)
            .power_mode(PowerMode::Disabled)
            .sink(sink.clone())
            .start()
            .unwrap();
        s.monitor().feed(PowerSample::with_total(0.0, 1000.0));
        s.enter_phase(Phase::Prefill).unwrap();
        clock.set(50.0);
        s.token_emitted(0, "x").unwrap();
        let run = s.abort().await.unwrap();
        assert!(run.partial);
        assert_eq!(run.sections.len(), 1);
        assert_eq!(run.sections[0].end_ms, 50.0);
        assert_eq!(
            sink.names(),
            vec![
                "power_sample",
                "section_start",
                "token_complete",
                "section_end",
                "inference_complete"
            ]
        );
        let seqs: Vec<u64> = sink.events().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn required_power_refuses_to_start() {
        let err = ProfilingSession::builder(ProfilerConfig::default())
            .power_source(CommandSource::json_lines("definitely-not-a-power-sampler-xyz", vec![]))
            .power_mode(PowerMode::Required)
            .start()
            .unwrap_err();
        assert!(matches!(err, SessionError::Monitor(MonitorError::Unavailable(_))));
    }

    #[test]
    fn live_view_tracks_progress() {
        let (clock, shared) = manual();
        let mut s = session(shared);
        let view = s.live_view();
        s.enter_phase(Phase::Decode).unwrap();
        clock.set(5.0);
        s.token_emitted(0, "t").unwrap();
        let snapshot = view.read().clone();
        assert_eq!(snapshot.tokens, 1);
        assert_eq!(snapshot.phase, Some(Phase::Decode));
        assert!(!snapshot.closed);
    }
}
