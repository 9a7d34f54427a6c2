//! Integration tests: energy attribution, component capture and store failure handling
//! through the public session API.

use async_trait::async_trait;
use energy_profiler::errors::{EntityKind, StoreError};
use energy_profiler::instrument::{ModuleGraph, ProfilingDepth, Tensor};
use energy_profiler::model::{DemoTransformer, Linear};
use energy_profiler::power::{CommandSource, PowerSample, SyntheticSource};
use energy_profiler::profiling::{
    ManualClock, MemorySink, Phase, PowerMode, ProfilingRun, ProfilingSession, RunOverview,
    SharedClock,
};
use energy_profiler::store::{ProfileStore, RunFilter, SqliteStore};
use energy_profiler::ProfilerConfig;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn manual_clock() -> (Arc<ManualClock>, SharedClock) {
    let clock = Arc::new(ManualClock::new(0.0));
    let shared: SharedClock = clock.clone();
    (clock, shared)
}

fn config(depth: ProfilingDepth) -> ProfilerConfig {
    ProfilerConfig {
        depth,
        ..Default::default()
    }
}

#[tokio::test]
async fn phase_energy_spans_two_sample_intervals() {
    let (clock, shared) = manual_clock();
    let mut session = ProfilingSession::builder(config(ProfilingDepth::Module))
        .clock(shared)
        .power_mode(PowerMode::Disabled)
        .start()
        .unwrap();
    for t in [0.0, 100.0, 200.0] {
        assert!(session.monitor().feed(PowerSample::with_total(t, 1000.0)));
    }

    session.enter_phase(Phase::Prefill).unwrap();
    clock.set(200.0);
    session.exit_phase(Phase::Prefill).unwrap();
    let run = session.close().await.unwrap();

    let prefill = run.phase_sections().next().unwrap();
    assert_eq!(prefill.phase, Phase::Prefill);
    assert!((prefill.energy_mj.unwrap() - 200.0).abs() < 1e-9);
    assert!((run.summary.energy_mj.unwrap() - 200.0).abs() < 1e-9);
    assert_eq!(run.summary.duration_ms, 200.0);
    assert!(!run.partial);

    // Every sample inside the phase is tagged with it; the last sits on the boundary.
    let phases: Vec<Phase> = run.power_samples.iter().map(|s| s.phase).collect();
    assert_eq!(phases, vec![Phase::Prefill, Phase::Prefill, Phase::Idle]);
}

#[tokio::test]
async fn run_keeps_samples_the_monitor_buffer_evicted() {
    let (clock, shared) = manual_clock();
    let cfg = ProfilerConfig {
        sample_buffer_capacity: 4,
        ..config(ProfilingDepth::Minimal)
    };
    let mut session = ProfilingSession::builder(cfg)
        .clock(shared)
        .power_mode(PowerMode::Disabled)
        .start()
        .unwrap();
    session.enter_phase(Phase::Decode).unwrap();
    for i in 0..10u32 {
        let t = f64::from(i) * 100.0;
        assert!(session.monitor().feed(PowerSample::with_total(t, 1000.0)));
        clock.set(t + 100.0);
        session.token_emitted(i, "t").unwrap();
    }
    session.exit_phase(Phase::Decode).unwrap();
    let run = session.close().await.unwrap();

    assert_eq!(session.monitor().evicted(), 6);
    assert_eq!(run.power_samples.len(), 10);
    assert!((run.summary.energy_mj.unwrap() - 1000.0).abs() < 1e-9);
    assert_eq!(run.tokens.len(), 10);
    for token in &run.tokens {
        assert!((token.energy_mj.unwrap() - 100.0).abs() < 1e-9);
    }
}

#[tokio::test]
async fn interval_before_the_first_sample_has_unknown_energy() {
    let (clock, shared) = manual_clock();
    let mut session = ProfilingSession::builder(config(ProfilingDepth::Minimal))
        .clock(shared)
        .power_mode(PowerMode::Disabled)
        .start()
        .unwrap();
    session.monitor().feed(PowerSample::with_total(100.0, 1000.0));

    session.enter_phase(Phase::PreInference).unwrap();
    clock.set(50.0);
    session.exit_phase(Phase::PreInference).unwrap();
    session.enter_phase(Phase::Prefill).unwrap();
    clock.set(75.0);
    session.token_emitted(0, "a").unwrap();
    clock.set(200.0);
    session.token_emitted(1, "b").unwrap();
    session.exit_phase(Phase::Prefill).unwrap();
    let run = session.close().await.unwrap();

    let phases: Vec<_> = run.phase_sections().collect();
    assert_eq!(phases[0].phase, Phase::PreInference);
    assert_eq!(phases[0].energy_mj, None);
    assert!((phases[1].energy_mj.unwrap() - 100.0).abs() < 1e-9);
    assert_eq!(run.tokens[0].energy_mj, None);
    assert!((run.tokens[1].energy_mj.unwrap() - 100.0).abs() < 1e-9);
    assert_eq!(run.summary.phase(Phase::PreInference).unwrap().energy_mj, None);
    assert!((run.summary.energy_mj.unwrap() - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn phase_sections_partition_run_energy_while_subsections_nest() {
    let (clock, shared) = manual_clock();
    let mut session = ProfilingSession::builder(config(ProfilingDepth::Minimal))
        .clock(shared)
        .power_mode(PowerMode::Disabled)
        .start()
        .unwrap();
    for (i, mw) in [800.0, 1200.0, 2000.0, 1500.0, 900.0, 700.0].iter().enumerate() {
        session
            .monitor()
            .feed(PowerSample::with_total(i as f64 * 100.0, *mw));
    }

    session.enter_phase(Phase::PreInference).unwrap();
    clock.set(10.0);
    session.begin_section("tokenize").unwrap();
    clock.set(40.0);
    session.end_section("tokenize").unwrap();
    clock.set(50.0);
    session.exit_phase(Phase::PreInference).unwrap();
    session.enter_phase(Phase::Prefill).unwrap();
    clock.set(300.0);
    session.exit_phase(Phase::Prefill).unwrap();
    session.enter_phase(Phase::Decode).unwrap();
    clock.set(500.0);
    session.exit_phase(Phase::Decode).unwrap();
    session.enter_phase(Phase::PostInference).unwrap();
    session.begin_section("detokenize").unwrap();
    clock.set(550.0);
    session.end_section("detokenize").unwrap();
    session.exit_phase(Phase::PostInference).unwrap();
    let run = session.close().await.unwrap();

    let run_energy = run.summary.energy_mj.unwrap();
    let phase_sum: f64 = run.phase_sections().filter_map(|s| s.energy_mj).sum();
    assert!((phase_sum - run_energy).abs() < 1e-9);

    // Sub-sections share their phase's tag and nest inside it, one depth down.
    let subs: Vec<_> = run.sections.iter().filter(|s| s.depth == 1).collect();
    assert_eq!(subs.len(), 2);
    for sub in subs {
        let parent = run
            .phase_sections()
            .find(|p| p.phase == sub.phase)
            .unwrap();
        assert!(sub.start_ms >= parent.start_ms && sub.end_ms <= parent.end_ms);
        assert!(sub.energy_mj.unwrap() <= parent.energy_mj.unwrap());
    }
    for pair in run.phase_sections().collect::<Vec<_>>().windows(2) {
        assert!(pair[0].end_ms <= pair[1].start_ms);
    }
}

#[tokio::test]
async fn two_components_produce_two_rows_under_one_layer() {
    let mut graph = ModuleGraph::default();
    let w = Tensor::new(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
    graph.insert("layers.0.self_attn.q_proj", Arc::new(Linear::new(w.clone())));
    graph.insert("layers.0.mlp.up_proj", Arc::new(Linear::new(w)));

    let (clock, shared) = manual_clock();
    let mut session = ProfilingSession::builder(config(ProfilingDepth::Module))
        .clock(shared)
        .power_mode(PowerMode::Disabled)
        .start()
        .unwrap();
    assert_eq!(session.attach(&mut graph), ProfilingDepth::Module);

    session.enter_phase(Phase::Prefill).unwrap();
    let x = Tensor::new(1, 2, vec![0.5, -0.5]).unwrap();
    let q = graph.call("layers.0.self_attn.q_proj", &[&x]).unwrap();
    let up = graph.call("layers.0.mlp.up_proj", &[&x]).unwrap();
    assert_eq!(q, x);
    assert_eq!(up, x);
    clock.advance(5.0);
    session.token_emitted(0, "a").unwrap();
    session.exit_phase(Phase::Prefill).unwrap();
    session.detach(&mut graph);
    let run = session.close().await.unwrap();

    assert_eq!(run.tokens.len(), 1);
    let layers = &run.tokens[0].layers;
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].layer_index, 0);
    assert_eq!(layers[0].components.len(), 2);
    assert!(layers[0].components.iter().all(|c| c.calls == 1));
    assert_eq!(run.component_metric_count(), 2);
}

#[tokio::test]
async fn zero_samples_leave_energy_unknown() {
    let (clock, shared) = manual_clock();
    let mut session = ProfilingSession::builder(config(ProfilingDepth::Minimal))
        .clock(shared)
        .power_mode(PowerMode::Disabled)
        .start()
        .unwrap();
    session.enter_phase(Phase::Decode).unwrap();
    clock.set(50.0);
    session.token_emitted(0, "x").unwrap();
    session.exit_phase(Phase::Decode).unwrap();
    let run = session.close().await.unwrap();

    assert!(run.power_samples.is_empty());
    assert_eq!(run.tokens[0].energy_mj, None);
    assert_eq!(run.sections[0].energy_mj, None);
    assert_eq!(run.summary.energy_mj, None);
    assert_eq!(run.summary.tokens_per_joule, None);
    assert_eq!(run.summary.duration_ms, 50.0);
}

#[tokio::test]
async fn missing_sampler_in_optional_mode_marks_run_partial() {
    let (_, shared) = manual_clock();
    let mut session = ProfilingSession::builder(config(ProfilingDepth::Minimal))
        .clock(shared)
        .power_source(CommandSource::json_lines("definitely-not-a-power-sampler-xyz", vec![]))
        .power_mode(PowerMode::Optional)
        .start()
        .unwrap();
    assert!(!session.monitor().has_worker());
    session.enter_phase(Phase::Prefill).unwrap();
    session.exit_phase(Phase::Prefill).unwrap();
    let run = session.close().await.unwrap();
    assert!(run.partial);
    assert_eq!(run.summary.energy_mj, None);
}

#[tokio::test]
async fn one_token_row_per_boundary_call() {
    let (clock, shared) = manual_clock();
    let sink = MemorySink::new();
    let mut session = ProfilingSession::builder(config(ProfilingDepth::Minimal))
        .clock(shared)
        .power_mode(PowerMode::Disabled)
        .sink(sink.clone())
        .start()
        .unwrap();
    session.enter_phase(Phase::Decode).unwrap();
    for i in 0..5u32 {
        clock.advance(10.0);
        session.token_emitted(i, &format!("t{i}")).unwrap();
    }
    session.exit_phase(Phase::Decode).unwrap();
    let run = session.close().await.unwrap();

    assert_eq!(run.tokens.len(), 5);
    let positions: Vec<u32> = run.tokens.iter().map(|t| t.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3, 4]);
    assert!(run.tokens.iter().all(|t| t.duration_ms == 10.0));
    let token_events = sink
        .names()
        .into_iter()
        .filter(|n| *n == "token_complete")
        .count();
    assert_eq!(token_events, 5);
}

/// Store whose every write fails.
struct BrokenStore;

#[async_trait]
impl ProfileStore for BrokenStore {
    async fn save(&self, _run: &ProfilingRun) -> Result<(), StoreError> {
        Err(StoreError::Persistence {
            entity: EntityKind::Run,
            source: sqlx::Error::PoolClosed,
        })
    }

    async fn get(&self, _id: Uuid) -> Result<Option<ProfilingRun>, StoreError> {
        Ok(None)
    }

    async fn list(&self, _filter: &RunFilter) -> Result<Vec<RunOverview>, StoreError> {
        Ok(Vec::new())
    }

    async fn summarize(&self, _id: Uuid) -> Result<Option<RunOverview>, StoreError> {
        Ok(None)
    }

    async fn delete(&self, _id: Uuid) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn cleanup(&self, _older_than: chrono::Duration) -> Result<u64, StoreError> {
        Ok(0)
    }
}

#[tokio::test]
async fn store_failure_still_returns_the_run() {
    let (clock, shared) = manual_clock();
    let mut session = ProfilingSession::builder(config(ProfilingDepth::Minimal))
        .clock(shared)
        .power_mode(PowerMode::Disabled)
        .store(Arc::new(BrokenStore))
        .start()
        .unwrap();
    session.monitor().feed(PowerSample::with_total(0.0, 500.0));
    session.enter_phase(Phase::Prefill).unwrap();
    clock.set(100.0);
    session.token_emitted(0, "a").unwrap();
    session.exit_phase(Phase::Prefill).unwrap();

    let run = session.close().await.unwrap();
    assert_eq!(run.tokens.len(), 1);
    assert!((run.tokens[0].energy_mj.unwrap() - 50.0).abs() < 1e-9);
    assert!(session.is_closed());
}

#[tokio::test]
async fn abort_mid_decode_stops_sampling_and_persists_a_partial_run() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let cfg = ProfilerConfig {
        sample_interval_ms: 5,
        ..config(ProfilingDepth::Minimal)
    };
    let mut session = ProfilingSession::builder(cfg)
        .power_source(SyntheticSource::default())
        .power_mode(PowerMode::Required)
        .store(store.clone())
        .start()
        .unwrap();
    assert!(session.monitor().has_worker());

    session.enter_phase(Phase::Prefill).unwrap();
    session.token_emitted(0, "a").unwrap();
    session.exit_phase(Phase::Prefill).unwrap();
    session.enter_phase(Phase::Decode).unwrap();
    for i in 1..4u32 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.token_emitted(i, "b").unwrap();
    }
    let run = session.abort().await.unwrap();

    assert!(!session.monitor().has_worker());
    assert!(session.is_closed());
    assert!(run.partial);
    assert!(!run.power_samples.is_empty());
    assert_eq!(run.phase_sections().last().unwrap().phase, Phase::Decode);

    let stored = store.get(run.id).await.unwrap().unwrap();
    assert!(stored.partial);
    assert_eq!(stored.tokens.len(), 4);
    assert_eq!(stored, run);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_session_is_persisted_as_partial() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let cfg = ProfilerConfig {
        sample_interval_ms: 5,
        ..config(ProfilingDepth::Minimal)
    };
    let mut session = ProfilingSession::builder(cfg)
        .power_source(SyntheticSource::default())
        .power_mode(PowerMode::Required)
        .store(store.clone())
        .start()
        .unwrap();
    session.enter_phase(Phase::Decode).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    session.token_emitted(0, "x").unwrap();
    session.token_emitted(1, "y").unwrap();
    let id = session.id();
    drop(session);

    for _ in 0..200 {
        if let Some(run) = store.get(id).await.unwrap() {
            assert!(run.partial);
            assert_eq!(run.tokens.len(), 2);
            assert_eq!(run.sections.len(), 1);
            assert!(!run.power_samples.is_empty());
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dropped run {id} was never persisted");
}

#[tokio::test]
async fn prefill_pass_lands_on_the_last_prompt_token() {
    let mut model = DemoTransformer::tiny(3).unwrap();
    let mut session = ProfilingSession::builder(config(ProfilingDepth::Module))
        .power_mode(PowerMode::Disabled)
        .start()
        .unwrap();
    model.profile(&mut session, "abc", 1).unwrap();
    let run = session.close().await.unwrap();

    let prefill: Vec<_> = run
        .tokens
        .iter()
        .filter(|t| t.phase == Phase::Prefill)
        .collect();
    assert_eq!(prefill.len(), 3);
    let (last, leading) = prefill.split_last().unwrap();
    assert!(leading.iter().all(|t| t.layers.is_empty()));
    assert_eq!(last.position, 2);
    assert_eq!(last.layers.len(), model.config().num_hidden_layers);
}

#[tokio::test]
async fn demo_transformer_profile_at_operation_depth() {
    let mut model = DemoTransformer::tiny(11).unwrap();
    let sink = MemorySink::new();
    let mut session = ProfilingSession::builder(config(ProfilingDepth::Operation))
        .power_mode(PowerMode::Disabled)
        .model(DemoTransformer::NAME)
        .model_features(model.features())
        .sink(sink.clone())
        .start()
        .unwrap();

    let (_, depth) = model.profile(&mut session, "hi", 3).unwrap();
    assert_eq!(depth, ProfilingDepth::Operation);
    let run = session.close().await.unwrap();

    let phases: Vec<Phase> = run.phase_sections().map(|s| s.phase).collect();
    assert_eq!(phases, Phase::ACTIVE.to_vec());
    assert_eq!(run.summary.input_tokens, 2);
    assert_eq!(run.summary.output_tokens, 3);

    // Each decode token ran one full forward pass through both layers.
    for token in run.tokens.iter().filter(|t| t.phase == Phase::Decode) {
        assert_eq!(token.layers.len(), 2);
        for layer in &token.layers {
            let core = layer
                .components
                .iter()
                .find(|c| c.path.ends_with("self_attn.core"))
                .unwrap();
            assert!(core.operations.iter().any(|o| o.name == "softmax"));
        }
    }
    let names = sink.names();
    assert!(names.contains(&"operation_metrics"));
    assert_eq!(names.last(), Some(&"inference_complete"));
}
