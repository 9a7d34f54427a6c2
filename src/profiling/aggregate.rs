//! Turning raw observations into the metric hierarchy and run-level aggregates.

use super::types::{
    ComponentMetric, DeepOperationMetric, LayerMetric, Phase, PhaseSummary, PipelineSection,
    RunSummary, Token,
};
use crate::instrument::{ActivationStats, ComponentKind, ComponentRecord};
use crate::model::ModelFeatures;
use crate::power::{integrate_energy_mj, IdleBaseline, PowerSample};
use std::collections::BTreeMap;

/// Group one boundary's component observations into per-layer metrics, ordered by layer.
pub fn layers_from_records(records: Vec<ComponentRecord>) -> Vec<LayerMetric> {
    let mut by_layer: BTreeMap<usize, Vec<ComponentRecord>> = BTreeMap::new();
    for r in records {
        by_layer.entry(r.layer).or_default().push(r);
    }
    by_layer
        .into_iter()
        .map(|(layer, comps)| {
            let mut layer_metric = LayerMetric {
                layer_index: layer as u32,
                total_ms: 0.0,
                attention_ms: 0.0,
                mlp_ms: 0.0,
                norm_ms: 0.0,
                stats: None,
                components: Vec::with_capacity(comps.len()),
            };
            for c in comps {
                layer_metric.total_ms += c.duration_ms;
                match c.kind {
                    ComponentKind::Attention | ComponentKind::AttentionCore => {
                        layer_metric.attention_ms += c.duration_ms
                    }
                    ComponentKind::Mlp => layer_metric.mlp_ms += c.duration_ms,
                    ComponentKind::Norm => layer_metric.norm_ms += c.duration_ms,
                    ComponentKind::Other => {}
                }
                layer_metric.stats = ActivationStats::pool(layer_metric.stats, c.stats);
                layer_metric.components.push(ComponentMetric {
                    name: c.name,
                    path: c.path,
                    kind: c.kind,
                    duration_ms: c.duration_ms,
                    calls: c.calls,
                    stats: c.stats,
                    operations: c
                        .operations
                        .into_iter()
                        .map(|o| DeepOperationMetric {
                            name: o.name,
                            kind: o.kind,
                            duration_ms: o.duration_ms,
                            calls: o.calls,
                            flops: o.flops,
                            stats: o.stats,
                            extras: o.extras,
                        })
                        .collect(),
                });
            }
            layer_metric
        })
        .collect()
}

/// Tag each sample with the phase whose top-level section contains its offset.
pub fn tag_sample_phases(samples: &mut [PowerSample], sections: &[PipelineSection]) {
    let phases: Vec<&PipelineSection> = sections.iter().filter(|s| s.depth == 0).collect();
    for s in samples.iter_mut() {
        s.phase = phases
            .iter()
            .find(|sec| s.offset_ms >= sec.start_ms && s.offset_ms < sec.end_ms)
            .map(|sec| sec.phase)
            .unwrap_or(Phase::Idle);
    }
}

/// Recompute every section and token energy over the final sample set.
pub fn reintegrate(
    samples: &[PowerSample],
    hold_ms: f64,
    sections: &mut [PipelineSection],
    tokens: &mut [Token],
) {
    for s in sections.iter_mut() {
        s.energy_mj = integrate_energy_mj(samples, s.start_ms, s.end_ms, hold_ms);
    }
    for t in tokens.iter_mut() {
        t.energy_mj = integrate_energy_mj(samples, t.start_ms, t.end_ms, hold_ms);
    }
}

pub struct SummaryInputs<'a> {
    pub samples: &'a [PowerSample],
    pub sections: &'a [PipelineSection],
    pub tokens: &'a [Token],
    pub active_start_ms: f64,
    pub active_end_ms: f64,
    pub hold_ms: f64,
    /// Overrides the count of prefill token rows.
    pub input_tokens: Option<u32>,
    pub model_features: Option<&'a ModelFeatures>,
    pub baseline: Option<&'a IdleBaseline>,
}

fn per_token_j(energy_mj: Option<f64>, count: u32) -> Option<f64> {
    match (energy_mj, count) {
        (Some(mj), n) if n > 0 => Some(mj / 1000.0 / n as f64),
        _ => None,
    }
}

pub fn summarize(inputs: &SummaryInputs<'_>) -> RunSummary {
    let duration_ms = (inputs.active_end_ms - inputs.active_start_ms).max(0.0);
    let energy_mj = integrate_energy_mj(
        inputs.samples,
        inputs.active_start_ms,
        inputs.active_end_ms,
        inputs.hold_ms,
    );

    let phases: Vec<PhaseSummary> = Phase::ACTIVE
        .iter()
        .filter_map(|&phase| {
            let secs: Vec<&PipelineSection> = inputs
                .sections
                .iter()
                .filter(|s| s.depth == 0 && s.phase == phase)
                .collect();
            if secs.is_empty() {
                return None;
            }
            let energy = secs
                .iter()
                .map(|s| s.energy_mj)
                .try_fold(0.0, |acc, e| e.map(|e| acc + e));
            Some(PhaseSummary {
                phase,
                duration_ms: secs.iter().map(|s| s.duration_ms).sum(),
                energy_mj: energy,
            })
        })
        .collect();
    let phase_energy = |p: Phase| phases.iter().find(|s| s.phase == p).and_then(|s| s.energy_mj);

    let prefill_rows = inputs.tokens.iter().filter(|t| t.phase == Phase::Prefill).count() as u32;
    let input_tokens = inputs.input_tokens.unwrap_or(prefill_rows);
    let output_tokens = inputs.tokens.iter().filter(|t| t.phase == Phase::Decode).count() as u32;
    let token_rows = inputs.tokens.len() as u32;

    let energy_j = energy_mj.map(|mj| mj / 1000.0);
    let in_window = |s: &&PowerSample| {
        s.offset_ms >= inputs.active_start_ms && s.offset_ms <= inputs.active_end_ms
    };
    let peak_power_mw = inputs
        .samples
        .iter()
        .filter(in_window)
        .map(|s| s.total_mw)
        .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))));

    let baseline_power_mw = inputs.baseline.map(|b| b.power_mw);
    let net_energy_mj = match (energy_mj, baseline_power_mw) {
        (Some(e), Some(b)) => Some((e - b * duration_ms / 1000.0).max(0.0)),
        _ => None,
    };

    RunSummary {
        duration_ms,
        energy_mj,
        avg_power_mw: energy_mj.and_then(|e| crate::power::average_power_mw(e, duration_ms)),
        peak_power_mw,
        input_tokens,
        output_tokens,
        tokens_per_joule: energy_j.filter(|j| *j > 0.0).map(|j| token_rows as f64 / j),
        joules_per_token: per_token_j(energy_mj, token_rows),
        joules_per_input_token: per_token_j(phase_energy(Phase::Prefill), input_tokens),
        joules_per_output_token: per_token_j(phase_energy(Phase::Decode), output_tokens),
        energy_per_million_params_mj: match (energy_mj, inputs.model_features) {
            (Some(e), Some(f)) if f.total_params > 0 => Some(e / f.params_millions()),
            _ => None,
        },
        baseline_power_mw,
        net_energy_mj,
        sample_count: inputs.samples.iter().filter(in_window).count() as u32,
        phases,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{OpKind, OperationExtras, OperationRecord};

    fn section(phase: Phase, start: f64, end: f64) -> PipelineSection {
        PipelineSection {
            phase,
            name: phase.to_string(),
            depth: 0,
            start_ms: start,
            end_ms: end,
            duration_ms: end - start,
            energy_mj: None,
        }
    }

    fn token(position: u32, phase: Phase, start: f64, end: f64) -> Token {
        Token {
            position,
            text: String::new(),
            phase,
            start_ms: start,
            end_ms: end,
            duration_ms: end - start,
            energy_mj: None,
            power_snapshot: None,
            layers: Vec::new(),
        }
    }

    fn record(layer: usize, name: &str, kind: ComponentKind, ms: f64) -> ComponentRecord {
        ComponentRecord {
            path: format!("layers.{layer}.{name}"),
            layer,
            name: name.to_string(),
            kind,
            duration_ms: ms,
            calls: 1,
            stats: Some(ActivationStats::from_slice(&[1.0, -1.0], 1e-4)),
            operations: Vec::new(),
        }
    }

    #[test]
    fn layers_grouped_and_split_by_kind() {
        let mut core = record(0, "core", ComponentKind::AttentionCore, 0.5);
        core.operations.push(OperationRecord {
            name: "softmax".into(),
            kind: OpKind::Softmax,
            duration_ms: 0.1,
            calls: 4,
            flops: 100,
            stats: None,
            extras: OperationExtras::None,
        });
        let layers = layers_from_records(vec![
            record(1, "up_proj", ComponentKind::Mlp, 2.0),
            record(0, "q_proj", ComponentKind::Attention, 1.0),
            core,
            record(0, "input_layernorm", ComponentKind::Norm, 0.25),
        ]);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].layer_index, 0);
        assert_eq!(layers[0].attention_ms, 1.5);
        assert_eq!(layers[0].norm_ms, 0.25);
        assert_eq!(layers[0].total_ms, 1.75);
        assert_eq!(layers[0].stats.unwrap().elements, 6);
        assert_eq!(layers[0].components[1].operations[0].calls, 4);
        assert_eq!(layers[1].mlp_ms, 2.0);
    }

    #[test]
    fn sample_phase_tagging() {
        let mut samples = vec![
            PowerSample::with_total(0.0, 1.0),
            PowerSample::with_total(50.0, 1.0),
            PowerSample::with_total(150.0, 1.0),
            PowerSample::with_total(400.0, 1.0),
        ];
        let sections = vec![section(Phase::Prefill, 10.0, 100.0), section(Phase::Decode, 100.0, 300.0)];
        tag_sample_phases(&mut samples, &sections);
        let phases: Vec<Phase> = samples.iter().map(|s| s.phase).collect();
        assert_eq!(phases, vec![Phase::Idle, Phase::Prefill, Phase::Decode, Phase::Idle]);
    }

    #[test]
    fn summary_conserves_energy_and_splits_tokens() {
        let samples: Vec<PowerSample> = (0..=4)
            .map(|i| PowerSample::with_total(i as f64 * 100.0, 2000.0))
            .collect();
        let mut sections = vec![section(Phase::Prefill, 0.0, 100.0), section(Phase::Decode, 100.0, 400.0)];
        let mut tokens = vec![
            token(0, Phase::Prefill, 0.0, 100.0),
            token(1, Phase::Decode, 100.0, 250.0),
            token(2, Phase::Decode, 250.0, 400.0),
        ];
        reintegrate(&samples, 100.0, &mut sections, &mut tokens);
        let features = ModelFeatures::from_config(&crate::model::ArchitectureConfig::tiny(), "tiny", Some(2_000_000));
        let baseline = IdleBaseline::from_samples(&[PowerSample::with_total(0.0, 500.0)], 100.0).unwrap();
        let s = summarize(&SummaryInputs {
            samples: &samples,
            sections: &sections,
            tokens: &tokens,
            active_start_ms: 0.0,
            active_end_ms: 400.0,
            hold_ms: 100.0,
            input_tokens: None,
            model_features: Some(&features),
            baseline: Some(&baseline),
        });
        // 2000 mW for 400 ms
        assert!((s.energy_mj.unwrap() - 800.0).abs() < 1e-9);
        let section_sum: f64 = sections.iter().map(|x| x.energy_mj.unwrap()).sum();
        assert!((section_sum - 800.0).abs() < 1e-9);
        assert_eq!(s.input_tokens, 1);
        assert_eq!(s.output_tokens, 2);
        assert!((s.joules_per_token.unwrap() - 0.8 / 3.0).abs() < 1e-12);
        assert!((s.joules_per_input_token.unwrap() - 0.2).abs() < 1e-12);
        assert!((s.joules_per_output_token.unwrap() - 0.3).abs() < 1e-12);
        assert!((s.tokens_per_joule.unwrap() - 3.0 / 0.8).abs() < 1e-9);
        assert_eq!(s.avg_power_mw, Some(2000.0));
        assert_eq!(s.peak_power_mw, Some(2000.0));
        assert_eq!(s.energy_per_million_params_mj, Some(400.0));
        // 800 mJ - 500 mW * 0.4 s
        assert!((s.net_energy_mj.unwrap() - 600.0).abs() < 1e-9);
        assert_eq!(s.sample_count, 5);
        assert_eq!(s.phase(Phase::Decode).unwrap().duration_ms, 300.0);
    }

    #[test]
    fn no_samples_means_no_energy_but_timing() {
        let sections = vec![section(Phase::Prefill, 0.0, 50.0)];
        let s = summarize(&SummaryInputs {
            samples: &[],
            sections: &sections,
            tokens: &[],
            active_start_ms: 0.0,
            active_end_ms: 50.0,
            hold_ms: 100.0,
            input_tokens: Some(12),
            model_features: None,
            baseline: None,
        });
        assert_eq!(s.duration_ms, 50.0);
        assert_eq!(s.energy_mj, None);
        assert_eq!(s.avg_power_mw, None);
        assert_eq!(s.tokens_per_joule, None);
        assert_eq!(s.input_tokens, 12);
        assert_eq!(s.phases[0].energy_mj, None);
    }
}
