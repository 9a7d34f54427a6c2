//! Flat export of one run.

use crate::errors::StoreError;
use crate::instrument::ActivationStats;
use crate::profiling::ProfilingRun;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// The full run tree.
    #[default]
    Json,
    /// One row per section, token, layer, component and operation.
    Csv,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unknown export format '{other}' (expected json or csv)")),
        }
    }
}

pub fn export_run(run: &ProfilingRun, format: ExportFormat) -> Result<String, StoreError> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(run)?),
        ExportFormat::Csv => Ok(export_csv(run)),
    }
}

const CSV_HEADER: &str = "record_type,token_position,layer_index,component,operation,phase,name,\
start_ms,end_ms,duration_ms,energy_mj,calls,flops,mean_abs,std,max_abs,sparsity";

#[derive(Default)]
struct CsvRow<'a> {
    record_type: &'a str,
    token_position: Option<u32>,
    layer_index: Option<u32>,
    component: &'a str,
    operation: &'a str,
    phase: &'a str,
    name: &'a str,
    start_ms: Option<f64>,
    end_ms: Option<f64>,
    duration_ms: Option<f64>,
    energy_mj: Option<f64>,
    calls: Option<u32>,
    flops: Option<u64>,
    stats: Option<ActivationStats>,
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

impl CsvRow<'_> {
    fn write(&self, out: &mut String) {
        let stats = self.stats.as_ref();
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.record_type,
            opt(self.token_position),
            opt(self.layer_index),
            escape(self.component),
            escape(self.operation),
            self.phase,
            escape(self.name),
            opt(self.start_ms),
            opt(self.end_ms),
            opt(self.duration_ms),
            opt(self.energy_mj),
            opt(self.calls),
            opt(self.flops),
            opt(stats.map(|s| s.mean_abs)),
            opt(stats.map(|s| s.std)),
            opt(stats.map(|s| s.max_abs)),
            opt(stats.map(|s| s.sparsity)),
        );
    }
}

fn export_csv(run: &ProfilingRun) -> String {
    let mut out = String::with_capacity(256 * (run.sections.len() + run.tokens.len() + 1));
    out.push_str(CSV_HEADER);
    out.push('\n');

    CsvRow {
        record_type: "run",
        name: &run.model_id,
        start_ms: Some(0.0),
        duration_ms: Some(run.summary.duration_ms),
        energy_mj: run.summary.energy_mj,
        ..Default::default()
    }
    .write(&mut out);

    for s in &run.sections {
        CsvRow {
            record_type: "section",
            phase: s.phase.as_str(),
            name: &s.name,
            start_ms: Some(s.start_ms),
            end_ms: Some(s.end_ms),
            duration_ms: Some(s.duration_ms),
            energy_mj: s.energy_mj,
            ..Default::default()
        }
        .write(&mut out);
    }

    for t in &run.tokens {
        CsvRow {
            record_type: "token",
            token_position: Some(t.position),
            phase: t.phase.as_str(),
            name: &t.text,
            start_ms: Some(t.start_ms),
            end_ms: Some(t.end_ms),
            duration_ms: Some(t.duration_ms),
            energy_mj: t.energy_mj,
            ..Default::default()
        }
        .write(&mut out);
        for l in &t.layers {
            CsvRow {
                record_type: "layer",
                token_position: Some(t.position),
                layer_index: Some(l.layer_index),
                phase: t.phase.as_str(),
                duration_ms: Some(l.total_ms),
                stats: l.stats,
                ..Default::default()
            }
            .write(&mut out);
            for c in &l.components {
                CsvRow {
                    record_type: "component",
                    token_position: Some(t.position),
                    layer_index: Some(l.layer_index),
                    component: &c.path,
                    phase: t.phase.as_str(),
                    name: c.kind.as_str(),
                    duration_ms: Some(c.duration_ms),
                    calls: Some(c.calls),
                    stats: c.stats,
                    ..Default::default()
                }
                .write(&mut out);
                for o in &c.operations {
                    CsvRow {
                        record_type: "operation",
                        token_position: Some(t.position),
                        layer_index: Some(l.layer_index),
                        component: &c.path,
                        operation: &o.name,
                        phase: t.phase.as_str(),
                        name: o.kind.as_str(),
                        duration_ms: Some(o.duration_ms),
                        calls: Some(o.calls),
                        flops: Some(o.flops),
                        stats: o.stats,
                        ..Default::default()
                    }
                    .write(&mut out);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_escaping() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::Json.content_type(), "application/json");
    }
}
