//! SQLite schema for the run hierarchy.
//!
//! Timestamps are integer milliseconds since the Unix epoch. Statistics, extras and
//! snapshots are JSON text columns; everything queried or sorted on is a real column.

use sqlx::SqlitePool;

pub const SCHEMA_VERSION: i64 = 1;

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS profiling_runs (
        id TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL,
        model_id TEXT NOT NULL,
        prompt TEXT NOT NULL,
        experiment TEXT,
        requested_depth TEXT NOT NULL,
        effective_depth TEXT NOT NULL,
        partial INTEGER NOT NULL,
        sample_interval_ms REAL NOT NULL,
        duration_ms REAL NOT NULL,
        energy_mj REAL,
        tokens_per_joule REAL,
        summary_json TEXT NOT NULL,
        model_features_json TEXT,
        baseline_json TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_runs_created ON profiling_runs(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_runs_model ON profiling_runs(model_id)",
    "CREATE TABLE IF NOT EXISTS run_tags (
        run_id TEXT NOT NULL REFERENCES profiling_runs(id) ON DELETE CASCADE,
        tag TEXT NOT NULL,
        PRIMARY KEY (run_id, tag)
    )",
    "CREATE INDEX IF NOT EXISTS idx_tags_tag ON run_tags(tag)",
    "CREATE TABLE IF NOT EXISTS power_samples (
        id INTEGER PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES profiling_runs(id) ON DELETE CASCADE,
        offset_ms REAL NOT NULL,
        cpu_mw REAL NOT NULL,
        gpu_mw REAL NOT NULL,
        ane_mw REAL NOT NULL,
        dram_mw REAL NOT NULL,
        total_mw REAL NOT NULL,
        phase TEXT NOT NULL,
        UNIQUE (run_id, offset_ms)
    )",
    "CREATE TABLE IF NOT EXISTS pipeline_sections (
        id INTEGER PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES profiling_runs(id) ON DELETE CASCADE,
        phase TEXT NOT NULL,
        name TEXT NOT NULL,
        depth INTEGER NOT NULL,
        start_ms REAL NOT NULL,
        end_ms REAL NOT NULL,
        duration_ms REAL NOT NULL,
        energy_mj REAL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sections_run ON pipeline_sections(run_id)",
    "CREATE TABLE IF NOT EXISTS tokens (
        id INTEGER PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES profiling_runs(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        text TEXT NOT NULL,
        phase TEXT NOT NULL,
        start_ms REAL NOT NULL,
        end_ms REAL NOT NULL,
        duration_ms REAL NOT NULL,
        energy_mj REAL,
        power_snapshot_json TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_tokens_run ON tokens(run_id)",
    "CREATE TABLE IF NOT EXISTS layer_metrics (
        id INTEGER PRIMARY KEY,
        token_id INTEGER NOT NULL REFERENCES tokens(id) ON DELETE CASCADE,
        layer_index INTEGER NOT NULL,
        total_ms REAL NOT NULL,
        attention_ms REAL NOT NULL,
        mlp_ms REAL NOT NULL,
        norm_ms REAL NOT NULL,
        stats_json TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_layers_token ON layer_metrics(token_id)",
    "CREATE TABLE IF NOT EXISTS component_metrics (
        id INTEGER PRIMARY KEY,
        layer_metric_id INTEGER NOT NULL REFERENCES layer_metrics(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        kind TEXT NOT NULL,
        duration_ms REAL NOT NULL,
        calls INTEGER NOT NULL,
        stats_json TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_components_layer ON component_metrics(layer_metric_id)",
    "CREATE TABLE IF NOT EXISTS operation_metrics (
        id INTEGER PRIMARY KEY,
        component_metric_id INTEGER NOT NULL REFERENCES component_metrics(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        duration_ms REAL NOT NULL,
        calls INTEGER NOT NULL,
        flops INTEGER NOT NULL,
        stats_json TEXT,
        extras_json TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_operations_component ON operation_metrics(component_metric_id)",
];

/// Create missing tables and indexes and record the schema version.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for stmt in STATEMENTS {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}
