//! SQLite-backed [`ProfileStore`].
//!
//! A run is written in one transaction: the run row first (taking the write lock),
//! then every child table through multi-row `INSERT`s. Child ids are assigned here,
//! above the current maximum, so nested rows can reference their parents without a
//! round trip per row.

use super::schema;
use super::{ProfileStore, RunFilter, SortKey};
use crate::errors::{EntityKind, StoreError};
use crate::instrument::{ComponentKind, OpKind, ProfilingDepth};
use crate::power::PowerSample;
use crate::profiling::{
    normalize_tags, ComponentMetric, DeepOperationMetric, LayerMetric, Phase, PipelineSection,
    ProfilingRun, RunOverview, Token,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Maximum bound parameters per statement.
const BIND_LIMIT: usize = 32_766;

const TAG_SEPARATOR: char = '\u{1f}';

const RUN_COLUMNS: &str = "r.id, r.created_at, r.model_id, r.prompt, r.experiment, \
    r.requested_depth, r.effective_depth, r.partial, r.sample_interval_ms, r.summary_json, \
    r.model_features_json, r.baseline_json, \
    (SELECT group_concat(t.tag, char(31)) FROM run_tags t WHERE t.run_id = r.id) AS tags";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    location: String,
}

impl SqliteStore {
    /// Open (creating if needed) a database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let location = path.display().to_string();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::StorageUnavailable {
                location: location.clone(),
                source,
            })?;
        Self::init(pool, location).await
    }

    /// Private in-memory database, for tests and throwaway sessions.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let location = ":memory:".to_string();
        let unavailable = |source| StoreError::StorageUnavailable {
            location: location.clone(),
            source,
        };
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(unavailable)?
            .foreign_keys(true);
        // A single connection that never expires, or the database disappears with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(unavailable)?;
        Self::init(pool, location).await
    }

    async fn init(pool: SqlitePool, location: String) -> Result<Self, StoreError> {
        schema::migrate(&pool)
            .await
            .map_err(|source| StoreError::StorageUnavailable {
                location: location.clone(),
                source,
            })?;
        info!(location = %location, "profile store opened");
        Ok(Self { pool, location })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn persist(entity: EntityKind) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Persistence { entity, source }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

fn opt_json<T: Serialize>(value: &Option<T>) -> Result<Option<String>, StoreError> {
    value.as_ref().map(to_json).transpose()
}

fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_str(text)?)
}

fn opt_from_json<T: DeserializeOwned>(text: Option<&str>) -> Result<Option<T>, StoreError> {
    text.map(from_json).transpose()
}

fn parse<T: FromStr<Err = String>>(text: &str) -> Result<T, StoreError> {
    text.parse().map_err(StoreError::Corrupt)
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

async fn max_id(tx: &mut Transaction<'_, Sqlite>, table: &str) -> Result<i64, StoreError> {
    let id = sqlx::query_scalar::<_, i64>(&format!("SELECT COALESCE(MAX(id), 0) FROM {table}"))
        .fetch_one(&mut **tx)
        .await?;
    Ok(id)
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: String,
    created_at: i64,
    model_id: String,
    prompt: String,
    experiment: Option<String>,
    requested_depth: String,
    effective_depth: String,
    partial: bool,
    sample_interval_ms: f64,
    summary_json: String,
    model_features_json: Option<String>,
    baseline_json: Option<String>,
    tags: Option<String>,
}

impl RunRow {
    fn created_at(&self) -> Result<DateTime<Utc>, StoreError> {
        Utc.timestamp_millis_opt(self.created_at)
            .single()
            .ok_or_else(|| StoreError::Corrupt(format!("bad timestamp {}", self.created_at)))
    }

    fn overview(&self) -> Result<RunOverview, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupt(format!("run id '{}': {e}", self.id)))?;
        let tags = normalize_tags(
            self.tags
                .as_deref()
                .map(|t| t.split(TAG_SEPARATOR).collect::<Vec<_>>())
                .unwrap_or_default(),
        );
        Ok(RunOverview {
            id,
            created_at: self.created_at()?,
            model_id: self.model_id.clone(),
            prompt: self.prompt.clone(),
            experiment: self.experiment.clone(),
            tags,
            requested_depth: parse::<ProfilingDepth>(&self.requested_depth)?,
            effective_depth: parse::<ProfilingDepth>(&self.effective_depth)?,
            partial: self.partial,
            summary: from_json(&self.summary_json)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct SampleRow {
    offset_ms: f64,
    cpu_mw: f64,
    gpu_mw: f64,
    ane_mw: f64,
    dram_mw: f64,
    total_mw: f64,
    phase: String,
}

#[derive(Debug, FromRow)]
struct SectionRow {
    phase: String,
    name: String,
    depth: i64,
    start_ms: f64,
    end_ms: f64,
    duration_ms: f64,
    energy_mj: Option<f64>,
}

#[derive(Debug, FromRow)]
struct TokenRow {
    id: i64,
    position: i64,
    text: String,
    phase: String,
    start_ms: f64,
    end_ms: f64,
    duration_ms: f64,
    energy_mj: Option<f64>,
    power_snapshot_json: Option<String>,
}

#[derive(Debug, FromRow)]
struct LayerRow {
    id: i64,
    token_id: i64,
    layer_index: i64,
    total_ms: f64,
    attention_ms: f64,
    mlp_ms: f64,
    norm_ms: f64,
    stats_json: Option<String>,
}

#[derive(Debug, FromRow)]
struct ComponentRow {
    id: i64,
    layer_metric_id: i64,
    name: String,
    path: String,
    kind: String,
    duration_ms: f64,
    calls: i64,
    stats_json: Option<String>,
}

#[derive(Debug, FromRow)]
struct OperationRow {
    component_metric_id: i64,
    name: String,
    kind: String,
    duration_ms: f64,
    calls: i64,
    flops: i64,
    stats_json: Option<String>,
    extras_json: String,
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn save(&self, run: &ProfilingRun) -> Result<(), StoreError> {
        let run_id = run.id.to_string();
        let summary_json = to_json(&run.summary)?;
        let features_json = opt_json(&run.model_features)?;
        let baseline_json = opt_json(&run.baseline)?;

        let mut tx = self.pool.begin().await.map_err(persist(EntityKind::Run))?;
        sqlx::query(
            "INSERT INTO profiling_runs (id, created_at, model_id, prompt, experiment, \
             requested_depth, effective_depth, partial, sample_interval_ms, duration_ms, \
             energy_mj, tokens_per_joule, summary_json, model_features_json, baseline_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run_id)
        .bind(run.created_at.timestamp_millis())
        .bind(&run.model_id)
        .bind(&run.prompt)
        .bind(&run.experiment)
        .bind(run.requested_depth.as_str())
        .bind(run.effective_depth.as_str())
        .bind(run.partial)
        .bind(run.sample_interval_ms)
        .bind(run.summary.duration_ms)
        .bind(run.summary.energy_mj)
        .bind(run.summary.tokens_per_joule)
        .bind(&summary_json)
        .bind(&features_json)
        .bind(&baseline_json)
        .execute(&mut *tx)
        .await
        .map_err(persist(EntityKind::Run))?;

        let tags = normalize_tags(&run.tags);
        if !tags.is_empty() {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("INSERT INTO run_tags (run_id, tag) ");
            qb.push_values(&tags, |mut b, tag| {
                b.push_bind(run_id.as_str()).push_bind(tag.as_str());
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(persist(EntityKind::Tag))?;
        }

        for chunk in run.power_samples.chunks(BIND_LIMIT / 8) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO power_samples (run_id, offset_ms, cpu_mw, gpu_mw, ane_mw, dram_mw, total_mw, phase) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(run_id.as_str())
                    .push_bind(s.offset_ms)
                    .push_bind(s.cpu_mw)
                    .push_bind(s.gpu_mw)
                    .push_bind(s.ane_mw)
                    .push_bind(s.dram_mw)
                    .push_bind(s.total_mw)
                    .push_bind(s.phase.as_str());
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(persist(EntityKind::PowerSample))?;
        }

        for chunk in run.sections.chunks(BIND_LIMIT / 8) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO pipeline_sections (run_id, phase, name, depth, start_ms, end_ms, duration_ms, energy_mj) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(run_id.as_str())
                    .push_bind(s.phase.as_str())
                    .push_bind(s.name.as_str())
                    .push_bind(i64::from(s.depth))
                    .push_bind(s.start_ms)
                    .push_bind(s.end_ms)
                    .push_bind(s.duration_ms)
                    .push_bind(s.energy_mj);
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(persist(EntityKind::Section))?;
        }

        // Flatten the token tree with explicit ids.
        let mut next_token = max_id(&mut tx, "tokens").await?;
        let mut next_layer = max_id(&mut tx, "layer_metrics").await?;
        let mut next_component = max_id(&mut tx, "component_metrics").await?;
        let mut tokens: Vec<(i64, &Token, Option<String>)> = Vec::with_capacity(run.tokens.len());
        let mut layers: Vec<(i64, i64, &LayerMetric, Option<String>)> = Vec::new();
        let mut components: Vec<(i64, i64, &ComponentMetric, Option<String>)> = Vec::new();
        let mut operations: Vec<(i64, &DeepOperationMetric, Option<String>, String)> = Vec::new();
        for token in &run.tokens {
            next_token += 1;
            tokens.push((next_token, token, opt_json(&token.power_snapshot)?));
            for layer in &token.layers {
                next_layer += 1;
                layers.push((next_layer, next_token, layer, opt_json(&layer.stats)?));
                for component in &layer.components {
                    next_component += 1;
                    components.push((next_component, next_layer, component, opt_json(&component.stats)?));
                    for op in &component.operations {
                        operations.push((next_component, op, opt_json(&op.stats)?, to_json(&op.extras)?));
                    }
                }
            }
        }

        for chunk in tokens.chunks(BIND_LIMIT / 11) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO tokens (id, run_id, position, text, phase, start_ms, end_ms, duration_ms, energy_mj, power_snapshot_json) ",
            );
            qb.push_values(chunk, |mut b, (id, t, snapshot)| {
                b.push_bind(*id)
                    .push_bind(run_id.as_str())
                    .push_bind(i64::from(t.position))
                    .push_bind(t.text.as_str())
                    .push_bind(t.phase.as_str())
                    .push_bind(t.start_ms)
                    .push_bind(t.end_ms)
                    .push_bind(t.duration_ms)
                    .push_bind(t.energy_mj)
                    .push_bind(snapshot.as_deref());
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(persist(EntityKind::Token))?;
        }

        for chunk in layers.chunks(BIND_LIMIT / 8) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO layer_metrics (id, token_id, layer_index, total_ms, attention_ms, mlp_ms, norm_ms, stats_json) ",
            );
            qb.push_values(chunk, |mut b, (id, token_id, l, stats)| {
                b.push_bind(*id)
                    .push_bind(*token_id)
                    .push_bind(i64::from(l.layer_index))
                    .push_bind(l.total_ms)
                    .push_bind(l.attention_ms)
                    .push_bind(l.mlp_ms)
                    .push_bind(l.norm_ms)
                    .push_bind(stats.as_deref());
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(persist(EntityKind::LayerMetric))?;
        }

        for chunk in components.chunks(BIND_LIMIT / 8) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO component_metrics (id, layer_metric_id, name, path, kind, duration_ms, calls, stats_json) ",
            );
            qb.push_values(chunk, |mut b, (id, layer_id, c, stats)| {
                b.push_bind(*id)
                    .push_bind(*layer_id)
                    .push_bind(c.name.as_str())
                    .push_bind(c.path.as_str())
                    .push_bind(c.kind.as_str())
                    .push_bind(c.duration_ms)
                    .push_bind(i64::from(c.calls))
                    .push_bind(stats.as_deref());
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(persist(EntityKind::ComponentMetric))?;
        }

        for chunk in operations.chunks(BIND_LIMIT / 8) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO operation_metrics (component_metric_id, name, kind, duration_ms, calls, flops, stats_json, extras_json) ",
            );
            qb.push_values(chunk, |mut b, (component_id, op, stats, extras)| {
                b.push_bind(*component_id)
                    .push_bind(op.name.as_str())
                    .push_bind(op.kind.as_str())
                    .push_bind(op.duration_ms)
                    .push_bind(i64::from(op.calls))
                    .push_bind(i64::try_from(op.flops).unwrap_or(i64::MAX))
                    .push_bind(stats.as_deref())
                    .push_bind(extras.as_str());
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(persist(EntityKind::OperationMetric))?;
        }

        tx.commit().await.map_err(persist(EntityKind::Run))?;
        debug!(
            run_id = %run.id,
            samples = run.power_samples.len(),
            sections = run.sections.len(),
            tokens = tokens.len(),
            layers = layers.len(),
            components = components.len(),
            operations = operations.len(),
            "run saved"
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ProfilingRun>, StoreError> {
        let run_id = id.to_string();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM profiling_runs r WHERE r.id = ?"
        ))
        .bind(&run_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let overview = row.overview()?;

        let power_samples = sqlx::query_as::<_, SampleRow>(
            "SELECT offset_ms, cpu_mw, gpu_mw, ane_mw, dram_mw, total_mw, phase \
             FROM power_samples WHERE run_id = ? ORDER BY offset_ms",
        )
        .bind(&run_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|s| -> Result<PowerSample, StoreError> {
            Ok(PowerSample {
                offset_ms: s.offset_ms,
                cpu_mw: s.cpu_mw,
                gpu_mw: s.gpu_mw,
                ane_mw: s.ane_mw,
                dram_mw: s.dram_mw,
                total_mw: s.total_mw,
                phase: parse::<Phase>(&s.phase)?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

        let sections = sqlx::query_as::<_, SectionRow>(
            "SELECT phase, name, depth, start_ms, end_ms, duration_ms, energy_mj \
             FROM pipeline_sections WHERE run_id = ? ORDER BY id",
        )
        .bind(&run_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|s| -> Result<PipelineSection, StoreError> {
            Ok(PipelineSection {
                phase: parse::<Phase>(&s.phase)?,
                name: s.name,
                depth: to_u32(s.depth, "depth")?,
                start_ms: s.start_ms,
                end_ms: s.end_ms,
                duration_ms: s.duration_ms,
                energy_mj: s.energy_mj,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

        let mut operations: HashMap<i64, Vec<DeepOperationMetric>> = HashMap::new();
        for o in sqlx::query_as::<_, OperationRow>(
            "SELECT o.component_metric_id, o.name, o.kind, o.duration_ms, o.calls, o.flops, \
             o.stats_json, o.extras_json FROM operation_metrics o \
             JOIN component_metrics c ON o.component_metric_id = c.id \
             JOIN layer_metrics l ON c.layer_metric_id = l.id \
             JOIN tokens t ON l.token_id = t.id WHERE t.run_id = ? ORDER BY o.id",
        )
        .bind(&run_id)
        .fetch_all(&mut *tx)
        .await?
        {
            operations
                .entry(o.component_metric_id)
                .or_default()
                .push(DeepOperationMetric {
                    name: o.name,
                    kind: parse::<OpKind>(&o.kind)?,
                    duration_ms: o.duration_ms,
                    calls: to_u32(o.calls, "calls")?,
                    flops: u64::try_from(o.flops).unwrap_or(0),
                    stats: opt_from_json(o.stats_json.as_deref())?,
                    extras: from_json(&o.extras_json)?,
                });
        }

        let mut components: HashMap<i64, Vec<ComponentMetric>> = HashMap::new();
        for c in sqlx::query_as::<_, ComponentRow>(
            "SELECT c.id, c.layer_metric_id, c.name, c.path, c.kind, c.duration_ms, c.calls, \
             c.stats_json FROM component_metrics c \
             JOIN layer_metrics l ON c.layer_metric_id = l.id \
             JOIN tokens t ON l.token_id = t.id WHERE t.run_id = ? ORDER BY c.id",
        )
        .bind(&run_id)
        .fetch_all(&mut *tx)
        .await?
        {
            components
                .entry(c.layer_metric_id)
                .or_default()
                .push(ComponentMetric {
                    name: c.name,
                    path: c.path,
                    kind: parse::<ComponentKind>(&c.kind)?,
                    duration_ms: c.duration_ms,
                    calls: to_u32(c.calls, "calls")?,
                    stats: opt_from_json(c.stats_json.as_deref())?,
                    operations: operations.remove(&c.id).unwrap_or_default(),
                });
        }

        let mut layers: HashMap<i64, Vec<LayerMetric>> = HashMap::new();
        for l in sqlx::query_as::<_, LayerRow>(
            "SELECT l.id, l.token_id, l.layer_index, l.total_ms, l.attention_ms, l.mlp_ms, \
             l.norm_ms, l.stats_json FROM layer_metrics l \
             JOIN tokens t ON l.token_id = t.id WHERE t.run_id = ? ORDER BY l.id",
        )
        .bind(&run_id)
        .fetch_all(&mut *tx)
        .await?
        {
            layers.entry(l.token_id).or_default().push(LayerMetric {
                layer_index: to_u32(l.layer_index, "layer_index")?,
                total_ms: l.total_ms,
                attention_ms: l.attention_ms,
                mlp_ms: l.mlp_ms,
                norm_ms: l.norm_ms,
                stats: opt_from_json(l.stats_json.as_deref())?,
                components: components.remove(&l.id).unwrap_or_default(),
            });
        }

        let tokens = sqlx::query_as::<_, TokenRow>(
            "SELECT id, position, text, phase, start_ms, end_ms, duration_ms, energy_mj, \
             power_snapshot_json FROM tokens WHERE run_id = ? ORDER BY id",
        )
        .bind(&run_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|t| -> Result<Token, StoreError> {
            Ok(Token {
                position: to_u32(t.position, "position")?,
                text: t.text,
                phase: parse::<Phase>(&t.phase)?,
                start_ms: t.start_ms,
                end_ms: t.end_ms,
                duration_ms: t.duration_ms,
                energy_mj: t.energy_mj,
                power_snapshot: opt_from_json(t.power_snapshot_json.as_deref())?,
                layers: layers.remove(&t.id).unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
        tx.commit().await?;

        Ok(Some(ProfilingRun {
            id: overview.id,
            created_at: overview.created_at,
            model_id: overview.model_id,
            prompt: overview.prompt,
            experiment: overview.experiment,
            tags: overview.tags,
            requested_depth: overview.requested_depth,
            effective_depth: overview.effective_depth,
            partial: overview.partial,
            sample_interval_ms: row.sample_interval_ms,
            model_features: opt_from_json(row.model_features_json.as_deref())?,
            baseline: opt_from_json(row.baseline_json.as_deref())?,
            summary: overview.summary,
            power_samples,
            sections,
            tokens,
        }))
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunOverview>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM profiling_runs r WHERE 1 = 1"));
        if let Some(model) = &filter.model {
            qb.push(" AND r.model_id = ").push_bind(model.as_str());
        }
        if let Some(experiment) = &filter.experiment {
            qb.push(" AND r.experiment = ").push_bind(experiment.as_str());
        }
        if let Some(from) = filter.from {
            qb.push(" AND r.created_at >= ").push_bind(from.timestamp_millis());
        }
        if let Some(to) = filter.to {
            qb.push(" AND r.created_at < ").push_bind(to.timestamp_millis());
        }
        let tags = normalize_tags(&filter.tags);
        if !tags.is_empty() {
            qb.push(" AND (SELECT COUNT(*) FROM run_tags t WHERE t.run_id = r.id AND t.tag IN (");
            let mut in_list = qb.separated(", ");
            for tag in &tags {
                in_list.push_bind(tag.as_str());
            }
            in_list.push_unseparated(")) = ");
            qb.push_bind(tags.len() as i64);
        }
        let column = match filter.sort_by {
            SortKey::Date => "r.created_at",
            SortKey::Duration => "r.duration_ms",
            SortKey::Energy => "r.energy_mj",
            SortKey::Efficiency => "r.tokens_per_joule",
        };
        qb.push(format!(
            " ORDER BY {column} {order}, r.id {order} LIMIT ",
            order = filter.sort_order
        ));
        qb.push_bind(filter.limit.map(i64::from).unwrap_or(-1));
        qb.push(" OFFSET ").push_bind(i64::from(filter.offset));

        qb.build_query_as::<RunRow>()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(RunRow::overview)
            .collect()
    }

    async fn summarize(&self, id: Uuid) -> Result<Option<RunOverview>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM profiling_runs r WHERE r.id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(RunRow::overview).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM profiling_runs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            info!(run_id = %id, "run deleted");
        }
        Ok(removed)
    }

    async fn cleanup(&self, older_than: chrono::Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - older_than;
        let result = sqlx::query("DELETE FROM profiling_runs WHERE created_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        info!(
            removed = result.rows_affected(),
            cutoff = %cutoff,
            "retention cleanup"
        );
        Ok(result.rows_affected())
    }
}
