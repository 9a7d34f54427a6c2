//! Persistence of profiling runs and historical queries.

pub mod export;
pub mod schema;
pub mod sqlite;

pub use export::{export_run, ExportFormat};
pub use sqlite::SqliteStore;

use crate::errors::StoreError;
use crate::profiling::{ProfilingRun, RunOverview};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Date,
    Duration,
    Energy,
    /// Tokens per joule.
    Efficiency,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "date" | "created_at" => Ok(SortKey::Date),
            "duration" => Ok(SortKey::Duration),
            "energy" => Ok(SortKey::Energy),
            "efficiency" | "tokens_per_joule" => Ok(SortKey::Efficiency),
            other => Err(format!("unknown sort key '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order '{other}'")),
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        })
    }
}

/// Filter, sort and page for [`ProfileStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunFilter {
    /// Exact model identifier.
    pub model: Option<String>,
    /// A run matches only if it carries every listed tag.
    pub tags: Vec<String>,
    /// Inclusive lower bound on creation time.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on creation time.
    pub to: Option<DateTime<Utc>>,
    pub experiment: Option<String>,
    pub sort_by: SortKey,
    pub sort_order: SortOrder,
    pub offset: u32,
    pub limit: Option<u32>,
}

impl RunFilter {
    pub fn sorted(mut self, by: SortKey, order: SortOrder) -> Self {
        self.sort_by = by;
        self.sort_order = order;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Storage backend for profiling runs. A missing id is `Ok(None)` / `Ok(false)`.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Persist a whole run tree atomically.
    async fn save(&self, run: &ProfilingRun) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ProfilingRun>, StoreError>;

    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunOverview>, StoreError>;

    /// Run attributes and precomputed aggregates without child rows.
    async fn summarize(&self, id: Uuid) -> Result<Option<RunOverview>, StoreError>;

    /// Delete a run and its subtree. Returns whether a run was removed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Delete every run created before `now - older_than`. Returns how many.
    async fn cleanup(&self, older_than: chrono::Duration) -> Result<u64, StoreError>;
}
