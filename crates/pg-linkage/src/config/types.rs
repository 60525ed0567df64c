//! Configuration types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dedup::MergeOrientation;
use crate::matcher::MatchStrategy;
use crate::merger::MergePlan;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection used for every job.
    pub database: DatabaseConfig,

    /// Capabilities the database provides (pg_trgm, helper functions).
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Jobs, run in declaration order.
    pub jobs: Vec<JobConfig>,
}

/// PostgreSQL connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password. Never serialized.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// SSL mode (default: "disable").
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// Pool size (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// What a job does with its matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Link source rows to target rows, then update and insert.
    #[default]
    Merge,

    /// Link a table to itself, then fold duplicates into survivors.
    Dedup,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Merge => "merge",
            JobKind::Dedup => "dedup",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A table referenced by a job.
///
/// When `columns` is omitted the table is described from the catalog at run
/// time. `primary_key` overrides (or supplies) the key column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name, optionally schema-qualified.
    pub table: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,

    /// PostgreSQL type of the key (default: "integer").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key_type: Option<String>,
}

impl TableConfig {
    pub fn declares_columns(&self) -> bool {
        self.columns.is_some()
    }
}

/// One merge or dedup job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,

    #[serde(default)]
    pub kind: JobKind,

    /// Incoming rows. Merge jobs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TableConfig>,

    /// Table receiving updates and inserts, or the table being deduplicated.
    pub target: TableConfig,

    #[serde(default)]
    pub matching: MatchStrategy,

    #[serde(default)]
    pub merge: MergePlan,

    /// Survivor ordering. Dedup jobs only.
    #[serde(default, skip_serializing_if = "is_default_orientation")]
    pub orientation: MergeOrientation,
}

impl JobConfig {
    /// Whether every table in the job declares its columns, so the job can be
    /// planned without a database.
    pub fn is_self_describing(&self) -> bool {
        self.target.declares_columns()
            && self.source.as_ref().map_or(true, TableConfig::declares_columns)
    }
}

fn is_default_orientation(orientation: &MergeOrientation) -> bool {
    orientation.rules.is_empty()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_max_connections() -> usize {
    4
}
