//! Resolved jobs: configuration plus table descriptors.

use tracing::debug;

use crate::capability::Capabilities;
use crate::config::{JobConfig, JobKind, TableConfig};
use crate::core::{PrimaryKey, SchemaSource, TableDescriptor, TargetDescriptor};
use crate::dedup::{self, MergeOrientation};
use crate::error::{LinkageError, Result};
use crate::matcher::MatchStrategy;
use crate::merger::MergePlan;

/// Key type assumed when a declared primary key has no declared type.
pub const DEFAULT_KEY_TYPE: &str = "integer";

/// Link `source` rows to `target` rows, then update and insert.
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub name: String,
    pub source: TableDescriptor,
    pub target: TargetDescriptor,
    pub strategy: MatchStrategy,
    pub plan: MergePlan,
}

/// Link a table to itself and fold duplicates into survivors.
#[derive(Debug, Clone)]
pub struct DedupJob {
    pub name: String,
    pub table: TargetDescriptor,
    pub strategy: MatchStrategy,
    pub plan: MergePlan,
    pub orientation: MergeOrientation,
}

impl DedupJob {
    /// The match strategy with orientation constraints applied.
    pub fn oriented_strategy(&self) -> Result<MatchStrategy> {
        self.orientation.apply(&self.strategy, &self.table)
    }
}

/// A job ready to plan.
#[derive(Debug, Clone)]
pub enum Job {
    Merge(MergeJob),
    Dedup(DedupJob),
}

impl Job {
    /// Build descriptors for a configured job.
    ///
    /// Tables with declared columns are used as declared. Others are described
    /// through `schema`; without one that is a configuration error.
    pub async fn resolve(config: &JobConfig, schema: Option<&dyn SchemaSource>) -> Result<Job> {
        let target = TargetDescriptor::new(describe(&config.target, schema).await?)?;

        let job = match config.kind {
            JobKind::Merge => {
                let source_config = config.source.as_ref().ok_or_else(|| {
                    LinkageError::Config(format!("job '{}' has no source table", config.name))
                })?;
                let source = describe(source_config, schema).await?;
                Job::Merge(MergeJob {
                    name: config.name.clone(),
                    source,
                    target,
                    strategy: config.matching.clone(),
                    plan: config.merge.clone(),
                })
            }
            JobKind::Dedup => Job::Dedup(DedupJob {
                name: config.name.clone(),
                table: target,
                strategy: config.matching.clone(),
                plan: config.merge.clone(),
                orientation: config.orientation.clone(),
            }),
        };

        debug!("Resolved {} job '{}'", job.kind(), job.name());
        Ok(job)
    }

    pub fn name(&self) -> &str {
        match self {
            Job::Merge(j) => &j.name,
            Job::Dedup(j) => &j.name,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::Merge(_) => JobKind::Merge,
            Job::Dedup(_) => JobKind::Dedup,
        }
    }

    /// Check every column, template and capability reference.
    pub fn validate(&self, capabilities: &Capabilities) -> Result<()> {
        match self {
            Job::Merge(j) => {
                j.strategy.validate(&j.source, &j.target, capabilities)?;
                j.plan.validate(&j.source, &j.target, capabilities)
            }
            Job::Dedup(j) => {
                j.oriented_strategy()?
                    .validate(j.table.table(), &j.table, capabilities)?;
                dedup::validate_plan(&j.plan, &j.table, capabilities)
            }
        }
    }
}

async fn describe(table: &TableConfig, schema: Option<&dyn SchemaSource>) -> Result<TableDescriptor> {
    let mut descriptor = match (&table.columns, schema) {
        (Some(columns), _) => TableDescriptor::new(table.table.clone(), columns.clone()),
        (None, Some(schema)) => schema.describe_table(&table.table).await?,
        (None, None) => {
            return Err(LinkageError::Config(format!(
                "columns of {} are not declared and no database connection is available",
                table.table
            )))
        }
    };

    if let Some(column) = &table.primary_key {
        let data_type = table
            .primary_key_type
            .clone()
            .or_else(|| {
                descriptor
                    .primary_key
                    .as_ref()
                    .filter(|pk| &pk.column == column)
                    .map(|pk| pk.data_type.clone())
            })
            .unwrap_or_else(|| DEFAULT_KEY_TYPE.to_string());
        descriptor.primary_key = Some(PrimaryKey::new(column.clone(), data_type));
    }

    descriptor.validate()?;
    Ok(descriptor)
}
