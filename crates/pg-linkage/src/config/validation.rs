//! Configuration validation.
//!
//! Structural checks only. Column references are checked against table
//! descriptors when a job is resolved.

use std::collections::HashSet;

use super::{Config, JobConfig, JobKind, TableConfig};
use crate::capability::Capabilities;
use crate::core::identifier::{quote_pg, quote_relation, validate_type_name};
use crate::error::{LinkageError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Database validation
    if config.database.host.is_empty() {
        return Err(LinkageError::Config("database.host is required".into()));
    }
    if config.database.database.is_empty() {
        return Err(LinkageError::Config("database.database is required".into()));
    }
    if config.database.user.is_empty() {
        return Err(LinkageError::Config("database.user is required".into()));
    }
    if config.database.max_connections == 0 {
        return Err(LinkageError::Config(
            "database.max_connections must be at least 1".into(),
        ));
    }

    Capabilities::from_names(&config.extensions)?;

    if config.jobs.is_empty() {
        return Err(LinkageError::Config("at least one job is required".into()));
    }
    let mut names = HashSet::new();
    for job in &config.jobs {
        if job.name.is_empty() {
            return Err(LinkageError::Config("jobs[].name is required".into()));
        }
        if !names.insert(job.name.as_str()) {
            return Err(LinkageError::Config(format!(
                "job name '{}' is used more than once",
                job.name
            )));
        }
        validate_job(job)?;
    }

    Ok(())
}

fn validate_job(job: &JobConfig) -> Result<()> {
    let ctx = |field: &str| format!("job '{}': {}", job.name, field);

    match job.kind {
        JobKind::Merge => {
            let source = job
                .source
                .as_ref()
                .ok_or_else(|| LinkageError::Config(ctx("source is required for merge jobs")))?;
            validate_table(source, &ctx("source"))?;
            if !job.orientation.rules.is_empty() {
                return Err(LinkageError::Config(ctx(
                    "orientation only applies to dedup jobs",
                )));
            }
        }
        JobKind::Dedup => {
            if job.source.is_some() {
                return Err(LinkageError::Config(ctx(
                    "dedup jobs take only a target table",
                )));
            }
        }
    }
    validate_table(&job.target, &ctx("target"))?;

    if job.matching.exact.is_empty() && job.matching.fuzzy.is_empty() {
        return Err(LinkageError::Config(ctx(
            "matching needs at least one exact group or fuzzy column",
        )));
    }

    Ok(())
}

fn validate_table(table: &TableConfig, field: &str) -> Result<()> {
    if table.table.is_empty() {
        return Err(LinkageError::Config(format!("{}.table is required", field)));
    }
    quote_relation(&table.table)?;

    if let Some(columns) = &table.columns {
        if columns.is_empty() {
            return Err(LinkageError::Config(format!(
                "{}.columns cannot be empty when declared",
                field
            )));
        }
        for column in columns {
            quote_pg(column)?;
        }
        if let Some(pk) = &table.primary_key {
            if !columns.contains(pk) {
                return Err(LinkageError::Config(format!(
                    "{}.primary_key '{}' is not among the declared columns",
                    field, pk
                )));
            }
        }
    }
    if let Some(data_type) = &table.primary_key_type {
        if table.primary_key.is_none() {
            return Err(LinkageError::Config(format!(
                "{}.primary_key_type needs primary_key",
                field
            )));
        }
        validate_type_name(data_type)?;
    }

    Ok(())
}
