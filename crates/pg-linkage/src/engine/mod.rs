//! Run engine - drives one job's statements through a sink.
//!
//! A run is a strictly ordered batch inside one transaction:
//!
//! 1. setup: working source set, working target pool
//! 2. link: exact groups in declaration order, then fuzzy columns
//! 3. counts: the dedup invariant gate, or the audit counts
//! 4. finalize: update/insert for merges, flatten/fold for dedup (never on audits)
//! 5. teardown: drop the working tables
//!
//! Any error, a failed gate or a cancellation rolls the transaction back, so the
//! real tables are only changed by a run that commits.

mod job;

pub use job::{DedupJob, Job, MergeJob, DEFAULT_KEY_TYPE};

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{self, AuditResult};
use crate::capability::Capabilities;
use crate::config::JobKind;
use crate::core::{
    BulkLoader, CountPurpose, CountQuery, Statement, StatementKind, StatementSink,
    TableDescriptor, WorkingNames,
};
use crate::dedup;
use crate::error::{LinkageError, Result};
use crate::matcher::MatchContext;
use crate::merger::MergeContext;

/// Every statement of one run, in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub job: String,
    pub kind: JobKind,
    pub audit: bool,
    pub names: WorkingNames,
    pub setup: Vec<Statement>,
    pub link: Vec<Statement>,
    /// Dedup invariant checks; both must read zero.
    pub gate: Vec<CountQuery>,
    /// Audit counts.
    pub counts: Vec<CountQuery>,
    pub finalize: Vec<Statement>,
    pub teardown: Vec<Statement>,
}

impl RunPlan {
    /// Flattened statement list, count queries included.
    pub fn statements(&self) -> Vec<Statement> {
        self.setup
            .iter()
            .chain(&self.link)
            .cloned()
            .chain(self.gate.iter().map(CountQuery::to_statement))
            .chain(self.counts.iter().map(CountQuery::to_statement))
            .chain(self.finalize.iter().cloned())
            .chain(self.teardown.iter().cloned())
            .collect()
    }

    /// Whether the plan changes the real tables.
    pub fn is_destructive(&self) -> bool {
        self.statements().iter().any(|s| s.kind.is_destructive())
    }
}

/// Outcome of one committed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub job: String,
    pub run_id: String,
    pub kind: JobKind,
    pub audit: bool,

    /// Hash of the configuration the job came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,

    pub statements_executed: usize,
    pub rows_linked: u64,

    /// Rows updated in the target. Unknown when return expressions wrap the
    /// phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_updated: Option<u64>,

    /// Rows inserted into the target. Unknown when return expressions wrap
    /// the phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_inserted: Option<u64>,

    /// Duplicates folded into survivors and deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_merged: Option<u64>,

    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_result: Option<AuditResult>,
}

impl RunReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Compiles and runs jobs against a fixed capability set.
pub struct Engine {
    capabilities: Capabilities,
    installed: OnceCell<()>,
    config_hash: Option<String>,
}

impl Engine {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            installed: OnceCell::new(),
            config_hash: None,
        }
    }

    /// Tag run reports with the hash of the configuration in use.
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Plan a run with fresh working-table names.
    pub fn plan(&self, job: &Job, audit: bool) -> Result<RunPlan> {
        self.plan_with_names(job, audit, WorkingNames::generate())
    }

    /// Plan a run. Validation happens here, so configuration errors surface
    /// before any statement is issued.
    pub fn plan_with_names(&self, job: &Job, audit: bool, names: WorkingNames) -> Result<RunPlan> {
        job.validate(&self.capabilities)?;

        let mut plan = RunPlan {
            job: job.name().to_string(),
            kind: job.kind(),
            audit,
            names,
            setup: Vec::new(),
            link: Vec::new(),
            gate: Vec::new(),
            counts: Vec::new(),
            finalize: Vec::new(),
            teardown: Vec::new(),
        };

        match job {
            Job::Merge(j) => {
                let matched = j.strategy.compile(&MatchContext {
                    source: &j.source,
                    target: &j.target,
                    names: &plan.names,
                    audit,
                })?;
                if audit {
                    plan.counts = audit::count_queries(&plan.names, &j.strategy.group_labels())?;
                } else {
                    plan.finalize = j.plan.compile(&MergeContext {
                        source: &j.source,
                        target: &j.target,
                        names: &plan.names,
                        strategy: &j.strategy,
                    })?;
                }
                plan.setup = matched.setup;
                plan.link = matched.link;
                plan.teardown = matched.teardown;
            }
            Job::Dedup(j) => {
                let strategy = j.oriented_strategy()?;
                let matched = strategy.compile(&MatchContext {
                    source: j.table.table(),
                    target: &j.table,
                    names: &plan.names,
                    audit,
                })?;
                let stmts = dedup::compile(&j.plan, &j.table, &plan.names)?;
                if audit {
                    plan.counts = audit::count_queries(&plan.names, &strategy.group_labels())?;
                    plan.counts.extend(stmts.gate);
                } else {
                    plan.gate = stmts.gate;
                    plan.finalize = vec![stmts.flatten, stmts.merge];
                }
                plan.setup = matched.setup;
                plan.link = matched.link;
                plan.teardown = matched.teardown;
            }
        }

        debug!(
            "Planned {} {} '{}': {} statements",
            if audit { "audit of" } else { "run of" },
            plan.kind,
            plan.job,
            plan.statements().len()
        );
        Ok(plan)
    }

    /// Install declared capabilities. Runs once per engine.
    pub async fn install_capabilities(&self, sink: &dyn StatementSink) -> Result<()> {
        self.installed
            .get_or_try_init(|| async {
                let statements = self.capabilities.install_statements();
                if statements.is_empty() {
                    return Ok(());
                }
                info!("Installing {} capabilities", statements.len());
                sink.begin().await?;
                for stmt in &statements {
                    if let Err(e) = sink.run(stmt).await {
                        rollback(sink).await;
                        return Err(e);
                    }
                }
                sink.commit().await
            })
            .await?;
        Ok(())
    }

    /// Match and merge (or deduplicate) a job.
    pub async fn run(
        &self,
        sink: &dyn StatementSink,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let plan = self.plan(job, false)?;
        self.execute(sink, &plan, job, cancel).await
    }

    /// Match a job and report counts without touching the real tables.
    pub async fn audit(
        &self,
        sink: &dyn StatementSink,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let plan = self.plan(job, true)?;
        self.execute(sink, &plan, job, cancel).await
    }

    /// Execute a previously built plan.
    pub async fn execute(
        &self,
        sink: &dyn StatementSink,
        plan: &RunPlan,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        self.install_capabilities(sink).await?;

        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let tracks_merge_rows = match job {
            Job::Merge(j) => j.plan.return_expressions.is_empty(),
            Job::Dedup(_) => false,
        };

        let mut report = RunReport {
            job: plan.job.clone(),
            run_id,
            kind: plan.kind,
            audit: plan.audit,
            config_hash: self.config_hash.clone(),
            statements_executed: 0,
            rows_linked: 0,
            rows_updated: (tracks_merge_rows && !plan.audit).then_some(0),
            rows_inserted: (tracks_merge_rows && !plan.audit).then_some(0),
            rows_merged: (plan.kind == JobKind::Dedup && !plan.audit).then_some(0),
            started_at,
            duration_seconds: 0.0,
            audit_result: None,
        };

        info!(
            "Starting {} '{}' ({}): {}",
            if plan.audit { "audit" } else { "run" },
            plan.job,
            plan.kind,
            report.run_id
        );

        sink.begin().await?;
        if let Err(e) = drive(sink, plan, cancel, &mut report).await {
            rollback(sink).await;
            match &e {
                LinkageError::Cancelled => warn!("'{}' cancelled, rolled back", plan.job),
                _ => error!("'{}' failed, rolled back: {}", plan.job, e),
            }
            return Err(e);
        }
        sink.commit().await?;

        report.duration_seconds = start.elapsed().as_secs_f64();
        info!(
            "'{}' completed: {} statements, {} rows linked in {:.1}s",
            report.job, report.statements_executed, report.rows_linked, report.duration_seconds
        );
        Ok(report)
    }

    /// Load raw rows into a staging table declared by `table`.
    pub async fn stage_rows(
        &self,
        loader: &dyn BulkLoader,
        table: &TableDescriptor,
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<u64> {
        table.validate()?;
        if let Some(i) = rows.iter().position(|r| r.len() != table.columns.len()) {
            return Err(LinkageError::load(
                &table.name,
                format!(
                    "row {} has {} values, expected {}",
                    i,
                    rows[i].len(),
                    table.columns.len()
                ),
            ));
        }
        let loaded = loader.load_rows(&table.name, &table.columns, rows).await?;
        debug!("Staged {} rows into {}", loaded, table.name);
        Ok(loaded)
    }
}

async fn drive(
    sink: &dyn StatementSink,
    plan: &RunPlan,
    cancel: &CancellationToken,
    report: &mut RunReport,
) -> Result<()> {
    info!("Phase 1: Preparing working tables");
    for stmt in &plan.setup {
        step(sink, stmt, cancel, report).await?;
    }

    info!("Phase 2: Linking ({} passes)", plan.link.len());
    for stmt in &plan.link {
        let linked = step(sink, stmt, cancel, report).await?;
        report.rows_linked += linked;
    }

    if !plan.gate.is_empty() {
        let counts = read_counts(sink, &plan.gate, cancel, report).await?;
        let measure = |purpose: CountPurpose| {
            counts
                .iter()
                .find(|(q, _)| q.purpose == purpose)
                .map_or(0, |(_, c)| *c)
        };
        let reflexive = measure(CountPurpose::Reflexive);
        let symmetric = measure(CountPurpose::Symmetric);
        if reflexive != 0 || symmetric != 0 {
            error!(
                "Invariant check failed: {} reflexive, {} symmetric links",
                reflexive, symmetric
            );
            return Err(LinkageError::InvariantViolation {
                reflexive,
                symmetric,
            });
        }
    }

    if !plan.counts.is_empty() {
        let counts = read_counts(sink, &plan.counts, cancel, report).await?;
        let result = AuditResult::from_counts(&counts)?;
        info!(
            "Audit: {} of {} source rows matched",
            result.matched_total(),
            result.total_source_records
        );
        report.audit_result = Some(result);
    }

    if !plan.finalize.is_empty() {
        info!("Phase 3: Applying changes");
    }
    for stmt in &plan.finalize {
        let affected = step(sink, stmt, cancel, report).await?;
        let tally = match stmt.kind {
            StatementKind::Update => &mut report.rows_updated,
            StatementKind::Insert => &mut report.rows_inserted,
            StatementKind::MergeDuplicates => &mut report.rows_merged,
            _ => continue,
        };
        if let Some(n) = tally {
            *n += affected;
        }
    }

    for stmt in &plan.teardown {
        step(sink, stmt, cancel, report).await?;
    }
    Ok(())
}

async fn step(
    sink: &dyn StatementSink,
    stmt: &Statement,
    cancel: &CancellationToken,
    report: &mut RunReport,
) -> Result<u64> {
    if cancel.is_cancelled() {
        return Err(LinkageError::Cancelled);
    }
    debug!("{}", stmt);
    let affected = sink.run(stmt).await?;
    report.statements_executed += 1;
    Ok(affected)
}

async fn read_counts(
    sink: &dyn StatementSink,
    queries: &[CountQuery],
    cancel: &CancellationToken,
    report: &mut RunReport,
) -> Result<Vec<(CountQuery, i64)>> {
    let mut counts = Vec::with_capacity(queries.len());
    for query in queries {
        if cancel.is_cancelled() {
            return Err(LinkageError::Cancelled);
        }
        let count = sink.count(&query.sql).await?;
        report.statements_executed += 1;
        debug!("{:?} = {}", query.purpose, count);
        counts.push((query.clone(), count));
    }
    Ok(counts)
}

async fn rollback(sink: &dyn StatementSink) {
    if let Err(e) = sink.rollback().await {
        warn!("Rollback failed: {}", e);
    }
}
