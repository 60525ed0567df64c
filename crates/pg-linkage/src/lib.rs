//! # pg-linkage
//!
//! Record linkage and merge engine for PostgreSQL.
//!
//! The engine links rows of a source table to rows of a target table and emits
//! the ordered SQL that applies the result:
//!
//! - **Exact groups** of column equalities, tried in declaration order
//! - **Fuzzy columns** compared by trigram distance against a shrinking pool,
//!   so no target row is bound twice
//! - **Merge plans** updating linked target rows and inserting the rest
//! - **Deduplication** of a table against itself, gated on reflexive and
//!   mutual link counts before anything is deleted
//! - **Audits** that count matches per group without touching the real tables
//!
//! Every run executes inside one transaction on a single connection.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_linkage::{Config, Engine, Job, PgPool};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pg_linkage::Result<()> {
//!     let config = Config::load("linkage.yaml")?;
//!     let pool = PgPool::new(&config.database).await?;
//!     let executor = pool.executor().await?;
//!     let engine = Engine::new(config.capabilities()?).with_config_hash(config.hash());
//!
//!     for job_config in &config.jobs {
//!         let job = Job::resolve(job_config, Some(&executor)).await?;
//!         let report = engine.run(&executor, &job, &CancellationToken::new()).await?;
//!         println!("{}: {} rows linked", report.job, report.rows_linked);
//!     }
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod capability;
pub mod config;
pub mod core;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod merger;
pub mod preview;

// Re-exports for convenient access
pub use audit::{AuditResult, MatchCount};
pub use capability::{Capabilities, Capability};
pub use config::{Config, DatabaseConfig, JobConfig, JobKind, TableConfig};
pub use core::{
    BulkLoader, ExprTemplate, SchemaSource, Statement, StatementKind, StatementSink,
    TableDescriptor, TargetDescriptor,
};
pub use dedup::MergeOrientation;
pub use engine::{Engine, Job, RunPlan, RunReport};
pub use error::{LinkageError, Result};
pub use executor::{PgExecutor, PgPool};
pub use matcher::MatchStrategy;
pub use merger::{MergeMode, MergePlan};
