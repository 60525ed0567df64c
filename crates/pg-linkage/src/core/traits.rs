//! Collaborator traits at the engine's edges.
//!
//! The engine compiles statements; everything that touches a database sits
//! behind one of these traits:
//!
//! - [`StatementSink`]: runs statements and count queries inside one transaction
//! - [`SchemaSource`]: describes existing relations
//! - [`BulkLoader`]: streams raw rows into a named working table
//!
//! # Design Patterns
//!
//! - **Strategy**: the PostgreSQL executor and the recording test double are
//!   interchangeable sinks
//! - **Template Method**: [`StatementSink::run`] drives repeat policies on top of
//!   the primitive [`StatementSink::execute`]

use async_trait::async_trait;
use tracing::debug;

use crate::error::{LinkageError, Result};

use super::schema::TableDescriptor;
use super::statement::{RepeatPolicy, Statement};

/// Executes emitted statements, in order, one at a time.
#[async_trait]
pub trait StatementSink: Send + Sync {
    /// Open the run's transactional scope.
    async fn begin(&self) -> Result<()>;

    /// Make every effect of the run permanent.
    async fn commit(&self) -> Result<()>;

    /// Discard every effect of the run.
    async fn rollback(&self) -> Result<()>;

    /// Execute one command and return the number of affected rows.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Run a `SELECT COUNT(*)` query and return the count.
    async fn count(&self, sql: &str) -> Result<i64>;

    /// Execute a statement honoring its repeat policy.
    ///
    /// Returns the total affected rows across passes. A statement that still
    /// affects rows after `max_passes` fails with [`LinkageError::CyclicLinks`].
    async fn run(&self, statement: &Statement) -> Result<u64> {
        match statement.repeat {
            RepeatPolicy::Once => self.execute(&statement.sql).await,
            RepeatPolicy::UntilNoRows { max_passes } => {
                let mut total = 0u64;
                let mut passes = 0u32;
                loop {
                    if let Some(max) = max_passes {
                        if passes >= max {
                            return Err(LinkageError::CyclicLinks { passes });
                        }
                    }
                    let affected = self.execute(&statement.sql).await?;
                    passes += 1;
                    debug!(
                        "{} pass {} affected {} rows",
                        statement.kind, passes, affected
                    );
                    if affected == 0 {
                        return Ok(total);
                    }
                    total += affected;
                }
            }
        }
    }
}

/// Describes existing relations.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Column list and primary key of a relation.
    ///
    /// Fails with [`LinkageError::TableNotFound`] when it does not exist.
    async fn describe_table(&self, name: &str) -> Result<TableDescriptor>;
}

/// Streams raw text rows into a working table.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Load rows into `table`. `None` values load as NULL.
    async fn load_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::statement::StatementKind;
    use std::sync::Mutex;

    struct CountdownSink {
        remaining: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl StatementSink for CountdownSink {
        async fn begin(&self) -> Result<()> {
            Ok(())
        }
        async fn commit(&self) -> Result<()> {
            Ok(())
        }
        async fn rollback(&self) -> Result<()> {
            Ok(())
        }
        async fn execute(&self, _sql: &str) -> Result<u64> {
            Ok(self.remaining.lock().unwrap().pop().unwrap_or(0))
        }
        async fn count(&self, _sql: &str) -> Result<i64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_run_repeats_until_no_rows() {
        let sink = CountdownSink {
            remaining: Mutex::new(vec![0, 1, 2, 5]),
        };
        let stmt = Statement::new(StatementKind::Link, "UPDATE ws").repeated(None);
        assert_eq!(sink.run(&stmt).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_run_once() {
        let sink = CountdownSink {
            remaining: Mutex::new(vec![0, 7]),
        };
        let stmt = Statement::new(StatementKind::Update, "UPDATE t");
        assert_eq!(sink.run(&stmt).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_run_pass_limit() {
        let sink = CountdownSink {
            remaining: Mutex::new(vec![1, 1, 1, 1]),
        };
        let stmt = Statement::new(StatementKind::Flatten, "UPDATE ws").repeated(Some(3));
        let err = sink.run(&stmt).await.unwrap_err();
        assert!(matches!(err, LinkageError::CyclicLinks { passes: 3 }));
    }
}
