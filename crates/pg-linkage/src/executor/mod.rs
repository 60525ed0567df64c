//! PostgreSQL executor: runs emitted statements, describes tables and bulk
//! loads working tables over pooled `tokio-postgres` connections.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::core::identifier::{quote_pg, quote_relation};
use crate::core::{BulkLoader, PrimaryKey, SchemaSource, StatementSink, TableDescriptor};
use crate::error::{LinkageError, Result};

/// Rows buffered before each COPY flush.
const COPY_CHUNK_ROWS: usize = 10_000;

const COLUMNS_SQL: &str = "SELECT a.attname::TEXT, format_type(a.atttypid, a.atttypmod)
    FROM pg_attribute a
    WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped
    ORDER BY a.attnum";

const PRIMARY_KEY_SQL: &str = "SELECT a.attname::TEXT, format_type(a.atttypid, a.atttypmod)
    FROM pg_index i
    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
    WHERE i.indrelid = to_regclass($1) AND i.indisprimary";

/// Connection pool for the linkage database.
pub struct PgPool {
    pool: Pool,
    config: DatabaseConfig,
}

impl PgPool {
    /// Create the pool and test one connection.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pg_config = pg_config(config)?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(config.max_connections)
            .build()
            .map_err(|e| LinkageError::pool(e.to_string(), "creating PostgreSQL pool"))?;

        let client = pool
            .get()
            .await
            .map_err(|e| LinkageError::pool(e.to_string(), "testing PostgreSQL connection"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    /// Check out a dedicated connection for one run.
    pub async fn executor(&self) -> Result<PgExecutor> {
        let client = self.pool.get().await.map_err(|e| {
            LinkageError::pool(
                e.to_string(),
                format!("checking out connection to {}", self.config.database),
            )
        })?;
        Ok(PgExecutor { client })
    }

    /// Server version string, for health checks.
    pub async fn server_version(&self) -> Result<String> {
        let executor = self.executor().await?;
        let row = executor.client.query_one("SHOW server_version", &[]).await?;
        Ok(row.try_get(0)?)
    }
}

fn pg_config(config: &DatabaseConfig) -> Result<PgConfig> {
    let mut pg_config = PgConfig::new();
    pg_config.host(&config.host);
    pg_config.port(config.port);
    pg_config.dbname(&config.database);
    pg_config.user(&config.user);
    pg_config.password(&config.password);
    pg_config.application_name("pg-linkage");
    pg_config.ssl_mode(match config.ssl_mode.to_lowercase().as_str() {
        "disable" => SslMode::Disable,
        "prefer" => SslMode::Prefer,
        other => {
            return Err(LinkageError::Config(format!(
                "database.ssl_mode '{}' is not supported (use disable or prefer)",
                other
            )))
        }
    });
    Ok(pg_config)
}

/// One pooled connection. Every statement of a run goes through the same
/// connection so they share one transaction.
pub struct PgExecutor {
    client: Object,
}

#[async_trait]
impl StatementSink for PgExecutor {
    async fn begin(&self) -> Result<()> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        debug!("Executing: {}", sql);
        Ok(self.client.execute(sql, &[]).await?)
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        debug!("Counting: {}", sql);
        let row = self.client.query_one(sql, &[]).await?;
        Ok(row.try_get(0)?)
    }
}

#[async_trait]
impl SchemaSource for PgExecutor {
    async fn describe_table(&self, name: &str) -> Result<TableDescriptor> {
        let relation = quote_relation(name)?;

        let rows = self.client.query(COLUMNS_SQL, &[&relation]).await?;
        if rows.is_empty() {
            return Err(LinkageError::TableNotFound(name.to_string()));
        }
        let columns = rows
            .iter()
            .map(|r| r.try_get::<_, String>(0))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let pk_rows = self.client.query(PRIMARY_KEY_SQL, &[&relation]).await?;
        let primary_key = match pk_rows.as_slice() {
            [row] => Some(PrimaryKey::new(
                row.try_get::<_, String>(0)?,
                row.try_get::<_, String>(1)?,
            )),
            [] => None,
            _ => {
                warn!(
                    "Table {} has a composite primary key - treating it as having none",
                    name
                );
                None
            }
        };

        debug!(
            "Described {}: {} columns, primary key {:?}",
            name,
            columns.len(),
            primary_key.as_ref().map(|pk| &pk.column)
        );

        Ok(TableDescriptor {
            name: name.to_string(),
            columns,
            primary_key,
        })
    }
}

#[async_trait]
impl BulkLoader for PgExecutor {
    async fn load_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let copy_stmt = copy_statement(table, columns)?;
        let sink = self.client.copy_in(&copy_stmt).await?;
        futures::pin_mut!(sink);

        let mut buf = BytesMut::with_capacity(1024 * 1024);
        let row_count = rows.len();

        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != columns.len() {
                return Err(LinkageError::load(
                    table,
                    format!(
                        "row {} has {} values, expected {}",
                        i,
                        row.len(),
                        columns.len()
                    ),
                ));
            }
            encode_copy_row(&mut buf, &row);

            if (i + 1) % COPY_CHUNK_ROWS == 0 || i + 1 == row_count {
                sink.send(buf.split().freeze())
                    .await
                    .map_err(|e| LinkageError::load(table, format!("COPY send failed: {}", e)))?;
            }
        }

        let copied = sink.finish().await?;
        info!("Loaded {} rows into {}", copied, table);
        Ok(copied)
    }
}

fn copy_statement(table: &str, columns: &[String]) -> Result<String> {
    let col_list = columns
        .iter()
        .map(|c| quote_pg(c))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    Ok(format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        quote_relation(table)?,
        col_list
    ))
}

/// Append one tab-separated COPY text line.
fn encode_copy_row(buf: &mut BytesMut, row: &[Option<String>]) {
    for (j, value) in row.iter().enumerate() {
        if j > 0 {
            buf.put_u8(b'\t');
        }
        match value {
            Some(text) => buf.extend_from_slice(escape_copy_text(text).as_bytes()),
            None => buf.extend_from_slice(b"\\N"),
        }
    }
    buf.put_u8(b'\n');
}

/// Escape special characters for COPY text format.
fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}
