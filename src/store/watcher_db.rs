//! Watcher database.
//!
//! Persists cursors and redemption records in SQLite or Postgres through the
//! sqlx `Any` driver. The backend is picked from the connection string.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{any::AnyPoolOptions, any::AnyRow, Any, Pool, Row};
use std::path::Path;
use watcher_common::{ChainId, MessageId};

use super::{reconcile, CursorStore, RecordStore, RedemptionRecord, TxStatus, UpsertOutcome};

/// Embedded SQL schemas
const SQLITE_SCHEMA_SQL: &str = include_str!("../../sql/watcher_schema.sql");
const POSTGRES_SCHEMA_SQL: &str = include_str!("../../sql/watcher_schema_postgres.sql");

/// Another writer may change the row between a refused write and the status
/// read that explains it; the write is then attempted again.
const MAX_UPSERT_ATTEMPTS: usize = 3;

const RECORD_COLUMNS: &str = "message_id, chain_id, status, method, tx_hash, from_address, to_address, block_number, timestamp, updated_at";

/// Watcher database configuration
#[derive(Debug, Clone)]
pub struct WatcherDbConfig {
    /// SQLite path, `sqlite:` URL, `:memory:` or `postgres://` URL.
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbBackend {
    Sqlite,
    Postgres,
}

/// Cursor and record store on sqlx.
#[derive(Debug, Clone)]
pub struct WatcherDb {
    pool: Pool<Any>,
    backend: DbBackend,
}

impl WatcherDb {
    /// Connect and initialise the schema.
    pub async fn new(config: WatcherDbConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let backend =
            if config.path.starts_with("postgres://") || config.path.starts_with("postgresql://") {
                DbBackend::Postgres
            } else {
                DbBackend::Sqlite
            };

        let is_memory = config.path == ":memory:" || config.path == "sqlite::memory:";

        // Ensure parent directory exists for sqlite file databases.
        if backend == DbBackend::Sqlite {
            let is_url = config.path.starts_with("sqlite:");
            if !is_memory && !is_url {
                if let Some(parent) = Path::new(&config.path).parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .context(format!("Failed to create directory: {}", parent.display()))?;
                    }
                }
            }
        }

        let database_url = match backend {
            DbBackend::Postgres => config.path.clone(),
            DbBackend::Sqlite => {
                if is_memory {
                    "sqlite::memory:".to_string()
                } else if config.path.starts_with("sqlite:") {
                    config.path.clone()
                } else {
                    format!("sqlite://{}?mode=rwc", config.path)
                }
            }
        };

        tracing::debug!(
            target: "watcher::store",
            "Connecting to database: {}",
            database_url
        );

        // Every in-memory SQLite connection is its own database.
        let max_connections = if is_memory { 1 } else { 5 };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(&database_url)
            .await
            .context("Failed to connect to watcher database")?;

        let db = Self { pool, backend };

        db.init_schema().await?;

        Ok(db)
    }

    fn sql<'a>(&self, sqlite: &'a str, postgres: &'a str) -> &'a str {
        match self.backend {
            DbBackend::Sqlite => sqlite,
            DbBackend::Postgres => postgres,
        }
    }

    fn table<'a>(&self, sqlite: &'a str, postgres: &'a str) -> &'a str {
        self.sql(sqlite, postgres)
    }

    async fn init_schema(&self) -> Result<()> {
        self.apply_pragmas().await?;
        self.load_schema_from_sql().await?;

        tracing::info!(target: "watcher::store", "Watcher database schema initialized");

        Ok(())
    }

    async fn apply_pragmas(&self) -> Result<()> {
        if self.backend != DbBackend::Sqlite {
            return Ok(());
        }

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        tracing::debug!(target: "watcher::store", "Applied SQLite PRAGMAs");

        Ok(())
    }

    async fn load_schema_from_sql(&self) -> Result<()> {
        let schema_sql = self.sql(SQLITE_SCHEMA_SQL, POSTGRES_SCHEMA_SQL);

        for statement in schema_sql.split(';') {
            // Remove comment lines
            let sql_lines: Vec<&str> = statement
                .lines()
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty() && !trimmed.starts_with("--")
                })
                .collect();

            if sql_lines.is_empty() {
                continue;
            }

            let clean_sql = sql_lines.join("\n");
            let first_line = clean_sql.lines().next().unwrap_or("");

            tracing::debug!(target: "watcher::store", "Executing SQL: {}", first_line);

            sqlx::query(&clean_sql)
                .execute(&self.pool)
                .await
                .context(format!("Failed to execute SQL: {first_line}"))?;
        }

        Ok(())
    }

    /// Fetch a full record.
    pub async fn get_record(&self, message_id: &MessageId) -> Result<Option<RedemptionRecord>> {
        let table = self.table("redemptions", "watcher.redemptions");
        let sql = match self.backend {
            DbBackend::Sqlite => format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE message_id = ?"),
            DbBackend::Postgres => format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE message_id = $1"),
        };

        let row = sqlx::query(&sql)
            .bind(message_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| record_from_row(&r, message_id)).transpose()
    }

    /// Number of stored records.
    pub async fn record_count(&self) -> Result<u64> {
        let table = self.table("redemptions", "watcher.redemptions");
        let row = sqlx::query(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn try_upsert(&self, record: &RedemptionRecord) -> Result<bool> {
        let table = self.table("redemptions", "watcher.redemptions");
        let sql = match self.backend {
            DbBackend::Sqlite => format!(
                "INSERT INTO {table} (message_id, chain_id, status, status_rank, method, tx_hash, \
                 from_address, to_address, block_number, timestamp, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(message_id) DO UPDATE SET \
                 chain_id = excluded.chain_id, status = excluded.status, status_rank = excluded.status_rank, \
                 method = excluded.method, tx_hash = excluded.tx_hash, from_address = excluded.from_address, \
                 to_address = excluded.to_address, block_number = excluded.block_number, \
                 timestamp = excluded.timestamp, updated_at = excluded.updated_at \
                 WHERE {table}.status_rank <= excluded.status_rank"
            ),
            DbBackend::Postgres => format!(
                "INSERT INTO {table} AS r (message_id, chain_id, status, status_rank, method, tx_hash, \
                 from_address, to_address, block_number, timestamp, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 ON CONFLICT(message_id) DO UPDATE SET \
                 chain_id = EXCLUDED.chain_id, status = EXCLUDED.status, status_rank = EXCLUDED.status_rank, \
                 method = EXCLUDED.method, tx_hash = EXCLUDED.tx_hash, from_address = EXCLUDED.from_address, \
                 to_address = EXCLUDED.to_address, block_number = EXCLUDED.block_number, \
                 timestamp = EXCLUDED.timestamp, updated_at = EXCLUDED.updated_at \
                 WHERE r.status_rank <= EXCLUDED.status_rank"
            ),
        };

        let result = sqlx::query(&sql)
            .bind(record.message_id.as_str())
            .bind(i64::from(record.chain_id.as_u16()))
            .bind(record.status.as_str())
            .bind(i64::from(record.status.rank()))
            .bind(record.method.as_str())
            .bind(record.tx_hash.as_str())
            .bind(record.from.as_str())
            .bind(record.to.as_str())
            .bind(record.block_number as i64)
            .bind(record.timestamp.timestamp_millis())
            .bind(record.updated_at.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn record_from_row(row: &AnyRow, message_id: &MessageId) -> Result<RedemptionRecord> {
    let chain_id: i64 = row.try_get("chain_id")?;
    let status: String = row.try_get("status")?;
    let block_number: i64 = row.try_get("block_number")?;
    let timestamp: i64 = row.try_get("timestamp")?;
    let updated_at: i64 = row.try_get("updated_at")?;

    Ok(RedemptionRecord {
        message_id: message_id.clone(),
        chain_id: ChainId::new(u16::try_from(chain_id).context("chain_id out of range")?),
        status: status.parse::<TxStatus>()?,
        method: row.try_get("method")?,
        tx_hash: row.try_get("tx_hash")?,
        from: row.try_get("from_address")?,
        to: row.try_get("to_address")?,
        block_number: block_number as u64,
        timestamp: DateTime::from_timestamp_millis(timestamp).unwrap_or_default(),
        updated_at: DateTime::from_timestamp_millis(updated_at).unwrap_or_default(),
    })
}

#[async_trait]
impl CursorStore for WatcherDb {
    async fn current_block(&self, chain: &str, fallback: u64) -> Result<u64> {
        let table = self.table("watcher_cursors", "watcher.cursors");
        let sql = match self.backend {
            DbBackend::Sqlite => format!("SELECT block_number FROM {table} WHERE chain = ?"),
            DbBackend::Postgres => format!("SELECT block_number FROM {table} WHERE chain = $1"),
        };

        let row = sqlx::query(&sql)
            .bind(chain)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read watcher cursor")?;

        Ok(row.map_or(fallback, |r| r.get::<i64, _>(0) as u64))
    }

    async fn update_cursor(&self, chain: &str, block: u64, updated_at: DateTime<Utc>) -> Result<()> {
        let table = self.table("watcher_cursors", "watcher.cursors");
        let sql = match self.backend {
            DbBackend::Sqlite => format!(
                "INSERT INTO {table} (chain, block_number, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(chain) DO UPDATE SET block_number = excluded.block_number, updated_at = excluded.updated_at"
            ),
            DbBackend::Postgres => format!(
                "INSERT INTO {table} (chain, block_number, updated_at) VALUES ($1, $2, $3) \
                 ON CONFLICT(chain) DO UPDATE SET block_number = EXCLUDED.block_number, updated_at = EXCLUDED.updated_at"
            ),
        };

        sqlx::query(&sql)
            .bind(chain)
            .bind(block as i64)
            .bind(updated_at.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("Failed to update watcher cursor")?;

        Ok(())
    }
}

#[async_trait]
impl RecordStore for WatcherDb {
    async fn existing_status(&self, message_id: &MessageId) -> Result<Option<TxStatus>> {
        let table = self.table("redemptions", "watcher.redemptions");
        let sql = match self.backend {
            DbBackend::Sqlite => format!("SELECT status FROM {table} WHERE message_id = ?"),
            DbBackend::Postgres => format!("SELECT status FROM {table} WHERE message_id = $1"),
        };

        let row = sqlx::query(&sql)
            .bind(message_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let status: String = r.get(0);
                Ok(Some(status.parse::<TxStatus>()?))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &RedemptionRecord) -> Result<UpsertOutcome> {
        for _ in 0..MAX_UPSERT_ATTEMPTS {
            if self.try_upsert(record).await? {
                return Ok(UpsertOutcome::Written);
            }

            // Zero rows: the guard refused. Read the stored status to say why.
            let stored = self.existing_status(&record.message_id).await?;
            if let Err(rejection) = reconcile(stored, record.status) {
                return Ok(UpsertOutcome::Rejected(rejection));
            }
        }

        anyhow::bail!(
            "Upsert of {} did not settle after {} attempts",
            record.message_id,
            MAX_UPSERT_ATTEMPTS
        )
    }
}
