//! Database Layer with Connection Pooling and Safe Transactions
//!
//! SQLite store for runs, work items and findings:
//! - Connection pooling via r2d2 for concurrent access
//! - Panic-safe transactions with automatic rollback
//! - Version-tracked migrations
//! - WAL mode for concurrent readers during a run

use std::path::Path;
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};

use crate::types::{CassandraError, Finding, Result, ResultExt, RunId, WorkItem};

/// Shared database handle for async contexts.
pub type SharedDatabase = Arc<Database>;

const SCHEMA: &str = include_str!("schema.sql");

/// Current schema version for migration tracking
const SCHEMA_VERSION: u32 = 2;

struct Migration {
    version: u32,
    description: &'static str,
    up: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 2,
    description: "Index findings by severity",
    up: "CREATE INDEX IF NOT EXISTS idx_findings_severity ON findings(run_id, severity)",
}];

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: u32,
    pub min_idle: u32,
    /// Timeout for acquiring a connection (seconds)
    pub connection_timeout_secs: u64,
}

impl PoolConfig {
    const MIN_POOL_SIZE: u32 = 2;
    const MAX_POOL_SIZE: u32 = 16;

    /// One connection per core, within bounds
    pub fn optimal_pool_size() -> u32 {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);
        cores.clamp(Self::MIN_POOL_SIZE, Self::MAX_POOL_SIZE)
    }

    pub fn auto() -> Self {
        let max_size = Self::optimal_pool_size();
        Self {
            max_size,
            min_idle: (max_size / 4).max(1),
            connection_timeout_secs: 30,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

/// A work item row as stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWorkItem {
    pub stage: String,
    pub item_id: String,
    pub status: String,
    pub failure_kind: Option<String>,
}

/// Thread-safe database with connection pooling.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, PoolConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: PoolConfig) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let manager =
            SqliteConnectionManager::file(path.as_ref()).with_init(Self::configure_connection);

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(std::time::Duration::from_secs(
                config.connection_timeout_secs,
            ))
            .build(manager)
            .map_err(|e| {
                CassandraError::Storage(format!("Failed to create connection pool: {}", e))
            })?;

        Ok(Self { pool })
    }

    /// Open an in-memory database for testing or temporary use.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(1).build(manager).map_err(|e| {
            CassandraError::Storage(format!("Failed to create in-memory pool: {}", e))
        })?;

        Ok(Self { pool })
    }

    fn configure_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            PRAGMA wal_autocheckpoint = 1000;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            CassandraError::Storage(format!("Failed to acquire database connection: {}", e))
        })
    }

    /// Create tables and bring an existing database up to date.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        let existing: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        conn.execute_batch(SCHEMA)
            .with_context("Failed to initialize database schema")?;

        if existing == 0 {
            // Fresh database: schema.sql already contains every migration
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .with_context("Failed to set schema version")?;
        }
        drop(conn);
        self.migrate()
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;

        let current_version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        for migration in MIGRATIONS {
            if migration.version > current_version {
                conn.execute_batch(migration.up).with_context_fn(|| {
                    format!(
                        "Failed to apply migration {}: {}",
                        migration.version, migration.description
                    )
                })?;

                tracing::info!(
                    "Applied migration {}: {}",
                    migration.version,
                    migration.description
                );
            }
        }

        if current_version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .with_context("Failed to update schema version")?;
        }

        Ok(())
    }

    pub fn schema_version(&self) -> Result<u32> {
        self.conn()?
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .with_context("Failed to read schema version")
    }

    /// Execute a function within a panic-safe database transaction.
    ///
    /// If the closure errors or panics, the transaction is rolled back and an
    /// error is returned instead of poisoning the connection pool.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + std::panic::UnwindSafe,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .with_context("Failed to start transaction")?;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&tx)));

        match result {
            Ok(Ok(value)) => {
                tx.commit().with_context("Failed to commit transaction")?;
                Ok(value)
            }
            // Rolled back on drop
            Ok(Err(e)) => Err(e),
            Err(panic_payload) => {
                let panic_msg = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());

                tracing::error!("Transaction panicked: {}", panic_msg);
                Err(CassandraError::Storage(format!(
                    "Transaction panicked: {}",
                    panic_msg
                )))
            }
        }
    }

    // =========================================================================
    // Runs
    // =========================================================================

    pub fn upsert_run(&self, run_id: &RunId, query: &str, status: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn()?
            .execute(
                "INSERT INTO runs (id, query, status, started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
                params![run_id.as_str(), query, status, now],
            )
            .with_context("Failed to record run")?;
        Ok(())
    }

    pub fn run_status(&self, run_id: &RunId) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT status FROM runs WHERE id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .with_context("Failed to load run status")
    }

    fn ensure_run(conn: &Connection, run_id: &RunId) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO runs (id, query, status, started_at, updated_at)
             VALUES (?1, '', 'unknown', ?2, ?2)",
            params![run_id.as_str(), now],
        )
        .with_context("Failed to register run")?;
        Ok(())
    }

    // =========================================================================
    // Work items and findings
    // =========================================================================

    /// Upsert terminal work items of one stage atomically.
    pub fn store_work_items(&self, run_id: &RunId, stage: &str, items: &[WorkItem]) -> Result<usize> {
        self.transaction(|conn| {
            Self::ensure_run(conn, run_id)?;
            let now = chrono::Utc::now().to_rfc3339();
            let mut stmt = conn
                .prepare(
                    "INSERT OR REPLACE INTO work_items
                     (run_id, stage, item_id, source_ref, doc_index, unit_index, status,
                      payload_ref, failure_kind, failure_message, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .with_context("Failed to prepare work item insert")?;

            for item in items {
                let failure = item.failure();
                stmt.execute(params![
                    run_id.as_str(),
                    stage,
                    item.id,
                    item.source_ref,
                    item.order.document as i64,
                    item.order.unit as i64,
                    item.status().as_str(),
                    item.payload_ref.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    failure.map(|f| f.kind.to_string()),
                    failure.map(|f| f.message.clone()),
                    now,
                ])
                .with_context_fn(|| format!("Failed to store work item {}", item.id))?;
            }
            Ok(items.len())
        })
    }

    /// Upsert findings atomically; ids are content fingerprints, so re-recording is idempotent.
    pub fn store_findings(&self, run_id: &RunId, findings: &[Finding]) -> Result<usize> {
        self.transaction(|conn| {
            Self::ensure_run(conn, run_id)?;
            let now = chrono::Utc::now().to_rfc3339();
            let mut stmt = conn
                .prepare(
                    "INSERT OR REPLACE INTO findings
                     (id, run_id, stage, item_id, source_ref, doc_index, unit_index, kind,
                      severity, tag, quote, explanation, location, score, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )
                .with_context("Failed to prepare finding insert")?;

            for finding in findings {
                stmt.execute(params![
                    finding.id,
                    run_id.as_str(),
                    finding.stage,
                    finding.item_id,
                    finding.source_ref,
                    finding.order.document as i64,
                    finding.order.unit as i64,
                    finding.kind.as_str(),
                    finding.severity.as_str(),
                    finding.tag,
                    finding.quote,
                    finding.explanation,
                    finding.location,
                    finding.score,
                    now,
                ])
                .with_context_fn(|| format!("Failed to store finding {}", finding.id))?;
            }
            Ok(findings.len())
        })
    }

    pub fn count_findings(&self, run_id: &RunId, severity: Option<&str>) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = match severity {
            Some(severity) => conn.query_row(
                "SELECT COUNT(*) FROM findings WHERE run_id = ?1 AND severity = ?2",
                params![run_id.as_str(), severity],
                |row| row.get(0),
            ),
            None => conn.query_row(
                "SELECT COUNT(*) FROM findings WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            ),
        }
        .with_context("Failed to count findings")?;
        Ok(count as usize)
    }

    /// Work items in stage then source order
    pub fn load_work_items(&self, run_id: &RunId) -> Result<Vec<StoredWorkItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT stage, item_id, status, failure_kind FROM work_items
                 WHERE run_id = ?1 ORDER BY stage, doc_index, unit_index",
            )
            .with_context("Failed to prepare work item query")?;
        let rows = stmt
            .query_map(params![run_id.as_str()], |row| {
                Ok(StoredWorkItem {
                    stage: row.get(0)?,
                    item_id: row.get(1)?,
                    status: row.get(2)?,
                    failure_kind: row.get(3)?,
                })
            })
            .with_context("Failed to query work items")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .with_context("Failed to read work items")
    }
}
