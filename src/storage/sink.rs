//! SQLite-backed finding sink

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::database::{Database, SharedDatabase};
use crate::pipeline::sources::FindingSink;
use crate::types::{CassandraError, Finding, Result, RunId, WorkItem};

/// Runs blocking SQLite writes off the async executor
#[derive(Clone)]
pub struct SqliteFindingSink {
    db: SharedDatabase,
}

impl SqliteFindingSink {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Open (creating if needed) and initialize the database at `path`
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let db = Database::open(path)?;
        db.initialize()?;
        Ok(Self::new(Arc::new(db)))
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| CassandraError::Storage(format!("Storage task failed: {}", e)))?
    }
}

#[async_trait]
impl FindingSink for SqliteFindingSink {
    async fn record_run(&self, run_id: &RunId, query: &str, status: &str) -> Result<()> {
        let (run_id, query, status) = (run_id.clone(), query.to_string(), status.to_string());
        self.blocking(move |db| db.upsert_run(&run_id, &query, &status))
            .await
    }

    async fn record_work_items(
        &self,
        run_id: &RunId,
        stage: &str,
        items: &[WorkItem],
    ) -> Result<()> {
        let (run_id, stage, items) = (run_id.clone(), stage.to_string(), items.to_vec());
        let stored = self
            .blocking(move |db| db.store_work_items(&run_id, &stage, &items))
            .await?;
        debug!(stored, "Persisted work items");
        Ok(())
    }

    async fn record_findings(&self, run_id: &RunId, findings: &[Finding]) -> Result<()> {
        let (run_id, findings) = (run_id.clone(), findings.to_vec());
        let stored = self
            .blocking(move |db| db.store_findings(&run_id, &findings))
            .await?;
        debug!(stored, "Persisted findings");
        Ok(())
    }
}
