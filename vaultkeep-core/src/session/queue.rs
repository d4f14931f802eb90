//! Hand-off from the notifications loop to the sync worker.

use super::Result;
use crate::database::DatabaseManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Row kind used for queued sync requests.
pub const SYNC_REQUEST_KIND: &str = "sync_request";

/// Row id of the "sync everything" request.
const ALL_ACCOUNTS_ID: &str = "*";

#[async_trait]
pub trait SyncQueue: Send + Sync {
    /// Ask for one account to be synced.
    async fn queue_sync(&self, account_id: &str) -> Result<()>;

    /// Ask for every account to be synced.
    async fn queue_sync_all(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "account_id", rename_all = "snake_case")]
pub enum SyncScope {
    Account(String),
    All,
}

impl SyncScope {
    fn row_id(&self) -> &str {
        match self {
            SyncScope::Account(id) => id,
            SyncScope::All => ALL_ACCOUNTS_ID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub scope: SyncScope,
    pub requested_at: DateTime<Utc>,
}

/// Persists requests in the encrypted store, one row per scope, so a burst
/// of pushes for the same account collapses into a single pending sync.
pub struct StoreSyncQueue {
    manager: Arc<DatabaseManager>,
}

impl StoreSyncQueue {
    pub fn new(manager: Arc<DatabaseManager>) -> Self {
        Self { manager }
    }

    async fn push(&self, scope: SyncScope) -> Result<()> {
        let request = SyncRequest {
            scope,
            requested_at: Utc::now(),
        };
        debug!("Queueing sync for '{}'", request.scope.row_id());
        self.manager
            .mutate("QueueSync", |db| async move {
                db.put(SYNC_REQUEST_KIND, request.scope.row_id(), &request)
            })
            .await?;
        Ok(())
    }

    /// Requests not yet taken by the sync worker.
    pub async fn pending(&self) -> Result<Vec<SyncRequest>> {
        let db = self.manager.get().await?;
        Ok(db.list(SYNC_REQUEST_KIND)?)
    }

    /// Remove and return every pending request.
    pub async fn take_pending(&self) -> Result<Vec<SyncRequest>> {
        let taken = self
            .manager
            .mutate("TakeSyncRequests", |db| async move {
                let requests: Vec<SyncRequest> = db.list(SYNC_REQUEST_KIND)?;
                for request in &requests {
                    db.delete(SYNC_REQUEST_KIND, request.scope.row_id())?;
                }
                Ok(requests)
            })
            .await?;
        Ok(taken)
    }
}

#[async_trait]
impl SyncQueue for StoreSyncQueue {
    async fn queue_sync(&self, account_id: &str) -> Result<()> {
        self.push(SyncScope::Account(account_id.to_string())).await
    }

    async fn queue_sync_all(&self) -> Result<()> {
        self.push(SyncScope::All).await
    }
}
