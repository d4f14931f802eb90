//! Per-account notification sessions.
//!
//! Every signed-in account keeps one long-lived connection to its server's
//! notifications endpoint. A push from the server queues a re-sync of that
//! account. Token refresh, retries and connectivity gating live here too.

pub mod connectivity;
pub mod hub;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod token;

pub use connectivity::{ConnectivityService, WatchConnectivity};
pub use hub::{HubMessage, NotificationsHub};
pub use queue::{StoreSyncQueue, SyncQueue, SyncRequest, SyncScope};
pub use reconciler::NotificationsReconciler;
pub use retry::{with_retry, RetryDelayStrategy};
pub use token::{
    with_refreshable_access_token, Account, AccountToken, PersistingTokenRefresher, TokenRefresher,
};

#[cfg(feature = "http")]
pub use hub::HttpNotificationsHub;
#[cfg(feature = "http")]
pub use token::HttpTokenRefresher;

use crate::database::DatabaseError;
use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Access token was rejected")]
    Unauthorized,

    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("Sync failed: {0}")]
    Sync(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl SessionError {
    /// Whether repeating the same request may succeed.
    pub fn can_retry(&self) -> bool {
        match self {
            SessionError::Transport(_) => true,
            SessionError::Http { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            SessionError::Unauthorized
            | SessionError::TokenRefresh(_)
            | SessionError::Sync(_)
            | SessionError::Database(_) => false,
        }
    }
}
