//! Accounts, access tokens and the refresh-on-demand wrapper.

use super::{Result, SessionError};
use crate::database::DatabaseManager;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Row kind used to persist accounts in the store.
pub const ACCOUNT_KIND: &str = "account";

/// Tokens are treated as expired this long before their real expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expiration_date: DateTime<Utc>,
}

impl AccountToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + ChronoDuration::seconds(EXPIRY_SKEW_SECS) >= self.expiration_date
    }
}

impl std::fmt::Debug for AccountToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountToken")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expiration_date", &self.expiration_date)
            .finish()
    }
}

/// A signed-in account. Two snapshots compare equal only when their
/// tokens are the same, which is what the reconciler keys jobs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub server_url: String,
    pub token: Option<AccountToken>,
}

impl Account {
    pub fn access_token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.access_token.as_str())
    }
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Returns `account` with a fresh token.
    async fn refresh(&self, account: &Account) -> Result<Account>;
}

type RefreshSlot = Arc<Mutex<Option<Account>>>;

/// One slot per account id, holding the last refresh result. Slots are
/// never removed; accounts are not expected to come and go often.
fn refresh_slot(account_id: &str) -> RefreshSlot {
    static SLOTS: OnceLock<StdMutex<HashMap<String, RefreshSlot>>> = OnceLock::new();
    let mut slots = SLOTS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    Arc::clone(slots.entry(account_id.to_string()).or_default())
}

/// Refreshes `current`, serialized per account. When another task already
/// replaced `current`'s token with one that is still valid, that result is
/// reused instead of spending the refresh token again.
async fn refresh_serialized(refresher: &dyn TokenRefresher, current: &Account) -> Result<Account> {
    let slot = refresh_slot(&current.id);
    let mut last = slot.lock().await;

    if let Some(refreshed) = last.as_ref() {
        let valid = refreshed
            .token
            .as_ref()
            .map_or(false, |t| !t.is_expired(Utc::now()));
        if valid && refreshed.token != current.token {
            debug!("Reusing token refreshed by another task for account {}", current.id);
            return Ok(refreshed.clone());
        }
    }

    let refreshed = refresher.refresh(current).await?;
    info!("Refreshed access token for account {}", current.id);
    *last = Some(refreshed.clone());
    Ok(refreshed)
}

/// Run `op` with a valid access token for `account`.
///
/// An expired token is refreshed before the first call. If the server
/// still answers `Unauthorized`, the token is refreshed once more and `op`
/// is run again; a second rejection is returned to the caller.
pub async fn with_refreshable_access_token<T, F, Fut>(
    account: &Account,
    refresher: &dyn TokenRefresher,
    mut op: F,
) -> Result<T>
where
    F: FnMut(Account) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut latest = account.clone();
    let expired = latest
        .token
        .as_ref()
        .map_or(false, |t| t.is_expired(Utc::now()));
    if expired {
        latest = refresh_serialized(refresher, &latest).await?;
    }

    match op(latest.clone()).await {
        Err(SessionError::Unauthorized) if latest.token.is_some() => {
            warn!("Access token for account {} was rejected, refreshing", account.id);
            let latest = refresh_serialized(refresher, &latest).await?;
            op(latest).await
        }
        other => other,
    }
}

/// Wraps a refresher so every new token is written to the store and
/// published to the live account list.
pub struct PersistingTokenRefresher {
    inner: Arc<dyn TokenRefresher>,
    manager: Arc<DatabaseManager>,
    accounts: watch::Sender<Vec<Account>>,
}

impl PersistingTokenRefresher {
    pub fn new(
        inner: Arc<dyn TokenRefresher>,
        manager: Arc<DatabaseManager>,
        accounts: watch::Sender<Vec<Account>>,
    ) -> Self {
        Self {
            inner,
            manager,
            accounts,
        }
    }
}

#[async_trait]
impl TokenRefresher for PersistingTokenRefresher {
    async fn refresh(&self, account: &Account) -> Result<Account> {
        let refreshed = self.inner.refresh(account).await?;

        let stored = refreshed.clone();
        self.manager
            .mutate("RefreshToken", |db| async move {
                db.put(ACCOUNT_KIND, &stored.id, &stored)
            })
            .await?;

        self.accounts.send_modify(|accounts| {
            for slot in accounts.iter_mut().filter(|a| a.id == refreshed.id) {
                *slot = refreshed.clone();
            }
        });
        Ok(refreshed)
    }
}

#[cfg(feature = "http")]
pub use http::HttpTokenRefresher;

#[cfg(feature = "http")]
mod http {
    use super::*;

    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
        refresh_token: Option<String>,
        expires_in: i64,
    }

    /// OAuth2 `refresh_token` grant against `<server>/identity/connect/token`.
    pub struct HttpTokenRefresher {
        client: reqwest::Client,
        client_id: String,
    }

    impl HttpTokenRefresher {
        pub fn new(client_id: &str) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            Ok(Self {
                client,
                client_id: client_id.to_string(),
            })
        }
    }

    #[async_trait]
    impl TokenRefresher for HttpTokenRefresher {
        async fn refresh(&self, account: &Account) -> Result<Account> {
            let token = account.token.as_ref().ok_or_else(|| {
                SessionError::TokenRefresh(format!("Account {} has no refresh token", account.id))
            })?;
            let url = format!(
                "{}/identity/connect/token",
                account.server_url.trim_end_matches('/')
            );

            let resp = self
                .client
                .post(&url)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("client_id", self.client_id.as_str()),
                    ("refresh_token", token.refresh_token.as_str()),
                ])
                .send()
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
                return Err(SessionError::TokenRefresh(format!("{}: {}", status, body)));
            }

            let body: TokenResponse = resp
                .json()
                .await
                .map_err(|e| SessionError::TokenRefresh(format!("Invalid token response: {}", e)))?;

            Ok(Account {
                token: Some(AccountToken {
                    access_token: body.access_token,
                    refresh_token: body.refresh_token.unwrap_or_else(|| token.refresh_token.clone()),
                    expiration_date: Utc::now() + ChronoDuration::seconds(body.expires_in),
                }),
                ..account.clone()
            })
        }
    }
}
