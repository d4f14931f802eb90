//! Server push channel.

use super::token::Account;
use super::Result;
use async_trait::async_trait;
use serde::Deserialize;

/// One push from the server. Every message, whatever its type, means the
/// account's data changed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait NotificationsHub: Send + Sync {
    /// Stay connected for `account` and report every message.
    ///
    /// Returns `Ok` when the server ends the session cleanly and an error
    /// when the connection fails.
    async fn connect(
        &self,
        account: &Account,
        on_message: &(dyn Fn(HubMessage) + Send + Sync),
    ) -> Result<()>;
}

#[cfg(feature = "http")]
pub use http::HttpNotificationsHub;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::session::SessionError;
    use reqwest::StatusCode;
    use std::time::Duration;
    use tracing::debug;

    /// Long-polls `<server>/notifications/poll`.
    ///
    /// `200` carries a JSON array of messages, `204` means the poll timed
    /// out empty and `410` ends the session.
    pub struct HttpNotificationsHub {
        client: reqwest::Client,
    }

    impl HttpNotificationsHub {
        pub fn new(poll_timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(poll_timeout + Duration::from_secs(10))
                .build()
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            Ok(Self { client })
        }

        async fn poll(&self, account: &Account) -> Result<Option<Vec<HubMessage>>> {
            let token = account.access_token().ok_or(SessionError::Unauthorized)?;
            let url = format!("{}/notifications/poll", account.server_url.trim_end_matches('/'));

            let resp = self
                .client
                .get(&url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;

            match resp.status() {
                StatusCode::OK => resp
                    .json::<Vec<HubMessage>>()
                    .await
                    .map(Some)
                    .map_err(|e| SessionError::Transport(format!("Invalid notification: {}", e))),
                StatusCode::NO_CONTENT => Ok(Some(Vec::new())),
                StatusCode::GONE => Ok(None),
                StatusCode::UNAUTHORIZED => Err(SessionError::Unauthorized),
                status => {
                    let message = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
                    Err(SessionError::Http {
                        status: status.as_u16(),
                        message,
                    })
                }
            }
        }
    }

    #[async_trait]
    impl NotificationsHub for HttpNotificationsHub {
        async fn connect(
            &self,
            account: &Account,
            on_message: &(dyn Fn(HubMessage) + Send + Sync),
        ) -> Result<()> {
            debug!("Connected to notifications for account {}", account.id);
            while let Some(messages) = self.poll(account).await? {
                for message in messages {
                    on_message(message);
                }
            }
            debug!("Notifications session for account {} ended by server", account.id);
            Ok(())
        }
    }
}
