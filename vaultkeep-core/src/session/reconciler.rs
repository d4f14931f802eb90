//! Keeps one notifications connection alive per signed-in account.

use super::connectivity::ConnectivityService;
use super::hub::{HubMessage, NotificationsHub};
use super::queue::SyncQueue;
use super::retry::{with_retry, RetryDelayStrategy};
use super::token::{with_refreshable_access_token, Account, TokenRefresher};
use super::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Pause before connecting with a token that was just refreshed. The
/// refreshed account is published to the account list, which normally
/// replaces this job before the pause ends.
const REFRESH_SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// Pause before reconnecting after the server ended a session cleanly.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct Services {
    hub: Arc<dyn NotificationsHub>,
    refresher: Arc<dyn TokenRefresher>,
    connectivity: Arc<dyn ConnectivityService>,
    queue: Arc<dyn SyncQueue>,
    refresh_delay: Duration,
    reconnect_delay: Duration,
}

/// A running job and the account snapshot it was started for. Dropping
/// it aborts the job.
struct AccountJob {
    account: Account,
    handle: JoinHandle<()>,
}

impl Drop for AccountJob {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Watches the account list and reconciles it against the running
/// notification jobs.
///
/// Each step compares the new snapshot with the jobs of the previous one:
/// accounts whose snapshot is unchanged keep their connection, changed
/// accounts (usually a new token) are restarted and missing accounts are
/// stopped. A push for an account queues a sync of that account only.
pub struct NotificationsReconciler {
    accounts: watch::Receiver<Vec<Account>>,
    services: Services,
}

impl NotificationsReconciler {
    pub fn new(
        accounts: watch::Receiver<Vec<Account>>,
        hub: Arc<dyn NotificationsHub>,
        refresher: Arc<dyn TokenRefresher>,
        connectivity: Arc<dyn ConnectivityService>,
        queue: Arc<dyn SyncQueue>,
    ) -> Self {
        Self {
            accounts,
            services: Services {
                hub,
                refresher,
                connectivity,
                queue,
                refresh_delay: REFRESH_SETTLE_DELAY,
                reconnect_delay: RECONNECT_DELAY,
            },
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.services.refresh_delay = delay;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.services.reconnect_delay = delay;
        self
    }

    /// Start reconciling. Runs until the account list sender is dropped or
    /// the returned handle is aborted; either way every account job stops
    /// with it.
    pub fn launch(self) -> JoinHandle<()> {
        let Self {
            accounts,
            services,
        } = self;
        tokio::spawn(run(accounts, Arc::new(services)))
    }
}

async fn run(mut accounts: watch::Receiver<Vec<Account>>, services: Arc<Services>) {
    let queue = Arc::clone(&services.queue);
    tokio::spawn(async move {
        if let Err(e) = queue.queue_sync_all().await {
            warn!("Failed to queue startup sync: {}", e);
        }
    });

    let mut jobs: HashMap<String, AccountJob> = HashMap::new();
    loop {
        let snapshot = accounts.borrow_and_update().clone();
        jobs = reconcile(jobs, snapshot, &services);
        if accounts.changed().await.is_err() {
            break;
        }
    }
    info!("Account list closed, stopping {} notification job(s)", jobs.len());
}

/// One fold step: the jobs of the previous snapshot in, the jobs of
/// `accounts` out.
fn reconcile(
    mut previous: HashMap<String, AccountJob>,
    accounts: Vec<Account>,
    services: &Arc<Services>,
) -> HashMap<String, AccountJob> {
    let mut next = HashMap::with_capacity(accounts.len());
    for account in accounts {
        let id = account.id.clone();
        let job = match previous.remove(&id) {
            Some(job) if job.account == account => job,
            existing => {
                if existing.is_some() {
                    info!("Account {} changed, restarting notifications", id);
                } else {
                    info!("Starting notifications for account {}", id);
                }
                drop(existing);
                let handle = tokio::spawn(run_account(Arc::clone(services), account.clone()));
                AccountJob { account, handle }
            }
        };
        next.insert(id, job);
    }

    for id in previous.keys() {
        info!("Account {} removed, stopping notifications", id);
    }
    next
}

/// Connect for `account` until the job is aborted. Failures are logged and
/// retried; they never end the job.
async fn run_account(services: Arc<Services>, account: Account) {
    let mut strategy = RetryDelayStrategy::new();
    loop {
        match services.connect(&account).await {
            Ok(()) => {
                debug!("Notifications session for account {} ended", account.id);
                strategy.reset();
                sleep(services.reconnect_delay).await;
            }
            Err(e) => {
                warn!("Notifications for account {} failed: {}", account.id, e);
                strategy.wait().await;
            }
        }
    }
}

impl Services {
    async fn connect(&self, account: &Account) -> Result<()> {
        with_refreshable_access_token(account, self.refresher.as_ref(), move |latest| async move {
            if latest != *account {
                sleep(self.refresh_delay).await;
            }

            let account_id = latest.id.clone();
            let on_message = move |message: HubMessage| self.on_message(&account_id, message);
            let latest = &latest;
            let on_message = &on_message;
            with_retry(move || async move {
                self.connectivity.await_available().await;
                self.hub.connect(latest, on_message).await
            })
            .await
        })
        .await
    }

    fn on_message(&self, account_id: &str, message: HubMessage) {
        debug!("Notification of type {} for account {}", message.kind, account_id);
        let queue = Arc::clone(&self.queue);
        let account_id = account_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = queue.queue_sync(&account_id).await {
                warn!("Failed to queue sync for account {}: {}", account_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests;
