use super::*;
use crate::session::connectivity::WatchConnectivity;
use crate::session::token::AccountToken;
use crate::session::SessionError;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

fn account(id: &str, access: &str) -> Account {
    account_expiring(id, access, ChronoDuration::hours(1))
}

fn account_expiring(id: &str, access: &str, expires_in: ChronoDuration) -> Account {
    Account {
        id: id.to_string(),
        server_url: "https://vault.example.com".to_string(),
        token: Some(AccountToken {
            access_token: access.to_string(),
            refresh_token: format!("{}-refresh", id),
            expiration_date: Utc::now() + expires_in,
        }),
    }
}

/// Counts connections that went away, however they ended.
struct Live<'a>(&'a AtomicU32);

impl Drop for Live<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeHub {
    /// Access tokens, one per connection attempt.
    connects: StdMutex<Vec<String>>,
    closed: AtomicU32,
    /// Delivered on every connection.
    messages: Vec<HubMessage>,
    /// End each session right away instead of holding it open.
    end_session: bool,
}

impl FakeHub {
    fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }

    fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationsHub for FakeHub {
    async fn connect(
        &self,
        account: &Account,
        on_message: &(dyn Fn(HubMessage) + Send + Sync),
    ) -> Result<()> {
        let token = account.access_token().unwrap_or_default().to_string();
        self.connects.lock().unwrap().push(token);
        let _live = Live(&self.closed);
        for message in &self.messages {
            on_message(message.clone());
        }
        if !self.end_session {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeQueue {
    synced: StdMutex<Vec<String>>,
    sync_all_calls: AtomicU32,
    fail_sync_all: bool,
}

#[async_trait]
impl SyncQueue for FakeQueue {
    async fn queue_sync(&self, account_id: &str) -> Result<()> {
        self.synced.lock().unwrap().push(account_id.to_string());
        Ok(())
    }

    async fn queue_sync_all(&self) -> Result<()> {
        self.sync_all_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sync_all {
            Err(SessionError::Sync("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

struct FreshRefresher;

#[async_trait]
impl TokenRefresher for FreshRefresher {
    async fn refresh(&self, account: &Account) -> Result<Account> {
        Ok(account_expiring(&account.id, "fresh", ChronoDuration::hours(1)))
    }
}

struct Harness {
    accounts: watch::Sender<Vec<Account>>,
    online: watch::Sender<bool>,
    hub: Arc<FakeHub>,
    queue: Arc<FakeQueue>,
    handle: JoinHandle<()>,
}

fn launch(accounts: Vec<Account>, hub: FakeHub, queue: FakeQueue, online: bool) -> Harness {
    let (accounts_tx, accounts_rx) = watch::channel(accounts);
    let (online_tx, connectivity) = WatchConnectivity::channel(online);
    let hub = Arc::new(hub);
    let queue = Arc::new(queue);

    let handle = NotificationsReconciler::new(
        accounts_rx,
        Arc::clone(&hub) as Arc<dyn NotificationsHub>,
        Arc::new(FreshRefresher),
        Arc::new(connectivity),
        Arc::clone(&queue) as Arc<dyn SyncQueue>,
    )
    .with_reconnect_delay(Duration::from_secs(5))
    .launch();

    Harness {
        accounts: accounts_tx,
        online: online_tx,
        hub,
        queue,
        handle,
    }
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_sync_failure_is_swallowed() {
    let queue = FakeQueue {
        fail_sync_all: true,
        ..Default::default()
    };
    let h = launch(vec![account("a", "a1")], FakeHub::default(), queue, true);
    settle().await;

    assert_eq!(h.queue.sync_all_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.hub.connects(), vec!["a1"]);
    assert!(!h.handle.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_accounts_keep_their_connection() {
    let h = launch(
        vec![account("a", "a1"), account("b", "b1")],
        FakeHub::default(),
        FakeQueue::default(),
        true,
    );
    settle().await;

    h.accounts.send_modify(|accounts| accounts.push(account("c", "c1")));
    settle().await;

    let mut connects = h.hub.connects();
    connects.sort();
    assert_eq!(connects, vec!["a1", "b1", "c1"]);
    assert_eq!(h.hub.closed(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_changed_token_restarts_only_that_account() {
    let h = launch(
        vec![account("a", "a1"), account("b", "b1")],
        FakeHub::default(),
        FakeQueue::default(),
        true,
    );
    settle().await;

    h.accounts.send_modify(|accounts| accounts[0] = account("a", "a2"));
    settle().await;

    let connects = h.hub.connects();
    assert_eq!(connects.len(), 3);
    assert_eq!(connects[2], "a2");
    assert_eq!(connects.iter().filter(|t| t.starts_with('b')).count(), 1);
    assert_eq!(h.hub.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_removed_account_is_stopped() {
    let h = launch(
        vec![account("a", "a1"), account("b", "b1")],
        FakeHub::default(),
        FakeQueue::default(),
        true,
    );
    settle().await;

    h.accounts.send_modify(|accounts| accounts.retain(|a| a.id != "b"));
    settle().await;
    assert_eq!(h.hub.closed(), 1);
    assert_eq!(h.hub.connects().len(), 2);

    drop(h.accounts);
    h.handle.await.unwrap();
    settle().await;
    assert_eq!(h.hub.closed(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_message_queues_sync_for_that_account() {
    let hub = FakeHub {
        messages: vec![HubMessage {
            kind: 0,
            payload: serde_json::Value::Null,
        }],
        ..Default::default()
    };
    let h = launch(vec![account("a", "a1")], hub, FakeQueue::default(), true);
    settle().await;

    assert_eq!(*h.queue.synced.lock().unwrap(), vec!["a".to_string()]);
    assert_eq!(h.queue.sync_all_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_offline_suspends_connecting() {
    let h = launch(
        vec![account("a", "a1")],
        FakeHub::default(),
        FakeQueue::default(),
        false,
    );
    sleep(Duration::from_secs(60)).await;
    assert!(h.hub.connects().is_empty());

    h.online.send(true).unwrap();
    settle().await;
    assert_eq!(h.hub.connects(), vec!["a1"]);
}

#[tokio::test(start_paused = true)]
async fn test_expired_token_is_refreshed_before_connecting() {
    let stale = account_expiring("a", "stale", ChronoDuration::seconds(5));
    let h = launch(vec![stale], FakeHub::default(), FakeQueue::default(), true);

    sleep(Duration::from_millis(1_000)).await;
    assert!(h.hub.connects().is_empty());

    sleep(Duration::from_millis(1_000)).await;
    assert_eq!(h.hub.connects(), vec!["fresh"]);
}

#[tokio::test(start_paused = true)]
async fn test_clean_session_end_reconnects_after_delay() {
    let hub = FakeHub {
        end_session: true,
        ..Default::default()
    };
    let h = launch(vec![account("a", "a1")], hub, FakeQueue::default(), true);
    settle().await;
    assert_eq!(h.hub.connects().len(), 1);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.hub.connects().len(), 2);
}
