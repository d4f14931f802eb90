//! Network availability gate.

use async_trait::async_trait;
use tokio::sync::watch;

#[async_trait]
pub trait ConnectivityService: Send + Sync {
    /// Resolves once the network is available.
    async fn await_available(&self);
}

/// Connectivity driven by a `watch` channel of "online" flags.
pub struct WatchConnectivity {
    rx: watch::Receiver<bool>,
}

impl WatchConnectivity {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A service paired with the sender that toggles it.
    pub fn channel(online: bool) -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(online);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl ConnectivityService for WatchConnectivity {
    async fn await_available(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|online| *online).await.is_err();
        // nobody reports connectivity any more; stay suspended rather than spin
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
