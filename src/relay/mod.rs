//! Broadcast relay: carries a Speaker's transcript to every Listener.
//!
//! Only two operations are consumed: publishing a text, and receiving the
//! texts published after a subscription was opened. Delivery is
//! at-least-once; a Listener may see a text twice after a reconnect.

pub mod supabase;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};

pub use supabase::{SupabaseConfig, SupabaseRelay};

/// Per-subscription queue depth.
const SUBSCRIPTION_CAPACITY: usize = 256;

#[async_trait]
pub trait BroadcastRelay: Send + Sync {
    async fn publish(&self, text: &str) -> anyhow::Result<()>;

    /// Texts published from now on, until the subscription is dropped.
    async fn subscribe(&self) -> anyhow::Result<RelaySubscription>;
}

/// Stream of relayed texts. Dropping it stops delivery.
pub struct RelaySubscription {
    rx: mpsc::Receiver<String>,
    _guard: DropGuard,
}

impl RelaySubscription {
    /// Returns the queue an adapter task should feed and the token that
    /// tells it to stop.
    pub fn channel() -> (mpsc::Sender<String>, CancellationToken, Self) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let cancel = CancellationToken::new();
        let sub = Self {
            rx,
            _guard: cancel.clone().drop_guard(),
        };
        (tx, cancel, sub)
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

// ── In-process relay ─────────────────────────────────────────────

/// Relay inside one process, for local demos and tests.
#[derive(Clone)]
pub struct LocalRelay {
    tx: broadcast::Sender<String>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIPTION_CAPACITY);
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl BroadcastRelay for LocalRelay {
    async fn publish(&self, text: &str) -> anyhow::Result<()> {
        // No subscribers is not an error: nobody is listening yet.
        let _ = self.tx.send(text.to_string());
        Ok(())
    }

    async fn subscribe(&self) -> anyhow::Result<RelaySubscription> {
        let mut rx = self.tx.subscribe();
        let (out, cancel, sub) = RelaySubscription::channel();

        tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    _ = cancel.cancelled() => break,
                    recv = rx.recv() => match recv {
                        Ok(text) => text,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Relay subscriber lagged, texts dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if out.send(text).await.is_err() {
                    break;
                }
            }
        });

        Ok(sub)
    }
}
