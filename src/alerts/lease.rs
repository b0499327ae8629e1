//! Notification lease
//!
//! One process per queue sends notifications. [`NotifyLease`] takes the
//! queue lock in the store, keeps it renewed from a background worker and
//! tells alerters whether this process owns it right now. Alerters ask
//! before a transition so the notify budget is only spent by the owner.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::clock::SharedClock;
use crate::storage::{queue_lock_key, AlertStore};

pub struct NotifyLease {
    store: Arc<dyn AlertStore>,
    clock: SharedClock,
    queue: String,
    key: String,
    owner: String,
    ttl_ms: i64,
    /// Expiry of the lease held by this process, 0 when not held
    expires_at: AtomicI64,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for NotifyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyLease")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("expires_at", &self.expires_at.load(Ordering::SeqCst))
            .finish()
    }
}

impl NotifyLease {
    pub fn new(
        store: Arc<dyn AlertStore>,
        clock: SharedClock,
        queue: impl Into<String>,
        owner: impl Into<String>,
        ttl_ms: i64,
    ) -> Self {
        let queue = queue.into();
        Self {
            store,
            clock,
            key: queue_lock_key(&queue),
            queue,
            owner: owner.into(),
            ttl_ms: ttl_ms.max(1),
            expires_at: AtomicI64::new(0),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether this process owned the lease at its last renewal and the
    /// lease has not run out since
    pub fn is_held(&self) -> bool {
        self.expires_at.load(Ordering::SeqCst) > self.clock.now()
    }

    /// Take or renew the lease. Store errors count as not holding it.
    pub async fn acquire(&self) -> bool {
        let now = self.clock.now();
        let held = match self.store.acquire_lock(&self.key, &self.owner, self.ttl_ms).await {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to renew notification lease");
                false
            }
        };

        let expires_at = if held { now + self.ttl_ms } else { 0 };
        let previous = self.expires_at.swap(expires_at, Ordering::SeqCst);
        let was_held = previous > now;
        if held && !was_held {
            tracing::info!(key = %self.key, owner = %self.owner, "Notification lease acquired");
        } else if !held && was_held {
            tracing::warn!(key = %self.key, owner = %self.owner, "Notification lease lost");
        }
        held
    }

    /// Whether this process may notify now. Renews once less than half of
    /// the lease is left.
    pub async fn ensure(&self) -> bool {
        let remaining = self.expires_at.load(Ordering::SeqCst) - self.clock.now();
        if remaining > self.ttl_ms / 2 {
            return true;
        }
        self.acquire().await
    }

    /// Give the lease up so another process can take over
    pub async fn release(&self) {
        self.expires_at.store(0, Ordering::SeqCst);
        match self.store.release_lock(&self.key, &self.owner).await {
            Ok(true) => tracing::info!(key = %self.key, "Notification lease released"),
            Ok(false) => {}
            Err(e) => tracing::warn!(key = %self.key, error = %e, "Failed to release notification lease"),
        }
    }

    /// Start the background worker that keeps the lease renewed
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let period = Duration::from_millis((self.ttl_ms / 3).max(1) as u64);
            tracing::info!(key = %self.key, "Notification lease worker started with interval {:?}", period);

            let mut interval = time::interval(period);
            while self.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.acquire().await;
            }

            tracing::info!(key = %self.key, "Notification lease worker stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
