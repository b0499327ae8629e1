//! Tick scheduler
//!
//! Windowed aggregators only rotate when they see a sample or a tick. The
//! scheduler sends ticks at the greatest common divisor of all aggregator
//! periods so idle metrics still decay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use super::dispatcher::Dispatcher;
use crate::clock::SharedClock;

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Tick interval for a set of periods, never below `min_ms`. `None` when no
/// period is registered.
pub fn tick_interval(periods: &[i64], min_ms: i64) -> Option<i64> {
    let interval = periods
        .iter()
        .copied()
        .filter(|p| *p > 0)
        .reduce(gcd)?;
    Some(interval.max(min_ms.max(1)))
}

/// Background worker that ticks every periodic metric
pub struct TickScheduler {
    dispatcher: Arc<Dispatcher>,
    clock: SharedClock,
    min_interval_ms: i64,
    running: Arc<AtomicBool>,
}

impl TickScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, clock: SharedClock, min_interval_ms: i64) -> Self {
        Self {
            dispatcher,
            clock,
            min_interval_ms: min_interval_ms.max(1),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current tick interval; metrics may come and go between ticks
    pub fn interval(&self) -> Option<i64> {
        tick_interval(&self.dispatcher.registry().periods(), self.min_interval_ms)
    }

    /// Start the background worker
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!(min_interval_ms = self.min_interval_ms, "Tick scheduler started");

            while self.running.load(Ordering::SeqCst) {
                let Some(interval) = self.interval() else {
                    time::sleep(Duration::from_millis(self.min_interval_ms as u64)).await;
                    continue;
                };
                time::sleep(Duration::from_millis(interval as u64)).await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }

                let now = self.clock.now();
                let sent = self.dispatcher.tick(now).await;
                tracing::trace!(ts = now, metrics = sent, "Tick sent");
            }

            tracing::info!("Tick scheduler stopped");
        })
    }

    /// Stop the worker after its current sleep
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
