//! Job event fan-out
//!
//! Every metric gets its own lane: a bounded channel drained by one worker
//! task, so events and ticks reach a metric in the order they were sent.
//! Workers share one semaphore, which bounds how many metrics are processed
//! at the same time.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

use crate::metrics::{JobEvent, MetricHandle, MetricRegistry};

/// Default number of metrics processed concurrently
pub const DEFAULT_CONCURRENCY: usize = 16;
/// Default number of queued messages per lane
pub const DEFAULT_LANE_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum LaneMessage {
    Event(Arc<JobEvent>),
    /// Rotate the aggregator windows to this time
    Tick(i64),
    /// Signalled once everything queued before it was handled
    Flush(oneshot::Sender<()>),
}

/// Dispatcher counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    pub events_received: u64,
    /// Event deliveries, one per matching metric
    pub events_dispatched: u64,
    pub events_unmatched: u64,
    pub ticks: u64,
    pub send_errors: u64,
}

struct Lane {
    tx: mpsc::Sender<LaneMessage>,
    worker: JoinHandle<()>,
}

pub struct Dispatcher {
    registry: Arc<MetricRegistry>,
    lanes: Mutex<FxHashMap<String, Lane>>,
    permits: Arc<Semaphore>,
    lane_capacity: usize,
    stats: RwLock<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(registry: Arc<MetricRegistry>, concurrency: usize, lane_capacity: usize) -> Self {
        Self {
            registry,
            lanes: Mutex::new(FxHashMap::default()),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            lane_capacity: lane_capacity.max(1),
            stats: RwLock::new(DispatcherStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.read().clone()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Queue `event` on the lane of every metric that samples it. Waits while
    /// a lane is full. Returns the number of lanes it was queued on.
    pub async fn dispatch(&self, event: JobEvent) -> usize {
        let event = Arc::new(event);
        let targets = self.registry.matching(&event);

        let mut sent = 0;
        for metric in &targets {
            let tx = self.lane_sender(metric);
            if tx.send(LaneMessage::Event(Arc::clone(&event))).await.is_ok() {
                sent += 1;
            } else {
                tracing::warn!(metric_id = %metric.id(), "Lane closed, dropping event");
                self.stats.write().send_errors += 1;
            }
        }

        let mut stats = self.stats.write();
        stats.events_received += 1;
        stats.events_dispatched += sent as u64;
        if targets.is_empty() {
            stats.events_unmatched += 1;
        }
        sent
    }

    /// Send a tick to every metric whose aggregator rotates on a period
    pub async fn tick(&self, ts: i64) -> usize {
        let targets: Vec<Arc<MetricHandle>> = self
            .registry
            .list()
            .into_iter()
            .filter(|m| m.period().is_some())
            .collect();

        let mut sent = 0;
        for metric in &targets {
            let tx = self.lane_sender(metric);
            if tx.send(LaneMessage::Tick(ts)).await.is_ok() {
                sent += 1;
            }
        }
        self.stats.write().ticks += 1;
        sent
    }

    /// Wait until every message queued so far has been handled
    pub async fn flush(&self) {
        let senders: Vec<mpsc::Sender<LaneMessage>> =
            self.lanes.lock().values().map(|lane| lane.tx.clone()).collect();

        let mut pending = Vec::with_capacity(senders.len());
        for tx in senders {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(LaneMessage::Flush(done_tx)).await.is_ok() {
                pending.push(done_rx);
            }
        }
        for done in pending {
            let _ = done.await;
        }
    }

    /// Close the lane of a metric after it drains. Returns whether a lane
    /// existed.
    pub async fn close_lane(&self, metric_id: &str) -> bool {
        let lane = self.lanes.lock().remove(metric_id);
        match lane {
            Some(lane) => {
                Self::join(metric_id, lane).await;
                true
            }
            None => false,
        }
    }

    /// Close every lane and wait for the workers to drain
    pub async fn shutdown(&self) {
        let lanes: Vec<(String, Lane)> = self.lanes.lock().drain().collect();
        for (metric_id, lane) in lanes {
            Self::join(&metric_id, lane).await;
        }
        tracing::info!("Dispatcher stopped");
    }

    async fn join(metric_id: &str, lane: Lane) {
        let Lane { tx, worker } = lane;
        drop(tx);
        if let Err(e) = worker.await {
            tracing::error!(metric_id = %metric_id, error = %e, "Lane worker failed");
        }
    }

    fn lane_sender(&self, metric: &Arc<MetricHandle>) -> mpsc::Sender<LaneMessage> {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get(metric.id()) {
            if !lane.tx.is_closed() {
                return lane.tx.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.lane_capacity);
        let worker = tokio::spawn(run_lane(Arc::clone(metric), rx, Arc::clone(&self.permits)));
        tracing::debug!(metric_id = %metric.id(), "Opened metric lane");
        lanes.insert(metric.id().to_string(), Lane { tx: tx.clone(), worker });
        tx
    }
}

async fn run_lane(metric: Arc<MetricHandle>, mut rx: mpsc::Receiver<LaneMessage>, permits: Arc<Semaphore>) {
    while let Some(message) = rx.recv().await {
        match message {
            LaneMessage::Event(event) => {
                let Ok(_permit) = permits.acquire().await else {
                    break;
                };
                metric.process_event(&event).await;
            }
            LaneMessage::Tick(ts) => {
                let Ok(_permit) = permits.acquire().await else {
                    break;
                };
                metric.process_tick(ts).await;
            }
            LaneMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!(metric_id = %metric.id(), "Metric lane closed");
}
