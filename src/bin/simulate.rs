//! queuewatch simulator
//!
//! Run with: cargo run --bin simulate
//!
//! Drives the engine with synthetic job traffic: a calm phase, an incident
//! with slow and failing jobs, then recovery. Alerts and rule state changes
//! are logged as they happen.
//!
//! Environment variables:
//! - QUEUEWATCH_SIM_SECONDS: Length of the run (default: 12)
//! - QUEUEWATCH_*: Engine configuration, see `EngineConfig::from_env`
//! - RUST_LOG: Log level (default: queuewatch=info)

use std::time::Duration;

use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use queuewatch::aggregators::{AggregatorConfig, EwmaOptions, EwmaPreset, QuantileOptions, WindowOptions};
use queuewatch::alerts::{Rule, RuleAlertOptions, Severity};
use queuewatch::conditions::{CompareOp, Condition};
use queuewatch::metrics::{JobEvent, JobRef, MetricConfig, MetricType};
use queuewatch::{Engine, EngineConfig, EngineEvent};

const JOB_NAMES: &[&str] = &["email.send", "email.digest", "report.build", "image.resize"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Calm,
    Incident,
    Recovery,
}

impl Phase {
    fn at(elapsed: Duration, total: Duration) -> Self {
        let third = total / 3;
        if elapsed < third {
            Phase::Calm
        } else if elapsed < third * 2 {
            Phase::Incident
        } else {
            Phase::Recovery
        }
    }

    /// (base latency ms, failure probability)
    fn profile(&self) -> (f64, f64) {
        match self {
            Phase::Calm | Phase::Recovery => (120.0, 0.02),
            Phase::Incident => (900.0, 0.35),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "queuewatch=info,simulate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let seconds: u64 = std::env::var("QUEUEWATCH_SIM_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(12);
    let total = Duration::from_secs(seconds.max(3));

    let config = EngineConfig::from_env();
    tracing::info!("queuewatch simulator:");
    tracing::info!("  Queue: {}", config.queue);
    tracing::info!("  Concurrency: {}", config.concurrency);
    tracing::info!("  Duration: {:?}", total);

    let engine = Engine::new(config);
    setup(&engine).await?;
    engine.start();

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::AlertTriggered { alert } => {
                    tracing::info!(rule_id = %alert.rule_id, value = alert.value, "ALERT {}", alert.message);
                }
                EngineEvent::AlertReset { alert } => {
                    tracing::info!(rule_id = %alert.rule_id, "RESOLVED {}", alert.message);
                }
                EngineEvent::RuleStateChanged { rule_id, state, .. } => {
                    tracing::info!(rule_id = %rule_id, state = %state, "Rule state changed");
                }
                _ => {}
            }
        }
    });

    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    let mut sent = 0u64;
    let mut last_phase = None;

    while started.elapsed() < total {
        ticker.tick().await;
        let phase = Phase::at(started.elapsed(), total);
        if last_phase != Some(phase) {
            tracing::info!(phase = ?phase, "Traffic phase");
            last_phase = Some(phase);
        }

        for event in traffic(phase, engine.clock().now(), sent) {
            engine.submit(event).await;
            sent += 1;
        }
    }

    engine.flush().await;
    for rule in engine.rules().list() {
        let alerts = engine.rules().get_alerts(&rule.id, 0, i64::MAX).await?;
        tracing::info!(rule_id = %rule.id, state = %rule.state, alerts = alerts.len(), "Final rule state");
    }
    tracing::info!(events = sent, stats = ?engine.dispatcher().stats(), "Simulation finished");

    engine.shutdown().await;
    printer.abort();
    Ok(())
}

async fn setup(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    engine
        .add_metric(
            MetricConfig::new("latency_p95", "p95 latency", MetricType::Latency).with_aggregator(
                AggregatorConfig::Quantile(
                    QuantileOptions::new(0.95).with_window(WindowOptions::new(3_000).with_granularity(250)),
                ),
            ),
        )
        .await?;
    engine
        .add_metric(
            MetricConfig::new("failures", "Failed jobs", MetricType::FailedCount)
                .with_aggregator(AggregatorConfig::Sum(WindowOptions::new(2_000).with_granularity(250))),
        )
        .await?;
    engine
        .add_metric(
            MetricConfig::new("error_rate", "Error rate", MetricType::ErrorRate)
                .with_aggregator(AggregatorConfig::Mean(WindowOptions::new(3_000).with_granularity(250))),
        )
        .await?;
    engine
        .add_metric(
            MetricConfig::new("throughput", "Completed per second", MetricType::CompletedCount)
                .with_job_filter("^email\\.")
                .with_aggregator(AggregatorConfig::Ewma(
                    EwmaOptions::rate(EwmaPreset::OneMinute).with_half_life(5_000),
                )),
        )
        .await?;

    let rules = engine.rules();
    rules
        .create(
            Rule::new(
                "slow-jobs",
                "Slow jobs",
                "latency_p95",
                Condition::threshold(CompareOp::Gt, 800.0).with_warning(400.0),
            )
            .with_severity(Severity::Critical)
            .with_channel("ops")
            .with_alert_options(
                RuleAlertOptions::default()
                    .with_failure_threshold(3)
                    .with_recovery_window(1_500)
                    .with_notify_interval(2_000)
                    .with_alert_on_reset(true),
            ),
        )
        .await?;
    rules
        .create(
            Rule::new("failure-spike", "Failure spike", "failures", Condition::peak(3.0))
                .with_channel("ops")
                .with_alert_options(RuleAlertOptions::default().with_recovery_window(1_000)),
        )
        .await?;
    rules
        .create(
            Rule::new(
                "error-rate",
                "Error rate",
                "error_rate",
                Condition::threshold(CompareOp::Gte, 0.2).with_warning(0.1),
            )
            .with_alert_options(
                RuleAlertOptions::default()
                    .with_warmup_window(500)
                    .with_failure_threshold(5)
                    .with_recovery_window(1_000)
                    .with_max_alerts(3),
            ),
        )
        .await?;
    Ok(())
}

/// A handful of job events for one 20ms step
fn traffic(phase: Phase, now: i64, seq: u64) -> Vec<JobEvent> {
    let mut rng = rand::thread_rng();
    let (base_latency, failure_rate) = phase.profile();
    let count = rng.gen_range(1..=4);

    let mut events = Vec::with_capacity(count * 2);
    for i in 0..count {
        let name = JOB_NAMES[rng.gen_range(0..JOB_NAMES.len())];
        let job = JobRef::new(format!("{}", seq + i as u64), name, now - rng.gen_range(0..500));
        let wait = rng.gen_range(0.0..50.0);

        if rng.gen_bool(failure_rate) {
            events.push(JobEvent::failed(job.clone(), now, wait));
            events.push(JobEvent::finished(job, now, false));
        } else {
            let latency = base_latency * rng.gen_range(0.5..1.5);
            events.push(JobEvent::completed(job.clone(), now, latency, wait));
            events.push(JobEvent::finished(job, now, true));
        }
    }
    events
}
