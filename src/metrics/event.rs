use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEventKind {
    #[serde(rename = "job.completed")]
    Completed,
    #[serde(rename = "job.failed")]
    Failed,
    #[serde(rename = "job.finished")]
    Finished,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Completed => "job.completed",
            JobEventKind::Failed => "job.failed",
            JobEventKind::Finished => "job.finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRef {
    pub id: String,
    pub name: String,
    /// Job creation time (ms)
    pub timestamp: i64,
}

impl JobRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            timestamp,
        }
    }
}

/// Job lifecycle event emitted by a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: JobRef,
    /// Event time (ms)
    pub ts: i64,
    /// Processing time (ms)
    #[serde(default)]
    pub latency: Option<f64>,
    /// Time spent waiting in the queue (ms)
    #[serde(default)]
    pub wait: Option<f64>,
    #[serde(default)]
    pub success: bool,
}

impl JobEvent {
    pub fn completed(job: JobRef, ts: i64, latency: f64, wait: f64) -> Self {
        Self {
            kind: JobEventKind::Completed,
            job,
            ts,
            latency: Some(latency),
            wait: Some(wait),
            success: true,
        }
    }

    pub fn failed(job: JobRef, ts: i64, wait: f64) -> Self {
        Self {
            kind: JobEventKind::Failed,
            job,
            ts,
            latency: None,
            wait: Some(wait),
            success: false,
        }
    }

    pub fn finished(job: JobRef, ts: i64, success: bool) -> Self {
        Self {
            kind: JobEventKind::Finished,
            job,
            ts,
            latency: None,
            wait: None,
            success,
        }
    }
}
