//! Job and result model.
//!
//! Job ids are opaque strings assigned by the submitter (generated when
//! empty). Deadlines are absolute unix milliseconds so they survive the trip
//! through an envelope; the supervisor converts to instants at admission.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use substrate::{Error, JobResultWire};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub operation: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub priority: JobPriority,
    /// Absolute deadline, unix milliseconds. None means no deadline.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// DID charged for the execution cost, when known.
    #[serde(default)]
    pub submitter_did: Option<String>,
}

impl Job {
    pub fn new(job_type: &str, operation: &str) -> Self {
        Self {
            id: String::new(),
            job_type: job_type.to_string(),
            operation: operation.to_string(),
            parameters: Map::new(),
            data: Vec::new(),
            priority: JobPriority::Normal,
            deadline_ms: None,
            submitter_did: None,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn with_deadline_in(mut self, d: Duration) -> Self {
        self.deadline_ms = Some((Utc::now().timestamp_millis() as u64).saturating_add(d.as_millis() as u64));
        self
    }

    pub fn with_submitter(mut self, did: &str) -> Self {
        self.submitter_did = Some(did.to_string());
        self
    }

    /// Remaining time until the deadline; `None` when there is no deadline,
    /// `Some(ZERO)` when it already passed.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline_ms.map(|dl| {
            let now = Utc::now().timestamp_millis() as u64;
            Duration::from_millis(dl.saturating_sub(now))
        })
    }

    pub fn deadline_expired(&self) -> bool {
        matches!(self.time_remaining(), Some(d) if d.is_zero())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub duration_us: u64,
    pub cost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    pub data: Vec<u8>,
    pub error: Option<String>,
    pub metrics: JobMetrics,
}

impl JobResult {
    pub fn ok(job_id: &str, data: Vec<u8>, metrics: JobMetrics) -> Self {
        Self {
            job_id: job_id.to_string(),
            success: true,
            data,
            error: None,
            metrics,
        }
    }

    /// Failure carrying the bare error kind, stable across versions.
    pub fn failure(job_id: &str, err: &Error) -> Self {
        Self {
            job_id: job_id.to_string(),
            success: false,
            data: Vec::new(),
            error: Some(err.kind_name().to_string()),
            metrics: JobMetrics::default(),
        }
    }
}

impl From<JobResultWire> for JobResult {
    fn from(w: JobResultWire) -> Self {
        Self {
            job_id: w.job_id,
            success: w.success,
            data: w.data,
            error: w.error,
            metrics: JobMetrics {
                duration_us: w.duration_us,
                cost: w.cost,
            },
        }
    }
}

impl From<&JobResult> for JobResultWire {
    fn from(r: &JobResult) -> Self {
        Self {
            job_id: r.job_id.clone(),
            success: r.success,
            data: r.data.clone(),
            error: r.error.clone(),
            duration_us: r.metrics.duration_us,
            cost: r.metrics.cost,
        }
    }
}
