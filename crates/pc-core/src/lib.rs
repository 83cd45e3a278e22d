use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub mod clients;
pub mod errors;
pub mod frames;
pub mod service;

pub use errors::{classify, ClassifiedError, ErrorCode};
pub use service::{
    RequestMethod, ResponseMeta, ServiceAdapter, ServiceError, ServiceFuture, ServiceReply,
    ServiceRequest, TransportError,
};

pub const MAX_PROGRESS: i64 = 100;

/// The two kinds of externally executed work the client tracks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum JobClass {
    Agent,
    Generation,
}

impl JobClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::Agent => "agent",
            JobClass::Generation => "generation",
        }
    }

    /// Field carrying the identifier in records and events of this class.
    pub fn id_field(&self) -> &'static str {
        match self {
            JobClass::Agent => "runId",
            JobClass::Generation => "jobId",
        }
    }

    /// Field naming the lock owner in a `LOCK_CONFLICT` reply.
    pub fn active_id_field(&self) -> &'static str {
        match self {
            JobClass::Agent => "activeRunId",
            JobClass::Generation => "activeJobId",
        }
    }

    pub fn trace_prefix(&self) -> &'static str {
        match self {
            JobClass::Agent => "agent",
            JobClass::Generation => "gen",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobClass {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "agent" | "agent-run" | "agent_run" | "run" => Ok(JobClass::Agent),
            "generation" | "gen" | "job" => Ok(JobClass::Generation),
            other => Err(format!("Unknown job class: {other}")),
        }
    }
}

/// Identifies one tracked job. The id is opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub class: JobClass,
    pub id: String,
}

impl JobHandle {
    pub fn new(class: JobClass, id: impl Into<String>) -> Self {
        Self {
            class,
            id: id.into(),
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.id)
    }
}

pub fn is_terminal_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "completed" | "done" | "failed" | "canceled" | "cancelled" | "reverted"
    )
}

pub fn is_terminal_event(event: &str) -> bool {
    matches!(
        event.trim(),
        "job_completed"
            | "job_failed"
            | "job_canceled"
            | "run_completed"
            | "run_failed"
            | "run_canceled"
            | "run_reverted"
    )
}

/// Returns the status string of a record, if it has one.
pub fn record_status(record: &Value) -> Option<&str> {
    record.get("status").and_then(Value::as_str)
}

pub fn record_is_terminal(record: &Value) -> bool {
    record_status(record).map(is_terminal_status).unwrap_or(false)
}

/// Reads the job identifier from a record, accepting either id field and
/// numeric ids.
pub fn record_id(record: &Value) -> Option<String> {
    record.as_object().and_then(record_id_in)
}

pub fn record_id_in(record: &Map<String, Value>) -> Option<String> {
    for field in ["jobId", "runId", "id"] {
        match record.get(field) {
            Some(Value::String(value)) if !value.trim().is_empty() => {
                return Some(value.trim().to_string())
            }
            Some(Value::Number(value)) => return Some(value.to_string()),
            _ => {}
        }
    }
    None
}

/// Clamps a raw progress value to the 0..=100 range the UI displays.
pub fn clamp_progress(raw: &Value) -> Option<Value> {
    let value = raw.as_f64()?;
    if !value.is_finite() {
        return None;
    }
    let clamped = value.floor().clamp(0.0, MAX_PROGRESS as f64) as i64;
    Some(Value::from(clamped))
}

/// Shallow-merges `patch` into `record`. Stream bookkeeping fields are not
/// copied; progress is clamped.
pub fn merge_record(record: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match key.as_str() {
            "event" | "timestamp" => continue,
            "progress" => {
                if let Some(progress) = clamp_progress(value) {
                    record.insert(key.clone(), progress);
                }
            }
            _ => {
                record.insert(key.clone(), value.clone());
            }
        }
    }
    if let Some(Value::String(event)) = patch.get("event") {
        record.insert("lastEvent".to_string(), Value::String(event.clone()));
    }
}

/// Builds a trace id in the `gen_<time>_<rand>` shape the service logs, with
/// the time in base 36.
pub fn new_trace_id(prefix: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}_{}", to_base36(millis), &random[..5])
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
