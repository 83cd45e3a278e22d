//! Read-only service adapter over a project directory.

use chrono::DateTime;
use pc_core::clients::{decode_segment, HistoryQuery};
use pc_core::{
    JobClass, RequestMethod, ServiceAdapter, ServiceFuture, ServiceReply, ServiceRequest,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const GENERATION_JOBS_DIR: &str = "rendered/storyboard/generation_jobs";
const AGENT_RUNS_DIR: &str = "rendered/storyboard/agent_runs";
const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;
const DEFAULT_METRICS_LIMIT: usize = 200;
const MAX_METRICS_LIMIT: usize = 1000;
const STATUS_BUCKETS: [&str; 6] = ["queued", "running", "completed", "failed", "canceled", "other"];

pub fn class_dir(root: &Path, class: JobClass) -> PathBuf {
    match class {
        JobClass::Generation => root.join(GENERATION_JOBS_DIR),
        JobClass::Agent => root.join(AGENT_RUNS_DIR),
    }
}

pub fn record_file_name(class: JobClass) -> &'static str {
    match class {
        JobClass::Generation => "job.json",
        JobClass::Agent => "run.json",
    }
}

/// Directory of one job, or `None` if the id could escape the class dir.
pub fn job_dir(root: &Path, class: JobClass, job_id: &str) -> Option<PathBuf> {
    let id = job_id.trim();
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return None;
    }
    Some(class_dir(root, class).join(id))
}

#[derive(Clone)]
pub struct FileServiceAdapter {
    root: Arc<PathBuf>,
}

impl FileServiceAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }
}

impl ServiceAdapter for FileServiceAdapter {
    fn request(&self, path: &str, request: ServiceRequest) -> ServiceFuture {
        let root = self.root.clone();
        let path = path.to_string();
        Box::pin(async move { Ok(route(&root, &path, &request).await) })
    }
}

fn failure(status: u16, message: &str, code: Option<&str>) -> ServiceReply {
    let mut payload = json!({"success": false, "error": message});
    if let Some(code) = code {
        payload["code"] = Value::String(code.to_string());
    }
    ServiceReply::failed(status, payload)
}

async fn route(root: &Path, path: &str, request: &ServiceRequest) -> ServiceReply {
    if request.method != RequestMethod::Get {
        return failure(405, "pc-watch only serves read requests", Some("INVALID_INPUT"));
    }
    let (route, query) = path.split_once('?').unwrap_or((path, ""));
    let segments: Vec<String> = route
        .trim_matches('/')
        .split('/')
        .map(decode_segment)
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    debug!("file_adapter_request: {route}");

    match segments.as_slice() {
        ["api", "generation-jobs"] => list_jobs(root, query).await,
        ["api", "generation-jobs", "metrics"] => metrics(root, query).await,
        ["api", "generation-jobs", job_id] => {
            match read_record(root, JobClass::Generation, job_id).await {
                Ok(job) => ServiceReply::ok(json!({"success": true, "job": job})),
                Err(reply) => reply,
            }
        }
        ["api", "agents", "prompt-runs", run_id] => {
            match read_record(root, JobClass::Agent, run_id).await {
                Ok(Value::Object(run)) => {
                    let mut payload = run;
                    payload.insert("success".to_string(), Value::Bool(true));
                    ServiceReply::ok(Value::Object(payload))
                }
                Ok(_) => failure(500, "Run record is not an object", None),
                Err(reply) => reply,
            }
        }
        _ => failure(404, "Not found", None),
    }
}

async fn read_record(root: &Path, class: JobClass, job_id: &str) -> Result<Value, ServiceReply> {
    let field = class.id_field();
    let Some(dir) = job_dir(root, class, job_id) else {
        return Err(failure(400, &format!("Invalid {field}"), Some("INVALID_INPUT")));
    };
    let file = dir.join(record_file_name(class));
    let raw = match tokio::fs::read_to_string(&file).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(failure(404, "Job not found", None));
        }
        Err(err) => return Err(failure(500, &err.to_string(), None)),
    };
    serde_json::from_str(&raw).map_err(|err| failure(500, &err.to_string(), None))
}

/// Reads every parseable record of a class. Unreadable entries are skipped.
async fn read_all(root: &Path, class: JobClass) -> Vec<Value> {
    let mut records = Vec::new();
    let mut entries = match tokio::fs::read_dir(class_dir(root, class)).await {
        Ok(entries) => entries,
        Err(_) => return records,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file = entry.path().join(record_file_name(class));
        let Ok(raw) = tokio::fs::read_to_string(&file).await else {
            continue;
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(record) if record.is_object() => records.push(record),
            Ok(_) => {}
            Err(err) => debug!("file_adapter_skip_record: {} {err}", file.display()),
        }
    }
    records
}

fn timestamp_ms(record: &Value, field: &str) -> Option<i64> {
    record
        .get(field)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.timestamp_millis())
}

fn newest_first(records: &mut [Value]) {
    records.sort_by_key(|record| std::cmp::Reverse(timestamp_ms(record, "createdAt").unwrap_or(0)));
}

fn str_field<'a>(record: &'a Value, pointer: &str) -> &'a str {
    record.pointer(pointer).and_then(Value::as_str).unwrap_or("")
}

fn clamp_limit(raw: Option<u32>, default: usize, max: usize) -> usize {
    raw.map(|limit| (limit as usize).clamp(1, max))
        .unwrap_or(default)
}

fn matches_project(record: &Value, project: Option<&str>) -> bool {
    match project.filter(|value| !value.is_empty()) {
        Some(project) => str_field(record, "/projectId") == project,
        None => true,
    }
}

fn matches_query(record: &Value, query: &HistoryQuery) -> bool {
    if !matches_project(record, query.metrics_project()) {
        return false;
    }
    if let Some(job_type) = query.job_type.as_deref().filter(|value| !value.is_empty()) {
        if !str_field(record, "/type").eq_ignore_ascii_case(job_type) {
            return false;
        }
    }
    if let Some(shot_id) = query.shot_id.as_deref().filter(|value| !value.is_empty()) {
        if str_field(record, "/input/shotId") != shot_id {
            return false;
        }
    }
    if let Some(variation) = query.variation.as_deref().filter(|value| !value.is_empty()) {
        let recorded = match str_field(record, "/input/variation") {
            "" => "A",
            other => other,
        };
        if !recorded.eq_ignore_ascii_case(variation.trim()) {
            return false;
        }
    }
    if let Some(status) = query.status.as_deref().filter(|value| !value.is_empty()) {
        let wanted: Vec<String> = status
            .split(',')
            .map(|item| item.trim().to_lowercase())
            .filter(|item| !item.is_empty())
            .collect();
        let recorded = str_field(record, "/status").to_lowercase();
        if !wanted.is_empty() && !wanted.contains(&recorded) {
            return false;
        }
    }
    true
}

async fn list_jobs(root: &Path, query: &str) -> ServiceReply {
    let query = HistoryQuery::from_query_string(query);
    let mut jobs: Vec<Value> = read_all(root, JobClass::Generation)
        .await
        .into_iter()
        .filter(|job| matches_query(job, &query))
        .collect();
    newest_first(&mut jobs);
    jobs.truncate(clamp_limit(query.limit, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT));
    ServiceReply::ok(json!({"success": true, "jobs": jobs}))
}

async fn metrics(root: &Path, query: &str) -> ServiceReply {
    let query = HistoryQuery::from_query_string(query);
    let mut jobs: Vec<Value> = read_all(root, JobClass::Generation)
        .await
        .into_iter()
        .filter(|job| matches_project(job, query.metrics_project()))
        .collect();
    newest_first(&mut jobs);
    jobs.truncate(clamp_limit(query.limit, DEFAULT_METRICS_LIMIT, MAX_METRICS_LIMIT));
    ServiceReply::ok(json!({"success": true, "metrics": summarize(&jobs)}))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Status counts, success rate, durations and the most frequent failure
/// codes over `jobs`.
pub fn summarize(jobs: &[Value]) -> Value {
    let mut counts: BTreeMap<&str, u64> = STATUS_BUCKETS.into_iter().map(|status| (status, 0)).collect();
    let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
    let mut failure_codes: BTreeMap<String, u64> = BTreeMap::new();
    let mut durations: Vec<f64> = Vec::new();

    for job in jobs {
        let status = str_field(job, "/status").to_lowercase();
        let bucket = STATUS_BUCKETS
            .into_iter()
            .find(|bucket| *bucket == status)
            .unwrap_or("other");
        *counts.entry(bucket).or_default() += 1;

        let job_type = match str_field(job, "/type") {
            "" => "unknown",
            other => other,
        };
        *by_type.entry(job_type.to_string()).or_default() += 1;

        if status == "failed" {
            let code = [str_field(job, "/error/code"), str_field(job, "/error/message")]
                .into_iter()
                .map(str::trim)
                .find(|value| !value.is_empty())
                .unwrap_or("UNKNOWN");
            *failure_codes.entry(code.to_string()).or_default() += 1;
        }

        if let (Some(started), Some(finished)) = (
            timestamp_ms(job, "startedAt"),
            timestamp_ms(job, "finishedAt"),
        ) {
            if finished >= started {
                durations.push((finished - started) as f64 / 1000.0);
            }
        }
    }

    let completed = counts["completed"];
    let terminal = completed + counts["failed"] + counts["canceled"];
    let success_rate = if terminal > 0 {
        round2(completed as f64 / terminal as f64 * 100.0)
    } else {
        0.0
    };

    let (avg_duration, p95_duration) = if durations.is_empty() {
        (0.0, 0.0)
    } else {
        durations.sort_by(|a, b| a.total_cmp(b));
        let sum: f64 = durations.iter().sum();
        let index = ((durations.len() as f64 * 0.95).ceil() as usize)
            .saturating_sub(1)
            .min(durations.len() - 1);
        (round2(sum / durations.len() as f64), round2(durations[index]))
    };

    let mut top_failures: Vec<(String, u64)> = failure_codes.into_iter().collect();
    top_failures.sort_by(|a, b| b.1.cmp(&a.1));
    top_failures.truncate(5);

    let mut summary = Map::new();
    summary.insert("total".to_string(), json!(jobs.len()));
    for (status, count) in &counts {
        summary.insert(status.to_string(), json!(count));
    }
    summary.insert("byType".to_string(), json!(by_type));
    summary.insert("successRate".to_string(), json!(success_rate));
    summary.insert("avgDurationSec".to_string(), json!(avg_duration));
    summary.insert("p95DurationSec".to_string(), json!(p95_duration));
    summary.insert(
        "topFailureCodes".to_string(),
        Value::Array(
            top_failures
                .into_iter()
                .map(|(code, count)| json!({"code": code, "count": count}))
                .collect(),
        ),
    );
    Value::Object(summary)
}
