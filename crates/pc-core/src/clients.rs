//! Typed wrappers over a [`ServiceAdapter`] for the endpoints the runtime
//! calls. Every method normalises the reply through
//! [`ServiceReply::into_result`].

use crate::errors::ErrorCode;
use crate::service::{ServiceAdapter, ServiceError, ServiceReply, ServiceRequest};
use crate::{new_trace_id, JobClass};
use serde_json::{Map, Value};
use std::sync::Arc;
use url::{form_urlencoded, Url};

pub const GENERATION_JOBS_PATH: &str = "/api/generation-jobs";
pub const AGENT_RUNS_PATH: &str = "/api/agents/prompt-runs";
pub const PREFLIGHT_PATH: &str = "/api/shot-generation/preflight";

/// Filter for the job history listing. Unset fields are left out of the
/// query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub project: Option<String>,
    pub project_id: Option<String>,
    pub job_type: Option<String>,
    pub shot_id: Option<String>,
    pub variation: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
}

impl HistoryQuery {
    pub fn for_project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            ..Self::default()
        }
    }

    pub fn to_query_string(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        let pairs = [
            ("project", self.project.as_deref()),
            ("projectId", self.project_id.as_deref()),
            ("type", self.job_type.as_deref()),
            ("shotId", self.shot_id.as_deref()),
            ("variation", self.variation.as_deref()),
            ("status", self.status.as_deref()),
        ];
        for (key, value) in pairs {
            if let Some(value) = value.filter(|value| !value.is_empty()) {
                serializer.append_pair(key, value);
            }
        }
        if let Some(limit) = self.limit {
            serializer.append_pair("limit", &limit.to_string());
        }
        serializer.finish()
    }

    /// Inverse of [`HistoryQuery::to_query_string`]; unknown keys are ignored.
    pub fn from_query_string(query: &str) -> Self {
        let mut parsed = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let value = value.into_owned();
            match key.as_ref() {
                "project" => parsed.project = Some(value),
                "projectId" => parsed.project_id = Some(value),
                "type" => parsed.job_type = Some(value),
                "shotId" => parsed.shot_id = Some(value),
                "variation" => parsed.variation = Some(value),
                "status" => parsed.status = Some(value),
                "limit" => parsed.limit = value.parse().ok(),
                _ => {}
            }
        }
        parsed
    }

    /// Project id sent to the metrics endpoint.
    pub fn metrics_project(&self) -> Option<&str> {
        self.project.as_deref().or(self.project_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightRequest {
    pub project: String,
    pub shot_id: String,
    pub variation: String,
    pub tool: String,
    pub require_reference: Option<bool>,
}

impl PreflightRequest {
    pub fn new(project: impl Into<String>, shot_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            shot_id: shot_id.into(),
            variation: "A".to_string(),
            tool: "seedream".to_string(),
            require_reference: None,
        }
    }

    pub fn to_query_string(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        serializer.append_pair("project", &self.project);
        serializer.append_pair("shotId", &self.shot_id);
        serializer.append_pair("variation", non_empty_or(&self.variation, "A"));
        serializer.append_pair("tool", non_empty_or(&self.tool, "seedream"));
        if let Some(require) = self.require_reference {
            serializer.append_pair("requireReference", if require { "true" } else { "false" });
        }
        serializer.finish()
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

/// Result of starting a job or run. `reused` is set when the service reported
/// a lock conflict and the already active job was adopted instead.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedJob {
    pub class: JobClass,
    pub id: String,
    pub trace_id: String,
    pub reused: bool,
    pub data: Value,
}

const SEGMENT_BASE: &str = "http://segment.invalid/";

/// Percent-encodes one path segment (`a b/c` becomes `a%20b%2Fc`). The dot
/// segments `.` and `..` have no encoded form and come back empty.
pub fn encode_segment(raw: &str) -> String {
    let Ok(mut url) = Url::parse(SEGMENT_BASE) else {
        return String::new();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(raw);
    }
    url.path().trim_start_matches('/').to_string()
}

/// Inverse of [`encode_segment`]. `+`, `&` and `=` are literal in a path
/// segment, so they are escaped before the form decoder sees them.
pub fn decode_segment(raw: &str) -> String {
    let literal = raw
        .replace('+', "%2B")
        .replace('&', "%26")
        .replace('=', "%3D");
    form_urlencoded::parse(literal.as_bytes())
        .next()
        .map(|(segment, _)| segment.into_owned())
        .unwrap_or_default()
}

fn required_id(raw: &str, field: &str) -> Result<String, ServiceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::invalid_input(format!("{field} is required")));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(ServiceError::invalid_input(format!("{field} is invalid")));
    }
    Ok(encode_segment(trimmed))
}

async fn call(
    adapter: &Arc<dyn ServiceAdapter>,
    path: &str,
    request: ServiceRequest,
    fallback: &str,
) -> Result<Value, ServiceError> {
    let reply: ServiceReply = adapter.request(path, request).await?;
    reply.into_result(fallback)
}

/// Adds a trace id to the start payload unless the caller supplied one.
fn with_trace_id(class: JobClass, payload: Value) -> (String, Value) {
    let mut body = match payload {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let trace_id = body
        .get("traceId")
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| new_trace_id(class.trace_prefix()));
    body.insert("traceId".to_string(), Value::String(trace_id.clone()));
    (trace_id, Value::Object(body))
}

fn started_from(
    class: JobClass,
    trace_id: String,
    result: Result<Value, ServiceError>,
) -> Result<StartedJob, ServiceError> {
    match result {
        Ok(data) => {
            let id = data
                .get(class.id_field())
                .and_then(Value::as_str)
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    ServiceError::new(
                        ErrorCode::ServerError,
                        format!("start reply carried no {}", class.id_field()),
                        200,
                    )
                })?;
            Ok(StartedJob {
                class,
                id,
                trace_id,
                reused: false,
                data,
            })
        }
        Err(err) if err.status == 409 && err.is_code(ErrorCode::LockConflict) => {
            let active = err
                .data
                .get(class.active_id_field())
                .and_then(Value::as_str)
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string);
            match active {
                Some(id) => Ok(StartedJob {
                    class,
                    id,
                    trace_id,
                    reused: true,
                    data: err.data,
                }),
                None => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

#[derive(Clone)]
pub struct GenerationJobsClient {
    adapter: Arc<dyn ServiceAdapter>,
}

impl GenerationJobsClient {
    pub fn new(adapter: Arc<dyn ServiceAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn start_job(&self, payload: Value) -> Result<StartedJob, ServiceError> {
        let (trace_id, body) = with_trace_id(JobClass::Generation, payload);
        let result = call(
            &self.adapter,
            GENERATION_JOBS_PATH,
            ServiceRequest::post_json(&body),
            "Failed to start generation job",
        )
        .await;
        started_from(JobClass::Generation, trace_id, result)
    }

    /// Returns the job record (`data.job`).
    pub async fn get_job(&self, job_id: &str) -> Result<Value, ServiceError> {
        let id = required_id(job_id, "jobId")?;
        let data = call(
            &self.adapter,
            &format!("{GENERATION_JOBS_PATH}/{id}"),
            ServiceRequest::get(),
            "Failed to fetch generation job state",
        )
        .await?;
        Ok(data.get("job").cloned().unwrap_or(data))
    }

    pub async fn list_jobs(&self, query: &HistoryQuery) -> Result<Vec<Value>, ServiceError> {
        let data = call(
            &self.adapter,
            &format!("{GENERATION_JOBS_PATH}?{}", query.to_query_string()),
            ServiceRequest::get(),
            "Failed to load generation jobs",
        )
        .await?;
        Ok(data
            .get("jobs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Returns the metrics object (`data.metrics`).
    pub async fn get_metrics(
        &self,
        project: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Value, ServiceError> {
        let query = {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            if let Some(project) = project.filter(|value| !value.is_empty()) {
                serializer.append_pair("project", project);
            }
            if let Some(limit) = limit {
                serializer.append_pair("limit", &limit.to_string());
            }
            serializer.finish()
        };
        let data = call(
            &self.adapter,
            &format!("{GENERATION_JOBS_PATH}/metrics?{query}"),
            ServiceRequest::get(),
            "Failed to load generation metrics",
        )
        .await?;
        Ok(data.get("metrics").cloned().unwrap_or(data))
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<Value, ServiceError> {
        let id = required_id(job_id, "jobId")?;
        call(
            &self.adapter,
            &format!("{GENERATION_JOBS_PATH}/{id}/cancel"),
            ServiceRequest::post(),
            "Failed to cancel generation job",
        )
        .await
    }

    pub async fn retry_job(&self, job_id: &str, payload: Value) -> Result<StartedJob, ServiceError> {
        let id = required_id(job_id, "jobId")?;
        let (trace_id, body) = with_trace_id(JobClass::Generation, payload);
        let result = call(
            &self.adapter,
            &format!("{GENERATION_JOBS_PATH}/{id}/retry"),
            ServiceRequest::post_json(&body),
            "Failed to retry generation job",
        )
        .await;
        started_from(JobClass::Generation, trace_id, result)
    }
}

#[derive(Clone)]
pub struct AgentRuntimeClient {
    adapter: Arc<dyn ServiceAdapter>,
}

impl AgentRuntimeClient {
    pub fn new(adapter: Arc<dyn ServiceAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn start_run(&self, payload: Value) -> Result<StartedJob, ServiceError> {
        let (trace_id, body) = with_trace_id(JobClass::Agent, payload);
        let result = call(
            &self.adapter,
            AGENT_RUNS_PATH,
            ServiceRequest::post_json(&body),
            "Failed to start run",
        )
        .await;
        started_from(JobClass::Agent, trace_id, result)
    }

    /// The run is serialised at the top level of the reply; the `success`
    /// flag is stripped.
    pub async fn get_run(&self, run_id: &str) -> Result<Value, ServiceError> {
        let id = required_id(run_id, "runId")?;
        let mut data = call(
            &self.adapter,
            &format!("{AGENT_RUNS_PATH}/{id}"),
            ServiceRequest::get(),
            "Failed to fetch run state",
        )
        .await?;
        if let Some(map) = data.as_object_mut() {
            map.remove("success");
        }
        Ok(data)
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<Value, ServiceError> {
        let id = required_id(run_id, "runId")?;
        call(
            &self.adapter,
            &format!("{AGENT_RUNS_PATH}/{id}/cancel"),
            ServiceRequest::post_json(&Value::Object(Map::new())),
            "Failed to cancel run",
        )
        .await
    }

    pub async fn revert_run(&self, run_id: &str) -> Result<Value, ServiceError> {
        let id = required_id(run_id, "runId")?;
        call(
            &self.adapter,
            &format!("{AGENT_RUNS_PATH}/{id}/revert"),
            ServiceRequest::post_json(&Value::Object(Map::new())),
            "Failed to revert run",
        )
        .await
    }
}

#[derive(Clone)]
pub struct ReadinessClient {
    adapter: Arc<dyn ServiceAdapter>,
}

impl ReadinessClient {
    pub fn new(adapter: Arc<dyn ServiceAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn load_shot_preflight(
        &self,
        request: &PreflightRequest,
    ) -> Result<Value, ServiceError> {
        if request.shot_id.trim().is_empty() {
            return Err(ServiceError::invalid_input("shotId is required"));
        }
        call(
            &self.adapter,
            &format!("{PREFLIGHT_PATH}?{}", request.to_query_string()),
            ServiceRequest::get(),
            "Failed to load shot preflight",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{RequestMethod, ServiceFuture, TransportError};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAdapter {
        calls: Mutex<Vec<(String, ServiceRequest)>>,
        replies: Mutex<Vec<Result<ServiceReply, TransportError>>>,
    }

    impl RecordingAdapter {
        fn replying(replies: Vec<Result<ServiceReply, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                replies: Mutex::new(replies),
            })
        }

        fn calls(&self) -> Vec<(String, ServiceRequest)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl ServiceAdapter for RecordingAdapter {
        fn request(&self, path: &str, request: ServiceRequest) -> ServiceFuture {
            self.calls
                .lock()
                .expect("calls lock")
                .push((path.to_string(), request));
            let reply = {
                let mut replies = self.replies.lock().expect("replies lock");
                if replies.is_empty() {
                    Ok(ServiceReply::ok(json!({"success": true})))
                } else {
                    replies.remove(0)
                }
            };
            Box::pin(async move { reply })
        }
    }

    #[test]
    fn history_query_skips_unset_fields() {
        let query = HistoryQuery {
            project: Some("demo".to_string()),
            shot_id: Some("SHOT 01".to_string()),
            limit: Some(20),
            ..HistoryQuery::default()
        };
        let encoded = query.to_query_string();
        assert_eq!(encoded, "project=demo&shotId=SHOT+01&limit=20");
        assert_eq!(HistoryQuery::from_query_string(&encoded), query);
    }

    #[test]
    fn path_segments_round_trip() {
        let encoded = encode_segment("job 1/&x=y+z");
        assert!(!encoded.contains('/'));
        assert_eq!(decode_segment(&encoded), "job 1/&x=y+z");
    }

    #[test]
    fn path_segments_use_percent_twenty_for_spaces() {
        assert_eq!(encode_segment("shot 01"), "shot%2001");
        assert_eq!(encode_segment("a/b?c#d%"), "a%2Fb%3Fc%23d%25");
        assert_eq!(encode_segment("gen-42"), "gen-42");
        assert_eq!(decode_segment("shot%2001"), "shot 01");
    }

    #[tokio::test]
    async fn dot_ids_are_rejected_before_the_request() {
        let adapter = RecordingAdapter::replying(Vec::new());
        let client = GenerationJobsClient::new(adapter.clone());
        let err = client.get_job("..").await.expect_err("dot id");
        assert!(err.is_code(ErrorCode::InvalidInput));
        assert!(adapter.calls().is_empty());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn client_futures_can_be_spawned() {
        let client = GenerationJobsClient::new(RecordingAdapter::replying(Vec::new()));
        let query = HistoryQuery::for_project("demo");
        assert_send(&client.get_metrics(Some("demo"), Some(50)));
        assert_send(&client.list_jobs(&query));
        assert_send(&client.start_job(Value::Null));
    }

    #[test]
    fn preflight_query_fills_defaults() {
        let mut request = PreflightRequest::new("demo", "SHOT_01");
        request.variation = String::new();
        request.require_reference = Some(true);
        assert_eq!(
            request.to_query_string(),
            "project=demo&shotId=SHOT_01&variation=A&tool=seedream&requireReference=true"
        );
    }

    #[tokio::test]
    async fn start_job_adds_trace_id() {
        let adapter = RecordingAdapter::replying(vec![Ok(ServiceReply::ok(
            json!({"success": true, "jobId": "gen-1", "status": "queued"}),
        ))]);
        let client = GenerationJobsClient::new(adapter.clone());

        let started = client
            .start_job(json!({"type": "generate-shot", "shotId": "SHOT_01"}))
            .await
            .expect("start");
        assert_eq!(started.id, "gen-1");
        assert!(!started.reused);
        assert!(started.trace_id.starts_with("gen_"));

        let calls = adapter.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, GENERATION_JOBS_PATH);
        assert_eq!(calls[0].1.method, RequestMethod::Post);
        let body: Value =
            serde_json::from_str(calls[0].1.body.as_deref().expect("body")).expect("json body");
        assert_eq!(body["traceId"], json!(started.trace_id));
        assert_eq!(body["shotId"], json!("SHOT_01"));
    }

    #[tokio::test]
    async fn lock_conflict_reuses_active_job() {
        let adapter = RecordingAdapter::replying(vec![Ok(ServiceReply::failed(
            409,
            json!({"success": false, "code": "LOCK_CONFLICT", "error": "locked", "activeJobId": "gen-7"}),
        ))]);
        let client = GenerationJobsClient::new(adapter);
        let started = client
            .start_job(json!({"traceId": "gen_fixed"}))
            .await
            .expect("reuse");
        assert_eq!(started.id, "gen-7");
        assert!(started.reused);
        assert_eq!(started.trace_id, "gen_fixed");
    }

    #[tokio::test]
    async fn lock_conflict_without_owner_is_an_error() {
        let adapter = RecordingAdapter::replying(vec![Ok(ServiceReply::failed(
            409,
            json!({"success": false, "code": "LOCK_CONFLICT", "error": "locked", "activeRunId": null}),
        ))]);
        let client = AgentRuntimeClient::new(adapter);
        let err = client.start_run(json!({})).await.expect_err("conflict");
        assert!(err.is_code(ErrorCode::LockConflict));
    }

    #[tokio::test]
    async fn empty_ids_are_rejected_without_a_request() {
        let adapter = RecordingAdapter::replying(Vec::new());
        let client = GenerationJobsClient::new(adapter.clone());
        let err = client.get_job("  ").await.expect_err("invalid");
        assert!(err.is_code(ErrorCode::InvalidInput));
        assert_eq!(err.status, 400);
        assert!(adapter.calls().is_empty());
    }

    #[tokio::test]
    async fn list_and_get_unwrap_payload_fields() {
        let adapter = RecordingAdapter::replying(vec![
            Ok(ServiceReply::ok(json!({"success": true, "jobs": [{"jobId": "a"}, {"jobId": "b"}]}))),
            Ok(ServiceReply::ok(json!({"success": true, "job": {"jobId": "a", "status": "running"}}))),
            Ok(ServiceReply::ok(json!({"success": true, "metrics": {"total": 2}}))),
        ]);
        let client = GenerationJobsClient::new(adapter.clone());
        let jobs = client
            .list_jobs(&HistoryQuery::for_project("demo"))
            .await
            .expect("list");
        assert_eq!(jobs.len(), 2);
        let job = client.get_job("a").await.expect("get");
        assert_eq!(job["status"], json!("running"));
        let metrics = client.get_metrics(Some("demo"), Some(50)).await.expect("metrics");
        assert_eq!(metrics, json!({"total": 2}));

        let paths: Vec<String> = adapter.calls().into_iter().map(|(path, _)| path).collect();
        assert_eq!(
            paths,
            vec![
                "/api/generation-jobs?project=demo".to_string(),
                "/api/generation-jobs/a".to_string(),
                "/api/generation-jobs/metrics?project=demo&limit=50".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn transport_failure_maps_to_network_error() {
        let adapter = RecordingAdapter::replying(vec![Err(TransportError::Connection(
            "refused".to_string(),
        ))]);
        let client = ReadinessClient::new(adapter);
        let err = client
            .load_shot_preflight(&PreflightRequest::new("demo", "SHOT_01"))
            .await
            .expect_err("network");
        assert!(err.is_code(ErrorCode::NetworkError));
    }

    #[tokio::test]
    async fn get_run_strips_success_flag() {
        let adapter = RecordingAdapter::replying(vec![Ok(ServiceReply::ok(
            json!({"success": true, "runId": "run-1", "status": "running"}),
        ))]);
        let client = AgentRuntimeClient::new(adapter);
        let run = client.get_run("run-1").await.expect("run");
        assert_eq!(run, json!({"runId": "run-1", "status": "running"}));
    }
}
