//! Well-known store keys.

use pc_core::JobClass;

pub const ACTIVE_GENERATION_JOB_ID: &str = "activeGenerationJobId";
pub const AGENT_ACTIVE_RUN_ID: &str = "agentActiveRunId";
pub const GENERATION_JOB_STREAM_STATE: &str = "generationJobStreamState";
pub const AGENT_RUN_STREAM_STATE: &str = "agentRunStreamState";
pub const GENERATION_HISTORY_JOBS_BY_ID: &str = "generationHistoryJobsById";
pub const AGENT_RUN_CACHE: &str = "agentRunCache";
pub const GENERATION_HISTORY_REFRESH_IN_FLIGHT: &str = "generationHistoryRefreshInFlight";
pub const GENERATION_HISTORY_ERROR: &str = "generationHistoryError";
pub const GENERATION_METRICS_CACHE: &str = "generationMetricsCache";
pub const LAST_SHOT_PREFLIGHT: &str = "lastShotPreflight";
pub const LAST_SAVED_SHOT_ID: &str = "lastSavedShotId";

pub fn active_id(class: JobClass) -> &'static str {
    match class {
        JobClass::Agent => AGENT_ACTIVE_RUN_ID,
        JobClass::Generation => ACTIVE_GENERATION_JOB_ID,
    }
}

pub fn stream_state(class: JobClass) -> &'static str {
    match class {
        JobClass::Agent => AGENT_RUN_STREAM_STATE,
        JobClass::Generation => GENERATION_JOB_STREAM_STATE,
    }
}

pub fn record_cache(class: JobClass) -> &'static str {
    match class {
        JobClass::Agent => AGENT_RUN_CACHE,
        JobClass::Generation => GENERATION_HISTORY_JOBS_BY_ID,
    }
}

pub fn job_error(job_id: &str) -> String {
    format!("jobError:{job_id}")
}

pub fn shot_preflight(shot_id: &str) -> String {
    format!("shotPreflight:{shot_id}")
}
