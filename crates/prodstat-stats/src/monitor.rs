//! Workload monitor (PanDA) access.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use prodstat_types::{ProdstatError, ProdstatResult, StatusCounts, WorkflowProgress};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::catalog::normalize_timestamp;
use crate::request::DateWindow;

const MONITOR_SOURCE: &str = "monitor";
pub const DEFAULT_MONITOR_URL: &str = "http://panda-doma.cern.ch";
/// Days of task history requested per workflow.
const TASK_HISTORY_DAYS: u32 = 120;

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().map(|value| value.max(0.0) as u64))
            .unwrap_or(0),
        Some(serde_json::Value::String(text)) => text.trim().parse::<f64>().map_or(0, |value| value.max(0.0) as u64),
        _ => 0,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(number)) => number.as_f64(),
        Some(serde_json::Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn lenient_counts<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, u64>, D::Error> {
    let value = Option::<BTreeMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(value
        .unwrap_or_default()
        .into_iter()
        .map(|(status, count)| {
            let count = count
                .as_u64()
                .or_else(|| count.as_f64().map(|value| value.max(0.0) as u64))
                .unwrap_or(0);
            (status, count)
        })
        .collect())
}

/// One entry of the workflow progress listing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorWorkflow {
    pub r_name: String,
    pub r_status: String,
    pub created_at: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    pub total_tasks: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub total_files: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub remaining_files: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub processed_files: u64,
    #[serde(deserialize_with = "lenient_counts")]
    pub tasks_statuses: BTreeMap<String, u64>,
}

impl MonitorWorkflow {
    pub fn progress(&self) -> WorkflowProgress {
        let status = |name: &str| self.tasks_statuses.get(name).copied().unwrap_or(0);
        WorkflowProgress {
            status: self.r_status.clone(),
            created_at: self.created_at.clone(),
            counts: StatusCounts {
                n_tasks: self.total_tasks,
                n_files: self.total_files,
                n_finished: status("Finished"),
                n_failed: status("Failed"),
                n_sub_finished: status("SubFinished"),
            },
            remaining_files: self.remaining_files,
            processed_files: self.processed_files,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitorDatasetInfo {
    #[serde(deserialize_with = "lenient_u64")]
    pub nfiles: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorTask {
    #[serde(deserialize_with = "lenient_u64")]
    pub jeditaskid: u64,
    pub taskname: String,
    pub status: String,
    pub starttime: Option<String>,
    pub endtime: Option<String>,
    pub dsinfo: MonitorDatasetInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorJob {
    pub jobname: String,
    pub jobstatus: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub durationsec: Option<f64>,
    pub starttime: Option<String>,
    pub endtime: Option<String>,
    /// Requested memory in MB.
    #[serde(deserialize_with = "lenient_f64")]
    pub minramcount: Option<f64>,
}

/// Read-only view of the workload monitor.
pub trait MonitorSource {
    fn workflows(&self) -> ProdstatResult<Vec<MonitorWorkflow>>;

    /// Tasks whose name starts with `workflow_name`.
    fn tasks(&self, workflow_name: &str) -> ProdstatResult<Vec<MonitorTask>>;

    /// Jobs of a task; `limit` caps the number returned, `status` filters them.
    fn jobs(
        &self,
        task_id: u64,
        limit: Option<usize>,
        status: Option<&str>,
    ) -> ProdstatResult<Vec<MonitorJob>>;
}

#[derive(Debug, Deserialize)]
struct JobsPayload {
    #[serde(default)]
    jobs: Vec<MonitorJob>,
}

/// Blocking client for the PanDA monitor JSON endpoints.
pub struct PandaClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl PandaClient {
    pub fn new(base_url: &str, request_timeout_ms: u64) -> ProdstatResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("prodstat"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::blocking::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .map_err(|error| {
                ProdstatError::source_unavailable(
                    MONITOR_SOURCE,
                    format!("failed to build http client: {error}"),
                )
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> ProdstatResult<T> {
        debug!(operation, path, "monitor request");
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .query(query)
            .send()
            .map_err(|error| {
                ProdstatError::source_unavailable(
                    MONITOR_SOURCE,
                    format!("{operation} failed: {error}"),
                )
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProdstatError::source_unavailable(
                MONITOR_SOURCE,
                format!("{operation} failed with status {status}"),
            ));
        }
        response.json::<T>().map_err(|error| {
            ProdstatError::source_unavailable(
                MONITOR_SOURCE,
                format!("{operation} returned an unreadable payload: {error}"),
            )
        })
    }
}

impl MonitorSource for PandaClient {
    fn workflows(&self) -> ProdstatResult<Vec<MonitorWorkflow>> {
        self.request_json("workflow listing", "/idds/wfprogress/", &[("json", "")])
    }

    fn tasks(&self, workflow_name: &str) -> ProdstatResult<Vec<MonitorTask>> {
        let pattern = format!("{workflow_name}*");
        let days = TASK_HISTORY_DAYS.to_string();
        self.request_json(
            "task listing",
            "/tasks/",
            &[
                ("taskname", pattern.as_str()),
                ("days", days.as_str()),
                ("json", ""),
            ],
        )
    }

    fn jobs(
        &self,
        task_id: u64,
        limit: Option<usize>,
        status: Option<&str>,
    ) -> ProdstatResult<Vec<MonitorJob>> {
        let task_id = task_id.to_string();
        let limit = limit.map(|limit| limit.to_string());
        let mut query = vec![("jeditaskid", task_id.as_str())];
        if let Some(limit) = limit.as_deref() {
            query.push(("limit", limit));
        }
        if let Some(status) = status {
            query.push(("jobstatus", status));
        }
        query.push(("json", ""));
        let payload: JobsPayload = self.request_json("job listing", "/jobs/", &query)?;
        Ok(payload.jobs)
    }
}

/// Monitor backed by fixed data, for tests and offline replays.
#[derive(Debug, Default)]
pub struct InMemoryMonitor {
    inner: Mutex<MonitorInner>,
}

#[derive(Debug, Default)]
struct MonitorInner {
    workflows: Vec<MonitorWorkflow>,
    tasks: Vec<MonitorTask>,
    jobs: BTreeMap<u64, Vec<MonitorJob>>,
    job_queries: BTreeMap<u64, u64>,
    unavailable: bool,
}

impl InMemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, apply: impl FnOnce(&mut MonitorInner) -> T) -> Option<T> {
        self.inner.lock().ok().map(|mut inner| apply(&mut inner))
    }

    pub fn add_workflow(&self, workflow: MonitorWorkflow) {
        self.with_inner(|inner| inner.workflows.push(workflow));
    }

    /// Replaces the workflow with the same name.
    pub fn set_workflow(&self, workflow: MonitorWorkflow) {
        self.with_inner(|inner| {
            inner.workflows.retain(|existing| existing.r_name != workflow.r_name);
            inner.workflows.push(workflow);
        });
    }

    pub fn add_task(&self, task: MonitorTask, jobs: Vec<MonitorJob>) {
        self.with_inner(|inner| {
            inner.jobs.insert(task.jeditaskid, jobs);
            inner.tasks.push(task);
        });
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.with_inner(|inner| inner.unavailable = unavailable);
    }

    /// Number of job listings requested for `task_id`.
    pub fn job_queries(&self, task_id: u64) -> u64 {
        self.with_inner(|inner| inner.job_queries.get(&task_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn guarded<T>(&self, apply: impl FnOnce(&mut MonitorInner) -> T) -> ProdstatResult<T> {
        let mut inner = self.inner.lock().map_err(|_| {
            ProdstatError::source_unavailable(MONITOR_SOURCE, "in-memory monitor lock poisoned")
        })?;
        if inner.unavailable {
            return Err(ProdstatError::source_unavailable(
                MONITOR_SOURCE,
                "in-memory monitor marked unavailable",
            ));
        }
        Ok(apply(&mut inner))
    }
}

impl MonitorSource for InMemoryMonitor {
    fn workflows(&self) -> ProdstatResult<Vec<MonitorWorkflow>> {
        self.guarded(|inner| inner.workflows.clone())
    }

    fn tasks(&self, workflow_name: &str) -> ProdstatResult<Vec<MonitorTask>> {
        self.guarded(|inner| {
            inner
                .tasks
                .iter()
                .filter(|task| task.taskname.starts_with(workflow_name))
                .cloned()
                .collect()
        })
    }

    fn jobs(
        &self,
        task_id: u64,
        limit: Option<usize>,
        status: Option<&str>,
    ) -> ProdstatResult<Vec<MonitorJob>> {
        self.guarded(|inner| {
            *inner.job_queries.entry(task_id).or_insert(0) += 1;
            inner
                .jobs
                .get(&task_id)
                .map(|jobs| {
                    jobs.iter()
                        .filter(|job| status.map_or(true, |status| job.jobstatus == status))
                        .take(limit.unwrap_or(usize::MAX))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }
}

/// Run key of a workflow name: its last `_` segment, e.g. `20220127t205042z`.
pub fn run_key_of(workflow_name: &str) -> &str {
    workflow_name.rsplit('_').next().unwrap_or(workflow_name)
}

/// Calendar date encoded in a run key.
pub fn run_key_date(run_key: &str) -> Option<NaiveDate> {
    let date = run_key.split(['t', 'T']).next()?;
    NaiveDate::parse_from_str(date, "%Y%m%d").ok()
}

/// Parses monitor times such as `2022-01-27T21:00:00` or `2022-01-27 21:00:00.5`.
pub fn parse_monitor_time(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&normalize_timestamp(raw), "%Y-%m-%d %H:%M:%S").ok()
}

/// Task type from a task name: the part after the run key without the
/// trailing counter (`..._20220127T205042Z_isr_calibrate_3` -> `isr_calibrate`).
pub fn task_type_of(task_name: &str, run_key: &str) -> String {
    let lowered = task_name.to_ascii_lowercase();
    let Some(position) = lowered.find(&run_key.to_ascii_lowercase()) else {
        return task_name.to_string();
    };
    let tail = &task_name[position + run_key.len()..];
    let tokens: Vec<&str> = tail.split('_').collect();
    if tokens.len() < 3 {
        return tokens
            .iter()
            .copied()
            .find(|token| !token.is_empty())
            .unwrap_or(task_name)
            .to_string();
    }
    tokens[1..tokens.len() - 1].join("_")
}

/// Workflows of `scope` whose name carries `token` and whose run date is in
/// `window`, grouped by run key.
pub fn select_workflows(
    workflows: Vec<MonitorWorkflow>,
    scope: &str,
    token: &str,
    window: &DateWindow,
) -> BTreeMap<String, Vec<MonitorWorkflow>> {
    let scope = scope.to_ascii_lowercase();
    let mut selected: BTreeMap<String, Vec<MonitorWorkflow>> = BTreeMap::new();
    for workflow in workflows {
        if !workflow.r_name.contains(&scope) || !workflow.r_name.contains(token) {
            continue;
        }
        let run_key = run_key_of(&workflow.r_name).to_string();
        match run_key_date(&run_key) {
            Some(date) if window.contains(date) => {
                selected.entry(run_key).or_default().push(workflow);
            }
            Some(_) => {}
            None => warn!(workflow = %workflow.r_name, "workflow name carries no run date"),
        }
    }
    selected
}
