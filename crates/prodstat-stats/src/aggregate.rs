//! Incremental statistics aggregation with a per-run checkpoint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use prodstat_core::write_text_atomic;
use prodstat_types::{
    Diagnostic, ProdstatError, ProdstatResult, RunTimestamp, StatBlock, StatSourceKind, TaskStats,
    WorkflowProgress, WorkflowState,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::CatalogSource;
use crate::monitor::{
    parse_monitor_time, select_workflows, task_type_of, MonitorSource, MonitorWorkflow,
};
use crate::request::{AggregationRequest, DateWindow};

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Monitor workflow statuses whose tasks are read.
const PROCESSED_STATUSES: [&str; 4] = ["finished", "subfinished", "running", "transforming"];
const MB_PER_GB: f64 = 1024.0;

/// Telemetry source of one aggregation.
#[derive(Clone, Copy)]
pub enum StatSource<'a> {
    Catalog(&'a dyn CatalogSource),
    Monitor(&'a dyn MonitorSource),
}

impl StatSource<'_> {
    pub fn kind(&self) -> StatSourceKind {
        match self {
            Self::Catalog(_) => StatSourceKind::Catalog,
            Self::Monitor(_) => StatSourceKind::Monitor,
        }
    }
}

/// Contribution of one run (collection or workflow) to the totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub date: Option<String>,
    /// Frozen runs are never read again.
    pub frozen: bool,
    pub tasks: BTreeMap<String, TaskStats>,
    pub progress: Option<WorkflowProgress>,
    pub malformed_records: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatCheckpoint {
    pub schema_version: u32,
    pub scope: String,
    pub source: StatSourceKind,
    pub runs: BTreeMap<String, RunStats>,
}

impl Default for StatCheckpoint {
    fn default() -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            scope: String::new(),
            source: StatSourceKind::Catalog,
            runs: BTreeMap::new(),
        }
    }
}

impl StatCheckpoint {
    fn fresh(scope: &str, source: StatSourceKind) -> Self {
        Self {
            scope: scope.to_string(),
            source,
            ..Self::default()
        }
    }

    /// Totals folded over runs in key order.
    pub fn totals(&self) -> StatBlock {
        let mut block = StatBlock::new(self.source);
        for run in self.runs.values() {
            for (task_type, stats) in &run.tasks {
                block.add_task(task_type, stats);
            }
            block.malformed_records += run.malformed_records;
        }
        block
    }
}

/// Outcome of one aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationReport {
    pub scope: String,
    pub source: StatSourceKind,
    pub block: StatBlock,
    pub runs_read: Vec<String>,
    pub runs_skipped: Vec<String>,
    /// Latest monitor progress per run key.
    pub progress: BTreeMap<String, WorkflowProgress>,
    pub diagnostics: Vec<Diagnostic>,
    pub checkpoint_path: PathBuf,
}

/// Aggregates per-task statistics into `<source>Stat-<scope>.json` checkpoints.
#[derive(Debug, Clone)]
pub struct StatAggregator {
    data_dir: PathBuf,
}

impl StatAggregator {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn checkpoint_path(&self, source: StatSourceKind, scope: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}Stat-{scope}.json", source.label()))
    }

    pub fn load_checkpoint(&self, source: StatSourceKind, scope: &str) -> StatCheckpoint {
        let path = self.checkpoint_path(source, scope);
        if !path.exists() {
            return StatCheckpoint::fresh(scope, source);
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to read checkpoint; starting fresh");
                return StatCheckpoint::fresh(scope, source);
            }
        };
        match serde_json::from_str::<StatCheckpoint>(&raw) {
            Ok(checkpoint)
                if checkpoint.schema_version == CHECKPOINT_SCHEMA_VERSION
                    && checkpoint.source == source =>
            {
                checkpoint
            }
            Ok(checkpoint) => {
                warn!(
                    path = %path.display(),
                    schema_version = checkpoint.schema_version,
                    "unsupported checkpoint; starting fresh"
                );
                StatCheckpoint::fresh(scope, source)
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to parse checkpoint; starting fresh");
                StatCheckpoint::fresh(scope, source)
            }
        }
    }

    fn save_checkpoint(&self, path: &Path, checkpoint: &StatCheckpoint) -> ProdstatResult<()> {
        let mut payload = serde_json::to_string_pretty(checkpoint)?;
        payload.push('\n');
        write_text_atomic(path, &payload).map_err(|error| {
            ProdstatError::file(path.display(), std::io::Error::other(format!("{error:#}")))
        })
    }

    /// Deletes the checkpoint of `scope`. Returns false when there was none.
    pub fn reset_history(&self, source: StatSourceKind, scope: &str) -> ProdstatResult<bool> {
        let path = self.checkpoint_path(source, scope);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "checkpoint removed");
                Ok(true)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(ProdstatError::file(path.display(), error)),
        }
    }

    pub fn aggregate(
        &self,
        request: &AggregationRequest,
        source: StatSource<'_>,
        reset_history: bool,
    ) -> ProdstatResult<AggregationReport> {
        let window = request.validate()?;
        let kind = source.kind();
        if reset_history {
            self.reset_history(kind, &request.scope)?;
        }
        let mut checkpoint = self.load_checkpoint(kind, &request.scope);
        let pass = match source {
            StatSource::Catalog(catalog) => {
                read_catalog_runs(catalog, request, &window, &checkpoint)?
            }
            StatSource::Monitor(monitor) => {
                read_monitor_runs(monitor, request, &window, &checkpoint)?
            }
        };

        for (run_key, run) in pass.runs {
            checkpoint.runs.insert(run_key, run);
        }
        if kind == StatSourceKind::Catalog {
            freeze_all_but_newest(&mut checkpoint);
        }

        let path = self.checkpoint_path(kind, &request.scope);
        self.save_checkpoint(&path, &checkpoint)?;

        let progress = checkpoint
            .runs
            .iter()
            .filter_map(|(run_key, run)| run.progress.clone().map(|progress| (run_key.clone(), progress)))
            .collect();
        let report = AggregationReport {
            scope: request.scope.clone(),
            source: kind,
            block: checkpoint.totals(),
            runs_read: pass.read,
            runs_skipped: pass.skipped,
            progress,
            diagnostics: pass.diagnostics,
            checkpoint_path: path,
        };
        info!(
            scope = %report.scope,
            source = %kind,
            runs_read = report.runs_read.len(),
            runs_skipped = report.runs_skipped.len(),
            task_types = report.block.tasks.len(),
            diagnostics = report.diagnostics.len(),
            "aggregation finished"
        );
        Ok(report)
    }
}

/// Catalog runs stay open until a newer run shows up.
fn freeze_all_but_newest(checkpoint: &mut StatCheckpoint) {
    let newest = checkpoint.runs.keys().next_back().cloned();
    for (run_key, run) in &mut checkpoint.runs {
        run.frozen = Some(run_key) != newest.as_ref();
    }
}

#[derive(Debug, Default)]
struct RunPass {
    runs: BTreeMap<String, RunStats>,
    read: Vec<String>,
    skipped: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

fn is_frozen(checkpoint: &StatCheckpoint, run_key: &str) -> bool {
    checkpoint
        .runs
        .get(run_key)
        .is_some_and(|run| run.frozen)
}

/// Selects catalog collections: the name holds the scope and the collection
/// token, and its last segment is a run timestamp within the window.
pub fn select_collections(
    collections: &[String],
    scope: &str,
    token: &str,
    window: &DateWindow,
) -> BTreeMap<String, Vec<String>> {
    let mut selected: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for collection in collections {
        if !collection.contains(scope) || !collection.contains(token) {
            continue;
        }
        let last = collection.rsplit('/').next().unwrap_or(collection);
        let Ok(timestamp) = RunTimestamp::parse(last) else {
            continue;
        };
        if timestamp.date().is_some_and(|date| window.contains(date)) {
            selected
                .entry(timestamp.as_str().to_string())
                .or_default()
                .push(collection.clone());
        }
    }
    selected
}

fn read_catalog_runs(
    catalog: &dyn CatalogSource,
    request: &AggregationRequest,
    window: &DateWindow,
    checkpoint: &StatCheckpoint,
) -> ProdstatResult<RunPass> {
    let collections = catalog.list_collections()?;
    let selected = select_collections(&collections, &request.scope, &request.coll_type, window);
    let mut pass = RunPass::default();
    for (run_key, run_collections) in selected {
        if is_frozen(checkpoint, &run_key) {
            debug!(run = %run_key, "catalog run frozen; skipping");
            pass.skipped.push(run_key);
            continue;
        }
        let mut run = RunStats {
            date: RunTimestamp::parse(&run_key)
                .ok()
                .and_then(|timestamp| timestamp.date())
                .map(|date| date.to_string()),
            ..RunStats::default()
        };
        for collection in &run_collections {
            let tasks = catalog.task_records(collection)?;
            for (task_type, records) in tasks {
                let stats = sample_catalog_task(
                    catalog,
                    collection,
                    &records,
                    request.maxtask,
                    &mut run.malformed_records,
                    &mut pass.diagnostics,
                );
                run.tasks.entry(task_type).or_default().absorb(&stats);
            }
        }
        debug!(run = %run_key, collections = run_collections.len(), "catalog run read");
        pass.read.push(run_key.clone());
        pass.runs.insert(run_key, run);
    }
    Ok(pass)
}

/// Reads at most `maxtask` records and extrapolates CPU to every record.
fn sample_catalog_task(
    catalog: &dyn CatalogSource,
    collection: &str,
    records: &[String],
    maxtask: usize,
    malformed: &mut u64,
    diagnostics: &mut Vec<Diagnostic>,
) -> TaskStats {
    let mut cpu_sum = 0.0;
    let mut cpu_samples = 0_u64;
    let mut stats = TaskStats {
        n_tasks: records.len() as u64,
        n_finished: records.len() as u64,
        ..TaskStats::default()
    };
    for record in records.iter().take(maxtask) {
        match catalog.read_record(collection, record) {
            Ok(metrics) => {
                stats.n_sampled += 1;
                if let Some(cpu) = metrics.cpu_seconds {
                    cpu_sum += cpu;
                    cpu_samples += 1;
                }
                if let Some(rss) = metrics.max_rss_gb() {
                    stats.max_rss_gb = stats.max_rss_gb.max(rss);
                }
                if let Some(start) = metrics.start {
                    if stats.first_start.as_ref().map_or(true, |current| &start < current) {
                        stats.first_start = Some(start);
                    }
                }
            }
            Err(error) => {
                *malformed += 1;
                warn!(collection, record = %record, %error, "skipping unreadable record");
                diagnostics.push(Diagnostic::from_error(format!("{collection}/{record}"), &error));
            }
        }
    }
    if cpu_samples > 0 {
        stats.cpu_seconds = cpu_sum / cpu_samples as f64 * records.len() as f64;
    }
    stats
}

fn read_monitor_runs(
    monitor: &dyn MonitorSource,
    request: &AggregationRequest,
    window: &DateWindow,
    checkpoint: &StatCheckpoint,
) -> ProdstatResult<RunPass> {
    let selected = select_workflows(monitor.workflows()?, &request.scope, &request.coll_type, window);
    let mut pass = RunPass::default();
    for (run_key, workflows) in selected {
        if is_frozen(checkpoint, &run_key) {
            debug!(run = %run_key, "monitor run finished earlier; skipping");
            pass.skipped.push(run_key);
            continue;
        }
        let Some(progress) = combined_progress(&workflows) else {
            continue;
        };
        // A run key can cover several workflows; it is done only when all are.
        let frozen = workflows
            .iter()
            .all(|workflow| WorkflowState::from_monitor_status(&workflow.r_status).is_terminal());
        let mut run = RunStats {
            date: crate::monitor::run_key_date(&run_key).map(|date| date.to_string()),
            frozen,
            progress: Some(progress),
            ..RunStats::default()
        };
        for workflow in &workflows {
            let status = workflow.r_status.to_ascii_lowercase();
            if !PROCESSED_STATUSES.contains(&status.as_str()) {
                debug!(workflow = %workflow.r_name, status = %workflow.r_status, "workflow not processed");
                continue;
            }
            let mut tasks = monitor.tasks(&workflow.r_name)?;
            tasks.sort_by_key(|task| task.jeditaskid);
            for task in tasks {
                let jobs = monitor.jobs(task.jeditaskid, Some(request.maxtask), Some("finished"))?;
                if jobs.is_empty() {
                    debug!(task = %task.taskname, "task has no finished jobs");
                    continue;
                }
                let stats = monitor_task_stats(&task, &jobs);
                run.tasks
                    .entry(task_type_of(&task.taskname, &run_key))
                    .or_default()
                    .absorb(&stats);
            }
        }
        pass.read.push(run_key.clone());
        pass.runs.insert(run_key, run);
    }
    Ok(pass)
}

/// Progress summed over the workflows of one run key. The reported status is
/// that of the first workflow still active, else of the first workflow.
fn combined_progress(workflows: &[MonitorWorkflow]) -> Option<WorkflowProgress> {
    let (first, rest) = workflows.split_first()?;
    let mut combined = first.progress();
    for workflow in rest {
        let progress = workflow.progress();
        combined.counts.n_tasks += progress.counts.n_tasks;
        combined.counts.n_files += progress.counts.n_files;
        combined.counts.n_finished += progress.counts.n_finished;
        combined.counts.n_failed += progress.counts.n_failed;
        combined.counts.n_sub_finished += progress.counts.n_sub_finished;
        combined.remaining_files += progress.remaining_files;
        combined.processed_files += progress.processed_files;
        combined.created_at = match (combined.created_at.take(), progress.created_at) {
            (Some(current), Some(other)) => Some(current.min(other)),
            (current, other) => current.or(other),
        };
    }
    if let Some(active) = workflows
        .iter()
        .find(|workflow| !WorkflowState::from_monitor_status(&workflow.r_status).is_terminal())
    {
        combined.status = active.r_status.clone();
    }
    Some(combined)
}

/// Task CPU is the mean sampled job duration times the task's file count;
/// wall time runs from the earliest sampled job start to the task end.
fn monitor_task_stats(task: &crate::monitor::MonitorTask, jobs: &[crate::monitor::MonitorJob]) -> TaskStats {
    let durations: Vec<f64> = jobs.iter().filter_map(|job| job.durationsec).collect();
    let mean_duration = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };
    let earliest_start = jobs
        .iter()
        .filter_map(|job| job.starttime.as_deref().and_then(parse_monitor_time))
        .min();
    let latest_job_end = jobs
        .iter()
        .filter_map(|job| job.endtime.as_deref().and_then(parse_monitor_time))
        .max();
    let task_end = task
        .endtime
        .as_deref()
        .and_then(parse_monitor_time)
        .or(latest_job_end);
    let wall_seconds = match (earliest_start, task_end) {
        (Some(start), Some(end)) if end > start => (end - start).num_seconds() as f64,
        _ => 0.0,
    };
    let max_rss_mb = jobs
        .iter()
        .filter_map(|job| job.minramcount)
        .fold(0.0_f64, f64::max);
    let n_files = task.dsinfo.nfiles.max(jobs.len() as u64);
    let status = task.status.to_ascii_lowercase();
    TaskStats {
        n_tasks: n_files,
        n_sampled: jobs.len() as u64,
        cpu_seconds: mean_duration * n_files as f64,
        wall_seconds,
        max_rss_gb: max_rss_mb / MB_PER_GB,
        n_finished: u64::from(status == "finished" || status == "done"),
        n_failed: u64::from(status == "failed"),
        first_start: earliest_start.map(|start| start.format("%Y-%m-%d %H:%M:%S").to_string()),
    }
}
