//! Statistics refresh for one workflow ticket (`update-stat`).

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use prodstat_hierarchy::{render_workflow_stats, HierarchyStore, RegionKind};
use prodstat_stats::{
    write_reports, AggregationReport, AggregationRequest, CatalogSource, MonitorSource,
    StatAggregator, StatSource, DEFAULT_MAX_TASK,
};
use prodstat_types::{Diagnostic, ProdstatError, ProdstatResult, WorkflowIssue, WorkflowState};
use tracing::{info, warn};

use crate::submission::monitor_link;

/// Earliest run date considered when refreshing a workflow.
pub const REFRESH_START_DATE: &str = "2021-01-01";

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub workflow: WorkflowIssue,
    pub written: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Directory holding the checkpoints and tables of one workflow refresh.
pub fn workflow_stat_dir(data_dir: &Path, workflow_issue: &str) -> PathBuf {
    data_dir.join("workflows").join(workflow_issue)
}

/// Telemetry sources and output location for workflow refreshes.
pub struct WorkflowStatRefresh<'a> {
    pub hierarchy: HierarchyStore<'a>,
    pub catalog: &'a dyn CatalogSource,
    pub monitor: &'a dyn MonitorSource,
    pub data_dir: &'a Path,
}

impl WorkflowStatRefresh<'_> {
    /// Runs both aggregations for the run of `workflow_issue` and stores the
    /// two blocks, the inferred state and the monitor progress on its ticket.
    ///
    /// Each refresh starts from a clean checkpoint. A source that cannot be
    /// reached leaves its block untouched; the refresh fails only when
    /// neither source answers.
    pub fn refresh(
        &self,
        production: &str,
        workflow_issue: &str,
        today: NaiveDate,
        generated_at: NaiveDateTime,
    ) -> ProdstatResult<RefreshOutcome> {
        let hierarchy = &self.hierarchy;
        let mut record = hierarchy
            .load_workflow(workflow_issue)?
            .ok_or_else(|| ProdstatError::InvalidRecord {
                kind: "workflow".to_string(),
                location: workflow_issue.to_string(),
                reason: "ticket carries no workflow record; register it first".to_string(),
            })?;
        let timestamp = record
            .timestamp
            .clone()
            .ok_or_else(|| ProdstatError::InvalidRecord {
                kind: "workflow".to_string(),
                location: workflow_issue.to_string(),
                reason: "workflow record has no run timestamp".to_string(),
            })?;

        let dir = workflow_stat_dir(self.data_dir, workflow_issue);
        let aggregator = StatAggregator::new(&dir);
        let request = |token: String| AggregationRequest {
            butler: String::new(),
            scope: production.to_string(),
            coll_type: token,
            maxtask: DEFAULT_MAX_TASK,
            start_date: REFRESH_START_DATE.to_string(),
            stop_date: today.format("%Y-%m-%d").to_string(),
        };

        let mut diagnostics = Vec::new();
        let mut written = Vec::new();
        let mut failures = Vec::new();
        let mut run =
            |source: StatSource<'_>, token: String| -> ProdstatResult<Option<AggregationReport>> {
                let label = source.kind().label();
                match aggregator.aggregate(&request(token), source, true) {
                    Ok(report) => {
                        written.extend(write_reports(&dir, &report, generated_at)?);
                        Ok(Some(report))
                    }
                    Err(error @ ProdstatError::SourceUnavailable { .. }) => {
                        warn!(workflow = workflow_issue, source = label, %error, "source skipped");
                        failures.push(error);
                        Ok(None)
                    }
                    Err(error) => Err(error),
                }
            };
        let catalog_report = run(
            StatSource::Catalog(self.catalog),
            timestamp.as_str().to_string(),
        )?;
        let monitor_report = run(StatSource::Monitor(self.monitor), timestamp.to_lowercase())?;

        if catalog_report.is_none() && monitor_report.is_none() {
            if let Some(error) = failures.pop() {
                return Err(error);
            }
        }
        diagnostics.extend(
            failures
                .iter()
                .map(|error| Diagnostic::from_error(workflow_issue, error)),
        );

        if let Some(report) = catalog_report {
            diagnostics.extend(report.diagnostics);
            record.catalog_stats = Some(report.block);
        }
        if let Some(report) = monitor_report {
            diagnostics.extend(report.diagnostics);
            let progress = report
                .progress
                .get(&timestamp.to_lowercase())
                .or_else(|| report.progress.values().next_back())
                .cloned();
            if let Some(progress) = progress {
                record.state = WorkflowState::from_monitor_status(&progress.status);
                record.progress = Some(progress);
            }
            record.monitor_stats = Some(report.block);
        }
        record.monitor_link = Some(monitor_link(&timestamp));
        record.issue = Some(workflow_issue.to_string());

        hierarchy.save_workflow(workflow_issue, &record)?;
        hierarchy.write_region_text(
            workflow_issue,
            RegionKind::WorkflowStats,
            &render_workflow_stats(&record),
        )?;
        info!(
            workflow = workflow_issue,
            production,
            state = %record.state,
            files = written.len(),
            "workflow statistics refreshed"
        );
        Ok(RefreshOutcome {
            workflow: record,
            written,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use prodstat_stats::{FsCatalog, InMemoryMonitor, MonitorJob, MonitorTask, MonitorWorkflow};
    use prodstat_tracker::{InMemoryTracker, IssueTracker};
    use prodstat_types::{RunTimestamp, StatusCounts};

    use super::*;

    const RUN: &str = "20220127T205042Z";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 3, 1).expect("date")
    }

    fn generated_at() -> NaiveDateTime {
        today().and_hms_opt(12, 0, 0).expect("time")
    }

    fn seeded(tracker: &InMemoryTracker) {
        tracker.seed_issue("PREOPS-1", "production request", "");
        tracker.seed_issue("DRP-5", "step1#PREOPS-1/20220127T205042Z", "notes\n");
        let record = WorkflowIssue {
            issue: Some("DRP-5".to_string()),
            production_issue: "PREOPS-1".to_string(),
            name: "step1".to_string(),
            step_name: Some("step1".to_string()),
            timestamp: Some(RunTimestamp::parse(RUN).expect("ts")),
            ..WorkflowIssue::default()
        };
        HierarchyStore::new(tracker)
            .save_workflow("DRP-5", &record)
            .expect("seed workflow");
    }

    fn catalog(root: &Path) -> FsCatalog {
        let dir = root
            .join("u/PREOPS-1/step1")
            .join(RUN)
            .join("isr_metadata");
        std::fs::create_dir_all(&dir).expect("catalog dir");
        for (index, cpu) in [10.0, 30.0].iter().enumerate() {
            std::fs::write(
                dir.join(format!("r{index}.yaml")),
                format!(
                    "isr:\n  quantum:\n    startCpuTime: 0\n    endCpuTime: {cpu}\n    MaxResidentSetSize: 1048576\n    startUtc: '2022-01-27 21:00:0{index}'\n"
                ),
            )
            .expect("record");
        }
        FsCatalog::new(root)
    }

    fn monitor() -> InMemoryMonitor {
        let monitor = InMemoryMonitor::new();
        let name = format!("u_preops-1_step1_{}", RUN.to_ascii_lowercase());
        let mut statuses = std::collections::BTreeMap::new();
        statuses.insert("Finished".to_string(), 1);
        monitor.add_workflow(MonitorWorkflow {
            r_name: name.clone(),
            r_status: "finished".to_string(),
            created_at: Some("2022-01-27 20:55:00".to_string()),
            total_tasks: 1,
            total_files: 2,
            remaining_files: 0,
            processed_files: 2,
            tasks_statuses: statuses,
        });
        monitor.add_task(
            MonitorTask {
                jeditaskid: 1,
                taskname: format!("{name}_isr_1"),
                status: "done".to_string(),
                starttime: Some("2022-01-27 21:00:00".to_string()),
                endtime: Some("2022-01-27 22:00:00".to_string()),
                ..MonitorTask::default()
            },
            vec![MonitorJob {
                jobname: "j1".to_string(),
                jobstatus: "finished".to_string(),
                durationsec: Some(600.0),
                starttime: Some("2022-01-27 21:00:00".to_string()),
                endtime: Some("2022-01-27 21:10:00".to_string()),
                minramcount: Some(2048.0),
            }],
        );
        monitor
    }

    #[test]
    fn functional_refresh_stores_both_blocks_state_and_view() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let tracker = InMemoryTracker::new();
        seeded(&tracker);
        let hierarchy = HierarchyStore::new(&tracker);
        let catalog = catalog(&tempdir.path().join("repo"));
        let monitor = monitor();
        let data_dir = tempdir.path().join("data");

        let outcome = WorkflowStatRefresh {
            hierarchy,
            catalog: &catalog,
            monitor: &monitor,
            data_dir: &data_dir,
        }
        .refresh("PREOPS-1", "DRP-5", today(), generated_at())
        .expect("refresh");

        let record = &outcome.workflow;
        let catalog_block = record.catalog_stats.as_ref().expect("catalog block");
        assert_eq!(catalog_block.tasks["isr"].n_tasks, 2);
        assert!(record.monitor_stats.is_some());
        assert_eq!(record.state, WorkflowState::Complete);
        assert_eq!(
            record.progress.as_ref().map(|progress| progress.counts),
            Some(StatusCounts {
                n_tasks: 1,
                n_files: 2,
                n_finished: 1,
                n_failed: 0,
                n_sub_finished: 0,
            })
        );
        assert!(outcome
            .written
            .iter()
            .all(|path| path.starts_with(workflow_stat_dir(&data_dir, "DRP-5"))));

        let ticket = tracker.get_issue("DRP-5").expect("ticket");
        assert!(ticket.description.starts_with("notes\n"));
        assert!(ticket.description.contains("h4. Butler statistics"));
        assert!(ticket.description.contains("h4. PanDA statistics"));
    }

    #[test]
    fn regression_unreachable_monitor_keeps_catalog_refresh() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let tracker = InMemoryTracker::new();
        seeded(&tracker);
        let hierarchy = HierarchyStore::new(&tracker);
        let catalog = catalog(&tempdir.path().join("repo"));
        let monitor = monitor();
        monitor.set_unavailable(true);

        let outcome = WorkflowStatRefresh {
            hierarchy,
            catalog: &catalog,
            monitor: &monitor,
            data_dir: tempdir.path(),
        }
        .refresh("PREOPS-1", "DRP-5", today(), generated_at())
        .expect("refresh");
        assert!(outcome.workflow.catalog_stats.is_some());
        assert!(outcome.workflow.monitor_stats.is_none());
        assert_eq!(outcome.diagnostics.len(), 1);
    }

    #[test]
    fn regression_both_sources_down_is_source_unavailable() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let tracker = InMemoryTracker::new();
        seeded(&tracker);
        let hierarchy = HierarchyStore::new(&tracker);
        let catalog = FsCatalog::new(tempdir.path().join("missing"));
        let monitor = monitor();
        monitor.set_unavailable(true);

        let error = WorkflowStatRefresh {
            hierarchy,
            catalog: &catalog,
            monitor: &monitor,
            data_dir: tempdir.path(),
        }
        .refresh("PREOPS-1", "DRP-5", today(), generated_at())
        .expect_err("both down");
        assert_eq!(error.exit_code(), 7);
    }

    #[test]
    fn regression_unregistered_ticket_is_rejected() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("DRP-9", "bare", "");
        let hierarchy = HierarchyStore::new(&tracker);
        let error = WorkflowStatRefresh {
            hierarchy,
            catalog: &FsCatalog::new(tempdir.path()),
            monitor: &InMemoryMonitor::new(),
            data_dir: tempdir.path(),
        }
        .refresh("PREOPS-1", "DRP-9", today(), generated_at())
        .expect_err("no record");
        assert!(matches!(error, ProdstatError::InvalidRecord { .. }));
    }
}
