//! Workflow ticket registration.

use std::path::Path;

use prodstat_hierarchy::{render_workflow_stats, HierarchyStore, RegionKind};
use prodstat_tracker::{IssueTracker, IssueUpdate};
use prodstat_types::{is_new_workflow_sentinel, ProdstatError, ProdstatResult, WorkflowIssue};
use tracing::info;

use crate::resolver::RunResolver;
use crate::submission::{monitor_link, run_keywords, SubmissionArtifact};

/// Creates or updates the ticket of one submitted workflow run.
pub struct WorkflowRegistrar<'a> {
    hierarchy: HierarchyStore<'a>,
    resolver: &'a dyn RunResolver,
    project: String,
}

impl<'a> WorkflowRegistrar<'a> {
    pub fn new(
        tracker: &'a dyn IssueTracker,
        resolver: &'a dyn RunResolver,
        project: impl Into<String>,
    ) -> Self {
        Self {
            hierarchy: HierarchyStore::new(tracker),
            resolver,
            project: project.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Registers `artifact` under `production`.
    ///
    /// `existing` names the ticket to update; absent or `DRP0` means reuse
    /// the ticket carrying the same summary, or create one.
    pub fn register(
        &self,
        artifact: &Path,
        production: &str,
        existing: Option<&str>,
        explicit_ts: Option<&str>,
    ) -> ProdstatResult<WorkflowIssue> {
        let tracker = self.hierarchy.tracker();
        if !tracker.issue_exists(production)? {
            return Err(ProdstatError::Registration {
                production_issue: production.to_string(),
                reason: "production issue does not exist in the tracker".to_string(),
            });
        }

        let run = self.resolver.resolve(artifact, production, explicit_ts)?;
        let submission = SubmissionArtifact::load(artifact)?;
        let mut keywords = submission.keywords();
        keywords.extend(run_keywords(&run.run_dir));

        let name = artifact
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifact.display().to_string());
        let mut record = WorkflowIssue {
            production_issue: production.to_string(),
            name,
            step_name: submission.step_name(),
            monitor_link: Some(monitor_link(&run.timestamp)),
            timestamp: Some(run.timestamp),
            artifact_path: Some(artifact.display().to_string()),
            submit_keywords: keywords,
            data_range: Some(submission.data_range()),
            ..WorkflowIssue::default()
        };
        let summary = record.summary_line();

        let target = if is_new_workflow_sentinel(existing) {
            self.hierarchy.find_by_summary(&self.project, &summary)?
        } else {
            existing.map(|key| key.trim().to_string())
        };

        let key = match target {
            Some(key) => {
                let ticket = tracker.get_issue(&key)?;
                if let Some(stored) = self.hierarchy.load_workflow(&key)? {
                    record.state = stored.state;
                    record.progress = stored.progress;
                    record.catalog_stats = stored.catalog_stats;
                    record.monitor_stats = stored.monitor_stats;
                }
                if ticket.summary != summary {
                    tracker.update_issue(
                        &key,
                        &IssueUpdate {
                            summary: Some(summary.clone()),
                            description: None,
                        },
                    )?;
                }
                record.issue = Some(key.clone());
                let changed = self.hierarchy.save_workflow(&key, &record)?;
                info!(issue = %key, %summary, changed, "workflow ticket updated");
                key
            }
            None => {
                let key = self.hierarchy.create_with_record(
                    &self.project,
                    &summary,
                    RegionKind::Workflow,
                    &record,
                )?;
                record.issue = Some(key.clone());
                self.hierarchy.save_workflow(&key, &record)?;
                info!(issue = %key, %summary, "workflow ticket created");
                key
            }
        };

        self.hierarchy.write_region_text(
            &key,
            RegionKind::WorkflowStats,
            &render_workflow_stats(&record),
        )?;
        self.hierarchy.link_related(production, &key)?;
        Ok(record)
    }
}
