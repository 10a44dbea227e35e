//! Campaign and step reconciliation against their tickets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use prodstat_hierarchy::{
    render_campaign_table, render_step_map_table, HierarchyStore, RegionKind, StepMapRow,
};
use prodstat_tracker::IssueTracker;
use prodstat_types::{
    CampaignIssue, CampaignStep, Diagnostic, DiagnosticKind, ProdstatError, ProdstatResult,
    StepIssue, WorkflowLink,
};
use tracing::{debug, info, warn};

use crate::descriptor::{CampaignDescriptor, StepDescriptor};
use crate::registrar::WorkflowRegistrar;
use crate::resolver::RunResolver;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub campaign: CampaignIssue,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step: StepIssue,
    pub diagnostics: Vec<Diagnostic>,
}

/// Operator overrides given next to a descriptor file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOverrides {
    pub issue: Option<String>,
    pub campaign_issue: Option<String>,
    pub name: Option<String>,
}

/// Brings campaign and step tickets in line with descriptor files.
pub struct Reconciler<'a> {
    hierarchy: HierarchyStore<'a>,
    registrar: WorkflowRegistrar<'a>,
    browse_base: String,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        tracker: &'a dyn IssueTracker,
        resolver: &'a dyn RunResolver,
        project: impl Into<String>,
        browse_base: impl Into<String>,
    ) -> Self {
        Self {
            hierarchy: HierarchyStore::new(tracker),
            registrar: WorkflowRegistrar::new(tracker, resolver, project),
            browse_base: browse_base.into(),
        }
    }

    fn project(&self) -> &str {
        self.registrar.project()
    }

    /// Stored key when given, else the ticket carrying `summary`.
    fn locate(&self, stored: Option<&str>, summary: &str) -> ProdstatResult<Option<String>> {
        match stored {
            Some(key) => {
                // Fails with IssueNotFound for a mistyped key.
                self.hierarchy.tracker().get_issue(key)?;
                Ok(Some(key.to_string()))
            }
            None => self.hierarchy.find_by_summary(self.project(), summary),
        }
    }

    pub fn reconcile_campaign(
        &self,
        descriptor: &CampaignDescriptor,
        overrides: &ReconcileOverrides,
    ) -> ProdstatResult<ReconcileReport> {
        let name = overrides
            .name
            .clone()
            .unwrap_or_else(|| descriptor.name.clone());
        if name.trim().is_empty() {
            return Err(ProdstatError::InvalidInput(
                "campaign descriptor needs a name".to_string(),
            ));
        }
        let summary = CampaignIssue::summary_line(&name);
        let requested = overrides.issue.as_deref().or(descriptor.issue.as_deref());
        let located = self.locate(requested, &summary)?;
        let stored = match &located {
            Some(key) => self.hierarchy.load_campaign(key)?,
            None => None,
        };

        let mut campaign = CampaignIssue {
            name: name.clone(),
            issue: located.clone(),
            production_issue: descriptor
                .production_issue
                .clone()
                .or_else(|| stored.as_ref().and_then(|stored| stored.production_issue.clone())),
            steps: descriptor
                .steps
                .iter()
                .map(|step| {
                    let previous = stored.as_ref().and_then(|stored| stored.step(&step.name));
                    CampaignStep {
                        name: step.name.clone(),
                        issue: previous
                            .and_then(|previous| previous.issue.clone())
                            .or_else(|| step.issue_name.clone()),
                        workflow_base: step.workflow_base.clone(),
                        split_bands: step.split_bands,
                        rollup: previous.map(|previous| previous.rollup.clone()).unwrap_or_default(),
                    }
                })
                .collect(),
        };
        campaign.ensure_unique_step_names()?;

        let key = match located {
            Some(key) => key,
            None => {
                let key = self.hierarchy.create_with_record(
                    self.project(),
                    &summary,
                    RegionKind::Campaign,
                    &campaign,
                )?;
                info!(issue = %key, campaign = %name, "campaign ticket created");
                key
            }
        };
        campaign.issue = Some(key.clone());

        let mut diagnostics = Vec::new();
        for step in &mut campaign.steps {
            if step.workflow_base.is_none() && step.issue.is_none() {
                debug!(step = %step.name, "step has no workflow base yet");
                continue;
            }
            let step_descriptor = StepDescriptor {
                name: step.name.clone(),
                issue_name: step.issue.clone(),
                campaign_issue: Some(key.clone()),
                workflow_base: step.workflow_base.clone(),
                production_issue: campaign.production_issue.clone(),
                split_bands: step.split_bands,
                workflows: BTreeMap::new(),
            };
            let report = self.reconcile_step_in(&step_descriptor, Some(&name))?;
            step.issue = report.step.issue.clone();
            diagnostics.extend(report.diagnostics);
        }

        self.hierarchy.save_campaign(&key, &campaign)?;
        self.hierarchy.write_region_text(
            &key,
            RegionKind::CampaignTable,
            &render_campaign_table(&campaign, &self.browse_base),
        )?;
        for step in &campaign.steps {
            if let Some(step_key) = &step.issue {
                self.hierarchy.link_related(&key, step_key)?;
            }
        }
        info!(
            issue = %key,
            steps = campaign.steps.len(),
            diagnostics = diagnostics.len(),
            "campaign reconciled"
        );
        Ok(ReconcileReport {
            campaign,
            diagnostics,
        })
    }

    pub fn reconcile_step(
        &self,
        descriptor: &StepDescriptor,
        overrides: &ReconcileOverrides,
    ) -> ProdstatResult<StepReport> {
        let mut descriptor = descriptor.clone();
        if overrides.issue.is_some() {
            descriptor.issue_name = overrides.issue.clone();
        }
        if overrides.campaign_issue.is_some() {
            descriptor.campaign_issue = overrides.campaign_issue.clone();
        }
        if let Some(name) = &overrides.name {
            descriptor.name = name.clone();
        }
        let campaign_name = match descriptor.campaign_issue.as_deref() {
            Some(campaign_key) => Some(
                self.hierarchy
                    .load_campaign(campaign_key)?
                    .map(|campaign| campaign.name)
                    .unwrap_or_else(|| campaign_key.to_string()),
            ),
            None => None,
        };
        self.reconcile_step_in(&descriptor, campaign_name.as_deref())
    }

    fn reconcile_step_in(
        &self,
        descriptor: &StepDescriptor,
        campaign_name: Option<&str>,
    ) -> ProdstatResult<StepReport> {
        if descriptor.name.trim().is_empty() {
            return Err(ProdstatError::InvalidInput(
                "step descriptor needs a name".to_string(),
            ));
        }
        let summary = StepIssue::summary_line(
            campaign_name
                .or(descriptor.campaign_issue.as_deref())
                .unwrap_or("unassigned campaign"),
            &descriptor.name,
        );
        let located = self.locate(descriptor.issue_name.as_deref(), &summary)?;
        let stored = match &located {
            Some(key) => self.hierarchy.load_step(key)?,
            None => None,
        };

        let mut diagnostics = Vec::new();
        let mut workflows = match &stored {
            Some(stored) => stored.workflows.clone(),
            None => descriptor.workflows.clone(),
        };
        if let Some(base) = &descriptor.workflow_base {
            match scan_artifacts(Path::new(base), &descriptor.name) {
                Ok(artifacts) => merge_artifacts(&mut workflows, artifacts),
                Err(error) => {
                    warn!(step = %descriptor.name, %error, "workflow base not scanned");
                    diagnostics.push(Diagnostic::from_error(&descriptor.name, &error));
                }
            }
        }

        let production = descriptor
            .production_issue
            .clone()
            .or_else(|| stored.as_ref().and_then(|stored| stored.production_issue.clone()));
        if let Some(production) = &production {
            for link in workflows.values_mut() {
                if link.issue.is_some() {
                    continue;
                }
                let Some(artifact) = link.artifact_path.clone() else {
                    continue;
                };
                match self
                    .registrar
                    .register(Path::new(&artifact), production, None, None)
                {
                    Ok(record) => link.issue = record.issue,
                    Err(error @ ProdstatError::TrackerUnavailable { .. }) => return Err(error),
                    Err(error) => {
                        warn!(artifact = %link.name, %error, "workflow left unregistered");
                        diagnostics.push(Diagnostic::from_error(&link.name, &error));
                    }
                }
            }
        } else if workflows.values().any(|link| link.issue.is_none()) {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::Skipped,
                &descriptor.name,
                "no production issue given; new workflows were not registered",
            ));
        }

        let mut step = StepIssue {
            name: descriptor.name.clone(),
            issue: located.clone(),
            campaign_issue: descriptor
                .campaign_issue
                .clone()
                .or_else(|| stored.as_ref().and_then(|stored| stored.campaign_issue.clone())),
            workflow_base: descriptor
                .workflow_base
                .clone()
                .or_else(|| stored.as_ref().and_then(|stored| stored.workflow_base.clone())),
            production_issue: production,
            workflows,
            rollup: stored.map(|stored| stored.rollup).unwrap_or_default(),
        };

        let key = match located {
            Some(key) => key,
            None => {
                let key = self.hierarchy.create_with_record(
                    self.project(),
                    &summary,
                    RegionKind::Step,
                    &step,
                )?;
                info!(issue = %key, step = %step.name, "step ticket created");
                key
            }
        };
        step.issue = Some(key.clone());
        self.hierarchy.save_step(&key, &step)?;
        self.write_step_table(&step)?;

        if let Some(campaign_key) = &step.campaign_issue {
            self.hierarchy.link_related(campaign_key, &key)?;
        }
        for link in step.workflows.values() {
            if let Some(workflow_key) = &link.issue {
                self.hierarchy.link_related(&key, workflow_key)?;
            }
        }
        info!(
            issue = %key,
            workflows = step.workflows.len(),
            diagnostics = diagnostics.len(),
            "step reconciled"
        );
        Ok(StepReport { step, diagnostics })
    }

    /// Rewrites the artifact table of a step from its workflow records.
    pub fn write_step_table(&self, step: &StepIssue) -> ProdstatResult<bool> {
        let Some(key) = &step.issue else {
            return Ok(false);
        };
        let rows = step_map_rows(&self.hierarchy, step)?;
        self.hierarchy.write_region_text(
            key,
            RegionKind::StepTable,
            &render_step_map_table(&rows, &self.browse_base),
        )
    }
}

/// One row per linked workflow, in artifact order.
pub fn step_map_rows(
    hierarchy: &HierarchyStore<'_>,
    step: &StepIssue,
) -> ProdstatResult<Vec<StepMapRow>> {
    let mut rows = Vec::new();
    for (artifact, link) in &step.workflows {
        let Some(issue) = &link.issue else {
            continue;
        };
        let record = match hierarchy.load_workflow(issue) {
            Ok(record) => record,
            Err(ProdstatError::IssueNotFound(_)) => {
                warn!(issue = %issue, artifact = %artifact, "linked workflow ticket is missing");
                None
            }
            Err(error) => return Err(error),
        };
        let row = match record {
            Some(record) => StepMapRow {
                artifact: artifact.clone(),
                issue: issue.clone(),
                counts: record.status_counts(),
                description: format!(
                    "{}{}",
                    record.step_name.as_deref().unwrap_or(&record.name),
                    record.data_range.as_deref().unwrap_or("()")
                ),
                timestamp: record.timestamp.map(|timestamp| timestamp.to_string()),
            },
            None => StepMapRow {
                artifact: artifact.clone(),
                issue: issue.clone(),
                counts: Default::default(),
                description: String::new(),
                timestamp: None,
            },
        };
        rows.push(row);
    }
    Ok(rows)
}

/// Submission artifacts `<step>*.yaml` directly inside `base`, sorted.
pub fn scan_artifacts(base: &Path, step_name: &str) -> ProdstatResult<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(base).map_err(|error| ProdstatError::file(base.display(), error))?;
    let mut artifacts: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy())
                .is_some_and(|name| name.starts_with(step_name) && name.ends_with(".yaml"))
        })
        .collect();
    artifacts.sort();
    Ok(artifacts)
}

/// Adds links for artifacts not seen before; existing links keep their issue.
fn merge_artifacts(workflows: &mut BTreeMap<String, WorkflowLink>, artifacts: Vec<PathBuf>) {
    for path in artifacts {
        let Some(stem) = path.file_stem().map(|stem| stem.to_string_lossy().into_owned()) else {
            continue;
        };
        let link = workflows.entry(stem.clone()).or_insert_with(|| {
            debug!(artifact = %stem, "new workflow artifact");
            WorkflowLink {
                name: stem.clone(),
                ..WorkflowLink::default()
            }
        });
        if link.artifact_path.is_none() {
            link.artifact_path = Some(path.display().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use prodstat_tracker::InMemoryTracker;
    use prodstat_types::RunTimestamp;

    use super::*;
    use crate::resolver::DirectoryRunResolver;

    const BROWSE: &str = "https://jira.example.org/browse/";

    /// Workflow base with two step1 artifacts, each with its own PREOPS-1
    /// run, and an unrelated step2 artifact.
    fn workflow_base(root: &Path) -> PathBuf {
        let base = root.join("bps");
        std::fs::create_dir_all(&base).expect("base");
        let body = "pipelineYaml: \"DRP.yaml#step1\"\npayload:\n  dataQuery: \"exposure >= 1 and exposure <= 9\"\n";
        for name in ["step1_a.yaml", "step1_b.yaml", "step2_a.yaml"] {
            std::fs::write(base.join(name), body).expect("artifact");
        }
        for (artifact, run) in [
            ("step1_a", "20220101T000000Z"),
            ("step1_b", "20220102T000000Z"),
        ] {
            let dir = base.join("submit/u").join(artifact).join(run);
            std::fs::create_dir_all(&dir).expect("run");
            std::fs::write(
                dir.join(format!("{artifact}.yaml")),
                format!("{body}# PREOPS-1\n"),
            )
            .expect("copy");
        }
        base
    }

    fn descriptor(base: &Path) -> CampaignDescriptor {
        let mut descriptor = CampaignDescriptor::template("w_2022_04", None);
        descriptor.production_issue = Some("PREOPS-1".to_string());
        descriptor.steps[0].workflow_base = Some(base.display().to_string());
        descriptor
    }

    fn tracker() -> InMemoryTracker {
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("PREOPS-1", "production request", "");
        tracker
    }

    #[test]
    fn unit_scan_artifacts_filters_by_step_prefix() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let base = workflow_base(tempdir.path());
        let found = scan_artifacts(&base, "step1").expect("scan");
        let names: Vec<_> = found
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["step1_a.yaml", "step1_b.yaml"]);
    }

    #[test]
    fn functional_reconcile_campaign_creates_campaign_step_and_workflows() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let base = workflow_base(tempdir.path());
        let tracker = tracker();
        let resolver = DirectoryRunResolver;
        let reconciler = Reconciler::new(&tracker, &resolver, "DRP", BROWSE);

        let report = reconciler
            .reconcile_campaign(&descriptor(&base), &ReconcileOverrides::default())
            .expect("reconcile");
        let campaign_key = report.campaign.issue.clone().expect("campaign key");
        let step1 = report.campaign.step("step1").expect("step1");
        let step_key = step1.issue.clone().expect("step key");
        assert!(report.campaign.step("step2").expect("step2").issue.is_none());

        let step = HierarchyStore::new(&tracker)
            .load_step(&step_key)
            .expect("load")
            .expect("record");
        assert_eq!(step.campaign_issue.as_deref(), Some(campaign_key.as_str()));
        assert_eq!(step.workflows.len(), 2);
        let first = step.workflows["step1_a"].issue.clone().expect("step1_a issue");
        let second = step.workflows["step1_b"].issue.clone().expect("step1_b issue");
        assert_ne!(first, second);
        assert!(tracker
            .links()
            .contains(&("Relates".to_string(), step_key.clone(), first)));
        assert!(tracker
            .links()
            .contains(&("Relates".to_string(), campaign_key.clone(), step_key.clone())));

        let ticket = tracker.get_issue(&campaign_key).expect("campaign ticket");
        assert_eq!(ticket.summary, "Campaign w_2022_04");
        assert!(ticket.description.contains("||Step||Issue||"));
        let step_ticket = tracker.get_issue(&step_key).expect("step ticket");
        assert_eq!(step_ticket.summary, "Step step1 of w_2022_04");
        assert!(step_ticket.description.contains("||BPS_yaml||Issue||"));
    }

    #[test]
    fn functional_reconcile_campaign_is_idempotent() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let base = workflow_base(tempdir.path());
        let tracker = tracker();
        let resolver = DirectoryRunResolver;
        let reconciler = Reconciler::new(&tracker, &resolver, "DRP", BROWSE);
        let descriptor = descriptor(&base);

        let first = reconciler
            .reconcile_campaign(&descriptor, &ReconcileOverrides::default())
            .expect("first");
        let tickets = tracker.issue_count();
        let links = tracker.links();
        let second = reconciler
            .reconcile_campaign(&descriptor, &ReconcileOverrides::default())
            .expect("second");

        assert_eq!(first.campaign, second.campaign);
        assert_eq!(tracker.issue_count(), tickets);
        assert_eq!(tracker.links(), links);
    }

    #[test]
    fn regression_unresolvable_artifacts_become_diagnostics() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let base = workflow_base(tempdir.path());
        std::fs::remove_dir_all(base.join("submit")).expect("drop runs");
        let tracker = tracker();
        let resolver = DirectoryRunResolver;
        let reconciler = Reconciler::new(&tracker, &resolver, "DRP", BROWSE);

        let report = reconciler
            .reconcile_campaign(&descriptor(&base), &ReconcileOverrides::default())
            .expect("reconcile");
        assert_eq!(report.diagnostics.len(), 2);
        assert!(report
            .diagnostics
            .iter()
            .all(|diagnostic| diagnostic.kind == DiagnosticKind::Registration));
        let step_key = report.campaign.step("step1").and_then(|step| step.issue.clone());
        let step = HierarchyStore::new(&tracker)
            .load_step(&step_key.expect("step key"))
            .expect("load")
            .expect("record");
        assert!(step.workflows.values().all(|link| link.issue.is_none()));
    }

    #[test]
    fn functional_existing_links_keep_their_issue() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let base = workflow_base(tempdir.path());
        let tracker = tracker();
        tracker.seed_issue("DRP-50", "hand made", "");
        let resolver = DirectoryRunResolver;
        let reconciler = Reconciler::new(&tracker, &resolver, "DRP", BROWSE);

        let mut step = StepDescriptor {
            name: "step1".to_string(),
            workflow_base: Some(base.display().to_string()),
            ..StepDescriptor::default()
        };
        step.workflows.insert(
            "step1_a".to_string(),
            WorkflowLink {
                name: "step1_a".to_string(),
                issue: Some("DRP-50".to_string()),
                ..WorkflowLink::default()
            },
        );
        let report = reconciler
            .reconcile_step(&step, &ReconcileOverrides::default())
            .expect("reconcile");
        let link = &report.step.workflows["step1_a"];
        assert_eq!(link.issue.as_deref(), Some("DRP-50"));
        assert!(link.artifact_path.is_some());
        assert!(report.step.workflows["step1_b"].issue.is_none());
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].kind, DiagnosticKind::Skipped);
    }

    #[test]
    fn regression_duplicate_step_names_are_rejected() {
        let tracker = tracker();
        let resolver = DirectoryRunResolver;
        let reconciler = Reconciler::new(&tracker, &resolver, "DRP", BROWSE);
        let mut descriptor = CampaignDescriptor::template("dup", None);
        descriptor.steps[1].name = "step1".to_string();
        let error = reconciler
            .reconcile_campaign(&descriptor, &ReconcileOverrides::default())
            .expect_err("duplicate");
        assert!(matches!(error, ProdstatError::InvalidRecord { .. }));
        assert_eq!(tracker.create_calls(), 0);
    }

    #[test]
    fn regression_artifacts_sharing_an_output_prefix_keep_separate_tickets() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let base = tempdir.path().join("bps");
        std::fs::create_dir_all(&base).expect("base");
        for (name, run) in [
            ("step1_a", "20220101T000000Z"),
            ("step1_b", "20220102T000000Z"),
        ] {
            std::fs::write(
                base.join(format!("{name}.yaml")),
                format!(
                    "pipelineYaml: \"DRP.yaml#step1\"\npayload:\n  payloadName: {name}\n  output: \"u/prod/PREOPS-1/{{payloadName}}\"\n"
                ),
            )
            .expect("artifact");
            std::fs::create_dir_all(base.join("submit/u/prod/PREOPS-1").join(name).join(run))
                .expect("run");
        }
        let tracker = tracker();
        let resolver = DirectoryRunResolver;
        let reconciler = Reconciler::new(&tracker, &resolver, "DRP", BROWSE);

        let report = reconciler
            .reconcile_campaign(&descriptor(&base), &ReconcileOverrides::default())
            .expect("reconcile");
        assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
        let step_key = report
            .campaign
            .step("step1")
            .and_then(|step| step.issue.clone())
            .expect("step key");
        let hierarchy = HierarchyStore::new(&tracker);
        let step = hierarchy.load_step(&step_key).expect("load").expect("record");
        let first = step.workflows["step1_a"].issue.clone().expect("step1_a issue");
        let second = step.workflows["step1_b"].issue.clone().expect("step1_b issue");
        assert_ne!(first, second);

        for (key, run) in [(first, "20220101T000000Z"), (second, "20220102T000000Z")] {
            let workflow = hierarchy
                .load_workflow(&key)
                .expect("load workflow")
                .expect("workflow record");
            assert_eq!(
                workflow.timestamp.as_ref().map(RunTimestamp::as_str),
                Some(run)
            );
        }
    }
}
