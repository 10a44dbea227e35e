use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ProdstatError, RunTimestamp, StatBlock, StatusCounts};

/// Workflow issue value meaning "no ticket yet, create one".
pub const NEW_WORKFLOW_SENTINEL: &str = "DRP0";

/// Returns true when `issue` is absent, blank or the creation sentinel.
pub fn is_new_workflow_sentinel(issue: Option<&str>) -> bool {
    match issue.map(str::trim) {
        None => true,
        Some(value) => value.is_empty() || value.eq_ignore_ascii_case(NEW_WORKFLOW_SENTINEL),
    }
}

/// Completion state of a workflow run as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Submitted,
    Running,
    Transforming,
    Complete,
    Failed,
}

impl WorkflowState {
    /// Maps a monitor status string onto a state.
    pub fn from_monitor_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "finished" | "subfinished" | "sub_finished" | "done" => Self::Complete,
            "failed" | "cancelled" | "canceled" | "broken" | "aborted" => Self::Failed,
            "running" => Self::Running,
            "transforming" => Self::Transforming,
            _ => Self::Submitted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Transforming => "transforming",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Latest progress snapshot reported by the monitor for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkflowProgress {
    pub status: String,
    pub created_at: Option<String>,
    pub counts: StatusCounts,
    pub remaining_files: u64,
    pub processed_files: u64,
}

/// One submitted processing unit and its ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkflowIssue {
    pub issue: Option<String>,
    pub production_issue: String,
    pub name: String,
    pub step_name: Option<String>,
    pub timestamp: Option<RunTimestamp>,
    pub artifact_path: Option<String>,
    pub submit_keywords: BTreeMap<String, String>,
    pub data_range: Option<String>,
    pub monitor_link: Option<String>,
    pub state: WorkflowState,
    pub progress: Option<WorkflowProgress>,
    pub catalog_stats: Option<StatBlock>,
    pub monitor_stats: Option<StatBlock>,
}

impl WorkflowIssue {
    /// Ticket summary, also used to find an already registered run.
    pub fn summary_line(&self) -> String {
        let step = self.step_name.as_deref().unwrap_or(self.name.as_str());
        let timestamp = self
            .timestamp
            .as_ref()
            .map(RunTimestamp::as_str)
            .unwrap_or("unresolved");
        format!("{step}#{}/{timestamp}", self.production_issue)
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.progress
            .as_ref()
            .map(|progress| progress.counts)
            .unwrap_or_default()
    }
}

/// Reference from a step to one submission artifact and its workflow ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowLink {
    pub name: String,
    pub artifact_path: Option<String>,
    #[serde(alias = "issue_name")]
    pub issue: Option<String>,
    pub band: String,
}

impl Default for WorkflowLink {
    fn default() -> Self {
        Self {
            name: String::new(),
            artifact_path: None,
            issue: None,
            band: "all".to_string(),
        }
    }
}

/// Rollup fields filled in by a mapping import or left empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Rollup {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub core_hours: Option<f64>,
    pub state: Option<String>,
}

impl Rollup {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One named pipeline stage and the workflows implementing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StepIssue {
    pub name: String,
    #[serde(alias = "issue_name")]
    pub issue: Option<String>,
    pub campaign_issue: Option<String>,
    pub workflow_base: Option<String>,
    pub production_issue: Option<String>,
    /// Keyed by artifact name (file stem of the submission artifact).
    pub workflows: BTreeMap<String, WorkflowLink>,
    pub rollup: Rollup,
}

impl StepIssue {
    pub fn summary_line(campaign_name: &str, step_name: &str) -> String {
        format!("Step {step_name} of {campaign_name}")
    }
}

/// A step entry as listed by its campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CampaignStep {
    pub name: String,
    #[serde(alias = "issue_name")]
    pub issue: Option<String>,
    pub workflow_base: Option<String>,
    pub split_bands: bool,
    pub rollup: Rollup,
}

/// Top-level campaign and its ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CampaignIssue {
    pub name: String,
    pub issue: Option<String>,
    pub production_issue: Option<String>,
    pub steps: Vec<CampaignStep>,
}

impl CampaignIssue {
    pub fn summary_line(campaign_name: &str) -> String {
        format!("Campaign {campaign_name}")
    }

    pub fn step(&self, name: &str) -> Option<&CampaignStep> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut CampaignStep> {
        self.steps.iter_mut().find(|step| step.name == name)
    }

    /// Rejects campaigns that list the same step name twice.
    pub fn ensure_unique_step_names(&self) -> Result<(), ProdstatError> {
        let mut seen = std::collections::BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ProdstatError::InvalidRecord {
                    kind: "campaign".to_string(),
                    location: self.name.clone(),
                    reason: format!("step '{}' is listed more than once", step.name),
                });
            }
        }
        Ok(())
    }
}

/// Key of the shared summary table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SummaryKey {
    pub production_issue: String,
    pub workflow_issue: String,
}

impl SummaryKey {
    pub fn new(production_issue: impl Into<String>, workflow_issue: impl Into<String>) -> Self {
        Self {
            production_issue: production_issue.into(),
            workflow_issue: workflow_issue.into(),
        }
    }
}

impl fmt::Display for SummaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.production_issue, self.workflow_issue)
    }
}

/// One line of the shared summary table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SummaryRow {
    pub production_issue: String,
    pub workflow_issue: String,
    pub timestamp: Option<String>,
    pub counts: StatusCounts,
    pub monitor_link: Option<String>,
    pub description: String,
}

impl SummaryRow {
    pub fn key(&self) -> SummaryKey {
        SummaryKey::new(self.production_issue.clone(), self.workflow_issue.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_sentinel_detection() {
        assert!(is_new_workflow_sentinel(None));
        assert!(is_new_workflow_sentinel(Some("DRP0")));
        assert!(is_new_workflow_sentinel(Some(" drp0 ")));
        assert!(is_new_workflow_sentinel(Some("")));
        assert!(!is_new_workflow_sentinel(Some("DRP-12")));
    }

    #[test]
    fn unit_workflow_state_from_monitor_status() {
        assert_eq!(WorkflowState::from_monitor_status("Finished"), WorkflowState::Complete);
        assert_eq!(WorkflowState::from_monitor_status("subfinished"), WorkflowState::Complete);
        assert_eq!(WorkflowState::from_monitor_status("failed"), WorkflowState::Failed);
        assert_eq!(WorkflowState::from_monitor_status("running"), WorkflowState::Running);
        assert_eq!(
            WorkflowState::from_monitor_status("transforming"),
            WorkflowState::Transforming
        );
        assert_eq!(WorkflowState::from_monitor_status("new"), WorkflowState::Submitted);
        assert!(WorkflowState::Failed.is_terminal());
        assert!(!WorkflowState::Running.is_terminal());
    }

    #[test]
    fn functional_partial_payloads_fill_defaults() {
        let workflow: WorkflowIssue =
            serde_json::from_str(r#"{"production_issue":"PREOPS-1"}"#).expect("workflow");
        assert_eq!(workflow.production_issue, "PREOPS-1");
        assert_eq!(workflow.state, WorkflowState::Submitted);
        assert!(workflow.catalog_stats.is_none());

        let link: WorkflowLink = serde_json::from_str(r#"{"name":"step1_a"}"#).expect("link");
        assert_eq!(link.band, "all");

        let step: StepIssue = serde_json::from_str("{}").expect("step");
        assert!(step.workflows.is_empty());
        assert!(step.rollup.is_empty());

        let legacy: StepIssue = serde_json::from_str(
            r#"{"name":"step1","issue_name":"DRP-4","workflows":{"step1_a":{"name":"step1_a","issue_name":"DRP-9","bps_dir":"/x"}}}"#,
        )
        .expect("legacy step");
        assert_eq!(legacy.issue.as_deref(), Some("DRP-4"));
        assert_eq!(legacy.workflows["step1_a"].issue.as_deref(), Some("DRP-9"));
    }

    #[test]
    fn unit_workflow_summary_line_uses_step_and_timestamp() {
        let workflow = WorkflowIssue {
            production_issue: "PREOPS-973".to_string(),
            name: "step1_ab".to_string(),
            step_name: Some("step1".to_string()),
            timestamp: RunTimestamp::parse("20220127T205042Z").ok(),
            ..WorkflowIssue::default()
        };
        assert_eq!(workflow.summary_line(), "step1#PREOPS-973/20220127T205042Z");
    }

    #[test]
    fn regression_duplicate_step_names_are_rejected() {
        let campaign = CampaignIssue {
            name: "dp0".to_string(),
            steps: vec![
                CampaignStep {
                    name: "step1".to_string(),
                    ..CampaignStep::default()
                },
                CampaignStep {
                    name: "step1".to_string(),
                    ..CampaignStep::default()
                },
            ],
            ..CampaignIssue::default()
        };
        let error = campaign.ensure_unique_step_names().expect_err("duplicate");
        assert!(error.to_string().contains("step1"));
    }
}
