use prodstat_tracker::{IssueTracker, IssueUpdate, NewIssue, RELATES_LINK_TYPE};
use prodstat_types::{CampaignIssue, ProdstatResult, StepIssue, WorkflowIssue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::embedded::{decode_record, encode_record, extract_region, upsert_region, RegionKind};

/// Reads and writes hierarchy records through ticket descriptions.
///
/// Every write is read-modify-write on the live description so free text
/// edited by operators between runs is kept.
#[derive(Clone, Copy)]
pub struct HierarchyStore<'a> {
    tracker: &'a dyn IssueTracker,
}

impl<'a> HierarchyStore<'a> {
    pub fn new(tracker: &'a dyn IssueTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &'a dyn IssueTracker {
        self.tracker
    }

    /// Raw body of the region of `kind` on `issue`, if present.
    pub fn read_region(&self, issue: &str, kind: RegionKind) -> ProdstatResult<Option<String>> {
        let ticket = self.tracker.get_issue(issue)?;
        Ok(extract_region(&ticket.description, kind).map(str::to_string))
    }

    /// Writes `body` into the region of `kind`. Returns false when the
    /// description already held exactly that content.
    pub fn write_region_text(&self, issue: &str, kind: RegionKind, body: &str) -> ProdstatResult<bool> {
        let ticket = self.tracker.get_issue(issue)?;
        let updated = upsert_region(&ticket.description, kind, body);
        if updated == ticket.description {
            debug!(issue, region = kind.name(), "region unchanged");
            return Ok(false);
        }
        self.tracker
            .update_issue(issue, &IssueUpdate::description(updated))?;
        debug!(issue, region = kind.name(), "region written");
        Ok(true)
    }

    pub fn load_record<T: DeserializeOwned>(
        &self,
        issue: &str,
        kind: RegionKind,
    ) -> ProdstatResult<Option<T>> {
        match self.read_region(issue, kind)? {
            Some(body) => decode_record(&body, issue).map(Some),
            None => Ok(None),
        }
    }

    pub fn save_record<T: Serialize>(
        &self,
        issue: &str,
        kind: RegionKind,
        record: &T,
    ) -> ProdstatResult<bool> {
        let body = encode_record(record)?;
        self.write_region_text(issue, kind, &body)
    }

    pub fn load_workflow(&self, issue: &str) -> ProdstatResult<Option<WorkflowIssue>> {
        self.load_record(issue, RegionKind::Workflow)
    }

    pub fn save_workflow(&self, issue: &str, record: &WorkflowIssue) -> ProdstatResult<bool> {
        self.save_record(issue, RegionKind::Workflow, record)
    }

    pub fn load_step(&self, issue: &str) -> ProdstatResult<Option<StepIssue>> {
        self.load_record(issue, RegionKind::Step)
    }

    pub fn save_step(&self, issue: &str, record: &StepIssue) -> ProdstatResult<bool> {
        self.save_record(issue, RegionKind::Step, record)
    }

    pub fn load_campaign(&self, issue: &str) -> ProdstatResult<Option<CampaignIssue>> {
        self.load_record(issue, RegionKind::Campaign)
    }

    pub fn save_campaign(&self, issue: &str, record: &CampaignIssue) -> ProdstatResult<bool> {
        record.ensure_unique_step_names()?;
        self.save_record(issue, RegionKind::Campaign, record)
    }

    /// Creates a ticket and stores `record` in its description.
    pub fn create_with_record<T: Serialize>(
        &self,
        project: &str,
        summary: &str,
        kind: RegionKind,
        record: &T,
    ) -> ProdstatResult<String> {
        let description = upsert_region("", kind, &encode_record(record)?);
        let key = self
            .tracker
            .create_issue(&NewIssue::task(project, summary, &description))?;
        debug!(issue = %key, summary, "ticket created");
        Ok(key)
    }

    /// First ticket whose summary matches exactly.
    pub fn find_by_summary(&self, project: &str, summary: &str) -> ProdstatResult<Option<String>> {
        let mut matches = self.tracker.find_issues_by_summary(project, summary)?;
        if matches.len() > 1 {
            warn!(
                project,
                summary,
                count = matches.len(),
                "several tickets share a summary; using the first"
            );
        }
        matches.sort_by(|left, right| compare_issue_keys(&left.key, &right.key));
        Ok(matches.into_iter().next().map(|issue| issue.key))
    }

    pub fn link_related(&self, inward: &str, outward: &str) -> ProdstatResult<()> {
        self.tracker.link_issues(RELATES_LINK_TYPE, inward, outward)
    }
}

/// Orders `DRP-9` before `DRP-10`.
fn compare_issue_keys(left: &str, right: &str) -> std::cmp::Ordering {
    fn split(key: &str) -> (&str, u64) {
        key.rsplit_once('-')
            .and_then(|(project, number)| number.parse().ok().map(|number| (project, number)))
            .unwrap_or((key, 0))
    }
    split(left).cmp(&split(right))
}

#[cfg(test)]
mod tests {
    use prodstat_tracker::InMemoryTracker;
    use prodstat_types::{CampaignStep, ProdstatError, WorkflowLink};

    use super::*;

    #[test]
    fn functional_save_and_load_step_keeps_operator_notes() {
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("DRP-2", "Step step1 of dp0", "Operator notes: rerun tract 3828.");
        let store = HierarchyStore::new(&tracker);

        let mut step = StepIssue {
            name: "step1".to_string(),
            issue: Some("DRP-2".to_string()),
            ..StepIssue::default()
        };
        step.workflows.insert(
            "step1_a".to_string(),
            WorkflowLink {
                name: "step1_a".to_string(),
                ..WorkflowLink::default()
            },
        );
        assert!(store.save_step("DRP-2", &step).expect("save"));
        assert!(!store.save_step("DRP-2", &step).expect("save again"));

        let description = tracker.get_issue("DRP-2").expect("issue").description;
        assert!(description.starts_with("Operator notes: rerun tract 3828.\n\n"));
        assert_eq!(store.load_step("DRP-2").expect("load"), Some(step));
    }

    #[test]
    fn unit_load_returns_none_without_region() {
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("DRP-3", "plain", "nothing managed here");
        let store = HierarchyStore::new(&tracker);
        assert_eq!(store.load_workflow("DRP-3").expect("load"), None);
    }

    #[test]
    fn regression_save_campaign_rejects_duplicate_steps() {
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("DRP-1", "Campaign dp0", "");
        let store = HierarchyStore::new(&tracker);
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
        let error = store.save_campaign("DRP-1", &campaign).expect_err("duplicate");
        assert!(matches!(error, ProdstatError::InvalidRecord { .. }));
        assert_eq!(tracker.get_issue("DRP-1").expect("issue").description, "");
    }

    #[test]
    fn functional_create_with_record_and_find_by_summary() {
        let tracker = InMemoryTracker::new();
        let store = HierarchyStore::new(&tracker);
        let campaign = CampaignIssue {
            name: "dp0".to_string(),
            ..CampaignIssue::default()
        };
        let key = store
            .create_with_record("DRP", "Campaign dp0", RegionKind::Campaign, &campaign)
            .expect("create");
        assert_eq!(key, "DRP-1");
        assert_eq!(
            store.find_by_summary("DRP", "Campaign dp0").expect("find"),
            Some("DRP-1".to_string())
        );
        assert_eq!(store.find_by_summary("DRP", "Campaign dp1").expect("find"), None);
        assert_eq!(store.load_campaign("DRP-1").expect("load"), Some(campaign));
    }

    #[test]
    fn unit_find_by_summary_prefers_lowest_key() {
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("DRP-10", "Campaign dp0", "");
        tracker.seed_issue("DRP-9", "Campaign dp0", "");
        let store = HierarchyStore::new(&tracker);
        assert_eq!(
            store.find_by_summary("DRP", "Campaign dp0").expect("find"),
            Some("DRP-9".to_string())
        );
    }

    #[test]
    fn regression_unavailable_tracker_surfaces_error() {
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("DRP-2", "step", "");
        tracker.set_unavailable(true);
        let store = HierarchyStore::new(&tracker);
        let error = store.load_step("DRP-2").expect_err("unavailable");
        assert_eq!(error.exit_code(), 6);
    }
}
