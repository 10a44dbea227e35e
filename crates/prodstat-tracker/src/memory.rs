use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use prodstat_types::{ProdstatError, ProdstatResult};

use crate::{
    project_of_key, IssueTracker, IssueUpdate, NewIssue, TrackerAttachment, TrackerComment,
    TrackerIssue,
};

/// In-memory tracker for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    issues: BTreeMap<String, StoredIssue>,
    next_number: BTreeMap<String, u64>,
    next_comment_id: u64,
    next_attachment_id: u64,
    links: BTreeSet<(String, String, String)>,
    unavailable: bool,
    create_calls: u64,
}

#[derive(Debug)]
struct StoredIssue {
    issue: TrackerIssue,
    comments: Vec<TrackerComment>,
    attachments: Vec<(TrackerAttachment, Vec<u8>)>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ProdstatResult<MutexGuard<'_, TrackerInner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| ProdstatError::tracker_unavailable("in-memory tracker lock poisoned"))?;
        if inner.unavailable {
            return Err(ProdstatError::tracker_unavailable(
                "in-memory tracker marked unavailable",
            ));
        }
        Ok(inner)
    }

    /// Inserts a pre-existing ticket, such as a production issue.
    pub fn seed_issue(&self, key: &str, summary: &str, description: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            let project = project_of_key(key).to_string();
            if let Some(number) = key
                .rsplit_once('-')
                .and_then(|(_, number)| number.parse::<u64>().ok())
            {
                let next = inner.next_number.entry(project.clone()).or_insert(0);
                *next = (*next).max(number);
            }
            inner.issues.insert(
                key.to_string(),
                StoredIssue {
                    issue: TrackerIssue {
                        key: key.to_string(),
                        project,
                        summary: summary.to_string(),
                        description: description.to_string(),
                    },
                    comments: Vec::new(),
                    attachments: Vec::new(),
                },
            );
        }
    }

    /// Simulates an unreachable tracker for every subsequent call.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    pub fn issue_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.issues.len())
            .unwrap_or_default()
    }

    pub fn create_calls(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.create_calls)
            .unwrap_or_default()
    }

    /// All links as `(type, inward, outward)`.
    pub fn links(&self) -> Vec<(String, String, String)> {
        self.inner
            .lock()
            .map(|inner| inner.links.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn attachment_content(&self, key: &str, filename: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().ok()?;
        inner.issues.get(key).and_then(|stored| {
            stored
                .attachments
                .iter()
                .find(|(attachment, _)| attachment.filename == filename)
                .map(|(_, content)| content.clone())
        })
    }
}

fn stored_mut<'a>(inner: &'a mut TrackerInner, key: &str) -> ProdstatResult<&'a mut StoredIssue> {
    inner
        .issues
        .get_mut(key)
        .ok_or_else(|| ProdstatError::IssueNotFound(key.to_string()))
}

impl IssueTracker for InMemoryTracker {
    fn get_issue(&self, key: &str) -> ProdstatResult<TrackerIssue> {
        let inner = self.lock()?;
        inner
            .issues
            .get(key)
            .map(|stored| stored.issue.clone())
            .ok_or_else(|| ProdstatError::IssueNotFound(key.to_string()))
    }

    fn find_issues_by_summary(
        &self,
        project: &str,
        summary: &str,
    ) -> ProdstatResult<Vec<TrackerIssue>> {
        let inner = self.lock()?;
        Ok(inner
            .issues
            .values()
            .filter(|stored| stored.issue.project == project && stored.issue.summary == summary)
            .map(|stored| stored.issue.clone())
            .collect())
    }

    fn create_issue(&self, issue: &NewIssue) -> ProdstatResult<String> {
        let mut inner = self.lock()?;
        inner.create_calls += 1;
        let number = {
            let next = inner.next_number.entry(issue.project.clone()).or_insert(0);
            *next += 1;
            *next
        };
        let key = format!("{}-{number}", issue.project);
        inner.issues.insert(
            key.clone(),
            StoredIssue {
                issue: TrackerIssue {
                    key: key.clone(),
                    project: issue.project.clone(),
                    summary: issue.summary.clone(),
                    description: issue.description.clone(),
                },
                comments: Vec::new(),
                attachments: Vec::new(),
            },
        );
        Ok(key)
    }

    fn update_issue(&self, key: &str, update: &IssueUpdate) -> ProdstatResult<()> {
        let mut inner = self.lock()?;
        let stored = stored_mut(&mut inner, key)?;
        if let Some(summary) = &update.summary {
            stored.issue.summary = summary.clone();
        }
        if let Some(description) = &update.description {
            stored.issue.description = description.clone();
        }
        Ok(())
    }

    fn list_comments(&self, key: &str) -> ProdstatResult<Vec<TrackerComment>> {
        let mut inner = self.lock()?;
        Ok(stored_mut(&mut inner, key)?.comments.clone())
    }

    fn add_comment(&self, key: &str, body: &str) -> ProdstatResult<String> {
        let mut inner = self.lock()?;
        inner.next_comment_id += 1;
        let id = inner.next_comment_id.to_string();
        stored_mut(&mut inner, key)?.comments.push(TrackerComment {
            id: id.clone(),
            body: body.to_string(),
        });
        Ok(id)
    }

    fn update_comment(&self, key: &str, comment_id: &str, body: &str) -> ProdstatResult<()> {
        let mut inner = self.lock()?;
        let stored = stored_mut(&mut inner, key)?;
        let comment = stored
            .comments
            .iter_mut()
            .find(|comment| comment.id == comment_id)
            .ok_or_else(|| ProdstatError::TrackerRejected {
                operation: "update comment".to_string(),
                status: 404,
                body: format!("comment {comment_id} not found on {key}"),
            })?;
        comment.body = body.to_string();
        Ok(())
    }

    fn list_attachments(&self, key: &str) -> ProdstatResult<Vec<TrackerAttachment>> {
        let mut inner = self.lock()?;
        Ok(stored_mut(&mut inner, key)?
            .attachments
            .iter()
            .map(|(attachment, _)| attachment.clone())
            .collect())
    }

    fn add_attachment(&self, key: &str, filename: &str, content: &[u8]) -> ProdstatResult<()> {
        let mut inner = self.lock()?;
        inner.next_attachment_id += 1;
        let id = inner.next_attachment_id.to_string();
        stored_mut(&mut inner, key)?.attachments.push((
            TrackerAttachment {
                id,
                filename: filename.to_string(),
            },
            content.to_vec(),
        ));
        Ok(())
    }

    fn delete_attachment(&self, attachment_id: &str) -> ProdstatResult<()> {
        let mut inner = self.lock()?;
        for stored in inner.issues.values_mut() {
            stored
                .attachments
                .retain(|(attachment, _)| attachment.id != attachment_id);
        }
        Ok(())
    }

    fn link_issues(&self, link_type: &str, inward: &str, outward: &str) -> ProdstatResult<()> {
        let mut inner = self.lock()?;
        for key in [inward, outward] {
            if !inner.issues.contains_key(key) {
                return Err(ProdstatError::IssueNotFound(key.to_string()));
            }
        }
        inner.links.insert((
            link_type.to_string(),
            inward.to_string(),
            outward.to_string(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_create_issue_numbers_after_seeded_keys() {
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("DRP-7", "existing", "");
        let key = tracker
            .create_issue(&NewIssue::task("DRP", "new", "body"))
            .expect("create");
        assert_eq!(key, "DRP-8");
        assert_eq!(tracker.create_calls(), 1);
    }

    #[test]
    fn functional_find_by_summary_matches_exactly_within_project() {
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("DRP-1", "Campaign dp0", "");
        tracker.seed_issue("DRP-2", "Campaign dp0.1", "");
        tracker.seed_issue("OPS-1", "Campaign dp0", "");
        let found = tracker
            .find_issues_by_summary("DRP", "Campaign dp0")
            .expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "DRP-1");
    }

    #[test]
    fn functional_links_are_deduplicated() {
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("DRP-1", "a", "");
        tracker.seed_issue("DRP-2", "b", "");
        tracker.link_issues("Relates", "DRP-1", "DRP-2").expect("link");
        tracker.link_issues("Relates", "DRP-1", "DRP-2").expect("link again");
        assert_eq!(tracker.links().len(), 1);
        let error = tracker
            .link_issues("Relates", "DRP-1", "DRP-9")
            .expect_err("missing target");
        assert!(matches!(error, ProdstatError::IssueNotFound(_)));
    }

    #[test]
    fn unit_update_issue_keeps_unset_fields() {
        let tracker = InMemoryTracker::new();
        tracker.seed_issue("DRP-1", "summary", "old");
        tracker
            .update_issue("DRP-1", &IssueUpdate::description("new"))
            .expect("update");
        let issue = tracker.get_issue("DRP-1").expect("issue");
        assert_eq!(issue.summary, "summary");
        assert_eq!(issue.description, "new");
    }
}
