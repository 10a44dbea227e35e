//! Issue tracker abstraction, in-memory backend and Jira REST client.
//!
//! Everything above this crate talks to the tracker through [`IssueTracker`];
//! tests use [`InMemoryTracker`], the binary uses [`JiraClient`].

mod credentials;
mod jira_client;
mod memory;
pub mod report;

use prodstat_types::{ProdstatError, ProdstatResult};
use serde::{Deserialize, Serialize};

pub use credentials::{lookup_netrc, JiraCredentials, DEFAULT_NETRC_MACHINE};
pub use jira_client::JiraClient;
pub use memory::InMemoryTracker;
pub use report::{
    publish_report, replace_attachment, upsert_comment, CommentReport, ReportOutcome, ReportRequest,
};

/// Link type used between workflow, step and campaign tickets.
pub const RELATES_LINK_TYPE: &str = "Relates";

/// Ticket content as seen by prodstat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub key: String,
    pub project: String,
    pub summary: String,
    pub description: String,
}

/// Fields of a ticket to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssue {
    pub project: String,
    pub summary: String,
    pub description: String,
    pub issue_type: String,
}

impl NewIssue {
    pub fn task(project: &str, summary: &str, description: &str) -> Self {
        Self {
            project: project.to_string(),
            summary: summary.to_string(),
            description: description.to_string(),
            issue_type: "Task".to_string(),
        }
    }
}

/// Partial ticket update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueUpdate {
    pub summary: Option<String>,
    pub description: Option<String>,
}

impl IssueUpdate {
    pub fn description(description: impl Into<String>) -> Self {
        Self {
            summary: None,
            description: Some(description.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerComment {
    pub id: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerAttachment {
    pub id: String,
    pub filename: String,
}

/// Synchronous tracker contract used by every prodstat component.
///
/// Implementations never retry; a failed call surfaces to the operator.
pub trait IssueTracker {
    fn get_issue(&self, key: &str) -> ProdstatResult<TrackerIssue>;

    /// Tickets in `project` whose summary equals `summary` exactly.
    fn find_issues_by_summary(&self, project: &str, summary: &str)
        -> ProdstatResult<Vec<TrackerIssue>>;

    /// Creates a ticket and returns its key.
    fn create_issue(&self, issue: &NewIssue) -> ProdstatResult<String>;

    fn update_issue(&self, key: &str, update: &IssueUpdate) -> ProdstatResult<()>;

    fn list_comments(&self, key: &str) -> ProdstatResult<Vec<TrackerComment>>;

    fn add_comment(&self, key: &str, body: &str) -> ProdstatResult<String>;

    fn update_comment(&self, key: &str, comment_id: &str, body: &str) -> ProdstatResult<()>;

    fn list_attachments(&self, key: &str) -> ProdstatResult<Vec<TrackerAttachment>>;

    fn add_attachment(&self, key: &str, filename: &str, content: &[u8]) -> ProdstatResult<()>;

    fn delete_attachment(&self, attachment_id: &str) -> ProdstatResult<()>;

    /// Links two tickets; linking an already linked pair is a no-op.
    fn link_issues(&self, link_type: &str, inward: &str, outward: &str) -> ProdstatResult<()>;

    fn issue_exists(&self, key: &str) -> ProdstatResult<bool> {
        match self.get_issue(key) {
            Ok(_) => Ok(true),
            Err(ProdstatError::IssueNotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }
}

/// Project part of an issue key (`DRP-12` -> `DRP`).
pub fn project_of_key(key: &str) -> &str {
    key.rsplit_once('-').map(|(project, _)| project).unwrap_or(key)
}
