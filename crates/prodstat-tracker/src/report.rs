//! Publishing locally rendered reports as ticket comments and attachments.

use std::path::{Path, PathBuf};

use prodstat_types::{ProdstatError, ProdstatResult};
use serde::Deserialize;
use tracing::info;

use crate::IssueTracker;

/// Reporting request file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportRequest {
    #[serde(default)]
    pub project: String,
    /// Ticket receiving the report.
    #[serde(rename = "Jira")]
    pub issue: String,
    #[serde(default)]
    pub comments: Vec<CommentReport>,
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
}

/// One comment to publish; `tokens` identify the comment it replaces.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommentReport {
    pub file: PathBuf,
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportOutcome {
    pub comments_updated: usize,
    pub comments_added: usize,
    pub attachments_replaced: usize,
}

fn read_text(path: &Path) -> ProdstatResult<String> {
    std::fs::read_to_string(path).map_err(|error| ProdstatError::file(path.display(), error))
}

/// Replaces the first comment holding every token, or adds a new comment.
///
/// An empty token list never matches, so the comment is always appended.
pub fn upsert_comment(
    tracker: &dyn IssueTracker,
    issue: &str,
    tokens: &[String],
    body: &str,
) -> ProdstatResult<bool> {
    if !tokens.is_empty() {
        let existing = tracker.list_comments(issue)?;
        if let Some(comment) = existing
            .iter()
            .find(|comment| tokens.iter().all(|token| comment.body.contains(token.as_str())))
        {
            tracker.update_comment(issue, &comment.id, body)?;
            return Ok(true);
        }
    }
    tracker.add_comment(issue, body)?;
    Ok(false)
}

/// Removes every attachment named `filename`, then uploads `content`.
pub fn replace_attachment(
    tracker: &dyn IssueTracker,
    issue: &str,
    filename: &str,
    content: &[u8],
) -> ProdstatResult<()> {
    for attachment in tracker.list_attachments(issue)? {
        if attachment.filename == filename {
            tracker.delete_attachment(&attachment.id)?;
        }
    }
    tracker.add_attachment(issue, filename, content)
}

pub fn publish_report(
    tracker: &dyn IssueTracker,
    request: &ReportRequest,
) -> ProdstatResult<ReportOutcome> {
    let mut outcome = ReportOutcome::default();
    for comment in &request.comments {
        let body = read_text(&comment.file)?;
        if upsert_comment(tracker, &request.issue, &comment.tokens, &body)? {
            outcome.comments_updated += 1;
        } else {
            outcome.comments_added += 1;
        }
    }
    for path in &request.attachments {
        let content =
            std::fs::read(path).map_err(|error| ProdstatError::file(path.display(), error))?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                ProdstatError::InvalidInput(format!("attachment path {} has no file name", path.display()))
            })?;
        replace_attachment(tracker, &request.issue, filename, &content)?;
        outcome.attachments_replaced += 1;
    }
    info!(
        issue = %request.issue,
        updated = outcome.comments_updated,
        added = outcome.comments_added,
        attachments = outcome.attachments_replaced,
        "report published"
    );
    Ok(outcome)
}
