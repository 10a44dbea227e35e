//! Shared data model for the prodstat campaign tracker.
//!
//! Records in this crate are what gets embedded in tracker tickets: every
//! field defaults when absent so older or hand-edited payloads still load.

mod error;
mod records;
mod stats;
mod timestamp;

pub use error::{Diagnostic, DiagnosticKind, ProdstatError, ProdstatResult};
pub use records::{
    is_new_workflow_sentinel, CampaignIssue, CampaignStep, Rollup, StepIssue, SummaryKey,
    SummaryRow, WorkflowIssue, WorkflowLink, WorkflowProgress, WorkflowState,
    NEW_WORKFLOW_SENTINEL,
};
pub use stats::{StatBlock, StatSourceKind, StatusCounts, TaskStats, TOTAL_ROW_LABEL};
pub use timestamp::RunTimestamp;
