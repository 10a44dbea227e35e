//! Campaign, step and workflow bookkeeping on top of the issue tracker.
//!
//! A campaign ticket lists its steps, a step ticket lists the workflows
//! submitted for it, and each workflow ticket carries the statistics
//! collected for its run. Descriptor files on disk drive reconciliation;
//! the tickets stay the source of truth for anything already recorded.

pub mod descriptor;
pub mod importer;
pub mod reconciler;
pub mod registrar;
pub mod resolver;
pub mod stat_refresh;
pub mod submission;
pub mod templates;

pub use descriptor::{
    load_descriptor, CampaignDescriptor, StepDescriptor, DEFAULT_CAMPAIGN_YAML, DEFAULT_STEPS,
};
pub use importer::{import_map, load_mapping, ImportReport, MapLevel};
pub use reconciler::{
    scan_artifacts, step_map_rows, ReconcileOverrides, ReconcileReport, Reconciler, StepReport,
};
pub use registrar::WorkflowRegistrar;
pub use resolver::{resolve_run, DirectoryRunResolver, ResolvedRun, RunResolver};
pub use stat_refresh::{
    workflow_stat_dir, RefreshOutcome, WorkflowStatRefresh, REFRESH_START_DATE,
};
pub use submission::{
    data_range, monitor_link, run_keywords, SubmissionArtifact, SubmissionPayload,
    MONITOR_TASKS_URL,
};
pub use templates::{make_prod_groups, parse_exposure_list, write_campaign_yaml, GroupRequest};
