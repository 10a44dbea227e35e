//! Hierarchy state stored inside tracker ticket descriptions.
//!
//! Campaign, step and workflow records live in managed regions of their
//! tickets; the shared summary table lives on a backend ticket and is
//! mirrored into view tickets as wiki tables.

pub mod embedded;
mod store;
pub mod summary;
pub mod views;

pub use embedded::{
    decode_record, encode_record, extract_region, remove_region, upsert_region, RegionKind,
};
pub use store::HierarchyStore;
pub use summary::{
    InMemorySummaryStore, SummaryStore, SummaryTable, SummaryTableManager, SummaryViews,
    TrackerSummaryStore,
};
pub use views::{
    render_campaign_table, render_step1_table, render_step_map_table, render_summary_table,
    render_workflow_stats, status_color, StepMapRow,
};
