//! Execution statistics from the data catalog and the workload monitor.
//!
//! Aggregations are incremental: every run (catalog collection or monitor
//! workflow) contributes one entry to a checkpoint, and totals are folded from
//! the checkpoint, so overlapping request windows never count a run twice.

pub mod aggregate;
pub mod catalog;
pub mod monitor;
pub mod render;
pub mod request;
pub mod timing;

pub use aggregate::{
    select_collections, AggregationReport, RunStats, StatAggregator, StatCheckpoint, StatSource,
    CHECKPOINT_SCHEMA_VERSION,
};
pub use catalog::{CatalogSource, FsCatalog, RecordMetrics};
pub use monitor::{
    InMemoryMonitor, MonitorJob, MonitorSource, MonitorTask, MonitorWorkflow, PandaClient,
    DEFAULT_MONITOR_URL,
};
pub use render::{format_duration, stat_table, workflow_status_table, write_reports, StatTable};
pub use request::{load_request, AggregationRequest, DateWindow, TimingRequest, DEFAULT_MAX_TASK};
pub use timing::{plot_timing, prepare_timing, SeriesUpdate, TimingSample, TimingSeries};
