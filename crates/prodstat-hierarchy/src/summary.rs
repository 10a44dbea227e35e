//! Shared summary table of every registered workflow run.

use std::collections::BTreeMap;
use std::sync::Mutex;

use prodstat_tracker::{IssueTracker, IssueUpdate};
use prodstat_types::{ProdstatError, ProdstatResult, StatusCounts, SummaryKey, SummaryRow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::embedded::{decode_record, encode_record, extract_region, upsert_region, RegionKind};
use crate::store::HierarchyStore;
use crate::views::{render_step1_table, render_summary_table};

/// Rows keyed by `(production issue, workflow issue)`; one row per key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryTable {
    rows: BTreeMap<SummaryKey, SummaryRow>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct SummaryPayload {
    rows: Vec<SummaryRow>,
}

impl SummaryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from rows; a later row replaces an earlier one with the same key.
    pub fn from_rows(rows: impl IntoIterator<Item = SummaryRow>) -> Self {
        let mut table = Self::new();
        for row in rows {
            table.upsert_row(row.key(), row);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &SummaryKey) -> Option<&SummaryRow> {
        self.rows.get(key)
    }

    pub fn rows(&self) -> impl Iterator<Item = &SummaryRow> {
        self.rows.values()
    }

    /// Inserts or replaces the row for `key`. The row's key fields are
    /// forced to `key`. Returns the replaced row.
    pub fn upsert_row(&mut self, key: SummaryKey, mut row: SummaryRow) -> Option<SummaryRow> {
        row.production_issue = key.production_issue.clone();
        row.workflow_issue = key.workflow_issue.clone();
        self.rows.insert(key, row)
    }

    pub fn delete_row(&mut self, key: &SummaryKey) -> Option<SummaryRow> {
        self.rows.remove(key)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    fn to_payload(&self) -> SummaryPayload {
        SummaryPayload {
            rows: self.rows.values().cloned().collect(),
        }
    }
}

/// Persistence seam for the summary table.
pub trait SummaryStore {
    fn load_rows(&self) -> ProdstatResult<SummaryTable>;
    fn save_rows(&self, table: &SummaryTable) -> ProdstatResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemorySummaryStore {
    table: Mutex<SummaryTable>,
}

impl InMemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SummaryTable {
        self.table
            .lock()
            .map(|table| table.clone())
            .unwrap_or_default()
    }
}

impl SummaryStore for InMemorySummaryStore {
    fn load_rows(&self) -> ProdstatResult<SummaryTable> {
        self.table
            .lock()
            .map(|table| table.clone())
            .map_err(|_| ProdstatError::InvalidInput("summary store lock poisoned".to_string()))
    }

    fn save_rows(&self, table: &SummaryTable) -> ProdstatResult<()> {
        let mut guard = self
            .table
            .lock()
            .map_err(|_| ProdstatError::InvalidInput("summary store lock poisoned".to_string()))?;
        *guard = table.clone();
        Ok(())
    }
}

/// Tickets that show rendered copies of the summary table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryViews {
    pub all_rows_issue: String,
    pub step1_issue: Option<String>,
    /// Base URL for issue links, e.g. `https://jira.example.org/browse/`.
    pub browse_base: String,
}

/// Summary table kept in the `summary` region of one backend ticket.
pub struct TrackerSummaryStore<'a> {
    tracker: &'a dyn IssueTracker,
    backend_issue: String,
    views: Option<SummaryViews>,
}

impl<'a> TrackerSummaryStore<'a> {
    pub fn new(tracker: &'a dyn IssueTracker, backend_issue: impl Into<String>) -> Self {
        Self {
            tracker,
            backend_issue: backend_issue.into(),
            views: None,
        }
    }

    pub fn with_views(mut self, views: SummaryViews) -> Self {
        self.views = Some(views);
        self
    }

    fn write_views(&self, table: &SummaryTable) -> ProdstatResult<()> {
        let Some(views) = &self.views else {
            return Ok(());
        };
        let store = HierarchyStore::new(self.tracker);
        store.write_region_text(
            &views.all_rows_issue,
            RegionKind::SummaryTable,
            &render_summary_table(table, &views.browse_base),
        )?;
        if let Some(step1_issue) = &views.step1_issue {
            store.write_region_text(
                step1_issue,
                RegionKind::SummaryTable,
                &render_step1_table(table, &views.browse_base),
            )?;
        }
        Ok(())
    }
}

impl SummaryStore for TrackerSummaryStore<'_> {
    fn load_rows(&self) -> ProdstatResult<SummaryTable> {
        let backend = self.tracker.get_issue(&self.backend_issue)?;
        if let Some(body) = extract_region(&backend.description, RegionKind::Summary) {
            let payload: SummaryPayload = decode_record(body, &self.backend_issue)?;
            return Ok(SummaryTable::from_rows(payload.rows));
        }
        if let Some(table) = parse_legacy_summary(&backend.description) {
            info!(
                issue = %self.backend_issue,
                rows = table.len(),
                "migrating legacy summary table"
            );
            return Ok(table);
        }
        if !backend.description.trim().is_empty() {
            debug!(issue = %self.backend_issue, "backend has no summary region yet");
        }
        Ok(SummaryTable::new())
    }

    fn save_rows(&self, table: &SummaryTable) -> ProdstatResult<()> {
        let backend = self.tracker.get_issue(&self.backend_issue)?;
        let base = if extract_region(&backend.description, RegionKind::Summary).is_none()
            && parse_legacy_summary(&backend.description).is_some()
        {
            String::new()
        } else {
            backend.description.clone()
        };
        let updated = upsert_region(&base, RegionKind::Summary, &encode_record(&table.to_payload())?);
        if updated != backend.description {
            self.tracker
                .update_issue(&self.backend_issue, &IssueUpdate::description(updated))?;
        }
        self.write_views(table)
    }
}

/// Reads the old bare-JSON backend format:
/// `{"PISSUE#TS": [pissue, jissue, [T,Q,D,Fa,Sf], link, what], ...}`.
fn parse_legacy_summary(description: &str) -> Option<SummaryTable> {
    let trimmed = description.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let entries: BTreeMap<String, serde_json::Value> = serde_json::from_str(trimmed).ok()?;
    let mut rows = Vec::new();
    for (legacy_key, value) in entries {
        let Some(fields) = value.as_array() else {
            warn!(key = %legacy_key, "skipping legacy summary entry that is not a list");
            continue;
        };
        let text = |index: usize| {
            fields
                .get(index)
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let status: Vec<u64> = fields
            .get(2)
            .and_then(|value| value.as_array())
            .map(|values| values.iter().map(|value| value.as_u64().unwrap_or(0)).collect())
            .unwrap_or_default();
        let count = |index: usize| status.get(index).copied().unwrap_or(0);
        let link = text(3);
        rows.push(SummaryRow {
            production_issue: text(0),
            workflow_issue: text(1),
            timestamp: legacy_key
                .split_once('#')
                .map(|(_, timestamp)| timestamp.to_string())
                .filter(|timestamp| !timestamp.is_empty()),
            counts: StatusCounts {
                n_tasks: count(0),
                n_files: count(1),
                n_finished: count(2),
                n_failed: count(3),
                n_sub_finished: count(4),
            },
            monitor_link: (!link.is_empty()).then_some(link),
            description: text(4),
        });
    }
    Some(SummaryTable::from_rows(rows))
}

/// Summary table operations driven by workflow ticket records.
pub struct SummaryTableManager<'a> {
    store: &'a dyn SummaryStore,
    hierarchy: HierarchyStore<'a>,
}

impl<'a> SummaryTableManager<'a> {
    pub fn new(store: &'a dyn SummaryStore, tracker: &'a dyn IssueTracker) -> Self {
        Self {
            store,
            hierarchy: HierarchyStore::new(tracker),
        }
    }

    /// Adds or refreshes the row for `workflow` under `production`.
    ///
    /// Row content comes from the workflow record; `counts` overrides the
    /// recorded progress counters.
    pub fn upsert(
        &self,
        production: &str,
        workflow: &str,
        counts: Option<StatusCounts>,
    ) -> ProdstatResult<SummaryRow> {
        let record = self
            .hierarchy
            .load_workflow(workflow)?
            .ok_or_else(|| ProdstatError::InvalidRecord {
                kind: "workflow".to_string(),
                location: workflow.to_string(),
                reason: "ticket carries no workflow record".to_string(),
            })?;
        let what = record
            .step_name
            .clone()
            .unwrap_or_else(|| record.name.clone());
        let row = SummaryRow {
            production_issue: production.to_string(),
            workflow_issue: workflow.to_string(),
            timestamp: record.timestamp.as_ref().map(|timestamp| timestamp.to_string()),
            counts: counts.unwrap_or_else(|| record.status_counts()),
            monitor_link: record.monitor_link.clone(),
            description: format!("{what}{}", record.data_range.as_deref().unwrap_or("()")),
        };

        let mut table = self.store.load_rows()?;
        let key = SummaryKey::new(production, workflow);
        let replaced = table.upsert_row(key.clone(), row.clone());
        self.store.save_rows(&table)?;
        info!(
            key = %key,
            replaced = replaced.is_some(),
            rows = table.len(),
            "summary row written"
        );
        Ok(row)
    }

    /// Removes the row for the pair. Returns false when there was none.
    pub fn remove(&self, production: &str, workflow: &str) -> ProdstatResult<bool> {
        let mut table = self.store.load_rows()?;
        let key = SummaryKey::new(production, workflow);
        if table.delete_row(&key).is_none() {
            info!(key = %key, "summary row already absent");
            return Ok(false);
        }
        self.store.save_rows(&table)?;
        info!(key = %key, rows = table.len(), "summary row removed");
        Ok(true)
    }

    /// Erases the whole table.
    pub fn reset(&self) -> ProdstatResult<()> {
        warn!("erasing the summary table");
        self.store.save_rows(&SummaryTable::new())
    }
}
