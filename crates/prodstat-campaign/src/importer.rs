//! Operator mapping files applied to step and campaign tickets.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use prodstat_hierarchy::{render_campaign_table, render_step_map_table, HierarchyStore, RegionKind};
use prodstat_types::{Diagnostic, DiagnosticKind, ProdstatError, ProdstatResult, Rollup};
use serde_yaml::Value;
use tracing::{info, warn};

use crate::reconciler::step_map_rows;

/// Which table a mapping file describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapLevel {
    /// `artifact: DRP-123`
    #[default]
    Step,
    /// `step: [issue, start, end, core-hours, state]`
    Campaign,
}

impl MapLevel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Campaign => "campaign",
        }
    }
}

impl fmt::Display for MapLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub target: String,
    pub level: MapLevel,
    pub applied: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn load_mapping(path: &Path) -> ProdstatResult<BTreeMap<String, Value>> {
    let raw =
        std::fs::read_to_string(path).map_err(|error| ProdstatError::file(path.display(), error))?;
    serde_yaml::from_str(&raw).map_err(|error| ProdstatError::InvalidRecord {
        kind: "mapping".to_string(),
        location: path.display().to_string(),
        reason: error.to_string(),
    })
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn hours(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn shape_mismatch(key: &str, target: &str, expected: &str) -> Diagnostic {
    Diagnostic::new(
        DiagnosticKind::UnknownMappingKey,
        key,
        format!("value for '{key}' on {target} is not {expected}"),
    )
}

fn unknown_key(key: &str, target: &str) -> Diagnostic {
    Diagnostic::from_error(
        key,
        &ProdstatError::UnknownMappingKey {
            key: key.to_string(),
            target: target.to_string(),
        },
    )
}

fn missing_record(kind: &str, target: &str) -> ProdstatError {
    ProdstatError::InvalidRecord {
        kind: kind.to_string(),
        location: target.to_string(),
        reason: format!("ticket carries no {kind} record"),
    }
}

/// Applies `mapping` to the record on `target` and re-renders its table.
///
/// Entries naming artifacts or steps the target does not know, or whose
/// value has the wrong shape, are reported and skipped.
pub fn import_map(
    hierarchy: &HierarchyStore<'_>,
    mapping: &BTreeMap<String, Value>,
    target: &str,
    level: MapLevel,
    browse_base: &str,
) -> ProdstatResult<ImportReport> {
    let mut report = ImportReport {
        target: target.to_string(),
        level,
        applied: Vec::new(),
        diagnostics: Vec::new(),
    };
    match level {
        MapLevel::Step => {
            let mut step = hierarchy
                .load_step(target)?
                .ok_or_else(|| missing_record("step", target))?;
            for (artifact, value) in mapping {
                let Some(link) = step.workflows.get_mut(artifact) else {
                    report.diagnostics.push(unknown_key(artifact, target));
                    continue;
                };
                let Some(issue) = text(value) else {
                    report
                        .diagnostics
                        .push(shape_mismatch(artifact, target, "an issue key"));
                    continue;
                };
                link.issue = Some(issue);
                report.applied.push(artifact.clone());
            }
            hierarchy.save_step(target, &step)?;
            let rows = step_map_rows(hierarchy, &step)?;
            hierarchy.write_region_text(
                target,
                RegionKind::StepTable,
                &render_step_map_table(&rows, browse_base),
            )?;
        }
        MapLevel::Campaign => {
            let mut campaign = hierarchy
                .load_campaign(target)?
                .ok_or_else(|| missing_record("campaign", target))?;
            for (step_name, value) in mapping {
                let Some(step) = campaign.step_mut(step_name) else {
                    report.diagnostics.push(unknown_key(step_name, target));
                    continue;
                };
                let fields = match value {
                    Value::Sequence(fields) if fields.len() == 5 => fields,
                    _ => {
                        report.diagnostics.push(shape_mismatch(
                            step_name,
                            target,
                            "[issue, start, end, core-hours, state]",
                        ));
                        continue;
                    }
                };
                let Some(issue) = text(&fields[0]) else {
                    report
                        .diagnostics
                        .push(shape_mismatch(step_name, target, "led by an issue key"));
                    continue;
                };
                step.issue = Some(issue);
                step.rollup = Rollup {
                    start_date: text(&fields[1]),
                    end_date: text(&fields[2]),
                    core_hours: hours(&fields[3]),
                    state: text(&fields[4]),
                };
                report.applied.push(step_name.clone());
            }
            hierarchy.save_campaign(target, &campaign)?;
            hierarchy.write_region_text(
                target,
                RegionKind::CampaignTable,
                &render_campaign_table(&campaign, browse_base),
            )?;
        }
    }
    for diagnostic in &report.diagnostics {
        warn!(issue = target, key = %diagnostic.subject, "mapping entry skipped");
    }
    info!(
        issue = target,
        level = %level,
        applied = report.applied.len(),
        skipped = report.diagnostics.len(),
        "mapping imported"
    );
    Ok(report)
}
