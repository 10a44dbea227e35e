//! Statistics tables written next to the checkpoint as csv, text, wiki and html.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use prodstat_core::write_text_atomic;
use prodstat_types::{
    ProdstatError, ProdstatResult, StatSourceKind, TaskStats, WorkflowProgress, TOTAL_ROW_LABEL,
};
use tracing::info;

use crate::aggregate::AggregationReport;

const TASK_INDEX: &str = " Workflow Task ";
const WORKFLOW_INDEX: &str = "workflow";
const CATALOG_COLUMNS: [&str; 5] = ["nQuanta", "startTime", "cpu sec/job", "cpu-hours", "MaxRSS GB"];
const MONITOR_COLUMNS: [&str; 6] = [
    "nQuanta",
    "startTime",
    "wallclock",
    "cpu sec/job",
    "cpu-hours",
    "est. parallel jobs",
];
const WORKFLOW_COLUMNS: [&str; 9] = [
    "status",
    "ntasks",
    "nfiles",
    "remaining files",
    "processed files",
    "task_finished",
    "task_failed",
    "task_subfinished",
    "created",
];
const OUTPUT_EXTENSIONS: [&str; 4] = ["csv", "txt", "wiki", "html"];

/// Renders seconds like a Python `timedelta`: `1 day, 2:03:04.500000`.
pub fn format_duration(seconds: f64) -> String {
    let micros = (seconds.max(0.0) * 1_000_000.0).round() as u64;
    let whole = micros / 1_000_000;
    let fraction = micros % 1_000_000;
    let days = whole / 86_400;
    let rest = whole % 86_400;
    let mut out = String::new();
    if days > 0 {
        let _ = write!(out, "{days} day{}, ", if days == 1 { "" } else { "s" });
    }
    let _ = write!(out, "{}:{:02}:{:02}", rest / 3600, rest % 3600 / 60, rest % 60);
    if fraction > 0 {
        let _ = write!(out, ".{fraction:06}");
    }
    out
}

/// A titled table with a row index column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatTable {
    /// File stem, e.g. `catalogStat-PREOPS-938`.
    pub name: String,
    pub comment: String,
    pub index_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<(String, Vec<String>)>,
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

impl StatTable {
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let header: Vec<String> = self.columns.iter().map(|column| csv_field(column)).collect();
        let _ = writeln!(out, ",{}", header.join(","));
        for (index, cells) in &self.rows {
            let cells: Vec<String> = cells.iter().map(|cell| csv_field(cell)).collect();
            let _ = writeln!(out, "{},{}", csv_field(index), cells.join(","));
        }
        out
    }

    /// Fixed-width plain text table.
    pub fn to_text(&self) -> String {
        let mut widths = vec![self.index_name.trim().len()];
        widths.extend(self.columns.iter().map(|column| column.len()));
        for (index, cells) in &self.rows {
            widths[0] = widths[0].max(index.chars().count());
            for (slot, cell) in cells.iter().enumerate() {
                if let Some(width) = widths.get_mut(slot + 1) {
                    *width = (*width).max(cell.chars().count());
                }
            }
        }
        let line = |cells: Vec<&str>| -> String {
            let padded: Vec<String> = cells
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{cell:<width$}", width = *width))
                .collect();
            padded.join("  ").trim_end().to_string()
        };
        let mut out = String::new();
        let mut header = vec![self.index_name.trim()];
        header.extend(self.columns.iter().map(String::as_str));
        let _ = writeln!(out, "{}", line(header));
        let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
        let _ = writeln!(out, "{}", rule.join("  "));
        for (index, cells) in &self.rows {
            let mut row = vec![index.as_str()];
            row.extend(cells.iter().map(String::as_str));
            let _ = writeln!(out, "{}", line(row));
        }
        out
    }

    /// Tracker wiki table preceded by the comment and name lines.
    pub fn to_wiki(&self) -> String {
        let mut out = format!("{}\n{}\n", self.comment, self.name);
        let _ = write!(out, "||{}", self.index_name);
        for column in &self.columns {
            let _ = write!(out, "||{column}");
        }
        out.push_str("||\n");
        for (index, cells) in &self.rows {
            let _ = write!(out, "|{index}");
            for cell in cells {
                let _ = write!(out, "|{cell}");
            }
            out.push_str("|\n");
        }
        out
    }

    pub fn to_html(&self) -> String {
        let mut out = String::from("<table border=\"1\" class=\"dataframe\">\n  <thead>\n    <tr>\n");
        let _ = writeln!(out, "      <th>{}</th>", html_escape(self.index_name.trim()));
        for column in &self.columns {
            let _ = writeln!(out, "      <th>{}</th>", html_escape(column));
        }
        out.push_str("    </tr>\n  </thead>\n  <tbody>\n");
        for (index, cells) in &self.rows {
            out.push_str("    <tr>\n");
            let _ = writeln!(out, "      <th>{}</th>", html_escape(index));
            for cell in cells {
                let _ = writeln!(out, "      <td>{}</td>", html_escape(cell));
            }
            out.push_str("    </tr>\n");
        }
        out.push_str("  </tbody>\n</table>\n");
        out
    }

    /// Writes `<name>.csv`, `.txt`, `.wiki` and `.html` under `dir`.
    pub fn write_all(&self, dir: &Path) -> ProdstatResult<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(OUTPUT_EXTENSIONS.len());
        for extension in OUTPUT_EXTENSIONS {
            let body = match extension {
                "csv" => self.to_csv(),
                "txt" => self.to_text(),
                "wiki" => self.to_wiki(),
                _ => self.to_html(),
            };
            let path = dir.join(format!("{}.{extension}", self.name));
            write_text_atomic(&path, &body).map_err(|error| {
                ProdstatError::file(path.display(), std::io::Error::other(format!("{error:#}")))
            })?;
            written.push(path);
        }
        Ok(written)
    }
}

fn task_cells(source: StatSourceKind, stats: &TaskStats, start: &str) -> Vec<String> {
    match source {
        StatSourceKind::Catalog => vec![
            stats.n_tasks.to_string(),
            start.to_string(),
            format!("{:.2}", stats.cpu_seconds_per_task()),
            format_duration(stats.cpu_seconds),
            format!("{:.2}", stats.max_rss_gb),
        ],
        StatSourceKind::Monitor => vec![
            stats.n_tasks.to_string(),
            start.to_string(),
            format_duration(stats.wall_seconds),
            format!("{:.2}", stats.cpu_seconds_per_task()),
            format_duration(stats.cpu_seconds),
            stats.parallelism().to_string(),
        ],
    }
}

/// Per-task statistics sorted by first start, then the campaign total row
/// stamped with `generated_at`.
pub fn stat_table(report: &AggregationReport, generated_at: NaiveDateTime) -> StatTable {
    let source = report.source;
    let mut tasks: Vec<(&String, &TaskStats)> = report.block.tasks.iter().collect();
    tasks.sort_by(|left, right| {
        let key = |stats: &TaskStats| (stats.first_start.is_none(), stats.first_start.clone());
        key(left.1).cmp(&key(right.1)).then_with(|| left.0.cmp(right.0))
    });
    let mut rows: Vec<(String, Vec<String>)> = tasks
        .into_iter()
        .map(|(name, stats)| {
            let start = stats.first_start.as_deref().unwrap_or_default();
            (name.clone(), task_cells(source, stats, start))
        })
        .collect();
    let generated = generated_at.format("%Y-%m-%d %H:%M:%S").to_string();
    rows.push((
        TOTAL_ROW_LABEL.to_string(),
        task_cells(source, &report.block.total(), &generated),
    ));
    let columns: &[&str] = match source {
        StatSourceKind::Catalog => &CATALOG_COLUMNS,
        StatSourceKind::Monitor => &MONITOR_COLUMNS,
    };
    let comment = match source {
        StatSourceKind::Catalog => format!(" Campaign Butler statistics {}", report.scope),
        StatSourceKind::Monitor => format!(" Panda campaign statistics {}", report.scope),
    };
    StatTable {
        name: format!("{}Stat-{}", source.label(), report.scope),
        comment,
        index_name: TASK_INDEX.to_string(),
        columns: columns.iter().map(|column| column.to_string()).collect(),
        rows,
    }
}

/// Monitor workflow progress per run key, oldest first.
pub fn workflow_status_table(
    scope: &str,
    progress: &BTreeMap<String, WorkflowProgress>,
) -> StatTable {
    let mut runs: Vec<(&String, &WorkflowProgress)> = progress.iter().collect();
    runs.sort_by(|left, right| {
        (&left.1.created_at, left.0).cmp(&(&right.1.created_at, right.0))
    });
    let rows = runs
        .into_iter()
        .map(|(run_key, progress)| {
            let counts = &progress.counts;
            (
                run_key.clone(),
                vec![
                    progress.status.clone(),
                    counts.n_tasks.to_string(),
                    counts.n_files.to_string(),
                    progress.remaining_files.to_string(),
                    progress.processed_files.to_string(),
                    counts.n_finished.to_string(),
                    counts.n_failed.to_string(),
                    counts.n_sub_finished.to_string(),
                    progress.created_at.clone().unwrap_or_default(),
                ],
            )
        })
        .collect();
    StatTable {
        name: format!("monitorWfStat-{scope}"),
        comment: format!(" workflow status {scope}"),
        index_name: WORKFLOW_INDEX.to_string(),
        columns: WORKFLOW_COLUMNS.iter().map(|column| column.to_string()).collect(),
        rows,
    }
}

/// Writes every table derived from `report` next to its checkpoint.
pub fn write_reports(
    dir: &Path,
    report: &AggregationReport,
    generated_at: NaiveDateTime,
) -> ProdstatResult<Vec<PathBuf>> {
    let mut written = stat_table(report, generated_at).write_all(dir)?;
    if report.source == StatSourceKind::Monitor {
        written.extend(workflow_status_table(&report.scope, &report.progress).write_all(dir)?);
    }
    info!(scope = %report.scope, files = written.len(), "statistics tables written");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use prodstat_types::{StatBlock, StatusCounts};

    use super::*;

    fn generated() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2022-02-01 12:00:00", "%Y-%m-%d %H:%M:%S").expect("time")
    }

    fn report(source: StatSourceKind) -> AggregationReport {
        let mut block = StatBlock::new(source);
        block.add_task(
            "calibrate",
            &TaskStats {
                n_tasks: 4,
                cpu_seconds: 400.0,
                wall_seconds: 100.0,
                max_rss_gb: 1.5,
                first_start: Some("2022-01-05 02:00:00".to_string()),
                ..TaskStats::default()
            },
        );
        block.add_task(
            "isr",
            &TaskStats {
                n_tasks: 2,
                cpu_seconds: 90_061.5,
                wall_seconds: 3600.0,
                max_rss_gb: 2.0,
                first_start: Some("2022-01-05 01:00:00".to_string()),
                ..TaskStats::default()
            },
        );
        AggregationReport {
            scope: "PREOPS-1".to_string(),
            source,
            block,
            runs_read: Vec::new(),
            runs_skipped: Vec::new(),
            progress: BTreeMap::new(),
            diagnostics: Vec::new(),
            checkpoint_path: PathBuf::new(),
        }
    }

    #[test]
    fn unit_format_duration_matches_timedelta_text() {
        assert_eq!(format_duration(0.0), "0:00:00");
        assert_eq!(format_duration(3600.0), "1:00:00");
        assert_eq!(format_duration(90_061.5), "1 day, 1:01:01.500000");
        assert_eq!(format_duration(2.0 * 86_400.0 + 59.0), "2 days, 0:00:59");
    }

    #[test]
    fn functional_catalog_table_sorts_by_start_and_ends_with_total() {
        let table = stat_table(&report(StatSourceKind::Catalog), generated());
        assert_eq!(table.name, "catalogStat-PREOPS-1");
        let names: Vec<&str> = table.rows.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["isr", "calibrate", "Campaign"]);
        assert_eq!(
            table.rows[0].1,
            vec!["2", "2022-01-05 01:00:00", "45030.75", "1 day, 1:01:01.500000", "2.00"]
        );
        assert_eq!(table.rows[2].1[0], "6");
        assert_eq!(table.rows[2].1[1], "2022-02-01 12:00:00");
    }

    #[test]
    fn unit_wiki_and_csv_layouts() {
        let table = stat_table(&report(StatSourceKind::Monitor), generated());
        let wiki = table.to_wiki();
        let lines: Vec<&str> = wiki.lines().collect();
        assert_eq!(lines[0], " Panda campaign statistics PREOPS-1");
        assert_eq!(lines[1], "monitorStat-PREOPS-1");
        assert_eq!(
            lines[2],
            "|| Workflow Task ||nQuanta||startTime||wallclock||cpu sec/job||cpu-hours||est. parallel jobs||"
        );
        assert_eq!(lines[4], "|calibrate|4|2022-01-05 02:00:00|0:01:40|100.00|0:06:40|4|");

        let csv = table.to_csv();
        assert!(csv.starts_with(",nQuanta,startTime,wallclock"));
        assert!(csv.contains("\"1 day, 1:01:01.500000\""));
    }

    #[test]
    fn unit_text_table_aligns_columns() {
        let table = workflow_status_table("PREOPS-1", &BTreeMap::from([(
            "20220105t000000z".to_string(),
            WorkflowProgress {
                status: "finished".to_string(),
                created_at: Some("2022-01-05 00:00:00".to_string()),
                counts: StatusCounts {
                    n_tasks: 3,
                    n_files: 120,
                    n_finished: 3,
                    ..StatusCounts::default()
                },
                remaining_files: 0,
                processed_files: 120,
            },
        )]));
        let text = table.to_text();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("workflow          status    ntasks"));
        assert!(lines[1].starts_with("----------------  --------  ------"));
        assert!(lines[2].starts_with("20220105t000000z  finished  3"));
        assert!(table.to_html().contains("<th>20220105t000000z</th>"));
    }

    #[test]
    fn functional_write_reports_emits_monitor_workflow_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let written = write_reports(dir.path(), &report(StatSourceKind::Monitor), generated())
            .expect("write");
        assert_eq!(written.len(), 8);
        assert!(dir.path().join("monitorStat-PREOPS-1.wiki").exists());
        assert!(dir.path().join("monitorWfStat-PREOPS-1.html").exists());

        let written = write_reports(dir.path(), &report(StatSourceKind::Catalog), generated())
            .expect("write");
        assert_eq!(written.len(), 4);
    }
}
