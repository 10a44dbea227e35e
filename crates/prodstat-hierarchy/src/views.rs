//! Jira wiki tables rendered into view regions.

use prodstat_types::{CampaignIssue, StatBlock, StatusCounts, WorkflowIssue, TOTAL_ROW_LABEL};

use crate::summary::SummaryTable;

pub const SUMMARY_HEADER: &str = "||Date||PREOPS||STATS||(T,Q,D,Fa,Sf)||PANDA||DESCRIP||";
pub const STEP_MAP_HEADER: &str = "||BPS_yaml||Issue||(T,Q,D,Fa,Sf)||DESCRIP||timestamp||";
pub const CAMPAIGN_HEADER: &str = "||Step||Issue||Start||End||Core-hr||Status||";

const SUMMARY_DESCRIPTION_WIDTH: usize = 28;
const STEP1_DESCRIPTION_WIDTH: usize = 25;

/// Text colour for a `(T,Q,D,Fa,Sf)` cell. Later rules win.
pub fn status_color(counts: &StatusCounts) -> &'static str {
    let mut color = "black";
    if counts.n_failed > 0 {
        color = "red";
    }
    if counts.n_tasks == counts.n_finished + counts.n_sub_finished {
        color = "black";
    }
    if counts.n_tasks == counts.n_finished {
        color = "green";
    }
    if counts.n_failed == 0 && counts.n_files == 0 {
        color = "blue";
    }
    if counts.n_tasks > counts.n_finished + counts.n_failed + counts.n_sub_finished {
        color = "blue";
    }
    color
}

fn colored_counts(counts: &StatusCounts) -> String {
    format!("{{color:{}}}{}{{color}}", status_color(counts), counts.tuple_label())
}

fn issue_link(issue: &str, browse_base: &str) -> String {
    format!("[{issue}|{}{issue}]", browse_base)
}

fn truncate(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}

/// `YYYYMMDDTHHMMSSZ` -> `YYYY-MM-DD`.
fn short_date(timestamp: Option<&str>) -> String {
    match timestamp {
        Some(ts) if ts.len() >= 8 && ts.is_char_boundary(8) => {
            format!("{}-{}-{}", &ts[0..4], &ts[4..6], &ts[6..8])
        }
        _ => "unknown".to_string(),
    }
}

fn summary_rows_newest_first(table: &SummaryTable) -> Vec<&prodstat_types::SummaryRow> {
    let mut rows: Vec<_> = table.rows().collect();
    rows.sort_by(|left, right| {
        (&right.production_issue, &right.timestamp, &right.workflow_issue).cmp(&(
            &left.production_issue,
            &left.timestamp,
            &left.workflow_issue,
        ))
    });
    rows
}

fn render_summary_rows<'r>(
    rows: impl Iterator<Item = &'r prodstat_types::SummaryRow>,
    browse_base: &str,
    width: usize,
) -> String {
    let mut out = String::from(SUMMARY_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&format!(
            "| {} | {} | {}|{}| [pDa|{}] |{}|\n",
            short_date(row.timestamp.as_deref()),
            issue_link(&row.production_issue, browse_base),
            row.workflow_issue,
            colored_counts(&row.counts),
            row.monitor_link.as_deref().unwrap_or_default(),
            truncate(&row.description, width),
        ));
    }
    out
}

/// Every summary row, newest first.
pub fn render_summary_table(table: &SummaryTable, browse_base: &str) -> String {
    render_summary_rows(
        summary_rows_newest_first(table).into_iter(),
        browse_base,
        SUMMARY_DESCRIPTION_WIDTH,
    )
}

/// Only rows whose description names step 1.
pub fn render_step1_table(table: &SummaryTable, browse_base: &str) -> String {
    render_summary_rows(
        summary_rows_newest_first(table)
            .into_iter()
            .filter(|row| row.description.starts_with("step1")),
        browse_base,
        STEP1_DESCRIPTION_WIDTH,
    )
}

/// One line of a step's artifact-to-ticket table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepMapRow {
    pub artifact: String,
    pub issue: String,
    pub counts: StatusCounts,
    pub description: String,
    pub timestamp: Option<String>,
}

pub fn render_step_map_table(rows: &[StepMapRow], browse_base: &str) -> String {
    let mut out = String::from(STEP_MAP_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&format!(
            "| {}| {} | {} | {}|{}| \n",
            row.artifact,
            issue_link(&row.issue, browse_base),
            colored_counts(&row.counts),
            truncate(&row.description, SUMMARY_DESCRIPTION_WIDTH),
            row.timestamp.as_deref().unwrap_or("0"),
        ));
    }
    out
}

/// Step rollups of a campaign, in campaign order.
pub fn render_campaign_table(campaign: &CampaignIssue, browse_base: &str) -> String {
    let mut out = String::from(CAMPAIGN_HEADER);
    out.push('\n');
    for step in &campaign.steps {
        let issue = step
            .issue
            .as_deref()
            .map(|issue| issue_link(issue, browse_base))
            .unwrap_or_default();
        let core_hours = step
            .rollup
            .core_hours
            .map(|hours| format!("{hours}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "| {}| {} | {}|{}|{}|{}| \n",
            step.name,
            issue,
            step.rollup.start_date.as_deref().unwrap_or_default(),
            step.rollup.end_date.as_deref().unwrap_or_default(),
            core_hours,
            step.rollup.state.as_deref().unwrap_or_default(),
        ));
    }
    out
}

fn render_stat_block(title: &str, block: &StatBlock, out: &mut String) {
    out.push_str(&format!("h4. {title}\n"));
    out.push_str("||Task||nQuanta||CPU sec/task||CPU hours||Max RSS GB||Parallelism||\n");
    let total = block.total();
    let total_label = TOTAL_ROW_LABEL.to_string();
    for (name, stats) in block.tasks.iter().chain(std::iter::once((&total_label, &total))) {
        out.push_str(&format!(
            "|{}|{}|{:.2}|{:.2}|{:.2}|{}|\n",
            name,
            stats.n_tasks,
            stats.cpu_seconds_per_task(),
            stats.cpu_hours(),
            stats.max_rss_gb,
            stats.parallelism(),
        ));
    }
    if block.malformed_records > 0 {
        out.push_str(&format!("_{} unreadable records skipped_\n", block.malformed_records));
    }
}

/// Human-readable state and statistics of one workflow.
pub fn render_workflow_stats(record: &WorkflowIssue) -> String {
    let mut out = format!("*State:* {}\n", record.state);
    if let Some(progress) = &record.progress {
        out.push_str(&format!(
            "*Progress:* {} (T,Q,D,Fa,Sf) {} remaining {} processed {}\n",
            progress.status,
            colored_counts(&progress.counts),
            progress.remaining_files,
            progress.processed_files,
        ));
    }
    if let Some(link) = &record.monitor_link {
        out.push_str(&format!("*PanDA:* [link|{link}]\n"));
    }
    if let Some(block) = &record.catalog_stats {
        render_stat_block("Butler statistics", block, &mut out);
    }
    if let Some(block) = &record.monitor_stats {
        render_stat_block("PanDA statistics", block, &mut out);
    }
    out
}
