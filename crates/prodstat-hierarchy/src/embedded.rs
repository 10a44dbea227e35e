//! Managed regions embedded in free-text ticket descriptions.
//!
//! A region looks like
//!
//! ```text
//! {anchor:prodstat-step-begin}
//! {code:json}
//! { ...record... }
//! {code}
//! {anchor:prodstat-step-end}
//! ```
//!
//! Anchor macros render as nothing in Jira, so only the payload is visible.
//! Text outside the markers belongs to humans and is never rewritten.

use prodstat_types::{ProdstatError, ProdstatResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

pub const REGION_MARKER_PREFIX: &str = "{anchor:prodstat-";
pub const REGION_BEGIN_SUFFIX: &str = "-begin}";
pub const REGION_END_SUFFIX: &str = "-end}";
const CODE_FENCE_OPEN: &str = "{code:json}";
const CODE_FENCE_CLOSE: &str = "{code}";
/// `{` as a JSON escape, so marker text inside strings never ends a region.
const ESCAPED_MARKER_PREFIX: &str = "\\u007banchor:prodstat-";

/// Kinds of managed regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Workflow,
    Step,
    Campaign,
    Summary,
    WorkflowStats,
    StepTable,
    CampaignTable,
    SummaryTable,
}

impl RegionKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Step => "step",
            Self::Campaign => "campaign",
            Self::Summary => "summary",
            Self::WorkflowStats => "workflow-stats",
            Self::StepTable => "step-table",
            Self::CampaignTable => "campaign-table",
            Self::SummaryTable => "summary-table",
        }
    }

    pub fn begin_marker(self) -> String {
        format!("{REGION_MARKER_PREFIX}{}{REGION_BEGIN_SUFFIX}", self.name())
    }

    pub fn end_marker(self) -> String {
        format!("{REGION_MARKER_PREFIX}{}{REGION_END_SUFFIX}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RegionSpan {
    start: usize,
    body_start: usize,
    body_end: usize,
    end: usize,
}

/// Locates the first terminated region of `kind`.
///
/// A begin marker without a matching end marker is ignored.
fn find_region(text: &str, kind: RegionKind) -> Option<RegionSpan> {
    let begin = kind.begin_marker();
    let end = kind.end_marker();
    let mut offset = 0;
    while let Some(relative) = text[offset..].find(&begin) {
        let start = offset + relative;
        let body_start = start + begin.len();
        match text[body_start..].find(&end) {
            Some(end_relative) => {
                let body_end = body_start + end_relative;
                return Some(RegionSpan {
                    start,
                    body_start,
                    body_end,
                    end: body_end + end.len(),
                });
            }
            None => {
                warn!(region = kind.name(), "ignoring unterminated managed region");
                offset = body_start;
            }
        }
    }
    None
}

/// Returns the body of the region of `kind`, trimmed of surrounding newlines.
pub fn extract_region(text: &str, kind: RegionKind) -> Option<&str> {
    find_region(text, kind).map(|span| text[span.body_start..span.body_end].trim_matches(['\r', '\n']))
}

fn render_region(kind: RegionKind, body: &str) -> String {
    format!(
        "{}\n{}\n{}",
        kind.begin_marker(),
        body.trim_matches(['\r', '\n']),
        kind.end_marker()
    )
}

fn strip_dangling_begin(text: &str, kind: RegionKind) -> String {
    let begin = kind.begin_marker();
    text.lines()
        .filter(|line| line.trim() != begin)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Replaces the region of `kind` with `body`, or appends a new region.
///
/// Text before and after an existing region is kept byte for byte.
pub fn upsert_region(text: &str, kind: RegionKind, body: &str) -> String {
    let rendered = render_region(kind, body);
    if let Some(span) = find_region(text, kind) {
        return format!("{}{}{}", &text[..span.start], rendered, &text[span.end..]);
    }
    let mut base = if text.contains(&kind.begin_marker()) {
        strip_dangling_begin(text, kind)
    } else {
        text.to_string()
    };
    if base.trim().is_empty() {
        return rendered;
    }
    if !base.ends_with('\n') {
        base.push('\n');
    }
    base.push('\n');
    base.push_str(&rendered);
    base
}

/// Drops the region of `kind`, keeping the surrounding text.
pub fn remove_region(text: &str, kind: RegionKind) -> String {
    match find_region(text, kind) {
        Some(span) => {
            let head = text[..span.start].trim_end_matches('\n');
            let tail = text[span.end..].trim_start_matches('\n');
            match (head.is_empty(), tail.is_empty()) {
                (true, _) => tail.to_string(),
                (false, true) => head.to_string(),
                (false, false) => format!("{head}\n\n{tail}"),
            }
        }
        None => text.to_string(),
    }
}

/// Renders a record as a fenced JSON payload for a region body.
///
/// Marker text can only occur inside JSON strings, where it is escaped.
pub fn encode_record<T: Serialize>(record: &T) -> ProdstatResult<String> {
    let json = serde_json::to_string_pretty(record)?
        .replace(REGION_MARKER_PREFIX, ESCAPED_MARKER_PREFIX);
    Ok(format!("{CODE_FENCE_OPEN}\n{json}\n{CODE_FENCE_CLOSE}"))
}

fn strip_code_fence(body: &str) -> &str {
    let trimmed = body.trim();
    let Some(first_newline) = trimmed.find('\n') else {
        return trimmed;
    };
    let (first_line, rest) = trimmed.split_at(first_newline);
    if !first_line.trim_start().starts_with("{code") {
        return trimmed;
    }
    let rest = rest.trim_end();
    rest.strip_suffix(CODE_FENCE_CLOSE).unwrap_or(rest).trim()
}

/// Parses a region body into a record.
///
/// JSON is tried first; YAML covers payloads pasted from older tooling.
/// Missing fields take their defaults.
pub fn decode_record<T: DeserializeOwned>(body: &str, location: &str) -> ProdstatResult<T> {
    let payload = strip_code_fence(body);
    let json_error = match serde_json::from_str::<T>(payload) {
        Ok(record) => return Ok(record),
        Err(error) => error,
    };
    serde_yaml::from_str::<T>(payload).map_err(|_| ProdstatError::InvalidRecord {
        kind: std::any::type_name::<T>()
            .rsplit("::")
            .next()
            .unwrap_or("record")
            .to_string(),
        location: location.to_string(),
        reason: json_error.to_string(),
    })
}
