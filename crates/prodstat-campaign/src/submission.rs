//! Submission artifacts (BPS submit YAML) and the run directories they produce.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use prodstat_types::{ProdstatError, ProdstatResult, RunTimestamp};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use tracing::debug;

pub const MONITOR_TASKS_URL: &str = "https://panda-doma.cern.ch/tasks/";
const QGRAPH_LOG: &str = "quantumGraphGeneration.out";
const CONFIG_SUFFIX: &str = "_config.yaml";

/// Reads any YAML scalar as text so numeric values (`campaign: 2022`) load.
fn scalar_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_yaml::Value::String(text)) => Some(text),
        Some(serde_yaml::Value::Number(number)) => Some(number.to_string()),
        Some(serde_yaml::Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubmissionPayload {
    #[serde(rename = "payloadName", deserialize_with = "scalar_text")]
    pub payload_name: Option<String>,
    #[serde(rename = "butlerConfig", deserialize_with = "scalar_text")]
    pub butler_config: Option<String>,
    #[serde(rename = "dataQuery", deserialize_with = "scalar_text")]
    pub data_query: Option<String>,
    #[serde(rename = "inCollection", deserialize_with = "scalar_text")]
    pub in_collection: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub sw_image: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub output: Option<String>,
}

/// The keys of a submit file that end up on the workflow ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubmissionArtifact {
    #[serde(deserialize_with = "scalar_text")]
    pub campaign: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub project: Option<String>,
    #[serde(rename = "pipelineYaml", deserialize_with = "scalar_text")]
    pub pipeline_yaml: Option<String>,
    #[serde(rename = "extraQgraphOptions", deserialize_with = "scalar_text")]
    pub extra_qgraph_options: Option<String>,
    pub payload: SubmissionPayload,
}

impl SubmissionArtifact {
    pub fn load(path: &Path) -> ProdstatResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| ProdstatError::file(path.display(), error))?;
        Self::parse(&raw, &path.display().to_string())
    }

    pub fn parse(raw: &str, location: &str) -> ProdstatResult<Self> {
        serde_yaml::from_str(raw).map_err(|error| ProdstatError::InvalidRecord {
            kind: "submission".to_string(),
            location: location.to_string(),
            reason: error.to_string(),
        })
    }

    /// Step part of `pipelineYaml` (`.../DRP.yaml#step1` -> `step1`).
    pub fn step_name(&self) -> Option<String> {
        self.pipeline_yaml
            .as_deref()
            .and_then(|pipeline| pipeline.split_once('#'))
            .map(|(_, step)| step.trim().to_string())
            .filter(|step| !step.is_empty())
            .or_else(|| self.payload.payload_name.clone())
    }

    /// Flat keyword map using the submit file's own key names.
    pub fn keywords(&self) -> BTreeMap<String, String> {
        let fields = [
            ("campaign", &self.campaign),
            ("project", &self.project),
            ("pipelineYaml", &self.pipeline_yaml),
            ("extraQgraphOptions", &self.extra_qgraph_options),
            ("payloadName", &self.payload.payload_name),
            ("butlerConfig", &self.payload.butler_config),
            ("dataQuery", &self.payload.data_query),
            ("inCollection", &self.payload.in_collection),
            ("sw_image", &self.payload.sw_image),
            ("output", &self.payload.output),
        ];
        fields
            .into_iter()
            .filter_map(|(key, value)| value.clone().map(|value| (key.to_string(), value)))
            .collect()
    }

    /// `output` with `{keyword}` placeholders filled in from the other keys.
    pub fn expanded_output(&self) -> Option<String> {
        let output = self.payload.output.as_deref()?;
        Some(substitute_keywords(output, &self.keywords()))
    }

    pub fn data_range(&self) -> String {
        self.payload
            .data_query
            .as_deref()
            .map(data_range)
            .unwrap_or_else(|| "()".to_string())
    }
}

fn substitute_keywords(template: &str, keywords: &BTreeMap<String, String>) -> String {
    keywords
        .iter()
        .fold(template.to_string(), |text, (key, value)| {
            text.replace(&format!("{{{key}}}"), value)
        })
}

#[derive(Debug, Clone, Copy)]
enum RangeShape {
    Verbatim,
    Single,
    Pair,
    DetectorPair,
}

fn range_patterns() -> &'static [(RangeShape, Regex)] {
    static PATTERNS: OnceLock<Vec<(RangeShape, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (RangeShape::Verbatim, r"tract in (.*)"),
            (RangeShape::Single, r"tract *= *([0-9]+)"),
            (RangeShape::Pair, r"tract *>= *([0-9]+) and tract *<= *([0-9]+)"),
            (RangeShape::Pair, r"exposure *>= *([0-9]+) and exposure *<= *([0-9]+)"),
            (RangeShape::Pair, r"visit *>= *([0-9]+) and visit *<= *([0-9]+)"),
            (
                RangeShape::DetectorPair,
                r"detector *>= *([0-9]+).*exposure *>= *([0-9]+) and exposure *<= *([0-9]+)",
            ),
        ]
        .into_iter()
        .filter_map(|(shape, pattern)| Regex::new(pattern).ok().map(|regex| (shape, regex)))
        .collect()
    })
}

fn number(text: &str) -> String {
    text.trim()
        .parse::<u64>()
        .map(|value| value.to_string())
        .unwrap_or_else(|_| text.trim().to_string())
}

/// Short description of the tract/exposure/visit range a data query selects.
///
/// Lines are scanned in order and the last matching pattern wins; `()` when
/// nothing matches.
pub fn data_range(query: &str) -> String {
    let mut range = "()".to_string();
    for line in query.lines() {
        for (shape, regex) in range_patterns() {
            let Some(captures) = regex.captures(line) else {
                continue;
            };
            let group = |index: usize| captures.get(index).map_or("", |found| found.as_str());
            range = match shape {
                RangeShape::Verbatim => group(1).trim().to_string(),
                RangeShape::Single => format!("({})", number(group(1))),
                RangeShape::Pair => format!("({},{})", number(group(1)), number(group(2))),
                RangeShape::DetectorPair => format!(
                    "({},{})d{}",
                    number(group(2)),
                    number(group(3)),
                    number(group(1))
                ),
            };
        }
    }
    range
}

/// Monitor task listing for one run, starting on the first of its month.
pub fn monitor_link(timestamp: &RunTimestamp) -> String {
    let raw = timestamp.as_str();
    format!(
        "{MONITOR_TASKS_URL}?taskname=*{}*&date_from=01-{}-{}&days=62&sortby=time-ascending",
        timestamp.to_lowercase(),
        &raw[4..6],
        &raw[..4],
    )
}

/// Extra keywords found in a run directory: selected keys of the expanded
/// submit config and the quantum graph size.
pub fn run_keywords(run_dir: &Path) -> BTreeMap<String, String> {
    let mut keywords = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(run_dir) else {
        return keywords;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if name.ends_with(CONFIG_SUFFIX) {
            config_keywords(&path, &mut keywords);
        } else if name.ends_with(".qgraph") {
            if let Ok(metadata) = entry.metadata() {
                keywords.insert(
                    "qgraphsize".to_string(),
                    format!("{:.1}MB", metadata.len() as f64 / 1.0e6),
                );
            }
        } else if name == QGRAPH_LOG {
            qgraph_keywords(&path, &mut keywords);
        }
    }
    keywords
}

fn config_keywords(path: &Path, keywords: &mut BTreeMap<String, String>) {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return;
    };
    let document: serde_yaml::Value = match serde_yaml::from_str(&raw) {
        Ok(document) => document,
        Err(error) => {
            debug!(path = %path.display(), %error, "expanded submit config unreadable");
            return;
        }
    };
    let wanted: [(&str, &[&str]); 5] = [
        ("operator", &["bps_defined", "operator"]),
        ("uniqProcName", &["bps_defined", "uniqProcName"]),
        ("queue", &["executionButler", "queue"]),
        ("computeSite", &["computeSite"]),
        ("cluster", &["cluster"]),
    ];
    for (name, keys) in wanted {
        let value = keys
            .iter()
            .try_fold(&document, |node, key| node.get(*key));
        let text = match value {
            Some(serde_yaml::Value::String(text)) => text.clone(),
            Some(serde_yaml::Value::Number(number)) => number.to_string(),
            Some(other @ serde_yaml::Value::Mapping(_)) => {
                serde_json::to_string(other).unwrap_or_default()
            }
            _ => continue,
        };
        keywords.insert(name.to_string(), text);
    }
}

fn qgraph_keywords(path: &Path, keywords: &mut BTreeMap<String, String>) {
    static QUANTA: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(regex) =
        QUANTA.get_or_init(|| Regex::new(r"QuantumGraph contains (\d+) quanta for (\d+) task").ok())
    else {
        return;
    };
    let Ok(log) = std::fs::read_to_string(path) else {
        return;
    };
    if let Some(captures) = regex.captures(&log) {
        keywords.insert("nTotalQuanta".to_string(), captures[1].to_string());
        keywords.insert("nTotalPanDATasks".to_string(), captures[2].to_string());
    }
}
