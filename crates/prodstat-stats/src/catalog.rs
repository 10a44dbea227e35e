//! Data catalog access: collections, per-task metadata records and their timing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use prodstat_types::{ProdstatError, ProdstatResult, RunTimestamp};
use serde_yaml::Value;
use walkdir::WalkDir;

const METADATA_SUFFIX: &str = "_metadata";
const CATALOG_SOURCE: &str = "catalog";
const KIB_PER_GB: f64 = 1_048_576.0;

/// Timing values extracted from one task metadata record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordMetrics {
    pub cpu_seconds: Option<f64>,
    pub max_rss_kib: Option<f64>,
    /// Start time as `YYYY-MM-DD HH:MM:SS`.
    pub start: Option<String>,
}

impl RecordMetrics {
    pub fn max_rss_gb(&self) -> Option<f64> {
        self.max_rss_kib.map(|kib| kib / KIB_PER_GB)
    }
}

/// Read-only view of the data catalog.
pub trait CatalogSource {
    /// Every collection name known to the catalog.
    fn list_collections(&self) -> ProdstatResult<Vec<String>>;

    /// Metadata record identifiers of `collection`, grouped by task type.
    fn task_records(&self, collection: &str) -> ProdstatResult<BTreeMap<String, Vec<String>>>;

    /// Reads one record; unreadable content is `MalformedRecord`.
    fn read_record(&self, collection: &str, record: &str) -> ProdstatResult<RecordMetrics>;
}

/// Catalog laid out on disk as
/// `<root>/<collection path ending in a run timestamp>/<task>_metadata/<record>.yaml`.
#[derive(Debug, Clone)]
pub struct FsCatalog {
    root: PathBuf,
}

impl FsCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        collection
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

impl CatalogSource for FsCatalog {
    fn list_collections(&self) -> ProdstatResult<Vec<String>> {
        if !self.root.is_dir() {
            return Err(ProdstatError::source_unavailable(
                CATALOG_SOURCE,
                format!("catalog root {} is not a directory", self.root.display()),
            ));
        }
        let mut collections = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|error| {
                ProdstatError::source_unavailable(CATALOG_SOURCE, format!("listing failed: {error}"))
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !RunTimestamp::is_valid(&name) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let collection = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            collections.push(collection);
        }
        collections.sort();
        Ok(collections)
    }

    fn task_records(&self, collection: &str) -> ProdstatResult<BTreeMap<String, Vec<String>>> {
        let dir = self.collection_dir(collection);
        let entries = std::fs::read_dir(&dir).map_err(|error| {
            ProdstatError::source_unavailable(
                CATALOG_SOURCE,
                format!("cannot list {}: {error}", dir.display()),
            )
        })?;
        let mut tasks = BTreeMap::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(task) = name.strip_suffix(METADATA_SUFFIX) else {
                continue;
            };
            if !entry.path().is_dir() {
                continue;
            }
            let mut records: Vec<String> = WalkDir::new(entry.path())
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|record| record.file_type().is_file())
                .map(|record| record.file_name().to_string_lossy().into_owned())
                .filter(|record| record.ends_with(".yaml") || record.ends_with(".yml"))
                .map(|record| format!("{name}/{record}"))
                .collect();
            records.sort();
            tasks.insert(task.to_string(), records);
        }
        Ok(tasks)
    }

    fn read_record(&self, collection: &str, record: &str) -> ProdstatResult<RecordMetrics> {
        let path = self.collection_dir(collection).join(record);
        let raw = std::fs::read_to_string(&path).map_err(|error| ProdstatError::MalformedRecord {
            record: path.display().to_string(),
            reason: error.to_string(),
        })?;
        parse_metadata(&raw).map_err(|reason| ProdstatError::MalformedRecord {
            record: path.display().to_string(),
            reason,
        })
    }
}

#[derive(Debug, Default)]
struct MetadataScan {
    start_cpu: Option<f64>,
    end_cpu: Option<f64>,
    max_rss: Option<f64>,
    start: Option<String>,
}

fn numbers(value: &Value) -> Vec<f64> {
    match value {
        Value::Number(number) => number.as_f64().into_iter().collect(),
        Value::String(text) => text.trim().parse::<f64>().ok().into_iter().collect(),
        Value::Sequence(items) => items.iter().flat_map(numbers).collect(),
        _ => Vec::new(),
    }
}

fn first_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Sequence(items) => items.iter().find_map(first_text),
        _ => None,
    }
}

fn keep_min(slot: &mut Option<f64>, values: &[f64]) {
    for value in values {
        *slot = Some(slot.map_or(*value, |current| current.min(*value)));
    }
}

fn keep_max(slot: &mut Option<f64>, values: &[f64]) {
    for value in values {
        *slot = Some(slot.map_or(*value, |current| current.max(*value)));
    }
}

impl MetadataScan {
    fn visit(&mut self, value: &Value) {
        match value {
            Value::Mapping(mapping) => {
                for (key, child) in mapping {
                    if let Some(key) = key.as_str() {
                        self.visit_field(key, child);
                    }
                    self.visit(child);
                }
            }
            Value::Sequence(items) => items.iter().for_each(|item| self.visit(item)),
            Value::Tagged(tagged) => self.visit(&tagged.value),
            _ => {}
        }
    }

    fn visit_field(&mut self, key: &str, value: &Value) {
        match key {
            "StartCpuTime" | "startCpuTime" => keep_min(&mut self.start_cpu, &numbers(value)),
            "EndCpuTime" | "endCpuTime" => keep_max(&mut self.end_cpu, &numbers(value)),
            "MaxResidentSetSize" | "maxResidentSetSize" => {
                keep_max(&mut self.max_rss, &numbers(value))
            }
            "startUtc" | "prepUtc" => {
                if let Some(text) = first_text(value) {
                    let normalized = normalize_timestamp(&text);
                    if self.start.as_ref().map_or(true, |current| &normalized < current) {
                        self.start = Some(normalized);
                    }
                }
            }
            _ => {}
        }
    }
}

/// `2022-01-27T20:50:42.123+00:00` -> `2022-01-27 20:50:42`.
pub fn normalize_timestamp(raw: &str) -> String {
    let replaced = raw.trim().replacen('T', " ", 1);
    let head = replaced.split('.').next().unwrap_or_default();
    head.chars().take(19).collect()
}

/// Extracts CPU time, peak memory and start time from a metadata document.
///
/// Key names vary between pipeline versions and values may be scalars or
/// per-method lists, so the whole document is scanned.
pub fn parse_metadata(raw: &str) -> Result<RecordMetrics, String> {
    let document: Value = serde_yaml::from_str(raw).map_err(|error| error.to_string())?;
    if !matches!(document, Value::Mapping(_)) {
        return Err("metadata document is not a mapping".to_string());
    }
    let mut scan = MetadataScan::default();
    scan.visit(&document);
    let cpu_seconds = match (scan.start_cpu, scan.end_cpu) {
        (Some(start), Some(end)) => Some((end - start).max(0.0)),
        (None, Some(end)) => Some(end),
        _ => None,
    };
    if cpu_seconds.is_none() && scan.max_rss.is_none() {
        return Err("no cpu time or memory fields".to_string());
    }
    Ok(RecordMetrics {
        cpu_seconds,
        max_rss_kib: scan.max_rss,
        start: scan.start,
    })
}
