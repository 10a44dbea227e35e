//! Run timestamp resolution by scanning submission directories.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use prodstat_types::{ProdstatError, ProdstatResult, RunTimestamp};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::submission::SubmissionArtifact;

const SUBMIT_DIR: &str = "submit";

/// A run directory matched to a submission artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRun {
    pub timestamp: RunTimestamp,
    pub run_dir: PathBuf,
}

/// Finds the run a submission artifact produced for a production issue.
pub trait RunResolver {
    fn resolve(
        &self,
        artifact: &Path,
        production_issue: &str,
        explicit: Option<&str>,
    ) -> ProdstatResult<ResolvedRun>;
}

/// Where a submission artifact's runs live.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SearchScope {
    /// `submit/<expanded output>`, or the whole submit tree as a fallback.
    root: PathBuf,
    /// Prefix stripped before matching the issue key against run paths.
    submit: PathBuf,
    /// True when `root` came from the artifact's `output` key.
    by_output: bool,
}

/// Scans `<artifact dir>/submit/<output>/` for timestamp-named run
/// directories. Artifacts without a usable `output` fall back to the whole
/// submit tree (or the artifact directory), where only runs holding a copy of
/// the artifact count.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryRunResolver;

impl DirectoryRunResolver {
    fn search_scope(artifact: &Path) -> SearchScope {
        let parent = artifact
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let submit = parent.join(SUBMIT_DIR);
        let output = SubmissionArtifact::load(artifact)
            .ok()
            .and_then(|submission| submission.expanded_output())
            .map(|output| output.trim().trim_matches('/').to_string())
            .filter(|output| !output.is_empty());
        if let Some(output) = output {
            let root = submit.join(&output);
            if root.is_dir() {
                return SearchScope {
                    root,
                    submit,
                    by_output: true,
                };
            }
            debug!(root = %root.display(), "output directory missing, scanning submit tree");
        }
        let root = if submit.is_dir() {
            submit.clone()
        } else {
            parent.to_path_buf()
        };
        SearchScope {
            root,
            submit,
            by_output: false,
        }
    }

    /// Every run directory in the artifact's scope that references
    /// `production_issue`, keyed by timestamp. The first directory in path
    /// order wins when two carry the same timestamp.
    pub fn candidates(
        &self,
        artifact: &Path,
        production_issue: &str,
    ) -> BTreeMap<RunTimestamp, PathBuf> {
        Self::scan(&Self::search_scope(artifact), artifact, production_issue)
    }

    fn scan(
        scope: &SearchScope,
        artifact: &Path,
        production_issue: &str,
    ) -> BTreeMap<RunTimestamp, PathBuf> {
        let basename = artifact.file_name();
        let mut walker = WalkDir::new(&scope.root).min_depth(1).sort_by_file_name();
        if scope.by_output {
            walker = walker.max_depth(1);
        }
        let mut found = BTreeMap::new();
        for entry in walker.into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let Ok(timestamp) = RunTimestamp::parse(&name) else {
                continue;
            };
            let path = entry.path();
            // The key in a shared path only identifies the run when the path
            // is this artifact's own output.
            let by_path = scope.by_output && {
                let relative = path.strip_prefix(&scope.submit).unwrap_or(path);
                relative.to_string_lossy().contains(production_issue)
            };
            let by_copy = basename.is_some_and(|basename| {
                std::fs::read_to_string(path.join(basename))
                    .is_ok_and(|copy| copy.contains(production_issue))
            });
            if by_path || by_copy {
                debug!(run_dir = %path.display(), %timestamp, "run candidate");
                found.entry(timestamp).or_insert_with(|| path.to_path_buf());
            }
        }
        found
    }
}

impl RunResolver for DirectoryRunResolver {
    fn resolve(
        &self,
        artifact: &Path,
        production_issue: &str,
        explicit: Option<&str>,
    ) -> ProdstatResult<ResolvedRun> {
        let scope = Self::search_scope(artifact);
        let root = &scope.root;
        let mut candidates = Self::scan(&scope, artifact, production_issue);
        if candidates.is_empty() {
            return Err(ProdstatError::NoRunFound {
                search_root: root.display().to_string(),
                production_issue: production_issue.to_string(),
            });
        }

        let explicit = explicit.map(str::trim).filter(|raw| !raw.is_empty());
        let (timestamp, run_dir) = match explicit {
            Some(requested) => {
                let matched = RunTimestamp::parse(requested)
                    .ok()
                    .and_then(|timestamp| candidates.remove_entry(&timestamp));
                matched.ok_or_else(|| ProdstatError::AmbiguousRun {
                    search_root: root.display().to_string(),
                    production_issue: production_issue.to_string(),
                    requested: requested.to_string(),
                    candidates: candidates
                        .keys()
                        .map(RunTimestamp::as_str)
                        .collect::<Vec<_>>()
                        .join(", "),
                })?
            }
            None => candidates.pop_last().ok_or_else(|| ProdstatError::NoRunFound {
                search_root: root.display().to_string(),
                production_issue: production_issue.to_string(),
            })?,
        };
        info!(
            artifact = %artifact.display(),
            production_issue,
            %timestamp,
            "run resolved"
        );
        Ok(ResolvedRun { timestamp, run_dir })
    }
}

/// Resolves with the directory scan.
pub fn resolve_run(
    artifact: &Path,
    production_issue: &str,
    explicit: Option<&str>,
) -> ProdstatResult<ResolvedRun> {
    DirectoryRunResolver.resolve(artifact, production_issue, explicit)
}
