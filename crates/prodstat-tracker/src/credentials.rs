use std::path::Path;

use prodstat_types::{ProdstatError, ProdstatResult};

/// netrc machine name holding the tracker login.
pub const DEFAULT_NETRC_MACHINE: &str = "lsstjira";

/// Basic-auth credentials for the Jira REST api.
#[derive(Clone, PartialEq, Eq)]
pub struct JiraCredentials {
    pub user: String,
    pub token: String,
}

impl std::fmt::Debug for JiraCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JiraCredentials")
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Reads `login`/`password` for `machine` from a netrc file.
///
/// Returns `Ok(None)` when the file has no entry for the machine and no
/// `default` entry either.
pub fn lookup_netrc(path: &Path, machine: &str) -> ProdstatResult<Option<JiraCredentials>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|error| ProdstatError::file(path.display(), error))?;
    Ok(parse_netrc(&raw, machine))
}

type NetrcEntry = (bool, Option<String>, Option<String>);

fn finish_entry(
    entry: Option<NetrcEntry>,
    matched: &mut Option<JiraCredentials>,
    fallback: &mut Option<JiraCredentials>,
) {
    if let Some((is_match, Some(user), Some(token))) = entry {
        let credentials = JiraCredentials { user, token };
        if is_match {
            matched.get_or_insert(credentials);
        } else {
            fallback.get_or_insert(credentials);
        }
    }
}

fn parse_netrc(raw: &str, machine: &str) -> Option<JiraCredentials> {
    let mut matched = None;
    let mut fallback = None;
    let mut current: Option<NetrcEntry> = None;
    let mut tokens = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(str::split_whitespace);

    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                finish_entry(current.take(), &mut matched, &mut fallback);
                let name = tokens.next().unwrap_or_default();
                current = Some((name == machine, None, None));
            }
            "default" => {
                finish_entry(current.take(), &mut matched, &mut fallback);
                current = Some((false, None, None));
            }
            "login" => {
                if let Some(entry) = current.as_mut() {
                    entry.1 = tokens.next().map(str::to_string);
                }
            }
            "password" => {
                if let Some(entry) = current.as_mut() {
                    entry.2 = tokens.next().map(str::to_string);
                }
            }
            _ => {}
        }
    }
    finish_entry(current.take(), &mut matched, &mut fallback);
    matched.or(fallback)
}
