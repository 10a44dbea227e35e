use std::path::PathBuf;

use anyhow::{Context, Result};
use prodstat_tracker::{lookup_netrc, JiraClient, JiraCredentials};
use prodstat_types::ProdstatError;
use tracing::debug;

use crate::cli_args::TrackerArgs;

fn netrc_path(args: &TrackerArgs) -> Option<PathBuf> {
    args.netrc_file
        .clone()
        .or_else(|| dirs::home_dir().map(|home| home.join(".netrc")))
}

/// Explicit user and token win; otherwise the netrc entry for the
/// configured machine is used.
pub(crate) fn resolve_credentials(args: &TrackerArgs) -> Result<JiraCredentials> {
    if let (Some(user), Some(token)) = (&args.jira_user, &args.jira_token) {
        return Ok(JiraCredentials {
            user: user.clone(),
            token: token.clone(),
        });
    }
    let missing = |location: String| {
        ProdstatError::tracker_unavailable(format!(
            "no credentials: set PRODSTAT_JIRA_USER and PRODSTAT_JIRA_TOKEN or add machine '{}' to {location}",
            args.netrc_machine
        ))
    };
    let Some(path) = netrc_path(args).filter(|path| path.is_file()) else {
        return Err(missing("~/.netrc".to_string()).into());
    };
    debug!(path = %path.display(), machine = %args.netrc_machine, "reading netrc");
    let credentials = lookup_netrc(&path, &args.netrc_machine)
        .with_context(|| format!("failed to read credentials from {}", path.display()))?;
    credentials.ok_or_else(|| missing(path.display().to_string()).into())
}

pub(crate) fn connect_tracker(args: &TrackerArgs, request_timeout_ms: u64) -> Result<JiraClient> {
    let credentials = resolve_credentials(args)?;
    let client = JiraClient::new(&args.jira_url, credentials, request_timeout_ms)?;
    Ok(client)
}

/// Prefix turning an issue key into a browse URL.
pub(crate) fn browse_base(args: &TrackerArgs) -> String {
    format!("{}/browse/", args.jira_url.trim_end_matches('/'))
}
