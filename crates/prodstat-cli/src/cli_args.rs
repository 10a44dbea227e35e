use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use prodstat_campaign::{MapLevel, DEFAULT_CAMPAIGN_YAML};
use prodstat_stats::DEFAULT_MONITOR_URL;
use prodstat_tracker::DEFAULT_NETRC_MACHINE;
use prodstat_types::NEW_WORKFLOW_SENTINEL;

pub(crate) const DEFAULT_JIRA_URL: &str = "https://jira.lsstcorp.org";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "prodstat",
    about = "Production campaign bookkeeping on Jira with catalog and monitor statistics",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub tracker: TrackerArgs,

    #[arg(
        long,
        global = true,
        env = "PRODSTAT_MONITOR_URL",
        default_value = DEFAULT_MONITOR_URL,
        help = "Base URL of the workload monitor."
    )]
    pub monitor_url: String,

    #[arg(
        long,
        global = true,
        env = "PRODSTAT_DATA_DIR",
        help = "Directory for checkpoints, tables and timing series. Defaults to the user data directory."
    )]
    pub data_dir: Option<PathBuf>,

    #[arg(
        long = "request-timeout-ms",
        global = true,
        env = "PRODSTAT_REQUEST_TIMEOUT_MS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT_MS,
        value_parser = parse_positive_u64,
        help = "Timeout for every tracker and monitor HTTP request."
    )]
    pub request_timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

/// Tracker connection settings.
#[derive(Debug, Clone, Args)]
pub struct TrackerArgs {
    #[arg(
        long = "jira-url",
        global = true,
        env = "PRODSTAT_JIRA_URL",
        default_value = DEFAULT_JIRA_URL,
        help = "Jira server URL."
    )]
    pub jira_url: String,

    #[arg(
        long = "jira-user",
        global = true,
        env = "PRODSTAT_JIRA_USER",
        help = "Jira user. Read from the netrc file when absent."
    )]
    pub jira_user: Option<String>,

    #[arg(
        long = "jira-token",
        global = true,
        env = "PRODSTAT_JIRA_TOKEN",
        hide_env_values = true,
        help = "Jira API token. Read from the netrc file when absent."
    )]
    pub jira_token: Option<String>,

    #[arg(
        long = "netrc-file",
        global = true,
        env = "PRODSTAT_NETRC",
        help = "netrc file holding tracker credentials. Defaults to ~/.netrc."
    )]
    pub netrc_file: Option<PathBuf>,

    #[arg(
        long = "netrc-machine",
        global = true,
        env = "PRODSTAT_NETRC_MACHINE",
        default_value = DEFAULT_NETRC_MACHINE,
        help = "Machine entry of the netrc file to use."
    )]
    pub netrc_machine: String,

    #[arg(
        long,
        global = true,
        env = "PRODSTAT_JIRA_PROJECT",
        default_value = "DRP",
        help = "Project receiving new workflow, step and campaign tickets."
    )]
    pub project: String,
}

/// Tickets holding the shared job summary.
#[derive(Debug, Clone, Args)]
pub struct SummaryArgs {
    #[arg(
        long = "summary-backend",
        env = "PRODSTAT_SUMMARY_BACKEND",
        default_value = "DRP-54",
        help = "Ticket storing the summary rows."
    )]
    pub backend: String,

    #[arg(
        long = "summary-view",
        env = "PRODSTAT_SUMMARY_VIEW",
        default_value = "DRP-53",
        help = "Ticket showing every summary row."
    )]
    pub all_rows: String,

    #[arg(
        long = "summary-step1-view",
        env = "PRODSTAT_SUMMARY_STEP1_VIEW",
        default_value = "DRP-55",
        help = "Ticket showing step1 summary rows."
    )]
    pub step1: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliMapLevel {
    Step,
    Campaign,
}

impl From<CliMapLevel> for MapLevel {
    fn from(value: CliMapLevel) -> Self {
        match value {
            CliMapLevel::Step => MapLevel::Step,
            CliMapLevel::Campaign => MapLevel::Campaign,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or update the ticket of one submitted workflow.
    UpdateIssue {
        #[arg(help = "Submission file, in the directory the submission was made from.")]
        artifact: PathBuf,
        #[arg(help = "Production issue the workflow belongs to, e.g. PREOPS-938.")]
        production: String,
        #[arg(
            default_value = NEW_WORKFLOW_SENTINEL,
            help = "Workflow ticket to update; DRP0 reuses the ticket with the same summary or creates one."
        )]
        workflow: String,
        #[arg(long, help = "Run timestamp to pick when several runs match.")]
        ts: Option<String>,
    },
    /// Add, refresh or remove a row of the job summary table.
    AddJobToSummary {
        production: String,
        workflow: String,
        #[arg(
            long,
            conflicts_with = "remove",
            help = "Erase the whole table before adding the row."
        )]
        reset: bool,
        #[arg(long, help = "Remove the row of this production and workflow.")]
        remove: bool,
        #[command(flatten)]
        summary: SummaryArgs,
    },
    /// Refresh catalog and monitor statistics on a workflow ticket.
    UpdateStat {
        production: String,
        workflow: String,
        #[arg(
            long,
            env = "PRODSTAT_BUTLER_ROOT",
            help = "Root of the data catalog holding the run collections."
        )]
        butler: PathBuf,
    },
    /// Aggregate task statistics from the data catalog.
    GetCatalogStat {
        param_file: PathBuf,
        #[arg(long, help = "Discard the checkpoint and read every run again.")]
        clean_history: bool,
    },
    /// Aggregate task statistics from the workload monitor.
    GetMonitorStat {
        param_file: PathBuf,
        #[arg(long, help = "Discard the checkpoint and read every run again.")]
        clean_history: bool,
    },
    /// Extend per-job timing series from the workload monitor.
    PrepTimingData { param_file: PathBuf },
    /// Render running-job plots from stored timing series.
    PlotData { param_file: PathBuf },
    /// Publish comments and attachments on a ticket.
    ReportToTracker { param_file: PathBuf },
    /// Reconcile a campaign ticket and its steps with a descriptor file.
    UpdateCampaign {
        campaign_yaml: PathBuf,
        #[arg(long, help = "Campaign ticket to update instead of the one in the file.")]
        campaign_issue: Option<String>,
        #[arg(long, help = "Campaign name overriding the one in the file.")]
        campaign_name: Option<String>,
    },
    /// Reconcile a step ticket with a step descriptor file.
    UpdateStep {
        step_yaml: PathBuf,
        #[arg(long, help = "Step ticket to update instead of the one in the file.")]
        step_issue: Option<String>,
        #[arg(long, help = "Campaign ticket the step belongs to.")]
        campaign_issue: Option<String>,
    },
    /// Apply an operator mapping file to a step or campaign ticket.
    MapSteps {
        map_yaml: PathBuf,
        issue: String,
        #[arg(long, value_enum, default_value = "step")]
        level: CliMapLevel,
    },
    /// Write a campaign descriptor template.
    CreateCampaignYaml {
        name: String,
        #[arg(long, default_value = DEFAULT_CAMPAIGN_YAML)]
        campaign_yaml: PathBuf,
        #[arg(long, help = "Campaign ticket recorded in the template.")]
        campaign_issue: Option<String>,
        #[arg(
            long,
            requires = "campaign_issue",
            help = "Fill the template from the record stored on --campaign-issue."
        )]
        from_tracker: bool,
    },
    /// Split an exposure list into grouped submission files.
    MakeProdGroups {
        template: PathBuf,
        band: String,
        #[arg(value_parser = parse_positive_usize)]
        group_size: usize,
        skip_groups: usize,
        max_groups: usize,
        exposure_list: PathBuf,
        #[arg(long, default_value = ".", help = "Directory receiving the group files.")]
        out_dir: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn unit_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn unit_update_issue_defaults_to_new_workflow_sentinel() {
        let cli = Cli::try_parse_from(["prodstat", "update-issue", "step1.yaml", "PREOPS-1"])
            .expect("parse");
        match cli.command {
            Command::UpdateIssue { workflow, ts, .. } => {
                assert_eq!(workflow, "DRP0");
                assert_eq!(ts, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unit_global_options_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "prodstat",
            "map-steps",
            "map.yaml",
            "DRP-10",
            "--level",
            "campaign",
            "--project",
            "PREOPS",
        ])
        .expect("parse");
        assert_eq!(cli.tracker.project, "PREOPS");
        match cli.command {
            Command::MapSteps { level, .. } => assert_eq!(level, CliMapLevel::Campaign),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn regression_reset_and_remove_are_exclusive() {
        let parsed = Cli::try_parse_from([
            "prodstat",
            "add-job-to-summary",
            "PREOPS-1",
            "DRP-5",
            "--reset",
            "--remove",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn regression_zero_group_size_is_rejected() {
        let parsed = Cli::try_parse_from([
            "prodstat",
            "make-prod-groups",
            "t.yaml",
            "g",
            "0",
            "0",
            "1",
            "exp.txt",
        ]);
        assert!(parsed.is_err());
    }
}
