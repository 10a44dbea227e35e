use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use prodstat_campaign::{
    import_map, load_descriptor, load_mapping, make_prod_groups, write_campaign_yaml,
    CampaignDescriptor, DirectoryRunResolver, GroupRequest, ReconcileOverrides, Reconciler,
    StepDescriptor, WorkflowRegistrar, WorkflowStatRefresh,
};
use prodstat_core::{resolve_data_dir, today_utc};
use prodstat_hierarchy::{HierarchyStore, SummaryTableManager, SummaryViews, TrackerSummaryStore};
use prodstat_stats::{
    load_request, plot_timing, prepare_timing, write_reports, AggregationRequest, FsCatalog,
    PandaClient, StatAggregator, StatSource, TimingRequest,
};
use prodstat_tracker::{publish_report, replace_attachment, ReportRequest};
use prodstat_types::{Diagnostic, ProdstatError};
use tracing::info;

use crate::cli_args::{Cli, Command, SummaryArgs};
use crate::tracker_setup::{browse_base, connect_tracker};

/// Runs one command. Non-fatal conditions come back as diagnostics.
pub(crate) fn run(cli: Cli) -> Result<Vec<Diagnostic>> {
    let data_dir = resolve_data_dir(cli.data_dir.as_deref());
    match &cli.command {
        Command::UpdateIssue {
            artifact,
            production,
            workflow,
            ts,
        } => {
            let tracker = connect_tracker(&cli.tracker, cli.request_timeout_ms)?;
            let resolver = DirectoryRunResolver;
            let registrar = WorkflowRegistrar::new(&tracker, &resolver, cli.tracker.project.as_str());
            // "0" is how older scripts spell "no timestamp".
            let explicit = ts.as_deref().filter(|ts| !ts.is_empty() && *ts != "0");
            let record = registrar
                .register(artifact, production, Some(workflow.as_str()), explicit)
                .with_context(|| format!("failed to register {}", artifact.display()))?;
            println!(
                "{} {}",
                record.issue.as_deref().unwrap_or("-"),
                record.summary_line()
            );
            Ok(Vec::new())
        }
        Command::AddJobToSummary {
            production,
            workflow,
            reset,
            remove,
            summary,
        } => {
            let tracker = connect_tracker(&cli.tracker, cli.request_timeout_ms)?;
            let store = TrackerSummaryStore::new(&tracker, summary.backend.as_str())
                .with_views(summary_views(summary, &cli));
            let manager = SummaryTableManager::new(&store, &tracker);
            if *remove {
                let removed = manager.remove(production, workflow)?;
                println!("{production}#{workflow} removed: {removed}");
                return Ok(Vec::new());
            }
            if *reset {
                manager.reset()?;
            }
            let row = manager.upsert(production, workflow, None)?;
            println!(
                "{production}#{workflow} {}",
                row.timestamp.as_deref().unwrap_or("-")
            );
            Ok(Vec::new())
        }
        Command::UpdateStat {
            production,
            workflow,
            butler,
        } => {
            let tracker = connect_tracker(&cli.tracker, cli.request_timeout_ms)?;
            let catalog = FsCatalog::new(butler);
            let monitor = PandaClient::new(&cli.monitor_url, cli.request_timeout_ms)?;
            let refresh = WorkflowStatRefresh {
                hierarchy: HierarchyStore::new(&tracker),
                catalog: &catalog,
                monitor: &monitor,
                data_dir: &data_dir,
            };
            let outcome = refresh.refresh(
                production,
                workflow,
                today_utc(),
                Utc::now().naive_utc(),
            )?;
            println!(
                "{workflow} {} ({} files written)",
                outcome.workflow.state,
                outcome.written.len()
            );
            Ok(outcome.diagnostics)
        }
        Command::GetCatalogStat {
            param_file,
            clean_history,
        } => {
            let request: AggregationRequest = load_request(param_file)?;
            if request.butler.trim().is_empty() {
                bail!(ProdstatError::InvalidInput(format!(
                    "{} needs a Butler catalog root",
                    param_file.display()
                )));
            }
            let catalog = FsCatalog::new(&request.butler);
            aggregate(&data_dir, &request, StatSource::Catalog(&catalog), *clean_history)
        }
        Command::GetMonitorStat {
            param_file,
            clean_history,
        } => {
            let request: AggregationRequest = load_request(param_file)?;
            let monitor = PandaClient::new(&cli.monitor_url, cli.request_timeout_ms)?;
            aggregate(&data_dir, &request, StatSource::Monitor(&monitor), *clean_history)
        }
        Command::PrepTimingData { param_file } => {
            let request: TimingRequest = load_request(param_file)?;
            let monitor = PandaClient::new(&cli.monitor_url, cli.request_timeout_ms)?;
            let updates = prepare_timing(&request, &monitor, &data_dir)?;
            for (job, update) in &updates {
                println!(
                    "{job}: {} new samples, {} total -> {}",
                    update.added,
                    update.total,
                    update.path.display()
                );
            }
            Ok(Vec::new())
        }
        Command::PlotData { param_file } => {
            let request: TimingRequest = load_request(param_file)?;
            print_paths(&plot_timing(&request, &data_dir)?);
            Ok(Vec::new())
        }
        Command::ReportToTracker { param_file } => {
            let request: ReportRequest = load_request(param_file)?;
            let tracker = connect_tracker(&cli.tracker, cli.request_timeout_ms)?;
            let outcome = publish_report(&tracker, &request)?;
            println!(
                "{}: {} comments replaced, {} added, {} attachments",
                request.issue,
                outcome.comments_updated,
                outcome.comments_added,
                outcome.attachments_replaced
            );
            Ok(Vec::new())
        }
        Command::UpdateCampaign {
            campaign_yaml,
            campaign_issue,
            campaign_name,
        } => {
            let descriptor: CampaignDescriptor = load_descriptor(campaign_yaml)?;
            let tracker = connect_tracker(&cli.tracker, cli.request_timeout_ms)?;
            let resolver = DirectoryRunResolver;
            let reconciler = Reconciler::new(
                &tracker,
                &resolver,
                cli.tracker.project.as_str(),
                browse_base(&cli.tracker),
            );
            let report = reconciler.reconcile_campaign(
                &descriptor,
                &ReconcileOverrides {
                    issue: campaign_issue.clone(),
                    campaign_issue: None,
                    name: campaign_name.clone(),
                },
            )?;
            println!(
                "{} Campaign {} ({} steps)",
                report.campaign.issue.as_deref().unwrap_or("-"),
                report.campaign.name,
                report.campaign.steps.len()
            );
            Ok(report.diagnostics)
        }
        Command::UpdateStep {
            step_yaml,
            step_issue,
            campaign_issue,
        } => {
            let descriptor: StepDescriptor = load_descriptor(step_yaml)?;
            let tracker = connect_tracker(&cli.tracker, cli.request_timeout_ms)?;
            let resolver = DirectoryRunResolver;
            let reconciler = Reconciler::new(
                &tracker,
                &resolver,
                cli.tracker.project.as_str(),
                browse_base(&cli.tracker),
            );
            let report = reconciler.reconcile_step(
                &descriptor,
                &ReconcileOverrides {
                    issue: step_issue.clone(),
                    campaign_issue: campaign_issue.clone(),
                    name: None,
                },
            )?;
            println!(
                "{} step {} ({} workflows)",
                report.step.issue.as_deref().unwrap_or("-"),
                report.step.name,
                report.step.workflows.len()
            );
            Ok(report.diagnostics)
        }
        Command::MapSteps {
            map_yaml,
            issue,
            level,
        } => {
            let mapping = load_mapping(map_yaml)?;
            let tracker = connect_tracker(&cli.tracker, cli.request_timeout_ms)?;
            let report = import_map(
                &HierarchyStore::new(&tracker),
                &mapping,
                issue,
                (*level).into(),
                &browse_base(&cli.tracker),
            )?;
            attach_file(&tracker, issue, map_yaml)?;
            println!(
                "{issue}: {} {} entries applied",
                report.applied.len(),
                report.level
            );
            Ok(report.diagnostics)
        }
        Command::CreateCampaignYaml {
            name,
            campaign_yaml,
            campaign_issue,
            from_tracker,
        } => {
            let descriptor = match (campaign_issue.as_deref(), *from_tracker) {
                (Some(issue), true) => {
                    let tracker = connect_tracker(&cli.tracker, cli.request_timeout_ms)?;
                    let record = HierarchyStore::new(&tracker)
                        .load_campaign(issue)?
                        .ok_or_else(|| ProdstatError::InvalidRecord {
                            kind: "campaign".to_string(),
                            location: issue.to_string(),
                            reason: "ticket carries no campaign record".to_string(),
                        })?;
                    CampaignDescriptor::from_record(&record)
                }
                (issue, _) => CampaignDescriptor::template(name, issue),
            };
            write_campaign_yaml(campaign_yaml, &descriptor)?;
            println!("{}", campaign_yaml.display());
            Ok(Vec::new())
        }
        Command::MakeProdGroups {
            template,
            band,
            group_size,
            skip_groups,
            max_groups,
            exposure_list,
            out_dir,
        } => {
            let written = make_prod_groups(
                template,
                exposure_list,
                &GroupRequest {
                    band: band.clone(),
                    group_size: *group_size,
                    skip_groups: *skip_groups,
                    max_groups: *max_groups,
                },
                out_dir,
            )?;
            print_paths(&written);
            Ok(Vec::new())
        }
    }
}

fn summary_views(summary: &SummaryArgs, cli: &Cli) -> SummaryViews {
    SummaryViews {
        all_rows_issue: summary.all_rows.clone(),
        step1_issue: Some(summary.step1.clone()).filter(|issue| !issue.trim().is_empty()),
        browse_base: browse_base(&cli.tracker),
    }
}

fn aggregate(
    data_dir: &Path,
    request: &AggregationRequest,
    source: StatSource<'_>,
    clean_history: bool,
) -> Result<Vec<Diagnostic>> {
    let aggregator = StatAggregator::new(data_dir);
    let report = aggregator.aggregate(request, source, clean_history)?;
    let written = write_reports(data_dir, &report, Utc::now().naive_utc())?;
    info!(
        scope = %report.scope,
        read = report.runs_read.len(),
        skipped = report.runs_skipped.len(),
        "aggregation finished"
    );
    print_paths(&written);
    Ok(report.diagnostics)
}

fn attach_file(
    tracker: &dyn prodstat_tracker::IssueTracker,
    issue: &str,
    path: &Path,
) -> Result<()> {
    let content =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))?;
    replace_attachment(tracker, issue, &filename, &content)?;
    Ok(())
}

fn print_paths(paths: &[PathBuf]) {
    for path in paths {
        println!("{}", path.display());
    }
}
