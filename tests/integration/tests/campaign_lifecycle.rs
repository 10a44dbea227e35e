use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::NaiveDate;
use prodstat_campaign::{
    import_map, CampaignDescriptor, DirectoryRunResolver, MapLevel, ReconcileOverrides,
    ReconcileReport, Reconciler, WorkflowStatRefresh,
};
use prodstat_hierarchy::{HierarchyStore, InMemorySummaryStore, SummaryTableManager};
use prodstat_stats::{FsCatalog, InMemoryMonitor, MonitorJob, MonitorTask, MonitorWorkflow};
use prodstat_tracker::{InMemoryTracker, IssueTracker};
use prodstat_types::{DiagnosticKind, WorkflowState};

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

const BROWSE: &str = "https://jira.example.org/browse/";
const RUN: &str = "20220127T205042Z";

struct IsolatedWorkspace {
    root: PathBuf,
}

impl IsolatedWorkspace {
    fn new(label: &str) -> Self {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let count = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "prodstat-{label}-{}-{tick}-{count}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("must create isolated workspace root");
        Self { root }
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// One step1 submission with a single run referencing PREOPS-1.
fn workflow_base(root: &Path) -> PathBuf {
    let base = root.join("bps");
    let body = "pipelineYaml: \"DRP.yaml#step1\"\npayload:\n  payloadName: step1\n  dataQuery: \"exposure >= 100 and exposure <= 200\"\n";
    let run_dir = base.join("submit/u/step1_a").join(RUN);
    fs::create_dir_all(&run_dir).expect("run dir");
    fs::write(base.join("step1_a.yaml"), body).expect("artifact");
    fs::write(run_dir.join("step1_a.yaml"), format!("{body}# PREOPS-1\n")).expect("copy");
    base
}

fn descriptor(base: &Path, production: &str) -> CampaignDescriptor {
    let mut descriptor = CampaignDescriptor::template("w_2022_04", None);
    descriptor.production_issue = Some(production.to_string());
    descriptor.steps[0].workflow_base = Some(base.display().to_string());
    descriptor
}

fn catalog(root: &Path) -> FsCatalog {
    let dir = root.join("u/PREOPS-1/step1").join(RUN).join("isr_metadata");
    fs::create_dir_all(&dir).expect("catalog dir");
    for (index, cpu) in [12.0, 36.0].iter().enumerate() {
        fs::write(
            dir.join(format!("r{index}.yaml")),
            format!(
                "isr:\n  quantum:\n    startCpuTime: 0\n    endCpuTime: {cpu}\n    MaxResidentSetSize: 1048576\n    startUtc: '2022-01-27 21:00:0{index}'\n"
            ),
        )
        .expect("record");
    }
    FsCatalog::new(root)
}

fn monitor() -> InMemoryMonitor {
    let monitor = InMemoryMonitor::new();
    let name = format!("u_preops-1_step1_{}", RUN.to_ascii_lowercase());
    let mut statuses = BTreeMap::new();
    statuses.insert("Finished".to_string(), 1);
    monitor.add_workflow(MonitorWorkflow {
        r_name: name.clone(),
        r_status: "finished".to_string(),
        created_at: Some("2022-01-27 20:55:00".to_string()),
        total_tasks: 1,
        total_files: 2,
        remaining_files: 0,
        processed_files: 2,
        tasks_statuses: statuses,
    });
    monitor.add_task(
        MonitorTask {
            jeditaskid: 7,
            taskname: format!("{name}_isr_1"),
            status: "done".to_string(),
            starttime: Some("2022-01-27 21:00:00".to_string()),
            endtime: Some("2022-01-27 22:00:00".to_string()),
            ..MonitorTask::default()
        },
        vec![MonitorJob {
            jobname: "isr-job".to_string(),
            jobstatus: "finished".to_string(),
            durationsec: Some(900.0),
            starttime: Some("2022-01-27 21:00:00".to_string()),
            endtime: Some("2022-01-27 21:15:00".to_string()),
            minramcount: Some(4096.0),
        }],
    );
    monitor
}

fn reconcile(tracker: &InMemoryTracker, base: &Path, production: &str) -> ReconcileReport {
    let resolver = DirectoryRunResolver;
    Reconciler::new(tracker, &resolver, "DRP", BROWSE)
        .reconcile_campaign(&descriptor(base, production), &ReconcileOverrides::default())
        .expect("reconcile campaign")
}

fn step1_workflow(tracker: &InMemoryTracker, report: &ReconcileReport) -> (String, String) {
    let step_key = report
        .campaign
        .step("step1")
        .and_then(|step| step.issue.clone())
        .expect("step1 ticket");
    let step = HierarchyStore::new(tracker)
        .load_step(&step_key)
        .expect("load step")
        .expect("step record");
    let workflow_key = step.workflows["step1_a"]
        .issue
        .clone()
        .expect("workflow ticket");
    (step_key, workflow_key)
}

#[test]
fn integration_campaign_lifecycle_registers_refreshes_and_summarizes() {
    let workspace = IsolatedWorkspace::new("lifecycle");
    let base = workflow_base(workspace.root());
    let tracker = InMemoryTracker::new();
    tracker.seed_issue("PREOPS-1", "production request", "");

    let report = reconcile(&tracker, &base, "PREOPS-1");
    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
    let (_, workflow_key) = step1_workflow(&tracker, &report);
    assert_eq!(
        tracker.get_issue(&workflow_key).expect("workflow").summary,
        format!("step1#PREOPS-1/{RUN}")
    );

    let catalog = catalog(&workspace.root().join("repo"));
    let monitor = monitor();
    let data_dir = workspace.root().join("data");
    let today = NaiveDate::from_ymd_opt(2022, 3, 1).expect("date");
    let outcome = WorkflowStatRefresh {
        hierarchy: HierarchyStore::new(&tracker),
        catalog: &catalog,
        monitor: &monitor,
        data_dir: &data_dir,
    }
    .refresh(
        "PREOPS-1",
        &workflow_key,
        today,
        today.and_hms_opt(8, 0, 0).expect("time"),
    )
    .expect("refresh");
    assert_eq!(outcome.workflow.state, WorkflowState::Complete);
    assert_eq!(
        outcome
            .workflow
            .catalog_stats
            .as_ref()
            .expect("catalog block")
            .tasks["isr"]
            .n_tasks,
        2
    );

    let store = InMemorySummaryStore::new();
    let manager = SummaryTableManager::new(&store, &tracker);
    let row = manager
        .upsert("PREOPS-1", &workflow_key, None)
        .expect("summary row");
    assert_eq!(row.timestamp.as_deref(), Some(RUN));
    assert_eq!(row.counts.n_finished, 1);
    manager
        .upsert("PREOPS-1", &workflow_key, None)
        .expect("summary row again");
    assert_eq!(store.snapshot().len(), 1);
}

#[test]
fn integration_reconciling_twice_keeps_tickets_and_links() {
    let workspace = IsolatedWorkspace::new("idempotent");
    let base = workflow_base(workspace.root());
    let tracker = InMemoryTracker::new();
    tracker.seed_issue("PREOPS-1", "production request", "");

    let first = reconcile(&tracker, &base, "PREOPS-1");
    let tickets = tracker.issue_count();
    let links = tracker.links();
    let second = reconcile(&tracker, &base, "PREOPS-1");

    assert_eq!(first.campaign, second.campaign);
    assert_eq!(tracker.issue_count(), tickets);
    assert_eq!(tracker.links(), links);
    assert_eq!(
        step1_workflow(&tracker, &first),
        step1_workflow(&tracker, &second)
    );
}

#[test]
fn functional_campaign_mapping_only_touches_the_campaign_ticket() {
    let workspace = IsolatedWorkspace::new("mapping");
    let base = workflow_base(workspace.root());
    let tracker = InMemoryTracker::new();
    tracker.seed_issue("PREOPS-1", "production request", "");
    let report = reconcile(&tracker, &base, "PREOPS-1");
    let campaign_key = report.campaign.issue.clone().expect("campaign ticket");
    let (step_key, _) = step1_workflow(&tracker, &report);
    let step_before = tracker.get_issue(&step_key).expect("step ticket");

    let mapping: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&format!(
        "step1: [{step_key}, '2022-01-27', '2022-01-28', 12.5, done]\nstep8: [DRP-999, a, b, 1, c]\n"
    ))
    .expect("mapping");
    let hierarchy = HierarchyStore::new(&tracker);
    let imported = import_map(&hierarchy, &mapping, &campaign_key, MapLevel::Campaign, BROWSE)
        .expect("import");

    assert_eq!(imported.applied, vec!["step1"]);
    assert_eq!(imported.diagnostics.len(), 1);
    assert_eq!(imported.diagnostics[0].kind, DiagnosticKind::UnknownMappingKey);
    let campaign = hierarchy
        .load_campaign(&campaign_key)
        .expect("load campaign")
        .expect("campaign record");
    let step1 = campaign.step("step1").expect("step1");
    assert_eq!(step1.rollup.core_hours, Some(12.5));
    assert_eq!(step1.rollup.state.as_deref(), Some("done"));
    assert_eq!(tracker.get_issue(&step_key).expect("step ticket"), step_before);
}

#[test]
fn regression_unknown_production_issue_leaves_workflow_unregistered() {
    let workspace = IsolatedWorkspace::new("unregistered");
    let base = workflow_base(workspace.root());
    let tracker = InMemoryTracker::new();

    let report = reconcile(&tracker, &base, "PREOPS-404");
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].kind, DiagnosticKind::Registration);

    let step_key = report
        .campaign
        .step("step1")
        .and_then(|step| step.issue.clone())
        .expect("step1 ticket");
    let step = HierarchyStore::new(&tracker)
        .load_step(&step_key)
        .expect("load step")
        .expect("step record");
    assert_eq!(step.workflows["step1_a"].issue, None);
}
