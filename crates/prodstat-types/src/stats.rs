use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label of the synthetic row that totals every task type.
pub const TOTAL_ROW_LABEL: &str = "Campaign";

/// Telemetry source a [`StatBlock`] was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatSourceKind {
    #[default]
    Catalog,
    Monitor,
}

impl StatSourceKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Monitor => "monitor",
        }
    }
}

impl fmt::Display for StatSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Task and file counters shown in summary tables as `(T,Q,D,Fa,Sf)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StatusCounts {
    pub n_tasks: u64,
    pub n_files: u64,
    pub n_finished: u64,
    pub n_failed: u64,
    pub n_sub_finished: u64,
}

impl StatusCounts {
    pub fn tuple_label(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.n_tasks, self.n_files, self.n_finished, self.n_failed, self.n_sub_finished
        )
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Resource totals for one task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskStats {
    /// Quanta (catalog) or files (monitor) attributed to the task type.
    pub n_tasks: u64,
    /// Records actually read to estimate CPU and memory.
    pub n_sampled: u64,
    pub cpu_seconds: f64,
    pub wall_seconds: f64,
    pub max_rss_gb: f64,
    pub n_finished: u64,
    pub n_failed: u64,
    pub first_start: Option<String>,
}

impl TaskStats {
    /// Adds another contribution into this one.
    pub fn absorb(&mut self, other: &TaskStats) {
        self.n_tasks += other.n_tasks;
        self.n_sampled += other.n_sampled;
        self.cpu_seconds += other.cpu_seconds;
        self.wall_seconds += other.wall_seconds;
        self.max_rss_gb = self.max_rss_gb.max(other.max_rss_gb);
        self.n_finished += other.n_finished;
        self.n_failed += other.n_failed;
        self.first_start = match (self.first_start.take(), other.first_start.as_ref()) {
            (Some(current), Some(candidate)) if candidate < &current => Some(candidate.clone()),
            (Some(current), _) => Some(current),
            (None, candidate) => candidate.cloned(),
        };
    }

    pub fn cpu_hours(&self) -> f64 {
        self.cpu_seconds / 3600.0
    }

    pub fn cpu_seconds_per_task(&self) -> f64 {
        if self.n_tasks == 0 {
            0.0
        } else {
            self.cpu_seconds / self.n_tasks as f64
        }
    }

    /// Achieved parallelism: total CPU time over wall-clock span, at least 1.
    pub fn parallelism(&self) -> u64 {
        if self.wall_seconds <= 0.0 || self.cpu_seconds <= 0.0 {
            return 1;
        }
        ((self.cpu_seconds / self.wall_seconds).ceil() as u64).max(1)
    }
}

/// Per-task-type totals from one telemetry source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StatBlock {
    pub source: StatSourceKind,
    pub tasks: BTreeMap<String, TaskStats>,
    /// Records that could not be read during the run that produced this block.
    pub malformed_records: u64,
}

impl StatBlock {
    pub fn new(source: StatSourceKind) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn add_task(&mut self, task_type: &str, stats: &TaskStats) {
        self.tasks
            .entry(task_type.to_string())
            .or_default()
            .absorb(stats);
    }

    pub fn absorb(&mut self, other: &StatBlock) {
        for (task_type, stats) in &other.tasks {
            self.add_task(task_type, stats);
        }
        self.malformed_records += other.malformed_records;
    }

    /// Sum over every task type, rendered as the campaign row.
    pub fn total(&self) -> TaskStats {
        let mut total = TaskStats::default();
        for stats in self.tasks.values() {
            total.absorb(stats);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(n_tasks: u64, cpu: f64, wall: f64, rss: f64, start: Option<&str>) -> TaskStats {
        TaskStats {
            n_tasks,
            n_sampled: n_tasks,
            cpu_seconds: cpu,
            wall_seconds: wall,
            max_rss_gb: rss,
            n_finished: n_tasks,
            n_failed: 0,
            first_start: start.map(str::to_string),
        }
    }

    #[test]
    fn unit_absorb_sums_counts_and_keeps_extremes() {
        let mut left = stats(2, 100.0, 50.0, 1.5, Some("2022-01-02T00:00:00"));
        left.absorb(&stats(3, 50.0, 25.0, 2.5, Some("2022-01-01T00:00:00")));
        assert_eq!(left.n_tasks, 5);
        assert_eq!(left.cpu_seconds, 150.0);
        assert_eq!(left.max_rss_gb, 2.5);
        assert_eq!(left.first_start.as_deref(), Some("2022-01-01T00:00:00"));
    }

    #[test]
    fn unit_parallelism_rounds_up_and_floors_at_one() {
        assert_eq!(stats(1, 100.0, 30.0, 0.0, None).parallelism(), 4);
        assert_eq!(stats(1, 10.0, 0.0, 0.0, None).parallelism(), 1);
        assert_eq!(stats(1, 1.0, 100.0, 0.0, None).parallelism(), 1);
    }

    #[test]
    fn functional_total_folds_every_task_type() {
        let mut block = StatBlock::new(StatSourceKind::Catalog);
        block.add_task("isr", &stats(10, 200.0, 0.0, 1.0, None));
        block.add_task("calibrate", &stats(5, 300.0, 0.0, 3.0, None));
        block.add_task("isr", &stats(2, 40.0, 0.0, 0.5, None));
        let total = block.total();
        assert_eq!(block.tasks.len(), 2);
        assert_eq!(block.tasks["isr"].n_tasks, 12);
        assert_eq!(total.n_tasks, 17);
        assert_eq!(total.cpu_seconds, 540.0);
        assert_eq!(total.max_rss_gb, 3.0);
    }

    #[test]
    fn unit_status_counts_tuple_label() {
        let counts = StatusCounts {
            n_tasks: 5,
            n_files: 100,
            n_finished: 3,
            n_failed: 1,
            n_sub_finished: 1,
        };
        assert_eq!(counts.tuple_label(), "5,100,3,1,1");
        assert!(StatusCounts::default().is_empty());
    }
}
