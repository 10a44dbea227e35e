//! Per-job timing series from the monitor and running-jobs plots.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use prodstat_core::write_text_atomic;
use prodstat_types::{ProdstatError, ProdstatResult};
use tracing::{debug, info, warn};

use crate::monitor::{parse_monitor_time, select_workflows, MonitorSource};
use crate::request::TimingRequest;

const SERIES_HEADER: &str = "delta_time,durationsec,start_time";
const PALETTE: [&str; 10] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b", "#e377c2", "#7f7f7f",
    "#bcbd22", "#17becf",
];
const PLOT_WIDTH: f64 = 800.0;
const PLOT_HEIGHT: f64 = 500.0;
const MARGIN: f64 = 60.0;

/// One job: start offset from the series origin and its duration, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSample {
    pub delta_time: f64,
    pub duration_sec: f64,
}

/// Stored series of one job name. `origin` is the epoch second all offsets
/// are measured from; it is fixed when the series is first written.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSeries {
    pub job_name: String,
    pub origin: i64,
    pub samples: Vec<TimingSample>,
}

impl TimingSeries {
    pub fn max_delta(&self) -> f64 {
        self.samples
            .iter()
            .map(|sample| sample.delta_time)
            .fold(0.0, f64::max)
    }

    pub fn to_csv(&self) -> String {
        let mut out = format!("{SERIES_HEADER}\n");
        for sample in &self.samples {
            let _ = writeln!(out, "{},{},{}", sample.delta_time, sample.duration_sec, self.origin);
        }
        out
    }

    pub fn from_csv(job_name: &str, raw: &str) -> ProdstatResult<Self> {
        let mut lines = raw.lines();
        match lines.next() {
            Some(header) if header.trim() == SERIES_HEADER => {}
            other => {
                return Err(ProdstatError::MalformedRecord {
                    record: format!("timing series {job_name}"),
                    reason: format!("unexpected header {other:?}"),
                })
            }
        }
        let mut origin = None;
        let mut samples = Vec::new();
        for (number, line) in lines.enumerate().filter(|(_, line)| !line.trim().is_empty()) {
            let malformed = |reason: &str| ProdstatError::MalformedRecord {
                record: format!("timing series {job_name} line {}", number + 2),
                reason: reason.to_string(),
            };
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [delta, duration, start] = fields.as_slice() else {
                return Err(malformed("expected three fields"));
            };
            let delta_time = delta.parse::<f64>().map_err(|_| malformed("bad delta_time"))?;
            let duration_sec = duration.parse::<f64>().map_err(|_| malformed("bad durationsec"))?;
            let start = start.parse::<f64>().map_err(|_| malformed("bad start_time"))? as i64;
            origin.get_or_insert(start);
            samples.push(TimingSample {
                delta_time,
                duration_sec,
            });
        }
        Ok(Self {
            job_name: job_name.to_string(),
            origin: origin.unwrap_or_default(),
            samples,
        })
    }
}

pub fn series_path(data_dir: &Path, job_name: &str) -> PathBuf {
    data_dir.join(format!("timing_series_{job_name}.csv"))
}

pub fn plot_path(data_dir: &Path, job_name: &str) -> PathBuf {
    data_dir.join(format!("timing_{job_name}.svg"))
}

fn load_series(path: &Path, job_name: &str) -> ProdstatResult<Option<TimingSeries>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|error| ProdstatError::file(path.display(), error))?;
    TimingSeries::from_csv(job_name, &raw).map(Some)
}

fn write_file(path: &Path, body: &str) -> ProdstatResult<()> {
    write_text_atomic(path, body).map_err(|error| {
        ProdstatError::file(path.display(), std::io::Error::other(format!("{error:#}")))
    })
}

/// Samples added to one series by a preparation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesUpdate {
    pub path: PathBuf,
    pub added: usize,
    pub total: usize,
}

/// Extends the stored series of every requested job name with jobs that
/// started after the last stored offset. Returns an empty map when no
/// workflow matches the request.
pub fn prepare_timing(
    request: &TimingRequest,
    monitor: &dyn MonitorSource,
    data_dir: &Path,
) -> ProdstatResult<BTreeMap<String, SeriesUpdate>> {
    let window = request.validate()?;
    let selected = select_workflows(monitor.workflows()?, &request.scope, &request.coll_type, &window);
    if selected.is_empty() {
        warn!(scope = %request.scope, "no workflows match the timing request");
        return Ok(BTreeMap::new());
    }
    let Some(first_created) = selected
        .values()
        .flatten()
        .filter_map(|workflow| workflow.created_at.as_deref().and_then(parse_monitor_time))
        .min()
    else {
        return Err(ProdstatError::source_unavailable(
            "monitor",
            "selected workflows carry no creation time",
        ));
    };

    let mut collected: BTreeMap<&str, Vec<(Option<i64>, f64)>> = BTreeMap::new();
    for workflows in selected.values() {
        for workflow in workflows {
            let mut tasks = monitor.tasks(&workflow.r_name)?;
            tasks.sort_by_key(|task| task.jeditaskid);
            for task in tasks {
                if !request.job_names.iter().any(|name| task.taskname.contains(name.as_str())) {
                    continue;
                }
                for job in monitor.jobs(task.jeditaskid, None, None)? {
                    let start = job
                        .starttime
                        .as_deref()
                        .and_then(parse_monitor_time)
                        .map(|start| start.and_utc().timestamp());
                    let duration = job.durationsec.unwrap_or(0.0);
                    for name in &request.job_names {
                        if job.jobname.contains(name.as_str()) {
                            collected
                                .entry(name.as_str())
                                .or_default()
                                .push((start, duration));
                        }
                    }
                }
            }
        }
    }

    let mut updates = BTreeMap::new();
    for name in &request.job_names {
        let path = series_path(data_dir, name);
        let mut series = load_series(&path, name)?.unwrap_or_else(|| TimingSeries {
            job_name: name.clone(),
            origin: 0,
            samples: Vec::new(),
        });
        if series.samples.is_empty() {
            series.origin = first_created.and_utc().timestamp();
        }
        let last = series.max_delta();
        let mut fresh: Vec<TimingSample> = collected
            .get(name.as_str())
            .into_iter()
            .flatten()
            .map(|(start, duration)| TimingSample {
                delta_time: start.map_or(-1.0, |start| (start - series.origin) as f64),
                duration_sec: *duration,
            })
            .filter(|sample| sample.delta_time > last)
            .collect();
        fresh.sort_by(|left, right| {
            left.delta_time
                .total_cmp(&right.delta_time)
                .then(left.duration_sec.total_cmp(&right.duration_sec))
        });
        let added = fresh.len();
        series.samples.extend(fresh);
        write_file(&path, &series.to_csv())?;
        debug!(job = %name, added, total = series.samples.len(), "timing series written");
        updates.insert(
            name.clone(),
            SeriesUpdate {
                path,
                added,
                total: series.samples.len(),
            },
        );
    }
    info!(scope = %request.scope, series = updates.len(), "timing data prepared");
    Ok(updates)
}

/// Running-job counts per bin of `bin_width` seconds, restricted to
/// `[start_at, stop_at)` hours. Returns `(hours, count)` points, or nothing
/// when the series ends before `start_at`.
pub fn running_counts(
    samples: &[TimingSample],
    bin_width: f64,
    start_at: f64,
    stop_at: f64,
) -> Vec<(f64, u64)> {
    let scale = bin_width / 3600.0;
    let plot_bins = ((stop_at - start_at) / scale) as usize;
    let max_time = samples
        .iter()
        .map(|sample| sample.delta_time)
        .fold(0.0, f64::max);
    let total_bins = (max_time / bin_width) as usize;
    let mut counts = vec![0_u64; total_bins];
    for sample in samples.iter().filter(|sample| sample.delta_time >= 0.0) {
        let from = ((sample.delta_time / bin_width) as usize).min(total_bins);
        let to = (((sample.delta_time + sample.duration_sec) / bin_width) as usize).min(total_bins);
        for slot in &mut counts[from..to.max(from)] {
            *slot += 1;
        }
    }
    let first_bin = (start_at / scale).max(0.0) as usize;
    let last_bin = (first_bin + plot_bins).min(total_bins);
    if first_bin >= last_bin {
        return Vec::new();
    }
    let mut window = counts[first_bin..last_bin].to_vec();
    window.resize(plot_bins, 0);
    window
        .into_iter()
        .enumerate()
        .map(|(bin, count)| (bin as f64 * scale + start_at, count))
        .collect()
}

/// Minimal SVG line chart of running jobs over time.
pub fn render_svg(
    job_name: &str,
    points: &[(f64, u64)],
    start_at: f64,
    stop_at: f64,
    origin_label: &str,
    color: &str,
) -> String {
    let max_count = points.iter().map(|(_, count)| *count).max().unwrap_or(0) as f64;
    let max_y = 1.2 * (max_count + 1.0);
    let span = (stop_at - start_at).max(f64::EPSILON);
    let inner_width = PLOT_WIDTH - 2.0 * MARGIN;
    let inner_height = PLOT_HEIGHT - 2.0 * MARGIN;
    let x = |hours: f64| MARGIN + (hours - start_at) / span * inner_width;
    let y = |count: f64| PLOT_HEIGHT - MARGIN - count / max_y * inner_height;

    let polyline: Vec<String> = points
        .iter()
        .map(|(hours, count)| format!("{:.1},{:.1}", x(*hours), y(*count as f64)))
        .collect();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{PLOT_WIDTH}\" height=\"{PLOT_HEIGHT}\" viewBox=\"0 0 {PLOT_WIDTH} {PLOT_HEIGHT}\">"
    );
    let _ = writeln!(out, "  <rect width=\"100%\" height=\"100%\" fill=\"white\"/>");
    let _ = writeln!(
        out,
        "  <text x=\"{}\" y=\"{}\" text-anchor=\"middle\" font-size=\"16\">{job_name}</text>",
        PLOT_WIDTH / 2.0,
        MARGIN / 2.0
    );
    let _ = writeln!(
        out,
        "  <line x1=\"{MARGIN}\" y1=\"{0}\" x2=\"{1}\" y2=\"{0}\" stroke=\"black\"/>",
        PLOT_HEIGHT - MARGIN,
        PLOT_WIDTH - MARGIN
    );
    let _ = writeln!(
        out,
        "  <line x1=\"{MARGIN}\" y1=\"{MARGIN}\" x2=\"{MARGIN}\" y2=\"{}\" stroke=\"black\"/>",
        PLOT_HEIGHT - MARGIN
    );
    let _ = writeln!(
        out,
        "  <text x=\"{MARGIN}\" y=\"{}\" font-size=\"12\">{start_at}</text>",
        PLOT_HEIGHT - MARGIN + 16.0
    );
    let _ = writeln!(
        out,
        "  <text x=\"{}\" y=\"{}\" text-anchor=\"end\" font-size=\"12\">{stop_at}</text>",
        PLOT_WIDTH - MARGIN,
        PLOT_HEIGHT - MARGIN + 16.0
    );
    let _ = writeln!(
        out,
        "  <text x=\"{}\" y=\"{}\" text-anchor=\"end\" font-size=\"12\">{max_y:.1}</text>",
        MARGIN - 4.0,
        MARGIN + 4.0
    );
    let _ = writeln!(
        out,
        "  <text x=\"{}\" y=\"{}\" text-anchor=\"middle\" font-size=\"13\">Hours since first quantum start at {origin_label}</text>",
        PLOT_WIDTH / 2.0,
        PLOT_HEIGHT - MARGIN / 3.0
    );
    let _ = writeln!(
        out,
        "  <text x=\"{0}\" y=\"{1}\" transform=\"rotate(-90 {0} {1})\" text-anchor=\"middle\" font-size=\"13\">Number of running quanta</text>",
        MARGIN / 3.0,
        PLOT_HEIGHT / 2.0
    );
    let _ = writeln!(
        out,
        "  <polyline fill=\"none\" stroke=\"{color}\" stroke-width=\"1.5\" points=\"{}\"/>",
        polyline.join(" ")
    );
    out.push_str("</svg>\n");
    out
}

/// Renders `timing_<job>.svg` for every job name with a stored series.
pub fn plot_timing(request: &TimingRequest, data_dir: &Path) -> ProdstatResult<Vec<PathBuf>> {
    request.validate()?;
    let mut written = Vec::new();
    for (figure, name) in request.job_names.iter().enumerate() {
        let Some(series) = load_series(&series_path(data_dir, name), name)? else {
            warn!(job = %name, "no timing series; run prep-timing-data first");
            continue;
        };
        let points = running_counts(&series.samples, request.bin_width, request.start_at, request.stop_at);
        if points.is_empty() {
            warn!(job = %name, "timing series ends before the plot range");
            continue;
        }
        let origin_label = DateTime::from_timestamp(series.origin, 0)
            .map(|origin| origin.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let svg = render_svg(
            name,
            &points,
            request.start_at,
            request.stop_at,
            &origin_label,
            PALETTE[figure % PALETTE.len()],
        );
        let path = plot_path(data_dir, name);
        write_file(&path, &svg)?;
        written.push(path);
    }
    info!(plots = written.len(), "timing plots written");
    Ok(written)
}
