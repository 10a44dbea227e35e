//! Request files driving aggregation and timing runs.

use std::path::Path;

use chrono::NaiveDate;
use prodstat_core::parse_calendar_date;
use prodstat_types::{ProdstatError, ProdstatResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

pub const DEFAULT_MAX_TASK: usize = 100;

/// Inclusive calendar window for run selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub stop: NaiveDate,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.stop
    }
}

fn parse_window(start: &str, stop: &str) -> ProdstatResult<DateWindow> {
    let parse = |raw: &str, field: &str| {
        parse_calendar_date(raw)
            .map_err(|error| ProdstatError::InvalidInput(format!("{field}: {error:#}")))
    };
    let window = DateWindow {
        start: parse(start, "start_date")?,
        stop: parse(stop, "stop_date")?,
    };
    if window.start > window.stop {
        return Err(ProdstatError::InvalidInput(format!(
            "start_date {} is after stop_date {}",
            window.start, window.stop
        )));
    }
    Ok(window)
}

/// Accepts dates written as YAML strings or bare numbers (`20220301`).
fn date_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::String(text) => Ok(text),
        serde_yaml::Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a date, got {other:?}"
        ))),
    }
}

fn default_max_task() -> usize {
    DEFAULT_MAX_TASK
}

/// Statistics aggregation request (`get-catalog-stat`, `get-monitor-stat`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AggregationRequest {
    /// Catalog root; ignored by the monitor source.
    #[serde(rename = "Butler", default)]
    pub butler: String,
    /// Scope key, usually the production issue.
    #[serde(rename = "Jira")]
    pub scope: String,
    #[serde(rename = "collType", default)]
    pub coll_type: String,
    #[serde(default = "default_max_task")]
    pub maxtask: usize,
    #[serde(deserialize_with = "date_text")]
    pub start_date: String,
    #[serde(deserialize_with = "date_text")]
    pub stop_date: String,
}

impl AggregationRequest {
    pub fn window(&self) -> ProdstatResult<DateWindow> {
        parse_window(&self.start_date, &self.stop_date)
    }

    pub fn validate(&self) -> ProdstatResult<DateWindow> {
        if self.scope.trim().is_empty() {
            return Err(ProdstatError::InvalidInput(
                "request needs a non-empty Jira scope".to_string(),
            ));
        }
        if self.maxtask == 0 {
            return Err(ProdstatError::InvalidInput(
                "maxtask must be greater than 0".to_string(),
            ));
        }
        self.window()
    }
}

fn default_bin_width() -> f64 {
    3600.0
}

/// Timing series request (`prep-timing-data`, `plot-data`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TimingRequest {
    #[serde(rename = "Jira")]
    pub scope: String,
    #[serde(rename = "collType", default)]
    pub coll_type: String,
    /// Histogram bin width in seconds.
    #[serde(default = "default_bin_width")]
    pub bin_width: f64,
    /// Plot range in hours since the first job start.
    #[serde(default)]
    pub start_at: f64,
    pub stop_at: f64,
    #[serde(deserialize_with = "date_text")]
    pub start_date: String,
    #[serde(deserialize_with = "date_text")]
    pub stop_date: String,
    pub job_names: Vec<String>,
}

impl TimingRequest {
    pub fn window(&self) -> ProdstatResult<DateWindow> {
        parse_window(&self.start_date, &self.stop_date)
    }

    pub fn validate(&self) -> ProdstatResult<DateWindow> {
        if self.bin_width <= 0.0 {
            return Err(ProdstatError::InvalidInput(
                "bin_width must be positive".to_string(),
            ));
        }
        if self.stop_at <= self.start_at {
            return Err(ProdstatError::InvalidInput(format!(
                "stop_at {} must be after start_at {}",
                self.stop_at, self.start_at
            )));
        }
        if self.job_names.is_empty() {
            return Err(ProdstatError::InvalidInput(
                "job_names must list at least one job".to_string(),
            ));
        }
        self.window()
    }
}

/// Loads any YAML request file.
pub fn load_request<T: DeserializeOwned>(path: &Path) -> ProdstatResult<T> {
    let raw = std::fs::read_to_string(path).map_err(|error| ProdstatError::file(path.display(), error))?;
    serde_yaml::from_str(&raw).map_err(|error| {
        ProdstatError::InvalidInput(format!("invalid request file {}: {error}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_aggregation_request_parses_original_keys() {
        let request: AggregationRequest = serde_yaml::from_str(
            "Butler: /repo/main\nJira: PREOPS-938\ncollType: 2.2i\nmaxtask: 30\nstart_date: '2022-02-01'\nstop_date: 20220301\n",
        )
        .expect("request");
        assert_eq!(request.scope, "PREOPS-938");
        assert_eq!(request.coll_type, "2.2i");
        assert_eq!(request.maxtask, 30);
        let window = request.validate().expect("window");
        assert_eq!(window.stop, NaiveDate::from_ymd_opt(2022, 3, 1).expect("date"));
    }

    #[test]
    fn unit_maxtask_defaults_when_absent() {
        let request: AggregationRequest = serde_yaml::from_str(
            "Jira: PREOPS-1\nstart_date: '2022-01-01'\nstop_date: '2022-01-02'\n",
        )
        .expect("request");
        assert_eq!(request.maxtask, DEFAULT_MAX_TASK);
    }

    #[test]
    fn regression_reversed_window_is_rejected() {
        let request: AggregationRequest = serde_yaml::from_str(
            "Jira: PREOPS-1\nstart_date: '2022-03-01'\nstop_date: '2022-01-02'\n",
        )
        .expect("request");
        assert!(matches!(
            request.validate(),
            Err(ProdstatError::InvalidInput(_))
        ));
    }

    #[test]
    fn unit_timing_request_requires_job_names() {
        let request: TimingRequest = serde_yaml::from_str(
            "Jira: PREOPS-1\ncollType: 2.2i\nbin_width: 30\nstart_at: 0\nstop_at: 10\nstart_date: '2022-01-01'\nstop_date: '2022-01-02'\njob_names: []\n",
        )
        .expect("request");
        assert!(request.validate().is_err());
    }
}
