use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ProdstatError;

/// Fixed-width run timestamp (`YYYYMMDDTHHMMSSZ`), always stored upper-case.
///
/// Lexicographic order equals chronological order, which the run resolver
/// relies on when picking the most recent run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunTimestamp(String);

impl RunTimestamp {
    pub const WIDTH: usize = 16;

    pub fn parse(raw: &str) -> Result<Self, ProdstatError> {
        let normalized = raw.trim().to_ascii_uppercase();
        if Self::is_valid(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(ProdstatError::InvalidInput(format!(
                "'{}' is not a run timestamp (expected YYYYMMDDTHHMMSSZ)",
                raw.trim()
            )))
        }
    }

    /// Returns true when `raw` (any case) has the run timestamp shape.
    pub fn is_valid(raw: &str) -> bool {
        let bytes = raw.as_bytes();
        if bytes.len() != Self::WIDTH {
            return false;
        }
        bytes.iter().enumerate().all(|(index, byte)| match index {
            8 => byte.eq_ignore_ascii_case(&b'T'),
            15 => byte.eq_ignore_ascii_case(&b'Z'),
            _ => byte.is_ascii_digit(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-case form used by the workflow monitor in task names.
    pub fn to_lowercase(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// Calendar date part, `None` when the digits do not form a real date.
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.0[..8], "%Y%m%d").ok()
    }
}

impl TryFrom<String> for RunTimestamp {
    type Error = ProdstatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunTimestamp> for String {
    fn from(value: RunTimestamp) -> Self {
        value.0
    }
}

impl fmt::Display for RunTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
