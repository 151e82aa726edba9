use crate::error::config_error;
use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutputInterval {
    Daily,
    Monthly,
    Yearly,
}

impl OutputInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "d",
            Self::Monthly => "m",
            Self::Yearly => "y",
        }
    }
}

impl fmt::Display for OutputInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputInterval {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "d" | "daily" => Ok(Self::Daily),
            "m" | "monthly" => Ok(Self::Monthly),
            "y" | "yearly" => Ok(Self::Yearly),
            other => Err(format!(
                "unsupported output_interval '{}' (expected d, m or y)",
                other
            )),
        }
    }
}

impl TryFrom<String> for OutputInterval {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutputInterval> for String {
    fn from(value: OutputInterval) -> Self {
        value.as_str().to_string()
    }
}

/// Simulation period forwarded to the project's configuration writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimPeriod {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_interval: Option<OutputInterval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub years_skip: Option<u32>,
}

impl SimPeriod {
    pub fn is_empty(&self) -> bool {
        self.start_date.is_none()
            && self.end_date.is_none()
            && self.output_interval.is_none()
            && self.years_skip.is_none()
    }

    pub fn has_dates(&self) -> bool {
        self.start_date.is_some() && self.end_date.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(config_error(format!(
                    "start_date {} is after end_date {}",
                    start, end
                )));
            }
            self.print_start(start, end)?;
        }
        Ok(())
    }

    /// First printed date: with `years_skip` the whole warm-up years are
    /// dropped and printing starts on January 1st.
    fn print_start(&self, start: NaiveDate, end: NaiveDate) -> Result<NaiveDate> {
        let skip = self.years_skip.unwrap_or(0);
        if skip == 0 {
            return Ok(start);
        }
        let first = i32::try_from(skip)
            .ok()
            .and_then(|skip| start.year().checked_add(skip))
            .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1))
            .ok_or_else(|| config_error(format!("years_skip {} overflows the calendar", skip)))?;
        if first > end {
            return Err(config_error(format!(
                "years_skip {} skips the whole period {} to {}",
                skip, start, end
            )));
        }
        Ok(first)
    }

    /// Dates of the printed time steps, or `None` when start/end are unknown.
    pub fn date_index(&self) -> Result<Option<Vec<NaiveDate>>> {
        let (Some(start), Some(end)) = (self.start_date, self.end_date) else {
            return Ok(None);
        };
        self.validate()?;
        let first = self.print_start(start, end)?;
        let mut dates = Vec::new();
        match self.output_interval.unwrap_or(OutputInterval::Daily) {
            OutputInterval::Daily => {
                let mut day = first;
                while day <= end {
                    dates.push(day);
                    match day.succ_opt() {
                        Some(next) => day = next,
                        None => break,
                    }
                }
            }
            OutputInterval::Monthly => {
                let (mut year, mut month) = (first.year(), first.month());
                while let Some(day) = NaiveDate::from_ymd_opt(year, month, 1) {
                    if day > end {
                        break;
                    }
                    dates.push(day);
                    if month == 12 {
                        year += 1;
                        month = 1;
                    } else {
                        month += 1;
                    }
                }
            }
            OutputInterval::Yearly => {
                for year in first.year()..=end.year() {
                    if let Some(day) = NaiveDate::from_ymd_opt(year, 1, 1) {
                        dates.push(day);
                    }
                }
            }
        }
        Ok(Some(dates))
    }
}
