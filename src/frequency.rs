use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};

use crate::error::RowPulseError;

/// Unit of a recurrence expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl IntervalUnit {
    fn parse(s: &str) -> Option<Self> {
        // Accept singular and plural ("1 hour", "2 hours")
        let s = s.trim().to_ascii_lowercase();
        let s = s.strip_suffix('s').unwrap_or(&s);
        match s {
            "second" | "sec" => Some(Self::Seconds),
            "minute" | "min" => Some(Self::Minutes),
            "hour" => Some(Self::Hours),
            "day" => Some(Self::Days),
            "week" => Some(Self::Weeks),
            "month" => Some(Self::Months),
            "year" => Some(Self::Years),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Weeks => "weeks",
            Self::Months => "months",
            Self::Years => "years",
        }
    }
}

/// Recurrence expression of a cursor alert, written like a SQLite date
/// modifier: `"+5 minutes"`, `"+1 hour"`, `"30 seconds"`, `"+1 month"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frequency {
    value: i64,
    unit: IntervalUnit,
}

impl Frequency {
    pub fn new(value: i64, unit: IntervalUnit) -> Result<Self, RowPulseError> {
        if value <= 0 {
            return Err(RowPulseError::Validation(format!(
                "Frequency must be positive, got: {}",
                value
            )));
        }
        Ok(Self { value, unit })
    }

    /// The first deadline after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, RowPulseError> {
        let overflow = || RowPulseError::Error(format!("Frequency '{}' overflows", self));

        let fixed = |seconds_per_unit: i64| -> Result<DateTime<Utc>, RowPulseError> {
            let seconds = self.value.checked_mul(seconds_per_unit).ok_or_else(overflow)?;
            let delta = Duration::try_seconds(seconds).ok_or_else(overflow)?;
            from.checked_add_signed(delta).ok_or_else(overflow)
        };

        match self.unit {
            IntervalUnit::Seconds => fixed(1),
            IntervalUnit::Minutes => fixed(60),
            IntervalUnit::Hours => fixed(3600),
            IntervalUnit::Days => fixed(86400),
            IntervalUnit::Weeks => fixed(604800),
            IntervalUnit::Months | IntervalUnit::Years => {
                let months = if self.unit == IntervalUnit::Years {
                    self.value.checked_mul(12).ok_or_else(overflow)?
                } else {
                    self.value
                };
                let months = u32::try_from(months).map_err(|_| overflow())?;
                from.checked_add_months(Months::new(months))
                    .ok_or_else(overflow)
            }
        }
    }
}

impl FromStr for Frequency {
    type Err = RowPulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            RowPulseError::Validation(format!(
                "Invalid frequency '{}': expected e.g. '+5 minutes'",
                s
            ))
        };

        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
        let mut parts = trimmed.split_whitespace();

        let value: i64 = parts
            .next()
            .ok_or_else(invalid)?
            .parse()
            .map_err(|_| invalid())?;
        let unit = parts
            .next()
            .and_then(IntervalUnit::parse)
            .ok_or_else(invalid)?;

        if parts.next().is_some() {
            return Err(invalid());
        }

        Frequency::new(value, unit)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{} {}", self.value, self.unit.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 31, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(
            "+5 minutes".parse::<Frequency>().unwrap(),
            Frequency::new(5, IntervalUnit::Minutes).unwrap()
        );
        assert_eq!(
            "1 hour".parse::<Frequency>().unwrap(),
            Frequency::new(1, IntervalUnit::Hours).unwrap()
        );
        assert_eq!(
            "  +30 SECONDS ".parse::<Frequency>().unwrap(),
            Frequency::new(30, IntervalUnit::Seconds).unwrap()
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Frequency>().is_err());
        assert!("+5".parse::<Frequency>().is_err());
        assert!("+5 fortnights".parse::<Frequency>().is_err());
        assert!("+0 minutes".parse::<Frequency>().is_err());
        assert!("-1 day".parse::<Frequency>().is_err());
        assert!("+1 day later".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_next_after_fixed_units() {
        let f: Frequency = "+90 seconds".parse().unwrap();
        assert_eq!(
            f.next_after(base_time()).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 31, 10, 31, 30).unwrap()
        );

        let f: Frequency = "+2 weeks".parse().unwrap();
        assert_eq!(
            f.next_after(base_time()).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 14, 10, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_next_after_month_clamps_to_month_end() {
        let f: Frequency = "+1 month".parse().unwrap();
        assert_eq!(
            f.next_after(base_time()).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 28, 10, 30, 0).unwrap()
        );

        let f: Frequency = "+1 year".parse().unwrap();
        assert_eq!(
            f.next_after(base_time()).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 31, 10, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_display_round_trips() {
        let f: Frequency = "3 hour".parse().unwrap();
        assert_eq!(f.to_string(), "+3 hours");
        assert_eq!(f.to_string().parse::<Frequency>().unwrap(), f);
    }
}
