//! ISO-8601 duration parsing for restriction windows.
//!
//! Restrictions express their window as an ISO-8601 duration string. This
//! parser accepts the `P[nY][nM][nD][T[nH][nM][nS]]` and `PnW` forms with
//! non-negative integer components and produces a millisecond window.
//!
//! Calendar units use fixed conversion factors (a year is 365 days, a month
//! 30 days): windows are retention horizons, not calendar arithmetic.

use thiserror::Error;

const MILLIS_PER_SECOND: u64 = 1_000;
const MILLIS_PER_MINUTE: u64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: u64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: u64 = 24 * MILLIS_PER_HOUR;
const MILLIS_PER_WEEK: u64 = 7 * MILLIS_PER_DAY;
const MILLIS_PER_MONTH: u64 = 30 * MILLIS_PER_DAY;
const MILLIS_PER_YEAR: u64 = 365 * MILLIS_PER_DAY;

/// Errors from parsing an ISO-8601 duration string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DurationError {
    /// The string does not start with the `P` designator.
    #[error("duration must start with 'P': {value:?}")]
    MissingDesignator {
        /// The rejected input.
        value: String,
    },

    /// The string carries no components (e.g. `P` or `PT`).
    #[error("duration has no components: {value:?}")]
    Empty {
        /// The rejected input.
        value: String,
    },

    /// A component is malformed or its designator is not recognized.
    #[error("invalid duration component {component:?} in {value:?}")]
    InvalidComponent {
        /// The rejected input.
        value: String,
        /// The component that failed to parse.
        component: String,
    },

    /// The duration does not fit in a `u64` millisecond count.
    #[error("duration overflows the millisecond range: {value:?}")]
    Overflow {
        /// The rejected input.
        value: String,
    },
}

/// Parses an ISO-8601 duration into a millisecond window.
///
/// # Errors
///
/// Returns a [`DurationError`] describing the first violation found.
pub fn parse_window(value: &str) -> Result<u64, DurationError> {
    let Some(body) = value.strip_prefix('P') else {
        return Err(DurationError::MissingDesignator {
            value: value.to_string(),
        });
    };
    if body.is_empty() {
        return Err(DurationError::Empty {
            value: value.to_string(),
        });
    }

    let mut millis: u64 = 0;
    let mut components = 0usize;
    let mut in_time = false;
    let mut digits = String::new();

    for ch in body.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if ch == 'T' {
            if !digits.is_empty() || in_time {
                return Err(DurationError::InvalidComponent {
                    value: value.to_string(),
                    component: "T".to_string(),
                });
            }
            in_time = true;
            continue;
        }
        let factor = match (ch, in_time) {
            ('Y', false) => MILLIS_PER_YEAR,
            ('W', false) => MILLIS_PER_WEEK,
            ('D', false) => MILLIS_PER_DAY,
            ('M', false) => MILLIS_PER_MONTH,
            ('H', true) => MILLIS_PER_HOUR,
            ('M', true) => MILLIS_PER_MINUTE,
            ('S', true) => MILLIS_PER_SECOND,
            _ => {
                return Err(DurationError::InvalidComponent {
                    value: value.to_string(),
                    component: format!("{digits}{ch}"),
                });
            }
        };
        let amount: u64 = digits.parse().map_err(|_| DurationError::InvalidComponent {
            value: value.to_string(),
            component: format!("{digits}{ch}"),
        })?;
        digits.clear();
        components += 1;
        millis = amount
            .checked_mul(factor)
            .and_then(|part| millis.checked_add(part))
            .ok_or_else(|| DurationError::Overflow {
                value: value.to_string(),
            })?;
    }

    if !digits.is_empty() {
        // Trailing digits with no designator.
        return Err(DurationError::InvalidComponent {
            value: value.to_string(),
            component: digits,
        });
    }
    if components == 0 {
        return Err(DurationError::Empty {
            value: value.to_string(),
        });
    }
    Ok(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_date_components() {
        assert_eq!(parse_window("P30D"), Ok(30 * MILLIS_PER_DAY));
        assert_eq!(parse_window("P2W"), Ok(2 * MILLIS_PER_WEEK));
        assert_eq!(
            parse_window("P1Y2M3D"),
            Ok(MILLIS_PER_YEAR + 2 * MILLIS_PER_MONTH + 3 * MILLIS_PER_DAY)
        );
    }

    #[test]
    fn parses_time_components() {
        assert_eq!(parse_window("PT1H"), Ok(MILLIS_PER_HOUR));
        assert_eq!(
            parse_window("PT1H30M15S"),
            Ok(MILLIS_PER_HOUR + 30 * MILLIS_PER_MINUTE + 15 * MILLIS_PER_SECOND)
        );
    }

    #[test]
    fn month_and_minute_disambiguate_on_time_designator() {
        assert_eq!(parse_window("P1M"), Ok(MILLIS_PER_MONTH));
        assert_eq!(parse_window("PT1M"), Ok(MILLIS_PER_MINUTE));
        assert_eq!(
            parse_window("P1MT1M"),
            Ok(MILLIS_PER_MONTH + MILLIS_PER_MINUTE)
        );
    }

    #[test]
    fn rejects_missing_designator() {
        assert!(matches!(
            parse_window("30D"),
            Err(DurationError::MissingDesignator { .. })
        ));
    }

    #[test]
    fn rejects_empty_durations() {
        assert!(matches!(parse_window("P"), Err(DurationError::Empty { .. })));
        assert!(matches!(
            parse_window("PT"),
            Err(DurationError::Empty { .. })
        ));
    }

    #[test]
    fn rejects_malformed_components() {
        assert!(matches!(
            parse_window("P30"),
            Err(DurationError::InvalidComponent { .. })
        ));
        assert!(matches!(
            parse_window("P30X"),
            Err(DurationError::InvalidComponent { .. })
        ));
        // Time designators are invalid in the date part.
        assert!(matches!(
            parse_window("P1H"),
            Err(DurationError::InvalidComponent { .. })
        ));
        // A second 'T' is invalid.
        assert!(matches!(
            parse_window("PT1HT1M"),
            Err(DurationError::InvalidComponent { .. })
        ));
    }

    #[test]
    fn rejects_overflow() {
        assert!(matches!(
            parse_window("P99999999999999999999Y"),
            Err(DurationError::InvalidComponent { .. }) | Err(DurationError::Overflow { .. })
        ));
        assert!(matches!(
            parse_window("P600000000Y"),
            Err(DurationError::Overflow { .. })
        ));
    }

    #[test]
    fn zero_components_are_allowed() {
        assert_eq!(parse_window("P0D"), Ok(0));
    }
}
