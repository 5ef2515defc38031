// Timer parsing and rule validation
//
// Accepted timer expressions:
// - cron with seconds (6 or 7 fields), e.g. "0 */5 * * * *"
// - classic 5-field cron, run at second 0
// - descriptors: @yearly @annually @monthly @weekly @daily @midnight @hourly
// - constant delays: "@every 1h30m", "@every 45s"

use crate::errors::ScheduleError;
use crate::models::{Rule, RunMode};
use chrono::{DateTime, Duration, Timelike, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// A compiled timer expression
#[derive(Debug, Clone)]
pub enum Timer {
    Cron(Box<CronSchedule>),
    Every(Duration),
}

impl Timer {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let expr = expression.trim();
        let invalid = |reason: String| ScheduleError::InvalidTimer {
            expression: expression.to_string(),
            reason,
        };

        if expr.is_empty() {
            return Err(invalid("empty expression".to_string()));
        }

        if let Some(rest) = expr.strip_prefix("@every") {
            let delay = parse_duration(rest.trim()).map_err(invalid)?;
            return Ok(Timer::Every(delay));
        }

        let normalized = match expr {
            "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
            "@monthly" => "0 0 0 1 * *".to_string(),
            "@weekly" => "0 0 0 * * Sun".to_string(),
            "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
            "@hourly" => "0 0 * * * *".to_string(),
            other if other.split_whitespace().count() == 5 => format!("0 {}", other),
            other => other.to_string(),
        };

        CronSchedule::from_str(&normalized)
            .map(|schedule| Timer::Cron(Box::new(schedule)))
            .map_err(|e| invalid(e.to_string()))
    }

    /// First fire strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Timer::Cron(schedule) => schedule.after(&after).next(),
            Timer::Every(delay) => {
                let truncated = after.with_nanosecond(0).unwrap_or(after);
                Some(truncated + *delay)
            }
        }
    }

    /// Next fire after now, or an error when the timer is exhausted
    pub fn next_fire(&self, expression: &str) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after(Utc::now())
            .ok_or_else(|| ScheduleError::NoNextFire(expression.to_string()))
    }
}

/// Longest accepted `@every` delay
const MAX_EVERY_MS: i64 = 366 * 24 * 3_600_000;

/// Parse "1h30m", "45s", "500ms" style durations; sub-second delays round up to 1s
fn parse_duration(input: &str) -> Result<Duration, String> {
    if input.is_empty() {
        return Err("missing duration after @every".to_string());
    }

    let mut total_ms: i64 = 0;
    let mut digits = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: i64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{}'", input))?;
        digits.clear();

        let unit_ms = match c {
            'h' => 3_600_000,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            'm' => 60_000,
            's' => 1_000,
            other => return Err(format!("unknown duration unit '{}'", other)),
        };
        total_ms = value
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .filter(|ms| *ms <= MAX_EVERY_MS)
            .ok_or_else(|| format!("duration '{}' exceeds 366 days", input))?;
    }
    if !digits.is_empty() {
        return Err(format!("missing unit in duration '{}'", input));
    }
    if total_ms <= 0 {
        return Err(format!("duration '{}' must be positive", input));
    }

    let seconds = (total_ms + 999) / 1000;
    Ok(Duration::seconds(seconds))
}

impl Rule {
    /// Cycle rules need a parseable timer; once rules must not carry one
    pub fn valid(&self) -> Result<(), ScheduleError> {
        match self.mode {
            RunMode::Cycle => {
                if self.timer.trim().is_empty() {
                    return Err(ScheduleError::MissingTimer(self.mode.to_string()));
                }
                Timer::parse(&self.timer).map(|_| ())
            }
            RunMode::OnlyOnce | RunMode::ManyOnce => {
                if self.timer.trim().is_empty() {
                    Ok(())
                } else {
                    Err(ScheduleError::UnexpectedTimer(self.mode.to_string()))
                }
            }
        }
    }

    /// Compiled timer of a cycle rule
    pub fn compiled_timer(&self) -> Result<Option<Timer>, ScheduleError> {
        if self.mode != RunMode::Cycle {
            return Ok(None);
        }
        if self.timer.trim().is_empty() {
            return Err(ScheduleError::MissingTimer(self.mode.to_string()));
        }
        Timer::parse(&self.timer).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn rule(mode: RunMode, timer: &str) -> Rule {
        Rule {
            id: "r1".to_string(),
            mode,
            timer: timer.to_string(),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_cycle_rule_requires_timer() {
        let err = rule(RunMode::Cycle, "").valid().unwrap_err();
        assert_eq!(err, ScheduleError::MissingTimer("cycle".to_string()));
        assert_eq!(err.to_string(), "job rule mode(cycle) timer can not be empty");
    }

    #[test]
    fn test_cycle_rule_rejects_garbage_timer() {
        let err = rule(RunMode::Cycle, "every tuesday").valid().unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidTimer { .. }));
    }

    #[test]
    fn test_once_rules_reject_timer() {
        assert!(rule(RunMode::OnlyOnce, "").valid().is_ok());
        assert!(rule(RunMode::ManyOnce, "").valid().is_ok());
        assert!(matches!(
            rule(RunMode::OnlyOnce, "0 * * * * *").valid(),
            Err(ScheduleError::UnexpectedTimer(_))
        ));
    }

    #[test]
    fn test_six_and_five_field_cron() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 30).unwrap();

        let six = Timer::parse("0 */5 * * * *").unwrap();
        assert_eq!(
            six.next_after(base).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 5, 0).unwrap()
        );

        let five = Timer::parse("*/5 * * * *").unwrap();
        assert_eq!(five.next_after(base), six.next_after(base));
    }

    #[test]
    fn test_descriptors() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap();
        let hourly = Timer::parse("@hourly").unwrap();
        assert_eq!(
            hourly.next_after(base).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()
        );
        let daily = Timer::parse("@daily").unwrap();
        assert_eq!(
            daily.next_after(base).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_every_durations() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let timer = Timer::parse("@every 1h30m").unwrap();
        assert_eq!(
            timer.next_after(base).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 11, 30, 0).unwrap()
        );

        let short = Timer::parse("@every 500ms").unwrap();
        assert_eq!(short.next_after(base).unwrap(), base + Duration::seconds(1));

        assert!(Timer::parse("@every").is_err());
        assert!(Timer::parse("@every 10").is_err());
        assert!(Timer::parse("@every 3d").is_err());
    }

    #[test]
    fn test_every_rejects_oversized_durations() {
        assert!(Timer::parse("@every 9223372036854775807s").is_err());
        assert!(Timer::parse("@every 99999999999999999999s").is_err());
        assert!(Timer::parse("@every 8784h1s").is_err());
        assert!(Timer::parse("@every 8784h").is_ok());

        let err = rule(RunMode::Cycle, "@every 2562047788015215h")
            .valid()
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidTimer { .. }));
    }

    #[test]
    fn test_compiled_timer_only_for_cycle() {
        assert!(rule(RunMode::ManyOnce, "").compiled_timer().unwrap().is_none());
        assert!(rule(RunMode::Cycle, "@every 10s")
            .compiled_timer()
            .unwrap()
            .is_some());
    }
}
