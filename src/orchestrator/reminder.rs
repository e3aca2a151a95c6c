//! Critical-reminder dual-write tracking.
//!
//! A persist-note invocation with `is_critical = true` and a due time must be
//! accompanied, within the same turn, by a device-alarm invocation whose timestamp
//! falls in `[due - lead, due]`.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityNames;
use crate::types::CapabilityInvocation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ContractViolation {
    /// A critical note was saved but no device alarm was requested.
    MissingAlarm { title: String },
    /// The alarm does not ring between `due - lead` and `due`.
    AlarmOutsideWindow {
        title: String,
        due: String,
        alarm: String,
    },
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractViolation::MissingAlarm { title } => {
                write!(f, "critical note '{title}' saved without a device alarm")
            }
            ContractViolation::AlarmOutsideWindow { title, due, alarm } => {
                write!(f, "alarm for '{title}' at {alarm} is outside the window before {due}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CriticalNote {
    title: String,
    due: Option<DateTime<FixedOffset>>,
}

pub struct ReminderTracker {
    persist_note: String,
    critical_alarm: String,
    lead: Duration,
    local_time: Option<DateTime<FixedOffset>>,
    notes: Vec<CriticalNote>,
    alarms: Vec<Option<i64>>,
}

impl ReminderTracker {
    pub fn new(
        names: &CapabilityNames,
        lead_minutes: i64,
        local_time: Option<DateTime<FixedOffset>>,
    ) -> Self {
        Self {
            persist_note: names.persist_note.clone(),
            critical_alarm: names.critical_alarm.clone(),
            lead: Duration::try_minutes(lead_minutes).unwrap_or_else(Duration::zero),
            local_time,
            notes: Vec::new(),
            alarms: Vec::new(),
        }
    }

    pub fn observe(&mut self, invocation: &CapabilityInvocation) {
        if invocation.name == self.persist_note {
            if let Some(note) = self.critical_note(&invocation.arguments) {
                self.notes.push(note);
            }
        } else if invocation.name == self.critical_alarm {
            self.alarms
                .push(invocation.arguments.get("timestamp").and_then(timestamp_ms));
        }
    }

    pub fn observe_all<'a>(&mut self, invocations: impl IntoIterator<Item = &'a CapabilityInvocation>) {
        for invocation in invocations {
            self.observe(invocation);
        }
    }

    /// Critical notes still waiting for their alarm.
    pub fn missing_alarms(&self) -> usize {
        self.notes.len().saturating_sub(self.alarms.len())
    }

    pub fn has_critical_notes(&self) -> bool {
        !self.notes.is_empty()
    }

    /// Notes and alarms are paired in the order they were requested.
    pub fn violations(&self) -> Vec<ContractViolation> {
        let mut violations = Vec::new();
        for (i, note) in self.notes.iter().enumerate() {
            let Some(alarm) = self.alarms.get(i) else {
                violations.push(ContractViolation::MissingAlarm {
                    title: note.title.clone(),
                });
                continue;
            };
            let Some(due) = note.due else {
                continue;
            };
            let Some(alarm_ms) = *alarm else {
                violations.push(ContractViolation::AlarmOutsideWindow {
                    title: note.title.clone(),
                    due: due.to_rfc3339(),
                    alarm: "unreadable timestamp".into(),
                });
                continue;
            };
            let Some(earliest) = due.checked_sub_signed(self.lead) else {
                continue;
            };
            let earliest = earliest.timestamp_millis();
            let latest = due.timestamp_millis();
            if alarm_ms < earliest || alarm_ms > latest {
                let alarm_at = DateTime::from_timestamp_millis(alarm_ms)
                    .map(|t| t.with_timezone(due.offset()).to_rfc3339())
                    .unwrap_or_else(|| alarm_ms.to_string());
                violations.push(ContractViolation::AlarmOutsideWindow {
                    title: note.title.clone(),
                    due: due.to_rfc3339(),
                    alarm: alarm_at,
                });
            }
        }
        violations
    }

    fn critical_note(&self, arguments: &serde_json::Value) -> Option<CriticalNote> {
        if !arguments.get("is_critical").is_some_and(truthy) {
            return None;
        }
        let due_date = non_empty_str(arguments, "due_date");
        let due_time = non_empty_str(arguments, "due_time");
        if due_date.is_none() && due_time.is_none() {
            return None;
        }
        let title = non_empty_str(arguments, "title").unwrap_or("reminder").to_string();
        Some(CriticalNote {
            title,
            due: resolve_due(due_date, due_time, self.local_time),
        })
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn non_empty_str<'a>(arguments: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Epoch milliseconds; second-resolution values are scaled up. Values no
/// `DateTime` can represent are treated as absent.
fn timestamp_ms(value: &serde_json::Value) -> Option<i64> {
    let raw = match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(float_ms)),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    let ms = if raw.unsigned_abs() < 100_000_000_000 {
        raw.checked_mul(1000)?
    } else {
        raw
    };
    DateTime::from_timestamp_millis(ms).map(|_| ms)
}

fn float_ms(f: f64) -> Option<i64> {
    (f.is_finite() && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// Accepts `21:00`, `21:00:00`, `9 PM`, `9:30pm`.
pub fn parse_clock(text: &str) -> Option<NaiveTime> {
    let lower = text.trim().to_ascii_lowercase();
    let (body, meridiem) = if let Some(b) = lower.strip_suffix("pm") {
        (b.trim(), Some(true))
    } else if let Some(b) = lower.strip_suffix("am") {
        (b.trim(), Some(false))
    } else {
        (lower.as_str(), None)
    };

    let mut parts = body.split(':');
    let hour: u32 = parts.next()?.trim().parse().ok()?;
    let minute: u32 = match parts.next() {
        Some(m) => m.trim().parse().ok()?,
        None => 0,
    };
    let second: u32 = match parts.next() {
        Some(s) => s.trim().parse().ok()?,
        None => 0,
    };

    let hour = match meridiem {
        Some(pm) => {
            if hour == 0 || hour > 12 {
                return None;
            }
            match (pm, hour) {
                (true, 12) => 12,
                (true, h) => h + 12,
                (false, 12) => 0,
                (false, h) => h,
            }
        }
        None => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, second)
}

/// Due instant in the client's offset. Needs the client local time unless
/// `due_date` is itself a full RFC 3339 timestamp.
fn resolve_due(
    due_date: Option<&str>,
    due_time: Option<&str>,
    local_time: Option<DateTime<FixedOffset>>,
) -> Option<DateTime<FixedOffset>> {
    if let Some(full) = due_date.and_then(|d| DateTime::parse_from_rfc3339(d).ok()) {
        return Some(full);
    }
    let now = local_time?;
    let date = match due_date {
        Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()?,
        None => now.date_naive(),
    };
    let time = match due_time {
        Some(t) => parse_clock(t)?,
        None => NaiveTime::from_hms_opt(9, 0, 0)?,
    };
    now.offset()
        .from_local_datetime(&date.and_time(time))
        .single()
}
