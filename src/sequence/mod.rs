//! Outreach sequence model: prospects, step keys, steps, and time slots.

pub mod admission;
pub mod composer;
pub mod eligibility;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{MalformedScheduleError, StepKeyError};

// ── Step keys ───────────────────────────────────────────────────────

/// Identifier of a step within a sequence.
///
/// Keeps the original key text (`email_1`, `2_email`, ...) alongside the
/// integer ordinal parsed from it. Ordering and equality go through the
/// ordinal so `email_10` sorts after `email_2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StepKey {
    raw: String,
    ordinal: u32,
}

impl StepKey {
    /// Parse a key, taking the first run of ASCII digits as its ordinal.
    pub fn parse(raw: &str) -> Result<Self, StepKeyError> {
        let digits: String = raw
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();

        match digits.parse::<u32>() {
            Ok(ordinal) if ordinal >= 1 => Ok(Self {
                raw: raw.to_string(),
                ordinal,
            }),
            _ => Err(StepKeyError {
                key: raw.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// The thread root (first step) of a sequence.
    pub fn is_root(&self) -> bool {
        self.ordinal == 1
    }
}

impl PartialEq for StepKey {
    fn eq(&self, other: &Self) -> bool {
        self.ordinal == other.ordinal
    }
}

impl Eq for StepKey {}

impl PartialOrd for StepKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StepKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal.cmp(&other.ordinal)
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for StepKey {
    type Error = StepKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StepKey> for String {
    fn from(key: StepKey) -> Self {
        key.raw
    }
}

// ── Time slots ──────────────────────────────────────────────────────

/// One-hour scheduling slot within a week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeSlot {
    pub day: Weekday,
    pub hour: u8,
}

impl TimeSlot {
    pub fn new(day: Weekday, hour: u8) -> Self {
        debug_assert!(hour < 24);
        Self { day, hour }
    }

    /// Slot containing the given instant, in that instant's time zone.
    pub fn containing<Tz: chrono::TimeZone>(instant: &DateTime<Tz>) -> Self {
        Self {
            day: instant.weekday(),
            hour: instant.hour() as u8,
        }
    }

    /// The following hour. 23:00 rolls to 00:00 of the next weekday.
    pub fn next(self) -> Self {
        if self.hour >= 23 {
            Self {
                day: self.day.succ(),
                hour: 0,
            }
        } else {
            Self {
                day: self.day,
                hour: self.hour + 1,
            }
        }
    }

    /// Parse the stored day/hour text of a step.
    pub fn parse(day: Option<&str>, hour: Option<&str>) -> Result<Self, MalformedScheduleError> {
        let day = day
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or(MalformedScheduleError::MissingDay)?;
        let hour = hour
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(MalformedScheduleError::MissingHour)?;

        let day: Weekday = day
            .parse()
            .map_err(|_| MalformedScheduleError::InvalidDay(day.to_string()))?;

        Ok(Self {
            day,
            hour: parse_hour(hour)?,
        })
    }

    /// Full English weekday name, as stored (`Monday`).
    pub fn day_name(&self) -> &'static str {
        match self.day {
            Weekday::Mon => "Monday",
            Weekday::Tue => "Tuesday",
            Weekday::Wed => "Wednesday",
            Weekday::Thu => "Thursday",
            Weekday::Fri => "Friday",
            Weekday::Sat => "Saturday",
            Weekday::Sun => "Sunday",
        }
    }

    /// Zero-padded hour, as stored (`09:00`).
    pub fn hour_label(&self) -> String {
        format!("{:02}:00", self.hour)
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02}:00", self.day_name(), self.hour)
    }
}

/// Accepts `HH:00`, `H:00` and bare `HH`. Slots are whole hours only.
fn parse_hour(text: &str) -> Result<u8, MalformedScheduleError> {
    let invalid = || MalformedScheduleError::InvalidHour(text.to_string());

    let (hours, minutes) = match text.split_once(':') {
        Some((h, m)) => (h, Some(m)),
        None => (text, None),
    };

    if let Some(m) = minutes
        && m.parse::<u32>().map_err(|_| invalid())? != 0
    {
        return Err(invalid());
    }

    let hour: u8 = hours.parse().map_err(|_| invalid())?;
    if hour > 23 {
        return Err(invalid());
    }
    Ok(hour)
}

// ── Steps ───────────────────────────────────────────────────────────

/// Stored day/hour of a step, exactly as onboarding wrote it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTime {
    pub day: Option<String>,
    pub hour: Option<String>,
}

impl StepTime {
    pub fn at(slot: TimeSlot) -> Self {
        Self {
            day: Some(slot.day_name().to_string()),
            hour: Some(slot.hour_label()),
        }
    }
}

/// One scheduled message within a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub subject: String,
    pub body: String,
    pub time: StepTime,
    #[serde(default)]
    pub sent: bool,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub opened: bool,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
}

impl Step {
    /// A fresh, unsent step scheduled at `slot`.
    pub fn new(subject: impl Into<String>, body: impl Into<String>, slot: TimeSlot) -> Self {
        Self::with_time(subject, body, StepTime::at(slot))
    }

    /// A fresh, unsent step with raw schedule text.
    pub fn with_time(subject: impl Into<String>, body: impl Into<String>, time: StepTime) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            time,
            sent: false,
            message_id: None,
            sent_at: None,
            opened: false,
            opened_at: None,
        }
    }

    pub fn schedule(&self) -> Result<TimeSlot, MalformedScheduleError> {
        TimeSlot::parse(self.time.day.as_deref(), self.time.hour.as_deref())
    }
}

/// Steps of one prospect, ordered by step ordinal.
pub type Sequence = BTreeMap<StepKey, Step>;

/// A recipient with their outreach sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prospect {
    pub id: String,
    pub email: String,
    /// Sender identity the sequence goes out through.
    pub my_email: String,
    pub sequence: Sequence,
}

impl Prospect {
    pub fn new(id: impl Into<String>, email: impl Into<String>, my_email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            my_email: my_email.into(),
            sequence: Sequence::new(),
        }
    }

    pub fn with_step(mut self, key: StepKey, step: Step) -> Self {
        self.sequence.insert(key, step);
        self
    }

    /// The thread root: the step with ordinal 1.
    pub fn root_step(&self) -> Option<&Step> {
        self.sequence
            .iter()
            .find(|(key, _)| key.is_root())
            .map(|(_, step)| step)
    }

    /// True once every step has been sent.
    pub fn is_complete(&self) -> bool {
        self.sequence.values().all(|s| s.sent)
    }
}

// ── Step updates ────────────────────────────────────────────────────

/// A single field change applied to a stored step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepUpdate {
    Sent(bool),
    MessageId(String),
    SentAt(DateTime<Utc>),
    Opened(bool),
    OpenedAt(DateTime<Utc>),
    Reschedule(TimeSlot),
}

/// Condition a stored step must satisfy for an update to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Unsent,
    Sent,
}

/// Result of a conditional step update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The step exists but the precondition did not hold.
    PreconditionFailed,
    NotFound,
}

// ── Status log ──────────────────────────────────────────────────────

/// Category of a send attempt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    SendError,
    DbUpdateError,
    CronError,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::SendError => "send_error",
            StatusKind::DbUpdateError => "db_update_error",
            StatusKind::CronError => "cron_error",
        }
    }
}

impl std::str::FromStr for StatusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_error" => Ok(StatusKind::SendError),
            "db_update_error" => Ok(StatusKind::DbUpdateError),
            "cron_error" => Ok(StatusKind::CronError),
            other => Err(format!("unknown status kind: {other}")),
        }
    }
}

/// Append-only diagnostic record of a failed send, write, or tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: StatusKind,
    pub email: Option<String>,
    pub step_key: Option<String>,
    pub error: String,
}

impl StatusRecord {
    pub fn new(kind: StatusKind, error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            email: None,
            step_key: None,
            error: error.into(),
        }
    }

    pub fn for_step(mut self, email: &str, step_key: &StepKey) -> Self {
        self.email = Some(email.to_string());
        self.step_key = Some(step_key.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> StepKey {
        StepKey::parse(raw).unwrap()
    }

    #[test]
    fn step_key_parses_ordinal_from_either_side() {
        assert_eq!(key("email_1").ordinal(), 1);
        assert_eq!(key("2_email").ordinal(), 2);
        assert_eq!(key("step-10").ordinal(), 10);
        assert_eq!(key("email_3").as_str(), "email_3");
    }

    #[test]
    fn step_key_rejects_missing_or_zero_ordinal() {
        assert!(StepKey::parse("email").is_err());
        assert!(StepKey::parse("email_0").is_err());
        assert!(StepKey::parse("").is_err());
    }

    #[test]
    fn step_keys_sort_numerically() {
        let mut keys = vec![key("email_10"), key("email_2"), key("email_1")];
        keys.sort();
        let ordinals: Vec<u32> = keys.iter().map(StepKey::ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 10]);
        assert!("email_10" < "email_2");
    }

    #[test]
    fn sequence_iterates_in_ordinal_order() {
        let slot = TimeSlot::new(Weekday::Mon, 9);
        let prospect = Prospect::new("p1", "a@x.com", "me@y.com")
            .with_step(key("email_10"), Step::new("ten", "b", slot))
            .with_step(key("email_2"), Step::new("two", "b", slot))
            .with_step(key("email_1"), Step::new("one", "b", slot));

        let subjects: Vec<&str> = prospect
            .sequence
            .values()
            .map(|s| s.subject.as_str())
            .collect();
        assert_eq!(subjects, vec!["one", "two", "ten"]);
        assert_eq!(prospect.root_step().unwrap().subject, "one");
    }

    #[test]
    fn prospect_completes_when_every_step_is_sent() {
        let slot = TimeSlot::new(Weekday::Mon, 9);
        let mut prospect = Prospect::new("p1", "a@x.com", "me@y.com")
            .with_step(key("email_1"), Step::new("one", "b", slot))
            .with_step(key("email_2"), Step::new("two", "b", slot));
        assert!(!prospect.is_complete());

        for step in prospect.sequence.values_mut() {
            step.sent = true;
        }
        assert!(prospect.is_complete());
    }

    #[test]
    fn slot_parses_stored_format() {
        let slot = TimeSlot::parse(Some("Monday"), Some("09:00")).unwrap();
        assert_eq!(slot, TimeSlot::new(Weekday::Mon, 9));
        assert_eq!(slot.day_name(), "Monday");
        assert_eq!(slot.hour_label(), "09:00");

        assert_eq!(
            TimeSlot::parse(Some("tue"), Some("7")).unwrap(),
            TimeSlot::new(Weekday::Tue, 7)
        );
    }

    #[test]
    fn slot_parse_reports_malformed_fields() {
        assert_eq!(
            TimeSlot::parse(None, Some("09:00")),
            Err(MalformedScheduleError::MissingDay)
        );
        assert_eq!(
            TimeSlot::parse(Some("Monday"), Some("")),
            Err(MalformedScheduleError::MissingHour)
        );
        assert!(matches!(
            TimeSlot::parse(Some("Someday"), Some("09:00")),
            Err(MalformedScheduleError::InvalidDay(_))
        ));
        assert!(matches!(
            TimeSlot::parse(Some("Monday"), Some("24:00")),
            Err(MalformedScheduleError::InvalidHour(_))
        ));
        assert!(matches!(
            TimeSlot::parse(Some("Monday"), Some("09:30")),
            Err(MalformedScheduleError::InvalidHour(_))
        ));
    }

    #[test]
    fn next_slot_wraps_to_following_day() {
        assert_eq!(
            TimeSlot::new(Weekday::Mon, 9).next(),
            TimeSlot::new(Weekday::Mon, 10)
        );
        assert_eq!(
            TimeSlot::new(Weekday::Mon, 23).next(),
            TimeSlot::new(Weekday::Tue, 0)
        );
        assert_eq!(
            TimeSlot::new(Weekday::Sun, 23).next(),
            TimeSlot::new(Weekday::Mon, 0)
        );
    }

    #[test]
    fn status_kind_roundtrip() {
        for kind in [
            StatusKind::SendError,
            StatusKind::DbUpdateError,
            StatusKind::CronError,
        ] {
            assert_eq!(kind.as_str().parse::<StatusKind>().unwrap(), kind);
        }
    }
}
