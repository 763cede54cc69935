//! Recurring weekly blackout windows
//!
//! Schedules live in `schedules.json` in the data directory as
//! `{"schedules": [{id, name, days, start, end, enabled}]}`. Days count from
//! 0 = Monday; `start` and `end` are `HH:MM` local time. A schedule covers
//! `start <= now < end` on each listed day at minute resolution and never
//! crosses midnight.

use crate::core::atomic::{WriteOptions, write_atomic};
use crate::core::error::{Error, Result};
use crate::validators::validate_label;
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

const DAY_NAMES: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&text, "%H:%M").map_err(serde::de::Error::custom)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub days: Vec<u8>,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

impl Schedule {
    /// Whether the window is open at `now`.
    pub fn is_active_at(&self, now: DateTime<Local>) -> bool {
        if !self.enabled {
            return false;
        }
        let weekday = u8::try_from(now.weekday().num_days_from_monday()).unwrap_or(u8::MAX);
        if !self.days.contains(&weekday) {
            return false;
        }
        let minute = minute_of_day(now.time());
        minute_of_day(self.start) <= minute && minute < minute_of_day(self.end)
    }

    /// Whole minutes from `now` until today's `end`; 0 once past it.
    pub fn remaining_minutes(&self, now: DateTime<Local>) -> u32 {
        minute_of_day(self.end).saturating_sub(minute_of_day(now.time()))
    }

    /// `mon,wed 21:00-23:00` style summary.
    pub fn describe(&self) -> String {
        let days: Vec<&str> = self
            .days
            .iter()
            .filter_map(|d| DAY_NAMES.get(usize::from(*d)).and_then(|n| n.get(..3)))
            .collect();
        format!(
            "{} {}-{}",
            days.join(","),
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

fn invalid(field: &str, message: impl Into<String>) -> Error {
    Error::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Parses `daily`, `weekdays`, `weekend`, or a comma list of day names
/// (`mon`, `monday`, ...) and numbers 0-6. Returns sorted, unique days.
///
/// # Errors
///
/// `Validation` for an unknown day or an empty list.
pub fn parse_days(input: &str) -> Result<Vec<u8>> {
    let input = input.trim().to_ascii_lowercase();
    let mut days: Vec<u8> = match input.as_str() {
        "daily" | "every day" => (0..7).collect(),
        "weekdays" => (0..5).collect(),
        "weekend" | "weekends" => vec![5, 6],
        list => {
            let mut days = Vec::new();
            for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let day = if let Ok(n) = part.parse::<u8>() {
                    n
                } else {
                    DAY_NAMES
                        .iter()
                        .position(|name| part.len() >= 3 && name.starts_with(part))
                        .and_then(|i| u8::try_from(i).ok())
                        .ok_or_else(|| invalid("days", format!("unknown day '{part}'")))?
                };
                if day > 6 {
                    return Err(invalid("days", format!("day {day} is out of range 0-6")));
                }
                days.push(day);
            }
            days
        }
    };
    days.sort_unstable();
    days.dedup();
    if days.is_empty() {
        return Err(invalid("days", "at least one day is required"));
    }
    Ok(days)
}

/// # Errors
///
/// `Validation` unless `input` is `HH:MM`.
pub fn parse_time(input: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(input.trim(), "%H:%M")
        .map_err(|_| invalid("time", format!("'{input}' is not HH:MM")))
}

fn slug(name: &str) -> String {
    let mut slug = String::new();
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "schedule".to_string()
    } else {
        slug.to_string()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    schedules: Vec<Schedule>,
}

#[derive(Debug, Default)]
struct Fired {
    date: Option<NaiveDate>,
    ids: HashSet<String>,
}

/// The schedule list on disk plus which schedules already fired today.
#[derive(Debug)]
pub struct ScheduleStore {
    path: PathBuf,
    fired: Mutex<Fired>,
}

impl ScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fired: Mutex::new(Fired::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty list; so is a corrupt one, with a warning.
    pub fn load(&self) -> Vec<Schedule> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Failed to read schedules {:?}: {}", self.path, e);
                return Vec::new();
            }
        };
        match serde_json::from_str::<ScheduleFile>(&json) {
            Ok(file) => file.schedules,
            Err(e) => {
                warn!("Schedule file {:?} is corrupt: {}", self.path, e);
                Vec::new()
            }
        }
    }

    fn save(&self, schedules: &[Schedule]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::utils::create_private_dir(parent).map_err(|e| Error::from_io(e, parent))?;
        }
        let json = serde_json::to_string_pretty(&ScheduleFile {
            schedules: schedules.to_vec(),
        })?;
        write_atomic(&self.path, &json, &WriteOptions::default())?;
        Ok(())
    }

    /// Adds an enabled schedule. Its id is derived from `name` and made
    /// unique with a numeric suffix.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad name, no days, a day outside 0-6, or
    /// `start >= end`; write failures.
    pub fn add(&self, name: &str, days: &[u8], start: NaiveTime, end: NaiveTime) -> Result<Schedule> {
        let name = validate_label(name).map_err(|message| invalid("name", message))?;
        if days.is_empty() {
            return Err(invalid("days", "at least one day is required"));
        }
        if let Some(day) = days.iter().find(|d| **d > 6) {
            return Err(invalid("days", format!("day {day} is out of range 0-6")));
        }
        if minute_of_day(start) >= minute_of_day(end) {
            return Err(invalid("end", "end must be later than start on the same day"));
        }

        let mut schedules = self.load();
        let base = slug(&name);
        let mut id = base.clone();
        let mut n = 2;
        while schedules.iter().any(|s| s.id == id) {
            id = format!("{base}-{n}");
            n += 1;
        }

        let mut days = days.to_vec();
        days.sort_unstable();
        days.dedup();
        let schedule = Schedule {
            id,
            name,
            days,
            start,
            end,
            enabled: true,
        };
        schedules.push(schedule.clone());
        self.save(&schedules)?;
        info!("Added schedule {} ({})", schedule.id, schedule.describe());
        Ok(schedule)
    }

    /// Returns whether a schedule with `id` existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated list cannot be saved.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut schedules = self.load();
        let before = schedules.len();
        schedules.retain(|s| s.id != id);
        if schedules.len() == before {
            return Ok(false);
        }
        self.save(&schedules)?;
        info!("Removed schedule {}", id);
        Ok(true)
    }

    /// Returns whether a schedule with `id` existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated list cannot be saved.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let mut schedules = self.load();
        let Some(schedule) = schedules.iter_mut().find(|s| s.id == id) else {
            return Ok(false);
        };
        schedule.enabled = enabled;
        self.save(&schedules)?;
        info!("Schedule {} {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(true)
    }

    /// The first schedule open at `now` that has not fired on this date,
    /// with its remaining minutes. It is marked as fired, so each schedule
    /// starts at most one blackout per day.
    pub fn take_due(&self, now: DateTime<Local>) -> Option<(Schedule, u32)> {
        let schedules = self.load();
        let mut fired = self
            .fired
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let today = now.date_naive();
        if fired.date != Some(today) {
            fired.date = Some(today);
            fired.ids.clear();
        }

        let due = schedules.into_iter().find_map(|s| {
            let remaining = s.remaining_minutes(now);
            (s.is_active_at(now) && remaining > 0 && !fired.ids.contains(&s.id))
                .then_some((s, remaining))
        })?;
        fired.ids.insert(due.0.id.clone());
        Some(due)
    }
}
