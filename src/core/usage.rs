//! Daily usage ledgers
//!
//! One small JSON file per platform records how many seconds were spent on
//! it during the current *logical day*. The day rolls over at the configured
//! reset hour instead of midnight: before that hour, usage still counts
//! against the previous calendar date. A ledger stamped with another date
//! reads as empty and is simply overwritten on the next save.
//!
//! Each platform has its own lock, created lazily, so platforms never wait on
//! each other while updates to one platform are totally ordered.

use crate::config::{EnforcerConfig, Paths, Platform};
use crate::core::atomic::{WriteOptions, write_atomic};
use crate::core::error::{Error, Result};
use chrono::{DateTime, Days, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Source of the current local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Calendar date usage is booked against at `now`.
///
/// ```
/// use chrono::{Local, TimeZone};
/// use curfew::core::usage::logical_date;
///
/// let late = Local.with_ymd_and_hms(2026, 3, 11, 2, 30, 0).unwrap();
/// assert_eq!(logical_date(late, 4).to_string(), "2026-03-10");
/// ```
pub fn logical_date(now: DateTime<Local>, reset_hour: u32) -> NaiveDate {
    let date = now.date_naive();
    if now.hour() < reset_hour {
        date.checked_sub_days(Days::new(1)).unwrap_or(date)
    } else {
        date
    }
}

/// On-disk ledger of one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub date: NaiveDate,
    pub used_seconds: f64,
    pub sessions: u32,
}

impl UsageRecord {
    fn fresh(date: NaiveDate) -> Self {
        Self {
            date,
            used_seconds: 0.0,
            sessions: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum UsageLevel {
    Normal,
    /// Remaining time is within the largest warning step
    Warning,
    Exhausted,
}

/// Point-in-time view of one platform's quota
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformUsage {
    pub id: String,
    pub display_name: String,
    pub used_seconds: f64,
    pub remaining_seconds: f64,
    pub limit_seconds: f64,
    pub sessions: u32,
    pub level: UsageLevel,
}

/// Formats seconds as `MM:SS`; negative input reads as zero.
pub fn format_seconds(total_seconds: f64) -> String {
    let total = if total_seconds.is_finite() {
        total_seconds.max(0.0).floor() as u64
    } else {
        0
    };
    format!("{:02}:{:02}", total / 60, total % 60)
}

pub struct UsageTracker {
    platforms: Vec<Platform>,
    paths: Paths,
    reset_hour: u32,
    warning_threshold_secs: f64,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UsageTracker {
    pub fn new(config: &EnforcerConfig, paths: &Paths) -> Self {
        Self::with_clock(config, paths, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &EnforcerConfig, paths: &Paths, clock: Arc<dyn Clock>) -> Self {
        Self {
            platforms: config.platforms.clone(),
            paths: paths.clone(),
            reset_hour: config.reset_hour,
            warning_threshold_secs: config.warning_threshold_secs(),
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The current logical day.
    pub fn today(&self) -> NaiveDate {
        logical_date(self.clock.now(), self.reset_hour)
    }

    fn platform(&self, id: &str) -> Result<&Platform> {
        self.platforms
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::UnknownPlatform(id.to_string()))
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn ledger_path(&self, platform: &Platform) -> PathBuf {
        self.paths.usage_file(platform)
    }

    /// Caller must hold the platform lock.
    fn load(&self, platform: &Platform) -> UsageRecord {
        let today = self.today();
        let path = self.ledger_path(platform);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return UsageRecord::fresh(today);
            }
            Err(e) => {
                warn!("Failed to read usage ledger {:?}: {}", path, e);
                return UsageRecord::fresh(today);
            }
        };

        match serde_json::from_str::<UsageRecord>(&json) {
            Ok(record) if record.date == today => record,
            Ok(record) => {
                info!(
                    "New day for {}: ledger from {} ignored, counting {} from zero",
                    platform.display_name, record.date, today
                );
                UsageRecord::fresh(today)
            }
            Err(e) => {
                warn!(
                    "Corrupted usage ledger for {}, treating as empty: {}",
                    platform.display_name, e
                );
                UsageRecord::fresh(today)
            }
        }
    }

    /// Caller must hold the platform lock.
    fn save(&self, platform: &Platform, record: &UsageRecord) -> Result<()> {
        let dir = &self.paths.data_dir;
        crate::utils::create_private_dir(dir).map_err(|e| Error::from_io(e, dir))?;
        let json = serde_json::to_string_pretty(record)?;
        let options = WriteOptions {
            temp_prefix: Some(format!(".{}_", platform.id)),
            ..WriteOptions::default()
        };
        write_atomic(&self.ledger_path(platform), &json, &options)?;
        debug!(
            "Saved usage for {}: {:.1}s, {} session(s)",
            platform.id, record.used_seconds, record.sessions
        );
        Ok(())
    }

    fn read(&self, id: &str) -> Result<(&Platform, UsageRecord)> {
        let platform = self.platform(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok((platform, self.load(platform)))
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut UsageRecord)) -> Result<UsageRecord> {
        let platform = self.platform(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut record = self.load(platform);
        apply(&mut record);
        self.save(platform, &record)?;
        Ok(record)
    }

    pub fn get_used_seconds(&self, id: &str) -> Result<f64> {
        Ok(self.read(id)?.1.used_seconds)
    }

    /// Books `seconds` against today and returns the new total.
    ///
    /// # Errors
    ///
    /// `Error::Validation` for a negative or non-finite amount, otherwise
    /// `UnknownPlatform` or a write failure.
    pub fn add_usage(&self, id: &str, seconds: f64) -> Result<f64> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(Error::Validation {
                field: "seconds".to_string(),
                message: format!("usage must be a non-negative number, got {seconds}"),
            });
        }
        Ok(self
            .update(id, |record| record.used_seconds += seconds)?
            .used_seconds)
    }

    /// Remaining allowance, never below zero.
    pub fn get_remaining_seconds(&self, id: &str) -> Result<f64> {
        let (platform, record) = self.read(id)?;
        Ok((platform.daily_limit_seconds() - record.used_seconds).max(0.0))
    }

    pub fn is_limit_reached(&self, id: &str) -> Result<bool> {
        Ok(self.get_remaining_seconds(id)? <= 0.0)
    }

    pub fn increment_session_count(&self, id: &str) -> Result<u32> {
        Ok(self.update(id, |record| record.sessions += 1)?.sessions)
    }

    /// Zeroes today's ledger.
    pub fn reset(&self, id: &str) -> Result<()> {
        let today = self.today();
        self.update(id, |record| *record = UsageRecord::fresh(today))?;
        info!("Usage reset for {}", id);
        Ok(())
    }

    pub fn get_formatted_remaining(&self, id: &str) -> Result<String> {
        Ok(format_seconds(self.get_remaining_seconds(id)?))
    }

    pub fn get_formatted_used(&self, id: &str) -> Result<String> {
        Ok(format_seconds(self.get_used_seconds(id)?))
    }

    fn level_for(&self, remaining: f64) -> UsageLevel {
        if remaining <= 0.0 {
            UsageLevel::Exhausted
        } else if remaining <= self.warning_threshold_secs {
            UsageLevel::Warning
        } else {
            UsageLevel::Normal
        }
    }

    pub fn usage_level(&self, id: &str) -> Result<UsageLevel> {
        Ok(self.level_for(self.get_remaining_seconds(id)?))
    }

    /// Usage of every configured platform, in configuration order.
    pub fn snapshot(&self) -> Vec<PlatformUsage> {
        self.platforms
            .iter()
            .filter_map(|platform| {
                let (_, record) = self.read(&platform.id).ok()?;
                let limit = platform.daily_limit_seconds();
                let remaining = (limit - record.used_seconds).max(0.0);
                Some(PlatformUsage {
                    id: platform.id.clone(),
                    display_name: platform.display_name.clone(),
                    used_seconds: record.used_seconds,
                    remaining_seconds: remaining,
                    limit_seconds: limit,
                    sessions: record.sessions,
                    level: self.level_for(remaining),
                })
            })
            .collect()
    }
}
