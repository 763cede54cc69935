//! Crash-recoverable timed sessions
//!
//! A session is one small JSON document holding its end time, whether it is
//! in lock mode, and session-specific parameters:
//!
//! ```json
//! {"end_iso": "2026-03-10T21:30:00+01:00", "locked": false, "platform_ids": ["youtube"]}
//! ```
//!
//! The file exists exactly as long as the session is active. After a crash,
//! [`SessionStore::recover`] either resumes the session with its true
//! remaining time or, if it ran out while nothing was watching, deletes the
//! file and hands the parameters back so the caller can unwind whatever the
//! session enforced.

use crate::core::atomic::{WriteOptions, write_atomic};
use crate::core::error::{Error, Result};
use crate::core::usage::Clock;
use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sessions with this little time left count as already over.
pub const MIN_REMAINING_SECS: i64 = 60;

#[derive(Debug, Serialize, Deserialize)]
struct SessionDocument<T> {
    end_iso: DateTime<Local>,
    #[serde(default)]
    locked: bool,
    #[serde(flatten)]
    params: T,
}

/// Blackout: every platform blocked until the end time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutParams {
    pub duration_minutes: u32,
}

/// Web block: the listed platforms blocked until the end time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebBlockParams {
    pub platform_ids: Vec<String>,
}

/// Timed allowlist mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistParams {
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession<T> {
    pub end: DateTime<Local>,
    pub locked: bool,
    pub params: T,
    pub remaining_seconds: i64,
}

impl<T> ActiveSession<T> {
    /// Whole minutes left, rounded up.
    pub fn remaining_minutes(&self) -> u32 {
        let secs = self.remaining_seconds.max(0);
        u32::try_from((secs + 59) / 60).unwrap_or(u32::MAX)
    }
}

/// What [`SessionStore::recover`] found on disk
#[derive(Debug, Clone, PartialEq)]
pub enum Recovered<T> {
    Resume(ActiveSession<T>),
    /// The session ended while nothing was running; the file is gone
    Expired(T),
}

pub struct SessionStore<T> {
    name: &'static str,
    path: PathBuf,
    clock: Arc<dyn Clock>,
    _params: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> SessionStore<T> {
    pub fn new(name: &'static str, path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            path: path.into(),
            clock,
            _params: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the session document.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory or the file cannot be written.
    pub fn save(&self, end: DateTime<Local>, params: &T, locked: bool) -> Result<()>
    where
        T: Clone,
    {
        if let Some(parent) = self.path.parent() {
            crate::utils::create_private_dir(parent).map_err(|e| Error::from_io(e, parent))?;
        }
        let document = SessionDocument {
            end_iso: end,
            locked,
            params: params.clone(),
        };
        let json = serde_json::to_string(&document)?;
        write_atomic(&self.path, &json, &WriteOptions::default())?;
        debug!(
            "{} session saved: ends at {}, locked={}",
            self.name,
            end.to_rfc3339(),
            locked
        );
        Ok(())
    }

    /// Starts a session of `minutes` from now and returns its end time.
    ///
    /// # Errors
    ///
    /// `Error::Validation` for a zero duration; write errors from [`save`](Self::save).
    pub fn start(&self, minutes: u32, params: &T, locked: bool) -> Result<DateTime<Local>>
    where
        T: Clone,
    {
        if minutes == 0 {
            return Err(Error::Validation {
                field: "minutes".to_string(),
                message: "a session must last at least one minute".to_string(),
            });
        }
        let end = self.clock.now() + chrono::Duration::minutes(i64::from(minutes));
        self.save(end, params, locked)?;
        info!(
            "{} session started for {} min{}",
            self.name,
            minutes,
            if locked { " (lock mode)" } else { "" }
        );
        Ok(end)
    }

    /// Reads the document. A corrupt file is deleted and reads as absent.
    fn read(&self) -> Option<SessionDocument<T>> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read {} session {:?}: {}", self.name, self.path, e);
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(document) => Some(document),
            Err(e) => {
                warn!("Corrupted {} session discarded: {}", self.name, e);
                self.remove_file();
                None
            }
        }
    }

    fn active(&self, document: SessionDocument<T>) -> ActiveSession<T> {
        ActiveSession {
            remaining_seconds: (document.end_iso - self.clock.now()).num_seconds(),
            end: document.end_iso,
            locked: document.locked,
            params: document.params,
        }
    }

    /// The running session, without side effects. A session that has run
    /// out is reported with `remaining_seconds <= MIN_REMAINING_SECS`.
    pub fn current(&self) -> Option<ActiveSession<T>> {
        self.read().map(|document| self.active(document))
    }

    pub fn is_active(&self) -> bool {
        self.current()
            .is_some_and(|s| s.remaining_seconds > MIN_REMAINING_SECS)
    }

    /// Resumes or expires a session persisted by an earlier run.
    pub fn recover(&self) -> Option<Recovered<T>> {
        let session = self.current()?;
        if session.remaining_seconds > MIN_REMAINING_SECS {
            info!(
                "Resuming {} session: {} min left{}",
                self.name,
                session.remaining_minutes(),
                if session.locked { " (lock mode)" } else { "" }
            );
            Some(Recovered::Resume(session))
        } else {
            info!("{} session expired while not running", self.name);
            self.remove_file();
            Some(Recovered::Expired(session.params))
        }
    }

    /// Ends the session and returns its parameters.
    ///
    /// # Errors
    ///
    /// `Error::SessionLocked` when the session is in lock mode, still running
    /// and `force` is not set.
    pub fn end(&self, force: bool) -> Result<Option<T>> {
        let Some(session) = self.current() else {
            return Ok(None);
        };
        if session.locked && !force && session.remaining_seconds > MIN_REMAINING_SECS {
            warn!("Refusing to end locked {} session early", self.name);
            return Err(Error::SessionLocked(session.end.format("%H:%M").to_string()));
        }
        self.clear()?;
        info!("{} session ended", self.name);
        Ok(Some(session.params))
    }

    fn remove_file(&self) {
        if let Err(e) = self.clear() {
            warn!("Could not remove {} session file: {}", self.name, e);
        }
    }

    /// Deletes the session file; a missing file is fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_io(e, &self.path)),
        }
    }
}
