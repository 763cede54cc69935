//! The enforcement context
//!
//! [`Enforcer`] owns every stateful part of curfew: the hosts manager, the
//! firewall manager, the usage tracker, the three session stores and the
//! audit log. It is built once per process and passed to whatever drives it
//! (the CLI, the integrity loop).
//!
//! A platform is *held* while a blackout runs, while a web block lists it, or
//! once its daily quota is used up. Held platforms stay blocked; ending a
//! hold unblocks only the platforms nothing else holds.
//!
//! Usage ledgers are plain file I/O behind std locks, so every ledger call
//! made from async code runs on the blocking pool.

use crate::audit::{AuditLog, EventType};
use crate::config::{EnforcerConfig, Paths, Platform};
use crate::core::error::{Error, Result};
use crate::core::firewall::RuleBackend;
use crate::core::hosts::{HostsManager, PermanentStatus};
use crate::core::network::{AllowlistEnable, FirewallManager, FirewallSettings};
use crate::core::nft::NftBackend;
use crate::core::resolve::{Resolver, SystemResolver};
use crate::core::schedule::ScheduleStore;
use crate::core::session::{
    ActiveSession, AllowlistParams, BlackoutParams, MIN_REMAINING_SECS, Recovered, SessionStore,
    WebBlockParams,
};
use crate::core::usage::{Clock, PlatformUsage, SystemClock, UsageTracker};
use chrono::{DateTime, Local};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a persisted session was handled at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionRecovery {
    #[default]
    None,
    Resumed {
        remaining_minutes: u32,
        locked: bool,
    },
    /// Ran out while curfew was not running and was unwound
    Expired,
    /// Allowlist rules left by a crash without a session were removed
    OrphanCleaned,
}

#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    /// Domains in the permanent section, if it could be written
    pub permanent_domains: Option<usize>,
    pub dns_locked: bool,
    pub allowlist: SessionRecovery,
    pub web_block: SessionRecovery,
    pub blackout: SessionRecovery,
    /// Platforms blocked because their quota is used up
    pub quota_blocked: Vec<String>,
    /// Schedule that started a blackout
    pub scheduled_blackout: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub permanent_restored: bool,
    pub dns_lock_restored: bool,
    /// Names of sessions that ran out and were ended
    pub expired_sessions: Vec<&'static str>,
    /// Held platforms whose section had to be written again
    pub reblocked: Vec<String>,
    /// Allowlist rules whose owning process is gone: taken over when a
    /// timed session still runs, removed otherwise
    pub allowlist_adopted: bool,
    pub allowlist_orphan_cleaned: bool,
    /// Schedule that started a blackout
    pub scheduled_blackout: Option<String>,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        !self.permanent_restored
            && !self.dns_lock_restored
            && self.reblocked.is_empty()
            && !self.allowlist_adopted
            && !self.allowlist_orphan_cleaned
            && self.scheduled_blackout.is_none()
            && self.errors.is_empty()
    }
}

/// Why [`Enforcer::hold_allowlist`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowlistWait {
    Interrupted,
    /// The timed session ran out
    Expired,
    /// Another process left allowlist mode
    EndedElsewhere,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub platforms_blocked: usize,
    pub permanent_applied: bool,
    pub allowlist_disabled: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlatformStatus {
    pub usage: PlatformUsage,
    pub blocked: bool,
    pub in_use: bool,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub platforms: Vec<PlatformStatus>,
    pub permanent_applied: bool,
    /// `None` when the rule table could not be queried
    pub dns_locked: Option<bool>,
    pub allowlist_rules_present: bool,
    pub allowlist: Option<ActiveSession<AllowlistParams>>,
    pub web_block: Option<ActiveSession<WebBlockParams>>,
    pub blackout: Option<ActiveSession<BlackoutParams>>,
}

struct UsageSession {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

fn ran_out<T>(session: &ActiveSession<T>) -> bool {
    session.remaining_seconds <= MIN_REMAINING_SECS
}

fn outcome<T>(result: &Result<T>) -> std::result::Result<(), String> {
    result.as_ref().map(|_| ()).map_err(ToString::to_string)
}

pub struct Enforcer<B = NftBackend, R = SystemResolver> {
    config: EnforcerConfig,
    paths: Paths,
    hosts: Arc<HostsManager>,
    firewall: FirewallManager<B, R>,
    usage: Arc<UsageTracker>,
    blackout: SessionStore<BlackoutParams>,
    web_block: SessionStore<WebBlockParams>,
    allowlist: SessionStore<AllowlistParams>,
    schedules: ScheduleStore,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    usage_sessions: Mutex<HashMap<String, UsageSession>>,
    usage_tick: Duration,
}

impl Enforcer {
    /// Builds the production context: nftables, the OS resolver and the
    /// system clock.
    ///
    /// # Errors
    ///
    /// Fails if the config is invalid or the data directories cannot be
    /// created.
    pub fn new(config: EnforcerConfig) -> Result<Self> {
        let paths = config.paths()?;
        let backend = Arc::new(NftBackend::new(
            config.nft_table.clone(),
            Duration::from_secs(config.command_timeout_secs),
        ));
        let resolver = Arc::new(SystemResolver::new(Duration::from_secs(
            config.resolve_timeout_secs,
        )));
        Self::with_parts(config, paths, backend, resolver, Arc::new(SystemClock))
    }
}

impl<B, R> Enforcer<B, R>
where
    B: RuleBackend + 'static,
    R: Resolver + 'static,
{
    /// # Errors
    ///
    /// Fails if the config is invalid or `paths` cannot be created.
    pub fn with_parts(
        config: EnforcerConfig,
        paths: Paths,
        backend: Arc<B>,
        resolver: Arc<R>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        paths.ensure()?;

        let firewall = FirewallManager::new(
            FirewallSettings::from_config(&config, &paths),
            backend,
            resolver,
        );
        Ok(Self {
            hosts: Arc::new(HostsManager::new(&config, &paths)),
            firewall,
            usage: Arc::new(UsageTracker::with_clock(&config, &paths, Arc::clone(&clock))),
            blackout: SessionStore::new("blackout", paths.blackout_session(), Arc::clone(&clock)),
            web_block: SessionStore::new("web block", paths.web_block_session(), Arc::clone(&clock)),
            allowlist: SessionStore::new("allowlist", paths.allowlist_session(), Arc::clone(&clock)),
            schedules: ScheduleStore::new(paths.schedules_file()),
            clock,
            audit: AuditLog::new(paths.audit_log()),
            usage_sessions: Mutex::new(HashMap::new()),
            usage_tick: Duration::from_secs(1),
            config,
            paths,
        })
    }

    /// Changes how often a usage session books time.
    pub fn with_usage_tick(mut self, tick: Duration) -> Self {
        self.usage_tick = tick;
        self
    }

    pub fn config(&self) -> &EnforcerConfig {
        &self.config
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn hosts(&self) -> &HostsManager {
        &self.hosts
    }

    pub fn firewall(&self) -> &FirewallManager<B, R> {
        &self.firewall
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn schedules(&self) -> &ScheduleStore {
        &self.schedules
    }

    /// Runs `op` against the usage ledgers on the blocking pool.
    async fn with_usage<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&UsageTracker) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let usage = Arc::clone(&self.usage);
        tokio::task::spawn_blocking(move || op(&usage))
            .await
            .map_err(|e| Error::Internal(format!("usage ledger task failed: {e}")))?
    }

    async fn limit_reached(&self, id: &str) -> bool {
        let id = id.to_string();
        self.with_usage(move |u| u.is_limit_reached(&id))
            .await
            .unwrap_or(false)
    }

    /// Books `seconds` of use against `id` by hand; returns the new total.
    ///
    /// # Errors
    ///
    /// `UnknownPlatform`, `Validation` for negative time, or a ledger
    /// write failure.
    pub async fn add_usage(&self, id: &str, seconds: f64) -> Result<f64> {
        let id = id.to_string();
        self.with_usage(move |u| u.add_usage(&id, seconds)).await
    }

    /// # Errors
    ///
    /// `UnknownPlatform` or a ledger read failure.
    pub async fn remaining_seconds(&self, id: &str) -> Result<f64> {
        let id = id.to_string();
        self.with_usage(move |u| u.get_remaining_seconds(&id)).await
    }

    fn platform(&self, id: &str) -> Result<&Platform> {
        self.config.require_platform(id)
    }

    // ─── Holds ───

    fn held_by_session(&self, id: &str) -> Option<(&'static str, bool, DateTime<Local>)> {
        if let Some(s) = self.blackout.current()
            && s.remaining_seconds > MIN_REMAINING_SECS
        {
            return Some(("blackout", s.locked, s.end));
        }
        if let Some(s) = self.web_block.current()
            && s.remaining_seconds > MIN_REMAINING_SECS
            && s.params.platform_ids.iter().any(|p| p == id)
        {
            return Some(("web block", s.locked, s.end));
        }
        None
    }

    /// Whether something other than the user's own choice keeps `id` blocked.
    pub async fn is_held(&self, id: &str) -> bool {
        self.held_by_session(id).is_some() || self.limit_reached(id).await
    }

    async fn hold_error(&self, id: &str) -> Option<Error> {
        if let Some((kind, locked, end)) = self.held_by_session(id) {
            let until = end.format("%H:%M").to_string();
            return Some(if locked {
                Error::SessionLocked(until)
            } else {
                Error::Validation {
                    field: "platform".to_string(),
                    message: format!("{id} is blocked by a {kind} session until {until}"),
                }
            });
        }
        if self.limit_reached(id).await {
            return Some(Error::Validation {
                field: "platform".to_string(),
                message: format!("daily limit for {id} is used up"),
            });
        }
        None
    }

    /// Unblocks each of `ids` that nothing holds any more.
    async fn release(&self, ids: &[String]) -> Vec<String> {
        let mut errors = Vec::new();
        for id in ids {
            if self.is_held(id).await {
                debug!("{} stays blocked", id);
                continue;
            }
            let Ok(platform) = self.platform(id) else {
                warn!("Session referenced unknown platform {}", id);
                continue;
            };
            let result = self.hosts.unblock(platform).await;
            self.audit
                .record(EventType::UnblockPlatform, outcome(&result), json!({ "platform": id }))
                .await;
            if let Err(e) = result {
                error!("Could not unblock {}: {}", platform.display_name, e);
                errors.push(format!("unblock {id}: {e}"));
            }
        }
        errors
    }

    fn all_platform_ids(&self) -> Vec<String> {
        self.config.platforms.iter().map(|p| p.id.clone()).collect()
    }

    // ─── Platforms ───

    /// # Errors
    ///
    /// `UnknownPlatform` or a hosts write failure.
    pub async fn block_platform(&self, id: &str) -> Result<()> {
        let platform = self.platform(id)?;
        self.stop_usage_task(id).await;
        let result = self.hosts.block(platform).await;
        self.audit
            .record(EventType::BlockPlatform, outcome(&result), json!({ "platform": id }))
            .await;
        result.map(|_| ())
    }

    /// # Errors
    ///
    /// Refuses while the platform is held: `SessionLocked` for a lock-mode
    /// session, `Validation` otherwise.
    pub async fn unblock_platform(&self, id: &str) -> Result<()> {
        let platform = self.platform(id)?;
        if let Some(e) = self.hold_error(id).await {
            return Err(e);
        }
        let result = self.hosts.unblock(platform).await;
        self.audit
            .record(EventType::UnblockPlatform, outcome(&result), json!({ "platform": id }))
            .await;
        result.map(|_| ())
    }

    /// Blocks every configured platform and returns how many sections were
    /// written.
    ///
    /// # Errors
    ///
    /// Returns the first failure after trying every platform.
    pub async fn block_all_platforms(&self) -> Result<usize> {
        let mut first_error = None;
        let mut blocked = 0;
        for platform in &self.config.platforms {
            match self.block_platform(&platform.id).await {
                Ok(()) => blocked += 1,
                Err(e) => {
                    error!("Could not block {}: {}", platform.display_name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(blocked), Err)
    }

    /// Writes the permanent section and returns its domain count.
    ///
    /// # Errors
    ///
    /// Hosts write failures.
    pub async fn apply_permanent_blocks(&self) -> Result<usize> {
        let result = self.hosts.block_permanent_domains().await;
        self.audit
            .record(
                EventType::ApplyPermanentBlocks,
                outcome(&result),
                json!({ "domains": result.as_ref().ok() }),
            )
            .await;
        result
    }

    /// Adds a user entry to the permanent list and rewrites the section.
    ///
    /// # Errors
    ///
    /// Validation and write failures.
    pub async fn add_permanent(&self, label: &str, domains: &[String]) -> Result<usize> {
        let added = self.hosts.permanent_store().add(label, domains);
        self.audit
            .record(
                EventType::AddPermanentEntry,
                outcome(&added),
                json!({ "label": label, "domains": domains }),
            )
            .await;
        added?;
        self.apply_permanent_blocks().await
    }

    /// Removes a user entry; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Write failures.
    pub async fn remove_permanent(&self, label: &str) -> Result<bool> {
        let removed = self.hosts.permanent_store().remove(label);
        self.audit
            .record(
                EventType::RemovePermanentEntry,
                outcome(&removed),
                json!({ "label": label }),
            )
            .await;
        if removed? {
            self.apply_permanent_blocks().await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ─── DNS lock ───

    /// # Errors
    ///
    /// The first rule failure.
    pub async fn enable_dns_lock(&self) -> Result<()> {
        let result = self.firewall.enable_dns_lock().await;
        self.audit
            .record(
                EventType::EnableDnsLock,
                outcome(&result),
                json!({ "resolvers": self.config.dns_servers.len(), "dot_port": self.config.dot_port }),
            )
            .await;
        result
    }

    /// # Errors
    ///
    /// The first rule failure.
    pub async fn disable_dns_lock(&self) -> Result<()> {
        let result = self.firewall.disable_dns_lock().await;
        self.audit
            .record(EventType::DisableDnsLock, outcome(&result), json!({}))
            .await;
        result
    }

    // ─── Web block ───

    /// Blocks `ids` for `minutes`.
    ///
    /// # Errors
    ///
    /// `UnknownPlatform`, `Validation` when a web block already runs or no
    /// platform is given, or write failures. The session is cleared again
    /// if blocking fails.
    pub async fn start_web_block(
        &self,
        ids: &[String],
        minutes: u32,
        locked: bool,
    ) -> Result<DateTime<Local>> {
        let mut platform_ids: Vec<String> = Vec::new();
        for id in ids {
            self.platform(id)?;
            if !platform_ids.contains(id) {
                platform_ids.push(id.clone());
            }
        }
        if platform_ids.is_empty() {
            return Err(Error::Validation {
                field: "platforms".to_string(),
                message: "at least one platform is required".to_string(),
            });
        }
        if self.web_block.is_active() {
            return Err(Error::Validation {
                field: "web_block".to_string(),
                message: "a web block session is already running".to_string(),
            });
        }

        let params = WebBlockParams { platform_ids };
        let end = self.web_block.start(minutes, &params, locked)?;
        let blocked = async {
            for id in &params.platform_ids {
                self.block_platform(id).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        self.audit
            .record(
                EventType::SessionStart,
                outcome(&blocked),
                json!({ "kind": "web_block", "platforms": params.platform_ids, "minutes": minutes, "locked": locked }),
            )
            .await;
        if let Err(e) = blocked {
            if self.web_block.clear().is_err() {
                warn!("Web block session file could not be removed after a failed start");
            }
            return Err(e);
        }
        Ok(end)
    }

    /// Ends the web block and unblocks its platforms unless something else
    /// holds them. Returns whether a session was running.
    ///
    /// # Errors
    ///
    /// `SessionLocked` for an unexpired lock-mode session without `force`.
    pub async fn end_web_block(&self, force: bool) -> Result<bool> {
        let Some(params) = self.web_block.end(force)? else {
            return Ok(false);
        };
        let errors = self.release(&params.platform_ids).await;
        self.audit
            .record(
                EventType::SessionEnd,
                if errors.is_empty() { Ok(()) } else { Err(errors.join("; ")) },
                json!({ "kind": "web_block", "platforms": params.platform_ids, "forced": force }),
            )
            .await;
        Ok(true)
    }

    // ─── Blackout ───

    /// Blocks every platform for `minutes`.
    ///
    /// # Errors
    ///
    /// `Validation` when a blackout already runs, or write failures.
    pub async fn start_blackout(&self, minutes: u32, locked: bool) -> Result<DateTime<Local>> {
        if self.blackout.is_active() {
            return Err(Error::Validation {
                field: "blackout".to_string(),
                message: "a blackout is already running".to_string(),
            });
        }
        let end = self.blackout.start(
            minutes,
            &BlackoutParams {
                duration_minutes: minutes,
            },
            locked,
        )?;
        let result = self.block_all_platforms().await;
        self.audit
            .record(
                EventType::SessionStart,
                outcome(&result),
                json!({ "kind": "blackout", "minutes": minutes, "locked": locked }),
            )
            .await;
        if let Err(e) = result {
            if self.blackout.clear().is_err() {
                warn!("Blackout session file could not be removed after a failed start");
            }
            return Err(e);
        }
        Ok(end)
    }

    /// # Errors
    ///
    /// `SessionLocked` for an unexpired lock-mode blackout without `force`.
    pub async fn end_blackout(&self, force: bool) -> Result<bool> {
        let Some(params) = self.blackout.end(force)? else {
            return Ok(false);
        };
        let errors = self.release(&self.all_platform_ids()).await;
        self.audit
            .record(
                EventType::SessionEnd,
                if errors.is_empty() { Ok(()) } else { Err(errors.join("; ")) },
                json!({ "kind": "blackout", "minutes": params.duration_minutes, "forced": force }),
            )
            .await;
        Ok(true)
    }

    // ─── Allowlist ───

    /// Enables allowlist mode, optionally as a timed session.
    ///
    /// # Errors
    ///
    /// Firewall failures; for a timed session, a failure to persist it
    /// (allowlist mode is switched off again in that case).
    pub async fn start_allowlist(
        &self,
        minutes: Option<u32>,
        locked: bool,
    ) -> Result<AllowlistEnable> {
        let result = self.firewall.enable_allowlist().await;
        self.audit
            .record(
                EventType::EnableAllowlist,
                outcome(&result),
                json!({ "minutes": minutes, "locked": locked }),
            )
            .await;
        let enabled = result?;
        if enabled == AllowlistEnable::AlreadyActive {
            return Ok(enabled);
        }

        if let Some(minutes) = minutes
            && let Err(e) = self.allowlist.start(
                minutes,
                &AllowlistParams {
                    duration_minutes: minutes,
                },
                locked,
            )
        {
            error!("Could not persist allowlist session: {}", e);
            if let Err(e) = self.firewall.disable_allowlist().await {
                error!("Allowlist rollback failed: {}", e);
            }
            return Err(e);
        }
        Ok(enabled)
    }

    /// Leaves allowlist mode.
    ///
    /// # Errors
    ///
    /// `SessionLocked` for an unexpired locked session without `force`, or
    /// the first rule deletion failure.
    pub async fn stop_allowlist(&self, force: bool) -> Result<()> {
        self.allowlist.end(force)?;
        let result = self.firewall.disable_allowlist().await;
        self.audit
            .record(
                EventType::DisableAllowlist,
                outcome(&result),
                json!({ "forced": force }),
            )
            .await;
        result
    }

    /// Keeps this process, and with it the allowlist refresh loop, alive
    /// until `interrupt` completes, the timed session runs out, or another
    /// process removes the allowlist flag. Disables nothing itself.
    pub async fn hold_allowlist<F>(&self, poll: Duration, interrupt: F) -> AllowlistWait
    where
        F: Future<Output = ()>,
    {
        let timed = self.allowlist.current().is_some();
        tokio::pin!(interrupt);
        loop {
            tokio::select! {
                () = &mut interrupt => return AllowlistWait::Interrupted,
                () = tokio::time::sleep(poll) => {}
            }
            if !self.firewall.flag_path().exists() {
                return AllowlistWait::EndedElsewhere;
            }
            if timed {
                match self.allowlist.current() {
                    Some(session) if !ran_out(&session) => {}
                    Some(_) => return AllowlistWait::Expired,
                    None => return AllowlistWait::EndedElsewhere,
                }
            }
        }
    }

    /// Takes over or removes allowlist rules whose owning process died
    /// after startup.
    async fn reconcile_allowlist(&self, report: &mut IntegrityReport) {
        if !self.firewall.flag_path().exists()
            || self.firewall.is_allowlist_active().await
            || self.firewall.held_elsewhere()
        {
            return;
        }
        if self.allowlist.current().is_some_and(|s| !ran_out(&s)) {
            warn!("Allowlist owner is gone; taking over the refresh loop");
            let result = self.firewall.enable_allowlist().await;
            self.audit
                .record(EventType::EnableAllowlist, outcome(&result), json!({ "reason": "adopted" }))
                .await;
            match result {
                Ok(_) => report.allowlist_adopted = true,
                Err(e) => report.errors.push(format!("allowlist adopt: {e}")),
            }
            return;
        }
        match self.firewall.cleanup_orphaned_allowlist().await {
            Ok(true) => {
                report.allowlist_orphan_cleaned = true;
                self.audit
                    .record::<String>(EventType::CleanupOrphanedAllowlist, Ok(()), json!({}))
                    .await;
            }
            Ok(false) => {}
            Err(e) => report.errors.push(format!("allowlist cleanup: {e}")),
        }
    }

    // ─── Schedules ───

    /// Starts an unlocked blackout for the first due schedule, unless a
    /// blackout already runs. Returns the schedule's id.
    ///
    /// # Errors
    ///
    /// Failures from [`start_blackout`](Self::start_blackout).
    pub async fn check_schedules(&self) -> Result<Option<String>> {
        if self.blackout.is_active() {
            return Ok(None);
        }
        let Some((schedule, minutes)) = self.schedules.take_due(self.clock.now()) else {
            return Ok(None);
        };
        info!(
            "Schedule {} is active; starting a {} minute blackout",
            schedule.name, minutes
        );
        self.start_blackout(minutes, false).await?;
        Ok(Some(schedule.id))
    }

    // ─── Usage sessions ───

    /// Unblocks `id` and books time against its quota every tick until the
    /// quota runs out or [`stop_usage_session`](Self::stop_usage_session)
    /// is called. Returns the remaining seconds.
    ///
    /// # Errors
    ///
    /// Refuses while the platform is held; hosts failures.
    pub async fn start_usage_session(&self, id: &str) -> Result<f64> {
        let platform = self.platform(id)?.clone();
        if let Some(e) = self.hold_error(id).await {
            return Err(e);
        }

        let mut sessions = self.usage_sessions.lock().await;
        if let Some(existing) = sessions.get(id)
            && !existing.handle.is_finished()
        {
            debug!("Usage session for {} already running", id);
            drop(sessions);
            return self.remaining_seconds(id).await;
        }

        let result = self.hosts.unblock(&platform).await;
        self.audit
            .record(
                EventType::SessionStart,
                outcome(&result),
                json!({ "kind": "usage", "platform": id }),
            )
            .await;
        result?;
        let counted = id.to_string();
        self.with_usage(move |u| u.increment_session_count(&counted))
            .await?;

        let (stop, stopped) = watch::channel(false);
        let handle = tokio::spawn(usage_ticker(
            Arc::clone(&self.usage),
            Arc::clone(&self.hosts),
            platform,
            self.usage_tick,
            self.config.warning_steps.clone(),
            stopped,
        ));
        sessions.insert(id.to_string(), UsageSession { stop, handle });
        drop(sessions);

        let remaining = self.remaining_seconds(id).await?;
        info!("Usage session for {} started, {:.0}s left", id, remaining);
        Ok(remaining)
    }

    /// Whether a usage session for `id` is still counting.
    pub async fn is_usage_session_active(&self, id: &str) -> bool {
        self.usage_sessions
            .lock()
            .await
            .get(id)
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Stops the ticker without touching the hosts file.
    async fn stop_usage_task(&self, id: &str) -> bool {
        let Some(UsageSession { stop, mut handle }) = self.usage_sessions.lock().await.remove(id)
        else {
            return false;
        };
        let _ = stop.send(true);
        let join_timeout = Duration::from_secs(self.config.join_timeout_secs);
        if tokio::time::timeout(join_timeout, &mut handle).await.is_err() {
            warn!("Usage ticker for {} did not stop within {:?}; abandoning it", id, join_timeout);
            handle.abort();
        }
        true
    }

    /// Stops the usage session for `id` and blocks the platform again.
    ///
    /// # Errors
    ///
    /// `UnknownPlatform` or a hosts write failure.
    pub async fn stop_usage_session(&self, id: &str) -> Result<()> {
        let platform = self.platform(id)?;
        let was_running = self.stop_usage_task(id).await;
        let result = self.hosts.block(platform).await;
        if was_running {
            self.audit
                .record(
                    EventType::SessionEnd,
                    outcome(&result),
                    json!({ "kind": "usage", "platform": id }),
                )
                .await;
        }
        result.map(|_| ())
    }

    async fn stop_all_usage_tasks(&self) {
        let ids: Vec<String> = self.usage_sessions.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_usage_task(&id).await;
        }
    }

    /// Resets today's quota for `id`.
    ///
    /// # Errors
    ///
    /// `UnknownPlatform` or a ledger write failure.
    pub async fn reset_usage(&self, id: &str) -> Result<()> {
        let reset = id.to_string();
        let result = self.with_usage(move |u| u.reset(&reset)).await;
        self.audit
            .record(EventType::ResetUsage, outcome(&result), json!({ "platform": id }))
            .await;
        result
    }

    // ─── Lifecycle ───

    /// Re-asserts everything curfew enforces after a (re)start.
    ///
    /// Never fails: each step's error is logged and collected in the report
    /// so the remaining steps still run.
    pub async fn startup(&self) -> StartupReport {
        info!("curfew starting; data in {:?}", self.paths.data_dir);
        let mut report = StartupReport::default();

        match self.apply_permanent_blocks().await {
            Ok(count) => report.permanent_domains = Some(count),
            Err(e) => {
                error!("Permanent blocks could not be applied: {}", e);
                report.errors.push(format!("permanent blocks: {e}"));
            }
        }

        match self.enable_dns_lock().await {
            Ok(()) => report.dns_locked = true,
            Err(e) => {
                warn!("DNS lock degraded until the next integrity check: {}", e);
                report.errors.push(format!("dns lock: {e}"));
            }
        }

        report.allowlist = self.recover_allowlist(&mut report.errors).await;

        // Read both before acting so that unwinding one sees the other
        let blackout = self.blackout.recover();
        let web_block = self.web_block.recover();

        if let Some(Recovered::Resume(session)) = &blackout {
            report.blackout = SessionRecovery::Resumed {
                remaining_minutes: session.remaining_minutes(),
                locked: session.locked,
            };
            if let Err(e) = self.block_all_platforms().await {
                report.errors.push(format!("blackout: {e}"));
            }
        }
        if let Some(Recovered::Resume(session)) = &web_block {
            report.web_block = SessionRecovery::Resumed {
                remaining_minutes: session.remaining_minutes(),
                locked: session.locked,
            };
            for id in &session.params.platform_ids {
                if let Err(e) = self.block_platform(id).await {
                    report.errors.push(format!("web block {id}: {e}"));
                }
            }
        }
        if let Some(Recovered::Expired(_)) = &blackout {
            report.blackout = SessionRecovery::Expired;
            report.errors.extend(self.release(&self.all_platform_ids()).await);
        }
        if let Some(Recovered::Expired(params)) = &web_block {
            report.web_block = SessionRecovery::Expired;
            report.errors.extend(self.release(&params.platform_ids).await);
        }
        for (kind, recovery) in [("blackout", report.blackout), ("web_block", report.web_block)] {
            if recovery != SessionRecovery::None {
                self.audit
                    .record::<String>(
                        EventType::SessionRecovery,
                        Ok(()),
                        json!({ "kind": kind, "outcome": format!("{recovery:?}") }),
                    )
                    .await;
            }
        }

        report.quota_blocked = self.block_exhausted(&mut report.errors).await;

        match self.check_schedules().await {
            Ok(started) => report.scheduled_blackout = started,
            Err(e) => report.errors.push(format!("schedule: {e}")),
        }

        info!(
            "Startup complete ({} problem(s))",
            report.errors.len()
        );
        report
    }

    async fn recover_allowlist(&self, errors: &mut Vec<String>) -> SessionRecovery {
        let recovery = match self.allowlist.recover() {
            Some(Recovered::Resume(session)) if self.firewall.held_elsewhere() => {
                info!("Allowlist session belongs to a running process; leaving it there");
                SessionRecovery::Resumed {
                    remaining_minutes: session.remaining_minutes(),
                    locked: session.locked,
                }
            }
            Some(Recovered::Resume(session)) => match self.firewall.enable_allowlist().await {
                Ok(_) => SessionRecovery::Resumed {
                    remaining_minutes: session.remaining_minutes(),
                    locked: session.locked,
                },
                Err(e) => {
                    error!("Could not resume allowlist mode: {}", e);
                    errors.push(format!("allowlist: {e}"));
                    return SessionRecovery::None;
                }
            },
            Some(Recovered::Expired(_)) => {
                if let Err(e) = self.firewall.disable_allowlist().await {
                    errors.push(format!("allowlist: {e}"));
                }
                SessionRecovery::Expired
            }
            None => match self.firewall.cleanup_orphaned_allowlist().await {
                Ok(true) => SessionRecovery::OrphanCleaned,
                Ok(false) => SessionRecovery::None,
                Err(e) => {
                    errors.push(format!("allowlist cleanup: {e}"));
                    SessionRecovery::None
                }
            },
        };
        match recovery {
            SessionRecovery::None => {}
            SessionRecovery::OrphanCleaned => {
                self.audit
                    .record::<String>(EventType::CleanupOrphanedAllowlist, Ok(()), json!({}))
                    .await;
            }
            other => {
                self.audit
                    .record::<String>(
                        EventType::SessionRecovery,
                        Ok(()),
                        json!({ "kind": "allowlist", "outcome": format!("{other:?}") }),
                    )
                    .await;
            }
        }
        recovery
    }

    /// Blocks every platform whose quota is used up and that is not blocked
    /// yet; returns their ids.
    async fn block_exhausted(&self, errors: &mut Vec<String>) -> Vec<String> {
        let mut blocked = Vec::new();
        for platform in &self.config.platforms {
            if !self.limit_reached(&platform.id).await || self.hosts.is_blocked(platform)
            {
                continue;
            }
            match self.block_platform(&platform.id).await {
                Ok(()) => {
                    info!("Daily limit for {} reached; blocked", platform.display_name);
                    blocked.push(platform.id.clone());
                }
                Err(e) => errors.push(format!("quota block {}: {e}", platform.id)),
            }
        }
        blocked
    }

    /// Ends sessions whose time ran out and unwinds what they enforced.
    async fn expire_sessions(&self, report: &mut IntegrityReport) {
        if self.allowlist.current().is_some_and(|s| ran_out(&s)) {
            report.expired_sessions.push("allowlist");
            if let Err(e) = self.stop_allowlist(true).await {
                report.errors.push(format!("allowlist expiry: {e}"));
            }
        }
        if self.web_block.current().is_some_and(|s| ran_out(&s)) {
            report.expired_sessions.push("web block");
            if let Err(e) = self.end_web_block(true).await {
                report.errors.push(format!("web block expiry: {e}"));
            }
        }
        if self.blackout.current().is_some_and(|s| ran_out(&s)) {
            report.expired_sessions.push("blackout");
            if let Err(e) = self.end_blackout(true).await {
                report.errors.push(format!("blackout expiry: {e}"));
            }
        }
    }

    /// Periodic re-assertion: restores tampered permanent blocks and DNS
    /// lock rules, ends expired sessions and re-blocks held platforms.
    pub async fn integrity_check(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();

        match self.hosts.verify_permanent_blocks().await {
            Ok(PermanentStatus::Intact) => {}
            Ok(PermanentStatus::Restored) => {
                warn!("Permanent block section was missing; restored");
                report.permanent_restored = true;
                self.audit
                    .record::<String>(EventType::TamperRecovery, Ok(()), json!({ "target": "permanent_blocks" }))
                    .await;
            }
            Err(e) => report.errors.push(format!("permanent blocks: {e}")),
        }

        match self.firewall.dns_lock_intact().await {
            Ok(true) => {}
            Ok(false) => {
                warn!("DNS lock rules missing; restoring");
                let result = self.firewall.enable_dns_lock().await;
                self.audit
                    .record(EventType::TamperRecovery, outcome(&result), json!({ "target": "dns_lock" }))
                    .await;
                match result {
                    Ok(()) => report.dns_lock_restored = true,
                    Err(e) => report.errors.push(format!("dns lock: {e}")),
                }
            }
            Err(e) => report.errors.push(format!("dns lock query: {e}")),
        }

        self.expire_sessions(&mut report).await;
        self.reconcile_allowlist(&mut report).await;

        match self.check_schedules().await {
            Ok(started) => report.scheduled_blackout = started,
            Err(e) => report.errors.push(format!("schedule: {e}")),
        }

        for platform in &self.config.platforms {
            if !self.is_held(&platform.id).await || self.hosts.is_blocked(platform) {
                continue;
            }
            warn!("{} is held but was unblocked; blocking again", platform.display_name);
            match self.block_platform(&platform.id).await {
                Ok(()) => report.reblocked.push(platform.id.clone()),
                Err(e) => report.errors.push(format!("re-block {}: {e}", platform.id)),
            }
        }

        if report.is_clean() {
            debug!("Integrity check clean");
        } else {
            info!(
                "Integrity check: permanent restored={}, dns restored={}, expired={:?}, reblocked={:?}, allowlist adopted={} cleaned={}, schedule={:?}, {} error(s)",
                report.permanent_restored,
                report.dns_lock_restored,
                report.expired_sessions,
                report.reblocked,
                report.allowlist_adopted,
                report.allowlist_orphan_cleaned,
                report.scheduled_blackout,
                report.errors.len()
            );
        }
        report
    }

    /// Runs [`integrity_check`](Self::integrity_check) every `interval`
    /// until `shutdown` completes. Returns how many checks ran.
    pub async fn run_integrity_loop<F>(&self, interval: Duration, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; startup has just checked
        ticker.tick().await;
        tokio::pin!(shutdown);

        let mut checks = 0;
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.integrity_check().await;
                    checks += 1;
                }
            }
        }
        debug!("Integrity loop stopped after {} check(s)", checks);
        checks
    }

    /// Leaves the machine in its safest state: usage sessions stopped, every
    /// platform and the permanent list blocked (when configured), allowlist
    /// rules removed so the network stays usable. The DNS lock and session
    /// files are kept for the next start.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        self.stop_all_usage_tasks().await;

        if self.config.fail_safe_block_on_exit {
            info!("Fail-safe: blocking all platforms on exit");
            for platform in &self.config.platforms {
                match self.hosts.block(platform).await {
                    Ok(_) => report.platforms_blocked += 1,
                    Err(e) => report.errors.push(format!("block {}: {e}", platform.id)),
                }
            }
            match self.hosts.block_permanent_domains().await {
                Ok(_) => report.permanent_applied = true,
                Err(e) => report.errors.push(format!("permanent blocks: {e}")),
            }
        }

        let active_here = self.firewall.is_allowlist_active().await;
        if active_here || (self.firewall.flag_path().exists() && !self.firewall.held_elsewhere()) {
            let result = self.firewall.disable_allowlist().await;
            self.audit
                .record(EventType::DisableAllowlist, outcome(&result), json!({ "reason": "shutdown" }))
                .await;
            match result {
                Ok(()) => report.allowlist_disabled = true,
                Err(e) => report.errors.push(format!("allowlist: {e}")),
            }
        }

        info!("curfew stopped ({} problem(s))", report.errors.len());
        report
    }

    /// Removes every rule, section and session curfew created. Ledgers, the
    /// permanent store and the hosts backup are kept.
    ///
    /// # Errors
    ///
    /// Returns the first failure after attempting every step.
    pub async fn uninstall(&self) -> Result<()> {
        self.stop_all_usage_tasks().await;
        let mut first_error: Option<Error> = None;

        if let Err(e) = self.firewall.cleanup_all().await {
            error!("Firewall cleanup failed: {}", e);
            first_error.get_or_insert(e);
        }
        for platform in &self.config.platforms {
            if let Err(e) = self.hosts.unblock(platform).await {
                error!("Could not remove {} section: {}", platform.display_name, e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.hosts.remove_permanent_section().await {
            first_error.get_or_insert(e);
        }
        for result in [self.blackout.clear(), self.web_block.clear(), self.allowlist.clear()] {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        let result = first_error.map_or(Ok(()), Err);
        self.audit
            .record(EventType::Uninstall, outcome(&result), json!({}))
            .await;
        if result.is_ok() {
            info!("All curfew rules and sections removed");
        }
        result
    }

    pub async fn status(&self) -> Status {
        let snapshot = self
            .with_usage(|u| Ok(u.snapshot()))
            .await
            .unwrap_or_else(|e| {
                warn!("Usage snapshot failed: {}", e);
                Vec::new()
            });
        let mut platforms = Vec::new();
        for usage in snapshot {
            let blocked = self
                .config
                .platform(&usage.id)
                .is_some_and(|p| self.hosts.is_blocked(p));
            let in_use = self.is_usage_session_active(&usage.id).await;
            platforms.push(PlatformStatus {
                usage,
                blocked,
                in_use,
            });
        }
        Status {
            platforms,
            permanent_applied: self.hosts.is_permanent_applied(),
            dns_locked: self.firewall.dns_lock_intact().await.ok(),
            allowlist_rules_present: self.firewall.flag_path().exists(),
            allowlist: self.allowlist.current(),
            web_block: self.web_block.current(),
            blackout: self.blackout.current(),
        }
    }
}

/// Books `tick` of usage per tick; blocks the platform when the quota runs
/// out and warns once per configured step.
async fn usage_ticker(
    usage: Arc<UsageTracker>,
    hosts: Arc<HostsManager>,
    platform: Platform,
    tick: Duration,
    warning_steps: Vec<u32>,
    mut stopped: watch::Receiver<bool>,
) {
    let mut previous = {
        let usage = Arc::clone(&usage);
        let id = platform.id.clone();
        tokio::task::spawn_blocking(move || usage.get_remaining_seconds(&id))
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or(0.0)
    };
    loop {
        tokio::select! {
            () = tokio::time::sleep(tick) => {}
            _ = stopped.changed() => break,
        }
        if *stopped.borrow() {
            break;
        }

        let booked = {
            let usage = Arc::clone(&usage);
            let id = platform.id.clone();
            let secs = tick.as_secs_f64();
            tokio::task::spawn_blocking(move || -> Result<f64> {
                usage.add_usage(&id, secs)?;
                usage.get_remaining_seconds(&id)
            })
            .await
        };
        let remaining = match booked {
            Ok(Ok(remaining)) => remaining,
            Ok(Err(e)) => {
                warn!("Could not book usage for {}: {}", platform.id, e);
                continue;
            }
            Err(e) => {
                error!("Usage booking task for {} failed: {}", platform.id, e);
                continue;
            }
        };

        for step in &warning_steps {
            let threshold = f64::from(*step) * 60.0;
            if previous > threshold && remaining <= threshold && remaining > 0.0 {
                warn!("{} minute(s) left on {}", step, platform.display_name);
            }
        }
        previous = remaining;

        if remaining <= 0.0 {
            info!("Daily limit for {} reached; blocking", platform.display_name);
            if let Err(e) = hosts.block(&platform).await {
                error!("Could not block {} at quota end: {}", platform.display_name, e);
            }
            break;
        }
    }
    debug!("Usage ticker for {} stopped", platform.id);
}
