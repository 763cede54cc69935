//! Firewall enforcement: the DNS lock and allowlist ("deep work") mode
//!
//! The two rule groups are independent. The DNS lock blocks well-known
//! public resolvers and DNS-over-TLS so the hosts file cannot be bypassed;
//! it stays in place across restarts. Allowlist mode drops all outbound
//! traffic except loopback, the local subnet and the resolved addresses of
//! a fixed domain list, and re-resolves those domains on an interval.
//!
//! Allowlist enable/disable run under one async mutex, so a UI toggle and
//! the integrity check cannot interleave their delete/create sequences.
//! A flag file holding the owner's pid exists for as long as allowlist
//! rules may exist. Finding it while that pid is gone means a previous run
//! died with the rules still installed; a live owner keeps its rules.

use crate::core::error::{Error, Result};
use crate::core::firewall::{Action, Protocol, RuleBackend, RuleNames, RuleSpec};
use crate::core::resolve::{Resolver, loopback_ranges, resolve_allowed};
use ipnetwork::{IpNetwork, Ipv4Network};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{Pid, getpid};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Static inputs of the firewall manager.
#[derive(Debug, Clone)]
pub struct FirewallSettings {
    pub names: RuleNames,
    pub dns_servers: Vec<IpAddr>,
    pub dot_port: u16,
    pub allowlist_domains: Vec<String>,
    pub refresh_interval: Duration,
    pub join_timeout: Duration,
    pub flag_path: PathBuf,
}

impl FirewallSettings {
    pub fn from_config(config: &crate::config::EnforcerConfig, paths: &crate::config::Paths) -> Self {
        Self {
            names: RuleNames::new(config.rule_prefix.clone()),
            dns_servers: config.dns_servers.clone(),
            dot_port: config.dot_port,
            allowlist_domains: config.allowlist_domains.clone(),
            refresh_interval: Duration::from_secs(config.allowlist_refresh_secs),
            join_timeout: Duration::from_secs(config.join_timeout_secs),
            flag_path: paths.allowlist_flag(),
        }
    }
}

/// Outcome of [`FirewallManager::enable_allowlist`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowlistEnable {
    Enabled { allowed_ips: usize },
    AlreadyActive,
}

struct RefreshTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Shared between the manager and its refresh task
struct AllowRuleContext<B, R> {
    backend: Arc<B>,
    resolver: Arc<R>,
    names: RuleNames,
    domains: Vec<String>,
}

impl<B: RuleBackend, R: Resolver> AllowRuleContext<B, R> {
    async fn allow_spec(&self) -> RuleSpec {
        let allowed = resolve_allowed(self.resolver.as_ref(), &self.domains).await;
        RuleSpec {
            name: self.names.allowlist_allow("0"),
            action: Action::Allow,
            protocol: Protocol::Any,
            remote: allowed
                .into_iter()
                .map(|ip| IpNetwork::V4(Ipv4Network::from(ip)))
                .collect(),
            remote_port: None,
        }
    }

    /// Re-resolves the domain set and replaces the allow rule.
    async fn refresh(&self) -> Result<usize> {
        let spec = self.allow_spec().await;
        self.backend.delete_rule(&spec.name).await?;
        self.backend.create_rule(&spec).await?;
        Ok(spec.remote.len())
    }
}

pub struct FirewallManager<B, R> {
    settings: FirewallSettings,
    context: Arc<AllowRuleContext<B, R>>,
    allowlist: Mutex<Option<RefreshTask>>,
}

impl<B, R> FirewallManager<B, R>
where
    B: RuleBackend + 'static,
    R: Resolver + 'static,
{
    pub fn new(settings: FirewallSettings, backend: Arc<B>, resolver: Arc<R>) -> Self {
        let context = Arc::new(AllowRuleContext {
            backend,
            resolver,
            names: settings.names.clone(),
            domains: settings.allowlist_domains.clone(),
        });
        Self {
            settings,
            context,
            allowlist: Mutex::new(None),
        }
    }

    pub fn names(&self) -> &RuleNames {
        &self.settings.names
    }

    pub fn backend(&self) -> &B {
        self.context.backend.as_ref()
    }

    // ─── DNS lock ───

    fn dns_specs(&self) -> [RuleSpec; 2] {
        [
            RuleSpec {
                name: self.settings.names.dns_lock(),
                action: Action::Block,
                protocol: Protocol::Any,
                remote: self
                    .settings
                    .dns_servers
                    .iter()
                    .map(|ip| IpNetwork::from(*ip))
                    .collect(),
                remote_port: None,
            },
            RuleSpec {
                name: self.settings.names.dot_lock(),
                action: Action::Block,
                protocol: Protocol::Tcp,
                remote: Vec::new(),
                remote_port: Some(self.settings.dot_port),
            },
        ]
    }

    /// Replaces both DNS lock rules. Calling it repeatedly leaves exactly
    /// one rule per name.
    ///
    /// # Errors
    ///
    /// Returns the first backend failure; the other rule is still attempted.
    pub async fn enable_dns_lock(&self) -> Result<()> {
        let mut first_error = None;
        for spec in self.dns_specs() {
            let result = async {
                self.backend().delete_rule(&spec.name).await?;
                self.backend().create_rule(&spec).await
            }
            .await;
            if let Err(e) = result {
                warn!("DNS lock rule {} failed: {}", spec.name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    "DNS lock active: {} resolvers and port {} blocked",
                    self.settings.dns_servers.len(),
                    self.settings.dot_port
                );
                Ok(())
            }
        }
    }

    /// Removes both DNS lock rules. Only uninstall calls this.
    ///
    /// # Errors
    ///
    /// Returns the first backend failure.
    pub async fn disable_dns_lock(&self) -> Result<()> {
        let names = [self.settings.names.dns_lock(), self.settings.names.dot_lock()];
        self.delete_all(&names).await?;
        info!("DNS lock removed");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the rule table cannot be queried.
    pub async fn is_dns_locked(&self) -> Result<bool> {
        self.backend()
            .rule_exists(&self.settings.names.dns_lock())
            .await
    }

    /// Both the resolver rule and the DoT rule are present.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule table cannot be queried.
    pub async fn dns_lock_intact(&self) -> Result<bool> {
        let names = self.backend().rule_names().await?;
        Ok(names.contains(&self.settings.names.dns_lock())
            && names.contains(&self.settings.names.dot_lock()))
    }

    // ─── Allowlist ───

    fn write_flag(&self) -> Result<()> {
        let path = &self.settings.flag_path;
        if let Some(parent) = path.parent() {
            crate::utils::create_private_dir(parent).map_err(|e| Error::from_io(e, parent))?;
        }
        std::fs::write(path, format!("{}\n", std::process::id()))
            .map_err(|e| Error::from_io(e, path))
    }

    fn clear_flag(&self) {
        match std::fs::remove_file(&self.settings.flag_path) {
            Ok(()) => debug!("Allowlist flag cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove allowlist flag: {}", e),
        }
    }

    pub fn flag_path(&self) -> &Path {
        &self.settings.flag_path
    }

    /// Pid recorded in the flag file, if the file exists and holds one.
    pub fn flag_owner(&self) -> Option<i32> {
        std::fs::read_to_string(&self.settings.flag_path)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Whether another running process owns the allowlist rules.
    pub fn held_elsewhere(&self) -> bool {
        self.flag_owner()
            .is_some_and(|pid| pid != getpid().as_raw() && process_alive(pid))
    }

    /// Deletes every rule in `names`, trying all of them.
    async fn delete_all(&self, names: &[String]) -> Result<()> {
        let mut first_error = None;
        for name in names {
            if let Err(e) = self.backend().delete_rule(name).await {
                warn!("Could not delete firewall rule {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Blocks all outbound traffic except loopback, the allowlist and the
    /// local subnet, then starts the refresh loop. Reports `AlreadyActive`
    /// when this or another live process already owns the rules.
    ///
    /// # Errors
    ///
    /// Fails if the flag file or the block-all rule cannot be created; any
    /// partially created rules are removed again in that case.
    pub async fn enable_allowlist(&self) -> Result<AllowlistEnable> {
        let mut task = self.allowlist.lock().await;
        if task.is_some() {
            warn!("Allowlist mode already active");
            return Ok(AllowlistEnable::AlreadyActive);
        }
        if self.held_elsewhere() {
            warn!(
                "Allowlist mode already held by process {}",
                self.flag_owner().unwrap_or_default()
            );
            return Ok(AllowlistEnable::AlreadyActive);
        }

        info!("Enabling allowlist mode");
        self.write_flag()?;

        let names = self.settings.names.allowlist_all();
        let block_all = RuleSpec {
            name: self.settings.names.allowlist_block_all(),
            action: Action::Block,
            protocol: Protocol::Any,
            remote: Vec::new(),
            remote_port: None,
        };
        let loopback = RuleSpec {
            name: self.settings.names.allowlist_allow("loopback"),
            action: Action::Allow,
            protocol: Protocol::Any,
            remote: loopback_ranges(),
            remote_port: None,
        };
        let created = async {
            self.delete_all(&names).await?;
            self.backend().create_rule(&loopback).await?;
            self.backend().create_rule(&block_all).await
        }
        .await;
        if let Err(e) = created {
            error!("Allowlist base rules failed: {}", e);
            if self.delete_all(&names).await.is_ok() {
                self.clear_flag();
            }
            return Err(e);
        }

        let allowed_ips = match self.context.refresh().await {
            Ok(count) => count,
            Err(e) => {
                warn!("Allowlist allow rule failed: {}", e);
                0
            }
        };

        let local = RuleSpec {
            name: self.settings.names.allowlist_allow("local"),
            action: Action::Allow,
            protocol: Protocol::Any,
            remote: self.context.resolver.local_subnets(),
            remote_port: None,
        };
        if let Err(e) = self.backend().create_rule(&local).await {
            warn!("Allowlist local-subnet rule failed: {}", e);
        }

        *task = Some(self.spawn_refresh());
        info!("Allowlist mode active ({} addresses allowed)", allowed_ips);
        Ok(AllowlistEnable::Enabled { allowed_ips })
    }

    fn spawn_refresh(&self) -> RefreshTask {
        let (stop, mut stopped) = watch::channel(false);
        let context = Arc::clone(&self.context);
        let interval = self.settings.refresh_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    _ = stopped.changed() => break,
                }
                if *stopped.borrow() {
                    break;
                }
                debug!("Refreshing allowlist addresses");
                match context.refresh().await {
                    Ok(count) => debug!("Allowlist refreshed ({} addresses)", count),
                    Err(e) => warn!("Allowlist refresh failed: {}", e),
                }
            }
            debug!("Allowlist refresh loop stopped");
        });

        RefreshTask { stop, handle }
    }

    /// Stops the refresh loop and removes every allowlist rule.
    ///
    /// # Errors
    ///
    /// Returns the first rule deletion failure. The flag file is kept in
    /// that case so the next startup cleans up.
    pub async fn disable_allowlist(&self) -> Result<()> {
        let mut task = self.allowlist.lock().await;
        if let Some(RefreshTask { stop, mut handle }) = task.take() {
            let _ = stop.send(true);
            if tokio::time::timeout(self.settings.join_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    "Allowlist refresh loop did not stop within {:?}; abandoning it",
                    self.settings.join_timeout
                );
                handle.abort();
            }
        }

        self.delete_all(&self.settings.names.allowlist_all())
            .await?;
        self.clear_flag();
        info!("Allowlist mode disabled");
        Ok(())
    }

    pub async fn is_allowlist_active(&self) -> bool {
        self.allowlist.lock().await.is_some()
    }

    /// Removes allowlist rules left behind by a crashed run.
    ///
    /// Returns whether an orphaned rule set was found. Rules whose flag
    /// names another live process are left alone.
    ///
    /// # Errors
    ///
    /// Returns the first deletion failure; the flag stays for a later retry.
    pub async fn cleanup_orphaned_allowlist(&self) -> Result<bool> {
        let task = self.allowlist.lock().await;
        if task.is_some() || !self.settings.flag_path.exists() {
            return Ok(false);
        }
        if self.held_elsewhere() {
            debug!(
                "Allowlist rules belong to running process {}",
                self.flag_owner().unwrap_or_default()
            );
            return Ok(false);
        }
        warn!("Orphaned allowlist rules detected; cleaning up");
        self.delete_all(&self.settings.names.allowlist_all())
            .await?;
        self.clear_flag();
        info!("Orphaned allowlist rules removed");
        Ok(true)
    }

    /// Removes every rule curfew manages.
    ///
    /// # Errors
    ///
    /// Returns the first failure after attempting both groups.
    pub async fn cleanup_all(&self) -> Result<()> {
        let allowlist = self.disable_allowlist().await;
        let dns = self.disable_dns_lock().await;
        allowlist.and(dns)
    }
}

/// Signal 0 only checks for existence; EPERM still means the pid is taken.
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{MemoryBackend, StaticResolver};

    fn manager(
        dir: &Path,
        refresh: Duration,
    ) -> (
        FirewallManager<MemoryBackend, StaticResolver>,
        Arc<MemoryBackend>,
    ) {
        let config = crate::config::EnforcerConfig::default();
        let mut settings = FirewallSettings::from_config(&config, &crate::config::Paths::in_dir(dir));
        settings.allowlist_domains = vec!["github.com".to_string(), "nx.invalid".to_string()];
        settings.refresh_interval = refresh;
        settings.join_timeout = Duration::from_secs(1);

        let backend = Arc::new(MemoryBackend::default());
        let resolver = Arc::new(StaticResolver::default().with("github.com", &["140.82.121.3"]));
        (
            FirewallManager::new(settings, Arc::clone(&backend), resolver),
            backend,
        )
    }

    #[tokio::test]
    async fn test_dns_lock_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));

        fw.enable_dns_lock().await.unwrap();
        fw.enable_dns_lock().await.unwrap();

        assert!(fw.is_dns_locked().await.unwrap());
        let names = fw.names().clone();
        let dns_rules: Vec<_> = backend
            .specs()
            .into_iter()
            .filter(|s| names.is_dns_lock(&s.name))
            .collect();
        assert_eq!(dns_rules.len(), 2);
        assert_eq!(dns_rules[0].remote.len(), 8);
        assert_eq!(dns_rules[1].remote_port, Some(853));

        fw.disable_dns_lock().await.unwrap();
        assert!(!fw.is_dns_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_dns_lock_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));
        backend.fail_create(&fw.names().dot_lock());

        assert!(fw.enable_dns_lock().await.is_err());
        // The resolver rule does not depend on the DoT rule
        assert!(fw.is_dns_locked().await.unwrap());
        assert!(!fw.dns_lock_intact().await.unwrap());
    }

    #[tokio::test]
    async fn test_allowlist_enable_disable_leaves_no_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));

        let outcome = fw.enable_allowlist().await.unwrap();
        assert_eq!(outcome, AllowlistEnable::Enabled { allowed_ips: 3 });
        assert!(fw.is_allowlist_active().await);
        assert!(fw.flag_path().exists());

        let allow = backend.spec(&fw.names().allowlist_allow("0")).unwrap();
        assert_eq!(allow.action, Action::Allow);
        assert!(allow.remote.contains(&"127.0.0.1/32".parse().unwrap()));
        assert!(allow.remote.contains(&"255.255.255.255/32".parse().unwrap()));
        assert!(backend.spec(&fw.names().allowlist_allow("local")).is_some());
        assert!(backend.spec(&fw.names().allowlist_block_all()).is_some());

        assert_eq!(
            fw.enable_allowlist().await.unwrap(),
            AllowlistEnable::AlreadyActive
        );

        fw.disable_allowlist().await.unwrap();
        let names = fw.names().clone();
        assert!(backend.specs().iter().all(|s| !names.is_allowlist(&s.name)));
        assert!(!fw.flag_path().exists());
        assert!(!fw.is_allowlist_active().await);
    }

    /// Whether some allow rule lets traffic to `ip` through.
    fn allows(backend: &MemoryBackend, ip: IpAddr) -> bool {
        backend
            .specs()
            .iter()
            .filter(|s| s.action == Action::Allow)
            .any(|s| s.remote.iter().any(|net| net.contains(ip)))
    }

    #[tokio::test]
    async fn test_allowlist_keeps_loopback_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));
        fw.enable_allowlist().await.unwrap();

        // systemd-resolved stub and IPv6 loopback
        assert!(allows(&backend, "127.0.0.53".parse().unwrap()));
        assert!(allows(&backend, "::1".parse().unwrap()));
        assert!(!allows(&backend, "93.184.216.34".parse().unwrap()));

        let loopback = backend.spec(&fw.names().allowlist_allow("loopback")).unwrap();
        let commands = crate::core::firewall::nft_rule_commands("curfew", &loopback);
        assert_eq!(commands.len(), 2);
        assert!(commands.iter().all(|c| c.get("insert").is_some()));

        fw.disable_allowlist().await.unwrap();
        assert!(backend.spec(&fw.names().allowlist_allow("loopback")).is_none());
    }

    #[tokio::test]
    async fn test_allowlist_without_loopback_rule_is_not_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));
        backend.fail_create(&fw.names().allowlist_allow("loopback"));

        assert!(fw.enable_allowlist().await.is_err());
        assert!(backend.spec(&fw.names().allowlist_block_all()).is_none());
        assert!(!fw.flag_path().exists());
    }

    #[tokio::test]
    async fn test_allowlist_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));
        backend.fail_create(&fw.names().allowlist_block_all());

        assert!(fw.enable_allowlist().await.is_err());
        assert!(!fw.is_allowlist_active().await);
        assert!(!fw.flag_path().exists());
        assert!(backend.specs().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_loop_reapplies_allow_rule() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_millis(20));
        let allow = fw.names().allowlist_allow("0");

        fw.enable_allowlist().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(backend.create_count(&allow) >= 2);

        fw.disable_allowlist().await.unwrap();
        let after = backend.create_count(&allow);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(backend.create_count(&allow), after);
        assert!(backend.spec(&allow).is_none());
    }

    #[tokio::test]
    async fn test_orphan_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));
        fw.enable_allowlist().await.unwrap();

        // A fresh manager over the same rule table and state dir models a
        // restart after a crash
        let config = crate::config::EnforcerConfig::default();
        let settings =
            FirewallSettings::from_config(&config, &crate::config::Paths::in_dir(dir.path()));
        let restarted = FirewallManager::new(
            settings,
            Arc::clone(&backend),
            Arc::new(StaticResolver::default()),
        );

        assert!(restarted.cleanup_orphaned_allowlist().await.unwrap());
        assert!(!restarted.flag_path().exists());
        let names = restarted.names().clone();
        assert!(backend.specs().iter().all(|s| !names.is_allowlist(&s.name)));
        assert!(!restarted.cleanup_orphaned_allowlist().await.unwrap());

        fw.disable_allowlist().await.unwrap();
    }

    #[tokio::test]
    async fn test_orphan_cleanup_keeps_flag_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));
        std::fs::write(fw.flag_path(), "stale\n").unwrap();
        backend.fail_delete(&fw.names().allowlist_block_all());

        assert!(fw.cleanup_orphaned_allowlist().await.is_err());
        assert!(fw.flag_path().exists());
    }

    #[tokio::test]
    async fn test_live_owner_keeps_allowlist_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));
        fw.enable_allowlist().await.unwrap();
        fw.disable_allowlist().await.unwrap();

        // pid 1 always exists, so these rules belong to someone else
        let block_all = RuleSpec {
            name: fw.names().allowlist_block_all(),
            action: Action::Block,
            protocol: Protocol::Any,
            remote: Vec::new(),
            remote_port: None,
        };
        backend.create_rule(&block_all).await.unwrap();
        std::fs::write(fw.flag_path(), "1\n").unwrap();

        assert_eq!(fw.flag_owner(), Some(1));
        assert!(fw.held_elsewhere());
        assert!(!fw.cleanup_orphaned_allowlist().await.unwrap());
        assert!(fw.flag_path().exists());
        assert!(backend.spec(&block_all.name).is_some());
        assert_eq!(
            fw.enable_allowlist().await.unwrap(),
            AllowlistEnable::AlreadyActive
        );
        assert!(!fw.is_allowlist_active().await);
    }

    #[tokio::test]
    async fn test_dead_owner_allowlist_is_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));
        let block_all = RuleSpec {
            name: fw.names().allowlist_block_all(),
            action: Action::Block,
            protocol: Protocol::Any,
            remote: Vec::new(),
            remote_port: None,
        };
        backend.create_rule(&block_all).await.unwrap();
        std::fs::write(fw.flag_path(), "not-a-pid\n").unwrap();

        assert!(fw.flag_owner().is_none());
        assert!(!fw.held_elsewhere());
        assert!(fw.cleanup_orphaned_allowlist().await.unwrap());
        assert!(backend.spec(&block_all.name).is_none());
        assert!(!fw.flag_path().exists());
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(getpid().as_raw()));
        assert!(!process_alive(0));
        assert!(!process_alive(-4));
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        let dir = tempfile::tempdir().unwrap();
        let (fw, backend) = manager(dir.path(), Duration::from_secs(300));
        fw.enable_dns_lock().await.unwrap();
        fw.enable_allowlist().await.unwrap();

        fw.cleanup_all().await.unwrap();
        assert!(backend.specs().is_empty());
    }
}
