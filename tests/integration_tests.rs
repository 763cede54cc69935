//! Integration tests for curfew
//!
//! These drive the public API end to end: config files, restarts over the
//! same state directory, sessions and the fail-safe exit path. The hosts
//! file lives in a temp dir and the nft rule table is kept in memory, so no
//! privileges are needed:
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use chrono::{DateTime, Local, TimeZone};
use curfew::config::{self, EnforcerConfig, Paths};
use curfew::core::enforcer::SessionRecovery;
use curfew::core::error::{Error, Result};
use curfew::core::firewall::{RuleBackend, RuleSpec};
use curfew::core::network::AllowlistEnable;
use curfew::core::resolve::Resolver;
use curfew::core::usage::Clock;
use curfew::Enforcer;
use ipnetwork::IpNetwork;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const BASE: &str = "127.0.0.1 localhost\n::1 localhost\n";

#[derive(Default)]
struct Rules(Mutex<Vec<RuleSpec>>);

impl Rules {
    fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|r| r.name.clone()).collect()
    }
}

impl RuleBackend for Rules {
    async fn delete_rule(&self, name: &str) -> Result<usize> {
        let mut rules = self.0.lock().unwrap();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        Ok(before - rules.len())
    }

    async fn create_rule(&self, spec: &RuleSpec) -> Result<()> {
        self.0.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn rule_exists(&self, name: &str) -> Result<bool> {
        Ok(self.0.lock().unwrap().iter().any(|r| r.name == name))
    }

    async fn rule_names(&self) -> Result<Vec<String>> {
        let mut names = self.names();
        names.dedup();
        Ok(names)
    }
}

/// Every domain resolves to one documentation address.
struct OneAddress;

impl Resolver for OneAddress {
    async fn resolve(&self, _domain: &str) -> Result<Vec<Ipv4Addr>> {
        Ok(vec![Ipv4Addr::new(203, 0, 113, 7)])
    }

    fn local_subnets(&self) -> Vec<IpNetwork> {
        vec!["10.0.0.0/24".parse().unwrap()]
    }
}

struct ManualClock(Mutex<DateTime<Local>>);

impl ManualClock {
    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Self {
        Self(Mutex::new(
            Local.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap(),
        ))
    }

    fn advance_minutes(&self, minutes: i64) {
        *self.0.lock().unwrap() += chrono::Duration::minutes(minutes);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.0.lock().unwrap()
    }
}

struct Machine {
    dir: TempDir,
    hosts: PathBuf,
    rules: Arc<Rules>,
    clock: Arc<ManualClock>,
}

impl Machine {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(&hosts, BASE).unwrap();
        Self {
            dir,
            hosts,
            rules: Arc::new(Rules::default()),
            clock: Arc::new(ManualClock::at(2026, 5, 4, 21, 0)),
        }
    }

    fn config(&self) -> EnforcerConfig {
        EnforcerConfig {
            hosts_path: self.hosts.clone(),
            hosts_bom: false,
            dns_flush_command: None,
            data_dir: Some(self.dir.path().join("state")),
            ..EnforcerConfig::default()
        }
    }

    /// A new process over the same files and rule table.
    fn boot(&self) -> Enforcer<Rules, OneAddress> {
        let clock: Arc<dyn Clock> = self.clock.clone();
        Enforcer::with_parts(
            self.config(),
            Paths::in_dir(&self.dir.path().join("state")),
            Arc::clone(&self.rules),
            Arc::new(OneAddress),
            clock,
        )
        .unwrap()
    }

    fn hosts_text(&self) -> String {
        std::fs::read_to_string(&self.hosts).unwrap()
    }

    fn blocked(&self, enforcer: &Enforcer<Rules, OneAddress>, id: &str) -> bool {
        enforcer
            .hosts()
            .is_blocked(enforcer.config().platform(id).unwrap())
    }
}

#[test]
fn test_config_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("curfew").join("config.json");

    let mut cfg = EnforcerConfig {
        reset_hour: 6,
        ..EnforcerConfig::default()
    };
    cfg.platforms[0].daily_limit_minutes = 15;
    config::save_config_to(&cfg, &path).unwrap();

    let loaded = config::load_config_from(&path);
    assert_eq!(loaded.reset_hour, 6);
    assert_eq!(loaded.platforms[0].daily_limit_minutes, 15);
    assert!(loaded.validate().is_ok());
}

#[test]
fn test_corrupt_config_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    let loaded = config::load_config_from(&path);
    assert_eq!(loaded.reset_hour, EnforcerConfig::default().reset_hour);
}

#[tokio::test]
async fn test_locked_blackout_across_restart() {
    let machine = Machine::new();

    let first = machine.boot();
    first.startup().await;
    first.start_blackout(30, true).await.unwrap();
    assert!(machine.blocked(&first, "instagram"));
    assert!(machine.blocked(&first, "youtube"));
    assert!(matches!(
        first.end_blackout(false).await,
        Err(Error::SessionLocked(_))
    ));
    drop(first);

    machine.clock.advance_minutes(5);
    let second = machine.boot();
    let report = second.startup().await;
    assert!(matches!(
        report.blackout,
        SessionRecovery::Resumed {
            remaining_minutes: 25,
            locked: true
        }
    ));
    assert!(second.unblock_platform("youtube").await.is_err());

    machine.clock.advance_minutes(26);
    let integrity = second.integrity_check().await;
    assert_eq!(integrity.expired_sessions, vec!["blackout"]);
    assert!(!machine.blocked(&second, "youtube"));
    assert!(!machine.blocked(&second, "instagram"));
}

#[tokio::test]
async fn test_quota_spent_elsewhere_blocks_at_startup() {
    let machine = Machine::new();
    let enforcer = machine.boot();
    enforcer.usage().add_usage("instagram", 600.0).unwrap();
    drop(enforcer);

    let enforcer = machine.boot();
    let report = enforcer.startup().await;
    assert_eq!(report.quota_blocked, vec!["instagram".to_string()]);
    assert!(machine.blocked(&enforcer, "instagram"));
    assert!(!machine.blocked(&enforcer, "youtube"));
    assert!(enforcer.start_usage_session("instagram").await.is_err());

    // The next logical day starts after the reset hour
    machine.clock.advance_minutes(9 * 60);
    assert_eq!(enforcer.usage().get_remaining_seconds("instagram").unwrap(), 600.0);
}

#[tokio::test]
async fn test_allowlist_then_fail_safe_exit() {
    let machine = Machine::new();
    let enforcer = machine.boot();
    enforcer.startup().await;
    let dns_rules = machine.rules.names().len();

    let enabled = enforcer.start_allowlist(None, false).await.unwrap();
    assert!(matches!(enabled, AllowlistEnable::Enabled { allowed_ips } if allowed_ips > 0));
    assert!(machine.rules.names().len() > dns_rules);
    assert!(enforcer.firewall().is_allowlist_active().await);

    let report = enforcer.shutdown().await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert!(report.allowlist_disabled);
    assert_eq!(report.platforms_blocked, 2);
    assert!(machine.blocked(&enforcer, "instagram"));
    assert!(machine.blocked(&enforcer, "youtube"));
    // Only the DNS lock outlives the process
    assert_eq!(machine.rules.names().len(), dns_rules);
    assert!(enforcer.firewall().dns_lock_intact().await.unwrap());
}

#[tokio::test]
async fn test_permanent_entries_and_uninstall() {
    let machine = Machine::new();
    let enforcer = machine.boot();
    enforcer.startup().await;

    let total = enforcer
        .add_permanent("Forum", &["forum.example".to_string()])
        .await
        .unwrap();
    assert!(total > 0);
    assert!(machine.hosts_text().contains("forum.example"));

    assert!(enforcer.remove_permanent("Forum").await.unwrap());
    assert!(!machine.hosts_text().contains("forum.example"));
    assert!(!enforcer.remove_permanent("Forum").await.unwrap());

    enforcer.block_platform("youtube").await.unwrap();
    enforcer.uninstall().await.unwrap();
    assert_eq!(machine.hosts_text(), BASE);
    assert!(machine.rules.names().is_empty());

    let events = enforcer.audit().read_recent(50).await.unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.success));
}
