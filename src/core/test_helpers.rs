//! Shared test utilities for core module tests
//!
//! In-memory stand-ins for the rule table, the resolver and the clock, plus
//! a temp-dir hosts fixture. Nothing here touches the real hosts file or
//! nftables. This module is only compiled in test mode.

use crate::config::{EnforcerConfig, Paths};
use crate::core::error::{CommandFailure, Error, Result};
use crate::core::firewall::{RuleBackend, RuleSpec};
use crate::core::resolve::Resolver;
use crate::core::usage::Clock;
use chrono::{DateTime, Local, NaiveDate, TimeZone};
use ipnetwork::IpNetwork;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::TempDir;

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("CURFEW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("CURFEW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

#[derive(Default)]
struct MemoryState {
    rules: Vec<RuleSpec>,
    fail_create: HashSet<String>,
    fail_delete: HashSet<String>,
    created: HashMap<String, usize>,
}

/// Rule table kept in memory, in creation order.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

fn injected(name: &str) -> Error {
    Error::ExternalCommand {
        program: "nft".to_string(),
        message: format!("injected failure for {name}"),
        stderr: Some("Error: Could not process rule".to_string()),
        exit_code: Some(1),
        failure: CommandFailure::Other,
    }
}

impl MemoryBackend {
    pub fn specs(&self) -> Vec<RuleSpec> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn spec(&self, name: &str) -> Option<RuleSpec> {
        self.state
            .lock()
            .unwrap()
            .rules
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }

    /// Makes every later `create_rule(name)` fail.
    pub fn fail_create(&self, name: &str) {
        self.state.lock().unwrap().fail_create.insert(name.to_string());
    }

    /// Makes every later `delete_rule(name)` fail.
    pub fn fail_delete(&self, name: &str) {
        self.state.lock().unwrap().fail_delete.insert(name.to_string());
    }

    /// How many times `name` was successfully created.
    pub fn create_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .created
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Removes a rule behind the manager's back, as a user would with `nft`.
    pub fn tamper_delete(&self, name: &str) {
        self.state.lock().unwrap().rules.retain(|r| r.name != name);
    }
}

impl RuleBackend for MemoryBackend {
    async fn delete_rule(&self, name: &str) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete.contains(name) {
            return Err(injected(name));
        }
        let before = state.rules.len();
        state.rules.retain(|r| r.name != name);
        Ok(before - state.rules.len())
    }

    async fn create_rule(&self, spec: &RuleSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create.contains(&spec.name) {
            return Err(injected(&spec.name));
        }
        state.rules.push(spec.clone());
        *state.created.entry(spec.name.clone()).or_default() += 1;
        Ok(())
    }

    async fn rule_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().rules.iter().any(|r| r.name == name))
    }

    async fn rule_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for rule in &self.state.lock().unwrap().rules {
            if !names.contains(&rule.name) {
                names.push(rule.name.clone());
            }
        }
        Ok(names)
    }
}

/// Resolver answering from a fixed table; unknown names fail.
pub struct StaticResolver {
    answers: HashMap<String, Vec<Ipv4Addr>>,
    subnets: Vec<IpNetwork>,
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self {
            answers: HashMap::new(),
            subnets: vec!["192.168.1.0/24".parse().unwrap()],
        }
    }
}

impl StaticResolver {
    pub fn with(mut self, domain: &str, ips: &[&str]) -> Self {
        self.answers.insert(
            domain.to_string(),
            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        );
        self
    }
}

impl Resolver for StaticResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<Ipv4Addr>> {
        self.answers
            .get(domain)
            .cloned()
            .ok_or_else(|| Error::Resolution {
                domain: domain.to_string(),
                message: "no such host".to_string(),
            })
    }

    fn local_subnets(&self) -> Vec<IpNetwork> {
        self.subnets.clone()
    }
}

/// Clock that only moves when told to.
pub struct FixedClock {
    now: Mutex<DateTime<Local>>,
}

impl FixedClock {
    /// Local wall-clock time on a date without a DST transition.
    pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Self {
        Self {
            now: Mutex::new(local(year, month, day, hour, minute)),
        }
    }

    pub fn set(&self, year: i32, month: u32, day: u32, hour: u32, minute: u32) {
        *self.now.lock().unwrap() = local(year, month, day, hour, minute);
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap()
    }
}

pub fn local(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Local> {
    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap();
    Local.from_local_datetime(&naive).earliest().unwrap()
}

/// Temp directory holding a hosts file and a state directory.
pub struct HostsFixture {
    pub dir: TempDir,
    pub hosts: PathBuf,
}

impl HostsFixture {
    pub fn paths(&self) -> Paths {
        Paths::in_dir(&self.dir.path().join("state"))
    }
}

pub fn hosts_fixture(text: &str) -> HostsFixture {
    let dir = tempfile::tempdir().unwrap();
    let hosts = dir.path().join("hosts");
    std::fs::write(&hosts, text).unwrap();
    std::fs::create_dir_all(dir.path().join("state")).unwrap();
    HostsFixture { dir, hosts }
}

/// Default config pointed at the fixture, with no DNS flush.
pub fn test_config(fx: &HostsFixture) -> EnforcerConfig {
    EnforcerConfig {
        hosts_path: fx.hosts.clone(),
        hosts_bom: false,
        dns_flush_command: None,
        data_dir: Some(fx.dir.path().join("state")),
        ..EnforcerConfig::default()
    }
}
