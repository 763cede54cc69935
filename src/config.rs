use crate::core::atomic::{WriteOptions, write_atomic};
use crate::core::error::{Error, Result};
use crate::core::sections::SectionMarkers;
use crate::utils::{get_config_dir, get_data_dir, get_state_dir};
use crate::validators::{validate_domain, validate_marker_tag, validate_platform_id};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Marker tag of the permanent-block section
pub const PERMANENT_TAG: &str = "PERMANENT";

const CONFIG_FILE: &str = "config.json";

/// A site whose daily use is limited.
///
/// Descriptors are read from the config and never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: String,
    pub display_name: String,
    pub daily_limit_minutes: u32,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Process names to terminate while blocked (handled outside curfew)
    #[serde(default)]
    pub process_names: Vec<String>,
    pub marker_tag: String,
    #[serde(default)]
    pub icon: String,
}

impl Platform {
    pub fn markers(&self, namespace: &str) -> SectionMarkers {
        SectionMarkers::new(namespace, &self.marker_tag)
    }

    pub fn usage_file_name(&self) -> String {
        format!("usage_{}.json", self.id)
    }

    pub fn daily_limit_seconds(&self) -> f64 {
        f64::from(self.daily_limit_minutes) * 60.0
    }
}

/// Complete enforcer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcerConfig {
    #[serde(default = "default_hosts_path")]
    pub hosts_path: PathBuf,
    /// Write the hosts file with a UTF-8 byte-order mark
    #[serde(default = "default_hosts_bom")]
    pub hosts_bom: bool,
    #[serde(default = "default_redirect_ip")]
    pub redirect_ip: IpAddr,
    /// Prefix of every hosts marker (`# >>> CURFEW-<TAG>-START <<<`)
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Local hour (0-23) at which the usage day rolls over
    #[serde(default = "default_reset_hour")]
    pub reset_hour: u32,
    /// Minutes remaining at which warnings fire, descending
    #[serde(default = "default_warning_steps")]
    pub warning_steps: Vec<u32>,
    #[serde(default = "default_platforms")]
    pub platforms: Vec<Platform>,
    /// Built-in permanent list; user entries are merged after it
    #[serde(default = "default_permanent_domains")]
    pub permanent_domains: Vec<String>,
    /// Public resolvers blocked by the DNS lock
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default = "default_dot_port")]
    pub dot_port: u16,
    #[serde(default = "default_rule_prefix")]
    pub rule_prefix: String,
    #[serde(default = "default_nft_table")]
    pub nft_table: String,
    #[serde(default = "default_allowlist_domains")]
    pub allowlist_domains: Vec<String>,
    #[serde(default = "default_allowlist_refresh_secs")]
    pub allowlist_refresh_secs: u64,
    /// Upper bound for every external command (nft, DNS flush)
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
    #[serde(default = "default_integrity_interval_secs")]
    pub integrity_interval_secs: u64,
    /// Program and arguments run after every hosts change; `None` disables it
    #[serde(default = "default_dns_flush_command")]
    pub dns_flush_command: Option<Vec<String>>,
    /// Overrides both the XDG data and state directories
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Block every platform and re-assert the permanent list on shutdown
    #[serde(default = "default_true")]
    pub fail_safe_block_on_exit: bool,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            hosts_path: default_hosts_path(),
            hosts_bom: default_hosts_bom(),
            redirect_ip: default_redirect_ip(),
            namespace: default_namespace(),
            reset_hour: default_reset_hour(),
            warning_steps: default_warning_steps(),
            platforms: default_platforms(),
            permanent_domains: default_permanent_domains(),
            dns_servers: default_dns_servers(),
            dot_port: default_dot_port(),
            rule_prefix: default_rule_prefix(),
            nft_table: default_nft_table(),
            allowlist_domains: default_allowlist_domains(),
            allowlist_refresh_secs: default_allowlist_refresh_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            join_timeout_secs: default_join_timeout_secs(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
            integrity_interval_secs: default_integrity_interval_secs(),
            dns_flush_command: default_dns_flush_command(),
            data_dir: None,
            fail_safe_block_on_exit: true,
        }
    }
}

fn default_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

fn default_hosts_bom() -> bool {
    cfg!(windows)
}

fn default_redirect_ip() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_namespace() -> String {
    "CURFEW".to_string()
}

fn default_reset_hour() -> u32 {
    4
}

fn default_warning_steps() -> Vec<u32> {
    vec![5, 1]
}

fn default_dot_port() -> u16 {
    853
}

fn default_rule_prefix() -> String {
    "Curfew".to_string()
}

fn default_nft_table() -> String {
    "curfew".to_string()
}

fn default_allowlist_refresh_secs() -> u64 {
    300
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_join_timeout_secs() -> u64 {
    5
}

fn default_resolve_timeout_secs() -> u64 {
    5
}

fn default_integrity_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_dns_flush_command() -> Option<Vec<String>> {
    let argv: &[&str] = if cfg!(windows) {
        &["ipconfig", "/flushdns"]
    } else {
        &["resolvectl", "flush-caches"]
    };
    Some(argv.iter().map(ToString::to_string).collect())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

fn default_platforms() -> Vec<Platform> {
    vec![
        Platform {
            id: "instagram".to_string(),
            display_name: "Instagram".to_string(),
            daily_limit_minutes: 10,
            domains: strings(&[
                "instagram.com",
                "www.instagram.com",
                "api.instagram.com",
                "i.instagram.com",
                "graph.instagram.com",
                "l.instagram.com",
                "static.cdninstagram.com",
                "scontent.cdninstagram.com",
                "edge-chat.instagram.com",
                "scontent-mad1-1.cdninstagram.com",
                "scontent-mad2-1.cdninstagram.com",
            ]),
            process_names: strings(&["Instagram.exe", "InstagramApp.exe"]),
            marker_tag: "INSTAGRAM".to_string(),
            icon: "camera".to_string(),
        },
        Platform {
            id: "youtube".to_string(),
            display_name: "YouTube".to_string(),
            daily_limit_minutes: 60,
            domains: strings(&[
                "youtube.com",
                "www.youtube.com",
                "m.youtube.com",
                "youtu.be",
                "youtube-nocookie.com",
                "www.youtube-nocookie.com",
                "youtubei.googleapis.com",
                "yt3.ggpht.com",
                "yt3.googleusercontent.com",
                "i.ytimg.com",
                "s.ytimg.com",
            ]),
            process_names: Vec::new(),
            marker_tag: "YOUTUBE".to_string(),
            icon: "play".to_string(),
        },
    ]
}

fn default_permanent_domains() -> Vec<String> {
    let bare = [
        // Social media
        "instagram.com",
        "youtube.com",
        // Adult content
        "pornhub.com",
        "xvideos.com",
        "xnxx.com",
        "xhamster.com",
        "redtube.com",
        "youporn.com",
        "tube8.com",
        "spankbang.com",
        "beeg.com",
        "eporner.com",
        "hqporner.com",
        "tnaflix.com",
        "drtuber.com",
        "motherless.com",
        "ixxx.com",
        "thumbzilla.com",
        "porn.com",
        "4tube.com",
        "nuvid.com",
        "porntrex.com",
        "fuq.com",
        "fapello.com",
        // Cam sites
        "chaturbate.com",
        "stripchat.com",
        "bongacams.com",
        "cam4.com",
        "myfreecams.com",
        "camsoda.com",
        "livejasmin.com",
        // Subscription platforms
        "onlyfans.com",
        "fansly.com",
        // Anime
        "hentaihaven.xxx",
        "hanime.tv",
        "nhentai.net",
    ];

    let mut domains = Vec::with_capacity(bare.len() * 2 + 16);
    for domain in bare {
        domains.push(domain.to_string());
        domains.push(format!("www.{domain}"));
        // Social media subdomains that the bare/www pair does not cover
        match domain {
            "instagram.com" => domains.extend(strings(&[
                "api.instagram.com",
                "i.instagram.com",
                "graph.instagram.com",
                "l.instagram.com",
                "static.cdninstagram.com",
                "scontent.cdninstagram.com",
                "edge-chat.instagram.com",
            ])),
            "youtube.com" => domains.extend(strings(&[
                "m.youtube.com",
                "youtu.be",
                "youtube-nocookie.com",
                "www.youtube-nocookie.com",
                "youtubei.googleapis.com",
                "yt3.ggpht.com",
                "yt3.googleusercontent.com",
                "i.ytimg.com",
                "s.ytimg.com",
            ])),
            _ => {}
        }
    }
    domains
}

fn default_dns_servers() -> Vec<IpAddr> {
    [
        [8, 8, 8, 8],
        [8, 8, 4, 4],
        [1, 1, 1, 1],
        [1, 0, 0, 1],
        [208, 67, 222, 222],
        [208, 67, 220, 220],
        [9, 9, 9, 9],
        [149, 112, 112, 112],
    ]
    .into_iter()
    .map(IpAddr::from)
    .collect()
}

fn default_allowlist_domains() -> Vec<String> {
    strings(&[
        "docs.google.com",
        "drive.google.com",
        "mail.google.com",
        "calendar.google.com",
        "meet.google.com",
        "stackoverflow.com",
        "github.com",
        "gitlab.com",
        "pypi.org",
        "npmjs.com",
        "developer.mozilla.org",
        "slack.com",
        "notion.so",
        "linear.app",
    ])
}

fn invalid(field: &str, message: impl Into<String>) -> Error {
    Error::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

impl EnforcerConfig {
    /// Checks every field that would otherwise fail deep inside an operation.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.reset_hour > 23 {
            return Err(invalid("reset_hour", "must be between 0 and 23"));
        }
        if self.allowlist_refresh_secs == 0 {
            return Err(invalid("allowlist_refresh_secs", "must be greater than 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(invalid("command_timeout_secs", "must be greater than 0"));
        }
        if self.namespace.is_empty() || self.rule_prefix.is_empty() {
            return Err(invalid("namespace", "namespace and rule prefix are required"));
        }
        validate_marker_tag(&self.namespace).map_err(|m| invalid("namespace", m))?;

        let mut ids = HashSet::new();
        let mut tags = HashSet::new();
        for platform in &self.platforms {
            validate_platform_id(&platform.id).map_err(|m| invalid("platforms.id", m))?;
            validate_marker_tag(&platform.marker_tag)
                .map_err(|m| invalid("platforms.marker_tag", m))?;
            if platform.marker_tag == PERMANENT_TAG {
                return Err(invalid(
                    "platforms.marker_tag",
                    format!("'{PERMANENT_TAG}' is reserved"),
                ));
            }
            if !ids.insert(platform.id.as_str()) {
                return Err(invalid(
                    "platforms.id",
                    format!("duplicate platform id '{}'", platform.id),
                ));
            }
            if !tags.insert(platform.marker_tag.as_str()) {
                return Err(invalid(
                    "platforms.marker_tag",
                    format!("duplicate marker tag '{}'", platform.marker_tag),
                ));
            }
            for domain in &platform.domains {
                validate_domain(domain).map_err(|m| invalid("platforms.domains", m))?;
            }
        }

        for domain in &self.permanent_domains {
            validate_domain(domain).map_err(|m| invalid("permanent_domains", m))?;
        }
        for domain in &self.allowlist_domains {
            validate_domain(domain).map_err(|m| invalid("allowlist_domains", m))?;
        }
        Ok(())
    }

    pub fn platform(&self, id: &str) -> Option<&Platform> {
        self.platforms.iter().find(|p| p.id == id)
    }

    /// Like [`platform`](Self::platform) but failing with `UnknownPlatform`.
    pub fn require_platform(&self, id: &str) -> Result<&Platform> {
        self.platform(id)
            .ok_or_else(|| Error::UnknownPlatform(id.to_string()))
    }

    /// Largest warning step, in seconds
    pub fn warning_threshold_secs(&self) -> f64 {
        f64::from(self.warning_steps.iter().copied().max().unwrap_or(0)) * 60.0
    }

    pub fn permanent_markers(&self) -> SectionMarkers {
        SectionMarkers::new(&self.namespace, PERMANENT_TAG)
    }

    /// Resolves where persistent and volatile files live.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` when no home directory can be determined
    /// and no `data_dir` override is configured.
    pub fn paths(&self) -> Result<Paths> {
        if let Some(dir) = &self.data_dir {
            return Ok(Paths::in_dir(dir));
        }
        match (get_data_dir(), get_state_dir()) {
            (Some(data_dir), Some(state_dir)) => Ok(Paths {
                data_dir,
                state_dir,
            }),
            _ => Err(Error::Internal(
                "could not determine data directory".to_string(),
            )),
        }
    }
}

/// Locations of every file curfew owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Ledgers, permanent store, hosts backup
    pub data_dir: PathBuf,
    /// Session files, crash flag, audit log
    pub state_dir: PathBuf,
}

impl Paths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            data_dir: dir.to_path_buf(),
            state_dir: dir.to_path_buf(),
        }
    }

    pub fn hosts_backup(&self) -> PathBuf {
        self.data_dir.join("hosts.backup")
    }

    pub fn schedules_file(&self) -> PathBuf {
        self.data_dir.join("schedules.json")
    }

    pub fn permanent_store(&self) -> PathBuf {
        self.data_dir.join("permanent_blocks.json")
    }

    pub fn usage_file(&self, platform: &Platform) -> PathBuf {
        self.data_dir.join(platform.usage_file_name())
    }

    pub fn allowlist_flag(&self) -> PathBuf {
        self.state_dir.join("allowlist_active.flag")
    }

    pub fn blackout_session(&self) -> PathBuf {
        self.state_dir.join("blackout_state.json")
    }

    pub fn web_block_session(&self) -> PathBuf {
        self.state_dir.join("web_block_state.json")
    }

    pub fn allowlist_session(&self) -> PathBuf {
        self.state_dir.join("allowlist_state.json")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join("audit.log")
    }

    /// Creates both directories with user-only permissions.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.state_dir] {
            crate::utils::create_private_dir(dir).map_err(|e| Error::from_io(e, dir))?;
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Loads the config from `path`, or returns defaults if it is missing or
/// cannot be parsed.
pub fn load_config_from(path: &Path) -> EnforcerConfig {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return EnforcerConfig::default(),
        Err(e) => {
            warn!("Could not read {:?}: {}; using defaults", path, e);
            return EnforcerConfig::default();
        }
    };
    match serde_json::from_str::<EnforcerConfig>(&json) {
        Ok(config) => config,
        Err(e) => {
            warn!("Config {:?} is corrupt ({}); using defaults", path, e);
            EnforcerConfig::default()
        }
    }
}

/// Loads the config from the XDG config directory.
pub fn load_config() -> EnforcerConfig {
    default_config_path().map_or_else(EnforcerConfig::default, |p| load_config_from(&p))
}

/// Saves `config` to `path` using the atomic writer.
///
/// # Errors
///
/// Returns an error if serialization fails or the file cannot be written.
pub fn save_config_to(config: &EnforcerConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        crate::utils::create_private_dir(parent).map_err(|e| Error::from_io(e, parent))?;
    }
    let json = serde_json::to_string_pretty(config)?;
    write_atomic(path, &json, &WriteOptions::default())?;
    Ok(())
}
