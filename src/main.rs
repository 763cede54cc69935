//! curfew - keeps distractions blocked on your own machine
//!
//! # Usage
//!
//! ```bash
//! curfew run                          # Enforce until Ctrl-C (startup, integrity loop, fail-safe exit)
//! curfew status                       # Quotas, blocks, DNS lock and sessions
//! curfew block youtube                # Block a platform now
//! curfew use instagram                # Unblock while quota lasts, then block again
//! curfew web-block start youtube --minutes 60 --locked
//! curfew blackout start --minutes 25
//! curfew allowlist enable --minutes 90  # Stays in the foreground until Ctrl-C or expiry
//! curfew schedule add "School night" --days weekdays --start 21:00 --end 23:00
//! curfew permanent add Reddit         # Add a preset to the permanent list
//! curfew uninstall                    # Remove every rule and section
//! ```
//!
//! Writing the hosts file needs root. `nft` calls elevate on their own
//! (run0, sudo or pkexec) unless curfew already runs as root.

use clap::{Parser, Subcommand};
use curfew::Enforcer;
use curfew::config::{self, EnforcerConfig};
use curfew::core::enforcer::{AllowlistWait, SessionRecovery, Status};
use curfew::core::error::{Error, ErrorTranslation};
use curfew::core::network::AllowlistEnable;
use curfew::core::permanent::presets;
use curfew::core::schedule::{ScheduleStore, parse_days, parse_time};
use curfew::core::usage::format_seconds;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "curfew", version)]
#[command(about = "Blocks distracting sites through the hosts file and nftables", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/curfew/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show quotas, blocks, DNS lock and sessions
    Status,
    /// Block a platform
    Block { platform: String },
    /// Unblock a platform (refused while a session or its quota holds it)
    Unblock { platform: String },
    /// Unblock a platform and count usage until its quota runs out or Ctrl-C
    Use { platform: String },
    /// Permanent block list
    Permanent {
        #[command(subcommand)]
        action: PermanentAction,
    },
    /// Rules blocking public DNS resolvers and DNS-over-TLS
    DnsLock {
        #[command(subcommand)]
        action: DnsLockAction,
    },
    /// Block all traffic except a fixed set of domains
    Allowlist {
        #[command(subcommand)]
        action: AllowlistAction,
    },
    /// Timed block of selected platforms
    WebBlock {
        #[command(subcommand)]
        action: WebBlockAction,
    },
    /// Timed block of every platform
    Blackout {
        #[command(subcommand)]
        action: BlackoutAction,
    },
    /// Daily quotas
    Usage {
        #[command(subcommand)]
        action: UsageAction,
    },
    /// Weekly windows that start a blackout while `curfew run` is active
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Run one integrity check
    Check,
    /// Enforce until Ctrl-C
    Run,
    /// Configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Remove every rule and hosts section curfew created
    Uninstall,
}

#[derive(Subcommand)]
enum PermanentAction {
    /// List built-in and user entries
    List,
    /// Add an entry; without domains, LABEL names a preset
    Add { label: String, domains: Vec<String> },
    /// Remove a user entry
    Remove { label: String },
    /// Rewrite the permanent section
    Apply,
    /// List quick-add presets
    Presets,
}

#[derive(Subcommand)]
enum DnsLockAction {
    Enable,
    Disable,
    Status,
}

#[derive(Subcommand)]
enum AllowlistAction {
    Enable {
        /// End automatically after this many minutes
        #[arg(short, long)]
        minutes: Option<u32>,
        /// Refuse to disable before the timer runs out
        #[arg(short, long, requires = "minutes")]
        locked: bool,
    },
    Disable {
        /// End a locked session early
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum WebBlockAction {
    Start {
        #[arg(required = true)]
        platforms: Vec<String>,
        #[arg(short, long)]
        minutes: u32,
        #[arg(short, long)]
        locked: bool,
    },
    End {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum BlackoutAction {
    Start {
        #[arg(short, long)]
        minutes: u32,
        #[arg(short, long)]
        locked: bool,
    },
    End {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum UsageAction {
    Show,
    /// Book seconds against today's quota
    Add { platform: String, seconds: f64 },
    Reset { platform: String },
}

#[derive(Subcommand)]
enum ScheduleAction {
    List,
    Add {
        name: String,
        /// `weekdays`, `weekend`, `daily`, or a list such as `mon,wed,fri`
        #[arg(short, long)]
        days: String,
        /// HH:MM
        #[arg(short, long)]
        start: String,
        /// HH:MM, later than the start on the same day
        #[arg(short, long)]
        end: String,
    },
    Remove { id: String },
    Enable { id: String },
    Disable { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the configuration file location
    Path,
    /// Write the current (or default) configuration to disk
    Init,
}

fn init_logging(config: &EnforcerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_file = config.paths().ok().and_then(|paths| {
        curfew::utils::create_private_dir(&paths.state_dir).ok()?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.state_dir.join("curfew.log"))
            .ok()
    });

    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(file)
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone().or_else(config::default_config_path);
    let config = match &config_path {
        Some(path) => config::load_config_from(path),
        None => EnforcerConfig::default(),
    };
    init_logging(&config);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli.command, config, config_path)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn report_error(err: &Error) {
    let translation = ErrorTranslation::from(err);
    eprintln!("Error: {}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  - {suggestion}");
    }
    if let Some(url) = &translation.help_url {
        eprintln!("  See {url}");
    }
}

fn warn_if_unprivileged() {
    if !curfew::elevation::is_root() {
        eprintln!("Note: not running as root; writing the hosts file will likely fail.");
    }
}

async fn handle_cli(
    command: Commands,
    config: EnforcerConfig,
    config_path: Option<PathBuf>,
) -> Result<(), Error> {
    if let Commands::Config { action } = &command {
        let path = config_path.ok_or_else(|| {
            Error::Internal("could not determine configuration directory".to_string())
        })?;
        match action {
            ConfigAction::Path => println!("{}", path.display()),
            ConfigAction::Init => {
                config.validate()?;
                curfew::utils::ensure_dirs().map_err(|e| Error::from_io(e, &path))?;
                config::save_config_to(&config, &path)?;
                println!("✓ Configuration written to {}", path.display());
            }
        }
        return Ok(());
    }

    let enforcer = Enforcer::new(config)?;
    match command {
        Commands::Status => print_status(&enforcer.status().await),
        Commands::Block { platform } => {
            warn_if_unprivileged();
            enforcer.block_platform(&platform).await?;
            println!("✓ {platform} blocked");
        }
        Commands::Unblock { platform } => {
            warn_if_unprivileged();
            enforcer.unblock_platform(&platform).await?;
            println!("✓ {platform} unblocked");
        }
        Commands::Use { platform } => use_platform(&enforcer, &platform).await?,
        Commands::Permanent { action } => permanent(&enforcer, action).await?,
        Commands::DnsLock { action } => match action {
            DnsLockAction::Enable => {
                enforcer.enable_dns_lock().await?;
                println!("✓ DNS lock enabled");
            }
            DnsLockAction::Disable => {
                enforcer.disable_dns_lock().await?;
                println!("✓ DNS lock removed");
            }
            DnsLockAction::Status => {
                let firewall = enforcer.firewall();
                let state = if firewall.dns_lock_intact().await? {
                    "active"
                } else if firewall.is_dns_locked().await? {
                    "partial (DoT rule missing; `curfew check` restores it)"
                } else {
                    "inactive"
                };
                println!("DNS lock: {state}");
            }
        },
        Commands::Allowlist { action } => match action {
            AllowlistAction::Enable { minutes, locked } => {
                match enforcer.start_allowlist(minutes, locked).await? {
                    AllowlistEnable::Enabled { allowed_ips } => {
                        println!("✓ Allowlist mode on ({allowed_ips} addresses allowed). Ctrl-C to stop.");
                        hold_allowlist(&enforcer).await?;
                    }
                    AllowlistEnable::AlreadyActive => println!("Allowlist mode already on"),
                }
            }
            AllowlistAction::Disable { force } => {
                enforcer.stop_allowlist(force).await?;
                println!("✓ Allowlist mode off");
            }
        },
        Commands::WebBlock { action } => match action {
            WebBlockAction::Start {
                platforms,
                minutes,
                locked,
            } => {
                warn_if_unprivileged();
                let end = enforcer.start_web_block(&platforms, minutes, locked).await?;
                println!("✓ Web block until {}", end.format("%H:%M"));
            }
            WebBlockAction::End { force } => {
                if enforcer.end_web_block(force).await? {
                    println!("✓ Web block ended");
                } else {
                    println!("No web block running");
                }
            }
        },
        Commands::Blackout { action } => match action {
            BlackoutAction::Start { minutes, locked } => {
                warn_if_unprivileged();
                let end = enforcer.start_blackout(minutes, locked).await?;
                println!("✓ Blackout until {}", end.format("%H:%M"));
            }
            BlackoutAction::End { force } => {
                if enforcer.end_blackout(force).await? {
                    println!("✓ Blackout ended");
                } else {
                    println!("No blackout running");
                }
            }
        },
        Commands::Usage { action } => match action {
            UsageAction::Show => print_status(&enforcer.status().await),
            UsageAction::Add { platform, seconds } => {
                let used = enforcer.add_usage(&platform, seconds).await?;
                println!("{platform}: {} used today", format_seconds(used));
            }
            UsageAction::Reset { platform } => {
                enforcer.reset_usage(&platform).await?;
                println!("✓ {platform} quota reset");
            }
        },
        Commands::Schedule { action } => schedule(&enforcer, action)?,
        Commands::Check => {
            let report = enforcer.integrity_check().await;
            if report.is_clean() {
                println!("✓ Everything in place");
            } else {
                println!("Permanent blocks restored: {}", report.permanent_restored);
                println!("DNS lock restored:         {}", report.dns_lock_restored);
                println!("Sessions expired:          {:?}", report.expired_sessions);
                println!("Platforms re-blocked:      {:?}", report.reblocked);
                println!("Allowlist taken over:      {}", report.allowlist_adopted);
                println!("Allowlist leftovers gone:  {}", report.allowlist_orphan_cleaned);
                if let Some(id) = &report.scheduled_blackout {
                    println!("Scheduled blackout:        {id}");
                }
                for e in &report.errors {
                    eprintln!("✗ {e}");
                }
            }
        }
        Commands::Run => run(&enforcer).await,
        Commands::Uninstall => {
            enforcer.uninstall().await?;
            println!("✓ All curfew rules and hosts sections removed");
        }
        Commands::Config { .. } => {}
    }
    Ok(())
}

async fn run(enforcer: &Enforcer) {
    warn_if_unprivileged();
    let report = enforcer.startup().await;
    println!(
        "✓ curfew running (permanent domains: {}, DNS lock: {})",
        report
            .permanent_domains
            .map_or_else(|| "failed".to_string(), |n| n.to_string()),
        if report.dns_locked { "on" } else { "degraded" }
    );
    for (name, recovery) in [
        ("allowlist", report.allowlist),
        ("web block", report.web_block),
        ("blackout", report.blackout),
    ] {
        match recovery {
            SessionRecovery::None => {}
            SessionRecovery::Resumed {
                remaining_minutes,
                locked,
            } => println!(
                "  resumed {name}: {remaining_minutes} min left{}",
                if locked { " (locked)" } else { "" }
            ),
            SessionRecovery::Expired => println!("  {name} expired while stopped; undone"),
            SessionRecovery::OrphanCleaned => println!("  removed leftover {name} rules"),
        }
    }
    if let Some(id) = &report.scheduled_blackout {
        println!("  schedule {id} started a blackout");
    }
    for e in &report.errors {
        eprintln!("✗ {e}");
    }

    let interval = Duration::from_secs(enforcer.config().integrity_interval_secs.max(1));
    enforcer.run_integrity_loop(interval, ctrl_c()).await;

    println!("Stopping...");
    let report = enforcer.shutdown().await;
    for e in &report.errors {
        eprintln!("✗ {e}");
    }
    println!("✓ {} platform(s) blocked on exit", report.platforms_blocked);
}

async fn use_platform(enforcer: &Enforcer, platform: &str) -> Result<(), Error> {
    warn_if_unprivileged();
    let remaining = enforcer.start_usage_session(platform).await?;
    println!("{platform} unblocked, {} left today. Ctrl-C to stop.", format_seconds(remaining));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                enforcer.stop_usage_session(platform).await?;
                println!("✓ {platform} blocked again");
                return Ok(());
            }
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                if !enforcer.is_usage_session_active(platform).await {
                    println!("\nDaily limit for {platform} reached; blocked.");
                    return Ok(());
                }
                let left = format_seconds(enforcer.remaining_seconds(platform).await?);
                print!("\r{left} left   ");
                let _ = std::io::stdout().flush();
            }
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Keeps the allowlist refresh loop running until Ctrl-C, expiry, or
/// `curfew allowlist disable` from another shell.
async fn hold_allowlist(enforcer: &Enforcer) -> Result<(), Error> {
    let poll = Duration::from_secs(1);
    loop {
        match enforcer.hold_allowlist(poll, ctrl_c()).await {
            AllowlistWait::Interrupted => match enforcer.stop_allowlist(false).await {
                Ok(()) => {
                    println!("\n✓ Allowlist mode off");
                    return Ok(());
                }
                Err(Error::SessionLocked(until)) => {
                    println!("\nAllowlist is locked until {until}; still enforcing.");
                }
                Err(e) => return Err(e),
            },
            AllowlistWait::Expired => {
                enforcer.stop_allowlist(true).await?;
                println!("✓ Allowlist time is up; mode off");
                return Ok(());
            }
            AllowlistWait::EndedElsewhere => {
                enforcer.stop_allowlist(true).await?;
                println!("✓ Allowlist mode was turned off");
                return Ok(());
            }
        }
    }
}

fn schedule(enforcer: &Enforcer, action: ScheduleAction) -> Result<(), Error> {
    let store = enforcer.schedules();
    match action {
        ScheduleAction::List => {
            let schedules = store.load();
            if schedules.is_empty() {
                println!("No schedules");
            }
            for s in schedules {
                println!(
                    "  {:<16} {:<20} {}{}",
                    s.id,
                    s.name,
                    s.describe(),
                    if s.enabled { "" } else { " (disabled)" }
                );
            }
        }
        ScheduleAction::Add {
            name,
            days,
            start,
            end,
        } => {
            let schedule = store.add(&name, &parse_days(&days)?, parse_time(&start)?, parse_time(&end)?)?;
            println!("✓ Schedule {} added ({})", schedule.id, schedule.describe());
        }
        ScheduleAction::Remove { id } => {
            if store.remove(&id)? {
                println!("✓ Schedule {id} removed");
            } else {
                println!("No schedule {id}");
            }
        }
        ScheduleAction::Enable { id } => set_schedule(store, &id, true)?,
        ScheduleAction::Disable { id } => set_schedule(store, &id, false)?,
    }
    Ok(())
}

fn set_schedule(store: &ScheduleStore, id: &str, enabled: bool) -> Result<(), Error> {
    if store.set_enabled(id, enabled)? {
        println!("✓ Schedule {id} {}", if enabled { "enabled" } else { "disabled" });
    } else {
        println!("No schedule {id}");
    }
    Ok(())
}

async fn permanent(enforcer: &Enforcer, action: PermanentAction) -> Result<(), Error> {
    let store = enforcer.hosts().permanent_store();
    match action {
        PermanentAction::List => {
            println!(
                "Built-in: {} domains",
                enforcer.config().permanent_domains.len()
            );
            for entry in store.load() {
                println!("  {} ({})", entry.label, entry.domains.join(", "));
            }
            println!(
                "Section in hosts file: {}",
                if enforcer.hosts().is_permanent_applied() { "present" } else { "missing" }
            );
        }
        PermanentAction::Add { label, domains } => {
            warn_if_unprivileged();
            let (label, domains) = if domains.is_empty() {
                let preset = presets()
                    .into_iter()
                    .find(|p| p.label.eq_ignore_ascii_case(&label))
                    .ok_or_else(|| Error::Validation {
                        field: "label".to_string(),
                        message: format!("no domains given and '{label}' is not a preset"),
                    })?;
                (preset.label, preset.domains)
            } else {
                (label, domains)
            };
            let total = enforcer.add_permanent(&label, &domains).await?;
            println!("✓ {label} added ({total} domains blocked permanently)");
        }
        PermanentAction::Remove { label } => {
            if enforcer.remove_permanent(&label).await? {
                println!("✓ {label} removed");
            } else {
                println!("No entry named {label}");
            }
        }
        PermanentAction::Apply => {
            warn_if_unprivileged();
            let total = enforcer.apply_permanent_blocks().await?;
            println!("✓ {total} domains blocked permanently");
        }
        PermanentAction::Presets => {
            for preset in presets() {
                println!("  {} ({})", preset.label, preset.domains.join(", "));
            }
        }
    }
    Ok(())
}

fn print_status(status: &Status) {
    println!("{:<12} {:>8} {:>8} {:>9}  {:<9} STATE", "PLATFORM", "USED", "LEFT", "SESSIONS", "LEVEL");
    for p in &status.platforms {
        let state = if p.in_use {
            "in use"
        } else if p.blocked {
            "blocked"
        } else {
            "open"
        };
        println!(
            "{:<12} {:>8} {:>8} {:>9}  {:<9} {}",
            p.usage.display_name,
            format_seconds(p.usage.used_seconds),
            format_seconds(p.usage.remaining_seconds),
            p.usage.sessions,
            p.usage.level.to_string(),
            state
        );
    }
    println!();
    println!(
        "Permanent blocks: {}",
        if status.permanent_applied { "applied" } else { "missing" }
    );
    println!(
        "DNS lock:         {}",
        match status.dns_locked {
            Some(true) => "active",
            Some(false) => "inactive",
            None => "unknown (nft query failed)",
        }
    );
    println!(
        "Allowlist rules:  {}",
        if status.allowlist_rules_present { "present" } else { "none" }
    );
    if let Some(s) = &status.allowlist {
        println!("Allowlist session: until {} ({} min)", s.end.format("%H:%M"), s.remaining_minutes());
    }
    if let Some(s) = &status.web_block {
        println!(
            "Web block:        {} until {}{}",
            s.params.platform_ids.join(", "),
            s.end.format("%H:%M"),
            if s.locked { " (locked)" } else { "" }
        );
    }
    if let Some(s) = &status.blackout {
        println!(
            "Blackout:         until {}{}",
            s.end.format("%H:%M"),
            if s.locked { " (locked)" } else { "" }
        );
    }
}
