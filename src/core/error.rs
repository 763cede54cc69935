use thiserror::Error;

/// Core error types for curfew
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The hosts file, a state file or the rule table could not be modified
    /// with the current privileges
    #[error("Permission denied: cannot modify {target}")]
    PermissionDenied { target: String },

    /// An external command (nft, DNS flush) exited unsuccessfully
    #[error("{program} failed: {message}")]
    ExternalCommand {
        program: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
        failure: CommandFailure,
    },

    /// An external command did not finish within its time budget
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    /// Persisted state exists but cannot be trusted
    #[error("Corrupted state: {0}")]
    CorruptedState(String),

    /// A domain could not be resolved
    #[error("Could not resolve {domain}: {message}")]
    Resolution { domain: String, message: String },

    /// A lock-mode session refused a manual stop
    #[error("Session is locked until {0}")]
    SessionLocked(String),

    /// A platform id that is not configured
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    PermissionDenied,
    ExternalCommandFailure,
    CorruptedState,
    ResolutionFailure,
    Other,
}

/// Why an external command failed, derived once from its diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CommandFailure {
    /// The caller lacks the privilege to perform the change
    AccessDenied,
    /// The object addressed (table, chain, rule) does not exist
    NotFound,
    Other,
}

impl CommandFailure {
    /// Classifies diagnostics printed by nft (and most coreutils-style tools).
    pub fn classify(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("access is denied")
        {
            CommandFailure::AccessDenied
        } else if lower.contains("no such file or directory")
            || lower.contains("does not exist")
            || lower.contains("not found")
        {
            CommandFailure::NotFound
        } else {
            CommandFailure::Other
        }
    }
}

impl Error {
    /// Maps an I/O error on `target` to `PermissionDenied` when the OS refused
    /// access, keeping every other I/O error as-is.
    pub fn from_io(err: std::io::Error, target: impl AsRef<std::path::Path>) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied {
                target: target.as_ref().display().to_string(),
            }
        } else {
            Error::Io(err)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::PermissionDenied
            }
            Error::ExternalCommand {
                failure: CommandFailure::AccessDenied,
                ..
            } => ErrorKind::PermissionDenied,
            Error::ExternalCommand { .. } | Error::Timeout { .. } | Error::Elevation(_) => {
                ErrorKind::ExternalCommandFailure
            }
            Error::CorruptedState(_) | Error::Serialization(_) => ErrorKind::CorruptedState,
            Error::Resolution { .. } => ErrorKind::ResolutionFailure,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        self.kind() == ErrorKind::PermissionDenied
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

impl From<&Error> for ErrorTranslation {
    fn from(err: &Error) -> Self {
        match err {
            Error::PermissionDenied { target } => {
                ErrorTranslation::new(format!("Insufficient permissions to modify {target}"))
                    .with_suggestion("Run curfew as root, or via sudo/run0")
                    .with_suggestion("Check that no immutable attribute is set: lsattr /etc/hosts")
            }
            Error::ExternalCommand { message, .. } => NftablesErrorPattern::match_error(message),
            Error::Timeout { program, secs } => {
                ErrorTranslation::new(format!("{program} did not answer within {secs}s"))
                    .with_suggestion("Check system load: uptime")
                    .with_suggestion("The next integrity check will retry automatically")
            }
            Error::SessionLocked(until) => {
                ErrorTranslation::new(format!("This session is in lock mode until {until}"))
                    .with_suggestion("Locked sessions can only end when their timer runs out")
            }
            other => ErrorTranslation::new(other.to_string()),
        }
    }
}

/// Database of nftables error patterns and their translations
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run curfew as root or set CURFEW_ELEVATION_METHOD")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Quick_reference-nftables_in_10_minutes");
        }

        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "Failed to initialize nftables cache - insufficient privileges",
            )
            .with_suggestion("This usually means you need elevated privileges")
            .with_help("https://wiki.archlinux.org/title/Polkit");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install nftables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S nftables  (Arch)")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Main_Page");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("Invalid firewall rule syntax")
                .with_suggestion("Ensure IP addresses in the DNS and allowlist settings are valid")
                .with_help(
                    "https://wiki.nftables.org/wiki-nftables/index.php/Simple_rule_management",
                );
        }

        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status firewalld ufw",
                );
        }

        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("Check system load: uptime")
                .with_suggestion("Try again when the system is less busy");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Verify nftables is working: sudo nft list table inet curfew")
            .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
