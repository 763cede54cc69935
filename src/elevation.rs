//! Privilege elevation for the external commands curfew runs
//!
//! Hosts-file edits happen in-process and need the process itself to be
//! privileged. The two external programs, `nft` and the DNS cache flush
//! command, are elevated per invocation instead:
//!
//! 1. `CURFEW_TEST_NO_ELEVATION` set: run the program as-is (tests only)
//! 2. Running as root: run the program as-is
//! 3. `CURFEW_ELEVATION_METHOD` (`sudo`, `run0`, `pkexec`): use that method
//! 4. Otherwise `run0` when installed, else `sudo` on a terminal and
//!    `pkexec` without one
//!
//! `CURFEW_NFT_COMMAND` replaces the `nft` binary (absolute path or a
//! wrapper script).
//!
//! Arguments are passed as an argv vector, never through a shell.

use std::io;
use tokio::process::Command;

pub const NFT_COMMAND_ENV: &str = "CURFEW_NFT_COMMAND";
pub const NO_ELEVATION_ENV: &str = "CURFEW_TEST_NO_ELEVATION";
pub const ELEVATION_METHOD_ENV: &str = "CURFEW_ELEVATION_METHOD";

#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    #[error("Invalid CURFEW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    #[error("Empty command line")]
    EmptyCommand,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ElevationError> for crate::core::error::Error {
    fn from(err: ElevationError) -> Self {
        crate::core::error::Error::Elevation(err.to_string())
    }
}

/// Searches `PATH` for an executable file called `name`.
fn binary_exists(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Binary used for nft invocations, honouring `CURFEW_NFT_COMMAND`.
pub fn nft_program() -> String {
    std::env::var(NFT_COMMAND_ENV)
        .ok()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| "nft".to_string())
}

fn wrapped(wrapper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(wrapper);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    if std::env::var_os(NO_ELEVATION_ENV).is_some() || is_root() {
        return Ok(direct(program, args));
    }

    if let Ok(method) = std::env::var(ELEVATION_METHOD_ENV) {
        let method = method.trim().to_lowercase();
        if !method.is_empty() {
            if !matches!(method.as_str(), "sudo" | "run0" | "pkexec") {
                return Err(ElevationError::InvalidMethod(method));
            }
            if !binary_exists(&method) {
                return Err(ElevationError::MethodNotAvailable(method));
            }
            return Ok(wrapped(&method, program, args));
        }
    }

    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let interactive = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if interactive {
        Ok(wrapped("sudo", program, args))
    } else if binary_exists("pkexec") {
        Ok(wrapped("pkexec", program, args))
    } else {
        Err(ElevationError::PkexecNotFound)
    }
}

/// Builds an elevated `nft` invocation.
///
/// # Errors
///
/// Returns `ElevationError` when the requested or fallback elevation
/// method is unavailable.
///
/// # Example
///
/// ```no_run
/// use curfew::elevation::create_elevated_nft_command;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut cmd = create_elevated_nft_command(&["--json", "list", "table", "inet", "curfew"])?;
/// let output = cmd.output().await?;
/// # Ok(())
/// # }
/// ```
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command(&nft_program(), args)
}

/// Builds an elevated DNS cache flush from a configured argv
/// (`["resolvectl", "flush-caches"]`).
///
/// # Errors
///
/// Returns `EmptyCommand` for an empty argv and `ElevationError` variants
/// as for [`create_elevated_nft_command`].
pub fn create_elevated_flush_command(argv: &[String]) -> Result<Command, ElevationError> {
    let (program, rest) = argv.split_first().ok_or(ElevationError::EmptyCommand)?;
    let args: Vec<&str> = rest.iter().map(String::as_str).collect();
    build_elevated_command(program, &args)
}
