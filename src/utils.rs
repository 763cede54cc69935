//! Utility functions for directory management
//!
//! This module provides helper functions following the XDG Base Directory specification
//! for portable configuration and data storage across Linux distributions.
//!
//! # Directory Structure
//!
//! - Config: `~/.config/curfew/` - `config.json`
//! - Data: `~/.local/share/curfew/` - usage ledgers, permanent-block store, hosts backup
//! - State: `~/.local/state/curfew/` - session files, allowlist flag, logs, audit log
//!
//! # Example
//!
//! ```
//! use curfew::utils::{get_data_dir, ensure_dirs};
//!
//! // Ensure directories exist before use
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(data_path) = get_data_dir() {
//!     // Read ledgers from data_path
//! }
//! ```

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "curfew", "curfew")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    // Not every platform has a state dir; fall back to the data dir there
    project_dirs().map(|pd| {
        pd.state_dir()
            .map_or_else(|| pd.data_dir().to_path_buf(), Path::to_path_buf)
    })
}

/// Creates `dir` (and parents) with user-only permissions on Unix.
pub fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);
        builder.create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

pub fn ensure_dirs() -> std::io::Result<()> {
    for dir in [get_config_dir(), get_data_dir(), get_state_dir()]
        .into_iter()
        .flatten()
    {
        create_private_dir(&dir)?;
    }
    Ok(())
}
