//! curfew - keeps distractions blocked on your own machine
//!
//! Blocks platforms through tagged sections of the hosts file, keeps a DNS
//! lock and an optional allowlist mode in nftables, tracks daily quotas and
//! persists timed sessions so a crash never leaves enforcement half-done.
//!
//! # Architecture
//!
//! - [`core`] - Hosts sections, firewall rules, quotas, sessions and the [`Enforcer`]
//! - [`audit`] - Audit log of every enforcement change
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Privilege escalation for `nft`
//! - [`utils`] - Utility functions (XDG directories, etc.)

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use config::{EnforcerConfig, Platform};
pub use core::enforcer::Enforcer;
pub use core::error::{Error, Result};
