//! Core enforcement functionality
//!
//! - [`sections`]: marker-delimited block sections inside the hosts file
//! - [`atomic`]: crash-safe file replacement
//! - [`hosts`]: platform and permanent blocks in the hosts file
//! - [`permanent`]: the user's permanent-block list
//! - [`firewall`]: rule specs, rule names and the nftables JSON encoding
//! - [`nft`]: the `nft`-backed rule table
//! - [`network`]: DNS lock and allowlist mode
//! - [`resolve`]: domain resolution and local subnets
//! - [`usage`]: daily quotas on a logical day
//! - [`session`]: crash-recoverable timed sessions
//! - [`schedule`]: recurring weekly blackout windows
//! - [`enforcer`]: the context tying all of the above together
//! - [`error`]: error types

pub mod atomic;
pub mod enforcer;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod hosts;
pub mod network;
pub mod nft;
pub mod permanent;
pub mod resolve;
pub mod schedule;
pub mod sections;
pub mod session;
pub mod usage;

#[cfg(test)]
pub mod test_helpers;
