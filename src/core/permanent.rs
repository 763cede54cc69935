//! User-defined permanent blocks
//!
//! Entries live in one JSON document (an ordered list of
//! `{label, domains}`) next to a `.sha256` sidecar. A checksum mismatch means
//! the file was edited by hand; that is logged, not rejected.

use crate::core::atomic::{WriteOptions, write_atomic};
use crate::core::error::{Error, Result};
use crate::validators::{sanitize_label, validate_domain, validate_label};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermanentEntry {
    pub label: String,
    pub domains: Vec<String>,
}

impl PermanentEntry {
    fn preset(label: &str, domains: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            domains: domains.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Quick-add entries offered by `curfew permanent presets`.
pub fn presets() -> Vec<PermanentEntry> {
    vec![
        PermanentEntry::preset(
            "Twitter / X",
            &["twitter.com", "www.twitter.com", "x.com", "www.x.com"],
        ),
        PermanentEntry::preset(
            "TikTok",
            &["tiktok.com", "www.tiktok.com", "vm.tiktok.com", "m.tiktok.com"],
        ),
        PermanentEntry::preset(
            "Reddit",
            &["reddit.com", "www.reddit.com", "old.reddit.com", "i.redd.it"],
        ),
        PermanentEntry::preset(
            "Facebook",
            &[
                "facebook.com",
                "www.facebook.com",
                "m.facebook.com",
                "web.facebook.com",
            ],
        ),
    ]
}

/// Built-ins first, then every entry's domains, first occurrence wins.
pub fn merge_domains(builtin: &[String], entries: &[PermanentEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    builtin
        .iter()
        .chain(entries.iter().flat_map(|e| e.domains.iter()))
        .filter(|d| seen.insert(d.as_str()))
        .cloned()
        .collect()
}

fn checksum(json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct PermanentStore {
    path: PathBuf,
}

impl PermanentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn checksum_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.set_extension("json.sha256");
        path
    }

    /// Loads all entries. A missing file is an empty list; so is a corrupt
    /// one, with a warning.
    pub fn load(&self) -> Vec<PermanentEntry> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Failed to read permanent blocks {:?}: {}", self.path, e);
                return Vec::new();
            }
        };

        if let Ok(expected) = std::fs::read_to_string(self.checksum_path()) {
            let actual = checksum(&json);
            if expected.trim() != actual {
                warn!(
                    "Permanent block store checksum mismatch (expected: {}, got: {})",
                    expected.trim(),
                    actual
                );
            }
        }

        match serde_json::from_str::<Vec<PermanentEntry>>(&json) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Permanent block store {:?} is corrupt: {}", self.path, e);
                Vec::new()
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error if the store or its checksum cannot be written.
    pub fn save(&self, entries: &[PermanentEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::utils::create_private_dir(parent).map_err(|e| Error::from_io(e, parent))?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        write_atomic(&self.path, &json, &WriteOptions::default())?;
        write_atomic(&self.checksum_path(), &checksum(&json), &WriteOptions::default())?;
        Ok(())
    }

    /// Adds an entry after validating its label and every domain.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a bad or duplicate label, an empty
    /// domain list or an invalid domain; I/O errors from [`save`](Self::save).
    pub fn add(&self, label: &str, domains: &[String]) -> Result<PermanentEntry> {
        let label = validate_label(label).map_err(|message| Error::Validation {
            field: "label".to_string(),
            message,
        })?;

        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(domains.len());
        for domain in domains {
            let domain = validate_domain(domain).map_err(|message| Error::Validation {
                field: "domains".to_string(),
                message,
            })?;
            if seen.insert(domain.clone()) {
                normalized.push(domain);
            }
        }
        if normalized.is_empty() {
            return Err(Error::Validation {
                field: "domains".to_string(),
                message: "at least one domain is required".to_string(),
            });
        }

        let mut entries = self.load();
        if entries.iter().any(|e| e.label == label) {
            return Err(Error::Validation {
                field: "label".to_string(),
                message: format!("'{label}' already exists"),
            });
        }

        let entry = PermanentEntry {
            label,
            domains: normalized,
        };
        entries.push(entry.clone());
        self.save(&entries)?;
        info!(
            "Added permanent block: {} ({} domains)",
            entry.label,
            entry.domains.len()
        );
        Ok(entry)
    }

    /// Removes the entry named `label`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the updated list cannot be saved.
    pub fn remove(&self, label: &str) -> Result<bool> {
        let sanitized = sanitize_label(label.trim());
        let mut entries = self.load();
        let before = entries.len();
        entries.retain(|e| e.label != label && e.label != sanitized);
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries)?;
        info!("Removed permanent block: {}", label);
        Ok(true)
    }

    /// Built-in domains merged with every stored entry.
    pub fn all_domains(&self, builtin: &[String]) -> Vec<String> {
        merge_domains(builtin, &self.load())
    }
}
