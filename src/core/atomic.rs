//! Crash-safe file replacement
//!
//! 1. Ensures a one-time backup copy of the target exists (never overwritten).
//! 2. Clears a read-only bit on the target if present.
//! 3. Writes to a uniquely-named temp file in the *same directory* as the
//!    target, so the final rename never crosses a filesystem boundary.
//! 4. Flushes and `fsync`s the temp file, then renames it over the target.
//!
//! If anything before the rename fails, the temp file is dropped (and thus
//! deleted) and a direct, non-atomic write is attempted as a best-effort
//! fallback. Only that fallback can leave a partially written target.

use crate::core::error::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Byte encoding of the written text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// UTF-8 prefixed with a byte-order mark
    Utf8Bom,
}

const BOM: &str = "\u{feff}";

impl Encoding {
    fn encode(self, content: &str) -> Vec<u8> {
        let body = content.strip_prefix(BOM).unwrap_or(content);
        match self {
            Encoding::Utf8 => body.as_bytes().to_vec(),
            Encoding::Utf8Bom => {
                let mut bytes = Vec::with_capacity(BOM.len() + body.len());
                bytes.extend_from_slice(BOM.as_bytes());
                bytes.extend_from_slice(body.as_bytes());
                bytes
            }
        }
    }
}

/// Reads a UTF-8 text file, dropping a leading byte-order mark.
pub fn read_text(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::from_io(e, path))?;
    Ok(match text.strip_prefix(BOM) {
        Some(stripped) => stripped.to_string(),
        None => text,
    })
}

/// How a successful write reached the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Atomic,
    /// The atomic path failed and the target was overwritten in place
    Fallback,
}

/// Options for [`write_atomic`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub encoding: Encoding,
    /// Copy the current target here once, before the first write
    pub backup_path: Option<PathBuf>,
    /// Prefix of the temp file name (helps spotting leftovers)
    pub temp_prefix: Option<String>,
}

fn ensure_backup(target: &Path, backup: &Path) {
    if backup.exists() || !target.exists() {
        return;
    }
    if let Some(parent) = backup.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!("Could not create backup directory {:?}: {}", parent, e);
        return;
    }
    match std::fs::copy(target, backup) {
        Ok(_) => info!("Backup of {:?} created at {:?}", target, backup),
        Err(e) => warn!("Could not create backup of {:?}: {}", target, e),
    }
}

fn clear_readonly(target: &Path) {
    let Ok(metadata) = std::fs::metadata(target) else {
        return;
    };
    let mut perms = metadata.permissions();
    if !perms.readonly() {
        return;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o200);
    }

    #[cfg(not(unix))]
    {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
    }

    if let Err(e) = std::fs::set_permissions(target, perms) {
        debug!("Could not clear read-only attribute on {:?}: {}", target, e);
    }
}

fn write_via_temp(target: &Path, bytes: &[u8], prefix: &str) -> std::io::Result<()> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".tmp")
        .tempfile_in(dir)?;

    // Keep the target's mode (a 0600 hosts file would break name resolution)
    if let Ok(metadata) = std::fs::metadata(target) {
        std::fs::set_permissions(temp.path(), metadata.permissions())?;
    }

    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()?;

    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

fn storage_full_hint(e: std::io::Error) -> std::io::Error {
    if e.kind() == std::io::ErrorKind::StorageFull {
        std::io::Error::new(
            std::io::ErrorKind::StorageFull,
            "Disk full: cannot save state. Free up space and try again.",
        )
    } else {
        e
    }
}

/// Replaces `target` with `content` as atomically as the platform allows.
///
/// # Errors
///
/// Returns `PermissionDenied` when the fallback write was refused by the OS,
/// and `Io` for every other failure of both write paths.
pub fn write_atomic(target: &Path, content: &str, options: &WriteOptions) -> Result<WriteOutcome> {
    if let Some(backup) = &options.backup_path {
        ensure_backup(target, backup);
    }
    clear_readonly(target);

    let bytes = options.encoding.encode(content);
    let prefix = options.temp_prefix.as_deref().unwrap_or(".curfew_");

    match write_via_temp(target, &bytes, prefix) {
        Ok(()) => {
            debug!("{:?} updated (atomic)", target);
            Ok(WriteOutcome::Atomic)
        }
        Err(e) => {
            warn!(
                "Atomic write of {:?} failed ({}), falling back to direct write",
                target, e
            );
            match std::fs::write(target, &bytes) {
                Ok(()) => {
                    info!("{:?} updated (fallback)", target);
                    Ok(WriteOutcome::Fallback)
                }
                Err(fallback) => {
                    tracing::error!("Fallback write of {:?} also failed: {}", target, fallback);
                    Err(Error::from_io(storage_full_hint(fallback), target))
                }
            }
        }
    }
}
