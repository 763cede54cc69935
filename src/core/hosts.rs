//! Hosts-file block management
//!
//! Every mutation is one read-modify-write cycle under a single async mutex:
//! read the file, strip the tagged section, optionally append a fresh one,
//! write it back atomically and flush the resolver cache. Queries read the
//! file without taking the lock.

use crate::config::{EnforcerConfig, Paths, Platform};
use crate::core::atomic::{Encoding, WriteOptions, read_text, write_atomic};
use crate::core::error::{Error, Result};
use crate::core::exec;
use crate::core::permanent::PermanentStore;
use crate::core::sections::{
    LineEnding, SectionAnomaly, SectionMarkers, append_section, remove_section, render_section,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of [`HostsManager::verify_permanent_blocks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentStatus {
    Intact,
    /// The section was missing and has been written again
    Restored,
}

/// What a rewrite did to the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub changed: bool,
    pub anomaly: Option<SectionAnomaly>,
}

pub struct HostsManager {
    path: PathBuf,
    namespace: String,
    redirect: String,
    write_options: WriteOptions,
    flush_command: Option<Vec<String>>,
    command_timeout: Duration,
    builtin_permanent: Vec<String>,
    permanent_store: PermanentStore,
    permanent_markers: SectionMarkers,
    lock: Mutex<()>,
}

impl HostsManager {
    pub fn new(config: &EnforcerConfig, paths: &Paths) -> Self {
        Self {
            path: config.hosts_path.clone(),
            namespace: config.namespace.clone(),
            redirect: config.redirect_ip.to_string(),
            write_options: WriteOptions {
                encoding: if config.hosts_bom {
                    Encoding::Utf8Bom
                } else {
                    Encoding::Utf8
                },
                backup_path: Some(paths.hosts_backup()),
                temp_prefix: Some(".hosts_curfew_".to_string()),
            },
            flush_command: config.dns_flush_command.clone().filter(|c| !c.is_empty()),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            builtin_permanent: config.permanent_domains.clone(),
            permanent_store: PermanentStore::new(paths.permanent_store()),
            permanent_markers: config.permanent_markers(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn permanent_store(&self) -> &PermanentStore {
        &self.permanent_store
    }

    fn read(&self) -> Result<String> {
        match read_text(&self.path) {
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{:?} does not exist; starting from an empty file", self.path);
                Ok(String::new())
            }
            other => other,
        }
    }

    /// Strips the section tagged by `markers` and, when `section` is given,
    /// appends `(header, domains)` as a fresh one.
    async fn rewrite(
        &self,
        markers: &SectionMarkers,
        section: Option<(Vec<String>, &[String])>,
    ) -> Result<Rewrite> {
        let _guard = self.lock.lock().await;

        let original = self.read()?;
        let eol = LineEnding::detect(&original);
        let removed = remove_section(&original, markers);
        if let Some(SectionAnomaly::MissingEndMarker { recovered_lines }) = &removed.anomaly {
            warn!(
                "{:?}: '{}' had no end marker; kept {} line(s) that followed it",
                self.path, markers.start, recovered_lines
            );
        }

        let updated = match section {
            Some((header, domains)) => {
                let rendered = render_section(markers, &header, &self.redirect, domains, eol);
                append_section(&removed.text, &rendered, eol)
            }
            None => removed.text,
        };

        if updated == original {
            debug!("{:?} already up to date for {}", self.path, markers.start);
            return Ok(Rewrite {
                changed: false,
                anomaly: removed.anomaly,
            });
        }

        let path = self.path.clone();
        let options = self.write_options.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &updated, &options))
            .await
            .map_err(|e| Error::Internal(format!("hosts writer task failed: {e}")))??;

        self.flush_dns().await;
        Ok(Rewrite {
            changed: true,
            anomaly: removed.anomaly,
        })
    }

    /// Flushes the OS resolver cache. Failures are logged only; the hosts
    /// file is already correct and caches expire on their own.
    async fn flush_dns(&self) {
        let Some(argv) = &self.flush_command else {
            return;
        };
        let cmd = match crate::elevation::create_elevated_flush_command(argv) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Cannot flush DNS cache: {}", e);
                return;
            }
        };
        match exec::run(cmd, None, self.command_timeout).await {
            Ok(_) => debug!("DNS cache flushed"),
            Err(e) => warn!("DNS cache flush failed: {}", e),
        }
    }

    /// Redirects every domain of `platform`. Calling it twice leaves one section.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when the hosts file is not writable, `Io` otherwise.
    pub async fn block(&self, platform: &Platform) -> Result<Rewrite> {
        let header = vec![format!("curfew - {} block", platform.display_name)];
        let rewrite = self
            .rewrite(
                &platform.markers(&self.namespace),
                Some((header, &platform.domains)),
            )
            .await?;
        info!(
            "Blocked {} ({} domains)",
            platform.display_name,
            platform.domains.len()
        );
        Ok(rewrite)
    }

    /// Removes the section of `platform`, leaving every other line untouched.
    ///
    /// # Errors
    ///
    /// As for [`block`](Self::block).
    pub async fn unblock(&self, platform: &Platform) -> Result<Rewrite> {
        let rewrite = self
            .rewrite(&platform.markers(&self.namespace), None)
            .await?;
        info!("Unblocked {}", platform.display_name);
        Ok(rewrite)
    }

    /// True iff both markers of `platform` are in the file. An unreadable
    /// file counts as not blocked.
    pub fn is_blocked(&self, platform: &Platform) -> bool {
        self.has_section(&platform.markers(&self.namespace))
    }

    fn has_section(&self, markers: &SectionMarkers) -> bool {
        match read_text(&self.path) {
            Ok(text) => markers.present_in(&text),
            Err(e) => {
                debug!("Could not read {:?}: {}", self.path, e);
                false
            }
        }
    }

    /// Built-in permanent domains merged with the user's entries.
    pub fn permanent_domains(&self) -> Vec<String> {
        self.permanent_store.all_domains(&self.builtin_permanent)
    }

    /// Writes the merged permanent list under the `PERMANENT` tag and
    /// returns how many domains it holds.
    ///
    /// # Errors
    ///
    /// As for [`block`](Self::block).
    pub async fn block_permanent_domains(&self) -> Result<usize> {
        let domains = self.permanent_domains();
        let header = vec![
            "curfew - permanent blocks".to_string(),
            "Managed automatically; manual edits are reverted".to_string(),
        ];
        self.rewrite(&self.permanent_markers, Some((header, &domains)))
            .await?;
        info!("Permanent blocks applied ({} domains)", domains.len());
        Ok(domains.len())
    }

    /// Re-asserts the permanent section if its start marker is gone.
    ///
    /// # Errors
    ///
    /// Only when the section was missing and could not be rewritten.
    pub async fn verify_permanent_blocks(&self) -> Result<PermanentStatus> {
        let intact = match read_text(&self.path) {
            Ok(text) => text.contains(&self.permanent_markers.start),
            Err(_) => false,
        };
        if intact {
            return Ok(PermanentStatus::Intact);
        }
        warn!("Permanent block section missing from {:?}; restoring", self.path);
        self.block_permanent_domains().await?;
        Ok(PermanentStatus::Restored)
    }

    pub fn is_permanent_applied(&self) -> bool {
        self.has_section(&self.permanent_markers)
    }

    /// Removes the permanent section. Only the uninstall path calls this.
    ///
    /// # Errors
    ///
    /// As for [`block`](Self::block).
    pub async fn remove_permanent_section(&self) -> Result<Rewrite> {
        let rewrite = self.rewrite(&self.permanent_markers, None).await?;
        info!("Permanent block section removed");
        Ok(rewrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{hosts_fixture, test_config};

    const BASE: &str = "127.0.0.1 localhost\n# keep me\n::1 localhost\n";

    #[tokio::test]
    async fn test_block_is_idempotent() {
        let fx = hosts_fixture(BASE);
        let config = test_config(&fx);
        let hosts = HostsManager::new(&config, &fx.paths());
        let youtube = config.platform("youtube").unwrap();

        assert!(hosts.block(youtube).await.unwrap().changed);
        assert!(!hosts.block(youtube).await.unwrap().changed);

        let text = std::fs::read_to_string(&fx.hosts).unwrap();
        assert_eq!(text.matches("CURFEW-YOUTUBE-START").count(), 1);
        assert!(text.contains("127.0.0.1 youtu.be"));
        assert!(hosts.is_blocked(youtube));
    }

    #[tokio::test]
    async fn test_block_unblock_round_trip() {
        let fx = hosts_fixture(BASE);
        let config = test_config(&fx);
        let hosts = HostsManager::new(&config, &fx.paths());
        let instagram = config.platform("instagram").unwrap();

        hosts.block(instagram).await.unwrap();
        hosts.unblock(instagram).await.unwrap();

        assert_eq!(std::fs::read_to_string(&fx.hosts).unwrap(), BASE);
        assert!(!hosts.is_blocked(instagram));
    }

    #[tokio::test]
    async fn test_unblock_keeps_other_sections() {
        let fx = hosts_fixture(BASE);
        let config = test_config(&fx);
        let hosts = HostsManager::new(&config, &fx.paths());
        let youtube = config.platform("youtube").unwrap();
        let instagram = config.platform("instagram").unwrap();

        hosts.block(youtube).await.unwrap();
        hosts.block(instagram).await.unwrap();
        hosts.unblock(youtube).await.unwrap();

        assert!(!hosts.is_blocked(youtube));
        assert!(hosts.is_blocked(instagram));
    }

    #[tokio::test]
    async fn test_backup_taken_before_first_write() {
        let fx = hosts_fixture(BASE);
        let config = test_config(&fx);
        let paths = fx.paths();
        let hosts = HostsManager::new(&config, &paths);

        hosts
            .block(config.platform("youtube").unwrap())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(paths.hosts_backup()).unwrap(), BASE);
    }

    #[tokio::test]
    async fn test_corrupted_section_keeps_lines() {
        let fx = hosts_fixture(&format!(
            "{BASE}\n# >>> CURFEW-YOUTUBE-START <<<\n127.0.0.1 youtube.com\n10.0.0.5 intranet.local\n"
        ));
        let config = test_config(&fx);
        let hosts = HostsManager::new(&config, &fx.paths());
        let youtube = config.platform("youtube").unwrap();

        let rewrite = hosts.block(youtube).await.unwrap();
        assert!(matches!(
            rewrite.anomaly,
            Some(SectionAnomaly::MissingEndMarker { recovered_lines: 2 })
        ));

        let text = std::fs::read_to_string(&fx.hosts).unwrap();
        assert!(text.contains("10.0.0.5 intranet.local"));
        assert_eq!(text.matches("CURFEW-YOUTUBE-START").count(), 1);
        assert!(hosts.is_blocked(youtube));
    }

    #[tokio::test]
    async fn test_permanent_merges_user_entries() {
        let fx = hosts_fixture(BASE);
        let config = test_config(&fx);
        let hosts = HostsManager::new(&config, &fx.paths());
        hosts
            .permanent_store()
            .add("Reddit", &["reddit.com".to_string()])
            .unwrap();

        let count = hosts.block_permanent_domains().await.unwrap();
        assert_eq!(count, config.permanent_domains.len() + 1);

        let text = std::fs::read_to_string(&fx.hosts).unwrap();
        assert!(text.contains("127.0.0.1 reddit.com"));
        assert!(hosts.is_permanent_applied());
    }

    #[tokio::test]
    async fn test_verify_restores_removed_section() {
        let fx = hosts_fixture(BASE);
        let config = test_config(&fx);
        let hosts = HostsManager::new(&config, &fx.paths());

        hosts.block_permanent_domains().await.unwrap();
        assert_eq!(
            hosts.verify_permanent_blocks().await.unwrap(),
            PermanentStatus::Intact
        );

        // Simulate a manual edit
        std::fs::write(&fx.hosts, BASE).unwrap();
        assert_eq!(
            hosts.verify_permanent_blocks().await.unwrap(),
            PermanentStatus::Restored
        );
        assert!(hosts.is_permanent_applied());
    }

    #[tokio::test]
    async fn test_bom_preserved_when_configured() {
        let fx = hosts_fixture(BASE);
        let mut config = test_config(&fx);
        config.hosts_bom = true;
        let hosts = HostsManager::new(&config, &fx.paths());

        hosts
            .block(config.platform("youtube").unwrap())
            .await
            .unwrap();
        let raw = std::fs::read(&fx.hosts).unwrap();
        assert_eq!(&raw[..3], &[0xEF, 0xBB, 0xBF]);
    }

    #[tokio::test]
    async fn test_crlf_file_stays_crlf() {
        let fx = hosts_fixture("127.0.0.1 localhost\r\n");
        let config = test_config(&fx);
        let hosts = HostsManager::new(&config, &fx.paths());

        hosts
            .block(config.platform("youtube").unwrap())
            .await
            .unwrap();
        let text = std::fs::read_to_string(&fx.hosts).unwrap();
        assert!(text.contains("127.0.0.1 youtube.com\r\n"));
        assert!(!text.replace("\r\n", "").contains('\n'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permission_denied_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        if crate::elevation::is_root() {
            return;
        }
        let fx = hosts_fixture(BASE);
        let mut config = test_config(&fx);
        let locked = fx.dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
        config.hosts_path = locked.join("hosts");
        let hosts = HostsManager::new(&config, &fx.paths());

        let result = hosts.block(config.platform("youtube").unwrap()).await;

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(result.unwrap_err().is_permission_denied());
    }
}
