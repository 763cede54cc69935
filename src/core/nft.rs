//! [`RuleBackend`] on top of the `nft` command line tool
//!
//! Changes are sent as one JSON batch on stdin (`nft --json -f -`), which
//! nftables applies atomically. Lookups list the managed chain with handles
//! and match on the rule comment.

use crate::core::error::{CommandFailure, Error, Result};
use crate::core::exec;
use crate::core::firewall::{
    CHAIN, RuleBackend, RuleSpec, listed_rules, nft_batch, nft_delete_command, nft_rule_commands,
    nft_setup_commands,
};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct NftBackend {
    table: String,
    timeout: Duration,
}

impl NftBackend {
    pub fn new(table: impl Into<String>, timeout: Duration) -> Self {
        Self {
            table: table.into(),
            timeout,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn apply(&self, commands: Vec<Value>) -> Result<()> {
        let payload = serde_json::to_string(&nft_batch(commands))?;
        let cmd = crate::elevation::create_elevated_nft_command(&["--json", "-f", "-"])?;
        exec::run(cmd, Some(&payload), self.timeout).await?;
        Ok(())
    }

    /// `(comment, handle)` of every rule in the managed chain. A missing
    /// table or chain lists as empty.
    async fn list(&self) -> Result<Vec<(String, u64)>> {
        let cmd = crate::elevation::create_elevated_nft_command(&[
            "--json",
            "-a",
            "list",
            "chain",
            "inet",
            &self.table,
            CHAIN,
        ])?;
        match exec::run(cmd, None, self.timeout).await {
            Ok(output) => {
                let listing: Value = serde_json::from_str(&output.stdout).map_err(|e| {
                    Error::Internal(format!("unexpected nft listing output: {e}"))
                })?;
                Ok(listed_rules(&listing))
            }
            // nft ran and reported the object missing (stderr present), as
            // opposed to the binary itself being missing
            Err(Error::ExternalCommand {
                failure: CommandFailure::NotFound,
                stderr: Some(_),
                ..
            }) => {
                debug!("Table inet {} not present yet", self.table);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

impl RuleBackend for NftBackend {
    async fn delete_rule(&self, name: &str) -> Result<usize> {
        let handles: Vec<u64> = self
            .list()
            .await?
            .into_iter()
            .filter(|(comment, _)| comment == name)
            .map(|(_, handle)| handle)
            .collect();
        if handles.is_empty() {
            return Ok(0);
        }

        let commands = handles
            .iter()
            .map(|h| nft_delete_command(&self.table, *h))
            .collect();
        match self.apply(commands).await {
            Ok(()) => {
                info!("Deleted firewall rule {} ({} nft rule(s))", name, handles.len());
                Ok(handles.len())
            }
            Err(Error::ExternalCommand {
                failure: CommandFailure::NotFound,
                ..
            }) => {
                // Removed concurrently between listing and deleting
                warn!("Firewall rule {} vanished before it could be deleted", name);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_rule(&self, spec: &RuleSpec) -> Result<()> {
        let mut commands = nft_setup_commands(&self.table);
        commands.extend(nft_rule_commands(&self.table, spec));
        self.apply(commands).await?;
        info!(
            "Created firewall rule {} ({} {}, {} destination(s))",
            spec.name,
            spec.action,
            spec.protocol,
            spec.remote.len()
        );
        Ok(())
    }

    async fn rule_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|(comment, _)| comment == name))
    }

    async fn rule_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for (comment, _) in self.list().await? {
            if !names.contains(&comment) {
                names.push(comment);
            }
        }
        Ok(names)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::firewall::{Action, Protocol};
    use crate::core::test_helpers::ENV_VAR_MUTEX;
    use crate::elevation::{NFT_COMMAND_ENV, NO_ELEVATION_ENV};
    use std::os::unix::fs::PermissionsExt;

    /// Fake `nft` that records stdin and prints a canned listing.
    fn fake_nft(dir: &std::path::Path, listing: &str, list_exit: i32) -> std::path::PathBuf {
        let script = dir.join("nft");
        let log = dir.join("batches.log");
        let listing_file = dir.join("listing.json");
        std::fs::write(&listing_file, listing).unwrap();
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nif [ \"$1\" = \"--json\" ] && [ \"$2\" = \"-f\" ]; then cat >> '{}'; echo >> '{}'; exit 0; fi\n\
                 if [ {list_exit} -ne 0 ]; then echo 'Error: No such file or directory' >&2; exit {list_exit}; fi\n\
                 cat '{}'\n",
                log.display(),
                log.display(),
                listing_file.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn with_fake<F: std::future::Future<Output = ()>>(script: &std::path::Path, f: F) {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var(NFT_COMMAND_ENV, script);
            std::env::set_var(NO_ELEVATION_ENV, "1");
        }
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f);
        unsafe {
            std::env::remove_var(NFT_COMMAND_ENV);
        }
    }

    const LISTING: &str = r#"{"nftables":[{"metainfo":{}},
        {"rule":{"family":"inet","table":"curfew","chain":"output","handle":7,"comment":"Curfew-DNS-Lock","expr":[]}},
        {"rule":{"family":"inet","table":"curfew","chain":"output","handle":9,"comment":"Curfew-DNS-Lock","expr":[]}},
        {"rule":{"family":"inet","table":"curfew","chain":"output","handle":11,"comment":"Curfew-DoT-Lock","expr":[]}}]}"#;

    #[test]
    fn test_delete_by_name_removes_every_handle() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_nft(dir.path(), LISTING, 0);
        with_fake(&script, async {
            let backend = NftBackend::new("curfew", Duration::from_secs(5));
            assert_eq!(backend.delete_rule("Curfew-DNS-Lock").await.unwrap(), 2);
            assert_eq!(backend.delete_rule("Curfew-Missing").await.unwrap(), 0);
        });

        let log = std::fs::read_to_string(dir.path().join("batches.log")).unwrap();
        let batch: Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        let handles: Vec<u64> = batch["nftables"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["delete"]["rule"]["handle"].as_u64().unwrap())
            .collect();
        assert_eq!(handles, vec![7, 9]);
    }

    #[test]
    fn test_names_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_nft(dir.path(), LISTING, 0);
        with_fake(&script, async {
            let backend = NftBackend::new("curfew", Duration::from_secs(5));
            assert_eq!(
                backend.rule_names().await.unwrap(),
                vec!["Curfew-DNS-Lock", "Curfew-DoT-Lock"]
            );
            assert!(backend.rule_exists("Curfew-DoT-Lock").await.unwrap());
            assert!(!backend.rule_exists("Curfew-Allowlist-BlockAll").await.unwrap());
        });
    }

    #[test]
    fn test_missing_table_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_nft(dir.path(), "", 1);
        with_fake(&script, async {
            let backend = NftBackend::new("curfew", Duration::from_secs(5));
            assert!(backend.rule_names().await.unwrap().is_empty());
            assert_eq!(backend.delete_rule("Curfew-DNS-Lock").await.unwrap(), 0);
        });
    }

    #[test]
    fn test_create_sends_setup_and_rule() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_nft(dir.path(), LISTING, 0);
        with_fake(&script, async {
            let backend = NftBackend::new("curfew", Duration::from_secs(5));
            backend
                .create_rule(&RuleSpec {
                    name: "Curfew-DoT-Lock".to_string(),
                    action: Action::Block,
                    protocol: Protocol::Tcp,
                    remote: Vec::new(),
                    remote_port: Some(853),
                })
                .await
                .unwrap();
        });

        let log = std::fs::read_to_string(dir.path().join("batches.log")).unwrap();
        let batch: Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        let commands = batch["nftables"].as_array().unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0]["add"]["table"]["name"], "curfew");
        assert_eq!(commands[2]["add"]["rule"]["comment"], "Curfew-DoT-Lock");
    }
}
