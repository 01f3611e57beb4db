//! Per-user host key store (trust-on-first-use)
//!
//! Records server host key fingerprints per `(user_id, host_id)` in a
//! file-backed store under `$DATA_DIR/hostkeys/<user_id>`. First
//! observation stores and accepts; a later mismatch rejects. Jump hops
//! follow the same rules but never prompt.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use parking_lot::Mutex;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;
use crate::store::HostId;

/// Outcome of a host key check
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyDecision {
    /// Key matches the recorded fingerprint (or was just recorded)
    Accept,
    /// Unknown key and the confirm-first-use policy wants a user decision
    Prompt { fingerprint: String },
    /// Key differs from the recorded fingerprint
    Reject {
        expected: String,
        actual: String,
    },
}

/// File-backed TOFU store with a per-user lock
pub struct HostKeyStore {
    dir: PathBuf,
    /// Serializes read-modify-write cycles on one user's file
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// When set, unknown keys on non-jump hops produce `Prompt` instead of
    /// being recorded silently
    confirm_first_use: bool,
}

impl HostKeyStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: DashMap::new(),
            confirm_first_use: false,
        }
    }

    pub fn with_confirm_first_use(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: DashMap::new(),
            confirm_first_use: true,
        }
    }

    /// Compute the `SHA256:<b64>` fingerprint of a public key
    pub fn fingerprint(key: &PublicKey) -> String {
        let key_bytes = key.public_key_bytes();
        let mut hasher = Sha256::new();
        hasher.update(&key_bytes);
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// Verify a fingerprint against the user's record for this host.
    ///
    /// * `trust` carries the browser's TOFU pre-approval: `Some(true)`
    ///   records an unknown key even under confirm-first-use,
    ///   `Some(false)` accepts for this session without recording.
    /// * Jump hops never prompt; unknown keys are recorded, mismatches
    ///   rejected with no user dialog.
    pub fn verify(
        &self,
        user_id: &str,
        host_id: HostId,
        fingerprint: &str,
        is_jump_hop: bool,
        trust: Option<bool>,
    ) -> Result<HostKeyDecision, SshError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let mut entries = self.load_user(user_id)?;

        match entries.get(&host_id) {
            Some(expected) if expected == fingerprint => {
                debug!(user_id, host_id, "Host key verified");
                Ok(HostKeyDecision::Accept)
            }
            Some(expected) => {
                warn!(
                    user_id,
                    host_id,
                    expected = %expected,
                    actual = %fingerprint,
                    "HOST KEY CHANGED - rejecting"
                );
                Ok(HostKeyDecision::Reject {
                    expected: expected.clone(),
                    actual: fingerprint.to_string(),
                })
            }
            None => {
                match trust {
                    Some(true) => {
                        info!(user_id, host_id, %fingerprint, "TOFU: trusting and recording host key");
                        entries.insert(host_id, fingerprint.to_string());
                        self.save_user(user_id, &entries)?;
                        return Ok(HostKeyDecision::Accept);
                    }
                    Some(false) => {
                        info!(user_id, host_id, %fingerprint, "TOFU: trusting host key for this session only");
                        return Ok(HostKeyDecision::Accept);
                    }
                    None => {}
                }

                if self.confirm_first_use && !is_jump_hop {
                    debug!(user_id, host_id, %fingerprint, "Unknown host key, prompting");
                    return Ok(HostKeyDecision::Prompt {
                        fingerprint: fingerprint.to_string(),
                    });
                }

                info!(user_id, host_id, %fingerprint, "First observation, recording host key");
                entries.insert(host_id, fingerprint.to_string());
                self.save_user(user_id, &entries)?;
                Ok(HostKeyDecision::Accept)
            }
        }
    }

    /// Forget the recorded key for one host (after a legitimate key change)
    pub fn forget(&self, user_id: &str, host_id: HostId) -> Result<(), SshError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock();

        let mut entries = self.load_user(user_id)?;
        if entries.remove(&host_id).is_some() {
            self.save_user(user_id, &entries)?;
        }
        Ok(())
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn user_path(&self, user_id: &str) -> PathBuf {
        // user ids are UUIDs from the auth layer; sanitize anyway so a
        // hostile id cannot escape the store directory
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(safe)
    }

    /// Load one user's `<host_id> <fingerprint>` lines
    fn load_user(&self, user_id: &str) -> Result<HashMap<HostId, String>, SshError> {
        let path = self.user_path(user_id);
        let mut entries = HashMap::new();

        if !path.exists() {
            return Ok(entries);
        }

        let file = fs::File::open(&path)?;
        let reader = BufReader::new(file);
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(id), Some(fp)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let Ok(id) = id.parse::<HostId>() {
                entries.insert(id, fp.to_string());
            }
        }
        Ok(entries)
    }

    fn save_user(&self, user_id: &str, entries: &HashMap<HostId, String>) -> Result<(), SshError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.user_path(user_id);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        for (id, fp) in entries {
            writeln!(file, "{} {}", id, fp)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, HostKeyStore) {
        let dir = TempDir::new().unwrap();
        let store = HostKeyStore::new(dir.path().join("hostkeys"));
        (dir, store)
    }

    #[test]
    fn first_observation_records_and_accepts() {
        let (_tmp, store) = store();
        let d = store.verify("alice", 1, "SHA256:abc", false, None).unwrap();
        assert_eq!(d, HostKeyDecision::Accept);
        // same key verifies again
        let d = store.verify("alice", 1, "SHA256:abc", false, None).unwrap();
        assert_eq!(d, HostKeyDecision::Accept);
    }

    #[test]
    fn mismatch_rejects_with_both_fingerprints() {
        let (_tmp, store) = store();
        store.verify("alice", 1, "SHA256:abc", false, None).unwrap();
        let d = store.verify("alice", 1, "SHA256:xyz", false, None).unwrap();
        assert_eq!(
            d,
            HostKeyDecision::Reject {
                expected: "SHA256:abc".into(),
                actual: "SHA256:xyz".into(),
            }
        );
    }

    #[test]
    fn users_do_not_share_records() {
        let (_tmp, store) = store();
        store.verify("alice", 1, "SHA256:abc", false, None).unwrap();
        // bob sees the same host fresh
        let d = store.verify("bob", 1, "SHA256:xyz", false, None).unwrap();
        assert_eq!(d, HostKeyDecision::Accept);
    }

    #[test]
    fn confirm_first_use_prompts_but_not_for_jump_hops() {
        let tmp = TempDir::new().unwrap();
        let store = HostKeyStore::with_confirm_first_use(tmp.path().join("hk"));

        let d = store.verify("alice", 1, "SHA256:abc", false, None).unwrap();
        assert_eq!(
            d,
            HostKeyDecision::Prompt {
                fingerprint: "SHA256:abc".into()
            }
        );

        // jump hop: silently recorded
        let d = store.verify("alice", 2, "SHA256:def", true, None).unwrap();
        assert_eq!(d, HostKeyDecision::Accept);
    }

    #[test]
    fn trust_flag_records_under_confirm_policy() {
        let tmp = TempDir::new().unwrap();
        let store = HostKeyStore::with_confirm_first_use(tmp.path().join("hk"));

        let d = store
            .verify("alice", 1, "SHA256:abc", false, Some(true))
            .unwrap();
        assert_eq!(d, HostKeyDecision::Accept);
        // now recorded: plain verify accepts
        let d = store.verify("alice", 1, "SHA256:abc", false, None).unwrap();
        assert_eq!(d, HostKeyDecision::Accept);
    }

    #[test]
    fn session_only_trust_does_not_record() {
        let tmp = TempDir::new().unwrap();
        let store = HostKeyStore::with_confirm_first_use(tmp.path().join("hk"));

        store
            .verify("alice", 1, "SHA256:abc", false, Some(false))
            .unwrap();
        // not recorded: still prompts
        let d = store.verify("alice", 1, "SHA256:abc", false, None).unwrap();
        assert!(matches!(d, HostKeyDecision::Prompt { .. }));
    }

    #[test]
    fn forget_clears_one_host() {
        let (_tmp, store) = store();
        store.verify("alice", 1, "SHA256:abc", false, None).unwrap();
        store.verify("alice", 2, "SHA256:def", false, None).unwrap();
        store.forget("alice", 1).unwrap();

        // host 1 is fresh again, host 2 unchanged
        let d = store.verify("alice", 1, "SHA256:new", false, None).unwrap();
        assert_eq!(d, HostKeyDecision::Accept);
        let d = store.verify("alice", 2, "SHA256:def", false, None).unwrap();
        assert_eq!(d, HostKeyDecision::Accept);
    }
}
