//! Host and credential resolution boundary
//!
//! Persistent storage and the field-level encryption that protects it are
//! external. The core consumes decrypted records through [`CredentialStore`]
//! and checks keyring availability through [`UserKeyring`]. Decrypted
//! credential material lives in memory only while a session is alive and is
//! zeroized best-effort on drop.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

pub type HostId = i64;
pub type CredentialId = i64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("user data is locked")]
    Locked,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// How a host authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Password,
    Key,
    #[serde(rename = "opkssh")]
    OpkSsh,
    #[default]
    None,
}

/// One SOCKS5 hop; authentication is optional username/password
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocksHop {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Ordered SOCKS5 proxy chain, applied left-to-right before the target dial
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocksChain {
    pub hops: Vec<SocksHop>,
}

impl SocksChain {
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

/// A stored host record, resolved at connect time
#[derive(Debug, Clone)]
pub struct HostSpec {
    pub host_id: HostId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    /// Route password auth through keyboard-interactive anyway
    pub force_kbd_interactive: bool,
    pub credential_id: Option<CredentialId>,
    /// Jump hosts to chain through, outermost first
    pub jump_hops: Vec<HostId>,
    pub proxy_chain: Option<SocksChain>,
    /// Display name for activity logging
    pub name: Option<String>,
}

/// Decrypted credential fields. Exists in memory only while the owning
/// session is alive.
#[derive(Clone, Default)]
pub struct Credential {
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub key_passphrase: Option<String>,
}

impl Drop for Credential {
    fn drop(&mut self) {
        if let Some(p) = self.password.as_mut() {
            p.zeroize();
        }
        if let Some(k) = self.private_key.as_mut() {
            k.zeroize();
        }
        if let Some(p) = self.key_passphrase.as_mut() {
            p.zeroize();
        }
    }
}

// Never derive Debug for Credential: no field may reach a log line.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<set>"))
            .field(
                "key_passphrase",
                &self.key_passphrase.as_ref().map(|_| "<set>"),
            )
            .finish()
    }
}

/// Read access to host and credential rows, decrypted by the backend
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn fetch_host(&self, host_id: HostId, user_id: &str) -> Result<HostSpec, StoreError>;

    async fn fetch_credential(
        &self,
        credential_id: CredentialId,
        user_id: &str,
    ) -> Result<Credential, StoreError>;
}

/// Opaque handle to the user's unlocked data-encryption key. The core never
/// uses the key material itself; presence is the unlock signal.
pub struct UserDataKey(zeroize::Zeroizing<Vec<u8>>);

impl UserDataKey {
    pub fn new(key: Vec<u8>) -> Self {
        Self(zeroize::Zeroizing::new(key))
    }
}

/// Per-user data-encryption key lifecycle. `None` means the user's data is
/// locked and sessions must be refused with `DATA_LOCKED`.
pub trait UserKeyring: Send + Sync {
    fn data_key(&self, user_id: &str) -> Option<UserDataKey>;
}

pub type SharedCredentialStore = Arc<dyn CredentialStore>;
pub type SharedKeyring = Arc<dyn UserKeyring>;

// ============================================================================
// In-memory implementations (tests, local development)
// ============================================================================

pub mod memory {
    use dashmap::DashMap;

    use super::*;

    /// In-memory credential store keyed by `(host_id)`; every user sees the
    /// same rows. Test/dev only; the production store is database-backed.
    #[derive(Default)]
    pub struct MemoryStore {
        hosts: DashMap<HostId, HostSpec>,
        credentials: DashMap<CredentialId, Credential>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_host(&self, spec: HostSpec) {
            self.hosts.insert(spec.host_id, spec);
        }

        pub fn insert_credential(&self, id: CredentialId, cred: Credential) {
            self.credentials.insert(id, cred);
        }
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn fetch_host(
            &self,
            host_id: HostId,
            _user_id: &str,
        ) -> Result<HostSpec, StoreError> {
            self.hosts
                .get(&host_id)
                .map(|e| e.clone())
                .ok_or(StoreError::NotFound)
        }

        async fn fetch_credential(
            &self,
            credential_id: CredentialId,
            _user_id: &str,
        ) -> Result<Credential, StoreError> {
            self.credentials
                .get(&credential_id)
                .map(|e| e.clone())
                .ok_or(StoreError::NotFound)
        }
    }

    /// Keyring that treats every user as unlocked
    pub struct UnlockedKeyring;

    impl UserKeyring for UnlockedKeyring {
        fn data_key(&self, _user_id: &str) -> Option<UserDataKey> {
            Some(UserDataKey::new(vec![0u8; 32]))
        }
    }

    /// Keyring that treats every user as locked
    pub struct LockedKeyring;

    impl UserKeyring for LockedKeyring {
        fn data_key(&self, _user_id: &str) -> Option<UserDataKey> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&AuthType::OpkSsh).unwrap(),
            "\"opkssh\""
        );
        assert_eq!(
            serde_json::from_str::<AuthType>("\"password\"").unwrap(),
            AuthType::Password
        );
        assert_eq!(
            serde_json::from_str::<AuthType>("\"none\"").unwrap(),
            AuthType::None
        );
    }

    #[test]
    fn credential_debug_never_prints_material() {
        let cred = Credential {
            password: Some("hunter2".into()),
            private_key: None,
            key_passphrase: None,
        };
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = memory::MemoryStore::new();
        store.insert_host(HostSpec {
            host_id: 1,
            host: "10.0.0.1".into(),
            port: 22,
            username: "root".into(),
            auth_type: AuthType::Password,
            force_kbd_interactive: false,
            credential_id: Some(7),
            jump_hops: vec![],
            proxy_chain: None,
            name: Some("prod-1".into()),
        });
        let spec = store.fetch_host(1, "alice").await.unwrap();
        assert_eq!(spec.host, "10.0.0.1");
        assert_eq!(
            store.fetch_host(2, "alice").await.unwrap_err(),
            StoreError::NotFound
        );
    }
}
