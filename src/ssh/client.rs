//! SSH transport establishment
//!
//! All transports are built over a stream we dialed ourselves (plain TCP,
//! SOCKS5 chain, or a direct-tcpip channel from a jump host), then handed
//! to `russh::client::connect_stream`. Host keys are checked against the
//! per-user TOFU store inside the russh handler callback.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::error::SshError;
use super::keys::decode_private_key;
use super::known_hosts::{HostKeyDecision, HostKeyStore};
use crate::store::{AuthType, Credential, HostId};

/// Connect-level deadline covering dial + handshake of the main transport
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-hop readiness deadline inside a jump chain
pub const HOP_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared russh client configuration.
///
/// Transport keepalive every 30 s, dead after 3 misses. Inactivity timeout
/// stays disabled; the WebSocket layer owns liveness of the browser side.
pub fn ssh_client_config() -> client::Config {
    client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    }
}

/// russh event handler carrying the host-key verification context
pub struct ClientHandler {
    user_id: String,
    host_id: HostId,
    is_jump_hop: bool,
    trust_host_key: Option<bool>,
    hostkeys: Arc<HostKeyStore>,
}

impl ClientHandler {
    pub fn new(
        user_id: String,
        host_id: HostId,
        hostkeys: Arc<HostKeyStore>,
        trust_host_key: Option<bool>,
    ) -> Self {
        Self {
            user_id,
            host_id,
            is_jump_hop: false,
            trust_host_key,
            hostkeys,
        }
    }

    /// Handler for a jump hop: same rules, prompts suppressed
    pub fn jump_hop(user_id: String, host_id: HostId, hostkeys: Arc<HostKeyStore>) -> Self {
        Self {
            user_id,
            host_id,
            is_jump_hop: true,
            trust_host_key: None,
            hostkeys,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = HostKeyStore::fingerprint(server_public_key);

        match self.hostkeys.verify(
            &self.user_id,
            self.host_id,
            &fingerprint,
            self.is_jump_hop,
            self.trust_host_key,
        )? {
            HostKeyDecision::Accept => {
                debug!(
                    user_id = %self.user_id,
                    host_id = self.host_id,
                    "Host key accepted"
                );
                Ok(true)
            }
            HostKeyDecision::Prompt { fingerprint } => {
                Err(SshError::HostKeyUnverified { fingerprint })
            }
            HostKeyDecision::Reject { expected, actual } => {
                Err(SshError::HostKeyMismatch { expected, actual })
            }
        }
    }
}

/// Run the SSH handshake over an already-connected stream.
///
/// The deadline bounds handshake readiness; host-key and algorithm
/// failures surface classified.
pub async fn handshake_over_stream<S>(
    stream: S,
    handler: ClientHandler,
    ready_timeout: Duration,
) -> Result<Handle<ClientHandler>, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = Arc::new(ssh_client_config());

    let handle = tokio::time::timeout(
        ready_timeout,
        client::connect_stream(config, stream, handler),
    )
    .await
    .map_err(|_| SshError::HandshakeFailed {
        cause: super::error::HandshakeCause::Other,
        detail: "SSH handshake timed out".into(),
    })?
    .map_err(classify_connect_error)?;

    debug!("SSH handshake completed");
    Ok(handle)
}

/// Re-classify handshake-phase errors. Host-key outcomes from our own
/// handler pass through untouched; russh protocol errors are mapped onto
/// the handshake taxonomy.
fn classify_connect_error(e: SshError) -> SshError {
    use super::error::HandshakeCause;

    match e {
        SshError::Protocol(detail) => {
            let lower = detail.to_lowercase();
            let cause = if lower.contains("kex") || lower.contains("key exchange") {
                HandshakeCause::NoMatchingKex
            } else if lower.contains("cipher") {
                HandshakeCause::NoMatchingCipher
            } else if lower.contains("mac") || lower.contains("hmac") {
                HandshakeCause::NoMatchingMac
            } else if lower.contains("host key") {
                HandshakeCause::NoMatchingHostKey
            } else if lower.contains("version") || lower.contains("banner") {
                HandshakeCause::Other
            } else {
                return SshError::Protocol(detail);
            };
            SshError::HandshakeFailed { cause, detail }
        }
        other => other,
    }
}

/// Authenticate with a stored credential, no keyboard-interactive.
///
/// Used for jump hops and for the direct password/key paths of the main
/// session. `AuthType::None` and forced keyboard-interactive go through
/// the auth engine instead.
pub async fn authenticate_basic(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    auth_type: AuthType,
    credential: &Credential,
) -> Result<(), SshError> {
    let authenticated = match auth_type {
        AuthType::Password => {
            let password = credential
                .password
                .as_deref()
                .ok_or_else(|| SshError::AuthFailed("No password on record".into()))?;
            handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| SshError::AuthFailed(e.to_string()))?
        }
        AuthType::Key => {
            let raw = credential
                .private_key
                .as_deref()
                .ok_or_else(|| SshError::AuthFailed("No private key on record".into()))?;
            let key = decode_private_key(raw, credential.key_passphrase.as_deref())?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthFailed(e.to_string()))?
        }
        AuthType::OpkSsh | AuthType::None => {
            return Err(SshError::AuthFailed(
                "authenticate_basic only handles password/key".into(),
            ));
        }
    };

    if !authenticated.success() {
        return Err(SshError::AuthFailed(
            "Authentication rejected by server".into(),
        ));
    }

    info!(username, "SSH authentication successful");
    Ok(())
}

/// Authenticate with an OpenSSH certificate pair materialized to disk by
/// the OPK flow. The files are ephemeral (0600, temp dir) and unlinked
/// when the session closes.
pub async fn authenticate_opk_cert(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    key_path: &std::path::Path,
    cert_path: &std::path::Path,
) -> Result<(), SshError> {
    let key = russh::keys::load_secret_key(key_path, None)
        .map_err(|e| SshError::KeyError(e.to_string()))?;
    let cert = russh::keys::load_openssh_certificate(cert_path)
        .map_err(|e| SshError::KeyError(format!("Failed to load certificate: {}", e)))?;

    let authenticated = handle
        .authenticate_openssh_cert(username, Arc::new(key), cert)
        .await
        .map_err(|e| SshError::AuthFailed(format!("Certificate authentication failed: {}", e)))?;

    if !authenticated.success() {
        return Err(SshError::AuthFailed(
            "Certificate rejected by server".into(),
        ));
    }

    info!(username, "SSH certificate authentication successful");
    Ok(())
}
