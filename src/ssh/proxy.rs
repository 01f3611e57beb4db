//! Jump host chains (SSH-over-SSH)
//!
//! Builds a stack of SSH clients `[J1..Jn]` where each hop is tunneled
//! through the previous one via a `direct-tcpip` channel wrapped as a
//! stream, and returns the stream that reaches the final target. The
//! target's own handshake and authentication stay with the session, which
//! may need browser round-trips.
//!
//! ```text
//! Server --SSH--> [J1] --direct-tcpip--> [J2] --...--> [Jn] --direct-tcpip--> [Target]
//! ```
//!
//! On any hop failure all previously opened hops are closed in reverse
//! order and the error names the hop index.

use std::sync::Arc;

use russh::client::{Handle, Msg};
use russh::ChannelStream;
use tracing::{debug, info, warn};

use super::client::{
    authenticate_basic, handshake_over_stream, ClientHandler, HOP_READY_TIMEOUT,
};
use super::error::{DialCause, SshError};
use super::known_hosts::HostKeyStore;
use super::socks::{dial_direct, dial_through_chain};
use crate::protocol::{EventSender, LogLevel, ServerMessage};
use crate::store::{AuthType, Credential, HostSpec, SocksChain};

/// A jump hop with its credential already resolved
pub struct ResolvedHop {
    pub spec: HostSpec,
    pub credential: Credential,
}

/// The open jump-hop clients, outermost first. Disposing closes them in
/// reverse order so inner tunnels collapse before their carriers.
pub struct JumpChain {
    handles: Vec<Handle<ClientHandler>>,
}

impl JumpChain {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Close every hop, innermost first
    pub async fn dispose(self) {
        let count = self.handles.len();
        debug!("Disposing jump chain of {} hop(s)", count);
        for mut handle in self.handles.into_iter().rev() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
                .await;
        }
    }
}

/// Build the chain and return it together with a stream that reaches
/// `target_host:target_port` through the innermost hop.
///
/// `first_hop_proxy` applies the host's SOCKS5 chain to the dial of the
/// first hop only; subsequent hops ride direct-tcpip channels.
pub async fn build_jump_chain(
    user_id: &str,
    hops: &[ResolvedHop],
    target_host: &str,
    target_port: u16,
    first_hop_proxy: Option<&SocksChain>,
    hostkeys: Arc<HostKeyStore>,
    events: Option<&EventSender>,
) -> Result<(JumpChain, ChannelStream<Msg>), SshError> {
    if hops.is_empty() {
        return Err(SshError::InvalidInput("Jump chain is empty".into()));
    }

    info!(
        "Establishing jump chain: {} hop(s) to {}:{}",
        hops.len(),
        target_host,
        target_port
    );

    let mut handles: Vec<Handle<ClientHandler>> = Vec::with_capacity(hops.len());
    let mut current_stream: Option<ChannelStream<Msg>> = None;

    for (i, hop) in hops.iter().enumerate() {
        let step = connect_hop(
            user_id,
            hop,
            i,
            current_stream.take(),
            first_hop_proxy,
            hostkeys.clone(),
        )
        .await;

        let handle = match step {
            Ok(h) => h,
            Err(e) => {
                close_reverse(handles).await;
                return Err(e);
            }
        };

        if let Some(events) = events {
            let _ = events
                .send(ServerMessage::log(
                    "handshake",
                    LogLevel::Success,
                    format!("Jump host {} connected ({})", i + 1, hop.spec.host),
                ))
                .await;
        }

        // Open the tunnel toward the next hop, or the target after the
        // last hop
        let (next_host, next_port) = match hops.get(i + 1) {
            Some(next) => (next.spec.host.as_str(), next.spec.port),
            None => (target_host, target_port),
        };

        debug!(
            "Jump hop {}: opening tunnel to {}:{}",
            i + 1,
            next_host,
            next_port
        );

        match handle
            .channel_open_direct_tcpip(next_host, next_port as u32, "127.0.0.1", 0)
            .await
        {
            Ok(channel) => {
                current_stream = Some(channel.into_stream());
                handles.push(handle);
            }
            Err(e) => {
                warn!("Jump hop {} tunnel open failed: {}", i + 1, e);
                handles.push(handle);
                close_reverse(handles).await;
                return Err(SshError::DialFailed {
                    cause: DialCause::JumpHop(i),
                    detail: format!(
                        "Failed to open tunnel to {}:{}: {}",
                        next_host, next_port, e
                    ),
                });
            }
        }
    }

    let stream = current_stream.expect("loop ran at least once");
    info!("Jump chain established, target stream ready");
    Ok((JumpChain { handles }, stream))
}

/// Dial, handshake and authenticate a single hop
async fn connect_hop(
    user_id: &str,
    hop: &ResolvedHop,
    index: usize,
    carrier: Option<ChannelStream<Msg>>,
    first_hop_proxy: Option<&SocksChain>,
    hostkeys: Arc<HostKeyStore>,
) -> Result<Handle<ClientHandler>, SshError> {
    let spec = &hop.spec;
    info!(
        "Jump hop {}: connecting to {}@{}:{}",
        index + 1,
        spec.username,
        spec.host,
        spec.port
    );

    if !matches!(spec.auth_type, AuthType::Password | AuthType::Key) {
        return Err(SshError::DialFailed {
            cause: DialCause::JumpHop(index),
            detail: "Jump hosts support password or key authentication only".into(),
        });
    }

    let handler = ClientHandler::jump_hop(user_id.to_string(), spec.host_id, hostkeys);

    let result: Result<Handle<ClientHandler>, SshError> = async {
        let mut handle = match carrier {
            Some(stream) => handshake_over_stream(stream, handler, HOP_READY_TIMEOUT).await?,
            None => {
                let tcp = match first_hop_proxy {
                    Some(chain) if !chain.is_empty() => {
                        dial_through_chain(chain, &spec.host, spec.port, HOP_READY_TIMEOUT).await?
                    }
                    _ => dial_direct(&spec.host, spec.port, HOP_READY_TIMEOUT).await?,
                };
                handshake_over_stream(tcp, handler, HOP_READY_TIMEOUT).await?
            }
        };

        authenticate_basic(&mut handle, &spec.username, spec.auth_type, &hop.credential).await?;
        Ok(handle)
    }
    .await;

    result.map_err(|e| match e {
        // host-key outcomes keep their own semantics for the browser
        mismatch @ SshError::HostKeyMismatch { .. } => mismatch,
        unverified @ SshError::HostKeyUnverified { .. } => unverified,
        proxy @ SshError::DialFailed {
            cause: DialCause::ProxyHop(_),
            ..
        } => proxy,
        other => SshError::DialFailed {
            cause: DialCause::JumpHop(index),
            detail: other.to_string(),
        },
    })
}

async fn close_reverse(handles: Vec<Handle<ClientHandler>>) {
    for mut handle in handles.into_iter().rev() {
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
    }
}
