//! Handle Owner Task
//!
//! Exactly one task owns the `russh` client `Handle`; everything else
//! (shell bridge, SFTP, tunnels, teardown) talks to it through a cloned
//! [`HandleController`]. This avoids `Arc<Mutex<Handle>>` contention,
//! holding locks across `.await`, and concurrent protocol access.

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Outcome of a transport keepalive probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// Soft failure, possibly latency; retry before declaring death
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (PTY shell, exec, SFTP subsystem)
    OpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (tunnels, next jump hop)
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Keepalive probe
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Close the SSH connection
    Disconnect,
}

/// Cloneable handle to the Handle Owner Task.
///
/// Any holder has full SSH control; never expose one outside the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the underlying connection goes away. Tunnels and
    /// bridges select on this to stop promptly.
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Subscribe to the transport-closed notification
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Open a direct-tcpip channel to `host:port`
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Probe transport liveness with `keepalive@openssh.com`
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Ping { reply_tx })
            .await
            .is_err()
        {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Close the SSH connection; idempotent
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the owner task is still alive
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, consuming the `Handle`.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: uuid::Uuid,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_task = disconnect_tx.clone();

    tokio::spawn(async move {
        // Move into the task; sole owner from here on
        let mut handle = handle;

        debug!(%session_id, "Handle owner task started");

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::OpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!(%session_id, "Caller dropped before receiving session channel");
                        // Channel drops; the server closes it
                    }
                }

                HandleCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!(%session_id, "Caller dropped before receiving direct-tcpip channel");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    let result = match tokio::time::timeout(
                        std::time::Duration::from_secs(5),
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(e)) => {
                            let rendered = format!("{:?}", e);
                            if rendered.to_lowercase().contains("disconnect") {
                                warn!(%session_id, "Keepalive found transport closed: {:?}", e);
                                PingResult::IoError
                            } else {
                                warn!(%session_id, "Keepalive soft failure: {:?}", e);
                                PingResult::Timeout
                            }
                        }
                        Err(_) => {
                            warn!(%session_id, "Keepalive timed out (5s)");
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!(%session_id, "Disconnect requested");
                    break;
                }
            }
        }

        // Cleanup phase: notify subscribers, drain queued commands, close SSH
        let _ = disconnect_tx_task.send(());
        drain_pending_commands(&mut cmd_rx);
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        debug!(%session_id, "Handle owner task terminated");
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Return `Disconnected` to every caller still waiting in the queue
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::OpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
