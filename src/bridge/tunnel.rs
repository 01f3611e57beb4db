//! Local TCP tunnels over direct-tcpip
//!
//! Each `tunnel_open` starts a local listener; every accepted socket is
//! bridged to a fresh direct-tcpip channel on the session's transport.
//! Listener lifetime is bound to the session: transport disconnect or
//! session teardown stops the accept loop and all connection handlers.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::protocol::{EventSender, ServerMessage};
use crate::ssh::{HandleController, SshError};

struct TunnelEntry {
    stop_tx: mpsc::Sender<()>,
}

/// All tunnels of one session
pub struct TunnelManager {
    controller: HandleController,
    events: EventSender,
    listeners: Mutex<HashMap<u16, TunnelEntry>>,
}

impl TunnelManager {
    pub fn new(controller: HandleController, events: EventSender) -> Self {
        Self {
            controller,
            events,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Open a tunnel: local `127.0.0.1:local_port` to
    /// `remote_host:remote_port` through the SSH transport.
    pub async fn open(
        &self,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    ) -> Result<u16, SshError> {
        if self.listeners.lock().contains_key(&local_port) {
            return Err(SshError::InvalidInput(format!(
                "Tunnel on port {} already open",
                local_port
            )));
        }

        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => SshError::InvalidInput(format!(
                    "Port {} is already in use by another application",
                    local_port
                )),
                std::io::ErrorKind::PermissionDenied => SshError::InvalidInput(format!(
                    "Permission denied binding port {}; ports below 1024 need privileges",
                    local_port
                )),
                _ => SshError::Io(e),
            })?;

        let bound_port = listener
            .local_addr()
            .map_err(SshError::Io)?
            .port();

        info!(
            bound_port,
            remote = %format!("{}:{}", remote_host, remote_port),
            "Tunnel listener started"
        );

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        self.listeners
            .lock()
            .insert(bound_port, TunnelEntry { stop_tx });

        let controller = self.controller.clone();
        let mut disconnect_rx = controller.subscribe_disconnect();
        let events = self.events.clone();

        // fan-out shutdown to per-connection handlers
        let (conn_shutdown_tx, _) = broadcast::channel::<()>(16);
        let conn_shutdown = conn_shutdown_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = disconnect_rx.recv() => {
                        info!(bound_port, "Tunnel stopped: SSH disconnected");
                        break;
                    }
                    _ = stop_rx.recv() => {
                        info!(bound_port, "Tunnel stopped by request");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            debug!(bound_port, %peer, "Tunnel connection accepted");

                            let controller = controller.clone();
                            let remote_host = remote_host.clone();
                            let mut shutdown_rx = conn_shutdown.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = bridge_connection(
                                    controller,
                                    stream,
                                    &remote_host,
                                    remote_port,
                                    peer,
                                    &mut shutdown_rx,
                                )
                                .await
                                {
                                    warn!(bound_port, "Tunnel connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!(bound_port, "Tunnel accept error: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }

            let _ = conn_shutdown_tx.send(());
            let _ = events
                .send(ServerMessage::TunnelClosed {
                    local_port: bound_port,
                })
                .await;
        });

        let _ = self
            .events
            .send(ServerMessage::TunnelOpened {
                local_port: bound_port,
            })
            .await;

        Ok(bound_port)
    }

    /// Close one tunnel; unknown ports are a no-op
    pub async fn close(&self, local_port: u16) {
        let entry = self.listeners.lock().remove(&local_port);
        if let Some(entry) = entry {
            let _ = entry.stop_tx.send(()).await;
        }
    }

    /// Session teardown: stop every listener
    pub async fn close_all(&self) {
        let entries: Vec<(u16, TunnelEntry)> =
            self.listeners.lock().drain().collect();
        for (port, entry) in entries {
            debug!(port, "Closing tunnel");
            let _ = entry.stop_tx.send(()).await;
        }
    }
}

/// Pump one accepted socket through a fresh direct-tcpip channel
async fn bridge_connection(
    controller: HandleController,
    mut stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
    peer: std::net::SocketAddr,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), SshError> {
    let channel = controller
        .open_direct_tcpip(
            remote_host,
            remote_port as u32,
            &peer.ip().to_string(),
            peer.port() as u32,
        )
        .await?;

    let mut remote = channel.into_stream();

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut stream, &mut remote) => {
            match result {
                Ok((up, down)) => {
                    debug!(up, down, "Tunnel connection finished");
                }
                Err(e) => {
                    debug!("Tunnel connection ended with error: {}", e);
                }
            }
        }
        _ = shutdown_rx.recv() => {
            debug!("Tunnel connection aborted by shutdown");
        }
    }

    Ok(())
}
