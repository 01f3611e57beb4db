//! Exec-channel bridges: metrics probes and Docker control
//!
//! Stats sessions run a fixed probe command on an interval and frame the
//! output as `data` events. Docker sessions exec `docker system
//! dial-stdio` on the remote host and pump raw bytes both ways, the same
//! mechanism `docker -H ssh://` uses; payloads are base64 in both
//! directions because the Docker API stream is binary.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{EventSender, ServerMessage};
use crate::ssh::{HandleController, SshError};

/// Probe cadence for stats sessions
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// One round-trip worth of host metrics. Portable across the usual server
/// distros; missing tools degrade to partial output.
const STATS_PROBE: &str =
    "uptime; echo ---; free -b 2>/dev/null; echo ---; df -P 2>/dev/null; echo ---; cat /proc/loadavg 2>/dev/null";

/// Per-probe exec deadline
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Run one command on a fresh exec channel and collect its output
pub async fn exec_capture(
    controller: &HandleController,
    command: &str,
) -> Result<String, SshError> {
    let mut channel = controller.open_session_channel().await?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::ChannelError(format!("Exec request failed: {}", e)))?;

    let mut output = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                output.extend_from_slice(&data)
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    Ok(String::from_utf8_lossy(&output).into_owned())
}

/// Spawn the metrics probe loop for a stats session.
///
/// The first probe fires immediately so the dashboard is not blank for a
/// full interval.
pub fn spawn_stats_probe(controller: HandleController, events: EventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut disconnect_rx = controller.subscribe_disconnect();
        let mut ticker = tokio::time::interval(STATS_INTERVAL);

        info!("Stats probe started");
        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => {
                    debug!("Stats probe stopped: SSH disconnected");
                    break;
                }
                _ = ticker.tick() => {
                    let probe = tokio::time::timeout(
                        PROBE_TIMEOUT,
                        exec_capture(&controller, STATS_PROBE),
                    )
                    .await;

                    match probe {
                        Ok(Ok(output)) => {
                            if events
                                .send(ServerMessage::Data { data: output })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("Stats probe failed: {}", e);
                            break;
                        }
                        Err(_) => {
                            warn!("Stats probe timed out");
                        }
                    }
                }
            }
        }
        debug!("Stats probe terminated");
    })
}

/// Handle to a running Docker control pipe
pub struct DockerBridge {
    input_tx: mpsc::Sender<Vec<u8>>,
}

impl DockerBridge {
    /// Forward base64-decoded bytes from the browser into the pipe
    pub async fn input(&self, bytes: Vec<u8>) -> Result<(), SshError> {
        self.input_tx
            .send(bytes)
            .await
            .map_err(|_| SshError::Disconnected)
    }
}

/// Exec `docker system dial-stdio` and pump bytes bidirectionally
pub async fn open_docker_pipe(
    controller: &HandleController,
    events: EventSender,
) -> Result<(DockerBridge, JoinHandle<()>), SshError> {
    let mut channel = controller.open_session_channel().await?;
    channel
        .exec(true, "docker system dial-stdio")
        .await
        .map_err(|e| SshError::ChannelError(format!("Docker pipe exec failed: {}", e)))?;

    info!("Docker control pipe opened");

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(256);

    let pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                bytes = input_rx.recv() => match bytes {
                    Some(bytes) => {
                        if let Err(e) = channel.data(&bytes[..]).await {
                            warn!("Docker pipe write failed: {}", e);
                            break;
                        }
                    }
                    None => {
                        let _ = channel.eof().await;
                        break;
                    }
                },
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let frame = ServerMessage::Data {
                            data: BASE64.encode(&data[..]),
                        };
                        if events.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                        // dial-stdio writes its own errors to stderr
                        warn!("docker dial-stdio: {}", String::from_utf8_lossy(&data));
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        debug!("Docker pipe closed by server");
                        break;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        if exit_status != 0 {
                            warn!(exit_status, "docker dial-stdio exited nonzero");
                        }
                    }
                    Some(_) => {}
                },
            }
        }
        debug!("Docker pipe pump terminated");
    });

    Ok((DockerBridge { input_tx }, pump))
}
