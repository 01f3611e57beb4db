//! PTY shell bridge
//!
//! Couples one SSH session channel running an interactive shell to the
//! session's event stream. Input is written as raw UTF-8 bytes (escape
//! sequences and literal tabs pass through unchanged); output is decoded
//! incrementally so multi-byte codepoints split across SSH frames never
//! produce mojibake, with a Latin-1 fallback for genuinely non-UTF-8
//! servers.
//!
//! No NUL-byte keepalives are ever written to the PTY: terminals with
//! echoctl render them as `^@`. Liveness belongs to the SSH transport
//! keepalive.

use std::time::Duration;

use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::protocol::{EventSender, ServerMessage};
use crate::ssh::{HandleController, SshError};

/// Watchdog for PTY + shell establishment
pub const SHELL_TIMEOUT: Duration = Duration::from_secs(15);

/// Commands accepted by the shell pump
#[derive(Debug)]
pub enum TermCommand {
    /// Bytes for the PTY (already UTF-8 encoded)
    Input(Vec<u8>),
    /// Window change (cols, rows)
    Resize(u16, u16),
    Close,
}

/// Handle to a running shell pump
pub struct TerminalBridge {
    cmd_tx: mpsc::Sender<TermCommand>,
}

impl TerminalBridge {
    pub async fn input(&self, bytes: Vec<u8>) -> Result<(), SshError> {
        self.cmd_tx
            .send(TermCommand::Input(bytes))
            .await
            .map_err(|_| SshError::Disconnected)
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SshError> {
        self.cmd_tx
            .send(TermCommand::Resize(cols, rows))
            .await
            .map_err(|_| SshError::Disconnected)
    }

    /// Idempotent; a dead pump means the close already happened
    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(TermCommand::Close);
    }
}

/// Incremental UTF-8 decoder with codepoint carry and Latin-1 fallback
#[derive(Default)]
pub struct Utf8StreamDecoder {
    carry: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, holding back an incomplete trailing codepoint for
    /// the next call. Invalid sequences fall back to Latin-1 for the
    /// whole pending buffer.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        if self.carry.is_empty() && bytes.is_empty() {
            return String::new();
        }
        self.carry.extend_from_slice(bytes);

        match std::str::from_utf8(&self.carry) {
            Ok(s) => {
                let out = s.to_string();
                self.carry.clear();
                out
            }
            Err(e) => {
                let valid = e.valid_up_to();
                match e.error_len() {
                    // incomplete tail: emit the valid prefix, keep the rest
                    None => {
                        let out = std::str::from_utf8(&self.carry[..valid])
                            .expect("prefix verified valid")
                            .to_string();
                        self.carry.drain(..valid);
                        out
                    }
                    // truly invalid bytes: this is not UTF-8 output
                    Some(_) => {
                        let (decoded, _, _) =
                            encoding_rs::WINDOWS_1252.decode(&self.carry);
                        let out = decoded.into_owned();
                        self.carry.clear();
                        out
                    }
                }
            }
        }
    }

    /// Drain whatever is still held back (stream ended mid-codepoint)
    pub fn flush(&mut self) -> String {
        if self.carry.is_empty() {
            return String::new();
        }
        let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(&self.carry);
        let out = decoded.into_owned();
        self.carry.clear();
        out
    }
}

/// Open a PTY shell on a fresh session channel and spawn the pump.
///
/// The whole establishment sequence runs under the shell watchdog; a
/// server that never answers the shell request surfaces as
/// `ShellOpenTimeout` instead of a wedged tab.
pub async fn open_shell(
    controller: &HandleController,
    cols: u16,
    rows: u16,
    events: EventSender,
) -> Result<(TerminalBridge, JoinHandle<()>), SshError> {
    let establish = async {
        let channel = controller.open_session_channel().await?;

        // Force a UTF-8 locale; servers with AcceptEnv restrictions just
        // ignore these
        let _ = channel.set_env(false, "LANG", "en_US.UTF-8").await;
        let _ = channel.set_env(false, "LC_CTYPE", "en_US.UTF-8").await;

        channel
            .request_pty(false, "xterm-256color", cols as u32, rows as u32, 0, 0, &[])
            .await
            .map_err(|e| SshError::ShellOpenFailed(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ShellOpenFailed(format!("Shell request failed: {}", e)))?;

        Ok::<_, SshError>(channel)
    };

    let mut channel = tokio::time::timeout(SHELL_TIMEOUT, establish)
        .await
        .map_err(|_| SshError::ShellOpenTimeout)??;

    info!(cols, rows, "Interactive shell started");

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<TermCommand>(1024);

    let pump = tokio::spawn(async move {
        let mut decoder = Utf8StreamDecoder::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(TermCommand::Input(bytes)) => {
                        if let Err(e) = channel.data(&bytes[..]).await {
                            error!("Failed to write to shell channel: {}", e);
                            break;
                        }
                    }
                    Some(TermCommand::Resize(cols, rows)) => {
                        debug!(cols, rows, "Window change");
                        if let Err(e) = channel
                            .window_change(cols as u32, rows as u32, 0, 0)
                            .await
                        {
                            // resize failures are not fatal to the shell
                            error!("Failed to resize PTY: {}", e);
                        }
                    }
                    Some(TermCommand::Close) | None => {
                        let _ = channel.eof().await;
                        break;
                    }
                },

                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let text = decoder.decode(&data);
                        if !text.is_empty()
                            && events.send(ServerMessage::Data { data: text }).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // stderr shares the terminal
                        if ext == 1 {
                            let text = decoder.decode(&data);
                            if !text.is_empty()
                                && events.send(ServerMessage::Data { data: text }).await.is_err()
                            {
                                break;
                            }
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                        info!("Shell channel closed by server");
                        break;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!(exit_status, "Shell exit status");
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        debug!(?signal_name, "Shell exit signal");
                    }
                    Some(_) => {}
                    None => {
                        debug!("Shell channel stream ended");
                        break;
                    }
                },
            }
        }

        let tail = decoder.flush();
        if !tail.is_empty() {
            let _ = events.send(ServerMessage::Data { data: tail }).await;
        }
        debug!("Shell pump terminated");
    });

    Ok((TerminalBridge { cmd_tx }, pump))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut d = Utf8StreamDecoder::new();
        assert_eq!(d.decode(b"hello\r\n"), "hello\r\n");
    }

    #[test]
    fn split_codepoint_is_held_back() {
        let mut d = Utf8StreamDecoder::new();
        let bytes = "aé".as_bytes(); // 61 C3 A9
        assert_eq!(d.decode(&bytes[..2]), "a");
        assert_eq!(d.decode(&bytes[2..]), "é");
    }

    #[test]
    fn split_four_byte_emoji() {
        let mut d = Utf8StreamDecoder::new();
        let bytes = "🦀".as_bytes();
        assert_eq!(d.decode(&bytes[..1]), "");
        assert_eq!(d.decode(&bytes[1..3]), "");
        assert_eq!(d.decode(&bytes[3..]), "🦀");
    }

    #[test]
    fn invalid_bytes_fall_back_to_latin1() {
        let mut d = Utf8StreamDecoder::new();
        // 0xE9 alone is latin-1 'é', invalid as UTF-8 lead-then-ascii
        let out = d.decode(&[0xE9, b'x']);
        assert_eq!(out, "éx");
    }

    #[test]
    fn flush_drains_held_tail() {
        let mut d = Utf8StreamDecoder::new();
        let bytes = "é".as_bytes();
        assert_eq!(d.decode(&bytes[..1]), "");
        // stream ends mid-codepoint; the lone byte comes out as latin-1
        assert_eq!(d.flush(), "Ã");
        assert_eq!(d.flush(), "");
    }

    #[test]
    fn tabs_and_escapes_survive_round_trip() {
        let mut d = Utf8StreamDecoder::new();
        let s = "\x1b[1;31mred\tcol\x1b[0m";
        assert_eq!(d.decode(s.as_bytes()), s);
    }
}
