//! WebSocket wire protocol
//!
//! Every frame is a JSON object with a required `type` field. Inbound and
//! outbound messages are closed sum types validated at the boundary; no
//! untyped payloads cross into the session layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::store::{AuthType, HostId};

/// Per-session ordered event channel to the WebSocket writer task
pub type EventSender = mpsc::Sender<ServerMessage>;
pub type EventReceiver = mpsc::Receiver<ServerMessage>;

/// Outbound event channel capacity. Large enough to absorb PTY bursts
/// without stalling the channel reader.
pub const EVENT_CHANNEL_CAPACITY: usize = 4096;

// ============================================================================
// Browser -> server
// ============================================================================

/// Parameters of a `connectToHost` message. Either a stored `hostId` or
/// inline host fields; inline fields override the stored record.
#[derive(Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectRequest {
    pub host_id: Option<HostId>,
    pub host: Option<String>,
    /// Kept wide so out-of-range ports reach validation as `InvalidInput`
    /// instead of dying as a parse error
    pub port: Option<u32>,
    pub username: Option<String>,
    pub auth_type: Option<AuthType>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub key_passphrase: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// TOFU pre-approval: Some(true) trusts and records an unknown host key
    /// when the confirm-first-use policy is active
    pub trust_host_key: Option<bool>,
}

// Connect requests can carry credentials; keep them out of logs.
impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host_id", &self.host_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_type", &self.auth_type)
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<set>"))
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotpPayload {
    pub code: String,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordPayload {
    pub password: String,
}

impl std::fmt::Debug for PasswordPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordPayload { password: <set> }")
    }
}

/// Credentials supplied after `auth_method_not_available`
#[derive(Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectCredentials {
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub key_passphrase: Option<String>,
}

impl std::fmt::Debug for ReconnectCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReconnectCredentials { .. }")
    }
}

/// Messages the browser sends
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "connectToHost")]
    ConnectToHost(ConnectRequest),

    #[serde(rename = "input")]
    Input { data: String },

    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },

    #[serde(rename = "disconnect")]
    Disconnect,

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "totp_response")]
    TotpResponse { data: TotpPayload },

    #[serde(rename = "password_response")]
    PasswordResponse { data: PasswordPayload },

    #[serde(rename = "warpgate_auth_continue")]
    WarpgateAuthContinue,

    #[serde(rename = "reconnect_with_credentials")]
    ReconnectWithCredentials(ReconnectCredentials),

    #[serde(rename = "opkssh_start_auth")]
    OpksshStartAuth {
        #[serde(rename = "hostId")]
        host_id: HostId,
    },

    #[serde(rename = "opkssh_cancel")]
    OpksshCancel {
        #[serde(rename = "requestId")]
        request_id: String,
    },

    #[serde(rename = "opkssh_browser_opened")]
    OpksshBrowserOpened {
        #[serde(rename = "requestId")]
        request_id: String,
    },

    #[serde(rename = "opkssh_auth_completed")]
    OpksshAuthCompleted {
        #[serde(rename = "requestId")]
        request_id: String,
    },

    // ---- file manager operations (files sessions) ----
    #[serde(rename = "file_list")]
    FileList { path: String },

    #[serde(rename = "file_stat")]
    FileStat { path: String },

    #[serde(rename = "file_read")]
    FileRead { path: String },

    #[serde(rename = "file_write")]
    FileWrite {
        path: String,
        /// Base64 chunk payload
        data: String,
        #[serde(default)]
        append: bool,
    },

    #[serde(rename = "file_mkdir")]
    FileMkdir { path: String },

    #[serde(rename = "file_move")]
    FileMove { from: String, to: String },

    #[serde(rename = "file_remove")]
    FileRemove { path: String },

    #[serde(rename = "file_chmod")]
    FileChmod { path: String, mode: u32 },

    #[serde(rename = "file_chown")]
    FileChown { path: String, uid: u32, gid: u32 },

    // ---- tunnel operations (tunnel sessions) ----
    #[serde(rename = "tunnel_open")]
    TunnelOpen {
        #[serde(rename = "localPort")]
        local_port: u16,
        #[serde(rename = "remoteHost")]
        remote_host: String,
        #[serde(rename = "remotePort")]
        remote_port: u16,
    },

    #[serde(rename = "tunnel_close")]
    TunnelClose {
        #[serde(rename = "localPort")]
        local_port: u16,
    },
}

// ============================================================================
// Server -> browser
// ============================================================================

/// Severity of a `connection_log` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// Remote directory entry for `file_list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: String,
    pub size: u64,
    pub modified: i64,
    pub permissions: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub is_symlink: bool,
}

/// Messages the server sends
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection_log")]
    ConnectionLog {
        stage: String,
        level: LogLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    #[serde(rename = "connected")]
    Connected,

    #[serde(rename = "disconnected")]
    Disconnected,

    #[serde(rename = "data")]
    Data { data: String },

    #[serde(rename = "resized")]
    Resized { cols: u16, rows: u16 },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    #[serde(rename = "auth_method_not_available")]
    AuthMethodNotAvailable,

    #[serde(rename = "host_key_prompt")]
    HostKeyPrompt { fingerprint: String },

    #[serde(rename = "host_key_mismatch")]
    HostKeyMismatch { expected: String, actual: String },

    #[serde(rename = "opkssh_status", rename_all = "camelCase")]
    OpksshStatus {
        stage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        local_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "opkssh_config_error", rename_all = "camelCase")]
    OpksshConfigError {
        error: String,
        instructions: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        config_path: Option<String>,
    },

    #[serde(rename = "opkssh_error", rename_all = "camelCase")]
    OpksshError { request_id: String, error: String },

    #[serde(rename = "opkssh_completed", rename_all = "camelCase")]
    OpksshCompleted {
        request_id: String,
        expires_at: i64,
    },

    #[serde(rename = "opkssh_timeout", rename_all = "camelCase")]
    OpksshTimeout { request_id: String },

    #[serde(rename = "opkssh_auth_required", rename_all = "camelCase")]
    OpksshAuthRequired { host_id: HostId },

    #[serde(rename = "pong")]
    Pong,

    // ---- file manager results ----
    #[serde(rename = "file_list")]
    FileListResult { path: String, entries: Vec<FileEntry> },

    #[serde(rename = "file_stat")]
    FileStatResult { entry: FileEntry },

    #[serde(rename = "file_data", rename_all = "camelCase")]
    FileData {
        path: String,
        /// Base64 chunk payload
        data: String,
        offset: u64,
        eof: bool,
    },

    #[serde(rename = "file_progress", rename_all = "camelCase")]
    FileProgress {
        path: String,
        bytes: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },

    #[serde(rename = "file_done")]
    FileDone { op: String, path: String },

    // ---- tunnel results ----
    #[serde(rename = "tunnel_opened", rename_all = "camelCase")]
    TunnelOpened { local_port: u16 },

    #[serde(rename = "tunnel_closed", rename_all = "camelCase")]
    TunnelClosed { local_port: u16 },
}

impl ServerMessage {
    /// Shorthand for a `connection_log` line without details
    pub fn log(stage: &str, level: LogLevel, message: impl Into<String>) -> Self {
        ServerMessage::ConnectionLog {
            stage: stage.to_string(),
            level,
            message: message.into(),
            details: None,
        }
    }

    /// `connection_log` with a structured details payload
    pub fn log_with(
        stage: &str,
        level: LogLevel,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        ServerMessage::ConnectionLog {
            stage: stage.to_string(),
            level,
            message: message.into(),
            details: Some(details),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_message_parses_inline_fields() {
        let raw = r#"{
            "type": "connectToHost",
            "host": "10.0.0.1",
            "port": 22,
            "username": "root",
            "authType": "password",
            "password": "p",
            "cols": 80,
            "rows": 24
        }"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::ConnectToHost(req) => {
                assert_eq!(req.host.as_deref(), Some("10.0.0.1"));
                assert_eq!(req.port, Some(22));
                assert_eq!(req.auth_type, Some(AuthType::Password));
                assert_eq!(req.password.as_deref(), Some("p"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn totp_response_parses_nested_data() {
        let raw = r#"{"type":"totp_response","data":{"code":"123456"}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::TotpResponse { data } => assert_eq!(data.code, "123456"),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"drop_tables"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn server_message_tagging() {
        let json = serde_json::to_value(ServerMessage::log(
            "handshake",
            LogLevel::Success,
            "SSH handshake completed",
        ))
        .unwrap();
        assert_eq!(json["type"], "connection_log");
        assert_eq!(json["stage"], "handshake");
        assert_eq!(json["level"], "success");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn opkssh_status_uses_camel_case_fields() {
        let json = serde_json::to_value(ServerMessage::OpksshStatus {
            stage: "chooser".into(),
            url: Some("https://term.example.com/ssh/opkssh-chooser/abc".into()),
            local_url: Some("http://localhost:54001/chooser".into()),
            message: None,
        })
        .unwrap();
        assert_eq!(json["type"], "opkssh_status");
        assert_eq!(json["localUrl"], "http://localhost:54001/chooser");
    }

    #[test]
    fn connect_request_debug_hides_password() {
        let req = ConnectRequest {
            password: Some("secret".into()),
            ..Default::default()
        };
        assert!(!format!("{:?}", req).contains("secret"));
    }
}
