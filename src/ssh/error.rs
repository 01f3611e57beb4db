//! SSH Error types
//!
//! Every terminal failure a session can hit maps to one variant with a
//! stable `code()` for the browser and a `user_message()` rendered per
//! cause. Errors are captured at the session boundary and translated into
//! typed WebSocket events; they never escape to crash the process.

use thiserror::Error;

/// Subcauses of a failed dial, including which proxy/jump hop broke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialCause {
    ResolveFailed,
    ConnectionRefused,
    Timeout,
    ResetByPeer,
    /// SOCKS5 hop `i` (zero-based) failed
    ProxyHop(usize),
    /// Jump host `i` (zero-based) failed
    JumpHop(usize),
    Other,
}

/// Subcauses of a failed SSH handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeCause {
    NoMatchingKex,
    NoMatchingCipher,
    NoMatchingMac,
    NoMatchingHostKey,
    Other,
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dial failed: {detail}")]
    DialFailed { cause: DialCause, detail: String },

    #[error("Handshake failed: {detail}")]
    HandshakeFailed {
        cause: HandshakeCause,
        detail: String,
    },

    #[error("Host key mismatch: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    #[error("Host key not yet trusted: {fingerprint}")]
    HostKeyUnverified { fingerprint: String },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Authentication timed out")]
    AuthTimeout,

    #[error("Authentication method not available")]
    AuthMethodUnavailable,

    #[error("Shell open failed: {0}")]
    ShellOpenFailed(String),

    #[error("Shell open timed out")]
    ShellOpenTimeout,

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("User data is locked")]
    DataLocked,

    #[error("Session limit reached: {current}/{max}")]
    SessionCapExceeded { current: usize, max: usize },

    #[error("Cancelled")]
    Cancelled,

    #[error("Server shutting down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    /// Stable machine-readable code sent alongside error events
    pub fn code(&self) -> &'static str {
        match self {
            SshError::InvalidInput(_) => "INVALID_INPUT",
            SshError::DialFailed { .. } => "DIAL_FAILED",
            SshError::HandshakeFailed { .. } => "HANDSHAKE_FAILED",
            SshError::HostKeyMismatch { .. } => "HOST_KEY_MISMATCH",
            SshError::HostKeyUnverified { .. } => "HOST_KEY_UNVERIFIED",
            SshError::AuthFailed(_) => "AUTH_FAILED",
            SshError::AuthTimeout => "AUTH_TIMEOUT",
            SshError::AuthMethodUnavailable => "AUTH_METHOD_UNAVAILABLE",
            SshError::ShellOpenFailed(_) => "SHELL_OPEN_FAILED",
            SshError::ShellOpenTimeout => "SHELL_OPEN_TIMEOUT",
            SshError::KeyError(_) => "KEY_ERROR",
            SshError::ChannelError(_) => "CHANNEL_ERROR",
            SshError::Protocol(_) => "PROTOCOL_ERROR",
            SshError::Disconnected => "DISCONNECTED",
            SshError::DataLocked => "DATA_LOCKED",
            SshError::SessionCapExceeded { .. } => "SESSION_CAP_EXCEEDED",
            SshError::Cancelled => "CANCELLED",
            SshError::Shutdown => "SHUTDOWN",
            SshError::Io(_) => "IO_ERROR",
        }
    }

    /// Whether the browser may follow up with `reconnect_with_credentials`
    pub fn invites_credentials(&self) -> bool {
        matches!(self, SshError::AuthMethodUnavailable)
    }

    /// User-facing message, friendlier than the raw cause chain
    pub fn user_message(&self) -> String {
        match self {
            SshError::DialFailed { cause, detail } => match cause {
                DialCause::ResolveFailed => {
                    "Could not resolve the hostname. Check the host address.".to_string()
                }
                DialCause::ConnectionRefused => {
                    "Connection refused. Is the SSH server running on that port?".to_string()
                }
                DialCause::Timeout => {
                    "Connection timed out. The host may be unreachable or firewalled.".to_string()
                }
                DialCause::ResetByPeer => "Connection reset by the remote host.".to_string(),
                DialCause::ProxyHop(i) => {
                    format!("Proxy hop {} failed: {}", i + 1, detail)
                }
                DialCause::JumpHop(i) => {
                    format!("Jump host {} failed: {}", i + 1, detail)
                }
                DialCause::Other => format!("Connection failed: {}", detail),
            },
            SshError::HandshakeFailed { cause, detail } => match cause {
                HandshakeCause::NoMatchingKex => {
                    "No compatible key exchange algorithm with this server.".to_string()
                }
                HandshakeCause::NoMatchingCipher => {
                    "No compatible cipher with this server.".to_string()
                }
                HandshakeCause::NoMatchingMac => {
                    "No compatible MAC algorithm with this server.".to_string()
                }
                HandshakeCause::NoMatchingHostKey => {
                    "No compatible host key algorithm with this server.".to_string()
                }
                HandshakeCause::Other => format!("SSH handshake failed: {}", detail),
            },
            SshError::HostKeyMismatch { .. } => {
                "Host key verification failed: the server's key has changed. \
                 This could indicate a man-in-the-middle attack."
                    .to_string()
            }
            SshError::AuthTimeout => "Authentication timed out.".to_string(),
            SshError::SessionCapExceeded { current, max } => format!(
                "Too many open sessions ({}/{}). Close one and try again.",
                current, max
            ),
            other => other.to_string(),
        }
    }

    /// Classify a dial-phase IO error into a [`DialCause`]
    pub fn from_dial_io(e: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let cause = match e.kind() {
            ErrorKind::ConnectionRefused => DialCause::ConnectionRefused,
            ErrorKind::ConnectionReset => DialCause::ResetByPeer,
            ErrorKind::TimedOut => DialCause::Timeout,
            ErrorKind::NotFound => DialCause::ResolveFailed,
            _ => DialCause::Other,
        };
        SshError::DialFailed {
            cause,
            detail: e.to_string(),
        }
    }

    /// Classify a russh handshake error into a [`HandshakeCause`]
    pub fn from_handshake(e: &russh::Error) -> Self {
        let detail = e.to_string();
        let lower = detail.to_lowercase();
        let cause = if lower.contains("kex") || lower.contains("key exchange") {
            HandshakeCause::NoMatchingKex
        } else if lower.contains("cipher") {
            HandshakeCause::NoMatchingCipher
        } else if lower.contains("mac") || lower.contains("hmac") {
            HandshakeCause::NoMatchingMac
        } else if lower.contains("host key") {
            HandshakeCause::NoMatchingHostKey
        } else {
            HandshakeCause::Other
        };
        SshError::HandshakeFailed { cause, detail }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_io_classification() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        match SshError::from_dial_io(&refused) {
            SshError::DialFailed { cause, .. } => {
                assert_eq!(cause, DialCause::ConnectionRefused)
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn hop_messages_are_one_based() {
        let err = SshError::DialFailed {
            cause: DialCause::JumpHop(0),
            detail: "refused".into(),
        };
        assert!(err.user_message().starts_with("Jump host 1"));
    }

    #[test]
    fn only_method_unavailable_invites_credentials() {
        assert!(SshError::AuthMethodUnavailable.invites_credentials());
        assert!(!SshError::AuthFailed("nope".into()).invites_credentials());
        assert!(!SshError::AuthTimeout.invites_credentials());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(SshError::DataLocked.code(), "DATA_LOCKED");
        assert_eq!(
            SshError::SessionCapExceeded { current: 3, max: 3 }.code(),
            "SESSION_CAP_EXCEEDED"
        );
    }
}
