//! Session kinds, states and connect-time validation

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::activity::ActivityKind;
use crate::ssh::SshError;

/// What a WebSocket endpoint asked this session to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Terminal,
    Tunnel,
    Files,
    Stats,
    Docker,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Terminal => "terminal",
            SessionKind::Tunnel => "tunnel",
            SessionKind::Files => "files",
            SessionKind::Stats => "stats",
            SessionKind::Docker => "docker",
        }
    }

    /// Per-user concurrent session cap for this kind
    pub fn per_user_cap(&self) -> usize {
        match self {
            SessionKind::Terminal => 3,
            _ => 10,
        }
    }

    /// Category reported to the activity sink
    pub fn activity_kind(&self) -> ActivityKind {
        match self {
            SessionKind::Terminal => ActivityKind::Terminal,
            SessionKind::Tunnel => ActivityKind::Tunnel,
            SessionKind::Files => ActivityKind::FileManager,
            SessionKind::Stats => ActivityKind::Terminal,
            SessionKind::Docker => ActivityKind::Docker,
        }
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Authenticating,
    AwaitingPrompt,
    Connected,
    Closing,
    Closed,
}

impl SessionState {
    /// Allowed forward transitions. `Closing` is reachable from anywhere;
    /// `Closed` only from `Closing`.
    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Closing) => self != Closed,
            (Closing, Closed) => true,
            (Starting, Authenticating) => true,
            (Authenticating, AwaitingPrompt) | (AwaitingPrompt, Authenticating) => true,
            (Authenticating, Connected) => true,
            // a fresh attempt after auth_method_not_available
            (AwaitingPrompt, Starting) => true,
            _ => false,
        }
    }
}

/// State holder with transition validation
pub struct StateCell {
    state: Mutex<SessionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Starting),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.state.lock()
    }

    /// Attempt a transition; invalid ones are logged and refused rather
    /// than poisoning the session
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            debug!(from = ?*state, to = ?next, "Session state transition");
            *state = next;
            true
        } else {
            if *state != next {
                warn!(from = ?*state, to = ?next, "Refused session state transition");
            }
            false
        }
    }
}

/// Why a session is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Typed error already reported to the browser
    Error,
    /// Browser sent `disconnect`
    ClientRequest,
    /// The WebSocket itself went away
    WsClosed,
    /// `SessionRegistry.cancel`
    Cancelled,
    /// Process shutdown
    Shutdown,
    /// Remote end closed the channel/transport
    RemoteClosed,
}

/// Validate connect-time endpoint input. No state transitions happen on
/// failure; the error goes straight back to the browser.
pub fn validate_endpoint(host: &str, port: u32, username: &str) -> Result<u16, SshError> {
    if host.trim().is_empty() {
        return Err(SshError::InvalidInput("Host must not be empty".into()));
    }
    if username.trim().is_empty() {
        return Err(SshError::InvalidInput("Username must not be empty".into()));
    }
    if port == 0 || port > 65535 {
        return Err(SshError::InvalidInput(format!(
            "Port {} is out of range (1-65535)",
            port
        )));
    }
    Ok(port as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_bounds() {
        assert!(validate_endpoint("h", 0, "u").is_err());
        assert!(validate_endpoint("h", 65536, "u").is_err());
        assert_eq!(validate_endpoint("h", 22, "u").unwrap(), 22);
        assert_eq!(validate_endpoint("h", 65535, "u").unwrap(), 65535);
    }

    #[test]
    fn blank_identifiers_rejected() {
        assert!(validate_endpoint("", 22, "root").is_err());
        assert!(validate_endpoint("host", 22, "").is_err());
        assert!(validate_endpoint("host", 22, "   ").is_err());
        assert!(validate_endpoint("  ", 22, "root").is_err());
    }

    #[test]
    fn happy_path_transitions() {
        let cell = StateCell::new();
        assert!(cell.transition(SessionState::Authenticating));
        assert!(cell.transition(SessionState::AwaitingPrompt));
        assert!(cell.transition(SessionState::Authenticating));
        assert!(cell.transition(SessionState::Connected));
        assert!(cell.transition(SessionState::Closing));
        assert!(cell.transition(SessionState::Closed));
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn closed_is_terminal() {
        let cell = StateCell::new();
        cell.transition(SessionState::Closing);
        cell.transition(SessionState::Closed);
        assert!(!cell.transition(SessionState::Closing));
        assert!(!cell.transition(SessionState::Connected));
    }

    #[test]
    fn connected_requires_authenticating() {
        let cell = StateCell::new();
        assert!(!cell.transition(SessionState::Connected));
        assert_eq!(cell.get(), SessionState::Starting);
    }

    #[test]
    fn terminal_cap_is_three() {
        assert_eq!(SessionKind::Terminal.per_user_cap(), 3);
        assert!(SessionKind::Files.per_user_cap() > 3);
    }
}
