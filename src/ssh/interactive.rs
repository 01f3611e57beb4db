//! Keyboard-interactive authentication engine
//!
//! Drives the server's prompt rounds, classifies each prompt, round-trips
//! questions to the browser and enforces per-kind deadlines.
//!
//! The browser response path is a single-slot rendezvous: one producer
//! (the browser message), one consumer (the engine awaiting the round).
//! The slot holds a `oneshot` sender that is *taken* on resolve, so a
//! second resolve cannot exist by construction; late or mismatched
//! responses are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{Handle, KeyboardInteractiveAuthResponse};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use crate::protocol::{EventSender, LogLevel, ServerMessage};

/// Classified prompt categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Totp,
    Password,
    WarpgateContinue,
    Generic,
}

/// Markers that identify a one-time-code prompt
const TOTP_MARKERS: &[&str] = &[
    "token",
    "otp",
    "one-time",
    "verification",
    "2fa",
    "two-factor",
];

/// Classify a single keyboard-interactive prompt string.
///
/// Applied case-insensitively to each prompt individually. The Warpgate
/// continuation banner only matches with echo on; a masked prompt that
/// merely mentions "continue" stays generic.
pub fn classify_prompt(text: &str, echo: bool) -> PromptKind {
    let t = text.to_lowercase();

    if TOTP_MARKERS.iter().any(|m| t.contains(m)) {
        return PromptKind::Totp;
    }
    if t.contains("password") || t.contains("passphrase") {
        return PromptKind::Password;
    }
    if echo && (t.contains("press enter") || t.contains("continue")) {
        return PromptKind::WarpgateContinue;
    }
    PromptKind::Generic
}

/// Browser-side deadline for a prompt of the given kind
pub fn prompt_deadline(kind: PromptKind) -> Duration {
    match kind {
        PromptKind::Totp => Duration::from_secs(60),
        PromptKind::Password => Duration::from_secs(60),
        PromptKind::WarpgateContinue => Duration::from_secs(10),
        PromptKind::Generic => Duration::from_secs(60),
    }
}

/// A browser response routed toward the outstanding prompt
#[derive(Clone)]
pub enum PromptResponse {
    Totp(String),
    Password(String),
    WarpgateContinue,
}

impl PromptResponse {
    /// Which prompt kinds this response may resolve
    fn matches(&self, kind: PromptKind) -> bool {
        match self {
            PromptResponse::Totp(_) => kind == PromptKind::Totp,
            // the taxonomy has no generic responder; password_response
            // answers generic prompts too
            PromptResponse::Password(_) => {
                matches!(kind, PromptKind::Password | PromptKind::Generic)
            }
            PromptResponse::WarpgateContinue => kind == PromptKind::WarpgateContinue,
        }
    }

    fn into_answer(self) -> String {
        match self {
            PromptResponse::Totp(code) => code,
            PromptResponse::Password(password) => password,
            PromptResponse::WarpgateContinue => String::new(),
        }
    }
}

struct PendingPrompt {
    kind: PromptKind,
    tx: oneshot::Sender<String>,
}

/// Single-slot rendezvous between the browser and the auth engine.
///
/// Also tracks whether a prompt is outstanding so teardown triggered by a
/// concurrent failure can defer until the prompt settles.
#[derive(Default)]
pub struct PromptHub {
    slot: Mutex<Option<PendingPrompt>>,
    outstanding: AtomicBool,
    settled: Notify,
}

impl PromptHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot for one prompt. Arming over a live prompt is a
    /// programming error; the stale responder is dropped.
    fn begin(&self, kind: PromptKind) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "prompt armed while another is pending");
        *slot = Some(PendingPrompt { kind, tx });
        self.outstanding.store(true, Ordering::SeqCst);
        rx
    }

    /// Deliver a browser response. Returns false when no matching prompt
    /// is outstanding (late or mismatched responses are discarded).
    pub fn resolve(&self, response: PromptResponse) -> bool {
        let pending = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(p) if response.matches(p.kind) => slot.take(),
                _ => None,
            }
        };

        match pending {
            Some(p) => {
                // receiver may have just timed out; that path already
                // settled the hub
                let _ = p.tx.send(response.into_answer());
                self.settle();
                true
            }
            None => {
                debug!("Discarding prompt response with no matching outstanding prompt");
                false
            }
        }
    }

    /// Clear the slot without answering (timeout or session close)
    fn abandon(&self) {
        self.slot.lock().take();
        self.settle();
    }

    fn settle(&self) {
        self.outstanding.store(false, Ordering::SeqCst);
        self.settled.notify_waiters();
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until no prompt is outstanding, bounded by `max_wait`.
    /// Used by teardown so a failure arriving during an open prompt does
    /// not yank the dialog out from under the user.
    pub async fn wait_settled(&self, max_wait: Duration) {
        let deadline = tokio::time::Instant::now() + max_wait;
        while self.is_outstanding() {
            let notified = self.settled.notified();
            if !self.is_outstanding() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
    }

    /// Drop any outstanding prompt (session closing)
    pub fn cancel(&self) {
        self.abandon();
    }
}

/// Keyboard-interactive driver bound to one authentication attempt
pub struct AuthEngine<'h> {
    handle: &'h mut Handle<ClientHandler>,
    username: String,
    events: EventSender,
    prompts: Arc<PromptHub>,
    /// Stored password auto-answers password prompts when routing
    /// password auth through keyboard-interactive
    stored_password: Option<String>,
    /// Notified with `true` when a browser round-trip starts and `false`
    /// when it settles; the session mirrors this as
    /// `AwaitingPrompt`/`Authenticating`
    phase: Option<Arc<dyn Fn(bool) + Send + Sync>>,
}

impl<'h> AuthEngine<'h> {
    pub fn new(
        handle: &'h mut Handle<ClientHandler>,
        username: impl Into<String>,
        events: EventSender,
        prompts: Arc<PromptHub>,
        stored_password: Option<String>,
    ) -> Self {
        Self {
            handle,
            username: username.into(),
            events,
            prompts,
            stored_password,
            phase: None,
        }
    }

    /// Observe prompt round-trips (session state mirroring)
    pub fn on_prompt_phase(mut self, phase: Arc<dyn Fn(bool) + Send + Sync>) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Run keyboard-interactive to completion.
    ///
    /// Returns `AuthMethodUnavailable` when the server rejects the method
    /// before issuing a single prompt round, `AuthFailed` after rounds
    /// were exchanged, `AuthTimeout` when the browser never answered.
    pub async fn keyboard_interactive(&mut self) -> Result<(), SshError> {
        let mut rounds: usize = 0;

        let mut response = self
            .handle
            .authenticate_keyboard_interactive_start(self.username.clone(), None::<String>)
            .await
            .map_err(|e| SshError::AuthFailed(e.to_string()))?;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => {
                    info!(username = %self.username, "Keyboard-interactive authentication successful");
                    return Ok(());
                }
                KeyboardInteractiveAuthResponse::Failure { .. } => {
                    if rounds == 0 {
                        // rejected outright, no prompt round ever happened
                        return Err(SshError::AuthMethodUnavailable);
                    }
                    return Err(SshError::AuthFailed(
                        "Server rejected keyboard-interactive responses".into(),
                    ));
                }
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    rounds += 1;
                    debug!(
                        round = rounds,
                        prompt_count = prompts.len(),
                        "Keyboard-interactive round"
                    );

                    // zero-prompt rounds are answered immediately
                    let mut answers = Vec::with_capacity(prompts.len());
                    for prompt in &prompts {
                        answers.push(self.answer_prompt(&prompt.prompt, prompt.echo).await?);
                    }

                    response = self
                        .handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(|e| SshError::AuthFailed(e.to_string()))?;
                }
            }
        }
    }

    /// Produce the answer for one prompt, round-tripping to the browser
    /// where needed
    async fn answer_prompt(&self, text: &str, echo: bool) -> Result<String, SshError> {
        let kind = classify_prompt(text, echo);

        // stored-password fast path: force_kbd_interactive sessions answer
        // password prompts without bothering the user again
        if kind == PromptKind::Password {
            if let Some(password) = &self.stored_password {
                debug!("Answering password prompt from stored credential");
                return Ok(password.clone());
            }
        }

        let (message, details) = match kind {
            PromptKind::Totp => ("TOTP required".to_string(), None),
            PromptKind::Password => (
                "Password required".to_string(),
                Some(serde_json::json!({ "prompt": text, "echo": echo })),
            ),
            PromptKind::WarpgateContinue => (
                "Waiting for gateway confirmation".to_string(),
                Some(serde_json::json!({ "prompt": text })),
            ),
            PromptKind::Generic => (
                text.to_string(),
                Some(serde_json::json!({ "prompt": text, "echo": echo })),
            ),
        };

        let event = match details {
            Some(d) => ServerMessage::log_with("auth", LogLevel::Info, message, d),
            None => ServerMessage::log("auth", LogLevel::Info, message),
        };
        let _ = self.events.send(event).await;

        let rx = self.prompts.begin(kind);
        if let Some(phase) = &self.phase {
            phase(true);
        }

        let outcome = match tokio::time::timeout(prompt_deadline(kind), rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => {
                // slot dropped: session is closing
                Err(SshError::Cancelled)
            }
            Err(_) => {
                self.prompts.abandon();
                if kind == PromptKind::WarpgateContinue {
                    // the Warpgate banner wants a bare Enter; auto-answer
                    // with the empty string after the visible delay
                    debug!("Warpgate continuation auto-answered");
                    Ok(String::new())
                } else {
                    warn!(?kind, "Prompt timed out");
                    Err(SshError::AuthTimeout)
                }
            }
        };

        if let Some(phase) = &self.phase {
            phase(false);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        use PromptKind::*;

        assert_eq!(classify_prompt("Verification code:", false), Totp);
        assert_eq!(classify_prompt("Enter OTP:", false), Totp);
        assert_eq!(classify_prompt("Two-Factor token:", false), Totp);
        assert_eq!(classify_prompt("2FA code", true), Totp);

        assert_eq!(classify_prompt("Password:", false), Password);
        assert_eq!(classify_prompt("Key passphrase:", false), Password);

        assert_eq!(
            classify_prompt("Press Enter to continue", true),
            WarpgateContinue
        );
        // masked prompts never match the continuation banner
        assert_eq!(classify_prompt("press enter to continue", false), Generic);

        assert_eq!(classify_prompt("Your shoe size:", true), Generic);
    }

    #[test]
    fn totp_wins_over_password_keywords() {
        // "one-time password" is a TOTP prompt, not a password prompt
        assert_eq!(
            classify_prompt("One-time password:", false),
            PromptKind::Totp
        );
    }

    #[test]
    fn deadlines_per_kind() {
        assert_eq!(prompt_deadline(PromptKind::Totp).as_secs(), 60);
        assert_eq!(prompt_deadline(PromptKind::WarpgateContinue).as_secs(), 10);
    }

    #[tokio::test]
    async fn hub_resolves_matching_response() {
        let hub = PromptHub::new();
        let rx = hub.begin(PromptKind::Totp);
        assert!(hub.is_outstanding());

        assert!(hub.resolve(PromptResponse::Totp("123456".into())));
        assert_eq!(rx.await.unwrap(), "123456");
        assert!(!hub.is_outstanding());
    }

    #[tokio::test]
    async fn hub_discards_mismatched_response() {
        let hub = PromptHub::new();
        let _rx = hub.begin(PromptKind::Totp);

        // a password response cannot resolve a TOTP prompt
        assert!(!hub.resolve(PromptResponse::Password("pw".into())));
        assert!(hub.is_outstanding());
    }

    #[tokio::test]
    async fn hub_discards_late_response() {
        let hub = PromptHub::new();
        let rx = hub.begin(PromptKind::Password);

        assert!(hub.resolve(PromptResponse::Password("first".into())));
        assert_eq!(rx.await.unwrap(), "first");

        // second resolve finds an empty slot
        assert!(!hub.resolve(PromptResponse::Password("second".into())));
    }

    #[tokio::test]
    async fn password_response_answers_generic_prompts() {
        let hub = PromptHub::new();
        let rx = hub.begin(PromptKind::Generic);

        assert!(hub.resolve(PromptResponse::Password("any".into())));
        assert_eq!(rx.await.unwrap(), "any");
    }

    #[tokio::test]
    async fn wait_settled_returns_after_resolve() {
        let hub = Arc::new(PromptHub::new());
        let rx = hub.begin(PromptKind::Totp);

        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.wait_settled(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        hub.resolve(PromptResponse::Totp("000000".into()));
        let _ = rx.await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should settle promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_drops_the_responder() {
        let hub = PromptHub::new();
        let rx = hub.begin(PromptKind::Generic);
        hub.cancel();
        assert!(rx.await.is_err());
        assert!(!hub.is_outstanding());
    }
}
