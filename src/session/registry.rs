//! Process-wide session registry
//!
//! The single index of live sessions, keyed by id. Enforces per-user
//! caps per session kind; cap check and insert happen atomically under a
//! create lock (no TOCTOU window). All I/O happens outside map guards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::session::{CoreDeps, SshSession};
use super::types::{CloseReason, SessionKind};
use crate::protocol::EventSender;
use crate::ssh::SshError;
use uuid::Uuid;

/// Per-session cleanup SLA during graceful shutdown
const SHUTDOWN_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bounded parallelism for shutdown closes
const SHUTDOWN_PARALLELISM: usize = 8;

pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<SshSession>>,
    /// Live count per (user, kind); guarded by `create_lock` for the
    /// check-and-insert, decremented lock-free on release
    counts: parking_lot::Mutex<HashMap<(String, SessionKind), usize>>,
    create_lock: parking_lot::Mutex<()>,
    shutting_down: AtomicBool,
    deps: Arc<CoreDeps>,
}

impl SessionRegistry {
    pub fn new(deps: Arc<CoreDeps>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            counts: parking_lot::Mutex::new(HashMap::new()),
            create_lock: parking_lot::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            deps,
        })
    }

    /// Create a session for an authenticated user. Rejects when the
    /// per-user cap for this kind is reached or the process is stopping.
    pub fn create(
        self: &Arc<Self>,
        user_id: &str,
        kind: SessionKind,
        events: EventSender,
    ) -> Result<Arc<SshSession>, SshError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SshError::Shutdown);
        }

        // cap check and insert are one atomic step
        let _guard = self.create_lock.lock();

        let cap = kind.per_user_cap();
        let key = (user_id.to_string(), kind);
        let current = {
            let counts = self.counts.lock();
            counts.get(&key).copied().unwrap_or(0)
        };
        if current >= cap {
            warn!(user_id, kind = kind.as_str(), current, cap, "Session cap reached");
            return Err(SshError::SessionCapExceeded { current, max: cap });
        }

        let id = Uuid::new_v4();
        let session = SshSession::new(
            id,
            user_id.to_string(),
            kind,
            events,
            self.deps.clone(),
            Arc::downgrade(self),
        );

        self.counts.lock().insert(key, current + 1);
        self.sessions.insert(id, session.clone());

        info!(session_id = %id, user_id, kind = kind.as_str(), "Session created");
        Ok(session)
    }

    pub fn lookup(&self, id: Uuid) -> Option<Arc<SshSession>> {
        self.sessions.get(&id).map(|e| e.clone())
    }

    /// Cancel a session. Idempotent: cancelling an unknown or already
    /// closed id succeeds quietly.
    pub async fn cancel(&self, id: Uuid) {
        if let Some(session) = self.lookup(id) {
            session.close(CloseReason::Cancelled).await;
        } else {
            debug!(session_id = %id, "Cancel for unknown session (no-op)");
        }
    }

    pub fn for_user(&self, user_id: &str) -> Vec<Arc<SshSession>> {
        self.sessions
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.clone())
            .collect()
    }

    pub fn active_count(&self, user_id: &str, kind: SessionKind) -> usize {
        self.counts
            .lock()
            .get(&(user_id.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Called by a session at the end of its teardown
    pub(crate) fn release(&self, id: Uuid, user_id: &str, kind: SessionKind) {
        if self.sessions.remove(&id).is_some() {
            let mut counts = self.counts.lock();
            let key = (user_id.to_string(), kind);
            match counts.get_mut(&key) {
                Some(n) if *n > 1 => *n -= 1,
                Some(_) => {
                    counts.remove(&key);
                }
                None => {}
            }
            debug!(session_id = %id, "Session released");
        }
    }

    /// Graceful shutdown: close every session with bounded parallelism,
    /// each close bounded by the per-session cleanup SLA.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let sessions: Vec<Arc<SshSession>> =
            self.sessions.iter().map(|e| e.clone()).collect();
        if sessions.is_empty() {
            return;
        }

        info!(count = sessions.len(), "Closing all sessions for shutdown");

        let semaphore = Arc::new(Semaphore::new(SHUTDOWN_PARALLELISM));
        let mut handles = Vec::with_capacity(sessions.len());

        for session in sessions {
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                if tokio::time::timeout(
                    SHUTDOWN_CLOSE_TIMEOUT,
                    session.close(CloseReason::Shutdown),
                )
                .await
                .is_err()
                {
                    warn!(session_id = %session.id, "Session exceeded shutdown SLA");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("Session registry drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::NoopActivityLog;
    use crate::auth::StaticVerifier;
    use crate::config::ServerConfig;
    use crate::opk::manager::FixedOpkBinary;
    use crate::opk::token::memory::MemoryOpkTokenStore;
    use crate::opk::OpkManager;
    use crate::protocol::ServerMessage;
    use crate::ssh::HostKeyStore;
    use crate::store::memory::{MemoryStore, UnlockedKeyring};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn deps(tmp: &TempDir) -> Arc<CoreDeps> {
        let config = ServerConfig::with_data_dir(tmp.path().to_path_buf());
        let tokens = Arc::new(MemoryOpkTokenStore::new());
        let opk = Arc::new(OpkManager::new(
            Arc::new(FixedOpkBinary("/usr/bin/false".into())),
            tokens.clone(),
            config.opk_dir(),
            config.public_origin.clone(),
        ));
        Arc::new(CoreDeps {
            hostkeys: Arc::new(HostKeyStore::new(config.hostkeys_dir())),
            config,
            verifier: Arc::new(StaticVerifier),
            credentials: Arc::new(MemoryStore::new()),
            keyring: Arc::new(UnlockedKeyring),
            tokens,
            opk,
            activity: Arc::new(NoopActivityLog),
        })
    }

    fn events() -> (EventSender, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(64)
    }

    #[tokio::test]
    async fn terminal_cap_is_enforced_per_user() {
        let tmp = TempDir::new().unwrap();
        let registry = SessionRegistry::new(deps(&tmp));

        let mut keep = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = events();
            keep.push(rx);
            registry.create("alice", SessionKind::Terminal, tx).unwrap();
        }

        let (tx, _rx) = events();
        match registry.create("alice", SessionKind::Terminal, tx) {
            Err(SshError::SessionCapExceeded { current, max }) => {
                assert_eq!((current, max), (3, 3));
            }
            other => panic!("expected cap rejection, got {:?}", other.map(|_| ())),
        }

        // a different user is unaffected
        let (tx, _rx2) = events();
        registry.create("bob", SessionKind::Terminal, tx).unwrap();

        // other kinds are unaffected for the capped user
        let (tx, _rx3) = events();
        registry.create("alice", SessionKind::Files, tx).unwrap();
    }

    #[tokio::test]
    async fn closing_a_session_frees_its_slot() {
        let tmp = TempDir::new().unwrap();
        let registry = SessionRegistry::new(deps(&tmp));

        let mut receivers = Vec::new();
        let mut last = None;
        for _ in 0..3 {
            let (tx, rx) = events();
            receivers.push(rx);
            last = Some(registry.create("alice", SessionKind::Terminal, tx).unwrap());
        }
        assert_eq!(registry.active_count("alice", SessionKind::Terminal), 3);

        last.unwrap().close(CloseReason::ClientRequest).await;
        assert_eq!(registry.active_count("alice", SessionKind::Terminal), 2);
        assert_eq!(registry.len(), 2);

        let (tx, _rx) = events();
        registry.create("alice", SessionKind::Terminal, tx).unwrap();
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_coalesces() {
        let tmp = TempDir::new().unwrap();
        let registry = SessionRegistry::new(deps(&tmp));

        let (tx, mut rx) = events();
        let session = registry.create("alice", SessionKind::Terminal, tx).unwrap();
        let id = session.id;

        // two concurrent cancels plus one late one
        let (r1, r2) = tokio::join!(registry.cancel(id), registry.cancel(id));
        let _ = (r1, r2);
        registry.cancel(id).await;

        // exactly one observable shutdown sequence
        let mut disconnected = 0;
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            if matches!(msg, ServerMessage::Disconnected) {
                disconnected += 1;
            }
        }
        assert_eq!(disconnected, 1);
        assert!(registry.lookup(id).is_none());
        assert_eq!(registry.active_count("alice", SessionKind::Terminal), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_everything() {
        let tmp = TempDir::new().unwrap();
        let registry = SessionRegistry::new(deps(&tmp));

        let mut receivers = Vec::new();
        for user in ["alice", "bob"] {
            for kind in [SessionKind::Terminal, SessionKind::Files] {
                let (tx, rx) = events();
                receivers.push(rx);
                registry.create(user, kind, tx).unwrap();
            }
        }
        assert_eq!(registry.len(), 4);

        registry.shutdown().await;
        assert!(registry.is_empty());

        // creates are refused while shutting down
        let (tx, _rx) = events();
        assert!(matches!(
            registry.create("carol", SessionKind::Terminal, tx),
            Err(SshError::Shutdown)
        ));
    }
}
