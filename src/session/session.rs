//! The per-tab session state machine
//!
//! Owns the WebSocket event stream, the SSH client (through its Handle
//! Owner Task), the jump chain, the channel bridges, the prompt
//! rendezvous and the cleanup contract. Errors inside the session are
//! captured here and rendered as typed events; nothing escapes to crash
//! the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::registry::SessionRegistry;
use super::types::{validate_endpoint, CloseReason, SessionKind, SessionState, StateCell};
use crate::activity::{ActivityEvent, SharedActivityLog};
use crate::auth::SharedVerifier;
use crate::bridge::{
    open_docker_pipe, open_shell, spawn_stats_probe, DockerBridge, FilesBridge, TerminalBridge,
    TunnelManager,
};
use crate::config::ServerConfig;
use crate::opk::{
    materialize_token, unlink_materialized, MaterializedToken, OpkManager, SharedOpkTokenStore,
};
use crate::protocol::{
    ClientMessage, ConnectRequest, EventSender, LogLevel, ServerMessage,
};
use crate::ssh::{
    authenticate_basic, authenticate_opk_cert, build_jump_chain, handshake_over_stream,
    socks::{dial_direct, dial_through_chain},
    spawn_handle_owner_task, AuthEngine, ClientHandler, HandleController, HostKeyStore, JumpChain,
    PingResult, PromptHub, PromptResponse, ResolvedHop, SshError, CONNECT_TIMEOUT,
};
use crate::store::{
    AuthType, Credential, HostId, HostSpec, SharedCredentialStore, SharedKeyring, StoreError,
};

/// Shell-init race: deferral quantum and bound when a close request lands
/// while the shell is still being established
const SHELL_INIT_DEFER: Duration = Duration::from_millis(100);
const SHELL_INIT_DEFER_ROUNDS: usize = 50;

/// How long an error-path teardown waits for an outstanding prompt
const PROMPT_SETTLE_WAIT: Duration = Duration::from_secs(60);

/// Everything a session needs from the outside, injected at construction
pub struct CoreDeps {
    pub config: ServerConfig,
    pub verifier: SharedVerifier,
    pub credentials: SharedCredentialStore,
    pub keyring: SharedKeyring,
    pub hostkeys: Arc<HostKeyStore>,
    pub tokens: SharedOpkTokenStore,
    pub opk: Arc<OpkManager>,
    pub activity: SharedActivityLog,
}

/// Mutable session internals, touched from the message handler, the
/// connect task and teardown
#[derive(Default)]
struct SessionInner {
    host: Option<HostSpec>,
    last_request: Option<ConnectRequest>,
    controller: Option<HandleController>,
    jump_chain: Option<JumpChain>,
    terminal: Option<TerminalBridge>,
    files: Option<Arc<FilesBridge>>,
    tunnels: Option<Arc<TunnelManager>>,
    docker: Option<DockerBridge>,
    opk_request: Option<String>,
    opk_files: Option<MaterializedToken>,
    /// Background tasks safe to abort on teardown. Tasks that call
    /// `close()` themselves (watchers, the connect task) are NOT stored
    /// here: aborting them from inside `close()` would cut teardown short.
    /// They exit on their own once the transport is gone.
    tasks: Vec<JoinHandle<()>>,
}

/// One browser tab's SSH session
pub struct SshSession {
    pub id: Uuid,
    pub user_id: String,
    pub kind: SessionKind,
    deps: Arc<CoreDeps>,
    registry: Weak<SessionRegistry>,
    events: EventSender,
    state: StateCell,
    prompts: Arc<PromptHub>,
    shell_initializing: AtomicBool,
    cleanup_started: AtomicBool,
    /// At most one SSH transport per session; reconnects make a new session
    connect_busy: AtomicBool,
    inner: tokio::sync::Mutex<SessionInner>,
}

impl SshSession {
    pub fn new(
        id: Uuid,
        user_id: String,
        kind: SessionKind,
        events: EventSender,
        deps: Arc<CoreDeps>,
        registry: Weak<SessionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            user_id,
            kind,
            deps,
            registry,
            events,
            state: StateCell::new(),
            prompts: Arc::new(PromptHub::new()),
            shell_initializing: AtomicBool::new(false),
            cleanup_started: AtomicBool::new(false),
            connect_busy: AtomicBool::new(false),
            inner: tokio::sync::Mutex::new(SessionInner::default()),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Dispatch one validated browser message
    pub async fn handle_message(self: &Arc<Self>, msg: ClientMessage) {
        if self.cleanup_started.load(Ordering::SeqCst) {
            return;
        }

        match msg {
            ClientMessage::ConnectToHost(req) => {
                self.start_connect(req, None).await;
            }

            ClientMessage::Input { data } => match self.kind {
                SessionKind::Terminal => {
                    let inner = self.inner.lock().await;
                    if let Some(terminal) = &inner.terminal {
                        // UTF-8 bytes straight through; tabs and escape
                        // sequences included
                        let _ = terminal.input(data.into_bytes()).await;
                    }
                }
                SessionKind::Docker => {
                    let decoded = match BASE64.decode(data.as_bytes()) {
                        Ok(b) => b,
                        Err(_) => {
                            self.send_error(SshError::InvalidInput(
                                "Docker input must be base64".into(),
                            ))
                            .await;
                            return;
                        }
                    };
                    let inner = self.inner.lock().await;
                    if let Some(docker) = &inner.docker {
                        let _ = docker.input(decoded).await;
                    }
                }
                _ => {}
            },

            ClientMessage::Resize { cols, rows } => {
                let inner = self.inner.lock().await;
                if let Some(terminal) = &inner.terminal {
                    if terminal.resize(cols, rows).await.is_ok() {
                        let _ = self.events.send(ServerMessage::Resized { cols, rows }).await;
                    }
                }
            }

            ClientMessage::Disconnect => {
                self.close(CloseReason::ClientRequest).await;
            }

            ClientMessage::Ping => {
                let _ = self.events.send(ServerMessage::Pong).await;
            }

            ClientMessage::TotpResponse { data } => {
                self.prompts.resolve(PromptResponse::Totp(data.code));
            }

            ClientMessage::PasswordResponse { data } => {
                self.prompts.resolve(PromptResponse::Password(data.password));
            }

            ClientMessage::WarpgateAuthContinue => {
                self.prompts.resolve(PromptResponse::WarpgateContinue);
            }

            ClientMessage::ReconnectWithCredentials(creds) => {
                let request = self.inner.lock().await.last_request.clone();
                match request {
                    Some(req) => {
                        let credential = Credential {
                            password: creds.password,
                            private_key: creds.private_key,
                            key_passphrase: creds.key_passphrase,
                        };
                        self.start_connect(req, Some(credential)).await;
                    }
                    None => {
                        self.send_error(SshError::InvalidInput(
                            "No prior connect attempt to retry".into(),
                        ))
                        .await;
                    }
                }
            }

            ClientMessage::OpksshStartAuth { host_id } => {
                let request_id = self
                    .deps
                    .opk
                    .start_auth(&self.user_id, host_id, self.events.clone())
                    .await;
                if let Some(id) = request_id {
                    self.inner.lock().await.opk_request = Some(id);
                }
            }

            ClientMessage::OpksshCancel { request_id } => {
                self.deps.opk.cancel(&request_id);
            }

            ClientMessage::OpksshBrowserOpened { request_id } => {
                self.deps.opk.browser_opened(&request_id);
            }

            ClientMessage::OpksshAuthCompleted { request_id } => {
                debug!(%request_id, "Browser reports OPK auth completed");
            }

            // ---- file manager ----
            ClientMessage::FileList { path } => {
                if let Some(files) = self.files_bridge().await {
                    self.report_file_result(files.list(&path).await).await;
                }
            }
            ClientMessage::FileStat { path } => {
                if let Some(files) = self.files_bridge().await {
                    self.report_file_result(files.stat(&path).await).await;
                }
            }
            ClientMessage::FileRead { path } => {
                if let Some(files) = self.files_bridge().await {
                    self.report_file_result(files.read_file(&path).await).await;
                }
            }
            ClientMessage::FileWrite { path, data, append } => {
                if let Some(files) = self.files_bridge().await {
                    self.report_file_result(files.write_file(&path, &data, append).await)
                        .await;
                }
            }
            ClientMessage::FileMkdir { path } => {
                if let Some(files) = self.files_bridge().await {
                    self.report_file_result(files.mkdir(&path).await).await;
                }
            }
            ClientMessage::FileMove { from, to } => {
                if let Some(files) = self.files_bridge().await {
                    self.report_file_result(files.rename(&from, &to).await).await;
                }
            }
            ClientMessage::FileRemove { path } => {
                if let Some(files) = self.files_bridge().await {
                    self.report_file_result(files.remove(&path).await).await;
                }
            }
            ClientMessage::FileChmod { path, mode } => {
                if let Some(files) = self.files_bridge().await {
                    self.report_file_result(files.chmod(&path, mode).await).await;
                }
            }
            ClientMessage::FileChown { path, uid, gid } => {
                if let Some(files) = self.files_bridge().await {
                    self.report_file_result(files.chown(&path, uid, gid).await)
                        .await;
                }
            }

            // ---- tunnels ----
            ClientMessage::TunnelOpen {
                local_port,
                remote_host,
                remote_port,
            } => {
                let tunnels = self.inner.lock().await.tunnels.clone();
                match tunnels {
                    Some(tunnels) => {
                        if let Err(e) = tunnels.open(local_port, remote_host, remote_port).await {
                            self.send_error(e).await;
                        }
                    }
                    None => {
                        self.send_error(SshError::InvalidInput(
                            "Session is not connected".into(),
                        ))
                        .await
                    }
                }
            }
            ClientMessage::TunnelClose { local_port } => {
                let tunnels = self.inner.lock().await.tunnels.clone();
                if let Some(tunnels) = tunnels {
                    tunnels.close(local_port).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // connect pipeline
    // ------------------------------------------------------------------

    async fn start_connect(
        self: &Arc<Self>,
        req: ConnectRequest,
        override_credential: Option<Credential>,
    ) {
        if self.connect_busy.swap(true, Ordering::SeqCst) {
            self.send_error(SshError::InvalidInput(
                "Session already has a connection; open a new tab to reconnect".into(),
            ))
            .await;
            return;
        }

        // not stored in `tasks`: this task may call close() and must not
        // be aborted by it
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.connect_pipeline(&req, override_credential).await {
                session.handle_connect_error(e).await;
            }
            session.inner.lock().await.last_request = Some(req);
        });
    }

    async fn connect_pipeline(
        self: &Arc<Self>,
        req: &ConnectRequest,
        override_credential: Option<Credential>,
    ) -> Result<(), SshError> {
        let deps = &self.deps;

        // --- resolve host spec (stored row ∪ inline overrides) ---
        let mut spec = match req.host_id {
            Some(host_id) => deps
                .credentials
                .fetch_host(host_id, &self.user_id)
                .await
                .map_err(|e| match e {
                    StoreError::NotFound => {
                        SshError::InvalidInput(format!("Unknown host {}", host_id))
                    }
                    StoreError::Locked => SshError::DataLocked,
                    StoreError::Backend(m) => SshError::Protocol(m),
                })?,
            None => {
                let host = req.host.clone().unwrap_or_default();
                let port = req.port.unwrap_or(22);
                HostSpec {
                    host_id: synthetic_host_id(&host, port),
                    host,
                    port: 22, // validated below
                    username: req.username.clone().unwrap_or_default(),
                    auth_type: req.auth_type.unwrap_or_default(),
                    force_kbd_interactive: false,
                    credential_id: None,
                    jump_hops: Vec::new(),
                    proxy_chain: None,
                    name: None,
                }
            }
        };
        if let Some(host) = &req.host {
            spec.host = host.clone();
        }
        if let Some(username) = &req.username {
            spec.username = username.clone();
        }
        if let Some(auth_type) = req.auth_type {
            spec.auth_type = auth_type;
        }

        let requested_port = req.port.unwrap_or(spec.port as u32);
        spec.port = validate_endpoint(&spec.host, requested_port, &spec.username)?;

        // --- resolve credential ---
        let credential = match override_credential {
            Some(c) => c,
            None if req.password.is_some() || req.private_key.is_some() => Credential {
                password: req.password.clone(),
                private_key: req.private_key.clone(),
                key_passphrase: req.key_passphrase.clone(),
            },
            None => match spec.credential_id {
                Some(id) => deps
                    .credentials
                    .fetch_credential(id, &self.user_id)
                    .await
                    .map_err(|e| match e {
                        StoreError::Locked => SshError::DataLocked,
                        StoreError::NotFound => {
                            SshError::InvalidInput("Credential not found".into())
                        }
                        StoreError::Backend(m) => SshError::Protocol(m),
                    })?,
                None => Credential::default(),
            },
        };

        // --- resolve jump hops up front; fail fast on any missing row ---
        let mut hops = Vec::with_capacity(spec.jump_hops.len());
        for (i, hop_id) in spec.jump_hops.iter().enumerate() {
            let hop = self.resolve_hop(*hop_id).await.map_err(|e| {
                SshError::DialFailed {
                    cause: crate::ssh::DialCause::JumpHop(i),
                    detail: e.to_string(),
                }
            })?;
            hops.push(hop);
        }

        self.inner.lock().await.host = Some(spec.clone());

        info!(
            session_id = %self.id,
            user_id = %self.user_id,
            host = %spec.host,
            port = spec.port,
            kind = self.kind.as_str(),
            "Connecting"
        );

        // --- dial and handshake, bounded by the connect deadline ---
        let handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            self.establish_transport(&spec, &hops, req.trust_host_key),
        )
        .await
        .map_err(|_| SshError::DialFailed {
            cause: crate::ssh::DialCause::Timeout,
            detail: "Connect deadline exceeded".into(),
        })??;

        if self.cleanup_started.load(Ordering::SeqCst) {
            self.discard_transport().await;
            return Err(SshError::Cancelled);
        }

        self.state.transition(SessionState::Authenticating);

        // --- authenticate ---
        let mut handle = handle;
        match self
            .authenticate(&mut handle, &spec, &credential)
            .await?
        {
            AuthOutcome::Done => {}
            AuthOutcome::OpkTokenMissing => {
                // browser must run opkssh_start_auth first; this attempt
                // ends here but the session stays usable
                let _ = self
                    .events
                    .send(ServerMessage::OpksshAuthRequired {
                        host_id: spec.host_id,
                    })
                    .await;
                self.discard_transport().await;
                self.connect_busy.store(false, Ordering::SeqCst);
                return Ok(());
            }
        }

        let _ = self
            .events
            .send(ServerMessage::log(
                "auth",
                LogLevel::Success,
                "Authentication successful",
            ))
            .await;

        // --- transport established: hand the Handle to its owner task ---
        let controller = spawn_handle_owner_task(handle, self.id);
        {
            let mut inner = self.inner.lock().await;
            inner.controller = Some(controller.clone());
        }

        // transport death closes the session exactly once; the watcher
        // ends by itself after close() drops the controller
        {
            let session = self.clone();
            let mut disconnect_rx = controller.subscribe_disconnect();
            tokio::spawn(async move {
                let _ = disconnect_rx.recv().await;
                session.close(CloseReason::RemoteClosed).await;
            });
        }

        // --- open the kind-specific channel before reporting Connected ---
        self.open_channels(&controller, req).await?;

        self.state.transition(SessionState::Connected);
        let _ = self.events.send(ServerMessage::Connected).await;

        // fire-and-forget; never fails the session
        deps.activity.log(ActivityEvent {
            kind: self.kind.activity_kind(),
            user_id: self.user_id.clone(),
            host_id: spec.host_id,
            host_name: spec.name.clone().unwrap_or_else(|| spec.host.clone()),
        });

        // teardown may have raced the tail of the pipeline; anything we
        // stored after its drain is ours to release
        if self.cleanup_started.load(Ordering::SeqCst) {
            self.discard_transport().await;
            return Err(SshError::Cancelled);
        }

        info!(session_id = %self.id, "Session connected");
        Ok(())
    }

    /// Drop the transport of a finished or abandoned connect attempt
    async fn discard_transport(&self) {
        let (controller, chain) = {
            let mut inner = self.inner.lock().await;
            (inner.controller.take(), inner.jump_chain.take())
        };
        if let Some(controller) = controller {
            controller.disconnect().await;
        }
        if let Some(chain) = chain {
            chain.dispose().await;
        }
    }

    /// Dial (direct, SOCKS5 chain, or jump chain) and run the target
    /// handshake. Emits the `tcp` and `handshake` log stages.
    async fn establish_transport(
        self: &Arc<Self>,
        spec: &HostSpec,
        hops: &[ResolvedHop],
        trust_host_key: Option<bool>,
    ) -> Result<russh::client::Handle<ClientHandler>, SshError> {
        let deps = &self.deps;
        let handler = ClientHandler::new(
            self.user_id.clone(),
            spec.host_id,
            deps.hostkeys.clone(),
            trust_host_key,
        );

        if hops.is_empty() {
            let stream = match &spec.proxy_chain {
                Some(chain) if !chain.is_empty() => {
                    dial_through_chain(chain, &spec.host, spec.port, CONNECT_TIMEOUT).await?
                }
                _ => dial_direct(&spec.host, spec.port, CONNECT_TIMEOUT).await?,
            };

            let _ = self
                .events
                .send(ServerMessage::log(
                    "tcp",
                    LogLevel::Info,
                    format!("Connected to {}:{}", spec.host, spec.port),
                ))
                .await;

            let handle = handshake_over_stream(stream, handler, CONNECT_TIMEOUT).await?;
            let _ = self
                .events
                .send(ServerMessage::log(
                    "handshake",
                    LogLevel::Success,
                    "SSH handshake completed",
                ))
                .await;
            Ok(handle)
        } else {
            let (chain, stream) = build_jump_chain(
                &self.user_id,
                hops,
                &spec.host,
                spec.port,
                spec.proxy_chain.as_ref(),
                deps.hostkeys.clone(),
                Some(&self.events),
            )
            .await?;

            // stored before the target handshake so a mid-auth failure
            // still disposes the hops in reverse order
            self.inner.lock().await.jump_chain = Some(chain);

            let _ = self
                .events
                .send(ServerMessage::log(
                    "tcp",
                    LogLevel::Info,
                    format!("Tunnel to {}:{} ready", spec.host, spec.port),
                ))
                .await;

            let handle =
                handshake_over_stream(stream, handler, crate::ssh::HOP_READY_TIMEOUT).await?;
            let _ = self
                .events
                .send(ServerMessage::log(
                    "handshake",
                    LogLevel::Success,
                    "SSH handshake completed",
                ))
                .await;
            Ok(handle)
        }
    }

    async fn resolve_hop(&self, hop_id: HostId) -> Result<ResolvedHop, SshError> {
        let spec = self
            .deps
            .credentials
            .fetch_host(hop_id, &self.user_id)
            .await
            .map_err(|e| SshError::InvalidInput(format!("Jump host {}: {}", hop_id, e)))?;

        let credential = match spec.credential_id {
            Some(id) => self
                .deps
                .credentials
                .fetch_credential(id, &self.user_id)
                .await
                .map_err(|e| {
                    SshError::InvalidInput(format!("Jump host {} credential: {}", hop_id, e))
                })?,
            None => {
                return Err(SshError::InvalidInput(format!(
                    "Jump host {} has no credential",
                    hop_id
                )))
            }
        };

        Ok(ResolvedHop { spec, credential })
    }

    async fn authenticate(
        self: &Arc<Self>,
        handle: &mut russh::client::Handle<ClientHandler>,
        spec: &HostSpec,
        credential: &Credential,
    ) -> Result<AuthOutcome, SshError> {
        match spec.auth_type {
            AuthType::Password if !spec.force_kbd_interactive && credential.password.is_some() => {
                // servers that only advertise keyboard-interactive reject
                // the password method outright; fall back with the stored
                // password answering password-class prompts
                match authenticate_basic(handle, &spec.username, AuthType::Password, credential)
                    .await
                {
                    Ok(()) => Ok(AuthOutcome::Done),
                    Err(SshError::AuthFailed(_)) => {
                        debug!(session_id = %self.id, "Password auth rejected, trying keyboard-interactive");
                        self.keyboard_interactive(handle, spec, credential.password.clone())
                            .await?;
                        Ok(AuthOutcome::Done)
                    }
                    Err(e) => Err(e),
                }
            }

            AuthType::Key => {
                authenticate_basic(handle, &spec.username, AuthType::Key, credential).await?;
                Ok(AuthOutcome::Done)
            }

            AuthType::OpkSsh => {
                let token = self
                    .deps
                    .tokens
                    .fetch_valid(&self.user_id, spec.host_id)
                    .await
                    .map_err(|e| SshError::Protocol(e.to_string()))?;

                let Some(token) = token else {
                    return Ok(AuthOutcome::OpkTokenMissing);
                };

                let files = materialize_token(&self.user_id, spec.host_id, &token)
                    .map_err(|e| SshError::KeyError(format!("Cannot stage OPK key: {}", e)))?;
                self.inner.lock().await.opk_files = Some(files.clone());

                authenticate_opk_cert(handle, &spec.username, &files.key_path, &files.cert_path)
                    .await?;
                Ok(AuthOutcome::Done)
            }

            // AuthType::None, forced keyboard-interactive, or password
            // auth without a stored password
            _ => {
                let stored_password = if spec.auth_type == AuthType::Password {
                    credential.password.clone()
                } else {
                    None
                };
                self.keyboard_interactive(handle, spec, stored_password)
                    .await?;
                Ok(AuthOutcome::Done)
            }
        }
    }

    async fn keyboard_interactive(
        self: &Arc<Self>,
        handle: &mut russh::client::Handle<ClientHandler>,
        spec: &HostSpec,
        stored_password: Option<String>,
    ) -> Result<(), SshError> {
        let state_mirror: Arc<dyn Fn(bool) + Send + Sync> = {
            let session = self.clone();
            Arc::new(move |awaiting| {
                if awaiting {
                    session.state.transition(SessionState::AwaitingPrompt);
                } else {
                    session.state.transition(SessionState::Authenticating);
                }
            })
        };

        AuthEngine::new(
            handle,
            spec.username.clone(),
            self.events.clone(),
            self.prompts.clone(),
            stored_password,
        )
        .on_prompt_phase(state_mirror)
        .keyboard_interactive()
        .await
    }

    async fn open_channels(
        self: &Arc<Self>,
        controller: &HandleController,
        req: &ConnectRequest,
    ) -> Result<(), SshError> {
        match self.kind {
            SessionKind::Terminal => {
                let cols = req.cols.unwrap_or(80);
                let rows = req.rows.unwrap_or(24);

                self.shell_initializing.store(true, Ordering::SeqCst);
                let shell = open_shell(controller, cols, rows, self.events.clone()).await;
                self.shell_initializing.store(false, Ordering::SeqCst);

                let (terminal, pump) = shell?;

                self.inner.lock().await.terminal = Some(terminal);
                let session = self.clone();
                tokio::spawn(async move {
                    let _ = pump.await;
                    session.close(CloseReason::RemoteClosed).await;
                });
            }

            SessionKind::Files => {
                let files = FilesBridge::open(controller, self.events.clone()).await?;
                self.inner.lock().await.files = Some(Arc::new(files));
                self.spawn_liveness_probe(controller.clone());
            }

            SessionKind::Tunnel => {
                let tunnels = Arc::new(TunnelManager::new(
                    controller.clone(),
                    self.events.clone(),
                ));
                self.inner.lock().await.tunnels = Some(tunnels);
                self.spawn_liveness_probe(controller.clone());
            }

            SessionKind::Stats => {
                let probe = spawn_stats_probe(controller.clone(), self.events.clone());
                self.inner.lock().await.tasks.push(probe);
            }

            SessionKind::Docker => {
                let (docker, pump) = open_docker_pipe(controller, self.events.clone()).await?;
                self.inner.lock().await.docker = Some(docker);
                let session = self.clone();
                tokio::spawn(async move {
                    let _ = pump.await;
                    session.close(CloseReason::RemoteClosed).await;
                });
            }
        }
        Ok(())
    }

    /// Tunnel and files sessions carry no continuous channel traffic, so
    /// transport death would otherwise go unnoticed until the next user
    /// action. Probe with `keepalive@openssh.com` and close on hard loss.
    /// Self-terminating, so deliberately not in the abortable task set.
    fn spawn_liveness_probe(self: &Arc<Self>, controller: HandleController) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            ticker.tick().await; // first tick is immediate; skip it
            loop {
                ticker.tick().await;
                if !controller.is_connected() {
                    break;
                }
                if matches!(controller.ping().await, PingResult::IoError) {
                    break;
                }
            }
            session.close(CloseReason::RemoteClosed).await;
        });
    }

    async fn handle_connect_error(self: &Arc<Self>, e: SshError) {
        if self.cleanup_started.load(Ordering::SeqCst) {
            return;
        }

        let host_id = self.inner.lock().await.host.as_ref().map(|h| h.host_id);
        error!(
            session_id = %self.id,
            user_id = %self.user_id,
            host_id = ?host_id,
            kind = e.code(),
            operation = "connect",
            "Connect failed: {}",
            e
        );

        match e {
            SshError::InvalidInput(_) => {
                // immediate rejection, no state transitions, retryable
                self.send_error(e).await;
                self.discard_transport().await;
                self.connect_busy.store(false, Ordering::SeqCst);
            }

            SshError::AuthMethodUnavailable => {
                // the session parks for a reconnect_with_credentials
                // follow-up; the failed attempt's transport goes away
                let _ = self.events.send(ServerMessage::AuthMethodNotAvailable).await;
                self.discard_transport().await;
                self.state.transition(SessionState::AwaitingPrompt);
                self.connect_busy.store(false, Ordering::SeqCst);
            }

            SshError::HostKeyUnverified { ref fingerprint } => {
                let _ = self
                    .events
                    .send(ServerMessage::HostKeyPrompt {
                        fingerprint: fingerprint.clone(),
                    })
                    .await;
                self.close(CloseReason::Error).await;
            }

            SshError::HostKeyMismatch {
                ref expected,
                ref actual,
            } => {
                let _ = self
                    .events
                    .send(ServerMessage::HostKeyMismatch {
                        expected: expected.clone(),
                        actual: actual.clone(),
                    })
                    .await;
                self.close(CloseReason::Error).await;
            }

            SshError::Cancelled | SshError::Shutdown => {}

            _ => {
                let stage = match &e {
                    SshError::DialFailed { .. } => "tcp",
                    SshError::HandshakeFailed { .. } => "handshake",
                    SshError::AuthFailed(_) | SshError::AuthTimeout => "auth",
                    SshError::ShellOpenFailed(_) | SshError::ShellOpenTimeout => "shell",
                    _ => "connect",
                };
                let _ = self
                    .events
                    .send(ServerMessage::log(stage, LogLevel::Error, e.user_message()))
                    .await;
                self.send_error(e).await;
                self.close(CloseReason::Error).await;
            }
        }
    }

    async fn send_error(&self, e: SshError) {
        let _ = self
            .events
            .send(ServerMessage::Error {
                message: e.user_message(),
                code: Some(e.code().to_string()),
            })
            .await;
    }

    /// The SFTP bridge, or an error event to the browser when the files
    /// session is not connected yet
    async fn files_bridge(self: &Arc<Self>) -> Option<Arc<FilesBridge>> {
        let files = self.inner.lock().await.files.clone();
        if files.is_none() {
            self.send_error(SshError::InvalidInput(
                "File manager is not connected".into(),
            ))
            .await;
        }
        files
    }

    async fn report_file_result(self: &Arc<Self>, result: Result<(), SshError>) {
        if let Err(e) = result {
            self.send_error(e).await;
        }
    }

    // ------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------

    /// Idempotent teardown. Concurrent triggers coalesce into one
    /// observable shutdown sequence; `disconnected` is the last frame.
    pub async fn close(self: &Arc<Self>, reason: CloseReason) {
        // shell-init race: a close racing shell establishment defers in
        // 100 ms steps until the shell request resolves
        let mut rounds = 0;
        while self.shell_initializing.load(Ordering::SeqCst)
            && rounds < SHELL_INIT_DEFER_ROUNDS
        {
            tokio::time::sleep(SHELL_INIT_DEFER).await;
            rounds += 1;
        }

        if self.cleanup_started.swap(true, Ordering::SeqCst) {
            return;
        }

        // a failure arriving while a prompt dialog is open defers cleanup
        // until the prompt resolves or times out
        if matches!(reason, CloseReason::Error | CloseReason::RemoteClosed) {
            self.prompts.wait_settled(PROMPT_SETTLE_WAIT).await;
        }

        info!(session_id = %self.id, ?reason, "Closing session");
        self.state.transition(SessionState::Closing);
        self.prompts.cancel();

        let mut inner = self.inner.lock().await;

        for task in inner.tasks.drain(..) {
            task.abort();
        }

        if let Some(terminal) = inner.terminal.take() {
            terminal.close();
        }
        if let Some(tunnels) = inner.tunnels.take() {
            tunnels.close_all().await;
        }
        inner.docker.take();
        inner.files.take();

        if let Some(request_id) = inner.opk_request.take() {
            self.deps.opk.cancel(&request_id);
        }
        if let Some(files) = inner.opk_files.take() {
            unlink_materialized(&files);
        }

        if let Some(controller) = inner.controller.take() {
            controller.disconnect().await;
        }
        if let Some(chain) = inner.jump_chain.take() {
            chain.dispose().await;
        }

        drop(inner);

        // last frame unless the socket died first
        let _ = self.events.send(ServerMessage::Disconnected).await;

        self.state.transition(SessionState::Closed);

        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.id, &self.user_id, self.kind);
        }

        info!(session_id = %self.id, "Session closed");
    }
}

enum AuthOutcome {
    Done,
    OpkTokenMissing,
}

/// Inline connects carry no stored host row; derive a stable negative id
/// from the endpoint so host-key records still pin per target.
fn synthetic_host_id(host: &str, port: u32) -> HostId {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(b":");
    hasher.update(port.to_be_bytes());
    let digest = hasher.finalize();
    let raw = u64::from_be_bytes(digest[..8].try_into().expect("8 bytes"));
    // (raw >> 1) fits i64; negative range never collides with stored ids
    -((raw >> 1) as i64) - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_ids_are_negative_and_stable() {
        let a = synthetic_host_id("10.0.0.1", 22);
        let b = synthetic_host_id("10.0.0.1", 22);
        let c = synthetic_host_id("10.0.0.1", 2222);
        assert!(a < 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
