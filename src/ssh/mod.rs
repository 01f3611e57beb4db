//! SSH transport, authentication and host-key layer

pub mod client;
pub mod error;
pub mod handle_owner;
pub mod interactive;
pub mod keys;
pub mod known_hosts;
pub mod proxy;
pub mod socks;

pub use client::{
    authenticate_basic, authenticate_opk_cert, handshake_over_stream, ssh_client_config,
    ClientHandler, CONNECT_TIMEOUT, HOP_READY_TIMEOUT,
};
pub use error::{DialCause, HandshakeCause, SshError};
pub use handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
pub use interactive::{
    classify_prompt, prompt_deadline, AuthEngine, PromptHub, PromptKind, PromptResponse,
};
pub use known_hosts::{HostKeyDecision, HostKeyStore};
pub use proxy::{build_jump_chain, JumpChain, ResolvedHop};
