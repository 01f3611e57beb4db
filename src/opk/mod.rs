//! OpenPubKey (OPK) authentication subsystem
//!
//! Spawns the OPK CLI as an out-of-process authenticator, lexes its
//! output into an auth state machine, bridges the OAuth callback, and
//! persists the issued short-lived certificate per `(user, host)`.

pub mod config;
pub mod lexer;
pub mod manager;
pub mod token;

pub use config::{config_path, ensure_config, ConfigCheck};
pub use lexer::{classify_stderr, OpkEvent, StderrClass, StdoutLexer};
pub use manager::{FixedOpkBinary, OpkBinary, OpkManager, OpkStage};
pub use token::{
    materialize_token, token_ttl, unlink_materialized, MaterializedToken, NewOpkToken,
    OpkIdentity, OpkTokenPlain, OpkTokenStore, SharedOpkTokenStore,
};
