//! Channel bridges: SSH channel <-> WebSocket event stream

pub mod exec;
pub mod sftp;
pub mod terminal;
pub mod tunnel;

pub use exec::{open_docker_pipe, spawn_stats_probe, DockerBridge, STATS_INTERVAL};
pub use sftp::{FilesBridge, TRANSFER_CHUNK};
pub use terminal::{open_shell, TerminalBridge, Utf8StreamDecoder, SHELL_TIMEOUT};
pub use tunnel::TunnelManager;
