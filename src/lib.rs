//! OxideTerm Server - session core for the browser-facing SSH workstation
//!
//! Accepts authenticated browser WebSocket connections and brokers
//! interactive SSH shells, SFTP, port-forwarding tunnels, metrics probes
//! and Docker control sessions against user-owned remote hosts.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (WebSocket frames, channel buffers)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod activity;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod opk;
pub mod protocol;
pub mod session;
pub mod ssh;
pub mod store;
pub mod web;
