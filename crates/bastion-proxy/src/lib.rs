//! # bastion-proxy
//!
//! TCP front proxy that puts the [`bastion_admission`] pipeline in front of
//! a game server.
//!
//! - [`ProxyConfig`] - Listener, backend and pipeline settings from one TOML file
//! - [`ShieldProxy`] - Accept loop, per-connection admission, and forwarding

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod server;

pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use server::{SessionStats, ShieldProxy};
