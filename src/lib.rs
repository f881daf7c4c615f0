//! Trackgate - an authenticating gateway in front of an MLflow tracking server
//!
//! This library provides:
//! - Single-user HTTP Basic authentication enforced on every path
//! - Streaming reverse proxying to a backend bound to loopback only
//! - Launching the tracking server as a child process
//! - Best-effort readiness probing that never blocks startup
//! - A startup sequence that leaves the gateway as the serving process

pub mod body;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod launcher;
pub mod prober;
pub mod sequencer;
pub mod upstream;
