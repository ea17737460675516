//! Multi-client TCP chat relay.
//!
//! Clients connect over TCP and send newline-delimited text; every message
//! is rebroadcast to all connected clients as `[<address>]<name>:<body>`.
//! Each module owns one piece of the pipeline:
//!
//! - [`relay`] binds the listener, accepts connections and spawns one
//!   session task per client.
//! - [`connection`] drives a session through join, read loop and teardown,
//!   and runs the forwarder that is the only writer to the socket.
//! - [`session`] holds per-client identity and the delivery queue.
//! - [`registry`] maps display names to live sessions behind one lock.
//! - [`broadcast`] serializes every published line through a single
//!   dispatch loop so all clients observe the same order.
//! - [`envelope`] formats outbound lines.
//! - [`config`], [`error`] and [`cli`] cover configuration, error types
//!   and the command-line surface; [`client`] is a small terminal client.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod registry;
pub mod relay;
pub mod session;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use relay::{Relay, serve_until, start};
