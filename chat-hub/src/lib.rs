//! Line-oriented TCP chat hub.
//!
//! Clients connect with any line-based tool (`nc`, `telnet`, or the bundled
//! `client` subcommand), pick a nickname with `/nick`, and every line they
//! send is relayed to everyone else. Modules, leaves first:
//!
//! - [`connection`] wraps the write half of one client with a stable id.
//! - [`hub`] owns the registry of live connections and applies join, leave
//!   and broadcast events one at a time from a single queue.
//! - [`session`] runs the read loop for one client and turns its lines into
//!   hub events or local replies.
//! - [`server`] accepts TCP connections and spawns a session for each.
//! - [`client`] is a small terminal bridge for talking to a running hub.
//! - [`cli`] and [`config`] hold the command line and runtime settings.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod hub;
pub mod server;
pub mod session;
