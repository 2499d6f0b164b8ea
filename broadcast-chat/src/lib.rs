//! Line-oriented broadcast chat over plain TCP.
//!
//! Every connected client sends newline-terminated UTF-8 lines; the server
//! relays each non-empty line to every other client as
//! `User [<ip:port>]: <text>` and announces arrivals and departures with
//! `User [<ip:port>] joined` / `left`.
//!
//! - [`registry`] tracks live connections behind a single async mutex.
//! - [`hub`] is the single-consumer event queue whose worker performs every
//!   fan-out, which gives all recipients the same message order.
//! - [`handler`] runs the per-connection state machine.
//! - [`server`] accepts TCP connections and spawns handlers.
//! - [`protocol`] holds line framing and the server's line formats.
//! - [`config`] and [`cli`] cover command-line configuration.
//! - [`client`] is a small terminal client for manual use.

pub mod cli;
pub mod client;
pub mod config;
pub mod handler;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;
