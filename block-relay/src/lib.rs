//! Peer-broadcast message relay backed by a durable, sequentially numbered
//! record log.
//!
//! Every line a peer sends is hashed with SHA-256, appended to a SQLite
//! table and broadcast to every connected peer (the sender included). A
//! line of the form `retrieve:<id>` instead asks for one stored record,
//! answered only to the requester.
//!
//! - [`record`] defines the record and its hash.
//! - [`store`] is the SQLite-backed append-only log.
//! - [`registry`] tracks connected peers and fans records out to them.
//! - [`protocol`] frames lines and classifies requests.
//! - [`handler`] runs the per-connection read loop.
//! - [`server`] owns the listener and spawns one handler per connection.
//! - [`cli`], [`config`] and [`client`] cover the command line, startup
//!   settings and the interactive terminal client.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod server;
pub mod store;
