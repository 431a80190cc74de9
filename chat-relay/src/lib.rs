//! WebSocket chat relay and its reconnecting terminal client.
//!
//! Run `chat-relay relay` to serve and `chat-relay client` to join. Each
//! module focuses on a concrete responsibility:
//!
//! - [`envelope`] encodes and decodes chat envelopes in both the JSON and the
//!   `name: body` forms, including the `[LLM]` prompt marker.
//! - [`registry`] tracks live connections and hands out snapshots.
//! - [`broadcast`] fans one envelope out to every other connection and drops
//!   recipients that cannot keep up.
//! - [`relay`] accepts WebSocket upgrades and wires sockets to the registry.
//! - [`client`] holds the presence gate, the reconnect state machine, the
//!   socket driver, and the terminal front-end.
//! - [`config`], [`cli`] and [`error`] carry settings, argument parsing and
//!   the error types shared by the rest.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod registry;
pub mod relay;
