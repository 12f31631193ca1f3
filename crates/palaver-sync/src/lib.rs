//! # palaver-sync
//!
//! The message synchronization core. Reconciles three independent sources of
//! truth for a chat's message list (local optimistic edits, the
//! server-confirmed push stream, and incremental token streams) into one
//! consistent ordering, tolerating connection loss, duplicate delivery, and
//! out-of-order arrival.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `store` | Single in-memory source of truth for chats and ordered messages |
//! | `stream` | One in-flight incremental-generation session per chat |
//! | `reconcile` | Push-event correlation: server-id match, optimistic echo, fallback append |
//! | `connection` | Transport lifecycle: connect, bounded-backoff reconnect, teardown |
//! | `transport` | Seams for the real-time transport and the request service |
//! | `client` | The single-task event loop tying the above together |
//! | `config` | Runtime knobs with compiled defaults and env overrides |
//!
//! ## Concurrency model
//!
//! One logical event loop ([`client::SyncClient::run`]) owns the store; store
//! mutations, stream callbacks, and push-event handling run as
//! non-overlapping steps of that loop, so the store needs no locking;
//! mutual exclusion is structural. Suspension points are exclusively at
//! network boundaries. Cancellation is cooperative (`CancellationToken`)
//! and idempotent.

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod connection;
pub mod reconcile;
pub mod store;
pub mod stream;
pub mod transport;

pub use client::{ClientEvent, ClientHandle, SyncClient};
pub use config::SyncConfig;
pub use connection::{ConnectionSupervisor, ConnectivityEvent};
pub use store::ChatStore;
