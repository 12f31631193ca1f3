//! # palaver-core
//!
//! Foundation types for the Palaver chat synchronization core.
//!
//! This crate provides the shared vocabulary the sync crate builds on:
//!
//! - **Branded IDs**: [`ids::ChatId`], [`ids::ServerId`], [`ids::LocalId`] as newtypes
//! - **Messages**: [`messages::Message`] and [`messages::Chat`] with the
//!   `(created_at, local_id)` ordering invariant
//! - **Wire events**: [`events::PushEvent`] for server push, [`events::StreamEvent`]
//!   for incremental generation
//! - **Errors**: [`errors::SyncError`] hierarchy via `thiserror`
//! - **Retry**: [`retry::RetryConfig`] and capped exponential backoff
//! - **Connectivity**: [`connectivity::ConnectionPhase`] and state snapshots
//!
//! ## Crate Position
//!
//! Foundation crate. No I/O, no async. Depended on by `palaver-sync`.

#![deny(unsafe_code)]

pub mod connectivity;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod retry;
