//! Core coordination logic - framework-agnostic deployment state, events and persistence.
//!
//! Nothing in here knows about Discord. The bot layer only calls
//! [`service::DeploymentService`].

/// Deployment value object and the closed slot name enum
pub mod deployment;
/// Domain events and the in-process event bus
pub mod events;
/// `PostgreSQL` repository using a singleton row and `LISTEN`/`NOTIFY`
pub mod postgres;
/// Repository port implemented by storage backends
pub mod repository;
/// Per-process coordinator answering "am I active?"
pub mod service;
