//! Discord gateway event handlers
//!
//! This module provides handlers for gateway events that arrive outside of commands.

/// Ready and message handling, gated on the active deployment
pub mod events;
