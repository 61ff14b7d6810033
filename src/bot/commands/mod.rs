//! Discord command implementations organized by category.

/// Deployment status and slot switching for the configured operator
pub mod deployment;

/// General utility commands
pub mod general;

// Export commands
pub use deployment::deployment;
pub use general::*;
