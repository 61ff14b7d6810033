/// Database connection and schema bootstrap
pub mod database;

/// Deployment identity, operator and exemption settings from config.toml and the environment
pub mod deployment;
