//! Entity module - `SeaORM` entity definitions for the coordination tables.

pub mod active_deployment;

pub use active_deployment::{
    Column as ActiveDeploymentColumn, Entity as ActiveDeployment, Model as ActiveDeploymentModel,
};
