//! Active deployment entity - the singleton row naming the live slot.
//!
//! `id` is `GENERATED ALWAYS AS (1) STORED UNIQUE` in the database, so it is read but
//! never written. Inserts leave it unset and use it as the conflict target.

use crate::core::deployment::DeploymentName;
use sea_orm::entity::prelude::*;

/// The only `id` the table can hold.
pub const SINGLETON_ID: i32 = 1;

/// Active deployment database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(schema_name = "app_private", table_name = "active_deployment")]
pub struct Model {
    /// Always [`SINGLETON_ID`]
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,
    /// The slot currently serving traffic
    pub name: DeploymentName,
}

/// `ActiveDeployment` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
