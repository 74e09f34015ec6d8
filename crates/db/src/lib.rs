pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use fixtures::{demo_business, seed_demo_business, SeedResult, DEMO_BUSINESS_ID};
pub use repositories::{
    BusinessRecord, InMemoryBusinessDataProvider, RepositoryError, SqlBusinessDataProvider,
};
