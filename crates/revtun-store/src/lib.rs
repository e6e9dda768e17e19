//! SQL storage for agent sessions
//!
//! Works with any backend sea-orm is built with here:
//! - **PostgreSQL** for shared deployments
//! - **SQLite3** for a single server (`"sqlite://./revtun.db?mode=rwc"`)
//! - **SQLite3 in-memory** for tests (`"sqlite::memory:"`)

pub mod entities;
pub mod migrator;
pub mod store;

pub use store::SessionStore;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr};
use tracing::info;

/// Open a database connection
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(database_url).await?;

    let backend = db.get_database_backend();
    info!("Connected to database backend: {:?}", backend);

    Ok(db)
}

/// Bring the schema up to date
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    use sea_orm_migration::MigratorTrait;

    info!("Running database migrations...");
    migrator::Migrator::up(db, None).await?;
    info!("Database migrations completed");

    Ok(())
}
