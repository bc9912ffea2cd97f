pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod models;
pub mod moderation;
pub mod orders;
pub mod outbox;
pub mod requests;
pub mod schema;
pub mod stats;
pub mod uploads;

use anyhow::Result;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<AsyncPgConnection>;

/// Applies pending migrations over a short-lived synchronous connection.
pub fn run_migrations(database_url: &str) -> Result<()> {
    info!("Running database migrations...");
    let mut conn = PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");
    Ok(())
}

pub async fn build_pool(database_url: &str, max_size: u32) -> Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().max_size(max_size).build(manager).await?;
    Ok(pool)
}
