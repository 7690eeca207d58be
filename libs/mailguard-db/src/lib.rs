pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

pub use sqlx;
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

pub use memory::MemoryStore;
pub use store::{DuplicateEmail, ImportStore, SubscriberStore};

pub async fn connect(url: &str) -> Result<sqlx::PgPool> {
    if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
        anyhow::bail!("DATABASE_URL must start with postgres:// or postgresql://");
    }

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run DB migrations")?;

    Ok(pool)
}
