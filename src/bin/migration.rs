use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use storefront_api::migrator::Migrator;
use tracing::info;

/// Applies (default) or reverts the schema. `migration down [steps]` rolls back.
#[tokio::main]
async fn main() -> Result<(), DbErr> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "up".to_string());
    let steps = args.next().and_then(|s| s.parse::<u32>().ok());

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());

    info!(command = %command, "Connecting to database for migration");

    let mut options = ConnectOptions::new(database_url);
    options
        .max_connections(5)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .sqlx_logging(true);

    let db = Database::connect(options).await?;

    match command.as_str() {
        "up" => Migrator::up(&db, steps).await?,
        "down" => Migrator::down(&db, steps.or(Some(1))).await?,
        "status" => Migrator::status(&db).await?,
        other => {
            return Err(DbErr::Custom(format!(
                "unknown migration command '{other}', expected up, down or status"
            )))
        }
    }

    info!("Migration completed successfully");

    Ok(())
}
