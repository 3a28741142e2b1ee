use mbee_core::config::AppConfig;
use mbee_core::logic::Validator;
use mbee_core::seed;
use mbee_core::store::PostgresStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    let validator = Validator::new(&config.validators)?;

    log::info!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let postgres_store = PostgresStore::new(&database_url, config.max_connections()).await?;

    log::info!("Running database migrations...");
    postgres_store.migrate().await?;

    let store = Arc::new(postgres_store);

    if config.seed {
        log::info!("Loading seed data...");
        seed::load_seed_data(store, validator).await?;
    }

    log::info!("Element store ready");
    Ok(())
}
