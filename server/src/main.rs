mod auth;
mod config;
mod nutritionix;
mod routes;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, NutritionixCredentials};
use crate::nutritionix::{NutritionProvider, NutritionixClient, StubNutritionProvider};
use fitlog_core::db::Database;

#[derive(Parser)]
#[command(
    name = "fitlog",
    version,
    about = "A multi-user fitness tracking backend"
)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 5000)]
    port: u16,
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,
    /// Database file path (default: platform data directory)
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db_path = cli.db.unwrap_or_else(|| config.db_path.clone());
    let db = Database::open(&db_path)?;
    let jwt_secret = config.load_or_create_jwt_secret()?;

    let provider: Arc<dyn NutritionProvider> = match NutritionixCredentials::from_env() {
        Some(credentials) => {
            tracing::info!("Nutrition lookups use the Nutritionix API");
            Arc::new(NutritionixClient::new(credentials))
        }
        None => {
            tracing::warn!(
                "No Nutritionix credentials configured; nutrition lookups return mock data"
            );
            Arc::new(StubNutritionProvider)
        }
    };

    routes::start_server(db, provider, jwt_secret, cli.port, &cli.bind).await
}
