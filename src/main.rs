// src/main.rs
use std::env;

use anyhow::{bail, Context};
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use spending_alerts::backend::{self, AppState};
use spending_alerts::config::Config;
use spending_alerts::database::db::{connection, migrate};
use spending_alerts::limits::LimitLedger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let pool = connection::get_db_pool(&config.database_url)
        .await
        .with_context(|| format!("cannot open database {}", config.database_url))?;
    migrate::run_migrations(&pool).await?;

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        None | Some("serve") => {
            info!("starting spending alerts server");
            let state = AppState::new(pool, &config)?;
            backend::run_server(state, config.bind_addr).await?;
        }
        Some("recompute") => {
            let user_id: i64 = args
                .get(2)
                .context("usage: spending-alerts recompute <user_id>")?
                .parse()
                .context("user_id must be an integer")?;

            match LimitLedger::new(pool).recompute(user_id).await? {
                Some(spent) => println!("user {user_id}: current spending {spent}"),
                None => println!("user {user_id} has no active spending limit"),
            }
        }
        Some(other) => bail!("unknown command {other:?}; expected `serve` or `recompute <user_id>`"),
    }
    Ok(())
}
