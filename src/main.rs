mod auth;
mod availability;
mod db;
mod error;
mod models;
mod orchestrator;
mod routes;
mod state;
mod store;
mod tasks;

use std::env;
use std::str::FromStr;
use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::broadcast;

use crate::{orchestrator::Orchestrator, state::AppState, store::SqliteStore};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    if let Err(err) = run().await {
        eprintln!("Startup error: {err}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let db_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./data/opsdesk.db".to_string());
    db::ensure_sqlite_dir(&db_url)?;

    let connect_options = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options)
        .await?;

    db::run_migrations(&pool).await?;
    db::seed_defaults(&pool).await?;

    let (events, _) = broadcast::channel(64);
    let portal = Arc::new(Orchestrator::new(SqliteStore::new(pool.clone()), events.clone()));
    portal.refresh().await?;

    // Change-feed listener: whichever surface mutated a row, every other
    // reader sees a freshly loaded cache. Records with in-flight local
    // writes survive the reload untouched.
    {
        let portal = portal.clone();
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            while rx.recv().await.is_ok() {
                if let Err(err) = portal.refresh().await {
                    log::warn!("change-feed refresh failed: {err}");
                }
            }
        });
    }

    let state = AppState {
        db: pool.clone(),
        portal,
        events,
    };

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8080);

    let address = format!("0.0.0.0:{port}");
    log::info!("Starting OpsDesk on http://{address}");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(middleware::Logger::default())
            .configure(routes::admin::configure)
            .configure(routes::client::configure)
            .configure(routes::technician::configure)
            .configure(routes::events::configure)
    })
    .bind(address)?
    .run()
    .await?;

    Ok(())
}
