//! Stock Ledger - Backend Server
//!
//! Serves the ledger over HTTP against PostgreSQL and runs the reservation
//! expiry sweep.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stock_ledger::{
    clock::SystemClock, create_app, store::PgLedgerStore, AppState, Config, LedgerService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // Load configuration
    let config = Config::load()?;

    tracing::info!("Starting Stock Ledger Server");
    tracing::info!("Environment: {}", config.environment);

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
        .connect(&config.database.url)
        .await?;

    tracing::info!("Database connection established");

    if config.database.run_migrations {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&db_pool).await?;
        tracing::info!("Migrations completed");
    }

    let store = Arc::new(PgLedgerStore::new(db_pool, &config.ledger));
    let ledger = LedgerService::new(store, Arc::new(SystemClock), config.ledger.clone());

    spawn_expiry_sweep(ledger.clone(), config.ledger.sweep_interval());

    // Create application state
    let state = AppState {
        ledger,
        config: Arc::new(config.clone()),
    };

    // Build application
    let app = create_app(state);

    // Start server
    let host: std::net::IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Plain text by default; `LEDGER_LOG_FORMAT=json` switches to JSON lines
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stock_ledger=debug,tower_http=debug,sqlx=warn".into());
    let registry = tracing_subscriber::registry().with(filter);

    match std::env::var("LEDGER_LOG_FORMAT").as_deref() {
        Ok("json") => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Expire lapsed reservations on a fixed period
fn spawn_expiry_sweep(ledger: LedgerService, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = ledger.expire_reservations().await {
                tracing::warn!(error = %err, "Reservation sweep failed");
            }
        }
    });
}
