//! Route definitions for the stock ledger

use axum::{
    routing::{get, post},
    Router,
};

use crate::{handlers, AppState};

/// Create API routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/catalog", catalog_routes())
        .nest("/ledger", ledger_routes())
}

/// Catalog mirror routes
fn catalog_routes() -> Router<AppState> {
    Router::new()
        .route("/skus", post(handlers::register_sku))
        .route("/locations", post(handlers::register_location))
}

/// Ledger routes
fn ledger_routes() -> Router<AppState> {
    Router::new()
        .route("/receipts", post(handlers::receive))
        .route("/issues", post(handlers::issue))
        .route("/transfers", post(handlers::transfer))
        .route("/adjustments", post(handlers::adjust))
        .route("/reservations", post(handlers::reserve))
        .route("/reservations/:reservation_id", get(handlers::get_reservation))
        .route(
            "/reservations/:reservation_id/commit",
            post(handlers::commit_reservation),
        )
        .route(
            "/reservations/:reservation_id/release",
            post(handlers::release_reservation),
        )
        .route("/balances", get(handlers::get_balance))
        .route("/summary", get(handlers::get_stock_summary))
        .route("/movements", get(handlers::get_movement_history))
        .route("/batches/near-expiry", get(handlers::get_batches_near_expiry))
        .route("/rebuild", post(handlers::rebuild_balances))
        .route("/consistency", get(handlers::check_consistency))
}
