use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::backend::{handlers, AppState};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/spending",
            post(handlers::create_limit).get(handlers::get_limit),
        )
        .route(
            "/api/spending/:id",
            patch(handlers::update_limit).delete(handlers::delete_limit),
        )
        .route(
            "/api/expense",
            post(handlers::create_expenses).get(handlers::list_expenses),
        )
        .route(
            "/api/expense/:id",
            get(handlers::get_expense)
                .patch(handlers::update_expense)
                .delete(handlers::delete_expense),
        )
        .route(
            "/api/periode-limit/notifications/status",
            get(handlers::notification_status),
        )
        .route(
            "/api/periode-limit/notifications/health",
            get(handlers::notification_health),
        )
        .route(
            "/api/periode-limit/notifications/stream",
            get(handlers::notification_stream),
        )
        .route("/api/periode-limit/recompute", post(handlers::recompute))
}
