mod handlers;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use serde_json::json;
use sqlx::{Pool, Sqlite};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::enrich::{AlertMessageGenerator, CategoryClassifier, GroqClient};
use crate::error::{AppError, AppResult};
use crate::expenses::ExpenseService;
use crate::limits::{AlertEvaluator, LimitLedger, SpendingNotifier};
use crate::notify::NotificationRegistry;

pub use handlers::{UserId, USER_ID_HEADER};

#[derive(Clone)]
pub struct AppState {
    pub db: Pool<Sqlite>,
    pub ledger: LimitLedger,
    pub notifier: SpendingNotifier,
    pub registry: NotificationRegistry,
    pub expenses: ExpenseService,
    pub shutdown: CancellationToken,
    pub heartbeat_every: Duration,
}

impl AppState {
    /// Wires the services together. Enrichment is only enabled when a Groq
    /// key is configured.
    pub fn new(pool: Pool<Sqlite>, config: &Config) -> AppResult<Self> {
        if config.heartbeat_every.is_zero() {
            return Err(AppError::Validation("heartbeat interval must be positive".into()));
        }
        let ledger = LimitLedger::new(pool.clone());
        let registry = NotificationRegistry::new(config.delivery_timeout);

        let groq = match &config.groq {
            Some(groq) => Some((Arc::new(GroqClient::new(groq)?), groq.timeout)),
            None => None,
        };

        let evaluator = match &groq {
            Some((client, timeout)) => {
                let generator: Arc<dyn AlertMessageGenerator> = client.clone();
                AlertEvaluator::new(Some(generator), *timeout)
            }
            None => AlertEvaluator::without_messages(),
        };
        let notifier = SpendingNotifier::new(ledger.clone(), evaluator, registry.clone());

        let mut expenses = ExpenseService::new(pool.clone(), ledger.clone(), notifier.clone());
        if let Some((client, timeout)) = groq {
            let classifier: Arc<dyn CategoryClassifier> = client;
            expenses = expenses.with_classifier(classifier, timeout);
        }

        Ok(Self {
            db: pool,
            ledger,
            notifier,
            registry,
            expenses,
            shutdown: CancellationToken::new(),
            heartbeat_every: config.heartbeat_every,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .merge(routes::api_routes())
        .with_state(state)
}

pub async fn run_server(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let registry = state.registry.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown requested; closing streams");
            shutdown.cancel();
            registry.shutdown();
        })
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
