use std::convert::Infallible;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::backend::AppState;
use crate::database::models::{BudgetConfig, BudgetPatch, Expense, ExpensePatch, ExpenseQuery, NewBudget};
use crate::error::{AppError, AppResult};
use crate::expenses::{ExpenseBatch, ExpensePage};
use crate::limits::notifier::NO_ACTIVE_LIMIT;
use crate::limits::SpendingStatus;
use crate::notify::{SessionEvent, StreamingSession};

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

const STREAM_BUFFER: usize = 16;

/// Caller identity, resolved by the auth layer in front of this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(UserId)
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "Unauthorized" })),
                )
                    .into_response()
            })
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

// ---- spending limit ----

pub async fn create_limit(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<NewBudget>,
) -> AppResult<Response> {
    let config = state.ledger.create(user_id, &payload).await?;
    state.notifier.notify_user(user_id).await;
    Ok((StatusCode::CREATED, Json(json!({ "id": config.id }))).into_response())
}

pub async fn get_limit(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> AppResult<Json<BudgetConfig>> {
    Ok(Json(state.ledger.get_by_user(user_id).await?))
}

pub async fn update_limit(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<i64>,
    Json(patch): Json<BudgetPatch>,
) -> AppResult<Response> {
    match state.ledger.update(user_id, id, &patch).await? {
        Some(config) => {
            state.notifier.notify_user(user_id).await;
            Ok(Json(config).into_response())
        }
        None => Ok(not_found("Spending limit not found")),
    }
}

pub async fn delete_limit(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    if state.ledger.delete(user_id, id).await? {
        Ok(Json(json!({ "message": "Spending limit deleted" })).into_response())
    } else {
        Ok(not_found("Spending limit not found"))
    }
}

// ---- expenses ----

pub async fn create_expenses(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(batch): Json<ExpenseBatch>,
) -> AppResult<Response> {
    let created = state.expenses.create(user_id, batch.into_vec()).await?;
    let ids: Vec<i64> = created.iter().map(|e| e.id).collect();
    Ok((
        StatusCode::CREATED,
        Json(json!({ "count": ids.len(), "ids": ids })),
    )
        .into_response())
}

pub async fn list_expenses(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(query): Query<ExpenseQuery>,
) -> AppResult<Json<ExpensePage>> {
    Ok(Json(state.expenses.list(user_id, &query).await?))
}

pub async fn get_expense(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<i64>,
) -> AppResult<Json<Expense>> {
    Ok(Json(state.expenses.get(user_id, id).await?))
}

pub async fn update_expense(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<i64>,
    Json(patch): Json<ExpensePatch>,
) -> AppResult<Response> {
    match state.expenses.update(user_id, id, &patch).await? {
        Some(expense) => Ok(Json(expense).into_response()),
        None => Ok(not_found("Expense not found")),
    }
}

pub async fn delete_expense(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    if state.expenses.delete(user_id, id).await? {
        Ok(Json(json!({ "message": "Expense deleted" })).into_response())
    } else {
        Ok(not_found("Expense not found"))
    }
}

// ---- notifications ----

pub async fn notification_status(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> AppResult<Json<SpendingStatus>> {
    Ok(Json(state.notifier.status(user_id).await?))
}

pub async fn notification_health(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "userId": user_id,
        "connectedClients": state.registry.subscriber_count(user_id),
        "totalSystemClients": state.registry.total_subscribers(),
    }))
}

/// Opens a streaming session. The session task owns the subscription; the
/// response body only drains what it writes.
pub async fn notification_stream(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<SessionEvent>(STREAM_BUFFER);
    let session = StreamingSession::new(user_id, state.heartbeat_every);

    let notifier = state.notifier.clone();
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        session.run(&notifier, tx, shutdown).await;
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.name())
                .data(event.payload().to_string()),
        )
    });
    Sse::new(stream)
}

pub async fn recompute(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> AppResult<Json<serde_json::Value>> {
    let current = state
        .ledger
        .recompute(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(NO_ACTIVE_LIMIT.into()))?;
    state.notifier.notify_user(user_id).await;
    Ok(Json(json!({ "currentSpending": current })))
}
