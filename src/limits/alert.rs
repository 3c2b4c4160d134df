use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::enrich::AlertMessageGenerator;
use crate::error::{AppError, AppResult};
use crate::limits::ledger::ActiveLimit;
use crate::limits::period::Period;

/// Outcome of comparing spend against a limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub current_percentage: f64,
    pub is_alert: bool,
}

/// Decides whether `current_spending` has crossed `alert_percentage` of
/// `max_limit`. The percentage is rounded half away from zero to two
/// decimals before the (inclusive) comparison.
pub fn evaluate(current_spending: i64, max_limit: i64, alert_percentage: i64) -> AppResult<Evaluation> {
    if max_limit <= 0 {
        return Err(AppError::Validation(format!(
            "spending limit must be positive, got {max_limit}"
        )));
    }

    let percentage = (Decimal::from(current_spending) * Decimal::ONE_HUNDRED
        / Decimal::from(max_limit))
    .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

    Ok(Evaluation {
        current_percentage: percentage.to_f64().unwrap_or_default(),
        is_alert: percentage >= Decimal::from(alert_percentage),
    })
}

/// Answer to the status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingStatus {
    pub current_spending: i64,
    pub max_limit: i64,
    pub alert_percentage: i64,
    pub current_percentage: f64,
    pub is_alert: bool,
    pub periode_start: NaiveDateTime,
    pub periode_end: NaiveDateTime,
}

impl SpendingStatus {
    pub fn from_limit(limit: &ActiveLimit) -> AppResult<Self> {
        let eval = evaluate(limit.current_spending, limit.max_limit, limit.alert_percentage)?;
        Ok(Self {
            current_spending: limit.current_spending,
            max_limit: limit.max_limit,
            alert_percentage: limit.alert_percentage,
            current_percentage: eval.current_percentage,
            is_alert: eval.is_alert,
            periode_start: limit.periode_start,
            periode_end: limit.periode_end,
        })
    }
}

/// Event pushed to streaming subscribers. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingNotification {
    pub user_id: i64,
    pub current_spending: i64,
    pub max_spending: i64,
    pub alert_percentage: i64,
    pub current_percentage: f64,
    pub is_alert: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Turns an active limit into a notification, optionally asking a
/// text generator for a human readable message.
#[derive(Clone)]
pub struct AlertEvaluator {
    generator: Option<Arc<dyn AlertMessageGenerator>>,
    timeout: Duration,
}

impl AlertEvaluator {
    pub fn new(generator: Option<Arc<dyn AlertMessageGenerator>>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    pub fn without_messages() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub async fn notification(&self, user_id: i64, limit: &ActiveLimit) -> AppResult<SpendingNotification> {
        let eval = evaluate(limit.current_spending, limit.max_limit, limit.alert_percentage)?;
        let message = self
            .message(limit.alert_percentage, eval.current_percentage, limit.period)
            .await;

        Ok(SpendingNotification {
            user_id,
            current_spending: limit.current_spending,
            max_spending: limit.max_limit,
            alert_percentage: limit.alert_percentage,
            current_percentage: eval.current_percentage,
            is_alert: eval.is_alert,
            message,
            timestamp: Utc::now(),
        })
    }

    // Enrichment never blocks delivery: any failure just drops the message.
    async fn message(&self, alert_percentage: i64, current_percentage: f64, period: Period) -> Option<String> {
        let generator = self.generator.as_ref()?;
        let call = generator.alert_message(alert_percentage, current_percentage, period);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => {
                tracing::warn!("alert message unavailable: {}", err);
                None
            }
            Err(_) => {
                tracing::warn!("alert message timed out after {:?}", self.timeout);
                None
            }
        }
    }
}
