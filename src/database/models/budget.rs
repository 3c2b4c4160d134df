use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::limits::period::Period;

/// A user's recurring spending limit (`spending_limit` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConfig {
    #[sqlx(rename = "spending_limit_id")]
    pub id: i64,
    pub user_id: i64,
    pub period: Period,
    pub amount: i64,            // minor currency units
    pub alert_percentage: i64,  // 20..=100
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Input for creating a budget configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBudget {
    #[serde(default)]
    pub period: Period,
    pub amount: i64,
    pub alert_percentage: i64,
}

/// Partial update; every field may change independently.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetPatch {
    pub period: Option<Period>,
    pub amount: Option<i64>,
    pub alert_percentage: Option<i64>,
}

impl BudgetPatch {
    pub fn is_empty(&self) -> bool {
        self.period.is_none() && self.amount.is_none() && self.alert_percentage.is_none()
    }
}
