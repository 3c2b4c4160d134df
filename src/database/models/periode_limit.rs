use chrono::NaiveDateTime;
use serde::Serialize;

/// Running spend for one budget configuration inside its active window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PeriodCounter {
    #[sqlx(rename = "periode_limit_id")]
    pub id: i64,
    pub user_id: i64,
    #[sqlx(rename = "spending_limit_id")]
    pub budget_config_id: i64,
    pub periode_start: NaiveDateTime,
    pub periode_end: NaiveDateTime,
    pub current_spending: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl PeriodCounter {
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.periode_start <= at && at <= self.periode_end
    }
}
