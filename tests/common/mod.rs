#![allow(dead_code)]

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{Pool, Sqlite};

use spending_alerts::config::Config;
use spending_alerts::database::db::{connection, migrate, queries};
use spending_alerts::database::models::{Expense, NewBudget};
use spending_alerts::limits::{LimitLedger, Period};

pub async fn memory_pool() -> Pool<Sqlite> {
    let pool = connection::get_memory_pool().await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    pool
}

pub fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".into(),
        bind_addr: ([127, 0, 0, 1], 0).into(),
        heartbeat_every: Duration::from_secs(30),
        delivery_timeout: Duration::from_secs(1),
        groq: None,
    }
}

pub fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, 0, 0)
        .unwrap()
}

pub fn budget(period: Period, amount: i64, alert_percentage: i64) -> NewBudget {
    NewBudget {
        period,
        amount,
        alert_percentage,
    }
}

/// Inserts an expense and runs the ledger hook the way the expense service
/// does, with a fixed clock.
pub async fn add_expense(
    pool: &Pool<Sqlite>,
    ledger: &LimitLedger,
    user_id: i64,
    amount: i64,
    spent_at: NaiveDateTime,
    now: NaiveDateTime,
) -> Expense {
    let mut tx = pool.begin().await.unwrap();
    let expense = queries::insert_expense(&mut *tx, user_id, "test", amount, None, spent_at, now)
        .await
        .unwrap();
    ledger.on_expense_created(&mut *tx, &expense, now).await.unwrap();
    tx.commit().await.unwrap();
    expense
}

pub async fn current_spending(ledger: &LimitLedger, user_id: i64, now: NaiveDateTime) -> i64 {
    ledger
        .active_limit_at(user_id, now)
        .await
        .unwrap()
        .expect("active limit")
        .current_spending
}
