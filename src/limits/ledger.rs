//! Budget configurations and their running period counters.
//!
//! `current_spending` is derived data: it always equals the sum of the
//! user's expenses inside the counter's window. Expense mutations keep it up
//! to date with atomic increments; [`LimitLedger::recompute`] rebuilds it
//! from the expense table and is the source of truth.

use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{debug, info};

use crate::database::db::connection::WriteTx;
use crate::database::db::queries;
use crate::database::models::{BudgetConfig, BudgetPatch, Expense, NewBudget};
use crate::error::{AppError, AppResult};
use crate::limits::now_local;
use crate::limits::period::{compute_window, Period};

pub const MIN_ALERT_PERCENTAGE: i64 = 20;
pub const MAX_ALERT_PERCENTAGE: i64 = 100;

/// The user's active configuration joined with its current counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ActiveLimit {
    pub budget_config_id: i64,
    pub period: Period,
    pub current_spending: i64,
    pub max_limit: i64,
    pub alert_percentage: i64,
    pub periode_start: NaiveDateTime,
    pub periode_end: NaiveDateTime,
}

#[derive(Clone)]
pub struct LimitLedger {
    pool: Pool<Sqlite>,
}

fn validate_amount(amount: i64) -> AppResult<()> {
    if amount < 1 {
        return Err(AppError::Validation(format!("amount must be at least 1, got {amount}")));
    }
    Ok(())
}

fn validate_alert_percentage(pct: i64) -> AppResult<()> {
    if !(MIN_ALERT_PERCENTAGE..=MAX_ALERT_PERCENTAGE).contains(&pct) {
        return Err(AppError::Validation(format!(
            "alertPercentage must be between {MIN_ALERT_PERCENTAGE} and {MAX_ALERT_PERCENTAGE}, got {pct}"
        )));
    }
    Ok(())
}

impl LimitLedger {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn create(&self, user_id: i64, budget: &NewBudget) -> AppResult<BudgetConfig> {
        self.create_at(user_id, budget, now_local()).await
    }

    /// Inserts the configuration and its first counter (window containing
    /// `now`, spend 0) in one transaction.
    pub async fn create_at(
        &self,
        user_id: i64,
        budget: &NewBudget,
        now: NaiveDateTime,
    ) -> AppResult<BudgetConfig> {
        validate_amount(budget.amount)?;
        validate_alert_percentage(budget.alert_percentage)?;

        let mut tx = WriteTx::begin(&self.pool).await?;

        if queries::find_active_budget(&mut *tx, user_id).await?.is_some() {
            return Err(AppError::Conflict("Spending limit already exists".into()));
        }

        let config = match queries::insert_budget(&mut *tx, user_id, budget, now).await {
            Ok(config) => config,
            // lost a race against a concurrent create for the same user
            Err(err) if AppError::is_unique_violation(&err) => {
                return Err(AppError::Conflict("Spending limit already exists".into()))
            }
            Err(err) => return Err(err.into()),
        };

        let window = compute_window(config.period, now);
        queries::insert_counter(&mut *tx, user_id, config.id, window, 0, now).await?;
        tx.commit().await?;

        info!(
            "spending limit {} created for user {} ({} {}, alert at {}%)",
            config.id, user_id, config.amount, config.period, config.alert_percentage
        );
        Ok(config)
    }

    pub async fn get_by_user(&self, user_id: i64) -> AppResult<BudgetConfig> {
        let mut conn = self.pool.acquire().await?;
        queries::find_active_budget(&mut conn, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Spending limit not found".into()))
    }

    pub async fn update(
        &self,
        user_id: i64,
        config_id: i64,
        patch: &BudgetPatch,
    ) -> AppResult<Option<BudgetConfig>> {
        self.update_at(user_id, config_id, patch, now_local()).await
    }

    /// Applies a partial patch. Returns `None` when the configuration does
    /// not exist for this user. A period change re-windows the counter right
    /// away and recomputes its spend.
    pub async fn update_at(
        &self,
        user_id: i64,
        config_id: i64,
        patch: &BudgetPatch,
        now: NaiveDateTime,
    ) -> AppResult<Option<BudgetConfig>> {
        if let Some(amount) = patch.amount {
            validate_amount(amount)?;
        }
        if let Some(pct) = patch.alert_percentage {
            validate_alert_percentage(pct)?;
        }

        let mut tx = WriteTx::begin(&self.pool).await?;
        let Some(before) = queries::find_budget(&mut *tx, user_id, config_id).await? else {
            return Ok(None);
        };
        if patch.is_empty() {
            return Ok(Some(before));
        }

        let Some(after) = queries::update_budget(&mut *tx, user_id, config_id, patch, now).await?
        else {
            return Ok(None);
        };

        if after.period != before.period {
            for (counter, _) in queries::counters_for_user(&mut *tx, user_id).await? {
                if counter.budget_config_id == after.id {
                    let window = compute_window(after.period, now);
                    let spent =
                        queries::sum_expenses_between(&mut *tx, user_id, window.0, window.1).await?;
                    queries::set_counter(&mut *tx, counter.id, window, spent, now).await?;
                }
            }
            info!(
                "spending limit {} period changed {} -> {}; counter re-windowed",
                after.id, before.period, after.period
            );
        }

        tx.commit().await?;
        Ok(Some(after))
    }

    /// Removes the configuration and its counter. `false` if nothing matched.
    pub async fn delete(&self, user_id: i64, config_id: i64) -> AppResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let deleted = queries::delete_budget(&mut conn, user_id, config_id).await?;
        if deleted {
            info!("spending limit {} deleted for user {}", config_id, user_id);
        }
        Ok(deleted)
    }

    /// Moves every elapsed counter of the user to the window containing
    /// `now`, with its spend recomputed. Returns whether anything moved.
    pub async fn roll_over(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
        now: NaiveDateTime,
    ) -> AppResult<bool> {
        let mut rolled = false;
        for (counter, period) in queries::counters_for_user(conn, user_id).await? {
            if counter.contains(now) {
                continue;
            }
            let window = compute_window(period, now);
            let spent = queries::sum_expenses_between(conn, user_id, window.0, window.1).await?;
            queries::set_counter(conn, counter.id, window, spent, now).await?;
            info!(
                "counter {} of user {} rolled over to {} .. {}",
                counter.id, user_id, window.0, window.1
            );
            rolled = true;
        }
        Ok(rolled)
    }

    /// Adds `delta` to the active counter when `spent_at` falls in its
    /// window. A no-op for users without a budget.
    pub async fn on_expense_amount_changed(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
        delta: i64,
        spent_at: NaiveDateTime,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        // a rollover recomputes from the expense table, which already holds
        // the caller's change
        if self.roll_over(conn, user_id, now).await? || delta == 0 {
            return Ok(());
        }
        let touched = queries::add_to_counter(conn, user_id, delta, spent_at, now).await?;
        debug!("counter delta {} for user {} touched {} rows", delta, user_id, touched);
        Ok(())
    }

    /// Call after the expense row was inserted, in the same transaction.
    pub async fn on_expense_created(
        &self,
        conn: &mut SqliteConnection,
        expense: &Expense,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        self.on_expense_amount_changed(conn, expense.user_id, expense.amount, expense.spent_at, now)
            .await
    }

    /// Call after the expense row was deleted, in the same transaction.
    pub async fn on_expense_deleted(
        &self,
        conn: &mut SqliteConnection,
        expense: &Expense,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        self.on_expense_amount_changed(conn, expense.user_id, -expense.amount, expense.spent_at, now)
            .await
    }

    /// Call after the expense row was updated: the old row leaves the window
    /// and the new one enters it.
    pub async fn on_expense_updated(
        &self,
        conn: &mut SqliteConnection,
        before: &Expense,
        after: &Expense,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        if self.roll_over(conn, after.user_id, now).await? {
            return Ok(());
        }
        if before.spent_at == after.spent_at {
            let delta = after.amount - before.amount;
            if delta != 0 {
                queries::add_to_counter(conn, after.user_id, delta, after.spent_at, now).await?;
            }
            return Ok(());
        }
        queries::add_to_counter(conn, before.user_id, -before.amount, before.spent_at, now).await?;
        queries::add_to_counter(conn, after.user_id, after.amount, after.spent_at, now).await?;
        Ok(())
    }

    pub async fn recompute(&self, user_id: i64) -> AppResult<Option<i64>> {
        self.recompute_at(user_id, now_local()).await
    }

    /// Overwrites the active counter with the sum of the user's expenses in
    /// its window. Returns the new spend, or `None` without a budget.
    pub async fn recompute_at(&self, user_id: i64, now: NaiveDateTime) -> AppResult<Option<i64>> {
        let mut tx = WriteTx::begin(&self.pool).await?;
        let current = self.recompute_in(&mut *tx, user_id, now).await?;
        tx.commit().await?;
        Ok(current)
    }

    /// [`LimitLedger::recompute_at`] inside the caller's transaction.
    pub async fn recompute_in(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
        now: NaiveDateTime,
    ) -> AppResult<Option<i64>> {
        self.roll_over(conn, user_id, now).await?;

        let mut current = None;
        for (counter, _) in queries::counters_for_user(conn, user_id).await? {
            let spent = queries::sum_expenses_between(
                conn,
                user_id,
                counter.periode_start,
                counter.periode_end,
            )
            .await?;
            if spent != counter.current_spending {
                info!(
                    "counter {} of user {} corrected {} -> {}",
                    counter.id, user_id, counter.current_spending, spent
                );
            }
            queries::set_counter(
                conn,
                counter.id,
                (counter.periode_start, counter.periode_end),
                spent,
                now,
            )
            .await?;
            current = Some(spent);
        }
        Ok(current)
    }

    pub async fn active_limit(&self, user_id: i64) -> AppResult<Option<ActiveLimit>> {
        self.active_limit_at(user_id, now_local()).await
    }

    /// The user's active configuration and counter, rolled over first if the
    /// stored window has elapsed.
    pub async fn active_limit_at(
        &self,
        user_id: i64,
        now: NaiveDateTime,
    ) -> AppResult<Option<ActiveLimit>> {
        let mut tx = WriteTx::begin(&self.pool).await?;
        self.roll_over(&mut *tx, user_id, now).await?;
        let limit = queries::active_limit(&mut *tx, user_id, now).await?;
        tx.commit().await?;
        Ok(limit)
    }
}
