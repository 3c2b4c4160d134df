//! Expense bookkeeping. Every mutation keeps the user's period counter in
//! step and pushes the new state to live subscribers before returning.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use tracing::{info, warn};

use crate::database::db::connection::WriteTx;
use crate::database::db::queries;
use crate::database::models::{
    Category, Expense, ExpenseListItem, ExpensePatch, ExpenseQuery, NewExpense,
};
use crate::enrich::CategoryClassifier;
use crate::error::{AppError, AppResult};
use crate::limits::{now_local, LimitLedger, SpendingNotifier};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Create payload: a single expense or an array of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExpenseBatch {
    Many(Vec<NewExpense>),
    One(NewExpense),
}

impl ExpenseBatch {
    pub fn into_vec(self) -> Vec<NewExpense> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub page: i64,
    pub total_pages: i64,
}

impl PageMeta {
    fn new(total: i64, limit: i64, offset: i64) -> Self {
        Self {
            total,
            limit,
            offset,
            page: offset / limit + 1,
            total_pages: (total + limit - 1) / limit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpensePage {
    pub data: Vec<ExpenseListItem>,
    pub meta: PageMeta,
    pub total_expenses: i64,
}

#[derive(Clone)]
pub struct ExpenseService {
    pool: Pool<Sqlite>,
    ledger: LimitLedger,
    notifier: SpendingNotifier,
    classifier: Option<Arc<dyn CategoryClassifier>>,
    classify_timeout: Duration,
}

fn validate_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".into()));
    }
    Ok(())
}

fn validate_amount(amount: i64) -> AppResult<()> {
    if amount < 0 {
        return Err(AppError::Validation(format!("amount must not be negative, got {amount}")));
    }
    Ok(())
}

fn unknown_category(category_id: Option<i64>) -> AppError {
    match category_id {
        Some(id) => AppError::Validation(format!("unknown category_id {id}")),
        None => AppError::Validation("unknown category".into()),
    }
}

impl ExpenseService {
    pub fn new(pool: Pool<Sqlite>, ledger: LimitLedger, notifier: SpendingNotifier) -> Self {
        Self {
            pool,
            ledger,
            notifier,
            classifier: None,
            classify_timeout: Duration::ZERO,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn CategoryClassifier>, timeout: Duration) -> Self {
        self.classifier = Some(classifier);
        self.classify_timeout = timeout;
        self
    }

    /// Inserts every item in one transaction. Explicit category ids must
    /// name a known category; items without one are classified first,
    /// outside the transaction.
    pub async fn create(&self, user_id: i64, items: Vec<NewExpense>) -> AppResult<Vec<Expense>> {
        if items.is_empty() {
            return Err(AppError::Validation("at least one expense is required".into()));
        }
        for item in &items {
            validate_name(&item.name)?;
            validate_amount(item.amount)?;
        }

        let items = self.fill_categories(items).await?;
        let now = now_local();

        let mut tx = WriteTx::begin(&self.pool).await?;
        let mut created = Vec::with_capacity(items.len());
        for item in &items {
            let expense = match queries::insert_expense(
                &mut *tx,
                user_id,
                item.name.trim(),
                item.amount,
                item.category_id,
                item.spent_at.unwrap_or(now),
                now,
            )
            .await
            {
                Ok(expense) => expense,
                // category removed between the check and the insert
                Err(err) if AppError::is_foreign_key_violation(&err) => {
                    return Err(unknown_category(item.category_id))
                }
                Err(err) => return Err(err.into()),
            };
            self.ledger.on_expense_created(&mut *tx, &expense, now).await?;
            created.push(expense);
        }
        tx.commit().await?;

        info!("created {} expenses for user {}", created.len(), user_id);
        self.notifier.notify_user(user_id).await;
        Ok(created)
    }

    async fn fill_categories(&self, mut items: Vec<NewExpense>) -> AppResult<Vec<NewExpense>> {
        let unclassified = items.iter().any(|item| item.category_id.is_none());
        let classifier = self.classifier.as_ref().filter(|_| unclassified);
        if classifier.is_none() && items.iter().all(|item| item.category_id.is_none()) {
            return Ok(items);
        }

        let categories = {
            let mut conn = self.pool.acquire().await?;
            queries::get_all_categories(&mut conn).await?
        };
        let known = |id: &i64| categories.iter().any(|c| c.category_id == *id);
        if let Some(id) = items.iter().filter_map(|item| item.category_id).find(|id| !known(id)) {
            return Err(unknown_category(Some(id)));
        }

        if let Some(classifier) = classifier {
            for item in items.iter_mut().filter(|item| item.category_id.is_none()) {
                item.category_id = self
                    .classify(classifier.as_ref(), &item.name, &categories)
                    .await
                    .filter(known);
            }
        }
        Ok(items)
    }

    async fn classify(
        &self,
        classifier: &dyn CategoryClassifier,
        name: &str,
        categories: &[Category],
    ) -> Option<i64> {
        match tokio::time::timeout(self.classify_timeout, classifier.classify(name, categories)).await {
            Ok(Ok(id)) => id,
            Ok(Err(err)) => {
                warn!("category classification failed for {:?}: {}", name, err);
                None
            }
            Err(_) => {
                warn!("category classification timed out for {:?}", name);
                None
            }
        }
    }

    pub async fn get(&self, user_id: i64, expense_id: i64) -> AppResult<Expense> {
        let mut conn = self.pool.acquire().await?;
        queries::get_expense(&mut conn, user_id, expense_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Expense not found".into()))
    }

    /// Partial update. `None` when the expense does not exist for this user.
    pub async fn update(
        &self,
        user_id: i64,
        expense_id: i64,
        patch: &ExpensePatch,
    ) -> AppResult<Option<Expense>> {
        if let Some(name) = patch.name.as_deref() {
            validate_name(name)?;
        }
        if let Some(amount) = patch.amount {
            validate_amount(amount)?;
        }
        let patch = ExpensePatch {
            name: patch.name.as_deref().map(|n| n.trim().to_string()),
            ..patch.clone()
        };
        let now = now_local();

        let mut tx = WriteTx::begin(&self.pool).await?;
        let Some(before) = queries::get_expense(&mut *tx, user_id, expense_id).await? else {
            return Ok(None);
        };
        let Some(after) = queries::update_expense(&mut *tx, user_id, expense_id, &patch, now).await?
        else {
            return Ok(None);
        };
        self.ledger.on_expense_updated(&mut *tx, &before, &after, now).await?;
        self.ledger.recompute_in(&mut *tx, user_id, now).await?;
        tx.commit().await?;

        self.notifier.notify_user(user_id).await;
        Ok(Some(after))
    }

    /// `false` when the expense does not exist for this user.
    pub async fn delete(&self, user_id: i64, expense_id: i64) -> AppResult<bool> {
        let now = now_local();

        let mut tx = WriteTx::begin(&self.pool).await?;
        let Some(deleted) = queries::delete_expense(&mut *tx, user_id, expense_id).await? else {
            return Ok(false);
        };
        self.ledger.on_expense_deleted(&mut *tx, &deleted, now).await?;
        self.ledger.recompute_in(&mut *tx, user_id, now).await?;
        tx.commit().await?;

        self.notifier.notify_user(user_id).await;
        Ok(true)
    }

    pub async fn list(&self, user_id: i64, query: &ExpenseQuery) -> AppResult<ExpensePage> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}, got {limit}"
            )));
        }
        let offset = query.offset.unwrap_or(0);
        if offset < 0 {
            return Err(AppError::Validation(format!("offset must not be negative, got {offset}")));
        }
        if let (Some(min), Some(max)) = (query.min_amount, query.max_amount) {
            if min > max {
                return Err(AppError::Validation("min_amount is greater than max_amount".into()));
            }
        }
        if let (Some(start), Some(end)) = (query.start_date, query.end_date) {
            if start.start() > end.end() {
                return Err(AppError::Validation("start_date is after end_date".into()));
            }
        }

        let mut conn = self.pool.acquire().await?;
        let (data, total, total_expenses) =
            queries::list_expenses(&mut conn, user_id, query, limit, offset).await?;

        Ok(ExpensePage {
            data,
            meta: PageMeta::new(total, limit, offset),
            total_expenses,
        })
    }
}
