use chrono::{Days, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(FromRow, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    #[sqlx(rename = "expense_id")]
    pub id: i64,
    pub user_id: i64,
    pub category_id: Option<i64>,
    pub name: String,
    pub amount: i64,
    pub spent_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Listing row, joined with the category name.
#[derive(FromRow, Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseListItem {
    #[sqlx(rename = "expense_id")]
    pub id: i64,
    pub name: String,
    pub amount: i64,
    pub category: Option<String>,
    pub spent_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewExpense {
    pub name: String,
    pub amount: i64,
    pub category_id: Option<i64>,
    pub spent_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpensePatch {
    pub name: Option<String>,
    pub amount: Option<i64>,
    pub spent_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpenseOrder {
    Name,
    Amount,
    SpentAt,
    #[default]
    CreatedAt,
    UpdatedAt,
}

impl ExpenseOrder {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Name => "e.name",
            Self::Amount => "e.amount",
            Self::SpentAt => "e.spent_at",
            Self::CreatedAt => "e.created_at",
            Self::UpdatedAt => "e.updated_at",
        }
    }
}

/// A listing range bound: a full timestamp, or a plain date that stands for
/// the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DateBound {
    At(NaiveDateTime),
    Day(NaiveDate),
}

impl DateBound {
    /// As a lower bound: a plain date starts at midnight.
    pub fn start(self) -> NaiveDateTime {
        match self {
            Self::At(at) => at,
            Self::Day(day) => day.and_time(NaiveTime::MIN),
        }
    }

    /// As an upper bound: a plain date runs through 23:59:59.999.
    pub fn end(self) -> NaiveDateTime {
        match self {
            Self::At(at) => at,
            Self::Day(day) => end_of_day(day),
        }
    }
}

pub fn end_of_day(day: NaiveDate) -> NaiveDateTime {
    (day + Days::new(1)).and_time(NaiveTime::MIN) - Duration::milliseconds(1)
}

/// Listing options: paging, ordering and filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpenseQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort: Option<SortOrder>,
    pub order_by: Option<ExpenseOrder>,
    pub category_id: Option<i64>,
    /// Category name; an unknown name matches nothing.
    pub category: Option<String>,
    pub name: Option<String>,
    pub min_amount: Option<i64>,
    pub max_amount: Option<i64>,
    pub start_date: Option<DateBound>,
    pub end_date: Option<DateBound>,
    /// Only expenses spent on this day.
    pub date: Option<NaiveDate>,
}
