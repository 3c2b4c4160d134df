use serde::Serialize;
use sqlx::FromRow;

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Category {
    pub category_id: i64,
    pub category_name: String,
    pub description: Option<String>,
}
