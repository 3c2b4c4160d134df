use sqlx::{Pool, Sqlite};

use crate::database::db::queries;
use crate::error::AppResult;

/// Applies the embedded migrations and seeds the fixed categories.
pub async fn run_migrations(pool: &Pool<Sqlite>) -> AppResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    let mut conn = pool.acquire().await?;
    queries::seed_fixed_categories(&mut conn).await?;
    Ok(())
}
