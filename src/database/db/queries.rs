use chrono::{NaiveDateTime, NaiveTime};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::database::models::expense::end_of_day;
use crate::database::models::{
    BudgetConfig, BudgetPatch, Category, Expense, ExpenseListItem, ExpensePatch, ExpenseQuery,
    NewBudget, PeriodCounter, SortOrder,
};
use crate::limits::ledger::ActiveLimit;
use crate::limits::period::Period;

/*
All SQL of the service lives here. Every function takes a connection so the
same query can run on a pooled connection or inside a transaction
(`&mut *tx`).
 */

const FIXED_CATEGORIES: [(&str, &str); 10] = [
    ("Food & Drinks", "Meals, groceries and drinks"),
    ("Tickets", "Travel and event tickets"),
    ("Shopping", "Clothes, gadgets and other purchases"),
    ("Health", "Medicine, doctors and fitness"),
    ("Entertainment", "Movies, games and going out"),
    ("Education", "Courses, books and tuition"),
    ("Electricity & Water", "Utility bills"),
    ("House", "Rent, repairs and furniture"),
    ("Debt", "Loan and credit repayments"),
    ("Insurance", "Insurance premiums"),
];

 /*==========Category Queries=========== */

pub async fn seed_fixed_categories(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for (name, description) in FIXED_CATEGORIES {
        sqlx::query(
            r#"
            INSERT INTO categories (category_name, description)
            VALUES (?, ?)
            ON CONFLICT(category_name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(description)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn get_all_categories(conn: &mut SqliteConnection) -> Result<Vec<Category>, sqlx::Error> {
    sqlx::query_as::<_, Category>("SELECT * FROM categories ORDER BY category_name ASC")
        .fetch_all(conn)
        .await
}

 /*==========Spending Limit Queries=========== */

pub async fn find_active_budget(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Option<BudgetConfig>, sqlx::Error> {
    sqlx::query_as::<_, BudgetConfig>(
        r#"
        SELECT * FROM spending_limit
        WHERE user_id = ? AND is_active = 1
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await
}

pub async fn find_budget(
    conn: &mut SqliteConnection,
    user_id: i64,
    budget_id: i64,
) -> Result<Option<BudgetConfig>, sqlx::Error> {
    sqlx::query_as::<_, BudgetConfig>(
        "SELECT * FROM spending_limit WHERE spending_limit_id = ? AND user_id = ?",
    )
    .bind(budget_id)
    .bind(user_id)
    .fetch_optional(conn)
    .await
}

pub async fn insert_budget(
    conn: &mut SqliteConnection,
    user_id: i64,
    budget: &NewBudget,
    now: NaiveDateTime,
) -> Result<BudgetConfig, sqlx::Error> {
    sqlx::query_as::<_, BudgetConfig>(
        r#"
        INSERT INTO spending_limit
            (user_id, period, amount, alert_percentage, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, 1, ?, ?)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(budget.period)
    .bind(budget.amount)
    .bind(budget.alert_percentage)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await
}

/// Applies the non-empty fields of `patch`. `None` when no row matched.
pub async fn update_budget(
    conn: &mut SqliteConnection,
    user_id: i64,
    budget_id: i64,
    patch: &BudgetPatch,
    now: NaiveDateTime,
) -> Result<Option<BudgetConfig>, sqlx::Error> {
    sqlx::query_as::<_, BudgetConfig>(
        r#"
        UPDATE spending_limit
        SET period           = COALESCE(?, period),
            amount           = COALESCE(?, amount),
            alert_percentage = COALESCE(?, alert_percentage),
            updated_at       = ?
        WHERE spending_limit_id = ? AND user_id = ?
        RETURNING *
        "#,
    )
    .bind(patch.period)
    .bind(patch.amount)
    .bind(patch.alert_percentage)
    .bind(now)
    .bind(budget_id)
    .bind(user_id)
    .fetch_optional(conn)
    .await
}

pub async fn delete_budget(
    conn: &mut SqliteConnection,
    user_id: i64,
    budget_id: i64,
) -> Result<bool, sqlx::Error> {
    // periode_limit rows go with it (ON DELETE CASCADE)
    let result = sqlx::query("DELETE FROM spending_limit WHERE spending_limit_id = ? AND user_id = ?")
        .bind(budget_id)
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

 /*==========Periode Limit Queries=========== */

pub async fn insert_counter(
    conn: &mut SqliteConnection,
    user_id: i64,
    budget_id: i64,
    (start, end): (NaiveDateTime, NaiveDateTime),
    current_spending: i64,
    now: NaiveDateTime,
) -> Result<PeriodCounter, sqlx::Error> {
    sqlx::query_as::<_, PeriodCounter>(
        r#"
        INSERT INTO periode_limit
            (user_id, spending_limit_id, periode_start, periode_end, current_spending, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(budget_id)
    .bind(start)
    .bind(end)
    .bind(current_spending)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await
}

/// Counters of the user's active configuration, with its period.
pub async fn counters_for_user(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Vec<(PeriodCounter, Period)>, sqlx::Error> {
    #[derive(sqlx::FromRow)]
    struct Row {
        #[sqlx(flatten)]
        counter: PeriodCounter,
        period: Period,
    }

    let rows = sqlx::query_as::<_, Row>(
        r#"
        SELECT pl.*, sl.period
        FROM periode_limit pl
        JOIN spending_limit sl ON sl.spending_limit_id = pl.spending_limit_id
        WHERE pl.user_id = ? AND sl.is_active = 1
        "#,
    )
    .bind(user_id)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|r| (r.counter, r.period)).collect())
}

pub async fn set_counter(
    conn: &mut SqliteConnection,
    counter_id: i64,
    (start, end): (NaiveDateTime, NaiveDateTime),
    current_spending: i64,
    now: NaiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE periode_limit
        SET periode_start = ?, periode_end = ?, current_spending = ?, updated_at = ?
        WHERE periode_limit_id = ?
        "#,
    )
    .bind(start)
    .bind(end)
    .bind(current_spending)
    .bind(now)
    .bind(counter_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Atomic `current_spending += delta` on the counter whose window holds both
/// `now` and `spent_at`. Returns the number of counters touched.
pub async fn add_to_counter(
    conn: &mut SqliteConnection,
    user_id: i64,
    delta: i64,
    spent_at: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE periode_limit
        SET current_spending = current_spending + ?,
            updated_at = ?
        WHERE user_id = ?
          AND periode_start <= ? AND periode_end >= ?
          AND periode_start <= ? AND periode_end >= ?
          AND spending_limit_id IN (
              SELECT spending_limit_id FROM spending_limit WHERE is_active = 1
          )
        "#,
    )
    .bind(delta)
    .bind(now)
    .bind(user_id)
    .bind(now)
    .bind(now)
    .bind(spent_at)
    .bind(spent_at)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn active_limit(
    conn: &mut SqliteConnection,
    user_id: i64,
    now: NaiveDateTime,
) -> Result<Option<ActiveLimit>, sqlx::Error> {
    sqlx::query_as::<_, ActiveLimit>(
        r#"
        SELECT
            sl.spending_limit_id AS budget_config_id,
            sl.period            AS period,
            pl.current_spending  AS current_spending,
            sl.amount            AS max_limit,
            sl.alert_percentage  AS alert_percentage,
            pl.periode_start     AS periode_start,
            pl.periode_end       AS periode_end
        FROM periode_limit pl
        JOIN spending_limit sl ON sl.spending_limit_id = pl.spending_limit_id
        WHERE pl.user_id = ?
          AND sl.is_active = 1
          AND pl.periode_start <= ?
          AND pl.periode_end >= ?
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(now)
    .bind(now)
    .fetch_optional(conn)
    .await
}

 /*==========Expense Queries=========== */

/// Sum of the user's expenses with `spent_at` in `[start, end]`.
pub async fn sum_expenses_between(
    conn: &mut SqliteConnection,
    user_id: i64,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COALESCE(SUM(amount), 0)
        FROM expenses
        WHERE user_id = ? AND spent_at >= ? AND spent_at <= ?
        "#,
    )
    .bind(user_id)
    .bind(start)
    .bind(end)
    .fetch_one(conn)
    .await
}

pub async fn insert_expense(
    conn: &mut SqliteConnection,
    user_id: i64,
    name: &str,
    amount: i64,
    category_id: Option<i64>,
    spent_at: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<Expense, sqlx::Error> {
    sqlx::query_as::<_, Expense>(
        r#"
        INSERT INTO expenses (user_id, category_id, name, amount, spent_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(category_id)
    .bind(name)
    .bind(amount)
    .bind(spent_at)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await
}

pub async fn get_expense(
    conn: &mut SqliteConnection,
    user_id: i64,
    expense_id: i64,
) -> Result<Option<Expense>, sqlx::Error> {
    sqlx::query_as::<_, Expense>("SELECT * FROM expenses WHERE expense_id = ? AND user_id = ?")
        .bind(expense_id)
        .bind(user_id)
        .fetch_optional(conn)
        .await
}

pub async fn update_expense(
    conn: &mut SqliteConnection,
    user_id: i64,
    expense_id: i64,
    patch: &ExpensePatch,
    now: NaiveDateTime,
) -> Result<Option<Expense>, sqlx::Error> {
    sqlx::query_as::<_, Expense>(
        r#"
        UPDATE expenses
        SET name       = COALESCE(?, name),
            amount     = COALESCE(?, amount),
            spent_at   = COALESCE(?, spent_at),
            updated_at = ?
        WHERE expense_id = ? AND user_id = ?
        RETURNING *
        "#,
    )
    .bind(patch.name.as_deref())
    .bind(patch.amount)
    .bind(patch.spent_at)
    .bind(now)
    .bind(expense_id)
    .bind(user_id)
    .fetch_optional(conn)
    .await
}

pub async fn delete_expense(
    conn: &mut SqliteConnection,
    user_id: i64,
    expense_id: i64,
) -> Result<Option<Expense>, sqlx::Error> {
    sqlx::query_as::<_, Expense>(
        "DELETE FROM expenses WHERE expense_id = ? AND user_id = ? RETURNING *",
    )
    .bind(expense_id)
    .bind(user_id)
    .fetch_optional(conn)
    .await
}

fn push_expense_filters<'a>(qb: &mut QueryBuilder<'a, Sqlite>, user_id: i64, q: &'a ExpenseQuery) {
    qb.push(" WHERE e.user_id = ").push_bind(user_id);
    if let Some(category_id) = q.category_id {
        qb.push(" AND e.category_id = ").push_bind(category_id);
    }
    if let Some(category) = q.category.as_deref().filter(|c| !c.trim().is_empty()) {
        qb.push(" AND e.category_id = (SELECT category_id FROM categories WHERE category_name = ")
            .push_bind(category.trim())
            .push(")");
    }
    if let Some(name) = q.name.as_deref().filter(|n| !n.trim().is_empty()) {
        qb.push(" AND LOWER(e.name) LIKE '%' || LOWER(")
            .push_bind(name)
            .push(") || '%'");
    }
    if let Some(min) = q.min_amount {
        qb.push(" AND e.amount >= ").push_bind(min);
    }
    if let Some(max) = q.max_amount {
        qb.push(" AND e.amount <= ").push_bind(max);
    }
    if let Some(start) = q.start_date {
        qb.push(" AND e.spent_at >= ").push_bind(start.start());
    }
    if let Some(end) = q.end_date {
        qb.push(" AND e.spent_at <= ").push_bind(end.end());
    }
    if let Some(day) = q.date {
        qb.push(" AND e.spent_at >= ")
            .push_bind(day.and_time(NaiveTime::MIN))
            .push(" AND e.spent_at <= ")
            .push_bind(end_of_day(day));
    }
}

/// One page of expenses plus the count and amount total of every match.
pub async fn list_expenses(
    conn: &mut SqliteConnection,
    user_id: i64,
    q: &ExpenseQuery,
    limit: i64,
    offset: i64,
) -> Result<(Vec<ExpenseListItem>, i64, i64), sqlx::Error> {
    let mut totals = QueryBuilder::<Sqlite>::new(
        "SELECT COUNT(*), COALESCE(SUM(e.amount), 0) FROM expenses e",
    );
    push_expense_filters(&mut totals, user_id, q);
    let (count, amount) = totals
        .build_query_as::<(i64, i64)>()
        .fetch_one(&mut *conn)
        .await?;

    let mut page = QueryBuilder::<Sqlite>::new(
        r#"
        SELECT e.expense_id, e.name, e.amount, c.category_name AS category,
               e.spent_at, e.created_at, e.updated_at
        FROM expenses e
        LEFT JOIN categories c ON c.category_id = e.category_id
        "#,
    );
    push_expense_filters(&mut page, user_id, q);
    let direction = match q.sort.unwrap_or_default() {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    page.push(format!(
        " ORDER BY {} {}, e.expense_id {}",
        q.order_by.unwrap_or_default().column(),
        direction,
        direction
    ));
    page.push(" LIMIT ").push_bind(limit);
    page.push(" OFFSET ").push_bind(offset);

    let items = page.build_query_as::<ExpenseListItem>().fetch_all(&mut *conn).await?;
    Ok((items, count, amount))
}
