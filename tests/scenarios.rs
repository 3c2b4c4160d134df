mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use common::{at, budget, memory_pool, test_config};
use spending_alerts::backend::AppState;
use spending_alerts::config::Config;
use spending_alerts::database::models::{Category, ExpensePatch, ExpenseQuery, NewExpense};
use spending_alerts::enrich::{AlertMessageGenerator, CategoryClassifier};
use spending_alerts::error::{AppError, AppResult};
use spending_alerts::expenses::ExpenseService;
use spending_alerts::limits::{AlertEvaluator, LimitLedger, Period, SpendingNotifier};
use spending_alerts::notify::{NotificationRegistry, NotificationSource, SessionEvent, StreamingSession};

const USER: i64 = 7;

async fn state() -> AppState {
    AppState::new(memory_pool().await, &test_config()).unwrap()
}

fn expense(name: &str, amount: i64) -> NewExpense {
    NewExpense {
        name: name.into(),
        amount,
        category_id: None,
        spent_at: None,
    }
}

#[tokio::test]
async fn scenario_a_crossing_the_threshold_alerts() {
    let state = state().await;
    state.ledger.create(USER, &budget(Period::Weekly, 1000, 75)).await.unwrap();

    state.expenses.create(USER, vec![expense("groceries", 800)]).await.unwrap();

    let status = state.notifier.status(USER).await.unwrap();
    assert_eq!(status.current_spending, 800);
    assert_eq!(status.current_percentage, 80.0);
    assert!(status.is_alert);
}

#[tokio::test]
async fn scenario_b_below_the_threshold_is_quiet() {
    let state = state().await;
    state.ledger.create(USER, &budget(Period::Weekly, 1000, 75)).await.unwrap();

    state.expenses.create(USER, vec![expense("groceries", 500)]).await.unwrap();

    let status = state.notifier.status(USER).await.unwrap();
    assert_eq!(status.current_percentage, 50.0);
    assert!(!status.is_alert);
}

#[tokio::test]
async fn scenario_c_deleting_the_expense_resets_spend() {
    let state = state().await;
    state.ledger.create(USER, &budget(Period::Weekly, 1000, 75)).await.unwrap();
    let created = state.expenses.create(USER, vec![expense("groceries", 800)]).await.unwrap();

    assert!(state.expenses.delete(USER, created[0].id).await.unwrap());
    assert_eq!(state.ledger.recompute(USER).await.unwrap(), Some(0));

    let status = state.notifier.status(USER).await.unwrap();
    assert_eq!(status.current_spending, 0);
    assert_eq!(status.current_percentage, 0.0);
    assert!(!status.is_alert);
}

async fn open_session(state: &AppState) -> mpsc::Receiver<SessionEvent> {
    let (tx, mut rx) = mpsc::channel(16);
    let session = StreamingSession::new(USER, Duration::from_secs(30));
    let notifier = state.notifier.clone();
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move { session.run(&notifier, tx, shutdown).await });

    assert_eq!(rx.recv().await.unwrap().name(), "connected");
    // current status, pushed to this subscriber only
    let initial = rx.recv().await.unwrap();
    assert_eq!(initial.name(), "notification");
    rx
}

#[tokio::test]
async fn scenario_d_every_session_gets_the_same_notification() {
    let state = state().await;
    state.ledger.create(USER, &budget(Period::Weekly, 1000, 75)).await.unwrap();

    let mut first = open_session(&state).await;
    let mut second = open_session(&state).await;
    assert_eq!(state.registry.subscriber_count(USER), 2);
    // opening the second session did not disturb the first
    assert!(first.try_recv().is_err());

    state.expenses.create(USER, vec![expense("concert", 800)]).await.unwrap();

    let a = first.recv().await.unwrap();
    let b = second.recv().await.unwrap();
    assert_eq!(a, b);
    let SessionEvent::Notification(n) = a else {
        panic!("expected a notification");
    };
    assert_eq!(n.user_id, USER);
    assert_eq!(n.current_spending, 800);
    assert!(n.is_alert);

    assert!(first.try_recv().is_err());
    assert!(second.try_recv().is_err());

    state.shutdown.cancel();
    assert!(first.recv().await.is_none());
    assert!(second.recv().await.is_none());
}

#[tokio::test]
async fn sessions_of_other_users_are_not_notified() {
    let state = state().await;
    state.ledger.create(USER, &budget(Period::Weekly, 1000, 75)).await.unwrap();
    let mut rx = open_session(&state).await;

    state.ledger.create(USER + 1, &budget(Period::Weekly, 1000, 75)).await.unwrap();
    state.expenses.create(USER + 1, vec![expense("rent", 900)]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn update_keeps_counter_consistent() {
    let state = state().await;
    state.ledger.create(USER, &budget(Period::Weekly, 1000, 75)).await.unwrap();
    let created = state
        .expenses
        .create(USER, vec![expense("a", 100), expense("b", 200)])
        .await
        .unwrap();

    let patch = ExpensePatch {
        amount: Some(650),
        ..Default::default()
    };
    let updated = state.expenses.update(USER, created[1].id, &patch).await.unwrap().unwrap();
    assert_eq!(updated.amount, 650);
    assert_eq!(updated.name, "b");

    let status = state.notifier.status(USER).await.unwrap();
    assert_eq!(status.current_spending, 750);
    assert!(status.is_alert);
}

#[tokio::test]
async fn expenses_are_scoped_to_their_owner() {
    let state = state().await;
    let created = state.expenses.create(USER, vec![expense("lunch", 12)]).await.unwrap();
    let id = created[0].id;

    assert!(matches!(state.expenses.get(USER + 1, id).await, Err(AppError::NotFound(_))));
    let patch = ExpensePatch {
        amount: Some(1),
        ..Default::default()
    };
    assert!(state.expenses.update(USER + 1, id, &patch).await.unwrap().is_none());
    assert!(!state.expenses.delete(USER + 1, id).await.unwrap());

    assert_eq!(state.expenses.get(USER, id).await.unwrap().amount, 12);
}

#[tokio::test]
async fn invalid_expenses_are_rejected() {
    let state = state().await;

    for bad in [vec![], vec![expense("  ", 10)], vec![expense("ok", 5), expense("neg", -1)]] {
        assert!(matches!(
            state.expenses.create(USER, bad).await,
            Err(AppError::Validation(_))
        ));
    }
    // nothing from the rejected batches was stored
    let page = state.expenses.list(USER, &ExpenseQuery::default()).await.unwrap();
    assert_eq!(page.meta.total, 0);
}

#[tokio::test]
async fn list_filters_sorts_and_pages() {
    let state = state().await;
    let items = (1..=12)
        .map(|i| NewExpense {
            name: format!("item {i}"),
            amount: i * 10,
            category_id: Some(if i % 2 == 0 { 1 } else { 2 }),
            spent_at: None,
        })
        .collect();
    state.expenses.create(USER, items).await.unwrap();

    let page = state.expenses.list(USER, &ExpenseQuery::default()).await.unwrap();
    assert_eq!(page.data.len(), 10);
    assert_eq!(page.meta.total, 12);
    assert_eq!(page.meta.total_pages, 2);
    assert_eq!(page.total_expenses, (1..=12).map(|i| i * 10).sum::<i64>());

    let query: ExpenseQuery = serde_json::from_value(serde_json::json!({
        "category_id": 1,
        "min_amount": 40,
        "order_by": "amount",
        "sort": "asc",
        "limit": 2,
        "offset": 2,
    }))
    .unwrap();
    let page = state.expenses.list(USER, &query).await.unwrap();
    // even amounts >= 40: 40, 60, 80, 100, 120
    assert_eq!(page.meta.total, 5);
    assert_eq!(page.meta.page, 2);
    assert_eq!(page.total_expenses, 400);
    let amounts: Vec<i64> = page.data.iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![80, 100]);
    assert_eq!(page.data[0].category.as_deref(), Some("Food & Drinks"));

    let by_name = ExpenseQuery {
        name: Some("ITEM 1".into()),
        ..Default::default()
    };
    // item 1, 10, 11, 12
    assert_eq!(state.expenses.list(USER, &by_name).await.unwrap().meta.total, 4);

    let bad = ExpenseQuery {
        limit: Some(0),
        ..Default::default()
    };
    assert!(matches!(state.expenses.list(USER, &bad).await, Err(AppError::Validation(_))));

    let tickets: ExpenseQuery =
        serde_json::from_value(serde_json::json!({ "category": "Tickets" })).unwrap();
    let page = state.expenses.list(USER, &tickets).await.unwrap();
    // odd items
    assert_eq!(page.meta.total, 6);
    assert!(page.data.iter().all(|e| e.category.as_deref() == Some("Tickets")));

    let unknown: ExpenseQuery =
        serde_json::from_value(serde_json::json!({ "category": "Groceries" })).unwrap();
    let page = state.expenses.list(USER, &unknown).await.unwrap();
    assert_eq!(page.meta.total, 0);
    assert_eq!(page.total_expenses, 0);
    assert!(page.data.is_empty());

    let dated = vec![
        NewExpense {
            spent_at: Some(at(2024, 5, 1, 23)),
            ..expense("late dinner", 5)
        },
        NewExpense {
            spent_at: Some(at(2024, 5, 2, 0)),
            ..expense("midnight taxi", 7)
        },
    ];
    state.expenses.create(USER, dated).await.unwrap();

    let list_json = |value: serde_json::Value| {
        let query: ExpenseQuery = serde_json::from_value(value).unwrap();
        let expenses = state.expenses.clone();
        async move { expenses.list(USER, &query).await.unwrap() }
    };

    let page = list_json(serde_json::json!({ "date": "2024-05-01" })).await;
    assert_eq!(page.meta.total, 1);
    assert_eq!(page.data[0].name, "late dinner");

    // a plain end date covers its whole day
    let page = list_json(serde_json::json!({ "start_date": "2024-05-01", "end_date": "2024-05-01" })).await;
    assert_eq!(page.meta.total, 1);
    assert_eq!(page.total_expenses, 5);

    let page =
        list_json(serde_json::json!({ "start_date": "2024-05-01T23:30:00", "end_date": "2024-05-02" })).await;
    assert_eq!(page.meta.total, 1);
    assert_eq!(page.data[0].name, "midnight taxi");

    let reversed: ExpenseQuery = serde_json::from_value(
        serde_json::json!({ "start_date": "2024-05-02", "end_date": "2024-05-01T12:00:00" }),
    )
    .unwrap();
    assert!(matches!(state.expenses.list(USER, &reversed).await, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn unknown_category_id_is_a_validation_error() {
    let state = state().await;
    state.ledger.create(USER, &budget(Period::Monthly, 1000, 75)).await.unwrap();

    let bad = NewExpense {
        category_id: Some(999),
        ..expense("mystery", 40)
    };
    let err = state
        .expenses
        .create(USER, vec![expense("fine", 10), bad])
        .await
        .unwrap_err();
    match err {
        AppError::Validation(msg) => assert!(msg.contains("999"), "{msg}"),
        other => panic!("expected a validation error, got {other:?}"),
    }

    // the whole batch was refused and the counter did not move
    let page = state.expenses.list(USER, &ExpenseQuery::default()).await.unwrap();
    assert_eq!(page.meta.total, 0);
    assert_eq!(state.notifier.status(USER).await.unwrap().current_spending, 0);
}

#[tokio::test]
async fn zero_heartbeat_is_refused() {
    let config = Config {
        heartbeat_every: Duration::ZERO,
        ..test_config()
    };
    assert!(matches!(
        AppState::new(memory_pool().await, &config),
        Err(AppError::Validation(_))
    ));
}

/// Blocks its first call until released; later calls answer at once.
#[derive(Default)]
struct SlowFirstMessage {
    calls: AtomicUsize,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl AlertMessageGenerator for SlowFirstMessage {
    async fn alert_message(
        &self,
        _alert_percentage: i64,
        current_percentage: f64,
        _period: Period,
    ) -> AppResult<Option<String>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(Some(format!("at {current_percentage}%")))
    }
}

#[tokio::test]
async fn slow_initial_status_never_overwrites_a_newer_publish() {
    let pool = memory_pool().await;
    let ledger = LimitLedger::new(pool.clone());
    ledger.create(USER, &budget(Period::Monthly, 1000, 75)).await.unwrap();

    let generator = Arc::new(SlowFirstMessage::default());
    let message: Arc<dyn AlertMessageGenerator> = generator.clone();
    let evaluator = AlertEvaluator::new(Some(message), Duration::from_secs(5));
    let registry = NotificationRegistry::new(Duration::from_secs(1));
    let notifier = SpendingNotifier::new(ledger.clone(), evaluator, registry);
    let expenses = ExpenseService::new(pool, ledger, notifier.clone());

    let (tx, mut rx) = mpsc::channel(8);
    let _subscription = notifier.subscribe(USER, Arc::new(tx));
    // the initial status (spend 0) is now stuck in enrichment
    generator.entered.notified().await;

    expenses.create(USER, vec![expense("rent", 800)]).await.unwrap();
    generator.release.notify_one();

    let first = rx.recv().await.unwrap();
    assert_eq!(first.current_spending, 800);
    assert!(first.is_alert);

    // the superseded snapshot is dropped rather than delivered late
    let late = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(late.is_err(), "stale status delivered: {late:?}");
}

struct AlwaysFood;

#[async_trait]
impl CategoryClassifier for AlwaysFood {
    async fn classify(&self, _text: &str, candidates: &[Category]) -> AppResult<Option<i64>> {
        Ok(candidates
            .iter()
            .find(|c| c.category_name == "Food & Drinks")
            .map(|c| c.category_id))
    }
}

struct Broken;

#[async_trait]
impl CategoryClassifier for Broken {
    async fn classify(&self, _text: &str, _candidates: &[Category]) -> AppResult<Option<i64>> {
        Err(AppError::Unavailable("offline".into()))
    }
}

#[tokio::test]
async fn uncategorised_expenses_are_classified() {
    let state = state().await;
    let service = ExpenseService::new(state.db.clone(), state.ledger.clone(), state.notifier.clone())
        .with_classifier(Arc::new(AlwaysFood), Duration::from_secs(1));

    let mut explicit = expense("train", 30);
    explicit.category_id = Some(2);
    let created = service.create(USER, vec![expense("pizza", 15), explicit]).await.unwrap();

    assert_eq!(created[0].category_id, Some(1));
    assert_eq!(created[1].category_id, Some(2));
}

#[tokio::test]
async fn classifier_failure_leaves_category_empty() {
    let state = state().await;
    let service = ExpenseService::new(state.db.clone(), state.ledger.clone(), state.notifier.clone())
        .with_classifier(Arc::new(Broken), Duration::from_secs(1));

    let created = service.create(USER, vec![expense("pizza", 15)]).await.unwrap();
    assert_eq!(created[0].category_id, None);
}

#[tokio::test]
async fn shutdown_closes_open_sessions() {
    let state = state().await;
    let (tx, mut rx) = mpsc::channel(16);
    let session = StreamingSession::new(USER, Duration::from_secs(30));
    let task = {
        let session = Arc::clone(&session);
        let notifier = state.notifier.clone();
        let shutdown: CancellationToken = state.shutdown.clone();
        tokio::spawn(async move { session.run(&notifier, tx, shutdown).await })
    };
    assert_eq!(rx.recv().await.unwrap().name(), "connected");

    state.shutdown.cancel();
    state.registry.shutdown();
    task.await.unwrap();

    assert!(rx.recv().await.is_none());
    assert_eq!(state.registry.total_subscribers(), 0);
}
