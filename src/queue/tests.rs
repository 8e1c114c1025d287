use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use crate::request::{Priority, Queued, Request, RequestData, RequestId, RequestStatus};
use crate::storage::{InMemoryStore, Store};

use super::{CrashProofQueue, QueueConfig, Submission};

fn submission(priority: Priority, client: &str) -> Submission {
    Submission {
        payload: serde_json::json!({"prompt": "hello"}),
        task_kind: "chat".to_string(),
        client: client.to_string(),
        priority,
        timeout_s: None,
        max_retries: None,
    }
}

fn queue_with(
    max_concurrent: usize,
    max_waiting: usize,
    store: Arc<InMemoryStore>,
) -> Arc<CrashProofQueue<InMemoryStore>> {
    Arc::new(CrashProofQueue::new(
        "gemma",
        QueueConfig {
            max_concurrent,
            max_waiting,
            ..Default::default()
        },
        store,
    ))
}

#[tokio::test]
async fn priority_ordering_scenario() {
    // Five NORMAL then one HIGH; with a single worker slot the dispatch order
    // must be n1, h1, n2, n3, n4, n5.
    let queue = queue_with(1, 10, Arc::new(InMemoryStore::new()));

    for label in ["n1", "n2", "n3", "n4", "n5"] {
        queue
            .enqueue(submission(Priority::Normal, label))
            .await
            .unwrap();
    }
    queue.enqueue(submission(Priority::High, "h1")).await.unwrap();

    let mut order = Vec::new();
    for _ in 0..6 {
        let dispatched = queue.dequeue().await.expect("a request should be waiting");
        order.push(dispatched.data.client.clone());
        queue.complete(dispatched.data.id, None).await;
    }

    assert_eq!(order, vec!["n1", "h1", "n2", "n3", "n4", "n5"]);
    assert!(queue.dequeue().await.is_none());
}

#[tokio::test]
async fn admission_bound_scenario() {
    let queue = queue_with(1, 3, Arc::new(InMemoryStore::new()));

    for i in 0..3 {
        queue
            .enqueue(submission(Priority::Normal, &format!("c{i}")))
            .await
            .unwrap();
    }
    let rejected = queue.enqueue(submission(Priority::Normal, "c3")).await;
    assert!(matches!(
        rejected,
        Err(crate::error::GatewayError::QueueFull(_))
    ));

    let metrics = queue.metrics().await;
    assert_eq!(metrics.waiting, 3);
}

#[tokio::test]
async fn retry_budget_scenario() {
    // max_retries = 3 and a worker that always fails: dispatched exactly four
    // times, then terminally FAILED, counted once.
    let store = Arc::new(InMemoryStore::new());
    let queue = queue_with(1, 10, store.clone());

    let mut sub = submission(Priority::Normal, "flaky");
    sub.max_retries = Some(3);
    let id = queue.enqueue(sub).await.unwrap();

    let mut dispatches = 0;
    while let Some(dispatched) = queue.dequeue().await {
        assert_eq!(dispatched.data.id, id);
        dispatches += 1;
        queue.fail(id, "upstream exploded").await;
    }

    assert_eq!(dispatches, 4);
    let record = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("upstream exploded"));
    assert_eq!(queue.metrics().await.total_failed, 1);
}

#[tokio::test]
async fn requeued_request_loses_queue_position() {
    let queue = queue_with(1, 10, Arc::new(InMemoryStore::new()));
    let first = queue.enqueue(submission(Priority::Normal, "a")).await.unwrap();
    queue.enqueue(submission(Priority::Normal, "b")).await.unwrap();

    let dispatched = queue.dequeue().await.unwrap();
    assert_eq!(dispatched.data.id, first);
    queue.fail(first, "transient").await;

    // "a" went back behind "b".
    let next = queue.dequeue().await.unwrap();
    assert_eq!(next.data.client, "b");
}

#[tokio::test]
async fn timeout_scenario() {
    // An in-flight request past its deadline becomes TIMEOUT on the next
    // detection pass and is not re-queued.
    let store = Arc::new(InMemoryStore::new());
    let queue = queue_with(2, 10, store.clone());

    let data = RequestData {
        id: RequestId::new_v4(),
        backend: "gemma".to_string(),
        task_kind: "chat".to_string(),
        client: "slow".to_string(),
        payload: serde_json::json!({}),
        priority: Priority::Normal,
        created_at: Utc::now() - chrono::Duration::seconds(20),
        timeout_s: 1,
        max_retries: 3,
    };
    let id = data.id;
    let stale = Request {
        state: Queued {
            retries: 0,
            last_error: None,
        },
        data,
    }
    .dispatch(Utc::now() - chrono::Duration::seconds(10));
    queue.state.lock().await.processing.insert(id, stale);

    queue.expire_stale().await;

    let record = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::TimedOut);
    assert!(record.completed_at.is_some());
    let metrics = queue.metrics().await;
    assert_eq!(metrics.total_timeout, 1);
    assert_eq!(metrics.processing, 0);
    assert_eq!(metrics.waiting, 0, "timed-out requests are not re-queued");
}

#[tokio::test]
async fn timeout_loop_fires_without_worker_callbacks() {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(CrashProofQueue::new(
        "gemma",
        QueueConfig {
            max_concurrent: 1,
            max_waiting: 10,
            recovery_check_interval: Duration::from_millis(50),
            ..Default::default()
        },
        store.clone(),
    ));
    queue.start().await.unwrap();

    let data = RequestData {
        id: RequestId::new_v4(),
        backend: "gemma".to_string(),
        task_kind: "chat".to_string(),
        client: "slow".to_string(),
        payload: serde_json::json!({}),
        priority: Priority::Normal,
        created_at: Utc::now() - chrono::Duration::seconds(20),
        timeout_s: 1,
        max_retries: 3,
    };
    let id = data.id;
    let stale = Request {
        state: Queued {
            retries: 0,
            last_error: None,
        },
        data,
    }
    .dispatch(Utc::now() - chrono::Duration::seconds(10));
    queue.state.lock().await.processing.insert(id, stale);

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(queue.metrics().await.total_timeout, 1);
    queue.stop().await;
}

#[tokio::test]
async fn crash_recovery_scenario() {
    // A row persisted as PROCESSING by a previous process is recovered as
    // QUEUED with one retry consumed and shows up in the next dequeue.
    let store = Arc::new(InMemoryStore::new());

    let data = RequestData {
        id: RequestId::new_v4(),
        backend: "gemma".to_string(),
        task_kind: "chat".to_string(),
        client: "orphan".to_string(),
        payload: serde_json::json!({"prompt": "lost"}),
        priority: Priority::Normal,
        created_at: Utc::now() - chrono::Duration::minutes(5),
        timeout_s: 300,
        max_retries: 3,
    };
    let id = data.id;
    let in_flight = Request {
        state: Queued {
            retries: 0,
            last_error: None,
        },
        data,
    }
    .dispatch(Utc::now() - chrono::Duration::minutes(4));
    store.upsert(&in_flight.to_record()).await.unwrap();

    let queue = queue_with(1, 10, store.clone());
    queue.start().await.unwrap();

    let record = queue.status(id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Queued);
    assert_eq!(record.retries, 1);
    assert!(record.started_at.is_none());

    let dispatched = queue.dequeue().await.unwrap();
    assert_eq!(dispatched.data.id, id);
    assert_eq!(dispatched.state.retries, 1);
    queue.stop().await;
}

#[tokio::test]
async fn recovery_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let queue = queue_with(1, 10, store.clone());
    let id = queue.enqueue(submission(Priority::Normal, "a")).await.unwrap();

    let first = queue.recover_from_crash().await.unwrap();
    let second = queue.recover_from_crash().await.unwrap();
    assert_eq!(first, 0, "resident rows are skipped");
    assert_eq!(second, 0);
    assert_eq!(queue.metrics().await.waiting, 1);

    // The same holds for a row recovered from the store rather than memory.
    let other = queue_with(1, 10, store.clone());
    other.recover_from_crash().await.unwrap();
    other.recover_from_crash().await.unwrap();
    assert_eq!(other.metrics().await.waiting, 1);
    assert_eq!(
        other.dequeue().await.unwrap().data.id,
        id,
        "exactly one copy was recovered"
    );
}

#[tokio::test]
async fn recovery_fails_rows_with_spent_budget() {
    let store = Arc::new(InMemoryStore::new());

    let data = RequestData {
        id: RequestId::new_v4(),
        backend: "gemma".to_string(),
        task_kind: "chat".to_string(),
        client: "doomed".to_string(),
        payload: serde_json::json!({}),
        priority: Priority::Normal,
        created_at: Utc::now(),
        timeout_s: 300,
        max_retries: 1,
    };
    let id = data.id;
    let in_flight = Request {
        state: Queued {
            retries: 1,
            last_error: None,
        },
        data,
    }
    .dispatch(Utc::now());
    store.upsert(&in_flight.to_record()).await.unwrap();

    let queue = queue_with(1, 10, store.clone());
    queue.start().await.unwrap();

    assert_eq!(queue.metrics().await.waiting, 0);
    let record = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Failed);
    queue.stop().await;
}

#[tokio::test]
async fn transitions_are_persisted_before_acknowledgement() {
    let store = Arc::new(InMemoryStore::new());
    let queue = queue_with(1, 10, store.clone());

    let id = queue.enqueue(submission(Priority::Normal, "a")).await.unwrap();
    assert_eq!(
        store.find_by_id(id).await.unwrap().unwrap().status,
        RequestStatus::Queued
    );

    let dispatched = queue.dequeue().await.unwrap();
    let record = store.find_by_id(dispatched.data.id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Processing);
    assert!(record.started_at.is_some());

    queue.complete(id, Some(serde_json::json!({"answer": 42}))).await;
    let record = store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Completed);
    assert_eq!(record.result, Some(serde_json::json!({"answer": 42})));
}

#[tokio::test]
async fn completing_unknown_request_is_a_noop() {
    let queue = queue_with(1, 10, Arc::new(InMemoryStore::new()));
    queue.complete(RequestId::new_v4(), None).await;
    queue.fail(RequestId::new_v4(), "nope").await;
    let metrics = queue.metrics().await;
    assert_eq!(metrics.total_processed, 0);
    assert_eq!(metrics.total_failed, 0);
}

#[tokio::test]
async fn dequeue_respects_worker_slots() {
    let queue = queue_with(2, 10, Arc::new(InMemoryStore::new()));
    for i in 0..4 {
        queue
            .enqueue(submission(Priority::Normal, &format!("c{i}")))
            .await
            .unwrap();
    }

    let a = queue.dequeue().await.unwrap();
    let _b = queue.dequeue().await.unwrap();
    assert!(queue.dequeue().await.is_none(), "both slots are taken");

    let metrics = queue.metrics().await;
    assert_eq!(metrics.processing, 2);
    assert!((metrics.utilization - 1.0).abs() < f64::EPSILON);

    queue.complete(a.data.id, None).await;
    assert!(queue.dequeue().await.is_some());
}

#[tokio::test]
async fn state_survives_stop_and_restart() {
    let store = Arc::new(InMemoryStore::new());
    {
        let queue = queue_with(1, 10, store.clone());
        queue.start().await.unwrap();
        queue.enqueue(submission(Priority::High, "a")).await.unwrap();
        queue.enqueue(submission(Priority::Normal, "b")).await.unwrap();
        queue.stop().await;
    }

    let queue = queue_with(1, 10, store);
    queue.start().await.unwrap();
    let metrics = queue.metrics().await;
    assert_eq!(metrics.waiting, 2);
    assert_eq!(queue.dequeue().await.unwrap().data.client, "a");
    queue.stop().await;
}

#[tokio::test]
async fn cancel_removes_waiting_and_in_flight_requests() {
    let store = Arc::new(InMemoryStore::new());
    let queue = queue_with(2, 10, store.clone());

    let in_flight = queue.enqueue(submission(Priority::Normal, "a")).await.unwrap();
    let waiting = queue.enqueue(submission(Priority::Normal, "b")).await.unwrap();
    assert_eq!(queue.dequeue().await.unwrap().data.id, in_flight);

    queue.cancel(waiting).await.unwrap();
    queue.cancel(in_flight).await.unwrap();

    assert_eq!(
        store.find_by_id(waiting).await.unwrap().unwrap().status,
        RequestStatus::Cancelled
    );
    assert_eq!(
        store.find_by_id(in_flight).await.unwrap().unwrap().status,
        RequestStatus::Cancelled
    );
    let metrics = queue.metrics().await;
    assert_eq!(metrics.waiting, 0);
    assert_eq!(metrics.processing, 0);

    assert!(matches!(
        queue.cancel(RequestId::new_v4()).await,
        Err(crate::error::GatewayError::RequestNotFound(_))
    ));
}

#[tokio::test]
async fn disabled_priority_degrades_to_fifo() {
    let queue = Arc::new(CrashProofQueue::new(
        "gemma",
        QueueConfig {
            max_concurrent: 1,
            max_waiting: 10,
            priority_enabled: false,
            ..Default::default()
        },
        Arc::new(InMemoryStore::new()),
    ));

    queue.enqueue(submission(Priority::Low, "first")).await.unwrap();
    queue.enqueue(submission(Priority::High, "second")).await.unwrap();

    let dispatched = queue.dequeue().await.unwrap();
    assert_eq!(dispatched.data.client, "first");
}

#[tokio::test]
async fn disabled_persistence_skips_store() {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(CrashProofQueue::new(
        "gemma",
        QueueConfig {
            persistence_enabled: false,
            ..Default::default()
        },
        store.clone(),
    ));
    queue.start().await.unwrap();
    queue.enqueue(submission(Priority::Normal, "a")).await.unwrap();
    queue.stop().await;
    assert!(store.is_empty());
}

// ============================================================================
// Property tests
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Enqueue(u8),
    Dequeue,
    Complete,
    Fail,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3).prop_map(Op::Enqueue),
        Just(Op::Dequeue),
        Just(Op::Complete),
        Just(Op::Fail),
    ]
}

fn priority_of(rank: u8) -> Priority {
    match rank {
        0 => Priority::High,
        1 => Priority::Normal,
        _ => Priority::Low,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn bounds_hold_under_any_op_sequence(ops in proptest::collection::vec(op_strategy(), 1..80)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let ok = rt.block_on(async move {
            let queue = queue_with(2, 4, Arc::new(InMemoryStore::new()));
            let mut in_flight: Vec<RequestId> = Vec::new();
            for op in ops {
                match op {
                    Op::Enqueue(rank) => {
                        let _ = queue.enqueue(submission(priority_of(rank), "p")).await;
                    }
                    Op::Dequeue => {
                        if let Some(request) = queue.dequeue().await {
                            in_flight.push(request.data.id);
                        }
                    }
                    Op::Complete => {
                        if let Some(id) = in_flight.pop() {
                            queue.complete(id, None).await;
                        }
                    }
                    Op::Fail => {
                        if let Some(id) = in_flight.pop() {
                            queue.fail(id, "boom").await;
                        }
                    }
                }
                let metrics = queue.metrics().await;
                if metrics.processing > metrics.max_concurrent
                    || metrics.waiting > metrics.max_waiting
                {
                    return false;
                }
            }
            true
        });
        prop_assert!(ok);
    }

    #[test]
    fn dispatch_order_is_a_stable_priority_sort(ranks in proptest::collection::vec(0u8..3, 1..20)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let ok = rt.block_on(async move {
            let queue = queue_with(32, 32, Arc::new(InMemoryStore::new()));
            let mut admitted: Vec<(RequestId, u8)> = Vec::new();
            for rank in &ranks {
                let id = queue
                    .enqueue(submission(priority_of(*rank), "p"))
                    .await
                    .unwrap();
                admitted.push((id, *rank));
            }

            // Expected order: stable sort by priority rank.
            let mut expected = admitted.clone();
            expected.sort_by_key(|(_, rank)| *rank);

            let mut dispatched = Vec::new();
            while let Some(request) = queue.dequeue().await {
                dispatched.push(request.data.id);
            }

            dispatched == expected.iter().map(|(id, _)| *id).collect::<Vec<_>>()
        });
        prop_assert!(ok);
    }
}
