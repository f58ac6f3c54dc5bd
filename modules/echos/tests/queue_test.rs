//! Echo batching, flush ordering and flush failure policy.
//! No host application needed: MemoryStore stands in for the store.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use echos::{
    Action, ActionRef, Dispatch, EchoConfig, EchoQueue, Echos, FlushPolicy, Item, MemoryStore,
    Squeak, Translator,
};
use serde_json::{json, Value};
use tokio::sync::oneshot;

fn echos() -> Echos {
    Echos::new(EchoConfig::default().with_thunk_mode(true))
}

fn recorder() -> (Dispatch, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let dispatch = Dispatch::new(move |item: Item| {
        if let Some(action) = item.concrete_action() {
            sink.lock().unwrap().push(action.action_type.clone());
        }
    });
    (dispatch, seen)
}

/// Records actions and panics on any action typed "boom".
fn exploding_recorder() -> (Dispatch, Arc<Mutex<Vec<String>>>) {
    let (inner, seen) = recorder();
    let dispatch = Dispatch::new(move |item: Item| {
        if item.action_type() == Some("boom") {
            panic!("dispatch failed");
        }
        inner.call(item);
    });
    (dispatch, seen)
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_flush_per_batch_in_enqueue_order() {
    let echos = echos();
    let store = MemoryStore::new(json!({})).install(&echos);
    let host = echos.host_dispatch();

    for label in ["a", "b", "c", "d"] {
        echos.queue().enqueue(&host, Action::named(label), None, None);
    }

    // Nothing dispatched yet; one batch, one flush scheduled.
    assert!(store.dispatched().is_empty());
    assert_eq!(echos.pending().map(|batch| batch.len()), Some(4));
    assert_eq!(echos.queue().scheduled_flushes(), 1);

    store.settle(4).await.unwrap();

    assert_eq!(store.dispatched_types(), vec!["a", "b", "c", "d"]);
    assert!(echos.pending().is_none());
    assert_eq!(echos.queue().scheduled_flushes(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn a_large_synchronous_burst_is_one_batch() {
    let queue = EchoQueue::new(FlushPolicy::Abort);
    let (dispatch, seen) = recorder();

    for n in 0..2000 {
        queue.enqueue(&dispatch, Action::named(n.to_string()), None, None);
    }

    assert_eq!(queue.scheduled_flushes(), 1);
    assert!(seen.lock().unwrap().is_empty());

    let drained = tokio::time::timeout(Duration::from_secs(1), async {
        while seen.lock().unwrap().len() < 2000 {
            tokio::task::yield_now().await;
        }
    })
    .await;

    assert!(drained.is_ok());
    assert_eq!(queue.scheduled_flushes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_thread_runtime_drains_every_echo_in_order() {
    let queue = EchoQueue::new(FlushPolicy::Abort);
    let (dispatch, seen) = recorder();

    for n in 0..2000 {
        queue.enqueue(&dispatch, Action::named(n.to_string()), None, None);
    }

    let drained = tokio::time::timeout(Duration::from_secs(1), async {
        while seen.lock().unwrap().len() < 2000 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;

    assert!(drained.is_ok());
    let expected: Vec<String> = (0..2000).map(|n| n.to_string()).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
    assert!(queue.is_idle());
}

#[tokio::test]
async fn echoes_produced_during_a_flush_start_a_new_batch() {
    let echos = echos();
    let store = MemoryStore::new(json!({})).install(&echos);
    echos.register(
        "first",
        [Translator::new(|_action: &ActionRef, _state: &Value| {
            Action::named("second")
        })],
        None,
    );

    echos
        .queue()
        .enqueue(&echos.host_dispatch(), Action::named("first"), None, None);

    let seen = store.settle(2).await.unwrap();

    assert_eq!(store.dispatched_types(), vec!["first", "second"]);
    assert_eq!(echos.queue().scheduled_flushes(), 2);
    assert!(seen[1].caused_by(&seen[0]));
}

#[tokio::test]
async fn enqueue_all_links_every_action_to_the_same_source() {
    let queue = EchoQueue::new(FlushPolicy::Abort);
    let (dispatch, _seen) = recorder();
    let trigger = Action::named("trigger");
    let batch = vec![Action::named("x"), Action::named("y"), Action::named("z")];

    queue.enqueue_all(&dispatch, batch.clone(), Some(&trigger));

    let pending = queue.peek().unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|action| action.caused_by(&trigger)));
}

// ---------------------------------------------------------------------------
// Producers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn thunk_resolves_with_the_original_action() {
    let echos = echos();
    let action = Action::new("test", json!({"n": 1}));
    let (dispatch, seen) = recorder();

    let resolved = echos.thunk(action.clone()).run(dispatch).await.unwrap();

    assert!(Arc::ptr_eq(&resolved, &action));
    assert_eq!(*seen.lock().unwrap(), vec!["test"]);
    assert!(echos.pending().is_none());
}

// ---------------------------------------------------------------------------
// Source stamping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echoing_twice_never_restamps_source() {
    let echos = Echos::new(EchoConfig::default().with_thunk_mode(false));
    let store = MemoryStore::new(json!({})).install(&echos);

    let first = Action::named("first");
    let second = Action::named("second");
    let target = Action::named("target");

    echos
        .dispatch(Squeak {
            action: target.clone(),
            source: Some(first.clone()),
        })
        .unwrap();
    echos
        .dispatch(Squeak {
            action: target.clone(),
            source: Some(second),
        })
        .unwrap();

    store.settle(2).await.unwrap();
    assert!(target.caused_by(&first));
}

// ---------------------------------------------------------------------------
// Flush failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_policy_drops_the_rest_of_the_batch() {
    let queue = EchoQueue::new(FlushPolicy::Abort);
    let (dispatch, seen) = exploding_recorder();

    for label in ["a", "boom", "c"] {
        queue.enqueue(&dispatch, Action::named(label), None, None);
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| queue.flush()));

    assert!(outcome.is_err());
    assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    assert!(queue.is_idle());
}

#[tokio::test]
async fn continue_policy_drains_past_a_failure() {
    let queue = EchoQueue::new(FlushPolicy::Continue);
    let (dispatch, seen) = exploding_recorder();

    for label in ["a", "boom", "c"] {
        queue.enqueue(&dispatch, Action::named(label), None, None);
    }

    queue.flush();

    assert_eq!(*seen.lock().unwrap(), vec!["a", "c"]);
    assert!(queue.is_idle());
}

#[tokio::test]
async fn aborted_flush_never_resolves_dropped_echoes() {
    let queue = EchoQueue::new(FlushPolicy::Abort);
    let (dispatch, _seen) = exploding_recorder();
    let (resolve, resolved) = oneshot::channel();

    queue.enqueue(&dispatch, Action::named("boom"), None, None);
    queue.enqueue(&dispatch, Action::named("after"), None, Some(resolve));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| queue.flush()));

    assert!(outcome.is_err());
    assert!(resolved.await.is_err());
}
