//! The echo context: mode switching, emit, host binding and translators
//! reading reduced state.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use echos::{
    Action, ActionRef, EchoConfig, EchoError, Echos, MemoryStore, Selector, Store, Translator,
    SQUEAK_ACTION_TYPE,
};
use serde_json::{json, Value};

fn squeaking() -> Echos {
    Echos::new(EchoConfig::default().with_thunk_mode(false))
}

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echo_follows_the_mode_flag() {
    let echos = squeaking();
    assert!(!echos.thunk_enabled());
    assert_eq!(
        echos.echo(Action::named("a")).action_type(),
        Some(SQUEAK_ACTION_TYPE)
    );

    assert!(echos.enable_thunk());
    assert!(echos.thunk_enabled());
    assert!(echos.echo(Action::named("a")).is_producer());

    assert!(!echos.disable_thunk());
    assert!(!echos.echo(Action::named("a")).is_producer());
}

#[tokio::test]
async fn default_context_uses_producers_inside_a_runtime() {
    assert!(Echos::default().thunk_enabled());
}

#[test]
fn default_context_squeaks_without_a_runtime() {
    assert!(!Echos::default().thunk_enabled());
}

#[test]
fn emit_without_a_runtime_flushes_on_the_echo_thread() {
    let echos = Echos::default();
    assert!(!echos.thunk_enabled());
    let store = MemoryStore::new(json!({})).install(&echos);
    let action = Action::named("offline");

    let returned = echos.emit(action.clone()).unwrap();
    assert!(Arc::ptr_eq(&returned, &action));

    let deadline = Instant::now() + Duration::from_secs(1);
    while store.dispatched().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let seen = store.dispatched();
    assert_eq!(seen.len(), 1);
    assert!(Arc::ptr_eq(&seen[0], &action));
    assert!(echos.pending().is_none());
}

#[test]
fn enabling_producers_without_a_runtime_still_switches() {
    let echos = squeaking();
    assert!(echos.enable_thunk());
    assert!(echos.thunk_enabled());
}

// ---------------------------------------------------------------------------
// Emit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn emit_squeak_returns_the_action_and_defers_it() {
    let echos = squeaking();
    let store = MemoryStore::new(json!({})).install(&echos);
    let action = Action::new("saved", json!({"id": 7}));

    let returned = echos.emit(action.clone()).unwrap();

    assert!(Arc::ptr_eq(&returned, &action));
    assert!(store.dispatched().is_empty());
    let seen = store.settle(1).await.unwrap();
    assert!(Arc::ptr_eq(&seen[0], &action));
}

#[tokio::test]
async fn emit_thunk_runs_through_the_store() {
    let echos = Echos::new(EchoConfig::default().with_thunk_mode(true));
    let store = MemoryStore::new(json!({})).install(&echos);
    let action = Action::named("saved");

    echos.emit(action.clone()).unwrap();

    let seen = store.settle(1).await.unwrap();
    assert!(Arc::ptr_eq(&seen[0], &action));
    assert!(echos.pending().is_none());
}

#[tokio::test]
async fn emit_without_a_store_fails() {
    let echos = squeaking();
    assert!(matches!(
        echos.emit(Action::named("nowhere")),
        Err(EchoError::NotInstalled)
    ));
    assert_eq!(echos.state(), Value::Null);
}

#[tokio::test]
async fn reinstalling_rebinds_the_host() {
    let echos = squeaking();
    let first = MemoryStore::new(json!({"name": "first"})).install(&echos);
    let second = MemoryStore::new(json!({"name": "second"})).install(&echos);

    echos.emit(Action::named("hello")).unwrap();

    second.settle(1).await.unwrap();
    first.quiesce().await;
    assert!(first.dispatched().is_empty());
    assert_eq!(echos.state()["name"], json!("second"));
}

#[tokio::test]
async fn dropped_store_unbinds() {
    let echos = squeaking();
    let store = MemoryStore::new(json!({})).install(&echos);
    drop(store);

    assert!(echos.store().is_none());
    assert!(matches!(
        echos.dispatch(Action::named("late")),
        Err(EchoError::NotInstalled)
    ));
}

// ---------------------------------------------------------------------------
// Translators
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lookup_and_snapshot() {
    let echos = squeaking();
    let noop = || Translator::new(|_action: &ActionRef, _state: &Value| ());
    let (a, b) = (noop(), noop());

    echos.register("ping", [a.clone(), b.clone()], None);

    let found = echos.lookup("ping");
    assert_eq!(found.len(), 2);
    assert!(found[0].is(&a) && found[1].is(&b));
    assert!(echos.lookup("pong").is_empty());
    assert_eq!(echos.translators().get("ping").map(Vec::len), Some(2));

    assert_eq!(echos.unregister(&[a], Some("ping")), 1);
    assert!(echos.lookup("ping")[0].is(&b));
}

#[tokio::test]
async fn translators_see_state_before_their_trigger_is_reduced() {
    let echos = squeaking();
    let store = MemoryStore::new(json!({"count": 0}))
        .with_reducer(|state: &mut Value, action: &Action| {
            if action.action_type == "increment" {
                let count = state["count"].as_i64().unwrap_or(0);
                state["count"] = json!(count + 1);
            }
        })
        .install(&echos);

    let count: Selector = Arc::new(|state: &Value| state["count"].clone());
    echos.register(
        "increment",
        [Translator::new(|_action: &ActionRef, count: &Value| {
            Action::new("count_changed", count.clone())
        })],
        Some(count),
    );

    echos.dispatch(Action::named("increment")).unwrap();
    echos.dispatch(Action::named("increment")).unwrap();

    let seen = store.settle(4).await.unwrap();
    let changes: Vec<_> = seen
        .iter()
        .filter(|action| action.action_type == "count_changed")
        .map(|action| action.payload.clone())
        .collect();
    assert_eq!(changes, vec![json!(0), json!(1)]);
    assert_eq!(store.state()["count"], json!(2));
}
