use std::path::PathBuf;

use anyhow::Result;
use echos::{Action, ActionRef, Dispatch, EchoConfig, Echos, MemoryStore, Producer, Translator};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Walks an order through a chain and a translator, then prints every
/// dispatched action with its causal ancestry.
///
/// Usage: echos-demo [config.toml]
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("echos=info".parse()?))
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => EchoConfig::from_file(&path)?,
        None => EchoConfig::from_env()?,
    };
    let echos = Echos::new(config);

    let store = MemoryStore::new(json!({"orders": 0, "stock": 10}))
        .with_reducer(|state: &mut Value, action: &Action| match action.action_type.as_str() {
            "order_placed" => {
                let orders = state["orders"].as_i64().unwrap_or(0);
                state["orders"] = json!(orders + 1);
            }
            "stock_reserved" => {
                let stock = state["stock"].as_i64().unwrap_or(0);
                let quantity = action.payload["quantity"].as_i64().unwrap_or(0);
                state["stock"] = json!(stock - quantity);
            }
            _ => {}
        })
        .install(&echos);

    echos.register(
        "order_placed",
        [Translator::new(|order: &ActionRef, _state: &Value| {
            Action::new("receipt_queued", json!({"order": order.payload["order"]}))
        })],
        None,
    );

    let reserve = Producer::from_fn(|dispatch: Dispatch| async move {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let reserved = Action::new("stock_reserved", json!({"quantity": 2}));
        dispatch.call(&reserved);
        Ok(reserved)
    });

    echos
        .chain(Action::new("order_placed", json!({"order": 1001})))
        .connect(&reserve)
        .connect(Action::named("order_confirmed"))
        .dispatch()?;

    store.settle(4).await?;
    store.quiesce().await;

    for action in &store.dispatched() {
        let ancestry: Vec<_> = action
            .ancestry()
            .iter()
            .map(|a| a.action_type.clone())
            .collect();
        println!("{}", serde_json::to_string(&action.to_json())?);
        info!(action_type = %action.action_type, ancestry = ?ancestry, "dispatched");
    }

    info!(state = %echos.state(), "final state");
    Ok(())
}
