//! Two-node convergence demo on the in-memory transport.
//!
//! Run with: cargo run --example two_node -p meshdb-net

use meshdb_net::{MemoryHub, MeshNode, SyncConfig};
use meshdb_store::Store;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info,meshdb_net=debug")
        .init();

    let hub = MemoryHub::new();
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;

    let store_a = Arc::new(Store::open(dir_a.path())?);
    let store_b = Arc::new(Store::open(dir_b.path())?);

    let node_a = MeshNode::start_with_transport(
        store_a.clone(),
        Arc::new(hub.transport("node-a")),
        SyncConfig::default(),
    )
    .await?;
    let node_b = MeshNode::start_with_transport(
        store_b.clone(),
        Arc::new(hub.transport("node-b")),
        SyncConfig::default(),
    )
    .await?;

    // Write on A, watch it appear on B.
    let doc = store_a.create(
        "users",
        json!({"name": "Ana", "age": 30}).as_object().unwrap().clone(),
    )?;
    println!("node-a created {doc}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let replica = store_b.get(&doc.id)?;
    println!("node-b sees    {replica} -> {}", serde_json::to_string(&replica.data)?);

    // Concurrent writes converge by last writer wins.
    store_a.update(&doc.id, json!({"city": "Oslo"}).as_object().unwrap().clone())?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    store_b.update(&doc.id, json!({"city": "Madrid"}).as_object().unwrap().clone())?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    println!(
        "converged: a={} b={}",
        store_a.get(&doc.id)?.data["city"],
        store_b.get(&doc.id)?.data["city"],
    );

    node_a.shutdown().await;
    node_b.shutdown().await;
    Ok(())
}
