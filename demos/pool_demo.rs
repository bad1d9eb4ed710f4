// Round-trip a prompt through a pooled stdio worker.
//
// The worker is `sed` rewriting each request envelope into a response, so
// every send_and_wait resolves with its own payload.

use serde_json::json;
use std::time::Duration;
use stoker::comms::ProcessCommunication;
use stoker::config::{CommandSpec, ManagerConfig, PoolConfig};
use stoker::pool::ProcessPool;
use stoker::process::ProcessManager;

#[tokio::main]
async fn main() -> stoker::error::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let manager = ProcessManager::new(ManagerConfig::default());
    let comms = ProcessCommunication::new(manager.clone());

    let responder = CommandSpec::new("sed").with_args([
        "-u",
        "s/\"type\":\"request\"/\"type\":\"response\"/",
    ]);
    let pool = ProcessPool::new(
        manager.clone(),
        responder,
        PoolConfig {
            min_size: 2,
            max_size: 4,
            ..Default::default()
        },
    )?;
    pool.initialize().await?;

    let worker = pool.acquire().await?;
    println!("acquired worker {} (use #{})", worker.id, worker.use_count);

    let answer = comms
        .send_and_wait(
            worker.id,
            json!({"prompt": "refactor this function"}),
            Duration::from_secs(5),
        )
        .await?;
    println!("worker answered: {}", answer);

    pool.release(&worker).await;
    let stats = pool.stats().await;
    println!(
        "pool: total={} available={} in_use={} utilization={:.0}%",
        stats.total, stats.available, stats.in_use, stats.utilization
    );

    pool.drain().await?;
    manager.cleanup().await;
    Ok(())
}
