// Sample resource usage and health of a managed process for a few seconds.

use std::time::Duration;
use stoker::config::{CommandSpec, ManagerConfig, MonitorConfig};
use stoker::process::{ProcessManager, ProcessMonitor};

#[tokio::main]
async fn main() -> stoker::error::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let manager = ProcessManager::new(ManagerConfig::default());
    let monitor = ProcessMonitor::new(
        manager.clone(),
        MonitorConfig {
            resource_interval_ms: 1_000,
            health_interval_ms: 2_000,
            ..Default::default()
        },
    );

    let id = manager
        .spawn(CommandSpec::new("/bin/sh").with_args(["-c", "while true; do sleep 0.1; done"]))
        .await?;
    monitor.start_monitoring(id).await?;
    println!("monitoring process {}", id);

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Some(metrics) = monitor.get_metrics(id).await {
            println!(
                "cpu {:>5.1}%  mem {:>5.2}%  uptime {:?}  restarts {}",
                metrics.cpu_percent, metrics.memory_percent, metrics.uptime, metrics.restarts
            );
        }
    }

    let hot = monitor.get_high_resource_processes(90.0, 90.0).await;
    println!("processes above 90% cpu or memory: {:?}", hot);

    monitor.stop_all().await;
    manager.cleanup().await;
    Ok(())
}
