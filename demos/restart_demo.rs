// Watch the crash/backoff/restart cycle until the budget runs out.

use stoker::config::{CommandSpec, ManagerConfig};
use stoker::events::ProcessEvent;
use stoker::process::ProcessManager;

#[tokio::main]
async fn main() -> stoker::error::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let manager = ProcessManager::new(ManagerConfig {
        max_restarts: 3,
        restart_base_delay_ms: 500,
        ..Default::default()
    });
    let mut events = manager.subscribe();

    let id = manager
        .spawn(CommandSpec::new("/bin/sh").with_args(["-c", "echo working...; sleep 1; exit 1"]))
        .await?;
    println!("spawned crasher as process {}", id);

    loop {
        match events.recv().await {
            Ok(ProcessEvent::Started { id, pid }) => println!("started {} (pid {})", id, pid),
            Ok(ProcessEvent::Exited { id, exit }) => {
                println!("exited {} (code {:?})", id, exit.code)
            }
            Ok(ProcessEvent::RestartScheduled { id, attempt, delay }) => {
                println!("restart #{} of {} in {:?}", attempt, id, delay)
            }
            Ok(ProcessEvent::MaxRestartsExceeded { id }) => {
                println!("{} exhausted its restart budget, giving up", id);
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let summary = manager.summary(id).await.expect("process is still tracked");
    println!(
        "final state: {} after {} restarts",
        summary.state, summary.restarts
    );

    manager.cleanup().await;
    Ok(())
}
