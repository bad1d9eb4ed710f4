pub mod manager;
pub mod monitor;
pub mod restart;
pub mod spawner;
pub mod types;

pub use manager::ProcessManager;
pub use monitor::{HealthCheck, HealthProbe, ProcessMetrics, ProcessMonitor};
pub use restart::BackoffPolicy;
pub use types::{ExitInfo, ProcessId, ProcessState, ProcessSummary};
