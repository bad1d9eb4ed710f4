use crate::error::{Result, StokerError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-spawn options applied when launching a worker process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Environment variable overrides, merged over the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Run the command through `sh -c`
    #[serde(default)]
    pub shell: bool,

    /// Place the process in its own process group
    #[serde(default)]
    pub detached: bool,

    /// Kill the process if it is still running after this many milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Override the manager-wide restart budget for this process
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

/// A command plus everything needed to respawn it identically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Command path (absolute or resolvable on PATH)
    pub command: String,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Spawn options
    #[serde(default)]
    pub options: SpawnOptions,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            options: SpawnOptions::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_options(mut self, options: SpawnOptions) -> Self {
        self.options = options;
        self
    }
}

/// ProcessManager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Hard cap on concurrently tracked processes
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,

    /// Grace window before SIGTERM escalates to SIGKILL (in milliseconds)
    #[serde(default = "default_grace_timeout")]
    pub grace_timeout_ms: u64,

    /// Restart budget per process, unless overridden per spawn
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// First restart delay; doubles per attempt (in milliseconds)
    #[serde(default = "default_restart_base_delay")]
    pub restart_base_delay_ms: u64,

    /// Upper bound on the restart delay (in milliseconds)
    #[serde(default = "default_restart_max_delay")]
    pub restart_max_delay_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_processes: default_max_processes(),
            grace_timeout_ms: default_grace_timeout(),
            max_restarts: default_max_restarts(),
            restart_base_delay_ms: default_restart_base_delay(),
            restart_max_delay_ms: default_restart_max_delay(),
        }
    }
}

impl ManagerConfig {
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }
}

/// ProcessMonitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Resource sampling interval (in milliseconds)
    #[serde(default = "default_resource_interval")]
    pub resource_interval_ms: u64,

    /// Health check interval (in milliseconds)
    #[serde(default = "default_health_interval")]
    pub health_interval_ms: u64,

    /// Per-check timeout; a timed-out check counts as unhealthy (in milliseconds)
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u64,

    /// Consecutive failures before a process is declared unhealthy
    #[serde(default = "default_health_retries")]
    pub health_retries: u32,

    /// CPU percentage above which a high-CPU alert fires
    #[serde(default = "default_cpu_alert")]
    pub cpu_alert_threshold: f32,

    /// Memory percentage above which a high-memory alert fires
    #[serde(default = "default_memory_alert")]
    pub memory_alert_threshold: f32,

    /// Health check response time above which a slow-response alert fires (ms)
    #[serde(default = "default_slow_response")]
    pub slow_response_threshold_ms: u64,

    /// Restart count above which a frequent-restarts alert fires
    #[serde(default = "default_frequent_restarts")]
    pub frequent_restart_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            resource_interval_ms: default_resource_interval(),
            health_interval_ms: default_health_interval(),
            health_timeout_ms: default_health_timeout(),
            health_retries: default_health_retries(),
            cpu_alert_threshold: default_cpu_alert(),
            memory_alert_threshold: default_memory_alert(),
            slow_response_threshold_ms: default_slow_response(),
            frequent_restart_threshold: default_frequent_restarts(),
        }
    }
}

/// ProcessPool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Minimum number of warm processes kept alive
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Maximum number of pooled processes
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Idle processes older than this are evicted by maintenance (ms)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// How long an acquire may wait for a process before failing (ms)
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// How long drain waits for in-use processes to be released (ms)
    #[serde(default = "default_destroy_timeout")]
    pub destroy_timeout_ms: u64,

    /// Maintenance pass interval (ms)
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            idle_timeout_ms: default_idle_timeout(),
            acquire_timeout_ms: default_acquire_timeout(),
            destroy_timeout_ms: default_destroy_timeout(),
            maintenance_interval_ms: default_maintenance_interval(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(StokerError::ConfigError(
                "pool max_size must be at least 1".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(StokerError::ConfigError(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Top-level configuration for the process core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl CoreConfig {
    /// Load configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<CoreConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StokerError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let config: CoreConfig = match extension {
            "toml" => toml::from_str(&contents)
                .map_err(|e| StokerError::InvalidConfig(format!("TOML parse error: {}", e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| StokerError::InvalidConfig(format!("JSON parse error: {}", e)))?,
            _ => {
                return Err(StokerError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.manager.max_processes == 0 {
            return Err(StokerError::ConfigError(
                "manager max_processes must be at least 1".to_string(),
            ));
        }
        if self.manager.restart_max_delay_ms < self.manager.restart_base_delay_ms {
            return Err(StokerError::ConfigError(
                "restart_max_delay_ms must be >= restart_base_delay_ms".to_string(),
            ));
        }
        self.pool.validate()?;
        Ok(())
    }
}

// Default value functions for serde
fn default_max_processes() -> usize {
    10
}

fn default_grace_timeout() -> u64 {
    5_000
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_base_delay() -> u64 {
    1_000
}

fn default_restart_max_delay() -> u64 {
    30_000
}

fn default_resource_interval() -> u64 {
    5_000
}

fn default_health_interval() -> u64 {
    30_000
}

fn default_health_timeout() -> u64 {
    5_000
}

fn default_health_retries() -> u32 {
    3
}

fn default_cpu_alert() -> f32 {
    90.0
}

fn default_memory_alert() -> f32 {
    90.0
}

fn default_slow_response() -> u64 {
    10_000
}

fn default_frequent_restarts() -> u32 {
    5
}

fn default_min_size() -> usize {
    1
}

fn default_max_size() -> usize {
    4
}

fn default_idle_timeout() -> u64 {
    300_000
}

fn default_acquire_timeout() -> u64 {
    30_000
}

fn default_destroy_timeout() -> u64 {
    10_000
}

fn default_maintenance_interval() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.manager.max_processes, 10);
        assert_eq!(config.manager.max_restarts, 3);
        assert_eq!(config.manager.restart_max_delay_ms, 30_000);
        assert_eq!(config.monitor.resource_interval_ms, 5_000);
        assert_eq!(config.monitor.health_interval_ms, 30_000);
        assert_eq!(config.pool.maintenance_interval_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_validation() {
        let mut pool = PoolConfig::default();
        pool.min_size = 5;
        pool.max_size = 2;
        assert!(pool.validate().is_err());

        pool.min_size = 0;
        pool.max_size = 0;
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pool]\nmin_size = 2\nmax_size = 8\n\n[manager]\nmax_restarts = 5"
        )
        .unwrap();

        let config = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.min_size, 2);
        assert_eq!(config.pool.max_size, 8);
        assert_eq!(config.manager.max_restarts, 5);
        // Unspecified sections fall back to defaults
        assert_eq!(config.monitor.health_retries, 3);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, "{{\"pool\": {{\"max_size\": 6}}}}").unwrap();

        let config = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.max_size, 6);
        assert_eq!(config.pool.min_size, 1);
    }

    #[test]
    fn test_unsupported_extension() {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "pool:").unwrap();

        let result = CoreConfig::from_file(file.path());
        assert!(matches!(result, Err(StokerError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pool]\nmin_size = 9\nmax_size = 3").unwrap();

        assert!(CoreConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("/bin/echo").with_args(["hello", "world"]);
        assert_eq!(spec.command, "/bin/echo");
        assert_eq!(spec.args, vec!["hello", "world"]);
        assert!(!spec.options.shell);
    }
}
