// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub store: StoreConfig,
    pub paths: PathsConfig,
    pub node: NodeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    pub scheduler: SchedulerConfig,
    pub lock: LockConfig,
    pub watch: WatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
    /// Prefix of every Redis key owned by the store
    pub namespace: String,
    /// Number of change events retained for watchers
    pub history_limit: usize,
    pub poll_interval_ms: u64,
}

/// Key prefixes inside the consistency store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub tasks: String,
    pub task_groups: String,
    pub jobs: String,
    pub records: String,
    pub global_config: String,
    pub locks: String,
    pub master_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    pub next_timeout_ms: u64,
    pub requeue_delay_ms: u64,
    pub master_lease_ttl_seconds: i64,
    #[serde(default)]
    pub static_task_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Upper bound of a job lock's lease
    pub max_ttl_seconds: i64,
    /// Lease of the create-once guard taken while reconciling a record
    pub record_lock_ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub resync_interval_seconds: u64,
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl SchedulerConfig {
    pub fn next_timeout(&self) -> Duration {
        Duration::from_millis(self.next_timeout_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl WatchConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_seconds)
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.store.url.is_empty() && self.store.backend == StoreBackend::Redis {
            return Err("Store URL cannot be empty for the redis backend".to_string());
        }
        if self.store.namespace.is_empty() {
            return Err("Store namespace cannot be empty".to_string());
        }
        if self.store.history_limit == 0 {
            return Err("Store history_limit must be greater than 0".to_string());
        }

        let prefixes = [
            ("tasks", &self.paths.tasks),
            ("task_groups", &self.paths.task_groups),
            ("jobs", &self.paths.jobs),
            ("records", &self.paths.records),
            ("global_config", &self.paths.global_config),
            ("locks", &self.paths.locks),
            ("master_key", &self.paths.master_key),
        ];
        for (name, prefix) in prefixes {
            if prefix.is_empty() {
                return Err(format!("Path {} cannot be empty", name));
            }
        }

        if self.node.id.is_empty() {
            return Err("Node id cannot be empty".to_string());
        }
        if self.cluster.nodes.iter().any(|node| node.id.is_empty()) {
            return Err("Cluster node ids cannot be empty".to_string());
        }

        if self.scheduler.queue_capacity == 0 {
            return Err("Scheduler queue_capacity must be greater than 0".to_string());
        }
        if self.scheduler.next_timeout_ms == 0 {
            return Err("Scheduler next_timeout_ms must be greater than 0".to_string());
        }
        if self.scheduler.master_lease_ttl_seconds <= 0 {
            return Err("Scheduler master_lease_ttl_seconds must be greater than 0".to_string());
        }

        if self.lock.max_ttl_seconds <= 0 {
            return Err("Lock max_ttl_seconds must be greater than 0".to_string());
        }
        if self.lock.record_lock_ttl_seconds <= 0 {
            return Err("Lock record_lock_ttl_seconds must be greater than 0".to_string());
        }

        if self.watch.resync_interval_seconds == 0 {
            return Err("Watch resync_interval_seconds must be greater than 0".to_string());
        }
        if self.watch.buffer_size == 0 {
            return Err("Watch buffer_size must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tasks: "/fleet/store/tasks".to_string(),
            task_groups: "/fleet/store/taskgroups".to_string(),
            jobs: "/fleet/jobs".to_string(),
            records: "/fleet/records".to_string(),
            global_config: "/fleet/config/global".to_string(),
            locks: "/fleet/locks".to_string(),
            master_key: "/fleet/nodetaskscheduler".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            next_timeout_ms: 5_000,
            requeue_delay_ms: 3_000,
            master_lease_ttl_seconds: 10,
            static_task_path: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_ttl_seconds: 600,
            record_lock_ttl_seconds: 30,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resync_interval_seconds: 20,
            buffer_size: 100,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                backend: StoreBackend::Redis,
                url: "redis://localhost:6379".to_string(),
                namespace: "fleet".to_string(),
                history_limit: 10_000,
                poll_interval_ms: 250,
            },
            paths: PathsConfig::default(),
            node: NodeConfig {
                id: "node-1".to_string(),
                labels: HashMap::new(),
            },
            cluster: ClusterConfig::default(),
            scheduler: SchedulerConfig::default(),
            lock: LockConfig::default(),
            watch: WatchConfig::default(),
            worker: WorkerConfig::default(),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
            },
        }
    }
}
