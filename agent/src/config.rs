use crate::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the worker agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub hub: HubConfig,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

/// Hub connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    /// Use `wss://` instead of `ws://`
    pub tls: bool,
    /// When false, certificate and hostname verification are disabled
    pub verify_tls: bool,
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    /// Limit on TCP connect, TLS and WebSocket upgrade together
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Local execution limits and identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Permits per admission class and size of the blocking worker pool
    pub concurrent_slots: usize,
    /// Name announced to the hub instead of the hostname
    pub friendly_name: Option<String>,
    /// Extra job types advertised at registration (e.g. "llama")
    #[serde(default)]
    pub enabled_modules: Vec<String>,
}

/// Model instance cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Fixed number of resident model instances, bypassing hardware sizing
    pub concurrent_pipes: Option<usize>,
    pub per_instance_footprint_gib: u64,
    pub clear_accelerator_cache: bool,
    pub enable_offload: bool,
    pub enable_sequential_offload: bool,
    /// Weight precision requested from the builder: 16 or 32
    #[serde(default = "default_precision_bits")]
    pub precision_bits: u8,
}

fn default_precision_bits() -> u8 {
    16
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JSON ticket holding the bearer token; `~/` is expanded
    pub ticket_path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            hub: HubConfig {
                host: "localhost".to_string(),
                port: 6789,
                tls: false,
                verify_tls: false,
                ca_cert_path: None,
                client_cert_path: None,
                client_key_path: None,
                ping_interval_secs: 2,
                ping_timeout_secs: 60,
                connect_timeout_secs: default_connect_timeout_secs(),
            },
            worker: WorkerConfig {
                concurrent_slots: 1,
                friendly_name: None,
                enabled_modules: Vec::new(),
            },
            cache: CacheConfig {
                concurrent_pipes: None,
                per_instance_footprint_gib: 10,
                clear_accelerator_cache: false,
                enable_offload: true,
                enable_sequential_offload: false,
                precision_bits: default_precision_bits(),
            },
            auth: AuthConfig {
                ticket_path: "~/.hubnet/auth_ticket.json".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_to_file: false,
                log_dir: None,
            },
        }
    }
}

impl AgentConfig {
    /// Get default configuration file path: `~/.hubnet/agent.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| AgentError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".hubnet").join("agent.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: AgentConfig = toml::from_str(&content)?;

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.hub.host.trim().is_empty() {
            return Err(AgentError::Config("hub.host must not be empty".into()));
        }

        if self.hub.port == 0 {
            return Err(AgentError::Config("hub.port must be non-zero".into()));
        }

        if self.hub.ping_interval_secs == 0 {
            return Err(AgentError::Config(
                "hub.ping_interval_secs must be at least 1".into(),
            ));
        }

        if self.hub.connect_timeout_secs == 0 {
            return Err(AgentError::Config(
                "hub.connect_timeout_secs must be at least 1".into(),
            ));
        }

        if self.hub.ping_timeout_secs < self.hub.ping_interval_secs {
            return Err(AgentError::Config(
                "hub.ping_timeout_secs must not be shorter than ping_interval_secs".into(),
            ));
        }

        // Client identity needs both halves
        if self.hub.client_cert_path.is_some() != self.hub.client_key_path.is_some() {
            return Err(AgentError::Config(
                "hub.client_cert_path and hub.client_key_path must be set together".into(),
            ));
        }

        if self.worker.concurrent_slots == 0 {
            return Err(AgentError::Config(
                "worker.concurrent_slots must be at least 1".into(),
            ));
        }

        if self.cache.concurrent_pipes == Some(0) {
            return Err(AgentError::Config(
                "cache.concurrent_pipes must be at least 1 when set".into(),
            ));
        }

        if self.cache.per_instance_footprint_gib == 0 {
            return Err(AgentError::Config(
                "cache.per_instance_footprint_gib must be at least 1".into(),
            ));
        }

        if !matches!(self.cache.precision_bits, 16 | 32) {
            return Err(AgentError::Config(
                "cache.precision_bits must be 16 or 32".into(),
            ));
        }

        // Validate log level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(AgentError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Hub URL derived from host, port and TLS mode
    pub fn hub_url(&self) -> String {
        let scheme = if self.hub.tls { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.hub.host, self.hub.port)
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }
}

/// Expand a leading `~/` to the user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}
