//! Agent configuration file

use injector_cloud::CloudSettings;
use injector_db::ServiceRegistration;
use injector_haproxy::HaproxySettings;
use injector_proto::{Protocol, RuntimeLayout};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The service this agent fronts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub name: String,

    /// Host the ingress multiplexer relays to; also the rewritten Host header
    pub upstream_host: String,

    pub ports: Vec<u16>,

    #[serde(default)]
    pub protocol: Protocol,

    /// Register the service row when none matches this agent
    #[serde(default = "default_true")]
    pub auto_create: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub database_url: String,

    /// Host name the service is registered under
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub availability_zone: Option<String>,

    pub service: ServiceSettings,

    /// Directory for proxy configs, pidfiles, logs and sockets
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Seconds between incremental sync passes
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    /// Seconds between proxy stats collections
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Seconds in-flight work may take to finish after shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,

    #[serde(default)]
    pub haproxy: HaproxySettings,

    #[serde(default)]
    pub cloud: CloudSettings,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/var/run/injector")
}

fn default_sync_interval() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    60
}

fn default_max_concurrent_jobs() -> usize {
    16
}

fn default_shutdown_grace() -> u64 {
    5
}

impl AgentConfig {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Check the configuration before anything is started
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::Invalid(
                "database_url is required (use --database-url or config file)".to_string(),
            ));
        }
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host cannot be empty".to_string()));
        }
        if self.service.name.is_empty() {
            return Err(ConfigError::Invalid("service.name is required".to_string()));
        }
        if self.service.upstream_host.is_empty() {
            return Err(ConfigError::Invalid(
                "service.upstream_host is required".to_string(),
            ));
        }
        if self.service.ports.is_empty() {
            return Err(ConfigError::Invalid(
                "service.ports must list at least one port".to_string(),
            ));
        }
        if self.service.ports.contains(&0) {
            return Err(ConfigError::Invalid(
                "service.ports cannot contain port 0".to_string(),
            ));
        }
        if self.sync_interval == 0 || self.stats_interval == 0 {
            return Err(ConfigError::Invalid(
                "sync_interval and stats_interval must be positive".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_jobs must be positive".to_string(),
            ));
        }
        if self.haproxy.startup_timeout == 0 {
            return Err(ConfigError::Invalid(
                "haproxy.startup_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn layout(&self) -> RuntimeLayout {
        RuntimeLayout::new(&self.runtime_dir)
    }

    pub fn registration(&self) -> ServiceRegistration {
        ServiceRegistration {
            name: self.service.name.clone(),
            host: self.host.clone(),
            availability_zone: self.availability_zone.clone(),
            ports: self.service.ports.clone(),
            protocol: self.service.protocol,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
database_url: "sqlite::memory:"
service:
  name: billing-api
  upstream_host: billing.internal
  ports: [443, 80]
  protocol: http
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.service.protocol, Protocol::Http);
        assert!(config.service.auto_create);
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.runtime_dir, PathBuf::from("/var/run/injector"));
        assert_eq!(config.haproxy.binary, PathBuf::from("haproxy"));
        assert_eq!(config.cloud.interface, "internal");
        assert!(!config.host.is_empty());

        let registration = config.registration();
        assert_eq!(registration.ports, vec![443, 80]);
        assert_eq!(registration.availability_zone, None);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
database_url: "postgres://injector@db/injector"
host: node-07
availability_zone: eu-de-1b
runtime_dir: /tmp/injector
sync_interval: 10
max_concurrent_jobs: 4
service:
  name: metrics
  upstream_host: 10.1.2.3
  ports: [9090]
  auto_create: false
haproxy:
  binary: /usr/sbin/haproxy
  user: haproxy
cloud:
  auth_url: https://keystone.example.com/v3
  username: injector
  password: secret
  project_name: service
  region_name: eu-de
"#;
        let config = AgentConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.host, "node-07");
        assert_eq!(config.service.protocol, Protocol::Tcp);
        assert!(!config.service.auto_create);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.haproxy.user.as_deref(), Some("haproxy"));
        assert_eq!(config.cloud.region_name.as_deref(), Some("eu-de"));
        assert_eq!(
            config.layout().config_path("net-a"),
            PathBuf::from("/tmp/injector/net-a.conf")
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.service.ports.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.sync_interval = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.database_url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_service_section() {
        let err = AgentConfig::from_yaml("database_url: x\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
