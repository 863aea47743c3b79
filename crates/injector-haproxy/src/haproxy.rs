use crate::{InstanceStats, ProxyConfig, ProxyController, ProxyError, StatsClient};
use dashmap::DashMap;
use injector_proto::{RuntimeLayout, ServiceInjection};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STATS_TIMEOUT: Duration = Duration::from_secs(2);

/// How the proxy binary is launched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaproxySettings {
    /// Path or name of the haproxy executable
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Seconds to wait for the pidfile and the first stats reply
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,

    /// Drop privileges to this user after binding
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub group: Option<String>,
}

fn default_binary() -> PathBuf {
    PathBuf::from("haproxy")
}

fn default_startup_timeout() -> u64 {
    10
}

impl Default for HaproxySettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            startup_timeout: default_startup_timeout(),
            user: None,
            group: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Instance {
    pid: Pid,
    config_path: PathBuf,
    pid_path: PathBuf,
    stats: StatsClient,
}

/// Supervises one daemonized HAProxy per network
pub struct HaproxyController {
    settings: HaproxySettings,
    upstream_host: String,
    layout: RuntimeLayout,
    instances: DashMap<String, Instance>,
}

impl HaproxyController {
    pub fn new(settings: HaproxySettings, upstream_host: &str, layout: RuntimeLayout) -> Self {
        Self {
            settings,
            upstream_host: upstream_host.to_string(),
            layout,
            instances: DashMap::new(),
        }
    }

    /// Configuration text for an injection
    pub fn render(&self, injection: &ServiceInjection) -> Result<String, ProxyError> {
        Ok(ProxyConfig {
            network_id: &injection.network_id,
            upstream_host: &self.upstream_host,
            ports: &injection.ports,
            protocol: injection.protocol,
            layout: &self.layout,
            user: self.settings.user.as_deref(),
            group: self.settings.group.as_deref(),
        }
        .render()?)
    }

    async fn launch(
        &self,
        network_id: &str,
        config_path: &Path,
        pid_path: &Path,
    ) -> Result<(), ProxyError> {
        let log = std::fs::File::create(self.layout.log_path(network_id))?;

        let status = Command::new(&self.settings.binary)
            .arg("-f")
            .arg(config_path)
            .arg("-p")
            .arg(pid_path)
            .arg("-D")
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .status()
            .await
            .map_err(|source| ProxyError::Spawn {
                binary: self.settings.binary.clone(),
                source,
            })?;

        if !status.success() {
            return Err(ProxyError::Exited {
                network_id: network_id.to_string(),
                code: status.code(),
            });
        }
        Ok(())
    }

    /// Wait for the daemon to answer on its stats socket
    async fn wait_healthy(
        &self,
        network_id: &str,
        stats: &StatsClient,
        deadline: Instant,
    ) -> Result<(), ProxyError> {
        loop {
            match stats.show_stat(network_id).await {
                Ok(_) => return Ok(()),
                Err(e) if Instant::now() >= deadline => {
                    return Err(ProxyError::Unhealthy {
                        network_id: network_id.to_string(),
                        reason: e.to_string(),
                    })
                }
                Err(e) => {
                    debug!(network_id = %network_id, "Stats socket not ready: {}", e);
                    sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}

/// Read a pidfile written by the daemon
pub(crate) fn read_pid(path: &Path) -> Result<Pid, ProxyError> {
    let content = std::fs::read_to_string(path).map_err(|e| ProxyError::PidFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    // Master-worker mode writes one PID per line; the first is the one to signal
    let first = content.lines().next().unwrap_or("").trim();
    first
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw)
        .ok_or_else(|| ProxyError::PidFile {
            path: path.to_path_buf(),
            reason: format!("not a PID: {:?}", first),
        })
}

async fn wait_for_pid(path: &Path, deadline: Instant) -> Result<Pid, ProxyError> {
    loop {
        match read_pid(path) {
            Ok(pid) => return Ok(pid),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => sleep(POLL_INTERVAL).await,
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = ?path, "Failed to remove file: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl ProxyController for HaproxyController {
    fn is_running(&self, network_id: &str) -> bool {
        let Some(instance) = self.instances.get(network_id).map(|entry| entry.clone()) else {
            return false;
        };

        // The daemon may have re-written its pidfile since startup
        let pid = read_pid(&instance.pid_path).unwrap_or(instance.pid);

        match kill(pid, None::<Signal>) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    network_id = %network_id,
                    pid = %pid,
                    "Tracked proxy is gone ({}), evicting", e
                );
                if let Some((_, stale)) = self.instances.remove(network_id) {
                    remove_quietly(&stale.config_path);
                    remove_quietly(&stale.pid_path);
                    remove_quietly(stale.stats.path());
                }
                false
            }
        }
    }

    async fn add_instance(&self, injection: &ServiceInjection) -> Result<(), ProxyError> {
        let network_id = injection.network_id.as_str();
        if self.is_running(network_id) {
            debug!(network_id = %network_id, "Proxy already running");
            return Ok(());
        }

        let config = self.render(injection)?;
        let config_path = self.layout.config_path(network_id);
        let pid_path = self.layout.pid_path(network_id);
        let stats = StatsClient::new(self.layout.stats_socket_path(network_id));

        tokio::fs::create_dir_all(self.layout.root()).await?;
        tokio::fs::write(&config_path, config).await?;
        remove_quietly(&pid_path);
        remove_quietly(stats.path());

        let deadline = Instant::now() + Duration::from_secs(self.settings.startup_timeout);
        self.launch(network_id, &config_path, &pid_path).await?;

        let pid = match wait_for_pid(&pid_path, deadline).await {
            Ok(pid) => pid,
            Err(e) => {
                remove_quietly(stats.path());
                return Err(e);
            }
        };
        if let Err(e) = self.wait_healthy(network_id, &stats, deadline).await {
            let _ = kill(pid, Signal::SIGTERM);
            remove_quietly(&pid_path);
            remove_quietly(stats.path());
            return Err(e);
        }

        info!(
            network_id = %network_id,
            pid = %pid,
            ports = ?injection.ports,
            protocol = %injection.protocol,
            "Proxy started"
        );

        self.instances.insert(
            network_id.to_string(),
            Instance {
                pid,
                config_path,
                pid_path,
                stats,
            },
        );
        Ok(())
    }

    async fn remove_instance(&self, network_id: &str) -> Result<(), ProxyError> {
        let (_, instance) = self
            .instances
            .remove(network_id)
            .ok_or_else(|| ProxyError::NotRunning(network_id.to_string()))?;

        let pid = read_pid(&instance.pid_path).unwrap_or(instance.pid);
        let signalled = kill(pid, Signal::SIGTERM);

        remove_quietly(&instance.config_path);
        remove_quietly(&instance.pid_path);

        match signalled {
            Ok(()) => {
                info!(network_id = %network_id, pid = %pid, "Proxy stopped");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(network_id = %network_id, pid = %pid, "Proxy had already exited");
                Ok(())
            }
            Err(e) => Err(ProxyError::Signal(e)),
        }
    }

    async fn collect_stats(&self) -> Vec<InstanceStats> {
        let targets: Vec<(String, StatsClient)> = self
            .instances
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats.clone()))
            .collect();

        let queries = targets.into_iter().map(|(network_id, stats)| async move {
            match timeout(STATS_TIMEOUT, stats.show_stat(&network_id)).await {
                Ok(Ok(snapshot)) => Some(snapshot),
                Ok(Err(e)) => {
                    warn!(network_id = %network_id, "Stats query failed: {}", e);
                    None
                }
                Err(_) => {
                    warn!(network_id = %network_id, "Stats query timed out");
                    None
                }
            }
        });

        futures::future::join_all(queries)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}
