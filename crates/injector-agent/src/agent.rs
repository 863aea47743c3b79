//! Agent runtime: builds every component and runs the background loops

use crate::config::{AgentConfig, ConfigError};
use crate::reconciler::EndpointReconciler;
use crate::resolver::CloudPortResolver;
use crate::scheduler::JobScheduler;
use crate::stats::StatsRegistry;
use injector_cloud::{CloudClient, CloudError, NeutronClient};
use injector_db::store;
use injector_haproxy::{HaproxyController, ProxyController};
use injector_ingress::{IngressConfig, IngressCounters, IngressError, IngressMultiplexer};
use injector_netns::NamespaceManager;
use sea_orm::{DatabaseConnection, DbErr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Cloud API error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Ingress error: {0}")]
    Ingress(#[from] IngressError),

    #[error("Unsupported platform: {0}")]
    Unsupported(String),
}

pub struct Agent {
    config: AgentConfig,
    service_id: Uuid,
    scheduler: Arc<JobScheduler>,
    resolver: Arc<CloudPortResolver>,
    reconciler: Arc<EndpointReconciler>,
    stats: Arc<StatsRegistry>,
    ingress: IngressMultiplexer,
}

#[cfg(target_os = "linux")]
fn platform_namespaces() -> Result<Arc<dyn NamespaceManager>, AgentError> {
    Ok(Arc::new(injector_netns::LinuxNamespaces::new()))
}

#[cfg(not(target_os = "linux"))]
fn platform_namespaces() -> Result<Arc<dyn NamespaceManager>, AgentError> {
    Err(AgentError::Unsupported(
        "network namespaces are only available on Linux".to_string(),
    ))
}

impl Agent {
    /// Build the production agent
    ///
    /// Registers the service, authenticates against the cloud API and binds
    /// the ingress sockets. Any failure here is fatal.
    pub async fn bootstrap(config: AgentConfig, db: DatabaseConnection) -> Result<Self, AgentError> {
        config.validate()?;

        let cloud: Arc<dyn CloudClient> =
            Arc::new(NeutronClient::authenticate(config.cloud.clone()).await?);
        let namespaces = platform_namespaces()?;
        let proxies: Arc<dyn ProxyController> = Arc::new(HaproxyController::new(
            config.haproxy.clone(),
            &config.service.upstream_host,
            config.layout(),
        ));

        Self::assemble(config, db, cloud, namespaces, proxies).await
    }

    /// Build an agent from explicit backends
    pub async fn assemble(
        config: AgentConfig,
        db: DatabaseConnection,
        cloud: Arc<dyn CloudClient>,
        namespaces: Arc<dyn NamespaceManager>,
        proxies: Arc<dyn ProxyController>,
    ) -> Result<Self, AgentError> {
        let service = store::ensure_service(
            &db,
            &config.registration(),
            config.service.auto_create,
        )
        .await?;

        let ingress = IngressMultiplexer::bind(IngressConfig {
            upstream_host: config.service.upstream_host.clone(),
            ports: config.service.ports.clone(),
            layout: config.layout(),
            shutdown_grace: config.shutdown_grace(),
        })
        .await?;

        let scheduler = Arc::new(JobScheduler::new(config.max_concurrent_jobs));
        let resolver = Arc::new(CloudPortResolver::new(
            cloud,
            namespaces,
            proxies,
            config.layout(),
        ));
        let reconciler = Arc::new(EndpointReconciler::new(
            db,
            resolver.clone(),
            scheduler.clone(),
            service.id,
            config.sync_interval(),
        ));

        info!(
            service_id = %service.id,
            service = %service.name,
            host = %service.host,
            "Agent assembled"
        );

        Ok(Self {
            config,
            service_id: service.id,
            scheduler,
            resolver,
            reconciler,
            stats: Arc::new(StatsRegistry::new()),
            ingress,
        })
    }

    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    pub fn stats(&self) -> Arc<StatsRegistry> {
        self.stats.clone()
    }

    pub fn reconciler(&self) -> Arc<EndpointReconciler> {
        self.reconciler.clone()
    }

    /// Run until `shutdown` is cancelled, then drain
    ///
    /// In-flight endpoint jobs and ingress relays get the configured grace
    /// period; stragglers are abandoned.
    pub async fn run(self, shutdown: CancellationToken) {
        let Agent {
            config,
            scheduler,
            resolver,
            reconciler,
            stats,
            ingress,
            ..
        } = self;

        let counters = ingress.counters();
        let ingress_task = tokio::spawn(ingress.serve(shutdown.clone()));

        if let Err(e) = scheduler.spawn(reconciler.run(shutdown.clone())) {
            error!("Failed to start reconciler: {}", e);
        }
        if let Err(e) = scheduler.spawn(stats_loop(
            resolver,
            stats,
            counters,
            config.stats_interval(),
            shutdown.clone(),
        )) {
            error!("Failed to start stats collection: {}", e);
        }

        info!("Agent running");
        shutdown.cancelled().await;
        info!("Shutting down agent");

        let grace = config.shutdown_grace();
        if !scheduler.shutdown(grace).await {
            warn!(
                pending = scheduler.pending(),
                "Endpoint jobs still running after {:?}, abandoning them", grace
            );
        }

        if let Err(e) = ingress_task.await {
            error!("Ingress multiplexer task failed: {}", e);
        }

        info!("Agent stopped");
    }
}

async fn stats_loop(
    resolver: Arc<CloudPortResolver>,
    stats: Arc<StatsRegistry>,
    counters: Arc<IngressCounters>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let snapshots = resolver.collect_stats().await;
        for snapshot in &snapshots {
            debug!(
                network_id = %snapshot.network_id,
                current_sessions = snapshot.current_sessions,
                total_sessions = snapshot.total_sessions,
                bytes_in = snapshot.bytes_in,
                bytes_out = snapshot.bytes_out,
                "Proxy stats"
            );
        }
        stats.record(snapshots);

        debug!(
            connections = counters.connections(),
            bytes_to_upstream = counters.bytes_to_upstream(),
            bytes_to_proxy = counters.bytes_to_proxy(),
            "Ingress stats"
        );
    }
}
