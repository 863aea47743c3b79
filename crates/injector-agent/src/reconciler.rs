//! Endpoint reconciliation
//!
//! Each endpoint is processed inside its own transaction holding the endpoint's
//! row lock. The status moves only when the resolver call succeeds; any error
//! rolls the transaction back so the next pass retries the endpoint.

use crate::resolver::{CloudPortResolver, ResolverError};
use crate::scheduler::{JobScheduler, SchedulerError};
use injector_db::store::{self, LockedInjection};
use injector_db::{EndpointStatus, SyncMode};
use injector_proto::ServiceInjection;
use sea_orm::{DatabaseConnection, DatabaseTransaction, DbErr, TransactionTrait};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error(transparent)]
    Resolver(#[from] ResolverError),
}

/// Outcome of processing one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Injection enabled, status moved to `AVAILABLE`
    Available,
    /// Injection verified, status left as it was
    Unchanged,
    /// Injection torn down, status moved to `REJECTED`
    Rejected,
    /// Injection torn down, endpoint row removed
    Deleted,
    /// Endpoint no longer exists
    Gone,
}

pub struct EndpointReconciler {
    db: DatabaseConnection,
    resolver: Arc<CloudPortResolver>,
    scheduler: Arc<JobScheduler>,
    service_id: Uuid,
    sync_interval: Duration,
}

impl EndpointReconciler {
    pub fn new(
        db: DatabaseConnection,
        resolver: Arc<CloudPortResolver>,
        scheduler: Arc<JobScheduler>,
        service_id: Uuid,
        sync_interval: Duration,
    ) -> Self {
        Self {
            db,
            resolver,
            scheduler,
            service_id,
            sync_interval,
        }
    }

    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    /// List endpoints needing work and schedule one job per endpoint
    ///
    /// Endpoints whose job from an earlier pass is still pending are skipped.
    /// Returns the number of jobs scheduled.
    pub async fn sync(self: &Arc<Self>, mode: SyncMode) -> Result<usize, ReconcileError> {
        let candidates = store::list_sync_candidates(&self.db, self.service_id, mode).await?;
        debug!(mode = ?mode, candidates = candidates.len(), "Sync pass");

        let mut scheduled = 0;
        for endpoint_id in candidates {
            let reconciler = self.clone();
            let job = async move {
                reconciler.process_logged(endpoint_id).await;
            };

            match self.scheduler.spawn_once(&endpoint_id.to_string(), job) {
                Ok(()) => scheduled += 1,
                Err(SchedulerError::AlreadyScheduled(_)) => {
                    debug!(endpoint_id = %endpoint_id, "Endpoint already in flight");
                }
                Err(SchedulerError::Closed) => {
                    debug!("Scheduler closed, ending sync pass");
                    break;
                }
            }
        }

        Ok(scheduled)
    }

    /// Drive one endpoint through its state machine
    pub async fn process_endpoint(&self, endpoint_id: Uuid) -> Result<Transition, ReconcileError> {
        let txn = self.db.begin().await?;

        match self.apply(&txn, endpoint_id).await {
            Ok(transition) => {
                txn.commit().await?;
                Ok(transition)
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!(endpoint_id = %endpoint_id, "Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        txn: &DatabaseTransaction,
        endpoint_id: Uuid,
    ) -> Result<Transition, ReconcileError> {
        let Some(LockedInjection { status, injection }) =
            store::lock_injection(txn, endpoint_id).await?
        else {
            return Ok(Transition::Gone);
        };

        match status {
            EndpointStatus::PendingRejected => {
                self.teardown(txn, &injection).await?;
                store::update_status(txn, endpoint_id, EndpointStatus::Rejected).await?;
                Ok(Transition::Rejected)
            }
            EndpointStatus::PendingDelete => {
                self.teardown(txn, &injection).await?;
                store::delete_endpoint(txn, endpoint_id).await?;
                Ok(Transition::Deleted)
            }
            EndpointStatus::Available => {
                self.resolver.enable_injection(&injection).await?;
                Ok(Transition::Unchanged)
            }
            EndpointStatus::PendingCreate
            | EndpointStatus::PendingUpdate
            | EndpointStatus::Failed => {
                self.resolver.enable_injection(&injection).await?;
                store::update_status(txn, endpoint_id, EndpointStatus::Available).await?;
                Ok(Transition::Available)
            }
            EndpointStatus::Rejected => Ok(Transition::Unchanged),
        }
    }

    /// Disable the injection unless another endpoint still uses the network
    async fn teardown(
        &self,
        txn: &DatabaseTransaction,
        injection: &ServiceInjection,
    ) -> Result<(), ReconcileError> {
        let peers = store::count_network_peers(
            txn,
            injection.service_id,
            &injection.network_id,
            injection.endpoint_id,
        )
        .await?;

        if peers > 0 {
            info!(
                endpoint_id = %injection.endpoint_id,
                network_id = %injection.network_id,
                peers = peers,
                "Network still in use, keeping injection"
            );
            return Ok(());
        }

        self.resolver.disable_injection(injection).await?;
        Ok(())
    }

    async fn process_logged(&self, endpoint_id: Uuid) {
        match self.process_endpoint(endpoint_id).await {
            Ok(Transition::Unchanged) | Ok(Transition::Gone) => {
                debug!(endpoint_id = %endpoint_id, "Endpoint up to date");
            }
            Ok(transition) => {
                info!(endpoint_id = %endpoint_id, transition = ?transition, "Endpoint reconciled");
            }
            Err(e) => {
                error!(endpoint_id = %endpoint_id, "Failed to reconcile endpoint: {}", e);
            }
        }
    }

    /// Run sync passes until `shutdown` is cancelled
    ///
    /// The first pass covers every endpoint; later passes only pick up
    /// endpoints that need work. A full pass is repeated until one succeeds.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.sync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut mode = SyncMode::Full;

        info!(service_id = %self.service_id, "Reconciler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.sync(mode).await {
                Ok(scheduled) => {
                    if scheduled > 0 {
                        debug!(scheduled = scheduled, "Scheduled endpoint jobs");
                    }
                    mode = SyncMode::Incremental;
                }
                Err(e) => {
                    error!(mode = ?mode, "Sync pass failed: {}", e);
                }
            }
        }

        info!("Reconciler stopped");
    }
}
