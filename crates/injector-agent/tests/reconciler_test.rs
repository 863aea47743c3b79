//! Reconciler scenarios against an in-memory database and recording backends

use chrono::Utc;
use injector_agent::{
    CloudPortResolver, EndpointReconciler, JobScheduler, ReconcileError, ResolverError,
    Transition,
};
use injector_cloud::{FixedIp, Port, StaticCloud, Subnet};
use injector_db::entities::{endpoint, endpoint_port, Endpoint};
use injector_db::store::{self, ServiceRegistration};
use injector_db::{connect, migrate, EndpointStatus, SyncMode};
use injector_haproxy::{FakeProxyController, ProxyCall};
use injector_netns::{NamespaceCall, RecordingNamespaces};
use injector_proto::{Protocol, RuntimeLayout};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    _dir: tempfile::TempDir,
    db: DatabaseConnection,
    service_id: Uuid,
    layout: RuntimeLayout,
    cloud: Arc<StaticCloud>,
    namespaces: Arc<RecordingNamespaces>,
    proxies: Arc<FakeProxyController>,
    scheduler: Arc<JobScheduler>,
    reconciler: Arc<EndpointReconciler>,
}

fn cloud_port(id: &str, network_id: &str, ip: &str) -> Port {
    Port {
        id: id.to_string(),
        network_id: network_id.to_string(),
        mac_address: "fa:16:3e:00:00:01".to_string(),
        fixed_ips: vec![FixedIp {
            subnet_id: format!("sub-{}", network_id),
            ip_address: ip.parse().unwrap(),
        }],
    }
}

fn cloud_subnet(network_id: &str, cidr: &str) -> Subnet {
    Subnet {
        id: format!("sub-{}", network_id),
        cidr: cidr.to_string(),
    }
}

async fn setup() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let layout = RuntimeLayout::new(dir.path());

    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    migrate(&db).await.expect("Failed to run migrations");

    let service = store::ensure_service(
        &db,
        &ServiceRegistration {
            name: "billing-api".to_string(),
            host: "node-01".to_string(),
            availability_zone: None,
            ports: vec![80, 443],
            protocol: Protocol::Http,
        },
        true,
    )
    .await
    .unwrap();

    let cloud = Arc::new(
        StaticCloud::new()
            .with_port(cloud_port("port-a", "net-a", "10.0.0.5"))
            .with_port(cloud_port("port-b", "net-a", "10.0.0.6"))
            .with_port(cloud_port("port-c", "net-c", "10.2.0.5"))
            .with_subnet(cloud_subnet("net-a", "10.0.0.0/24"))
            .with_subnet(cloud_subnet("net-c", "10.2.0.0/16")),
    );
    let namespaces = Arc::new(RecordingNamespaces::new());
    let proxies = Arc::new(FakeProxyController::new(layout.clone(), "billing.internal"));

    let resolver = Arc::new(CloudPortResolver::new(
        cloud.clone(),
        namespaces.clone(),
        proxies.clone(),
        layout.clone(),
    ));
    let scheduler = Arc::new(JobScheduler::new(4));
    let reconciler = Arc::new(EndpointReconciler::new(
        db.clone(),
        resolver,
        scheduler.clone(),
        service.id,
        Duration::from_millis(50),
    ));

    Harness {
        _dir: dir,
        db,
        service_id: service.id,
        layout,
        cloud,
        namespaces,
        proxies,
        scheduler,
        reconciler,
    }
}

impl Harness {
    async fn insert(&self, port_id: &str, network_id: &str, status: EndpointStatus) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();

        endpoint::ActiveModel {
            id: Set(id),
            service_id: Set(self.service_id),
            project_id: Set(Some("project-a".to_string())),
            status: Set(status),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
        .expect("Failed to insert endpoint");

        endpoint_port::ActiveModel {
            endpoint_id: Set(id),
            port_id: Set(port_id.to_string()),
            network_id: Set(network_id.to_string()),
            ip_address: Set(None),
        }
        .insert(&self.db)
        .await
        .expect("Failed to insert endpoint port");

        id
    }

    async fn status(&self, id: Uuid) -> Option<EndpointStatus> {
        Endpoint::find_by_id(id)
            .one(&self.db)
            .await
            .unwrap()
            .map(|row| row.status)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pending_create_becomes_available() {
    let h = setup().await;
    let id = h.insert("port-a", "net-a", EndpointStatus::PendingCreate).await;

    let transition = h.reconciler.process_endpoint(id).await.unwrap();

    assert_eq!(transition, Transition::Available);
    assert_eq!(h.status(id).await, Some(EndpointStatus::Available));
    assert_eq!(h.proxies.running(), vec!["net-a".to_string()]);
    assert!(h.namespaces.exists("net-a"));
    assert_eq!(h.namespaces.entered_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pending_delete_tears_down_and_removes_row() {
    let h = setup().await;
    let created = h.insert("port-a", "net-a", EndpointStatus::PendingCreate).await;
    h.reconciler.process_endpoint(created).await.unwrap();

    let deleted = h.insert("port-a", "net-a", EndpointStatus::PendingDelete).await;
    // The other endpoint on net-a goes away first so the network is released
    store::update_status(&h.db, created, EndpointStatus::PendingDelete)
        .await
        .unwrap();

    assert_eq!(
        h.reconciler.process_endpoint(deleted).await.unwrap(),
        Transition::Deleted
    );
    assert_eq!(h.status(deleted).await, None);
    assert!(h.proxies.running().is_empty());
    assert!(!h.namespaces.exists("net-a"));

    let calls = h.proxies.calls();
    assert_eq!(calls.last(), Some(&ProxyCall::Remove("net-a".to_string())));
    assert_eq!(
        h.namespaces.calls().last(),
        Some(&NamespaceCall::Delete("net-a".to_string()))
    );

    // Tearing down the second endpoint finds nothing left to remove
    assert_eq!(
        h.reconciler.process_endpoint(created).await.unwrap(),
        Transition::Deleted
    );
    assert_eq!(h.status(created).await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_start_keeps_status_and_cleans_up() {
    let h = setup().await;
    h.proxies.fail_start("net-a");
    let id = h.insert("port-a", "net-a", EndpointStatus::PendingCreate).await;

    let err = h.reconciler.process_endpoint(id).await.unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::Resolver(ResolverError::ProxyStartFailed { .. })
    ));
    assert_eq!(h.status(id).await, Some(EndpointStatus::PendingCreate));
    assert!(!h.layout.config_path("net-a").exists());
    assert!(!h.layout.log_path("net-a").exists());
    assert!(h.proxies.running().is_empty());

    // Next pass succeeds once the proxy can start
    h.proxies.recover("net-a");
    assert_eq!(
        h.reconciler.process_endpoint(id).await.unwrap(),
        Transition::Available
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_cloud_port_leaves_endpoint_untouched() {
    let h = setup().await;
    let creating = h.insert("port-a", "net-a", EndpointStatus::PendingCreate).await;
    let deleting = h.insert("port-c", "net-c", EndpointStatus::PendingDelete).await;
    h.cloud.remove_port("port-a");
    h.cloud.remove_port("port-c");

    let err = h.reconciler.process_endpoint(creating).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Resolver(ResolverError::Cloud(_))));
    let err = h.reconciler.process_endpoint(deleting).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Resolver(ResolverError::Cloud(_))));

    assert_eq!(h.status(creating).await, Some(EndpointStatus::PendingCreate));
    assert_eq!(h.status(deleting).await, Some(EndpointStatus::PendingDelete));
    assert!(h.namespaces.calls().is_empty());
    assert!(h.proxies.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_available_endpoint_is_a_fixed_point() {
    let h = setup().await;
    let id = h.insert("port-a", "net-a", EndpointStatus::Available).await;

    for _ in 0..3 {
        assert_eq!(
            h.reconciler.process_endpoint(id).await.unwrap(),
            Transition::Unchanged
        );
    }

    assert_eq!(h.status(id).await, Some(EndpointStatus::Available));
    assert_eq!(h.proxies.calls(), vec![ProxyCall::Add("net-a".to_string())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_network_survives_one_teardown() {
    let h = setup().await;
    let first = h.insert("port-a", "net-a", EndpointStatus::PendingCreate).await;
    let second = h.insert("port-b", "net-a", EndpointStatus::PendingCreate).await;
    h.reconciler.process_endpoint(first).await.unwrap();
    h.reconciler.process_endpoint(second).await.unwrap();
    assert_eq!(h.proxies.calls().len(), 1);

    store::update_status(&h.db, first, EndpointStatus::PendingRejected)
        .await
        .unwrap();
    assert_eq!(
        h.reconciler.process_endpoint(first).await.unwrap(),
        Transition::Rejected
    );

    assert_eq!(h.status(first).await, Some(EndpointStatus::Rejected));
    assert_eq!(h.proxies.running(), vec!["net-a".to_string()]);
    assert!(h.namespaces.exists("net-a"));

    // Rejected endpoints are left alone
    assert_eq!(
        h.reconciler.process_endpoint(first).await.unwrap(),
        Transition::Unchanged
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_schedules_each_endpoint_once() {
    let h = setup().await;
    let a = h.insert("port-a", "net-a", EndpointStatus::PendingCreate).await;
    let c = h.insert("port-c", "net-c", EndpointStatus::Failed).await;
    let rejected = h.insert("port-b", "net-a", EndpointStatus::Rejected).await;

    let scheduled = h.reconciler.sync(SyncMode::Full).await.unwrap();
    assert_eq!(scheduled, 2);

    assert!(h.scheduler.shutdown(Duration::from_secs(5)).await);
    assert_eq!(h.status(a).await, Some(EndpointStatus::Available));
    assert_eq!(h.status(c).await, Some(EndpointStatus::Available));
    assert_eq!(h.status(rejected).await, Some(EndpointStatus::Rejected));
    assert_eq!(
        h.proxies.running(),
        vec!["net-a".to_string(), "net-c".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gone_endpoint_is_skipped() {
    let h = setup().await;
    assert_eq!(
        h.reconciler.process_endpoint(Uuid::new_v4()).await.unwrap(),
        Transition::Gone
    );
}
