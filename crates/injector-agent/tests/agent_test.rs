//! Full agent run with recording backends

use chrono::Utc;
use injector_agent::{Agent, AgentConfig};
use injector_cloud::{FixedIp, Port, StaticCloud, Subnet};
use injector_db::entities::{endpoint, endpoint_port, Endpoint};
use injector_db::{connect, migrate, EndpointStatus};
use injector_haproxy::{FakeProxyController, InstanceStats};
use injector_netns::RecordingNamespaces;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn config(runtime_dir: &std::path::Path, port: u16) -> AgentConfig {
    let yaml = format!(
        r#"
database_url: "sqlite::memory:"
host: node-01
runtime_dir: {}
sync_interval: 1
stats_interval: 1
shutdown_grace: 1
service:
  name: billing-api
  upstream_host: 127.0.0.1
  ports: [{}]
"#,
        runtime_dir.display(),
        port
    );
    AgentConfig::from_yaml(&yaml).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_reconciles_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = upstream.local_addr().unwrap().port();
    let config = config(dir.path(), port);
    let layout = config.layout();

    let db = connect("sqlite::memory:").await.unwrap();
    migrate(&db).await.unwrap();

    let cloud = StaticCloud::new()
        .with_port(Port {
            id: "port-a".to_string(),
            network_id: "net-a".to_string(),
            mac_address: "fa:16:3e:00:00:0a".to_string(),
            fixed_ips: vec![FixedIp {
                subnet_id: "sub-a".to_string(),
                ip_address: "10.0.0.5".parse().unwrap(),
            }],
        })
        .with_subnet(Subnet {
            id: "sub-a".to_string(),
            cidr: "10.0.0.0/24".to_string(),
        });
    let proxies = Arc::new(FakeProxyController::new(layout.clone(), "127.0.0.1"));

    let agent = Agent::assemble(
        config,
        db.clone(),
        Arc::new(cloud),
        Arc::new(RecordingNamespaces::new()),
        proxies.clone(),
    )
    .await
    .unwrap();
    let stats = agent.stats();
    assert!(layout.ingress_socket_path(port).exists());

    let id = Uuid::new_v4();
    let now = Utc::now();
    endpoint::ActiveModel {
        id: Set(id),
        service_id: Set(agent.service_id()),
        project_id: Set(None),
        status: Set(EndpointStatus::PendingCreate),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&db)
    .await
    .unwrap();
    endpoint_port::ActiveModel {
        endpoint_id: Set(id),
        port_id: Set("port-a".to_string()),
        network_id: Set("net-a".to_string()),
        ip_address: Set(Some("10.0.0.5".to_string())),
    }
    .insert(&db)
    .await
    .unwrap();

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(agent.run(shutdown.clone()));

    let mut status = None;
    for _ in 0..100 {
        status = Endpoint::find_by_id(id)
            .one(&db)
            .await
            .unwrap()
            .map(|row| row.status);
        if status == Some(EndpointStatus::Available) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(status, Some(EndpointStatus::Available));

    proxies.set_stats(InstanceStats {
        network_id: "net-a".to_string(),
        current_sessions: 3,
        total_sessions: 7,
        bytes_in: 10,
        bytes_out: 20,
    });
    for _ in 0..50 {
        if stats.get("net-a").map(|s| s.current_sessions) == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(stats.totals().total_sessions, 7);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("agent did not stop")
        .unwrap();
    assert!(!layout.ingress_socket_path(port).exists());
}

#[tokio::test]
async fn test_assemble_without_registered_service_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 8080);
    config.service.auto_create = false;
    let layout = config.layout();

    let db = connect("sqlite::memory:").await.unwrap();
    migrate(&db).await.unwrap();

    let result = Agent::assemble(
        config,
        db,
        Arc::new(StaticCloud::new()),
        Arc::new(RecordingNamespaces::new()),
        Arc::new(FakeProxyController::new(layout, "127.0.0.1")),
    )
    .await;

    assert!(matches!(result, Err(injector_agent::AgentError::Database(_))));
}
