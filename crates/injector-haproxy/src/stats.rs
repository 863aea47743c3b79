//! Stats socket client
//!
//! HAProxy answers `show stat` on its admin socket with a CSV table whose first
//! line is the header, prefixed with `# `.

use crate::ProxyError;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Aggregated frontend counters of one proxy instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstanceStats {
    pub network_id: String,
    pub current_sessions: u64,
    pub total_sessions: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Client for one instance's admin socket
#[derive(Debug, Clone)]
pub struct StatsClient {
    path: PathBuf,
}

impl StatsClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send one command and read the whole reply
    pub async fn query(&self, command: &str) -> Result<String, ProxyError> {
        let mut stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| ProxyError::Stats(format!("connect {:?}: {}", self.path, e)))?;

        stream.write_all(format!("{}\n", command).as_bytes()).await?;
        stream.flush().await?;

        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        Ok(reply)
    }

    /// Query and aggregate the frontend counters
    pub async fn show_stat(&self, network_id: &str) -> Result<InstanceStats, ProxyError> {
        let reply = self.query("show stat").await?;
        parse_stat_csv(network_id, &reply)
    }
}

/// Sum the counters of every FRONTEND row in a `show stat` reply
pub fn parse_stat_csv(network_id: &str, csv: &str) -> Result<InstanceStats, ProxyError> {
    let mut lines = csv.lines().filter(|line| !line.trim().is_empty());

    let header = lines
        .next()
        .and_then(|line| line.strip_prefix("# "))
        .ok_or_else(|| ProxyError::Stats("missing CSV header".to_string()))?;

    let columns: HashMap<&str, usize> = header
        .split(',')
        .enumerate()
        .map(|(index, name)| (name, index))
        .collect();

    let column = |name: &str| {
        columns
            .get(name)
            .copied()
            .ok_or_else(|| ProxyError::Stats(format!("missing column {}", name)))
    };
    let svname = column("svname")?;
    let scur = column("scur")?;
    let stot = column("stot")?;
    let bin = column("bin")?;
    let bout = column("bout")?;

    let mut stats = InstanceStats {
        network_id: network_id.to_string(),
        ..Default::default()
    };

    for line in lines {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.get(svname) != Some(&"FRONTEND") {
            continue;
        }
        let value = |index: usize| -> u64 {
            fields
                .get(index)
                .and_then(|field| field.parse().ok())
                .unwrap_or(0)
        };
        stats.current_sessions += value(scur);
        stats.total_sessions += value(stot);
        stats.bytes_in += value(bin);
        stats.bytes_out += value(bout);
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    const REPLY: &str = "# pxname,svname,qcur,qmax,scur,smax,slim,stot,bin,bout,\n\
listener_80,FRONTEND,,,2,5,4096,120,1000,2000,\n\
upstream_80,upstream,0,0,2,5,,120,1000,2000,\n\
upstream_80,BACKEND,0,0,2,5,410,120,1000,2000,\n\
listener_443,FRONTEND,,,1,3,4096,30,500,700,\n\
\n";

    #[test]
    fn test_parse_sums_frontends() {
        let stats = parse_stat_csv("net-a", REPLY).unwrap();
        assert_eq!(
            stats,
            InstanceStats {
                network_id: "net-a".to_string(),
                current_sessions: 3,
                total_sessions: 150,
                bytes_in: 1500,
                bytes_out: 2700,
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_stat_csv("net-a", "Unknown command\n").is_err());
        assert!(parse_stat_csv("net-a", "# pxname,svname\n").is_err());
    }

    #[tokio::test]
    async fn test_show_stat_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"show stat\n");
            stream.write_all(REPLY.as_bytes()).await.unwrap();
        });

        let stats = StatsClient::new(&path).show_stat("net-a").await.unwrap();
        assert_eq!(stats.total_sessions, 150);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let client = StatsClient::new(dir.path().join("absent.sock"));
        assert!(matches!(
            client.query("show info").await,
            Err(ProxyError::Stats(_))
        ));
    }
}
