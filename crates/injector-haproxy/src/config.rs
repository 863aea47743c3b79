//! HAProxy configuration rendering

use injector_proto::{Protocol, RuntimeLayout};
use std::fmt::Write;

/// Everything that goes into one network's proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig<'a> {
    pub network_id: &'a str,
    pub upstream_host: &'a str,
    pub ports: &'a [u16],
    pub protocol: Protocol,
    pub layout: &'a RuntimeLayout,
    pub user: Option<&'a str>,
    pub group: Option<&'a str>,
}

impl ProxyConfig<'_> {
    /// Render the configuration file text
    ///
    /// One frontend/backend pair per port. Frontends bind the bare port inside
    /// the namespace; backends target the ingress socket of the same port.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        let stats_socket = self.layout.stats_socket_path(self.network_id);

        writeln!(out, "# Managed by injector for network {}", self.network_id)?;
        writeln!(out, "global")?;
        writeln!(out, "    maxconn 4096")?;
        writeln!(
            out,
            "    stats socket {} mode 600 level admin",
            stats_socket.display()
        )?;
        if let Some(user) = self.user {
            writeln!(out, "    user {}", user)?;
        }
        if let Some(group) = self.group {
            writeln!(out, "    group {}", group)?;
        }
        writeln!(out)?;

        writeln!(out, "defaults")?;
        writeln!(out, "    mode {}", self.protocol.as_str())?;
        writeln!(out, "    timeout connect 5s")?;
        writeln!(out, "    timeout client 50s")?;
        writeln!(out, "    timeout server 50s")?;
        if self.protocol.is_http() {
            writeln!(out, "    option forwardfor")?;
        }

        for port in self.ports {
            let socket = self.layout.ingress_socket_path(*port);

            writeln!(out)?;
            writeln!(out, "frontend listener_{}", port)?;
            writeln!(out, "    bind :{}", port)?;
            writeln!(out, "    default_backend upstream_{}", port)?;

            writeln!(out)?;
            writeln!(out, "backend upstream_{}", port)?;
            if self.protocol.is_http() {
                writeln!(
                    out,
                    "    http-request set-header Host {}",
                    self.upstream_host
                )?;
            }
            writeln!(out, "    server upstream unix@{}", socket.display())?;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RuntimeLayout {
        RuntimeLayout::new("/run/injector")
    }

    #[test]
    fn test_render_tcp() {
        let layout = layout();
        let config = ProxyConfig {
            network_id: "net-a",
            upstream_host: "db.internal",
            ports: &[5432],
            protocol: Protocol::Tcp,
            layout: &layout,
            user: None,
            group: None,
        }
        .render()
        .unwrap();

        assert!(config.contains("stats socket /run/injector/net-a.sock"));
        assert!(config.contains("    mode tcp\n"));
        assert!(config.contains("frontend listener_5432\n    bind :5432\n"));
        assert!(config.contains("server upstream unix@/run/injector/ingress-5432.sock"));
        assert!(!config.contains("set-header"));
        assert!(!config.contains("    user "));
    }

    #[test]
    fn test_render_http_rewrites_host() {
        let layout = layout();
        let config = ProxyConfig {
            network_id: "net-b",
            upstream_host: "api.internal",
            ports: &[80, 443],
            protocol: Protocol::Http,
            layout: &layout,
            user: Some("haproxy"),
            group: Some("haproxy"),
        }
        .render()
        .unwrap();

        assert!(config.contains("    mode http\n"));
        assert_eq!(config.matches("http-request set-header Host api.internal").count(), 2);
        assert_eq!(config.matches("frontend listener_").count(), 2);
        assert_eq!(config.matches("backend upstream_").count(), 2);
        assert!(config.contains("    user haproxy\n"));
        assert!(config.contains("    group haproxy\n"));
    }
}
