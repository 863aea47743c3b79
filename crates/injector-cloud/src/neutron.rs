//! Neutron (OpenStack networking) client with Keystone v3 authentication

use crate::{CloudClient, CloudError, Port, Subnet};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Credentials and endpoint selection for the cloud API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    /// Keystone v3 URL (e.g., https://keystone.example.com:5000/v3)
    #[serde(default)]
    pub auth_url: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    #[serde(default)]
    pub project_name: Option<String>,

    #[serde(default = "default_domain")]
    pub user_domain_name: String,

    #[serde(default = "default_domain")]
    pub project_domain_name: String,

    /// Catalog region to pick the network endpoint from
    #[serde(default)]
    pub region_name: Option<String>,

    /// Catalog interface (public, internal, admin)
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Network API endpoint, overriding the catalog
    #[serde(default)]
    pub network_endpoint: Option<String>,

    /// Pre-issued token; used together with `network_endpoint` to skip Keystone
    #[serde(default, skip_serializing)]
    pub token: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_domain() -> String {
    "Default".to_string()
}

fn default_interface() -> String {
    "internal".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            auth_url: None,
            username: None,
            password: None,
            project_name: None,
            user_domain_name: default_domain(),
            project_domain_name: default_domain(),
            region_name: None,
            interface: default_interface(),
            network_endpoint: None,
            token: None,
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    endpoint: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

#[derive(Deserialize)]
struct PortEnvelope {
    port: Port,
}

#[derive(Deserialize)]
struct SubnetEnvelope {
    subnet: Subnet,
}

/// Neutron API client
pub struct NeutronClient {
    http: reqwest::Client,
    settings: CloudSettings,
    session: RwLock<Session>,
}

impl NeutronClient {
    /// Authenticate and resolve the network endpoint
    ///
    /// Fails if the credentials are rejected or the catalog carries no network
    /// endpoint for the configured interface and region.
    pub async fn authenticate(settings: CloudSettings) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        let session = Self::open_session(&http, &settings).await?;
        info!(endpoint = %session.endpoint, "Authenticated against cloud API");

        Ok(Self {
            http,
            settings,
            session: RwLock::new(session),
        })
    }

    fn can_reauthenticate(&self) -> bool {
        self.settings.auth_url.is_some()
    }

    async fn open_session(
        http: &reqwest::Client,
        settings: &CloudSettings,
    ) -> Result<Session, CloudError> {
        if let (Some(token), Some(endpoint)) = (&settings.token, &settings.network_endpoint) {
            return Ok(Session {
                token: token.clone(),
                endpoint: endpoint.clone(),
            });
        }

        let auth_url = settings
            .auth_url
            .as_deref()
            .ok_or_else(|| CloudError::Auth("auth_url is required".to_string()))?;
        let username = settings
            .username
            .as_deref()
            .ok_or_else(|| CloudError::Auth("username is required".to_string()))?;
        let password = settings
            .password
            .as_deref()
            .ok_or_else(|| CloudError::Auth("password is required".to_string()))?;
        let project_name = settings
            .project_name
            .as_deref()
            .ok_or_else(|| CloudError::Auth("project_name is required".to_string()))?;

        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": username,
                            "domain": { "name": settings.user_domain_name },
                            "password": password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": project_name,
                        "domain": { "name": settings.project_domain_name },
                    }
                }
            }
        });

        let url = format!("{}/auth/tokens", auth_url.trim_end_matches('/'));
        debug!(url = %url, user = %username, "Requesting Keystone token");

        let response = http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(CloudError::Auth(format!(
                "Keystone returned {} for user {}",
                response.status(),
                username
            )));
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CloudError::Auth("missing X-Subject-Token header".to_string()))?;

        let body: TokenResponse = response.json().await?;

        let endpoint = match &settings.network_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => select_endpoint(
                &body.token.catalog,
                &settings.interface,
                settings.region_name.as_deref(),
            )
            .ok_or_else(|| {
                CloudError::Auth(format!(
                    "no {} network endpoint in service catalog",
                    settings.interface
                ))
            })?,
        };

        Ok(Session { token, endpoint })
    }

    async fn reauthenticate(&self) -> Result<(), CloudError> {
        warn!("Cloud API token rejected, re-authenticating");
        let session = Self::open_session(&self.http, &self.settings).await?;
        *self.session.write().await = session;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        kind: &'static str,
        id: &str,
    ) -> Result<T, CloudError> {
        for attempt in 0..2 {
            let session = self.session.read().await.clone();
            let url = format!("{}/v2.0/{}", session.endpoint.trim_end_matches('/'), path);

            let response = self
                .http
                .get(&url)
                .header("X-Auth-Token", &session.token)
                .send()
                .await?;

            match response.status() {
                StatusCode::NOT_FOUND => {
                    return Err(CloudError::NotFound {
                        kind,
                        id: id.to_string(),
                    })
                }
                StatusCode::UNAUTHORIZED if attempt == 0 && self.can_reauthenticate() => {
                    self.reauthenticate().await?;
                }
                status if !status.is_success() => {
                    return Err(CloudError::Status {
                        status: status.as_u16(),
                        url,
                    })
                }
                _ => return Ok(response.json().await?),
            }
        }

        Err(CloudError::Auth(format!(
            "token rejected after re-authentication while fetching {} {}",
            kind, id
        )))
    }
}

/// Pick the network endpoint URL from a Keystone service catalog
fn select_endpoint(
    catalog: &[CatalogEntry],
    interface: &str,
    region: Option<&str>,
) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == "network")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|endpoint| {
            endpoint.interface == interface
                && region.map_or(true, |wanted| {
                    endpoint.region_id.as_deref() == Some(wanted)
                        || endpoint.region.as_deref() == Some(wanted)
                })
        })
        .map(|endpoint| endpoint.url.clone())
}

#[async_trait::async_trait]
impl CloudClient for NeutronClient {
    async fn get_port(&self, port_id: &str) -> Result<Port, CloudError> {
        let envelope: PortEnvelope = self
            .get_json(&format!("ports/{}", port_id), "port", port_id)
            .await?;
        Ok(envelope.port)
    }

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError> {
        let envelope: SubnetEnvelope = self
            .get_json(&format!("subnets/{}", subnet_id), "subnet", subnet_id)
            .await?;
        Ok(envelope.subnet)
    }
}
