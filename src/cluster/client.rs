//! Cluster API client.
//!
//! `ClusterApi` is the trait the build pipeline consumes; `HttpClusterClient`
//! implements it against the Proxmox-style REST control plane. The trait
//! exists so tests (and alternative control planes) can substitute an
//! in-memory implementation.

use crate::config::ConnectionConfig;
use crate::cluster::spec::{InstanceRef, InstanceSpec};
use crate::errors::ClusterError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Instance CRUD against the virtualization control plane.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create an instance described by `spec` under the identity `instance`.
    async fn create_instance(
        &self,
        spec: &InstanceSpec,
        instance: &InstanceRef,
    ) -> Result<(), ClusterError>;

    /// Exact lookup by numeric id.
    async fn lookup_by_id(&self, id: u32) -> Result<InstanceRef, ClusterError>;

    /// Lookup by hostname. Returns `ClusterError::NotFound` when no instance
    /// carries the name; multiple matches are returned as-is for the caller
    /// to disambiguate.
    async fn lookup_by_hostname(&self, hostname: &str) -> Result<Vec<InstanceRef>, ClusterError>;

    /// The instance's current cluster-side configuration.
    async fn instance_config(
        &self,
        instance: &InstanceRef,
    ) -> Result<serde_json::Map<String, Value>, ClusterError>;

    /// Allocate the next free instance id. A nonzero `hint` asks the cluster
    /// to consider that id first.
    async fn next_free_id(&self, hint: u32) -> Result<u32, ClusterError>;

    async fn start(&self, instance: &InstanceRef) -> Result<(), ClusterError>;

    async fn stop(&self, instance: &InstanceRef) -> Result<(), ClusterError>;

    async fn delete(&self, instance: &InstanceRef) -> Result<(), ClusterError>;
}

enum Auth {
    /// `Authorization: PVEAPIToken=<user>!<tokenid>=<secret>`
    Token(String),
    /// Ticket cookie plus CSRF token for mutating requests.
    Ticket { cookie: String, csrf: String },
}

/// `ClusterApi` over the cluster's HTTP API.
pub struct HttpClusterClient {
    http: reqwest::Client,
    base_url: String,
    auth: Auth,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

/// One row of the cluster resource listing.
#[derive(Debug, Deserialize)]
struct ResourceEntry {
    vmid: u32,
    node: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: String,
}

impl HttpClusterClient {
    /// Authenticate against the cluster and return a ready client.
    ///
    /// Token auth is preferred when configured; otherwise a ticket login is
    /// performed with username and password.
    pub async fn connect(conn: &ConnectionConfig) -> Result<Self, ClusterError> {
        let base_url = conn.url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ClusterError::InvalidUrl {
                url: conn.url.clone(),
                message: "empty url".to_string(),
            });
        }

        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(conn.task_timeout_secs));
        if conn.skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;

        let auth = match &conn.token {
            Some(token) => {
                debug!("using token auth");
                Auth::Token(token_header(&conn.username, token))
            }
            None => {
                debug!("using password auth");
                let password = conn.password.as_deref().unwrap_or_default();
                let response = http
                    .post(format!("{base_url}/api2/json/access/ticket"))
                    .form(&[("username", conn.username.as_str()), ("password", password)])
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(ClusterError::Auth {
                        message: format!("login returned status {}", response.status()),
                    });
                }
                let body: ApiResponse<TicketData> = response.json().await?;
                let ticket = body.data.ok_or_else(|| ClusterError::Auth {
                    message: "login response carried no ticket".to_string(),
                })?;
                Auth::Ticket {
                    cookie: format!("PVEAuthCookie={}", ticket.ticket),
                    csrf: ticket.csrf_token,
                }
            }
        };

        Ok(Self {
            http,
            base_url,
            auth,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mutating = method != reqwest::Method::GET;
        let mut request = self
            .http
            .request(method, format!("{}/api2/json{path}", self.base_url));
        match &self.auth {
            Auth::Token(header) => {
                request = request.header("Authorization", header);
            }
            Auth::Ticket { cookie, csrf } => {
                request = request.header("Cookie", cookie);
                if mutating {
                    request = request.header("CSRFPreventionToken", csrf);
                }
            }
        }
        request
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, ClusterError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClusterError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn list_resources(&self) -> Result<Vec<ResourceEntry>, ClusterError> {
        let response = self
            .request(reqwest::Method::GET, "/cluster/resources?type=vm")
            .send()
            .await?;
        let response = Self::expect_success(response).await?;
        let body: ApiResponse<Vec<ResourceEntry>> = response.json().await?;
        Ok(body.data.unwrap_or_default())
    }
}

#[async_trait]
impl ClusterApi for HttpClusterClient {
    async fn create_instance(
        &self,
        spec: &InstanceSpec,
        instance: &InstanceRef,
    ) -> Result<(), ClusterError> {
        let mut params = spec.creation_params();
        params.insert("vmid".to_string(), instance.id().to_string());
        debug!(id = instance.id(), node = instance.node(), "creating instance");
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/nodes/{}/lxc", instance.node()),
            )
            .form(&params)
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn lookup_by_id(&self, id: u32) -> Result<InstanceRef, ClusterError> {
        self.list_resources()
            .await?
            .into_iter()
            .find(|entry| entry.kind == "lxc" && entry.vmid == id)
            .map(|entry| InstanceRef::new(entry.vmid, entry.node))
            .ok_or(ClusterError::NotFound {
                what: format!("vm '{id}'"),
            })
    }

    async fn lookup_by_hostname(&self, hostname: &str) -> Result<Vec<InstanceRef>, ClusterError> {
        let matches: Vec<InstanceRef> = self
            .list_resources()
            .await?
            .into_iter()
            .filter(|entry| entry.kind == "lxc" && entry.name.as_deref() == Some(hostname))
            .map(|entry| InstanceRef::new(entry.vmid, entry.node))
            .collect();
        if matches.is_empty() {
            return Err(ClusterError::NotFound {
                what: format!("vm '{hostname}'"),
            });
        }
        Ok(matches)
    }

    async fn instance_config(
        &self,
        instance: &InstanceRef,
    ) -> Result<serde_json::Map<String, Value>, ClusterError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/nodes/{}/lxc/{}/config", instance.node(), instance.id()),
            )
            .send()
            .await?;
        let response = Self::expect_success(response).await?;
        let body: ApiResponse<serde_json::Map<String, Value>> = response.json().await?;
        Ok(body.data.unwrap_or_default())
    }

    async fn next_free_id(&self, hint: u32) -> Result<u32, ClusterError> {
        let path = if hint != 0 {
            format!("/cluster/nextid?vmid={hint}")
        } else {
            "/cluster/nextid".to_string()
        };
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        let response = Self::expect_success(response).await?;
        let body: ApiResponse<Value> = response.json().await?;
        parse_next_id(body.data.unwrap_or(Value::Null))
    }

    async fn start(&self, instance: &InstanceRef) -> Result<(), ClusterError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!(
                    "/nodes/{}/lxc/{}/status/start",
                    instance.node(),
                    instance.id()
                ),
            )
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn stop(&self, instance: &InstanceRef) -> Result<(), ClusterError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!(
                    "/nodes/{}/lxc/{}/status/stop",
                    instance.node(),
                    instance.id()
                ),
            )
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn delete(&self, instance: &InstanceRef) -> Result<(), ClusterError> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/nodes/{}/lxc/{}", instance.node(), instance.id()),
            )
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }
}

fn token_header(username: &str, token: &str) -> String {
    format!("PVEAPIToken={username}!{token}")
}

// The nextid endpoint returns its id as a JSON string on some cluster
// versions and as a number on others.
fn parse_next_id(data: Value) -> Result<u32, ClusterError> {
    match data {
        Value::String(s) => s.parse::<u32>().map_err(|_| ClusterError::Api {
            status: 200,
            message: format!("unparseable next id '{s}'"),
        }),
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(ClusterError::Api {
                status: 200,
                message: format!("unparseable next id '{n}'"),
            }),
        other => Err(ClusterError::Api {
            status: 200,
            message: format!("unexpected next id payload: {other}"),
        }),
    }
}
