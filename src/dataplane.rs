//! HAProxy Data Plane API v2 client
//!
//! Thin typed wrapper over the endpoints the transactional driver needs.
//! Every call is basic-authenticated and bounded by the client timeout;
//! staged calls carry `transaction_id` as a query parameter.

use crate::config::DataPlaneConfig;
use crate::error::RoutingError;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const CONFIG_PATH: &str = "/v2/services/haproxy/configuration";
const TRANSACTIONS_PATH: &str = "/v2/services/haproxy/transactions";

/// Failure talking to the Data Plane API
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// No response was received (connect error, timeout, broken body)
    #[error("request failed: {message}")]
    Request { message: String, timeout: bool },
    /// The API answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Whether the request may have been executed without us seeing the answer
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, ApiError::Request { .. }) || self.status() == Some(504)
    }

    /// Map onto the routing error taxonomy
    pub fn into_routing(self, backend: &str) -> RoutingError {
        match &self {
            ApiError::Request { .. } => RoutingError::transient(backend, self.to_string()),
            ApiError::Status { status, .. } => match *status {
                502..=504 => RoutingError::transient(backend, self.to_string()),
                400 | 409 | 422 => RoutingError::conflict(backend, self.to_string()),
                _ => RoutingError::backend(backend, self.to_string()),
            },
            ApiError::Decode(_) => RoutingError::backend(backend, self.to_string()),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: String,
    #[serde(rename = "_version", default)]
    pub version: i64,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendObject {
    pub name: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<Balance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerObject {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// `enabled` / `disabled`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchingRule {
    pub index: u32,
    /// Target backend
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond_test: Option<String>,
}

#[derive(Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct RawConfiguration {
    #[serde(default)]
    data: String,
}

pub struct DataPlaneClient {
    base_url: String,
    username: String,
    password: Option<String>,
    client: reqwest::Client,
}

impl DataPlaneClient {
    pub fn new(config: &DataPlaneConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, self.password.as_deref())
    }

    async fn send(&self, builder: RequestBuilder) -> ApiResult<(StatusCode, String)> {
        let response = builder.send().await.map_err(request_error)?;
        let status = response.status();
        let body = response.text().await.map_err(request_error)?;

        if status.is_success() {
            Ok((status, body))
        } else {
            Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            })
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        let (_, body) = self.send(builder).await?;
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn send_empty(&self, builder: RequestBuilder) -> ApiResult<()> {
        self.send(builder).await.map(|_| ())
    }

    /// DELETE that treats 404 as "already gone"
    async fn send_delete(&self, builder: RequestBuilder) -> ApiResult<bool> {
        match self.send(builder).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    // --- configuration version and transactions ---

    pub async fn version(&self) -> ApiResult<i64> {
        self.send_json(self.request(Method::GET, &format!("{}/version", CONFIG_PATH)))
            .await
    }

    pub async fn start_transaction(&self, version: i64) -> ApiResult<TransactionInfo> {
        let builder = self
            .request(Method::POST, TRANSACTIONS_PATH)
            .query(&[("version", version.to_string())]);
        self.send_json(builder).await
    }

    pub async fn list_transactions(&self) -> ApiResult<Vec<TransactionInfo>> {
        self.send_json(self.request(Method::GET, TRANSACTIONS_PATH)).await
    }

    pub async fn get_transaction(&self, id: &str) -> ApiResult<Option<TransactionInfo>> {
        let path = format!("{}/{}", TRANSACTIONS_PATH, urlencoding::encode(id));
        match self.send_json(self.request(Method::GET, &path)).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn commit_transaction(&self, id: &str) -> ApiResult<()> {
        debug!(transaction_id = id, "Committing transaction");
        let path = format!("{}/{}", TRANSACTIONS_PATH, urlencoding::encode(id));
        self.send_empty(self.request(Method::PUT, &path)).await
    }

    pub async fn delete_transaction(&self, id: &str) -> ApiResult<bool> {
        let path = format!("{}/{}", TRANSACTIONS_PATH, urlencoding::encode(id));
        self.send_delete(self.request(Method::DELETE, &path)).await
    }

    // --- backends ---

    fn configuration(&self, method: Method, resource: &str, tx: Option<&str>) -> RequestBuilder {
        let builder = self.request(method, &format!("{}/{}", CONFIG_PATH, resource));
        match tx {
            Some(id) => builder.query(&[("transaction_id", id)]),
            None => builder,
        }
    }

    pub async fn backends(&self, tx: Option<&str>) -> ApiResult<Vec<BackendObject>> {
        let listing: Listing<BackendObject> =
            self.send_json(self.configuration(Method::GET, "backends", tx)).await?;
        Ok(listing.data)
    }

    pub async fn create_backend(&self, tx: &str, backend: &BackendObject) -> ApiResult<()> {
        self.send_empty(self.configuration(Method::POST, "backends", Some(tx)).json(backend))
            .await
    }

    pub async fn replace_backend(&self, tx: &str, backend: &BackendObject) -> ApiResult<()> {
        let resource = format!("backends/{}", urlencoding::encode(&backend.name));
        self.send_empty(self.configuration(Method::PUT, &resource, Some(tx)).json(backend))
            .await
    }

    pub async fn delete_backend(&self, tx: &str, name: &str) -> ApiResult<bool> {
        let resource = format!("backends/{}", urlencoding::encode(name));
        self.send_delete(self.configuration(Method::DELETE, &resource, Some(tx)))
            .await
    }

    // --- servers ---

    pub async fn servers(&self, tx: Option<&str>, backend: &str) -> ApiResult<Vec<ServerObject>> {
        let builder = self
            .configuration(Method::GET, "servers", tx)
            .query(&[("backend", backend)]);
        let listing: Listing<ServerObject> = self.send_json(builder).await?;
        Ok(listing.data)
    }

    pub async fn create_server(&self, tx: &str, backend: &str, server: &ServerObject) -> ApiResult<()> {
        let builder = self
            .configuration(Method::POST, "servers", Some(tx))
            .query(&[("backend", backend)])
            .json(server);
        self.send_empty(builder).await
    }

    pub async fn replace_server(&self, tx: &str, backend: &str, server: &ServerObject) -> ApiResult<()> {
        let resource = format!("servers/{}", urlencoding::encode(&server.name));
        let builder = self
            .configuration(Method::PUT, &resource, Some(tx))
            .query(&[("backend", backend)])
            .json(server);
        self.send_empty(builder).await
    }

    // --- backend switching rules ---

    pub async fn switching_rules(&self, tx: Option<&str>, frontend: &str) -> ApiResult<Vec<SwitchingRule>> {
        let builder = self
            .configuration(Method::GET, "backend_switching_rules", tx)
            .query(&[("frontend", frontend)]);
        let listing: Listing<SwitchingRule> = self.send_json(builder).await?;
        Ok(listing.data)
    }

    pub async fn create_switching_rule(&self, tx: &str, frontend: &str, rule: &SwitchingRule) -> ApiResult<()> {
        let builder = self
            .configuration(Method::POST, "backend_switching_rules", Some(tx))
            .query(&[("frontend", frontend)])
            .json(rule);
        self.send_empty(builder).await
    }

    pub async fn replace_switching_rule(&self, tx: &str, frontend: &str, rule: &SwitchingRule) -> ApiResult<()> {
        let resource = format!("backend_switching_rules/{}", rule.index);
        let builder = self
            .configuration(Method::PUT, &resource, Some(tx))
            .query(&[("frontend", frontend)])
            .json(rule);
        self.send_empty(builder).await
    }

    pub async fn delete_switching_rule(&self, tx: &str, frontend: &str, index: u32) -> ApiResult<bool> {
        let resource = format!("backend_switching_rules/{}", index);
        let builder = self
            .configuration(Method::DELETE, &resource, Some(tx))
            .query(&[("frontend", frontend)]);
        self.send_delete(builder).await
    }

    // --- raw configuration and info ---

    /// Full configuration text, as seen inside `tx` when given
    pub async fn raw_configuration(&self, tx: Option<&str>) -> ApiResult<String> {
        let raw: RawConfiguration = self.send_json(self.configuration(Method::GET, "raw", tx)).await?;
        Ok(raw.data)
    }

    /// Ask HAProxy to check a configuration text without applying it
    pub async fn validate_raw(&self, config: &str) -> ApiResult<()> {
        let builder = self
            .configuration(Method::POST, "raw", None)
            .query(&[("only_validate", "true"), ("skip_version", "true")])
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(config.to_string());
        self.send_empty(builder).await
    }

    pub async fn runtime_info(&self) -> ApiResult<serde_json::Value> {
        self.send_json(self.request(Method::GET, "/v2/services/haproxy/runtime/info"))
            .await
    }
}

fn request_error(e: reqwest::Error) -> ApiError {
    ApiError::Request {
        timeout: e.is_timeout(),
        message: e.to_string(),
    }
}

fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    let body = body.trim();
    if body.len() > 200 {
        let mut end = 200;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}
