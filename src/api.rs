//! Hypervisor REST API contract and its HTTP implementation.
//!
//! The core only talks to the backend through [`HypervisorApi`], so the
//! dispatcher and reconciler can be driven by an in-memory double in tests.

use crate::{
    Result, VesselError,
    config::ApiConfig,
    log_debug, log_warn,
    vm::{Action, CreateVmRequest, ScheduleRequest, Snapshot, Vm, VmStats},
};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// `GET /vms`
    async fn list_vms(&self) -> Result<Vec<Vm>>;

    /// `GET /vms/{name}`
    async fn get_vm(&self, name: &str) -> Result<Vm>;

    /// `POST /vms/create`
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<Vm>;

    /// `DELETE /vms/{name}`
    async fn delete_vm(&self, name: &str) -> Result<()>;

    /// `POST /vms/{name}/control/{action}`
    async fn control(&self, name: &str, action: Action) -> Result<()>;

    /// `GET /vms/{name}/stats`
    async fn vm_stats(&self, name: &str) -> Result<VmStats>;

    /// `GET /vms/{name}/snapshots`
    async fn list_snapshots(&self, vm_name: &str) -> Result<Vec<Snapshot>>;

    /// `POST /vms/{name}/snapshots`
    async fn create_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<()>;

    /// `DELETE /vms/{name}/snapshots/{snapshot}`
    async fn delete_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<()>;

    /// `POST /vms/{name}/snapshots/{snapshot}/restore`
    async fn restore_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<()>;

    /// `POST /scheduler`
    async fn schedule_snapshot(&self, request: &ScheduleRequest) -> Result<()>;
}

/// Accepts both `{"vms": [...]}` and a bare array.
pub fn parse_vm_list(body: &[u8]) -> Result<Vec<Vm>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| VesselError::UnexpectedResponseShape(format!("VM list is not JSON: {}", e)))?;

    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut object) => match object.remove("vms") {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(VesselError::UnexpectedResponseShape(
                    "expected a `vms` array".to_string(),
                ));
            }
        },
        other => {
            return Err(VesselError::UnexpectedResponseShape(format!(
                "expected an array or an object, got {}",
                json_kind(&other)
            )));
        }
    };

    entries
        .into_iter()
        .map(|entry| {
            serde_json::from_value(entry).map_err(|e| {
                VesselError::UnexpectedResponseShape(format!("malformed VM entry: {}", e))
            })
        })
        .collect()
}

/// Snapshot listings come as `{"snapshots": [...]}` with either objects or bare names.
pub fn parse_snapshot_list(vm_name: &str, body: &[u8]) -> Result<Vec<Snapshot>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entry {
        Name(String),
        Detailed {
            name: String,
            #[serde(default)]
            date: Option<String>,
            #[serde(default)]
            size: Option<String>,
        },
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Listing {
        Wrapped { snapshots: Vec<Entry> },
        Bare(Vec<Entry>),
    }

    let listing: Listing = serde_json::from_slice(body).map_err(|e| {
        VesselError::UnexpectedResponseShape(format!("snapshot list for '{}': {}", vm_name, e))
    })?;

    let entries = match listing {
        Listing::Wrapped { snapshots } => snapshots,
        Listing::Bare(snapshots) => snapshots,
    };

    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            Entry::Name(name) => Snapshot {
                vm_name: vm_name.to_string(),
                name,
                date: None,
                size: None,
            },
            Entry::Detailed { name, date, size } => Snapshot {
                vm_name: vm_name.to_string(),
                name,
                date,
                size,
            },
        })
        .collect())
}

pub fn parse_vm_stats(body: &[u8]) -> Result<VmStats> {
    #[derive(Deserialize)]
    struct StatsEnvelope {
        cpu_stats: VmStats,
    }

    serde_json::from_slice::<StatsEnvelope>(body)
        .map(|envelope| envelope.cpu_stats)
        .map_err(|e| VesselError::UnexpectedResponseShape(format!("VM stats: {}", e)))
}

/// Pulls `error` or `message` out of a backend error body, falling back to the raw text.
pub fn extract_error_message(body: &[u8]) -> String {
    if let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(body) {
        for key in ["error", "message"] {
            if let Some(Value::String(message)) = object.get(key) {
                return message.clone();
            }
        }
    }
    String::from_utf8_lossy(body).trim().to_string()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

struct RawResponse {
    status: StatusCode,
    body: Vec<u8>,
}

pub struct HttpHypervisorClient {
    client: reqwest::Client,
    base_url: Url,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl HttpHypervisorClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            VesselError::ConfigError(format!("invalid api.base_url '{}': {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(VesselError::ConfigError(format!(
                "api.base_url '{}' cannot carry a path",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url,
            retry_attempts: config.retry_attempts,
            retry_backoff: config.retry_backoff(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends percent-encoded path segments (snapshot names may contain spaces).
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send_once(&self, method: Method, url: Url, body: Option<&Value>) -> Result<RawResponse> {
        log_debug!("{} {}", method, url);
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(RawResponse { status, body })
    }

    /// GET with bounded retry on transport errors and 5xx responses.
    async fn get(&self, url: Url) -> Result<RawResponse> {
        let attempts = self.retry_attempts + 1;
        let mut attempt = 1;
        loop {
            let outcome = self.send_once(Method::GET, url.clone(), None).await;
            let retryable = match &outcome {
                Ok(response) => response.status.is_server_error(),
                Err(_) => true,
            };

            if !retryable || attempt >= attempts {
                return outcome;
            }

            log_warn!(
                "GET {} failed (attempt {}/{}), retrying",
                url,
                attempt,
                attempts
            );
            sleep(self.retry_delay(attempt)).await;
            attempt += 1;
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(attempt)
    }

    /// Sends a non-idempotent request exactly once.
    async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> Result<RawResponse> {
        self.send_once(method, url, body).await
    }

    fn ensure_success(response: RawResponse, context: &str) -> Result<RawResponse> {
        if response.status.is_success() {
            return Ok(response);
        }
        Err(VesselError::NetworkFailure(format!(
            "{} returned {}: {}",
            context,
            response.status,
            extract_error_message(&response.body)
        )))
    }
}

#[async_trait]
impl HypervisorApi for HttpHypervisorClient {
    async fn list_vms(&self) -> Result<Vec<Vm>> {
        let response = self.get(self.endpoint(&["vms"])).await?;

        // The backend answers an empty inventory with 404 {"message": "No VMs found"}.
        if response.status == StatusCode::NOT_FOUND {
            if let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(&response.body) {
                if object.contains_key("message") && !object.contains_key("error") {
                    return Ok(Vec::new());
                }
            }
        }

        let response = Self::ensure_success(response, "GET /vms")?;
        parse_vm_list(&response.body)
    }

    async fn get_vm(&self, name: &str) -> Result<Vm> {
        let response = self.get(self.endpoint(&["vms", name])).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Err(VesselError::UnknownVm(name.to_string()));
        }
        let response = Self::ensure_success(response, &format!("GET /vms/{}", name))?;
        serde_json::from_slice(&response.body).map_err(|e| {
            VesselError::UnexpectedResponseShape(format!("VM '{}': {}", name, e))
        })
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<Vm> {
        let body = serde_json::to_value(request)?;
        let response = self
            .send(Method::POST, self.endpoint(&["vms", "create"]), Some(&body))
            .await?;
        let response = Self::ensure_success(response, "POST /vms/create")?;

        // Some backends only answer with a message; fall back to reading the record.
        match serde_json::from_slice::<Vm>(&response.body) {
            Ok(vm) => Ok(vm),
            Err(_) => self.get_vm(&request.name).await,
        }
    }

    async fn delete_vm(&self, name: &str) -> Result<()> {
        let response = self
            .send(Method::DELETE, self.endpoint(&["vms", name]), None)
            .await?;
        Self::ensure_success(response, &format!("DELETE /vms/{}", name))?;
        Ok(())
    }

    async fn control(&self, name: &str, action: Action) -> Result<()> {
        let url = self.endpoint(&["vms", name, "control", action.as_str()]);
        let response = self.send(Method::POST, url, None).await?;
        Self::ensure_success(
            response,
            &format!("POST /vms/{}/control/{}", name, action),
        )?;
        Ok(())
    }

    async fn vm_stats(&self, name: &str) -> Result<VmStats> {
        let response = self.get(self.endpoint(&["vms", name, "stats"])).await?;
        let response = Self::ensure_success(response, &format!("GET /vms/{}/stats", name))?;
        parse_vm_stats(&response.body)
    }

    async fn list_snapshots(&self, vm_name: &str) -> Result<Vec<Snapshot>> {
        let response = self
            .get(self.endpoint(&["vms", vm_name, "snapshots"]))
            .await?;
        let response =
            Self::ensure_success(response, &format!("GET /vms/{}/snapshots", vm_name))?;
        parse_snapshot_list(vm_name, &response.body)
    }

    async fn create_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<()> {
        let body = serde_json::json!({ "name": snapshot });
        let response = self
            .send(
                Method::POST,
                self.endpoint(&["vms", vm_name, "snapshots"]),
                Some(&body),
            )
            .await?;
        Self::ensure_success(response, &format!("POST /vms/{}/snapshots", vm_name))?;
        Ok(())
    }

    async fn delete_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<()> {
        let response = self
            .send(
                Method::DELETE,
                self.endpoint(&["vms", vm_name, "snapshots", snapshot]),
                None,
            )
            .await?;
        Self::ensure_success(
            response,
            &format!("DELETE /vms/{}/snapshots/{}", vm_name, snapshot),
        )?;
        Ok(())
    }

    async fn restore_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<()> {
        let response = self
            .send(
                Method::POST,
                self.endpoint(&["vms", vm_name, "snapshots", snapshot, "restore"]),
                None,
            )
            .await?;
        Self::ensure_success(
            response,
            &format!("POST /vms/{}/snapshots/{}/restore", vm_name, snapshot),
        )?;
        Ok(())
    }

    async fn schedule_snapshot(&self, request: &ScheduleRequest) -> Result<()> {
        let body = serde_json::to_value(request)?;
        let response = self
            .send(Method::POST, self.endpoint(&["scheduler"]), Some(&body))
            .await?;
        Self::ensure_success(response, "POST /scheduler")?;
        Ok(())
    }
}
