//! HTTP dispatcher for the remote microservices.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{RemoteCall, RemoteDispatcher, ServiceHealth};
use crate::definition::{HttpMethod, Operation, ServiceTarget};
use crate::error::RemoteError;

/// Base URLs of the remote services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub loyalty_content: String,
    pub affiliate_registry: String,
    pub collaborations: String,
    pub monitoring: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            loyalty_content: "http://lealtad-contenido:8080".to_string(),
            affiliate_registry: "http://afiliados-comisiones:8081".to_string(),
            collaborations: "http://colaboraciones:8083".to_string(),
            monitoring: "http://monitoreo:8082".to_string(),
        }
    }
}

impl ServiceEndpoints {
    /// Points every service at the same base URL.
    pub fn uniform(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            loyalty_content: base_url.clone(),
            affiliate_registry: base_url.clone(),
            collaborations: base_url.clone(),
            monitoring: base_url,
        }
    }

    pub fn base_url(&self, target: ServiceTarget) -> &str {
        match target {
            ServiceTarget::LoyaltyContent => &self.loyalty_content,
            ServiceTarget::AffiliateRegistry => &self.affiliate_registry,
            ServiceTarget::Collaborations => &self.collaborations,
            ServiceTarget::Monitoring => &self.monitoring,
        }
    }
}

/// Dispatches remote calls as JSON over HTTP.
///
/// Every request carries an `Idempotency-Key` header derived from the saga,
/// step and direction, plus the saga and correlation ids. Responses are
/// classified as:
///
/// - 2xx: success, JSON body (empty body becomes `{}`)
/// - 408, 429, 5xx, connection errors, timeouts: transient
/// - any other status: permanent
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: Client,
    endpoints: ServiceEndpoints,
    health_timeout: Duration,
}

impl HttpDispatcher {
    /// Creates a dispatcher with its own connection pool.
    pub fn new(endpoints: ServiceEndpoints) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self::with_client(client, endpoints))
    }

    pub fn with_client(client: Client, endpoints: ServiceEndpoints) -> Self {
        Self {
            client,
            endpoints,
            health_timeout: Duration::from_secs(5),
        }
    }

    pub fn endpoints(&self) -> &ServiceEndpoints {
        &self.endpoints
    }

    /// Resolves the operation's path template against the base URL.
    ///
    /// Placeholders are removed from `arguments`; what remains is the body.
    fn build_url(
        &self,
        operation: Operation,
        arguments: &mut serde_json::Map<String, Value>,
    ) -> Result<Url, RemoteError> {
        let base = self.endpoints.base_url(operation.target());
        let mut url = Url::parse(base)
            .map_err(|e| RemoteError::Permanent(format!("invalid base url '{base}': {e}")))?;

        let mut segments = Vec::new();
        for segment in operation.path_template().split('/').filter(|s| !s.is_empty()) {
            match segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
            {
                Some(name) => {
                    let value = arguments.remove(name).ok_or_else(|| {
                        RemoteError::Permanent(format!("missing path parameter '{name}'"))
                    })?;
                    segments.push(match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    });
                }
                None => segments.push(segment.to_string()),
            }
        }

        url.path_segments_mut()
            .map_err(|_| RemoteError::Permanent(format!("base url '{base}' cannot hold a path")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn classify_transport(err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RemoteError::Transient(err.to_string())
    } else {
        RemoteError::Permanent(err.to_string())
    }
}

fn classify_status(status: StatusCode, message: String) -> RemoteError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        RemoteError::Transient(message)
    } else {
        RemoteError::Permanent(message)
    }
}

/// Services answer with either `id` or the specific id field; callers bind
/// against the specific one.
fn normalize_output(operation: Operation, output: &mut Value) {
    let (Some(field), Value::Object(map)) = (operation.id_field(), output) else {
        return;
    };
    if !map.contains_key(field)
        && let Some(id) = map.get("id").cloned()
    {
        map.insert(field.to_string(), id);
    }
}

#[async_trait]
impl RemoteDispatcher for HttpDispatcher {
    #[tracing::instrument(
        skip(self, call),
        fields(
            saga_id = %call.saga_id,
            step = %call.step_name,
            operation = %call.operation,
            attempt = call.attempt
        )
    )]
    async fn dispatch(&self, call: &RemoteCall) -> Result<Value, RemoteError> {
        let mut body = call.arguments.clone();
        let url = self.build_url(call.operation, &mut body)?;

        let request = match call.operation.method() {
            HttpMethod::Post => self.client.post(url.clone()).json(&body),
            HttpMethod::Put => self.client.put(url.clone()).json(&body),
            HttpMethod::Delete => self.client.delete(url.clone()),
        };
        let mut request = request
            .header("Idempotency-Key", call.idempotency_key())
            .header("X-Saga-ID", call.saga_id.to_string());
        if let Some(ref correlation_id) = call.correlation_id {
            request = request.header("X-Correlation-ID", correlation_id);
        }

        debug!(%url, "dispatching remote call");
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();

        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| classify_transport(&e))?;
            let mut output = if bytes.is_empty() {
                json!({})
            } else {
                serde_json::from_slice(&bytes).map_err(|e| {
                    RemoteError::Permanent(format!("invalid response body from {url}: {e}"))
                })?
            };
            normalize_output(call.operation, &mut output);
            return Ok(output);
        }

        let text = response.text().await.unwrap_or_default();
        let detail: String = text.chars().take(500).collect();
        warn!(%url, %status, "remote call rejected");
        Err(classify_status(status, format!("{url} returned {status}: {detail}")))
    }

    async fn check_services(&self) -> Vec<ServiceHealth> {
        let mut report = Vec::with_capacity(ServiceTarget::ALL.len());
        for target in ServiceTarget::ALL {
            let base = self.endpoints.base_url(target);
            let url = format!("{}/health", base.trim_end_matches('/'));
            let result = self
                .client
                .get(&url)
                .timeout(self.health_timeout)
                .send()
                .await;

            let (healthy, detail) = match result {
                Ok(response) if response.status().is_success() => (true, None),
                Ok(response) => (false, Some(format!("status {}", response.status()))),
                Err(e) => (false, Some(e.to_string())),
            };
            report.push(ServiceHealth {
                service: target.as_str().to_string(),
                healthy,
                url: Some(base.to_string()),
                detail,
            });
        }
        report
    }
}
