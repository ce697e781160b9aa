//! reqwest client for the inventory REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use stockroom_core::{EntityDescriptor, ServerId};

use super::{ErrorCategory, RemoteError, RemoteResult, RemoteService};
use crate::guard::IdempotencyToken;
use crate::record::Fields;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// HTTP implementation of [`RemoteService`].
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> RemoteResult<Response> {
        let resp = self.authed(req).send().await.map_err(classify_transport)?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(RemoteError::new(
            category_for_status(status),
            format!("{status}: {}", truncate(&body, 512)),
        ))
    }

    async fn json(resp: Response) -> RemoteResult<Value> {
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RemoteError::server(format!("invalid response body: {e}")))?;
        Ok(unwrap_envelope(body))
    }
}

/// Status code to failure category.
pub(crate) fn category_for_status(status: StatusCode) -> ErrorCategory {
    match status {
        StatusCode::NOT_FOUND => ErrorCategory::NotFound,
        StatusCode::CONFLICT => ErrorCategory::Conflict,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCategory::Validation,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ErrorCategory::Transient,
        _ => ErrorCategory::Server,
    }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        RemoteError::transient(err.to_string())
    } else {
        RemoteError::server(err.to_string())
    }
}

/// Bodies come either bare or as `{"data": ...}`.
pub(crate) fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut obj)
            if obj.contains_key("data") && !obj.contains_key("id") && !obj.contains_key("_id") =>
        {
            obj.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn create(
        &self,
        desc: &EntityDescriptor,
        payload: &Fields,
        token: &IdempotencyToken,
    ) -> RemoteResult<Value> {
        let req = self
            .client
            .post(self.url(desc.endpoint))
            .header(IDEMPOTENCY_HEADER, token.to_string())
            .json(payload);
        let resp = self.send(req).await?;
        Self::json(resp).await
    }

    async fn list(&self, desc: &EntityDescriptor) -> RemoteResult<Vec<Value>> {
        let resp = self.send(self.client.get(self.url(desc.endpoint))).await?;
        match Self::json(resp).await? {
            Value::Array(items) => Ok(items),
            other => Err(RemoteError::server(format!(
                "{}: expected a list, got {}",
                desc.endpoint,
                truncate(&other.to_string(), 128)
            ))),
        }
    }

    async fn update(
        &self,
        desc: &EntityDescriptor,
        id: &ServerId,
        delta: &Fields,
    ) -> RemoteResult<()> {
        let url = self.url(&format!("{}/{}", desc.endpoint, id));
        self.send(self.client.put(url).json(delta)).await?;
        Ok(())
    }

    async fn delete(&self, desc: &EntityDescriptor, id: &ServerId) -> RemoteResult<()> {
        let url = self.url(&format!("{}/{}", desc.endpoint, id));
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn probe(&self) -> bool {
        let req = self.authed(self.client.get(self.url("/health")));
        match req.send().await {
            Ok(resp) => !resp.status().is_server_error(),
            Err(err) => {
                tracing::debug!(error = %err, "health probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statuses_map_to_categories() {
        assert_eq!(category_for_status(StatusCode::NOT_FOUND), ErrorCategory::NotFound);
        assert_eq!(category_for_status(StatusCode::CONFLICT), ErrorCategory::Conflict);
        assert_eq!(category_for_status(StatusCode::BAD_REQUEST), ErrorCategory::Validation);
        assert_eq!(
            category_for_status(StatusCode::UNPROCESSABLE_ENTITY),
            ErrorCategory::Validation
        );
        assert_eq!(category_for_status(StatusCode::SERVICE_UNAVAILABLE), ErrorCategory::Server);
        assert_eq!(category_for_status(StatusCode::FORBIDDEN), ErrorCategory::Server);
    }

    #[test]
    fn envelopes_are_unwrapped() {
        assert_eq!(unwrap_envelope(json!({"data": [1, 2]})), json!([1, 2]));
        assert_eq!(
            unwrap_envelope(json!({"success": true, "data": {"id": "x"}})),
            json!({"id": "x"})
        );
        assert_eq!(unwrap_envelope(json!({"id": "x"})), json!({"id": "x"}));
    }

    #[test]
    fn base_url_is_normalized() {
        let remote = HttpRemote::new("http://localhost:4000/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(remote.url("/products"), "http://localhost:4000/api/products");
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        // Port 9 (discard) on localhost is closed in test environments.
        let remote = HttpRemote::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(!remote.probe().await);

        let desc = EntityDescriptor::new(stockroom_core::EntityKind::new("things"), "/things");
        let err = remote.list(&desc).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Transient);
    }
}
