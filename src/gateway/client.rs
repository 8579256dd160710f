//! Outbound SingaPay client.

use crate::cache::{keys::AccessTokenKey, CacheStore};
use crate::config::SingaPayConfig;
use crate::error::{PaymentError, PaymentResult};
use crate::gateway::mock::MockResponder;
use crate::gateway::signature;
use chrono::Utc;
use reqwest::Method;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Uniform envelope every gateway call resolves to.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub success: bool,
    pub data: JsonValue,
    pub message: String,
    pub error_code: Option<String>,
}

pub struct GatewayClient {
    config: Arc<SingaPayConfig>,
    cache: Arc<dyn CacheStore>,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(config: Arc<SingaPayConfig>, cache: Arc<dyn CacheStore>) -> PaymentResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| {
                PaymentError::gateway(
                    format!("failed to initialize HTTP client: {}", e),
                    "CLIENT_INIT",
                )
            })?;
        Ok(Self {
            config,
            cache,
            http,
        })
    }

    pub fn config(&self) -> &SingaPayConfig {
        &self.config
    }

    /// Obtain a provider access token, via the mode-partitioned cache.
    ///
    /// Any failure here is a hard error for the caller; there is no silent
    /// retry and no unauthenticated fallback.
    pub async fn get_access_token(&self) -> PaymentResult<String> {
        if self.config.mode.is_mock() {
            return Ok(format!("mock-token-{}", Uuid::new_v4().simple()));
        }

        let key = AccessTokenKey::new(&self.config.token_cache.prefix, self.config.mode).to_string();
        match self.cache.get(&key).await {
            Ok(Some(token)) => return Ok(token),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "token cache read failed, fetching fresh token"),
        }

        let timestamp = Utc::now().timestamp().to_string();
        let signature = signature::token_signature(
            &self.config.credentials.client_id,
            &self.config.credentials.client_secret,
            &timestamp,
        );

        let url = format!(
            "{}{}",
            self.config.endpoints.base_url, self.config.endpoints.token_path
        );
        let response = self
            .http
            .post(&url)
            .header("X-CLIENT-KEY", &self.config.credentials.client_id)
            .header("X-TIMESTAMP", &timestamp)
            .header("X-SIGNATURE", &signature)
            .json(&serde_json::json!({ "grant_type": "client_credentials" }))
            .send()
            .await
            .map_err(|e| self.map_transport_error(&self.config.endpoints.token_path, e))?;

        let status = response.status();
        let body: JsonValue = response.json().await.map_err(|e| {
            PaymentError::gateway(
                format!("invalid token response JSON: {}", e),
                "TOKEN_MALFORMED",
            )
        })?;

        if !status.is_success() {
            return Err(PaymentError::Gateway {
                message: format!("token endpoint returned HTTP {}", status),
                error_code: format!("HTTP_{}", status.as_u16()),
                retryable: status.is_server_error(),
            });
        }

        let token = extract_access_token(&body).ok_or_else(|| {
            PaymentError::gateway("no access token in provider response", "TOKEN_MISSING")
        })?;

        // TTL deliberately shorter than the provider's token expiry.
        if let Err(e) = self
            .cache
            .set(
                &key,
                &token,
                Duration::from_secs(self.config.token_cache.ttl_secs),
            )
            .await
        {
            warn!(error = %e, "failed to cache access token");
        }

        Ok(token)
    }

    /// Send a signed request to the provider, or route it through the mock
    /// responder in mock mode.
    pub async fn send_request(
        &self,
        endpoint: &str,
        payload: &JsonValue,
        method: Method,
    ) -> PaymentResult<GatewayResponse> {
        if self.config.mode.is_mock() {
            if self.config.mock.latency_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.mock.latency_ms)).await;
            }
            let response = MockResponder::respond(endpoint, payload);
            debug!(endpoint, "mock gateway response");
            return Ok(response);
        }

        let token = self.get_access_token().await?;
        let timestamp = Utc::now().timestamp().to_string();
        let url = format!("{}{}", self.config.endpoints.base_url, endpoint);

        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&token)
            .header("X-PARTNER-ID", &self.config.credentials.partner_id)
            .header("X-EXTERNAL-ID", Uuid::new_v4().simple().to_string())
            .header("X-TIMESTAMP", &timestamp)
            .json(payload);

        // Disbursement transfers carry an additional request signature.
        if endpoint.contains("/disbursement/") && endpoint.contains("transfer") {
            let request_signature = signature::request_signature(
                method.as_str(),
                endpoint,
                &token,
                payload,
                &timestamp,
                &self.config.credentials.client_secret,
            );
            request = request.header("X-SIGNATURE", request_signature);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_transport_error(endpoint, e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        // Request/response pair is logged without credentials or signatures.
        debug!(endpoint, status = status.as_u16(), body = %text, "gateway response");

        if !status.is_success() {
            return Ok(GatewayResponse {
                success: false,
                data: serde_json::from_str(&text).unwrap_or(JsonValue::Null),
                message: format!("provider returned HTTP {}", status),
                error_code: Some(format!("HTTP_{}", status.as_u16())),
            });
        }

        let data: JsonValue = serde_json::from_str(&text).map_err(|e| {
            PaymentError::gateway(
                format!("invalid provider JSON response: {}", e),
                "RESPONSE_MALFORMED",
            )
        })?;
        let message = data
            .get("message")
            .or_else(|| data.get("responseMessage"))
            .and_then(|v| v.as_str())
            .unwrap_or("ok")
            .to_string();

        Ok(GatewayResponse {
            success: true,
            data,
            message,
            error_code: None,
        })
    }

    fn map_transport_error(&self, endpoint: &str, err: reqwest::Error) -> PaymentError {
        if err.is_timeout() || err.is_connect() {
            PaymentError::ConnectionTimeout {
                endpoint: endpoint.to_string(),
            }
        } else {
            PaymentError::Gateway {
                message: format!("provider request failed: {}", err),
                error_code: "NETWORK_ERROR".to_string(),
                retryable: true,
            }
        }
    }
}

/// Providers have shipped the token under several names and nestings.
fn extract_access_token(body: &JsonValue) -> Option<String> {
    const CANDIDATES: [&[&str]; 5] = [
        &["access_token"],
        &["accessToken"],
        &["data", "access_token"],
        &["data", "accessToken"],
        &["token"],
    ];
    for path in CANDIDATES {
        let mut cursor = body;
        for segment in path {
            cursor = cursor.get(segment)?;
        }
        if let Some(token) = cursor.as_str() {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use serde_json::json;

    fn mock_client() -> GatewayClient {
        GatewayClient::new(
            Arc::new(SingaPayConfig::default()),
            Arc::new(MemoryCache::new()),
        )
        .expect("client init should succeed")
    }

    #[tokio::test]
    async fn mock_mode_issues_synthetic_token_without_network() {
        let client = mock_client();
        let token = client.get_access_token().await.unwrap();
        assert!(token.starts_with("mock-token-"));
    }

    #[tokio::test]
    async fn mock_mode_send_request_returns_canned_envelope() {
        let client = mock_client();
        let response = client
            .send_request(
                "/api/v1.0/transfer-va/create-va",
                &json!({"partner_reference_no": "BP-7", "amount": 150000}),
                Method::POST,
            )
            .await
            .unwrap();
        assert!(response.success);
        assert!(response.data["data"]["number"].is_string());
    }

    #[test]
    fn token_extraction_probes_known_shapes() {
        assert_eq!(
            extract_access_token(&json!({"access_token": "t1"})).as_deref(),
            Some("t1")
        );
        assert_eq!(
            extract_access_token(&json!({"data": {"accessToken": "t2"}})).as_deref(),
            Some("t2")
        );
        assert_eq!(extract_access_token(&json!({"data": {}})), None);
        assert_eq!(extract_access_token(&json!({"access_token": ""})), None);
    }
}
