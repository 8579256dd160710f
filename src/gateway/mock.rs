//! Deterministic mock responder for non-production modes.
//!
//! Returns canned payloads shaped exactly like the provider's real
//! responses (including the doubly-nested `data.data` envelope on VA
//! creation) so downstream normalization code runs the same path in tests
//! as in production.

use crate::gateway::client::GatewayResponse;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub struct MockResponder;

impl MockResponder {
    /// Endpoint-pattern-matched canned response.
    pub fn respond(endpoint: &str, payload: &JsonValue) -> GatewayResponse {
        let reference = payload
            .get("partner_reference_no")
            .or_else(|| payload.get("reference_no"))
            .and_then(|v| v.as_str())
            .unwrap_or("MOCK");

        let data = if endpoint.contains("access-token") {
            json!({
                "access_token": format!("mock-token-{}", Uuid::new_v4().simple()),
                "token_type": "Bearer",
                "expires_in": 3600,
            })
        } else if endpoint.contains("create-va") {
            // Same doubly-nested envelope the live endpoint produces.
            json!({
                "data": {
                    "reff_no": format!("VA-{}", Uuid::new_v4().simple()),
                    "bank_code": payload.get("bank_code").cloned().unwrap_or(json!("014")),
                    "number": mock_va_number(reference),
                    "expired_date": payload.get("expired_date").cloned(),
                    "amount": payload.get("amount").cloned(),
                }
            })
        } else if endpoint.contains("qr-mpm-generate") {
            json!({
                "data": {
                    "reff_no": format!("QR-{}", Uuid::new_v4().simple()),
                    "qr_content": format!("00020101021226{}5303360", mock_va_number(reference)),
                    "qr_url": format!("https://mock.singapay.test/qr/{}", reference),
                }
            })
        } else if endpoint.contains("qr-mpm-query") {
            json!({ "data": { "status": "pending" } })
        } else if endpoint.contains("disbursement") {
            json!({
                "data": {
                    "reference_number": reference,
                    "transaction_id": format!("DSB-{}", Uuid::new_v4().simple()),
                    "status": "success",
                }
            })
        } else if endpoint.contains("payment-link") {
            json!({
                "data": {
                    "url": format!("https://mock.singapay.test/pay/{}", reference),
                }
            })
        } else {
            json!({})
        };

        GatewayResponse {
            success: true,
            data,
            message: "mock response".to_string(),
            error_code: None,
        }
    }
}

/// Deterministic 16-digit VA number derived from the partner reference.
fn mock_va_number(reference: &str) -> String {
    let digest = Sha256::digest(reference.as_bytes());
    let digits: String = digest
        .iter()
        .map(|b| char::from(b'0' + (b % 10)))
        .take(12)
        .collect();
    format!("8808{}", digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn va_response_uses_nested_envelope() {
        let response = MockResponder::respond(
            "/api/v1.0/transfer-va/create-va",
            &json!({"partner_reference_no": "BP-1", "amount": 100000}),
        );
        assert!(response.success);
        let number = response.data["data"]["number"]
            .as_str()
            .expect("mock VA number present");
        assert!(number.starts_with("8808"));
        assert_eq!(number.len(), 16);
    }

    #[test]
    fn va_number_is_deterministic_per_reference() {
        let a = mock_va_number("BP-1");
        let b = mock_va_number("BP-1");
        let c = mock_va_number("BP-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn qris_response_carries_qr_content_and_url() {
        let response = MockResponder::respond(
            "/api/v1.0/qr/qr-mpm-generate",
            &json!({"partner_reference_no": "BP-9"}),
        );
        assert!(response.data["data"]["qr_content"].is_string());
        assert_eq!(
            response.data["data"]["qr_url"].as_str(),
            Some("https://mock.singapay.test/qr/BP-9")
        );
    }

    #[test]
    fn unknown_endpoint_still_succeeds_with_empty_data() {
        let response = MockResponder::respond("/api/v1.0/unknown", &json!({}));
        assert!(response.success);
        assert_eq!(response.data, json!({}));
    }
}
