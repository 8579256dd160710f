//! Signature helpers for the SingaPay integration.
//!
//! Three different schemes are in play:
//! - access-token requests sign `clientId_clientSecret_timestamp` with
//!   HMAC-SHA512 (hex), key = client secret;
//! - disbursement transfers sign
//!   `METHOD:ENDPOINT:TOKEN:lowerhex(SHA256(minified_body)):timestamp` with
//!   HMAC-SHA512 (base64), key = client secret;
//! - inbound webhooks carry HMAC-SHA256 (hex) over the recursively
//!   key-sorted JSON body, key = client id.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256, Sha512};

type HmacSha512 = Hmac<Sha512>;
type HmacSha256 = Hmac<Sha256>;

/// Signature for the access-token request.
pub fn token_signature(client_id: &str, client_secret: &str, timestamp: &str) -> String {
    let message = format!("{}_{}_{}", client_id, client_secret, timestamp);
    hmac_sha512_hex(client_secret.as_bytes(), message.as_bytes())
}

/// Signature attached to disbursement-transfer requests.
pub fn request_signature(
    method: &str,
    endpoint: &str,
    access_token: &str,
    body: &JsonValue,
    timestamp: &str,
    client_secret: &str,
) -> String {
    let minified = canonical_json(body);
    let body_digest = hex::encode(Sha256::digest(minified.as_bytes()));
    let message = format!(
        "{}:{}:{}:{}:{}",
        method.to_uppercase(),
        endpoint,
        access_token,
        body_digest,
        timestamp
    );
    let mut mac = HmacSha512::new_from_slice(client_secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Expected `X-Signature` value for an inbound payment webhook.
pub fn webhook_signature(body: &JsonValue, client_id: &str) -> String {
    let canonical = canonical_json(body);
    let mut mac =
        HmacSha256::new_from_slice(client_id.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_webhook_signature(body: &JsonValue, client_id: &str, provided: &str) -> bool {
    let expected = webhook_signature(body, client_id);
    secure_eq(expected.as_bytes(), provided.trim().as_bytes())
}

/// Minified JSON with object keys sorted recursively, matching what the
/// provider hashes on its side. Slashes are not escaped.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Object keys never need escaping beyond what serde does.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&serde_json::to_string(leaf).unwrap_or_default()),
    }
}

fn hmac_sha512_hex(key: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time byte comparison.
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({
            "b": 1,
            "a": {"z": true, "m": [1, {"y": 2, "x": 3}]},
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"m":[1,{"x":3,"y":2}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_leaves_slashes_unescaped() {
        let value = json!({"url": "https://pay.example/qr"});
        assert_eq!(canonical_json(&value), r#"{"url":"https://pay.example/qr"}"#);
    }

    #[test]
    fn webhook_signature_roundtrip() {
        let body = json!({"data": {"transaction": {"reff_no": "BP-1", "status": "paid"}}});
        let signature = webhook_signature(&body, "client-123");
        assert!(verify_webhook_signature(&body, "client-123", &signature));
        assert!(!verify_webhook_signature(&body, "client-123", "deadbeef"));
        assert!(!verify_webhook_signature(&body, "other-client", &signature));
    }

    #[test]
    fn signature_is_stable_under_key_reordering() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(
            webhook_signature(&a, "client"),
            webhook_signature(&b, "client")
        );
    }

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn token_signature_depends_on_all_inputs() {
        let base = token_signature("id", "secret", "1700000000");
        assert_ne!(base, token_signature("id2", "secret", "1700000000"));
        assert_ne!(base, token_signature("id", "secret2", "1700000000"));
        assert_ne!(base, token_signature("id", "secret", "1700000001"));
    }
}
