//! Payment instrument generators.
//!
//! A generator turns a validated purchase into a provider-side payment
//! instrument (virtual account number, QRIS code). Generators never persist
//! anything: they return a [`NewPaymentTransaction`] and the orchestrator
//! stores it atomically with the purchase, so a gateway failure leaves no
//! orphan rows behind.

pub mod qris;
pub mod virtual_account;

use crate::error::{PaymentError, PaymentResult};
use crate::store::models::{NewPaymentTransaction, NewPurchase, PaymentMethod, PaymentTransaction};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub use qris::QrisGenerator;
pub use virtual_account::VirtualAccountGenerator;

/// Canonical instrument state as this core sees it. Provider status
/// vocabularies are mapped into this enum in exactly one place per
/// instrument type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentStatus {
    Paid,
    Pending,
    Expired,
    Failed,
}

/// Caller-supplied options for instrument creation.
#[derive(Debug, Clone, Default)]
pub struct InstrumentParams {
    /// Destination bank for virtual accounts. Ignored by QRIS.
    pub bank_code: Option<String>,
}

#[async_trait]
pub trait InstrumentGenerator: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Create the provider-side instrument for a purchase. Pure with respect
    /// to the store: the returned record has not been persisted.
    async fn generate(
        &self,
        purchase: &NewPurchase,
        params: &InstrumentParams,
    ) -> PaymentResult<NewPaymentTransaction>;

    /// Read-only status probe. Implementations must never mutate state;
    /// activation happens exclusively through the webhook path.
    async fn check_status(
        &self,
        transaction: &PaymentTransaction,
    ) -> PaymentResult<InstrumentStatus>;
}

/// Providers wrap instrument payloads in one or two `data` envelopes
/// depending on the endpoint. Descend through them.
pub(crate) fn unwrap_data(value: &JsonValue) -> &JsonValue {
    let mut cursor = value;
    for _ in 0..2 {
        match cursor.get("data") {
            Some(inner) if inner.is_object() => cursor = inner,
            _ => break,
        }
    }
    cursor
}

/// Probe a set of historical field names, returning the first non-empty
/// string value.
pub(crate) fn probe_str(value: &JsonValue, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(found) = value.get(key).and_then(|v| v.as_str()) {
            if !found.is_empty() {
                return Some(found.to_string());
            }
        }
    }
    None
}

/// Frozen mock outcome: the draw is a pure function of the provider
/// reference, so repeated status checks on the same instrument always agree.
pub(crate) fn mock_outcome(reference: &str, success_rate_percent: u8) -> InstrumentStatus {
    let digest = Sha256::digest(reference.as_bytes());
    if u16::from(digest[0]) % 100 < u16::from(success_rate_percent) {
        InstrumentStatus::Paid
    } else {
        InstrumentStatus::Failed
    }
}

/// Shared mapping from the provider's status vocabulary to the canonical
/// instrument state. `None` means the value is unknown and must not be
/// guessed at.
pub(crate) fn map_provider_status(raw: &str) -> Option<InstrumentStatus> {
    match raw.trim().to_lowercase().as_str() {
        "paid" | "success" | "settled" | "completed" => Some(InstrumentStatus::Paid),
        "pending" | "unpaid" | "processing" | "created" => Some(InstrumentStatus::Pending),
        "expired" | "timeout" => Some(InstrumentStatus::Expired),
        "failed" | "declined" | "cancelled" | "canceled" => Some(InstrumentStatus::Failed),
        _ => None,
    }
}

pub(crate) fn unmapped_status_error(raw: &str) -> PaymentError {
    PaymentError::gateway(
        format!("provider returned unknown instrument status: {}", raw),
        "STATUS_UNMAPPED",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwrap_data_descends_single_and_double_envelopes() {
        let flat = json!({"number": "8808"});
        let single = json!({"data": {"number": "8808"}});
        let double = json!({"data": {"data": {"number": "8808"}}});
        assert_eq!(unwrap_data(&flat)["number"], "8808");
        assert_eq!(unwrap_data(&single)["number"], "8808");
        assert_eq!(unwrap_data(&double)["number"], "8808");
    }

    #[test]
    fn probe_str_skips_empty_values() {
        let value = json!({"va_number": "", "number": "8808123"});
        assert_eq!(
            probe_str(&value, &["va_number", "number"]).as_deref(),
            Some("8808123")
        );
        assert_eq!(probe_str(&value, &["missing"]), None);
    }

    #[test]
    fn mock_outcome_is_frozen_per_reference() {
        let first = mock_outcome("VA-abc", 90);
        for _ in 0..10 {
            assert_eq!(mock_outcome("VA-abc", 90), first);
        }
        assert_eq!(mock_outcome("VA-abc", 100), InstrumentStatus::Paid);
        assert_eq!(mock_outcome("VA-abc", 0), InstrumentStatus::Failed);
    }

    #[test]
    fn provider_status_vocabulary_maps_to_canonical_states() {
        assert_eq!(map_provider_status("PAID"), Some(InstrumentStatus::Paid));
        assert_eq!(
            map_provider_status(" pending "),
            Some(InstrumentStatus::Pending)
        );
        assert_eq!(
            map_provider_status("expired"),
            Some(InstrumentStatus::Expired)
        );
        assert_eq!(
            map_provider_status("declined"),
            Some(InstrumentStatus::Failed)
        );
        assert_eq!(map_provider_status("weird"), None);
    }
}
