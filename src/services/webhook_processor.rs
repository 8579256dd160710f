//! Webhook reconciliation engine: the inbound half of the payment flow.
//!
//! The provider is the source of truth for payment outcomes and delivers
//! them at-least-once, unordered. Everything here is therefore idempotent:
//! re-delivered paid webhooks acknowledge without re-activating, and late
//! failure webhooks never demote a paid purchase.

use crate::config::SingaPayConfig;
use crate::error::{PaymentError, PaymentResult};
use crate::gateway::signature::verify_webhook_signature;
use crate::instruments::probe_str;
use crate::services::commission::CommissionEngine;
use crate::store::models::{PaidActivation, PaymentTransaction, WithdrawalStatus};
use crate::store::{ActivationOutcome, Store};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{error, info, warn};

const REFERENCE_KEYS: [&str; 4] = [
    "reff_no",
    "reference_no",
    "partner_reference_no",
    "transaction_code",
];

/// How a webhook was resolved. All three are 200-class outcomes for the
/// provider; distinguishing them matters for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    /// State changed as a result of this delivery.
    Processed,
    /// Idempotency hit: the delivery was a retry of work already done.
    AlreadyProcessed,
    /// Recognized payload with a status this core does not act on.
    Ignored,
}

pub struct WebhookProcessor {
    store: Arc<dyn Store>,
    config: Arc<SingaPayConfig>,
    commission: CommissionEngine,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn Store>, config: Arc<SingaPayConfig>) -> Self {
        let commission = CommissionEngine::new(store.clone(), config.commission.clone());
        Self {
            store,
            config,
            commission,
        }
    }

    /// Reconcile a payment webhook.
    ///
    /// `signature` is the raw `X-Signature` header. Signature verification
    /// is skipped in mock mode only; sandbox and production always verify
    /// before the payload is even parsed.
    pub async fn process_payment_webhook(
        &self,
        payload: &JsonValue,
        signature: Option<&str>,
    ) -> PaymentResult<WebhookAck> {
        self.verify_signature(payload, signature)?;

        let transaction_data = payload
            .get("data")
            .and_then(|d| d.get("transaction"))
            .ok_or_else(|| PaymentError::MalformedPayload {
                message: "missing data.transaction".to_string(),
            })?;
        let reference = probe_str(transaction_data, &REFERENCE_KEYS).ok_or_else(|| {
            PaymentError::MalformedPayload {
                message: "missing transaction reference".to_string(),
            }
        })?;
        let status = probe_str(transaction_data, &["status", "transaction_status"]).ok_or_else(
            || PaymentError::MalformedPayload {
                message: "missing transaction status".to_string(),
            },
        )?;

        let transaction = self
            .store
            .find_transaction_by_reference(&reference)
            .await?
            .ok_or_else(|| PaymentError::NotFound {
                entity: "payment transaction",
                reference: reference.clone(),
            })?;

        // Audit trail first: the raw payload is recorded whatever happens
        // next.
        self.store
            .append_webhook_payload(transaction.id, payload)
            .await?;

        info!(
            reference_no = %reference,
            status = %status,
            "payment webhook received"
        );

        match status.trim().to_lowercase().as_str() {
            "paid" | "success" | "settled" | "completed" => {
                self.handle_paid(&transaction, transaction_data, payload)
                    .await
            }
            "failed" | "declined" | "cancelled" | "canceled" | "expired" | "timeout" => {
                self.store
                    .apply_payment_failure(transaction.id, payload)
                    .await?;
                Ok(WebhookAck::Processed)
            }
            other => {
                info!(reference_no = %reference, status = other, "webhook status ignored");
                Ok(WebhookAck::Ignored)
            }
        }
    }

    async fn handle_paid(
        &self,
        transaction: &PaymentTransaction,
        transaction_data: &JsonValue,
        payload: &JsonValue,
    ) -> PaymentResult<WebhookAck> {
        let purchase = self
            .store
            .find_purchase(transaction.purchase_id)
            .await?
            .ok_or_else(|| PaymentError::Integrity {
                message: format!(
                    "paid transaction {} has no owning purchase {}",
                    transaction.id, transaction.purchase_id
                ),
            })?;
        let package = self
            .store
            .find_package(purchase.package_id)
            .await?
            .ok_or_else(|| PaymentError::Integrity {
                message: format!(
                    "purchase {} references missing package {}",
                    purchase.id, purchase.package_id
                ),
            })?;

        let paid_at = parse_paid_at(timestamp_field(transaction_data));
        let activation = PaidActivation {
            transaction_id: transaction.id,
            paid_at,
            started_at: paid_at,
            expires_at: paid_at + Duration::days(package.duration_days),
            webhook_payload: payload.clone(),
        };

        match self.store.apply_paid_activation(&activation).await? {
            ActivationOutcome::Activated(activated) => {
                info!(
                    transaction_code = %activated.transaction_code,
                    user_id = %activated.user_id,
                    expires_at = %activation.expires_at,
                    "purchase activated"
                );
                // The payment is settled; a commission failure must not fail
                // this webhook.
                if let Err(err) = self.commission.process_referral_commission(&activated).await
                {
                    error!(
                        purchase_id = %activated.id,
                        error = %err,
                        "commission cascade failed after activation"
                    );
                }
                Ok(WebhookAck::Processed)
            }
            ActivationOutcome::AlreadyPaid(existing) => {
                info!(
                    transaction_code = %existing.transaction_code,
                    "duplicate paid webhook acknowledged"
                );
                Ok(WebhookAck::AlreadyProcessed)
            }
        }
    }

    /// Resolve a disbursement (withdrawal payout) webhook.
    pub async fn process_disbursement_webhook(
        &self,
        payload: &JsonValue,
        signature: Option<&str>,
    ) -> PaymentResult<WebhookAck> {
        self.verify_signature(payload, signature)?;

        let data = payload
            .get("data")
            .ok_or_else(|| PaymentError::MalformedPayload {
                message: "missing data".to_string(),
            })?;
        let reference =
            probe_str(data, &["reference_number", "reference_no", "reff_no"]).ok_or_else(|| {
                PaymentError::MalformedPayload {
                    message: "missing disbursement reference".to_string(),
                }
            })?;
        let status = probe_str(data, &["status", "transaction_status"]).ok_or_else(|| {
            PaymentError::MalformedPayload {
                message: "missing disbursement status".to_string(),
            }
        })?;

        // Exact reference match only. Substring lookups once matched the
        // wrong withdrawal when one reference was a prefix of another.
        let withdrawal = self
            .store
            .find_withdrawal_by_reference(&reference)
            .await?
            .ok_or_else(|| PaymentError::NotFound {
                entity: "withdrawal",
                reference: reference.clone(),
            })?;

        if matches!(
            withdrawal.status,
            WithdrawalStatus::Processed | WithdrawalStatus::Failed
        ) {
            return Ok(WebhookAck::AlreadyProcessed);
        }

        let provider_transaction_id =
            probe_str(data, &["transaction_id", "provider_transaction_id"]);
        let next_status = match status.trim().to_lowercase().as_str() {
            "success" | "processed" | "completed" => WithdrawalStatus::Processed,
            "failed" | "declined" | "rejected" => WithdrawalStatus::Failed,
            other => {
                info!(reference_no = %reference, status = other, "disbursement status ignored");
                return Ok(WebhookAck::Ignored);
            }
        };

        self.store
            .update_withdrawal_status(
                withdrawal.id,
                next_status,
                provider_transaction_id.as_deref(),
            )
            .await?;
        info!(
            reference_no = %reference,
            status = ?next_status,
            "withdrawal resolved"
        );
        Ok(WebhookAck::Processed)
    }

    fn verify_signature(&self, payload: &JsonValue, signature: Option<&str>) -> PaymentResult<()> {
        if self.config.mode.is_mock() {
            return Ok(());
        }
        let provided = signature.ok_or(PaymentError::InvalidSignature)?;
        if !verify_webhook_signature(payload, &self.config.credentials.client_id, provided) {
            warn!("webhook rejected: signature mismatch");
            return Err(PaymentError::InvalidSignature);
        }
        Ok(())
    }
}

/// The settlement timestamp has shipped under three names.
fn timestamp_field(data: &JsonValue) -> Option<&JsonValue> {
    ["paid_at", "processed_timestamp", "post_timestamp"]
        .iter()
        .find_map(|key| data.get(*key))
}

/// Providers send `paid_at` as epoch millis, epoch seconds, RFC 3339, or a
/// naive Jakarta-local timestamp. Anything unparseable falls back to now,
/// which only skews the subscription window, never the paid transition.
fn parse_paid_at(value: Option<&JsonValue>) -> DateTime<Utc> {
    let Some(value) = value else {
        return Utc::now();
    };
    if let Some(epoch) = value.as_i64() {
        let parsed = if epoch > 1_000_000_000_000 {
            Utc.timestamp_millis_opt(epoch).single()
        } else {
            Utc.timestamp_opt(epoch, 0).single()
        };
        if let Some(timestamp) = parsed {
            return timestamp;
        }
    }
    if let Some(raw) = value.as_str() {
        if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
            return timestamp.with_timezone(&Utc);
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
            let jakarta = FixedOffset::east_opt(7 * 3600).expect("UTC+7 is a valid offset");
            if let Some(local) = naive.and_local_timezone(jakarta).single() {
                return local.with_timezone(&Utc);
            }
        }
    }
    warn!(value = %value, "unparseable paid_at, falling back to receipt time");
    Utc::now()
}
