//! QRIS instrument generator.

use crate::error::{PaymentError, PaymentResult};
use crate::gateway::GatewayClient;
use crate::instruments::{
    map_provider_status, mock_outcome, probe_str, unmapped_status_error, unwrap_data,
    InstrumentGenerator, InstrumentParams, InstrumentStatus,
};
use crate::store::models::{NewPaymentTransaction, NewPurchase, PaymentMethod, PaymentTransaction};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const QR_CONTENT_KEYS: [&str; 3] = ["qr_content", "qris_content", "qr_string"];
const QR_URL_KEYS: [&str; 3] = ["qr_url", "qris_url", "url"];
const REFERENCE_KEYS: [&str; 4] = ["reff_no", "reference_no", "ref_no", "transaction_id"];

pub struct QrisGenerator {
    gateway: Arc<GatewayClient>,
}

impl QrisGenerator {
    pub fn new(gateway: Arc<GatewayClient>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl InstrumentGenerator for QrisGenerator {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Qris
    }

    async fn generate(
        &self,
        purchase: &NewPurchase,
        _params: &InstrumentParams,
    ) -> PaymentResult<NewPaymentTransaction> {
        let config = self.gateway.config();

        if purchase.amount <= 0 {
            return Err(PaymentError::Validation {
                message: "QRIS amount must be positive".to_string(),
                field: Some("amount".to_string()),
            });
        }

        let now = Utc::now();
        let expired_at = now + Duration::hours(config.qris.expiry_hours);
        let request_payload = json!({
            "partner_reference_no": purchase.transaction_code,
            "merchant_id": config.credentials.merchant_account_id,
            "amount": purchase.amount,
            "currency": "IDR",
            "validity_period_secs": config.qris.expiry_hours * 3600,
        });

        let response = self
            .gateway
            .send_request(
                &config.endpoints.qris_generate_path,
                &request_payload,
                Method::POST,
            )
            .await?;
        if !response.success {
            return Err(PaymentError::Gateway {
                message: response.message,
                error_code: response
                    .error_code
                    .unwrap_or_else(|| "QRIS_CREATE_FAILED".to_string()),
                retryable: false,
            });
        }

        let instrument = unwrap_data(&response.data);
        let qr_content = probe_str(instrument, &QR_CONTENT_KEYS).ok_or_else(|| {
            PaymentError::gateway(
                "provider response carries no QR content",
                "QR_CONTENT_MISSING",
            )
        })?;
        let qr_url = probe_str(instrument, &QR_URL_KEYS);
        let reference_no = probe_str(instrument, &REFERENCE_KEYS)
            .unwrap_or_else(|| format!("LOC-{}", Uuid::new_v4().simple()));

        info!(
            transaction_code = %purchase.transaction_code,
            reference_no = %reference_no,
            "QRIS code generated"
        );

        Ok(NewPaymentTransaction {
            transaction_code: purchase.transaction_code.clone(),
            reference_no,
            payment_method: PaymentMethod::Qris,
            bank_code: None,
            va_number: None,
            qr_content: Some(qr_content),
            qr_url,
            amount: purchase.amount,
            currency: "IDR".to_string(),
            mode: config.mode,
            expired_at: Some(expired_at),
            request_payload: Some(request_payload),
            response_payload: Some(response.data),
        })
    }

    async fn check_status(
        &self,
        transaction: &PaymentTransaction,
    ) -> PaymentResult<InstrumentStatus> {
        let config = self.gateway.config();
        let now = Utc::now();

        if transaction.mode.is_mock() {
            let elapsed = (now - transaction.created_at).num_seconds();
            if elapsed < config.mock.auto_approve_delay_secs {
                return Ok(InstrumentStatus::Pending);
            }
            return Ok(mock_outcome(
                &transaction.reference_no,
                config.mock.success_rate_percent,
            ));
        }

        let response = self
            .gateway
            .send_request(
                &config.endpoints.qris_status_path,
                &json!({ "reference_no": transaction.reference_no }),
                Method::POST,
            )
            .await?;
        if !response.success {
            return Err(PaymentError::Gateway {
                message: response.message,
                error_code: response
                    .error_code
                    .unwrap_or_else(|| "QRIS_QUERY_FAILED".to_string()),
                retryable: false,
            });
        }

        let raw = probe_str(unwrap_data(&response.data), &["status", "transaction_status"])
            .ok_or_else(|| {
                PaymentError::gateway("no status in QRIS inquiry response", "STATUS_MISSING")
            })?;
        map_provider_status(&raw).ok_or_else(|| unmapped_status_error(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::SingaPayConfig;

    fn generator() -> QrisGenerator {
        let gateway = GatewayClient::new(
            Arc::new(SingaPayConfig::default()),
            Arc::new(MemoryCache::new()),
        )
        .expect("client init should succeed");
        QrisGenerator::new(Arc::new(gateway))
    }

    fn purchase(amount: i64) -> NewPurchase {
        NewPurchase {
            user_id: Uuid::new_v4(),
            package_id: Uuid::new_v4(),
            transaction_code: "BP-20260826-qris0001".to_string(),
            package_type: "premium".to_string(),
            amount,
            payment_method: PaymentMethod::Qris,
        }
    }

    #[tokio::test]
    async fn generates_instrument_with_qr_content() {
        let generator = generator();
        let instrument = generator
            .generate(&purchase(99_000), &InstrumentParams::default())
            .await
            .unwrap();

        assert!(instrument.qr_content.is_some());
        assert!(instrument.qr_url.is_some());
        assert!(instrument.va_number.is_none());
        assert_eq!(instrument.payment_method, PaymentMethod::Qris);

        // QRIS expiry is short-lived, one hour by default.
        let expired_at = instrument.expired_at.expect("expiry present");
        let minutes = (expired_at - Utc::now()).num_minutes();
        assert!((59..=60).contains(&minutes));
    }

    #[tokio::test]
    async fn non_positive_amount_is_rejected() {
        let generator = generator();
        let err = generator
            .generate(&purchase(0), &InstrumentParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Validation { .. }));
    }
}
