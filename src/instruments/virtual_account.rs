//! Virtual account instrument generator.

use crate::error::{PaymentError, PaymentResult};
use crate::gateway::GatewayClient;
use crate::instruments::{
    mock_outcome, probe_str, unwrap_data, InstrumentGenerator, InstrumentParams, InstrumentStatus,
};
use crate::store::models::{NewPaymentTransaction, NewPurchase, PaymentMethod, PaymentTransaction};
use async_trait::async_trait;
use chrono::{Duration, FixedOffset, Utc};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const DEFAULT_BANK_CODE: &str = "014";

/// Field names the provider has used for the VA number across API revisions.
const VA_NUMBER_KEYS: [&str; 4] = [
    "number",
    "va_number",
    "virtual_account_number",
    "account_number",
];

const REFERENCE_KEYS: [&str; 4] = ["reff_no", "reference_no", "ref_no", "transaction_id"];

pub struct VirtualAccountGenerator {
    gateway: Arc<GatewayClient>,
}

impl VirtualAccountGenerator {
    pub fn new(gateway: Arc<GatewayClient>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl InstrumentGenerator for VirtualAccountGenerator {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::VirtualAccount
    }

    async fn generate(
        &self,
        purchase: &NewPurchase,
        params: &InstrumentParams,
    ) -> PaymentResult<NewPaymentTransaction> {
        let config = self.gateway.config();
        let limits = &config.virtual_account;

        // Validate before any provider call; an out-of-range amount must not
        // reach the network.
        if purchase.amount < limits.min_amount || purchase.amount > limits.max_amount {
            return Err(PaymentError::Validation {
                message: format!(
                    "virtual account amount must be between {} and {} IDR",
                    limits.min_amount, limits.max_amount
                ),
                field: Some("amount".to_string()),
            });
        }

        let bank_code = params
            .bank_code
            .clone()
            .unwrap_or_else(|| DEFAULT_BANK_CODE.to_string());
        let now = Utc::now();
        let expired_at = now + Duration::hours(limits.expiry_hours);
        // The provider expects local Jakarta time (UTC+7) without an offset
        // marker.
        let jakarta = FixedOffset::east_opt(7 * 3600).expect("UTC+7 is a valid offset");
        let expired_date = expired_at
            .with_timezone(&jakarta)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();

        let request_payload = json!({
            "partner_reference_no": purchase.transaction_code,
            "customer_no": purchase.user_id.to_string(),
            "bank_code": bank_code,
            "amount": purchase.amount,
            "currency": "IDR",
            "expired_date": expired_date,
        });

        let response = self
            .gateway
            .send_request(
                &config.endpoints.virtual_account_path,
                &request_payload,
                Method::POST,
            )
            .await?;
        if !response.success {
            return Err(PaymentError::Gateway {
                message: response.message,
                error_code: response
                    .error_code
                    .unwrap_or_else(|| "VA_CREATE_FAILED".to_string()),
                retryable: false,
            });
        }

        let instrument = unwrap_data(&response.data);
        let va_number = probe_str(instrument, &VA_NUMBER_KEYS).ok_or_else(|| {
            PaymentError::gateway(
                "provider response carries no virtual account number",
                "VA_NUMBER_MISSING",
            )
        })?;
        // A missing reference is survivable: a local one still lets webhooks
        // match by transaction code.
        let reference_no = probe_str(instrument, &REFERENCE_KEYS)
            .unwrap_or_else(|| format!("LOC-{}", Uuid::new_v4().simple()));

        info!(
            transaction_code = %purchase.transaction_code,
            reference_no = %reference_no,
            bank_code = %bank_code,
            "virtual account created"
        );

        Ok(NewPaymentTransaction {
            transaction_code: purchase.transaction_code.clone(),
            reference_no,
            payment_method: PaymentMethod::VirtualAccount,
            bank_code: Some(bank_code),
            va_number: Some(va_number),
            qr_content: None,
            qr_url: None,
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

        // The provider has no VA inquiry endpoint; the webhook is the source
        // of truth. All we can resolve locally is expiry.
        if let Some(expired_at) = transaction.expired_at {
            if expired_at <= now {
                return Ok(InstrumentStatus::Expired);
            }
        }
        Ok(InstrumentStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::SingaPayConfig;
    use crate::store::models::NewPurchase;
    use serde_json::Value as JsonValue;

    fn generator() -> VirtualAccountGenerator {
        let gateway = GatewayClient::new(
            Arc::new(SingaPayConfig::default()),
            Arc::new(MemoryCache::new()),
        )
        .expect("client init should succeed");
        VirtualAccountGenerator::new(Arc::new(gateway))
    }

    fn purchase(amount: i64) -> NewPurchase {
        NewPurchase {
            user_id: Uuid::new_v4(),
            package_id: Uuid::new_v4(),
            transaction_code: "BP-20260826-abcd1234".to_string(),
            package_type: "premium".to_string(),
            amount,
            payment_method: PaymentMethod::VirtualAccount,
        }
    }

    #[tokio::test]
    async fn generates_instrument_with_va_number_and_expiry() {
        let generator = generator();
        let instrument = generator
            .generate(&purchase(150_000), &InstrumentParams::default())
            .await
            .unwrap();

        let va_number = instrument.va_number.expect("VA number present");
        assert!(va_number.starts_with("8808"));
        assert_eq!(instrument.bank_code.as_deref(), Some(DEFAULT_BANK_CODE));
        assert_eq!(instrument.currency, "IDR");
        assert_eq!(instrument.amount, 150_000);

        let expired_at = instrument.expired_at.expect("expiry present");
        let hours = (expired_at - Utc::now()).num_hours();
        assert!((23..=24).contains(&hours));

        let request = instrument.request_payload.expect("request recorded");
        assert_eq!(request["partner_reference_no"], "BP-20260826-abcd1234");
        // Expiry is formatted as local Jakarta time, no offset suffix.
        let expired_date = request["expired_date"].as_str().unwrap();
        assert_eq!(expired_date.len(), "2026-08-26 12:00:00".len());
    }

    #[tokio::test]
    async fn below_minimum_amount_is_rejected_before_gateway() {
        let generator = generator();
        let err = generator
            .generate(&purchase(5_000), &InstrumentParams::default())
            .await
            .unwrap_err();
        match err {
            PaymentError::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("amount"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn caller_bank_code_is_forwarded() {
        let generator = generator();
        let params = InstrumentParams {
            bank_code: Some("002".to_string()),
        };
        let instrument = generator.generate(&purchase(150_000), &params).await.unwrap();
        assert_eq!(instrument.bank_code.as_deref(), Some("002"));
    }

    #[tokio::test]
    async fn mock_status_stays_pending_inside_approve_delay() {
        let generator = generator();
        let transaction = PaymentTransaction {
            id: Uuid::new_v4(),
            purchase_id: Uuid::new_v4(),
            transaction_code: "BP-1".to_string(),
            reference_no: "VA-1".to_string(),
            payment_method: PaymentMethod::VirtualAccount,
            bank_code: Some("014".to_string()),
            va_number: Some("8808000000000001".to_string()),
            qr_content: None,
            qr_url: None,
            amount: 150_000,
            currency: "IDR".to_string(),
            status: crate::store::models::TransactionStatus::Pending,
            mode: crate::config::GatewayMode::Mock,
            expired_at: Some(Utc::now() + Duration::hours(24)),
            paid_at: None,
            request_payload: None,
            response_payload: Some(JsonValue::Null),
            webhook_payload: None,
            created_at: Utc::now(),
        };
        let status = generator.check_status(&transaction).await.unwrap();
        assert_eq!(status, InstrumentStatus::Pending);
    }
}
