//! Unified error taxonomy for the reconciliation core.
//!
//! Validation and not-found failures are recovered at the service boundary
//! and turned into structured results; integrity errors propagate because no
//! automatic recovery is safe. Nothing above the gateway client ever sees a
//! raw network error.

use crate::store::StoreError;
use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("{entity} not found: {reference}")]
    NotFound {
        entity: &'static str,
        reference: String,
    },

    /// The user already holds a non-terminal purchase. Carries the current
    /// subscription's expiry so the caller can render an actionable message.
    #[error("User already has an active subscription")]
    AlreadySubscribed {
        transaction_code: String,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// Idempotency hit: the work was already done. Treated as success at the
    /// webhook boundary so provider retries stay harmless.
    #[error("Already processed: {reference}")]
    AlreadyProcessed { reference: String },

    /// A paid transaction without its owning purchase, or similar corruption.
    /// Fatal: the surrounding transaction rolls back and the operation aborts.
    #[error("Integrity error: {message}")]
    Integrity { message: String },

    #[error("Gateway error [{error_code}]: {message}")]
    Gateway {
        message: String,
        error_code: String,
        retryable: bool,
    },

    /// Distinct from [`PaymentError::Gateway`]: the provider never answered,
    /// so the caller may safely retry. Never interpreted as paid or failed.
    #[error("Connection timeout calling {endpoint}")]
    ConnectionTimeout { endpoint: String },

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed webhook payload: {message}")]
    MalformedPayload { message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl PaymentError {
    pub fn validation(message: impl Into<String>) -> Self {
        PaymentError::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn gateway(message: impl Into<String>, error_code: impl Into<String>) -> Self {
        PaymentError::Gateway {
            message: message.into(),
            error_code: error_code.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ConnectionTimeout { .. } => true,
            PaymentError::Gateway { retryable, .. } => *retryable,
            PaymentError::Store(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Idempotency hits are success from the provider's point of view.
    pub fn is_success_like(&self) -> bool {
        matches!(self, PaymentError::AlreadyProcessed { .. })
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::Validation { .. } => 400,
            PaymentError::NotFound { .. } => 404,
            PaymentError::AlreadySubscribed { .. } => 409,
            PaymentError::AlreadyProcessed { .. } => 200,
            PaymentError::Integrity { .. } => 500,
            PaymentError::Gateway { .. } => 502,
            PaymentError::ConnectionTimeout { .. } => 504,
            PaymentError::InvalidSignature => 401,
            PaymentError::MalformedPayload { .. } => 400,
            PaymentError::Store(_) => 500,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::Validation { message, .. } => message.clone(),
            PaymentError::NotFound { entity, .. } => format!("{} not found", entity),
            PaymentError::AlreadySubscribed { expires_at, .. } => match expires_at {
                Some(until) => format!(
                    "You already have an active subscription until {}",
                    until.format("%Y-%m-%d")
                ),
                None => "You already have a payment in progress".to_string(),
            },
            PaymentError::AlreadyProcessed { .. } => "Payment already processed".to_string(),
            PaymentError::ConnectionTimeout { .. } => {
                "Payment provider is temporarily unavailable, please retry".to_string()
            }
            PaymentError::Gateway { .. } => "Payment provider returned an error".to_string(),
            PaymentError::InvalidSignature => "Invalid webhook signature".to_string(),
            PaymentError::MalformedPayload { .. } => "Malformed webhook payload".to_string(),
            PaymentError::Integrity { .. } | PaymentError::Store(_) => {
                "Internal payment processing error".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retryable_but_gateway_rejection_is_not() {
        assert!(PaymentError::ConnectionTimeout {
            endpoint: "/api/v1/va".to_string()
        }
        .is_retryable());
        assert!(!PaymentError::gateway("declined", "PROVIDER_REJECTED").is_retryable());
    }

    #[test]
    fn already_processed_maps_to_success() {
        let err = PaymentError::AlreadyProcessed {
            reference: "BP-1".to_string(),
        };
        assert!(err.is_success_like());
        assert_eq!(err.http_status_code(), 200);
    }

    #[test]
    fn already_subscribed_message_carries_expiry() {
        let err = PaymentError::AlreadySubscribed {
            transaction_code: "BP-1".to_string(),
            expires_at: Some(
                chrono::DateTime::parse_from_rfc3339("2026-12-01T00:00:00Z")
                    .unwrap()
                    .with_timezone(&chrono::Utc),
            ),
        };
        assert!(err.user_message().contains("2026-12-01"));
        assert_eq!(err.http_status_code(), 409);
    }
}
