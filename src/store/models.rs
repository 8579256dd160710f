//! Domain records owned (or consumed) by the reconciliation core.
//!
//! Amounts are whole rupiah (`i64`) — IDR has no minor unit. Statuses are
//! real enums; the Postgres store maps them to and from text columns.

use crate::config::GatewayMode;
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Paid,
    Expired,
    Failed,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Paid => "paid",
            PurchaseStatus::Expired => "expired",
            PurchaseStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PurchaseStatus::Pending)
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PurchaseStatus::Pending),
            "paid" => Some(PurchaseStatus::Paid),
            "expired" => Some(PurchaseStatus::Expired),
            "failed" => Some(PurchaseStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub type TransactionStatus = PurchaseStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    VirtualAccount,
    Qris,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::VirtualAccount => "virtual_account",
            PaymentMethod::Qris => "qris",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "virtual_account" => Some(PaymentMethod::VirtualAccount),
            "qris" => Some(PaymentMethod::Qris),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "virtual_account" | "va" => Ok(PaymentMethod::VirtualAccount),
            "qris" | "qr" => Ok(PaymentMethod::Qris),
            _ => Err(PaymentError::Validation {
                message: format!("unsupported payment method: {}", value),
                field: Some("payment_method".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Approved,
    Paid,
}

impl CommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionStatus::Pending => "pending",
            CommissionStatus::Approved => "approved",
            CommissionStatus::Paid => "paid",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CommissionStatus::Pending),
            "approved" => Some(CommissionStatus::Approved),
            "paid" => Some(CommissionStatus::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Processed => "processed",
            WithdrawalStatus::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(WithdrawalStatus::Pending),
            "processing" => Some(WithdrawalStatus::Processing),
            "processed" => Some(WithdrawalStatus::Processed),
            "failed" => Some(WithdrawalStatus::Failed),
            _ => None,
        }
    }
}

/// Premium package a user subscribes to. Owned by the catalog, read here.
#[derive(Debug, Clone)]
pub struct Package {
    pub id: Uuid,
    pub name: String,
    pub package_type: String,
    pub price: i64,
    pub duration_days: i64,
    pub active: bool,
}

/// The slice of the user record this core reads and mutates on activation.
#[derive(Debug, Clone)]
pub struct UserAccess {
    pub user_id: Uuid,
    pub referrer_id: Option<Uuid>,
    pub pdf_access_active: bool,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub active_package_id: Option<Uuid>,
}

/// One subscription attempt. Created pending, never deleted.
#[derive(Debug, Clone)]
pub struct Purchase {
    pub id: Uuid,
    pub user_id: Uuid,
    pub package_id: Uuid,
    pub transaction_code: String,
    pub package_type: String,
    pub amount: i64,
    pub payment_method: PaymentMethod,
    pub status: PurchaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Purchase {
    /// A paid purchase whose expiry is still in the future.
    pub fn is_active_subscription(&self, now: DateTime<Utc>) -> bool {
        self.status == PurchaseStatus::Paid
            && self.expires_at.map(|until| until > now).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct NewPurchase {
    pub user_id: Uuid,
    pub package_id: Uuid,
    pub transaction_code: String,
    pub package_type: String,
    pub amount: i64,
    pub payment_method: PaymentMethod,
}

/// One provider-side payment instrument backing exactly one purchase.
#[derive(Debug, Clone)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub purchase_id: Uuid,
    pub transaction_code: String,
    pub reference_no: String,
    pub payment_method: PaymentMethod,
    pub bank_code: Option<String>,
    pub va_number: Option<String>,
    pub qr_content: Option<String>,
    pub qr_url: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub mode: GatewayMode,
    pub expired_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
    pub webhook_payload: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

/// Instrument produced by a generator, persisted atomically with its purchase.
#[derive(Debug, Clone)]
pub struct NewPaymentTransaction {
    pub transaction_code: String,
    pub reference_no: String,
    pub payment_method: PaymentMethod,
    pub bank_code: Option<String>,
    pub va_number: Option<String>,
    pub qr_content: Option<String>,
    pub qr_url: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub mode: GatewayMode,
    pub expired_at: Option<DateTime<Utc>>,
    pub request_payload: Option<JsonValue>,
    pub response_payload: Option<JsonValue>,
}

/// One affiliate payout credit. At most one per purchase.
#[derive(Debug, Clone)]
pub struct Commission {
    pub id: Uuid,
    pub affiliate_user_id: Uuid,
    pub referred_user_id: Uuid,
    pub purchase_id: Uuid,
    pub subscription_amount: i64,
    pub commission_percent: u32,
    pub commission_amount: i64,
    pub status: CommissionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCommission {
    pub affiliate_user_id: Uuid,
    pub referred_user_id: Uuid,
    pub purchase_id: Uuid,
    pub subscription_amount: i64,
    pub commission_percent: u32,
    pub commission_amount: i64,
    pub status: CommissionStatus,
}

/// Payout request against accumulated approved commissions. Interface only:
/// created elsewhere, resolved here by the disbursement webhook.
#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub id: Uuid,
    pub affiliate_user_id: Uuid,
    pub amount: i64,
    pub bank_code: String,
    pub account_number: String,
    pub status: WithdrawalStatus,
    pub reference_no: String,
    pub provider_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Changeset applied atomically when a paid webhook reconciles a transaction:
/// transaction marked paid, purchase activated, user access granted.
#[derive(Debug, Clone)]
pub struct PaidActivation {
    pub transaction_id: Uuid,
    pub paid_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub webhook_payload: JsonValue,
}
