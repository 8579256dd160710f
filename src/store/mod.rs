//! Persistence seam for the reconciliation core.
//!
//! The services never issue SQL themselves: they talk to the [`Store`]
//! trait. Multi-row mutations that must be atomic (purchase + instrument
//! creation, paid activation) are single trait methods so every
//! implementation owns its own transaction boundary — there are no ad hoc
//! compensating deletes at the service layer.

pub mod memory;
pub mod models;
pub mod pg;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use models::*;
pub use pg::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A concurrent writer beat us to it (duplicate purchase, duplicate
    /// commission, state already terminal).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unrecoverable corruption, e.g. a paid transaction with no purchase.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Database error: {message}")]
    Database { message: String, retryable: bool },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database { retryable: true, .. })
    }

    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => StoreError::Database {
                message: err.to_string(),
                retryable: true,
            },
            _ => StoreError::Database {
                message: err.to_string(),
                retryable: false,
            },
        }
    }
}

/// Result of [`Store::apply_paid_activation`].
#[derive(Debug)]
pub enum ActivationOutcome {
    /// First delivery: transaction marked paid, purchase activated, access
    /// granted. Carries the activated purchase for the commission cascade.
    Activated(Purchase),
    /// Re-delivered webhook: nothing changed.
    AlreadyPaid(Purchase),
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- catalog / users ----------------------------------------------------

    async fn find_package(&self, package_id: Uuid) -> Result<Option<Package>, StoreError>;

    async fn find_user_access(&self, user_id: Uuid) -> Result<Option<UserAccess>, StoreError>;

    // -- purchases ----------------------------------------------------------

    /// The purchase (if any) that blocks a new one for this user: a pending
    /// purchase, or a paid purchase that has not yet expired.
    async fn find_blocking_purchase(&self, user_id: Uuid) -> Result<Option<Purchase>, StoreError>;

    /// Insert purchase and its payment instrument in one transaction,
    /// re-checking the one-non-terminal-purchase-per-user invariant inside
    /// that transaction. A concurrent duplicate surfaces as
    /// [`StoreError::Conflict`] and nothing is persisted.
    async fn insert_purchase_with_instrument(
        &self,
        purchase: NewPurchase,
        instrument: NewPaymentTransaction,
    ) -> Result<(Purchase, PaymentTransaction), StoreError>;

    async fn find_purchase(&self, purchase_id: Uuid) -> Result<Option<Purchase>, StoreError>;

    async fn find_purchase_by_code(&self, code: &str) -> Result<Option<Purchase>, StoreError>;

    /// Mark a still-pending purchase (and its instrument) failed. Returns
    /// [`StoreError::Conflict`] if the purchase is already terminal.
    async fn cancel_pending_purchase(
        &self,
        user_id: Uuid,
        transaction_code: &str,
    ) -> Result<Purchase, StoreError>;

    // -- payment transactions ----------------------------------------------

    /// Locate by transaction code or provider reference number.
    async fn find_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError>;

    /// Record a raw webhook payload for audit, regardless of outcome.
    async fn append_webhook_payload(
        &self,
        transaction_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), StoreError>;

    /// The paid transition, applied atomically under a row lock: idempotency
    /// check, transaction paid, purchase activated, user access granted.
    /// A missing owning purchase is [`StoreError::Integrity`] and rolls the
    /// whole thing back.
    async fn apply_paid_activation(
        &self,
        activation: &PaidActivation,
    ) -> Result<ActivationOutcome, StoreError>;

    /// Mark transaction + owning purchase failed. No-op on already-terminal
    /// transactions.
    async fn apply_payment_failure(
        &self,
        transaction_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), StoreError>;

    // -- commissions --------------------------------------------------------

    async fn commission_exists_for_purchase(&self, purchase_id: Uuid)
        -> Result<bool, StoreError>;

    /// Paid purchases for this user other than the given one. Zero means the
    /// given purchase is the user's first-ever paid purchase.
    async fn count_other_paid_purchases(
        &self,
        user_id: Uuid,
        exclude_purchase_id: Uuid,
    ) -> Result<u64, StoreError>;

    async fn insert_commission(
        &self,
        commission: NewCommission,
    ) -> Result<Commission, StoreError>;

    async fn approved_commission_total(
        &self,
        affiliate_user_id: Uuid,
    ) -> Result<i64, StoreError>;

    // -- withdrawals ---------------------------------------------------------

    async fn find_withdrawal_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Withdrawal>, StoreError>;

    async fn update_withdrawal_status(
        &self,
        withdrawal_id: Uuid,
        status: WithdrawalStatus,
        provider_transaction_id: Option<&str>,
    ) -> Result<Withdrawal, StoreError>;
}
