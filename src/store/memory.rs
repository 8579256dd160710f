//! In-memory [`Store`] implementation.
//!
//! Backs the test suite and mock-mode deployments. Every trait method takes
//! the single table lock for its whole duration, which gives the same
//! atomicity the Postgres store gets from transactions and row locks.

use super::{ActivationOutcome, Store, StoreError};
use crate::store::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    packages: HashMap<Uuid, Package>,
    users: HashMap<Uuid, UserAccess>,
    purchases: HashMap<Uuid, Purchase>,
    transactions: HashMap<Uuid, PaymentTransaction>,
    commissions: HashMap<Uuid, Commission>,
    withdrawals: HashMap<Uuid, Withdrawal>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Database {
            message: "memory store lock poisoned".to_string(),
            retryable: false,
        })
    }

    // -- fixture helpers (not part of the Store trait) ----------------------

    pub fn insert_package(&self, package: Package) {
        if let Ok(mut tables) = self.lock() {
            tables.packages.insert(package.id, package);
        }
    }

    pub fn upsert_user_access(&self, user: UserAccess) {
        if let Ok(mut tables) = self.lock() {
            tables.users.insert(user.user_id, user);
        }
    }

    pub fn insert_withdrawal(&self, withdrawal: Withdrawal) {
        if let Ok(mut tables) = self.lock() {
            tables.withdrawals.insert(withdrawal.id, withdrawal);
        }
    }

    /// Seed a historical paid purchase, bypassing the orchestrator.
    pub fn insert_purchase_record(&self, purchase: Purchase) {
        if let Ok(mut tables) = self.lock() {
            tables.purchases.insert(purchase.id, purchase);
        }
    }

    /// Rewind an instrument's creation time so mock auto-approve tests do not
    /// have to sleep through the configured delay.
    pub fn set_transaction_created_at(&self, transaction_id: Uuid, created_at: DateTime<Utc>) {
        if let Ok(mut tables) = self.lock() {
            if let Some(txn) = tables.transactions.get_mut(&transaction_id) {
                txn.created_at = created_at;
            }
        }
    }

    pub fn purchase_count(&self) -> usize {
        self.lock().map(|t| t.purchases.len()).unwrap_or(0)
    }

    pub fn commission_count(&self) -> usize {
        self.lock().map(|t| t.commissions.len()).unwrap_or(0)
    }

    pub fn get_user_access(&self, user_id: Uuid) -> Option<UserAccess> {
        self.lock().ok().and_then(|t| t.users.get(&user_id).cloned())
    }

    pub fn get_purchase(&self, purchase_id: Uuid) -> Option<Purchase> {
        self.lock()
            .ok()
            .and_then(|t| t.purchases.get(&purchase_id).cloned())
    }

    pub fn get_transaction(&self, transaction_id: Uuid) -> Option<PaymentTransaction> {
        self.lock()
            .ok()
            .and_then(|t| t.transactions.get(&transaction_id).cloned())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_package(&self, package_id: Uuid) -> Result<Option<Package>, StoreError> {
        Ok(self.lock()?.packages.get(&package_id).cloned())
    }

    async fn find_user_access(&self, user_id: Uuid) -> Result<Option<UserAccess>, StoreError> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    async fn find_blocking_purchase(&self, user_id: Uuid) -> Result<Option<Purchase>, StoreError> {
        let now = Utc::now();
        let tables = self.lock()?;
        Ok(tables
            .purchases
            .values()
            .find(|p| {
                p.user_id == user_id
                    && (p.status == PurchaseStatus::Pending || p.is_active_subscription(now))
            })
            .cloned())
    }

    async fn insert_purchase_with_instrument(
        &self,
        purchase: NewPurchase,
        instrument: NewPaymentTransaction,
    ) -> Result<(Purchase, PaymentTransaction), StoreError> {
        let now = Utc::now();
        let mut tables = self.lock()?;

        // Same re-check the Postgres store performs inside its transaction.
        if tables.purchases.values().any(|p| {
            p.user_id == purchase.user_id
                && (p.status == PurchaseStatus::Pending || p.is_active_subscription(now))
        }) {
            return Err(StoreError::Conflict(
                "user already has a non-terminal purchase".to_string(),
            ));
        }
        if tables
            .transactions
            .values()
            .any(|t| t.reference_no == instrument.reference_no)
        {
            return Err(StoreError::Conflict(format!(
                "duplicate reference number {}",
                instrument.reference_no
            )));
        }

        let purchase_row = Purchase {
            id: Uuid::new_v4(),
            user_id: purchase.user_id,
            package_id: purchase.package_id,
            transaction_code: purchase.transaction_code,
            package_type: purchase.package_type,
            amount: purchase.amount,
            payment_method: purchase.payment_method,
            status: PurchaseStatus::Pending,
            started_at: None,
            expires_at: None,
            paid_at: None,
            created_at: now,
        };
        let transaction_row = PaymentTransaction {
            id: Uuid::new_v4(),
            purchase_id: purchase_row.id,
            transaction_code: instrument.transaction_code,
            reference_no: instrument.reference_no,
            payment_method: instrument.payment_method,
            bank_code: instrument.bank_code,
            va_number: instrument.va_number,
            qr_content: instrument.qr_content,
            qr_url: instrument.qr_url,
            amount: instrument.amount,
            currency: instrument.currency,
            status: PurchaseStatus::Pending,
            mode: instrument.mode,
            expired_at: instrument.expired_at,
            paid_at: None,
            request_payload: instrument.request_payload,
            response_payload: instrument.response_payload,
            webhook_payload: None,
            created_at: now,
        };

        tables
            .purchases
            .insert(purchase_row.id, purchase_row.clone());
        tables
            .transactions
            .insert(transaction_row.id, transaction_row.clone());
        Ok((purchase_row, transaction_row))
    }

    async fn find_purchase(&self, purchase_id: Uuid) -> Result<Option<Purchase>, StoreError> {
        Ok(self.lock()?.purchases.get(&purchase_id).cloned())
    }

    async fn find_purchase_by_code(&self, code: &str) -> Result<Option<Purchase>, StoreError> {
        Ok(self
            .lock()?
            .purchases
            .values()
            .find(|p| p.transaction_code == code)
            .cloned())
    }

    async fn cancel_pending_purchase(
        &self,
        user_id: Uuid,
        transaction_code: &str,
    ) -> Result<Purchase, StoreError> {
        let mut tables = self.lock()?;
        let purchase_id = tables
            .purchases
            .values()
            .find(|p| p.user_id == user_id && p.transaction_code == transaction_code)
            .map(|p| p.id)
            .ok_or_else(|| StoreError::NotFound(format!("purchase {}", transaction_code)))?;

        {
            let purchase = tables
                .purchases
                .get_mut(&purchase_id)
                .ok_or_else(|| StoreError::NotFound(format!("purchase {}", transaction_code)))?;
            if purchase.status != PurchaseStatus::Pending {
                return Err(StoreError::Conflict(format!(
                    "purchase {} is already {}",
                    transaction_code, purchase.status
                )));
            }
            purchase.status = PurchaseStatus::Failed;
        }
        for txn in tables.transactions.values_mut() {
            if txn.purchase_id == purchase_id && txn.status == PurchaseStatus::Pending {
                txn.status = PurchaseStatus::Failed;
            }
        }
        Ok(tables.purchases[&purchase_id].clone())
    }

    async fn find_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError> {
        Ok(self
            .lock()?
            .transactions
            .values()
            .find(|t| t.transaction_code == reference || t.reference_no == reference)
            .cloned())
    }

    async fn append_webhook_payload(
        &self,
        transaction_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let txn = tables
            .transactions
            .get_mut(&transaction_id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", transaction_id)))?;
        txn.webhook_payload = Some(payload.clone());
        Ok(())
    }

    async fn apply_paid_activation(
        &self,
        activation: &PaidActivation,
    ) -> Result<ActivationOutcome, StoreError> {
        let mut tables = self.lock()?;

        let (purchase_id, already_paid) = {
            let txn = tables
                .transactions
                .get(&activation.transaction_id)
                .ok_or_else(|| {
                    StoreError::NotFound(format!("transaction {}", activation.transaction_id))
                })?;
            (txn.purchase_id, txn.status == PurchaseStatus::Paid)
        };

        // Validate the owning purchase and user exist before mutating
        // anything, so a corrupt row leaves the transaction in its
        // pre-webhook state. Mirrors the rollback the Postgres store gets
        // from erroring before commit.
        if !tables.purchases.contains_key(&purchase_id) {
            return Err(StoreError::Integrity(format!(
                "paid transaction {} has no owning purchase {}",
                activation.transaction_id, purchase_id
            )));
        }
        let user_id = tables.purchases[&purchase_id].user_id;
        if !tables.users.contains_key(&user_id) {
            return Err(StoreError::Integrity(format!(
                "user {} missing during access grant",
                user_id
            )));
        }

        if already_paid {
            return Ok(ActivationOutcome::AlreadyPaid(
                tables.purchases[&purchase_id].clone(),
            ));
        }

        let package_id = {
            let txn = tables
                .transactions
                .get_mut(&activation.transaction_id)
                .ok_or_else(|| {
                    StoreError::NotFound(format!("transaction {}", activation.transaction_id))
                })?;
            txn.status = PurchaseStatus::Paid;
            txn.paid_at = Some(activation.paid_at);
            txn.webhook_payload = Some(activation.webhook_payload.clone());

            let purchase = tables.purchases.get_mut(&purchase_id).ok_or_else(|| {
                StoreError::Integrity(format!("purchase {} vanished mid-activation", purchase_id))
            })?;
            purchase.status = PurchaseStatus::Paid;
            purchase.started_at = Some(activation.started_at);
            purchase.expires_at = Some(activation.expires_at);
            purchase.paid_at = Some(activation.paid_at);
            purchase.package_id
        };

        let user = tables.users.get_mut(&user_id).ok_or_else(|| {
            StoreError::Integrity(format!("user {} missing during access grant", user_id))
        })?;
        user.pdf_access_active = true;
        user.access_expires_at = Some(activation.expires_at);
        user.active_package_id = Some(package_id);

        Ok(ActivationOutcome::Activated(
            tables.purchases[&purchase_id].clone(),
        ))
    }

    async fn apply_payment_failure(
        &self,
        transaction_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let purchase_id = {
            let txn = tables
                .transactions
                .get_mut(&transaction_id)
                .ok_or_else(|| StoreError::NotFound(format!("transaction {}", transaction_id)))?;
            if txn.status.is_terminal() {
                return Ok(());
            }
            txn.status = PurchaseStatus::Failed;
            txn.webhook_payload = Some(payload.clone());
            txn.purchase_id
        };
        if let Some(purchase) = tables.purchases.get_mut(&purchase_id) {
            if purchase.status == PurchaseStatus::Pending {
                purchase.status = PurchaseStatus::Failed;
            }
        }
        Ok(())
    }

    async fn commission_exists_for_purchase(
        &self,
        purchase_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()?
            .commissions
            .values()
            .any(|c| c.purchase_id == purchase_id))
    }

    async fn count_other_paid_purchases(
        &self,
        user_id: Uuid,
        exclude_purchase_id: Uuid,
    ) -> Result<u64, StoreError> {
        Ok(self
            .lock()?
            .purchases
            .values()
            .filter(|p| {
                p.user_id == user_id
                    && p.id != exclude_purchase_id
                    && p.status == PurchaseStatus::Paid
            })
            .count() as u64)
    }

    async fn insert_commission(
        &self,
        commission: NewCommission,
    ) -> Result<Commission, StoreError> {
        let mut tables = self.lock()?;
        if tables
            .commissions
            .values()
            .any(|c| c.purchase_id == commission.purchase_id)
        {
            return Err(StoreError::Conflict(format!(
                "commission already exists for purchase {}",
                commission.purchase_id
            )));
        }
        let row = Commission {
            id: Uuid::new_v4(),
            affiliate_user_id: commission.affiliate_user_id,
            referred_user_id: commission.referred_user_id,
            purchase_id: commission.purchase_id,
            subscription_amount: commission.subscription_amount,
            commission_percent: commission.commission_percent,
            commission_amount: commission.commission_amount,
            status: commission.status,
            created_at: Utc::now(),
        };
        tables.commissions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn approved_commission_total(
        &self,
        affiliate_user_id: Uuid,
    ) -> Result<i64, StoreError> {
        Ok(self
            .lock()?
            .commissions
            .values()
            .filter(|c| {
                c.affiliate_user_id == affiliate_user_id
                    && c.status == CommissionStatus::Approved
            })
            .map(|c| c.commission_amount)
            .sum())
    }

    async fn find_withdrawal_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Withdrawal>, StoreError> {
        Ok(self
            .lock()?
            .withdrawals
            .values()
            .find(|w| w.reference_no == reference)
            .cloned())
    }

    async fn update_withdrawal_status(
        &self,
        withdrawal_id: Uuid,
        status: WithdrawalStatus,
        provider_transaction_id: Option<&str>,
    ) -> Result<Withdrawal, StoreError> {
        let mut tables = self.lock()?;
        let withdrawal = tables
            .withdrawals
            .get_mut(&withdrawal_id)
            .ok_or_else(|| StoreError::NotFound(format!("withdrawal {}", withdrawal_id)))?;
        withdrawal.status = status;
        if let Some(provider_id) = provider_transaction_id {
            withdrawal.provider_transaction_id = Some(provider_id.to_string());
        }
        Ok(withdrawal.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_purchase(user_id: Uuid) -> NewPurchase {
        NewPurchase {
            user_id,
            package_id: Uuid::new_v4(),
            transaction_code: format!("BP-{}", Uuid::new_v4().simple()),
            package_type: "premium".to_string(),
            amount: 100_000,
            payment_method: PaymentMethod::VirtualAccount,
        }
    }

    fn new_instrument(code: &str) -> NewPaymentTransaction {
        NewPaymentTransaction {
            transaction_code: code.to_string(),
            reference_no: format!("REF-{}", Uuid::new_v4().simple()),
            payment_method: PaymentMethod::VirtualAccount,
            bank_code: Some("014".to_string()),
            va_number: Some("8808123456789012".to_string()),
            qr_content: None,
            qr_url: None,
            amount: 100_000,
            currency: "IDR".to_string(),
            mode: crate::config::GatewayMode::Mock,
            expired_at: Some(Utc::now() + chrono::Duration::hours(24)),
            request_payload: None,
            response_payload: None,
        }
    }

    #[tokio::test]
    async fn duplicate_pending_purchase_is_rejected() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();

        let draft = new_purchase(user_id);
        let code = draft.transaction_code.clone();
        store
            .insert_purchase_with_instrument(draft, new_instrument(&code))
            .await
            .expect("first purchase should insert");

        let second = new_purchase(user_id);
        let code = second.transaction_code.clone();
        let err = store
            .insert_purchase_with_instrument(second, new_instrument(&code))
            .await
            .expect_err("second purchase must conflict");
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.purchase_count(), 1);
    }

    #[tokio::test]
    async fn paid_activation_is_idempotent() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store.upsert_user_access(UserAccess {
            user_id,
            referrer_id: None,
            pdf_access_active: false,
            access_expires_at: None,
            active_package_id: None,
        });

        let draft = new_purchase(user_id);
        let code = draft.transaction_code.clone();
        let (_, txn) = store
            .insert_purchase_with_instrument(draft, new_instrument(&code))
            .await
            .unwrap();

        let now = Utc::now();
        let activation = PaidActivation {
            transaction_id: txn.id,
            paid_at: now,
            started_at: now,
            expires_at: now + chrono::Duration::days(30),
            webhook_payload: json!({"status": "paid"}),
        };

        let first = store.apply_paid_activation(&activation).await.unwrap();
        assert!(matches!(first, ActivationOutcome::Activated(_)));
        let second = store.apply_paid_activation(&activation).await.unwrap();
        assert!(matches!(second, ActivationOutcome::AlreadyPaid(_)));

        let user = store.get_user_access(user_id).unwrap();
        assert!(user.pdf_access_active);
    }

    #[tokio::test]
    async fn failed_activation_leaves_transaction_in_pre_webhook_state() {
        let store = MemoryStore::new();
        // Purchase exists but the user record does not: the access grant
        // cannot succeed, so nothing may change.
        let draft = new_purchase(Uuid::new_v4());
        let code = draft.transaction_code.clone();
        let (purchase, txn) = store
            .insert_purchase_with_instrument(draft, new_instrument(&code))
            .await
            .unwrap();

        let now = Utc::now();
        let err = store
            .apply_paid_activation(&PaidActivation {
                transaction_id: txn.id,
                paid_at: now,
                started_at: now,
                expires_at: now + chrono::Duration::days(30),
                webhook_payload: json!({"status": "paid"}),
            })
            .await
            .expect_err("activation without a user record must fail");
        assert!(matches!(err, StoreError::Integrity(_)));

        // Both rows stay pending, so a provider retry can still activate
        // once the user record is repaired.
        assert_eq!(
            store.get_transaction(txn.id).unwrap().status,
            PurchaseStatus::Pending
        );
        assert_eq!(
            store.get_purchase(purchase.id).unwrap().status,
            PurchaseStatus::Pending
        );
    }

    #[tokio::test]
    async fn payment_failure_is_noop_on_terminal_transaction() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        store.upsert_user_access(UserAccess {
            user_id,
            referrer_id: None,
            pdf_access_active: false,
            access_expires_at: None,
            active_package_id: None,
        });

        let draft = new_purchase(user_id);
        let code = draft.transaction_code.clone();
        let (purchase, txn) = store
            .insert_purchase_with_instrument(draft, new_instrument(&code))
            .await
            .unwrap();

        let now = Utc::now();
        store
            .apply_paid_activation(&PaidActivation {
                transaction_id: txn.id,
                paid_at: now,
                started_at: now,
                expires_at: now + chrono::Duration::days(30),
                webhook_payload: json!({}),
            })
            .await
            .unwrap();

        // A late "failed" webhook must not demote the paid transaction.
        store
            .apply_payment_failure(txn.id, &json!({"status": "failed"}))
            .await
            .unwrap();
        assert_eq!(
            store.get_purchase(purchase.id).unwrap().status,
            PurchaseStatus::Paid
        );
    }
}
