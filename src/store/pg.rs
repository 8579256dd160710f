//! Postgres [`Store`] implementation.
//!
//! Compound mutations run inside an explicit sqlx transaction with
//! `SELECT ... FOR UPDATE` on the rows being decided on, so two concurrent
//! webhook deliveries cannot both observe "not yet paid".

use super::{ActivationOutcome, Store, StoreError};
use crate::config::GatewayMode;
use crate::store::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PURCHASE_COLUMNS: &str = "id, user_id, package_id, transaction_code, package_type, amount, \
     payment_method, status, started_at, expires_at, paid_at, created_at";

const TRANSACTION_COLUMNS: &str = "id, purchase_id, transaction_code, reference_no, \
     payment_method, bank_code, va_number, qr_content, qr_url, amount, currency, status, mode, \
     expired_at, paid_at, request_payload, response_payload, webhook_payload, created_at";

#[derive(Debug, FromRow)]
struct PurchaseRow {
    id: Uuid,
    user_id: Uuid,
    package_id: Uuid,
    transaction_code: String,
    package_type: String,
    amount: i64,
    payment_method: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PurchaseRow> for Purchase {
    type Error = StoreError;

    fn try_from(row: PurchaseRow) -> Result<Self, StoreError> {
        Ok(Purchase {
            id: row.id,
            user_id: row.user_id,
            package_id: row.package_id,
            transaction_code: row.transaction_code,
            package_type: row.package_type,
            amount: row.amount,
            payment_method: PaymentMethod::from_db(&row.payment_method).ok_or_else(|| {
                StoreError::Integrity(format!("unknown payment method {}", row.payment_method))
            })?,
            status: PurchaseStatus::from_db(&row.status).ok_or_else(|| {
                StoreError::Integrity(format!("unknown purchase status {}", row.status))
            })?,
            started_at: row.started_at,
            expires_at: row.expires_at,
            paid_at: row.paid_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    purchase_id: Uuid,
    transaction_code: String,
    reference_no: String,
    payment_method: String,
    bank_code: Option<String>,
    va_number: Option<String>,
    qr_content: Option<String>,
    qr_url: Option<String>,
    amount: i64,
    currency: String,
    status: String,
    mode: String,
    expired_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    request_payload: Option<JsonValue>,
    response_payload: Option<JsonValue>,
    webhook_payload: Option<JsonValue>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, StoreError> {
        Ok(PaymentTransaction {
            id: row.id,
            purchase_id: row.purchase_id,
            transaction_code: row.transaction_code,
            reference_no: row.reference_no,
            payment_method: PaymentMethod::from_db(&row.payment_method).ok_or_else(|| {
                StoreError::Integrity(format!("unknown payment method {}", row.payment_method))
            })?,
            bank_code: row.bank_code,
            va_number: row.va_number,
            qr_content: row.qr_content,
            qr_url: row.qr_url,
            amount: row.amount,
            currency: row.currency,
            status: PurchaseStatus::from_db(&row.status).ok_or_else(|| {
                StoreError::Integrity(format!("unknown transaction status {}", row.status))
            })?,
            mode: row
                .mode
                .parse::<GatewayMode>()
                .map_err(|_| StoreError::Integrity(format!("unknown mode {}", row.mode)))?,
            expired_at: row.expired_at,
            paid_at: row.paid_at,
            request_payload: row.request_payload,
            response_payload: row.response_payload,
            webhook_payload: row.webhook_payload,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CommissionRow {
    id: Uuid,
    affiliate_user_id: Uuid,
    referred_user_id: Uuid,
    purchase_id: Uuid,
    subscription_amount: i64,
    commission_percent: i32,
    commission_amount: i64,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<CommissionRow> for Commission {
    type Error = StoreError;

    fn try_from(row: CommissionRow) -> Result<Self, StoreError> {
        Ok(Commission {
            id: row.id,
            affiliate_user_id: row.affiliate_user_id,
            referred_user_id: row.referred_user_id,
            purchase_id: row.purchase_id,
            subscription_amount: row.subscription_amount,
            commission_percent: row.commission_percent as u32,
            commission_amount: row.commission_amount,
            status: CommissionStatus::from_db(&row.status).ok_or_else(|| {
                StoreError::Integrity(format!("unknown commission status {}", row.status))
            })?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WithdrawalRow {
    id: Uuid,
    affiliate_user_id: Uuid,
    amount: i64,
    bank_code: String,
    account_number: String,
    status: String,
    reference_no: String,
    provider_transaction_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<WithdrawalRow> for Withdrawal {
    type Error = StoreError;

    fn try_from(row: WithdrawalRow) -> Result<Self, StoreError> {
        Ok(Withdrawal {
            id: row.id,
            affiliate_user_id: row.affiliate_user_id,
            amount: row.amount,
            bank_code: row.bank_code,
            account_number: row.account_number,
            status: WithdrawalStatus::from_db(&row.status).ok_or_else(|| {
                StoreError::Integrity(format!("unknown withdrawal status {}", row.status))
            })?,
            reference_no: row.reference_no,
            provider_transaction_id: row.provider_transaction_id,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_package(&self, package_id: Uuid) -> Result<Option<Package>, StoreError> {
        #[derive(FromRow)]
        struct PackageRow {
            id: Uuid,
            name: String,
            package_type: String,
            price: i64,
            duration_days: i64,
            active: bool,
        }

        let row = sqlx::query_as::<_, PackageRow>(
            "SELECT id, name, package_type, price, duration_days, active \
             FROM packages WHERE id = $1",
        )
        .bind(package_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Ok(row.map(|r| Package {
            id: r.id,
            name: r.name,
            package_type: r.package_type,
            price: r.price,
            duration_days: r.duration_days,
            active: r.active,
        }))
    }

    async fn find_user_access(&self, user_id: Uuid) -> Result<Option<UserAccess>, StoreError> {
        #[derive(FromRow)]
        struct UserRow {
            id: Uuid,
            referrer_id: Option<Uuid>,
            pdf_access_active: bool,
            access_expires_at: Option<DateTime<Utc>>,
            active_package_id: Option<Uuid>,
        }

        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, referrer_id, pdf_access_active, access_expires_at, active_package_id \
             FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Ok(row.map(|r| UserAccess {
            user_id: r.id,
            referrer_id: r.referrer_id,
            pdf_access_active: r.pdf_access_active,
            access_expires_at: r.access_expires_at,
            active_package_id: r.active_package_id,
        }))
    }

    async fn find_blocking_purchase(&self, user_id: Uuid) -> Result<Option<Purchase>, StoreError> {
        let row = sqlx::query_as::<_, PurchaseRow>(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases \
             WHERE user_id = $1 \
               AND (status = 'pending' OR (status = 'paid' AND expires_at > NOW())) \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        row.map(Purchase::try_from).transpose()
    }

    async fn insert_purchase_with_instrument(
        &self,
        purchase: NewPurchase,
        instrument: NewPaymentTransaction,
    ) -> Result<(Purchase, PaymentTransaction), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        // Re-check the invariant inside the transaction so two concurrent
        // create-purchase requests cannot both pass the service-level check.
        // The lock only helps when a blocking row already exists; the
        // no-existing-row race is closed by the partial unique index on
        // pending purchases, which surfaces here as a Conflict.
        let blocking = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM purchases \
             WHERE user_id = $1 \
               AND (status = 'pending' OR (status = 'paid' AND expires_at > NOW())) \
             LIMIT 1 FOR UPDATE",
        )
        .bind(purchase.user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;
        if blocking.is_some() {
            return Err(StoreError::Conflict(
                "user already has a non-terminal purchase".to_string(),
            ));
        }

        let purchase_row = sqlx::query_as::<_, PurchaseRow>(&format!(
            "INSERT INTO purchases \
             (user_id, package_id, transaction_code, package_type, amount, payment_method, status) \
             VALUES ($1, $2, $3, $4, $5, $6, 'pending') \
             RETURNING {PURCHASE_COLUMNS}"
        ))
        .bind(purchase.user_id)
        .bind(purchase.package_id)
        .bind(&purchase.transaction_code)
        .bind(&purchase.package_type)
        .bind(purchase.amount)
        .bind(purchase.payment_method.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        let transaction_row = sqlx::query_as::<_, TransactionRow>(&format!(
            "INSERT INTO payment_transactions \
             (purchase_id, transaction_code, reference_no, payment_method, bank_code, va_number, \
              qr_content, qr_url, amount, currency, status, mode, expired_at, request_payload, \
              response_payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', $11, $12, $13, $14) \
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(purchase_row.id)
        .bind(&instrument.transaction_code)
        .bind(&instrument.reference_no)
        .bind(instrument.payment_method.as_str())
        .bind(&instrument.bank_code)
        .bind(&instrument.va_number)
        .bind(&instrument.qr_content)
        .bind(&instrument.qr_url)
        .bind(instrument.amount)
        .bind(&instrument.currency)
        .bind(instrument.mode.as_str())
        .bind(instrument.expired_at)
        .bind(&instrument.request_payload)
        .bind(&instrument.response_payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        tx.commit().await.map_err(StoreError::from_sqlx)?;

        Ok((
            Purchase::try_from(purchase_row)?,
            PaymentTransaction::try_from(transaction_row)?,
        ))
    }

    async fn find_purchase(&self, purchase_id: Uuid) -> Result<Option<Purchase>, StoreError> {
        let row = sqlx::query_as::<_, PurchaseRow>(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE id = $1"
        ))
        .bind(purchase_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        row.map(Purchase::try_from).transpose()
    }

    async fn find_purchase_by_code(&self, code: &str) -> Result<Option<Purchase>, StoreError> {
        let row = sqlx::query_as::<_, PurchaseRow>(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE transaction_code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        row.map(Purchase::try_from).transpose()
    }

    async fn cancel_pending_purchase(
        &self,
        user_id: Uuid,
        transaction_code: &str,
    ) -> Result<Purchase, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        let row = sqlx::query_as::<_, PurchaseRow>(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases \
             WHERE user_id = $1 AND transaction_code = $2 FOR UPDATE"
        ))
        .bind(user_id)
        .bind(transaction_code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::NotFound(format!("purchase {}", transaction_code)))?;

        if row.status != "pending" {
            return Err(StoreError::Conflict(format!(
                "purchase {} is already {}",
                transaction_code, row.status
            )));
        }

        let updated = sqlx::query_as::<_, PurchaseRow>(&format!(
            "UPDATE purchases SET status = 'failed' WHERE id = $1 RETURNING {PURCHASE_COLUMNS}"
        ))
        .bind(row.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        sqlx::query(
            "UPDATE payment_transactions SET status = 'failed' \
             WHERE purchase_id = $1 AND status = 'pending'",
        )
        .bind(row.id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Purchase::try_from(updated)
    }

    async fn find_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions \
             WHERE transaction_code = $1 OR reference_no = $1 LIMIT 1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn append_webhook_payload(
        &self,
        transaction_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE payment_transactions SET webhook_payload = $2 WHERE id = $1",
        )
        .bind(transaction_id)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "transaction {}",
                transaction_id
            )));
        }
        Ok(())
    }

    async fn apply_paid_activation(
        &self,
        activation: &PaidActivation,
    ) -> Result<ActivationOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        let txn_row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(activation.transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| {
            StoreError::NotFound(format!("transaction {}", activation.transaction_id))
        })?;

        let purchase_row = sqlx::query_as::<_, PurchaseRow>(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE id = $1 FOR UPDATE"
        ))
        .bind(txn_row.purchase_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| {
            StoreError::Integrity(format!(
                "paid transaction {} has no owning purchase {}",
                txn_row.id, txn_row.purchase_id
            ))
        })?;

        if txn_row.status == "paid" {
            // Re-delivered webhook: commit nothing, report success.
            tx.commit().await.map_err(StoreError::from_sqlx)?;
            return Ok(ActivationOutcome::AlreadyPaid(Purchase::try_from(
                purchase_row,
            )?));
        }

        sqlx::query(
            "UPDATE payment_transactions \
             SET status = 'paid', paid_at = $2, webhook_payload = $3 WHERE id = $1",
        )
        .bind(txn_row.id)
        .bind(activation.paid_at)
        .bind(&activation.webhook_payload)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        let activated = sqlx::query_as::<_, PurchaseRow>(&format!(
            "UPDATE purchases \
             SET status = 'paid', started_at = $2, expires_at = $3, paid_at = $4 \
             WHERE id = $1 RETURNING {PURCHASE_COLUMNS}"
        ))
        .bind(purchase_row.id)
        .bind(activation.started_at)
        .bind(activation.expires_at)
        .bind(activation.paid_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        let granted = sqlx::query(
            "UPDATE users \
             SET pdf_access_active = TRUE, access_expires_at = $2, active_package_id = $3 \
             WHERE id = $1",
        )
        .bind(purchase_row.user_id)
        .bind(activation.expires_at)
        .bind(purchase_row.package_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;
        if granted.rows_affected() == 0 {
            // Rolls back on drop, leaving the transaction pre-webhook.
            return Err(StoreError::Integrity(format!(
                "user {} missing during access grant",
                purchase_row.user_id
            )));
        }

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(ActivationOutcome::Activated(Purchase::try_from(activated)?))
    }

    async fn apply_payment_failure(
        &self,
        transaction_id: Uuid,
        payload: &JsonValue,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        let txn_row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::NotFound(format!("transaction {}", transaction_id)))?;

        if txn_row.status != "pending" {
            tx.commit().await.map_err(StoreError::from_sqlx)?;
            return Ok(());
        }

        sqlx::query(
            "UPDATE payment_transactions \
             SET status = 'failed', webhook_payload = $2 WHERE id = $1",
        )
        .bind(transaction_id)
        .bind(payload)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        sqlx::query("UPDATE purchases SET status = 'failed' WHERE id = $1 AND status = 'pending'")
            .bind(txn_row.purchase_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    async fn commission_exists_for_purchase(
        &self,
        purchase_id: Uuid,
    ) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM commissions WHERE purchase_id = $1)",
        )
        .bind(purchase_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(exists)
    }

    async fn count_other_paid_purchases(
        &self,
        user_id: Uuid,
        exclude_purchase_id: Uuid,
    ) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM purchases \
             WHERE user_id = $1 AND id <> $2 AND status = 'paid'",
        )
        .bind(user_id)
        .bind(exclude_purchase_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(count as u64)
    }

    async fn insert_commission(
        &self,
        commission: NewCommission,
    ) -> Result<Commission, StoreError> {
        let row = sqlx::query_as::<_, CommissionRow>(
            "INSERT INTO commissions \
             (affiliate_user_id, referred_user_id, purchase_id, subscription_amount, \
              commission_percent, commission_amount, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING id, affiliate_user_id, referred_user_id, purchase_id, \
                       subscription_amount, commission_percent, commission_amount, status, \
                       created_at",
        )
        .bind(commission.affiliate_user_id)
        .bind(commission.referred_user_id)
        .bind(commission.purchase_id)
        .bind(commission.subscription_amount)
        .bind(commission.commission_percent as i32)
        .bind(commission.commission_amount)
        .bind(commission.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Commission::try_from(row)
    }

    async fn approved_commission_total(
        &self,
        affiliate_user_id: Uuid,
    ) -> Result<i64, StoreError> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(commission_amount), 0)::BIGINT FROM commissions \
             WHERE affiliate_user_id = $1 AND status = 'approved'",
        )
        .bind(affiliate_user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(total)
    }

    async fn find_withdrawal_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Withdrawal>, StoreError> {
        // Exact match on purpose: the provider echoes back the reference we
        // generated, so substring matching would only invite collisions.
        let row = sqlx::query_as::<_, WithdrawalRow>(
            "SELECT id, affiliate_user_id, amount, bank_code, account_number, status, \
                    reference_no, provider_transaction_id, created_at \
             FROM withdrawals WHERE reference_no = $1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        row.map(Withdrawal::try_from).transpose()
    }

    async fn update_withdrawal_status(
        &self,
        withdrawal_id: Uuid,
        status: WithdrawalStatus,
        provider_transaction_id: Option<&str>,
    ) -> Result<Withdrawal, StoreError> {
        let row = sqlx::query_as::<_, WithdrawalRow>(
            "UPDATE withdrawals \
             SET status = $2, \
                 provider_transaction_id = COALESCE($3, provider_transaction_id) \
             WHERE id = $1 \
             RETURNING id, affiliate_user_id, amount, bank_code, account_number, status, \
                       reference_no, provider_transaction_id, created_at",
        )
        .bind(withdrawal_id)
        .bind(status.as_str())
        .bind(provider_transaction_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        Withdrawal::try_from(row)
    }
}
