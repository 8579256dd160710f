//! Affiliate commission engine.
//!
//! Runs after a purchase activates, never inside the activation transaction:
//! a commission failure must not roll back a payment the provider considers
//! settled. Every skip path is logged with its reason so support can answer
//! "why did I not get my commission" without reading code.

use crate::config::CommissionConfig;
use crate::error::PaymentResult;
use crate::store::models::{Commission, CommissionStatus, NewCommission, Purchase, PurchaseStatus};
use crate::store::{Store, StoreError};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct CommissionEngine {
    store: Arc<dyn Store>,
    config: CommissionConfig,
}

impl CommissionEngine {
    pub fn new(store: Arc<dyn Store>, config: CommissionConfig) -> Self {
        Self { store, config }
    }

    /// Credit the referrer for a freshly paid purchase, if eligible.
    ///
    /// Eligibility checks run in order and short-circuit: unpaid purchase,
    /// unknown user, no referrer, self-referral, commission already credited,
    /// not the user's first paid purchase. `Ok(None)` means "skipped", which
    /// is a normal outcome, not an error.
    pub async fn process_referral_commission(
        &self,
        purchase: &Purchase,
    ) -> PaymentResult<Option<Commission>> {
        if purchase.status != PurchaseStatus::Paid {
            warn!(
                purchase_id = %purchase.id,
                status = %purchase.status,
                "commission requested for unpaid purchase, skipping"
            );
            return Ok(None);
        }

        let Some(user) = self.store.find_user_access(purchase.user_id).await? else {
            warn!(
                purchase_id = %purchase.id,
                user_id = %purchase.user_id,
                "purchaser has no user record, skipping commission"
            );
            return Ok(None);
        };

        let Some(referrer_id) = user.referrer_id else {
            return Ok(None);
        };
        if referrer_id == purchase.user_id {
            warn!(user_id = %purchase.user_id, "self-referral, skipping commission");
            return Ok(None);
        }

        if self
            .store
            .commission_exists_for_purchase(purchase.id)
            .await?
        {
            return Ok(None);
        }

        // First paid purchase only: renewals do not earn commissions.
        let other_paid = self
            .store
            .count_other_paid_purchases(purchase.user_id, purchase.id)
            .await?;
        if other_paid > 0 {
            return Ok(None);
        }

        let commission_amount = purchase.amount * i64::from(self.config.percent) / 100;
        let commission = NewCommission {
            affiliate_user_id: referrer_id,
            referred_user_id: purchase.user_id,
            purchase_id: purchase.id,
            subscription_amount: purchase.amount,
            commission_percent: self.config.percent,
            commission_amount,
            status: CommissionStatus::Approved,
        };

        match self.store.insert_commission(commission).await {
            Ok(row) => {
                info!(
                    commission_id = %row.id,
                    affiliate_user_id = %referrer_id,
                    amount = row.commission_amount,
                    "referral commission credited"
                );
                Ok(Some(row))
            }
            // A concurrent webhook delivery credited it first.
            Err(StoreError::Conflict(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Sum of approved, not-yet-paid-out commissions.
    pub async fn withdrawable_balance(&self, affiliate_user_id: Uuid) -> PaymentResult<i64> {
        Ok(self
            .store
            .approved_commission_total(affiliate_user_id)
            .await?)
    }

    /// Whether an affiliate may withdraw `amount` right now.
    pub async fn can_withdraw(&self, affiliate_user_id: Uuid, amount: i64) -> PaymentResult<bool> {
        if amount < self.config.min_withdrawal {
            return Ok(false);
        }
        let balance = self.withdrawable_balance(affiliate_user_id).await?;
        Ok(amount <= balance)
    }
}
