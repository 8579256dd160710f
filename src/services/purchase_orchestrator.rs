//! Purchase orchestrator: the outbound half of the payment flow.

use crate::error::{PaymentError, PaymentResult};
use crate::gateway::GatewayClient;
use crate::instruments::{
    InstrumentGenerator, InstrumentParams, InstrumentStatus, QrisGenerator,
    VirtualAccountGenerator,
};
use crate::store::models::{
    NewPurchase, PaymentMethod, PaymentTransaction, Purchase, PurchaseStatus,
};
use crate::store::{Store, StoreError};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What a caller provides to start a subscription purchase.
#[derive(Debug, Clone)]
pub struct CreatePurchaseRequest {
    pub user_id: Uuid,
    pub package_id: Uuid,
    pub payment_method: PaymentMethod,
    pub bank_code: Option<String>,
}

/// A pending purchase together with the instrument the user pays against.
#[derive(Debug, Clone)]
pub struct CreatedPurchase {
    pub purchase: Purchase,
    pub transaction: PaymentTransaction,
}

pub struct PurchaseOrchestrator {
    store: Arc<dyn Store>,
    virtual_account: VirtualAccountGenerator,
    qris: QrisGenerator,
}

impl PurchaseOrchestrator {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<GatewayClient>) -> Self {
        Self {
            store,
            virtual_account: VirtualAccountGenerator::new(gateway.clone()),
            qris: QrisGenerator::new(gateway),
        }
    }

    fn generator_for(&self, method: PaymentMethod) -> &dyn InstrumentGenerator {
        match method {
            PaymentMethod::VirtualAccount => &self.virtual_account,
            PaymentMethod::Qris => &self.qris,
        }
    }

    /// Create a pending purchase and its payment instrument.
    ///
    /// The instrument is generated before anything is persisted; purchase and
    /// instrument then land in one store transaction, so a gateway failure
    /// leaves no half-created purchase behind.
    pub async fn create_purchase(
        &self,
        request: CreatePurchaseRequest,
    ) -> PaymentResult<CreatedPurchase> {
        let package = self
            .store
            .find_package(request.package_id)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| PaymentError::NotFound {
                entity: "package",
                reference: request.package_id.to_string(),
            })?;

        if let Some(blocking) = self.store.find_blocking_purchase(request.user_id).await? {
            return Err(PaymentError::AlreadySubscribed {
                transaction_code: blocking.transaction_code,
                expires_at: blocking.expires_at,
            });
        }

        let transaction_code = new_transaction_code();
        let draft = NewPurchase {
            user_id: request.user_id,
            package_id: package.id,
            transaction_code: transaction_code.clone(),
            package_type: package.package_type.clone(),
            amount: package.price,
            payment_method: request.payment_method,
        };
        let params = InstrumentParams {
            bank_code: request.bank_code,
        };

        let instrument = self
            .generator_for(request.payment_method)
            .generate(&draft, &params)
            .await?;

        match self
            .store
            .insert_purchase_with_instrument(draft, instrument)
            .await
        {
            Ok((purchase, transaction)) => {
                info!(
                    transaction_code = %purchase.transaction_code,
                    user_id = %purchase.user_id,
                    amount = purchase.amount,
                    method = %purchase.payment_method,
                    "purchase created"
                );
                Ok(CreatedPurchase {
                    purchase,
                    transaction,
                })
            }
            // Lost the race against a concurrent purchase by the same user.
            Err(StoreError::Conflict(_)) => {
                warn!(user_id = %request.user_id, "concurrent duplicate purchase rejected");
                let blocking = self.store.find_blocking_purchase(request.user_id).await?;
                Err(match blocking {
                    Some(existing) => PaymentError::AlreadySubscribed {
                        transaction_code: existing.transaction_code,
                        expires_at: existing.expires_at,
                    },
                    None => PaymentError::AlreadySubscribed {
                        transaction_code,
                        expires_at: None,
                    },
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Read-only status check by transaction code or provider reference.
    ///
    /// Activation never happens here: even when the provider (or the mock)
    /// reports paid, this method only reports it. The webhook path owns all
    /// state transitions.
    pub async fn check_payment_status(&self, reference: &str) -> PaymentResult<InstrumentStatus> {
        let transaction = self
            .store
            .find_transaction_by_reference(reference)
            .await?
            .ok_or_else(|| PaymentError::NotFound {
                entity: "payment transaction",
                reference: reference.to_string(),
            })?;

        // Terminal local state wins over whatever the provider would say.
        match transaction.status {
            PurchaseStatus::Paid => return Ok(InstrumentStatus::Paid),
            PurchaseStatus::Expired => return Ok(InstrumentStatus::Expired),
            PurchaseStatus::Failed => return Ok(InstrumentStatus::Failed),
            PurchaseStatus::Pending => {}
        }

        self.generator_for(transaction.payment_method)
            .check_status(&transaction)
            .await
    }

    /// User-initiated abandonment of a still-pending purchase.
    pub async fn cancel_purchase(
        &self,
        user_id: Uuid,
        transaction_code: &str,
    ) -> PaymentResult<Purchase> {
        match self
            .store
            .cancel_pending_purchase(user_id, transaction_code)
            .await
        {
            Ok(purchase) => {
                info!(transaction_code, "purchase cancelled by user");
                Ok(purchase)
            }
            Err(StoreError::NotFound(_)) => Err(PaymentError::NotFound {
                entity: "purchase",
                reference: transaction_code.to_string(),
            }),
            Err(StoreError::Conflict(message)) => Err(PaymentError::validation(message)),
            Err(err) => Err(err.into()),
        }
    }
}

/// `BP-YYYYMMDD-xxxxxxxx`, unique per purchase and safe to show to users.
fn new_transaction_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("BP-{}-{}", date, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::SingaPayConfig;
    use crate::store::models::{Package, UserAccess};
    use crate::store::MemoryStore;

    fn orchestrator(store: Arc<MemoryStore>) -> PurchaseOrchestrator {
        let gateway = GatewayClient::new(
            Arc::new(SingaPayConfig::default()),
            Arc::new(MemoryCache::new()),
        )
        .expect("client init should succeed");
        PurchaseOrchestrator::new(store, Arc::new(gateway))
    }

    fn seed_package(store: &MemoryStore, price: i64, active: bool) -> Package {
        let package = Package {
            id: Uuid::new_v4(),
            name: "Premium Monthly".to_string(),
            package_type: "premium".to_string(),
            price,
            duration_days: 30,
            active,
        };
        store.insert_package(package.clone());
        package
    }

    fn seed_user(store: &MemoryStore) -> Uuid {
        let user_id = Uuid::new_v4();
        store.upsert_user_access(UserAccess {
            user_id,
            referrer_id: None,
            pdf_access_active: false,
            access_expires_at: None,
            active_package_id: None,
        });
        user_id
    }

    #[tokio::test]
    async fn creates_pending_purchase_with_va_instrument() {
        let store = Arc::new(MemoryStore::new());
        let package = seed_package(&store, 150_000, true);
        let user_id = seed_user(&store);

        let created = orchestrator(store.clone())
            .create_purchase(CreatePurchaseRequest {
                user_id,
                package_id: package.id,
                payment_method: PaymentMethod::VirtualAccount,
                bank_code: None,
            })
            .await
            .unwrap();

        assert_eq!(created.purchase.status, PurchaseStatus::Pending);
        assert_eq!(created.purchase.amount, 150_000);
        assert!(created.purchase.transaction_code.starts_with("BP-"));
        assert!(created.transaction.va_number.is_some());
        assert_eq!(created.transaction.purchase_id, created.purchase.id);
    }

    #[tokio::test]
    async fn inactive_package_is_not_purchasable() {
        let store = Arc::new(MemoryStore::new());
        let package = seed_package(&store, 150_000, false);
        let user_id = seed_user(&store);

        let err = orchestrator(store.clone())
            .create_purchase(CreatePurchaseRequest {
                user_id,
                package_id: package.id,
                payment_method: PaymentMethod::VirtualAccount,
                bank_code: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NotFound { entity: "package", .. }));
    }

    #[tokio::test]
    async fn second_purchase_is_blocked_while_first_is_pending() {
        let store = Arc::new(MemoryStore::new());
        let package = seed_package(&store, 150_000, true);
        let user_id = seed_user(&store);
        let orchestrator = orchestrator(store.clone());

        let request = CreatePurchaseRequest {
            user_id,
            package_id: package.id,
            payment_method: PaymentMethod::VirtualAccount,
            bank_code: None,
        };
        let first = orchestrator.create_purchase(request.clone()).await.unwrap();

        let err = orchestrator.create_purchase(request).await.unwrap_err();
        match err {
            PaymentError::AlreadySubscribed {
                transaction_code, ..
            } => assert_eq!(transaction_code, first.purchase.transaction_code),
            other => panic!("expected AlreadySubscribed, got {:?}", other),
        }
        assert_eq!(store.purchase_count(), 1);
    }

    #[tokio::test]
    async fn gateway_rejection_leaves_no_purchase_row() {
        let store = Arc::new(MemoryStore::new());
        // Price below the VA minimum makes the generator reject before the
        // store is touched.
        let package = seed_package(&store, 5_000, true);
        let user_id = seed_user(&store);

        let err = orchestrator(store.clone())
            .create_purchase(CreatePurchaseRequest {
                user_id,
                package_id: package.id,
                payment_method: PaymentMethod::VirtualAccount,
                bank_code: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Validation { .. }));
        assert_eq!(store.purchase_count(), 0);
    }

    #[tokio::test]
    async fn status_check_reports_without_activating() {
        let store = Arc::new(MemoryStore::new());
        let package = seed_package(&store, 150_000, true);
        let user_id = seed_user(&store);
        let orchestrator = orchestrator(store.clone());

        let created = orchestrator
            .create_purchase(CreatePurchaseRequest {
                user_id,
                package_id: package.id,
                payment_method: PaymentMethod::VirtualAccount,
                bank_code: None,
            })
            .await
            .unwrap();

        // Rewind creation past the mock approve delay so the draw resolves.
        store.set_transaction_created_at(
            created.transaction.id,
            Utc::now() - chrono::Duration::hours(1),
        );

        let status = orchestrator
            .check_payment_status(&created.transaction.reference_no)
            .await
            .unwrap();
        assert!(matches!(
            status,
            InstrumentStatus::Paid | InstrumentStatus::Failed
        ));

        // Reporting paid is not the same as being paid: only the webhook
        // path activates.
        let purchase = store.get_purchase(created.purchase.id).unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Pending);
        let user = store.get_user_access(user_id).unwrap();
        assert!(!user.pdf_access_active);
    }

    #[tokio::test]
    async fn cancel_flips_pending_purchase_to_failed() {
        let store = Arc::new(MemoryStore::new());
        let package = seed_package(&store, 150_000, true);
        let user_id = seed_user(&store);
        let orchestrator = orchestrator(store.clone());

        let created = orchestrator
            .create_purchase(CreatePurchaseRequest {
                user_id,
                package_id: package.id,
                payment_method: PaymentMethod::Qris,
                bank_code: None,
            })
            .await
            .unwrap();

        let cancelled = orchestrator
            .cancel_purchase(user_id, &created.purchase.transaction_code)
            .await
            .unwrap();
        assert_eq!(cancelled.status, PurchaseStatus::Failed);

        // Cancelling again is a validation error, not a crash.
        let err = orchestrator
            .cancel_purchase(user_id, &created.purchase.transaction_code)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Validation { .. }));
    }
}
