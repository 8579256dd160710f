//! Business services on top of the store and gateway layers.
//!
//! [`PurchaseOrchestrator`] owns the outbound flow (create, status, cancel),
//! [`WebhookProcessor`] owns the inbound one (reconciliation), and
//! [`CommissionEngine`] hangs off the paid transition.

pub mod commission;
pub mod purchase_orchestrator;
pub mod webhook_processor;

pub use commission::CommissionEngine;
pub use purchase_orchestrator::{CreatePurchaseRequest, CreatedPurchase, PurchaseOrchestrator};
pub use webhook_processor::{WebhookAck, WebhookProcessor};
