//! Payment reconciliation core for the BizPlan SaaS.
//!
//! This crate owns the hard part of the billing flow: creating a purchase,
//! generating a SingaPay payment instrument (virtual account or QRIS),
//! reconciling provider webhooks, atomically activating the purchase and
//! granting user access, and cascading affiliate commissions. HTTP routing,
//! request validation and the UI live elsewhere and talk to this crate
//! through the service types in [`services`].

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod instruments;
pub mod logging;
pub mod services;
pub mod store;
