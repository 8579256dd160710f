//! SingaPay gateway integration.
//!
//! [`client::GatewayClient`] is the only component that talks to the
//! provider. Everything above it sees the uniform
//! [`client::GatewayResponse`] envelope and the crate error taxonomy, never
//! a raw network error.

pub mod client;
pub mod mock;
pub mod signature;

pub use client::{GatewayClient, GatewayResponse};
