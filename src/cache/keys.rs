//! Type-safe cache key builders.

use crate::config::GatewayMode;
use std::fmt;

pub const VERSION: &str = "v1";

/// Key for the cached SingaPay access token, partitioned by gateway mode so
/// sandbox and production tokens can never be confused.
#[derive(Debug, Clone)]
pub struct AccessTokenKey<'a> {
    pub prefix: &'a str,
    pub mode: GatewayMode,
}

impl<'a> AccessTokenKey<'a> {
    pub fn new(prefix: &'a str, mode: GatewayMode) -> Self {
        Self { prefix, mode }
    }
}

impl fmt::Display for AccessTokenKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:access-token:{}", self.prefix, VERSION, self.mode)
    }
}
