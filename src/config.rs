//! SingaPay configuration
//!
//! Everything the reconciliation core consumes from the environment is loaded
//! once into a strongly-typed struct. Numeric values are parsed leniently
//! (`"24"`, `24` and `" 24 "` are the same hour count) so a sloppy deployment
//! cannot silently produce an invalid expiry duration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Deployment mode of the gateway integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayMode {
    /// All provider calls are simulated locally. No network, no signatures.
    Mock,
    Sandbox,
    Production,
}

impl GatewayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayMode::Mock => "mock",
            GatewayMode::Sandbox => "sandbox",
            GatewayMode::Production => "production",
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, GatewayMode::Mock)
    }
}

impl std::fmt::Display for GatewayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GatewayMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "mock" => Ok(GatewayMode::Mock),
            "sandbox" => Ok(GatewayMode::Sandbox),
            "production" => Ok(GatewayMode::Production),
            _ => Err(ConfigError::InvalidValue(format!(
                "SINGAPAY_MODE must be mock, sandbox or production, got {}",
                value
            ))),
        }
    }
}

/// Top-level configuration for the reconciliation core.
#[derive(Debug, Clone)]
pub struct SingaPayConfig {
    pub mode: GatewayMode,
    pub credentials: GatewayCredentials,
    pub endpoints: GatewayEndpoints,
    pub http: HttpConfig,
    pub virtual_account: VirtualAccountConfig,
    pub qris: QrisConfig,
    pub mock: MockConfig,
    pub token_cache: TokenCacheConfig,
    pub commission: CommissionConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayCredentials {
    pub partner_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub merchant_account_id: String,
}

#[derive(Debug, Clone)]
pub struct GatewayEndpoints {
    pub base_url: String,
    pub token_path: String,
    pub virtual_account_path: String,
    pub qris_generate_path: String,
    pub qris_status_path: String,
    pub disbursement_transfer_path: String,
    pub payment_link_path: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct VirtualAccountConfig {
    /// Amounts in whole rupiah.
    pub min_amount: i64,
    pub max_amount: i64,
    pub expiry_hours: i64,
}

#[derive(Debug, Clone)]
pub struct QrisConfig {
    pub expiry_hours: i64,
}

/// Behavior of the simulated provider when running in mock mode.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// How long a mock instrument stays pending before it resolves.
    pub auto_approve_delay_secs: i64,
    /// Percentage of mock instruments that resolve to paid (0..=100).
    pub success_rate_percent: u8,
    /// Simulated network latency per mock call.
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TokenCacheConfig {
    pub prefix: String,
    /// Shorter than the provider's 60-minute token expiry on purpose.
    pub ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CommissionConfig {
    /// Fixed affiliate percentage applied to the subscription amount.
    pub percent: u32,
    /// Minimum approved balance before a withdrawal is allowed, in rupiah.
    pub min_withdrawal: i64,
}

impl SingaPayConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv().ok();

        let mode: GatewayMode = env::var("SINGAPAY_MODE")
            .unwrap_or_else(|_| "mock".to_string())
            .parse()?;

        let config = SingaPayConfig {
            mode,
            credentials: GatewayCredentials {
                partner_id: optional_in_mock(mode, "SINGAPAY_PARTNER_ID")?,
                client_id: optional_in_mock(mode, "SINGAPAY_CLIENT_ID")?,
                client_secret: optional_in_mock(mode, "SINGAPAY_CLIENT_SECRET")?,
                merchant_account_id: optional_in_mock(mode, "SINGAPAY_MERCHANT_ACCOUNT_ID")?,
            },
            endpoints: GatewayEndpoints {
                base_url: env::var("SINGAPAY_BASE_URL")
                    .unwrap_or_else(|_| "https://api.sandbox.singapay.co.id".to_string()),
                token_path: "/api/v1.0/access-token/b2b".to_string(),
                virtual_account_path: "/api/v1.0/transfer-va/create-va".to_string(),
                qris_generate_path: "/api/v1.0/qr/qr-mpm-generate".to_string(),
                qris_status_path: "/api/v1.0/qr/qr-mpm-query".to_string(),
                disbursement_transfer_path: "/api/v1.0/disbursement/transfer".to_string(),
                payment_link_path: "/api/v1.0/payment-link/create".to_string(),
            },
            http: HttpConfig {
                timeout_secs: int_env("SINGAPAY_HTTP_TIMEOUT_SECS", 30)?,
            },
            virtual_account: VirtualAccountConfig {
                min_amount: int_env("SINGAPAY_VA_MIN_AMOUNT", 10_000)?,
                max_amount: int_env("SINGAPAY_VA_MAX_AMOUNT", 50_000_000)?,
                expiry_hours: int_env("SINGAPAY_VA_EXPIRY_HOURS", 24)?,
            },
            qris: QrisConfig {
                expiry_hours: int_env("SINGAPAY_QRIS_EXPIRY_HOURS", 1)?,
            },
            mock: MockConfig {
                auto_approve_delay_secs: int_env("SINGAPAY_MOCK_APPROVE_DELAY_SECS", 30)?,
                success_rate_percent: int_env("SINGAPAY_MOCK_SUCCESS_RATE", 90u8)?,
                latency_ms: int_env("SINGAPAY_MOCK_LATENCY_MS", 150)?,
            },
            token_cache: TokenCacheConfig {
                prefix: env::var("SINGAPAY_CACHE_PREFIX").unwrap_or_else(|_| "singapay".to_string()),
                ttl_secs: int_env("SINGAPAY_TOKEN_CACHE_TTL_SECS", 50 * 60)?,
            },
            commission: CommissionConfig {
                percent: int_env("AFFILIATE_COMMISSION_PERCENT", 17)?,
                min_withdrawal: int_env("AFFILIATE_MIN_WITHDRAWAL", 100_000)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.virtual_account.min_amount <= 0
            || self.virtual_account.max_amount < self.virtual_account.min_amount
        {
            return Err(ConfigError::InvalidValue(
                "SINGAPAY_VA_MIN_AMOUNT must be positive and <= SINGAPAY_VA_MAX_AMOUNT".to_string(),
            ));
        }
        if self.virtual_account.expiry_hours <= 0 || self.qris.expiry_hours <= 0 {
            return Err(ConfigError::InvalidValue(
                "instrument expiry hours must be positive".to_string(),
            ));
        }
        if self.mock.success_rate_percent > 100 {
            return Err(ConfigError::InvalidValue(
                "SINGAPAY_MOCK_SUCCESS_RATE must be within 0..=100".to_string(),
            ));
        }
        if self.commission.percent > 100 {
            return Err(ConfigError::InvalidValue(
                "AFFILIATE_COMMISSION_PERCENT must be within 0..=100".to_string(),
            ));
        }
        if !self.mode.is_mock() {
            if self.credentials.client_id.is_empty() || self.credentials.client_secret.is_empty() {
                return Err(ConfigError::MissingVariable(
                    "SINGAPAY_CLIENT_ID / SINGAPAY_CLIENT_SECRET".to_string(),
                ));
            }
            if !self.endpoints.base_url.starts_with("https://")
                && !self.endpoints.base_url.starts_with("http://")
            {
                return Err(ConfigError::InvalidValue(
                    "SINGAPAY_BASE_URL must be a valid URL".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }
}

impl Default for SingaPayConfig {
    /// Mock-mode defaults, used by tests and local development.
    fn default() -> Self {
        SingaPayConfig {
            mode: GatewayMode::Mock,
            credentials: GatewayCredentials {
                partner_id: "partner-test".to_string(),
                client_id: "client-test".to_string(),
                client_secret: "secret-test".to_string(),
                merchant_account_id: "merchant-test".to_string(),
            },
            endpoints: GatewayEndpoints {
                base_url: "https://api.sandbox.singapay.co.id".to_string(),
                token_path: "/api/v1.0/access-token/b2b".to_string(),
                virtual_account_path: "/api/v1.0/transfer-va/create-va".to_string(),
                qris_generate_path: "/api/v1.0/qr/qr-mpm-generate".to_string(),
                qris_status_path: "/api/v1.0/qr/qr-mpm-query".to_string(),
                disbursement_transfer_path: "/api/v1.0/disbursement/transfer".to_string(),
                payment_link_path: "/api/v1.0/payment-link/create".to_string(),
            },
            http: HttpConfig { timeout_secs: 30 },
            virtual_account: VirtualAccountConfig {
                min_amount: 10_000,
                max_amount: 50_000_000,
                expiry_hours: 24,
            },
            qris: QrisConfig { expiry_hours: 1 },
            mock: MockConfig {
                auto_approve_delay_secs: 30,
                success_rate_percent: 90,
                latency_ms: 0,
            },
            token_cache: TokenCacheConfig {
                prefix: "singapay".to_string(),
                ttl_secs: 50 * 60,
            },
            commission: CommissionConfig {
                percent: 17,
                min_withdrawal: 100_000,
            },
        }
    }
}

/// Parse an integer environment variable, tolerating surrounding whitespace
/// and accidental quoting. `"24"`, `'24'` and `24` all yield 24.
fn int_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Copy,
{
    match env::var(name) {
        Ok(raw) => parse_int_lenient(&raw)
            .ok_or_else(|| ConfigError::InvalidValue(format!("{} is not a number: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

pub(crate) fn parse_int_lenient<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .parse()
        .ok()
}

fn optional_in_mock(mode: GatewayMode, name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) => Ok(value),
        Err(_) if mode.is_mock() => Ok(String::new()),
        Err(_) => Err(ConfigError::MissingVariable(name.to_string())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),
}
