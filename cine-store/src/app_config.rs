use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub business_rules: BusinessRules,
    pub gateways: GatewaysConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BusinessRules {
    #[serde(default = "default_max_seats")]
    pub max_seats_per_booking: usize,
    #[serde(default = "default_seat_lock_ttl")]
    pub seat_lock_ttl_seconds: u64,
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout_minutes: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_loyalty_unit")]
    pub loyalty_unit_amount: f64,
    #[serde(default = "default_points_per_unit")]
    pub loyalty_points_per_unit: i64,
    #[serde(default = "default_lock_sweep")]
    pub lock_sweep_interval_seconds: u64,
    #[serde(default = "default_payment_sweep")]
    pub payment_sweep_interval_seconds: u64,
    #[serde(default = "default_webhook_lock_ttl")]
    pub webhook_lock_ttl_ms: u64,
}

fn default_max_seats() -> usize { 8 }
fn default_seat_lock_ttl() -> u64 { 600 }
fn default_payment_timeout() -> i64 { 15 }
fn default_currency() -> String { "VND".into() }
fn default_loyalty_unit() -> f64 { 10_000.0 }
fn default_points_per_unit() -> i64 { 1 }
fn default_lock_sweep() -> u64 { 30 }
fn default_payment_sweep() -> u64 { 60 }
fn default_webhook_lock_ttl() -> u64 { 5_000 }

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            max_seats_per_booking: default_max_seats(),
            seat_lock_ttl_seconds: default_seat_lock_ttl(),
            payment_timeout_minutes: default_payment_timeout(),
            currency: default_currency(),
            loyalty_unit_amount: default_loyalty_unit(),
            loyalty_points_per_unit: default_points_per_unit(),
            lock_sweep_interval_seconds: default_lock_sweep(),
            payment_sweep_interval_seconds: default_payment_sweep(),
            webhook_lock_ttl_ms: default_webhook_lock_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_window: i64,
    pub window_seconds: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { enabled: false, requests_per_window: 120, window_seconds: 60 }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewaysConfig {
    pub momo: MomoConfig,
    pub vnpay: VnpayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MomoConfig {
    pub partner_code: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub redirect_url: String,
    pub ipn_url: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_exchange_rate")]
    pub exchange_rate: f64,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VnpayConfig {
    pub tmn_code: String,
    pub hash_secret: String,
    pub payment_url: String,
    pub api_url: String,
    pub return_url: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_exchange_rate")]
    pub exchange_rate: f64,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_seconds: u64,
}

fn default_exchange_rate() -> f64 { 1.0 }
fn default_gateway_timeout() -> u64 { 10 }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg. `CINE__DATABASE__URL=...`
            .add_source(config::Environment::with_prefix("CINE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_rule_defaults() {
        let rules: BusinessRules = serde_json::from_str("{}").unwrap();
        assert_eq!(rules, BusinessRules::default());
        assert_eq!(rules.max_seats_per_booking, 8);
        assert_eq!(rules.payment_timeout_minutes, 15);
        assert_eq!(rules.currency, "VND");
    }
}
