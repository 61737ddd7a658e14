use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const ENV_PREFIX: &str = "APP";
const DEFAULT_ORDER_EXPIRY_MINUTES: i64 = 15;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_PAYPAL_API_BASE: &str = "https://api-m.sandbox.paypal.com";

/// Payment provider credentials and simulation knobs.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentsConfig {
    #[serde(default)]
    pub stripe_secret_key: Option<String>,

    #[serde(default = "default_stripe_api_base")]
    #[validate(url)]
    pub stripe_api_base: String,

    #[serde(default)]
    pub paypal_client_id: Option<String>,

    #[serde(default)]
    pub paypal_client_secret: Option<String>,

    #[serde(default = "default_paypal_api_base")]
    #[validate(url)]
    pub paypal_api_base: String,

    /// Per-request timeout for provider calls
    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub gateway_timeout_secs: u64,

    /// Probability that a simulated charge succeeds
    #[serde(default = "default_simulation_success_rate")]
    #[validate(custom = "validate_probability")]
    pub simulation_success_rate: f64,

    /// Fixed seed for simulated gateways; random when unset
    #[serde(default)]
    pub simulation_seed: Option<u64>,

    /// Register simulated gateways even when credentials are present
    #[serde(default)]
    pub force_simulation: bool,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            stripe_secret_key: None,
            stripe_api_base: default_stripe_api_base(),
            paypal_client_id: None,
            paypal_client_secret: None,
            paypal_api_base: default_paypal_api_base(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            simulation_success_rate: default_simulation_success_rate(),
            simulation_seed: None,
            force_simulation: false,
        }
    }
}

impl PaymentsConfig {
    pub fn stripe_configured(&self) -> bool {
        self.stripe_secret_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn paypal_configured(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().map(|s| !s.trim().is_empty());
        present(&self.paypal_client_id).unwrap_or(false)
            && present(&self.paypal_client_secret).unwrap_or(false)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// HS256 secret used to verify bearer tokens
    #[validate(custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    /// JWT issuer name
    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,

    /// JWT audience
    #[serde(default = "default_auth_audience")]
    pub auth_audience: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Capacity of the in-process domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// How long a fresh order stays payable
    #[serde(default = "default_order_expiry_minutes")]
    #[validate(range(min = 1, max = 1440))]
    pub order_expiry_minutes: i64,

    #[serde(default = "default_true_bool")]
    pub expiry_sweep_enabled: bool,

    #[serde(default = "default_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub expiry_sweep_interval_secs: u64,

    #[serde(default)]
    #[validate]
    pub payments: PaymentsConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials.
    pub fn new(database_url: String, jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            jwt_secret,
            auth_issuer: default_auth_issuer(),
            auth_audience: default_auth_audience(),
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            order_expiry_minutes: default_order_expiry_minutes(),
            expiry_sweep_enabled: true,
            expiry_sweep_interval_secs: default_sweep_interval_secs(),
            payments: PaymentsConfig::default(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn order_expiry(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.order_expiry_minutes)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    /// Returns the configured CORS origins, ignoring blanks.
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.is_production() && self.payments.force_simulation {
            let mut err = ValidationError::new("force_simulation_in_production");
            err.message = Some("Simulated payment gateways cannot be forced in production".into());
            errors.add("payments", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_pool_bounds");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_auth_issuer() -> String {
    "storefront-api".to_string()
}
fn default_auth_audience() -> String {
    "storefront".to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    10
}
fn default_db_acquire_timeout_secs() -> u64 {
    10
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_order_expiry_minutes() -> i64 {
    DEFAULT_ORDER_EXPIRY_MINUTES
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_true_bool() -> bool {
    true
}
fn default_stripe_api_base() -> String {
    DEFAULT_STRIPE_API_BASE.to_string()
}
fn default_paypal_api_base() -> String {
    DEFAULT_PAYPAL_API_BASE.to_string()
}
fn default_gateway_timeout_secs() -> u64 {
    15
}
fn default_simulation_success_rate() -> f64 {
    0.95
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    if trimmed.len() < 32 {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret must be at least 32 characters".into());
        return Err(err);
    }

    if let Some(first) = trimmed.chars().next() {
        if trimmed.chars().all(|c| c == first) {
            let mut err = ValidationError::new("jwt_secret");
            err.message = Some("JWT secret cannot be a repeated character sequence".into());
            return Err(err);
        }
    }

    let lower = trimmed.to_ascii_lowercase();
    if ["changeme", "your-secret-key", "default-secret-key"]
        .iter()
        .any(|pattern| lower.contains(pattern))
    {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret must be overridden with a secure random value".into());
        return Err(err);
    }

    Ok(())
}

fn validate_probability(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
        let mut err = ValidationError::new("simulation_success_rate");
        err.message = Some("simulation_success_rate must be between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    load_config_from(Path::new(CONFIG_DIR), &run_env, ENV_PREFIX)
}

/// Layered load from an explicit directory and environment prefix.
pub fn load_config_from(
    config_dir: &Path,
    run_env: &str,
    env_prefix: &str,
) -> Result<AppConfig, AppConfigError> {
    let default_file = config_dir.join("default");
    let env_file = config_dir.join(run_env);

    // jwt_secret has no default; it must come from a file or the environment.
    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&default_file.to_string_lossy()).required(false))
        .add_source(File::with_name(&env_file.to_string_lossy()).required(false))
        .add_source(Environment::with_prefix(env_prefix).separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set {}__JWT_SECRET.", env_prefix);
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs;
    use tempfile::TempDir;

    const SECRET: &str = "k3y-for-unit-tests-0123456789-abcdefghij";
    // No test sets variables with this prefix.
    const TEST_PREFIX: &str = "STOREFRONT_CONFIG_TEST";

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn loads_files_and_applies_defaults() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "default.toml",
            &format!(
                r#"
                database_url = "postgres://localhost/shop"
                jwt_secret = "{SECRET}"
                order_expiry_minutes = 30

                [payments]
                stripe_secret_key = "sk_test_123"
                "#
            ),
        );
        write(&dir, "staging.toml", "port = 9090\n");

        let cfg = load_config_from(dir.path(), "staging", TEST_PREFIX).unwrap();

        assert_eq!(cfg.database_url, "postgres://localhost/shop");
        assert_eq!(cfg.environment, "staging");
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.order_expiry_minutes, 30);
        assert_eq!(cfg.expiry_sweep_interval_secs, 60);
        assert!(cfg.payments.stripe_configured());
        assert!(!cfg.payments.paypal_configured());
        assert_eq!(cfg.payments.stripe_api_base, "https://api.stripe.com");
    }

    #[test]
    fn missing_jwt_secret_is_a_load_error() {
        let dir = TempDir::new().unwrap();
        let result = load_config_from(dir.path(), "development", TEST_PREFIX);
        assert_matches!(result, Err(AppConfigError::Load(_)));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "default.toml",
            &format!(
                r#"
                jwt_secret = "{SECRET}"
                order_expiry_minutes = 0
                log_level = "loud"
                "#
            ),
        );

        let result = load_config_from(dir.path(), "development", TEST_PREFIX);
        let Err(AppConfigError::Validation(errors)) = result else {
            panic!("expected validation failure");
        };
        let fields = errors.field_errors();
        assert!(fields.contains_key("order_expiry_minutes"));
        assert!(fields.contains_key("log_level"));
    }

    #[test]
    fn production_refuses_forced_simulation() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), SECRET.into(), "production".into());
        cfg.payments.force_simulation = true;
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.environment = "development".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn short_or_placeholder_secrets_are_rejected() {
        assert!(validate_jwt_secret("short").is_err());
        assert!(validate_jwt_secret(&"a".repeat(40)).is_err());
        assert!(validate_jwt_secret("changeme-changeme-changeme-changeme").is_err());
        assert!(validate_jwt_secret(SECRET).is_ok());
    }

    #[test]
    fn cors_origins_skip_blanks() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), SECRET.into(), "production".into());
        cfg.cors_allowed_origins = Some("https://a.example, ,https://b.example".into());
        assert_eq!(
            cfg.cors_origins(),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }
}
