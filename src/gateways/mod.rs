//! Payment provider abstraction.
//!
//! Each provider implements [`PaymentGateway`]; the dispatcher picks one from a
//! [`GatewayRegistry`] by the request's method key.

use async_trait::async_trait;
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{config::PaymentsConfig, errors::ServiceError};

pub mod paypal;
pub mod simulated;
pub mod stripe;

pub use paypal::PayPalGateway;
pub use simulated::SimulatedGateway;
pub use stripe::StripeGateway;

pub const STRIPE: &str = "stripe";
pub const PAYPAL: &str = "paypal";

/// Context echoed to the provider and stored with the attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentContext {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub description: String,
}

/// Provider-agnostic charge request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPaymentRequest {
    pub amount: Decimal,
    pub currency: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paypal_data: Option<Value>,
    pub metadata: PaymentContext,
}

impl GatewayPaymentRequest {
    /// Shape checks every provider runs before going to the network.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.amount <= Decimal::ZERO {
            return Err(GatewayError::InvalidRequest(
                "amount must be positive".to_string(),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "currency is required".to_string(),
            ));
        }
        if self.method.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("method is required".to_string()));
        }
        Ok(())
    }
}

/// Reversal of a settled charge. `amount: None` refunds the remainder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRefundRequest {
    pub provider_id: String,
    pub amount: Option<Decimal>,
    pub currency: String,
}

impl GatewayRefundRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.provider_id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "provider id is required".to_string(),
            ));
        }
        if matches!(self.amount, Some(amount) if amount <= Decimal::ZERO) {
            return Err(GatewayError::InvalidRequest(
                "refund amount must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GatewayStatus {
    Succeeded,
    Pending,
    Declined,
}

/// Uniform outcome of a provider call that reached the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub success: bool,
    pub status: GatewayStatus,
    pub provider_id: Option<String>,
    pub transaction_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl GatewayResponse {
    pub fn succeeded(provider_id: impl Into<String>, transaction_id: Option<String>, details: Value) -> Self {
        Self {
            success: true,
            status: GatewayStatus::Succeeded,
            provider_id: Some(provider_id.into()),
            transaction_id,
            error_code: None,
            error_message: None,
            details,
        }
    }

    pub fn pending(provider_id: impl Into<String>, transaction_id: Option<String>, details: Value) -> Self {
        Self {
            success: false,
            status: GatewayStatus::Pending,
            provider_id: Some(provider_id.into()),
            transaction_id,
            error_code: None,
            error_message: None,
            details,
        }
    }

    pub fn declined(
        error_code: Option<String>,
        error_message: Option<String>,
        provider_id: Option<String>,
        details: Value,
    ) -> Self {
        Self {
            success: false,
            status: GatewayStatus::Declined,
            provider_id,
            transaction_id: None,
            error_code,
            error_message,
            details,
        }
    }

    /// Succeeded or queued by the provider.
    pub fn is_accepted(&self) -> bool {
        !matches!(self.status, GatewayStatus::Declined)
    }
}

/// A call that never produced a provider verdict.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("invalid gateway request: {0}")]
    InvalidRequest(String),

    #[error("gateway transport failure: {0}")]
    Transport(String),

    #[error("gateway returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("gateway response could not be read: {0}")]
    MalformedResponse(String),

    #[error("unsupported payment method: {0}")]
    UnsupportedMethod(String),

    #[error("gateway not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::MalformedResponse(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// Capability every payment provider offers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayResponse, GatewayError>;

    async fn refund_payment(
        &self,
        request: &GatewayRefundRequest,
    ) -> Result<GatewayResponse, GatewayError>;
}

/// Gateways keyed by lowercase method name.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<String, Arc<dyn PaymentGateway>>,
}

impl fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<(&String, &'static str)> = self
            .gateways
            .iter()
            .map(|(key, gateway)| (key, gateway.name()))
            .collect();
        entries.sort();
        f.debug_struct("GatewayRegistry")
            .field("gateways", &entries)
            .finish()
    }
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: &str, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(normalize_method(method), gateway);
    }

    pub fn with_gateway(mut self, method: &str, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.register(method, gateway);
        self
    }

    /// Case-insensitive lookup.
    pub fn get(&self, method: &str) -> Option<Arc<dyn PaymentGateway>> {
        self.gateways.get(&normalize_method(method)).cloned()
    }

    pub fn resolve(&self, method: &str) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
        self.get(method)
            .ok_or_else(|| GatewayError::UnsupportedMethod(method.to_string()))
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.gateways.keys().cloned().collect();
        methods.sort();
        methods
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

pub fn normalize_method(method: &str) -> String {
    method.trim().to_ascii_lowercase()
}

/// Builds the registry at the composition root.
///
/// Configured providers get their real adapter. Unconfigured ones fall back to
/// a simulation outside production and are left out in production.
pub fn build_registry(
    config: &PaymentsConfig,
    is_production: bool,
) -> Result<GatewayRegistry, ServiceError> {
    if config.force_simulation && is_production {
        return Err(ServiceError::ConfigError(
            "force_simulation is not allowed in production".to_string(),
        ));
    }

    let mut registry = GatewayRegistry::new();
    let simulate = |name: &'static str, offset: u64| -> Arc<dyn PaymentGateway> {
        Arc::new(SimulatedGateway::new(
            name,
            config.simulation_success_rate,
            config.simulation_seed.map(|seed| seed.wrapping_add(offset)),
        ))
    };

    if config.stripe_configured() && !config.force_simulation {
        let gateway = StripeGateway::from_config(config)?;
        registry.register(STRIPE, Arc::new(gateway));
    } else if !is_production {
        info!("Stripe credentials missing, registering simulated gateway");
        registry.register(STRIPE, simulate(STRIPE, 0));
    } else {
        warn!("Stripe is not configured; card payments are disabled");
    }

    if config.paypal_configured() && !config.force_simulation {
        let gateway = PayPalGateway::from_config(config)?;
        registry.register(PAYPAL, Arc::new(gateway));
    } else if !is_production {
        info!("PayPal credentials missing, registering simulated gateway");
        registry.register(PAYPAL, simulate(PAYPAL, 1));
    } else {
        warn!("PayPal is not configured; wallet payments are disabled");
    }

    Ok(registry)
}

/// Currencies whose smallest unit is the major unit.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

fn currency_exponent(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES
        .iter()
        .any(|c| c.eq_ignore_ascii_case(currency))
    {
        0
    } else {
        2
    }
}

/// Converts a major-unit amount to the provider's integer minor units.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, GatewayError> {
    let exponent = currency_exponent(currency);
    let scaled = (amount * Decimal::from(10_i64.pow(exponent)))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    scaled
        .to_i64()
        .ok_or_else(|| GatewayError::InvalidRequest(format!("amount out of range: {}", amount)))
}

/// Renders a major-unit amount with the currency's number of decimals.
pub fn format_major_units(amount: Decimal, currency: &str) -> String {
    let exponent = currency_exponent(currency);
    let rounded = amount.round_dp_with_strategy(exponent, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.*}", exponent as usize, rounded)
}

fn build_http_client(config: &PaymentsConfig) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(config.gateway_timeout())
        .build()
        .map_err(|e| ServiceError::ConfigError(format!("failed to build gateway HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use serde_json::json;

    // `assert_matches!` formats the scrutinee on failure.
    impl std::fmt::Debug for dyn PaymentGateway {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PaymentGateway")
                .field("name", &self.name())
                .finish()
        }
    }

    fn request(amount: Decimal, currency: &str, method: &str) -> GatewayPaymentRequest {
        GatewayPaymentRequest {
            amount,
            currency: currency.to_string(),
            method: method.to_string(),
            card_data: None,
            paypal_data: None,
            metadata: PaymentContext {
                order_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                description: "test".to_string(),
            },
        }
    }

    #[test]
    fn request_validation_rejects_bad_shapes() {
        assert_matches!(
            request(dec!(0), "EUR", "stripe").validate(),
            Err(GatewayError::InvalidRequest(_))
        );
        assert_matches!(
            request(dec!(10), " ", "stripe").validate(),
            Err(GatewayError::InvalidRequest(_))
        );
        assert_matches!(
            request(dec!(10), "EUR", "").validate(),
            Err(GatewayError::InvalidRequest(_))
        );
        assert!(request(dec!(10), "EUR", "stripe").validate().is_ok());
    }

    #[test]
    fn refund_validation_requires_provider_id() {
        let refund = GatewayRefundRequest {
            provider_id: String::new(),
            amount: None,
            currency: "EUR".into(),
        };
        assert_matches!(refund.validate(), Err(GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let mut mock = MockPaymentGateway::new();
        mock.expect_name().return_const("stripe");
        let registry = GatewayRegistry::new().with_gateway("Stripe", Arc::new(mock));

        assert!(registry.get("STRIPE").is_some());
        assert!(registry.get(" stripe ").is_some());
        assert_matches!(
            registry.resolve("bitcoin"),
            Err(GatewayError::UnsupportedMethod(m)) if m == "bitcoin"
        );
    }

    #[tokio::test]
    async fn registry_dispatches_to_registered_gateway() {
        let mut mock = MockPaymentGateway::new();
        mock.expect_process_payment()
            .times(1)
            .returning(|req| {
                Ok(GatewayResponse::succeeded(
                    "pi_1",
                    Some(format!("tx-{}", req.metadata.order_id)),
                    json!({}),
                ))
            });
        let registry = GatewayRegistry::new().with_gateway("paypal", Arc::new(mock));

        let gateway = registry.resolve("PayPal").unwrap();
        let response = gateway
            .process_payment(&request(dec!(5), "EUR", "paypal"))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.provider_id.as_deref(), Some("pi_1"));
    }

    #[test]
    fn unconfigured_providers_are_simulated_outside_production() {
        let registry = build_registry(&PaymentsConfig::default(), false).unwrap();
        assert_eq!(registry.methods(), vec!["paypal".to_string(), "stripe".to_string()]);
        assert_eq!(registry.get("stripe").unwrap().name(), "simulated");
    }

    #[test]
    fn unconfigured_providers_are_absent_in_production() {
        let registry = build_registry(&PaymentsConfig::default(), true).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn configured_provider_gets_real_adapter() {
        let config = PaymentsConfig {
            stripe_secret_key: Some("sk_test_123".into()),
            ..PaymentsConfig::default()
        };
        let registry = build_registry(&config, true).unwrap();
        assert_eq!(registry.get("stripe").unwrap().name(), STRIPE);
        assert!(registry.get("paypal").is_none());
    }

    #[test]
    fn forced_simulation_is_refused_in_production() {
        let config = PaymentsConfig {
            force_simulation: true,
            ..PaymentsConfig::default()
        };
        assert_matches!(build_registry(&config, true), Err(ServiceError::ConfigError(_)));
    }

    #[test]
    fn minor_units_follow_currency_exponent() {
        assert_eq!(to_minor_units(dec!(12.34), "eur").unwrap(), 1234);
        assert_eq!(to_minor_units(dec!(0.005), "USD").unwrap(), 1);
        assert_eq!(to_minor_units(dec!(500), "JPY").unwrap(), 500);
        assert_eq!(format_major_units(dec!(10), "EUR"), "10.00");
        assert_eq!(format_major_units(dec!(1500), "jpy"), "1500");
    }
}
