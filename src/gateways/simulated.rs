use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    GatewayError, GatewayPaymentRequest, GatewayRefundRequest, GatewayResponse, PaymentGateway,
};

/// Card tokens and wallet orders that always decline.
pub const DECLINE_TOKENS: &[&str] = &["tok_chargeDeclined", "pm_card_chargeDeclined", "sim_decline"];

/// Token that makes the call fail as if the provider were unreachable.
pub const FAILURE_TOKEN: &str = "sim_unreachable";

/// Stand-in for a provider without credentials.
///
/// Outcomes are drawn from a seeded RNG so a fixed seed replays the same
/// sequence. Magic tokens force a decline or a transport failure.
#[derive(Debug)]
pub struct SimulatedGateway {
    provider: &'static str,
    success_rate: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedGateway {
    pub fn new(provider: &'static str, success_rate: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            provider,
            success_rate: success_rate.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    fn token(request: &GatewayPaymentRequest) -> Option<&str> {
        fn lookup<'a>(data: Option<&'a Value>, keys: &[&str]) -> Option<&'a str> {
            let data = data?;
            keys.iter().find_map(|key| data.get(*key).and_then(Value::as_str))
        }

        lookup(
            request.card_data.as_ref(),
            &["paymentMethod", "payment_method", "token"],
        )
        .or_else(|| lookup(request.paypal_data.as_ref(), &["orderId", "order_id"]))
    }

    fn roll(&self) -> bool {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_bool(self.success_rate)
    }

    fn reference(&self, prefix: &str) -> String {
        format!("sim_{}_{}_{}", self.provider, prefix, Uuid::new_v4().simple())
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    fn name(&self) -> &'static str {
        "simulated"
    }

    #[instrument(skip(self, request), fields(provider = self.provider, order_id = %request.metadata.order_id))]
    async fn process_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        request.validate()?;

        let token = Self::token(request);
        if token == Some(FAILURE_TOKEN) {
            return Err(GatewayError::Transport(
                "simulated provider unreachable".to_string(),
            ));
        }

        let details = json!({ "provider": self.provider, "simulated": true });
        if token.map(|t| DECLINE_TOKENS.contains(&t)).unwrap_or(false) || !self.roll() {
            info!("Simulated payment declined");
            return Ok(GatewayResponse::declined(
                Some("card_declined".to_string()),
                Some("Simulated decline".to_string()),
                Some(self.reference("pay")),
                details,
            ));
        }

        info!("Simulated payment succeeded");
        Ok(GatewayResponse::succeeded(
            self.reference("pay"),
            Some(self.reference("tx")),
            details,
        ))
    }

    #[instrument(skip(self, request), fields(provider = self.provider, provider_id = %request.provider_id))]
    async fn refund_payment(
        &self,
        request: &GatewayRefundRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        request.validate()?;
        Ok(GatewayResponse::succeeded(
            self.reference("re"),
            None,
            json!({ "provider": self.provider, "simulated": true, "refundedFrom": request.provider_id }),
        ))
    }
}
