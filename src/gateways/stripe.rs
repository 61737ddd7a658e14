use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::{
    build_http_client, to_minor_units, GatewayError, GatewayPaymentRequest, GatewayRefundRequest,
    GatewayResponse, PaymentGateway, STRIPE,
};
use crate::{config::PaymentsConfig, errors::ServiceError};

/// Card payments through Stripe PaymentIntents.
///
/// `card_data.paymentMethod` (or `payment_method`) carries the tokenized card.
#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: Client,
    api_base: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    latest_charge: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
    #[serde(default)]
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeError,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    payment_intent: Option<Value>,
}

impl StripeGateway {
    pub fn new(client: Client, api_base: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        }
    }

    pub fn from_config(config: &PaymentsConfig) -> Result<Self, ServiceError> {
        let secret_key = config
            .stripe_secret_key
            .clone()
            .ok_or_else(|| ServiceError::ConfigError("stripe_secret_key is not set".to_string()))?;
        Ok(Self::new(
            build_http_client(config)?,
            config.stripe_api_base.clone(),
            secret_key,
        ))
    }

    fn payment_method(request: &GatewayPaymentRequest) -> Result<String, GatewayError> {
        request
            .card_data
            .as_ref()
            .and_then(|card| card.get("paymentMethod").or_else(|| card.get("payment_method")))
            .and_then(Value::as_str)
            .filter(|pm| !pm.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::InvalidRequest("cardData.paymentMethod is required".to_string())
            })
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> Result<(StatusCode, String), GatewayError> {
        let response = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    /// Card errors are declines; every other non-2xx is a provider failure.
    fn map_error(status: StatusCode, body: String) -> Result<GatewayResponse, GatewayError> {
        match serde_json::from_str::<StripeErrorEnvelope>(&body) {
            Ok(envelope) if envelope.error.kind == "card_error" => {
                let error = envelope.error;
                let provider_id = error
                    .payment_intent
                    .as_ref()
                    .and_then(|pi| pi.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let details = json!({
                    "provider": STRIPE,
                    "httpStatus": status.as_u16(),
                    "code": error.code,
                    "declineCode": error.decline_code,
                    "message": error.message,
                });
                Ok(GatewayResponse::declined(
                    error.decline_code.or(error.code),
                    error.message,
                    provider_id,
                    details,
                ))
            }
            _ => Err(GatewayError::Provider {
                status: status.as_u16(),
                body,
            }),
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        STRIPE
    }

    #[instrument(skip(self, request), fields(order_id = %request.metadata.order_id))]
    async fn process_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        request.validate()?;
        let payment_method = Self::payment_method(request)?;
        let amount = to_minor_units(request.amount, &request.currency)?;

        let form = vec![
            ("amount".to_string(), amount.to_string()),
            ("currency".to_string(), request.currency.to_ascii_lowercase()),
            ("payment_method".to_string(), payment_method),
            ("confirm".to_string(), "true".to_string()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
            (
                "automatic_payment_methods[allow_redirects]".to_string(),
                "never".to_string(),
            ),
            ("description".to_string(), request.metadata.description.clone()),
            (
                "metadata[order_id]".to_string(),
                request.metadata.order_id.to_string(),
            ),
            (
                "metadata[user_id]".to_string(),
                request.metadata.user_id.to_string(),
            ),
        ];

        let (status, body) = self.post_form("/v1/payment_intents", &form).await?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "Stripe rejected payment intent");
            return Self::map_error(status, body);
        }

        let intent: PaymentIntent = serde_json::from_str(&body)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        debug!(intent_id = %intent.id, status = %intent.status, "Stripe payment intent");

        let charge_id = match &intent.latest_charge {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Object(obj)) => obj.get("id").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        let details = json!({ "provider": STRIPE, "intentStatus": intent.status });

        Ok(match intent.status.as_str() {
            "succeeded" => GatewayResponse::succeeded(intent.id, charge_id, details),
            "processing" | "requires_action" | "requires_capture" | "requires_confirmation" => {
                GatewayResponse::pending(intent.id, charge_id, details)
            }
            other => GatewayResponse::declined(
                Some(other.to_string()),
                Some(format!("payment intent ended in status {}", other)),
                Some(intent.id),
                details,
            ),
        })
    }

    #[instrument(skip(self, request), fields(provider_id = %request.provider_id))]
    async fn refund_payment(
        &self,
        request: &GatewayRefundRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        request.validate()?;

        let mut form = vec![("payment_intent".to_string(), request.provider_id.clone())];
        if let Some(amount) = request.amount {
            form.push((
                "amount".to_string(),
                to_minor_units(amount, &request.currency)?.to_string(),
            ));
        }

        let (status, body) = self.post_form("/v1/refunds", &form).await?;
        if !status.is_success() {
            return Self::map_error(status, body);
        }

        let refund: StripeRefund = serde_json::from_str(&body)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        let details = json!({ "provider": STRIPE, "refundStatus": refund.status });

        Ok(match refund.status.as_str() {
            "succeeded" => GatewayResponse::succeeded(refund.id, None, details),
            "pending" | "requires_action" => GatewayResponse::pending(refund.id, None, details),
            _ => GatewayResponse::declined(
                refund.failure_reason.clone(),
                refund.failure_reason,
                Some(refund.id),
                details,
            ),
        })
    }
}
