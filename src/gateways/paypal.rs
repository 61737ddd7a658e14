use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::{
    build_http_client, format_major_units, GatewayError, GatewayPaymentRequest,
    GatewayRefundRequest, GatewayResponse, PaymentGateway, PAYPAL,
};
use crate::{config::PaymentsConfig, errors::ServiceError};

/// Tokens are refreshed this long before PayPal says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Wallet payments by capturing an approved PayPal order.
///
/// `paypal_data.orderId` (or `order_id`) names the order approved by the buyer.
#[derive(Debug)]
pub struct PayPalGateway {
    client: Client,
    api_base: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct CaptureOrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    payments: Option<UnitPayments>,
}

#[derive(Debug, Deserialize)]
struct UnitPayments {
    #[serde(default)]
    captures: Vec<Capture>,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    status: String,
    #[serde(default)]
    amount: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct PayPalErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<PayPalIssue>,
}

#[derive(Debug, Deserialize)]
struct PayPalIssue {
    #[serde(default)]
    issue: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl PayPalGateway {
    pub fn new(
        client: Client,
        api_base: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        }
    }

    pub fn from_config(config: &PaymentsConfig) -> Result<Self, ServiceError> {
        let (Some(client_id), Some(client_secret)) = (
            config.paypal_client_id.clone(),
            config.paypal_client_secret.clone(),
        ) else {
            return Err(ServiceError::ConfigError(
                "paypal_client_id and paypal_client_secret must both be set".to_string(),
            ));
        };
        Ok(Self::new(
            build_http_client(config)?,
            config.paypal_api_base.clone(),
            client_id,
            client_secret,
        ))
    }

    fn paypal_order_id(request: &GatewayPaymentRequest) -> Result<String, GatewayError> {
        request
            .paypal_data
            .as_ref()
            .and_then(|data| data.get("orderId").or_else(|| data.get("order_id")))
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::InvalidRequest("paypalData.orderId is required".to_string()))
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            warn!(status = status.as_u16(), "PayPal token request failed");
            return Err(GatewayError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<(StatusCode, String), GatewayError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }

    /// 422 carries buyer-side issues such as `INSTRUMENT_DECLINED`.
    fn map_error(status: StatusCode, body: String) -> Result<GatewayResponse, GatewayError> {
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            if let Ok(error) = serde_json::from_str::<PayPalErrorBody>(&body) {
                let issue = error.details.first();
                let code = issue.and_then(|i| i.issue.clone()).or(error.name.clone());
                let message = issue
                    .and_then(|i| i.description.clone())
                    .or(error.message.clone());
                let details = json!({
                    "provider": PAYPAL,
                    "httpStatus": status.as_u16(),
                    "name": error.name,
                    "issue": code,
                    "message": message,
                });
                return Ok(GatewayResponse::declined(code, message, None, details));
            }
        }
        Err(GatewayError::Provider {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    fn name(&self) -> &'static str {
        PAYPAL
    }

    #[instrument(skip(self, request), fields(order_id = %request.metadata.order_id))]
    async fn process_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        request.validate()?;
        let paypal_order_id = Self::paypal_order_id(request)?;

        let (status, body) = self
            .post_json(
                &format!("/v2/checkout/orders/{}/capture", paypal_order_id),
                &json!({}),
            )
            .await?;
        if !status.is_success() {
            return Self::map_error(status, body);
        }

        let order: CaptureOrderResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        let capture = order
            .purchase_units
            .iter()
            .filter_map(|unit| unit.payments.as_ref())
            .flat_map(|payments| payments.captures.iter())
            .next();

        let Some(capture) = capture else {
            return Err(GatewayError::MalformedResponse(format!(
                "order {} returned no capture",
                order.id
            )));
        };
        debug!(paypal_order_id = %order.id, capture_status = %capture.status, "PayPal capture");

        let details = json!({
            "provider": PAYPAL,
            "orderStatus": order.status,
            "captureStatus": capture.status,
            "capturedAmount": capture.amount,
        });

        Ok(match capture.status.as_str() {
            "COMPLETED" => GatewayResponse::succeeded(capture.id.clone(), Some(order.id), details),
            "PENDING" => GatewayResponse::pending(capture.id.clone(), Some(order.id), details),
            other => GatewayResponse::declined(
                Some(other.to_string()),
                Some(format!("capture ended in status {}", other)),
                Some(capture.id.clone()),
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

        let body = match request.amount {
            Some(amount) => json!({
                "amount": {
                    "value": format_major_units(amount, &request.currency),
                    "currency_code": request.currency.to_ascii_uppercase(),
                }
            }),
            None => json!({}),
        };

        let (status, text) = self
            .post_json(
                &format!("/v2/payments/captures/{}/refund", request.provider_id),
                &body,
            )
            .await?;
        if !status.is_success() {
            return Self::map_error(status, text);
        }

        let refund: RefundResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        let details = json!({ "provider": PAYPAL, "refundStatus": refund.status });

        Ok(match refund.status.as_str() {
            "COMPLETED" => GatewayResponse::succeeded(refund.id, None, details),
            "PENDING" => GatewayResponse::pending(refund.id, None, details),
            other => GatewayResponse::declined(
                Some(other.to_string()),
                Some(format!("refund ended in status {}", other)),
                Some(refund.id),
                details,
            ),
        })
    }
}
