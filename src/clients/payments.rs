use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Opaque checkout-session handle returned by the payment processor
/// (typically a URL/token bundle). Passed through to the caller untouched.
pub type PaymentSession = serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSessionItem {
    pub name: String,
    pub price: Decimal,
    pub quantity: i32,
}

/// Order summary handed to the payment processor. Field names follow the
/// processor's wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSessionRequest {
    pub order_id: Uuid,
    pub currency: String,
    pub items: Vec<PaymentSessionItem>,
}

/// Remote payment service. Called only after the order has been durably
/// persisted; a failure here must never undo the order.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_session(
        &self,
        request: &PaymentSessionRequest,
    ) -> Result<PaymentSession, ServiceError>;
}

/// HTTP implementation against the payment service.
#[derive(Debug, Clone)]
pub struct HttpPaymentProcessor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentProcessor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("failed to build payment HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PaymentProcessor for HttpPaymentProcessor {
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_session(
        &self,
        request: &PaymentSessionRequest,
    ) -> Result<PaymentSession, ServiceError> {
        let url = format!("{}/payments/create-payment-session", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "payment service unreachable");
                ServiceError::PaymentFailed("payment session could not be created".to_string())
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "payment service rejected session request");
            return Err(ServiceError::PaymentFailed(
                "payment session could not be created".to_string(),
            ));
        }

        response.json::<PaymentSession>().await.map_err(|e| {
            warn!(error = %e, "malformed payment service response");
            ServiceError::PaymentFailed("payment session could not be created".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn session_request_uses_processor_wire_names() {
        let request = PaymentSessionRequest {
            order_id: Uuid::nil(),
            currency: "usd".to_string(),
            items: vec![PaymentSessionItem {
                name: "Widget".to_string(),
                price: dec!(10.00),
                quantity: 2,
            }],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("orderId").is_some());
        assert_eq!(json["currency"], "usd");
        assert_eq!(json["items"][0]["quantity"], 2);
    }
}
