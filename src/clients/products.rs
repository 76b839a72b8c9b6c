use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Generic message surfaced when the catalog answered but could not validate
/// the request. Which id failed (or whether the response was malformed) only
/// goes to the logs. An unreachable catalog is a gateway error instead.
pub const PRODUCT_VALIDATION_FAILED: &str = "One or more products could not be validated";

/// Authoritative product record as returned by the catalog service.
/// `price` is the sole source of truth for line-item pricing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedProduct {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
}

/// Remote authority for product existence, display name, and current price.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Resolves the given ids to authoritative product records. The catalog
    /// returns one record per distinct requested id or fails the whole call;
    /// partial results are treated as failure by the orchestrator.
    async fn validate_products(
        &self,
        product_ids: &[Uuid],
    ) -> Result<Vec<ValidatedProduct>, ServiceError>;
}

/// HTTP implementation against the product-catalog service.
#[derive(Debug, Clone)]
pub struct HttpProductCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProductCatalog {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("failed to build catalog HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProductCatalog for HttpProductCatalog {
    #[instrument(skip(self), fields(count = product_ids.len()))]
    async fn validate_products(
        &self,
        product_ids: &[Uuid],
    ) -> Result<Vec<ValidatedProduct>, ServiceError> {
        if product_ids.is_empty() {
            return Err(ServiceError::InvalidInput(
                "product id set must not be empty".to_string(),
            ));
        }

        let url = format!("{}/products/validate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&product_ids)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "product catalog unreachable");
                ServiceError::ExternalServiceError("Product catalog unreachable".to_string())
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "product catalog rejected validation request");
            return Err(ServiceError::ValidationError(
                PRODUCT_VALIDATION_FAILED.to_string(),
            ));
        }

        response.json::<Vec<ValidatedProduct>>().await.map_err(|e| {
            warn!(error = %e, "malformed product catalog response");
            ServiceError::ValidationError(PRODUCT_VALIDATION_FAILED.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn empty_id_set_is_invalid_input() {
        let catalog =
            HttpProductCatalog::new("http://localhost:3001", Duration::from_secs(1)).unwrap();
        let result = catalog.validate_products(&[]).await;
        assert_matches!(result, Err(ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unreachable_catalog_is_a_gateway_error() {
        // Port 1 refuses connections; no request ever reaches a catalog.
        let catalog =
            HttpProductCatalog::new("http://127.0.0.1:1", Duration::from_millis(250)).unwrap();
        let result = catalog.validate_products(&[Uuid::new_v4()]).await;
        assert_matches!(result, Err(ServiceError::ExternalServiceError(_)));
    }
}
