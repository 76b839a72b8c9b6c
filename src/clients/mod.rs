//! Outbound collaborators.
//!
//! The product catalog and the payment processor are separate services; this
//! module holds the trait seams the orchestrator depends on plus their
//! reqwest-backed implementations. Both are constructed once at startup and
//! shared behind `Arc`.

pub mod payments;
pub mod products;

pub use payments::{
    HttpPaymentProcessor, PaymentProcessor, PaymentSession, PaymentSessionItem,
    PaymentSessionRequest,
};
pub use products::{
    HttpProductCatalog, ProductCatalog, ValidatedProduct, PRODUCT_VALIDATION_FAILED,
};
