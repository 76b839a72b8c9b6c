use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::{
    clients::PaymentSession,
    entities::OrderStatus,
    errors::ServiceError,
    services::orders::{
        CreateOrderRequest, OrderDetailResponse, OrderListResponse, PaidOrderRequest,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/status", patch(change_order_status))
        .route("/orders/:id/payment-session", post(create_payment_session))
        .route("/webhooks/payment-succeeded", post(payment_succeeded))
}

fn default_page() -> u64 {
    1
}
fn default_limit() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
pub struct OrderListQuery {
    pub status: Option<String>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChangeStatusBody {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResult {
    pub order: OrderDetailResponse,
    pub payment_session: PaymentSession,
}

fn parse_status(status: &str) -> Result<OrderStatus, ServiceError> {
    status
        .parse()
        .map_err(|_| ServiceError::InvalidStatus(format!("Unknown order status: {status}")))
}

/// Creates an order, then opens a checkout session for it. A payment-session
/// failure surfaces as 402 while the order stays persisted; the session can
/// be retried through the payment-session endpoint.
async fn create_order(
    State(state): State<AppState>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.orders.create_order(payload).await?;
    let payment_session = state.orders.create_payment_session(&order).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResult {
            order,
            payment_session,
        }),
    ))
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<OrderListResponse>, ServiceError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let response = state
        .orders
        .find_all(status, query.page, query.limit)
        .await?;
    Ok(Json(response))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetailResponse>, ServiceError> {
    let order = state.orders.find_one(id).await?;
    Ok(Json(order))
}

async fn change_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ChangeStatusBody>,
) -> Result<Json<OrderDetailResponse>, ServiceError> {
    let status = parse_status(&body.status)?;
    let order = state.orders.change_status(id, status).await?;
    Ok(Json(order))
}

async fn create_payment_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentSession>, ServiceError> {
    let session = state.orders.payment_session_for_order(id).await?;
    Ok(Json(session))
}

/// Fire-and-forget payment confirmation. The sender gets no result back;
/// processing failures are logged and the delivery is acknowledged so the
/// event bus does not retry into a handler that already logged the problem.
async fn payment_succeeded(
    State(state): State<AppState>,
    Json(payload): Json<PaidOrderRequest>,
) -> StatusCode {
    let order_id = payload.order_id;
    if let Err(e) = state.orders.paid_order(payload).await {
        error!(error = %e, %order_id, "failed to process payment confirmation");
    }
    StatusCode::NO_CONTENT
}
