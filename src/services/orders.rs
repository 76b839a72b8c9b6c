use crate::{
    clients::{
        PaymentProcessor, PaymentSession, PaymentSessionItem, PaymentSessionRequest,
        ProductCatalog, ValidatedProduct, PRODUCT_VALIDATION_FAILED,
    },
    entities::{
        order::{self, ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel},
        order_item::{self, Entity as OrderItemEntity},
        order_receipt::{self, Entity as OrderReceiptEntity},
        OrderStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Currency every payment session is opened in.
const SESSION_CURRENCY: &str = "usd";

/// Request/Response types for the order service
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<CreateOrderItem>,
    /// Accepted for wire compatibility; anything but PENDING is rejected.
    #[serde(default)]
    pub status: Option<String>,
    /// Accepted for wire compatibility; `true` is rejected.
    #[serde(default)]
    pub paid: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderItem {
    pub product_id: Uuid,
    pub quantity: i32,
    /// Ignored: pricing always comes from the product catalog.
    #[serde(default, skip_serializing)]
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub total_amount: Decimal,
    pub total_items: i32,
    pub status: OrderStatus,
    pub paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub stripe_charge_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
    /// Display name from the catalog; enriched per read, never persisted.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetailResponse {
    #[serde(flatten)]
    pub order: OrderResponse,
    pub items: Vec<OrderItemResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMeta {
    pub total: u64,
    pub page: u64,
    pub last_page: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub data: Vec<OrderResponse>,
    pub meta: ListMeta,
}

/// Payload of the asynchronous payment-succeeded event. Delivered
/// at-least-once; `paid_order` must tolerate redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaidOrderRequest {
    pub order_id: Uuid,
    pub stripe_payment_id: String,
    pub receipt_url: String,
}

/// Orchestrates the order lifecycle: catalog-validated creation, listing,
/// status changes, and reconciliation of payment confirmations.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn ProductCatalog>,
    payments: Arc<dyn PaymentProcessor>,
    event_sender: Option<Arc<EventSender>>,
}

/// Derives `(total_amount, total_items)` from requested quantities and
/// catalog prices. Fails when any requested product has no catalog match;
/// a partially priced order is never created. Arithmetic is checked so an
/// absurd quantity surfaces as a validation error rather than a panic.
fn derive_totals(
    items: &[CreateOrderItem],
    products: &HashMap<Uuid, ValidatedProduct>,
) -> Result<(Decimal, i32), ServiceError> {
    let mut total_amount = Decimal::ZERO;
    let mut total_items = 0i32;

    for item in items {
        let product = products.get(&item.product_id).ok_or_else(|| {
            ServiceError::ValidationError(PRODUCT_VALIDATION_FAILED.to_string())
        })?;
        total_amount = product
            .price
            .checked_mul(Decimal::from(item.quantity))
            .and_then(|line_total| total_amount.checked_add(line_total))
            .ok_or_else(|| {
                ServiceError::ValidationError(
                    "Order total exceeds the representable amount".to_string(),
                )
            })?;
        total_items = total_items.checked_add(item.quantity).ok_or_else(|| {
            ServiceError::ValidationError(
                "Order item count exceeds the representable total".to_string(),
            )
        })?;
    }

    Ok((total_amount, total_items))
}

fn last_page(total: u64, limit: u64) -> u64 {
    total.div_ceil(limit)
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn ProductCatalog>,
        payments: Arc<dyn PaymentProcessor>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            catalog,
            payments,
            event_sender,
        }
    }

    /// Creates an order: validates the referenced products against the
    /// catalog, derives totals from catalog prices, and persists the order
    /// with all of its items in one transaction. Nothing is written when
    /// validation fails.
    #[instrument(skip(self, request), fields(item_count = request.items.len()))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderDetailResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        for item in &request.items {
            if item.quantity <= 0 {
                return Err(ServiceError::ValidationError(
                    "Item quantity must be positive".to_string(),
                ));
            }
        }

        // Orders always start out unpaid and PENDING; a request claiming
        // otherwise is malformed rather than silently corrected.
        if let Some(status) = request.status.as_deref() {
            let parsed: OrderStatus = status.parse().map_err(|_| {
                ServiceError::InvalidStatus(format!("Unknown order status: {status}"))
            })?;
            if parsed != OrderStatus::Pending {
                return Err(ServiceError::ValidationError(
                    "Orders are always created as PENDING".to_string(),
                ));
            }
        }
        if request.paid == Some(true) {
            return Err(ServiceError::ValidationError(
                "Orders cannot be created as paid".to_string(),
            ));
        }

        let mut product_ids: Vec<Uuid> = request.items.iter().map(|i| i.product_id).collect();
        product_ids.sort_unstable();
        product_ids.dedup();

        let products = self.catalog.validate_products(&product_ids).await?;
        let products: HashMap<Uuid, ValidatedProduct> =
            products.into_iter().map(|p| (p.id, p)).collect();

        let (total_amount, total_items) = derive_totals(&request.items, &products)?;

        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        let order_model = OrderActiveModel {
            id: Set(order_id),
            total_amount: Set(total_amount),
            total_items: Set(total_items),
            status: Set(OrderStatus::Pending),
            paid: Set(false),
            paid_at: Set(None),
            stripe_charge_id: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to create order in database");
            ServiceError::DatabaseError(e)
        })?;

        let item_models: Vec<order_item::ActiveModel> = request
            .items
            .iter()
            .map(|item| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                quantity: Set(item.quantity),
                // Catalog price, never the caller's.
                price: Set(products[&item.product_id].price),
                created_at: Set(now),
            })
            .collect();

        OrderItemEntity::insert_many(item_models)
            .exec(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to create order items");
                ServiceError::DatabaseError(e)
            })?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit order creation transaction");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_id = %order_id, total_amount = %total_amount, total_items, "Order created successfully");

        self.emit(Event::OrderCreated(order_id)).await;

        let items = request
            .items
            .iter()
            .map(|item| OrderItemResponse {
                product_id: item.product_id,
                quantity: item.quantity,
                price: products[&item.product_id].price,
                name: products[&item.product_id].name.clone(),
            })
            .collect();

        Ok(OrderDetailResponse {
            order: self.model_to_response(order_model),
            items,
        })
    }

    /// Opens a checkout session with the payment processor for an already
    /// persisted order. A failure here leaves the order untouched; the
    /// session can be requested again via `payment_session_for_order`.
    #[instrument(skip(self, order), fields(order_id = %order.order.id))]
    pub async fn create_payment_session(
        &self,
        order: &OrderDetailResponse,
    ) -> Result<PaymentSession, ServiceError> {
        let request = PaymentSessionRequest {
            order_id: order.order.id,
            currency: SESSION_CURRENCY.to_string(),
            items: order
                .items
                .iter()
                .map(|item| PaymentSessionItem {
                    name: item.name.clone(),
                    price: item.price,
                    quantity: item.quantity,
                })
                .collect(),
        };

        self.payments.create_session(&request).await
    }

    /// Retries payment-session acquisition for an existing order.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn payment_session_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<PaymentSession, ServiceError> {
        let order = self.find_one(order_id).await?;
        self.create_payment_session(&order).await
    }

    /// Lists orders with an optional status filter and offset pagination.
    /// `page` is 1-indexed. No catalog enrichment on the list path.
    #[instrument(skip(self))]
    pub async fn find_all(
        &self,
        status: Option<OrderStatus>,
        page: u64,
        limit: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        if page == 0 {
            return Err(ServiceError::InvalidInput(
                "page numbering starts at 1".to_string(),
            ));
        }
        if limit == 0 {
            return Err(ServiceError::InvalidInput(
                "limit must be positive".to_string(),
            ));
        }

        let db = &*self.db;

        let mut query = OrderEntity::find().order_by_desc(order::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status));
        }

        let paginator = query.paginate(db, limit);

        let total = paginator.num_items().await.map_err(|e| {
            error!(error = %e, "Failed to count orders");
            ServiceError::DatabaseError(e)
        })?;

        let orders = paginator.fetch_page(page - 1).await.map_err(|e| {
            error!(error = %e, page, limit, "Failed to fetch orders page");
            ServiceError::DatabaseError(e)
        })?;

        let data = orders
            .into_iter()
            .map(|order| self.model_to_response(order))
            .collect();

        Ok(OrderListResponse {
            data,
            meta: ListMeta {
                total,
                page,
                last_page: last_page(total, limit),
            },
        })
    }

    /// Fetches an order with its items and re-resolves item display names
    /// through the catalog. Prices are never re-fetched; they stay the
    /// creation-time snapshot. A catalog failure fails the whole read.
    #[instrument(skip(self), fields(order_id = %id))]
    pub async fn find_one(&self, id: Uuid) -> Result<OrderDetailResponse, ServiceError> {
        let db = &*self.db;

        let order = OrderEntity::find_by_id(id)
            .one(db)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %id, "Failed to fetch order from database");
                ServiceError::DatabaseError(e)
            })?
            .ok_or_else(|| ServiceError::NotFound(format!("Order with id {id} not found")))?;

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(id))
            .all(db)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %id, "Failed to fetch order items");
                ServiceError::DatabaseError(e)
            })?;

        let items = self.enrich_items(items).await?;

        Ok(OrderDetailResponse {
            order: self.model_to_response(order),
            items,
        })
    }

    /// Sets the order status. Re-applying the current status is an idempotent
    /// no-op: the stored order is returned without a write.
    #[instrument(skip(self), fields(order_id = %id, target_status = %status))]
    pub async fn change_status(
        &self,
        id: Uuid,
        status: OrderStatus,
    ) -> Result<OrderDetailResponse, ServiceError> {
        let mut detail = self.find_one(id).await?;

        if detail.order.status == status {
            info!(order_id = %id, status = %status, "Status unchanged, skipping write");
            return Ok(detail);
        }

        let db = &*self.db;
        let order = OrderEntity::find_by_id(id)
            .one(db)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %id, "Failed to fetch order for status update");
                ServiceError::DatabaseError(e)
            })?
            .ok_or_else(|| ServiceError::NotFound(format!("Order with id {id} not found")))?;

        let old_status = order.status;

        let mut active: OrderActiveModel = order.into();
        active.status = Set(status);
        active.updated_at = Set(Some(Utc::now()));

        let updated = active.update(db).await.map_err(|e| {
            error!(error = %e, order_id = %id, "Failed to update order status");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_id = %id, old_status = %old_status, new_status = %status, "Order status updated");

        self.emit(Event::OrderStatusChanged {
            order_id: id,
            old_status,
            new_status: status,
        })
        .await;

        detail.order = self.model_to_response(updated);
        Ok(detail)
    }

    /// Applies a payment confirmation: marks the order PAID and records the
    /// receipt. Safe under at-least-once delivery; a redelivered event finds
    /// the order already paid, writes nothing, and returns the stored state.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn paid_order(
        &self,
        request: PaidOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for payment confirmation");
            ServiceError::DatabaseError(e)
        })?;

        let order = OrderEntity::find_by_id(request.order_id)
            .one(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %request.order_id, "Failed to fetch order for payment confirmation");
                ServiceError::DatabaseError(e)
            })?
            .ok_or_else(|| {
                warn!(order_id = %request.order_id, "Payment confirmation for unknown order");
                ServiceError::NotFound(format!("Order with id {} not found", request.order_id))
            })?;

        if order.paid {
            txn.commit().await.map_err(ServiceError::DatabaseError)?;
            info!(order_id = %order.id, "Duplicate payment confirmation ignored");
            return Ok(self.model_to_response(order));
        }

        let now = Utc::now();
        let order_id = order.id;

        let mut active: OrderActiveModel = order.into();
        active.status = Set(OrderStatus::Paid);
        active.paid = Set(true);
        active.paid_at = Set(Some(now));
        active.stripe_charge_id = Set(Some(request.stripe_payment_id.clone()));
        active.updated_at = Set(Some(now));

        let updated = active.update(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to mark order paid");
            ServiceError::DatabaseError(e)
        })?;

        let existing_receipt = OrderReceiptEntity::find()
            .filter(order_receipt::Column::OrderId.eq(order_id))
            .one(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to check for existing receipt");
                ServiceError::DatabaseError(e)
            })?;

        if existing_receipt.is_none() {
            order_receipt::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                receipt_url: Set(request.receipt_url.clone()),
                created_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to create order receipt");
                ServiceError::DatabaseError(e)
            })?;
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit payment confirmation");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_id = %order_id, "Order marked as paid");

        self.emit(Event::OrderPaid(order_id)).await;

        Ok(self.model_to_response(updated))
    }

    /// Resolves display names for stored items through the catalog. Skips the
    /// remote call entirely for an order without items (the catalog requires
    /// a non-empty id set).
    async fn enrich_items(
        &self,
        items: Vec<order_item::Model>,
    ) -> Result<Vec<OrderItemResponse>, ServiceError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        product_ids.sort_unstable();
        product_ids.dedup();

        let products = self.catalog.validate_products(&product_ids).await?;
        let names: HashMap<Uuid, String> =
            products.into_iter().map(|p| (p.id, p.name)).collect();

        items
            .into_iter()
            .map(|item| {
                let name = names.get(&item.product_id).cloned().ok_or_else(|| {
                    ServiceError::ValidationError(PRODUCT_VALIDATION_FAILED.to_string())
                })?;
                Ok(OrderItemResponse {
                    product_id: item.product_id,
                    quantity: item.quantity,
                    price: item.price,
                    name,
                })
            })
            .collect()
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send domain event");
            }
        }
    }

    /// Converts an order model to response format
    fn model_to_response(&self, model: OrderModel) -> OrderResponse {
        OrderResponse {
            id: model.id,
            total_amount: model.total_amount,
            total_items: model.total_items,
            status: model.status,
            paid: model.paid,
            paid_at: model.paid_at,
            stripe_charge_id: model.stripe_charge_id,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}
