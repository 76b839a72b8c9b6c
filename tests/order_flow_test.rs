use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ColumnTrait, ConnectOptions, Database, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter,
};
use sea_orm_migration::MigratorTrait;
use uuid::Uuid;

use orders_api::{
    clients::{
        PaymentProcessor, PaymentSession, PaymentSessionRequest, ProductCatalog, ValidatedProduct,
    },
    entities::{
        order::Entity as OrderEntity,
        order_item::{Column as OrderItemColumn, Entity as OrderItemEntity},
        order_receipt::Entity as OrderReceiptEntity,
        OrderStatus,
    },
    errors::ServiceError,
    migrator::Migrator,
    services::orders::{CreateOrderItem, CreateOrderRequest, OrderService, PaidOrderRequest},
};

/// Catalog stub that answers from a fixed product list, or fails outright.
struct RecordingCatalog {
    products: Vec<ValidatedProduct>,
    fail: bool,
    calls: AtomicUsize,
}

impl RecordingCatalog {
    fn with_products(products: Vec<ValidatedProduct>) -> Arc<Self> {
        Arc::new(Self {
            products,
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            products: vec![],
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProductCatalog for RecordingCatalog {
    async fn validate_products(
        &self,
        product_ids: &[Uuid],
    ) -> Result<Vec<ValidatedProduct>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ServiceError::ExternalServiceError(
                "Product catalog unreachable".to_string(),
            ));
        }
        Ok(self
            .products
            .iter()
            .filter(|p| product_ids.contains(&p.id))
            .cloned()
            .collect())
    }
}

/// Payment stub recording the last session request.
struct RecordingPayments {
    fail: bool,
    calls: AtomicUsize,
    last_request: Mutex<Option<PaymentSessionRequest>>,
}

impl RecordingPayments {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PaymentProcessor for RecordingPayments {
    async fn create_session(
        &self,
        request: &PaymentSessionRequest,
    ) -> Result<PaymentSession, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        if self.fail {
            return Err(ServiceError::PaymentFailed(
                "payment session could not be created".to_string(),
            ));
        }
        Ok(serde_json::json!({
            "url": "https://pay.example/session",
            "successUrl": "https://pay.example/success",
            "cancelUrl": "https://pay.example/cancel"
        }))
    }
}

async fn test_db() -> Arc<DatabaseConnection> {
    // A single connection keeps every statement on the same in-memory
    // SQLite instance.
    let mut opt = ConnectOptions::new("sqlite::memory:".to_owned());
    opt.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await.expect("connect test database");
    Migrator::up(&db, None).await.expect("run migrations");
    Arc::new(db)
}

fn service(
    db: Arc<DatabaseConnection>,
    catalog: Arc<RecordingCatalog>,
    payments: Arc<RecordingPayments>,
) -> OrderService {
    OrderService::new(db, catalog, payments, None)
}

fn product(id: Uuid, name: &str, price: Decimal) -> ValidatedProduct {
    ValidatedProduct {
        id,
        name: name.to_string(),
        price,
    }
}

fn request(items: Vec<CreateOrderItem>) -> CreateOrderRequest {
    CreateOrderRequest {
        items,
        status: None,
        paid: None,
    }
}

fn item(product_id: Uuid, quantity: i32) -> CreateOrderItem {
    CreateOrderItem {
        product_id,
        quantity,
        price: None,
    }
}

#[tokio::test]
async fn create_order_snapshots_catalog_prices() {
    let db = test_db().await;
    let p1 = Uuid::new_v4();
    let p2 = Uuid::new_v4();
    let catalog = RecordingCatalog::with_products(vec![
        product(p1, "Keyboard", dec!(10)),
        product(p2, "Mouse", dec!(5)),
    ]);
    let svc = service(db.clone(), catalog, RecordingPayments::ok());

    // Client-supplied prices must be ignored in favor of the catalog's.
    let mut first = item(p1, 2);
    first.price = Some(dec!(999));

    let order = svc
        .create_order(request(vec![first, item(p2, 1)]))
        .await
        .expect("create order");

    assert_eq!(order.order.total_amount, dec!(25));
    assert_eq!(order.order.total_items, 3);
    assert_eq!(order.order.status, OrderStatus::Pending);
    assert!(!order.order.paid);
    assert_eq!(order.items.len(), 2);
    assert!(order.items.iter().any(|i| i.name == "Keyboard"));

    let stored_items = OrderItemEntity::find()
        .filter(OrderItemColumn::OrderId.eq(order.order.id))
        .all(&*db)
        .await
        .expect("query items");
    assert_eq!(stored_items.len(), 2);
    for stored in &stored_items {
        let expected = if stored.product_id == p1 {
            dec!(10)
        } else {
            dec!(5)
        };
        assert_eq!(stored.price, expected);
    }
}

#[tokio::test]
async fn create_aborts_without_side_effects_when_catalog_omits_a_product() {
    let db = test_db().await;
    let p1 = Uuid::new_v4();
    let catalog = RecordingCatalog::with_products(vec![product(p1, "Keyboard", dec!(10))]);
    let svc = service(db.clone(), catalog, RecordingPayments::ok());

    let result = svc
        .create_order(request(vec![item(p1, 2), item(Uuid::new_v4(), 1)]))
        .await;

    assert_matches!(result, Err(ServiceError::ValidationError(_)));
    assert_eq!(OrderEntity::find().count(&*db).await.unwrap(), 0);
    assert_eq!(OrderItemEntity::find().count(&*db).await.unwrap(), 0);
}

#[tokio::test]
async fn create_aborts_when_catalog_is_unreachable() {
    let db = test_db().await;
    let svc = service(db.clone(), RecordingCatalog::failing(), RecordingPayments::ok());

    let result = svc.create_order(request(vec![item(Uuid::new_v4(), 1)])).await;

    assert_matches!(result, Err(ServiceError::ExternalServiceError(_)));
    assert_eq!(OrderEntity::find().count(&*db).await.unwrap(), 0);
}

#[tokio::test]
async fn find_one_unknown_id_is_not_found() {
    let db = test_db().await;
    let svc = service(db, RecordingCatalog::with_products(vec![]), RecordingPayments::ok());

    let id = Uuid::new_v4();
    let err = svc.find_one(id).await.unwrap_err();

    match err {
        ServiceError::NotFound(msg) => assert!(msg.contains(&id.to_string())),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn find_one_enriches_names_and_fails_closed_on_catalog_outage() {
    let db = test_db().await;
    let p1 = Uuid::new_v4();
    let catalog = RecordingCatalog::with_products(vec![product(p1, "Keyboard", dec!(10))]);
    let svc = service(db.clone(), catalog, RecordingPayments::ok());

    let created = svc
        .create_order(request(vec![item(p1, 1)]))
        .await
        .expect("create order");

    let fetched = svc.find_one(created.order.id).await.expect("find one");
    assert_eq!(fetched.items[0].name, "Keyboard");
    assert_eq!(fetched.items[0].price, dec!(10));

    // Same store, dead catalog: the read fails rather than degrade.
    let degraded = service(db, RecordingCatalog::failing(), RecordingPayments::ok());
    let result = degraded.find_one(created.order.id).await;
    assert_matches!(result, Err(ServiceError::ExternalServiceError(_)));
}

#[tokio::test]
async fn change_status_with_same_status_writes_nothing() {
    let db = test_db().await;
    let p1 = Uuid::new_v4();
    let catalog = RecordingCatalog::with_products(vec![product(p1, "Keyboard", dec!(10))]);
    let svc = service(db.clone(), catalog, RecordingPayments::ok());

    let created = svc
        .create_order(request(vec![item(p1, 1)]))
        .await
        .expect("create order");
    let id = created.order.id;

    let before = OrderEntity::find_by_id(id)
        .one(&*db)
        .await
        .unwrap()
        .unwrap();

    let unchanged = svc
        .change_status(id, OrderStatus::Pending)
        .await
        .expect("idempotent change");
    assert_eq!(unchanged.order.status, OrderStatus::Pending);

    let after = OrderEntity::find_by_id(id)
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before, after, "no-op status change must not touch the row");

    let delivered = svc
        .change_status(id, OrderStatus::Delivered)
        .await
        .expect("real change");
    assert_eq!(delivered.order.status, OrderStatus::Delivered);
}

#[tokio::test]
async fn paid_order_is_idempotent_under_redelivery() {
    let db = test_db().await;
    let p1 = Uuid::new_v4();
    let catalog = RecordingCatalog::with_products(vec![product(p1, "Keyboard", dec!(10))]);
    let svc = service(db.clone(), catalog, RecordingPayments::ok());

    let created = svc
        .create_order(request(vec![item(p1, 1)]))
        .await
        .expect("create order");
    let id = created.order.id;

    let confirmation = PaidOrderRequest {
        order_id: id,
        stripe_payment_id: "ch_12345".to_string(),
        receipt_url: "https://stripe.example/receipt/1".to_string(),
    };

    let first = svc
        .paid_order(confirmation.clone())
        .await
        .expect("first delivery");
    assert_eq!(first.status, OrderStatus::Paid);
    assert!(first.paid);
    assert!(first.paid_at.is_some());
    assert_eq!(first.stripe_charge_id.as_deref(), Some("ch_12345"));

    // Redelivery with a different receipt URL: everything from the first
    // application must survive untouched.
    let second = svc
        .paid_order(PaidOrderRequest {
            receipt_url: "https://stripe.example/receipt/other".to_string(),
            ..confirmation
        })
        .await
        .expect("second delivery");
    assert_eq!(second.paid_at, first.paid_at);
    assert_eq!(second.stripe_charge_id, first.stripe_charge_id);

    let receipts = OrderReceiptEntity::find().all(&*db).await.unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].receipt_url, "https://stripe.example/receipt/1");
}

#[tokio::test]
async fn paid_order_unknown_order_is_not_found() {
    let db = test_db().await;
    let svc = service(db, RecordingCatalog::with_products(vec![]), RecordingPayments::ok());

    let result = svc
        .paid_order(PaidOrderRequest {
            order_id: Uuid::new_v4(),
            stripe_payment_id: "ch_0".to_string(),
            receipt_url: "https://stripe.example/receipt/0".to_string(),
        })
        .await;

    assert_matches!(result, Err(ServiceError::NotFound(_)));
}

#[tokio::test]
async fn pagination_meta_matches_ceiling_math() {
    let db = test_db().await;
    let p1 = Uuid::new_v4();
    let catalog = RecordingCatalog::with_products(vec![product(p1, "Keyboard", dec!(10))]);
    let svc = service(db.clone(), catalog, RecordingPayments::ok());

    let mut last_id = None;
    for _ in 0..5 {
        let created = svc
            .create_order(request(vec![item(p1, 1)]))
            .await
            .expect("seed order");
        last_id = Some(created.order.id);
    }

    let page1 = svc.find_all(None, 1, 2).await.expect("page 1");
    assert_eq!(page1.data.len(), 2);
    assert_eq!(page1.meta.total, 5);
    assert_eq!(page1.meta.page, 1);
    assert_eq!(page1.meta.last_page, 3);

    let page3 = svc.find_all(None, 3, 2).await.expect("page 3");
    assert_eq!(page3.data.len(), 1);

    // Status filter narrows both the rows and the count.
    svc.change_status(last_id.unwrap(), OrderStatus::Delivered)
        .await
        .expect("deliver one");
    let delivered = svc
        .find_all(Some(OrderStatus::Delivered), 1, 10)
        .await
        .expect("filtered list");
    assert_eq!(delivered.meta.total, 1);
    assert_eq!(delivered.data.len(), 1);
    assert_eq!(delivered.meta.last_page, 1);

    let rejected = svc.find_all(None, 0, 2).await;
    assert_matches!(rejected, Err(ServiceError::InvalidInput(_)));
}

#[tokio::test]
async fn payment_session_failure_leaves_order_persisted() {
    let db = test_db().await;
    let p1 = Uuid::new_v4();
    let catalog = RecordingCatalog::with_products(vec![product(p1, "Keyboard", dec!(10))]);
    let payments = RecordingPayments::failing();
    let svc = service(db.clone(), catalog, payments.clone());

    let created = svc
        .create_order(request(vec![item(p1, 1)]))
        .await
        .expect("order persists before payment");

    let result = svc.create_payment_session(&created).await;
    assert_matches!(result, Err(ServiceError::PaymentFailed(_)));
    assert_eq!(payments.calls.load(Ordering::SeqCst), 1);

    // The failed session must not roll the order back.
    assert!(OrderEntity::find_by_id(created.order.id)
        .one(&*db)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn payment_session_carries_usd_and_catalog_priced_items() {
    let db = test_db().await;
    let p1 = Uuid::new_v4();
    let catalog = RecordingCatalog::with_products(vec![product(p1, "Keyboard", dec!(10))]);
    let payments = RecordingPayments::ok();
    let svc = service(db, catalog, payments.clone());

    let created = svc
        .create_order(request(vec![item(p1, 3)]))
        .await
        .expect("create order");

    let session = svc
        .payment_session_for_order(created.order.id)
        .await
        .expect("session for existing order");
    assert!(session.get("url").is_some());

    let recorded = payments.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(recorded.order_id, created.order.id);
    assert_eq!(recorded.currency, "usd");
    assert_eq!(recorded.items.len(), 1);
    assert_eq!(recorded.items[0].name, "Keyboard");
    assert_eq!(recorded.items[0].price, dec!(10));
    assert_eq!(recorded.items[0].quantity, 3);
}
