use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use merch_api::middleware::{AdminClaims, CustomerClaims};
use merch_api::{app, AppState, AuthConfig, Backends, EngineSettings};
use merch_catalog::{Product, ProductCategory, VariantOptions, VendorAccount};
use merch_core::{GatewayError, MockPaymentGateway, RetryPolicy, WebhookVerifier, SIGNATURE_HEADER};
use merch_order::{CartLine, CheckoutSettings, InMemoryStore};
use merch_shared::{Money, Rate};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

const WEBHOOK_SECRET: &str = "whsec_test";
const JWT_SECRET: &str = "jwt-test-secret";

struct TestApp {
    router: Router,
    store: InMemoryStore,
    gateway: Arc<MockPaymentGateway>,
    verifier: WebhookVerifier,
    vendor_a: Uuid,
    vendor_b: Uuid,
    vinyl: Uuid,
    shirt: Uuid,
}

impl TestApp {
    /// Two vendors: A sells a 20.00 record at 15%, B a 10.00 shirt at 20%
    async fn new() -> Self {
        let store = InMemoryStore::new();
        let gateway = Arc::new(MockPaymentGateway::new());

        let (vendor_a, vendor_b) = (Uuid::new_v4(), Uuid::new_v4());
        for (vendor_id, account, bps) in [(vendor_a, "acct_a", 1500), (vendor_b, "acct_b", 2000)] {
            store
                .upsert_vendor(VendorAccount {
                    vendor_id,
                    external_account_id: Some(account.to_string()),
                    commission_rate: Rate::from_basis_points(bps),
                    charges_enabled: true,
                    payouts_enabled: true,
                    details_submitted: true,
                })
                .await;
        }

        let vinyl = Uuid::new_v4();
        let shirt = Uuid::new_v4();
        for (id, vendor_id, title, price, category) in [
            (vinyl, vendor_a, "Live at the Roundhouse LP", 2000, ProductCategory::Vinyl),
            (shirt, vendor_b, "Tour Shirt", 1000, ProductCategory::Tshirt),
        ] {
            store
                .insert_product(Product {
                    id,
                    vendor_id,
                    title: title.to_string(),
                    price: Money::from_minor(price),
                    category,
                    inventory_count: 5,
                    weight_grams: 250,
                    is_active: true,
                    variant_options: VariantOptions::default(),
                })
                .await;
        }

        let verifier = WebhookVerifier::new(WEBHOOK_SECRET, 300);
        let state = AppState::new(
            Backends::in_memory(&store, gateway.clone()),
            EngineSettings {
                checkout: CheckoutSettings::default(),
                verifier: verifier.clone(),
                retry: RetryPolicy::default(),
                lease: chrono::Duration::seconds(300),
            },
            AuthConfig {
                secret: JWT_SECRET.to_string(),
            },
        );

        Self {
            router: app(state),
            store,
            gateway,
            verifier,
            vendor_a,
            vendor_b,
            vinyl,
            shirt,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn checkout_body(&self, vinyl_qty: u32, shirt_qty: u32) -> Value {
        json!({
            "items": [
                { "product_id": self.vinyl, "quantity": vinyl_qty },
                { "product_id": self.shirt, "quantity": shirt_qty }
            ],
            "shipping_address": {
                "name": "Sam Rivers",
                "line1": "1 Harbour Road",
                "city": "Cork",
                "country": "IE"
            },
            "customer": { "email": "sam@example.com", "user_id": "user-1" }
        })
    }

    async fn checkout(&self, body: Value, idempotency_key: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/orders")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap()).await
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn post(&self, uri: &str, body: Value, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap()).await
    }

    async fn deliver(&self, event: &Value) -> (StatusCode, Value) {
        let payload = event.to_string();
        let signature = self.verifier.sign(payload.as_bytes(), Utc::now().timestamp()).unwrap();
        self.deliver_signed(payload, &signature).await
    }

    async fn deliver_signed(&self, payload: String, signature: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/payments")
            .header(header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(payload))
            .unwrap();
        self.send(request).await
    }

    /// Order id and attached intent id of a fresh checkout
    async fn place_order(&self) -> (String, String) {
        let (status, receipt) = self.checkout(self.checkout_body(1, 2), None).await;
        assert_eq!(status, StatusCode::CREATED, "{}", receipt);
        let order_id = receipt["order_id"].as_str().unwrap().to_string();
        let (_, order) = self.get(&format!("/orders/{}", order_id), Some(&customer_token("user-1"))).await;
        let intent_id = order["payment_intent_id"].as_str().unwrap().to_string();
        (order_id, intent_id)
    }
}

fn token(role: &str) -> String {
    let claims = AdminClaims {
        sub: "ops-1".to_string(),
        email: "ops@example.com".to_string(),
        role: role.to_string(),
        exp: (Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

fn customer_token(user_id: &str) -> String {
    let claims = CustomerClaims {
        sub: user_id.to_string(),
        email: Some(format!("{}@example.com", user_id)),
        role: "CUSTOMER".to_string(),
        exp: (Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

fn payment_event(event_id: &str, event_type: &str, intent_id: &str, order_id: &str, amount: i64) -> Value {
    json!({
        "id": event_id,
        "type": event_type,
        "data": {
            "object": {
                "id": intent_id,
                "amount": amount,
                "currency": "eur",
                "metadata": { "order_id": order_id }
            }
        }
    })
}

#[tokio::test]
async fn test_checkout_confirm_and_settle() {
    let app = TestApp::new().await;
    app.store
        .set_cart(
            "user-1",
            vec![CartLine {
                product_id: app.vinyl,
                quantity: 1,
                variant: Default::default(),
            }],
        )
        .await;

    let (status, receipt) = app.checkout(app.checkout_body(1, 2), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["breakdown"]["subtotal"], 4000);
    assert_eq!(receipt["breakdown"]["tax_amount"], 1024);
    assert_eq!(receipt["breakdown"]["total_amount"], 5474);
    assert!(receipt["client_secret"].as_str().unwrap().contains("_secret_"));

    let order_id = receipt["order_id"].as_str().unwrap().to_string();
    let (_, order) = app.get(&format!("/orders/{}", order_id), Some(&customer_token("user-1"))).await;
    assert_eq!(order["status"], "pending_payment");
    assert!(order.get("client_secret").is_none());
    let intent_id = order["payment_intent_id"].as_str().unwrap().to_string();

    let event = payment_event("evt_ok", "payment_intent.succeeded", &intent_id, &order_id, 5474);
    let (status, ack) = app.deliver(&event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["received"], true);
    assert_eq!(ack["outcome"]["result"], "applied");
    assert_eq!(ack["outcome"]["status"], "confirmed");

    assert_eq!(app.store.inventory(app.vinyl).await, Some(4));
    assert_eq!(app.store.inventory(app.shirt).await, Some(3));
    assert!(app.store.cart("user-1").await.is_empty());

    // Payouts go out on a spawned task
    let admin = token("ADMIN");
    let mut settled = Vec::new();
    for _ in 0..100 {
        let (status, payouts) = app.get(&format!("/admin/orders/{}/payouts", order_id), Some(&admin)).await;
        assert_eq!(status, StatusCode::OK);
        settled = payouts
            .as_array()
            .unwrap()
            .iter()
            .filter(|p| p["status"] == "settled")
            .map(|p| p["amount"].as_i64().unwrap())
            .collect();
        if settled.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    settled.sort();
    assert_eq!(settled, vec![1600, 1700]);
    assert_eq!(app.gateway.completed_transfers().len(), 2);
}

#[tokio::test]
async fn test_replayed_webhook_is_acknowledged_once() {
    let app = TestApp::new().await;
    let (order_id, intent_id) = app.place_order().await;

    let event = payment_event("evt_dup", "payment_intent.succeeded", &intent_id, &order_id, 5474);
    let (_, first) = app.deliver(&event).await;
    let (status, second) = app.deliver(&event).await;

    assert_eq!(first["outcome"]["result"], "applied");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["outcome"]["result"], "duplicate");
    assert_eq!(app.store.inventory(app.vinyl).await, Some(4));
}

#[tokio::test]
async fn test_bad_signature_is_rejected_without_effect() {
    let app = TestApp::new().await;
    let (order_id, intent_id) = app.place_order().await;

    let payload = payment_event("evt_forged", "payment_intent.succeeded", &intent_id, &order_id, 5474).to_string();
    let forged = WebhookVerifier::new("whsec_other", 300)
        .sign(payload.as_bytes(), Utc::now().timestamp())
        .unwrap();
    let (status, body) = app.deliver_signed(payload, &forged).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid webhook signature");

    let (_, order) = app.get(&format!("/orders/{}", order_id), Some(&token("ADMIN"))).await;
    assert_eq!(order["status"], "pending_payment");
    assert_eq!(app.store.inventory(app.vinyl).await, Some(5));
}

#[tokio::test]
async fn test_webhook_for_unknown_order_is_ignored() {
    let app = TestApp::new().await;
    let event = payment_event(
        "evt_stray",
        "payment_intent.succeeded",
        "pi_elsewhere",
        &Uuid::new_v4().to_string(),
        999,
    );
    let (status, ack) = app.deliver(&event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"]["result"], "ignored");
    assert_eq!(ack["outcome"]["reason"], "unknown_order");
}

#[tokio::test]
async fn test_malformed_webhook_is_bad_request() {
    let app = TestApp::new().await;
    let payload = "{not json".to_string();
    let signature = app.verifier.sign(payload.as_bytes(), Utc::now().timestamp()).unwrap();
    let (status, _) = app.deliver_signed(payload, &signature).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rejected_cart_lists_line_errors() {
    let app = TestApp::new().await;
    let (status, body) = app.checkout(app.checkout_body(1, 9), None).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let details = body["details"].as_array().unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0]["line"], 1);
    assert_eq!(details[0]["reason"], "insufficient_stock");
    assert!(app.gateway.intent_requests().is_empty());
}

#[tokio::test]
async fn test_idempotency_key_replays_checkout() {
    let app = TestApp::new().await;
    let (first_status, first) = app.checkout(app.checkout_body(1, 1), Some("cart-42")).await;
    let (second_status, second) = app.checkout(app.checkout_body(1, 1), Some("cart-42")).await;

    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first["order_id"], second["order_id"]);
    assert_eq!(second["replayed"], true);
    assert_eq!(app.gateway.intent_requests().len(), 1);
}

#[tokio::test]
async fn test_gateway_refusal_is_bad_gateway() {
    let app = TestApp::new().await;
    app.gateway
        .fail_next_intent(GatewayError::Transient("connection reset".into()));

    let (status, body) = app.checkout(app.checkout_body(1, 1), None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "Payment provider unavailable");
}

#[tokio::test]
async fn test_cancel_confirmed_order_restores_stock_once() {
    let app = TestApp::new().await;
    let (order_id, intent_id) = app.place_order().await;
    let event = payment_event("evt_paid", "payment_intent.succeeded", &intent_id, &order_id, 5474);
    app.deliver(&event).await;
    assert_eq!(app.store.inventory(app.shirt).await, Some(3));

    let owner = customer_token("user-1");
    let (status, order) = app
        .post(&format!("/orders/{}/cancel", order_id), json!({}), Some(&owner))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "cancelled");
    assert_eq!(app.store.inventory(app.shirt).await, Some(5));
    assert_eq!(app.store.inventory(app.vinyl).await, Some(5));

    let (status, _) = app
        .post(&format!("/orders/{}/cancel", order_id), json!({}), Some(&owner))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(app.store.inventory(app.shirt).await, Some(5));

    // A paid order needs a refund
    let (_, escalations) = app.get("/admin/escalations", Some(&token("ADMIN"))).await;
    assert!(escalations
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["kind"]["kind"] == "refund_required"));
}

#[tokio::test]
async fn test_only_the_owner_cancels_a_customer_order() {
    let app = TestApp::new().await;
    let (order_id, intent_id) = app.place_order().await;
    app.deliver(&payment_event("evt_paid", "payment_intent.succeeded", &intent_id, &order_id, 5474))
        .await;
    let cancel = format!("/orders/{}/cancel", order_id);

    let (status, _) = app.post(&cancel, json!({}), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.post(&cancel, json!({}), Some(&customer_token("user-2"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.get(&format!("/orders/{}", order_id), Some(&customer_token("user-2"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.post(&cancel, json!({}), Some(&token("VENDOR"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Still paid, stock still taken, no refund raised
    assert_eq!(app.store.inventory(app.shirt).await, Some(3));
    let (_, escalations) = app.get("/admin/escalations", Some(&token("ADMIN"))).await;
    assert_eq!(escalations, json!([]));

    let (status, order) = app.post(&cancel, json!({}), Some(&token("ADMIN"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "cancelled");
}

#[tokio::test]
async fn test_guest_order_cancels_without_account() {
    let app = TestApp::new().await;
    let mut body = app.checkout_body(1, 0);
    body["items"].as_array_mut().unwrap().pop();
    body["customer"] = json!({ "email": "guest@example.com" });
    let (status, receipt) = app.checkout(body, None).await;
    assert_eq!(status, StatusCode::CREATED, "{}", receipt);

    let order_id = receipt["order_id"].as_str().unwrap();
    let (status, order) = app.post(&format!("/orders/{}/cancel", order_id), json!({}), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "cancelled");
}

#[tokio::test]
async fn test_customer_lists_own_orders() {
    let app = TestApp::new().await;
    let (first, _) = app.place_order().await;

    // The token decides ownership, not the body
    let mut body = app.checkout_body(1, 1);
    body["customer"]["user_id"] = json!("user-1");
    let request = Request::builder()
        .method("POST")
        .uri("/orders")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {}", customer_token("user-2")))
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, receipt) = app.send(request).await;
    assert_eq!(status, StatusCode::CREATED);
    let second = receipt["order_id"].as_str().unwrap().to_string();

    let (status, mine) = app.get("/orders", Some(&customer_token("user-1"))).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = mine.as_array().unwrap().iter().map(|o| o["order_id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec![first.as_str()]);
    assert_eq!(mine[0]["item_count"], 2);

    let (_, theirs) = app
        .get("/orders?status=pending_payment&limit=5", Some(&customer_token("user-2")))
        .await;
    assert_eq!(theirs[0]["order_id"], second.as_str());

    let (status, _) = app.get("/orders?status=shipped", Some(&customer_token("user-2"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.get("/orders", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.get("/orders", Some("not-a-jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_vendor_orders_and_summary() {
    let app = TestApp::new().await;
    let admin = token("ADMIN");
    let (order_id, intent_id) = app.place_order().await;
    app.place_order().await;
    app.deliver(&payment_event("evt_paid", "payment_intent.succeeded", &intent_id, &order_id, 5474))
        .await;

    let (status, orders) = app.get(&format!("/admin/vendors/{}/orders", app.vendor_b), Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(orders.as_array().unwrap().len(), 2);

    let (_, paid) = app
        .get(
            &format!("/admin/vendors/{}/orders?payment_status=paid", app.vendor_b),
            Some(&admin),
        )
        .await;
    assert_eq!(paid.as_array().unwrap().len(), 1);
    assert_eq!(paid[0]["order_id"], order_id.as_str());
    assert_eq!(paid[0]["quantity"], 2);
    assert_eq!(paid[0]["subtotal"], 2000);
    assert_eq!(paid[0]["vendor_payout"], 1600);

    let (status, summary) = app.get(&format!("/admin/vendors/{}/summary", app.vendor_a), Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["sales"]["orders"], 1);
    assert_eq!(summary["sales"]["items_sold"], 1);
    assert_eq!(summary["sales"]["revenue"], 2000);
    assert_eq!(summary["sales"]["top_products"][0]["product_id"], app.vinyl.to_string());
    assert_eq!(summary["payouts"]["payouts"], 1);
    let settled = summary["payouts"]["settled"].as_i64().unwrap();
    let outstanding = summary["payouts"]["outstanding"].as_i64().unwrap();
    assert_eq!(settled + outstanding, 1700);

    let (status, _) = app
        .get(&format!("/admin/vendors/{}/summary", app.vendor_a), Some(&customer_token("user-1")))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_order_is_not_found() {
    let app = TestApp::new().await;
    let (status, body) = app.get(&format!("/orders/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = TestApp::new().await;

    let (status, _) = app.get("/admin/escalations", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.get("/admin/escalations", Some("not-a-jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.get("/admin/escalations", Some(&token("CUSTOMER"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.get("/admin/escalations", Some(&token("SUPER_ADMIN"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_fulfilment_and_escalation_resolution() {
    let app = TestApp::new().await;
    let admin = token("ADMIN");
    let (order_id, intent_id) = app.place_order().await;

    // Shipping a pending order is not a valid step
    let (status, _) = app
        .post(
            &format!("/admin/orders/{}/fulfilment", order_id),
            json!({ "step": "shipped" }),
            Some(&admin),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Captured for the wrong amount: escalated, order untouched
    let event = payment_event("evt_short", "payment_intent.succeeded", &intent_id, &order_id, 100);
    let (_, ack) = app.deliver(&event).await;
    assert_eq!(ack["outcome"]["result"], "escalated");
    let escalation_id = ack["outcome"]["escalation_id"].as_str().unwrap().to_string();

    let uri = format!("/admin/escalations/{}/resolve", escalation_id);
    let (status, _) = app.post(&uri, json!({ "note": "  " }), Some(&admin)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app.post(&uri, json!({ "note": "Refunded by hand" }), Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resolved"], true);

    let (status, _) = app.post(&uri, json!({ "note": "again" }), Some(&admin)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, open) = app.get("/admin/escalations", Some(&admin)).await;
    assert_eq!(open, json!([]));
    let (_, all) = app.get("/admin/escalations?include_resolved=true", Some(&admin)).await;
    assert_eq!(all.as_array().unwrap().len(), 1);
    assert!(all[0]["resolution_note"].as_str().unwrap().contains("ops-1"));
}

#[tokio::test]
async fn test_unsettled_payout_manual_dispatch() {
    let app = TestApp::new().await;
    let admin = token("ADMIN");

    // Vendor B's account was closed; the first attempt is rejected outright
    app.gateway
        .fail_transfers_to("acct_b", [GatewayError::Rejected("account closed".into())]);

    let (order_id, intent_id) = app.place_order().await;
    let event = payment_event("evt_paid", "payment_intent.succeeded", &intent_id, &order_id, 5474);
    app.deliver(&event).await;

    let mut payouts = Value::Null;
    for _ in 0..100 {
        let (_, body) = app.get(&format!("/admin/orders/{}/payouts", order_id), Some(&admin)).await;
        let done = body
            .as_array()
            .unwrap()
            .iter()
            .all(|p| p["status"] == "settled" || p["status"] == "unsettled");
        payouts = body;
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let unsettled: Vec<&Value> = payouts
        .as_array()
        .unwrap()
        .iter()
        .filter(|p| p["status"] == "unsettled")
        .collect();
    assert_eq!(unsettled.len(), 1);
    assert_eq!(unsettled[0]["destination_account"], "acct_b");
    let payout_id = unsettled[0]["id"].as_str().unwrap().to_string();

    let (_, open) = app.get("/admin/escalations", Some(&admin)).await;
    assert_eq!(open[0]["kind"]["kind"], "unsettled_payout");

    let (status, outcome) = app
        .post(&format!("/admin/payouts/{}/dispatch", payout_id), json!({}), Some(&admin))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "settled");

    let (_, open) = app.get("/admin/escalations", Some(&admin)).await;
    assert_eq!(open, json!([]));

    // Nothing left to retry
    let (status, _) = app
        .post(&format!("/admin/payouts/{}/dispatch", payout_id), json!({}), Some(&admin))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new().await;
    let (status, body) = app.get("/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "not_configured");
}
