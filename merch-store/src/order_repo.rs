use async_trait::async_trait;
use chrono::{DateTime, Utc};
use merch_catalog::{AccountUpdate, InventoryError, InventoryLedger, ProductCategory, VariantSelection};
use merch_order::reports::TOP_PRODUCTS;
use merch_order::{
    CustomerContact, Escalation, Order, OrderFilter, OrderItem, OrderRepository, OrderStatus, OrderSummary,
    OrderTransaction, PaymentStatus, Payout, ProductSales, RepoError, RepoResult, Shipment, ShippingAddress,
    VendorOrderSummary, VendorSales, VendorSplit,
};
use merch_shared::{Masked, Money, Rate};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::database::storage_error;
use crate::settlement_repo::{insert_payout, upsert_escalation};

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ORDER_COLUMNS: &str = r#"
    id, order_number, customer_email, customer_name, user_id, shipping_address,
    subtotal, shipping_cost, shipping_method, tax_amount, platform_fee, total_amount, currency,
    status, payment_status, payment_intent_id, client_secret, checkout_key, version,
    carrier, tracking_number, created_at, updated_at, confirmed_at, shipped_at, delivered_at, cancelled_at
"#;

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    customer_email: String,
    customer_name: Option<String>,
    user_id: Option<String>,
    shipping_address: Json<ShippingAddress>,
    subtotal: i64,
    shipping_cost: i64,
    shipping_method: String,
    tax_amount: i64,
    platform_fee: i64,
    total_amount: i64,
    currency: String,
    status: String,
    payment_status: String,
    payment_intent_id: Option<String>,
    client_secret: Option<String>,
    checkout_key: Option<String>,
    version: i64,
    carrier: Option<String>,
    tracking_number: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    shipped_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    vendor_id: Uuid,
    product_title: String,
    category: String,
    variant: Json<VariantSelection>,
    quantity: i32,
    unit_price: i64,
    total_price: i64,
    vendor_payout: i64,
}

#[derive(sqlx::FromRow)]
struct SplitRow {
    vendor_id: Uuid,
    destination_account: String,
    commission_rate_bps: i32,
    subtotal: i64,
    platform_fee: i64,
    vendor_payout: i64,
}

fn corrupt(what: &str, value: &str) -> RepoError {
    RepoError::Storage(format!("unreadable {} '{}'", what, value))
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItemRow>, splits: Vec<SplitRow>) -> RepoResult<Order> {
        let status = OrderStatus::parse(&self.status).ok_or_else(|| corrupt("order status", &self.status))?;
        let payment_status =
            PaymentStatus::parse(&self.payment_status).ok_or_else(|| corrupt("payment status", &self.payment_status))?;

        let items = items
            .into_iter()
            .map(|row| {
                let category = ProductCategory::parse(&row.category).ok_or_else(|| corrupt("category", &row.category))?;
                Ok(OrderItem {
                    id: row.id,
                    order_id: row.order_id,
                    product_id: row.product_id,
                    vendor_id: row.vendor_id,
                    product_title: row.product_title,
                    category,
                    variant: row.variant.0,
                    quantity: row.quantity.max(0) as u32,
                    unit_price: Money::from_minor(row.unit_price),
                    total_price: Money::from_minor(row.total_price),
                    vendor_payout: Money::from_minor(row.vendor_payout),
                })
            })
            .collect::<RepoResult<Vec<_>>>()?;

        let vendor_splits = splits
            .into_iter()
            .map(|row| VendorSplit {
                vendor_id: row.vendor_id,
                destination_account: row.destination_account,
                commission_rate: Rate::from_basis_points(row.commission_rate_bps.max(0) as u32),
                subtotal: Money::from_minor(row.subtotal),
                platform_fee: Money::from_minor(row.platform_fee),
                vendor_payout: Money::from_minor(row.vendor_payout),
            })
            .collect();

        let shipment = (self.carrier.is_some() || self.tracking_number.is_some()).then(|| Shipment {
            carrier: self.carrier,
            tracking_number: self.tracking_number,
        });

        Ok(Order {
            id: self.id,
            order_number: self.order_number,
            customer: CustomerContact {
                email: Masked(self.customer_email),
                name: self.customer_name,
                user_id: self.user_id,
            },
            shipping_address: self.shipping_address.0,
            subtotal: Money::from_minor(self.subtotal),
            shipping_cost: Money::from_minor(self.shipping_cost),
            shipping_method: self.shipping_method,
            tax_amount: Money::from_minor(self.tax_amount),
            platform_fee: Money::from_minor(self.platform_fee),
            total_amount: Money::from_minor(self.total_amount),
            currency: self.currency,
            status,
            payment_status,
            payment_intent_id: self.payment_intent_id,
            client_secret: self.client_secret,
            checkout_key: self.checkout_key,
            version: self.version,
            items,
            vendor_splits,
            shipment,
            created_at: self.created_at,
            updated_at: self.updated_at,
            confirmed_at: self.confirmed_at,
            shipped_at: self.shipped_at,
            delivered_at: self.delivered_at,
            cancelled_at: self.cancelled_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderSummaryRow {
    id: Uuid,
    order_number: String,
    status: String,
    payment_status: String,
    total_amount: i64,
    currency: String,
    item_count: i64,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct VendorOrderRow {
    id: Uuid,
    order_number: String,
    status: String,
    payment_status: String,
    item_count: i64,
    quantity: i64,
    subtotal: i64,
    vendor_payout: i64,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SalesTotalsRow {
    orders: i64,
    items_sold: i64,
    revenue: i64,
    vendor_payout: i64,
    first_sale_at: Option<DateTime<Utc>>,
    last_sale_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ProductSalesRow {
    product_id: Uuid,
    product_title: String,
    quantity: i64,
    revenue: i64,
    orders: i64,
}

fn statuses(status: &str, payment_status: &str) -> RepoResult<(OrderStatus, PaymentStatus)> {
    Ok((
        OrderStatus::parse(status).ok_or_else(|| corrupt("order status", status))?,
        PaymentStatus::parse(payment_status).ok_or_else(|| corrupt("payment status", payment_status))?,
    ))
}

fn count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

// Sales only count paid orders that were not cancelled
const SALE_PREDICATE: &str = "o.payment_status = 'paid' AND o.status <> 'cancelled'";

/// Load an order with its lines. `lock` takes the row lock for the rest of
/// the enclosing transaction.
async fn fetch_order(conn: &mut PgConnection, order_id: Uuid, lock: bool) -> RepoResult<Option<Order>> {
    let sql = format!(
        "SELECT {} FROM orders WHERE id = $1{}",
        ORDER_COLUMNS,
        if lock { " FOR UPDATE" } else { "" }
    );
    let Some(row) = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?
    else {
        return Ok(None);
    };

    let items = sqlx::query_as::<_, OrderItemRow>(
        r#"
        SELECT id, order_id, product_id, vendor_id, product_title, category, variant,
               quantity, unit_price, total_price, vendor_payout
        FROM order_items
        WHERE order_id = $1
        ORDER BY line_number
        "#,
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(storage_error)?;

    let splits = sqlx::query_as::<_, SplitRow>(
        r#"
        SELECT vendor_id, destination_account, commission_rate_bps, subtotal, platform_fee, vendor_payout
        FROM order_vendor_splits
        WHERE order_id = $1
        ORDER BY vendor_id
        "#,
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(storage_error)?;

    row.into_order(items, splits).map(Some)
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn begin(&self) -> RepoResult<Box<dyn OrderTransaction>> {
        let tx = self.pool.begin().await.map_err(storage_error)?;
        Ok(Box::new(PgOrderTransaction { tx }))
    }

    async fn get_order(&self, order_id: Uuid) -> RepoResult<Option<Order>> {
        let mut conn = self.pool.acquire().await.map_err(storage_error)?;
        fetch_order(&mut conn, order_id, false).await
    }

    async fn find_by_checkout_key(&self, checkout_key: &str) -> RepoResult<Option<Order>> {
        let mut conn = self.pool.acquire().await.map_err(storage_error)?;
        let order_id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM orders WHERE checkout_key = $1")
            .bind(checkout_key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage_error)?;

        match order_id {
            Some(id) => fetch_order(&mut conn, id, false).await,
            None => Ok(None),
        }
    }

    async fn attach_payment_intent(&self, order_id: Uuid, intent_id: &str, client_secret: &str) -> RepoResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET payment_intent_id = $2, client_secret = $3, version = version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(intent_id)
        .bind(client_secret)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("order {}", order_id)));
        }
        Ok(())
    }

    async fn customer_orders(&self, user_id: &str, filter: &OrderFilter) -> RepoResult<Vec<OrderSummary>> {
        let rows = sqlx::query_as::<_, OrderSummaryRow>(
            r#"
            SELECT o.id, o.order_number, o.status, o.payment_status, o.total_amount, o.currency, o.created_at,
                   (SELECT COUNT(*) FROM order_items i WHERE i.order_id = o.id) AS item_count
            FROM orders o
            WHERE o.user_id = $1
              AND ($2::text IS NULL OR o.status = $2)
              AND ($3::text IS NULL OR o.payment_status = $3)
            ORDER BY o.created_at DESC, o.id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(user_id)
        .bind(filter.status.map(OrderStatus::as_str))
        .bind(filter.payment_status.map(PaymentStatus::as_str))
        .bind(i64::from(filter.page_size()))
        .bind(filter.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter()
            .map(|row| {
                let (status, payment_status) = statuses(&row.status, &row.payment_status)?;
                Ok(OrderSummary {
                    order_id: row.id,
                    order_number: row.order_number,
                    status,
                    payment_status,
                    total_amount: Money::from_minor(row.total_amount),
                    currency: row.currency,
                    item_count: count(row.item_count),
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn vendor_orders(&self, vendor_id: Uuid, filter: &OrderFilter) -> RepoResult<Vec<VendorOrderSummary>> {
        let rows = sqlx::query_as::<_, VendorOrderRow>(
            r#"
            SELECT o.id, o.order_number, o.status, o.payment_status, o.created_at,
                   COUNT(i.id) AS item_count,
                   SUM(i.quantity)::BIGINT AS quantity,
                   SUM(i.total_price)::BIGINT AS subtotal,
                   SUM(i.vendor_payout)::BIGINT AS vendor_payout
            FROM orders o
            JOIN order_items i ON i.order_id = o.id
            WHERE i.vendor_id = $1
              AND ($2::text IS NULL OR o.status = $2)
              AND ($3::text IS NULL OR o.payment_status = $3)
            GROUP BY o.id
            ORDER BY o.created_at DESC, o.id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(vendor_id)
        .bind(filter.status.map(OrderStatus::as_str))
        .bind(filter.payment_status.map(PaymentStatus::as_str))
        .bind(i64::from(filter.page_size()))
        .bind(filter.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter()
            .map(|row| {
                let (status, payment_status) = statuses(&row.status, &row.payment_status)?;
                Ok(VendorOrderSummary {
                    order_id: row.id,
                    order_number: row.order_number,
                    status,
                    payment_status,
                    item_count: count(row.item_count),
                    quantity: count(row.quantity),
                    subtotal: Money::from_minor(row.subtotal),
                    vendor_payout: Money::from_minor(row.vendor_payout),
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn vendor_sales(&self, vendor_id: Uuid) -> RepoResult<VendorSales> {
        let mut conn = self.pool.acquire().await.map_err(storage_error)?;

        let totals_sql = format!(
            r#"
            SELECT COUNT(DISTINCT o.id) AS orders,
                   COALESCE(SUM(i.quantity), 0)::BIGINT AS items_sold,
                   COALESCE(SUM(i.total_price), 0)::BIGINT AS revenue,
                   COALESCE(SUM(i.vendor_payout), 0)::BIGINT AS vendor_payout,
                   MIN(o.created_at) AS first_sale_at,
                   MAX(o.created_at) AS last_sale_at
            FROM order_items i
            JOIN orders o ON o.id = i.order_id
            WHERE i.vendor_id = $1 AND {}
            "#,
            SALE_PREDICATE
        );
        let totals = sqlx::query_as::<_, SalesTotalsRow>(&totals_sql)
            .bind(vendor_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(storage_error)?;

        let products_sql = format!(
            r#"
            SELECT i.product_id,
                   MAX(i.product_title) AS product_title,
                   SUM(i.quantity)::BIGINT AS quantity,
                   SUM(i.total_price)::BIGINT AS revenue,
                   COUNT(DISTINCT i.order_id) AS orders
            FROM order_items i
            JOIN orders o ON o.id = i.order_id
            WHERE i.vendor_id = $1 AND {}
            GROUP BY i.product_id
            ORDER BY quantity DESC, revenue DESC, product_title
            LIMIT $2
            "#,
            SALE_PREDICATE
        );
        let products = sqlx::query_as::<_, ProductSalesRow>(&products_sql)
            .bind(vendor_id)
            .bind(TOP_PRODUCTS as i64)
            .fetch_all(&mut *conn)
            .await
            .map_err(storage_error)?;

        Ok(VendorSales {
            vendor_id,
            orders: totals.orders.max(0) as u64,
            items_sold: totals.items_sold.max(0) as u64,
            revenue: Money::from_minor(totals.revenue),
            vendor_payout: Money::from_minor(totals.vendor_payout),
            first_sale_at: totals.first_sale_at,
            last_sale_at: totals.last_sale_at,
            top_products: products
                .into_iter()
                .map(|row| ProductSales {
                    product_id: row.product_id,
                    product_title: row.product_title,
                    quantity: row.quantity.max(0) as u64,
                    revenue: Money::from_minor(row.revenue),
                    orders: row.orders.max(0) as u64,
                })
                .collect(),
        })
    }
}

pub struct PgOrderTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl InventoryLedger for PgOrderTransaction {
    async fn conditional_decrement(&mut self, product_id: Uuid, quantity: u32) -> Result<bool, InventoryError> {
        let Ok(quantity) = i32::try_from(quantity) else {
            return Ok(false);
        };
        let result = sqlx::query(
            r#"
            UPDATE products
            SET inventory_count = inventory_count - $2
            WHERE id = $1 AND inventory_count >= $2
            "#,
        )
        .bind(product_id)
        .bind(quantity)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| InventoryError::Storage(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn increment(&mut self, product_id: Uuid, quantity: u32) -> Result<(), InventoryError> {
        let quantity = i32::try_from(quantity).map_err(|e| InventoryError::Storage(e.to_string()))?;
        let result = sqlx::query("UPDATE products SET inventory_count = inventory_count + $2 WHERE id = $1")
            .bind(product_id)
            .bind(quantity)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| InventoryError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(InventoryError::NotFound(product_id));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderTransaction for PgOrderTransaction {
    async fn insert_order(&mut self, order: &Order) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, order_number, customer_email, customer_name, user_id, shipping_address,
                subtotal, shipping_cost, shipping_method, tax_amount, platform_fee, total_amount, currency,
                status, payment_status, payment_intent_id, client_secret, checkout_key, version,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(order.id)
        .bind(&order.order_number)
        .bind(order.customer.email.expose())
        .bind(&order.customer.name)
        .bind(&order.customer.user_id)
        .bind(Json(&order.shipping_address))
        .bind(order.subtotal.minor_units())
        .bind(order.shipping_cost.minor_units())
        .bind(&order.shipping_method)
        .bind(order.tax_amount.minor_units())
        .bind(order.platform_fee.minor_units())
        .bind(order.total_amount.minor_units())
        .bind(&order.currency)
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(&order.payment_intent_id)
        .bind(&order.client_secret)
        .bind(&order.checkout_key)
        .bind(order.version)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        for (line_number, item) in order.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (
                    id, order_id, line_number, product_id, vendor_id, product_title, category, variant,
                    quantity, unit_price, total_price, vendor_payout
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(item.id)
            .bind(order.id)
            .bind(line_number as i32)
            .bind(item.product_id)
            .bind(item.vendor_id)
            .bind(&item.product_title)
            .bind(item.category.as_str())
            .bind(Json(&item.variant))
            .bind(item.quantity as i32)
            .bind(item.unit_price.minor_units())
            .bind(item.total_price.minor_units())
            .bind(item.vendor_payout.minor_units())
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        }

        for split in &order.vendor_splits {
            sqlx::query(
                r#"
                INSERT INTO order_vendor_splits (
                    order_id, vendor_id, destination_account, commission_rate_bps,
                    subtotal, platform_fee, vendor_payout
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(order.id)
            .bind(split.vendor_id)
            .bind(&split.destination_account)
            .bind(split.commission_rate.basis_points() as i32)
            .bind(split.subtotal.minor_units())
            .bind(split.platform_fee.minor_units())
            .bind(split.vendor_payout.minor_units())
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        }

        Ok(())
    }

    async fn lock_order(&mut self, order_id: Uuid) -> RepoResult<Option<Order>> {
        fetch_order(&mut self.tx, order_id, true).await
    }

    async fn update_order(&mut self, order: &Order) -> RepoResult<()> {
        let (carrier, tracking_number) = match &order.shipment {
            Some(s) => (s.carrier.clone(), s.tracking_number.clone()),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3, payment_status = $4, payment_intent_id = $5,
                carrier = $6, tracking_number = $7, updated_at = $8,
                confirmed_at = $9, shipped_at = $10, delivered_at = $11, cancelled_at = $12,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(order.id)
        .bind(order.version)
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(&order.payment_intent_id)
        .bind(carrier)
        .bind(tracking_number)
        .bind(order.updated_at)
        .bind(order.confirmed_at)
        .bind(order.shipped_at)
        .bind(order.delivered_at)
        .bind(order.cancelled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(format!(
                "order {} changed since version {}",
                order.id, order.version
            )));
        }
        Ok(())
    }

    async fn clear_cart(&mut self, owner: &str) -> RepoResult<u64> {
        let result = sqlx::query("DELETE FROM cart_items WHERE owner = $1")
            .bind(owner)
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected())
    }

    async fn record_event(&mut self, event_id: &str, event_type: &str) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_payouts(&mut self, payouts: &[Payout]) -> RepoResult<()> {
        for payout in payouts {
            insert_payout(&mut self.tx, payout).await?;
        }
        Ok(())
    }

    async fn void_pending_payouts(&mut self, order_id: Uuid, now: DateTime<Utc>) -> RepoResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payouts
            SET status = 'voided', next_attempt_at = NULL, lease_expires_at = NULL, updated_at = $2
            WHERE order_id = $1 AND status IN ('pending', 'retry_scheduled', 'in_flight')
            "#,
        )
        .bind(order_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_error)?;
        Ok(result.rows_affected())
    }

    async fn insert_escalation(&mut self, escalation: &Escalation) -> RepoResult<bool> {
        upsert_escalation(&mut self.tx, escalation).await
    }

    async fn apply_account_update(&mut self, update: &AccountUpdate) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE vendors
            SET charges_enabled = $2, payouts_enabled = $3, details_submitted = $4, updated_at = NOW()
            WHERE external_account_id = $1
            "#,
        )
        .bind(&update.external_account_id)
        .bind(update.charges_enabled)
        .bind(update.payouts_enabled)
        .bind(update.details_submitted)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> RepoResult<()> {
        self.tx.commit().await.map_err(storage_error)
    }

    async fn rollback(self: Box<Self>) -> RepoResult<()> {
        self.tx.rollback().await.map_err(storage_error)
    }
}
