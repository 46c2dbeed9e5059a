//! `PostgreSQL` implementation of [`Store`].
//!
//! Units of work are sqlx transactions. Orders and carts are locked with
//! `SELECT ... FOR UPDATE`; stock is decremented with a conditional update so
//! the `stock >= 0` check and the write are one statement.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};

use kiosk_core::{
    CartId, CartItemId, OrderId, OrderItemId, OrderStatus, PaymentStatus, Price, ProductId, UserId,
};

use super::{RepositoryError, Store, UnitOfWork};
use crate::models::{
    Cart, CartLine, Customer, Order, OrderFilter, OrderItem, OrderStateUpdate, Product,
};

/// Embedded schema migrations (`crates/server/migrations`).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const ORDER_COLUMNS: &str = "id, user_id, total, status, payment_status, preference_id, \
     payment_id, shipping_address, notes, created_at, updated_at";

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

// =============================================================================
// Internal Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: OrderId,
    user_id: UserId,
    total: Decimal,
    status: OrderStatus,
    payment_status: PaymentStatus,
    preference_id: Option<String>,
    payment_id: Option<String>,
    shipping_address: Option<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderItemRow {
    id: OrderItemId,
    order_id: OrderId,
    product_id: ProductId,
    product_name: String,
    quantity: i32,
    unit_price: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: ProductId,
    name: String,
    description: Option<String>,
    price: Decimal,
    stock: i32,
    active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: UserId,
    name: String,
    email: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CartLineRow {
    item_id: CartItemId,
    quantity: i32,
    product_id: ProductId,
    name: String,
    description: Option<String>,
    price: Decimal,
    stock: i32,
    active: bool,
}

fn price(amount: Decimal, column: &str) -> Result<Price, RepositoryError> {
    Price::new(amount).map_err(|e| RepositoryError::DataCorruption(format!("{column}: {e}")))
}

impl TryFrom<ProductRow> for Product {
    type Error = RepositoryError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            description: row.description,
            price: price(row.price, "products.price")?,
            stock: row.stock,
            active: row.active,
        })
    }
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            email: row.email,
        }
    }
}

impl TryFrom<CartLineRow> for CartLine {
    type Error = RepositoryError;

    fn try_from(row: CartLineRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.item_id,
            quantity: row.quantity,
            product: Product {
                id: row.product_id,
                name: row.name,
                description: row.description,
                price: price(row.price, "products.price")?,
                stock: row.stock,
                active: row.active,
            },
        })
    }
}

/// Attach items to their orders, keeping the order of `rows`.
fn assemble_orders(
    rows: Vec<OrderRow>,
    items: Vec<OrderItemRow>,
) -> Result<Vec<Order>, RepositoryError> {
    let mut items_by_order: HashMap<OrderId, Vec<OrderItem>> = HashMap::new();
    for item in items {
        items_by_order
            .entry(item.order_id)
            .or_default()
            .push(OrderItem {
                id: item.id,
                product_id: item.product_id,
                product_name: item.product_name,
                quantity: item.quantity,
                unit_price: price(item.unit_price, "order_items.unit_price")?,
            });
    }

    rows.into_iter()
        .map(|row| {
            Ok(Order {
                items: items_by_order.remove(&row.id).unwrap_or_default(),
                id: row.id,
                user_id: row.user_id,
                total: price(row.total, "orders.total")?,
                status: row.status,
                payment_status: row.payment_status,
                preference_id: row.preference_id,
                payment_id: row.payment_id,
                shipping_address: row.shipping_address,
                notes: row.notes,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
        })
        .collect()
}

async fn load_items<'e, E: PgExecutor<'e>>(
    executor: E,
    order_ids: &[OrderId],
) -> Result<Vec<OrderItemRow>, RepositoryError> {
    let ids: Vec<uuid::Uuid> = order_ids.iter().map(OrderId::as_uuid).collect();
    let rows = sqlx::query_as::<_, OrderItemRow>(
        r"
        SELECT id, order_id, product_id, product_name, quantity, unit_price
        FROM order_items
        WHERE order_id = ANY($1)
        ORDER BY product_name, id
        ",
    )
    .bind(ids)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

fn map_unique_violation(err: sqlx::Error, message: impl FnOnce() -> String) -> RepositoryError {
    let unique_violation =
        matches!(&err, sqlx::Error::Database(db_err) if db_err.is_unique_violation());
    if unique_violation {
        RepositoryError::Conflict(message())
    } else {
        RepositoryError::Database(err)
    }
}

// =============================================================================
// Store
// =============================================================================

/// [`Store`] backed by a `PostgreSQL` pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, RepositoryError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let items = load_items(&self.pool, &[id]).await?;
        Ok(assemble_orders(vec![row], items)?.pop())
    }

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, description, price, stock, active FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Product::try_from)
        .transpose()
    }

    async fn find_customer(&self, id: UserId) -> Result<Option<Customer>, RepositoryError> {
        let row = sqlx::query_as::<_, CustomerRow>("SELECT id, name, email FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Customer::from))
    }

    async fn list_user_orders(
        &self,
        user_id: UserId,
        filter: &OrderFilter,
    ) -> Result<(Vec<Order>, u64), RepositoryError> {
        let total: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*)
            FROM orders
            WHERE user_id = $1 AND ($2::order_status IS NULL OR status = $2)
            ",
        )
        .bind(user_id)
        .bind(filter.status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            r"
            SELECT {ORDER_COLUMNS}
            FROM orders
            WHERE user_id = $1 AND ($2::order_status IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "
        ))
        .bind(user_id)
        .bind(filter.status)
        .bind(i64::from(filter.limit()))
        .bind(i64::try_from(filter.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<OrderId> = rows.iter().map(|row| row.id).collect();
        let items = load_items(&self.pool, &ids).await?;
        let orders = assemble_orders(rows, items)?;
        Ok((orders, u64::try_from(total).unwrap_or_default()))
    }

    async fn find_expired_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OrderId>, RepositoryError> {
        let ids = sqlx::query_scalar::<_, OrderId>(
            r"
            SELECT id
            FROM orders
            WHERE status = 'pending' AND payment_status = 'pending' AND created_at < $1
            ORDER BY created_at
            ",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn set_preference_id(
        &self,
        order_id: OrderId,
        preference_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE orders SET preference_id = $2, updated_at = $3 WHERE id = $1")
                .bind(order_id)
                .bind(preference_id)
                .bind(updated_at)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

// =============================================================================
// Unit of work
// =============================================================================

struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let items = load_items(&mut *self.tx, &[id]).await?;
        Ok(assemble_orders(vec![row], items)?.pop())
    }

    async fn lock_cart(&mut self, user_id: UserId) -> Result<Cart, RepositoryError> {
        sqlx::query("INSERT INTO carts (id, user_id) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING")
            .bind(CartId::new())
            .bind(user_id)
            .execute(&mut *self.tx)
            .await?;

        let cart_id = sqlx::query_scalar::<_, CartId>(
            "SELECT id FROM carts WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await?;

        let lines = sqlx::query_as::<_, CartLineRow>(
            r"
            SELECT ci.id AS item_id, ci.quantity,
                   p.id AS product_id, p.name, p.description, p.price, p.stock, p.active
            FROM cart_items ci
            JOIN products p ON p.id = ci.product_id
            WHERE ci.cart_id = $1
            ORDER BY ci.created_at, ci.id
            ",
        )
        .bind(cart_id)
        .fetch_all(&mut *self.tx)
        .await?
        .into_iter()
        .map(CartLine::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Cart {
            id: cart_id,
            user_id,
            lines,
        })
    }

    async fn lock_product(&mut self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, description, price, stock, active FROM products WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Product::try_from)
        .transpose()
    }

    async fn find_unpaid_order(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<OrderId>, RepositoryError> {
        let id = sqlx::query_scalar::<_, OrderId>(
            r"
            SELECT id
            FROM orders
            WHERE user_id = $1 AND status = 'pending' AND payment_status = 'pending'
            LIMIT 1
            ",
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn upsert_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartItemId, RepositoryError> {
        let id = sqlx::query_scalar::<_, CartItemId>(
            r"
            INSERT INTO cart_items (id, cart_id, product_id, quantity)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (cart_id, product_id) DO UPDATE SET quantity = EXCLUDED.quantity
            RETURNING id
            ",
        )
        .bind(CartItemId::new())
        .bind(cart_id)
        .bind(product_id)
        .bind(quantity)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn set_cart_item_quantity(
        &mut self,
        item_id: CartItemId,
        quantity: i32,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE cart_items SET quantity = $2 WHERE id = $1")
            .bind(item_id)
            .bind(quantity)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_cart_item(&mut self, item_id: CartItemId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM cart_items WHERE id = $1")
            .bind(item_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn clear_cart(&mut self, user_id: UserId) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM cart_items WHERE cart_id IN (SELECT id FROM carts WHERE user_id = $1)",
        )
        .bind(user_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO orders (id, user_id, total, status, payment_status, preference_id,
                                payment_id, shipping_address, notes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(order.total.amount())
        .bind(order.status)
        .bind(order.payment_status)
        .bind(order.preference_id.as_deref())
        .bind(order.payment_id.as_deref())
        .bind(order.shipping_address.as_deref())
        .bind(order.notes.as_deref())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            map_unique_violation(e, || {
                format!("user {} already has an unpaid order", order.user_id)
            })
        })?;

        for item in &order.items {
            sqlx::query(
                r"
                INSERT INTO order_items (id, order_id, product_id, product_name, quantity, unit_price)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(item.id)
            .bind(order.id)
            .bind(item.product_id)
            .bind(&item.product_name)
            .bind(item.quantity)
            .bind(item.unit_price.amount())
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn decrement_stock(
        &mut self,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE products
            SET stock = stock - $2, updated_at = now()
            WHERE id = $1 AND stock >= $2
            ",
        )
        .bind(product_id)
        .bind(quantity)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn increment_stock(
        &mut self,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE products SET stock = stock + $2, updated_at = now() WHERE id = $1")
                .bind(product_id)
                .bind(quantity)
                .execute(&mut *self.tx)
                .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_order_state(
        &mut self,
        order_id: OrderId,
        update: &OrderStateUpdate,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE orders
            SET status = $2,
                payment_status = $3,
                payment_id = COALESCE($4, payment_id),
                updated_at = $5
            WHERE id = $1
            ",
        )
        .bind(order_id)
        .bind(update.status)
        .bind(update.payment_status)
        .bind(update.payment_id.as_deref())
        .bind(update.updated_at)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        self.tx.commit().await?;
        Ok(())
    }
}
