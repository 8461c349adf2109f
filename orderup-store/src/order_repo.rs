use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orderup_core::{LineItem, Order, OrderStatus, OrderStore, StatusFilter, StoreError};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

/// Postgres-backed order store.
///
/// Duplicate ids are caught by the primary key (`ON CONFLICT DO NOTHING`)
/// inside the insert transaction, and status transitions are a single
/// conditional `UPDATE`, so neither relies on in-process locking.
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct OrderRow {
    id: String,
    customer_email: String,
    status: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct LineItemRow {
    order_id: String,
    description: String,
    unit_price_cents: i64,
    quantity: i64,
}

const GENERATED_ID_ATTEMPTS: usize = 3;

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn parse_status(order_id: &str, raw: &str) -> Result<OrderStatus, StoreError> {
    raw.parse().map_err(|_| {
        StoreError::Backend(format!("order {} has unknown stored status {:?}", order_id, raw))
    })
}

fn assemble(row: OrderRow, items: Vec<LineItemRow>) -> Result<Order, StoreError> {
    let status = parse_status(&row.id, &row.status)?;
    Ok(Order {
        id: row.id,
        customer_email: row.customer_email,
        line_items: items
            .into_iter()
            .map(|item| LineItem {
                description: item.description,
                unit_price_cents: item.unit_price_cents,
                quantity: item.quantity,
            })
            .collect(),
        status,
        created_at: row.created_at,
    })
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn get(&self, id: &str) -> Result<Order, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, customer_email, status, created_at FROM orders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let items = sqlx::query_as::<_, LineItemRow>(
            "SELECT order_id, description, unit_price_cents, quantity FROM line_items WHERE order_id = $1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        assemble(row, items)
    }

    async fn list(&self, filter: StatusFilter) -> Result<Vec<Order>, StoreError> {
        let rows = match filter {
            StatusFilter::Any => {
                sqlx::query_as::<_, OrderRow>(
                    "SELECT id, customer_email, status, created_at FROM orders ORDER BY created_at, id",
                )
                .fetch_all(&self.pool)
                .await
            }
            StatusFilter::Only(status) => {
                sqlx::query_as::<_, OrderRow>(
                    "SELECT id, customer_email, status, created_at FROM orders WHERE status = $1 ORDER BY created_at, id",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(backend)?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let item_rows = sqlx::query_as::<_, LineItemRow>(
            "SELECT order_id, description, unit_price_cents, quantity FROM line_items WHERE order_id = ANY($1) ORDER BY order_id, position",
        )
        .bind(&ids[..])
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut items_by_order: HashMap<String, Vec<LineItemRow>> = HashMap::new();
        for item in item_rows {
            items_by_order.entry(item.order_id.clone()).or_default().push(item);
        }

        rows.into_iter()
            .map(|row| {
                let items = items_by_order.remove(&row.id).unwrap_or_default();
                assemble(row, items)
            })
            .collect()
    }

    async fn insert(&self, order: Order) -> Result<String, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let generated = order.id.is_empty();
        let attempts = if generated { GENERATED_ID_ATTEMPTS } else { 1 };

        let mut stored_id = None;
        for _ in 0..attempts {
            let candidate = if generated {
                Uuid::new_v4().to_string()
            } else {
                order.id.clone()
            };

            let inserted = sqlx::query(
                r#"
                INSERT INTO orders (id, customer_email, status, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&candidate)
            .bind(&order.customer_email)
            .bind(order.status.as_str())
            .bind(order.created_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();

            if inserted == 1 {
                stored_id = Some(candidate);
                break;
            }
        }

        // Dropping `tx` without commit rolls back
        let id = match stored_id {
            Some(id) => id,
            None if generated => {
                return Err(StoreError::Backend("could not allocate a unique order id".to_string()))
            }
            None => return Err(StoreError::AlreadyExists(order.id)),
        };

        for (position, item) in order.line_items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO line_items (order_id, position, description, unit_price_cents, quantity)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&id)
            .bind(position as i32)
            .bind(&item.description)
            .bind(item.unit_price_cents)
            .bind(item.quantity)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;

        Ok(id)
    }

    async fn set_status(&self, id: &str, status: OrderStatus) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?
            .rows_affected();

        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        id: &str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE orders SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3",
        )
        .bind(to.as_str())
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }

        // Nothing matched: either the order is gone or its status moved on
        let current: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match current {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(raw) => Err(StoreError::StatusMismatch {
                id: id.to_string(),
                expected: from,
                actual: parse_status(id, &raw)?,
            }),
        }
    }
}
