use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Func};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use super::{
    order_not_found, OrderFilter, OrderRepository, OrderUpdate, Page, Transition, TransitionGuard,
};
use crate::entities::order::{self, Column, Entity as OrderEntity};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::errors::ServiceError;
use crate::models::{Address, Order, OrderLine, OrderStatus, OrderTotals};
use crate::services::pricing::{from_minor_units, to_minor_units};

/// Orders in the `orders` and `order_items` tables.
#[derive(Debug, Clone)]
pub struct SeaOrmOrderRepository {
    db: Arc<DatabaseConnection>,
}

fn encode_address(address: &Address) -> Result<String, ServiceError> {
    serde_json::to_string(address)
        .map_err(|e| ServiceError::InternalError(format!("address encoding failed: {}", e)))
}

fn decode_address(raw: &str) -> Result<Address, ServiceError> {
    serde_json::from_str(raw)
        .map_err(|e| ServiceError::InternalError(format!("stored address is corrupt: {}", e)))
}

impl SeaOrmOrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn to_order(
        model: order::Model,
        mut items: Vec<order_item::Model>,
    ) -> Result<Order, ServiceError> {
        items.sort_by_key(|item| item.line_no);
        let items = items
            .into_iter()
            .map(|item| OrderLine {
                product_id: item.product_id,
                name: item.name,
                size: item.size,
                sku: item.sku,
                quantity: item.quantity.max(0) as u32,
                unit_price: from_minor_units(item.unit_price_cents),
            })
            .collect();

        Ok(Order {
            id: model.id,
            order_number: model.order_number,
            customer_id: model.customer_id,
            items,
            totals: OrderTotals {
                subtotal: from_minor_units(model.subtotal_cents),
                tax: from_minor_units(model.tax_cents),
                shipping: from_minor_units(model.shipping_cents),
                total: from_minor_units(model.total_cents),
            },
            status: model.status,
            payment_status: model.payment_status,
            payment_method: model.payment_method,
            payment_intent_id: model.payment_intent_id,
            shipping_address: decode_address(&model.shipping_address)?,
            billing_address: decode_address(&model.billing_address)?,
            tracking_number: model.tracking_number,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }

    /// Loads the line items of every order in `models` with one query.
    async fn hydrate(&self, models: Vec<order::Model>) -> Result<Vec<Order>, ServiceError> {
        if models.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = models.iter().map(|m| m.id).collect();
        let rows = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.is_in(ids))
            .all(self.db.as_ref())
            .await
            .map_err(ServiceError::DatabaseError)?;

        let mut by_order: HashMap<Uuid, Vec<order_item::Model>> = HashMap::new();
        for row in rows {
            by_order.entry(row.order_id).or_default().push(row);
        }

        models
            .into_iter()
            .map(|model| {
                let items = by_order.remove(&model.id).unwrap_or_default();
                Self::to_order(model, items)
            })
            .collect()
    }

    fn filter_condition(filter: &OrderFilter) -> Condition {
        let mut condition = Condition::all();
        if let Some(customer_id) = &filter.customer_id {
            condition = condition.add(Column::CustomerId.eq(customer_id.clone()));
        }
        if let Some(status) = filter.status {
            condition = condition.add(Column::Status.eq(status));
        }
        condition
    }
}

#[async_trait]
impl OrderRepository for SeaOrmOrderRepository {
    async fn insert(&self, order: &Order) -> Result<(), ServiceError> {
        let header = order::ActiveModel {
            id: Set(order.id),
            order_number: Set(order.order_number.clone()),
            customer_id: Set(order.customer_id.clone()),
            status: Set(order.status),
            payment_status: Set(order.payment_status),
            payment_method: Set(order.payment_method),
            payment_intent_id: Set(order.payment_intent_id.clone()),
            subtotal_cents: Set(to_minor_units(order.totals.subtotal)?),
            tax_cents: Set(to_minor_units(order.totals.tax)?),
            shipping_cents: Set(to_minor_units(order.totals.shipping)?),
            total_cents: Set(to_minor_units(order.totals.total)?),
            shipping_address: Set(encode_address(&order.shipping_address)?),
            billing_address: Set(encode_address(&order.billing_address)?),
            tracking_number: Set(order.tracking_number.clone()),
            created_at: Set(order.created_at),
            updated_at: Set(order.updated_at),
        };

        let mut lines = Vec::with_capacity(order.items.len());
        for (index, item) in order.items.iter().enumerate() {
            lines.push(order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                line_no: Set(index as i32),
                product_id: Set(item.product_id),
                name: Set(item.name.clone()),
                size: Set(item.size.clone()),
                sku: Set(item.sku.clone()),
                quantity: Set(item.quantity as i32),
                unit_price_cents: Set(to_minor_units(item.unit_price)?),
            });
        }

        let txn = self.db.begin().await.map_err(ServiceError::DatabaseError)?;
        OrderEntity::insert(header)
            .exec_without_returning(&txn)
            .await
            .map_err(|e| {
                error!(order_id = %order.id, "Failed to insert order: {}", e);
                ServiceError::DatabaseError(e)
            })?;
        if !lines.is_empty() {
            OrderItemEntity::insert_many(lines)
                .exec_without_returning(&txn)
                .await
                .map_err(ServiceError::DatabaseError)?;
        }
        txn.commit().await.map_err(ServiceError::DatabaseError)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Order>, ServiceError> {
        let Some(model) = OrderEntity::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(ServiceError::DatabaseError)?
        else {
            return Ok(None);
        };
        Ok(self.hydrate(vec![model]).await?.pop())
    }

    async fn list(
        &self,
        filter: &OrderFilter,
        page: u64,
        limit: u64,
    ) -> Result<Page<Order>, ServiceError> {
        let paginator = OrderEntity::find()
            .filter(Self::filter_condition(filter))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .paginate(self.db.as_ref(), limit.max(1));

        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let models = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok(Page {
            items: self.hydrate(models).await?,
            total,
            page,
            limit,
        })
    }

    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Order>, ServiceError> {
        let models = OrderEntity::find()
            .filter(Column::Status.eq(OrderStatus::Pending))
            .filter(Column::CreatedAt.lt(cutoff))
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(ServiceError::DatabaseError)?;
        self.hydrate(models).await
    }

    async fn transition(
        &self,
        id: Uuid,
        guard: &TransitionGuard,
        update: &OrderUpdate,
    ) -> Result<Transition, ServiceError> {
        let mut statement = OrderEntity::update_many()
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(id));

        if let Some(status) = guard.status {
            statement = statement.filter(Column::Status.eq(status));
        }
        if let Some(payment_status) = guard.payment_status {
            statement = statement.filter(Column::PaymentStatus.eq(payment_status));
        }
        if guard.intent_absent {
            statement = statement.filter(Column::PaymentIntentId.is_null());
        }

        if let Some(status) = update.status {
            statement = statement.col_expr(Column::Status, Expr::value(status));
        }
        if let Some(payment_status) = update.payment_status {
            statement = statement.col_expr(Column::PaymentStatus, Expr::value(payment_status));
        }
        if let Some(intent) = &update.payment_intent_id {
            // first writer wins
            statement = statement.col_expr(
                Column::PaymentIntentId,
                Func::coalesce([
                    Expr::col(Column::PaymentIntentId).into(),
                    Expr::value(intent.clone()),
                ])
                .into(),
            );
        }
        if let Some(tracking) = &update.tracking_number {
            statement = statement.col_expr(Column::TrackingNumber, Expr::value(tracking.clone()));
        }

        let result = statement
            .exec(self.db.as_ref())
            .await
            .map_err(ServiceError::DatabaseError)?;

        let current = self.find(id).await?.ok_or_else(|| order_not_found(id))?;
        if result.rows_affected == 1 {
            Ok(Transition::Applied(current))
        } else {
            Ok(Transition::Rejected(current))
        }
    }
}
