use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, warn};

use super::StockStore;
use crate::entities::stock_level::{self, Column, Entity as StockLevelEntity};
use crate::errors::ServiceError;
use crate::models::{StockKey, StockLevel, StockLine, StockShortage};

/// Stock counters in the `stock_levels` table.
///
/// Every decrement is a conditional `UPDATE ... WHERE available >= q`, and a
/// multi-line reservation runs in a single transaction, so a failed line rolls
/// back every earlier decrement before any other connection can observe it.
#[derive(Debug, Clone)]
pub struct SeaOrmStockStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStockStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn to_level(model: stock_level::Model) -> StockLevel {
        StockLevel {
            key: StockKey::from_columns(model.product_id, model.size),
            available: model.available.max(0) as u32,
            sold: model.sold.max(0) as u64,
        }
    }

    async fn find_level<C: ConnectionTrait>(
        conn: &C,
        key: &StockKey,
    ) -> Result<Option<stock_level::Model>, ServiceError> {
        StockLevelEntity::find_by_id((key.product_id, key.size_column().to_string()))
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    async fn insert_if_absent<C: ConnectionTrait>(
        conn: &C,
        key: &StockKey,
        available: u32,
        sold: u64,
    ) -> Result<bool, ServiceError> {
        let row = stock_level::ActiveModel {
            product_id: Set(key.product_id),
            size: Set(key.size_column().to_string()),
            available: Set(to_db_count(available)?),
            sold: Set(sold as i64),
            updated_at: Set(Utc::now()),
        };
        let inserted = StockLevelEntity::insert(row)
            .on_conflict(
                OnConflict::columns([Column::ProductId, Column::Size])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(inserted > 0)
    }
}

fn to_db_count(value: u32) -> Result<i32, ServiceError> {
    i32::try_from(value)
        .map_err(|_| ServiceError::ValidationError(format!("stock count {} is too large", value)))
}

#[async_trait]
impl StockStore for SeaOrmStockStore {
    async fn reserve(&self, lines: &[StockLine]) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(|e| {
            error!("Failed to begin reservation transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        for (index, line) in lines.iter().enumerate() {
            let quantity = to_db_count(line.quantity)?;
            let result = StockLevelEntity::update_many()
                .col_expr(Column::Available, Expr::col(Column::Available).sub(quantity))
                .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(Column::ProductId.eq(line.key.product_id))
                .filter(Column::Size.eq(line.key.size_column()))
                .filter(Column::Available.gte(quantity))
                .exec(&txn)
                .await
                .map_err(ServiceError::DatabaseError)?;

            if result.rows_affected == 0 {
                let available = Self::find_level(&txn, &line.key)
                    .await?
                    .map_or(0, |row| row.available.max(0) as u32);
                txn.rollback().await.map_err(ServiceError::DatabaseError)?;
                return Err(ServiceError::InsufficientStock(StockShortage {
                    line: index,
                    product_id: line.key.product_id,
                    size: line.key.size.clone(),
                    requested: line.quantity,
                    available,
                }));
            }
        }

        txn.commit().await.map_err(|e| {
            error!("Failed to commit reservation: {}", e);
            ServiceError::DatabaseError(e)
        })
    }

    async fn release(&self, lines: &[StockLine]) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::DatabaseError)?;
        for line in lines {
            let quantity = to_db_count(line.quantity)?;
            let result = StockLevelEntity::update_many()
                .col_expr(Column::Available, Expr::col(Column::Available).add(quantity))
                .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(Column::ProductId.eq(line.key.product_id))
                .filter(Column::Size.eq(line.key.size_column()))
                .exec(&txn)
                .await
                .map_err(ServiceError::DatabaseError)?;
            if result.rows_affected == 0 {
                warn!(key = %line.key, "releasing stock for a key with no record; creating it");
                Self::insert_if_absent(&txn, &line.key, line.quantity, 0).await?;
            }
        }
        txn.commit().await.map_err(ServiceError::DatabaseError)
    }

    async fn commit(&self, lines: &[StockLine]) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::DatabaseError)?;
        for line in lines {
            let result = StockLevelEntity::update_many()
                .col_expr(Column::Sold, Expr::col(Column::Sold).add(i64::from(line.quantity)))
                .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(Column::ProductId.eq(line.key.product_id))
                .filter(Column::Size.eq(line.key.size_column()))
                .exec(&txn)
                .await
                .map_err(ServiceError::DatabaseError)?;
            if result.rows_affected == 0 {
                warn!(key = %line.key, "committing stock for a key with no record");
                Self::insert_if_absent(&txn, &line.key, 0, u64::from(line.quantity)).await?;
            }
        }
        txn.commit().await.map_err(ServiceError::DatabaseError)
    }

    async fn level(&self, key: &StockKey) -> Result<Option<StockLevel>, ServiceError> {
        Ok(Self::find_level(self.db.as_ref(), key)
            .await?
            .map(Self::to_level))
    }

    async fn set_available(
        &self,
        key: &StockKey,
        available: u32,
    ) -> Result<StockLevel, ServiceError> {
        let row = stock_level::ActiveModel {
            product_id: Set(key.product_id),
            size: Set(key.size_column().to_string()),
            available: Set(to_db_count(available)?),
            sold: Set(0),
            updated_at: Set(Utc::now()),
        };
        StockLevelEntity::insert(row)
            .on_conflict(
                OnConflict::columns([Column::ProductId, Column::Size])
                    .update_columns([Column::Available, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await
            .map_err(ServiceError::DatabaseError)?;

        Self::find_level(self.db.as_ref(), key)
            .await?
            .map(Self::to_level)
            .ok_or_else(|| ServiceError::InternalError(format!("stock key {} vanished", key)))
    }

    async fn seed(&self, key: &StockKey, available: u32) -> Result<bool, ServiceError> {
        Self::insert_if_absent(self.db.as_ref(), key, available, 0).await
    }

    async fn low_stock(&self, threshold: u32) -> Result<Vec<StockLevel>, ServiceError> {
        let rows = StockLevelEntity::find()
            .filter(Column::Available.lte(to_db_count(threshold)?))
            .order_by_asc(Column::Available)
            .order_by_asc(Column::ProductId)
            .order_by_asc(Column::Size)
            .all(self.db.as_ref())
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(rows.into_iter().map(Self::to_level).collect())
    }
}
