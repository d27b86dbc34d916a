use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::{
    errors::ServiceError,
    events::{Event, EventSender},
    metrics::STOCK_RESERVATION_FAILURES,
    models::{StockKey, StockLevel, StockLine},
    repositories::StockStore,
};

/// Stock Ledger: the only writer of stock counters.
#[derive(Clone)]
pub struct StockLedger {
    store: Arc<dyn StockStore>,
    event_sender: EventSender,
}

impl StockLedger {
    pub fn new(store: Arc<dyn StockStore>, event_sender: EventSender) -> Self {
        Self {
            store,
            event_sender,
        }
    }

    /// Reserves every line or none of them.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn reserve(&self, lines: &[StockLine]) -> Result<(), ServiceError> {
        if let Some(line) = lines.iter().find(|line| line.quantity == 0) {
            return Err(ServiceError::ValidationError(format!(
                "quantity for {} must be positive",
                line.key
            )));
        }
        match self.store.reserve(lines).await {
            Err(ServiceError::InsufficientStock(shortage)) => {
                STOCK_RESERVATION_FAILURES.inc();
                warn!(
                    line = shortage.line,
                    requested = shortage.requested,
                    available = shortage.available,
                    "stock reservation refused"
                );
                Err(ServiceError::InsufficientStock(shortage))
            }
            Err(err) => {
                error!(error = %err, "stock reservation failed");
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn release(&self, lines: &[StockLine]) -> Result<(), ServiceError> {
        self.store.release(lines).await?;
        info!("stock released");
        Ok(())
    }

    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn commit(&self, lines: &[StockLine]) -> Result<(), ServiceError> {
        self.store.commit(lines).await
    }

    pub async fn level(&self, key: &StockKey) -> Result<Option<StockLevel>, ServiceError> {
        self.store.level(key).await
    }

    /// Administrative restock or write-off of one key.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn set_available(
        &self,
        key: &StockKey,
        available: u32,
    ) -> Result<StockLevel, ServiceError> {
        let level = self.store.set_available(key, available).await?;
        info!(available, "stock level set");
        self.event_sender
            .send_or_log(Event::StockAdjusted {
                key: key.clone(),
                available,
            })
            .await;
        Ok(level)
    }

    pub async fn low_stock(&self, threshold: u32) -> Result<Vec<StockLevel>, ServiceError> {
        self.store.low_stock(threshold).await
    }

    pub fn store(&self) -> &Arc<dyn StockStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::InMemoryStockStore;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn multi_line_reservation_is_all_or_nothing() {
        let (tx, _rx) = mpsc::channel(8);
        let store = Arc::new(InMemoryStockStore::new());
        let ledger = StockLedger::new(store.clone(), EventSender::new(tx));
        let a = StockKey::sized(Uuid::from_u128(1), "M");
        let b = StockKey::product(Uuid::from_u128(2));
        store.seed(&a, 5).await.unwrap();
        store.seed(&b, 1).await.unwrap();

        let result = ledger
            .reserve(&[StockLine::new(a.clone(), 2), StockLine::new(b.clone(), 2)])
            .await;
        assert!(matches!(result, Err(ServiceError::InsufficientStock(s)) if s.line == 1));
        assert_eq!(ledger.level(&a).await.unwrap().unwrap().available, 5);
        assert_eq!(ledger.level(&b).await.unwrap().unwrap().available, 1);
    }

    #[tokio::test]
    async fn commit_counts_sales_without_touching_available() {
        let (tx, _rx) = mpsc::channel(8);
        let store = Arc::new(InMemoryStockStore::new());
        let ledger = StockLedger::new(store.clone(), EventSender::new(tx));
        let key = StockKey::product(Uuid::from_u128(3));
        store.seed(&key, 2).await.unwrap();

        let lines = [StockLine::new(key.clone(), 2)];
        ledger.reserve(&lines).await.unwrap();
        ledger.commit(&lines).await.unwrap();
        let level = ledger.level(&key).await.unwrap().unwrap();
        assert_eq!((level.available, level.sold), (0, 2));
    }

    #[tokio::test]
    async fn zero_quantity_is_a_validation_error() {
        let (tx, _rx) = mpsc::channel(8);
        let ledger = StockLedger::new(Arc::new(InMemoryStockStore::new()), EventSender::new(tx));
        let key = StockKey::product(Uuid::from_u128(4));
        assert!(matches!(
            ledger.reserve(&[StockLine::new(key, 0)]).await,
            Err(ServiceError::ValidationError(_))
        ));
    }
}
