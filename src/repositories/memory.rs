use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    order_not_found, OrderFilter, OrderRepository, OrderUpdate, Page, StockStore, Transition,
    TransitionGuard,
};
use crate::errors::ServiceError;
use crate::models::{Order, OrderStatus, StockKey, StockLevel, StockLine, StockShortage};

#[derive(Debug, Default)]
struct Counter {
    available: u32,
    sold: u64,
}

/// Stock held in process. Each key has its own lock; a multi-key operation
/// takes the locks of every key it touches in `StockKey` order, so there is
/// no global lock and no lock-order deadlock.
#[derive(Debug, Default)]
pub struct InMemoryStockStore {
    levels: DashMap<StockKey, Arc<Mutex<Counter>>>,
}

fn lock(counter: &Mutex<Counter>) -> MutexGuard<'_, Counter> {
    match counter.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `key`. The map shard lock is released before the caller
    /// locks the counter.
    fn handle(&self, key: &StockKey, create: bool) -> Option<Arc<Mutex<Counter>>> {
        if let Some(entry) = self.levels.get(key) {
            return Some(entry.value().clone());
        }
        if create {
            Some(self.levels.entry(key.clone()).or_default().value().clone())
        } else {
            None
        }
    }

    fn handles(
        &self,
        lines: &[StockLine],
        create: bool,
    ) -> Vec<(StockKey, Option<Arc<Mutex<Counter>>>)> {
        let keys: BTreeSet<&StockKey> = lines.iter().map(|l| &l.key).collect();
        keys.into_iter()
            .map(|key| (key.clone(), self.handle(key, create)))
            .collect()
    }

    /// Check-then-apply under all touched locks. Never awaits.
    fn reserve_locked(&self, lines: &[StockLine]) -> Result<(), StockShortage> {
        let handles = self.handles(lines, false);
        let mut guards: HashMap<StockKey, MutexGuard<'_, Counter>> = HashMap::new();
        for (key, handle) in &handles {
            if let Some(handle) = handle {
                guards.insert(key.clone(), lock(handle));
            }
        }

        let mut demand: HashMap<&StockKey, u32> = HashMap::new();
        for (index, line) in lines.iter().enumerate() {
            let on_hand = guards.get(&line.key).map_or(0, |g| g.available);
            let claimed = demand.entry(&line.key).or_insert(0);
            let remaining = on_hand.saturating_sub(*claimed);
            if line.quantity > remaining {
                return Err(StockShortage {
                    line: index,
                    product_id: line.key.product_id,
                    size: line.key.size.clone(),
                    requested: line.quantity,
                    available: remaining,
                });
            }
            *claimed += line.quantity;
        }

        for line in lines {
            if let Some(guard) = guards.get_mut(&line.key) {
                guard.available -= line.quantity;
            }
        }
        Ok(())
    }

    fn apply_locked(&self, lines: &[StockLine], op: impl Fn(&mut Counter, u32)) {
        let handles = self.handles(lines, true);
        let mut guards: HashMap<StockKey, MutexGuard<'_, Counter>> = HashMap::new();
        for (key, handle) in &handles {
            if let Some(handle) = handle {
                guards.insert(key.clone(), lock(handle));
            }
        }
        for line in lines {
            if let Some(guard) = guards.get_mut(&line.key) {
                op(guard, line.quantity);
            }
        }
    }

    fn snapshot(key: &StockKey, counter: &Counter) -> StockLevel {
        StockLevel {
            key: key.clone(),
            available: counter.available,
            sold: counter.sold,
        }
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn reserve(&self, lines: &[StockLine]) -> Result<(), ServiceError> {
        self.reserve_locked(lines)
            .map_err(ServiceError::InsufficientStock)
    }

    async fn release(&self, lines: &[StockLine]) -> Result<(), ServiceError> {
        self.apply_locked(lines, |counter, quantity| {
            counter.available = counter.available.saturating_add(quantity);
        });
        Ok(())
    }

    async fn commit(&self, lines: &[StockLine]) -> Result<(), ServiceError> {
        self.apply_locked(lines, |counter, quantity| {
            counter.sold += u64::from(quantity);
        });
        Ok(())
    }

    async fn level(&self, key: &StockKey) -> Result<Option<StockLevel>, ServiceError> {
        Ok(self
            .handle(key, false)
            .map(|handle| Self::snapshot(key, &lock(&handle))))
    }

    async fn set_available(
        &self,
        key: &StockKey,
        available: u32,
    ) -> Result<StockLevel, ServiceError> {
        let handle = self.handle(key, true).ok_or_else(|| {
            ServiceError::InternalError(format!("stock key {} could not be created", key))
        })?;
        let mut counter = lock(&handle);
        counter.available = available;
        Ok(Self::snapshot(key, &counter))
    }

    async fn seed(&self, key: &StockKey, available: u32) -> Result<bool, ServiceError> {
        let mut created = false;
        self.levels.entry(key.clone()).or_insert_with(|| {
            created = true;
            Arc::new(Mutex::new(Counter { available, sold: 0 }))
        });
        Ok(created)
    }

    async fn low_stock(&self, threshold: u32) -> Result<Vec<StockLevel>, ServiceError> {
        let handles: Vec<(StockKey, Arc<Mutex<Counter>>)> = self
            .levels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut levels: Vec<StockLevel> = handles
            .iter()
            .map(|(key, handle)| Self::snapshot(key, &lock(handle)))
            .filter(|level| level.available <= threshold)
            .collect();
        levels.sort_by(|a, b| a.available.cmp(&b.available).then(a.key.cmp(&b.key)));
        Ok(levels)
    }
}

/// Orders held in process. A transition is a check-and-set under the map
/// entry's write guard.
#[derive(Debug, Default)]
pub struct InMemoryOrderRepository {
    orders: DashMap<Uuid, Order>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn insert(&self, order: &Order) -> Result<(), ServiceError> {
        match self.orders.entry(order.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ServiceError::Conflict(format!(
                "Order {} already exists",
                order.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(order.clone());
                Ok(())
            }
        }
    }

    async fn find(&self, id: Uuid) -> Result<Option<Order>, ServiceError> {
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list(
        &self,
        filter: &OrderFilter,
        page: u64,
        limit: u64,
    ) -> Result<Page<Order>, ServiceError> {
        let mut matching: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| {
                let order = entry.value();
                filter
                    .customer_id
                    .as_ref()
                    .map_or(true, |c| &order.customer_id == c)
                    && filter.status.map_or(true, |s| order.status == s)
            })
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip((page.saturating_sub(1) * limit) as usize)
            .take(limit as usize)
            .collect();
        Ok(Page {
            items,
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
        let mut pending: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| {
                entry.value().status == OrderStatus::Pending && entry.value().created_at < cutoff
            })
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|order| order.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn transition(
        &self,
        id: Uuid,
        guard: &TransitionGuard,
        update: &OrderUpdate,
    ) -> Result<Transition, ServiceError> {
        let mut entry = self.orders.get_mut(&id).ok_or_else(|| order_not_found(id))?;
        let order = entry.value_mut();
        if !guard.matches(order) {
            return Ok(Transition::Rejected(order.clone()));
        }
        update.apply(order, Utc::now());
        Ok(Transition::Applied(order.clone()))
    }
}
