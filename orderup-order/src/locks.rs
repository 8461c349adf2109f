use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Number of retained lock slots above which idle slots get pruned.
const PRUNE_THRESHOLD: usize = 1024;

/// Per-order exclusion.
///
/// Each order id lazily gets its own async mutex, so transitions on one order
/// are serialized while unrelated orders never contend. Waiting on a slot is
/// cancel-safe: dropping the `acquire` future gives up the place in line.
#[derive(Default)]
pub struct OrderLocks {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `order_id`. Released when the guard drops.
    pub async fn acquire(&self, order_id: &str) -> OwnedMutexGuard<()> {
        if self.slots.len() > PRUNE_THRESHOLD {
            self.prune();
        }

        // The map reference must be gone before awaiting, otherwise the shard
        // stays locked for as long as the current holder keeps the order.
        let slot = self
            .slots
            .entry(order_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        slot.lock_owned().await
    }

    /// Drop slots nobody holds or waits on.
    ///
    /// A slot referenced only by the map is idle: cloning it out of the map
    /// happens under the same shard lock `retain` takes, so the count cannot
    /// change underneath us.
    pub fn prune(&self) {
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
