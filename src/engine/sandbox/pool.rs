use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed set of sandbox slot ids (isolate box ids). A lease is held for a
/// whole submission; with a single slot every submission is serialized.
#[derive(Clone)]
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<u32>>>,
}

impl SlotPool {
    pub fn new(base: u32, count: u32) -> Self {
        let count = count.max(1);
        let free = (base..base + count).rev().collect::<Vec<_>>();
        Self {
            semaphore: Arc::new(Semaphore::new(count as usize)),
            free: Arc::new(Mutex::new(free)),
        }
    }

    pub async fn acquire(&self) -> anyhow::Result<SlotLease> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("slot pool closed")?;
        let id = self
            .free
            .lock()
            .map_err(|_| anyhow::anyhow!("slot pool lock poisoned"))?
            .pop()
            .context("slot pool has a permit but no free slot")?;
        Ok(SlotLease {
            id,
            free: self.free.clone(),
            _permit: permit,
        })
    }
}

#[derive(Debug)]
pub struct SlotLease {
    id: u32,
    free: Arc<Mutex<Vec<u32>>>,
    _permit: OwnedSemaphorePermit,
}

impl SlotLease {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        // The id goes back before the permit is released.
        if let Ok(mut free) = self.free.lock() {
            free.push(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn leases_are_distinct_and_returned_on_drop() {
        let pool = SlotPool::new(10, 2);
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!((10..12).contains(&first.id()));
        let exhausted = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(exhausted.is_err());

        let released = first.id();
        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.id(), released);
    }

    #[tokio::test]
    async fn single_slot_serializes_acquirers() {
        let pool = SlotPool::new(0, 1);
        let held = pool.acquire().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err());

        drop(held);
        let lease = tokio::time::timeout(Duration::from_millis(50), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.id(), 0);
    }
}
