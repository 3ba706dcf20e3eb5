//! Delivery deduplication.
//!
//! Platforms redeliver webhooks. Each delivery ID is remembered for a bounded
//! time and a bounded count; a repeat inside that window is dropped before it
//! reaches trigger matching.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default time a delivery ID is remembered.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Default number of delivery IDs remembered.
pub const DEFAULT_CAPACITY: usize = 100_000;

#[derive(Debug, Default)]
struct Seen {
    at: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl Seen {
    fn expire(&mut self, now: Instant, ttl: Duration) {
        while let Some((id, at)) = self.order.front() {
            if now.duration_since(*at) < ttl {
                break;
            }
            // Only drop the map entry if it was not refreshed since.
            if self.at.get(id) == Some(at) {
                self.at.remove(id);
            }
            self.order.pop_front();
        }
    }

    fn evict_oldest(&mut self) {
        while let Some((id, at)) = self.order.pop_front() {
            if self.at.get(&id) == Some(&at) {
                self.at.remove(&id);
                return;
            }
        }
    }
}

/// Bounded-TTL set of recently seen delivery IDs.
#[derive(Debug)]
pub struct DeliveryDedup {
    ttl: Duration,
    capacity: usize,
    seen: Mutex<Seen>,
}

impl DeliveryDedup {
    /// Creates a dedup cache.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            seen: Mutex::new(Seen::default()),
        }
    }

    /// Records `delivery_id`, returning true if it was not seen within the TTL.
    pub fn check_and_insert(&self, delivery_id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.expire(now, self.ttl);
        if seen.at.contains_key(delivery_id) {
            return false;
        }
        while seen.at.len() >= self.capacity {
            seen.evict_oldest();
        }
        seen.at.insert(delivery_id.to_string(), now);
        seen.order.push_back((delivery_id.to_string(), now));
        true
    }

    /// Forgets `delivery_id` so a redelivery is processed again.
    pub fn forget(&self, delivery_id: &str) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .at
            .remove(delivery_id);
    }

    /// Number of delivery IDs currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .at
            .len()
    }

    /// Returns true if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeliveryDedup {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_within_ttl_is_dropped() {
        let dedup = DeliveryDedup::default();
        assert!(dedup.check_and_insert("d-1"));
        assert!(!dedup.check_and_insert("d-1"));
        assert!(dedup.check_and_insert("d-2"));
    }

    #[test]
    fn expired_ids_are_accepted_again() {
        let dedup = DeliveryDedup::new(Duration::ZERO, 10);
        assert!(dedup.check_and_insert("d-1"));
        assert!(dedup.check_and_insert("d-1"));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let dedup = DeliveryDedup::new(DEFAULT_TTL, 2);
        assert!(dedup.check_and_insert("d-1"));
        assert!(dedup.check_and_insert("d-2"));
        assert!(dedup.check_and_insert("d-3"));
        assert_eq!(dedup.len(), 2);
        assert!(dedup.check_and_insert("d-1"));
        assert!(!dedup.check_and_insert("d-3"));
    }

    #[test]
    fn forget_allows_redelivery() {
        let dedup = DeliveryDedup::default();
        assert!(dedup.check_and_insert("d-1"));
        dedup.forget("d-1");
        assert!(dedup.check_and_insert("d-1"));
    }
}
