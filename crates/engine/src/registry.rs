//! Registry of currently mounted consumers.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicU64, Ordering},
};

use indexmap::IndexMap;

/// Tracks active consumers without owning them.
///
/// Ids come from a monotonically increasing counter and are never reused for
/// the lifetime of the registry, even across [`SubscriberRegistry::clear`].
#[derive(Debug)]
pub struct SubscriberRegistry<T> {
    next_id: AtomicU64,
    entries: Mutex<IndexMap<u64, Weak<T>>>,
}

impl<T> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriberRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    pub fn register(&self, consumer: &Arc<T>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().expect("registry lock").insert(id, Arc::downgrade(consumer));
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.entries.lock().expect("registry lock").shift_remove(&id).is_some()
    }

    /// Live consumers in registration order. Dropped consumers are pruned.
    pub fn list_active(&self) -> Vec<(u64, Arc<T>)> {
        let mut entries = self.entries.lock().expect("registry lock");
        entries.retain(|_, consumer| consumer.strong_count() > 0);
        entries
            .iter()
            .filter_map(|(id, consumer)| consumer.upgrade().map(|consumer| (*id, consumer)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every registration. The id counter keeps running.
    pub fn clear(&self) {
        self.entries.lock().expect("registry lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_never_reused() {
        let registry = SubscriberRegistry::new();
        let first = Arc::new("a");
        let second = Arc::new("b");
        let first_id = registry.register(&first);
        assert!(registry.unregister(first_id));
        assert!(!registry.unregister(first_id));
        registry.clear();
        let second_id = registry.register(&second);
        assert!(second_id > first_id);
    }

    #[test]
    fn does_not_keep_consumers_alive() {
        let registry = SubscriberRegistry::new();
        let kept = Arc::new(1);
        let dropped = Arc::new(2);
        registry.register(&kept);
        registry.register(&dropped);
        drop(dropped);

        let active: Vec<i32> = registry.list_active().into_iter().map(|(_, value)| *value).collect();
        assert_eq!(active, vec![1]);
        assert_eq!(registry.len(), 1);
    }
}
