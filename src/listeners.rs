use std::sync::{Arc, Mutex};

use crate::sync::lock;

/// Ordered, append-idempotent registry of shared listeners.
///
/// Iteration always works on a snapshot so listeners can register or unregister while a
/// fan-out is in progress on another thread.
pub(crate) struct ListenerSet<T: ?Sized> {
    listeners: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> ListenerSet<T> {
    /// Appends `listener` unless the same instance is already registered.
    pub(crate) fn add(&self, listener: Arc<T>) -> bool {
        let mut listeners = lock(&self.listeners);
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub(crate) fn remove(&self, listener: &Arc<T>) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        lock(&self.listeners).clone()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.listeners).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Listener(&'static str);

    impl Named for Listener {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn add_is_idempotent_per_instance() {
        let set: ListenerSet<dyn Named> = ListenerSet::default();
        let a: Arc<dyn Named> = Arc::new(Listener("a"));
        let other_a: Arc<dyn Named> = Arc::new(Listener("a"));

        assert!(set.add(Arc::clone(&a)));
        assert!(!set.add(Arc::clone(&a)));
        assert!(set.add(other_a));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn snapshot_keeps_registration_order() {
        let set: ListenerSet<dyn Named> = ListenerSet::default();
        let first: Arc<dyn Named> = Arc::new(Listener("first"));
        set.add(Arc::clone(&first));
        set.add(Arc::new(Listener("second")));

        let names: Vec<_> = set.snapshot().iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, ["first", "second"]);

        assert!(set.remove(&first));
        assert!(!set.remove(&first));
        assert_eq!(set.len(), 1);
    }
}
