use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Subscription id to callback. Listeners are invoked outside the lock, in no particular order.
pub(crate) struct ListenerRegistry<E> {
    listeners: Mutex<HashMap<Uuid, Listener<E>>>,
}

impl<E> ListenerRegistry<E> {
    pub(crate) fn new() -> Self {
        ListenerRegistry {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add<F>(&self, listener: F) -> Uuid
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.lock().insert(id, Arc::new(listener));
        id
    }

    /// Returns false if there was nothing to remove.
    pub(crate) fn remove(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub(crate) fn fire(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self.lock().values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Listener<E>>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn add_fire_remove() {
        let registry = ListenerRegistry::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = hits.clone();
        let id = registry.add(move |event: &u32| {
            hits_clone.fetch_add(*event as usize, Ordering::SeqCst);
        });

        registry.fire(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        registry.fire(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
