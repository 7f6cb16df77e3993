use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Registry of change listeners.
///
/// Stores publish a complete value (never a delta) after every mutation;
/// listeners are invoked synchronously, in subscription order.
pub struct Notifier<T> {
    listeners: Shared<Vec<Listener<T>>>,
    // held from mutation to the end of delivery
    order: Mutex<()>,
}

impl<T> Notifier<T> {
    pub fn new() -> Self {
        Self {
            listeners: new_state(Vec::new()),
            order: Mutex::new(()),
        }
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    pub fn publish(&self, value: &T) {
        // listeners may subscribe from inside a callback
        let listeners = self.listeners.lock().clone();
        for listener in listeners.iter() {
            listener(value);
        }
    }

    /// Runs `mutate`, which must take its snapshot inside the same critical
    /// section as the mutation, and publishes that snapshot before any other
    /// `publish_after` caller can mutate. Listeners therefore see snapshots
    /// in mutation order and the last one delivered is the current state.
    ///
    /// A listener must not call `publish_after` on the same notifier.
    pub fn publish_after<R>(&self, mutate: impl FnOnce() -> (R, T)) -> R {
        let _order = self.order.lock();
        let (result, snapshot) = mutate();
        self.publish(&snapshot);
        result
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<T> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_reaches_every_listener() {
        let notifier: Notifier<Vec<u32>> = Notifier::new();
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let seen = seen.clone();
            notifier.subscribe(move |values: &Vec<u32>| {
                seen.fetch_add(values.len(), Ordering::SeqCst);
            });
        }

        notifier.publish(&vec![1, 2]);
        assert_eq!(seen.load(Ordering::SeqCst), 6);
        assert_eq!(notifier.listener_count(), 3);
    }

    #[test]
    fn test_concurrent_mutations_end_on_latest_snapshot() {
        for _ in 0..200 {
            let state = new_state(Vec::<u32>::new());
            let notifier: Arc<Notifier<Vec<u32>>> = Arc::new(Notifier::new());
            let last_len = Arc::new(AtomicUsize::new(0));
            {
                let last_len = last_len.clone();
                notifier.subscribe(move |values: &Vec<u32>| {
                    last_len.store(values.len(), Ordering::SeqCst);
                });
            }

            let threads: Vec<_> = (0..4)
                .map(|i| {
                    let state = state.clone();
                    let notifier = notifier.clone();
                    std::thread::spawn(move || {
                        notifier.publish_after(|| {
                            let mut values = state.lock();
                            values.push(i);
                            ((), values.clone())
                        });
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(last_len.load(Ordering::SeqCst), 4);
        }
    }

    #[test]
    fn test_publish_without_listeners_is_noop() {
        let notifier: Notifier<String> = Notifier::default();
        notifier.publish(&"nothing".to_string());
        assert_eq!(notifier.listener_count(), 0);
    }
}
