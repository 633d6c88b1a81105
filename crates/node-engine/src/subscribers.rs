//! Per-execution callback tables
//!
//! Shared by the execution state manager and the performance monitor.
//! Callbacks run outside the table lock, each under its own activity flag:
//! once [`Subscription::unsubscribe`] returns, the callback is not running
//! and will not be called again.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Reentrant so a callback may end its own subscription
type ActiveFlag = ReentrantMutex<Cell<bool>>;

struct Entry<T> {
    id: u64,
    active: Arc<ActiveFlag>,
    callback: Callback<T>,
}

struct Table<T> {
    entries: Mutex<HashMap<String, Vec<Entry<T>>>>,
}

trait Detach: Send + Sync {
    fn detach(&self, key: &str, id: u64);
}

impl<T> Detach for Table<T> {
    fn detach(&self, key: &str, id: u64) {
        let mut entries = self.entries.lock();
        if let Some(callbacks) = entries.get_mut(key) {
            callbacks.retain(|entry| entry.id != id);
            if callbacks.is_empty() {
                entries.remove(key);
            }
        }
    }
}

/// Handle returned by `subscribe`
///
/// Removing happens only through [`unsubscribe`](Subscription::unsubscribe);
/// dropping the handle leaves the callback registered.
pub struct Subscription {
    key: String,
    id: u64,
    active: Arc<ActiveFlag>,
    table: Weak<dyn Detach>,
}

impl Subscription {
    /// Remove exactly this callback
    ///
    /// Waits for an in-flight call of this callback on another thread.
    pub fn unsubscribe(self) {
        self.active.lock().set(false);
        if let Some(table) = self.table.upgrade() {
            table.detach(&self.key, self.id);
        }
    }
}

pub(crate) struct SubscriberTable<T> {
    table: Arc<Table<T>>,
    next_id: AtomicU64,
}

impl<T: 'static> SubscriberTable<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Table {
                entries: Mutex::new(HashMap::new()),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(ReentrantMutex::new(Cell::new(true)));
        self.table
            .entries
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(Entry {
                id,
                active: Arc::clone(&active),
                callback: Arc::new(callback),
            });

        let table: Weak<Table<T>> = Arc::downgrade(&self.table);
        let table: Weak<dyn Detach> = table;
        Subscription {
            key: key.to_string(),
            id,
            active,
            table,
        }
    }

    /// Call every active subscriber of `key`, in subscription order
    pub fn notify(&self, key: &str, value: &T) {
        let callbacks: Vec<(Arc<ActiveFlag>, Callback<T>)> = self
            .table
            .entries
            .lock()
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (Arc::clone(&e.active), Arc::clone(&e.callback)))
                    .collect()
            })
            .unwrap_or_default();

        for (active, callback) in callbacks {
            let active = active.lock();
            if active.get() {
                callback(value);
            }
        }
    }

    /// Drop every subscriber of `key`
    pub fn remove_all(&self, key: &str) {
        let removed = self.table.entries.lock().remove(key).unwrap_or_default();
        for entry in removed {
            entry.active.lock().set(false);
        }
    }

    #[cfg(test)]
    pub fn len(&self, key: &str) -> usize {
        self.table.entries.lock().get(key).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn counter(table: &SubscriberTable<u32>, key: &str) -> (Arc<AtomicUsize>, Subscription) {
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = {
            let calls = calls.clone();
            table.subscribe(key, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        (calls, sub)
    }

    #[test]
    fn test_unsubscribe_removes_entry() {
        let table = SubscriberTable::new();
        let (calls, sub) = counter(&table, "e1");
        let (_other_calls, _other) = counter(&table, "e1");

        table.notify("e1", &1);
        sub.unsubscribe();
        table.notify("e1", &2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(table.len("e1"), 1);
    }

    #[test]
    fn test_unsubscribe_while_notification_in_flight() {
        let table = Arc::new(SubscriberTable::<u32>::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);

        let _blocking = table.subscribe("e1", move |_| {
            let _ = entered_tx.lock().send(());
            let _ = release_rx.lock().recv();
        });
        let (late_calls, late) = counter(&table, "e1");

        let notifier = {
            let table = table.clone();
            std::thread::spawn(move || table.notify("e1", &7))
        };

        // First callback is now blocked inside notify on the other thread
        entered_rx.recv().unwrap();
        late.unsubscribe();
        let after_unsubscribe = late_calls.load(Ordering::SeqCst);
        release_tx.send(()).unwrap();
        notifier.join().unwrap();

        assert_eq!(after_unsubscribe, 0);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let table = SubscriberTable::<u32>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let sub = {
            let slot = slot.clone();
            let calls = calls.clone();
            table.subscribe("e1", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(own) = slot.lock().take() {
                    own.unsubscribe();
                }
            })
        };
        *slot.lock() = Some(sub);

        table.notify("e1", &1);
        table.notify("e1", &2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(table.len("e1"), 0);
    }

    #[test]
    fn test_remove_all_silences_outstanding_handles() {
        let table = SubscriberTable::new();
        let (calls, sub) = counter(&table, "e1");

        table.remove_all("e1");
        table.notify("e1", &1);
        sub.unsubscribe();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
