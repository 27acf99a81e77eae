//! Per-thread probe variables
//!
//! A [`ProbeLocal`] gives every thread its own value, created on first access
//! by a factory supplied at declaration time. Unlike `thread_local!`, many
//! instances can be created at runtime (one per client variable, one per
//! speculation manager), each with its own key.
//!
//! Values live in a per-thread map keyed by [`LocalKey`] and are dropped when
//! the thread exits. Entries of variables that have since been dropped are
//! pruned the next time the thread creates a value. [`ProbeLocal::peek`]
//! reads without creating one. Calling [`ProbeLocal::with`] on the same
//! variable from inside its own closure panics (the value is already
//! borrowed).

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use crate::domain::LocalKey;

struct Slot {
    /// Dead once the owning variable is dropped
    alive: Weak<()>,
    value: Rc<dyn Any>,
}

thread_local! {
    static SLOTS: RefCell<HashMap<LocalKey, Slot>> = RefCell::new(HashMap::new());
}

pub struct ProbeLocal<T: 'static> {
    key: LocalKey,
    init: Arc<dyn Fn() -> T + Send + Sync>,
    alive: Arc<()>,
}

impl<T: 'static> ProbeLocal<T> {
    /// Declare a variable whose per-thread value is produced by `init`
    pub fn new(init: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self { key: LocalKey::next(), init: Arc::new(init), alive: Arc::new(()) }
    }

    pub fn key(&self) -> LocalKey {
        self.key
    }

    /// Run `f` with mutable access to this thread's value
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let cell = self.cell();
        let mut value = cell.borrow_mut();
        f(&mut value)
    }

    pub fn set(&self, value: T) {
        self.with(|slot| *slot = value);
    }

    pub fn replace(&self, value: T) -> T {
        self.with(|slot| std::mem::replace(slot, value))
    }

    /// Run `f` on this thread's value if it has one, without creating it
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let cell = self.existing()?;
        let mut value = cell.borrow_mut();
        Some(f(&mut value))
    }

    /// Whether the calling thread holds a value for this variable
    pub fn is_set(&self) -> bool {
        self.existing().is_some()
    }

    /// Forget this thread's value; the next access runs the factory again
    pub fn reset(&self) {
        let removed = SLOTS.try_with(|slots| slots.borrow_mut().remove(&self.key));
        // Dropped with the map released, the value may touch other variables
        drop(removed);
    }

    fn existing(&self) -> Option<Rc<RefCell<T>>> {
        let any = SLOTS.with(|slots| slots.borrow().get(&self.key).map(|slot| Rc::clone(&slot.value)))?;
        any.downcast::<RefCell<T>>().ok()
    }

    fn cell(&self) -> Rc<RefCell<T>> {
        if let Some(cell) = self.existing() {
            return cell;
        }
        // Factory runs with no borrow of the slot map held
        let cell = Rc::new(RefCell::new((self.init)()));
        let slot = Slot { alive: Arc::downgrade(&self.alive), value: cell.clone() };
        let stale = SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            let dead: Vec<LocalKey> =
                slots.iter().filter(|(_, s)| s.alive.strong_count() == 0).map(|(k, _)| *k).collect();
            let stale: Vec<Slot> = dead.iter().filter_map(|key| slots.remove(key)).collect();
            slots.insert(self.key, slot);
            stale
        });
        drop(stale);
        cell
    }
}

impl<T: Clone + 'static> ProbeLocal<T> {
    pub fn get(&self) -> T {
        self.with(|slot| slot.clone())
    }

    /// This thread's value, or `None` if it has never been created
    pub fn peek(&self) -> Option<T> {
        self.try_with(|slot| slot.clone())
    }
}

/// Number of values the calling thread holds across all variables
#[cfg(test)]
pub(crate) fn thread_slot_count() -> usize {
    SLOTS.with(|slots| slots.borrow().len())
}

impl<T: Default + 'static> Default for ProbeLocal<T> {
    fn default() -> Self {
        Self::new(T::default)
    }
}

impl<T: 'static> Drop for ProbeLocal<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: 'static> fmt::Debug for ProbeLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeLocal").field("key", &self.key).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_factory_runs_once_per_thread() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let local = Arc::new(ProbeLocal::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::<u32>::new()
        }));

        local.with(|v| v.push(1));
        local.with(|v| v.push(2));
        assert_eq!(local.get(), vec![1, 2]);

        let other = Arc::clone(&local);
        let seen = std::thread::spawn(move || {
            other.with(|v| v.push(9));
            other.get()
        })
        .join()
        .unwrap();

        assert_eq!(seen, vec![9]);
        assert_eq!(local.get(), vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_factory_values_are_not_shared() {
        // A mutable template must not leak between threads
        let local = Arc::new(ProbeLocal::new(|| vec![0u8; 4]));
        local.with(|v| v[0] = 42);
        let other = Arc::clone(&local);
        let first = std::thread::spawn(move || other.get()[0]).join().unwrap();
        assert_eq!(first, 0);
    }

    #[test]
    fn test_reset_and_replace() {
        let local: ProbeLocal<u32> = ProbeLocal::new(|| 7);
        assert_eq!(local.replace(10), 7);
        assert_eq!(local.get(), 10);
        local.reset();
        assert_eq!(local.get(), 7);
    }

    #[test]
    fn test_peek_does_not_create_value() {
        let local: ProbeLocal<u32> = ProbeLocal::new(|| 7);
        assert_eq!(local.peek(), None);
        assert!(!local.is_set());
        assert_eq!(local.try_with(|v| *v), None);
        local.set(3);
        assert_eq!(local.peek(), Some(3));
        assert!(local.is_set());
    }

    #[test]
    fn test_values_of_dropped_variables_are_pruned() {
        let (touched_tx, touched_rx) = std::sync::mpsc::channel();
        let (dropped_tx, dropped_rx) = std::sync::mpsc::channel::<()>();
        let first = Arc::new(ProbeLocal::new(|| 1u32));
        let remote = Arc::clone(&first);

        let worker = std::thread::spawn(move || {
            remote.get();
            drop(remote);
            touched_tx.send(thread_slot_count()).unwrap();
            dropped_rx.recv().unwrap();
            // The dead entry goes away when the next value is created
            let second = ProbeLocal::new(|| 2u32);
            second.get();
            thread_slot_count()
        });

        assert_eq!(touched_rx.recv().unwrap(), 1);
        drop(first);
        dropped_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap(), 1);
    }

    #[test]
    fn test_distinct_variables_have_distinct_values() {
        let a: ProbeLocal<u32> = ProbeLocal::default();
        let b: ProbeLocal<u32> = ProbeLocal::default();
        a.set(1);
        b.set(2);
        assert_eq!((a.get(), b.get()), (1, 2));
        assert_ne!(a.key(), b.key());
    }
}
