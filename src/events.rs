use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, Weak,
};

use crate::variable::Parameter;

/// What part of a variable changed.
///
/// Composite parameters remap the index of `Value`, `Added` and `Removed`
/// into their own index space when forwarding an event; `AllValues` is
/// forwarded as-is, since there is no single index to remap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableChange {
    /// A single dimension changed value.
    Value(usize),
    /// Every dimension may have changed.
    AllValues,
    /// A dimension was inserted at the given index.
    Added(usize),
    /// The dimension at the given index was removed.
    Removed(usize),
}

impl VariableChange {
    /// Shift the index of a per-dimension change by `offset`. `AllValues`
    /// passes through unchanged.
    pub fn offset_by(self, offset: usize) -> VariableChange {
        match self {
            VariableChange::Value(i) => VariableChange::Value(i + offset),
            VariableChange::Added(i) => VariableChange::Added(i + offset),
            VariableChange::Removed(i) => VariableChange::Removed(i + offset),
            VariableChange::AllValues => VariableChange::AllValues,
        }
    }
}

/// Observer of parameter mutations.
///
/// Handlers must be cheap: the contract is to flip a local dirty flag and
/// return. Change events fire synchronously through the whole owning graph,
/// so any real recomputation belongs in the lazy read path, not here.
pub trait VariableListener: Send + Sync {
    fn variable_changed_event(&self, variable: &dyn Parameter, change: VariableChange);
}

/// An ordered list of weakly held listeners.
///
/// Listeners are notified in registration order. The order is deterministic
/// but carries no meaning; listeners must not rely on it. Registering the
/// same listener twice is allowed and results in two notifications per
/// event. Dropped listeners are pruned lazily during notification.
pub struct ListenerList<L: ?Sized> {
    listeners: Mutex<Vec<Weak<L>>>,
}

impl<L: ?Sized> ListenerList<L> {
    pub fn new() -> Self {
        ListenerList {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Weak<L>) {
        self.listeners.lock().expect("listener list poisoned").push(listener);
    }

    pub fn remove(&self, listener: &Weak<L>) {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .retain(|l| !Weak::ptr_eq(l, listener));
    }

    pub fn is_empty(&self) -> bool {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .iter()
            .all(|l| l.strong_count() == 0)
    }

    /// Notify all live listeners in order.
    ///
    /// The lock is released before any callback runs, so a listener may
    /// re-enter this list (registering or deregistering) without deadlock.
    pub fn notify(&self, mut callback: impl FnMut(&L)) {
        let live: Vec<_> = {
            let mut guard = self.listeners.lock().expect("listener list poisoned");
            guard.retain(|l| l.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in &live {
            callback(listener);
        }
    }
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// A reentrancy-safe notification suppression flag.
///
/// Composite parameters suppress upward propagation while batch-mutating
/// their own children, then fire a single summary event. The guard releases
/// the suppression on drop, so a panic mid-batch cannot leave it stuck on.
pub struct SuppressionFlag {
    depth: AtomicUsize,
}

impl SuppressionFlag {
    pub fn new() -> Self {
        SuppressionFlag {
            depth: AtomicUsize::new(0),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    pub fn suppress(&self) -> SuppressionGuard<'_> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        SuppressionGuard { flag: self }
    }
}

impl Default for SuppressionFlag {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SuppressionGuard<'a> {
    flag: &'a SuppressionFlag,
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.flag.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct Counter {
        hits: AtomicUsize,
    }

    impl Counter {
        fn poke(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn notifies_in_registration_order_and_prunes_dead() {
        let list: ListenerList<Counter> = ListenerList::new();
        let a = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        let b = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        list.add(Arc::downgrade(&a));
        list.add(Arc::downgrade(&b));
        list.notify(|c| c.poke());
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);
        assert_eq!(b.hits.load(Ordering::SeqCst), 1);

        drop(b);
        list.notify(|c| c.poke());
        assert_eq!(a.hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn duplicate_registration_notifies_twice() {
        let list: ListenerList<Counter> = ListenerList::new();
        let a = Arc::new(Counter {
            hits: AtomicUsize::new(0),
        });
        list.add(Arc::downgrade(&a));
        list.add(Arc::downgrade(&a));
        list.notify(|c| c.poke());
        assert_eq!(a.hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn suppression_released_on_drop() {
        let flag = SuppressionFlag::new();
        assert!(!flag.is_suppressed());
        {
            let _outer = flag.suppress();
            let _inner = flag.suppress();
            assert!(flag.is_suppressed());
        }
        assert!(!flag.is_suppressed());
    }

    #[test]
    fn suppression_released_on_panic() {
        let flag = Arc::new(SuppressionFlag::new());
        let inner = Arc::clone(&flag);
        let result = std::panic::catch_unwind(move || {
            let _guard = inner.suppress();
            panic!("batch mutation failed");
        });
        assert!(result.is_err());
        assert!(!flag.is_suppressed());
    }
}
