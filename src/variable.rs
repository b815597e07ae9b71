use std::io::{Read, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock, Weak,
};

use crate::bounds::{Bounds, DefaultBounds, IntersectionBounds};
use crate::error::{Result, StateError};
use crate::events::{ListenerList, VariableChange, VariableListener};
use crate::registry::{ParamKey, Registry};

/// A named vector of mutable scalar values with change notification, bounds
/// and transactional store/restore/accept.
///
/// This is the single capability interface of the graph; leaf, compound,
/// masked, transformed and derived parameters all implement it. There is no
/// base type to inherit from: every implementation spells out its own
/// quiet/loud mutation semantics exactly once and composes the rest.
pub trait Parameter: Send + Sync {
    /// Registry-assigned identity, used by listeners to tell sources apart.
    fn key(&self) -> ParamKey;

    fn id(&self) -> Option<String>;

    fn set_id(&self, id: &str);

    /// The id, or a placeholder for anonymous parameters.
    fn name(&self) -> String {
        self.id().unwrap_or_else(|| "<anonymous>".to_string())
    }

    fn dimension(&self) -> usize;

    fn value(&self, index: usize) -> f64;

    /// A defensive copy of all values.
    fn values(&self) -> Vec<f64> {
        (0..self.dimension()).map(|i| self.value(i)).collect()
    }

    /// Set one dimension and fire a `Value` change event.
    fn set_value(&self, index: usize, value: f64) -> Result<()>;

    /// Set one dimension without notifying anyone.
    fn set_value_quietly(&self, index: usize, value: f64) -> Result<()>;

    /// Set one dimension, then notify listeners that every dimension may
    /// have changed.
    fn set_value_notify_all(&self, index: usize, value: f64) -> Result<()> {
        self.set_value_quietly(index, value)?;
        self.fire_changed(VariableChange::AllValues);
        Ok(())
    }

    /// Replace all values with one `AllValues` notification at the end.
    fn set_all_values(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.dimension() {
            return Err(StateError::DimensionMismatch {
                context: "set_all_values",
                expected: self.dimension(),
                actual: values.len(),
            });
        }
        for (i, &v) in values.iter().enumerate() {
            self.set_value_quietly(i, v)?;
        }
        self.fire_changed(VariableChange::AllValues);
        Ok(())
    }

    /// Resize to `dim` values. Only explicit resizing exists; new dimensions
    /// take the value of dimension 0. Not supported by most composite types.
    fn set_dimension(&self, _dim: usize) -> Result<()> {
        Err(StateError::ResizeNotSupported(self.name()))
    }

    /// Insert a dimension at `index` and fire `Added`.
    fn add_dimension(&self, _index: usize, _value: f64) -> Result<()> {
        Err(StateError::ResizeNotSupported(self.name()))
    }

    /// Remove the dimension at `index`, fire `Removed`, return its value.
    fn remove_dimension(&self, _index: usize) -> Result<f64> {
        Err(StateError::ResizeNotSupported(self.name()))
    }

    fn add_listener(&self, listener: Weak<dyn VariableListener>);

    fn remove_listener(&self, listener: &Weak<dyn VariableListener>);

    /// Whether anything is listening to this parameter.
    fn is_used(&self) -> bool;

    /// Notify listeners of a change. Mutators call this exactly once per
    /// non-quiet mutation.
    fn fire_changed(&self, change: VariableChange);

    /// Snapshot current values. A second store without an intervening
    /// restore or accept is a no-op.
    fn store_values(&self);

    /// Roll back to the snapshot. A no-op unless a store is pending.
    fn restore_values(&self);

    /// Discard the snapshot. A no-op unless a store is pending.
    fn accept_values(&self);

    /// Copy all values from `source`, leaving the transaction state valid.
    fn adopt_values(&self, source: &dyn Parameter) -> Result<()>;

    /// Add an extra constraint layer; the intersection of everything added
    /// so far applies. Never replaces existing bounds.
    fn add_bounds(&self, bounds: Arc<dyn Bounds>) -> Result<()>;

    fn bounds(&self) -> Option<Arc<dyn Bounds>>;

    /// True when every dimension lies inside the effective bounds. A
    /// parameter without bounds is always within bounds.
    fn is_within_bounds(&self) -> bool {
        match self.bounds() {
            Some(bounds) => (0..self.dimension()).all(|i| bounds.contains(i, self.value(i))),
            None => true,
        }
    }

    fn dimension_name(&self, index: usize) -> String {
        if self.dimension() == 1 {
            self.name()
        } else {
            format!("{}{}", self.name(), index + 1)
        }
    }
}

/// Guards the store/restore/accept cycle of one parameter.
///
/// Valid means "no pending store". The guard makes the three transaction
/// calls idempotent within one cycle, so a parameter reachable through
/// several owners is snapshotted once per iteration, not once per path.
pub(crate) struct TransactionFlag {
    valid: AtomicBool,
}

impl TransactionFlag {
    pub fn new() -> TransactionFlag {
        TransactionFlag {
            valid: AtomicBool::new(true),
        }
    }

    /// Flip valid -> pending; true when the caller should take a snapshot.
    pub fn try_store(&self) -> bool {
        self.valid.swap(false, Ordering::SeqCst)
    }

    /// Flip pending -> valid; true when the caller should roll back.
    pub fn try_restore(&self) -> bool {
        !self.valid.swap(true, Ordering::SeqCst)
    }

    /// Flip pending -> valid; true when the caller should drop the snapshot.
    pub fn try_accept(&self) -> bool {
        !self.valid.swap(true, Ordering::SeqCst)
    }

    pub fn mark_valid(&self) {
        self.valid.store(true, Ordering::SeqCst);
    }
}

/// The leaf parameter: a plain vector of doubles.
pub struct RealParameter {
    key: ParamKey,
    id: Mutex<Option<String>>,
    values: RwLock<Vec<f64>>,
    stored: Mutex<Vec<f64>>,
    ever_stored: AtomicBool,
    txn: TransactionFlag,
    bounds: Mutex<Option<Arc<IntersectionBounds>>>,
    dimension_names: Mutex<Option<Vec<String>>>,
    listeners: ListenerList<dyn VariableListener>,
}

impl RealParameter {
    pub fn new(registry: &Arc<Registry>, id: &str, values: Vec<f64>) -> Arc<RealParameter> {
        let parameter = Self::build(registry, Some(id.to_string()), values);
        registry.register(Arc::downgrade(&parameter) as Weak<dyn Parameter>);
        parameter
    }

    /// A parameter without an id; one is assigned when it joins a compound.
    pub fn new_unnamed(registry: &Arc<Registry>, values: Vec<f64>) -> Arc<RealParameter> {
        let parameter = Self::build(registry, None, values);
        registry.register(Arc::downgrade(&parameter) as Weak<dyn Parameter>);
        parameter
    }

    /// `dim` copies of `value`.
    pub fn with_value(
        registry: &Arc<Registry>,
        id: &str,
        dim: usize,
        value: f64,
    ) -> Arc<RealParameter> {
        Self::new(registry, id, vec![value; dim])
    }

    /// A named parameter with uniform bounds on every dimension.
    pub fn bounded(
        registry: &Arc<Registry>,
        id: &str,
        values: Vec<f64>,
        lower: f64,
        upper: f64,
    ) -> Result<Arc<RealParameter>> {
        let dim = values.len();
        let parameter = Self::new(registry, id, values);
        parameter.add_bounds(Arc::new(DefaultBounds::uniform(lower, upper, dim)))?;
        Ok(parameter)
    }

    fn build(registry: &Arc<Registry>, id: Option<String>, values: Vec<f64>) -> Arc<RealParameter> {
        Arc::new(RealParameter {
            key: registry.next_key(),
            id: Mutex::new(id),
            values: RwLock::new(values),
            stored: Mutex::new(Vec::new()),
            ever_stored: AtomicBool::new(false),
            txn: TransactionFlag::new(),
            bounds: Mutex::new(None),
            dimension_names: Mutex::new(None),
            listeners: ListenerList::new(),
        })
    }

    pub fn set_dimension_names(&self, names: Vec<String>) -> Result<()> {
        if names.len() != self.dimension() {
            return Err(StateError::DimensionMismatch {
                context: "dimension names",
                expected: self.dimension(),
                actual: names.len(),
            });
        }
        *self.dimension_names.lock().expect("parameter poisoned") = Some(names);
        Ok(())
    }

    fn bounds_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<IntersectionBounds>>> {
        self.bounds.lock().expect("parameter poisoned")
    }
}

impl Parameter for RealParameter {
    fn key(&self) -> ParamKey {
        self.key
    }

    fn id(&self) -> Option<String> {
        self.id.lock().expect("parameter poisoned").clone()
    }

    fn set_id(&self, id: &str) {
        *self.id.lock().expect("parameter poisoned") = Some(id.to_string());
    }

    fn dimension(&self) -> usize {
        self.values.read().expect("parameter poisoned").len()
    }

    fn value(&self, index: usize) -> f64 {
        self.values.read().expect("parameter poisoned")[index]
    }

    fn values(&self) -> Vec<f64> {
        self.values.read().expect("parameter poisoned").clone()
    }

    fn set_value(&self, index: usize, value: f64) -> Result<()> {
        self.set_value_quietly(index, value)?;
        self.fire_changed(VariableChange::Value(index));
        Ok(())
    }

    fn set_value_quietly(&self, index: usize, value: f64) -> Result<()> {
        self.values.write().expect("parameter poisoned")[index] = value;
        Ok(())
    }

    fn set_dimension(&self, dim: usize) -> Result<()> {
        let old_dim = self.dimension();
        if old_dim == dim {
            return Ok(());
        }
        if self.ever_stored.load(Ordering::SeqCst) {
            return Err(StateError::ResizeAfterStore(self.name()));
        }

        // Uniform bounds survive a resize; anything else is ambiguous.
        let uniform = match self.bounds_slot().as_ref() {
            Some(bounds) => {
                let limits = (bounds.lower(0), bounds.upper(0));
                if (1..old_dim).any(|i| (bounds.lower(i), bounds.upper(i)) != limits) {
                    return Err(StateError::ResizeWithUnevenBounds(self.name()));
                }
                Some(limits)
            }
            None => None,
        };

        {
            let mut values = self.values.write().expect("parameter poisoned");
            let fill = values[0];
            values.resize(dim, fill);
        }
        if let Some((lower, upper)) = uniform {
            let rebuilt = IntersectionBounds::new(dim);
            rebuilt
                .add_bounds(Arc::new(DefaultBounds::uniform(lower, upper, dim)))
                .expect("uniform bounds match own dimension");
            *self.bounds_slot() = Some(Arc::new(rebuilt));
        }
        Ok(())
    }

    fn add_dimension(&self, index: usize, value: f64) -> Result<()> {
        if self.bounds_slot().is_some() {
            return Err(StateError::ResizeNotSupported(self.name()));
        }
        self.values
            .write()
            .expect("parameter poisoned")
            .insert(index, value);
        self.fire_changed(VariableChange::Added(index));
        Ok(())
    }

    fn remove_dimension(&self, index: usize) -> Result<f64> {
        if self.bounds_slot().is_some() {
            return Err(StateError::ResizeNotSupported(self.name()));
        }
        let value = self.values.write().expect("parameter poisoned").remove(index);
        self.fire_changed(VariableChange::Removed(index));
        Ok(value)
    }

    fn add_listener(&self, listener: Weak<dyn VariableListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Weak<dyn VariableListener>) {
        self.listeners.remove(listener);
    }

    fn is_used(&self) -> bool {
        !self.listeners.is_empty()
    }

    fn fire_changed(&self, change: VariableChange) {
        self.listeners
            .notify(|l| l.variable_changed_event(self, change));
    }

    fn store_values(&self) {
        if self.txn.try_store() {
            self.ever_stored.store(true, Ordering::SeqCst);
            let values = self.values.read().expect("parameter poisoned");
            let mut stored = self.stored.lock().expect("parameter poisoned");
            stored.clear();
            stored.extend_from_slice(&values);
        }
    }

    fn restore_values(&self) {
        if self.txn.try_restore() {
            let mut values = self.values.write().expect("parameter poisoned");
            let mut stored = self.stored.lock().expect("parameter poisoned");
            std::mem::swap(&mut *values, &mut *stored);
        }
    }

    fn accept_values(&self) {
        self.txn.try_accept();
    }

    fn adopt_values(&self, source: &dyn Parameter) -> Result<()> {
        if source.dimension() != self.dimension() {
            return Err(StateError::DimensionMismatch {
                context: "adopt_values",
                expected: self.dimension(),
                actual: source.dimension(),
            });
        }
        {
            let mut values = self.values.write().expect("parameter poisoned");
            for (i, v) in values.iter_mut().enumerate() {
                *v = source.value(i);
            }
        }
        self.txn.mark_valid();
        Ok(())
    }

    fn add_bounds(&self, bounds: Arc<dyn Bounds>) -> Result<()> {
        let mut slot = self.bounds_slot();
        let intersection = match slot.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => {
                let fresh = Arc::new(IntersectionBounds::new(self.dimension()));
                *slot = Some(Arc::clone(&fresh));
                fresh
            }
        };
        intersection.add_bounds(bounds)
    }

    fn bounds(&self) -> Option<Arc<dyn Bounds>> {
        self.bounds_slot()
            .as_ref()
            .map(|b| Arc::clone(b) as Arc<dyn Bounds>)
    }

    fn dimension_name(&self, index: usize) -> String {
        let names = self.dimension_names.lock().expect("parameter poisoned");
        match names.as_ref() {
            Some(names) => names[index].clone(),
            None => {
                if self.dimension() == 1 {
                    self.name()
                } else {
                    format!("{}{}", self.name(), index + 1)
                }
            }
        }
    }
}

/// Serialize a parameter's values as a flat array of little-endian doubles.
///
/// Building block for cross-process state exchange; the transport itself is
/// out of scope here.
pub fn send_state(parameter: &dyn Parameter, sink: &mut dyn Write) -> Result<()> {
    for value in parameter.values() {
        sink.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

/// Load a parameter's values from `source`.
///
/// Values are written quietly; exactly one `AllValues` notification fires
/// after the full vector has been loaded.
pub fn receive_state(parameter: &dyn Parameter, source: &mut dyn Read) -> Result<()> {
    let mut buf = [0u8; 8];
    for i in 0..parameter.dimension() {
        source.read_exact(&mut buf)?;
        parameter.set_value_quietly(i, f64::from_le_bytes(buf))?;
    }
    parameter.fire_changed(VariableChange::AllValues);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::Recorder;
    use super::*;
    use crate::bounds::DefaultBounds;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn loud_quiet_and_notify_all_mutations() {
        let registry = Registry::new();
        let p = RealParameter::new(&registry, "rates", vec![1.0, 2.0, 3.0]);
        let recorder = Recorder::new();
        p.add_listener(Arc::downgrade(&recorder) as Weak<dyn VariableListener>);

        p.set_value(1, 5.0).unwrap();
        p.set_value_quietly(2, 7.0).unwrap();
        p.set_value_notify_all(0, -1.0).unwrap();

        assert_eq!(p.values(), vec![-1.0, 5.0, 7.0]);
        assert_eq!(
            recorder.take(),
            vec![
                (p.key(), VariableChange::Value(1)),
                (p.key(), VariableChange::AllValues),
            ]
        );
    }

    #[test]
    fn store_restore_round_trip() {
        let registry = Registry::new();
        let p = RealParameter::new(&registry, "x", vec![1.0, 2.0]);
        p.store_values();
        p.set_value(0, 100.0).unwrap();
        p.set_value(1, 200.0).unwrap();
        p.restore_values();
        assert_eq!(p.values(), vec![1.0, 2.0]);
    }

    #[test]
    fn double_store_is_a_no_op() {
        let registry = Registry::new();
        let p = RealParameter::new(&registry, "x", vec![1.0]);
        p.store_values();
        p.set_value(0, 9.0).unwrap();
        // Without the guard this would overwrite the snapshot with 9.0.
        p.store_values();
        p.restore_values();
        assert_eq!(p.value(0), 1.0);
    }

    #[test]
    fn accept_keeps_new_values() {
        let registry = Registry::new();
        let p = RealParameter::new(&registry, "x", vec![1.0]);
        p.store_values();
        p.set_value(0, 9.0).unwrap();
        p.accept_values();
        assert_eq!(p.value(0), 9.0);
        // A restore with no pending store must not roll anything back.
        p.restore_values();
        assert_eq!(p.value(0), 9.0);
    }

    #[test]
    fn bounds_intersect_and_within_bounds() {
        let registry = Registry::new();
        let p = RealParameter::new(&registry, "x", vec![7.0]);
        assert!(p.is_within_bounds());
        p.add_bounds(Arc::new(DefaultBounds::uniform(0.0, 10.0, 1)))
            .unwrap();
        p.add_bounds(Arc::new(DefaultBounds::uniform(5.0, 20.0, 1)))
            .unwrap();
        let bounds = p.bounds().unwrap();
        assert_eq!(bounds.lower(0), 5.0);
        assert_eq!(bounds.upper(0), 10.0);
        assert!(p.is_within_bounds());
        p.set_value(0, 12.0).unwrap();
        assert!(!p.is_within_bounds());
    }

    #[test]
    fn resize_fills_with_first_value() {
        let registry = Registry::new();
        let p = RealParameter::new(&registry, "x", vec![3.0, 4.0]);
        p.set_dimension(4).unwrap();
        assert_eq!(p.values(), vec![3.0, 4.0, 3.0, 3.0]);
        p.store_values();
        assert!(matches!(
            p.set_dimension(2),
            Err(StateError::ResizeAfterStore(_))
        ));
    }

    #[test]
    fn add_remove_dimension_fire_structural_events() {
        let registry = Registry::new();
        let p = RealParameter::new(&registry, "x", vec![1.0, 3.0]);
        let recorder = Recorder::new();
        p.add_listener(Arc::downgrade(&recorder) as Weak<dyn VariableListener>);

        p.add_dimension(1, 2.0).unwrap();
        assert_eq!(p.values(), vec![1.0, 2.0, 3.0]);
        assert_eq!(p.remove_dimension(0).unwrap(), 1.0);
        assert_eq!(p.values(), vec![2.0, 3.0]);
        assert_eq!(
            recorder.take(),
            vec![
                (p.key(), VariableChange::Added(1)),
                (p.key(), VariableChange::Removed(0)),
            ]
        );
    }

    #[test]
    fn state_transfer_round_trip_fires_once() {
        let registry = Registry::new();
        let sender = RealParameter::new(&registry, "a", vec![0.5, -3.25, 8.0]);
        let receiver = RealParameter::new(&registry, "b", vec![0.0, 0.0, 0.0]);
        let recorder = Recorder::new();
        receiver.add_listener(Arc::downgrade(&recorder) as Weak<dyn VariableListener>);

        let mut wire = Vec::new();
        send_state(sender.as_ref(), &mut wire).unwrap();
        receive_state(receiver.as_ref(), &mut wire.as_slice()).unwrap();

        assert_eq!(receiver.values(), vec![0.5, -3.25, 8.0]);
        assert_eq!(
            recorder.take(),
            vec![(receiver.key(), VariableChange::AllValues)]
        );
    }

    #[test]
    fn adopt_values_checks_dimension() {
        let registry = Registry::new();
        let a = RealParameter::new(&registry, "a", vec![1.0, 2.0]);
        let b = RealParameter::new(&registry, "b", vec![5.0, 6.0]);
        let c = RealParameter::new(&registry, "c", vec![0.0]);
        a.adopt_values(b.as_ref()).unwrap();
        assert_eq!(a.values(), vec![5.0, 6.0]);
        assert!(a.adopt_values(c.as_ref()).is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_mutations_restore_exactly(
            initial in proptest::collection::vec(-1e6f64..1e6, 1..8),
            writes in proptest::collection::vec((0usize..8, -1e6f64..1e6), 0..20),
        ) {
            let registry = Registry::new();
            let p = RealParameter::new(&registry, "x", initial.clone());
            p.store_values();
            for (index, value) in writes {
                let index = index % initial.len();
                p.set_value(index, value).unwrap();
            }
            p.restore_values();
            prop_assert_eq!(p.values(), initial);
        }

        #[test]
        fn store_is_idempotent_under_interleaved_writes(
            initial in proptest::collection::vec(-1e3f64..1e3, 1..6),
            value in -1e3f64..1e3,
        ) {
            let registry = Registry::new();
            let p = RealParameter::new(&registry, "x", initial.clone());
            p.store_values();
            p.set_value(0, value).unwrap();
            p.store_values();
            p.set_value(0, value * 2.0 + 1.0).unwrap();
            p.store_values();
            p.restore_values();
            prop_assert_eq!(p.values(), initial);
        }
    }
}
