use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::bounds::Bounds;
use crate::error::{Result, StateError};
use crate::events::{ListenerList, SuppressionFlag, VariableChange, VariableListener};
use crate::registry::{ParamKey, Registry};
use crate::variable::{Parameter, TransactionFlag};

/// A view of a base parameter restricted to the dimensions its mask selects.
///
/// The mask is itself a parameter of the same dimension as the base holding
/// only 0s and 1s; dimensions with mask value exactly 1 are exposed (exactly
/// 0 with the complement flag), so a mask dimension driven to any other value
/// is exposed by neither view until it returns to the valid set. Changing the
/// mask rebuilds the index map and fires a
/// single `AllValues` notification, since every exposed dimension may now
/// point somewhere else. Base events on unselected dimensions are swallowed.
pub struct MaskedParameter {
    key: ParamKey,
    id: Mutex<Option<String>>,
    base: Arc<dyn Parameter>,
    mask: Arc<dyn Parameter>,
    complement: bool,
    map: RwLock<Vec<usize>>,
    listeners: ListenerList<dyn VariableListener>,
    quiet: SuppressionFlag,
    txn: TransactionFlag,
}

impl MaskedParameter {
    pub fn new(
        registry: &Arc<Registry>,
        id: &str,
        base: Arc<dyn Parameter>,
        mask: Arc<dyn Parameter>,
    ) -> Result<Arc<MaskedParameter>> {
        Self::build(registry, id, base, mask, false)
    }

    /// Expose the dimensions whose mask value is 0 instead of 1.
    pub fn complement(
        registry: &Arc<Registry>,
        id: &str,
        base: Arc<dyn Parameter>,
        mask: Arc<dyn Parameter>,
    ) -> Result<Arc<MaskedParameter>> {
        Self::build(registry, id, base, mask, true)
    }

    fn build(
        registry: &Arc<Registry>,
        id: &str,
        base: Arc<dyn Parameter>,
        mask: Arc<dyn Parameter>,
        complement: bool,
    ) -> Result<Arc<MaskedParameter>> {
        if mask.dimension() != base.dimension() {
            return Err(StateError::DimensionMismatch {
                context: "mask parameter",
                expected: base.dimension(),
                actual: mask.dimension(),
            });
        }
        for i in 0..mask.dimension() {
            let v = mask.value(i);
            if v != 0.0 && v != 1.0 {
                return Err(StateError::InvalidMaskValue(v));
            }
        }

        let masked = Arc::new(MaskedParameter {
            key: registry.next_key(),
            id: Mutex::new(Some(id.to_string())),
            base: Arc::clone(&base),
            mask: Arc::clone(&mask),
            complement,
            map: RwLock::new(Vec::new()),
            listeners: ListenerList::new(),
            quiet: SuppressionFlag::new(),
            txn: TransactionFlag::new(),
        });
        masked.rebuild_map();
        base.add_listener(Arc::downgrade(&masked) as Weak<dyn VariableListener>);
        mask.add_listener(Arc::downgrade(&masked) as Weak<dyn VariableListener>);
        registry.register(Arc::downgrade(&masked) as Weak<dyn Parameter>);
        Ok(masked)
    }

    fn selected(&self, mask_value: f64) -> bool {
        if self.complement {
            mask_value == 0.0
        } else {
            mask_value == 1.0
        }
    }

    fn rebuild_map(&self) {
        let mut map = self.map.write().expect("mask poisoned");
        map.clear();
        for i in 0..self.mask.dimension() {
            if self.selected(self.mask.value(i)) {
                map.push(i);
            }
        }
    }

    /// The base-space index behind exposed dimension `index`.
    pub fn base_index(&self, index: usize) -> usize {
        self.map.read().expect("mask poisoned")[index]
    }
}

impl VariableListener for MaskedParameter {
    fn variable_changed_event(&self, variable: &dyn Parameter, change: VariableChange) {
        if self.quiet.is_suppressed() {
            return;
        }
        if variable.key() == self.mask.key() {
            self.rebuild_map();
            self.fire_changed(VariableChange::AllValues);
            return;
        }
        match change {
            VariableChange::Value(i) => {
                let position = {
                    let map = self.map.read().expect("mask poisoned");
                    map.iter().position(|&b| b == i)
                };
                if let Some(position) = position {
                    self.fire_changed(VariableChange::Value(position));
                }
            }
            VariableChange::AllValues => self.fire_changed(VariableChange::AllValues),
            VariableChange::Added(_) | VariableChange::Removed(_) => {
                // Structural base changes invalidate the whole map.
                self.rebuild_map();
                self.fire_changed(VariableChange::AllValues);
            }
        }
    }
}

struct MaskedBounds {
    base: Arc<dyn Bounds>,
    map: Vec<usize>,
}

impl Bounds for MaskedBounds {
    fn lower(&self, index: usize) -> f64 {
        self.base.lower(self.map[index])
    }

    fn upper(&self, index: usize) -> f64 {
        self.base.upper(self.map[index])
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

impl Parameter for MaskedParameter {
    fn key(&self) -> ParamKey {
        self.key
    }

    fn id(&self) -> Option<String> {
        self.id.lock().expect("mask poisoned").clone()
    }

    fn set_id(&self, id: &str) {
        *self.id.lock().expect("mask poisoned") = Some(id.to_string());
    }

    fn dimension(&self) -> usize {
        self.map.read().expect("mask poisoned").len()
    }

    fn value(&self, index: usize) -> f64 {
        self.base.value(self.base_index(index))
    }

    fn set_value(&self, index: usize, value: f64) -> Result<()> {
        // The base fires; our listener hook remaps into masked space.
        self.base.set_value(self.base_index(index), value)
    }

    fn set_value_quietly(&self, index: usize, value: f64) -> Result<()> {
        self.base.set_value_quietly(self.base_index(index), value)
    }

    fn set_value_notify_all(&self, index: usize, value: f64) -> Result<()> {
        {
            let _guard = self.quiet.suppress();
            self.base.set_value_notify_all(self.base_index(index), value)?;
        }
        self.fire_changed(VariableChange::AllValues);
        Ok(())
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
            self.base.store_values();
            self.mask.store_values();
        }
    }

    fn restore_values(&self) {
        if self.txn.try_restore() {
            self.base.restore_values();
            self.mask.restore_values();
            self.rebuild_map();
        }
    }

    fn accept_values(&self) {
        if self.txn.try_accept() {
            self.base.accept_values();
            self.mask.accept_values();
        }
    }

    fn adopt_values(&self, source: &dyn Parameter) -> Result<()> {
        if source.dimension() != self.dimension() {
            return Err(StateError::DimensionMismatch {
                context: "adopt_values",
                expected: self.dimension(),
                actual: source.dimension(),
            });
        }
        for i in 0..self.dimension() {
            self.set_value_quietly(i, source.value(i))?;
        }
        self.txn.mark_valid();
        Ok(())
    }

    fn add_bounds(&self, _bounds: Arc<dyn Bounds>) -> Result<()> {
        Err(StateError::BoundsNotSupported(self.name()))
    }

    fn bounds(&self) -> Option<Arc<dyn Bounds>> {
        self.base.bounds().map(|base| {
            Arc::new(MaskedBounds {
                base,
                map: self.map.read().expect("mask poisoned").clone(),
            }) as Arc<dyn Bounds>
        })
    }

    fn dimension_name(&self, index: usize) -> String {
        self.base.dimension_name(self.base_index(index))
    }
}
