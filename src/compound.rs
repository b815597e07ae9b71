use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::bounds::{Bounds, CompoundBounds, IntersectionBounds};
use crate::error::{Result, StateError};
use crate::events::{ListenerList, SuppressionFlag, VariableChange, VariableListener};
use crate::registry::{ParamKey, Registry};
use crate::variable::{Parameter, TransactionFlag};

/// A parameter whose value vector is the concatenation of its children.
///
/// The compound registers itself as a listener on every child and re-fires
/// child events with the index shifted into its own index space. Child
/// offsets are recomputed on every access rather than cached, trading O(1)
/// add/remove for O(n) index lookup.
pub struct CompoundParameter {
    key: ParamKey,
    id: Mutex<Option<String>>,
    registry: Arc<Registry>,
    children: RwLock<Vec<Arc<dyn Parameter>>>,
    extra_bounds: Mutex<Vec<Arc<dyn Bounds>>>,
    listeners: ListenerList<dyn VariableListener>,
    txn: TransactionFlag,
    quiet: SuppressionFlag,
    weak_self: Weak<CompoundParameter>,
}

impl CompoundParameter {
    pub fn new(registry: &Arc<Registry>, id: &str) -> Arc<CompoundParameter> {
        let compound = Arc::new_cyclic(|weak_self| CompoundParameter {
            key: registry.next_key(),
            id: Mutex::new(Some(id.to_string())),
            registry: Arc::clone(registry),
            children: RwLock::new(Vec::new()),
            extra_bounds: Mutex::new(Vec::new()),
            listeners: ListenerList::new(),
            txn: TransactionFlag::new(),
            quiet: SuppressionFlag::new(),
            weak_self: weak_self.clone(),
        });
        registry.register(Arc::downgrade(&compound) as Weak<dyn Parameter>);
        compound
    }

    /// Append a child's dimensions to this compound.
    ///
    /// The child gets an auto-generated id if it has none, and the compound
    /// starts listening to it. Adding the same child twice is an error.
    pub fn add_parameter(&self, child: Arc<dyn Parameter>) -> Result<()> {
        if self.child_offset(child.key()).is_some() {
            return Err(StateError::DuplicateChild {
                parent: self.name(),
                child: child.name(),
            });
        }
        if child.id().is_none() {
            child.set_id(&self.registry.fresh_parameter_id());
        }
        child.add_listener(self.weak_self.clone() as Weak<dyn VariableListener>);
        self.children.write().expect("compound poisoned").push(child);
        Ok(())
    }

    /// Detach a child; later children's offsets shift down implicitly.
    pub fn remove_parameter(&self, child: &Arc<dyn Parameter>) {
        child.remove_listener(&(self.weak_self.clone() as Weak<dyn VariableListener>));
        self.children
            .write()
            .expect("compound poisoned")
            .retain(|c| c.key() != child.key());
    }

    pub fn child_count(&self) -> usize {
        self.children.read().expect("compound poisoned").len()
    }

    pub fn child(&self, index: usize) -> Arc<dyn Parameter> {
        Arc::clone(&self.children.read().expect("compound poisoned")[index])
    }

    pub(crate) fn children(&self) -> Vec<Arc<dyn Parameter>> {
        self.children.read().expect("compound poisoned").clone()
    }

    /// Map a compound dimension to `(child, child-local dimension)`.
    fn locate(&self, index: usize) -> (Arc<dyn Parameter>, usize) {
        let children = self.children.read().expect("compound poisoned");
        let mut local = index;
        for child in children.iter() {
            let dim = child.dimension();
            if local < dim {
                return (Arc::clone(child), local);
            }
            local -= dim;
        }
        panic!("compound dimension {index} out of range");
    }

    /// The dimension offset of the child with the given key.
    fn child_offset(&self, key: ParamKey) -> Option<usize> {
        let children = self.children.read().expect("compound poisoned");
        let mut offset = 0;
        for child in children.iter() {
            if child.key() == key {
                return Some(offset);
            }
            offset += child.dimension();
        }
        None
    }
}

impl VariableListener for CompoundParameter {
    fn variable_changed_event(&self, variable: &dyn Parameter, change: VariableChange) {
        if self.quiet.is_suppressed() {
            return;
        }
        let Some(offset) = self.child_offset(variable.key()) else {
            return;
        };
        self.fire_changed(change.offset_by(offset));
    }
}

impl Parameter for CompoundParameter {
    fn key(&self) -> ParamKey {
        self.key
    }

    fn id(&self) -> Option<String> {
        self.id.lock().expect("compound poisoned").clone()
    }

    fn set_id(&self, id: &str) {
        *self.id.lock().expect("compound poisoned") = Some(id.to_string());
    }

    fn dimension(&self) -> usize {
        self.children
            .read()
            .expect("compound poisoned")
            .iter()
            .map(|c| c.dimension())
            .sum()
    }

    fn value(&self, index: usize) -> f64 {
        let (child, local) = self.locate(index);
        child.value(local)
    }

    fn set_value(&self, index: usize, value: f64) -> Result<()> {
        // The child fires; our listener hook remaps and re-fires upward.
        let (child, local) = self.locate(index);
        child.set_value(local, value)
    }

    fn set_value_quietly(&self, index: usize, value: f64) -> Result<()> {
        let (child, local) = self.locate(index);
        child.set_value_quietly(local, value)
    }

    fn set_value_notify_all(&self, index: usize, value: f64) -> Result<()> {
        {
            let _guard = self.quiet.suppress();
            let (child, local) = self.locate(index);
            child.set_value_notify_all(local, value)?;
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
            for child in self.children.read().expect("compound poisoned").iter() {
                child.store_values();
            }
        }
    }

    fn restore_values(&self) {
        if self.txn.try_restore() {
            for child in self.children.read().expect("compound poisoned").iter() {
                child.restore_values();
            }
        }
    }

    fn accept_values(&self) {
        if self.txn.try_accept() {
            for child in self.children.read().expect("compound poisoned").iter() {
                child.accept_values();
            }
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
        let _guard = self.quiet.suppress();
        for i in 0..self.dimension() {
            self.set_value_quietly(i, source.value(i))?;
        }
        self.txn.mark_valid();
        Ok(())
    }

    fn add_bounds(&self, bounds: Arc<dyn Bounds>) -> Result<()> {
        if bounds.len() != self.dimension() {
            return Err(StateError::DimensionMismatch {
                context: "compound bounds",
                expected: self.dimension(),
                actual: bounds.len(),
            });
        }
        self.extra_bounds
            .lock()
            .expect("compound poisoned")
            .push(bounds);
        Ok(())
    }

    fn bounds(&self) -> Option<Arc<dyn Bounds>> {
        let concatenated: Arc<dyn Bounds> = Arc::new(CompoundBounds::new(self.children()));
        let extras = self.extra_bounds.lock().expect("compound poisoned");
        if extras.is_empty() {
            return Some(concatenated);
        }
        let intersection = IntersectionBounds::new(self.dimension());
        intersection
            .add_bounds(concatenated)
            .expect("concatenated bounds match own dimension");
        for extra in extras.iter() {
            intersection
                .add_bounds(Arc::clone(extra))
                .expect("extra bounds were dimension-checked on add");
        }
        Some(Arc::new(intersection))
    }

    fn dimension_name(&self, index: usize) -> String {
        let (child, local) = self.locate(index);
        child.dimension_name(local)
    }
}

/// Several same-sized parameters driven as one: a write goes to every
/// member, a read comes from the first.
///
/// The joint parameter does not listen to its members; mutating a member
/// directly bypasses the constraint. Use `EqualityConstrainedParameter`
/// when members are also mutated on their own.
pub struct JointParameter {
    key: ParamKey,
    id: Mutex<Option<String>>,
    children: RwLock<Vec<Arc<dyn Parameter>>>,
    extra_bounds: Mutex<Vec<Arc<dyn Bounds>>>,
    listeners: ListenerList<dyn VariableListener>,
    txn: TransactionFlag,
}

impl JointParameter {
    pub fn new(registry: &Arc<Registry>, id: &str) -> Arc<JointParameter> {
        let joint = Arc::new(JointParameter {
            key: registry.next_key(),
            id: Mutex::new(Some(id.to_string())),
            children: RwLock::new(Vec::new()),
            extra_bounds: Mutex::new(Vec::new()),
            listeners: ListenerList::new(),
            txn: TransactionFlag::new(),
        });
        registry.register(Arc::downgrade(&joint) as Weak<dyn Parameter>);
        joint
    }

    pub fn add_parameter(&self, child: Arc<dyn Parameter>) -> Result<()> {
        let mut children = self.children.write().expect("joint poisoned");
        if let Some(first) = children.first() {
            if child.dimension() != first.dimension() {
                return Err(StateError::DimensionMismatch {
                    context: "joint parameter member",
                    expected: first.dimension(),
                    actual: child.dimension(),
                });
            }
        }
        children.push(child);
        Ok(())
    }

    fn first(&self) -> Arc<dyn Parameter> {
        Arc::clone(
            self.children
                .read()
                .expect("joint poisoned")
                .first()
                .expect("joint parameter has no members"),
        )
    }
}

impl Parameter for JointParameter {
    fn key(&self) -> ParamKey {
        self.key
    }

    fn id(&self) -> Option<String> {
        self.id.lock().expect("joint poisoned").clone()
    }

    fn set_id(&self, id: &str) {
        *self.id.lock().expect("joint poisoned") = Some(id.to_string());
    }

    fn dimension(&self) -> usize {
        self.first().dimension()
    }

    fn value(&self, index: usize) -> f64 {
        self.first().value(index)
    }

    fn set_value(&self, index: usize, value: f64) -> Result<()> {
        self.set_value_quietly(index, value)?;
        self.fire_changed(VariableChange::Value(index));
        Ok(())
    }

    fn set_value_quietly(&self, index: usize, value: f64) -> Result<()> {
        for child in self.children.read().expect("joint poisoned").iter() {
            child.set_value_quietly(index, value)?;
        }
        Ok(())
    }

    fn set_value_notify_all(&self, index: usize, value: f64) -> Result<()> {
        for child in self.children.read().expect("joint poisoned").iter() {
            child.set_value_notify_all(index, value)?;
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
            for child in self.children.read().expect("joint poisoned").iter() {
                child.store_values();
            }
        }
    }

    fn restore_values(&self) {
        if self.txn.try_restore() {
            for child in self.children.read().expect("joint poisoned").iter() {
                child.restore_values();
            }
        }
    }

    fn accept_values(&self) {
        if self.txn.try_accept() {
            for child in self.children.read().expect("joint poisoned").iter() {
                child.accept_values();
            }
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

    fn add_bounds(&self, bounds: Arc<dyn Bounds>) -> Result<()> {
        if bounds.len() != self.dimension() {
            return Err(StateError::DimensionMismatch {
                context: "joint bounds",
                expected: self.dimension(),
                actual: bounds.len(),
            });
        }
        self.extra_bounds.lock().expect("joint poisoned").push(bounds);
        Ok(())
    }

    fn bounds(&self) -> Option<Arc<dyn Bounds>> {
        let dim = self.dimension();
        let intersection = IntersectionBounds::new(dim);
        for child in self.children.read().expect("joint poisoned").iter() {
            if let Some(bounds) = child.bounds() {
                intersection
                    .add_bounds(bounds)
                    .expect("members share the joint dimension");
            }
        }
        for extra in self.extra_bounds.lock().expect("joint poisoned").iter() {
            intersection
                .add_bounds(Arc::clone(extra))
                .expect("extra bounds were dimension-checked on add");
        }
        Some(Arc::new(intersection))
    }
}

/// Keeps a set of existing parameters byte-identical to each other.
///
/// Unlike `JointParameter` this listens to its members: a direct mutation
/// of any one member is copied to the others (quietly, under a suppression
/// scope) and the event re-fires once from the constraint itself.
pub struct EqualityConstrainedParameter {
    key: ParamKey,
    id: Mutex<Option<String>>,
    children: Vec<Arc<dyn Parameter>>,
    listeners: ListenerList<dyn VariableListener>,
    txn: TransactionFlag,
    quiet: SuppressionFlag,
}

impl EqualityConstrainedParameter {
    /// Bind `children` together, syncing everyone to the first member's
    /// current values.
    pub fn new(
        registry: &Arc<Registry>,
        id: &str,
        children: Vec<Arc<dyn Parameter>>,
    ) -> Result<Arc<EqualityConstrainedParameter>> {
        let first = children
            .first()
            .ok_or(StateError::DimensionMismatch {
                context: "equality constraint members",
                expected: 1,
                actual: 0,
            })?;
        let dim = first.dimension();
        for child in &children {
            if child.dimension() != dim {
                return Err(StateError::DimensionMismatch {
                    context: "equality constraint member",
                    expected: dim,
                    actual: child.dimension(),
                });
            }
        }

        let initial = first.values();
        for child in children.iter().skip(1) {
            for (i, &v) in initial.iter().enumerate() {
                child.set_value_quietly(i, v)?;
            }
        }

        let constraint = Arc::new(EqualityConstrainedParameter {
            key: registry.next_key(),
            id: Mutex::new(Some(id.to_string())),
            children,
            listeners: ListenerList::new(),
            txn: TransactionFlag::new(),
            quiet: SuppressionFlag::new(),
        });
        for child in &constraint.children {
            child.add_listener(Arc::downgrade(&constraint) as Weak<dyn VariableListener>);
        }
        registry.register(Arc::downgrade(&constraint) as Weak<dyn Parameter>);
        Ok(constraint)
    }

    fn copy_to_siblings(&self, source: &dyn Parameter) -> Result<()> {
        let values = source.values();
        let _guard = self.quiet.suppress();
        for child in &self.children {
            if child.key() == source.key() {
                continue;
            }
            for (i, &v) in values.iter().enumerate() {
                child.set_value_quietly(i, v)?;
            }
        }
        Ok(())
    }
}

impl VariableListener for EqualityConstrainedParameter {
    fn variable_changed_event(&self, variable: &dyn Parameter, change: VariableChange) {
        if self.quiet.is_suppressed() {
            return;
        }
        if self.copy_to_siblings(variable).is_err() {
            // A member refusing quiet writes breaks the constraint; surface
            // as a full-change so dependents at least recompute.
            self.fire_changed(VariableChange::AllValues);
            return;
        }
        self.fire_changed(change);
    }
}

impl Parameter for EqualityConstrainedParameter {
    fn key(&self) -> ParamKey {
        self.key
    }

    fn id(&self) -> Option<String> {
        self.id.lock().expect("constraint poisoned").clone()
    }

    fn set_id(&self, id: &str) {
        *self.id.lock().expect("constraint poisoned") = Some(id.to_string());
    }

    fn dimension(&self) -> usize {
        self.children[0].dimension()
    }

    fn value(&self, index: usize) -> f64 {
        self.children[0].value(index)
    }

    fn set_value(&self, index: usize, value: f64) -> Result<()> {
        self.set_value_quietly(index, value)?;
        self.fire_changed(VariableChange::Value(index));
        Ok(())
    }

    fn set_value_quietly(&self, index: usize, value: f64) -> Result<()> {
        let _guard = self.quiet.suppress();
        for child in &self.children {
            child.set_value_quietly(index, value)?;
        }
        Ok(())
    }

    fn set_value_notify_all(&self, index: usize, value: f64) -> Result<()> {
        {
            let _guard = self.quiet.suppress();
            for child in &self.children {
                child.set_value_notify_all(index, value)?;
            }
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
            for child in &self.children {
                child.store_values();
            }
        }
    }

    fn restore_values(&self) {
        if self.txn.try_restore() {
            for child in &self.children {
                child.restore_values();
            }
        }
    }

    fn accept_values(&self) {
        if self.txn.try_accept() {
            for child in &self.children {
                child.accept_values();
            }
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
        self.children[0].bounds()
    }
}
