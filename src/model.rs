use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::events::{ListenerList, VariableChange, VariableListener};
use crate::variable::{Parameter, TransactionFlag};

/// Observer of model-level changes.
///
/// `model_changed_event` fires when any parameter or sub-model of the source
/// changes; `model_restored` fires after a restore has rolled the source
/// back. Both must be cheap, flip-a-flag handlers.
pub trait ModelListener: Send + Sync {
    fn model_changed_event(&self, model: &ModelCore);

    fn model_restored(&self, model: &ModelCore) {
        let _ = model;
    }
}

/// The bookkeeping every model embeds: its registered parameters and
/// sub-models, its listeners, and its transaction guard.
///
/// Concrete models hold a `ModelCore` and return it from [`Model::core`];
/// the cascade methods on [`Model`] drive everything through it.
pub struct ModelCore {
    id: String,
    sub_models: RwLock<Vec<Arc<dyn Model>>>,
    variables: RwLock<Vec<Arc<dyn Parameter>>>,
    listeners: ListenerList<dyn ModelListener>,
    // Adapter structs are weakly registered with variables and sub-models;
    // the core keeps the strong references that hold them alive.
    variable_hooks: Mutex<Vec<Arc<VariableHook>>>,
    model_hooks: Mutex<Vec<Arc<ModelHook>>>,
    txn: TransactionFlag,
}

impl ModelCore {
    pub fn new(id: &str) -> ModelCore {
        ModelCore {
            id: id.to_string(),
            sub_models: RwLock::new(Vec::new()),
            variables: RwLock::new(Vec::new()),
            listeners: ListenerList::new(),
            variable_hooks: Mutex::new(Vec::new()),
            model_hooks: Mutex::new(Vec::new()),
            txn: TransactionFlag::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn variable_count(&self) -> usize {
        self.variables.read().expect("model poisoned").len()
    }

    pub fn variable(&self, index: usize) -> Arc<dyn Parameter> {
        Arc::clone(&self.variables.read().expect("model poisoned")[index])
    }

    pub fn model_count(&self) -> usize {
        self.sub_models.read().expect("model poisoned").len()
    }

    pub fn sub_model(&self, index: usize) -> Arc<dyn Model> {
        Arc::clone(&self.sub_models.read().expect("model poisoned")[index])
    }

    pub fn add_listener(&self, listener: Weak<dyn ModelListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Weak<dyn ModelListener>) {
        self.listeners.remove(listener);
    }

    pub fn is_used(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Notify listeners that this model's state has changed.
    pub fn fire_model_changed(&self) {
        self.listeners.notify(|l| l.model_changed_event(self));
    }

    fn fire_model_restored(&self) {
        self.listeners.notify(|l| l.model_restored(self));
    }

    fn snapshot_variables(&self) -> Vec<Arc<dyn Parameter>> {
        self.variables.read().expect("model poisoned").clone()
    }

    fn snapshot_models(&self) -> Vec<Arc<dyn Model>> {
        self.sub_models.read().expect("model poisoned").clone()
    }

    fn contains_variable(&self, variable: &Arc<dyn Parameter>) -> bool {
        self.variables
            .read()
            .expect("model poisoned")
            .iter()
            .any(|v| v.key() == variable.key())
    }

    fn contains_model(&self, model: &Arc<dyn Model>) -> bool {
        self.sub_models
            .read()
            .expect("model poisoned")
            .iter()
            .any(|m| Arc::ptr_eq(m, model))
    }
}

/// Relays a variable's change events into the owning model.
struct VariableHook {
    owner: Weak<dyn Model>,
}

impl VariableListener for VariableHook {
    fn variable_changed_event(&self, variable: &dyn Parameter, change: VariableChange) {
        if let Some(owner) = self.owner.upgrade() {
            owner.handle_variable_changed(variable, change);
            owner.core().fire_model_changed();
        }
    }
}

/// Relays a sub-model's change events into the owning model.
struct ModelHook {
    owner: Weak<dyn Model>,
}

impl ModelListener for ModelHook {
    fn model_changed_event(&self, model: &ModelCore) {
        if let Some(owner) = self.owner.upgrade() {
            owner.handle_model_changed(model);
            owner.core().fire_model_changed();
        }
    }

    // A restored sub-model invalidates the owner like a change. When the
    // restore is driven from above, the owner's own restore_state hook runs
    // after all sub-model restores and has the last word on its caches.
    fn model_restored(&self, model: &ModelCore) {
        if let Some(owner) = self.owner.upgrade() {
            owner.handle_model_changed(model);
            owner.core().fire_model_changed();
        }
    }
}

/// A node in the model graph: a set of parameters and sub-models with
/// transactional state and change propagation.
///
/// The transaction cascade is fixed here and deliberately asymmetric:
/// store descends sub-models first, then variables, then the model's own
/// hook; restore and accept run variables first, then sub-models, then the
/// hook. Each node participates at most once per cycle however many owners
/// reach it.
pub trait Model: Send + Sync {
    fn core(&self) -> &ModelCore;

    /// React to a registered sub-model having changed.
    fn handle_model_changed(&self, model: &ModelCore);

    /// React to a registered variable having changed.
    fn handle_variable_changed(&self, variable: &dyn Parameter, change: VariableChange);

    /// Snapshot any internal state beyond the registered variables.
    fn store_state(&self);

    /// Roll internal state back to the snapshot.
    fn restore_state(&self);

    /// Commit internal state; the snapshot is dead after this.
    fn accept_state(&self);

    /// Register a variable: its change events now reach
    /// [`Model::handle_variable_changed`] and the model's listeners, and it
    /// joins the transaction cascade. Re-registering is a no-op.
    fn add_variable(self: &Arc<Self>, variable: Arc<dyn Parameter>)
    where
        Self: Sized + 'static,
    {
        let core = self.core();
        if core.contains_variable(&variable) {
            return;
        }
        let hook = Arc::new(VariableHook {
            owner: Arc::downgrade(self) as Weak<dyn Model>,
        });
        variable.add_listener(Arc::downgrade(&hook) as Weak<dyn VariableListener>);
        core.variable_hooks
            .lock()
            .expect("model poisoned")
            .push(hook);
        core.variables
            .write()
            .expect("model poisoned")
            .push(variable);
    }

    /// Register a sub-model; its change events now reach
    /// [`Model::handle_model_changed`] and the model's listeners, and it
    /// joins the transaction cascade. Re-registering is a no-op.
    fn add_model(self: &Arc<Self>, sub_model: Arc<dyn Model>)
    where
        Self: Sized + 'static,
    {
        let core = self.core();
        if core.contains_model(&sub_model) {
            return;
        }
        let hook = Arc::new(ModelHook {
            owner: Arc::downgrade(self) as Weak<dyn Model>,
        });
        sub_model
            .core()
            .add_listener(Arc::downgrade(&hook) as Weak<dyn ModelListener>);
        core.model_hooks.lock().expect("model poisoned").push(hook);
        core.sub_models
            .write()
            .expect("model poisoned")
            .push(sub_model);
    }

    /// Snapshot this model and everything below it.
    fn store_model_state(&self) {
        let core = self.core();
        if core.txn.try_store() {
            for sub_model in core.snapshot_models() {
                sub_model.store_model_state();
            }
            for variable in core.snapshot_variables() {
                variable.store_values();
            }
            self.store_state();
        }
    }

    /// Roll this model and everything below it back, then tell listeners.
    fn restore_model_state(&self) {
        let core = self.core();
        if core.txn.try_restore() {
            for variable in core.snapshot_variables() {
                variable.restore_values();
            }
            for sub_model in core.snapshot_models() {
                sub_model.restore_model_state();
            }
            self.restore_state();
            core.fire_model_restored();
        }
    }

    /// Commit this model and everything below it.
    fn accept_model_state(&self) {
        let core = self.core();
        if core.txn.try_accept() {
            for variable in core.snapshot_variables() {
                variable.accept_values();
            }
            for sub_model in core.snapshot_models() {
                sub_model.accept_model_state();
            }
            self.accept_state();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A model that logs its lifecycle calls to a shared journal.
    pub(crate) struct JournalingModel {
        core: ModelCore,
        pub journal: Arc<Mutex<Vec<String>>>,
    }

    impl JournalingModel {
        pub fn new(id: &str, journal: Arc<Mutex<Vec<String>>>) -> Arc<JournalingModel> {
            Arc::new(JournalingModel {
                core: ModelCore::new(id),
                journal,
            })
        }

        fn log(&self, event: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.core.id(), event));
        }
    }

    impl Model for JournalingModel {
        fn core(&self) -> &ModelCore {
            &self.core
        }

        fn handle_model_changed(&self, model: &ModelCore) {
            self.log(&format!("model-changed({})", model.id()));
        }

        fn handle_variable_changed(&self, variable: &dyn Parameter, _change: VariableChange) {
            self.log(&format!("variable-changed({})", variable.name()));
        }

        fn store_state(&self) {
            self.log("store");
        }

        fn restore_state(&self) {
            self.log("restore");
        }

        fn accept_state(&self) {
            self.log("accept");
        }
    }

    /// Records model notifications, for asserting propagation.
    pub(crate) struct ModelRecorder {
        pub changed: Mutex<Vec<String>>,
        pub restored: Mutex<Vec<String>>,
    }

    impl ModelRecorder {
        pub fn new() -> Arc<ModelRecorder> {
            Arc::new(ModelRecorder {
                changed: Mutex::new(Vec::new()),
                restored: Mutex::new(Vec::new()),
            })
        }
    }

    impl ModelListener for ModelRecorder {
        fn model_changed_event(&self, model: &ModelCore) {
            self.changed.lock().unwrap().push(model.id().to_string());
        }

        fn model_restored(&self, model: &ModelCore) {
            self.restored.lock().unwrap().push(model.id().to_string());
        }
    }
}
