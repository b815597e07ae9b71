use std::sync::{Arc, Mutex, Weak};

use crate::bounds::Bounds;
use crate::error::{Result, StateError};
use crate::events::{ListenerList, SuppressionFlag, VariableChange, VariableListener};
use crate::registry::{ParamKey, Registry};
use crate::variable::{Parameter, TransactionFlag};

/// A monotonically increasing bijection applied dimension-wise.
pub trait Transform: Send + Sync {
    fn forward(&self, x: f64) -> f64;
    fn inverse(&self, y: f64) -> f64;
}

/// Natural log; maps `(0, inf)` to the real line.
pub struct LogTransform;

impl Transform for LogTransform {
    fn forward(&self, x: f64) -> f64 {
        x.ln()
    }

    fn inverse(&self, y: f64) -> f64 {
        y.exp()
    }
}

/// Log-odds; maps `(0, 1)` to the real line.
pub struct LogitTransform;

impl Transform for LogitTransform {
    fn forward(&self, x: f64) -> f64 {
        (x / (1.0 - x)).ln()
    }

    fn inverse(&self, y: f64) -> f64 {
        1.0 / (1.0 + (-y).exp())
    }
}

/// A parameter presenting a transformed view of another parameter.
///
/// Reads apply the forward transform to the inner values; writes apply the
/// inverse before forwarding, so the inner parameter stays the single source
/// of truth and inner events reach listeners of the view at the same index.
pub struct TransformedParameter {
    key: ParamKey,
    id: Mutex<Option<String>>,
    inner: Arc<dyn Parameter>,
    transform: Arc<dyn Transform>,
    listeners: ListenerList<dyn VariableListener>,
    quiet: SuppressionFlag,
    txn: TransactionFlag,
}

impl TransformedParameter {
    pub fn new(
        registry: &Arc<Registry>,
        id: &str,
        inner: Arc<dyn Parameter>,
        transform: Arc<dyn Transform>,
    ) -> Arc<TransformedParameter> {
        let transformed = Arc::new(TransformedParameter {
            key: registry.next_key(),
            id: Mutex::new(Some(id.to_string())),
            inner: Arc::clone(&inner),
            transform,
            listeners: ListenerList::new(),
            quiet: SuppressionFlag::new(),
            txn: TransactionFlag::new(),
        });
        inner.add_listener(Arc::downgrade(&transformed) as Weak<dyn VariableListener>);
        registry.register(Arc::downgrade(&transformed) as Weak<dyn Parameter>);
        transformed
    }
}

impl VariableListener for TransformedParameter {
    fn variable_changed_event(&self, _variable: &dyn Parameter, change: VariableChange) {
        if self.quiet.is_suppressed() {
            return;
        }
        // Dimensions line up one-to-one, no remapping needed.
        self.fire_changed(change);
    }
}

struct TransformedBounds {
    inner: Arc<dyn Bounds>,
    transform: Arc<dyn Transform>,
}

impl Bounds for TransformedBounds {
    fn lower(&self, index: usize) -> f64 {
        self.transform.forward(self.inner.lower(index))
    }

    fn upper(&self, index: usize) -> f64 {
        self.transform.forward(self.inner.upper(index))
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl Parameter for TransformedParameter {
    fn key(&self) -> ParamKey {
        self.key
    }

    fn id(&self) -> Option<String> {
        self.id.lock().expect("transform poisoned").clone()
    }

    fn set_id(&self, id: &str) {
        *self.id.lock().expect("transform poisoned") = Some(id.to_string());
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn value(&self, index: usize) -> f64 {
        self.transform.forward(self.inner.value(index))
    }

    fn set_value(&self, index: usize, value: f64) -> Result<()> {
        self.inner.set_value(index, self.transform.inverse(value))
    }

    fn set_value_quietly(&self, index: usize, value: f64) -> Result<()> {
        self.inner
            .set_value_quietly(index, self.transform.inverse(value))
    }

    fn set_value_notify_all(&self, index: usize, value: f64) -> Result<()> {
        {
            let _guard = self.quiet.suppress();
            self.inner
                .set_value_notify_all(index, self.transform.inverse(value))?;
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
            self.inner.store_values();
        }
    }

    fn restore_values(&self) {
        if self.txn.try_restore() {
            self.inner.restore_values();
        }
    }

    fn accept_values(&self) {
        if self.txn.try_accept() {
            self.inner.accept_values();
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
        self.inner.bounds().map(|inner| {
            Arc::new(TransformedBounds {
                inner,
                transform: Arc::clone(&self.transform),
            }) as Arc<dyn Bounds>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::DefaultBounds;
    use crate::variable::testing::Recorder;
    use crate::variable::RealParameter;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn log_view_round_trips_reads_and_writes() {
        let registry = Registry::new();
        let rate = RealParameter::new(&registry, "rate", vec![2.0]);
        let log_rate =
            TransformedParameter::new(&registry, "logRate", rate.clone(), Arc::new(LogTransform));

        assert_relative_eq!(log_rate.value(0), 2.0f64.ln());
        log_rate.set_value(0, 0.0).unwrap();
        assert_relative_eq!(rate.value(0), 1.0);
    }

    #[test]
    fn inner_events_reach_view_listeners() {
        let registry = Registry::new();
        let rate = RealParameter::new(&registry, "rate", vec![2.0, 3.0]);
        let view =
            TransformedParameter::new(&registry, "logRate", rate.clone(), Arc::new(LogTransform));
        let recorder = Recorder::new();
        view.add_listener(Arc::downgrade(&recorder) as Weak<dyn VariableListener>);

        rate.set_value(1, 5.0).unwrap();
        assert_eq!(recorder.take(), vec![(view.key(), VariableChange::Value(1))]);
    }

    #[test]
    fn notify_all_write_reaches_inner_listeners() {
        let registry = Registry::new();
        let rate = RealParameter::new(&registry, "rate", vec![2.0, 3.0]);
        let view =
            TransformedParameter::new(&registry, "logRate", rate.clone(), Arc::new(LogTransform));
        let on_inner = Recorder::new();
        rate.add_listener(Arc::downgrade(&on_inner) as Weak<dyn VariableListener>);
        let on_view = Recorder::new();
        view.add_listener(Arc::downgrade(&on_view) as Weak<dyn VariableListener>);

        view.set_value_notify_all(0, 0.0).unwrap();
        assert_relative_eq!(rate.value(0), 1.0);
        assert_eq!(
            on_inner.take(),
            vec![(rate.key(), VariableChange::AllValues)]
        );
        assert_eq!(
            on_view.take(),
            vec![(view.key(), VariableChange::AllValues)]
        );
    }

    #[test]
    fn bounds_are_transformed() {
        let registry = Registry::new();
        let p = RealParameter::new(&registry, "p", vec![0.5]);
        p.add_bounds(Arc::new(DefaultBounds::uniform(0.25, 0.75, 1)))
            .unwrap();
        let logit = TransformedParameter::new(&registry, "logitP", p, Arc::new(LogitTransform));
        let bounds = logit.bounds().unwrap();
        assert_relative_eq!(bounds.lower(0), (0.25f64 / 0.75).ln());
        assert_relative_eq!(bounds.upper(0), (0.75f64 / 0.25).ln());
        assert!(logit.is_within_bounds());
    }

    #[test]
    fn transactions_forward_to_inner() {
        let registry = Registry::new();
        let rate = RealParameter::new(&registry, "rate", vec![2.0]);
        let view =
            TransformedParameter::new(&registry, "logRate", rate.clone(), Arc::new(LogTransform));
        view.store_values();
        view.set_value(0, 3.0).unwrap();
        view.restore_values();
        assert_relative_eq!(rate.value(0), 2.0);
    }
}
