use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use crate::variable::Parameter;

/// Stable identity of a parameter within one registry.
///
/// Keys are what listeners use to tell event sources apart; string ids are
/// optional and only needed for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamKey(u64);

/// Tracks every parameter of one model graph.
///
/// Identity is an explicit object passed through construction, never
/// process-wide state, so several independent graphs (for example parallel
/// chains in one process) cannot cross-contaminate. The registry hands out
/// unique keys, generates ids for anonymous parameters, and keeps weak
/// references for whole-graph reports.
pub struct Registry {
    next_key: AtomicU64,
    next_auto_id: AtomicU64,
    parameters: Mutex<Vec<Weak<dyn Parameter>>>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            next_key: AtomicU64::new(0),
            next_auto_id: AtomicU64::new(0),
            parameters: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn next_key(&self) -> ParamKey {
        ParamKey(self.next_key.fetch_add(1, Ordering::SeqCst))
    }

    /// A fresh id for a parameter that was assembled without one.
    pub fn fresh_parameter_id(&self) -> String {
        format!("parameter.{}", self.next_auto_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn register(&self, parameter: Weak<dyn Parameter>) {
        self.parameters
            .lock()
            .expect("registry poisoned")
            .push(parameter);
    }

    /// All parameters of this graph that are still alive, in construction
    /// order.
    pub fn parameters(&self) -> Vec<Arc<dyn Parameter>> {
        let mut guard = self.parameters.lock().expect("registry poisoned");
        guard.retain(|p| p.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::RealParameter;

    #[test]
    fn registries_are_independent() {
        let a = Registry::new();
        let b = Registry::new();
        let _pa = RealParameter::with_value(&a, "x", 2, 1.0);
        assert_eq!(a.parameters().len(), 1);
        assert_eq!(b.parameters().len(), 0);
        assert_eq!(a.fresh_parameter_id(), "parameter.0");
        assert_eq!(b.fresh_parameter_id(), "parameter.0");
    }

    #[test]
    fn dropped_parameters_are_pruned() {
        let registry = Registry::new();
        let p = RealParameter::with_value(&registry, "x", 1, 0.0);
        assert_eq!(registry.parameters().len(), 1);
        drop(p);
        assert_eq!(registry.parameters().len(), 0);
    }
}
