use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use rayon::prelude::*;

use crate::error::Result;
use crate::events::VariableChange;
use crate::model::{Model, ModelCore};
use crate::variable::Parameter;

/// The log likelihood of an impossible state.
///
/// Returning this is the rejection signal: it is not an error, and every
/// compound containing such a term evaluates to it.
pub const LOG_ZERO: f64 = f64::NEG_INFINITY;

/// A log-likelihood term over some part of the model graph.
pub trait Likelihood: Send + Sync {
    fn id(&self) -> String;

    /// The current log likelihood, recomputing only if a dependency changed
    /// since the last evaluation.
    fn log_likelihood(&self) -> f64;

    /// Drop any cached value; the next read recomputes from scratch.
    fn make_dirty(&self);

    /// Whether this term is cheap enough to evaluate before the expensive
    /// ones, so a `-inf` here can veto the state early.
    fn evaluate_early(&self) -> bool {
        false
    }
}

/// The actual density computation behind a [`CachedLikelihood`].
pub trait LogDensity: Send + Sync {
    fn log_density(&self) -> f64;
}

impl<F> LogDensity for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn log_density(&self) -> f64 {
        self()
    }
}

struct CacheSlot {
    known: bool,
    value: f64,
    stored: Option<(bool, f64)>,
}

/// Validity-flagged scalar cache with transactional snapshots.
///
/// Store snapshots the value together with its validity; restore puts both
/// back, so a rejected move serves the previously accepted likelihood
/// without recomputation.
pub struct LikelihoodCache {
    slot: Mutex<CacheSlot>,
    evaluations: AtomicU64,
}

impl LikelihoodCache {
    pub fn new() -> LikelihoodCache {
        LikelihoodCache {
            slot: Mutex::new(CacheSlot {
                known: false,
                value: 0.0,
                stored: None,
            }),
            evaluations: AtomicU64::new(0),
        }
    }

    pub fn value_with(&self, compute: impl FnOnce() -> f64) -> f64 {
        let mut slot = self.slot.lock().expect("likelihood cache poisoned");
        if !slot.known {
            slot.value = compute();
            slot.known = true;
            self.evaluations.fetch_add(1, Ordering::SeqCst);
        }
        slot.value
    }

    pub fn invalidate(&self) {
        self.slot.lock().expect("likelihood cache poisoned").known = false;
    }

    pub fn store(&self) {
        let mut slot = self.slot.lock().expect("likelihood cache poisoned");
        slot.stored = Some((slot.known, slot.value));
    }

    pub fn restore(&self) {
        let mut slot = self.slot.lock().expect("likelihood cache poisoned");
        match slot.stored.take() {
            Some((known, value)) => {
                slot.known = known;
                slot.value = value;
            }
            None => slot.known = false,
        }
    }

    pub fn accept(&self) {
        self.slot.lock().expect("likelihood cache poisoned").stored = None;
    }

    /// How many times the density has actually been computed.
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }
}

impl Default for LikelihoodCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A likelihood over a model, caching its value until the model changes.
///
/// The likelihood is itself a model node: the observed model is registered
/// as a sub-model, so any change below it flips the cache invalid, and the
/// transaction cascade snapshots and restores the cached value alongside
/// the model state.
pub struct CachedLikelihood<D: LogDensity> {
    core: ModelCore,
    density: D,
    cache: LikelihoodCache,
    early: bool,
}

impl<D: LogDensity + 'static> CachedLikelihood<D> {
    pub fn new(id: &str, model: Arc<dyn Model>, density: D) -> Arc<CachedLikelihood<D>> {
        Self::build(id, model, density, false)
    }

    /// A term that [`CompoundLikelihood`] evaluates in the early, vetoing
    /// pass.
    pub fn new_early(id: &str, model: Arc<dyn Model>, density: D) -> Arc<CachedLikelihood<D>> {
        Self::build(id, model, density, true)
    }

    fn build(
        id: &str,
        model: Arc<dyn Model>,
        density: D,
        early: bool,
    ) -> Arc<CachedLikelihood<D>> {
        let likelihood = Arc::new(CachedLikelihood {
            core: ModelCore::new(id),
            density,
            cache: LikelihoodCache::new(),
            early,
        });
        likelihood.add_model(model);
        likelihood
    }

    pub fn cache(&self) -> &LikelihoodCache {
        &self.cache
    }

    pub fn model(&self) -> Arc<dyn Model> {
        self.core.sub_model(0)
    }
}

impl<D: LogDensity> Model for CachedLikelihood<D> {
    fn core(&self) -> &ModelCore {
        &self.core
    }

    fn handle_model_changed(&self, _model: &ModelCore) {
        self.cache.invalidate();
    }

    fn handle_variable_changed(&self, _variable: &dyn Parameter, _change: VariableChange) {
        self.cache.invalidate();
    }

    fn store_state(&self) {
        self.cache.store();
    }

    fn restore_state(&self) {
        self.cache.restore();
    }

    fn accept_state(&self) {
        self.cache.accept();
    }
}

impl<D: LogDensity> Likelihood for CachedLikelihood<D> {
    fn id(&self) -> String {
        self.core.id().to_string()
    }

    fn log_likelihood(&self) -> f64 {
        self.cache.value_with(|| self.density.log_density())
    }

    fn make_dirty(&self) {
        self.cache.invalidate();
    }

    fn evaluate_early(&self) -> bool {
        self.early
    }
}

/// The sum of a set of likelihood terms.
///
/// Terms flagged `evaluate_early` run first, sequentially, and a `-inf`
/// among them vetoes the state before any expensive term runs. The
/// remaining terms run either sequentially with the same short-circuit, or
/// on a dedicated thread pool where `-inf` dominates the sum instead.
pub struct CompoundLikelihood {
    id: String,
    early: Vec<Arc<dyn Likelihood>>,
    late: Vec<Arc<dyn Likelihood>>,
    pool: Option<rayon::ThreadPool>,
}

impl CompoundLikelihood {
    pub fn new(id: &str, terms: Vec<Arc<dyn Likelihood>>) -> CompoundLikelihood {
        Self::build(id, terms, None)
    }

    /// Evaluate the non-early terms on `threads` dedicated workers.
    pub fn parallel(
        id: &str,
        terms: Vec<Arc<dyn Likelihood>>,
        threads: usize,
    ) -> Result<CompoundLikelihood> {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
        Ok(Self::build(id, terms, Some(pool)))
    }

    fn build(
        id: &str,
        terms: Vec<Arc<dyn Likelihood>>,
        pool: Option<rayon::ThreadPool>,
    ) -> CompoundLikelihood {
        let (early, late) = terms.into_iter().partition(|t| t.evaluate_early());
        CompoundLikelihood {
            id: id.to_string(),
            early,
            late,
            pool,
        }
    }

    pub fn term_count(&self) -> usize {
        self.early.len() + self.late.len()
    }
}

impl Likelihood for CompoundLikelihood {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn log_likelihood(&self) -> f64 {
        let mut total = 0.0;
        for term in &self.early {
            total += term.log_likelihood();
            if total == LOG_ZERO {
                return LOG_ZERO;
            }
        }
        match &self.pool {
            Some(pool) => {
                total += pool.install(|| {
                    self.late
                        .par_iter()
                        .map(|term| term.log_likelihood())
                        .sum::<f64>()
                });
            }
            None => {
                for term in &self.late {
                    total += term.log_likelihood();
                    if total == LOG_ZERO {
                        return LOG_ZERO;
                    }
                }
            }
        }
        total
    }

    fn make_dirty(&self) {
        for term in self.early.iter().chain(&self.late) {
            term.make_dirty();
        }
    }
}
