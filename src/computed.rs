use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use faer::linalg::solvers::Solve;
use faer::prelude::*;
use faer::Mat;
use itertools::izip;

use crate::bounds::Bounds;
use crate::error::{Result, StateError};
use crate::events::{ListenerList, VariableChange, VariableListener};
use crate::registry::{ParamKey, Registry};
use crate::variable::{Parameter, TransactionFlag};

/// The deterministic function behind a derived matrix parameter.
///
/// `compute` fills a column-major buffer of `rows * cols` values from the
/// current state of `inputs`. It must be total: numerically pathological
/// input should produce non-finite entries rather than fail, leaving the
/// downstream likelihood to reject the state.
pub trait MatrixFunction: Send + Sync + 'static {
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;
    fn inputs(&self) -> Vec<Arc<dyn Parameter>>;
    fn compute(&self, out: &mut [f64]);
}

struct CacheState {
    values: Vec<f64>,
    known: bool,
    stored: Option<(Vec<f64>, bool)>,
}

/// Validity-flagged cache for a derived parameter.
///
/// State machine: unknown -> (on read) compute -> known -> (on any upstream
/// change) unknown. Store snapshots the numeric cache together with the
/// validity flag and restore puts both back exactly, so a rejected move
/// neither serves stale data nor forces a spurious recompute.
pub struct DerivedCache {
    state: Mutex<CacheState>,
    computes: AtomicU64,
}

impl DerivedCache {
    fn new(len: usize) -> DerivedCache {
        DerivedCache {
            state: Mutex::new(CacheState {
                values: vec![0.0; len],
                known: false,
                stored: None,
            }),
            computes: AtomicU64::new(0),
        }
    }

    fn invalidate(&self) {
        self.state.lock().expect("cache poisoned").known = false;
    }

    fn with_values<R>(&self, compute: impl FnOnce(&mut [f64]), read: impl FnOnce(&[f64]) -> R) -> R {
        let mut state = self.state.lock().expect("cache poisoned");
        if !state.known {
            compute(&mut state.values);
            state.known = true;
            self.computes.fetch_add(1, Ordering::SeqCst);
        }
        read(&state.values)
    }

    fn store(&self) {
        let mut state = self.state.lock().expect("cache poisoned");
        state.stored = Some((state.values.clone(), state.known));
    }

    fn restore(&self) {
        let mut state = self.state.lock().expect("cache poisoned");
        match state.stored.take() {
            Some((values, known)) => {
                state.values = values;
                state.known = known;
            }
            // Recomputing from restored inputs is always safe.
            None => state.known = false,
        }
    }

    fn accept(&self) {
        self.state.lock().expect("cache poisoned").stored = None;
    }

    /// How many times the compute hook has run. Diagnostic only.
    pub fn recompute_count(&self) -> u64 {
        self.computes.load(Ordering::SeqCst)
    }
}

/// A read-only matrix parameter computed from other parameters.
///
/// The only legal mutation path is through the underlying parameters: every
/// direct write variant fails without touching any state. The derived
/// parameter listens to its inputs and flips its cache invalid on any
/// upstream change; recomputation happens lazily on the next read.
pub struct DerivedMatrixParameter<F: MatrixFunction> {
    key: ParamKey,
    id: Mutex<Option<String>>,
    function: F,
    cache: DerivedCache,
    listeners: ListenerList<dyn VariableListener>,
    txn: TransactionFlag,
}

impl<F: MatrixFunction> DerivedMatrixParameter<F> {
    pub fn from_function(
        registry: &Arc<Registry>,
        id: &str,
        function: F,
    ) -> Arc<DerivedMatrixParameter<F>> {
        let len = function.rows() * function.cols();
        let derived = Arc::new(DerivedMatrixParameter {
            key: registry.next_key(),
            id: Mutex::new(Some(id.to_string())),
            function,
            cache: DerivedCache::new(len),
            listeners: ListenerList::new(),
            txn: TransactionFlag::new(),
        });
        for input in derived.function.inputs() {
            input.add_listener(Arc::downgrade(&derived) as Weak<dyn VariableListener>);
        }
        registry.register(Arc::downgrade(&derived) as Weak<dyn Parameter>);
        derived
    }

    pub fn rows(&self) -> usize {
        self.function.rows()
    }

    pub fn cols(&self) -> usize {
        self.function.cols()
    }

    pub fn value_at(&self, row: usize, col: usize) -> f64 {
        self.value(col * self.function.rows() + row)
    }

    pub fn cache(&self) -> &DerivedCache {
        &self.cache
    }

    fn reject_write(&self) -> StateError {
        StateError::DerivedParameterWrite(self.name())
    }
}

impl<F: MatrixFunction> VariableListener for DerivedMatrixParameter<F> {
    fn variable_changed_event(&self, _variable: &dyn Parameter, _change: VariableChange) {
        // Flip the flag and pass the change on; never recompute here.
        self.cache.invalidate();
        self.fire_changed(VariableChange::AllValues);
    }
}

impl<F: MatrixFunction> Parameter for DerivedMatrixParameter<F> {
    fn key(&self) -> ParamKey {
        self.key
    }

    fn id(&self) -> Option<String> {
        self.id.lock().expect("derived poisoned").clone()
    }

    fn set_id(&self, id: &str) {
        *self.id.lock().expect("derived poisoned") = Some(id.to_string());
    }

    fn dimension(&self) -> usize {
        self.function.rows() * self.function.cols()
    }

    fn value(&self, index: usize) -> f64 {
        self.cache
            .with_values(|out| self.function.compute(out), |values| values[index])
    }

    fn values(&self) -> Vec<f64> {
        self.cache
            .with_values(|out| self.function.compute(out), |values| values.to_vec())
    }

    fn set_value(&self, _index: usize, _value: f64) -> Result<()> {
        Err(self.reject_write())
    }

    fn set_value_quietly(&self, _index: usize, _value: f64) -> Result<()> {
        Err(self.reject_write())
    }

    fn set_value_notify_all(&self, _index: usize, _value: f64) -> Result<()> {
        Err(self.reject_write())
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
            for input in self.function.inputs() {
                input.store_values();
            }
            self.cache.store();
        }
    }

    fn restore_values(&self) {
        if self.txn.try_restore() {
            for input in self.function.inputs() {
                input.restore_values();
            }
            self.cache.restore();
        }
    }

    fn accept_values(&self) {
        if self.txn.try_accept() {
            for input in self.function.inputs() {
                input.accept_values();
            }
            self.cache.accept();
        }
    }

    fn adopt_values(&self, _source: &dyn Parameter) -> Result<()> {
        Err(self.reject_write())
    }

    fn add_bounds(&self, _bounds: Arc<dyn Bounds>) -> Result<()> {
        Err(StateError::BoundsNotSupported(self.name()))
    }

    fn bounds(&self) -> Option<Arc<dyn Bounds>> {
        None
    }
}

fn read_square(parameter: &Arc<dyn Parameter>, n: usize) -> Mat<f64> {
    Mat::from_fn(n, n, |r, c| parameter.value(c * n + r))
}

fn write_column_major(out: &mut [f64], matrix: &Mat<f64>) {
    let rows = matrix.nrows();
    for c in 0..matrix.ncols() {
        for r in 0..rows {
            out[c * rows + r] = matrix[(r, c)];
        }
    }
}

/// Inverse of an underlying square matrix parameter.
pub struct MatrixInverseFunction {
    base: Arc<dyn Parameter>,
    dim: usize,
}

impl MatrixFunction for MatrixInverseFunction {
    fn rows(&self) -> usize {
        self.dim
    }

    fn cols(&self) -> usize {
        self.dim
    }

    fn inputs(&self) -> Vec<Arc<dyn Parameter>> {
        vec![Arc::clone(&self.base)]
    }

    fn compute(&self, out: &mut [f64]) {
        let n = self.dim;
        let lu = read_square(&self.base, n).partial_piv_lu();
        let inverse = lu.solve(Mat::<f64>::identity(n, n));
        write_column_major(out, &inverse);
    }
}

pub type CachedMatrixInverse = DerivedMatrixParameter<MatrixInverseFunction>;

impl CachedMatrixInverse {
    pub fn new(
        registry: &Arc<Registry>,
        id: &str,
        base: Arc<dyn Parameter>,
    ) -> Result<Arc<CachedMatrixInverse>> {
        let dim = square_side(&base, "matrix inverse base")?;
        Ok(Self::from_function(
            registry,
            id,
            MatrixInverseFunction { base, dim },
        ))
    }
}

/// `Q diag(lambda) Q^-1` assembled from eigenvector and eigenvalue
/// parameters.
pub struct CompoundEigenFunction {
    vectors: Arc<dyn Parameter>,
    values: Arc<dyn Parameter>,
    dim: usize,
}

impl MatrixFunction for CompoundEigenFunction {
    fn rows(&self) -> usize {
        self.dim
    }

    fn cols(&self) -> usize {
        self.dim
    }

    fn inputs(&self) -> Vec<Arc<dyn Parameter>> {
        vec![Arc::clone(&self.vectors), Arc::clone(&self.values)]
    }

    fn compute(&self, out: &mut [f64]) {
        let n = self.dim;
        let q = read_square(&self.vectors, n);
        let scaled = Mat::from_fn(n, n, |r, c| q[(r, c)] * self.values.value(c));
        let q_inverse = q.partial_piv_lu().solve(Mat::<f64>::identity(n, n));
        let matrix = scaled * q_inverse;
        write_column_major(out, &matrix);
    }
}

pub type CompoundEigenMatrix = DerivedMatrixParameter<CompoundEigenFunction>;

impl CompoundEigenMatrix {
    pub fn new(
        registry: &Arc<Registry>,
        id: &str,
        vectors: Arc<dyn Parameter>,
        values: Arc<dyn Parameter>,
    ) -> Result<Arc<CompoundEigenMatrix>> {
        let dim = square_side(&vectors, "eigenvector matrix")?;
        if values.dimension() != dim {
            return Err(StateError::DimensionMismatch {
                context: "eigenvalue vector",
                expected: dim,
                actual: values.dimension(),
            });
        }
        Ok(Self::from_function(
            registry,
            id,
            CompoundEigenFunction { vectors, values, dim },
        ))
    }
}

/// Block-diagonal rotation matrix built from k angles: block i is the 2x2
/// rotation by `angles[i]`, giving a `2k x 2k` matrix.
pub struct BlockRotationFunction {
    angles: Arc<dyn Parameter>,
}

impl MatrixFunction for BlockRotationFunction {
    fn rows(&self) -> usize {
        2 * self.angles.dimension()
    }

    fn cols(&self) -> usize {
        2 * self.angles.dimension()
    }

    fn inputs(&self) -> Vec<Arc<dyn Parameter>> {
        vec![Arc::clone(&self.angles)]
    }

    fn compute(&self, out: &mut [f64]) {
        let n = self.rows();
        out.fill(0.0);
        for i in 0..self.angles.dimension() {
            let (sin, cos) = self.angles.value(i).sin_cos();
            let (r, c) = (2 * i, 2 * i);
            out[c * n + r] = cos;
            out[(c + 1) * n + r] = -sin;
            out[c * n + r + 1] = sin;
            out[(c + 1) * n + r + 1] = cos;
        }
    }
}

pub type BlockDiagonalCosSinMatrix = DerivedMatrixParameter<BlockRotationFunction>;

impl BlockDiagonalCosSinMatrix {
    pub fn new(
        registry: &Arc<Registry>,
        id: &str,
        angles: Arc<dyn Parameter>,
    ) -> Arc<BlockDiagonalCosSinMatrix> {
        Self::from_function(registry, id, BlockRotationFunction { angles })
    }
}

/// Column `j` of the underlying matrix multiplied by `scale[j]`.
pub struct ColumnScaleFunction {
    matrix: Arc<dyn Parameter>,
    scale: Arc<dyn Parameter>,
    rows: usize,
}

impl MatrixFunction for ColumnScaleFunction {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.scale.dimension()
    }

    fn inputs(&self) -> Vec<Arc<dyn Parameter>> {
        vec![Arc::clone(&self.matrix), Arc::clone(&self.scale)]
    }

    fn compute(&self, out: &mut [f64]) {
        for c in 0..self.cols() {
            let scale = self.scale.value(c);
            for r in 0..self.rows {
                let flat = c * self.rows + r;
                out[flat] = self.matrix.value(flat) * scale;
            }
        }
    }
}

pub type ScaledMatrixParameter = DerivedMatrixParameter<ColumnScaleFunction>;

impl ScaledMatrixParameter {
    pub fn new(
        registry: &Arc<Registry>,
        id: &str,
        matrix: Arc<dyn Parameter>,
        scale: Arc<dyn Parameter>,
        rows: usize,
    ) -> Result<Arc<ScaledMatrixParameter>> {
        if matrix.dimension() != rows * scale.dimension() {
            return Err(StateError::DimensionMismatch {
                context: "scaled matrix base",
                expected: rows * scale.dimension(),
                actual: matrix.dimension(),
            });
        }
        Ok(Self::from_function(
            registry,
            id,
            ColumnScaleFunction { matrix, scale, rows },
        ))
    }
}

/// Elementwise `left - right` of two equal-shape matrix parameters.
pub struct MatrixDifferenceFunction {
    left: Arc<dyn Parameter>,
    right: Arc<dyn Parameter>,
    rows: usize,
    cols: usize,
}

impl MatrixFunction for MatrixDifferenceFunction {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn inputs(&self) -> Vec<Arc<dyn Parameter>> {
        vec![Arc::clone(&self.left), Arc::clone(&self.right)]
    }

    fn compute(&self, out: &mut [f64]) {
        let left = self.left.values();
        let right = self.right.values();
        izip!(out.iter_mut(), left, right).for_each(|(out, l, r)| *out = l - r);
    }
}

pub type DifferenceMatrixParameter = DerivedMatrixParameter<MatrixDifferenceFunction>;

impl DifferenceMatrixParameter {
    pub fn new(
        registry: &Arc<Registry>,
        id: &str,
        left: Arc<dyn Parameter>,
        right: Arc<dyn Parameter>,
        rows: usize,
        cols: usize,
    ) -> Result<Arc<DifferenceMatrixParameter>> {
        for (side, p) in [("left", &left), ("right", &right)] {
            if p.dimension() != rows * cols {
                return Err(StateError::DimensionMismatch {
                    context: if side == "left" {
                        "difference matrix left operand"
                    } else {
                        "difference matrix right operand"
                    },
                    expected: rows * cols,
                    actual: p.dimension(),
                });
            }
        }
        Ok(Self::from_function(
            registry,
            id,
            MatrixDifferenceFunction {
                left,
                right,
                rows,
                cols,
            },
        ))
    }
}

fn square_side(parameter: &Arc<dyn Parameter>, context: &'static str) -> Result<usize> {
    let len = parameter.dimension();
    let side = (len as f64).sqrt().round() as usize;
    if side * side != len {
        return Err(StateError::DimensionMismatch {
            context,
            expected: side * side,
            actual: len,
        });
    }
    Ok(side)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::testing::Recorder;
    use crate::variable::RealParameter;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    fn two_by_two(registry: &Arc<Registry>, values: Vec<f64>) -> Arc<RealParameter> {
        RealParameter::new(registry, "m", values)
    }

    #[test]
    fn inverse_of_diagonal_matrix() {
        let registry = Registry::new();
        let base = two_by_two(&registry, vec![2.0, 0.0, 0.0, 4.0]);
        let inverse = CachedMatrixInverse::new(&registry, "mInv", base).unwrap();
        assert_relative_eq!(inverse.value_at(0, 0), 0.5);
        assert_relative_eq!(inverse.value_at(1, 1), 0.25);
        assert_relative_eq!(inverse.value_at(0, 1), 0.0);
    }

    #[test]
    fn recomputes_exactly_once_per_invalidation_and_read_cycle() {
        let registry = Registry::new();
        let base = two_by_two(&registry, vec![2.0, 0.0, 0.0, 4.0]);
        let inverse = CachedMatrixInverse::new(&registry, "mInv", base.clone()).unwrap();

        assert_eq!(inverse.cache().recompute_count(), 0);
        inverse.value(0);
        inverse.value(3);
        assert_eq!(inverse.cache().recompute_count(), 1);

        // Two invalidations, no reads in between: still one extra compute.
        base.set_value(0, 8.0).unwrap();
        base.set_value(3, 8.0).unwrap();
        assert_eq!(inverse.cache().recompute_count(), 1);
        assert_relative_eq!(inverse.value_at(0, 0), 0.125);
        assert_relative_eq!(inverse.value_at(1, 1), 0.125);
        assert_eq!(inverse.cache().recompute_count(), 2);
    }

    #[test]
    fn direct_writes_fail_and_change_nothing() {
        let registry = Registry::new();
        let base = two_by_two(&registry, vec![2.0, 0.0, 0.0, 4.0]);
        let inverse = CachedMatrixInverse::new(&registry, "mInv", base.clone()).unwrap();
        let before = inverse.values();

        assert!(matches!(
            inverse.set_value(0, 1.0),
            Err(StateError::DerivedParameterWrite(_))
        ));
        assert!(inverse.set_value_quietly(0, 1.0).is_err());
        assert!(inverse.set_value_notify_all(0, 1.0).is_err());

        assert_eq!(inverse.values(), before);
        assert_eq!(base.values(), vec![2.0, 0.0, 0.0, 4.0]);
    }

    #[test]
    fn upstream_change_fires_all_values_to_dependents() {
        let registry = Registry::new();
        let base = two_by_two(&registry, vec![1.0, 0.0, 0.0, 1.0]);
        let inverse = CachedMatrixInverse::new(&registry, "mInv", base.clone()).unwrap();
        let recorder = Recorder::new();
        inverse.add_listener(Arc::downgrade(&recorder) as Weak<dyn VariableListener>);

        base.set_value(0, 2.0).unwrap();
        assert_eq!(
            recorder.take(),
            vec![(inverse.key(), VariableChange::AllValues)]
        );
    }

    #[test]
    fn restore_brings_back_cache_without_recompute() {
        let registry = Registry::new();
        let base = two_by_two(&registry, vec![2.0, 0.0, 0.0, 4.0]);
        let inverse = CachedMatrixInverse::new(&registry, "mInv", base.clone()).unwrap();

        assert_relative_eq!(inverse.value_at(0, 0), 0.5);
        let computes_before = inverse.cache().recompute_count();

        inverse.store_values();
        base.set_value(0, 8.0).unwrap();
        assert_relative_eq!(inverse.value_at(0, 0), 0.125);
        inverse.restore_values();

        assert_eq!(base.value(0), 2.0);
        assert_relative_eq!(inverse.value_at(0, 0), 0.5);
        // The snapshotted cache satisfied the read; only the mid-transaction
        // read recomputed.
        assert_eq!(inverse.cache().recompute_count(), computes_before + 1);
    }

    #[test]
    fn eigen_matrix_reconstructs_from_components() {
        let registry = Registry::new();
        // Columns (1, 1) and (1, -1), eigenvalues 3 and 1:
        // M = Q diag(3, 1) Q^-1 = [[2, 1], [1, 2]].
        let vectors = RealParameter::new(&registry, "q", vec![1.0, 1.0, 1.0, -1.0]);
        let values = RealParameter::new(&registry, "lambda", vec![3.0, 1.0]);
        let eigen = CompoundEigenMatrix::new(&registry, "e", vectors, values.clone()).unwrap();
        assert_relative_eq!(eigen.value_at(0, 0), 2.0, epsilon = 1e-12);
        assert_relative_eq!(eigen.value_at(1, 0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(eigen.value_at(0, 1), 1.0, epsilon = 1e-12);
        assert_relative_eq!(eigen.value_at(1, 1), 2.0, epsilon = 1e-12);

        values.set_value(1, 3.0).unwrap();
        assert_relative_eq!(eigen.value_at(0, 0), 3.0, epsilon = 1e-12);
        assert_relative_eq!(eigen.value_at(1, 0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn block_rotation_tracks_angle_changes() {
        let registry = Registry::new();
        let angles = RealParameter::new(&registry, "theta", vec![0.0, std::f64::consts::FRAC_PI_2]);
        let rotation = BlockDiagonalCosSinMatrix::new(&registry, "r", angles.clone());
        assert_eq!(rotation.rows(), 4);

        assert_relative_eq!(rotation.value_at(0, 0), 1.0);
        assert_relative_eq!(rotation.value_at(1, 0), 0.0);
        assert_relative_eq!(rotation.value_at(2, 2), 0.0, epsilon = 1e-12);
        assert_relative_eq!(rotation.value_at(3, 2), 1.0);
        assert_relative_eq!(rotation.value_at(2, 3), -1.0);
        // Off-block entries stay zero.
        assert_relative_eq!(rotation.value_at(2, 0), 0.0);

        // The angle mutation must reach the next read.
        angles.set_value(0, std::f64::consts::PI).unwrap();
        assert_relative_eq!(rotation.value_at(0, 0), -1.0);
        assert_relative_eq!(rotation.value_at(1, 0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn scaled_and_difference_matrices() {
        let registry = Registry::new();
        let matrix = RealParameter::new(&registry, "m", vec![1.0, 2.0, 3.0, 4.0]);
        let scale = RealParameter::new(&registry, "s", vec![10.0, 100.0]);
        let scaled =
            ScaledMatrixParameter::new(&registry, "scaled", matrix.clone(), scale, 2).unwrap();
        assert_eq!(scaled.values(), vec![10.0, 20.0, 300.0, 400.0]);

        let other = RealParameter::new(&registry, "o", vec![0.5, 0.5, 0.5, 0.5]);
        let difference =
            DifferenceMatrixParameter::new(&registry, "diff", matrix.clone(), other, 2, 2)
                .unwrap();
        assert_eq!(difference.values(), vec![0.5, 1.5, 2.5, 3.5]);

        matrix.set_value(0, 0.0).unwrap();
        assert_eq!(difference.value(0), -0.5);
    }

    #[test]
    fn non_square_bases_are_rejected() {
        let registry = Registry::new();
        let base = RealParameter::new(&registry, "m", vec![1.0, 2.0, 3.0]);
        assert!(CachedMatrixInverse::new(&registry, "inv", base).is_err());
    }
}
