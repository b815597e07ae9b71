use std::sync::{Arc, Mutex, Weak};

use crate::bounds::Bounds;
use crate::compound::CompoundParameter;
use crate::error::{Result, StateError};
use crate::events::{ListenerList, VariableChange, VariableListener};
use crate::registry::{ParamKey, Registry};
use crate::variable::{Parameter, RealParameter};

/// A 2-D column-major view over a compound of equal-length column vectors.
///
/// Flat dimension `d` corresponds to `(row, col) = (d % rows, d / rows)`.
/// Each column is an independent parameter with its own snapshots and
/// events; the matrix itself is the compound of its columns.
pub struct MatrixParameter {
    inner: Arc<CompoundParameter>,
    rows: usize,
}

impl MatrixParameter {
    pub fn new(registry: &Arc<Registry>, id: &str, rows: usize) -> Arc<MatrixParameter> {
        Arc::new(MatrixParameter {
            inner: CompoundParameter::new(registry, id),
            rows,
        })
    }

    pub fn add_column(&self, column: Arc<dyn Parameter>) -> Result<()> {
        if column.dimension() != self.rows {
            return Err(StateError::DimensionMismatch {
                context: "matrix column",
                expected: self.rows,
                actual: column.dimension(),
            });
        }
        self.inner.add_parameter(column)
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn column_count(&self) -> usize {
        self.inner.child_count()
    }

    pub fn column(&self, col: usize) -> Arc<dyn Parameter> {
        self.inner.child(col)
    }

    pub fn value_at(&self, row: usize, col: usize) -> f64 {
        self.inner.child(col).value(row)
    }

    pub fn set_value_at(&self, row: usize, col: usize, value: f64) -> Result<()> {
        self.inner.child(col).set_value(row, value)
    }
}

impl Parameter for MatrixParameter {
    fn key(&self) -> ParamKey {
        self.inner.key()
    }

    fn id(&self) -> Option<String> {
        self.inner.id()
    }

    fn set_id(&self, id: &str) {
        self.inner.set_id(id);
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn value(&self, index: usize) -> f64 {
        self.inner.value(index)
    }

    fn set_value(&self, index: usize, value: f64) -> Result<()> {
        self.inner.set_value(index, value)
    }

    fn set_value_quietly(&self, index: usize, value: f64) -> Result<()> {
        self.inner.set_value_quietly(index, value)
    }

    fn set_value_notify_all(&self, index: usize, value: f64) -> Result<()> {
        self.inner.set_value_notify_all(index, value)
    }

    fn add_listener(&self, listener: Weak<dyn VariableListener>) {
        self.inner.add_listener(listener);
    }

    fn remove_listener(&self, listener: &Weak<dyn VariableListener>) {
        self.inner.remove_listener(listener);
    }

    fn is_used(&self) -> bool {
        self.inner.is_used()
    }

    fn fire_changed(&self, change: VariableChange) {
        self.inner.fire_changed(change);
    }

    fn store_values(&self) {
        self.inner.store_values();
    }

    fn restore_values(&self) {
        self.inner.restore_values();
    }

    fn accept_values(&self) {
        self.inner.accept_values();
    }

    fn adopt_values(&self, source: &dyn Parameter) -> Result<()> {
        self.inner.adopt_values(source)
    }

    fn add_bounds(&self, bounds: Arc<dyn Bounds>) -> Result<()> {
        self.inner.add_bounds(bounds)
    }

    fn bounds(&self) -> Option<Arc<dyn Bounds>> {
        self.inner.bounds()
    }

    fn dimension_name(&self, index: usize) -> String {
        self.inner.dimension_name(index)
    }
}

/// A matrix backed by one flat parameter instead of per-column children.
///
/// Trades per-column independence for speed: the whole matrix shares one
/// value buffer and one snapshot. Column views are available as proxy
/// parameters that forward into the backing slice.
pub struct FastMatrixParameter {
    registry: Arc<Registry>,
    backing: Arc<RealParameter>,
    rows: usize,
    cols: usize,
}

impl FastMatrixParameter {
    pub fn new(
        registry: &Arc<Registry>,
        id: &str,
        rows: usize,
        cols: usize,
    ) -> Arc<FastMatrixParameter> {
        Arc::new(FastMatrixParameter {
            registry: Arc::clone(registry),
            backing: RealParameter::with_value(registry, id, rows * cols, 0.0),
            rows,
            cols,
        })
    }

    fn index(&self, row: usize, col: usize) -> usize {
        assert!(row < self.rows && col < self.cols, "matrix index out of range");
        col * self.rows + row
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn column_count(&self) -> usize {
        self.cols
    }

    pub fn value_at(&self, row: usize, col: usize) -> f64 {
        self.backing.value(self.index(row, col))
    }

    pub fn set_value_at(&self, row: usize, col: usize, value: f64) -> Result<()> {
        self.backing.set_value(self.index(row, col), value)
    }

    /// A parameter view of one column, forwarding into the backing store.
    ///
    /// Writes through the proxy notify both the backing store's listeners
    /// (flat index) and the proxy's own listeners (column-local index).
    /// Writes made directly on the backing store bypass proxy listeners.
    pub fn column_proxy(self: &Arc<Self>, col: usize) -> Arc<FastMatrixColumn> {
        assert!(col < self.cols, "matrix column out of range");
        let proxy = Arc::new(FastMatrixColumn {
            key: self.registry.next_key(),
            id: Mutex::new(self.backing.id().map(|id| format!("{id}.{}", col + 1))),
            owner: Arc::clone(self),
            col,
            listeners: ListenerList::new(),
        });
        self.registry
            .register(Arc::downgrade(&proxy) as Weak<dyn Parameter>);
        proxy
    }
}

impl Parameter for FastMatrixParameter {
    fn key(&self) -> ParamKey {
        self.backing.key()
    }

    fn id(&self) -> Option<String> {
        self.backing.id()
    }

    fn set_id(&self, id: &str) {
        self.backing.set_id(id);
    }

    fn dimension(&self) -> usize {
        self.rows * self.cols
    }

    fn value(&self, index: usize) -> f64 {
        self.backing.value(index)
    }

    fn set_value(&self, index: usize, value: f64) -> Result<()> {
        self.backing.set_value(index, value)
    }

    fn set_value_quietly(&self, index: usize, value: f64) -> Result<()> {
        self.backing.set_value_quietly(index, value)
    }

    fn add_listener(&self, listener: Weak<dyn VariableListener>) {
        self.backing.add_listener(listener);
    }

    fn remove_listener(&self, listener: &Weak<dyn VariableListener>) {
        self.backing.remove_listener(listener);
    }

    fn is_used(&self) -> bool {
        self.backing.is_used()
    }

    fn fire_changed(&self, change: VariableChange) {
        self.backing.fire_changed(change);
    }

    fn store_values(&self) {
        self.backing.store_values();
    }

    fn restore_values(&self) {
        self.backing.restore_values();
    }

    fn accept_values(&self) {
        self.backing.accept_values();
    }

    fn adopt_values(&self, source: &dyn Parameter) -> Result<()> {
        self.backing.adopt_values(source)
    }

    fn add_bounds(&self, bounds: Arc<dyn Bounds>) -> Result<()> {
        self.backing.add_bounds(bounds)
    }

    fn bounds(&self) -> Option<Arc<dyn Bounds>> {
        self.backing.bounds()
    }
}

/// One column of a `FastMatrixParameter`.
pub struct FastMatrixColumn {
    key: ParamKey,
    id: Mutex<Option<String>>,
    owner: Arc<FastMatrixParameter>,
    col: usize,
    listeners: ListenerList<dyn VariableListener>,
}

struct ColumnBounds {
    backing: Arc<dyn Bounds>,
    offset: usize,
    len: usize,
}

impl Bounds for ColumnBounds {
    fn lower(&self, index: usize) -> f64 {
        self.backing.lower(self.offset + index)
    }

    fn upper(&self, index: usize) -> f64 {
        self.backing.upper(self.offset + index)
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Parameter for FastMatrixColumn {
    fn key(&self) -> ParamKey {
        self.key
    }

    fn id(&self) -> Option<String> {
        self.id.lock().expect("column poisoned").clone()
    }

    fn set_id(&self, id: &str) {
        *self.id.lock().expect("column poisoned") = Some(id.to_string());
    }

    fn dimension(&self) -> usize {
        self.owner.rows
    }

    fn value(&self, index: usize) -> f64 {
        self.owner.value_at(index, self.col)
    }

    fn set_value(&self, index: usize, value: f64) -> Result<()> {
        self.owner.set_value_at(index, self.col, value)?;
        self.fire_changed(VariableChange::Value(index));
        Ok(())
    }

    fn set_value_quietly(&self, index: usize, value: f64) -> Result<()> {
        self.owner
            .backing
            .set_value_quietly(self.owner.index(index, self.col), value)
    }

    fn set_value_notify_all(&self, index: usize, value: f64) -> Result<()> {
        self.owner
            .backing
            .set_value_notify_all(self.owner.index(index, self.col), value)?;
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
        // One snapshot for the whole backing store; the backing guard makes
        // repeated stores from sibling proxies no-ops.
        self.owner.backing.store_values();
    }

    fn restore_values(&self) {
        self.owner.backing.restore_values();
    }

    fn accept_values(&self) {
        self.owner.backing.accept_values();
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
        Ok(())
    }

    fn add_bounds(&self, _bounds: Arc<dyn Bounds>) -> Result<()> {
        Err(StateError::BoundsNotSupported(self.name()))
    }

    fn bounds(&self) -> Option<Arc<dyn Bounds>> {
        self.owner.backing.bounds().map(|backing| {
            Arc::new(ColumnBounds {
                backing,
                offset: self.col * self.owner.rows,
                len: self.owner.rows,
            }) as Arc<dyn Bounds>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::testing::Recorder;
    use pretty_assertions::assert_eq;

    fn square(registry: &Arc<Registry>) -> Arc<MatrixParameter> {
        let matrix = MatrixParameter::new(registry, "m", 2);
        for col in 0..2 {
            let column = RealParameter::new(
                registry,
                &format!("m.col{col}"),
                vec![1.0 + col as f64, 3.0 + col as f64],
            );
            matrix.add_column(column).unwrap();
        }
        matrix
    }

    #[test]
    fn two_dimensional_view_matches_flat_index() {
        let registry = Registry::new();
        let matrix = square(&registry);
        assert_eq!(matrix.dimension(), 4);
        assert_eq!(matrix.value_at(1, 0), 3.0);
        assert_eq!(matrix.value_at(0, 1), 2.0);
        // Column-major: flat 2 is (row 0, col 1).
        assert_eq!(matrix.value(2), 2.0);

        matrix.set_value_at(0, 1, 9.0).unwrap();
        assert_eq!(matrix.value(2), 9.0);
    }

    #[test]
    fn ragged_columns_are_rejected() {
        let registry = Registry::new();
        let matrix = MatrixParameter::new(&registry, "m", 3);
        let short = RealParameter::new(&registry, "short", vec![1.0]);
        assert!(matrix.add_column(short).is_err());
    }

    #[test]
    fn column_writes_reach_matrix_listeners() {
        let registry = Registry::new();
        let matrix = square(&registry);
        let recorder = Recorder::new();
        matrix.add_listener(Arc::downgrade(&recorder) as Weak<dyn VariableListener>);

        matrix.column(1).set_value(1, 8.0).unwrap();
        assert_eq!(
            recorder.take(),
            vec![(matrix.key(), VariableChange::Value(3))]
        );
    }

    #[test]
    fn fast_matrix_flat_backing() {
        let registry = Registry::new();
        let fast = FastMatrixParameter::new(&registry, "f", 3, 2);
        fast.set_value_at(2, 1, 7.0).unwrap();
        assert_eq!(fast.value(5), 7.0);
        assert_eq!(fast.value_at(2, 1), 7.0);
        assert_eq!(fast.dimension(), 6);
    }

    #[test]
    fn proxy_forwards_reads_writes_and_events() {
        let registry = Registry::new();
        let fast = FastMatrixParameter::new(&registry, "f", 2, 2);
        let proxy = fast.column_proxy(1);
        assert_eq!(proxy.id(), Some("f.2".to_string()));

        let on_matrix = Recorder::new();
        let on_proxy = Recorder::new();
        fast.add_listener(Arc::downgrade(&on_matrix) as Weak<dyn VariableListener>);
        proxy.add_listener(Arc::downgrade(&on_proxy) as Weak<dyn VariableListener>);

        proxy.set_value(1, 5.0).unwrap();
        assert_eq!(fast.value_at(1, 1), 5.0);
        assert_eq!(on_matrix.take(), vec![(fast.key(), VariableChange::Value(3))]);
        assert_eq!(on_proxy.take(), vec![(proxy.key(), VariableChange::Value(1))]);

        proxy.set_value_notify_all(0, 4.0).unwrap();
        assert_eq!(fast.value_at(0, 1), 4.0);
        assert_eq!(
            on_matrix.take(),
            vec![(fast.key(), VariableChange::AllValues)]
        );
        assert_eq!(
            on_proxy.take(),
            vec![(proxy.key(), VariableChange::AllValues)]
        );
    }

    #[test]
    fn sibling_proxies_share_one_snapshot() {
        let registry = Registry::new();
        let fast = FastMatrixParameter::new(&registry, "f", 2, 2);
        let first = fast.column_proxy(0);
        let second = fast.column_proxy(1);

        first.store_values();
        first.set_value(0, 1.0).unwrap();
        // Must not overwrite the snapshot taken through the first proxy.
        second.store_values();
        second.set_value(0, 2.0).unwrap();
        first.restore_values();
        assert_eq!(fast.values(), vec![0.0, 0.0, 0.0, 0.0]);
    }
}
