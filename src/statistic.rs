use std::fmt::Write as _;
use std::sync::Arc;

use itertools::Itertools;

use crate::variable::Parameter;

/// Read-only numeric summary of some part of the graph.
///
/// Every parameter is a statistic over its own values; purpose-built
/// statistics (sums, differences, diagnostics) implement this directly.
pub trait Statistic {
    fn statistic_name(&self) -> String;
    fn statistic_dimension(&self) -> usize;
    fn statistic_value(&self, index: usize) -> f64;
}

impl<T: Parameter + ?Sized> Statistic for T {
    fn statistic_name(&self) -> String {
        self.name()
    }

    fn statistic_dimension(&self) -> usize {
        self.dimension()
    }

    fn statistic_value(&self, index: usize) -> f64 {
        self.value(index)
    }
}

/// A named scalar accessor into a parameter, for trace-file writers.
///
/// Columns are read-only and side-effect free; a trace writer holds the
/// column list built at assembly time and polls values once per logged
/// iteration.
pub struct Column {
    label: String,
    source: Arc<dyn Parameter>,
    index: usize,
}

impl Column {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> f64 {
        self.source.value(self.index)
    }
}

/// One column per dimension, labelled with the dimension names.
pub fn columns(parameter: &Arc<dyn Parameter>) -> Vec<Column> {
    (0..parameter.dimension())
        .map(|index| Column {
            label: parameter.dimension_name(index),
            source: Arc::clone(parameter),
            index,
        })
        .collect()
}

/// Human-readable rendering of a parameter's values and effective bounds.
pub fn report(parameter: &dyn Parameter) -> String {
    let bounds = parameter.bounds();
    let mut out = String::new();
    let rendered = (0..parameter.dimension())
        .map(|i| {
            let mut entry = format!("{}={}", parameter.dimension_name(i), parameter.value(i));
            if let Some(bounds) = bounds.as_ref() {
                let _ = write!(entry, " [{}, {}]", bounds.lower(i), bounds.upper(i));
            }
            entry
        })
        .join(", ");
    out.push_str(&rendered);
    out
}
