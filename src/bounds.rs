use std::sync::{Arc, RwLock};

use crate::error::{Result, StateError};
use crate::variable::Parameter;

/// Per-dimension range constraints on a parameter.
///
/// `lower(i) <= upper(i)` is not enforced; an intersection that produces an
/// empty range is a caller error and simply makes every value out of bounds.
pub trait Bounds: Send + Sync {
    fn lower(&self, index: usize) -> f64;
    fn upper(&self, index: usize) -> f64;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, index: usize, value: f64) -> bool {
        value >= self.lower(index) && value <= self.upper(index)
    }
}

/// Fixed bounds backed by explicit limit arrays.
pub struct DefaultBounds {
    lowers: Box<[f64]>,
    uppers: Box<[f64]>,
}

impl DefaultBounds {
    pub fn new(lowers: Vec<f64>, uppers: Vec<f64>) -> Result<DefaultBounds> {
        if lowers.len() != uppers.len() {
            return Err(StateError::DimensionMismatch {
                context: "bounds limit arrays",
                expected: lowers.len(),
                actual: uppers.len(),
            });
        }
        Ok(DefaultBounds {
            lowers: lowers.into(),
            uppers: uppers.into(),
        })
    }

    /// The same `[lower, upper]` range on every dimension.
    pub fn uniform(lower: f64, upper: f64, dim: usize) -> DefaultBounds {
        DefaultBounds {
            lowers: vec![lower; dim].into(),
            uppers: vec![upper; dim].into(),
        }
    }

    /// Unconstrained bounds.
    pub fn unbounded(dim: usize) -> DefaultBounds {
        Self::uniform(f64::NEG_INFINITY, f64::INFINITY, dim)
    }
}

impl Bounds for DefaultBounds {
    fn lower(&self, index: usize) -> f64 {
        self.lowers[index]
    }

    fn upper(&self, index: usize) -> f64 {
        self.uppers[index]
    }

    fn len(&self) -> usize {
        self.lowers.len()
    }
}

/// The intersection of several bound sources over the same dimensions.
///
/// Limits are combined lazily at query time: the effective lower limit is
/// the tightest (largest) lower, the effective upper the tightest (smallest)
/// upper. With no sources the bounds are unconstrained.
pub struct IntersectionBounds {
    dim: usize,
    sources: RwLock<Vec<Arc<dyn Bounds>>>,
}

impl IntersectionBounds {
    pub fn new(dim: usize) -> IntersectionBounds {
        IntersectionBounds {
            dim,
            sources: RwLock::new(Vec::new()),
        }
    }

    pub fn add_bounds(&self, bounds: Arc<dyn Bounds>) -> Result<()> {
        if bounds.len() != self.dim {
            return Err(StateError::DimensionMismatch {
                context: "intersection bounds",
                expected: self.dim,
                actual: bounds.len(),
            });
        }
        self.sources.write().expect("bounds poisoned").push(bounds);
        Ok(())
    }
}

impl Bounds for IntersectionBounds {
    fn lower(&self, index: usize) -> f64 {
        self.sources
            .read()
            .expect("bounds poisoned")
            .iter()
            .map(|b| b.lower(index))
            .fold(f64::NEG_INFINITY, f64::max)
    }

    fn upper(&self, index: usize) -> f64 {
        self.sources
            .read()
            .expect("bounds poisoned")
            .iter()
            .map(|b| b.upper(index))
            .fold(f64::INFINITY, f64::min)
    }

    fn len(&self) -> usize {
        self.dim
    }
}

/// Concatenation of the bounds of an ordered list of child parameters.
///
/// Built lazily by compound parameters: limits are read through to the
/// children on every query, so a child that gains bounds later is reflected
/// without rebuilding. A child without bounds contributes an unconstrained
/// range.
pub struct CompoundBounds {
    children: Vec<Arc<dyn Parameter>>,
}

impl CompoundBounds {
    pub fn new(children: Vec<Arc<dyn Parameter>>) -> CompoundBounds {
        CompoundBounds { children }
    }

    fn locate(&self, index: usize) -> (&Arc<dyn Parameter>, usize) {
        let mut offset = index;
        for child in &self.children {
            let dim = child.dimension();
            if offset < dim {
                return (child, offset);
            }
            offset -= dim;
        }
        panic!("bounds index {index} out of range");
    }
}

impl Bounds for CompoundBounds {
    fn lower(&self, index: usize) -> f64 {
        let (child, local) = self.locate(index);
        match child.bounds() {
            Some(b) => b.lower(local),
            None => f64::NEG_INFINITY,
        }
    }

    fn upper(&self, index: usize) -> f64 {
        let (child, local) = self.locate(index);
        match child.bounds() {
            Some(b) => b.upper(local),
            None => f64::INFINITY,
        }
    }

    fn len(&self) -> usize {
        self.children.iter().map(|c| c.dimension()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn intersection_takes_tightest_limits() {
        let intersection = IntersectionBounds::new(1);
        intersection
            .add_bounds(Arc::new(DefaultBounds::uniform(0.0, 10.0, 1)))
            .unwrap();
        intersection
            .add_bounds(Arc::new(DefaultBounds::uniform(5.0, 20.0, 1)))
            .unwrap();
        assert_eq!(intersection.lower(0), 5.0);
        assert_eq!(intersection.upper(0), 10.0);
        assert!(intersection.contains(0, 7.0));
        assert!(!intersection.contains(0, 12.0));
    }

    #[test]
    fn empty_intersection_is_unconstrained() {
        let intersection = IntersectionBounds::new(2);
        assert_eq!(intersection.lower(1), f64::NEG_INFINITY);
        assert_eq!(intersection.upper(1), f64::INFINITY);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let intersection = IntersectionBounds::new(2);
        let err = intersection
            .add_bounds(Arc::new(DefaultBounds::uniform(0.0, 1.0, 3)))
            .unwrap_err();
        assert!(matches!(err, StateError::DimensionMismatch { .. }));

        assert!(DefaultBounds::new(vec![0.0], vec![1.0, 2.0]).is_err());
    }
}
