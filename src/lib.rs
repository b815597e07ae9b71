//! Transactional state graph for Markov chain Monte Carlo.
//!
//! The crate models the mutable state of an MCMC run as a graph of
//! parameters, deterministic views, models and likelihoods. Parameters
//! notify their dependents on change, dependents cache lazily and
//! recompute on read, and the whole graph supports a store / mutate /
//! accept-or-restore transaction per proposal.

pub mod bounds;
pub mod compound;
pub mod computed;
pub mod error;
pub mod events;
pub mod likelihood;
pub mod masked;
pub mod matrix;
pub mod model;
pub mod registry;
pub mod statistic;
pub mod transformed;
pub mod variable;

pub use bounds::{Bounds, DefaultBounds, IntersectionBounds};
pub use compound::{CompoundParameter, EqualityConstrainedParameter, JointParameter};
pub use computed::{
    BlockDiagonalCosSinMatrix, CachedMatrixInverse, CompoundEigenMatrix, DerivedMatrixParameter,
    DifferenceMatrixParameter, MatrixFunction, ScaledMatrixParameter,
};
pub use error::{Result, StateError};
pub use events::{VariableChange, VariableListener};
pub use likelihood::{
    CachedLikelihood, CompoundLikelihood, Likelihood, LikelihoodCache, LogDensity, LOG_ZERO,
};
pub use masked::MaskedParameter;
pub use matrix::{FastMatrixParameter, MatrixParameter};
pub use model::{Model, ModelCore, ModelListener};
pub use registry::{ParamKey, Registry};
pub use statistic::{columns, report, Column, Statistic};
pub use transformed::{LogTransform, LogitTransform, Transform, TransformedParameter};
pub use variable::{receive_state, send_state, Parameter, RealParameter};
