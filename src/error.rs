use thiserror::Error;

/// Errors raised while assembling or mutating a parameter/model graph.
///
/// Configuration errors (dimension mismatches, writes to derived parameters)
/// surface here during graph construction, before sampling starts. Numerical
/// problems during likelihood evaluation are not errors at this level; they
/// are reported as a `-inf` log likelihood instead.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("parameter `{0}` is derived from other parameters and cannot be written directly")]
    DerivedParameterWrite(String),
    #[error("parameter `{0}` does not support bounds")]
    BoundsNotSupported(String),
    #[error("parameter `{0}` does not support resizing")]
    ResizeNotSupported(String),
    #[error("cannot resize parameter `{0}` after its state has been stored")]
    ResizeAfterStore(String),
    #[error("cannot resize parameter `{0}`: its bounds differ between dimensions")]
    ResizeWithUnevenBounds(String),
    #[error("parameter `{child}` is already part of compound parameter `{parent}`")]
    DuplicateChild { parent: String, child: String },
    #[error("mask parameter must contain only 0 or 1, found {0}")]
    InvalidMaskValue(f64),
    #[error("i/o failure during state transfer")]
    Transfer(#[from] std::io::Error),
    #[error("could not build evaluation thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, StateError>;
