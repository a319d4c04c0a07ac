use thiserror::Error;

/// Malformed or degenerate input. Always fatal, surfaced before any work starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// Initial and final configurations coincide within tolerance.
    #[error("Degenerate endpoints: initial and final configurations differ by {distance:.3e} (tolerance {tolerance:.3e})")]
    DegenerateEndpoints { distance: f64, tolerance: f64 },

    #[error("Atom count mismatch: expected {expected}, got {actual}")]
    AtomCountMismatch { expected: usize, actual: usize },

    #[error("Species mismatch at atom {index}")]
    SpeciesMismatch { index: usize },

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("A path needs at least the two endpoints, got {0} images")]
    EmptyPath(usize),
}

/// Misuse of a `PathRepresentation`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PathError {
    #[error("Image {index} is a fixed endpoint and cannot be modified")]
    ImmutableEndpoint { index: usize },

    #[error("Image index {index} out of range for a path of {len} images")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Displacement has {actual} entries, image has {expected} atoms")]
    DisplacementLength { expected: usize, actual: usize },
}

/// Failure of a single reference evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// The physical solver ran but did not produce a usable answer (e.g. SCF non-convergence).
    #[error("Reference solver failed: {0}")]
    Solver(String),

    #[error("Malformed configuration or output: {0}")]
    Malformed(String),

    #[error("Reference evaluation timed out after {0:.1} s")]
    Timeout(f64),

    #[error("Failed to run external process: {0}")]
    Process(String),

    #[error("Reference evaluation failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: Box<EvaluationError> },
}

/// Failure of the trainable surrogate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SurrogateError {
    #[error("Surrogate has not been fitted yet")]
    NotFitted,

    /// The underlying optimisation did not converge; the model must not be used.
    #[error("Surrogate fit diverged: {0}")]
    FitDivergence(String),

    #[error("Configuration has {actual} degrees of freedom, model was trained on {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Cannot fit on an empty training set")]
    EmptyTrainingSet,
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Surrogate(#[from] SurrogateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
