use thiserror::Error;

use crate::state::GenerationState;

/// Errors raised while building or updating a model block.
///
/// None of these are transient: every variant describes inconsistent
/// data or a misuse of the generation protocol, so callers are expected
/// to fix the input rather than retry.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Constraint generation requested on inconsistent or missing topology
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Subset or range addressing outside the component's extent
    #[error("{what} index {index} out of range (extent {extent})")]
    OutOfRangeIndex {
        what: &'static str,
        index: usize,
        extent: usize,
    },

    /// A field required by the inferred schema is absent
    #[error("missing mandatory field '{0}'")]
    MissingMandatoryField(String),

    /// Documented but unimplemented code path
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A generation step was requested before its predecessor
    #[error("cannot generate {step} while block is {state:?}")]
    OutOfOrder {
        step: &'static str,
        state: GenerationState,
    },

    #[error("{what}: expected {expected} values, found {found}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    #[error("'{0}' is not a known classname")]
    UnknownClassname(String),

    #[error("variable {0} does not belong to this block tree")]
    UnknownVariable(String),

    /// The topology descriptor can no longer be changed
    #[error("topology is frozen: {0}")]
    TopologyFrozen(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type ModelResult<T> = Result<T, ModelError>;

impl ModelError {
    pub(crate) fn shape(
        what: impl Into<String>,
        expected: usize,
        found: usize,
    ) -> Self {
        ModelError::ShapeMismatch {
            what: what.into(),
            expected,
            found,
        }
    }
}
