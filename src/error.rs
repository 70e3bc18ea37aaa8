//! Error types for soft body model construction and instance control.
//!
//! The simulation step itself never fails: degenerate geometry is handled with
//! epsilon guards. Errors are reported only where external input enters the crate.

use thiserror::Error;

/// Errors that can occur while building a model or driving an instance.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SoftbodyError {
    /// Invalid topology (e.g., static nodes not forming a prefix, empty model).
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// Index out of bounds.
    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    /// Constraint is invalid (e.g., a rod between two static nodes).
    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),

    /// Configuration error.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Numerical error (`NaN`, infinity).
    #[error("Numerical error: {0}")]
    NumericalError(String),

    /// Two models or a model and a buffer disagree in size.
    #[error("Model mismatch: {0}")]
    ModelMismatch(String),
}

impl SoftbodyError {
    /// Create an invalid topology error.
    pub fn invalid_topology(msg: impl Into<String>) -> Self {
        Self::InvalidTopology(msg.into())
    }

    /// Create an index out of bounds error.
    pub fn index_out_of_bounds(msg: impl Into<String>) -> Self {
        Self::IndexOutOfBounds(msg.into())
    }

    /// Create an invalid constraint error.
    pub fn invalid_constraint(msg: impl Into<String>) -> Self {
        Self::InvalidConstraint(msg.into())
    }

    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a numerical error.
    pub fn numerical_error(msg: impl Into<String>) -> Self {
        Self::NumericalError(msg.into())
    }

    /// Create a model mismatch error.
    pub fn model_mismatch(msg: impl Into<String>) -> Self {
        Self::ModelMismatch(msg.into())
    }
}

/// Result type for soft body operations.
pub type Result<T> = std::result::Result<T, SoftbodyError>;

/// Check that `index < len`, naming the indexed collection in the error.
pub(crate) fn check_index(what: &str, index: usize, len: usize) -> Result<()> {
    if index < len {
        Ok(())
    } else {
        Err(SoftbodyError::index_out_of_bounds(format!(
            "{what} index {index} >= {len}"
        )))
    }
}

/// Check that `node` is not one of the first `static_node_count` nodes.
pub(crate) fn check_dynamic(what: &str, node: usize, static_node_count: usize) -> Result<()> {
    if node < static_node_count {
        Err(SoftbodyError::invalid_topology(format!(
            "{what} {node} is static"
        )))
    } else {
        Ok(())
    }
}

/// Check that a rod's distance limits are ordered and not NaN.
pub(crate) fn check_rod_limits(a: usize, b: usize, min_dist: f64, max_dist: f64) -> Result<()> {
    if min_dist <= max_dist {
        Ok(())
    } else {
        Err(SoftbodyError::invalid_constraint(format!(
            "rod {a}-{b} has min distance {min_dist} above max distance {max_dist}"
        )))
    }
}
