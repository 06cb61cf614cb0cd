use thiserror::Error;

/// Custom error type for the gradtrace evaluator.
#[derive(Error, Debug, PartialEq, Clone)] // PartialEq for easier testing
pub enum GradTraceError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?} during operation {operation}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
        operation: String,
    },

    #[error("Incompatible shapes for operation {operation}: {shape1:?} and {shape2:?}")]
    IncompatibleShapes {
        shape1: Vec<usize>,
        shape2: Vec<usize>,
        operation: String,
    },

    #[error("Index out of range: index {index} >= limit {limit} during operation {operation}")]
    IndexOutOfRange {
        index: usize,
        limit: usize,
        operation: String,
    },

    #[error("Tensor creation error: data length {data_len} does not match shape {shape:?}")]
    TensorCreationError { data_len: usize, shape: Vec<usize> },

    #[error("Numerical instability: non-finite values produced by operation {operation}")]
    NumericalInstability { operation: String },
}
