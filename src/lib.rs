//! gradtrace: a forward-and-backward pass evaluator for a fixed two-layer
//! softmax classifier.
//!
//! The crate builds one fixed computation graph (affine -> ReLU -> affine ->
//! softmax -> log -> negative-log-likelihood -> sum), evaluates it over
//! deterministic inputs, and computes the gradient of the total loss with
//! respect to every parameter and every intermediate tensor by reverse-mode
//! differentiation.

pub mod error;
pub mod grad_check;
pub mod graph;
pub mod model;
pub mod tensor;

pub use error::GradTraceError;
pub use graph::{backward, Node, Op};
pub use model::ClassifierTrace;
pub use tensor::Tensor;
