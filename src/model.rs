use crate::error::GradTraceError;
use crate::graph::{backward, Node};
use crate::tensor::Tensor;
use std::rc::Rc;

/// Number of examples in the fixed batch.
pub const BATCH: usize = 4;
/// Input feature dimension.
pub const INPUT_DIM: usize = 10;
/// Hidden layer width.
pub const HIDDEN_DIM: usize = 2;
/// Number of output classes.
pub const NUM_CLASSES: usize = 4;

/// Builds the ramp tensor `[1, 2, ..., len] / divisor` with the given shape.
/// All fixed inputs of the evaluator are ramps of this form.
fn ramp(len: usize, divisor: f32, shape: Vec<usize>) -> Result<Tensor, GradTraceError> {
    let data = (1..=len).map(|v| v as f32 / divisor).collect();
    Tensor::new(data, shape)
}

/// The fixed input batch: `reshape(range(1..=40) / 40, [4, 10])`.
pub fn input_batch() -> Result<Tensor, GradTraceError> {
    ramp(BATCH * INPUT_DIM, 40.0, vec![BATCH, INPUT_DIM])
}

/// The fixed class labels, one per example.
pub fn labels() -> Vec<usize> {
    vec![0, 1, 2, 3]
}

/// First-layer weights: `reshape(range(1..=20) / 20, [10, 2])`.
pub fn layer1_weights() -> Result<Tensor, GradTraceError> {
    ramp(INPUT_DIM * HIDDEN_DIM, 20.0, vec![INPUT_DIM, HIDDEN_DIM])
}

/// First-layer bias: `range(1..=2) / 2`.
pub fn layer1_bias() -> Result<Tensor, GradTraceError> {
    ramp(HIDDEN_DIM, 2.0, vec![HIDDEN_DIM])
}

/// Second-layer weights: `reshape(range(1..=8) / 8, [2, 4])`.
pub fn layer2_weights() -> Result<Tensor, GradTraceError> {
    ramp(HIDDEN_DIM * NUM_CLASSES, 8.0, vec![HIDDEN_DIM, NUM_CLASSES])
}

/// Second-layer bias: `range(1..=4) / 4`.
pub fn layer2_bias() -> Result<Tensor, GradTraceError> {
    ramp(NUM_CLASSES, 4.0, vec![NUM_CLASSES])
}

/// Handles to every node of the fixed two-layer classifier graph.
///
/// The forward pass is built once, in order: `z1 = x @ W1 + b1`,
/// `a1 = relu(z1)`, `z2 = a1 @ W2 + b2`, `a2 = softmax(z2)`,
/// `a2_log = log(a2)`, `loss[i] = -a2_log[i, y[i]]`, `total = sum(loss)`.
/// Every handle stays readable after the backward pass, so each
/// intermediate's gradient can be inspected, not just the leaves'.
pub struct ClassifierTrace {
    pub x: Rc<Node>,
    pub w1: Rc<Node>,
    pub b1: Rc<Node>,
    pub w2: Rc<Node>,
    pub b2: Rc<Node>,
    pub z1: Rc<Node>,
    pub a1: Rc<Node>,
    pub z2: Rc<Node>,
    pub a2: Rc<Node>,
    pub a2_log: Rc<Node>,
    pub loss: Rc<Node>,
    pub total: Rc<Node>,
}

impl ClassifierTrace {
    /// Builds the forward pass over the fixed deterministic inputs.
    pub fn build() -> Result<Self, GradTraceError> {
        Self::with_parameters(
            input_batch()?,
            labels(),
            layer1_weights()?,
            layer1_bias()?,
            layer2_weights()?,
            layer2_bias()?,
        )
    }

    /// Builds the forward pass over caller-supplied tensors.
    ///
    /// Used by the gradient checker to rebuild the graph with perturbed
    /// parameters; shapes are validated by the node constructors.
    ///
    /// # Errors
    /// Returns `GradTraceError::IncompatibleShapes` if any matmul or
    /// broadcast disagrees, and `GradTraceError::IndexOutOfRange` if a label
    /// is not a valid class index.
    pub fn with_parameters(
        x: Tensor,
        y: Vec<usize>,
        w1: Tensor,
        b1: Tensor,
        w2: Tensor,
        b2: Tensor,
    ) -> Result<Self, GradTraceError> {
        let x = Node::leaf("x", x);
        let w1 = Node::leaf("W1", w1);
        let b1 = Node::leaf("b1", b1);
        let w2 = Node::leaf("W2", w2);
        let b2 = Node::leaf("b2", b2);

        let xw1 = Node::matmul("x@W1", &x, &w1)?;
        let z1 = Node::bias_add("z1", &xw1, &b1)?;
        let a1 = Node::relu("a1", &z1);
        let a1w2 = Node::matmul("a1@W2", &a1, &w2)?;
        let z2 = Node::bias_add("z2", &a1w2, &b2)?;
        let a2 = Node::softmax("a2", &z2)?;
        let a2_log = Node::log("a2_log", &a2);
        let loss = Node::gather_negate("loss", &a2_log, &y)?;
        let total = Node::sum("l", &loss);

        Ok(ClassifierTrace {
            x,
            w1,
            b1,
            w2,
            b2,
            z1,
            a1,
            z2,
            a2,
            a2_log,
            loss,
            total,
        })
    }

    /// Runs the backward pass from the scalar total loss, populating the
    /// gradient buffer of every node in the trace.
    pub fn backward(&self) -> Result<(), GradTraceError> {
        backward(&self.total)
    }

    /// The nine gradient tensors of the reporting surface, in print order.
    pub fn reported_gradients(&self) -> Vec<(&'static str, Tensor)> {
        [
            &self.loss, &self.w1, &self.b1, &self.w2, &self.b2, &self.z1, &self.a1, &self.z2,
            &self.a2,
        ]
        .iter()
        .map(|node| (node.name(), node.grad().clone()))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_fixed_input_values() {
        let x = input_batch().unwrap();
        assert_eq!(x.shape(), &[4, 10]);
        assert_abs_diff_eq!(x.data()[0], 1.0 / 40.0, epsilon = 1e-7);
        assert_abs_diff_eq!(x.data()[39], 1.0, epsilon = 1e-7);

        let b1 = layer1_bias().unwrap();
        assert_eq!(b1.data(), &[0.5, 1.0]);

        let b2 = layer2_bias().unwrap();
        assert_eq!(b2.data(), &[0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_forward_hidden_preactivations() {
        // z1[i, 0] = (715 + 1000 i) / 800 + 0.5 and
        // z1[i, 1] = (770 + 1100 i) / 800 + 1.0, from the closed-form sums
        // of the ramp inputs.
        let trace = ClassifierTrace::build().unwrap();
        let expected = [
            1.39375f32, 1.9625, 2.64375, 3.3375, 3.89375, 4.7125, 5.14375, 6.0875,
        ];
        assert_eq!(trace.z1.value().shape(), &[BATCH, HIDDEN_DIM]);
        for (&got, &want) in trace.z1.value().data().iter().zip(expected.iter()) {
            assert_abs_diff_eq!(got, want, epsilon = 1e-5);
        }
        // All pre-activations are positive, so ReLU passes them through.
        assert_eq!(trace.a1.value().data(), trace.z1.value().data());
    }

    #[test]
    fn test_forward_output_shapes() {
        let trace = ClassifierTrace::build().unwrap();
        assert_eq!(trace.z2.value().shape(), &[BATCH, NUM_CLASSES]);
        assert_eq!(trace.a2.value().shape(), &[BATCH, NUM_CLASSES]);
        assert_eq!(trace.a2_log.value().shape(), &[BATCH, NUM_CLASSES]);
        assert_eq!(trace.loss.value().shape(), &[BATCH]);
        assert_eq!(trace.total.value().shape(), &[1]);
    }

    #[test]
    fn test_softmax_rows_are_distributions() {
        let trace = ClassifierTrace::build().unwrap();
        for i in 0..BATCH {
            let row = &trace.a2.value().data()[i * NUM_CLASSES..(i + 1) * NUM_CLASSES];
            let sum: f32 = row.iter().sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|&p| p > 0.0 && p < 1.0));
        }
    }

    #[test]
    fn test_losses_strictly_positive() {
        // Each per-example loss is -log of a probability in (0, 1).
        let trace = ClassifierTrace::build().unwrap();
        for &l in trace.loss.value().data() {
            assert!(l > 0.0, "per-example loss {l} is not strictly positive");
        }
        assert!(trace.total.value().data()[0] > 0.0);
    }

    #[test]
    fn test_out_of_range_label_fails() {
        let result = ClassifierTrace::with_parameters(
            input_batch().unwrap(),
            vec![0, 1, 2, NUM_CLASSES],
            layer1_weights().unwrap(),
            layer1_bias().unwrap(),
            layer2_weights().unwrap(),
            layer2_bias().unwrap(),
        );
        assert!(matches!(
            result,
            Err(GradTraceError::IndexOutOfRange { index, limit, .. })
                if index == NUM_CLASSES && limit == NUM_CLASSES
        ));
    }

    #[test]
    fn test_backward_populates_known_gradients() {
        let trace = ClassifierTrace::build().unwrap();
        trace.backward().unwrap();

        // Sum reduction gives each per-example loss a gradient of 1.
        assert_eq!(trace.loss.grad().data(), &[1.0; BATCH]);

        // The gather places -1 at each labeled entry of a2_log.
        let y = labels();
        let log_grad = trace.a2_log.grad();
        for i in 0..BATCH {
            for j in 0..NUM_CLASSES {
                let want = if y[i] == j { -1.0 } else { 0.0 };
                assert_eq!(log_grad.data()[i * NUM_CLASSES + j], want);
            }
        }

        // The softmax/log/nll composite collapses to a2 - onehot(y) at z2.
        let a2 = trace.a2.value();
        let z2_grad = trace.z2.grad();
        for i in 0..BATCH {
            for j in 0..NUM_CLASSES {
                let onehot = if y[i] == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(
                    z2_grad.data()[i * NUM_CLASSES + j],
                    a2.data()[i * NUM_CLASSES + j] - onehot,
                    epsilon = 1e-5
                );
            }
        }

        // b2's gradient is the column sum of z2's.
        let b2_grad = trace.b2.grad();
        for j in 0..NUM_CLASSES {
            let col: f32 = (0..BATCH).map(|i| z2_grad.data()[i * NUM_CLASSES + j]).sum();
            assert_abs_diff_eq!(b2_grad.data()[j], col, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_reported_gradients_order_and_shapes() {
        let trace = ClassifierTrace::build().unwrap();
        trace.backward().unwrap();
        let reported = trace.reported_gradients();
        let expected: [(&str, &[usize]); 9] = [
            ("loss", &[4]),
            ("W1", &[10, 2]),
            ("b1", &[2]),
            ("W2", &[2, 4]),
            ("b2", &[4]),
            ("z1", &[4, 2]),
            ("a1", &[4, 2]),
            ("z2", &[4, 4]),
            ("a2", &[4, 4]),
        ];
        assert_eq!(reported.len(), expected.len());
        for ((name, grad), (want_name, want_shape)) in reported.iter().zip(expected.iter()) {
            assert_eq!(name, want_name);
            assert_eq!(grad.shape(), *want_shape);
        }
    }
}
