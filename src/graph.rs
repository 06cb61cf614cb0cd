use crate::error::GradTraceError;
use crate::tensor::Tensor;
use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

/// The closed set of differentiable operations in the fixed classifier graph.
///
/// The graph topology is known in advance, so a tagged enum over these
/// variants is all the dispatch the backward pass needs. Derived variants
/// hold shared, read-only references to their parent nodes; a derived node
/// never owns its parents' lifetime, it only keeps them alive for the
/// backward traversal.
#[derive(Debug)]
pub enum Op {
    /// An input or parameter, created once, never recomputed.
    Leaf,
    /// `C = A @ B`.
    MatMul(Rc<Node>, Rc<Node>),
    /// `[m, n] + [n]`, the bias broadcast across rows.
    BiasAdd(Rc<Node>, Rc<Node>),
    /// Element-wise `max(0, x)`.
    Relu(Rc<Node>),
    /// Row-wise softmax.
    Softmax(Rc<Node>),
    /// Element-wise natural log.
    Log(Rc<Node>),
    /// Per-row negative gather: `out[i] = -x[i, labels[i]]`.
    GatherNegate(Rc<Node>, Vec<usize>),
    /// Scalar sum reduction.
    Sum(Rc<Node>),
}

impl Op {
    fn parents(&self) -> Vec<&Rc<Node>> {
        match self {
            Op::Leaf => vec![],
            Op::MatMul(a, b) | Op::BiasAdd(a, b) => vec![a, b],
            Op::Relu(x) | Op::Softmax(x) | Op::Log(x) | Op::GatherNegate(x, _) | Op::Sum(x) => {
                vec![x]
            }
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Op::Leaf => "leaf",
            Op::MatMul(..) => "matmul",
            Op::BiasAdd(..) => "bias_add",
            Op::Relu(_) => "relu",
            Op::Softmax(_) => "softmax",
            Op::Log(_) => "log",
            Op::GatherNegate(..) => "gather_negate",
            Op::Sum(_) => "sum",
        }
    }
}

/// One node of the computation graph.
///
/// Wraps a forward-computed [`Tensor`] value together with the operation that
/// produced it and an accumulating gradient buffer. The gradient buffer is
/// allocated zero-filled with the value's shape at construction, so every
/// node, leaf or derived, has a readable gradient after the backward pass.
#[derive(Debug)]
pub struct Node {
    name: &'static str,
    value: Tensor,
    grad: RefCell<Tensor>,
    op: Op,
}

impl Node {
    fn derived(name: &'static str, value: Tensor, op: Op) -> Rc<Node> {
        let grad = RefCell::new(Tensor::zeros(value.shape().to_vec()));
        Rc::new(Node {
            name,
            value,
            grad,
            op,
        })
    }

    /// Creates a leaf node from an input or parameter tensor.
    pub fn leaf(name: &'static str, value: Tensor) -> Rc<Node> {
        Self::derived(name, value, Op::Leaf)
    }

    /// Creates a matrix-multiplication node `a @ b`.
    ///
    /// # Errors
    /// Returns `GradTraceError::IncompatibleShapes` if the operands are not
    /// 2-D or the inner dimensions disagree.
    pub fn matmul(
        name: &'static str,
        a: &Rc<Node>,
        b: &Rc<Node>,
    ) -> Result<Rc<Node>, GradTraceError> {
        let value = a.value.matmul(&b.value)?;
        Ok(Self::derived(name, value, Op::MatMul(a.clone(), b.clone())))
    }

    /// Creates a bias-add node broadcasting a 1-D bias over the rows of `x`.
    pub fn bias_add(
        name: &'static str,
        x: &Rc<Node>,
        bias: &Rc<Node>,
    ) -> Result<Rc<Node>, GradTraceError> {
        let value = x.value.add_row_broadcast(&bias.value)?;
        Ok(Self::derived(
            name,
            value,
            Op::BiasAdd(x.clone(), bias.clone()),
        ))
    }

    /// Creates an element-wise ReLU node.
    pub fn relu(name: &'static str, x: &Rc<Node>) -> Rc<Node> {
        let value = x.value.relu();
        Self::derived(name, value, Op::Relu(x.clone()))
    }

    /// Creates a row-wise softmax node.
    pub fn softmax(name: &'static str, x: &Rc<Node>) -> Result<Rc<Node>, GradTraceError> {
        let value = x.value.softmax_rows()?;
        Ok(Self::derived(name, value, Op::Softmax(x.clone())))
    }

    /// Creates an element-wise natural-log node.
    pub fn log(name: &'static str, x: &Rc<Node>) -> Rc<Node> {
        let value = x.value.ln();
        Self::derived(name, value, Op::Log(x.clone()))
    }

    /// Creates a per-row negative-log-likelihood gather node.
    ///
    /// For a 2-D input `x` of shape `[m, n]` and `m` class labels, the result
    /// is the 1-D tensor `out[i] = -x[i, labels[i]]`.
    ///
    /// # Errors
    /// Returns `GradTraceError::ShapeMismatch` if `x` is not 2-D or the label
    /// count differs from the row count, and `GradTraceError::IndexOutOfRange`
    /// if any label is not a valid column index.
    pub fn gather_negate(
        name: &'static str,
        x: &Rc<Node>,
        labels: &[usize],
    ) -> Result<Rc<Node>, GradTraceError> {
        let shape = x.value.shape();
        if shape.len() != 2 || labels.len() != shape[0] {
            return Err(GradTraceError::ShapeMismatch {
                expected: vec![labels.len(), 0],
                actual: shape.to_vec(),
                operation: "gather_negate".to_string(),
            });
        }
        let classes = shape[1];
        for &label in labels {
            if label >= classes {
                return Err(GradTraceError::IndexOutOfRange {
                    index: label,
                    limit: classes,
                    operation: "gather_negate".to_string(),
                });
            }
        }
        let out: Vec<f32> = labels
            .iter()
            .enumerate()
            .map(|(i, &label)| -x.value.get(&[i, label]))
            .collect();
        let value = Tensor::new(out, vec![labels.len()])?;
        Ok(Self::derived(
            name,
            value,
            Op::GatherNegate(x.clone(), labels.to_vec()),
        ))
    }

    /// Creates a scalar sum-reduction node.
    pub fn sum(name: &'static str, x: &Rc<Node>) -> Rc<Node> {
        let value = x.value.sum_all();
        Self::derived(name, value, Op::Sum(x.clone()))
    }

    /// Returns the node's label.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the forward-computed value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Borrows the accumulated gradient buffer.
    ///
    /// All zeros before [`backward`] runs, fully populated afterwards.
    pub fn grad(&self) -> Ref<'_, Tensor> {
        self.grad.borrow()
    }
}

/// Runs the backward pass from a scalar root.
///
/// Seeds the root's gradient with 1.0, then walks the graph in reverse
/// topological order (children before parents) so that each node's gradient
/// is fully accumulated before it is propagated further back. Contributions
/// are summed into the parents' buffers; this fixed topology happens to give
/// every node a single consumer, but the accumulation contract is the general
/// one.
///
/// Each node's gradient is populated exactly once per call. Calling this
/// twice on the same graph without rebuilding it is unspecified: the buffers
/// are not re-zeroed.
///
/// # Errors
/// Returns `GradTraceError::ShapeMismatch` if the root is not a single-element
/// tensor, and propagates tensor-engine errors from the local gradient rules.
pub fn backward(root: &Rc<Node>) -> Result<(), GradTraceError> {
    if root.value.numel() != 1 {
        return Err(GradTraceError::ShapeMismatch {
            expected: vec![1],
            actual: root.value.shape().to_vec(),
            operation: "backward (seed)".to_string(),
        });
    }
    root.grad.borrow_mut().fill(1.0);

    let mut visited = HashSet::new();
    let mut order = Vec::new();
    build_topo(root, &mut visited, &mut order);
    log::debug!("backward: {} nodes in topological order", order.len());

    for node in order.iter().rev() {
        log::trace!(
            "backward: visiting {:?} (op {}, grad shape {:?})",
            node.name,
            node.op.tag(),
            node.grad.borrow().shape()
        );
        propagate(node)?;
    }
    Ok(())
}

/// Recursively builds a topological sort of the graph rooted at `node`.
/// Visited tracking is by node address, as each `Rc<Node>` is unique per
/// graph position.
fn build_topo(node: &Rc<Node>, visited: &mut HashSet<*const Node>, order: &mut Vec<Rc<Node>>) {
    if !visited.insert(Rc::as_ptr(node)) {
        return;
    }
    for parent in node.op.parents() {
        build_topo(parent, visited, order);
    }
    order.push(node.clone());
}

/// Applies the local gradient rule of `node`'s operation, accumulating the
/// upstream gradient into each parent's buffer.
fn propagate(node: &Rc<Node>) -> Result<(), GradTraceError> {
    let g = node.grad.borrow();
    match &node.op {
        Op::Leaf => {}
        Op::MatMul(a, b) => {
            // dA = g @ B^T, dB = A^T @ g
            let grad_a = g.matmul(&b.value.transpose()?)?;
            let grad_b = a.value.transpose()?.matmul(&g)?;
            a.grad.borrow_mut().add_assign(&grad_a)?;
            b.grad.borrow_mut().add_assign(&grad_b)?;
        }
        Op::BiasAdd(x, bias) => {
            // Broadcasting backward is a reduction: the bias collects the
            // column sums, the matmul output passes through unchanged.
            let grad_bias = g.sum_rows()?;
            x.grad.borrow_mut().add_assign(&g)?;
            bias.grad.borrow_mut().add_assign(&grad_bias)?;
        }
        Op::Relu(x) => {
            // Zero where the input was <= 0, including the kink at exactly 0.
            let mask: Vec<f32> = x
                .value
                .data()
                .iter()
                .map(|&v| if v > 0.0 { 1.0 } else { 0.0 })
                .collect();
            let mask = Tensor::new(mask, x.value.shape().to_vec())?;
            let grad_x = g.hadamard(&mask)?;
            x.grad.borrow_mut().add_assign(&grad_x)?;
        }
        Op::Softmax(x) => {
            let grad_x = softmax_vjp(&node.value, &g)?;
            x.grad.borrow_mut().add_assign(&grad_x)?;
        }
        Op::Log(x) => {
            // d ln(a)/da = 1/a
            let grad_x = g.div_elem(&x.value)?;
            x.grad.borrow_mut().add_assign(&grad_x)?;
        }
        Op::GatherNegate(x, labels) => {
            let shape = x.value.shape().to_vec();
            let classes = shape[1];
            let mut out = vec![0.0f32; shape[0] * classes];
            for (i, &label) in labels.iter().enumerate() {
                out[i * classes + label] = -g.data()[i];
            }
            let grad_x = Tensor::new(out, shape)?;
            x.grad.borrow_mut().add_assign(&grad_x)?;
        }
        Op::Sum(x) => {
            let grad_x = Tensor::full(x.value.shape().to_vec(), g.data()[0]);
            x.grad.borrow_mut().add_assign(&grad_x)?;
        }
    }
    Ok(())
}

/// Row-wise vector-Jacobian product of the softmax.
///
/// For each row `i`: `dz[i,j] = s[i,j] * (g[i,j] - sum_k g[i,k] * s[i,k])`,
/// where `s` is the softmax output. The contraction runs per row; the
/// Jacobian is never materialized.
fn softmax_vjp(softmax_out: &Tensor, upstream: &Tensor) -> Result<Tensor, GradTraceError> {
    let shape = softmax_out.shape();
    let m = shape[0];
    let n = shape[1];
    let s = softmax_out.data();
    let g = upstream.data();
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        let mut dot = 0.0f32;
        for k in 0..n {
            dot += g[i * n + k] * s[i * n + k];
        }
        for j in 0..n {
            out[i * n + j] = s[i * n + j] * (g[i * n + j] - dot);
        }
    }
    Tensor::new(out, shape.to_vec())
}
