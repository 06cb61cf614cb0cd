use crate::error::GradTraceError;
use std::fmt;

/// A dense, contiguous, row-major tensor of `f32` values.
///
/// This is the numeric substrate of the evaluator: it tracks a shape and a
/// flat backing store, and supplies the primitive operations (matmul,
/// broadcast add, relu, softmax, log, reductions) that the graph layer
/// composes. Operations are pure: they allocate a new tensor and never
/// mutate their inputs, except for [`Tensor::add_assign`] and
/// [`Tensor::fill`] which exist for gradient accumulation.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl Tensor {
    /// Creates a new tensor from flat row-major data and a shape.
    ///
    /// # Errors
    /// Returns `GradTraceError::TensorCreationError` if the data length does
    /// not match the number of elements implied by the shape.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self, GradTraceError> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(GradTraceError::TensorCreationError {
                data_len: data.len(),
                shape,
            });
        }
        Ok(Tensor { data, shape })
    }

    /// Creates a zero-filled tensor of the given shape.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; numel],
            shape,
        }
    }

    /// Creates a tensor of the given shape with every element set to `value`.
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let numel: usize = shape.iter().product();
        Tensor {
            data: vec![value; numel],
            shape,
        }
    }

    /// Creates a single-element tensor of shape `[1]`.
    pub fn scalar(value: f32) -> Self {
        Tensor {
            data: vec![value],
            shape: vec![1],
        }
    }

    /// Returns the tensor's shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the flat row-major backing store.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns the number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Returns the number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Returns the element at the given multi-index.
    ///
    /// Panics if the index rank or any coordinate is out of bounds; callers
    /// validate indices up front and report structured errors themselves.
    pub fn get(&self, indices: &[usize]) -> f32 {
        assert_eq!(
            indices.len(),
            self.shape.len(),
            "index rank {} does not match tensor rank {} (shape {:?})",
            indices.len(),
            self.shape.len(),
            self.shape
        );
        let mut offset = 0;
        let mut stride = 1;
        for dim in (0..self.shape.len()).rev() {
            assert!(
                indices[dim] < self.shape[dim],
                "index {} out of bounds for dimension {} with size {}",
                indices[dim],
                dim,
                self.shape[dim]
            );
            offset += indices[dim] * stride;
            stride *= self.shape[dim];
        }
        self.data[offset]
    }

    /// Overwrites every element with `value`.
    pub fn fill(&mut self, value: f32) {
        for v in self.data.iter_mut() {
            *v = value;
        }
    }

    /// Performs matrix multiplication `C = A @ B`.
    ///
    /// Only 2-D tensors are supported: `A: [m, k]`, `B: [k, n]` -> `C: [m, n]`.
    ///
    /// # Errors
    /// Returns `GradTraceError::IncompatibleShapes` if either operand is not
    /// 2-D or the inner dimensions disagree.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, GradTraceError> {
        if self.rank() != 2 || other.rank() != 2 || self.shape[1] != other.shape[0] {
            return Err(GradTraceError::IncompatibleShapes {
                shape1: self.shape.clone(),
                shape2: other.shape.clone(),
                operation: "matmul".to_string(),
            });
        }

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for l in 0..k {
                    acc += self.data[i * k + l] * other.data[l * n + j];
                }
                out[i * n + j] = acc;
            }
        }
        Ok(Tensor {
            data: out,
            shape: vec![m, n],
        })
    }

    /// Transposes a 2-D tensor: `[m, n]` -> `[n, m]`.
    ///
    /// # Errors
    /// Returns `GradTraceError::ShapeMismatch` if the tensor is not 2-D.
    pub fn transpose(&self) -> Result<Tensor, GradTraceError> {
        if self.rank() != 2 {
            return Err(GradTraceError::ShapeMismatch {
                expected: vec![2],
                actual: vec![self.rank()],
                operation: "transpose (rank)".to_string(),
            });
        }
        let m = self.shape[0];
        let n = self.shape[1];
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                out[j * m + i] = self.data[i * n + j];
            }
        }
        Ok(Tensor {
            data: out,
            shape: vec![n, m],
        })
    }

    /// Adds a 1-D bias to every row of a 2-D tensor: `[m, n] + [n]` -> `[m, n]`.
    ///
    /// # Errors
    /// Returns `GradTraceError::IncompatibleShapes` if `self` is not 2-D, or
    /// the bias is not 1-D of length `n`.
    pub fn add_row_broadcast(&self, bias: &Tensor) -> Result<Tensor, GradTraceError> {
        if self.rank() != 2 || bias.rank() != 1 || bias.shape[0] != self.shape[1] {
            return Err(GradTraceError::IncompatibleShapes {
                shape1: self.shape.clone(),
                shape2: bias.shape.clone(),
                operation: "add_row_broadcast".to_string(),
            });
        }
        let m = self.shape[0];
        let n = self.shape[1];
        let mut out = self.data.clone();
        for i in 0..m {
            for j in 0..n {
                out[i * n + j] += bias.data[j];
            }
        }
        Ok(Tensor {
            data: out,
            shape: self.shape.clone(),
        })
    }

    /// Applies the Rectified Linear Unit element-wise: `relu(x) = max(0, x)`.
    pub fn relu(&self) -> Tensor {
        let out = self
            .data
            .iter()
            .map(|&x| if x > 0.0 { x } else { 0.0 })
            .collect();
        Tensor {
            data: out,
            shape: self.shape.clone(),
        }
    }

    /// Computes the row-wise softmax of a 2-D tensor.
    ///
    /// The row maximum is subtracted before exponentiating. This leaves the
    /// mathematical result unchanged (the shift cancels in the ratio) and
    /// keeps the exponentials in range.
    ///
    /// # Errors
    /// Returns `GradTraceError::ShapeMismatch` if the tensor is not 2-D, and
    /// `GradTraceError::NumericalInstability` if the result still contains a
    /// non-finite value.
    pub fn softmax_rows(&self) -> Result<Tensor, GradTraceError> {
        if self.rank() != 2 {
            return Err(GradTraceError::ShapeMismatch {
                expected: vec![2],
                actual: vec![self.rank()],
                operation: "softmax_rows (rank)".to_string(),
            });
        }
        let m = self.shape[0];
        let n = self.shape[1];
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            let row = &self.data[i * n..(i + 1) * n];
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut denom = 0.0f32;
            for j in 0..n {
                let e = (row[j] - max).exp();
                out[i * n + j] = e;
                denom += e;
            }
            for j in 0..n {
                out[i * n + j] /= denom;
            }
        }
        if out.iter().any(|v| !v.is_finite()) {
            return Err(GradTraceError::NumericalInstability {
                operation: "softmax_rows".to_string(),
            });
        }
        Ok(Tensor {
            data: out,
            shape: self.shape.clone(),
        })
    }

    /// Computes the element-wise natural logarithm.
    ///
    /// The logarithm is only defined for strictly positive inputs; non-positive
    /// elements produce `NaN` or `-inf`, which downstream consumers surface as
    /// `NumericalInstability` where they check finiteness.
    pub fn ln(&self) -> Tensor {
        let out = self.data.iter().map(|&x| x.ln()).collect();
        Tensor {
            data: out,
            shape: self.shape.clone(),
        }
    }

    /// Sums every element into a scalar tensor of shape `[1]`.
    pub fn sum_all(&self) -> Tensor {
        Tensor::scalar(self.data.iter().sum())
    }

    /// Sums a 2-D tensor over its row dimension: `[m, n]` -> `[n]`.
    ///
    /// This is the reduction that undoes a row broadcast, used by the
    /// bias-add backward rule.
    ///
    /// # Errors
    /// Returns `GradTraceError::ShapeMismatch` if the tensor is not 2-D.
    pub fn sum_rows(&self) -> Result<Tensor, GradTraceError> {
        if self.rank() != 2 {
            return Err(GradTraceError::ShapeMismatch {
                expected: vec![2],
                actual: vec![self.rank()],
                operation: "sum_rows (rank)".to_string(),
            });
        }
        let m = self.shape[0];
        let n = self.shape[1];
        let mut out = vec![0.0f32; n];
        for i in 0..m {
            for j in 0..n {
                out[j] += self.data[i * n + j];
            }
        }
        Ok(Tensor {
            data: out,
            shape: vec![n],
        })
    }

    /// Element-wise product of two tensors of identical shape.
    ///
    /// # Errors
    /// Returns `GradTraceError::ShapeMismatch` if the shapes differ.
    pub fn hadamard(&self, other: &Tensor) -> Result<Tensor, GradTraceError> {
        self.check_same_shape(other, "hadamard")?;
        let out = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| a * b)
            .collect();
        Ok(Tensor {
            data: out,
            shape: self.shape.clone(),
        })
    }

    /// Element-wise quotient of two tensors of identical shape.
    ///
    /// # Errors
    /// Returns `GradTraceError::ShapeMismatch` if the shapes differ.
    pub fn div_elem(&self, other: &Tensor) -> Result<Tensor, GradTraceError> {
        self.check_same_shape(other, "div_elem")?;
        let out = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| a / b)
            .collect();
        Ok(Tensor {
            data: out,
            shape: self.shape.clone(),
        })
    }

    /// Accumulates `other` into `self` element-wise.
    ///
    /// # Errors
    /// Returns `GradTraceError::ShapeMismatch` if the shapes differ.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<(), GradTraceError> {
        self.check_same_shape(other, "add_assign")?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    fn check_same_shape(&self, other: &Tensor, operation: &str) -> Result<(), GradTraceError> {
        if self.shape != other.shape {
            return Err(GradTraceError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: other.shape.clone(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shape.len() {
            2 => {
                let m = self.shape[0];
                let n = self.shape[1];
                writeln!(f, "[")?;
                for i in 0..m {
                    write!(f, "  [")?;
                    for j in 0..n {
                        if j > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{:>10.6}", self.data[i * n + j])?;
                    }
                    writeln!(f, "]")?;
                }
                write!(f, "]")
            }
            _ => {
                write!(f, "[")?;
                for (k, v) in self.data.iter().enumerate() {
                    if k > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:>10.6}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}
