use crate::error::GradTraceError;
use crate::model::{self, ClassifierTrace};
use crate::tensor::Tensor;
use thiserror::Error;

/// Error type specifically for gradient checking failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GradCheckError {
    #[error("Gradient check failed for {parameter} at element {element_index}: analytical grad {analytical:?} != numerical grad {numerical:?}. Difference: {difference:?}")]
    GradientMismatch {
        parameter: &'static str,
        element_index: usize,
        analytical: f64,
        numerical: f64,
        difference: f64,
    },

    #[error("Numerical gradient is NaN or infinite for {parameter} at element {element_index}. Loss+: {loss_plus:?}, Loss-: {loss_minus:?}")]
    NumericalGradNaNOrInfinite {
        parameter: &'static str,
        element_index: usize,
        loss_plus: f64,
        loss_minus: f64,
    },

    #[error("Analytical gradient is NaN or infinite for {parameter} at element {element_index}. Value: {value:?}")]
    AnalyticalGradNaNOrInfinite {
        parameter: &'static str,
        element_index: usize,
        value: f64,
    },

    #[error("Evaluator error during gradient check: {0}")]
    Evaluator(#[from] GradTraceError),
}

/// The four trainable parameters of the fixed classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    W1,
    B1,
    W2,
    B2,
}

impl Parameter {
    /// All parameters, in reporting order.
    pub const ALL: [Parameter; 4] = [Parameter::W1, Parameter::B1, Parameter::W2, Parameter::B2];

    fn name(self) -> &'static str {
        match self {
            Parameter::W1 => "W1",
            Parameter::B1 => "b1",
            Parameter::W2 => "W2",
            Parameter::B2 => "b2",
        }
    }

    fn baseline(self) -> Result<Tensor, GradTraceError> {
        match self {
            Parameter::W1 => model::layer1_weights(),
            Parameter::B1 => model::layer1_bias(),
            Parameter::W2 => model::layer2_weights(),
            Parameter::B2 => model::layer2_bias(),
        }
    }
}

/// Rebuilds the full forward pass with one parameter replaced and returns the
/// scalar total loss.
fn loss_with(parameter: Parameter, replacement: Tensor) -> Result<f64, GradTraceError> {
    let mut w1 = model::layer1_weights()?;
    let mut b1 = model::layer1_bias()?;
    let mut w2 = model::layer2_weights()?;
    let mut b2 = model::layer2_bias()?;
    match parameter {
        Parameter::W1 => w1 = replacement,
        Parameter::B1 => b1 = replacement,
        Parameter::W2 => w2 = replacement,
        Parameter::B2 => b2 = replacement,
    }
    let trace =
        ClassifierTrace::with_parameters(model::input_batch()?, model::labels(), w1, b1, w2, b2)?;
    Ok(trace.total.value().data()[0] as f64)
}

fn perturbed(baseline: &Tensor, element_index: usize, delta: f32) -> Result<Tensor, GradTraceError> {
    let mut data = baseline.data().to_vec();
    data[element_index] += delta;
    Tensor::new(data, baseline.shape().to_vec())
}

/// Checks one parameter's analytical gradient against central finite
/// differences: `(loss(p + eps) - loss(p - eps)) / (2 eps)` per element,
/// compared in f64.
///
/// The graph is rebuilt from scratch for every perturbation, so the check
/// never reuses an already-backward'd graph.
pub fn check_parameter(
    parameter: Parameter,
    epsilon: f64,
    tolerance: f64,
) -> Result<(), GradCheckError> {
    let trace = ClassifierTrace::build().map_err(GradCheckError::Evaluator)?;
    trace.backward().map_err(GradCheckError::Evaluator)?;
    let analytical: Vec<f64> = match parameter {
        Parameter::W1 => trace.w1.grad().data().iter().map(|&v| v as f64).collect(),
        Parameter::B1 => trace.b1.grad().data().iter().map(|&v| v as f64).collect(),
        Parameter::W2 => trace.w2.grad().data().iter().map(|&v| v as f64).collect(),
        Parameter::B2 => trace.b2.grad().data().iter().map(|&v| v as f64).collect(),
    };

    let baseline = parameter.baseline()?;
    let name = parameter.name();

    for element_index in 0..baseline.numel() {
        let loss_plus = loss_with(parameter, perturbed(&baseline, element_index, epsilon as f32)?)?;
        let loss_minus = loss_with(
            parameter,
            perturbed(&baseline, element_index, -(epsilon as f32))?,
        )?;
        let numerical = (loss_plus - loss_minus) / (2.0 * epsilon);

        if numerical.is_nan() || numerical.is_infinite() {
            return Err(GradCheckError::NumericalGradNaNOrInfinite {
                parameter: name,
                element_index,
                loss_plus,
                loss_minus,
            });
        }
        let value = analytical[element_index];
        if value.is_nan() || value.is_infinite() {
            return Err(GradCheckError::AnalyticalGradNaNOrInfinite {
                parameter: name,
                element_index,
                value,
            });
        }

        let difference = (value - numerical).abs();
        if difference > tolerance && (difference / (value.abs() + epsilon)) > tolerance {
            return Err(GradCheckError::GradientMismatch {
                parameter: name,
                element_index,
                analytical: value,
                numerical,
                difference,
            });
        }
    }
    Ok(())
}

/// Runs [`check_parameter`] over every parameter of the classifier.
pub fn check_all_parameters(epsilon: f64, tolerance: f64) -> Result<(), GradCheckError> {
    for parameter in Parameter::ALL {
        check_parameter(parameter, epsilon, tolerance)?;
    }
    Ok(())
}
