use approx::assert_abs_diff_eq;
use gradtrace::grad_check::{check_all_parameters, check_parameter, Parameter};
use gradtrace::model::{labels, ClassifierTrace, BATCH, NUM_CLASSES};

#[test]
fn finite_difference_matches_analytical_gradients() {
    check_all_parameters(1e-3, 1e-3).expect("finite-difference gradient check failed");
}

#[test]
fn finite_difference_per_parameter() {
    for parameter in Parameter::ALL {
        check_parameter(parameter, 1e-3, 1e-3)
            .unwrap_or_else(|e| panic!("gradient check failed for {parameter:?}: {e}"));
    }
}

#[test]
fn softmax_rows_and_jacobian_contraction() {
    let trace = ClassifierTrace::build().unwrap();
    trace.backward().unwrap();

    let a2 = trace.a2.value().clone();
    let z2_grad = trace.z2.grad().clone();
    let y = labels();

    for i in 0..BATCH {
        let row = &a2.data()[i * NUM_CLASSES..(i + 1) * NUM_CLASSES];
        let row_sum: f32 = row.iter().sum();
        assert_abs_diff_eq!(row_sum, 1.0, epsilon = 1e-5);

        // The contraction through log and the negative gather collapses to
        // a2 - onehot(y) row by row.
        for j in 0..NUM_CLASSES {
            let onehot = if y[i] == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(
                z2_grad.data()[i * NUM_CLASSES + j],
                row[j] - onehot,
                epsilon = 1e-5
            );
        }
    }
}

#[test]
fn reported_gradient_shapes() {
    let trace = ClassifierTrace::build().unwrap();
    trace.backward().unwrap();

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
    for ((name, grad), (want_name, want_shape)) in trace
        .reported_gradients()
        .iter()
        .zip(expected.iter())
    {
        assert_eq!(name, want_name);
        assert_eq!(grad.shape(), *want_shape, "shape mismatch for {want_name}");
    }
}

#[test]
fn evaluation_is_deterministic() {
    let first = ClassifierTrace::build().unwrap();
    first.backward().unwrap();
    let second = ClassifierTrace::build().unwrap();
    second.backward().unwrap();

    assert_eq!(
        first.total.value().data(),
        second.total.value().data(),
        "total loss differs across runs"
    );
    for ((name_a, grad_a), (_, grad_b)) in first
        .reported_gradients()
        .iter()
        .zip(second.reported_gradients().iter())
    {
        // Same fixed inputs, same single-threaded evaluation order: the
        // gradients must be bit-identical, not merely close.
        assert_eq!(
            grad_a.data(),
            grad_b.data(),
            "gradient for {name_a} differs across runs"
        );
    }
}

#[test]
fn total_loss_is_positive_scalar() {
    let trace = ClassifierTrace::build().unwrap();
    assert_eq!(trace.total.value().shape(), &[1]);
    assert!(trace.total.value().data()[0] > 0.0);
    for &l in trace.loss.value().data() {
        assert!(l > 0.0);
    }
}
