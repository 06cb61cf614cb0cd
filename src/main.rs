use gradtrace::{ClassifierTrace, GradTraceError};
use std::process::ExitCode;

/// Builds the fixed classifier graph, runs the backward pass, and prints the
/// gradient of every reported tensor. Any failure aborts without partial
/// output.
fn run() -> Result<(), GradTraceError> {
    let trace = ClassifierTrace::build()?;
    trace.backward()?;
    for (name, grad) in trace.reported_gradients() {
        println!("--- {name} grad ---");
        println!("{grad}");
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gradtrace failed: {err}");
            ExitCode::FAILURE
        }
    }
}
