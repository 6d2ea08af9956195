//! Error types for the solver entry points.

use thiserror::Error;

/// Errors detected before any computation starts. Numerical trouble during
/// a solve (non-convergence, slow progress) is reported through the solver
/// outputs instead.
#[derive(Error, Debug)]
pub enum Error {
    /// An input array does not have the declared shape.
    #[error("shape mismatch for {name}: expected {expected}, got {got}")]
    ShapeMismatch {
        name: &'static str,
        expected: usize,
        got: usize,
    },
}

pub(crate) fn check_len(name: &'static str, expected: usize, got: usize) -> Result<(), Error> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            name,
            expected,
            got,
        })
    }
}
