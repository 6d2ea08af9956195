// src/run_record.rs

use serde::Serialize;

/// Summary of one solver invocation, rendered to JSON so callers can fold
/// it into their run records. The core itself never touches the
/// filesystem.
#[derive(Serialize)]
pub struct RunRecord<S: Serialize> {
    pub solver: &'static str,
    pub settings: S,
    pub iterations: usize,
    pub converged: Option<bool>,
    pub final_objective: Option<f64>,
}

impl<S: Serialize> RunRecord<S> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
