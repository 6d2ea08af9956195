// src/history.rs
//
// Fixed-capacity sampled histories. Buffers are sized once at solver entry
// and written in place; reporting cadence never feeds back into the
// numerics.

use crate::moment_field::MomentField;

/// Which iterations get a history snapshot: every `stride` iterations plus
/// the first and last of the run.
#[derive(Debug, Clone, Copy)]
pub struct SampleSchedule {
    total: usize,
    stride: usize,
}

impl SampleSchedule {
    /// Schedule roughly `nsamples` interior snapshots over `total`
    /// iterations.
    pub fn new(total: usize, nsamples: usize) -> Self {
        let stride = (total / nsamples.max(1)).max(1);
        Self { total, stride }
    }

    #[inline]
    pub fn is_sample(&self, k: usize) -> bool {
        k % self.stride == 0 || k == 0 || k + 1 == self.total
    }
}

/// Pre-allocated iterate history: total objective, residual term, and a
/// full moment snapshot per written slot. Unwritten slots stay zero, as the
/// callers' fixed-size output contract expects.
#[derive(Debug, Clone)]
pub struct IterateHistory {
    written: usize,
    pub objective: Vec<f64>,
    pub r2: Vec<f64>,
    pub moments: Vec<Vec<[f64; 3]>>,
}

impl IterateHistory {
    pub fn new(n_dipoles: usize, capacity: usize) -> Self {
        Self {
            written: 0,
            objective: vec![0.0; capacity],
            r2: vec![0.0; capacity],
            moments: vec![vec![[0.0; 3]; n_dipoles]; capacity],
        }
    }

    /// Write the next slot. Returns the slot index, or None once the
    /// capacity is exhausted (the counter is capped, never wrapped).
    pub fn record(&mut self, objective: f64, r2: f64, m: &MomentField) -> Option<usize> {
        if self.written == self.objective.len() {
            return None;
        }
        let slot = self.written;
        self.objective[slot] = objective;
        self.r2[slot] = r2;
        self.moments[slot].copy_from_slice(&m.data);
        self.written += 1;
        Some(slot)
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Shrink the buffers to the written prefix (early-exit case).
    pub fn truncate_to_written(&mut self) {
        self.objective.truncate(self.written);
        self.r2.truncate(self.written);
        self.moments.truncate(self.written);
    }

    pub fn into_parts(self) -> (Vec<f64>, Vec<f64>, Vec<Vec<[f64; 3]>>) {
        (self.objective, self.r2, self.moments)
    }
}
