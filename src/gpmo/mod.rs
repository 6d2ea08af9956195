// src/gpmo/mod.rs
//
// Greedy permanent-magnet optimization. Every variant places one dipole
// (or one dipole plus neighbors) per iteration at +-1 along a single axis,
// maintains the running residual r = A m - b incrementally, and tracks
// availability through a dense boolean mask so the candidate scans stay
// branch-cheap and the mask can grow back during backtracking.
//
// The greedy solvers take the forward operator in transposed (3N, ngrid)
// layout: each dipole-axis column of A is one contiguous row.

pub mod backtracking;
pub mod baseline;
pub mod coherence;
pub mod multi;

pub use backtracking::gpmo_backtracking;
pub use baseline::gpmo_baseline;
pub use coherence::gpmo_coherence;
pub use multi::gpmo_multi;

use rayon::prelude::*;
use serde::Serialize;

use crate::dense::{self, DenseMatrix};
use crate::error::{check_len, Error};
use crate::history::{IterateHistory, SampleSchedule};
use crate::moment_field::MomentField;

/// Disabled candidate slots rank worse than any attainable residual.
pub const DISABLED_R2: f64 = 1e50;

const CHUNK: usize = 2048;

#[derive(Debug, Clone, Serialize)]
pub struct GpmoSettings {
    /// Number of greedy placement iterations.
    pub k_max: usize,
    /// Interior history samples; the output buffers hold nhistory + 1
    /// slots.
    pub nhistory: usize,
    /// Restrict selection to a single axis (0, 1 or 2). None scans all
    /// three.
    pub single_direction: Option<usize>,
    pub verbose: bool,
}

impl Default for GpmoSettings {
    fn default() -> Self {
        Self {
            k_max: 1000,
            nhistory: 100,
            single_direction: None,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GpmoOutput {
    /// Sampled R2 = 1/2 |A m - b|^2 values.
    pub objective_history: Vec<f64>,
    pub m_history: Vec<Vec<[f64; 3]>>,
    pub x: MomentField,
    /// Greedy iterations actually run; smaller than k_max only when the
    /// grid ran out of available slots.
    pub iterations: usize,
}

/// Per-slot availability, one flag per (dipole, axis). Committing a dipole
/// clears all three of its flags; backtracking restores them.
#[derive(Debug, Clone)]
pub struct AvailabilityMask {
    slots: Vec<bool>,
}

impl AvailabilityMask {
    pub fn new(n_dipoles: usize) -> Self {
        Self {
            slots: vec![true; 3 * n_dipoles],
        }
    }

    #[inline]
    pub fn is_available(&self, c: usize) -> bool {
        self.slots[c]
    }

    pub fn disable_dipole(&mut self, i: usize) {
        for d in 0..3 {
            self.slots[3 * i + d] = false;
        }
    }

    pub fn enable_dipole(&mut self, i: usize) {
        for d in 0..3 {
            self.slots[3 * i + d] = true;
        }
    }
}

pub(crate) struct GpmoProblem {
    pub n: usize,
    pub n3: usize,
}

pub(crate) fn validate(a_t: &DenseMatrix, b: &[f64]) -> Result<GpmoProblem, Error> {
    let n3 = a_t.nrows;
    check_len("A^T rows", 3 * (n3 / 3), n3)?;
    check_len("b", a_t.ncols, b.len())?;
    Ok(GpmoProblem { n: n3 / 3, n3 })
}

/// Fill both sign banks with |r +- A_{:,c}|^2 for every available column,
/// parallel over dipoles. Disabled or axis-filtered slots keep whatever
/// sentinel they hold.
pub(crate) fn scan_candidates(
    a_t: &DenseMatrix,
    r: &[f64],
    mask: &AvailabilityMask,
    single_direction: Option<usize>,
    r2_plus: &mut [f64],
    r2_minus: &mut [f64],
) {
    r2_plus
        .par_chunks_mut(3)
        .zip(r2_minus.par_chunks_mut(3))
        .enumerate()
        .for_each(|(i, (plus, minus))| {
            for d in 0..3 {
                if let Some(sd) = single_direction {
                    if sd != d {
                        continue;
                    }
                }
                let c = 3 * i + d;
                if !mask.is_available(c) {
                    continue;
                }
                let col = a_t.row(c);
                let mut acc_plus = 0.0;
                let mut acc_minus = 0.0;
                for (ri, aij) in r.iter().zip(col.iter()) {
                    let hi = ri + aij;
                    let lo = ri - aij;
                    acc_plus += hi * hi;
                    acc_minus += lo * lo;
                }
                plus[d] = acc_plus;
                minus[d] = acc_minus;
            }
        });
}

/// Stable argmin over both sign banks: the first minimum wins and the plus
/// bank is scanned before the minus bank. Returns (column, sign, value);
/// a value at or above [`DISABLED_R2`] means no slot was selectable.
pub(crate) fn select_best(r2_plus: &[f64], r2_minus: &[f64]) -> (usize, f64, f64) {
    let mut best_c = 0;
    let mut best_sign = 1.0;
    let mut best_val = f64::INFINITY;
    for (c, &v) in r2_plus.iter().enumerate() {
        if v < best_val {
            best_val = v;
            best_c = c;
            best_sign = 1.0;
        }
    }
    for (c, &v) in r2_minus.iter().enumerate() {
        if v < best_val {
            best_val = v;
            best_c = c;
            best_sign = -1.0;
        }
    }
    (best_c, best_sign, best_val)
}

/// Place +-1 at one dipole-axis slot: write x, update the running residual
/// with the contiguous column, retire the dipole, and poison its candidate
/// slots in both banks.
pub(crate) fn commit(
    a_t: &DenseMatrix,
    x: &mut MomentField,
    r: &mut [f64],
    mask: &mut AvailabilityMask,
    r2_plus: &mut [f64],
    r2_minus: &mut [f64],
    dipole: usize,
    axis: usize,
    sign: f64,
) {
    x.data[dipole][axis] = sign;
    dense::axpy(sign, a_t.row(3 * dipole + axis), r);
    mask.disable_dipole(dipole);
    for d in 0..3 {
        r2_plus[3 * dipole + d] = DISABLED_R2;
        r2_minus[3 * dipole + d] = DISABLED_R2;
    }
}

pub(crate) fn residual_half_norm2(r: &[f64]) -> f64 {
    0.5 * r
        .par_chunks(CHUNK)
        .map(|c| c.iter().map(|v| v * v).sum::<f64>())
        .sum::<f64>()
}

/// Sampling happens on the schedule regardless of verbosity; printing is
/// advisory only.
pub(crate) fn record_sample(
    history: &mut IterateHistory,
    schedule: &SampleSchedule,
    k: usize,
    r: &[f64],
    x: &MomentField,
    verbose: bool,
) {
    if !schedule.is_sample(k) {
        return;
    }
    let r2 = residual_half_norm2(r);
    if history.record(r2, r2, x).is_some() && verbose {
        println!("      [gpmo] it={}  R2={:.3e}", k, r2);
    }
}
