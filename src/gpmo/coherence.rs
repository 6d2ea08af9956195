// src/gpmo/coherence.rs

use rayon::prelude::*;

use super::{record_sample, validate, AvailabilityMask, GpmoOutput, GpmoSettings};
use crate::dense::{self, DenseMatrix};
use crate::error::{check_len, Error};
use crate::history::{IterateHistory, SampleSchedule};
use crate::moment_field::MomentField;

/// Mutual-coherence-guided greedy selection (binary matching pursuit).
/// Keeps u = A^T (b - A m) up to date and picks the column with the
/// largest |u_c| instead of rescoring every candidate residual, which
/// drops the per-iteration cost from O(N * ngrid) column scans to one
/// A^T A column. The +- sign still comes from the residual comparison.
pub fn gpmo_coherence(
    a_t: &DenseMatrix,
    b: &[f64],
    atb: &[f64],
    settings: &GpmoSettings,
) -> Result<GpmoOutput, Error> {
    let prob = validate(a_t, b)?;
    check_len("ATb", prob.n3, atb.len())?;

    let mut x = MomentField::zeros(prob.n);
    let mut mask = AvailabilityMask::new(prob.n);
    let mut r: Vec<f64> = b.iter().map(|bi| -bi).collect();
    let mut u = atb.to_vec();

    let schedule = SampleSchedule::new(settings.k_max, settings.nhistory);
    let mut history = IterateHistory::new(prob.n, settings.nhistory + 1);

    if settings.verbose {
        println!("      [gpmo-mc] it ... R2");
    }

    let mut iterations = settings.k_max;
    for k in 0..settings.k_max {
        // argmax |u_c| over the available slots; first maximum wins
        let mut best: Option<(usize, f64)> = None;
        for (c, &uc) in u.iter().enumerate() {
            if !mask.is_available(c) {
                continue;
            }
            if let Some(sd) = settings.single_direction {
                if c % 3 != sd {
                    continue;
                }
            }
            let mag = uc.abs();
            if best.map_or(true, |(_, m)| mag > m) {
                best = Some((c, mag));
            }
        }
        let Some((c, _)) = best else {
            iterations = k;
            history.truncate_to_written();
            break;
        };

        let col = a_t.row(c);
        let mut r2_plus = 0.0;
        let mut r2_minus = 0.0;
        for (ri, aij) in r.iter().zip(col.iter()) {
            let hi = ri + aij;
            let lo = ri - aij;
            r2_plus += hi * hi;
            r2_minus += lo * lo;
        }
        let sign = if r2_minus < r2_plus { -1.0 } else { 1.0 };

        let dipole = c / 3;
        x.data[dipole][c % 3] = sign;
        dense::axpy(sign, col, &mut r);
        mask.disable_dipole(dipole);

        // u <- u - A^T A_{:,c}, only where still selectable
        u.par_iter_mut().enumerate().for_each(|(j, uj)| {
            if mask.is_available(j) {
                let mut ata = 0.0;
                for (aj, ac) in a_t.row(j).iter().zip(col.iter()) {
                    ata += aj * ac;
                }
                *uj -= ata;
            }
        });

        record_sample(&mut history, &schedule, k, &r, &x, settings.verbose);
    }

    let (objective_history, _, m_history) = history.into_parts();
    Ok(GpmoOutput {
        objective_history,
        m_history,
        x,
        iterations,
    })
}
