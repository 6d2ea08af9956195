// src/gpmo/multi.rs

use rayon::prelude::*;

use super::{
    record_sample, select_best, validate, AvailabilityMask, GpmoOutput, GpmoSettings, DISABLED_R2,
};
use crate::connectivity::{build_neighbor_table, NeighborTable};
use crate::dense::{self, DenseMatrix};
use crate::error::{check_len, Error};
use crate::history::{IterateHistory, SampleSchedule};
use crate::moment_field::MomentField;

/// First `count` dipoles from the neighbor row whose slot along `axis` is
/// still available (fewer if the row runs out). The row starts with the
/// dipole itself.
fn available_neighbors(
    table: &NeighborTable,
    dipole: usize,
    axis: usize,
    mask: &AvailabilityMask,
    count: usize,
    out: &mut Vec<usize>,
) {
    out.clear();
    for &cj in table.row(dipole) {
        if mask.is_available(3 * cj + axis) {
            out.push(cj);
            if out.len() == count {
                break;
            }
        }
    }
}

/// Greedy placement in blocks: every candidate is scored together with its
/// `nadjacent` nearest still-available same-axis neighbors, and the winner
/// commits the whole block with one shared sign.
pub fn gpmo_multi(
    a_t: &DenseMatrix,
    b: &[f64],
    dipole_xyz: &[[f64; 3]],
    nadjacent: usize,
    settings: &GpmoSettings,
) -> Result<GpmoOutput, Error> {
    let prob = validate(a_t, b)?;
    check_len("dipole_xyz", prob.n, dipole_xyz.len())?;

    // a block always contains at least the winning dipole itself
    let nadjacent = nadjacent.max(1);

    let table = build_neighbor_table(dipole_xyz);

    let mut x = MomentField::zeros(prob.n);
    let mut mask = AvailabilityMask::new(prob.n);
    let mut r: Vec<f64> = b.iter().map(|bi| -bi).collect();
    let mut r2_plus = vec![DISABLED_R2; prob.n3];
    let mut r2_minus = vec![DISABLED_R2; prob.n3];
    let mut block = Vec::with_capacity(nadjacent.max(1));

    let schedule = SampleSchedule::new(settings.k_max, settings.nhistory);
    let mut history = IterateHistory::new(prob.n, settings.nhistory + 1);

    if settings.verbose {
        println!("      [gpmo-multi] it ... R2");
    }

    let mut iterations = settings.k_max;
    for k in 0..settings.k_max {
        // Score each available column together with its neighbor block,
        // every neighbor evaluated against the same running residual.
        r2_plus
            .par_chunks_mut(3)
            .zip(r2_minus.par_chunks_mut(3))
            .enumerate()
            .for_each(|(i, (plus, minus))| {
                for d in 0..3 {
                    if let Some(sd) = settings.single_direction {
                        if sd != d {
                            continue;
                        }
                    }
                    if !mask.is_available(3 * i + d) {
                        continue;
                    }
                    let mut acc_plus = 0.0;
                    let mut acc_minus = 0.0;
                    let mut taken = 0;
                    for &cj in table.row(i) {
                        if !mask.is_available(3 * cj + d) {
                            continue;
                        }
                        let col = a_t.row(3 * cj + d);
                        for (ri, aij) in r.iter().zip(col.iter()) {
                            let hi = ri + aij;
                            let lo = ri - aij;
                            acc_plus += hi * hi;
                            acc_minus += lo * lo;
                        }
                        taken += 1;
                        if taken == nadjacent {
                            break;
                        }
                    }
                    plus[d] = acc_plus;
                    minus[d] = acc_minus;
                }
            });

        let (c, sign, val) = select_best(&r2_plus, &r2_minus);
        if val >= DISABLED_R2 {
            iterations = k;
            history.truncate_to_written();
            break;
        }

        let (dipole, axis) = (c / 3, c % 3);
        available_neighbors(&table, dipole, axis, &mask, nadjacent, &mut block);
        for &cj in &block {
            x.data[cj][axis] = sign;
            dense::axpy(sign, a_t.row(3 * cj + axis), &mut r);
        }
        for &cj in &block {
            mask.disable_dipole(cj);
            for d in 0..3 {
                r2_plus[3 * cj + d] = DISABLED_R2;
                r2_minus[3 * cj + d] = DISABLED_R2;
            }
        }

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
