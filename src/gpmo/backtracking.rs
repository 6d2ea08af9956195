// src/gpmo/backtracking.rs

use super::{
    commit, record_sample, scan_candidates, select_best, validate, AvailabilityMask, GpmoOutput,
    GpmoSettings, DISABLED_R2,
};
use crate::connectivity::build_neighbor_table;
use crate::dense::{self, DenseMatrix};
use crate::error::{check_len, Error};
use crate::history::{IterateHistory, SampleSchedule};
use crate::moment_field::MomentField;

/// Baseline greedy placement plus periodic wyrm removal: every
/// `backtrack_every` iterations, adjacent same-axis opposite-sign pairs
/// (whose fields nearly cancel) are erased, their mask slots restored and
/// their residual contribution subtracted, so later iterations can place
/// those dipoles more usefully.
pub fn gpmo_backtracking(
    a_t: &DenseMatrix,
    b: &[f64],
    dipole_xyz: &[[f64; 3]],
    nadjacent: usize,
    backtrack_every: usize,
    settings: &GpmoSettings,
) -> Result<GpmoOutput, Error> {
    let prob = validate(a_t, b)?;
    check_len("dipole_xyz", prob.n, dipole_xyz.len())?;

    let table = build_neighbor_table(dipole_xyz);

    let mut x = MomentField::zeros(prob.n);
    let mut mask = AvailabilityMask::new(prob.n);
    let mut r: Vec<f64> = b.iter().map(|bi| -bi).collect();
    let mut r2_plus = vec![DISABLED_R2; prob.n3];
    let mut r2_minus = vec![DISABLED_R2; prob.n3];

    // per-dipole sign/axis of the current placement; sign 0 marks "empty
    // or already de-wyrmed"
    let mut sign_of = vec![0.0f64; prob.n];
    let mut axis_of = vec![0usize; prob.n];
    let mut placed: Vec<usize> = Vec::with_capacity(settings.k_max);

    let schedule = SampleSchedule::new(settings.k_max, settings.nhistory);
    let mut history = IterateHistory::new(prob.n, settings.nhistory + 1);

    if settings.verbose {
        println!("      [gpmo-bt] it ... R2");
    }

    let mut iterations = settings.k_max;
    for k in 0..settings.k_max {
        scan_candidates(
            a_t,
            &r,
            &mask,
            settings.single_direction,
            &mut r2_plus,
            &mut r2_minus,
        );

        let (c, sign, val) = select_best(&r2_plus, &r2_minus);
        if val >= DISABLED_R2 {
            iterations = k;
            history.truncate_to_written();
            break;
        }
        let (dipole, axis) = (c / 3, c % 3);
        commit(
            a_t,
            &mut x,
            &mut r,
            &mut mask,
            &mut r2_plus,
            &mut r2_minus,
            dipole,
            axis,
            sign,
        );
        sign_of[dipole] = sign;
        axis_of[dipole] = axis;
        placed.push(dipole);

        if k > 0 && backtrack_every > 0 && k % backtrack_every == 0 {
            // Scan earlier placements for an adjacent cancelling partner.
            // Each erased pair re-enters the availability mask and its
            // sign records are zeroed so it is not matched twice in one
            // pass.
            let mut removed = 0;
            for &jk in placed.iter().take(placed.len() - 1) {
                if sign_of[jk] == 0.0 {
                    continue;
                }
                for &cj in table.row(jk).iter().take(nadjacent) {
                    if sign_of[jk] == -sign_of[cj]
                        && sign_of[cj] != 0.0
                        && axis_of[jk] == axis_of[cj]
                    {
                        x.data[jk][axis_of[jk]] = 0.0;
                        x.data[cj][axis_of[cj]] = 0.0;
                        mask.enable_dipole(jk);
                        mask.enable_dipole(cj);
                        dense::axpy(-sign_of[jk], a_t.row(3 * jk + axis_of[jk]), &mut r);
                        dense::axpy(-sign_of[cj], a_t.row(3 * cj + axis_of[cj]), &mut r);
                        sign_of[jk] = 0.0;
                        sign_of[cj] = 0.0;
                        removed += 1;
                        break;
                    }
                }
            }
            if settings.verbose {
                println!("      [gpmo-bt] it={}  wyrm pairs removed: {}", k, removed);
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
