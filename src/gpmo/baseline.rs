// src/gpmo/baseline.rs

use super::{
    commit, record_sample, scan_candidates, select_best, validate, AvailabilityMask, GpmoOutput,
    GpmoSettings, DISABLED_R2,
};
use crate::dense::DenseMatrix;
use crate::error::Error;
use crate::history::{IterateHistory, SampleSchedule};
use crate::moment_field::MomentField;

/// Greedy binary matching pursuit: each iteration evaluates
/// |r +- A_{:,c}|^2 for every available column and commits the best
/// dipole, axis and sign.
pub fn gpmo_baseline(
    a_t: &DenseMatrix,
    b: &[f64],
    settings: &GpmoSettings,
) -> Result<GpmoOutput, Error> {
    let prob = validate(a_t, b)?;

    let mut x = MomentField::zeros(prob.n);
    let mut mask = AvailabilityMask::new(prob.n);
    let mut r: Vec<f64> = b.iter().map(|bi| -bi).collect();
    let mut r2_plus = vec![DISABLED_R2; prob.n3];
    let mut r2_minus = vec![DISABLED_R2; prob.n3];

    let schedule = SampleSchedule::new(settings.k_max, settings.nhistory);
    let mut history = IterateHistory::new(prob.n, settings.nhistory + 1);

    if settings.verbose {
        println!("      [gpmo] it ... R2");
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
            // nothing selectable left; K overshot the grid
            iterations = k;
            history.truncate_to_written();
            break;
        }
        commit(
            a_t,
            &mut x,
            &mut r,
            &mut mask,
            &mut r2_plus,
            &mut r2_minus,
            c / 3,
            c % 3,
            sign,
        );

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
