// src/objective.rs
//
// Shared objective evaluation for the continuous solvers. The sparsity
// terms (l1, l0) are constant during an inner solve and only show up in
// the verbose breakdown; the gradient covers the smooth part only.

use rayon::prelude::*;

use crate::dense::{self, DenseMatrix};
use crate::moment_field::MomentField;
use crate::vec3::norm2;

const L0_TOL: f64 = 1e-20;

/// Loss breakdown at one iterate. `total` is the smooth cost the solvers
/// actually descend: r2 + proxy_dist + l2.
#[derive(Debug, Clone, Copy)]
pub struct ObjectiveTerms {
    pub r2: f64,
    pub proxy_dist: f64,
    pub l2: f64,
    pub l1: f64,
    pub l0: f64,
    pub total: f64,
}

/// Evaluate every loss term at `x`. `scratch` must have length `a.nrows`.
pub fn objective_terms(
    a: &DenseMatrix,
    b: &[f64],
    x: &MomentField,
    m_proxy: &MomentField,
    nu: f64,
    reg_l0: f64,
    reg_l1: f64,
    reg_l2: f64,
    scratch: &mut [f64],
) -> ObjectiveTerms {
    dense::matvec(a, x.as_flat(), scratch);
    let r2: f64 = scratch
        .par_iter()
        .zip(b.par_iter())
        .map(|(&yi, &bi)| (yi - bi) * (yi - bi))
        .sum::<f64>()
        * 0.5;

    let (n2, l2_sum, l1_sum, l0_count) = x
        .data
        .par_iter()
        .zip(m_proxy.data.par_iter())
        .map(|(xi, wi)| {
            let mut n2 = 0.0;
            let mut l1 = 0.0;
            let mut l0 = 0.0;
            for d in 0..3 {
                let dv = xi[d] - wi[d];
                n2 += dv * dv;
                l1 += xi[d].abs();
                if wi[d].abs() < L0_TOL {
                    l0 += 1.0;
                }
            }
            (n2, norm2(*xi), l1, l0)
        })
        .reduce(
            || (0.0, 0.0, 0.0, 0.0),
            |acc, part| {
                (
                    acc.0 + part.0,
                    acc.1 + part.1,
                    acc.2 + part.2,
                    acc.3 + part.3,
                )
            },
        );

    let proxy_dist = 0.5 * n2 / nu;
    let l2 = reg_l2 * l2_sum;
    let l1 = reg_l1 * l1_sum;
    let l0 = reg_l0 * l0_count;

    ObjectiveTerms {
        r2,
        proxy_dist,
        l2,
        l1,
        l0,
        total: r2 + proxy_dist + l2,
    }
}

/// The smooth cost alone, for line searches.
pub fn smooth_objective(
    a: &DenseMatrix,
    b: &[f64],
    x: &MomentField,
    m_proxy: &MomentField,
    nu: f64,
    reg_l2: f64,
    scratch: &mut [f64],
) -> f64 {
    objective_terms(a, b, x, m_proxy, nu, 0.0, 0.0, reg_l2, scratch).total
}

/// g = Q x - atb_rs, with Q = A^T A + 2 (reg_l2 + 1/(2 nu)) I applied
/// through [`dense::normal_matvec`] and atb_rs = A^T b + w / nu.
pub fn gradient(
    a: &DenseMatrix,
    x_flat: &[f64],
    atb_rs_flat: &[f64],
    shift: f64,
    scratch: &mut [f64],
    out: &mut [f64],
) {
    dense::normal_matvec(a, x_flat, shift, scratch, out);
    out.par_iter_mut()
        .zip(atb_rs_flat.par_iter())
        .for_each(|(gj, &tj)| *gj -= tj);
}
