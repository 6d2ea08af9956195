// src/mwpgp.rs
//
// Modified weighted projected gradient (MwPGP) solver for the convex part
// of the permanent magnet problem:
//
//     min  1/2 |A x - b|^2 + 1/(2 nu) |x - w|^2 + reg_l2 |x|^2
//     s.t. |x_i| <= m_maxima[i]  for every dipole i
//
// Active/free splitting follows Bouchala et al., AMC 247 (2014): conjugate
// gradient steps while the free face dominates and the unconstrained step
// is safe, expansion or projected gradient steps otherwise.

use rayon::prelude::*;
use serde::Serialize;

use crate::dense::{self, DenseMatrix};
use crate::error::{check_len, Error};
use crate::history::{IterateHistory, SampleSchedule};
use crate::moment_field::MomentField;
use crate::objective;
use crate::projection::{find_max_alpha, phi, project_l2, reduced_projected_gradient};
use crate::vec3::{add_scaled, dot, norm2};

/// 20 interior samples plus the final iterate.
pub const HISTORY_SLOTS: usize = 21;

const CHUNK: usize = 2048;
const CURVATURE_FLOOR: f64 = 1e-20;

#[derive(Debug, Clone, Serialize)]
pub struct MwpgpSettings {
    /// Fixed step scale for expansion and projected gradient steps.
    /// Callers typically set this from the operator norm (~2 / |A^T A|).
    pub alpha: f64,
    /// Relax-and-split coupling; large values decouple the proxy.
    pub nu: f64,
    /// Terminate when sum_i,d |x - x_prev| drops below this.
    pub epsilon: f64,
    pub reg_l0: f64,
    pub reg_l1: f64,
    pub reg_l2: f64,
    pub max_iter: usize,
    /// Terminate once a sampled R2 falls below this.
    pub min_fb: f64,
    pub verbose: bool,
}

impl Default for MwpgpSettings {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            nu: 1e100,
            epsilon: 1e-4,
            reg_l0: 0.0,
            reg_l1: 0.0,
            reg_l2: 0.0,
            max_iter: 100,
            min_fb: 1e-20,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MwpgpOutput {
    pub objective_history: Vec<f64>,
    pub r2_history: Vec<f64>,
    pub m_history: Vec<Vec<[f64; 3]>>,
    pub x: MomentField,
    /// Iterations actually run.
    pub iterations: usize,
    /// True when the iterate-change test fired before max_iter.
    pub converged: bool,
}

/// One projected gradient step x <- P(x - alpha g). Also the fallback when
/// the conjugate direction has lost curvature (p.Qp ~ 0).
fn projected_gradient_step(x: &mut MomentField, g: &MomentField, m_maxima: &[f64], alpha: f64) {
    x.data.par_iter_mut().enumerate().for_each(|(i, xi)| {
        *xi = project_l2(add_scaled(*xi, -alpha, g.data[i]), m_maxima[i]);
    });
}

/// p <- phi(x, g): restart the conjugate direction on the free set.
fn restart_direction(p: &mut MomentField, x: &MomentField, g: &MomentField, m_maxima: &[f64]) {
    p.data.par_iter_mut().enumerate().for_each(|(i, pi)| {
        *pi = phi(x.data[i], g.data[i], m_maxima[i]);
    });
}

pub fn mwpgp(
    a: &DenseMatrix,
    b: &[f64],
    atb: &MomentField,
    m_proxy: &MomentField,
    m0: &MomentField,
    m_maxima: &[f64],
    settings: &MwpgpSettings,
) -> Result<MwpgpOutput, Error> {
    let n = m_maxima.len();
    check_len("A columns", 3 * n, a.ncols)?;
    check_len("b", a.nrows, b.len())?;
    check_len("ATb", n, atb.n())?;
    check_len("m_proxy", n, m_proxy.n())?;
    check_len("m0", n, m0.n())?;

    let shift = settings.reg_l2 + 1.0 / (2.0 * settings.nu);

    // Right-hand side with the relax-and-split contribution folded in.
    let mut atb_rs = MomentField::zeros(n);
    for (t, (ai, wi)) in atb_rs
        .data
        .iter_mut()
        .zip(atb.data.iter().zip(m_proxy.data.iter()))
    {
        *t = add_scaled(*ai, 1.0 / settings.nu, *wi);
    }

    let mut x = m0.clone();
    let mut x_prev = x.clone();
    let mut g = MomentField::zeros(n);
    let mut p = MomentField::zeros(n);
    let mut qp = MomentField::zeros(n);
    let mut grid_scratch = vec![0.0; a.nrows];

    objective::gradient(
        a,
        x.as_flat(),
        atb_rs.as_flat(),
        shift,
        &mut grid_scratch,
        g.as_flat_mut(),
    );
    restart_direction(&mut p, &x, &g, m_maxima);

    let schedule = SampleSchedule::new(settings.max_iter, HISTORY_SLOTS - 1);
    let mut history = IterateHistory::new(n, HISTORY_SLOTS);

    if settings.verbose {
        println!("      [mwpgp] it ... R2 ... prox ... l2 ... l1 ... l0 ... total");
    }

    let n_chunks = n.div_ceil(CHUNK);
    let mut stats_buf = vec![(0.0f64, 0.0f64, 0.0f64, 0.0f64, f64::INFINITY); n_chunks];

    let mut converged = false;
    let mut iterations = settings.max_iter;

    for k in 0..settings.max_iter {
        x_prev.data.copy_from_slice(&x.data);

        dense::normal_matvec(
            a,
            p.as_flat(),
            shift,
            &mut grid_scratch,
            qp.as_flat_mut(),
        );

        // Fused statistics pass: |reduced projected gradient|^2, |phi|^2,
        // g.p, p.Qp, and the per-dipole feasible-step minimum, aggregated
        // per chunk in a fixed order.
        stats_buf
            .par_iter_mut()
            .zip(
                x.data
                    .par_chunks(CHUNK)
                    .zip(g.data.par_chunks(CHUNK))
                    .zip(p.data.par_chunks(CHUNK))
                    .zip(qp.data.par_chunks(CHUNK))
                    .zip(m_maxima.par_chunks(CHUNK)),
            )
            .for_each(|(slot, ((((xc, gc), pc), qpc), mc))| {
                let mut eta2 = 0.0;
                let mut phi2 = 0.0;
                let mut gp = 0.0;
                let mut pqp = 0.0;
                let mut alpha_min = f64::INFINITY;
                for idx in 0..xc.len() {
                    let rg = reduced_projected_gradient(xc[idx], gc[idx], settings.alpha, mc[idx]);
                    eta2 += norm2(rg);
                    phi2 += norm2(phi(xc[idx], gc[idx], mc[idx]));
                    gp += dot(gc[idx], pc[idx]);
                    pqp += dot(pc[idx], qpc[idx]);
                    let af = find_max_alpha(xc[idx], pc[idx], mc[idx]);
                    if af < alpha_min {
                        alpha_min = af;
                    }
                }
                *slot = (eta2, phi2, gp, pqp, alpha_min);
            });

        let mut eta2 = 0.0;
        let mut phi2 = 0.0;
        let mut gp = 0.0;
        let mut pqp = 0.0;
        let mut alpha_f = f64::INFINITY;
        for &(e, ph, gpc, pq, am) in &stats_buf {
            eta2 += e;
            phi2 += ph;
            gp += gpc;
            pqp += pq;
            if am < alpha_f {
                alpha_f = am;
            }
        }

        let curvature_ok = pqp.abs() > CURVATURE_FLOOR;
        let alpha_cg = if curvature_ok { gp / pqp } else { f64::INFINITY };

        if eta2 <= phi2 && curvature_ok && alpha_cg < alpha_f {
            // Conjugate gradient step on the free face; the gradient
            // updates incrementally through Qp.
            x.data
                .par_iter_mut()
                .zip(p.data.par_iter())
                .for_each(|(xi, pi)| *xi = add_scaled(*xi, -alpha_cg, *pi));
            g.data
                .par_iter_mut()
                .zip(qp.data.par_iter())
                .for_each(|(gi, qpi)| *gi = add_scaled(*gi, -alpha_cg, *qpi));

            let gamma_num: f64 = x
                .data
                .par_chunks(CHUNK)
                .zip(g.data.par_chunks(CHUNK))
                .zip(qp.data.par_chunks(CHUNK))
                .zip(m_maxima.par_chunks(CHUNK))
                .map(|(((xc, gc), qpc), mc)| {
                    let mut acc = 0.0;
                    for idx in 0..xc.len() {
                        acc += dot(phi(xc[idx], gc[idx], mc[idx]), qpc[idx]);
                    }
                    acc
                })
                .sum();
            let gamma = gamma_num / pqp;

            p.data.par_iter_mut().enumerate().for_each(|(i, pi)| {
                let ph = phi(x.data[i], g.data[i], m_maxima[i]);
                *pi = add_scaled(ph, -gamma, *pi);
            });
        } else if eta2 <= phi2 && curvature_ok {
            // Mixed expansion step: ride p to the boundary, then take the
            // gradient step there and project.
            x.data.par_iter_mut().enumerate().for_each(|(i, xi)| {
                let on_face = add_scaled(*xi, -alpha_f, p.data[i]);
                let slope = add_scaled(g.data[i], -alpha_f, qp.data[i]);
                *xi = project_l2(
                    add_scaled(on_face, -settings.alpha, slope),
                    m_maxima[i],
                );
            });
            objective::gradient(
                a,
                x.as_flat(),
                atb_rs.as_flat(),
                shift,
                &mut grid_scratch,
                g.as_flat_mut(),
            );
            restart_direction(&mut p, &x, &g, m_maxima);
        } else {
            projected_gradient_step(&mut x, &g, m_maxima, settings.alpha);
            objective::gradient(
                a,
                x.as_flat(),
                atb_rs.as_flat(),
                shift,
                &mut grid_scratch,
                g.as_flat_mut(),
            );
            restart_direction(&mut p, &x, &g, m_maxima);
        }

        if schedule.is_sample(k) {
            let terms = objective::objective_terms(
                a,
                b,
                &x,
                m_proxy,
                settings.nu,
                settings.reg_l0,
                settings.reg_l1,
                settings.reg_l2,
                &mut grid_scratch,
            );
            if history.record(terms.total, terms.r2, &x).is_some() {
                if settings.verbose {
                    println!(
                        "      [mwpgp] it={}  R2={:.3e}  prox={:.3e}  l2={:.3e}  l1={:.3e}  l0={:.3e}  total={:.3e}",
                        k, terms.r2, terms.proxy_dist, terms.l2, terms.l1, terms.l0, terms.total
                    );
                }
                if terms.r2 < settings.min_fb {
                    iterations = k + 1;
                    break;
                }
            }
        }

        let x_sum: f64 = x
            .data
            .par_chunks(CHUNK)
            .zip(x_prev.data.par_chunks(CHUNK))
            .map(|(xc, pc)| {
                let mut acc = 0.0;
                for (xi, pi) in xc.iter().zip(pc.iter()) {
                    acc += (xi[0] - pi[0]).abs() + (xi[1] - pi[1]).abs() + (xi[2] - pi[2]).abs();
                }
                acc
            })
            .sum();
        if x_sum < settings.epsilon {
            if settings.verbose {
                println!("      [mwpgp] iterate change below epsilon at it={}", k);
            }
            converged = true;
            iterations = k + 1;
            break;
        }
    }

    let (objective_history, r2_history, m_history) = history.into_parts();
    Ok(MwpgpOutput {
        objective_history,
        r2_history,
        m_history,
        x,
        iterations,
        converged,
    })
}
