// src/pqn.rs
//
// Projected quasi-Newton outer loop with a spectral projected gradient
// (SPG) inner solver. For the quadratic permanent-magnet objective this
// reproduces MwPGP's answer; it exists for relax-and-split formulations
// whose smooth part is not a quadratic program, where SPG minimizes the
// projected quadratic model and PQN drives the true objective.

use std::collections::VecDeque;

use rayon::prelude::*;
use serde::Serialize;

use crate::dense::DenseMatrix;
use crate::error::{check_len, Error};
use crate::history::{IterateHistory, SampleSchedule};
use crate::moment_field::MomentField;
use crate::mwpgp::HISTORY_SLOTS;
use crate::objective;
use crate::projection::project_l2;
use crate::vec3::{add_scaled, dot, norm, sub};

const CHUNK: usize = 2048;
const NU_PQN: f64 = 1e-4;
const NU_SPG: f64 = 1e-4;
const SPG_ALPHA_MIN: f64 = 1e-10;
const SPG_ALPHA_MAX: f64 = 1e10;
const SPG_WINDOW: usize = 100;
const MAX_BACKTRACKS: usize = 30;

#[derive(Debug, Clone, Serialize)]
pub struct PqnSettings {
    /// Relax-and-split coupling; large values decouple the proxy.
    pub nu: f64,
    /// Outer convergence threshold on the projected-gradient displacement.
    pub epsilon: f64,
    pub reg_l0: f64,
    pub reg_l1: f64,
    pub reg_l2: f64,
    pub max_iter: usize,
    pub verbose: bool,
}

impl Default for PqnSettings {
    fn default() -> Self {
        Self {
            nu: 1e100,
            epsilon: 1e-4,
            reg_l0: 0.0,
            reg_l1: 0.0,
            reg_l2: 0.0,
            max_iter: 100,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PqnOutput {
    pub objective_history: Vec<f64>,
    pub r2_history: Vec<f64>,
    pub m_history: Vec<Vec<[f64; 3]>>,
    pub x: MomentField,
    pub iterations: usize,
    pub converged: bool,
}

fn field_dot(a: &MomentField, b: &MomentField) -> f64 {
    a.data
        .par_chunks(CHUNK)
        .zip(b.data.par_chunks(CHUNK))
        .map(|(ac, bc)| {
            let mut acc = 0.0;
            for (ai, bi) in ac.iter().zip(bc.iter()) {
                acc += dot(*ai, *bi);
            }
            acc
        })
        .sum()
}

/// out = base + s * dir, per dipole.
fn field_add_scaled(out: &mut MomentField, base: &MomentField, s: f64, dir: &MomentField) {
    out.data.par_iter_mut().enumerate().for_each(|(i, oi)| {
        *oi = add_scaled(base.data[i], s, dir.data[i]);
    });
}

/// Backtracking step update: minimizer of the quadratic through f(0),
/// f'(0) and f(alpha), safeguarded into [0.1 alpha, 0.5 alpha].
fn interp_step(alpha: f64, f0: f64, f_alpha: f64, slope: f64) -> f64 {
    let denom = f_alpha - f0 - slope * alpha;
    let trial = if denom > 0.0 {
        -0.5 * slope * alpha * alpha / denom
    } else {
        0.5 * alpha
    };
    trial.clamp(0.1 * alpha, 0.5 * alpha)
}

/// Spectral projected gradient on the projected quadratic subproblem.
/// Barzilai-Borwein steps with a non-monotone (windowed-max) line search.
/// Returns the final iterate and the BB scaling carried to the next call.
#[allow(clippy::too_many_arguments)]
fn spg(
    a: &DenseMatrix,
    b: &[f64],
    atb_rs: &MomentField,
    m_proxy: &MomentField,
    x0: &MomentField,
    m_maxima: &[f64],
    alpha_bb_prev: f64,
    epsilon: f64,
    reg_l2: f64,
    nu: f64,
    shift: f64,
    max_iter: usize,
    grid_scratch: &mut [f64],
) -> (MomentField, f64) {
    let n = x0.n();
    let mut xk = x0.clone();
    let mut xk1 = MomentField::zeros(n);
    let mut grad = MomentField::zeros(n);
    let mut grad_next = MomentField::zeros(n);
    let mut dk = MomentField::zeros(n);
    let mut alpha_bb = alpha_bb_prev;
    let mut f_window: VecDeque<f64> = VecDeque::with_capacity(SPG_WINDOW);

    objective::gradient(
        a,
        xk.as_flat(),
        atb_rs.as_flat(),
        shift,
        grid_scratch,
        grad.as_flat_mut(),
    );

    for _ in 0..max_iter {
        let alpha_bar = alpha_bb.clamp(SPG_ALPHA_MIN, SPG_ALPHA_MAX);

        // projected direction, elementwise over the whole field
        dk.data.par_iter_mut().enumerate().for_each(|(i, di)| {
            let trial = project_l2(
                add_scaled(xk.data[i], -alpha_bar, grad.data[i]),
                m_maxima[i],
            );
            *di = sub(trial, xk.data[i]);
        });
        let step_mass: f64 = dk
            .data
            .par_chunks(CHUNK)
            .map(|c| c.iter().map(|d| norm(*d)).sum::<f64>())
            .sum();
        if step_mass < epsilon {
            break;
        }

        let qk = objective::smooth_objective(a, b, &xk, m_proxy, nu, reg_l2, grid_scratch);
        f_window.push_back(qk);
        while f_window.len() > SPG_WINDOW {
            f_window.pop_front();
        }
        let fb = f_window.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let slope = field_dot(&grad, &dk);
        let mut alpha = 1.0;
        field_add_scaled(&mut xk1, &xk, alpha, &dk);
        let mut q_trial = objective::smooth_objective(a, b, &xk1, m_proxy, nu, reg_l2, grid_scratch);
        let mut backtracks = 0;
        while q_trial > fb + NU_SPG * alpha * slope && backtracks < MAX_BACKTRACKS {
            alpha = interp_step(alpha, qk, q_trial, slope);
            field_add_scaled(&mut xk1, &xk, alpha, &dk);
            q_trial = objective::smooth_objective(a, b, &xk1, m_proxy, nu, reg_l2, grid_scratch);
            backtracks += 1;
        }

        objective::gradient(
            a,
            xk1.as_flat(),
            atb_rs.as_flat(),
            shift,
            grid_scratch,
            grad_next.as_flat_mut(),
        );

        // BB scaling from s = alpha d, y = grad(x_{k+1}) - grad(x_k);
        // non-positive curvature pushes the next trial step to alpha_max
        let (sty, yty) = dk
            .data
            .par_chunks(CHUNK)
            .zip(grad.data.par_chunks(CHUNK))
            .zip(grad_next.data.par_chunks(CHUNK))
            .map(|((dc, gc), gnc)| {
                let mut sty = 0.0;
                let mut yty = 0.0;
                for i in 0..dc.len() {
                    let y = sub(gnc[i], gc[i]);
                    let s = [alpha * dc[i][0], alpha * dc[i][1], alpha * dc[i][2]];
                    sty += dot(s, y);
                    yty += dot(y, y);
                }
                (sty, yty)
            })
            .reduce(|| (0.0, 0.0), |acc, part| (acc.0 + part.0, acc.1 + part.1));
        alpha_bb = if sty > 0.0 { yty / sty } else { SPG_ALPHA_MAX };

        std::mem::swap(&mut xk, &mut xk1);
        std::mem::swap(&mut grad, &mut grad_next);
    }

    (xk, alpha_bb)
}

pub fn pqn(
    a: &DenseMatrix,
    b: &[f64],
    atb: &MomentField,
    m_proxy: &MomentField,
    m0: &MomentField,
    m_maxima: &[f64],
    settings: &PqnSettings,
) -> Result<PqnOutput, Error> {
    let n = m_maxima.len();
    check_len("A columns", 3 * n, a.ncols)?;
    check_len("b", a.nrows, b.len())?;
    check_len("ATb", n, atb.n())?;
    check_len("m_proxy", n, m_proxy.n())?;
    check_len("m0", n, m0.n())?;

    let shift = settings.reg_l2 + 1.0 / (2.0 * settings.nu);

    let mut atb_rs = MomentField::zeros(n);
    for (t, (ai, wi)) in atb_rs
        .data
        .iter_mut()
        .zip(atb.data.iter().zip(m_proxy.data.iter()))
    {
        *t = add_scaled(*ai, 1.0 / settings.nu, *wi);
    }

    let mut x = m0.clone();
    let mut x_trial = MomentField::zeros(n);
    let mut g = MomentField::zeros(n);
    let mut d = MomentField::zeros(n);
    let mut grid_scratch = vec![0.0; a.nrows];

    let spg_max_iter = settings.max_iter * 10;
    let mut alpha_bb = 0.1;

    let schedule = SampleSchedule::new(settings.max_iter, HISTORY_SLOTS - 1);
    let mut history = IterateHistory::new(n, HISTORY_SLOTS);

    if settings.verbose {
        println!("      [pqn] it ... R2 ... prox ... l2 ... l1 ... l0 ... total");
    }

    let mut converged = false;
    let mut iterations = settings.max_iter;

    for k in 0..settings.max_iter {
        let fk = objective::smooth_objective(
            a,
            b,
            &x,
            m_proxy,
            settings.nu,
            settings.reg_l2,
            &mut grid_scratch,
        );
        objective::gradient(
            a,
            x.as_flat(),
            atb_rs.as_flat(),
            shift,
            &mut grid_scratch,
            g.as_flat_mut(),
        );

        if k == 0 {
            let gnorm2 = field_dot(&g, &g);
            let scale = if gnorm2 > 0.0 { -1.0 / gnorm2 } else { 0.0 };
            d.data.par_iter_mut().enumerate().for_each(|(i, di)| {
                *di = [
                    scale * g.data[i][0],
                    scale * g.data[i][1],
                    scale * g.data[i][2],
                ];
            });
        } else {
            let (xstar, bb) = spg(
                a,
                b,
                &atb_rs,
                m_proxy,
                &x,
                m_maxima,
                alpha_bb,
                settings.epsilon,
                settings.reg_l2,
                settings.nu,
                shift,
                spg_max_iter,
                &mut grid_scratch,
            );
            alpha_bb = bb;
            d.data.par_iter_mut().enumerate().for_each(|(i, di)| {
                *di = sub(xstar.data[i], x.data[i]);
            });
        }

        // projected-gradient displacement test
        let displacement: f64 = x
            .data
            .par_chunks(CHUNK)
            .zip(g.data.par_chunks(CHUNK))
            .zip(m_maxima.par_chunks(CHUNK))
            .map(|((xc, gc), mc)| {
                let mut acc = 0.0;
                for i in 0..xc.len() {
                    let proj = project_l2(sub(xc[i], gc[i]), mc[i]);
                    acc += norm(sub(proj, xc[i]));
                }
                acc
            })
            .sum();
        if displacement < settings.epsilon {
            converged = true;
            iterations = k;
            break;
        }

        let slope = field_dot(&g, &d);
        let mut alpha = 1.0;
        field_add_scaled(&mut x_trial, &x, alpha, &d);
        let mut f_trial = objective::smooth_objective(
            a,
            b,
            &x_trial,
            m_proxy,
            settings.nu,
            settings.reg_l2,
            &mut grid_scratch,
        );
        let mut backtracks = 0;
        while f_trial > fk + NU_PQN * alpha * slope && backtracks < MAX_BACKTRACKS {
            alpha = interp_step(alpha, fk, f_trial, slope);
            field_add_scaled(&mut x_trial, &x, alpha, &d);
            f_trial = objective::smooth_objective(
                a,
                b,
                &x_trial,
                m_proxy,
                settings.nu,
                settings.reg_l2,
                &mut grid_scratch,
            );
            backtracks += 1;
        }
        std::mem::swap(&mut x, &mut x_trial);

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
            if history.record(terms.total, terms.r2, &x).is_some() && settings.verbose {
                println!(
                    "      [pqn] it={}  R2={:.3e}  prox={:.3e}  l2={:.3e}  l1={:.3e}  l0={:.3e}  total={:.3e}",
                    k, terms.r2, terms.proxy_dist, terms.l2, terms.l1, terms.l0, terms.total
                );
            }
        }
    }

    let (objective_history, r2_history, m_history) = history.into_parts();
    Ok(PqnOutput {
        objective_history,
        r2_history,
        m_history,
        x,
        iterations,
        converged,
    })
}
