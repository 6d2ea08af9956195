// src/projection.rs
//
// Per-dipole projection primitives for the bound-constrained solvers.
// Every dipole moment lives in its own L2 ball of radius m_max; the
// active-set logic below splits the gradient into its free part (phi) and
// its chopped boundary part (beta_tilde).

use crate::vec3::{add_scaled, dot, norm2};

/// Sentinel returned by [`find_max_alpha`] when the search direction is too
/// small for the boundary quadratic to be solvable.
pub const ALPHA_UNBOUNDED: f64 = 1e100;

const DIRECTION_FLOOR: f64 = 1e-20;

#[inline]
fn surface_tol(m_max: f64) -> f64 {
    1.0e-8 + 1.0e-5 * m_max * m_max
}

/// Project a moment onto the L2 ball of radius `m_max`. The origin maps to
/// itself.
#[inline]
pub fn project_l2(x: [f64; 3], m_max: f64) -> [f64; 3] {
    let denom = (norm2(x).sqrt() / m_max).max(1.0);
    [x[0] / denom, x[1] / denom, x[2] / denom]
}

/// Free-set gradient: g when x is strictly inside the ball, zero when x sits
/// on the surface (within tolerance).
#[inline]
pub fn phi(x: [f64; 3], g: [f64; 3], m_max: f64) -> [f64; 3] {
    let mmax2 = m_max * m_max;
    if (norm2(x) - mmax2).abs() > surface_tol(m_max) {
        g
    } else {
        [0.0, 0.0, 0.0]
    }
}

/// Active-set gradient: zero inside the ball; on the surface, g when it
/// points outward (x . g > 0), otherwise the reduced gradient.
#[inline]
pub fn beta_tilde(x: [f64; 3], g: [f64; 3], alpha: f64, m_max: f64) -> [f64; 3] {
    let mmax2 = m_max * m_max;
    let dist = norm2(x);
    if (dist - mmax2).abs() < surface_tol(m_max) {
        if dot(x, g) > 0.0 {
            g
        } else {
            g_reduced(x, g, alpha, m_max)
        }
    } else {
        [0.0, 0.0, 0.0]
    }
}

/// Reduced gradient: the gradient step in the ball-projected direction,
/// (x - P(x - alpha g)) / alpha.
#[inline]
pub fn g_reduced(x: [f64; 3], g: [f64; 3], alpha: f64, m_max: f64) -> [f64; 3] {
    let proj = project_l2(add_scaled(x, -alpha, g), m_max);
    [
        (x[0] - proj[0]) / alpha,
        (x[1] - proj[1]) / alpha,
        (x[2] - proj[2]) / alpha,
    ]
}

/// phi + beta_tilde, componentwise.
#[inline]
pub fn reduced_projected_gradient(
    x: [f64; 3],
    g: [f64; 3],
    alpha: f64,
    m_max: f64,
) -> [f64; 3] {
    let p = phi(x, g, m_max);
    let b = beta_tilde(x, g, alpha, m_max);
    [p[0] + b[0], p[1] + b[1], p[2] + b[2]]
}

/// Largest step alpha >= 0 such that x - alpha p stays inside the ball of
/// radius `m_max`. With ||x|| <= m_max the boundary quadratic
/// a alpha^2 - 2 (x.p) alpha + (||x||^2 - m_max^2) has one nonnegative
/// root. Directions with ||p||^2 below the floor return
/// [`ALPHA_UNBOUNDED`].
pub fn find_max_alpha(x: [f64; 3], p: [f64; 3], m_max: f64) -> f64 {
    let a = norm2(p);
    if a > DIRECTION_FLOOR {
        let b = -2.0 * dot(x, p);
        let c = norm2(x) - m_max * m_max;
        let disc = (b * b - 4.0 * a * c).max(0.0);
        (-b + disc.sqrt()) / (2.0 * a)
    } else {
        ALPHA_UNBOUNDED
    }
}
