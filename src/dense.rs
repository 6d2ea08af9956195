// src/dense.rs
//
// Dense row-major kernels shared by the solvers. The forward operator is
// held in two layouts: (ngrid, 3N) for the continuous solvers, where A*x
// and A^T*(A*x) sweep contiguous rows, and (3N, ngrid) for the greedy
// solvers, where each dipole-axis column is one contiguous row.

use rayon::prelude::*;

use crate::error::{check_len, Error};

/// Dense row-major matrix.
#[derive(Debug, Clone)]
pub struct DenseMatrix {
    pub nrows: usize,
    pub ncols: usize,
    pub data: Vec<f64>,
}

impl DenseMatrix {
    /// Wrap a row-major buffer, checking its length against the shape.
    pub fn new(nrows: usize, ncols: usize, data: Vec<f64>) -> Result<Self, Error> {
        check_len("matrix data", nrows * ncols, data.len())?;
        Ok(Self { nrows, ncols, data })
    }

    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            data: vec![0.0; nrows * ncols],
        }
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.ncols..(i + 1) * self.ncols]
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// y = A x, parallel over rows.
pub fn matvec(a: &DenseMatrix, x: &[f64], y: &mut [f64]) {
    debug_assert_eq!(x.len(), a.ncols);
    debug_assert_eq!(y.len(), a.nrows);
    y.par_iter_mut()
        .zip(a.data.par_chunks(a.ncols))
        .for_each(|(yi, row)| *yi = dot(row, x));
}

/// z = A^T y, parallel over output entries (strided column reads).
pub fn matvec_t(a: &DenseMatrix, y: &[f64], z: &mut [f64]) {
    debug_assert_eq!(y.len(), a.nrows);
    debug_assert_eq!(z.len(), a.ncols);
    let ncols = a.ncols;
    z.par_iter_mut().enumerate().for_each(|(j, zj)| {
        let mut acc = 0.0;
        for (i, yi) in y.iter().enumerate() {
            acc += a.data[i * ncols + j] * yi;
        }
        *zj = acc;
    });
}

/// out = A^T (A x) + 2 * shift * x.
///
/// This is the quadratic-form operator Q x with Q = A^T A + 2 shift I and
/// shift = reg_l2 + 1/(2 nu). `scratch` must have length `a.nrows`.
pub fn normal_matvec(a: &DenseMatrix, x: &[f64], shift: f64, scratch: &mut [f64], out: &mut [f64]) {
    matvec(a, x, scratch);
    matvec_t(a, scratch, out);
    out.par_iter_mut()
        .zip(x.par_iter())
        .for_each(|(oj, &xj)| *oj += 2.0 * shift * xj);
}

/// r = A x - b.
pub fn residual(a: &DenseMatrix, x: &[f64], b: &[f64], r: &mut [f64]) {
    matvec(a, x, r);
    r.par_iter_mut()
        .zip(b.par_iter())
        .for_each(|(ri, &bi)| *ri -= bi);
}

/// y += alpha * x. Used for the incremental GPMO residual update
/// r <- r +- A_{:,c}, where the column is a contiguous row of the
/// transposed layout.
pub fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    debug_assert_eq!(x.len(), y.len());
    y.par_iter_mut()
        .zip(x.par_iter())
        .for_each(|(yi, &xi)| *yi += alpha * xi);
}
