// src/connectivity.rs

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::vec3::{norm2, sub};

/// Cap on neighbor-table row length for large grids.
pub const MAX_NEIGHBORS: usize = 2000;

/// Per-dipole neighbor indices sorted by Euclidean distance ascending.
/// Row j always starts with j itself; distance ties are broken by index
/// ascending.
#[derive(Debug, Clone)]
pub struct NeighborTable {
    pub n: usize,
    pub width: usize,
    inds: Vec<usize>,
}

impl NeighborTable {
    #[inline]
    pub fn row(&self, j: usize) -> &[usize] {
        &self.inds[j * self.width..(j + 1) * self.width]
    }
}

/// Build the neighbor table for a set of dipole centers. Parallel over
/// dipoles; each row sorts the full distance list once at build time.
pub fn build_neighbor_table(xyz: &[[f64; 3]]) -> NeighborTable {
    let n = xyz.len();
    let width = n.min(MAX_NEIGHBORS);
    let mut inds = vec![0usize; n * width];

    inds.par_chunks_mut(width).enumerate().for_each(|(j, row)| {
        let center = xyz[j];
        let mut order: Vec<(f64, usize)> = (0..n)
            .filter(|&i| i != j)
            .map(|i| (norm2(sub(xyz[i], center)), i))
            .collect();
        order.sort_unstable_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        row[0] = j;
        for (slot, &(_, i)) in row[1..].iter_mut().zip(order.iter()) {
            *slot = i;
        }
    });

    NeighborTable { n, width, inds }
}
