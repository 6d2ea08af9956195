// tests/solvers.rs
//
// Integration-level solver checks: tiny problems with known answers plus
// seeded random problems for the structural invariants (feasibility,
// monotonicity, binarity, residual consistency).
// Run with: cargo test --test solvers

use pm_opt::dense::{self, DenseMatrix};
use pm_opt::gpmo::{
    gpmo_backtracking, gpmo_baseline, gpmo_coherence, gpmo_multi, GpmoSettings,
};
use pm_opt::moment_field::MomentField;
use pm_opt::mwpgp::{mwpgp, MwpgpSettings};
use pm_opt::pqn::{pqn, PqnSettings};
use pm_opt::vec3::norm;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}

fn identity3() -> DenseMatrix {
    DenseMatrix::new(3, 3, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]).unwrap()
}

/// Random (ngrid x 3N) operator with entries in (-1, 1).
fn random_operator(rng: &mut StdRng, nrows: usize, ncols: usize) -> DenseMatrix {
    let data: Vec<f64> = (0..nrows * ncols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    DenseMatrix::new(nrows, ncols, data).unwrap()
}

fn atb_field(a: &DenseMatrix, b: &[f64]) -> MomentField {
    let mut flat = vec![0.0; a.ncols];
    dense::matvec_t(a, b, &mut flat);
    MomentField::from_rows(flat.chunks(3).map(|c| [c[0], c[1], c[2]]).collect())
}

// ---------------------------------------------------------------------------
// MwPGP
// ---------------------------------------------------------------------------

#[test]
fn mwpgp_recovers_interior_solution() {
    let a = identity3();
    let b = [0.5, 0.0, 0.0];
    let settings = MwpgpSettings {
        alpha: 1.0,
        nu: 1e9,
        epsilon: 1e-12,
        max_iter: 50,
        min_fb: 0.0,
        ..MwpgpSettings::default()
    };
    let out = mwpgp(
        &a,
        &b,
        &atb_field(&a, &b),
        &MomentField::zeros(1),
        &MomentField::zeros(1),
        &[1.0],
        &settings,
    )
    .unwrap();

    assert!(out.converged, "interior problem should converge");
    assert!(out.iterations <= 3);
    let err = norm([out.x.data[0][0] - 0.5, out.x.data[0][1], out.x.data[0][2]]);
    assert!(err < 1e-8, "solution error {} too large", err);
}

#[test]
fn mwpgp_clips_to_ball_boundary() {
    let a = identity3();
    let b = [2.0, 0.0, 0.0];
    let settings = MwpgpSettings {
        alpha: 1.0,
        nu: 1e9,
        epsilon: 1e-12,
        max_iter: 50,
        min_fb: 0.0,
        ..MwpgpSettings::default()
    };
    let out = mwpgp(
        &a,
        &b,
        &atb_field(&a, &b),
        &MomentField::zeros(1),
        &MomentField::zeros(1),
        &[1.0],
        &settings,
    )
    .unwrap();

    assert!(out.converged);
    let err = norm([out.x.data[0][0] - 1.0, out.x.data[0][1], out.x.data[0][2]]);
    assert!(err < 1e-9, "boundary solution error {} too large", err);
}

#[test]
fn mwpgp_stays_feasible_and_monotone_on_random_problem() {
    let mut rng = StdRng::seed_from_u64(7);
    let (n, ngrid) = (6, 24);
    let a = random_operator(&mut rng, ngrid, 3 * n);
    let b: Vec<f64> = (0..ngrid).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let m_maxima: Vec<f64> = (0..n).map(|i| 0.5 + 0.1 * i as f64).collect();

    // safe fixed step: 1 / ||Q|| bounded through the Frobenius norm
    let frob2: f64 = a.data.iter().map(|v| v * v).sum();
    let settings = MwpgpSettings {
        alpha: 1.0 / (frob2 + 1.0),
        nu: 1e6,
        epsilon: 0.0,
        max_iter: 20,
        min_fb: 0.0,
        ..MwpgpSettings::default()
    };
    let out = mwpgp(
        &a,
        &b,
        &atb_field(&a, &b),
        &MomentField::zeros(n),
        &MomentField::zeros(n),
        &m_maxima,
        &settings,
    )
    .unwrap();

    // max_iter = 20 with a unit stride: exactly 20 written samples
    assert_eq!(out.iterations, 20);
    for pair in out.objective_history[..20].windows(2) {
        assert!(
            pair[1] <= pair[0] * (1.0 + 1e-9) + 1e-12,
            "objective increased: {} -> {}",
            pair[0],
            pair[1]
        );
    }
    // every sampled iterate keeps each dipole inside its ball
    for snapshot in &out.m_history[..20] {
        for (mi, &cap) in snapshot.iter().zip(m_maxima.iter()) {
            assert!(norm(*mi) <= cap * (1.0 + 1e-6));
        }
    }
}

#[test]
fn mwpgp_terminates_when_sampled_r2_beats_min_fb() {
    let a = identity3();
    let b = [0.5, 0.0, 0.0];
    let settings = MwpgpSettings {
        alpha: 1.0,
        nu: 1e9,
        epsilon: 0.0,
        max_iter: 50,
        min_fb: 1.0,
        ..MwpgpSettings::default()
    };
    let out = mwpgp(
        &a,
        &b,
        &atb_field(&a, &b),
        &MomentField::zeros(1),
        &MomentField::zeros(1),
        &[1.0],
        &settings,
    )
    .unwrap();
    assert_eq!(out.iterations, 1);
}

#[test]
fn mwpgp_rejects_mismatched_shapes() {
    let a = identity3();
    let b = [0.5, 0.0]; // wrong length
    let err = mwpgp(
        &a,
        &b,
        &MomentField::zeros(1),
        &MomentField::zeros(1),
        &MomentField::zeros(1),
        &[1.0],
        &MwpgpSettings::default(),
    );
    assert!(err.is_err());
}

// ---------------------------------------------------------------------------
// GPMO
// ---------------------------------------------------------------------------

#[test]
fn gpmo_baseline_places_single_dipole() {
    // one dipole whose x-axis column matches b exactly
    let a_t = DenseMatrix::new(3, 1, vec![1.0, 0.0, 0.0]).unwrap();
    let settings = GpmoSettings {
        k_max: 1,
        nhistory: 1,
        ..GpmoSettings::default()
    };
    let out = gpmo_baseline(&a_t, &[1.0], &settings).unwrap();
    assert_eq!(out.x.data[0], [1.0, 0.0, 0.0]);
    assert!(approx_eq(out.objective_history[0], 0.0, 1e-14));
    assert_eq!(out.iterations, 1);
}

#[test]
fn gpmo_baseline_flips_sign_for_negated_target() {
    let a_t = DenseMatrix::new(3, 1, vec![1.0, 0.0, 0.0]).unwrap();
    let settings = GpmoSettings {
        k_max: 1,
        nhistory: 1,
        ..GpmoSettings::default()
    };
    let out = gpmo_baseline(&a_t, &[-1.0], &settings).unwrap();
    assert_eq!(out.x.data[0], [-1.0, 0.0, 0.0]);
    assert!(approx_eq(out.objective_history[0], 0.0, 1e-14));
}

#[test]
fn gpmo_baseline_keeps_binarity_and_residual_consistency() {
    let mut rng = StdRng::seed_from_u64(11);
    let (n, ngrid) = (5, 12);
    let a_t = random_operator(&mut rng, 3 * n, ngrid);
    let b: Vec<f64> = (0..ngrid).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let settings = GpmoSettings {
        k_max: 5,
        nhistory: 5,
        ..GpmoSettings::default()
    };
    let out = gpmo_baseline(&a_t, &b, &settings).unwrap();
    assert_eq!(out.iterations, 5);

    // each sampled iterate has at most one +-1 entry per dipole
    for snapshot in &out.m_history[..5] {
        for row in snapshot {
            let nonzero: Vec<f64> = row.iter().copied().filter(|v| *v != 0.0).collect();
            assert!(nonzero.len() <= 1, "row {:?} not axis-aligned", row);
            if let Some(v) = nonzero.first() {
                assert!(v.abs() == 1.0, "row {:?} not binary", row);
            }
        }
    }

    // the incrementally maintained residual matches a fresh A m_k - b at
    // every sampled iterate, not just the final one
    let b_norm: f64 = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    let mut am = vec![0.0; ngrid];
    for (p, snapshot) in out.m_history[..5].iter().enumerate() {
        dense::matvec_t(&a_t, snapshot.as_flattened(), &mut am);
        let r2: f64 =
            0.5 * am.iter().zip(b.iter()).map(|(y, t)| (y - t) * (y - t)).sum::<f64>();
        assert!(
            approx_eq(out.objective_history[p], r2, 1e-8 * b_norm.max(1.0)),
            "running residual drifted at sample {}: recorded {} vs recomputed {}",
            p,
            out.objective_history[p],
            r2
        );
    }
}

#[test]
fn gpmo_baseline_stops_when_grid_is_exhausted() {
    let mut rng = StdRng::seed_from_u64(13);
    let (n, ngrid) = (3, 8);
    let a_t = random_operator(&mut rng, 3 * n, ngrid);
    let b: Vec<f64> = (0..ngrid).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let settings = GpmoSettings {
        k_max: 10, // more iterations than dipoles
        nhistory: 5,
        ..GpmoSettings::default()
    };
    let out = gpmo_baseline(&a_t, &b, &settings).unwrap();
    assert_eq!(out.iterations, n);
    assert!(out.objective_history.len() <= 6);
    let placed: usize = out
        .x
        .data
        .iter()
        .map(|row| row.iter().filter(|v| **v != 0.0).count())
        .sum();
    assert_eq!(placed, n);
}

#[test]
fn gpmo_coherence_decreases_objective_on_orthogonal_columns() {
    // orthogonal scaled columns: the sign choice strictly improves R2
    let mut data = vec![0.0; 6 * 6];
    for c in 0..6 {
        data[c * 6 + c] = 0.5;
    }
    let a_t = DenseMatrix::new(6, 6, data).unwrap();
    let b = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let atb: Vec<f64> = (0..6).map(|c| 0.5 * b[c]).collect();
    let settings = GpmoSettings {
        k_max: 2,
        nhistory: 2,
        ..GpmoSettings::default()
    };
    let out = gpmo_coherence(&a_t, &b, &atb, &settings).unwrap();

    assert!(out.objective_history[1] < out.objective_history[0]);
    // strongest coherence first: column 5 (dipole 1, axis 2), then the
    // best remaining column of dipole 0
    assert_eq!(out.x.data[1], [0.0, 0.0, 1.0]);
    assert_eq!(out.x.data[0], [0.0, 0.0, 1.0]);
}

#[test]
fn gpmo_multi_places_neighbor_blocks() {
    // four dipoles on a line, each with a distinct unit column on axis 0
    let n = 4;
    let ngrid = 4;
    let mut data = vec![0.0; 3 * n * ngrid];
    for i in 0..n {
        data[(3 * i) * ngrid + i] = 1.0;
    }
    let a_t = DenseMatrix::new(3 * n, ngrid, data).unwrap();
    let b = [1.0; 4];
    let xyz = vec![
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [2.0, 0.0, 0.0],
        [3.0, 0.0, 0.0],
    ];
    let settings = GpmoSettings {
        k_max: 2,
        nhistory: 2,
        single_direction: Some(0),
        ..GpmoSettings::default()
    };
    let out = gpmo_multi(&a_t, &b, &xyz, 2, &settings).unwrap();

    assert_eq!(out.iterations, 2);
    for row in &out.x.data {
        assert_eq!(*row, [1.0, 0.0, 0.0]);
    }
    assert!(approx_eq(out.objective_history[1], 0.0, 1e-14));
}

#[test]
fn gpmo_backtracking_removes_cancelling_pair() {
    // two neighboring dipoles with identical axis-0 columns; the greedy
    // pass places them with opposite signs and the wyrm pass erases both
    let n = 2;
    let ngrid = 2;
    let mut data = vec![0.0; 3 * n * ngrid];
    data[0] = 1.0; // dipole 0, axis 0
    data[3 * ngrid] = 1.0; // dipole 1, axis 0
    let a_t = DenseMatrix::new(3 * n, ngrid, data).unwrap();
    let b = [0.5, 0.0];
    let xyz = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
    let settings = GpmoSettings {
        k_max: 2,
        nhistory: 2,
        single_direction: Some(0),
        ..GpmoSettings::default()
    };
    let out = gpmo_backtracking(&a_t, &b, &xyz, 2, 1, &settings).unwrap();

    assert_eq!(out.iterations, 2);
    for row in &out.x.data {
        assert_eq!(*row, [0.0, 0.0, 0.0]);
    }
    // residual returned to -b, so the final sampled R2 is |b|^2 / 2
    assert!(approx_eq(out.objective_history[1], 0.125, 1e-12));
}

// ---------------------------------------------------------------------------
// PQN
// ---------------------------------------------------------------------------

#[test]
fn pqn_recovers_interior_solution() {
    let a = identity3();
    let b = [0.5, 0.0, 0.0];
    let settings = PqnSettings {
        nu: 1e9,
        epsilon: 1e-8,
        max_iter: 50,
        ..PqnSettings::default()
    };
    let out = pqn(
        &a,
        &b,
        &atb_field(&a, &b),
        &MomentField::zeros(1),
        &MomentField::zeros(1),
        &[1.0],
        &settings,
    )
    .unwrap();

    assert!(out.converged);
    let err = norm([out.x.data[0][0] - 0.5, out.x.data[0][1], out.x.data[0][2]]);
    assert!(err < 1e-6, "solution error {} too large", err);
}

#[test]
fn pqn_clips_to_ball_boundary() {
    let a = identity3();
    let b = [2.0, 0.0, 0.0];
    let settings = PqnSettings {
        nu: 1e9,
        epsilon: 1e-8,
        max_iter: 50,
        ..PqnSettings::default()
    };
    let out = pqn(
        &a,
        &b,
        &atb_field(&a, &b),
        &MomentField::zeros(1),
        &MomentField::zeros(1),
        &[1.0],
        &settings,
    )
    .unwrap();

    assert!(out.converged);
    let err = norm([out.x.data[0][0] - 1.0, out.x.data[0][1], out.x.data[0][2]]);
    assert!(err < 1e-6, "boundary solution error {} too large", err);
}

#[test]
fn pqn_and_mwpgp_agree_on_random_convex_problem() {
    let mut rng = StdRng::seed_from_u64(23);
    let (n, ngrid) = (4, 16);
    let a = random_operator(&mut rng, ngrid, 3 * n);
    let b: Vec<f64> = (0..ngrid).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let m_maxima = vec![1.0; n];
    let atb = atb_field(&a, &b);
    let proxy = MomentField::zeros(n);
    let m0 = MomentField::zeros(n);

    let frob2: f64 = a.data.iter().map(|v| v * v).sum();
    let mw = mwpgp(
        &a,
        &b,
        &atb,
        &proxy,
        &m0,
        &m_maxima,
        &MwpgpSettings {
            alpha: 1.0 / (frob2 + 1.0),
            nu: 1e6,
            epsilon: 1e-12,
            max_iter: 5000,
            min_fb: 0.0,
            ..MwpgpSettings::default()
        },
    )
    .unwrap();
    let pq = pqn(
        &a,
        &b,
        &atb,
        &proxy,
        &m0,
        &m_maxima,
        &PqnSettings {
            nu: 1e6,
            epsilon: 1e-8,
            max_iter: 200,
            ..PqnSettings::default()
        },
    )
    .unwrap();

    // both minimize the same strictly convex objective; compare the value
    // they reach rather than the iterates themselves
    let cost = |x: &MomentField| {
        let mut am = vec![0.0; ngrid];
        dense::matvec(&a, x.as_flat(), &mut am);
        let r2: f64 = am.iter().zip(b.iter()).map(|(y, t)| (y - t) * (y - t)).sum();
        let n2: f64 = x.as_flat().iter().map(|v| v * v).sum();
        0.5 * r2 + 0.5 * n2 / 1e6
    };
    let (f_mw, f_pq) = (cost(&mw.x), cost(&pq.x));
    assert!(
        approx_eq(f_mw, f_pq, 1e-6 * f_mw.abs().max(1.0)),
        "solvers reach different objective values: {} vs {}",
        f_mw,
        f_pq
    );
    // both iterates respect the ball constraints
    for out in [&mw.x, &pq.x] {
        for row in &out.data {
            assert!(norm(*row) <= 1.0 + 1e-6);
        }
    }
}
