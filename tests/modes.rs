#![allow(non_snake_case)]

use std::f64::consts::PI;

use approx::assert_relative_eq;

use fedyn::{
    prelude::*,
    results::ResultHistory,
    solver::{inverse_iteration, DirectSolver, Simulation},
    system::{Assembly, EquationSystem, LinearAssembly},
    IntegrationParameters, ModeRequest,
};

/// Fixed-free chain of unit masses and unit springs
fn spring_chain(n: usize) -> (SparseMatrix, SparseMatrix) {
    let mut K = MatrixD::zeros(n, n);
    for i in 0..n {
        K[(i, i)] = if i + 1 == n { 1. } else { 2. };
        if i + 1 < n {
            K[(i, i + 1)] = -1.;
            K[(i + 1, i)] = -1.;
        }
    }
    (sparse_from_dense(&K), sparse_diagonal(&vec![1.; n]))
}

/// Free-free chain of unit masses and unit springs, one rigid body mode
fn free_chain(n: usize) -> MatrixD {
    let mut K = MatrixD::zeros(n, n);
    for i in 0..n - 1 {
        K[(i, i)] += 1.;
        K[(i + 1, i + 1)] += 1.;
        K[(i, i + 1)] -= 1.;
        K[(i + 1, i)] -= 1.;
    }
    K
}

/// Unit mass on a hardening spring, tangent `1 + 3 k3 x^2`
struct Duffing {
    k3: f64,
}

impl Assembly for Duffing {
    fn num_dofs(&self) -> usize {
        1
    }
    fn assemble(&self, _t: f64, x: &VectorD, _v: &VectorD) -> EquationSystem {
        let x = x[0];
        EquationSystem {
            mass: sparse_diagonal(&[1.]),
            damping: sparse_diagonal(&[0.]),
            stiffness: sparse_diagonal(&[1. + 3. * self.k3 * x * x]),
            internal_force: VectorD::from_element(1, x + self.k3 * x.powi(3)),
            external_force: VectorD::zeros(1),
        }
    }
}

#[test]
fn test_spring_chain_modes() {
    let n = 3;
    let (K, M) = spring_chain(n);
    let mut solver = DirectSolver::default();
    let modes = inverse_iteration(&K, &M, &ModeRequest::new(n, 0.), &mut solver).unwrap();
    assert_eq!(modes.len(), n);

    // lambda_j = 4 sin^2((2j - 1) pi / (2 (2n + 1)))
    for (j, mode) in modes.iter().enumerate() {
        let exact = 4. * ((2 * j + 1) as f64 * PI / (2. * (2 * n + 1) as f64)).sin().powi(2);
        assert_relative_eq!(mode.eigenvalue, exact, epsilon = 1e-6);
        assert!(mode.residual < 1e-5);
        assert_relative_eq!(mode.angular_frequency(), exact.sqrt(), epsilon = 1e-6);
    }

    // Mode shapes are M-orthonormal
    let Phi = MatrixD::from_columns(&modes.iter().map(|m| m.eigenvector.clone()).collect_vec());
    let M_dense = MatrixD::identity(n, n);
    assert_relative_eq!(Phi.transpose() * M_dense * &Phi, MatrixD::identity(n, n), epsilon = 1e-6);

    // Lowest mode moves all masses in phase, growing toward the free end
    let phi = &modes[0].eigenvector;
    assert!(phi.iter().all(|&p| p > 0.));
    assert!(phi.iter().tuple_windows().all(|(a, b)| b > a));
}

#[test]
fn test_free_chain_closest_mode() {
    // Eigenvalues 0, 1, 3; shift 2.1 is closest to 3, then 1, then 0
    let K = sparse_from_dense(&free_chain(3));
    let M = sparse_diagonal(&[1., 1., 1.]);
    let mut solver = DirectSolver::default();

    let modes = inverse_iteration(&K, &M, &ModeRequest::new(1, 2.1), &mut solver).unwrap();
    assert_eq!(modes.len(), 1);
    assert_relative_eq!(modes[0].eigenvalue, 3., epsilon = 1e-8);

    // Alternating mode 1, -2, 1 scaled to unit norm, largest component positive
    let phi = &modes[0].eigenvector;
    let expected = VectorD::from_vec(vec![-1., 2., -1.]) / 6f64.sqrt();
    assert_relative_eq!(*phi, expected, epsilon = 1e-6);

    let modes = inverse_iteration(&K, &M, &ModeRequest::new(3, 2.1), &mut solver).unwrap();
    let eigenvalues = modes.iter().map(|m| m.eigenvalue).collect_vec();
    assert_relative_eq!(eigenvalues[0], 3., epsilon = 1e-8);
    assert_relative_eq!(eigenvalues[1], 1., epsilon = 1e-8);
    assert_relative_eq!(eigenvalues[2], 0., epsilon = 1e-8);
}

#[test]
fn test_interior_modes_match_dense_solution() {
    let n = 20;
    let shift = 1.3;
    let K_dense = free_chain(n);
    let K = sparse_from_dense(&K_dense);
    let M = sparse_diagonal(&vec![1.; n]);
    let mut solver = DirectSolver::default();

    let modes = inverse_iteration(&K, &M, &ModeRequest::new(3, shift), &mut solver).unwrap();

    let mut exact = nalgebra::SymmetricEigen::new(K_dense).eigenvalues.iter().copied().collect_vec();
    exact.sort_by(|a, b| (a - shift).abs().total_cmp(&(b - shift).abs()));
    assert_eq!(modes.len(), 3);
    for (mode, lambda) in modes.iter().zip(&exact) {
        assert_relative_eq!(mode.eigenvalue, *lambda, epsilon = 1e-7);
        assert!(mode.residual < 1e-6);
    }
}

#[test]
fn test_modes_of_linear_model() {
    let M = sparse_diagonal(&[2., 1.]);
    let K = sparse_from_dense(&MatrixD::from_row_slice(2, 2, &[6., -2., -2., 4.]));
    let model = LinearAssembly::new(M.clone(), K).unwrap();
    let params = IntegrationParameters::average_acceleration().with_fixed_step(0.1);
    let mut sim = Simulation::new(params, model, &VectorD::zeros(2), &VectorD::zeros(2)).unwrap();

    // det(K - lambda M) = 2 lambda^2 - 14 lambda + 20 = 2 (lambda - 2) (lambda - 5)
    let modes = sim.extract_modes(&ModeRequest::new(2, 0.)).unwrap();
    assert_relative_eq!(modes[0].eigenvalue, 2., epsilon = 1e-7);
    assert_relative_eq!(modes[1].eigenvalue, 5., epsilon = 1e-7);
    for mode in &modes {
        assert_relative_eq!(mode.eigenvector.weighted_norm(&M), 1., epsilon = 1e-10);
    }

    // Invalid requests are rejected before any iteration
    assert!(sim.extract_modes(&ModeRequest::new(0, 0.)).is_err());
}

#[test]
fn test_modes_follow_tangent_stiffness() {
    let k3 = 2.;
    let params = IntegrationParameters::average_acceleration()
        .with_time_span(0., 1.)
        .with_fixed_step(0.1)
        .with_mode_request(ModeRequest::new(1, 0.).every(1));
    let mut sim = Simulation::new(
        params,
        Duffing { k3 },
        &VectorD::from_element(1, 1.),
        &VectorD::zeros(1),
    )
    .unwrap();

    // On demand at the initial state
    let modes = sim.extract_modes(&ModeRequest::new(1, 0.)).unwrap();
    assert_relative_eq!(modes[0].eigenvalue, 1. + 3. * k3, epsilon = 1e-8);

    let mut history = ResultHistory::new();
    let summary = sim.run(&mut history).unwrap();
    assert_eq!(summary.mode_failures, 0);
    assert_eq!(history.modes().count(), 10);

    for snapshot in history.snapshots().iter().skip(1) {
        assert_eq!(snapshot.modes.len(), 1);
        let set = &snapshot.modes[0];
        assert!(set.converged);
        assert_relative_eq!(set.time, snapshot.time());
        let x = snapshot.state.x[0];
        assert_relative_eq!(set.eigenvalues()[0], 1. + 3. * k3 * x * x, epsilon = 1e-8);
    }
}

#[test]
fn test_failed_modes_do_not_stop_run() {
    // A single iteration cannot confirm convergence
    let model = LinearAssembly::new(sparse_diagonal(&[1., 1.]), sparse_diagonal(&[1., 1.1])).unwrap();
    let params = IntegrationParameters::average_acceleration()
        .with_time_span(0., 0.5)
        .with_fixed_step(0.1)
        .with_mode_request(ModeRequest::new(1, 0.).every(1).with_convergence(1, 1e-8));
    let mut sim = Simulation::new(
        params,
        model,
        &VectorD::from_vec(vec![1., 0.5]),
        &VectorD::zeros(2),
    )
    .unwrap();
    let mut history = ResultHistory::new();
    let summary = sim.run(&mut history).unwrap();

    assert_eq!(summary.accepted_steps, 5);
    assert_eq!(summary.mode_failures, 5);
    assert_relative_eq!(summary.final_time, 0.5);
    for set in history.modes() {
        assert!(!set.converged);
        assert!(set.pairs.is_empty());
    }
}
