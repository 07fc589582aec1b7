//! Damped Gauss-Newton over the active factors of a [`Graph`], plus the
//! Schur complement used to marginalize parameter blocks.
//!
//! Damping follows Fletcher: the diagonal of the normal equations is scaled by
//! `1 + λ` instead of adding `λ·I`, so the step stays invariant to the scale of
//! each parameter. A step that lowers the cost is accepted and `λ` shrinks;
//! otherwise the previous values are restored and `λ` grows.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::estimation::graph::Graph;
use crate::estimation::EstimationError;

/// Eigenvalues of the marginalized block below this are treated as zero.
const SCHUR_EIGEN_EPS: f64 = 1e-12;

/// How marginalized factors are treated once their state leaves the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MargStrategy {
    /// Discard the factors together with their information.
    Drop,
    /// Schur-eliminate the marginalized blocks from the factors' normal
    /// equations before discarding them.
    #[default]
    Sibley,
}

impl MargStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            MargStrategy::Drop => "drop",
            MargStrategy::Sibley => "sibley",
        }
    }
}

impl FromStr for MargStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(MargStrategy::Drop),
            "sibley" => Ok(MargStrategy::Sibley),
            other => Err(format!("unknown marginalization strategy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub max_iter: usize,
    /// Initial damping.
    pub lambda: f64,
    pub cost_change_threshold: f64,
    /// Wall-clock budget in seconds.
    pub time_limit: f64,
    /// Multiplier applied to `λ` on rejection, divisor on acceptance.
    pub update_factor: f64,
    /// Lower bound of the diagonal entries used for damping.
    pub min_diagonal: f64,
    /// How many times a failed factorization is retried with a larger `λ`.
    pub max_damping_retries: usize,
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iter: 10,
            lambda: 1e-4,
            cost_change_threshold: 1e-1,
            time_limit: 0.01,
            update_factor: 10.0,
            min_diagonal: 1e-6,
            max_damping_retries: 10,
            verbose: false,
        }
    }
}

impl SolverOptions {
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    pub fn with_cost_change_threshold(mut self, threshold: f64) -> Self {
        self.cost_change_threshold = threshold;
        self
    }

    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = seconds;
        self
    }

    pub fn with_update_factor(mut self, factor: f64) -> Self {
        self.update_factor = factor;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    CostConverged,
    TimeLimit,
    MaxIterations,
    /// Every block touched by an active factor is fixed.
    NoFreeParameters,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Termination::CostConverged => "cost change below threshold",
            Termination::TimeLimit => "time limit reached",
            Termination::MaxIterations => "maximum iterations reached",
            Termination::NoFreeParameters => "no free parameters",
        };
        write!(f, "{reason}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Cost after the iteration (the previous cost when rejected).
    pub cost: f64,
    /// Damping used for the step.
    pub lambda: f64,
    pub step_norm: f64,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: Vec<IterationRecord>,
    pub termination: Termination,
    pub final_lambda: f64,
    pub elapsed: Duration,
}

impl SolveSummary {
    pub fn num_accepted(&self) -> usize {
        self.iterations.iter().filter(|it| it.accepted).count()
    }
}

impl fmt::Display for SolveSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Gauss-Newton Solve Summary ===")?;
        writeln!(f, "Initial cost:     {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:       {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Iterations:       {} ({} accepted)",
            self.iterations.len(),
            self.num_accepted()
        )?;
        writeln!(f, "Final lambda:     {:.3e}", self.final_lambda)?;
        writeln!(f, "Elapsed:          {:?}", self.elapsed)?;
        writeln!(f, "Termination:      {}", self.termination)?;
        for it in &self.iterations {
            writeln!(
                f,
                "  iter {:>3}  cost {:.6e}  lambda {:.3e}  |dx| {:.3e}  {}",
                it.iteration,
                it.cost,
                it.lambda,
                it.step_norm,
                if it.accepted { "accepted" } else { "rejected" }
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Solver {
    options: SolverOptions,
}

impl Solver {
    pub fn new(options: SolverOptions) -> Self {
        Solver { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Optimizes the free blocks touched by the graph's active factors.
    pub fn solve(&self, graph: &mut Graph) -> Result<SolveSummary, EstimationError> {
        let start = Instant::now();
        let opts = &self.options;
        let factor_ids = graph.active_factor_ids();
        let layout = graph.layout(&factor_ids)?;

        let initial_cost = graph.cost(&factor_ids)?;
        let mut cost = initial_cost;
        let mut lambda = opts.lambda;
        let mut iterations = Vec::new();
        let mut termination = Termination::MaxIterations;

        if layout.is_empty() {
            termination = Termination::NoFreeParameters;
        }

        for iteration in 0..opts.max_iter {
            if layout.is_empty() {
                break;
            }
            let state = graph.snapshot(&layout)?;
            let (h, g, _) = graph.linearize(&factor_ids, &layout)?;
            let (dx, used_lambda) = self.solve_damped(&h, &g, lambda)?;
            lambda = used_lambda;

            graph.update(&layout, &dx)?;
            let new_cost = graph.cost(&factor_ids)?;
            let cost_delta = new_cost - cost;

            let accepted = new_cost < cost;
            if accepted {
                cost = new_cost;
                lambda /= opts.update_factor;
            } else {
                graph.restore(&state)?;
                lambda *= opts.update_factor;
            }

            debug!(
                "iter {iteration}: cost {cost:.6e} delta {cost_delta:.3e} lambda {used_lambda:.3e} {}",
                if accepted { "accepted" } else { "rejected" }
            );
            iterations.push(IterationRecord {
                iteration,
                cost,
                lambda: used_lambda,
                step_norm: dx.norm(),
                accepted,
            });

            if cost_delta.abs() < opts.cost_change_threshold {
                termination = Termination::CostConverged;
                break;
            }
            if start.elapsed().as_secs_f64() > opts.time_limit {
                termination = Termination::TimeLimit;
                break;
            }
        }

        // Leave every active factor evaluated at the final values.
        let final_cost = graph.cost(&factor_ids)?;
        let summary = SolveSummary {
            initial_cost,
            final_cost,
            iterations,
            termination,
            final_lambda: lambda,
            elapsed: start.elapsed(),
        };
        if opts.verbose {
            info!("{summary}");
        }
        Ok(summary)
    }

    /// Solves `(H + λ·diag(H))·dx = g`, growing `λ` while the damped system is
    /// not positive definite or the step is not finite.
    fn solve_damped(
        &self,
        h: &DMatrix<f64>,
        g: &DVector<f64>,
        lambda: f64,
    ) -> Result<(DVector<f64>, f64), EstimationError> {
        let opts = &self.options;
        let mut lambda = lambda;
        for _ in 0..=opts.max_damping_retries {
            let mut damped = h.clone();
            for i in 0..h.nrows() {
                damped[(i, i)] += lambda * h[(i, i)].max(opts.min_diagonal);
            }
            if let Some(cholesky) = damped.cholesky() {
                let dx = cholesky.solve(g);
                if dx.iter().all(|v| v.is_finite()) {
                    return Ok((dx, lambda));
                }
            }
            warn!("damped system is not positive definite at lambda {lambda:e}, retrying");
            lambda *= opts.update_factor;
        }
        Err(EstimationError::SolveDivergence { lambda })
    }
}

/// Eliminates the first `m` variables of `H·x = g`.
///
/// Returns `(H_rr − H_rm·H_mm⁺·H_mr, g_r − H_rm·H_mm⁺·g_m)` where `H_mm⁺` is the
/// eigen-decomposition pseudo-inverse of the symmetrized marginal block.
pub fn schurs_complement(
    h: &DMatrix<f64>,
    g: &DVector<f64>,
    m: usize,
) -> Result<(DMatrix<f64>, DVector<f64>), EstimationError> {
    let n = h.nrows();
    if h.ncols() != n || g.len() != n {
        return Err(EstimationError::DimensionMismatch {
            what: "schur complement system".to_string(),
            expected: n,
            actual: g.len(),
        });
    }
    if m > n {
        return Err(EstimationError::DimensionMismatch {
            what: "schur complement marginal size".to_string(),
            expected: n,
            actual: m,
        });
    }
    if m == 0 {
        return Ok((h.clone(), g.clone()));
    }
    let r = n - m;

    let hmm = h.view((0, 0), (m, m));
    let hmm = (hmm.transpose() + hmm) * 0.5;
    let eigen = SymmetricEigen::new(hmm);
    let inv_values = eigen
        .eigenvalues
        .map(|v| if v > SCHUR_EIGEN_EPS { 1.0 / v } else { 0.0 });
    let hmm_inv =
        &eigen.eigenvectors * DMatrix::from_diagonal(&inv_values) * eigen.eigenvectors.transpose();

    let hmr = h.view((0, m), (m, r));
    let hrm = h.view((m, 0), (r, m));
    let hrr = h.view((m, m), (r, r));
    let gm = g.rows(0, m);
    let gr = g.rows(m, r);

    let hrm_hmm_inv = hrm * hmm_inv;
    let h_marg = hrr - &hrm_hmm_inv * hmr;
    let g_marg = gr - &hrm_hmm_inv * gm;
    Ok((h_marg, g_marg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraGeometry, ProjectionKind, ProjectionModel, Resolution};
    use crate::estimation::Id;
    use crate::geometry::{pose_identity, pose_vector};
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector2, Vector3};

    fn camera_geometry() -> CameraGeometry {
        CameraGeometry::new(
            0,
            Resolution {
                width: 640,
                height: 640,
            },
            ProjectionKind::PinholeRadtan4,
        )
    }

    fn camera_params() -> DVector<f64> {
        DVector::from_vec(vec![500.0, 500.0, 320.0, 320.0, 0.0, 0.0, 0.0, 0.0])
    }

    /// One landmark seen by two fixed cameras at `I` and `translate(1, 0, 0)`.
    fn two_camera_scene(initial: Vector3<f64>) -> (Graph, Id) {
        let truth = Vector3::new(0.0, 0.0, 5.0);
        let mut graph = Graph::new();
        let camera_id = graph
            .add_camera(camera_geometry(), camera_params(), true)
            .unwrap();
        let landmark_id = graph.add_landmark(initial, false).unwrap();
        for (ts, x) in [(0u64, 0.0), (1, 1.0)] {
            let translation = Vector3::new(x, 0.0, 0.0);
            let pose = pose_vector(&UnitQuaternion::identity(), &translation);
            let pose_id = graph.add_pose(ts, pose, true).unwrap();
            let z = camera_geometry()
                .project(&camera_params(), &(truth - translation))
                .unwrap()
                .pixel;
            graph
                .add_ba_factor(ts, pose_id, landmark_id, camera_id, z, &DMatrix::identity(2, 2))
                .unwrap();
        }
        (graph, landmark_id)
    }

    #[test]
    fn test_two_camera_landmark_converges() {
        let (mut graph, landmark_id) = two_camera_scene(Vector3::new(0.3, -0.2, 4.5));
        let solver = Solver::new(
            SolverOptions::default()
                .with_max_iter(30)
                .with_cost_change_threshold(1e-20)
                .with_time_limit(5.0),
        );
        let summary = solver.solve(&mut graph).unwrap();

        let landmark = graph.param(landmark_id).unwrap().value();
        assert_relative_eq!(landmark[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(landmark[1], 0.0, epsilon = 1e-6);
        assert_relative_eq!(landmark[2], 5.0, epsilon = 1e-6);
        assert!(summary.final_cost < 1e-10);
        assert!(summary.initial_cost > summary.final_cost);
    }

    #[test]
    fn test_accepted_costs_are_monotonic() {
        let (mut graph, _) = two_camera_scene(Vector3::new(1.0, 0.5, 3.0));
        let solver = Solver::new(
            SolverOptions::default()
                .with_max_iter(15)
                .with_lambda(1.0)
                .with_cost_change_threshold(0.0)
                .with_time_limit(5.0),
        );
        let summary = solver.solve(&mut graph).unwrap();

        let mut previous = summary.initial_cost;
        for it in &summary.iterations {
            if it.accepted {
                assert!(it.cost <= previous);
            } else {
                assert_eq!(it.cost, previous);
            }
            previous = it.cost;
        }
        assert_eq!(previous, summary.final_cost);
        assert!(summary.num_accepted() > 0);
    }

    #[test]
    fn test_all_fixed_is_a_no_op() {
        let mut graph = Graph::new();
        let pose_id = graph.add_pose(0, pose_identity(), true).unwrap();
        let camera_id = graph
            .add_camera(camera_geometry(), camera_params(), true)
            .unwrap();
        let landmark_id = graph.add_landmark(Vector3::new(0.0, 0.0, 5.0), true).unwrap();
        graph
            .add_ba_factor(
                0,
                pose_id,
                landmark_id,
                camera_id,
                Vector2::new(321.0, 320.0),
                &DMatrix::identity(2, 2),
            )
            .unwrap();

        let summary = Solver::default().solve(&mut graph).unwrap();
        assert_eq!(summary.termination, Termination::NoFreeParameters);
        assert!(summary.iterations.is_empty());
        assert_relative_eq!(summary.final_cost, 0.5, epsilon = 1e-12);
        assert!(summary.to_string().contains("no free parameters"));
    }

    #[test]
    fn test_missing_param_aborts_solve() {
        let (mut graph, landmark_id) = two_camera_scene(Vector3::new(0.3, -0.2, 4.5));
        graph.rm_param(landmark_id).unwrap();
        let result = Solver::default().solve(&mut graph);
        assert!(matches!(result, Err(EstimationError::ParamNotFound(id)) if id == landmark_id));
        assert_eq!(graph.num_factors(), 2);
    }

    #[test]
    fn test_divergence_is_reported() {
        let solver = Solver::default();
        let h = DMatrix::<f64>::identity(3, 3) * -1e3;
        let g = DVector::from_element(3, 1.0);
        assert!(matches!(
            solver.solve_damped(&h, &g, 1e-4),
            Err(EstimationError::SolveDivergence { .. })
        ));

        // A rank-deficient system is regularized by the damping floor.
        let mut h = DMatrix::<f64>::identity(3, 3);
        h[(2, 2)] = 0.0;
        let (dx, lambda) = solver.solve_damped(&h, &g, 1e-4).unwrap();
        assert!(dx.iter().all(|v| v.is_finite()));
        assert_eq!(lambda, 1e-4);
    }

    fn spd_system() -> (DMatrix<f64>, DVector<f64>) {
        let a = DMatrix::from_fn(5, 5, |i, j| ((i * 5 + j) as f64 * 0.37).sin());
        let h = &a * a.transpose() + DMatrix::identity(5, 5);
        let g = DVector::from_vec(vec![1.0, -2.0, 0.5, 3.0, -1.0]);
        (h, g)
    }

    #[test]
    fn test_schur_complement_matches_full_solve() {
        let (h, g) = spd_system();
        let (h_marg, g_marg) = schurs_complement(&h, &g, 2).unwrap();
        assert_eq!(h_marg.shape(), (3, 3));

        let full = h.clone().cholesky().unwrap().solve(&g);
        let reduced = h_marg.clone().cholesky().unwrap().solve(&g_marg);
        assert_relative_eq!(reduced, full.rows(2, 3).into_owned(), epsilon = 1e-9);

        // The reduced information is the inverse of the marginal covariance.
        let covariance = h.clone().try_inverse().unwrap();
        let marginal_cov = covariance.view((2, 2), (3, 3)).into_owned();
        assert_relative_eq!(
            h_marg.try_inverse().unwrap(),
            marginal_cov,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_schur_complement_edge_cases() {
        let (h, g) = spd_system();
        let (h_all, g_all) = schurs_complement(&h, &g, 0).unwrap();
        assert_relative_eq!(h_all, h.clone());
        assert_relative_eq!(g_all, g.clone());

        let mut decoupled = h.clone();
        for i in 0..2 {
            for j in 0..5 {
                decoupled[(i, j)] = 0.0;
                decoupled[(j, i)] = 0.0;
            }
        }
        let (h_marg, _) = schurs_complement(&decoupled, &g, 2).unwrap();
        assert_relative_eq!(h_marg, decoupled.view((2, 2), (3, 3)).into_owned());

        assert!(schurs_complement(&h, &g, 6).is_err());
    }

    #[test]
    fn test_marg_strategy_names() {
        assert_eq!("drop".parse::<MargStrategy>(), Ok(MargStrategy::Drop));
        assert_eq!("sibley".parse::<MargStrategy>(), Ok(MargStrategy::Sibley));
        assert!("fej".parse::<MargStrategy>().is_err());
        assert_eq!(MargStrategy::default().name(), "sibley");
    }
}
