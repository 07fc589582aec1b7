//! Intrinsics bootstrap from 2D-3D correspondences.
//!
//! Before a camera can enter the sliding window it needs a reasonable
//! parameter vector `[fx, fy, cx, cy, d0, d1, d2, d3]`. [`IntrinsicsRefinement`]
//! gets one from camera-frame 3D points and their observed pixels: a linear
//! solve for the projection part, then a Levenberg-Marquardt refinement of all
//! eight parameters with `tiny_solver`'s automatic differentiation.

use std::collections::HashMap;

use log::info;
use nalgebra::{DMatrix, DVector, Matrix2xX, Matrix3xX, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use crate::camera::{
    validation, CameraGeometry, CameraModelError, ProjectionKind, ProjectionModel,
    CAMERA_PARAMS_SIZE,
};

/// Reprojection error statistics in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

fn radtan4<T: RealField>(d: &[T], x: T, y: T) -> (T, T) {
    let two = nalgebra::convert::<f64, T>(2.0);
    let x2 = x.clone() * x.clone();
    let y2 = y.clone() * y.clone();
    let xy = x.clone() * y.clone();
    let r2 = x2.clone() + y2.clone();
    let radial = T::one() + d[0].clone() * r2.clone() + d[1].clone() * r2.clone() * r2.clone();

    let xd = x * radial.clone()
        + two.clone() * d[2].clone() * xy.clone()
        + d[3].clone() * (r2.clone() + two.clone() * x2);
    let yd = y * radial + d[2].clone() * (r2 + two.clone() * y2) + two * d[3].clone() * xy;
    (xd, yd)
}

fn equi4<T: RealField>(d: &[T], x: T, y: T) -> (T, T) {
    let r = (x.clone() * x.clone() + y.clone() * y.clone()).sqrt();
    if r < nalgebra::convert::<f64, T>(1e-10) {
        return (x, y);
    }
    let th = r.clone().atan();
    let th2 = th.clone() * th.clone();
    let th4 = th2.clone() * th2.clone();
    let th6 = th4.clone() * th2.clone();
    let th8 = th4.clone() * th4.clone();
    let thd = th
        * (T::one()
            + d[0].clone() * th2
            + d[1].clone() * th4
            + d[2].clone() * th6
            + d[3].clone() * th8);
    let scale = thd / r;
    (x * scale.clone(), y * scale)
}

/// Pixel residuals of all correspondences for one projection kind.
#[derive(Debug, Clone)]
struct ReprojectionCost {
    kind: ProjectionKind,
    points3d: Vec<Vector3<f64>>,
    points2d: Vec<Vector2<f64>>,
}

impl<T: RealField> Factor<T> for ReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let p = &params[0];
        let (fx, fy, cx, cy) = (p[0].clone(), p[1].clone(), p[2].clone(), p[3].clone());
        let dist = [p[4].clone(), p[5].clone(), p[6].clone(), p[7].clone()];

        let mut residuals = DVector::zeros(self.points2d.len() * 2);
        for (i, (p3d, p2d)) in self.points3d.iter().zip(&self.points2d).enumerate() {
            if p3d.z <= f64::EPSILON {
                continue;
            }
            let x = nalgebra::convert::<f64, T>(p3d.x / p3d.z);
            let y = nalgebra::convert::<f64, T>(p3d.y / p3d.z);
            let (xd, yd) = match self.kind {
                ProjectionKind::PinholeRadtan4 => radtan4(&dist, x, y),
                ProjectionKind::PinholeEqui4 => equi4(&dist, x, y),
            };
            residuals[i * 2] = fx.clone() * xd + cx.clone() - nalgebra::convert(p2d.x);
            residuals[i * 2 + 1] = fy.clone() * yd + cy.clone() - nalgebra::convert(p2d.y);
        }
        residuals
    }
}

/// Refines the parameters of one camera from camera-frame 3D points (3xN)
/// and their observed pixels (2xN).
#[derive(Debug, Clone)]
pub struct IntrinsicsRefinement {
    geometry: CameraGeometry,
    params: DVector<f64>,
    points3d: Matrix3xX<f64>,
    points2d: Matrix2xX<f64>,
}

impl IntrinsicsRefinement {
    pub fn new(
        geometry: CameraGeometry,
        initial: DVector<f64>,
        points3d: Matrix3xX<f64>,
        points2d: Matrix2xX<f64>,
    ) -> Result<Self, CameraModelError> {
        if initial.len() != CAMERA_PARAMS_SIZE {
            return Err(CameraModelError::InvalidParams(format!(
                "expected {} camera parameters, got {}",
                CAMERA_PARAMS_SIZE,
                initial.len()
            )));
        }
        if points3d.ncols() != points2d.ncols() {
            return Err(CameraModelError::InvalidParams(
                "Number of 2D and 3D points must match".to_string(),
            ));
        }
        if points3d.ncols() == 0 {
            return Err(CameraModelError::InvalidParams(
                "Points arrays cannot be empty".to_string(),
            ));
        }
        Ok(IntrinsicsRefinement {
            geometry,
            params: initial,
            points3d,
            points2d,
        })
    }

    pub fn params(&self) -> &DVector<f64> {
        &self.params
    }

    pub fn geometry(&self) -> &CameraGeometry {
        &self.geometry
    }

    /// Estimates `fx, fy, cx, cy` by linear least squares, ignoring distortion.
    ///
    /// Each pixel axis is an independent line fit `u = fx·x + cx`,
    /// `v = fy·y + cy` over the normalized coordinates. Distortion is reset to zero.
    pub fn linear_estimation(&mut self) -> Result<(), CameraModelError> {
        let valid: Vec<usize> = (0..self.points3d.ncols())
            .filter(|&i| self.points3d[(2, i)] > f64::EPSILON)
            .collect();
        if valid.len() < 2 {
            return Err(CameraModelError::InvalidParams(
                "Not enough points for linear estimation (need at least 2)".to_string(),
            ));
        }

        let n = valid.len();
        let mut a_u = DMatrix::zeros(n, 2);
        let mut a_v = DMatrix::zeros(n, 2);
        let mut b_u = DVector::zeros(n);
        let mut b_v = DVector::zeros(n);
        for (row, &i) in valid.iter().enumerate() {
            let p3d = self.points3d.column(i);
            a_u[(row, 0)] = p3d.x / p3d.z;
            a_u[(row, 1)] = 1.0;
            a_v[(row, 0)] = p3d.y / p3d.z;
            a_v[(row, 1)] = 1.0;
            b_u[row] = self.points2d[(0, i)];
            b_v[row] = self.points2d[(1, i)];
        }

        let solve = |a: DMatrix<f64>, b: DVector<f64>| {
            a.svd(true, true)
                .solve(&b, 1e-10)
                .map_err(|e| CameraModelError::NumericalError(e.to_string()))
        };
        let u = solve(a_u, b_u)?;
        let v = solve(a_v, b_v)?;

        self.params = DVector::from_vec(vec![u[0], v[0], u[1], v[1], 0.0, 0.0, 0.0, 0.0]);
        validation::validate_params(&self.params)
    }

    /// Levenberg-Marquardt refinement of all eight parameters.
    pub fn optimize(&mut self, verbose: bool) -> Result<(), CameraModelError> {
        let cost = ReprojectionCost {
            kind: self.geometry.kind,
            points3d: self
                .points3d
                .column_iter()
                .map(|c| c.into_owned())
                .collect(),
            points2d: self
                .points2d
                .column_iter()
                .map(|c| c.into_owned())
                .collect(),
        };
        let num_residuals = cost.points2d.len() * 2;

        let mut problem = tiny_solver::Problem::new();
        problem.add_residual_block(num_residuals, &["params"], Box::new(cost), None);

        let mut initial_values = HashMap::new();
        initial_values.insert("params".to_string(), self.params.clone());

        if verbose {
            info!("Refining camera {} intrinsics with Levenberg-Marquardt", self.geometry.cam_index);
        }
        let optimizer = LevenbergMarquardtOptimizer::default();
        let mut result = optimizer
            .optimize(&problem, &initial_values, None)
            .ok_or_else(|| CameraModelError::NumericalError("Optimization failed".to_string()))?;
        let refined = result
            .remove("params")
            .ok_or_else(|| CameraModelError::NumericalError("Missing optimized parameters".to_string()))?;

        validation::validate_params(&refined)?;
        self.params = refined;
        if verbose {
            info!("Refined parameters: {:?}", self.params.as_slice());
        }
        Ok(())
    }

    /// Reprojection error statistics over the correspondences that project.
    pub fn reprojection_error(&self) -> Result<ProjectionError, CameraModelError> {
        let errors: Vec<f64> = self
            .points3d
            .column_iter()
            .zip(self.points2d.column_iter())
            .filter_map(|(p3d, p2d)| {
                self.geometry
                    .project(&self.params, &p3d.into_owned())
                    .ok()
                    .map(|projection| (projection.pixel - p2d).norm())
            })
            .collect();

        if errors.is_empty() {
            return Err(CameraModelError::NumericalError(
                "No correspondence projects into the image".to_string(),
            ));
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        let min = errors.iter().copied().fold(f64::INFINITY, f64::min);
        let max = errors.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut sorted = errors;
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Ok(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Resolution;
    use approx::assert_relative_eq;

    fn geometry(kind: ProjectionKind) -> CameraGeometry {
        CameraGeometry::new(
            0,
            Resolution {
                width: 752,
                height: 480,
            },
            kind,
        )
    }

    /// A planar target seen obliquely, so depths vary across the grid.
    fn correspondences(
        geometry: &CameraGeometry,
        params: &DVector<f64>,
    ) -> (Matrix3xX<f64>, Matrix2xX<f64>) {
        let mut points3d = Vec::new();
        let mut points2d = Vec::new();
        for i in 0..9 {
            for j in 0..7 {
                let x = -0.8 + 0.2 * i as f64;
                let y = -0.5 + 0.16 * j as f64;
                let p = Vector3::new(x, y, 2.0 + 0.3 * x - 0.2 * y);
                if let Ok(projection) = geometry.project(params, &p) {
                    points3d.push(p);
                    points2d.push(projection.pixel);
                }
            }
        }
        (
            Matrix3xX::from_columns(&points3d),
            Matrix2xX::from_columns(&points2d),
        )
    }

    #[test]
    fn test_linear_estimation_without_distortion() {
        let geometry = geometry(ProjectionKind::PinholeRadtan4);
        let truth = DVector::from_vec(vec![458.0, 457.0, 367.0, 248.0, 0.0, 0.0, 0.0, 0.0]);
        let (points3d, points2d) = correspondences(&geometry, &truth);

        let initial = DVector::from_vec(vec![300.0, 300.0, 376.0, 240.0, 0.0, 0.0, 0.0, 0.0]);
        let mut refinement =
            IntrinsicsRefinement::new(geometry, initial, points3d, points2d).unwrap();
        refinement.linear_estimation().unwrap();
        assert_relative_eq!(refinement.params().clone(), truth, epsilon = 1e-6);
        assert!(refinement.reprojection_error().unwrap().rmse < 1e-6);
    }

    #[test]
    fn test_refine_radtan4() {
        let geometry = geometry(ProjectionKind::PinholeRadtan4);
        let truth = DVector::from_vec(vec![
            458.654, 457.296, 367.215, 248.375, -0.28, 0.074, 0.0002, 0.00002,
        ]);
        let (points3d, points2d) = correspondences(&geometry, &truth);

        let mut refinement =
            IntrinsicsRefinement::new(geometry, truth.clone(), points3d, points2d).unwrap();
        refinement.linear_estimation().unwrap();
        let before = refinement.reprojection_error().unwrap();
        refinement.optimize(false).unwrap();
        let after = refinement.reprojection_error().unwrap();

        assert!(after.rmse < before.rmse);
        assert!(after.rmse < 1e-3);
        assert_relative_eq!(refinement.params()[0], truth[0], epsilon = 1e-1);
        assert_relative_eq!(refinement.params()[4], truth[4], epsilon = 1e-2);
    }

    #[test]
    fn test_refine_equi4() {
        let geometry = geometry(ProjectionKind::PinholeEqui4);
        let truth = DVector::from_vec(vec![
            350.0, 352.0, 376.0, 240.0, -0.0125, 0.0578, -0.0849, 0.0436,
        ]);
        let (points3d, points2d) = correspondences(&geometry, &truth);

        let mut initial = truth.clone();
        initial[0] += 10.0;
        initial[3] -= 5.0;
        initial[4] = 0.0;
        let mut refinement =
            IntrinsicsRefinement::new(geometry, initial, points3d, points2d).unwrap();
        refinement.optimize(false).unwrap();
        assert!(refinement.reprojection_error().unwrap().rmse < 1e-3);
    }

    #[test]
    fn test_invalid_inputs() {
        let geometry = geometry(ProjectionKind::PinholeRadtan4);
        let params = DVector::from_vec(vec![458.0, 457.0, 367.0, 248.0, 0.0, 0.0, 0.0, 0.0]);
        let points3d = Matrix3xX::from_columns(&[Vector3::new(0.0, 0.0, 1.0)]);
        let points2d = Matrix2xX::from_columns(&[Vector2::new(367.0, 248.0)]);

        assert!(IntrinsicsRefinement::new(
            geometry,
            DVector::zeros(4),
            points3d.clone(),
            points2d.clone()
        )
        .is_err());
        assert!(IntrinsicsRefinement::new(
            geometry,
            params.clone(),
            points3d.clone(),
            Matrix2xX::zeros(0)
        )
        .is_err());

        let mut single = IntrinsicsRefinement::new(geometry, params, points3d, points2d).unwrap();
        assert!(matches!(
            single.linear_estimation(),
            Err(CameraModelError::InvalidParams(_))
        ));
    }
}
