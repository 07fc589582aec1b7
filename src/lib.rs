//! Factor Window Library
//!
//! A factor-graph least-squares estimator for visual and visual-inertial
//! state estimation. The library provides:
//! - Pinhole cameras with radial-tangential or equidistant distortion
//! - Prior, reprojection, calibration and IMU preintegration factors
//! - A damped Gauss-Newton solver with Schur-complement marginalization
//! - A sliding window filter that bounds the number of active poses
//! - YAML configuration loading and intrinsics bootstrapping with tiny-solver

pub mod calibration;
pub mod camera;
pub mod config;
pub mod estimation;
pub mod geometry;

// Re-export commonly used types
pub use calibration::{IntrinsicsRefinement, ProjectionError};
pub use camera::{
    CameraGeometry, CameraModelError, Equi4, ProjectionKind, ProjectionModel, RadTan4, Resolution,
};
pub use config::{Config, ConfigError};
pub use estimation::{
    EstimationError, Factor, FactorKind, Graph, ImuBuffer, ImuParams, ImuPreintegration,
    MargStrategy, ParamKind, SlidingWindowFilter, SolveSummary, Solver, SolverOptions,
};
