//! Factor-graph estimation: parameter blocks, factors, the graph that owns
//! them, a damped Gauss-Newton solver and a sliding window filter built on top.
//!
//! Everything in this module is single-threaded. Factors refer to parameter
//! blocks by id only, so removing a block from the [`Graph`] can never leave a
//! dangling reference: evaluating a factor whose block is gone fails with
//! [`EstimationError::ParamNotFound`].

use crate::camera::CameraModelError;
use crate::config::ConfigError;

pub mod factor;
pub mod graph;
pub mod imu;
pub mod param;
pub mod solver;
pub mod window;

pub use factor::{Factor, FactorKind};
pub use graph::{Graph, GraphState, ParamLayout};
pub use imu::{imu_propagate, ImuBuffer, ImuParams, ImuPreintegration};
pub use param::{ParamKind, ParameterBlock};
pub use solver::{
    schurs_complement, IterationRecord, MargStrategy, SolveSummary, Solver, SolverOptions,
    Termination,
};
pub use window::{Marginal, SlidingWindowFilter, WindowState};

/// Unique id of a parameter block or factor within one [`Graph`].
pub type Id = u64;

#[derive(thiserror::Error, Debug)]
pub enum EstimationError {
    #[error("Parameter block {0} not found")]
    ParamNotFound(Id),
    #[error("Factor {0} not found")]
    FactorNotFound(Id),
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid factor: {0}")]
    InvalidFactor(String),
    #[error("Covariance is not positive definite: {0}")]
    InvalidCovariance(String),
    #[error("Solve diverged: damped Hessian is not positive definite (lambda = {lambda:e})")]
    SolveDivergence { lambda: f64 },
    #[error("Sliding window is empty")]
    EmptyWindow,
    #[error("Camera {0} has not been added")]
    UnknownCamera(usize),
    #[error("Camera model error: {0}")]
    Camera(#[from] CameraModelError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
