//! Sliding window filter: a bounded window of time-indexed states over a
//! [`Graph`], with the oldest states marginalized out on every [`solve`].
//!
//! [`solve`]: SlidingWindowFilter::solve

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, info};
use nalgebra::{DMatrix, DVector, Vector2, Vector3};

use crate::camera::{pinhole_focal, CameraGeometry, ProjectionKind, Resolution};
use crate::config::{Config, ConfigError};
use crate::estimation::graph::Graph;
use crate::estimation::imu::{imu_propagate, ImuBuffer, ImuParams, ImuPreintegration};
use crate::estimation::param::ParamKind;
use crate::estimation::solver::{
    schurs_complement, MargStrategy, SolveSummary, Solver, SolverOptions,
};
use crate::estimation::{EstimationError, Id};
use crate::geometry::pose_from_matrix;

/// Cameras and extrinsics are looked up for indices `0..MAX_CAMERAS` in configs.
const MAX_CAMERAS: usize = 5;

/// Distortion guess used when a camera is configured by its field of view.
const FOV_DIST_PARAMS: [f64; 4] = [0.01, 0.001, 0.01, 0.001];

/// Ids belonging to one time step of the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    pub timestamp: u64,
    pub pose_id: Option<Id>,
    pub speed_bias_id: Option<Id>,
    pub factor_ids: Vec<Id>,
    pub feature_ids: Vec<Id>,
}

impl WindowState {
    fn new(timestamp: u64) -> Self {
        WindowState {
            timestamp,
            pose_id: None,
            speed_bias_id: None,
            factor_ids: Vec::new(),
            feature_ids: Vec::new(),
        }
    }
}

/// Reduced normal equations left behind by a Schur-complement marginalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Marginal {
    /// Blocks the reduced system is expressed over, in column order.
    pub param_ids: Vec<Id>,
    pub h: DMatrix<f64>,
    pub g: DVector<f64>,
}

#[derive(Debug, Clone)]
pub struct SlidingWindowFilter {
    graph: Graph,
    solver: Solver,
    window_limit: usize,
    marg_strategy: MargStrategy,
    imu_params: ImuParams,

    window: VecDeque<WindowState>,
    camera_ids: BTreeMap<usize, Id>,
    extrinsic_ids: BTreeMap<usize, Id>,
    feature_ids: Vec<Id>,
    pose_ids: VecDeque<Id>,
    speed_bias_ids: VecDeque<Id>,

    marg_param_ids: BTreeSet<Id>,
    marg_factor_ids: BTreeSet<Id>,
    marked_states: usize,

    marginalized_poses: Vec<(u64, DVector<f64>)>,
    last_marginal: Option<Marginal>,
    last_summary: Option<SolveSummary>,
}

impl SlidingWindowFilter {
    pub fn new(window_limit: usize) -> Self {
        SlidingWindowFilter {
            graph: Graph::new(),
            solver: Solver::default(),
            window_limit,
            marg_strategy: MargStrategy::default(),
            imu_params: ImuParams::default(),
            window: VecDeque::new(),
            camera_ids: BTreeMap::new(),
            extrinsic_ids: BTreeMap::new(),
            feature_ids: Vec::new(),
            pose_ids: VecDeque::new(),
            speed_bias_ids: VecDeque::new(),
            marg_param_ids: BTreeSet::new(),
            marg_factor_ids: BTreeSet::new(),
            marked_states: 0,
            marginalized_poses: Vec::new(),
            last_marginal: None,
            last_summary: None,
        }
    }

    pub fn with_solver_options(mut self, options: SolverOptions) -> Self {
        self.solver = Solver::new(options);
        self
    }

    pub fn with_marg_strategy(mut self, strategy: MargStrategy) -> Self {
        self.marg_strategy = strategy;
        self
    }

    pub fn with_imu_params(mut self, params: ImuParams) -> Self {
        self.imu_params = params;
        self
    }

    /// Builds a filter from a configuration file.
    ///
    /// `swf.window_limit` is required. Solver options (`solver.*`), IMU
    /// parameters (`imu0.*`), cameras (`cam0`..`cam4`) and IMU-camera
    /// extrinsics (`T_SC0`..`T_SC4`) are read when present.
    pub fn from_config(config: &Config) -> Result<Self, EstimationError> {
        let window_limit = config.get_usize("swf.window_limit")?;
        let mut filter = SlidingWindowFilter::new(window_limit)
            .with_solver_options(solver_options(config, "solver")?);
        if config.has_key("solver.marg_type") {
            let name = config.get_string("solver.marg_type")?;
            filter.marg_strategy = name.parse().map_err(|_| ConfigError::InvalidValue {
                key: "solver.marg_type".to_string(),
                expected: "`drop` or `sibley`",
            })?;
        }
        if config.has_key("imu0") {
            filter.imu_params = imu_params(config, "imu0")?;
        }

        for cam_index in 0..MAX_CAMERAS {
            let prefix = format!("cam{cam_index}");
            if config.has_key(&prefix) {
                let (geometry, params) = camera_from_config(config, &prefix, cam_index)?;
                filter.add_camera(geometry.cam_index, geometry.resolution, geometry.kind, params)?;
            }
        }
        for cam_index in 0..MAX_CAMERAS {
            let key = format!("T_SC{cam_index}");
            if config.has_key(&key) {
                let extrinsic = pose_from_matrix(&config.get_matrix4(&key)?);
                filter.add_extrinsic(cam_index, extrinsic)?;
            }
        }

        info!(
            "sliding window: limit {}, {} camera(s), {} extrinsic(s), marginalization `{}`",
            filter.window_limit,
            filter.camera_ids.len(),
            filter.extrinsic_ids.len(),
            filter.marg_strategy.name()
        );
        Ok(filter)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn window(&self) -> &VecDeque<WindowState> {
        &self.window
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn window_limit(&self) -> usize {
        self.window_limit
    }

    pub fn marg_strategy(&self) -> MargStrategy {
        self.marg_strategy
    }

    pub fn imu_params(&self) -> &ImuParams {
        &self.imu_params
    }

    pub fn num_cameras(&self) -> usize {
        self.camera_ids.len()
    }

    pub fn num_features(&self) -> usize {
        self.feature_ids.len()
    }

    /// Reduced system from the latest `sibley` marginalization.
    pub fn last_marginal(&self) -> Option<&Marginal> {
        self.last_marginal.as_ref()
    }

    pub fn last_summary(&self) -> Option<&SolveSummary> {
        self.last_summary.as_ref()
    }

    fn back_mut(&mut self) -> Result<&mut WindowState, EstimationError> {
        self.window.back_mut().ok_or(EstimationError::EmptyWindow)
    }

    fn camera_id(&self, cam_index: usize) -> Result<Id, EstimationError> {
        self.camera_ids
            .get(&cam_index)
            .copied()
            .ok_or(EstimationError::UnknownCamera(cam_index))
    }

    pub fn add_camera(
        &mut self,
        cam_index: usize,
        resolution: Resolution,
        kind: ProjectionKind,
        params: DVector<f64>,
    ) -> Result<Id, EstimationError> {
        let geometry = CameraGeometry::new(cam_index, resolution, kind);
        let camera_id = self.graph.add_camera(geometry, params, false)?;
        self.camera_ids.insert(cam_index, camera_id);
        Ok(camera_id)
    }

    /// Adds the IMU-camera extrinsic `T_SC` of an already added camera.
    pub fn add_extrinsic(
        &mut self,
        cam_index: usize,
        extrinsic: DVector<f64>,
    ) -> Result<Id, EstimationError> {
        self.camera_id(cam_index)?;
        let extrinsic_id = self.graph.add_extrinsic(extrinsic, false)?;
        self.extrinsic_ids.insert(cam_index, extrinsic_id);
        Ok(extrinsic_id)
    }

    pub fn add_landmark(&mut self, landmark: Vector3<f64>) -> Result<Id, EstimationError> {
        let feature_id = self.graph.add_landmark(landmark, false)?;
        self.feature_ids.push(feature_id);
        Ok(feature_id)
    }

    /// Adds a pose and opens a new window state for it.
    pub fn add_pose(&mut self, timestamp: u64, pose: DVector<f64>) -> Result<Id, EstimationError> {
        let pose_id = self.graph.add_pose(timestamp, pose, false)?;
        self.pose_ids.push_back(pose_id);
        let mut state = WindowState::new(timestamp);
        state.pose_id = Some(pose_id);
        self.window.push_back(state);
        Ok(pose_id)
    }

    /// Adds a speed/bias block to the newest window state.
    pub fn add_speed_bias(
        &mut self,
        timestamp: u64,
        speed_bias: DVector<f64>,
    ) -> Result<Id, EstimationError> {
        if self.window.is_empty() {
            return Err(EstimationError::EmptyWindow);
        }
        let sb_id = self.graph.add_speed_bias(timestamp, speed_bias)?;
        self.speed_bias_ids.push_back(sb_id);
        self.back_mut()?.speed_bias_id = Some(sb_id);
        Ok(sb_id)
    }

    /// Anchors a pose at its current value.
    pub fn add_pose_prior(
        &mut self,
        pose_id: Id,
        covariance: &DMatrix<f64>,
    ) -> Result<Id, EstimationError> {
        self.back_mut()?;
        let pose = self.graph.param(pose_id)?.value().clone();
        let factor_id = self.graph.add_pose_prior(pose_id, pose, covariance)?;
        self.back_mut()?.factor_ids.push(factor_id);
        Ok(factor_id)
    }

    /// Anchors a speed/bias block at its current value.
    pub fn add_speed_bias_prior(
        &mut self,
        speed_bias_id: Id,
        covariance: &DMatrix<f64>,
    ) -> Result<Id, EstimationError> {
        self.back_mut()?;
        let speed_bias = self.graph.param(speed_bias_id)?.value().clone();
        let factor_id = self
            .graph
            .add_speed_bias_prior(speed_bias_id, speed_bias, covariance)?;
        self.back_mut()?.factor_ids.push(factor_id);
        Ok(factor_id)
    }

    /// Reprojection of a landmark into camera `cam_index` at `pose_id`
    /// (a camera pose `T_WC`).
    pub fn add_ba_factor(
        &mut self,
        timestamp: u64,
        cam_index: usize,
        pose_id: Id,
        feature_id: Id,
        z: Vector2<f64>,
    ) -> Result<Id, EstimationError> {
        self.back_mut()?;
        let camera_id = self.camera_id(cam_index)?;
        let factor_id = self.graph.add_ba_factor(
            timestamp,
            pose_id,
            feature_id,
            camera_id,
            z,
            &DMatrix::identity(2, 2),
        )?;
        let state = self.back_mut()?;
        state.factor_ids.push(factor_id);
        state.feature_ids.push(feature_id);
        Ok(factor_id)
    }

    /// Reprojection through the body pose `pose_id` (`T_WS`) and the
    /// extrinsic of camera `cam_index`.
    pub fn add_vision_factor(
        &mut self,
        timestamp: u64,
        cam_index: usize,
        pose_id: Id,
        feature_id: Id,
        z: Vector2<f64>,
    ) -> Result<Id, EstimationError> {
        self.back_mut()?;
        let camera_id = self.camera_id(cam_index)?;
        let extrinsic_id = self
            .extrinsic_ids
            .get(&cam_index)
            .copied()
            .ok_or(EstimationError::UnknownCamera(cam_index))?;
        let factor_id = self.graph.add_vision_factor(
            timestamp,
            pose_id,
            extrinsic_id,
            feature_id,
            camera_id,
            z,
            &DMatrix::identity(2, 2),
        )?;
        let state = self.back_mut()?;
        state.factor_ids.push(factor_id);
        state.feature_ids.push(feature_id);
        Ok(factor_id)
    }

    /// Propagates the newest pose and speed/bias through `imu_data`, opens a
    /// new window state at `timestamp` with the prediction, and links the two
    /// states with an IMU factor.
    pub fn add_imu_factor(
        &mut self,
        timestamp: u64,
        imu_data: &ImuBuffer,
    ) -> Result<Id, EstimationError> {
        let pose_i_id = *self.pose_ids.back().ok_or(EstimationError::EmptyWindow)?;
        let sb_i_id = *self
            .speed_bias_ids
            .back()
            .ok_or(EstimationError::EmptyWindow)?;
        let pose_i = self.graph.param(pose_i_id)?.value().clone();
        let sb_i = self.graph.param(sb_i_id)?.value().clone();

        let (pose_j, sb_j) = imu_propagate(imu_data, &self.imu_params.gravity, &pose_i, &sb_i)?;
        let ba = Vector3::new(sb_i[3], sb_i[4], sb_i[5]);
        let bg = Vector3::new(sb_i[6], sb_i[7], sb_i[8]);
        let preint = ImuPreintegration::new(&self.imu_params, imu_data, ba, bg)?;

        let pose_j_id = self.add_pose(timestamp, pose_j)?;
        let linked = self.add_speed_bias(timestamp, sb_j).and_then(|sb_j_id| {
            self.graph
                .add_imu_factor(timestamp, (pose_i_id, sb_i_id), (pose_j_id, sb_j_id), preint)
        });
        match linked {
            Ok(factor_id) => {
                self.back_mut()?.factor_ids.push(factor_id);
                Ok(factor_id)
            }
            Err(err) => {
                self.discard_newest_state()?;
                Err(err)
            }
        }
    }

    /// Removes the newest state and its blocks, leaving the window as it was
    /// before the state was opened.
    fn discard_newest_state(&mut self) -> Result<(), EstimationError> {
        let state = self.window.pop_back().ok_or(EstimationError::EmptyWindow)?;
        if let Some(sb_id) = state.speed_bias_id {
            self.speed_bias_ids.pop_back();
            self.graph.rm_param(sb_id)?;
        }
        if let Some(pose_id) = state.pose_id {
            self.pose_ids.pop_back();
            self.graph.rm_param(pose_id)?;
        }
        Ok(())
    }

    /// Marks the oldest not yet marked state's pose and speed/bias blocks, and
    /// every factor touching them, for marginalization.
    pub fn pre_marginalize(&mut self) -> Result<(), EstimationError> {
        let state = self
            .window
            .get(self.marked_states)
            .ok_or(EstimationError::EmptyWindow)?;
        let param_ids: Vec<Id> = state.pose_id.into_iter().chain(state.speed_bias_id).collect();

        for param_id in param_ids {
            let factor_ids = self.graph.mark_marginalize(param_id)?;
            self.marg_param_ids.insert(param_id);
            self.marg_factor_ids.extend(factor_ids);
        }
        self.marked_states += 1;
        Ok(())
    }

    /// Removes the marked factors and blocks from the graph and pops the
    /// marked states off the window.
    pub fn marginalize(&mut self) -> Result<(), EstimationError> {
        let factor_ids: Vec<Id> = self.marg_factor_ids.iter().copied().collect();

        if self.marg_strategy == MargStrategy::Sibley && !factor_ids.is_empty() {
            let layout = self.graph.layout(&factor_ids)?;
            let (h, g, _) = self.graph.linearize(&factor_ids, &layout)?;
            let m = layout.marginal_size();
            let (h, g) = schurs_complement(&h, &g, m)?;
            let param_ids = layout
                .entries()
                .iter()
                .filter(|&&(_, offset, _)| offset >= m)
                .map(|&(id, _, _)| id)
                .collect();
            debug!("schur complement over {} column(s), kept {}", m, h.nrows());
            self.last_marginal = Some(Marginal { param_ids, h, g });
        }

        for &factor_id in &factor_ids {
            self.graph.rm_factor(factor_id)?;
        }
        for &param_id in &self.marg_param_ids {
            let block = self.graph.rm_param(param_id)?;
            if block.kind() == ParamKind::Pose {
                self.marginalized_poses
                    .push((block.timestamp(), block.value().clone()));
            }
        }

        let marg_params = std::mem::take(&mut self.marg_param_ids);
        let marg_factors = std::mem::take(&mut self.marg_factor_ids);
        self.pose_ids.retain(|id| !marg_params.contains(id));
        self.speed_bias_ids.retain(|id| !marg_params.contains(id));
        for _ in 0..self.marked_states {
            self.window.pop_front();
        }
        for state in self.window.iter_mut() {
            state.factor_ids.retain(|id| !marg_factors.contains(id));
        }
        info!(
            "marginalized {} state(s): {} factor(s), {} block(s) removed ({})",
            self.marked_states,
            marg_factors.len(),
            marg_params.len(),
            self.marg_strategy.name()
        );
        self.marked_states = 0;
        Ok(())
    }

    /// Runs one window-management pass.
    ///
    /// Does nothing while the window is within its limit. Otherwise marks the
    /// excess oldest states, optimizes the remaining problem once and
    /// marginalizes the marked states, leaving `window_len() <= window_limit`.
    pub fn solve(&mut self) -> Result<Option<&SolveSummary>, EstimationError> {
        if self.window.len() <= self.window_limit {
            return Ok(None);
        }

        let excess = self.window.len() - self.window_limit;
        while self.marked_states < excess {
            self.pre_marginalize()?;
        }
        let summary = self.solver.solve(&mut self.graph)?;
        self.marginalize()?;

        debug!("{summary}");
        self.last_summary = Some(summary);
        Ok(self.last_summary.as_ref())
    }

    /// Every pose estimated so far, oldest first: the marginalized poses
    /// followed by the poses still in the window.
    pub fn pose_path(&self) -> Result<Vec<(u64, DVector<f64>)>, EstimationError> {
        let mut path = self.marginalized_poses.clone();
        for &pose_id in &self.pose_ids {
            let block = self.graph.param(pose_id)?;
            path.push((block.timestamp(), block.value().clone()));
        }
        Ok(path)
    }

    /// Current camera parameter estimates, keyed by camera index.
    pub fn camera_estimates(&self) -> Result<BTreeMap<usize, DVector<f64>>, EstimationError> {
        self.camera_ids
            .iter()
            .map(|(&cam_index, &id)| Ok((cam_index, self.graph.param(id)?.value().clone())))
            .collect()
    }

    /// Current IMU-camera extrinsic estimates, keyed by camera index.
    pub fn extrinsic_estimates(&self) -> Result<BTreeMap<usize, DVector<f64>>, EstimationError> {
        self.extrinsic_ids
            .iter()
            .map(|(&cam_index, &id)| Ok((cam_index, self.graph.param(id)?.value().clone())))
            .collect()
    }

    pub fn landmark(&self, feature_id: Id) -> Result<Vector3<f64>, EstimationError> {
        let value = self.graph.param(feature_id)?.value();
        Ok(Vector3::new(value[0], value[1], value[2]))
    }
}

fn solver_options(config: &Config, prefix: &str) -> Result<SolverOptions, ConfigError> {
    let mut options = SolverOptions::default();
    let key = |name: &str| format!("{prefix}.{name}");
    if config.has_key(&key("max_iter")) {
        options.max_iter = config.get_usize(&key("max_iter"))?;
    }
    if config.has_key(&key("lambda")) {
        options.lambda = config.get_f64(&key("lambda"))?;
    }
    if config.has_key(&key("time_limit")) {
        options.time_limit = config.get_f64(&key("time_limit"))?;
    }
    if config.has_key(&key("cost_change_threshold")) {
        options.cost_change_threshold = config.get_f64(&key("cost_change_threshold"))?;
    }
    if config.has_key(&key("update_factor")) {
        options.update_factor = config.get_f64(&key("update_factor"))?;
    }
    if config.has_key(&key("verbose")) {
        options.verbose = config.get_bool(&key("verbose"))?;
    }
    Ok(options)
}

fn imu_params(config: &Config, prefix: &str) -> Result<ImuParams, ConfigError> {
    let mut params = ImuParams::default();
    let key = |name: &str| format!("{prefix}.{name}");
    if config.has_key(&key("rate")) {
        params.rate = config.get_f64(&key("rate"))?;
    }
    if config.has_key(&key("g")) {
        let g = config.get_vec_f64(&key("g"))?;
        if g.len() != 3 {
            return Err(ConfigError::InvalidValue {
                key: key("g"),
                expected: "a 3-vector",
            });
        }
        params.gravity = Vector3::new(g[0], g[1], g[2]);
    }
    for (name, slot) in [
        ("noise_acc", &mut params.noise_acc),
        ("noise_gyr", &mut params.noise_gyr),
        ("noise_ba", &mut params.noise_ba),
        ("noise_bg", &mut params.noise_bg),
    ] {
        if config.has_key(&key(name)) {
            *slot = config.get_f64(&key(name))?;
        }
    }
    Ok(params)
}

/// Reads a camera either from explicit `proj_params`/`dist_params` or from its
/// lens field of view.
fn camera_from_config(
    config: &Config,
    prefix: &str,
    cam_index: usize,
) -> Result<(CameraGeometry, DVector<f64>), EstimationError> {
    let key = |name: &str| format!("{prefix}.{name}");
    let res = config.get_vec_usize(&key("resolution"))?;
    if res.len() != 2 {
        return Err(ConfigError::InvalidValue {
            key: key("resolution"),
            expected: "[width, height]",
        }
        .into());
    }
    let resolution = Resolution {
        width: res[0] as u32,
        height: res[1] as u32,
    };
    let kind = ProjectionKind::from_names(
        &config.get_string(&key("proj_model"))?,
        &config.get_string(&key("dist_model"))?,
    )?;

    let params: Vec<f64> = if config.has_key(&key("proj_params")) && config.has_key(&key("dist_params")) {
        let mut params = config.get_vec_f64(&key("proj_params"))?;
        params.extend(config.get_vec_f64(&key("dist_params"))?);
        params
    } else if config.has_key(&key("lens_hfov")) && config.has_key(&key("lens_vfov")) {
        let fx = pinhole_focal(resolution.width, config.get_f64(&key("lens_hfov"))?);
        let fy = pinhole_focal(resolution.height, config.get_f64(&key("lens_vfov"))?);
        let cx = resolution.width as f64 / 2.0;
        let cy = resolution.height as f64 / 2.0;
        let mut params = vec![fx, fy, cx, cy];
        params.extend(FOV_DIST_PARAMS);
        params
    } else {
        return Err(ConfigError::MissingKey(format!(
            "{prefix}.proj_params/dist_params or {prefix}.lens_hfov/lens_vfov"
        ))
        .into());
    };

    Ok((
        CameraGeometry::new(cam_index, resolution, kind),
        DVector::from_vec(params),
    ))
}
