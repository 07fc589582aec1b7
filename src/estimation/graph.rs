//! The factor graph: id-indexed arenas of parameter blocks and factors.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::debug;
use nalgebra::{DMatrix, DVector, Vector2, Vector3};

use crate::camera::{validation, CameraGeometry};
use crate::estimation::factor::{Factor, FactorKind};
use crate::estimation::imu::ImuPreintegration;
use crate::estimation::param::{ParamKind, ParameterBlock};
use crate::estimation::{EstimationError, Id};

/// Values of a set of parameter blocks, used to roll back rejected updates.
pub type GraphState = BTreeMap<Id, DVector<f64>>;

/// Column layout of the normal equations.
///
/// Marginalized blocks come first, then blocks ordered by kind and id. Fixed
/// blocks are never part of a layout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamLayout {
    entries: Vec<(Id, usize, usize)>,
    offsets: HashMap<Id, usize>,
    size: usize,
    marginal_size: usize,
}

impl ParamLayout {
    /// Total number of columns.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of leading columns that belong to marginalized blocks.
    pub fn marginal_size(&self) -> usize {
        self.marginal_size
    }

    pub fn offset(&self, id: Id) -> Option<usize> {
        self.offsets.get(&id).copied()
    }

    /// `(id, offset, local_dim)` of every block, in column order.
    pub fn entries(&self) -> &[(Id, usize, usize)] {
        &self.entries
    }

    pub fn param_ids(&self) -> Vec<Id> {
        self.entries.iter().map(|&(id, _, _)| id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owns every parameter block and factor; factors refer to blocks by id.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    params: BTreeMap<Id, ParameterBlock>,
    factors: BTreeMap<Id, Factor>,
    next_param_id: Id,
    next_factor_id: Id,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    pub fn param(&self, id: Id) -> Result<&ParameterBlock, EstimationError> {
        self.params.get(&id).ok_or(EstimationError::ParamNotFound(id))
    }

    pub fn param_mut(&mut self, id: Id) -> Result<&mut ParameterBlock, EstimationError> {
        self.params
            .get_mut(&id)
            .ok_or(EstimationError::ParamNotFound(id))
    }

    pub fn factor(&self, id: Id) -> Result<&Factor, EstimationError> {
        self.factors.get(&id).ok_or(EstimationError::FactorNotFound(id))
    }

    pub fn params(&self) -> impl Iterator<Item = &ParameterBlock> {
        self.params.values()
    }

    pub fn factors(&self) -> impl Iterator<Item = &Factor> {
        self.factors.values()
    }

    /// Inserts a parameter block and returns its new id.
    pub fn add_param(
        &mut self,
        kind: ParamKind,
        timestamp: u64,
        value: DVector<f64>,
        fixed: bool,
    ) -> Result<Id, EstimationError> {
        let id = self.next_param_id;
        let block = ParameterBlock::new(id, kind, timestamp, value, fixed)?;
        self.params.insert(id, block);
        self.next_param_id += 1;
        Ok(id)
    }

    pub fn add_pose(
        &mut self,
        timestamp: u64,
        pose: DVector<f64>,
        fixed: bool,
    ) -> Result<Id, EstimationError> {
        self.add_param(ParamKind::Pose, timestamp, pose, fixed)
    }

    pub fn add_landmark(&mut self, landmark: Vector3<f64>, fixed: bool) -> Result<Id, EstimationError> {
        let value = DVector::from_column_slice(landmark.as_slice());
        self.add_param(ParamKind::Landmark, 0, value, fixed)
    }

    /// Adds a camera parameter block after validating its intrinsics.
    pub fn add_camera(
        &mut self,
        geometry: CameraGeometry,
        params: DVector<f64>,
        fixed: bool,
    ) -> Result<Id, EstimationError> {
        validation::validate_params(&params)?;
        self.add_param(ParamKind::CameraParams(geometry), 0, params, fixed)
    }

    pub fn add_extrinsic(&mut self, pose: DVector<f64>, fixed: bool) -> Result<Id, EstimationError> {
        self.add_param(ParamKind::Extrinsic, 0, pose, fixed)
    }

    pub fn add_speed_bias(
        &mut self,
        timestamp: u64,
        speed_bias: DVector<f64>,
    ) -> Result<Id, EstimationError> {
        self.add_param(ParamKind::SpeedBias, timestamp, speed_bias, false)
    }

    /// Inserts a factor over `param_ids`, checking every block exists and has
    /// the kind the factor expects. Returns the new factor id.
    pub fn add_factor(
        &mut self,
        timestamp: u64,
        kind: FactorKind,
        param_ids: Vec<Id>,
        covariance: &DMatrix<f64>,
    ) -> Result<Id, EstimationError> {
        let expected = kind.param_dims();
        for (&pid, &(global, local)) in param_ids.iter().zip(&expected) {
            let block = self.param(pid)?;
            if block.global_dim() != global || block.local_dim() != local {
                return Err(EstimationError::InvalidFactor(format!(
                    "{} factor cannot use {} block {}",
                    kind.name(),
                    block.kind().name(),
                    pid
                )));
            }
        }

        let id = self.next_factor_id;
        let factor = Factor::new(id, timestamp, kind, param_ids, covariance)?;
        for pid in factor.param_ids() {
            if let Some(block) = self.params.get_mut(pid) {
                block.attach_factor(id);
            }
        }
        self.factors.insert(id, factor);
        self.next_factor_id += 1;
        Ok(id)
    }

    fn camera_geometry(&self, camera_id: Id) -> Result<CameraGeometry, EstimationError> {
        match self.param(camera_id)?.kind() {
            ParamKind::CameraParams(geometry) => Ok(geometry),
            other => Err(EstimationError::InvalidFactor(format!(
                "block {camera_id} is a {} block, not a camera",
                other.name()
            ))),
        }
    }

    /// Prior on a pose or extrinsic block.
    pub fn add_pose_prior(
        &mut self,
        pose_id: Id,
        pose: DVector<f64>,
        covariance: &DMatrix<f64>,
    ) -> Result<Id, EstimationError> {
        let timestamp = self.param(pose_id)?.timestamp();
        self.add_factor(timestamp, FactorKind::PosePrior { pose }, vec![pose_id], covariance)
    }

    pub fn add_landmark_prior(
        &mut self,
        landmark_id: Id,
        landmark: Vector3<f64>,
        covariance: &DMatrix<f64>,
    ) -> Result<Id, EstimationError> {
        self.add_factor(
            0,
            FactorKind::LandmarkPrior { landmark },
            vec![landmark_id],
            covariance,
        )
    }

    pub fn add_camera_params_prior(
        &mut self,
        camera_id: Id,
        params: DVector<f64>,
        covariance: &DMatrix<f64>,
    ) -> Result<Id, EstimationError> {
        self.camera_geometry(camera_id)?;
        self.add_factor(
            0,
            FactorKind::CameraParamsPrior { params },
            vec![camera_id],
            covariance,
        )
    }

    pub fn add_speed_bias_prior(
        &mut self,
        speed_bias_id: Id,
        speed_bias: DVector<f64>,
        covariance: &DMatrix<f64>,
    ) -> Result<Id, EstimationError> {
        let timestamp = self.param(speed_bias_id)?.timestamp();
        self.add_factor(
            timestamp,
            FactorKind::SpeedBiasPrior { speed_bias },
            vec![speed_bias_id],
            covariance,
        )
    }

    pub fn add_ba_factor(
        &mut self,
        timestamp: u64,
        pose_id: Id,
        landmark_id: Id,
        camera_id: Id,
        z: Vector2<f64>,
        covariance: &DMatrix<f64>,
    ) -> Result<Id, EstimationError> {
        let camera = self.camera_geometry(camera_id)?;
        self.add_factor(
            timestamp,
            FactorKind::BundleAdjustment { z, camera },
            vec![pose_id, landmark_id, camera_id],
            covariance,
        )
    }

    /// Reprojection of calibration-target point `target_point` (target frame).
    #[allow(clippy::too_many_arguments)]
    pub fn add_calib_factor(
        &mut self,
        timestamp: u64,
        fiducial_id: Id,
        pose_id: Id,
        camera_id: Id,
        z: Vector2<f64>,
        target_point: Vector3<f64>,
        covariance: &DMatrix<f64>,
    ) -> Result<Id, EstimationError> {
        let camera = self.camera_geometry(camera_id)?;
        self.add_factor(
            timestamp,
            FactorKind::CalibMono {
                z,
                target_point,
                camera,
            },
            vec![fiducial_id, pose_id, camera_id],
            covariance,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_vision_factor(
        &mut self,
        timestamp: u64,
        pose_id: Id,
        extrinsic_id: Id,
        landmark_id: Id,
        camera_id: Id,
        z: Vector2<f64>,
        covariance: &DMatrix<f64>,
    ) -> Result<Id, EstimationError> {
        let camera = self.camera_geometry(camera_id)?;
        self.add_factor(
            timestamp,
            FactorKind::Vision { z, camera },
            vec![pose_id, extrinsic_id, landmark_id, camera_id],
            covariance,
        )
    }

    /// IMU factor between two states, weighted by the preintegrated covariance.
    pub fn add_imu_factor(
        &mut self,
        timestamp: u64,
        state_i: (Id, Id),
        state_j: (Id, Id),
        preint: ImuPreintegration,
    ) -> Result<Id, EstimationError> {
        let covariance = DMatrix::from_column_slice(15, 15, preint.covariance().as_slice());
        self.add_factor(
            timestamp,
            FactorKind::Imu(Box::new(preint)),
            vec![state_i.0, state_i.1, state_j.0, state_j.1],
            &covariance,
        )
    }

    /// Removes a parameter block. Factors still referencing it will fail to
    /// evaluate with [`EstimationError::ParamNotFound`].
    pub fn rm_param(&mut self, id: Id) -> Result<ParameterBlock, EstimationError> {
        self.params
            .remove(&id)
            .ok_or(EstimationError::ParamNotFound(id))
    }

    /// Removes a factor and detaches it from the blocks it referenced.
    pub fn rm_factor(&mut self, id: Id) -> Result<Factor, EstimationError> {
        let factor = self
            .factors
            .remove(&id)
            .ok_or(EstimationError::FactorNotFound(id))?;
        for pid in factor.param_ids() {
            if let Some(block) = self.params.get_mut(pid) {
                block.detach_factor(id);
            }
        }
        Ok(factor)
    }

    /// Marks a block and every factor touching it for marginalization.
    ///
    /// The marked factors are detached from all the blocks they reference.
    /// Returns the ids of the newly marked factors.
    pub fn mark_marginalize(&mut self, param_id: Id) -> Result<Vec<Id>, EstimationError> {
        let block = self.param_mut(param_id)?;
        block.mark_marginalize();
        let factor_ids: Vec<Id> = block.factor_ids().iter().copied().collect();

        for &fid in &factor_ids {
            let factor = self
                .factors
                .get_mut(&fid)
                .ok_or(EstimationError::FactorNotFound(fid))?;
            factor.mark_marginalize();
            for pid in factor.param_ids() {
                if let Some(block) = self.params.get_mut(pid) {
                    block.detach_factor(fid);
                }
            }
        }
        Ok(factor_ids)
    }

    /// Ids of the factors taking part in optimization.
    pub fn active_factor_ids(&self) -> Vec<Id> {
        self.factors
            .values()
            .filter(|f| !f.is_marginalized())
            .map(|f| f.id())
            .collect()
    }

    /// Ids of the factors marked for marginalization.
    pub fn marginal_factor_ids(&self) -> Vec<Id> {
        self.factors
            .values()
            .filter(|f| f.is_marginalized())
            .map(|f| f.id())
            .collect()
    }

    /// Ids of the blocks marked for marginalization.
    pub fn marginal_param_ids(&self) -> Vec<Id> {
        self.params
            .values()
            .filter(|p| p.is_marginalized())
            .map(|p| p.id())
            .collect()
    }

    /// Evaluates one factor at the current block values.
    pub fn eval_factor(&mut self, id: Id) -> Result<&Factor, EstimationError> {
        let factor = self
            .factors
            .get_mut(&id)
            .ok_or(EstimationError::FactorNotFound(id))?;
        let values = factor
            .param_ids()
            .iter()
            .map(|pid| {
                self.params
                    .get(pid)
                    .map(|block| block.value())
                    .ok_or(EstimationError::ParamNotFound(*pid))
            })
            .collect::<Result<Vec<_>, _>>()?;
        factor.eval(&values)?;
        Ok(factor)
    }

    /// Total cost `Σ ½|r|²` of `factor_ids` at the current values.
    pub fn cost(&mut self, factor_ids: &[Id]) -> Result<f64, EstimationError> {
        let mut cost = 0.0;
        for &fid in factor_ids {
            cost += self.eval_factor(fid)?.cost();
        }
        Ok(cost)
    }

    /// Builds the column layout over the free blocks referenced by `factor_ids`.
    pub fn layout(&self, factor_ids: &[Id]) -> Result<ParamLayout, EstimationError> {
        let mut seen = BTreeSet::new();
        let mut blocks: Vec<&ParameterBlock> = Vec::new();
        for &fid in factor_ids {
            for &pid in self.factor(fid)?.param_ids() {
                let block = self.param(pid)?;
                if !block.is_fixed() && seen.insert(pid) {
                    blocks.push(block);
                }
            }
        }
        blocks.sort_by_key(|b| (!b.is_marginalized(), b.kind().order(), b.id()));

        let mut layout = ParamLayout::default();
        for block in blocks {
            let dim = block.local_dim();
            layout.entries.push((block.id(), layout.size, dim));
            layout.offsets.insert(block.id(), layout.size);
            layout.size += dim;
            if block.is_marginalized() {
                layout.marginal_size += dim;
            }
        }
        Ok(layout)
    }

    /// Evaluates `factor_ids` and accumulates the normal equations
    /// `H = ΣJᵀJ`, `g = −ΣJᵀr` over `layout`. Returns `(H, g, cost)`.
    pub fn linearize(
        &mut self,
        factor_ids: &[Id],
        layout: &ParamLayout,
    ) -> Result<(DMatrix<f64>, DVector<f64>, f64), EstimationError> {
        let n = layout.size();
        let mut h = DMatrix::zeros(n, n);
        let mut g = DVector::zeros(n);
        let mut cost = 0.0;

        for &fid in factor_ids {
            let factor = self.eval_factor(fid)?;
            cost += factor.cost();
            let residual = factor.residual();
            let blocks: Vec<(usize, &DMatrix<f64>)> = factor
                .param_ids()
                .iter()
                .zip(factor.jacobians())
                .filter_map(|(pid, jacobian)| layout.offset(*pid).map(|offset| (offset, jacobian)))
                .collect();

            for &(oi, ji) in &blocks {
                let mut g_block = g.rows_mut(oi, ji.ncols());
                g_block -= ji.transpose() * residual;
                for &(oj, jj) in &blocks {
                    let mut h_block = h.view_mut((oi, oj), (ji.ncols(), jj.ncols()));
                    h_block += ji.transpose() * jj;
                }
            }
        }
        Ok((h, g, cost))
    }

    /// Applies a stacked local increment to the blocks of `layout`.
    pub fn update(&mut self, layout: &ParamLayout, dx: &DVector<f64>) -> Result<(), EstimationError> {
        if dx.len() != layout.size() {
            return Err(EstimationError::DimensionMismatch {
                what: "update".to_string(),
                expected: layout.size(),
                actual: dx.len(),
            });
        }
        for &(id, offset, dim) in layout.entries() {
            self.param_mut(id)?
                .perturb(&dx.as_slice()[offset..offset + dim])?;
        }
        Ok(())
    }

    pub fn snapshot(&self, layout: &ParamLayout) -> Result<GraphState, EstimationError> {
        layout
            .entries()
            .iter()
            .map(|&(id, _, _)| Ok((id, self.param(id)?.value().clone())))
            .collect()
    }

    pub fn restore(&mut self, state: &GraphState) -> Result<(), EstimationError> {
        for (&id, value) in state {
            self.param_mut(id)?.set_value(value.clone())?;
        }
        Ok(())
    }

    /// Central-difference Jacobians of a factor's whitened residual, one per
    /// parameter block, using the blocks' own perturbation.
    pub fn numerical_jacobians(
        &self,
        factor_id: Id,
        step: f64,
    ) -> Result<Vec<DMatrix<f64>>, EstimationError> {
        let factor = self.factor(factor_id)?;
        let mut blocks = factor
            .param_ids()
            .iter()
            .map(|&pid| {
                let mut block = self.param(pid)?.clone();
                block.unfix();
                Ok(block)
            })
            .collect::<Result<Vec<_>, EstimationError>>()?;

        let residual_at = |blocks: &[ParameterBlock]| -> Result<DVector<f64>, EstimationError> {
            let values: Vec<&DVector<f64>> = blocks.iter().map(|b| b.value()).collect();
            Ok(factor.evaluate(&values)?.0)
        };

        let mut jacobians = Vec::with_capacity(blocks.len());
        for k in 0..blocks.len() {
            let dim = blocks[k].local_dim();
            let original = blocks[k].value().clone();
            let mut jacobian = DMatrix::zeros(factor.residual_dim(), dim);
            for i in 0..dim {
                let mut delta = vec![0.0; dim];
                delta[i] = step;
                blocks[k].perturb(&delta)?;
                let forward = residual_at(&blocks)?;
                blocks[k].set_value(original.clone())?;

                delta[i] = -step;
                blocks[k].perturb(&delta)?;
                let backward = residual_at(&blocks)?;
                blocks[k].set_value(original.clone())?;

                jacobian.set_column(i, &((forward - backward) / (2.0 * step)));
            }
            jacobians.push(jacobian);
        }
        debug!("numerical jacobians for factor {factor_id} ({})", factor.kind().name());
        Ok(jacobians)
    }
}
