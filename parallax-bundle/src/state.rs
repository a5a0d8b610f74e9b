//! Snapshot of the optimizable scene, decoupled from the entity graph.
//!
//! Initializers and the LM driver work on a [`SceneState`] so that entities
//! are read once (at layout construction) and written once (when the winning
//! candidate is applied). Nothing mutates a [`Project`] in between.

use nalgebra::Vector3;
use parallax_mvg::CameraParams;
use parallax_types::{Project, ViewpointId};

/// Point positions and camera parameters for one candidate of a solve.
///
/// `points[i]` corresponds to `PointId(i)` and holds the merged (lock-aware)
/// position; `cameras[i]` corresponds to `ViewpointId(i)`.
#[derive(Debug, Clone)]
pub struct SceneState {
    pub points: Vec<Vector3<f64>>,
    pub cameras: Vec<CameraParams<f64>>,
}

impl SceneState {
    /// Snapshot the current entity values.
    pub fn from_project(project: &Project) -> Self {
        Self {
            points: project.points().iter().map(|p| p.effective_xyz()).collect(),
            cameras: project
                .viewpoints()
                .iter()
                .map(camera_params_from_viewpoint)
                .collect(),
        }
    }

    /// Write this state back onto the entities. Locked point axes are
    /// re-read from their lock values so write-back is exact regardless of
    /// what optimization did to the free representation.
    pub fn apply_to_project(&self, project: &mut Project) {
        for (point, value) in project.points_mut().iter_mut().zip(self.points.iter()) {
            point.optimized = *value;
            for axis in 0..3 {
                if let Some(locked) = point.locked[axis] {
                    point.optimized[axis] = locked;
                }
            }
        }
        for (viewpoint, cam) in project.viewpoints_mut().iter_mut().zip(self.cameras.iter()) {
            viewpoint.position = cam.position;
            viewpoint.rotation = cam.rotation;
            viewpoint.intrinsics.focal = cam.focal;
            viewpoint.intrinsics.cx = cam.cx;
            viewpoint.intrinsics.cy = cam.cy;
            viewpoint.intrinsics.k1 = cam.k1;
            viewpoint.intrinsics.k2 = cam.k2;
            viewpoint.intrinsics.k3 = cam.k3;
            viewpoint.intrinsics.p1 = cam.p1;
            viewpoint.intrinsics.p2 = cam.p2;
        }
    }

    pub fn camera(&self, id: ViewpointId) -> &CameraParams<f64> {
        &self.cameras[id.0]
    }
}

/// Adapt a viewpoint entity to the solver's camera parameterization.
pub fn camera_params_from_viewpoint(vp: &parallax_types::Viewpoint) -> CameraParams<f64> {
    CameraParams {
        focal: vp.intrinsics.focal,
        aspect_ratio: vp.intrinsics.aspect_ratio,
        cx: vp.intrinsics.cx,
        cy: vp.intrinsics.cy,
        skew: vp.intrinsics.skew,
        k1: vp.intrinsics.k1,
        k2: vp.intrinsics.k2,
        k3: vp.intrinsics.k3,
        p1: vp.intrinsics.p1,
        p2: vp.intrinsics.p2,
        position: vp.position,
        rotation: vp.rotation,
        z_reflected: vp.is_z_reflected,
    }
}
