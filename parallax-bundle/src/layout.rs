//! Assignment of global variable indices to the free scalars of a project.
//!
//! Walks world points first (one column per unlocked axis), then every
//! enabled, non-pose-locked viewpoint (three position columns, four
//! quaternion columns, optionally the eight optimizable intrinsics). Every
//! scalar a residual provider reads is a [`Slot`]: either a column into the
//! free-variable vector or a fixed value (a locked axis, a locked pose, a
//! disabled intrinsic block). Locked scalars therefore contribute no Jacobian
//! columns at all.
//!
//! The layout is immutable during a solve.

use nalgebra::{DVector, Quaternion, Vector3};
use parallax_mvg::projection::INTRINSIC_PARAMS;
use parallax_mvg::CameraParams;
use parallax_types::{Project, SolverOptions, ViewpointId};

use crate::state::SceneState;

/// One scalar as seen by the residual providers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Slot {
    /// Column index into the free-variable vector.
    Free(usize),
    /// Not optimized; always this value.
    Fixed(f64),
}

impl Slot {
    #[inline]
    pub fn value(&self, x: &DVector<f64>) -> f64 {
        match *self {
            Slot::Free(col) => x[col],
            Slot::Fixed(v) => v,
        }
    }

    #[inline]
    pub fn column(&self) -> Option<usize> {
        match *self {
            Slot::Free(col) => Some(col),
            Slot::Fixed(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PointSlots {
    pub xyz: [Slot; 3],
}

#[derive(Debug, Clone)]
pub(crate) struct CameraSlots {
    pub enabled: bool,
    pub pose_free: bool,
    pub position: [Slot; 3],
    pub quaternion: [Slot; 4],
    pub intrinsics: [Slot; INTRINSIC_PARAMS],
}

/// The frozen index map for one solve attempt.
#[derive(Debug, Clone)]
pub(crate) struct VariableLayout {
    variable_count: usize,
    initial_values: DVector<f64>,
    points: Vec<PointSlots>,
    cameras: Vec<CameraSlots>,
    /// Start column of each free quaternion block (four consecutive columns).
    quaternion_blocks: Vec<usize>,
    /// Base state supplying fixed values and non-optimized camera fields.
    base: SceneState,
}

impl VariableLayout {
    /// Build the layout for `project`, seeded from `state`.
    ///
    /// `gauge_lock` pins one extra camera pose for gauge fixing, on top of
    /// per-entity and global pose locks.
    pub fn build(
        project: &Project,
        state: &SceneState,
        options: &SolverOptions,
        gauge_lock: Option<ViewpointId>,
    ) -> Self {
        let mut initial = Vec::new();
        let mut points = Vec::with_capacity(project.points().len());

        for (i, wp) in project.points().iter().enumerate() {
            let seed = state.points[i];
            let mut xyz = [Slot::Fixed(0.0); 3];
            for axis in 0..3 {
                xyz[axis] = match wp.locked[axis] {
                    Some(v) => Slot::Fixed(v),
                    None => {
                        initial.push(seed[axis]);
                        Slot::Free(initial.len() - 1)
                    }
                };
            }
            points.push(PointSlots { xyz });
        }

        let mut cameras = Vec::with_capacity(project.viewpoints().len());
        let mut quaternion_blocks = Vec::new();
        let intrinsics_enabled = options.intrinsics_enabled();

        for (i, vp) in project.viewpoints().iter().enumerate() {
            let cam = &state.cameras[i];
            let pose_free = vp.enabled_in_solve
                && !vp.is_pose_locked
                && !options.lock_camera_poses
                && gauge_lock != Some(ViewpointId(i));

            let mut position = [Slot::Fixed(0.0); 3];
            let mut quaternion = [Slot::Fixed(0.0); 4];
            let mut intrinsics = [Slot::Fixed(0.0); INTRINSIC_PARAMS];
            let q = [cam.rotation.w, cam.rotation.i, cam.rotation.j, cam.rotation.k];
            let intr = [
                cam.focal, cam.cx, cam.cy, cam.k1, cam.k2, cam.k3, cam.p1, cam.p2,
            ];

            if pose_free {
                for axis in 0..3 {
                    initial.push(cam.position[axis]);
                    position[axis] = Slot::Free(initial.len() - 1);
                }
                quaternion_blocks.push(initial.len());
                for (k, &v) in q.iter().enumerate() {
                    initial.push(v);
                    quaternion[k] = Slot::Free(initial.len() - 1);
                }
                if intrinsics_enabled {
                    for (k, &v) in intr.iter().enumerate() {
                        initial.push(v);
                        intrinsics[k] = Slot::Free(initial.len() - 1);
                    }
                } else {
                    for (k, &v) in intr.iter().enumerate() {
                        intrinsics[k] = Slot::Fixed(v);
                    }
                }
            } else {
                for axis in 0..3 {
                    position[axis] = Slot::Fixed(cam.position[axis]);
                }
                for (k, &v) in q.iter().enumerate() {
                    quaternion[k] = Slot::Fixed(v);
                }
                for (k, &v) in intr.iter().enumerate() {
                    intrinsics[k] = Slot::Fixed(v);
                }
            }

            cameras.push(CameraSlots {
                enabled: vp.enabled_in_solve,
                pose_free,
                position,
                quaternion,
                intrinsics,
            });
        }

        Self {
            variable_count: initial.len(),
            initial_values: DVector::from_vec(initial),
            points,
            cameras,
            quaternion_blocks,
            base: state.clone(),
        }
    }

    pub fn variable_count(&self) -> usize {
        self.variable_count
    }

    pub fn initial_values(&self) -> DVector<f64> {
        self.initial_values.clone()
    }

    pub fn point_slots(&self, point: usize) -> &PointSlots {
        &self.points[point]
    }

    pub fn camera_slots(&self, camera: usize) -> &CameraSlots {
        &self.cameras[camera]
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn point_position(&self, point: usize, x: &DVector<f64>) -> Vector3<f64> {
        let s = &self.points[point].xyz;
        Vector3::new(s[0].value(x), s[1].value(x), s[2].value(x))
    }

    /// Materialize camera `i` at the current iterate. Non-optimized fields
    /// (aspect ratio, skew, reflection) come from the base state.
    pub fn camera_at(&self, camera: usize, x: &DVector<f64>) -> CameraParams<f64> {
        let base = &self.base.cameras[camera];
        let s = &self.cameras[camera];
        CameraParams {
            focal: s.intrinsics[0].value(x),
            aspect_ratio: base.aspect_ratio,
            cx: s.intrinsics[1].value(x),
            cy: s.intrinsics[2].value(x),
            skew: base.skew,
            k1: s.intrinsics[3].value(x),
            k2: s.intrinsics[4].value(x),
            k3: s.intrinsics[5].value(x),
            p1: s.intrinsics[6].value(x),
            p2: s.intrinsics[7].value(x),
            position: Vector3::new(
                s.position[0].value(x),
                s.position[1].value(x),
                s.position[2].value(x),
            ),
            rotation: Quaternion::new(
                s.quaternion[0].value(x),
                s.quaternion[1].value(x),
                s.quaternion[2].value(x),
                s.quaternion[3].value(x),
            ),
            z_reflected: base.z_reflected,
        }
    }

    /// Scale every free quaternion block back to unit magnitude, in place.
    /// Called after each accepted LM step.
    pub fn renormalize_quaternions(&self, x: &mut DVector<f64>) {
        for &start in &self.quaternion_blocks {
            let norm = (x[start] * x[start]
                + x[start + 1] * x[start + 1]
                + x[start + 2] * x[start + 2]
                + x[start + 3] * x[start + 3])
                .sqrt();
            if norm > f64::EPSILON {
                for k in 0..4 {
                    x[start + k] /= norm;
                }
            }
        }
    }

    /// The scene state at iterate `x`.
    pub fn to_state(&self, x: &DVector<f64>) -> SceneState {
        let mut state = self.base.clone();
        for (i, point) in state.points.iter_mut().enumerate() {
            *point = self.point_position(i, x);
        }
        for (i, cam) in state.cameras.iter_mut().enumerate() {
            *cam = self.camera_at(i, x);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point2;
    use parallax_types::{Viewpoint, WorldPoint};

    fn two_point_one_camera_project() -> Project {
        let mut project = Project::new("layout");
        let mut locked = WorldPoint::new("locked");
        locked.lock_to(Vector3::new(1.0, 2.0, 3.0));
        project.add_point(locked);
        let mut partial = WorldPoint::new("partial");
        partial.locked[2] = Some(-1.0);
        partial.optimized = Vector3::new(0.5, 0.25, 99.0);
        let p = project.add_point(partial);
        let v = project.add_viewpoint(Viewpoint::new("cam", 640, 480));
        project.add_image_point(p, v, Point2::new(10.0, 10.0));
        project
    }

    #[test]
    fn counts_and_masks_follow_locks() {
        let project = two_point_one_camera_project();
        let state = SceneState::from_project(&project);
        let options = SolverOptions::default();
        let layout = VariableLayout::build(&project, &state, &options, None);
        // 0 free axes + 2 free axes + camera (3 + 4 + 8)
        assert_eq!(layout.variable_count(), 2 + 3 + 4 + 8);
        assert!(layout.point_slots(0).xyz.iter().all(|s| s.column().is_none()));
        assert_eq!(layout.point_slots(1).xyz[2], Slot::Fixed(-1.0));
        let x = layout.initial_values();
        assert_eq!(layout.point_position(0, &x), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(layout.point_position(1, &x), Vector3::new(0.5, 0.25, -1.0));
    }

    #[test]
    fn pose_lock_variants_fix_camera_columns() {
        let project = two_point_one_camera_project();
        let state = SceneState::from_project(&project);

        let mut options = SolverOptions::default();
        options.lock_camera_poses = true;
        let layout = VariableLayout::build(&project, &state, &options, None);
        assert_eq!(layout.variable_count(), 2);
        assert!(!layout.camera_slots(0).pose_free);

        let options = SolverOptions::default();
        let layout = VariableLayout::build(&project, &state, &options, Some(ViewpointId(0)));
        assert_eq!(layout.variable_count(), 2);
    }

    #[test]
    fn intrinsics_columns_follow_option() {
        let project = two_point_one_camera_project();
        let state = SceneState::from_project(&project);
        let mut options = SolverOptions::default();
        options.optimize_intrinsics = Some(false);
        let layout = VariableLayout::build(&project, &state, &options, None);
        assert_eq!(layout.variable_count(), 2 + 3 + 4);
        assert!(layout.camera_slots(0).intrinsics.iter().all(|s| s.column().is_none()));
    }

    #[test]
    fn quaternion_renormalization_hits_unit_norm() {
        let project = two_point_one_camera_project();
        let state = SceneState::from_project(&project);
        let options = SolverOptions::default();
        let layout = VariableLayout::build(&project, &state, &options, None);
        let mut x = layout.initial_values();
        // Perturb the quaternion block away from unit norm.
        let qs = layout.camera_slots(0).quaternion[0].column().unwrap();
        x[qs] = 1.3;
        x[qs + 2] = -0.4;
        layout.renormalize_quaternions(&mut x);
        let cam = layout.camera_at(0, &x);
        let n = cam.rotation.norm();
        assert!((n - 1.0).abs() < 1e-12);
    }

    #[test]
    fn round_trip_to_state() {
        let project = two_point_one_camera_project();
        let state = SceneState::from_project(&project);
        let options = SolverOptions::default();
        let layout = VariableLayout::build(&project, &state, &options, None);
        let x = layout.initial_values();
        let state2 = layout.to_state(&x);
        assert_eq!(state2.points[1], Vector3::new(0.5, 0.25, -1.0));
        assert_eq!(state2.cameras[0].position, state.cameras[0].position);
    }
}
