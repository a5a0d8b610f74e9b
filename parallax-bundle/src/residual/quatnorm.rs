//! Soft unit-norm residual `|q|^2 - 1` for every free quaternion block.
//!
//! Together with the post-step renormalization in the LM driver this keeps
//! quaternion magnitudes bounded without the gradient discontinuity of a
//! hard projection.

use nalgebra::DVector;
use parallax_mvg::quat;
use parallax_types::{EntityRef, ViewpointId};

use crate::layout::VariableLayout;
use crate::residual::ResidualProvider;

pub(crate) struct QuaternionNormProvider {
    camera: usize,
    columns: Vec<usize>,
    sources: [EntityRef; 1],
}

impl QuaternionNormProvider {
    /// `None` when the camera's quaternion is not free.
    pub fn new(layout: &VariableLayout, camera: ViewpointId) -> Option<Self> {
        let slots = layout.camera_slots(camera.0);
        let columns: Vec<usize> = slots.quaternion.iter().filter_map(|s| s.column()).collect();
        if columns.len() != 4 {
            return None;
        }
        Some(Self {
            camera: camera.0,
            columns,
            sources: [EntityRef::Viewpoint(camera)],
        })
    }
}

impl ResidualProvider for QuaternionNormProvider {
    fn residual_count(&self) -> usize {
        1
    }

    fn columns(&self) -> &[usize] {
        &self.columns
    }

    fn sources(&self) -> &[EntityRef] {
        &self.sources
    }

    fn evaluate(
        &self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        residuals: &mut [f64],
        jacobian: Option<&mut [f64]>,
    ) -> bool {
        let q = layout.camera_at(self.camera, x).rotation;
        residuals[0] = quat::unit_norm_residual(&q);
        if let Some(jac) = jacobian {
            // The four quaternion columns are assigned consecutively, so the
            // sorted column order is (w, x, y, z).
            jac.copy_from_slice(&quat::unit_norm_gradient(&q));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::tests_support::{check_provider_jacobian, simple_two_camera_project};
    use crate::state::SceneState;
    use parallax_types::SolverOptions;

    #[test]
    fn residual_is_zero_at_unit_norm() {
        let project = simple_two_camera_project();
        let state = SceneState::from_project(&project);
        let layout = VariableLayout::build(&project, &state, &SolverOptions::default(), None);
        let provider = QuaternionNormProvider::new(&layout, ViewpointId(0)).unwrap();
        let x = layout.initial_values();
        let mut r = [0.0];
        assert!(provider.evaluate(&layout, &x, &mut r, None));
        approx::assert_abs_diff_eq!(r[0], 0.0, epsilon = 1e-12);
        check_provider_jacobian(&provider, &layout, 1e-7, 1e-6);
    }

    #[test]
    fn absent_for_locked_pose() {
        let project = simple_two_camera_project();
        let state = SceneState::from_project(&project);
        let mut options = SolverOptions::default();
        options.lock_camera_poses = true;
        let layout = VariableLayout::build(&project, &state, &options, None);
        assert!(QuaternionNormProvider::new(&layout, ViewpointId(0)).is_none());
    }
}
