//! Reprojection residual: projected minus observed pixel, two rows per
//! image point.

use nalgebra::{DVector, Vector2};
use parallax_mvg::projection::INTRINSIC_PARAMS;
use parallax_types::EntityRef;

use crate::layout::VariableLayout;
use crate::residual::{local_index, sorted_columns, ResidualProvider};

pub(crate) struct ReprojectionProvider {
    point: usize,
    camera: usize,
    observed: Vector2<f64>,
    columns: Vec<usize>,
    sources: [EntityRef; 3],
    point_local: [Option<usize>; 3],
    position_local: [Option<usize>; 3],
    quaternion_local: [Option<usize>; 4],
    intrinsics_local: [Option<usize>; INTRINSIC_PARAMS],
}

impl ReprojectionProvider {
    pub fn new(
        layout: &VariableLayout,
        image_point: parallax_types::ImagePointId,
        point: parallax_types::PointId,
        camera: parallax_types::ViewpointId,
        observed: Vector2<f64>,
    ) -> Self {
        let point_slots = layout.point_slots(point.0);
        let cam_slots = layout.camera_slots(camera.0);

        let mut cols = Vec::new();
        cols.extend(point_slots.xyz.iter().filter_map(|s| s.column()));
        cols.extend(cam_slots.position.iter().filter_map(|s| s.column()));
        cols.extend(cam_slots.quaternion.iter().filter_map(|s| s.column()));
        cols.extend(cam_slots.intrinsics.iter().filter_map(|s| s.column()));
        let columns = sorted_columns(cols);

        let local = |col: Option<usize>| col.map(|c| local_index(&columns, c));
        let point_local = std::array::from_fn(|i| local(point_slots.xyz[i].column()));
        let position_local = std::array::from_fn(|i| local(cam_slots.position[i].column()));
        let quaternion_local = std::array::from_fn(|i| local(cam_slots.quaternion[i].column()));
        let intrinsics_local = std::array::from_fn(|i| local(cam_slots.intrinsics[i].column()));

        Self {
            point: point.0,
            camera: camera.0,
            observed,
            columns,
            sources: [
                EntityRef::ImagePoint(image_point),
                EntityRef::Point(point),
                EntityRef::Viewpoint(camera),
            ],
            point_local,
            position_local,
            quaternion_local,
            intrinsics_local,
        }
    }
}

impl ResidualProvider for ReprojectionProvider {
    fn residual_count(&self) -> usize {
        2
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
        let cam = layout.camera_at(self.camera, x);
        let world = layout.point_position(self.point, x);

        let Some(jac_buf) = jacobian else {
            // Residual-only evaluation.
            let Some(pixel) = cam.project(&world) else {
                return false;
            };
            residuals[0] = pixel.x - self.observed.x;
            residuals[1] = pixel.y - self.observed.y;
            return true;
        };

        let Some((pixel, jac)) = cam.project_with_jacobian(&world) else {
            return false;
        };
        residuals[0] = pixel.x - self.observed.x;
        residuals[1] = pixel.y - self.observed.y;

        let ncols = self.columns.len();
        for row in 0..2 {
            let dst = &mut jac_buf[row * ncols..(row + 1) * ncols];
            for axis in 0..3 {
                if let Some(local) = self.point_local[axis] {
                    dst[local] += jac.point[(row, axis)];
                }
                if let Some(local) = self.position_local[axis] {
                    dst[local] += jac.position[(row, axis)];
                }
            }
            for k in 0..4 {
                if let Some(local) = self.quaternion_local[k] {
                    dst[local] += jac.quaternion[(row, k)];
                }
            }
            for k in 0..INTRINSIC_PARAMS {
                if let Some(local) = self.intrinsics_local[k] {
                    dst[local] += jac.intrinsics[k][row];
                }
            }
        }
        true
    }
}
