//! Central-difference Jacobians, kept exclusively as a test oracle.
//!
//! Production code differentiates analytically; these helpers exist so tests
//! can verify every provider's Jacobian block against finite differences.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::projection::{CameraParams, INTRINSIC_PARAMS};

/// Central-difference Jacobian of `f` at `x` with step `h`.
///
/// Returns `None` if `f` fails to evaluate at any perturbed point.
pub fn numerical_jacobian<F>(f: F, x: &DVector<f64>, h: f64) -> Option<DMatrix<f64>>
where
    F: Fn(&DVector<f64>) -> Option<DVector<f64>>,
{
    let base = f(x)?;
    let mut jac = DMatrix::zeros(base.len(), x.len());
    let mut probe = x.clone();
    for col in 0..x.len() {
        probe[col] = x[col] + h;
        let plus = f(&probe)?;
        probe[col] = x[col] - h;
        let minus = f(&probe)?;
        probe[col] = x[col];
        let d = (plus - minus) / (2.0 * h);
        jac.set_column(col, &d);
    }
    Some(jac)
}

/// Agreement metrics between an analytic and a numeric Jacobian.
#[derive(Debug, Clone, Copy)]
pub struct JacobianComparison {
    /// `|Ja - Jn|_F / |Jn|_F`.
    pub frobenius_relative_error: f64,
    /// Worst per-entry `|a - n| / max(|n|, 1)`.
    pub worst_relative_error: f64,
}

pub fn compare_jacobians(analytic: &DMatrix<f64>, numeric: &DMatrix<f64>) -> JacobianComparison {
    let diff = analytic - numeric;
    let denom = numeric.norm().max(f64::MIN_POSITIVE);
    let mut worst = 0.0f64;
    for (a, n) in analytic.iter().zip(numeric.iter()) {
        worst = worst.max((a - n).abs() / n.abs().max(1.0));
    }
    JacobianComparison {
        frobenius_relative_error: diff.norm() / denom,
        worst_relative_error: worst,
    }
}

/// Number of scalars [`compare_projection_jacobian`] perturbs: world point,
/// camera position, quaternion, and the optimizable intrinsics.
const PROJECTION_PARAMS: usize = 3 + 3 + 4 + INTRINSIC_PARAMS;

fn pack(cam: &CameraParams<f64>, world: &Vector3<f64>) -> DVector<f64> {
    let mut x = DVector::zeros(PROJECTION_PARAMS);
    x.rows_mut(0, 3).copy_from(world);
    x.rows_mut(3, 3).copy_from(&cam.position);
    x[6] = cam.rotation.w;
    x[7] = cam.rotation.i;
    x[8] = cam.rotation.j;
    x[9] = cam.rotation.k;
    x[10] = cam.focal;
    x[11] = cam.cx;
    x[12] = cam.cy;
    x[13] = cam.k1;
    x[14] = cam.k2;
    x[15] = cam.k3;
    x[16] = cam.p1;
    x[17] = cam.p2;
    x
}

fn unpack(template: &CameraParams<f64>, x: &DVector<f64>) -> (CameraParams<f64>, Vector3<f64>) {
    let mut cam = template.clone();
    let world = Vector3::new(x[0], x[1], x[2]);
    cam.position = Vector3::new(x[3], x[4], x[5]);
    cam.rotation = nalgebra::Quaternion::new(x[6], x[7], x[8], x[9]);
    cam.focal = x[10];
    cam.cx = x[11];
    cam.cy = x[12];
    cam.k1 = x[13];
    cam.k2 = x[14];
    cam.k3 = x[15];
    cam.p1 = x[16];
    cam.p2 = x[17];
    (cam, world)
}

/// Differentiate the projection numerically over every parameter the solver
/// can free and compare against [`CameraParams::project_with_jacobian`].
///
/// `None` when the point does not project from the base state or from a
/// perturbed state (the analytic block is undefined there too).
pub fn compare_projection_jacobian(
    cam: &CameraParams<f64>,
    world: &Vector3<f64>,
    h: f64,
) -> Option<JacobianComparison> {
    let (_, analytic_blocks) = cam.project_with_jacobian(world)?;

    let mut analytic = DMatrix::zeros(2, PROJECTION_PARAMS);
    analytic.view_mut((0, 0), (2, 3)).copy_from(&analytic_blocks.point);
    analytic
        .view_mut((0, 3), (2, 3))
        .copy_from(&analytic_blocks.position);
    analytic
        .view_mut((0, 6), (2, 4))
        .copy_from(&analytic_blocks.quaternion);
    for (i, g) in analytic_blocks.intrinsics.iter().enumerate() {
        analytic.view_mut((0, 10 + i), (2, 1)).copy_from(g);
    }

    let x0 = pack(cam, world);
    let numeric = numerical_jacobian(
        |x| {
            let (cam, world) = unpack(cam, x);
            cam.project(&world).map(|px| DVector::from_column_slice(&[px.x, px.y]))
        },
        &x0,
        h,
    )?;

    Some(compare_jacobians(&analytic, &numeric))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numerical_jacobian_of_quadratic() {
        let f = |x: &DVector<f64>| Some(DVector::from_column_slice(&[x[0] * x[0] + x[1] * 3.0]));
        let x = DVector::from_column_slice(&[2.0, 5.0]);
        let jac = numerical_jacobian(f, &x, 1e-6).unwrap();
        approx::assert_relative_eq!(jac[(0, 0)], 4.0, epsilon = 1e-6);
        approx::assert_relative_eq!(jac[(0, 1)], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn failing_evaluation_propagates() {
        let f = |x: &DVector<f64>| {
            if x[0] > 1.0 {
                None
            } else {
                Some(x.clone())
            }
        };
        let x = DVector::from_column_slice(&[1.0]);
        assert!(numerical_jacobian(f, &x, 1e-3).is_none());
    }
}
