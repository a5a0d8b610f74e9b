//! Linear triangulation of a world point from two or more calibrated views.
//!
//! Two interchangeable methods: ray midpoint (symmetric 3x3 normal equations
//! solved by a dense Cholesky) and homogeneous DLT (SVD of the stacked
//! projection equations). Both accept a result only when the point lands in
//! front of every observing camera.

use nalgebra::{DMatrix, Matrix3, Point2, Vector3};

use crate::projection::CameraParams;
use crate::{MvgError, Result};

/// A world-space ray: `origin + s * dir`, `dir` unit length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vector3<f64>,
    pub dir: Vector3<f64>,
}

/// Lower Cholesky factor of a symmetric positive-definite 3x3 matrix.
pub fn cholesky3(a: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let mut l = Matrix3::zeros();
    for i in 0..3 {
        for j in 0..=i {
            let mut sum = a[(i, j)];
            for k in 0..j {
                sum -= l[(i, k)] * l[(j, k)];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[(i, i)] = sum.sqrt();
            } else {
                l[(i, j)] = sum / l[(j, j)];
            }
        }
    }
    Some(l)
}

/// Solve `a x = b` for symmetric positive-definite `a` via [`cholesky3`].
pub fn solve_symmetric3(a: &Matrix3<f64>, b: &Vector3<f64>) -> Option<Vector3<f64>> {
    let l = cholesky3(a)?;
    // forward substitution: l y = b
    let mut y = Vector3::zeros();
    for i in 0..3 {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[(i, k)] * y[k];
        }
        y[i] = sum / l[(i, i)];
    }
    // back substitution: l^T x = y
    let mut x = Vector3::zeros();
    for i in (0..3).rev() {
        let mut sum = y[i];
        for k in (i + 1)..3 {
            sum -= l[(k, i)] * x[k];
        }
        x[i] = sum / l[(i, i)];
    }
    Some(x)
}

/// The point minimizing the summed squared distance to all rays.
pub fn triangulate_midpoint(rays: &[Ray]) -> Result<Vector3<f64>> {
    if rays.len() < 2 {
        return Err(MvgError::NotEnoughPoints);
    }
    let mut a = Matrix3::zeros();
    let mut b = Vector3::zeros();
    for ray in rays {
        let proj = Matrix3::identity() - ray.dir * ray.dir.transpose();
        a += proj;
        b += proj * ray.origin;
    }
    solve_symmetric3(&a, &b).ok_or(MvgError::SingularSystem)
}

/// Triangulate one world point from pixel observations in several cameras.
///
/// Rays are cast through the undistorted pixels and intersected at the
/// midpoint; when the midpoint normal equations are singular (near-parallel
/// rays) the homogeneous DLT is tried instead. The result must be in front
/// of every observing camera (cheirality), otherwise
/// [`MvgError::NoValidCandidate`].
pub fn triangulate_observations(
    observations: &[(&CameraParams<f64>, Point2<f64>)],
) -> Result<Vector3<f64>> {
    let rays: Vec<Ray> = observations
        .iter()
        .filter_map(|(cam, px)| cam.pixel_to_world_ray(px))
        .collect();
    if rays.len() < 2 {
        return Err(MvgError::NotEnoughPoints);
    }
    let point = match triangulate_midpoint(&rays) {
        Ok(point) => point,
        Err(MvgError::SingularSystem) => return triangulate_dlt(observations),
        Err(err) => return Err(err),
    };
    for (cam, _) in observations {
        if cam.camera_frame(&point).z <= 0.0 {
            return Err(MvgError::NoValidCandidate);
        }
    }
    Ok(point)
}

/// Homogeneous DLT triangulation over the linearized (distortion-free)
/// projection matrices. Used when observations are already undistorted.
pub fn triangulate_dlt(
    observations: &[(&CameraParams<f64>, Point2<f64>)],
) -> Result<Vector3<f64>> {
    if observations.len() < 2 {
        return Err(MvgError::NotEnoughPoints);
    }
    let mut a = DMatrix::zeros(observations.len() * 2, 4);
    for (i, (cam, px)) in observations.iter().enumerate() {
        let p = cam.linear_projection_matrix();
        let (xn, yn) = cam.normalized_from_pixel(px);
        for c in 0..4 {
            a[(2 * i, c)] = xn * p[(2, c)] - p[(0, c)];
            a[(2 * i + 1, c)] = yn * p[(2, c)] - p[(1, c)];
        }
    }
    let svd = a.svd(false, true);
    let vt = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let h = vt.row(vt.nrows() - 1);
    if h[3].abs() < 1e-14 {
        return Err(MvgError::DegenerateConfiguration("point at infinity"));
    }
    let point = Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]);
    for (cam, _) in observations {
        if cam.camera_frame(&point).z <= 0.0 {
            return Err(MvgError::NoValidCandidate);
        }
    }
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Quaternion;

    fn camera_at(position: Vector3<f64>, rotation: Quaternion<f64>) -> CameraParams<f64> {
        CameraParams {
            focal: 800.0,
            aspect_ratio: 1.0,
            cx: 320.0,
            cy: 240.0,
            skew: 0.0,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
            position,
            rotation,
            z_reflected: false,
        }
    }

    #[test]
    fn solve_symmetric3_round_trip() {
        let a = Matrix3::new(4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0);
        let x = Vector3::new(1.0, -2.0, 3.0);
        let b = a * x;
        let solved = solve_symmetric3(&a, &b).unwrap();
        approx::assert_relative_eq!(solved, x, epsilon = 1e-12);
    }

    #[test]
    fn cholesky_rejects_indefinite() {
        let a = Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0);
        assert!(cholesky3(&a).is_none());
    }

    #[test]
    fn midpoint_of_two_crossing_rays() {
        let rays = [
            Ray {
                origin: Vector3::new(-1.0, 0.0, 0.0),
                dir: Vector3::new(1.0, 0.0, 1.0).normalize(),
            },
            Ray {
                origin: Vector3::new(1.0, 0.0, 0.0),
                dir: Vector3::new(-1.0, 0.0, 1.0).normalize(),
            },
        ];
        let p = triangulate_midpoint(&rays).unwrap();
        approx::assert_relative_eq!(p, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn triangulates_synthetic_observation() {
        let cam_a = camera_at(Vector3::new(-1.0, 0.0, -5.0), Quaternion::new(1.0, 0.0, 0.0, 0.0));
        let cam_b = camera_at(Vector3::new(1.5, 0.3, -5.0), Quaternion::new(1.0, 0.0, 0.0, 0.0));
        let truth = Vector3::new(0.25, -0.4, 1.0);
        let px_a = cam_a.project(&truth).unwrap();
        let px_b = cam_b.project(&truth).unwrap();
        let obs = [
            (&cam_a, Point2::new(px_a.x, px_a.y)),
            (&cam_b, Point2::new(px_b.x, px_b.y)),
        ];
        let p = triangulate_observations(&obs).unwrap();
        approx::assert_relative_eq!(p, truth, epsilon = 1e-9);
        let p = triangulate_dlt(&obs).unwrap();
        approx::assert_relative_eq!(p, truth, epsilon = 1e-7);
    }

    #[test]
    fn behind_camera_is_rejected() {
        let cam_a = camera_at(Vector3::new(-1.0, 0.0, 5.0), Quaternion::new(1.0, 0.0, 0.0, 0.0));
        let cam_b = camera_at(Vector3::new(1.0, 0.0, 5.0), Quaternion::new(1.0, 0.0, 0.0, 0.0));
        // Both cameras look along +z from z = 5; rays through the image
        // centers are parallel, so neither the midpoint nor the DLT fallback
        // can produce a point in front of them.
        let obs = [
            (&cam_a, Point2::new(320.0, 240.0)),
            (&cam_b, Point2::new(320.0, 240.0)),
        ];
        assert!(triangulate_observations(&obs).is_err());
    }
}
