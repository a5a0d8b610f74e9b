//! Perspective-n-Point: camera pose from 3D-2D correspondences.
//!
//! Two stages, in the DLT-then-refine shape: a linear estimate of `[R | t]`
//! over normalized image coordinates when at least six correspondences are
//! available, followed by damped Gauss-Newton on the full reprojection error.
//! With four or five correspondences the linear stage is skipped and
//! refinement starts from the camera's current pose.

use nalgebra::{DMatrix, Matrix3, Quaternion, SMatrix, SVector, Vector3};

use crate::projection::CameraParams;
use crate::{quat, Correspondence, MvgError, Result};

/// Minimum correspondences for any pose estimate.
pub const MIN_PNP_POINTS: usize = 4;
/// Minimum correspondences for the linear DLT stage.
pub const MIN_DLT_POINTS: usize = 6;

/// Estimate the pose of `template` from `points`.
///
/// Intrinsics, `z_reflected`, and image geometry are taken from `template`;
/// only position and rotation are replaced. Fails with
/// [`MvgError::NotEnoughPoints`] below four correspondences and with
/// [`MvgError::DegenerateConfiguration`] when refinement cannot reduce the
/// system (all points collinear, for example).
pub fn solve_pnp(template: &CameraParams<f64>, points: &[Correspondence]) -> Result<CameraParams<f64>> {
    if points.len() < MIN_PNP_POINTS {
        return Err(MvgError::NotEnoughPoints);
    }

    let mut cam = template.clone();
    if points.len() >= MIN_DLT_POINTS {
        if let Ok((rotation, position)) = dlt_pose(template, points) {
            cam.rotation = rotation;
            cam.position = position;
        }
    }

    refine_pose(&mut cam, points, 30)?;
    Ok(cam)
}

/// Linear `[R | t]` estimate over normalized coordinates.
fn dlt_pose(
    template: &CameraParams<f64>,
    points: &[Correspondence],
) -> Result<(Quaternion<f64>, Vector3<f64>)> {
    let mut a = DMatrix::zeros(points.len() * 2, 12);
    for (i, c) in points.iter().enumerate() {
        let (xn, yn) = template.normalized_from_pixel(&c.pixel);
        let p = c.world;
        let row = 2 * i;
        // m1 . [P;1] - xn * m3 . [P;1] = 0
        for (j, &v) in [p.x, p.y, p.z, 1.0].iter().enumerate() {
            a[(row, j)] = v;
            a[(row, 8 + j)] = -xn * v;
            a[(row + 1, 4 + j)] = v;
            a[(row + 1, 8 + j)] = -yn * v;
        }
    }

    let svd = a.svd(false, true);
    let vt = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let h = vt.row(vt.nrows() - 1);
    let mut m = SMatrix::<f64, 3, 4>::zeros();
    for r in 0..3 {
        for c in 0..4 {
            m[(r, c)] = h[r * 4 + c];
        }
    }

    // Resolve the global sign so depths match the camera handedness: a
    // regular camera sees positive depths, a z-reflected one negative.
    let want_positive = !template.z_reflected;
    let mut depth_sum = 0.0;
    for c in points {
        depth_sum += m[(2, 0)] * c.world.x + m[(2, 1)] * c.world.y + m[(2, 2)] * c.world.z + m[(2, 3)];
    }
    let flip = if (depth_sum > 0.0) != want_positive { -1.0 } else { 1.0 };
    let m = m * flip;

    let a3 = Matrix3::new(
        m[(0, 0)], m[(0, 1)], m[(0, 2)],
        m[(1, 0)], m[(1, 1)], m[(1, 2)],
        m[(2, 0)], m[(2, 1)], m[(2, 2)],
    );
    let b = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);

    // Nearest rotation to the (scaled) linear block.
    let svd = a3.svd(true, true);
    let (u, v_t) = (svd.u.ok_or(MvgError::SvdFailed)?, svd.v_t.ok_or(MvgError::SvdFailed)?);
    let scale = svd.singular_values.mean();
    if scale <= 1e-14 {
        return Err(MvgError::DegenerateConfiguration("zero-scale DLT solution"));
    }
    let det = (u * v_t).determinant();
    let r_eff = u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, det.signum())) * v_t;
    let t = b / scale;

    let position = -(r_eff.transpose() * t);
    Ok((quat::from_rotation_matrix(&r_eff), position))
}

/// Damped Gauss-Newton over position and quaternion (7 scalars, with a
/// unit-norm row keeping the quaternion bounded). Mutates `cam` in place.
pub fn refine_pose(
    cam: &mut CameraParams<f64>,
    points: &[Correspondence],
    max_iterations: usize,
) -> Result<()> {
    const NORM_WEIGHT: f64 = 1e3;
    let mut lambda = 1e-4;
    let mut last_cost = pose_cost(cam, points);

    for _ in 0..max_iterations {
        let mut jtj = SMatrix::<f64, 7, 7>::zeros();
        let mut jtr = SVector::<f64, 7>::zeros();
        let mut any = false;
        for c in points {
            let Some((pixel, jac)) = cam.project_with_jacobian(&c.world.coords) else {
                continue;
            };
            any = true;
            let r = pixel - c.pixel.coords;
            for row in 0..2 {
                let mut j_row = SVector::<f64, 7>::zeros();
                for k in 0..3 {
                    j_row[k] = jac.position[(row, k)];
                }
                for k in 0..4 {
                    j_row[3 + k] = jac.quaternion[(row, k)];
                }
                jtj += j_row * j_row.transpose();
                jtr += j_row * r[row];
            }
        }
        if !any {
            return Err(MvgError::NoValidCandidate);
        }

        // soft unit-norm row
        let qn = quat::unit_norm_residual(&cam.rotation) * NORM_WEIGHT;
        let qg = quat::unit_norm_gradient(&cam.rotation);
        let mut j_row = SVector::<f64, 7>::zeros();
        for k in 0..4 {
            j_row[3 + k] = qg[k] * NORM_WEIGHT;
        }
        jtj += j_row * j_row.transpose();
        jtr += j_row * qn;

        for k in 0..7 {
            jtj[(k, k)] *= 1.0 + lambda;
        }
        let Some(delta) = jtj.cholesky().map(|ch| ch.solve(&(-jtr))) else {
            return Err(MvgError::SingularSystem);
        };

        let mut trial = cam.clone();
        trial.position += Vector3::new(delta[0], delta[1], delta[2]);
        trial.rotation = Quaternion::new(
            trial.rotation.w + delta[3],
            trial.rotation.i + delta[4],
            trial.rotation.j + delta[5],
            trial.rotation.k + delta[6],
        );
        trial.rotation = quat::normalized(&trial.rotation);

        let cost = pose_cost(&trial, points);
        if cost < last_cost {
            *cam = trial;
            if last_cost - cost < 1e-14 * last_cost.max(1.0) {
                last_cost = cost;
                break;
            }
            last_cost = cost;
            lambda = (lambda * 0.5).max(1e-12);
        } else {
            lambda *= 4.0;
            if lambda > 1e12 {
                break;
            }
        }
    }
    if !last_cost.is_finite() {
        return Err(MvgError::DegenerateConfiguration("non-finite refinement cost"));
    }
    Ok(())
}

/// Summed squared reprojection error; points that fail to project are charged
/// a large constant so refinement is pushed away from such poses.
pub fn pose_cost(cam: &CameraParams<f64>, points: &[Correspondence]) -> f64 {
    const BEHIND_PENALTY: f64 = 1e8;
    points
        .iter()
        .map(|c| match cam.project(&c.world.coords) {
            Some(px) => (px - c.pixel.coords).norm_squared(),
            None => BEHIND_PENALTY,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point2, Point3};

    fn ground_truth_camera() -> CameraParams<f64> {
        CameraParams {
            focal: 1000.0,
            aspect_ratio: 1.0,
            cx: 640.0,
            cy: 360.0,
            skew: 0.0,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
            position: Vector3::new(1.0, -0.5, -6.0),
            rotation: quat::normalized(&Quaternion::new(0.95, 0.1, -0.2, 0.05)),
            z_reflected: false,
        }
    }

    fn synthetic_points(cam: &CameraParams<f64>, n: usize) -> Vec<Correspondence> {
        let worlds = [
            (0.0, 0.0, 0.0),
            (1.0, 0.0, 0.2),
            (0.0, 1.0, -0.3),
            (1.0, 1.0, 0.5),
            (-1.0, 0.5, 0.8),
            (0.5, -1.0, -0.6),
            (-0.7, -0.9, 0.4),
            (1.3, 0.4, -0.8),
        ];
        worlds[..n]
            .iter()
            .map(|&(x, y, z)| {
                let world = Point3::new(x, y, z);
                let px = cam.project(&world.coords).unwrap();
                Correspondence {
                    world,
                    pixel: Point2::new(px.x, px.y),
                }
            })
            .collect()
    }

    #[test]
    fn too_few_points_is_an_error() {
        let truth = ground_truth_camera();
        let points = synthetic_points(&truth, 3);
        assert_eq!(
            solve_pnp(&truth, &points).unwrap_err(),
            MvgError::NotEnoughPoints
        );
    }

    #[test]
    fn recovers_pose_from_eight_points() {
        let truth = ground_truth_camera();
        let points = synthetic_points(&truth, 8);
        let mut template = truth.clone();
        template.position = Vector3::zeros();
        template.rotation = Quaternion::new(1.0, 0.0, 0.0, 0.0);
        let solved = solve_pnp(&template, &points).unwrap();
        approx::assert_relative_eq!(solved.position, truth.position, epsilon = 1e-6);
        approx::assert_relative_eq!(
            quat::rotation_matrix(&solved.rotation),
            quat::rotation_matrix(&truth.rotation),
            epsilon = 1e-6
        );
    }

    #[test]
    fn refines_from_nearby_pose_with_four_points() {
        let truth = ground_truth_camera();
        let points = synthetic_points(&truth, 4);
        let mut template = truth.clone();
        template.position += Vector3::new(0.05, -0.04, 0.08);
        let solved = solve_pnp(&template, &points).unwrap();
        assert!(pose_cost(&solved, &points) < 1e-10);
    }

    #[test]
    fn recovers_z_reflected_pose() {
        let mut truth = ground_truth_camera();
        truth.z_reflected = true;
        truth.position.z = 6.0;
        let points = synthetic_points(&truth, 8);
        let mut template = truth.clone();
        template.position = Vector3::zeros();
        template.rotation = Quaternion::new(1.0, 0.0, 0.0, 0.0);
        let solved = solve_pnp(&template, &points).unwrap();
        assert!(pose_cost(&solved, &points) < 1e-8);
    }
}
