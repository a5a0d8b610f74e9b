//! Essential-matrix relative pose between two calibrated views.
//!
//! Hartley-normalized 8-point estimation over undistorted normalized image
//! coordinates, rank-2 projection with equal singular values, four-way
//! `(R, t)` decomposition, and a cheirality vote to pick the candidate that
//! puts the most correspondences in front of both cameras.

use nalgebra::{DMatrix, Matrix3, Point2, Vector3};

use crate::{MvgError, Result};

/// Minimum correspondences for the 8-point algorithm.
pub const MIN_ESSENTIAL_POINTS: usize = 8;

/// Relative pose of the second camera with respect to the first:
/// `x2 = R x1 + t`, with `t` unit length (scale is unobservable).
#[derive(Debug, Clone, PartialEq)]
pub struct RelativePose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// Correspondences that triangulated in front of both cameras.
    pub cheirality_inliers: usize,
}

/// Estimate the essential matrix from normalized-coordinate pairs
/// `(x1, x2)`, one per correspondence.
pub fn estimate_essential(pairs: &[(Point2<f64>, Point2<f64>)]) -> Result<Matrix3<f64>> {
    if pairs.len() < MIN_ESSENTIAL_POINTS {
        return Err(MvgError::NotEnoughPoints);
    }

    let t1 = normalizing_transform(pairs.iter().map(|p| p.0));
    let t2 = normalizing_transform(pairs.iter().map(|p| p.1));

    let mut a = DMatrix::zeros(pairs.len(), 9);
    for (i, (p1, p2)) in pairs.iter().enumerate() {
        let x1 = t1 * Vector3::new(p1.x, p1.y, 1.0);
        let x2 = t2 * Vector3::new(p2.x, p2.y, 1.0);
        // x2^T E x1 = 0, E flattened row-major.
        a[(i, 0)] = x2.x * x1.x;
        a[(i, 1)] = x2.x * x1.y;
        a[(i, 2)] = x2.x * x1.z;
        a[(i, 3)] = x2.y * x1.x;
        a[(i, 4)] = x2.y * x1.y;
        a[(i, 5)] = x2.y * x1.z;
        a[(i, 6)] = x2.z * x1.x;
        a[(i, 7)] = x2.z * x1.y;
        a[(i, 8)] = x2.z * x1.z;
    }

    let svd = a.svd(false, true);
    let vt = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let e = vt.row(vt.nrows() - 1);
    let e = Matrix3::new(e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7], e[8]);

    // Undo the normalization, then project onto the essential manifold
    // (two equal singular values, one zero).
    let e = t2.transpose() * e * t1;
    let svd = e.svd(true, true);
    let (u, v_t) = (
        svd.u.ok_or(MvgError::SvdFailed)?,
        svd.v_t.ok_or(MvgError::SvdFailed)?,
    );
    let s = (svd.singular_values[0] + svd.singular_values[1]) / 2.0;
    if s <= 1e-14 {
        return Err(MvgError::DegenerateConfiguration("rank-deficient point pairs"));
    }
    Ok(u * Matrix3::from_diagonal(&Vector3::new(s, s, 0.0)) * v_t)
}

/// The four `(R, t)` decompositions of an essential matrix.
pub fn decompose_essential(e: &Matrix3<f64>) -> Result<[(Matrix3<f64>, Vector3<f64>); 4]> {
    let svd = e.svd(true, true);
    let (mut u, mut v_t) = (
        svd.u.ok_or(MvgError::SvdFailed)?,
        svd.v_t.ok_or(MvgError::SvdFailed)?,
    );
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();
    Ok([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Estimate, decompose, and cheirality-test in one call.
///
/// Fails with [`MvgError::NoValidCandidate`] when no decomposition places any
/// correspondence in front of both cameras.
pub fn relative_pose(pairs: &[(Point2<f64>, Point2<f64>)]) -> Result<RelativePose> {
    let e = estimate_essential(pairs)?;
    let candidates = decompose_essential(&e)?;

    let mut best: Option<RelativePose> = None;
    for (r, t) in candidates {
        let mut in_front = 0;
        for (p1, p2) in pairs {
            if let Some((z1, z2)) = triangulate_depths(&r, &t, p1, p2) {
                if z1 > 0.0 && z2 > 0.0 {
                    in_front += 1;
                }
            }
        }
        if best.as_ref().map(|b| in_front > b.cheirality_inliers).unwrap_or(true) {
            best = Some(RelativePose {
                rotation: r,
                translation: t,
                cheirality_inliers: in_front,
            });
        }
    }

    let best = best.ok_or(MvgError::NoValidCandidate)?;
    if best.cheirality_inliers == 0 {
        return Err(MvgError::NoValidCandidate);
    }
    tracing::debug!(
        inliers = best.cheirality_inliers,
        total = pairs.len(),
        "essential-matrix cheirality vote"
    );
    Ok(best)
}

/// Depths of the midpoint triangulation of one pair under `(R, t)`:
/// camera 1 at the origin, camera 2 with `x2 = R x1 + t`.
fn triangulate_depths(
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    p1: &Point2<f64>,
    p2: &Point2<f64>,
) -> Option<(f64, f64)> {
    let d1 = Vector3::new(p1.x, p1.y, 1.0).normalize();
    // Ray of camera 2 expressed in camera-1 coordinates.
    let d2 = r.transpose() * Vector3::new(p2.x, p2.y, 1.0).normalize();
    let o2 = -(r.transpose() * t);

    // Closest point between the two rays.
    let a = d1.dot(&d1);
    let b = d1.dot(&d2);
    let c = d2.dot(&d2);
    let denom = a * c - b * b;
    if denom.abs() < 1e-14 {
        return None;
    }
    let w = -o2;
    let s = (b * d2.dot(&w) - c * d1.dot(&w)) / denom;
    let x1 = d1 * s;
    let z2 = (r * x1 + t).z;
    Some((x1.z, z2))
}

/// Hartley normalization: translate the centroid to the origin and scale the
/// mean distance to `sqrt(2)`.
fn normalizing_transform(points: impl Iterator<Item = Point2<f64>> + Clone) -> Matrix3<f64> {
    let mut n = 0usize;
    let mut mean = nalgebra::Vector2::zeros();
    for p in points.clone() {
        mean += p.coords;
        n += 1;
    }
    let mean = mean / n as f64;
    let mut scale = 0.0;
    for p in points {
        scale += (p.coords - mean).norm();
    }
    let scale = if scale > 0.0 {
        (2.0f64).sqrt() * n as f64 / scale
    } else {
        1.0
    };
    Matrix3::new(
        scale,
        0.0,
        -scale * mean.x,
        0.0,
        scale,
        -scale * mean.y,
        0.0,
        0.0,
        1.0,
    )
}
