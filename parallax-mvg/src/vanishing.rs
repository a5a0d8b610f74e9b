//! Camera pose from vanishing points of the world axes.
//!
//! Each set of image segments labeled with a world axis votes for that
//! axis's vanishing point (SVD of the homogeneous line system). Two or three
//! vanishing points give the columns of the world-to-camera rotation up to
//! per-axis sign; the focal length falls out of the orthogonality of two
//! vanishing directions when it is still at its default. Candidate rotations
//! are enumerated over three orthogonalization strategies and all sign
//! combinations, positioned from the anchor (fully locked) points, refined
//! by a translation-only Gauss-Newton, and scored.

use itertools::Itertools;
use nalgebra::{Matrix3, Point2, Vector3};

use crate::projection::CameraParams;
use crate::triangulate::solve_symmetric3;
use crate::{quat, Correspondence, MvgError, Result};

/// Score bonus for candidates whose raw (pre-orthogonalization) frame is
/// right-handed. Tunable; calibrated against the cube scenario.
pub const RIGHT_HANDED_BONUS: f64 = 3e5;

/// Score weight per anchor observation that lands in front of the camera.
pub const IN_FRONT_WEIGHT: f64 = 1e6;

/// Assumed camera distance when fewer than two usable anchors constrain the
/// position.
pub const DEFAULT_ANCHOR_DEPTH: f64 = 5.0;

/// A scored vanishing-point pose candidate.
#[derive(Debug, Clone)]
pub struct VanishingPoseEstimate {
    pub camera: CameraParams<f64>,
    pub focal_was_estimated: bool,
    pub right_handed: bool,
    pub score: f64,
}

/// The vanishing point of a set of image segments, in homogeneous pixel
/// coordinates (`z == 0` means the point is at infinity: parallel segments).
pub fn vanishing_point(segments: &[(Point2<f64>, Point2<f64>)]) -> Result<Vector3<f64>> {
    if segments.len() < 2 {
        return Err(MvgError::InsufficientVanishingData("need two segments per axis"));
    }
    let mut a = nalgebra::DMatrix::zeros(segments.len(), 3);
    for (i, (p, q)) in segments.iter().enumerate() {
        // homogeneous line through the two endpoints
        let l = Vector3::new(p.x, p.y, 1.0).cross(&Vector3::new(q.x, q.y, 1.0));
        let n = l.norm();
        if n < 1e-14 {
            return Err(MvgError::DegenerateConfiguration("zero-length vanishing segment"));
        }
        let l = l / n;
        a[(i, 0)] = l.x;
        a[(i, 1)] = l.y;
        a[(i, 2)] = l.z;
    }
    let svd = a.svd(false, true);
    let vt = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let v = vt.row(vt.nrows() - 1);
    Ok(Vector3::new(v[0], v[1], v[2]))
}

/// Focal length from the orthogonality of two finite vanishing points:
/// `(v1 - pp) . (v2 - pp) = -f^2` for perpendicular world directions.
///
/// `None` when either point is at infinity or the constraint is
/// inconsistent (non-negative dot product).
pub fn focal_from_orthogonality(
    vp1: &Vector3<f64>,
    vp2: &Vector3<f64>,
    principal: &Point2<f64>,
) -> Option<f64> {
    let dehomogenize = |v: &Vector3<f64>| {
        if v.z.abs() < 1e-12 {
            None
        } else {
            Some(nalgebra::Vector2::new(v.x / v.z, v.y / v.z))
        }
    };
    let a = dehomogenize(vp1)? - principal.coords;
    let b = dehomogenize(vp2)? - principal.coords;
    let d = a.dot(&b);
    if d >= 0.0 {
        return None;
    }
    Some((-d).sqrt())
}

/// The best-scoring pose candidate; see
/// [`solve_vanishing_pose_candidates`] for the full ranked list.
pub fn solve_vanishing_pose(
    template: &CameraParams<f64>,
    segments_per_axis: &[Vec<(Point2<f64>, Point2<f64>)>; 3],
    anchors: &[Correspondence],
    focal_at_default: bool,
) -> Result<VanishingPoseEstimate> {
    solve_vanishing_pose_candidates(template, segments_per_axis, anchors, focal_at_default, 1)?
        .into_iter()
        .next()
        .ok_or(MvgError::NoValidCandidate)
}

/// Pose a camera from its per-axis vanishing segments and anchor points,
/// returning up to `max_candidates` distinct rotations ranked by score.
///
/// `segments_per_axis` is indexed x, y, z; axes with fewer than two segments
/// are skipped, and at least two usable axes are required. `anchors` are
/// observations of fully locked world points; they fix the translation (and
/// the score). When `focal_at_default` is set and two finite vanishing
/// points exist, the focal length is re-estimated from their orthogonality.
///
/// With a single anchor the translation solve places the camera on the
/// anchor ray, so every sign variant reprojects the anchor exactly and the
/// score cannot always separate them; callers that can afford it should take
/// several candidates and let the optimizer pick the basin.
pub fn solve_vanishing_pose_candidates(
    template: &CameraParams<f64>,
    segments_per_axis: &[Vec<(Point2<f64>, Point2<f64>)>; 3],
    anchors: &[Correspondence],
    focal_at_default: bool,
    max_candidates: usize,
) -> Result<Vec<VanishingPoseEstimate>> {
    let mut vps: [Option<Vector3<f64>>; 3] = [None, None, None];
    for axis in 0..3 {
        if segments_per_axis[axis].len() >= 2 {
            vps[axis] = Some(vanishing_point(&segments_per_axis[axis])?);
        }
    }
    let available = vps.iter().flatten().count();
    if available < 2 {
        return Err(MvgError::InsufficientVanishingData(
            "need vanishing lines on at least two axes",
        ));
    }

    let mut camera = template.clone();
    let principal = Point2::new(camera.cx, camera.cy);
    let mut focal_was_estimated = false;
    if focal_at_default {
        let mut estimates: Vec<f64> = Vec::new();
        for (i, j) in (0..3).tuple_combinations() {
            if let (Some(vi), Some(vj)) = (&vps[i], &vps[j]) {
                if let Some(f) = focal_from_orthogonality(vi, vj, &principal) {
                    estimates.push(f);
                }
            }
        }
        if !estimates.is_empty() {
            estimates.sort_by(|a, b| a.total_cmp(b));
            camera.focal = estimates[estimates.len() / 2];
            focal_was_estimated = true;
            tracing::debug!(focal = camera.focal, "estimated focal from vanishing points");
        }
    }

    let k = Matrix3::new(
        camera.focal,
        camera.skew,
        camera.cx,
        0.0,
        camera.focal * camera.aspect_ratio,
        camera.cy,
        0.0,
        0.0,
        1.0,
    );
    let k_inv = k.try_inverse().ok_or(MvgError::SingularSystem)?;

    // Camera-space directions of the world axes; the missing one (if any) is
    // completed by the right-handed cross product.
    let mut dirs: [Option<Vector3<f64>>; 3] = [None, None, None];
    for axis in 0..3 {
        if let Some(vp) = &vps[axis] {
            let d = k_inv * vp;
            let n = d.norm();
            if n < 1e-14 {
                return Err(MvgError::DegenerateConfiguration("vanishing point at camera center"));
            }
            dirs[axis] = Some(d / n);
        }
    }
    let base = match (dirs[0], dirs[1], dirs[2]) {
        (Some(x), Some(y), Some(z)) => [x, y, z],
        (Some(x), Some(y), None) => [x, y, x.cross(&y)],
        (Some(x), None, Some(z)) => [x, z.cross(&x), z],
        (None, Some(y), Some(z)) => [y.cross(&z), y, z],
        _ => unreachable!("checked above: at least two axes available"),
    };

    let mut scored: Vec<VanishingPoseEstimate> = Vec::new();
    for mode in [
        Orthogonalize::Procrustes,
        Orthogonalize::FixZ,
        Orthogonalize::FixX,
    ] {
        for signs in 0..8u8 {
            let sx = if signs & 1 == 0 { 1.0 } else { -1.0 };
            let sy = if signs & 2 == 0 { 1.0 } else { -1.0 };
            let sz = if signs & 4 == 0 { 1.0 } else { -1.0 };
            let m = Matrix3::from_columns(&[base[0] * sx, base[1] * sy, base[2] * sz]);
            let right_handed = m.determinant() > 0.0;
            let Some(r) = mode.apply(&m) else { continue };

            let mut candidate = camera.clone();
            candidate.rotation = quat::from_rotation_matrix(&r);
            position_from_anchors(&mut candidate, anchors);
            refine_position(&mut candidate, anchors, 10);

            let score = score_candidate(&candidate, anchors, right_handed);
            scored.push(VanishingPoseEstimate {
                camera: candidate,
                focal_was_estimated,
                right_handed,
                score,
            });
        }
    }

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    // Different orthogonalization modes often reproduce the same rotation;
    // keep only rotationally distinct candidates.
    let mut distinct: Vec<VanishingPoseEstimate> = Vec::new();
    for estimate in scored {
        let duplicate = distinct.iter().any(|kept| {
            let d = kept.camera.rotation.coords.dot(&estimate.camera.rotation.coords);
            d.abs() > 1.0 - 1e-9
        });
        if !duplicate {
            distinct.push(estimate);
        }
        if distinct.len() >= max_candidates {
            break;
        }
    }

    if distinct.is_empty() {
        return Err(MvgError::NoValidCandidate);
    }
    Ok(distinct)
}

#[derive(Debug, Clone, Copy)]
enum Orthogonalize {
    /// Nearest rotation in the Frobenius sense.
    Procrustes,
    /// Keep the z column exact, re-derive x and y.
    FixZ,
    /// Keep the x column exact, re-derive y and z.
    FixX,
}

impl Orthogonalize {
    fn apply(&self, m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
        match self {
            Orthogonalize::Procrustes => {
                let svd = m.svd(true, true);
                let (u, v_t) = (svd.u?, svd.v_t?);
                let det = (u * v_t).determinant();
                Some(u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, det.signum())) * v_t)
            }
            Orthogonalize::FixZ => {
                let z = m.column(2).normalize();
                let x_raw = m.column(0).into_owned();
                let x = (x_raw - z * z.dot(&x_raw)).normalize();
                let y = z.cross(&x);
                Some(Matrix3::from_columns(&[x, y, z]))
            }
            Orthogonalize::FixX => {
                let x = m.column(0).normalize();
                let z_raw = m.column(2).into_owned();
                let z = (z_raw - x * x.dot(&z_raw)).normalize();
                let y = z.cross(&x);
                Some(Matrix3::from_columns(&[x, y, z]))
            }
        }
    }
}

/// Least-squares camera position from the anchor rays, in the spirit of ray
/// midpoint triangulation run backwards.
fn position_from_anchors(cam: &mut CameraParams<f64>, anchors: &[Correspondence]) {
    // Ray directions depend only on rotation and intrinsics, so the stale
    // position on `cam` is irrelevant here.
    let rays: Vec<(Vector3<f64>, Vector3<f64>)> = anchors
        .iter()
        .filter_map(|c| {
            cam.pixel_to_world_ray(&c.pixel)
                .map(|ray| (c.world.coords, ray.dir))
        })
        .collect();

    match rays.len() {
        0 => {
            // No anchors: back the camera off the origin along its optical axis.
            let forward = quat::rotate_conj(&cam.rotation, &Vector3::z());
            let forward = if cam.z_reflected { -forward } else { forward };
            cam.position = -forward * DEFAULT_ANCHOR_DEPTH;
        }
        1 => {
            let (p, d) = rays[0];
            cam.position = p - d * DEFAULT_ANCHOR_DEPTH;
        }
        _ => {
            let mut a = Matrix3::zeros();
            let mut b = Vector3::zeros();
            for (p, d) in &rays {
                let proj = Matrix3::identity() - d * d.transpose();
                a += proj;
                b += proj * p;
            }
            // Slight ridge keeps nearly-parallel ray bundles solvable.
            a += Matrix3::identity() * 1e-12;
            if let Some(pos) = solve_symmetric3(&a, &b) {
                cam.position = pos;
            } else {
                let (p, d) = rays[0];
                cam.position = p - d * DEFAULT_ANCHOR_DEPTH;
            }
        }
    }
}

/// Translation-only Gauss-Newton on the anchor reprojection error.
fn refine_position(cam: &mut CameraParams<f64>, anchors: &[Correspondence], iterations: usize) {
    for _ in 0..iterations {
        let mut jtj = Matrix3::zeros();
        let mut jtr = Vector3::zeros();
        let mut any = false;
        for c in anchors {
            let Some((pixel, jac)) = cam.project_with_jacobian(&c.world.coords) else {
                continue;
            };
            any = true;
            let r = pixel - c.pixel.coords;
            for row in 0..2 {
                let j_row = Vector3::new(
                    jac.position[(row, 0)],
                    jac.position[(row, 1)],
                    jac.position[(row, 2)],
                );
                jtj += j_row * j_row.transpose();
                jtr += j_row * r[row];
            }
        }
        if !any {
            return;
        }
        jtj += Matrix3::identity() * 1e-9;
        let Some(delta) = solve_symmetric3(&jtj, &(-jtr)) else {
            return;
        };
        cam.position += delta;
        if delta.norm() < 1e-12 {
            return;
        }
    }
}

fn score_candidate(cam: &CameraParams<f64>, anchors: &[Correspondence], right_handed: bool) -> f64 {
    let mut score = if right_handed { RIGHT_HANDED_BONUS } else { 0.0 };
    for c in anchors {
        if let Some(px) = cam.project(&c.world.coords) {
            score += IN_FRONT_WEIGHT;
            score -= (px - c.pixel.coords).norm();
        }
    }
    score
}
