//! Similarity (7-DOF) alignment of a reconstruction onto locked points.
//!
//! Initialization recovers structure only up to a rigid transform plus a
//! uniform scale. The Kabsch-Umeyama solution below finds the similarity
//! minimizing the L2 error against the fully locked world points, and is then
//! applied to every estimated point and camera pose.

use nalgebra::{Matrix3, Vector3};

use crate::projection::CameraParams;
use crate::{quat, MvgError, Result};

/// A similarity transform `x' = scale * rotation * x + translation`.
#[derive(Debug, Clone, PartialEq)]
pub struct Similarity {
    pub scale: f64,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Similarity {
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn apply_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p * self.scale + self.translation
    }

    /// Transform a camera pose so projections of transformed points are
    /// unchanged: the center moves with the similarity, the world-to-camera
    /// rotation absorbs the inverse rotation. Scale does not touch
    /// intrinsics.
    pub fn apply_camera(&self, cam: &CameraParams<f64>) -> CameraParams<f64> {
        let mut out = cam.clone();
        out.position = self.apply_point(&cam.position);
        let r_wc = quat::rotation_matrix(&quat::normalized(&cam.rotation));
        out.rotation = quat::from_rotation_matrix(&(r_wc * self.rotation.transpose()));
        out
    }
}

/// Kabsch-Umeyama: the similarity minimizing `sum |s R from_i + t - to_i|^2`.
///
/// Needs at least two point pairs for scale and three non-collinear pairs
/// for a unique rotation; with two pairs the rotation is the minimum-norm
/// choice from the SVD, which is adequate for seeding.
pub fn umeyama_similarity(from: &[Vector3<f64>], to: &[Vector3<f64>]) -> Result<Similarity> {
    if from.len() != to.len() || from.len() < 2 {
        return Err(MvgError::NotEnoughPoints);
    }
    let n = from.len() as f64;
    let mean_from: Vector3<f64> = from.iter().sum::<Vector3<f64>>() / n;
    let mean_to: Vector3<f64> = to.iter().sum::<Vector3<f64>>() / n;

    let mut cov = Matrix3::zeros();
    let mut var_from = 0.0;
    for (f, t) in from.iter().zip(to.iter()) {
        let df = f - mean_from;
        let dt = t - mean_to;
        cov += dt * df.transpose();
        var_from += df.norm_squared();
    }
    cov /= n;
    var_from /= n;
    if var_from < 1e-20 {
        return Err(MvgError::DegenerateConfiguration("coincident source points"));
    }

    let svd = cov.svd(true, true);
    let (u, v_t) = (
        svd.u.ok_or(MvgError::SvdFailed)?,
        svd.v_t.ok_or(MvgError::SvdFailed)?,
    );
    let mut s = Vector3::new(1.0, 1.0, 1.0);
    if (u * v_t).determinant() < 0.0 {
        s.z = -1.0;
    }
    let rotation = u * Matrix3::from_diagonal(&s) * v_t;
    let scale = (svd.singular_values.component_mul(&s)).sum() / var_from;
    if scale <= 0.0 || !scale.is_finite() {
        return Err(MvgError::DegenerateConfiguration("non-positive similarity scale"));
    }
    let translation = mean_to - rotation * mean_from * scale;

    Ok(Similarity {
        scale,
        rotation,
        translation,
    })
}
