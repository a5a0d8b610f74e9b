use serde::{Deserialize, Serialize};

use crate::{ConstraintId, ImagePointId, LineId, PointId, ViewpointId};

/// Reference to any entity, used in diagnostics output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityRef {
    Point(PointId),
    Viewpoint(ViewpointId),
    ImagePoint(ImagePointId),
    Line(LineId),
    Constraint(ConstraintId),
}

/// Quality grade from the final median reprojection error in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Excellent,
    Good,
    Acceptable,
    Poor,
    Diverged,
    Unknown,
}

impl Quality {
    /// Grade a median reprojection error: excellent < 0.5 px, good < 1.0,
    /// acceptable < 2.0, poor above, diverged when non-finite.
    pub fn from_median_reprojection_px(median: f64) -> Self {
        if !median.is_finite() {
            Quality::Diverged
        } else if median < 0.5 {
            Quality::Excellent
        } else if median < 1.0 {
            Quality::Good
        } else if median < 2.0 {
            Quality::Acceptable
        } else {
            Quality::Poor
        }
    }
}

/// Outcome of a solve. Always returned, including on failure paths; `error`
/// carries the failure kind when the solve did not complete normally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveReport {
    pub converged: bool,
    pub iterations: usize,
    /// Final cost, `0.5 * |r|^2`.
    pub total_error: f64,
    /// Median reprojection error in pixels over all active observations, if
    /// any observation produced a residual.
    pub median_reprojection_error: Option<f64>,
    pub quality: Quality,
    pub outliers: Vec<EntityRef>,
    /// Names of cameras whose pose was produced by an initializer this solve.
    pub cameras_initialized: Vec<String>,
    pub elapsed_ms: f64,
    pub error: Option<String>,
}

impl SolveReport {
    /// A report for a solve that failed before any candidate ran.
    pub fn failed(error: impl Into<String>, elapsed_ms: f64) -> Self {
        Self {
            converged: false,
            iterations: 0,
            total_error: f64::INFINITY,
            median_reprojection_error: None,
            quality: Quality::Unknown,
            outliers: Vec::new(),
            cameras_initialized: Vec::new(),
            elapsed_ms,
            error: Some(error.into()),
        }
    }
}
