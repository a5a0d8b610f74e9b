use serde::{Deserialize, Serialize};

/// Robust loss applied to reprojection residuals. Geometric constraints are
/// always plain least squares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobustLoss {
    #[default]
    None,
    Huber,
    Cauchy,
    Tukey,
}

/// Solver configuration. Plain data; the progress callback is passed to the
/// solve entry points separately so options stay cloneable and serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub initial_damping: f64,
    /// Lock every camera pose, optimizing points only.
    pub lock_camera_poses: bool,
    /// `None` means "true unless `lock_camera_poses`".
    pub optimize_intrinsics: Option<bool>,
    pub robust_loss: RobustLoss,
    pub robust_loss_scale: f64,
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-6,
            initial_damping: 1e-3,
            lock_camera_poses: false,
            optimize_intrinsics: None,
            robust_loss: RobustLoss::None,
            robust_loss_scale: 1.0,
            verbose: false,
        }
    }
}

impl SolverOptions {
    /// Resolve the intrinsics flag against `lock_camera_poses`.
    pub fn intrinsics_enabled(&self) -> bool {
        self.optimize_intrinsics
            .unwrap_or(!self.lock_camera_poses)
    }
}
