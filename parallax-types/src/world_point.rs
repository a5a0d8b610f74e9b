use nalgebra::Vector3;

use crate::ImagePointId;

/// A 3D point in world coordinates, the primary unknown of a solve.
///
/// Each axis may be locked to a user-supplied value. The solver only ever
/// optimizes the free axes; [`WorldPoint::effective_xyz`] merges the locked
/// values over the current estimate.
#[derive(Debug, Clone)]
pub struct WorldPoint {
    pub name: String,
    /// Per-axis lock: `Some(v)` pins that coordinate to `v` during a solve.
    pub locked: [Option<f64>; 3],
    /// Current estimate for the free axes. Locked axes keep whatever value
    /// was last written here but are shadowed by `locked`.
    pub optimized: Vector3<f64>,
    /// Residual magnitudes attributed to this point by the last solve.
    pub last_residuals: Vec<f64>,
    /// Image points observing this world point. Maintained by
    /// [`crate::Project::add_image_point`].
    pub observations: Vec<ImagePointId>,
    /// Display color, carried through for hosts; the solver ignores it.
    pub color: Option<String>,
    /// Host-side visibility flag; the solver ignores it.
    pub is_visible: bool,
}

impl WorldPoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locked: [None; 3],
            optimized: Vector3::zeros(),
            last_residuals: Vec::new(),
            observations: Vec::new(),
            color: None,
            is_visible: true,
        }
    }

    /// The point position with locks applied: `locked[i]` wins over
    /// `optimized[i]` on every axis.
    pub fn effective_xyz(&self) -> Vector3<f64> {
        Vector3::new(
            self.locked[0].unwrap_or(self.optimized.x),
            self.locked[1].unwrap_or(self.optimized.y),
            self.locked[2].unwrap_or(self.optimized.z),
        )
    }

    /// True iff all three axes are locked.
    pub fn is_fully_locked(&self) -> bool {
        self.locked.iter().all(|l| l.is_some())
    }

    /// Number of axes the solver may move.
    pub fn free_axis_count(&self) -> usize {
        self.locked.iter().filter(|l| l.is_none()).count()
    }

    /// Lock all three axes to `xyz`.
    pub fn lock_to(&mut self, xyz: Vector3<f64>) {
        self.locked = [Some(xyz.x), Some(xyz.y), Some(xyz.z)];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_xyz_merges_locks() {
        let mut wp = WorldPoint::new("p");
        wp.optimized = Vector3::new(1.0, 2.0, 3.0);
        wp.locked[1] = Some(-5.0);
        assert_eq!(wp.effective_xyz(), Vector3::new(1.0, -5.0, 3.0));
        assert_eq!(wp.free_axis_count(), 2);
        assert!(!wp.is_fully_locked());
        wp.lock_to(Vector3::zeros());
        assert!(wp.is_fully_locked());
    }
}
