use nalgebra::{Point2, Quaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::ImagePointId;

/// A world axis label for vanishing lines and axis-aligned line constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(&self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn unit(&self) -> Vector3<f64> {
        match self {
            Axis::X => Vector3::x(),
            Axis::Y => Vector3::y(),
            Axis::Z => Vector3::z(),
        }
    }
}

/// Pinhole intrinsics with Brown-Conrady distortion.
///
/// The vertical focal length is coupled to the horizontal one:
/// `fy = focal * aspect_ratio`. `aspect_ratio` and `skew` are load-time data
/// and are never optimized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    /// Horizontal focal length in pixels.
    pub focal: f64,
    pub aspect_ratio: f64,
    /// Principal point in pixels.
    pub cx: f64,
    pub cy: f64,
    pub skew: f64,
    /// Radial distortion terms.
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    /// Tangential distortion terms.
    pub p1: f64,
    pub p2: f64,
}

impl Intrinsics {
    /// Intrinsics with the principal point centered on a `width` x `height`
    /// image, unit aspect ratio, and no distortion. The focal length is a
    /// placeholder that vanishing-point initialization treats as "still at
    /// default" and will replace with an estimate.
    pub fn default_for_image(width: usize, height: usize) -> Self {
        Self {
            focal: 0.85 * width as f64,
            aspect_ratio: 1.0,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
            skew: 0.0,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
        }
    }

    /// Vertical focal length, derived from `focal` and `aspect_ratio`.
    pub fn fy(&self) -> f64 {
        self.focal * self.aspect_ratio
    }

    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.k3 != 0.0 || self.p1 != 0.0 || self.p2 != 0.0
    }
}

/// A user-drawn line segment in one image, labeled with the world axis its
/// 3D counterpart is parallel to. Segments sharing an axis converge to that
/// axis's vanishing point.
#[derive(Debug, Clone, PartialEq)]
pub struct VanishingLine {
    pub axis: Axis,
    pub a: Point2<f64>,
    pub b: Point2<f64>,
}

/// A camera: one image with intrinsics and a world pose.
///
/// `rotation` maps world-frame vectors into the camera frame and is kept at
/// unit magnitude by the solver (soft residual during iteration plus
/// renormalization after each accepted step).
#[derive(Debug, Clone)]
pub struct Viewpoint {
    pub name: String,
    pub intrinsics: Intrinsics,
    pub position: Vector3<f64>,
    /// World-to-camera rotation, `(w, x, y, z)` scalar-first.
    pub rotation: Quaternion<f64>,
    pub width: usize,
    pub height: usize,
    /// Pose excluded from optimization (gauge fixing or user choice).
    pub is_pose_locked: bool,
    /// Disabled viewpoints contribute no residuals at all.
    pub enabled_in_solve: bool,
    /// Handedness flip: negate all camera-frame coordinates after rotation.
    pub is_z_reflected: bool,
    pub vanishing_lines: Vec<VanishingLine>,
    /// Image points taken in this viewpoint. Maintained by
    /// [`crate::Project::add_image_point`].
    pub image_points: Vec<ImagePointId>,
    /// Reprojection residual magnitudes attributed to this viewpoint by the
    /// last solve.
    pub last_residuals: Vec<f64>,
}

impl Viewpoint {
    pub fn new(name: impl Into<String>, width: usize, height: usize) -> Self {
        Self {
            name: name.into(),
            intrinsics: Intrinsics::default_for_image(width, height),
            position: Vector3::zeros(),
            rotation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
            width,
            height,
            is_pose_locked: false,
            enabled_in_solve: true,
            is_z_reflected: false,
            vanishing_lines: Vec::new(),
            image_points: Vec::new(),
            last_residuals: Vec::new(),
        }
    }

    /// Vanishing lines grouped by axis, in axis order.
    pub fn vanishing_lines_for(&self, axis: Axis) -> impl Iterator<Item = &VanishingLine> {
        self.vanishing_lines.iter().filter(move |vl| vl.axis == axis)
    }

    /// Number of distinct axes that have at least two vanishing lines (the
    /// minimum for a usable vanishing point).
    pub fn usable_vanishing_axes(&self) -> usize {
        [Axis::X, Axis::Y, Axis::Z]
            .iter()
            .filter(|axis| self.vanishing_lines_for(**axis).count() >= 2)
            .count()
    }
}
