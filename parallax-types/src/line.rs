use serde::{Deserialize, Serialize};

use crate::PointId;

/// Direction tag for a [`Line`].
///
/// Single-axis tags constrain the line to be parallel to that world axis;
/// plane tags constrain it to lie in the named coordinate plane. `Horizontal`
/// is an alias for the XY plane, `Vertical` for the Z axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineDirection {
    Free,
    X,
    Y,
    Z,
    Xy,
    Xz,
    Yz,
    Horizontal,
    Vertical,
}

impl LineDirection {
    /// The world axis this tag pins the line to, if it is an axis tag.
    pub fn axis_index(&self) -> Option<usize> {
        match self {
            LineDirection::X => Some(0),
            LineDirection::Y => Some(1),
            LineDirection::Z | LineDirection::Vertical => Some(2),
            _ => None,
        }
    }

    /// The axis excluded by a plane tag: the line's delta must have zero
    /// component along it.
    pub fn excluded_axis_index(&self) -> Option<usize> {
        match self {
            LineDirection::Xy | LineDirection::Horizontal => Some(2),
            LineDirection::Xz => Some(1),
            LineDirection::Yz => Some(0),
            _ => None,
        }
    }
}

/// A line segment between two world points, optionally direction-tagged and
/// length-constrained.
#[derive(Debug, Clone)]
pub struct Line {
    pub name: String,
    pub a: PointId,
    pub b: PointId,
    pub direction: LineDirection,
    pub target_length: Option<f64>,
    pub tolerance: f64,
    pub enabled: bool,
    /// Residual magnitudes attributed to this line by the last solve.
    pub last_residuals: Vec<f64>,
}

impl Line {
    pub fn new(name: impl Into<String>, a: PointId, b: PointId) -> Self {
        Self {
            name: name.into(),
            a,
            b,
            direction: LineDirection::Free,
            target_length: None,
            tolerance: 0.0,
            enabled: true,
            last_residuals: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_tag_axes() {
        assert_eq!(LineDirection::Vertical.axis_index(), Some(2));
        assert_eq!(LineDirection::Horizontal.excluded_axis_index(), Some(2));
        assert_eq!(LineDirection::Yz.excluded_axis_index(), Some(0));
        assert_eq!(LineDirection::Free.axis_index(), None);
        assert_eq!(LineDirection::Free.excluded_axis_index(), None);
    }
}
