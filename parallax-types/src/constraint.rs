use nalgebra::Vector3;

use crate::{LineId, PointId};

/// The per-variant payload of a [`Constraint`].
#[derive(Debug, Clone)]
pub enum ConstraintKind {
    /// `|A - B|` should equal `target`.
    Distance {
        a: PointId,
        b: PointId,
        target: f64,
    },
    /// The point should sit at `target` (soft counterpart of axis locks).
    FixedPoint { point: PointId, target: Vector3<f64> },
    /// All points on one line through the first two.
    Collinear { points: Vec<PointId> },
    /// All points on one plane through the first three.
    Coplanar { points: Vec<PointId> },
    /// All listed segments share one length.
    EqualDistances { pairs: Vec<(PointId, PointId)> },
    ParallelLines { a: LineId, b: LineId },
    PerpendicularLines { a: LineId, b: LineId },
}

/// A geometric constraint between entities of a project.
///
/// Disabled constraints contribute nothing to a solve: no residuals, no
/// Jacobian columns.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub enabled: bool,
    /// Relative weight applied to this constraint's residuals.
    pub priority: f64,
    pub tolerance: f64,
}

impl Constraint {
    pub fn new(kind: ConstraintKind) -> Self {
        Self {
            kind,
            enabled: true,
            priority: 1.0,
            tolerance: 0.0,
        }
    }

    /// World points referenced by this constraint, for residual bucketing.
    pub fn referenced_points(&self) -> Vec<PointId> {
        match &self.kind {
            ConstraintKind::Distance { a, b, .. } => vec![*a, *b],
            ConstraintKind::FixedPoint { point, .. } => vec![*point],
            ConstraintKind::Collinear { points } | ConstraintKind::Coplanar { points } => {
                points.clone()
            }
            ConstraintKind::EqualDistances { pairs } => {
                pairs.iter().flat_map(|(a, b)| [*a, *b]).collect()
            }
            ConstraintKind::ParallelLines { .. } | ConstraintKind::PerpendicularLines { .. } => {
                Vec::new()
            }
        }
    }
}
