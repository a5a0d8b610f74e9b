//! Entity graph, solver options, and the serialization boundary for the
//! parallax bundle-adjustment engine.
//!
//! All entities are owned by a [`Project`] in arena `Vec`s and refer to each
//! other through typed indices ([`PointId`], [`ViewpointId`], ...). String
//! ids exist only in the DTO layer ([`dto`]) and are translated to arena
//! indices at load time. The solver core never follows a string reference and
//! never holds owning pointers in both directions of a relation.

use serde::{Deserialize, Serialize};

mod constraint;
mod line;
mod options;
mod project;
mod report;
mod viewpoint;
mod world_point;

pub mod dto;

pub use constraint::{Constraint, ConstraintKind};
pub use line::{Line, LineDirection};
pub use options::{RobustLoss, SolverOptions};
pub use project::{ImagePoint, Project};
pub use report::{EntityRef, Quality, SolveReport};
pub use viewpoint::{Axis, Intrinsics, VanishingLine, Viewpoint};
pub use world_point::WorldPoint;

/// Index of a [`WorldPoint`] in its owning [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointId(pub usize);

/// Index of a [`Viewpoint`] in its owning [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewpointId(pub usize);

/// Index of an [`ImagePoint`] in its owning [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImagePointId(pub usize);

/// Index of a [`Line`] in its owning [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineId(pub usize);

/// Index of a [`Constraint`] in its owning [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstraintId(pub usize);
