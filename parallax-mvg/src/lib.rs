//! Camera, quaternion, and multi-view geometry algorithms for the parallax
//! bundle-adjustment engine.
//!
//! This crate is pure math: it knows nothing about the entity graph. Inputs
//! are nalgebra points and plain correspondence records; outputs are poses,
//! 3D positions, and Jacobian blocks. The solver crate adapts entities to
//! these interfaces.
//!
//! The projection model ([`CameraParams`]) parameterizes rotation as a raw
//! quaternion `(w, x, y, z)` so that every derivative is taken with respect
//! to the four scalars directly; unit magnitude is kept by the solver through
//! a soft residual plus post-step renormalization. Conversion to and from
//! rotation matrices happens only at interface boundaries (initializer
//! outputs, serialization).

#![deny(rust_2018_idioms)]

use thiserror::Error;

pub mod align;
pub mod essential;
pub mod pnp;
pub mod projection;
pub mod quat;
pub mod triangulate;
pub mod vanishing;

pub mod numeric;

pub use projection::{CameraParams, ProjectionJacobian};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MvgError {
    #[error("not enough points")]
    NotEnoughPoints,
    #[error("SVD failed")]
    SvdFailed,
    #[error("degenerate configuration: {0}")]
    DegenerateConfiguration(&'static str),
    #[error("no candidate had points in front of the camera")]
    NoValidCandidate,
    #[error("vanishing point data insufficient: {0}")]
    InsufficientVanishingData(&'static str),
    #[error("singular system")]
    SingularSystem,
}

pub type Result<T> = std::result::Result<T, MvgError>;

/// One 3D-to-2D correspondence, in world and pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub world: nalgebra::Point3<f64>,
    pub pixel: nalgebra::Point2<f64>,
}
