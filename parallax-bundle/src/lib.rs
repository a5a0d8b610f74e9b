//! Sparse Levenberg-Marquardt bundle adjustment over the parallax entity
//! graph.
//!
//! The most important internal operations are the assembly of residuals and
//! sparse Jacobian blocks from per-constraint providers, and the damped
//! normal-equation solve `(J^T J + lambda D) delta = -J^T r` by preconditioned
//! conjugate gradients. Around that core sit the variable layout (free-scalar
//! indexing with per-axis locks), the initialization suite (vanishing-point
//! pose, PnP, essential matrix, triangulation, smart seeding), the candidate
//! orchestrator, and diagnostics.
//!
//! Entry points: [`solve`] (full pipeline with initialization and candidate
//! selection) and [`fine_tune`] (one LM run from the current entity state).
//! Both always return a [`SolveReport`]; failures are embedded in the report
//! rather than aborting the call.

use thiserror::Error;

mod diagnostics;
mod init;
mod layout;
mod lm;
mod orchestrator;
mod residual;
mod state;

pub mod linalg;

pub use diagnostics::{diagnose, CameraErrorStats, DiagnosticsSummary};
pub use lm::TerminationReason;
pub use orchestrator::{fine_tune, solve};
pub use state::{camera_params_from_viewpoint, SceneState};

pub use parallax_types::{Project, Quality, RobustLoss, SolveReport, SolverOptions};

/// Failure taxonomy of a solve.
///
/// Only [`SolveError::Cancelled`] and a hard [`SolveError::InvalidConfiguration`]
/// short-circuit the orchestrator; everything else falls through to the next
/// initializer or candidate and ends up summarized in the report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    /// No free variables and the remaining residuals are unsatisfied.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Non-finite residual or gradient, CG breakdown, or a degenerate
    /// quaternion.
    #[error("numerical breakdown: {0}")]
    NumericalBreakdown(&'static str),
    /// An initializer did not have the observations it needs.
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    /// LM exhausted its iterations or damping without an accepted step.
    #[error("did not converge: {0}")]
    DidNotConverge(&'static str),
    /// The progress callback asked to stop.
    #[error("Cancelled")]
    Cancelled,
}

/// Decision returned by a progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Cancel,
}

/// Progress callback: `(iteration, cost, best_cost_so_far)`, invoked between
/// LM iterations and at candidate boundaries.
pub type ProgressFn<'a> = dyn FnMut(usize, f64, f64) -> Flow + 'a;
