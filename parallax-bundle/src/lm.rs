//! The damped least-squares driver.
//!
//! Classic Levenberg-Marquardt with multiplicative damping on `diag(J^T J)`,
//! a trust-ratio acceptance rule, and the preconditioned-CG inner solve from
//! [`crate::linalg`]. Quaternion blocks are renormalized after every accepted
//! step. A yield callback runs between iterations and may cancel the solve.

use nalgebra::DVector;

use crate::layout::VariableLayout;
use crate::linalg::{solve_normal_equations, CgWorkspace};
use crate::residual::ResidualSystem;
use crate::{Flow, ProgressFn, SolveError};

/// Damping ceiling; beyond this the driver gives up on finding a step.
const MAX_DAMPING: f64 = 1e16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Accepted-step cost change fell below tolerance.
    CostTolerance,
    /// Gradient infinity norm fell below tolerance.
    GradientTolerance,
    /// Damping exceeded [`MAX_DAMPING`] without an acceptable step.
    DampingSaturated,
    IterationCap,
    Cancelled,
}

#[derive(Debug, Clone)]
pub(crate) struct LmConfig {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub initial_damping: f64,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct LmOutcome {
    pub converged: bool,
    pub iterations: usize,
    pub final_cost: f64,
    pub reason: TerminationReason,
    /// Columns whose Jacobian norm was zero at the final evaluation.
    pub unobservable: Vec<usize>,
}

/// Minimize the system cost from `x`, mutating `x` in place.
///
/// `x` always holds the best accepted iterate when this returns, including
/// on the cancellation path. Errors are reserved for numerical breakdown;
/// failure to converge is an outcome, not an error.
pub(crate) fn run_lm(
    system: &mut ResidualSystem,
    layout: &VariableLayout,
    x: &mut DVector<f64>,
    config: &LmConfig,
    mut progress: Option<&mut ProgressFn<'_>>,
    best_cost_so_far: f64,
) -> Result<LmOutcome, SolveError> {
    let n = x.len();
    let m = system.residual_count();

    let mut cost = system.evaluate(layout, x, true)?;
    if n == 0 {
        return Ok(LmOutcome {
            converged: true,
            iterations: 0,
            final_cost: cost,
            reason: TerminationReason::CostTolerance,
            unobservable: Vec::new(),
        });
    }

    // Scratch buffers, allocated once per solve and reused across iterations.
    let mut gradient = DVector::zeros(n);
    let mut diag = DVector::zeros(n);
    let mut damped = DVector::zeros(n);
    let mut precond = DVector::zeros(n);
    let mut delta = DVector::zeros(n);
    let mut rhs = DVector::zeros(n);
    let mut trial = DVector::zeros(n);
    let mut ws = CgWorkspace::new(m, n);

    let mut unobservable = refresh_gradient(system, &mut gradient, &mut diag);

    let mut lambda = config.initial_damping;
    let mut nu = 2.0;
    let mut iterations = 0;
    let mut reason = TerminationReason::IterationCap;
    let mut converged = false;

    while iterations < config.max_iterations {
        iterations += 1;

        if let Some(cb) = progress.as_deref_mut() {
            if cb(iterations, cost, best_cost_so_far.min(cost)) == Flow::Cancel {
                return Ok(LmOutcome {
                    converged: false,
                    iterations,
                    final_cost: cost,
                    reason: TerminationReason::Cancelled,
                    unobservable,
                });
            }
        }

        // (J^T J + lambda D) delta = -g, with unobservable columns left
        // undamped (their rhs is zero, so CG never moves them).
        for i in 0..n {
            let d = diag[i];
            damped[i] = lambda * d;
            precond[i] = if d > 0.0 { d + lambda * d } else { 1.0 };
            rhs[i] = -gradient[i];
        }
        let cg_iterations = solve_normal_equations(
            system.jacobian(),
            &damped,
            &precond,
            &rhs,
            &mut ws,
            &mut delta,
        )?;

        trial.copy_from(x);
        trial += &delta;
        layout.renormalize_quaternions(&mut trial);

        let trial_cost = system.evaluate(layout, &trial, false)?;

        // Predicted reduction of the damped quadratic model.
        let mut predicted = 0.0;
        for i in 0..n {
            predicted += delta[i] * (damped[i] * delta[i] - gradient[i]);
        }
        let rho = if predicted.abs() > 0.0 {
            (cost - trial_cost) / predicted
        } else {
            -1.0
        };

        if config.verbose {
            tracing::info!(
                iterations,
                cost,
                trial_cost,
                lambda,
                rho,
                cg_iterations,
                "lm iteration"
            );
        } else {
            tracing::trace!(iterations, cost, trial_cost, lambda, rho, "lm iteration");
        }

        if rho > 0.0 && trial_cost < cost {
            let cost_change = cost - trial_cost;
            x.copy_from(&trial);
            let shrink = 1.0 - (2.0 * rho - 1.0).powi(3);
            lambda *= shrink.max(1.0 / 3.0);
            nu = 2.0;

            cost = system.evaluate(layout, x, true)?;
            unobservable = refresh_gradient(system, &mut gradient, &mut diag);

            if cost_change < config.tolerance * cost.max(1.0) {
                reason = TerminationReason::CostTolerance;
                converged = true;
                break;
            }
            if gradient.amax() < config.tolerance {
                reason = TerminationReason::GradientTolerance;
                converged = true;
                break;
            }
        } else {
            // A rejected step that is already negligibly small means the
            // iterate sits at the model's minimum; raising the damping
            // would only re-derive the same point.
            if delta.norm() <= 1e-10 * (1.0 + x.norm()) {
                reason = TerminationReason::CostTolerance;
                converged = true;
                break;
            }
            lambda *= nu;
            nu *= 2.0;
            if lambda > MAX_DAMPING {
                reason = TerminationReason::DampingSaturated;
                break;
            }
        }
    }

    Ok(LmOutcome {
        converged,
        iterations,
        final_cost: cost,
        reason,
        unobservable,
    })
}

/// Recompute `g = J^T r` and `D = diag(J^T J)`; returns the columns with a
/// zero diagonal (unobservable variables).
fn refresh_gradient(
    system: &ResidualSystem,
    gradient: &mut DVector<f64>,
    diag: &mut DVector<f64>,
) -> Vec<usize> {
    system
        .jacobian()
        .mul_transpose_vec(system.residuals(), gradient);
    system.jacobian().column_squared_norms(diag);
    diag.iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0.0)
        .map(|(i, _)| i)
        .collect()
}
