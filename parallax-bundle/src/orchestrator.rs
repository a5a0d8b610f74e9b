//! Candidate orchestration: probe each starting state with a short LM run,
//! promote the best few to full runs, grade the winner, and apply it.
//!
//! Entity mutation happens exactly once, at the end, after the winning
//! candidate is chosen. Every path out of [`solve`] and [`fine_tune`]
//! produces a [`SolveReport`]; initializer and candidate failures are
//! demoted to log lines and report fields, never panics or early aborts --
//! the exceptions are cancellation and a hard over-constrained
//! configuration, which stop the pipeline immediately (without mutation).

use std::collections::HashSet;
use std::time::Instant;

use nalgebra::DVector;
use ordered_float::NotNan;
use parallax_types::{EntityRef, Project, Quality, SolveReport, SolverOptions};

use crate::diagnostics::{self, OUTLIER_MAD_FACTOR};
use crate::init;
use crate::layout::VariableLayout;
use crate::lm::{run_lm, LmConfig, LmOutcome, TerminationReason};
use crate::residual::{build_providers, ResidualSystem};
use crate::state::SceneState;
use crate::{Flow, ProgressFn, SolveError};

/// Iteration budget of the per-candidate probe run.
const PROBE_ITERATIONS: usize = 200;
/// How many probed candidates get a full-length run.
const TOP_K: usize = 3;
/// Priority multiplier for flagged outlier observations on the re-run.
const OUTLIER_REWEIGHT: f64 = 0.1;
/// Cost below which a zero-variable project counts as satisfied.
const SATISFIED_COST: f64 = 1e-9;

struct Attempt {
    candidate: usize,
    layout: VariableLayout,
    system: ResidualSystem,
    x: DVector<f64>,
    outcome: LmOutcome,
    /// Residual blocks still suppressed at the final iterate. Nonzero marks
    /// an invalid configuration; such attempts only win if nothing else
    /// survived.
    inactive: usize,
}

impl Attempt {
    /// Re-evaluate at the final iterate (run_lm may leave a rejected trial
    /// as the last evaluation) and refresh the inactive-block count.
    fn refresh(&mut self) {
        if self.system.evaluate(&self.layout, &self.x, false).is_ok() {
            self.inactive = self.system.inactive_blocks();
        }
    }

    fn rank(&self) -> (bool, NotNan<f64>) {
        (
            self.inactive > 0,
            NotNan::new(self.outcome.final_cost).unwrap_or_else(|_| NotNan::new(f64::MAX).unwrap()),
        )
    }
}

/// Full pipeline: initialization, candidate probes, top-K full runs,
/// quality grading, outlier detection, final apply.
pub fn solve(
    project: &mut Project,
    options: &SolverOptions,
    progress: Option<&mut ProgressFn<'_>>,
) -> SolveReport {
    run_pipeline(project, options, progress, true)
}

/// Single-pass refinement: no initialization and no candidate selection;
/// the current entity state is the seed for one LM run to tight tolerance.
pub fn fine_tune(
    project: &mut Project,
    options: &SolverOptions,
    progress: Option<&mut ProgressFn<'_>>,
) -> SolveReport {
    run_pipeline(project, options, progress, false)
}

fn run_pipeline(
    project: &mut Project,
    options: &SolverOptions,
    mut progress: Option<&mut ProgressFn<'_>>,
    with_initialization: bool,
) -> SolveReport {
    let started = Instant::now();

    if project.image_points().is_empty()
        && project.lines().is_empty()
        && project.constraints().is_empty()
    {
        return SolveReport::failed(
            SolveError::InvalidConfiguration("project has no residual sources".into()).to_string(),
            elapsed_ms(started),
        );
    }

    let gauge = if options.lock_camera_poses {
        None
    } else {
        init::determine_gauge(project)
    };
    if let Some(camera) = gauge {
        tracing::debug!(
            camera = project.viewpoint(camera).name.as_str(),
            "locking camera pose for gauge fixing"
        );
    }

    let candidates = if with_initialization {
        init::generate_candidates(project, options)
    } else {
        vec![init::Candidate {
            state: SceneState::from_project(project),
            label: "fine-tune",
            cameras_initialized: Vec::new(),
        }]
    };

    // Probe every deduplicated candidate with a short LM run.
    let probe_config = LmConfig {
        max_iterations: PROBE_ITERATIONS.min(options.max_iterations),
        tolerance: options.tolerance,
        initial_damping: options.initial_damping,
        verbose: options.verbose,
    };
    let mut attempts: Vec<Attempt> = Vec::new();
    let mut seen_costs: HashSet<i64> = HashSet::new();
    let mut total_iterations = 0usize;
    let mut best_cost = f64::INFINITY;

    for (ci, candidate) in candidates.iter().enumerate() {
        let layout = VariableLayout::build(project, &candidate.state, options, gauge);
        let providers = build_providers(project, &layout, options, None);
        let mut system = ResidualSystem::new(providers, layout.variable_count());
        let mut x = layout.initial_values();

        let initial_cost = match system.evaluate(&layout, &x, false) {
            Ok(cost) => cost,
            Err(err) => {
                tracing::warn!(candidate = candidate.label, %err, "candidate discarded");
                continue;
            }
        };
        if with_initialization && !seen_costs.insert(cost_hash(initial_cost)) {
            tracing::debug!(
                candidate = candidate.label,
                initial_cost,
                "duplicate starting state skipped"
            );
            continue;
        }

        if layout.variable_count() == 0 {
            if initial_cost > SATISFIED_COST {
                // Over-constrained and inconsistent. Surfaced immediately,
                // without running further candidates; the unchanged state is
                // written back so the offending residuals land on their
                // entities.
                candidate.state.apply_to_project(project);
                diagnostics::write_last_residuals(project, &system);
                let median = diagnostics::median_reprojection_error(project, &candidate.state);
                return SolveReport {
                    converged: false,
                    iterations: 0,
                    total_error: initial_cost,
                    median_reprojection_error: median,
                    quality: Quality::Poor,
                    outliers: Vec::new(),
                    cameras_initialized: Vec::new(),
                    elapsed_ms: elapsed_ms(started),
                    error: Some(
                        SolveError::InvalidConfiguration(format!(
                            "no free variables but residual cost is {initial_cost:.3e}"
                        ))
                        .to_string(),
                    ),
                };
            }
            let mut attempt = Attempt {
                candidate: ci,
                layout,
                system,
                x,
                outcome: LmOutcome {
                    converged: true,
                    iterations: 0,
                    final_cost: initial_cost,
                    reason: TerminationReason::CostTolerance,
                    unobservable: Vec::new(),
                },
                inactive: 0,
            };
            attempt.refresh();
            attempts.push(attempt);
            continue;
        }

        let offset = total_iterations;
        let outcome = match progress.as_deref_mut() {
            Some(cb) => {
                let mut adapted =
                    move |it: usize, cost: f64, best: f64| -> Flow { cb(offset + it, cost, best) };
                run_lm(
                    &mut system,
                    &layout,
                    &mut x,
                    &probe_config,
                    Some(&mut adapted),
                    best_cost,
                )
            }
            None => run_lm(&mut system, &layout, &mut x, &probe_config, None, best_cost),
        };
        match outcome {
            Ok(outcome) => {
                total_iterations += outcome.iterations;
                if outcome.reason == TerminationReason::Cancelled {
                    return cancelled_report(total_iterations, elapsed_ms(started));
                }
                if !outcome.final_cost.is_finite() {
                    tracing::warn!(candidate = candidate.label, "candidate diverged, discarded");
                    continue;
                }
                tracing::debug!(
                    candidate = candidate.label,
                    initial_cost,
                    probe_cost = outcome.final_cost,
                    iterations = outcome.iterations,
                    "candidate probed"
                );
                best_cost = best_cost.min(outcome.final_cost);
                let mut attempt = Attempt {
                    candidate: ci,
                    layout,
                    system,
                    x,
                    outcome,
                    inactive: 0,
                };
                attempt.refresh();
                attempts.push(attempt);
            }
            Err(err) => {
                tracing::warn!(candidate = candidate.label, %err, "candidate discarded");
            }
        }
    }

    if attempts.is_empty() {
        // Only the "current" and "seed" candidates exist when every
        // initializer declined for lack of observations.
        let error = if with_initialization && candidates.len() <= 2 {
            SolveError::InsufficientData("no initializer could seed the project".into())
        } else {
            SolveError::DidNotConverge("no candidate survived probing")
        };
        return SolveReport::failed(error.to_string(), elapsed_ms(started));
    }

    // Promote the best probes to full-length runs; attempts with suppressed
    // residual blocks rank behind every fully-active attempt.
    attempts.sort_by_key(Attempt::rank);
    attempts.truncate(TOP_K);

    let full_config = LmConfig {
        max_iterations: options.max_iterations,
        tolerance: options.tolerance,
        initial_damping: options.initial_damping,
        verbose: options.verbose,
    };
    for attempt in attempts.iter_mut() {
        if attempt.layout.variable_count() == 0 || attempt.outcome.converged {
            continue;
        }
        let offset = total_iterations;
        let outcome = match progress.as_deref_mut() {
            Some(cb) => {
                let mut adapted =
                    move |it: usize, cost: f64, best: f64| -> Flow { cb(offset + it, cost, best) };
                run_lm(
                    &mut attempt.system,
                    &attempt.layout,
                    &mut attempt.x,
                    &full_config,
                    Some(&mut adapted),
                    best_cost,
                )
            }
            None => run_lm(
                &mut attempt.system,
                &attempt.layout,
                &mut attempt.x,
                &full_config,
                None,
                best_cost,
            ),
        };
        match outcome {
            Ok(outcome) => {
                total_iterations += outcome.iterations;
                if outcome.reason == TerminationReason::Cancelled {
                    return cancelled_report(total_iterations, elapsed_ms(started));
                }
                best_cost = best_cost.min(outcome.final_cost);
                attempt.outcome = outcome;
                attempt.refresh();
            }
            Err(err) => {
                tracing::warn!(%err, "full run failed, keeping probe result");
            }
        }
    }

    let best_index = attempts
        .iter()
        .enumerate()
        .filter(|(_, a)| a.outcome.final_cost.is_finite())
        .min_by_key(|(_, a)| a.rank())
        .map(|(i, _)| i);
    let Some(best_index) = best_index else {
        return SolveReport::failed(
            SolveError::DidNotConverge("every candidate diverged").to_string(),
            elapsed_ms(started),
        );
    };
    let mut best = attempts.swap_remove(best_index);

    // Outlier pass: flag by MAD, and when the solve graded poor retry once
    // with the flagged observations down-weighted.
    let mut final_state = best.layout.to_state(&best.x);
    let mut median = diagnostics::median_reprojection_error(project, &final_state);
    let mut outliers = diagnostics::mad_outliers(project, &final_state, OUTLIER_MAD_FACTOR);
    let quality_now = grade(&best.outcome, median);
    if quality_now == Quality::Poor && !outliers.is_empty() {
        tracing::info!(
            outliers = outliers.len(),
            "poor quality with outliers, retrying down-weighted"
        );
        let mut weights = vec![1.0; project.image_points().len()];
        for o in &outliers {
            weights[o.0] = OUTLIER_REWEIGHT;
        }
        let providers = build_providers(project, &best.layout, options, Some(&weights));
        let mut system = ResidualSystem::new(providers, best.layout.variable_count());
        let mut x = best.x.clone();
        if let Ok(outcome) = run_lm(&mut system, &best.layout, &mut x, &full_config, None, best_cost)
        {
            total_iterations += outcome.iterations;
            let state = best.layout.to_state(&x);
            let new_median = diagnostics::median_reprojection_error(project, &state);
            if outcome.reason != TerminationReason::Cancelled
                && better_median(new_median, median)
            {
                best.system = system;
                best.x = x;
                best.outcome = outcome;
                final_state = state;
                median = new_median;
                outliers = diagnostics::mad_outliers(project, &final_state, OUTLIER_MAD_FACTOR);
            }
        }
    }

    // The single entity mutation of the solve: winning state plus residual
    // attribution.
    let _ = best.system.evaluate(&best.layout, &best.x, false);
    final_state.apply_to_project(project);
    diagnostics::write_last_residuals(project, &best.system);

    if !best.outcome.unobservable.is_empty() {
        tracing::warn!(
            columns = best.outcome.unobservable.len(),
            "variables with zero Jacobian norm were never observable"
        );
    }
    let summary =
        diagnostics::diagnose_with_unobservable(project, best.outcome.unobservable.clone());
    tracing::debug!(
        worst = ?summary.worst_observations.first(),
        cameras = summary.per_camera.len(),
        "post-solve diagnostics"
    );

    let quality = grade(&best.outcome, median);
    let error = match (&best.outcome.reason, best.outcome.converged) {
        (_, true) => None,
        (TerminationReason::IterationCap, false) => {
            Some(SolveError::DidNotConverge("iteration cap reached").to_string())
        }
        (TerminationReason::DampingSaturated, false) => {
            Some(SolveError::DidNotConverge("damping saturated").to_string())
        }
        _ => None,
    };

    SolveReport {
        converged: best.outcome.converged,
        iterations: total_iterations,
        total_error: best.outcome.final_cost,
        median_reprojection_error: median,
        quality,
        outliers: outliers.iter().map(|o| EntityRef::ImagePoint(*o)).collect(),
        cameras_initialized: candidates[best.candidate].cameras_initialized.clone(),
        elapsed_ms: elapsed_ms(started),
        error,
    }
}

fn grade(outcome: &LmOutcome, median: Option<f64>) -> Quality {
    if !outcome.final_cost.is_finite() {
        return Quality::Diverged;
    }
    match median {
        Some(median) => Quality::from_median_reprojection_px(median),
        None => Quality::Unknown,
    }
}

fn better_median(new: Option<f64>, old: Option<f64>) -> bool {
    match (new, old) {
        (Some(n), Some(o)) => n < o,
        (Some(_), None) => true,
        _ => false,
    }
}

fn cancelled_report(iterations: usize, elapsed_ms: f64) -> SolveReport {
    let mut report = SolveReport::failed(SolveError::Cancelled.to_string(), elapsed_ms);
    report.iterations = iterations;
    report
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1e3
}

/// Quantized cost for candidate deduplication.
fn cost_hash(cost: f64) -> i64 {
    if !cost.is_finite() {
        return i64::MAX;
    }
    (cost * 1e6).clamp(-9e15, 9e15).round() as i64
}
