//! Residual providers and their assembly into a sparse system.
//!
//! Every constraint variant (plus reprojection and the quaternion unit-norm)
//! implements [`ResidualProvider`]: a fixed residual count, a fixed set of
//! touched columns, and an evaluation that writes residuals and Jacobian
//! values into caller-supplied buffers. The [`ResidualSystem`] owns the CSR
//! Jacobian whose structure is assembled once; per-iteration evaluation only
//! rewrites values, so nothing allocates inside the LM loop.

use nalgebra::DVector;
use parallax_types::{EntityRef, RobustLoss};

use crate::layout::VariableLayout;
use crate::linalg::CsrMatrix;
use crate::SolveError;

pub(crate) mod lines;
pub(crate) mod points;
pub(crate) mod quatnorm;
pub(crate) mod reprojection;

#[cfg(test)]
pub(crate) mod tests_support;

/// Squared-error weight of the soft quaternion unit-norm residual. High so
/// that within-step drift away from unit magnitude is strongly penalized;
/// the post-step renormalization removes what remains.
pub(crate) const QUATERNION_NORM_WEIGHT: f64 = 1e6;

/// One residual block.
///
/// `evaluate` returns `false` when the provider is inactive for this iterate
/// (a reprojection whose point is behind the camera, a degenerate direction);
/// the system then zeroes its rows. When a Jacobian buffer is supplied it is
/// pre-zeroed, `residual_count() * columns().len()` long, row-major, with
/// column order identical to [`ResidualProvider::columns`].
pub(crate) trait ResidualProvider {
    fn residual_count(&self) -> usize;
    fn columns(&self) -> &[usize];
    /// Entities this block's residual magnitudes are attributed to.
    fn sources(&self) -> &[EntityRef];
    fn evaluate(
        &self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        residuals: &mut [f64],
        jacobian: Option<&mut [f64]>,
    ) -> bool;
}

/// Sorted global columns of a provider plus local-index lookup.
pub(crate) fn sorted_columns(mut cols: Vec<usize>) -> Vec<usize> {
    cols.sort_unstable();
    cols.dedup();
    cols
}

pub(crate) fn local_index(columns: &[usize], global: usize) -> usize {
    columns
        .binary_search(&global)
        .expect("column registered at construction")
}

/// Robust loss weight `w(r)`; residual rows are scaled by `sqrt(w)`.
pub(crate) fn loss_weight(loss: RobustLoss, scale: f64, residual_norm: f64) -> f64 {
    let s = residual_norm / scale;
    match loss {
        RobustLoss::None => 1.0,
        RobustLoss::Huber => {
            if s <= 1.0 {
                1.0
            } else {
                1.0 / s
            }
        }
        RobustLoss::Cauchy => 1.0 / (1.0 + s * s),
        RobustLoss::Tukey => {
            if s < 1.0 {
                let t = 1.0 - s * s;
                t * t
            } else {
                0.0
            }
        }
    }
}

/// Wraps a provider with a robust loss: the inner block is evaluated, then
/// residual rows and Jacobian rows are reweighted by `sqrt(w)` of the block's
/// residual norm. Reprojection is the intended user; geometric constraints
/// stay plain L2.
pub(crate) struct Robust<P> {
    inner: P,
    loss: RobustLoss,
    scale: f64,
}

impl<P: ResidualProvider> Robust<P> {
    pub fn new(inner: P, loss: RobustLoss, scale: f64) -> Self {
        let scale = if scale > 0.0 { scale } else { 1.0 };
        Self { inner, loss, scale }
    }
}

impl<P: ResidualProvider> ResidualProvider for Robust<P> {
    fn residual_count(&self) -> usize {
        self.inner.residual_count()
    }

    fn columns(&self) -> &[usize] {
        self.inner.columns()
    }

    fn sources(&self) -> &[EntityRef] {
        self.inner.sources()
    }

    fn evaluate(
        &self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        residuals: &mut [f64],
        mut jacobian: Option<&mut [f64]>,
    ) -> bool {
        if !self
            .inner
            .evaluate(layout, x, residuals, jacobian.as_deref_mut())
        {
            return false;
        }
        let norm = residuals.iter().map(|r| r * r).sum::<f64>().sqrt();
        let w = loss_weight(self.loss, self.scale, norm).sqrt();
        if w != 1.0 {
            for r in residuals.iter_mut() {
                *r *= w;
            }
            if let Some(jac) = jacobian {
                for v in jac.iter_mut() {
                    *v *= w;
                }
            }
        }
        true
    }
}

struct ProviderEntry {
    provider: Box<dyn ResidualProvider>,
    row_start: usize,
    /// `sqrt(priority)` (and any outlier down-weighting), applied to both
    /// residual and Jacobian rows.
    weight: f64,
    active: bool,
}

/// All providers of one solve, with the shared residual vector and CSR
/// Jacobian.
pub(crate) struct ResidualSystem {
    entries: Vec<ProviderEntry>,
    jacobian: CsrMatrix,
    residuals: DVector<f64>,
    scratch_residuals: Vec<f64>,
    scratch_jacobian: Vec<f64>,
    nrows: usize,
}

impl ResidualSystem {
    pub fn new(providers: Vec<(Box<dyn ResidualProvider>, f64)>, variable_count: usize) -> Self {
        let mut entries = Vec::with_capacity(providers.len());
        let mut rows: Vec<Vec<usize>> = Vec::new();
        let mut max_block_rows = 0;
        let mut max_block_len = 0;
        for (provider, weight) in providers {
            let k = provider.residual_count();
            let cols = provider.columns().to_vec();
            max_block_rows = max_block_rows.max(k);
            max_block_len = max_block_len.max(k * cols.len());
            entries.push(ProviderEntry {
                row_start: rows.len(),
                provider,
                weight: weight.max(0.0).sqrt(),
                active: true,
            });
            for _ in 0..k {
                rows.push(cols.clone());
            }
        }
        let nrows = rows.len();
        Self {
            entries,
            jacobian: CsrMatrix::from_rows(variable_count, &rows),
            residuals: DVector::zeros(nrows),
            scratch_residuals: vec![0.0; max_block_rows],
            scratch_jacobian: vec![0.0; max_block_len],
            nrows,
        }
    }

    pub fn residual_count(&self) -> usize {
        self.nrows
    }

    pub fn residuals(&self) -> &DVector<f64> {
        &self.residuals
    }

    pub fn jacobian(&self) -> &CsrMatrix {
        &self.jacobian
    }

    /// Evaluate every provider at `x`. Inactive providers contribute zero
    /// rows. Fails on non-finite values.
    pub fn evaluate(
        &mut self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        with_jacobian: bool,
    ) -> Result<f64, SolveError> {
        for entry in self.entries.iter_mut() {
            let k = entry.provider.residual_count();
            let ncols = entry.provider.columns().len();
            let block = &mut self.scratch_residuals[..k];
            block.fill(0.0);
            let jac_block = if with_jacobian {
                let j = &mut self.scratch_jacobian[..k * ncols];
                j.fill(0.0);
                Some(j)
            } else {
                None
            };

            entry.active = entry.provider.evaluate(layout, x, block, jac_block);

            for row in 0..k {
                let global_row = entry.row_start + row;
                let value = if entry.active {
                    entry.weight * self.scratch_residuals[row]
                } else {
                    0.0
                };
                self.residuals[global_row] = value;
                if with_jacobian {
                    let dst = self.jacobian.row_values_mut(global_row);
                    if entry.active {
                        for (d, s) in dst
                            .iter_mut()
                            .zip(self.scratch_jacobian[row * ncols..(row + 1) * ncols].iter())
                        {
                            *d = entry.weight * s;
                        }
                    } else {
                        dst.fill(0.0);
                    }
                }
            }
        }

        if !self.residuals.iter().all(|r| r.is_finite()) {
            return Err(SolveError::NumericalBreakdown("non-finite residual"));
        }
        if with_jacobian && !self.jacobian.values_are_finite() {
            return Err(SolveError::NumericalBreakdown("non-finite Jacobian"));
        }
        Ok(0.5 * self.residuals.norm_squared())
    }

    /// Providers inactive at the last evaluation (behind-camera
    /// observations, degenerate directions). A candidate that still has
    /// inactive blocks at its final state is an invalid configuration: its
    /// cost undercounts the true objective.
    pub fn inactive_blocks(&self) -> usize {
        self.entries.iter().filter(|e| !e.active).count()
    }

    /// Residual rows and sources per provider, for diagnostics bucketing.
    pub fn blocks(&self) -> impl Iterator<Item = (&[EntityRef], &[f64], bool)> + '_ {
        self.entries.iter().map(|entry| {
            let k = entry.provider.residual_count();
            let rows = &self.residuals.as_slice()[entry.row_start..entry.row_start + k];
            (entry.provider.sources(), rows, entry.active)
        })
    }
}

/// Instantiate one provider per active residual source in the project.
///
/// Registration order is deterministic: observations, quaternion norms,
/// lines, then constraints, each in arena order. Disabled constraints,
/// disabled lines, and observations of disabled viewpoints get no provider
/// at all. `observation_weights`, when given, multiplies the priority of
/// individual reprojection blocks (used to down-weight flagged outliers on a
/// re-run).
pub(crate) fn build_providers(
    project: &parallax_types::Project,
    layout: &VariableLayout,
    options: &parallax_types::SolverOptions,
    observation_weights: Option<&[f64]>,
) -> Vec<(Box<dyn ResidualProvider>, f64)> {
    use parallax_types::{ConstraintId, ConstraintKind, ImagePointId, LineId, ViewpointId};

    let mut providers: Vec<(Box<dyn ResidualProvider>, f64)> = Vec::new();

    for (i, ip) in project.image_points().iter().enumerate() {
        if !layout.camera_slots(ip.viewpoint.0).enabled {
            continue;
        }
        let weight = observation_weights.map(|w| w[i]).unwrap_or(1.0);
        let provider = reprojection::ReprojectionProvider::new(
            layout,
            ImagePointId(i),
            ip.world_point,
            ip.viewpoint,
            ip.pixel.coords,
        );
        if options.robust_loss == RobustLoss::None {
            providers.push((Box::new(provider), weight));
        } else {
            providers.push((
                Box::new(Robust::new(provider, options.robust_loss, options.robust_loss_scale)),
                weight,
            ));
        }
    }

    for camera in 0..layout.camera_count() {
        if let Some(provider) = quatnorm::QuaternionNormProvider::new(layout, ViewpointId(camera)) {
            providers.push((Box::new(provider), QUATERNION_NORM_WEIGHT));
        }
    }

    for (i, line) in project.lines().iter().enumerate() {
        if !line.enabled {
            continue;
        }
        if let Some(provider) =
            lines::LineDirectionProvider::new(layout, LineId(i), line.a, line.b, line.direction)
        {
            providers.push((Box::new(provider), 1.0));
        }
        if let Some(target) = line.target_length {
            providers.push((
                Box::new(lines::LineLengthProvider::new(layout, LineId(i), line.a, line.b, target)),
                1.0,
            ));
        }
    }

    for (i, constraint) in project.constraints().iter().enumerate() {
        if !constraint.enabled {
            continue;
        }
        let id = ConstraintId(i);
        let weight = constraint.priority;
        match &constraint.kind {
            ConstraintKind::Distance { a, b, target } => {
                providers.push((
                    Box::new(points::DistanceProvider::new(layout, id, *a, *b, *target)),
                    weight,
                ));
            }
            ConstraintKind::FixedPoint { point, target } => {
                providers.push((
                    Box::new(points::FixedPointProvider::new(layout, id, *point, *target)),
                    weight,
                ));
            }
            ConstraintKind::Collinear { points: group } => {
                if let Some(provider) = points::CollinearProvider::new(layout, id, group) {
                    providers.push((Box::new(provider), weight));
                }
            }
            ConstraintKind::Coplanar { points: group } => {
                if let Some(provider) = points::CoplanarProvider::new(layout, id, group) {
                    providers.push((Box::new(provider), weight));
                }
            }
            ConstraintKind::EqualDistances { pairs } => {
                if let Some(provider) = points::EqualDistancesProvider::new(layout, id, pairs) {
                    providers.push((Box::new(provider), weight));
                }
            }
            ConstraintKind::ParallelLines { a, b } => {
                let la = project.line(*a);
                let lb = project.line(*b);
                providers.push((
                    Box::new(lines::ParallelLinesProvider::new(
                        layout,
                        id,
                        (la.a, la.b),
                        (lb.a, lb.b),
                    )),
                    weight,
                ));
            }
            ConstraintKind::PerpendicularLines { a, b } => {
                let la = project.line(*a);
                let lb = project.line(*b);
                providers.push((
                    Box::new(lines::PerpendicularLinesProvider::new(
                        layout,
                        id,
                        (la.a, la.b),
                        (lb.a, lb.b),
                    )),
                    weight,
                ));
            }
        }
    }

    providers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::tests_support::simple_two_camera_project;
    use crate::state::SceneState;
    use nalgebra::{DMatrix, Vector2};
    use parallax_mvg::numeric::{compare_jacobians, numerical_jacobian};
    use parallax_types::{
        Constraint, ConstraintKind, ImagePointId, Line, LineDirection, PointId, SolverOptions,
        ViewpointId,
    };
    use std::cell::RefCell;

    #[test]
    fn loss_weights_behave() {
        for loss in [RobustLoss::Huber, RobustLoss::Cauchy, RobustLoss::Tukey] {
            // Small residuals keep (nearly) full weight...
            assert!(loss_weight(loss, 1.0, 0.1) > 0.9);
            // ...large residuals are strongly down-weighted.
            assert!(loss_weight(loss, 1.0, 10.0) < 0.15);
        }
        assert_eq!(loss_weight(RobustLoss::None, 1.0, 100.0), 1.0);
        // Tukey redescends to a hard zero.
        assert_eq!(loss_weight(RobustLoss::Tukey, 1.0, 2.0), 0.0);
    }

    /// Differentiates the entire assembled residual vector numerically,
    /// exercising provider registration, priority weighting, and the CSR
    /// value layout in one sweep.
    #[test]
    fn assembled_jacobian_matches_numeric() {
        let mut project = simple_two_camera_project();
        let mut constraint = Constraint::new(ConstraintKind::Distance {
            a: PointId(0),
            b: PointId(1),
            target: 1.0,
        });
        constraint.priority = 2.0;
        project.add_constraint(constraint);
        let mut line = Line::new("edge", PointId(0), PointId(1));
        line.direction = LineDirection::Xy;
        line.target_length = Some(1.2);
        project.add_line(line);

        let state = SceneState::from_project(&project);
        let options = SolverOptions::default();
        let layout = VariableLayout::build(&project, &state, &options, None);
        let providers = build_providers(&project, &layout, &options, None);
        let system = RefCell::new(ResidualSystem::new(providers, layout.variable_count()));
        let x0 = layout.initial_values();

        system.borrow_mut().evaluate(&layout, &x0, true).unwrap();
        let m = system.borrow().residual_count();
        let n = layout.variable_count();
        let mut analytic = DMatrix::zeros(m, n);
        {
            let sys = system.borrow();
            for row in 0..m {
                for (col, v) in sys.jacobian().row_entries(row) {
                    analytic[(row, col)] = v;
                }
            }
        }

        let numeric = numerical_jacobian(
            |x| {
                system.borrow_mut().evaluate(&layout, x, false).ok()?;
                let sys = system.borrow();
                Some(DVector::from_column_slice(sys.residuals().as_slice()))
            },
            &x0,
            1e-6,
        )
        .unwrap();

        let report = compare_jacobians(&analytic, &numeric);
        assert!(
            report.frobenius_relative_error < 1e-4,
            "assembled jacobian mismatch: {report:?}"
        );
    }

    #[test]
    fn robust_wrapper_scales_rows_by_sqrt_weight() {
        let project = simple_two_camera_project();
        let state = SceneState::from_project(&project);
        let options = SolverOptions::default();
        let layout = VariableLayout::build(&project, &state, &options, None);

        // Observation far off its projection: a strong outlier.
        let make = || {
            reprojection::ReprojectionProvider::new(
                &layout,
                ImagePointId(0),
                PointId(1),
                ViewpointId(0),
                Vector2::new(-400.0, 900.0),
            )
        };
        let x = layout.initial_values();
        let plain = make();
        let ncols = plain.columns().len();
        let mut r_plain = [0.0; 2];
        let mut j_plain = vec![0.0; 2 * ncols];
        assert!(plain.evaluate(&layout, &x, &mut r_plain, Some(&mut j_plain)));

        let scale = 2.0;
        let wrapped = Robust::new(make(), RobustLoss::Huber, scale);
        let mut r_wrapped = [0.0; 2];
        let mut j_wrapped = vec![0.0; 2 * ncols];
        assert!(wrapped.evaluate(&layout, &x, &mut r_wrapped, Some(&mut j_wrapped)));

        let norm = (r_plain[0] * r_plain[0] + r_plain[1] * r_plain[1]).sqrt();
        let w = loss_weight(RobustLoss::Huber, scale, norm).sqrt();
        assert!(w < 1.0, "fixture should be an outlier, weight {w}");
        for (plain, wrapped) in r_plain.iter().zip(&r_wrapped) {
            approx::assert_relative_eq!(*wrapped, plain * w, epsilon = 1e-12);
        }
        for (plain, wrapped) in j_plain.iter().zip(&j_wrapped) {
            approx::assert_relative_eq!(*wrapped, plain * w, epsilon = 1e-12);
        }
    }
}
