//! Residuals for point-group constraints: distance, fixed point,
//! collinearity, coplanarity, and equal distances.

use nalgebra::{DVector, Vector3};
use parallax_types::{ConstraintId, EntityRef, PointId};

use crate::layout::VariableLayout;
use crate::residual::lines::{endpoint_columns, EndpointCols};
use crate::residual::ResidualProvider;

fn add_grad(dst: &mut [f64], endpoint: &EndpointCols, grad: &Vector3<f64>, sign: f64) {
    for axis in 0..3 {
        if let Some(local) = endpoint.local[axis] {
            dst[local] += sign * grad[axis];
        }
    }
}

/// `|A - B| - target`, one row.
pub(crate) struct DistanceProvider {
    a: EndpointCols,
    b: EndpointCols,
    target: f64,
    columns: Vec<usize>,
    sources: Vec<EntityRef>,
}

impl DistanceProvider {
    pub fn new(
        layout: &VariableLayout,
        constraint: ConstraintId,
        a: PointId,
        b: PointId,
        target: f64,
    ) -> Self {
        let (columns, endpoints) = endpoint_columns(layout, &[a, b]);
        Self {
            a: endpoints[0],
            b: endpoints[1],
            target,
            columns,
            sources: vec![
                EntityRef::Constraint(constraint),
                EntityRef::Point(a),
                EntityRef::Point(b),
            ],
        }
    }
}

impl ResidualProvider for DistanceProvider {
    fn residual_count(&self) -> usize {
        1
    }

    fn columns(&self) -> &[usize] {
        &self.columns
    }

    fn sources(&self) -> &[EntityRef] {
        &self.sources
    }

    fn evaluate(
        &self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        residuals: &mut [f64],
        jacobian: Option<&mut [f64]>,
    ) -> bool {
        let pa = layout.point_position(self.a.index, x);
        let pb = layout.point_position(self.b.index, x);
        let d = pa - pb;
        let len = d.norm();
        if len < 1e-12 {
            return false;
        }
        residuals[0] = len - self.target;
        if let Some(jac) = jacobian {
            let unit = d / len;
            add_grad(jac, &self.a, &unit, 1.0);
            add_grad(jac, &self.b, &unit, -1.0);
        }
        true
    }
}

/// `P - target`, three rows. The soft counterpart of axis locks.
pub(crate) struct FixedPointProvider {
    point: EndpointCols,
    target: Vector3<f64>,
    columns: Vec<usize>,
    sources: Vec<EntityRef>,
}

impl FixedPointProvider {
    pub fn new(
        layout: &VariableLayout,
        constraint: ConstraintId,
        point: PointId,
        target: Vector3<f64>,
    ) -> Self {
        let (columns, endpoints) = endpoint_columns(layout, &[point]);
        Self {
            point: endpoints[0],
            target,
            columns,
            sources: vec![EntityRef::Constraint(constraint), EntityRef::Point(point)],
        }
    }
}

impl ResidualProvider for FixedPointProvider {
    fn residual_count(&self) -> usize {
        3
    }

    fn columns(&self) -> &[usize] {
        &self.columns
    }

    fn sources(&self) -> &[EntityRef] {
        &self.sources
    }

    fn evaluate(
        &self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        residuals: &mut [f64],
        jacobian: Option<&mut [f64]>,
    ) -> bool {
        let p = layout.point_position(self.point.index, x);
        let r = p - self.target;
        residuals.copy_from_slice(r.as_slice());
        if let Some(jac) = jacobian {
            let ncols = self.columns.len();
            for row in 0..3 {
                if let Some(local) = self.point.local[row] {
                    jac[row * ncols + local] += 1.0;
                }
            }
        }
        true
    }
}

/// Collinearity of `n` points: for each `i >= 2`, the magnitude of
/// `(P_i - P_0) x (P_1 - P_0)`, giving `n - 2` rows.
pub(crate) struct CollinearProvider {
    points: Vec<EndpointCols>,
    columns: Vec<usize>,
    sources: Vec<EntityRef>,
}

impl CollinearProvider {
    /// `None` for fewer than three points (nothing to constrain).
    pub fn new(layout: &VariableLayout, constraint: ConstraintId, points: &[PointId]) -> Option<Self> {
        if points.len() < 3 {
            return None;
        }
        let (columns, endpoints) = endpoint_columns(layout, points);
        let mut sources = vec![EntityRef::Constraint(constraint)];
        sources.extend(points.iter().map(|p| EntityRef::Point(*p)));
        Some(Self {
            points: endpoints,
            columns,
            sources,
        })
    }
}

impl ResidualProvider for CollinearProvider {
    fn residual_count(&self) -> usize {
        self.points.len() - 2
    }

    fn columns(&self) -> &[usize] {
        &self.columns
    }

    fn sources(&self) -> &[EntityRef] {
        &self.sources
    }

    fn evaluate(
        &self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        residuals: &mut [f64],
        jacobian: Option<&mut [f64]>,
    ) -> bool {
        let p0 = layout.point_position(self.points[0].index, x);
        let p1 = layout.point_position(self.points[1].index, x);
        let v = p1 - p0;
        let ncols = self.columns.len();
        let mut jac = jacobian;
        for (row, ep) in self.points[2..].iter().enumerate() {
            let pi = layout.point_position(ep.index, x);
            let u = pi - p0;
            let c = u.cross(&v);
            let n = c.norm();
            residuals[row] = n;
            if let Some(jac) = jac.as_deref_mut() {
                if n < 1e-12 {
                    // At the satisfied configuration the magnitude gradient
                    // vanishes; leave the row zero.
                    continue;
                }
                let c_hat = c / n;
                let dst = &mut jac[row * ncols..(row + 1) * ncols];
                let grad_u = v.cross(&c_hat);
                let grad_v = c_hat.cross(&u);
                add_grad(dst, ep, &grad_u, 1.0);
                add_grad(dst, &self.points[1], &grad_v, 1.0);
                let grad_p0 = -(grad_u + grad_v);
                add_grad(dst, &self.points[0], &grad_p0, 1.0);
            }
        }
        true
    }
}

/// Coplanarity of `n` points: for each `i >= 3`, the signed triple product
/// `(P_i - P_0) . ((P_1 - P_0) x (P_2 - P_0))`, giving `n - 3` rows.
pub(crate) struct CoplanarProvider {
    points: Vec<EndpointCols>,
    columns: Vec<usize>,
    sources: Vec<EntityRef>,
}

impl CoplanarProvider {
    /// `None` for fewer than four points (always coplanar).
    pub fn new(layout: &VariableLayout, constraint: ConstraintId, points: &[PointId]) -> Option<Self> {
        if points.len() < 4 {
            return None;
        }
        let (columns, endpoints) = endpoint_columns(layout, points);
        let mut sources = vec![EntityRef::Constraint(constraint)];
        sources.extend(points.iter().map(|p| EntityRef::Point(*p)));
        Some(Self {
            points: endpoints,
            columns,
            sources,
        })
    }
}

impl ResidualProvider for CoplanarProvider {
    fn residual_count(&self) -> usize {
        self.points.len() - 3
    }

    fn columns(&self) -> &[usize] {
        &self.columns
    }

    fn sources(&self) -> &[EntityRef] {
        &self.sources
    }

    fn evaluate(
        &self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        residuals: &mut [f64],
        jacobian: Option<&mut [f64]>,
    ) -> bool {
        let p0 = layout.point_position(self.points[0].index, x);
        let v = layout.point_position(self.points[1].index, x) - p0;
        let w = layout.point_position(self.points[2].index, x) - p0;
        let normal = v.cross(&w);
        let ncols = self.columns.len();
        let mut jac = jacobian;
        for (row, ep) in self.points[3..].iter().enumerate() {
            let u = layout.point_position(ep.index, x) - p0;
            residuals[row] = u.dot(&normal);
            if let Some(jac) = jac.as_deref_mut() {
                let dst = &mut jac[row * ncols..(row + 1) * ncols];
                let grad_u = normal;
                let grad_v = w.cross(&u);
                let grad_w = u.cross(&v);
                add_grad(dst, ep, &grad_u, 1.0);
                add_grad(dst, &self.points[1], &grad_v, 1.0);
                add_grad(dst, &self.points[2], &grad_w, 1.0);
                let grad_p0 = -(grad_u + grad_v + grad_w);
                add_grad(dst, &self.points[0], &grad_p0, 1.0);
            }
        }
        true
    }
}

/// Equal segment lengths: `|A_j - B_j| - |A_0 - B_0|` for `j >= 1`,
/// giving `m - 1` rows.
pub(crate) struct EqualDistancesProvider {
    pairs: Vec<(EndpointCols, EndpointCols)>,
    columns: Vec<usize>,
    sources: Vec<EntityRef>,
}

impl EqualDistancesProvider {
    /// `None` for fewer than two pairs.
    pub fn new(
        layout: &VariableLayout,
        constraint: ConstraintId,
        pairs: &[(PointId, PointId)],
    ) -> Option<Self> {
        if pairs.len() < 2 {
            return None;
        }
        let flat: Vec<PointId> = pairs.iter().flat_map(|(a, b)| [*a, *b]).collect();
        let (columns, endpoints) = endpoint_columns(layout, &flat);
        let pairs = endpoints
            .chunks_exact(2)
            .map(|chunk| (chunk[0], chunk[1]))
            .collect();
        let mut sources = vec![EntityRef::Constraint(constraint)];
        sources.extend(flat.iter().map(|p| EntityRef::Point(*p)));
        Some(Self {
            pairs,
            columns,
            sources,
        })
    }
}

impl ResidualProvider for EqualDistancesProvider {
    fn residual_count(&self) -> usize {
        self.pairs.len() - 1
    }

    fn columns(&self) -> &[usize] {
        &self.columns
    }

    fn sources(&self) -> &[EntityRef] {
        &self.sources
    }

    fn evaluate(
        &self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        residuals: &mut [f64],
        jacobian: Option<&mut [f64]>,
    ) -> bool {
        let delta_of = |pair: &(EndpointCols, EndpointCols)| {
            let d = layout.point_position(pair.0.index, x) - layout.point_position(pair.1.index, x);
            let n = d.norm();
            (d, n)
        };
        let (d0, n0) = delta_of(&self.pairs[0]);
        if n0 < 1e-12 {
            return false;
        }
        let unit0 = d0 / n0;
        let ncols = self.columns.len();
        let mut jac = jacobian;
        for (row, pair) in self.pairs[1..].iter().enumerate() {
            let (d, n) = delta_of(pair);
            if n < 1e-12 {
                return false;
            }
            residuals[row] = n - n0;
            if let Some(jac) = jac.as_deref_mut() {
                let dst = &mut jac[row * ncols..(row + 1) * ncols];
                let unit = d / n;
                add_grad(dst, &pair.0, &unit, 1.0);
                add_grad(dst, &pair.1, &unit, -1.0);
                add_grad(dst, &self.pairs[0].0, &unit0, -1.0);
                add_grad(dst, &self.pairs[0].1, &unit0, 1.0);
            }
        }
        true
    }
}
