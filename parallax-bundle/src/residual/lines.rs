//! Residuals for line entities: axis/plane direction tags, target length,
//! and the parallel / perpendicular line-pair constraints.

use nalgebra::{DVector, Vector3};
use parallax_types::{EntityRef, LineId, PointId};

use crate::layout::VariableLayout;
use crate::residual::{local_index, sorted_columns, ResidualProvider};

/// Local column map of one endpoint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndpointCols {
    pub index: usize,
    pub local: [Option<usize>; 3],
}

pub(crate) fn endpoint_columns(layout: &VariableLayout, points: &[PointId]) -> (Vec<usize>, Vec<EndpointCols>) {
    let mut cols = Vec::new();
    for p in points {
        cols.extend(layout.point_slots(p.0).xyz.iter().filter_map(|s| s.column()));
    }
    let columns = sorted_columns(cols);
    let endpoints = points
        .iter()
        .map(|p| {
            let slots = layout.point_slots(p.0);
            EndpointCols {
                index: p.0,
                local: std::array::from_fn(|i| {
                    slots.xyz[i].column().map(|c| local_index(&columns, c))
                }),
            }
        })
        .collect();
    (columns, endpoints)
}

/// Add `grad` into a jacobian row at an endpoint's free columns, scaled by
/// `sign` (+1 for the head of a delta, -1 for the tail).
fn add_point_gradient(dst: &mut [f64], endpoint: &EndpointCols, grad: &Vector3<f64>, sign: f64) {
    for axis in 0..3 {
        if let Some(local) = endpoint.local[axis] {
            dst[local] += sign * grad[axis];
        }
    }
}

/// Direction-tag residual.
///
/// Axis tags emit the two delta components perpendicular to the axis (k=2);
/// plane tags emit the single component along the excluded axis (k=1).
pub(crate) struct LineDirectionProvider {
    a: EndpointCols,
    b: EndpointCols,
    /// Component indices of `b - a` that must vanish.
    zero_components: Vec<usize>,
    columns: Vec<usize>,
    sources: [EntityRef; 1],
}

impl LineDirectionProvider {
    /// `None` when the tag constrains nothing (`Free`).
    pub fn new(
        layout: &VariableLayout,
        line: LineId,
        a: PointId,
        b: PointId,
        direction: parallax_types::LineDirection,
    ) -> Option<Self> {
        let zero_components = if let Some(axis) = direction.axis_index() {
            vec![(axis + 1) % 3, (axis + 2) % 3]
        } else if let Some(excluded) = direction.excluded_axis_index() {
            vec![excluded]
        } else {
            return None;
        };
        let (columns, endpoints) = endpoint_columns(layout, &[a, b]);
        Some(Self {
            a: endpoints[0],
            b: endpoints[1],
            zero_components,
            columns,
            sources: [EntityRef::Line(line)],
        })
    }
}

impl ResidualProvider for LineDirectionProvider {
    fn residual_count(&self) -> usize {
        self.zero_components.len()
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
        let d = pb - pa;
        for (row, &component) in self.zero_components.iter().enumerate() {
            residuals[row] = d[component];
        }
        if let Some(jac) = jacobian {
            let ncols = self.columns.len();
            for (row, &component) in self.zero_components.iter().enumerate() {
                let dst = &mut jac[row * ncols..(row + 1) * ncols];
                let mut grad = Vector3::zeros();
                grad[component] = 1.0;
                add_point_gradient(dst, &self.b, &grad, 1.0);
                add_point_gradient(dst, &self.a, &grad, -1.0);
            }
        }
        true
    }
}

/// `|B - A| - target_length`, one row.
pub(crate) struct LineLengthProvider {
    a: EndpointCols,
    b: EndpointCols,
    target: f64,
    columns: Vec<usize>,
    sources: [EntityRef; 1],
}

impl LineLengthProvider {
    pub fn new(layout: &VariableLayout, line: LineId, a: PointId, b: PointId, target: f64) -> Self {
        let (columns, endpoints) = endpoint_columns(layout, &[a, b]);
        Self {
            a: endpoints[0],
            b: endpoints[1],
            target,
            columns,
            sources: [EntityRef::Line(line)],
        }
    }
}

impl ResidualProvider for LineLengthProvider {
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
        let d = pb - pa;
        let len = d.norm();
        if len < 1e-12 {
            // Coincident endpoints: no usable direction for the gradient.
            return false;
        }
        residuals[0] = len - self.target;
        if let Some(jac) = jacobian {
            let unit = d / len;
            add_point_gradient(jac, &self.b, &unit, 1.0);
            add_point_gradient(jac, &self.a, &unit, -1.0);
        }
        true
    }
}

/// Shared base of the line-pair constraints: two lines, four endpoints.
struct LinePair {
    a0: EndpointCols,
    a1: EndpointCols,
    b0: EndpointCols,
    b1: EndpointCols,
    columns: Vec<usize>,
    sources: [EntityRef; 1],
}

impl LinePair {
    fn new(
        layout: &VariableLayout,
        constraint: parallax_types::ConstraintId,
        line_a: (PointId, PointId),
        line_b: (PointId, PointId),
    ) -> Self {
        let (columns, endpoints) =
            endpoint_columns(layout, &[line_a.0, line_a.1, line_b.0, line_b.1]);
        Self {
            a0: endpoints[0],
            a1: endpoints[1],
            b0: endpoints[2],
            b1: endpoints[3],
            columns,
            sources: [EntityRef::Constraint(constraint)],
        }
    }

    fn deltas(&self, layout: &VariableLayout, x: &DVector<f64>) -> (Vector3<f64>, Vector3<f64>) {
        let d1 = layout.point_position(self.a1.index, x) - layout.point_position(self.a0.index, x);
        let d2 = layout.point_position(self.b1.index, x) - layout.point_position(self.b0.index, x);
        (d1, d2)
    }

    /// Chain gradients w.r.t. the two direction vectors onto the endpoints.
    fn write_direction_gradients(
        &self,
        dst: &mut [f64],
        grad_d1: &Vector3<f64>,
        grad_d2: &Vector3<f64>,
    ) {
        add_point_gradient(dst, &self.a1, grad_d1, 1.0);
        add_point_gradient(dst, &self.a0, grad_d1, -1.0);
        add_point_gradient(dst, &self.b1, grad_d2, 1.0);
        add_point_gradient(dst, &self.b0, grad_d2, -1.0);
    }
}

/// Parallelism via the cross-product magnitude,
/// `|d1 x d2| / (|d1| |d2|)` -- zero iff parallel, stable near both 0 and
/// 180 degrees.
pub(crate) struct ParallelLinesProvider {
    pair: LinePair,
}

impl ParallelLinesProvider {
    pub fn new(
        layout: &VariableLayout,
        constraint: parallax_types::ConstraintId,
        line_a: (PointId, PointId),
        line_b: (PointId, PointId),
    ) -> Self {
        Self {
            pair: LinePair::new(layout, constraint, line_a, line_b),
        }
    }
}

impl ResidualProvider for ParallelLinesProvider {
    fn residual_count(&self) -> usize {
        1
    }

    fn columns(&self) -> &[usize] {
        &self.pair.columns
    }

    fn sources(&self) -> &[EntityRef] {
        &self.pair.sources
    }

    fn evaluate(
        &self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        residuals: &mut [f64],
        jacobian: Option<&mut [f64]>,
    ) -> bool {
        let (d1, d2) = self.pair.deltas(layout, x);
        let s1 = d1.norm();
        let s2 = d2.norm();
        if s1 < 1e-12 || s2 < 1e-12 {
            return false;
        }
        let c = d1.cross(&d2);
        let n = c.norm();
        let r = n / (s1 * s2);
        residuals[0] = r;
        if let Some(jac) = jacobian {
            if n < 1e-12 {
                // Exactly parallel: the magnitude is at its smooth minimum
                // and the gradient vanishes.
                return true;
            }
            let c_hat = c / n;
            // d|c|/d(d1) = d2 x c_hat, d|c|/d(d2) = c_hat x d1
            let dn_d1 = d2.cross(&c_hat);
            let dn_d2 = c_hat.cross(&d1);
            let grad_d1 = dn_d1 / (s1 * s2) - d1 * (r / (s1 * s1));
            let grad_d2 = dn_d2 / (s1 * s2) - d2 * (r / (s2 * s2));
            self.pair.write_direction_gradients(jac, &grad_d1, &grad_d2);
        }
        true
    }
}

/// Perpendicularity: dot product of the unit direction vectors.
pub(crate) struct PerpendicularLinesProvider {
    pair: LinePair,
}

impl PerpendicularLinesProvider {
    pub fn new(
        layout: &VariableLayout,
        constraint: parallax_types::ConstraintId,
        line_a: (PointId, PointId),
        line_b: (PointId, PointId),
    ) -> Self {
        Self {
            pair: LinePair::new(layout, constraint, line_a, line_b),
        }
    }
}

impl ResidualProvider for PerpendicularLinesProvider {
    fn residual_count(&self) -> usize {
        1
    }

    fn columns(&self) -> &[usize] {
        &self.pair.columns
    }

    fn sources(&self) -> &[EntityRef] {
        &self.pair.sources
    }

    fn evaluate(
        &self,
        layout: &VariableLayout,
        x: &DVector<f64>,
        residuals: &mut [f64],
        jacobian: Option<&mut [f64]>,
    ) -> bool {
        let (d1, d2) = self.pair.deltas(layout, x);
        let s1 = d1.norm();
        let s2 = d2.norm();
        if s1 < 1e-12 || s2 < 1e-12 {
            return false;
        }
        let u1 = d1 / s1;
        let u2 = d2 / s2;
        let r = u1.dot(&u2);
        residuals[0] = r;
        if let Some(jac) = jacobian {
            let grad_d1 = (u2 - u1 * r) / s1;
            let grad_d2 = (u1 - u2 * r) / s2;
            self.pair.write_direction_gradients(jac, &grad_d1, &grad_d2);
        }
        true
    }
}
