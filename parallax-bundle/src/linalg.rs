//! The small linear-algebra kernel under the LM driver.
//!
//! A compressed-sparse-row Jacobian with a fixed structure and rewritable
//! values, the matrix-vector products the conjugate-gradient inner solve is
//! built from, the Jacobi-preconditioned CG itself, and a symmetric 3x3
//! eigensolver for plane fitting. `J^T J` is never formed; the CG operator
//! evaluates `J^T (J p)` product by product.

use nalgebra::{DVector, Matrix3, Vector3};

use crate::SolveError;

/// Relative-residual target of the CG inner solve.
pub const CG_TOLERANCE: f64 = 1e-8;
/// Breakdown threshold for the CG denominator `p . A p`.
pub const CG_BREAKDOWN: f64 = 1e-30;

/// Sparse matrix in compressed-sparse-row form.
///
/// The structure (`row_ptr`, `col_idx`) is fixed at assembly; only `values`
/// are rewritten between iterations, so no allocation happens inside the LM
/// loop.
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    nrows: usize,
    ncols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl CsrMatrix {
    /// Build the structure from per-row column lists. Columns within a row
    /// must be sorted and unique.
    pub fn from_rows(ncols: usize, rows: &[Vec<usize>]) -> Self {
        let mut row_ptr = Vec::with_capacity(rows.len() + 1);
        let mut col_idx = Vec::new();
        row_ptr.push(0);
        for row in rows {
            debug_assert!(row.windows(2).all(|w| w[0] < w[1]));
            debug_assert!(row.iter().all(|&c| c < ncols));
            col_idx.extend_from_slice(row);
            row_ptr.push(col_idx.len());
        }
        let values = vec![0.0; col_idx.len()];
        Self {
            nrows: rows.len(),
            ncols,
            row_ptr,
            col_idx,
            values,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Mutable values of one row, in the column order given at construction.
    pub fn row_values_mut(&mut self, row: usize) -> &mut [f64] {
        let lo = self.row_ptr[row];
        let hi = self.row_ptr[row + 1];
        &mut self.values[lo..hi]
    }

    pub fn row_entries(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let lo = self.row_ptr[row];
        let hi = self.row_ptr[row + 1];
        self.col_idx[lo..hi]
            .iter()
            .copied()
            .zip(self.values[lo..hi].iter().copied())
    }

    /// `out = A x`.
    pub fn mul_vec(&self, x: &DVector<f64>, out: &mut DVector<f64>) {
        debug_assert_eq!(x.len(), self.ncols);
        debug_assert_eq!(out.len(), self.nrows);
        for row in 0..self.nrows {
            let lo = self.row_ptr[row];
            let hi = self.row_ptr[row + 1];
            let mut acc = 0.0;
            for k in lo..hi {
                acc += self.values[k] * x[self.col_idx[k]];
            }
            out[row] = acc;
        }
    }

    /// `out = A^T x`.
    pub fn mul_transpose_vec(&self, x: &DVector<f64>, out: &mut DVector<f64>) {
        debug_assert_eq!(x.len(), self.nrows);
        debug_assert_eq!(out.len(), self.ncols);
        out.fill(0.0);
        for row in 0..self.nrows {
            let lo = self.row_ptr[row];
            let hi = self.row_ptr[row + 1];
            let xr = x[row];
            if xr == 0.0 {
                continue;
            }
            for k in lo..hi {
                out[self.col_idx[k]] += self.values[k] * xr;
            }
        }
    }

    /// `diag(A^T A)`: per-column sums of squares.
    pub fn column_squared_norms(&self, out: &mut DVector<f64>) {
        debug_assert_eq!(out.len(), self.ncols);
        out.fill(0.0);
        for (&c, &v) in self.col_idx.iter().zip(self.values.iter()) {
            out[c] += v * v;
        }
    }

    pub fn values_are_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Reusable buffers for [`solve_normal_equations`], allocated once per solve.
#[derive(Debug, Clone)]
pub struct CgWorkspace {
    resid: DVector<f64>,
    z: DVector<f64>,
    p: DVector<f64>,
    jp: DVector<f64>,
    ap: DVector<f64>,
}

impl CgWorkspace {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            resid: DVector::zeros(ncols),
            z: DVector::zeros(ncols),
            p: DVector::zeros(ncols),
            jp: DVector::zeros(nrows),
            ap: DVector::zeros(ncols),
        }
    }
}

/// Jacobi-preconditioned CG on the damped normal equations
/// `(J^T J + diag(damped)) delta = rhs`.
///
/// The operator is evaluated as `J^T (J p) + damped .* p`; `precond` is the
/// diagonal preconditioner (typically `D + lambda D`). Terminates at a
/// relative residual of [`CG_TOLERANCE`] or after `2 n` iterations. Fails
/// with [`SolveError::NumericalBreakdown`] on a non-positive preconditioner
/// diagonal or a vanishing `p . A p`.
pub fn solve_normal_equations(
    jac: &CsrMatrix,
    damped: &DVector<f64>,
    precond: &DVector<f64>,
    rhs: &DVector<f64>,
    ws: &mut CgWorkspace,
    delta: &mut DVector<f64>,
) -> Result<usize, SolveError> {
    let n = jac.ncols();
    if precond.iter().any(|&d| d <= 0.0 || !d.is_finite()) {
        return Err(SolveError::NumericalBreakdown(
            "non-positive preconditioner diagonal",
        ));
    }

    delta.fill(0.0);
    ws.resid.copy_from(rhs);
    let rhs_norm = ws.resid.norm();
    if rhs_norm == 0.0 {
        return Ok(0);
    }

    // z = M^-1 r, p = z
    ws.z.zip_zip_apply(&ws.resid, precond, |z, r, m| *z = r / m);
    ws.p.copy_from(&ws.z);
    let mut rz = ws.resid.dot(&ws.z);

    let max_iterations = 2 * n;
    for iteration in 0..max_iterations {
        // A p = J^T (J p) + damped .* p
        jac.mul_vec(&ws.p, &mut ws.jp);
        jac.mul_transpose_vec(&ws.jp, &mut ws.ap);
        ws.ap.zip_zip_apply(damped, &ws.p, |a, d, p| *a += d * p);

        let p_ap = ws.p.dot(&ws.ap);
        if p_ap.abs() < CG_BREAKDOWN || !p_ap.is_finite() {
            return Err(SolveError::NumericalBreakdown("CG denominator vanished"));
        }
        let alpha = rz / p_ap;
        delta.axpy(alpha, &ws.p, 1.0);
        ws.resid.axpy(-alpha, &ws.ap, 1.0);

        if ws.resid.norm() < CG_TOLERANCE * rhs_norm {
            return Ok(iteration + 1);
        }

        ws.z.zip_zip_apply(&ws.resid, precond, |z, r, m| *z = r / m);
        let rz_next = ws.resid.dot(&ws.z);
        let beta = rz_next / rz;
        rz = rz_next;
        // p = z + beta p
        ws.p.axpy(1.0, &ws.z, beta);
    }
    Ok(max_iterations)
}

/// Eigen-decomposition of a symmetric 3x3 matrix by cyclic Jacobi rotations.
///
/// Returns eigenvalues in ascending order with matching eigenvector columns.
pub fn sym_eigen3(a: &Matrix3<f64>) -> (Vector3<f64>, Matrix3<f64>) {
    let mut a = *a;
    let mut v = Matrix3::identity();

    for _sweep in 0..32 {
        let off = a[(0, 1)].abs() + a[(0, 2)].abs() + a[(1, 2)].abs();
        if off < 1e-15 {
            break;
        }
        for (p, q) in [(0usize, 1usize), (0, 2), (1, 2)] {
            let apq = a[(p, q)];
            if apq.abs() < 1e-300 {
                continue;
            }
            let theta = (a[(q, q)] - a[(p, p)]) / (2.0 * apq);
            let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
            let c = 1.0 / (t * t + 1.0).sqrt();
            let s = t * c;
            let mut rot = Matrix3::identity();
            rot[(p, p)] = c;
            rot[(q, q)] = c;
            rot[(p, q)] = s;
            rot[(q, p)] = -s;
            a = rot.transpose() * a * rot;
            v *= rot;
        }
    }

    let mut order = [0usize, 1, 2];
    order.sort_by(|&i, &j| a[(i, i)].total_cmp(&a[(j, j)]));
    let eigenvalues = Vector3::new(a[(order[0], order[0])], a[(order[1], order[1])], a[(order[2], order[2])]);
    let eigenvectors = Matrix3::from_columns(&[
        v.column(order[0]).into_owned(),
        v.column(order[1]).into_owned(),
        v.column(order[2]).into_owned(),
    ]);
    (eigenvalues, eigenvectors)
}
