//! Quaternion rotation in terms of the four scalars.
//!
//! The solver treats a camera rotation as four free scalars with a soft
//! unit-norm residual, so everything here works on a raw
//! [`nalgebra::Quaternion`] and uses the quadratic expansion
//!
//! ```text
//! q v q* = (w^2 - u.u) v + 2 (u.v) u + 2 w (u x v),   u = (x, y, z)
//! ```
//!
//! whose derivatives with respect to `w, x, y, z` are plain polynomials. For
//! a unit quaternion this is exactly the rotation by `q`; for a
//! nearly-unit quaternion it scales the result by `|q|^2`, which the
//! unit-norm residual keeps within tolerance during iteration.

use nalgebra::{Matrix3, Matrix3x4, Quaternion, RealField, UnitQuaternion, Vector3};

/// Rotate `v` by `q` using the `q v q*` expansion.
pub fn rotate<R: RealField + Copy>(q: &Quaternion<R>, v: &Vector3<R>) -> Vector3<R> {
    let two: R = nalgebra::convert(2.0);
    let u = Vector3::new(q.i, q.j, q.k);
    let w = q.w;
    v * (w * w - u.dot(&u)) + u * (u.dot(v) * two) + u.cross(v) * (two * w)
}

/// Rotate `v` by the conjugate of `q` (the inverse rotation for unit `q`).
pub fn rotate_conj<R: RealField + Copy>(q: &Quaternion<R>, v: &Vector3<R>) -> Vector3<R> {
    rotate(&q.conjugate(), v)
}

/// The matrix of the `q v q*` map: `d(rotate(q, v)) / dv`.
///
/// Equals the rotation matrix of `q` when `|q| = 1`.
pub fn rotation_matrix<R: RealField + Copy>(q: &Quaternion<R>) -> Matrix3<R> {
    let two: R = nalgebra::convert(2.0);
    let u = Vector3::new(q.i, q.j, q.k);
    let w = q.w;
    let mut m = Matrix3::identity() * (w * w - u.dot(&u));
    m += u * u.transpose() * two;
    m += cross_matrix(&u) * (two * w);
    m
}

/// `d(rotate(q, v)) / d(w, x, y, z)` for fixed `v`, one column per scalar.
pub fn rotation_jacobian_wrt_q<R: RealField + Copy>(
    q: &Quaternion<R>,
    v: &Vector3<R>,
) -> Matrix3x4<R> {
    let two: R = nalgebra::convert(2.0);
    let u = Vector3::new(q.i, q.j, q.k);
    let w = q.w;
    let udotv = u.dot(v);

    let dw = (v * w + u.cross(v)) * two;
    let mut jac = Matrix3x4::zeros();
    jac.set_column(0, &dw);
    for i in 0..3 {
        let e = unit_axis::<R>(i);
        let col = (v * (-u[i]) + u * v[i] + e * udotv + e.cross(v) * w) * two;
        jac.set_column(i + 1, &col);
    }
    jac
}

/// `|q|^2 - 1`, the soft unit-norm residual.
pub fn unit_norm_residual<R: RealField + Copy>(q: &Quaternion<R>) -> R {
    q.w * q.w + q.i * q.i + q.j * q.j + q.k * q.k - R::one()
}

/// Gradient of [`unit_norm_residual`] with respect to `(w, x, y, z)`.
pub fn unit_norm_gradient<R: RealField + Copy>(q: &Quaternion<R>) -> [R; 4] {
    let two: R = nalgebra::convert(2.0);
    [q.w * two, q.i * two, q.j * two, q.k * two]
}

/// Scale `q` back to unit magnitude. Identity rotation when `q` has
/// degenerated to (numerically) zero; callers treat that as a breakdown and
/// check magnitude beforehand where it matters.
pub fn normalized<R: RealField + Copy>(q: &Quaternion<R>) -> Quaternion<R> {
    let n = q.norm();
    if n <= R::default_epsilon() {
        Quaternion::new(R::one(), R::zero(), R::zero(), R::zero())
    } else {
        *q / n
    }
}

/// Convert a world-to-camera rotation matrix into a quaternion. Interface
/// boundary only; the solver core never goes through matrices.
pub fn from_rotation_matrix<R: RealField + Copy>(m: &Matrix3<R>) -> Quaternion<R> {
    *UnitQuaternion::from_matrix(m).quaternion()
}

fn unit_axis<R: RealField + Copy>(i: usize) -> Vector3<R> {
    match i {
        0 => Vector3::x(),
        1 => Vector3::y(),
        _ => Vector3::z(),
    }
}

fn cross_matrix<R: RealField + Copy>(u: &Vector3<R>) -> Matrix3<R> {
    Matrix3::new(
        R::zero(),
        -u.z,
        u.y,
        u.z,
        R::zero(),
        -u.x,
        -u.y,
        u.x,
        R::zero(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector4;
    use rand::{Rng, SeedableRng};

    fn random_unit_quat(rng: &mut impl Rng) -> Quaternion<f64> {
        let q = Quaternion::new(
            rng.gen::<f64>() - 0.5,
            rng.gen::<f64>() - 0.5,
            rng.gen::<f64>() - 0.5,
            rng.gen::<f64>() - 0.5,
        );
        normalized(&q)
    }

    #[test]
    fn matches_nalgebra_unit_quaternion() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let q = random_unit_quat(&mut rng);
            let v = Vector3::new(rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>());
            let expected = UnitQuaternion::from_quaternion(q) * v;
            approx::assert_relative_eq!(rotate(&q, &v), expected, epsilon = 1e-12);
            approx::assert_relative_eq!(rotation_matrix(&q) * v, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn rotate_then_inverse_is_identity() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(13);
        for _ in 0..100 {
            let q = random_unit_quat(&mut rng);
            let v = Vector3::new(
                rng.gen::<f64>() * 4.0 - 2.0,
                rng.gen::<f64>() * 4.0 - 2.0,
                rng.gen::<f64>() * 4.0 - 2.0,
            );
            let round = rotate(&q, &rotate_conj(&q, &v));
            approx::assert_relative_eq!(round, v, epsilon = 1e-10);
        }
    }

    #[test]
    fn quaternion_jacobian_matches_finite_differences() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(23);
        let h = 1e-7;
        for _ in 0..50 {
            // Deliberately not normalized: the derivative formula must hold
            // for the raw four-scalar parameterization.
            let q = Quaternion::new(
                rng.gen::<f64>() + 0.5,
                rng.gen::<f64>() - 0.5,
                rng.gen::<f64>() - 0.5,
                rng.gen::<f64>() - 0.5,
            );
            let v = Vector3::new(rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>());
            let jac = rotation_jacobian_wrt_q(&q, &v);
            for k in 0..4 {
                let mut dq = Vector4::new(q.w, q.i, q.j, q.k);
                dq[k] += h;
                let qp = Quaternion::new(dq[0], dq[1], dq[2], dq[3]);
                dq[k] -= 2.0 * h;
                let qm = Quaternion::new(dq[0], dq[1], dq[2], dq[3]);
                let numeric = (rotate(&qp, &v) - rotate(&qm, &v)) / (2.0 * h);
                approx::assert_relative_eq!(jac.column(k).into_owned(), numeric, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn unit_norm_residual_and_gradient() {
        let q = Quaternion::new(1.0, 0.0, 0.0, 0.0);
        assert_eq!(unit_norm_residual(&q), 0.0);
        let q = Quaternion::new(2.0, 0.0, 0.0, 0.0);
        assert_eq!(unit_norm_residual(&q), 3.0);
        assert_eq!(unit_norm_gradient(&q), [4.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn from_rotation_matrix_round_trip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        for _ in 0..20 {
            let q = random_unit_quat(&mut rng);
            let q2 = from_rotation_matrix(&rotation_matrix(&q));
            // q and -q encode the same rotation.
            let v = Vector3::new(0.3, -1.2, 2.0);
            approx::assert_relative_eq!(rotate(&q, &v), rotate(&q2, &v), epsilon = 1e-9);
        }
    }
}
