//! Pinhole + Brown-Conrady projection and its analytic Jacobian blocks.
//!
//! The pipeline, for a world point `P` seen by camera `C`:
//!
//! 1. translate: `t = P - C.position`
//! 2. rotate into the camera frame: `c = q t q*`
//! 3. handedness flip: negate `c` when `z_reflected`
//! 4. require `c.z > 0`; otherwise the point does not project
//! 5. normalize: `xn = c.x / c.z`, `yn = c.y / c.z`
//! 6. distort: Brown-Conrady with `(k1, k2, k3, p1, p2)`
//! 7. pixel: `u = f*xd + skew*yd + cx`, `v = f*aspect*yd + cy`
//!
//! Every Jacobian is the hand-written chain rule through those steps; there
//! are no finite differences outside the [`crate::numeric`] test oracle.

use nalgebra::{Matrix2, Matrix2x3, Matrix2x4, Matrix3, Quaternion, RealField, Vector2, Vector3};

use crate::quat;

/// Number of intrinsic scalars exposed to optimization:
/// `[focal, cx, cy, k1, k2, k3, p1, p2]`. Aspect ratio and skew are data.
pub const INTRINSIC_PARAMS: usize = 8;

/// Everything needed to project a world point: intrinsics plus pose in the
/// solver's parameterization (position and raw world-to-camera quaternion).
#[derive(Debug, Clone, PartialEq)]
pub struct CameraParams<R: RealField + Copy> {
    pub focal: R,
    pub aspect_ratio: R,
    pub cx: R,
    pub cy: R,
    pub skew: R,
    pub k1: R,
    pub k2: R,
    pub k3: R,
    pub p1: R,
    pub p2: R,
    pub position: Vector3<R>,
    /// World-to-camera rotation, `(w, x, y, z)`; nearly unit during a solve.
    pub rotation: Quaternion<R>,
    pub z_reflected: bool,
}

/// Partial derivatives of a projected pixel `(u, v)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionJacobian<R: RealField + Copy> {
    /// With respect to the world point.
    pub point: Matrix2x3<R>,
    /// With respect to the camera position.
    pub position: Matrix2x3<R>,
    /// With respect to the quaternion scalars `(w, x, y, z)`.
    pub quaternion: Matrix2x4<R>,
    /// With respect to `[focal, cx, cy, k1, k2, k3, p1, p2]`.
    pub intrinsics: [Vector2<R>; INTRINSIC_PARAMS],
}

impl<R: RealField + Copy> CameraParams<R> {
    /// The point in camera coordinates, after the handedness flip.
    pub fn camera_frame(&self, world: &Vector3<R>) -> Vector3<R> {
        let t = world - self.position;
        let c = quat::rotate(&self.rotation, &t);
        if self.z_reflected {
            -c
        } else {
            c
        }
    }

    /// Apply Brown-Conrady distortion to normalized coordinates.
    pub fn distort(&self, xn: R, yn: R) -> (R, R) {
        let two: R = nalgebra::convert(2.0);
        let r2 = xn * xn + yn * yn;
        let radial = R::one() + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let xd = xn * radial + two * self.p1 * xn * yn + self.p2 * (r2 + two * xn * xn);
        let yd = yn * radial + self.p1 * (r2 + two * yn * yn) + two * self.p2 * xn * yn;
        (xd, yd)
    }

    /// Project a world point to a distorted pixel. `None` when the point is
    /// at or behind the camera plane; the caller decides whether that
    /// suppresses a residual or invalidates a candidate.
    pub fn project(&self, world: &Vector3<R>) -> Option<Vector2<R>> {
        let c = self.camera_frame(world);
        if c.z <= min_depth() {
            return None;
        }
        let xn = c.x / c.z;
        let yn = c.y / c.z;
        let (xd, yd) = self.distort(xn, yn);
        Some(Vector2::new(
            self.focal * xd + self.skew * yd + self.cx,
            self.focal * self.aspect_ratio * yd + self.cy,
        ))
    }

    /// Project and differentiate in one pass. Shares the forward
    /// intermediates with the Jacobian chain, so this is what the
    /// reprojection residual provider calls every iteration.
    pub fn project_with_jacobian(
        &self,
        world: &Vector3<R>,
    ) -> Option<(Vector2<R>, ProjectionJacobian<R>)> {
        let two: R = nalgebra::convert(2.0);
        let three: R = nalgebra::convert(3.0);
        let six: R = nalgebra::convert(6.0);

        let t = world - self.position;
        let c_rot = quat::rotate(&self.rotation, &t);
        let sign = if self.z_reflected { -R::one() } else { R::one() };
        let c = c_rot * sign;
        if c.z <= min_depth() {
            return None;
        }

        let xn = c.x / c.z;
        let yn = c.y / c.z;
        let r2 = xn * xn + yn * yn;
        let radial = R::one() + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let (xd, yd) = self.distort(xn, yn);

        let pixel = Vector2::new(
            self.focal * xd + self.skew * yd + self.cx,
            self.focal * self.aspect_ratio * yd + self.cy,
        );

        // d(xn, yn) / dc
        let inv_z = R::one() / c.z;
        let d_norm = Matrix2x3::new(
            inv_z,
            R::zero(),
            -xn * inv_z,
            R::zero(),
            inv_z,
            -yn * inv_z,
        );

        // d(xd, yd) / d(xn, yn); d(radial)/d(r2) appears via dr = k1 + 2 k2 r2 + 3 k3 r2^2
        let dr = self.k1 + two * self.k2 * r2 + three * self.k3 * r2 * r2;
        let d_dist = Matrix2::new(
            radial + two * xn * xn * dr + two * self.p1 * yn + six * self.p2 * xn,
            two * xn * yn * dr + two * self.p1 * xn + two * self.p2 * yn,
            two * xn * yn * dr + two * self.p1 * xn + two * self.p2 * yn,
            radial + two * yn * yn * dr + six * self.p1 * yn + two * self.p2 * xn,
        );

        // d(u, v) / d(xd, yd)
        let d_pixel = Matrix2::new(
            self.focal,
            self.skew,
            R::zero(),
            self.focal * self.aspect_ratio,
        );

        // d(u, v) / dc
        let duv_dc: Matrix2x3<R> = d_pixel * d_dist * d_norm;

        // dc/dt is the (sign-flipped) rotation map; dt/dP = I, dt/dposition = -I.
        let rot: Matrix3<R> = quat::rotation_matrix(&self.rotation) * sign;
        let point = duv_dc * rot;
        let position = -point;
        let quaternion = duv_dc * (quat::rotation_jacobian_wrt_q(&self.rotation, &t) * sign);

        // Intrinsics, in declaration order.
        let d_focal = Vector2::new(xd, self.aspect_ratio * yd);
        let d_cx = Vector2::new(R::one(), R::zero());
        let d_cy = Vector2::new(R::zero(), R::one());
        let dist_grads = [
            Vector2::new(xn * r2, yn * r2),                       // k1
            Vector2::new(xn * r2 * r2, yn * r2 * r2),             // k2
            Vector2::new(xn * r2 * r2 * r2, yn * r2 * r2 * r2),   // k3
            Vector2::new(two * xn * yn, r2 + two * yn * yn),      // p1
            Vector2::new(r2 + two * xn * xn, two * xn * yn),      // p2
        ];
        let mut intrinsics = [Vector2::zeros(); INTRINSIC_PARAMS];
        intrinsics[0] = d_focal;
        intrinsics[1] = d_cx;
        intrinsics[2] = d_cy;
        for (slot, g) in intrinsics[3..].iter_mut().zip(dist_grads.iter()) {
            *slot = d_pixel * g;
        }

        Some((
            pixel,
            ProjectionJacobian {
                point,
                position,
                quaternion,
                intrinsics,
            },
        ))
    }
}

fn min_depth<R: RealField + Copy>() -> R {
    nalgebra::convert(1e-9)
}

impl CameraParams<f64> {
    /// Invert the distortion by fixed-point iteration (the usual OpenCV
    /// scheme); converges in a handful of rounds for realistic coefficients.
    pub fn undistort_normalized(&self, xd: f64, yd: f64) -> (f64, f64) {
        let mut x = xd;
        let mut y = yd;
        for _ in 0..8 {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        (x, y)
    }

    /// Undistorted normalized coordinates for a raw pixel.
    pub fn normalized_from_pixel(&self, pixel: &nalgebra::Point2<f64>) -> (f64, f64) {
        let yd = (pixel.y - self.cy) / (self.focal * self.aspect_ratio);
        let xd = (pixel.x - self.cx - self.skew * yd) / self.focal;
        self.undistort_normalized(xd, yd)
    }

    /// The world-space viewing ray through a pixel.
    pub fn pixel_to_world_ray(&self, pixel: &nalgebra::Point2<f64>) -> Option<crate::triangulate::Ray> {
        let (xn, yn) = self.normalized_from_pixel(pixel);
        let mut dir_cam = Vector3::new(xn, yn, 1.0);
        if self.z_reflected {
            dir_cam = -dir_cam;
        }
        let dir = quat::rotate_conj(&self.rotation, &dir_cam);
        let norm = dir.norm();
        if !norm.is_finite() || norm <= 0.0 {
            return None;
        }
        Some(crate::triangulate::Ray {
            origin: self.position,
            dir: dir / norm,
        })
    }

    /// The linearized (distortion-free) `3x4` projection matrix
    /// `K [sR | -sR c]`, with `s` the handedness sign.
    pub fn linear_projection_matrix(&self) -> nalgebra::Matrix3x4<f64> {
        let sign = if self.z_reflected { -1.0 } else { 1.0 };
        let k = Matrix3::new(
            self.focal,
            self.skew,
            self.cx,
            0.0,
            self.focal * self.aspect_ratio,
            self.cy,
            0.0,
            0.0,
            1.0,
        );
        let r = quat::rotation_matrix(&self.rotation) * sign;
        let t = -(r * self.position);
        let kr = k * r;
        let kt = k * t;
        let mut m = nalgebra::Matrix3x4::zeros();
        m.view_mut((0, 0), (3, 3)).copy_from(&kr);
        m.set_column(3, &kt);
        m
    }
}
