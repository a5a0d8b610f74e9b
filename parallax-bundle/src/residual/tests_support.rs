//! Shared fixtures and the numeric-Jacobian harness for provider tests.

use nalgebra::{DVector, Point2, Quaternion, Vector3};
use parallax_mvg::numeric::{compare_jacobians, numerical_jacobian};
use parallax_types::{Project, Viewpoint, WorldPoint};

use crate::layout::VariableLayout;
use crate::residual::ResidualProvider;

/// A project containing only free world points at the given positions.
pub(crate) fn free_points_project(positions: &[[f64; 3]]) -> Project {
    let mut project = Project::new("fixture");
    for (i, p) in positions.iter().enumerate() {
        let mut wp = WorldPoint::new(format!("p{i}"));
        wp.optimized = Vector3::from(*p);
        project.add_point(wp);
    }
    project
}

/// One locked point, one free point, two posed cameras observing both.
pub(crate) fn simple_two_camera_project() -> Project {
    let mut project = Project::new("fixture");
    let mut origin = WorldPoint::new("origin");
    origin.lock_to(Vector3::zeros());
    let p0 = project.add_point(origin);
    let mut free = WorldPoint::new("free");
    free.optimized = Vector3::new(0.4, -0.2, 0.9);
    let p1 = project.add_point(free);

    let mut cam_a = Viewpoint::new("cam-a", 640, 480);
    cam_a.position = Vector3::new(-1.0, 0.2, -5.0);
    cam_a.rotation = Quaternion::new(1.0, 0.0, 0.0, 0.0);
    cam_a.intrinsics.focal = 800.0;
    cam_a.intrinsics.k1 = -0.05;
    cam_a.intrinsics.p1 = 0.001;
    let va = project.add_viewpoint(cam_a);

    let mut cam_b = Viewpoint::new("cam-b", 640, 480);
    cam_b.position = Vector3::new(1.5, -0.3, -5.0);
    cam_b.rotation = {
        let q = Quaternion::new(0.99, 0.01, -0.08, 0.02);
        q / q.norm()
    };
    cam_b.intrinsics.focal = 820.0;
    let vb = project.add_viewpoint(cam_b);

    for (p, v) in [(p0, va), (p0, vb), (p1, va), (p1, vb)] {
        project.add_image_point(p, v, Point2::new(320.0, 240.0));
    }
    project
}

/// Assert a provider's analytic Jacobian agrees with central differences of
/// its residuals over the full free-variable vector.
pub(crate) fn check_provider_jacobian(
    provider: &dyn ResidualProvider,
    layout: &VariableLayout,
    h: f64,
    tolerance: f64,
) {
    let x0 = layout.initial_values();
    let k = provider.residual_count();
    let ncols_local = provider.columns().len();

    let mut residuals = vec![0.0; k];
    let mut jac_local = vec![0.0; k * ncols_local];
    assert!(
        provider.evaluate(layout, &x0, &mut residuals, Some(&mut jac_local)),
        "provider inactive at the test state"
    );

    // Scatter the local block into a dense matrix over all variables.
    let n = layout.variable_count();
    let mut analytic = nalgebra::DMatrix::zeros(k, n);
    for row in 0..k {
        for (local, &global) in provider.columns().iter().enumerate() {
            analytic[(row, global)] = jac_local[row * ncols_local + local];
        }
    }

    let numeric = numerical_jacobian(
        |x: &DVector<f64>| {
            let mut r = vec![0.0; k];
            if provider.evaluate(layout, x, &mut r, None) {
                Some(DVector::from_vec(r))
            } else {
                None
            }
        },
        &x0,
        h,
    )
    .expect("provider became inactive under perturbation");

    let report = compare_jacobians(&analytic, &numeric);
    assert!(
        report.frobenius_relative_error < tolerance,
        "jacobian mismatch: {report:?}"
    );
}
