//! End-to-end solve scenarios over synthetic projects with known ground
//! truth.

use nalgebra::{Matrix3, Point2, Quaternion, Vector3};
use parallax_bundle::{camera_params_from_viewpoint, fine_tune, solve, Flow, Quality};
use parallax_mvg::quat;
use parallax_types::{
    Axis, Constraint, ConstraintKind, Line, LineDirection, PointId, Project, SolverOptions,
    VanishingLine, Viewpoint, WorldPoint,
};

/// World-to-camera rotation for a camera at `position` looking at `target`,
/// with the image x axis kept horizontal (world z up).
fn look_at_rotation(position: Vector3<f64>, target: Vector3<f64>) -> Quaternion<f64> {
    let forward = (target - position).normalize();
    let up_world = if forward.dot(&Vector3::z()).abs() > 0.95 {
        Vector3::y()
    } else {
        Vector3::z()
    };
    let right = up_world.cross(&forward).normalize();
    let down = forward.cross(&right);
    let r = Matrix3::from_rows(&[right.transpose(), down.transpose(), forward.transpose()]);
    quat::from_rotation_matrix(&r)
}

fn make_camera(name: &str, position: Vector3<f64>, target: Vector3<f64>) -> Viewpoint {
    let mut vp = Viewpoint::new(name, 640, 480);
    vp.intrinsics.focal = 800.0;
    vp.intrinsics.cx = 320.0;
    vp.intrinsics.cy = 240.0;
    vp.position = position;
    vp.rotation = look_at_rotation(position, target);
    vp
}

/// Project the world point with the viewpoint's ground-truth parameters and
/// record the observation, optionally offset in pixels.
fn observe(project: &mut Project, point: PointId, viewpoint: parallax_types::ViewpointId, offset: f64) {
    let world = project.point(point).effective_xyz();
    let cam = camera_params_from_viewpoint(project.viewpoint(viewpoint));
    let px = cam
        .project(&world)
        .expect("fixture point must be in front of the camera");
    project.add_image_point(point, viewpoint, Point2::new(px.x + offset, px.y));
}

/// Two locked points, two free points, two cameras at known (locked) poses,
/// eight exact observations.
fn two_camera_fixture(noise: f64) -> (Project, Vec<Vector3<f64>>) {
    let mut project = Project::new("two-camera");
    let truths = vec![
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(1.0, 1.0, 1.0),
        Vector3::new(0.5, -0.3, 0.4),
        Vector3::new(-0.4, 0.6, 0.2),
    ];

    let mut origin = WorldPoint::new("origin");
    origin.lock_to(truths[0]);
    let p0 = project.add_point(origin);
    let mut corner = WorldPoint::new("corner");
    corner.lock_to(truths[1]);
    let p1 = project.add_point(corner);
    let f2 = project.add_point(WorldPoint::new("free-a"));
    let f3 = project.add_point(WorldPoint::new("free-b"));

    let cam0 = project.add_viewpoint(make_camera(
        "cam0",
        Vector3::new(4.0, -6.0, 2.0),
        Vector3::new(0.3, 0.3, 0.3),
    ));
    let cam1 = project.add_viewpoint(make_camera(
        "cam1",
        Vector3::new(-5.0, -4.0, 3.0),
        Vector3::new(0.3, 0.3, 0.3),
    ));

    // Observations are generated from the locked truth, so temporarily set
    // the free points to their ground truth and then reset them.
    project.point_mut(f2).optimized = truths[2];
    project.point_mut(f3).optimized = truths[3];
    let mut sign = 1.0;
    for p in [p0, p1, f2, f3] {
        for v in [cam0, cam1] {
            observe(&mut project, p, v, noise * sign);
            sign = -sign;
        }
    }
    project.point_mut(f2).optimized = Vector3::zeros();
    project.point_mut(f3).optimized = Vector3::zeros();

    (project, truths)
}

#[test]
fn scenario_two_locked_points_two_cameras() {
    let (mut project, truths) = two_camera_fixture(0.0);
    let mut options = SolverOptions::default();
    options.lock_camera_poses = true;

    let report = solve(&mut project, &options, None);
    assert!(report.converged, "{report:?}");
    assert!(report.error.is_none(), "{report:?}");
    let median = report.median_reprojection_error.expect("observations present");
    assert!(median < 0.2, "median {median}");
    assert_eq!(report.quality, Quality::Excellent);

    for (i, truth) in truths.iter().enumerate() {
        let got = project.point(PointId(i)).effective_xyz();
        let err = (got - truth).norm();
        assert!(err < 1e-3, "point {i} off by {err}");
    }
    // Locked axes are written back exactly.
    assert_eq!(project.point(PointId(0)).optimized, truths[0]);
    assert_eq!(project.point(PointId(1)).optimized, truths[1]);
}

/// Unit cube with vanishing lines on all three axes, origin locked, twelve
/// direction-tagged unit-length edges.
fn cube_fixture() -> Project {
    let mut project = Project::new("cube");

    let corners = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [0.0, 1.0, 1.0],
        [1.0, 1.0, 1.0],
    ];
    let ids: Vec<PointId> = corners
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut wp = WorldPoint::new(format!("c{i}"));
            if i == 0 {
                wp.lock_to(Vector3::from(*c));
            }
            project.add_point(wp)
        })
        .collect();

    // The camera sits exactly 5 units from the locked origin so the fixture
    // exercises the single-anchor positioning path cleanly.
    let position = Vector3::new(3.0, -4.0, 0.0);
    let truth_cam = make_camera("cam", position, Vector3::new(0.5, 0.5, 0.5));
    let cam_params = camera_params_from_viewpoint(&truth_cam);
    let v = project.add_viewpoint(truth_cam);

    // Observations of all corners from the ground truth.
    for (i, c) in corners.iter().enumerate() {
        project.point_mut(ids[i]).optimized = Vector3::from(*c);
        observe(&mut project, ids[i], v, 0.0);
        project.point_mut(ids[i]).optimized = Vector3::zeros();
    }
    project.point_mut(ids[0]).lock_to(Vector3::zeros());

    // Twelve edges, tagged with their world axis, unit target length.
    let edges: [(usize, usize, LineDirection); 12] = [
        (0, 1, LineDirection::X),
        (2, 3, LineDirection::X),
        (4, 5, LineDirection::X),
        (6, 7, LineDirection::X),
        (0, 2, LineDirection::Y),
        (1, 3, LineDirection::Y),
        (4, 6, LineDirection::Y),
        (5, 7, LineDirection::Y),
        (0, 4, LineDirection::Z),
        (1, 5, LineDirection::Z),
        (2, 6, LineDirection::Z),
        (3, 7, LineDirection::Z),
    ];
    for (i, (a, b, dir)) in edges.iter().enumerate() {
        let mut line = Line::new(format!("e{i}"), ids[*a], ids[*b]);
        line.direction = *dir;
        line.target_length = Some(1.0);
        project.add_line(line);
    }

    // Vanishing lines: project two world segments per axis.
    let segments: [(Axis, [f64; 3], [f64; 3]); 6] = [
        (Axis::X, [0.0, 0.0, 0.0], [1.0, 0.0, 0.0]),
        (Axis::X, [0.0, 1.0, 1.0], [1.0, 1.0, 1.0]),
        (Axis::Y, [0.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        (Axis::Y, [1.0, 0.0, 1.0], [1.0, 1.0, 1.0]),
        (Axis::Z, [0.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        (Axis::Z, [1.0, 1.0, 0.0], [1.0, 1.0, 1.0]),
    ];
    for (axis, a, b) in segments {
        let pa = cam_params.project(&Vector3::from(a)).unwrap();
        let pb = cam_params.project(&Vector3::from(b)).unwrap();
        project.viewpoint_mut(v).vanishing_lines.push(VanishingLine {
            axis,
            a: Point2::new(pa.x, pa.y),
            b: Point2::new(pb.x, pb.y),
        });
    }

    // The solve must recover the camera pose itself.
    project.viewpoint_mut(v).position = Vector3::zeros();
    project.viewpoint_mut(v).rotation = Quaternion::new(1.0, 0.0, 0.0, 0.0);
    project
}

#[test]
fn scenario_cube_from_vanishing_lines() {
    let mut project = cube_fixture();
    let mut options = SolverOptions::default();
    options.optimize_intrinsics = Some(false);

    let report = solve(&mut project, &options, None);
    assert!(report.converged, "{report:?}");
    assert_eq!(report.quality, Quality::Excellent, "{report:?}");
    assert_eq!(report.cameras_initialized, vec!["cam".to_string()]);

    let corners = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [0.0, 1.0, 1.0],
        [1.0, 1.0, 1.0],
    ];
    for (i, truth) in corners.iter().enumerate() {
        let got = project.point(PointId(i)).effective_xyz();
        let err = (got - Vector3::from(*truth)).norm();
        assert!(err < 0.01, "corner {i} off by {err:.4}");
    }
    // Quaternion magnitude invariant after the solve.
    let n = project.viewpoints()[0].rotation.norm();
    assert!((n - 1.0).abs() < 1e-9);
}

#[test]
fn scenario_over_constrained_fixed_point() {
    let mut project = Project::new("over-constrained");
    let mut wp = WorldPoint::new("pinned");
    wp.lock_to(Vector3::zeros());
    let p = project.add_point(wp);
    project.add_constraint(Constraint::new(ConstraintKind::FixedPoint {
        point: p,
        target: Vector3::new(5.0, 5.0, 5.0),
    }));

    let report = solve(&mut project, &SolverOptions::default(), None);
    assert_eq!(report.quality, Quality::Poor);
    assert!(!report.converged);
    assert!(report.error.is_some());

    // The conflicting residual is attributed to the point: |(5,5,5)| = sqrt 75.
    let residuals = &project.point(p).last_residuals;
    assert!(
        residuals.iter().any(|r| (r - 75.0f64.sqrt()).abs() < 1e-9),
        "expected sqrt(75) in {residuals:?}"
    );
}

#[test]
fn scenario_fine_tune_idempotence() {
    let (mut project, _) = two_camera_fixture(0.3);
    let mut options = SolverOptions::default();
    options.lock_camera_poses = true;

    let first = solve(&mut project, &options, None);
    assert!(first.converged, "{first:?}");
    let positions: Vec<Vector3<f64>> = project.points().iter().map(|p| p.effective_xyz()).collect();

    let second = fine_tune(&mut project, &options, None);
    assert!(second.converged, "{second:?}");
    assert!(second.iterations <= 3, "took {} iterations", second.iterations);
    // Cost decrease below one percent of the converged cost.
    assert!(second.total_error <= first.total_error * 1.01 + 1e-12);
    assert!(first.total_error - second.total_error <= 0.01 * first.total_error + 1e-12);
    for (before, point) in positions.iter().zip(project.points()) {
        let drift = (point.effective_xyz() - before).norm();
        assert!(drift < 1e-6, "entity drifted by {drift}");
    }
}

#[test]
fn scenario_cancellation() {
    let (mut project, _) = two_camera_fixture(0.0);
    // Free cameras and perturbed starting poses so the solve needs plenty of
    // iterations.
    for vp in project.viewpoints_mut() {
        vp.position += Vector3::new(0.4, -0.3, 0.2);
    }
    let before_points: Vec<Vector3<f64>> =
        project.points().iter().map(|p| p.optimized).collect();
    let before_cams: Vec<Vector3<f64>> =
        project.viewpoints().iter().map(|v| v.position).collect();

    let mut options = SolverOptions::default();
    options.tolerance = 1e-14;
    let mut cb = |iteration: usize, _cost: f64, _best: f64| {
        if iteration >= 5 {
            Flow::Cancel
        } else {
            Flow::Continue
        }
    };
    let report = solve(&mut project, &options, Some(&mut cb));

    assert!(!report.converged);
    assert_eq!(report.error.as_deref(), Some("Cancelled"));
    assert_eq!(report.iterations, 5);
    // No entity mutation on the cancellation path.
    for (before, point) in before_points.iter().zip(project.points()) {
        assert_eq!(point.optimized, *before);
    }
    for (before, vp) in before_cams.iter().zip(project.viewpoints()) {
        assert_eq!(vp.position, *before);
    }
}

#[test]
fn scenario_pnp_fallback_over_bad_vanishing_lines() {
    let mut project = Project::new("pnp-fallback");
    let truths = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(1.2, 0.0, 0.1),
        Vector3::new(0.0, 1.1, 0.3),
        Vector3::new(1.0, 1.0, 0.9),
        Vector3::new(-0.8, 0.4, 0.5),
        Vector3::new(0.3, -0.9, 0.7),
    ];
    let ids: Vec<PointId> = truths
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let mut wp = WorldPoint::new(format!("anchor{i}"));
            wp.lock_to(*t);
            project.add_point(wp)
        })
        .collect();

    let truth_cam = make_camera("cam", Vector3::new(4.0, -5.0, 2.5), Vector3::new(0.3, 0.2, 0.4));
    let cam_params = camera_params_from_viewpoint(&truth_cam);
    let v = project.add_viewpoint(truth_cam);
    for id in &ids {
        observe(&mut project, *id, v, 0.0);
    }

    // Vanishing lines with deliberately swapped axis labels: the
    // vanishing-point pose they imply reprojects wildly.
    let segments: [(Axis, [f64; 3], [f64; 3]); 4] = [
        (Axis::Z, [0.0, 0.0, 0.0], [1.0, 0.0, 0.0]),
        (Axis::Z, [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]),
        (Axis::X, [0.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        (Axis::X, [1.0, 0.0, 0.0], [1.0, 0.0, 1.0]),
    ];
    for (axis, a, b) in segments {
        let pa = cam_params.project(&Vector3::from(a)).unwrap();
        let pb = cam_params.project(&Vector3::from(b)).unwrap();
        project.viewpoint_mut(v).vanishing_lines.push(VanishingLine {
            axis,
            a: Point2::new(pa.x, pa.y),
            b: Point2::new(pb.x, pb.y),
        });
    }

    // Start the camera from nothing.
    project.viewpoint_mut(v).position = Vector3::zeros();
    project.viewpoint_mut(v).rotation = Quaternion::new(1.0, 0.0, 0.0, 0.0);

    let mut options = SolverOptions::default();
    options.optimize_intrinsics = Some(false);
    let report = solve(&mut project, &options, None);

    assert!(report.converged, "{report:?}");
    let median = report.median_reprojection_error.unwrap();
    assert!(median < 2.0, "median {median}");
    assert!(report.cameras_initialized.contains(&"cam".to_string()));
}

#[test]
fn gauge_invariance_under_rigid_transform() {
    let (mut project, _) = two_camera_fixture(0.25);
    let mut options = SolverOptions::default();
    options.lock_camera_poses = true;
    let first = solve(&mut project, &options, None);
    assert!(first.converged);

    // Rigid transform: rotate about z and translate.
    let angle = 0.6f64;
    let r = Matrix3::new(
        angle.cos(),
        -angle.sin(),
        0.0,
        angle.sin(),
        angle.cos(),
        0.0,
        0.0,
        0.0,
        1.0,
    );
    let t = Vector3::new(3.0, -2.0, 1.5);
    for point in project.points_mut() {
        point.optimized = r * point.optimized + t;
        if point.is_fully_locked() {
            let moved = r * Vector3::new(
                point.locked[0].unwrap(),
                point.locked[1].unwrap(),
                point.locked[2].unwrap(),
            ) + t;
            point.locked = [Some(moved.x), Some(moved.y), Some(moved.z)];
        }
    }
    for vp in project.viewpoints_mut() {
        vp.position = r * vp.position + t;
        let r_wc = quat::rotation_matrix(&vp.rotation);
        vp.rotation = quat::from_rotation_matrix(&(r_wc * r.transpose()));
    }

    let second = solve(&mut project, &options, None);
    assert!(second.converged);
    let m1 = first.median_reprojection_error.unwrap();
    let m2 = second.median_reprojection_error.unwrap();
    assert!((m1 - m2).abs() < 1e-6, "medians {m1} vs {m2}");
    assert!(
        (first.total_error - second.total_error).abs() < 1e-6 * (1.0 + first.total_error),
        "costs {} vs {}",
        first.total_error,
        second.total_error
    );
}

#[test]
fn disabled_constraint_contributes_nothing() {
    let mut project = Project::new("disabled");
    let mut wp = WorldPoint::new("p");
    wp.optimized = Vector3::new(1.0, 2.0, 3.0);
    let p = project.add_point(wp);
    let mut constraint = Constraint::new(ConstraintKind::FixedPoint {
        point: p,
        target: Vector3::new(9.0, 9.0, 9.0),
    });
    constraint.enabled = false;
    project.add_constraint(constraint);
    // A second, enabled constraint so the project has a residual source.
    project.add_constraint(Constraint::new(ConstraintKind::FixedPoint {
        point: p,
        target: Vector3::new(1.0, 2.0, 3.0),
    }));

    let report = solve(&mut project, &SolverOptions::default(), None);
    assert!(report.converged, "{report:?}");
    // The disabled target never pulled the point.
    let got = project.point(p).effective_xyz();
    assert!((got - Vector3::new(1.0, 2.0, 3.0)).norm() < 1e-6);
}
