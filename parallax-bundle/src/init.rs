//! The initialization suite: candidate starting states for the orchestrator.
//!
//! Each initializer is a pure function from the project (and the current
//! [`SceneState`]) to a seeded state; failures fall through to the next
//! initializer rather than aborting. Candidates are generated from, in
//! order: the current entity state, vanishing-point poses, PnP poses from
//! locked points, an essential-matrix two-view reconstruction, and a
//! smart-seeded fallback. Every candidate is completed by triangulating
//! whatever points the posed cameras can see and smart-seeding the rest.

use nalgebra::{Matrix3, Point2, Point3, Vector3};
use parallax_mvg::essential::MIN_ESSENTIAL_POINTS;
use parallax_mvg::pnp::MIN_PNP_POINTS;
use parallax_mvg::{align, essential, pnp, quat, triangulate, vanishing, Correspondence};
use parallax_types::{Axis, ConstraintKind, Intrinsics, Project, ViewpointId};
use rand::{Rng, SeedableRng};

use crate::linalg::sym_eigen3;
use crate::state::SceneState;

/// Fallback scene scale when no line supplies a target length.
const DEFAULT_SCENE_SCALE: f64 = 10.0;

/// Deterministic seed for the random-placement fallback.
const SEED_RNG: u64 = 0x70617261;

/// One starting state for the LM probe loop.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub state: SceneState,
    pub label: &'static str,
    /// Names of cameras whose pose came from an initializer.
    pub cameras_initialized: Vec<String>,
}

/// Gauge fixing: with two or more fully locked points the similarity gauge
/// is pinned by the data and no camera needs locking; otherwise the first
/// enabled camera's pose is frozen.
pub(crate) fn determine_gauge(project: &Project) -> Option<ViewpointId> {
    if project.fully_locked_points().len() >= 2 {
        return None;
    }
    project
        .viewpoints()
        .iter()
        .position(|vp| vp.enabled_in_solve)
        .map(ViewpointId)
}

/// Observations of fully locked points in one viewpoint.
fn anchors_for_viewpoint(project: &Project, viewpoint: ViewpointId) -> Vec<Correspondence> {
    project
        .viewpoint(viewpoint)
        .image_points
        .iter()
        .filter_map(|ip| {
            let obs = project.image_point(*ip);
            let wp = project.point(obs.world_point);
            wp.is_fully_locked().then(|| Correspondence {
                world: Point3::from(wp.effective_xyz()),
                pixel: obs.pixel,
            })
        })
        .collect()
}

fn focal_is_default(intrinsics: &Intrinsics, width: usize, height: usize) -> bool {
    (intrinsics.focal - Intrinsics::default_for_image(width, height).focal).abs() < 1e-6
}

/// Generate the candidate list, most informed first. Always contains at
/// least the current entity state. Camera-posing initializers are skipped
/// entirely when the options freeze every pose: a locked pose is input data,
/// not something to re-estimate.
pub(crate) fn generate_candidates(
    project: &Project,
    options: &parallax_types::SolverOptions,
) -> Vec<Candidate> {
    let base = SceneState::from_project(project);
    let mut candidates = vec![Candidate {
        state: base.clone(),
        label: "current",
        cameras_initialized: Vec::new(),
    }];

    if !options.lock_camera_poses {
        candidates.extend(vanishing_candidates(project, &base));
        if let Some(candidate) = pnp_candidate(project, &base) {
            candidates.push(candidate);
        }
        if let Some(candidate) = essential_candidate(project, &base) {
            candidates.push(candidate);
        }
    }

    // Smart-seed fallback from the current camera poses.
    let mut seeded = base.clone();
    complete_candidate(project, &mut seeded);
    candidates.push(Candidate {
        state: seeded,
        label: "seed",
        cameras_initialized: Vec::new(),
    });

    candidates
}

/// How many rotation variants of the first vanishing-capable camera become
/// separate candidates. A single anchor cannot always disambiguate the axis
/// signs, so the probe runs get to pick the basin.
const VANISHING_VARIANTS: usize = 4;

/// Pose every vanishing-line-capable camera; empty when no camera qualifies
/// or every estimate fails. The best estimates form one candidate; the
/// runner-up rotations of the first capable camera form further candidates.
fn vanishing_candidates(project: &Project, base: &SceneState) -> Vec<Candidate> {
    let mut best_state = base.clone();
    let mut initialized = Vec::new();
    let mut first_capable: Option<usize> = None;
    let mut alternates: Vec<parallax_mvg::CameraParams<f64>> = Vec::new();

    for (i, vp) in project.viewpoints().iter().enumerate() {
        if !vp.enabled_in_solve || vp.usable_vanishing_axes() < 2 {
            continue;
        }
        let mut segments: [Vec<(Point2<f64>, Point2<f64>)>; 3] = Default::default();
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            segments[axis.index()] = vp
                .vanishing_lines_for(axis)
                .map(|vl| (vl.a, vl.b))
                .collect();
        }
        let anchors = anchors_for_viewpoint(project, ViewpointId(i));
        let template = &best_state.cameras[i];
        let wanted = if first_capable.is_none() {
            VANISHING_VARIANTS
        } else {
            1
        };
        match vanishing::solve_vanishing_pose_candidates(
            template,
            &segments,
            &anchors,
            focal_is_default(&vp.intrinsics, vp.width, vp.height),
            wanted,
        ) {
            Ok(estimates) => {
                tracing::debug!(
                    camera = vp.name.as_str(),
                    score = estimates[0].score,
                    right_handed = estimates[0].right_handed,
                    variants = estimates.len(),
                    "vanishing-point pose"
                );
                if first_capable.is_none() {
                    first_capable = Some(i);
                    alternates = estimates[1..].iter().map(|e| e.camera.clone()).collect();
                }
                best_state.cameras[i] = estimates[0].camera.clone();
                initialized.push(vp.name.clone());
            }
            Err(err) => {
                tracing::debug!(camera = vp.name.as_str(), %err, "vanishing-point pose failed");
            }
        }
    }
    if initialized.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut state = best_state.clone();
    complete_candidate(project, &mut state);
    out.push(Candidate {
        state,
        label: "vanishing",
        cameras_initialized: initialized.clone(),
    });
    if let Some(i) = first_capable {
        for alternate in alternates {
            let mut state = best_state.clone();
            state.cameras[i] = alternate;
            complete_candidate(project, &mut state);
            out.push(Candidate {
                state,
                label: "vanishing",
                cameras_initialized: initialized.clone(),
            });
        }
    }
    out
}

/// Re-pose every camera that observes at least [`MIN_PNP_POINTS`] locked
/// points.
fn pnp_candidate(project: &Project, base: &SceneState) -> Option<Candidate> {
    let mut state = base.clone();
    let mut initialized = Vec::new();
    for (i, vp) in project.viewpoints().iter().enumerate() {
        if !vp.enabled_in_solve {
            continue;
        }
        let anchors = anchors_for_viewpoint(project, ViewpointId(i));
        if anchors.len() < MIN_PNP_POINTS {
            continue;
        }
        match pnp::solve_pnp(&state.cameras[i], &anchors) {
            Ok(cam) => {
                state.cameras[i] = cam;
                initialized.push(vp.name.clone());
            }
            Err(err) => {
                tracing::debug!(camera = vp.name.as_str(), %err, "PnP failed");
            }
        }
    }
    if initialized.is_empty() {
        return None;
    }
    complete_candidate(project, &mut state);
    Some(Candidate {
        state,
        label: "pnp",
        cameras_initialized: initialized,
    })
}

/// Two-view reconstruction: pick the enabled camera pair sharing the most
/// observations of free points, estimate their relative pose from the
/// essential matrix, triangulate the shared points, and align the result
/// onto the locked points when possible.
fn essential_candidate(project: &Project, base: &SceneState) -> Option<Candidate> {
    let enabled: Vec<usize> = project
        .viewpoints()
        .iter()
        .enumerate()
        .filter(|(_, vp)| vp.enabled_in_solve)
        .map(|(i, _)| i)
        .collect();

    let mut best_pair: Option<(usize, usize, usize)> = None;
    for (ai, &a) in enabled.iter().enumerate() {
        for &b in &enabled[ai + 1..] {
            let shared = project
                .shared_observations(ViewpointId(a), ViewpointId(b))
                .iter()
                .filter(|(p, _, _)| !project.point(*p).is_fully_locked())
                .count();
            if shared >= MIN_ESSENTIAL_POINTS
                && best_pair.map(|(_, _, n)| shared > n).unwrap_or(true)
            {
                best_pair = Some((a, b, shared));
            }
        }
    }
    let (a, b, shared_count) = best_pair?;
    tracing::debug!(
        cam_a = project.viewpoints()[a].name.as_str(),
        cam_b = project.viewpoints()[b].name.as_str(),
        shared = shared_count,
        "essential-matrix candidate"
    );

    let mut state = base.clone();
    let shared = project.shared_observations(ViewpointId(a), ViewpointId(b));
    let cam_a_params = state.cameras[a].clone();
    let cam_b_params = state.cameras[b].clone();
    let pairs: Vec<(Point2<f64>, Point2<f64>)> = shared
        .iter()
        .map(|(_, pa, pb)| {
            let (x1, y1) = cam_a_params.normalized_from_pixel(pa);
            let (x2, y2) = cam_b_params.normalized_from_pixel(pb);
            (Point2::new(x1, y1), Point2::new(x2, y2))
        })
        .collect();

    let pose = match essential::relative_pose(&pairs) {
        Ok(pose) => pose,
        Err(err) => {
            tracing::debug!(%err, "essential-matrix estimation failed");
            return None;
        }
    };

    // Canonical frame: camera A at the origin, camera B from the relative
    // pose (`x2 = R x1 + t` means `position = -R^T t`).
    state.cameras[a].position = Vector3::zeros();
    state.cameras[a].rotation = nalgebra::Quaternion::new(1.0, 0.0, 0.0, 0.0);
    state.cameras[b].rotation = quat::from_rotation_matrix(&pose.rotation);
    state.cameras[b].position = -(pose.rotation.transpose() * pose.translation);

    // Triangulate every shared point (locked ones too: they become the
    // correspondences for the similarity alignment).
    let mut est: Vec<(usize, Vector3<f64>)> = Vec::new();
    for (p, pa, pb) in &shared {
        let obs = [(&state.cameras[a], *pa), (&state.cameras[b], *pb)];
        if let Ok(pos) = triangulate::triangulate_observations(&obs) {
            est.push((p.0, pos));
        }
    }
    if est.is_empty() {
        return None;
    }

    let from: Vec<Vector3<f64>> = est
        .iter()
        .filter(|(p, _)| project.points()[*p].is_fully_locked())
        .map(|(_, pos)| *pos)
        .collect();
    let to: Vec<Vector3<f64>> = est
        .iter()
        .filter(|(p, _)| project.points()[*p].is_fully_locked())
        .map(|(p, _)| project.points()[*p].effective_xyz())
        .collect();
    let similarity = if from.len() >= 2 {
        align::umeyama_similarity(&from, &to).unwrap_or_else(|err| {
            tracing::debug!(%err, "similarity alignment failed, keeping canonical frame");
            align::Similarity::identity()
        })
    } else {
        align::Similarity::identity()
    };

    state.cameras[a] = similarity.apply_camera(&state.cameras[a]);
    state.cameras[b] = similarity.apply_camera(&state.cameras[b]);
    for (p, pos) in est {
        if !project.points()[p].is_fully_locked() {
            state.points[p] = similarity.apply_point(&pos);
        }
    }

    complete_candidate(project, &mut state);
    Some(Candidate {
        state,
        label: "essential",
        cameras_initialized: vec![
            project.viewpoints()[a].name.clone(),
            project.viewpoints()[b].name.clone(),
        ],
    })
}

/// Fill in whatever the candidate's cameras can triangulate, then smart-seed
/// the remainder.
fn complete_candidate(project: &Project, state: &mut SceneState) {
    let mut seeded: Vec<bool> = project.points().iter().map(|p| p.is_fully_locked()).collect();
    triangulate_fill(project, state, &mut seeded);
    smart_seed_fill(project, state, &mut seeded);
}

/// Triangulate every unseeded point observed by at least two enabled
/// cameras; cheirality failures leave the point unseeded.
fn triangulate_fill(project: &Project, state: &mut SceneState, seeded: &mut [bool]) {
    for (i, wp) in project.points().iter().enumerate() {
        if seeded[i] {
            continue;
        }
        let obs: Vec<_> = wp
            .observations
            .iter()
            .map(|ip| project.image_point(*ip))
            .filter(|obs| project.viewpoint(obs.viewpoint).enabled_in_solve)
            .map(|obs| (&state.cameras[obs.viewpoint.0], obs.pixel))
            .collect();
        if obs.len() < 2 {
            continue;
        }
        match triangulate::triangulate_observations(&obs) {
            Ok(pos) => {
                state.points[i] = pos;
                seeded[i] = true;
            }
            Err(err) => {
                tracing::trace!(point = wp.name.as_str(), %err, "triangulation rejected");
            }
        }
    }
}

/// Median line target length, the smart-seed notion of scene scale.
fn scene_scale(project: &Project) -> f64 {
    let mut lengths: Vec<f64> = project
        .lines()
        .iter()
        .filter_map(|l| l.target_length)
        .filter(|l| *l > 0.0)
        .collect();
    if lengths.is_empty() {
        return DEFAULT_SCENE_SCALE;
    }
    lengths.sort_by(|a, b| a.total_cmp(b));
    lengths[lengths.len() / 2] * 4.0
}

/// Seed the points triangulation could not reach: coplanar groups onto
/// their (fitted or default) plane, observed points onto a coarse grid, and
/// unconnected points randomly within the scene bounds.
fn smart_seed_fill(project: &Project, state: &mut SceneState, seeded: &mut [bool]) {
    let scale = scene_scale(project);

    for constraint in project.constraints() {
        if !constraint.enabled {
            continue;
        }
        let ConstraintKind::Coplanar { points } = &constraint.kind else {
            continue;
        };
        let anchored: Vec<Vector3<f64>> = points
            .iter()
            .filter(|p| seeded[p.0])
            .map(|p| state.points[p.0])
            .collect();
        let (centroid, u, v) = if anchored.len() >= 3 {
            plane_basis(&anchored)
        } else {
            (Vector3::zeros(), Vector3::x(), Vector3::y())
        };
        let mut slot = 0usize;
        for p in points {
            if seeded[p.0] {
                continue;
            }
            let side = (points.len() as f64).sqrt().ceil() as usize;
            let row = slot / side;
            let col = slot % side;
            let spacing = scale / side.max(1) as f64;
            state.points[p.0] =
                centroid + u * (col as f64 * spacing) + v * (row as f64 * spacing);
            seeded[p.0] = true;
            slot += 1;
        }
    }

    // Observed but untriangulated points go on a coarse grid.
    let grid: Vec<usize> = (0..project.points().len())
        .filter(|&i| !seeded[i] && !project.points()[i].observations.is_empty())
        .collect();
    if !grid.is_empty() {
        let side = (grid.len() as f64).cbrt().ceil() as usize;
        let spacing = scale / side.max(1) as f64;
        for (slot, &i) in grid.iter().enumerate() {
            let x = slot % side;
            let y = (slot / side) % side;
            let z = slot / (side * side);
            state.points[i] = Vector3::new(
                (x as f64 - side as f64 / 2.0) * spacing,
                (y as f64 - side as f64 / 2.0) * spacing,
                (z as f64) * spacing,
            );
            seeded[i] = true;
        }
    }

    // Unconnected points: random placement within the scene bounds.
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(SEED_RNG);
    for i in 0..project.points().len() {
        if !seeded[i] {
            state.points[i] = Vector3::new(
                rng.random_range(-scale..scale),
                rng.random_range(-scale..scale),
                rng.random_range(-scale..scale),
            );
            seeded[i] = true;
        }
    }
}

/// Centroid and in-plane basis of a point set, from the scatter-matrix
/// eigen-decomposition (the two largest eigenvectors span the plane).
fn plane_basis(points: &[Vector3<f64>]) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
    let n = points.len() as f64;
    let centroid: Vector3<f64> = points.iter().sum::<Vector3<f64>>() / n;
    let mut scatter = Matrix3::zeros();
    for p in points {
        let d = p - centroid;
        scatter += d * d.transpose();
    }
    let (_, vectors) = sym_eigen3(&scatter);
    // Eigenvalues ascend: column 0 is the plane normal, 1 and 2 span it.
    (
        centroid,
        vectors.column(1).into_owned(),
        vectors.column(2).into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::tests_support::simple_two_camera_project;
    use parallax_types::{Constraint, Line, Viewpoint, WorldPoint};

    #[test]
    fn gauge_prefers_locked_points() {
        let project = simple_two_camera_project();
        // Only one fully locked point: gauge falls back to locking a camera.
        assert_eq!(determine_gauge(&project), Some(ViewpointId(0)));

        let mut project = project;
        project.points_mut()[1].lock_to(Vector3::new(1.0, 1.0, 1.0));
        assert_eq!(determine_gauge(&project), None);
    }

    #[test]
    fn candidates_always_include_current_state() {
        let project = simple_two_camera_project();
        let options = parallax_types::SolverOptions::default();
        let candidates = generate_candidates(&project, &options);
        assert!(candidates.iter().any(|c| c.label == "current"));
        assert!(candidates.iter().any(|c| c.label == "seed"));
    }

    #[test]
    fn locked_poses_suppress_camera_initializers() {
        let mut project = simple_two_camera_project();
        project.points_mut()[1].lock_to(Vector3::new(1.0, 1.0, 1.0));
        let mut options = parallax_types::SolverOptions::default();
        options.lock_camera_poses = true;
        let candidates = generate_candidates(&project, &options);
        assert!(candidates
            .iter()
            .all(|c| c.cameras_initialized.is_empty()));
    }

    #[test]
    fn scene_scale_uses_median_line_length() {
        let mut project = Project::new("scale");
        let a = project.add_point(WorldPoint::new("a"));
        let b = project.add_point(WorldPoint::new("b"));
        for target in [1.0, 2.0, 50.0] {
            let mut line = Line::new("l", a, b);
            line.target_length = Some(target);
            project.add_line(line);
        }
        assert_eq!(scene_scale(&project), 8.0);
    }

    #[test]
    fn smart_seed_places_every_point() {
        let mut project = Project::new("seed");
        for i in 0..5 {
            project.add_point(WorldPoint::new(format!("p{i}")));
        }
        // A coplanar group covering three of them.
        project.add_constraint(Constraint::new(ConstraintKind::Coplanar {
            points: vec![
                parallax_types::PointId(0),
                parallax_types::PointId(1),
                parallax_types::PointId(2),
                parallax_types::PointId(3),
            ],
        }));
        project.add_viewpoint(Viewpoint::new("cam", 640, 480));

        let mut state = SceneState::from_project(&project);
        let mut seeded = vec![false; 5];
        smart_seed_fill(&project, &mut state, &mut seeded);
        assert!(seeded.iter().all(|s| *s));
        // Deterministic across runs.
        let mut state2 = SceneState::from_project(&project);
        let mut seeded2 = vec![false; 5];
        smart_seed_fill(&project, &mut state2, &mut seeded2);
        assert_eq!(state.points, state2.points);
    }

    #[test]
    fn plane_basis_is_orthonormal_in_plane() {
        let pts = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 1.0),
            Vector3::new(0.0, 1.0, 1.0),
            Vector3::new(1.0, 1.0, 1.0),
        ];
        let (centroid, u, v) = plane_basis(&pts);
        approx::assert_relative_eq!(centroid, Vector3::new(0.5, 0.5, 1.0), epsilon = 1e-12);
        // Both basis vectors lie in the z = 1 plane.
        assert!(u.z.abs() < 1e-9);
        assert!(v.z.abs() < 1e-9);
        assert!(u.dot(&v).abs() < 1e-9);
    }
}
