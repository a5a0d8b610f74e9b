//! Post-solve diagnostics: per-entity residual bucketing, outlier flagging
//! by median absolute deviation, and the quality summary.

use parallax_mvg::CameraParams;
use parallax_types::{EntityRef, ImagePointId, Project};

use crate::residual::ResidualSystem;
use crate::state::SceneState;

/// Default MAD multiplier for outlier flagging.
pub(crate) const OUTLIER_MAD_FACTOR: f64 = 3.0;

/// Bucket edges (pixels) of the residual histogram.
const HISTOGRAM_EDGES: [f64; 6] = [0.5, 1.0, 2.0, 4.0, 8.0, 16.0];

/// How many worst observations the summary keeps.
const WORST_N: usize = 10;

#[derive(Debug, Clone)]
pub struct CameraErrorStats {
    pub name: String,
    pub observations: usize,
    pub mean_px: f64,
    pub median_px: f64,
}

/// Human-consumable quality summary of a solved project.
#[derive(Debug, Clone)]
pub struct DiagnosticsSummary {
    /// Count of observations per pixel-error bucket; the last bucket is
    /// everything beyond the final edge.
    pub histogram: Vec<(f64, usize)>,
    /// The worst observations by pixel error, descending.
    pub worst_observations: Vec<(ImagePointId, f64)>,
    pub per_camera: Vec<CameraErrorStats>,
    /// Free-variable columns whose Jacobian norm was zero in the last solve.
    pub unobservable_columns: Vec<usize>,
}

/// Per-observation pixel error under `state`; `None` for observations of
/// disabled viewpoints or points behind the camera.
pub(crate) fn observation_errors(project: &Project, state: &SceneState) -> Vec<Option<f64>> {
    project
        .image_points()
        .iter()
        .map(|obs| {
            if !project.viewpoint(obs.viewpoint).enabled_in_solve {
                return None;
            }
            let cam: &CameraParams<f64> = &state.cameras[obs.viewpoint.0];
            cam.project(&state.points[obs.world_point.0])
                .map(|px| (px - obs.pixel.coords).norm())
        })
        .collect()
}

pub(crate) fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Median reprojection error in pixels over the active observations.
pub(crate) fn median_reprojection_error(project: &Project, state: &SceneState) -> Option<f64> {
    let mut errors: Vec<f64> = observation_errors(project, state)
        .into_iter()
        .flatten()
        .collect();
    median(&mut errors)
}

/// Observations whose error exceeds `factor` median absolute deviations
/// above the median.
pub(crate) fn mad_outliers(project: &Project, state: &SceneState, factor: f64) -> Vec<ImagePointId> {
    let errors = observation_errors(project, state);
    let mut finite: Vec<f64> = errors.iter().copied().flatten().collect();
    let Some(med) = median(&mut finite) else {
        return Vec::new();
    };
    let mut deviations: Vec<f64> = finite.iter().map(|e| (e - med).abs()).collect();
    let Some(mad) = median(&mut deviations) else {
        return Vec::new();
    };
    // Degenerate spread: every residual identical, nothing to flag.
    if mad < 1e-12 {
        return Vec::new();
    }
    errors
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, Some(e) if (e - med).abs() > factor * mad))
        .map(|(i, _)| ImagePointId(i))
        .collect()
}

/// Clear and refill `last_residuals` on every touched entity from the final
/// residual blocks.
pub(crate) fn write_last_residuals(project: &mut Project, system: &ResidualSystem) {
    for point in project.points_mut() {
        point.last_residuals.clear();
    }
    for viewpoint in project.viewpoints_mut() {
        viewpoint.last_residuals.clear();
    }

    let mut line_residuals: Vec<Vec<f64>> = vec![Vec::new(); project.lines().len()];
    let mut point_residuals: Vec<Vec<f64>> = vec![Vec::new(); project.points().len()];
    let mut viewpoint_residuals: Vec<Vec<f64>> = vec![Vec::new(); project.viewpoints().len()];

    for (sources, rows, active) in system.blocks() {
        if !active {
            continue;
        }
        let magnitude = rows.iter().map(|r| r * r).sum::<f64>().sqrt();
        for source in sources {
            match source {
                EntityRef::Point(p) => point_residuals[p.0].push(magnitude),
                EntityRef::Viewpoint(v) => viewpoint_residuals[v.0].push(magnitude),
                EntityRef::Line(l) => line_residuals[l.0].push(magnitude),
                EntityRef::ImagePoint(_) | EntityRef::Constraint(_) => {}
            }
        }
    }

    for (point, residuals) in project.points_mut().iter_mut().zip(point_residuals) {
        point.last_residuals = residuals;
    }
    for (viewpoint, residuals) in project.viewpoints_mut().iter_mut().zip(viewpoint_residuals) {
        viewpoint.last_residuals = residuals;
    }
    for (line, residuals) in project.lines_mut().iter_mut().zip(line_residuals) {
        line.last_residuals = residuals;
    }
}

/// Quality summary of the project's current entity state.
pub fn diagnose(project: &Project) -> DiagnosticsSummary {
    diagnose_with_unobservable(project, Vec::new())
}

pub(crate) fn diagnose_with_unobservable(
    project: &Project,
    unobservable_columns: Vec<usize>,
) -> DiagnosticsSummary {
    let state = SceneState::from_project(project);
    let errors = observation_errors(project, &state);

    let mut histogram: Vec<(f64, usize)> = HISTOGRAM_EDGES.iter().map(|e| (*e, 0)).collect();
    histogram.push((f64::INFINITY, 0));
    for error in errors.iter().flatten() {
        let bucket = HISTOGRAM_EDGES
            .iter()
            .position(|edge| error < edge)
            .unwrap_or(HISTOGRAM_EDGES.len());
        histogram[bucket].1 += 1;
    }

    let mut worst: Vec<(ImagePointId, f64)> = errors
        .iter()
        .enumerate()
        .filter_map(|(i, e)| e.map(|e| (ImagePointId(i), e)))
        .collect();
    worst.sort_by(|a, b| b.1.total_cmp(&a.1));
    worst.truncate(WORST_N);

    let per_camera = project
        .viewpoints()
        .iter()
        .map(|vp| {
            let mut cam_errors: Vec<f64> = vp
                .image_points
                .iter()
                .filter_map(|ip| errors[ip.0])
                .collect();
            let mean = if cam_errors.is_empty() {
                0.0
            } else {
                cam_errors.iter().sum::<f64>() / cam_errors.len() as f64
            };
            CameraErrorStats {
                name: vp.name.clone(),
                observations: cam_errors.len(),
                mean_px: mean,
                median_px: median(&mut cam_errors).unwrap_or(0.0),
            }
        })
        .collect();

    DiagnosticsSummary {
        histogram,
        worst_observations: worst,
        per_camera,
        unobservable_columns,
    }
}
