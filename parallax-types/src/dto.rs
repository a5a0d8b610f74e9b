//! JSON persistence records and their translation to the entity arenas.
//!
//! Hosts persist projects as JSON with short opaque string ids; the core
//! works on arena indices. This module is the only place where the two meet.
//! Loading resolves every id reference eagerly so the core never sees a
//! dangling reference; saving regenerates ids from arena positions.

use std::collections::HashMap;

use nalgebra::{Point2, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    Axis, Constraint, ConstraintKind, Intrinsics, Line, LineDirection, PointId, Project,
    SolverOptions, VanishingLine, Viewpoint, WorldPoint,
};

#[derive(Debug, Error)]
pub enum DtoError {
    #[error("duplicate id: {0}")]
    DuplicateId(String),
    #[error("unknown world point id: {0}")]
    UnknownPointId(String),
    #[error("unknown viewpoint id: {0}")]
    UnknownViewpointId(String),
    #[error("unknown line id: {0}")]
    UnknownLineId(String),
    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDto {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub world_points: Vec<WorldPointDto>,
    #[serde(default)]
    pub viewpoints: Vec<ViewpointDto>,
    #[serde(default)]
    pub image_points: Vec<ImagePointDto>,
    #[serde(default)]
    pub lines: Vec<LineDto>,
    #[serde(default)]
    pub constraints: Vec<ConstraintDto>,
    #[serde(default)]
    pub settings: SolverOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldPointDto {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub locked_x: Option<f64>,
    #[serde(default)]
    pub locked_y: Option<f64>,
    #[serde(default)]
    pub locked_z: Option<f64>,
    pub optimized_xyz: [f64; 3],
    /// Display color; round-tripped verbatim, ignored by the core.
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default = "yes")]
    pub is_visible: bool,
}

/// Rotation on disk: either a quaternion or XYZ Euler angles in radians.
/// Always written back as a quaternion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RotationDto {
    Quaternion { w: f64, x: f64, y: f64, z: f64 },
    Euler { rx: f64, ry: f64, rz: f64 },
}

impl RotationDto {
    pub fn to_quaternion(&self) -> Quaternion<f64> {
        match *self {
            RotationDto::Quaternion { w, x, y, z } => Quaternion::new(w, x, y, z),
            RotationDto::Euler { rx, ry, rz } => {
                *UnitQuaternion::from_euler_angles(rx, ry, rz).quaternion()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewpointDto {
    pub id: String,
    pub name: String,
    pub focal: f64,
    #[serde(default = "one")]
    pub aspect_ratio: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub skew: f64,
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub k3: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    pub position: [f64; 3],
    pub rotation: RotationDto,
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub is_pose_locked: bool,
    #[serde(default = "yes")]
    pub enabled_in_solve: bool,
    #[serde(default)]
    pub is_z_reflected: bool,
    #[serde(default)]
    pub vanishing_lines: Vec<VanishingLineDto>,
}

fn one() -> f64 {
    1.0
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VanishingLineDto {
    pub axis: Axis,
    pub ax: f64,
    pub ay: f64,
    pub bx: f64,
    pub by: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePointDto {
    pub viewpoint_id: String,
    pub world_point_id: String,
    pub u: f64,
    pub v: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineDto {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub a: String,
    pub b: String,
    pub direction: LineDirection,
    #[serde(default)]
    pub target_length: Option<f64>,
    #[serde(default)]
    pub tolerance: f64,
    #[serde(default = "yes")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ConstraintPayloadDto {
    Distance { a: String, b: String, target: f64 },
    FixedPoint { point: String, xyz: [f64; 3] },
    Collinear { points: Vec<String> },
    Coplanar { points: Vec<String> },
    EqualDistances { pairs: Vec<(String, String)> },
    ParallelLines { a: String, b: String },
    PerpendicularLines { a: String, b: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintDto {
    #[serde(flatten)]
    pub payload: ConstraintPayloadDto,
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default = "one")]
    pub priority: f64,
    #[serde(default)]
    pub tolerance: f64,
}

/// Parse a project from its JSON persistence form.
pub fn project_from_json(json: &str) -> Result<Project, DtoError> {
    let dto: ProjectDto = serde_json::from_str(json)?;
    project_from_dto(&dto)
}

/// Serialize a project to its JSON persistence form.
pub fn project_to_json(project: &Project) -> Result<String, DtoError> {
    Ok(serde_json::to_string_pretty(&project_to_dto(project))?)
}

pub fn project_from_dto(dto: &ProjectDto) -> Result<Project, DtoError> {
    let mut project = Project::new(dto.name.clone());
    project.options = dto.settings.clone();

    let mut point_ids = HashMap::new();
    for wp in &dto.world_points {
        let mut point = WorldPoint::new(wp.name.clone());
        point.locked = [wp.locked_x, wp.locked_y, wp.locked_z];
        point.optimized = Vector3::from(wp.optimized_xyz);
        point.color = wp.color.clone();
        point.is_visible = wp.is_visible;
        let id = project.add_point(point);
        if point_ids.insert(wp.id.clone(), id).is_some() {
            return Err(DtoError::DuplicateId(wp.id.clone()));
        }
    }

    let mut viewpoint_ids = HashMap::new();
    for vp in &dto.viewpoints {
        let mut viewpoint = Viewpoint::new(vp.name.clone(), vp.width, vp.height);
        viewpoint.intrinsics = Intrinsics {
            focal: vp.focal,
            aspect_ratio: vp.aspect_ratio,
            cx: vp.cx,
            cy: vp.cy,
            skew: vp.skew,
            k1: vp.k1,
            k2: vp.k2,
            k3: vp.k3,
            p1: vp.p1,
            p2: vp.p2,
        };
        viewpoint.position = Vector3::from(vp.position);
        viewpoint.rotation = vp.rotation.to_quaternion();
        viewpoint.is_pose_locked = vp.is_pose_locked;
        viewpoint.enabled_in_solve = vp.enabled_in_solve;
        viewpoint.is_z_reflected = vp.is_z_reflected;
        viewpoint.vanishing_lines = vp
            .vanishing_lines
            .iter()
            .map(|vl| VanishingLine {
                axis: vl.axis,
                a: Point2::new(vl.ax, vl.ay),
                b: Point2::new(vl.bx, vl.by),
            })
            .collect();
        let id = project.add_viewpoint(viewpoint);
        if viewpoint_ids.insert(vp.id.clone(), id).is_some() {
            return Err(DtoError::DuplicateId(vp.id.clone()));
        }
    }

    let lookup_point = |id: &str| -> Result<PointId, DtoError> {
        point_ids
            .get(id)
            .copied()
            .ok_or_else(|| DtoError::UnknownPointId(id.to_string()))
    };

    for ip in &dto.image_points {
        let point = lookup_point(&ip.world_point_id)?;
        let viewpoint = viewpoint_ids
            .get(&ip.viewpoint_id)
            .copied()
            .ok_or_else(|| DtoError::UnknownViewpointId(ip.viewpoint_id.clone()))?;
        project.add_image_point(point, viewpoint, Point2::new(ip.u, ip.v));
    }

    let mut line_ids = HashMap::new();
    for ld in &dto.lines {
        let mut line = Line::new(ld.name.clone(), lookup_point(&ld.a)?, lookup_point(&ld.b)?);
        line.direction = ld.direction;
        line.target_length = ld.target_length;
        line.tolerance = ld.tolerance;
        line.enabled = ld.enabled;
        let id = project.add_line(line);
        if line_ids.insert(ld.id.clone(), id).is_some() {
            return Err(DtoError::DuplicateId(ld.id.clone()));
        }
    }

    let lookup_line = |id: &str| {
        line_ids
            .get(id)
            .copied()
            .ok_or_else(|| DtoError::UnknownLineId(id.to_string()))
    };

    for cd in &dto.constraints {
        let kind = match &cd.payload {
            ConstraintPayloadDto::Distance { a, b, target } => ConstraintKind::Distance {
                a: lookup_point(a)?,
                b: lookup_point(b)?,
                target: *target,
            },
            ConstraintPayloadDto::FixedPoint { point, xyz } => ConstraintKind::FixedPoint {
                point: lookup_point(point)?,
                target: Vector3::from(*xyz),
            },
            ConstraintPayloadDto::Collinear { points } => ConstraintKind::Collinear {
                points: points
                    .iter()
                    .map(|p| lookup_point(p))
                    .collect::<Result<_, _>>()?,
            },
            ConstraintPayloadDto::Coplanar { points } => ConstraintKind::Coplanar {
                points: points
                    .iter()
                    .map(|p| lookup_point(p))
                    .collect::<Result<_, _>>()?,
            },
            ConstraintPayloadDto::EqualDistances { pairs } => ConstraintKind::EqualDistances {
                pairs: pairs
                    .iter()
                    .map(|(a, b)| Ok((lookup_point(a)?, lookup_point(b)?)))
                    .collect::<Result<_, DtoError>>()?,
            },
            ConstraintPayloadDto::ParallelLines { a, b } => ConstraintKind::ParallelLines {
                a: lookup_line(a)?,
                b: lookup_line(b)?,
            },
            ConstraintPayloadDto::PerpendicularLines { a, b } => {
                ConstraintKind::PerpendicularLines {
                    a: lookup_line(a)?,
                    b: lookup_line(b)?,
                }
            }
        };
        let mut constraint = Constraint::new(kind);
        constraint.enabled = cd.enabled;
        constraint.priority = cd.priority;
        constraint.tolerance = cd.tolerance;
        project.add_constraint(constraint);
    }

    Ok(project)
}

pub fn project_to_dto(project: &Project) -> ProjectDto {
    let point_id = |id: PointId| format!("p{}", id.0);
    let viewpoint_id = |id: crate::ViewpointId| format!("v{}", id.0);
    let line_id = |id: crate::LineId| format!("l{}", id.0);

    ProjectDto {
        id: "project".to_string(),
        name: project.name.clone(),
        world_points: project
            .points()
            .iter()
            .enumerate()
            .map(|(i, p)| WorldPointDto {
                id: point_id(PointId(i)),
                name: p.name.clone(),
                locked_x: p.locked[0],
                locked_y: p.locked[1],
                locked_z: p.locked[2],
                optimized_xyz: [p.optimized.x, p.optimized.y, p.optimized.z],
                color: p.color.clone(),
                is_visible: p.is_visible,
            })
            .collect(),
        viewpoints: project
            .viewpoints()
            .iter()
            .enumerate()
            .map(|(i, v)| ViewpointDto {
                id: viewpoint_id(crate::ViewpointId(i)),
                name: v.name.clone(),
                focal: v.intrinsics.focal,
                aspect_ratio: v.intrinsics.aspect_ratio,
                cx: v.intrinsics.cx,
                cy: v.intrinsics.cy,
                skew: v.intrinsics.skew,
                k1: v.intrinsics.k1,
                k2: v.intrinsics.k2,
                k3: v.intrinsics.k3,
                p1: v.intrinsics.p1,
                p2: v.intrinsics.p2,
                position: [v.position.x, v.position.y, v.position.z],
                rotation: RotationDto::Quaternion {
                    w: v.rotation.w,
                    x: v.rotation.i,
                    y: v.rotation.j,
                    z: v.rotation.k,
                },
                width: v.width,
                height: v.height,
                is_pose_locked: v.is_pose_locked,
                enabled_in_solve: v.enabled_in_solve,
                is_z_reflected: v.is_z_reflected,
                vanishing_lines: v
                    .vanishing_lines
                    .iter()
                    .map(|vl| VanishingLineDto {
                        axis: vl.axis,
                        ax: vl.a.x,
                        ay: vl.a.y,
                        bx: vl.b.x,
                        by: vl.b.y,
                    })
                    .collect(),
            })
            .collect(),
        image_points: project
            .image_points()
            .iter()
            .map(|ip| ImagePointDto {
                viewpoint_id: viewpoint_id(ip.viewpoint),
                world_point_id: point_id(ip.world_point),
                u: ip.pixel.x,
                v: ip.pixel.y,
            })
            .collect(),
        lines: project
            .lines()
            .iter()
            .enumerate()
            .map(|(i, l)| LineDto {
                id: line_id(crate::LineId(i)),
                name: l.name.clone(),
                a: point_id(l.a),
                b: point_id(l.b),
                direction: l.direction,
                target_length: l.target_length,
                tolerance: l.tolerance,
                enabled: l.enabled,
            })
            .collect(),
        constraints: project
            .constraints()
            .iter()
            .map(|c| ConstraintDto {
                payload: match &c.kind {
                    ConstraintKind::Distance { a, b, target } => ConstraintPayloadDto::Distance {
                        a: point_id(*a),
                        b: point_id(*b),
                        target: *target,
                    },
                    ConstraintKind::FixedPoint { point, target } => {
                        ConstraintPayloadDto::FixedPoint {
                            point: point_id(*point),
                            xyz: [target.x, target.y, target.z],
                        }
                    }
                    ConstraintKind::Collinear { points } => ConstraintPayloadDto::Collinear {
                        points: points.iter().map(|p| point_id(*p)).collect(),
                    },
                    ConstraintKind::Coplanar { points } => ConstraintPayloadDto::Coplanar {
                        points: points.iter().map(|p| point_id(*p)).collect(),
                    },
                    ConstraintKind::EqualDistances { pairs } => {
                        ConstraintPayloadDto::EqualDistances {
                            pairs: pairs
                                .iter()
                                .map(|(a, b)| (point_id(*a), point_id(*b)))
                                .collect(),
                        }
                    }
                    ConstraintKind::ParallelLines { a, b } => ConstraintPayloadDto::ParallelLines {
                        a: line_id(*a),
                        b: line_id(*b),
                    },
                    ConstraintKind::PerpendicularLines { a, b } => {
                        ConstraintPayloadDto::PerpendicularLines {
                            a: line_id(*a),
                            b: line_id(*b),
                        }
                    }
                },
                enabled: c.enabled,
                priority: c.priority,
                tolerance: c.tolerance,
            })
            .collect(),
        settings: project.options.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_project() -> Project {
        let mut project = Project::new("sample");
        let mut wp = WorldPoint::new("origin");
        wp.lock_to(Vector3::zeros());
        let p0 = project.add_point(wp);
        let mut wp1 = WorldPoint::new("corner");
        wp1.optimized = Vector3::new(1.0, 2.5, -0.25);
        wp1.locked[2] = Some(0.0);
        wp1.color = Some("#ff8800".to_string());
        let p1 = project.add_point(wp1);
        let p2 = project.add_point(WorldPoint::new("loose-a"));
        let p3 = project.add_point(WorldPoint::new("loose-b"));

        let mut viewpoint = Viewpoint::new("cam0", 1920, 1080);
        viewpoint.intrinsics.k1 = -0.07;
        viewpoint.intrinsics.p2 = 0.0013;
        viewpoint.is_z_reflected = true;
        viewpoint.vanishing_lines.push(VanishingLine {
            axis: Axis::Y,
            a: Point2::new(10.0, 20.0),
            b: Point2::new(700.5, 44.25),
        });
        let cam = project.add_viewpoint(viewpoint);
        project.add_image_point(p0, cam, Point2::new(960.25, 540.5));
        project.add_image_point(p1, cam, Point2::new(1204.0, 388.125));

        let mut line = Line::new("edge", p0, p1);
        line.direction = LineDirection::X;
        line.target_length = Some(2.0);
        let l0 = project.add_line(line);
        let mut other = Line::new("edge2", p2, p3);
        other.direction = LineDirection::Vertical;
        let l1 = project.add_line(other);

        project.add_constraint(Constraint::new(ConstraintKind::Distance {
            a: p0,
            b: p1,
            target: 2.0,
        }));
        project.add_constraint(Constraint::new(ConstraintKind::FixedPoint {
            point: p2,
            target: Vector3::new(0.5, 0.5, 1.5),
        }));
        project.add_constraint(Constraint::new(ConstraintKind::Collinear {
            points: vec![p0, p1, p2],
        }));
        project.add_constraint(Constraint::new(ConstraintKind::Coplanar {
            points: vec![p0, p1, p2, p3],
        }));
        project.add_constraint(Constraint::new(ConstraintKind::EqualDistances {
            pairs: vec![(p0, p1), (p2, p3)],
        }));
        project.add_constraint(Constraint::new(ConstraintKind::ParallelLines { a: l0, b: l1 }));
        let mut disabled = Constraint::new(ConstraintKind::PerpendicularLines { a: l0, b: l1 });
        disabled.enabled = false;
        disabled.priority = 0.5;
        project.add_constraint(disabled);
        project
    }

    #[test]
    fn json_round_trip_is_numerically_identical() {
        let project = sample_project();
        let json = project_to_json(&project).unwrap();
        let reloaded = project_from_json(&json).unwrap();
        let json2 = project_to_json(&reloaded).unwrap();
        // Ids are regenerated deterministically, so the whole document must
        // survive a load/save cycle byte for byte.
        assert_eq!(json, json2);
        assert_eq!(reloaded.points()[1].locked, [None, None, Some(0.0)]);
        assert_eq!(reloaded.image_points()[1].pixel, Point2::new(1204.0, 388.125));
        assert_eq!(reloaded.points()[1].color.as_deref(), Some("#ff8800"));
        assert!(reloaded.viewpoints()[0].is_z_reflected);
        assert_eq!(reloaded.viewpoints()[0].vanishing_lines[0].axis, Axis::Y);
        assert_eq!(reloaded.constraints().len(), 7);
        assert!(!reloaded.constraints()[6].enabled);
        assert!(matches!(
            &reloaded.constraints()[4].kind,
            ConstraintKind::EqualDistances { pairs } if pairs.len() == 2
        ));
    }

    #[test]
    fn euler_rotation_accepted_on_load() {
        let json = r#"{
            "id": "x", "name": "euler",
            "worldPoints": [],
            "viewpoints": [{
                "id": "v0", "name": "cam", "focal": 1000.0, "cx": 320.0, "cy": 240.0,
                "position": [0.0, 0.0, 0.0],
                "rotation": {"rx": 0.1, "ry": -0.2, "rz": 0.3},
                "width": 640, "height": 480
            }],
            "imagePoints": [], "lines": [], "constraints": []
        }"#;
        let project = project_from_json(json).unwrap();
        let q = project.viewpoints()[0].rotation;
        let expected = UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3);
        approx::assert_relative_eq!(q.w, expected.w, epsilon = 1e-12);
        approx::assert_relative_eq!(q.i, expected.i, epsilon = 1e-12);
    }

    #[test]
    fn unknown_reference_is_a_load_error() {
        let json = r#"{
            "id": "x", "name": "bad",
            "worldPoints": [],
            "viewpoints": [],
            "imagePoints": [{"viewpointId": "v9", "worldPointId": "p9", "u": 0.0, "v": 0.0}],
            "lines": [], "constraints": []
        }"#;
        assert!(matches!(
            project_from_json(json),
            Err(DtoError::UnknownViewpointId(_))
        ));
    }
}
