use nalgebra::Point2;

use crate::{
    Constraint, ConstraintId, ImagePointId, Line, LineId, PointId, SolverOptions, Viewpoint,
    ViewpointId, WorldPoint,
};

/// One observation: a world point seen at a pixel location in a viewpoint.
///
/// Constant during a solve; only ever created alongside back references on
/// both its endpoints via [`Project::add_image_point`].
#[derive(Debug, Clone)]
pub struct ImagePoint {
    pub world_point: PointId,
    pub viewpoint: ViewpointId,
    pub pixel: Point2<f64>,
}

/// The owning container for all entities of a reconstruction.
///
/// Lines, image points, and constraints hold plain index references to their
/// endpoints; the cyclic world-point / image-point / viewpoint relation is
/// resolved through the arenas here, never through owning pointers.
#[derive(Debug, Clone, Default)]
pub struct Project {
    pub name: String,
    points: Vec<WorldPoint>,
    viewpoints: Vec<Viewpoint>,
    image_points: Vec<ImagePoint>,
    lines: Vec<Line>,
    constraints: Vec<Constraint>,
    pub options: SolverOptions,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_point(&mut self, point: WorldPoint) -> PointId {
        self.points.push(point);
        PointId(self.points.len() - 1)
    }

    pub fn add_viewpoint(&mut self, viewpoint: Viewpoint) -> ViewpointId {
        self.viewpoints.push(viewpoint);
        ViewpointId(self.viewpoints.len() - 1)
    }

    /// Record an observation and maintain the back references on the observed
    /// world point and the observing viewpoint.
    pub fn add_image_point(
        &mut self,
        world_point: PointId,
        viewpoint: ViewpointId,
        pixel: Point2<f64>,
    ) -> ImagePointId {
        let id = ImagePointId(self.image_points.len());
        self.image_points.push(ImagePoint {
            world_point,
            viewpoint,
            pixel,
        });
        self.points[world_point.0].observations.push(id);
        self.viewpoints[viewpoint.0].image_points.push(id);
        id
    }

    pub fn add_line(&mut self, line: Line) -> LineId {
        self.lines.push(line);
        LineId(self.lines.len() - 1)
    }

    pub fn add_constraint(&mut self, constraint: Constraint) -> ConstraintId {
        self.constraints.push(constraint);
        ConstraintId(self.constraints.len() - 1)
    }

    pub fn points(&self) -> &[WorldPoint] {
        &self.points
    }

    pub fn points_mut(&mut self) -> &mut [WorldPoint] {
        &mut self.points
    }

    pub fn point(&self, id: PointId) -> &WorldPoint {
        &self.points[id.0]
    }

    pub fn point_mut(&mut self, id: PointId) -> &mut WorldPoint {
        &mut self.points[id.0]
    }

    pub fn viewpoints(&self) -> &[Viewpoint] {
        &self.viewpoints
    }

    pub fn viewpoints_mut(&mut self) -> &mut [Viewpoint] {
        &mut self.viewpoints
    }

    pub fn viewpoint(&self, id: ViewpointId) -> &Viewpoint {
        &self.viewpoints[id.0]
    }

    pub fn viewpoint_mut(&mut self, id: ViewpointId) -> &mut Viewpoint {
        &mut self.viewpoints[id.0]
    }

    pub fn image_points(&self) -> &[ImagePoint] {
        &self.image_points
    }

    pub fn image_point(&self, id: ImagePointId) -> &ImagePoint {
        &self.image_points[id.0]
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn lines_mut(&mut self) -> &mut [Line] {
        &mut self.lines
    }

    pub fn line(&self, id: LineId) -> &Line {
        &self.lines[id.0]
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn constraint(&self, id: ConstraintId) -> &Constraint {
        &self.constraints[id.0]
    }

    /// Ids of world points with all three axes locked. Two or more of these
    /// fix the gauge without locking a camera.
    pub fn fully_locked_points(&self) -> Vec<PointId> {
        self.points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_fully_locked())
            .map(|(i, _)| PointId(i))
            .collect()
    }

    /// Observations shared between two viewpoints, as
    /// `(point, pixel in a, pixel in b)` triples.
    pub fn shared_observations(
        &self,
        a: ViewpointId,
        b: ViewpointId,
    ) -> Vec<(PointId, Point2<f64>, Point2<f64>)> {
        let mut shared = Vec::new();
        for ip_a in &self.viewpoints[a.0].image_points {
            let obs_a = &self.image_points[ip_a.0];
            for ip_b in &self.viewpoints[b.0].image_points {
                let obs_b = &self.image_points[ip_b.0];
                if obs_a.world_point == obs_b.world_point {
                    shared.push((obs_a.world_point, obs_a.pixel, obs_b.pixel));
                }
            }
        }
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_point_back_references() {
        let mut project = Project::new("test");
        let p = project.add_point(WorldPoint::new("p"));
        let v = project.add_viewpoint(Viewpoint::new("cam", 640, 480));
        let ip = project.add_image_point(p, v, Point2::new(10.0, 20.0));
        assert_eq!(project.point(p).observations, vec![ip]);
        assert_eq!(project.viewpoint(v).image_points, vec![ip]);
        assert_eq!(project.image_point(ip).world_point, p);
        assert_eq!(project.image_point(ip).viewpoint, v);
    }

    #[test]
    fn shared_observations_match_on_point() {
        let mut project = Project::new("test");
        let p0 = project.add_point(WorldPoint::new("p0"));
        let p1 = project.add_point(WorldPoint::new("p1"));
        let va = project.add_viewpoint(Viewpoint::new("a", 640, 480));
        let vb = project.add_viewpoint(Viewpoint::new("b", 640, 480));
        project.add_image_point(p0, va, Point2::new(1.0, 1.0));
        project.add_image_point(p0, vb, Point2::new(2.0, 2.0));
        project.add_image_point(p1, va, Point2::new(3.0, 3.0));
        let shared = project.shared_observations(va, vb);
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].0, p0);
    }
}
