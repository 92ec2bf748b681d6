//! Streamline geometry
//!
//! Turns the `lines` field of a streamline table into tube meshes. Each line
//! is extruded with a circular cross-section along parallel-transported
//! frames, capped at both ends, and all tubes are merged into one object.

use palette::Srgb;
use serde_json::Value;
use std::f32::consts::PI;
use std::path::Path;

use crate::config::RenderDefaults;
use crate::error::{Result, StreamlineError};
use crate::frame::{json_kind, StreamlineFrame};

pub type Point3 = [f32; 3];

/// Consecutive points closer than this are collapsed
const MIN_SEGMENT: f32 = 1e-6;

/// Minimum number of vertices around a tube
const MIN_RESOLUTION: u32 = 3;

/// Appearance of streamline tubes
#[derive(Debug, Clone, PartialEq)]
pub struct TubeStyle {
    pub radius: f32,
    pub color: Srgb<u8>,
    /// Opacity in 0..=1
    pub alpha: f32,
    /// Vertices around each cross-section ring
    pub resolution: u32,
}

impl TubeStyle {
    pub fn from_defaults(defaults: &RenderDefaults) -> Result<Self> {
        Ok(Self {
            radius: defaults.radius,
            color: crate::color::parse_color(&defaults.color)?,
            alpha: defaults.alpha.clamp(0.0, 1.0),
            resolution: defaults.resolution,
        })
    }
}

/// Indexed triangle mesh with per-vertex normals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub positions: Vec<Point3>,
    pub normals: Vec<Point3>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Append another mesh, re-basing its indices
    pub fn append(&mut self, other: &Mesh) {
        let offset = self.positions.len() as u32;
        self.positions.extend_from_slice(&other.positions);
        self.normals.extend_from_slice(&other.normals);
        self.indices.extend(other.indices.iter().map(|i| i + offset));
    }

    /// Axis-aligned bounding box as (min, max)
    pub fn bounds(&self) -> Option<(Point3, Point3)> {
        let first = *self.positions.first()?;
        let mut min = first;
        let mut max = first;
        for p in &self.positions {
            for i in 0..3 {
                min[i] = min[i].min(p[i]);
                max[i] = max[i].max(p[i]);
            }
        }
        Some((min, max))
    }
}

/// Merged streamline tubes, colored uniformly
#[derive(Debug, Clone)]
pub struct StreamlineActor {
    pub mesh: Mesh,
    /// Point sequences that produced a tube
    pub lines: Vec<Vec<Point3>>,
    pub color: Srgb<u8>,
    pub alpha: f32,
}

impl StreamlineActor {
    pub fn tube_count(&self) -> usize {
        self.lines.len()
    }
}

/// Build streamline tubes from either a JSON file or an already-loaded table.
///
/// Exactly one of `filepath` and `data` must be given. Returns a single merged
/// actor.
pub fn parse_streamline(
    filepath: Option<&Path>,
    data: Option<&StreamlineFrame>,
    style: &TubeStyle,
) -> Result<Vec<StreamlineActor>> {
    let loaded;
    let frame = match (filepath, data) {
        (Some(path), None) => {
            tracing::debug!("Loading streamlines from {:?}", path);
            loaded = StreamlineFrame::read_json(path)?;
            &loaded
        }
        (None, Some(frame)) => frame,
        _ => {
            return Err(StreamlineError::InvalidArgument(
                "pass either a filepath or data to parse_streamline, not both".to_string(),
            ))
        }
    };

    let lines = extract_lines(frame)?;

    let mut mesh = Mesh::default();
    let mut used = Vec::with_capacity(lines.len());
    for line in lines {
        match tube(&line, style.radius, style.resolution) {
            Some(t) => {
                mesh.append(&t);
                used.push(line);
            }
            None => tracing::warn!("Skipping streamline with fewer than 2 distinct points"),
        }
    }

    // TODO: render injection sites as spheres from the `injection_sites` column

    if used.is_empty() {
        tracing::warn!("No renderable streamlines found");
    }
    tracing::debug!(
        "Built {} tubes: {} vertices, {} triangles",
        used.len(),
        mesh.vertex_count(),
        mesh.triangle_count()
    );

    Ok(vec![StreamlineActor {
        mesh,
        lines: used,
        color: style.color,
        alpha: style.alpha,
    }])
}

/// Point sequences from the `lines` column.
///
/// A column holding a single entry is unwrapped first: downloaded tables carry
/// one record whose value is the list of lines, while hand-written files may
/// hold one bare line.
pub fn extract_lines(frame: &StreamlineFrame) -> Result<Vec<Vec<Point3>>> {
    let column = frame
        .column("lines")
        .ok_or_else(|| StreamlineError::MalformedData("missing 'lines' field".to_string()))?;

    let lines_data: Vec<&Value> = if column.len() == 1 {
        match &column[0] {
            Value::Array(inner) => inner.iter().collect(),
            other => {
                return Err(StreamlineError::MalformedData(format!(
                    "'lines' holds {}, expected an array",
                    json_kind(other)
                )))
            }
        }
    } else {
        column.iter().collect()
    };

    // A bare list of point objects is one line
    if lines_data.first().map_or(false, |v| v.is_object()) {
        return Ok(vec![line_points(lines_data)?]);
    }

    lines_data
        .into_iter()
        .map(|line| match line {
            Value::Array(points) => line_points(points.iter()),
            other => Err(StreamlineError::MalformedData(format!(
                "line is {}, expected an array of points",
                json_kind(other)
            ))),
        })
        .collect()
}

fn line_points<'a, I>(points: I) -> Result<Vec<Point3>>
where
    I: IntoIterator<Item = &'a Value>,
{
    points.into_iter().map(point_from_json).collect()
}

fn point_from_json(value: &Value) -> Result<Point3> {
    let coord = |axis: &str| {
        value
            .get(axis)
            .and_then(Value::as_f64)
            .map(|v| v as f32)
            .ok_or_else(|| StreamlineError::MalformedData(format!("point without numeric '{}': {}", axis, value)))
    };
    Ok([coord("x")?, coord("y")?, coord("z")?])
}

/// Extrude a circular tube through `points`.
///
/// Returns `None` when fewer than two distinct points remain.
pub fn tube(points: &[Point3], radius: f32, resolution: u32) -> Option<Mesh> {
    let path = dedup_points(points);
    if path.len() < 2 {
        return None;
    }

    let n = resolution.max(MIN_RESOLUTION);
    let tangents = path_tangents(&path);

    let mut mesh = Mesh::default();
    let mut normal = any_perpendicular(tangents[0]);
    let mut frames = Vec::with_capacity(path.len());

    for (i, (&center, &t)) in path.iter().zip(&tangents).enumerate() {
        if i > 0 {
            // Parallel transport: drop the tangent component of the previous normal
            normal = normalize(sub(normal, scale(t, dot(normal, t)))).unwrap_or_else(|| any_perpendicular(t));
        }
        let binormal = cross(t, normal);
        frames.push((center, t, normal, binormal));

        let ring_start = mesh.positions.len() as u32;
        for j in 0..n {
            let theta = 2.0 * PI * j as f32 / n as f32;
            let dir = add(scale(normal, theta.cos()), scale(binormal, theta.sin()));
            mesh.positions.push(add(center, scale(dir, radius)));
            mesh.normals.push(dir);
        }

        if i > 0 {
            connect_rings(&mut mesh.indices, ring_start - n, ring_start, n);
        }
    }

    if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
        cap_end(&mut mesh, *first, radius, n, true);
        cap_end(&mut mesh, *last, radius, n, false);
    }

    Some(mesh)
}

type Frame = (Point3, Point3, Point3, Point3);

/// Two triangles per quad, counter-clockwise seen from outside
fn connect_rings(indices: &mut Vec<u32>, ring1_start: u32, ring2_start: u32, ring_len: u32) {
    for j in 0..ring_len {
        let j_next = (j + 1) % ring_len;

        let v00 = ring1_start + j;
        let v01 = ring1_start + j_next;
        let v10 = ring2_start + j;
        let v11 = ring2_start + j_next;

        indices.extend_from_slice(&[v00, v01, v10, v01, v11, v10]);
    }
}

/// Flat disc closing one end of the tube
fn cap_end(mesh: &mut Mesh, frame: Frame, radius: f32, ring_len: u32, is_start: bool) {
    let (center, tangent, normal, binormal) = frame;
    let cap_normal = if is_start { scale(tangent, -1.0) } else { tangent };

    let center_idx = mesh.positions.len() as u32;
    mesh.positions.push(center);
    mesh.normals.push(cap_normal);

    let edge_start = mesh.positions.len() as u32;
    for j in 0..ring_len {
        let theta = 2.0 * PI * j as f32 / ring_len as f32;
        let dir = add(scale(normal, theta.cos()), scale(binormal, theta.sin()));
        mesh.positions.push(add(center, scale(dir, radius)));
        mesh.normals.push(cap_normal);
    }

    for j in 0..ring_len {
        let j_next = (j + 1) % ring_len;
        if is_start {
            mesh.indices.extend_from_slice(&[center_idx, edge_start + j_next, edge_start + j]);
        } else {
            mesh.indices.extend_from_slice(&[center_idx, edge_start + j, edge_start + j_next]);
        }
    }
}

fn dedup_points(points: &[Point3]) -> Vec<Point3> {
    let mut path: Vec<Point3> = Vec::with_capacity(points.len());
    for &p in points {
        match path.last() {
            Some(&last) if length(sub(p, last)) < MIN_SEGMENT => {}
            _ => path.push(p),
        }
    }
    path
}

/// Central differences inside, one-sided at the ends
fn path_tangents(path: &[Point3]) -> Vec<Point3> {
    let last = path.len() - 1;
    (0..path.len())
        .map(|i| {
            let segment = if i == 0 {
                sub(path[1], path[0])
            } else {
                sub(path[i], path[i - 1])
            };
            let spanning = sub(path[(i + 1).min(last)], path[i.saturating_sub(1)]);
            normalize(spanning)
                .or_else(|| normalize(segment))
                .unwrap_or([0.0, 0.0, 1.0])
        })
        .collect()
}

fn any_perpendicular(t: Point3) -> Point3 {
    // Axis least aligned with the tangent
    let axis = if t[0].abs() <= t[1].abs() && t[0].abs() <= t[2].abs() {
        [1.0, 0.0, 0.0]
    } else if t[1].abs() <= t[2].abs() {
        [0.0, 1.0, 0.0]
    } else {
        [0.0, 0.0, 1.0]
    };
    normalize(sub(axis, scale(t, dot(axis, t)))).unwrap_or([1.0, 0.0, 0.0])
}

fn add(a: Point3, b: Point3) -> Point3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn sub(a: Point3, b: Point3) -> Point3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn scale(a: Point3, s: f32) -> Point3 {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn dot(a: Point3, b: Point3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Point3, b: Point3) -> Point3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn length(a: Point3) -> f32 {
    dot(a, a).sqrt()
}

fn normalize(a: Point3) -> Option<Point3> {
    let len = length(a);
    if len < MIN_SEGMENT {
        None
    } else {
        Some(scale(a, 1.0 / len))
    }
}
