use nalgebra::{Point3, Vector3};

/// An axis-aligned bounding box in 3D.
#[derive(Debug, Clone, Copy)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    /// An empty box that any point will grow.
    pub fn empty() -> Self {
        Self {
            min: Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            max: Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    pub fn from_points(points: &[Point3<f64>]) -> Self {
        let mut aabb = Self::empty();
        for p in points {
            aabb.grow(p);
        }
        aabb
    }

    pub fn grow(&mut self, p: &Point3<f64>) {
        self.min = Point3::from(self.min.coords.inf(&p.coords));
        self.max = Point3::from(self.max.coords.sup(&p.coords));
    }

    /// Side lengths of the box. Negative for an empty box.
    pub fn extent(&self) -> Vector3<f64> {
        self.max - self.min
    }

    /// Length of the main diagonal.
    pub fn diagonal(&self) -> f64 {
        self.extent().norm()
    }

    pub fn contains(&self, p: &Point3<f64>) -> bool {
        p.x >= self.min.x
            && p.y >= self.min.y
            && p.z >= self.min.z
            && p.x <= self.max.x
            && p.y <= self.max.y
            && p.z <= self.max.z
    }
}

/// A set of oriented points: positions with unit normals, and optionally
/// per-vertex boundary flags when the data came from a mesh.
pub struct PointCloud {
    /// Vertex positions, in the set's local coordinate frame.
    pub positions: Vec<Point3<f64>>,

    /// Unit normal per vertex, same indexing as `positions`.
    pub normals: Vec<Vector3<f64>>,

    /// Marks vertices that lie on a mesh boundary (where normals are
    /// ill-defined). `None` when the information is unavailable.
    pub boundary: Option<Vec<bool>>,

    /// True when the set has no face/connectivity structure. Normal
    /// directions of a bare point cloud are not trusted for matching.
    pub point_cloud: bool,
}

impl PointCloud {
    /// A bare point cloud: positions and (estimated) normals, no topology.
    pub fn from_points(positions: Vec<Point3<f64>>, normals: Vec<Vector3<f64>>) -> Self {
        debug_assert_eq!(positions.len(), normals.len());
        Self {
            positions,
            normals,
            boundary: None,
            point_cloud: true,
        }
    }

    /// Vertices of a mesh: normals come from the surface and can be trusted,
    /// boundary flags are available when the mesh has open edges.
    pub fn from_mesh_vertices(
        positions: Vec<Point3<f64>>,
        normals: Vec<Vector3<f64>>,
        boundary: Option<Vec<bool>>,
    ) -> Self {
        debug_assert_eq!(positions.len(), normals.len());
        Self {
            positions,
            normals,
            boundary,
            point_cloud: false,
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn is_boundary(&self, i: usize) -> bool {
        self.boundary.as_ref().map_or(false, |b| b[i])
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::from_points(&self.positions)
    }
}
