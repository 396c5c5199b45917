//! Mesh geometry for the render pipeline.
//!
//! A mesh owns its vertices and triangle faces in object space, together
//! with the object-to-world transform and the derived matrices the
//! intersection pipeline needs (world-to-object for rays, inverse
//! transpose for normals).

use pyre_math::{Aabb, Mat4, SlimRay, Vec2, Vec3};

/// Intersection tolerance along the ray parameter.
const T_EPSILON: f32 = 1e-5;

/// Determinant threshold below which a triangle is treated as degenerate.
const DET_EPSILON: f32 = 1e-8;

/// A mesh vertex: position, normal, and texture coordinates.
#[derive(Clone, Copy, Debug)]
pub struct Vertex {
    pub v: Vec3,
    pub n: Vec3,
    pub t: Vec2,
}

impl Vertex {
    pub fn new(v: Vec3, n: Vec3, t: Vec2) -> Self {
        Self { v, n, t }
    }
}

/// Surface geometry at a hit point, interpolated from the triangle's
/// vertices with the hit's barycentric coordinates. The normal is in
/// object space until the intersection pipeline corrects it to world
/// space.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalGeometry {
    pub n: Vec3,
    pub tex: Vec2,
}

/// Triangle mesh with transform, as materialized by the scene loader.
#[derive(Clone, Debug)]
pub struct Mesh {
    /// Resource id, assigned when the mesh is synced into the library
    pub id: u32,

    /// Material resource id
    pub material: u32,

    /// Object-to-world transform
    pub xform: Mat4,

    /// World-to-object transform (rays are intersected in object space)
    pub xform_inv: Mat4,

    /// Inverse transpose, for carrying normals back to world space
    pub xform_inv_tr: Mat4,

    /// Vertices in object space
    pub vertices: Vec<Vertex>,

    /// Triangles as vertex index triples
    pub faces: Vec<[u32; 3]>,

    /// World-space centroid (vertex average), used for light sampling
    pub centroid: Vec3,
}

impl Mesh {
    /// Create a mesh and compute its derived matrices and centroid.
    pub fn new(material: u32, xform: Mat4, vertices: Vec<Vertex>, faces: Vec<[u32; 3]>) -> Self {
        let xform_inv = xform.inverse();
        let xform_inv_tr = xform_inv.transpose();

        let mut centroid = Vec3::ZERO;
        for vertex in &vertices {
            centroid += vertex.v;
        }
        if !vertices.is_empty() {
            centroid /= vertices.len() as f32;
        }
        let centroid = xform.transform_point3(centroid);

        Self {
            id: 0,
            material,
            xform,
            xform_inv,
            xform_inv_tr,
            vertices,
            faces,
            centroid,
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.faces.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Approximate in-memory size, reported by the scene loader.
    pub fn size_bytes(&self) -> usize {
        self.vertices.len() * std::mem::size_of::<Vertex>()
            + self.faces.len() * std::mem::size_of::<[u32; 3]>()
    }

    /// Object-space bounding box of one face.
    pub fn face_bounds(&self, face: usize) -> Aabb {
        let [a, b, c] = self.faces[face];
        let p0 = self.vertices[a as usize].v;
        let p1 = self.vertices[b as usize].v;
        let p2 = self.vertices[c as usize].v;

        let mut bounds = Aabb::from_points(p0, p1);
        bounds.grow(p2);
        bounds
    }

    /// Object-space centroid of one face.
    pub fn face_centroid(&self, face: usize) -> Vec3 {
        let [a, b, c] = self.faces[face];
        (self.vertices[a as usize].v + self.vertices[b as usize].v + self.vertices[c as usize].v)
            / 3.0
    }

    /// World-space bounding box of the whole mesh (all 8 corners of the
    /// object-space box carried through the transform).
    pub fn world_bounds(&self) -> Aabb {
        let mut object = Aabb::EMPTY;
        for vertex in &self.vertices {
            object.grow(vertex.v);
        }
        if !object.is_valid() {
            return Aabb::EMPTY;
        }

        let lo = object.min();
        let hi = object.max();
        let mut world = Aabb::EMPTY;
        for corner in [
            Vec3::new(lo.x, lo.y, lo.z),
            Vec3::new(hi.x, lo.y, lo.z),
            Vec3::new(lo.x, hi.y, lo.z),
            Vec3::new(hi.x, hi.y, lo.z),
            Vec3::new(lo.x, lo.y, hi.z),
            Vec3::new(hi.x, lo.y, hi.z),
            Vec3::new(lo.x, hi.y, hi.z),
            Vec3::new(hi.x, hi.y, hi.z),
        ] {
            world.grow(self.xform.transform_point3(corner));
        }
        world
    }

    /// Möller-Trumbore ray-triangle intersection against one face, with
    /// the ray in object space.
    ///
    /// Returns the hit distance and the barycentric-interpolated surface
    /// geometry. Degenerate triangles (zero area) and NaN vertex data
    /// fail the determinant or parameter tests and report a miss.
    pub fn intersect_face(&self, face: usize, ray: &SlimRay) -> Option<(f32, LocalGeometry)> {
        let [ia, ib, ic] = self.faces[face];
        let v0 = &self.vertices[ia as usize];
        let v1 = &self.vertices[ib as usize];
        let v2 = &self.vertices[ic as usize];

        let edge1 = v1.v - v0.v;
        let edge2 = v2.v - v0.v;

        let h = ray.direction.cross(edge2);
        let a = edge1.dot(h);

        // Ray parallel to the triangle, or the triangle has no area
        if !(a.abs() >= DET_EPSILON) {
            return None;
        }

        let f = 1.0 / a;
        let s = ray.origin - v0.v;
        let u = f * s.dot(h);

        if !(0.0..=1.0).contains(&u) {
            return None;
        }

        let q = s.cross(edge1);
        let v = f * ray.direction.dot(q);

        if !(v >= 0.0 && u + v <= 1.0) {
            return None;
        }

        let t = f * edge2.dot(q);
        if !(t > T_EPSILON) {
            return None;
        }

        // Interpolate the vertex attributes at (u, v)
        let w = 1.0 - u - v;
        let n = (w * v0.n + u * v1.n + v * v2.n).normalize();
        let tex = w * v0.t + u * v1.t + v * v2.t;

        Some((t, LocalGeometry { n, tex }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_triangle() -> Mesh {
        let vertices = vec![
            Vertex::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::Z, Vec2::new(0.0, 0.0)),
            Vertex::new(Vec3::new(1.0, -1.0, -1.0), Vec3::Z, Vec2::new(1.0, 0.0)),
            Vertex::new(Vec3::new(0.0, 1.0, -1.0), Vec3::Z, Vec2::new(0.5, 1.0)),
        ];
        Mesh::new(1, Mat4::IDENTITY, vertices, vec![[0, 1, 2]])
    }

    #[test]
    fn test_triangle_hit() {
        let mesh = unit_triangle();

        // Ray pointing at triangle center
        let ray = SlimRay::new(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0));
        let (t, geom) = mesh.intersect_face(0, &ray).unwrap();

        assert!((t - 1.0).abs() < 0.001);
        assert!((geom.n - Vec3::Z).length() < 0.001);
    }

    #[test]
    fn test_triangle_miss() {
        let mesh = unit_triangle();

        // Ray pointing away
        let ray = SlimRay::new(Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0));
        assert!(mesh.intersect_face(0, &ray).is_none());
    }

    #[test]
    fn test_degenerate_triangle_misses() {
        // All three vertices collinear: zero area
        let vertices = vec![
            Vertex::new(Vec3::new(0.0, 0.0, -1.0), Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::new(1.0, 0.0, -1.0), Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::new(2.0, 0.0, -1.0), Vec3::Z, Vec2::ZERO),
        ];
        let mesh = Mesh::new(1, Mat4::IDENTITY, vertices, vec![[0, 1, 2]]);

        let ray = SlimRay::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 0.0, -1.0));
        assert!(mesh.intersect_face(0, &ray).is_none());
    }

    #[test]
    fn test_nan_vertex_misses() {
        let vertices = vec![
            Vertex::new(Vec3::new(f32::NAN, -1.0, -1.0), Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::new(1.0, -1.0, -1.0), Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::new(0.0, 1.0, -1.0), Vec3::Z, Vec2::ZERO),
        ];
        let mesh = Mesh::new(1, Mat4::IDENTITY, vertices, vec![[0, 1, 2]]);

        let ray = SlimRay::new(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0));
        assert!(mesh.intersect_face(0, &ray).is_none());
    }

    #[test]
    fn test_barycentric_interpolation() {
        let mesh = unit_triangle();

        // Hit near vertex 2 (apex): texture coords close to (0.5, 1.0)
        let ray = SlimRay::new(Vec3::new(0.0, 0.9, 0.0), Vec3::new(0.0, 0.0, -1.0));
        let (_, geom) = mesh.intersect_face(0, &ray).unwrap();
        assert!((geom.tex.x - 0.5).abs() < 0.01);
        assert!(geom.tex.y > 0.9);
    }

    #[test]
    fn test_mesh_centroid_in_world_space() {
        let vertices = vec![
            Vertex::new(Vec3::ZERO, Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::X, Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::Y, Vec3::Z, Vec2::ZERO),
        ];
        let xform = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let mesh = Mesh::new(1, xform, vertices, vec![[0, 1, 2]]);

        assert!((mesh.centroid - Vec3::new(10.0 + 1.0 / 3.0, 1.0 / 3.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_world_bounds() {
        let vertices = vec![
            Vertex::new(Vec3::new(-1.0, -2.0, -3.0), Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::new(4.0, 5.0, 6.0), Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::ZERO, Vec3::Z, Vec2::ZERO),
        ];
        let xform = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
        let mesh = Mesh::new(1, xform, vertices, vec![[0, 1, 2]]);
        let bounds = mesh.world_bounds();

        assert!((bounds.x.min - 0.0).abs() < 1e-5);
        assert!((bounds.x.max - 5.0).abs() < 1e-5);
        assert!((bounds.y.min + 2.0).abs() < 1e-5);
        assert!((bounds.z.max - 6.0).abs() < 1e-5);
    }
}
