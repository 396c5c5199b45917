use crate::{Mat4, Vec3};

/// A bare ray: just an origin and a direction.
///
/// This is the geometric payload that travels through BVH traversal and
/// primitive intersection. The bookkeeping a ray accumulates while moving
/// through the render pipeline lives on the engine's fat ray type, which
/// embeds one of these.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SlimRay {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl SlimRay {
    /// Create a new ray.
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self { origin, direction }
    }

    /// Get the point along the ray at parameter t.
    ///
    /// Returns: origin + t * direction
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Transform the ray by a matrix.
    ///
    /// The direction is deliberately not renormalized: a t value measured
    /// on the transformed ray then refers to the same point as on the
    /// original ray, so hit distances stay comparable across object and
    /// world space.
    pub fn transformed(&self, m: &Mat4) -> SlimRay {
        SlimRay {
            origin: m.transform_point3(self.origin),
            direction: m.transform_vector3(self.direction),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_at() {
        let ray = SlimRay::new(Vec3::ZERO, Vec3::X);

        assert_eq!(ray.at(0.0), Vec3::ZERO);
        assert_eq!(ray.at(1.0), Vec3::X);
        assert_eq!(ray.at(2.0), Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(ray.at(-1.0), Vec3::new(-1.0, 0.0, 0.0));
    }

    #[test]
    fn test_ray_transformed_keeps_t() {
        // Uniform scale by 2: both origin and direction scale, so at(t)
        // lands on the image of the original point for the same t.
        let ray = SlimRay::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0));
        let m = Mat4::from_scale(Vec3::splat(2.0));
        let xformed = ray.transformed(&m);

        let p = ray.at(3.0);
        let q = xformed.at(3.0);
        assert!((q - m.transform_point3(p)).length() < 1e-5);
    }
}
