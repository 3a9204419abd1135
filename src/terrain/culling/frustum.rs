//! View frustum representation and intersection tests.

use crate::terrain::bounds::TileBounds;
use glam::{Mat4, Vec3, Vec4};

/// Six frustum planes as `(normal, distance)` with inward-facing normals:
/// left, right, bottom, top, near, far.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Gribb–Hartmann plane extraction from a view-projection matrix.
    pub fn from_view_projection(view_projection: Mat4) -> Self {
        let r0 = view_projection.row(0);
        let r1 = view_projection.row(1);
        let r2 = view_projection.row(2);
        let r3 = view_projection.row(3);

        let mut planes = [
            r3 + r0, // left
            r3 - r0, // right
            r3 + r1, // bottom
            r3 - r1, // top
            r3 + r2, // near
            r3 - r2, // far
        ];

        for plane in &mut planes {
            let length = plane.truncate().length();
            if length > 0.0 {
                *plane /= length;
            }
        }

        Self { planes }
    }

    /// AABB test via the effective radius of the box along each plane
    /// normal. Conservative: true when the box intersects or is inside.
    pub fn intersects_bounds(&self, bounds: &TileBounds) -> bool {
        let center = bounds.center();
        let extents = bounds.extents();

        for plane in &self.planes {
            let normal = plane.truncate();
            let center_distance = normal.dot(center) + plane.w;
            let radius = normal.x.abs() * extents.x
                + normal.y.abs() * extents.y
                + normal.z.abs() * extents.z;
            if center_distance < -radius {
                return false;
            }
        }
        true
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        for plane in &self.planes {
            let distance = plane.truncate().dot(center) + plane.w;
            if distance < -radius {
                return false;
            }
        }
        true
    }
}
