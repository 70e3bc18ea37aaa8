//! Interface to the surrounding physics world.
//!
//! Instances do not own world geometry. During collision they hand the root bounds of
//! their collision tree to a [`WorldCollision`] implementation, and push dynamic nodes
//! out of the spheres, capsules, convex hulls and triangle meshes it reports.

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::types::Aabb;

/// A triangle, wound counter-clockwise seen from its front side.
pub type Triangle = [Vector3<f64>; 3];

/// Geometry of a world shape, in world space.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WorldShape {
    /// A sphere.
    Sphere {
        /// Center.
        center: Vector3<f64>,
        /// Radius.
        radius: f64,
    },
    /// A capsule around a segment.
    Capsule {
        /// Segment end points.
        centers: [Vector3<f64>; 2],
        /// Radius.
        radius: f64,
    },
    /// A convex hull given by its boundary triangles, facing outward.
    Hull {
        /// Boundary faces.
        faces: Vec<Triangle>,
    },
    /// One-sided triangles; nodes collide with their front sides only.
    Mesh {
        /// Triangles.
        triangles: Vec<Triangle>,
    },
    /// A shape the soft body does not collide with.
    Other,
}

impl WorldShape {
    /// Bounding box, or `None` for shapes without supported geometry.
    #[must_use]
    pub fn aabb(&self) -> Option<Aabb> {
        match self {
            Self::Sphere { center, radius } => Some(Aabb::from_sphere(center, *radius)),
            Self::Capsule { centers, radius } => {
                let mut aabb = Aabb::from_sphere(&centers[0], *radius);
                aabb.add_sphere(&centers[1], *radius);
                Some(aabb)
            }
            Self::Hull { faces: triangles } | Self::Mesh { triangles } => {
                triangle_bounds(triangles)
            }
            Self::Other => None,
        }
    }
}

/// Bounds of a triangle list, or `None` when it is empty.
pub(crate) fn triangle_bounds(triangles: &[Triangle]) -> Option<Aabb> {
    let mut aabb = Aabb::empty();
    for v in triangles.iter().flatten() {
        aabb.add_point(v);
    }
    (!aabb.is_empty()).then_some(aabb)
}

/// Broadphase and narrowphase queries against the world.
pub trait WorldCollision {
    /// Identifies a shape between a query and the follow-up calls.
    type Handle: Copy;

    /// Append every shape whose bounds overlap `aabb` to `out`.
    fn query_aabb(&self, aabb: &Aabb, out: &mut Vec<Self::Handle>);

    /// Geometry of a shape.
    fn shape(&self, handle: Self::Handle) -> WorldShape;

    /// Whether contacts between the shape and a body with collision group `mask`
    /// should be resolved.
    fn needs_contact_resolution(&self, handle: Self::Handle, mask: u16) -> bool;
}

/// A flat list of shapes tested one by one.
#[derive(Debug, Clone, Default)]
pub struct ShapeList {
    shapes: Vec<(WorldShape, u16)>,
}

impl ShapeList {
    /// Empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shape colliding with bodies whose collision group intersects `groups`.
    pub fn push(&mut self, shape: WorldShape, groups: u16) -> usize {
        self.shapes.push((shape, groups));
        self.shapes.len() - 1
    }

    /// Replace the geometry of a shape; out-of-range handles are ignored.
    pub fn set_shape(&mut self, handle: usize, shape: WorldShape) {
        if let Some(entry) = self.shapes.get_mut(handle) {
            entry.0 = shape;
        }
    }

    /// Number of shapes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

impl WorldCollision for ShapeList {
    type Handle = usize;

    fn query_aabb(&self, aabb: &Aabb, out: &mut Vec<usize>) {
        for (handle, (shape, _)) in self.shapes.iter().enumerate() {
            if shape.aabb().is_some_and(|bounds| bounds.overlaps(aabb)) {
                out.push(handle);
            }
        }
    }

    fn shape(&self, handle: usize) -> WorldShape {
        self.shapes.get(handle).map_or(WorldShape::Other, |(shape, _)| shape.clone())
    }

    fn needs_contact_resolution(&self, handle: usize, mask: u16) -> bool {
        self.shapes
            .get(handle)
            .is_some_and(|(_, groups)| groups & mask != 0)
    }
}
