//! Core types shared by the model and the simulation instance.
//!
//! - [`SoftbodyId`] - Unique identifier for simulation instances
//! - [`FeFlags`] - Model-level feature flags
//! - [`WorldShapeMask`] - World shape kinds a model collides with
//! - [`Aabb`] - Axis-aligned box used by the collision tree
//! - [`Transform`] - Rigid transform of a ctrl

use nalgebra::{Isometry3, Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Rigid transform of a ctrl (rotation plus origin).
pub type Transform = Isometry3<f64>;

/// Unique identifier for a simulation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SoftbodyId(pub u64);

impl SoftbodyId {
    /// Create a new soft body ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for SoftbodyId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SoftbodyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Softbody({})", self.0)
    }
}

/// Global counter for soft body IDs.
static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Generate a new unique soft body ID.
pub fn next_softbody_id() -> SoftbodyId {
    SoftbodyId(NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
}

bitflags::bitflags! {
    /// Model-level feature flags, computed by the builder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct FeFlags: u32 {
        /// Constraints do not add velocity; selects the legacy S1 numerics.
        const UNINERTIAL_CONSTRAINTS = 1 << 4;
        /// Run a follow-the-leader rod pass on the last iteration.
        const ENABLE_FTL = 1 << 5;
        /// At least one node integrator has non-zero point damping.
        const HAS_NODE_DAMPING = 1 << 8;
        /// At least one node integrator has animation force attraction.
        const HAS_ANIMATION_FORCE_ATTRACTION = 1 << 9;
        /// At least one node integrator has animation vertex attraction.
        const HAS_ANIMATION_VERTEX_ATTRACTION = 1 << 10;
        /// At least one node integrator has non-default gravity.
        const HAS_CUSTOM_GRAVITY = 1 << 11;
        /// Stretch constraints damp velocity.
        const HAS_STRETCH_VELOCITY_DAMPING = 1 << 12;
        /// Collide with world spheres.
        const WORLD_COLLIDE_SPHERES = 1 << 16;
        /// Collide with world capsules.
        const WORLD_COLLIDE_CAPSULES = 1 << 17;
        /// Collide with world convex hulls.
        const WORLD_COLLIDE_HULLS = 1 << 18;
        /// Collide with world triangle meshes.
        const WORLD_COLLIDE_MESHES = 1 << 19;
    }
}

/// Bit offset of the world shape collision mask inside [`FeFlags`].
pub const WORLD_SHAPE_COLLISION_SHIFT: u32 = 16;

bitflags::bitflags! {
    /// World shape kinds enabled for collision.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct WorldShapeMask: u32 {
        /// Spheres.
        const SPHERE = 1 << 0;
        /// Capsules.
        const CAPSULE = 1 << 1;
        /// Convex hulls.
        const HULL = 1 << 2;
        /// Triangle meshes.
        const MESH = 1 << 3;
    }
}

impl FeFlags {
    /// Extract the world shape collision mask.
    #[must_use]
    pub const fn world_shape_mask(self) -> WorldShapeMask {
        WorldShapeMask::from_bits_truncate(self.bits() >> WORLD_SHAPE_COLLISION_SHIFT)
    }

    /// Whether any world shape collision is enabled.
    #[must_use]
    pub const fn has_world_shape_collision(self) -> bool {
        !self.world_shape_mask().is_empty()
    }
}

/// An axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Aabb {
    /// Minimum corner.
    pub min: Point3<f64>,
    /// Maximum corner.
    pub max: Point3<f64>,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl Aabb {
    /// Create a box from its corners.
    #[must_use]
    pub const fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// An inverted box that any union will overwrite.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            min: Point3::new(f64::MAX, f64::MAX, f64::MAX),
            max: Point3::new(f64::MIN, f64::MIN, f64::MIN),
        }
    }

    /// A box around a sphere.
    #[must_use]
    pub fn from_sphere(center: &Vector3<f64>, radius: f64) -> Self {
        let r = Vector3::repeat(radius);
        Self {
            min: Point3::from(center - r),
            max: Point3::from(center + r),
        }
    }

    /// Whether the box contains no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Grow the box to include a point.
    pub fn add_point(&mut self, p: &Vector3<f64>) {
        self.min = self.min.inf(&Point3::from(*p));
        self.max = self.max.sup(&Point3::from(*p));
    }

    /// Grow the box to include a sphere.
    pub fn add_sphere(&mut self, center: &Vector3<f64>, radius: f64) {
        let r = Vector3::repeat(radius);
        self.min = self.min.inf(&Point3::from(center - r));
        self.max = self.max.sup(&Point3::from(center + r));
    }

    /// Grow the box to include another box.
    pub fn union(&mut self, other: &Self) {
        self.min = self.min.inf(&other.min);
        self.max = self.max.sup(&other.max);
    }

    /// Expand every face outward by `amount`.
    #[must_use]
    pub fn expanded(&self, amount: f64) -> Self {
        let r = Vector3::repeat(amount);
        Self {
            min: self.min - r,
            max: self.max + r,
        }
    }

    /// Separating-axis overlap test; touching boxes overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Whether the point lies inside or on the box.
    #[must_use]
    pub fn contains(&self, p: &Vector3<f64>) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// Center of the box.
    #[must_use]
    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softbody_id() {
        let id = SoftbodyId::new(42);
        assert_eq!(id.raw(), 42);
        assert_eq!(id.to_string(), "Softbody(42)");

        let id2: SoftbodyId = 42.into();
        assert_eq!(id, id2);
    }

    #[test]
    fn test_id_generator_unique() {
        let a = next_softbody_id();
        let b = next_softbody_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_world_shape_mask_from_flags() {
        let flags = FeFlags::ENABLE_FTL | FeFlags::WORLD_COLLIDE_CAPSULES;
        assert_eq!(flags.world_shape_mask(), WorldShapeMask::CAPSULE);
        assert!(flags.has_world_shape_collision());
        assert!(!FeFlags::ENABLE_FTL.has_world_shape_collision());
    }

    #[test]
    fn test_aabb_union_and_overlap() {
        let mut a = Aabb::empty();
        assert!(a.is_empty());
        a.add_point(&Vector3::new(0.0, 0.0, 0.0));
        a.add_point(&Vector3::new(1.0, 2.0, 3.0));
        assert!(!a.is_empty());
        assert!(a.contains(&Vector3::new(0.5, 1.0, 1.5)));

        let b = Aabb::from_sphere(&Vector3::new(2.0, 2.0, 2.0), 1.0);
        assert!(a.overlaps(&b));
        let c = Aabb::from_sphere(&Vector3::new(5.0, 5.0, 5.0), 1.0);
        assert!(!a.overlaps(&c));
        assert!(a.expanded(2.0).overlaps(&c));

        let mut u = a;
        u.union(&c);
        assert_eq!(u.max, Point3::new(6.0, 6.0, 6.0));
    }
}
