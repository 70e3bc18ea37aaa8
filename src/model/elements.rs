//! Constraint, collision and mapping records stored in a [`FeModel`](super::FeModel).
//!
//! Every cross-reference is a node, ctrl or element index into the owning model.

use nalgebra::{UnitQuaternion, Vector2, Vector3, Vector4};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_GRAVITY;
use crate::simd::{F64x4, Vec3x4};
use crate::types::Transform;

/// Distance constraint between two nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Rod {
    /// End nodes.
    pub nodes: [usize; 2],
    /// Longest allowed distance, before scaling.
    pub max_dist: f64,
    /// Shortest allowed distance, before scaling.
    pub min_dist: f64,
    /// Share of the correction taken by node 0, from inverse masses.
    pub weight0: f64,
    /// Fraction of the violation corrected per relaxation.
    pub relaxation_factor: f64,
}

/// Four rods relaxed together; no two lanes share a node unless one duplicates another.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimdRod {
    /// Node indices per end, per lane.
    pub nodes: [[usize; 4]; 2],
    /// Longest allowed distance per lane.
    pub max_dist: F64x4,
    /// Shortest allowed distance per lane.
    pub min_dist: F64x4,
    /// Node 0 weight per lane.
    pub weight0: F64x4,
    /// Relaxation factor per lane.
    pub relaxation_factor: F64x4,
}

/// Four-node shape-matching element.
///
/// `shape[i].xyz` is corner `i` in the element's local frame relative to its center
/// of mass, and `shape[i].w` is the corner's mass weight (0 for static corners).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Quad {
    /// Corner nodes; static corners come first.
    pub nodes: [usize; 4],
    /// Allowed slack.
    #[cfg_attr(feature = "serde", serde(default))]
    pub slack: f64,
    /// Rest shape and weights.
    pub shape: [Vector4<f64>; 4],
}

/// Four quads relaxed together.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimdQuad {
    /// Node indices per corner, per lane.
    pub nodes: [[usize; 4]; 4],
    /// Rest shape per corner.
    pub shape: [Vec3x4; 4],
    /// Corner weights per corner.
    pub weights: [F64x4; 4],
}

/// Three-node shape-matching element, stored in its own 2D frame.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tri {
    /// Corner nodes; static corners come first.
    pub nodes: [usize; 3],
    /// Mass weight of corner 1.
    pub w1: f64,
    /// Mass weight of corner 2.
    pub w2: f64,
    /// Rest length of edge 0-1.
    pub v1x: f64,
    /// Rest position of corner 2 in the tri frame.
    pub v2: Vector2<f64>,
}

/// Four tris relaxed together.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimdTri {
    /// Node indices per corner, per lane.
    pub nodes: [[usize; 4]; 3],
    /// Corner 1 weight per lane.
    pub w1: F64x4,
    /// Corner 2 weight per lane.
    pub w2: F64x4,
    /// Edge 0-1 rest length per lane.
    pub v1x: F64x4,
    /// Corner 2 rest x per lane.
    pub v2x: F64x4,
    /// Corner 2 rest y per lane.
    pub v2y: F64x4,
}

/// Bend across an edge shared by two quads.
///
/// Nodes 0 and 1 span the edge, nodes 2..=5 are the two virtual-edge pairs.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AxialEdgeBend {
    /// Interpolation along the edge.
    pub te: f64,
    /// Interpolation along the virtual edge.
    pub tv: f64,
    /// Rest distance between the edge and virtual edge points.
    pub dist: f64,
    /// Correction weights for the edge ends and the two pairs.
    pub weights: [f64; 4],
    /// Participating nodes.
    pub nodes: [usize; 6],
}

/// Damped spring integrated as an impulse on previous positions.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpringIntegrator {
    /// End nodes.
    pub nodes: [usize; 2],
    /// Rest length.
    pub rest_length: f64,
    /// Stiffness, pre-multiplied by the end masses.
    pub spring_constant: f64,
    /// Damping, pre-multiplied by the end masses.
    pub spring_damping: f64,
    /// Share of the impulse taken by node 0.
    pub node_weight0: f64,
}

/// Per-node integration parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeIntegrator {
    /// Velocity damping per second.
    pub point_damping: f64,
    /// Spring-like pull toward the animated position.
    pub animation_force_attraction: f64,
    /// Direct positional pull toward the animated position.
    pub animation_vertex_attraction: f64,
    /// Gravity acceleration for this node.
    pub gravity: f64,
}

impl Default for NodeIntegrator {
    fn default() -> Self {
        Self {
            point_damping: 0.0,
            animation_force_attraction: 0.0,
            animation_vertex_attraction: 0.0,
            gravity: DEFAULT_GRAVITY,
        }
    }
}

/// A dynamic node dragged along by another node's motion.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FollowNode {
    /// Leading node.
    pub parent: usize,
    /// Following node.
    pub child: usize,
    /// Fraction of the parent's motion applied.
    pub weight: f64,
}

/// Child ctrl placed at a fixed offset in its parent's frame.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CtrlOffset {
    /// Parent ctrl.
    pub ctrl_parent: usize,
    /// Child ctrl.
    pub ctrl_child: usize,
    /// Offset in the parent frame, before scaling.
    pub offset: Vector3<f64>,
}

/// Child ctrl placed at the parent's origin plus the rope offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CtrlOsOffset {
    /// Parent ctrl.
    pub ctrl_parent: usize,
    /// Child ctrl.
    pub ctrl_child: usize,
}

/// Frame of a node reconstructed from two node-pair directions.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeBase {
    /// Node whose ctrl receives the frame.
    pub node: usize,
    /// X direction start node.
    pub x0: usize,
    /// X direction end node.
    pub x1: usize,
    /// Y direction start node.
    pub y0: usize,
    /// Y direction end node.
    pub y1: usize,
    /// Rotation applied after the reconstructed frame.
    pub q_adjust: UnitQuaternion<f64>,
}

/// Bone placed so that its offset point lands on a node.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReverseOffset {
    /// Ctrl of the bone being placed.
    pub bone_ctrl: usize,
    /// Node the offset point tracks.
    pub target_node: usize,
    /// Offset in the bone frame.
    pub offset: Vector3<f64>,
}

/// Shape-matched ctrl driven by a weighted set of nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitMatrix {
    /// Bind transform relative to the fitted frame.
    pub bone: Transform,
    /// Rest center of mass of the weighted nodes.
    pub center: Vector3<f64>,
    /// Exclusive end of this matrix's weights.
    pub end: usize,
    /// Node placed at the fitted center.
    pub node: usize,
    /// Ctrl receiving the fitted transform.
    pub ctrl: usize,
    /// First weight that refers to a dynamic node.
    pub begin_dynamic: usize,
}

/// One node's contribution to a fit matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitWeight {
    /// Normalized mass weight.
    pub weight: f64,
    /// Contributing node.
    pub node: usize,
}

/// Sphere attached to a ctrl that keeps a node inside (inclusive) or outside (exclusive).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CollisionSphere {
    /// Ctrl carrying the sphere.
    pub ctrl_parent: usize,
    /// Node constrained by the sphere.
    pub child_node: usize,
    /// Inverse squared radius for inclusive spheres, radius for exclusive ones.
    pub r_factor: f64,
    /// Sphere center in the ctrl frame.
    pub origin: Vector3<f64>,
    /// Glue strength.
    #[cfg_attr(feature = "serde", serde(default))]
    pub stickiness: f64,
}

/// Plane attached to a ctrl that keeps a node on its positive side.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CollisionPlane {
    /// Ctrl carrying the plane.
    pub ctrl_parent: usize,
    /// Node constrained by the plane.
    pub child_node: usize,
    /// Plane normal in the ctrl frame.
    pub normal: Vector3<f64>,
    /// Plane offset along the normal.
    pub offset: f64,
    /// Glue strength.
    #[cfg_attr(feature = "serde", serde(default))]
    pub stickiness: f64,
}

/// Ground friction for a range of [`FeModel::world_collision_nodes`](super::FeModel).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorldCollisionParams {
    /// Fraction of vertical motion kept on contact.
    pub world_friction: f64,
    /// Horizontal friction on contact.
    pub ground_friction: f64,
    /// First entry in the node list.
    pub list_begin: usize,
    /// Exclusive end in the node list.
    pub list_end: usize,
}

/// Tapered capsule spanned between two simulated nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TaperedCapsuleStretch {
    /// End nodes; equal nodes describe a sphere.
    pub nodes: [usize; 2],
    /// Node collision groups this capsule pushes.
    pub collision_mask: u16,
    /// End radii, before scaling.
    pub radii: [f64; 2],
    /// Glue strength.
    #[cfg_attr(feature = "serde", serde(default))]
    pub stickiness: f64,
}

/// Tapered capsule rigidly attached to a node's ctrl.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TaperedCapsuleRigid {
    /// Node whose ctrl carries the capsule.
    pub node: usize,
    /// Node collision groups this capsule pushes.
    pub collision_mask: u16,
    /// End centers in the ctrl frame, before scaling.
    pub centers: [Vector3<f64>; 2],
    /// End radii, before scaling.
    pub radii: [f64; 2],
    /// Glue strength.
    #[cfg_attr(feature = "serde", serde(default))]
    pub stickiness: f64,
}

/// Sphere rigidly attached to a node's ctrl.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SphereRigid {
    /// Node whose ctrl carries the sphere.
    pub node: usize,
    /// Node collision groups this sphere pushes.
    pub collision_mask: u16,
    /// Center in the ctrl frame, before scaling.
    pub center: Vector3<f64>,
    /// Radius, before scaling.
    pub radius: f64,
    /// Glue strength.
    #[cfg_attr(feature = "serde", serde(default))]
    pub stickiness: f64,
}
