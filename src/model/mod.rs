//! Immutable topology descriptor shared by simulation instances.
//!
//! A [`FeModel`] describes nodes, constraints, collision shapes and the mapping between
//! nodes and ctrls (the animation-side transforms). It is produced by
//! [`FeModelBuilder`](crate::FeModelBuilder) and shared between instances through an
//! `Arc`. All cross-references are indices into the model's own arrays.
//!
//! Nodes `0..static_node_count` are static: they follow the animation and are never
//! moved by constraints. Element arrays are ordered so elements touching static nodes
//! come first, and the `*_counts` arrays record where each class ends.

mod elements;
mod tree;

pub use elements::{
    AxialEdgeBend, CollisionPlane, CollisionSphere, CtrlOffset, CtrlOsOffset, FitMatrix,
    FitWeight, FollowNode, NodeBase, NodeIntegrator, Quad, ReverseOffset, Rod, SimdQuad,
    SimdRod, SimdTri, SphereRigid, SpringIntegrator, TaperedCapsuleRigid,
    TaperedCapsuleStretch, Tri, WorldCollisionParams,
};
pub use tree::CollisionTree;

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_ROPE_SIZE, FeModelDefaults};
use crate::error::{Result, SoftbodyError, check_dynamic, check_index, check_rod_limits};
use crate::types::{FeFlags, Transform};

/// Topology and rest state of a soft body.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeModel {
    /// Total node count.
    pub node_count: usize,
    /// Leading nodes that follow the animation.
    pub static_node_count: usize,
    /// Leading static nodes whose rotation is not written back.
    pub rot_lock_static_node_count: usize,
    /// Number of ctrls (animation transforms).
    pub ctrl_count: usize,

    /// Ctrl of every node; empty means identity.
    pub node_to_ctrl: Vec<usize>,
    /// Node of every ctrl; empty means identity.
    pub ctrl_to_node: Vec<Option<usize>>,

    /// Distance constraints.
    pub rods: Vec<Rod>,
    /// Batched distance constraints.
    pub simd_rods: Vec<SimdRod>,
    /// Quads; `quad_counts` = `[all, >=1 static, >=2 static]`.
    pub quads: Vec<Quad>,
    /// Quad class boundaries.
    pub quad_counts: [usize; 3],
    /// Batched quads.
    pub simd_quads: Vec<SimdQuad>,
    /// Batched quad class boundaries, counted in batches.
    pub simd_quad_counts: [usize; 3],
    /// Tris; `tri_counts` = `[all, >=1 static, >=2 static]`.
    pub tris: Vec<Tri>,
    /// Tri class boundaries.
    pub tri_counts: [usize; 3],
    /// Batched tris.
    pub simd_tris: Vec<SimdTri>,
    /// Batched tri class boundaries, counted in batches.
    pub simd_tri_counts: [usize; 3],
    /// Edge bends.
    pub axial_edge_bends: Vec<AxialEdgeBend>,
    /// Springs.
    pub springs: Vec<SpringIntegrator>,

    /// Per-node integration parameters; empty or one per node.
    pub node_integrators: Vec<NodeIntegrator>,
    /// Inverse masses, 0 for static nodes.
    pub node_inv_masses: Vec<f64>,
    /// Legacy stretch force per node; empty or one per node.
    #[cfg_attr(feature = "serde", serde(default))]
    pub legacy_stretch_force: Vec<f64>,
    /// Collision radius per dynamic node; may be empty.
    #[cfg_attr(feature = "serde", serde(default))]
    pub node_collision_radii: Vec<f64>,

    /// Nodes dragged by other nodes.
    pub follow_nodes: Vec<FollowNode>,
    /// Ctrls placed relative to other ctrls.
    pub ctrl_offsets: Vec<CtrlOffset>,
    /// Ctrls placed at their parent's origin plus the rope offset.
    pub ctrl_os_offsets: Vec<CtrlOsOffset>,
    /// Rope ends followed by rope node chains; see [`FeModel::rope_count`].
    pub ropes: Vec<usize>,
    /// Number of ropes.
    pub rope_count: usize,
    /// Node frames reconstructed from node pairs.
    pub node_bases: Vec<NodeBase>,
    /// Bones placed by an offset point.
    pub reverse_offsets: Vec<ReverseOffset>,
    /// Dynamic nodes with no reconstructed rotation.
    pub free_nodes: Vec<usize>,

    /// Shape-matched ctrls.
    pub fit_matrices: Vec<FitMatrix>,
    /// Fit matrix weights.
    pub fit_weights: Vec<FitWeight>,
    /// Fit matrix class boundaries: `[all, end of one-weight, end of two-weight]`.
    pub fit_matrix_counts: [usize; 3],
    /// Rest pose, one transform per ctrl.
    pub init_pose: Vec<Transform>,

    /// Ctrl-attached spheres; inclusive ones come first.
    pub collision_spheres: Vec<CollisionSphere>,
    /// `[total, inclusive]`.
    pub collision_sphere_counts: [usize; 2],
    /// Ctrl-attached planes.
    pub collision_planes: Vec<CollisionPlane>,
    /// Ground parameters per node range.
    pub world_collision_params: Vec<WorldCollisionParams>,
    /// Nodes referenced by [`WorldCollisionParams`].
    pub world_collision_nodes: Vec<usize>,
    /// Tapered capsules spanned between nodes.
    pub tapered_capsule_stretches: Vec<TaperedCapsuleStretch>,
    /// Tapered capsules attached to ctrls.
    pub tapered_capsule_rigids: Vec<TaperedCapsuleRigid>,
    /// Spheres attached to ctrls.
    pub sphere_rigids: Vec<SphereRigid>,
    /// Broadphase tree over the dynamic nodes.
    pub tree: CollisionTree,

    /// Content hash per ctrl, used to carry state across model replacement.
    pub ctrl_hash: Vec<u32>,
    /// Optional ctrl names.
    #[cfg_attr(feature = "serde", serde(default))]
    pub ctrl_names: Vec<String>,
    /// Feature flags.
    pub flags: FeFlags,
    /// Authored tunables.
    pub defaults: FeModelDefaults,
    /// Offset applied to ctrl os-offsets.
    pub rope_offset: Vector3<f64>,
}

impl Default for FeModel {
    fn default() -> Self {
        Self {
            node_count: 0,
            static_node_count: 0,
            rot_lock_static_node_count: 0,
            ctrl_count: 0,
            node_to_ctrl: Vec::new(),
            ctrl_to_node: Vec::new(),
            rods: Vec::new(),
            simd_rods: Vec::new(),
            quads: Vec::new(),
            quad_counts: [0; 3],
            simd_quads: Vec::new(),
            simd_quad_counts: [0; 3],
            tris: Vec::new(),
            tri_counts: [0; 3],
            simd_tris: Vec::new(),
            simd_tri_counts: [0; 3],
            axial_edge_bends: Vec::new(),
            springs: Vec::new(),
            node_integrators: Vec::new(),
            node_inv_masses: Vec::new(),
            legacy_stretch_force: Vec::new(),
            node_collision_radii: Vec::new(),
            follow_nodes: Vec::new(),
            ctrl_offsets: Vec::new(),
            ctrl_os_offsets: Vec::new(),
            ropes: Vec::new(),
            rope_count: 0,
            node_bases: Vec::new(),
            reverse_offsets: Vec::new(),
            free_nodes: Vec::new(),
            fit_matrices: Vec::new(),
            fit_weights: Vec::new(),
            fit_matrix_counts: [0; 3],
            init_pose: Vec::new(),
            collision_spheres: Vec::new(),
            collision_sphere_counts: [0; 2],
            collision_planes: Vec::new(),
            world_collision_params: Vec::new(),
            world_collision_nodes: Vec::new(),
            tapered_capsule_stretches: Vec::new(),
            tapered_capsule_rigids: Vec::new(),
            sphere_rigids: Vec::new(),
            tree: CollisionTree::default(),
            ctrl_hash: Vec::new(),
            ctrl_names: Vec::new(),
            flags: FeFlags::empty(),
            defaults: FeModelDefaults::default(),
            rope_offset: Vector3::new(0.0, -DEFAULT_ROPE_SIZE, 0.0),
        }
    }
}

impl FeModel {
    /// Number of nodes moved by the simulation.
    #[must_use]
    pub fn dynamic_node_count(&self) -> usize {
        self.node_count - self.static_node_count
    }

    /// Ctrl driving `node`.
    #[must_use]
    #[inline]
    pub fn node_to_ctrl(&self, node: usize) -> usize {
        self.node_to_ctrl.get(node).copied().unwrap_or(node)
    }

    /// Node simulated for `ctrl`, if any.
    #[must_use]
    #[inline]
    pub fn ctrl_to_node(&self, ctrl: usize) -> Option<usize> {
        if self.ctrl_to_node.is_empty() {
            (ctrl < self.node_count).then_some(ctrl)
        } else {
            self.ctrl_to_node.get(ctrl).copied().flatten()
        }
    }

    /// Whether the collide phase needs the broadphase tree.
    #[must_use]
    pub fn has_tree_collision(&self) -> bool {
        !self.tapered_capsule_stretches.is_empty()
            || !self.tapered_capsule_rigids.is_empty()
            || !self.sphere_rigids.is_empty()
            || self.flags.has_world_shape_collision()
    }

    /// Whether any primitive can glue nodes.
    #[must_use]
    pub fn has_glue(&self) -> bool {
        self.has_tree_collision()
            || !self.collision_planes.is_empty()
            || !self.collision_spheres.is_empty()
    }

    /// Whether the model uses the legacy numerics.
    #[must_use]
    pub fn is_uninertial(&self) -> bool {
        self.flags.contains(FeFlags::UNINERTIAL_CONSTRAINTS)
    }

    /// Index of the first entry after the rope ends.
    #[must_use]
    pub fn rope_range(&self, rope: usize) -> (usize, usize) {
        let begin = if rope == 0 {
            self.rope_count
        } else {
            self.ropes[rope - 1]
        };
        (begin, self.ropes[rope])
    }

    /// Check every index and class boundary.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        let n = self.node_count;
        if self.static_node_count > n {
            return Err(SoftbodyError::invalid_topology(format!(
                "static node count {} exceeds node count {n}",
                self.static_node_count
            )));
        }
        if self.rot_lock_static_node_count > self.static_node_count {
            return Err(SoftbodyError::invalid_topology(
                "rot-lock static nodes must be a prefix of the static nodes",
            ));
        }
        if self.node_inv_masses.len() != n {
            return Err(SoftbodyError::model_mismatch(format!(
                "{} inverse masses for {n} nodes",
                self.node_inv_masses.len()
            )));
        }
        for (name, len) in [
            ("node integrators", self.node_integrators.len()),
            ("legacy stretch forces", self.legacy_stretch_force.len()),
        ] {
            if len != 0 && len != n {
                return Err(SoftbodyError::model_mismatch(format!(
                    "{len} {name} for {n} nodes"
                )));
            }
        }
        let dynamic = self.dynamic_node_count();
        if !self.node_collision_radii.is_empty() && self.node_collision_radii.len() != dynamic {
            return Err(SoftbodyError::model_mismatch(format!(
                "{} collision radii for {dynamic} dynamic nodes",
                self.node_collision_radii.len()
            )));
        }
        if !self.node_to_ctrl.is_empty() {
            if self.node_to_ctrl.len() != n {
                return Err(SoftbodyError::model_mismatch("node-to-ctrl map size"));
            }
            for &ctrl in &self.node_to_ctrl {
                check_index("ctrl", ctrl, self.ctrl_count)?;
            }
        }
        for node in self.ctrl_to_node.iter().flatten() {
            check_index("node", *node, n)?;
        }
        if self.init_pose.len() != self.ctrl_count && !self.init_pose.is_empty() {
            return Err(SoftbodyError::model_mismatch("init pose size"));
        }

        for rod in &self.rods {
            let [a, b] = rod.nodes;
            check_index("rod node", a, n)?;
            check_index("rod node", b, n)?;
            check_rod_limits(a, b, rod.min_dist, rod.max_dist)?;
            let moves_static = (a < self.static_node_count && rod.weight0 > 0.0)
                || (b < self.static_node_count && rod.weight0 < 1.0);
            if moves_static {
                return Err(SoftbodyError::invalid_constraint(format!(
                    "rod {a}-{b} would move its static end"
                )));
            }
        }
        for quad in &self.quads {
            for &node in &quad.nodes {
                check_index("quad node", node, n)?;
            }
        }
        for tri in &self.tris {
            for &node in &tri.nodes {
                check_index("tri node", node, n)?;
            }
        }
        for bend in &self.axial_edge_bends {
            for &node in &bend.nodes {
                check_index("bend node", node, n)?;
            }
        }
        for spring in &self.springs {
            for &node in &spring.nodes {
                check_index("spring node", node, n)?;
            }
        }
        for follow in &self.follow_nodes {
            check_index("follow parent", follow.parent, n)?;
            check_index("follow child", follow.child, n)?;
        }
        for &node in self.ropes.iter().skip(self.rope_count) {
            check_index("rope node", node, n)?;
        }
        for &end in self.ropes.iter().take(self.rope_count) {
            if end > self.ropes.len() {
                return Err(SoftbodyError::invalid_topology("rope end out of range"));
            }
        }
        for &node in &self.world_collision_nodes {
            check_index("world collision node", node, n)?;
            check_dynamic("world collision node", node, self.static_node_count)?;
        }
        for sphere in &self.collision_spheres {
            check_index("sphere node", sphere.child_node, n)?;
            check_dynamic("sphere node", sphere.child_node, self.static_node_count)?;
        }
        for plane in &self.collision_planes {
            check_index("plane node", plane.child_node, n)?;
            check_dynamic("plane node", plane.child_node, self.static_node_count)?;
        }
        for params in &self.world_collision_params {
            if params.list_begin > params.list_end
                || params.list_end > self.world_collision_nodes.len()
            {
                return Err(SoftbodyError::invalid_topology(
                    "world collision node range out of bounds",
                ));
            }
        }
        for weight in &self.fit_weights {
            check_index("fit weight node", weight.node, n)?;
        }
        for fit in &self.fit_matrices {
            check_index("fit node", fit.node, n)?;
            check_index("fit ctrl", fit.ctrl, self.ctrl_count)?;
            if fit.end > self.fit_weights.len() {
                return Err(SoftbodyError::invalid_topology("fit matrix end out of range"));
            }
        }

        if self.quad_counts[0] != self.quads.len()
            || self.quad_counts[2] > self.quad_counts[1]
            || self.quad_counts[1] > self.quad_counts[0]
        {
            return Err(SoftbodyError::invalid_topology("quad class boundaries"));
        }
        if self.tri_counts[0] != self.tris.len()
            || self.tri_counts[2] > self.tri_counts[1]
            || self.tri_counts[1] > self.tri_counts[0]
        {
            return Err(SoftbodyError::invalid_topology("tri class boundaries"));
        }
        if self.simd_quad_counts[0] != self.simd_quads.len()
            || self.simd_tri_counts[0] != self.simd_tris.len()
        {
            return Err(SoftbodyError::invalid_topology("batched class boundaries"));
        }

        if dynamic > 0 {
            let tree = &self.tree;
            if tree.parents.len() != 2 * dynamic - 1
                || tree.children.len() != dynamic - 1
                || tree.collision_masks.len() != 2 * dynamic - 1
            {
                return Err(SoftbodyError::invalid_topology(format!(
                    "collision tree sized for {} leaves, model has {dynamic} dynamic nodes",
                    tree.leaf_count()
                )));
            }
        }
        Ok(())
    }
}
