//! Construction of [`FeModel`] descriptors from authored nodes and elements.
//!
//! The builder takes nodes in rest pose plus the elements connecting them, and derives
//! everything the runtime needs: rod weights, quad and tri rest shapes, class ordering
//! by static corner count, conflict-free 4-lane batches, the broadphase tree and the
//! model flags.
//!
//! # Example
//!
//! ```
//! use fe_softbody::FeModelBuilder;
//! use nalgebra::Vector3;
//!
//! let mut builder = FeModelBuilder::new();
//! let anchor = builder.add_static_node(Vector3::new(0.0, 0.0, 0.0));
//! let tip = builder.add_dynamic_node(Vector3::new(0.0, 0.0, -10.0), 1.0);
//! builder.add_rod(anchor, tip);
//! let model = builder.build().unwrap();
//!
//! assert_eq!(model.node_count, 2);
//! assert_eq!(model.static_node_count, 1);
//! assert_eq!(model.rods[0].weight0, 0.0);
//! ```

use hashbrown::HashSet;
use nalgebra::{UnitQuaternion, Vector3, Vector4};
use tracing::{debug, warn};

use crate::basis::{Basis, TriBasis};
use crate::config::{DEFAULT_GRAVITY, DEFAULT_ROPE_SIZE, FeModelDefaults};
use crate::error::{Result, SoftbodyError, check_dynamic, check_index, check_rod_limits};
use crate::model::{
    AxialEdgeBend, CollisionPlane, CollisionSphere, CollisionTree, CtrlOffset, CtrlOsOffset,
    FeModel, FitMatrix, FitWeight, FollowNode, NodeBase, NodeIntegrator, Quad, ReverseOffset,
    Rod, SimdQuad, SimdRod, SimdTri, SphereRigid, SpringIntegrator, TaperedCapsuleRigid,
    TaperedCapsuleStretch, Tri, WorldCollisionParams,
};
use crate::simd::Vec3x4;
use crate::types::{FeFlags, Transform, WORLD_SHAPE_COLLISION_SHIFT, WorldShapeMask};

/// Mass floor used when turning inverse masses into shape weights.
const MIN_INV_MASS: f64 = 1e-6;

/// Authored description of one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeDesc {
    /// Rest position.
    pub position: Vector3<f64>,
    /// Rest orientation of the node's ctrl.
    pub rotation: UnitQuaternion<f64>,
    /// Mass; ignored for static nodes.
    pub mass: f64,
    /// Static nodes follow the animation.
    pub is_static: bool,
    /// Collision radius.
    pub collision_radius: f64,
    /// Collision groups.
    pub collision_mask: u16,
    /// Integration parameters.
    pub integrator: Option<NodeIntegrator>,
    /// Legacy stretch force.
    pub legacy_stretch_force: f64,
}

impl NodeDesc {
    /// A dynamic node with the given mass.
    #[must_use]
    pub fn dynamic(position: Vector3<f64>, mass: f64) -> Self {
        Self {
            position,
            rotation: UnitQuaternion::identity(),
            mass,
            is_static: false,
            collision_radius: 0.0,
            collision_mask: u16::MAX,
            integrator: None,
            legacy_stretch_force: 0.0,
        }
    }

    /// A static node.
    #[must_use]
    pub fn fixed(position: Vector3<f64>) -> Self {
        Self {
            is_static: true,
            mass: 0.0,
            ..Self::dynamic(position, 1.0)
        }
    }

    /// Set the collision radius.
    #[must_use]
    pub fn with_radius(mut self, radius: f64) -> Self {
        self.collision_radius = radius;
        self
    }

    /// Set the collision groups.
    #[must_use]
    pub fn with_mask(mut self, mask: u16) -> Self {
        self.collision_mask = mask;
        self
    }

    /// Set the integration parameters.
    #[must_use]
    pub fn with_integrator(mut self, integrator: NodeIntegrator) -> Self {
        self.integrator = Some(integrator);
        self
    }

    /// Set the rest orientation.
    #[must_use]
    pub fn with_rotation(mut self, rotation: UnitQuaternion<f64>) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set the legacy stretch force.
    #[must_use]
    pub fn with_legacy_stretch_force(mut self, force: f64) -> Self {
        self.legacy_stretch_force = force;
        self
    }

    fn inv_mass(&self) -> f64 {
        if self.is_static || self.mass <= 0.0 {
            0.0
        } else {
            1.0 / self.mass
        }
    }
}

#[derive(Debug, Clone)]
struct CtrlDesc {
    name: Option<String>,
    pose: Transform,
    node: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct RodDesc {
    nodes: [usize; 2],
    min_dist: Option<f64>,
    max_dist: Option<f64>,
    relaxation_factor: f64,
}

#[derive(Debug, Clone)]
struct FitDesc {
    ctrl: usize,
    node: usize,
    nodes: Vec<usize>,
}

/// Incremental builder for [`FeModel`].
#[derive(Debug, Clone)]
pub struct FeModelBuilder {
    nodes: Vec<NodeDesc>,
    node_ctrl: Vec<usize>,
    ctrls: Vec<CtrlDesc>,
    rods: Vec<RodDesc>,
    quads: Vec<[usize; 4]>,
    tris: Vec<[usize; 3]>,
    bends: Vec<([usize; 6], f64, f64)>,
    springs: Vec<([usize; 2], f64, f64)>,
    follow_nodes: Vec<FollowNode>,
    ctrl_offsets: Vec<CtrlOffset>,
    ctrl_os_offsets: Vec<CtrlOsOffset>,
    ropes: Vec<Vec<usize>>,
    node_bases: Vec<NodeBase>,
    reverse_offsets: Vec<ReverseOffset>,
    free_nodes: Vec<usize>,
    fits: Vec<FitDesc>,
    inclusive_spheres: Vec<CollisionSphere>,
    exclusive_spheres: Vec<CollisionSphere>,
    planes: Vec<CollisionPlane>,
    world_collision: Vec<(Vec<usize>, f64, f64)>,
    tapered_capsule_stretches: Vec<TaperedCapsuleStretch>,
    tapered_capsule_rigids: Vec<TaperedCapsuleRigid>,
    sphere_rigids: Vec<SphereRigid>,
    flags: FeFlags,
    rot_lock_static_node_count: usize,
    defaults: FeModelDefaults,
    rope_offset: Vector3<f64>,
}

impl Default for FeModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FeModelBuilder {
    /// An empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            node_ctrl: Vec::new(),
            ctrls: Vec::new(),
            rods: Vec::new(),
            quads: Vec::new(),
            tris: Vec::new(),
            bends: Vec::new(),
            springs: Vec::new(),
            follow_nodes: Vec::new(),
            ctrl_offsets: Vec::new(),
            ctrl_os_offsets: Vec::new(),
            ropes: Vec::new(),
            node_bases: Vec::new(),
            reverse_offsets: Vec::new(),
            free_nodes: Vec::new(),
            fits: Vec::new(),
            inclusive_spheres: Vec::new(),
            exclusive_spheres: Vec::new(),
            planes: Vec::new(),
            world_collision: Vec::new(),
            tapered_capsule_stretches: Vec::new(),
            tapered_capsule_rigids: Vec::new(),
            sphere_rigids: Vec::new(),
            flags: FeFlags::empty(),
            rot_lock_static_node_count: 0,
            defaults: FeModelDefaults::default(),
            rope_offset: Vector3::new(0.0, -DEFAULT_ROPE_SIZE, 0.0),
        }
    }

    /// Add a node and its ctrl; returns the node index.
    ///
    /// Static nodes must be added before dynamic ones.
    pub fn add_node(&mut self, desc: NodeDesc) -> usize {
        let node = self.nodes.len();
        let ctrl = self.ctrls.len();
        self.ctrls.push(CtrlDesc {
            name: None,
            pose: Transform::from_parts(desc.position.into(), desc.rotation),
            node: Some(node),
        });
        self.nodes.push(desc);
        self.node_ctrl.push(ctrl);
        node
    }

    /// Add a static node.
    pub fn add_static_node(&mut self, position: Vector3<f64>) -> usize {
        self.add_node(NodeDesc::fixed(position))
    }

    /// Add a dynamic node.
    pub fn add_dynamic_node(&mut self, position: Vector3<f64>, mass: f64) -> usize {
        self.add_node(NodeDesc::dynamic(position, mass))
    }

    /// Add a ctrl with no node; returns the ctrl index.
    pub fn add_virtual_ctrl(&mut self, pose: Transform) -> usize {
        self.ctrls.push(CtrlDesc {
            name: None,
            pose,
            node: None,
        });
        self.ctrls.len() - 1
    }

    /// Ctrl index of `node`.
    #[must_use]
    pub fn ctrl_of(&self, node: usize) -> Option<usize> {
        self.node_ctrl.get(node).copied()
    }

    /// Name a ctrl; names are hashed to match ctrls across models.
    pub fn set_ctrl_name(&mut self, ctrl: usize, name: impl Into<String>) -> &mut Self {
        if let Some(desc) = self.ctrls.get_mut(ctrl) {
            desc.name = Some(name.into());
        }
        self
    }

    /// Inextensible rod at the rest distance.
    pub fn add_rod(&mut self, a: usize, b: usize) -> &mut Self {
        self.rods.push(RodDesc {
            nodes: [a, b],
            min_dist: None,
            max_dist: None,
            relaxation_factor: 1.0,
        });
        self
    }

    /// Rod with explicit distance limits and relaxation.
    pub fn add_rod_with_limits(
        &mut self,
        a: usize,
        b: usize,
        min_dist: f64,
        max_dist: f64,
        relaxation_factor: f64,
    ) -> &mut Self {
        self.rods.push(RodDesc {
            nodes: [a, b],
            min_dist: Some(min_dist),
            max_dist: Some(max_dist),
            relaxation_factor,
        });
        self
    }

    /// Quad over four corners in cyclic order.
    pub fn add_quad(&mut self, nodes: [usize; 4]) -> &mut Self {
        self.quads.push(nodes);
        self
    }

    /// Tri over three corners.
    pub fn add_tri(&mut self, nodes: [usize; 3]) -> &mut Self {
        self.tris.push(nodes);
        self
    }

    /// Bend between edge `nodes[0..2]` and the virtual edge through pairs
    /// `nodes[2..4]` and `nodes[4..6]`.
    pub fn add_bend(&mut self, nodes: [usize; 6], te: f64, tv: f64) -> &mut Self {
        self.bends.push((nodes, te, tv));
        self
    }

    /// Damped spring at the rest distance.
    pub fn add_spring(&mut self, a: usize, b: usize, stiffness: f64, damping: f64) -> &mut Self {
        self.springs.push(([a, b], stiffness, damping));
        self
    }

    /// Make `child` follow a fraction of `parent`'s motion.
    pub fn add_follow_node(&mut self, parent: usize, child: usize, weight: f64) -> &mut Self {
        self.follow_nodes.push(FollowNode {
            parent,
            child,
            weight,
        });
        self
    }

    /// Place `child` at `offset` in `parent`'s frame.
    pub fn add_ctrl_offset(
        &mut self,
        parent: usize,
        child: usize,
        offset: Vector3<f64>,
    ) -> &mut Self {
        self.ctrl_offsets.push(CtrlOffset {
            ctrl_parent: parent,
            ctrl_child: child,
            offset,
        });
        self
    }

    /// Place `child` at `parent`'s origin plus the rope offset.
    pub fn add_ctrl_os_offset(&mut self, parent: usize, child: usize) -> &mut Self {
        self.ctrl_os_offsets.push(CtrlOsOffset {
            ctrl_parent: parent,
            ctrl_child: child,
        });
        self
    }

    /// Rope through `nodes`, starting at its anchor.
    pub fn add_rope(&mut self, nodes: &[usize]) -> &mut Self {
        self.ropes.push(nodes.to_vec());
        self
    }

    /// Reconstruct `node`'s frame from the `x0 -> x1` and `y0 -> y1` directions.
    pub fn add_node_base(
        &mut self,
        node: usize,
        x: [usize; 2],
        y: [usize; 2],
        q_adjust: UnitQuaternion<f64>,
    ) -> &mut Self {
        self.node_bases.push(NodeBase {
            node,
            x0: x[0],
            x1: x[1],
            y0: y[0],
            y1: y[1],
            q_adjust,
        });
        self
    }

    /// Place `bone_ctrl` so that `offset` in its frame lands on `target_node`.
    pub fn add_reverse_offset(
        &mut self,
        bone_ctrl: usize,
        target_node: usize,
        offset: Vector3<f64>,
    ) -> &mut Self {
        self.reverse_offsets.push(ReverseOffset {
            bone_ctrl,
            target_node,
            offset,
        });
        self
    }

    /// Mark a node whose ctrl keeps its animated rotation.
    pub fn add_free_node(&mut self, node: usize) -> &mut Self {
        self.free_nodes.push(node);
        self
    }

    /// Shape-match `ctrl` to `nodes`, placing `node` at their center.
    pub fn add_fit_matrix(&mut self, ctrl: usize, node: usize, nodes: &[usize]) -> &mut Self {
        self.fits.push(FitDesc {
            ctrl,
            node,
            nodes: nodes.to_vec(),
        });
        self
    }

    /// Keep `node` inside a sphere of `radius` around `origin` in `ctrl`'s frame.
    pub fn add_inclusive_sphere(
        &mut self,
        ctrl: usize,
        node: usize,
        origin: Vector3<f64>,
        radius: f64,
    ) -> &mut Self {
        self.inclusive_spheres.push(CollisionSphere {
            ctrl_parent: ctrl,
            child_node: node,
            r_factor: 1.0 / (radius * radius).max(f64::MIN_POSITIVE),
            origin,
            stickiness: 0.0,
        });
        self
    }

    /// Keep `node` outside a sphere of `radius` around `origin` in `ctrl`'s frame.
    pub fn add_exclusive_sphere(
        &mut self,
        ctrl: usize,
        node: usize,
        origin: Vector3<f64>,
        radius: f64,
    ) -> &mut Self {
        self.exclusive_spheres.push(CollisionSphere {
            ctrl_parent: ctrl,
            child_node: node,
            r_factor: radius,
            origin,
            stickiness: 0.0,
        });
        self
    }

    /// Keep `node` on the positive side of a plane in `ctrl`'s frame.
    pub fn add_collision_plane(
        &mut self,
        ctrl: usize,
        node: usize,
        normal: Vector3<f64>,
        offset: f64,
    ) -> &mut Self {
        self.planes.push(CollisionPlane {
            ctrl_parent: ctrl,
            child_node: node,
            normal: normal.try_normalize(0.0).unwrap_or_else(Vector3::z),
            offset,
            stickiness: 0.0,
        });
        self
    }

    /// Ground collision for `nodes` with the given friction.
    pub fn add_world_collision(
        &mut self,
        nodes: &[usize],
        world_friction: f64,
        ground_friction: f64,
    ) -> &mut Self {
        self.world_collision
            .push((nodes.to_vec(), world_friction, ground_friction));
        self
    }

    /// Tapered capsule spanned between two nodes.
    pub fn add_tapered_capsule_stretch(&mut self, capsule: TaperedCapsuleStretch) -> &mut Self {
        self.tapered_capsule_stretches.push(capsule);
        self
    }

    /// Tapered capsule attached to a node's ctrl.
    pub fn add_tapered_capsule_rigid(&mut self, capsule: TaperedCapsuleRigid) -> &mut Self {
        self.tapered_capsule_rigids.push(capsule);
        self
    }

    /// Sphere attached to a node's ctrl.
    pub fn add_sphere_rigid(&mut self, sphere: SphereRigid) -> &mut Self {
        self.sphere_rigids.push(sphere);
        self
    }

    /// Collide with the given world shape kinds.
    pub fn set_world_shape_mask(&mut self, mask: WorldShapeMask) -> &mut Self {
        let bits = mask.bits() << WORLD_SHAPE_COLLISION_SHIFT;
        self.flags = (self.flags & !Self::world_flags()) | FeFlags::from_bits_truncate(bits);
        self
    }

    /// Use the legacy numerics.
    pub fn set_uninertial(&mut self, uninertial: bool) -> &mut Self {
        self.flags.set(FeFlags::UNINERTIAL_CONSTRAINTS, uninertial);
        self
    }

    /// Run a follow-the-leader rod pass on the last iteration.
    pub fn set_ftl(&mut self, enable: bool) -> &mut Self {
        self.flags.set(FeFlags::ENABLE_FTL, enable);
        self
    }

    /// Leading static nodes whose rotation is not written back.
    pub fn set_rot_lock_static_nodes(&mut self, count: usize) -> &mut Self {
        self.rot_lock_static_node_count = count;
        self
    }

    /// Authored tunables.
    pub fn set_defaults(&mut self, defaults: FeModelDefaults) -> &mut Self {
        self.defaults = defaults;
        self
    }

    /// Offset used by ctrl os-offsets.
    pub fn set_rope_offset(&mut self, offset: Vector3<f64>) -> &mut Self {
        self.rope_offset = offset;
        self
    }

    fn world_flags() -> FeFlags {
        FeFlags::WORLD_COLLIDE_SPHERES
            | FeFlags::WORLD_COLLIDE_CAPSULES
            | FeFlags::WORLD_COLLIDE_HULLS
            | FeFlags::WORLD_COLLIDE_MESHES
    }

    /// Finish the model.
    ///
    /// # Errors
    ///
    /// Returns an error if static nodes do not form a prefix, a dynamic node has no
    /// positive mass, any element references a missing node or ctrl, a rod's limits are
    /// inverted, a collision list names a static node, or a quad's static corners are
    /// not adjacent.
    pub fn build(&self) -> Result<FeModel> {
        let node_count = self.nodes.len();
        let static_node_count = self.nodes.iter().take_while(|n| n.is_static).count();
        if self.nodes[static_node_count..].iter().any(|n| n.is_static) {
            return Err(SoftbodyError::invalid_topology(
                "static nodes must be added before dynamic nodes",
            ));
        }
        if self.rot_lock_static_node_count > static_node_count {
            return Err(SoftbodyError::invalid_topology(format!(
                "{} rot-lock nodes but only {static_node_count} static nodes",
                self.rot_lock_static_node_count
            )));
        }
        if let Some((node, desc)) = self
            .nodes
            .iter()
            .enumerate()
            .skip(static_node_count)
            .find(|(_, n)| !(n.mass.is_finite() && n.mass > 0.0))
        {
            return Err(SoftbodyError::invalid_constraint(format!(
                "dynamic node {node} has mass {}, expected a positive finite mass",
                desc.mass
            )));
        }
        let ctrl_count = self.ctrls.len();
        let positions: Vec<Vector3<f64>> = self.nodes.iter().map(|n| n.position).collect();
        let inv_masses: Vec<f64> = self.nodes.iter().map(NodeDesc::inv_mass).collect();
        let is_static = |node: usize| node < static_node_count;
        let mut flags = self.flags;

        let identity_map = ctrl_count == node_count
            && self.node_ctrl.iter().enumerate().all(|(i, &c)| i == c);
        let (node_to_ctrl, ctrl_to_node) = if identity_map {
            (Vec::new(), Vec::new())
        } else {
            (
                self.node_ctrl.clone(),
                self.ctrls.iter().map(|c| c.node).collect(),
            )
        };

        // Rods
        let mut rods = Vec::with_capacity(self.rods.len());
        for desc in &self.rods {
            let [a, b] = desc.nodes;
            check_index("rod node", a, node_count)?;
            check_index("rod node", b, node_count)?;
            if is_static(a) && is_static(b) {
                warn!(a, b, "skipping rod between two static nodes");
                continue;
            }
            let rest = (positions[b] - positions[a]).norm();
            let max_dist = desc.max_dist.unwrap_or(rest);
            let min_dist = desc.min_dist.unwrap_or(rest);
            check_rod_limits(a, b, min_dist, max_dist)?;
            let weight0 = if is_static(a) {
                0.0
            } else if is_static(b) {
                1.0
            } else {
                let (i0, i1) = (inv_masses[a], inv_masses[b]);
                i0 / (i0 + i1)
            };
            rods.push(Rod {
                nodes: [a, b],
                max_dist,
                min_dist,
                weight0,
                relaxation_factor: desc.relaxation_factor,
            });
        }
        rods.sort_by_key(|r| !(is_static(r.nodes[0]) || is_static(r.nodes[1])));
        let simd_rods = schedule(&rods, |r| r.nodes.to_vec(), static_node_count)
            .into_iter()
            .map(|lanes| {
                let lane = |i: usize| &rods[lanes[i]];
                SimdRod {
                    nodes: [
                        std::array::from_fn(|i| lane(i).nodes[0]),
                        std::array::from_fn(|i| lane(i).nodes[1]),
                    ],
                    max_dist: std::array::from_fn(|i| lane(i).max_dist),
                    min_dist: std::array::from_fn(|i| lane(i).min_dist),
                    weight0: std::array::from_fn(|i| lane(i).weight0),
                    relaxation_factor: std::array::from_fn(|i| lane(i).relaxation_factor),
                }
            })
            .collect();

        // Quads
        let mut quads: Vec<(Quad, usize)> = Vec::with_capacity(self.quads.len());
        for &nodes in &self.quads {
            for &node in &nodes {
                check_index("quad node", node, node_count)?;
            }
            if let Some(quad) = build_quad(nodes, &positions, &inv_masses, static_node_count)? {
                quads.push(quad);
            }
        }
        quads.sort_by_key(|(_, statics)| std::cmp::Reverse(*statics));
        let quad_counts = class_counts(quads.iter().map(|(_, s)| *s));
        let quads: Vec<Quad> = quads.into_iter().map(|(q, _)| q).collect();
        let mut simd_quads = Vec::new();
        let mut simd_quad_counts = [0; 3];
        for (class, range) in class_ranges(quad_counts).into_iter().enumerate() {
            let slice = &quads[range.clone()];
            for lanes in schedule(slice, |q| q.nodes.to_vec(), static_node_count) {
                let lane = |i: usize| &slice[lanes[i]];
                simd_quads.push(SimdQuad {
                    nodes: std::array::from_fn(|c| std::array::from_fn(|i| lane(i).nodes[c])),
                    shape: std::array::from_fn(|c| {
                        Vec3x4::from_vectors(std::array::from_fn(|i| lane(i).shape[c].xyz()))
                    }),
                    weights: std::array::from_fn(|c| std::array::from_fn(|i| lane(i).shape[c].w)),
                });
            }
            simd_quad_counts[2 - class] = simd_quads.len();
        }

        // Tris
        let mut tris: Vec<(Tri, usize)> = Vec::with_capacity(self.tris.len());
        for &nodes in &self.tris {
            for &node in &nodes {
                check_index("tri node", node, node_count)?;
            }
            if let Some(tri) = build_tri(nodes, &positions, &inv_masses, static_node_count) {
                tris.push(tri);
            }
        }
        tris.sort_by_key(|(_, statics)| std::cmp::Reverse(*statics));
        let tri_counts = class_counts(tris.iter().map(|(_, s)| *s));
        let tris: Vec<Tri> = tris.into_iter().map(|(t, _)| t).collect();
        let mut simd_tris = Vec::new();
        let mut simd_tri_counts = [0; 3];
        for (class, range) in class_ranges(tri_counts).into_iter().enumerate() {
            let slice = &tris[range.clone()];
            for lanes in schedule(slice, |t| t.nodes.to_vec(), static_node_count) {
                let lane = |i: usize| &slice[lanes[i]];
                simd_tris.push(SimdTri {
                    nodes: std::array::from_fn(|c| std::array::from_fn(|i| lane(i).nodes[c])),
                    w1: std::array::from_fn(|i| lane(i).w1),
                    w2: std::array::from_fn(|i| lane(i).w2),
                    v1x: std::array::from_fn(|i| lane(i).v1x),
                    v2x: std::array::from_fn(|i| lane(i).v2.x),
                    v2y: std::array::from_fn(|i| lane(i).v2.y),
                });
            }
            simd_tri_counts[2 - class] = simd_tris.len();
        }

        // Bends
        let mut axial_edge_bends = Vec::with_capacity(self.bends.len());
        for &(nodes, te, tv) in &self.bends {
            for &node in &nodes {
                check_index("bend node", node, node_count)?;
            }
            axial_edge_bends.push(build_bend(nodes, te, tv, &positions, &inv_masses));
        }

        // Node integrators and springs
        let node_integrators: Vec<NodeIntegrator> =
            if self.nodes.iter().any(|n| n.integrator.is_some()) {
                self.nodes
                    .iter()
                    .map(|n| n.integrator.unwrap_or_default())
                    .collect()
            } else {
                Vec::new()
            };
        for integrator in &node_integrators {
            if integrator.point_damping > 0.0 {
                flags |= FeFlags::HAS_NODE_DAMPING;
            }
            if integrator.animation_force_attraction > 0.0 {
                flags |= FeFlags::HAS_ANIMATION_FORCE_ATTRACTION;
            }
            if integrator.animation_vertex_attraction > 0.0 {
                flags |= FeFlags::HAS_ANIMATION_VERTEX_ATTRACTION;
            }
            if (integrator.gravity - DEFAULT_GRAVITY).abs() > f64::EPSILON {
                flags |= FeFlags::HAS_CUSTOM_GRAVITY;
            }
        }
        let damping_of = |node: usize| {
            node_integrators
                .get(node)
                .map_or(0.0, |integrator| integrator.point_damping)
        };
        let mut springs = Vec::with_capacity(self.springs.len());
        for &([a, b], stiffness, damping) in &self.springs {
            check_index("spring node", a, node_count)?;
            check_index("spring node", b, node_count)?;
            let w0 = inv_masses[a] * (-damping_of(a)).exp();
            let w1 = inv_masses[b] * (-damping_of(b)).exp();
            let sum = w0 + w1;
            if sum <= 0.0 {
                warn!(a, b, "skipping spring between two immovable nodes");
                continue;
            }
            springs.push(SpringIntegrator {
                nodes: [a, b],
                rest_length: (positions[a] - positions[b]).norm(),
                spring_constant: stiffness * sum,
                spring_damping: damping * sum,
                node_weight0: w0 / sum,
            });
        }

        let legacy_stretch_force: Vec<f64> =
            if self.nodes.iter().any(|n| n.legacy_stretch_force != 0.0) {
                flags |= FeFlags::HAS_STRETCH_VELOCITY_DAMPING;
                self.nodes.iter().map(|n| n.legacy_stretch_force).collect()
            } else {
                Vec::new()
            };
        let node_collision_radii: Vec<f64> =
            if self.nodes.iter().any(|n| n.collision_radius > 0.0) {
                self.nodes[static_node_count..]
                    .iter()
                    .map(|n| n.collision_radius)
                    .collect()
            } else {
                Vec::new()
            };

        // Mapping records
        for follow in &self.follow_nodes {
            check_index("follow parent", follow.parent, node_count)?;
            check_index("follow child", follow.child, node_count)?;
        }
        for offset in &self.ctrl_offsets {
            check_index("offset parent", offset.ctrl_parent, ctrl_count)?;
            check_index("offset child", offset.ctrl_child, ctrl_count)?;
        }
        for offset in &self.ctrl_os_offsets {
            check_index("os-offset parent", offset.ctrl_parent, ctrl_count)?;
            check_index("os-offset child", offset.ctrl_child, ctrl_count)?;
        }
        let rope_count = self.ropes.len();
        let mut ropes: Vec<usize> = Vec::with_capacity(
            rope_count + self.ropes.iter().map(Vec::len).sum::<usize>(),
        );
        ropes.resize(rope_count, 0);
        for (r, chain) in self.ropes.iter().enumerate() {
            for &node in chain {
                check_index("rope node", node, node_count)?;
            }
            ropes.extend_from_slice(chain);
            ropes[r] = ropes.len();
        }
        for base in &self.node_bases {
            for node in [base.node, base.x0, base.x1, base.y0, base.y1] {
                check_index("node base node", node, node_count)?;
            }
        }
        for offset in &self.reverse_offsets {
            check_index("reverse offset bone", offset.bone_ctrl, ctrl_count)?;
            check_index("reverse offset node", offset.target_node, node_count)?;
        }
        for &node in &self.free_nodes {
            check_index("free node", node, node_count)?;
        }

        // Fit matrices: two-weight, then one-weight, then general
        let init_pose: Vec<Transform> = self.ctrls.iter().map(|c| c.pose).collect();
        let mut fits: Vec<&FitDesc> = self.fits.iter().collect();
        fits.sort_by_key(|f| match f.nodes.len() {
            2 => 0,
            1 => 1,
            _ => 2,
        });
        let mut fit_matrices = Vec::with_capacity(fits.len());
        let mut fit_weights = Vec::new();
        let mut fit_matrix_counts = [fits.len(), 0, 0];
        for fit in &fits {
            check_index("fit ctrl", fit.ctrl, ctrl_count)?;
            check_index("fit node", fit.node, node_count)?;
            for &node in &fit.nodes {
                check_index("fit weight node", node, node_count)?;
            }
            if fit.nodes.len() == 2 {
                fit_matrix_counts[2] += 1;
            }
            if fit.nodes.len() <= 2 {
                fit_matrix_counts[1] += 1;
            }
            let mut sorted = fit.nodes.clone();
            sorted.sort_by_key(|&n| !is_static(n));
            let masses: Vec<f64> = sorted
                .iter()
                .map(|&n| 1.0 / inv_masses[n].max(MIN_INV_MASS))
                .collect();
            let total: f64 = masses.iter().sum();
            let begin = fit_weights.len();
            let begin_dynamic = begin + sorted.iter().filter(|&&n| is_static(n)).count();
            let mut center = Vector3::zeros();
            for (&node, &m) in sorted.iter().zip(&masses) {
                let weight = if total > 0.0 { m / total } else { 0.0 };
                center += init_pose[self.node_ctrl[node]].translation.vector * weight;
                fit_weights.push(FitWeight { weight, node });
            }
            let fitted = Transform::from_parts(center.into(), UnitQuaternion::identity());
            fit_matrices.push(FitMatrix {
                bone: fitted.inverse() * init_pose[fit.ctrl],
                center,
                end: fit_weights.len(),
                node: fit.node,
                ctrl: fit.ctrl,
                begin_dynamic,
            });
        }

        // Collision primitives
        for sphere in self.inclusive_spheres.iter().chain(&self.exclusive_spheres) {
            check_index("sphere ctrl", sphere.ctrl_parent, ctrl_count)?;
            check_index("sphere node", sphere.child_node, node_count)?;
            check_dynamic("sphere node", sphere.child_node, static_node_count)?;
        }
        let mut collision_spheres = self.inclusive_spheres.clone();
        collision_spheres.extend_from_slice(&self.exclusive_spheres);
        let collision_sphere_counts = [collision_spheres.len(), self.inclusive_spheres.len()];
        for plane in &self.planes {
            check_index("plane ctrl", plane.ctrl_parent, ctrl_count)?;
            check_index("plane node", plane.child_node, node_count)?;
            check_dynamic("plane node", plane.child_node, static_node_count)?;
        }
        let mut world_collision_params = Vec::with_capacity(self.world_collision.len());
        let mut world_collision_nodes = Vec::new();
        for (nodes, world_friction, ground_friction) in &self.world_collision {
            let list_begin = world_collision_nodes.len();
            for &node in nodes {
                check_index("world collision node", node, node_count)?;
                check_dynamic("world collision node", node, static_node_count)?;
                world_collision_nodes.push(node);
            }
            world_collision_params.push(WorldCollisionParams {
                world_friction: *world_friction,
                ground_friction: *ground_friction,
                list_begin,
                list_end: world_collision_nodes.len(),
            });
        }
        for capsule in &self.tapered_capsule_stretches {
            check_index("capsule node", capsule.nodes[0], node_count)?;
            check_index("capsule node", capsule.nodes[1], node_count)?;
        }
        for capsule in &self.tapered_capsule_rigids {
            check_index("capsule node", capsule.node, node_count)?;
        }
        for sphere in &self.sphere_rigids {
            check_index("sphere node", sphere.node, node_count)?;
        }

        let leaf_masks: Vec<u16> = self.nodes[static_node_count..]
            .iter()
            .map(|n| n.collision_mask)
            .collect();
        let tree = build_tree(
            &positions[static_node_count..],
            &leaf_masks,
            self.edges(static_node_count),
        );

        let ctrl_hash = self
            .ctrls
            .iter()
            .enumerate()
            .map(|(i, c)| match &c.name {
                Some(name) => fnv1a(name.as_bytes()),
                None => fnv1a(format!("ctrl{i}").as_bytes()),
            })
            .collect();
        let ctrl_names = if self.ctrls.iter().any(|c| c.name.is_some()) {
            self.ctrls
                .iter()
                .map(|c| c.name.clone().unwrap_or_default())
                .collect()
        } else {
            Vec::new()
        };

        let model = FeModel {
            node_count,
            static_node_count,
            rot_lock_static_node_count: self.rot_lock_static_node_count,
            ctrl_count,
            node_to_ctrl,
            ctrl_to_node,
            rods,
            simd_rods,
            quads,
            quad_counts,
            simd_quads,
            simd_quad_counts,
            tris,
            tri_counts,
            simd_tris,
            simd_tri_counts,
            axial_edge_bends,
            springs,
            node_integrators,
            node_inv_masses: inv_masses,
            legacy_stretch_force,
            node_collision_radii,
            follow_nodes: self.follow_nodes.clone(),
            ctrl_offsets: self.ctrl_offsets.clone(),
            ctrl_os_offsets: self.ctrl_os_offsets.clone(),
            ropes,
            rope_count,
            node_bases: self.node_bases.clone(),
            reverse_offsets: self.reverse_offsets.clone(),
            free_nodes: self.free_nodes.clone(),
            fit_matrices,
            fit_weights,
            fit_matrix_counts,
            init_pose,
            collision_spheres,
            collision_sphere_counts,
            collision_planes: self.planes.clone(),
            world_collision_params,
            world_collision_nodes,
            tapered_capsule_stretches: self.tapered_capsule_stretches.clone(),
            tapered_capsule_rigids: self.tapered_capsule_rigids.clone(),
            sphere_rigids: self.sphere_rigids.clone(),
            tree,
            ctrl_hash,
            ctrl_names,
            flags,
            defaults: self.defaults,
            rope_offset: self.rope_offset,
        };
        model.validate()?;

        debug!(
            nodes = model.node_count,
            statics = model.static_node_count,
            rods = model.rods.len(),
            quads = model.quads.len(),
            tris = model.tris.len(),
            bends = model.axial_edge_bends.len(),
            tree_depth = model.tree.depth,
            "built fe model"
        );
        Ok(model)
    }

    /// Links between dynamic nodes, as dynamic indices.
    fn edges(&self, static_node_count: usize) -> Vec<(usize, usize)> {
        let mut seen = HashSet::new();
        let mut edges = Vec::new();
        let mut link = |a: usize, b: usize| {
            if a < static_node_count || b < static_node_count || a == b {
                return;
            }
            let key = (a.min(b) - static_node_count, a.max(b) - static_node_count);
            if seen.insert(key) {
                edges.push(key);
            }
        };
        for rod in &self.rods {
            link(rod.nodes[0], rod.nodes[1]);
        }
        for quad in &self.quads {
            for i in 0..4 {
                link(quad[i], quad[(i + 1) % 4]);
            }
        }
        for tri in &self.tris {
            for i in 0..3 {
                link(tri[i], tri[(i + 1) % 3]);
            }
        }
        edges
    }
}

/// 32-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

/// `[all, >=1 static, >=2 static]` for elements sorted by descending static count.
fn class_counts(statics: impl Iterator<Item = usize>) -> [usize; 3] {
    let mut counts = [0; 3];
    for s in statics {
        counts[0] += 1;
        if s >= 1 {
            counts[1] += 1;
        }
        if s >= 2 {
            counts[2] += 1;
        }
    }
    counts
}

/// Element ranges for the two-static, one-static and free classes.
fn class_ranges(counts: [usize; 3]) -> [std::ops::Range<usize>; 3] {
    [0..counts[2], counts[2]..counts[1], counts[1]..counts[0]]
}

/// Greedy 4-lane batching with no shared dynamic node inside a batch.
///
/// Each batch takes the earliest remaining elements that do not conflict with it.
/// Short batches are padded by repeating their first lane.
fn schedule<T>(
    elements: &[T],
    nodes_of: impl Fn(&T) -> Vec<usize>,
    static_node_count: usize,
) -> Vec<[usize; 4]> {
    let mut remaining: Vec<usize> = (0..elements.len()).collect();
    let mut batches = Vec::with_capacity(elements.len().div_ceil(4));
    while !remaining.is_empty() {
        let mut batch: smallvec::SmallVec<[usize; 4]> = smallvec::SmallVec::new();
        let mut used: smallvec::SmallVec<[usize; 24]> = smallvec::SmallVec::new();
        remaining.retain(|&e| {
            if batch.len() == 4 {
                return true;
            }
            let nodes = nodes_of(&elements[e]);
            let conflict = nodes
                .iter()
                .any(|n| *n >= static_node_count && used.contains(n));
            if conflict {
                return true;
            }
            used.extend(nodes);
            batch.push(e);
            false
        });
        let first = batch[0];
        batches.push(std::array::from_fn(|i| batch.get(i).copied().unwrap_or(first)));
    }
    batches
}

/// Rest shape of a quad, rotated so its static corners lead.
fn build_quad(
    nodes: [usize; 4],
    positions: &[Vector3<f64>],
    inv_masses: &[f64],
    static_node_count: usize,
) -> Result<Option<(Quad, usize)>> {
    let is_static = |n: usize| n < static_node_count;
    let statics = nodes.iter().filter(|&&n| is_static(n)).count();
    if statics >= 3 {
        warn!(?nodes, "skipping quad with {statics} static corners");
        return Ok(None);
    }
    let Some(start) =
        (0..4).find(|&r| (0..statics).all(|k| is_static(nodes[(r + k) % 4])))
    else {
        return Err(SoftbodyError::invalid_constraint(format!(
            "quad {nodes:?} has non-adjacent static corners"
        )));
    };
    let nodes: [usize; 4] = std::array::from_fn(|k| nodes[(start + k) % 4]);
    let p = nodes.map(|n| positions[n]);
    let masses = nodes.map(|n| {
        if is_static(n) {
            0.0
        } else {
            1.0 / inv_masses[n].max(MIN_INV_MASS)
        }
    });
    let total: f64 = masses.iter().sum();
    let weights = masses.map(|m| m / total);
    let com = match statics {
        1 => p[0],
        2 => (p[0] + p[1]) * 0.5,
        _ => (0..4).map(|i| p[i] * weights[i]).sum(),
    };
    let basis = if statics == 2 {
        Basis::new(&(p[1] - p[0]), &(p[2] + p[3] - p[0] * 2.0))
    } else {
        Basis::new(&(p[2] - p[0]), &(p[3] - p[1]))
    };
    let shape = std::array::from_fn(|i| {
        let local = basis.world_to_local(&(p[i] - com));
        Vector4::new(local.x, local.y, local.z, weights[i])
    });
    Ok(Some((
        Quad {
            nodes,
            slack: 0.0,
            shape,
        },
        statics,
    )))
}

/// Rest frame of a tri, with static corners first.
fn build_tri(
    nodes: [usize; 3],
    positions: &[Vector3<f64>],
    inv_masses: &[f64],
    static_node_count: usize,
) -> Option<(Tri, usize)> {
    let is_static = |n: usize| n < static_node_count;
    let mut nodes = nodes;
    nodes.sort_by_key(|&n| !is_static(n));
    let statics = nodes.iter().filter(|&&n| is_static(n)).count();
    if statics == 3 {
        warn!(?nodes, "skipping tri with three static corners");
        return None;
    }
    let p = nodes.map(|n| positions[n]);
    let basis = TriBasis::new(&(p[1] - p[0]), &(p[2] - p[0]));
    let m = nodes.map(|n| {
        if is_static(n) {
            0.0
        } else {
            1.0 / inv_masses[n].max(MIN_INV_MASS)
        }
    });
    let (w1, w2) = match statics {
        2 => (0.0, 1.0),
        1 => (m[1] / (m[1] + m[2]), m[2] / (m[1] + m[2])),
        _ => {
            let total = m[0] + m[1] + m[2];
            (m[1] / total, m[2] / total)
        }
    };
    Some((
        Tri {
            nodes,
            w1,
            w2,
            v1x: basis.v1x,
            v2: basis.v2,
        },
        statics,
    ))
}

/// Signed rest distance and mass-weighted correction shares of a bend.
fn build_bend(
    nodes: [usize; 6],
    te: f64,
    tv: f64,
    positions: &[Vector3<f64>],
    inv_masses: &[f64],
) -> AxialEdgeBend {
    let p = nodes.map(|n| positions[n]);
    let edge_point = p[0] * (1.0 - te) + p[1] * te;
    let virtual_point = (p[2] + p[3]) * (0.5 - tv * 0.5) + (p[4] + p[5]) * (tv * 0.5);
    let axis = virtual_point - edge_point;
    let cross = (p[1] - p[0]).cross(&((p[4] + p[5]) - (p[2] + p[3])));
    let len = axis.norm();
    let dist = if axis.dot(&cross) > 0.0 { len } else { -len };

    let inv = nodes.map(|n| inv_masses[n]);
    let c = [1.0 - te, te, -(1.0 - tv) * 0.5, -tv * 0.5];
    let i23 = (inv[2] + inv[3]) * 0.5;
    let i45 = (inv[4] + inv[5]) * 0.5;
    let sum = inv[0] * c[0] * c[0]
        + inv[1] * c[1] * c[1]
        + 2.0 * i23 * c[2] * c[2]
        + 2.0 * i45 * c[3] * c[3];
    let weights = if sum > 0.0 {
        [
            inv[0] * c[0] / sum,
            inv[1] * c[1] / sum,
            i23 * c[2] / sum,
            i45 * c[3] / sum,
        ]
    } else {
        [0.0; 4]
    };
    AxialEdgeBend {
        te,
        tv,
        dist,
        weights,
        nodes,
    }
}

/// Union-find root with path halving.
fn find(owner: &mut [usize], mut i: usize) -> usize {
    while owner[i] != i {
        owner[i] = owner[owner[i]];
        i = owner[i];
    }
    i
}

/// Agglomerative clustering of the dynamic nodes.
///
/// Linked clusters with the closest centers merge first; once no links remain between
/// clusters, the closest unlinked pair merges.
fn build_tree(
    positions: &[Vector3<f64>],
    leaf_masks: &[u16],
    edges: Vec<(usize, usize)>,
) -> CollisionTree {
    let n = positions.len();
    if n < 2 {
        return CollisionTree::from_children(Vec::new(), leaf_masks);
    }
    let total = 2 * n - 1;
    let mut owner: Vec<usize> = (0..total).collect();
    let mut sums: Vec<Vector3<f64>> = vec![Vector3::zeros(); total];
    let mut counts = vec![0usize; total];
    sums[..n].copy_from_slice(positions);
    counts[..n].fill(1);
    let mut active: Vec<usize> = (0..n).collect();
    let mut edges = edges;
    let mut children = Vec::with_capacity(n - 1);

    for c in 0..n - 1 {
        let center = |i: usize, sums: &[Vector3<f64>], counts: &[usize]| {
            sums[i] / counts[i] as f64
        };
        let mut best: Option<(f64, usize, usize)> = None;
        edges.retain(|&(a, b)| {
            let ra = find(&mut owner, a);
            let rb = find(&mut owner, b);
            if ra == rb {
                return false;
            }
            let cost = (center(ra, &sums, &counts) - center(rb, &sums, &counts)).norm_squared()
                * (counts[ra] + counts[rb]) as f64;
            if best.is_none_or(|(d, _, _)| cost < d) {
                best = Some((cost, ra, rb));
            }
            true
        });
        if best.is_none() {
            for (i, &a) in active.iter().enumerate() {
                for &b in &active[i + 1..] {
                    let cost = (center(a, &sums, &counts) - center(b, &sums, &counts))
                        .norm_squared()
                        * (counts[a] + counts[b]) as f64;
                    if best.is_none_or(|(d, _, _)| cost < d) {
                        best = Some((cost, a, b));
                    }
                }
            }
        }
        let Some((_, a, b)) = best else {
            break;
        };
        let merged = n + c;
        owner[a] = merged;
        owner[b] = merged;
        sums[merged] = sums[a] + sums[b];
        counts[merged] = counts[a] + counts[b];
        active.retain(|&x| x != a && x != b);
        active.push(merged);
        children.push([a.min(b), a.max(b)]);
    }
    CollisionTree::from_children(children, leaf_masks)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// 3x3 grid of quads' corners, top row static.
    fn grid_builder() -> FeModelBuilder {
        let mut b = FeModelBuilder::new();
        for x in 0..3 {
            b.add_static_node(Vector3::new(f64::from(x) * 10.0, 0.0, 0.0));
        }
        for z in 1..3 {
            for x in 0..3 {
                b.add_dynamic_node(
                    Vector3::new(f64::from(x) * 10.0, 0.0, -f64::from(z) * 10.0),
                    1.0,
                );
            }
        }
        for z in 0..2 {
            for x in 0..2 {
                let i = z * 3 + x;
                b.add_quad([i, i + 1, i + 4, i + 3]);
            }
        }
        b
    }

    #[test]
    fn test_static_prefix_required() {
        let mut b = FeModelBuilder::new();
        b.add_dynamic_node(Vector3::zeros(), 1.0);
        b.add_static_node(Vector3::x());
        let err = b.build().unwrap_err();
        assert!(matches!(err, SoftbodyError::InvalidTopology(_)));
    }

    #[test]
    fn test_rod_index_checked() {
        let mut b = FeModelBuilder::new();
        b.add_dynamic_node(Vector3::zeros(), 1.0);
        b.add_rod(0, 5);
        assert!(matches!(
            b.build().unwrap_err(),
            SoftbodyError::IndexOutOfBounds(_)
        ));
    }

    #[test]
    fn test_rod_weights_and_order() {
        let mut b = FeModelBuilder::new();
        b.add_static_node(Vector3::zeros());
        b.add_dynamic_node(Vector3::new(0.0, 0.0, -1.0), 1.0);
        b.add_dynamic_node(Vector3::new(0.0, 0.0, -2.0), 3.0);
        b.add_rod(1, 2).add_rod(0, 1).add_rod(0, 0);
        let model = b.build().unwrap();
        assert_eq!(model.rods.len(), 2);
        assert_eq!(model.rods[0].nodes, [0, 1]);
        assert_relative_eq!(model.rods[1].weight0, 0.75);
        assert_relative_eq!(model.rods[1].max_dist, 1.0);
        // Both rods share node 1, so they cannot share a batch.
        assert_eq!(model.simd_rods.len(), 2);
        assert_eq!(model.simd_rods[1].nodes[0], [1; 4]);
    }

    #[test]
    fn test_quad_classes() {
        let model = grid_builder().build().unwrap();
        assert_eq!(model.quad_counts, [4, 2, 2]);
        for quad in &model.quads[..2] {
            assert!(quad.nodes[0] < 3 && quad.nodes[1] < 3);
            assert_eq!(quad.shape[0].w, 0.0);
            assert_relative_eq!(quad.shape[2].w + quad.shape[3].w, 1.0);
        }
        let free = &model.quads[3];
        let total: f64 = free.shape.iter().map(|s| s.w).sum();
        assert_relative_eq!(total, 1.0);
        assert_eq!(model.simd_quad_counts[0], model.simd_quads.len());
    }

    #[test]
    fn test_schedule_has_no_conflicts() {
        let model = grid_builder().build().unwrap();
        for batch in &model.simd_quads {
            let mut seen = Vec::new();
            for lane in 0..4 {
                if (0..lane).any(|l| (0..4).all(|c| batch.nodes[c][l] == batch.nodes[c][lane])) {
                    continue;
                }
                for corner in 0..4 {
                    let node = batch.nodes[corner][lane];
                    if node >= model.static_node_count {
                        assert!(!seen.contains(&node), "node {node} shared in batch");
                        seen.push(node);
                    }
                }
            }
        }
    }

    #[test]
    fn test_tree_sizes() {
        let model = grid_builder().build().unwrap();
        let n = model.dynamic_node_count();
        assert_eq!(model.tree.parents.len(), 2 * n - 1);
        assert_eq!(model.tree.children.len(), n - 1);
        assert_eq!(model.tree.root(), Some(2 * n - 2));
    }

    #[test]
    fn test_tri_rest_frame() {
        let mut b = FeModelBuilder::new();
        b.add_dynamic_node(Vector3::new(0.0, 0.0, 0.0), 1.0);
        b.add_dynamic_node(Vector3::new(3.0, 0.0, 0.0), 1.0);
        b.add_dynamic_node(Vector3::new(0.0, 4.0, 0.0), 2.0);
        b.add_tri([0, 1, 2]);
        let model = b.build().unwrap();
        let tri = &model.tris[0];
        assert_relative_eq!(tri.v1x, 3.0);
        assert_relative_eq!(tri.v2.y, 4.0);
        assert_relative_eq!(tri.w2, 0.5);
        assert_eq!(model.tri_counts, [1, 0, 0]);
    }

    #[test]
    fn test_identity_mapping_is_empty() {
        let model = grid_builder().build().unwrap();
        assert!(model.node_to_ctrl.is_empty());
        assert_eq!(model.ctrl_to_node(4), Some(4));

        let mut b = grid_builder();
        let ctrl = b.add_virtual_ctrl(Transform::identity());
        let model = b.build().unwrap();
        assert_eq!(model.ctrl_to_node(ctrl), None);
        assert_eq!(model.node_to_ctrl(2), 2);
    }

    #[test]
    fn test_flags_from_integrators() {
        let mut b = FeModelBuilder::new();
        b.add_node(NodeDesc::dynamic(Vector3::zeros(), 1.0).with_integrator(NodeIntegrator {
            point_damping: 0.5,
            animation_vertex_attraction: 1.0,
            ..NodeIntegrator::default()
        }));
        b.set_world_shape_mask(WorldShapeMask::SPHERE);
        let model = b.build().unwrap();
        assert!(model.flags.contains(FeFlags::HAS_NODE_DAMPING));
        assert!(model.flags.contains(FeFlags::HAS_ANIMATION_VERTEX_ATTRACTION));
        assert!(!model.flags.contains(FeFlags::HAS_CUSTOM_GRAVITY));
        assert_eq!(model.flags.world_shape_mask(), WorldShapeMask::SPHERE);
    }

    #[test]
    fn test_rope_layout() {
        let mut b = FeModelBuilder::new();
        b.add_static_node(Vector3::zeros());
        b.add_dynamic_node(Vector3::new(0.0, 0.0, -1.0), 1.0);
        b.add_dynamic_node(Vector3::new(0.0, 0.0, -2.0), 1.0);
        b.add_rope(&[0, 1, 2]);
        let model = b.build().unwrap();
        assert_eq!(model.rope_count, 1);
        assert_eq!(model.ropes, vec![4, 0, 1, 2]);
        assert_eq!(model.rope_range(0), (1, 4));
    }

    #[test]
    fn test_non_adjacent_static_corners_rejected() {
        let mut b = FeModelBuilder::new();
        b.add_static_node(Vector3::zeros());
        b.add_static_node(Vector3::new(1.0, 0.0, -1.0));
        b.add_dynamic_node(Vector3::new(1.0, 0.0, 0.0), 1.0);
        b.add_dynamic_node(Vector3::new(0.0, 0.0, -1.0), 1.0);
        b.add_quad([0, 2, 1, 3]);
        assert!(matches!(
            b.build().unwrap_err(),
            SoftbodyError::InvalidConstraint(_)
        ));
    }

    #[test]
    fn test_dynamic_node_needs_positive_mass() {
        for mass in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut b = FeModelBuilder::new();
            b.add_static_node(Vector3::zeros());
            b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), mass);
            b.add_rod(0, 1);
            assert!(
                matches!(b.build().unwrap_err(), SoftbodyError::InvalidConstraint(_)),
                "mass {mass} accepted"
            );
        }
    }

    #[test]
    fn test_rod_static_end_never_weighted() {
        let mut b = FeModelBuilder::new();
        b.add_static_node(Vector3::zeros());
        b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1e9);
        b.add_rod(0, 1).add_rod(1, 0);
        let model = b.build().unwrap();
        assert_eq!(model.rods[0].weight0, 0.0);
        assert_eq!(model.rods[1].weight0, 1.0);
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_inverted_rod_limits_rejected() {
        let mut b = FeModelBuilder::new();
        b.add_dynamic_node(Vector3::zeros(), 1.0);
        b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
        b.add_rod_with_limits(0, 1, 12.0, 8.0, 1.0);
        assert!(matches!(
            b.build().unwrap_err(),
            SoftbodyError::InvalidConstraint(_)
        ));

        let mut b = FeModelBuilder::new();
        b.add_dynamic_node(Vector3::zeros(), 1.0);
        b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
        b.add_rod_with_limits(0, 1, f64::NAN, 8.0, 1.0);
        assert!(b.build().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_rod_limits() {
        let mut b = FeModelBuilder::new();
        b.add_dynamic_node(Vector3::zeros(), 1.0);
        b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
        b.add_rod(0, 1);
        let mut model = b.build().unwrap();
        assert!(model.validate().is_ok());
        model.rods[0].min_dist = 12.0;
        model.rods[0].max_dist = 8.0;
        assert!(matches!(
            model.validate().unwrap_err(),
            SoftbodyError::InvalidConstraint(_)
        ));
    }

    #[test]
    fn test_collision_lists_reject_static_nodes() {
        let base = || {
            let mut b = FeModelBuilder::new();
            b.add_static_node(Vector3::zeros());
            b.add_dynamic_node(Vector3::new(0.0, 0.0, -10.0), 1.0);
            b
        };

        let mut b = base();
        b.add_world_collision(&[1, 0], 1.0, 0.0);
        assert!(matches!(b.build().unwrap_err(), SoftbodyError::InvalidTopology(_)));

        let mut b = base();
        b.add_collision_plane(0, 0, Vector3::z(), 0.0);
        assert!(matches!(b.build().unwrap_err(), SoftbodyError::InvalidTopology(_)));

        let mut b = base();
        b.add_inclusive_sphere(0, 0, Vector3::zeros(), 5.0);
        assert!(matches!(b.build().unwrap_err(), SoftbodyError::InvalidTopology(_)));

        let mut b = base();
        b.add_exclusive_sphere(0, 0, Vector3::zeros(), 5.0);
        assert!(matches!(b.build().unwrap_err(), SoftbodyError::InvalidTopology(_)));

        let mut b = base();
        b.add_world_collision(&[1], 1.0, 0.0)
            .add_collision_plane(0, 1, Vector3::z(), 0.0)
            .add_exclusive_sphere(0, 1, Vector3::zeros(), 5.0);
        let model = b.build().unwrap();
        assert_eq!(model.world_collision_nodes, vec![1]);
    }
}
