//! Collision of dynamic nodes with model-attached primitives and world shapes.

use nalgebra::Vector3;

use super::{ParticleGlue, SoftbodyInstance};
use crate::collision::{
    GLUE_THRESHOLD, STICKY_DISTANCE, TaperedCapsule, project_out_of_capsule, project_out_of_hull,
    project_out_of_sphere, project_out_of_triangle,
};
use crate::types::{Aabb, WorldShapeMask};
use crate::world::{WorldCollision, WorldShape, triangle_bounds};

/// Geometry of a primitive built from model shapes for one collision pass.
#[derive(Debug, Clone, Copy)]
enum RigidShape {
    Sphere { center: Vector3<f64>, radius: f64 },
    Capsule(TaperedCapsule),
}

/// A model-attached collision primitive, posed for the current step.
#[derive(Debug, Clone, Copy)]
struct RigidPrimitive {
    shape: RigidShape,
    mask: u16,
    stickiness: f64,
    /// Nodes a glued node follows.
    parents: [usize; 2],
}

impl RigidPrimitive {
    fn sphere(center: Vector3<f64>, radius: f64, mask: u16, stickiness: f64, node: usize) -> Self {
        Self {
            shape: RigidShape::Sphere { center, radius },
            mask,
            stickiness,
            parents: [node, node],
        }
    }

    /// Capsule between two end spheres; a capsule whose first sphere barely sticks out
    /// collapses to its second sphere.
    fn capsule(capsule: TaperedCapsule, mask: u16, stickiness: f64, parents: [usize; 2]) -> Self {
        if capsule.is_degenerate() {
            return Self::sphere(
                capsule.centers[1],
                capsule.radii[1],
                mask,
                stickiness,
                parents[1],
            );
        }
        Self {
            shape: RigidShape::Capsule(capsule),
            mask,
            stickiness,
            parents,
        }
    }

    fn is_sticky(&self) -> bool {
        self.stickiness > GLUE_THRESHOLD
    }

    fn aabb(&self) -> Aabb {
        let margin = if self.is_sticky() { STICKY_DISTANCE } else { 0.0 };
        match self.shape {
            RigidShape::Sphere { center, radius } => Aabb::from_sphere(&center, radius + margin),
            RigidShape::Capsule(capsule) => capsule.aabb(margin),
        }
    }

    /// Push `p` out; returns the stickiness picked up and the blend toward `parents[1]`.
    fn project(&self, p: &mut Vector3<f64>, node_radius: f64) -> (f64, f64) {
        match self.shape {
            RigidShape::Sphere { center, radius } => {
                if self.is_sticky() {
                    let picked = crate::collision::project_out_of_sphere_sticky(
                        p,
                        &center,
                        radius + node_radius,
                        self.stickiness,
                    );
                    (picked, 0.0)
                } else {
                    project_out_of_sphere(p, &center, radius + node_radius);
                    (0.0, 0.0)
                }
            }
            RigidShape::Capsule(capsule) => {
                if self.is_sticky() {
                    capsule.project_sticky(p, node_radius, self.stickiness)
                } else {
                    capsule.project(p, node_radius);
                    (0.0, 0.0)
                }
            }
        }
    }
}

impl SoftbodyInstance {
    /// Refit the collision tree, then collide with rigid primitives and `world`.
    pub(crate) fn collide<W: WorldCollision>(&mut self, world: Option<&W>) {
        if self.aabbs.is_empty() {
            return;
        }
        let model = &*self.model;
        let scale = self.config.model_scale;
        model.tree.compute_bounds(
            &mut self.aabbs,
            &self.pos1[model.static_node_count..],
            &model.node_collision_radii,
            scale,
        );

        let primitives = self.rigid_primitives();
        let mut hits = Vec::new();
        for primitive in &primitives {
            self.collide_rigid(primitive, &mut hits);
        }

        if let Some(world) = world {
            self.collide_world(world, &mut hits);
        }
    }

    /// Every rigid primitive of the model posed at the current positions, in collision order.
    fn rigid_primitives(&self) -> Vec<RigidPrimitive> {
        let model = &*self.model;
        let scale = self.config.model_scale;
        let mut primitives = Vec::with_capacity(
            model.tapered_capsule_stretches.len()
                + model.tapered_capsule_rigids.len()
                + model.sphere_rigids.len(),
        );

        for tc in model.tapered_capsule_stretches.iter().rev() {
            let [n0, n1] = tc.nodes;
            if n0 == n1 {
                primitives.push(RigidPrimitive::sphere(
                    self.pos1[n1],
                    tc.radii[1] * scale,
                    tc.collision_mask,
                    tc.stickiness,
                    n1,
                ));
            } else {
                let capsule = TaperedCapsule::new(
                    [self.pos1[n0], self.pos1[n1]],
                    [tc.radii[0] * scale, tc.radii[1] * scale],
                );
                primitives.push(RigidPrimitive::capsule(
                    capsule,
                    tc.collision_mask,
                    tc.stickiness,
                    [n0, n1],
                ));
            }
        }

        for tc in model.tapered_capsule_rigids.iter().rev() {
            let tm = &self.anim[model.node_to_ctrl(tc.node)];
            let centers = tc
                .centers
                .map(|c| tm.transform_point(&(c * scale).into()).coords);
            let capsule = TaperedCapsule::new(centers, [tc.radii[0] * scale, tc.radii[1] * scale]);
            primitives.push(RigidPrimitive::capsule(
                capsule,
                tc.collision_mask,
                tc.stickiness,
                [tc.node, tc.node],
            ));
        }

        for sr in model.sphere_rigids.iter().rev() {
            let tm = &self.anim[model.node_to_ctrl(sr.node)];
            primitives.push(RigidPrimitive::sphere(
                tm.transform_point(&(sr.center * scale).into()).coords,
                sr.radius * scale,
                sr.collision_mask,
                sr.stickiness,
                sr.node,
            ));
        }
        primitives
    }

    fn collide_rigid(&mut self, primitive: &RigidPrimitive, hits: &mut Vec<usize>) {
        let model = &*self.model;
        let statics = model.static_node_count;
        let scale = self.config.model_scale;

        hits.clear();
        model
            .tree
            .cast_box::<false>(&self.aabbs, &primitive.aabb(), primitive.mask, |dyn_node| {
                hits.push(dyn_node);
            });

        for &dyn_node in hits.iter() {
            let node = statics + dyn_node;
            let node_radius = model
                .node_collision_radii
                .get(dyn_node)
                .map_or(0.0, |r| r * scale);
            let (picked, blend) = primitive.project(&mut self.pos1[node], node_radius);
            if picked > GLUE_THRESHOLD && dyn_node < self.glue.len() {
                self.glue[dyn_node] = ParticleGlue {
                    stickiness: picked,
                    weight1: blend,
                    parent: primitive.parents,
                };
                self.sticky[dyn_node] = true;
            }
        }
    }

    /// Push dynamic nodes out of the world shapes overlapping the collision tree.
    fn collide_world<W: WorldCollision>(&mut self, world: &W, hits: &mut Vec<usize>) {
        let enabled = self.world_shape_mask;
        if enabled.is_empty() {
            return;
        }
        let Some(root) = self.aabbs.last().copied() else {
            return;
        };
        let extra = self.config.add_world_collision_radius * self.config.model_scale;

        let mut handles = Vec::new();
        world.query_aabb(&root, &mut handles);
        for handle in handles {
            if !world.needs_contact_resolution(handle, self.collision_group) {
                continue;
            }
            match world.shape(handle) {
                WorldShape::Sphere { center, radius }
                    if enabled.contains(WorldShapeMask::SPHERE) =>
                {
                    let radius = radius + extra;
                    self.push_out_world(&Aabb::from_sphere(&center, radius), hits, |p, r| {
                        project_out_of_sphere(p, &center, radius + r);
                    });
                }
                WorldShape::Capsule { centers, radius }
                    if enabled.contains(WorldShapeMask::CAPSULE) =>
                {
                    let radius = radius + extra;
                    let mut aabb = Aabb::from_sphere(&centers[0], radius);
                    aabb.add_sphere(&centers[1], radius);
                    self.push_out_world(&aabb, hits, |p, r| {
                        project_out_of_capsule(p, &centers[0], &centers[1], radius + r);
                    });
                }
                WorldShape::Hull { faces } if enabled.contains(WorldShapeMask::HULL) => {
                    let Some(bounds) = triangle_bounds(&faces) else {
                        continue;
                    };
                    self.push_out_world(&bounds.expanded(extra), hits, |p, r| {
                        project_out_of_hull(p, &faces, extra + r);
                    });
                }
                WorldShape::Mesh { triangles } if enabled.contains(WorldShapeMask::MESH) => {
                    for tri in &triangles {
                        let Some(bounds) = triangle_bounds(std::slice::from_ref(tri)) else {
                            continue;
                        };
                        let bounds = bounds.expanded(extra);
                        if !bounds.overlaps(&root) {
                            continue;
                        }
                        self.push_out_world(&bounds, hits, |p, r| {
                            project_out_of_triangle(p, tri, extra + r);
                        });
                    }
                }
                _ => {}
            }
        }
    }

    /// Run `project` on every dynamic node whose bounds overlap `aabb`, passing the
    /// node's scaled collision radius.
    fn push_out_world(
        &mut self,
        aabb: &Aabb,
        hits: &mut Vec<usize>,
        mut project: impl FnMut(&mut Vector3<f64>, f64),
    ) {
        let model = &*self.model;
        let statics = model.static_node_count;
        let scale = self.config.model_scale;

        hits.clear();
        model
            .tree
            .cast_box::<true>(&self.aabbs, aabb, 0, |dyn_node| hits.push(dyn_node));
        for &dyn_node in hits.iter() {
            let node_radius = model
                .node_collision_radii
                .get(dyn_node)
                .map_or(0.0, |r| r * scale);
            project(&mut self.pos1[statics + dyn_node], node_radius);
        }
    }
}
