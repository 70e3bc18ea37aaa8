//! Simulation instance of a soft body.
//!
//! A [`SoftbodyInstance`] owns the per-instance state (node positions, ctrl transforms,
//! collision bounds and glue) of one soft body and shares its [`FeModel`] with every
//! other instance of the same asset. The driver feeds animated transforms in, steps the
//! simulation, and filters the simulated transforms back out.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use fe_softbody::{FeModelBuilder, SoftbodyInstance};
//! use nalgebra::Vector3;
//!
//! let mut builder = FeModelBuilder::new();
//! let anchor = builder.add_static_node(Vector3::zeros());
//! let tip = builder.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
//! builder.add_rod(anchor, tip);
//! let model = Arc::new(builder.build().unwrap());
//!
//! let mut body = SoftbodyInstance::new(model);
//! body.go_wakeup();
//! body.activate();
//! assert!(body.step(4, 1.0 / 60.0));
//! ```

mod collide;
mod energy;
mod pipeline;
mod replace;
mod strategy;
mod transforms;

pub use strategy::{InertialStrategy, LegacyS1Strategy, SimulationStrategy};

use std::sync::Arc;

use nalgebra::Vector3;
use tracing::trace;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::activity::{Activity, ActivityState};
use crate::config::{DEFAULT_TIMESTEP, Environment, SoftbodyConfig};
use crate::error::{Result, SoftbodyError, check_index};
use crate::model::FeModel;
use crate::types::{Aabb, FeFlags, SoftbodyId, Transform, WorldShapeMask, next_softbody_id};
use crate::world::{ShapeList, WorldCollision};

/// Steps shorter than this are ignored.
pub const MIN_TIMESTEP: f64 = 1e-5;

/// Adhesion of a dynamic node to one or two parent nodes, valid for one prediction.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParticleGlue {
    /// Fraction of the parents' motion the node inherits.
    pub stickiness: f64,
    /// Blend between the two parents: 0 follows `parent[0]`, 1 follows `parent[1]`.
    pub weight1: f64,
    /// Parent nodes.
    pub parent: [usize; 2],
}

/// Statistics from the last step.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftbodyStats {
    /// Steps simulated since creation.
    pub steps: u64,
    /// Constraint iterations requested by the last step.
    pub iterations: u32,
    /// Nodes glued to a sticky primitive by the last collision pass.
    pub glued_nodes: usize,
}

/// One simulated soft body.
#[derive(Debug, Clone)]
pub struct SoftbodyInstance {
    id: SoftbodyId,
    model: Arc<FeModel>,

    pos0: Vec<Vector3<f64>>,
    pos1: Vec<Vector3<f64>>,
    anim: Vec<Transform>,
    sim: Vec<Transform>,

    aabbs: Vec<Aabb>,
    glue: Vec<ParticleGlue>,
    sticky: Vec<bool>,

    activity: Activity,
    config: SoftbodyConfig,
    environment: Environment,

    anim_transform_changed: bool,
    sim_transforms_outdated: bool,
    frozen: bool,
    gravity_disabled: bool,

    last_dt: f64,
    world_shape_mask: WorldShapeMask,
    collision_group: u16,
    stats: SoftbodyStats,
}

impl SoftbodyInstance {
    /// Instance of `model` in its rest pose, configured from the model's defaults.
    ///
    /// The instance starts dormant.
    #[must_use]
    pub fn new(model: Arc<FeModel>) -> Self {
        let mut config = SoftbodyConfig::from_defaults(&model.defaults);
        config.enable_ftl = model.flags.contains(FeFlags::ENABLE_FTL);
        let mut body = Self {
            id: next_softbody_id(),
            world_shape_mask: model.flags.world_shape_mask(),
            model,
            pos0: Vec::new(),
            pos1: Vec::new(),
            anim: Vec::new(),
            sim: Vec::new(),
            aabbs: Vec::new(),
            glue: Vec::new(),
            sticky: Vec::new(),
            activity: Activity::new(),
            config,
            environment: Environment::default(),
            anim_transform_changed: false,
            sim_transforms_outdated: false,
            frozen: false,
            gravity_disabled: false,
            last_dt: DEFAULT_TIMESTEP,
            collision_group: u16::MAX,
            stats: SoftbodyStats::default(),
        };
        body.init_state();
        body
    }

    /// Instance with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SoftbodyError::InvalidConfig`] if the config fails validation.
    pub fn with_config(model: Arc<FeModel>, config: SoftbodyConfig) -> Result<Self> {
        config.validate()?;
        let mut body = Self::new(model);
        body.config = config;
        Ok(body)
    }

    /// Size every per-instance buffer for the current model and load its rest pose.
    fn init_state(&mut self) {
        let model = Arc::clone(&self.model);
        let dynamic = model.dynamic_node_count();

        self.anim = if model.init_pose.is_empty() {
            vec![Transform::identity(); model.ctrl_count]
        } else {
            model.init_pose.clone()
        };
        self.sim = self.anim.clone();
        self.pos1 = (0..model.node_count)
            .map(|node| {
                self.anim
                    .get(model.node_to_ctrl(node))
                    .map_or_else(Vector3::zeros, |tm| tm.translation.vector)
            })
            .collect();
        self.pos0 = self.pos1.clone();

        let clusters = if model.has_tree_collision() {
            dynamic.saturating_sub(1)
        } else {
            0
        };
        self.aabbs = vec![Aabb::empty(); clusters];
        let glued = if model.has_glue() { dynamic } else { 0 };
        self.glue = vec![ParticleGlue::default(); glued];
        self.sticky = vec![false; glued];
        self.world_shape_mask = model.flags.world_shape_mask();
        self.sim_transforms_outdated = true;
    }

    /// Unique id of this instance.
    #[must_use]
    pub const fn id(&self) -> SoftbodyId {
        self.id
    }

    /// The shared model.
    #[must_use]
    pub fn model(&self) -> &Arc<FeModel> {
        &self.model
    }

    /// Runtime tunables.
    #[must_use]
    pub const fn config(&self) -> &SoftbodyConfig {
        &self.config
    }

    /// Replace the runtime tunables.
    ///
    /// # Errors
    ///
    /// Returns [`SoftbodyError::InvalidConfig`] if the config fails validation.
    pub fn set_config(&mut self, config: SoftbodyConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Gravity and wind.
    #[must_use]
    pub const fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Set gravity and wind.
    pub fn set_environment(&mut self, environment: Environment) {
        self.environment = environment;
    }

    /// Statistics from the last step.
    #[must_use]
    pub const fn stats(&self) -> &SoftbodyStats {
        &self.stats
    }

    /// Current node positions.
    #[must_use]
    pub fn node_positions(&self) -> &[Vector3<f64>] {
        &self.pos1
    }

    /// Node positions at the previous step.
    #[must_use]
    pub fn previous_node_positions(&self) -> &[Vector3<f64>] {
        &self.pos0
    }

    /// Velocity of a node over the last step, or `None` if out of range.
    #[must_use]
    pub fn node_velocity(&self, node: usize) -> Option<Vector3<f64>> {
        Some((self.pos1.get(node)? - self.pos0.get(node)?) / self.last_dt)
    }

    /// Teleport every node, with zero velocity.
    ///
    /// # Errors
    ///
    /// Returns [`SoftbodyError::ModelMismatch`] if `positions` is not one per node.
    pub fn set_node_positions(&mut self, positions: &[Vector3<f64>]) -> Result<()> {
        if positions.len() != self.pos1.len() {
            return Err(SoftbodyError::model_mismatch(format!(
                "{} positions for {} nodes",
                positions.len(),
                self.pos1.len()
            )));
        }
        self.pos1.copy_from_slice(positions);
        self.pos0.copy_from_slice(positions);
        self.sim_transforms_outdated = true;
        Ok(())
    }

    /// Animated (input) transforms, one per ctrl.
    #[must_use]
    pub fn anim_transforms(&self) -> &[Transform] {
        &self.anim
    }

    /// Simulated (output) transforms, one per ctrl.
    ///
    /// Only current after [`filter_transforms`](Self::filter_transforms) or
    /// [`compute_particle_transforms`](Self::compute_particle_transforms).
    #[must_use]
    pub fn sim_transforms(&self) -> &[Transform] {
        &self.sim
    }

    /// Collision tree cluster bounds from the last collision pass.
    #[must_use]
    pub fn cluster_bounds(&self) -> &[Aabb] {
        &self.aabbs
    }

    /// Glue record of dynamic node `dyn_node`, if it was glued by the last collision pass.
    #[must_use]
    pub fn glue(&self, dyn_node: usize) -> Option<&ParticleGlue> {
        self.sticky
            .get(dyn_node)
            .copied()
            .filter(|&stuck| stuck)
            .and_then(|_| self.glue.get(dyn_node))
    }

    /// Activity state.
    #[must_use]
    pub const fn activity_state(&self) -> ActivityState {
        self.activity.state()
    }

    /// Whether the instance simulates.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.activity.is_active()
    }

    /// Whether the instance is dormant.
    #[must_use]
    pub fn is_dormant(&self) -> bool {
        self.activity.is_dormant()
    }

    /// Start waking a dormant instance.
    pub fn go_wakeup(&mut self) {
        self.activity.go_wakeup();
    }

    /// Put the instance to sleep.
    pub fn go_dormant(&mut self) {
        self.activity.go_dormant();
    }

    /// Run the wake-up handshake to completion, making the instance active.
    pub fn activate(&mut self) {
        self.activity.go_wakeup();
        while !self.activity.before_filter_transforms() {}
    }

    /// Count a frame in which nobody consumed the transforms.
    pub fn advance_sleep_counter(&mut self) {
        self.activity
            .advance_sleep_counter(self.config.frames_before_dormant);
    }

    /// Whether stepping is suspended.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Suspend or resume stepping.
    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    /// Disable or enable gravity.
    pub fn set_gravity_disabled(&mut self, disabled: bool) {
        self.gravity_disabled = disabled;
    }

    /// World shape kinds this instance collides with.
    #[must_use]
    pub const fn world_shape_mask(&self) -> WorldShapeMask {
        self.world_shape_mask
    }

    /// Restrict world collision to the given shape kinds.
    pub fn set_world_shape_mask(&mut self, mask: WorldShapeMask) {
        self.world_shape_mask = mask;
    }

    /// Collision group passed to [`WorldCollision::needs_contact_resolution`].
    #[must_use]
    pub const fn collision_group(&self) -> u16 {
        self.collision_group
    }

    /// Set the collision group used for world queries.
    pub fn set_collision_group(&mut self, group: u16) {
        self.collision_group = group;
    }

    /// Timestep of the last simulated step.
    #[must_use]
    pub const fn last_dt(&self) -> f64 {
        self.last_dt
    }

    /// Effective gravity scale, 0 while gravity is disabled.
    #[must_use]
    pub fn effective_gravity_scale(&self) -> f64 {
        if self.gravity_disabled {
            0.0
        } else {
            self.config.gravity_scale * (1.0 + self.config.over_predict)
        }
    }

    /// Zero every node velocity.
    pub fn reset_velocities(&mut self) {
        self.pos0.copy_from_slice(&self.pos1);
    }

    /// Advance the simulation by `dt` without world collision.
    ///
    /// Returns whether a step was taken: frozen, inactive instances and steps shorter
    /// than [`MIN_TIMESTEP`] leave the state untouched.
    pub fn step(&mut self, iterations: u32, dt: f64) -> bool {
        self.step_with(iterations, dt, None::<&ShapeList>)
    }

    /// Advance the simulation by `dt`, colliding with `world`.
    pub fn step_in_world<W: WorldCollision>(
        &mut self,
        iterations: u32,
        dt: f64,
        world: &W,
    ) -> bool {
        self.step_with(iterations, dt, Some(world))
    }

    fn step_with<W: WorldCollision>(
        &mut self,
        iterations: u32,
        dt: f64,
        world: Option<&W>,
    ) -> bool {
        if self.frozen || !self.activity.is_active() || dt <= MIN_TIMESTEP {
            return false;
        }
        self.raw_simulate(iterations, dt, world);
        self.sim_transforms_outdated = true;
        self.stats.steps += 1;
        self.stats.iterations = iterations;
        self.stats.glued_nodes = self.sticky.iter().filter(|&&stuck| stuck).count();
        trace!(
            id = %self.id,
            steps = self.stats.steps,
            iterations,
            dt,
            glued = self.stats.glued_nodes,
            "softbody step"
        );
        true
    }

    /// One simulation step with no activity checks, dispatched on the model's numerics.
    pub fn raw_simulate<W: WorldCollision>(&mut self, iterations: u32, dt: f64, world: Option<&W>) {
        if self.model.is_uninertial() {
            LegacyS1Strategy.simulate(self, iterations, dt, world);
        } else {
            InertialStrategy.simulate(self, iterations, dt, world);
        }
    }

    /// Step twice from the same state and check both runs agree bit for bit.
    ///
    /// The instance is left in the state of the second run.
    pub fn validating_simulate(&mut self, iterations: u32, dt: f64) -> bool {
        let snapshot = self.clone();
        self.raw_simulate(iterations, dt, None::<&ShapeList>);
        let first = (self.pos0.clone(), self.pos1.clone());
        *self = snapshot;
        self.raw_simulate(iterations, dt, None::<&ShapeList>);
        let same = bitwise_eq(&first.0, &self.pos0) && bitwise_eq(&first.1, &self.pos1);
        debug_assert!(same, "soft body simulation is not deterministic");
        same
    }

    /// Set the animated transform of one ctrl.
    ///
    /// Ignored while dormant.
    ///
    /// # Errors
    ///
    /// Returns [`SoftbodyError::IndexOutOfBounds`] if `ctrl` is out of range.
    pub fn set_animated_transform(&mut self, ctrl: usize, tm: Transform) -> Result<()> {
        check_index("ctrl", ctrl, self.anim.len())?;
        if self.activity.is_dormant() {
            return Ok(());
        }
        self.anim[ctrl] = tm;
        self.anim_transform_changed = true;
        Ok(())
    }
}

fn bitwise_eq(a: &[Vector3<f64>], b: &[Vector3<f64>]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(p, q)| p.iter().zip(q.iter()).all(|(x, y)| x.to_bits() == y.to_bits()))
}
