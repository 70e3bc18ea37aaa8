//! Step pipelines.
//!
//! A strategy runs one full simulation step on an instance. Models flagged with
//! uninertial constraints use the legacy S1 numerics; every other model uses the
//! inertial Verlet pipeline.

use super::SoftbodyInstance;
use crate::world::WorldCollision;

/// A step pipeline.
pub trait SimulationStrategy {
    /// Advance `body` by `dt` with `iterations` relaxation passes.
    fn simulate<W: WorldCollision>(
        &self,
        body: &mut SoftbodyInstance,
        iterations: u32,
        dt: f64,
        world: Option<&W>,
    );
}

/// Verlet integration with forces, animation attraction and iterative relaxation.
#[derive(Debug, Clone, Copy, Default)]
pub struct InertialStrategy;

impl SimulationStrategy for InertialStrategy {
    fn simulate<W: WorldCollision>(
        &self,
        body: &mut SoftbodyInstance,
        iterations: u32,
        dt: f64,
        world: Option<&W>,
    ) {
        body.integrate(dt);
        body.predict(dt);
        body.add_animation_attraction(dt);
        body.collide(world);
        body.iterate_constraints(iterations);
        body.post();
    }
}

/// Legacy numerics: a single stretch pass and direct animation attraction.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyS1Strategy;

impl SimulationStrategy for LegacyS1Strategy {
    fn simulate<W: WorldCollision>(
        &self,
        body: &mut SoftbodyInstance,
        _iterations: u32,
        dt: f64,
        world: Option<&W>,
    ) {
        body.integrate_s1(dt);
        body.resolve_stretch_s1();
        body.resolve_anim_attraction_s1(dt);
        body.collide(world);
        body.post();
    }
}
