//! Step stages shared by the simulation strategies.
//!
//! The inertial stages run as integrate, predict, animation attraction, collide,
//! constraint iteration and post. The legacy S1 stages replace everything before
//! collision with an explicit velocity integrator.

use nalgebra::Vector3;

use super::SoftbodyInstance;
use crate::config::DEFAULT_GRAVITY;
use crate::fit::{feedback_fit_transforms, fit_centers};
use crate::forces::{
    apply_node_air_drag, apply_quad_air_drag, apply_wind, integrate_springs,
    smooth_quad_velocities, smooth_rod_velocities,
};
use crate::relax::{relax_bends, relax_quads, relax_rods, relax_rods_ftl, relax_tris};
use crate::relax_simd::{relax_quads_simd, relax_rods_ftl_simd, relax_rods_simd, relax_tris_simd};
use crate::types::FeFlags;

/// Prediction never extrapolates from a previous step shorter than this share of `dt`.
const MIN_PREV_DT_RATIO: f64 = 0.25;

/// Rod relaxation is skipped at or below this per-iteration stiffness.
const MIN_ROD_STIFFNESS: f64 = 0.01;

/// Cap on the share of a constraint correction kept as velocity with a stretch force.
const MAX_STRETCH_VELOCITY: f64 = 0.95;

/// Exclusive sphere contacts closer than this (squared) to the center are pushed up.
const EXCLUSIVE_COINCIDENT_SQ: f64 = 1e-4;

impl SoftbodyInstance {
    /// Velocity-level forces: springs, wind, air drag and velocity smoothing.
    pub(crate) fn integrate(&mut self, dt: f64) {
        let model = &*self.model;
        let config = &self.config;

        if config.enable_springs && !model.springs.is_empty() {
            integrate_springs(
                model,
                &mut self.pos0,
                &self.pos1,
                dt,
                config.constraint_scale(),
            );
        }

        let windage = config.windage * self.environment.windage_multiplier;
        if windage > 0.0 {
            apply_wind(
                model,
                &mut self.pos1,
                &self.environment.wind,
                windage,
                config.wind_drag,
                dt,
            );
        }

        if config.exp_air_drag + config.vel_air_drag != 0.0 {
            apply_node_air_drag(
                &mut self.pos0,
                &self.pos1,
                model.static_node_count,
                config.vel_air_drag,
                config.exp_air_drag,
                dt,
            );
        }
        if config.exp_quad_air_drag + config.vel_quad_air_drag != 0.0 {
            apply_quad_air_drag(
                model,
                &mut self.pos0,
                &self.pos1,
                config.vel_quad_air_drag,
                config.exp_quad_air_drag,
                dt,
            );
        }

        if config.quad_velocity_smooth_rate > 0.0 {
            for _ in 0..config.quad_velocity_smooth_iterations {
                smooth_quad_velocities(
                    model,
                    &mut self.pos0,
                    &self.pos1,
                    config.quad_velocity_smooth_rate,
                );
            }
        }
        if config.rod_velocity_smooth_rate > 0.0 {
            for _ in 0..config.rod_velocity_smooth_iterations {
                smooth_rod_velocities(
                    model,
                    &mut self.pos0,
                    &self.pos1,
                    config.rod_velocity_smooth_rate,
                );
            }
        }
    }

    /// Verlet prediction of the next positions; swaps the position buffers.
    pub(crate) fn predict(&mut self, dt: f64) {
        let model = &*self.model;
        let config = &self.config;
        let statics = model.static_node_count;
        let ts = (1.0 - config.velocity_damping) * (1.0 + config.over_predict) * dt
            / (MIN_PREV_DT_RATIO * dt).max(self.last_dt);

        if self.anim_transform_changed {
            for node in 0..statics {
                self.pos0[node] = self.anim[model.node_to_ctrl(node)].translation.vector;
            }
            self.anim_transform_changed = false;
        } else {
            let (pos0, pos1) = (&mut self.pos0[..statics], &self.pos1[..statics]);
            pos0.copy_from_slice(pos1);
        }

        if config.enable_follow_nodes {
            for follow in &model.follow_nodes {
                let delta = (self.pos1[follow.parent] - self.pos0[follow.parent]) * (ts * follow.weight);
                self.pos1[follow.child] += delta;
                self.pos0[follow.child] += delta;
            }
        }

        for (dyn_node, stuck) in self.sticky.iter_mut().enumerate() {
            if !std::mem::take(stuck) {
                continue;
            }
            let glue = &self.glue[dyn_node];
            let [p0, p1] = glue.parent;
            let mut delta = self.pos1[p0] - self.pos0[p0];
            if glue.weight1 > 0.0 {
                let delta1 = self.pos1[p1] - self.pos0[p1];
                delta = delta * (1.0 - glue.weight1) + delta1 * glue.weight1;
            }
            delta *= ts * glue.stickiness;
            self.pos1[statics + dyn_node] += delta;
            self.pos0[statics + dyn_node] += delta;
        }

        let grav_step = -self.effective_gravity_scale() * dt * dt;
        if model.node_integrators.is_empty() {
            let g = self.environment.gravity * -grav_step;
            for node in statics..model.node_count {
                let p1 = self.pos1[node];
                self.pos0[node] = p1 + (p1 - self.pos0[node]) * ts + g;
            }
        } else {
            let damped = config.damping_multiplier > 0.0
                && model.flags.contains(FeFlags::HAS_NODE_DAMPING);
            for node in statics..model.node_count {
                let integrator = &model.node_integrators[node];
                let damp = if damped {
                    (1.0 - integrator.point_damping * dt * config.damping_multiplier).max(0.0)
                } else {
                    1.0
                };
                let g = Vector3::new(0.0, 0.0, integrator.gravity * grav_step);
                let p1 = self.pos1[node];
                self.pos0[node] = p1 + (p1 - self.pos0[node]) * (ts * damp) + g;
            }
        }

        std::mem::swap(&mut self.pos0, &mut self.pos1);
        self.last_dt = dt;
    }

    /// Pull dynamic nodes toward their animated positions.
    pub(crate) fn add_animation_attraction(&mut self, dt: f64) {
        let model = &*self.model;
        let attraction = FeFlags::HAS_ANIMATION_FORCE_ATTRACTION
            | FeFlags::HAS_ANIMATION_VERTEX_ATTRACTION;
        if !self.config.enable_anim_attraction
            || model.node_integrators.is_empty()
            || !model.flags.intersects(attraction)
        {
            return;
        }
        for node in model.static_node_count..model.node_count {
            let integrator = &model.node_integrators[node];
            let target = self.anim[model.node_to_ctrl(node)].translation.vector;
            let delta = target - self.pos1[node];
            let position = delta * (integrator.animation_vertex_attraction * dt).min(1.0);
            let velocity = delta * (integrator.animation_force_attraction * dt * 2.0);
            self.pos0[node] += position;
            self.pos1[node] += position + velocity;
        }
    }

    /// Relax every constraint `iterations` times, then drop the correction velocity of
    /// uninertial models.
    pub(crate) fn iterate_constraints(&mut self, iterations: u32) {
        let model = &*self.model;
        let config = &self.config;
        let scale = config.constraint_scale();
        let n = f64::from(iterations.max(1));
        let rod_stiffness = (-config.thread_stretch / n).exp();
        let surface_stiffness = (-config.surface_stretch / n).exp();

        let uninertial = !model.legacy_stretch_force.is_empty() || model.is_uninertial();
        let before = uninertial.then(|| self.pos1.clone());

        let pos = &mut self.pos1[..];
        for iteration in 0..iterations {
            if rod_stiffness > MIN_ROD_STIFFNESS {
                let ftl = config.enable_ftl && iteration + 1 == iterations;
                match (config.enable_simd, ftl) {
                    (true, true) => relax_rods_ftl_simd(model, pos, rod_stiffness, scale),
                    (true, false) => relax_rods_simd(model, pos, rod_stiffness, scale),
                    (false, true) => relax_rods_ftl(model, pos, rod_stiffness, scale),
                    (false, false) => relax_rods(model, pos, rod_stiffness, scale),
                }
            }
            relax_bends(model, pos, rod_stiffness);
            if config.enable_simd {
                relax_quads_simd(model, pos, surface_stiffness, scale);
                relax_tris_simd(model, pos, scale);
            } else {
                relax_quads(model, pos, surface_stiffness, scale);
                relax_tris(model, pos, scale);
            }
        }

        let Some(before) = before else {
            return;
        };
        let statics = model.static_node_count;
        let (pos0, pos1) = (&mut self.pos0[..statics], &self.pos1[..statics]);
        pos0.copy_from_slice(pos1);
        for node in statics..model.node_count {
            let correction = self.pos1[node] - before[node];
            let keep = model.legacy_stretch_force.get(node).map_or(1.0, |force| {
                (1.0 - force * self.last_dt).clamp(0.0, MAX_STRETCH_VELOCITY)
            });
            self.pos0[node] += correction * keep;
        }
    }

    /// Under-relaxation, ctrl-attached shapes, ground and fit matrices.
    pub(crate) fn post(&mut self) {
        let model = &*self.model;
        let config = &self.config;
        let statics = model.static_node_count;

        if config.over_predict != 0.0 || config.step_under_relax != 0.0 {
            let w1 = (-config.step_under_relax).exp() / (1.0 + config.over_predict);
            for node in statics..model.node_count {
                self.pos1[node] = self.pos0[node].lerp(&self.pos1[node], w1);
            }
        }

        let [spheres, inclusive] = model.collision_sphere_counts;
        if config.enable_inclusive_spheres {
            for sphere in &model.collision_spheres[..inclusive] {
                let anim = &self.anim[sphere.ctrl_parent];
                let pos = &mut self.pos1[sphere.child_node];
                let local = anim.inverse_transform_vector(&(*pos - anim.translation.vector))
                    - sphere.origin;
                let iso = local.norm_squared() * sphere.r_factor;
                if iso > 1.0 {
                    *pos = anim.transform_point(&(local / iso.sqrt() + sphere.origin).into()).coords;
                }
            }
        }
        if config.enable_exclusive_spheres {
            for sphere in &model.collision_spheres[inclusive..spheres] {
                let anim = &self.anim[sphere.ctrl_parent];
                let pos = &mut self.pos1[sphere.child_node];
                let local = anim.inverse_transform_vector(&(*pos - anim.translation.vector))
                    - sphere.origin;
                let dist_sq = local.norm_squared();
                if dist_sq < sphere.r_factor * sphere.r_factor {
                    let surface = if dist_sq < EXCLUSIVE_COINCIDENT_SQ {
                        Vector3::new(0.0, 0.0, sphere.r_factor)
                    } else {
                        local * (sphere.r_factor / dist_sq.sqrt())
                    };
                    *pos = anim.transform_point(&(surface + sphere.origin).into()).coords;
                }
            }
        }
        if config.enable_planes {
            for plane in &model.collision_planes {
                let anim = &self.anim[plane.ctrl_parent];
                let normal = anim.rotation * plane.normal;
                let pos = &mut self.pos1[plane.child_node];
                let dist = (*pos - anim.translation.vector).dot(&normal) - plane.offset;
                if dist < 0.0 {
                    *pos -= normal * dist;
                }
            }
        }

        if config.enable_ground {
            let ground = config.ground_height;
            for params in &model.world_collision_params {
                for &node in &model.world_collision_nodes[params.list_begin..params.list_end] {
                    let p1 = &mut self.pos1[node];
                    if p1.z >= ground {
                        continue;
                    }
                    p1.z = ground;
                    let go_z = params.world_friction;
                    let go_xy = (1.0 - params.ground_friction) * go_z;
                    let p1 = *p1;
                    let p0 = &mut self.pos0[node];
                    p0.x = p0.x * go_xy + p1.x * (1.0 - go_xy);
                    p0.y = p0.y * go_xy + p1.y * (1.0 - go_xy);
                    p0.z = p0.z * go_z + p1.z * (1.0 - go_z);
                }
            }
        }

        fit_centers(model, &mut self.pos1);
        if config.volumetric_solve_amount > 0.0 {
            feedback_fit_transforms(
                model,
                &mut self.pos1,
                &self.anim,
                config.volumetric_solve_amount,
            );
        }
    }

    /// Explicit integration of the legacy numerics.
    ///
    /// Leaves the node velocities in `pos0` until
    /// [`resolve_anim_attraction_s1`](Self::resolve_anim_attraction_s1) restores it.
    pub(crate) fn integrate_s1(&mut self, dt: f64) {
        let model = &*self.model;
        let statics = model.static_node_count;

        if self.anim_transform_changed {
            for node in 0..statics {
                self.pos0[node] = self.pos1[node];
                self.pos1[node] = self.anim[model.node_to_ctrl(node)].translation.vector;
            }
            self.anim_transform_changed = false;
            if self.config.enable_follow_nodes {
                for follow in &model.follow_nodes {
                    let delta = (self.pos1[follow.parent] - self.pos0[follow.parent]) * follow.weight;
                    self.pos1[follow.child] += delta;
                    self.pos0[follow.child] += delta;
                }
            }
        } else {
            let (pos0, pos1) = (&mut self.pos0[..statics], &self.pos1[..statics]);
            pos0.copy_from_slice(pos1);
        }

        let gravity = Vector3::new(
            0.0,
            0.0,
            if self.gravity_disabled {
                0.0
            } else {
                -self.config.gravity_scale
            },
        );
        for node in statics..model.node_count {
            let origin = self.pos1[node];
            let mut velocity = (origin - self.pos0[node]) / self.last_dt;
            let inv_mass = model.node_inv_masses[node];
            let force = match model.node_integrators.get(node) {
                Some(integrator) => {
                    let target = self.anim[model.node_to_ctrl(node)].translation.vector;
                    gravity * (integrator.gravity / inv_mass)
                        + (target - origin)
                            * (integrator.animation_force_attraction / inv_mass * 2.0 / dt)
                        - velocity * (integrator.point_damping / inv_mass)
                }
                None => gravity * (DEFAULT_GRAVITY / inv_mass),
            };
            velocity += force * (dt * inv_mass);
            self.pos1[node] = origin + velocity * dt;
            self.pos0[node] = velocity;
        }
        self.last_dt = dt;
    }

    /// Legacy stretch resolution: over-long rods pull one endpoint, then bends and
    /// surface elements relax once.
    pub(crate) fn resolve_stretch_s1(&mut self) {
        let model = &*self.model;
        let config = &self.config;
        let scale = config.constraint_scale();
        let statics = model.static_node_count;
        let stretch_force = &model.legacy_stretch_force;

        for rod in &model.rods {
            let [n0, n1] = rod.nodes;
            let d = self.pos1[n0] - self.pos1[n1];
            let dist = d.norm();
            let rest = rod.max_dist * scale;
            if dist <= rest {
                continue;
            }
            let dd = d / dist * ((dist - rest) * rod.relaxation_factor);
            if (n0 <= n1 || n0 < statics) && n1 >= statics {
                self.pos1[n1] += dd;
                if let Some(force) = stretch_force.get(n1) {
                    self.pos0[n1] += dd * *force;
                }
            } else if n0 >= statics {
                self.pos1[n0] -= dd;
                if let Some(force) = stretch_force.get(n0) {
                    self.pos0[n0] -= dd * *force;
                }
            }
        }

        let rod_stiffness = (-config.thread_stretch).exp();
        let surface_stiffness = (-config.surface_stretch).exp();
        let pos = &mut self.pos1[..];
        relax_bends(model, pos, rod_stiffness);
        if config.enable_simd {
            relax_quads_simd(model, pos, surface_stiffness, scale);
            relax_tris_simd(model, pos, scale);
        } else {
            relax_quads(model, pos, surface_stiffness, scale);
            relax_tris(model, pos, scale);
        }
    }

    /// Legacy vertex attraction, then turn the stored velocities back into positions.
    pub(crate) fn resolve_anim_attraction_s1(&mut self, dt: f64) {
        let model = &*self.model;
        let statics = model.static_node_count;
        if !model.node_integrators.is_empty() {
            for node in statics..model.node_count {
                let target = self.anim[model.node_to_ctrl(node)].translation.vector;
                let attraction = model.node_integrators[node].animation_vertex_attraction * dt;
                let current = self.pos1[node];
                self.pos1[node] += (target - current) * attraction;
            }
        }
        for node in statics..model.node_count {
            self.pos0[node] = self.pos1[node] - self.pos0[node] * dt;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::builder::FeModelBuilder;
    use crate::config::DEFAULT_TIMESTEP;
    use crate::model::FeModel;
    use approx::assert_relative_eq;

    fn free_node() -> Arc<FeModel> {
        let mut b = FeModelBuilder::new();
        b.add_static_node(Vector3::zeros());
        b.add_dynamic_node(Vector3::new(0.0, 0.0, 100.0), 1.0);
        Arc::new(b.build().unwrap())
    }

    #[test]
    fn test_predict_applies_environment_gravity() {
        let mut body = SoftbodyInstance::new(free_node());
        let dt = DEFAULT_TIMESTEP;
        body.predict(dt);
        let expected = 100.0 - DEFAULT_GRAVITY * dt * dt;
        assert_relative_eq!(body.pos1[1].z, expected, epsilon = 1e-12);
        assert_relative_eq!(body.pos0[1].z, 100.0);
    }

    #[test]
    fn test_predict_keeps_velocity() {
        let mut body = SoftbodyInstance::new(free_node());
        body.set_gravity_disabled(true);
        body.pos0[1] = Vector3::new(-1.0, 0.0, 100.0);
        body.predict(DEFAULT_TIMESTEP);
        assert_relative_eq!(body.pos1[1], Vector3::new(1.0, 0.0, 100.0), epsilon = 1e-12);
    }

    #[test]
    fn test_predict_copies_changed_animation_into_statics() {
        let mut body = SoftbodyInstance::new(free_node());
        body.set_animated_transform(0, crate::types::Transform::translation(5.0, 0.0, 0.0))
            .unwrap();
        body.predict(DEFAULT_TIMESTEP);
        assert_relative_eq!(body.pos1[0], Vector3::new(5.0, 0.0, 0.0));
        assert!(!body.anim_transform_changed);
    }

    #[test]
    fn test_under_relax_blends_toward_previous() {
        let mut body = SoftbodyInstance::new(free_node());
        body.config.step_under_relax = 2f64.ln();
        body.pos0[1] = Vector3::zeros();
        body.pos1[1] = Vector3::new(2.0, 0.0, 0.0);
        body.post();
        assert_relative_eq!(body.pos1[1], Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_drop_step_without_stretch_force_keeps_correction() {
        let mut b = FeModelBuilder::new();
        let a = b.add_static_node(Vector3::zeros());
        let c = b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
        b.add_rod(a, c).set_uninertial(true);
        let mut body = SoftbodyInstance::new(Arc::new(b.build().unwrap()));
        body.pos1[1] = Vector3::new(15.0, 0.0, 0.0);
        body.pos0[1] = Vector3::new(15.0, 0.0, 0.0);
        body.iterate_constraints(1);
        assert_relative_eq!(body.pos1[1].x, 10.0, epsilon = 1e-9);
        assert_relative_eq!(body.pos0[1].x, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_s1_free_fall_matches_explicit_euler() {
        let mut body = SoftbodyInstance::new(free_node());
        let dt = DEFAULT_TIMESTEP;
        body.integrate_s1(dt);
        body.resolve_stretch_s1();
        body.resolve_anim_attraction_s1(dt);
        let v = -DEFAULT_GRAVITY * dt;
        assert_relative_eq!(body.pos1[1].z, 100.0 + v * dt, epsilon = 1e-12);
        assert_relative_eq!(body.pos0[1].z, 100.0, epsilon = 1e-12);
    }
}
