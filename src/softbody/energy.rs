//! Energy estimates for diagnostics.
//!
//! Elastic energy is measured as the work needed to move each element's nodes onto
//! the element's rest shape, so it is an estimate of the constraint error rather
//! than a conserved physical quantity.

use nalgebra::Vector3;

use super::SoftbodyInstance;
use crate::forces::integrate_springs;
use crate::relax::{relax_quad0, relax_quad1, relax_quad2, relax_rod_if_violated};
use crate::types::FeFlags;

/// Kinetic-style sum over `nodes` of `|scratch - pos|^2 / (2 inv_mass)`, restoring `scratch`.
fn displacement_energy(
    inv_masses: &[f64],
    nodes: &[usize],
    pos: &[Vector3<f64>],
    scratch: &mut [Vector3<f64>],
) -> f64 {
    let mut energy = 0.0;
    for &node in nodes {
        let inv_mass = inv_masses[node];
        if inv_mass > 0.0 {
            energy += (scratch[node] - pos[node]).norm_squared() * 0.5 / inv_mass;
        }
        scratch[node] = pos[node];
    }
    energy
}

impl SoftbodyInstance {
    /// Per-node damping factor applied to velocity-derived energies.
    fn energy_damping(&self, node: usize) -> f64 {
        let model = &*self.model;
        let damped = model.flags.intersects(
            FeFlags::HAS_NODE_DAMPING | FeFlags::HAS_ANIMATION_FORCE_ATTRACTION,
        );
        match model.node_integrators.get(node) {
            Some(integrator) if damped => {
                (1.0 - integrator.point_damping * self.last_dt * self.config.damping_multiplier)
                    .max(0.0)
            }
            _ => 1.0,
        }
    }

    /// Energy stored in violated rods, quads and springs.
    #[must_use]
    pub fn elastic_energy(&self) -> f64 {
        let model = &*self.model;
        let scale = self.config.constraint_scale();
        let dt = self.last_dt;
        let inv_masses = &model.node_inv_masses;
        let pos = &self.pos1;
        let mut scratch = pos.clone();

        let mut rods = 0.0;
        for rod in &model.rods {
            relax_rod_if_violated(rod, &mut scratch, scale);
            rods += displacement_energy(inv_masses, &rod.nodes, pos, &mut scratch);
        }

        let [all, one, two] = model.quad_counts;
        let mut quads = 0.0;
        for (index, quad) in model.quads[..all].iter().enumerate() {
            if index < two {
                relax_quad2(quad, &mut scratch, 1.0, scale);
            } else if index < one {
                relax_quad1(quad, &mut scratch, scale);
            } else {
                relax_quad0(quad, &mut scratch, 1.0, scale);
            }
            quads += displacement_energy(inv_masses, &quad.nodes, pos, &mut scratch);
        }

        let mut springs = 0.0;
        if !model.springs.is_empty() {
            let mut pos0 = self.pos0.clone();
            integrate_springs(model, &mut pos0, pos, dt, scale);
            for (node, (moved, old)) in pos0.iter().zip(&self.pos0).enumerate() {
                let inv_mass = inv_masses[node];
                if inv_mass > 0.0 {
                    springs += (moved - old).norm_squared() / (inv_mass * dt);
                }
            }
        }

        (rods + quads) / (dt * dt) + springs
    }

    /// Gravitational potential energy of the dynamic nodes, zero at `z = 0`.
    #[must_use]
    pub fn potential_energy(&self) -> f64 {
        let model = &*self.model;
        let scale = self.effective_gravity_scale();
        (model.static_node_count..model.node_count)
            .map(|node| {
                let gravity = match model.node_integrators.get(node) {
                    Some(integrator) => integrator.gravity,
                    None => -self.environment.gravity.z,
                };
                self.pos1[node].z * self.energy_damping(node) * gravity * scale
                    / model.node_inv_masses[node]
            })
            .sum()
    }

    /// Kinetic energy of the dynamic nodes, from the last step's displacement.
    #[must_use]
    pub fn kinetic_energy(&self) -> f64 {
        let model = &*self.model;
        (model.static_node_count..model.node_count)
            .map(|node| {
                let velocity =
                    (self.pos1[node] - self.pos0[node]) * self.energy_damping(node) / self.last_dt;
                velocity.norm_squared() * 0.5 / model.node_inv_masses[node]
            })
            .sum()
    }

    /// Sum of elastic, potential and kinetic energy.
    #[must_use]
    pub fn total_energy(&self) -> f64 {
        self.elastic_energy() + self.potential_energy() + self.kinetic_energy()
    }
}
