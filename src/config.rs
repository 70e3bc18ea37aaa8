//! Runtime tunables for simulation instances.
//!
//! - [`SoftbodyConfig`] - Per-instance stretch, drag, damping and feature toggles
//! - [`FeModelDefaults`] - Per-model defaults copied into a config at instance creation
//! - [`Environment`] - World gravity and wind shared by instances

use nalgebra::{Vector3, Vector4};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, SoftbodyError};

/// Timestep assumed before the first step.
pub const DEFAULT_TIMESTEP: f64 = 1.0 / 60.0;

/// Default gravity, in model units per second squared, pointing down Z.
pub const DEFAULT_GRAVITY: f64 = 360.0;

/// Default length of the rope offset used for ctrl os-offsets.
pub const DEFAULT_ROPE_SIZE: f64 = 20.0;

/// Runtime tunables of a simulation instance.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SoftbodyConfig {
    /// Rod stretch. Per-iteration rod stiffness is `exp(-thread_stretch / iterations)`.
    pub thread_stretch: f64,
    /// Quad and tri stretch. Per-iteration stiffness is `exp(-surface_stretch / iterations)`.
    pub surface_stretch: f64,
    /// Gravity multiplier.
    pub gravity_scale: f64,

    /// Per-node drag proportional to speed.
    pub vel_air_drag: f64,
    /// Per-node exponential drag rate.
    pub exp_air_drag: f64,
    /// Quad normal drag proportional to speed.
    pub vel_quad_air_drag: f64,
    /// Quad normal exponential drag rate.
    pub exp_quad_air_drag: f64,
    /// Rod drag proportional to speed.
    pub vel_rod_air_drag: f64,
    /// Rod exponential drag rate.
    pub exp_rod_air_drag: f64,

    /// Blend rate of the quad velocity smoothing pass, in `[0, 1]`.
    pub quad_velocity_smooth_rate: f64,
    /// Blend rate of the rod velocity smoothing pass, in `[0, 1]`.
    pub rod_velocity_smooth_rate: f64,
    /// Number of quad velocity smoothing passes per step.
    pub quad_velocity_smooth_iterations: u32,
    /// Number of rod velocity smoothing passes per step.
    pub rod_velocity_smooth_iterations: u32,

    /// Stiffness of the volumetric feedback from fit matrices.
    pub volumetric_solve_amount: f64,
    /// Fraction of velocity removed each step.
    pub velocity_damping: f64,
    /// Extra prediction, compensated by the post-step blend.
    pub over_predict: f64,
    /// Under-relaxation of the final positions toward the previous ones.
    pub step_under_relax: f64,
    /// Multiplier on per-node point damping.
    pub damping_multiplier: f64,
    /// How strongly wind pushes quads.
    pub windage: f64,
    /// Tangential wind drag relative to the normal push.
    pub wind_drag: f64,
    /// Extra radius added to world spheres and capsules.
    pub add_world_collision_radius: f64,

    /// Uniform model scale applied to rest lengths and shapes.
    pub model_scale: f64,
    /// Additional scale applied to constraints only.
    pub cloth_scale: f64,
    /// Height of the ground plane.
    pub ground_height: f64,

    /// Frames without a filter call before the instance goes dormant.
    pub frames_before_dormant: u32,

    /// Use 4-wide batched relaxation.
    pub enable_simd: bool,
    /// Run the follow-the-leader rod pass on the last iteration.
    pub enable_ftl: bool,
    /// Integrate springs.
    pub enable_springs: bool,
    /// Attract dynamic nodes toward the animation.
    pub enable_anim_attraction: bool,
    /// Move follow nodes with their parents.
    pub enable_follow_nodes: bool,
    /// Clamp nodes inside inclusive collision spheres.
    pub enable_inclusive_spheres: bool,
    /// Push nodes out of exclusive collision spheres.
    pub enable_exclusive_spheres: bool,
    /// Push nodes out of collision planes.
    pub enable_planes: bool,
    /// Collide with the ground plane.
    pub enable_ground: bool,
}

impl Default for SoftbodyConfig {
    fn default() -> Self {
        Self::cloth()
    }
}

impl SoftbodyConfig {
    /// General-purpose cloth settings with no extra drag.
    #[must_use]
    pub const fn cloth() -> Self {
        Self {
            thread_stretch: 0.0,
            surface_stretch: 0.0,
            gravity_scale: 1.0,
            vel_air_drag: 0.0,
            exp_air_drag: 0.0,
            vel_quad_air_drag: 0.0,
            exp_quad_air_drag: 0.0,
            vel_rod_air_drag: 0.0,
            exp_rod_air_drag: 0.0,
            quad_velocity_smooth_rate: 0.0,
            rod_velocity_smooth_rate: 0.0,
            quad_velocity_smooth_iterations: 0,
            rod_velocity_smooth_iterations: 0,
            volumetric_solve_amount: 0.0,
            velocity_damping: 0.0,
            over_predict: 0.0,
            step_under_relax: 0.0,
            damping_multiplier: 1.0,
            windage: 0.0,
            wind_drag: 0.0,
            add_world_collision_radius: 0.0,
            model_scale: 1.0,
            cloth_scale: 1.0,
            ground_height: 0.0,
            frames_before_dormant: 2,
            enable_simd: true,
            enable_ftl: false,
            enable_springs: true,
            enable_anim_attraction: true,
            enable_follow_nodes: true,
            enable_inclusive_spheres: true,
            enable_exclusive_spheres: true,
            enable_planes: true,
            enable_ground: true,
        }
    }

    /// Ropes and chains: follow-the-leader pass and a little air drag.
    #[must_use]
    pub const fn rope() -> Self {
        let mut config = Self::cloth();
        config.enable_ftl = true;
        config.exp_air_drag = 0.5;
        config.rod_velocity_smooth_rate = 0.2;
        config.rod_velocity_smooth_iterations = 1;
        config
    }

    /// Nearly inextensible material with smoothed velocities.
    #[must_use]
    pub const fn stiff() -> Self {
        let mut config = Self::cloth();
        config.quad_velocity_smooth_rate = 0.1;
        config.quad_velocity_smooth_iterations = 2;
        config.step_under_relax = 0.1;
        config
    }

    /// Scalar relaxation only, matching content authored for the legacy numerics.
    #[must_use]
    pub const fn legacy() -> Self {
        let mut config = Self::cloth();
        config.enable_simd = false;
        config.enable_springs = true;
        config
    }

    /// Config seeded from a model's authored defaults.
    ///
    /// A zero gravity scale is treated as an authoring mistake and promoted to 1.
    #[must_use]
    pub fn from_defaults(defaults: &FeModelDefaults) -> Self {
        let mut config = Self::cloth();
        config.thread_stretch = defaults.thread_stretch;
        config.surface_stretch = defaults.surface_stretch;
        config.gravity_scale = defaults.gravity_scale;
        if config.gravity_scale == 0.0 {
            tracing::warn!("gravity scale 0 is probably an invalid default, using 1");
            config.gravity_scale = 1.0;
        }
        config.vel_air_drag = defaults.vel_air_drag;
        config.exp_air_drag = defaults.exp_air_drag;
        config.vel_quad_air_drag = defaults.vel_quad_air_drag;
        config.exp_quad_air_drag = defaults.exp_quad_air_drag;
        config.vel_rod_air_drag = defaults.vel_rod_air_drag;
        config.exp_rod_air_drag = defaults.exp_rod_air_drag;
        config.quad_velocity_smooth_rate = defaults.quad_velocity_smooth_rate;
        config.rod_velocity_smooth_rate = defaults.rod_velocity_smooth_rate;
        config.quad_velocity_smooth_iterations = defaults.quad_velocity_smooth_iterations;
        config.rod_velocity_smooth_iterations = defaults.rod_velocity_smooth_iterations;
        config.volumetric_solve_amount = defaults.volumetric_solve_amount;
        config.windage = defaults.windage;
        config.wind_drag = defaults.wind_drag;
        config.add_world_collision_radius = defaults.add_world_collision_radius;
        config
    }

    /// Constraint scale: model scale times cloth scale.
    #[must_use]
    pub fn constraint_scale(&self) -> f64 {
        self.model_scale * self.cloth_scale
    }

    /// Check that every tunable is finite and non-negative where required.
    ///
    /// # Errors
    ///
    /// Returns [`SoftbodyError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("vel_air_drag", self.vel_air_drag),
            ("exp_air_drag", self.exp_air_drag),
            ("vel_quad_air_drag", self.vel_quad_air_drag),
            ("exp_quad_air_drag", self.exp_quad_air_drag),
            ("vel_rod_air_drag", self.vel_rod_air_drag),
            ("exp_rod_air_drag", self.exp_rod_air_drag),
            ("thread_stretch", self.thread_stretch),
            ("surface_stretch", self.surface_stretch),
            ("damping_multiplier", self.damping_multiplier),
            ("windage", self.windage),
            ("wind_drag", self.wind_drag),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(SoftbodyError::invalid_config(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        if !(self.model_scale.is_finite() && self.model_scale > 0.0) {
            return Err(SoftbodyError::invalid_config(format!(
                "model_scale must be positive, got {}",
                self.model_scale
            )));
        }
        if self.over_predict <= -1.0 {
            return Err(SoftbodyError::invalid_config(
                "over_predict must be greater than -1",
            ));
        }
        Ok(())
    }
}

/// Per-model defaults authored with the descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeModelDefaults {
    /// Default rod stretch.
    pub thread_stretch: f64,
    /// Default surface stretch.
    pub surface_stretch: f64,
    /// Default gravity multiplier.
    pub gravity_scale: f64,
    /// Default per-node drag proportional to speed.
    pub vel_air_drag: f64,
    /// Default per-node exponential drag.
    pub exp_air_drag: f64,
    /// Default quad drag proportional to speed.
    pub vel_quad_air_drag: f64,
    /// Default quad exponential drag.
    pub exp_quad_air_drag: f64,
    /// Default rod drag proportional to speed.
    pub vel_rod_air_drag: f64,
    /// Default rod exponential drag.
    pub exp_rod_air_drag: f64,
    /// Default quad velocity smoothing rate.
    pub quad_velocity_smooth_rate: f64,
    /// Default rod velocity smoothing rate.
    pub rod_velocity_smooth_rate: f64,
    /// Default quad velocity smoothing passes.
    pub quad_velocity_smooth_iterations: u32,
    /// Default rod velocity smoothing passes.
    pub rod_velocity_smooth_iterations: u32,
    /// Default volumetric feedback stiffness.
    pub volumetric_solve_amount: f64,
    /// Default windage.
    pub windage: f64,
    /// Default wind drag.
    pub wind_drag: f64,
    /// Default extra world collision radius.
    pub add_world_collision_radius: f64,
}

impl Default for FeModelDefaults {
    fn default() -> Self {
        Self {
            thread_stretch: 0.0,
            surface_stretch: 0.0,
            gravity_scale: 1.0,
            vel_air_drag: 0.0,
            exp_air_drag: 0.0,
            vel_quad_air_drag: 0.0,
            exp_quad_air_drag: 0.0,
            vel_rod_air_drag: 0.0,
            exp_rod_air_drag: 0.0,
            quad_velocity_smooth_rate: 0.0,
            rod_velocity_smooth_rate: 0.0,
            quad_velocity_smooth_iterations: 0,
            rod_velocity_smooth_iterations: 0,
            volumetric_solve_amount: 0.0,
            windage: 0.0,
            wind_drag: 0.0,
            add_world_collision_radius: 0.0,
        }
    }
}

/// World gravity and wind.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Environment {
    /// Gravity acceleration used by models without node integrators.
    pub gravity: Vector3<f64>,
    /// Wind direction in `xyz` and strength in `w`.
    pub wind: Vector4<f64>,
    /// Global multiplier on model windage.
    pub windage_multiplier: f64,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            gravity: Vector3::new(0.0, 0.0, -DEFAULT_GRAVITY),
            wind: Vector4::zeros(),
            windage_multiplier: 1.0,
        }
    }
}

impl Environment {
    /// Environment with the given wind direction and strength.
    #[must_use]
    pub fn with_wind(mut self, direction: Vector3<f64>, strength: f64) -> Self {
        self.wind = Vector4::new(direction.x, direction.y, direction.z, strength);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for config in [
            SoftbodyConfig::cloth(),
            SoftbodyConfig::rope(),
            SoftbodyConfig::stiff(),
            SoftbodyConfig::legacy(),
        ] {
            config.validate().unwrap();
        }
        assert!(SoftbodyConfig::rope().enable_ftl);
        assert!(!SoftbodyConfig::legacy().enable_simd);
    }

    #[test]
    fn test_zero_gravity_scale_promoted() {
        let defaults = FeModelDefaults {
            gravity_scale: 0.0,
            thread_stretch: 0.5,
            ..FeModelDefaults::default()
        };
        let config = SoftbodyConfig::from_defaults(&defaults);
        assert_eq!(config.gravity_scale, 1.0);
        assert_eq!(config.thread_stretch, 0.5);
    }

    #[test]
    fn test_validate_rejects_negative_drag() {
        let config = SoftbodyConfig {
            exp_air_drag: -1.0,
            ..SoftbodyConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exp_air_drag"));
    }

    #[test]
    fn test_environment_default_gravity() {
        let env = Environment::default().with_wind(Vector3::x(), 2.0);
        assert_eq!(env.gravity.z, -DEFAULT_GRAVITY);
        assert_eq!(env.wind.w, 2.0);
    }
}
