//! Real-time finite-element soft body simulation for cloth and ropes.
//!
//! A soft body is a set of point masses ("nodes") driven toward an animated pose
//! while distance, area and bending constraints hold its shape. It is split in two:
//!
//! - **[`FeModel`]**: immutable topology built once by [`FeModelBuilder`] and shared
//!   between instances through `Arc`. It holds rods, quads, triangles, bends, springs,
//!   collision primitives, their SIMD batches and a broadphase tree over the nodes.
//! - **[`SoftbodyInstance`]**: the per-object state (two position buffers, animated and
//!   simulated transforms, activity) that advances in fixed steps.
//!
//! # Physics Model
//!
//! Nodes are integrated with position Verlet: velocity is implicit in the difference
//! between the current and previous positions. Constraints are relaxed iteratively
//! with Gauss-Seidel projection, in a fixed order so the simulation is bit-for-bit
//! deterministic.
//!
//! ```text
//! For each step:
//!   1. Integrate springs, wind, drag and velocity smoothing
//!   2. Predict: x' = x + (x - x_prev) * ts + gravity * dt²
//!   3. Pull toward the animation
//!   4. Collide with rigid primitives and the world
//!   5. Relax rods, bends, quads and triangles `iterations` times
//!   6. Post: collision spheres, planes, ground, fit matrices
//! ```
//!
//! Models flagged with uninertial constraints run the legacy S1 numerics instead
//! (see [`LegacyS1Strategy`]).
//!
//! # Node Layout
//!
//! Static nodes come first and follow the animation exactly; dynamic nodes follow:
//!
//! ```text
//!  ■───■───■      static (animated)
//!  │╲  │╲  │
//!  ●───●───●      dynamic (simulated)
//!  │╲  │╲  │
//!  ●───●───●
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use fe_softbody::{FeModelBuilder, SoftbodyInstance};
//! use nalgebra::Vector3;
//!
//! // A rope hanging from one static node.
//! let mut builder = FeModelBuilder::new();
//! let anchor = builder.add_static_node(Vector3::zeros());
//! let mut prev = anchor;
//! for i in 1..=4 {
//!     let node = builder.add_dynamic_node(Vector3::new(10.0 * f64::from(i), 0.0, 0.0), 1.0);
//!     builder.add_rod(prev, node);
//!     prev = node;
//! }
//! let model = Arc::new(builder.build().expect("valid rope"));
//!
//! let mut rope = SoftbodyInstance::new(model);
//! rope.activate();
//! for _ in 0..10 {
//!     rope.step(4, 1.0 / 60.0);
//! }
//! assert!(rope.node_positions()[4].z < 0.0);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
// Allow precision loss when converting counts to f64 - these are small values
#![allow(clippy::cast_precision_loss)]
// Allow sign loss and truncation for array indices - we validate bounds
#![allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
// Allow long functions for the model build and step stages
#![allow(clippy::too_many_lines)]
// Index loops over parallel node arrays read better than zipped iterators
#![allow(clippy::needless_range_loop)]
// Test-related lints - these are style preferences
#![cfg_attr(test, allow(clippy::uninlined_format_args, clippy::float_cmp))]

pub mod activity;
pub mod basis;
pub mod builder;
pub mod collision;
pub mod config;
pub mod error;
pub mod fit;
pub mod forces;
pub mod model;
pub mod relax;
pub mod relax_simd;
pub mod simd;
pub mod softbody;
pub mod types;
pub mod world;

// Re-export main types at crate root
pub use activity::{Activity, ActivityState};
pub use builder::{FeModelBuilder, NodeDesc};
pub use collision::TaperedCapsule;
pub use config::{Environment, FeModelDefaults, SoftbodyConfig};
pub use error::{Result, SoftbodyError};
pub use model::{CollisionTree, FeModel};
pub use simd::Vec3x4;
pub use softbody::{
    InertialStrategy, LegacyS1Strategy, ParticleGlue, SimulationStrategy, SoftbodyInstance,
    SoftbodyStats,
};
pub use types::{Aabb, FeFlags, SoftbodyId, Transform, WorldShapeMask};
pub use world::{ShapeList, Triangle, WorldCollision, WorldShape};
