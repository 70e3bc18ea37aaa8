//! End-to-end stepping tests.
//!
//! Builds small cloth and rope models, drives instances through the public API and
//! checks the behavior a game loop relies on: determinism, static nodes following
//! the animation and holding under constraints, activity transitions and the legacy
//! numerics switch.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use approx::assert_relative_eq;
use fe_softbody::{
    ActivityState, FeModel, FeModelBuilder, ShapeList, SoftbodyConfig, SoftbodyInstance,
    Transform, WorldShape, WorldShapeMask,
};
use nalgebra::{Translation3, UnitQuaternion, Vector3};

const DT: f64 = 1.0 / 60.0;

/// A `cols` x `rows` cloth hanging from its static top row, spaced 10 units apart.
fn hanging_cloth(cols: usize, rows: usize) -> Arc<FeModel> {
    let mut b = FeModelBuilder::new();
    let index = |c: usize, r: usize| r * cols + c;
    for r in 0..rows {
        for c in 0..cols {
            let p = Vector3::new(10.0 * c as f64, 0.0, -10.0 * r as f64);
            if r == 0 {
                b.add_static_node(p);
            } else {
                b.add_dynamic_node(p, 1.0);
            }
        }
    }
    for r in 0..rows {
        for c in 0..cols {
            if c + 1 < cols {
                b.add_rod(index(c, r), index(c + 1, r));
            }
            if r + 1 < rows {
                b.add_rod(index(c, r), index(c, r + 1));
            }
            if c + 1 < cols && r + 1 < rows {
                b.add_quad([
                    index(c, r),
                    index(c + 1, r),
                    index(c + 1, r + 1),
                    index(c, r + 1),
                ]);
            }
        }
    }
    Arc::new(b.build().expect("cloth builds"))
}

fn active(model: Arc<FeModel>) -> SoftbodyInstance {
    let mut body = SoftbodyInstance::new(model);
    body.activate();
    body
}

/// Test: two runs from the same state produce bit-identical positions.
#[test]
fn determinism_across_instances() {
    let model = hanging_cloth(4, 4);
    let mut a = active(Arc::clone(&model));
    let mut b = active(model);
    for _ in 0..30 {
        a.step(4, DT);
        b.step(4, DT);
    }
    for (p, q) in a.node_positions().iter().zip(b.node_positions()) {
        for (x, y) in p.iter().zip(q.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }
    assert!(a.validating_simulate(4, DT));
}

/// Test: a rod stretched from 10 to 15 units relaxes back to 10, symmetrically.
#[test]
fn stretched_rod_relaxes_symmetrically() {
    let mut b = FeModelBuilder::new();
    let n0 = b.add_dynamic_node(Vector3::new(0.0, 0.0, 0.0), 1.0);
    let n1 = b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
    b.add_rod(n0, n1);
    let mut body = active(Arc::new(b.build().unwrap()));

    let mut config = *body.config();
    config.thread_stretch = 0.01;
    body.set_config(config).unwrap();
    body.set_gravity_disabled(true);
    body.set_node_positions(&[Vector3::new(0.0, 0.0, 0.0), Vector3::new(15.0, 0.0, 0.0)])
        .unwrap();

    assert!(body.step(50, DT));
    let [p0, p1] = [body.node_positions()[0], body.node_positions()[1]];
    assert_relative_eq!((p1 - p0).norm(), 10.0, epsilon = 1e-6);
    assert_relative_eq!((p0 + p1) * 0.5, Vector3::new(7.5, 0.0, 0.0), epsilon = 1e-9);
}

/// Test: static nodes sit exactly on their animated transforms after a step.
#[test]
fn static_nodes_follow_animation() {
    let mut body = active(hanging_cloth(3, 3));
    let lift = Transform::from_parts(Translation3::new(0.0, 3.0, 2.0), UnitQuaternion::identity());
    for ctrl in 0..3 {
        let tm = lift * body.anim_transforms()[ctrl];
        body.set_animated_transform(ctrl, tm).unwrap();
    }
    body.step(4, DT);
    for node in 0..3 {
        assert_eq!(
            body.node_positions()[node],
            body.anim_transforms()[node].translation.vector
        );
    }
}

/// Test: static nodes hold their pose while stretched rods and a world sphere
/// around them push on the cloth.
#[test]
fn static_nodes_hold_under_relaxation_and_collision() {
    let model = hanging_cloth(3, 3);
    let mut body = active(Arc::clone(&model));
    body.set_world_shape_mask(WorldShapeMask::SPHERE);
    let rest: Vec<Vector3<f64>> = body.node_positions().to_vec();

    let stretched: Vec<Vector3<f64>> = rest
        .iter()
        .enumerate()
        .map(|(node, p)| if node < 3 { *p } else { Vector3::new(p.x * 1.5, 4.0, p.z * 2.0) })
        .collect();
    body.set_node_positions(&stretched).unwrap();

    let mut world = ShapeList::new();
    world.push(
        WorldShape::Sphere {
            center: Vector3::new(10.0, 0.0, -2.0),
            radius: 12.0,
        },
        u16::MAX,
    );
    for _ in 0..20 {
        assert!(body.step_in_world(4, DT, &world));
        for node in 0..model.static_node_count {
            let anim = body.anim_transforms()[model.node_to_ctrl(node)].translation.vector;
            assert_eq!(body.node_positions()[node], anim);
            assert_relative_eq!(body.node_positions()[node], rest[node], epsilon = 1e-12);
        }
    }
    assert!(body.node_positions().iter().all(|p| p.iter().all(|x| x.is_finite())));
}

/// Test: wake-up needs two filter calls; missing filters put the body back to sleep.
#[test]
fn activity_transitions() {
    let model = hanging_cloth(2, 2);
    let map: Vec<Option<usize>> = (0..model.ctrl_count).map(Some).collect();
    let mut bones = vec![Transform::identity(); model.ctrl_count];
    let mut body = SoftbodyInstance::new(model);
    assert_eq!(body.activity_state(), ActivityState::Dormant);

    assert!(!body.filter_transforms(&mut bones, &map).unwrap());
    assert_eq!(body.activity_state(), ActivityState::WakingUp);
    assert!(!body.filter_transforms(&mut bones, &map).unwrap());
    assert!(body.filter_transforms(&mut bones, &map).unwrap());
    assert!(body.is_active());

    let frames = body.config().frames_before_dormant;
    for _ in 0..=frames {
        body.advance_sleep_counter();
    }
    assert!(body.is_dormant());
}

/// Test: stepping a dormant or frozen body is a no-op.
#[test]
fn idle_step_is_noop() {
    let mut body = SoftbodyInstance::new(hanging_cloth(3, 3));
    let before = body.node_positions().to_vec();
    let previous = body.previous_node_positions().to_vec();
    assert!(!body.step(4, DT));

    body.activate();
    body.set_frozen(true);
    assert!(!body.step(4, DT));
    assert_eq!(body.node_positions(), &before[..]);
    assert_eq!(body.previous_node_positions(), &previous[..]);
}

/// Test: nodes registered for world collision stay above the ground plane.
#[test]
fn ground_clamps_height() {
    let mut b = FeModelBuilder::new();
    let node = b.add_dynamic_node(Vector3::new(0.0, 0.0, 1.0), 1.0);
    b.add_world_collision(&[node], 1.0, 0.0);
    let mut body = active(Arc::new(b.build().unwrap()));
    for _ in 0..60 {
        body.step(1, DT);
    }
    assert_relative_eq!(body.node_positions()[0].z, 0.0);
}

/// Test: the uninertial flag switches to the legacy numerics.
#[test]
fn legacy_numerics_selected_by_flag() {
    let build = |uninertial: bool| {
        let mut b = FeModelBuilder::new();
        b.add_static_node(Vector3::zeros());
        b.add_dynamic_node(Vector3::new(0.0, 0.0, 100.0), 1.0);
        b.set_uninertial(uninertial);
        Arc::new(b.build().unwrap())
    };
    let legacy = build(true);
    assert!(legacy.is_uninertial());
    assert!(!build(false).is_uninertial());

    let mut body = active(legacy);
    body.step(1, DT);
    // Explicit Euler: the first step already falls by g * dt^2.
    assert_relative_eq!(
        body.node_positions()[1].z,
        100.0 - 360.0 * DT * DT,
        epsilon = 1e-9
    );
}

/// Test: replacing the model keeps the nodes both models share.
#[test]
fn replace_model_preserves_mapped_nodes() {
    let mut body = active(hanging_cloth(3, 3));
    for _ in 0..10 {
        body.step(4, DT);
    }
    let before = body.node_positions().to_vec();

    body.replace_fe_model(hanging_cloth(3, 4)).unwrap();
    assert_eq!(body.node_positions().len(), 12);
    for node in 0..9 {
        assert_relative_eq!(body.node_positions()[node], before[node]);
    }
    assert_eq!(body.activity_state(), ActivityState::Active);
}

/// Test: a rope preset steps and keeps its links.
#[test]
fn rope_preset_keeps_length() {
    let mut b = FeModelBuilder::new();
    let mut prev = b.add_static_node(Vector3::zeros());
    let mut chain = vec![prev];
    for i in 1..=5 {
        let node = b.add_dynamic_node(Vector3::new(10.0 * f64::from(i), 0.0, 0.0), 1.0);
        b.add_rod(prev, node);
        chain.push(node);
        prev = node;
    }
    b.add_rope(&chain);
    let mut body = SoftbodyInstance::with_config(Arc::new(b.build().unwrap()), SoftbodyConfig::rope())
        .unwrap();
    body.activate();
    for _ in 0..30 {
        body.step(8, DT);
    }
    let pos = body.node_positions();
    for link in chain.windows(2) {
        assert_relative_eq!((pos[link[1]] - pos[link[0]]).norm(), 10.0, epsilon = 1e-2);
    }
    assert!(pos[5].z < 0.0);
}
