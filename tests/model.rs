//! Model-level properties across the builder, relaxation and broadphase.
//!
//! These tests build randomized models and check relationships that must hold for any
//! topology: the ctrl/node mapping is a bijection on mapped ctrls, per-iteration
//! stiffness makes convergence independent of the iteration count over several steps,
//! the batched solver matches the scalar one, and tree queries never miss an
//! overlapping node.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use approx::assert_relative_eq;
use fe_softbody::{Aabb, FeModel, FeModelBuilder, SoftbodyInstance, Transform};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DT: f64 = 1.0 / 60.0;

fn jitter(rng: &mut StdRng, amount: f64) -> Vector3<f64> {
    Vector3::new(
        rng.gen_range(-amount..amount),
        rng.gen_range(-amount..amount),
        rng.gen_range(-amount..amount),
    )
}

/// A `cols` x `rows` grid with a static top row and every rest position jittered.
fn jittered_cloth(rng: &mut StdRng, cols: usize, rows: usize) -> FeModel {
    let mut b = FeModelBuilder::new();
    let index = |c: usize, r: usize| r * cols + c;
    for r in 0..rows {
        for c in 0..cols {
            let p = Vector3::new(10.0 * c as f64, 0.0, -10.0 * r as f64) + jitter(rng, 2.0);
            if r == 0 {
                b.add_static_node(p);
            } else {
                b.add_dynamic_node(p, rng.gen_range(0.5..2.0));
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
        }
    }
    b.build().unwrap()
}

/// Test: every node maps to a ctrl that maps back to the same node.
#[test]
fn ctrl_node_mapping_round_trips() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut b = FeModelBuilder::new();
    b.add_static_node(Vector3::zeros());
    b.add_virtual_ctrl(Transform::identity());
    for i in 1..6 {
        b.add_dynamic_node(Vector3::new(10.0 * f64::from(i), 0.0, 0.0), 1.0);
        if rng.gen_bool(0.5) {
            b.add_virtual_ctrl(Transform::identity());
        }
    }
    let model = b.build().unwrap();
    assert!(model.ctrl_count > model.node_count);

    for node in 0..model.node_count {
        let ctrl = model.node_to_ctrl(node);
        assert!(ctrl < model.ctrl_count);
        assert_eq!(model.ctrl_to_node(ctrl), Some(node));
    }
    let virtual_ctrls = (0..model.ctrl_count)
        .filter(|&ctrl| model.ctrl_to_node(ctrl).is_none())
        .count();
    assert_eq!(virtual_ctrls, model.ctrl_count - model.node_count);
}

/// Test: a stretched rod converges to the same length for 4 and 16 iterations, on the
/// first step and on every step after it.
#[test]
fn convergence_independent_of_iteration_count() {
    let runs: Vec<Vec<f64>> = [4, 16]
        .into_iter()
        .map(|iterations| {
            let mut b = FeModelBuilder::new();
            let a = b.add_dynamic_node(Vector3::zeros(), 1.0);
            let c = b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
            b.add_rod(a, c);
            let mut body = SoftbodyInstance::new(Arc::new(b.build().unwrap()));
            body.activate();
            body.set_gravity_disabled(true);
            let mut config = *body.config();
            config.thread_stretch = 0.01;
            body.set_config(config).unwrap();
            body.set_node_positions(&[Vector3::zeros(), Vector3::new(14.0, 0.0, 0.0)])
                .unwrap();
            (0..6)
                .map(|_| {
                    body.step(iterations, DT);
                    let pos = body.node_positions();
                    (pos[1] - pos[0]).norm()
                })
                .collect()
        })
        .collect();
    for (coarse, fine) in runs[0].iter().zip(&runs[1]) {
        assert_relative_eq!(*coarse, 10.0, epsilon = 1e-6);
        assert_relative_eq!(*fine, 10.0, epsilon = 1e-6);
    }
}

/// Test: batched and scalar relaxation agree on independent rods.
#[test]
fn simd_and_scalar_steps_agree() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut b = FeModelBuilder::new();
    let mut starts = Vec::new();
    for k in 0..11 {
        let origin = Vector3::new(0.0, 30.0 * f64::from(k), 0.0);
        let a = b.add_dynamic_node(origin, rng.gen_range(0.5..2.0));
        let c = b.add_dynamic_node(origin + Vector3::new(10.0, 0.0, 0.0), rng.gen_range(0.5..2.0));
        b.add_rod(a, c);
        starts.push(origin + jitter(&mut rng, 3.0));
        starts.push(origin + Vector3::new(10.0, 0.0, 0.0) + jitter(&mut rng, 3.0));
    }
    let model = Arc::new(b.build().unwrap());

    let run = |enable_simd: bool| {
        let mut body = SoftbodyInstance::new(Arc::clone(&model));
        body.activate();
        let mut config = *body.config();
        config.enable_simd = enable_simd;
        body.set_config(config).unwrap();
        body.set_node_positions(&starts).unwrap();
        for _ in 0..5 {
            body.step(4, DT);
        }
        body.node_positions().to_vec()
    };
    for (s, v) in run(false).iter().zip(&run(true)) {
        assert_relative_eq!(s, v, epsilon = 1e-9);
    }
}

/// Test: tree casts visit every dynamic node inside the query box.
#[test]
fn cast_box_never_misses_overlapping_nodes() {
    let mut rng = StdRng::seed_from_u64(3);
    let model = jittered_cloth(&mut rng, 6, 6);
    let tree = &model.tree;
    let body = SoftbodyInstance::new(Arc::new(model.clone()));
    let dynamic = &body.node_positions()[model.static_node_count..];
    assert_eq!(tree.leaf_count(), dynamic.len());

    let mut aabbs = vec![Aabb::empty(); tree.leaf_count() - 1];
    tree.compute_bounds(&mut aabbs, dynamic, &[], 1.0);

    for _ in 0..50 {
        let center = Vector3::new(rng.gen_range(-5.0..55.0), 0.0, rng.gen_range(-55.0..5.0));
        let query = Aabb::from_sphere(&center, rng.gen_range(1.0..15.0));
        let mut visited = Vec::new();
        tree.cast_box::<true>(&aabbs, &query, u16::MAX, |leaf| visited.push(leaf));
        for (leaf, p) in dynamic.iter().enumerate() {
            if query.contains(p) {
                assert!(visited.contains(&leaf), "leaf {leaf} missed");
            }
        }
    }

    let far = Aabb::from_sphere(&Vector3::new(1000.0, 1000.0, 1000.0), 1.0);
    let mut visited = 0;
    tree.cast_box::<true>(&aabbs, &far, u16::MAX, |_| visited += 1);
    assert_eq!(visited, 0);
}
