//! Scalar constraint relaxation.
//!
//! Each routine projects node positions toward satisfying one constraint class, in
//! element order (Gauss-Seidel). Static corners are never written: quads and tris are
//! relaxed by class, and each class only moves the corners that can move.
//!
//! `scale` is the constraint scale (model scale times cloth scale) applied to rest
//! lengths and shapes. `stiffness` is in `[0, 1]`.

use nalgebra::{Vector2, Vector3};

use crate::basis::{Basis, Rotation2D, TriBasis, cross_z, wahba_rotation};
use crate::model::{AxialEdgeBend, FeModel, Quad, Rod, Tri};

/// Squared-distance floor for rods.
pub(crate) const MIN_DIST_SQ: f64 = 1.0 / 1_073_741_824.0;

/// Correction that clamps a rod into `[min, max]`.
#[inline]
fn rod_delta(rod: &Rod, a: &Vector3<f64>, b: &Vector3<f64>, scale: f64) -> Vector3<f64> {
    let d = b - a;
    let dist = d.norm_squared().max(MIN_DIST_SQ).sqrt();
    let required = dist.clamp(rod.min_dist * scale, rod.max_dist * scale);
    d * (rod.relaxation_factor * (required / dist - 1.0))
}

/// Relax every rod.
pub fn relax_rods(model: &FeModel, pos: &mut [Vector3<f64>], stiffness: f64, scale: f64) {
    for rod in &model.rods {
        let [a, b] = rod.nodes;
        let delta = rod_delta(rod, &pos[a], &pos[b], scale) * stiffness;
        pos[a] -= delta * rod.weight0;
        pos[b] += delta * (1.0 - rod.weight0);
    }
}

/// Follow-the-leader rod pass: node 1 takes the whole correction.
pub fn relax_rods_ftl(model: &FeModel, pos: &mut [Vector3<f64>], stiffness: f64, scale: f64) {
    for rod in &model.rods {
        let [a, b] = rod.nodes;
        let delta = rod_delta(rod, &pos[a], &pos[b], scale) * stiffness;
        if rod.weight0 < 1.0 {
            pos[b] += delta;
        } else {
            pos[a] -= delta;
        }
    }
}

/// Relax one rod only if it violates its limits; returns whether it moved.
pub(crate) fn relax_rod_if_violated(rod: &Rod, pos: &mut [Vector3<f64>], scale: f64) -> bool {
    let [a, b] = rod.nodes;
    let dist = (pos[b] - pos[a]).norm();
    if dist >= rod.min_dist * scale && dist <= rod.max_dist * scale {
        return false;
    }
    let delta = rod_delta(rod, &pos[a], &pos[b], scale);
    pos[a] -= delta * rod.weight0;
    pos[b] += delta * (1.0 - rod.weight0);
    true
}

/// Relax one edge bend.
pub fn relax_bend(bend: &AxialEdgeBend, pos: &mut [Vector3<f64>], stiffness: f64) {
    let p = bend.nodes.map(|n| pos[n]);
    let edge_point = p[0] * (1.0 - bend.te) + p[1] * bend.te;
    let virtual_point =
        (p[2] + p[3]) * (0.5 - bend.tv * 0.5) + (p[4] + p[5]) * (bend.tv * 0.5);
    let mut axis = virtual_point - edge_point;
    let edge = p[1] - p[0];
    let virtual_edge = (p[4] + p[5]) - (p[2] + p[3]);
    let cross = edge.cross(&virtual_edge);

    let axis_len = axis.norm();
    let correction = if axis_len > 0.001 {
        let adjusted = if axis.dot(&cross) > 0.0 {
            -bend.dist
        } else {
            bend.dist
        };
        1.0 + adjusted / axis_len
    } else {
        let cross_len = cross.norm();
        if cross_len > f64::from(f32::EPSILON) {
            axis = cross;
            bend.dist / cross_len
        } else {
            axis = Vector3::z();
            bend.dist
        }
    };

    let delta = axis * (stiffness * correction);
    let w = bend.weights;
    pos[bend.nodes[0]] += delta * w[0];
    pos[bend.nodes[1]] += delta * w[1];
    pos[bend.nodes[2]] += delta * w[2];
    pos[bend.nodes[3]] += delta * w[2];
    pos[bend.nodes[4]] += delta * w[3];
    pos[bend.nodes[5]] += delta * w[3];
}

/// Relax every edge bend.
pub fn relax_bends(model: &FeModel, pos: &mut [Vector3<f64>], stiffness: f64) {
    for bend in &model.axial_edge_bends {
        relax_bend(bend, pos, stiffness);
    }
}

/// Quad hinged on static corners 0 and 1; rotates corners 2 and 3 about the hinge.
pub fn relax_quad2(quad: &Quad, pos: &mut [Vector3<f64>], stiffness: f64, scale: f64) {
    let p = quad.nodes.map(|n| pos[n]);
    let com = (p[0] + p[1]) * 0.5;
    let basis = Basis::new(&(p[1] - p[0]), &(p[2] + p[3] - p[0] * 2.0));
    let (mut wc, mut ws) = (0.0, 0.0);
    for i in 2..4 {
        let local = basis.world_to_local_yz(&(p[i] - com));
        let shape = quad.shape[i];
        wc += shape.w * (local.x * shape.y + local.y * shape.z);
        ws += shape.w * (local.y * shape.y - local.x * shape.z);
    }
    let rot = Rotation2D::new(wc, ws);
    for i in 2..4 {
        let shape = quad.shape[i];
        let yz = rot.apply(&Vector2::new(shape.y, shape.z));
        let r = basis.local_to_world(&Vector3::new(shape.x, yz.x, yz.y)) * scale;
        pos[quad.nodes[i]] = com + r * stiffness + (p[i] - com) * (1.0 - stiffness);
    }
}

/// Quad pinned at static corner 0; rotates corners 1 to 3 about it.
pub fn relax_quad1(quad: &Quad, pos: &mut [Vector3<f64>], scale: f64) {
    let p = quad.nodes.map(|n| pos[n]);
    let com = p[0];
    let basis = Basis::new(&(p[2] - p[0]), &(p[3] - p[1]));
    let masses: [f64; 3] = std::array::from_fn(|i| quad.shape[i + 1].w);
    let xs: [Vector3<f64>; 3] = std::array::from_fn(|i| p[i + 1] - com);
    let rs: [Vector3<f64>; 3] =
        std::array::from_fn(|i| basis.local_to_world(&quad.shape[i + 1].xyz()) * scale);
    let rot = wahba_rotation(&masses, &xs, &rs);
    for i in 0..3 {
        pos[quad.nodes[i + 1]] = com + rot.apply(&rs[i]);
    }
}

/// Free quad; shape-matches all four corners about their center of mass.
pub fn relax_quad0(quad: &Quad, pos: &mut [Vector3<f64>], stiffness: f64, scale: f64) {
    let p = quad.nodes.map(|n| pos[n]);
    let basis = Basis::new(&(p[2] - p[0]), &(p[3] - p[1]));
    let masses: [f64; 4] = std::array::from_fn(|i| quad.shape[i].w);
    let com: Vector3<f64> = (0..4).map(|i| p[i] * masses[i]).sum();
    let xs: [Vector3<f64>; 4] = std::array::from_fn(|i| p[i] - com);
    let rs: [Vector3<f64>; 4] =
        std::array::from_fn(|i| basis.local_to_world(&quad.shape[i].xyz()) * scale);
    let rot = wahba_rotation(&masses, &xs, &rs);
    for i in 0..4 {
        pos[quad.nodes[i]] = com + rot.apply(&rs[i]) * stiffness + xs[i] * (1.0 - stiffness);
    }
}

/// Relax every quad, by class.
pub fn relax_quads(model: &FeModel, pos: &mut [Vector3<f64>], stiffness: f64, scale: f64) {
    let [all, one, two] = model.quad_counts;
    for quad in &model.quads[..two] {
        relax_quad2(quad, pos, stiffness, scale);
    }
    for quad in &model.quads[two..one] {
        relax_quad1(quad, pos, scale);
    }
    for quad in &model.quads[one..all] {
        relax_quad0(quad, pos, stiffness, scale);
    }
}

/// Tri with static corners 0 and 1; places corner 2.
pub fn relax_tri2(tri: &Tri, pos: &mut [Vector3<f64>], scale: f64) {
    let [n0, n1, n2] = tri.nodes;
    let basis = TriBasis::new(&(pos[n1] - pos[n0]), &(pos[n2] - pos[n0]));
    let local = Vector2::new(
        scale * tri.v2.x + 0.5 * (basis.v1x - scale * tri.v1x),
        scale * tri.v2.y,
    );
    pos[n2] = pos[n0] + basis.local_xy_to_world(&local);
}

/// Tri with static corner 0; rotates corners 1 and 2 about it.
pub fn relax_tri1(tri: &Tri, pos: &mut [Vector3<f64>], scale: f64) {
    let [n0, n1, n2] = tri.nodes;
    let basis = TriBasis::new(&(pos[n1] - pos[n0]), &(pos[n2] - pos[n0]));
    let tv1x = scale * tri.v1x;
    let tv2 = tri.v2 * scale;
    let rot = Rotation2D::new(
        tri.w2 * tv2.dot(&basis.v2) + tri.w1 * tv1x * basis.v1x,
        tri.w2 * cross_z(&tv2, &basis.v2),
    );
    let p0 = pos[n0];
    pos[n1] = p0 + basis.local_xy_to_world(&Vector2::new(rot.cos * tv1x, rot.sin * tv1x));
    pos[n2] = p0 + basis.local_xy_to_world(&rot.apply(&tv2));
}

/// Free tri; shape-matches all three corners about their center of mass.
pub fn relax_tri0(tri: &Tri, pos: &mut [Vector3<f64>], scale: f64) {
    let [n0, n1, n2] = tri.nodes;
    let basis = TriBasis::new(&(pos[n1] - pos[n0]), &(pos[n2] - pos[n0]));
    let (w1, w2) = (tri.w1, tri.w2);
    let w0 = 1.0 - w1 - w2;
    let tv1x = scale * tri.v1x;
    let tv2 = tri.v2 * scale;

    let x0neg = Vector2::new(basis.v1x * w1 + basis.v2.x * w2, basis.v2.y * w2);
    let r0neg = Vector2::new(tv1x * w1 + tv2.x * w2, tv2.y * w2);
    let x2 = basis.v2 - x0neg;
    let r2 = tv2 - r0neg;
    let x1x = basis.v1x - x0neg.x;
    let r1x = tv1x - r0neg.x;

    let rot = Rotation2D::new(
        w2 * x2.dot(&r2)
            + w1 * x1x * r1x
            + w0 * x0neg.x * r0neg.x
            + (w1 + w0) * x0neg.y * r0neg.y,
        w2 * cross_z(&r2, &x2)
            - w1 * cross_z(&Vector2::new(r1x, r0neg.y), &Vector2::new(x1x, x0neg.y))
            + w0 * cross_z(&r0neg, &x0neg),
    );

    let p0 = pos[n0] + basis.local_xy_to_world(&(x0neg - rot.apply(&r0neg)));
    pos[n0] = p0;
    pos[n1] = p0 + basis.local_xy_to_world(&Vector2::new(rot.cos * tv1x, rot.sin * tv1x));
    pos[n2] = p0 + basis.local_xy_to_world(&rot.apply(&tv2));
}

/// Relax every tri, by class.
pub fn relax_tris(model: &FeModel, pos: &mut [Vector3<f64>], scale: f64) {
    let [all, one, two] = model.tri_counts;
    for tri in &model.tris[..two] {
        relax_tri2(tri, pos, scale);
    }
    for tri in &model.tris[two..one] {
        relax_tri1(tri, pos, scale);
    }
    for tri in &model.tris[one..all] {
        relax_tri0(tri, pos, scale);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::builder::FeModelBuilder;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn two_node_rod() -> FeModel {
        let mut b = FeModelBuilder::new();
        b.add_dynamic_node(Vector3::zeros(), 1.0);
        b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
        b.add_rod(0, 1);
        b.build().unwrap()
    }

    #[test]
    fn test_rod_restores_length_symmetrically() {
        let model = two_node_rod();
        let mut pos = vec![Vector3::new(-2.5, 0.0, 0.0), Vector3::new(12.5, 0.0, 0.0)];
        relax_rods(&model, &mut pos, 1.0, 1.0);
        assert_relative_eq!(pos[0], Vector3::new(0.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(pos[1], Vector3::new(10.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_rod_within_limits_untouched() {
        let mut b = FeModelBuilder::new();
        b.add_dynamic_node(Vector3::zeros(), 1.0);
        b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
        b.add_rod_with_limits(0, 1, 5.0, 15.0, 1.0);
        let model = b.build().unwrap();
        let mut pos = vec![Vector3::zeros(), Vector3::new(12.0, 0.0, 0.0)];
        relax_rods(&model, &mut pos, 1.0, 1.0);
        assert_eq!(pos[1], Vector3::new(12.0, 0.0, 0.0));
        assert!(!relax_rod_if_violated(&model.rods[0], &mut pos, 1.0));
    }

    #[test]
    fn test_rod_never_moves_static_end() {
        let mut b = FeModelBuilder::new();
        b.add_static_node(Vector3::zeros());
        b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1e-3);
        b.add_rod(0, 1);
        let model = b.build().unwrap();
        let mut pos = vec![Vector3::zeros(), Vector3::new(15.0, 0.0, 0.0)];
        relax_rods(&model, &mut pos, 1.0, 1.0);
        assert_eq!(pos[0], Vector3::zeros());
        assert_relative_eq!(pos[1], Vector3::new(10.0, 0.0, 0.0), epsilon = 1e-12);

        pos[1] = Vector3::new(0.0, 30.0, 0.0);
        assert!(relax_rod_if_violated(&model.rods[0], &mut pos, 1.0));
        assert_eq!(pos[0], Vector3::zeros());
    }

    #[test]
    fn test_ftl_moves_follower_only() {
        let model = two_node_rod();
        let mut pos = vec![Vector3::zeros(), Vector3::new(20.0, 0.0, 0.0)];
        relax_rods_ftl(&model, &mut pos, 1.0, 1.0);
        assert_eq!(pos[0], Vector3::zeros());
        assert_relative_eq!(pos[1].x, 10.0, epsilon = 1e-12);
    }

    fn pinned_quad() -> FeModel {
        let mut b = FeModelBuilder::new();
        b.add_static_node(Vector3::new(0.0, 0.0, 0.0));
        b.add_static_node(Vector3::new(10.0, 0.0, 0.0));
        b.add_dynamic_node(Vector3::new(10.0, 0.0, -10.0), 1.0);
        b.add_dynamic_node(Vector3::new(0.0, 0.0, -10.0), 1.0);
        b.add_quad([0, 1, 2, 3]);
        b.build().unwrap()
    }

    #[test]
    fn test_quad2_rest_is_fixed_point() {
        let model = pinned_quad();
        let rest = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(10.0, 0.0, -10.0),
            Vector3::new(0.0, 0.0, -10.0),
        ];
        let mut pos = rest.clone();
        relax_quads(&model, &mut pos, 1.0, 1.0);
        for (p, r) in pos.iter().zip(&rest) {
            assert_relative_eq!(p, r, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_quad2_restores_stretched_corners() {
        let model = pinned_quad();
        let mut pos = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(10.0, 3.0, -16.0),
            Vector3::new(0.0, 3.0, -16.0),
        ];
        relax_quads(&model, &mut pos, 1.0, 1.0);
        assert_relative_eq!((pos[2] - pos[1]).norm(), 10.0, epsilon = 1e-9);
        assert_relative_eq!((pos[3] - pos[0]).norm(), 10.0, epsilon = 1e-9);
        // The hinge keeps the rotated direction.
        assert!(pos[2].y > 0.0);
    }

    #[test]
    fn test_free_quad_rigid_motion_is_fixed_point() {
        let mut b = FeModelBuilder::new();
        for p in [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(4.0, 0.0, 0.0),
            Vector3::new(4.0, 3.0, 0.0),
            Vector3::new(0.0, 3.0, 0.0),
        ] {
            b.add_dynamic_node(p, 1.0);
        }
        b.add_quad([0, 1, 2, 3]);
        let model = b.build().unwrap();
        let shift = Vector3::new(1.0, 2.0, 3.0);
        let mut pos: Vec<Vector3<f64>> = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(4.0, 0.0, 0.0),
            Vector3::new(4.0, 3.0, 0.0),
            Vector3::new(0.0, 3.0, 0.0),
        ]
        .iter()
        .map(|p| p + shift)
        .collect();
        let expected = pos.clone();
        relax_quads(&model, &mut pos, 1.0, 1.0);
        for (p, e) in pos.iter().zip(&expected) {
            assert_relative_eq!(p, e, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_tri2_restores_apex() {
        let mut b = FeModelBuilder::new();
        b.add_static_node(Vector3::new(0.0, 0.0, 0.0));
        b.add_static_node(Vector3::new(4.0, 0.0, 0.0));
        b.add_dynamic_node(Vector3::new(2.0, 3.0, 0.0), 1.0);
        b.add_tri([0, 1, 2]);
        let model = b.build().unwrap();
        let mut pos = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(4.0, 0.0, 0.0),
            Vector3::new(2.0, 7.0, 0.0),
        ];
        relax_tris(&model, &mut pos, 1.0);
        assert_relative_eq!(pos[2], Vector3::new(2.0, 3.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_free_tri_keeps_rest_shape() {
        let mut b = FeModelBuilder::new();
        b.add_dynamic_node(Vector3::new(0.0, 0.0, 0.0), 1.0);
        b.add_dynamic_node(Vector3::new(4.0, 0.0, 0.0), 1.0);
        b.add_dynamic_node(Vector3::new(0.0, 3.0, 0.0), 1.0);
        b.add_tri([0, 1, 2]);
        let model = b.build().unwrap();
        let mut pos = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(6.0, 0.0, 0.0),
            Vector3::new(0.0, 3.0, 0.0),
        ];
        relax_tris(&model, &mut pos, 1.0);
        assert_relative_eq!((pos[1] - pos[0]).norm(), 4.0, epsilon = 1e-9);
        assert_relative_eq!((pos[2] - pos[0]).norm(), 3.0, epsilon = 1e-9);
        assert_relative_eq!((pos[2] - pos[1]).norm(), 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bend_rest_is_fixed_point() {
        let mut b = FeModelBuilder::new();
        let points = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.0, 10.0, 0.0),
            Vector3::new(-10.0, 0.0, 0.0),
            Vector3::new(-10.0, 10.0, 0.0),
            Vector3::new(10.0, 0.0, 2.0),
            Vector3::new(10.0, 10.0, 2.0),
        ];
        for p in points {
            b.add_dynamic_node(p, 1.0);
        }
        b.add_bend([0, 1, 2, 3, 4, 5], 0.5, 0.5);
        let model = b.build().unwrap();
        let mut pos = points.to_vec();
        relax_bends(&model, &mut pos, 1.0);
        for (p, r) in pos.iter().zip(&points) {
            assert_relative_eq!(p, r, epsilon = 1e-9);
        }

        // Folding the wing changes the bend distance; relaxing pulls it back toward rest.
        let gap = |p: &[Vector3<f64>]| {
            (p[2].z + p[3].z + p[4].z + p[5].z) * 0.25 - (p[0].z + p[1].z) * 0.5
        };
        let mut folded = points.to_vec();
        folded[4].z = 8.0;
        folded[5].z = 8.0;
        assert_relative_eq!(gap(&folded), 4.0);
        relax_bends(&model, &mut folded, 1.0);
        assert_relative_eq!(gap(&folded), 1.0, epsilon = 1e-9);
    }
}
