//! Batched constraint relaxation over [`Vec3x4`] lanes.
//!
//! The builder schedules rods, quads and tris into batches of four whose lanes never
//! share a dynamic node, so a batch can gather its corners, relax all lanes at once
//! and scatter the results without ordering hazards. Padding lanes repeat an element
//! of the same batch and write identical values.
//!
//! The math matches [`crate::relax`] lane for lane.

use nalgebra::Vector3;

use crate::basis::{Rotation2D, perpendicular, wahba_rotation};
use crate::model::FeModel;
use crate::relax::MIN_DIST_SQ;
use crate::simd::{F64x4, Vec3x4, add4, map4, mul4, sub4};

const ONES: F64x4 = [1.0; 4];

/// Orthonormal frame per lane, with the scalar fallbacks.
fn basis4(tentative_x: &Vec3x4, tentative_y: &Vec3x4) -> [Vec3x4; 3] {
    let x = tentative_x.normalize_or(&Vector3::x());
    let along = tentative_y.dot_pairwise(&x);
    let y = (*tentative_y - x.scale_each(along)).normalize_or(&Vector3::y());
    let z = x.cross_pairwise(&y);
    [x, y, z]
}

#[inline]
fn local_to_world4(basis: &[Vec3x4; 3], local: &Vec3x4) -> Vec3x4 {
    basis[0].scale_each(local.xs) + basis[1].scale_each(local.ys) + basis[2].scale_each(local.zs)
}

/// Triangle frame per lane: axes, first edge length and second edge in the frame.
struct TriBasis4 {
    axis_x: Vec3x4,
    axis_y: Vec3x4,
    v1x: F64x4,
    v2x: F64x4,
    v2y: F64x4,
}

impl TriBasis4 {
    fn new(edge1: &Vec3x4, edge2: &Vec3x4) -> Self {
        let v1x = edge1.norm();
        let axis_x = edge1.normalize_or(&Vector3::x());
        let v2x = edge2.dot_pairwise(&axis_x);
        let ortho = *edge2 - axis_x.scale_each(v2x);
        let v2y = ortho.norm();
        let mut axis_y = ortho.normalize_or(&Vector3::y());
        for lane in 0..4 {
            if v2y[lane] <= 1e-10 {
                let perp = perpendicular(&axis_x.get(lane));
                axis_y.xs[lane] = perp.x;
                axis_y.ys[lane] = perp.y;
                axis_y.zs[lane] = perp.z;
            }
        }
        Self {
            axis_x,
            axis_y,
            v1x,
            v2x,
            v2y,
        }
    }

    #[inline]
    fn local_xy_to_world(&self, x: F64x4, y: F64x4) -> Vec3x4 {
        self.axis_x.scale_each(x) + self.axis_y.scale_each(y)
    }
}

/// Per-lane planar rotation from weighted sums.
fn rotation4(weighted_cos: F64x4, weighted_sin: F64x4) -> (F64x4, F64x4) {
    let mut cos = [1.0; 4];
    let mut sin = [0.0; 4];
    for lane in 0..4 {
        let rot = Rotation2D::new(weighted_cos[lane], weighted_sin[lane]);
        cos[lane] = rot.cos;
        sin[lane] = rot.sin;
    }
    (cos, sin)
}

/// Rod correction per lane, already scaled by stiffness.
fn rod_delta4(
    a: &Vec3x4,
    b: &Vec3x4,
    min_dist: F64x4,
    max_dist: F64x4,
    relaxation: F64x4,
    stiffness: f64,
    scale: f64,
) -> Vec3x4 {
    let d = *b - *a;
    let dist = map4(d.norm_squared(), |sq| sq.max(MIN_DIST_SQ).sqrt());
    let factor: F64x4 = std::array::from_fn(|i| {
        let required = dist[i].clamp(min_dist[i] * scale, max_dist[i] * scale);
        relaxation[i] * (required / dist[i] - 1.0) * stiffness
    });
    d.scale_each(factor)
}

/// Relax every rod batch.
pub fn relax_rods_simd(model: &FeModel, pos: &mut [Vector3<f64>], stiffness: f64, scale: f64) {
    for batch in &model.simd_rods {
        let a = Vec3x4::gather(pos, batch.nodes[0]);
        let b = Vec3x4::gather(pos, batch.nodes[1]);
        let delta = rod_delta4(
            &a,
            &b,
            batch.min_dist,
            batch.max_dist,
            batch.relaxation_factor,
            stiffness,
            scale,
        );
        (a - delta.scale_each(batch.weight0)).scatter(pos, batch.nodes[0]);
        (b + delta.scale_each(sub4(ONES, batch.weight0))).scatter(pos, batch.nodes[1]);
    }
}

/// Follow-the-leader pass over every rod batch.
pub fn relax_rods_ftl_simd(
    model: &FeModel,
    pos: &mut [Vector3<f64>],
    stiffness: f64,
    scale: f64,
) {
    for batch in &model.simd_rods {
        let a = Vec3x4::gather(pos, batch.nodes[0]);
        let b = Vec3x4::gather(pos, batch.nodes[1]);
        let delta = rod_delta4(
            &a,
            &b,
            batch.min_dist,
            batch.max_dist,
            batch.relaxation_factor,
            stiffness,
            scale,
        );
        let to_b = map4(batch.weight0, |w| if w < 1.0 { 1.0 } else { 0.0 });
        (a - delta.scale_each(sub4(ONES, to_b))).scatter(pos, batch.nodes[0]);
        (b + delta.scale_each(to_b)).scatter(pos, batch.nodes[1]);
    }
}

/// Relax every quad batch, by class.
pub fn relax_quads_simd(model: &FeModel, pos: &mut [Vector3<f64>], stiffness: f64, scale: f64) {
    let [all, one, two] = model.simd_quad_counts;
    let keep = 1.0 - stiffness;

    for batch in &model.simd_quads[..two] {
        let p: [Vec3x4; 4] = std::array::from_fn(|c| Vec3x4::gather(pos, batch.nodes[c]));
        let com = (p[0] + p[1]) * 0.5;
        let basis = basis4(&(p[1] - p[0]), &(p[2] + p[3] - p[0] * 2.0));
        let mut wc = [0.0; 4];
        let mut ws = [0.0; 4];
        for c in 2..4 {
            let d = p[c] - com;
            let ly = d.dot_pairwise(&basis[1]);
            let lz = d.dot_pairwise(&basis[2]);
            let shape = &batch.shape[c];
            let w = batch.weights[c];
            wc = add4(wc, mul4(w, add4(mul4(ly, shape.ys), mul4(lz, shape.zs))));
            ws = add4(ws, mul4(w, sub4(mul4(lz, shape.ys), mul4(ly, shape.zs))));
        }
        let (cos, sin) = rotation4(wc, ws);
        for c in 2..4 {
            let shape = &batch.shape[c];
            let local = Vec3x4 {
                xs: shape.xs,
                ys: sub4(mul4(shape.ys, cos), mul4(shape.zs, sin)),
                zs: add4(mul4(shape.zs, cos), mul4(shape.ys, sin)),
            };
            let r = local_to_world4(&basis, &local) * scale;
            (com + r * stiffness + (p[c] - com) * keep).scatter(pos, batch.nodes[c]);
        }
    }

    for batch in &model.simd_quads[two..one] {
        let p: [Vec3x4; 4] = std::array::from_fn(|c| Vec3x4::gather(pos, batch.nodes[c]));
        let com = p[0];
        let basis = basis4(&(p[2] - p[0]), &(p[3] - p[1]));
        let rs: [Vec3x4; 3] =
            std::array::from_fn(|c| local_to_world4(&basis, &batch.shape[c + 1]) * scale);
        let xs: [Vec3x4; 3] = std::array::from_fn(|c| p[c + 1] - com);
        let mut out = [Vec3x4::zeros(); 3];
        for lane in 0..4 {
            let masses: [f64; 3] = std::array::from_fn(|c| batch.weights[c + 1][lane]);
            let x = xs.map(|v| v.get(lane));
            let r = rs.map(|v| v.get(lane));
            let rot = wahba_rotation(&masses, &x, &r);
            for c in 0..3 {
                set_lane(&mut out[c], lane, &(com.get(lane) + rot.apply(&r[c])));
            }
        }
        for c in 0..3 {
            out[c].scatter(pos, batch.nodes[c + 1]);
        }
    }

    for batch in &model.simd_quads[one..all] {
        let p: [Vec3x4; 4] = std::array::from_fn(|c| Vec3x4::gather(pos, batch.nodes[c]));
        let basis = basis4(&(p[2] - p[0]), &(p[3] - p[1]));
        let com = (0..4).fold(Vec3x4::zeros(), |acc, c| acc + p[c].scale_each(batch.weights[c]));
        let rs: [Vec3x4; 4] =
            std::array::from_fn(|c| local_to_world4(&basis, &batch.shape[c]) * scale);
        let xs: [Vec3x4; 4] = std::array::from_fn(|c| p[c] - com);
        let mut out = [Vec3x4::zeros(); 4];
        for lane in 0..4 {
            let masses: [f64; 4] = std::array::from_fn(|c| batch.weights[c][lane]);
            let x = xs.map(|v| v.get(lane));
            let r = rs.map(|v| v.get(lane));
            let rot = wahba_rotation(&masses, &x, &r);
            let center = com.get(lane);
            for c in 0..4 {
                let target = center + rot.apply(&r[c]) * stiffness + x[c] * keep;
                set_lane(&mut out[c], lane, &target);
            }
        }
        for c in 0..4 {
            out[c].scatter(pos, batch.nodes[c]);
        }
    }
}

#[inline]
fn set_lane(v: &mut Vec3x4, lane: usize, value: &Vector3<f64>) {
    v.xs[lane] = value.x;
    v.ys[lane] = value.y;
    v.zs[lane] = value.z;
}

/// Relax every tri batch, by class.
pub fn relax_tris_simd(model: &FeModel, pos: &mut [Vector3<f64>], scale: f64) {
    let [all, one, two] = model.simd_tri_counts;

    for batch in &model.simd_tris[..two] {
        let p: [Vec3x4; 3] = std::array::from_fn(|c| Vec3x4::gather(pos, batch.nodes[c]));
        let basis = TriBasis4::new(&(p[1] - p[0]), &(p[2] - p[0]));
        let x: F64x4 = std::array::from_fn(|i| {
            scale * batch.v2x[i] + 0.5 * (basis.v1x[i] - scale * batch.v1x[i])
        });
        let y = map4(batch.v2y, |v| v * scale);
        (p[0] + basis.local_xy_to_world(x, y)).scatter(pos, batch.nodes[2]);
    }

    for batch in &model.simd_tris[two..one] {
        let p: [Vec3x4; 3] = std::array::from_fn(|c| Vec3x4::gather(pos, batch.nodes[c]));
        let basis = TriBasis4::new(&(p[1] - p[0]), &(p[2] - p[0]));
        let tv1x = map4(batch.v1x, |v| v * scale);
        let tv2x = map4(batch.v2x, |v| v * scale);
        let tv2y = map4(batch.v2y, |v| v * scale);
        let wc: F64x4 = std::array::from_fn(|i| {
            batch.w2[i] * (tv2x[i] * basis.v2x[i] + tv2y[i] * basis.v2y[i])
                + batch.w1[i] * tv1x[i] * basis.v1x[i]
        });
        let ws: F64x4 = std::array::from_fn(|i| {
            batch.w2[i] * (tv2x[i] * basis.v2y[i] - tv2y[i] * basis.v2x[i])
        });
        let (cos, sin) = rotation4(wc, ws);
        let p1 = p[0] + basis.local_xy_to_world(mul4(cos, tv1x), mul4(sin, tv1x));
        let p2 = p[0]
            + basis.local_xy_to_world(
                sub4(mul4(tv2x, cos), mul4(tv2y, sin)),
                add4(mul4(tv2y, cos), mul4(tv2x, sin)),
            );
        p1.scatter(pos, batch.nodes[1]);
        p2.scatter(pos, batch.nodes[2]);
    }

    for batch in &model.simd_tris[one..all] {
        let p: [Vec3x4; 3] = std::array::from_fn(|c| Vec3x4::gather(pos, batch.nodes[c]));
        let basis = TriBasis4::new(&(p[1] - p[0]), &(p[2] - p[0]));
        let mut offsets = [[0.0; 4]; 6];
        for i in 0..4 {
            let (w1, w2) = (batch.w1[i], batch.w2[i]);
            let w0 = 1.0 - w1 - w2;
            let tv1x = scale * batch.v1x[i];
            let (tv2x, tv2y) = (scale * batch.v2x[i], scale * batch.v2y[i]);
            let (b1x, b2x, b2y) = (basis.v1x[i], basis.v2x[i], basis.v2y[i]);

            let x0neg = (b1x * w1 + b2x * w2, b2y * w2);
            let r0neg = (tv1x * w1 + tv2x * w2, tv2y * w2);
            let x2 = (b2x - x0neg.0, b2y - x0neg.1);
            let r2 = (tv2x - r0neg.0, tv2y - r0neg.1);
            let x1x = b1x - x0neg.0;
            let r1x = tv1x - r0neg.0;
            let cz = |a: (f64, f64), b: (f64, f64)| a.0 * b.1 - a.1 * b.0;

            let rot = Rotation2D::new(
                w2 * (x2.0 * r2.0 + x2.1 * r2.1)
                    + w1 * x1x * r1x
                    + w0 * x0neg.0 * r0neg.0
                    + (w1 + w0) * x0neg.1 * r0neg.1,
                w2 * cz(r2, x2) - w1 * cz((r1x, r0neg.1), (x1x, x0neg.1))
                    + w0 * cz(r0neg, x0neg),
            );
            let (c, s) = (rot.cos, rot.sin);
            let shift = (
                x0neg.0 - (r0neg.0 * c - r0neg.1 * s),
                x0neg.1 - (r0neg.1 * c + r0neg.0 * s),
            );
            offsets[0][i] = shift.0;
            offsets[1][i] = shift.1;
            offsets[2][i] = shift.0 + c * tv1x;
            offsets[3][i] = shift.1 + s * tv1x;
            offsets[4][i] = shift.0 + tv2x * c - tv2y * s;
            offsets[5][i] = shift.1 + tv2y * c + tv2x * s;
        }
        for c in 0..3 {
            (p[0] + basis.local_xy_to_world(offsets[2 * c], offsets[2 * c + 1]))
                .scatter(pos, batch.nodes[c]);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::builder::FeModelBuilder;
    use crate::relax::{relax_quads, relax_rods, relax_tris};
    use approx::assert_relative_eq;

    fn jittered(rest: &[Vector3<f64>], amount: f64) -> Vec<Vector3<f64>> {
        rest.iter()
            .enumerate()
            .map(|(i, p)| {
                let k = i as f64;
                p + Vector3::new((k * 1.3).sin(), (k * 2.1).cos(), (k * 0.7).sin()) * amount
            })
            .collect()
    }

    /// Independent elements, so element order cannot matter.
    fn disjoint_model() -> (FeModel, Vec<Vector3<f64>>) {
        let mut b = FeModelBuilder::new();
        let mut rest = Vec::new();
        for k in 0..3 {
            let x = f64::from(k) * 30.0;
            for p in [
                Vector3::new(x, 0.0, 0.0),
                Vector3::new(x + 10.0, 0.0, 0.0),
                Vector3::new(x + 10.0, 0.0, -10.0),
                Vector3::new(x, 0.0, -10.0),
            ] {
                rest.push(p);
            }
        }
        for (i, p) in rest.iter().enumerate() {
            if i < 2 {
                b.add_static_node(*p);
            } else {
                b.add_dynamic_node(*p, 1.0 + i as f64 * 0.1);
            }
        }
        b.add_quad([0, 1, 2, 3]);
        b.add_quad([4, 5, 6, 7]);
        b.add_tri([8, 9, 10]);
        b.add_rod(8, 11);
        (b.build().unwrap(), rest)
    }

    #[test]
    fn test_simd_matches_scalar() {
        let (model, rest) = disjoint_model();
        let start = jittered(&rest, 2.0);

        let mut scalar = start.clone();
        relax_rods(&model, &mut scalar, 0.8, 1.1);
        relax_quads(&model, &mut scalar, 0.9, 1.1);
        relax_tris(&model, &mut scalar, 1.1);

        let mut batched = start;
        relax_rods_simd(&model, &mut batched, 0.8, 1.1);
        relax_quads_simd(&model, &mut batched, 0.9, 1.1);
        relax_tris_simd(&model, &mut batched, 1.1);

        for (s, b) in scalar.iter().zip(&batched) {
            assert_relative_eq!(s, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_padding_lanes_are_harmless() {
        let (model, rest) = disjoint_model();
        assert!(model.simd_rods.iter().all(|b| b.nodes[0] == [8; 4]));
        let mut pos = jittered(&rest, 1.0);
        relax_rods_simd(&model, &mut pos, 1.0, 1.0);
        assert_relative_eq!((pos[11] - pos[8]).norm(), 10.0, epsilon = 1e-9);
    }
}
