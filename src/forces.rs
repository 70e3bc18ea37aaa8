//! Velocity-level forces applied during integration.
//!
//! Positions are Verlet pairs: `pos1` is the current position and `pos0` the previous
//! one, so editing `pos0` changes the implied velocity `pos1 - pos0`. Everything here
//! runs before prediction and only touches dynamic nodes.

use nalgebra::{Vector3, Vector4};

use crate::model::FeModel;
use crate::relax::MIN_DIST_SQ;

/// Springs shorter than this are skipped.
const MIN_SPRING_LENGTH: f64 = 1.0;

/// Damped springs between node pairs, applied as impulses on `pos0`.
pub fn integrate_springs(
    model: &FeModel,
    pos0: &mut [Vector3<f64>],
    pos1: &[Vector3<f64>],
    dt: f64,
    scale: f64,
) {
    for spring in &model.springs {
        let [a, b] = spring.nodes;
        let d1 = pos1[a] - pos1[b];
        let length = d1.norm();
        if length < MIN_SPRING_LENGTH {
            continue;
        }
        let dir = d1 / length;
        let d0 = pos0[a] - pos0[b];
        let stretch = (length - spring.rest_length * scale) * spring.spring_constant * dt;
        let damping = (d1 - d0).dot(&dir) * spring.spring_damping;
        let impulse = dir * ((stretch + damping) * dt);
        pos0[a] -= impulse * spring.node_weight0;
        pos0[b] += impulse * (1.0 - spring.node_weight0);
    }
}

/// Per-node drag: linear in speed plus an exponential decay.
pub fn apply_node_air_drag(
    pos0: &mut [Vector3<f64>],
    pos1: &[Vector3<f64>],
    static_node_count: usize,
    vel_drag: f64,
    exp_drag: f64,
    dt: f64,
) {
    let exp = 1.0 - (-exp_drag * dt).exp();
    for (p0, p1) in pos0.iter_mut().zip(pos1).skip(static_node_count) {
        let v = p1 - *p0;
        let k = (exp + vel_drag * v.norm()).min(1.0);
        *p0 += v * k;
    }
}

/// Drag along the normal of every fully dynamic quad.
pub fn apply_quad_air_drag(
    model: &FeModel,
    pos0: &mut [Vector3<f64>],
    pos1: &[Vector3<f64>],
    vel_drag: f64,
    exp_drag: f64,
    dt: f64,
) {
    let exp = 1.0 - (-exp_drag * dt).exp();
    let [all, one, _] = model.quad_counts;
    for quad in &model.quads[one..all] {
        let [n0, n1, n2, n3] = quad.nodes;
        let normal = (pos0[n2] - pos0[n0]).cross(&(pos0[n3] - pos0[n1]));
        let inv_len_sq = 1.0 / normal.norm_squared().max(MIN_DIST_SQ);
        for node in quad.nodes {
            let along = normal.dot(&(pos1[node] - pos0[node]));
            let k = (exp + along.abs() * vel_drag).min(1.0);
            pos0[node] += normal * (k * along * inv_len_sq);
        }
    }
}

/// Wind pressure on every quad, applied to `pos1`.
///
/// `wind` holds the direction in XYZ and the strength in W. `windage` already includes
/// the environment multiplier.
pub fn apply_wind(
    model: &FeModel,
    pos1: &mut [Vector3<f64>],
    wind: &Vector4<f64>,
    windage: f64,
    wind_drag: f64,
    dt: f64,
) {
    let pressure = windage * dt * wind.w;
    if pressure == 0.0 {
        return;
    }
    let wind = wind.xyz() * pressure;
    for quad in &model.quads {
        let [n0, n1, n2, n3] = quad.nodes;
        let area = (pos1[n2] - pos1[n0]).cross(&(pos1[n3] - pos1[n1]));
        let area_len = area.norm();
        if area_len <= f64::EPSILON {
            continue;
        }
        let normal = area / area_len;
        let normal_force = normal.dot(&wind);
        let impulse = area * normal_force + (wind - normal * normal_force) * (wind_drag * area_len);
        for (corner, node) in quad.nodes.into_iter().enumerate() {
            pos1[node] += impulse * quad.shape[corner].w;
        }
    }
}

/// Blend every quad corner velocity toward the quad's mean velocity.
///
/// `rate` is clamped to `[0, 1]`; 0 leaves velocities untouched.
pub fn smooth_quad_velocities(
    model: &FeModel,
    pos0: &mut [Vector3<f64>],
    pos1: &[Vector3<f64>],
    rate: f64,
) {
    let mul = 1.0 - rate.clamp(0.0, 1.0);
    let blend = 1.0 - mul;
    let [all, one, two] = model.quad_counts;
    let velocity = |pos0: &[Vector3<f64>], n: usize| pos0[n] - pos1[n];
    let write = |pos0: &mut [Vector3<f64>], n: usize, target: &Vector3<f64>| {
        let v = pos0[n] - pos1[n];
        pos0[n] = pos1[n] + v * mul + target;
    };

    for quad in &model.quads[..two] {
        let [n0, n1, n2, n3] = quad.nodes;
        let target = (velocity(pos0, n0) + velocity(pos0, n1)) * (0.5 * blend);
        write(pos0, n2, &target);
        write(pos0, n3, &target);
    }
    for quad in &model.quads[two..one] {
        let target = velocity(pos0, quad.nodes[0]) * blend;
        for &n in &quad.nodes[1..] {
            write(pos0, n, &target);
        }
    }
    for quad in &model.quads[one..all] {
        let mean: Vector3<f64> = (0..4)
            .map(|c| velocity(pos0, quad.nodes[c]) * quad.shape[c].w)
            .sum();
        let target = mean * blend;
        for n in quad.nodes {
            write(pos0, n, &target);
        }
    }
}

/// Blend both rod endpoint velocities toward the rod's weighted velocity.
pub fn smooth_rod_velocities(
    model: &FeModel,
    pos0: &mut [Vector3<f64>],
    pos1: &[Vector3<f64>],
    rate: f64,
) {
    let mul = 1.0 - rate.clamp(0.0, 1.0);
    let blend = 1.0 - mul;
    for rod in &model.rods {
        let [a, b] = rod.nodes;
        let v0 = pos0[a] - pos1[a];
        let v1 = pos0[b] - pos1[b];
        let target = (v0 + (v1 - v0) * rod.weight0) * blend;
        if a >= model.static_node_count {
            pos0[a] = pos1[a] + v0 * mul + target;
        }
        if b >= model.static_node_count {
            pos0[b] = pos1[b] + v1 * mul + target;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::builder::FeModelBuilder;
    use approx::assert_relative_eq;

    fn free_quad() -> FeModel {
        let mut b = FeModelBuilder::new();
        for p in [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(10.0, 10.0, 0.0),
            Vector3::new(0.0, 10.0, 0.0),
        ] {
            b.add_dynamic_node(p, 1.0);
        }
        b.add_quad([0, 1, 2, 3]);
        b.build().unwrap()
    }

    #[test]
    fn test_node_air_drag_slows_nodes() {
        let pos1 = vec![Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)];
        let mut pos0 = vec![Vector3::zeros(), Vector3::zeros()];
        apply_node_air_drag(&mut pos0, &pos1, 0, 0.0, 6.0, 0.1);
        let k = 1.0 - (-0.6f64).exp();
        assert_relative_eq!(pos0[1].x, k, epsilon = 1e-12);

        // Linear drag saturates at a full stop.
        let mut pos0 = vec![Vector3::zeros(), Vector3::zeros()];
        apply_node_air_drag(&mut pos0, &pos1, 0, 10.0, 0.0, 0.1);
        assert_relative_eq!(pos0[1], pos1[1]);
    }

    #[test]
    fn test_quad_air_drag_removes_normal_velocity_only() {
        let model = free_quad();
        let pos1: Vec<Vector3<f64>> = [
            Vector3::new(1.0, 0.0, 2.0),
            Vector3::new(11.0, 0.0, 2.0),
            Vector3::new(11.0, 10.0, 2.0),
            Vector3::new(1.0, 10.0, 2.0),
        ]
        .to_vec();
        let mut pos0 = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(10.0, 10.0, 0.0),
            Vector3::new(0.0, 10.0, 0.0),
        ];
        apply_quad_air_drag(&model, &mut pos0, &pos1, 1.0, 0.0, 1.0 / 60.0);
        for (p0, p1) in pos0.iter().zip(&pos1) {
            let v = p1 - p0;
            assert_relative_eq!(v.z, 0.0, epsilon = 1e-12);
            assert_relative_eq!(v.x, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_wind_pushes_along_normal() {
        let model = free_quad();
        let rest: Vec<Vector3<f64>> = (0..4).map(model_rest).collect();
        let mut pos1 = rest.clone();
        let wind = Vector4::new(0.0, 0.0, 1.0, 1.0);
        apply_wind(&model, &mut pos1, &wind, 0.01, 0.0, 0.1);
        for (p, r) in pos1.iter().zip(&rest) {
            assert!(p.z > r.z);
            assert_relative_eq!(p.x, r.x);
        }

        // Zero strength is a no-op.
        let mut still = rest.clone();
        apply_wind(&model, &mut still, &Vector4::new(0.0, 0.0, 1.0, 0.0), 0.01, 0.0, 0.1);
        assert_eq!(still, rest);
    }

    fn model_rest(i: usize) -> Vector3<f64> {
        [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(10.0, 10.0, 0.0),
            Vector3::new(0.0, 10.0, 0.0),
        ][i]
    }

    #[test]
    fn test_full_quad_smoothing_equalizes_velocities() {
        let model = free_quad();
        let pos1: Vec<Vector3<f64>> = (0..4).map(model_rest).collect();
        let mut pos0 = pos1.clone();
        pos0[0].z += 4.0;
        smooth_quad_velocities(&model, &mut pos0, &pos1, 1.0);
        for (p0, p1) in pos0.iter().zip(&pos1) {
            assert_relative_eq!((p0 - p1).z, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_rod_smoothing_skips_static_nodes() {
        let mut b = FeModelBuilder::new();
        b.add_static_node(Vector3::zeros());
        b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
        b.add_rod(0, 1);
        let model = b.build().unwrap();
        let pos1 = vec![Vector3::zeros(), Vector3::new(10.0, 0.0, 0.0)];
        let mut pos0 = vec![Vector3::zeros(), Vector3::new(10.0, 0.0, 3.0)];
        smooth_rod_velocities(&model, &mut pos0, &pos1, 1.0);
        assert_eq!(pos0[0], Vector3::zeros());
        assert_relative_eq!(pos0[1], pos1[1], epsilon = 1e-12);
    }

    #[test]
    fn test_spring_pulls_toward_rest() {
        let mut b = FeModelBuilder::new();
        b.add_dynamic_node(Vector3::zeros(), 1.0);
        b.add_dynamic_node(Vector3::new(10.0, 0.0, 0.0), 1.0);
        b.add_spring(0, 1, 100.0, 0.0);
        let model = b.build().unwrap();
        let pos1 = vec![Vector3::zeros(), Vector3::new(20.0, 0.0, 0.0)];
        let mut pos0 = pos1.clone();
        integrate_springs(&model, &mut pos0, &pos1, 0.1, 1.0);
        // Equal masses: equal and opposite impulses along the spring axis.
        let v0 = pos1[0] - pos0[0];
        let v1 = pos1[1] - pos0[1];
        assert_relative_eq!(v0.x.abs(), 5.0, epsilon = 1e-12);
        assert_relative_eq!(v0 + v1, Vector3::zeros(), epsilon = 1e-12);
        assert_eq!(v0.y, 0.0);

        // Shorter than a unit: nothing to integrate.
        let close = vec![Vector3::zeros(), Vector3::new(0.5, 0.0, 0.0)];
        let mut prev = close.clone();
        integrate_springs(&model, &mut prev, &close, 0.1, 1.0);
        assert_eq!(prev, close);
    }
}
