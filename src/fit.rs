//! Shape matching of ctrl transforms to node clouds.
//!
//! A fit matrix drives one ctrl from the positions of a weighted set of nodes. Matrices
//! with one or two nodes only track a center; general matrices also recover the best
//! rotation of the cloud relative to its bind pose (Wahba's problem, solved by SVD).

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use crate::model::{FeModel, FitMatrix};
use crate::types::Transform;

/// Below this total of singular values the cloud has no usable orientation.
const DEGENERATE_SINGULAR_SUM: f64 = 1e-12;

/// Recovered pose of a node cloud.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitFrame {
    /// Weighted center of the cloud.
    pub center: Vector3<f64>,
    /// Rotation from the bind pose.
    pub rotation: UnitQuaternion<f64>,
}

/// Weight range of matrix `index`.
fn weight_range(model: &FeModel, index: usize) -> std::ops::Range<usize> {
    let begin = index
        .checked_sub(1)
        .map_or(0, |prev| model.fit_matrices[prev].end);
    begin..model.fit_matrices[index].end
}

/// Weighted average of node positions over a weight range.
fn weighted_center(
    model: &FeModel,
    range: std::ops::Range<usize>,
    pos: &[Vector3<f64>],
) -> Vector3<f64> {
    let mut sum = Vector3::zeros();
    let mut total = 0.0;
    for w in &model.fit_weights[range] {
        sum += pos[w.node] * w.weight;
        total += w.weight;
    }
    if total > 0.0 { sum / total } else { sum }
}

/// Place every fit matrix node at the center of its weighted nodes.
///
/// General matrices with static weights center on the static nodes only.
pub fn fit_centers(model: &FeModel, pos: &mut [Vector3<f64>]) {
    let [_, one, two] = model.fit_matrix_counts;
    for (index, fm) in model.fit_matrices.iter().enumerate() {
        let range = weight_range(model, index);
        let center = if index < two {
            let w = &model.fit_weights[range];
            (pos[w[0].node] + pos[w[1].node]) * 0.5
        } else if index < one {
            pos[model.fit_weights[range.start].node]
        } else {
            let end = if fm.begin_dynamic == range.start {
                range.end
            } else {
                fm.begin_dynamic
            };
            weighted_center(model, range.start..end, pos)
        };
        pos[fm.node] = center;
    }
}

/// Best rigid frame of a general fit matrix's cloud.
///
/// Falls back to `fallback` rotation when the cloud is degenerate.
pub fn fit_frame(
    model: &FeModel,
    index: usize,
    pos: &[Vector3<f64>],
    fallback: &UnitQuaternion<f64>,
) -> FitFrame {
    let fm: &FitMatrix = &model.fit_matrices[index];
    let range = weight_range(model, index);
    let center = weighted_center(model, range.clone(), pos);

    let mut apq = Matrix3::zeros();
    for w in &model.fit_weights[range] {
        let rest = model.init_pose[model.node_to_ctrl(w.node)].translation.vector - fm.center;
        apq += (pos[w.node] - center) * rest.transpose() * w.weight;
    }

    let svd = apq.svd(true, true);
    let rotation = match (svd.u, svd.v_t) {
        (Some(mut u), Some(v_t)) if svd.singular_values.sum() > DEGENERATE_SINGULAR_SUM => {
            let mut r = u * v_t;
            if r.determinant() < 0.0 {
                let smallest = svd.singular_values.imin();
                u.column_mut(smallest).neg_mut();
                r = u * v_t;
            }
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r))
        }
        _ => *fallback,
    };
    FitFrame { center, rotation }
}

/// Write fitted sim transforms for every fit matrix.
///
/// Small matrices keep the animated rotation at the fitted center. Bone offsets from
/// the fitted center are multiplied by `model_scale`.
pub fn fit_transforms(
    model: &FeModel,
    pos: &[Vector3<f64>],
    anim: &[Transform],
    sim: &mut [Transform],
    model_scale: f64,
) {
    let [_, one, _] = model.fit_matrix_counts;
    for (index, fm) in model.fit_matrices.iter().enumerate() {
        let fallback = anim[fm.ctrl].rotation;
        if index < one {
            sim[fm.ctrl] = Transform::from_parts(pos[fm.node].into(), fallback);
            continue;
        }
        let frame = fit_frame(model, index, pos, &fallback);
        let mut bone = fm.bone;
        bone.translation.vector *= model_scale;
        sim[fm.ctrl] = Transform::from_parts(frame.center.into(), frame.rotation) * bone;
    }
}

/// Pull dynamic nodes of general fit matrices toward their rigidly fitted bind pose.
///
/// `amount` in `[0, 1]` is the blend toward the rigid target.
pub fn feedback_fit_transforms(
    model: &FeModel,
    pos: &mut [Vector3<f64>],
    anim: &[Transform],
    amount: f64,
) {
    let [all, one, _] = model.fit_matrix_counts;
    for index in one..all {
        let fm = &model.fit_matrices[index];
        let frame = fit_frame(model, index, pos, &anim[fm.ctrl].rotation);
        for w in &model.fit_weights[fm.begin_dynamic..fm.end] {
            let rest = model.init_pose[model.node_to_ctrl(w.node)].translation.vector;
            let target = frame.center + frame.rotation * (rest - fm.center);
            pos[w.node] = pos[w.node] * (1.0 - amount) + target * amount;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::builder::FeModelBuilder;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Translation3};

    /// A tetrahedron of dynamic nodes driving a virtual ctrl, plus a pair-driven node.
    fn model() -> FeModel {
        let mut b = FeModelBuilder::new();
        let points = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(0.0, 10.0, 0.0),
            Vector3::new(0.0, 0.0, 10.0),
        ];
        for p in points {
            b.add_dynamic_node(p, 1.0);
        }
        let mid = b.add_dynamic_node(Vector3::new(5.0, 0.0, 0.0), 1.0);
        let pose = Isometry3::from_parts(
            Translation3::new(2.5, 2.5, 2.5),
            UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
        );
        let ctrl = b.add_virtual_ctrl(pose);
        let mid_ctrl = b.ctrl_of(mid).unwrap();
        b.add_fit_matrix(ctrl, 3, &[0, 1, 2, 3]);
        b.add_fit_matrix(mid_ctrl, mid, &[0, 1]);
        b.build().unwrap()
    }

    fn rest_positions(model: &FeModel) -> Vec<Vector3<f64>> {
        (0..model.node_count)
            .map(|n| model.init_pose[model.node_to_ctrl(n)].translation.vector)
            .collect()
    }

    #[test]
    fn test_small_matrix_center() {
        let model = model();
        assert_eq!(model.fit_matrix_counts, [2, 1, 1]);
        let mut pos = rest_positions(&model);
        pos[1].x = 20.0;
        fit_centers(&model, &mut pos);
        assert_relative_eq!(pos[4], Vector3::new(10.0, 0.0, 0.0));
    }

    #[test]
    fn test_rigid_motion_is_recovered() {
        let model = model();
        let motion = Isometry3::from_parts(
            Translation3::new(3.0, -4.0, 1.0),
            UnitQuaternion::from_euler_angles(0.4, -0.3, 1.2),
        );
        let pos: Vec<Vector3<f64>> = rest_positions(&model)
            .iter()
            .map(|p| motion.transform_vector(p) + motion.translation.vector)
            .collect();
        let anim = model.init_pose.clone();
        let mut sim = model.init_pose.clone();
        fit_transforms(&model, &pos, &anim, &mut sim, 1.0);

        let ctrl = model.fit_matrices[1].ctrl;
        let expected = motion * model.init_pose[ctrl];
        assert_relative_eq!(
            sim[ctrl].translation.vector,
            expected.translation.vector,
            epsilon = 1e-9
        );
        assert_relative_eq!(sim[ctrl].rotation, expected.rotation, epsilon = 1e-9);
    }

    #[test]
    fn test_bone_offset_follows_model_scale() {
        let model = model();
        let pos: Vec<Vector3<f64>> = rest_positions(&model).iter().map(|p| p * 2.0).collect();
        let anim = model.init_pose.clone();
        let mut sim = model.init_pose.clone();
        fit_transforms(&model, &pos, &anim, &mut sim, 2.0);

        let ctrl = model.fit_matrices[1].ctrl;
        let rest = model.init_pose[ctrl];
        assert_relative_eq!(
            sim[ctrl].translation.vector,
            rest.translation.vector * 2.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(sim[ctrl].rotation, rest.rotation, epsilon = 1e-9);
    }

    #[test]
    fn test_feedback_restores_shape() {
        let model = model();
        let rest = rest_positions(&model);
        let mut pos = rest.clone();
        pos[1].x = 14.0;
        feedback_fit_transforms(&model, &mut pos, &model.init_pose, 1.0);
        // A full-strength pull lands on a rigid copy of the bind pose.
        assert_relative_eq!((pos[1] - pos[0]).norm(), 10.0, epsilon = 1e-6);
        assert_relative_eq!((pos[2] - pos[0]).norm(), 10.0, epsilon = 1e-6);
        assert_relative_eq!((pos[2] - pos[1]).norm(), 200f64.sqrt(), epsilon = 1e-6);
    }
}
