//! Pose ingestion and reconstruction of per-ctrl transforms.
//!
//! Animation drives the instance through `anim` transforms, one per ctrl. After a
//! step, [`SoftbodyInstance::compute_particle_transforms`] rebuilds the `sim`
//! transforms from node positions: node bases and ropes give rotations to nodes
//! that have none, reverse offsets place bones from polygon nodes, and fit matrices
//! shape-match the rest. [`SoftbodyInstance::filter_transforms`] writes the result
//! back into a bone array.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use tracing::trace;

use super::SoftbodyInstance;
use crate::basis::{align_x, normalize_or, perpendicular};
use crate::error::{Result, SoftbodyError, check_index};
use crate::fit::fit_transforms;
use crate::types::Transform;

/// Shorter orthogonalized X axes are replaced by a perpendicular of Y.
const MIN_BASIS_AXIS_LEN: f64 = 0.05;

impl SoftbodyInstance {
    /// Check a ctrl-to-bone map against the model and a bone array of `bone_count`.
    fn check_bone_map(&self, ctrl_to_bone: &[Option<usize>], bone_count: usize) -> Result<()> {
        if ctrl_to_bone.len() != self.model.ctrl_count {
            return Err(SoftbodyError::model_mismatch(format!(
                "bone map has {} entries for {} ctrls",
                ctrl_to_bone.len(),
                self.model.ctrl_count
            )));
        }
        for bone in ctrl_to_bone.iter().flatten() {
            check_index("bone", *bone, bone_count)?;
        }
        Ok(())
    }

    /// Teleport one ctrl to `tm`.
    ///
    /// Nodes with integrators keep part of their position according to their point
    /// damping over the last step; other nodes jump to the pose and lose their velocity.
    ///
    /// # Errors
    ///
    /// Returns [`SoftbodyError::IndexOutOfBounds`] if `ctrl` is out of range.
    pub fn set_ctrl(&mut self, ctrl: usize, tm: Transform) -> Result<()> {
        check_index("ctrl", ctrl, self.anim.len())?;
        self.anim[ctrl] = tm;
        let model = &*self.model;
        match model.ctrl_to_node(ctrl) {
            Some(node) => {
                let origin = tm.translation.vector;
                match model.node_integrators.get(node) {
                    Some(integrator) => {
                        let damp = self.last_dt
                            * integrator.point_damping
                            * self.config.damping_multiplier;
                        if damp < 1.0 {
                            let p = origin * (1.0 - damp) + self.pos1[node] * damp;
                            self.pos0[node] = p;
                            self.pos1[node] = p;
                            self.sim[ctrl].translation.vector = p;
                        }
                    }
                    None => {
                        self.pos0[node] = origin;
                        self.pos1[node] = origin;
                    }
                }
            }
            None => self.sim[ctrl] = tm,
        }
        Ok(())
    }

    /// Teleport every ctrl to `pose`.
    ///
    /// # Errors
    ///
    /// Returns [`SoftbodyError::ModelMismatch`] unless `pose` has one transform per ctrl.
    pub fn set_pose(&mut self, pose: &[Transform]) -> Result<()> {
        self.set_pose_in_frame(&Transform::identity(), pose)
    }

    /// Teleport every ctrl to `frame * pose[ctrl]`.
    ///
    /// # Errors
    ///
    /// Returns [`SoftbodyError::ModelMismatch`] unless `pose` has one transform per ctrl.
    pub fn set_pose_in_frame(&mut self, frame: &Transform, pose: &[Transform]) -> Result<()> {
        if pose.len() != self.model.ctrl_count {
            return Err(SoftbodyError::model_mismatch(format!(
                "pose has {} transforms for {} ctrls",
                pose.len(),
                self.model.ctrl_count
            )));
        }
        for (ctrl, tm) in pose.iter().enumerate() {
            self.set_ctrl(ctrl, frame * tm)?;
        }
        self.anim_transform_changed = true;
        self.sim_transforms_outdated = false;
        Ok(())
    }

    /// Teleport mapped ctrls to their bones, zeroing node velocities.
    ///
    /// # Errors
    ///
    /// Returns an error if the map does not match the model or names a missing bone.
    pub fn set_pose_from_bones(
        &mut self,
        ctrl_to_bone: &[Option<usize>],
        bones: &[Transform],
    ) -> Result<()> {
        self.check_bone_map(ctrl_to_bone, bones.len())?;
        self.copy_mapped_bones(ctrl_to_bone, bones);
        self.anim_transform_changed = true;
        self.sim_transforms_outdated = false;
        Ok(())
    }

    /// Initialize the instance from a bone pose: mapped ctrls jump to their bones and
    /// ctrl offsets override their children.
    ///
    /// # Errors
    ///
    /// Returns an error if the map does not match the model or names a missing bone.
    pub fn initialize_transforms(
        &mut self,
        ctrl_to_bone: &[Option<usize>],
        bones: &[Transform],
    ) -> Result<()> {
        self.check_bone_map(ctrl_to_bone, bones.len())?;
        self.copy_mapped_bones(ctrl_to_bone, bones);
        self.update_ctrl_offsets(true);
        self.anim_transform_changed = false;
        Ok(())
    }

    fn copy_mapped_bones(&mut self, ctrl_to_bone: &[Option<usize>], bones: &[Transform]) {
        let model = &*self.model;
        for (ctrl, bone) in ctrl_to_bone.iter().enumerate() {
            let Some(bone) = *bone else {
                continue;
            };
            let tm = bones[bone];
            self.anim[ctrl] = tm;
            self.sim[ctrl] = tm;
            if let Some(node) = model.ctrl_to_node(ctrl) {
                self.pos0[node] = tm.translation.vector;
                self.pos1[node] = tm.translation.vector;
            }
        }
    }

    /// Derive offset ctrls from their parents' animated transforms.
    ///
    /// With `override_pose`, the children's sim transforms and nodes jump there too.
    pub fn update_ctrl_offsets(&mut self, override_pose: bool) {
        let model = &*self.model;
        let scale = self.config.constraint_scale();

        let offsets = model.ctrl_offsets.iter().map(|offset| {
            let parent = &self.anim[offset.ctrl_parent];
            let origin = parent.transform_point(&(offset.offset * scale).into());
            (
                offset.ctrl_child,
                Transform::from_parts(origin.into(), parent.rotation),
            )
        });
        let os_offsets = model.ctrl_os_offsets.iter().map(|offset| {
            let mut tm = self.anim[offset.ctrl_parent];
            tm.translation.vector += model.rope_offset;
            (offset.ctrl_child, tm)
        });
        let children: Vec<(usize, Transform)> = offsets.chain(os_offsets).collect();

        for (child, tm) in children {
            self.anim[child] = tm;
            if override_pose {
                self.sim[child] = tm;
                if let Some(node) = model.ctrl_to_node(child) {
                    self.pos0[node] = tm.translation.vector;
                    self.pos1[node] = tm.translation.vector;
                }
            }
        }
    }

    /// Copy mapped bones into the animated transforms and derive offset ctrls.
    ///
    /// Ignored while dormant.
    ///
    /// # Errors
    ///
    /// Returns an error if the map does not match the model or names a missing bone.
    pub fn set_animated_transforms(
        &mut self,
        bones: &[Transform],
        ctrl_to_bone: &[Option<usize>],
    ) -> Result<()> {
        self.check_bone_map(ctrl_to_bone, bones.len())?;
        if self.activity.is_dormant() {
            return Ok(());
        }
        for (ctrl, bone) in ctrl_to_bone.iter().enumerate() {
            if let Some(bone) = *bone {
                self.anim[ctrl] = bones[bone];
            }
        }
        self.update_ctrl_offsets(false);
        self.anim_transform_changed = true;
        Ok(())
    }

    /// Write simulated transforms into `bones`.
    ///
    /// Counts as a consumer of this frame's transforms for the activity state. Returns
    /// whether any bone was written; a dormant or waking instance writes nothing.
    ///
    /// Bones are rigid transforms. Reverse offsets and fitted bone offsets are
    /// multiplied by the instance's
    /// [`SoftbodyConfig::model_scale`](crate::SoftbodyConfig::model_scale), set through
    /// [`set_config`](Self::set_config).
    ///
    /// # Errors
    ///
    /// Returns an error if the map does not match the model or names a missing bone.
    pub fn filter_transforms(
        &mut self,
        bones: &mut [Transform],
        ctrl_to_bone: &[Option<usize>],
    ) -> Result<bool> {
        self.check_bone_map(ctrl_to_bone, bones.len())?;
        if !self.activity.before_filter_transforms() {
            return Ok(false);
        }
        self.anim_transform_changed = true;

        let model = &*self.model;
        if self.sim_transforms_outdated {
            for node in 0..model.static_node_count {
                let ctrl = model.node_to_ctrl(node);
                if let Some(bone) = ctrl_to_bone[ctrl] {
                    self.sim[ctrl] = bones[bone];
                }
            }
        }

        self.compute_particle_transforms();

        let model = &*self.model;
        let node_ctrls = (model.rot_lock_static_node_count..model.node_count)
            .map(|node| model.node_to_ctrl(node));
        let fit_ctrls = model
            .fit_matrices
            .iter()
            .map(|fm| fm.ctrl)
            .filter(|&ctrl| model.ctrl_to_node(ctrl).is_none());
        let mut written = 0usize;
        for ctrl in node_ctrls.chain(fit_ctrls) {
            if let Some(bone) = ctrl_to_bone[ctrl] {
                bones[bone] = self.sim[ctrl];
                written += 1;
            }
        }
        trace!(id = %self.id, written, "softbody filter transforms");
        Ok(true)
    }

    /// Rebuild sim transforms from the current node positions if a step ran since the
    /// last rebuild.
    pub fn compute_particle_transforms(&mut self) -> &[Transform] {
        if !self.sim_transforms_outdated {
            return &self.sim;
        }
        let model = &*self.model;
        let scale = self.config.model_scale;
        let pos = &mut self.pos1;
        let (anim, sim) = (&self.anim, &mut self.sim);

        for node in model.rot_lock_static_node_count..model.static_node_count {
            let ctrl = model.node_to_ctrl(node);
            sim[ctrl] = Transform::from_parts(pos[node].into(), anim[ctrl].rotation);
        }

        for base in &model.node_bases {
            let mut axis_x = pos[base.x1] - pos[base.x0];
            let axis_y = normalize_or(&(pos[base.y1] - pos[base.y0]), -Vector3::z());
            axis_x -= axis_y * axis_y.dot(&axis_x);
            let len = axis_x.norm();
            let axis_x = if len > MIN_BASIS_AXIS_LEN {
                axis_x / len
            } else {
                perpendicular(&axis_y)
            };
            let frame = Matrix3::from_columns(&[axis_x, axis_y, axis_x.cross(&axis_y)]);
            let rotation =
                UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(frame));
            sim[model.node_to_ctrl(base.node)] =
                Transform::from_parts(pos[base.node].into(), rotation * base.q_adjust);
        }

        for rope in 0..model.rope_count {
            let (begin, end) = model.rope_range(rope);
            if end < begin + 2 {
                continue;
            }
            let links = &model.ropes[begin..end];
            let end_node = links[links.len() - 1];
            let end_ctrl = model.node_to_ctrl(end_node);
            if links.len() == 2 {
                let prev = links[0];
                sim[end_ctrl] = align_x(&anim[end_ctrl], &(pos[end_node] - pos[prev]), &pos[end_node]);
                continue;
            }
            let mut rotation = anim[end_ctrl].rotation;
            for pair in links[1..].windows(2) {
                let (node, next) = (pair[0], pair[1]);
                let ctrl = model.node_to_ctrl(node);
                let aligned = align_x(&anim[ctrl], &(pos[next] - pos[node]), &pos[node]);
                rotation = aligned.rotation;
                sim[ctrl] = aligned;
            }
            sim[end_ctrl] = Transform::from_parts(pos[end_node].into(), rotation);
        }

        for &node in model.free_nodes.iter().rev() {
            let ctrl = model.node_to_ctrl(node);
            sim[ctrl] = Transform::from_parts(pos[node].into(), anim[ctrl].rotation);
        }

        for offset in model.reverse_offsets.iter().rev() {
            let bone = &mut sim[offset.bone_ctrl];
            let center = pos[offset.target_node] - bone.rotation * (offset.offset * scale);
            bone.translation.vector = center;
            if let Some(node) = model.ctrl_to_node(offset.bone_ctrl) {
                pos[node] = center;
                self.pos0[node] = center;
            }
        }

        fit_transforms(model, pos, anim, sim, scale);
        self.sim_transforms_outdated = false;
        &self.sim
    }
}
