//! Hot replacement of the model behind a running instance.

use std::sync::Arc;

use hashbrown::HashMap;
use nalgebra::Vector3;
use tracing::debug;

use super::SoftbodyInstance;
use crate::error::Result;
use crate::model::FeModel;

impl SoftbodyInstance {
    /// Switch to `model`, carrying over the state of ctrls found in both models.
    ///
    /// Ctrls are matched by name hash. Matched ctrls keep their transforms, and their
    /// nodes keep position and velocity. Everything else starts from the new model's
    /// rest pose, translated by the old animated origin of ctrl 0. The instance then wakes up.
    ///
    /// # Errors
    ///
    /// Returns the first invariant `model` violates; the instance is left unchanged.
    pub fn replace_fe_model(&mut self, model: Arc<FeModel>) -> Result<()> {
        model.validate()?;

        let old_model = std::mem::replace(&mut self.model, model);
        let old_pos0 = std::mem::take(&mut self.pos0);
        let old_pos1 = std::mem::take(&mut self.pos1);
        let old_anim = std::mem::take(&mut self.anim);
        let old_sim = std::mem::take(&mut self.sim);
        self.init_state();

        let sim_origin = old_anim
            .first()
            .map_or_else(Vector3::zeros, |tm| tm.translation.vector);
        let old_ctrls: HashMap<u32, usize> = old_model
            .ctrl_hash
            .iter()
            .enumerate()
            .map(|(ctrl, &hash)| (hash, ctrl))
            .collect();

        let model = Arc::clone(&self.model);
        let mut node_matched = vec![false; model.node_count];
        let mut matched = 0usize;
        for (ctrl, hash) in model.ctrl_hash.iter().enumerate() {
            let Some(&old_ctrl) = old_ctrls.get(hash) else {
                self.anim[ctrl].translation.vector += sim_origin;
                self.sim[ctrl].translation.vector += sim_origin;
                continue;
            };
            matched += 1;
            self.anim[ctrl] = old_anim[old_ctrl];
            self.sim[ctrl] = old_sim[old_ctrl];
            if let (Some(node), Some(old_node)) =
                (model.ctrl_to_node(ctrl), old_model.ctrl_to_node(old_ctrl))
            {
                self.pos0[node] = old_pos0[old_node];
                self.pos1[node] = old_pos1[old_node];
                node_matched[node] = true;
            }
        }
        for node in (0..model.node_count).filter(|&node| !node_matched[node]) {
            self.pos0[node] += sim_origin;
            self.pos1[node] += sim_origin;
        }

        debug!(
            id = %self.id,
            ctrls = model.ctrl_count,
            matched,
            nodes = model.node_count,
            "softbody model replaced"
        );
        self.go_wakeup();
        Ok(())
    }
}
