use std::sync::Arc;
use nw_reconfig_schemas::settings::ReconfigSettings;
use crate::collaborators::ClusterInventory;
use crate::gateway::RemoteCommandGateway;

pub mod orchestrator;

/// The minimal set of data every step of a run needs: settings, how to reach the nodes, where to
/// look up topology, and the id this run files its backups under.
#[derive(Clone)]
pub struct ReconfigCommon {
    pub settings: ReconfigSettings,
    pub gateway: Arc<dyn RemoteCommandGateway>,
    pub inventory: Arc<dyn ClusterInventory>,
    pub operation_id: String,
}

fn join_dir(root: &str, id: &str) -> String {
    format!("{}/{id}", root.trim_end_matches('/'))
}

impl ReconfigCommon {
    pub fn user(&self) -> &str {
        &self.settings.ssh.user
    }

    /// Backup directory on a host or guest for the batch identified by `id`.
    pub fn node_backup_dir(&self, id: &str) -> String {
        join_dir(&self.settings.paths.node_backup_root, id)
    }

    /// Backup directory on the controller for the batch identified by `id`.
    pub fn controller_backup_dir(&self, id: &str) -> String {
        join_dir(&self.settings.paths.controller_backup_root, id)
    }
}
