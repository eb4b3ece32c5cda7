use nw_reconfig_schemas::settings::PathSettings;
use crate::direction::Direction;
use crate::gateway::CommandOutput;
use crate::orchestration::ReconfigCommon;

/// Exit code reported for a command that never ran because the node could not be reached.
const UNREACHABLE_EXIT_CODE: i32 = 255;

/// One host and guest pair being worked on, and the directories its backups go to and come from.
pub struct NodeSession<'a> {
    pub common: &'a ReconfigCommon,
    pub host: String,
    pub guest: String,
    pub direction: Direction,
    /// where this run snapshots live files before changing them
    pub backup_dir: String,
    /// where a revert restores previous content from
    pub restore_dir: String,
}

impl<'a> NodeSession<'a> {
    pub fn paths(&self) -> &PathSettings {
        &self.common.settings.paths
    }

    pub fn guest_dir(&self) -> String {
        self.paths().guest_dir(&self.guest)
    }

    async fn run(&self, node: &str, cmd: &str) -> CommandOutput {
        match self.common.gateway.run(node, self.common.user(), cmd).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!("could not run '{}' on {}: {:#}", cmd, node, err);
                CommandOutput::failed(UNREACHABLE_EXIT_CODE, format!("{err:#}"))
            }
        }
    }

    /// A transport failure is reported like a failed command, callers only look at the exit code.
    pub async fn run_on_host(&self, cmd: &str) -> CommandOutput {
        self.run(&self.host, cmd).await
    }

    pub async fn run_on_guest(&self, cmd: &str) -> CommandOutput {
        self.run(&self.guest, cmd).await
    }

    pub async fn run_async_on_host(&self, cmd: &str) -> i32 {
        match self.common.gateway.run_async(&self.host, self.common.user(), cmd).await {
            Ok(code) => code,
            Err(err) => {
                tracing::warn!("could not run '{}' on {}: {:#}", cmd, self.host, err);
                UNREACHABLE_EXIT_CODE
            }
        }
    }

    pub async fn write_on_host(&self, path: &str, contents: &str) -> anyhow::Result<()> {
        self.common.gateway.write_file(&self.host, self.common.user(), path, contents).await
    }

    pub async fn write_on_guest(&self, path: &str, contents: &str) -> anyhow::Result<()> {
        self.common.gateway.write_file(&self.guest, self.common.user(), path, contents).await
    }

    pub async fn guest_reachable(&self) -> bool {
        self.common.gateway.try_connect(&self.guest, self.common.user()).await
    }
}
