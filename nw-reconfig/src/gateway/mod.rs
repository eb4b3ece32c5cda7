use async_trait::async_trait;

pub mod ssh;

/// Exit code, stdout and stderr of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { exit_code: 0, stdout: stdout.into(), stderr: String::new() }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self { exit_code, stdout: String::new(), stderr: stderr.into() }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non blank stdout lines, trimmed.
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Runs commands on cluster hosts and guests, and on the controller itself. Transport problems
/// (unreachable host, timeout) are returned as errors, a command that ran and failed is returned as
/// a `CommandOutput` with a non zero exit code.
#[async_trait]
pub trait RemoteCommandGateway: Send + Sync {
    async fn run(&self, host: &str, user: &str, cmd: &str) -> anyhow::Result<CommandOutput>;
    /// Starts a long running command and waits for it by polling, returning its exit code.
    async fn run_async(&self, host: &str, user: &str, cmd: &str) -> anyhow::Result<i32>;
    async fn run_local(&self, cmd: &str) -> anyhow::Result<CommandOutput>;
    async fn write_file(&self, host: &str, user: &str, path: &str, contents: &str) -> anyhow::Result<()>;
    /// Whether a session can currently be opened to the host.
    async fn try_connect(&self, host: &str, user: &str) -> bool;
}
