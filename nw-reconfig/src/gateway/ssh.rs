use std::process::Stdio;
use std::time::Duration;
use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use nw_reconfig_schemas::settings::ReconfigSettings;
use crate::gateway::{CommandOutput, RemoteCommandGateway};

/// Runs remote commands through the system `ssh` client as sub processes. We only need to run
/// commands and write the odd file, so a full ssh library is not worth it.
pub struct SshGateway {
    identity_file: Option<String>,
    connect_timeout_secs: u64,
    command_timeout: Duration,
    async_timeout: Duration,
    poll_interval: Duration,
}

impl SshGateway {
    pub fn new(settings: &ReconfigSettings) -> Self {
        Self {
            identity_file: settings.ssh.identity_file.clone(),
            connect_timeout_secs: settings.ssh.connect_timeout_secs,
            command_timeout: Duration::from_secs(settings.timings.command_timeout_secs),
            async_timeout: Duration::from_secs(settings.timings.async_command_timeout_secs),
            poll_interval: Duration::from_secs(settings.timings.async_poll_interval_secs),
        }
    }

    fn ssh_args(&self, host: &str, user: &str) -> Vec<String> {
        let mut args = vec![];
        if let Some(key) = &self.identity_file {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        // TODO - host keys are not pinned, accept whatever the node presents until the cluster
        //  inventory carries known host keys
        for opt in [
            "BatchMode=yes".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ] {
            args.push("-o".to_string());
            args.push(opt);
        }
        args.push(format!("{user}@{host}"));
        args
    }

    async fn output_with_timeout(&self, mut command: Command, description: &str) -> anyhow::Result<CommandOutput> {
        command.stdin(Stdio::null()).kill_on_drop(true);
        let output = match tokio::time::timeout(self.command_timeout, command.output()).await {
            Ok(output) => output.with_context(|| format!("spawning {description}"))?,
            Err(_) => bail!("{description} timed out after {}s", self.command_timeout.as_secs()),
        };
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

fn log_output(cmd: &str, host: &str, output: &CommandOutput) {
    tracing::info!(
        "CMD: {} | RC: {} | OUT: {:?} | ERR: {:?} | HOST: {}",
        cmd, output.exit_code, output.stdout.trim(), output.stderr.trim(), host
    );
}

#[async_trait]
impl RemoteCommandGateway for SshGateway {
    async fn run(&self, host: &str, user: &str, cmd: &str) -> anyhow::Result<CommandOutput> {
        let mut command = Command::new("ssh");
        command.args(self.ssh_args(host, user)).arg(cmd);
        let output = self.output_with_timeout(command, &format!("remote command on {host}")).await?;
        log_output(cmd, host, &output);
        Ok(output)
    }

    async fn run_async(&self, host: &str, user: &str, cmd: &str) -> anyhow::Result<i32> {
        tracing::info!("{} on node {} (async)", cmd, host);
        let mut child = Command::new("ssh")
            .args(self.ssh_args(host, user))
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning async command on {host}"))?;
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                let exit_code = status.code().unwrap_or(-1);
                tracing::info!("*** Async command {} status returned: {}", cmd, exit_code);
                return Ok(exit_code);
            }
            if started.elapsed() >= self.async_timeout {
                child.kill().await?;
                bail!("async command {cmd} on {host} did not finish within {}s", self.async_timeout.as_secs());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn run_local(&self, cmd: &str) -> anyhow::Result<CommandOutput> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        let output = self.output_with_timeout(command, "local command").await?;
        tracing::debug!(
            "CMD: {} | RC: {} | OUT: {:?} | HOST: localhost",
            cmd, output.exit_code, output.stdout.trim()
        );
        Ok(output)
    }

    async fn write_file(&self, host: &str, user: &str, path: &str, contents: &str) -> anyhow::Result<()> {
        tracing::debug!("writing {} on {}", path, host);
        let mut child = Command::new("ssh")
            .args(self.ssh_args(host, user))
            .arg(format!("/bin/cat > {path}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning file write on {host}"))?;
        let mut stdin = child.stdin.take().context("getting stdin of file write")?;
        stdin.write_all(contents.as_bytes()).await?;
        drop(stdin);
        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => bail!("writing {path} on {host} timed out"),
        };
        if !output.status.success() {
            bail!("writing {path} on {host} failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }

    async fn try_connect(&self, host: &str, user: &str) -> bool {
        match self.run(host, user, "/bin/true").await {
            Ok(output) => output.success(),
            Err(err) => {
                tracing::debug!("could not connect to {}: {:#}", host, err);
                false
            }
        }
    }
}
