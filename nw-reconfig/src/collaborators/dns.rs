use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use nw_reconfig_schemas::settings::ReconfigSettings;
use crate::collaborators::DnsService;
use crate::gateway::RemoteCommandGateway;

/// Edits the controller's hosts file in place and reloads dnsmasq, locally and on the standby
/// controller.
pub struct HostsFileDns {
    gateway: Arc<dyn RemoteCommandGateway>,
    hosts_file: String,
    remote_cps: Option<String>,
    user: String,
    remote_reload_delay: Duration,
}

impl HostsFileDns {
    pub fn new(settings: &ReconfigSettings, gateway: Arc<dyn RemoteCommandGateway>) -> Self {
        Self {
            gateway,
            hosts_file: settings.paths.hosts_file.clone(),
            remote_cps: settings.remote_cps.clone().filter(|r| !r.trim().is_empty()),
            user: settings.ssh.user.clone(),
            remote_reload_delay: Duration::from_secs(settings.timings.dns_remote_restart_delay_secs),
        }
    }

    async fn run_local(&self, cmd: &str, failure: &str) -> anyhow::Result<()> {
        let output = self.gateway.run_local(cmd).await?;
        if !output.success() {
            bail!("{failure}: {}", output.stderr.trim());
        }
        Ok(())
    }
}

/// One hosts file line: address, fully qualified name and short name in aligned columns.
pub fn hosts_line(fqdn: &str, ip: &str) -> String {
    let short = fqdn.split('.').next().unwrap_or(fqdn);
    format!("{ip:<15}\t{fqdn:<50}\t{short}")
}

/// Extended regular expression matching `entry` only as a whole whitespace separated field, so
/// `10.0.0.5` leaves `10.0.0.50` alone and `vm-a` leaves `vm-a-bk` alone.
pub fn entry_pattern(entry: &str) -> String {
    let escaped: String = entry.chars()
        .flat_map(|c| "\\.[]()*+?{}|^$/".contains(c).then_some('\\').into_iter().chain(std::iter::once(c)))
        .collect();
    format!("(^|[[:space:]]){escaped}([[:space:]]|$)")
}

#[async_trait]
impl DnsService for HostsFileDns {
    async fn delete_entry(&self, entry: &str) -> anyhow::Result<()> {
        let cmd = format!(
            "/usr/bin/sudo /bin/sed -E -i --follow-symlinks '/{}/d' {}",
            entry_pattern(entry),
            self.hosts_file
        );
        self.run_local(&cmd, &format!("Failed to delete entry for {entry} from {}", self.hosts_file)).await
    }

    async fn add_entry(&self, fqdn: &str, ip: &str) -> anyhow::Result<()> {
        let cmd = format!(
            "/usr/bin/sudo /bin/sed -i --follow-symlinks '$a {}' {}",
            hosts_line(fqdn, ip),
            self.hosts_file
        );
        self.run_local(&cmd, &format!("Failed to add entry {fqdn} to {}", self.hosts_file)).await
    }

    async fn sync_remote(&self) -> anyhow::Result<()> {
        let Some(remote) = &self.remote_cps else {
            tracing::debug!("no remote controller configured, skipping hosts file sync");
            return Ok(());
        };
        let cmd = format!(
            "/usr/bin/rsync -a {0} {1}@{2}:{0}",
            self.hosts_file, self.user, remote
        );
        self.run_local(&cmd, &format!("Failed to sync {} to {remote}", self.hosts_file)).await
    }

    async fn restart(&self) -> anyhow::Result<()> {
        self.run_local("/usr/bin/sudo /bin/systemctl reload dnsmasq", "Failed to reload dnsmasq").await?;
        if let Some(remote) = &self.remote_cps {
            tokio::time::sleep(self.remote_reload_delay).await;
            let output = self.gateway.run(remote, &self.user, "/bin/systemctl reload dnsmasq").await?;
            if !output.success() {
                bail!("Failed to reload dnsmasq on {remote}: {}", output.stderr.trim());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedGateway;

    #[test]
    fn test_hosts_line_columns() {
        let line = hosts_line("vm-a-bk.example.com", "10.0.0.5");
        let columns: Vec<&str> = line.split('\t').map(str::trim).collect();
        assert_eq!(columns, vec!["10.0.0.5", "vm-a-bk.example.com", "vm-a-bk"]);
        assert!(line.starts_with("10.0.0.5       \t"));
    }

    #[test]
    fn test_entry_pattern_matches_whole_fields_only() {
        let hosts = [
            hosts_line("vm-a.example.com", "10.0.0.5"),
            hosts_line("vm-a-bk.example.com", "10.0.0.50"),
            hosts_line("vm-c.example.com", "110.0.0.5"),
        ];
        let deleted = |entry: &str| -> Vec<usize> {
            let pattern = regex::Regex::new(&entry_pattern(entry)).unwrap();
            hosts.iter().enumerate().filter(|(_, l)| pattern.is_match(l)).map(|(i, _)| i).collect()
        };
        assert_eq!(deleted("10.0.0.5"), vec![0]);
        assert_eq!(deleted("vm-a"), vec![0]);
        assert_eq!(deleted("vm-a-bk"), vec![1]);
        assert_eq!(deleted("10.0.0"), Vec::<usize>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hosts_file_commands() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut settings = ReconfigSettings::default();
        settings.remote_cps = Some("cps02".into());
        let dns = HostsFileDns::new(&settings, gateway.clone());

        dns.delete_entry("10.0.0.5").await.unwrap();
        dns.add_entry("vm-a-bk.example.com", "10.0.0.6").await.unwrap();
        dns.sync_remote().await.unwrap();
        dns.restart().await.unwrap();

        let log = gateway.commands();
        assert_eq!(
            log[0],
            r"local: /usr/bin/sudo /bin/sed -E -i --follow-symlinks '/(^|[[:space:]])10\.0\.0\.5([[:space:]]|$)/d' /etc/hosts.exacc_domu"
        );
        assert!(log[1].contains("$a 10.0.0.6"));
        assert!(log[2].contains("/usr/bin/rsync -a /etc/hosts.exacc_domu root@cps02:/etc/hosts.exacc_domu"));
        assert!(log[3].ends_with("reload dnsmasq"));
        assert_eq!(log[4], "cps02: /bin/systemctl reload dnsmasq");
    }

    #[tokio::test]
    async fn test_failed_reload_is_reported() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.fail_on("reload dnsmasq", 1);
        let dns = HostsFileDns::new(&ReconfigSettings::default(), gateway.clone());
        assert!(dns.restart().await.is_err());
    }
}
