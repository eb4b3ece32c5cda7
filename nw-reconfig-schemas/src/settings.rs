use std::fmt;
use std::fmt::Formatter;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use crate::NW_RECONFIG_SETTINGS_FOLDER;

/// Engine settings, read from `/var/lib/nw-reconfig/config/nw-reconfig-config.json` unless a path
/// is given on the command line. Every field has a default so a partial file is enough.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ReconfigSettings {
    /// controller node that holds the hosts file and batch level backups
    #[serde(default = "default_master_cps")]
    pub master_cps: String,
    /// standby controller the hosts file is synchronised to, if any
    #[serde(default)]
    pub remote_cps: Option<String>,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub timings: TimingSettings,
    /// cluster inventory file consumed by the command line front end
    #[serde(default = "default_inventory_path")]
    pub inventory_path: PathBuf,
}

impl Default for ReconfigSettings {
    fn default() -> Self {
        Self {
            master_cps: default_master_cps(),
            remote_cps: None,
            ssh: SshSettings::default(),
            paths: PathSettings::default(),
            timings: TimingSettings::default(),
            inventory_path: default_inventory_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SshSettings {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            identity_file: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Locations of the files and tools touched on hosts, guests and the controller.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PathSettings {
    #[serde(default = "default_node_backup_root")]
    pub node_backup_root: String,
    #[serde(default = "default_controller_backup_root")]
    pub controller_backup_root: String,
    #[serde(default = "default_hosts_file")]
    pub hosts_file: String,
    #[serde(default = "default_cell_conf")]
    pub cell_conf: String,
    #[serde(default = "default_net_rules")]
    pub net_rules: String,
    #[serde(default = "default_dns_conf")]
    pub dns_conf: String,
    #[serde(default = "default_ntp_conf")]
    pub ntp_conf: String,
    #[serde(default = "default_vm_maker")]
    pub vm_maker: String,
    #[serde(default = "default_domu_maker")]
    pub domu_maker: String,
    #[serde(default = "default_guest_images")]
    pub guest_images: String,
    #[serde(default = "default_libvirt_xml_dir")]
    pub libvirt_xml_dir: String,
    #[serde(default = "default_ipconf")]
    pub ipconf: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            node_backup_root: default_node_backup_root(),
            controller_backup_root: default_controller_backup_root(),
            hosts_file: default_hosts_file(),
            cell_conf: default_cell_conf(),
            net_rules: default_net_rules(),
            dns_conf: default_dns_conf(),
            ntp_conf: default_ntp_conf(),
            vm_maker: default_vm_maker(),
            domu_maker: default_domu_maker(),
            guest_images: default_guest_images(),
            libvirt_xml_dir: default_libvirt_xml_dir(),
            ipconf: default_ipconf(),
        }
    }
}

impl PathSettings {
    /// Directory holding the images and interface definitions of one guest.
    pub fn guest_dir(&self, guest: &str) -> String {
        format!("{}/{guest}", self.guest_images.trim_end_matches('/'))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TimingSettings {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_async_command_timeout_secs")]
    pub async_command_timeout_secs: u64,
    #[serde(default = "default_async_poll_interval_secs")]
    pub async_poll_interval_secs: u64,
    #[serde(default = "default_restart_timeout_secs")]
    pub restart_timeout_secs: u64,
    #[serde(default = "default_restart_decrement_secs")]
    pub restart_decrement_secs: u64,
    #[serde(default = "default_bridge_up_attempts")]
    pub bridge_up_attempts: u32,
    #[serde(default = "default_bridge_up_interval_secs")]
    pub bridge_up_interval_secs: u64,
    #[serde(default = "default_dns_remote_restart_delay_secs")]
    pub dns_remote_restart_delay_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            async_command_timeout_secs: default_async_command_timeout_secs(),
            async_poll_interval_secs: default_async_poll_interval_secs(),
            restart_timeout_secs: default_restart_timeout_secs(),
            restart_decrement_secs: default_restart_decrement_secs(),
            bridge_up_attempts: default_bridge_up_attempts(),
            bridge_up_interval_secs: default_bridge_up_interval_secs(),
            dns_remote_restart_delay_secs: default_dns_remote_restart_delay_secs(),
        }
    }
}

fn default_master_cps() -> String {"localhost".to_string()}
fn default_inventory_path() -> PathBuf {PathBuf::from(format!("{NW_RECONFIG_SETTINGS_FOLDER}config/cluster-inventory.json"))}
fn default_ssh_user() -> String {"root".to_string()}
fn default_connect_timeout_secs() -> u64 {10}
fn default_node_backup_root() -> String {"/opt/exacloud/nw_reconfig/".to_string()}
fn default_controller_backup_root() -> String {"/opt/oci/exacc/exacloud/scratch/nw_reconfig/".to_string()}
fn default_hosts_file() -> String {"/etc/hosts.exacc_domu".to_string()}
fn default_cell_conf() -> String {"/opt/oracle.cellos/cell.conf".to_string()}
fn default_net_rules() -> String {"/etc/udev/rules.d/70-persistent-net.rules".to_string()}
fn default_dns_conf() -> String {"/etc/resolv.conf".to_string()}
fn default_ntp_conf() -> String {"/etc/chrony.conf".to_string()}
fn default_vm_maker() -> String {"/opt/exadata_ovm/vm_maker".to_string()}
fn default_domu_maker() -> String {"/opt/exadata_ovm/exadata.img.domu_maker".to_string()}
fn default_guest_images() -> String {"/EXAVMIMAGES/GuestImages".to_string()}
fn default_libvirt_xml_dir() -> String {"/etc/libvirt/qemu".to_string()}
fn default_ipconf() -> String {"/usr/local/bin/ipconf".to_string()}
fn default_command_timeout_secs() -> u64 {180}
fn default_async_command_timeout_secs() -> u64 {1800}
fn default_async_poll_interval_secs() -> u64 {5}
fn default_restart_timeout_secs() -> u64 {600}
fn default_restart_decrement_secs() -> u64 {10}
fn default_bridge_up_attempts() -> u32 {3}
fn default_bridge_up_interval_secs() -> u64 {5}
fn default_dns_remote_restart_delay_secs() -> u64 {10}

impl fmt::Display for ReconfigSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_string_pretty(&self).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

impl ReconfigSettings {
    pub fn default_location() -> PathBuf {
        PathBuf::from(format!("{NW_RECONFIG_SETTINGS_FOLDER}config/nw-reconfig-config.json"))
    }

    pub async fn write(&self, location: &Path) -> anyhow::Result<()> {
        let mut output = File::create(location).await
            .with_context(|| format!("creating settings file {location:?}"))?;
        output.write_all(format!("{self}").as_bytes()).await?;
        Ok(())
    }

    /// Reads the settings file. An explicitly requested file must exist, the default location may
    /// be absent in which case built in defaults apply.
    pub async fn read(location: Option<&Path>) -> anyhow::Result<ReconfigSettings> {
        let (name, explicit) = match location {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_location(), false),
        };
        tracing::trace!("expected nw-reconfig config json location: {:?}", name);
        if name.is_file() {
            let text = tokio::fs::read_to_string(&name).await?;
            let config: ReconfigSettings = serde_json::from_str(&text)
                .with_context(|| format!("parsing settings file {name:?}"))?;
            Ok(config)
        } else if explicit {
            bail!("could not read settings file {name:?}")
        } else {
            tracing::debug!("no settings file at {:?}, using defaults", name);
            Ok(ReconfigSettings::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partial_settings_fill_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, r#"{"master_cps": "cps01", "timings": {"restart_timeout_secs": 60}}"#)
            .await
            .unwrap();
        let settings = ReconfigSettings::read(Some(&path)).await.unwrap();
        assert_eq!(settings.master_cps, "cps01");
        assert_eq!(settings.timings.restart_timeout_secs, 60);
        assert_eq!(settings.timings.restart_decrement_secs, 10);
        assert_eq!(settings.timings.command_timeout_secs, 180);
        assert_eq!(settings.paths.hosts_file, "/etc/hosts.exacc_domu");
        assert_eq!(settings.ssh.user, "root");
    }

    #[tokio::test]
    async fn test_settings_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = ReconfigSettings::default();
        settings.remote_cps = Some("cps02".into());
        settings.write(&path).await.unwrap();
        assert_eq!(ReconfigSettings::read(Some(&path)).await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_missing_explicit_settings_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ReconfigSettings::read(Some(&dir.path().join("absent.json"))).await.is_err());
    }

    #[test]
    fn test_guest_dir() {
        let paths = PathSettings::default();
        assert_eq!(paths.guest_dir("vm01"), "/EXAVMIMAGES/GuestImages/vm01");
    }
}
