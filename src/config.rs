//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The provisioner name registered with the cluster by default.
pub const DEFAULT_PROVISIONER_NAME: &str = "vmware.com/vcloud-director";
/// The default root directory under which volume directories are created.
pub const DEFAULT_PV_DIR: &str = "/tmp/vcd-provisioner";
/// The default base directory of the placement mailbox.
pub const DEFAULT_PLACEMENT_DIR: &str = "/var/run/vcd-provisioner/placement";
/// The default prefix of node affinity labels.
pub const DEFAULT_LABEL_PREFIX: &str = "vcd-pvc";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for healthchecks and metrics.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The name of the node on which this instance is running.
    ///
    /// This is the identity embedded in every volume created by this provisioner.
    pub node_name: String,
    /// The provisioner name which storage classes must reference.
    #[serde(default = "Config::default_provisioner_name")]
    pub provisioner_name: String,
    /// The root directory under which volume directories are created.
    #[serde(default = "Config::default_pv_dir")]
    pub pv_dir: PathBuf,

    /// The base directory of the placement mailbox, holding `req/` and `res/`.
    #[serde(default = "Config::default_placement_dir")]
    pub placement_dir: PathBuf,
    /// The interval between checks for a placement response.
    #[serde(default = "Config::default_placement_poll_interval_ms")]
    pub placement_poll_interval_ms: u64,
    /// The maximum duration to wait for a placement response.
    #[serde(default = "Config::default_placement_timeout_seconds")]
    pub placement_timeout_seconds: u64,

    /// The prefix applied to claim names to form node affinity label keys.
    #[serde(default = "Config::default_label_prefix")]
    pub label_prefix: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate values which deserialization alone can not check.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.node_name.is_empty(), "NODE_NAME must be set so that this provisioner can identify itself");
        ensure!(!self.provisioner_name.is_empty(), "PROVISIONER_NAME must not be empty");
        ensure!(self.placement_poll_interval_ms > 0, "PLACEMENT_POLL_INTERVAL_MS must be greater than 0");
        ensure!(self.placement_timeout_seconds > 0, "PLACEMENT_TIMEOUT_SECONDS must be greater than 0");
        crate::ledger::validate_label_prefix(&self.label_prefix).context("invalid LABEL_PREFIX")?;
        Ok(())
    }

    /// The interval between checks for a placement response.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.placement_poll_interval_ms)
    }

    /// The maximum duration to wait for a placement response.
    pub fn placement_timeout(&self) -> Duration {
        Duration::from_secs(self.placement_timeout_seconds)
    }

    fn default_http_port() -> u16 {
        7002
    }

    fn default_provisioner_name() -> String {
        DEFAULT_PROVISIONER_NAME.into()
    }

    fn default_pv_dir() -> PathBuf {
        PathBuf::from(DEFAULT_PV_DIR)
    }

    fn default_placement_dir() -> PathBuf {
        PathBuf::from(DEFAULT_PLACEMENT_DIR)
    }

    fn default_placement_poll_interval_ms() -> u64 {
        5_000
    }

    fn default_placement_timeout_seconds() -> u64 {
        300
    }

    fn default_label_prefix() -> String {
        DEFAULT_LABEL_PREFIX.into()
    }
}

#[cfg(test)]
impl Config {
    /// Build a config rooted in a fresh temp dir, with a fast poll cadence.
    pub fn new_test() -> Result<(Self, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir for test")?;
        let config = Config {
            rust_log: "error".into(),
            http_port: 7002,
            node_name: "provisioner-node".into(),
            provisioner_name: DEFAULT_PROVISIONER_NAME.into(),
            pv_dir: tmpdir.path().join("volumes"),
            placement_dir: tmpdir.path().join("placement"),
            placement_poll_interval_ms: 20,
            placement_timeout_seconds: 2,
            label_prefix: DEFAULT_LABEL_PREFIX.into(),
        };
        Ok((config, tmpdir))
    }
}
