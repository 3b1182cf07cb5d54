//! Daemon configuration.
//!
//! Reads/writes TOML at `~/.config/opush/opushd.toml`. A missing file is
//! created with the defaults on first start.

use std::path::{Path, PathBuf};
use std::time::Duration;

use opush_coordinator::CoordinatorConfig;
use opush_session::InboundPolicy;
use serde::{Deserialize, Serialize};

const DEFAULT_LISTEN: &str = "0.0.0.0:6500";

/// On-disk config format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    name: String,
    listen: String,
    inbound_dir: PathBuf,
    connect_timeout_secs: u64,
    incoming_retry_interval_ms: u64,
    incoming_retry_limit: u32,
    max_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_inbound_bytes: Option<u64>,
    auto_accept: bool,
    accept_mime: Vec<String>,
    deny_mime: Vec<String>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        DaemonConfig::default().to_file()
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Name this host announces in logs.
    pub name: String,
    /// Address the OBEX listener binds.
    pub listen: String,
    /// Where received objects land.
    pub inbound_dir: PathBuf,
    pub connect_timeout: Duration,
    pub incoming_retry_interval: Duration,
    pub incoming_retry_limit: u32,
    pub max_records: usize,
    pub max_inbound_bytes: Option<u64>,
    /// Confirm every inbound object without asking.
    pub auto_accept: bool,
    pub policy: InboundPolicy,
    file_path: PathBuf,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "opush".into())
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let coordinator = CoordinatorConfig::default();
        Self {
            name: default_name(),
            listen: DEFAULT_LISTEN.into(),
            inbound_dir: home_dir().join("Downloads").join("opush"),
            connect_timeout: coordinator.transfer.connect_timeout,
            incoming_retry_interval: coordinator.incoming_retry_interval,
            incoming_retry_limit: coordinator.incoming_retry_limit,
            max_records: coordinator.max_records,
            max_inbound_bytes: None,
            auto_accept: false,
            policy: InboundPolicy::default(),
            file_path: config_file_path(),
        }
    }
}

impl DaemonConfig {
    /// Loads the config from its default location, writing the defaults
    /// there if the file does not exist yet.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(config_file_path())
    }

    /// Loads the config from `file_path`.
    pub fn load_from(file_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let file_path = file_path.into();
        let mut config = DaemonConfig {
            file_path: file_path.clone(),
            ..Default::default()
        };

        if !file_path.exists() {
            config.save()?;
            tracing::info!(path = %file_path.display(), "wrote default configuration");
            return Ok(config);
        }

        let content = std::fs::read_to_string(&file_path)?;
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => config.apply(file),
            Err(e) => tracing::warn!(
                path = %file_path.display(),
                error = %e,
                "failed to parse daemon config, using defaults"
            ),
        }
        Ok(config)
    }

    /// Saves the config to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(&self.to_file())?;
        std::fs::write(&self.file_path, text)?;
        tracing::debug!("daemon configuration saved");
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Coordinator tunables derived from this config.
    pub fn coordinator(&self) -> CoordinatorConfig {
        let mut config = CoordinatorConfig {
            incoming_retry_interval: self.incoming_retry_interval,
            incoming_retry_limit: self.incoming_retry_limit,
            max_records: self.max_records,
            ..Default::default()
        };
        config.transfer.connect_timeout = self.connect_timeout;
        config.transfer.session.connect_timeout = self.connect_timeout;
        config
    }

    fn apply(&mut self, file: ConfigFile) {
        if !file.name.is_empty() {
            self.name = file.name;
        }
        if !file.listen.is_empty() {
            self.listen = file.listen;
        }
        if !file.inbound_dir.as_os_str().is_empty() {
            self.inbound_dir = expand_home(&file.inbound_dir);
        }
        if file.connect_timeout_secs >= 1 {
            self.connect_timeout = Duration::from_secs(file.connect_timeout_secs);
        }
        if file.incoming_retry_interval_ms >= 1 {
            self.incoming_retry_interval = Duration::from_millis(file.incoming_retry_interval_ms);
        }
        if file.incoming_retry_limit >= 1 {
            self.incoming_retry_limit = file.incoming_retry_limit;
        }
        if file.max_records >= 1 {
            self.max_records = file.max_records;
        }
        self.max_inbound_bytes = file.max_inbound_bytes;
        self.auto_accept = file.auto_accept;
        self.policy = InboundPolicy {
            accept: file.accept_mime,
            deny: file.deny_mime,
        };
    }

    fn to_file(&self) -> ConfigFile {
        ConfigFile {
            name: self.name.clone(),
            listen: self.listen.clone(),
            inbound_dir: self.inbound_dir.clone(),
            connect_timeout_secs: self.connect_timeout.as_secs(),
            incoming_retry_interval_ms: self.incoming_retry_interval.as_millis() as u64,
            incoming_retry_limit: self.incoming_retry_limit,
            max_records: self.max_records,
            max_inbound_bytes: self.max_inbound_bytes,
            auto_accept: self.auto_accept,
            accept_mime: self.policy.accept.clone(),
            deny_mime: self.policy.deny.clone(),
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn config_file_path() -> PathBuf {
    home_dir().join(".config").join("opush").join("opushd.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("opushd.toml");

        let config = DaemonConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.incoming_retry_limit, 20);
        assert!(!config.auto_accept);

        let reloaded = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opushd.toml");
        std::fs::write(
            &path,
            "listen = \"127.0.0.1:7000\"\nauto_accept = true\nincoming_retry_limit = 0\n",
        )
        .unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert!(config.auto_accept);
        assert_eq!(config.incoming_retry_limit, 20);
        assert_eq!(config.policy, InboundPolicy::default());
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opushd.toml");
        std::fs::write(&path, "listen = [not toml").unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN);
    }

    #[test]
    fn coordinator_config_carries_timeouts() {
        let config = DaemonConfig {
            connect_timeout: Duration::from_secs(7),
            incoming_retry_limit: 3,
            ..Default::default()
        };
        let coordinator = config.coordinator();
        assert_eq!(coordinator.transfer.connect_timeout, Duration::from_secs(7));
        assert_eq!(coordinator.transfer.session.connect_timeout, Duration::from_secs(7));
        assert_eq!(coordinator.incoming_retry_limit, 3);
    }

    #[test]
    fn home_prefix_is_expanded() {
        assert_eq!(expand_home(Path::new("/srv/in")), PathBuf::from("/srv/in"));
        assert_eq!(expand_home(Path::new("~/in")), home_dir().join("in"));
    }
}
