//! Site configuration – reads/writes `~/.vigil/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vigil_hal::AlertPolicy;
use vigil_kernel::{EmergencyConfig, WatchdogConfig};
use vigil_runtime::{ExecutorConfig, OrchestratorConfig};
use vigil_types::ThresholdSet;

/// Alert throttling as it appears on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    /// Minimum spacing between identical alerts.
    pub min_interval_secs: u64,
    /// Hourly cap on non-emergency alerts.
    pub max_per_hour: u32,
    pub send_timeout_secs: u64,
    pub queue_depth: usize,
}

impl Default for AlertSettings {
    fn default() -> Self {
        let policy = AlertPolicy::default();
        Self {
            min_interval_secs: policy.min_interval.as_secs(),
            max_per_hour: policy.max_per_hour,
            send_timeout_secs: policy.send_timeout.as_secs(),
            queue_depth: policy.queue_depth,
        }
    }
}

impl AlertSettings {
    pub fn policy(&self) -> AlertPolicy {
        AlertPolicy {
            min_interval: Duration::from_secs(self.min_interval_secs),
            max_per_hour: self.max_per_hour,
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            queue_depth: self.queue_depth.max(1),
        }
    }
}

/// Persisted configuration stored in `~/.vigil/config.toml`.
///
/// Every field has a default, so a partial file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub site_name: String,

    /// Seconds between condition monitor cycles.
    pub poll_interval_secs: u64,

    /// Bound on one sensor poll.
    pub device_timeout_secs: u64,

    /// SQLite journal. Unset means `~/.vigil/journal.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,

    pub thresholds: ThresholdSet,
    pub emergency: EmergencyConfig,
    pub executor: ExecutorConfig,
    pub watchdog: WatchdogConfig,
    pub alerts: AlertSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_name: "vigil".to_string(),
            poll_interval_secs: 10,
            device_timeout_secs: 5,
            journal_path: None,
            thresholds: ThresholdSet::default(),
            emergency: EmergencyConfig::default(),
            executor: ExecutorConfig::default(),
            watchdog: WatchdogConfig::default(),
            alerts: AlertSettings::default(),
        }
    }
}

impl Config {
    /// Journal location, falling back to `~/.vigil/journal.db`.
    pub fn journal_path(&self) -> PathBuf {
        self.journal_path
            .clone()
            .unwrap_or_else(|| vigil_dir_for_home(&home_dir()).join("journal.db"))
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            site_name: self.site_name.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            device_timeout: Duration::from_secs(self.device_timeout_secs.max(1)),
            thresholds: self.thresholds.clone(),
            emergency: self.emergency.clone(),
            executor: self.executor.clone(),
            watchdog: self.watchdog.clone(),
            alerts: self.alerts.policy(),
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

pub(crate) fn vigil_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".vigil")
}

/// Return the path to `~/.vigil/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    vigil_dir_for_home(home).join("config.toml")
}

/// Load the config from disk and apply environment overrides.
/// Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    cfg.thresholds
        .validate()
        .map_err(|e| format!("Invalid thresholds in {}: {}", path.display(), e))?;
    Ok(Some(cfg))
}

/// Apply `VIGIL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `VIGIL_SITE_NAME` | `site_name` |
/// | `VIGIL_POLL_INTERVAL_SECS` | `poll_interval_secs` |
/// | `VIGIL_JOURNAL_PATH` | `journal_path` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("VIGIL_SITE_NAME")
        && !v.trim().is_empty()
    {
        cfg.site_name = v;
    }
    if let Ok(v) = std::env::var("VIGIL_POLL_INTERVAL_SECS")
        && let Ok(secs) = v.trim().parse::<u64>()
        && secs > 0
    {
        cfg.poll_interval_secs = secs;
    }
    if let Ok(v) = std::env::var("VIGIL_JOURNAL_PATH")
        && !v.trim().is_empty()
    {
        cfg.journal_path = Some(PathBuf::from(v));
    }
}

/// Save the config to disk, creating `~/.vigil/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::ServiceKind;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn default_config_survives_save_and_load() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");

        assert_eq!(loaded.site_name, "vigil");
        assert_eq!(loaded.thresholds, ThresholdSet::default());
        assert_eq!(loaded.watchdog.services.len(), ServiceKind::ALL.len());
        assert_eq!(loaded.executor.slew_timeout_secs, 120);
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "site_name = \"ridge\"\n\n[thresholds]\nwind_park_mph = 20.0\n\n[alerts]\nmax_per_hour = 5\n",
        )
        .unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.site_name, "ridge");
        assert_eq!(cfg.thresholds.wind_park_mph, 20.0);
        assert_eq!(cfg.thresholds.wind_close_mph, ThresholdSet::default().wind_close_mph);
        assert_eq!(cfg.alerts.max_per_hour, 5);
        assert_eq!(cfg.alerts.min_interval_secs, 60);
        assert_eq!(cfg.poll_interval_secs, 10);
    }

    #[test]
    fn partial_watchdog_services_merge_over_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[watchdog.services.weather]\nheartbeat_secs = 30\ntimeout_secs = 90\nmax_attempts = 2\nsafety_relevant = true\n",
        )
        .unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        let services = &cfg.watchdog.services;
        assert_eq!(services.len(), ServiceKind::ALL.len());
        assert_eq!(services[&ServiceKind::Weather].max_attempts, 2);
        assert_eq!(services[&ServiceKind::Weather].heartbeat_secs, 30);
        assert_eq!(
            services[&ServiceKind::Mount],
            vigil_kernel::ServicePolicy::defaults_for(ServiceKind::Mount)
        );
        assert!(services[&ServiceKind::Power].safety_relevant);
    }

    #[test]
    fn inconsistent_thresholds_are_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[thresholds]\nwind_park_mph = 40.0\nwind_close_mph = 30.0\n",
        )
        .unwrap();

        let err = load_from(&path).unwrap_err();
        assert!(err.contains("Invalid thresholds"), "{err}");
    }

    #[test]
    fn config_path_points_to_vigil_dir() {
        let p = config_path_for_home("/home/observer");
        assert!(p.to_string_lossy().contains(".vigil"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn orchestrator_config_carries_alert_policy() {
        let mut cfg = Config::default();
        cfg.alerts.min_interval_secs = 5;
        cfg.poll_interval_secs = 0;
        let orch = cfg.orchestrator_config();
        assert_eq!(orch.alerts.min_interval, Duration::from_secs(5));
        assert_eq!(orch.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn apply_env_overrides_changes_site_name() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("VIGIL_SITE_NAME", "north-dome") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.site_name, "north-dome");
        unsafe { std::env::remove_var("VIGIL_SITE_NAME") };
    }

    #[test]
    fn apply_env_overrides_changes_journal_path() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("VIGIL_JOURNAL_PATH", "/var/lib/vigil/journal.db") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.journal_path(), PathBuf::from("/var/lib/vigil/journal.db"));
        unsafe { std::env::remove_var("VIGIL_JOURNAL_PATH") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_poll_interval() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("VIGIL_POLL_INTERVAL_SECS", "soon") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.poll_interval_secs, 10);

        unsafe { std::env::set_var("VIGIL_POLL_INTERVAL_SECS", "30") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.poll_interval_secs, 30);
        unsafe { std::env::remove_var("VIGIL_POLL_INTERVAL_SECS") };
    }
}
