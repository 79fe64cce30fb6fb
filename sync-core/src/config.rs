//! Agent configuration (spec §6). Deserialized from TOML the way the
//! teacher deserializes `RemoteStorageConfig`, with `humantime_serde` for
//! the duration-shaped fields.

use std::collections::HashSet;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::model::WorkspaceId;

fn default_max_concurrent_transfers() -> usize {
    50
}

fn default_debounce() -> Duration {
    Duration::from_millis(1000)
}

fn default_echo_ttl() -> Duration {
    Duration::from_secs(7200)
}

fn default_periodic_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_periodic_interval_background() -> Duration {
    Duration::from_secs(120)
}

fn default_large_file_threshold_mib() -> u64 {
    3
}

fn default_excluded_dir_names() -> HashSet<String> {
    [
        ".git",
        "node_modules",
        ".vs",
        ".idea",
        "bin",
        "obj",
        "__pycache__",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_excluded_name_patterns() -> Vec<String> {
    vec![
        "desktop.ini".into(),
        "Thumbs.db".into(),
        "~$*".into(),
        "*.tmp".into(),
        "*.temp".into(),
    ]
}

/// Every field in spec §6, plus the background-mode interval it names in
/// prose ("every 2 min in background mode").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAgentConfig {
    pub sync_root: Utf8PathBuf,
    pub workspace_id: WorkspaceId,

    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,

    #[serde(default = "default_echo_ttl", with = "humantime_serde")]
    pub echo_ttl: Duration,

    #[serde(default = "default_periodic_interval", with = "humantime_serde")]
    pub periodic_interval: Duration,

    #[serde(
        default = "default_periodic_interval_background",
        with = "humantime_serde"
    )]
    pub periodic_interval_background: Duration,

    #[serde(default = "default_excluded_dir_names")]
    pub excluded_dir_names: HashSet<String>,

    #[serde(default = "default_excluded_name_patterns")]
    pub excluded_name_patterns: Vec<String>,

    #[serde(default = "default_large_file_threshold_mib")]
    pub large_file_threshold_mib: u64,

    /// Whether the agent is currently running in background (tray-only)
    /// mode, which selects `periodic_interval_background` over
    /// `periodic_interval`.
    #[serde(default)]
    pub background_mode: bool,
}

impl SyncAgentConfig {
    pub fn effective_periodic_interval(&self) -> Duration {
        if self.background_mode {
            self.periodic_interval_background
        } else {
            self.periodic_interval
        }
    }

    pub fn large_file_threshold_bytes(&self) -> u64 {
        self.large_file_threshold_mib * 1024 * 1024
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// The per-workspace subdirectory name under `sync_root` (spec §6):
    /// `<workspace-id>_<sanitized-workspace-name>`, sanitized to replace
    /// invalid filename characters with `_`, capped at 50 characters,
    /// never empty.
    pub fn workspace_dir_name(workspace_id: WorkspaceId, workspace_name: &str) -> String {
        let sanitized: String = workspace_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ' ' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let trimmed = sanitized.trim();
        let truncated: String = trimmed.chars().take(50).collect();
        let name = if truncated.is_empty() {
            "workspace".to_string()
        } else {
            truncated
        };
        format!("{workspace_id}_{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = SyncAgentConfig::from_toml_str(
            r#"
            sync_root = "/home/user/Sync"
            workspace_id = 42
        "#,
        )
        .unwrap();
        assert_eq!(cfg.max_concurrent_transfers, 50);
        assert_eq!(cfg.debounce, Duration::from_millis(1000));
        assert_eq!(cfg.echo_ttl, Duration::from_secs(7200));
        assert_eq!(cfg.periodic_interval, Duration::from_secs(300));
        assert_eq!(
            cfg.periodic_interval_background,
            Duration::from_secs(120)
        );
        assert_eq!(cfg.large_file_threshold_mib, 3);
        assert!(cfg.excluded_dir_names.contains("node_modules"));
    }

    #[test]
    fn background_mode_selects_shorter_interval() {
        let mut cfg = SyncAgentConfig::from_toml_str(
            "sync_root = \"/tmp/x\"\nworkspace_id = 1\n",
        )
        .unwrap();
        assert_eq!(cfg.effective_periodic_interval(), Duration::from_secs(300));
        cfg.background_mode = true;
        assert_eq!(cfg.effective_periodic_interval(), Duration::from_secs(120));
    }

    #[test]
    fn workspace_dir_name_sanitizes_and_caps() {
        let long_name = "a".repeat(80);
        let name = SyncAgentConfig::workspace_dir_name(7, &long_name);
        assert!(name.starts_with("7_"));
        assert!(name.len() <= 2 + 50);

        let weird = SyncAgentConfig::workspace_dir_name(1, "My:Workspace/Name?");
        assert_eq!(weird, "1_My_Workspace_Name_");

        let empty = SyncAgentConfig::workspace_dir_name(2, "???");
        assert_eq!(empty, "2_workspace");
    }
}
