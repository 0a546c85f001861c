//! On-disk configuration
//!
//! A single YAML file (`config.yaml` under the base directory) with every
//! recognized option explicit. Unknown keys are rejected so typos surface
//! immediately; missing keys fall back to paths under the base directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crypto::KeyFingerprint;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid alias name: {0}")]
    BadAlias(String),
    #[error("unknown alias: {0}")]
    UnknownAlias(String),
}

/// An alias is `@` followed by a lowercase identifier.
pub fn valid_alias(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('@') else {
        return false;
    };
    let mut chars = rest.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    #[serde(skip)]
    base_dir: PathBuf,

    pub user_dir: Option<PathBuf>,
    pub storage_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub container_dir: Option<PathBuf>,
    pub bridge_dir: Option<PathBuf>,
    pub key_dir: Option<PathBuf>,
    pub mount_dir: Option<PathBuf>,
    pub template_dir: Option<PathBuf>,
    pub fs_socket_path: Option<PathBuf>,
    pub sync_socket_path: Option<PathBuf>,

    /// Separator for bridge components in FUSE paths (`:` by default; some
    /// filesystems cannot carry `:` in names).
    #[serde(default = "default_bridge_separator")]
    pub alt_bridge_separator: String,

    /// Identity transforms instead of real crypto. Test suites only.
    #[serde(default)]
    pub dummy: bool,

    /// Owner whose namespace unprefixed paths start in.
    #[serde(rename = "@default")]
    pub default: Option<KeyFingerprint>,
    /// Owner who signs newly created manifests.
    #[serde(rename = "@default-owner")]
    pub default_owner: Option<KeyFingerprint>,

    #[serde(default)]
    pub aliases: HashMap<String, KeyFingerprint>,

    pub local_hostname: Option<String>,
    #[serde(default)]
    pub local_owners: Vec<KeyFingerprint>,
    #[serde(default)]
    pub default_containers: Vec<String>,
    pub default_cache_template: Option<String>,
    #[serde(default)]
    pub default_remote_for_container: HashMap<String, String>,
}

fn default_bridge_separator() -> String {
    ":".to_string()
}

impl Config {
    /// A configuration with every option unset, rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Config {
            base_dir: base_dir.into(),
            user_dir: None,
            storage_dir: None,
            cache_dir: None,
            container_dir: None,
            bridge_dir: None,
            key_dir: None,
            mount_dir: None,
            template_dir: None,
            fs_socket_path: None,
            sync_socket_path: None,
            alt_bridge_separator: default_bridge_separator(),
            dummy: false,
            default: None,
            default_owner: None,
            aliases: HashMap::new(),
            local_hostname: None,
            local_owners: Vec::new(),
            default_containers: Vec::new(),
            default_cache_template: None,
            default_remote_for_container: HashMap::new(),
        }
    }

    /// Load `config.yaml` from the base directory; a missing file yields the
    /// defaults.
    pub fn load(base_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let base_dir = base_dir.into();
        let path = base_dir.join("config.yaml");
        let mut config = if path.exists() {
            serde_yaml::from_str::<Config>(&std::fs::read_to_string(&path)?)?
        } else {
            Config::new(&base_dir)
        };
        config.base_dir = base_dir;
        for alias in config.aliases.keys() {
            if !valid_alias(alias) {
                return Err(ConfigError::BadAlias(alias.clone()));
            }
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.base_dir)?;
        let text = serde_yaml::to_string(self)?;
        std::fs::write(self.base_dir.join("config.yaml"), text)?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn dir(&self, explicit: &Option<PathBuf>, name: &str) -> PathBuf {
        explicit
            .clone()
            .unwrap_or_else(|| self.base_dir.join(name))
    }

    pub fn user_dir(&self) -> PathBuf {
        self.dir(&self.user_dir, "users")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.dir(&self.storage_dir, "storage")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir(&self.cache_dir, "cache")
    }

    pub fn container_dir(&self) -> PathBuf {
        self.dir(&self.container_dir, "containers")
    }

    pub fn bridge_dir(&self) -> PathBuf {
        self.dir(&self.bridge_dir, "bridges")
    }

    pub fn key_dir(&self) -> PathBuf {
        self.dir(&self.key_dir, "keys")
    }

    pub fn mount_dir(&self) -> PathBuf {
        self.dir(&self.mount_dir, "wildland")
    }

    pub fn template_dir(&self) -> PathBuf {
        self.dir(&self.template_dir, "templates")
    }

    pub fn fs_socket_path(&self) -> PathBuf {
        self.fs_socket_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("wlfuse.sock"))
    }

    pub fn sync_socket_path(&self) -> PathBuf {
        self.sync_socket_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("wlsync.sock"))
    }

    /// Substitute an alias (or pass a fingerprint through).
    pub fn resolve_alias(&self, name: &str) -> Result<KeyFingerprint, ConfigError> {
        if let Ok(fpr) = name.parse::<KeyFingerprint>() {
            return Ok(fpr);
        }
        match name {
            "@default" => self.default.clone(),
            "@default-owner" => self.default_owner.clone(),
            other => self.aliases.get(other).cloned(),
        }
        .ok_or_else(|| ConfigError::UnknownAlias(name.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_alias_names() {
        assert!(valid_alias("@default"));
        assert!(valid_alias("@work-2"));
        assert!(!valid_alias("default"));
        assert!(!valid_alias("@Default"));
        assert!(!valid_alias("@2nd"));
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new(dir.path());
        let fpr: KeyFingerprint =
            "0x6f776e65726f776e65726f776e65726f776e65726f776e65726f776e65726f77"
                .parse()
                .unwrap();
        config.default = Some(fpr.clone());
        config.aliases.insert("@alice".into(), fpr.clone());
        config.save().unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.default, Some(fpr.clone()));
        assert_eq!(loaded.resolve_alias("@alice").unwrap(), fpr);
        assert_eq!(loaded.resolve_alias("@default").unwrap(), fpr);
        assert!(loaded.resolve_alias("@nobody").is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "not-an-option: 1\n").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }

    #[test]
    fn test_default_paths_under_base() {
        let config = Config::new("/base");
        assert_eq!(config.key_dir(), PathBuf::from("/base/keys"));
        assert_eq!(config.fs_socket_path(), PathBuf::from("/base/wlfuse.sock"));
    }
}
