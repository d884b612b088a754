//! Configuration file parsing for jailguard
//!
//! Parses `jailguard.toml` using serde. Every field has a default, so a
//! missing file or a partial one yields a usable configuration.

use crate::error::{Error, Result};
use crate::sys::validate_name;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default location of the tool configuration
pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/jailguard.toml";

/// Load configuration from a file, falling back to defaults if it does not exist
pub fn load(path: &Path) -> Result<JailguardConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(JailguardConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: JailguardConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Paths and names used by every command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailguardConfig {
    /// Root of everything jailguard writes
    #[serde(default = "default_path_data")]
    pub path_data: PathBuf,

    #[serde(default = "default_dir_bases")]
    pub dir_bases: String,

    #[serde(default = "default_dir_templates")]
    pub dir_templates: String,

    #[serde(default = "default_dir_state")]
    pub dir_state: String,

    #[serde(default = "default_dir_jails")]
    pub dir_jails: String,

    #[serde(default = "default_dir_configs")]
    pub dir_configs: String,

    #[serde(default = "default_dir_tmp")]
    pub dir_tmp: String,

    /// State file name inside `dir_state`
    #[serde(default = "default_file_state")]
    pub file_state: String,

    /// Top level PF anchor; each jail gets `<pf_anchor>/<jail>`
    #[serde(default = "default_pf_anchor")]
    pub pf_anchor: String,

    /// FreeBSD release mirror
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,
}

impl Default for JailguardConfig {
    fn default() -> Self {
        JailguardConfig {
            path_data: default_path_data(),
            dir_bases: default_dir_bases(),
            dir_templates: default_dir_templates(),
            dir_state: default_dir_state(),
            dir_jails: default_dir_jails(),
            dir_configs: default_dir_configs(),
            dir_tmp: default_dir_tmp(),
            file_state: default_file_state(),
            pf_anchor: default_pf_anchor(),
            mirror_url: default_mirror_url(),
        }
    }
}

impl JailguardConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.path_data.is_absolute() {
            return Err(Error::ConfigValidation(format!(
                "path_data must be absolute: {}",
                self.path_data.display()
            )));
        }

        for (key, value) in [
            ("dir_bases", &self.dir_bases),
            ("dir_templates", &self.dir_templates),
            ("dir_state", &self.dir_state),
            ("dir_jails", &self.dir_jails),
            ("dir_configs", &self.dir_configs),
            ("dir_tmp", &self.dir_tmp),
            ("file_state", &self.file_state),
        ] {
            if value.is_empty() || value.contains('/') || value == ".." {
                return Err(Error::ConfigValidation(format!(
                    "{} must be a plain directory or file name, got '{}'",
                    key, value
                )));
            }
        }

        validate_name(&self.pf_anchor)
            .map_err(|_| Error::ConfigValidation(format!("Invalid pf_anchor '{}'", self.pf_anchor)))?;

        if self.mirror_url.is_empty() {
            return Err(Error::ConfigValidation("mirror_url is empty".into()));
        }

        Ok(())
    }

    /// Look up a single value by its key name
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "path_data" => self.path_data.display().to_string(),
            "dir_bases" => self.dir_bases.clone(),
            "dir_templates" => self.dir_templates.clone(),
            "dir_state" => self.dir_state.clone(),
            "dir_jails" => self.dir_jails.clone(),
            "dir_configs" => self.dir_configs.clone(),
            "dir_tmp" => self.dir_tmp.clone(),
            "file_state" => self.file_state.clone(),
            "pf_anchor" => self.pf_anchor.clone(),
            "mirror_url" => self.mirror_url.clone(),
            _ => return Err(Error::ConfigValidation(format!("Unknown key '{}'", key))),
        };
        Ok(value)
    }

    /// Set a single value by its key name. The result is validated as a whole.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "path_data" => updated.path_data = PathBuf::from(value),
            "dir_bases" => updated.dir_bases = value.to_string(),
            "dir_templates" => updated.dir_templates = value.to_string(),
            "dir_state" => updated.dir_state = value.to_string(),
            "dir_jails" => updated.dir_jails = value.to_string(),
            "dir_configs" => updated.dir_configs = value.to_string(),
            "dir_tmp" => updated.dir_tmp = value.to_string(),
            "file_state" => updated.file_state = value.to_string(),
            "pf_anchor" => updated.pf_anchor = value.to_string(),
            "mirror_url" => updated.mirror_url = value.to_string(),
            _ => return Err(Error::ConfigValidation(format!("Unknown key '{}'", key))),
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ConfigValidation(e.to_string()))
    }

    /// Write the configuration to `path`, creating its directory if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Path of the persisted state file
    pub fn state_file(&self) -> PathBuf {
        self.path_data.join(&self.dir_state).join(&self.file_state)
    }

    /// Directory holding one sub-directory per base release
    pub fn bases_dir(&self) -> PathBuf {
        self.path_data.join(&self.dir_bases)
    }

    pub fn base_dir(&self, release: &str) -> PathBuf {
        self.bases_dir().join(release)
    }

    pub fn jail_dir(&self, jail: &str) -> PathBuf {
        self.path_data.join(&self.dir_jails).join(jail)
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.path_data.join(&self.dir_configs)
    }

    /// Serialized jail config block
    pub fn jail_conf_file(&self, jail: &str) -> PathBuf {
        self.configs_dir().join(format!("{}.jail", jail))
    }

    /// Generated PF rules for a jail
    pub fn jail_rules_file(&self, jail: &str) -> PathBuf {
        self.configs_dir().join(format!("{}.pf", jail))
    }
}

fn default_path_data() -> PathBuf {
    PathBuf::from("/usr/local/jailguard")
}

fn default_dir_bases() -> String {
    "bases".into()
}

fn default_dir_templates() -> String {
    "templates".into()
}

fn default_dir_state() -> String {
    "state".into()
}

fn default_dir_jails() -> String {
    "jails".into()
}

fn default_dir_configs() -> String {
    "configs".into()
}

fn default_dir_tmp() -> String {
    "tmp".into()
}

fn default_file_state() -> String {
    "jailguard.jailstate".into()
}

fn default_pf_anchor() -> String {
    "jailguard".into()
}

fn default_mirror_url() -> String {
    "http://ftp.freebsd.org/pub/FreeBSD/releases".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: JailguardConfig = toml::from_str("").unwrap();
        assert_eq!(config, JailguardConfig::default());
        assert_eq!(
            config.state_file(),
            PathBuf::from("/usr/local/jailguard/state/jailguard.jailstate")
        );
        assert_eq!(
            config.jail_conf_file("web"),
            PathBuf::from("/usr/local/jailguard/configs/web.jail")
        );
        assert_eq!(
            config.jail_rules_file("web"),
            PathBuf::from("/usr/local/jailguard/configs/web.pf")
        );
        assert_eq!(
            config.base_dir("13.2-RELEASE"),
            PathBuf::from("/usr/local/jailguard/bases/13.2-RELEASE")
        );
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
path_data = "/var/jailguard"
pf_anchor = "guard"
"#;
        let config: JailguardConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.jail_dir("db"), PathBuf::from("/var/jailguard/jails/db"));
        assert_eq!(config.pf_anchor, "guard");
        assert_eq!(config.dir_configs, "configs");
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, JailguardConfig::default());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = JailguardConfig::default();
        assert!(config.set("dir_jails", "../etc").is_err());
        assert!(config.set("path_data", "relative").is_err());
        assert!(config.set("pf_anchor", "Bad Anchor").is_err());
        assert!(config.set("nonsense", "x").is_err());
        // Failed sets leave the config untouched
        assert_eq!(config, JailguardConfig::default());
    }

    #[test]
    fn test_set_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/jailguard.toml");

        let mut config = JailguardConfig::default();
        config.set("path_data", "/srv/jailguard").unwrap();
        config.save(&path).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.get("path_data").unwrap(), "/srv/jailguard");
        assert_eq!(loaded.get("file_state").unwrap(), "jailguard.jailstate");
    }
}
