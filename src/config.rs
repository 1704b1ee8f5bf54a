//! User settings, persisted as JSON in the user config directory.

use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{OptionExt, WrapErr};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backup::{BackupOptions, ExtensionFilter};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Directory on the stick to back up, `/` being the volume root.
    pub source_path: String,
    /// Local directory receiving the copies.
    pub destination_path: PathBuf,
    pub delete_after_backup: bool,
    pub overwrite_existing: bool,
    /// Mount a generated RAM image instead of a real stick.
    pub mock_device: bool,
    /// Extensions counted and listed, all files when empty.
    pub extensions: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let pictures = dirs::picture_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            source_path: "/DCIM".to_owned(),
            destination_path: pictures.join("stickcopy"),
            delete_after_backup: false,
            overwrite_existing: false,
            mock_device: false,
            extensions: Vec::new(),
        }
    }
}

impl Settings {
    pub fn user_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stickcopy"))
    }

    pub fn user_config_path() -> Option<PathBuf> {
        Self::user_config_dir().map(|dir| dir.join("config.json"))
    }

    /// Settings from `path`, or from the user config file when none is given.
    ///
    /// A missing or broken file yields the defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path.map(Path::to_owned).or_else(Self::user_config_path) else {
            warn!("no config directory on this platform, using defaults");
            return Self::default();
        };
        if !path.exists() {
            debug!("{} does not exist, using defaults", path.display());
            return Self::default();
        }
        match Self::load_from_path(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("ignoring {}: {e:#}", path.display());
                Self::default()
            }
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
        Ok(settings)
    }

    /// Write to `path`, or to the user config file when none is given.
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(path) => path.to_owned(),
            None => Self::user_config_path().ok_or_eyre("could not determine the config directory")?,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Deleting sources is the only reason to write to the stick.
    pub fn read_only(&self) -> bool {
        !self.delete_after_backup
    }

    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            delete_after_backup: self.delete_after_backup,
            overwrite_existing: self.overwrite_existing,
        }
    }

    pub fn extension_filter(&self) -> ExtensionFilter {
        ExtensionFilter::new(&self.extensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "delete_after_backup": true, "extensions": ["jpg"] }"#).unwrap();
        let settings = Settings::load(Some(&path));
        assert!(settings.delete_after_backup);
        assert!(!settings.read_only());
        assert!(!settings.overwrite_existing);
        assert_eq!(settings.source_path, "/DCIM");
        assert!(settings.extension_filter().matches("a.JPG"));
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Settings::load_from_path(&path).is_err());
        assert_eq!(Settings::load(Some(&path)), Settings::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let settings = Settings {
            overwrite_existing: true,
            mock_device: true,
            ..Settings::default()
        };
        settings.save(Some(&path)).unwrap();
        assert_eq!(Settings::load(Some(&path)), settings);
        assert_eq!(
            settings.backup_options(),
            BackupOptions {
                delete_after_backup: false,
                overwrite_existing: true
            }
        );
    }
}
