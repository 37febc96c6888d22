use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::Namespaces;
use crate::lifecycle::PrecacheManifest;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL of the gallery. Its origin is the "same origin".
  pub scope: String,
  /// Current static namespace; bump it to force a full app-shell refresh
  pub static_cache: String,
  /// Image namespace, kept across deployments
  pub image_cache: String,
  /// Offline fallback document (must also be precached)
  pub offline_page: String,
  /// App shell, relative entries resolve against `scope`
  pub precache: Vec<String>,
  pub network: NetworkConfig,
  pub install: InstallConfig,
  /// SQLite file (defaults to $XDG_DATA_HOME/gallery-cache/cache.db)
  pub database: Option<PathBuf>,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      scope: "http://localhost:8080/".to_string(),
      static_cache: "static-image-gallery-v1".to_string(),
      image_cache: "image-cache".to_string(),
      offline_page: "./offline.html".to_string(),
      precache: [
        "./",
        "./index.html",
        "./main.js",
        "./style.css",
        "./manifest.webmanifest",
        "./offline.html",
        "https://cdn.jsdelivr.net/npm/glightbox/dist/css/glightbox.min.css",
        "https://cdn.jsdelivr.net/npm/glightbox/dist/js/glightbox.min.js",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      network: NetworkConfig::default(),
      install: InstallConfig::default(),
      database: None,
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      user_agent: concat!("gallery-cache/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

/// Retry policy for a failed install.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
  pub max_attempts: u32,
  pub retry_delay_ms: u64,
}

impl Default for InstallConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      retry_delay_ms: 1000,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write logs here instead of stderr
  pub file: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./gallery-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gallery-cache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("gallery-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gallery-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Check that the scope, namespaces and manifest are usable together.
  pub fn validate(&self) -> Result<()> {
    self.scope_url()?;

    if self.static_cache.trim().is_empty() || self.image_cache.trim().is_empty() {
      return Err(eyre!("Namespace names must not be empty"));
    }
    if self.static_cache == self.image_cache {
      return Err(eyre!(
        "static_cache and image_cache must differ (both are '{}')",
        self.static_cache
      ));
    }

    let manifest = self.manifest()?;
    let offline = self.offline_url()?;
    if !manifest.contains(&offline) {
      return Err(eyre!(
        "offline_page {} is not in the precache list",
        offline
      ));
    }

    Ok(())
  }

  pub fn scope_url(&self) -> Result<Url> {
    Url::parse(&self.scope).map_err(|e| eyre!("Invalid scope '{}': {}", self.scope, e))
  }

  pub fn offline_url(&self) -> Result<Url> {
    self
      .scope_url()?
      .join(&self.offline_page)
      .map_err(|e| eyre!("Invalid offline_page '{}': {}", self.offline_page, e))
  }

  pub fn manifest(&self) -> Result<PrecacheManifest> {
    PrecacheManifest::resolve(&self.scope_url()?, &self.precache)
  }

  pub fn namespaces(&self) -> Namespaces {
    Namespaces::new(self.static_cache.clone(), self.image_cache.clone())
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => crate::db::Database::default_path(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.manifest().unwrap().urls().len(), 8);
    assert_eq!(
      config.offline_url().unwrap().as_str(),
      "http://localhost:8080/offline.html"
    );
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "scope: https://photos.example/gallery/\nstatic_cache: static-image-gallery-v2\n",
    )
    .unwrap();
    config.validate().unwrap();
    assert_eq!(config.static_cache, "static-image-gallery-v2");
    assert_eq!(config.image_cache, "image-cache");
    assert_eq!(config.install.max_attempts, 3);
    assert_eq!(
      config.offline_url().unwrap().as_str(),
      "https://photos.example/gallery/offline.html"
    );
  }

  #[test]
  fn test_offline_page_must_be_precached() {
    let config = Config {
      precache: vec!["./".to_string(), "./index.html".to_string()],
      ..Config::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("not in the precache list"));
  }

  #[test]
  fn test_namespaces_must_differ() {
    let config = Config {
      image_cache: "static-image-gallery-v1".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_relative_scope_is_rejected() {
    let config = Config {
      scope: "gallery/".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_load_explicit_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("gallery-cache.yaml");
    std::fs::write(
      &path,
      "scope: https://photos.example/\nprecache: ['./', './offline.html']\nnetwork:\n  timeout_secs: 5\n",
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.network.timeout_secs, 5);
    assert_eq!(config.manifest().unwrap().urls().len(), 2);
  }

  #[test]
  fn test_load_missing_explicit_file_fails() {
    let temp = TempDir::new().unwrap();
    let err = Config::load(Some(&temp.path().join("nope.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
