use std::fs;
use std::path::Path;

use super::{Config, ConfigError};

/// Load and validate the configuration document at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    let config: Config = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}

/// Load the configuration, writing the defaults on first run.
///
/// A missing file is not an error: the defaults are written back so the
/// operator has a document to edit. A present-but-broken file is fatal.
pub fn load_or_init(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        return load(path);
    }
    let config = Config::default();
    if let Err(e) = write_config(path, &config) {
        tracing::warn!("failed to write default config: {e}");
    }
    Ok(config)
}

/// Atomically write `config` to `path` (temp file + rename).
pub fn write_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let dir = path.parent().ok_or_else(|| ConfigError::Write {
        path: path.display().to_string(),
        reason: "config path has no parent directory".into(),
    })?;
    fs::create_dir_all(dir).map_err(|e| ConfigError::Write {
        path: path.display().to_string(),
        reason: format!("failed to create {}: {e}", dir.display()),
    })?;
    let contents = serde_yaml::to_string(config).map_err(|e| ConfigError::Write {
        path: path.display().to_string(),
        reason: format!("failed to render config: {e}"),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ConfigError::Write {
        path: path.display().to_string(),
        reason: format!("failed to create temp file: {e}"),
    })?;
    fs::write(temp.path(), contents.as_bytes()).map_err(|e| ConfigError::Write {
        path: path.display().to_string(),
        reason: format!("failed to write temp file: {e}"),
    })?;
    temp.persist(path).map_err(|e| ConfigError::Write {
        path: path.display().to_string(),
        reason: format!("failed to persist: {e}"),
    })?;
    Ok(())
}
