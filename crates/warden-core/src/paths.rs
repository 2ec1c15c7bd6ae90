use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::{CoreError, Result};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "warden";
pub const APP_NAME: &str = "warden";

pub const DATA_DIR_ENV: &str = "WARDEN_DATA_DIR";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| CoreError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("config.json"))
}

pub fn credential_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("master.json"))
}

pub fn database_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("warden.db"))
}

pub fn trusted_sources_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("trusted_sources.json"))
}

pub fn checksums_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("model_checksums.json"))
}
