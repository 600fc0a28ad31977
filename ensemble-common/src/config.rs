//! Configuration resolution
//!
//! Resolves the Ensemble root folder (database and state live under it)
//! from, in priority order: an explicit value (CLI flag), an environment
//! variable, and a home-relative default.

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Default root folder name under the user's home directory.
const DEFAULT_ROOT_DIR: &str = ".ensemble";

/// Resolve the root folder path.
///
/// # Arguments
/// - `explicit`: value from the command line, if any
/// - `env_var`: environment variable to consult (e.g. `ENSEMBLE_ROOT`)
pub fn resolve_root_folder(explicit: Option<&str>, env_var: &str) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(PathBuf::from(path));
    }

    if let Ok(path) = std::env::var(env_var) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let home = std::env::var("HOME")
        .map_err(|_| Error::Config("HOME not set and no root folder given".to_string()))?;

    Ok(PathBuf::from(home).join(DEFAULT_ROOT_DIR))
}
