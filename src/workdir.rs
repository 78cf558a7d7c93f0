//! Per-pod working directories under the data root.
//!
//! Every pod gets one directory at `<data_root_folder><namespace>-<uid>`
//! holding the batch script, scheduler logs, per-container output and exit
//! status files, the persisted job id, and lifecycle timestamps.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use crate::config::SlurmConfig;

/// Creates the data root directory if it is absent.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn ensure_root(config: &SlurmConfig) -> io::Result<()> {
    fs::create_dir_all(&config.data_root_folder)
}

/// Returns the working directory for a pod.
///
/// The root is concatenated directly: it always carries a trailing slash
/// (see [`crate::config::Config::validate`]).
pub fn pod_dir(config: &SlurmConfig, namespace: &str, uid: &str) -> PathBuf {
    PathBuf::from(format!(
        "{root}{namespace}-{uid}",
        root = config.data_root_folder
    ))
}

/// Creates a pod working directory and any missing parents.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn create(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Removes a pod working directory tree.
///
/// Removal succeeds on partially created trees: a missing directory is not
/// an error.
///
/// # Errors
///
/// Returns an error if an existing tree cannot be removed.
pub fn remove(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
