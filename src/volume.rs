//! Volume materialization for pod submissions.
//!
//! A pod's config-map, secret, and scratch volumes are translated into
//! `--bind` specifications for the container runtime. In shared-filesystem
//! mode the backing files are written before submission; otherwise the
//! values travel as environment variables on the submit command and a shell
//! fragment in the script prefix recreates the files on the compute node.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::info;

use crate::config::SlurmConfig;
use crate::pod::ConfigMap;
use crate::pod::Container;
use crate::pod::Pod;
use crate::pod::PodPayload;
use crate::pod::Secret;

/// File mode applied when a volume does not declare one.
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Environment variable selecting shared-filesystem materialization.
const SHARED_FS_ENV: &str = "SHARED_FS";

/// Errors raised while materializing pod volumes.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    /// A volume source directory could not be prepared.
    #[error("failed to prepare volume directory `{path}`")]
    Directory {
        /// The directory being prepared.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A volume entry file could not be written.
    #[error("failed to write volume file `{path}`")]
    WriteFile {
        /// The file being written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// A volume payload to materialize, tagged by its runtime shape.
#[derive(Debug, Clone, Copy)]
pub enum VolumePayload<'a> {
    /// A config map with string entries.
    ConfigMap(&'a ConfigMap),
    /// A secret with binary entries.
    Secret(&'a Secret),
    /// A scratch directory; the tag carries the volume name only.
    EmptyDir(&'a str),
}

/// An environment assignment carrying a deferred volume value to the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvExport {
    /// The variable name, `<container>_CFG_<key>` or `<container>_SECRET_<key>`.
    pub name: String,
    /// The value redirected into the target file on the compute node.
    pub value: String,
}

/// The bind specifications and deferred exports produced for one payload.
#[derive(Debug, Default)]
pub struct Materialized {
    /// Bind entries in the literal `<source>:<target>,` form, trailing comma
    /// included.
    pub binds: Vec<String>,
    /// Environment assignments paired index-for-index with `binds` when
    /// materialization is deferred; empty in shared-filesystem mode.
    pub exports: Vec<EnvExport>,
}

/// The aggregate result of preparing all volumes of one container.
#[derive(Debug, Default)]
pub struct ContainerMounts {
    /// The `--bind` argument value with the final trailing comma stripped,
    /// if any bind was produced.
    pub bind_arg: Option<String>,
    /// Script-prefix fragments recreating deferred files on the compute
    /// node.
    pub fragments: Vec<String>,
    /// Environment assignments to apply to the submit command.
    pub exports: Vec<EnvExport>,
}

/// Materializes pod volumes into bind specifications and side effects.
#[derive(Debug, Clone, Copy)]
pub struct Materializer {
    /// Whether volume materialization is enabled at all.
    export_pod_data: bool,
    /// Whether the sidecar host shares a filesystem with the compute nodes.
    shared_fs: bool,
}

impl Materializer {
    /// Creates a materializer with explicit modes.
    pub fn new(export_pod_data: bool, shared_fs: bool) -> Self {
        Self {
            export_pod_data,
            shared_fs,
        }
    }

    /// Creates a materializer from the configuration and the ambient
    /// `SHARED_FS` toggle.
    pub fn from_env(config: &SlurmConfig) -> Self {
        let shared_fs = std::env::var(SHARED_FS_ENV).is_ok_and(|v| v == "true");
        Self::new(config.export_pod_data, shared_fs)
    }

    /// Aggregates all volume payloads of one container, in config-map,
    /// secret, scratch order.
    ///
    /// # Errors
    ///
    /// Returns an error if a source directory cannot be prepared or an entry
    /// cannot be written.
    pub fn prepare_mounts(
        &self,
        working_path: &Path,
        payload: &PodPayload,
        container: &Container,
    ) -> Result<ContainerMounts, MaterializeError> {
        info!("preparing mountpoints for container `{}`", container.name);

        let mut binds = String::new();
        let mut mounts = ContainerMounts::default();

        for bundle in &payload.containers {
            if bundle.name != container.name {
                continue;
            }

            for config_map in &bundle.config_maps {
                self.collect(
                    working_path,
                    container,
                    &payload.pod,
                    VolumePayload::ConfigMap(config_map),
                    &mut binds,
                    &mut mounts,
                )?;
            }

            for secret in &bundle.secrets {
                self.collect(
                    working_path,
                    container,
                    &payload.pod,
                    VolumePayload::Secret(secret),
                    &mut binds,
                    &mut mounts,
                )?;
            }

            for name in &bundle.empty_dirs {
                self.collect(
                    working_path,
                    container,
                    &payload.pod,
                    VolumePayload::EmptyDir(name),
                    &mut binds,
                    &mut mounts,
                )?;
            }
        }

        if binds.ends_with(',') {
            binds.pop();
        }

        if !binds.is_empty() {
            mounts.bind_arg = Some(binds);
        }

        Ok(mounts)
    }

    /// Materializes one payload and folds the result into the aggregate.
    fn collect(
        &self,
        working_path: &Path,
        container: &Container,
        pod: &Pod,
        payload: VolumePayload<'_>,
        binds: &mut String,
        mounts: &mut ContainerMounts,
    ) -> Result<(), MaterializeError> {
        let materialized = self.mount_data(working_path, container, pod, payload)?;

        for (index, bind) in materialized.binds.iter().enumerate() {
            if let Some(export) = materialized.exports.get(index) {
                mounts.fragments.push(deferred_fragment(bind, &export.name));
            }
            binds.push_str(bind);
        }

        mounts.exports.extend(materialized.exports);
        Ok(())
    }

    /// Materializes one volume payload for one container.
    ///
    /// The container's volume mounts are walked in order; the first mounted
    /// pod volume whose source matches the payload variant is used. A
    /// payload whose volume the container does not mount contributes
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a source directory cannot be prepared or an entry
    /// cannot be written.
    pub fn mount_data(
        &self,
        working_path: &Path,
        container: &Container,
        pod: &Pod,
        payload: VolumePayload<'_>,
    ) -> Result<Materialized, MaterializeError> {
        if !self.export_pod_data {
            return Ok(Materialized::default());
        }

        for mount in &container.volume_mounts {
            let Some(volume) = pod.spec.volumes.iter().find(|v| v.name == mount.name) else {
                continue;
            };

            match payload {
                VolumePayload::ConfigMap(config_map) => {
                    let Some(source) = &volume.config_map else {
                        continue;
                    };

                    info!("mounting config map `{}`", source.name);
                    let dir = working_path.join("configMaps").join(&volume.name);
                    let mode = source.default_mode.unwrap_or(DEFAULT_FILE_MODE);
                    // Sorted so the synthesized script is deterministic.
                    let mut entries: Vec<_> = config_map
                        .data
                        .iter()
                        .map(|(key, value)| (key.as_str(), value.as_bytes()))
                        .collect();
                    entries.sort_by_key(|(key, _)| *key);

                    return self.write_entries(&dir, &mount.mount_path, container, "CFG", mode, entries);
                }
                VolumePayload::Secret(secret) => {
                    let Some(source) = &volume.secret else {
                        continue;
                    };

                    info!("mounting secret `{}`", source.secret_name);
                    let dir = working_path.join("secrets").join(&volume.name);
                    let mode = source.default_mode.unwrap_or(DEFAULT_FILE_MODE);
                    let mut entries: Vec<_> = secret
                        .data
                        .iter()
                        .map(|(key, value)| (key.as_str(), value.0.as_slice()))
                        .collect();
                    entries.sort_by_key(|(key, _)| *key);

                    return self.write_entries(&dir, &mount.mount_path, container, "SECRET", mode, entries);
                }
                VolumePayload::EmptyDir(name) => {
                    if volume.name != name || volume.empty_dir.is_none() {
                        continue;
                    }

                    let dir = working_path.join("emptyDirs").join(&volume.name);
                    debug!("creating scratch directory `{}`", dir.display());
                    fs::create_dir_all(&dir).map_err(|source| MaterializeError::Directory {
                        path: dir.clone(),
                        source,
                    })?;

                    return Ok(Materialized {
                        binds: vec![format!(
                            "{src}:{target}/{name},",
                            src = dir.display(),
                            target = mount.mount_path
                        )],
                        exports: vec![],
                    });
                }
            }
        }

        Ok(Materialized::default())
    }

    /// Writes (or defers) the keyed entries of a config-map or secret
    /// volume rooted at `dir`.
    fn write_entries<'a>(
        &self,
        dir: &Path,
        mount_path: &str,
        container: &Container,
        env_tag: &str,
        mode: u32,
        entries: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Result<Materialized, MaterializeError> {
        // Stale entries from a previous submission of the same pod UID must
        // not leak into this one.
        remove_tolerant(dir).map_err(|source| MaterializeError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;

        if self.shared_fs {
            info!("shared filesystem enabled, creating files before submission");
            fs::create_dir_all(dir).map_err(|source| MaterializeError::Directory {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let mut materialized = Materialized::default();

        for (key, value) in entries {
            let source_path = dir.join(key);
            materialized.binds.push(format!(
                "{src}:{target}/{key},",
                src = source_path.display(),
                target = mount_path
            ));

            if self.shared_fs {
                write_with_mode(&source_path, value, mode).map_err(|source| {
                    MaterializeError::WriteFile {
                        path: source_path.clone(),
                        source,
                    }
                })?;
                debug!("wrote volume file `{}`", source_path.display());
            } else {
                let name = format!("{container}_{env_tag}_{key}", container = container.name);
                debug!("deferring `{}` to env `{name}`", source_path.display());
                materialized.exports.push(EnvExport {
                    name,
                    value: String::from_utf8_lossy(value).into_owned(),
                });
            }
        }

        Ok(materialized)
    }
}

/// Renders the shell fragment that recreates one deferred file on the
/// compute node from its exported environment variable.
fn deferred_fragment(bind: &str, env_name: &str) -> String {
    let source = bind.split(':').next().unwrap_or(bind);
    let dir = Path::new(source)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    format!("mkdir -p {dir} && touch {source} && echo ${env_name} > {source}")
}

/// Removes a directory tree, tolerating its absence.
fn remove_tolerant(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Writes a file and applies the given mode.
fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }

    Ok(())
}
