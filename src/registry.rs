//! In-memory pod→job registry with disk-backed recovery.
//!
//! The association between a pod UID and its scheduler job id is persisted
//! as `JobID.jid` inside the pod working directory so a restarted sidecar
//! can keep tracking jobs it submitted in a previous life.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Local;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;

use crate::config::SlurmConfig;
use crate::timestamp;

/// File persisting the scheduler job id inside a pod working directory.
pub const JOB_ID_FILE_NAME: &str = "JobID.jid";

/// File persisting the observed start instant.
pub const STARTED_AT_FILE_NAME: &str = "StartedAt.time";

/// File persisting the observed finish instant.
pub const FINISHED_AT_FILE_NAME: &str = "FinishedAt.time";

/// Errors raised by registry persistence and recovery.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The data root could not be scanned.
    #[error("failed to scan data root `{path}`")]
    Scan {
        /// The directory being scanned.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A working directory has no persisted job id.
    ///
    /// A working directory without a job id is unrecoverable state.
    #[error("working directory `{path}` has no `JobID.jid`")]
    MissingJobId {
        /// The working directory.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The job id could not be persisted after submission.
    #[error("failed to persist job id for pod `{pod_uid}`")]
    Persist {
        /// The pod whose job id was being persisted.
        pod_uid: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// The association between one pod and its scheduler job.
#[derive(Debug, Clone, Default)]
pub struct JobRecord {
    /// Orchestrator-assigned pod identifier.
    pub pod_uid: String,
    /// Scheduler-assigned job identifier.
    pub jid: String,
    /// When the job was first observed running, if ever.
    pub start_time: Option<DateTime<Local>>,
    /// When the job was first observed terminated, if ever.
    pub end_time: Option<DateTime<Local>>,
}

/// Mutex-guarded mapping from pod UID to job record.
#[derive(Debug, Default)]
pub struct JobRegistry {
    /// The records, keyed by pod UID.
    records: Mutex<HashMap<String, JobRecord>>,
}

impl JobRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the registry from the data root.
    ///
    /// Every top-level directory is one pod working directory named
    /// `<namespace>-<podUID>`. The persisted job id is required; missing
    /// timestamps are recorded as unobserved.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be scanned or a directory has no
    /// persisted job id.
    pub fn recover(config: &SlurmConfig) -> Result<Self, RegistryError> {
        let root = Path::new(&config.data_root_folder);
        let mut records = HashMap::new();

        let entries = fs::read_dir(root).map_err(|source| RegistryError::Scan {
            path: root.to_path_buf(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| RegistryError::Scan {
                path: root.to_path_buf(),
                source,
            })?;

            let is_dir = entry
                .file_type()
                .map_err(|source| RegistryError::Scan {
                    path: entry.path(),
                    source,
                })?
                .is_dir();
            if !is_dir {
                continue;
            }

            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let pod_uid = dir_name
                .split_once('-')
                .map(|(_, uid)| String::from(uid))
                .unwrap_or_else(|| dir_name.clone());

            let jid = fs::read_to_string(entry.path().join(JOB_ID_FILE_NAME)).map_err(
                |source| RegistryError::MissingJobId {
                    path: entry.path(),
                    source,
                },
            )?;

            let start_time = read_timestamp(&entry.path().join(STARTED_AT_FILE_NAME));
            let end_time = read_timestamp(&entry.path().join(FINISHED_AT_FILE_NAME));

            info!("recovered pod `{pod_uid}` as job `{jid}`");
            records.insert(
                pod_uid.clone(),
                JobRecord {
                    pod_uid,
                    jid,
                    start_time,
                    end_time,
                },
            );
        }

        Ok(Self {
            records: Mutex::new(records),
        })
    }

    /// Persists the job id, then records the association in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the job id file cannot be written; the in-memory
    /// record is not created in that case.
    pub async fn insert(
        &self,
        work_dir: &Path,
        pod_uid: &str,
        jid: &str,
    ) -> Result<(), RegistryError> {
        fs::write(work_dir.join(JOB_ID_FILE_NAME), jid).map_err(|source| {
            RegistryError::Persist {
                pod_uid: String::from(pod_uid),
                source,
            }
        })?;

        self.records.lock().await.insert(
            String::from(pod_uid),
            JobRecord {
                pod_uid: String::from(pod_uid),
                jid: String::from(jid),
                start_time: None,
                end_time: None,
            },
        );

        Ok(())
    }

    /// Returns a copy of the record for a pod, if present.
    pub async fn get(&self, pod_uid: &str) -> Option<JobRecord> {
        self.records.lock().await.get(pod_uid).cloned()
    }

    /// Evicts and returns the record for a pod, if present.
    pub async fn remove(&self, pod_uid: &str) -> Option<JobRecord> {
        self.records.lock().await.remove(pod_uid)
    }

    /// Records the start instant if it has not been observed yet.
    ///
    /// Returns the recorded instant and whether this call set it; `None`
    /// when the pod is unknown.
    pub async fn mark_started(
        &self,
        pod_uid: &str,
        at: DateTime<Local>,
    ) -> Option<(DateTime<Local>, bool)> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(pod_uid)?;
        match record.start_time {
            Some(existing) => Some((existing, false)),
            None => {
                record.start_time = Some(at);
                Some((at, true))
            }
        }
    }

    /// Records the finish instant if it has not been observed yet.
    ///
    /// Returns the recorded instant and whether this call set it; `None`
    /// when the pod is unknown.
    pub async fn mark_finished(
        &self,
        pod_uid: &str,
        at: DateTime<Local>,
    ) -> Option<(DateTime<Local>, bool)> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(pod_uid)?;
        match record.end_time {
            Some(existing) => Some((existing, false)),
            None => {
                record.end_time = Some(at);
                Some((at, true))
            }
        }
    }
}

/// Reads an optional persisted timestamp, tolerating absence and parse
/// failures.
fn read_timestamp(path: &Path) -> Option<DateTime<Local>> {
    match fs::read_to_string(path) {
        Ok(text) => match timestamp::parse(&text) {
            Ok(instant) => Some(instant),
            Err(e) => {
                debug!("ignoring unparseable timestamp `{}`: {e}", path.display());
                None
            }
        },
        Err(e) => {
            debug!("no timestamp at `{}`: {e}", path.display());
            None
        }
    }
}
