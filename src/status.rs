//! Projection of scheduler job states onto container statuses.
//!
//! A poll cycle queries the scheduler once per requested pod, maps the
//! reported state into the orchestrator's container-state model, and lazily
//! persists lifecycle timestamps. Cycles are coalesced: callers arriving
//! within the poll window get the previous cycle's responses verbatim.

use std::fs;
use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use chrono::Local;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::SlurmConfig;
use crate::pod::ContainerState;
use crate::pod::ContainerStatus;
use crate::pod::Pod;
use crate::pod::PodStatus;
use crate::registry::FINISHED_AT_FILE_NAME;
use crate::registry::JobRegistry;
use crate::registry::STARTED_AT_FILE_NAME;
use crate::slurm;
use crate::slurm::JobState;
use crate::slurm::StatusQueryError;
use crate::timestamp;
use crate::workdir;

/// Minimum interval between two scheduler poll cycles.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Exit code synthesized when a container's status file cannot be read.
const FALLBACK_EXIT_CODE: i32 = 500;

/// Cached result of the last completed poll cycle.
#[derive(Debug, Default)]
struct StatusCache {
    /// The responses produced by the last cycle.
    responses: Vec<PodStatus>,
    /// When the last cycle completed.
    refreshed_at: Option<Instant>,
}

impl StatusCache {
    /// Whether the cached responses are still within the poll window.
    fn fresh(&self) -> bool {
        matches!(self.refreshed_at, Some(at) if at.elapsed() < POLL_INTERVAL)
    }
}

/// Rate-limited status projector shared by all status requests.
#[derive(Debug, Default)]
pub struct StatusProjector {
    /// The cache, locked for the whole cycle so concurrent callers coalesce.
    cache: Mutex<StatusCache>,
}

impl StatusProjector {
    /// Creates a projector with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one poll cycle, serving cached responses within the window.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler self-query fails; the cache is left
    /// untouched in that case.
    pub async fn poll(
        &self,
        config: &SlurmConfig,
        registry: &JobRegistry,
        pods: &[Pod],
    ) -> Result<Vec<PodStatus>, StatusQueryError> {
        let mut cache = self.cache.lock().await;

        if cache.fresh() {
            debug!("serving cached status");
            return Ok(cache.responses.clone());
        }

        slurm::check_connectivity(config).await?;

        let mut responses = Vec::new();

        for pod in pods {
            let uid = &pod.metadata.uid;
            let Some(record) = registry.get(uid).await else {
                warn!("pod `{uid}` is not tracked by this sidecar, skipping");
                continue;
            };

            let work_dir = workdir::pod_dir(config, &pod.metadata.namespace, uid);
            let output = slurm::query_job(config, &record.jid).await?;

            let containers = if output.stderr.is_empty() {
                match project_job_state(registry, pod, &work_dir, &output.stdout).await {
                    Some(status) => vec![status],
                    None => vec![],
                }
            } else {
                warn!(
                    "job `{jid}` is no longer known to the scheduler: {stderr}",
                    jid = record.jid,
                    stderr = output.stderr.trim()
                );
                statuses_from_exit_files(&work_dir, pod)
            };

            responses.push(PodStatus {
                pod_name: pod.metadata.name.clone(),
                pod_uid: uid.clone(),
                pod_namespace: pod.metadata.namespace.clone(),
                containers,
            });
        }

        cache.responses = responses.clone();
        cache.refreshed_at = Some(Instant::now());

        Ok(responses)
    }
}

/// Maps the scheduler's pod-granular state onto the pod's first container.
///
/// Returns `None` for a pod with no declared containers.
pub(crate) async fn project_job_state(
    registry: &JobRegistry,
    pod: &Pod,
    work_dir: &Path,
    stdout: &str,
) -> Option<ContainerStatus> {
    let uid = &pod.metadata.uid;
    let container = pod.spec.containers.first()?;
    let now = Local::now();
    let state = JobState::find(stdout);

    match state {
        Some(s) => info!("pod `{uid}` reported in state `{s}`"),
        // Any unknown output is treated as terminal.
        None => info!("pod `{uid}` reported without a known state, treating as terminated"),
    }

    let state = match state {
        Some(s) if s.waiting() => ContainerState::Waiting {},
        Some(s) if s.running() => {
            let started_at = match registry.mark_started(uid, now).await {
                Some((at, newly_set)) => {
                    if newly_set {
                        persist_timestamp(&work_dir.join(STARTED_AT_FILE_NAME), at);
                    }
                    Some(at)
                }
                None => None,
            };
            ContainerState::Running { started_at }
        }
        _ => {
            if let Some((at, newly_set)) = registry.mark_finished(uid, now).await
                && newly_set
            {
                persist_timestamp(&work_dir.join(FINISHED_AT_FILE_NAME), at);
            }
            let record = registry.get(uid).await;
            ContainerState::Terminated {
                exit_code: 0,
                started_at: record.as_ref().and_then(|r| r.start_time),
                finished_at: record.as_ref().and_then(|r| r.end_time),
            }
        }
    };

    let ready = matches!(state, ContainerState::Running { .. });
    Some(ContainerStatus {
        name: container.name.clone(),
        state,
        ready,
    })
}

/// Derives one terminated status per declared container from the persisted
/// exit-code files, used once the job has left the scheduler's view.
pub(crate) fn statuses_from_exit_files(work_dir: &Path, pod: &Pod) -> Vec<ContainerStatus> {
    pod.spec
        .containers
        .iter()
        .map(|container| {
            let path = work_dir.join(format!("{}.status", container.name));
            let exit_code = fs::read_to_string(&path)
                .ok()
                .and_then(|text| text.trim().parse::<i32>().ok())
                .unwrap_or_else(|| {
                    error!(
                        "unable to read container exit status from `{}`",
                        path.display()
                    );
                    FALLBACK_EXIT_CODE
                });

            ContainerStatus {
                name: container.name.clone(),
                state: ContainerState::Terminated {
                    exit_code,
                    started_at: None,
                    finished_at: None,
                },
                ready: false,
            }
        })
        .collect()
}

/// Persists a lifecycle instant, logging instead of failing the cycle.
fn persist_timestamp(path: &Path, at: chrono::DateTime<Local>) {
    if let Err(e) = fs::write(path, timestamp::format(&at)) {
        error!("failed to persist timestamp `{}`: {e}", path.display());
    }
}
