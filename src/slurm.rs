//! Workload-manager invocations and output parsing.
//!
//! Submission, queries, and cancellation all go through the configured
//! `sbatch`, `squeue`, and `scancel` binaries.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;
use tracing::info;

use crate::config::SlurmConfig;
use crate::exec::ExecOutput;
use crate::exec::ExecTask;
use crate::volume::EnvExport;

/// Pattern matched against `sbatch` stdout to extract the assigned job id.
static SUBMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Submitted batch job (\d+)").expect("submit pattern should compile")
});

/// Pattern matching the first scheduler state code in `squeue` output.
static STATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(CD|CG|F|PD|PR|R|S|ST)").expect("state pattern should compile")
});

/// Errors raised while submitting a batch script.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The submit binary could not be invoked.
    #[error("failed to invoke `{command}`")]
    Invoke {
        /// The binary being invoked.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The submit command reported an error.
    #[error("could not run sbatch: {stderr}")]
    Sbatch {
        /// The captured standard error.
        stderr: String,
    },

    /// The submit command output did not contain a job identifier.
    #[error("sbatch did not output a job identifier: `{stdout}`")]
    MissingJobId {
        /// The captured standard output.
        stdout: String,
    },
}

/// Errors raised while cancelling a job.
#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    /// The cancel binary could not be invoked.
    #[error("failed to invoke `{command}`")]
    Invoke {
        /// The binary being invoked.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The cancel command failed.
    #[error("scancel failed for job `{jid}`: {stderr}")]
    Scancel {
        /// The job being cancelled.
        jid: String,
        /// The captured standard error.
        stderr: String,
    },
}

/// Errors raised while querying the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum StatusQueryError {
    /// The query binary could not be invoked.
    #[error("failed to invoke `{command}`")]
    Invoke {
        /// The binary being invoked.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The scheduler self-query failed.
    #[error("unable to retrieve job status: {stderr}")]
    Squeue {
        /// The captured standard error.
        stderr: String,
    },
}

/// A scheduler job state code as reported by `squeue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// `CD`: the job completed.
    Completed,
    /// `CG`: the job is completing.
    Completing,
    /// `F`: the job failed.
    Failed,
    /// `PD`: the job is queued.
    Pending,
    /// `PR`: the job was preempted.
    Preempted,
    /// `R`: the job is running.
    Running,
    /// `S`: the job is suspended.
    Suspended,
    /// `ST`: the job was stopped.
    Stopped,
}

impl JobState {
    /// Finds the first state code occurring in `squeue` output.
    pub fn find(stdout: &str) -> Option<Self> {
        match STATE_PATTERN.find(stdout)?.as_str() {
            "CD" => Some(Self::Completed),
            "CG" => Some(Self::Completing),
            "F" => Some(Self::Failed),
            "PD" => Some(Self::Pending),
            "PR" => Some(Self::Preempted),
            "R" => Some(Self::Running),
            "S" => Some(Self::Suspended),
            "ST" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Whether the job is executing on a node.
    pub fn running(&self) -> bool {
        matches!(self, Self::Running | Self::Completing)
    }

    /// Whether the job is queued or paused.
    pub fn waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Suspended)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "CD"),
            Self::Completing => write!(f, "CG"),
            Self::Failed => write!(f, "F"),
            Self::Pending => write!(f, "PD"),
            Self::Preempted => write!(f, "PR"),
            Self::Running => write!(f, "R"),
            Self::Suspended => write!(f, "S"),
            Self::Stopped => write!(f, "ST"),
        }
    }
}

/// Submits a batch script, returning the scheduler-assigned job id.
///
/// The deferred-volume environment assignments ride on the submit command so
/// the batch job inherits them.
///
/// # Errors
///
/// Returns an error if the submit binary cannot be invoked, reports an
/// error, or does not output a job identifier.
pub async fn submit(
    config: &SlurmConfig,
    script_path: &Path,
    envs: &[EnvExport],
) -> Result<String, SubmitError> {
    info!("submitting batch job");

    let output = ExecTask::new(&config.sbatch_path)
        .arg(script_path.display().to_string())
        .shell(true)
        .envs(envs.iter().map(|e| (e.name.clone(), e.value.clone())))
        .execute()
        .await
        .map_err(|source| SubmitError::Invoke {
            command: config.sbatch_path.clone(),
            source,
        })?;

    if !output.stderr.is_empty() {
        return Err(SubmitError::Sbatch {
            stderr: output.stderr,
        });
    }

    let stdout = output.stdout.replace('\n', "");
    let jid = parse_job_id(&stdout).ok_or(SubmitError::MissingJobId { stdout })?;
    debug!("job submitted with id `{jid}`");
    Ok(jid)
}

/// Extracts the job identifier from `sbatch` output.
pub(crate) fn parse_job_id(stdout: &str) -> Option<String> {
    SUBMIT_PATTERN
        .captures(stdout)
        .map(|captures| captures[1].to_string())
}

/// Runs the coarse self-query validating scheduler connectivity.
///
/// # Errors
///
/// Returns an error if the query binary cannot be invoked or reports
/// anything on stderr.
pub async fn check_connectivity(config: &SlurmConfig) -> Result<(), StatusQueryError> {
    let output = ExecTask::new(&config.squeue_path)
        .arg("--me")
        .shell(true)
        .execute()
        .await
        .map_err(|source| StatusQueryError::Invoke {
            command: config.squeue_path.clone(),
            source,
        })?;

    if !output.stderr.is_empty() {
        return Err(StatusQueryError::Squeue {
            stderr: output.stderr,
        });
    }

    Ok(())
}

/// Queries the scheduler for one job.
///
/// A non-empty stderr in the returned output means the job is no longer
/// known to the scheduler; the caller interprets it.
///
/// # Errors
///
/// Returns an error if the query binary cannot be invoked.
pub async fn query_job(config: &SlurmConfig, jid: &str) -> Result<ExecOutput, StatusQueryError> {
    ExecTask::new(&config.squeue_path)
        .args(["--noheader", "-a", "-j"])
        .arg(jid)
        .shell(true)
        .execute()
        .await
        .map_err(|source| StatusQueryError::Invoke {
            command: config.squeue_path.clone(),
            source,
        })
}

/// Cancels a job.
///
/// # Errors
///
/// Returns an error if the cancel binary cannot be invoked or exits
/// unsuccessfully.
pub async fn cancel(config: &SlurmConfig, jid: &str) -> Result<(), CancelError> {
    info!("cancelling job `{jid}`");

    let output = ExecTask::new(&config.scancel_path)
        .arg(jid)
        .shell(true)
        .execute()
        .await
        .map_err(|source| CancelError::Invoke {
            command: config.scancel_path.clone(),
            source,
        })?;

    if output.exit_code != Some(0) {
        return Err(CancelError::Scancel {
            jid: String::from(jid),
            stderr: output.stderr,
        });
    }

    debug!("job `{jid}` cancelled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_id() {
        assert_eq!(
            parse_job_id("Submitted batch job 12345").as_deref(),
            Some("12345")
        );
        assert_eq!(parse_job_id("Submitted batch job"), None);
        assert_eq!(parse_job_id(""), None);
    }

    #[test]
    fn test_parse_job_id_contains_only_digits() {
        let jid = parse_job_id("Submitted batch job 9876 on cluster hpc").unwrap();
        assert!(jid.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(jid, "9876");
    }

    #[test]
    fn test_find_state_first_occurrence() {
        assert_eq!(
            JobState::find("123 gpu job user R 1:02 1 node1"),
            Some(JobState::Running)
        );
        assert_eq!(
            JobState::find("456 cpu job user PD 0:00 1 (Priority)"),
            Some(JobState::Pending)
        );
        assert_eq!(JobState::find("no state here"), None);
    }

    #[test]
    fn test_state_predicates() {
        assert!(JobState::Running.running());
        assert!(JobState::Completing.running());
        assert!(JobState::Pending.waiting());
        assert!(JobState::Suspended.waiting());
        assert!(!JobState::Completed.running());
        assert!(!JobState::Failed.waiting());
    }

    #[test]
    fn test_state_display_round_trip() {
        for state in [
            JobState::Completed,
            JobState::Completing,
            JobState::Failed,
            JobState::Pending,
            JobState::Preempted,
            JobState::Running,
            JobState::Suspended,
        ] {
            assert_eq!(JobState::find(&state.to_string()), Some(state));
        }

        // Alternation order: a bare `ST` token matches its `S` prefix first.
        assert_eq!(JobState::find("ST"), Some(JobState::Suspended));
    }
}
