//! Pod lifecycle handlers.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use tracing::info;
use tracing::warn;

use super::AppState;
use super::error::Error;
use crate::pod::Pod;
use crate::pod::PodPayload;
use crate::pod::PodStatus;
use crate::script;
use crate::script::ScriptBuilder;
use crate::slurm;
use crate::volume::Materializer;
use crate::workdir;

/// Submit pods as batch jobs.
///
/// Every pod in the request becomes one batch script and one `sbatch`
/// submission. The first failure aborts the request; pods submitted earlier
/// in the batch stay submitted.
#[utoipa::path(
    post,
    path = "/submit",
    request_body = Vec<PodPayload>,
    responses(
        (status = 200, description = "All pods were submitted", body = String),
        (status = 500, description = "Submission failed"),
    ),
    tag = "pods"
)]
pub async fn submit(
    State(state): State<AppState>,
    payload: Result<Json<Vec<PodPayload>>, JsonRejection>,
) -> Result<&'static str, Error> {
    info!("received Submit call");
    let Json(payloads) = payload.map_err(|rejection| Error::RequestDecode(rejection.to_string()))?;

    for payload in &payloads {
        submit_pod(&state, payload).await?;
    }

    Ok("Containers created")
}

/// Submits one pod, tearing its working directory down on failure.
async fn submit_pod(state: &AppState, payload: &PodPayload) -> Result<(), Error> {
    let config = &state.config.slurm;
    let pod = &payload.pod;
    let work_dir = workdir::pod_dir(config, &pod.metadata.namespace, &pod.metadata.uid);

    let result = build_and_submit(state, payload, &work_dir).await;
    if result.is_err()
        && let Err(e) = workdir::remove(&work_dir)
    {
        warn!(
            "failed to remove working directory `{}`: {e}",
            work_dir.display()
        );
    }

    result
}

/// Materializes volumes, synthesizes the script, submits it, and records
/// the assigned job id.
async fn build_and_submit(
    state: &AppState,
    payload: &PodPayload,
    work_dir: &std::path::Path,
) -> Result<(), Error> {
    let config = &state.config.slurm;
    let pod = &payload.pod;
    let uid = &pod.metadata.uid;

    workdir::create(work_dir).map_err(|source| {
        Error::Materialize(crate::volume::MaterializeError::Directory {
            path: work_dir.to_path_buf(),
            source,
        })
    })?;

    let materializer = Materializer::from_env(config);
    let mut builder = ScriptBuilder::new(config, pod, work_dir);
    let mut submit_envs = Vec::new();

    for container in &pod.spec.containers {
        info!("beginning script generation for container `{}`", container.name);

        let mounts = materializer.prepare_mounts(work_dir, payload, container)?;
        for fragment in &mounts.fragments {
            builder.push_prefix_fragment(fragment);
        }
        submit_envs.extend(mounts.exports);

        builder.push_invocation(script::container_invocation(
            config,
            pod,
            container,
            mounts.bind_arg.as_deref(),
        ));
    }

    let script_path = builder.write()?;
    let jid = slurm::submit(config, &script_path, &submit_envs).await?;
    info!("pod `{uid}` submitted as job `{jid}`");

    if let Err(e) = state.registry.insert(work_dir, uid, &jid).await {
        // The job is live but the record would not survive a restart; cancel
        // it rather than leak the allocation.
        if let Err(cancel_err) = slurm::cancel(config, &jid).await {
            warn!("failed to cancel job `{jid}` after persist failure: {cancel_err}");
        }
        return Err(e.into());
    }

    Ok(())
}

/// Report the status of the given pods.
///
/// Responses are coalesced: calls within the poll window return the
/// previous cycle's responses verbatim.
#[utoipa::path(
    post,
    path = "/status",
    request_body = Vec<Pod>,
    responses(
        (status = 200, description = "Per-pod container statuses", body = Vec<PodStatus>),
        (status = 500, description = "The scheduler could not be queried"),
    ),
    tag = "pods"
)]
pub async fn status(
    State(state): State<AppState>,
    payload: Result<Json<Vec<Pod>>, JsonRejection>,
) -> Result<Json<Vec<PodStatus>>, Error> {
    info!("received GetStatus call");
    let Json(pods) = payload.map_err(|rejection| Error::RequestDecode(rejection.to_string()))?;

    let responses = state
        .status
        .poll(&state.config.slurm, &state.registry, &pods)
        .await?;

    Ok(Json(responses))
}

/// Cancel the given pods' jobs and tear down their working state.
#[utoipa::path(
    post,
    path = "/delete",
    request_body = Vec<Pod>,
    responses(
        (status = 200, description = "All pods were deleted", body = String),
        (status = 404, description = "A pod is not tracked by this sidecar"),
        (status = 500, description = "Cancellation failed"),
    ),
    tag = "pods"
)]
pub async fn delete(
    State(state): State<AppState>,
    payload: Result<Json<Vec<Pod>>, JsonRejection>,
) -> Result<&'static str, Error> {
    info!("received Delete call");
    let Json(pods) = payload.map_err(|rejection| Error::RequestDecode(rejection.to_string()))?;

    let config = &state.config.slurm;

    for pod in &pods {
        let uid = &pod.metadata.uid;
        let record = state
            .registry
            .get(uid)
            .await
            .ok_or_else(|| Error::UnknownPod(uid.clone()))?;

        info!("deleting job `{jid}` for pod `{uid}`", jid = record.jid);

        // On cancel failure the registry entry stays, so a retry can find
        // the job again.
        slurm::cancel(config, &record.jid).await?;

        let work_dir = workdir::pod_dir(config, &pod.metadata.namespace, uid);
        if let Err(e) = workdir::remove(&work_dir) {
            warn!(
                "failed to remove working directory `{}`: {e}",
                work_dir.display()
            );
        }

        state.registry.remove(uid).await;
    }

    Ok("Containers deleted")
}
