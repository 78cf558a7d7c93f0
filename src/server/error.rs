//! API error type mapping domain failures onto HTTP responses.
//!
//! Callers get a generic plain-text message; the details stay in the logs.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use tracing::error;

use crate::registry::RegistryError;
use crate::script::ScriptError;
use crate::slurm::CancelError;
use crate::slurm::StatusQueryError;
use crate::slurm::SubmitError;
use crate::volume::MaterializeError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request body could not be decoded.
    #[error("failed to decode request body: {0}")]
    RequestDecode(String),

    /// Volume materialization failed.
    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    /// The batch script could not be written.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// The submit command failed.
    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// The job id could not be persisted.
    #[error(transparent)]
    RegistryPersist(#[from] RegistryError),

    /// The scheduler could not be queried.
    #[error(transparent)]
    StatusQuery(#[from] StatusQueryError),

    /// The cancel command failed.
    #[error(transparent)]
    Cancel(#[from] CancelError),

    /// The pod is not tracked by this sidecar.
    #[error("pod `{0}` is not tracked by this sidecar")]
    UnknownPod(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        error!("request failed: {self}");

        let (status, message) = match self {
            Self::RequestDecode(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Some errors occurred while decoding the request. Check the sidecar logs",
            ),
            Self::Materialize(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error preparing mounts. Check the sidecar logs",
            ),
            Self::Script(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error producing the batch script. Check the sidecar logs",
            ),
            Self::Submit(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error submitting the batch script. Check the sidecar logs",
            ),
            Self::RegistryPersist(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error handling the job id. Check the sidecar logs",
            ),
            Self::StatusQuery(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error retrieving container status. Check the sidecar logs",
            ),
            Self::Cancel(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error deleting the job. Check the sidecar logs",
            ),
            Self::UnknownPod(_) => (
                StatusCode::NOT_FOUND,
                "Unknown pod. Check the sidecar logs",
            ),
        };

        (status, message).into_response()
    }
}
