//! Server setup and routing.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::http::HeaderValue;
use axum::routing::post;
use tower_http::cors::AllowOrigin;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi as _;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::Config;
use crate::pod;
use crate::registry::JobRegistry;
use crate::status::StatusProjector;

pub mod error;
pub mod pods;

/// Application state shared by all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Loaded sidecar configuration.
    pub config: Arc<Config>,
    /// The pod→job registry.
    pub registry: Arc<JobRegistry>,
    /// The rate-limited status projector.
    pub status: Arc<StatusProjector>,
}

/// OpenAPI documentation for the sidecar API.
#[derive(utoipa::OpenApi)]
#[openapi(
    paths(pods::submit, pods::status, pods::delete),
    components(schemas(
        pod::ConfigMap,
        pod::Container,
        pod::ContainerPayload,
        pod::ContainerState,
        pod::ContainerStatus,
        pod::EnvVar,
        pod::ObjectMeta,
        pod::Pod,
        pod::PodPayload,
        pod::PodSpec,
        pod::PodStatus,
        pod::Secret,
        pod::Volume,
        pod::VolumeMount,
    )),
    tags(
        (name = "pods", description = "Pod lifecycle endpoints")
    )
)]
pub struct ApiDoc;

/// Create the application router.
pub fn create_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/submit", post(pods::submit))
        .route("/status", post(pods::status))
        .route("/delete", post(pods::delete))
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/openapi.json", ApiDoc::openapi()))
        .layer(cors)
}

/// Run the server.
///
/// # Errors
///
/// Returns an error if the server fails to start or bind to the address.
pub async fn run(config: Config, registry: JobRegistry) -> anyhow::Result<()> {
    let origins = config
        .server
        .allowed_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("invalid CORS origin: `{origin}`"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let cors = CorsLayer::new().allow_origin(AllowOrigin::list(origins));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState {
        config: Arc::new(config),
        registry: Arc::new(registry),
        status: Arc::new(StatusProjector::new()),
    };

    let app = create_router(state, cors);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("sidecar listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
