//! # HTTP API
//!
//! ```text
//! GET    /v1/render          last deployed artifact
//! POST   /v1/render          render a submitted document without deploying it
//! GET    /v1/config/<path>   value at path (scalars wrapped in an array)
//! POST   /v1/config/<path>   merge an object into an object, else append
//! PUT    /v1/config/<path>   replace the value at path
//! DELETE /v1/config/<path>   remove the value at path
//! ```
//!
//! Writes go through [`Configurator::mutate`], so a write only lands if the
//! resulting document renders.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use configurator_core::{ConfigError, Configurator, JsonTree, Stage, Value};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// POST to a path that is neither an object nor an array
    #[error("Method not allowed")]
    NotComposite,

    /// A write failed
    #[error(transparent)]
    Mutation(#[from] ConfigError),

    /// A preview failed to render
    #[error(transparent)]
    Preview(ConfigError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotComposite => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Mutation(err) | ApiError::Preview(err) => match err {
                ConfigError::StoreConflict { .. } => StatusCode::CONFLICT,
                ConfigError::Exec(exec) if exec.stage == Stage::Reload => StatusCode::BAD_GATEWAY,
                ConfigError::Structural(_)
                | ConfigError::MutationRejected(_)
                | ConfigError::Exec(_) => StatusCode::BAD_REQUEST,
                ConfigError::Store(_) | ConfigError::Persist { .. } | ConfigError::Settings(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn body(&self) -> String {
        match self {
            ApiError::Mutation(ConfigError::Exec(exec)) => exec.output(),
            ApiError::Preview(ConfigError::Exec(exec)) => {
                let mut body = exec.output();
                body.push_str(&exec.input);
                body
            }
            ApiError::NotComposite => String::new(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.body()).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(config: Arc<Configurator>) -> Router {
    let config_routes = get(get_config)
        .post(post_config)
        .put(put_config)
        .delete(delete_config);

    Router::new()
        .route("/v1/render", get(get_render).post(preview_render))
        .route("/v1/config", config_routes.clone())
        .route("/v1/config/", config_routes.clone())
        .route("/v1/config/*path", config_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(config)
}

fn document_path(path: Option<Path<String>>) -> String {
    match path {
        Some(Path(path)) => format!("/{}", path),
        None => "/".to_string(),
    }
}

fn parse_body(body: &[u8]) -> ApiResult<Value> {
    serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(err.to_string()))
}

fn json_response(value: &Value) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        format!("{:#}\n", value),
    )
        .into_response()
}

fn mutation_result(path: &str, result: Result<(), ConfigError>) -> ApiResult<StatusCode> {
    result.map(|()| StatusCode::OK).map_err(|err| {
        warn!(path = %path, error = %err, "mutation failed");
        ApiError::Mutation(err)
    })
}

async fn get_render(State(config): State<Arc<Configurator>>) -> Vec<u8> {
    config.last_render()
}

async fn preview_render(
    State(config): State<Arc<Configurator>>,
    body: Bytes,
) -> ApiResult<Vec<u8>> {
    let document =
        JsonTree::from_slice(&body).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    config.preview(&document).await.map_err(ApiError::Preview)
}

async fn get_config(
    State(config): State<Arc<Configurator>>,
    path: Option<Path<String>>,
) -> Response {
    json_response(&config.get(&document_path(path)))
}

async fn post_config(
    State(config): State<Arc<Configurator>>,
    path: Option<Path<String>>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let path = document_path(path);
    if !config.document().is_composite(&path) {
        return Err(ApiError::NotComposite);
    }
    let value = parse_body(&body)?;

    let result = config
        .mutate(|tree| match &value {
            Value::Object(entries) if tree.is_object(&path) => tree.merge(&path, entries.clone()),
            _ => tree.append(&path, value.clone()),
        })
        .await;
    mutation_result(&path, result)
}

async fn put_config(
    State(config): State<Arc<Configurator>>,
    path: Option<Path<String>>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let path = document_path(path);
    let value = parse_body(&body)?;

    let result = config
        .mutate(|tree| tree.replace(&path, value.clone()))
        .await;
    mutation_result(&path, result)
}

async fn delete_config(
    State(config): State<Arc<Configurator>>,
    path: Option<Path<String>>,
) -> ApiResult<StatusCode> {
    let path = document_path(path);
    let result = config.mutate(|tree| tree.delete(&path)).await;
    mutation_result(&path, result)
}
