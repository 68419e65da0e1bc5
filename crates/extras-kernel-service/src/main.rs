use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use extras_kernel_api::{ExtrasFunction, RunRequest, RunResponse, FUNCTION_CONTRACT_VERSION};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    function: ExtrasFunction,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    function_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "extras-kernel-service")]
#[command(about = "HTTP boundary for the extras kernel")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        function_contract_version: FUNCTION_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/run", post(run))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState { function: ExtrasFunction::new() };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "serving extras kernel");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn run(
    State(state): State<ServiceState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<ServiceEnvelope<RunResponse>>, ServiceError> {
    let response = state
        .function
        .run(&request)
        .map_err(|err| ServiceState::error(format!("{err:#}")))?;
    Ok(Json(envelope(response)))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use extras_kernel_core::CONTEXT_KEY_ENVIRONMENT;
    use http::Request;
    use tower::ServiceExt;

    use super::*;

    fn router() -> Router {
        app(ServiceState { function: ExtrasFunction::new() })
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_run(payload: &serde_json::Value) -> Response {
        match router()
            .oneshot(
                Request::builder()
                    .uri("/v1/run")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build run request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("run request failed: {err}"),
        }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let response = match router()
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn run_without_matches_returns_requirements_only() {
        let payload = serde_json::json!({
            "input": {
                "extraResources": [
                    {
                        "kind": "EnvironmentConfig",
                        "apiVersion": "example.org/v1",
                        "ref": {"name": "cfg-1"},
                    },
                ],
            },
            "composite": {},
        });

        let response = post_run(&payload).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/data/requirements/resources-0/matchName")
                .and_then(serde_json::Value::as_str),
            Some("cfg-1")
        );
        assert!(value.pointer("/data/context").is_none());
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn run_with_matches_returns_the_merged_environment() {
        let payload = serde_json::json!({
            "input": {
                "extraResources": [
                    {
                        "kind": "EnvironmentConfig",
                        "apiVersion": "example.org/v1",
                        "ref": {"name": "cfg-1"},
                        "fromFieldPath": "data",
                    },
                ],
            },
            "composite": {},
            "extraResources": {
                "resources-0": [
                    {"metadata": {"name": "cfg-1"}, "data": {"region": "eu-west-1"}},
                ],
            },
        });

        let response = post_run(&payload).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let environment = format!("/data/context/{}", CONTEXT_KEY_ENVIRONMENT.replace('/', "~1"));
        assert_eq!(
            value.pointer(&format!("{environment}/region")).and_then(serde_json::Value::as_str),
            Some("eu-west-1")
        );
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn failed_runs_surface_as_client_errors() {
        let payload = serde_json::json!({
            "input": {
                "extraResources": [
                    {
                        "kind": "EnvironmentConfig",
                        "apiVersion": "example.org/v1",
                        "ref": {"name": "cfg-1"},
                    },
                ],
            },
            "composite": {},
            // Answering with an unrelated key violates the protocol.
            "extraResources": {"unrelated": []},
        });

        let response = post_run(&payload).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        let error = value.get("error").and_then(serde_json::Value::as_str).map(String::from);
        let Some(error) = error else {
            panic!("error body should carry a message: {value}");
        };
        assert!(error.contains("resources-0"), "unexpected error: {error}");
    }
}
