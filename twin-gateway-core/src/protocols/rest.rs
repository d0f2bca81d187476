use std::time::Instant;

use hyper::header::CONTENT_TYPE;
use hyper::{Body, Request, Response, StatusCode};
use serde::Serialize;
use tracing::{info, warn};

use crate::canonical::UpdatePayload;
use crate::command::Completion;
use crate::error::{FailureReport, TwinError, UpdateFailure};
use crate::middleware::observability::Metrics;
use crate::update::DataUpdate;

#[derive(Debug, Serialize)]
pub struct FailedUpdatesResponse {
    pub failures: Vec<FailureReport>,
}

/// `POST /v1/updates`: a single DTO, a bare array or a `{ "dtos": [...] }`
/// envelope.
pub async fn handle_updates(
    req: Request<Body>,
    updates: DataUpdate,
    metrics: Metrics,
) -> Result<Response<Body>, hyper::Error> {
    let started = Instant::now();

    if !updates.gateway().is_accepting() {
        metrics.inc_requests("updates", "503");
        return Ok(status(StatusCode::SERVICE_UNAVAILABLE, "gateway closed"));
    }

    let body = hyper::body::to_bytes(req.into_body()).await?;
    let payload: UpdatePayload = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error=%e, "invalid json");
            metrics.inc_requests("updates", "400");
            return Ok(status(StatusCode::BAD_REQUEST, "invalid json"));
        }
    };

    let resp = match updates.push_update(payload).await {
        Ok(()) => {
            metrics.inc_requests("updates", "204");
            status(StatusCode::NO_CONTENT, "")
        }
        Err(failed) if failed.failures.iter().all(is_unavailable) => {
            warn!(failed = failed.failures.len(), "gateway unavailable");
            metrics.inc_requests("updates", "503");
            status(StatusCode::SERVICE_UNAVAILABLE, "gateway unavailable")
        }
        Err(failed) => {
            info!(failed = failed.failures.len(), "updates partially rejected");
            metrics.inc_requests("updates", "422");
            json(StatusCode::UNPROCESSABLE_ENTITY, &FailedUpdatesResponse { failures: failed.report() })
        }
    };
    metrics.observe_latency("updates", started.elapsed().as_secs_f64());
    Ok(resp)
}

fn is_unavailable(failure: &UpdateFailure) -> bool {
    matches!(
        failure,
        UpdateFailure::Batch { error: TwinError::Closed | TwinError::QueueFull { .. }, .. }
    )
}

/// `GET /v1/providers`
pub async fn list_providers(updates: DataUpdate, metrics: Metrics) -> Result<Response<Body>, hyper::Error> {
    let started = Instant::now();
    let resp = match updates.gateway().run(|twin| Ok(Completion::Done(twin.snapshot_all()))).await {
        Ok(snapshots) => {
            metrics.inc_requests("providers", "200");
            json(StatusCode::OK, &snapshots)
        }
        Err(e) => unavailable(e, "providers", &metrics),
    };
    metrics.observe_latency("providers", started.elapsed().as_secs_f64());
    Ok(resp)
}

/// `GET /v1/providers/{name}`
pub async fn get_provider(name: &str, updates: DataUpdate, metrics: Metrics) -> Result<Response<Body>, hyper::Error> {
    let started = Instant::now();
    let lookup = name.to_string();
    let resp = match updates
        .gateway()
        .run(move |twin| Ok(Completion::Done(twin.snapshot_provider(&lookup))))
        .await
    {
        Ok(Some(snapshot)) => {
            metrics.inc_requests("provider", "200");
            json(StatusCode::OK, &snapshot)
        }
        Ok(None) => {
            metrics.inc_requests("provider", "404");
            status(StatusCode::NOT_FOUND, "provider not found")
        }
        Err(e) => unavailable(e, "provider", &metrics),
    };
    metrics.observe_latency("provider", started.elapsed().as_secs_f64());
    Ok(resp)
}

fn unavailable(error: TwinError, route: &'static str, metrics: &Metrics) -> Response<Body> {
    warn!(error=%error, route, "snapshot failed");
    metrics.inc_requests(route, "503");
    status(StatusCode::SERVICE_UNAVAILABLE, "gateway unavailable")
}

fn json<T: Serialize>(status: StatusCode, v: &T) -> Response<Body> {
    match serde_json::to_vec(v) {
        Ok(body) => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = status;
            resp.headers_mut()
                .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => {
            warn!(error=%e, "response encoding failed");
            self::status(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
        }
    }
}

fn status(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::gateway::{GatewayThread, ShutdownMode};

    fn setup() -> (DataUpdate, Metrics) {
        let gateway = GatewayThread::with_defaults().unwrap();
        let metrics = gateway.metrics().clone();
        (DataUpdate::new(gateway), metrics)
    }

    fn post(body: Value) -> Request<Body> {
        Request::post("/v1/updates").body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(resp: Response<Body>) -> Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn accepted_update_is_readable() {
        let (updates, metrics) = setup();
        let resp = handle_updates(
            post(json!({ "provider": "P1", "service": "svc", "resource": "val", "value": 10 })),
            updates.clone(),
            metrics.clone(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = get_provider("P1", updates.clone(), metrics.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["name"], "P1");

        let resp = list_providers(updates, metrics).await.unwrap();
        assert_eq!(body_json(resp).await.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn bare_array_is_accepted() {
        let (updates, metrics) = setup();
        let resp = handle_updates(
            post(json!([
                { "provider": "P1", "service": "svc", "resource": "a", "value": 1 },
                { "provider": "P2", "service": "svc", "resource": "b", "value": 2 }
            ])),
            updates.clone(),
            metrics.clone(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = list_providers(updates, metrics).await.unwrap();
        assert_eq!(body_json(resp).await.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn partial_failure_is_unprocessable() {
        let (updates, metrics) = setup();
        let resp = handle_updates(
            post(json!({ "dtos": [
                { "provider": "P1", "service": "svc", "resource": "a", "value": 1 },
                { "provider": "P1", "service": "svc", "resource": "b", "type": "integer", "value": "nope" }
            ]})),
            updates,
            metrics,
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(resp).await;
        assert_eq!(body["failures"][0]["index"], 1);
        assert_eq!(body["failures"][0]["kind"], "mapping");
    }

    #[tokio::test]
    async fn invalid_json_and_unknown_provider() {
        let (updates, metrics) = setup();
        let req = Request::post("/v1/updates").body(Body::from("{not json")).unwrap();
        let resp = handle_updates(req, updates.clone(), metrics.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = get_provider("missing", updates, metrics).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn closed_gateway_is_unavailable() {
        let (updates, metrics) = setup();
        updates.gateway().shutdown(ShutdownMode::Drain).await;
        let resp = handle_updates(
            post(json!({ "provider": "P1", "service": "svc", "resource": "val", "value": 1 })),
            updates,
            metrics,
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
