//! The agent's HTTP surface: backup enumeration for clients without
//! store credentials, a manual backup trigger, and prometheus metrics.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::control::SharedState;
use crate::listing::BasebackupListResponse;
use crate::metrics;

pub struct HttpServerState {
    pub shared: Arc<SharedState>,
    pub trigger_tx: mpsc::Sender<String>,
}

pub async fn serve(
    listen_addr: &str,
    state: Arc<HttpServerState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("bad listen address {listen_addr:?}"))?;

    let make_svc = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&state), req)))
        }
    });

    let server = hyper::Server::try_bind(&addr)
        .with_context(|| format!("bind {addr}"))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await });

    info!("http endpoint listening on {addr}");
    server.await.context("http server")
}

async fn handle(
    state: Arc<HttpServerState>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().trim_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (req.method(), segments.as_slice()) {
        (&Method::GET, ["metrics"]) => match metrics::gather_text() {
            Ok(text) => text_response(StatusCode::OK, text),
            Err(e) => text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("metrics rendering failed: {e:#}"),
            ),
        },
        (&Method::GET, [site, "basebackup"]) => {
            let backups = state
                .shared
                .backups
                .read()
                .expect("shared state lock poisoned")
                .get(*site)
                .cloned();
            match backups {
                Some(basebackups) => {
                    let body = serde_json::to_vec(&BasebackupListResponse { basebackups })
                        .expect("listing serializes");
                    Response::builder()
                        .status(StatusCode::OK)
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .expect("valid response")
                }
                None => text_response(StatusCode::NOT_FOUND, format!("unknown site {site:?}\n")),
            }
        }
        (&Method::PUT, [site, "basebackup"]) => {
            match state.trigger_tx.send(site.to_string()).await {
                Ok(()) => text_response(StatusCode::ACCEPTED, "basebackup requested\n"),
                Err(_) => text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "control loop is shutting down\n",
                ),
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found\n"),
    };
    Ok(response)
}

fn text_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(body.into())
        .expect("valid response")
}
