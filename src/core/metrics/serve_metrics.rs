use std::net::SocketAddr;

use anyhow::Context;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::blockchains::cometbft::metrics::REGISTRY as COREMON_REGISTRY;

use super::exporter_metrics::EXPORTER_REGISTRY;

fn render_metrics() -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    let mut metric_families = COREMON_REGISTRY.gather();
    metric_families.extend(EXPORTER_REGISTRY.gather());

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("(Metrics) Could not encode metrics: {}", e);
        let mut response = Response::new(Body::from("could not encode metrics"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return response;
    }

    let mut response = Response::new(Body::from(buffer));
    if let Ok(content_type) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

fn not_found() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

///
/// Serves watcher and exporter metrics with Prometheus format on `path`
/// until `shutdown` is cancelled.
///
pub async fn serve_metrics(
    address: String,
    port: u16,
    path: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", address, port)
        .parse()
        .with_context(|| format!("Unable to parse metrics address {}:{}", address, port))?;

    let make_svc = make_service_fn(move |_| {
        let path = path.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let response = if req.uri().path() == path {
                    render_metrics()
                } else {
                    not_found()
                };
                async move { Ok::<_, hyper::Error>(response) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Could not bind metrics server to {}", addr))?
        .serve(make_svc);
    info!("(Metrics) Serving Prometheus metrics on {}", addr);

    server
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Metrics server failed")
}
