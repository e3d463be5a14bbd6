use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::{
    Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::{CONTENT_TYPE, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;

/// Build a meter provider which exports all instruments into `registry`.
///
/// Install it with `opentelemetry::global::set_meter_provider` to collect the
/// controller metrics.
pub fn prometheus_meter_provider(registry: &Registry) -> anyhow::Result<SdkMeterProvider> {
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    Ok(SdkMeterProvider::builder().with_reader(exporter).build())
}

async fn serve_req(
    _req: Request<Incoming>,
    registry: Registry,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut result = Vec::new();
    let response = match encoder.encode(&metric_families, &mut result) {
        Ok(_) => {
            let mut response = Response::new(Full::new(Bytes::from(result)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
            response
        }
        Err(e) => {
            error!("{}", e);
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    };
    Ok(response)
}

/// Serve the metrics gathered in `registry` until `stop` fires.
pub async fn start_prometheus_metrics_server(
    listener: TcpListener,
    registry: Registry,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    debug!("Listening on http://{}", listener.local_addr()?);
    loop {
        let (stream, _) = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| serve_req(req, registry.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection failed: {}", e);
            }
        });
    }
}

/// Bind `configuration.metrics_addr` and serve `registry` in the background
/// until `stop` fires. Returns the bound address.
pub async fn serve_metrics(
    configuration: &Configuration,
    registry: Registry,
    stop: CancellationToken,
) -> anyhow::Result<(SocketAddr, JoinHandle<anyhow::Result<()>>)> {
    let listener = TcpListener::bind(configuration.metrics_addr).await?;
    let addr = listener.local_addr()?;
    info!("serving metrics on http://{}/metrics", addr);
    let handle = tokio::spawn(start_prometheus_metrics_server(listener, registry, stop));
    Ok((addr, handle))
}
