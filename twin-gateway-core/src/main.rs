use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tracing::{error, info};

use twin_gateway_core::bus::{NotificationBus, TracingListener};
use twin_gateway_core::config::Config;
use twin_gateway_core::digital_twin::DigitalTwin;
use twin_gateway_core::gateway::GatewayThread;
use twin_gateway_core::middleware::observability::Metrics;
use twin_gateway_core::protocols::rest;
use twin_gateway_core::update::DataUpdate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = parse_config_path_from_args()
        .or_else(|| std::env::var("TWIN_CONFIG").ok())
        .unwrap_or_else(|| "config/twin.yaml".to_string());
    let cfg = Config::from_path(&config_path).context("loading config")?;
    info!(%config_path, version = %cfg.version, "loaded config");

    let bus = NotificationBus::new();
    if cfg.gateway.log_notifications {
        bus.add_listener(["*"], Arc::new(TracingListener));
    }
    let gateway = GatewayThread::start(&cfg.gateway, DigitalTwin::new(), bus).context("starting gateway")?;
    let updates = DataUpdate::new(gateway.clone());
    let metrics = gateway.metrics().clone();
    let metrics_path: Arc<str> = cfg.observability.metrics_path.clone().into();

    let http_addr: SocketAddr = cfg.http.bind.parse().context("invalid http.bind")?;

    let make_svc = make_service_fn(move |_conn| {
        let updates = updates.clone();
        let metrics = metrics.clone();
        let metrics_path = Arc::clone(&metrics_path);
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let updates = updates.clone();
                let metrics = metrics.clone();
                let metrics_path = Arc::clone(&metrics_path);
                async move { handle_http(req, updates, metrics, &metrics_path).await }
            }))
        }
    });

    let http_server = Server::bind(&http_addr).serve(make_svc);
    info!(%http_addr, "http listening");

    tokio::select! {
        r = http_server => {
            if let Err(e) = r { error!(error=%e, "http server error"); }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    gateway.shutdown(cfg.gateway.shutdown).await;
    info!(mode = ?cfg.gateway.shutdown, "gateway stopped");
    Ok(())
}

async fn handle_http(
    req: Request<Body>,
    updates: DataUpdate,
    metrics: Metrics,
    metrics_path: &str,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    match (req.method().as_str(), path.as_str()) {
        ("GET", "/healthz") => Ok(Response::new(Body::from("ok"))),
        ("GET", p) if p == metrics_path => Ok(metrics.render()),
        ("POST", "/v1/updates") => rest::handle_updates(req, updates, metrics).await,
        ("GET", "/v1/providers") => rest::list_providers(updates, metrics).await,
        ("GET", p) if p.starts_with("/v1/providers/") => {
            let name = &p["/v1/providers/".len()..];
            rest::get_provider(name, updates, metrics).await
        }
        _ => {
            let mut r = Response::new(Body::from("not found"));
            *r.status_mut() = hyper::StatusCode::NOT_FOUND;
            Ok(r)
        }
    }
}

fn parse_config_path_from_args() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        if a == "--config" {
            return args.next();
        }
        if let Some(v) = a.strip_prefix("--config=") {
            return Some(v.to_string());
        }
    }
    None
}
