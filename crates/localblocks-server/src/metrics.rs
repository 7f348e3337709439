use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::Filter;

fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub fn metrics_route(
    registry: Registry,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || match render(&registry) {
            Ok(body) => warp::reply::with_status(body, StatusCode::OK),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
            }
        })
}

pub async fn start_metrics_server(registry: Registry, host: String, port: u16) -> Result<(), anyhow::Error> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting metrics server on http://{}/metrics", addr);
    warp::serve(metrics_route(registry)).run(addr).await;
    Ok(())
}
