// Parallax XHash stratum proxy: bridges GPU miners speaking EthProxy or
// Stratum v1 to a node that only exposes HTTP getwork.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json,
};
use clap::Parser;
use serde_json::json;

use xhash_stratum_proxy::config::Options;
use xhash_stratum_proxy::jobs::JobManager;
use xhash_stratum_proxy::metrics::prometheus as metrics;
use xhash_stratum_proxy::rpc::NodeRpc;
use xhash_stratum_proxy::stratum::ProxyServer;

#[derive(Clone)]
struct ApiState {
    job_manager: Arc<JobManager>,
    server: Arc<ProxyServer>,
}

async fn api_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn api_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

async fn api_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "job": state.job_manager.stats().await,
        "connections": state.server.session_count(),
        "sessions": state.server.session_stats().await,
    }))
}

fn spawn_status_api(listen: String, state: ApiState) {
    let app = axum::Router::new()
        .route("/healthz", get(api_health))
        .route("/metrics", get(api_metrics))
        .route("/api/stats", get(api_stats))
        .with_state(state);

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(&listen).await {
            Ok(listener) => {
                tracing::info!("status API listening on {}", listen);
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("status API failed: {}", e);
                }
            }
            Err(e) => {
                tracing::error!("cannot bind status API on {}: {}", listen, e);
            }
        }
    });
}

#[tokio::main]
async fn main() {
    let opts = Options::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(opts.log_level.as_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let rpc = Arc::new(NodeRpc::new(opts.rpc_url.clone()));

    // Make sure the node is actually there before taking miner traffic.
    let block = match rpc.block_number().await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("cannot connect to node at {}: {}", opts.rpc_url, e);
            tracing::error!("make sure the node is running with --http and --mine");
            std::process::exit(1);
        }
    };
    let mining = match rpc.mining_active().await {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("cannot connect to node at {}: {}", opts.rpc_url, e);
            tracing::error!("make sure the node is running with --http and --mine");
            std::process::exit(1);
        }
    };
    let work = rpc.get_work().await.ok().flatten();
    tracing::info!(
        "node OK - block={} mining={} getWork={}",
        block,
        mining,
        if work.is_some() { "available" } else { "NOT AVAILABLE" }
    );
    if work.is_none() {
        tracing::warn!("eth_getWork returned nothing - is mining enabled?");
    }

    tracing::info!("Parallax XHash stratum proxy");
    tracing::info!("  node RPC: {}", opts.rpc_url);
    tracing::info!("  stratum:  {}:{}", opts.host, opts.port);
    tracing::info!("  poll:     {:.1}s", opts.poll);

    let job_manager = Arc::new(JobManager::new(rpc));
    let server = Arc::new(ProxyServer::new(
        opts.host.clone(),
        opts.port,
        opts.poll_interval(),
        job_manager.clone(),
    ));

    if !opts.status_listen.is_empty() {
        spawn_status_api(
            opts.status_listen.clone(),
            ApiState {
                job_manager: job_manager.clone(),
                server: server.clone(),
            },
        );
    }

    tokio::select! {
        res = server.clone().start() => {
            if let Err(e) = res {
                tracing::error!("proxy failed: {:#}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("proxy stopped");
        }
    }
}
