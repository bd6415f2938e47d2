//! Inbound HTTP(S) surface and the reverse-tunnel request dispatcher.
//!
//! The router is a thin adapter over [`Agent`]; the same routing serves
//! both listeners and the tunnel. HTTP and HTTPS may run concurrently on
//! distinct addresses; HTTPS requires cert and key files.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, put};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use bytes::Bytes;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use waggle_reverse::TunnelRequest;

use crate::core::agent::Agent;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),
}

/// The agent's HTTP surface.
pub fn build_router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/", get(handlers::run))
        .route("/run", get(handlers::run))
        .route("/run/{id}", get(handlers::run_scoped))
        .route("/inventory", get(handlers::inventory))
        .route("/stats", get(handlers::stats))
        .route("/write/{id}", put(handlers::write))
        .with_state(agent)
}

/// Binds and spawns the configured listeners. Bind and TLS-material
/// failures are fatal; the returned handles stop on agent cancellation.
pub async fn spawn_listeners(
    agent: &Arc<Agent>,
) -> Result<Vec<(&'static str, JoinHandle<()>)>, ServerError> {
    let mut handles = Vec::new();
    let app = build_router(agent.clone());
    let cancel = agent.cancel_token();

    let listen = agent.config().server.listen.clone();
    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|source| ServerError::Bind {
            addr: listen.clone(),
            source,
        })?;
    info!(addr = %listen, "http listener bound");
    {
        let app = app.clone();
        let cancel = cancel.clone();
        handles.push((
            "http",
            tokio::spawn(async move {
                let shutdown = async move { cancel.cancelled().await };
                if let Err(err) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!(error = %err, "http listener failed");
                }
            }),
        ));
    }

    if let Some(tls_listen) = agent.config().server.tls_listen.clone() {
        let server = &agent.config().server;
        let (Some(cert), Some(key)) = (server.tls_cert_file.clone(), server.tls_key_file.clone())
        else {
            // unreachable after config validation, but refuse rather than panic
            return Err(ServerError::Tls(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tls listener configured without cert/key",
            )));
        };

        let addr: SocketAddr = tls_listen
            .parse()
            .map_err(|_| ServerError::InvalidAddress(tls_listen.clone()))?;
        let tls_config = RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(ServerError::Tls)?;

        let handle = axum_server::Handle::new();
        {
            let handle = handle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
            });
        }

        info!(addr = %tls_listen, "https listener starting");
        handles.push((
            "https",
            tokio::spawn(async move {
                if let Err(err) = axum_server::bind_rustls(addr, tls_config)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
                {
                    error!(error = %err, "https listener failed");
                }
            }),
        ));
    }

    Ok(handles)
}

/// Drains broker requests from the tunnel and answers them through the
/// same agent surface the HTTP handlers use. Responses travel back over
/// the tunnel tagged with the originating channel id.
pub fn spawn_tunnel_dispatcher(
    agent: Arc<Agent>,
    mut requests_rx: mpsc::Receiver<TunnelRequest>,
    responses_tx: mpsc::Sender<(u32, Bytes)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests_rx.recv().await {
            let payload = dispatch(&agent, &request.target).await;
            if responses_tx.send((request.channel, payload)).await.is_err() {
                break;
            }
        }
        debug!("tunnel dispatcher stopped");
    })
}

/// Maps a tunnel request target onto the agent surface. Failures become a
/// JSON error body, mirroring the HTTP adapter.
async fn dispatch(agent: &Agent, target: &str) -> Bytes {
    match route_target(agent, target).await {
        Ok(payload) => payload,
        Err(message) => Bytes::from(json!({ "error": message }).to_string()),
    }
}

async fn route_target(agent: &Agent, target: &str) -> Result<Bytes, String> {
    let target = target.split('?').next().unwrap_or(target);
    match target {
        "" | "/" | "/run" => {
            let set = agent.run("").await.map_err(|e| e.to_string())?;
            serde_json::to_vec(&set).map(Bytes::from).map_err(|e| e.to_string())
        }
        "/inventory" => serde_json::to_vec(&agent.inventory())
            .map(Bytes::from)
            .map_err(|e| e.to_string()),
        "/stats" => serde_json::to_vec(&agent.stats().snapshot())
            .map(Bytes::from)
            .map_err(|e| e.to_string()),
        scoped => match scoped.strip_prefix("/run/") {
            Some(id) if !id.is_empty() => {
                let set = agent.run(id).await.map_err(|e| e.to_string())?;
                serde_json::to_vec(&set).map(Bytes::from).map_err(|e| e.to_string())
            }
            _ => Err(format!("unknown target: {target}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::util::ServiceExt;

    use super::*;
    use crate::config::agent::PluginsConfig;
    use crate::config::Config;
    use crate::metrics::MetricValue;

    fn test_agent(dir: &std::path::Path) -> Arc<Agent> {
        let config = Config {
            plugins: PluginsConfig {
                dir: dir.to_path_buf(),
                run_timeout_secs: 5,
                term_grace_secs: 1,
            },
            ..Config::default()
        };
        let agent = Arc::new(Agent::new(config));
        agent.scan_plugins().expect("scan must succeed in tests");
        agent
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[cfg(unix)]
    fn plugin_script(dir: &std::path::Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn get_run_returns_the_merged_document() {
        let dir = tempfile::tempdir().unwrap();
        plugin_script(dir.path(), "mem.sh", "printf 'used\\tI\\t42\\n'");
        let agent = test_agent(dir.path());
        let app = build_router(agent);

        let response = app
            .oneshot(Request::get("/run").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["mem`used"]["_type"], "I");
        assert_eq!(json["mem`used"]["_value"], 42);
    }

    #[tokio::test]
    async fn unknown_run_id_is_404_with_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path());
        let app = build_router(agent);

        let response = app
            .oneshot(Request::get("/run/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn inventory_and_stats_respond() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path());
        let app = build_router(agent);

        let response = app
            .clone()
            .oneshot(Request::get("/inventory").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["builtins"]
            .as_array()
            .unwrap()
            .iter()
            .any(|b| b == "loadavg"));

        let response = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["agent"]["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn write_accepts_a_metric_set() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path());
        let app = build_router(agent.clone());

        let body = r#"{"up": {"_type": "L", "_value": 1}}"#;
        let response = app
            .clone()
            .oneshot(
                Request::put("/write/probe")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        assert_eq!(agent.flush("probe")["probe`up"].value, MetricValue::Uint(1));
    }

    #[tokio::test]
    async fn tunnel_dispatch_mirrors_the_http_surface() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path());

        let payload = dispatch(&agent, "/inventory").await;
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert!(json["builtins"].is_array());

        let payload = dispatch(&agent, "/run/ghost").await;
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert!(json["error"].as_str().unwrap().contains("ghost"));

        let payload = dispatch(&agent, "/bogus").await;
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert!(json["error"].as_str().unwrap().contains("unknown target"));
    }
}
