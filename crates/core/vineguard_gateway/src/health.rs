use crate::gateway::Gateway;
use crate::gateway::HealthStatus;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Json;
use axum::Router;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

/// `GET /healthz` answers with the gateway snapshot; every other path is a
/// plain 404. No authentication.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(gateway)
}

async fn healthz(State(gateway): State<Arc<Gateway>>) -> Result<Json<HealthStatus>, StatusCode> {
    gateway.build_health_status().map(Json).map_err(|err| {
        error!(error = %err, "failed to build the health snapshot");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// The HTTP health surface, bound to `0.0.0.0:<port>`.
pub struct HealthServer {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl HealthServer {
    /// Bind and start serving. A port that cannot be bound is a startup
    /// failure for the caller.
    pub async fn start(port: u16, gateway: Arc<Gateway>) -> std::io::Result<HealthServer> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        info!(port, "health endpoint listening");

        let shutdown = CancellationToken::new();
        let app = router(gateway);
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(err) = served {
                error!(error = %err, "health server terminated with an error");
            }
        });

        Ok(HealthServer { shutdown, task })
    }

    /// Stop accepting requests and drain the ones in flight.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WallClock;
    use crate::config::GatewayConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use mqtt_link::CloudLink;
    use mqtt_link::LinkConfig;
    use spool::Spool;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_router() -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = camino::Utf8PathBuf::from_path_buf(dir.path().join("spool.db")).unwrap();
        let spool = Arc::new(Spool::open(&db).unwrap());
        let link = Arc::new(CloudLink::new(&LinkConfig::default(), |_| ()).unwrap());
        let config = GatewayConfig::from_lookup(|_| None).unwrap();
        let (gateway, _connections) =
            Gateway::new(config, Arc::new(WallClock), spool, link).unwrap();
        (router(gateway), dir)
    }

    #[tokio::test]
    async fn healthz_returns_the_snapshot_as_json() {
        let (app, _dir) = test_router();

        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "degraded");
        assert_eq!(value["mqttConnected"], false);
        assert_eq!(value["queuedMessages"], 0);
        assert_eq!(value["lastMessageReceived"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn any_other_path_is_not_found() {
        let (app, _dir) = test_router();

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
