//! MJPEG push server (multipart/x-mixed-replace over HTTP)

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::mjpeg::{create_mjpeg_part, MjpegCallback, MjpegHub};
use crate::config::MjpegConfig;
use crate::error::{PipelineError, Result};
use crate::events::EventBus;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

struct ServerState {
    hub: Arc<MjpegHub>,
    boundary: String,
}

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// HTTP front end of an `MjpegHub`
pub struct MjpegPushServer {
    config: MjpegConfig,
    hub: Arc<MjpegHub>,
    running: Mutex<Option<Running>>,
}

impl MjpegPushServer {
    pub fn new(
        config: MjpegConfig,
        callback: Arc<dyn MjpegCallback>,
        events: Option<EventBus>,
    ) -> Self {
        let hub = MjpegHub::new(callback, config.client_queue_depth, events);
        Self {
            config,
            hub,
            running: Mutex::new(None),
        }
    }

    pub fn hub(&self) -> &Arc<MjpegHub> {
        &self.hub
    }

    /// Broadcast a JPEG to every connected client
    pub fn offer_media(&self, jpeg: Bytes) {
        self.hub.offer_media(jpeg);
    }

    fn stream_path(&self) -> String {
        format!("/{}", self.config.path.trim_matches('/'))
    }

    /// Routes: `GET /{path}` (stream) and `GET /{path}/snapshot`
    pub fn router(&self) -> Result<Router> {
        let server_name = HeaderValue::from_str(&self.config.server_name).map_err(|e| {
            PipelineError::Config(format!("invalid server name '{}': {}", self.config.server_name, e))
        })?;
        if self.config.boundary.is_empty()
            || !self
                .config
                .boundary
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "'()+_,-./:=?".contains(c))
        {
            return Err(PipelineError::Config(format!(
                "invalid multipart boundary '{}'",
                self.config.boundary
            )));
        }

        let state = Arc::new(ServerState {
            hub: self.hub.clone(),
            boundary: self.config.boundary.clone(),
        });
        let path = self.stream_path();
        Ok(Router::new()
            .route(&path, get(mjpeg_stream))
            .route(&format!("{}/snapshot", path.trim_end_matches('/')), get(snapshot))
            .with_state(state)
            .layer(SetResponseHeaderLayer::overriding(header::SERVER, server_name))
            .layer(TraceLayer::new_for_http()))
    }

    /// Bind and serve; returns the bound address. Idempotent.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(running) = self.running.lock().as_ref() {
            return Ok(running.addr);
        }

        let app = self.router()?;
        let listener = TcpListener::bind((self.config.bind_address, self.config.port)).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();

        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
            if let Err(e) = result {
                warn!("MJPEG server error: {}", e);
            }
        });

        info!("MJPEG server listening on http://{}{}", addr, self.stream_path());
        *self.running.lock() = Some(Running { addr, cancel, task });
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }

    /// Stream URL once started
    pub fn url(&self) -> Option<String> {
        self.local_addr()
            .map(|addr| format!("http://{}{}", addr, self.stream_path()))
    }

    /// Disconnect clients, release the encoder and stop listening
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        // Ends every client body so graceful shutdown can complete
        self.hub.shutdown();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, running.task).await {
            Ok(Ok(())) => info!("MJPEG server stopped"),
            Ok(Err(e)) => warn!("MJPEG server task failed: {}", e),
            Err(_) => warn!("MJPEG server did not stop within {:?}", SHUTDOWN_TIMEOUT),
        }
    }
}

/// Multipart stream endpoint
async fn mjpeg_stream(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let mut guard = match state.hub.admit(peer) {
        Ok(guard) => guard,
        Err(e) => return e.into_response(),
    };

    let boundary = state.boundary.clone();
    let body_stream = async_stream::stream! {
        while let Some(jpeg) = guard.recv().await {
            yield Ok::<Bytes, std::io::Error>(create_mjpeg_part(&boundary, &jpeg));
        }
        // Guard is dropped with the stream, which unregisters the client
    };

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={}", state.boundary),
            ),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::CONNECTION, "keep-alive".to_string()),
        ],
        Body::from_stream(body_stream),
    )
        .into_response()
}

/// Single JPEG snapshot
async fn snapshot(State(state): State<Arc<ServerState>>) -> Response {
    match state.hub.last_frame() {
        Some(jpeg) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            jpeg,
        )
            .into_response(),
        None => PipelineError::ServiceUnavailable("no frame available".to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mjpeg::tests::TestCallback;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::Ordering;

    fn config() -> MjpegConfig {
        MjpegConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn streams_parts_and_releases_encoder_on_disconnect() {
        let callback = Arc::new(TestCallback::default());
        let server = MjpegPushServer::new(config(), callback.clone(), None);
        server.start().await.unwrap();
        let url = server.url().unwrap();
        assert!(url.ends_with("/mjpeg"));

        let mut response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert_eq!(response.headers()[reqwest::header::SERVER], "MJPEG");
        assert_eq!(server.hub().client_count(), 1);

        server.offer_media(Bytes::from_static(&[0xff, 0xd8, 0xff, 0xd9]));
        let chunk = response.chunk().await.unwrap().unwrap();
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n"));

        drop(response);
        // Disconnect is noticed on the next send
        for _ in 0..50 {
            server.offer_media(Bytes::from_static(&[0xff, 0xd8, 0xff, 0xd9]));
            if callback.released.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(callback.released.load(Ordering::SeqCst), 1);
        assert_eq!(server.hub().client_count(), 0);

        let snapshot = reqwest::get(format!("{}/snapshot", url)).await.unwrap();
        assert_eq!(snapshot.status(), 200);
        assert_eq!(&snapshot.bytes().await.unwrap()[..], &[0xff, 0xd8, 0xff, 0xd9]);

        server.stop().await;
    }

    #[tokio::test]
    async fn encoder_failure_is_503() {
        let callback = Arc::new(TestCallback::default());
        callback.no_encoder.store(true, Ordering::SeqCst);
        let server = MjpegPushServer::new(config(), callback.clone(), None);
        server.start().await.unwrap();

        let response = reqwest::get(server.url().unwrap()).await.unwrap();
        assert_eq!(response.status(), 503);
        assert_eq!(server.hub().client_count(), 0);

        let snapshot = reqwest::get(format!("{}/snapshot", server.url().unwrap()))
            .await
            .unwrap();
        assert_eq!(snapshot.status(), 503);
        server.stop().await;
    }

    #[test]
    fn rejects_bad_boundary() {
        let server = MjpegPushServer::new(
            MjpegConfig {
                boundary: "bad boundary\r\n".to_string(),
                ..config()
            },
            Arc::new(TestCallback::default()),
            None,
        );
        assert!(server.router().is_err());
    }
}
