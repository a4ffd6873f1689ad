use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stream_core::config::{MjpegConfig, RtspConfig};
use stream_core::decoder::{DecoderRegistry, FrameConsumer};
use stream_core::events::{EventBus, PipelineEvent};
use stream_core::rtsp::{MediaDescription, RtspSession, SessionState};
use stream_core::stream::{DirectoryEncoder, JpegEncoder, MjpegCallback, MjpegPushServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct ReplayCallback {
    dir: PathBuf,
    released: AtomicUsize,
}

impl MjpegCallback for ReplayCallback {
    fn on_accept(&self, _peer: SocketAddr) -> bool {
        true
    }

    fn on_closed(&self, _peer: SocketAddr) {}

    fn create_encoder(&self) -> Option<Box<dyn JpegEncoder>> {
        Some(Box::new(DirectoryEncoder::new(self.dir.clone(), 50)))
    }

    fn release_encoder(&self, _encoder: Box<dyn JpegEncoder>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn mjpeg_directory_stream_over_http() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("frame.jpg"), [0xff, 0xd8, 0x42, 0xff, 0xd9]).unwrap();

    let callback = Arc::new(ReplayCallback {
        dir: dir.path().to_path_buf(),
        released: AtomicUsize::new(0),
    });
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let server = MjpegPushServer::new(
        MjpegConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            path: "live/cam".to_string(),
            ..Default::default()
        },
        callback.clone(),
        Some(events),
    );
    server.start().await.unwrap();
    let url = server.url().unwrap();
    assert!(url.ends_with("/live/cam"));

    let mut response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);

    let mut body = Vec::new();
    while !body.windows(2).any(|w| w == [0xff, 0xd9]) {
        let chunk = response.chunk().await.unwrap().unwrap();
        body.extend_from_slice(&chunk);
    }
    let text = String::from_utf8_lossy(&body);
    assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 5\r\n"));

    drop(response);
    for _ in 0..100 {
        if callback.released.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(callback.released.load(Ordering::SeqCst), 1);
    assert_eq!(server.hub().client_count(), 0);

    let mut saw_created = false;
    let mut saw_released = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            PipelineEvent::EncoderCreated => saw_created = true,
            PipelineEvent::EncoderReleased => saw_released = true,
            _ => {}
        }
    }
    assert!(saw_created && saw_released);

    server.stop().await;
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn rtsp_session_retries_on_server_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let accepted = connections.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&buf[..pos]).to_string();
                        let cseq = head
                            .lines()
                            .find_map(|l| {
                                let (k, v) = l.split_once(':')?;
                                k.eq_ignore_ascii_case("cseq").then(|| v.trim().to_string())
                            })
                            .unwrap_or_default();
                        let reply = format!(
                            "RTSP/1.0 500 Internal Server Error\r\nCSeq: {}\r\nContent-Length: 0\r\n\r\n",
                            cseq
                        );
                        let _ = stream.write_all(reply.as_bytes()).await;
                        return;
                    }
                }
            });
        }
    });

    let events = EventBus::new();
    let mut rx = events.subscribe();
    let consumers = |_media: &MediaDescription| -> Option<Box<dyn FrameConsumer>> { None };
    let session = RtspSession::new(
        format!("rtsp://{}/stream", addr),
        RtspConfig {
            retry_backoff_ms: 10,
            connect_timeout_ms: 2000,
            ..Default::default()
        },
        DecoderRegistry::with_passthrough(),
        Arc::new(consumers),
    )
    .with_event_bus(events);

    session.start();
    let state = tokio::time::timeout(Duration::from_secs(10), session.wait())
        .await
        .unwrap();
    assert_eq!(state, SessionState::Failed);
    assert_eq!(connections.load(Ordering::SeqCst), 4);

    let mut attempts = Vec::new();
    let mut errors = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            PipelineEvent::SessionReconnecting { attempt, .. } => attempts.push(attempt),
            PipelineEvent::ComponentError { .. } => errors += 1,
            _ => {}
        }
    }
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(errors, 1);
}
