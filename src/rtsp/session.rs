//! RTSP playback session
//!
//! Connects to a server, negotiates every track a registered decoder factory
//! understands, runs one `DecodeLoop` per track and routes interleaved RTP to
//! it by channel. Server errors (5xx) are retried with linear backoff; any
//! other failure ends the session. A decode loop that fails is rebuilt from
//! its factory, up to `MAX_DECODER_RESTARTS` times per connection.

use parking_lot::Mutex;
use rtsp_types as rtsp;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::client::{parse_interleaved_channels, Incoming, RtspConnection, RtspUrl};
use super::sdp::{parse_sdp, resolve_control, MediaDescription, MediaKind};
use crate::config::RtspConfig;
use crate::decoder::{
    DecodeLoop, DecodeLoopOptions, DecoderFactory, DecoderRegistry, ErrorCallback, FrameConsumer,
};
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::rtp::{parse_packet, Depacketizer};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Negotiated,
    Streaming,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Negotiated => "negotiated",
            Self::Streaming => "streaming",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Supplies the consumer for each negotiated track
pub trait ConsumerFactory: Send + Sync {
    /// `None` skips the track
    fn create_consumer(&self, media: &MediaDescription) -> Option<Box<dyn FrameConsumer>>;
}

impl<F> ConsumerFactory for F
where
    F: Fn(&MediaDescription) -> Option<Box<dyn FrameConsumer>> + Send + Sync,
{
    fn create_consumer(&self, media: &MediaDescription) -> Option<Box<dyn FrameConsumer>> {
        self(media)
    }
}

/// Called once when the session ends in `Failed`
pub type SessionErrorCallback = Arc<dyn Fn(&PipelineError) + Send + Sync>;

/// Decode loop rebuilds allowed per track and connection
pub const MAX_DECODER_RESTARTS: u32 = 3;

/// A decode loop reported a fatal error: (track index, message)
type DecodeFailure = (usize, String);

struct Track {
    media: MediaDescription,
    factory: Arc<dyn DecoderFactory>,
    rtp_channel: u8,
    rtcp_channel: u8,
    depacketizer: Box<dyn Depacketizer>,
    decode: Arc<DecodeLoop>,
    restarts: u32,
}

/// State shared between the handle and the session task
struct Inner {
    url: String,
    config: RtspConfig,
    registry: DecoderRegistry,
    consumers: Arc<dyn ConsumerFactory>,
    events: Option<EventBus>,
    on_error: Option<SessionErrorCallback>,
    state_tx: watch::Sender<SessionState>,
    muted: AtomicBool,
    audio_loops: Mutex<Vec<Arc<DecodeLoop>>>,
    bytes_received: Arc<AtomicU64>,
    throttler: LogThrottler,
}

impl Inner {
    fn set_state(&self, state: SessionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!("RTSP session {} -> {}", self.url, state);
            self.publish(PipelineEvent::SessionStateChanged {
                url: self.url.clone(),
                state: state.to_string(),
            });
        }
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

/// Handle to an RTSP playback session
pub struct RtspSession {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RtspSession {
    pub fn new(
        url: impl Into<String>,
        config: RtspConfig,
        registry: DecoderRegistry,
        consumers: Arc<dyn ConsumerFactory>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                registry,
                consumers,
                events: None,
                on_error: None,
                state_tx,
                muted: AtomicBool::new(false),
                audio_loops: Mutex::new(Vec::new()),
                bytes_received: Arc::new(AtomicU64::new(0)),
                throttler: LogThrottler::default(),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Publish state changes and errors on `events`. Set before `start`.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.events = Some(events);
        }
        self
    }

    pub fn with_error_callback(mut self, callback: SessionErrorCallback) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.on_error = Some(callback);
        }
        self
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Bytes read from the RTSP connection, across reconnects
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// Mute audio tracks. Video is unaffected.
    pub fn set_muted(&self, muted: bool) {
        if self.inner.muted.swap(muted, Ordering::SeqCst) == muted {
            return;
        }
        for decode in self.inner.audio_loops.lock().iter() {
            decode.set_muted(muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    /// Spawn the session task on the current runtime
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(run_session(inner, cancel)));
    }

    /// Tear the session down (TEARDOWN, decode loops joined)
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("RTSP session task ended abnormally: {}", e);
            }
        }
    }

    /// Wait until the session reaches `Failed` or `Disconnected` after running
    pub async fn wait(&self) -> SessionState {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.state()
    }
}

impl Drop for RtspSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_session(inner: Arc<Inner>, cancel: CancellationToken) {
    let backoff = Duration::from_millis(inner.config.retry_backoff_ms);
    let mut attempt: u32 = 0;

    loop {
        inner.set_state(SessionState::Connecting);
        let mut streamed = false;
        let result = connect_and_stream(&inner, &cancel, &mut streamed).await;
        if streamed {
            attempt = 0;
        }

        let err = match result {
            Ok(()) => {
                inner.set_state(SessionState::Disconnected);
                return;
            }
            Err(_) if cancel.is_cancelled() => {
                inner.set_state(SessionState::Disconnected);
                return;
            }
            Err(e) => e,
        };

        if err.is_retryable() && attempt < inner.config.max_retries {
            attempt += 1;
            let delay = backoff * attempt;
            warn!(
                "RTSP {} failed ({}), reconnect {}/{} in {:?}",
                inner.url, err, attempt, inner.config.max_retries, delay
            );
            inner.publish(PipelineEvent::SessionReconnecting {
                url: inner.url.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            inner.set_state(SessionState::Disconnected);
            tokio::select! {
                _ = tokio::time::sleep(delay) => continue,
                _ = cancel.cancelled() => return,
            }
        }

        error!("RTSP session {} failed: {}", inner.url, err);
        inner.set_state(SessionState::Failed);
        inner.publish(PipelineEvent::component_error("rtsp", err.to_string()));
        if let Some(callback) = &inner.on_error {
            callback(&err);
        }
        return;
    }
}

/// One connection: negotiate, stream until cancelled or failed, tear down
async fn connect_and_stream(
    inner: &Arc<Inner>,
    cancel: &CancellationToken,
    streamed: &mut bool,
) -> Result<()> {
    let url = RtspUrl::parse(&inner.url)?;
    let timeout = Duration::from_millis(inner.config.connect_timeout_ms);
    let mut tracks = Vec::new();
    let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();

    let result = tokio::select! {
        r = negotiate(inner, url, timeout, &mut tracks, &failures_tx) => r,
        _ = cancel.cancelled() => Err(PipelineError::Interrupted),
    };

    // Streaming starts with the first routed packet, not with PLAY
    let result = match result {
        Ok(mut conn) => {
            let mut link = TrackLink {
                tracks: &mut tracks,
                failures_tx: &failures_tx,
                failures_rx: &mut failures_rx,
                streamed,
            };
            stream(inner, &mut conn, &mut link, cancel).await
        }
        Err(e) => Err(e),
    };

    shutdown_tracks(inner, tracks).await;
    result
}

/// OPTIONS, DESCRIBE, SETUP per track, PLAY
async fn negotiate(
    inner: &Arc<Inner>,
    url: RtspUrl,
    timeout: Duration,
    tracks: &mut Vec<Track>,
    failures_tx: &mpsc::UnboundedSender<DecodeFailure>,
) -> Result<RtspConnection> {
    let request_url = url.url.clone();
    let mut conn = RtspConnection::connect(
        url,
        &inner.config.user_agent,
        timeout,
        inner.bytes_received.clone(),
    )
    .await?;

    conn.request(rtsp::Method::Options, &request_url, Vec::new())
        .await?;

    let describe = conn
        .request(
            rtsp::Method::Describe,
            &request_url,
            vec![("Accept".to_string(), "application/sdp".to_string())],
        )
        .await?;
    let base = describe
        .header("content-base")
        .or_else(|| describe.header("content-location"))
        .unwrap_or(&request_url)
        .to_string();
    let sdp = parse_sdp(&describe.body)?;
    debug!("SDP announces {} tracks", sdp.medias.len());

    let mut next_channel: u8 = 0;
    for media in &sdp.medias {
        let Some(factory) = inner.registry.find(media) else {
            debug!("No decoder for {} track '{}', skipping", media.kind, media.encoding);
            continue;
        };
        let Some(consumer) = inner.consumers.create_consumer(media) else {
            debug!("No consumer for {} track, skipping", media.kind);
            continue;
        };

        let transport = format!(
            "RTP/AVP/TCP;unicast;interleaved={}-{}",
            next_channel,
            next_channel + 1
        );
        let setup = conn
            .request(
                rtsp::Method::Setup,
                &media.control_url(&base),
                vec![("Transport".to_string(), transport)],
            )
            .await?;
        let (rtp_channel, rtcp_channel) = setup
            .header("transport")
            .and_then(parse_interleaved_channels)
            .unwrap_or((next_channel, next_channel + 1));
        next_channel = next_channel.saturating_add(2);

        let (depacketizer, decode) = spawn_decode_loop(
            inner,
            media,
            factory.as_ref(),
            consumer,
            rtp_channel,
            tracks.len(),
            failures_tx,
        )?;
        if media.kind == MediaKind::Audio {
            inner.audio_loops.lock().push(decode.clone());
        }

        info!(
            "Negotiated {} track {} on channel {}",
            media.kind, media.encoding, rtp_channel
        );
        inner.publish(PipelineEvent::TrackNegotiated {
            media: media.kind.to_string(),
            encoding: media.encoding.clone(),
            channel: rtp_channel,
        });
        tracks.push(Track {
            media: media.clone(),
            factory,
            rtp_channel,
            rtcp_channel,
            depacketizer,
            decode,
            restarts: 0,
        });
    }

    if tracks.is_empty() {
        return Err(PipelineError::Sdp(format!(
            "no supported tracks (decoders: {})",
            inner.registry.encodings().join(", ")
        )));
    }
    inner.set_state(SessionState::Negotiated);

    let play_url = resolve_control(&base, sdp.control.as_deref());
    conn.request(
        rtsp::Method::Play,
        &play_url,
        vec![("Range".to_string(), "npt=0.000-".to_string())],
    )
    .await?;
    Ok(conn)
}

/// Create a track's decoder and depacketizer and start its loop. The loop
/// reports a fatal error back to the session as `(index, message)`.
fn spawn_decode_loop(
    inner: &Inner,
    media: &MediaDescription,
    factory: &dyn DecoderFactory,
    consumer: Box<dyn FrameConsumer>,
    rtp_channel: u8,
    index: usize,
    failures_tx: &mpsc::UnboundedSender<DecodeFailure>,
) -> Result<(Box<dyn Depacketizer>, Arc<DecodeLoop>)> {
    let track = factory.create(media)?;
    let failures = failures_tx.clone();
    let on_error: ErrorCallback = Arc::new(move |e: &PipelineError| {
        let _ = failures.send((index, e.to_string()));
    });
    let options = DecodeLoopOptions {
        name: format!("decode-{}-{}", media.kind, rtp_channel),
        queue_capacity: inner.config.queue_capacity,
        encoding: media.encoding.clone(),
        events: inner.events.clone(),
        on_error: Some(on_error),
        ..Default::default()
    };
    let decode = Arc::new(DecodeLoop::spawn(
        track.decoder,
        consumer,
        track.initial_config,
        options,
    )?);
    if media.kind == MediaKind::Audio {
        decode.set_muted(inner.muted.load(Ordering::SeqCst));
    }
    Ok((track.depacketizer, decode))
}

/// Tracks of one connection plus the channel their loops report failures on
struct TrackLink<'a> {
    tracks: &'a mut Vec<Track>,
    failures_tx: &'a mpsc::UnboundedSender<DecodeFailure>,
    failures_rx: &'a mut mpsc::UnboundedReceiver<DecodeFailure>,
    streamed: &'a mut bool,
}

/// Replace a failed decode loop with a fresh decoder, depacketizer and
/// consumer. Fails once the track used up its restarts.
async fn restart_track(
    inner: &Arc<Inner>,
    link: &mut TrackLink<'_>,
    index: usize,
    reason: String,
) -> Result<()> {
    let Some(track) = link.tracks.get_mut(index) else {
        return Ok(());
    };
    if track.restarts >= MAX_DECODER_RESTARTS {
        return Err(PipelineError::Decoder(format!(
            "{} track {} failed {} times, last: {}",
            track.media.kind,
            track.media.encoding,
            track.restarts + 1,
            reason
        )));
    }
    track.restarts += 1;
    warn!(
        "{} decode loop failed ({}), restart {}/{}",
        track.media.kind, reason, track.restarts, MAX_DECODER_RESTARTS
    );

    let Some(consumer) = inner.consumers.create_consumer(&track.media) else {
        return Err(PipelineError::Decoder(format!(
            "no consumer to restart {} track: {}",
            track.media.kind, reason
        )));
    };
    let (depacketizer, decode) = spawn_decode_loop(
        inner,
        &track.media,
        track.factory.as_ref(),
        consumer,
        track.rtp_channel,
        index,
        link.failures_tx,
    )?;

    let old = std::mem::replace(&mut track.decode, decode.clone());
    track.depacketizer = depacketizer;
    if track.media.kind == MediaKind::Audio {
        let mut audio = inner.audio_loops.lock();
        audio.retain(|l| !Arc::ptr_eq(l, &old));
        audio.push(decode);
    }
    let stopped = tokio::task::spawn_blocking(move || old.stop()).await;
    if let Err(e) = stopped {
        warn!("Failed decode loop shutdown panicked: {}", e);
    }
    Ok(())
}

/// Read loop: route interleaved packets, rebuild failed decode loops, keep
/// the session alive
async fn stream(
    inner: &Arc<Inner>,
    conn: &mut RtspConnection,
    link: &mut TrackLink<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    let tracks = &*link.tracks;
    let routes: HashMap<u8, usize> = tracks
        .iter()
        .enumerate()
        .map(|(i, track)| (track.rtp_channel, i))
        .collect();
    let rtcp: HashMap<u8, usize> = tracks
        .iter()
        .enumerate()
        .map(|(i, track)| (track.rtcp_channel, i))
        .collect();

    let keepalive_period = conn
        .session()
        .map(|s| s.timeout / 2)
        .unwrap_or(Duration::from_secs(30))
        .max(Duration::from_secs(1));
    let mut keepalive = interval_at(Instant::now() + keepalive_period, keepalive_period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let base_url = conn.url().url.clone();

    loop {
        tokio::select! {
            message = conn.read_message() => match message? {
                Incoming::Interleaved { channel, data } => {
                    if let Some(&index) = routes.get(&channel) {
                        if route_rtp(inner, &mut link.tracks[index], &data) && !*link.streamed {
                            *link.streamed = true;
                            inner.set_state(SessionState::Streaming);
                        }
                    } else if rtcp.contains_key(&channel) {
                        trace!("RTCP on channel {} ({} bytes)", channel, data.len());
                    } else {
                        trace!("Dropping data on unknown channel {}", channel);
                    }
                }
                Incoming::Response(response) => {
                    if !response.is_success() {
                        warn!("RTSP keep-alive answered {} {}", response.status, response.reason);
                    }
                }
                Incoming::Request(method) => debug!("Ignoring server request {}", method),
            },
            Some((index, reason)) = link.failures_rx.recv() => {
                restart_track(inner, link, index, reason).await?;
            }
            _ = keepalive.tick() => {
                conn.send_request(rtsp::Method::GetParameter, &base_url, Vec::new()).await?;
            }
            _ = cancel.cancelled() => {
                let teardown = conn.send_request(rtsp::Method::Teardown, &base_url, Vec::new());
                match tokio::time::timeout(Duration::from_millis(500), teardown).await {
                    Ok(Ok(_)) => debug!("TEARDOWN sent to {}", base_url),
                    Ok(Err(e)) => debug!("TEARDOWN failed: {}", e),
                    Err(_) => debug!("TEARDOWN timed out"),
                }
                return Ok(());
            }
        }
    }
}

/// `true` when the packet reached a live decode loop's depacketizer
fn route_rtp(inner: &Inner, track: &mut Track, data: &[u8]) -> bool {
    if track.decode.is_finished() {
        return false;
    }
    let packet = match parse_packet(data) {
        Ok(packet) => packet,
        Err(e) => {
            warn_throttled!(inner.throttler, "bad_rtp", "Dropping RTP packet: {}", e);
            return false;
        }
    };
    for frame in track.depacketizer.depacketize(&packet) {
        track.decode.submit(frame);
    }
    true
}

async fn shutdown_tracks(inner: &Arc<Inner>, tracks: Vec<Track>) {
    if tracks.is_empty() {
        return;
    }
    inner.audio_loops.lock().clear();
    let loops: Vec<(MediaKind, Arc<DecodeLoop>)> = tracks
        .into_iter()
        .map(|track| (track.media.kind, track.decode))
        .collect();
    let joined = tokio::task::spawn_blocking(move || {
        for (kind, decode) in loops {
            debug!("Stopping {} decode loop {}", kind, decode.name());
            decode.stop();
        }
    })
    .await;
    if let Err(e) = joined {
        warn!("Decode loop shutdown panicked: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecodedFrame;
    use crate::rtsp::sdp::tests::CAMERA_SDP;
    use bytes::Bytes;
    use rtp::header::Header;
    use rtp::packet::Packet;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use webrtc::util::Marshal;

    fn fast_config() -> RtspConfig {
        RtspConfig {
            retry_backoff_ms: 20,
            connect_timeout_ms: 2000,
            ..Default::default()
        }
    }

    /// Read one request; returns (method, cseq)
    async fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<(String, String)> {
        loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head: Vec<u8> = buf.drain(..pos + 4).collect();
                let text = String::from_utf8_lossy(&head).to_string();
                let method = text.split_whitespace().next()?.to_string();
                let cseq = text
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("cseq").then(|| v.trim().to_string())
                    })
                    .unwrap_or_default();
                return Some((method, cseq));
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn respond(stream: &mut TcpStream, status: &str, cseq: &str, extra: &str, body: &str) {
        let msg = format!(
            "RTSP/1.0 {}\r\nCSeq: {}\r\n{}Content-Length: {}\r\n\r\n{}",
            status,
            cseq,
            extra,
            body.len(),
            body
        );
        let _ = stream.write_all(msg.as_bytes()).await;
    }

    fn interleaved(channel: u8, seq: u16, payload: Vec<u8>) -> Vec<u8> {
        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 9000,
                ..Default::default()
            },
            payload: Bytes::from(payload),
        };
        let data = packet.marshal().unwrap();
        let mut out = vec![b'$', channel];
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(&data);
        out
    }

    struct Collect(Arc<Mutex<Vec<Bytes>>>);

    impl FrameConsumer for Collect {
        fn on_frame(&mut self, frame: &DecodedFrame) -> Result<()> {
            self.0.lock().push(frame.data.clone());
            Ok(())
        }
    }

    fn consumers(
        video: Arc<Mutex<Vec<Bytes>>>,
        audio: Arc<Mutex<Vec<Bytes>>>,
    ) -> Arc<dyn ConsumerFactory> {
        Arc::new(move |media: &MediaDescription| -> Option<Box<dyn FrameConsumer>> {
            let sink = match media.kind {
                MediaKind::Video => video.clone(),
                MediaKind::Audio => audio.clone(),
            };
            Some(Box::new(Collect(sink)))
        })
    }

    fn no_consumers() -> Arc<dyn ConsumerFactory> {
        consumers(Arc::default(), Arc::default())
    }

    fn error_counter() -> (Arc<AtomicUsize>, SessionErrorCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Arc::new(move |_e: &PipelineError| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn server_errors_retry_three_times_then_fail() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let conns = connections.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                conns.fetch_add(1, Ordering::SeqCst);
                let mut buf = Vec::new();
                if let Some((_, cseq)) = read_request(&mut stream, &mut buf).await {
                    respond(&mut stream, "503 Service Unavailable", &cseq, "", "").await;
                }
            }
        });

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let (errors, on_error) = error_counter();
        let session = RtspSession::new(
            format!("rtsp://{}/live", addr),
            fast_config(),
            DecoderRegistry::with_passthrough(),
            no_consumers(),
        )
        .with_event_bus(events)
        .with_error_callback(on_error);

        session.start();
        let state = tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();
        assert_eq!(state, SessionState::Failed);
        assert_eq!(connections.load(Ordering::SeqCst), 4);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let mut delays = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::SessionReconnecting { delay_ms, .. } = event {
                delays.push(delay_ms);
            }
        }
        assert_eq!(delays, vec![20, 40, 60]);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let conns = connections.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                conns.fetch_add(1, Ordering::SeqCst);
                let mut buf = Vec::new();
                if let Some((_, cseq)) = read_request(&mut stream, &mut buf).await {
                    respond(&mut stream, "404 Not Found", &cseq, "", "").await;
                }
            }
        });

        let (errors, on_error) = error_counter();
        let session = RtspSession::new(
            format!("rtsp://{}/missing", addr),
            fast_config(),
            DecoderRegistry::with_passthrough(),
            no_consumers(),
        )
        .with_error_callback(on_error);
        session.start();
        let state = tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();

        assert_eq!(state, SessionState::Failed);
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    /// Serve one connection announcing `CAMERA_SDP`; `rtp` follows the PLAY
    /// response after `delay`. Returns the methods received.
    fn spawn_camera(listener: TcpListener, delay: Duration, rtp: Vec<u8>) -> Arc<Mutex<Vec<String>>> {
        let methods = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = methods.clone();
        tokio::spawn(async move {
            let addr = listener.local_addr().unwrap();
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut setups = 0;
            let mut rtp = Some(rtp);
            while let Some((method, cseq)) = read_request(&mut stream, &mut buf).await {
                seen.lock().push(method.clone());
                match method.as_str() {
                    "DESCRIBE" => {
                        let base = format!("Content-Base: rtsp://{}/live/\r\n", addr);
                        respond(&mut stream, "200 OK", &cseq, &base, CAMERA_SDP).await;
                    }
                    "SETUP" => {
                        let extra = format!(
                            "Session: feed;timeout=60\r\nTransport: RTP/AVP/TCP;unicast;interleaved={}-{}\r\n",
                            setups * 2,
                            setups * 2 + 1
                        );
                        setups += 1;
                        respond(&mut stream, "200 OK", &cseq, &extra, "").await;
                    }
                    "PLAY" => {
                        respond(&mut stream, "200 OK", &cseq, "Session: feed\r\n", "").await;
                        tokio::time::sleep(delay).await;
                        if let Some(data) = rtp.take() {
                            let _ = stream.write_all(&data).await;
                        }
                    }
                    "TEARDOWN" => {
                        respond(&mut stream, "200 OK", &cseq, "", "").await;
                        break;
                    }
                    _ => respond(&mut stream, "200 OK", &cseq, "", "").await,
                }
            }
        });
        methods
    }

    #[tokio::test]
    async fn negotiates_routes_and_tears_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut data = interleaved(0, 1, vec![0x65, 0xaa, 0xbb]);
        // AAC: one 2-byte access unit
        data.extend(interleaved(2, 1, vec![0x00, 0x10, 0x00, 0x10, 0x11, 0x22]));
        data.extend(interleaved(9, 1, vec![0x65, 0x00]));
        let methods = spawn_camera(listener, Duration::ZERO, data);

        let video = Arc::new(Mutex::new(Vec::new()));
        let audio = Arc::new(Mutex::new(Vec::new()));
        let session = RtspSession::new(
            format!("rtsp://{}/live", addr),
            fast_config(),
            DecoderRegistry::with_passthrough(),
            consumers(video.clone(), audio.clone()),
        );
        session.set_muted(true);
        let mut state_rx = session.subscribe_state();
        session.start();

        tokio::time::timeout(
            Duration::from_secs(5),
            state_rx.wait_for(|s| *s == SessionState::Streaming),
        )
        .await
        .unwrap()
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while video.lock().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        session.stop().await;

        // sprop config first, then the IDR slice
        let frames = video.lock().clone();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1][..], &[0, 0, 0, 1, 0x65, 0xaa, 0xbb]);
        // Audio track negotiated but muted
        assert!(audio.lock().is_empty());
        assert!(session.bytes_received() > 0);
        assert_eq!(session.state(), SessionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *methods.lock(),
            vec!["OPTIONS", "DESCRIBE", "SETUP", "SETUP", "PLAY", "TEARDOWN"]
        );
    }

    #[tokio::test]
    async fn streaming_waits_for_first_routed_packet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn_camera(
            listener,
            Duration::from_millis(300),
            interleaved(0, 1, vec![0x65, 0x01]),
        );

        let session = RtspSession::new(
            format!("rtsp://{}/live", addr),
            fast_config(),
            DecoderRegistry::with_passthrough(),
            no_consumers(),
        );
        let mut state_rx = session.subscribe_state();
        session.start();

        tokio::time::timeout(
            Duration::from_secs(5),
            state_rx.wait_for(|s| *s == SessionState::Negotiated),
        )
        .await
        .unwrap()
        .unwrap();
        // PLAY answered, no RTP yet
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state(), SessionState::Negotiated);

        tokio::time::timeout(
            Duration::from_secs(5),
            state_rx.wait_for(|s| *s == SessionState::Streaming),
        )
        .await
        .unwrap()
        .unwrap();
        session.stop().await;
    }

    /// Fails on its first buffer when `fail` is set, otherwise collects
    struct Flaky {
        fail: bool,
        frames: Arc<Mutex<Vec<Bytes>>>,
    }

    impl FrameConsumer for Flaky {
        fn on_frame(&mut self, frame: &DecodedFrame) -> Result<()> {
            if self.fail {
                return Err(PipelineError::Render("display gone".to_string()));
            }
            self.frames.lock().push(frame.data.clone());
            Ok(())
        }
    }

    /// Video-only consumers; the first `failing` created ones fail
    fn flaky_video(
        failing: usize,
        frames: Arc<Mutex<Vec<Bytes>>>,
    ) -> (Arc<AtomicUsize>, Arc<dyn ConsumerFactory>) {
        let created = Arc::new(AtomicUsize::new(0));
        let count = created.clone();
        let factory = Arc::new(move |media: &MediaDescription| -> Option<Box<dyn FrameConsumer>> {
            if media.kind != MediaKind::Video {
                return None;
            }
            let n = count.fetch_add(1, Ordering::SeqCst);
            Some(Box::new(Flaky {
                fail: n < failing,
                frames: frames.clone(),
            }))
        });
        (created, factory)
    }

    #[tokio::test]
    async fn failed_decode_loop_is_rebuilt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn_camera(
            listener,
            Duration::from_millis(300),
            interleaved(0, 1, vec![0x65, 0xaa, 0xbb]),
        );

        let frames = Arc::new(Mutex::new(Vec::new()));
        let (created, factory) = flaky_video(1, frames.clone());
        let (errors, on_error) = error_counter();
        let session = RtspSession::new(
            format!("rtsp://{}/live", addr),
            fast_config(),
            DecoderRegistry::with_passthrough(),
            factory,
        )
        .with_error_callback(on_error);
        let mut state_rx = session.subscribe_state();
        session.start();

        tokio::time::timeout(
            Duration::from_secs(5),
            state_rx.wait_for(|s| *s == SessionState::Streaming),
        )
        .await
        .unwrap()
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while frames.lock().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        session.stop().await;

        // The replacement loop starts from the SDP config again
        assert_eq!(created.load(Ordering::SeqCst), 2);
        let frames = frames.lock().clone();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1][..], &[0, 0, 0, 1, 0x65, 0xaa, 0xbb]);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn decode_loop_failing_past_restarts_fails_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn_camera(listener, Duration::ZERO, Vec::new());

        let (created, factory) = flaky_video(usize::MAX, Arc::default());
        let (errors, on_error) = error_counter();
        let session = RtspSession::new(
            format!("rtsp://{}/live", addr),
            fast_config(),
            DecoderRegistry::with_passthrough(),
            factory,
        )
        .with_error_callback(on_error);
        session.start();

        let state = tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();
        assert_eq!(state, SessionState::Failed);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(
            created.load(Ordering::SeqCst),
            MAX_DECODER_RESTARTS as usize + 1
        );
    }
}
