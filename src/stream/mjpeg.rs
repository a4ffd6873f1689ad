//! MJPEG client hub
//!
//! Tracks connected HTTP clients and owns the JPEG encoder. The encoder is
//! created lazily when the first client is admitted and released when the last
//! one leaves. Client set and encoder live under one lock so admission and
//! teardown never interleave.

use arc_swap::ArcSwap;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};

/// Client ID type (UUID string)
pub type ClientId = String;

/// Produces JPEG frames once started
pub trait JpegEncoder: Send {
    /// Begin producing frames into `sink`. Must not call `sink.offer` before
    /// returning.
    fn start(&mut self, sink: JpegSink) -> Result<()>;

    /// Stop producing. Called at most once per successful `start`, and also
    /// after a failed `start`.
    fn stop(&mut self);
}

/// Server events and encoder lifecycle hooks
pub trait MjpegCallback: Send + Sync {
    /// Whether to serve this peer
    fn on_accept(&self, peer: SocketAddr) -> bool;

    fn on_closed(&self, peer: SocketAddr);

    /// `None` rejects the connection
    fn create_encoder(&self) -> Option<Box<dyn JpegEncoder>>;

    /// Receives the stopped encoder
    fn release_encoder(&self, encoder: Box<dyn JpegEncoder>);
}

/// Handle given to the encoder for pushing frames
#[derive(Clone)]
pub struct JpegSink {
    hub: Weak<MjpegHub>,
}

impl JpegSink {
    /// Returns `false` once the hub is gone
    pub fn offer(&self, jpeg: Bytes) -> bool {
        match self.hub.upgrade() {
            Some(hub) => {
                hub.offer_media(jpeg);
                true
            }
            None => false,
        }
    }
}

struct ClientEntry {
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    connected_at: Instant,
    frames_queued: u64,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<ClientId, ClientEntry>,
    encoder: Option<Box<dyn JpegEncoder>>,
}

/// Encoder that could not be started; a created one is stopped and released
/// once the state lock is dropped
struct StartFailure {
    error: PipelineError,
    encoder: Option<Box<dyn JpegEncoder>>,
}

/// Why a client left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Disconnected,
    Lagging,
}

/// Client set plus lazily created encoder
pub struct MjpegHub {
    state: Mutex<HubState>,
    callback: Arc<dyn MjpegCallback>,
    /// Latest frame - using ArcSwap for lock-free reads
    last_frame: ArcSwap<Option<Bytes>>,
    queue_depth: usize,
    frames_offered: AtomicU64,
    events: Option<EventBus>,
}

impl MjpegHub {
    pub fn new(
        callback: Arc<dyn MjpegCallback>,
        queue_depth: usize,
        events: Option<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            callback,
            last_frame: ArcSwap::from_pointee(None),
            queue_depth: queue_depth.max(1),
            frames_offered: AtomicU64::new(0),
            events,
        })
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Admit a client, creating and starting the encoder if none is running.
    ///
    /// Rejected peers and encoder failures yield `ServiceUnavailable`.
    pub fn admit(self: &Arc<Self>, peer: SocketAddr) -> Result<ClientGuard> {
        if !self.callback.on_accept(peer) {
            debug!("MJPEG client {} refused by callback", peer);
            return Err(PipelineError::ServiceUnavailable(format!(
                "client {} not accepted",
                peer
            )));
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = uuid::Uuid::new_v4().to_string();
        let clients = {
            let mut state = self.state.lock();
            if state.encoder.is_none() {
                if let Err(failure) = self.start_encoder(&mut state) {
                    drop(state);
                    if let Some(mut encoder) = failure.encoder {
                        encoder.stop();
                        self.callback.release_encoder(encoder);
                    }
                    self.callback.on_closed(peer);
                    return Err(failure.error);
                }
            }
            state.clients.insert(
                id.clone(),
                ClientEntry {
                    peer,
                    tx,
                    connected_at: Instant::now(),
                    frames_queued: 0,
                },
            );
            state.clients.len()
        };

        info!("MJPEG client {} connected (total: {})", peer, clients);
        self.publish(PipelineEvent::MjpegClientConnected {
            peer: peer.to_string(),
            clients,
        });
        Ok(ClientGuard {
            id,
            peer,
            rx,
            hub: self.clone(),
        })
    }

    /// Called with the state lock held and no encoder present. A started
    /// encoder holds the lock until it is installed, so its first frame
    /// reaches the admitted client.
    fn start_encoder(
        self: &Arc<Self>,
        state: &mut HubState,
    ) -> std::result::Result<(), StartFailure> {
        let Some(mut encoder) = self.callback.create_encoder() else {
            warn!("MJPEG encoder could not be created");
            return Err(StartFailure {
                error: PipelineError::ServiceUnavailable("MJPEG encoder unavailable".to_string()),
                encoder: None,
            });
        };

        let sink = JpegSink {
            hub: Arc::downgrade(self),
        };
        if let Err(e) = encoder.start(sink) {
            warn!("MJPEG encoder failed to start: {}", e);
            return Err(StartFailure {
                error: PipelineError::ServiceUnavailable(format!(
                    "MJPEG encoder failed to start: {}",
                    e
                )),
                encoder: Some(encoder),
            });
        }

        info!("MJPEG encoder started");
        state.encoder = Some(encoder);
        self.publish(PipelineEvent::EncoderCreated);
        Ok(())
    }

    fn close_client(&self, id: &str, reason: CloseReason) {
        let (entry, remaining, encoder) = {
            let mut state = self.state.lock();
            let Some(entry) = state.clients.remove(id) else {
                return;
            };
            let remaining = state.clients.len();
            let encoder = if remaining == 0 {
                state.encoder.take()
            } else {
                None
            };
            (entry, remaining, encoder)
        };

        let peer = entry.peer.to_string();
        match reason {
            CloseReason::Lagging => {
                warn!("MJPEG client {} fell behind, dropping it", peer);
                self.publish(PipelineEvent::MjpegClientDropped { peer: peer.clone() });
            }
            CloseReason::Disconnected => info!(
                "MJPEG client {} disconnected after {:.1}s ({} frames)",
                peer,
                entry.connected_at.elapsed().as_secs_f32(),
                entry.frames_queued
            ),
        }
        self.callback.on_closed(entry.peer);
        self.publish(PipelineEvent::MjpegClientDisconnected {
            peer,
            clients: remaining,
        });

        // Stopped outside the lock: the encoder thread may be blocked in offer_media
        if let Some(encoder) = encoder {
            self.release(encoder);
        }
    }

    fn release(&self, mut encoder: Box<dyn JpegEncoder>) {
        encoder.stop();
        self.callback.release_encoder(encoder);
        info!("MJPEG encoder released");
        self.publish(PipelineEvent::EncoderReleased);
    }

    /// Fan a JPEG out to every client. A client whose queue is full is dropped.
    pub fn offer_media(&self, jpeg: Bytes) {
        self.frames_offered.fetch_add(1, Ordering::Relaxed);
        self.last_frame.store(Arc::new(Some(jpeg.clone())));

        let mut lagging = Vec::new();
        let mut gone = Vec::new();
        {
            let mut state = self.state.lock();
            for (id, client) in state.clients.iter_mut() {
                match client.tx.try_send(jpeg.clone()) {
                    Ok(()) => client.frames_queued += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => lagging.push(id.clone()),
                    Err(mpsc::error::TrySendError::Closed(_)) => gone.push(id.clone()),
                }
            }
        }

        for id in lagging {
            self.close_client(&id, CloseReason::Lagging);
        }
        for id in gone {
            self.close_client(&id, CloseReason::Disconnected);
        }
    }

    /// Most recent frame offered, if any
    pub fn last_frame(&self) -> Option<Bytes> {
        (**self.last_frame.load()).clone()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn has_encoder(&self) -> bool {
        self.state.lock().encoder.is_some()
    }

    pub fn frames_offered(&self) -> u64 {
        self.frames_offered.load(Ordering::Relaxed)
    }

    /// Disconnect every client and release the encoder
    pub fn shutdown(&self) {
        let (clients, encoder) = {
            let mut state = self.state.lock();
            let clients: Vec<ClientEntry> = state.clients.drain().map(|(_, c)| c).collect();
            (clients, state.encoder.take())
        };
        if !clients.is_empty() {
            info!("Disconnecting {} MJPEG clients", clients.len());
        }
        for client in clients {
            self.callback.on_closed(client.peer);
            self.publish(PipelineEvent::MjpegClientDisconnected {
                peer: client.peer.to_string(),
                clients: 0,
            });
        }
        if let Some(encoder) = encoder {
            self.release(encoder);
        }
    }
}

/// RAII guard for an admitted client
/// Ensures cleanup even on panic or abrupt disconnection
pub struct ClientGuard {
    id: ClientId,
    peer: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
    hub: Arc<MjpegHub>,
}

impl ClientGuard {
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Next frame for this client; `None` once it has been dropped
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.hub.close_client(&self.id, CloseReason::Disconnected);
    }
}

/// Create MJPEG multipart frame bytes
pub fn create_mjpeg_part(boundary: &str, jpeg_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg_data.len());

    buf.put_slice(b"--");
    buf.put_slice(boundary.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg_data.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(jpeg_data);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Barrier;
    use std::time::Duration;

    /// Encoder that only counts lifecycle calls; frames are offered by the test
    pub(crate) struct CountingEncoder {
        pub(crate) stopped: Arc<AtomicUsize>,
        pub(crate) fail_start: bool,
    }

    impl JpegEncoder for CountingEncoder {
        fn start(&mut self, _sink: JpegSink) -> Result<()> {
            if self.fail_start {
                return Err(PipelineError::Render("no camera".to_string()));
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub(crate) struct TestCallback {
        pub(crate) reject: AtomicBool,
        pub(crate) no_encoder: AtomicBool,
        pub(crate) fail_start: AtomicBool,
        pub(crate) accepted: AtomicUsize,
        pub(crate) closed: AtomicUsize,
        pub(crate) created: AtomicUsize,
        pub(crate) released: AtomicUsize,
        pub(crate) stopped: Arc<AtomicUsize>,
    }

    impl MjpegCallback for TestCallback {
        fn on_accept(&self, _peer: SocketAddr) -> bool {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            !self.reject.load(Ordering::SeqCst)
        }

        fn on_closed(&self, _peer: SocketAddr) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn create_encoder(&self) -> Option<Box<dyn JpegEncoder>> {
            if self.no_encoder.load(Ordering::SeqCst) {
                return None;
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Some(Box::new(CountingEncoder {
                stopped: self.stopped.clone(),
                fail_start: self.fail_start.load(Ordering::SeqCst),
            }))
        }

        fn release_encoder(&self, _encoder: Box<dyn JpegEncoder>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn encoder_follows_client_set() {
        let callback = Arc::new(TestCallback::default());
        let hub = MjpegHub::new(callback.clone(), 4, None);

        let mut a = hub.admit(peer(1)).unwrap();
        let b = hub.admit(peer(2)).unwrap();
        assert_eq!(callback.created.load(Ordering::SeqCst), 1);
        assert!(hub.has_encoder());

        hub.offer_media(Bytes::from_static(b"jpeg1"));
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"jpeg1"));

        drop(b);
        assert!(hub.has_encoder());
        drop(a);
        assert!(!hub.has_encoder());
        assert_eq!(callback.released.load(Ordering::SeqCst), 1);
        assert_eq!(callback.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(callback.closed.load(Ordering::SeqCst), 2);

        // Next client gets a fresh encoder
        let _c = hub.admit(peer(3)).unwrap();
        assert_eq!(callback.created.load(Ordering::SeqCst), 2);
        assert_eq!(hub.last_frame().unwrap(), Bytes::from_static(b"jpeg1"));
    }

    #[test]
    fn rejected_and_failed_admissions() {
        let callback = Arc::new(TestCallback::default());
        let hub = MjpegHub::new(callback.clone(), 4, None);

        callback.reject.store(true, Ordering::SeqCst);
        assert!(hub.admit(peer(1)).is_err());
        callback.reject.store(false, Ordering::SeqCst);

        callback.no_encoder.store(true, Ordering::SeqCst);
        assert!(matches!(
            hub.admit(peer(2)),
            Err(PipelineError::ServiceUnavailable(_))
        ));
        callback.no_encoder.store(false, Ordering::SeqCst);

        callback.fail_start.store(true, Ordering::SeqCst);
        assert!(hub.admit(peer(3)).is_err());
        // Partially started encoder is still stopped and handed back
        assert_eq!(callback.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(callback.released.load(Ordering::SeqCst), 1);
        assert_eq!(hub.client_count(), 0);
        assert!(!hub.has_encoder());
    }

    #[test]
    fn slow_client_is_dropped_alone() {
        let callback = Arc::new(TestCallback::default());
        let hub = MjpegHub::new(callback.clone(), 2, None);
        let mut slow = hub.admit(peer(1)).unwrap();
        let mut fast = hub.admit(peer(2)).unwrap();

        for i in 0..2u8 {
            hub.offer_media(Bytes::from(vec![i]));
            assert_eq!(fast.rx.try_recv().unwrap(), Bytes::from(vec![i]));
        }
        hub.offer_media(Bytes::from_static(b"x"));

        assert_eq!(hub.client_count(), 1);
        assert!(hub.has_encoder());
        assert_eq!(fast.rx.try_recv().unwrap(), Bytes::from_static(b"x"));
        // Slow client drains what it had, then sees the end
        assert!(slow.rx.try_recv().is_ok());
        assert!(slow.rx.try_recv().is_ok());
        assert!(matches!(
            slow.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        drop(slow);
        assert_eq!(callback.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn churn_keeps_one_encoder() {
        let callback = Arc::new(TestCallback::default());
        let hub = MjpegHub::new(callback.clone(), 4, None);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let hub = hub.clone();
                std::thread::spawn(move || {
                    for i in 0..50u16 {
                        let guard = hub.admit(peer(t * 100 + i)).unwrap();
                        hub.offer_media(Bytes::from_static(b"f"));
                        drop(guard);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(hub.client_count(), 0);
        assert!(!hub.has_encoder());
        let created = callback.created.load(Ordering::SeqCst);
        assert_eq!(created, callback.released.load(Ordering::SeqCst));
        assert_eq!(created, callback.stopped.load(Ordering::SeqCst));
        assert_eq!(callback.closed.load(Ordering::SeqCst), 400);
    }

    #[test]
    fn shuffled_concurrent_drops_release_once() {
        let callback = Arc::new(TestCallback::default());
        let hub = MjpegHub::new(callback.clone(), 4, None);
        let mut guards: Vec<ClientGuard> =
            (0..10).map(|i| hub.admit(peer(i)).unwrap()).collect();
        assert_eq!(hub.client_count(), 10);
        guards.shuffle(&mut rand::rng());

        let barrier = Arc::new(Barrier::new(guards.len()));
        let handles: Vec<_> = guards
            .into_iter()
            .map(|guard| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    drop(guard);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(callback.created.load(Ordering::SeqCst), 1);
        assert_eq!(callback.released.load(Ordering::SeqCst), 1);
        assert_eq!(callback.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(callback.closed.load(Ordering::SeqCst), 10);
        assert_eq!(hub.client_count(), 0);
        assert!(!hub.has_encoder());
    }

    /// True when another thread can take the hub lock within a second
    fn lock_is_free(hub: Arc<MjpegHub>) -> bool {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(hub.client_count());
        });
        rx.recv_timeout(Duration::from_secs(1)).is_ok()
    }

    /// Fails to start, then checks the hub lock from `stop`
    struct FailingEncoder {
        sink: Option<JpegSink>,
        stopped_unlocked: Arc<AtomicBool>,
    }

    impl JpegEncoder for FailingEncoder {
        fn start(&mut self, sink: JpegSink) -> Result<()> {
            self.sink = Some(sink);
            Err(PipelineError::Render("device busy".to_string()))
        }

        fn stop(&mut self) {
            if let Some(hub) = self.sink.as_ref().and_then(|s| s.hub.upgrade()) {
                self.stopped_unlocked.store(lock_is_free(hub), Ordering::SeqCst);
            }
        }
    }

    struct FailingCallback {
        stopped_unlocked: Arc<AtomicBool>,
        hub: Mutex<Weak<MjpegHub>>,
        released_unlocked: AtomicBool,
    }

    impl MjpegCallback for FailingCallback {
        fn on_accept(&self, _peer: SocketAddr) -> bool {
            true
        }

        fn on_closed(&self, _peer: SocketAddr) {}

        fn create_encoder(&self) -> Option<Box<dyn JpegEncoder>> {
            Some(Box::new(FailingEncoder {
                sink: None,
                stopped_unlocked: self.stopped_unlocked.clone(),
            }))
        }

        fn release_encoder(&self, _encoder: Box<dyn JpegEncoder>) {
            if let Some(hub) = self.hub.lock().upgrade() {
                self.released_unlocked.store(lock_is_free(hub), Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn failed_start_is_cleaned_up_outside_lock() {
        let callback = Arc::new(FailingCallback {
            stopped_unlocked: Arc::new(AtomicBool::new(false)),
            hub: Mutex::new(Weak::new()),
            released_unlocked: AtomicBool::new(false),
        });
        let hub = MjpegHub::new(callback.clone(), 4, None);
        *callback.hub.lock() = Arc::downgrade(&hub);

        assert!(matches!(
            hub.admit(peer(1)),
            Err(PipelineError::ServiceUnavailable(_))
        ));
        assert!(callback.stopped_unlocked.load(Ordering::SeqCst));
        assert!(callback.released_unlocked.load(Ordering::SeqCst));
        assert!(!hub.has_encoder());
    }

    #[test]
    fn part_framing() {
        let part = create_mjpeg_part("frame", &[0xff, 0xd8, 0xff, 0xd9]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xff, 0xd8, 0xff, 0xd9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(&part[..], &expected[..]);
    }
}
