//! One-to-many surface broadcaster
//!
//! A single render thread waits for the next source image and draws it into
//! every registered sink. Sinks can be added or removed from any thread at
//! any time; registration never overlaps a draw because both take the
//! renderer lock first and the sink-list lock second.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::format::{Resolution, Rotation};
use super::render::{
    ImageWait, RenderBackend, RenderContext, Sink, SinkTag, SourceImage, SurfaceId,
};
use crate::config::BroadcasterConfig;
use crate::error::{PipelineError, Result};
use crate::utils::{WorkerThread, TERMINATE_TIMEOUT};

const THREAD_NAME: &str = "surface-drawing";

/// Lifecycle of the render thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrawingState {
    Idle = 0,
    Init = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl DrawingState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Init,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// A sink that received a frame
#[derive(Debug, Clone)]
pub struct DrawnFrame {
    pub tag: SinkTag,
    pub resolution: Resolution,
    pub timestamp_ns: i64,
}

/// Render thread notifications, fired synchronously on that thread
pub trait DrawingListener: Send + Sync {
    fn on_started(&self) {}

    fn on_stopped(&self) {}

    fn on_error(&self, _error: &PipelineError) {}

    fn on_drawn(&self, _frame: &DrawnFrame) {}
}

/// Handle returned by `add_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Shared {
    backend: Arc<dyn RenderBackend>,
    renderer: Mutex<Option<Box<dyn RenderContext>>>,
    sinks: Mutex<Vec<Sink>>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn DrawingListener>)>>,
    next_listener: AtomicU64,
    state: AtomicU8,
    size: Mutex<Resolution>,
    rotation: Mutex<Rotation>,
    timeout: Mutex<Duration>,
}

impl Shared {
    fn state(&self) -> DrawingState {
        DrawingState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: DrawingState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn listeners(&self) -> Vec<Arc<dyn DrawingListener>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    fn run(&self) {
        let result = self.render_loop();

        if let Err(e) = &result {
            if !e.is_shutdown() && self.state() != DrawingState::Stopping {
                error!("Surface drawing failed: {}", e);
                for listener in self.listeners() {
                    listener.on_error(e);
                }
            }
        }

        self.release_all();
        self.set_state(DrawingState::Stopped);
        info!("Surface drawing stopped");
        for listener in self.listeners() {
            listener.on_stopped();
        }
    }

    fn render_loop(&self) -> Result<()> {
        self.init_renderer()?;

        if self
            .state
            .compare_exchange(
                DrawingState::Init as u8,
                DrawingState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            // stop() arrived during start-up
            return Ok(());
        }

        info!("Surface drawing started");
        for listener in self.listeners() {
            listener.on_started();
        }

        loop {
            if self.state() == DrawingState::Stopping {
                return Ok(());
            }

            let timeout = *self.timeout.lock();
            let wait = (!timeout.is_zero()).then_some(timeout);

            match self.backend.await_new_image(wait)? {
                ImageWait::Ready(image) => self.draw(&image)?,
                ImageWait::TimedOut => {
                    return Err(PipelineError::Timeout(format!(
                        "no source image within {:?}",
                        timeout
                    )));
                }
                ImageWait::Interrupted => continue,
            }
        }
    }

    fn init_renderer(&self) -> Result<()> {
        let size = *self.size.lock();
        let mut renderer = self.renderer.lock();
        let mut ctx = self.backend.create_context(size)?;

        let mut sinks = self.sinks.lock();
        let mut failure = None;
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.init(ctx.as_mut()) {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            for sink in sinks.iter_mut() {
                sink.release(ctx.as_mut());
            }
            ctx.release();
            return Err(e);
        }

        debug!("Render context ready with {} sinks", sinks.len());
        *renderer = Some(ctx);
        Ok(())
    }

    fn draw(&self, image: &SourceImage) -> Result<()> {
        let rotation = *self.rotation.lock();
        let mut drawn = Vec::new();
        {
            let mut renderer = self.renderer.lock();
            let Some(ctx) = renderer.as_mut() else {
                return Ok(());
            };

            let targets: Vec<(SinkTag, SurfaceId)> = self
                .sinks
                .lock()
                .iter()
                .filter_map(|sink| sink.surface().map(|id| (sink.tag().clone(), id)))
                .collect();

            for (tag, surface) in targets {
                let Some(resolution) = ctx.surface_size(surface) else {
                    continue;
                };
                ctx.make_current(surface)?;
                ctx.set_viewport(resolution);
                ctx.draw_image(image, rotation)?;
                ctx.set_presentation_time(surface, image.timestamp_ns);
                ctx.swap_buffers(surface)?;
                drawn.push(DrawnFrame {
                    tag,
                    resolution,
                    timestamp_ns: image.timestamp_ns,
                });
            }
        }

        if !drawn.is_empty() {
            let listeners = self.listeners();
            for frame in &drawn {
                for listener in &listeners {
                    listener.on_drawn(frame);
                }
            }
        }
        Ok(())
    }

    /// Release every sink, then the context. Sinks go first: their surfaces
    /// belong to the context.
    fn release_all(&self) {
        let mut renderer = self.renderer.lock();
        let mut sinks = self.sinks.lock();
        match renderer.take() {
            Some(mut ctx) => {
                for sink in sinks.iter_mut() {
                    sink.release(ctx.as_mut());
                }
                ctx.release();
            }
            None => {
                if sinks.iter().any(Sink::is_initialized) {
                    warn!("Sinks initialized without a render context");
                }
            }
        }
        sinks.clear();
    }
}

/// Draws the latest source image into every registered sink
pub struct SurfaceBroadcaster {
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerThread>>,
}

impl SurfaceBroadcaster {
    pub fn new(backend: Arc<dyn RenderBackend>, config: &BroadcasterConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                renderer: Mutex::new(None),
                sinks: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                state: AtomicU8::new(DrawingState::Idle as u8),
                size: Mutex::new(Resolution::new(config.width, config.height)),
                rotation: Mutex::new(config.rotation),
                timeout: Mutex::new(Duration::from_millis(config.timeout_ms)),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the render thread. Calling it while running does nothing.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if let Some(current) = worker.as_ref() {
            if !current.is_finished() {
                return Ok(());
            }
        }
        if let Some(finished) = worker.take() {
            finished.join_timeout(TERMINATE_TIMEOUT);
        }

        self.shared.set_state(DrawingState::Init);
        let shared = self.shared.clone();
        match WorkerThread::spawn(THREAD_NAME, move || shared.run()) {
            Ok(thread) => {
                *worker = Some(thread);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(DrawingState::Stopped);
                Err(e.into())
            }
        }
    }

    /// Stop the render thread.
    ///
    /// Without `force`, refuses and returns `false` while sinks are
    /// registered. Returns `true` once the thread was asked to stop (or was
    /// not running).
    pub fn stop(&self, force: bool) -> bool {
        if !force && self.sink_count() > 0 {
            debug!("Refusing to stop with {} sinks", self.sink_count());
            return false;
        }

        let Some(worker) = self.worker.lock().take() else {
            return true;
        };

        let _ = self.shared.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
            match DrawingState::from_u8(s) {
                DrawingState::Init | DrawingState::Running => Some(DrawingState::Stopping as u8),
                _ => None,
            }
        });
        self.shared.backend.interrupt();
        worker.join_timeout(TERMINATE_TIMEOUT);
        true
    }

    /// Register a sink. Initialized right away when the renderer is up,
    /// otherwise at start-up.
    pub fn add_sink(&self, mut sink: Sink) -> Result<()> {
        let mut renderer = self.shared.renderer.lock();
        let mut sinks = self.shared.sinks.lock();
        if sinks.iter().any(|s| s.tag() == sink.tag()) {
            return Err(PipelineError::Config(format!(
                "sink '{}' already registered",
                sink.tag()
            )));
        }
        if let Some(ctx) = renderer.as_mut() {
            sink.init(ctx.as_mut())?;
        }
        debug!("Added sink '{}' ({:?})", sink.tag(), sink.kind());
        sinks.push(sink);
        Ok(())
    }

    /// Unregister and release a sink. Returns whether it existed.
    pub fn remove_sink(&self, tag: &SinkTag) -> bool {
        let mut renderer = self.shared.renderer.lock();
        let removed = {
            let mut sinks = self.shared.sinks.lock();
            sinks
                .iter()
                .position(|s| s.tag() == tag)
                .map(|index| sinks.remove(index))
        };

        match removed {
            Some(mut sink) => {
                if let Some(ctx) = renderer.as_mut() {
                    sink.release(ctx.as_mut());
                }
                debug!("Removed sink '{}'", tag);
                true
            }
            None => false,
        }
    }

    pub fn has_sink(&self, tag: &SinkTag) -> bool {
        self.shared.sinks.lock().iter().any(|s| s.tag() == tag)
    }

    pub fn sink_count(&self) -> usize {
        self.shared.sinks.lock().len()
    }

    /// Subscribe to render events. A listener added once initialization is
    /// complete gets `on_started` immediately.
    pub fn add_listener(&self, listener: Arc<dyn DrawingListener>) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.lock().push((id, listener.clone()));
        if self.is_init_completed() {
            listener.on_started();
        }
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn state(&self) -> DrawingState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), DrawingState::Init | DrawingState::Running)
    }

    pub fn is_init_completed(&self) -> bool {
        self.state() == DrawingState::Running
    }

    /// Context size used at the next start
    pub fn set_size(&self, size: Resolution) {
        *self.shared.size.lock() = size;
    }

    pub fn size(&self) -> Resolution {
        *self.shared.size.lock()
    }

    pub fn set_rotation(&self, rotation: Rotation) {
        *self.shared.rotation.lock() = rotation;
    }

    pub fn rotation(&self) -> Rotation {
        *self.shared.rotation.lock()
    }

    /// Wait bound for a new source image. Zero waits forever.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.shared.timeout.lock() = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.shared.timeout.lock()
    }
}

impl Drop for SurfaceBroadcaster {
    fn drop(&mut self) {
        self.stop(true);
    }
}
