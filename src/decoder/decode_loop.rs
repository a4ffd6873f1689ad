//! One decode thread per track
//!
//! Frames arrive from the network task through a bounded queue. Config frames
//! go to `Decoder::configure`, payload goes to `queue_input` once the decoder
//! is configured, and output events are drained after every input and on
//! every idle poll.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

use super::{DecodedFrame, Decoder, DecoderOutput, FrameConsumer, OutputId};
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::utils::{LogThrottler, WorkerThread, TERMINATE_TIMEOUT};
use crate::video::{Frame, FrameQueue, PushError, QueueError};
use crate::warn_throttled;

/// Decode loop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DecodeState {
    Created = 0,
    Configured = 1,
    Decoding = 2,
    Released = 3,
}

impl DecodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Configured,
            2 => Self::Decoding,
            _ => Self::Released,
        }
    }
}

/// Invoked once when the loop ends on a real failure
pub type ErrorCallback = Arc<dyn Fn(&PipelineError) + Send + Sync>;

#[derive(Clone)]
pub struct DecodeLoopOptions {
    /// Thread name and log label
    pub name: String,
    pub queue_capacity: usize,
    /// How long to wait for input before polling the decoder for output
    pub poll_interval: Duration,
    /// Encoding label used in events
    pub encoding: String,
    pub events: Option<EventBus>,
    pub on_error: Option<ErrorCallback>,
}

impl Default for DecodeLoopOptions {
    fn default() -> Self {
        Self {
            name: "decode".to_string(),
            queue_capacity: 64,
            poll_interval: Duration::from_millis(10),
            encoding: String::new(),
            events: None,
            on_error: None,
        }
    }
}

struct Shared {
    state: AtomicU8,
    muted: AtomicBool,
    stopping: AtomicBool,
    frames_out: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: DecodeState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> DecodeState {
        DecodeState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Returns the output buffer to the decoder however the consumer call ends
struct ReleaseGuard<'a> {
    decoder: &'a mut Box<dyn Decoder>,
    id: OutputId,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.decoder.release_output(self.id);
    }
}

/// Handle to a running decode thread
pub struct DecodeLoop {
    name: String,
    input: Arc<FrameQueue<Frame>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerThread>>,
    throttler: LogThrottler,
}

impl DecodeLoop {
    /// Spawn the decode thread.
    ///
    /// `initial_config` is queued ahead of any payload.
    pub fn spawn(
        decoder: Box<dyn Decoder>,
        consumer: Box<dyn FrameConsumer>,
        initial_config: Option<Frame>,
        options: DecodeLoopOptions,
    ) -> Result<Self> {
        let input = Arc::new(FrameQueue::new(options.queue_capacity));
        if let Some(config) = initial_config {
            // Queue is empty, cannot be full
            let _ = input.try_push(config.with_config(true));
        }

        let shared = Arc::new(Shared {
            state: AtomicU8::new(DecodeState::Created as u8),
            muted: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            frames_out: AtomicU64::new(0),
        });

        let name = options.name.clone();
        let mut runner = Runner {
            decoder,
            consumer,
            input: input.clone(),
            shared: shared.clone(),
            options,
        };
        let worker = WorkerThread::spawn(&name, move || runner.run())?;

        Ok(Self {
            name,
            input,
            shared,
            worker: Mutex::new(Some(worker)),
            throttler: LogThrottler::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand a depacketized frame to the decode thread.
    ///
    /// Never blocks: returns `false` and drops the frame when the queue is full
    /// or the loop has ended.
    pub fn submit(&self, frame: Frame) -> bool {
        match self.input.try_push(frame) {
            Ok(()) => true,
            Err(PushError::Full(_)) => {
                warn_throttled!(
                    self.throttler,
                    "decode_queue_full",
                    "Decode queue '{}' full, dropping frame",
                    self.name
                );
                false
            }
            Err(PushError::Closed(_)) => false,
        }
    }

    pub fn set_muted(&self, muted: bool) {
        if self.shared.muted.swap(muted, Ordering::SeqCst) != muted {
            debug!("Decode loop '{}' muted={}", self.name, muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DecodeState {
        self.shared.state()
    }

    /// Decoded frames handed to the consumer
    pub fn frames_out(&self) -> u64 {
        self.shared.frames_out.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|worker| worker.is_finished())
            .unwrap_or(true)
    }

    /// No more input; the thread drains what is queued and exits
    pub fn finish(&self) {
        self.input.close();
    }

    /// Interrupt the thread and join it within the terminate bound
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.input.interrupt();
        self.input.close();
        worker.join_timeout(TERMINATE_TIMEOUT);
    }

    /// Wait for the thread to end on its own
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.worker.lock().take() {
            Some(worker) => worker.join_timeout(timeout),
            None => true,
        }
    }
}

impl Drop for DecodeLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Runner {
    decoder: Box<dyn Decoder>,
    consumer: Box<dyn FrameConsumer>,
    input: Arc<FrameQueue<Frame>>,
    shared: Arc<Shared>,
    options: DecodeLoopOptions,
}

impl Runner {
    fn run(&mut self) {
        info!(
            "Decode loop '{}' started ({})",
            self.options.name,
            self.decoder.name()
        );

        match self.decode() {
            Ok(()) => debug!("Decode loop '{}' reached end of input", self.options.name),
            Err(e) if e.is_shutdown() || self.shared.stopping.load(Ordering::SeqCst) => {
                debug!("Decode loop '{}' interrupted: {}", self.options.name, e)
            }
            Err(e) => {
                error!("Decode loop '{}' failed: {}", self.options.name, e);
                if let Some(callback) = &self.options.on_error {
                    callback(&e);
                }
                if let Some(events) = &self.options.events {
                    events.publish(PipelineEvent::component_error(
                        &self.options.name,
                        e.to_string(),
                    ));
                }
            }
        }

        self.input.close();
        self.shared.set_state(DecodeState::Released);
        info!("Decode loop '{}' released", self.options.name);
    }

    fn decode(&mut self) -> Result<()> {
        loop {
            match self.input.pop(Some(self.options.poll_interval)) {
                Ok(frame) => {
                    self.feed(frame)?;
                    self.drain()?;
                }
                Err(QueueError::Timeout) => self.drain()?,
                Err(QueueError::Interrupted) => return Err(PipelineError::Interrupted),
                Err(QueueError::Closed) => {
                    self.drain()?;
                    return Ok(());
                }
            }
        }
    }

    fn feed(&mut self, frame: Frame) -> Result<()> {
        if frame.config {
            self.decoder.configure(&frame)?;
            if self.shared.state() == DecodeState::Created {
                self.shared.set_state(DecodeState::Configured);
                debug!("Decoder '{}' configured", self.options.name);
            }
            return Ok(());
        }

        match self.shared.state() {
            DecodeState::Created => {
                trace!(
                    "Decoder '{}' not configured, dropping {} byte frame",
                    self.options.name,
                    frame.len()
                );
                Ok(())
            }
            DecodeState::Configured => {
                self.shared.set_state(DecodeState::Decoding);
                self.decoder.queue_input(frame)
            }
            _ => self.decoder.queue_input(frame),
        }
    }

    /// Pull output events until the decoder has nothing more
    fn drain(&mut self) -> Result<()> {
        loop {
            match self.decoder.dequeue_output()? {
                DecoderOutput::TryAgainLater => return Ok(()),
                DecoderOutput::FormatChanged { width, height } => {
                    info!(
                        "Decoder '{}' output size {}x{}",
                        self.options.name, width, height
                    );
                    self.consumer.on_size_changed(width, height);
                    if let Some(events) = &self.options.events {
                        events.publish(PipelineEvent::DecoderSizeChanged {
                            encoding: self.options.encoding.clone(),
                            width,
                            height,
                        });
                    }
                }
                DecoderOutput::Frame(frame) => self.deliver(frame)?,
            }
        }
    }

    fn deliver(&mut self, frame: DecodedFrame) -> Result<()> {
        let _guard = ReleaseGuard {
            decoder: &mut self.decoder,
            id: frame.id,
        };
        if self.shared.muted.load(Ordering::SeqCst) {
            return Ok(());
        }

        let consumer = &mut self.consumer;
        match panic::catch_unwind(AssertUnwindSafe(|| consumer.on_frame(&frame))) {
            Ok(result) => {
                result?;
                self.shared.frames_out.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => Err(PipelineError::Decoder(format!(
                "frame consumer panicked in '{}'",
                self.options.name
            ))),
        }
    }
}
