//! H.264 RTP packetizer (RFC 3984)
//!
//! Reads NAL units from either a length-prefixed byte stream (a muxed file
//! or pipe) or an encoder's output queue, and sends them as single NAL unit
//! packets or FU-A fragments. When the application supplied SPS/PPS out of
//! band, a STAP-A carrying both precedes every IDR until the stream proves it
//! repeats them in band.
//!
//! Length-prefixed stream layout:
//! ```text
//! +--------+--------+--------+---------------------+
//! | len_hi | len_lo | header | payload (len-1)     |
//! +--------+--------+--------+---------------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::{BufReader, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::nal::{
    find_annexb_start_code, is_malformed_header, is_parameter_set, split_annexb_nal_units,
    NAL_FU_A, NAL_IDR, NAL_SLICE, NAL_STAP_A,
};
use super::socket::{RtpCounters, RtpSocket, RTP_HEADER_LEN};
use super::statistics::Statistics;
use crate::config::PacketizerConfig;
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::video::{Frame, FrameQueue, QueueError};
use crate::utils::{WorkerThread, TERMINATE_TIMEOUT};

const THREAD_NAME: &str = "h264-packetizer";

/// In-band parameter sets seen before the out-of-band STAP-A is dropped
const IN_BAND_PARAMETER_SET_LIMIT: u32 = 4;

/// Resync candidates must announce a length below this
const RESYNC_MAX_NAL_LEN: usize = 100_000;

/// Bytes scanned by one resync before the stream is declared lost
const RESYNC_MAX_SCAN: usize = 1 << 20;

/// Back-to-back resyncs before the stream is declared lost
const RESYNC_MAX_CONSECUTIVE: u32 = 8;

/// Where NAL units come from
pub enum H264Source {
    /// Byte stream of 2-byte big-endian length-prefixed NAL units
    Muxed(Box<dyn Read + Send>),
    /// Encoder output buffers, one access unit each (Annex B or bare NAL)
    Encoder(Arc<FrameQueue<Frame>>),
}

/// How NAL boundaries are found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    LengthPrefixed,
    AnnexB,
    /// Encoder buffers are bare NAL units
    Raw,
}

/// Packetizer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PacketizerStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub nal_units: u64,
    pub stap_a_sent: u64,
    pub resyncs: u64,
    /// Current per-picture interval of a muxed source
    pub frame_interval_us: u64,
}

#[derive(Default)]
struct NalCounters {
    nal_units: AtomicU64,
    frame_interval_us: AtomicU64,
    stap_a_sent: AtomicU64,
    resyncs: AtomicU64,
}

#[derive(Default)]
struct ParameterSets {
    stap_a: Option<Bytes>,
    in_band: u32,
}

/// Build the STAP-A payload carrying SPS then PPS
pub fn build_stap_a(sps: &[u8], pps: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + sps.len() + pps.len());
    buf.put_u8(NAL_STAP_A);
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);
    buf.freeze()
}

/// Microsecond presentation time to the 90 kHz RTP clock
pub fn pts_to_rtp_timestamp(pts_us: i64) -> u32 {
    (pts_us.wrapping_mul(9) / 100) as u32
}

/// Packetization state owned by the worker thread
struct NalSender {
    socket: RtpSocket,
    max_packet_size: usize,
    mode: StreamMode,
    params: Arc<Mutex<ParameterSets>>,
    counters: Arc<NalCounters>,
}

impl NalSender {
    fn max_payload(&self) -> usize {
        self.max_packet_size.saturating_sub(RTP_HEADER_LEN + 2).max(1)
    }

    fn send_nal(&mut self, nal: &[u8], timestamp: u32) -> Result<()> {
        let Some(&header) = nal.first() else {
            return Ok(());
        };
        let nal_type = header & 0x1f;

        let stap_a = {
            let mut params = self.params.lock();
            if is_parameter_set(nal_type) {
                params.in_band += 1;
                if params.in_band > IN_BAND_PARAMETER_SET_LIMIT && params.stap_a.is_some() {
                    debug!("SPS/PPS repeated in band, no longer injecting STAP-A");
                    params.stap_a = None;
                }
            }
            if nal_type == NAL_IDR && self.mode != StreamMode::LengthPrefixed {
                params.stap_a.clone()
            } else {
                None
            }
        };

        if let Some(stap_a) = stap_a {
            self.socket.send(stap_a, timestamp, false)?;
            self.counters.stap_a_sent.fetch_add(1, Ordering::Relaxed);
        }

        let max_payload = self.max_payload();
        if nal.len() <= max_payload {
            self.socket
                .send(Bytes::copy_from_slice(nal), timestamp, true)?;
        } else {
            let indicator = (header & 0x60) | NAL_FU_A;
            let body = &nal[1..];
            let mut offset = 0;
            while offset < body.len() {
                let end = (offset + max_payload).min(body.len());
                let mut fu_header = nal_type;
                if offset == 0 {
                    fu_header |= 0x80;
                }
                let last = end == body.len();
                if last {
                    fu_header |= 0x40;
                }

                let mut payload = BytesMut::with_capacity(2 + end - offset);
                payload.put_u8(indicator);
                payload.put_u8(fu_header);
                payload.put_slice(&body[offset..end]);
                self.socket.send(payload.freeze(), timestamp, last)?;
                offset = end;
            }
        }

        self.counters.nal_units.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_encoder_frame(&mut self, frame: &Frame) -> Result<()> {
        let timestamp = pts_to_rtp_timestamp(frame.pts_us);
        let data = frame.data();

        if self.mode == StreamMode::AnnexB && !matches!(find_annexb_start_code(data, 0), Some((0, _))) {
            warn!("Encoder output is not Annex B framed, treating buffers as bare NAL units");
            self.mode = StreamMode::Raw;
        }

        match self.mode {
            StreamMode::AnnexB => {
                for nal in split_annexb_nal_units(data) {
                    self.send_nal(nal, timestamp)?;
                }
                Ok(())
            }
            _ => self.send_nal(data, timestamp),
        }
    }

    fn run_encoder(&mut self, queue: &FrameQueue<Frame>, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            match queue.pop(None) {
                Ok(frame) => self.send_encoder_frame(&frame)?,
                Err(QueueError::Interrupted) | Err(QueueError::Timeout) => continue,
                Err(QueueError::Closed) => return Err(PipelineError::EndOfStream),
            }
        }
        Ok(())
    }

    /// Muxed sources carry no timestamps. The RTP clock advances once per
    /// picture by the averaged time it took to read one, never by less than
    /// `min_interval`, and sending waits for the wall clock to catch up.
    fn run_muxed<R: Read>(
        &mut self,
        reader: R,
        running: &AtomicBool,
        stats_window: usize,
        min_interval: Duration,
    ) -> Result<()> {
        let mut reader = LengthPrefixedReader::new(reader, self.counters.clone());
        let mut stats = Statistics::new(stats_window);
        let origin = Instant::now();
        let mut media_time = Duration::ZERO;
        let mut read_time = Duration::ZERO;

        while running.load(Ordering::SeqCst) {
            let started = Instant::now();
            let nal = reader.next_nal()?;
            read_time += started.elapsed();

            if !pace_until(origin + media_time, running) {
                break;
            }
            self.send_nal(&nal, duration_to_rtp_timestamp(media_time))?;

            let nal_type = nal[0] & 0x1f;
            if (NAL_SLICE..=NAL_IDR).contains(&nal_type) {
                stats.push(read_time);
                read_time = Duration::ZERO;
                let interval = stats.average().max(min_interval);
                self.counters
                    .frame_interval_us
                    .store(interval.as_micros() as u64, Ordering::Relaxed);
                media_time += interval;
            }
        }
        Ok(())
    }
}

/// Media time to the 90 kHz RTP clock
fn duration_to_rtp_timestamp(media_time: Duration) -> u32 {
    (media_time.as_micros() as u64 * 9 / 100) as u32
}

/// Sleep until `deadline` in short steps; `false` once `running` clears
fn pace_until(deadline: Instant, running: &AtomicBool) -> bool {
    const STEP: Duration = Duration::from_millis(20);
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(STEP));
    }
}

/// Pulls length-prefixed NAL units, resynchronizing on garbage
struct LengthPrefixedReader<R: Read> {
    inner: BufReader<R>,
    counters: Arc<NalCounters>,
    consecutive_resyncs: u32,
}

impl<R: Read> LengthPrefixedReader<R> {
    fn new(reader: R, counters: Arc<NalCounters>) -> Self {
        Self {
            inner: BufReader::new(reader),
            counters,
            consecutive_resyncs: 0,
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => PipelineError::EndOfStream,
            _ => PipelineError::Io(e),
        })
    }

    fn next_nal(&mut self) -> Result<Vec<u8>> {
        let mut window = [0u8; 3];
        self.read_exact(&mut window)?;

        let mut len = u16::from_be_bytes([window[0], window[1]]) as usize;
        if len == 0 || is_malformed_header(window[2]) {
            len = self.resync(&mut window)?;
        } else {
            self.consecutive_resyncs = 0;
        }

        let mut nal = vec![0u8; len];
        nal[0] = window[2];
        self.read_exact(&mut nal[1..])?;
        Ok(nal)
    }

    /// Slide one byte at a time until `[len_hi, len_lo, header]` looks like a
    /// slice NAL unit. Returns the announced length.
    fn resync(&mut self, window: &mut [u8; 3]) -> Result<usize> {
        self.consecutive_resyncs += 1;
        self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
        if self.consecutive_resyncs > RESYNC_MAX_CONSECUTIVE {
            return Err(PipelineError::ProtocolDesync(format!(
                "{} consecutive resyncs",
                self.consecutive_resyncs
            )));
        }
        warn!(
            "Packetizer out of sync (header {:02x?}), scanning for next NAL unit",
            window
        );

        let mut byte = [0u8; 1];
        for _ in 0..RESYNC_MAX_SCAN {
            self.read_exact(&mut byte)?;
            window.copy_within(1.., 0);
            window[2] = byte[0];

            let header = window[2];
            let nal_type = header & 0x1f;
            if header & 0x80 == 0 && (nal_type == NAL_SLICE || nal_type == NAL_IDR) {
                let len = u16::from_be_bytes([window[0], window[1]]) as usize;
                if len > 0 && len < RESYNC_MAX_NAL_LEN {
                    debug!("Resynchronized on NAL type {} ({} bytes)", nal_type, len);
                    return Ok(len);
                }
            }
        }

        Err(PipelineError::ProtocolDesync(format!(
            "no NAL unit within {} bytes",
            RESYNC_MAX_SCAN
        )))
    }
}

/// H.264 RTP packetizer with its own worker thread
pub struct H264Packetizer {
    config: PacketizerConfig,
    socket: Option<RtpSocket>,
    source: Option<H264Source>,
    params: Arc<Mutex<ParameterSets>>,
    counters: Arc<NalCounters>,
    rtp_counters: Arc<RtpCounters>,
    running: Arc<AtomicBool>,
    worker: Option<WorkerThread>,
    wake: Option<Arc<FrameQueue<Frame>>>,
    last_error: Arc<Mutex<Option<String>>>,
    events: Option<EventBus>,
}

impl H264Packetizer {
    pub fn new(socket: RtpSocket, source: H264Source, config: PacketizerConfig) -> Self {
        Self {
            config,
            rtp_counters: socket.counters(),
            socket: Some(socket),
            source: Some(source),
            params: Arc::new(Mutex::new(ParameterSets::default())),
            counters: Arc::new(NalCounters::default()),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            wake: None,
            last_error: Arc::new(Mutex::new(None)),
            events: None,
        }
    }

    /// Report stop and failure through `events`
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Parameter sets to announce before every IDR (encoder sources only)
    pub fn set_stream_parameters(&self, sps: &[u8], pps: &[u8]) {
        self.params.lock().stap_a = Some(build_stap_a(sps, pps));
    }

    /// STAP-A currently injected before IDRs
    pub fn stap_a(&self) -> Option<Bytes> {
        self.params.lock().stap_a.clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Error that ended the last run, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn stats(&self) -> PacketizerStats {
        PacketizerStats {
            packets_sent: self.rtp_counters.packets.load(Ordering::Relaxed),
            bytes_sent: self.rtp_counters.bytes.load(Ordering::Relaxed),
            nal_units: self.counters.nal_units.load(Ordering::Relaxed),
            stap_a_sent: self.counters.stap_a_sent.load(Ordering::Relaxed),
            resyncs: self.counters.resyncs.load(Ordering::Relaxed),
            frame_interval_us: self.counters.frame_interval_us.load(Ordering::Relaxed),
        }
    }

    /// Spawn the packetizer thread. The source and socket are consumed; a
    /// packetizer runs once.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (Some(socket), Some(source)) = (self.socket.take(), self.source.take()) else {
            return Err(PipelineError::Config(
                "packetizer already consumed its source".to_string(),
            ));
        };

        let mode = match &source {
            H264Source::Muxed(_) => StreamMode::LengthPrefixed,
            H264Source::Encoder(queue) => {
                self.wake = Some(queue.clone());
                StreamMode::AnnexB
            }
        };
        self.params.lock().in_band = 0;

        let mut sender = NalSender {
            socket,
            max_packet_size: self.config.max_packet_size,
            mode,
            params: self.params.clone(),
            counters: self.counters.clone(),
        };
        let running = self.running.clone();
        let rtp_counters = self.rtp_counters.clone();
        let last_error = self.last_error.clone();
        let events = self.events.clone();
        let stats_window = self.config.stats_window;
        let min_interval = match self.config.frame_rate {
            0 => Duration::ZERO,
            fps => Duration::from_secs(1) / fps,
        };

        running.store(true, Ordering::SeqCst);
        let worker = WorkerThread::spawn(THREAD_NAME, move || {
            info!("H264 packetizer started ({:?})", mode);
            let result = match source {
                H264Source::Muxed(reader) => {
                    sender.run_muxed(reader, &running, stats_window, min_interval)
                }
                H264Source::Encoder(queue) => sender.run_encoder(&queue, &running),
            };
            running.store(false, Ordering::SeqCst);

            let error = match result {
                Ok(()) => None,
                Err(e) if e.is_shutdown() => None,
                Err(e) => {
                    error!("H264 packetizer failed: {}", e);
                    Some(e.to_string())
                }
            };
            *last_error.lock() = error.clone();
            info!("H264 packetizer stopped");

            if let Some(events) = events {
                if let Some(message) = &error {
                    events.publish(PipelineEvent::component_error("packetizer", message.clone()));
                }
                events.publish(PipelineEvent::PacketizerStopped {
                    packets_sent: rtp_counters.packets.load(Ordering::Relaxed),
                    error,
                });
            }
        });

        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stop the thread and wait up to the terminate bound.
    ///
    /// A muxed source blocked in `read` is abandoned after the bound.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        if let Some(queue) = self.wake.take() {
            queue.interrupt();
        }
        worker.join_timeout(TERMINATE_TIMEOUT);
    }

    /// Wait for the thread to finish on its own (end of stream)
    pub fn wait(&mut self, timeout: Duration) -> bool {
        match self.worker.take() {
            Some(worker) => worker.join_timeout(timeout),
            None => true,
        }
    }
}

impl Drop for H264Packetizer {
    fn drop(&mut self) {
        self.stop();
    }
}
