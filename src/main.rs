use std::fs::File;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_core::config::{self, StreamCoreConfig};
use stream_core::decoder::{DecodedFrame, DecoderRegistry, FrameConsumer};
use stream_core::events::EventBus;
use stream_core::rtp::nal::{h264_nal_type, split_annexb_nal_units, to_annexb};
use stream_core::rtp::{H264Packetizer, H264Source, RtpSocket, UdpTransport};
use stream_core::rtsp::{MediaDescription, MediaKind, RtspSession, SessionState};
use stream_core::stream::{DirectoryEncoder, JpegEncoder, MjpegCallback, MjpegPushServer};
use stream_core::video::{Frame, FrameQueue};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Input layout of an H.264 file
#[derive(Debug, Clone, Copy, ValueEnum)]
enum InputFormat {
    /// Guess from the first bytes
    Auto,
    AnnexB,
    LengthPrefixed,
}

/// stream-core command line arguments
#[derive(Parser, Debug)]
#[command(name = "stream-core")]
#[command(version, about = "RTP/RTSP/MJPEG media pipeline tools", long_about = None)]
struct CliArgs {
    /// JSON configuration file (defaults when absent)
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Packetize an H.264 file to RTP over UDP
    Send {
        file: PathBuf,

        /// Destination address, e.g. 127.0.0.1:5004
        #[arg(short, long)]
        dest: SocketAddr,

        #[arg(long, value_enum, default_value = "auto")]
        format: InputFormat,

        /// Picture rate used to pace the file
        #[arg(long, default_value_t = 30)]
        fps: u32,

        /// RTP payload type (overrides config)
        #[arg(long)]
        payload_type: Option<u8>,
    },

    /// Play an RTSP stream, writing decoded video to a file
    Play {
        url: String,

        /// Annex-B output for the video track
        #[arg(short, long)]
        out: PathBuf,

        /// ADTS output for the audio track
        #[arg(long)]
        audio_out: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Serve a directory of JPEG files as an MJPEG stream
    Mjpeg {
        #[arg(short, long)]
        dir: PathBuf,

        /// Listen address (overrides config)
        #[arg(short = 'a', long)]
        address: Option<IpAddr>,

        /// HTTP port (overrides config)
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Replay frame rate (overrides config)
        #[arg(long)]
        fps: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting stream-core v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => StreamCoreConfig::default(),
    };

    let events = EventBus::new();
    spawn_event_logger(&events);

    match args.command {
        Command::Send {
            file,
            dest,
            format,
            fps,
            payload_type,
        } => {
            let mut packetizer_config = config.packetizer.clone();
            packetizer_config.frame_rate = fps;
            if let Some(pt) = payload_type {
                packetizer_config.payload_type = pt;
            }
            tokio::task::spawn_blocking(move || {
                run_send(file, dest, format, fps, packetizer_config, events)
            })
            .await??;
        }
        Command::Play {
            url,
            out,
            audio_out,
            duration,
        } => run_play(url, out, audio_out, duration, config, events).await?,
        Command::Mjpeg {
            dir,
            address,
            port,
            fps,
        } => {
            let mut mjpeg = config.mjpeg.clone();
            if let Some(address) = address {
                mjpeg.bind_address = address;
            }
            if let Some(port) = port {
                mjpeg.port = port;
            }
            if let Some(fps) = fps {
                mjpeg.fps = fps;
            }
            run_mjpeg(dir, mjpeg, events).await?;
        }
    }

    tracing::info!("Bye");
    Ok(())
}

fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!("event: {}", json),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
        }
    });
}

fn detect_format(head: &[u8]) -> InputFormat {
    if head.starts_with(&[0, 0, 0, 1]) || head.starts_with(&[0, 0, 1]) {
        InputFormat::AnnexB
    } else {
        InputFormat::LengthPrefixed
    }
}

/// Blocking: runs on the blocking pool
fn run_send(
    file: PathBuf,
    dest: SocketAddr,
    format: InputFormat,
    fps: u32,
    config: config::PacketizerConfig,
    events: EventBus,
) -> anyhow::Result<()> {
    let transport = UdpTransport::connect(dest, config.send_buffer)
        .with_context(|| format!("failed to open UDP socket to {}", dest))?;
    let socket = RtpSocket::new(Box::new(transport), config.payload_type, config.ssrc)?;
    tracing::info!(
        "Sending {} to rtp://{} (pt {}, ssrc {:08x})",
        file.display(),
        dest,
        socket.payload_type(),
        socket.ssrc()
    );

    let format = match format {
        InputFormat::Auto => {
            let mut head = [0u8; 4];
            let n = std::io::Read::read(&mut File::open(&file)?, &mut head)?;
            detect_format(&head[..n])
        }
        other => other,
    };

    match format {
        InputFormat::LengthPrefixed | InputFormat::Auto => {
            let reader = File::open(&file)?;
            let mut packetizer =
                H264Packetizer::new(socket, H264Source::Muxed(Box::new(reader)), config)
                    .with_event_bus(events);
            packetizer.start()?;
            wait_packetizer(&mut packetizer);
            report(&packetizer)
        }
        InputFormat::AnnexB => {
            let data = std::fs::read(&file)?;
            let queue = Arc::new(FrameQueue::new(config.queue_capacity));
            let mut packetizer =
                H264Packetizer::new(socket, H264Source::Encoder(queue.clone()), config)
                    .with_event_bus(events);
            packetizer.start()?;

            let interval = Duration::from_secs(1) / fps.max(1);
            let frame_us = interval.as_micros() as i64;
            let mut pts_us = 0i64;
            for nal in split_annexb_nal_units(&data) {
                let Some(nal_type) = h264_nal_type(nal) else {
                    continue;
                };
                let frame = Frame::new(to_annexb(nal), pts_us).with_key_frame(nal_type == 5);
                if queue.push(frame).is_err() {
                    break;
                }
                // One slice per picture is assumed when pacing
                if (1..=5).contains(&nal_type) {
                    pts_us += frame_us;
                    std::thread::sleep(interval);
                }
            }
            queue.close();
            wait_packetizer(&mut packetizer);
            report(&packetizer)
        }
    }
}

fn wait_packetizer(packetizer: &mut H264Packetizer) {
    while packetizer.is_running() {
        std::thread::sleep(Duration::from_millis(100));
    }
    packetizer.wait(Duration::from_secs(1));
}

fn report(packetizer: &H264Packetizer) -> anyhow::Result<()> {
    let stats = packetizer.stats();
    tracing::info!(
        "Sent {} packets ({} bytes, {} NAL units, {} STAP-A, {} resyncs)",
        stats.packets_sent,
        stats.bytes_sent,
        stats.nal_units,
        stats.stap_a_sent,
        stats.resyncs
    );
    match packetizer.last_error() {
        Some(e) => Err(anyhow::anyhow!("packetizer failed: {}", e)),
        None => Ok(()),
    }
}

/// Writes every decoded buffer to a file
struct FileConsumer {
    file: File,
    frames: u64,
}

impl FrameConsumer for FileConsumer {
    fn on_size_changed(&mut self, width: u32, height: u32) {
        tracing::info!("Video size {}x{}", width, height);
    }

    fn on_frame(&mut self, frame: &DecodedFrame) -> stream_core::Result<()> {
        self.file.write_all(&frame.data)?;
        self.frames += 1;
        if self.frames % 300 == 0 {
            tracing::debug!("{} buffers written", self.frames);
        }
        Ok(())
    }
}

async fn run_play(
    url: String,
    out: PathBuf,
    audio_out: Option<PathBuf>,
    duration: Option<u64>,
    config: StreamCoreConfig,
    events: EventBus,
) -> anyhow::Result<()> {
    let consumers = move |media: &MediaDescription| -> Option<Box<dyn FrameConsumer>> {
        let path = match media.kind {
            MediaKind::Video => out.clone(),
            MediaKind::Audio => audio_out.clone()?,
        };
        match File::create(&path) {
            Ok(file) => Some(Box::new(FileConsumer { file, frames: 0 })),
            Err(e) => {
                tracing::error!("Failed to create {}: {}", path.display(), e);
                None
            }
        }
    };

    let session = RtspSession::new(
        url,
        config.rtsp.clone(),
        DecoderRegistry::with_passthrough(),
        Arc::new(consumers),
    )
    .with_event_bus(events);
    session.start();

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    // `wait` owns the task handle once polled; `stop` then only cancels
    let mut wait = std::pin::pin!(session.wait());
    let state = tokio::select! {
        state = &mut wait => state,
        _ = deadline => {
            session.stop().await;
            (&mut wait).await
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            session.stop().await;
            (&mut wait).await
        }
    };

    tracing::info!(
        "Session ended: {} ({} bytes received)",
        state,
        session.bytes_received()
    );
    if state == SessionState::Failed {
        anyhow::bail!("RTSP session failed");
    }
    Ok(())
}

/// Creates a directory replay encoder for the first client
struct DirectoryCallback {
    dir: PathBuf,
    fps: u32,
}

impl MjpegCallback for DirectoryCallback {
    fn on_accept(&self, peer: SocketAddr) -> bool {
        tracing::info!("MJPEG client {} connected", peer);
        true
    }

    fn on_closed(&self, peer: SocketAddr) {
        tracing::info!("MJPEG client {} disconnected", peer);
    }

    fn create_encoder(&self) -> Option<Box<dyn JpegEncoder>> {
        Some(Box::new(DirectoryEncoder::new(self.dir.clone(), self.fps)))
    }

    fn release_encoder(&self, _encoder: Box<dyn JpegEncoder>) {}
}

async fn run_mjpeg(dir: PathBuf, config: config::MjpegConfig, events: EventBus) -> anyhow::Result<()> {
    let frames = stream_core::stream::directory::load_jpegs(&dir)?;
    if frames.is_empty() {
        anyhow::bail!("no JPEG files in {}", dir.display());
    }
    tracing::info!("{} JPEGs in {}", frames.len(), dir.display());

    let callback = Arc::new(DirectoryCallback {
        dir,
        fps: config.fps,
    });
    let server = MjpegPushServer::new(config, callback, Some(events));
    // Snapshot works before any client connects
    if let Some(first) = frames.into_iter().next() {
        server.offer_media(first);
    }
    server.start().await?;
    if let Some(url) = server.url() {
        tracing::info!("Streaming at {}", url);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.stop().await;
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "stream_core=error,tower_http=error",
        LogLevel::Warn => "stream_core=warn,tower_http=warn",
        LogLevel::Info => "stream_core=info,tower_http=info",
        LogLevel::Verbose => "stream_core=debug,tower_http=info",
        LogLevel::Debug => "stream_core=debug,tower_http=debug",
        LogLevel::Trace => "stream_core=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
