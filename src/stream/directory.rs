//! JPEG encoder that replays a directory of `.jpg` files

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::mjpeg::{JpegEncoder, JpegSink};
use crate::error::{PipelineError, Result};
use crate::utils::{WorkerThread, TERMINATE_TIMEOUT};

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

/// Loads every JPEG in `dir`, sorted by file name
pub fn load_jpegs(dir: &Path) -> Result<Vec<Bytes>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_jpeg(path))
        .collect();
    paths.sort();

    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        let data = std::fs::read(&path)?;
        if data.len() < 4 || data[..2] != [0xff, 0xd8] {
            warn!("Skipping {}: not a JPEG", path.display());
            continue;
        }
        frames.push(Bytes::from(data));
    }
    Ok(frames)
}

/// Replays JPEG files at a fixed rate on a worker thread
pub struct DirectoryEncoder {
    dir: PathBuf,
    fps: u32,
    running: Arc<AtomicBool>,
    worker: Option<WorkerThread>,
}

impl DirectoryEncoder {
    pub fn new(dir: impl Into<PathBuf>, fps: u32) -> Self {
        Self {
            dir: dir.into(),
            fps: fps.max(1),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl JpegEncoder for DirectoryEncoder {
    fn start(&mut self, sink: JpegSink) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let frames = load_jpegs(&self.dir)?;
        if frames.is_empty() {
            return Err(PipelineError::Config(format!(
                "no JPEG files in {}",
                self.dir.display()
            )));
        }
        info!(
            "Replaying {} JPEGs from {} at {} fps",
            frames.len(),
            self.dir.display(),
            self.fps
        );

        let interval = Duration::from_secs(1) / self.fps;
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        self.worker = Some(WorkerThread::spawn("mjpeg-directory", move || {
            let mut next = Instant::now();
            for frame in frames.iter().cycle() {
                if !running.load(Ordering::SeqCst) || !sink.offer(frame.clone()) {
                    break;
                }
                next += interval;
                let now = Instant::now();
                if next > now {
                    std::thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
            debug!("Directory encoder thread exiting");
        })?);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            // Stopped from our own thread when its offer dropped the last client
            if std::thread::current().name() == Some(worker.name()) {
                return;
            }
            worker.join_timeout(TERMINATE_TIMEOUT);
        }
    }
}

impl Drop for DirectoryEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}
