//! CPU render backend
//!
//! Producers publish RGBA images through an `ImagePublisher`; the render
//! thread scales and rotates the latest image into each surface with
//! nearest-neighbour sampling. Useful on headless hosts and in tests.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::format::{Resolution, Rotation};
use super::queue::{FrameQueue, QueueError};
use super::render::{
    ImageWait, RenderBackend, RenderContext, SourceImage, SurfaceId, SurfaceKind,
};
use crate::error::{PipelineError, Result};

const BYTES_PER_PIXEL: usize = 4;

/// Pending images kept for the render thread; older ones are replaced
const SOURCE_DEPTH: usize = 1;

/// Producer handle for the software image source
#[derive(Clone)]
pub struct ImagePublisher {
    source: Arc<FrameQueue<SourceImage>>,
}

impl ImagePublisher {
    /// Publish a new image, replacing one the renderer has not picked up yet
    pub fn publish(&self, pixels: Bytes, resolution: Resolution, timestamp_ns: i64) -> Result<()> {
        let expected = resolution.pixels() as usize * BYTES_PER_PIXEL;
        if pixels.len() < expected {
            return Err(PipelineError::Render(format!(
                "image too small for {}: {} < {} bytes",
                resolution,
                pixels.len(),
                expected
            )));
        }
        let image = SourceImage {
            timestamp_ns,
            resolution,
            pixels,
        };
        if let Ok(Some(dropped)) = self.source.push_latest(image) {
            trace!("Replaced unrendered image ts={}", dropped.timestamp_ns);
        }
        Ok(())
    }
}

/// Software render backend
pub struct SoftwareBackend {
    source: Arc<FrameQueue<SourceImage>>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            source: Arc::new(FrameQueue::new(SOURCE_DEPTH)),
        }
    }

    pub fn publisher(&self) -> ImagePublisher {
        ImagePublisher {
            source: self.source.clone(),
        }
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for SoftwareBackend {
    fn create_context(&self, size: Resolution) -> Result<Box<dyn RenderContext>> {
        debug!("Creating software render context ({})", size);
        Ok(Box::new(SoftwareContext::new(size)))
    }

    fn await_new_image(&self, timeout: Option<Duration>) -> Result<ImageWait> {
        match self.source.pop(timeout) {
            Ok(image) => Ok(ImageWait::Ready(image)),
            Err(QueueError::Timeout) => Ok(ImageWait::TimedOut),
            Err(QueueError::Interrupted) => Ok(ImageWait::Interrupted),
            Err(QueueError::Closed) => Err(PipelineError::EndOfStream),
        }
    }

    fn interrupt(&self) {
        self.source.interrupt();
    }
}

struct SoftSurface {
    kind: SurfaceKind,
    resolution: Resolution,
    back: Vec<u8>,
    timestamp_ns: i64,
}

/// CPU rendering context
pub struct SoftwareContext {
    surfaces: HashMap<SurfaceId, SoftSurface>,
    current: Option<SurfaceId>,
    viewport: Resolution,
    next_id: u64,
}

impl SoftwareContext {
    pub fn new(viewport: Resolution) -> Self {
        Self {
            surfaces: HashMap::new(),
            current: None,
            viewport,
            next_id: 1,
        }
    }

    fn surface_mut(&mut self, surface: SurfaceId) -> Result<&mut SoftSurface> {
        self.surfaces
            .get_mut(&surface)
            .ok_or_else(|| PipelineError::Render(format!("unknown surface {:?}", surface)))
    }
}

impl RenderContext for SoftwareContext {
    fn create_surface(&mut self, kind: &SurfaceKind) -> Result<SurfaceId> {
        let resolution = kind.resolution();
        if resolution.pixels() == 0 {
            return Err(PipelineError::Render(format!(
                "cannot create {:?} surface with empty size",
                kind
            )));
        }
        let id = SurfaceId(self.next_id);
        self.next_id += 1;
        self.surfaces.insert(
            id,
            SoftSurface {
                kind: kind.clone(),
                resolution,
                back: vec![0; resolution.pixels() as usize * BYTES_PER_PIXEL],
                timestamp_ns: 0,
            },
        );
        debug!("Created software surface {:?} ({:?})", id, kind);
        Ok(id)
    }

    fn release_surface(&mut self, surface: SurfaceId) {
        if self.surfaces.remove(&surface).is_some() {
            debug!("Released software surface {:?}", surface);
        }
        if self.current == Some(surface) {
            self.current = None;
        }
    }

    fn surface_size(&self, surface: SurfaceId) -> Option<Resolution> {
        self.surfaces.get(&surface).map(|s| s.resolution)
    }

    fn make_current(&mut self, surface: SurfaceId) -> Result<()> {
        self.surface_mut(surface)?;
        self.current = Some(surface);
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Resolution) {
        self.viewport = viewport;
    }

    fn draw_image(&mut self, image: &SourceImage, rotation: Rotation) -> Result<()> {
        let current = self
            .current
            .ok_or_else(|| PipelineError::Render("no current surface".to_string()))?;
        let viewport = self.viewport;
        let surface = self.surface_mut(current)?;
        let width = viewport.width.min(surface.resolution.width);
        let height = viewport.height.min(surface.resolution.height);
        blit_rotated(
            &image.pixels,
            image.resolution,
            &mut surface.back,
            surface.resolution.width,
            Resolution::new(width, height),
            rotation,
        );
        Ok(())
    }

    fn set_presentation_time(&mut self, surface: SurfaceId, timestamp_ns: i64) {
        if let Some(surface) = self.surfaces.get_mut(&surface) {
            surface.timestamp_ns = timestamp_ns;
        }
    }

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<()> {
        let surface = self.surface_mut(surface)?;
        if let SurfaceKind::Window(target) = &surface.kind {
            target.present(&surface.back, surface.resolution, surface.timestamp_ns);
        }
        Ok(())
    }

    fn release(&mut self) {
        if !self.surfaces.is_empty() {
            debug!(
                "Releasing software context with {} live surfaces",
                self.surfaces.len()
            );
        }
        self.surfaces.clear();
        self.current = None;
    }
}

/// Scale `src` into the top-left `area` of `dst`, rotating clockwise.
fn blit_rotated(
    src: &[u8],
    src_size: Resolution,
    dst: &mut [u8],
    dst_stride_px: u32,
    area: Resolution,
    rotation: Rotation,
) {
    if src_size.pixels() == 0 || area.pixels() == 0 {
        return;
    }

    let rotated = if rotation.swaps_dimensions() {
        src_size.swapped()
    } else {
        src_size
    };
    let (sw, sh) = (src_size.width as u64, src_size.height as u64);

    for y in 0..area.height as u64 {
        let ry = y * rotated.height as u64 / area.height as u64;
        for x in 0..area.width as u64 {
            let rx = x * rotated.width as u64 / area.width as u64;
            let (sx, sy) = match rotation {
                Rotation::Deg0 => (rx, ry),
                Rotation::Deg90 => (ry, sh - 1 - rx),
                Rotation::Deg180 => (sw - 1 - rx, sh - 1 - ry),
                Rotation::Deg270 => (sw - 1 - ry, rx),
            };
            let s = ((sy * sw + sx) as usize) * BYTES_PER_PIXEL;
            let d = ((y * dst_stride_px as u64 + x) as usize) * BYTES_PER_PIXEL;
            dst[d..d + BYTES_PER_PIXEL].copy_from_slice(&src[s..s + BYTES_PER_PIXEL]);
        }
    }
}
