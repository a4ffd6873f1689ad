//! Rendering capability traits
//!
//! The broadcaster never talks to a graphics API directly. A `RenderBackend`
//! owns the image source and creates a `RenderContext`; the context owns
//! every drawing surface and is addressed by `SurfaceId`, the same way an
//! EGL display owns its window and pbuffer surfaces.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::format::{Resolution, Rotation};
use crate::error::Result;

/// Opaque sink identifier chosen by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SinkTag(String);

impl SinkTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SinkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SinkTag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Handle to a surface owned by a `RenderContext`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// Consumer of a window surface's presented frames
///
/// On a GPU backend this is the native window; the software backend hands
/// it the RGBA pixels at every buffer swap.
pub trait SurfaceTarget: Send + Sync {
    fn resolution(&self) -> Resolution;

    /// Called on the render thread at buffer swap. Must not block.
    fn present(&self, rgba: &[u8], resolution: Resolution, timestamp_ns: i64);
}

/// What kind of surface a sink draws into
#[derive(Clone)]
pub enum SurfaceKind {
    /// Surface backed by an external target (screen, encoder input)
    Window(Arc<dyn SurfaceTarget>),
    /// Off-screen buffer
    Offscreen(Resolution),
}

impl SurfaceKind {
    pub fn resolution(&self) -> Resolution {
        match self {
            SurfaceKind::Window(target) => target.resolution(),
            SurfaceKind::Offscreen(resolution) => *resolution,
        }
    }
}

impl fmt::Debug for SurfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceKind::Window(target) => write!(f, "Window({})", target.resolution()),
            SurfaceKind::Offscreen(resolution) => write!(f, "Offscreen({})", resolution),
        }
    }
}

/// Latest image published by the source
#[derive(Debug, Clone)]
pub struct SourceImage {
    /// Source timestamp (nanoseconds), stamped on every sink
    pub timestamp_ns: i64,
    pub resolution: Resolution,
    /// Tightly packed RGBA pixels. GPU backends that sample a texture
    /// directly leave this empty.
    pub pixels: Bytes,
}

/// Result of waiting on the image source
#[derive(Debug)]
pub enum ImageWait {
    Ready(SourceImage),
    TimedOut,
    /// Woken by `RenderBackend::interrupt`
    Interrupted,
}

/// Graphics API bound to one render thread
pub trait RenderContext: Send {
    fn create_surface(&mut self, kind: &SurfaceKind) -> Result<SurfaceId>;

    fn release_surface(&mut self, surface: SurfaceId);

    fn surface_size(&self, surface: SurfaceId) -> Option<Resolution>;

    fn make_current(&mut self, surface: SurfaceId) -> Result<()>;

    fn set_viewport(&mut self, viewport: Resolution);

    /// Draw the image into the current surface
    fn draw_image(&mut self, image: &SourceImage, rotation: Rotation) -> Result<()>;

    fn set_presentation_time(&mut self, surface: SurfaceId, timestamp_ns: i64);

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<()>;

    /// Release the context itself. Surfaces must be released first.
    fn release(&mut self);
}

/// Factory for render contexts plus the image source they draw from
pub trait RenderBackend: Send + Sync {
    fn create_context(&self, size: Resolution) -> Result<Box<dyn RenderContext>>;

    /// Block until a new image is available. `None` waits forever.
    fn await_new_image(&self, timeout: Option<Duration>) -> Result<ImageWait>;

    /// Wake a pending `await_new_image`
    fn interrupt(&self);
}

/// A registered rendering target
#[derive(Debug)]
pub struct Sink {
    tag: SinkTag,
    kind: SurfaceKind,
    surface: Option<SurfaceId>,
}

impl Sink {
    pub fn new(tag: impl Into<SinkTag>, kind: SurfaceKind) -> Self {
        Self {
            tag: tag.into(),
            kind,
            surface: None,
        }
    }

    pub fn tag(&self) -> &SinkTag {
        &self.tag
    }

    pub fn kind(&self) -> &SurfaceKind {
        &self.kind
    }

    pub fn surface(&self) -> Option<SurfaceId> {
        self.surface
    }

    pub fn is_initialized(&self) -> bool {
        self.surface.is_some()
    }

    /// Create the backing surface in `ctx`
    pub fn init(&mut self, ctx: &mut dyn RenderContext) -> Result<()> {
        if self.surface.is_none() {
            self.surface = Some(ctx.create_surface(&self.kind)?);
        }
        Ok(())
    }

    /// Release the backing surface
    pub fn release(&mut self, ctx: &mut dyn RenderContext) {
        if let Some(surface) = self.surface.take() {
            ctx.release_surface(surface);
        }
    }
}

impl From<String> for SinkTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}
