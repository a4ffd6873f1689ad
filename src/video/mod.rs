//! Video rendering and frame hand-off
//!
//! Frames move between stage threads through bounded `FrameQueue`s. The
//! `SurfaceBroadcaster` draws one source into many sinks through a pluggable
//! `RenderBackend`.

pub mod broadcaster;
pub mod format;
pub mod frame;
pub mod queue;
pub mod render;
pub mod software;

pub use broadcaster::{DrawingListener, DrawingState, DrawnFrame, ListenerId, SurfaceBroadcaster};
pub use format::{Resolution, Rotation};
pub use frame::{Frame, FrameMeta};
pub use queue::{FrameQueue, PushError, QueueError};
pub use render::{
    ImageWait, RenderBackend, RenderContext, Sink, SinkTag, SourceImage, SurfaceId, SurfaceKind,
    SurfaceTarget,
};
pub use software::{ImagePublisher, SoftwareBackend, SoftwareContext};
