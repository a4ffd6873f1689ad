//! Frame data structures

use bytes::Bytes;
use std::time::Instant;

/// A timestamped media buffer handed between pipeline stages
///
/// Produced once (encoder output or depacketizer), consumed once (decoder or
/// packetizer). `Bytes` keeps the clone cheap when the same buffer must reach
/// several readers.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    /// Presentation timestamp in microseconds
    pub pts_us: i64,
    /// Codec configuration (SPS/PPS, AudioSpecificConfig), not presentable
    pub config: bool,
    /// Independently decodable frame
    pub key_frame: bool,
    /// When the frame entered the pipeline
    pub created_at: Instant,
}

impl Frame {
    pub fn new(data: Bytes, pts_us: i64) -> Self {
        Self {
            data,
            pts_us,
            config: false,
            key_frame: false,
            created_at: Instant::now(),
        }
    }

    /// Codec configuration frame
    pub fn config(data: Bytes) -> Self {
        Self {
            config: true,
            ..Self::new(data, 0)
        }
    }

    pub fn with_key_frame(mut self, key_frame: bool) -> Self {
        self.key_frame = key_frame;
        self
    }

    pub fn with_config(mut self, config: bool) -> Self {
        self.config = config;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Cheap clone of the underlying buffer
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time spent in the pipeline so far
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// Frame metadata without data (for logging)
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    pub size: usize,
    pub pts_us: i64,
    pub config: bool,
    pub key_frame: bool,
}

impl From<&Frame> for FrameMeta {
    fn from(frame: &Frame) -> Self {
        Self {
            size: frame.len(),
            pts_us: frame.pts_us,
            config: frame.config,
            key_frame: frame.key_frame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_frame_flags() {
        let frame = Frame::config(Bytes::from_static(&[0, 0, 0, 1, 0x67]));
        assert!(frame.config);
        assert!(!frame.key_frame);
        assert_eq!(frame.pts_us, 0);
        assert_eq!(frame.len(), 5);
    }

    #[test]
    fn meta_mirrors_frame() {
        let frame = Frame::new(Bytes::from_static(&[1, 2, 3]), 40_000).with_key_frame(true);
        let meta = FrameMeta::from(&frame);
        assert_eq!(meta.size, 3);
        assert_eq!(meta.pts_us, 40_000);
        assert!(meta.key_frame);
    }
}
