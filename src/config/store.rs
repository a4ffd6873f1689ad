use std::path::Path;
use tracing::debug;

use super::StreamCoreConfig;
use crate::error::{PipelineError, Result};

fn parse(bytes: &[u8]) -> Result<StreamCoreConfig> {
    serde_json::from_slice(bytes).map_err(|e| PipelineError::Config(e.to_string()))
}

/// Load a JSON configuration file. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<StreamCoreConfig> {
    match std::fs::read(path) {
        Ok(bytes) => parse(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No configuration at {}, using defaults", path.display());
            Ok(StreamCoreConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, StreamCoreConfig::default());
    }

    #[test]
    fn invalid_json_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(load(&path), Err(PipelineError::Config(_))));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, br#"{ "mjpeg": { "port": 9000 }, "rtsp": { "max_retries": 5 } }"#)
            .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.mjpeg.port, 9000);
        assert_eq!(config.rtsp.max_retries, 5);
        assert_eq!(config.packetizer, StreamCoreConfig::default().packetizer);
    }
}
