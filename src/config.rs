use anyhow::{bail, Context, Result};
use common::validation::{
    validate_credentials, validate_length, validate_non_empty, MAX_ID_LENGTH,
};
use common::CameraCredentials;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One camera entry from the cameras file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CameraDefinition {
    /// Registry key; also the first component of snapshot file names
    pub code: String,
    #[serde(default)]
    pub location: String,
    #[serde(flatten)]
    pub credentials: CameraCredentials,
}

#[derive(Debug, Deserialize)]
struct CamerasFile {
    #[serde(default)]
    cameras: Vec<CameraDefinition>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub cameras_file: PathBuf,
    /// How often stream stats are logged
    pub stats_interval: Duration,
    /// Prometheus textfile rewritten on every stats tick
    pub metrics_file: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let cameras_file = std::env::var("CAMERAS_FILE")
            .unwrap_or_else(|_| "./cameras.yaml".to_string())
            .into();
        let stats_interval = std::env::var("STATS_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let metrics_file = std::env::var("METRICS_FILE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Self {
            cameras_file,
            stats_interval: Duration::from_secs(stats_interval.max(1)),
            metrics_file,
        }
    }
}

/// Parse and validate a cameras document. Codes must be unique.
pub fn parse_cameras(yaml: &str) -> Result<Vec<CameraDefinition>> {
    let file: CamerasFile = serde_yaml::from_str(yaml).context("invalid cameras file")?;

    let mut seen = HashSet::new();
    for camera in &file.cameras {
        validate_non_empty(&camera.code, "camera code")?;
        validate_length(&camera.code, MAX_ID_LENGTH, "camera code")?;
        validate_credentials(&camera.credentials)
            .with_context(|| format!("camera {}", camera.code))?;
        if !seen.insert(camera.code.as_str()) {
            bail!("duplicate camera code: {}", camera.code);
        }
    }
    Ok(file.cameras)
}

pub fn load_cameras(path: &Path) -> Result<Vec<CameraDefinition>> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cameras file {}", path.display()))?;
    parse_cameras(&yaml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{StreamTier, TransportMode};

    #[test]
    fn parses_flattened_credentials() {
        let yaml = r#"
cameras:
  - code: CAM-01
    location: gate
    ip: 10.0.0.5
    port: 8899
    username: admin
    password: secret
  - code: NVR-03
    ip: 10.0.0.9
    onvif_port: 80
    channel_id: 3
    stream_tier: sub
    transport: udp
"#;
        let cameras = parse_cameras(yaml).unwrap();
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0].credentials.port, 8899);
        assert_eq!(cameras[0].credentials.username, "admin");
        assert_eq!(cameras[1].location, "");
        assert_eq!(cameras[1].credentials.port, 80);
        assert_eq!(cameras[1].credentials.onvif_port, Some(80));
        assert_eq!(cameras[1].credentials.channel_id, Some(3));
        assert_eq!(cameras[1].credentials.stream_tier, StreamTier::Sub);
        assert_eq!(cameras[1].credentials.transport, TransportMode::Udp);
    }

    #[test]
    fn rejects_duplicate_codes() {
        let yaml = "cameras:\n  - {code: A, ip: 10.0.0.1}\n  - {code: A, ip: 10.0.0.2}\n";
        assert!(parse_cameras(yaml).is_err());
    }

    #[test]
    fn empty_document_has_no_cameras() {
        assert!(parse_cameras("cameras: []").unwrap().is_empty());
    }
}
