//! Quality-gated evidentiary snapshots.

use crate::config::StreamConfig;
use crate::frame::Frame;
use chrono::{DateTime, Local};
use common::validation::sanitize_file_component;
use common::Resolution;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use telemetry::metrics::SNAPSHOTS_TOTAL;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Source of the frame a snapshot is taken from.
pub trait FrameProvider {
    fn current_frame(&self) -> Option<Frame>;
}

#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    /// Total attempts, first one included
    pub attempts: u32,
    pub retry_delay: Duration,
    pub min_variance: f64,
    pub jpeg_quality: u8,
    pub dir: PathBuf,
}

impl From<&StreamConfig> for SnapshotPolicy {
    fn from(config: &StreamConfig) -> Self {
        Self {
            attempts: config.snapshot_attempts.max(1),
            retry_delay: config.snapshot_retry_delay,
            min_variance: config.min_variance,
            jpeg_quality: config.jpeg_quality,
            dir: config.snapshot_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotOutcome {
    pub path: PathBuf,
    /// Attempts rejected before the saved one
    pub retries: u32,
    pub bytes: usize,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    #[error("no frame available after {attempts} attempts")]
    NoFrame { attempts: u32 },
    #[error("frame still solid gray after {attempts} attempts")]
    GrayFrameAfterRetries { attempts: u32 },
    #[error("failed to write snapshot {path:?}: {reason}")]
    WriteError { path: PathBuf, reason: String },
}

impl SnapshotError {
    pub fn kind(&self) -> &'static str {
        match self {
            SnapshotError::NoFrame { .. } => "no_frame",
            SnapshotError::GrayFrameAfterRetries { .. } => "gray_frame",
            SnapshotError::WriteError { .. } => "write_error",
        }
    }
}

/// `{code}_{location}_{YYYYMMDD}_{HHMMSS}.jpg` with path-unsafe characters replaced.
pub fn snapshot_file_name(camera_code: &str, location: &str, at: DateTime<Local>) -> String {
    format!(
        "{}_{}_{}.jpg",
        sanitize_file_component(camera_code),
        sanitize_file_component(location),
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Persist the provider's current frame once it passes the solid-color check,
/// retrying up to `policy.attempts` times.
pub async fn capture_image(
    provider: &(dyn FrameProvider + Sync),
    camera_code: &str,
    location: &str,
    policy: &SnapshotPolicy,
) -> Result<SnapshotOutcome, SnapshotError> {
    let result = capture_inner(provider, camera_code, location, policy).await;
    match &result {
        Ok(outcome) => {
            SNAPSHOTS_TOTAL.with_label_values(&["saved"]).inc();
            info!(
                camera = %camera_code,
                path = %outcome.path.display(),
                retries = outcome.retries,
                "snapshot saved"
            );
        }
        Err(e) => {
            SNAPSHOTS_TOTAL.with_label_values(&[e.kind()]).inc();
            warn!(camera = %camera_code, error = %e, "snapshot failed");
        }
    }
    result
}

async fn capture_inner(
    provider: &(dyn FrameProvider + Sync),
    camera_code: &str,
    location: &str,
    policy: &SnapshotPolicy,
) -> Result<SnapshotOutcome, SnapshotError> {
    let attempts = policy.attempts.max(1);
    let mut saw_gray = false;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.retry_delay).await;
        }
        match provider.current_frame() {
            None => debug!(camera = %camera_code, attempt, "no frame for snapshot yet"),
            Some(frame) if frame.is_solid(policy.min_variance) => {
                saw_gray = true;
                debug!(camera = %camera_code, attempt, "snapshot frame is solid color");
            }
            Some(frame) => return persist(&frame, camera_code, location, policy, attempt).await,
        }
    }

    Err(if saw_gray {
        SnapshotError::GrayFrameAfterRetries { attempts }
    } else {
        SnapshotError::NoFrame { attempts }
    })
}

async fn persist(
    frame: &Frame,
    camera_code: &str,
    location: &str,
    policy: &SnapshotPolicy,
    retries: u32,
) -> Result<SnapshotOutcome, SnapshotError> {
    let path = policy
        .dir
        .join(snapshot_file_name(camera_code, location, Local::now()));
    let write_error = |reason: String| SnapshotError::WriteError {
        path: path.clone(),
        reason,
    };

    let jpeg = frame
        .encode_jpeg(policy.jpeg_quality)
        .map_err(|e| write_error(format!("{:#}", e)))?;
    tokio::fs::create_dir_all(&policy.dir)
        .await
        .map_err(|e| write_error(e.to_string()))?;
    tokio::fs::write(&path, &jpeg)
        .await
        .map_err(|e| write_error(e.to_string()))?;

    Ok(SnapshotOutcome {
        path,
        retries,
        bytes: jpeg.len(),
        resolution: frame.resolution(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_is_deterministic_and_safe() {
        let at = Local.with_ymd_and_hms(2024, 5, 17, 8, 3, 9).unwrap();
        assert_eq!(
            snapshot_file_name("CAM-01", "gate/north", at),
            "CAM-01_gate_north_20240517_080309.jpg"
        );
        assert_eq!(
            snapshot_file_name("", "..", at),
            "unknown____20240517_080309.jpg"
        );
    }

    struct Nothing;

    impl FrameProvider for Nothing {
        fn current_frame(&self) -> Option<Frame> {
            None
        }
    }

    #[tokio::test]
    async fn empty_provider_reports_no_frame() {
        let dir = tempfile::tempdir().unwrap();
        let policy = SnapshotPolicy {
            attempts: 3,
            retry_delay: Duration::from_millis(1),
            min_variance: 50.0,
            jpeg_quality: 80,
            dir: dir.path().to_path_buf(),
        };
        assert_eq!(
            capture_image(&Nothing, "CAM", "bay", &policy).await,
            Err(SnapshotError::NoFrame { attempts: 3 })
        );
    }
}
