use common::env::env_or;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one stream engine. Every value can be overridden through a
/// `STREAM_*` environment variable.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bounded frame FIFO size; oldest frame is dropped when full
    pub buffer_capacity: usize,
    /// Upper bound on frames read during warm-up
    pub warmup_max_frames: u32,
    /// Frames always discarded before one can be accepted
    pub warmup_min_skip: u32,
    /// Luma variance below which a frame counts as solid gray/black
    pub min_variance: f64,
    /// No successful read for this long triggers a reconnect
    pub stale_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// JPEG quality 1-100
    pub jpeg_quality: u8,
    /// Pacing of `generate_frames`
    pub frame_interval: Duration,
    /// Consecutive empty reads before `generate_frames` ends
    pub max_empty_reads: u32,
    pub join_timeout: Duration,
    /// Total snapshot attempts
    pub snapshot_attempts: u32,
    pub snapshot_retry_delay: Duration,
    pub snapshot_dir: PathBuf,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: env_or::<usize>("STREAM_BUFFER_CAPACITY", 2).max(1),
            warmup_max_frames: env_or("STREAM_WARMUP_MAX_FRAMES", 30),
            warmup_min_skip: env_or("STREAM_WARMUP_MIN_SKIP", 5),
            min_variance: env_or("STREAM_MIN_VARIANCE", 50.0),
            stale_timeout: Duration::from_secs(env_or("STREAM_STALE_TIMEOUT_SECS", 10)),
            max_reconnect_attempts: env_or("STREAM_MAX_RECONNECT_ATTEMPTS", 5),
            reconnect_delay: Duration::from_millis(env_or("STREAM_RECONNECT_DELAY_MS", 2_000)),
            jpeg_quality: env_or::<u8>("STREAM_JPEG_QUALITY", 80).clamp(1, 100),
            frame_interval: Duration::from_millis(env_or("STREAM_FRAME_INTERVAL_MS", 35)),
            max_empty_reads: env_or("STREAM_MAX_EMPTY_READS", 100),
            join_timeout: Duration::from_millis(env_or("STREAM_JOIN_TIMEOUT_MS", 3_000)),
            snapshot_attempts: env_or::<u32>("STREAM_SNAPSHOT_ATTEMPTS", 3).max(1),
            snapshot_retry_delay: Duration::from_millis(env_or("STREAM_SNAPSHOT_RETRY_DELAY_MS", 500)),
            snapshot_dir: PathBuf::from(
                env::var("STREAM_SNAPSHOT_DIR").unwrap_or_else(|_| "./snapshots".to_string()),
            ),
        }
    }
}
