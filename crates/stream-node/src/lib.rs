//! Per-camera decode sessions: capture thread, bounded frame buffer, MJPEG
//! part generation and quality-gated snapshots.

pub mod buffer;
pub mod config;
pub mod engine;
pub mod ffmpeg;
pub mod frame;
pub mod mjpeg;
pub mod snapshot;
pub mod source;

pub use buffer::FrameBuffer;
pub use config::StreamConfig;
pub use engine::{StreamEngine, StreamState, StreamStats};
pub use ffmpeg::FfmpegSource;
pub use frame::Frame;
pub use mjpeg::{mjpeg_content_type, multipart_chunk};
pub use snapshot::{FrameProvider, SnapshotError, SnapshotOutcome, SnapshotPolicy};
pub use source::{DecodeError, Interrupter, SourceFactory, VideoSource};
