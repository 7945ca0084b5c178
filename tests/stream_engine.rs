mod support;

use anyhow::Result;
use common::TransportMode;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use stream_node::snapshot::{capture_image, FrameProvider, SnapshotPolicy};
use stream_node::{Frame, SnapshotError, StreamConfig, StreamEngine, StreamState};
use support::{gray_frame, textured_frame, SourceScript};
use tokio_stream::StreamExt;

fn fast_config() -> StreamConfig {
    StreamConfig {
        warmup_max_frames: 10,
        warmup_min_skip: 2,
        stale_timeout: Duration::from_millis(200),
        max_reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(5),
        frame_interval: Duration::from_millis(5),
        max_empty_reads: 20,
        join_timeout: Duration::from_secs(2),
        ..StreamConfig::default()
    }
}

fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[test]
fn test_start_streams_and_stop_releases() {
    let script = SourceScript::new();
    let engine = StreamEngine::new("CAM-01", TransportMode::Tcp, fast_config(), script.factory());

    assert!(engine.start("rtsp://10.0.0.5/live"));
    assert!(engine.is_streaming());
    assert!(wait_until(Duration::from_secs(2), || engine.stats().frames_total > 5));

    let jpeg = engine.get_frame_jpeg().unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    assert!(engine.stats().buffered <= 2);

    engine.stop();
    assert!(!engine.is_streaming());
    assert_eq!(engine.state(), StreamState::Stopped);
    assert_eq!(script.releases.load(Ordering::SeqCst), 1);

    engine.stop();
    assert_eq!(script.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reconnect_gives_up_after_max_attempts() {
    let script = SourceScript::failing();
    let config = fast_config();
    let max = config.max_reconnect_attempts as usize;
    let engine = StreamEngine::new("CAM-02", TransportMode::Tcp, config, script.factory());

    assert!(!engine.start("rtsp://10.0.0.5/live"));
    assert!(wait_until(Duration::from_secs(2), || engine.state() == StreamState::Failed));
    assert!(!engine.is_streaming());

    // the initial open plus one per reconnect attempt, then nothing more
    assert_eq!(script.opens(), 1 + max);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(script.opens(), 1 + max);

    // a fresh start resets the budget
    script.fail_open.store(false, Ordering::SeqCst);
    assert!(engine.start("rtsp://10.0.0.5/live"));
    assert!(engine.is_streaming());
    engine.stop();
}

#[test]
fn test_read_error_triggers_reconnect() {
    let script = SourceScript::new();
    let engine = StreamEngine::new("CAM-03", TransportMode::Udp, fast_config(), script.factory());
    assert!(engine.start("rtsp://10.0.0.5/live"));
    assert_eq!(script.opens(), 1);

    script.fail_next_read.store(true, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(2), || script.opens() == 2
        && engine.is_streaming()));
    let frames = engine.stats().frames_total;
    assert!(wait_until(Duration::from_secs(2), || engine.stats().frames_total > frames));
    assert_eq!(engine.stats().reconnect_attempts, 0);
    engine.stop();
}

#[test]
fn test_stale_stream_is_reopened() {
    let script = SourceScript::new();
    let engine = StreamEngine::new("CAM-04", TransportMode::Tcp, fast_config(), script.factory());
    assert!(engine.start("rtsp://10.0.0.5/live"));

    script.starve.store(true, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(3), || script.opens() >= 2));
    engine.stop();
}

#[tokio::test]
async fn test_frame_stream_ends_after_empty_reads() -> Result<()> {
    let script = SourceScript::new();
    let engine = Arc::new(StreamEngine::new(
        "CAM-05",
        TransportMode::Tcp,
        fast_config(),
        script.factory(),
    ));
    let starting = Arc::clone(&engine);
    assert!(tokio::task::spawn_blocking(move || starting.start("rtsp://10.0.0.5/live")).await?);

    let mut parts = engine.generate_frames();
    let first = parts.next().await.unwrap();
    assert!(first.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
    assert!(first.ends_with(b"\r\n"));

    let stopping = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    // no new frames after stop: the stream drains and terminates
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while parts.next().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_frame_stream_survives_a_stall() -> Result<()> {
    let script = SourceScript::new();
    let config = StreamConfig {
        stale_timeout: Duration::from_secs(10),
        max_empty_reads: 5,
        ..fast_config()
    };
    let engine = Arc::new(StreamEngine::new("CAM-07", TransportMode::Tcp, config, script.factory()));
    let starting = Arc::clone(&engine);
    assert!(tokio::task::spawn_blocking(move || starting.start("rtsp://10.0.0.5/live")).await?);

    // connected but silent, well inside the stale timeout
    script.starve.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut parts = engine.generate_frames();
    assert!(parts.next().await.is_some());
    // far longer than max_empty_reads * frame_interval: the stream stays open
    let waited = tokio::time::timeout(Duration::from_millis(500), parts.next()).await;
    assert!(waited.is_err(), "frame stream ended during a stall");
    assert_eq!(engine.state(), StreamState::Streaming);

    script.starve.store(false, Ordering::SeqCst);
    let resumed = tokio::time::timeout(Duration::from_secs(2), parts.next()).await?;
    assert!(resumed.is_some());

    let stopping = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;
    Ok(())
}

#[cfg(unix)]
mod silent_decoder {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use stream_node::{FfmpegSource, SourceFactory, VideoSource};

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// ffprobe reports a stream, ffmpeg connects and never writes a byte.
    fn silent_factory(dir: &Path) -> SourceFactory {
        let ffprobe = script(dir, "ffprobe", r#"echo '{"streams":[{"width":32,"height":24}]}'"#);
        let ffmpeg = script(dir, "ffmpeg", "exec sleep 1000");
        Arc::new(move || {
            Box::new(
                FfmpegSource::new(Duration::from_secs(5)).with_programs(&ffprobe, &ffmpeg),
            ) as Box<dyn VideoSource>
        })
    }

    fn silent_config() -> StreamConfig {
        StreamConfig {
            stale_timeout: Duration::from_millis(300),
            max_reconnect_attempts: 2,
            join_timeout: Duration::from_millis(500),
            ..fast_config()
        }
    }

    #[test]
    fn test_silent_decoder_goes_stale_and_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StreamEngine::new(
            "CAM-08",
            TransportMode::Tcp,
            silent_config(),
            silent_factory(dir.path()),
        );

        let started = Instant::now();
        assert!(engine.start("rtsp://10.0.0.5/live"));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(engine.last_frame().is_none());

        assert!(wait_until(Duration::from_secs(10), || engine.state() == StreamState::Failed));
        assert_eq!(engine.stats().frames_total, 0);

        let stopping = Instant::now();
        engine.stop();
        assert!(stopping.elapsed() < Duration::from_secs(2));
        assert_eq!(engine.state(), StreamState::Stopped);
    }

    #[test]
    fn test_stop_does_not_wait_on_a_silent_read() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StreamEngine::new(
            "CAM-09",
            TransportMode::Tcp,
            StreamConfig {
                stale_timeout: Duration::from_secs(1),
                ..silent_config()
            },
            silent_factory(dir.path()),
        );

        // warm-up gives up after the stale timeout; the decoder stays open
        assert!(engine.start("rtsp://10.0.0.5/live"));
        assert_eq!(engine.state(), StreamState::Streaming);

        let stopping = Instant::now();
        engine.stop();
        assert!(stopping.elapsed() < Duration::from_millis(500));
        assert!(!engine.is_streaming());
    }
}

/// Hands out a fixed sequence of frames, repeating the last one.
struct Sequence(Mutex<Vec<Option<Frame>>>);

impl FrameProvider for Sequence {
    fn current_frame(&self) -> Option<Frame> {
        let mut frames = self.0.lock().unwrap();
        if frames.len() > 1 {
            frames.remove(0)
        } else {
            frames.first().cloned().flatten()
        }
    }
}

fn policy(dir: &std::path::Path) -> SnapshotPolicy {
    SnapshotPolicy {
        attempts: 3,
        retry_delay: Duration::from_millis(1),
        min_variance: 50.0,
        jpeg_quality: 80,
        dir: dir.to_path_buf(),
    }
}

#[tokio::test]
async fn test_snapshot_retries_past_gray_frames() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let provider = Sequence(Mutex::new(vec![
        Some(gray_frame(32, 24)),
        Some(gray_frame(32, 24)),
        Some(textured_frame(32, 24)),
    ]));

    let outcome = capture_image(&provider, "CAM-01", "north gate", &policy(dir.path())).await?;
    assert_eq!(outcome.retries, 2);
    assert!(outcome.path.exists());
    let name = outcome.path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("CAM-01_north_gate_"), "{name}");
    assert!(name.ends_with(".jpg"));
    assert_eq!(std::fs::read(&outcome.path)?.len(), outcome.bytes);
    Ok(())
}

#[tokio::test]
async fn test_snapshot_fails_when_every_frame_is_gray() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let provider = Sequence(Mutex::new(vec![Some(gray_frame(32, 24))]));

    let err = capture_image(&provider, "CAM-01", "yard", &policy(dir.path()))
        .await
        .unwrap_err();
    assert_eq!(err, SnapshotError::GrayFrameAfterRetries { attempts: 3 });
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_engine_snapshot_uses_last_frame() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = SourceScript::new();
    let config = StreamConfig {
        snapshot_dir: dir.path().to_path_buf(),
        ..fast_config()
    };
    let engine = Arc::new(StreamEngine::new("CAM-06", TransportMode::Tcp, config, script.factory()));
    let starting = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || starting.start("rtsp://10.0.0.5/live")).await?;

    let outcome = engine.capture_image("CAM-06", "dock").await?;
    assert_eq!(outcome.retries, 0);
    assert_eq!(outcome.resolution.width, 32);

    let stopping = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;
    Ok(())
}
