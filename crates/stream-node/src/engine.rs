//! Per-camera stream engine.
//!
//! One dedicated OS thread runs the blocking capture loop against a
//! [`VideoSource`]. Decoded frames land in a "last frame" slot and a small
//! drop-oldest [`FrameBuffer`]; consumers pull from those without blocking
//! the producer. Read failures and stale streams trigger a bounded number of
//! reconnects, after which the engine parks in [`StreamState::Failed`] until
//! `start()` is called again.

use crate::buffer::FrameBuffer;
use crate::config::StreamConfig;
use crate::frame::Frame;
use crate::mjpeg::multipart_chunk;
use crate::snapshot::{self, FrameProvider, SnapshotError, SnapshotOutcome, SnapshotPolicy};
use crate::source::{Interrupter, SourceFactory, VideoSource};
use common::{Resolution, TransportMode};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use telemetry::metrics::{
    STREAMS_ACTIVE, STREAM_FRAMES_TOTAL, STREAM_GIVE_UPS_TOTAL, STREAM_RECONNECTS_TOTAL,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Poll granularity for stop checks while idling or waiting to reconnect.
const IDLE_SLICE: Duration = Duration::from_millis(10);
const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Stopped,
    Starting,
    Streaming,
    Reconnecting,
    /// Reconnect budget exhausted; only `start()` leaves this state
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStats {
    pub camera: String,
    pub state: StreamState,
    pub streaming: bool,
    pub resolution: Option<Resolution>,
    pub fps: f64,
    pub frames_total: u64,
    pub reconnect_attempts: u32,
    pub last_frame_age_ms: Option<u64>,
    pub buffered: usize,
}

#[derive(Debug)]
struct Counters {
    resolution: Option<Resolution>,
    fps: f64,
    frames_total: u64,
    reconnect_attempts: u32,
    last_frame_at: Option<Instant>,
    window_start: Instant,
    window_frames: u32,
}

impl Counters {
    fn new() -> Self {
        Self {
            resolution: None,
            fps: 0.0,
            frames_total: 0,
            reconnect_attempts: 0,
            last_frame_at: None,
            window_start: Instant::now(),
            window_frames: 0,
        }
    }
}

/// State shared between the engine handle and its capture thread. Writes from
/// a capture thread are ignored once a newer `start()` has bumped the
/// generation.
struct Shared {
    generation: AtomicU64,
    state: Mutex<StreamState>,
    decoder_open: AtomicBool,
    last_frame: Mutex<Option<Frame>>,
    buffer: FrameBuffer,
    counters: Mutex<Counters>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn new(buffer_capacity: usize) -> Self {
        Self {
            generation: AtomicU64::new(0),
            state: Mutex::new(StreamState::Stopped),
            decoder_open: AtomicBool::new(false),
            last_frame: Mutex::new(None),
            buffer: FrameBuffer::new(buffer_capacity),
            counters: Mutex::new(Counters::new()),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    fn set_state(&self, generation: u64, state: StreamState) {
        if self.is_current(generation) {
            *lock(&self.state) = state;
        }
    }

    fn set_open(&self, generation: u64, open: bool) {
        if self.is_current(generation) {
            self.decoder_open.store(open, Ordering::SeqCst);
        }
    }

    fn set_attempts(&self, generation: u64, attempts: u32) {
        if self.is_current(generation) {
            lock(&self.counters).reconnect_attempts = attempts;
        }
    }

    /// Overwrite the last-frame slot, push into the buffer, update stats.
    fn publish(&self, generation: u64, frame: Frame) {
        if !self.is_current(generation) {
            return;
        }
        let resolution = frame.resolution();
        self.buffer.push(frame.clone());
        *lock(&self.last_frame) = Some(frame);
        STREAM_FRAMES_TOTAL.inc();

        let mut counters = lock(&self.counters);
        let now = Instant::now();
        counters.resolution = Some(resolution);
        counters.frames_total += 1;
        counters.reconnect_attempts = 0;
        counters.last_frame_at = Some(now);
        counters.window_frames += 1;
        let window = now.duration_since(counters.window_start);
        if window >= Duration::from_secs(1) {
            counters.fps = f64::from(counters.window_frames) / window.as_secs_f64();
            counters.window_frames = 0;
            counters.window_start = now;
        }
    }

    fn reset(&self) {
        self.buffer.clear();
        *lock(&self.last_frame) = None;
        *lock(&self.counters) = Counters::new();
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    source: Arc<Mutex<Box<dyn VideoSource>>>,
    interrupt: Option<Interrupter>,
}

/// Decode session for one camera.
pub struct StreamEngine {
    camera: String,
    transport: TransportMode,
    config: StreamConfig,
    factory: SourceFactory,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl StreamEngine {
    pub fn new(
        camera: impl Into<String>,
        transport: TransportMode,
        config: StreamConfig,
        factory: SourceFactory,
    ) -> Self {
        let shared = Arc::new(Shared::new(config.buffer_capacity));
        Self {
            camera: camera.into(),
            transport,
            config,
            factory,
            shared,
            worker: Mutex::new(None),
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Stop any previous session, open a fresh decoder on `uri`, warm up and
    /// spawn the capture loop. Returns whether the engine is streaming.
    ///
    /// Blocks for the warm-up reads; call from a blocking context.
    pub fn start(&self, uri: &str) -> bool {
        self.stop();

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.reset();
        self.shared.set_state(generation, StreamState::Starting);

        let mut source = (self.factory)();
        let interrupt = source.interrupter();
        match source.open(uri, self.transport) {
            Ok(()) => {
                if let Some(frame) = self.warm_up(source.as_mut()) {
                    self.shared.publish(generation, frame);
                }
            }
            Err(e) => warn!(camera = %self.camera, error = %e, "initial decoder open failed"),
        }

        let open = source.is_open();
        self.shared.set_open(generation, open);
        self.shared.set_state(
            generation,
            if open {
                StreamState::Streaming
            } else {
                StreamState::Reconnecting
            },
        );

        let source = Arc::new(Mutex::new(source));
        let stop = Arc::new(AtomicBool::new(false));
        let capture = CaptureLoop {
            camera: self.camera.clone(),
            uri: uri.to_string(),
            transport: self.transport,
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            source: Arc::clone(&source),
            stop: Arc::clone(&stop),
            generation,
        };

        let spawned = thread::Builder::new()
            .name(format!("capture-{}", self.camera))
            .spawn(move || capture.run());
        match spawned {
            Ok(handle) => {
                *lock(&self.worker) = Some(Worker {
                    stop,
                    handle,
                    source,
                    interrupt,
                });
            }
            Err(e) => {
                warn!(camera = %self.camera, error = %e, "failed to spawn capture thread");
                lock(&source).release();
                self.shared.set_open(generation, false);
                self.shared.set_state(generation, StreamState::Failed);
                return false;
            }
        }

        info!(camera = %self.camera, streaming = open, "stream engine started");
        open
    }

    /// Read up to `warmup_max_frames`, accepting the first non-solid frame
    /// after `warmup_min_skip` frames have been discarded. A decoder that
    /// produces nothing ends warm-up after `stale_timeout`.
    fn warm_up(&self, source: &mut dyn VideoSource) -> Option<Frame> {
        let deadline = Instant::now() + self.config.stale_timeout;
        let mut index = 0;
        while index < self.config.warmup_max_frames && source.is_open() {
            match source.read() {
                Ok(Some(frame)) => {
                    index += 1;
                    if index > self.config.warmup_min_skip
                        && !frame.is_solid(self.config.min_variance)
                    {
                        debug!(camera = %self.camera, frames = index, "warm-up accepted frame");
                        return Some(frame);
                    }
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        debug!(camera = %self.camera, "no frames during warm-up");
                        break;
                    }
                    thread::sleep(IDLE_SLICE);
                }
                Err(e) => {
                    debug!(camera = %self.camera, error = %e, "read failed during warm-up");
                    break;
                }
            }
        }
        debug!(camera = %self.camera, "warm-up ended without an accepted frame");
        None
    }

    /// Signal the capture loop, join with a bounded timeout and release the
    /// decoder. Idempotent.
    pub fn stop(&self) {
        let worker = lock(&self.worker).take();
        let generation = self.shared.generation.load(Ordering::SeqCst);

        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::SeqCst);
            let mut finished = self.join_within(&worker.handle);
            if !finished {
                if let Some(interrupt) = &worker.interrupt {
                    debug!(camera = %self.camera, "capture thread busy; interrupting decoder");
                    interrupt();
                    finished = self.join_within(&worker.handle);
                }
            }
            if finished {
                if worker.handle.join().is_err() {
                    warn!(camera = %self.camera, "capture thread panicked");
                }
            } else {
                warn!(camera = %self.camera, "capture thread did not exit in time; detaching");
                // The thread releases its own source on exit if this lock is busy
                if let Ok(mut source) = worker.source.try_lock() {
                    source.release();
                }
            }
            info!(camera = %self.camera, "stream engine stopped");
        }

        self.shared.set_open(generation, false);
        self.shared.set_state(generation, StreamState::Stopped);
    }

    fn join_within(&self, handle: &JoinHandle<()>) -> bool {
        let deadline = Instant::now() + self.config.join_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        handle.is_finished()
    }

    pub fn is_streaming(&self) -> bool {
        let alive = lock(&self.worker)
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished());
        alive
            && self.shared.decoder_open.load(Ordering::SeqCst)
            && self.shared.state() == StreamState::Streaming
    }

    /// Most recent frame from the last-frame slot.
    pub fn last_frame(&self) -> Option<Frame> {
        lock(&self.shared.last_frame).clone()
    }

    fn newest_frame(&self) -> Option<Frame> {
        self.shared.buffer.latest().or_else(|| self.last_frame())
    }

    /// Newest buffered frame (or the last-frame slot) as JPEG. Never blocks on
    /// the capture loop.
    pub fn get_frame_jpeg(&self) -> Option<Vec<u8>> {
        let frame = self.newest_frame()?;
        match frame.encode_jpeg(self.config.jpeg_quality) {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                warn!(camera = %self.camera, error = %format!("{:#}", e), "frame encoding failed");
                None
            }
        }
    }

    /// Paced multipart JPEG parts for an MJPEG response body.
    ///
    /// Each new frame is yielded once. A poll is empty when there is no
    /// frame at all, or when no new frame arrived and the engine is stopped
    /// or failed; stalls and reconnects of a live engine just skip the poll.
    /// The stream ends after `max_empty_reads` consecutive empty polls, or
    /// when the receiver is dropped.
    pub fn generate_frames(self: &Arc<Self>) -> ReceiverStream<Vec<u8>> {
        let (tx, rx) = mpsc::channel(2);
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            let mut empty_reads = 0u32;
            let mut last_sent: Option<Instant> = None;

            loop {
                let newest = engine.newest_frame();
                let has_frame = newest.is_some();
                let fresh = newest.filter(|frame| last_sent != Some(frame.captured_at));
                let jpeg = fresh.and_then(|frame| {
                    last_sent = Some(frame.captured_at);
                    frame.encode_jpeg(engine.config.jpeg_quality).ok()
                });
                let live = matches!(
                    engine.state(),
                    StreamState::Starting | StreamState::Streaming | StreamState::Reconnecting
                );

                match jpeg {
                    Some(jpeg) => {
                        empty_reads = 0;
                        if tx.send(multipart_chunk(&jpeg)).await.is_err() {
                            debug!(camera = %engine.camera, "frame consumer went away");
                            break;
                        }
                    }
                    None if has_frame && live => {}
                    None => {
                        empty_reads += 1;
                        if empty_reads >= engine.config.max_empty_reads {
                            info!(camera = %engine.camera, empty_reads, "no new frames; ending frame stream");
                            break;
                        }
                    }
                }
                tokio::time::sleep(engine.config.frame_interval).await;
            }
        });

        ReceiverStream::new(rx)
    }

    pub fn stats(&self) -> StreamStats {
        let counters = lock(&self.shared.counters);
        StreamStats {
            camera: self.camera.clone(),
            state: self.shared.state(),
            streaming: self.is_streaming(),
            resolution: counters.resolution,
            fps: counters.fps,
            frames_total: counters.frames_total,
            reconnect_attempts: counters.reconnect_attempts,
            last_frame_age_ms: counters
                .last_frame_at
                .map(|at| at.elapsed().as_millis() as u64),
            buffered: self.shared.buffer.len(),
        }
    }

    /// Quality-gated snapshot of the last frame, saved under the configured
    /// snapshot directory.
    pub async fn capture_image(
        &self,
        camera_code: &str,
        location: &str,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let policy = SnapshotPolicy::from(&self.config);
        snapshot::capture_image(self, camera_code, location, &policy).await
    }
}

impl FrameProvider for StreamEngine {
    fn current_frame(&self) -> Option<Frame> {
        self.last_frame()
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).as_ref() {
            worker.stop.store(true, Ordering::SeqCst);
        }
    }
}

enum Reopen {
    Opened,
    Retry,
    GaveUp,
    Stopped,
}

struct CaptureLoop {
    camera: String,
    uri: String,
    transport: TransportMode,
    config: StreamConfig,
    shared: Arc<Shared>,
    source: Arc<Mutex<Box<dyn VideoSource>>>,
    stop: Arc<AtomicBool>,
    generation: u64,
}

impl CaptureLoop {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn run(self) {
        STREAMS_ACTIVE.inc();
        let mut attempts = 0u32;
        let mut last_ok = Instant::now();

        while !self.stopped() {
            if !lock(&self.source).is_open() {
                self.shared.set_open(self.generation, false);
                match self.reconnect(&mut attempts) {
                    Reopen::Opened => last_ok = Instant::now(),
                    Reopen::Retry => {}
                    Reopen::GaveUp | Reopen::Stopped => break,
                }
                continue;
            }

            let result = lock(&self.source).read();
            match result {
                Ok(Some(frame)) => {
                    self.shared.publish(self.generation, frame);
                    attempts = 0;
                    last_ok = Instant::now();
                }
                Ok(None) => {
                    if last_ok.elapsed() >= self.config.stale_timeout {
                        warn!(
                            camera = %self.camera,
                            stale_secs = last_ok.elapsed().as_secs(),
                            "stream is stale; reconnecting"
                        );
                        lock(&self.source).release();
                    } else {
                        thread::sleep(IDLE_SLICE);
                    }
                }
                Err(e) => {
                    warn!(camera = %self.camera, error = %e, "frame read failed; reconnecting");
                    lock(&self.source).release();
                }
            }
        }

        lock(&self.source).release();
        self.shared.set_open(self.generation, false);
        if self.stopped() {
            self.shared.set_state(self.generation, StreamState::Stopped);
        }
        STREAMS_ACTIVE.dec();
        debug!(camera = %self.camera, "capture loop exited");
    }

    /// One reconnect attempt: release, wait `reconnect_delay`, reopen.
    fn reconnect(&self, attempts: &mut u32) -> Reopen {
        *attempts += 1;
        self.shared.set_attempts(self.generation, *attempts);

        if *attempts > self.config.max_reconnect_attempts {
            STREAM_GIVE_UPS_TOTAL.inc();
            warn!(
                camera = %self.camera,
                attempts = *attempts - 1,
                "reconnect attempts exhausted; giving up"
            );
            self.shared.set_state(self.generation, StreamState::Failed);
            return Reopen::GaveUp;
        }

        self.shared.set_state(self.generation, StreamState::Reconnecting);
        STREAM_RECONNECTS_TOTAL.inc();
        lock(&self.source).release();

        if !self.sleep_unless_stopped(self.config.reconnect_delay) {
            return Reopen::Stopped;
        }

        info!(
            camera = %self.camera,
            attempt = *attempts,
            max = self.config.max_reconnect_attempts,
            "reopening stream"
        );
        let reopened = {
            let mut source = lock(&self.source);
            match source.open(&self.uri, self.transport) {
                Ok(()) => source.is_open(),
                Err(e) => {
                    warn!(camera = %self.camera, attempt = *attempts, error = %e, "reopen failed");
                    false
                }
            }
        };
        if !reopened {
            return Reopen::Retry;
        }

        self.shared.buffer.clear();
        self.shared.set_open(self.generation, true);
        self.shared.set_state(self.generation, StreamState::Streaming);
        Reopen::Opened
    }

    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(IDLE_SLICE.min(deadline - now));
        }
    }
}
