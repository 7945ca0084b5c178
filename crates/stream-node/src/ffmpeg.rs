//! ffmpeg-backed decoder: ffprobe for the native resolution, then an ffmpeg
//! child process emitting raw RGB24 frames on stdout.
//!
//! A reader thread turns stdout into whole frames on a small bounded channel,
//! so `read()` waits at most [`READ_SLICE`] and reports a silent stream as
//! `Ok(None)`. The running child sits in a slot shared with the
//! source's interrupter, which can kill it while a read or probe is pending.

use crate::frame::Frame;
use crate::source::{DecodeError, Interrupter, SourceFactory, VideoSource};
use anyhow::{anyhow, bail, Context, Result};
use common::env::env_or;
use common::validation::redact_credentials;
use common::{Resolution, TransportMode};
use serde::Deserialize;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest a single `read()` waits for the next frame.
pub const READ_SLICE: Duration = Duration::from_millis(100);
const CHILD_POLL: Duration = Duration::from_millis(20);
/// Decoded frames queued between the reader thread and `read()`
const FRAME_QUEUE: usize = 2;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

/// Resolution of the first video stream in `ffprobe -of json` output.
pub fn parse_probe_output(json: &str) -> Result<Resolution> {
    let output: ProbeOutput =
        serde_json::from_str(json).context("ffprobe output is not valid JSON")?;
    output
        .streams
        .iter()
        .find_map(|s| match (s.width, s.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(Resolution::new(w, h)),
            _ => None,
        })
        .ok_or_else(|| anyhow!("ffprobe reported no video dimensions"))
}

fn is_rtsp(uri: &str) -> bool {
    let lower = uri.to_ascii_lowercase();
    lower.starts_with("rtsp://") || lower.starts_with("rtsps://")
}

fn input_args(uri: &str, transport: TransportMode, timeout: Duration) -> Vec<String> {
    let mut args = Vec::new();
    if is_rtsp(uri) {
        args.push("-rtsp_transport".to_string());
        args.push(transport.as_str().to_string());
        args.push("-timeout".to_string());
        args.push(timeout.as_micros().to_string());
    }
    args
}

/// ffmpeg arguments for tolerant low-latency decoding to raw RGB24.
pub fn build_decoder_args(uri: &str, transport: TransportMode, timeout: Duration) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(input_args(uri, transport, timeout));

    // Drop corrupt packets instead of aborting; keep at most one frame queued
    for arg in ["-fflags", "+discardcorrupt+nobuffer", "-flags", "low_delay"] {
        args.push(arg.to_string());
    }
    args.push("-i".to_string());
    args.push(uri.to_string());
    for arg in ["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"] {
        args.push(arg.to_string());
    }
    args
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn kill_child(mut child: Child) {
    if let Err(e) = child.kill() {
        if e.kind() != ErrorKind::InvalidInput {
            warn!(error = %e, "failed to kill ffmpeg child");
        }
    }
    let _ = child.wait();
}

/// The probe or decoder child currently owned by one source. Once aborted,
/// no new child is accepted.
#[derive(Clone, Default)]
struct ChildSlot {
    child: Arc<Mutex<Option<Child>>>,
    aborted: Arc<AtomicBool>,
}

impl ChildSlot {
    fn put(&self, child: Child) -> Result<()> {
        let mut slot = lock(&self.child);
        if self.aborted.load(Ordering::SeqCst) {
            kill_child(child);
            bail!("decoder was interrupted");
        }
        if let Some(previous) = slot.replace(child) {
            kill_child(previous);
        }
        Ok(())
    }

    /// `Ok(None)` while the child runs.
    fn try_wait(&self) -> Result<Option<ExitStatus>> {
        let mut slot = lock(&self.child);
        let child = slot
            .as_mut()
            .ok_or_else(|| anyhow!("decoder was interrupted"))?;
        Ok(child.try_wait()?)
    }

    fn kill(&self) {
        let child = lock(&self.child).take();
        if let Some(child) = child {
            kill_child(child);
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.kill();
    }
}

struct Decoder {
    frames: Receiver<std::io::Result<Vec<u8>>>,
    resolution: Resolution,
}

/// Pump whole frames from ffmpeg's stdout until EOF, an error, or the
/// receiving decoder is dropped.
fn spawn_reader(
    mut stdout: ChildStdout,
    frame_size: usize,
) -> std::io::Result<Receiver<std::io::Result<Vec<u8>>>> {
    let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE);
    thread::Builder::new()
        .name("ffmpeg-reader".to_string())
        .spawn(move || loop {
            let mut buf = vec![0; frame_size];
            match stdout.read_exact(&mut buf) {
                Ok(()) => {
                    if tx.send(Ok(buf)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        })?;
    Ok(rx)
}

pub struct FfmpegSource {
    timeout: Duration,
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
    slot: ChildSlot,
    decoder: Option<Decoder>,
}

impl FfmpegSource {
    /// `timeout` bounds the probe and ffmpeg's own RTSP socket timeout.
    /// `FFPROBE_BIN` and `FFMPEG_BIN` override the programs found on `PATH`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ffprobe: env_or("FFPROBE_BIN", PathBuf::from("ffprobe")),
            ffmpeg: env_or("FFMPEG_BIN", PathBuf::from("ffmpeg")),
            slot: ChildSlot::default(),
            decoder: None,
        }
    }

    pub fn with_programs(mut self, ffprobe: impl Into<PathBuf>, ffmpeg: impl Into<PathBuf>) -> Self {
        self.ffprobe = ffprobe.into();
        self.ffmpeg = ffmpeg.into();
        self
    }

    pub fn factory(timeout: Duration) -> SourceFactory {
        Arc::new(move || Box::new(FfmpegSource::new(timeout)) as Box<dyn VideoSource>)
    }

    fn probe_resolution(&self, uri: &str, transport: TransportMode) -> Result<Resolution> {
        let mut args: Vec<String> = ["-v", "error", "-select_streams", "v:0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(input_args(uri, transport, self.timeout));
        for arg in ["-show_entries", "stream=width,height", "-of", "json"] {
            args.push(arg.to_string());
        }
        args.push(uri.to_string());

        let mut child = Command::new(&self.ffprobe)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to execute ffprobe")?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.slot.put(child)?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = self.slot.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                self.slot.kill();
                bail!("ffprobe timed out after {:?}", self.timeout);
            }
            thread::sleep(CHILD_POLL);
        };
        self.slot.kill();

        if !status.success() {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text);
            }
            bail!("ffprobe failed ({}): {}", status, text.trim());
        }
        let mut json = String::new();
        if let Some(mut stdout) = stdout {
            stdout
                .read_to_string(&mut json)
                .context("failed to read ffprobe output")?;
        }
        parse_probe_output(&json)
    }

    fn spawn_decoder(&mut self, uri: &str, transport: TransportMode) -> Result<()> {
        let resolution = self.probe_resolution(uri, transport)?;

        let args = build_decoder_args(uri, transport, self.timeout);
        debug!(width = resolution.width, height = resolution.height, "spawning ffmpeg decoder");
        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn ffmpeg")?;
        let stdout = child.stdout.take();
        self.slot.put(child)?;
        let stdout = stdout.ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;

        let frame_size = resolution.width as usize * resolution.height as usize * 3;
        let frames = spawn_reader(stdout, frame_size).context("failed to start frame reader")?;
        self.decoder = Some(Decoder { frames, resolution });
        Ok(())
    }
}

impl VideoSource for FfmpegSource {
    fn open(&mut self, uri: &str, transport: TransportMode) -> Result<(), DecodeError> {
        self.release();
        if let Err(e) = self.spawn_decoder(uri, transport) {
            self.release();
            return Err(DecodeError::Open(redact_credentials(&format!("{:#}", e))));
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>, DecodeError> {
        let decoder = self.decoder.as_ref().ok_or(DecodeError::NotOpen)?;
        let resolution = decoder.resolution;
        match decoder.frames.recv_timeout(READ_SLICE) {
            Ok(Ok(data)) => Frame::from_rgb(resolution.width, resolution.height, data)
                .map(Some)
                .map_err(|e| DecodeError::Read(format!("{:#}", e))),
            Ok(Err(e)) => {
                self.release();
                if e.kind() == ErrorKind::UnexpectedEof {
                    Err(DecodeError::EndOfStream)
                } else {
                    Err(DecodeError::Read(e.to_string()))
                }
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.release();
                Err(DecodeError::EndOfStream)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.decoder.is_some()
    }

    fn release(&mut self) {
        self.slot.kill();
        self.decoder = None;
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let slot = self.slot.clone();
        Some(Arc::new(move || slot.abort()))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.release();
    }
}
