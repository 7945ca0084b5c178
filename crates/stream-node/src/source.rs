use crate::frame::Frame;
use common::TransportMode;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("failed to open stream: {0}")]
    Open(String),
    #[error("failed to read frame: {0}")]
    Read(String),
    #[error("stream ended")]
    EndOfStream,
    #[error("decoder is not open")]
    NotOpen,
}

/// Blocking decoder seam driven by the capture thread.
pub trait VideoSource: Send {
    fn open(&mut self, uri: &str, transport: TransportMode) -> Result<(), DecodeError>;

    /// `Ok(None)` means no frame was ready; the decoder is still considered open.
    fn read(&mut self) -> Result<Option<Frame>, DecodeError>;

    fn is_open(&self) -> bool;

    /// Release decoder resources. Safe to call when already released.
    fn release(&mut self);

    /// Hook that unblocks a pending `open` or `read` from another thread.
    /// The source stays unusable afterwards. Sources whose calls always
    /// return promptly need none.
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }
}

pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

/// Builds a fresh decoder for each `start()`.
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn VideoSource> + Send + Sync>;
