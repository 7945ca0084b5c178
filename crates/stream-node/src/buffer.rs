use crate::frame::Frame;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Bounded FIFO of recent frames. `push` never blocks: when full, the oldest
/// frame is evicted to make room for the newest.
pub struct FrameBuffer {
    capacity: usize,
    frames: Mutex<VecDeque<Frame>>,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of frames evicted (0 or 1).
    pub fn push(&self, frame: Frame) -> usize {
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        let mut dropped = 0;
        while frames.len() >= self.capacity {
            frames.pop_front();
            dropped += 1;
        }
        frames.push_back(frame);
        dropped
    }

    /// Newest frame, left in place.
    pub fn latest(&self) -> Option<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Buffered frames, oldest first.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
