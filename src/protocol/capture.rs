//! Bounded capture of every frame a session sends or receives.
//!
//! Only records in debug builds. Reading never mutates the ring.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameDirection {
    Tx,
    Rx,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedFrame {
    pub direction: FrameDirection,
    pub captured_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct DebugCapture {
    frames: Mutex<VecDeque<CapturedFrame>>,
    capacity: usize,
    enabled: bool,
}

impl DebugCapture {
    pub fn new(capacity: usize) -> Self {
        Self::with_enabled(capacity, cfg!(debug_assertions))
    }

    pub fn with_enabled(capacity: usize, enabled: bool) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            enabled: enabled && capacity > 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, direction: FrameDirection, bytes: &[u8]) {
        if !self.enabled {
            return;
        }
        let mut frames = self.frames.lock();
        while frames.len() >= self.capacity {
            frames.pop_front();
        }
        frames.push_back(CapturedFrame {
            direction,
            captured_at: Utc::now(),
            bytes: bytes.to_vec(),
        });
    }

    pub fn snapshot(&self) -> Vec<CapturedFrame> {
        self.frames.lock().iter().cloned().collect()
    }

    /// One line per frame: time, direction, length and hex bytes.
    pub fn to_compact_hex_log(&self) -> String {
        let frames = self.frames.lock();
        let mut out = String::new();
        for frame in frames.iter() {
            let direction = match frame.direction {
                FrameDirection::Tx => "TX",
                FrameDirection::Rx => "RX",
            };
            let _ = writeln!(
                out,
                "{} {} {:>4} {}",
                frame.captured_at.format("%H:%M:%S%.3f"),
                direction,
                frame.bytes.len(),
                hex::encode(&frame.bytes)
            );
        }
        out
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_frames_are_evicted() {
        let capture = DebugCapture::with_enabled(3, true);
        for i in 0..5u8 {
            capture.record(FrameDirection::Tx, &[i]);
        }

        let bytes: Vec<_> = capture.snapshot().into_iter().map(|f| f.bytes[0]).collect();
        assert_eq!(bytes, vec![2, 3, 4]);
    }

    #[test]
    fn hex_log_does_not_drain_ring() {
        let capture = DebugCapture::with_enabled(8, true);
        capture.record(FrameDirection::Tx, &[0x94, 0xC3]);
        capture.record(FrameDirection::Rx, &[0x3E, 0x00]);

        let log = capture.to_compact_hex_log();
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("TX    2 94c3"));
        assert!(lines[1].ends_with("RX    2 3e00"));
        assert_eq!(capture.len(), 2);
    }

    #[test]
    fn disabled_capture_records_nothing() {
        let capture = DebugCapture::with_enabled(8, false);
        capture.record(FrameDirection::Rx, &[1, 2, 3]);

        assert!(capture.is_empty());
        assert_eq!(capture.to_compact_hex_log(), "");
    }
}
