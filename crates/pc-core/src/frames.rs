//! Newline-delimited event frames, as written to a job's `events.log` and
//! carried by live transports.

use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame is not valid utf-8")]
    Utf8,
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("event payload must be a JSON object")]
    NotObject,
}

#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub frames: Vec<String>,
    pub errors: Vec<FrameError>,
}

impl DecodeReport {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.errors.is_empty()
    }
}

/// Parses one event frame into a JSON object.
pub fn parse_event(text: &str) -> Result<Map<String, Value>, FrameError> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(FrameError::NotObject),
        Err(err) => Err(FrameError::Decode(err.to_string())),
    }
}

/// Splits a byte stream into text lines. Partial lines are held back until
/// their delimiter arrives; blank lines are skipped.
pub struct LineFrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
}

impl LineFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
        }
    }

    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut frame: Vec<u8> = self.pending.drain(..=newline_idx).collect();
            frame.pop();
            if frame.ends_with(b"\r") {
                frame.pop();
            }
            self.accept(frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Flushes a trailing line that never got its delimiter.
    pub fn finish(&mut self) -> DecodeReport {
        let mut report = DecodeReport::default();
        let frame = std::mem::take(&mut self.pending);
        self.accept(frame, &mut report);
        report
    }

    fn accept(&self, frame: Vec<u8>, report: &mut DecodeReport) {
        if frame.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match String::from_utf8(frame) {
            Ok(text) => report.frames.push(text),
            Err(_) => report.errors.push(FrameError::Utf8),
        }
    }
}

impl Default for LineFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
