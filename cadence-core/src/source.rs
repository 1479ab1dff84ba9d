//! # Media Source
//!
//! The narrow interface between the decode thread and whatever actually
//! demuxes, decodes, scales and resamples. The pipeline never looks inside a
//! packet or a decoded frame; it only routes them by stream index and reads
//! the PTS back out.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::format::{AudioTarget, VideoTarget};

// ============================================================================
// Errors
// ============================================================================

/// Failure to open or read a source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Cannot open {path}: {reason}")]
    CannotOpen { path: PathBuf, reason: String },
    #[error("No audio or video streams found in {0}")]
    NoStreams(PathBuf),
    #[error("Read failed: {0}")]
    Read(String),
}

/// Per-unit decode outcome other than a frame
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The decoder buffered the unit and needs more before emitting a frame
    #[error("Need more input")]
    NeedMoreInput,
    #[error("Decode failed: {0}")]
    Failed(String),
}

/// Scale or resample failure; the frame is dropped
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Scale failed: {0}")]
    Scale(String),
    #[error("Resample failed: {0}")]
    Resample(String),
}

// ============================================================================
// Streams
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StreamKind {
    Video,
    Audio,
}

/// One tracked elementary stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub index: usize,
    /// Milliseconds per PTS tick
    pub time_base_ms: f64,
    pub codec: String,
}

/// Video stream details as the source reports them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoStreamInfo {
    pub stream: StreamInfo,
    pub width: u32,
    pub height: u32,
    /// Average frame rate, when the container knows it
    pub frame_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioStreamInfo {
    pub stream: StreamInfo,
    pub sample_rate: u32,
    pub channels: u16,
}

/// The streams a source will feed the pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamSet {
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
}

impl StreamSet {
    /// Which tracked stream a unit belongs to, if any
    pub fn classify(&self, stream_index: usize) -> Option<StreamKind> {
        if self.video.as_ref().is_some_and(|v| v.stream.index == stream_index) {
            Some(StreamKind::Video)
        } else if self.audio.as_ref().is_some_and(|a| a.stream.index == stream_index) {
            Some(StreamKind::Audio)
        } else {
            None
        }
    }

    pub fn has(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Video => self.video.is_some(),
            StreamKind::Audio => self.audio.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    pub fn time_base_ms(&self, kind: StreamKind) -> Option<f64> {
        match kind {
            StreamKind::Video => self.video.as_ref().map(|v| v.stream.time_base_ms),
            StreamKind::Audio => self.audio.as_ref().map(|a| a.stream.time_base_ms),
        }
    }
}

// ============================================================================
// Source trait
// ============================================================================

/// A compressed unit read from the container
#[derive(Debug, Clone)]
pub struct CompressedUnit<P> {
    pub stream_index: usize,
    pub payload: P,
}

/// Demux + decode + convert collaborator driven by the decode thread
pub trait MediaSource {
    /// Compressed packet as the demuxer hands it out
    type Packet;
    /// Decoded, not yet converted frame
    type Frame;

    /// Open `path` and discover its streams
    fn open(path: &Path) -> Result<Self, SourceError>
    where
        Self: Sized;

    fn streams(&self) -> &StreamSet;

    /// Next unit in container order, `None` at end of stream
    fn next_unit(&mut self) -> Result<Option<CompressedUnit<Self::Packet>>, SourceError>;

    fn decode_video(&mut self, packet: &Self::Packet) -> Result<Self::Frame, DecodeError>;

    fn decode_audio(&mut self, packet: &Self::Packet) -> Result<Self::Frame, DecodeError>;

    /// PTS of a decoded frame in stream ticks
    fn frame_pts(&self, frame: &Self::Frame) -> Option<i64>;

    fn scale(&mut self, frame: &Self::Frame, target: &VideoTarget) -> Result<Vec<u8>, ConvertError>;

    fn resample(&mut self, frame: &Self::Frame, target: &AudioTarget)
        -> Result<Vec<u8>, ConvertError>;

    /// Milliseconds per PTS tick of a stream; constant once opened
    fn time_base_ms(&self, kind: StreamKind) -> f64 {
        self.streams().time_base_ms(kind).unwrap_or(1.0)
    }

    /// Short backend name for logs
    fn name(&self) -> &str;
}

/// Convert stream ticks to milliseconds, clamping negatives to zero
pub fn ticks_to_ms(ticks: i64, time_base_ms: f64) -> i64 {
    let ms = (ticks as f64 * time_base_ms).round();
    if ms.is_finite() && ms > 0.0 {
        ms as i64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streams() -> StreamSet {
        StreamSet {
            video: Some(VideoStreamInfo {
                stream: StreamInfo {
                    index: 0,
                    time_base_ms: 1.0 / 90.0,
                    codec: "h264".into(),
                },
                width: 1920,
                height: 1080,
                frame_rate: Some(25.0),
            }),
            audio: Some(AudioStreamInfo {
                stream: StreamInfo {
                    index: 2,
                    time_base_ms: 1000.0 / 48_000.0,
                    codec: "aac".into(),
                },
                sample_rate: 48_000,
                channels: 2,
            }),
        }
    }

    #[test]
    fn test_classify() {
        let set = streams();
        assert_eq!(set.classify(0), Some(StreamKind::Video));
        assert_eq!(set.classify(2), Some(StreamKind::Audio));
        assert_eq!(set.classify(1), None);
    }

    #[test]
    fn test_ticks_to_ms() {
        // 90 kHz video clock
        assert_eq!(ticks_to_ms(3_003, 1.0 / 90.0), 33);
        // 48 kHz audio clock, 1024-sample frames
        assert_eq!(ticks_to_ms(1_024, 1000.0 / 48_000.0), 21);
        assert_eq!(ticks_to_ms(-512, 1.0), 0);
    }

    #[test]
    fn test_missing_stream() {
        let set = StreamSet {
            audio: None,
            ..streams()
        };
        assert!(!set.has(StreamKind::Audio));
        assert!(set.time_base_ms(StreamKind::Audio).is_none());
        assert_eq!(set.classify(2), None);
    }
}
