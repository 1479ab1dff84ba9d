//! Deterministic in-process media source.
//!
//! Generates a video track on a 90 kHz clock and an audio track on a
//! sample-rate clock, interleaved in PTS order the way a muxer would write
//! them. Faults (corrupt units, decoder starvation, conversion failures,
//! foreign streams) can be injected by unit index, which is what the
//! pipeline tests and the player's `--synthetic` mode are built on.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::format::{AudioTarget, VideoTarget};
use crate::source::{
    AudioStreamInfo, CompressedUnit, ConvertError, DecodeError, MediaSource, SourceError,
    StreamInfo, StreamKind, StreamSet, VideoStreamInfo,
};

const VIDEO_STREAM: usize = 0;
const AUDIO_STREAM: usize = 1;
const DATA_STREAM: usize = 2;
const VIDEO_CLOCK_HZ: i64 = 90_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub video: bool,
    pub audio: bool,
    pub video_frames: u32,
    pub video_frame_ms: u32,
    pub width: u32,
    pub height: u32,
    pub audio_frames: u32,
    pub audio_rate: u32,
    pub audio_channels: u16,
    pub audio_frame_samples: u32,
    /// Emit a unit on an untracked stream after every N tracked units
    pub untracked_every: Option<u32>,
    /// Video unit indices the decoder swallows without output
    pub need_more_input: Vec<u32>,
    pub corrupt_video: Vec<u32>,
    pub corrupt_audio: Vec<u32>,
    pub scale_failures: Vec<u32>,
    pub resample_failures: Vec<u32>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            video_frames: 250,
            video_frame_ms: 40,
            width: 320,
            height: 240,
            audio_frames: 470,
            audio_rate: 48_000,
            audio_channels: 2,
            audio_frame_samples: 1_024,
            untracked_every: None,
            need_more_input: Vec::new(),
            corrupt_video: Vec::new(),
            corrupt_audio: Vec::new(),
            scale_failures: Vec::new(),
            resample_failures: Vec::new(),
        }
    }
}

/// Compressed unit as produced by the synthetic muxer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticPacket {
    pub index: u32,
    pub pts: i64,
}

/// Decoded synthetic frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticFrame {
    pub kind: StreamKind,
    pub index: u32,
    pub pts: i64,
    pub samples: u32,
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    streams: StreamSet,
    next_video: u32,
    next_audio: u32,
    tracked_since_untracked: u32,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let video = config.video.then(|| VideoStreamInfo {
            stream: StreamInfo {
                index: VIDEO_STREAM,
                time_base_ms: 1000.0 / VIDEO_CLOCK_HZ as f64,
                codec: "synthetic-video".into(),
            },
            width: config.width,
            height: config.height,
            frame_rate: (config.video_frame_ms > 0).then(|| 1000.0 / config.video_frame_ms as f64),
        });
        let audio = config.audio.then(|| AudioStreamInfo {
            stream: StreamInfo {
                index: AUDIO_STREAM,
                time_base_ms: 1000.0 / config.audio_rate.max(1) as f64,
                codec: "synthetic-audio".into(),
            },
            sample_rate: config.audio_rate,
            channels: config.audio_channels,
        });

        Self {
            config,
            streams: StreamSet { video, audio },
            next_video: 0,
            next_audio: 0,
            tracked_since_untracked: 0,
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn video_pts(&self, index: u32) -> i64 {
        index as i64 * self.config.video_frame_ms as i64 * (VIDEO_CLOCK_HZ / 1000)
    }

    fn audio_pts(&self, index: u32) -> i64 {
        index as i64 * self.config.audio_frame_samples as i64
    }

    fn pending_video(&self) -> Option<(u32, f64)> {
        let info = self.streams.video.as_ref()?;
        (self.next_video < self.config.video_frames).then(|| {
            let pts = self.video_pts(self.next_video);
            (self.next_video, pts as f64 * info.stream.time_base_ms)
        })
    }

    fn pending_audio(&self) -> Option<(u32, f64)> {
        let info = self.streams.audio.as_ref()?;
        (self.next_audio < self.config.audio_frames).then(|| {
            let pts = self.audio_pts(self.next_audio);
            (self.next_audio, pts as f64 * info.stream.time_base_ms)
        })
    }
}

/// Frame index stamped into the first four bytes of a converted payload
pub fn payload_index(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn stamped(len: usize, index: u32, fill: u8) -> Vec<u8> {
    let mut buffer = vec![fill; len];
    let stamp = index.to_le_bytes();
    let n = stamp.len().min(len);
    buffer[..n].copy_from_slice(&stamp[..n]);
    buffer
}

impl MediaSource for SyntheticSource {
    type Packet = SyntheticPacket;
    type Frame = SyntheticFrame;

    /// Read a JSON [`SyntheticConfig`] from `path`
    fn open(path: &Path) -> Result<Self, SourceError> {
        let cannot_open = |reason: String| SourceError::CannotOpen {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| cannot_open(e.to_string()))?;
        let config: SyntheticConfig =
            serde_json::from_str(&text).map_err(|e| cannot_open(e.to_string()))?;

        let source = Self::new(config);
        if source.streams.is_empty() {
            return Err(SourceError::NoStreams(path.to_path_buf()));
        }
        Ok(source)
    }

    fn streams(&self) -> &StreamSet {
        &self.streams
    }

    fn next_unit(&mut self) -> Result<Option<CompressedUnit<SyntheticPacket>>, SourceError> {
        if let Some(every) = self.config.untracked_every.filter(|n| *n > 0) {
            if self.tracked_since_untracked >= every {
                self.tracked_since_untracked = 0;
                return Ok(Some(CompressedUnit {
                    stream_index: DATA_STREAM,
                    payload: SyntheticPacket { index: 0, pts: 0 },
                }));
            }
        }

        let take_video = match (self.pending_video(), self.pending_audio()) {
            (None, None) => return Ok(None),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some((_, v_ms)), Some((_, a_ms))) => v_ms <= a_ms,
        };

        self.tracked_since_untracked += 1;
        let unit = if take_video {
            let index = self.next_video;
            self.next_video += 1;
            CompressedUnit {
                stream_index: VIDEO_STREAM,
                payload: SyntheticPacket {
                    index,
                    pts: self.video_pts(index),
                },
            }
        } else {
            let index = self.next_audio;
            self.next_audio += 1;
            CompressedUnit {
                stream_index: AUDIO_STREAM,
                payload: SyntheticPacket {
                    index,
                    pts: self.audio_pts(index),
                },
            }
        };
        Ok(Some(unit))
    }

    fn decode_video(&mut self, packet: &SyntheticPacket) -> Result<SyntheticFrame, DecodeError> {
        if self.config.need_more_input.contains(&packet.index) {
            return Err(DecodeError::NeedMoreInput);
        }
        if self.config.corrupt_video.contains(&packet.index) {
            return Err(DecodeError::Failed(format!("corrupt video unit {}", packet.index)));
        }
        Ok(SyntheticFrame {
            kind: StreamKind::Video,
            index: packet.index,
            pts: packet.pts,
            samples: 0,
        })
    }

    fn decode_audio(&mut self, packet: &SyntheticPacket) -> Result<SyntheticFrame, DecodeError> {
        if self.config.corrupt_audio.contains(&packet.index) {
            return Err(DecodeError::Failed(format!("corrupt audio unit {}", packet.index)));
        }
        Ok(SyntheticFrame {
            kind: StreamKind::Audio,
            index: packet.index,
            pts: packet.pts,
            samples: self.config.audio_frame_samples,
        })
    }

    fn frame_pts(&self, frame: &SyntheticFrame) -> Option<i64> {
        Some(frame.pts)
    }

    fn scale(
        &mut self,
        frame: &SyntheticFrame,
        target: &VideoTarget,
    ) -> Result<Vec<u8>, ConvertError> {
        if self.config.scale_failures.contains(&frame.index) {
            return Err(ConvertError::Scale(format!("scaler rejected frame {}", frame.index)));
        }
        Ok(stamped(target.frame_size(), frame.index, 0x10))
    }

    fn resample(
        &mut self,
        frame: &SyntheticFrame,
        target: &AudioTarget,
    ) -> Result<Vec<u8>, ConvertError> {
        if self.config.resample_failures.contains(&frame.index) {
            return Err(ConvertError::Resample(format!(
                "resampler rejected frame {}",
                frame.index
            )));
        }
        let native_rate = self.config.audio_rate.max(1) as u64;
        let samples = frame.samples as u64 * target.rate as u64 / native_rate;
        Ok(stamped(target.buffer_size(samples as usize), frame.index, 0x55))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
