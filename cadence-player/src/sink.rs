//! Headless output sinks.
//!
//! With no window and (optionally) no sound card, "presenting" a frame means
//! recording that it arrived on time; audio is pulled from the feeder at the
//! device's real-time rate by a plain thread.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;

use cadence_core::audio_feed::FeederStats;
use cadence_core::format::VideoTarget;
use cadence_core::video_present::VideoFrame;
use cadence_core::PlaybackHandle;

// ============================================================================
// Video
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameLogStats {
    pub frames: u64,
    pub short_frames: u64,
    pub first_pts_ms: Option<i64>,
    pub last_pts_ms: Option<i64>,
    /// Wall time from first to last presented frame
    pub wall_ms: u64,
    /// Running FNV-1a over every presented payload
    pub checksum: u64,
}

/// Stand-in for a texture upload: validates and fingerprints each frame
pub struct FrameLog {
    target: VideoTarget,
    started: Option<Instant>,
    stats: FrameLogStats,
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

impl FrameLog {
    pub fn new(target: VideoTarget) -> Self {
        Self {
            target,
            started: None,
            stats: FrameLogStats {
                checksum: FNV_OFFSET,
                ..Default::default()
            },
        }
    }

    pub fn present(&mut self, frame: &VideoFrame) {
        let now = Instant::now();
        let started = *self.started.get_or_insert(now);

        if frame.data.len() != self.target.frame_size() {
            self.stats.short_frames += 1;
            tracing::warn!(
                pts_ms = frame.pts_ms,
                bytes = frame.data.len(),
                expected = self.target.frame_size(),
                "Frame size does not match target"
            );
        }

        self.stats.checksum = frame.data.iter().fold(self.stats.checksum, |hash, &byte| {
            (hash ^ byte as u64).wrapping_mul(FNV_PRIME)
        });
        self.stats.frames += 1;
        self.stats.first_pts_ms.get_or_insert(frame.pts_ms);
        self.stats.last_pts_ms = Some(frame.pts_ms);
        self.stats.wall_ms = (now - started).as_millis() as u64;

        tracing::debug!(
            pts_ms = frame.pts_ms,
            late_ms = frame.lateness.as_millis() as u64,
            "Presented frame"
        );
        if self.stats.frames % 100 == 0 {
            tracing::info!(frames = self.stats.frames, pts_ms = frame.pts_ms, "Playback progress");
        }
    }

    pub fn stats(&self) -> &FrameLogStats {
        &self.stats
    }
}

// ============================================================================
// Audio
// ============================================================================

/// Device-less audio consumer: pulls 10 ms buffers on a 10 ms tick
pub struct PacedAudioSink {
    thread: JoinHandle<FeederStats>,
}

impl PacedAudioSink {
    const TICK: Duration = Duration::from_millis(10);

    pub fn spawn(handle: &PlaybackHandle) -> Result<Self> {
        let mut feeder = handle.audio_feeder();
        let chunk = handle.config().audio.bytes_per_second() / 100;

        let thread = std::thread::Builder::new()
            .name("cadence-audio-sink".into())
            .spawn(move || {
                let mut buffer = vec![0u8; chunk];
                let mut next = Instant::now();
                while !feeder.handle().is_stop_requested() && !feeder.is_exhausted() {
                    feeder.fill(&mut buffer);
                    next += Self::TICK;
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    }
                }
                feeder.stats().clone()
            })?;

        Ok(Self { thread })
    }

    pub fn join(self) -> Result<FeederStats> {
        self.thread
            .join()
            .map_err(|_| anyhow::anyhow!("Audio sink thread panicked"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::format::PixelFormat;

    fn target() -> VideoTarget {
        VideoTarget {
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Rgba,
        }
    }

    fn frame(pts_ms: i64, data: Vec<u8>) -> VideoFrame {
        VideoFrame {
            data,
            pts_ms,
            lateness: Duration::ZERO,
        }
    }

    #[test]
    fn test_frame_log_counts_and_flags_short_frames() {
        let mut log = FrameLog::new(target());
        log.present(&frame(0, vec![0; 16]));
        log.present(&frame(40, vec![0; 3]));

        let stats = log.stats();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.short_frames, 1);
        assert_eq!(stats.first_pts_ms, Some(0));
        assert_eq!(stats.last_pts_ms, Some(40));
    }

    #[test]
    fn test_checksum_depends_on_content() {
        let mut a = FrameLog::new(target());
        let mut b = FrameLog::new(target());
        a.present(&frame(0, vec![1; 16]));
        b.present(&frame(0, vec![2; 16]));
        assert_ne!(a.stats().checksum, b.stats().checksum);
    }
}
