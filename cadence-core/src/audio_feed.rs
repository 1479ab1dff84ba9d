//! Audio consumer.
//!
//! The device asks for a buffer of some length; the feeder fills it from
//! queued audio frames, carrying a partly used frame over to the next call,
//! and pads whatever is left with silence. It never waits for the producer.
//! Every frame it takes re-anchors the presentation clock, which is what
//! makes audio the master clock.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::pipeline::PlaybackHandle;

/// How one device buffer was filled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fill {
    pub frame_bytes: usize,
    pub silence_bytes: usize,
}

impl Fill {
    pub fn is_silent(&self) -> bool {
        self.frame_bytes == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeederStats {
    pub callbacks: u64,
    pub frames: u64,
    pub frame_bytes: u64,
    pub silence_bytes: u64,
    /// Callbacks padded with silence while the stream was still running
    pub underruns: u64,
}

struct PartialFrame {
    data: Vec<u8>,
    offset: usize,
}

pub struct AudioFeeder {
    handle: PlaybackHandle,
    partial: Option<PartialFrame>,
    silence: u8,
    stats: FeederStats,
}

impl AudioFeeder {
    pub fn new(handle: PlaybackHandle) -> Self {
        let silence = handle.config().audio.sample_format.silence_byte();
        Self {
            handle,
            partial: None,
            silence,
            stats: FeederStats::default(),
        }
    }

    /// Fill `out` completely, with frame data first and silence after
    pub fn fill(&mut self, out: &mut [u8]) -> Fill {
        let mut written = 0;
        let now = Instant::now();

        if !self.handle.is_stop_requested() {
            while written < out.len() {
                let Some(partial) = self.current(now + self.playout_delay(written)) else {
                    break;
                };
                let available = &partial.data[partial.offset..];
                let n = available.len().min(out.len() - written);
                out[written..written + n].copy_from_slice(&available[..n]);
                partial.offset += n;
                written += n;

                if partial.offset >= partial.data.len() {
                    self.partial = None;
                }
            }
        }

        out[written..].fill(self.silence);
        let fill = Fill {
            frame_bytes: written,
            silence_bytes: out.len() - written,
        };
        self.record(fill);
        fill
    }

    /// Frame in progress, popping a new one if the last ran out.
    ///
    /// `starts_at` is when a newly popped frame reaches the speaker.
    fn current(&mut self, starts_at: Instant) -> Option<&mut PartialFrame> {
        if self.partial.is_none() {
            let (data, pts_ms) = self.handle.pop_audio_frame()?;
            self.handle.notify_consumed();
            self.handle.clock().reanchor(pts_ms, starts_at);
            self.stats.frames += 1;
            tracing::trace!(pts_ms, bytes = data.len(), "Audio frame to device");
            self.partial = Some(PartialFrame { data, offset: 0 });
        }
        self.partial.as_mut()
    }

    /// Play time of `bytes` already queued ahead in the device buffer
    fn playout_delay(&self, bytes: usize) -> Duration {
        let per_second = self.handle.config().audio.bytes_per_second() as u64;
        (bytes as u64)
            .saturating_mul(1_000_000_000)
            .checked_div(per_second)
            .map_or(Duration::ZERO, Duration::from_nanos)
    }

    fn record(&mut self, fill: Fill) {
        self.stats.callbacks += 1;
        self.stats.frame_bytes += fill.frame_bytes as u64;
        self.stats.silence_bytes += fill.silence_bytes as u64;
        if fill.silence_bytes > 0
            && !self.handle.is_finished()
            && !self.handle.is_stop_requested()
        {
            self.stats.underruns += 1;
            tracing::debug!(silence_bytes = fill.silence_bytes, "Audio underrun");
        }
    }

    /// Nothing left to play: no partial frame and the pipeline drained
    pub fn is_exhausted(&self) -> bool {
        self.partial.is_none() && self.handle.is_drained()
    }

    /// Bytes of the current frame not yet handed to the device
    pub fn pending_bytes(&self) -> usize {
        self.partial
            .as_ref()
            .map_or(0, |p| p.data.len() - p.offset)
    }

    pub fn stats(&self) -> &FeederStats {
        &self.stats
    }

    pub fn handle(&self) -> &PlaybackHandle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::format::{AudioTarget, ChannelLayout, SampleFormat};
    use crate::pipeline::Pipeline;
    use crate::synthetic::{SyntheticConfig, SyntheticSource};

    fn audio_only(frames: u32) -> SyntheticSource {
        SyntheticSource::new(SyntheticConfig {
            video: false,
            audio_frames: frames,
            audio_rate: 48_000,
            audio_frame_samples: 480,
            ..Default::default()
        })
    }

    fn config(sample_format: SampleFormat) -> PipelineConfig {
        PipelineConfig {
            audio: AudioTarget {
                channel_layout: ChannelLayout::Stereo,
                sample_format,
                rate: 48_000,
            },
            ..Default::default()
        }
    }

    fn wait_finished(handle: &PlaybackHandle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.is_finished());
    }

    #[test]
    fn test_underrun_fills_exact_silence() {
        // audio stream present, nothing queued
        let pipeline = Pipeline::start(audio_only(0), config(SampleFormat::U8)).unwrap();
        let mut feeder = pipeline.audio_feeder();

        let mut out = vec![0u8; 1_000];
        let fill = feeder.fill(&mut out);
        assert_eq!(fill.frame_bytes + fill.silence_bytes, 1_000);
        assert!(fill.is_silent());
        assert!(out.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn test_frames_span_callbacks() {
        // 480 stereo s16 samples = 1920 bytes per frame
        let pipeline = Pipeline::start(audio_only(2), config(SampleFormat::S16)).unwrap();
        let handle = pipeline.handle();
        wait_finished(&handle);
        let mut feeder = handle.audio_feeder();

        let mut out = vec![0u8; 1_500];
        assert_eq!(feeder.fill(&mut out).frame_bytes, 1_500);
        assert_eq!(feeder.pending_bytes(), 420);

        let fill = feeder.fill(&mut out);
        assert_eq!(fill.frame_bytes, 1_500);
        assert_eq!(feeder.pending_bytes(), 840);

        let fill = feeder.fill(&mut out);
        assert_eq!(fill.frame_bytes, 840);
        assert_eq!(fill.silence_bytes, 660);
        assert!(out[840..].iter().all(|&b| b == 0));
        assert!(feeder.is_exhausted());
        assert_eq!(feeder.stats().frames, 2);
        // drained, so trailing silence is not an underrun
        assert_eq!(feeder.stats().underruns, 0);
    }

    #[test]
    fn test_each_frame_reanchors_clock() {
        let pipeline = Pipeline::start(audio_only(3), config(SampleFormat::S16)).unwrap();
        let handle = pipeline.handle();
        wait_finished(&handle);
        let mut feeder = handle.audio_feeder();

        let mut out = vec![0u8; 1_920];
        feeder.fill(&mut out);
        std::thread::sleep(Duration::from_millis(50));
        let before = handle.clock().anchor().unwrap();

        // second frame has pts 10ms and arrives ~50ms late
        feeder.fill(&mut out);
        let after = handle.clock().anchor().unwrap();
        assert!(after > before);
        // the first pop anchors, then both frames re-anchor
        assert_eq!(handle.clock().stats().reanchors, 2);
    }

    #[test]
    fn test_frames_later_in_buffer_keep_anchor() {
        // three 10ms frames in one 30ms buffer start 0, 10 and 20ms in
        let pipeline = Pipeline::start(audio_only(3), config(SampleFormat::S16)).unwrap();
        let handle = pipeline.handle();
        wait_finished(&handle);
        let mut feeder = handle.audio_feeder();

        let mut out = vec![0u8; 3 * 1_920];
        assert_eq!(feeder.fill(&mut out).frame_bytes, 3 * 1_920);

        let stats = handle.clock().stats();
        assert_eq!(stats.reanchors, 3);
        assert!(stats.max_correction_ms.abs() <= 1, "{:?}", stats);
    }

    #[test]
    fn test_playout_delay() {
        let pipeline = Pipeline::start(audio_only(0), config(SampleFormat::S16)).unwrap();
        let feeder = pipeline.audio_feeder();
        // 48kHz stereo s16 is 192000 bytes per second
        assert_eq!(feeder.playout_delay(0), Duration::ZERO);
        assert_eq!(feeder.playout_delay(1_920), Duration::from_millis(10));
        assert_eq!(feeder.playout_delay(192_000), Duration::from_secs(1));
    }

    #[test]
    fn test_stop_yields_silence() {
        let pipeline = Pipeline::start(audio_only(3), config(SampleFormat::F32)).unwrap();
        let handle = pipeline.handle();
        wait_finished(&handle);
        handle.request_stop();

        let mut feeder = handle.audio_feeder();
        let mut out = vec![0xFFu8; 64];
        let fill = feeder.fill(&mut out);
        assert!(fill.is_silent());
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(feeder.stats().frames, 0);
    }
}
