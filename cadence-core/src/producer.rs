//! Decode producer loop.
//!
//! Runs on its own thread: demux one unit, decode it, convert it to the
//! consumer's target format and push it onto the matching queue, parking on
//! the buffer-availability signal whenever the queues hold enough.

use std::sync::Arc;

use serde::Serialize;

use crate::pipeline::Shared;
use crate::source::{ticks_to_ms, DecodeError, MediaSource, StreamKind};

/// Outcome of one producer iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A converted frame was queued
    Pushed(StreamKind),
    /// Queues were saturated; parked until a consumer notified
    Waited,
    /// Decoder buffered the unit without emitting a frame
    NeedMoreInput,
    /// Decode failed; unit skipped
    Skipped,
    /// Scale or resample failed; frame dropped
    Dropped,
    /// Unit belonged to an untracked stream
    Discarded,
    /// End of stream or unrecoverable read error
    Exhausted,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    pub video_frames: u64,
    pub audio_frames: u64,
    pub need_more_input: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub discarded: u64,
    pub waits: u64,
    pub missing_pts: u64,
}

impl ProducerStats {
    pub fn frames_pushed(&self) -> u64 {
        self.video_frames + self.audio_frames
    }
}

/// Marks the producer finished on every exit path, unwinding included
struct FinishGuard(Arc<Shared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

pub struct DecodeProducer<S: MediaSource> {
    source: S,
    shared: Arc<Shared>,
    video_time_base_ms: f64,
    audio_time_base_ms: f64,
    last_video_pts_ms: i64,
    last_audio_pts_ms: i64,
    stats: ProducerStats,
}

impl<S: MediaSource> DecodeProducer<S> {
    pub(crate) fn new(source: S, shared: Arc<Shared>) -> Self {
        let video_time_base_ms = source.time_base_ms(StreamKind::Video);
        let audio_time_base_ms = source.time_base_ms(StreamKind::Audio);
        Self {
            source,
            shared,
            video_time_base_ms,
            audio_time_base_ms,
            last_video_pts_ms: 0,
            last_audio_pts_ms: 0,
            stats: ProducerStats::default(),
        }
    }

    /// Loop until the source runs dry or a stop is requested
    pub fn run(mut self) -> ProducerStats {
        let _finish = FinishGuard(Arc::clone(&self.shared));
        tracing::info!(source = self.source.name(), "Decode thread started");

        loop {
            match self.step() {
                Step::Exhausted => {
                    tracing::info!("Source exhausted");
                    break;
                }
                Step::Stopped => {
                    tracing::info!("Decode thread stopping on request");
                    break;
                }
                _ => {}
            }
        }

        tracing::info!(
            video_frames = self.stats.video_frames,
            audio_frames = self.stats.audio_frames,
            skipped = self.stats.skipped,
            dropped = self.stats.dropped,
            waits = self.stats.waits,
            "Decode thread finished"
        );
        self.stats
    }

    /// One iteration of the loop
    pub fn step(&mut self) -> Step {
        if self.shared.is_stop_requested() {
            return Step::Stopped;
        }

        if self.shared.is_saturated() {
            self.stats.waits += 1;
            tracing::trace!(
                video = self.shared.video.len(),
                audio = self.shared.audio.len(),
                "Queues saturated, waiting"
            );
            self.shared.signal.wait();
            return Step::Waited;
        }

        let unit = match self.source.next_unit() {
            Ok(Some(unit)) => unit,
            Ok(None) => return Step::Exhausted,
            Err(e) => {
                tracing::error!(error = %e, "Read failed, ending decode");
                return Step::Exhausted;
            }
        };

        match self.shared.streams.classify(unit.stream_index) {
            Some(kind) => self.process(kind, &unit.payload),
            None => {
                self.stats.discarded += 1;
                Step::Discarded
            }
        }
    }

    pub fn stats(&self) -> &ProducerStats {
        &self.stats
    }

    fn process(&mut self, kind: StreamKind, packet: &S::Packet) -> Step {
        let decoded = match kind {
            StreamKind::Video => self.source.decode_video(packet),
            StreamKind::Audio => self.source.decode_audio(packet),
        };
        let frame = match decoded {
            Ok(frame) => frame,
            Err(DecodeError::NeedMoreInput) => {
                self.stats.need_more_input += 1;
                return Step::NeedMoreInput;
            }
            Err(e) => {
                tracing::warn!(?kind, error = %e, "Skipping undecodable unit");
                self.stats.skipped += 1;
                return Step::Skipped;
            }
        };

        let pts_ms = self.resolve_pts(kind, self.source.frame_pts(&frame));

        let config = &self.shared.config;
        let converted = match kind {
            StreamKind::Video => self.source.scale(&frame, &config.video),
            StreamKind::Audio => self.source.resample(&frame, &config.audio),
        };
        let buffer = match converted {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(?kind, pts_ms, error = %e, "Dropping frame");
                self.stats.dropped += 1;
                return Step::Dropped;
            }
        };

        tracing::debug!(?kind, pts_ms, bytes = buffer.len(), "Queued frame");
        match kind {
            StreamKind::Video => {
                self.shared.video.push(buffer, pts_ms);
                self.stats.video_frames += 1;
            }
            StreamKind::Audio => {
                self.shared.audio.push(buffer, pts_ms);
                self.stats.audio_frames += 1;
            }
        }
        Step::Pushed(kind)
    }

    /// Ticks to ms; a frame without PTS inherits the stream's last one
    fn resolve_pts(&mut self, kind: StreamKind, ticks: Option<i64>) -> i64 {
        let (time_base_ms, last) = match kind {
            StreamKind::Video => (self.video_time_base_ms, &mut self.last_video_pts_ms),
            StreamKind::Audio => (self.audio_time_base_ms, &mut self.last_audio_pts_ms),
        };
        match ticks {
            Some(ticks) => {
                *last = ticks_to_ms(ticks, time_base_ms);
            }
            None => self.stats.missing_pts += 1,
        }
        *last
    }
}
