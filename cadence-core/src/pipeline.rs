//! # Playback Pipeline
//!
//! Owns everything the decode thread and the consumers share: two frame
//! queues, the buffer-availability signal, the presentation clock, the
//! end-of-stream state and the stop flag.
//!
//! ```text
//!               ┌──────────────┐
//!               │ MediaSource  │
//!               └──────┬───────┘
//!                      │ decode thread
//!            ┌─────────┴─────────┐
//!            ▼                   ▼
//!     ┌────────────┐      ┌────────────┐
//!     │ video queue│      │ audio queue│
//!     └─────┬──────┘      └─────┬──────┘
//!           ▼                   ▼
//!   VideoPresenter        AudioFeeder
//!           └──── notify ───────┘
//!                  │
//!           BufferSignal ──► decode thread
//! ```

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::audio_feed::AudioFeeder;
use crate::config::{BackpressurePolicy, ConfigError, PipelineConfig};
use crate::frame_queue::{FrameQueue, QueueStats};
use crate::producer::{DecodeProducer, ProducerStats};
use crate::signal::BufferSignal;
use crate::source::{MediaSource, SourceError, StreamKind, StreamSet};
use crate::sync::{ClockStats, PresentationClock};
use crate::video_present::VideoPresenter;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to spawn decode thread: {0}")]
    Spawn(std::io::Error),
    #[error("Decode thread panicked")]
    ProducerPanicked,
}

// ============================================================================
// End-of-stream state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndState {
    Running,
    /// No more pushes; queues may still hold frames
    ProducerFinished,
    /// Producer finished and both queues are empty
    Drained,
}

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct Shared {
    pub(crate) video: FrameQueue<Vec<u8>>,
    pub(crate) audio: FrameQueue<Vec<u8>>,
    pub(crate) signal: BufferSignal,
    pub(crate) clock: PresentationClock,
    pub(crate) config: PipelineConfig,
    pub(crate) streams: StreamSet,
    finished: Mutex<bool>,
    stop: Mutex<bool>,
}

impl Shared {
    pub(crate) fn new(config: PipelineConfig, streams: StreamSet) -> Self {
        let capacity = config.high_water_mark + 2;
        Self {
            video: FrameQueue::with_capacity(capacity),
            audio: FrameQueue::with_capacity(capacity),
            signal: BufferSignal::new(),
            clock: PresentationClock::new(),
            config,
            streams,
            finished: Mutex::new(false),
            stop: Mutex::new(false),
        }
    }

    pub(crate) fn request_stop(&self) {
        *self.stop.lock() = true;
        // a parked producer has to see the flag
        self.signal.notify();
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        *self.stop.lock()
    }

    pub(crate) fn mark_finished(&self) {
        *self.finished.lock() = true;
    }

    pub(crate) fn is_finished(&self) -> bool {
        *self.finished.lock()
    }

    pub(crate) fn end_state(&self) -> EndState {
        if !self.is_finished() {
            EndState::Running
        } else if self.video.is_empty() && self.audio.is_empty() {
            EndState::Drained
        } else {
            EndState::ProducerFinished
        }
    }

    /// Whether the producer should park before pulling another unit.
    ///
    /// A queue whose stream the source lacks counts as saturated under
    /// [`BackpressurePolicy::Coarse`] and as never saturated under
    /// [`BackpressurePolicy::PerQueue`].
    pub(crate) fn is_saturated(&self) -> bool {
        let mark = self.config.high_water_mark;
        let over = |kind: StreamKind, queue: &FrameQueue<Vec<u8>>| {
            self.streams.has(kind).then(|| queue.len() > mark)
        };
        let video = over(StreamKind::Video, &self.video);
        let audio = over(StreamKind::Audio, &self.audio);

        match self.config.backpressure {
            BackpressurePolicy::Coarse => video.unwrap_or(true) && audio.unwrap_or(true),
            BackpressurePolicy::PerQueue => video.unwrap_or(false) || audio.unwrap_or(false),
        }
    }
}

// ============================================================================
// Consumer handle
// ============================================================================

/// Cheap, cloneable view of a running pipeline for consumer threads
#[derive(Clone)]
pub struct PlaybackHandle {
    shared: Arc<Shared>,
}

impl PlaybackHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Next decoded video frame and its PTS in ms, never blocking
    pub fn pop_video_frame(&self) -> Option<(Vec<u8>, i64)> {
        let frame = self.shared.video.pop()?;
        self.shared.clock.anchor_if_unset(Instant::now());
        Some(frame.into_parts())
    }

    /// Next resampled audio frame and its PTS in ms, never blocking
    pub fn pop_audio_frame(&self) -> Option<(Vec<u8>, i64)> {
        let frame = self.shared.audio.pop()?;
        self.shared.clock.anchor_if_unset(Instant::now());
        Some(frame.into_parts())
    }

    /// Tell the producer a slot may have opened up
    pub fn notify_consumed(&self) {
        self.shared.signal.notify();
    }

    /// The producer will push nothing more
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    pub fn is_drained(&self) -> bool {
        self.shared.end_state() == EndState::Drained
    }

    pub fn end_state(&self) -> EndState {
        self.shared.end_state()
    }

    pub fn request_stop(&self) {
        if !self.shared.is_stop_requested() {
            tracing::info!("Stop requested");
        }
        self.shared.request_stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.is_stop_requested()
    }

    pub fn clock(&self) -> &PresentationClock {
        &self.shared.clock
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn streams(&self) -> &StreamSet {
        &self.shared.streams
    }

    pub fn video_presenter(&self) -> VideoPresenter {
        VideoPresenter::new(self.clone())
    }

    pub fn audio_feeder(&self) -> AudioFeeder {
        AudioFeeder::new(self.clone())
    }

    pub fn video_depth(&self) -> usize {
        self.shared.video.len()
    }

    pub fn audio_depth(&self) -> usize {
        self.shared.audio.len()
    }

    /// Whether the decode thread is parked on the availability signal
    pub fn is_producer_waiting(&self) -> bool {
        self.shared.signal.is_waiting()
    }

    pub fn stats(&self) -> PipelineStats {
        let (notifications, wakeups) = self.shared.signal.counters();
        PipelineStats {
            end_state: self.shared.end_state(),
            stop_requested: self.shared.is_stop_requested(),
            video: self.shared.video.stats(),
            audio: self.shared.audio.stats(),
            clock: self.shared.clock.stats(),
            notifications,
            wakeups,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub end_state: EndState,
    pub stop_requested: bool,
    pub video: QueueStats,
    pub audio: QueueStats,
    pub clock: ClockStats,
    /// Consumer notifications sent to the producer
    pub notifications: u64,
    /// Times the producer woke from a backpressure wait
    pub wakeups: u64,
}

// ============================================================================
// Pipeline
// ============================================================================

/// A running decode thread plus the handle its consumers use.
///
/// Dropping the pipeline requests a stop and joins the thread.
pub struct Pipeline {
    handle: PlaybackHandle,
    producer: Option<JoinHandle<ProducerStats>>,
}

impl Pipeline {
    /// Open `path` with source type `S` and start decoding
    pub fn open<S>(path: &Path, config: PipelineConfig) -> Result<Self, PipelineError>
    where
        S: MediaSource + Send + 'static,
    {
        let source = S::open(path)?;
        Self::start(source, config)
    }

    /// Start decoding an already opened source
    pub fn start<S>(source: S, config: PipelineConfig) -> Result<Self, PipelineError>
    where
        S: MediaSource + Send + 'static,
    {
        config.validate()?;
        let streams = source.streams().clone();
        if streams.is_empty() {
            return Err(SourceError::NoStreams(source.name().into()).into());
        }

        tracing::info!(
            source = source.name(),
            video = ?streams
                .video
                .as_ref()
                .map(|v| (v.width, v.height, v.stream.codec.as_str())),
            audio = ?streams
                .audio
                .as_ref()
                .map(|a| (a.sample_rate, a.channels, a.stream.codec.as_str())),
            high_water_mark = config.high_water_mark,
            backpressure = ?config.backpressure,
            "Starting pipeline"
        );

        let shared = Arc::new(Shared::new(config, streams));
        let producer = DecodeProducer::new(source, Arc::clone(&shared));
        let thread = std::thread::Builder::new()
            .name("cadence-decode".into())
            .spawn(move || producer.run())
            .map_err(PipelineError::Spawn)?;

        Ok(Self {
            handle: PlaybackHandle::new(shared),
            producer: Some(thread),
        })
    }

    pub fn handle(&self) -> PlaybackHandle {
        self.handle.clone()
    }

    /// Wait for the decode thread to exit and collect its counters
    pub fn join(mut self) -> Result<ProducerStats, PipelineError> {
        match self.producer.take() {
            Some(thread) => thread.join().map_err(|_| PipelineError::ProducerPanicked),
            None => Ok(ProducerStats::default()),
        }
    }
}

impl std::ops::Deref for Pipeline {
    type Target = PlaybackHandle;

    fn deref(&self) -> &PlaybackHandle {
        &self.handle
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(thread) = self.producer.take() {
            self.handle.request_stop();
            if thread.join().is_err() {
                tracing::error!("Decode thread panicked during shutdown");
            }
        }
    }
}
