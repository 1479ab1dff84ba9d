//! # Cadence Core
//!
//! Producer/consumer engine for media playback: a decode thread fills
//! timestamped frame queues, consumers drain them paced to wall-clock time,
//! and a wait/notify signal keeps the decoder from running ahead.

// ============================================================================
// Queues / Signalling
// ============================================================================
pub mod frame_queue;
pub mod signal;

// ============================================================================
// Timing
// ============================================================================
pub mod sync;

// ============================================================================
// Configuration / Formats
// ============================================================================
pub mod config;
pub mod format;

// ============================================================================
// Sources
// ============================================================================
pub mod source;
pub mod synthetic;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_source;

// ============================================================================
// Pipeline
// ============================================================================
pub mod producer;
pub mod pipeline;

// ============================================================================
// Consumers
// ============================================================================
pub mod video_present;
pub mod audio_feed;
#[cfg(feature = "audio")]
pub mod audio_output;

pub use config::{BackpressurePolicy, ConfigError, PipelineConfig};
pub use pipeline::{EndState, Pipeline, PipelineError, PipelineStats, PlaybackHandle};
pub use source::{MediaSource, SourceError, StreamKind};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
