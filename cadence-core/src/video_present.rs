//! Video consumer: pop, pace against the presentation clock, hand over.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::pipeline::PlaybackHandle;
use crate::sync::Pacing;

/// A frame due for display now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub pts_ms: i64,
    /// How far past its deadline the frame was handed over
    pub lateness: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presented {
    Frame(VideoFrame),
    /// Nothing queued yet; poll again
    Empty,
    Drained,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenterStats {
    pub presented: u64,
    pub on_time: u64,
    pub late: u64,
    pub worst_lateness_ms: u64,
    /// Frames cut short by the max-wait cap
    pub capped_waits: u64,
    pub empty_polls: u64,
}

/// Paces popped video frames to the playback clock.
///
/// Late frames are handed over immediately, never dropped.
pub struct VideoPresenter {
    handle: PlaybackHandle,
    stats: PresenterStats,
}

impl VideoPresenter {
    pub fn new(handle: PlaybackHandle) -> Self {
        Self {
            handle,
            stats: PresenterStats::default(),
        }
    }

    /// Pop the next frame and sleep until it is due
    pub fn next_frame(&mut self) -> Presented {
        if self.handle.is_stop_requested() {
            return Presented::Stopped;
        }

        let Some((data, pts_ms)) = self.handle.pop_video_frame() else {
            if self.handle.is_drained() {
                return Presented::Drained;
            }
            self.stats.empty_polls += 1;
            return Presented::Empty;
        };
        self.handle.notify_consumed();

        match self.pace(pts_ms) {
            Some(lateness) => {
                self.record(pts_ms, lateness);
                Presented::Frame(VideoFrame {
                    data,
                    pts_ms,
                    lateness,
                })
            }
            None => Presented::Stopped,
        }
    }

    /// Block until a frame is due, the stream drains or a stop arrives
    pub fn wait_for_frame(&mut self) -> Option<VideoFrame> {
        let poll = self.handle.config().poll_interval();
        loop {
            match self.next_frame() {
                Presented::Frame(frame) => return Some(frame),
                Presented::Empty => std::thread::sleep(poll),
                Presented::Drained | Presented::Stopped => return None,
            }
        }
    }

    pub fn stats(&self) -> &PresenterStats {
        &self.stats
    }

    pub fn handle(&self) -> &PlaybackHandle {
        &self.handle
    }

    /// Sleep in slices until `pts_ms` is due; `None` if stopped meanwhile
    fn pace(&mut self, pts_ms: i64) -> Option<Duration> {
        let config = self.handle.config();
        let slice = config.pacing_slice();
        let give_up = Instant::now() + config.max_wait();

        loop {
            let now = Instant::now();
            let wait = match self.handle.clock().pacing(pts_ms, now) {
                Some(Pacing::Wait(wait)) => wait,
                Some(Pacing::Late(lateness)) => return Some(lateness),
                None => return Some(Duration::ZERO),
            };

            if now >= give_up {
                tracing::debug!(
                    pts_ms,
                    remaining_ms = wait.as_millis() as u64,
                    "Frame held too long, showing now"
                );
                self.stats.capped_waits += 1;
                return Some(Duration::ZERO);
            }
            if self.handle.is_stop_requested() {
                return None;
            }
            std::thread::sleep(wait.min(slice).min(give_up - now));
        }
    }

    fn record(&mut self, pts_ms: i64, lateness: Duration) {
        self.stats.presented += 1;
        // within one pacing slice counts as on time
        if lateness <= self.handle.config().pacing_slice() {
            self.stats.on_time += 1;
        } else {
            self.stats.late += 1;
            let late_ms = lateness.as_millis() as u64;
            self.stats.worst_lateness_ms = self.stats.worst_lateness_ms.max(late_ms);
            tracing::debug!(pts_ms, late_ms, "Late video frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::Pipeline;
    use crate::synthetic::{payload_index, SyntheticConfig, SyntheticSource};

    fn video_only(frames: u32, frame_ms: u32) -> SyntheticSource {
        SyntheticSource::new(SyntheticConfig {
            video_frames: frames,
            video_frame_ms: frame_ms,
            audio: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_frames_not_shown_before_deadline() {
        let pipeline = Pipeline::start(video_only(3, 33), PipelineConfig::default()).unwrap();
        let mut presenter = pipeline.video_presenter();

        let first = presenter.wait_for_frame().unwrap();
        let t0 = pipeline.clock().anchor().unwrap();
        assert_eq!(first.pts_ms, 0);

        let mut pts = vec![first.pts_ms];
        while let Some(frame) = presenter.wait_for_frame() {
            assert!(Instant::now() >= t0 + Duration::from_millis(frame.pts_ms as u64));
            pts.push(frame.pts_ms);
        }
        assert_eq!(pts, vec![0, 33, 66]);
        assert_eq!(presenter.stats().presented, 3);
    }

    #[test]
    fn test_late_frames_are_shown_not_dropped() {
        let pipeline = Pipeline::start(video_only(4, 10), PipelineConfig::default()).unwrap();
        let handle = pipeline.handle();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut presenter = handle.video_presenter();
        let first = presenter.wait_for_frame().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let mut indices = vec![payload_index(&first.data).unwrap()];
        while let Some(frame) = presenter.wait_for_frame() {
            assert!(frame.lateness > Duration::ZERO);
            indices.push(payload_index(&frame.data).unwrap());
        }
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(presenter.stats().late, 3);
        assert!(presenter.stats().worst_lateness_ms >= 60);
    }

    #[test]
    fn test_max_wait_caps_pts_jump() {
        let config = PipelineConfig {
            max_wait_ms: 20,
            ..Default::default()
        };
        // second frame is due 5s after the first
        let pipeline = Pipeline::start(video_only(2, 5_000), config).unwrap();
        let mut presenter = pipeline.video_presenter();

        let start = Instant::now();
        assert!(presenter.wait_for_frame().is_some());
        assert!(presenter.wait_for_frame().is_some());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(presenter.stats().capped_waits, 1);
    }

    #[test]
    fn test_stop_interrupts_pacing() {
        let config = PipelineConfig {
            max_wait_ms: 60_000,
            ..Default::default()
        };
        let pipeline = Pipeline::start(video_only(2, 10_000), config).unwrap();
        let handle = pipeline.handle();
        let mut presenter = handle.video_presenter();
        assert!(presenter.wait_for_frame().is_some());

        let stopper = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                handle.request_stop();
            })
        };
        let start = Instant::now();
        let outcome = loop {
            match presenter.next_frame() {
                Presented::Empty => std::thread::sleep(Duration::from_millis(1)),
                other => break other,
            }
        };
        assert_eq!(outcome, Presented::Stopped);
        assert!(start.elapsed() < Duration::from_secs(2));
        stopper.join().unwrap();
    }

    #[test]
    fn test_drained_after_last_frame() {
        let pipeline = Pipeline::start(video_only(1, 40), PipelineConfig::default()).unwrap();
        let mut presenter = pipeline.video_presenter();
        assert!(presenter.wait_for_frame().is_some());
        assert_eq!(presenter.wait_for_frame(), None);
        assert_eq!(presenter.next_frame(), Presented::Drained);
    }
}
