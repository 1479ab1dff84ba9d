//! # Cadence Player
//!
//! Headless front end for cadence-core: opens a file (or the built-in
//! synthetic source), presents video paced to the audio clock, and reports
//! what happened.

mod sink;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;

use cadence_core::audio_feed::FeederStats;
use cadence_core::producer::ProducerStats;
use cadence_core::synthetic::{SyntheticConfig, SyntheticSource};
use cadence_core::video_present::PresenterStats;
use cadence_core::{
    BackpressurePolicy, MediaSource, Pipeline, PipelineConfig, PipelineStats, PlaybackHandle,
    StreamKind,
};

use sink::{FrameLog, FrameLogStats, PacedAudioSink};

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Default)]
struct Options {
    input: Option<PathBuf>,
    synthetic: bool,
    /// Stop after this many video frames; 0 plays to the end
    frames: u64,
    config: Option<PathBuf>,
    width: Option<u32>,
    height: Option<u32>,
    high_water_mark: Option<usize>,
    per_queue: bool,
    no_audio_device: bool,
    stats_json: bool,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut options = Options::default();

    fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
        args.get(i + 1)
            .map(String::as_str)
            .ok_or_else(|| anyhow::anyhow!("Missing value for {}", flag))
    }
    fn number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value {} for {}: {}", value, flag, e))
    }

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--input" | "-i" => {
                options.input = Some(PathBuf::from(value(args, i, flag)?));
                i += 2;
            }
            "--synthetic" => {
                options.synthetic = true;
                i += 1;
            }
            "--frames" | "-n" => {
                options.frames = number(value(args, i, flag)?, flag)?;
                i += 2;
            }
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(value(args, i, flag)?));
                i += 2;
            }
            "--width" => {
                options.width = Some(number(value(args, i, flag)?, flag)?);
                i += 2;
            }
            "--height" => {
                options.height = Some(number(value(args, i, flag)?, flag)?);
                i += 2;
            }
            "--high-water" => {
                options.high_water_mark = Some(number(value(args, i, flag)?, flag)?);
                i += 2;
            }
            "--per-queue" => {
                options.per_queue = true;
                i += 1;
            }
            "--no-audio-device" => {
                options.no_audio_device = true;
                i += 1;
            }
            "--stats-json" => {
                options.stats_json = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    if options.input.is_none() && !options.synthetic {
        print_usage();
        return Err(anyhow::anyhow!("Missing required --input (or --synthetic)"));
    }
    Ok(options)
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  cadence --input <file> [options]\n  cadence --synthetic [--input <synthetic.json>] [options]\n\n\
         Options:\n  \
         -n, --frames <n>      stop after n video frames (default: play to the end)\n  \
         -c, --config <file>   pipeline config (JSON)\n  \
         --width <px>          video target width\n  \
         --height <px>         video target height\n  \
         --high-water <n>      queue depth above which decoding pauses\n  \
         --per-queue           throttle on either queue instead of both\n  \
         --no-audio-device     pull audio on a timer instead of a sound card\n  \
         --stats-json          print final statistics as JSON\n"
    );
}

/// Config file first, command-line overrides on top
fn build_config(options: &Options) -> Result<PipelineConfig> {
    let mut config = match &options.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(width) = options.width {
        config.video.width = width;
    }
    if let Some(height) = options.height {
        config.video.height = height;
    }
    if let Some(mark) = options.high_water_mark {
        config.high_water_mark = mark;
    }
    if options.per_queue {
        config.backpressure = BackpressurePolicy::PerQueue;
    }
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Interrupt
// ============================================================================

/// Routes Ctrl-C to the pipeline that is currently playing
#[derive(Clone, Default)]
struct Interrupt {
    target: Arc<Mutex<Option<PlaybackHandle>>>,
}

impl Interrupt {
    /// Process-wide; a second Ctrl-C while stopping exits at once
    fn install() -> Result<Self> {
        let interrupt = Self::default();
        let hook = interrupt.clone();
        ctrlc::set_handler(move || {
            if !hook.fire() {
                std::process::exit(130);
            }
        })?;
        Ok(interrupt)
    }

    fn attach(&self, handle: &PlaybackHandle) {
        *self.target.lock() = Some(handle.clone());
    }

    fn is_attached(&self) -> bool {
        self.target.lock().is_some()
    }

    /// Ask the attached pipeline to stop; `false` if there is nothing to stop
    fn fire(&self) -> bool {
        match self.target.lock().as_ref() {
            Some(handle) if !handle.is_stop_requested() => {
                tracing::info!("Interrupted, stopping playback");
                handle.request_stop();
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// Playback
// ============================================================================

#[derive(Debug, Serialize)]
struct PlaybackReport {
    producer: ProducerStats,
    pipeline: PipelineStats,
    presenter: PresenterStats,
    frames: FrameLogStats,
    audio: Option<FeederStats>,
}

enum AudioSink {
    #[cfg(feature = "audio")]
    Device(cadence_core::audio_output::AudioOutput),
    Paced(PacedAudioSink),
    None,
}

impl AudioSink {
    fn start(handle: &PlaybackHandle, options: &Options) -> Result<Self> {
        if !handle.streams().has(StreamKind::Audio) {
            return Ok(Self::None);
        }

        #[cfg(feature = "audio")]
        if !options.no_audio_device {
            match cadence_core::audio_output::AudioOutput::start(handle) {
                Ok(output) => return Ok(Self::Device(output)),
                Err(e) => tracing::warn!("Audio device unavailable ({}), using paced sink", e),
            }
        }
        #[cfg(not(feature = "audio"))]
        let _ = options.no_audio_device;

        Ok(Self::Paced(PacedAudioSink::spawn(handle)?))
    }

    fn finish(self) -> Result<Option<FeederStats>> {
        match self {
            #[cfg(feature = "audio")]
            Self::Device(output) => Ok(Some(output.stats())),
            Self::Paced(sink) => sink.join().map(Some),
            Self::None => Ok(None),
        }
    }
}

fn play<S>(
    source: S,
    config: PipelineConfig,
    options: &Options,
    interrupt: &Interrupt,
) -> Result<()>
where
    S: MediaSource + Send + 'static,
{
    let video_target = config.video;
    let poll = config.poll_interval();
    let pipeline = Pipeline::start(source, config)?;
    let handle = pipeline.handle();
    interrupt.attach(&handle);

    let audio = AudioSink::start(&handle, options)?;
    let mut presenter = handle.video_presenter();
    let mut frames = FrameLog::new(video_target);

    if handle.streams().has(StreamKind::Video) {
        while let Some(frame) = presenter.wait_for_frame() {
            frames.present(&frame);
            if options.frames > 0 && frames.stats().frames >= options.frames {
                tracing::info!(frames = options.frames, "Frame limit reached");
                handle.request_stop();
                break;
            }
        }
    }
    // let audio play out whatever is still queued
    while !handle.is_drained() && !handle.is_stop_requested() {
        std::thread::sleep(poll);
    }
    if !handle.is_stop_requested() {
        // device buffers still hold the tail of the last frame
        std::thread::sleep(Duration::from_millis(100));
        handle.request_stop();
    }

    let audio = audio.finish()?;
    let pipeline_stats = handle.stats();
    let producer = pipeline.join()?;

    let report = PlaybackReport {
        producer,
        pipeline: pipeline_stats,
        presenter: presenter.stats().clone(),
        frames: frames.stats().clone(),
        audio,
    };

    tracing::info!(
        frames = report.frames.frames,
        late = report.presenter.late,
        worst_late_ms = report.presenter.worst_lateness_ms,
        audio_underruns = report.audio.as_ref().map_or(0, |a| a.underruns),
        reanchors = report.pipeline.clock.reanchors,
        "Playback complete"
    );
    if options.stats_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

fn open_synthetic(options: &Options) -> Result<SyntheticSource> {
    Ok(match &options.input {
        Some(path) => SyntheticSource::open(path)?,
        None => SyntheticSource::new(SyntheticConfig::default()),
    })
}

#[cfg(feature = "ffmpeg")]
fn play_file(
    path: &std::path::Path,
    config: PipelineConfig,
    options: &Options,
    interrupt: &Interrupt,
) -> Result<()> {
    let source = cadence_core::ffmpeg_source::FfmpegSource::open(path)?;
    play(source, config, options, interrupt)
}

#[cfg(not(feature = "ffmpeg"))]
fn play_file(
    path: &std::path::Path,
    _config: PipelineConfig,
    _options: &Options,
    _interrupt: &Interrupt,
) -> Result<()> {
    Err(anyhow::anyhow!(
        "Cannot play {:?}: built without the `ffmpeg` feature (try --synthetic)",
        path
    ))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cadence=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;
    let config = build_config(&options)?;

    tracing::info!(
        "Cadence Player v{} (core {})",
        env!("CARGO_PKG_VERSION"),
        cadence_core::VERSION
    );

    let interrupt = Interrupt::install()?;
    if options.synthetic {
        play(open_synthetic(&options)?, config, &options, &interrupt)
    } else {
        match &options.input {
            Some(path) => play_file(path, config, &options, &interrupt),
            None => Err(anyhow::anyhow!("Missing required --input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("cadence")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        let options = parse_args(&args(&[
            "--input", "clip.mkv", "-n", "30", "--high-water", "8", "--per-queue",
        ]))
        .unwrap();
        assert_eq!(options.input, Some(PathBuf::from("clip.mkv")));
        assert_eq!(options.frames, 30);
        assert_eq!(options.high_water_mark, Some(8));
        assert!(options.per_queue);
        assert!(!options.synthetic);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["--input"])).is_err());
        assert!(parse_args(&args(&["--synthetic", "--frames", "many"])).is_err());
    }

    #[test]
    fn test_overrides_apply_on_top_of_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "high_water_mark": 3, "video": {{ "width": 1280, "height": 720 }} }}"#
        )
        .unwrap();
        let options = Options {
            synthetic: true,
            config: Some(file.path().to_path_buf()),
            height: Some(540),
            ..Default::default()
        };

        let config = build_config(&options).unwrap();
        assert_eq!(config.high_water_mark, 3);
        assert_eq!(config.video.width, 1280);
        assert_eq!(config.video.height, 540);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let options = Options {
            synthetic: true,
            width: Some(0),
            ..Default::default()
        };
        assert!(build_config(&options).is_err());
    }

    #[test]
    fn test_synthetic_playback_to_end() {
        let source = SyntheticSource::new(SyntheticConfig {
            video_frames: 5,
            video_frame_ms: 5,
            audio_frames: 5,
            audio_frame_samples: 240,
            ..Default::default()
        });
        let options = Options {
            synthetic: true,
            no_audio_device: true,
            ..Default::default()
        };
        play(source, PipelineConfig::default(), &options, &Interrupt::default()).unwrap();
    }

    #[test]
    fn test_interrupt_ends_playback_cleanly() {
        // 40 seconds of material, stopped a moment after it starts
        let source = SyntheticSource::new(SyntheticConfig {
            video_frames: 1_000,
            audio_frames: 1_000,
            audio_frame_samples: 1_920,
            ..Default::default()
        });
        let options = Options {
            synthetic: true,
            no_audio_device: true,
            ..Default::default()
        };
        let interrupt = Interrupt::default();
        assert!(!interrupt.fire());

        let remote = interrupt.clone();
        let stopper = std::thread::spawn(move || {
            while !remote.is_attached() {
                std::thread::sleep(Duration::from_millis(1));
            }
            std::thread::sleep(Duration::from_millis(100));
            let fired = remote.fire();
            // already stopping, nothing more to do
            assert!(!remote.fire());
            fired
        });

        let start = std::time::Instant::now();
        play(source, PipelineConfig::default(), &options, &interrupt).unwrap();
        assert!(stopper.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
