//! # Audio Output - cpal device pull
//!
//! The device thread calls back whenever it needs samples; the callback
//! hands the request straight to an [`AudioFeeder`], which never blocks.
//! The stream is opened in the pipeline's audio target format so resampled
//! bytes only need reinterpreting, not converting.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleRate, SizedSample, Stream, StreamConfig};
use parking_lot::Mutex;
use thiserror::Error;

use crate::audio_feed::{AudioFeeder, FeederStats};
use crate::format::SampleFormat;
use crate::pipeline::PlaybackHandle;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("No audio output device")]
    NoDevice,
    #[error("Cannot build output stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("Cannot start output stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
    #[error("Cannot pause output stream: {0}")]
    Pause(#[from] cpal::PauseStreamError),
}

/// Live device stream. Not `Send`: keep it on the thread that opened it.
pub struct AudioOutput {
    stream: Stream,
    stats: Arc<Mutex<FeederStats>>,
    device_name: String,
}

impl AudioOutput {
    /// Open the default output device and start pulling from `handle`
    pub fn start(handle: &PlaybackHandle) -> Result<Self, OutputError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(OutputError::NoDevice)?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());

        let target = handle.config().audio;
        let config = StreamConfig {
            channels: target.channel_layout.channels(),
            sample_rate: SampleRate(target.rate),
            buffer_size: BufferSize::Default,
        };

        let stats = Arc::new(Mutex::new(FeederStats::default()));
        let feeder = handle.audio_feeder();
        let stream = match target.sample_format {
            SampleFormat::U8 => build_stream(&device, &config, feeder, &stats, u8::from_ne_bytes),
            SampleFormat::S16 => build_stream(&device, &config, feeder, &stats, i16::from_ne_bytes),
            SampleFormat::S32 => build_stream(&device, &config, feeder, &stats, i32::from_ne_bytes),
            SampleFormat::F32 => build_stream(&device, &config, feeder, &stats, f32::from_ne_bytes),
        }?;
        stream.play()?;

        tracing::info!(
            device = %device_name,
            rate = target.rate,
            channels = config.channels,
            format = ?target.sample_format,
            "Audio output started"
        );

        Ok(Self {
            stream,
            stats,
            device_name,
        })
    }

    pub fn pause(&self) -> Result<(), OutputError> {
        self.stream.pause()?;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), OutputError> {
        self.stream.play()?;
        Ok(())
    }

    pub fn stats(&self) -> FeederStats {
        self.stats.lock().clone()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.stream.pause();
    }
}

fn build_stream<T, const N: usize>(
    device: &Device,
    config: &StreamConfig,
    mut feeder: AudioFeeder,
    stats: &Arc<Mutex<FeederStats>>,
    decode: fn([u8; N]) -> T,
) -> Result<Stream, OutputError>
where
    T: SizedSample + Send + 'static,
{
    let stats = Arc::clone(stats);
    let mut scratch = Vec::new();
    let err_fn = |err: cpal::StreamError| tracing::error!(error = %err, "Audio stream error");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len() * N, 0);
            feeder.fill(&mut scratch);
            write_samples(&scratch, data, decode);
            *stats.lock() = feeder.stats().clone();
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Reinterpret packed native-endian bytes as device samples
fn write_samples<T, const N: usize>(bytes: &[u8], out: &mut [T], decode: fn([u8; N]) -> T) {
    for (sample, chunk) in out.iter_mut().zip(bytes.chunks_exact(N)) {
        let mut raw = [0u8; N];
        raw.copy_from_slice(chunk);
        *sample = decode(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_samples_i16() {
        let bytes: Vec<u8> = [1i16, -2, i16::MAX]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        let mut out = [0i16; 3];
        write_samples(&bytes, &mut out, i16::from_ne_bytes);
        assert_eq!(out, [1, -2, i16::MAX]);
    }

    #[test]
    fn test_write_samples_f32() {
        let bytes: Vec<u8> = [0.5f32, -1.0].iter().flat_map(|s| s.to_ne_bytes()).collect();
        let mut out = [0f32; 2];
        write_samples(&bytes, &mut out, f32::from_ne_bytes);
        assert_eq!(out, [0.5, -1.0]);
    }
}
