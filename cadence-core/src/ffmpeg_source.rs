//! FFmpeg-backed media source (`ffmpeg` feature).
//!
//! Demuxing, decoding, scaling and resampling all happen inside libav*;
//! this module only adapts them to [`MediaSource`]. Decoders may hold
//! frames back (B-frames, codec delay), so every decode call drains the
//! decoder into a small pending list and hands out the oldest frame. At end
//! of input the source emits empty "flush" units until the decoders are dry.

use std::collections::VecDeque;
use std::path::Path;

use ffmpeg_next as ffmpeg;

use ffmpeg::format::{sample, Pixel, Sample};
use ffmpeg::software::{resampling, scaling};
use ffmpeg::{frame, media, Packet};

use crate::format::{AudioTarget, ChannelLayout, PixelFormat, SampleFormat, VideoTarget};
use crate::source::{
    AudioStreamInfo, CompressedUnit, ConvertError, DecodeError, MediaSource, SourceError,
    StreamInfo, StreamSet, VideoStreamInfo,
};

/// Decoded frame straight out of libavcodec
pub enum FfmpegFrame {
    Video(frame::Video),
    Audio(frame::Audio),
}

#[derive(Default)]
struct Drain {
    /// Flush unit already handed out
    flush_emitted: bool,
    eof_sent: bool,
}

#[derive(Clone, Copy, PartialEq)]
struct ScalerKey {
    format: Pixel,
    width: u32,
    height: u32,
    target: VideoTarget,
}

#[derive(Clone, Copy, PartialEq)]
struct ResamplerKey {
    format: Sample,
    layout: ffmpeg::ChannelLayout,
    rate: u32,
    target: AudioTarget,
}

pub struct FfmpegSource {
    name: String,
    input: ffmpeg::format::context::Input,
    streams: StreamSet,
    video: Option<ffmpeg::decoder::Video>,
    audio: Option<ffmpeg::decoder::Audio>,
    pending_video: VecDeque<frame::Video>,
    pending_audio: VecDeque<frame::Audio>,
    video_drain: Drain,
    audio_drain: Drain,
    end_of_input: bool,
    scaler: Option<(ScalerKey, scaling::Context)>,
    resampler: Option<(ResamplerKey, resampling::Context)>,
}

// SAFETY: the libav contexts hold raw pointers, but a source is moved into
// the decode thread once and only ever touched from there.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    fn open_video(
        input: &ffmpeg::format::context::Input,
    ) -> Option<(VideoStreamInfo, ffmpeg::decoder::Video)> {
        let stream = input.streams().best(media::Type::Video)?;
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|context| context.decoder().video());
        let decoder = match decoder {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::warn!(
                    stream = stream.index(),
                    error = %e,
                    "Cannot open video decoder, ignoring stream"
                );
                return None;
            }
        };

        let rate = stream.avg_frame_rate();
        let frame_rate = (rate.numerator() > 0 && rate.denominator() > 0)
            .then(|| rate.numerator() as f64 / rate.denominator() as f64);

        let info = VideoStreamInfo {
            stream: StreamInfo {
                index: stream.index(),
                time_base_ms: rational_ms(stream.time_base()),
                codec: format!("{:?}", stream.parameters().id()).to_lowercase(),
            },
            width: decoder.width(),
            height: decoder.height(),
            frame_rate,
        };
        Some((info, decoder))
    }

    fn open_audio(
        input: &ffmpeg::format::context::Input,
    ) -> Option<(AudioStreamInfo, ffmpeg::decoder::Audio)> {
        let stream = input.streams().best(media::Type::Audio)?;
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|context| context.decoder().audio());
        let decoder = match decoder {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::warn!(
                    stream = stream.index(),
                    error = %e,
                    "Cannot open audio decoder, ignoring stream"
                );
                return None;
            }
        };

        let info = AudioStreamInfo {
            stream: StreamInfo {
                index: stream.index(),
                time_base_ms: rational_ms(stream.time_base()),
                codec: format!("{:?}", stream.parameters().id()).to_lowercase(),
            },
            sample_rate: decoder.rate(),
            channels: decoder.channels() as u16,
        };
        Some((info, decoder))
    }

    /// Next empty unit needed to flush a decoder, once input has ended
    fn next_flush_unit(&mut self) -> Option<CompressedUnit<Packet>> {
        let candidates = [
            (
                self.streams.video.as_ref().map(|v| v.stream.index),
                &mut self.video_drain,
                !self.pending_video.is_empty(),
            ),
            (
                self.streams.audio.as_ref().map(|a| a.stream.index),
                &mut self.audio_drain,
                !self.pending_audio.is_empty(),
            ),
        ];

        for (index, drain, has_pending) in candidates {
            let Some(index) = index else { continue };
            if !drain.flush_emitted || has_pending {
                drain.flush_emitted = true;
                return Some(CompressedUnit {
                    stream_index: index,
                    payload: Packet::empty(),
                });
            }
        }
        None
    }
}

/// Milliseconds per tick of an ffmpeg time base
fn rational_ms(time_base: ffmpeg::Rational) -> f64 {
    if time_base.denominator() == 0 {
        return 1.0;
    }
    time_base.numerator() as f64 * 1000.0 / time_base.denominator() as f64
}

/// Feed one packet (or EOF for an empty one) and hand back the oldest frame
fn decode_into<F>(
    decoder: &mut ffmpeg::decoder::Opened,
    packet: &Packet,
    drain: &mut Drain,
    pending: &mut VecDeque<F>,
    empty: fn() -> F,
) -> Result<F, DecodeError>
where
    F: std::ops::DerefMut<Target = frame::Frame>,
{
    if packet.size() == 0 {
        if !drain.eof_sent {
            drain.eof_sent = true;
            decoder
                .send_eof()
                .map_err(|e| DecodeError::Failed(e.to_string()))?;
        }
    } else {
        decoder
            .send_packet(packet)
            .map_err(|e| DecodeError::Failed(e.to_string()))?;
    }

    let mut decoded = empty();
    while decoder.receive_frame(&mut *decoded).is_ok() {
        pending.push_back(decoded);
        decoded = empty();
    }
    pending.pop_front().ok_or(DecodeError::NeedMoreInput)
}

fn pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Rgba => Pixel::RGBA,
    }
}

fn sample_format(format: SampleFormat) -> Sample {
    match format {
        SampleFormat::U8 => Sample::U8(sample::Type::Packed),
        SampleFormat::S16 => Sample::I16(sample::Type::Packed),
        SampleFormat::S32 => Sample::I32(sample::Type::Packed),
        SampleFormat::F32 => Sample::F32(sample::Type::Packed),
    }
}

fn channel_layout(layout: ChannelLayout) -> ffmpeg::ChannelLayout {
    match layout {
        ChannelLayout::Mono => ffmpeg::ChannelLayout::MONO,
        ChannelLayout::Stereo => ffmpeg::ChannelLayout::STEREO,
    }
}

impl MediaSource for FfmpegSource {
    type Packet = Packet;
    type Frame = FfmpegFrame;

    fn open(path: &Path) -> Result<Self, SourceError> {
        let cannot_open = |e: ffmpeg::Error| SourceError::CannotOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        ffmpeg::init().map_err(cannot_open)?;
        let input = ffmpeg::format::input(&path).map_err(cannot_open)?;

        let (video_info, video) = Self::open_video(&input).unzip();
        let (audio_info, audio) = Self::open_audio(&input).unzip();
        let streams = StreamSet {
            video: video_info,
            audio: audio_info,
        };
        if streams.is_empty() {
            return Err(SourceError::NoStreams(path.to_path_buf()));
        }

        tracing::info!(
            path = %path.display(),
            format = input.format().name(),
            video = streams.video.as_ref().map(|v| v.stream.index),
            audio = streams.audio.as_ref().map(|a| a.stream.index),
            "Opened media"
        );

        Ok(Self {
            name: format!("ffmpeg:{}", path.display()),
            input,
            streams,
            video,
            audio,
            pending_video: VecDeque::new(),
            pending_audio: VecDeque::new(),
            video_drain: Drain::default(),
            audio_drain: Drain::default(),
            end_of_input: false,
            scaler: None,
            resampler: None,
        })
    }

    fn streams(&self) -> &StreamSet {
        &self.streams
    }

    fn next_unit(&mut self) -> Result<Option<CompressedUnit<Packet>>, SourceError> {
        while !self.end_of_input {
            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    return Ok(Some(CompressedUnit {
                        stream_index: packet.stream(),
                        payload: packet,
                    }))
                }
                Err(ffmpeg::Error::Eof) => {
                    tracing::debug!("End of input, flushing decoders");
                    self.end_of_input = true;
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => continue,
                Err(e) => return Err(SourceError::Read(e.to_string())),
            }
        }
        Ok(self.next_flush_unit())
    }

    fn decode_video(&mut self, packet: &Packet) -> Result<FfmpegFrame, DecodeError> {
        let decoder = self
            .video
            .as_mut()
            .ok_or_else(|| DecodeError::Failed("no video decoder".into()))?;
        decode_into(
            decoder,
            packet,
            &mut self.video_drain,
            &mut self.pending_video,
            frame::Video::empty,
        )
        .map(FfmpegFrame::Video)
    }

    fn decode_audio(&mut self, packet: &Packet) -> Result<FfmpegFrame, DecodeError> {
        let decoder = self
            .audio
            .as_mut()
            .ok_or_else(|| DecodeError::Failed("no audio decoder".into()))?;
        decode_into(
            decoder,
            packet,
            &mut self.audio_drain,
            &mut self.pending_audio,
            frame::Audio::empty,
        )
        .map(FfmpegFrame::Audio)
    }

    fn frame_pts(&self, frame: &FfmpegFrame) -> Option<i64> {
        match frame {
            FfmpegFrame::Video(f) => f.timestamp().or_else(|| f.pts()),
            FfmpegFrame::Audio(f) => f.timestamp().or_else(|| f.pts()),
        }
    }

    fn scale(
        &mut self,
        frame: &FfmpegFrame,
        target: &VideoTarget,
    ) -> Result<Vec<u8>, ConvertError> {
        let FfmpegFrame::Video(source) = frame else {
            return Err(ConvertError::Scale("not a video frame".into()));
        };

        let key = ScalerKey {
            format: source.format(),
            width: source.width(),
            height: source.height(),
            target: *target,
        };
        if self.scaler.as_ref().map(|(k, _)| k) != Some(&key) {
            let context = scaling::Context::get(
                key.format,
                key.width,
                key.height,
                pixel(target.pixel_format),
                target.width,
                target.height,
                scaling::Flags::BICUBIC,
            )
            .map_err(|e| ConvertError::Scale(e.to_string()))?;
            tracing::debug!(
                from = ?key.format,
                width = key.width,
                height = key.height,
                to = ?target.pixel_format,
                "Scaler (re)built"
            );
            self.scaler = Some((key, context));
        }
        let Some((_, scaler)) = self.scaler.as_mut() else {
            return Err(ConvertError::Scale("scaler missing".into()));
        };

        let mut scaled = frame::Video::empty();
        scaler
            .run(source, &mut scaled)
            .map_err(|e| ConvertError::Scale(e.to_string()))?;

        // strip per-row padding so the payload is tightly packed
        let mut packed = Vec::with_capacity(target.frame_size());
        for (plane, (row_bytes, rows)) in target
            .pixel_format
            .planes(target.width, target.height)
            .into_iter()
            .enumerate()
        {
            let stride = scaled.stride(plane);
            let data = scaled.data(plane);
            for row in 0..rows {
                let start = row * stride;
                let line = data
                    .get(start..start + row_bytes)
                    .ok_or_else(|| {
                        ConvertError::Scale(format!("plane {plane} shorter than expected"))
                    })?;
                packed.extend_from_slice(line);
            }
        }
        Ok(packed)
    }

    fn resample(
        &mut self,
        frame: &FfmpegFrame,
        target: &AudioTarget,
    ) -> Result<Vec<u8>, ConvertError> {
        let FfmpegFrame::Audio(source) = frame else {
            return Err(ConvertError::Resample("not an audio frame".into()));
        };

        // some decoders leave the layout unset and only report a count
        let layout = if source.channel_layout().is_empty() {
            ffmpeg::ChannelLayout::default(source.channels() as i32)
        } else {
            source.channel_layout()
        };
        let key = ResamplerKey {
            format: source.format(),
            layout,
            rate: source.rate(),
            target: *target,
        };
        if self.resampler.as_ref().map(|(k, _)| k) != Some(&key) {
            let context = resampling::Context::get(
                key.format,
                key.layout,
                key.rate,
                sample_format(target.sample_format),
                channel_layout(target.channel_layout),
                target.rate,
            )
            .map_err(|e| ConvertError::Resample(e.to_string()))?;
            self.resampler = Some((key, context));
        }
        let Some((_, resampler)) = self.resampler.as_mut() else {
            return Err(ConvertError::Resample("resampler missing".into()));
        };

        let mut input = source.clone();
        input.set_channel_layout(layout);
        let mut output = frame::Audio::empty();
        resampler
            .run(&input, &mut output)
            .map_err(|e| ConvertError::Resample(e.to_string()))?;

        let data = output.data(0);
        let len = (output.samples() * target.frame_bytes()).min(data.len());
        Ok(data[..len].to_vec())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rational_ms() {
        assert!((rational_ms(ffmpeg::Rational::new(1, 90_000)) - 1.0 / 90.0).abs() < 1e-12);
        assert_eq!(rational_ms(ffmpeg::Rational::new(1, 1_000)), 1.0);
        assert_eq!(rational_ms(ffmpeg::Rational::new(1, 0)), 1.0);
    }

    #[test]
    fn test_open_missing_file() {
        assert!(matches!(
            FfmpegSource::open(Path::new("/nonexistent/clip.mkv")),
            Err(SourceError::CannotOpen { .. })
        ));
    }

    #[test]
    fn test_target_mapping() {
        assert_eq!(pixel(PixelFormat::Yuv420p), Pixel::YUV420P);
        assert_eq!(sample_format(SampleFormat::S16), Sample::I16(sample::Type::Packed));
        assert_eq!(channel_layout(ChannelLayout::Mono).channels(), 1);
    }
}
