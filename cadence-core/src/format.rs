//! Consumer-side target formats.
//!
//! The decode stage scales every video frame and resamples every audio frame
//! into one of these fixed targets before it reaches a queue, so queued
//! payloads are plain byte buffers whose layout is fully described here.

use serde::{Deserialize, Serialize};

// ============================================================================
// Video
// ============================================================================

/// Pixel layout of a scaled video payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar 4:2:0 (Y, then U, then V)
    Yuv420p,
    /// Semi-planar 4:2:0 (Y, then interleaved UV)
    Nv12,
    Rgb24,
    Rgba,
}

impl PixelFormat {
    /// Row length in bytes and row count of each plane, in storage order
    pub fn planes(&self, width: u32, height: u32) -> Vec<(usize, usize)> {
        let w = width as usize;
        let h = height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        match self {
            Self::Yuv420p => vec![(w, h), (cw, ch), (cw, ch)],
            Self::Nv12 => vec![(w, h), (cw * 2, ch)],
            Self::Rgb24 => vec![(w * 3, h)],
            Self::Rgba => vec![(w * 4, h)],
        }
    }

    /// Size of one tightly packed frame
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        self.planes(width, height)
            .iter()
            .map(|(row, rows)| row * rows)
            .sum()
    }
}

/// Target the video consumer displays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoTarget {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl VideoTarget {
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

impl Default for VideoTarget {
    fn default() -> Self {
        // 16:9 window
        Self {
            width: 640,
            height: 360,
            pixel_format: PixelFormat::Yuv420p,
        }
    }
}

// ============================================================================
// Audio
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn channels(&self) -> u16 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }
}

/// Interleaved sample encoding of a resampled audio payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S32 | Self::F32 => 4,
        }
    }

    /// Byte value that encodes digital silence.
    ///
    /// Unsigned 8-bit audio is biased around 0x80; every other format is
    /// silent at all-zero bits (including 0.0f32).
    pub fn silence_byte(&self) -> u8 {
        match self {
            Self::U8 => 0x80,
            _ => 0,
        }
    }
}

/// Target the audio device is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioTarget {
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
    pub rate: u32,
}

impl AudioTarget {
    /// Bytes per interleaved sample frame (one sample for every channel)
    pub fn frame_bytes(&self) -> usize {
        self.channel_layout.channels() as usize * self.sample_format.bytes_per_sample()
    }

    pub fn bytes_per_second(&self) -> usize {
        self.frame_bytes() * self.rate as usize
    }

    /// Payload size for `samples` per channel
    pub fn buffer_size(&self, samples: usize) -> usize {
        samples * self.frame_bytes()
    }
}

impl Default for AudioTarget {
    fn default() -> Self {
        Self {
            channel_layout: ChannelLayout::Stereo,
            sample_format: SampleFormat::S16,
            rate: 44_100,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv420p_frame_size() {
        assert_eq!(PixelFormat::Yuv420p.frame_size(640, 360), 640 * 360 * 3 / 2);
        // odd dimensions round the chroma planes up
        assert_eq!(PixelFormat::Yuv420p.frame_size(3, 3), 9 + 4 + 4);
    }

    #[test]
    fn test_packed_frame_sizes() {
        assert_eq!(PixelFormat::Rgb24.frame_size(4, 2), 24);
        assert_eq!(PixelFormat::Rgba.frame_size(4, 2), 32);
        assert_eq!(PixelFormat::Nv12.frame_size(4, 2), 8 + 4);
    }

    #[test]
    fn test_audio_sizes() {
        let target = AudioTarget::default();
        assert_eq!(target.frame_bytes(), 4);
        assert_eq!(target.bytes_per_second(), 176_400);
        assert_eq!(target.buffer_size(1024), 4096);
    }

    #[test]
    fn test_silence_byte() {
        assert_eq!(SampleFormat::U8.silence_byte(), 0x80);
        assert_eq!(SampleFormat::S16.silence_byte(), 0);
        assert_eq!(SampleFormat::F32.silence_byte(), 0);
    }
}
