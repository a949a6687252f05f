//! ot-core: Shared types, traits, and constants for Overtone
//!
//! This crate provides the foundational types used across all Overtone
//! crates. The engine core runs at a fixed sample rate with a fixed
//! stereo master; both are compile-time properties of this build.

/// Type alias for audio samples (f32, the native driver sample format)
pub type Sample = f32;

/// Fixed internal sample rate in Hz.
///
/// The engine renders at this rate for the lifetime of the process;
/// drivers running at other rates are expected to resample externally.
pub const SAMPLE_RATE: u32 = 48_000;

/// Number of channels of the interleaved master output.
pub const N_CHANNELS: usize = 2;

/// Maximum number of frames the engine renders per block.
///
/// Driver block sizes are clamped to this; it is a multiple of 8 so the
/// per-block render granularity stays SIMD friendly.
pub const MAX_BLOCK_FRAMES: usize = 2048;

/// Samples per interleaved stereo block at the maximum block size.
pub const MAX_BLOCK_SAMPLES: usize = MAX_BLOCK_FRAMES * N_CHANNELS;

/// Speaker arrangement of a bus or of the engine output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SpeakerArrangement {
    Mono,
    Stereo,
}

impl SpeakerArrangement {
    #[inline]
    pub fn n_channels(self) -> usize {
        match self {
            SpeakerArrangement::Mono => 1,
            SpeakerArrangement::Stereo => 2,
        }
    }
}

impl Default for SpeakerArrangement {
    fn default() -> Self {
        Self::Stereo
    }
}

/// Decibel value wrapper
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Decibels(pub f64);

impl Decibels {
    pub const ZERO: Self = Self(0.0);
    pub const NEG_INF: Self = Self(f64::NEG_INFINITY);

    #[inline]
    pub fn from_gain(gain: f64) -> Self {
        if gain <= 0.0 {
            Self::NEG_INF
        } else {
            Self(20.0 * gain.log10())
        }
    }

    #[inline]
    pub fn to_gain(self) -> f64 {
        if self.0 <= -144.0 {
            0.0
        } else {
            10.0_f64.powf(self.0 / 20.0)
        }
    }
}

impl Default for Decibels {
    fn default() -> Self {
        Self::ZERO
    }
}
