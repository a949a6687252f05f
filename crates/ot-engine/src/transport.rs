//! Audio transport and time
//!
//! The monotonic frame clock of a rendering session. Only the engine
//! thread advances it; the running flag is an atomic so the control
//! thread can flip playback state without a job round-trip.

use std::sync::atomic::{AtomicBool, Ordering};

use ot_core::SpeakerArrangement;

/// Transport information for audio rendering.
pub struct AudioTransport {
    /// Sample rate (mixing frequency) in Hz used for rendering.
    pub samplerate: u32,
    /// Half the `samplerate`.
    pub nyquist: u32,
    /// Precalculated `1.0 / samplerate`.
    pub isamplerate: f64,
    /// Audio output configuration.
    pub speaker_arrangement: SpeakerArrangement,
    /// Frames rendered since engine start; engine-thread-owned.
    current_frame: u64,
    running: AtomicBool,
}

impl AudioTransport {
    pub fn new(speaker_arrangement: SpeakerArrangement, samplerate: u32) -> Self {
        Self {
            samplerate,
            nyquist: samplerate / 2,
            isamplerate: 1.0 / samplerate as f64,
            speaker_arrangement,
            current_frame: 0,
            running: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Advance the frame clock by one rendered block. Engine thread only.
    #[inline]
    pub fn advance(&mut self, n_frames: usize) {
        self.current_frame += n_frames as u64;
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    /// Seconds corresponding to the current frame position.
    pub fn current_seconds(&self) -> f64 {
        self.current_frame as f64 * self.isamplerate
    }
}
