//! ot-audio: Audio and MIDI driver layer for Overtone
//!
//! Provides the uniform PCM/MIDI driver interface the engine renders
//! against, a string-id driver registry, the lock-free frame ring used at
//! the driver boundary, and the built-in drivers:
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │ AudioEngine  │────▶│  PcmDriver   │────▶│ null / JACK / …  │
//! │              │     │              │     │                  │
//! │ - dispatcher │     │ - check_io   │     │ - FrameRingBuffer│
//! │ - schedule   │     │ - read/write │     │ - foreign thread │
//! └──────────────┘     └──────────────┘     └──────────────────┘
//! ```
//!
//! The engine thread is the only caller of the `PcmDriver` I/O operations;
//! drivers that sit behind a foreign real-time callback (JACK) decouple the
//! two clocks with a pair of [`FrameRingBuffer`]s.

mod driver;
mod error;
mod midi;
mod null;
mod ringbuf;
pub mod thread_priority;

#[cfg(feature = "jack-driver")]
mod jack;

pub use driver::*;
pub use error::*;
pub use midi::*;
pub use null::*;
pub use ringbuf::*;
pub use thread_priority::{set_realtime_priority, PriorityResult};
