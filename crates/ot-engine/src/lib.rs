//! ot-engine: Overtone's real-time audio engine core
//!
//! A deterministic, block-oriented signal processing runtime: a single
//! dedicated audio thread renders a level-stratified processor schedule
//! into an interleaved stereo block and hands it to a swappable PCM
//! driver, while lock-free job queues carry mutations in from the
//! control thread and an IPC back-channel carries notifications out.
//!
//! ```text
//! control thread                        audio thread
//! ──────────────                        ────────────
//! async_jobs ──┐                  ┌──▶ drain jobs
//! const_jobs ──┼── lock-free ─────┤    rebuild schedule
//! sync_jobs ───┘    stacks        │    schedule_render()
//!                                 │    pcm_write() ──▶ driver
//! ipc_dispatch ◀── notes/trash ───┘    capture tap
//! ```

mod engine;
mod ipc;
mod jobs;
mod processor;
mod schedule;
mod stack;
mod transport;

pub use engine::*;
pub use ipc::{NoteFlags, UserNote, NOTIFY_BUS, NOTIFY_PARAMS, NOTIFY_REMOVAL};
pub use jobs::{AsyncJobs, ConstJobs, JobClosure, SynchronizedJobs};
pub use processor::{AudioProcessor, DepList, IBusId, OBusId, ProcId, ProcSlot, ProcTable};
pub use schedule::Schedule;
pub use stack::{AtomicStack, StackNode};
pub use transport::AudioTransport;
