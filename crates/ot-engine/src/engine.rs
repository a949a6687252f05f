//! Engine dispatcher and owner handle
//!
//! One dedicated audio thread owns every piece of rendering state: the
//! processor table, the schedule, the interleaved scratch buffer, the
//! transport and the active drivers. The control thread talks to it
//! exclusively through the lock-free job queues and reads back results
//! through the IPC back-channel.
//!
//! The thread runs a PREPARE/CHECK/DISPATCH state machine: wake up when
//! jobs are pending or a block is due, render into the scratch buffer,
//! hand it to the PCM driver, and otherwise sleep on the driver-reported
//! timeout.

use std::mem;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;

use ot_audio::{
    open_midi_driver, open_pcm_driver, IoDir, MidiDriver, MidiEventStream, PcmDriver,
    PcmDriverConfig,
};
use ot_core::{Sample, SpeakerArrangement, MAX_BLOCK_FRAMES, MAX_BLOCK_SAMPLES, N_CHANNELS,
    SAMPLE_RATE};
use ot_file::{create_capture_writer, FrameWriter};

use crate::ipc::{EnotifyJob, NoteFlags, UserNote, UserNoteJob};
use crate::jobs::{AsyncJobs, ConstJobs, Job, ParkedState, SynchronizedJobs};
use crate::processor::{AudioProcessor, OBusId, ProcId, ProcTable, ENGINE_OUTPUT};
use crate::schedule::Schedule;
use crate::stack::AtomicStack;
use crate::transport::AudioTransport;

/// Engine preferences, mirrored from the host application's settings
/// store. `"null"` selects the silent fallback PCM driver and marks a
/// MIDI slot unused.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnginePrefs {
    /// Requested extra output latency in ms, 0..=3000.
    pub synth_latency_ms: u32,
    pub pcm_driver: String,
    pub midi_driver_1: String,
    pub midi_driver_2: String,
    pub midi_driver_3: String,
    pub midi_driver_4: String,
}

impl Default for EnginePrefs {
    fn default() -> Self {
        Self {
            synth_latency_ms: 10,
            pcm_driver: "null".into(),
            midi_driver_1: "null".into(),
            midi_driver_2: "null".into(),
            midi_driver_3: "null".into(),
            midi_driver_4: "null".into(),
        }
    }
}

impl EnginePrefs {
    fn midi_driver_ids(&self) -> [&str; 4] {
        [
            &self.midi_driver_1,
            &self.midi_driver_2,
            &self.midi_driver_3,
            &self.midi_driver_4,
        ]
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub speaker_arrangement: SpeakerArrangement,
    /// Preferred block size in frames; clamped to the maximum render
    /// size and rounded down to 8-frame granularity.
    pub block_frames: usize,
    pub prefs: EnginePrefs,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            speaker_arrangement: SpeakerArrangement::Stereo,
            block_frames: 512,
            prefs: EnginePrefs::default(),
        }
    }
}

fn clamp_block_frames(frames: usize) -> usize {
    (frames.clamp(8, MAX_BLOCK_FRAMES) / 8) * 8
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════════

type OwnerWakeup = Arc<dyn Fn() + Send + Sync>;

/// State shared between the control thread and the audio thread. All of
/// it is lock-free on the audio thread's hot path; the mutex-guarded
/// fields are only touched from the control thread or on rare events.
pub struct EngineShared {
    pub(crate) async_stack: AtomicStack<Job>,
    pub(crate) const_stack: AtomicStack<Job>,
    pub(crate) trash_stack: AtomicStack<Job>,
    pub(crate) user_notes: AtomicStack<UserNoteJob>,
    pub(crate) enotify_stack: AtomicStack<EnotifyJob>,
    pub(crate) enotify_pending: AtomicBool,
    frame_counter: AtomicU64,
    write_counter: AtomicU64,
    autostop: AtomicU64,
    shutdown: AtomicBool,
    engine_running: AtomicBool,
    engine_thread: Mutex<Option<thread::Thread>>,
    pub(crate) owner_wakeup: Mutex<Option<OwnerWakeup>>,
    note_handler: Mutex<Option<Box<dyn FnMut(UserNote) + Send>>>,
    enotify_handler: Mutex<Option<Box<dyn FnMut(ProcId, u32) + Send>>>,
    autostop_handler: Mutex<Option<Box<dyn FnOnce(u64) + Send>>>,
    /// Devid of the installed PCM driver; control-thread bookkeeping.
    pcm_devid: Mutex<String>,
    /// Devids of the installed MIDI drivers, in slot order.
    midi_devids: Mutex<Vec<String>>,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            async_stack: AtomicStack::new(),
            const_stack: AtomicStack::new(),
            trash_stack: AtomicStack::new(),
            user_notes: AtomicStack::new(),
            enotify_stack: AtomicStack::new(),
            enotify_pending: AtomicBool::new(false),
            frame_counter: AtomicU64::new(0),
            write_counter: AtomicU64::new(0),
            autostop: AtomicU64::new(u64::MAX),
            shutdown: AtomicBool::new(false),
            engine_running: AtomicBool::new(false),
            engine_thread: Mutex::new(None),
            owner_wakeup: Mutex::new(None),
            note_handler: Mutex::new(None),
            enotify_handler: Mutex::new(None),
            autostop_handler: Mutex::new(None),
            pcm_devid: Mutex::new(String::new()),
            midi_devids: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn engine_running(&self) -> bool {
        self.engine_running.load(Ordering::Acquire)
    }

    pub(crate) fn on_engine_thread(&self) -> bool {
        self.engine_thread
            .lock()
            .as_ref()
            .map(|t| t.id() == thread::current().id())
            .unwrap_or(false)
    }

    /// Unpark the audio thread; callable from any thread.
    pub(crate) fn wakeup_engine_mt(&self) {
        if let Some(t) = self.engine_thread.lock().as_ref() {
            t.unpark();
        }
    }

    fn wakeup_owner_mt(&self) {
        let wakeup = self.owner_wakeup.lock().clone();
        if let Some(wakeup) = wakeup {
            wakeup();
        }
    }

    /// True iff the owner has anything to collect via `ipc_dispatch`.
    pub fn ipc_pending(&self) -> bool {
        !self.trash_stack.is_empty()
            || !self.user_notes.is_empty()
            || self.enotify_pending.load(Ordering::Acquire)
    }

    /// Queue a user note and wake the owner on the first pending entry.
    pub(crate) fn queue_user_note(&self, channel: &str, flags: NoteFlags, text: String) {
        let node = Box::into_raw(Box::new(UserNoteJob {
            next: std::sync::atomic::AtomicPtr::new(ptr::null_mut()),
            note: UserNote { channel: channel.to_string(), flags, text },
        }));
        // SAFETY: freshly allocated node.
        let was_empty = unsafe { self.user_notes.push(node) };
        if was_empty {
            self.wakeup_owner_mt();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI INPUT PROCESSOR
// ═══════════════════════════════════════════════════════════════════════════════

/// The engine's single MIDI event source. Holds the open MIDI drivers
/// and drains their events at the top of every block; registered as an
/// output root (with zero audio buses) so it is always scheduled at
/// level 0.
pub struct MidiInputProc {
    drivers: SmallVec<[Box<dyn MidiDriver>; 4]>,
    events: MidiEventStream,
}

impl MidiInputProc {
    fn new() -> Self {
        Self { drivers: SmallVec::new(), events: MidiEventStream::new() }
    }

    /// Events fetched for the block being rendered.
    pub fn events(&self) -> &MidiEventStream {
        &self.events
    }

    pub fn driver_devids(&self) -> Vec<String> {
        self.drivers.iter().map(|d| d.devid().to_string()).collect()
    }
}

impl AudioProcessor for MidiInputProc {
    fn initialize(&mut self, _speakers: SpeakerArrangement) {
        self.events.reserve(256);
    }

    fn reset(&mut self, _target_stamp: u64) {
        self.events.clear();
        self.events.reserve(256);
    }

    fn render(&mut self, _n_frames: usize) {
        self.events.clear();
        for driver in self.drivers.iter_mut() {
            driver.fetch_events(&mut self.events, SAMPLE_RATE);
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE STATE (audio-thread-owned)
// ═══════════════════════════════════════════════════════════════════════════════

struct CaptureTap {
    writer: Box<dyn FrameWriter>,
    needs_running: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum JobStackKind {
    Async,
    Const,
}

/// Everything the audio thread owns exclusively. Job closures receive
/// `&mut EngineState` and mutate through this surface; nothing here is
/// reachable from the control thread while the engine runs.
pub struct EngineState {
    shared: Arc<EngineShared>,
    transport: AudioTransport,
    table: ProcTable,
    /// Output roots, mixed into the interleaved buffer in order.
    oprocs: Vec<ProcId>,
    schedule: Schedule,
    pcm: Box<dyn PcmDriver>,
    pcm_devid: String,
    midi_proc: ProcId,
    /// Interleaved stereo scratch block handed to the PCM driver.
    buffer: Box<[Sample]>,
    buffer_frames: usize,
    render_stamp: u64,
    write_stamp: u64,
    capture: Option<CaptureTap>,
    owner_wakeup: Option<OwnerWakeup>,
}

impl EngineState {
    fn new(shared: Arc<EngineShared>, config: &EngineConfig) -> Self {
        let block_frames = clamp_block_frames(config.block_frames);
        let pconfig = PcmDriverConfig {
            n_channels: N_CHANNELS,
            mix_freq: SAMPLE_RATE,
            latency_ms: config.prefs.synth_latency_ms.min(3000),
            block_length: block_frames,
        };
        let pcm = open_pcm_driver("null", IoDir::WriteOnly, IoDir::WriteOnly, &pconfig)
            .expect("the null PCM driver must always open");
        *shared.pcm_devid.lock() = "null".into();

        let mut state = Self {
            shared,
            transport: AudioTransport::new(config.speaker_arrangement, SAMPLE_RATE),
            table: ProcTable::new(),
            oprocs: Vec::with_capacity(16),
            schedule: Schedule::new(),
            pcm,
            pcm_devid: "null".into(),
            midi_proc: ProcId(0),
            buffer: vec![0.0; MAX_BLOCK_SAMPLES].into_boxed_slice(),
            buffer_frames: block_frames,
            render_stamp: 0,
            write_stamp: 0,
            capture: None,
            owner_wakeup: None,
        };

        let midi_proc = state.add_processor(Box::new(MidiInputProc::new()));
        state.enable_engine_output(midi_proc, true);
        state.midi_proc = midi_proc;
        state
    }

    // ── capability surface exposed to processors and job closures ──────────

    /// Monotonic render frame counter.
    pub fn frame_counter(&self) -> u64 {
        self.render_stamp
    }

    pub fn sample_rate(&self) -> u32 {
        self.transport.samplerate
    }

    pub fn transport(&self) -> &AudioTransport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut AudioTransport {
        &mut self.transport
    }

    /// Take ownership of a processor, initialize it, and reset it to the
    /// current render stamp.
    pub fn add_processor(&mut self, proc: Box<dyn AudioProcessor>) -> ProcId {
        let id = self.table.insert(proc, u64::MAX);
        let speakers = self.transport.speaker_arrangement;
        let stamp = self.render_stamp;
        let slot = self.table.get_mut(id).expect("fresh slot");
        slot.processor_mut().initialize(speakers);
        slot.reset_state(stamp);
        id
    }

    /// Detach a processor; the caller decides where the box is dropped.
    pub fn remove_processor(&mut self, id: ProcId) -> Option<Box<dyn AudioProcessor>> {
        if self.oprocs.contains(&id) {
            self.enable_engine_output(id, false);
        }
        let slot = self.table.remove(id)?;
        self.schedule.mark_invalid();
        Some(slot.proc)
    }

    pub fn processor(&self, id: ProcId) -> Option<&dyn AudioProcessor> {
        self.table.get(id).map(|s| s.processor())
    }

    pub fn processor_mut(&mut self, id: ProcId) -> Option<&mut dyn AudioProcessor> {
        self.table.get_mut(id).map(|s| s.processor_mut())
    }

    /// Register or unregister `id` as an output root contributing to the
    /// master mix.
    pub fn enable_engine_output(&mut self, id: ProcId, onoff: bool) {
        let Some(slot) = self.table.get_mut(id) else { return };
        if onoff && slot.flags & ENGINE_OUTPUT == 0 {
            slot.flags |= ENGINE_OUTPUT;
            self.oprocs.push(id);
            self.schedule_queue_update();
        } else if !onoff && slot.flags & ENGINE_OUTPUT != 0 {
            slot.flags &= !ENGINE_OUTPUT;
            self.oprocs.retain(|&p| p != id);
            self.schedule_queue_update();
        }
    }

    /// Request a schedule rebuild before the next render.
    pub fn schedule_queue_update(&mut self) {
        self.schedule.mark_invalid();
    }

    /// Place `id` at `level` in the current rebuild; duplicate adds are
    /// absorbed.
    pub fn schedule_add(&mut self, id: ProcId, level: u32) {
        let stamp = self.render_stamp;
        self.schedule.schedule_add(&mut self.table, id, level, stamp);
    }

    /// The engine's MIDI event source.
    pub fn event_source(&self) -> ProcId {
        self.midi_proc
    }

    /// Queue a deferred processor notification for the owner.
    pub fn enotify_queue(&self, id: ProcId, mask: u32) {
        let node = Box::into_raw(Box::new(EnotifyJob {
            next: std::sync::atomic::AtomicPtr::new(ptr::null_mut()),
            proc: id,
            mask,
        }));
        // SAFETY: freshly allocated node.
        unsafe { self.shared.enotify_stack.push(node) };
        self.shared.enotify_pending.store(true, Ordering::Release);
    }

    /// Surface a user-visible note on `channel`.
    pub fn queue_user_note(&self, channel: &str, flags: NoteFlags, text: String) {
        self.shared.queue_user_note(channel, flags, text);
    }

    /// The interleaved output of the last rendered block.
    pub fn output_buffer(&self) -> &[Sample] {
        &self.buffer[..self.buffer_frames * N_CHANNELS]
    }

    pub fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    pub fn render_stamp(&self) -> u64 {
        self.render_stamp
    }

    pub fn write_stamp(&self) -> u64 {
        self.write_stamp
    }

    // ── driver handoff (runs inside synchronized jobs) ──────────────────────

    /// Install `new` as the active PCM driver, returning the old one for
    /// the control thread to close. Resets the write clock so the first
    /// post-swap dispatch renders a block before writing.
    pub(crate) fn install_pcm_driver(
        &mut self,
        new: Box<dyn PcmDriver>,
        devid: String,
    ) -> Box<dyn PcmDriver> {
        let old = mem::replace(&mut self.pcm, new);
        self.pcm_devid = devid;
        self.buffer_frames = clamp_block_frames(self.pcm.block_length());
        self.write_stamp = self.render_stamp.saturating_sub(self.buffer_frames as u64);
        self.shared.write_counter.store(self.write_stamp, Ordering::Release);
        self.schedule.mark_invalid();
        log::info!(
            "PCM driver {:?} active, block={} frames",
            self.pcm_devid,
            self.buffer_frames
        );
        old
    }

    /// Rebuild the MIDI input processor's driver vector in place:
    /// `ids` is the wanted slot order, `opened` holds newly opened
    /// drivers. Returns everything no longer referenced (old drivers not
    /// reused plus unused new ones) for the control thread to close.
    pub(crate) fn swap_midi_drivers(
        &mut self,
        ids: &[String],
        opened: &mut SmallVec<[Option<Box<dyn MidiDriver>>; 4]>,
    ) -> SmallVec<[Box<dyn MidiDriver>; 8]> {
        let mut leftovers: SmallVec<[Box<dyn MidiDriver>; 8]> = SmallVec::new();
        let midi = self
            .table
            .get_mut(self.midi_proc)
            .and_then(|s| s.processor_mut().as_any_mut().downcast_mut::<MidiInputProc>())
            .expect("midi input processor");

        let mut old = mem::take(&mut midi.drivers);
        let mut fresh: SmallVec<[Box<dyn MidiDriver>; 4]> = SmallVec::new();
        for id in ids {
            if let Some(pos) = old.iter().position(|d| d.devid() == id.as_str()) {
                fresh.push(old.remove(pos));
            } else if let Some(pos) = opened
                .iter()
                .position(|o| o.as_ref().map(|d| d.devid() == id.as_str()).unwrap_or(false))
            {
                fresh.push(opened[pos].take().expect("unclaimed driver"));
            }
        }
        midi.drivers = fresh;

        leftovers.extend(old);
        leftovers.extend(opened.iter_mut().filter_map(|o| o.take()));
        leftovers
    }

    // ── dispatcher ──────────────────────────────────────────────────────────

    /// CHECK phase: decide whether to dispatch now or how long to sleep.
    fn check(&mut self, timeout_us: &mut u64) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        if !self.shared.const_stack.is_empty() || !self.shared.async_stack.is_empty() {
            return true;
        }
        if self.render_stamp <= self.write_stamp {
            return true;
        }
        let mut t = u64::MAX;
        let can_write = self.pcm.pcm_check_io(&mut t) || t == 0;
        // A zero timeout means "process now"; anything else sleeps at
        // least a millisecond.
        *timeout_us = t.clamp(1_000, 100_000);
        can_write
    }

    /// DISPATCH phase: write, render, drain jobs, wake the owner.
    fn dispatch(&mut self) {
        self.pcm_check_write(true);
        if self.render_stamp <= self.write_stamp {
            // Mutations must be visible to this tick's render.
            self.process_jobs(JobStackKind::Async);
            if self.schedule.is_invalid() {
                self.rebuild_schedule();
            }
            let frames = self.buffer_frames;
            self.schedule_render(frames);
            self.pcm_check_write(true); // minimize drop outs
        }
        if !self.shared.const_stack.is_empty() {
            // Synchronizations must not observe stale async state.
            self.process_jobs(JobStackKind::Async);
            self.process_jobs(JobStackKind::Const);
        } else if !self.shared.async_stack.is_empty() {
            self.process_jobs(JobStackKind::Async);
        }
        if self.shared.ipc_pending() {
            self.wakeup_owner();
        }
    }

    /// Write the rendered block to the driver if it accepts one, feeding
    /// the capture tap and the write clock.
    fn pcm_check_write(&mut self, write_buffer: bool) -> bool {
        let mut t = u64::MAX;
        let can_write = self.pcm.pcm_check_io(&mut t) || t == 0;
        if !write_buffer {
            return can_write;
        }
        if !can_write || self.write_stamp >= self.render_stamp {
            return false;
        }

        let n_samples = self.buffer_frames * N_CHANNELS;
        self.pcm.pcm_write(n_samples, &self.buffer[..n_samples]);
        self.capture_tap(n_samples);
        self.write_stamp += self.buffer_frames as u64;
        debug_assert_eq!(self.write_stamp, self.render_stamp);
        self.shared.write_counter.store(self.write_stamp, Ordering::Release);

        let autostop = self.shared.autostop.load(Ordering::Relaxed);
        if self.write_stamp >= autostop {
            if let Some(handler) = self.shared.autostop_handler.lock().take() {
                handler(self.write_stamp);
            }
        }
        false
    }

    /// Forward the block about to be counted as written to the capture
    /// sink, honoring the running gate and the autostop clip.
    fn capture_tap(&mut self, n_samples: usize) {
        let frames = (n_samples / N_CHANNELS) as u64;
        let mut failed = false;
        if let Some(tap) = self.capture.as_mut() {
            if tap.needs_running && !self.transport.running() {
                return;
            }
            let autostop = self.shared.autostop.load(Ordering::Relaxed);
            if self.write_stamp + frames > autostop {
                return;
            }
            if let Err(e) = tap.writer.write_frames(&self.buffer[..n_samples]) {
                log::warn!("capture write failed, disabling sink: {}", e);
                failed = true;
            }
        }
        if failed {
            if let Some(tap) = self.capture.take() {
                self.defer_drop(tap.writer);
            }
            self.shared.queue_user_note(
                "capture",
                NoteFlags::Clear,
                "# Recording Error\nCapture disabled after a write failure".into(),
            );
        }
    }

    /// Install a capture sink; any previous sink is closed here on the
    /// engine thread and freed on the control thread.
    pub(crate) fn install_capture(&mut self, writer: Box<dyn FrameWriter>, needs_running: bool) {
        self.take_capture();
        self.capture = Some(CaptureTap { writer, needs_running });
    }

    /// Close and detach the current capture sink, handing the box to the
    /// trash path.
    pub(crate) fn take_capture(&mut self) {
        if let Some(mut tap) = self.capture.take() {
            if let Err(e) = tap.writer.close() {
                log::warn!("capture close failed: {}", e);
                self.shared.queue_user_note(
                    "capture",
                    NoteFlags::Clear,
                    format!("# Recording Error\nFailed to finalize capture file:\n{}", e),
                );
            }
            self.defer_drop(tap.writer);
        }
    }

    /// Send `value` to the control thread for destruction via the job
    /// trash, keeping allocator traffic off the audio thread.
    fn defer_drop<T: Send + 'static>(&self, value: T) {
        let mut holder = Some(value);
        let node = Job::new_node(Box::new(move |_state| {
            // Never invoked; the held value is freed with the node.
            let _ = &mut holder;
        }));
        // SAFETY: freshly allocated node.
        let was_empty = unsafe { self.shared.trash_stack.push(node) };
        if was_empty {
            self.wakeup_owner();
        }
    }

    fn rebuild_schedule(&mut self) {
        let stamp = self.render_stamp;
        self.schedule.rebuild(&mut self.table, &self.oprocs, stamp);
        log::debug!(
            "schedule rebuilt: {} processors in {} levels",
            self.schedule.len(),
            self.schedule.n_levels()
        );
    }

    /// Render one block through the schedule and interleave the output
    /// roots into the scratch buffer.
    fn schedule_render(&mut self, frames: usize) {
        debug_assert_eq!(frames % 8, 0);
        debug_assert!(frames <= MAX_BLOCK_FRAMES);
        let target_stamp = self.render_stamp + frames as u64;

        for level in 0..self.schedule.n_levels() {
            for i in 0..self.schedule.level(level).len() {
                let id = self.schedule.level(level)[i];
                if let Some(slot) = self.table.get_mut(id) {
                    slot.render_block(target_stamp);
                }
            }
        }

        let mut contributors = 0;
        for i in 0..self.oprocs.len() {
            let id = self.oprocs[i];
            let Some(slot) = self.table.get(id) else { continue };
            if slot.proc.n_obuses() == 0 {
                continue;
            }
            if contributors == 0 {
                interleave_stereo::<false>(frames, &mut self.buffer, slot.processor(), OBusId::MAIN);
            } else {
                interleave_stereo::<true>(frames, &mut self.buffer, slot.processor(), OBusId::MAIN);
            }
            contributors += 1;
        }
        if contributors == 0 {
            self.buffer[..frames * N_CHANNELS].fill(0.0);
        }

        self.render_stamp = target_stamp;
        self.shared.frame_counter.store(target_stamp, Ordering::Release);
        self.transport.advance(frames);
    }

    /// Drain one job stack in submission order and return the batch to
    /// the trash list with a single push.
    fn process_jobs(&mut self, kind: JobStackKind) -> bool {
        let shared = Arc::clone(&self.shared);
        let stack = match kind {
            JobStackKind::Async => &shared.async_stack,
            JobStackKind::Const => &shared.const_stack,
        };
        let first = stack.pop_reversed();
        let mut job = first;
        let mut last: *mut Job = ptr::null_mut();
        while !job.is_null() {
            // SAFETY: the popped chain is exclusively ours; nodes stay
            // alive until the owner frees them from the trash stack.
            unsafe {
                ((*job).func)(self);
                last = job;
                job = (*job).next.load(Ordering::Relaxed);
            }
        }
        if last.is_null() {
            return false;
        }
        // SAFETY: first..last is a complete chain with a null tail.
        let was_empty = unsafe { shared.trash_stack.push_chain(first, last) };
        if was_empty {
            self.wakeup_owner();
        }
        true
    }

    fn wakeup_owner(&self) {
        if let Some(wakeup) = self.owner_wakeup.as_ref() {
            wakeup();
        }
    }
}

/// Copy or accumulate two channels of `proc`'s main output bus into the
/// interleaved stereo buffer; mono sources broadcast channel 0.
fn interleave_stereo<const ADD: bool>(
    frames: usize,
    buffer: &mut [Sample],
    proc: &dyn AudioProcessor,
    obus: OBusId,
) {
    let n_channels = proc.n_ochannels(obus);
    if n_channels >= 2 {
        let src0 = proc.ofloats(obus, 0);
        let src1 = proc.ofloats(obus, 1);
        for i in 0..frames {
            if ADD {
                buffer[2 * i] += src0[i];
                buffer[2 * i + 1] += src1[i];
            } else {
                buffer[2 * i] = src0[i];
                buffer[2 * i + 1] = src1[i];
            }
        }
    } else if n_channels >= 1 {
        let src = proc.ofloats(obus, 0);
        for i in 0..frames {
            if ADD {
                buffer[2 * i] += src[i];
                buffer[2 * i + 1] += src[i];
            } else {
                buffer[2 * i] = src[i];
                buffer[2 * i + 1] = src[i];
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIO THREAD
// ═══════════════════════════════════════════════════════════════════════════════

fn run(
    shared: Arc<EngineShared>,
    mut state: EngineState,
    start_tx: crossbeam_channel::Sender<()>,
) -> EngineState {
    ot_audio::set_realtime_priority();
    *shared.engine_thread.lock() = Some(thread::current());
    state.owner_wakeup = shared.owner_wakeup.lock().clone();
    shared.engine_running.store(true, Ordering::Release);
    let _ = start_tx.send(());
    log::info!("audio thread running, block={} frames", state.buffer_frames);

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let mut timeout_us = u64::MAX;
        if state.check(&mut timeout_us) {
            state.dispatch();
        } else if !shared.shutdown.load(Ordering::Acquire) {
            thread::park_timeout(Duration::from_micros(timeout_us));
        }
    }

    // Quit sequence: jobs still queued are drained, not dropped.
    state.process_jobs(JobStackKind::Async);
    state.process_jobs(JobStackKind::Const);
    state.take_capture();
    if shared.ipc_pending() {
        state.wakeup_owner();
    }

    shared.engine_running.store(false, Ordering::Release);
    *shared.engine_thread.lock() = None;
    state.owner_wakeup = None;
    log::info!("audio thread stopped at frame {}", state.render_stamp);
    state
}

// ═══════════════════════════════════════════════════════════════════════════════
// OWNER HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Owner-side handle for the audio engine.
///
/// Created once per process; starting spawns the dedicated audio thread,
/// stopping joins it. All mutation goes through the three job queues.
pub struct AudioEngine {
    shared: Arc<EngineShared>,
    parked: ParkedState,
    thread: Option<thread::JoinHandle<EngineState>>,
    block_frames: usize,
    midi_proc: ProcId,
    prefs: Mutex<EnginePrefs>,
    pub async_jobs: AsyncJobs,
    pub const_jobs: ConstJobs,
    pub synchronized_jobs: SynchronizedJobs,
}

impl AudioEngine {
    pub fn new(config: EngineConfig) -> Self {
        let shared = Arc::new(EngineShared::new());
        let state = EngineState::new(Arc::clone(&shared), &config);
        let midi_proc = state.midi_proc;
        let parked: ParkedState = Arc::new(Mutex::new(Some(state)));

        let async_jobs = AsyncJobs { shared: Arc::clone(&shared), parked: Arc::clone(&parked) };
        let const_jobs = ConstJobs { shared: Arc::clone(&shared), parked: Arc::clone(&parked) };
        let synchronized_jobs =
            SynchronizedJobs { shared: Arc::clone(&shared), parked: Arc::clone(&parked) };

        Self {
            shared,
            parked,
            thread: None,
            block_frames: clamp_block_frames(config.block_frames),
            midi_proc,
            prefs: Mutex::new(config.prefs),
            async_jobs,
            const_jobs,
            synchronized_jobs,
        }
    }

    /// Spawn the audio thread. `owner_wakeup` is invoked whenever the
    /// engine queues something for `ipc_dispatch`.
    pub fn start(&mut self, owner_wakeup: impl Fn() + Send + Sync + 'static) {
        assert!(self.thread.is_none(), "audio engine already started");
        *self.shared.owner_wakeup.lock() = Some(Arc::new(owner_wakeup));

        // Resolve drivers against the parked state before the thread
        // exists; post-start preference changes go through jobs.
        let prefs = self.prefs.lock().clone();
        self.apply_prefs(&prefs);

        let state = self.parked.lock().take().expect("engine state parked");
        self.shared.shutdown.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let (start_tx, start_rx) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name("overtone-audio-0".into())
            .spawn(move || run(shared, state, start_tx))
            .expect("failed to spawn audio thread");
        self.thread = Some(handle);
        // Synchronize with thread start.
        let _ = start_rx.recv();
    }

    /// Stop the audio thread and park the engine state for a later
    /// restart. Remaining IPC is dispatched before returning.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else { return };
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup_engine_mt();
        let state = handle.join().expect("audio thread panicked");
        *self.parked.lock() = Some(state);
        self.ipc_dispatch();
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Monotonic render frame counter; MT-safe.
    pub fn frame_counter(&self) -> u64 {
        self.shared.frame_counter.load(Ordering::Acquire)
    }

    /// Frames handed to the PCM driver so far; MT-safe.
    pub fn write_counter(&self) -> u64 {
        self.shared.write_counter.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    /// The engine's MIDI event source processor.
    pub fn event_source(&self) -> ProcId {
        self.midi_proc
    }

    /// Explicitly wake the audio thread.
    pub fn wakeup_engine_mt(&self) {
        self.shared.wakeup_engine_mt();
    }

    /// Flip the transport between running and stopped; gates capture
    /// sinks opened with `needs_running`.
    pub fn set_transport_running(&self, running: bool) {
        self.async_jobs.add(move |state| {
            state.transport().set_running(running);
        });
    }

    // ── IPC ─────────────────────────────────────────────────────────────────

    /// Handler for user notes collected by `ipc_dispatch`.
    pub fn set_note_handler(&self, handler: impl FnMut(UserNote) + Send + 'static) {
        *self.shared.note_handler.lock() = Some(Box::new(handler));
    }

    /// Handler for deferred processor notifications.
    pub fn set_enotify_handler(&self, handler: impl FnMut(ProcId, u32) + Send + 'static) {
        *self.shared.enotify_handler.lock() = Some(Box::new(handler));
    }

    /// True iff `ipc_dispatch` has anything to do.
    pub fn ipc_pending(&self) -> bool {
        self.shared.ipc_pending()
    }

    /// Collect user notes, processor notifications, and free the job
    /// trash. Must be called from the control thread, typically from the
    /// owner-wakeup callback's event loop.
    pub fn ipc_dispatch(&self) {
        // User notes, in submission order.
        {
            let mut handler = self.shared.note_handler.lock();
            let mut node = self.shared.user_notes.pop_reversed();
            while !node.is_null() {
                // SAFETY: popped chain is exclusively ours.
                let boxed = unsafe { Box::from_raw(node) };
                node = boxed.next.load(Ordering::Relaxed);
                let UserNoteJob { note, .. } = *boxed;
                match handler.as_mut() {
                    Some(h) => h(note),
                    None => log::info!("user note [{}]: {}", note.channel, note.text),
                }
            }
        }

        // Deferred processor notifications.
        if self.shared.enotify_pending.swap(false, Ordering::AcqRel) {
            let mut handler = self.shared.enotify_handler.lock();
            let mut node = self.shared.enotify_stack.pop_reversed();
            while !node.is_null() {
                // SAFETY: popped chain is exclusively ours.
                let boxed = unsafe { Box::from_raw(node) };
                node = boxed.next.load(Ordering::Relaxed);
                if let Some(h) = handler.as_mut() {
                    h(boxed.proc, boxed.mask);
                }
            }
        }

        // Job trash: closure environments are destroyed here, on the
        // control thread.
        let mut job = self.shared.trash_stack.pop_all();
        while !job.is_null() {
            // SAFETY: popped chain is exclusively ours.
            let boxed = unsafe { Box::from_raw(job) };
            job = boxed.next.load(Ordering::Relaxed);
            drop(boxed);
        }
    }

    // ── autostop & capture ──────────────────────────────────────────────────

    /// Stop writing and recording once this many samples were written;
    /// fires the autostop handler exactly once.
    pub fn set_autostop(&self, n_samples: u64) {
        self.shared.autostop.store(n_samples, Ordering::Relaxed);
    }

    /// One-shot callback invoked from the engine thread when the write
    /// clock crosses the autostop mark; receives the write stamp.
    pub fn set_autostop_handler(&self, handler: impl FnOnce(u64) + Send + 'static) {
        *self.shared.autostop_handler.lock() = Some(Box::new(handler));
    }

    /// Begin capturing written blocks into `filename`; the format is
    /// chosen by suffix (.wav/.flac/.opus). With `needs_running`, blocks
    /// only reach the file while the transport runs.
    pub fn queue_capture_start(&self, filename: impl AsRef<Path>, needs_running: bool) {
        let path = filename.as_ref().to_path_buf();
        match create_capture_writer(&path, SAMPLE_RATE, N_CHANNELS) {
            Ok(writer) => {
                let mut pending = Some(writer);
                self.async_jobs.add(move |state| {
                    if let Some(writer) = pending.take() {
                        state.install_capture(writer, needs_running);
                    }
                });
            }
            Err(e) => {
                log::error!("cannot start capture into {}: {}", path.display(), e);
                self.shared.queue_user_note(
                    "capture",
                    NoteFlags::Clear,
                    format!(
                        "# Recording Error\nFailed to open capture file:\n{}:\n{}",
                        path.display(),
                        e
                    ),
                );
            }
        }
    }

    /// Close the active capture sink on the engine thread; the file is
    /// finalized when this returns.
    pub fn queue_capture_stop(&self) {
        self.synchronized_jobs.add(|state| {
            state.take_capture();
        });
    }

    // ── preferences & driver hot-swap ───────────────────────────────────────

    /// Apply changed preferences: re-resolve the PCM driver and the four
    /// MIDI driver slots without interrupting audio.
    pub fn update_prefs(&self, prefs: &EnginePrefs) {
        *self.prefs.lock() = prefs.clone();
        self.apply_prefs(prefs);
    }

    pub fn prefs(&self) -> EnginePrefs {
        self.prefs.lock().clone()
    }

    fn apply_prefs(&self, prefs: &EnginePrefs) {
        self.apply_pcm_prefs(prefs);
        self.apply_midi_prefs(prefs);
    }

    fn apply_pcm_prefs(&self, prefs: &EnginePrefs) {
        let wanted: &str = if prefs.pcm_driver.is_empty() { "null" } else { &prefs.pcm_driver };
        let current = self.shared.pcm_devid.lock().clone();
        if wanted == current {
            return;
        }

        let pconfig = PcmDriverConfig {
            n_channels: N_CHANNELS,
            mix_freq: SAMPLE_RATE,
            latency_ms: prefs.synth_latency_ms.min(3000),
            block_length: self.block_frames,
        };
        match open_pcm_driver(wanted, IoDir::WriteOnly, IoDir::WriteOnly, &pconfig) {
            Ok(driver) => {
                let retired: Arc<Mutex<Option<Box<dyn PcmDriver>>>> = Arc::new(Mutex::new(None));
                let retired_in = Arc::clone(&retired);
                let mut pending = Some((driver, wanted.to_string()));
                self.synchronized_jobs.add(move |state| {
                    if let Some((driver, devid)) = pending.take() {
                        let old = state.install_pcm_driver(driver, devid);
                        *retired_in.lock() = Some(old);
                    }
                });
                // Close the replaced driver after the swap sync-point,
                // off the audio thread.
                if let Some(mut old) = retired.lock().take() {
                    old.close();
                }
                *self.shared.pcm_devid.lock() = wanted.to_string();
            }
            Err(e) => {
                let text = format!(
                    "# Audio I/O Error\nFailed to open audio device:\n{}:\n{}",
                    wanted, e
                );
                log::error!("{}", text.replace('\n', " "));
                self.shared.queue_user_note("pcm-driver", NoteFlags::Clear, text);
            }
        }
    }

    fn apply_midi_prefs(&self, prefs: &EnginePrefs) {
        let current = self.shared.midi_devids.lock().clone();
        let mut midi_errors = 0;
        let midi_err = |devid: &str, nth: usize, error: String, midi_errors: &mut u32| {
            let text = format!(
                "## MIDI I/O Failure\nFailed to open MIDI device #{}:\n{}:\n{}",
                nth, devid, error
            );
            log::error!("{}", text.replace('\n', " "));
            let flags = if *midi_errors == 0 { NoteFlags::Clear } else { NoteFlags::Append };
            *midi_errors += 1;
            self.shared.queue_user_note("midi-driver", flags, text);
        };

        let mut wanted_ids: Vec<String> = Vec::new();
        let mut opened: SmallVec<[Option<Box<dyn MidiDriver>>; 4]> = SmallVec::new();
        for (nth, devid) in prefs.midi_driver_ids().iter().enumerate() {
            let devid = *devid;
            if devid == "null" || devid.is_empty() {
                continue;
            }
            if wanted_ids.iter().any(|d| d.as_str() == devid) {
                midi_err(devid, nth + 1, "device busy".into(), &mut midi_errors);
                continue;
            }
            if current.iter().any(|d| d.as_str() == devid) {
                // Keep the already-open driver.
                wanted_ids.push(devid.to_string());
                continue;
            }
            match open_midi_driver(devid, IoDir::ReadOnly) {
                Ok(driver) => {
                    opened.push(Some(driver));
                    wanted_ids.push(devid.to_string());
                }
                Err(e) => midi_err(devid, nth + 1, e.to_string(), &mut midi_errors),
            }
        }

        if wanted_ids == current && opened.is_empty() {
            return;
        }

        // Swap the driver vector in place on the engine thread; close
        // whatever fell out of use after the sync-point.
        let retired: Arc<Mutex<SmallVec<[Box<dyn MidiDriver>; 8]>>> =
            Arc::new(Mutex::new(SmallVec::new()));
        let retired_in = Arc::clone(&retired);
        let mut payload = Some((wanted_ids.clone(), opened));
        self.synchronized_jobs.add(move |state| {
            if let Some((ids, mut opened)) = payload.take() {
                let leftovers = state.swap_midi_drivers(&ids, &mut opened);
                retired_in.lock().extend(leftovers);
            }
        });
        for mut driver in retired.lock().drain(..) {
            driver.close();
        }
        *self.shared.midi_devids.lock() = wanted_ids;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_block_frames() {
        assert_eq!(clamp_block_frames(512), 512);
        assert_eq!(clamp_block_frames(20), 16);
        assert_eq!(clamp_block_frames(1), 8);
        assert_eq!(clamp_block_frames(1 << 20), MAX_BLOCK_FRAMES);
    }

    #[test]
    fn test_interleave_overwrite_then_add() {
        use crate::processor::testing::ConstSource;
        use ot_core::SpeakerArrangement;

        let mut stereo = ConstSource::stereo(1.0, -1.0);
        stereo.initialize(SpeakerArrangement::Stereo);
        stereo.render(8);
        let mut mono = ConstSource::mono(0.5);
        mono.initialize(SpeakerArrangement::Stereo);
        mono.render(8);

        let mut buffer = vec![9.0; 16];
        interleave_stereo::<false>(8, &mut buffer, &stereo, OBusId::MAIN);
        assert_eq!(&buffer[..4], &[1.0, -1.0, 1.0, -1.0]);

        interleave_stereo::<true>(8, &mut buffer, &mono, OBusId::MAIN);
        assert_eq!(&buffer[..4], &[1.5, -0.5, 1.5, -0.5]);
    }

    #[test]
    fn test_engine_construction_defaults() {
        let engine = AudioEngine::new(EngineConfig::default());
        assert!(!engine.is_running());
        assert_eq!(engine.frame_counter(), 0);
        assert_eq!(engine.write_counter(), 0);
        assert_eq!(engine.sample_rate(), 48_000);
    }

    #[test]
    fn test_jobs_run_synchronously_before_start() {
        let engine = AudioEngine::new(EngineConfig::default());
        let observed = Arc::new(AtomicU64::new(0));
        let observed_in = Arc::clone(&observed);
        // Not started: the closure runs on this thread, immediately.
        engine.const_jobs.add(move |state| {
            observed_in.store(state.frame_counter() + 7, Ordering::Relaxed);
        });
        assert_eq!(observed.load(Ordering::Relaxed), 7);
    }
}
