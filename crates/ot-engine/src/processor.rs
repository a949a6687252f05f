//! Processor contract and bus abstraction
//!
//! What the engine requires of a graph node: bus introspection, a render
//! callback producing per-channel output buffers, reset to a target
//! stamp, and the upstream dependency list the schedule builder walks.
//! The engine owns processors in an id-indexed table; per-node bookkeeping
//! (flags, render stamp, level) lives engine-side in [`ProcSlot`].

use std::any::Any;

use smallvec::SmallVec;

use ot_core::{Sample, SpeakerArrangement, MAX_BLOCK_FRAMES};

/// Engine-assigned processor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcId(pub u32);

/// Output bus identifier, 1-based; `OBusId(1)` is the main output bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OBusId(pub u16);

/// Input bus identifier, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IBusId(pub u16);

impl OBusId {
    /// The bus mixed into the engine's master output.
    pub const MAIN: OBusId = OBusId(1);
}

/// Dependency list of a processor, sized so typical nodes stay inline.
pub type DepList = SmallVec<[ProcId; 4]>;

/// A node in the processor graph.
///
/// All methods are invoked on the engine thread; implementations must not
/// block or allocate in `render`. Output buffers are owned by the
/// processor and addressed through `ofloats`.
pub trait AudioProcessor: Send {
    /// One-time setup after the engine takes ownership.
    fn initialize(&mut self, speaker_arrangement: SpeakerArrangement);

    /// Restore state for rendering from `target_stamp`.
    fn reset(&mut self, target_stamp: u64);

    /// Produce `n_frames` samples per output channel.
    fn render(&mut self, n_frames: usize);

    fn n_ibuses(&self) -> usize {
        0
    }

    fn n_obuses(&self) -> usize {
        0
    }

    fn n_ichannels(&self, _bus: IBusId) -> usize {
        0
    }

    fn n_ochannels(&self, _bus: OBusId) -> usize {
        0
    }

    /// Read access to the rendered output of `bus`, channel `channel`.
    fn ofloats(&self, _bus: OBusId, _channel: usize) -> &[Sample] {
        &[]
    }

    /// Upstream processors that must render before this node. The
    /// schedule builder places this node one level above the deepest
    /// dependency.
    fn dependencies(&self) -> DepList {
        DepList::new()
    }

    /// Downcast support for engine-internal nodes.
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// Engine-managed per-processor flags.
pub(crate) const SCHEDULED: u8 = 1 << 0;
pub(crate) const ENGINE_OUTPUT: u8 = 1 << 1;
pub(crate) const VISITING: u8 = 1 << 2;

/// Engine-side record of one owned processor.
pub struct ProcSlot {
    pub(crate) proc: Box<dyn AudioProcessor>,
    pub(crate) flags: u8,
    /// Schedule level assigned by the last rebuild.
    pub(crate) level: u32,
    /// Last target frame this processor rendered up to.
    pub(crate) render_stamp: u64,
}

impl ProcSlot {
    pub fn processor(&self) -> &dyn AudioProcessor {
        self.proc.as_ref()
    }

    pub fn processor_mut(&mut self) -> &mut dyn AudioProcessor {
        self.proc.as_mut()
    }

    pub fn render_stamp(&self) -> u64 {
        self.render_stamp
    }

    pub fn is_engine_output(&self) -> bool {
        self.flags & ENGINE_OUTPUT != 0
    }

    /// Reset voices and buffers for rendering from `target_stamp`.
    pub(crate) fn reset_state(&mut self, target_stamp: u64) {
        if self.render_stamp != target_stamp {
            self.proc.reset(target_stamp);
            self.render_stamp = target_stamp;
        }
    }

    /// Render up to `target_stamp`, at most once per engine block.
    ///
    /// The stamp advances in strict monotonic steps bounded by the
    /// engine's maximum block size.
    pub(crate) fn render_block(&mut self, target_stamp: u64) {
        if self.render_stamp >= target_stamp {
            return;
        }
        let n_frames = (target_stamp - self.render_stamp) as usize;
        if n_frames > MAX_BLOCK_FRAMES {
            return;
        }
        self.proc.render(n_frames);
        self.render_stamp = target_stamp;
    }
}

/// Id-indexed storage for the engine's processors; slots are reused.
#[derive(Default)]
pub struct ProcTable {
    slots: Vec<Option<ProcSlot>>,
}

impl ProcTable {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn insert(&mut self, proc: Box<dyn AudioProcessor>, render_stamp: u64) -> ProcId {
        let slot = ProcSlot { proc, flags: 0, level: 0, render_stamp };
        for (i, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(slot);
                return ProcId(i as u32);
            }
        }
        self.slots.push(Some(slot));
        ProcId((self.slots.len() - 1) as u32)
    }

    pub(crate) fn remove(&mut self, id: ProcId) -> Option<ProcSlot> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.take())
    }

    pub fn contains(&self, id: ProcId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: ProcId) -> Option<&ProcSlot> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: ProcId) -> Option<&mut ProcSlot> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Constant-value stereo source used across the engine tests.
    pub struct ConstSource {
        pub left: Sample,
        pub right: Sample,
        pub channels: usize,
        buffers: Vec<Vec<Sample>>,
        pub deps: DepList,
        pub resets: u32,
    }

    impl ConstSource {
        pub fn stereo(left: Sample, right: Sample) -> Self {
            Self {
                left,
                right,
                channels: 2,
                buffers: Vec::new(),
                deps: DepList::new(),
                resets: 0,
            }
        }

        pub fn mono(value: Sample) -> Self {
            Self {
                left: value,
                right: value,
                channels: 1,
                buffers: Vec::new(),
                deps: DepList::new(),
                resets: 0,
            }
        }
    }

    impl AudioProcessor for ConstSource {
        fn initialize(&mut self, _speakers: SpeakerArrangement) {
            self.buffers = (0..self.channels).map(|_| vec![0.0; MAX_BLOCK_FRAMES]).collect();
        }

        fn reset(&mut self, _target_stamp: u64) {
            self.resets += 1;
        }

        fn render(&mut self, n_frames: usize) {
            let values = [self.left, self.right];
            for (ch, buf) in self.buffers.iter_mut().enumerate() {
                buf[..n_frames].fill(values[ch.min(1)]);
            }
        }

        fn n_obuses(&self) -> usize {
            1
        }

        fn n_ochannels(&self, bus: OBusId) -> usize {
            if bus == OBusId::MAIN {
                self.channels
            } else {
                0
            }
        }

        fn ofloats(&self, bus: OBusId, channel: usize) -> &[Sample] {
            debug_assert_eq!(bus, OBusId::MAIN);
            &self.buffers[channel]
        }

        fn dependencies(&self) -> DepList {
            self.deps.clone()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ConstSource;
    use super::*;

    #[test]
    fn test_table_insert_reuses_slots() {
        let mut table = ProcTable::new();
        let a = table.insert(Box::new(ConstSource::mono(0.0)), 0);
        let b = table.insert(Box::new(ConstSource::mono(0.0)), 0);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        table.remove(a);
        assert!(!table.contains(a));
        let c = table.insert(Box::new(ConstSource::mono(0.0)), 0);
        assert_eq!(c, a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_render_block_guards_stamp() {
        let mut table = ProcTable::new();
        let id = table.insert(Box::new(ConstSource::stereo(1.0, -1.0)), 0);
        let slot = table.get_mut(id).unwrap();
        slot.proc.initialize(SpeakerArrangement::Stereo);

        slot.render_block(512);
        assert_eq!(slot.render_stamp(), 512);

        // Rendering to the same target is a no-op.
        slot.render_block(512);
        assert_eq!(slot.render_stamp(), 512);

        // A gap larger than the maximum block is refused.
        slot.render_block(512 + (MAX_BLOCK_FRAMES as u64) * 2);
        assert_eq!(slot.render_stamp(), 512);
    }

    #[test]
    fn test_reset_state_once_per_stamp() {
        let mut table = ProcTable::new();
        let id = table.insert(Box::new(ConstSource::mono(0.5)), 0);
        let slot = table.get_mut(id).unwrap();

        slot.reset_state(1024);
        slot.reset_state(1024);
        let src = slot.processor().as_any().downcast_ref::<ConstSource>().unwrap();
        assert_eq!(src.resets, 1);
    }
}
