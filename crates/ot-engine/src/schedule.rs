//! Level-stratified processor schedule
//!
//! Execution order over the reachable graph: level 0 holds leaves, every
//! other node sits one level above its deepest dependency. The schedule
//! is rebuilt between blocks on the engine thread whenever a topology
//! change marks it invalid; rebuild cost is O(reachable nodes).

use crate::processor::{ProcId, ProcTable, SCHEDULED, VISITING};

pub struct Schedule {
    levels: Vec<Vec<ProcId>>,
    invalid: bool,
}

impl Schedule {
    pub fn new() -> Self {
        Self { levels: Vec::new(), invalid: true }
    }

    /// Request a rebuild before the next render.
    pub fn mark_invalid(&mut self) {
        self.invalid = true;
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &[ProcId] {
        &self.levels[level]
    }

    /// Total number of scheduled processors.
    pub fn len(&self) -> usize {
        self.levels.iter().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear scheduling state on every node and drop all levels.
    pub(crate) fn clear(&mut self, table: &mut ProcTable) {
        for level in self.levels.drain(..) {
            for id in level {
                if let Some(slot) = table.get_mut(id) {
                    slot.flags &= !SCHEDULED;
                }
            }
        }
        self.invalid = true;
    }

    /// Rebuild from the output roots, then mark the schedule valid.
    ///
    /// Newly scheduled processors whose render stamp lags the engine's
    /// are reset to `render_stamp` before they next render.
    pub(crate) fn rebuild(&mut self, table: &mut ProcTable, oprocs: &[ProcId], render_stamp: u64) {
        self.clear(table);
        for &root in oprocs {
            self.schedule_processor(table, root, render_stamp);
        }
        self.invalid = false;
    }

    /// Schedule `id` and its dependencies, bottom-up. Returns the level
    /// the next consumer of `id` must be placed above.
    pub(crate) fn schedule_processor(
        &mut self,
        table: &mut ProcTable,
        id: ProcId,
        render_stamp: u64,
    ) -> u32 {
        let slot = match table.get(id) {
            Some(slot) => slot,
            None => return 0,
        };
        if slot.flags & SCHEDULED != 0 {
            return slot.level + 1;
        }
        if slot.flags & VISITING != 0 {
            // Dependency cycle; break it here rather than recursing forever.
            log::warn!("dependency cycle at processor {:?}", id);
            return 0;
        }
        let deps = slot.proc.dependencies();

        table.get_mut(id).expect("slot vanished").flags |= VISITING;
        let mut level = 0;
        for dep in deps {
            level = level.max(self.schedule_processor(table, dep, render_stamp));
        }
        table.get_mut(id).expect("slot vanished").flags &= !VISITING;

        self.schedule_add(table, id, level, render_stamp);
        level + 1
    }

    /// Place `id` at `level`; duplicate adds are absorbed by the
    /// SCHEDULED flag.
    pub(crate) fn schedule_add(
        &mut self,
        table: &mut ProcTable,
        id: ProcId,
        level: u32,
        render_stamp: u64,
    ) {
        let slot = match table.get_mut(id) {
            Some(slot) => slot,
            None => return,
        };
        if slot.flags & SCHEDULED != 0 {
            return;
        }
        slot.flags |= SCHEDULED;
        slot.level = level;
        slot.reset_state(render_stamp);

        let level = level as usize;
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        self.levels[level].push(id);
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::ConstSource;
    use crate::processor::AudioProcessor;
    use ot_core::SpeakerArrangement;

    fn insert_source(table: &mut ProcTable, deps: &[ProcId]) -> ProcId {
        let mut src = ConstSource::mono(0.0);
        src.deps.extend_from_slice(deps);
        let id = table.insert(Box::new(src), 0);
        table.get_mut(id).unwrap().proc.initialize(SpeakerArrangement::Stereo);
        id
    }

    /// Position of `id` in the schedule, as `(level, index)`.
    fn find(schedule: &Schedule, id: ProcId) -> Option<(usize, usize)> {
        (0..schedule.n_levels()).find_map(|l| {
            schedule.level(l).iter().position(|&p| p == id).map(|i| (l, i))
        })
    }

    #[test]
    fn test_levels_stratify_dependencies() {
        let mut table = ProcTable::new();
        let leaf_a = insert_source(&mut table, &[]);
        let leaf_b = insert_source(&mut table, &[]);
        let mid = insert_source(&mut table, &[leaf_a, leaf_b]);
        let root = insert_source(&mut table, &[mid, leaf_b]);

        let mut schedule = Schedule::new();
        schedule.rebuild(&mut table, &[root], 0);

        assert_eq!(find(&schedule, leaf_a).unwrap().0, 0);
        assert_eq!(find(&schedule, leaf_b).unwrap().0, 0);
        assert_eq!(find(&schedule, mid).unwrap().0, 1);
        assert_eq!(find(&schedule, root).unwrap().0, 2);
        assert!(!schedule.is_invalid());
    }

    #[test]
    fn test_shared_dependency_scheduled_once() {
        let mut table = ProcTable::new();
        let shared = insert_source(&mut table, &[]);
        let a = insert_source(&mut table, &[shared]);
        let b = insert_source(&mut table, &[shared]);

        let mut schedule = Schedule::new();
        schedule.rebuild(&mut table, &[a, b], 0);

        assert_eq!(schedule.len(), 3);
        let count: usize = (0..schedule.n_levels())
            .map(|l| schedule.level(l).iter().filter(|&&p| p == shared).count())
            .sum();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unreachable_nodes_not_scheduled() {
        let mut table = ProcTable::new();
        let root = insert_source(&mut table, &[]);
        let orphan = insert_source(&mut table, &[]);

        let mut schedule = Schedule::new();
        schedule.rebuild(&mut table, &[root], 0);

        assert!(find(&schedule, root).is_some());
        assert!(find(&schedule, orphan).is_none());
    }

    #[test]
    fn test_rebuild_resets_lagging_stamps() {
        let mut table = ProcTable::new();
        let root = insert_source(&mut table, &[]);

        let mut schedule = Schedule::new();
        schedule.rebuild(&mut table, &[root], 4096);

        let slot = table.get(root).unwrap();
        assert_eq!(slot.render_stamp(), 4096);
        let src = slot.processor().as_any().downcast_ref::<ConstSource>().unwrap();
        assert_eq!(src.resets, 1);
    }

    #[test]
    fn test_dependency_cycle_terminates() {
        let mut table = ProcTable::new();
        let a = insert_source(&mut table, &[]);
        let b = insert_source(&mut table, &[a]);
        // Close the cycle a -> b -> a.
        table
            .get_mut(a)
            .unwrap()
            .proc
            .as_any_mut()
            .downcast_mut::<ConstSource>()
            .unwrap()
            .deps
            .push(b);

        let mut schedule = Schedule::new();
        schedule.rebuild(&mut table, &[b], 0);
        // Both nodes still end up scheduled exactly once.
        assert_eq!(schedule.len(), 2);
    }
}
