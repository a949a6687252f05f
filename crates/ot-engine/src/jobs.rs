//! Job queues between the control thread and the audio thread
//!
//! Three delivery disciplines over the same intrusive stack primitive,
//! distinguished by queue type rather than a runtime tag:
//!
//! - [`AsyncJobs`] — fire-and-forget; the submitter returns immediately.
//! - [`ConstJobs`] — blocking barrier; drained after async jobs within
//!   the same dispatch tick, release happens after the closure ran.
//! - [`SynchronizedJobs`] — blocking, but delivered through the async
//!   stack; used when a mutation must land in rendered state and any
//!   handed-back resources must be destroyed on the control thread.
//!
//! Job nodes are allocated on the submitting thread and pushed back to
//! the trash stack after running, so closure environments are always
//! dropped on the control thread, never on the audio thread.

use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{EngineShared, EngineState};
use crate::stack::StackNode;

/// A closure run on the engine thread against the engine state.
///
/// `FnMut` rather than `FnOnce` so that invoking the job does not consume
/// its environment; captures stay in the job node until the control
/// thread frees it via the trash path. To hand ownership into the engine,
/// capture the value in an `Option` and `take()` it inside the closure.
pub type JobClosure = Box<dyn FnMut(&mut EngineState) + Send + 'static>;

pub(crate) struct Job {
    pub(crate) next: AtomicPtr<Job>,
    pub(crate) func: JobClosure,
}

impl Job {
    pub(crate) fn new_node(func: JobClosure) -> *mut Job {
        Box::into_raw(Box::new(Job { next: AtomicPtr::new(ptr::null_mut()), func }))
    }
}

impl StackNode for Job {
    fn next_link(&self) -> &AtomicPtr<Job> {
        &self.next
    }
}

/// Engine state slot while no audio thread is running.
pub(crate) type ParkedState = Arc<Mutex<Option<EngineState>>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Discipline {
    Async,
    Const,
    Synchronized,
}

fn submit(
    shared: &Arc<EngineShared>,
    parked: &ParkedState,
    discipline: Discipline,
    mut func: JobClosure,
) {
    if !shared.engine_running() {
        // Engine thread not started: run synchronously on the parked
        // state, on the calling thread.
        let mut guard = parked.lock();
        if let Some(state) = guard.as_mut() {
            func(state);
            return;
        }
        // Mid-start: the state was already handed to the thread, fall
        // through to the queued path.
    }

    match discipline {
        Discipline::Async => {
            let node = Job::new_node(func);
            // SAFETY: freshly allocated node, null next link.
            let was_empty = unsafe { shared.async_stack.push(node) };
            if was_empty {
                shared.wakeup_engine_mt();
            }
        }
        Discipline::Const | Discipline::Synchronized => {
            debug_assert!(
                !shared.on_engine_thread(),
                "blocking job submitted from the engine thread"
            );
            let (tx, rx) = crossbeam_channel::bounded::<()>(1);
            let wrapper: JobClosure = Box::new(move |state| {
                func(state);
                let _ = tx.send(());
            });
            let node = Job::new_node(wrapper);
            // SAFETY: freshly allocated node, null next link.
            let was_empty = unsafe {
                match discipline {
                    Discipline::Const => shared.const_stack.push(node),
                    _ => shared.async_stack.push(node),
                }
            };
            if was_empty {
                shared.wakeup_engine_mt();
            }
            let _ = rx.recv();
        }
    }
}

/// Non-blocking job queue; mutations land before the next render.
#[derive(Clone)]
pub struct AsyncJobs {
    pub(crate) shared: Arc<EngineShared>,
    pub(crate) parked: ParkedState,
}

impl AsyncJobs {
    /// Queue `func` and return immediately. If the engine thread is not
    /// running, the closure executes synchronously on this thread.
    pub fn add(&self, func: impl FnMut(&mut EngineState) + Send + 'static) {
        submit(&self.shared, &self.parked, Discipline::Async, Box::new(func));
    }
}

/// Blocking barrier queue; `add` returns after the closure ran on the
/// engine thread.
#[derive(Clone)]
pub struct ConstJobs {
    pub(crate) shared: Arc<EngineShared>,
    pub(crate) parked: ParkedState,
}

impl ConstJobs {
    pub fn add(&self, func: impl FnMut(&mut EngineState) + Send + 'static) {
        submit(&self.shared, &self.parked, Discipline::Const, Box::new(func));
    }
}

/// Blocking queue delivered through the async stack: the submitter
/// observes the mutation applied to rendered state, and resources the
/// closure hands back are destroyed here, after release.
#[derive(Clone)]
pub struct SynchronizedJobs {
    pub(crate) shared: Arc<EngineShared>,
    pub(crate) parked: ParkedState,
}

impl SynchronizedJobs {
    pub fn add(&self, func: impl FnMut(&mut EngineState) + Send + 'static) {
        submit(&self.shared, &self.parked, Discipline::Synchronized, Box::new(func));
    }
}
