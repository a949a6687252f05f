//! Lock-free intrusive stack
//!
//! Multi-producer/single-consumer LIFO over nodes that expose an atomic
//! next pointer. Producers contend only on a CAS retry; the consumer
//! drains the whole stack with a single atomic exchange. `push_chain`
//! lets the engine return an entire drained job batch to the trash list
//! with one CAS.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A node type usable on an [`AtomicStack`]: one atomic next-link, owned
/// by whichever stack the node currently sits on.
pub trait StackNode {
    fn next_link(&self) -> &AtomicPtr<Self>
    where
        Self: Sized;
}

/// Wait-free-drain intrusive stack with atomic `push` and `pop_all`.
pub struct AtomicStack<T: StackNode> {
    head: AtomicPtr<T>,
}

impl<T: StackNode> AtomicStack<T> {
    pub const fn new() -> Self {
        Self { head: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Non-authoritative observation of the head; a `false` result may be
    /// stale by the time the caller acts on it.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Push `node` onto the stack, returns whether the stack was empty.
    ///
    /// Callers use the return value to wake the consumer exactly once per
    /// burst of submissions.
    ///
    /// # Safety
    /// `node` must be a valid, exclusively owned pointer whose next link
    /// is null; ownership transfers to the stack until popped.
    pub unsafe fn push(&self, node: *mut T) -> bool {
        unsafe { self.push_chain(node, node) }
    }

    /// Push the linked chain `first -> … -> last` in one CAS, returns
    /// whether the stack was empty.
    ///
    /// # Safety
    /// The chain must be exclusively owned, linked through the next
    /// pointers, and `last`'s next link must be null.
    pub unsafe fn push_chain(&self, first: *mut T, last: *mut T) -> bool {
        debug_assert!(!first.is_null() && !last.is_null());
        debug_assert!(unsafe { (*last).next_link().load(Ordering::Relaxed).is_null() });
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*last).next_link().store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, first, Ordering::Release, Ordering::Relaxed)
            {
                Ok(prev) => return prev.is_null(),
                Err(observed) => head = observed,
            }
        }
    }

    /// Atomically take every node, in LIFO order. The caller becomes the
    /// exclusive owner of the returned chain.
    pub fn pop_all(&self) -> *mut T {
        self.head.swap(ptr::null_mut(), Ordering::Acquire)
    }

    /// Take every node and reverse the chain in place, restoring FIFO
    /// submission order.
    pub fn pop_reversed(&self) -> *mut T {
        let mut current = self.pop_all();
        let mut prev: *mut T = ptr::null_mut();
        while !current.is_null() {
            // The chain is exclusively ours after pop_all, so plain
            // relaxed accesses on the links suffice.
            unsafe {
                let link = (*current).next_link();
                let next = link.load(Ordering::Relaxed);
                link.store(prev, Ordering::Relaxed);
                prev = current;
                current = next;
            }
        }
        prev
    }
}

impl<T: StackNode> Default for AtomicStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

// The stack only holds raw pointers to nodes whose ownership the push /
// pop protocol transfers whole; the node type decides what crosses
// threads.
unsafe impl<T: StackNode + Send> Send for AtomicStack<T> {}
unsafe impl<T: StackNode + Send> Sync for AtomicStack<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestNode {
        next: AtomicPtr<TestNode>,
        value: u32,
    }

    impl StackNode for TestNode {
        fn next_link(&self) -> &AtomicPtr<TestNode> {
            &self.next
        }
    }

    fn node(value: u32) -> *mut TestNode {
        Box::into_raw(Box::new(TestNode { next: AtomicPtr::new(std::ptr::null_mut()), value }))
    }

    unsafe fn collect_and_free(mut head: *mut TestNode) -> Vec<u32> {
        let mut values = Vec::new();
        while !head.is_null() {
            let boxed = unsafe { Box::from_raw(head) };
            head = boxed.next.load(Ordering::Relaxed);
            values.push(boxed.value);
        }
        values
    }

    #[test]
    fn test_push_reports_was_empty() {
        let stack = AtomicStack::new();
        assert!(stack.is_empty());
        unsafe {
            assert!(stack.push(node(1)));
            assert!(!stack.push(node(2)));
            assert!(!stack.push(node(3)));
        }
        assert!(!stack.is_empty());
        let values = unsafe { collect_and_free(stack.pop_all()) };
        assert_eq!(values, vec![3, 2, 1]);
        unsafe {
            assert!(stack.push(node(4)));
        }
        let _ = unsafe { collect_and_free(stack.pop_all()) };
    }

    #[test]
    fn test_pop_reversed_restores_submit_order() {
        let stack = AtomicStack::new();
        unsafe {
            for v in 1..=5 {
                stack.push(node(v));
            }
        }
        let values = unsafe { collect_and_free(stack.pop_reversed()) };
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert!(stack.pop_all().is_null());
    }

    #[test]
    fn test_push_chain_relinks_batch() {
        let stack = AtomicStack::new();
        unsafe {
            for v in 1..=4 {
                stack.push(node(v));
            }
        }
        // Drain in FIFO order, then return the whole batch with one push.
        let first = stack.pop_reversed();
        let mut last = first;
        unsafe {
            while !(*last).next_link().load(Ordering::Relaxed).is_null() {
                last = (*last).next_link().load(Ordering::Relaxed);
            }
            assert!(stack.push_chain(first, last));
        }
        let values = unsafe { collect_and_free(stack.pop_reversed()) };
        assert_eq!(values, vec![1, 2, 3, 4]);
    }

    /// Every node pushed from any thread is recovered exactly once.
    #[test]
    fn test_concurrent_push_complete() {
        use std::sync::Arc;

        const THREADS: u32 = 4;
        const PER_THREAD: u32 = 10_000;

        let stack = Arc::new(AtomicStack::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let stack = Arc::clone(&stack);
                std::thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        unsafe {
                            stack.push(node(t * PER_THREAD + i));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut values = unsafe { collect_and_free(stack.pop_all()) };
        values.sort_unstable();
        assert_eq!(values.len(), (THREADS * PER_THREAD) as usize);
        for (i, v) in values.iter().enumerate() {
            assert_eq!(*v, i as u32);
        }
    }
}
