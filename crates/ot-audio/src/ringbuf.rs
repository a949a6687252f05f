//! Lock-free frame ring buffer for the driver boundary
//!
//! Decouples a foreign real-time callback (JACK, a sound server) from the
//! engine's block clock. One thread — the producer — may only write, a
//! second thread — the consumer — may only read. With that discipline the
//! two position indices are each written by exactly one thread, so
//! acquire/release loads and stores on them are the only synchronization
//! required; no CAS, no locks.
//!
//! CRITICAL: all operations are non-blocking on both ends. Callers that
//! want to block on full/empty need their own wake-up primitive on top.

use std::sync::atomic::{AtomicUsize, Ordering};

use ot_core::Sample;

/// Single-producer/single-consumer ring of deinterleaved audio frames.
///
/// All channels share one `(read_pos, write_pos)` pair, so a frame is
/// either visible on every channel or on none. Internally the channel
/// buffers hold `n_frames + 1` slots; the extra slot distinguishes an
/// empty ring from a full one.
pub struct FrameRingBuffer {
    channels: Vec<Box<[Sample]>>,
    /// Slots per channel, `capacity_frames() + 1`
    buffer_frames: usize,
    /// Next frame index the consumer will read (consumer-owned)
    read_pos: AtomicUsize,
    /// Next frame index the producer will write (producer-owned)
    write_pos: AtomicUsize,
}

impl FrameRingBuffer {
    /// Create a ring holding up to `n_frames` frames of `n_channels` channels.
    pub fn new(n_frames: usize, n_channels: usize) -> Self {
        let mut rb = Self {
            channels: Vec::new(),
            buffer_frames: 0,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        };
        rb.resize(n_frames, n_channels);
        rb
    }

    /// Number of frames the ring can hold when full.
    #[inline]
    pub fn capacity_frames(&self) -> usize {
        self.buffer_frames - 1
    }

    #[inline]
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Frames available for reading. Consumer thread only.
    #[inline]
    pub fn get_readable_frames(&self) -> usize {
        let wpos = self.write_pos.load(Ordering::Acquire);
        let rpos = self.read_pos.load(Ordering::Relaxed);
        // wpos == rpos means empty
        if wpos < rpos {
            wpos + self.buffer_frames - rpos
        } else {
            wpos - rpos
        }
    }

    /// Frames available for writing. Producer thread only.
    #[inline]
    pub fn get_writable_frames(&self) -> usize {
        let wpos = self.write_pos.load(Ordering::Relaxed);
        let rpos = self.read_pos.load(Ordering::Acquire);
        let rpos = if rpos <= wpos { rpos + self.buffer_frames } else { rpos };
        // the extra slot keeps a full ring distinguishable from an empty one
        rpos - wpos - 1
    }

    /// Write up to `n_frames` from the per-channel slices in `frames`.
    ///
    /// Returns the number of frames actually written; a short count means
    /// the ring filled up. Producer thread only.
    pub fn write(&self, n_frames: usize, frames: &[&[Sample]]) -> usize {
        debug_assert_eq!(frames.len(), self.channels.len());
        debug_assert!(frames.iter().all(|ch| ch.len() >= n_frames));
        let wpos = self.write_pos.load(Ordering::Relaxed);
        let can_write = self.get_writable_frames().min(n_frames);

        let write1 = can_write.min(self.buffer_frames - wpos);
        let write2 = can_write - write1;

        for (ch, src) in frames.iter().enumerate() {
            // SAFETY: we are the only producer and the protocol guarantees
            // the consumer never reads the [wpos, wpos + can_write) region
            // before the position store below publishes it.
            let dst = self.channels[ch].as_ptr() as *mut Sample;
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(wpos), write1);
                std::ptr::copy_nonoverlapping(src.as_ptr().add(write1), dst, write2);
            }
        }

        // Publish only after every channel copy completed, so the reader
        // always observes whole frames.
        self.write_pos
            .store((wpos + can_write) % self.buffer_frames, Ordering::Release);
        can_write
    }

    /// Read up to `n_frames` into the per-channel slices in `frames`.
    ///
    /// Returns the number of frames actually read; a short count means the
    /// ring ran empty. Consumer thread only.
    pub fn read(&self, n_frames: usize, frames: &mut [&mut [Sample]]) -> usize {
        debug_assert_eq!(frames.len(), self.channels.len());
        debug_assert!(frames.iter().all(|ch| ch.len() >= n_frames));
        let rpos = self.read_pos.load(Ordering::Relaxed);
        let can_read = self.get_readable_frames().min(n_frames);

        let read1 = can_read.min(self.buffer_frames - rpos);
        let read2 = can_read - read1;

        for (ch, dst) in frames.iter_mut().enumerate() {
            // SAFETY: the producer never touches [rpos, rpos + can_read)
            // until read_pos is advanced below.
            let src = self.channels[ch].as_ptr();
            unsafe {
                std::ptr::copy_nonoverlapping(src.add(rpos), dst.as_mut_ptr(), read1);
                std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr().add(read1), read2);
            }
        }

        self.read_pos
            .store((rpos + can_read) % self.buffer_frames, Ordering::Release);
        can_read
    }

    /// Drop all buffered frames.
    ///
    /// Takes `&mut self`: neither the producer nor the consumer may be
    /// active while the ring is cleared.
    pub fn clear(&mut self) {
        self.read_pos.store(0, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Relaxed);
    }

    /// Resize and clear the ring. Same exclusivity rule as [`clear`].
    ///
    /// [`clear`]: FrameRingBuffer::clear
    pub fn resize(&mut self, n_frames: usize, n_channels: usize) {
        self.buffer_frames = n_frames + 1;
        self.channels = (0..n_channels)
            .map(|_| vec![0.0; self.buffer_frames].into_boxed_slice())
            .collect();
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ring_basic() {
        let rb = FrameRingBuffer::new(8, 2);
        assert_eq!(rb.capacity_frames(), 8);
        assert_eq!(rb.n_channels(), 2);
        assert_eq!(rb.get_readable_frames(), 0);
        assert_eq!(rb.get_writable_frames(), 8);

        let l = [1.0, 2.0, 3.0];
        let r = [4.0, 5.0, 6.0];
        assert_eq!(rb.write(3, &[&l, &r]), 3);
        assert_eq!(rb.get_readable_frames(), 3);
        assert_eq!(rb.get_writable_frames(), 5);

        let mut ol = [0.0; 3];
        let mut or = [0.0; 3];
        assert_eq!(rb.read(3, &mut [&mut ol, &mut or]), 3);
        assert_eq!(ol, l);
        assert_eq!(or, r);
    }

    #[test]
    fn test_ring_wrap() {
        let rb = FrameRingBuffer::new(4, 1);

        // Advance the positions into the middle, then wrap.
        let a = [1.0, 2.0, 3.0];
        assert_eq!(rb.write(3, &[&a]), 3);
        let mut out = [0.0; 3];
        assert_eq!(rb.read(3, &mut [&mut out]), 3);

        let b = [4.0, 5.0, 6.0, 7.0];
        assert_eq!(rb.write(4, &[&b]), 4);
        let mut out = [0.0; 4];
        assert_eq!(rb.read(4, &mut [&mut out]), 4);
        assert_eq!(out, b);
    }

    #[test]
    fn test_ring_full_and_empty_disambiguation() {
        let rb = FrameRingBuffer::new(4, 1);
        let data = [0.5; 8];

        // Writing more than capacity is a partial write.
        assert_eq!(rb.write(8, &[&data]), 4);
        assert_eq!(rb.get_writable_frames(), 0);
        assert_eq!(rb.get_readable_frames(), 4);

        // readable + writable + 1 == internal slot count, at any fill level.
        let mut out = [0.0; 2];
        rb.read(2, &mut [&mut out]);
        assert_eq!(rb.get_readable_frames() + rb.get_writable_frames(), 4);
    }

    #[test]
    fn test_ring_resize_clears() {
        let mut rb = FrameRingBuffer::new(4, 1);
        let data = [1.0; 3];
        rb.write(3, &[&data]);
        rb.resize(16, 3);
        assert_eq!(rb.capacity_frames(), 16);
        assert_eq!(rb.n_channels(), 3);
        assert_eq!(rb.get_readable_frames(), 0);
    }

    /// One writer, one reader, a million frames of a ramp in odd-sized
    /// chunks: every frame must arrive exactly once, in order.
    #[test]
    fn test_ring_spsc_stress() {
        const TOTAL: usize = 1_000_000;
        let rb = Arc::new(FrameRingBuffer::new(997, 1));

        let producer = {
            let rb = Arc::clone(&rb);
            std::thread::spawn(move || {
                // Deterministic "random" chunk sizes from a tiny LCG.
                let mut seed = 0x2545f491u64;
                let mut next = 1u32;
                let mut chunk = Vec::with_capacity(256);
                while next as usize <= TOTAL {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                    let want = (seed >> 33) as usize % 256 + 1;
                    chunk.clear();
                    for i in 0..want {
                        let v = next as usize + i;
                        if v > TOTAL {
                            break;
                        }
                        chunk.push(v as Sample);
                    }
                    let mut off = 0;
                    while off < chunk.len() {
                        let n = rb.write(chunk.len() - off, &[&chunk[off..]]);
                        off += n;
                        if n == 0 {
                            std::thread::yield_now();
                        }
                    }
                    next += chunk.len() as u32;
                }
            })
        };

        let mut seed = 0x9e3779b9u64;
        let mut expect = 1u32;
        let mut buf = vec![0.0 as Sample; 311];
        while (expect as usize) <= TOTAL {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let want = ((seed >> 33) as usize % 311 + 1).min(buf.len());
            let n = rb.read(want, &mut [&mut buf[..want]]);
            if n == 0 {
                std::thread::yield_now();
                continue;
            }
            for &v in &buf[..n] {
                assert_eq!(v as u32, expect);
                expect += 1;
            }
        }
        assert_eq!(expect as usize, TOTAL + 1);

        producer.join().unwrap();
        assert_eq!(rb.get_readable_frames(), 0);
    }
}
