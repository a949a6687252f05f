//! Silent fallback PCM driver
//!
//! Always opens, discards every written block, and paces writes against a
//! wall-clock deadline so an engine running on the fallback still advances
//! in real time instead of spinning.

use std::time::{Duration, Instant};

use ot_core::Sample;

use crate::{DriverResult, IoDir, PcmDriver, PcmDriverConfig};

pub struct NullPcmDriver {
    devid: String,
    block_length: usize,
    mix_freq: u32,
    opened: bool,
    /// Wall-clock instant the next block becomes due.
    next_due: Instant,
}

impl NullPcmDriver {
    pub fn new(devid: &str) -> Self {
        Self {
            devid: devid.to_string(),
            block_length: 0,
            mix_freq: 0,
            opened: false,
            next_due: Instant::now(),
        }
    }

    #[inline]
    fn block_duration(&self) -> Duration {
        Duration::from_nanos(self.block_length as u64 * 1_000_000_000 / self.mix_freq as u64)
    }
}

impl PcmDriver for NullPcmDriver {
    fn open(
        &mut self,
        _readable: IoDir,
        _writable: IoDir,
        config: &PcmDriverConfig,
    ) -> DriverResult<()> {
        self.block_length = config.block_length;
        self.mix_freq = config.mix_freq;
        self.next_due = Instant::now();
        self.opened = true;
        log::debug!("null PCM driver {:?} opened, block={}", self.devid, self.block_length);
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn opened(&self) -> bool {
        self.opened
    }

    fn block_length(&self) -> usize {
        self.block_length
    }

    fn pcm_frequency(&self) -> u32 {
        self.mix_freq
    }

    fn pcm_check_io(&mut self, timeout_us: &mut u64) -> bool {
        let now = Instant::now();
        if now >= self.next_due {
            *timeout_us = 0;
            return true;
        }
        *timeout_us = (self.next_due - now).as_micros().max(1) as u64;
        false
    }

    fn pcm_read(&mut self, n_samples: usize, values: &mut [Sample]) -> usize {
        values[..n_samples].fill(0.0);
        n_samples
    }

    fn pcm_write(&mut self, _n_samples: usize, _values: &[Sample]) {
        let dur = self.block_duration();
        self.next_due += dur;
        // Catch up instead of accumulating a backlog after a stall.
        let now = Instant::now();
        if self.next_due + 4 * dur < now {
            self.next_due = now;
        }
    }

    fn pcm_latency(&self, rlatency: &mut usize, wlatency: &mut usize) {
        *rlatency = 0;
        *wlatency = self.block_length;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(block: usize) -> PcmDriverConfig {
        PcmDriverConfig {
            n_channels: 2,
            mix_freq: 48_000,
            latency_ms: 8,
            block_length: block,
        }
    }

    #[test]
    fn test_null_driver_paces_writes() {
        let mut drv = NullPcmDriver::new("null");
        drv.open(IoDir::WriteOnly, IoDir::WriteOnly, &test_config(480))
            .unwrap();

        let mut timeout = 0;
        assert!(drv.pcm_check_io(&mut timeout));

        let block = vec![0.0; 480 * 2];
        drv.pcm_write(block.len(), &block);
        drv.pcm_write(block.len(), &block);

        // Two blocks of 480 frames at 48kHz are 20ms of audio; the driver
        // must not be writable again immediately.
        let mut timeout = 0;
        if !drv.pcm_check_io(&mut timeout) {
            assert!(timeout > 0);
            assert!(timeout <= 20_000);
        }
    }

    #[test]
    fn test_null_driver_reads_silence() {
        let mut drv = NullPcmDriver::new("null");
        drv.open(IoDir::Duplex, IoDir::Duplex, &test_config(64)).unwrap();
        let mut buf = vec![1.0; 128];
        assert_eq!(drv.pcm_read(128, &mut buf), 128);
        assert!(buf.iter().all(|&s| s == 0.0));
    }
}
