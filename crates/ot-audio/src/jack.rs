//! JACK PCM driver
//!
//! The JACK server invokes our process callback on its own real-time
//! thread; a pair of [`FrameRingBuffer`]s decouples that foreign clock
//! from the engine's block clock. The callback is the producer of the
//! input ring and the consumer of the output ring; the engine-side
//! `pcm_read`/`pcm_write` are the opposite ends. When either ring lacks a
//! full period the callback counts an xrun and emits silence for that
//! cycle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use jack::{AudioIn, AudioOut, Client, ClientOptions, Control, Port, ProcessScope};
use smallvec::SmallVec;

use ot_core::Sample;

use crate::{
    DriverEntry, DriverError, DriverPriority, DriverResult, FrameRingBuffer, IoDir, PcmDriver,
    PcmDriverConfig,
};

/// State shared with the foreign callback.
struct JackShared {
    input_ring: FrameRingBuffer,
    output_ring: FrameRingBuffer,
    /// Callback stays silent until the engine polls `pcm_check_io` once.
    active: AtomicBool,
    xruns: AtomicU32,
    is_down: AtomicBool,
}

struct JackProcessHandler {
    shared: Arc<JackShared>,
    in_ports: Vec<Port<AudioIn>>,
    out_ports: Vec<Port<AudioOut>>,
}

impl jack::ProcessHandler for JackProcessHandler {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let n_frames = ps.n_frames() as usize;
        let shared = &self.shared;

        if !shared.active.load(Ordering::Acquire) {
            for port in self.out_ports.iter_mut() {
                port.as_mut_slice(ps).fill(0.0);
            }
            return Control::Continue;
        }

        if shared.input_ring.get_writable_frames() >= n_frames
            && shared.output_ring.get_readable_frames() >= n_frames
        {
            let ins: SmallVec<[&[Sample]; 2]> =
                self.in_ports.iter().map(|p| p.as_slice(ps)).collect();
            let written = shared.input_ring.write(n_frames, &ins);
            debug_assert_eq!(written, n_frames);

            let mut outs: SmallVec<[&mut [Sample]; 2]> =
                self.out_ports.iter_mut().map(|p| p.as_mut_slice(ps)).collect();
            let read = shared.output_ring.read(n_frames, &mut outs);
            debug_assert_eq!(read, n_frames);
        } else {
            // Underrun: the engine fell behind by at least one period.
            shared.xruns.fetch_add(1, Ordering::Relaxed);
            for port in self.out_ports.iter_mut() {
                port.as_mut_slice(ps).fill(0.0);
            }
        }
        Control::Continue
    }
}

struct JackNotifications {
    shared: Arc<JackShared>,
}

impl jack::NotificationHandler for JackNotifications {
    fn shutdown(&mut self, _status: jack::ClientStatus, _reason: &str) {
        self.shared.is_down.store(true, Ordering::Release);
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        self.shared.xruns.fetch_add(1, Ordering::Relaxed);
        Control::Continue
    }
}

pub struct JackPcmDriver {
    devid: String,
    client: Option<jack::AsyncClient<JackNotifications, JackProcessHandler>>,
    shared: Option<Arc<JackShared>>,
    n_channels: usize,
    mix_freq: u32,
    block_length: usize,
    /// Ring depth in frames, also the extra write-side latency.
    buffer_frames: usize,
    /// Deinterleave scratch, `block_length * n_channels`, allocated at open.
    scratch: Vec<Sample>,
    printed_xruns: u32,
    printed_is_down: bool,
}

impl JackPcmDriver {
    pub fn new(devid: &str) -> Self {
        Self {
            devid: devid.to_string(),
            client: None,
            shared: None,
            n_channels: 0,
            mix_freq: 0,
            block_length: 0,
            buffer_frames: 0,
            scratch: Vec::new(),
            printed_xruns: 0,
            printed_is_down: false,
        }
    }
}

impl PcmDriver for JackPcmDriver {
    fn open(
        &mut self,
        _readable: IoDir,
        _writable: IoDir,
        config: &PcmDriverConfig,
    ) -> DriverResult<()> {
        if self.client.is_some() {
            return Err(DriverError::Internal("jack driver opened twice".into()));
        }

        let (client, _status) = Client::new("overtone", ClientOptions::NO_START_SERVER)
            .map_err(|e| DriverError::FileOpenFailed(format!("{}: {}", self.devid, e)))?;
        let client_name = client.name().to_string();

        self.n_channels = config.n_channels;
        self.mix_freq = client.sample_rate() as u32;
        self.block_length = config.block_length;
        let jack_period = client.buffer_size() as usize;

        let mut in_ports = Vec::with_capacity(self.n_channels);
        let mut out_ports = Vec::with_capacity(self.n_channels);
        for ch in 0..self.n_channels {
            let inp = client
                .register_port(&format!("in_{}", ch), AudioIn::default())
                .map_err(|e| DriverError::FileOpenFailed(e.to_string()))?;
            let outp = client
                .register_port(&format!("out_{}", ch), AudioOut::default())
                .map_err(|e| DriverError::FileOpenFailed(e.to_string()))?;
            in_ports.push(inp);
            out_ports.push(outp);
        }

        // Ring sizing: at least two server periods for dropout-free audio,
        // plus one engine block so a non-power-of-two engine block can
        // still fill completely; the preference latency can only raise it.
        let min_buffer_frames = jack_period * 2 + config.block_length;
        let user_buffer_frames = (config.latency_ms as usize * self.mix_freq as usize) / 1000;
        let buffer_frames = min_buffer_frames.max(user_buffer_frames);

        let shared = Arc::new(JackShared {
            input_ring: FrameRingBuffer::new(buffer_frames, self.n_channels),
            output_ring: FrameRingBuffer::new(buffer_frames, self.n_channels),
            active: AtomicBool::new(false),
            xruns: AtomicU32::new(0),
            is_down: AtomicBool::new(false),
        });
        if shared.output_ring.get_writable_frames() != buffer_frames {
            return Err(DriverError::Internal(format!(
                "ring buffer size mismatch: {} != {}",
                shared.output_ring.get_writable_frames(),
                buffer_frames
            )));
        }
        self.buffer_frames = buffer_frames;
        self.scratch = vec![0.0; self.block_length * self.n_channels];

        // Prefill the output ring with silence so the very first callback
        // cycles have data.
        let silence = vec![0.0 as Sample; buffer_frames];
        let silence_channels: Vec<&[Sample]> = (0..self.n_channels).map(|_| &silence[..]).collect();
        let prefilled = shared.output_ring.write(buffer_frames, &silence_channels);
        debug_assert_eq!(prefilled, buffer_frames);

        log::debug!(
            "{}: ring size={} frames ({:.1}ms)",
            self.devid,
            buffer_frames,
            buffer_frames as f64 / self.mix_freq as f64 * 1000.0
        );

        let handler = JackProcessHandler {
            shared: Arc::clone(&shared),
            in_ports,
            out_ports,
        };
        let notifications = JackNotifications { shared: Arc::clone(&shared) };
        let async_client = client
            .activate_async(notifications, handler)
            .map_err(|e| DriverError::FileOpenFailed(e.to_string()))?;

        // Best-effort connection to the physical playback ports; a JACK
        // patchbay can always rewire us later.
        let playback_ports = async_client.as_client().ports(
            None,
            None,
            jack::PortFlags::IS_INPUT | jack::PortFlags::IS_PHYSICAL,
        );
        for (ch, target) in playback_ports.iter().take(self.n_channels).enumerate() {
            let our = format!("{}:out_{}", client_name, ch);
            if let Err(e) = async_client.as_client().connect_ports_by_name(&our, target) {
                log::warn!("could not connect {} -> {}: {}", our, target, e);
            }
        }

        self.shared = Some(shared);
        self.client = Some(async_client);
        log::info!(
            "{}: opened PCM, rate={}Hz block={} ring={}",
            self.devid,
            self.mix_freq,
            self.block_length,
            self.buffer_frames
        );
        Ok(())
    }

    fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.deactivate();
        }
        self.shared = None;
    }

    fn opened(&self) -> bool {
        self.client.is_some()
    }

    fn block_length(&self) -> usize {
        self.block_length
    }

    fn pcm_frequency(&self) -> u32 {
        self.mix_freq
    }

    fn pcm_check_io(&mut self, timeout_us: &mut u64) -> bool {
        let shared = match self.shared.as_ref() {
            Some(s) => s,
            None => return false,
        };

        // Enable processing in the callback (if not already active).
        shared.active.store(true, Ordering::Release);

        let xruns = shared.xruns.load(Ordering::Relaxed);
        if xruns != self.printed_xruns {
            self.printed_xruns = xruns;
            log::warn!("{}: {} driver xruns", self.devid, xruns);
        }
        if shared.is_down.load(Ordering::Acquire) && !self.printed_is_down {
            self.printed_is_down = true;
            log::error!("{}: connection to jack server lost", self.devid);
        }

        let n_frames_avail = shared
            .output_ring
            .get_writable_frames()
            .min(shared.input_ring.get_readable_frames());
        if n_frames_avail >= self.block_length {
            *timeout_us = 0;
            return true;
        }

        let diff_frames = self.block_length - n_frames_avail;
        *timeout_us = (diff_frames as u64 * 1_000_000 / self.mix_freq as u64).max(1_000);
        false
    }

    fn pcm_read(&mut self, n_samples: usize, values: &mut [Sample]) -> usize {
        let shared = match self.shared.as_ref() {
            Some(s) => Arc::clone(s),
            None => return 0,
        };
        debug_assert_eq!(n_samples, self.block_length * self.n_channels);

        let block = self.block_length;
        let mut channels: SmallVec<[&mut [Sample]; 2]> = self.scratch.chunks_mut(block).collect();
        let frames_read = shared.input_ring.read(block, &mut channels);
        debug_assert_eq!(frames_read, block);

        for ch in 0..self.n_channels {
            let src = &self.scratch[ch * block..(ch + 1) * block];
            for (i, &s) in src.iter().enumerate() {
                values[ch + i * self.n_channels] = s;
            }
        }
        n_samples
    }

    fn pcm_write(&mut self, n_samples: usize, values: &[Sample]) {
        let shared = match self.shared.as_ref() {
            Some(s) => Arc::clone(s),
            None => return,
        };
        debug_assert_eq!(n_samples, self.block_length * self.n_channels);

        let block = self.block_length;
        for ch in 0..self.n_channels {
            let dst = &mut self.scratch[ch * block..(ch + 1) * block];
            for (i, d) in dst.iter_mut().enumerate() {
                *d = values[ch + i * self.n_channels];
            }
        }
        let channels: SmallVec<[&[Sample]; 2]> = self.scratch.chunks(block).collect();
        let frames_written = shared.output_ring.write(block, &channels);
        debug_assert_eq!(frames_written, block);
    }

    fn pcm_latency(&self, rlatency: &mut usize, wlatency: &mut usize) {
        // The output ring is normally completely filled, so its depth
        // counts as additional write latency.
        *rlatency = self.block_length;
        *wlatency = self.block_length + self.buffer_frames;
    }
}

impl Drop for JackPcmDriver {
    fn drop(&mut self) {
        if self.opened() {
            self.close();
        }
    }
}

/// Fill registry entries from the ports the JACK server exposes.
pub(crate) fn list_jack_drivers(entries: &mut Vec<DriverEntry>) {
    let client = match Client::new("overtone_query", ClientOptions::NO_START_SERVER) {
        Ok((c, _)) => c,
        Err(e) => {
            log::debug!("jack not reachable for device listing: {}", e);
            return;
        }
    };

    let playback = client.ports(
        None,
        None,
        jack::PortFlags::IS_INPUT | jack::PortFlags::IS_PHYSICAL,
    );
    let capture = client.ports(
        None,
        None,
        jack::PortFlags::IS_OUTPUT | jack::PortFlags::IS_PHYSICAL,
    );

    // Group by device (everything before the port's last colon).
    let mut devices: Vec<String> = playback
        .iter()
        .chain(capture.iter())
        .filter_map(|p| p.rsplit_once(':').map(|(d, _)| d.to_string()))
        .collect();
    devices.sort();
    devices.dedup();

    for device in devices {
        let n_play = playback.iter().filter(|p| p.starts_with(&device)).count();
        let n_cap = capture.iter().filter(|p| p.starts_with(&device)).count();
        entries.push(DriverEntry {
            devid: format!("jack:{}", device),
            device_name: format!("JACK \"{}\" Audio Device", device),
            capabilities: format!("channels: {}*playback + {}*capture", n_play, n_cap),
            device_info: "Routing via the JACK Audio Connection Kit".into(),
            notice: "Note: JACK adds latency compared to direct hardware access".into(),
            priority: DriverPriority::Jack,
        });
    }
}
