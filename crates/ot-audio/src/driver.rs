//! PCM and MIDI driver abstraction
//!
//! Drivers register under a string id; the engine resolves preference
//! strings like `"jack"` or `"jack:scarlett"` against the registry and
//! renders against the uniform trait surface. `"null"` always resolves to
//! the built-in silent fallback.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ot_core::Sample;

use crate::midi::MidiEventStream;
use crate::null::NullPcmDriver;
use crate::{DriverError, DriverResult};

/// Direction a driver is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    ReadOnly,
    WriteOnly,
    Duplex,
}

impl IoDir {
    #[inline]
    pub fn readable(self) -> bool {
        matches!(self, IoDir::ReadOnly | IoDir::Duplex)
    }

    #[inline]
    pub fn writable(self) -> bool {
        matches!(self, IoDir::WriteOnly | IoDir::Duplex)
    }
}

/// Configuration handed to a PCM driver at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcmDriverConfig {
    pub n_channels: usize,
    pub mix_freq: u32,
    pub latency_ms: u32,
    pub block_length: usize,
}

/// Uniform PCM driver interface.
///
/// The engine thread is the only caller of `pcm_check_io`, `pcm_read` and
/// `pcm_write`; `open`/`close` may run on the control thread, handoff into
/// active use goes through the engine's synchronized jobs.
pub trait PcmDriver: Send {
    /// Open the device. `readable`/`writable` describe the requested and
    /// the required direction; drivers may open duplex regardless.
    fn open(&mut self, readable: IoDir, writable: IoDir, config: &PcmDriverConfig)
        -> DriverResult<()>;

    fn close(&mut self);

    fn opened(&self) -> bool;

    /// Frames per driver period; the engine clamps its block size to this.
    fn block_length(&self) -> usize;

    fn pcm_frequency(&self) -> u32;

    /// Poll for I/O readiness. Returns `true` when a block can be
    /// processed now; otherwise stores a sleep budget in `timeout_us`.
    fn pcm_check_io(&mut self, timeout_us: &mut u64) -> bool;

    /// Read `n_samples` interleaved samples. Returns samples read.
    fn pcm_read(&mut self, n_samples: usize, values: &mut [Sample]) -> usize;

    /// Write `n_samples` interleaved samples; expected bounded by roughly
    /// one block duration.
    fn pcm_write(&mut self, n_samples: usize, values: &[Sample]);

    /// Read-side and write-side latency in frames.
    fn pcm_latency(&self, rlatency: &mut usize, wlatency: &mut usize);
}

/// Uniform MIDI driver interface.
pub trait MidiDriver: Send {
    fn open(&mut self, iodir: IoDir) -> DriverResult<()>;

    fn close(&mut self);

    /// The devid this driver was opened for, used to match preference
    /// slots against already-open drivers across hot-swaps.
    fn devid(&self) -> &str;

    /// Drain pending device events into `stream` with frame-accurate
    /// offsets relative to the current block.
    fn fetch_events(&mut self, stream: &mut MidiEventStream, sample_rate: u32);
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority tag for registry listings; lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DriverPriority {
    Jack,
    Other,
    Null,
}

/// One selectable device, as shown by a control surface.
#[derive(Debug, Clone)]
pub struct DriverEntry {
    pub devid: String,
    pub device_name: String,
    pub capabilities: String,
    pub device_info: String,
    pub notice: String,
    pub priority: DriverPriority,
}

pub type PcmDriverFactory = fn(devid: &str) -> Box<dyn PcmDriver>;
pub type MidiDriverFactory = fn(devid: &str) -> Box<dyn MidiDriver>;
pub type DriverListFn = fn(entries: &mut Vec<DriverEntry>);

struct PcmDriverDesc {
    name: &'static str,
    create: PcmDriverFactory,
    list: DriverListFn,
}

struct MidiDriverDesc {
    name: &'static str,
    create: MidiDriverFactory,
    list: DriverListFn,
}

fn list_null_driver(entries: &mut Vec<DriverEntry>) {
    entries.push(DriverEntry {
        devid: "null".into(),
        device_name: "Null Audio Device".into(),
        capabilities: "Silent discard of all audio".into(),
        device_info: "Built-in fallback, always available".into(),
        notice: String::new(),
        priority: DriverPriority::Null,
    });
}

lazy_static::lazy_static! {
    // Sole initialization point for the driver registries; built-in
    // drivers are registered here, everything else registers through
    // `register_pcm_driver` / `register_midi_driver` before engine start.
    static ref PCM_REGISTRY: RwLock<Vec<PcmDriverDesc>> = {
        let mut v: Vec<PcmDriverDesc> = Vec::new();
        v.push(PcmDriverDesc {
            name: "null",
            create: |devid| Box::new(NullPcmDriver::new(devid)),
            list: list_null_driver,
        });
        #[cfg(feature = "jack-driver")]
        v.push(PcmDriverDesc {
            name: "jack",
            create: |devid| Box::new(crate::jack::JackPcmDriver::new(devid)),
            list: crate::jack::list_jack_drivers,
        });
        RwLock::new(v)
    };

    static ref MIDI_REGISTRY: RwLock<Vec<MidiDriverDesc>> = RwLock::new(Vec::new());
}

/// Register a PCM driver under `name`. Ids of the form `"name"` or
/// `"name:device"` resolve to it.
pub fn register_pcm_driver(name: &'static str, create: PcmDriverFactory, list: DriverListFn) {
    PCM_REGISTRY.write().push(PcmDriverDesc { name, create, list });
}

/// Register a MIDI driver under `name`.
pub fn register_midi_driver(name: &'static str, create: MidiDriverFactory, list: DriverListFn) {
    MIDI_REGISTRY.write().push(MidiDriverDesc { name, create, list });
}

/// List every device entry known to the registered PCM drivers, sorted by
/// priority.
pub fn list_pcm_drivers() -> Vec<DriverEntry> {
    let mut entries = Vec::new();
    for desc in PCM_REGISTRY.read().iter() {
        (desc.list)(&mut entries);
    }
    entries.sort_by(|a, b| a.priority.cmp(&b.priority));
    entries
}

/// List every device entry known to the registered MIDI drivers.
pub fn list_midi_drivers() -> Vec<DriverEntry> {
    let mut entries = Vec::new();
    for desc in MIDI_REGISTRY.read().iter() {
        (desc.list)(&mut entries);
    }
    entries.sort_by(|a, b| a.priority.cmp(&b.priority));
    entries
}

/// Split `"driver:device"` into its registry name and device part.
fn split_devid(devid: &str) -> (&str, &str) {
    match devid.split_once(':') {
        Some((driver, device)) => (driver, device),
        None => (devid, ""),
    }
}

/// Create and open the PCM driver selected by `devid`.
pub fn open_pcm_driver(
    devid: &str,
    readable: IoDir,
    writable: IoDir,
    config: &PcmDriverConfig,
) -> DriverResult<Box<dyn PcmDriver>> {
    let (name, _device) = split_devid(devid);
    let create = PCM_REGISTRY
        .read()
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.create)
        .ok_or_else(|| DriverError::UnknownDriver(devid.to_string()))?;
    let mut driver = create(devid);
    driver.open(readable, writable, config)?;
    log::info!(
        "opened PCM driver {:?}: block={} rate={}Hz",
        devid,
        driver.block_length(),
        driver.pcm_frequency()
    );
    Ok(driver)
}

/// Create and open the MIDI driver selected by `devid`.
pub fn open_midi_driver(devid: &str, iodir: IoDir) -> DriverResult<Box<dyn MidiDriver>> {
    let (name, _device) = split_devid(devid);
    let create = MIDI_REGISTRY
        .read()
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.create)
        .ok_or_else(|| DriverError::UnknownDriver(devid.to_string()))?;
    let mut driver = create(devid);
    driver.open(iodir)?;
    log::info!("opened MIDI driver {:?}", devid);
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_devid() {
        assert_eq!(split_devid("jack"), ("jack", ""));
        assert_eq!(split_devid("jack:scarlett"), ("jack", "scarlett"));
        assert_eq!(split_devid("a:b:c"), ("a", "b:c"));
    }

    #[test]
    fn test_null_always_listed() {
        let entries = list_pcm_drivers();
        assert!(entries.iter().any(|e| e.devid == "null"));
    }

    #[test]
    fn test_open_unknown_driver_fails() {
        let config = PcmDriverConfig {
            n_channels: 2,
            mix_freq: 48_000,
            latency_ms: 8,
            block_length: 512,
        };
        let err = open_pcm_driver("no-such-driver", IoDir::WriteOnly, IoDir::WriteOnly, &config);
        assert!(matches!(err, Err(DriverError::UnknownDriver(_))));
    }
}
