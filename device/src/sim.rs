//! Simulated driver.
//!
//! An in-process model of a host with `N` devices. It keeps just enough state to
//! exercise the registry, buffer and dispatch paths without hardware: images
//! registered by path, per-device resident image and bump allocators, kernels
//! with a register file, and runs whose completion is scripted with
//! [`RunBehavior`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use snafu::ensure;
use tracing::trace;

use crate::driver::{self, DeviceHandle, DeviceMemory, Driver, KernelHandle, RunHandle, SyncDirection};
use crate::error::{AllocationSnafu, DriverSnafu, ImageNotResidentSnafu, ImageOpenSnafu, Result};
use crate::image::{HardwareImage, ImageUuid, MemoryBank};
use crate::packet::{CmdState, CmdTimestamps, CommandPacket, monotonic_ns};
use crate::registry::{FINGERPRINT_HI, FINGERPRINT_LO};

const PAGE_SIZE: u64 = 4096;

/// How a submitted command progresses on a simulated compute unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunBehavior {
    /// Reach `Completed` on the n-th poll.
    CompleteAfter(usize),
    /// Never finish; every poll blocks for the full interval.
    Hang,
    /// Report the given terminal state on the first poll.
    Finish(CmdState),
}

impl Default for RunBehavior {
    fn default() -> Self {
        Self::CompleteAfter(1)
    }
}

/// State shared by every object of one simulated driver.
#[derive(Default)]
struct Shared {
    behavior: RwLock<RunBehavior>,
    fail_start: AtomicBool,
    submissions: AtomicUsize,
    syncs: AtomicUsize,
    last_packet: Mutex<Option<CommandPacket>>,
    per_kernel: Mutex<HashMap<String, usize>>,
    fingerprints: RwLock<HashMap<String, u64>>,
}

pub struct SimDriver {
    devices: Vec<Arc<SimDevice>>,
    images: RwLock<HashMap<PathBuf, HardwareImage>>,
    shared: Arc<Shared>,
}

impl SimDriver {
    pub fn new(num_of_devices: usize) -> Self {
        let shared = Arc::new(Shared::default());
        let devices = (0..num_of_devices).map(|index| Arc::new(SimDevice::new(index, Arc::clone(&shared)))).collect();
        Self { devices, images: RwLock::new(HashMap::new()), shared }
    }

    /// Make `image` available under `path`.
    pub fn with_image(self, path: impl Into<PathBuf>, image: HardwareImage) -> Self {
        self.images.write().insert(path.into(), image);
        self
    }

    /// Seed the fingerprint registers of every kernel named `full_name`.
    pub fn with_fingerprint(self, full_name: &str, fingerprint: u64) -> Self {
        self.shared.fingerprints.write().insert(full_name.to_string(), fingerprint);
        self
    }

    pub fn with_run_behavior(self, behavior: RunBehavior) -> Self {
        self.set_run_behavior(behavior);
        self
    }

    pub fn set_run_behavior(&self, behavior: RunBehavior) {
        *self.shared.behavior.write() = behavior;
    }

    /// Make subsequent `start` calls fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.shared.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn device(&self, index: usize) -> Option<&Arc<SimDevice>> {
        self.devices.get(index)
    }

    /// Total number of commands started.
    pub fn submissions(&self) -> usize {
        self.shared.submissions.load(Ordering::SeqCst)
    }

    /// Number of commands started on kernels named `full_name`, across devices.
    pub fn submissions_of(&self, full_name: &str) -> usize {
        self.shared.per_kernel.lock().get(full_name).copied().unwrap_or_default()
    }

    /// Total number of cache synchronizations performed.
    pub fn sync_count(&self) -> usize {
        self.shared.syncs.load(Ordering::SeqCst)
    }

    /// Copy of the most recently started packet.
    pub fn last_packet(&self) -> Option<CommandPacket> {
        self.shared.last_packet.lock().clone()
    }

    /// Install `driver` as the process-wide default driver.
    pub fn install(driver: Arc<SimDriver>) {
        driver::install("sim", Arc::new(move || Ok(Arc::clone(&driver) as Arc<dyn Driver>)));
    }
}

impl Driver for SimDriver {
    fn name(&self) -> &str {
        "sim"
    }

    fn enumerate_devices(&self) -> usize {
        self.devices.len()
    }

    fn open_image(&self, path: &Path) -> Result<HardwareImage> {
        self.images
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ImageOpenSnafu { path, reason: "no such image" }.build())
    }

    fn open_device(&self, index: usize) -> Result<Arc<dyn DeviceHandle>> {
        let device = self.devices.get(index).ok_or_else(|| {
            DriverSnafu { reason: format!("device {index} out of range ({} present)", self.devices.len()) }.build()
        })?;
        Ok(Arc::clone(device) as Arc<dyn DeviceHandle>)
    }
}

// ============================================================================
// DEVICE
// ============================================================================

pub struct SimDevice {
    index: usize,
    unified: AtomicBool,
    corrupt_uuid: AtomicBool,
    image: RwLock<Option<HardwareImage>>,
    kernels: Mutex<HashMap<String, Arc<SimKernel>>>,
    next_offset: Mutex<HashMap<u32, u64>>,
    shared: Arc<Shared>,
}

impl SimDevice {
    fn new(index: usize, shared: Arc<Shared>) -> Self {
        Self {
            index,
            unified: AtomicBool::new(true),
            corrupt_uuid: AtomicBool::new(false),
            image: RwLock::new(None),
            kernels: Mutex::new(HashMap::new()),
            next_offset: Mutex::new(HashMap::new()),
            shared,
        }
    }

    /// Whether new allocations are host-mapped.
    pub fn set_unified(&self, unified: bool) {
        self.unified.store(unified, Ordering::SeqCst);
    }

    /// Report a uuid different from the loaded image's.
    pub fn set_corrupt_uuid(&self, corrupt: bool) {
        self.corrupt_uuid.store(corrupt, Ordering::SeqCst);
    }

    /// Make `image` resident without going through `load_image`.
    pub fn preload(&self, image: HardwareImage) {
        *self.image.write() = Some(image);
    }

    fn reported_uuid(&self, uuid: ImageUuid) -> ImageUuid {
        if !self.corrupt_uuid.load(Ordering::SeqCst) {
            return uuid;
        }
        let mut bytes = *uuid.as_bytes();
        bytes[0] ^= 0xff;
        ImageUuid::new(bytes)
    }
}

impl DeviceHandle for SimDevice {
    fn index(&self) -> usize {
        self.index
    }

    fn load_image(&self, image: &HardwareImage) -> Result<ImageUuid> {
        *self.image.write() = Some(image.clone());
        self.kernels.lock().clear();
        self.next_offset.lock().clear();
        Ok(self.reported_uuid(image.uuid()))
    }

    fn image_uuid(&self) -> Option<ImageUuid> {
        self.image.read().as_ref().map(|image| self.reported_uuid(image.uuid()))
    }

    fn open_kernel(&self, uuid: ImageUuid, name: &str) -> Result<Arc<dyn KernelHandle>> {
        let image = self.image.read();
        let image = image.as_ref().ok_or_else(|| ImageNotResidentSnafu { device_id: self.index }.build())?;
        ensure!(
            self.reported_uuid(image.uuid()) == uuid,
            DriverSnafu { reason: format!("uuid {uuid} is not resident on device {}", self.index) }
        );
        // `kernel:{}` names an ip without instance suffix.
        let full_name = name.replace(['{', '}'], "");
        let full_name = full_name.strip_suffix(':').map(str::to_string).unwrap_or(full_name);
        ensure!(
            image.ips().contains(&full_name),
            DriverSnafu { reason: format!("no kernel {full_name} in image on device {}", self.index) }
        );

        let mut kernels = self.kernels.lock();
        let kernel = kernels.entry(full_name.clone()).or_insert_with(|| {
            let fingerprint = self.shared.fingerprints.read().get(&full_name).copied().unwrap_or_default();
            Arc::new(SimKernel::new(full_name, fingerprint, Arc::clone(&self.shared)))
        });
        Ok(Arc::clone(kernel) as Arc<dyn KernelHandle>)
    }

    fn alloc(&self, size: usize, bank: u32) -> Result<Box<dyn DeviceMemory>> {
        let image = self.image.read();
        let bank_info: MemoryBank = image
            .as_ref()
            .and_then(|image| image.banks().get(bank as usize))
            .cloned()
            .ok_or_else(|| AllocationSnafu { size, bank, device_id: self.index, reason: "no such bank" }.build())?;
        ensure!(size > 0, AllocationSnafu { size, bank, device_id: self.index, reason: "empty allocation" });

        let mut next_offset = self.next_offset.lock();
        let offset = next_offset.entry(bank).or_default();
        let end = *offset + size as u64;
        ensure!(
            end <= bank_info.size,
            AllocationSnafu { size, bank, device_id: self.index, reason: format!("bank {} exhausted", bank_info.tag) }
        );
        let address = bank_info.base_address + *offset;
        *offset = end.next_multiple_of(PAGE_SIZE);

        let unified = self.unified.load(Ordering::SeqCst);
        trace!(device_id = self.index, size, bank, address = format_args!("{address:#x}"), unified, "sim alloc");
        Ok(Box::new(SimMemory {
            address,
            device: vec![0xa5; size],
            host: unified.then(|| vec![0xa5; size]),
            shared: Arc::clone(&self.shared),
        }))
    }
}

// ============================================================================
// KERNEL
// ============================================================================

pub struct SimKernel {
    name: String,
    registers: Mutex<HashMap<u32, u32>>,
    shared: Arc<Shared>,
}

impl SimKernel {
    fn new(name: String, fingerprint: u64, shared: Arc<Shared>) -> Self {
        let registers = HashMap::from([(FINGERPRINT_LO, fingerprint as u32), (FINGERPRINT_HI, (fingerprint >> 32) as u32)]);
        Self { name, registers: Mutex::new(registers), shared }
    }
}

impl KernelHandle for SimKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_register(&self, offset: u32) -> u32 {
        self.registers.lock().get(&offset).copied().unwrap_or_default()
    }

    fn write_register(&self, offset: u32, value: u32) {
        self.registers.lock().insert(offset, value);
    }

    fn create_run(&self) -> Result<Box<dyn RunHandle>> {
        Ok(Box::new(SimRun {
            kernel: self.name.clone(),
            packet: CommandPacket::new(),
            state: CmdState::New,
            behavior: RunBehavior::default(),
            polls: 0,
            timestamps: CmdTimestamps::default(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct SimRun {
    kernel: String,
    packet: CommandPacket,
    state: CmdState,
    behavior: RunBehavior,
    polls: usize,
    timestamps: CmdTimestamps,
    shared: Arc<Shared>,
}

impl SimRun {
    fn finish(&mut self, state: CmdState) -> CmdState {
        self.state = state;
        self.packet.state = state;
        self.timestamps.completed = monotonic_ns();
        state
    }
}

impl RunHandle for SimRun {
    fn packet(&self) -> &CommandPacket {
        &self.packet
    }

    fn packet_mut(&mut self) -> &mut CommandPacket {
        &mut self.packet
    }

    fn start(&mut self) -> Result<()> {
        ensure!(
            !self.shared.fail_start.load(Ordering::SeqCst),
            DriverSnafu { reason: format!("cannot start command on {}", self.kernel) }
        );
        self.timestamps = CmdTimestamps { new: monotonic_ns(), ..Default::default() };
        self.behavior = *self.shared.behavior.read();
        self.polls = 0;
        self.state = CmdState::Running;
        self.packet.state = CmdState::Running;
        self.timestamps.running = monotonic_ns();

        self.shared.submissions.fetch_add(1, Ordering::SeqCst);
        *self.shared.per_kernel.lock().entry(self.kernel.clone()).or_default() += 1;
        *self.shared.last_packet.lock() = Some(self.packet.clone());
        Ok(())
    }

    fn wait(&mut self, interval: Duration) -> CmdState {
        if self.state != CmdState::Running {
            return self.state;
        }
        self.polls += 1;
        match self.behavior {
            RunBehavior::CompleteAfter(n) if self.polls >= n => self.finish(CmdState::Completed),
            RunBehavior::CompleteAfter(_) => self.state,
            RunBehavior::Hang => {
                std::thread::sleep(interval);
                self.state
            }
            RunBehavior::Finish(state) => self.finish(state),
        }
    }

    fn timestamps(&self) -> CmdTimestamps {
        self.timestamps
    }
}

// ============================================================================
// MEMORY
// ============================================================================

struct SimMemory {
    address: u64,
    device: Vec<u8>,
    host: Option<Vec<u8>>,
    shared: Arc<Shared>,
}

impl SimMemory {
    fn check(&self, offset: usize, size: usize) -> Result<()> {
        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= self.device.len()),
            DriverSnafu { reason: format!("access [{offset}, +{size}) beyond allocation of {}", self.device.len()) }
        );
        Ok(())
    }
}

impl DeviceMemory for SimMemory {
    fn size(&self) -> usize {
        self.device.len()
    }

    fn address(&self) -> u64 {
        self.address
    }

    fn host(&self) -> Option<&[u8]> {
        self.host.as_deref()
    }

    fn host_mut(&mut self) -> Option<&mut [u8]> {
        self.host.as_deref_mut()
    }

    fn sync(&mut self, direction: SyncDirection, size: usize, offset: usize) -> Result<()> {
        self.check(offset, size)?;
        self.shared.syncs.fetch_add(1, Ordering::SeqCst);
        let Some(host) = self.host.as_mut() else {
            return Ok(());
        };
        let range = offset..offset + size;
        match direction {
            SyncDirection::ToDevice => self.device[range.clone()].copy_from_slice(&host[range]),
            SyncDirection::FromDevice => host[range.clone()].copy_from_slice(&self.device[range]),
        }
        Ok(())
    }

    fn write(&mut self, src: &[u8], offset: usize) -> Result<()> {
        self.check(offset, src.len())?;
        self.device[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn read(&self, dst: &mut [u8], offset: usize) -> Result<()> {
        self.check(offset, dst.len())?;
        dst.copy_from_slice(&self.device[offset..offset + dst.len()]);
        Ok(())
    }
}

/// An image with the given IP cores, one unused HBM bank and one used DDR bank.
pub fn sample_image(ips: &[&str]) -> HardwareImage {
    HardwareImage::new(
        ImageUuid::new(*b"dpurt-sim-image!"),
        ips.iter().map(|ip| ip.to_string()).collect(),
        vec![
            MemoryBank::new("HBM[0]", false, 0x4000_0000, 1 << 28),
            MemoryBank::new("DDR[0]", true, 0x6000_0000, 1 << 30),
        ],
    )
}
