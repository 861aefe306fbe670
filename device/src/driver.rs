//! Driver seam.
//!
//! The physical device driver is an external collaborator. Everything this layer
//! needs from it is expressed by the traits below; [`crate::sim`] provides an
//! in-process implementation used for host-only runs and tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{NoDriverSnafu, Result};
use crate::image::{HardwareImage, ImageUuid};
use crate::packet::{CmdState, CmdTimestamps, CommandPacket};

/// Direction of a cache synchronization between host and device views of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum SyncDirection {
    ToDevice,
    FromDevice,
}

pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Number of devices present on the host.
    fn enumerate_devices(&self) -> usize;

    /// Open and parse a hardware image file.
    fn open_image(&self, path: &Path) -> Result<HardwareImage>;

    fn open_device(&self, index: usize) -> Result<Arc<dyn DeviceHandle>>;
}

pub trait DeviceHandle: Send + Sync {
    /// Enumeration index of the device.
    fn index(&self) -> usize;

    /// Load an image and return the uuid the device reports for it.
    fn load_image(&self, image: &HardwareImage) -> Result<ImageUuid>;

    /// Uuid of the resident image, if any.
    fn image_uuid(&self) -> Option<ImageUuid>;

    /// Open a compute unit by `"kernel:{instance}"` name on the image `uuid`.
    fn open_kernel(&self, uuid: ImageUuid, name: &str) -> Result<Arc<dyn KernelHandle>>;

    fn alloc(&self, size: usize, bank: u32) -> Result<Box<dyn DeviceMemory>>;
}

pub trait KernelHandle: Send + Sync {
    fn name(&self) -> &str;

    fn read_register(&self, offset: u32) -> u32;

    fn write_register(&self, offset: u32, value: u32);

    /// Create an execution context owning one command packet slot.
    fn create_run(&self) -> Result<Box<dyn RunHandle>>;
}

/// One in-flight execution context of a compute unit.
pub trait RunHandle: Send {
    fn packet(&self) -> &CommandPacket;

    fn packet_mut(&mut self) -> &mut CommandPacket;

    /// Submit the current packet.
    fn start(&mut self) -> Result<()>;

    /// Block up to `interval` and report the command state.
    fn wait(&mut self, interval: Duration) -> CmdState;

    fn timestamps(&self) -> CmdTimestamps;
}

/// A device memory allocation.
pub trait DeviceMemory: Send + Sync {
    fn size(&self) -> usize;

    /// Physical base address.
    fn address(&self) -> u64;

    /// Host view of the allocation; `None` for device-only memory.
    fn host(&self) -> Option<&[u8]>;

    fn host_mut(&mut self) -> Option<&mut [u8]>;

    /// Synchronize `[offset, offset + size)` between the host view and the device.
    fn sync(&mut self, direction: SyncDirection, size: usize, offset: usize) -> Result<()>;

    /// Write `src` directly to device memory at `offset`.
    fn write(&mut self, src: &[u8], offset: usize) -> Result<()>;

    /// Read device memory at `offset` into `dst`.
    fn read(&self, dst: &mut [u8], offset: usize) -> Result<()>;
}

/// Factory producing the process-wide default driver.
pub type DriverFactory = Arc<dyn Fn() -> Result<Arc<dyn Driver>> + Send + Sync>;

static DEFAULT_DRIVER: Lazy<RwLock<Option<(String, DriverFactory)>>> = Lazy::new(|| RwLock::new(None));

/// Install the default driver factory, replacing any previous one.
pub fn install(name: &str, factory: DriverFactory) {
    let previous = DEFAULT_DRIVER.write().replace((name.to_string(), factory));
    debug!(driver = name, replaced = ?previous.map(|(name, _)| name), "default driver installed");
}

/// Instantiate the default driver.
pub fn default_driver() -> Result<Arc<dyn Driver>> {
    let factory = DEFAULT_DRIVER.read().as_ref().map(|(_, factory)| Arc::clone(factory));
    match factory {
        Some(factory) => factory(),
        None => NoDriverSnafu.fail(),
    }
}

/// Name of the installed default driver.
pub fn default_driver_name() -> Option<String> {
    DEFAULT_DRIVER.read().as_ref().map(|(name, _)| name.clone())
}
