//! Device registry.
//!
//! The registry discovers devices, locks them for the lifetime of the process,
//! makes sure the configured hardware image is resident, and indexes every
//! compute unit instance of interest. One registry is shared process-wide
//! through [`DeviceRegistry::get_instance`]; it is torn down (locks released)
//! when the last handle drops.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use snafu::{OptionExt, ensure};
use tracing::{debug, error, info, trace, warn};

use crate::config::RuntimeConfig;
use crate::driver::{self, DeviceHandle, Driver, KernelHandle};
use crate::error::{
    CuNotFoundSnafu, DeviceNotFoundSnafu, ImageNotResidentSnafu, NoComputeUnitsSnafu, NoDeviceSelectedSnafu,
    NoDevicesSnafu, NoValidBankSnafu, Result, UuidMismatchSnafu,
};
use crate::image::{HardwareImage, ImageUuid};
use crate::lock::DeviceLock;
use crate::singleton::WeakSingleton;

/// Substrings identifying the IP cores this layer drives.
const CU_FILTERS: [&str; 3] = ["DPU", "dpu", "sfm"];

/// Register offsets of the low and high words of a cu fingerprint.
pub const FINGERPRINT_LO: u32 = 0x1F0;
pub const FINGERPRINT_HI: u32 = 0x1F4;

static INSTANCE: WeakSingleton<DeviceRegistry> = WeakSingleton::new();

/// One compute unit instance bound to a device.
#[derive(Clone)]
pub struct ComputeUnitInfo {
    device_id: usize,
    uuid: ImageUuid,
    full_name: String,
    kernel_name: String,
    instance_name: String,
    fingerprint: u64,
    device: Arc<dyn DeviceHandle>,
    kernel: Arc<dyn KernelHandle>,
}

impl ComputeUnitInfo {
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn uuid(&self) -> ImageUuid {
        self.uuid
    }

    /// `kernel:instance`.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn device(&self) -> &Arc<dyn DeviceHandle> {
        &self.device
    }

    pub fn kernel(&self) -> &Arc<dyn KernelHandle> {
        &self.kernel
    }
}

impl fmt::Debug for ComputeUnitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeUnitInfo")
            .field("device_id", &self.device_id)
            .field("full_name", &self.full_name)
            .field("fingerprint", &format_args!("{:#018x}", self.fingerprint))
            .finish_non_exhaustive()
    }
}

/// A locked device with the image uuid it reports.
struct BoundDevice {
    handle: Arc<dyn DeviceHandle>,
    uuid: ImageUuid,
    // Released when the registry drops.
    _lock: DeviceLock,
}

pub struct DeviceRegistry {
    driver: Arc<dyn Driver>,
    config: RuntimeConfig,
    image: HardwareImage,
    devices: Vec<BoundDevice>,
    /// Keyed by `"{full_name}:{device_id}"`; ordered so prefix filters are stable.
    cus: BTreeMap<String, ComputeUnitInfo>,
    bank: u32,
    stripe_slot: AtomicUsize,
}

impl DeviceRegistry {
    /// Shared process-wide registry, created on first use from the default driver and
    /// [`RuntimeConfig::from_env`].
    pub fn get_instance() -> Result<Arc<Self>> {
        INSTANCE.get_or_try_init(|| {
            let driver = driver::default_driver()?;
            let config = RuntimeConfig::from_env()?;
            Self::new(driver, config)
        })
    }

    /// Build a registry over `driver`: lock the selected devices, make the image
    /// resident and discover compute units.
    #[tracing::instrument(skip_all, fields(driver = driver.name()))]
    pub fn new(driver: Arc<dyn Driver>, config: RuntimeConfig) -> Result<Self> {
        config.validate().inspect_err(|e| error!(error = %e, "invalid runtime configuration"))?;

        let firmware = config.resolve_firmware();
        let image = driver.open_image(&firmware).inspect_err(|e| error!(error = %e, "cannot open hardware image"))?;
        debug!(firmware = %firmware.display(), uuid = %image.uuid(), ips = image.ips().len(), "hardware image opened");

        let available = driver.enumerate_devices();
        ensure!(available > 0, NoDevicesSnafu);
        let selected = config.enable_devices.resolve(available);
        if selected.is_empty() {
            error!(enable_devices = %config.enable_devices, available, "no device selected");
            return NoDeviceSelectedSnafu { enable_list: config.enable_devices.to_string(), available }.fail();
        }

        let devices = selected
            .iter()
            .map(|&index| Self::bind_device(driver.as_ref(), &config, &image, index))
            .collect::<Result<Vec<_>>>()?;

        let bank = image.first_used_bank().context(NoValidBankSnafu)?;
        debug!(bank, tag = %image.banks()[bank as usize].tag, "memory bank selected");

        if image.ips().is_empty() {
            error!(uuid = %image.uuid(), "hardware image has no ip cores");
            return NoComputeUnitsSnafu.fail();
        }
        let mut cus = BTreeMap::new();
        for (device_id, device) in selected.iter().copied().zip(&devices) {
            for full_name in image.ips().iter().filter(|ip| CU_FILTERS.iter().any(|f| ip.contains(f))) {
                let info = Self::bind_cu(&config, device_id, device, full_name)?;
                cus.insert(format!("{full_name}:{device_id}"), info);
            }
        }
        if cus.is_empty() {
            error!(ips = ?image.ips(), "no compute units found in hardware image");
            return NoComputeUnitsSnafu.fail();
        }
        info!(devices = devices.len(), cus = cus.len(), "device registry ready");

        Ok(Self { driver, config, image, devices, cus, bank, stripe_slot: AtomicUsize::new(0) })
    }

    fn bind_device(
        driver: &dyn Driver,
        config: &RuntimeConfig,
        image: &HardwareImage,
        index: usize,
    ) -> Result<BoundDevice> {
        let lock = DeviceLock::acquire(&config.lock_dir, index)?;
        let handle = driver.open_device(index)?;

        if config.skip_image_load {
            debug!(device_id = index, "image load disabled, trusting resident image");
        } else {
            let loaded = handle.load_image(image)?;
            if loaded != image.uuid() {
                error!(device_id = index, %loaded, expected = %image.uuid(), "uuid mismatch after image load");
                return UuidMismatchSnafu { device_id: index, loaded, expected: image.uuid() }.fail();
            }
        }
        let uuid = handle.image_uuid().context(ImageNotResidentSnafu { device_id: index })?;
        if config.skip_image_load && uuid != image.uuid() {
            warn!(device_id = index, resident = %uuid, configured = %image.uuid(), "resident image differs from configured one");
        }
        if config.debug.device_handle > 0 {
            info!(device_id = index, %uuid, lock = %lock.path().display(), "device bound");
        }

        Ok(BoundDevice { handle, uuid, _lock: lock })
    }

    fn bind_cu(
        config: &RuntimeConfig,
        device_id: usize,
        device: &BoundDevice,
        full_name: &str,
    ) -> Result<ComputeUnitInfo> {
        let (kernel_name, instance_name) = full_name.split_once(':').unwrap_or((full_name, ""));
        let kernel = device.handle.open_kernel(device.uuid, &format!("{kernel_name}:{{{instance_name}}}"))?;

        let fingerprint = match config.fingerprints.get(full_name) {
            Some(&fingerprint) => fingerprint,
            None => {
                let lo = kernel.read_register(FINGERPRINT_LO) as u64;
                let hi = kernel.read_register(FINGERPRINT_HI) as u64;
                (hi << 32) | lo
            }
        };
        if config.debug.device_handle > 0 {
            info!(
                device_id,
                full_name,
                kernel_name,
                instance_name,
                fingerprint = format_args!("{fingerprint:#018x}"),
                "compute unit discovered"
            );
        } else {
            trace!(device_id, full_name, "compute unit discovered");
        }

        Ok(ComputeUnitInfo {
            device_id,
            uuid: device.uuid,
            full_name: full_name.to_string(),
            kernel_name: kernel_name.to_string(),
            instance_name: instance_name.to_string(),
            fingerprint,
            device: Arc::clone(&device.handle),
            kernel,
        })
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Compute unit instances whose key starts with `cu_name`, in key order.
    pub fn cus<'a>(&'a self, cu_name: &str) -> impl Iterator<Item = &'a ComputeUnitInfo> {
        self.cus.iter().filter(move |(key, _)| key.starts_with(cu_name)).map(|(_, info)| info)
    }

    /// The `cu_index`-th instance among those matching `cu_name`.
    pub fn cu(&self, cu_name: &str, cu_index: usize) -> Result<&ComputeUnitInfo> {
        self.cus(cu_name).nth(cu_index).with_context(|| {
            error!(cu_name, cu_index, "cannot find cu handle");
            CuNotFoundSnafu { cu_name, cu_index }
        })
    }

    pub fn get_num_of_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn get_num_of_all_cus(&self) -> usize {
        self.cus.len()
    }

    pub fn get_num_of_cus(&self, cu_name: &str) -> usize {
        self.cus(cu_name).count()
    }

    pub fn get_device_id(&self, cu_name: &str, cu_index: usize) -> Result<usize> {
        self.cu(cu_name, cu_index).map(ComputeUnitInfo::device_id)
    }

    pub fn get_device_uuid(&self, cu_name: &str, cu_index: usize) -> Result<ImageUuid> {
        self.cu(cu_name, cu_index).map(ComputeUnitInfo::uuid)
    }

    pub fn get_cu_full_name(&self, cu_name: &str, cu_index: usize) -> Result<&str> {
        self.cu(cu_name, cu_index).map(ComputeUnitInfo::full_name)
    }

    pub fn get_cu_kernel_name(&self, cu_name: &str, cu_index: usize) -> Result<&str> {
        self.cu(cu_name, cu_index).map(ComputeUnitInfo::kernel_name)
    }

    pub fn get_cu_instance_name(&self, cu_name: &str, cu_index: usize) -> Result<&str> {
        self.cu(cu_name, cu_index).map(ComputeUnitInfo::instance_name)
    }

    pub fn get_cu_fingerprint(&self, cu_name: &str, cu_index: usize) -> Result<u64> {
        self.cu(cu_name, cu_index).map(ComputeUnitInfo::fingerprint)
    }

    pub fn get_device_handle(&self, cu_name: &str, cu_index: usize) -> Result<Arc<dyn DeviceHandle>> {
        self.cu(cu_name, cu_index).map(|cu| Arc::clone(&cu.device))
    }

    pub fn get_kernel_handle(&self, cu_name: &str, cu_index: usize) -> Result<Arc<dyn KernelHandle>> {
        self.cu(cu_name, cu_index).map(|cu| Arc::clone(&cu.kernel))
    }

    /// Device handle of `device_id`, provided it hosts a cu matching `cu_name`.
    pub fn find_device(&self, cu_name: &str, device_id: usize) -> Result<Arc<dyn DeviceHandle>> {
        self.cus(cu_name)
            .find(|cu| cu.device_id == device_id)
            .map(|cu| Arc::clone(&cu.device))
            .with_context(|| {
                error!(device_id, cu_name, "cannot find device handle");
                DeviceNotFoundSnafu { device_id, cu_name }
            })
    }

    /// Index of the memory bank every buffer is allocated in.
    pub fn get_memory_bank_index(&self) -> u32 {
        self.bank
    }

    pub fn read_register(&self, cu_name: &str, cu_index: usize, offset: u32) -> Result<u32> {
        Ok(self.cu(cu_name, cu_index)?.kernel.read_register(offset))
    }

    pub fn write_register(&self, cu_name: &str, cu_index: usize, offset: u32, value: u32) -> Result<()> {
        self.cu(cu_name, cu_index)?.kernel.write_register(offset, value);
        Ok(())
    }

    /// Take the next DRAM bank striping slot.
    pub fn next_stripe_slot(&self) -> usize {
        self.stripe_slot.fetch_add(1, Ordering::Relaxed)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn image(&self) -> &HardwareImage {
        &self.image
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("driver", &self.driver.name())
            .field("image", &self.image.uuid())
            .field("devices", &self.devices.len())
            .field("cus", &self.cus.keys().collect::<Vec<_>>())
            .field("bank", &self.bank)
            .finish()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        debug!(devices = self.devices.len(), "device registry released");
    }
}
