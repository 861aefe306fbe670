use std::fmt;
use std::sync::Arc;

use snafu::{OptionExt, ensure};
use tracing::{debug, error, trace};

use crate::config::Placement;
use crate::driver::{DeviceMemory, SyncDirection};
use crate::error::{AllocationSnafu, NullAddressSnafu, OutOfRangeSnafu, Result};
use crate::registry::DeviceRegistry;

/// A device memory buffer usable by compute units named `cu_name` on one device.
///
/// The logical window of `size` bytes starts `bank_offset` bytes into a possibly
/// larger physical allocation (see [`crate::config::StripingConfig`]). All host-side
/// offsets are relative to the logical window.
pub struct BufferObject {
    /// Keeps the devices locked and the image resident while the buffer lives.
    registry: Arc<DeviceRegistry>,
    memory: Box<dyn DeviceMemory>,
    size: usize,
    placement: Placement,
    device_id: usize,
    cu_name: String,
    phy: u64,
}

impl BufferObject {
    /// Allocate a zero-filled buffer on the shared registry.
    pub fn create(size: usize, device_id: usize, cu_name: &str) -> Result<Self> {
        Self::with_registry(DeviceRegistry::get_instance()?, size, device_id, cu_name)
    }

    /// Allocate a zero-filled buffer of `size` bytes on device `device_id`.
    pub fn with_registry(registry: Arc<DeviceRegistry>, size: usize, device_id: usize, cu_name: &str) -> Result<Self> {
        let device = registry.find_device(cu_name, device_id)?;

        let bank = registry.get_memory_bank_index();
        let striping = registry.config().striping;
        let slot = if striping.applies_to(size) { registry.next_stripe_slot() } else { 0 };
        let placement = striping.placement(size, slot).context(AllocationSnafu {
            size,
            bank,
            device_id,
            reason: "striped size overflows the address space",
        })
        .inspect_err(|e| error!(device_id, cu_name, size, error = %e, "buffer placement failed"))?;
        let mut memory = device
            .alloc(placement.physical_size, bank)
            .inspect_err(|e| error!(device_id, cu_name, size, bank, error = %e, "buffer allocation failed"))?;

        match memory.host_mut() {
            Some(host) => {
                host.fill(0);
                memory.sync(SyncDirection::ToDevice, placement.physical_size, 0)?;
            }
            None => memory.write(&vec![0; placement.physical_size], 0)?,
        }

        let phy = memory.address() + placement.offset as u64;
        if phy == 0 {
            error!(device_id, cu_name, "buffer physical address is null");
            return NullAddressSnafu { device_id, cu_name }.fail();
        }
        debug!(
            device_id,
            cu_name,
            size,
            physical_size = placement.physical_size,
            bank_offset = placement.offset,
            phy = format_args!("{phy:#x}"),
            host_mapped = memory.host().is_some(),
            "buffer object created"
        );

        Ok(Self { registry, memory, size, placement, device_id, cu_name: cu_name.to_string(), phy })
    }

    /// Host view of the logical window, `None` for device-only memory.
    pub fn data_r(&self) -> Option<&[u8]> {
        let range = self.window();
        self.memory.host().map(|host| &host[range])
    }

    /// Mutable host view of the logical window, `None` for device-only memory.
    pub fn data_w(&mut self) -> Option<&mut [u8]> {
        let range = self.window();
        self.memory.host_mut().map(|host| &mut host[range])
    }

    /// Logical size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn physical_size(&self) -> usize {
        self.placement.physical_size
    }

    pub fn bank_offset(&self) -> usize {
        self.placement.offset
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn cu_name(&self) -> &str {
        &self.cu_name
    }

    pub fn is_host_mapped(&self) -> bool {
        self.memory.host().is_some()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Physical device address of byte `offset` of the logical window.
    pub fn phy(&self, offset: usize) -> u64 {
        self.phy + offset as u64
    }

    /// Make device writes to `[offset, offset + size)` visible to the host.
    pub fn sync_for_read(&mut self, offset: usize, size: usize) -> Result<()> {
        self.sync(SyncDirection::FromDevice, offset, size)
    }

    /// Make host writes to `[offset, offset + size)` visible to the device.
    pub fn sync_for_write(&mut self, offset: usize, size: usize) -> Result<()> {
        self.sync(SyncDirection::ToDevice, offset, size)
    }

    /// Copy `buf` into the buffer at `offset` and make it visible to the device.
    pub fn copy_from_host(&mut self, buf: &[u8], offset: usize) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let start = self.placement.offset + offset;
        trace!(device_id = self.device_id, offset, size = buf.len(), "copy from host");
        match self.memory.host_mut() {
            Some(host) => {
                host[start..start + buf.len()].copy_from_slice(buf);
                self.memory.sync(SyncDirection::ToDevice, buf.len(), start)
            }
            None => self.memory.write(buf, start),
        }
    }

    /// Fill `buf` from the buffer at `offset`, reading the device's view.
    pub fn copy_to_host(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
        self.check_range(offset, buf.len())?;
        let start = self.placement.offset + offset;
        trace!(device_id = self.device_id, offset, size = buf.len(), "copy to host");
        if !self.is_host_mapped() {
            return self.memory.read(buf, start);
        }
        self.memory.sync(SyncDirection::FromDevice, buf.len(), start)?;
        if let Some(host) = self.memory.host() {
            buf.copy_from_slice(&host[start..start + buf.len()]);
        }
        Ok(())
    }

    fn sync(&mut self, direction: SyncDirection, offset: usize, size: usize) -> Result<()> {
        self.check_range(offset, size)?;
        if !self.is_host_mapped() {
            debug!(device_id = self.device_id, direction = <&str>::from(direction), "device-only memory, sync skipped");
            return Ok(());
        }
        self.memory.sync(direction, size, self.placement.offset + offset)
    }

    fn window(&self) -> std::ops::Range<usize> {
        self.placement.offset..self.placement.offset + self.size
    }

    fn check_range(&self, offset: usize, size: usize) -> Result<()> {
        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= self.size),
            OutOfRangeSnafu { offset, size, buffer_size: self.size }
        );
        Ok(())
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("device_id", &self.device_id)
            .field("cu_name", &self.cu_name)
            .field("size", &self.size)
            .field("physical_size", &self.placement.physical_size)
            .field("bank_offset", &self.placement.offset)
            .field("phy", &format_args!("{:#x}", self.phy))
            .finish()
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        if self.registry.config().debug.buffer_object > 0 {
            debug!(device_id = self.device_id, phy = format_args!("{:#x}", self.phy), "buffer object released");
        }
    }
}
