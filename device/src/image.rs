//! Hardware image description.
//!
//! A hardware image is the configuration bitstream loaded onto a device. This layer
//! only needs three things out of it: its uuid, the names of the IP cores it
//! instantiates and the memory topology used to pick an allocation bank.

use std::fmt;

/// 16-byte identifier of a hardware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageUuid(pub [u8; 16]);

impl ImageUuid {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ImageUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One entry of the image memory topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBank {
    pub tag: String,
    pub used: bool,
    pub base_address: u64,
    pub size: u64,
}

impl MemoryBank {
    pub fn new(tag: impl Into<String>, used: bool, base_address: u64, size: u64) -> Self {
        Self { tag: tag.into(), used, base_address, size }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareImage {
    uuid: ImageUuid,
    ips: Vec<String>,
    banks: Vec<MemoryBank>,
}

impl HardwareImage {
    pub fn new(uuid: ImageUuid, ips: Vec<String>, banks: Vec<MemoryBank>) -> Self {
        Self { uuid, ips, banks }
    }

    pub fn uuid(&self) -> ImageUuid {
        self.uuid
    }

    /// Full names (`kernel:instance`) of every IP core in the image.
    pub fn ips(&self) -> &[String] {
        &self.ips
    }

    pub fn banks(&self) -> &[MemoryBank] {
        &self.banks
    }

    /// Index of the first bank marked as used.
    pub fn first_used_bank(&self) -> Option<u32> {
        self.banks.iter().position(|bank| bank.used).map(|idx| idx as u32)
    }
}
