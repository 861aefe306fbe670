use std::path::PathBuf;

use snafu::Snafu;

use crate::image::ImageUuid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the device layer.
///
/// Most variants describe a broken environment (missing hardware, a bad image,
/// a failed allocation). They are reported through [`Error::is_fatal`] and callers
/// are expected to abort the current process or session on them. Only
/// [`Error::OutOfRange`] is meant to be handled.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// No driver has been installed for the process-wide registry.
    #[snafu(display("no device driver installed"))]
    NoDriver,

    #[snafu(display("no devices can be used"))]
    NoDevices,

    /// The enable list filtered out every enumerated device.
    #[snafu(display("no device selected: enable list {enable_list:?} with {available} device(s) present"))]
    NoDeviceSelected { enable_list: String, available: usize },

    #[snafu(display("cannot open hardware image {}: {reason}", path.display()))]
    ImageOpen { path: PathBuf, reason: String },

    /// The device reports a different image than the one that was loaded.
    #[snafu(display("uuid loaded on device {device_id} ({loaded}) mismatches image uuid ({expected})"))]
    UuidMismatch { device_id: usize, loaded: ImageUuid, expected: ImageUuid },

    #[snafu(display("no hardware image resident on device {device_id}"))]
    ImageNotResident { device_id: usize },

    #[snafu(display("cannot find any valid memory bank in the hardware image"))]
    NoValidBank,

    #[snafu(display("no compute units can be used"))]
    NoComputeUnits,

    #[snafu(display("cannot find cu handle with cu_name {cu_name} and cu_index {cu_index}"))]
    CuNotFound { cu_name: String, cu_index: usize },

    #[snafu(display("cannot find device handle for device id {device_id} and cu_name {cu_name}"))]
    DeviceNotFound { device_id: usize, cu_name: String },

    #[snafu(display("allocation of {size} bytes in bank {bank} on device {device_id} failed: {reason}"))]
    Allocation { size: usize, bank: u32, device_id: usize, reason: String },

    #[snafu(display("buffer on device {device_id} for cu {cu_name} has a null physical address"))]
    NullAddress { device_id: usize, cu_name: String },

    #[snafu(display("cannot lock {name}: {source}"))]
    Lock { name: String, source: std::io::Error },

    #[snafu(display("invalid configuration {key}={value:?}: {reason}"))]
    InvalidConfig { key: String, value: String, reason: String },

    #[snafu(display("driver error: {reason}"))]
    Driver { reason: String },

    /// Access past the logical end of a buffer.
    #[snafu(display("out of range: offset {offset} + size {size} exceeds buffer size {buffer_size}"))]
    OutOfRange { offset: usize, size: usize, buffer_size: usize },

    #[snafu(display("payload of {words} words exceeds packet capacity {capacity}"))]
    PayloadOverflow { words: usize, capacity: usize },
}

impl Error {
    /// Whether the error denotes a broken environment rather than a caller mistake.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::OutOfRange { .. } | Error::PayloadOverflow { .. })
    }
}
