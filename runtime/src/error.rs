//! Error types for command dispatch.

use snafu::Snafu;

/// Result type for dispatch operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while dispatching commands to compute units.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Device layer error.
    #[snafu(display("Device error: {source}"))]
    Device { source: dpurt_device::Error },

    /// No compute unit instance is available for dispatch.
    #[snafu(display("Device busy: no cu available for cu_name {cu_name}"))]
    DeviceBusy { cu_name: String },

    /// No compute unit matches any of the controller names.
    #[snafu(display("No compute units found for {cu_name}"))]
    NoComputeUnits { cu_name: String },

    /// No controller variant is registered for the kernel.
    #[snafu(display("No controller registered for kernel '{kernel_name}'"))]
    UnknownKernel { kernel_name: String },

    /// Controllers are disabled by configuration.
    #[snafu(display("Controller creation disabled (DISABLE_DPU_CONTROLLER_XRT)"))]
    ControllerDisabled,
}

impl Error {
    /// Whether the error denotes a broken environment rather than a transient condition.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Device { source } => source.is_fatal(),
            Error::DeviceBusy { .. } => false,
            _ => true,
        }
    }
}

