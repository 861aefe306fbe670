//! Hardware resource layer for DPU accelerators.
//!
//! Discovers and locks devices, makes the configured hardware image resident,
//! indexes the compute units it instantiates and allocates device memory for
//! them.
//!
//! # Driver
//!
//! The physical driver is reached through the traits in [`driver`]. Embedders
//! install a default driver once with [`driver::install`]; [`sim::SimDriver`]
//! is an in-process model used for host-only runs and tests.
//!
//! # Sharing
//!
//! [`DeviceRegistry::get_instance`] hands out one registry per process for as
//! long as someone holds it. Devices stay locked and buffers stay valid while
//! the registry lives.

pub mod buffer;
pub mod config;
pub mod driver;
pub mod error;
pub mod image;
pub mod lock;
pub mod packet;
pub mod registry;
pub mod sim;
pub mod simple_config;
pub mod singleton;

#[cfg(any(test, feature = "testing"))]
pub mod test;

pub use buffer::BufferObject;
pub use config::{DebugLevels, DeviceSelection, Placement, RuntimeConfig, StripingConfig};
pub use driver::{DeviceHandle, DeviceMemory, Driver, KernelHandle, RunHandle, SyncDirection};
pub use error::*;
pub use image::{HardwareImage, ImageUuid, MemoryBank};
pub use packet::{CmdState, CmdTimestamps, CommandPacket, PACKET_PAYLOAD_WORDS, PacketType};
pub use registry::{ComputeUnitInfo, DeviceRegistry};
