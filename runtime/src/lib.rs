//! Compute-unit command dispatch for DPU accelerators.
//!
//! Builds on the device registry of `dpurt-device`:
//!
//! - [`ComputeUnitDispatcher`] submits command packets to the compute unit
//!   instances matching a name and waits for them with a timeout.
//! - [`CONTROLLERS`] maps kernel name prefixes to hardware-generation specific
//!   controllers built over a dispatcher.

pub mod controller;
pub mod cu;
pub mod error;


pub use controller::{CONTROLLERS, Controller, ControllerFactory, ControllerRegistry};
pub use cu::{ComputeUnitDispatcher, LatencyBreakdown};
pub use error::*;
