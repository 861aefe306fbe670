//! Controller factory registry.
//!
//! Each hardware generation ships its own controller on top of a
//! [`ComputeUnitDispatcher`]. Variants register a factory under a kernel name
//! prefix; [`ControllerRegistry::create`] picks the variant matching the kernel
//! found on the device (or the one forced with `XLNX_DPU_TYPE`).

use std::fmt;
use std::sync::Arc;

use dpurt_device::DeviceRegistry;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use snafu::ResultExt;
use tracing::{debug, error, info, warn};

use crate::cu::ComputeUnitDispatcher;
use crate::error::{ControllerDisabledSnafu, DeviceSnafu, NoComputeUnitsSnafu, Result, UnknownKernelSnafu};

/// Cu names tried in order when looking for controller compute units.
const CONTROLLER_CU_NAMES: [&str; 2] = ["DPU", "dpu"];

/// A hardware-generation specific front end over a dispatcher.
pub trait Controller: Send + Sync {
    /// Kernel name the controller was created for.
    fn kernel_name(&self) -> &str;

    fn dispatcher(&self) -> &ComputeUnitDispatcher;
}

/// Factory that creates a controller from the dispatcher over the controller cus.
pub type ControllerFactory = Arc<dyn Fn(ComputeUnitDispatcher) -> Result<Arc<dyn Controller>> + Send + Sync>;

/// Registry of controller variants keyed by kernel name prefix.
///
/// Registration order matters: the first prefix matching the kernel name wins.
pub struct ControllerRegistry {
    factories: RwLock<Vec<(String, ControllerFactory)>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self { factories: RwLock::new(Vec::new()) }
    }

    /// Register a controller factory for kernels whose name starts with `kernel_prefix`.
    ///
    /// Registering the same prefix again replaces the previous factory in place.
    pub fn register_factory(&self, kernel_prefix: &str, factory: ControllerFactory) {
        let mut factories = self.factories.write();
        match factories.iter_mut().find(|(prefix, _)| prefix == kernel_prefix) {
            Some((_, existing)) => *existing = factory,
            None => factories.push((kernel_prefix.to_string(), factory)),
        }
        debug!(kernel_prefix, "controller factory registered");
    }

    /// Registered prefixes, in matching order.
    pub fn prefixes(&self) -> Vec<String> {
        self.factories.read().iter().map(|(prefix, _)| prefix.clone()).collect()
    }

    /// Create a controller over the shared device registry.
    pub fn create_default(&self) -> Result<Arc<dyn Controller>> {
        self.create(DeviceRegistry::get_instance().context(DeviceSnafu)?)
    }

    /// Create the controller variant matching the kernel present in `registry`.
    pub fn create(&self, registry: Arc<DeviceRegistry>) -> Result<Arc<dyn Controller>> {
        let config = registry.config();
        if config.disable_controller {
            error!("controller creation disabled");
            return ControllerDisabledSnafu.fail();
        }
        let dpu_type = config.dpu_type.clone();
        let verbose = config.debug.controller > 0;

        let mut dispatcher = None;
        for cu_name in CONTROLLER_CU_NAMES {
            let candidate = ComputeUnitDispatcher::with_registry(Arc::clone(&registry), cu_name)?;
            if candidate.get_num_of_cu() > 0 {
                dispatcher = Some(candidate);
                break;
            }
        }
        let Some(dispatcher) = dispatcher else {
            error!(cu_names = ?CONTROLLER_CU_NAMES, "no controller compute units");
            return NoComputeUnitsSnafu { cu_name: CONTROLLER_CU_NAMES.join("|") }.fail();
        };

        let kernel_name = match dpu_type {
            Some(dpu_type) => {
                warn!(%dpu_type, "kernel name overridden by XLNX_DPU_TYPE");
                dpu_type
            }
            None => dispatcher.get_kernel_name(0)?.to_string(),
        };

        let factory = self
            .factories
            .read()
            .iter()
            .find(|(prefix, _)| kernel_name.starts_with(prefix.as_str()))
            .map(|(prefix, factory)| (prefix.clone(), Arc::clone(factory)));
        let Some((prefix, factory)) = factory else {
            error!(%kernel_name, registered = ?self.prefixes(), "no controller registered");
            return UnknownKernelSnafu { kernel_name }.fail();
        };

        if verbose {
            info!(%kernel_name, %prefix, cus = dispatcher.get_num_of_cu(), "creating controller");
        }
        factory(dispatcher)
    }
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRegistry").field("prefixes", &self.prefixes()).finish()
    }
}

/// Global controller registry.
///
/// Hardware-generation crates register their factories here at startup:
///
/// ```ignore
/// dpurt_runtime::CONTROLLERS.register_factory("DPUCZDX8G", Arc::new(|dispatcher| {
///     Ok(Arc::new(MyController::new(dispatcher)?) as Arc<dyn Controller>)
/// }));
/// let controller = dpurt_runtime::CONTROLLERS.create_default()?;
/// ```
pub static CONTROLLERS: Lazy<ControllerRegistry> = Lazy::new(ControllerRegistry::new);
