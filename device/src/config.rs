//! Runtime configuration.
//!
//! Every knob of the device and dispatch layers lives in one typed
//! [`RuntimeConfig`], built either with its builder or from environment
//! variables, and validated once when the device registry is created.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bon::bon;
use itertools::Itertools;
use snafu::ensure;
use tracing::debug;

use crate::error::{InvalidConfigSnafu, Result};
use crate::simple_config::SimpleConfig;

pub const DEFAULT_FIRMWARE: &str = "/usr/lib/dpu.xclbin";
pub const DEFAULT_CONFIG_FILE: &str = "/etc/vart.conf";

const FINGERPRINT_SUFFIX: &str = ".fingerprint";

// ============================================================================
// DEVICE SELECTION
// ============================================================================

/// Which enumerated devices the registry binds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceSelection {
    /// Every enumerated device (`ALL`).
    #[default]
    All,
    /// Explicit device indices, in the given order.
    List(Vec<usize>),
}

impl DeviceSelection {
    /// Indices to bind given the number of enumerated devices.
    ///
    /// Indices past the device count are dropped, repeated ones bound once.
    pub fn resolve(&self, num_of_devices: usize) -> Vec<usize> {
        match self {
            Self::All => (0..num_of_devices).collect(),
            Self::List(indices) => indices.iter().copied().filter(|&idx| idx < num_of_devices).unique().collect(),
        }
    }
}

impl FromStr for DeviceSelection {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("ALL") {
            return Ok(Self::All);
        }
        s.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                item.parse::<usize>().map_err(|e| {
                    InvalidConfigSnafu { key: "XLNX_ENABLE_DEVICES", value: s, reason: e.to_string() }.build()
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Self::List)
    }
}

impl std::fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("ALL"),
            Self::List(indices) => {
                let items: Vec<String> = indices.iter().map(ToString::to_string).collect();
                f.write_str(&items.join(","))
            }
        }
    }
}

// ============================================================================
// DRAM BANK STRIPING
// ============================================================================

/// Address-space placement of large buffers across DRAM banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripingConfig {
    pub enabled: bool,
    pub bank_count: usize,
    /// Bytes addressed by one bank before the next bank takes over.
    pub bank_range: usize,
}

impl Default for StripingConfig {
    fn default() -> Self {
        Self { enabled: true, bank_count: 8, bank_range: 16384 }
    }
}

/// Physical size and base offset of a buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub physical_size: usize,
    pub offset: usize,
}

impl StripingConfig {
    /// Whether an allocation of `size` bytes gets striped (and consumes a slot).
    pub fn applies_to(&self, size: usize) -> bool {
        self.enabled && size > self.bank_range
    }

    /// Bytes added to every striped allocation.
    pub fn padding(&self) -> Option<usize> {
        self.bank_range.checked_mul(self.bank_count)
    }

    /// Placement of a `size`-byte buffer assigned the striping counter value `slot`.
    ///
    /// `None` when the padded size does not fit the address space.
    pub fn placement(&self, size: usize, slot: usize) -> Option<Placement> {
        if !self.applies_to(size) {
            return Some(Placement { physical_size: size, offset: 0 });
        }
        Some(Placement {
            physical_size: size.checked_add(self.padding()?)?,
            offset: (slot % self.bank_count) * self.bank_range,
        })
    }
}

// ============================================================================
// DEBUG VERBOSITY
// ============================================================================

/// Per-component verbosity of the costly diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugLevels {
    pub device_handle: u8,
    pub buffer_object: u8,
    pub cu: u8,
    pub controller: u8,
}

// ============================================================================
// RUNTIME CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Explicit hardware image path, overriding the config file and the default.
    pub firmware: Option<PathBuf>,
    /// Configuration file that may carry a `firmware` entry.
    pub config_file: PathBuf,
    /// Image path used when neither override nor config file provide one.
    pub default_firmware: PathBuf,
    pub enable_devices: DeviceSelection,
    /// Trust the image already resident on the devices instead of loading it.
    pub skip_image_load: bool,
    /// Overrides the kernel name used to pick a controller variant.
    pub dpu_type: Option<String>,
    /// Fingerprint overrides keyed by cu full name.
    pub fingerprints: HashMap<String, u64>,
    /// Declare every command complete without touching hardware.
    pub dry_run: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub debug: DebugLevels,
    pub striping: StripingConfig,
    pub disable_controller: bool,
    /// Directory holding the per-device advisory lock files.
    pub lock_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            firmware: None,
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            default_firmware: PathBuf::from(DEFAULT_FIRMWARE),
            enable_devices: DeviceSelection::All,
            skip_image_load: false,
            dpu_type: None,
            fingerprints: HashMap::new(),
            dry_run: false,
            timeout: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(1_000),
            debug: DebugLevels::default(),
            striping: StripingConfig::default(),
            disable_controller: false,
            lock_dir: std::env::temp_dir(),
        }
    }
}

#[bon]
impl RuntimeConfig {
    /// Create a runtime configuration with builder pattern.
    #[builder]
    pub fn builder(
        #[builder(into)] firmware: Option<PathBuf>,
        #[builder(into, default = PathBuf::from(DEFAULT_CONFIG_FILE))] config_file: PathBuf,
        #[builder(into, default = PathBuf::from(DEFAULT_FIRMWARE))] default_firmware: PathBuf,
        #[builder(default)] enable_devices: DeviceSelection,
        #[builder(default = false)] skip_image_load: bool,
        #[builder(into)] dpu_type: Option<String>,
        #[builder(default)] fingerprints: HashMap<String, u64>,
        #[builder(default = false)] dry_run: bool,
        #[builder(default = 10_000)] timeout_ms: u64,
        #[builder(default = 1_000)] poll_interval_ms: u64,
        #[builder(default)] debug: DebugLevels,
        #[builder(default)] striping: StripingConfig,
        #[builder(default = false)] disable_controller: bool,
        #[builder(into, default = std::env::temp_dir())] lock_dir: PathBuf,
    ) -> Self {
        Self {
            firmware,
            config_file,
            default_firmware,
            enable_devices,
            skip_image_load,
            dpu_type,
            fingerprints,
            dry_run,
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(poll_interval_ms),
            debug,
            striping,
            disable_controller,
            lock_dir,
        }
    }

    /// Create configuration from the process environment.
    ///
    /// # Environment Variables
    ///
    /// * `XLNX_VART_FIRMWARE` - Hardware image path override
    /// * `XLNX_ENABLE_DEVICES` - `ALL` (default) or comma-separated device indices
    /// * `XLNX_DISABLE_LOAD_XCLBIN` - Skip loading the image onto the devices
    /// * `XLNX_DPU_TYPE` - Kernel name override for controller selection
    /// * `<cu_full_name>.fingerprint` - Fingerprint override for one cu
    /// * `XLNX_XRT_CU_DRY_RUN` - Complete every command without hardware
    /// * `XLNX_DPU_TIMEOUT` - Per-command timeout in milliseconds (default: 10000)
    /// * `DEBUG_XRT_DEVICE_HANDLE`, `DEBUG_BUFFER_OBJECT`, `DEBUG_XRT_CU`, `DEBUG_DPU_CONTROLLER` - Verbosity
    /// * `DRAM_ADDRESS_MAPPING` - Enable bank striping (default: 1)
    /// * `DRAM_NUM_OF_BANK` - Number of DRAM banks (default: 8)
    /// * `DRAM_BANK_RANGE` - Bytes per bank (default: 16384)
    /// * `DISABLE_DPU_CONTROLLER_XRT` - Refuse to create controllers
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Create configuration from an explicit set of variables.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let defaults = Self::default();

        let fingerprints = vars
            .iter()
            .filter_map(|(key, value)| key.strip_suffix(FINGERPRINT_SUFFIX).map(|cu| (cu, key, value)))
            .map(|(cu, key, value)| -> Result<(String, u64)> { Ok((cu.to_string(), parse_value(key, value)?)) })
            .collect::<Result<HashMap<_, _>>>()?;

        let striping = StripingConfig {
            enabled: flag(&vars, "DRAM_ADDRESS_MAPPING", defaults.striping.enabled)?,
            bank_count: number(&vars, "DRAM_NUM_OF_BANK", defaults.striping.bank_count)?,
            bank_range: number(&vars, "DRAM_BANK_RANGE", defaults.striping.bank_range)?,
        };
        let debug = DebugLevels {
            device_handle: number(&vars, "DEBUG_XRT_DEVICE_HANDLE", 0)?,
            buffer_object: number(&vars, "DEBUG_BUFFER_OBJECT", 0)?,
            cu: number(&vars, "DEBUG_XRT_CU", 0)?,
            controller: number(&vars, "DEBUG_DPU_CONTROLLER", 0)?,
        };
        let enable_devices = match non_empty(&vars, "XLNX_ENABLE_DEVICES") {
            Some(value) => value.parse()?,
            None => DeviceSelection::All,
        };

        Ok(Self {
            firmware: non_empty(&vars, "XLNX_VART_FIRMWARE").map(PathBuf::from),
            enable_devices,
            skip_image_load: flag(&vars, "XLNX_DISABLE_LOAD_XCLBIN", false)?,
            dpu_type: non_empty(&vars, "XLNX_DPU_TYPE").map(str::to_string),
            fingerprints,
            dry_run: flag(&vars, "XLNX_XRT_CU_DRY_RUN", false)?,
            timeout: Duration::from_millis(number(&vars, "XLNX_DPU_TIMEOUT", 10_000)?),
            debug,
            striping,
            disable_controller: flag(&vars, "DISABLE_DPU_CONTROLLER_XRT", false)?,
            ..defaults
        })
    }

    /// Check invariants the rest of the layer relies on.
    pub fn validate(&self) -> Result<()> {
        if self.striping.enabled {
            ensure!(
                self.striping.bank_count > 0,
                InvalidConfigSnafu { key: "DRAM_NUM_OF_BANK", value: "0", reason: "must be positive" }
            );
            ensure!(
                self.striping.bank_range > 0,
                InvalidConfigSnafu { key: "DRAM_BANK_RANGE", value: "0", reason: "must be positive" }
            );
            ensure!(
                self.striping.padding().is_some(),
                InvalidConfigSnafu {
                    key: "DRAM_BANK_RANGE",
                    value: self.striping.bank_range.to_string(),
                    reason: format!("{} banks overflow the address space", self.striping.bank_count),
                }
            );
        }
        ensure!(
            !self.timeout.is_zero(),
            InvalidConfigSnafu { key: "XLNX_DPU_TIMEOUT", value: "0", reason: "must be positive" }
        );
        ensure!(
            !self.poll_interval.is_zero(),
            InvalidConfigSnafu { key: "poll_interval", value: "0", reason: "must be positive" }
        );
        Ok(())
    }

    /// Hardware image path: explicit override, then config file entry, then the default.
    pub fn resolve_firmware(&self) -> PathBuf {
        if let Some(firmware) = self.firmware.as_ref().filter(|path| !path.as_os_str().is_empty()) {
            return firmware.clone();
        }
        let Some(config) = SimpleConfig::load(&self.config_file) else {
            debug!(config_file = %self.config_file.display(), "config file not readable, using default firmware");
            return self.default_firmware.clone();
        };
        match config.get("firmware").filter(|value| !value.is_empty()) {
            Some(firmware) => PathBuf::from(firmware),
            None => {
                debug!(config_file = %self.config_file.display(), "no firmware entry, using default firmware");
                self.default_firmware.clone()
            }
        }
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key).map(|value| value.trim()).filter(|value| !value.is_empty())
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| InvalidConfigSnafu { key, value, reason: e.to_string() }.build())
}

fn number<T: FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    non_empty(vars, key).map_or(Ok(default), |value| parse_value(key, value))
}

fn flag(vars: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    let Some(value) = non_empty(vars, key) else {
        return Ok(default);
    };
    match value {
        "on" | "ON" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "off" | "OFF" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        _ => parse_value::<i64>(key, value).map(|v| v != 0),
    }
}
