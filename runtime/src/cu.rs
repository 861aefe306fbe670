//! Compute-unit command dispatch.
//!
//! A [`ComputeUnitDispatcher`] owns one execution context per compute unit
//! instance matching a name prefix, and runs commands on them synchronously:
//! fill the packet, submit it, poll until the hardware reports a terminal state
//! or the timeout elapses.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use dpurt_device::error::CuNotFoundSnafu;
use dpurt_device::packet::monotonic_ns;
use dpurt_device::{CmdState, CmdTimestamps, CommandPacket, ComputeUnitInfo, DeviceRegistry, RunHandle};
use parking_lot::Mutex;
use snafu::{ResultExt, ensure};
use tracing::{debug, error, trace, warn};

use crate::error::{DeviceBusySnafu, DeviceSnafu, Result};

/// Per-phase latency of one command, in microseconds.
///
/// Phases that were never reached are reported as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyBreakdown {
    /// Submission to observed completion.
    pub total: u64,
    /// Submission until the driver accepted the command.
    pub to_driver: u64,
    /// Driver acceptance until the cu started running it.
    pub to_cu: u64,
    /// Time the cu spent running.
    pub complete: u64,
    /// Cu completion until the host observed it.
    pub done: u64,
}

impl LatencyBreakdown {
    pub fn new(submitted_ns: u64, stamps: CmdTimestamps, observed_ns: u64) -> Self {
        fn span_us(from: u64, to: u64) -> u64 {
            if from == 0 || to == 0 { 0 } else { to.saturating_sub(from) / 1000 }
        }
        Self {
            total: span_us(submitted_ns, observed_ns),
            to_driver: span_us(submitted_ns, stamps.new),
            to_cu: span_us(stamps.new, stamps.running),
            complete: span_us(stamps.running, stamps.completed),
            done: span_us(stamps.completed, observed_ns),
        }
    }
}

impl fmt::Display for LatencyBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {}us, ToDriver: {}us, ToCU: {}us, Complete: {}us, Done: {}us",
            self.total, self.to_driver, self.to_cu, self.complete, self.done
        )
    }
}

/// One compute unit instance and its execution context.
struct Instance {
    cu: ComputeUnitInfo,
    run: Mutex<Box<dyn RunHandle>>,
}

pub struct ComputeUnitDispatcher {
    registry: Arc<DeviceRegistry>,
    cu_name: String,
    instances: Vec<Instance>,
}

impl ComputeUnitDispatcher {
    /// Dispatcher over every instance matching `cu_name` in the shared registry.
    pub fn new(cu_name: &str) -> Result<Self> {
        let registry = DeviceRegistry::get_instance().context(DeviceSnafu)?;
        Self::with_registry(registry, cu_name)
    }

    /// Dispatcher over every instance matching `cu_name` in `registry`. May own no instance.
    pub fn with_registry(registry: Arc<DeviceRegistry>, cu_name: &str) -> Result<Self> {
        let instances = registry
            .cus(cu_name)
            .map(|cu| -> Result<Instance> {
                let run = cu.kernel().create_run().context(DeviceSnafu)?;
                debug!(
                    cu_name,
                    device_id = cu.device_id(),
                    full_name = cu.full_name(),
                    fingerprint = format_args!("{:#018x}", cu.fingerprint()),
                    "cu execution context created"
                );
                Ok(Instance { cu: cu.clone(), run: Mutex::new(run) })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(cu_name, instances = instances.len(), "dispatcher ready");
        Ok(Self { registry, cu_name: cu_name.to_string(), instances })
    }

    /// Run one command on instance `core_index mod n`.
    ///
    /// `populate` fills the freshly reset packet. Exactly one of `on_success` and
    /// `on_failure` is invoked once the command reached a terminal state or timed
    /// out, unless no instance is available at all ([`crate::Error::DeviceBusy`]).
    /// Terminal states other than `Completed` count as done.
    ///
    /// Calls on distinct instances run concurrently; calls on the same instance
    /// serialize.
    #[tracing::instrument(skip_all, fields(cu_name = %self.cu_name, core_index = core_index))]
    pub fn run<P, S, F>(&self, core_index: usize, populate: P, on_success: S, on_failure: F) -> Result<CmdState>
    where
        P: FnOnce(&mut CommandPacket),
        S: FnOnce(),
        F: FnOnce(),
    {
        ensure!(!self.instances.is_empty(), DeviceBusySnafu { cu_name: self.cu_name.as_str() });
        let index = core_index % self.instances.len();
        let instance = &self.instances[index];
        let config = self.registry.config();
        let full_name = instance.cu.full_name();

        let mut run = instance.run.lock();
        let packet = run.packet_mut();
        packet.reset();
        populate(packet);
        if config.debug.cu >= 2 {
            debug!(full_name, count = packet.count(), "packet:\n{}", packet.hexdump());
        }

        if config.dry_run {
            drop(run);
            debug!(full_name, "dry run, command not submitted");
            on_success();
            return Ok(CmdState::Completed);
        }

        let submitted_ns = monotonic_ns();
        if let Err(e) = run.start() {
            drop(run);
            error!(full_name, core_index, error = %e, "cannot start command");
            on_failure();
            return Err(e).context(DeviceSnafu);
        }

        let started = Instant::now();
        let state = loop {
            let state = run.wait(config.poll_interval);
            if config.debug.cu >= 2 {
                trace!(full_name, state = state.as_str(), elapsed_ms = started.elapsed().as_millis(), "poll");
            }
            if state.is_done() || started.elapsed() > config.timeout {
                break state;
            }
        };
        let breakdown = LatencyBreakdown::new(submitted_ns, run.timestamps(), monotonic_ns());
        drop(run);

        if !state.is_done() {
            warn!(
                full_name,
                core_index,
                timeout_ms = config.timeout.as_millis(),
                state = state.as_str(),
                waited_ms = started.elapsed().as_millis(),
                %breakdown,
                "cu timeout"
            );
            on_failure();
            return Ok(state);
        }

        if state != CmdState::Completed {
            warn!(full_name, core_index, state = state.as_str(), "command finished abnormally");
        }
        if config.debug.cu >= 1 {
            debug!(full_name, core_index, %breakdown, "command done");
        }
        on_success();
        Ok(state)
    }

    fn instance(&self, cu_index: usize) -> Result<&Instance> {
        self.instances
            .get(cu_index)
            .ok_or_else(|| CuNotFoundSnafu { cu_name: self.cu_name.as_str(), cu_index }.build())
            .context(DeviceSnafu)
    }

    pub fn cu_name(&self) -> &str {
        &self.cu_name
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn get_num_of_cu(&self) -> usize {
        self.instances.len()
    }

    pub fn get_device_id(&self, cu_index: usize) -> Result<usize> {
        Ok(self.instance(cu_index)?.cu.device_id())
    }

    pub fn get_full_name(&self, cu_index: usize) -> Result<&str> {
        Ok(self.instance(cu_index)?.cu.full_name())
    }

    pub fn get_kernel_name(&self, cu_index: usize) -> Result<&str> {
        Ok(self.instance(cu_index)?.cu.kernel_name())
    }

    pub fn get_instance_name(&self, cu_index: usize) -> Result<&str> {
        Ok(self.instance(cu_index)?.cu.instance_name())
    }

    pub fn get_fingerprint(&self, cu_index: usize) -> Result<u64> {
        Ok(self.instance(cu_index)?.cu.fingerprint())
    }

    pub fn read_register(&self, cu_index: usize, offset: u32) -> Result<u32> {
        Ok(self.instance(cu_index)?.cu.kernel().read_register(offset))
    }

    pub fn write_register(&self, cu_index: usize, offset: u32, value: u32) -> Result<()> {
        self.instance(cu_index)?.cu.kernel().write_register(offset, value);
        Ok(())
    }
}

impl fmt::Debug for ComputeUnitDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeUnitDispatcher")
            .field("cu_name", &self.cu_name)
            .field("instances", &self.instances.iter().map(|i| &i.cu).collect::<Vec<_>>())
            .finish()
    }
}
