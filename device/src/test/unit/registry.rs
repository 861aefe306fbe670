use std::sync::Arc;

use test_case::test_case;

use crate::config::{DeviceSelection, RuntimeConfig};
use crate::driver::Driver;
use crate::error::Error;
use crate::image::{HardwareImage, ImageUuid, MemoryBank};
use crate::lock::DeviceLock;
use crate::registry::{DeviceRegistry, FINGERPRINT_HI, FINGERPRINT_LO};
use crate::sim::{SimDriver, sample_image};
use crate::test::helpers::{FIRMWARE, Fixture, LockDir, SAMPLE_IPS, config, sim, sim_with_ips};

fn build(driver: SimDriver, configure: impl FnOnce(&mut RuntimeConfig)) -> Result<Fixture, Error> {
    Fixture::try_with_config(driver, configure)
}

// =============================================================================
// Discovery
// =============================================================================

#[test]
fn test_discovers_filtered_cus() {
    let fixture = Fixture::new(sim(2));
    let registry = &fixture.registry;

    assert_eq!(registry.get_num_of_devices(), 2);
    // Two DPU instances and one softmax core per device; the DMA core is ignored.
    assert_eq!(registry.get_num_of_all_cus(), 6);
    assert_eq!(registry.get_num_of_cus("DPUCZDX8G"), 4);
    assert_eq!(registry.get_num_of_cus("DPUCZDX8G:DPUCZDX8G_2"), 2);
    assert_eq!(registry.get_num_of_cus("sfm"), 2);
    assert_eq!(registry.get_num_of_cus("axi_dma"), 0);
    assert_eq!(registry.get_memory_bank_index(), 1);
}

#[test]
fn test_positional_lookup_follows_key_order() {
    let fixture = Fixture::new(sim(2));
    let registry = &fixture.registry;

    // Keys are "{full_name}:{device_id}", so instance _1 of both devices comes first.
    assert_eq!(registry.get_cu_full_name("DPUCZDX8G", 0).unwrap(), "DPUCZDX8G:DPUCZDX8G_1");
    assert_eq!(registry.get_device_id("DPUCZDX8G", 0).unwrap(), 0);
    assert_eq!(registry.get_device_id("DPUCZDX8G", 1).unwrap(), 1);
    assert_eq!(registry.get_cu_full_name("DPUCZDX8G", 2).unwrap(), "DPUCZDX8G:DPUCZDX8G_2");
    assert_eq!(registry.get_cu_kernel_name("DPUCZDX8G", 3).unwrap(), "DPUCZDX8G");
    assert_eq!(registry.get_cu_instance_name("DPUCZDX8G", 3).unwrap(), "DPUCZDX8G_2");
    assert_eq!(registry.get_device_uuid("sfm", 1).unwrap(), registry.image().uuid());
    assert_eq!(registry.get_kernel_handle("DPUCZDX8G", 2).unwrap().name(), "DPUCZDX8G:DPUCZDX8G_2");
    assert_eq!(registry.get_device_handle("DPUCZDX8G", 1).unwrap().index(), 1);
}

#[test]
fn test_lookup_out_of_range() {
    let fixture = Fixture::new(sim(1));
    let err = fixture.registry.get_cu_full_name("DPUCZDX8G", 2).unwrap_err();
    assert!(matches!(err, Error::CuNotFound { ref cu_name, cu_index: 2 } if cu_name == "DPUCZDX8G"));
    assert!(err.is_fatal());
    assert!(fixture.registry.get_device_id("nonexistent", 0).is_err());
}

#[test]
fn test_ip_without_instance_suffix() {
    let fixture = Fixture::new(sim_with_ips(1, &["DPUCZDX8G", "sfm_xrt_top:sfm_xrt_top_1"]));
    let registry = &fixture.registry;

    assert_eq!(registry.get_cu_full_name("DPUCZDX8G", 0).unwrap(), "DPUCZDX8G");
    assert_eq!(registry.get_cu_kernel_name("DPUCZDX8G", 0).unwrap(), "DPUCZDX8G");
    assert_eq!(registry.get_cu_instance_name("DPUCZDX8G", 0).unwrap(), "");
    assert_eq!(registry.get_kernel_handle("DPUCZDX8G", 0).unwrap().name(), "DPUCZDX8G");
}

#[test]
fn test_verbose_discovery() {
    let mut verbose = RuntimeConfig::from_vars([("DEBUG_XRT_DEVICE_HANDLE".to_string(), "2".to_string())]).unwrap();
    assert_eq!(verbose.debug.device_handle, 2);

    let lock_dir = LockDir::new();
    let base = config(lock_dir.path());
    verbose.firmware = base.firmware;
    verbose.config_file = base.config_file;
    verbose.lock_dir = base.lock_dir;

    let registry = DeviceRegistry::new(Arc::new(sim(2)) as Arc<dyn Driver>, verbose).unwrap();
    assert_eq!(registry.get_num_of_all_cus(), 6);
    assert_eq!(registry.config().debug.device_handle, 2);
}

#[test]
fn test_dpu_lowercase_and_sfm_filters() {
    let fixture = Fixture::new(sim_with_ips(1, &["dpu_v4e:dpu_v4e_0", "sfm:sfm_0", "vadd:vadd_0"]));
    assert_eq!(fixture.registry.get_num_of_all_cus(), 2);
    assert_eq!(fixture.registry.get_num_of_cus("dpu"), 1);
}

// =============================================================================
// Device selection
// =============================================================================

#[test_case(DeviceSelection::All, &[0, 1, 2]; "all")]
#[test_case(DeviceSelection::List(vec![1]), &[1]; "single")]
#[test_case(DeviceSelection::List(vec![2, 0]), &[0, 2]; "unordered")]
#[test_case(DeviceSelection::List(vec![1, 7]), &[1]; "out_of_range_dropped")]
#[test_case(DeviceSelection::List(vec![0, 0, 1]), &[0, 1]; "repeated_bound_once")]
fn test_enable_devices(selection: DeviceSelection, expected: &[usize]) {
    let fixture = Fixture::with_config(sim_with_ips(3, &["DPUCZDX8G:DPUCZDX8G_1"]), |c| c.enable_devices = selection);
    let ids: Vec<_> = fixture.registry.cus("DPUCZDX8G").map(|cu| cu.device_id()).collect();
    assert_eq!(ids, expected);
    assert_eq!(fixture.registry.get_num_of_devices(), expected.len());
}

#[test]
fn test_enable_devices_selects_nothing() {
    let err = build(sim(2), |c| c.enable_devices = DeviceSelection::List(vec![5])).unwrap_err();
    assert!(matches!(err, Error::NoDeviceSelected { available: 2, .. }));
}

// =============================================================================
// Fatal environments
// =============================================================================

#[test]
fn test_no_devices() {
    assert!(matches!(build(sim(0), |_| {}).unwrap_err(), Error::NoDevices));
}

#[test]
fn test_missing_image() {
    let err = build(SimDriver::new(1), |_| {}).unwrap_err();
    assert!(matches!(err, Error::ImageOpen { ref path, .. } if path.to_str() == Some(FIRMWARE)));
}

#[test]
fn test_uuid_mismatch() {
    let driver = sim(2);
    driver.device(1).unwrap().set_corrupt_uuid(true);
    let err = build(driver, |_| {}).unwrap_err();
    assert!(matches!(err, Error::UuidMismatch { device_id: 1, .. }));
}

#[test]
fn test_skip_image_load() {
    let err = build(sim(1), |c| c.skip_image_load = true).unwrap_err();
    assert!(matches!(err, Error::ImageNotResident { device_id: 0 }));

    let driver = sim(1);
    driver.device(0).unwrap().preload(sample_image(&SAMPLE_IPS));
    let fixture = build(driver, |c| c.skip_image_load = true).unwrap();
    assert_eq!(fixture.registry.get_num_of_cus("DPUCZDX8G"), 2);
}

#[test]
fn test_no_used_bank() {
    let image = HardwareImage::new(
        ImageUuid::new([7; 16]),
        vec!["DPUCZDX8G:DPUCZDX8G_1".into()],
        vec![MemoryBank::new("HBM[0]", false, 0x1000, 1 << 20)],
    );
    let err = build(SimDriver::new(1).with_image(FIRMWARE, image), |_| {}).unwrap_err();
    assert!(matches!(err, Error::NoValidBank));
}

#[test_case(&[]; "empty_image")]
#[test_case(&["axi_dma:axi_dma_0", "vadd:vadd_1"]; "no_matching_ip")]
fn test_no_compute_units(ips: &[&str]) {
    let err = build(sim_with_ips(1, ips), |_| {}).unwrap_err();
    assert!(matches!(err, Error::NoComputeUnits));
}

#[test]
fn test_invalid_config_fails_fast() {
    let err = build(sim(1), |c| c.striping.bank_count = 0).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}

// =============================================================================
// Fingerprints and registers
// =============================================================================

#[test]
fn test_fingerprint_from_registers() {
    let fixture = Fixture::new(sim(1).with_fingerprint("DPUCZDX8G:DPUCZDX8G_1", 0x0100_0003_2000_0010));
    assert_eq!(fixture.registry.get_cu_fingerprint("DPUCZDX8G", 0).unwrap(), 0x0100_0003_2000_0010);
    assert_eq!(fixture.registry.get_cu_fingerprint("DPUCZDX8G", 1).unwrap(), 0);
}

#[test]
fn test_fingerprint_override() {
    let driver = sim(1).with_fingerprint("DPUCZDX8G:DPUCZDX8G_1", 1);
    let fixture = Fixture::with_config(driver, |c| {
        c.fingerprints.insert("DPUCZDX8G:DPUCZDX8G_1".into(), 42);
    });
    assert_eq!(fixture.registry.get_cu_fingerprint("DPUCZDX8G", 0).unwrap(), 42);
}

#[test]
fn test_register_access() {
    let fixture = Fixture::new(sim(1));
    let registry = &fixture.registry;
    registry.write_register("DPUCZDX8G", 1, 0x20, 0xcafe).unwrap();
    assert_eq!(registry.read_register("DPUCZDX8G", 1, 0x20).unwrap(), 0xcafe);
    assert_eq!(registry.read_register("DPUCZDX8G", 0, 0x20).unwrap(), 0);
    assert_eq!(registry.read_register("DPUCZDX8G", 0, FINGERPRINT_HI).unwrap(), 0);
    assert!(registry.write_register("DPUCZDX8G", 9, FINGERPRINT_LO, 1).is_err());
}

#[test]
fn test_stripe_slots_increment() {
    let fixture = Fixture::new(sim(1));
    let slots: Vec<_> = (0..4).map(|_| fixture.registry.next_stripe_slot()).collect();
    assert_eq!(slots, vec![0, 1, 2, 3]);
}

// =============================================================================
// Locking and sharing
// =============================================================================

#[test]
fn test_registry_holds_device_locks() {
    let fixture = Fixture::new(sim(2));
    let lock_dir = fixture.lock_dir().to_path_buf();
    assert!(DeviceLock::try_acquire(&lock_dir, 0).unwrap().is_none());
    assert!(DeviceLock::try_acquire(&lock_dir, 1).unwrap().is_none());
    assert!(DeviceLock::try_acquire(&lock_dir, 2).unwrap().is_some());

    let Fixture { registry, driver, .. } = fixture;
    drop(registry);
    assert!(DeviceLock::try_acquire(&lock_dir, 0).unwrap().is_some());
    drop(driver);
}

#[test]
fn test_second_registry_waits_for_first() {
    let lock_dir = LockDir::new();
    let driver: Arc<dyn Driver> = Arc::new(sim(1));
    let first = DeviceRegistry::new(Arc::clone(&driver), config(lock_dir.path())).unwrap();

    std::thread::scope(|s| {
        let waiter = s.spawn(|| DeviceRegistry::new(Arc::clone(&driver), config(lock_dir.path())));
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!waiter.is_finished());
        drop(first);
        let second = waiter.join().unwrap().unwrap();
        assert_eq!(second.get_num_of_devices(), 1);
    });
}

#[test]
fn test_shared_instance() {
    // The shared instance reads the process environment; serve the image wherever it points.
    let firmware = RuntimeConfig::from_env().unwrap().resolve_firmware();
    let driver = Arc::new(sim(1).with_image(firmware, sample_image(&SAMPLE_IPS)));
    SimDriver::install(Arc::clone(&driver));

    let a = DeviceRegistry::get_instance().unwrap();
    let b = DeviceRegistry::get_instance().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    let first_slot = a.next_stripe_slot();
    assert_eq!(b.next_stripe_slot(), first_slot + 1);

    drop((a, b));
    let c = DeviceRegistry::get_instance().unwrap();
    assert_eq!(c.next_stripe_slot(), 0);
    assert_eq!(crate::driver::default_driver_name().as_deref(), Some("sim"));
}
