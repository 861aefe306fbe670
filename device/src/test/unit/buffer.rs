use crate::buffer::BufferObject;
use crate::error::Error;
use crate::test::helpers::{Fixture, sim};

const CU: &str = "DPUCZDX8G";
const DDR_BASE: u64 = 0x6000_0000;

fn device_only(num_of_devices: usize) -> Fixture {
    let driver = sim(num_of_devices);
    (0..num_of_devices).for_each(|i| driver.device(i).unwrap().set_unified(false));
    Fixture::new(driver)
}

#[test]
fn test_small_buffer_is_not_striped() {
    let fixture = Fixture::new(sim(1));
    let buffer = BufferObject::with_registry(fixture.registry.clone(), 4096, 0, CU).unwrap();

    assert_eq!(buffer.size(), 4096);
    assert_eq!(buffer.physical_size(), 4096);
    assert_eq!(buffer.bank_offset(), 0);
    assert_eq!(buffer.phy(0), DDR_BASE);
    assert_eq!(buffer.phy(128), DDR_BASE + 128);
    assert_eq!(fixture.registry.next_stripe_slot(), 0, "small buffers must not consume a stripe slot");
}

#[test]
fn test_buffer_is_zero_filled_and_flushed() {
    let fixture = Fixture::new(sim(1));
    let syncs = fixture.driver.sync_count();
    let mut buffer = BufferObject::with_registry(fixture.registry.clone(), 1000, 0, CU).unwrap();

    assert!(buffer.data_r().unwrap().iter().all(|&b| b == 0));
    assert_eq!(fixture.driver.sync_count(), syncs + 1);

    // The device view was flushed as well.
    let mut out = vec![0xff; 1000];
    buffer.copy_to_host(&mut out, 0).unwrap();
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn test_large_buffers_rotate_banks() {
    let fixture = Fixture::new(sim(1));
    let range = fixture.registry.config().striping.bank_range;
    let count = fixture.registry.config().striping.bank_count;

    let first = BufferObject::with_registry(fixture.registry.clone(), 2 * range, 0, CU).unwrap();
    let second = BufferObject::with_registry(fixture.registry.clone(), 2 * range, 0, CU).unwrap();

    assert_eq!(first.physical_size(), 2 * range + count * range);
    assert_eq!(first.bank_offset(), 0);
    assert_eq!(second.bank_offset(), range);
    assert_eq!(first.phy(0), DDR_BASE);
    assert_eq!(second.data_r().unwrap().len(), 2 * range);

    // The second allocation starts right after the first; its window sits one bank further in.
    let second_base = DDR_BASE + first.physical_size() as u64;
    assert_eq!(second.phy(0) - second_base, range as u64);
    assert_eq!(second.phy(100), second.phy(0) + 100);
    assert_eq!(second.phy(2 * range - 1), second.phy(0) + 2 * range as u64 - 1);
}

#[test]
fn test_large_model_buffers() {
    let fixture = Fixture::new(sim(1));
    let size = 200 * 1024 * 1024;

    let first = BufferObject::with_registry(fixture.registry.clone(), size, 0, CU).unwrap();
    assert_eq!(first.size(), size);
    assert_eq!(first.physical_size(), size + 8 * 16384);
    assert_eq!(first.bank_offset(), 0);
    let first_end = DDR_BASE + first.physical_size() as u64;
    drop(first);

    let second = BufferObject::with_registry(fixture.registry.clone(), size, 0, CU).unwrap();
    assert_eq!(second.bank_offset(), 16384);
    assert_eq!(second.phy(0), first_end + 16384);
}

#[test]
fn test_oversized_buffer_fails_allocation() {
    let fixture = Fixture::new(sim(1));
    let err = BufferObject::with_registry(fixture.registry.clone(), usize::MAX - 10, 0, CU).err().unwrap();
    assert!(matches!(err, Error::Allocation { size, device_id: 0, .. } if size == usize::MAX - 10));
    assert!(err.is_fatal());

    // The registry stays usable.
    assert!(BufferObject::with_registry(fixture.registry.clone(), 4096, 0, CU).is_ok());
}

#[test]
fn test_striping_disabled() {
    let fixture = Fixture::with_config(sim(1), |c| c.striping.enabled = false);
    let buffer = BufferObject::with_registry(fixture.registry.clone(), 1 << 20, 0, CU).unwrap();
    assert_eq!(buffer.physical_size(), 1 << 20);
    assert_eq!(buffer.bank_offset(), 0);
}

#[test]
fn test_copy_round_trip_unified() {
    let fixture = Fixture::new(sim(1));
    let mut buffer = BufferObject::with_registry(fixture.registry.clone(), 64, 0, CU).unwrap();
    assert!(buffer.is_host_mapped());

    buffer.copy_from_host(&[1, 2, 3, 4], 10).unwrap();
    let mut out = [0u8; 6];
    buffer.copy_to_host(&mut out, 9).unwrap();
    assert_eq!(out, [0, 1, 2, 3, 4, 0]);
    assert_eq!(&buffer.data_r().unwrap()[10..14], &[1, 2, 3, 4]);
}

#[test]
fn test_host_writes_need_sync() {
    let fixture = Fixture::new(sim(1));
    let mut buffer = BufferObject::with_registry(fixture.registry.clone(), 32, 0, CU).unwrap();

    buffer.data_w().unwrap()[..4].copy_from_slice(&[9, 9, 9, 9]);
    buffer.sync_for_write(0, 4).unwrap();

    // Re-reading from the device returns what was flushed.
    buffer.sync_for_read(0, 32).unwrap();
    assert_eq!(&buffer.data_r().unwrap()[..5], &[9, 9, 9, 9, 0]);
}

#[test]
fn test_device_only_memory() {
    let fixture = device_only(1);
    let mut buffer = BufferObject::with_registry(fixture.registry.clone(), 2 * 16384, 0, CU).unwrap();
    let second = BufferObject::with_registry(fixture.registry.clone(), 2 * 16384, 0, CU).unwrap();

    assert!(!buffer.is_host_mapped());
    assert!(buffer.data_r().is_none());
    assert!(buffer.data_w().is_none());
    assert_eq!(second.bank_offset(), 16384);

    let syncs = fixture.driver.sync_count();
    buffer.sync_for_write(0, 16).unwrap();
    assert_eq!(fixture.driver.sync_count(), syncs, "device-only sync must not reach the driver");

    buffer.copy_from_host(b"hello", 100).unwrap();
    let mut out = [0u8; 7];
    buffer.copy_to_host(&mut out, 99).unwrap();
    assert_eq!(&out, b"\0hello\0");
}

#[test]
fn test_out_of_range_is_recoverable() {
    let fixture = Fixture::new(sim(1));
    let mut buffer = BufferObject::with_registry(fixture.registry.clone(), 16, 0, CU).unwrap();

    let err = buffer.copy_from_host(&[7; 8], 12).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { offset: 12, size: 8, buffer_size: 16 }));
    assert!(!err.is_fatal());
    assert!(buffer.data_r().unwrap().iter().all(|&b| b == 0), "failed copy must not write anything");

    let mut out = [0u8; 17];
    assert!(buffer.copy_to_host(&mut out, 0).is_err());
    assert!(buffer.sync_for_read(16, 1).is_err());
    assert!(buffer.sync_for_write(usize::MAX, 2).is_err());
    assert!(buffer.copy_from_host(&[], 16).is_ok());
}

#[test]
fn test_buffer_on_second_device() {
    let fixture = Fixture::new(sim(2));
    let buffer = BufferObject::with_registry(fixture.registry.clone(), 256, 1, CU).unwrap();
    assert_eq!(buffer.device_id(), 1);
    assert_eq!(buffer.cu_name(), CU);
}

#[test]
fn test_device_not_found() {
    let fixture = Fixture::new(sim(1));
    let err = BufferObject::with_registry(fixture.registry.clone(), 256, 3, CU).unwrap_err();
    assert!(matches!(err, Error::DeviceNotFound { device_id: 3, .. }));

    let err = BufferObject::with_registry(fixture.registry.clone(), 256, 0, "vadd").unwrap_err();
    assert!(matches!(err, Error::DeviceNotFound { ref cu_name, .. } if cu_name == "vadd"));
}

#[test]
fn test_allocation_failure() {
    let fixture = Fixture::new(sim(1));
    // Larger than the 1 GiB DDR bank of the sample image.
    let err = BufferObject::with_registry(fixture.registry.clone(), 2 << 30, 0, CU).unwrap_err();
    assert!(matches!(err, Error::Allocation { bank: 1, .. }));
    assert!(err.is_fatal());
}
