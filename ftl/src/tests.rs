use flash_device::sim::SimFlash;
use flash_device::{BlockIndex, Geometry, PageIndex, SubpageIndex};
use hamming256::Hamming256;
// Adds logging to the test automatically
// control with RUST_LOG="LEVEL"
// requires --features log passed to cargo test
use test_log::test;

use crate::{Ftl, FtlError, PartitionSpec, SubpageHeader};

const SUBPAGE: usize = 512;

type TestFtl = Ftl<SimFlash, Hamming256, SUBPAGE>;

/// Large-page NAND: 2048-byte pages carved into four 512-byte subpages,
/// 1024 pages per block, 64 MiB total.
fn nand_geometry() -> Geometry {
    Geometry {
        total_pages: 32768,
        page_size: 2048,
        subpage_size: 512,
        pages_per_block: 1024,
    }
}

/// Small device for tests that sweep whole partitions.
fn small_geometry() -> Geometry {
    Geometry {
        total_pages: 128,
        page_size: 512,
        subpage_size: 512,
        pages_per_block: 16,
    }
}

fn nand_ftl() -> TestFtl {
    let geometry = nand_geometry();
    Ftl::new(SimFlash::for_geometry(&geometry), Hamming256, geometry).unwrap()
}

fn small_ftl() -> TestFtl {
    let geometry = small_geometry();
    Ftl::with_partitions(
        SimFlash::for_geometry(&geometry),
        Hamming256,
        geometry,
        &[
            PartitionSpec { base: 0, size: 2 },
            PartitionSpec { base: 2, size: 6 },
        ],
    )
    .unwrap()
}

#[test]
fn derived_layout() {
    let ftl = nand_ftl();
    let index = ftl.partition(ftl.index_partition());
    assert_eq!(index.base(), 0);
    assert_eq!(index.size(), 2);
    let data = ftl.partition(ftl.data_partition());
    assert_eq!(data.base(), 2);
    assert_eq!(data.size(), 30);
    assert_eq!(ftl.ecc_size(), 6);
}

#[test]
fn rejects_undersized_device() {
    let geometry = small_geometry(); // 64 KiB, far below the index reserve
    let result = TestFtl::new(SimFlash::for_geometry(&geometry), Hamming256, geometry);
    assert!(matches!(result, Err(FtlError::InsufficientStorage)));
}

#[test]
fn rejects_geometry_mismatch() {
    let mut geometry = nand_geometry();
    geometry.subpage_size = 513;
    let result = TestFtl::new(SimFlash::for_geometry(&nand_geometry()), Hamming256, geometry);
    assert!(matches!(result, Err(FtlError::InvalidGeometry)));
}

#[test]
fn size_helpers() {
    let ftl = nand_ftl();
    assert_eq!(ftl.data_per_subpage(false), 509);
    assert_eq!(ftl.data_per_subpage(true), 503);
    assert_eq!(ftl.subpages_in_partition(ftl.index_partition()), 8192);
    assert_eq!(ftl.subpages_in_partition(ftl.data_partition()), 122880);
}

#[test]
fn raw_roundtrip() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    ftl.erase(data, BlockIndex::new(0)).unwrap();

    let mut buf = [0u8; SUBPAGE];
    ftl.read_raw(data, &mut buf, SubpageIndex::new(0)).unwrap();
    assert_eq!(buf, [0xFF; SUBPAGE]);

    buf = [0xAB; SUBPAGE];
    ftl.write_raw(data, &buf, SubpageIndex::new(0)).unwrap();

    buf = [0x00; SUBPAGE];
    ftl.read_raw(data, &mut buf, SubpageIndex::new(0)).unwrap();
    assert_eq!(buf, [0xAB; SUBPAGE]);
}

#[test]
fn read_before_write() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    ftl.erase(data, BlockIndex::new(3)).unwrap();

    let subpage = ftl.geometry().first_subpage_of_block(BlockIndex::new(3));
    let mut buf = [0u8; SUBPAGE];
    assert_eq!(ftl.read(data, &mut buf, subpage), Err(FtlError::NoData));
}

#[test]
fn framed_write_read() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    ftl.format(data).unwrap();

    let buf = [0xAB; SUBPAGE];
    assert_eq!(ftl.write(data, &buf), Err(FtlError::TooMuchData));

    let length = ftl.data_per_subpage(false);
    let subpage = ftl.write(data, &buf[..length]).unwrap();
    assert_eq!(subpage.as_u32(), 0);
    assert_eq!(ftl.partition(data).next_subpage().as_u32(), 1);

    let mut rbuf = [0u8; SUBPAGE];
    let header = ftl.read(data, &mut rbuf, subpage).unwrap();
    assert_eq!(header.data_length as usize, length);
    assert!(!header.ecc);
    assert!(rbuf[..length].iter().all(|&byte| byte == 0xAB));
}

#[test]
fn framed_write_erases_on_demand() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();

    // No format: the cursor sits on an unerased block, so the first append
    // must erase it before programming.
    let buf = [0x5A; 100];
    let subpage = ftl.write_ecc(data, &buf).unwrap();
    assert_eq!(subpage.as_u32(), 0);
    // data partition starts at device block 2
    assert_eq!(ftl.device().erase_count(BlockIndex::new(2)), 1);
    assert_eq!(
        ftl.partition(data).erased_until().as_u32(),
        ftl.geometry().subpages_per_block()
    );

    // the second append stays inside the freshly erased block
    ftl.write_ecc(data, &buf).unwrap();
    assert_eq!(ftl.device().erase_count(BlockIndex::new(2)), 1);
}

#[test]
fn ecc_write_read() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    ftl.format(data).unwrap();

    let buf = [0xAB; SUBPAGE];
    assert_eq!(ftl.write_ecc(data, &buf), Err(FtlError::TooMuchData));

    let length = ftl.data_per_subpage(true);
    assert_eq!(length, 503);
    let subpage = ftl.write_ecc(data, &buf[..length]).unwrap();

    let mut rbuf = [0u8; SUBPAGE];
    let header = ftl.read(data, &mut rbuf, subpage).unwrap();
    assert_eq!(header.data_length, 503);
    assert!(header.ecc);
    assert!(rbuf[..length].iter().all(|&byte| byte == 0xAB));
}

/// The canonical parity bytes for a frame of header {503, ecc} followed by
/// 0xAB fill, as the ECC write path lays it out.
const CANONICAL_ECC: [u8; 6] = [0xFF, 0x30, 0xC3, 0xFF, 0xFF, 0xFF];

fn handcrafted_ecc_frame() -> [u8; SUBPAGE] {
    let mut frame = [0xAB; SUBPAGE];
    frame[..3].copy_from_slice(
        &SubpageHeader {
            data_length: 503,
            ecc: true,
        }
        .to_bytes(),
    );
    frame[3..9].copy_from_slice(&CANONICAL_ECC);
    frame
}

#[test]
fn ecc_corrects_single_flipped_byte_bit() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    let block = BlockIndex::new(3);
    ftl.erase(data, block).unwrap();
    let subpage = ftl.geometry().first_subpage_of_block(block);

    let mut frame = handcrafted_ecc_frame();
    frame[27] = 0xAA; // one cleared bit in the payload
    ftl.write_raw(data, &frame, subpage).unwrap();

    let mut rbuf = [0u8; SUBPAGE];
    let header = ftl.read(data, &mut rbuf, subpage).unwrap();
    assert_eq!(header.data_length, 503);
    assert!(rbuf[..503].iter().all(|&byte| byte == 0xAB));
}

#[test]
fn ecc_rejects_double_flip() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    let block = BlockIndex::new(3);
    ftl.erase(data, block).unwrap();
    let subpage = ftl.geometry().first_subpage_of_block(block);

    let mut frame = handcrafted_ecc_frame();
    frame[26] = 0xAA;
    frame[27] = 0xAA;
    ftl.write_raw(data, &frame, subpage).unwrap();

    let mut rbuf = [0u8; SUBPAGE];
    assert_eq!(
        ftl.read(data, &mut rbuf, subpage),
        Err(FtlError::CorruptFrame)
    );
}

#[test]
fn ecc_corrects_flipped_header_bit() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    let block = BlockIndex::new(3);
    ftl.erase(data, block).unwrap();
    let subpage = ftl.geometry().first_subpage_of_block(block);

    let mut frame = handcrafted_ecc_frame();
    // stored length 502 instead of 503: a single flipped bit in the header
    frame[0] = 0xF6;
    ftl.write_raw(data, &frame, subpage).unwrap();

    let mut rbuf = [0u8; SUBPAGE];
    let header = ftl.read(data, &mut rbuf, subpage).unwrap();
    assert_eq!(header.data_length, 503);
}

#[test]
fn ecc_rejects_mangled_header() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    let block = BlockIndex::new(3);
    ftl.erase(data, block).unwrap();
    let subpage = ftl.geometry().first_subpage_of_block(block);

    let mut frame = handcrafted_ecc_frame();
    frame[0] = 0xFF;
    frame[1] = 0x00; // stored length 255: many bits away from the parity
    ftl.write_raw(data, &frame, subpage).unwrap();

    let mut rbuf = [0u8; SUBPAGE];
    assert_eq!(
        ftl.read(data, &mut rbuf, subpage),
        Err(FtlError::CorruptFrame)
    );
}

#[test]
fn single_bit_rot_after_write() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    ftl.format(data).unwrap();

    let payload = [0xC3; 200];
    let subpage = ftl.write_ecc(data, &payload).unwrap();

    // data partition base block 2 => device page 2048; flip one payload bit
    ftl.device_mut().corrupt(PageIndex::new(2048), 100, 0x08);
    let mut rbuf = [0u8; SUBPAGE];
    let header = ftl.read(data, &mut rbuf, subpage).unwrap();
    assert_eq!(header.data_length, 200);
    assert!(rbuf[..200].iter().all(|&byte| byte == 0xC3));

    // a flip inside the stored parity is reported, not masked
    ftl.device_mut().corrupt(PageIndex::new(2048), 4, 0x02);
    assert_eq!(
        ftl.read(data, &mut rbuf, subpage),
        Err(FtlError::CorruptFrame)
    );
}

#[test]
fn out_of_bounds_io() {
    let mut ftl = nand_ftl();
    let index = ftl.index_partition();
    let data = ftl.data_partition();
    let mut buf = [0u8; SUBPAGE];

    let way_out = SubpageIndex::new(999_999);
    assert_eq!(ftl.read_raw(index, &mut buf, way_out), Err(FtlError::OutOfRange));
    assert_eq!(ftl.read_raw(data, &mut buf, way_out), Err(FtlError::OutOfRange));
    assert_eq!(ftl.write_raw(index, &buf, way_out), Err(FtlError::OutOfRange));
    assert_eq!(ftl.write_raw(data, &buf, way_out), Err(FtlError::OutOfRange));

    assert_eq!(
        ftl.erase(data, BlockIndex::new(30)),
        Err(FtlError::OutOfRange)
    );
}

#[test]
fn format_leaves_partition_virgin() {
    let mut ftl = small_ftl();
    let data = ftl.data_partition();

    for _ in 0..20 {
        ftl.write_ecc(data, &[0x77; 64]).unwrap();
    }
    ftl.format(data).unwrap();

    assert_eq!(ftl.partition(data).next_subpage().as_u32(), 0);
    assert_eq!(
        ftl.partition(data).erased_until().as_u32(),
        ftl.subpages_in_partition(data)
    );

    let mut buf = [0u8; SUBPAGE];
    for subpage in 0..ftl.subpages_in_partition(data) {
        ftl.read_raw(data, &mut buf, SubpageIndex::new(subpage))
            .unwrap();
        assert_eq!(buf, [0xFF; SUBPAGE]);
    }
}

#[test]
fn partition_exhaustion_is_hard_failure() {
    let mut ftl = small_ftl();
    let data = ftl.data_partition();
    let capacity = ftl.subpages_in_partition(data);

    for _ in 0..capacity {
        ftl.write(data, &[0x11; 16]).unwrap();
    }
    assert_eq!(ftl.write(data, &[0x11; 16]), Err(FtlError::OutOfRange));
}

#[test]
fn metadata_roundtrip_survives_reinit() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    ftl.format(ftl.index_partition()).unwrap();
    ftl.format(data).unwrap();

    for _ in 0..3 {
        ftl.write_ecc(data, &[0x42; 100]).unwrap();
    }
    ftl.write_metadata(b"first").unwrap();
    ftl.write_metadata(b"second snapshot").unwrap();

    // reboot
    let geometry = nand_geometry();
    let device = ftl.into_device();
    let mut ftl = TestFtl::new(device, Hamming256, geometry).unwrap();

    let mut blob = [0u8; SUBPAGE];
    let length = ftl.load_latest_metadata(&mut blob).unwrap().unwrap();
    assert_eq!(&blob[..length], b"second snapshot");

    // persisted data cursor came back with the snapshot
    assert_eq!(ftl.partition(ftl.data_partition()).next_subpage().as_u32(), 3);
    // the anchor continues after the two snapshots
    assert_eq!(
        ftl.partition(ftl.index_partition()).next_subpage().as_u32(),
        2
    );
}

#[test]
fn metadata_empty_anchor() {
    let mut ftl = nand_ftl();
    ftl.format(ftl.index_partition()).unwrap();
    let mut blob = [0u8; SUBPAGE];
    assert_eq!(ftl.load_latest_metadata(&mut blob).unwrap(), None);
}

#[test]
fn metadata_wraps_around_the_anchor() {
    let mut ftl = small_ftl();
    ftl.format(ftl.index_partition()).unwrap();
    let anchor_capacity = ftl.subpages_in_partition(ftl.index_partition());
    assert_eq!(anchor_capacity, 32);

    for round in 1..=40u32 {
        ftl.write_metadata(&round.to_le_bytes()).unwrap();
    }

    let geometry = small_geometry();
    let device = ftl.into_device();
    let mut ftl = TestFtl::with_partitions(
        device,
        Hamming256,
        geometry,
        &[
            PartitionSpec { base: 0, size: 2 },
            PartitionSpec { base: 2, size: 6 },
        ],
    )
    .unwrap();

    let mut blob = [0u8; SUBPAGE];
    let length = ftl.load_latest_metadata(&mut blob).unwrap().unwrap();
    assert_eq!(&blob[..length], &40u32.to_le_bytes()[..]);
}

#[test]
fn metadata_blob_capacity() {
    let mut ftl = small_ftl();
    ftl.format(ftl.index_partition()).unwrap();
    let too_big = [0u8; SUBPAGE];
    assert_eq!(
        ftl.write_metadata(&too_big[..ftl.metadata_capacity() + 1]),
        Err(FtlError::TooMuchData)
    );
    ftl.write_metadata(&too_big[..ftl.metadata_capacity()])
        .unwrap();
}

#[test]
fn cursor_recovery_skips_unsnapshotted_writes() {
    let mut ftl = nand_ftl();
    let data = ftl.data_partition();
    ftl.format(ftl.index_partition()).unwrap();
    ftl.format(data).unwrap();

    ftl.write_metadata(b"checkpoint").unwrap();
    // five frames the snapshot knows nothing about
    for _ in 0..5 {
        ftl.write_ecc(data, &[0x99; 50]).unwrap();
    }

    let geometry = nand_geometry();
    let device = ftl.into_device();
    let mut ftl = TestFtl::new(device, Hamming256, geometry).unwrap();
    let mut blob = [0u8; SUBPAGE];
    ftl.load_latest_metadata(&mut blob).unwrap().unwrap();

    let data = ftl.data_partition();
    assert_eq!(ftl.partition(data).next_subpage().as_u32(), 0);
    ftl.recover_cursor(data).unwrap();
    assert_eq!(ftl.partition(data).next_subpage().as_u32(), 5);

    // appends continue cleanly after the recovered cursor
    let subpage = ftl.write_ecc(data, &[0x77; 50]).unwrap();
    assert_eq!(subpage.as_u32(), 5);
}
