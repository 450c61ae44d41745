// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::io;

use assert_matches::assert_matches;
use tabpatch::device::{DeviceSession, Error, SessionParams, SessionState};

use common::{PARTS, SimDevice};

fn params() -> SessionParams {
    SessionParams {
        max_payload_size: 16 * 1024,
        partitions: common::partition_table(PARTS),
        ..Default::default()
    }
}

fn open(device: &SimDevice) -> DeviceSession<SimDevice> {
    DeviceSession::open(device.clone(), &common::loader(), params()).unwrap()
}

#[test]
fn handshake_uploads_loader() {
    let device = SimDevice::new();
    let session = open(&device);

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.max_payload_size(), 16 * 1024);

    let state = device.state();
    assert_eq!(state.loader, common::loader());
    assert_eq!(state.configure_attempts, 1);
    assert_eq!(state.commands, ["configure"]);
}

#[test]
fn configure_retries_with_supported_size() {
    let device = SimDevice::new();
    device.state().supported_payload = Some(8192);

    let session = open(&device);

    assert_eq!(session.max_payload_size(), 8192);
    assert_eq!(device.state().configure_attempts, 2);
}

#[test]
fn missing_device() {
    let device = SimDevice::new();
    device.state().present = false;

    let result = DeviceSession::open(device, &common::loader(), params());
    assert_matches!(result, Err(Error::DeviceNotFound(_)));
}

#[test]
fn silent_device_times_out() {
    let device = SimDevice::new();
    device.state().silent = true;

    let result = DeviceSession::open(device.clone(), &common::loader(), params());
    assert_matches!(result, Err(Error::HandshakeTimeout));
    assert!(!device.state().open);
}

#[test]
fn invalid_loader_size() {
    let device = SimDevice::new();

    let result = DeviceSession::open(device.clone(), &[], params());
    assert_matches!(result, Err(Error::LoaderSize(0)));
    assert!(!device.state().open);
}

#[test]
fn read_and_write_partitions() {
    let device = SimDevice::new();
    let devinfo = b"\0\0\0CNXX\0\0\0".repeat(10);
    device.fill("devinfo", &devinfo);

    let mut session = open(&device);

    let data = session.read_partition("devinfo").unwrap();
    assert_eq!(data.len(), common::part("devinfo").size());
    assert_eq!(&data[..devinfo.len()], devinfo.as_slice());
    assert_eq!(session.state(), SessionState::Ready);

    // Spans multiple payloads and ends mid-sector. The unslotted name falls
    // back to the _a slot.
    let boot = (0..40_000u32).map(|i| (i % 253) as u8).collect::<Vec<_>>();
    session.write_partition("boot", &boot).unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    let stored = device.contents("boot_a");
    assert_eq!(&stored[..boot.len()], boot.as_slice());
    assert!(stored[boot.len()..].iter().all(|b| *b == 0));
    assert_eq!(device.written_labels(), ["boot_a"]);

    let read_back = session.read_partition("boot_a").unwrap();
    assert_eq!(read_back, stored);

    session.reset().unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(device.state().reset);
}

#[test]
fn unknown_and_oversized_partitions() {
    let device = SimDevice::new();
    let mut session = open(&device);

    assert_matches!(
        session.read_partition("modem"),
        Err(Error::UnknownPartition(p)) if p == "modem"
    );

    let data = vec![1u8; common::part("devinfo").size() + 1];
    assert_matches!(
        session.write_partition("devinfo", &data),
        Err(Error::PartitionTooLarge { capacity: 4096, .. })
    );

    // Neither error affects the session.
    assert_eq!(session.state(), SessionState::Ready);
    session.read_partition("devinfo").unwrap();
}

#[test]
fn rejected_request_keeps_session() {
    let device = SimDevice::new();
    let mut params = params();
    params.partitions.insert(
        "beyond",
        tabpatch::device::PartitionLocation {
            lun: 0,
            start_sector: 1_000_000,
            num_sectors: 1,
            sector_size: common::SECTOR_SIZE,
            expected_size: None,
        },
    );

    let mut session = DeviceSession::open(device.clone(), &common::loader(), params).unwrap();

    assert_matches!(session.read_partition("beyond"), Err(Error::Rejected(_)));
    assert_eq!(session.state(), SessionState::Ready);
    session.read_partition("persist").unwrap();
}

#[test]
fn connection_lost_mid_write() {
    let device = SimDevice::new();
    let mut session = open(&device);

    let size = common::part("boot_a").size();
    device.state().raw_budget = Some(size / 2);

    let data = vec![0x5au8; size];
    assert_matches!(
        session.write_partition("boot_a", &data),
        Err(Error::SessionLost(e)) if e.kind() == io::ErrorKind::BrokenPipe
    );
    assert_eq!(session.state(), SessionState::Disconnected);

    // The first half made it to the device before the failure.
    let stored = device.contents("boot_a");
    assert!(stored[..size / 2].iter().all(|b| *b == 0x5a));
    assert!(stored[size / 2..].iter().all(|b| *b == 0));

    assert_matches!(
        session.read_partition("boot_a"),
        Err(Error::NotReady(SessionState::Disconnected))
    );
    assert_matches!(
        session.write_partition("boot_a", &data),
        Err(Error::NotReady(SessionState::Disconnected))
    );
}
