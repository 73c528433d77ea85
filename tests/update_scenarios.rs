//! End to end update scenarios, driven through the public API against the
//! host storage doubles. Each device reset is modelled by releasing the
//! storage and booting a fresh `Ota` on top of it.

use crc::crc32;
use rootstock_lib::{
    devices::{
        backup_header::{SlotId, SlotStatus, Version},
        keys::{Key, KEY_SIZE},
        layout::Layout,
        ota::{Boot, BootKind, Ota, Reply, Validation},
        ota_state::State,
        protocol::{Request, Response, MAX_REQUEST_SIZE},
        receiver::{offset_check, CHUNK_SIZE},
        rollback::RestartRequired,
    },
    error::Error,
    hal::{
        doubles::{
            flash::{FakeFlash, PowerSwitch},
            program::FakeProgramMemory,
            time::FakeClock,
        },
        time::Ticks,
    },
    utilities::memory::Region,
};

const KEY: Key = Key([0x5C; KEY_SIZE]);
const PROGRAM_BASE: u32 = 0x0800_0000;
const TIMEOUT: u32 = 30_000;

static LAYOUT: Layout = Layout {
    header: Region::new(0x0000, 0x1000),
    state: Region::new(0x1000, 0x1000),
    slots: [Region::new(0x2000, 0x4000), Region::new(0x6000, 0x4000)],
    sector_size: 0x1000,
    program: Region::new(PROGRAM_BASE, 0x4000),
    validation_timeout: Ticks(TIMEOUT),
    persist_interval: 8,
};

type Device = Ota<FakeFlash, FakeProgramMemory, FakeClock>;

fn firmware(size: usize, seed: u8) -> Vec<u8> {
    (0..size).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8).collect()
}

fn crc(bytes: &[u8]) -> u32 { crc32::checksum_ieee(bytes) }

/// A factory fresh device running `running`, booted once.
fn factory_device(running: &[u8]) -> (Device, FakeClock) {
    let (device, clock, _) = powered_device(running);
    (device, clock)
}

/// As [`factory_device`], with a handle to the external flash supply.
fn powered_device(running: &[u8]) -> (Device, FakeClock, PowerSwitch) {
    let mut program = FakeProgramMemory::new(PROGRAM_BASE, LAYOUT.program.size, 0x800);
    program.load(PROGRAM_BASE, running);
    let clock = FakeClock::starting_at(1_000);
    let flash = FakeFlash::new(0, 0xA000, 0x1000);
    let power = flash.power();
    let mut device = Ota::new(flash, program, clock.clone(), &KEY, &LAYOUT);
    assert_eq!(device.boot(), Ok(Boot::Continue(BootKind::Normal)));
    (device, clock, power)
}

/// Resets until the boot sequence lets the application run.
fn reset(device: Device) -> (Device, BootKind) {
    let (flash, program, clock) = device.release();
    let mut device = Ota::new(flash, program, clock, &KEY, &LAYOUT);
    for _ in 0..3 {
        match device.boot().unwrap() {
            Boot::Continue(kind) => return (device, kind),
            Boot::Restart(RestartRequired) => {
                let (flash, program, clock) = device.release();
                device = Ota::new(flash, program, clock, &KEY, &LAYOUT);
            }
        }
    }
    panic!("device never settled after a reset");
}

fn send(device: &mut Device, image: &[u8]) {
    for (index, chunk) in image.chunks(CHUNK_SIZE).enumerate() {
        let index = index as u16;
        device.chunk(index, offset_check(index), chunk).unwrap();
    }
}

/// Reads back program memory without disturbing the device.
fn program(device: &Device, length: usize) -> Vec<u8> {
    device.program_memory().contents(PROGRAM_BASE, length).to_vec()
}

#[test]
fn update_is_installed_and_confirmed() {
    // Given
    let running = firmware(6000, 1);
    let image = firmware(10_000, 2);
    let version = Version::new(2, 1, 0);
    let (mut device, _) = factory_device(&running);

    // When
    device.start(10_000, crc(&image), version).unwrap();
    send(&mut device, &image);
    let restart = device.finish();
    let (mut device, kind) = reset(device);

    // Then
    assert_eq!(restart, Ok(RestartRequired));
    assert_eq!(kind, BootKind::PostOta);
    assert_eq!(device.header().active().version, version);
    assert_eq!(device.header().active().status, SlotStatus::PendingValidation);

    // When
    device.confirm().unwrap();
    let (device, kind) = reset(device);

    // Then
    assert_eq!(kind, BootKind::Normal);
    let diagnostics = device.diagnostics();
    assert_eq!(diagnostics.active_slot, SlotId::B);
    assert_eq!(diagnostics.slots[1].status, SlotStatus::Valid);
    assert_eq!(diagnostics.expected_version, version);
    assert_eq!(diagnostics.rollback_count, 0);
    assert_eq!(program(&device, image.len()), image);
}

#[test]
fn unconfirmed_update_rolls_back_after_the_window() {
    // Given
    let running = firmware(6000, 1);
    let image = firmware(10_000, 2);
    let (mut device, clock) = factory_device(&running);
    device.start(10_000, crc(&image), Version::new(2, 1, 0)).unwrap();
    send(&mut device, &image);
    device.finish().unwrap();
    let (mut device, _) = reset(device);
    clock.advance(TIMEOUT / 2);
    assert_eq!(device.check_validation(), Ok(Validation::Pending { remaining: Ticks(TIMEOUT / 2) }));

    // When
    clock.advance(TIMEOUT / 2);
    let outcome = device.check_validation();
    let (device, kind) = reset(device);

    // Then
    assert_eq!(outcome, Ok(Validation::RolledBack(RestartRequired)));
    assert_eq!(kind, BootKind::PostRollback);
    let diagnostics = device.diagnostics();
    assert_eq!(diagnostics.rollback_count, 1);
    assert_eq!(diagnostics.failed_version, Version::new(2, 1, 0));
    assert_eq!(diagnostics.active_slot, SlotId::A);
    assert_eq!(diagnostics.slots[1].status, SlotStatus::Failed);
    assert_eq!(program(&device, running.len()), running);
}

#[test]
fn successive_updates_alternate_slots() {
    // Given
    let (mut device, _) = factory_device(&firmware(4000, 1));
    let mut expected_slot = SlotId::A;

    for cycle in 1..=4u8 {
        // When
        let image = firmware(2000 + cycle as usize * 1500, cycle * 17);
        let version = Version::new(1, cycle, 0);
        device.start(image.len() as u32, crc(&image), version).unwrap();
        send(&mut device, &image);
        device.finish().unwrap();
        let (mut rebooted, kind) = reset(device);
        assert_eq!(kind, BootKind::PostOta);
        rebooted.confirm().unwrap();
        expected_slot = expected_slot.other();

        // Then
        assert_eq!(rebooted.header().active_slot, expected_slot);
        assert_eq!(rebooted.header().active().version, version);
        assert_eq!(rebooted.header().inactive().status, SlotStatus::Valid);
        assert_eq!(program(&rebooted, image.len()), image);
        device = rebooted;
    }
    assert_eq!(device.diagnostics().rollback_count, 0);
}

#[test]
fn oversized_images_are_rejected_before_anything_changes() {
    // Given
    let (mut device, _) = factory_device(&firmware(4000, 1));
    let capacity = LAYOUT.slot_capacity() as u32;

    // When
    let result = device.start(capacity + 1, 0, Version::new(9, 0, 0));

    // Then
    assert_eq!(result, Err(Error::TooLarge));
    assert_eq!(device.state().state, State::None);
    let (device, kind) = reset(device);
    assert_eq!(kind, BootKind::Normal);
    assert_eq!(device.diagnostics().state, State::None);
}

#[test]
fn transport_session_with_retransmissions() {
    // Given
    let image = firmware(1000, 9);
    let (mut device, _) = factory_device(&firmware(4000, 1));
    let mut frame = [0u8; MAX_REQUEST_SIZE];
    let mut exchange = |device: &mut Device, request: Request| {
        let length = request.encode(&mut frame).unwrap();
        device.handle_frame(&frame[..length])
    };

    // When
    let start = Request::Start { size: 1000, crc: crc(&image), version: Version::new(3, 0, 0) };
    let ready = exchange(&mut device, start);
    let chunks: Vec<&[u8]> = image.chunks(CHUNK_SIZE).collect();
    let first = Request::Chunk { index: 0, offset_check: offset_check(0), payload: chunks[0] };
    let first_ack = exchange(&mut device, first);
    let duplicate_ack = exchange(&mut device, first);
    let misplaced = Request::Chunk { index: 1, offset_check: offset_check(2), payload: chunks[1] };
    let misplaced_reply = exchange(&mut device, misplaced);
    let early_finish = exchange(&mut device, Request::Finish);
    for (index, chunk) in chunks.iter().copied().enumerate().skip(1) {
        let index = index as u16;
        exchange(&mut device, Request::Chunk { index, offset_check: offset_check(index), payload: chunk });
    }
    let finish = exchange(&mut device, Request::Finish);

    // Then
    assert_eq!(ready.response, Response::Ready);
    assert_eq!(first_ack.response, Response::ChunkOk(12));
    assert_eq!(duplicate_ack.response, Response::ChunkOk(12));
    assert_eq!(misplaced_reply.response, Response::Error(Error::OffsetMismatch.code()));
    assert_eq!(early_finish.response, Response::Error(Error::InvalidState.code()));
    assert_eq!(finish, Reply { response: Response::Rebooting, restart: Some(RestartRequired) });
    assert_eq!(finish.response.encode(), ([0x83, 0], 1));
    let (mut device, kind) = reset(device);
    assert_eq!(kind, BootKind::PostOta);
    assert_eq!(program(&device, image.len()), image);
    assert!(matches!(device.check_validation(), Ok(Validation::Pending { .. })));
    assert_eq!(device.header().active().version, Version::new(3, 0, 0));
}

/// Cuts power to the external flash at every mutation the commit performs
/// and checks that the device always comes back running a whole image,
/// and that the update can then be completed.
#[test]
fn commits_survive_power_loss_at_any_point() {
    let running = firmware(6000, 1);
    let image = firmware(5000, 2);
    let version = Version::new(2, 0, 0);

    for budget in 0.. {
        // Given
        let (mut device, _, power) = powered_device(&running);
        device.start(image.len() as u32, crc(&image), version).unwrap();
        send(&mut device, &image);
        power.cut_after(budget);

        // When
        let committed = device.finish().is_ok();
        power.restore();
        let (device, kind) = reset(device);

        // Then
        if committed {
            assert_eq!(kind, BootKind::PostOta);
            assert_eq!(program(&device, image.len()), image);
            break;
        }
        assert_ne!(device.header().active().status, SlotStatus::PendingValidation, "budget {}", budget);
        assert_eq!(program(&device, running.len()), running, "budget {}", budget);
        let mut device = device;

        // When
        if device.state().state != State::InProgress {
            device.start(image.len() as u32, crc(&image), version).unwrap();
        }
        send(&mut device, &image);
        device.finish().unwrap();
        let (mut device, kind) = reset(device);

        // Then
        assert_eq!(kind, BootKind::PostOta, "budget {}", budget);
        device.confirm().unwrap();
        assert_eq!(program(&device, image.len()), image, "budget {}", budget);
    }
}
