//! Transfer engine tests against the emulated device

use rdfu_core::firmware::{Element, Firmware, Format, Image, ParseFlags};
use rdfu_core::protocol::{DfuState, DfuStatus, Request};
use rdfu_core::target::{DfuTarget, OpenFlags, TargetConfig};
use rdfu_core::transfer::{self, Action, NoProgress, TransferFlags, TransferProgress};
use rdfu_core::transport::TransportError;
use rdfu_core::{DfuDevice, DfuTransport, Error};
use rdfu_dummy::{DummyConfig, DummyDfu};

fn open_target(dev: &mut DummyDfu) -> DfuTarget {
    let iface = dev.interfaces().remove(0);
    let mut target = DfuTarget::new(iface, dev.usb_ids(), TargetConfig::default());
    target.open(dev, OpenFlags::empty()).unwrap();
    target
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn image_at(data: Vec<u8>, address: u32) -> Image {
    Image::from_element(Element::with_address(data, address))
}

fn dfuse_config(name: &str) -> DummyConfig {
    DummyConfig {
        alt_names: vec![name.to_string()],
        ..DummyConfig::dfuse()
    }
}

#[test]
fn test_download_chunk_count() {
    for (len, expected) in [(200usize, 5usize), (256, 5), (1, 2), (64, 2), (0, 1)] {
        let mut dev = DummyDfu::new_default();
        let mut target = open_target(&mut dev);
        let image = image_at(pattern(len), 0);

        transfer::download(
            &mut dev,
            &mut target,
            &image,
            TransferFlags::empty(),
            &mut NoProgress,
        )
        .unwrap();

        let dnloads = dev.data_downloads();
        assert_eq!(dnloads.len(), expected, "element of {} bytes", len);
        assert!(dnloads.last().unwrap().data.is_empty());
        for (i, req) in dnloads.iter().enumerate() {
            assert_eq!(req.value as usize, i);
        }
        assert_eq!(dev.memory(0), &pattern(len)[..]);
    }
}

#[test]
fn test_dfuse_download_erases_each_sector_once() {
    let mut dev = DummyDfu::new(DummyConfig::dfuse());
    let mut target = open_target(&mut dev);
    let data = pattern(3000);
    let image = image_at(data.clone(), 0x0800_0000);

    transfer::download(
        &mut dev,
        &mut target,
        &image,
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap();

    assert_eq!(
        dev.erased_pages(),
        &[0x0800_0000, 0x0800_0400, 0x0800_0800]
    );
    // 3000 bytes in 256-byte chunks plus the terminator, from block 2
    let dnloads = dev.data_downloads();
    assert_eq!(dnloads.len(), 3000usize.div_ceil(256) + 1);
    assert_eq!(dnloads[0].value, 2);
    assert_eq!(dnloads.last().unwrap().value, 2 + 12);
    assert!(!dev.address_pointers().is_empty());
    assert!(dev
        .address_pointers()
        .iter()
        .all(|&a| a == 0x0800_0000));
    assert_eq!(dev.read(0x0800_0000, 3000), Some(&data[..]));
}

#[test]
fn test_dfuse_set_address_on_group_change_without_erase() {
    let mut dev = DummyDfu::new(dfuse_config("@Flash /0x08000000/2*1Ke,2*1Ke"));
    let mut target = open_target(&mut dev);
    let data = pattern(3072);

    transfer::download(
        &mut dev,
        &mut target,
        &image_at(data.clone(), 0x0800_0000),
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap();

    assert!(dev.erased_pages().is_empty());
    // once up front and once entering the second sector token
    assert_eq!(dev.address_pointers(), vec![0x0800_0000, 0x0800_0000]);
    let dnloads: Vec<u16> = dev
        .requests()
        .iter()
        .filter(|r| r.request == Request::Dnload.code())
        .map(|r| r.value)
        .collect();
    let second = dnloads
        .iter()
        .enumerate()
        .filter(|(_, &v)| v == 0)
        .nth(1)
        .map(|(i, _)| i)
        .unwrap();
    // 2048 bytes in, the ninth 256-byte chunk
    assert_eq!(dnloads[second + 1], 2 + 8);
    assert_eq!(dev.read(0x0800_0000, 3072), Some(&data[..]));
}

#[test]
fn test_erase_state_does_not_leak_between_downloads() {
    let mut dev = DummyDfu::new(DummyConfig::dfuse());
    let mut target = open_target(&mut dev);
    let image = image_at(pattern(100), 0x0800_0400);

    for _ in 0..2 {
        transfer::download(
            &mut dev,
            &mut target,
            &image,
            TransferFlags::empty(),
            &mut NoProgress,
        )
        .unwrap();
    }
    assert_eq!(dev.erased_pages(), &[0x0800_0400, 0x0800_0400]);
    assert_eq!(dev.read(0x0800_0400, 100), Some(&pattern(100)[..]));
}

#[test]
fn test_chunk_spanning_sectors_erases_both() {
    let mut dev = DummyDfu::new(DummyConfig {
        transfer_size: 2048,
        ..DummyConfig::dfuse()
    });
    let mut target = open_target(&mut dev);
    let image = image_at(pattern(1500), 0x0800_0000);

    transfer::download(
        &mut dev,
        &mut target,
        &image,
        TransferFlags::VERIFY,
        &mut NoProgress,
    )
    .unwrap();
    assert_eq!(dev.erased_pages(), &[0x0800_0000, 0x0800_0400]);
}

#[test]
fn test_dfuse_verify() {
    let mut dev = DummyDfu::new(DummyConfig::dfuse());
    let mut target = open_target(&mut dev);
    let image = image_at(pattern(700), 0x0800_0000);

    transfer::download(
        &mut dev,
        &mut target,
        &image,
        TransferFlags::VERIFY,
        &mut NoProgress,
    )
    .unwrap();
    assert!(dev.count(Request::Upload) >= 3);
}

#[test]
fn test_verify_mismatch() {
    let mut dev = DummyDfu::new(DummyConfig::dfuse());
    dev.set_stuck_byte(0x0800_0010, 0x00);
    let mut target = open_target(&mut dev);
    let image = image_at(vec![0xaa; 64], 0x0800_0000);

    let err = transfer::download(
        &mut dev,
        &mut target,
        &image,
        TransferFlags::VERIFY,
        &mut NoProgress,
    )
    .unwrap_err();
    match err {
        Error::VerifyFailed(msg) => assert_eq!(msg, "got 0x00, expected 0xaa @ 0x0010"),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_upload_reconstructs_image() {
    let data = pattern(300);
    let mut dev = DummyDfu::with_data(DummyConfig::default(), &data);
    let mut target = open_target(&mut dev);

    let image = transfer::upload(
        &mut dev,
        &mut target,
        300,
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap();
    assert_eq!(image.elements().len(), 1);
    assert_eq!(image.elements()[0].contents(), &data[..]);
    // four full chunks and one short one
    assert_eq!(dev.count(Request::Upload), 5);
}

#[test]
fn test_upload_size_mismatch() {
    let mut dev = DummyDfu::with_data(DummyConfig::default(), &pattern(300));
    let mut target = open_target(&mut dev);

    let err = transfer::upload(
        &mut dev,
        &mut target,
        400,
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::SizeMismatch {
            expected: 400,
            actual: 300
        }
    ));
}

#[test]
fn test_dfuse_upload_per_sector_group() {
    let config = dfuse_config("@Internal Flash /0x08000000/4*1Kg,4*2Ka");
    let mut dev = DummyDfu::with_data(config, &pattern(12 * 1024));
    let mut target = open_target(&mut dev);

    let image = transfer::upload(
        &mut dev,
        &mut target,
        0,
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap();
    let elements = image.elements();
    assert_eq!(elements.len(), 2);
    assert_eq!(elements[0].address(), 0x0800_0000);
    assert_eq!(elements[0].len(), 4 * 1024);
    assert_eq!(elements[1].address(), 0x0800_1000);
    assert_eq!(elements[1].len(), 8 * 1024);
    assert_eq!(elements[1].contents(), &pattern(12 * 1024)[4 * 1024..]);
    assert_eq!(image.name(), Some("@Internal Flash /0x08000000/4*1Kg,4*2Ka"));
}

#[test]
fn test_dfuse_upload_skips_unreadable_groups() {
    let config = dfuse_config("@Flash /0x08000000/2*1Kd,2*1Ka");
    let mut dev = DummyDfu::new(config);
    let mut target = open_target(&mut dev);

    let image = transfer::upload(
        &mut dev,
        &mut target,
        0,
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap();
    assert_eq!(image.elements().len(), 1);
    assert_eq!(image.elements()[0].address(), 0x0800_0800);

    let err = transfer::upload_element(&mut dev, &mut target, 0x0800_0000, 16, &mut NoProgress)
        .unwrap_err();
    assert!(matches!(err, Error::SectorNotReadable(0x0800_0000)));
}

#[test]
fn test_read_protection_message() {
    let mut dev = DummyDfu::new(DummyConfig::dfuse());
    dev.set_read_protected(true);
    let mut target = open_target(&mut dev);
    let image = image_at(pattern(16), 0x0800_0000);

    let err = transfer::download(
        &mut dev,
        &mut target,
        &image,
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap_err();
    match err {
        Error::DeviceStatus { status, message } => {
            assert_eq!(status, DfuStatus::ErrVendor);
            assert_eq!(message, "Read protection is active");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(dev.state(), DfuState::DfuError);

    // remove protection and try again
    dev.set_read_protected(false);
    target.clear_status(&mut dev).unwrap();
    transfer::download(
        &mut dev,
        &mut target,
        &image,
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap();
}

#[test]
fn test_device_status_description() {
    let mut dev = DummyDfu::new_default();
    dev.fail_next_download(DfuStatus::ErrWrite);
    let mut target = open_target(&mut dev);
    let image = image_at(pattern(10), 0);

    let err = transfer::download(
        &mut dev,
        &mut target,
        &image,
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::DeviceStatus {
            status: DfuStatus::ErrWrite,
            message: "device is unable to write memory"
        }
    ));
}

#[test]
fn test_sector_checks() {
    let mut dev = DummyDfu::new(DummyConfig::dfuse());
    let mut target = open_target(&mut dev);
    let err = transfer::download(
        &mut dev,
        &mut target,
        &image_at(pattern(16), 0x0900_0000),
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap_err();
    assert!(matches!(err, Error::NoSectorAtAddress(0x0900_0000)));

    let mut dev = DummyDfu::new(dfuse_config("@Flash /0x08000000/4*1Ka"));
    let mut target = open_target(&mut dev);
    let err = transfer::download(
        &mut dev,
        &mut target,
        &image_at(pattern(16), 0x0800_0000),
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap_err();
    assert!(matches!(err, Error::SectorNotWritable(0x0800_0000)));
    assert!(dev.data_downloads().is_empty());
}

struct CancelAfter {
    percentages: usize,
    limit: usize,
}

impl TransferProgress for CancelAfter {
    fn action_changed(&mut self, _action: Action) {}

    fn percentage_changed(&mut self, _percentage: u8) {
        self.percentages += 1;
    }

    fn is_cancelled(&self) -> bool {
        self.percentages >= self.limit
    }
}

#[test]
fn test_cancellation_between_chunks() {
    let mut dev = DummyDfu::new_default();
    let mut target = open_target(&mut dev);
    let image = image_at(pattern(640), 0);
    let mut progress = CancelAfter {
        percentages: 0,
        limit: 2,
    };

    let err = transfer::download(
        &mut dev,
        &mut target,
        &image,
        TransferFlags::empty(),
        &mut progress,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(dev.data_downloads().len(), 2);
}

#[derive(Default)]
struct Recorder {
    actions: Vec<Action>,
    percentages: Vec<u8>,
}

impl TransferProgress for Recorder {
    fn action_changed(&mut self, action: Action) {
        self.actions.push(action);
    }

    fn percentage_changed(&mut self, percentage: u8) {
        self.percentages.push(percentage);
    }
}

#[test]
fn test_progress_order() {
    let mut dev = DummyDfu::new_default();
    let mut target = open_target(&mut dev);
    let image = image_at(pattern(256), 0);
    let mut progress = Recorder::default();

    transfer::download(
        &mut dev,
        &mut target,
        &image,
        TransferFlags::empty(),
        &mut progress,
    )
    .unwrap();
    assert_eq!(progress.actions, vec![Action::Write, Action::Idle]);
    assert_eq!(progress.percentages, vec![25, 50, 75, 100]);
}

#[test]
fn test_busy_device_is_polled() {
    let mut dev = DummyDfu::new(DummyConfig {
        busy_polls: 2,
        poll_timeout_ms: 10,
        ..DummyConfig::default()
    });
    let mut target = open_target(&mut dev);
    let image = image_at(pattern(64), 0);

    transfer::download(
        &mut dev,
        &mut target,
        &image,
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap();
    // one data chunk, each answered busy twice
    assert!(dev.delayed().as_millis() >= 20);
    assert!(dev.count(Request::GetStatus) >= 4);
}

#[test]
fn test_open_recovers_stale_state() {
    let mut dev = DummyDfu::new_default();
    dev.set_state(DfuState::DfuUploadIdle, DfuStatus::Ok);
    let _target = open_target(&mut dev);
    assert_eq!(dev.count(Request::Abort), 1);
    assert_eq!(dev.state(), DfuState::DfuIdle);

    let mut dev = DummyDfu::new_default();
    dev.set_state(DfuState::DfuError, DfuStatus::ErrProg);
    let _target = open_target(&mut dev);
    assert_eq!(dev.count(Request::ClrStatus), 1);

    let mut dev = DummyDfu::new_default();
    dev.set_state(DfuState::DfuError, DfuStatus::ErrProg);
    let iface = dev.interfaces().remove(0);
    let mut target = DfuTarget::new(iface, dev.usb_ids(), TargetConfig::default());
    target.open(&mut dev, OpenFlags::NO_AUTO_REFRESH).unwrap();
    assert_eq!(dev.count(Request::GetStatus), 0);
    assert_eq!(dev.count(Request::ClrStatus), 0);
}

#[test]
fn test_disconnect_is_reported_with_context() {
    let mut dev = DummyDfu::new_default();
    let mut target = open_target(&mut dev);
    dev.disconnect();

    let err = transfer::download(
        &mut dev,
        &mut target,
        &image_at(pattern(10), 0),
        TransferFlags::empty(),
        &mut NoProgress,
    )
    .unwrap_err();
    assert!(err.to_string().starts_with("cannot download block 0"));
    assert_eq!(err.kind(), rdfu_core::ErrorKind::InvalidDevice);
}

#[test]
fn test_end_to_end_dfu_file() {
    let blob = pattern(256);
    let mut firmware = Firmware::from_image(Image::from_element(Element::new(blob.clone())), Format::Dfu1_0);
    firmware.set_vid(0x1234);
    firmware.set_pid(0x5678);
    firmware.set_release(0xfedc);

    let bytes = firmware.write().unwrap();
    let parsed = Firmware::parse(&bytes, ParseFlags::empty()).unwrap();
    assert_eq!(parsed.vid(), 0x1234);
    assert_eq!(parsed.pid(), 0x5678);
    assert_eq!(parsed.release(), 0xfedc);
    assert_eq!(parsed.size(), 256);
    assert_eq!(parsed.format(), Format::Dfu1_0);

    let dev = DummyDfu::new(DummyConfig {
        release: 0xfedc,
        ..DummyConfig::default()
    });
    let mut device = DfuDevice::new(dev, TargetConfig::default()).unwrap();
    device
        .download(&parsed, TransferFlags::VERIFY, &mut NoProgress)
        .unwrap();
    assert_eq!(device.transport().memory(0), &blob[..]);

    let uploaded = device.upload(TransferFlags::empty(), &mut NoProgress).unwrap();
    assert_eq!(uploaded.format(), Format::Dfu1_0);
    assert_eq!(uploaded.vid(), 0x1234);
    assert_eq!(uploaded.pid(), 0x5678);
    assert_eq!(uploaded.release(), 0xfedc);
    assert_eq!(uploaded.size(), 256);

    let again = Firmware::parse(&uploaded.write().unwrap(), ParseFlags::empty()).unwrap();
    assert_eq!(again.images()[0].elements()[0].contents(), &blob[..]);
}

#[test]
fn test_device_checks_ids() {
    let mut firmware = Firmware::from_image(image_at(pattern(32), 0), Format::Dfu1_0);
    firmware.set_vid(0x0483);

    let mut device = DfuDevice::new(DummyDfu::new_default(), TargetConfig::default()).unwrap();
    let err = device
        .download(&firmware, TransferFlags::empty(), &mut NoProgress)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidDevice(_)));

    device
        .download(&firmware, TransferFlags::WILDCARD_VID, &mut NoProgress)
        .unwrap();
    assert_eq!(device.transport().memory(0), &pattern(32)[..]);
}

#[test]
fn test_device_dfuse_multi_target() {
    let config = DummyConfig {
        alt_names: vec![
            "@Internal Flash /0x08000000/4*1Kg".to_string(),
            "@Option Bytes /0x1FFFC000/1*16 e".to_string(),
        ],
        ..DummyConfig::dfuse()
    };
    let mut device = DfuDevice::new(DummyDfu::new(config), TargetConfig::default()).unwrap();
    device.open(OpenFlags::empty()).unwrap();
    assert_eq!(device.targets().len(), 2);
    assert_eq!(
        device.target_by_name("Option Bytes").unwrap().alt_setting(),
        1
    );
    assert!(matches!(
        device.target_by_alt_setting(7),
        Err(Error::NotFound(_))
    ));

    let mut firmware = Firmware::new();
    firmware.set_format(Format::DfuSe);
    firmware.add_image(image_at(pattern(2000), 0x0800_0000));
    device
        .download(&firmware, TransferFlags::VERIFY, &mut NoProgress)
        .unwrap();

    let uploaded = device.upload(TransferFlags::empty(), &mut NoProgress).unwrap();
    assert_eq!(uploaded.format(), Format::DfuSe);
    assert_eq!(uploaded.images().len(), 2);
    assert_eq!(uploaded.images()[1].alt_setting(), 1);
    assert_eq!(
        &uploaded.images()[0].elements()[0].contents()[..2000],
        &pattern(2000)[..]
    );
}

#[test]
fn test_detach_and_attach() {
    let mut device = DfuDevice::new(
        DummyDfu::new(DummyConfig {
            runtime: true,
            ..DummyConfig::default()
        }),
        TargetConfig::default(),
    )
    .unwrap();
    device.detach().unwrap();
    assert!(!device.transport().is_runtime());
    assert_eq!(device.transport().resets(), 1);
    assert_eq!(device.transport().count(Request::Detach), 1);

    let mut device = DfuDevice::new(DummyDfu::new(DummyConfig::dfuse()), TargetConfig::default()).unwrap();
    device.attach().unwrap();
    assert!(device.transport().manifested());
    assert_eq!(device.transport().resets(), 0);
}

#[test]
fn test_download_then_wait_runtime() {
    let mut dev = DummyDfu::new_default();
    let mut target = open_target(&mut dev);
    transfer::download(
        &mut dev,
        &mut target,
        &image_at(pattern(10), 0),
        TransferFlags::WAIT_RUNTIME,
        &mut NoProgress,
    )
    .unwrap();
    assert_eq!(dev.resets(), 1);
    assert!(dev.is_runtime());
    assert_eq!(dev.usb_ids().pid, 0x5679);
}

#[test]
fn test_wait_runtime_rejects_identical_ids() {
    let mut dev = DummyDfu::new(DummyConfig {
        runtime_pid: None,
        ..DummyConfig::default()
    });
    let mut target = open_target(&mut dev);
    let err = transfer::download(
        &mut dev,
        &mut target,
        &image_at(pattern(10), 0),
        TransferFlags::WAIT_RUNTIME,
        &mut NoProgress,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::Transport {
            source: TransportError::Other(_),
            ..
        }
    ));
    assert!(dev.is_runtime());
    assert_eq!(dev.usb_ids().pid, 0x5678);
}

#[test]
fn test_detach_replug_changes_ids() {
    let mut dev = DummyDfu::new(DummyConfig {
        runtime: true,
        ..DummyConfig::dfuse()
    });
    assert_eq!(dev.usb_ids().pid, 0x5740);
    assert!(matches!(
        dev.wait_for_replug(std::time::Duration::from_secs(1)),
        Err(TransportError::Timeout)
    ));

    let mut device = DfuDevice::new(dev, TargetConfig::default()).unwrap();
    device.detach().unwrap();
    device
        .transport_mut()
        .wait_for_replug(std::time::Duration::from_secs(1))
        .unwrap();
    assert_eq!(device.transport().usb_ids().pid, 0xdf11);
}
