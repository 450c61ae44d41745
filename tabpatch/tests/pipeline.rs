// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::{
    collections::BTreeMap,
    fs,
    sync::{Arc, atomic::AtomicBool},
};

use memchr::memmem;
use tabpatch::{
    config::Config,
    crypto::KeyRing,
    device::Transport,
    format::{
        bootimage::{BootImage, BootImageV3Through4},
        image::PartitionImage,
        rawprogram,
    },
    patch::{kernel, region::CountryCode, sign},
    pipeline::{Pipeline, Status, Task, TaskReport, TaskSettings, WorkDir, Workspace},
};
use tempfile::TempDir;

use common::{PARTS, SimDevice};

const LOADER: &str = "xbl_s_devprg_ns.melf";

struct Fixture {
    _temp_dir: TempDir,
    workspace: Workspace,
}

impl Fixture {
    fn new() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(temp_dir.path());

        Self {
            _temp_dir: temp_dir,
            workspace,
        }
    }

    fn write(&self, dir: WorkDir, name: &str, data: &[u8]) {
        fs::create_dir_all(self.workspace.dir(dir)).unwrap();
        fs::write(self.workspace.file(dir, name), data).unwrap();
    }

    fn read(&self, dir: WorkDir, name: &str) -> Vec<u8> {
        self.workspace.read(dir, name).unwrap()
    }

    fn image(&self, dir: WorkDir, name: &str) -> PartitionImage {
        PartitionImage::parse(self.read(dir, name)).unwrap()
    }

    fn pipeline_with_keys(&self, settings: TaskSettings, keys: KeyRing) -> Pipeline {
        Pipeline::new(
            self.workspace.clone(),
            Config::builtin().unwrap(),
            keys,
            settings,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn pipeline(&self, settings: TaskSettings) -> Pipeline {
        self.pipeline_with_keys(settings, common::test_key_ring())
    }

    /// Run a task that must not touch the device.
    fn run_offline(&self, task: Task, settings: TaskSettings) -> TaskReport {
        let mut connector = || -> Box<dyn Transport> { panic!("{task} connected to a device") };
        self.pipeline(settings).run(task, &mut connector)
    }

    fn run_device(&self, task: Task, settings: TaskSettings, device: &SimDevice) -> TaskReport {
        let device = device.clone();
        let mut connector = move || -> Box<dyn Transport> { Box::new(device.clone()) };
        self.pipeline(settings).run(task, &mut connector)
    }

    /// Firmware set for the partitions in [`PARTS`].
    fn firmware(&self) {
        let key = common::test_key();

        let vendor_boot = vendor_boot_payload();
        let vbmeta = common::vbmeta_image(
            vec![tabpatch::format::avb::Descriptor::Hash(
                common::hash_descriptor("vendor_boot", &vendor_boot),
            )],
            1,
            Some(&key),
            common::part("vbmeta_a").size(),
        );

        self.write(WorkDir::Image, LOADER, &common::loader());
        self.write(WorkDir::Image, "rawprogram0.xml", common::program_xml(PARTS).as_bytes());
        self.write(WorkDir::Image, "abl.elf", &[0xab; 5000]);
        self.write(WorkDir::Image, "boot.img", boot(3).serialize());
        self.write(WorkDir::Image, "vendor_boot.img", vendor_boot_image().serialize());
        self.write(WorkDir::Image, "vbmeta.img", vbmeta.serialize());
        self.write(WorkDir::Image, "vbmeta_system.img", vbmeta_system(2).serialize());
        self.write(WorkDir::Image, "userdata.img", &[0xdd; 10_000]);
    }
}

fn settings() -> TaskSettings {
    TaskSettings {
        reset_after: true,
        ..Default::default()
    }
}

fn region(code: &str) -> Option<CountryCode> {
    Some(code.parse().unwrap())
}

fn devinfo(code: &[u8; 2]) -> Vec<u8> {
    let mut data = vec![0u8; common::part("devinfo").size()];
    for offset in [0x100, 0x480] {
        let record = [b"\0\0\0".as_slice(), code, b"XX\0\0\0"].concat();
        data[offset..offset + record.len()].copy_from_slice(&record);
    }
    data
}

fn kernel_blob(version: &str) -> Vec<u8> {
    let banner = format!("Linux version {version}-android14 (build@host)");
    let mut data = vec![0x1fu8; 6000];
    data[64..64 + banner.len()].copy_from_slice(banner.as_bytes());
    data
}

fn boot(index: u64) -> PartitionImage {
    let payload = BootImage::V3Through4(BootImageV3Through4 {
        os_version: 0,
        reserved: [0; 4],
        cmdline: String::new(),
        v4_extra: None,
        kernel: kernel_blob("5.15.94"),
        ramdisk: vec![0x22; 3000],
    })
    .to_bytes()
    .unwrap();

    common::appended_image(
        "boot",
        &payload,
        common::part("boot_a").size() as u64,
        index,
        Some(&common::test_key()),
    )
}

fn vbmeta_system(index: u64) -> PartitionImage {
    common::vbmeta_image(
        vec![],
        index,
        Some(&common::test_key()),
        common::part("vbmeta_system_a").size(),
    )
}

fn vendor_boot_payload() -> Vec<u8> {
    let mut data = vec![0u8; 6000];
    data[1000..1004].copy_from_slice(b".ROW");
    data[3000..3012].copy_from_slice(b"feature=IROW");
    data
}

fn vendor_boot_image() -> PartitionImage {
    common::appended_image(
        "vendor_boot",
        &vendor_boot_payload(),
        common::part("vendor_boot_a").size() as u64,
        0,
        Some(&common::test_key()),
    )
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    memmem::find(haystack, needle).is_some()
}

#[test]
fn convert_region() {
    let fixture = Fixture::new();
    fixture.firmware();
    let cancel_signal = AtomicBool::new(false);

    let report = fixture.run_offline(Task::ConvertRegion, settings());
    assert_eq!(report.status, Status::Success, "{}", report.detail);
    assert_eq!(report.outputs.len(), 2);

    let vendor_boot = fixture.image(WorkDir::Output, "vendor_boot.img");
    assert!(contains(vendor_boot.payload(), b".PRC"));
    assert!(contains(vendor_boot.payload(), b"IPRC"));
    assert!(!contains(vendor_boot.payload(), b"ROW"));
    assert_eq!(vendor_boot.len(), vendor_boot_image().len());
    sign::verify_image(&vendor_boot, &cancel_signal).unwrap();

    let vbmeta = fixture.image(WorkDir::Output, "vbmeta.img");
    let contents = BTreeMap::from([("vendor_boot".to_owned(), vendor_boot.payload().to_vec())]);
    sign::verify(vbmeta.header().unwrap(), &contents, &cancel_signal).unwrap();

    // Converting the output again changes nothing.
    fixture.write(WorkDir::Image, "vendor_boot.img", vendor_boot.serialize());
    fixture.write(WorkDir::Image, "vbmeta.img", vbmeta.serialize());
    let report = fixture.run_offline(Task::ConvertRegion, settings());
    assert!(report.is_success());
    assert_eq!(report.detail, "Already converted");
    assert_eq!(fixture.image(WorkDir::Output, "vendor_boot.img"), vendor_boot);
}

#[test]
fn convert_region_without_key() {
    let fixture = Fixture::new();
    fixture.firmware();

    let mut connector = || -> Box<dyn Transport> { panic!("Connected to a device") };
    let report = fixture
        .pipeline_with_keys(settings(), KeyRing::new())
        .run(Task::ConvertRegion, &mut connector);

    assert_eq!(report.status, Status::SignatureError);
    assert_eq!(report.stage.as_deref(), Some("convert"));
    assert!(!fixture.workspace.dir(WorkDir::Output).exists());
}

#[test]
fn missing_inputs() {
    let fixture = Fixture::new();

    for task in [
        Task::ConvertRegion,
        Task::ModifyXml,
        Task::ArbBypass,
        Task::Root,
    ] {
        let report = fixture.run_offline(task, settings());
        assert_eq!(report.status, Status::InputMissing, "{task}");
        assert_eq!(report.stage.as_deref(), Some("inputs"), "{task}");
        assert!(report.outputs.is_empty());
    }

    // The region is checked before the dumps.
    let report = fixture.run_offline(Task::PatchDevinfo, settings());
    assert_eq!(report.status, Status::InputMissing);
    assert!(report.detail.contains("region"), "{}", report.detail);

    for dir in WorkDir::OUTPUTS {
        assert!(!fixture.workspace.dir(dir).exists(), "{dir}");
    }
}

#[test]
fn modify_xml() {
    let fixture = Fixture::new();
    fixture.firmware();

    let report = fixture.run_offline(Task::ModifyXml, settings());
    assert!(report.is_success(), "{}", report.detail);
    assert!(report.detail.contains("skipped 1 user data entries"));

    let xml = String::from_utf8(fixture.read(WorkDir::OutputXml, "rawprogram0.xml")).unwrap();
    let entries = rawprogram::parse(&xml).unwrap();
    let userdata = entries.iter().find(|e| e.label == "userdata").unwrap();
    assert!(userdata.filename.is_empty());
    let boot = entries.iter().find(|e| e.label == "boot_a").unwrap();
    assert_eq!(boot.filename, "boot.img");

    let report = fixture.run_offline(
        Task::ModifyXml,
        TaskSettings {
            wipe: true,
            ..settings()
        },
    );
    assert!(report.is_success());
    assert_eq!(
        fixture.read(WorkDir::OutputXml, "rawprogram0.xml"),
        common::program_xml(PARTS).as_bytes(),
    );
}

#[test]
fn patch_devinfo() {
    let fixture = Fixture::new();
    fixture.write(WorkDir::Backup, "devinfo.img", &devinfo(b"CN"));

    let report = fixture.run_offline(
        Task::PatchDevinfo,
        TaskSettings {
            region: region("KR"),
            ..settings()
        },
    );
    assert!(report.is_success(), "{}", report.detail);
    assert_eq!(report.detail, "devinfo: CN -> KR");
    assert_eq!(fixture.read(WorkDir::OutputDp, "devinfo.img"), devinfo(b"KR"));

    // The backup is never modified.
    assert_eq!(fixture.read(WorkDir::Backup, "devinfo.img"), devinfo(b"CN"));

    // Without any country records.
    fixture.write(WorkDir::Backup, "devinfo.img", &[0u8; 4096]);
    let report = fixture.run_offline(
        Task::PatchDevinfo,
        TaskSettings {
            region: region("KR"),
            ..settings()
        },
    );
    assert_eq!(report.status, Status::FormatError);
    assert_eq!(report.stage.as_deref(), Some("patch"));
    assert_eq!(fixture.read(WorkDir::OutputDp, "devinfo.img"), devinfo(b"KR"));
}

#[test]
fn arb_bypass() {
    let fixture = Fixture::new();
    fixture.firmware();
    fixture.write(WorkDir::Backup, "boot.img", boot(5).serialize());
    fixture.write(WorkDir::Backup, "vbmeta_system.img", vbmeta_system(2).serialize());
    let cancel_signal = AtomicBool::new(false);

    let report = fixture.run_offline(Task::ArbBypass, settings());
    assert!(report.is_success(), "{}", report.detail);
    assert!(report.detail.contains("NeedsPatch"), "{}", report.detail);

    let boot = fixture.image(WorkDir::OutputAntiRollback, "boot.img");
    assert_eq!(boot.header().unwrap().rollback_index, 5);
    assert_eq!(boot.payload(), self::boot(3).payload());
    sign::verify_image(&boot, &cancel_signal).unwrap();

    assert_eq!(
        fixture.read(WorkDir::OutputAntiRollback, "vbmeta_system.img"),
        vbmeta_system(2).serialize(),
    );
}

#[test]
fn root() {
    let fixture = Fixture::new();
    fixture.write(WorkDir::InputRoot, "boot.img", boot(3).serialize());

    let report = fixture.run_offline(Task::Root, settings());
    assert_eq!(report.status, Status::InputMissing);

    fixture.write(WorkDir::InputRoot, "Image", &kernel_blob("6.1.23"));

    let report = fixture.run_offline(Task::Root, settings());
    assert!(report.is_success(), "{}", report.detail);
    assert_eq!(report.detail, "Installed kernel 6.1.23");

    let patched = fixture.image(WorkDir::OutputRoot, "boot.img");
    assert_eq!(patched.len(), boot(3).len());
    let new_boot = kernel::boot_image(&patched).unwrap();
    assert_eq!(new_boot.kernel(), kernel_blob("6.1.23").as_slice());
    sign::verify_image(&patched, &AtomicBool::new(false)).unwrap();
}

#[test]
fn dump() {
    let fixture = Fixture::new();
    fixture.firmware();

    let device = SimDevice::new();
    device.fill("devinfo", &devinfo(b"CN"));
    device.fill("boot_a", boot(5).serialize());
    device.fill("vbmeta_system_a", vbmeta_system(2).serialize());

    let report = fixture.run_device(Task::Dump, settings(), &device);
    assert!(report.is_success(), "{}", report.detail);
    assert_eq!(report.outputs.len(), 4);

    assert_eq!(fixture.read(WorkDir::Backup, "devinfo.img"), devinfo(b"CN"));
    assert_eq!(
        fixture.read(WorkDir::Backup, "persist.img"),
        device.contents("persist"),
    );
    assert_eq!(fixture.image(WorkDir::Backup, "boot.img"), boot(5));
    assert_eq!(
        fixture.image(WorkDir::Backup, "vbmeta_system.img"),
        vbmeta_system(2),
    );

    assert!(device.state().writes.is_empty());
    assert!(device.state().reset);
}

#[test]
fn dump_without_device() {
    let fixture = Fixture::new();
    fixture.firmware();

    let device = SimDevice::new();
    device.state().present = false;

    let report = fixture.run_device(Task::Dump, settings(), &device);
    assert_eq!(report.status, Status::DeviceError);
    assert_eq!(report.stage.as_deref(), Some("connect"));
    assert!(!fixture.workspace.dir(WorkDir::Backup).exists());
}

#[test]
fn flash_order() {
    let fixture = Fixture::new();
    fixture.firmware();

    let plan = fixture.pipeline(settings()).plan().unwrap();
    assert_eq!(
        plan.partitions().collect::<Vec<_>>(),
        ["abl_a", "vbmeta_a", "vbmeta_system_a", "boot_a", "vendor_boot_a"],
    );

    let device = SimDevice::new();
    let report = fixture.run_device(Task::Flash, settings(), &device);
    assert!(report.is_success(), "{}", report.detail);

    assert_eq!(
        device.written_labels(),
        ["abl_a", "vbmeta_a", "vbmeta_system_a", "boot_a", "vendor_boot_a"],
    );
    assert_eq!(&device.contents("abl_a")[..5000], &[0xab; 5000]);
    assert!(device.contents("userdata").iter().all(|b| *b == 0));
    assert!(device.state().reset);
}

#[test]
fn install() {
    let fixture = Fixture::new();
    fixture.firmware();

    let device = SimDevice::new();
    device.fill("devinfo", &devinfo(b"CN"));
    device.fill("boot_a", boot(5).serialize());
    device.fill("vbmeta_system_a", vbmeta_system(2).serialize());

    let report = fixture.run_device(
        Task::Install,
        TaskSettings {
            region: region("KR"),
            ..settings()
        },
        &device,
    );
    assert!(report.is_success(), "{}", report.detail);

    assert_eq!(
        device.written_labels(),
        [
            "abl_a",
            "vbmeta_a",
            "vbmeta_system_a",
            "boot_a",
            "vendor_boot_a",
            "devinfo",
            "userdata",
        ],
    );

    assert_eq!(device.contents("devinfo"), devinfo(b"KR"));

    let boot = PartitionImage::parse(device.contents("boot_a")).unwrap();
    assert_eq!(boot.header().unwrap().rollback_index, 5);

    let vendor_boot = PartitionImage::parse(device.contents("vendor_boot_a")).unwrap();
    assert!(contains(vendor_boot.payload(), b".PRC"));

    assert_eq!(&device.contents("userdata")[..10_000], &[0xdd; 10_000]);
    assert!(device.state().reset);
}

#[test]
fn update_keeps_user_data() {
    let fixture = Fixture::new();
    fixture.firmware();

    let device = SimDevice::new();
    device.fill("devinfo", &devinfo(b"CN"));
    device.fill("boot_a", boot(2).serialize());
    device.fill("vbmeta_system_a", vbmeta_system(2).serialize());

    let report = fixture.run_device(
        Task::Update,
        TaskSettings {
            region: region("KR"),
            ..settings()
        },
        &device,
    );
    assert!(report.is_success(), "{}", report.detail);

    assert!(!device.written_labels().contains(&"userdata"));
    assert!(!device.written_labels().contains(&"devinfo"));
    assert_eq!(device.contents("devinfo"), devinfo(b"CN"));

    // The device index is lower, so the new index is kept.
    let boot = PartitionImage::parse(device.contents("boot_a")).unwrap();
    assert_eq!(boot.header().unwrap().rollback_index, 3);
}

#[test]
fn install_checks_inputs_before_connecting() {
    for name in ["boot.img", "vbmeta_system.img"] {
        let fixture = Fixture::new();
        fixture.firmware();
        fs::remove_file(fixture.workspace.file(WorkDir::Image, name)).unwrap();

        let device = SimDevice::new();
        device.fill("devinfo", &devinfo(b"CN"));
        device.fill("boot_a", boot(5).serialize());
        device.fill("vbmeta_system_a", vbmeta_system(2).serialize());

        let report = fixture.run_device(
            Task::Install,
            TaskSettings {
                region: region("KR"),
                ..settings()
            },
            &device,
        );
        assert_eq!(report.status, Status::InputMissing, "{}", report.detail);
        assert_eq!(report.stage.as_deref(), Some("inputs"));
        assert!(report.detail.contains(name), "{}", report.detail);

        let state = device.state();
        assert!(state.loader.is_empty());
        assert!(state.commands.is_empty());
        assert!(!fixture.workspace.dir(WorkDir::Output).exists());
        assert!(!fixture.workspace.dir(WorkDir::Backup).exists());
    }
}

#[test]
fn rescue() {
    let fixture = Fixture::new();
    fixture.firmware();
    fixture.write(WorkDir::Backup, "devinfo.img", &devinfo(b"CN"));
    fixture.write(WorkDir::Backup, "boot.img", boot(5).serialize());

    let device = SimDevice::new();
    let report = fixture.run_device(Task::Rescue, settings(), &device);
    assert!(report.is_success(), "{}", report.detail);
    assert_eq!(report.detail, "Restored devinfo, boot");

    assert_eq!(device.written_labels(), ["devinfo", "boot_a"]);
    assert_eq!(device.contents("devinfo"), devinfo(b"CN"));
    assert_eq!(device.contents("boot_a"), boot(5).serialize());
}
