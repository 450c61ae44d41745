// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

// Each test binary only uses part of this module.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    fmt::Write as _,
    io,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use memchr::memmem;
use tabpatch::{
    crypto::{self, KeyRing, PassphraseSource, RsaSigningKey},
    device::{
        PartitionTable, Transport,
        firehose::{self, Element, SectorRange},
        sahara::{self, Packet},
    },
    format::{
        avb::{Descriptor, HashDescriptor, Header},
        image::PartitionImage,
        rawprogram,
    },
};

pub const SECTOR_SIZE: u32 = 4096;

pub fn test_key() -> RsaSigningKey {
    let data = include_str!("../keys/test_rsa4096.pem");
    crypto::parse_pem_key(data, &PassphraseSource::None).unwrap()
}

pub fn other_key() -> RsaSigningKey {
    let data = include_str!("../keys/test_rsa2048.pem");
    crypto::parse_pem_key(data, &PassphraseSource::None).unwrap()
}

/// Key ring holding [`test_key`], which is also the fallback.
pub fn test_key_ring() -> KeyRing {
    let mut keys = KeyRing::new();
    let fingerprint = keys.insert(test_key()).unwrap();
    keys.set_fallback(Some(fingerprint));
    keys
}

pub fn hash_descriptor(partition: &str, data: &[u8]) -> HashDescriptor {
    let mut descriptor = HashDescriptor {
        image_size: 0,
        hash_algorithm: "sha256".to_owned(),
        partition_name: partition.to_owned(),
        salt: vec![0xa5; 32],
        root_digest: vec![],
        flags: 0,
        reserved: [0u8; 60],
    };
    descriptor.update(data).unwrap();
    descriptor
}

fn signed_header(
    descriptors: Vec<Descriptor>,
    rollback_index: u64,
    key: Option<&RsaSigningKey>,
) -> Header {
    let mut header = Header {
        descriptors,
        rollback_index,
        ..Default::default()
    };

    if let Some(key) = key {
        header.set_algo_for_key(key).unwrap();
        header.sign(key).unwrap();
    }

    header
}

/// An appended image protected by a hash descriptor.
pub fn appended_image(
    partition: &str,
    payload: &[u8],
    partition_size: u64,
    rollback_index: u64,
    key: Option<&RsaSigningKey>,
) -> PartitionImage {
    let descriptor = hash_descriptor(partition, payload);
    let header = signed_header(vec![Descriptor::Hash(descriptor)], rollback_index, key);

    PartitionImage::assemble_appended(payload.to_vec(), &header, partition_size).unwrap()
}

/// A root vbmeta image padded with zeros to `size`.
pub fn vbmeta_image(
    descriptors: Vec<Descriptor>,
    rollback_index: u64,
    key: Option<&RsaSigningKey>,
    size: usize,
) -> PartitionImage {
    let header = signed_header(descriptors, rollback_index, key);
    let mut data = header.to_bytes().unwrap();
    assert!(data.len() <= size);
    data.resize(size, 0);

    PartitionImage::parse(data).unwrap()
}

/// A partition in the simulated device's program XML. Everything lives on
/// LUN 0.
#[derive(Clone, Copy, Debug)]
pub struct Part {
    pub label: &'static str,
    pub filename: &'static str,
    pub start_sector: u64,
    pub num_sectors: u64,
}

impl Part {
    pub fn size(&self) -> usize {
        self.num_sectors as usize * SECTOR_SIZE as usize
    }
}

pub const PARTS: &[Part] = &[
    Part {
        label: "abl_a",
        filename: "abl.elf",
        start_sector: 8,
        num_sectors: 2,
    },
    Part {
        label: "devinfo",
        filename: "",
        start_sector: 16,
        num_sectors: 1,
    },
    Part {
        label: "persist",
        filename: "",
        start_sector: 20,
        num_sectors: 2,
    },
    Part {
        label: "boot_a",
        filename: "boot.img",
        start_sector: 32,
        num_sectors: 16,
    },
    Part {
        label: "vbmeta_a",
        filename: "vbmeta.img",
        start_sector: 48,
        num_sectors: 2,
    },
    Part {
        label: "vbmeta_system_a",
        filename: "vbmeta_system.img",
        start_sector: 56,
        num_sectors: 2,
    },
    Part {
        label: "vendor_boot_a",
        filename: "vendor_boot.img",
        start_sector: 64,
        num_sectors: 16,
    },
    Part {
        label: "userdata",
        filename: "userdata.img",
        start_sector: 96,
        num_sectors: 4,
    },
];

pub fn part(label: &str) -> &'static Part {
    PARTS.iter().find(|p| p.label == label).unwrap()
}

pub fn program_xml(parts: &[Part]) -> String {
    let mut xml = "<?xml version=\"1.0\" ?>\n<data>\n".to_owned();

    for p in parts {
        writeln!(
            xml,
            "  <program SECTOR_SIZE_IN_BYTES=\"{SECTOR_SIZE}\" file_sector_offset=\"0\" \
             filename=\"{}\" label=\"{}\" num_partition_sectors=\"{}\" \
             physical_partition_number=\"0\" size_in_KB=\"{}.0\" start_sector=\"{}\"/>",
            p.filename,
            p.label,
            p.num_sectors,
            p.size() / 1024,
            p.start_sector,
        )
        .unwrap();
    }

    xml.push_str("</data>\n");
    xml
}

pub fn partition_table(parts: &[Part]) -> PartitionTable {
    let entries = rawprogram::parse(&program_xml(parts)).unwrap();
    PartitionTable::from_entries(&entries)
}

/// Loader bytes served to the simulated device.
pub fn loader() -> Vec<u8> {
    (0..10_000u32).map(|i| (i % 251) as u8).collect()
}

const LOADER_CHUNK: usize = 4096;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Sahara,
    Firehose,
}

#[derive(Debug, Default)]
pub struct SimState {
    /// Whether a device is attached. Opening fails with `NotFound` if not.
    pub present: bool,
    /// Never send the Sahara hello.
    pub silent: bool,
    /// Largest payload the programmer accepts. Larger requests are NAKed.
    pub supported_payload: Option<usize>,
    /// Raw bytes accepted before the connection breaks.
    pub raw_budget: Option<usize>,

    pub open: bool,
    pub loader_len: usize,
    pub loader: Vec<u8>,
    pub configure_attempts: usize,
    /// Tags of every Firehose command received.
    pub commands: Vec<String>,
    /// `(start_sector, bytes)` of every completed program command.
    pub writes: Vec<(u64, usize)>,
    pub reset: bool,
    pub storage: Vec<u8>,

    phase: Phase,
    input: Vec<u8>,
    output: VecDeque<u8>,
    loader_pending: usize,
    program: Option<Program>,
}

#[derive(Clone, Copy, Debug)]
struct Program {
    start_sector: u64,
    offset: usize,
    written: usize,
    remaining: usize,
}

fn response(ack: bool) -> Element {
    Element::new("response").with("value", if ack { "ACK" } else { "NAK" })
}

impl SimState {
    fn queue(&mut self, data: &[u8]) {
        self.output.extend(data);
    }

    fn queue_packet(&mut self, packet: &Packet) {
        self.queue(&packet.to_bytes());
    }

    fn respond(&mut self, element: &Element) {
        self.queue(&element.to_document());
    }

    fn request_loader(&mut self) {
        let offset = self.loader.len();

        if offset >= self.loader_len {
            self.queue_packet(&Packet::EndImageTransfer {
                image_id: 13,
                status: 0,
            });
            return;
        }

        let length = (self.loader_len - offset).min(LOADER_CHUNK);
        self.loader_pending = length;

        // Exercise both request variants.
        let packet = if offset == 0 {
            Packet::ReadData64 {
                image_id: 13,
                offset: offset as u64,
                length: length as u64,
            }
        } else {
            Packet::ReadData {
                image_id: 13,
                offset: offset as u32,
                length: length as u32,
            }
        };
        self.queue_packet(&packet);
    }

    fn handle_sahara(&mut self) {
        loop {
            if self.loader_pending > 0 {
                let n = self.loader_pending.min(self.input.len());
                if n == 0 {
                    return;
                }

                let data = self.input.drain(..n).collect::<Vec<_>>();
                self.loader.extend_from_slice(&data);
                self.loader_pending -= n;

                if self.loader_pending == 0 {
                    self.request_loader();
                }
                continue;
            }

            let header_size = sahara::HEADER_SIZE as usize;
            if self.input.len() < header_size {
                return;
            }

            let header = <[u8; 8]>::try_from(&self.input[..header_size]).unwrap();
            let (command, length) = Packet::parse_header(header).unwrap();
            if self.input.len() < length as usize {
                return;
            }

            let raw = self.input.drain(..length as usize).collect::<Vec<_>>();

            match Packet::parse(command, &raw[header_size..]).unwrap() {
                Packet::HelloResponse { .. } => self.request_loader(),
                Packet::Done => {
                    self.queue_packet(&Packet::DoneResponse { status: 0 });
                    self.phase = Phase::Firehose;
                    return;
                }
                p => panic!("Unexpected Sahara packet: {p:?}"),
            }
        }
    }

    fn handle_element(&mut self, element: &Element) {
        self.commands.push(element.tag.clone());

        match element.tag.as_str() {
            "configure" => {
                self.configure_attempts += 1;
                self.respond(&Element::new("log").with("value", "Configuring storage"));

                let requested = element
                    .int_attr::<usize>("MaxPayloadSizeToTargetInBytes")
                    .unwrap();

                match self.supported_payload {
                    Some(s) if requested > s => self.respond(
                        &response(false).with("MaxPayloadSizeToTargetInBytesSupported", s),
                    ),
                    _ => self.respond(
                        &response(true).with("MaxPayloadSizeToTargetInBytes", requested),
                    ),
                }
            }
            "read" => {
                let range = SectorRange::from_element(element).unwrap();
                let start = (range.start_sector * u64::from(range.sector_size)) as usize;
                let end = start + range.byte_len() as usize;

                if end > self.storage.len() {
                    self.respond(&response(false));
                    return;
                }

                let data = self.storage[start..end].to_vec();
                self.respond(&response(true).with("rawmode", "true"));
                self.queue(&data);
                self.respond(&response(true).with("rawmode", "false"));
            }
            "program" => {
                let range = SectorRange::from_element(element).unwrap();
                let offset = (range.start_sector * u64::from(range.sector_size)) as usize;
                let len = range.byte_len() as usize;

                if offset + len > self.storage.len() {
                    self.respond(&response(false));
                    return;
                }

                self.program = Some(Program {
                    start_sector: range.start_sector,
                    offset,
                    written: 0,
                    remaining: len,
                });
                self.respond(&response(true).with("rawmode", "true"));
            }
            "power" => {
                self.reset = true;
                self.respond(&response(true));
            }
            _ => self.respond(&response(false)),
        }
    }

    fn handle_firehose(&mut self) {
        loop {
            if let Some(mut program) = self.program {
                let n = program.remaining.min(self.input.len());
                if n == 0 {
                    return;
                }

                let offset = program.offset + program.written;
                let data = self.input.drain(..n).collect::<Vec<_>>();
                self.storage[offset..offset + n].copy_from_slice(&data);
                program.written += n;
                program.remaining -= n;

                if program.remaining == 0 {
                    self.program = None;
                    self.writes.push((program.start_sector, program.written));
                    self.respond(&response(true).with("rawmode", "false"));
                } else {
                    self.program = Some(program);
                }
                continue;
            }

            let Some(pos) = memmem::find(&self.input, b"</data>") else {
                return;
            };

            let document = self.input.drain(..pos + 7).collect::<Vec<_>>();
            let document = String::from_utf8(document).unwrap();

            for element in firehose::parse_document(&document).unwrap() {
                self.handle_element(&element);
            }
        }
    }
}

/// A device in download mode that speaks just enough Sahara and Firehose to
/// serve a session. Clones share the same device.
#[derive(Clone, Debug)]
pub struct SimDevice(Arc<Mutex<SimState>>);

impl SimDevice {
    /// A device with [`PARTS`] laid out on a zeroed disk.
    pub fn new() -> Self {
        let disk_sectors = PARTS
            .iter()
            .map(|p| p.start_sector + p.num_sectors)
            .max()
            .unwrap_or(0);

        Self(Arc::new(Mutex::new(SimState {
            present: true,
            loader_len: loader().len(),
            storage: vec![0u8; disk_sectors as usize * SECTOR_SIZE as usize],
            ..Default::default()
        })))
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap()
    }

    /// Fill a partition. The rest of it is zeroed.
    pub fn fill(&self, label: &str, data: &[u8]) {
        let p = part(label);
        assert!(data.len() <= p.size());

        let offset = p.start_sector as usize * SECTOR_SIZE as usize;
        let mut state = self.state();
        let region = &mut state.storage[offset..offset + p.size()];
        region.fill(0);
        region[..data.len()].copy_from_slice(data);
    }

    pub fn contents(&self, label: &str) -> Vec<u8> {
        let p = part(label);
        let offset = p.start_sector as usize * SECTOR_SIZE as usize;

        self.state().storage[offset..offset + p.size()].to_vec()
    }

    /// Labels of the partitions written, in order.
    pub fn written_labels(&self) -> Vec<&'static str> {
        self.state()
            .writes
            .iter()
            .filter_map(|(start, _)| PARTS.iter().find(|p| p.start_sector == *start))
            .map(|p| p.label)
            .collect()
    }
}

impl Transport for SimDevice {
    fn open(&mut self) -> io::Result<()> {
        let mut state = self.state();
        if !state.present {
            return Err(io::Error::new(io::ErrorKind::NotFound, "No 9008 device"));
        }

        state.open = true;
        state.phase = Phase::Sahara;
        state.input.clear();
        state.output.clear();
        state.loader.clear();
        state.loader_pending = 0;
        state.program = None;
        state.reset = false;

        if !state.silent {
            state.queue_packet(&Packet::Hello {
                version: sahara::VERSION,
                version_compatible: sahara::VERSION_COMPATIBLE,
                max_len: 4096,
                mode: sahara::MODE_IMAGE_TX_PENDING,
            });
        }

        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut state = self.state();
        if state.output.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "No data"));
        }

        let n = buf.len().min(state.output.len());
        for (dst, src) in buf.iter_mut().zip(state.output.drain(..n)) {
            *dst = src;
        }

        Ok(n)
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> io::Result<()> {
        let mut state = self.state();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "Not open"));
        }

        let mut data = data;
        let mut broken = false;

        if state.program.is_some() {
            if let Some(budget) = state.raw_budget {
                if data.len() > budget {
                    data = &data[..budget];
                    broken = true;
                }
                state.raw_budget = Some(budget - data.len());
            }
        }

        state.input.extend_from_slice(data);

        match state.phase {
            Phase::Sahara => state.handle_sahara(),
            Phase::Firehose => state.handle_firehose(),
        }

        if broken {
            state.open = false;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Cable pulled"));
        }

        Ok(())
    }

    fn close(&mut self) {
        self.state().open = false;
    }
}
