// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Cursor, Read, Write},
    mem,
    str::{self, Utf8Error},
};

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    crypto::RsaSigningKey,
    format::{
        avb::{self, Descriptor, Header},
        padding::{self, ZeroPadding},
    },
    stream::{CountingReader, CountingWriter, FromReader, ReadFixedSizeExt, ToWriter},
    util::{self, NumBytes, OutOfBoundsError},
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;
pub const BOOT_EXTRA_ARGS_SIZE: usize = 1024;

/// Page size used by v3 and newer images. Older images declare their own.
pub const PAGE_SIZE: u32 = 4096;

const HDR_V4_SIGNATURE_SIZE: u32 = 4096;

/// Upper limit for any single segment. Whole boot partitions on supported
/// tablets are well below this.
const COMPONENT_MAX_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown boot image format")]
    UnknownFormat,
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Unknown header version: {0}")]
    UnknownHeaderVersion(u32),
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .2.as_bstr())]
    StringNotUtf8(&'static str, #[source] Utf8Error, Vec<u8>),
    #[error("{0:?} field is too long (>{1}): {2:?}")]
    StringTooLong(&'static str, usize, String),
    #[error("{0:?} field is out of bounds")]
    IntOutOfBounds(&'static str, #[source] OutOfBoundsError),
    #[error("Page size must not be zero")]
    PageSizeZero,
    #[error("Invalid header size for boot image type: {0}")]
    InvalidHeaderSize(u32),
    #[error("Failed to read boot image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write boot image data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
    #[error("Boot signature has no hash descriptor")]
    MissingHashDescriptor,
    #[error("Failed to load boot signature")]
    SignatureLoad(#[source] avb::Error),
    #[error("Failed to save boot signature")]
    SignatureSave(#[source] avb::Error),
    #[error("Failed to sign boot signature")]
    SignatureSign(#[source] avb::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub trait BootImageExt {
    fn header_version(&self) -> u32;

    fn header_size(&self) -> u32;

    fn page_size(&self) -> u32;
}

/// On-disk v0 header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV0 {
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_size: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    second_size: little_endian::U32,
    second_addr: little_endian::U32,
    tags_addr: little_endian::U32,
    page_size: little_endian::U32,
    header_version: little_endian::U32,
    os_version: little_endian::U32,
    name: [u8; BOOT_NAME_SIZE],
    cmdline: [u8; BOOT_ARGS_SIZE],
    id: [little_endian::U32; 8],
    extra_cmdline: [u8; BOOT_EXTRA_ARGS_SIZE],
}

/// Fields appended by v1.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV1Extra {
    recovery_dtbo_size: little_endian::U32,
    recovery_dtbo_offset: little_endian::U64,
    header_size: little_endian::U32,
}

/// Fields appended by v2.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV2Extra {
    dtb_size: little_endian::U32,
    dtb_addr: little_endian::U64,
}

/// On-disk v3 header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV3 {
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    ramdisk_size: little_endian::U32,
    os_version: little_endian::U32,
    header_size: little_endian::U32,
    reserved: [little_endian::U32; 4],
    header_version: little_endian::U32,
    cmdline: [u8; BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE],
}

/// Field appended by v4.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV4Extra {
    signature_size: little_endian::U32,
}

fn decode_string(data: &[u8], field: &'static str) -> Result<String> {
    let trimmed = data.trim_end_padding();
    str::from_utf8(trimmed)
        .map(|s| s.to_owned())
        .map_err(|e| Error::StringNotUtf8(field, e, trimmed.to_vec()))
}

fn encode_string<const N: usize>(value: &str, field: &'static str) -> Result<[u8; N]> {
    value
        .as_bytes()
        .to_padded_array::<N>()
        .ok_or_else(|| Error::StringTooLong(field, N, value.to_owned()))
}

fn check_component(size: u32, field: &'static str) -> Result<u32> {
    util::check_bounds(size, ..=COMPONENT_MAX_SIZE).map_err(|e| Error::IntOutOfBounds(field, e))
}

fn check_component_len(data: &[u8], field: &'static str) -> Result<u32> {
    util::check_bounds(data.len(), ..=COMPONENT_MAX_SIZE as usize)
        .map(|s| s as u32)
        .map_err(|e| Error::IntOutOfBounds(field, e))
}

/// Read one segment followed by its alignment padding.
fn read_segment(
    mut reader: &mut CountingReader<impl Read>,
    size: u32,
    page_size: u32,
    field: &'static str,
) -> Result<Vec<u8>> {
    let data = reader
        .read_vec_exact(size as usize)
        .map_err(|e| Error::DataRead(field, e))?;
    padding::read_discard(&mut reader, page_size.into()).map_err(|e| Error::DataRead(field, e))?;

    Ok(data)
}

/// Write one segment followed by zeros up to the next page boundary.
fn write_segment(
    mut writer: &mut CountingWriter<impl Write>,
    data: &[u8],
    page_size: u32,
    field: &'static str,
) -> Result<()> {
    writer
        .write_all(data)
        .map_err(|e| Error::DataWrite(field, e))?;
    padding::write_zeros(&mut writer, page_size.into()).map_err(|e| Error::DataWrite(field, e))?;

    Ok(())
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct V1Extra {
    /// Absolute offset of the recovery DTBO within the image.
    pub recovery_dtbo_offset: u64,
    #[serde(skip)]
    pub recovery_dtbo: Vec<u8>,
}

impl fmt::Debug for V1Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V1Extra")
            .field("recovery_dtbo_offset", &self.recovery_dtbo_offset)
            .field("recovery_dtbo", &NumBytes(self.recovery_dtbo.len()))
            .finish()
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct V2Extra {
    pub dtb_addr: u64,
    #[serde(skip)]
    pub dtb: Vec<u8>,
}

impl fmt::Debug for V2Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V2Extra")
            .field("dtb_addr", &self.dtb_addr)
            .field("dtb", &NumBytes(self.dtb.len()))
            .finish()
    }
}

/// Boot image with a caller-chosen page size. Every segment starts on a page
/// boundary.
#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct BootImageV0Through2 {
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub os_version: u32,
    pub name: String,
    pub cmdline: String,
    pub id: [u32; 8],
    pub extra_cmdline: String,
    #[serde(skip)]
    pub kernel: Vec<u8>,
    #[serde(skip)]
    pub ramdisk: Vec<u8>,
    #[serde(skip)]
    pub second: Vec<u8>,
    pub v1_extra: Option<V1Extra>,
    pub v2_extra: Option<V2Extra>,
}

impl fmt::Debug for BootImageV0Through2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImageV0Through2")
            .field("header_version", &self.header_version())
            .field("page_size", &self.page_size)
            .field("os_version", &self.os_version)
            .field("name", &self.name)
            .field("cmdline", &self.cmdline)
            .field("extra_cmdline", &self.extra_cmdline)
            .field("kernel", &NumBytes(self.kernel.len()))
            .field("ramdisk", &NumBytes(self.ramdisk.len()))
            .field("second", &NumBytes(self.second.len()))
            .field("v1_extra", &self.v1_extra)
            .field("v2_extra", &self.v2_extra)
            .finish()
    }
}

impl BootImageExt for BootImageV0Through2 {
    fn header_version(&self) -> u32 {
        if self.v2_extra.is_some() {
            2
        } else if self.v1_extra.is_some() {
            1
        } else {
            0
        }
    }

    fn header_size(&self) -> u32 {
        let mut size = mem::size_of::<RawV0>();

        if self.v1_extra.is_some() || self.v2_extra.is_some() {
            size += mem::size_of::<RawV1Extra>();
        }
        if self.v2_extra.is_some() {
            size += mem::size_of::<RawV2Extra>();
        }

        size as u32
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }
}

impl BootImageV0Through2 {
    /// Offset where the recovery DTBO lands given the current segment sizes.
    pub fn computed_recovery_dtbo_offset(&self) -> Option<u64> {
        let page = u64::from(self.page_size);

        [
            u64::from(self.header_size()),
            self.kernel.len() as u64,
            self.ramdisk.len() as u64,
            self.second.len() as u64,
        ]
        .into_iter()
        .try_fold(0u64, |acc, size| {
            padding::round(size, page).and_then(|s| acc.checked_add(s))
        })
    }
}

impl<R: Read> FromReader<R> for BootImageV0Through2 {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let raw_v0 =
            RawV0::read_from_io(&mut reader).map_err(|e| Error::DataRead("Boot::V0::header", e))?;

        if raw_v0.magic != BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw_v0.magic));
        }

        let header_version = raw_v0.header_version.get();
        if header_version > 2 {
            return Err(Error::UnknownHeaderVersion(header_version));
        }

        let kernel_size = check_component(raw_v0.kernel_size.get(), "Boot::V0::kernel_size")?;
        let ramdisk_size = check_component(raw_v0.ramdisk_size.get(), "Boot::V0::ramdisk_size")?;
        let second_size = check_component(raw_v0.second_size.get(), "Boot::V0::second_size")?;

        let page_size = raw_v0.page_size.get();
        if page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let v1 = if header_version >= 1 {
            let raw = RawV1Extra::read_from_io(&mut reader)
                .map_err(|e| Error::DataRead("Boot::V1::header", e))?;
            let size = check_component(
                raw.recovery_dtbo_size.get(),
                "Boot::V1::recovery_dtbo_size",
            )?;

            Some((raw, size))
        } else {
            None
        };

        let v2 = if header_version == 2 {
            let raw = RawV2Extra::read_from_io(&mut reader)
                .map_err(|e| Error::DataRead("Boot::V2::header", e))?;
            let size = check_component(raw.dtb_size.get(), "Boot::V2::dtb_size")?;

            Some((raw, size))
        } else {
            None
        };

        if let Some((raw, _)) = &v1 {
            let header_size = raw.header_size.get();
            let pos = reader.position();

            if pos != u64::from(header_size) {
                return Err(Error::InvalidHeaderSize(header_size));
            }
        }

        padding::read_discard(&mut reader, page_size.into())
            .map_err(|e| Error::DataRead("Boot::V0::header_padding", e))?;

        let kernel = read_segment(&mut reader, kernel_size, page_size, "Boot::V0::kernel")?;
        let ramdisk = read_segment(&mut reader, ramdisk_size, page_size, "Boot::V0::ramdisk")?;
        let second = read_segment(&mut reader, second_size, page_size, "Boot::V0::second")?;

        let v1_extra = match v1 {
            Some((raw, size)) => Some(V1Extra {
                recovery_dtbo_offset: raw.recovery_dtbo_offset.get(),
                recovery_dtbo: read_segment(
                    &mut reader,
                    size,
                    page_size,
                    "Boot::V1::recovery_dtbo",
                )?,
            }),
            None => None,
        };

        let v2_extra = match v2 {
            Some((raw, size)) => Some(V2Extra {
                dtb_addr: raw.dtb_addr.get(),
                dtb: read_segment(&mut reader, size, page_size, "Boot::V2::dtb")?,
            }),
            None => None,
        };

        Ok(Self {
            kernel_addr: raw_v0.kernel_addr.get(),
            ramdisk_addr: raw_v0.ramdisk_addr.get(),
            second_addr: raw_v0.second_addr.get(),
            tags_addr: raw_v0.tags_addr.get(),
            page_size,
            os_version: raw_v0.os_version.get(),
            name: decode_string(&raw_v0.name, "Boot::V0::name")?,
            cmdline: decode_string(&raw_v0.cmdline, "Boot::V0::cmdline")?,
            id: raw_v0.id.map(|id| id.get()),
            extra_cmdline: decode_string(&raw_v0.extra_cmdline, "Boot::V0::extra_cmdline")?,
            kernel,
            ramdisk,
            second,
            v1_extra,
            v2_extra,
        })
    }
}

impl<W: Write> ToWriter<W> for BootImageV0Through2 {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let raw_v0 = RawV0 {
            magic: BOOT_MAGIC,
            kernel_size: check_component_len(&self.kernel, "Boot::V0::kernel_size")?.into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_size: check_component_len(&self.ramdisk, "Boot::V0::ramdisk_size")?.into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            second_size: check_component_len(&self.second, "Boot::V0::second_size")?.into(),
            second_addr: self.second_addr.into(),
            tags_addr: self.tags_addr.into(),
            page_size: self.page_size.into(),
            header_version: self.header_version().into(),
            os_version: self.os_version.into(),
            name: encode_string(&self.name, "Boot::V0::name")?,
            cmdline: encode_string(&self.cmdline, "Boot::V0::cmdline")?,
            id: self.id.map(|id| id.into()),
            extra_cmdline: encode_string(&self.extra_cmdline, "Boot::V0::extra_cmdline")?,
        };

        let mut writer = CountingWriter::new(writer);

        raw_v0
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("Boot::V0::header", e))?;

        if self.header_version() >= 1 {
            let (dtbo_size, dtbo_offset) = match &self.v1_extra {
                Some(v1) => (
                    check_component_len(&v1.recovery_dtbo, "Boot::V1::recovery_dtbo_size")?,
                    v1.recovery_dtbo_offset,
                ),
                None => (0, 0),
            };

            let raw_v1 = RawV1Extra {
                recovery_dtbo_size: dtbo_size.into(),
                recovery_dtbo_offset: dtbo_offset.into(),
                header_size: self.header_size().into(),
            };

            raw_v1
                .write_to_io(&mut writer)
                .map_err(|e| Error::DataWrite("Boot::V1::header", e))?;
        }

        if let Some(v2) = &self.v2_extra {
            let raw_v2 = RawV2Extra {
                dtb_size: check_component_len(&v2.dtb, "Boot::V2::dtb_size")?.into(),
                dtb_addr: v2.dtb_addr.into(),
            };

            raw_v2
                .write_to_io(&mut writer)
                .map_err(|e| Error::DataWrite("Boot::V2::header", e))?;
        }

        padding::write_zeros(&mut writer, self.page_size.into())
            .map_err(|e| Error::DataWrite("Boot::V0::header_padding", e))?;

        write_segment(&mut writer, &self.kernel, self.page_size, "Boot::V0::kernel")?;
        write_segment(&mut writer, &self.ramdisk, self.page_size, "Boot::V0::ramdisk")?;
        write_segment(&mut writer, &self.second, self.page_size, "Boot::V0::second")?;

        if let Some(v1) = &self.v1_extra {
            write_segment(
                &mut writer,
                &v1.recovery_dtbo,
                self.page_size,
                "Boot::V1::recovery_dtbo",
            )?;
        }

        if let Some(v2) = &self.v2_extra {
            write_segment(&mut writer, &v2.dtb, self.page_size, "Boot::V2::dtb")?;
        }

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct V4Extra {
    /// AVB structure covering everything before it. Only VTS checks it. An
    /// all-zero blob is treated as no signature.
    #[serde(skip)]
    pub signature: Option<Header>,
}

impl fmt::Debug for V4Extra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V4Extra")
            .field("signature", &self.signature.is_some())
            .finish()
    }
}

impl V4Extra {
    /// The signature padded to its fixed size, or nothing if unsigned.
    fn signature_bytes(&self) -> Result<Vec<u8>> {
        let Some(header) = &self.signature else {
            return Ok(vec![]);
        };

        let mut data = header.to_bytes().map_err(Error::SignatureSave)?;
        util::check_bounds(data.len(), ..=HDR_V4_SIGNATURE_SIZE as usize)
            .map_err(|e| Error::IntOutOfBounds("Boot::V4::signature_size", e))?;
        data.resize(HDR_V4_SIGNATURE_SIZE as usize, 0);

        Ok(data)
    }
}

/// Boot image with the fixed 4096-byte page size.
#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct BootImageV3Through4 {
    pub os_version: u32,
    pub reserved: [u32; 4],
    pub cmdline: String,
    pub v4_extra: Option<V4Extra>,
    #[serde(skip)]
    pub kernel: Vec<u8>,
    #[serde(skip)]
    pub ramdisk: Vec<u8>,
}

impl fmt::Debug for BootImageV3Through4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImageV3Through4")
            .field("header_version", &self.header_version())
            .field("os_version", &self.os_version)
            .field("reserved", &self.reserved)
            .field("cmdline", &self.cmdline)
            .field("v4_extra", &self.v4_extra)
            .field("kernel", &NumBytes(self.kernel.len()))
            .field("ramdisk", &NumBytes(self.ramdisk.len()))
            .finish()
    }
}

impl BootImageExt for BootImageV3Through4 {
    fn header_version(&self) -> u32 {
        if self.v4_extra.is_some() { 4 } else { 3 }
    }

    fn header_size(&self) -> u32 {
        let mut size = mem::size_of::<RawV3>();

        if self.v4_extra.is_some() {
            size += mem::size_of::<RawV4Extra>();
        }

        size as u32
    }

    fn page_size(&self) -> u32 {
        PAGE_SIZE
    }
}

impl<R: Read> FromReader<R> for BootImageV3Through4 {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let raw_v3 =
            RawV3::read_from_io(&mut reader).map_err(|e| Error::DataRead("Boot::V3::header", e))?;

        if raw_v3.magic != BOOT_MAGIC {
            return Err(Error::UnknownMagic(raw_v3.magic));
        }

        let header_version = raw_v3.header_version.get();
        if !(3..=4).contains(&header_version) {
            return Err(Error::UnknownHeaderVersion(header_version));
        }

        let kernel_size = check_component(raw_v3.kernel_size.get(), "Boot::V3::kernel_size")?;
        let ramdisk_size = check_component(raw_v3.ramdisk_size.get(), "Boot::V3::ramdisk_size")?;
        let header_size = raw_v3.header_size.get();

        let signature_size = if header_version == 4 {
            let raw_v4 = RawV4Extra::read_from_io(&mut reader)
                .map_err(|e| Error::DataRead("Boot::V4::header", e))?;

            let size = util::check_bounds(raw_v4.signature_size.get(), ..=HDR_V4_SIGNATURE_SIZE)
                .map_err(|e| Error::IntOutOfBounds("Boot::V4::signature_size", e))?;

            Some(size)
        } else {
            None
        };

        if reader.position() != u64::from(header_size) {
            return Err(Error::InvalidHeaderSize(header_size));
        }

        padding::read_discard(&mut reader, PAGE_SIZE.into())
            .map_err(|e| Error::DataRead("Boot::V3::header_padding", e))?;

        let kernel = read_segment(&mut reader, kernel_size, PAGE_SIZE, "Boot::V3::kernel")?;
        let ramdisk = read_segment(&mut reader, ramdisk_size, PAGE_SIZE, "Boot::V3::ramdisk")?;

        let v4_extra = match signature_size {
            Some(s) => {
                let data = read_segment(&mut reader, s, PAGE_SIZE, "Boot::V4::signature")?;

                // Some vendors ship an all-zero signature.
                let signature = if !util::is_zero(&data) {
                    Some(Header::from_reader(Cursor::new(data)).map_err(Error::SignatureLoad)?)
                } else {
                    None
                };

                Some(V4Extra { signature })
            }
            None => None,
        };

        Ok(Self {
            os_version: raw_v3.os_version.get(),
            reserved: raw_v3.reserved.map(|r| r.get()),
            cmdline: decode_string(&raw_v3.cmdline, "Boot::V3::cmdline")?,
            v4_extra,
            kernel,
            ramdisk,
        })
    }
}

impl BootImageV3Through4 {
    fn to_writer_internal(&self, writer: impl Write, skip_signature: bool) -> Result<()> {
        let signature = match &self.v4_extra {
            Some(v4) => Some(v4.signature_bytes()?),
            None => None,
        };

        let raw_v3 = RawV3 {
            magic: BOOT_MAGIC,
            kernel_size: check_component_len(&self.kernel, "Boot::V3::kernel_size")?.into(),
            ramdisk_size: check_component_len(&self.ramdisk, "Boot::V3::ramdisk_size")?.into(),
            os_version: self.os_version.into(),
            header_size: self.header_size().into(),
            reserved: self.reserved.map(|r| r.into()),
            header_version: self.header_version().into(),
            cmdline: encode_string(&self.cmdline, "Boot::V3::cmdline")?,
        };

        let mut writer = CountingWriter::new(writer);

        raw_v3
            .write_to_io(&mut writer)
            .map_err(|e| Error::DataWrite("Boot::V3::header", e))?;

        if let Some(signature) = &signature {
            let raw_v4 = RawV4Extra {
                signature_size: (signature.len() as u32).into(),
            };

            raw_v4
                .write_to_io(&mut writer)
                .map_err(|e| Error::DataWrite("Boot::V4::header", e))?;
        }

        padding::write_zeros(&mut writer, PAGE_SIZE.into())
            .map_err(|e| Error::DataWrite("Boot::V3::header_padding", e))?;

        write_segment(&mut writer, &self.kernel, PAGE_SIZE, "Boot::V3::kernel")?;
        write_segment(&mut writer, &self.ramdisk, PAGE_SIZE, "Boot::V3::ramdisk")?;

        if let (Some(signature), false) = (&signature, skip_signature) {
            write_segment(&mut writer, signature, PAGE_SIZE, "Boot::V4::signature")?;
        }

        Ok(())
    }

    /// Recompute the signature's hash descriptor over the rest of the image
    /// and sign it. Returns false if there is no signature.
    pub fn sign(&mut self, key: &RsaSigningKey) -> Result<bool> {
        let Some(mut header) = self.v4_extra.as_ref().and_then(|v| v.signature.clone()) else {
            return Ok(false);
        };

        let mut data = vec![];
        self.to_writer_internal(&mut data, true)?;

        let descriptor = header
            .descriptors
            .iter_mut()
            .find_map(|d| match d {
                Descriptor::Hash(h) => Some(h),
                _ => None,
            })
            .ok_or(Error::MissingHashDescriptor)?;

        descriptor.update(&data).map_err(Error::SignatureSign)?;
        header.sign(key).map_err(Error::SignatureSign)?;

        if let Some(v4) = &mut self.v4_extra {
            v4.signature = Some(header);
        }

        Ok(true)
    }
}

impl<W: Write> ToWriter<W> for BootImageV3Through4 {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        self.to_writer_internal(writer, false)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum BootImage {
    V0Through2(BootImageV0Through2),
    V3Through4(BootImageV3Through4),
}

impl BootImage {
    /// Detect the header version and parse. Bytes after the last segment are
    /// ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !data.starts_with(&BOOT_MAGIC) {
            let mut magic = [0u8; 8];
            let n = data.len().min(magic.len());
            magic[..n].copy_from_slice(&data[..n]);
            return Err(Error::UnknownMagic(magic));
        }

        match BootImageV0Through2::from_reader(Cursor::new(data)) {
            Ok(b) => return Ok(Self::V0Through2(b)),
            Err(Error::UnknownHeaderVersion(_)) => {}
            Err(e) => return Err(e),
        }

        match BootImageV3Through4::from_reader(Cursor::new(data)) {
            Ok(b) => Ok(Self::V3Through4(b)),
            Err(Error::UnknownHeaderVersion(_)) => Err(Error::UnknownFormat),
            Err(e) => Err(e),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.to_writer(&mut buf)?;
        Ok(buf)
    }

    pub fn kernel(&self) -> &[u8] {
        match self {
            Self::V0Through2(b) => &b.kernel,
            Self::V3Through4(b) => &b.kernel,
        }
    }

    /// Swap in a new kernel and return the old one. Later segments shift to
    /// the next page boundary after the new kernel. For v1 and v2 images, the
    /// absolute recovery DTBO offset is recomputed if the image has one.
    pub fn set_kernel(&mut self, kernel: Vec<u8>) -> Vec<u8> {
        match self {
            Self::V0Through2(b) => {
                let old = mem::replace(&mut b.kernel, kernel);
                let offset = b.computed_recovery_dtbo_offset();

                if let (Some(v1), Some(offset)) = (&mut b.v1_extra, offset) {
                    if v1.recovery_dtbo_offset != 0 || !v1.recovery_dtbo.is_empty() {
                        v1.recovery_dtbo_offset = offset;
                    }
                }

                old
            }
            Self::V3Through4(b) => mem::replace(&mut b.kernel, kernel),
        }
    }

    /// Whether the image carries a v4 boot signature.
    pub fn has_signature(&self) -> bool {
        match self {
            Self::V0Through2(_) => false,
            Self::V3Through4(b) => b.v4_extra.as_ref().is_some_and(|v| v.signature.is_some()),
        }
    }

    /// Re-sign the v4 boot signature. Returns false if there is none.
    pub fn sign(&mut self, key: &RsaSigningKey) -> Result<bool> {
        match self {
            Self::V0Through2(_) => Ok(false),
            Self::V3Through4(b) => b.sign(key),
        }
    }

    /// Drop the v4 boot signature. Returns whether there was one.
    pub fn clear_signature(&mut self) -> bool {
        match self {
            Self::V0Through2(_) => false,
            Self::V3Through4(b) => b
                .v4_extra
                .as_mut()
                .is_some_and(|v| v.signature.take().is_some()),
        }
    }
}

impl BootImageExt for BootImage {
    fn header_version(&self) -> u32 {
        match self {
            Self::V0Through2(b) => b.header_version(),
            Self::V3Through4(b) => b.header_version(),
        }
    }

    fn header_size(&self) -> u32 {
        match self {
            Self::V0Through2(b) => b.header_size(),
            Self::V3Through4(b) => b.header_size(),
        }
    }

    fn page_size(&self) -> u32 {
        match self {
            Self::V0Through2(b) => b.page_size(),
            Self::V3Through4(b) => b.page_size(),
        }
    }
}

impl<W: Write> ToWriter<W> for BootImage {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        match self {
            Self::V0Through2(b) => b.to_writer(writer),
            Self::V3Through4(b) => b.to_writer(writer),
        }
    }
}
