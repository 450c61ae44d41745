// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Qualcomm partition program XML (`rawprogram*.xml`) and the encrypted `.x`
//! container some firmware packages ship it in.

use std::{borrow::Cow, io};

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use quick_xml::{
    Reader, Writer,
    events::{BytesStart, Event, attributes::AttrError},
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::util;

const X_PASSWORD: &[u8] = b"OSD";
const X_ITERATIONS: usize = 1000;
const X_SIGNATURE: [u8; 8] = [0xcf, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0xfc];

#[derive(Debug, Error)]
pub enum Error {
    #[error("XML error")]
    Xml(#[from] quick_xml::Error),
    #[error("XML attribute error")]
    Attr(#[from] AttrError),
    #[error("<program> element is missing {0:?} attribute")]
    MissingAttribute(&'static str),
    #[error("Invalid {name:?} attribute value: {value:?}")]
    InvalidAttribute { name: &'static str, value: String },
    #[error("Encrypted file is too short ({0} bytes)")]
    XTooShort(usize),
    #[error("Encrypted body size ({0}) is not a multiple of the block size")]
    XBlockAlignment(usize),
    #[error("Decrypted data has invalid signature: {0}")]
    XSignature(String),
    #[error("Decrypted size field is out of bounds: {0}")]
    XSizeOutOfBounds(i64),
    #[error("Decrypted data failed checksum verification")]
    XDigestMismatch,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// One `<program>` element.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgramEntry {
    pub label: String,
    pub filename: String,
    pub lun: u32,
    /// `None` when the start sector is an expression relative to the end of
    /// the disk, like `NUM_DISK_SECTORS-5.`.
    pub start_sector: Option<u64>,
    pub num_sectors: u64,
    pub sector_size: u32,
    pub size_in_kb: Option<f64>,
}

impl ProgramEntry {
    /// Size of the partition as declared by its sector count.
    pub fn size(&self) -> Option<u64> {
        self.num_sectors.checked_mul(self.sector_size.into())
    }

    /// Size declared by `size_in_KB`, if present.
    pub fn expected_size(&self) -> Option<u64> {
        self.size_in_kb
            .filter(|kb| kb.is_finite() && *kb >= 0.0)
            .map(|kb| (kb * 1024.0) as u64)
    }

    /// Whether the partition holds user data that is only written on a full
    /// wipe.
    pub fn is_wipe_only(&self) -> bool {
        is_wipe_only(&self.label)
    }
}

/// userdata and metadata are only flashed when wiping.
pub fn is_wipe_only(label: &str) -> bool {
    let base = util::strip_slot_suffix(label);
    base.starts_with("userdata") || base.starts_with("metadata")
}

fn attr_eq(key: &[u8], name: &str) -> bool {
    key.eq_ignore_ascii_case(name.as_bytes())
}

fn collect_attrs(element: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    let mut attrs = vec![];

    for attr in element.attributes().with_checks(false) {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }

    Ok(attrs)
}

fn find_attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| attr_eq(k.as_bytes(), name))
        .map(|(_, v)| v.as_str())
}

fn parse_int<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.trim().trim_end_matches('.').parse().ok()
}

fn required_int<T: std::str::FromStr>(attrs: &[(String, String)], name: &'static str) -> Result<T> {
    let value = find_attr(attrs, name).ok_or(Error::MissingAttribute(name))?;

    parse_int(value).ok_or_else(|| Error::InvalidAttribute {
        name,
        value: value.to_owned(),
    })
}

fn parse_entry(element: &BytesStart<'_>) -> Result<ProgramEntry> {
    let attrs = collect_attrs(element)?;

    Ok(ProgramEntry {
        label: find_attr(&attrs, "label").unwrap_or_default().to_owned(),
        filename: find_attr(&attrs, "filename").unwrap_or_default().to_owned(),
        lun: required_int(&attrs, "physical_partition_number")?,
        start_sector: find_attr(&attrs, "start_sector").and_then(parse_int),
        num_sectors: required_int(&attrs, "num_partition_sectors")?,
        sector_size: required_int(&attrs, "SECTOR_SIZE_IN_BYTES")?,
        size_in_kb: find_attr(&attrs, "size_in_KB").and_then(|v| v.trim().parse().ok()),
    })
}

fn is_program(element: &BytesStart<'_>) -> bool {
    element.name().as_ref() == b"program"
}

/// Parse every `<program>` element in document order.
pub fn parse(xml: &str) -> Result<Vec<ProgramEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = vec![];

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if is_program(&e) => {
                entries.push(parse_entry(&e)?);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}

/// Rewrite the `filename` attribute of `<program>` elements. `f` receives the
/// parsed entry and returns the new filename, or `None` to keep it. Returns
/// the new document and the number of elements changed. Everything outside
/// the touched attributes is copied through verbatim.
pub fn rewrite_filenames(
    xml: &str,
    mut f: impl FnMut(&ProgramEntry) -> Option<String>,
) -> Result<(String, usize)> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut changed = 0;

    loop {
        let event = reader.read_event()?;

        let event = match event {
            Event::Eof => break,
            Event::Empty(e) if is_program(&e) => {
                let entry = parse_entry(&e)?;

                match f(&entry) {
                    Some(filename) if filename != entry.filename => {
                        changed += 1;
                        Event::Empty(replace_attr(&e, "filename", &filename)?)
                    }
                    _ => Event::Empty(e),
                }
            }
            Event::Start(e) if is_program(&e) => {
                let entry = parse_entry(&e)?;

                match f(&entry) {
                    Some(filename) if filename != entry.filename => {
                        changed += 1;
                        Event::Start(replace_attr(&e, "filename", &filename)?)
                    }
                    _ => Event::Start(e),
                }
            }
            e => e,
        };

        writer.write_event(event)?;
    }

    let data = writer.into_inner();
    let xml = String::from_utf8(data)
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    Ok((xml, changed))
}

fn replace_attr<'a>(element: &BytesStart<'_>, name: &str, value: &str) -> Result<BytesStart<'a>> {
    let tag = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut result = BytesStart::new(Cow::Owned(tag));
    let mut found = false;

    for (k, v) in collect_attrs(element)? {
        if attr_eq(k.as_bytes(), name) {
            result.push_attribute((k.as_str(), value));
            found = true;
        } else {
            result.push_attribute((k.as_str(), v.as_str()));
        }
    }

    if !found {
        result.push_attribute((name, value));
    }

    Ok(result)
}

/// Blank out the image filename of every userdata and metadata entry so that
/// flashing the program keeps user data.
pub fn strip_wipe(xml: &str) -> Result<(String, usize)> {
    rewrite_filenames(xml, |e| {
        if e.is_wipe_only() && !e.filename.is_empty() {
            Some(String::new())
        } else {
            None
        }
    })
}

/// Point the entry with `label` at `filename`.
pub fn set_filename(xml: &str, label: &str, filename: &str) -> Result<(String, usize)> {
    rewrite_filenames(xml, |e| (e.label == label).then(|| filename.to_owned()))
}

/// PBKDF1 over SHA-256. The first round hashes the password and salt, and
/// every later round hashes the previous digest.
fn pbkdf1_sha256(password: &[u8], salt: &[u8], iterations: usize) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.update(salt);
    let mut digest: [u8; 32] = hasher.finalize().into();

    for _ in 1..iterations {
        digest = Sha256::digest(digest).into();
    }

    digest
}

/// Decrypt a `.x` container. The layout is a 16-byte IV, a 16-byte salt, and
/// an AES-256-CBC body. The plaintext is a little-endian i64 size, an 8-byte
/// signature, the payload, and the SHA-256 of the payload.
pub fn decrypt_x(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 32 {
        return Err(Error::XTooShort(data.len()));
    }

    let (iv, rest) = data.split_at(16);
    let (salt, body) = rest.split_at(16);

    if body.len() % 16 != 0 {
        return Err(Error::XBlockAlignment(body.len()));
    }

    let key = pbkdf1_sha256(X_PASSWORD, salt, X_ITERATIONS);
    let decryptor = cbc::Decryptor::<Aes256>::new_from_slices(&key, iv)
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e.to_string())))?;

    let mut plain = body.to_vec();
    let plain = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut plain)
        .map_err(|_| Error::XBlockAlignment(body.len()))?;

    if plain.len() < 16 {
        return Err(Error::XTooShort(data.len()));
    }

    let mut size_raw = [0u8; 8];
    size_raw.copy_from_slice(&plain[..8]);
    let size = i64::from_le_bytes(size_raw);

    if plain[8..16] != X_SIGNATURE {
        return Err(Error::XSignature(hex::encode(&plain[8..16])));
    }

    let payload_end = usize::try_from(size)
        .ok()
        .and_then(|s| s.checked_add(16))
        .filter(|end| end.checked_add(32).is_some_and(|e| e <= plain.len()))
        .ok_or(Error::XSizeOutOfBounds(size))?;

    let payload = &plain[16..payload_end];
    let digest = Sha256::digest(payload);

    if digest.as_slice() != &plain[payload_end..payload_end + 32] {
        return Err(Error::XDigestMismatch);
    }

    Ok(payload.to_vec())
}
