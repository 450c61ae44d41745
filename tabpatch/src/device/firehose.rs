// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Firehose is the XML command protocol spoken by the programmer after it
//! has been uploaded. Every message is a `<data>` document. Bulk transfers
//! are framed by `rawmode="true"` and `rawmode="false"` responses.

use std::{collections::BTreeMap, io, time::Duration};

use memchr::memmem;
use quick_xml::{
    Reader, Writer,
    events::{BytesDecl, BytesEnd, BytesStart, Event, attributes::AttrError},
};
use thiserror::Error;
use tracing::{debug, trace};

use crate::device::transport::Transport;

const DOCUMENT_END: &[u8] = b"</data>";

/// Maximum size of a buffered response document.
const DOCUMENT_MAX_SIZE: usize = 64 * 1024;

const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("XML error")]
    Xml(#[from] quick_xml::Error),
    #[error("XML attribute error")]
    Attr(#[from] AttrError),
    #[error("Response is not valid UTF-8")]
    NotUtf8,
    #[error("Response exceeds {DOCUMENT_MAX_SIZE} bytes without a closing </data>")]
    DocumentTooLarge,
    #[error("Expected rawmode={expected}, but response had {actual:?}")]
    RawModeMismatch {
        expected: bool,
        actual: Option<bool>,
    },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// An element inside a `<data>` document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.attrs.insert(key.to_owned(), value.to_string());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(|v| v.as_str())
    }

    pub fn int_attr<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.attr(key).and_then(|v| v.trim().parse().ok())
    }

    /// Serialize as a complete `<data>` document.
    pub fn to_document(&self) -> Vec<u8> {
        let mut writer = Writer::new(Vec::new());

        let mut element = BytesStart::new(self.tag.as_str());
        for (k, v) in &self.attrs {
            element.push_attribute((k.as_str(), v.as_str()));
        }

        // Writing to a Vec is infallible.
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", None, None)));
        let _ = writer.write_event(Event::Start(BytesStart::new("data")));
        let _ = writer.write_event(Event::Empty(element));
        let _ = writer.write_event(Event::End(BytesEnd::new("data")));

        writer.into_inner()
    }
}

/// Parse every element of a `<data>` document, excluding the `<data>`
/// wrapper itself.
pub fn parse_document(xml: &str) -> Result<Vec<Element>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut elements = vec![];

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() != b"data" => {
                let mut element = Element::new(String::from_utf8_lossy(e.name().as_ref()));

                for attr in e.attributes().with_checks(false) {
                    let attr = attr?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = attr.unescape_value()?.into_owned();
                    element.attrs.insert(key, value);
                }

                elements.push(element);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(elements)
}

/// A `<response>` element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub ack: bool,
    pub rawmode: Option<bool>,
    pub element: Element,
}

impl Response {
    fn from_element(element: Element) -> Self {
        let ack = element
            .attr("value")
            .is_some_and(|v| v.eq_ignore_ascii_case("ACK"));
        let rawmode = element.attr("rawmode").map(|v| v.eq_ignore_ascii_case("true"));

        Self {
            ack,
            rawmode,
            element,
        }
    }

    pub fn expect_rawmode(&self, expected: bool) -> Result<()> {
        if self.rawmode.unwrap_or(false) != expected {
            return Err(Error::RawModeMismatch {
                expected,
                actual: self.rawmode,
            });
        }

        Ok(())
    }
}

pub fn configure(memory: &str, max_payload_size: usize) -> Element {
    Element::new("configure")
        .with("MemoryName", memory)
        .with("Verbose", 0)
        .with("AlwaysValidate", 0)
        .with("MaxDigestTableSizeInBytes", 8192)
        .with("MaxPayloadSizeToTargetInBytes", max_payload_size)
        .with("ZLPAwareHost", 1)
        .with("SkipStorageInit", 0)
        .with("SkipWrite", 0)
}

/// Arguments shared by `<read>` and `<program>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorRange {
    pub lun: u32,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub sector_size: u32,
}

impl SectorRange {
    pub fn byte_len(&self) -> u64 {
        self.num_sectors * u64::from(self.sector_size)
    }

    fn element(&self, tag: &str) -> Element {
        Element::new(tag)
            .with("SECTOR_SIZE_IN_BYTES", self.sector_size)
            .with("num_partition_sectors", self.num_sectors)
            .with("physical_partition_number", self.lun)
            .with("start_sector", self.start_sector)
    }

    pub fn from_element(element: &Element) -> Option<Self> {
        Some(Self {
            lun: element.int_attr("physical_partition_number")?,
            start_sector: element.int_attr("start_sector")?,
            num_sectors: element.int_attr("num_partition_sectors")?,
            sector_size: element.int_attr("SECTOR_SIZE_IN_BYTES")?,
        })
    }
}

pub fn read(range: &SectorRange) -> Element {
    range.element("read")
}

pub fn program(range: &SectorRange) -> Element {
    range.element("program")
}

pub fn power_reset() -> Element {
    Element::new("power").with("value", "reset")
}

/// Buffers device output so that XML documents and raw data that arrive in
/// the same read are split correctly.
#[derive(Debug, Default)]
pub struct FirehoseReader {
    buf: Vec<u8>,
}

impl FirehoseReader {
    pub fn new() -> Self {
        Self::default()
    }

    fn fill(&mut self, transport: &mut (impl Transport + ?Sized), timeout: Duration) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = transport.read(&mut chunk, timeout)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Device closed the connection",
            )));
        }

        self.buf.extend_from_slice(&chunk[..n]);

        Ok(())
    }

    /// Read up to and including the next `</data>`.
    pub fn next_document(
        &mut self,
        transport: &mut (impl Transport + ?Sized),
        timeout: Duration,
    ) -> Result<String> {
        loop {
            if let Some(pos) = memmem::find(&self.buf, DOCUMENT_END) {
                let end = pos + DOCUMENT_END.len();
                let document: Vec<u8> = self.buf.drain(..end).collect();

                return String::from_utf8(document).map_err(|_| Error::NotUtf8);
            } else if self.buf.len() > DOCUMENT_MAX_SIZE {
                return Err(Error::DocumentTooLarge);
            }

            self.fill(transport, timeout)?;
        }
    }

    /// Read the next `<response>`. `<log>` messages received in the meantime
    /// are emitted at debug level.
    pub fn read_response(
        &mut self,
        transport: &mut (impl Transport + ?Sized),
        timeout: Duration,
    ) -> Result<Response> {
        loop {
            let document = self.next_document(transport, timeout)?;
            trace!("Firehose <- {document}");

            let mut response = None;

            for element in parse_document(&document)? {
                match element.tag.as_str() {
                    "log" => debug!("Device: {}", element.attr("value").unwrap_or_default()),
                    "response" if response.is_none() => {
                        response = Some(Response::from_element(element));
                    }
                    _ => trace!("Ignoring element: {element:?}"),
                }
            }

            if let Some(r) = response {
                return Ok(r);
            }
        }
    }

    /// Read exactly `len` bytes of raw data.
    pub fn read_raw(
        &mut self,
        transport: &mut (impl Transport + ?Sized),
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        while self.buf.len() < len {
            self.fill(transport, timeout)?;
        }

        Ok(self.buf.drain(..len).collect())
    }
}

pub fn send(
    transport: &mut (impl Transport + ?Sized),
    element: &Element,
    timeout: Duration,
) -> Result<()> {
    let document = element.to_document();
    trace!("Firehose -> {}", String::from_utf8_lossy(&document));
    transport.write(&document, timeout)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_round_trip() {
        let range = SectorRange {
            lun: 4,
            start_sector: 1234,
            num_sectors: 16,
            sector_size: 4096,
        };
        let document = read(&range).to_document();
        let document = String::from_utf8(document).unwrap();

        assert!(document.starts_with("<?xml version=\"1.0\"?><data><read "));

        let elements = parse_document(&document).unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].tag, "read");
        assert_eq!(SectorRange::from_element(&elements[0]), Some(range));
    }

    #[test]
    fn parse_response_and_logs() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" ?>
            <data>
                <log value="INFO: Calling handler for configure" />
                <response value="NAK" MaxPayloadSizeToTargetInBytesSupported="524288" />
            </data>"#;

        let elements = parse_document(xml).unwrap();
        assert_eq!(elements.len(), 2);

        let response = Response::from_element(elements[1].clone());
        assert!(!response.ack);
        assert_eq!(response.rawmode, None);
        assert_eq!(
            response
                .element
                .int_attr::<usize>("MaxPayloadSizeToTargetInBytesSupported"),
            Some(524288),
        );
    }
}
