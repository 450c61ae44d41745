// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Sahara is the boot ROM protocol used to upload the programmer (Firehose
//! loader) to a device in emergency download mode. All integers are little
//! endian and every packet starts with a `(command, length)` pair where the
//! length includes the 8-byte header.

use std::{
    io::{self, Cursor},
    time::Duration,
};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tracing::{debug, trace};

use crate::device::transport::{self, Transport};

/// Largest loader we are willing to upload.
pub const LOADER_MAX_SIZE: usize = 16 * 1024 * 1024;

pub const HEADER_SIZE: u32 = 8;

/// Upper bound on packet sizes to avoid allocating whatever a broken device
/// claims.
const PACKET_MAX_SIZE: u32 = 4096;

const CMD_HELLO: u32 = 0x01;
const CMD_HELLO_RESP: u32 = 0x02;
const CMD_READ_DATA: u32 = 0x03;
const CMD_END_IMAGE_TX: u32 = 0x04;
const CMD_DONE: u32 = 0x05;
const CMD_DONE_RESP: u32 = 0x06;
const CMD_READ_DATA_64: u32 = 0x12;

pub const VERSION: u32 = 2;
pub const VERSION_COMPATIBLE: u32 = 1;

/// Mode requested by the device when it wants an image uploaded.
pub const MODE_IMAGE_TX_PENDING: u32 = 0;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Packet length {0} is out of range")]
    InvalidLength(u32),
    #[error("Packet for command {command:#x} is truncated")]
    Truncated { command: u32 },
    #[error("Expected {expected}, but received {actual:?}")]
    UnexpectedPacket {
        expected: &'static str,
        actual: Packet,
    },
    #[error("Loader size {0} is not in range 1..={LOADER_MAX_SIZE}")]
    LoaderSize(usize),
    #[error("Device requested out of bounds loader data: offset={offset}, length={length}")]
    ReadOutOfBounds { offset: u64, length: u64 },
    #[error("Device rejected the loader with status {0:#x}")]
    TransferFailed(u32),
    #[error("Device reported failure on completion with status {0:#x}")]
    DoneFailed(u32),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Hello {
        version: u32,
        version_compatible: u32,
        max_len: u32,
        mode: u32,
    },
    HelloResponse {
        version: u32,
        version_compatible: u32,
        status: u32,
        mode: u32,
    },
    ReadData {
        image_id: u32,
        offset: u32,
        length: u32,
    },
    ReadData64 {
        image_id: u64,
        offset: u64,
        length: u64,
    },
    EndImageTransfer {
        image_id: u32,
        status: u32,
    },
    Done,
    DoneResponse {
        status: u32,
    },
    Unknown {
        command: u32,
        payload: Vec<u8>,
    },
}

impl Packet {
    /// Decode a packet from its command ID and the bytes following the
    /// header.
    pub fn parse(command: u32, payload: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(payload);
        let truncated = |_: io::Error| Error::Truncated { command };

        let packet = match command {
            CMD_HELLO => Self::Hello {
                version: reader.read_u32::<LittleEndian>().map_err(truncated)?,
                version_compatible: reader.read_u32::<LittleEndian>().map_err(truncated)?,
                max_len: reader.read_u32::<LittleEndian>().map_err(truncated)?,
                mode: reader.read_u32::<LittleEndian>().map_err(truncated)?,
            },
            CMD_HELLO_RESP => Self::HelloResponse {
                version: reader.read_u32::<LittleEndian>().map_err(truncated)?,
                version_compatible: reader.read_u32::<LittleEndian>().map_err(truncated)?,
                status: reader.read_u32::<LittleEndian>().map_err(truncated)?,
                mode: reader.read_u32::<LittleEndian>().map_err(truncated)?,
            },
            CMD_READ_DATA => Self::ReadData {
                image_id: reader.read_u32::<LittleEndian>().map_err(truncated)?,
                offset: reader.read_u32::<LittleEndian>().map_err(truncated)?,
                length: reader.read_u32::<LittleEndian>().map_err(truncated)?,
            },
            CMD_READ_DATA_64 => Self::ReadData64 {
                image_id: reader.read_u64::<LittleEndian>().map_err(truncated)?,
                offset: reader.read_u64::<LittleEndian>().map_err(truncated)?,
                length: reader.read_u64::<LittleEndian>().map_err(truncated)?,
            },
            CMD_END_IMAGE_TX => Self::EndImageTransfer {
                image_id: reader.read_u32::<LittleEndian>().map_err(truncated)?,
                status: reader.read_u32::<LittleEndian>().map_err(truncated)?,
            },
            CMD_DONE => Self::Done,
            CMD_DONE_RESP => Self::DoneResponse {
                status: reader.read_u32::<LittleEndian>().map_err(truncated)?,
            },
            _ => Self::Unknown {
                command,
                payload: payload.to_vec(),
            },
        };

        Ok(packet)
    }

    pub fn command(&self) -> u32 {
        match self {
            Self::Hello { .. } => CMD_HELLO,
            Self::HelloResponse { .. } => CMD_HELLO_RESP,
            Self::ReadData { .. } => CMD_READ_DATA,
            Self::ReadData64 { .. } => CMD_READ_DATA_64,
            Self::EndImageTransfer { .. } => CMD_END_IMAGE_TX,
            Self::Done => CMD_DONE,
            Self::DoneResponse { .. } => CMD_DONE_RESP,
            Self::Unknown { command, .. } => *command,
        }
    }

    /// Encode the packet, including the header.
    pub fn to_bytes(&self) -> Vec<u8> {
        fn put(buf: &mut Vec<u8>, v: u32) {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        let mut payload = Vec::new();

        match self {
            Self::Hello {
                version,
                version_compatible,
                max_len,
                mode,
            } => {
                put(&mut payload, *version);
                put(&mut payload, *version_compatible);
                put(&mut payload, *max_len);
                put(&mut payload, *mode);
                for _ in 0..6 {
                    put(&mut payload, 0);
                }
            }
            Self::HelloResponse {
                version,
                version_compatible,
                status,
                mode,
            } => {
                put(&mut payload, *version);
                put(&mut payload, *version_compatible);
                put(&mut payload, *status);
                put(&mut payload, *mode);
                for _ in 0..6 {
                    put(&mut payload, 0);
                }
            }
            Self::ReadData {
                image_id,
                offset,
                length,
            } => {
                put(&mut payload, *image_id);
                put(&mut payload, *offset);
                put(&mut payload, *length);
            }
            Self::ReadData64 {
                image_id,
                offset,
                length,
            } => {
                payload.extend_from_slice(&image_id.to_le_bytes());
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&length.to_le_bytes());
            }
            Self::EndImageTransfer { image_id, status } => {
                put(&mut payload, *image_id);
                put(&mut payload, *status);
            }
            Self::Done => {}
            Self::DoneResponse { status } => put(&mut payload, *status),
            Self::Unknown { payload: p, .. } => payload.extend_from_slice(p),
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE as usize + payload.len());
        put(&mut buf, self.command());
        put(&mut buf, HEADER_SIZE + payload.len() as u32);
        buf.extend_from_slice(&payload);

        buf
    }

    /// Split a header into `(command, total length)`.
    pub fn parse_header(header: [u8; HEADER_SIZE as usize]) -> Result<(u32, u32)> {
        let mut reader = Cursor::new(header);
        let command = reader.read_u32::<LittleEndian>()?;
        let length = reader.read_u32::<LittleEndian>()?;

        if !(HEADER_SIZE..=PACKET_MAX_SIZE).contains(&length) {
            return Err(Error::InvalidLength(length));
        }

        Ok((command, length))
    }

    /// Read one packet from the transport.
    pub fn read_from(transport: &mut (impl Transport + ?Sized), timeout: Duration) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE as usize];
        transport::read_exact(transport, &mut header, timeout)?;

        let (command, length) = Self::parse_header(header)?;
        let mut payload = vec![0u8; (length - HEADER_SIZE) as usize];
        transport::read_exact(transport, &mut payload, timeout)?;

        let packet = Self::parse(command, &payload)?;
        trace!("Sahara <- {packet:?}");

        Ok(packet)
    }

    pub fn write_to(
        &self,
        transport: &mut (impl Transport + ?Sized),
        timeout: Duration,
    ) -> Result<()> {
        trace!("Sahara -> {self:?}");
        transport.write(&self.to_bytes(), timeout)?;
        Ok(())
    }
}

/// Serve the loader to the device until it reports the end of the transfer.
///
/// `handshake_timeout` bounds the wait for the initial hello. Everything
/// afterwards uses `io_timeout`.
pub fn upload_loader(
    transport: &mut (impl Transport + ?Sized),
    loader: &[u8],
    handshake_timeout: Duration,
    io_timeout: Duration,
) -> Result<()> {
    if loader.is_empty() || loader.len() > LOADER_MAX_SIZE {
        return Err(Error::LoaderSize(loader.len()));
    }

    let hello = Packet::read_from(transport, handshake_timeout)?;
    let Packet::Hello { version, mode, .. } = hello else {
        return Err(Error::UnexpectedPacket {
            expected: "hello",
            actual: hello,
        });
    };

    debug!("Device hello: version={version}, mode={mode}");

    Packet::HelloResponse {
        version: VERSION,
        version_compatible: VERSION_COMPATIBLE,
        status: 0,
        mode: MODE_IMAGE_TX_PENDING,
    }
    .write_to(transport, io_timeout)?;

    let mut served = 0u64;

    loop {
        let packet = Packet::read_from(transport, io_timeout)?;

        let (offset, length) = match packet {
            Packet::ReadData { offset, length, .. } => (u64::from(offset), u64::from(length)),
            Packet::ReadData64 { offset, length, .. } => (offset, length),
            Packet::EndImageTransfer { status: 0, .. } => break,
            Packet::EndImageTransfer { status, .. } => return Err(Error::TransferFailed(status)),
            p => {
                return Err(Error::UnexpectedPacket {
                    expected: "read data or end of transfer",
                    actual: p,
                });
            }
        };

        let range = offset
            .checked_add(length)
            .filter(|end| *end <= loader.len() as u64)
            .map(|end| offset as usize..end as usize)
            .ok_or(Error::ReadOutOfBounds { offset, length })?;

        transport.write(&loader[range], io_timeout)?;
        served += length;
    }

    debug!("Uploaded loader ({served} bytes requested)");

    Packet::Done.write_to(transport, io_timeout)?;

    match Packet::read_from(transport, io_timeout)? {
        Packet::DoneResponse { status: 0 } => Ok(()),
        Packet::DoneResponse { status } => Err(Error::DoneFailed(status)),
        p => Err(Error::UnexpectedPacket {
            expected: "done response",
            actual: p,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_response_layout() {
        let bytes = Packet::HelloResponse {
            version: VERSION,
            version_compatible: VERSION_COMPATIBLE,
            status: 0,
            mode: MODE_IMAGE_TX_PENDING,
        }
        .to_bytes();

        assert_eq!(bytes.len(), 0x30);
        assert_eq!(&bytes[..8], b"\x02\x00\x00\x00\x30\x00\x00\x00");
        assert_eq!(&bytes[8..12], b"\x02\x00\x00\x00");
    }

    #[test]
    fn read_data_64_layout() {
        let bytes = Packet::ReadData64 {
            image_id: 13,
            offset: 0x1000,
            length: 0x200,
        }
        .to_bytes();

        assert_eq!(bytes.len(), 0x20);

        let (command, length) = Packet::parse_header(bytes[..8].try_into().unwrap()).unwrap();
        assert_eq!(command, CMD_READ_DATA_64);
        assert_eq!(length, 0x20);
        assert_eq!(
            Packet::parse(command, &bytes[8..]).unwrap(),
            Packet::ReadData64 {
                image_id: 13,
                offset: 0x1000,
                length: 0x200,
            },
        );
    }

    #[test]
    fn truncated_packet() {
        assert!(matches!(
            Packet::parse(CMD_READ_DATA, &[0u8; 4]),
            Err(Error::Truncated { command: CMD_READ_DATA }),
        ));
    }

    #[test]
    fn invalid_length() {
        let mut header = [0u8; 8];
        header[4..].copy_from_slice(&4u32.to_le_bytes());

        assert!(matches!(
            Packet::parse_header(header),
            Err(Error::InvalidLength(4)),
        ));
    }
}
