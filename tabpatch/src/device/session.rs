// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io, time::Duration};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    device::{
        PartitionLocation, PartitionTable,
        firehose::{self, FirehoseReader, Response, SectorRange},
        sahara,
        transport::Transport,
    },
    format::padding,
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("No device in download mode found")]
    DeviceNotFound(#[source] io::Error),
    #[error("Timed out waiting for the device to start the handshake")]
    HandshakeTimeout,
    #[error("Lost connection to device")]
    SessionLost(#[source] io::Error),
    #[error("Session is not ready: {0}")]
    NotReady(SessionState),
    #[error("Partition not found in partition table: {0:?}")]
    UnknownPartition(String),
    #[error("Loader size {0} is not in range 1..={max}", max = sahara::LOADER_MAX_SIZE)]
    LoaderSize(usize),
    #[error("Loader upload failed")]
    Sahara(#[source] sahara::Error),
    #[error("Invalid response from device")]
    Firehose(#[source] firehose::Error),
    #[error("Device rejected {0}")]
    Rejected(String),
    #[error("Image for {partition:?} is {size} bytes, but the partition is {capacity} bytes")]
    PartitionTooLarge {
        partition: String,
        size: u64,
        capacity: u64,
    },
    #[error("Dump of {partition:?} is {actual} bytes, but {expected} bytes were expected")]
    DumpSizeMismatch {
        partition: String,
        expected: u64,
        actual: u64,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Ready,
    Reading,
    Writing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Reading => "reading",
            Self::Writing => "writing",
        };

        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct SessionParams {
    /// Storage type passed to `<configure>`, eg. `UFS` or `eMMC`.
    pub memory: String,
    /// Requested maximum payload size per write. The device may lower this.
    pub max_payload_size: usize,
    pub handshake_timeout: Duration,
    pub io_timeout: Duration,
    /// Slot used when a partition name has no exact match.
    pub slot: Option<String>,
    pub partitions: PartitionTable,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            memory: "UFS".to_owned(),
            max_payload_size: 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(5),
            slot: None,
            partitions: PartitionTable::new(),
        }
    }
}

/// A connection to a device running the Firehose programmer.
///
/// Any transport failure moves the session to
/// [`SessionState::Disconnected`] and every later operation fails with
/// [`Error::NotReady`]. A request rejected by the device leaves the session
/// usable.
#[derive(Debug)]
pub struct DeviceSession<T: Transport> {
    transport: T,
    state: SessionState,
    params: SessionParams,
    max_payload_size: usize,
    reader: FirehoseReader,
}

impl<T: Transport> DeviceSession<T> {
    /// Open the transport, upload `loader` over Sahara, and configure the
    /// programmer.
    pub fn open(mut transport: T, loader: &[u8], params: SessionParams) -> Result<Self> {
        if loader.is_empty() || loader.len() > sahara::LOADER_MAX_SIZE {
            return Err(Error::LoaderSize(loader.len()));
        }

        transport.open().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::DeviceNotFound(e),
            _ => Error::SessionLost(e),
        })?;

        let max_payload_size = params.max_payload_size;
        let mut session = Self {
            transport,
            state: SessionState::Handshaking,
            params,
            max_payload_size,
            reader: FirehoseReader::new(),
        };

        debug!("Uploading loader: {:?}", NumBytes(loader.len()));

        let result = sahara::upload_loader(
            &mut session.transport,
            loader,
            session.params.handshake_timeout,
            session.params.io_timeout,
        );
        if let Err(e) = result {
            session.disconnect();

            return Err(match e {
                sahara::Error::Io(e) if e.kind() == io::ErrorKind::TimedOut => {
                    Error::HandshakeTimeout
                }
                sahara::Error::Io(e) => Error::SessionLost(e),
                e => Error::Sahara(e),
            });
        }

        session.configure()?;
        session.state = SessionState::Ready;

        info!(
            "Device ready: memory={}, max payload={:?}",
            session.params.memory,
            NumBytes(session.max_payload_size),
        );

        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Payload size negotiated with the device.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn partitions(&self) -> &PartitionTable {
        &self.params.partitions
    }

    fn disconnect(&mut self) {
        self.transport.close();
        self.state = SessionState::Disconnected;
    }

    /// Convert a protocol failure into a session error. Transport failures
    /// and malformed responses leave the stream in an unknown position, so
    /// the session is dropped.
    fn fail(&mut self, error: firehose::Error) -> Error {
        self.disconnect();

        match error {
            firehose::Error::Io(e) => Error::SessionLost(e),
            e => Error::Firehose(e),
        }
    }

    fn send(&mut self, element: &firehose::Element) -> Result<()> {
        let timeout = self.params.io_timeout;

        firehose::send(&mut self.transport, element, timeout).map_err(|e| self.fail(e))
    }

    fn response(&mut self) -> Result<Response> {
        let timeout = self.params.io_timeout;

        self.reader
            .read_response(&mut self.transport, timeout)
            .map_err(|e| self.fail(e))
    }

    /// Wait for the `rawmode` response that starts or ends a transfer.
    /// Returns [`Error::Rejected`] on NAK and restores the ready state.
    fn transfer_response(&mut self, rawmode: bool, what: &str) -> Result<()> {
        let response = self.response()?;

        if !response.ack {
            self.state = SessionState::Ready;
            return Err(Error::Rejected(what.to_owned()));
        }

        response.expect_rawmode(rawmode).map_err(|e| self.fail(e))
    }

    fn configure(&mut self) -> Result<()> {
        let mut requested = self.params.max_payload_size;
        let mut retried = false;

        loop {
            let element = firehose::configure(&self.params.memory, requested);
            self.send(&element)?;
            let response = self.response()?;

            let supported = response
                .element
                .int_attr::<usize>("MaxPayloadSizeToTargetInBytesSupported")
                .filter(|s| *s > 0);

            if response.ack {
                let accepted = response
                    .element
                    .int_attr::<usize>("MaxPayloadSizeToTargetInBytes")
                    .filter(|s| *s > 0)
                    .unwrap_or(requested);

                self.max_payload_size = accepted.min(requested);
                return Ok(());
            }

            match supported {
                Some(s) if !retried && s != requested => {
                    warn!("Device only supports payloads up to {:?}", NumBytes(s));
                    requested = s;
                    retried = true;
                }
                _ => {
                    self.disconnect();
                    return Err(Error::Rejected("configuration".to_owned()));
                }
            }
        }
    }

    fn require_ready(&self) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(Error::NotReady(self.state));
        }

        Ok(())
    }

    fn locate(&self, name: &str) -> Result<(String, PartitionLocation)> {
        self.params
            .partitions
            .resolve(name, self.params.slot.as_deref())
            .map(|(n, l)| (n.to_owned(), *l))
            .ok_or_else(|| Error::UnknownPartition(name.to_owned()))
    }

    /// Dump an entire partition.
    pub fn read_partition(&mut self, name: &str) -> Result<Vec<u8>> {
        self.require_ready()?;
        let (name, location) = self.locate(name)?;
        let range = SectorRange::from(&location);

        debug!("Reading {name}: {range:?}");

        self.state = SessionState::Reading;
        self.send(&firehose::read(&range))?;
        self.transfer_response(true, &format!("read of {name:?}"))?;

        let timeout = self.params.io_timeout;
        let data = self
            .reader
            .read_raw(&mut self.transport, range.byte_len() as usize, timeout)
            .map_err(|e| self.fail(e))?;

        self.transfer_response(false, &format!("read of {name:?}"))?;
        self.state = SessionState::Ready;

        if let Some(expected) = location.expected_size {
            if expected != data.len() as u64 {
                return Err(Error::DumpSizeMismatch {
                    partition: name,
                    expected,
                    actual: data.len() as u64,
                });
            }
        }

        info!("Read {name}: {:?}", NumBytes(data.len()));

        Ok(data)
    }

    /// Write `data` to the start of a partition. The final sector is padded
    /// with zeros.
    pub fn write_partition(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.require_ready()?;
        let (name, location) = self.locate(name)?;

        if data.len() as u64 > location.byte_len() {
            return Err(Error::PartitionTooLarge {
                partition: name,
                size: data.len() as u64,
                capacity: location.byte_len(),
            });
        } else if data.is_empty() {
            debug!("Skipping empty image for {name}");
            return Ok(());
        }

        let sector_size = location.sector_size as usize;
        let range = SectorRange {
            num_sectors: data.len().div_ceil(sector_size) as u64,
            ..SectorRange::from(&location)
        };

        debug!("Writing {name}: {range:?}");

        self.state = SessionState::Writing;
        self.send(&firehose::program(&range))?;
        self.transfer_response(true, &format!("write of {name:?}"))?;

        let chunk_size = (self.max_payload_size / sector_size).max(1) * sector_size;
        let timeout = self.params.io_timeout;

        for chunk in data.chunks(chunk_size) {
            let result = if chunk.len() % sector_size == 0 {
                self.transport.write(chunk, timeout)
            } else {
                let mut padded = chunk.to_vec();
                padding::pad_vec(&mut padded, sector_size);
                self.transport.write(&padded, timeout)
            };

            if let Err(e) = result {
                self.disconnect();
                return Err(Error::SessionLost(e));
            }
        }

        self.transfer_response(false, &format!("write of {name:?}"))?;
        self.state = SessionState::Ready;

        info!("Wrote {name}: {:?}", NumBytes(data.len()));

        Ok(())
    }

    /// Reboot the device. The session is closed afterwards.
    pub fn reset(&mut self) -> Result<()> {
        self.require_ready()?;

        self.send(&firehose::power_reset())?;
        let response = self.response()?;
        self.disconnect();

        if !response.ack {
            return Err(Error::Rejected("reset".to_owned()));
        }

        info!("Device is rebooting");

        Ok(())
    }

    pub fn close(&mut self) {
        if self.state != SessionState::Disconnected {
            self.disconnect();
        }
    }
}

impl<T: Transport> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}
