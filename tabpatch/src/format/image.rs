// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::io::Cursor;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    format::avb::{self, AppendedDescriptorRef, Footer, Header},
    stream::FromReader,
};

/// Reasons an image is considered malformed.
#[derive(Debug, Error)]
pub enum FormatIssue {
    #[error("Unsupported AVB footer version {major}.{minor}")]
    FooterVersion { major: u32, minor: u32 },
    #[error("Failed to parse AVB footer")]
    Footer(#[source] avb::Error),
    #[error("{field} exceeds the {size} byte image")]
    OutOfBounds { field: &'static str, size: u64 },
    #[error("Failed to parse vbmeta header")]
    Header(#[source] avb::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed image at offset {offset:#x}")]
    Format {
        offset: u64,
        #[source]
        issue: FormatIssue,
    },
    #[error("Image does not contain a vbmeta header")]
    NoHeader,
    #[error("Image is not an appended AVB image")]
    NotAppended,
    #[error("Failed to rebuild image")]
    Rebuild(#[source] avb::Error),
}

impl Error {
    /// Offset of the malformed structure, if the error is a format error.
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Format { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum ImageKind {
    /// No AVB structures.
    Raw,
    /// Standalone vbmeta partition with the header at offset 0.
    Vbmeta,
    /// Partition data followed by a vbmeta header and a footer in the last
    /// 64 bytes.
    Appended,
}

/// An entire partition image. The bytes are kept exactly as read so that an
/// unmodified image serializes back to the same data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionImage {
    data: Vec<u8>,
    footer: Option<Footer>,
    header: Option<Header>,
}

fn format_err(offset: u64, issue: FormatIssue) -> Error {
    Error::Format { offset, issue }
}

impl PartitionImage {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let size = data.len() as u64;
        let footer_size = Footer::SIZE as u64;

        if size >= footer_size
            && data[(size - footer_size) as usize..].starts_with(&avb::FOOTER_MAGIC)
        {
            let footer_offset = size - footer_size;
            let footer = Footer::from_reader(&data[footer_offset as usize..])
                .map_err(|e| format_err(footer_offset, FormatIssue::Footer(e)))?;

            if footer.version_major != avb::FOOTER_VERSION_MAJOR {
                return Err(format_err(
                    footer_offset,
                    FormatIssue::FooterVersion {
                        major: footer.version_major,
                        minor: footer.version_minor,
                    },
                ));
            }

            if footer.original_image_size > footer_offset {
                return Err(format_err(
                    footer_offset,
                    FormatIssue::OutOfBounds {
                        field: "original_image_size",
                        size,
                    },
                ));
            }

            let vbmeta_end = footer
                .vbmeta_offset
                .checked_add(footer.vbmeta_size)
                .filter(|end| *end <= footer_offset)
                .ok_or_else(|| {
                    format_err(
                        footer_offset,
                        FormatIssue::OutOfBounds {
                            field: "vbmeta_size",
                            size,
                        },
                    )
                })?;

            let raw_header = &data[footer.vbmeta_offset as usize..vbmeta_end as usize];
            let header = Header::from_reader(raw_header)
                .map_err(|e| format_err(footer.vbmeta_offset, FormatIssue::Header(e)))?;

            debug!(
                "Appended image: {} byte payload, vbmeta at {:#x}",
                footer.original_image_size, footer.vbmeta_offset,
            );

            Ok(Self {
                data,
                footer: Some(footer),
                header: Some(header),
            })
        } else if data.starts_with(&avb::HEADER_MAGIC) {
            let header = Header::from_reader(Cursor::new(&data))
                .map_err(|e| format_err(0, FormatIssue::Header(e)))?;

            debug!("Root vbmeta image: {} descriptors", header.descriptors.len());

            Ok(Self {
                data,
                footer: None,
                header: Some(header),
            })
        } else {
            Ok(Self {
                data,
                footer: None,
                header: None,
            })
        }
    }

    /// Wrap data that is known to have no AVB structures.
    pub fn raw(data: Vec<u8>) -> Self {
        Self {
            data,
            footer: None,
            header: None,
        }
    }

    /// Assemble an appended image of exactly `partition_size` bytes. `data`
    /// holds the partition contents followed by the hash tree, if any.
    pub fn assemble_appended(data: Vec<u8>, header: &Header, partition_size: u64) -> Result<Self> {
        let mut writer = Cursor::new(data);
        let mut footer = Footer::default();

        let end = avb::write_appended_image(&mut writer, header, &mut footer, Some(partition_size))
            .map_err(Error::Rebuild)?;

        let mut data = writer.into_inner();
        data.truncate(end as usize);

        Ok(Self {
            data,
            footer: Some(footer),
            header: Some(header.clone()),
        })
    }

    pub fn kind(&self) -> ImageKind {
        match (&self.footer, &self.header) {
            (Some(_), _) => ImageKind::Appended,
            (None, Some(_)) => ImageKind::Vbmeta,
            (None, None) => ImageKind::Raw,
        }
    }

    pub fn footer(&self) -> Option<&Footer> {
        self.footer.as_ref()
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Exact bytes of the image.
    pub fn serialize(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The partition contents protected by the vbmeta header. For root vbmeta
    /// images, this is empty. For raw images, this is the entire image.
    pub fn payload(&self) -> &[u8] {
        match (&self.footer, &self.header) {
            (Some(f), _) => &self.data[..f.original_image_size as usize],
            (None, Some(_)) => &[],
            (None, None) => &self.data,
        }
    }

    /// The hash tree stored after the payload of a hash tree protected image.
    pub fn hash_tree(&self) -> Option<&[u8]> {
        let footer = self.footer.as_ref()?;
        let header = self.header.as_ref()?;

        match header.appended_descriptor().ok()? {
            AppendedDescriptorRef::HashTree(d) => {
                let start = usize::try_from(d.tree_offset).ok()?;
                let end = start.checked_add(usize::try_from(d.tree_size).ok()?)?;

                if end as u64 > footer.vbmeta_offset {
                    return None;
                }

                Some(&self.data[start..end])
            }
            AppendedDescriptorRef::Hash(_) => None,
        }
    }

    /// Replace the vbmeta header while keeping everything else. A root vbmeta
    /// image keeps its size, with zeros after the header. An appended image
    /// keeps its payload, hash tree, and partition size.
    pub fn with_header(&self, header: &Header) -> Result<Self> {
        match self.kind() {
            ImageKind::Raw => Err(Error::NoHeader),
            ImageKind::Vbmeta => {
                let mut data = header.to_bytes().map_err(Error::Rebuild)?;
                if data.len() > self.data.len() {
                    return Err(Error::Rebuild(avb::Error::TooSmallForHeader(self.len())));
                }
                data.resize(self.data.len(), 0);

                Ok(Self {
                    data,
                    footer: None,
                    header: Some(header.clone()),
                })
            }
            ImageKind::Appended => {
                let footer = self.footer.as_ref().ok_or(Error::NotAppended)?;
                let data = self.data[..footer.vbmeta_offset as usize].to_vec();

                Self::assemble_appended(data, header, self.len())
            }
        }
    }
}
