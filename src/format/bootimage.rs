// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::ops::Range;

use thiserror::Error;
use zerocopy::{little_endian, FromBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::format::padding;

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";

/// Firmware-signed images without a boot header keep their signature in a
/// fixed window past the 512-byte header. Device-specific; see the OS image
/// stitching tooling for the layout.
pub const FALLBACK_SIG_OFFSET: u64 = 512;
pub const FALLBACK_SIG_SIZE: u64 = 480;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Boot image too small to contain header: {0} bytes")]
    Truncated(usize),
    #[error("{0:?} field: invalid value: {1}")]
    InvalidFieldValue(&'static str, u32),
    #[error("Signature region {0:?} exceeds image size {1}")]
    SignatureOutOfBounds(Range<u64>, u64),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the legacy image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_size: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    second_size: little_endian::U32,
    second_addr: little_endian::U32,
    tags_addr: little_endian::U32,
    page_size: little_endian::U32,
    sig_size: little_endian::U32,
}

/// Parsed section sizes of a legacy boot image header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BootHeader {
    pub kernel_size: u32,
    pub ramdisk_size: u32,
    pub second_size: u32,
    pub page_size: u32,
    pub sig_size: u32,
}

/// Parse the boot image header. Returns `None` if the magic is absent, which
/// is not an error: unstitched OS images carry no boot header at all.
pub fn parse_header(data: &[u8]) -> Result<Option<BootHeader>> {
    if data.len() < BOOT_MAGIC.len() || data[..BOOT_MAGIC.len()] != BOOT_MAGIC {
        return Ok(None);
    }

    let Ok((raw, _)) = RawHeader::read_from_prefix(data) else {
        return Err(Error::Truncated(data.len()));
    };

    Ok(Some(BootHeader {
        kernel_size: raw.kernel_size.get(),
        ramdisk_size: raw.ramdisk_size.get(),
        second_size: raw.second_size.get(),
        page_size: raw.page_size.get(),
        sig_size: raw.sig_size.get(),
    }))
}

impl BootHeader {
    /// Byte range of the bootloader signature. The signature lives in the
    /// page following the page-aligned kernel, ramdisk, second-stage, and
    /// header sections. `None` when the image is unsigned.
    pub fn signature_region(&self) -> Result<Option<Range<u64>>> {
        if self.sig_size == 0 {
            return Ok(None);
        }
        if self.page_size == 0 {
            return Err(Error::InvalidFieldValue("page_size", self.page_size));
        }

        let page = u64::from(self.page_size);
        let mut start = page;

        for size in [self.kernel_size, self.ramdisk_size, self.second_size] {
            start += padding::round(u64::from(size), page)
                .ok_or(Error::InvalidFieldValue("page_size", self.page_size))?;
        }

        Ok(Some(start..start + u64::from(self.sig_size)))
    }
}

/// Compute the signature region for an image blob. Images with the boot
/// header magic use the header geometry; anything else falls back to the
/// fixed firmware signature window.
pub fn signature_region(data: &[u8]) -> Result<Option<Range<u64>>> {
    let region = match parse_header(data)? {
        Some(header) => match header.signature_region()? {
            Some(r) => r,
            None => return Ok(None),
        },
        None => FALLBACK_SIG_OFFSET..FALLBACK_SIG_OFFSET + FALLBACK_SIG_SIZE,
    };

    if region.end > data.len() as u64 {
        return Err(Error::SignatureOutOfBounds(region, data.len() as u64));
    }

    Ok(Some(region))
}
