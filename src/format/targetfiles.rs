// SPDX-FileCopyrightText: 2022-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Seek},
};

use thiserror::Error;
use zip::{result::ZipError, ZipArchive};

use crate::{
    config::{BuildProps, MiscInfo},
    util::{self, NumBytes},
};

pub const PATH_MISC_INFO: &str = "META/misc_info.txt";
pub const PATH_FS_CONFIG: &str = "META/filesystem_config.txt";
pub const PATH_BUILD_PROP: &str = "SYSTEM/build.prop";
pub const PATH_UPDATER: &str = "OTA/bin/updater";
pub const PATH_PARTITION_TABLE: &str = "RADIO/partition.tbl";

pub const SYSTEM_PREFIX: &str = "SYSTEM/";

/// Lookup order for prebuilt image blobs. Build systems differ on where they
/// drop the stitched images, so each conventional location is tried in turn.
const IMAGE_PREFIXES: &[&str] = &["BOOTABLE_IMAGES/", "RADIO/"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing entry in target-files archive: {0}")]
    MissingEntry(String),
    #[error("Entry is not UTF-8 encoded: {0}")]
    EntryNotUtf8(String),
    #[error("Zip error for entry: {0}")]
    ZipEntry(String, #[source] ZipError),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// An archive entry's bytes plus its cached SHA-1 digest. Immutable once
/// constructed so the digest can never go stale.
#[derive(Clone, Eq, PartialEq)]
pub struct FileBlob {
    name: String,
    data: Vec<u8>,
    sha1: String,
}

impl FileBlob {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let sha1 = util::sha1_hex(&data);
        Self {
            name: name.into(),
            data,
            sha1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sha1(&self) -> &str {
        &self.sha1
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl fmt::Debug for FileBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBlob")
            .field("name", &self.name)
            .field("data", &NumBytes(self.data.len()))
            .field("sha1", &self.sha1)
            .finish()
    }
}

/// Read-only accessor for a target-files archive.
pub struct TargetFiles<R: Read + Seek> {
    archive: ZipArchive<R>,
}

impl<R: Read + Seek> TargetFiles<R> {
    pub fn open(reader: R) -> Result<Self> {
        Ok(Self {
            archive: ZipArchive::new(reader)?,
        })
    }

    pub fn archive_mut(&mut self) -> &mut ZipArchive<R> {
        &mut self.archive
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.archive.file_names().any(|n| n == name)
    }

    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        self.read_entry_opt(name)?
            .ok_or_else(|| Error::MissingEntry(name.to_owned()))
    }

    pub fn read_entry_opt(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut entry = match self.archive.by_name(name) {
            Ok(e) => e,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(Error::ZipEntry(name.to_owned(), e)),
        };

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;

        Ok(Some(buf))
    }

    fn read_entry_string(&mut self, name: &str) -> Result<String> {
        let raw = self.read_entry(name)?;
        String::from_utf8(raw).map_err(|_| Error::EntryNotUtf8(name.to_owned()))
    }

    /// `META/misc_info.txt` settings. A required entry; everything about the
    /// device (partition limits, firmware roster, BIOS type) hangs off it.
    pub fn misc_info(&mut self) -> Result<MiscInfo> {
        let text = self.read_entry_string(PATH_MISC_INFO)?;
        Ok(MiscInfo::parse(&text))
    }

    pub fn build_props(&mut self) -> Result<BuildProps> {
        let text = self.read_entry_string(PATH_BUILD_PROP)?;
        Ok(BuildProps::parse(&text))
    }

    /// Raw `META/filesystem_config.txt` records, when the build provided
    /// them. `None` means the caller must fall back to the `fs_config`
    /// helper.
    pub fn fs_config_text(&mut self) -> Result<Option<String>> {
        match self.read_entry_opt(PATH_FS_CONFIG)? {
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|_| Error::EntryNotUtf8(PATH_FS_CONFIG.to_owned())),
            None => Ok(None),
        }
    }

    /// Fetch a prebuilt bootable image by its conventional file name, e.g.
    /// `boot.img` or `ifwi.zip`. Tries `BOOTABLE_IMAGES/` and `RADIO/`, then
    /// the image's own subtree (`BOOT/boot.img`). Absent everywhere is not
    /// an error; the planner decides what absence means per image.
    pub fn image_blob(&mut self, name: &str, file_name: &str) -> Result<Option<FileBlob>> {
        let mut candidates: Vec<String> = IMAGE_PREFIXES
            .iter()
            .map(|p| format!("{p}{file_name}"))
            .collect();
        candidates.push(format!("{}/{}", name.to_uppercase(), file_name));

        for candidate in candidates {
            if let Some(data) = self.read_entry_opt(&candidate)? {
                return Ok(Some(FileBlob::new(file_name, data)));
            }
        }

        Ok(None)
    }
}
