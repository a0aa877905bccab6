// SPDX-FileCopyrightText: 2022-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Enumeration of the `SYSTEM/` subtree: copies regular files into the
//! output archive under `system/`, collects symlinks for the installer
//! script, and registers every materialized entry in the metadata tree.

use std::{
    collections::BTreeMap,
    io::{self, Read, Seek, Write},
};

use bstr::ByteSlice;
use thiserror::Error;
use zip::{result::ZipError, write::FileOptions, CompressionMethod, ZipWriter};

use crate::{
    format::targetfiles::{self, FileBlob, TargetFiles, SYSTEM_PREFIX},
    perms::{self, PermTree},
};

/// Zip external-attribute mode identifying a symlink entry.
const SYMLINK_MODE: u32 = 0o120777;

/// File-type nibble for regular files.
const REGULAR_TYPE: u32 = 0o10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Symlink target is not UTF-8: {} -> {:?}", .0, .1.as_bstr())]
    SymlinkTargetNotUtf8(String, Vec<u8>),
    #[error("Tree error")]
    Tree(#[from] perms::Error),
    #[error("Target-files error")]
    TargetFiles(#[from] targetfiles::Error),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// `(target, link)` pair for the installer's symlink primitive. Field order
/// gives the pair comparison sort key, target first.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Symlink {
    pub target: String,
    pub link: String,
}

/// Replacement content for selected files: `Some(bytes)` substitutes the
/// data, `None` omits the file from the package and the tree entirely.
pub type Substitutions = BTreeMap<String, Option<Vec<u8>>>;

pub struct SystemScan {
    /// Regular files keyed by rewritten archive path (`system/...`).
    pub files: BTreeMap<String, FileBlob>,
    /// Sorted symlink list.
    pub symlinks: Vec<Symlink>,
    /// `(device_path, sha1)` for shared objects, kept for the retouch
    /// vocabulary even though emission is gated off.
    pub retouch: Vec<(String, String)>,
}

pub fn scan_system<R: Read + Seek, W: Write + Seek>(
    tf: &mut TargetFiles<R>,
    tree: &mut PermTree,
    mut output: Option<&mut ZipWriter<W>>,
    substitutions: Option<&Substitutions>,
) -> Result<SystemScan> {
    let mut scan = SystemScan {
        files: BTreeMap::new(),
        symlinks: vec![],
        retouch: vec![],
    };

    tree.ensure_node("system", true)?;

    let archive = tf.archive_mut();
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(SYSTEM_PREFIX) && n.len() > SYSTEM_PREFIX.len())
        .map(str::to_owned)
        .collect();
    // The name index iterates in hash order; the output archive must not.
    names.sort_unstable();

    for name in names {
        let relpath = &name[SYSTEM_PREFIX.len()..];

        let mut entry = archive.by_name(&name)?;
        let mode = entry.unix_mode();

        if mode == Some(SYMLINK_MODE) {
            let mut target = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut target)?;

            let link = format!("/system/{relpath}");
            let target = String::from_utf8(target)
                .map_err(|e| Error::SymlinkTargetNotUtf8(link.clone(), e.into_bytes()))?;

            scan.symlinks.push(Symlink { target, link });
            continue;
        }

        let is_dir = relpath.ends_with('/');
        let rewritten = format!("system/{relpath}");

        if is_dir {
            tree.ensure_node(rewritten.trim_end_matches('/'), true)?;

            if let Some(zip) = output.as_deref_mut() {
                zip.add_directory(rewritten, entry_options(mode, 0o755))?;
            }
            continue;
        }

        let data = match substitutions.and_then(|s| s.get(&rewritten)) {
            Some(None) => continue,
            Some(Some(replacement)) => replacement.clone(),
            None => {
                let mut buf = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut buf)?;
                buf
            }
        };

        tree.ensure_node(&rewritten, false)?;

        if let Some(zip) = output.as_deref_mut() {
            zip.start_file(&rewritten, entry_options(mode, 0o644))?;
            zip.write_all(&data)?;
        }

        let blob = FileBlob::new(rewritten.clone(), data);

        if mode.is_some_and(|m| m >> 12 == REGULAR_TYPE) && relpath.starts_with("lib/") {
            scan.retouch
                .push((format!("/system/{relpath}"), blob.sha1().to_owned()));
        }

        scan.files.insert(rewritten, blob);
    }

    scan.symlinks.sort();

    Ok(scan)
}

fn entry_options(mode: Option<u32>, fallback: u32) -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(mode.map_or(fallback, |m| m & 0o7777))
}
