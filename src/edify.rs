// SPDX-FileCopyrightText: 2022-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Builder for the recovery-side installer script. Append-only: every
//! primitive pushes one or more edify statements, and the same inputs always
//! produce byte-identical output.

use std::{
    collections::BTreeSet,
    io::{self, Seek, Write},
    sync::LazyLock,
};

use regex::Regex;
use thiserror::Error;
use tracing::warn;
use zip::{result::ZipError, write::FileOptions, CompressionMethod, ZipWriter};

pub const PATH_UPDATER_SCRIPT: &str = "META-INF/com/android/updater-script";
pub const PATH_UPDATE_BINARY: &str = "META-INF/com/android/update-binary";

/// Sector size used to convert partition-table LBAs into byte offsets.
const SECTOR_SIZE: u64 = 512;

static LBA_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-b (\d+)").expect("valid regex"));

#[derive(Debug, Error)]
pub enum Error {
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub struct EdifyScript {
    version: u32,
    lines: Vec<String>,
    mounts: BTreeSet<String>,
    cur_progress: f64,
}

impl EdifyScript {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            lines: vec![],
            mounts: BTreeSet::new(),
            cur_progress: 0.0,
        }
    }

    /// A sub-script sharing this script's dialect. Used to materialize the
    /// permission phase before the symlink phase is emitted and splice it
    /// in afterwards via [`Self::append_script`].
    pub fn temporary(&self) -> Self {
        Self::new(self.version)
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Sum of all `show_progress` fractions emitted so far.
    pub fn cur_progress(&self) -> f64 {
        self.cur_progress
    }

    fn block_device(mount_point: &str) -> String {
        let partition = mount_point.trim_start_matches('/');
        format!("/dev/block/by-name/{partition}")
    }

    pub fn assert_device(&mut self, device: &str) {
        self.lines.push(format!(
            "assert(getprop(\"ro.product.device\") == \"{device}\" || \
             getprop(\"ro.build.product\") == \"{device}\");"
        ));
    }

    pub fn assert_compatible_product(&mut self, products: &[String]) {
        let clauses: Vec<String> = products
            .iter()
            .map(|p| format!("getprop(\"ro.product.name\") == \"{p}\""))
            .collect();

        self.lines.push(format!("assert({});", clauses.join(" || ")));
    }

    pub fn assert_older_build(&mut self, timestamp: &str) {
        self.lines.push(format!(
            "assert(!less_than_int({timestamp}, getprop(\"ro.build.date.utc\")));"
        ));
    }

    pub fn assert_some_fingerprint(&mut self, fingerprints: &[&str]) {
        let clauses: Vec<String> = fingerprints
            .iter()
            .map(|fp| {
                format!(
                    "file_getprop(\"/system/build.prop\", \"ro.build.fingerprint\") == \"{fp}\""
                )
            })
            .collect();

        self.lines.push(format!("assert({});", clauses.join(" ||\n       ")));
    }

    pub fn mount(&mut self, mount_point: &str) {
        self.lines.push(format!(
            "mount(\"ext4\", \"EMMC\", \"{}\", \"{mount_point}\");",
            Self::block_device(mount_point),
        ));
        self.mounts.insert(mount_point.to_owned());
    }

    pub fn unmount(&mut self, mount_point: &str) {
        self.lines.push(format!("unmount(\"{mount_point}\");"));
        self.mounts.remove(mount_point);
    }

    pub fn unmount_all(&mut self) {
        for mount_point in std::mem::take(&mut self.mounts) {
            self.lines.push(format!("unmount(\"{mount_point}\");"));
        }
    }

    pub fn format_partition(&mut self, mount_point: &str) {
        self.lines.push(format!(
            "format(\"ext4\", \"EMMC\", \"{}\");",
            Self::block_device(mount_point),
        ));
    }

    pub fn show_progress(&mut self, fraction: f64, duration: u32) {
        self.cur_progress += fraction;
        self.lines
            .push(format!("show_progress({fraction:.6}, {duration});"));
    }

    pub fn set_progress(&mut self, fraction: f64) {
        self.lines.push(format!("set_progress({fraction:.6});"));
    }

    pub fn print(&mut self, message: &str) {
        self.lines.push(format!("ui_print(\"{message}\");"));
    }

    pub fn comment(&mut self, comment: &str) {
        self.lines.push(String::new());
        for line in comment.split('\n') {
            self.lines.push(format!("# {line}"));
        }
        self.lines.push(String::new());
    }

    /// Extract a package entry to `/tmp/<name>`.
    pub fn package_extract(&mut self, name: &str) {
        self.lines
            .push(format!("package_extract_file(\"{name}\", \"/tmp/{name}\");"));
    }

    pub fn unpack_package_dir(&mut self, src: &str, dst: &str) {
        self.lines
            .push(format!("package_extract_dir(\"{src}\", \"{dst}\");"));
    }

    pub fn delete_files(&mut self, paths: &[String]) {
        if paths.is_empty() {
            return;
        }

        let quoted: Vec<String> = paths.iter().map(|p| format!("\"{p}\"")).collect();
        self.lines.push(format!("delete({});", quoted.join(", ")));
    }

    pub fn delete_tmp_image(&mut self, file_name: &str) {
        self.lines.push(format!("delete(\"/tmp/{file_name}\");"));
    }

    /// Read a device image back into `/tmp/<file_name>` so it can be
    /// verified and patched in place.
    pub fn extract_image(&mut self, name: &str, file_name: &str) {
        self.lines
            .push(format!("extract_image(\"{name}\", \"/tmp/{file_name}\");"));
    }

    pub fn patch_check(&mut self, path: &str, target_sha1: &str, source_sha1: &str) {
        self.lines.push(format!(
            "assert(apply_patch_check(\"{path}\", \"{target_sha1}\", \"{source_sha1}\"));"
        ));
    }

    pub fn cache_free_space_check(&mut self, bytes: u64) {
        self.lines.push(format!("assert(apply_patch_space({bytes}));"));
    }

    pub fn apply_patch(
        &mut self,
        path: &str,
        target_size: u64,
        target_sha1: &str,
        source_sha1: &str,
        patch_path: &str,
    ) {
        self.lines.push(format!(
            "apply_patch(\"{path}\", \"-\", {target_size}, \"{target_sha1}\", \
             \"{source_sha1}\", \"{patch_path}\");"
        ));
    }

    /// Emit symlink creation grouped by target. Pairs must already be
    /// sorted; grouping preserves that order.
    pub fn make_symlinks<'a>(&mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut current: Option<(String, Vec<String>)> = None;
        let mut flush = |lines: &mut Vec<String>, group: Option<(String, Vec<String>)>| {
            if let Some((target, links)) = group {
                let quoted: Vec<String> = links.iter().map(|l| format!("\"{l}\"")).collect();
                lines.push(format!("symlink(\"{target}\", {});", quoted.join(", ")));
            }
        };

        for (target, link) in pairs {
            match &mut current {
                Some((t, links)) if t == target => links.push(link.to_owned()),
                _ => {
                    flush(&mut self.lines, current.take());
                    current = Some((target.to_owned(), vec![link.to_owned()]));
                }
            }
        }
        flush(&mut self.lines, current);
    }

    pub fn set_perm(&mut self, path: &str, uid: u32, gid: u32, mode: u32) {
        self.lines
            .push(format!("set_perm({uid}, {gid}, 0{mode:o}, \"{path}\");"));
    }

    pub fn set_perm_recursive(&mut self, path: &str, uid: u32, gid: u32, dmode: u32, fmode: u32) {
        self.lines.push(format!(
            "set_perm_recursive({uid}, {gid}, 0{dmode:o}, 0{fmode:o}, \"{path}\");"
        ));
    }

    pub fn flash_os_image(&mut self, file_name: &str, partition: &str) {
        self.lines.push(format!(
            "flash_os_image(\"/tmp/{file_name}\", \"{partition}\");"
        ));
    }

    pub fn flash_image_at_offset(&mut self, file_name: &str, byte_offset: u64) {
        self.lines.push(format!(
            "flash_image_at_offset(\"/tmp/{file_name}\", {byte_offset});"
        ));
    }

    pub fn flash_esp_update(&mut self, file_name: &str) {
        self.lines
            .push(format!("flash_esp_update(\"/tmp/{file_name}\");"));
    }

    pub fn flash_ifwi(&mut self, file_name: &str) {
        self.lines.push(format!("flash_ifwi(\"/tmp/{file_name}\");"));
    }

    pub fn flash_capsule(&mut self, file_name: &str) {
        self.lines.push(format!("flash_capsule(\"/tmp/{file_name}\");"));
    }

    pub fn flash_ulpmc(&mut self, file_name: &str) {
        self.lines.push(format!("flash_ulpmc(\"/tmp/{file_name}\");"));
    }

    pub fn flash_partition_scheme(&mut self, file_name: &str) {
        self.lines
            .push(format!("flash_partition_scheme(\"/tmp/{file_name}\");"));
    }

    pub fn flash_bom_token(&mut self, file_name: &str) {
        self.lines
            .push(format!("flash_bom_token(\"/tmp/{file_name}\");"));
    }

    /// Flash dispatch: firmware names use their dedicated primitives; OS
    /// images go through the partition table when one is in play.
    pub fn flash_image(
        &mut self,
        name: &str,
        file_name: &str,
        partition_table: Option<&str>,
    ) {
        match name {
            "esp" => self.flash_esp_update(file_name),
            "ifwi" => self.flash_ifwi(file_name),
            "capsule" => self.flash_capsule(file_name),
            "ulpmc" => self.flash_ulpmc(file_name),
            _ => match partition_table.and_then(|t| lba_start(t, name)) {
                Some(lba) => self.flash_image_at_offset(file_name, lba * SECTOR_SIZE),
                None => {
                    if partition_table.is_some() {
                        warn!("No partition table entry for {name}; flashing by name");
                    }
                    self.flash_os_image(file_name, name);
                }
            },
        }
    }

    pub fn invalidate_os(&mut self, name: &str) {
        self.lines.push(format!("invalidate_os(\"{name}\");"));
    }

    pub fn restore_os(&mut self, name: &str) {
        self.lines.push(format!("restore_os(\"{name}\");"));
    }

    pub fn start_update(&mut self) {
        self.lines.push("start_update();".to_owned());
    }

    pub fn finalize_update(&mut self) {
        self.lines.push("finalize_update();".to_owned());
    }

    /// Present in the vocabulary for ASLR-retouched libraries; emission is
    /// gated by configuration and defaults to off.
    pub fn retouch_binaries(&mut self, files: &[(String, String)]) {
        let args: Vec<String> = files
            .iter()
            .map(|(path, sha1)| format!("\"{path}\", \"{sha1}\""))
            .collect();
        self.lines
            .push(format!("retouch_binaries({});", args.join(", ")));
    }

    pub fn undo_retouch_binaries(&mut self, files: &[(String, String)]) {
        let args: Vec<String> = files
            .iter()
            .map(|(path, sha1)| format!("\"{path}\", \"{sha1}\""))
            .collect();
        self.lines
            .push(format!("undo_retouch_binaries({});", args.join(", ")));
    }

    pub fn append_extra(&mut self, text: &str) {
        for line in text.trim_end_matches('\n').split('\n') {
            self.lines.push(line.to_owned());
        }
    }

    pub fn append_script(&mut self, other: EdifyScript) {
        self.lines.extend(other.lines);
        self.cur_progress += other.cur_progress;
        self.mounts.extend(other.mounts);
    }

    /// Serialize the script into the package, along with the device-side
    /// interpreter when the target archive ships one.
    pub fn add_to_zip<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        updater: Option<&[u8]>,
    ) -> Result<()> {
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file(PATH_UPDATER_SCRIPT, options)?;
        for line in &self.lines {
            zip.write_all(line.as_bytes())?;
            zip.write_all(b"\n")?;
        }

        if let Some(data) = updater {
            zip.start_file(PATH_UPDATE_BINARY, options.unix_permissions(0o755))?;
            zip.write_all(data)?;
        }

        Ok(())
    }
}

/// Scan a partition table for the `-l <name>` entry (case-insensitive) and
/// return its `-b` LBA.
fn lba_start(table: &str, name: &str) -> Option<u64> {
    let name_lower = name.to_lowercase();

    for line in table.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let has_label = tokens
            .windows(2)
            .any(|w| w[0] == "-l" && w[1].to_lowercase() == name_lower);

        if has_label {
            return LBA_START
                .captures(line)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok());
        }
    }

    None
}
