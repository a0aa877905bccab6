// SPDX-FileCopyrightText: 2022-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Drives one composition: scans the target archive(s), plans file and image
//! updates, emits the installer script in contract order, and assembles the
//! package entries. The caller signs the finished archive.

use std::{
    collections::BTreeMap,
    io::{self, Read, Seek, Write},
};

use thiserror::Error;
use tracing::warn;
use zip::{result::ZipError, write::FileOptions, CompressionMethod, ZipWriter};

use crate::{
    config::{self, MiscInfo, Options},
    diff::{self, Difference},
    edify::{self, EdifyScript},
    format::targetfiles::{self, TargetFiles, PATH_PARTITION_TABLE, PATH_UPDATER},
    hook::DeviceHook,
    image::{self, ImageDecision, PlannedImage},
    perms::{self, PermTree},
    sysfiles::{self, Symlink},
};

pub const PATH_OTA_METADATA: &str = "META-INF/com/android/metadata";

/// Archive name the partition table ships under in the package.
const NAME_PARTITION_TABLE: &str = "partition.tbl";

/// Recovery API versions this generator knows how to speak.
const KNOWN_API_VERSIONS: [u32; 2] = [2, 3];
const DEFAULT_API_VERSION: u32 = 3;

/// Budget split of the installer progress bar.
const PROGRESS_STATIC: f64 = 0.5;
const PROGRESS_IMAGES: f64 = 0.4;
const PROGRESS_VERIFY: f64 = 0.1;
const PROGRESS_MUTATE: f64 = 0.8;
const PROGRESS_PERMS: f64 = 0.1;
const PROGRESS_FLOOR: f64 = 0.9;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Installer progress ends at {0:.2}, below the {PROGRESS_FLOOR} floor")]
    ProgressUnderrun(f64),
    #[error("Config error")]
    Config(#[from] config::Error),
    #[error("Target-files error")]
    TargetFiles(#[from] targetfiles::Error),
    #[error("Metadata tree error")]
    Tree(#[from] perms::Error),
    #[error("System scan error")]
    SysFiles(#[from] sysfiles::Error),
    #[error("Diff error")]
    Diff(#[from] diff::Error),
    #[error("Image error")]
    Image(#[from] image::Error),
    #[error("Script error")]
    Edify(#[from] edify::Error),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub struct Composer<'a> {
    pub options: &'a Options,
    pub differ: &'a (dyn Difference + Sync),
    pub hook: &'a dyn DeviceHook,
    /// External helper consulted when the archive carries no
    /// `META/filesystem_config.txt`.
    pub fs_config_helper: String,
}

/// Intel provisioning phases derived from misc info; all off unless the
/// Intel surface is enabled.
#[derive(Clone, Copy, Debug, Default)]
struct DevicePhases {
    chaabi: bool,
    partitioning: bool,
    iafw_bios: bool,
}

impl DevicePhases {
    fn new(misc: &MiscInfo, options: &Options) -> Self {
        if !options.intel_ota {
            return Self::default();
        }

        Self {
            chaabi: misc.flag("intel_chaabi_token"),
            partitioning: misc.flag("do_partitioning"),
            iafw_bios: misc.get("bios_type") == Some("iafw"),
        }
    }
}

fn find_recovery(plan: &image::ImagePlan) -> Option<&PlannedImage> {
    plan.images
        .iter()
        .find(|p| matches!(p.decision, ImageDecision::RecoveryFromBoot { .. }))
}

impl<'a> Composer<'a> {
    fn script_for(&self, misc: &MiscInfo) -> EdifyScript {
        let version = match misc.recovery_api_version() {
            Some(v) if KNOWN_API_VERSIONS.contains(&v) => v,
            Some(v) => {
                warn!("Unknown recovery API version {v}; generating for v{DEFAULT_API_VERSION}");
                DEFAULT_API_VERSION
            }
            None => {
                warn!("No recovery API version declared; generating for v{DEFAULT_API_VERSION}");
                DEFAULT_API_VERSION
            }
        };

        EdifyScript::new(version)
    }

    /// Compute the recovery-from-boot artifacts, write them into the
    /// package, and register their device paths in the tree. Metadata for
    /// the two synthesized files is applied separately, after resolution.
    fn emit_recovery_patch<W: Write + Seek>(
        &self,
        planned: &PlannedImage,
        output: &mut ZipWriter<W>,
        tree: &mut PermTree,
    ) -> Result<()> {
        let ImageDecision::RecoveryFromBoot { boot, recovery } = &planned.decision else {
            return Ok(());
        };

        let rp = image::make_recovery_patch(self.differ, boot, recovery)?;

        write_blob(output, image::ARCHIVE_RECOVERY_PATCH, &rp.patch)?;
        write_blob(
            output,
            image::ARCHIVE_INSTALL_RECOVERY,
            rp.install_script.as_bytes(),
        )?;

        tree.ensure_node(image::DEVICE_RECOVERY_PATCH, false)?;
        tree.ensure_node(image::DEVICE_INSTALL_RECOVERY, false)?;

        Ok(())
    }

    /// Resolve filesystem metadata for every registered node, then pin the
    /// synthesized recovery artifacts, which no config source knows about.
    fn resolve_tree<R: Read + Seek>(
        &self,
        tf: &mut TargetFiles<R>,
        tree: &mut PermTree,
        has_recovery: bool,
    ) -> Result<()> {
        match tf.fs_config_text()? {
            Some(text) => tree.apply_config_text(&text)?,
            None => tree.run_fs_config_helper(&self.fs_config_helper)?,
        }

        if has_recovery {
            tree.set_perms(image::DEVICE_RECOVERY_PATCH, 0, 0, 0o644)?;
            tree.set_perms(image::DEVICE_INSTALL_RECOVERY, 0, 0, 0o544)?;
        }

        tree.sort_children();

        Ok(())
    }

    fn finish_package<R: Read + Seek, W: Write + Seek>(
        &self,
        target: &mut TargetFiles<R>,
        output: &mut ZipWriter<W>,
        script: &EdifyScript,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let updater = target.read_entry_opt(PATH_UPDATER)?;
        if updater.is_none() {
            warn!("Target archive ships no updater binary");
        }

        script.add_to_zip(output, updater.as_deref())?;
        write_metadata(output, metadata)?;

        Ok(())
    }

    pub fn write_full_ota<R: Read + Seek, W: Write + Seek>(
        &self,
        target: &mut TargetFiles<R>,
        output: &mut ZipWriter<W>,
    ) -> Result<()> {
        let misc = target.misc_info()?;
        let props = target.build_props()?;
        let phases = DevicePhases::new(&misc, self.options);

        let mut metadata = BTreeMap::new();
        metadata.insert("post-build".to_owned(), props.fingerprint()?.to_owned());
        metadata.insert("pre-device".to_owned(), props.device()?.to_owned());
        metadata.insert("post-timestamp".to_owned(), props.timestamp()?.to_owned());

        let mut tree = PermTree::new();
        let scan = sysfiles::scan_system(target, &mut tree, Some(&mut *output), None)?;

        let roster = image::build_roster(&misc, self.options.intel_ota);
        let plan = image::plan_images(
            target,
            None::<&mut TargetFiles<R>>,
            &roster,
            phases.partitioning,
            false,
        )?;

        let recovery_planned = find_recovery(&plan);
        if let Some(planned) = recovery_planned {
            self.emit_recovery_patch(planned, output, &mut tree)?;
        }
        self.resolve_tree(target, &mut tree, recovery_planned.is_some())?;

        let mut script = self.script_for(&misc);

        script.assert_device(props.device()?);
        script.assert_compatible_product(&misc.compatible_products(props.product_name()?)?);
        if !self.options.omit_prereq {
            script.assert_older_build(props.timestamp()?);
        }

        self.hook.full_ota_assertions(&mut script);

        script.show_progress(PROGRESS_STATIC, 0);

        if phases.chaabi {
            script.mount("/system");
            script.start_update();
            script.unmount("/system");
        }

        let partition_table = if phases.partitioning {
            let raw = target.read_entry(PATH_PARTITION_TABLE)?;
            let text = String::from_utf8(raw)
                .map_err(|_| targetfiles::Error::EntryNotUtf8(PATH_PARTITION_TABLE.to_owned()))?;

            write_blob(output, NAME_PARTITION_TABLE, text.as_bytes())?;
            script.package_extract(NAME_PARTITION_TABLE);
            script.flash_partition_scheme(NAME_PARTITION_TABLE);

            Some(text)
        } else {
            None
        };

        if phases.iafw_bios {
            script.invalidate_os("boot");
        }

        if phases.chaabi {
            let ifwi_file = image::image_file_name("ifwi");
            script.package_extract(&ifwi_file);
            script.flash_bom_token(&ifwi_file);
        }

        if self.options.wipe_user_data {
            script.format_partition("/data");
        }

        script.format_partition("/system");
        script.mount("/system");
        script.print("Copying system files...");
        script.unpack_package_dir("recovery", "/system");
        script.unpack_package_dir("system", "/system");

        script.make_symlinks(scan.symlinks.iter().map(|s| (s.target.as_str(), s.link.as_str())));
        if self.options.emit_retouch && !scan.retouch.is_empty() {
            script.retouch_binaries(&scan.retouch);
        }

        let image_count = plan.images.len();
        for planned in &plan.images {
            script.show_progress(PROGRESS_IMAGES / image_count as f64, 5);

            match &planned.decision {
                ImageDecision::RecoveryFromBoot { .. } => {
                    // Already materialized; rebuilt on the device at first
                    // boot rather than flashed here.
                }
                ImageDecision::FullFlash(blob) => {
                    image::check_size(blob, &planned.name, &misc)?;
                    write_blob(output, &planned.file_name, blob.data())?;

                    script.print(&format!("Writing {} image...", planned.name));
                    script.package_extract(&planned.file_name);
                    script.flash_image(
                        &planned.name,
                        &planned.file_name,
                        partition_table.as_deref(),
                    );
                    script.delete_tmp_image(&planned.file_name);
                }
                ImageDecision::IncrementalPatch { .. } => {
                    unreachable!("no source archive in full mode")
                }
            }
        }

        script.show_progress(PROGRESS_PERMS, 10);
        tree.set_permissions("system", &mut script)?;

        if let Some(extra) = &self.options.extra_script {
            script.append_extra(extra);
        }
        if phases.chaabi {
            script.finalize_update();
        }
        script.unmount_all();
        if phases.iafw_bios {
            script.restore_os("boot");
        }

        self.hook.full_ota_install_end(&mut script);

        if script.cur_progress() < PROGRESS_FLOOR {
            return Err(Error::ProgressUnderrun(script.cur_progress()));
        }

        self.finish_package(target, output, &script, &metadata)
    }

    pub fn write_incremental_ota<R, S, W>(
        &self,
        target: &mut TargetFiles<R>,
        source: &mut TargetFiles<S>,
        output: &mut ZipWriter<W>,
    ) -> Result<()>
    where
        R: Read + Seek,
        S: Read + Seek,
        W: Write + Seek,
    {
        let misc = target.misc_info()?;
        let src_misc = source.misc_info()?;
        let props = target.build_props()?;
        let src_props = source.build_props()?;
        let phases = DevicePhases::new(&misc, self.options);

        if src_misc.recovery_api_version().is_none() {
            warn!("Source archive declares no recovery API version");
        }

        let fromgb = src_props.build_id() == Some("GINGERBREAD");

        let mut metadata = BTreeMap::new();
        metadata.insert("pre-build".to_owned(), src_props.fingerprint()?.to_owned());
        metadata.insert("post-build".to_owned(), props.fingerprint()?.to_owned());
        metadata.insert("pre-device".to_owned(), props.device()?.to_owned());
        metadata.insert("post-timestamp".to_owned(), props.timestamp()?.to_owned());
        if fromgb {
            metadata.insert("fromgb".to_owned(), "true".to_owned());
        }

        // Independent trees for the two scans; only the target's metadata
        // feeds the permission plan.
        let mut tree = PermTree::new();
        let target_scan = sysfiles::scan_system::<_, W>(target, &mut tree, None, None)?;

        let mut source_tree = PermTree::new();
        let source_scan = sysfiles::scan_system::<_, W>(source, &mut source_tree, None, None)?;

        let diff_plan = diff::plan_file_diffs(
            &source_scan.files,
            &target_scan.files,
            self.differ,
            self.options,
        )?;

        let roster = image::build_roster(&misc, self.options.intel_ota);
        let plan =
            image::plan_images(target, Some(source), &roster, phases.partitioning, fromgb)?;

        let recovery_planned = find_recovery(&plan);
        if let Some(planned) = recovery_planned {
            self.emit_recovery_patch(planned, output, &mut tree)?;
        }
        self.resolve_tree(target, &mut tree, recovery_planned.is_some())?;

        let largest_source_size = diff_plan.largest_source_size.max(plan.largest_source_size);

        let mut script = self.script_for(&misc);

        script.assert_some_fingerprint(&[src_props.fingerprint()?, props.fingerprint()?]);
        script.assert_device(props.device()?);
        script.assert_compatible_product(&misc.compatible_products(props.product_name()?)?);
        if !self.options.omit_prereq {
            script.assert_older_build(props.timestamp()?);
        }

        self.hook.incremental_ota_assertions(&mut script);

        script.mount("/system");

        // Verify phase: prove every patch source is intact before touching
        // anything. Progress advances with the bytes being hashed.
        script.print("Verifying current system...");
        script.show_progress(PROGRESS_VERIFY, 0);

        let image_patches: Vec<&PlannedImage> = plan
            .images
            .iter()
            .filter(|p| matches!(p.decision, ImageDecision::IncrementalPatch { .. }))
            .collect();

        let total_verify = diff_plan
            .patches
            .iter()
            .map(|p| p.source_size)
            .chain(image_patches.iter().map(|p| match &p.decision {
                ImageDecision::IncrementalPatch { source, .. } => source.size(),
                _ => 0,
            }))
            .sum::<u64>() as f64
            + 1.0;
        let mut verified = 0u64;

        for patch in &diff_plan.patches {
            script.patch_check(
                &format!("/{}", patch.path),
                &patch.target_sha1,
                &patch.source_sha1,
            );
            verified += patch.source_size;
            script.set_progress(verified as f64 / total_verify);
        }

        for planned in &image_patches {
            let ImageDecision::IncrementalPatch { source: src, target: tgt } = &planned.decision
            else {
                continue;
            };

            script.extract_image(&planned.name, &planned.file_name);
            script.patch_check(&format!("/tmp/{}", planned.file_name), tgt.sha1(), src.sha1());
            script.cache_free_space_check(tgt.size());
            verified += src.size();
            script.set_progress(verified as f64 / total_verify);
        }

        if !diff_plan.patches.is_empty() || !image_patches.is_empty() {
            script.cache_free_space_check(largest_source_size);
        }

        self.hook.incremental_ota_verify_end(&mut script);

        // Permission plan is materialized now (the tree is final) but only
        // spliced in after the symlinks exist.
        let mut perm_script = script.temporary();
        tree.set_permissions("system", &mut perm_script)?;

        script.comment("---- start making changes here ----");

        if self.options.wipe_user_data {
            script.print("Erasing user data...");
            script.format_partition("/data");
        }

        script.print("Removing unneeded files...");
        let mut to_delete: Vec<String> = source_scan
            .files
            .keys()
            .filter(|path| !target_scan.files.contains_key(*path))
            .chain(diff_plan.verbatim.iter())
            .map(|path| format!("/{path}"))
            .collect();
        to_delete.sort_unstable();
        to_delete.dedup();
        script.delete_files(&to_delete);

        script.show_progress(PROGRESS_MUTATE, 0);

        let total_mutate = plan
            .images
            .iter()
            .map(|p| match &p.decision {
                ImageDecision::FullFlash(blob) => blob.size(),
                ImageDecision::IncrementalPatch { target, .. } => target.size(),
                ImageDecision::RecoveryFromBoot { .. } => 0,
            })
            .sum::<u64>() as f64
            + diff_plan.patches.iter().map(|p| p.target_size).sum::<u64>() as f64
            + 1.0;
        let mut mutated = 0u64;

        for planned in &plan.images {
            let ImageDecision::FullFlash(blob) = &planned.decision else {
                continue;
            };

            image::check_size(blob, &planned.name, &misc)?;
            write_blob(output, &planned.file_name, blob.data())?;

            script.print(&format!("Writing {} image...", planned.name));
            script.package_extract(&planned.file_name);
            script.flash_image(&planned.name, &planned.file_name, None);
            script.delete_tmp_image(&planned.file_name);
            mutated += blob.size();
            script.set_progress(mutated as f64 / total_mutate);
        }

        script.print("Patching system files...");
        let mut deferred = None;
        for patch in &diff_plan.patches {
            let archive_path = format!("patch/{}.p", patch.path);
            write_blob(output, &archive_path, &patch.patch)?;

            if patch.path == "system/build.prop" {
                // Applied last: a patched build.prop must never precede the
                // files it fingerprints.
                deferred = Some((patch, archive_path));
                continue;
            }

            script.apply_patch(
                &format!("/{}", patch.path),
                patch.target_size,
                &patch.target_sha1,
                &patch.source_sha1,
                &archive_path,
            );
            mutated += patch.target_size;
            script.set_progress(mutated as f64 / total_mutate);
        }

        for planned in &image_patches {
            let ImageDecision::IncrementalPatch { source: src, target: tgt } = &planned.decision
            else {
                continue;
            };

            image::check_size(tgt, &planned.name, &misc)?;
            let patch = self.differ.compute_patch(src.data(), tgt.data())?;
            let archive_path = format!("patch/{}.p", planned.file_name);
            write_blob(output, &archive_path, &patch)?;

            script.print(&format!("Patching {} image...", planned.name));
            script.apply_patch(
                &format!("/tmp/{}", planned.file_name),
                tgt.size(),
                tgt.sha1(),
                src.sha1(),
                &archive_path,
            );
            script.flash_image(&planned.name, &planned.file_name, None);
            script.delete_tmp_image(&planned.file_name);
            mutated += tgt.size();
            script.set_progress(mutated as f64 / total_mutate);
        }

        if recovery_planned.is_some() {
            script.print("Patching recovery image...");
            script.unpack_package_dir("recovery", "/system");
        }

        script.show_progress(PROGRESS_PERMS, 10);
        script.print("Symlinks and permissions...");

        let target_links: BTreeMap<&str, &str> = target_scan
            .symlinks
            .iter()
            .map(|s| (s.link.as_str(), s.target.as_str()))
            .collect();
        let source_links: BTreeMap<&str, &str> = source_scan
            .symlinks
            .iter()
            .map(|s| (s.link.as_str(), s.target.as_str()))
            .collect();

        // Stale links go first: a source symlink may be replaced by a real
        // file that the verbatim unpack is about to create.
        let stale: Vec<String> = source_scan
            .symlinks
            .iter()
            .filter(|s| !target_links.contains_key(s.link.as_str()))
            .map(|s| s.link.clone())
            .collect();
        script.delete_files(&stale);

        if !diff_plan.verbatim.is_empty() {
            for path in &diff_plan.verbatim {
                write_blob(output, path, target_scan.files[path].data())?;
            }

            script.print("Unpacking new files...");
            script.unpack_package_dir("system", "/system");
        }

        let to_create: Vec<&Symlink> = target_scan
            .symlinks
            .iter()
            .filter(|s| source_links.get(s.link.as_str()) != Some(&s.target.as_str()))
            .collect();
        let replaced: Vec<String> = to_create
            .iter()
            .filter(|s| source_links.contains_key(s.link.as_str()))
            .map(|s| s.link.clone())
            .collect();
        script.delete_files(&replaced);
        script.make_symlinks(to_create.iter().map(|s| (s.target.as_str(), s.link.as_str())));

        script.append_script(perm_script);

        self.hook.incremental_ota_install_end(&mut script);

        if let Some(extra) = &self.options.extra_script {
            script.append_extra(extra);
        }

        if let Some((patch, archive_path)) = deferred {
            script.apply_patch(
                &format!("/{}", patch.path),
                patch.target_size,
                &patch.target_sha1,
                &patch.source_sha1,
                &archive_path,
            );
            script.set_perm("/system/build.prop", 0, 0, 0o644);
        }

        self.finish_package(target, output, &script, &metadata)
    }
}

fn write_blob<W: Write + Seek>(zip: &mut ZipWriter<W>, name: &str, data: &[u8]) -> Result<()> {
    zip.start_file(
        name,
        FileOptions::default().compression_method(CompressionMethod::Deflated),
    )?;
    zip.write_all(data)?;

    Ok(())
}

/// `key=value` lines in sorted key order.
fn write_metadata<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    metadata: &BTreeMap<String, String>,
) -> Result<()> {
    zip.start_file(
        PATH_OTA_METADATA,
        FileOptions::default().compression_method(CompressionMethod::Deflated),
    )?;
    for (key, value) in metadata {
        writeln!(zip, "{key}={value}")?;
    }

    Ok(())
}
