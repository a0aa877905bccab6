// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Bootable-image planning: which images ship whole, which ship as binary
//! patches, and the derived recovery-from-boot patch.

use std::{
    collections::BTreeMap,
    io::{Cursor, Read, Seek},
};

use phf::phf_map;
use thiserror::Error;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::{
    config::MiscInfo,
    diff::{self, Difference},
    format::{
        bootimage,
        targetfiles::{self, FileBlob, TargetFiles},
    },
    util,
};

/// Archive paths for the recovery-from-boot artifacts. Both land under
/// `/system` when the installer extracts the `recovery/` directory.
pub const ARCHIVE_RECOVERY_PATCH: &str = "recovery/recovery-from-boot.p";
pub const ARCHIVE_INSTALL_RECOVERY: &str = "recovery/etc/install-recovery.sh";
pub const DEVICE_RECOVERY_PATCH: &str = "system/recovery-from-boot.p";
pub const DEVICE_INSTALL_RECOVERY: &str = "system/etc/install-recovery.sh";

/// File-name conventions for image blobs; anything unlisted is an `.img`.
static FILE_EXTENSIONS: phf::Map<&'static str, &'static str> = phf_map! {
    "ifwi" => "zip",
    "esp" => "zip",
    "capsule" => "bin",
    "ulpmc" => "bin",
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot build recovery patch: no boot image in target")]
    MissingBootImage,
    #[error("Image {name} is {size} bytes, exceeding the {limit} byte partition limit")]
    SizeViolation { name: String, size: u64, limit: u64 },
    #[error("Boot image error")]
    BootImage(#[from] bootimage::Error),
    #[error("Diff error")]
    Diff(#[from] diff::Error),
    #[error("Target-files error")]
    TargetFiles(#[from] targetfiles::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub fn image_file_name(name: &str) -> String {
    let ext = FILE_EXTENSIONS.get(name).copied().unwrap_or("img");
    format!("{name}.{ext}")
}

/// The ordered set of logical images considered for one composition.
pub fn build_roster(misc: &MiscInfo, intel_ota: bool) -> Vec<&'static str> {
    let mut roster = vec!["boot", "recovery", "fastboot", "esp"];

    if intel_ota {
        if misc.flag("intel_capsule") {
            roster.push("capsule");
        } else {
            roster.push("ifwi");
        }
        if misc.flag("intel_ulpmc") {
            roster.push("ulpmc");
        }
        if misc.flag("has_silentlake") {
            roster.push("silentlake");
        }
    }

    roster
}

#[derive(Debug)]
pub enum ImageDecision {
    FullFlash(FileBlob),
    IncrementalPatch { source: FileBlob, target: FileBlob },
    RecoveryFromBoot { boot: FileBlob, recovery: FileBlob },
}

#[derive(Debug)]
pub struct PlannedImage {
    pub name: String,
    pub file_name: String,
    pub decision: ImageDecision,
}

#[derive(Debug, Default)]
pub struct ImagePlan {
    pub images: Vec<PlannedImage>,
    /// Largest source image among incremental patches; folded into the
    /// verify phase's free-space check.
    pub largest_source_size: u64,
}

/// Decide the fate of every image in the roster. Repartitioning, a
/// first-boot transition, and the firmware images all force whole-image
/// shipping; there is no trustworthy on-device source to patch against.
pub fn plan_images<R: Read + Seek, S: Read + Seek>(
    target: &mut TargetFiles<R>,
    mut source: Option<&mut TargetFiles<S>>,
    roster: &[&str],
    partitioning: bool,
    fromgb: bool,
) -> Result<ImagePlan> {
    let mut plan = ImagePlan::default();

    for &name in roster {
        let file_name = image_file_name(name);

        let Some(target_blob) = target.image_blob(name, &file_name)? else {
            debug!("Image not present in target: {name}");
            continue;
        };

        let source_blob = match source {
            Some(ref mut tf) => tf.image_blob(name, &file_name)?,
            None => None,
        };

        if let Some(src) = &source_blob {
            if src.data() == target_blob.data() {
                warn!("Skipping unchanged image: {name}");
                continue;
            }
        }

        if name == "recovery" {
            let boot = target
                .image_blob("boot", &image_file_name("boot"))?
                .ok_or(Error::MissingBootImage)?;

            plan.images.push(PlannedImage {
                name: name.to_owned(),
                file_name,
                decision: ImageDecision::RecoveryFromBoot {
                    boot,
                    recovery: target_blob,
                },
            });
            continue;
        }

        if name == "ifwi" {
            if let Some(src) = &source_blob {
                if !ifwi_differs(src, &target_blob) {
                    warn!("Skipping IFWI: firmware contents unchanged");
                    continue;
                }
            }
        }

        let firmware = matches!(name, "ifwi" | "capsule" | "ulpmc" | "esp");
        let decision = if partitioning || fromgb || firmware {
            ImageDecision::FullFlash(target_blob)
        } else if let Some(src) = source_blob {
            plan.largest_source_size = plan.largest_source_size.max(src.size());
            ImageDecision::IncrementalPatch {
                source: src,
                target: target_blob,
            }
        } else {
            ImageDecision::FullFlash(target_blob)
        };

        plan.images.push(PlannedImage {
            name: name.to_owned(),
            file_name,
            decision,
        });
    }

    Ok(plan)
}

/// Compare two IFWI containers entry by entry, ignoring archive metadata. A
/// repack with identical firmware files must not trigger a reflash.
pub fn ifwi_differs(source: &FileBlob, target: &FileBlob) -> bool {
    match (zip_digests(source.data()), zip_digests(target.data())) {
        (Some(src), Some(tgt)) => src != tgt,
        // Unparseable container: assume it changed.
        _ => true,
    }
}

fn zip_digests(data: &[u8]) -> Option<BTreeMap<String, String>> {
    let mut archive = ZipArchive::new(Cursor::new(data)).ok()?;
    let mut digests = BTreeMap::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).ok()?;
        if entry.name().ends_with('/') {
            continue;
        }

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf).ok()?;
        digests.insert(entry.name().to_owned(), util::sha1_hex(&buf));
    }

    Some(digests)
}

/// Enforce the declared partition limit for an image, when one exists.
pub fn check_size(blob: &FileBlob, name: &str, misc: &MiscInfo) -> Result<()> {
    let Some(limit) = misc.image_size_limit(name) else {
        return Ok(());
    };

    if blob.size() > limit {
        return Err(Error::SizeViolation {
            name: name.to_owned(),
            size: blob.size(),
            limit,
        });
    }

    Ok(())
}

#[derive(Debug)]
pub struct RecoveryPatch {
    pub patch: Vec<u8>,
    pub install_script: String,
}

/// Build the patch that reconstructs the recovery image from the boot image
/// on first boot, plus the shell script that applies it.
pub fn make_recovery_patch(
    differ: &dyn Difference,
    boot: &FileBlob,
    recovery: &FileBlob,
) -> Result<RecoveryPatch> {
    let patch = differ.compute_patch(boot.data(), recovery.data())?;

    let mut command = String::from("update_recovery");
    if let Some(region) = bootimage::signature_region(recovery.data())? {
        let check = util::sha1_hex(&recovery.data()[region.start as usize..region.end as usize]);
        command.push_str(&format!(" --check-sha1 {check}"));
    }
    command.push_str(&format!(
        " --src-sha1 {} --tgt-sha1 {} --tgt-size {} --patch /{DEVICE_RECOVERY_PATCH}",
        boot.sha1(),
        recovery.sha1(),
        recovery.size(),
    ));

    let install_script = format!(
        "#!/system/bin/sh\n\
         #\n\
         # The recovery partition shares its kernel with boot, so recovery is\n\
         # shipped as a patch of the boot image and rebuilt on first boot.\n\
         \n\
         {command}\n"
    );

    Ok(RecoveryPatch {
        patch,
        install_script,
    })
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use assert_matches::assert_matches;
    use zip::{write::FileOptions, ZipWriter};

    use super::{
        build_roster, check_size, ifwi_differs, image_file_name, make_recovery_patch,
        plan_images, Error, ImageDecision,
    };
    use crate::{
        config::MiscInfo,
        diff::{Difference, Result as DiffResult},
        format::targetfiles::{FileBlob, TargetFiles},
        util,
    };

    struct StubDiff;

    impl Difference for StubDiff {
        fn compute_patch(&self, _source: &[u8], target: &[u8]) -> DiffResult<Vec<u8>> {
            Ok(target.first().map(|b| vec![*b; 4]).unwrap_or_default())
        }
    }

    type Tf = TargetFiles<Cursor<Vec<u8>>>;

    fn archive_with(entries: &[(&str, &[u8])]) -> Tf {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        TargetFiles::open(writer.finish().unwrap()).unwrap()
    }

    fn inner_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn file_name_conventions() {
        assert_eq!(image_file_name("boot"), "boot.img");
        assert_eq!(image_file_name("ifwi"), "ifwi.zip");
        assert_eq!(image_file_name("esp"), "esp.zip");
        assert_eq!(image_file_name("capsule"), "capsule.bin");
        assert_eq!(image_file_name("ulpmc"), "ulpmc.bin");
        assert_eq!(image_file_name("silentlake"), "silentlake.img");
    }

    #[test]
    fn roster_composition() {
        let plain = MiscInfo::parse("");
        assert_eq!(build_roster(&plain, false), ["boot", "recovery", "fastboot", "esp"]);
        assert_eq!(
            build_roster(&plain, true),
            ["boot", "recovery", "fastboot", "esp", "ifwi"]
        );

        let capsule = MiscInfo::parse("intel_capsule=true\nintel_ulpmc=true\nhas_silentlake=true\n");
        assert_eq!(
            build_roster(&capsule, true),
            ["boot", "recovery", "fastboot", "esp", "capsule", "ulpmc", "silentlake"]
        );
    }

    #[test]
    fn full_mode_decisions() {
        let mut target = archive_with(&[
            ("BOOTABLE_IMAGES/boot.img", b"boot image"),
            ("BOOTABLE_IMAGES/recovery.img", b"recovery image"),
        ]);

        let plan = plan_images(
            &mut target,
            None::<&mut Tf>,
            &["boot", "recovery", "fastboot"],
            false,
            false,
        )
        .unwrap();

        assert_eq!(plan.images.len(), 2);
        assert_matches!(plan.images[0].decision, ImageDecision::FullFlash(_));
        assert_matches!(
            plan.images[1].decision,
            ImageDecision::RecoveryFromBoot { .. }
        );
        assert_eq!(plan.largest_source_size, 0);
    }

    #[test]
    fn unchanged_images_are_skipped() {
        let mut target = archive_with(&[
            ("BOOTABLE_IMAGES/boot.img", b"same bytes"),
            ("BOOTABLE_IMAGES/recovery.img", b"same recovery"),
        ]);
        let mut source = archive_with(&[
            ("BOOTABLE_IMAGES/boot.img", b"same bytes"),
            ("BOOTABLE_IMAGES/recovery.img", b"same recovery"),
        ]);

        let plan = plan_images(
            &mut target,
            Some(&mut source),
            &["boot", "recovery"],
            false,
            false,
        )
        .unwrap();

        assert!(plan.images.is_empty());
    }

    #[test]
    fn changed_boot_becomes_incremental_patch() {
        let mut target = archive_with(&[("BOOTABLE_IMAGES/boot.img", b"new boot bits")]);
        let mut source = archive_with(&[("BOOTABLE_IMAGES/boot.img", b"old boot")]);

        let plan =
            plan_images(&mut target, Some(&mut source), &["boot"], false, false).unwrap();

        assert_matches!(plan.images[0].decision, ImageDecision::IncrementalPatch { .. });
        assert_eq!(plan.largest_source_size, 8);
    }

    #[test]
    fn fromgb_forces_full_flash() {
        let mut target = archive_with(&[("BOOTABLE_IMAGES/boot.img", b"new boot bits")]);
        let mut source = archive_with(&[("BOOTABLE_IMAGES/boot.img", b"old boot")]);

        let plan = plan_images(&mut target, Some(&mut source), &["boot"], false, true).unwrap();

        assert_matches!(plan.images[0].decision, ImageDecision::FullFlash(_));
    }

    #[test]
    fn repacked_ifwi_is_skipped() {
        let src = FileBlob::new("ifwi.zip", inner_zip(&[("fw/ifwi.bin", b"firmware v2")]));
        let tgt = FileBlob::new("ifwi.zip", inner_zip(&[("fw/ifwi.bin", b"firmware v2")]));
        assert!(!ifwi_differs(&src, &tgt));

        let tgt = FileBlob::new("ifwi.zip", inner_zip(&[("fw/ifwi.bin", b"firmware v3")]));
        assert!(ifwi_differs(&src, &tgt));

        // Containers that don't parse as archives count as changed.
        let raw = FileBlob::new("ifwi.zip", b"not a zip".to_vec());
        assert!(ifwi_differs(&raw, &raw));
    }

    #[test]
    fn size_limits() {
        let misc = MiscInfo::parse("boot_size=8\n");
        let small = FileBlob::new("boot.img", vec![0; 8]);
        let large = FileBlob::new("boot.img", vec![0; 9]);

        check_size(&small, "boot", &misc).unwrap();
        assert_matches!(
            check_size(&large, "boot", &misc),
            Err(Error::SizeViolation { size: 9, limit: 8, .. })
        );
        check_size(&large, "fastboot", &misc).unwrap();
    }

    #[test]
    fn recovery_patch_uses_fallback_region() {
        let boot = FileBlob::new("boot.img", vec![0x11; 4096]);
        let recovery = FileBlob::new("recovery.img", vec![0x22; 4096]);

        let rp = make_recovery_patch(&StubDiff, &boot, &recovery).unwrap();
        let region_sha1 = util::sha1_hex(&recovery.data()[512..992]);

        assert!(rp.install_script.starts_with("#!/system/bin/sh\n"));
        assert!(rp
            .install_script
            .contains(&format!("--check-sha1 {region_sha1}")));
        assert!(rp.install_script.contains(&format!(
            "--src-sha1 {} --tgt-sha1 {} --tgt-size 4096",
            boot.sha1(),
            recovery.sha1(),
        )));
        assert!(rp
            .install_script
            .contains("--patch /system/recovery-from-boot.p"));
        assert_eq!(rp.patch, vec![0x22; 4]);
    }
}
