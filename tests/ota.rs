/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::io::{Cursor, Read, Write};

use assert_matches::assert_matches;
use zip::{write::FileOptions, ZipArchive, ZipWriter};

use otapack::{
    compose::{Composer, Error as ComposeError},
    config::Options,
    diff::{Difference, Result as DiffResult},
    format::targetfiles::TargetFiles,
    hook::NoopHook,
    util,
};

/// Deterministic in-process stand-in for the external diff tool.
struct StubDiff;

impl Difference for StubDiff {
    fn compute_patch(&self, source: &[u8], target: &[u8]) -> DiffResult<Vec<u8>> {
        let mut patch = b"STUBDIFF".to_vec();
        patch.extend_from_slice(&(source.len() as u32).to_le_bytes());
        patch.extend_from_slice(&(target.len() as u32).to_le_bytes());
        Ok(patch)
    }
}

/// Emits patches sized at a fixed fraction of the target, for exercising
/// the admission threshold.
struct RatioDiff(f64);

impl Difference for RatioDiff {
    fn compute_patch(&self, _source: &[u8], target: &[u8]) -> DiffResult<Vec<u8>> {
        Ok(vec![0xd1; (target.len() as f64 * self.0) as usize])
    }
}

fn build_prop(fingerprint: &str) -> String {
    format!(
        "ro.build.fingerprint={fingerprint}\n\
         ro.build.id=JZO54K\n\
         ro.build.date.utc=1357000000\n\
         ro.product.device=redhookbay\n\
         ro.product.name=ctp\n"
    )
}

fn build_archive(
    files: &[(&str, &[u8])],
    symlinks: &[(&str, &str)],
) -> TargetFiles<Cursor<Vec<u8>>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().unix_permissions(0o644);

    for (name, data) in files {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
    }
    for (name, target) in symlinks {
        writer
            .add_symlink(*name, *target, FileOptions::default())
            .unwrap();
    }

    TargetFiles::open(writer.finish().unwrap()).unwrap()
}

fn compose_full(
    target: &mut TargetFiles<Cursor<Vec<u8>>>,
    differ: &(dyn Difference + Sync),
) -> Result<Vec<u8>, ComposeError> {
    let options = Options::default();
    let composer = Composer {
        options: &options,
        differ,
        hook: &NoopHook,
        fs_config_helper: "/nonexistent/fs_config".to_owned(),
    };

    let mut output = ZipWriter::new(Cursor::new(Vec::new()));
    composer.write_full_ota(target, &mut output)?;

    Ok(output.finish().unwrap().into_inner())
}

fn compose_incremental(
    target: &mut TargetFiles<Cursor<Vec<u8>>>,
    source: &mut TargetFiles<Cursor<Vec<u8>>>,
    differ: &(dyn Difference + Sync),
) -> Result<Vec<u8>, ComposeError> {
    let options = Options::default();
    let composer = Composer {
        options: &options,
        differ,
        hook: &NoopHook,
        fs_config_helper: "/nonexistent/fs_config".to_owned(),
    };

    let mut output = ZipWriter::new(Cursor::new(Vec::new()));
    composer.write_incremental_ota(target, source, &mut output)?;

    Ok(output.finish().unwrap().into_inner())
}

fn entry_names(package: &[u8]) -> Vec<String> {
    let archive = ZipArchive::new(Cursor::new(package.to_vec())).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_owned).collect();
    names.sort();
    names
}

fn read_entry(package: &[u8], name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(Cursor::new(package.to_vec())).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).unwrap();
    buf
}

fn script_lines(package: &[u8]) -> Vec<String> {
    let raw = read_entry(package, "META-INF/com/android/updater-script");
    String::from_utf8(raw)
        .unwrap()
        .lines()
        .map(str::to_owned)
        .collect()
}

const FS_CONFIG: &str = "system 0 0 755\n\
                         system/build.prop 0 0 644\n\
                         system/a 0 0 755\n\
                         system/a/b.txt 0 0 644\n\
                         system/etc 0 0 755\n";

fn full_fixture() -> TargetFiles<Cursor<Vec<u8>>> {
    let props = build_prop("intel/ctp/ctp:4.2.2/JDQ39/eng:user/dev-keys");
    // No boot header magic: the recovery signature falls back to the fixed
    // window past the 512-byte header.
    let boot = vec![0x11u8; 4096];
    let recovery = vec![0x22u8; 4096];

    build_archive(
        &[
            ("META/misc_info.txt", b"recovery_api_version=3\n"),
            ("META/filesystem_config.txt", FS_CONFIG.as_bytes()),
            ("SYSTEM/build.prop", props.as_bytes()),
            ("SYSTEM/a/", b""),
            ("SYSTEM/a/b.txt", b"hello from b.txt"),
            ("BOOTABLE_IMAGES/boot.img", &boot),
            ("BOOTABLE_IMAGES/recovery.img", &recovery),
            ("OTA/bin/updater", b"\x7fELF updater"),
        ],
        &[("SYSTEM/a/c", "b.txt")],
    )
}

#[test]
fn full_ota_package_layout() {
    let mut target = full_fixture();
    let package = compose_full(&mut target, &StubDiff).unwrap();

    // System files are copied through byte for byte.
    assert_eq!(read_entry(&package, "system/a/b.txt"), b"hello from b.txt");
    assert_eq!(read_entry(&package, "boot.img"), vec![0x11u8; 4096]);

    let names = entry_names(&package);
    assert!(names.contains(&"recovery/recovery-from-boot.p".to_owned()));
    assert!(names.contains(&"recovery/etc/install-recovery.sh".to_owned()));
    assert!(names.contains(&"META-INF/com/android/update-binary".to_owned()));
    // Recovery is rebuilt on device, never shipped whole.
    assert!(!names.contains(&"recovery.img".to_owned()));

    let lines = script_lines(&package);

    assert!(lines.contains(&"symlink(\"b.txt\", \"/system/a/c\");".to_owned()));
    assert!(lines.contains(&"flash_os_image(\"/tmp/boot.img\", \"boot\");".to_owned()));

    let recursive: Vec<&String> = lines
        .iter()
        .filter(|l| l.starts_with("set_perm_recursive("))
        .collect();
    assert_eq!(
        recursive,
        ["set_perm_recursive(0, 0, 0755, 0644, \"/system\");"]
    );

    // 0.5 static + 2 x (0.4 / 2) images + 0.1 permissions.
    assert!(lines.contains(&"show_progress(0.500000, 0);".to_owned()));
    assert_eq!(
        lines
            .iter()
            .filter(|l| *l == "show_progress(0.200000, 5);")
            .count(),
        2
    );
    assert!(lines.contains(&"show_progress(0.100000, 10);".to_owned()));

    let metadata = String::from_utf8(read_entry(&package, "META-INF/com/android/metadata")).unwrap();
    assert_eq!(
        metadata,
        "post-build=intel/ctp/ctp:4.2.2/JDQ39/eng:user/dev-keys\n\
         post-timestamp=1357000000\n\
         pre-device=redhookbay\n"
    );
}

#[test]
fn install_recovery_checks_fallback_signature() {
    let mut target = full_fixture();
    let package = compose_full(&mut target, &StubDiff).unwrap();

    let recovery = vec![0x22u8; 4096];
    let region_sha1 = util::sha1_hex(&recovery[512..992]);

    let sh = String::from_utf8(read_entry(&package, "recovery/etc/install-recovery.sh")).unwrap();
    assert!(sh.starts_with("#!/system/bin/sh\n"));
    assert!(sh.contains(&format!("--check-sha1 {region_sha1}")));
    assert!(sh.contains(&format!("--src-sha1 {}", util::sha1_hex(&vec![0x11u8; 4096]))));
    assert!(sh.contains("--tgt-size 4096"));
    assert!(sh.contains("--patch /system/recovery-from-boot.p"));
}

#[test]
fn full_ota_is_deterministic() {
    let first = compose_full(&mut full_fixture(), &StubDiff).unwrap();
    let second = compose_full(&mut full_fixture(), &StubDiff).unwrap();

    assert_eq!(first, second);
}

#[test]
fn empty_system_tree_underruns_progress() {
    let props = build_prop("intel/ctp/ctp:4.2.2/JDQ39/eng:user/dev-keys");
    let mut target = build_archive(
        &[
            ("META/misc_info.txt", b"recovery_api_version=3\n"),
            (
                "META/filesystem_config.txt",
                b"system 0 0 755\nsystem/build.prop 0 0 644\n",
            ),
            ("SYSTEM/build.prop", props.as_bytes()),
        ],
        &[],
    );

    // No images: the budget stops at 0.5 + 0.1.
    assert_matches!(
        compose_full(&mut target, &StubDiff),
        Err(ComposeError::ProgressUnderrun(p)) if (p - 0.6).abs() < 1e-9
    );
}

fn incremental_fixture(
    fingerprint: &str,
    extra_files: &[(&str, &[u8])],
    symlinks: &[(&str, &str)],
) -> TargetFiles<Cursor<Vec<u8>>> {
    let props = build_prop(fingerprint);
    let mut fs_config = String::from("system 0 0 755\nsystem/build.prop 0 0 644\n");
    let mut dirs = std::collections::BTreeSet::new();
    for (name, _) in extra_files {
        let mut prefix = String::new();
        let components: Vec<&str> = name.split('/').collect();
        for component in &components[..components.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            dirs.insert(prefix.clone());
        }
    }
    for dir in &dirs {
        fs_config.push_str(&format!("system/{dir} 0 0 755\n"));
    }
    for (name, _) in extra_files {
        fs_config.push_str(&format!("system/{name} 0 0 644\n"));
    }

    let mut files: Vec<(String, Vec<u8>)> = vec![
        ("META/misc_info.txt".to_owned(), b"recovery_api_version=3\n".to_vec()),
        ("META/filesystem_config.txt".to_owned(), fs_config.into_bytes()),
        ("SYSTEM/build.prop".to_owned(), props.into_bytes()),
    ];
    for (name, data) in extra_files {
        files.push((format!("SYSTEM/{name}"), data.to_vec()));
    }

    let borrowed: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(n, d)| (n.as_str(), d.as_slice()))
        .collect();

    build_archive(&borrowed, symlinks)
}

#[test]
fn incremental_with_only_build_prop_change() {
    let mut source = incremental_fixture("intel/ctp/ctp:4.2.1/OLD/eng:user/dev-keys", &[], &[]);
    let mut target = incremental_fixture("intel/ctp/ctp:4.2.2/NEW/eng:user/dev-keys", &[], &[]);

    let package = compose_incremental(&mut target, &mut source, &StubDiff).unwrap();

    // Exactly one patch, and build.prop is not shipped whole.
    let names = entry_names(&package);
    let patches: Vec<&String> = names.iter().filter(|n| n.starts_with("patch/")).collect();
    assert_eq!(patches, ["patch/system/build.prop.p"]);
    assert!(!names.contains(&"system/build.prop".to_owned()));

    let lines = script_lines(&package);

    // Verify phase precedes the mutation phase.
    let verify = lines
        .iter()
        .position(|l| l.starts_with("assert(apply_patch_check(\"/system/build.prop\""))
        .unwrap();
    let mutate = lines
        .iter()
        .position(|l| l == "show_progress(0.800000, 0);")
        .unwrap();
    assert!(verify < mutate);

    // The apply is deferred past the permission phase, and the trailing
    // permission fix is the final primitive.
    let apply = lines
        .iter()
        .position(|l| l.starts_with("apply_patch(\"/system/build.prop\""))
        .unwrap();
    assert!(mutate < apply);
    assert_eq!(
        lines.last().unwrap(),
        "set_perm(0, 0, 0644, \"/system/build.prop\");"
    );

    let metadata = String::from_utf8(read_entry(&package, "META-INF/com/android/metadata")).unwrap();
    assert!(metadata.contains("pre-build=intel/ctp/ctp:4.2.1/OLD/eng:user/dev-keys\n"));
    assert!(metadata.contains("post-build=intel/ctp/ctp:4.2.2/NEW/eng:user/dev-keys\n"));
}

#[test]
fn oversized_patch_ships_verbatim() {
    let fingerprint = "intel/ctp/ctp:4.2.2/JDQ39/eng:user/dev-keys";
    let mut source = incremental_fixture(fingerprint, &[("app/big.dat", &[0xaau8; 4096])], &[]);
    let mut target = incremental_fixture(fingerprint, &[("app/big.dat", &[0xbbu8; 4096])], &[]);

    // A patch at 96% of the target size is over the 0.95 threshold.
    let package = compose_incremental(&mut target, &mut source, &RatioDiff(0.96)).unwrap();

    let names = entry_names(&package);
    assert!(names.contains(&"system/app/big.dat".to_owned()));
    assert!(!names.contains(&"patch/system/app/big.dat.p".to_owned()));
    assert_eq!(read_entry(&package, "system/app/big.dat"), vec![0xbbu8; 4096]);

    let lines = script_lines(&package);
    assert!(lines.contains(&"delete(\"/system/app/big.dat\");".to_owned()));
    assert!(lines.contains(&"package_extract_dir(\"system\", \"/system\");".to_owned()));
}

#[test]
fn unchanged_recovery_is_not_repatched() {
    let fingerprint = "intel/ctp/ctp:4.2.2/JDQ39/eng:user/dev-keys";
    let boot = vec![0x11u8; 2048];
    let recovery = vec![0x22u8; 2048];

    let build = |fp: &str| {
        let props = build_prop(fp);
        build_archive(
            &[
                ("META/misc_info.txt", b"recovery_api_version=3\n"),
                (
                    "META/filesystem_config.txt",
                    b"system 0 0 755\nsystem/build.prop 0 0 644\n",
                ),
                ("SYSTEM/build.prop", props.as_bytes()),
                ("BOOTABLE_IMAGES/boot.img", &boot),
                ("BOOTABLE_IMAGES/recovery.img", &recovery),
            ],
            &[],
        )
    };

    let mut source = build(fingerprint);
    let mut target = build(fingerprint);

    let package = compose_incremental(&mut target, &mut source, &StubDiff).unwrap();

    let names = entry_names(&package);
    assert!(!names.iter().any(|n| n.starts_with("recovery/")));
    assert!(!script_lines(&package)
        .iter()
        .any(|l| l.contains("recovery-from-boot")));
}

#[test]
fn symlink_reconciliation() {
    let fingerprint = "intel/ctp/ctp:4.2.2/JDQ39/eng:user/dev-keys";
    let mut source = incremental_fixture(
        fingerprint,
        &[],
        &[
            ("SYSTEM/bin/gone", "busybox"),
            ("SYSTEM/bin/moved", "old_target"),
            ("SYSTEM/bin/same", "toolbox"),
        ],
    );
    let mut target = incremental_fixture(
        fingerprint,
        &[],
        &[
            ("SYSTEM/bin/fresh", "busybox"),
            ("SYSTEM/bin/moved", "new_target"),
            ("SYSTEM/bin/same", "toolbox"),
        ],
    );

    let package = compose_incremental(&mut target, &mut source, &StubDiff).unwrap();
    let lines = script_lines(&package);

    // The dropped link is deleted; the retargeted link is deleted before
    // recreation; the unchanged link is never touched.
    assert!(lines.contains(&"delete(\"/system/bin/gone\");".to_owned()));
    assert!(lines.contains(&"delete(\"/system/bin/moved\");".to_owned()));
    assert!(lines.contains(&"symlink(\"busybox\", \"/system/bin/fresh\");".to_owned()));
    assert!(lines.contains(&"symlink(\"new_target\", \"/system/bin/moved\");".to_owned()));
    assert!(!lines.iter().any(|l| l.starts_with("symlink(\"toolbox\"")));
}
