/*
 * SPDX-FileCopyrightText: 2022-2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    env,
    ffi::OsStr,
    fs::{self, File},
    io::BufReader,
    path::PathBuf,
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::debug;
use zip::ZipWriter;

use crate::{
    cli::{
        args::{AslrMode, Cli},
        status, warning,
    },
    compose::Composer,
    config::{Options, DEFAULT_PACKAGE_KEY},
    crypto::{PassphraseSource, SignapkSigner, WholeArchiveSigner},
    diff::BsdiffDifference,
    format::targetfiles::TargetFiles,
    hook::NoopHook,
};

/// Setting `OTA_ROLLBACK=off` drops the older-build assertion so a package
/// can be applied over a newer build.
pub const ENV_ROLLBACK: &str = "OTA_ROLLBACK";
pub const ENV_KEY_PASSPHRASE: &str = "OTA_KEY_PASSPHRASE";

fn build_options(cli: &Cli) -> Result<Options> {
    let extra_script = cli
        .extra_script
        .as_deref()
        .map(|p| {
            fs::read_to_string(p).with_context(|| format!("Failed to read extra script: {p:?}"))
        })
        .transpose()?;

    let rollback = env::var(ENV_ROLLBACK).is_ok_and(|v| v == "off");

    Ok(Options {
        package_key: cli.package_key.clone(),
        wipe_user_data: cli.wipe_user_data,
        omit_prereq: cli.no_prereq || rollback,
        extra_script,
        aslr_safe: cli.aslr_mode == AslrMode::On,
        worker_threads: cli.worker_threads,
        intel_ota: cli.intel_ota,
        ..Options::default()
    })
}

fn open_archive(path: &PathBuf) -> Result<TargetFiles<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("Failed to open: {path:?}"))?;

    TargetFiles::open(BufReader::new(file))
        .with_context(|| format!("Failed to read target-files archive: {path:?}"))
}

pub fn ota_main(cli: &Cli) -> Result<()> {
    if cli.board_config.is_some() {
        warning!("Ignoring deprecated -b option");
    }

    let options = build_options(cli)?;
    let mut target = open_archive(&cli.input)?;

    if let Some(extensions) = target.misc_info()?.get("tool_extensions") {
        // Extension modules are compiled in via the hook trait; the key is
        // only reported.
        debug!("Target names a tool extension directory: {extensions}");
    }

    let temp = NamedTempFile::new().context("Failed to create temporary package")?;
    let mut zip = ZipWriter::new(temp.reopen().context("Failed to reopen temporary package")?);

    let differ = BsdiffDifference::default();
    let composer = Composer {
        options: &options,
        differ: &differ,
        hook: &NoopHook,
        fs_config_helper: "fs_config".to_owned(),
    };

    match &cli.incremental_from {
        None => {
            status!("Building full OTA package");
            composer.write_full_ota(&mut target, &mut zip)?;
        }
        Some(path) => {
            status!("Building incremental OTA package against {path:?}");
            let mut source = open_archive(path)?;
            composer.write_incremental_ota(&mut target, &mut source, &mut zip)?;
        }
    }

    zip.finish().context("Failed to finalize package archive")?;

    let key = cli
        .package_key
        .clone()
        .or_else(|| {
            target
                .misc_info()
                .ok()?
                .get("default_system_dev_certificate")
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PACKAGE_KEY));

    let env_var = env::var_os(ENV_KEY_PASSPHRASE).map(|_| OsStr::new(ENV_KEY_PASSPHRASE));
    let passphrase = PassphraseSource::new(&key, None, env_var)
        .acquire(false)
        .context("Failed to acquire signing key passphrase")?;

    status!("Signing package with key {key:?}");
    SignapkSigner::from_env()
        .sign_whole_archive(temp.path(), &cli.output, &key, &passphrase)
        .context("Failed to sign package")?;

    status!("Wrote {:?}", cli.output);

    Ok(())
}
