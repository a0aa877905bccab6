/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fmt,
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::cli::ota;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum AslrMode {
    On,
    Off,
}

impl fmt::Display for AslrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_possible_value().ok_or(fmt::Error)?.get_name())
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Build signed OTA update packages from target-files archives")]
pub struct Cli {
    /// Key prefix for package signing (expects <KEY>.x509.pem and <KEY>.pk8)
    #[arg(short = 'k', long = "package_key", value_name = "KEY")]
    pub package_key: Option<PathBuf>,

    /// Source target-files archive; produces an incremental package
    #[arg(short = 'i', long = "incremental_from", value_name = "ZIP")]
    pub incremental_from: Option<PathBuf>,

    /// Format /data as part of the install
    #[arg(short = 'w', long = "wipe_user_data")]
    pub wipe_user_data: bool,

    /// Omit the older-build timestamp assertion
    #[arg(short = 'n', long = "no_prereq")]
    pub no_prereq: bool,

    /// Script fragment appended to the end of the installer script
    #[arg(short = 'e', long = "extra_script", value_name = "FILE")]
    pub extra_script: Option<PathBuf>,

    /// Whether shipped binaries are ASLR-safe
    #[arg(short = 'a', long = "aslr_mode", value_enum, default_value_t = AslrMode::On, value_name = "MODE")]
    pub aslr_mode: AslrMode,

    /// Number of concurrent binary-diff workers
    #[arg(long = "worker_threads", default_value_t = 3, value_name = "N")]
    pub worker_threads: usize,

    /// Enable the Intel firmware roster and provisioning phases
    #[arg(long = "intel_ota")]
    pub intel_ota: bool,

    /// Accepted for compatibility with older wrappers; ignored
    #[arg(short = 'b', hide = true, value_name = "CONFIG")]
    pub board_config: Option<String>,

    /// Input target-files archive
    pub input: PathBuf,

    /// Output OTA package
    pub output: PathBuf,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging();
    logging_initialized.store(true, Ordering::SeqCst);

    ota::ota_main(&cli)
}
