// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Incremental diff planning: classify each target file as verbatim,
//! patched, or unchanged, and compute the binary patches over a bounded
//! worker pool.

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::PathBuf,
    process::Command,
};

use rayon::{iter::ParallelIterator, prelude::IntoParallelRefIterator, ThreadPoolBuilder};
use thiserror::Error;
use tracing::debug;

use crate::{
    config::Options,
    format::targetfiles::FileBlob,
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("File requires and prohibits verbatim transfer: {0}")]
    VerbatimConflict(String),
    #[error("File must not be sent verbatim: {0}")]
    VerbatimProhibited(String),
    #[error("Failed to spawn {0:?}")]
    Spawn(String, #[source] io::Error),
    #[error("{0:?} exited with status {1}")]
    DiffFailed(String, i32),
    #[error("Worker pool error")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Binary diff capability. Produces a patch that rebuilds `target` from
/// `source` when applied on the device.
pub trait Difference {
    fn compute_patch(&self, source: &[u8], target: &[u8]) -> Result<Vec<u8>>;
}

/// Shells out to bsdiff. Inputs and the patch travel through scratch files
/// scoped to the call.
pub struct BsdiffDifference {
    program: PathBuf,
}

impl Default for BsdiffDifference {
    fn default() -> Self {
        Self {
            program: PathBuf::from("bsdiff"),
        }
    }
}

impl BsdiffDifference {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

impl Difference for BsdiffDifference {
    fn compute_patch(&self, source: &[u8], target: &[u8]) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let source_path = dir.path().join("source");
        let target_path = dir.path().join("target");
        let patch_path = dir.path().join("patch");

        fs::write(&source_path, source)?;
        fs::write(&target_path, target)?;

        let program = self.program.display().to_string();
        let status = Command::new(&self.program)
            .arg(&source_path)
            .arg(&target_path)
            .arg(&patch_path)
            .status()
            .map_err(|e| Error::Spawn(program.clone(), e))?;

        if !status.success() {
            return Err(Error::DiffFailed(program, status.code().unwrap_or(-1)));
        }

        Ok(fs::read(&patch_path)?)
    }
}

/// An admitted file patch, ready for archive storage under
/// `patch/<path>.p` and for the script's verify/apply primitives.
#[derive(Clone, Debug)]
pub struct FilePatch {
    pub path: String,
    pub target_size: u64,
    pub target_sha1: String,
    pub source_size: u64,
    pub source_sha1: String,
    pub patch: Vec<u8>,
    pub patch_sha1: String,
}

#[derive(Debug, Default)]
pub struct DiffPlan {
    /// Target paths shipped as direct archive entries, sorted.
    pub verbatim: Vec<String>,
    /// Admitted patches, in target-path order.
    pub patches: Vec<FilePatch>,
    /// Paths with identical content on both sides.
    pub unchanged: Vec<String>,
    /// Largest source file among admitted patches; sizes the single cache
    /// free-space check in the verify phase.
    pub largest_source_size: u64,
}

/// Classify every target file and compute patches for the changed pairs.
/// Patches are computed concurrently but admitted in target-path order;
/// the first worker failure aborts the whole plan.
pub fn plan_file_diffs(
    source_files: &BTreeMap<String, FileBlob>,
    target_files: &BTreeMap<String, FileBlob>,
    differ: &(dyn Difference + Sync),
    options: &Options,
) -> Result<DiffPlan> {
    if let Some(path) = options
        .require_verbatim
        .intersection(&options.prohibit_verbatim)
        .next()
    {
        return Err(Error::VerbatimConflict(path.clone()));
    }

    let mut plan = DiffPlan::default();
    let mut pending: Vec<(&str, &FileBlob, &FileBlob)> = vec![];

    for (path, target) in target_files {
        let source = source_files.get(path);

        if source.is_none() || options.require_verbatim.contains(path) {
            if options.prohibit_verbatim.contains(path) {
                return Err(Error::VerbatimProhibited(path.clone()));
            }
            plan.verbatim.push(path.clone());
        } else if let Some(source) = source {
            if source.sha1() == target.sha1() {
                plan.unchanged.push(path.clone());
            } else {
                pending.push((path, source, target));
            }
        }
    }

    debug!(
        "Diff plan: {} verbatim, {} unchanged, {} pairs to diff",
        plan.verbatim.len(),
        plan.unchanged.len(),
        pending.len(),
    );

    let pool = ThreadPoolBuilder::new()
        .num_threads(options.worker_threads)
        .build()?;
    let computed: Vec<Vec<u8>> = pool.install(|| {
        pending
            .par_iter()
            .map(|(_, source, target)| differ.compute_patch(source.data(), target.data()))
            .collect::<Result<_>>()
    })?;

    for ((path, source, target), patch) in pending.into_iter().zip(computed) {
        if patch.len() as f64 > options.patch_threshold * target.size() as f64 {
            // The patch buys nothing over shipping the file whole.
            if options.prohibit_verbatim.contains(path) {
                return Err(Error::VerbatimProhibited(path.to_owned()));
            }

            debug!(
                "Demoting to verbatim: {path} (patch {} of {})",
                patch.len(),
                target.size(),
            );
            plan.verbatim.push(path.to_owned());
            continue;
        }

        plan.largest_source_size = plan.largest_source_size.max(source.size());
        plan.patches.push(FilePatch {
            path: path.to_owned(),
            target_size: target.size(),
            target_sha1: target.sha1().to_owned(),
            source_size: source.size(),
            source_sha1: source.sha1().to_owned(),
            patch_sha1: util::sha1_hex(&patch),
            patch,
        });
    }

    plan.verbatim.sort_unstable();

    Ok(plan)
}
