/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    env::{self, VarError},
    ffi::{OsStr, OsString},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use thiserror::Error;
use tracing::debug;

/// Environment variable naming the signapk JAR. The packaging step shells
/// out to signapk because that is what the recovery-side verifier trusts.
pub const ENV_SIGNAPK_JAR: &str = "OTA_SIGNAPK_JAR";
pub const DEFAULT_SIGNAPK_JAR: &str = "framework/signapk.jar";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Passphrases do not match")]
    ConfirmPassphrase,
    #[error("Failed to read environment variable: {0:?}")]
    InvalidEnvVar(OsString, #[source] VarError),
    #[error("Signing key component not found: {0:?}")]
    MissingKeyComponent(PathBuf),
    #[error("Failed to spawn {0:?}")]
    Spawn(String, #[source] io::Error),
    #[error("{0:?} exited with status {1}")]
    SignerFailed(String, i32),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub enum PassphraseSource {
    Prompt(String),
    EnvVar(OsString),
    File(PathBuf),
}

impl PassphraseSource {
    pub fn new(key_file: &Path, pass_file: Option<&Path>, env_var: Option<&OsStr>) -> Self {
        if let Some(v) = env_var {
            Self::EnvVar(v.to_owned())
        } else if let Some(p) = pass_file {
            Self::File(p.to_owned())
        } else {
            Self::Prompt(format!("Enter passphrase for {key_file:?}: "))
        }
    }

    pub fn acquire(&self, confirm: bool) -> Result<String> {
        let passphrase = match self {
            Self::Prompt(p) => {
                let first = rpassword::prompt_password(p)?;

                if confirm {
                    let second = rpassword::prompt_password("Confirm: ")?;

                    if first != second {
                        return Err(Error::ConfirmPassphrase);
                    }
                }

                first
            }
            Self::EnvVar(v) => env::var(v).map_err(|e| Error::InvalidEnvVar(v.clone(), e))?,
            Self::File(p) => fs::read_to_string(p)?
                .trim_end_matches(['\r', '\n'])
                .to_owned(),
        };

        Ok(passphrase)
    }
}

/// Whole-archive signing capability. The signature must cover the full file
/// bytes of the finished package; the implementation owns the format of the
/// appended signature block.
pub trait WholeArchiveSigner {
    fn sign_whole_archive(
        &self,
        unsigned: &Path,
        signed: &Path,
        key: &Path,
        passphrase: &str,
    ) -> Result<()>;
}

/// Signs by invoking signapk in whole-file mode. The key argument is the
/// common prefix of the `.x509.pem` / `.pk8` pair; the passphrase is written
/// to the child's stdin.
pub struct SignapkSigner {
    java: PathBuf,
    jar: PathBuf,
}

impl SignapkSigner {
    pub fn new(java: PathBuf, jar: PathBuf) -> Self {
        Self { java, jar }
    }

    pub fn from_env() -> Self {
        let jar = env::var_os(ENV_SIGNAPK_JAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SIGNAPK_JAR));

        Self::new(PathBuf::from("java"), jar)
    }
}

impl WholeArchiveSigner for SignapkSigner {
    fn sign_whole_archive(
        &self,
        unsigned: &Path,
        signed: &Path,
        key: &Path,
        passphrase: &str,
    ) -> Result<()> {
        let mut cert = key.as_os_str().to_owned();
        cert.push(".x509.pem");
        let mut private_key = key.as_os_str().to_owned();
        private_key.push(".pk8");

        for component in [Path::new(&cert), Path::new(&private_key)] {
            if !component.exists() {
                return Err(Error::MissingKeyComponent(component.to_owned()));
            }
        }

        debug!("Signing {unsigned:?} -> {signed:?} with key {key:?}");

        let mut child = Command::new(&self.java)
            .arg("-Xmx2048m")
            .arg("-jar")
            .arg(&self.jar)
            .arg("-w")
            .arg(&cert)
            .arg(&private_key)
            .arg(unsigned)
            .arg(signed)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn(self.java.display().to_string(), e))?;

        // signapk reads the key passphrase from stdin when the key is
        // encrypted; an unencrypted key ignores the extra line.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(passphrase.as_bytes())?;
            stdin.write_all(b"\n")?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::SignerFailed(
                self.jar.display().to_string(),
                status.code().unwrap_or(-1),
            ));
        }

        Ok(())
    }
}
