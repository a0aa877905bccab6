// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use thiserror::Error;

/// Fallback signing key when neither the CLI nor the target archive names
/// one. Matches the platform build's development key layout.
pub const DEFAULT_PACKAGE_KEY: &str = "build/target/product/security/testkey";

pub const DEFAULT_WORKER_THREADS: usize = 3;
pub const DEFAULT_PATCH_THRESHOLD: f64 = 0.95;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing required build property: {0}")]
    MissingProp(String),
    #[error("Unresolved product name mapping entry: {0:?}")]
    BadProductMapping(String),
}

type Result<T> = std::result::Result<T, Error>;

/// Everything the composer needs to know about one invocation. Built by the
/// CLI, passed by reference; there is no global options state.
#[derive(Clone, Debug)]
pub struct Options {
    pub package_key: Option<PathBuf>,
    pub wipe_user_data: bool,
    pub omit_prereq: bool,
    /// Contents of the user-supplied extra script, already loaded.
    pub extra_script: Option<String>,
    pub aslr_safe: bool,
    /// Gate for emitting retouch primitives. The vocabulary is kept alive in
    /// the script builder, but nothing sets this today.
    pub emit_retouch: bool,
    pub worker_threads: usize,
    pub intel_ota: bool,
    pub patch_threshold: f64,
    /// Files always shipped whole, even when a small patch exists.
    pub require_verbatim: BTreeSet<String>,
    /// Files that must never be shipped whole. `system/build.prop` carries
    /// the fingerprint the verify phase checks against, so it only ever
    /// travels as a patch.
    pub prohibit_verbatim: BTreeSet<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            package_key: None,
            wipe_user_data: false,
            omit_prereq: false,
            extra_script: None,
            aslr_safe: true,
            emit_retouch: false,
            worker_threads: DEFAULT_WORKER_THREADS,
            intel_ota: false,
            patch_threshold: DEFAULT_PATCH_THRESHOLD,
            require_verbatim: BTreeSet::new(),
            prohibit_verbatim: ["system/build.prop".to_owned()].into(),
        }
    }
}

fn parse_kv_lines(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }

    map
}

/// Free-form dictionary from `META/misc_info.txt`.
#[derive(Clone, Debug, Default)]
pub struct MiscInfo(BTreeMap<String, String>);

impl MiscInfo {
    pub fn parse(text: &str) -> Self {
        Self(parse_kv_lines(text))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Boolean settings are spelled `key=true`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn recovery_api_version(&self) -> Option<u32> {
        self.get("recovery_api_version")?.parse().ok()
    }

    /// Declared size limit for a named image, e.g. `boot_size`. Accepts
    /// decimal or `0x` hex, matching what the build system emits.
    pub fn image_size_limit(&self, image: &str) -> Option<u64> {
        let value = self.get(&format!("{image}_size"))?;

        if let Some(hex) = value.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).ok()
        } else {
            value.parse().ok()
        }
    }

    /// Expand the device's product name into the full compatible set via the
    /// `product_name_mapping` key (`alias=canonical` entries, `|`-separated).
    pub fn compatible_products(&self, product: &str) -> Result<Vec<String>> {
        let mut products = vec![product.to_owned()];

        let Some(mapping) = self.get("product_name_mapping") else {
            return Ok(products);
        };

        for entry in mapping.split('|').filter(|e| !e.is_empty()) {
            let (alias, canonical) = entry
                .split_once('=')
                .ok_or_else(|| Error::BadProductMapping(entry.to_owned()))?;

            if canonical == product && !products.iter().any(|p| p == alias) {
                products.push(alias.to_owned());
            }
        }

        Ok(products)
    }
}

/// Properties from `SYSTEM/build.prop`.
#[derive(Clone, Debug, Default)]
pub struct BuildProps(BTreeMap<String, String>);

impl BuildProps {
    pub fn parse(text: &str) -> Self {
        Self(parse_kv_lines(text))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn required(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| Error::MissingProp(key.to_owned()))
    }

    pub fn fingerprint(&self) -> Result<&str> {
        self.required("ro.build.fingerprint")
    }

    pub fn device(&self) -> Result<&str> {
        self.required("ro.product.device")
    }

    pub fn product_name(&self) -> Result<&str> {
        self.required("ro.product.name")
    }

    pub fn timestamp(&self) -> Result<&str> {
        self.required("ro.build.date.utc")
    }

    pub fn build_id(&self) -> Option<&str> {
        self.get("ro.build.id")
    }
}
