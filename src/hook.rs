// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use crate::edify::EdifyScript;

/// Device-specific extension points, mirroring the hook functions a board's
/// release tooling may provide. Every hook defaults to a no-op.
pub trait DeviceHook {
    fn full_ota_assertions(&self, _script: &mut EdifyScript) {}

    fn full_ota_install_end(&self, _script: &mut EdifyScript) {}

    fn incremental_ota_assertions(&self, _script: &mut EdifyScript) {}

    fn incremental_ota_verify_end(&self, _script: &mut EdifyScript) {}

    fn incremental_ota_install_end(&self, _script: &mut EdifyScript) {}
}

/// Used when the target archive names no extension module.
pub struct NoopHook;

impl DeviceHook for NoopHook {}
