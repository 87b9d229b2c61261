// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-sign iOS application packages.
//!
//! A [session::ResignSession] takes an `.ipa` archive or an unpacked `.app`
//! directory, applies optional bundle modifications, installs a provisioning
//! profile, computes entitlements and then signs every Mach-O binary in
//! dependency order using an external signing tool.
//!
//! Signing itself is delegated to an implementation of [tools::SigningTool].
//! [tools::CodesignTool] drives Apple's `codesign` and `security` programs.

pub mod archive;
pub mod cli;
pub mod entitlements;
pub mod error;
pub mod events;
pub mod manifest;
pub mod orchestrator;
pub mod provisioning;
pub mod session;
pub mod settings;
pub mod strip;
pub mod tools;

pub use error::ResignError;
