// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-signing settings.

use {
    crate::{error::ResignError, tools::ToolPaths},
    ipa_bundles::SigningMode,
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
};

/// When signatures are verified.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationMode {
    /// Never verify.
    #[default]
    Skip,
    /// Verify each file right after signing it.
    PerFile,
    /// Verify everything once signing completes.
    Final,
    /// Both of the above.
    PerFileAndFinal,
}

impl VerificationMode {
    pub fn per_file(&self) -> bool {
        matches!(self, Self::PerFile | Self::PerFileAndFinal)
    }

    pub fn final_pass(&self) -> bool {
        matches!(self, Self::Final | Self::PerFileAndFinal)
    }
}

/// Content to remove from the application before signing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StripOptions {
    /// Remove `Watch/` and the watch placeholder.
    pub watch_app: bool,
    /// Remove `PlugIns/`.
    pub plugins: bool,
    /// Remove `*.xctest` bundles.
    pub xctests: bool,
}

/// Edits to the main `Info.plist`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ManifestOptions {
    pub bundle_id: Option<String>,
    /// Declare support for iPhone and iPad.
    pub force_family: bool,
    pub remove_supported_devices: bool,
    /// Allow arbitrary loads over plain HTTP.
    pub allow_http: bool,
    pub min_os_version: Option<String>,
}

impl ManifestOptions {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// How entitlements are derived.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EntitlementOptions {
    /// Use this plist instead of the provisioning profile's entitlements.
    pub file: Option<PathBuf>,
    /// Remove entitlements requiring capabilities a new identity rarely has.
    pub massage: bool,
    /// Keychain access group to add.
    pub access_group: Option<String>,
}

/// Everything controlling a re-signing session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResignSettings {
    /// SHA-1 fingerprint or common name of the signing certificate.
    pub identity: String,
    pub keychain: Option<PathBuf>,
    pub mobileprovision: Option<PathBuf>,
    /// Where to write the result. Derived from the input when absent.
    pub output: Option<PathBuf>,
    pub signing_mode: SigningMode,
    pub verification: VerificationMode,
    pub ignore_verification_errors: bool,
    pub ignore_codesign_errors: bool,
    pub ignore_zip_errors: bool,
    pub allow_encrypted: bool,
    pub all_binaries: bool,
    /// Additional attempts after a failed signing operation.
    pub sign_retries: u32,
    pub strip: StripOptions,
    pub manifest: ManifestOptions,
    pub entitlements: EntitlementOptions,
    /// Keep the temporary workspace.
    pub keep_temporary: bool,
    pub tools: ToolPaths,
}

const MAX_SIGN_RETRIES: u32 = 10;

impl ResignSettings {
    /// Whether the identity is a SHA-1 certificate fingerprint.
    pub fn identity_is_fingerprint(&self) -> bool {
        self.identity.len() == 40 && hex::decode(&self.identity).is_ok()
    }

    /// Check settings for consistency.
    pub fn validate(&self) -> Result<(), ResignError> {
        if self.identity.trim().is_empty() {
            return Err(ResignError::NoIdentity);
        }

        for (what, path) in [
            ("provisioning profile", &self.mobileprovision),
            ("entitlements file", &self.entitlements.file),
            ("keychain", &self.keychain),
        ] {
            if let Some(path) = path {
                if !path.is_file() {
                    return Err(ResignError::InvalidSetting(format!(
                        "{} {} does not exist",
                        what,
                        path.display()
                    )));
                }
            }
        }

        if let Some(id) = &self.manifest.bundle_id {
            if !is_valid_bundle_id(id) {
                return Err(ResignError::InvalidSetting(format!(
                    "invalid bundle identifier: {}",
                    id
                )));
            }
        }

        if let Some(version) = &self.manifest.min_os_version {
            if !is_valid_version(version) {
                return Err(ResignError::InvalidSetting(format!(
                    "invalid minimum OS version: {}",
                    version
                )));
            }
        }

        if let Some(group) = &self.entitlements.access_group {
            if group.trim().is_empty() {
                return Err(ResignError::InvalidSetting(
                    "keychain access group cannot be empty".into(),
                ));
            }
        }

        if self.sign_retries > MAX_SIGN_RETRIES {
            return Err(ResignError::InvalidSetting(format!(
                "sign retries must not exceed {}",
                MAX_SIGN_RETRIES
            )));
        }

        Ok(())
    }

    /// Resolve the output path for an input.
    ///
    /// Defaults to `<stem>-resigned.<ext>` next to the input.
    pub fn output_path(&self, input: &Path) -> PathBuf {
        if let Some(output) = &self.output {
            return output.clone();
        }

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "app".into());
        let name = match input.extension() {
            Some(ext) => format!("{}-resigned.{}", stem, ext.to_string_lossy()),
            None => format!("{}-resigned", stem),
        };

        input.with_file_name(name)
    }
}

fn is_valid_bundle_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.ends_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

fn is_valid_version(version: &str) -> bool {
    let parts = version.split('.').collect::<Vec<_>>();

    (1..=3).contains(&parts.len()) && parts.iter().all(|p| p.parse::<u32>().is_ok())
}
