// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External code signing tools.

use {
    crate::error::ResignError,
    log::{debug, info},
    serde::{Deserialize, Serialize},
    std::{
        future::Future,
        path::{Path, PathBuf},
        process::Output,
    },
    tokio::process::Command,
};

/// Output text indicating the signing identity isn't available.
const NO_IDENTITY_FOUND: &str = "no identity found";

/// Locations of the external programs invoked during re-signing.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolPaths {
    pub codesign: PathBuf,
    pub security: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            codesign: PathBuf::from("/usr/bin/codesign"),
            security: PathBuf::from("/usr/bin/security"),
        }
    }
}

/// A single invocation of the signing tool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignRequest {
    /// The binary being signed.
    pub binary: PathBuf,
    /// Path handed to the signing tool. A bundle directory for bundle executables.
    pub target: PathBuf,
    pub identity: String,
    pub keychain: Option<PathBuf>,
    pub entitlements: Option<PathBuf>,
}

/// A code signing identity available in a keychain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodeSigningIdentity {
    /// Hex SHA-1 fingerprint of the certificate.
    pub fingerprint: String,
    /// Certificate common name. e.g. `Apple Development: Jane Doe (ABCDE12345)`.
    pub name: String,
}

impl CodeSigningIdentity {
    /// Whether this identity is what a user specified by fingerprint or name.
    pub fn matches(&self, identity: &str) -> bool {
        self.fingerprint.eq_ignore_ascii_case(identity) || self.name == identity
    }
}

/// Parse the output of `security find-identity`.
///
/// Lines look like `  1) <40 hex chars> "<name>"`.
pub fn parse_identities(output: &str) -> Vec<CodeSigningIdentity> {
    output
        .lines()
        .filter_map(|line| {
            let (_, rest) = line.trim().split_once(") ")?;
            let (fingerprint, name) = rest.split_once(' ')?;

            let decoded = hex::decode(fingerprint).ok()?;
            if decoded.len() != 20 {
                return None;
            }

            Some(CodeSigningIdentity {
                fingerprint: fingerprint.to_string(),
                name: name.trim().trim_matches('"').to_string(),
            })
        })
        .collect()
}

/// Performs signing operations.
///
/// Implementations must be usable from many concurrent tasks.
pub trait SigningTool: Send + Sync + 'static {
    /// Sign a file or bundle.
    fn sign(&self, request: &SignRequest) -> impl Future<Output = Result<(), ResignError>> + Send;

    /// Verify the signature of a file or bundle.
    fn verify(
        &self,
        target: &Path,
        keychain: Option<&Path>,
    ) -> impl Future<Output = Result<(), ResignError>> + Send;

    /// List available code signing identities.
    fn identities(
        &self,
        keychain: Option<&Path>,
    ) -> impl Future<Output = Result<Vec<CodeSigningIdentity>, ResignError>> + Send;
}

/// Invokes Apple's `codesign` and `security` programs.
#[derive(Clone, Debug, Default)]
pub struct CodesignTool {
    paths: ToolPaths,
}

impl CodesignTool {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    /// Arguments for a signing invocation.
    pub fn sign_args(request: &SignRequest) -> Vec<String> {
        let mut args = vec![
            "--force".to_string(),
            "--sign".to_string(),
            request.identity.clone(),
        ];

        if let Some(keychain) = &request.keychain {
            args.push("--keychain".into());
            args.push(keychain.display().to_string());
        }

        if let Some(entitlements) = &request.entitlements {
            args.push("--entitlements".into());
            args.push(entitlements.display().to_string());
            args.push("--generate-entitlement-der".into());
        }

        args.push(request.target.display().to_string());

        args
    }

    async fn run(program: &Path, args: &[String]) -> Result<Output, ResignError> {
        debug!("running {} {}", program.display(), args.join(" "));

        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| ResignError::ToolSpawn {
                program: program.display().to_string(),
                source,
            })
    }
}

fn combined_output(output: &Output) -> String {
    let mut s = String::from_utf8_lossy(&output.stderr).to_string();
    s.push_str(&String::from_utf8_lossy(&output.stdout));

    s.trim().to_string()
}

impl SigningTool for CodesignTool {
    async fn sign(&self, request: &SignRequest) -> Result<(), ResignError> {
        let output = Self::run(&self.paths.codesign, &Self::sign_args(request)).await?;
        let text = combined_output(&output);

        if text.contains(NO_IDENTITY_FOUND) {
            return Err(ResignError::MissingIdentity(request.target.clone()));
        }

        if output.status.success() {
            info!("signed {}", request.target.display());
            Ok(())
        } else {
            Err(ResignError::SigningFailed {
                path: request.target.clone(),
                message: text,
            })
        }
    }

    async fn verify(&self, target: &Path, keychain: Option<&Path>) -> Result<(), ResignError> {
        let mut args = vec![
            "--verify".to_string(),
            "--deep".to_string(),
            "--strict".to_string(),
        ];
        if let Some(keychain) = keychain {
            args.push("--keychain".into());
            args.push(keychain.display().to_string());
        }
        args.push(target.display().to_string());

        let output = Self::run(&self.paths.codesign, &args).await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ResignError::VerificationFailed {
                path: target.to_path_buf(),
                message: combined_output(&output),
            })
        }
    }

    async fn identities(
        &self,
        keychain: Option<&Path>,
    ) -> Result<Vec<CodeSigningIdentity>, ResignError> {
        let mut args = vec![
            "find-identity".to_string(),
            "-v".to_string(),
            "-p".to_string(),
            "codesigning".to_string(),
        ];
        if let Some(keychain) = keychain {
            args.push(keychain.display().to_string());
        }

        let output = Self::run(&self.paths.security, &args).await?;

        if !output.status.success() {
            return Err(ResignError::ToolSpawn {
                program: self.paths.security.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, combined_output(&output)),
            });
        }

        Ok(parse_identities(&String::from_utf8_lossy(&output.stdout)))
    }
}
