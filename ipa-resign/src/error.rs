// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {ipa_bundles::BundleError, std::path::PathBuf};

/// A step of the re-signing pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Validate,
    Identity,
    Extract,
    Strip,
    Manifest,
    Discover,
    Inspect,
    Provision,
    Entitlements,
    Sign,
    Archive,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Validate => "validating settings",
            Self::Identity => "checking signing identity",
            Self::Extract => "preparing workspace",
            Self::Strip => "stripping bundle content",
            Self::Manifest => "fixing Info.plist",
            Self::Discover => "discovering binaries",
            Self::Inspect => "inspecting main executable",
            Self::Provision => "installing provisioning profile",
            Self::Entitlements => "computing entitlements",
            Self::Sign => "signing",
            Self::Archive => "writing archive",
        })
    }
}

/// Unified error type for re-signing.
#[derive(Debug, thiserror::Error)]
pub enum ResignError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Bundle(#[from] BundleError),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("config error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("CMS error: {0}")]
    Cms(#[from] cryptographic_message_syntax::CmsError),

    #[error("task error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("no signing identity specified")]
    NoIdentity,

    #[error("signing identity {0} not found")]
    IdentityNotFound(String),

    #[error("failed to run {program}: {source}")]
    ToolSpawn {
        program: String,
        source: std::io::Error,
    },

    #[error("no identity found when signing {}", .0.display())]
    MissingIdentity(PathBuf),

    #[error("signing {} failed: {message}", .path.display())]
    SigningFailed { path: PathBuf, message: String },

    #[error("verification of {} failed: {message}", .path.display())]
    VerificationFailed { path: PathBuf, message: String },

    #[error("final verification failed for: {}", format_paths(.0))]
    FinalVerificationFailed(Vec<PathBuf>),

    #[error("{} is encrypted; decrypt it first or allow encrypted binaries", .0.display())]
    EncryptedBinary(PathBuf),

    #[error("{} only contains bitcode and cannot be signed", .0.display())]
    BitcodeOnly(PathBuf),

    #[error("no .app bundle found in {}", .0.display())]
    NoAppBundle(PathBuf),

    #[error("multiple .app bundles found in {}", .0.display())]
    MultipleAppBundles(PathBuf),

    #[error("unsupported input {}; expected an .ipa archive or .app directory", .0.display())]
    UnsupportedInput(PathBuf),

    #[error("provisioning profile error: {0}")]
    ProvisioningProfile(String),

    #[error("bad arguments: {0}")]
    CliBadArgs(String),

    #[error("{stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<ResignError>,
    },
}

impl From<figment::Error> for ResignError {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}

impl ResignError {
    /// Whether this is a signing tool failure that may be retried or ignored.
    pub fn is_soft_signing_failure(&self) -> bool {
        matches!(self, Self::SigningFailed { .. })
    }

    /// The error with any stage context removed.
    pub fn root(&self) -> &ResignError {
        match self {
            Self::Stage { source, .. } => source.root(),
            e => e,
        }
    }
}

/// Attach pipeline stage context to errors.
pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T, ResignError>;
}

impl<T, E> StageContext<T> for Result<T, E>
where
    E: Into<ResignError>,
{
    fn stage(self, stage: Stage) -> Result<T, ResignError> {
        self.map_err(|e| ResignError::Stage {
            stage,
            source: Box::new(e.into()),
        })
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
