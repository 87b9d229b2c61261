// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolution of dynamic library references against bundle content.

use {
    crate::error::BundleError,
    log::warn,
    std::path::{Component, Path, PathBuf},
};

const RPATH: &str = "@rpath/";
const EXECUTABLE_PATH: &str = "@executable_path/";
const LOADER_PATH: &str = "@loader_path/";

/// Where a library reference points.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LibraryLocation {
    /// An absolute path provided by the operating system. Never signed.
    System(PathBuf),
    /// A path inside the bundle being processed.
    Bundle(PathBuf),
}

impl LibraryLocation {
    pub fn path(&self) -> &Path {
        match self {
            Self::System(p) => p,
            Self::Bundle(p) => p,
        }
    }
}

/// Resolve a library reference made by `binary`.
///
/// `@rpath/X` matches the first entry of `known_paths` ending with the
/// path components of `X`. A miss is logged and yields `None`.
///
/// `@executable_path/` and `@loader_path/` are both replaced by the directory
/// containing `binary`. The result is not normalized.
pub fn resolve_library(
    binary: &Path,
    reference: &str,
    known_paths: &[PathBuf],
) -> Result<Option<LibraryLocation>, BundleError> {
    if reference.starts_with('/') {
        return Ok(Some(LibraryLocation::System(PathBuf::from(reference))));
    }

    if let Some(suffix) = reference.strip_prefix(RPATH) {
        let suffix = Path::new(suffix);

        return Ok(
            match known_paths.iter().find(|candidate| candidate.ends_with(suffix)) {
                Some(path) => Some(LibraryLocation::Bundle(path.clone())),
                None => {
                    warn!(
                        "unable to resolve {} referenced by {}",
                        reference,
                        binary.display()
                    );
                    None
                }
            },
        );
    }

    if let Some(rest) = reference
        .strip_prefix(EXECUTABLE_PATH)
        .or_else(|| reference.strip_prefix(LOADER_PATH))
    {
        let dir = binary.parent().unwrap_or_else(|| Path::new(""));

        return Ok(Some(LibraryLocation::Bundle(dir.join(rest))));
    }

    Err(BundleError::UnsupportedLibraryReference {
        binary: binary.to_path_buf(),
        reference: reference.to_string(),
    })
}

/// Lexically normalize a path, folding `.` and `..` components.
///
/// The filesystem is not consulted, so symlinks are not followed.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut res = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                match res.components().next_back() {
                    Some(Component::Normal(_)) => {
                        res.pop();
                    }
                    // `..` at the root stays at the root.
                    Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                    _ => res.push(component),
                }
            }
            c => res.push(c),
        }
    }

    res
}
