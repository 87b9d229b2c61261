// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

/// Errors raised while inspecting and ordering bundle content.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mach-O parse error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("binary data error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Mach-O write error: {0}")]
    MachOWrite(String),

    #[error("{0} is not a Mach-O binary")]
    NotMachO(String),

    #[error("{} is not a regular file", .0.display())]
    NotRegularFile(PathBuf),

    #[error("Mach-O data is truncated ({0} bytes)")]
    Truncated(usize),

    #[error("fat binary contains no architectures")]
    EmptyFatBinary,

    #[error("unsupported library reference {reference} in {}", .binary.display())]
    UnsupportedLibraryReference { binary: PathBuf, reference: String },

    #[error("dependency cycle among: {}", format_paths(.0))]
    DependencyCycle(Vec<PathBuf>),

    #[error("main executable {} is not among the discovered binaries", .0.display())]
    MainExecutableNotDiscovered(PathBuf),

    #[error("could not find main executable of {}", .0.display())]
    MainExecutableNotFound(PathBuf),

    #[error("{} is not a directory", .0.display())]
    NotDirectory(PathBuf),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
