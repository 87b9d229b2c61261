// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application archive (`.ipa`) handling and directory copies.

use {
    crate::error::ResignError,
    log::{debug, info, warn},
    simple_file_manifest::create_symlink,
    std::{
        fs::File,
        io::{Read, Write},
        path::{Component, Path, PathBuf},
    },
    zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter},
};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Whether a symlink at `name` (relative to the extraction root) pointing at
/// `target` stays within the extraction root.
///
/// Targets must be relative, with `..` only as a leading run no longer than
/// the depth of the link's directory.
fn symlink_target_is_contained(name: &Path, target: &Path) -> bool {
    let depth = name.parent().map_or(0, |p| {
        p.components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count()
    });

    let mut ups = 0;
    let mut descended = false;

    for component in target.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir if !descended => ups += 1,
            Component::Normal(_) => descended = true,
            _ => return false,
        }
    }

    ups <= depth
}

/// Whether any directory leading to `name` is a symlink on disk.
fn through_symlink(dest: &Path, name: &Path) -> bool {
    let mut current = dest.to_path_buf();

    name.parent()
        .into_iter()
        .flat_map(|p| p.components())
        .any(|component| {
            current.push(component);
            current
                .symlink_metadata()
                .map_or(false, |m| m.file_type().is_symlink())
        })
}

/// Extract a zip archive into a directory.
///
/// Unix modes and symlinks are restored. Entries with names escaping the
/// destination, symlinks pointing outside of it, and entries that would be
/// written through a symlink are ignored.
pub fn extract(archive: &Path, dest: &Path) -> Result<(), ResignError> {
    info!("extracting {} to {}", archive.display(), dest.display());

    let mut zip = ZipArchive::new(File::open(archive)?)?;
    std::fs::create_dir_all(dest)?;

    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;

        let Some(name) = file.enclosed_name().map(|p| p.to_path_buf()) else {
            debug!("ignoring unsafe archive entry {}", file.name());
            continue;
        };
        let path = dest.join(&name);

        if through_symlink(dest, &name) {
            warn!("ignoring archive entry {} below a symlink", file.name());
            continue;
        }

        if file.is_dir() {
            std::fs::create_dir_all(&path)?;
            continue;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mode = file.unix_mode();

        if mode.map_or(false, |m| m & S_IFMT == S_IFLNK) {
            let mut target = String::new();
            file.read_to_string(&mut target)?;

            if !symlink_target_is_contained(&name, Path::new(&target)) {
                warn!(
                    "ignoring symlink {} pointing outside the archive: {}",
                    file.name(),
                    target
                );
                continue;
            }

            if path.symlink_metadata().is_ok() {
                std::fs::remove_file(&path)?;
            }
            create_symlink(&path, &target)?;
            continue;
        }

        // Replace rather than write through an existing symlink.
        if path
            .symlink_metadata()
            .map_or(false, |m| m.file_type().is_symlink())
        {
            std::fs::remove_file(&path)?;
        }

        let mut fh = File::create(&path)?;
        std::io::copy(&mut file, &mut fh)?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fh.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }

    Ok(())
}

/// Write the content of a directory into a zip archive.
///
/// Entry names are relative to `src_dir`. Entries are sorted by name.
pub fn compress(src_dir: &Path, output: &Path) -> Result<(), ResignError> {
    info!("compressing {} to {}", src_dir.display(), output.display());

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut zip = ZipWriter::new(File::create(output)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(src_dir)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let path = entry.path();

        let Ok(rel) = path.strip_prefix(src_dir) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        // Zip entry names always use forward slashes.
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let metadata = path.symlink_metadata()?;

        if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(path)?;
            zip.add_symlink(name, target.to_string_lossy(), options)?;
        } else if metadata.is_dir() {
            zip.add_directory(name, options)?;
        } else {
            #[cfg(unix)]
            let options = {
                use std::os::unix::fs::PermissionsExt;
                options.unix_permissions(metadata.permissions().mode())
            };

            zip.start_file(name, options)?;
            let mut fh = File::open(path)?;
            std::io::copy(&mut fh, &mut zip)?;
        }
    }

    zip.finish()?.flush()?;

    Ok(())
}

/// Recursively copy a directory, preserving symlinks and modification times.
///
/// An existing destination is replaced.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<Vec<PathBuf>, ResignError> {
    info!("copying {} to {}", src.display(), dest.display());

    if dest.symlink_metadata().is_ok() {
        std::fs::remove_dir_all(dest)?;
    }

    let mut copied = vec![];

    for entry in walkdir::WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let source_path = entry.path();
        let Ok(rel) = source_path.strip_prefix(src) else {
            continue;
        };
        let dest_path = dest.join(rel);

        let metadata = source_path.symlink_metadata()?;
        let mtime = filetime::FileTime::from_last_modification_time(&metadata);

        if metadata.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
        } else if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(source_path)?;
            create_symlink(&dest_path, target)?;
            filetime::set_symlink_file_times(
                &dest_path,
                filetime::FileTime::from_last_access_time(&metadata),
                mtime,
            )?;
        } else {
            std::fs::copy(source_path, &dest_path)?;
            filetime::set_file_mtime(&dest_path, mtime)?;
            copied.push(dest_path);
        }
    }

    Ok(copied)
}
