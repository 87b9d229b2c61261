// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Removal of optional bundle content.

use {
    crate::{error::ResignError, settings::StripOptions},
    log::warn,
    std::path::{Path, PathBuf},
};

/// Remove content from an application directory.
///
/// Returns the removed paths.
pub fn strip_bundle(app_dir: &Path, options: &StripOptions) -> Result<Vec<PathBuf>, ResignError> {
    let mut targets = vec![];

    if options.watch_app {
        targets.push(app_dir.join("Watch"));
        targets.push(app_dir.join("com.apple.WatchPlaceholder"));
    }

    if options.plugins {
        targets.push(app_dir.join("PlugIns"));
    }

    if options.xctests {
        for entry in walkdir::WalkDir::new(app_dir).sort_by_file_name() {
            let entry = entry?;

            if entry.file_type().is_dir()
                && entry.path().extension().map_or(false, |e| e == "xctest")
            {
                targets.push(entry.path().to_path_buf());
            }
        }
    }

    let mut removed = vec![];

    for path in targets {
        // Nested under something already removed.
        if removed.iter().any(|r: &PathBuf| path.starts_with(r)) {
            continue;
        }

        let Ok(metadata) = path.symlink_metadata() else {
            continue;
        };

        warn!("removing {}", path.display());
        if metadata.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }

        removed.push(path);
    }

    Ok(removed)
}
