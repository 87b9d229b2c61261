// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Info.plist` editing.

use {
    crate::{error::ResignError, settings::ManifestOptions},
    log::{info, warn},
    plist::{Dictionary, Value},
    std::path::{Path, PathBuf},
};

const BINARY_PLIST_MAGIC: &[u8] = b"bplist";

/// An `Info.plist` file that remembers its serialization format.
#[derive(Clone, Debug)]
pub struct InfoPlist {
    path: PathBuf,
    dict: Dictionary,
    binary: bool,
}

impl InfoPlist {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ResignError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        let binary = data.starts_with(BINARY_PLIST_MAGIC);
        let dict = Value::from_reader(std::io::Cursor::new(data))?
            .into_dictionary()
            .ok_or_else(|| {
                ResignError::InvalidSetting(format!("{} is not a dictionary", path.display()))
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            dict,
            binary,
        })
    }

    /// Load the `Info.plist` of a bundle directory.
    pub fn from_bundle(bundle_dir: &Path) -> Result<Self, ResignError> {
        Self::from_path(bundle_dir.join("Info.plist"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    pub fn dict_mut(&mut self) -> &mut Dictionary {
        &mut self.dict
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.dict.get(key).and_then(|v| v.as_string())
    }

    pub fn bundle_identifier(&self) -> Option<&str> {
        self.string("CFBundleIdentifier")
    }

    /// Write back in the format the file was read in.
    pub fn save(&self) -> Result<(), ResignError> {
        let value = Value::Dictionary(self.dict.clone());

        if self.binary {
            value.to_file_binary(&self.path)?;
        } else {
            value.to_file_xml(&self.path)?;
        }

        Ok(())
    }
}

/// Apply requested edits to an application's manifests.
///
/// The main `Info.plist` receives every edit. With a bundle identifier
/// override, nested bundles whose identifiers start with the old identifier
/// are renamed to keep the same suffix.
pub fn apply_manifest_fixes(app_dir: &Path, options: &ManifestOptions) -> Result<(), ResignError> {
    if options.is_empty() {
        return Ok(());
    }

    let mut main = InfoPlist::from_bundle(app_dir)?;
    let old_id = main.bundle_identifier().map(|s| s.to_string());

    if let Some(new_id) = &options.bundle_id {
        info!(
            "changing bundle identifier from {} to {}",
            old_id.as_deref().unwrap_or("<none>"),
            new_id
        );
        main.dict_mut()
            .insert("CFBundleIdentifier".into(), Value::String(new_id.clone()));

        if let Some(old_id) = &old_id {
            rename_nested_identifiers(app_dir, old_id, new_id)?;
        }
    }

    if options.force_family {
        info!("declaring support for iPhone and iPad");
        main.dict_mut().insert(
            "UIDeviceFamily".into(),
            Value::Array(vec![Value::Integer(1i64.into()), Value::Integer(2i64.into())]),
        );
    }

    if options.remove_supported_devices && main.dict_mut().remove("UISupportedDevices").is_some() {
        info!("removed UISupportedDevices");
    }

    if options.allow_http {
        info!("allowing arbitrary HTTP loads");
        let dict = main.dict_mut();
        let mut ats = dict
            .get("NSAppTransportSecurity")
            .and_then(|v| v.as_dictionary())
            .cloned()
            .unwrap_or_default();
        ats.insert("NSAllowsArbitraryLoads".into(), Value::Boolean(true));
        dict.insert("NSAppTransportSecurity".into(), Value::Dictionary(ats));
    }

    if let Some(version) = &options.min_os_version {
        info!("setting MinimumOSVersion to {}", version);
        main.dict_mut()
            .insert("MinimumOSVersion".into(), Value::String(version.clone()));
    }

    main.save()
}

fn rename_nested_identifiers(app_dir: &Path, old_id: &str, new_id: &str) -> Result<(), ResignError> {
    let main_plist = app_dir.join("Info.plist");

    for entry in walkdir::WalkDir::new(app_dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();

        if !entry.file_type().is_file() || path.file_name().map_or(true, |n| n != "Info.plist") {
            continue;
        }
        if path == main_plist {
            continue;
        }

        let mut plist = match InfoPlist::from_path(path) {
            Ok(plist) => plist,
            Err(e) => {
                warn!("ignoring unreadable {}: {}", path.display(), e);
                continue;
            }
        };

        let mut changed = false;

        for key in ["CFBundleIdentifier", "WKCompanionAppBundleIdentifier"] {
            let Some(renamed) = plist
                .string(key)
                .and_then(|id| id.strip_prefix(old_id))
                .filter(|rest| rest.is_empty() || rest.starts_with('.'))
                .map(|rest| format!("{}{}", new_id, rest))
            else {
                continue;
            };

            info!("{}: {} -> {}", path.display(), key, renamed);
            plist.dict_mut().insert(key.into(), Value::String(renamed));
            changed = true;
        }

        if changed {
            plist.save()?;
        }
    }

    Ok(())
}
