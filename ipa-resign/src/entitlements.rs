// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entitlements for re-signed executables.

use {
    crate::{error::ResignError, provisioning::ProvisioningProfile, settings::EntitlementOptions},
    log::{info, warn},
    plist::{Dictionary, Value},
    std::path::Path,
};

const APPLICATION_IDENTIFIER: &str = "application-identifier";
const TEAM_IDENTIFIER: &str = "com.apple.developer.team-identifier";
const KEYCHAIN_ACCESS_GROUPS: &str = "keychain-access-groups";

/// Entitlements dropped when massaging.
///
/// These require capabilities that are provisioned per team and rarely
/// carry over to a different signing identity.
const MASSAGED_KEYS: &[&str] = &[
    "aps-environment",
    "beta-reports-active",
    "com.apple.developer.associated-domains",
    "com.apple.developer.default-data-protection",
    "com.apple.developer.healthkit",
    "com.apple.developer.homekit",
    "com.apple.developer.icloud-container-environment",
    "com.apple.developer.icloud-container-identifiers",
    "com.apple.developer.icloud-services",
    "com.apple.developer.in-app-payments",
    "com.apple.developer.networking.networkextension",
    "com.apple.developer.networking.wifi-info",
    "com.apple.developer.pass-type-identifiers",
    "com.apple.developer.payment-pass-provisioning",
    "com.apple.developer.siri",
    "com.apple.developer.ubiquity-container-identifiers",
    "com.apple.developer.ubiquity-kvstore-identifier",
    "com.apple.security.application-groups",
    "com.apple.networking.vpn.configuration",
];

/// Derive entitlements for bundle executables.
///
/// Starts from the explicit file if given, else from the provisioning
/// profile. Returns `None` when neither source exists.
pub fn compute_entitlements(
    profile: Option<&ProvisioningProfile>,
    options: &EntitlementOptions,
    bundle_id: Option<&str>,
) -> Result<Option<Dictionary>, ResignError> {
    let mut entitlements = if let Some(path) = &options.file {
        info!("using entitlements from {}", path.display());
        Value::from_file(path)?.into_dictionary().ok_or_else(|| {
            ResignError::InvalidSetting(format!(
                "entitlements file {} is not a dictionary",
                path.display()
            ))
        })?
    } else if let Some(entitlements) = profile.and_then(|p| p.entitlements()) {
        info!("using entitlements from provisioning profile");
        entitlements.clone()
    } else {
        return Ok(None);
    };

    let prefix = profile
        .and_then(|p| p.app_id_prefix())
        .map(|s| s.to_string())
        .or_else(|| {
            entitlements
                .get(APPLICATION_IDENTIFIER)
                .and_then(|v| v.as_string())
                .and_then(|s| s.split_once('.'))
                .map(|(prefix, _)| prefix.to_string())
        });

    if let (Some(bundle_id), Some(prefix)) = (bundle_id, &prefix) {
        let app_id = format!("{}.{}", prefix, bundle_id);
        info!("setting {} to {}", APPLICATION_IDENTIFIER, app_id);
        entitlements.insert(APPLICATION_IDENTIFIER.into(), Value::String(app_id));
    }

    if options.massage {
        massage(&mut entitlements, prefix.as_deref());
    }

    if let Some(group) = &options.access_group {
        add_access_group(&mut entitlements, group);
    }

    Ok(Some(entitlements))
}

/// Remove entitlements needing special capabilities and pin the team.
fn massage(entitlements: &mut Dictionary, prefix: Option<&str>) {
    for key in MASSAGED_KEYS {
        if entitlements.remove(key).is_some() {
            warn!("removed entitlement {}", key);
        }
    }

    if let Some(prefix) = prefix {
        entitlements.insert(TEAM_IDENTIFIER.into(), Value::String(prefix.to_string()));
        entitlements.insert(
            KEYCHAIN_ACCESS_GROUPS.into(),
            Value::Array(vec![Value::String(format!("{}.*", prefix))]),
        );
    }
}

fn add_access_group(entitlements: &mut Dictionary, group: &str) {
    let value = Value::String(group.to_string());

    match entitlements.get_mut(KEYCHAIN_ACCESS_GROUPS) {
        Some(Value::Array(groups)) => {
            if !groups.contains(&value) {
                groups.push(value);
            }
        }
        _ => {
            entitlements.insert(KEYCHAIN_ACCESS_GROUPS.into(), Value::Array(vec![value]));
        }
    }
}

/// Entitlements for a nested bundle with its own bundle identifier.
///
/// `application-identifier` keeps its team prefix and takes the bundle's
/// identifier. Everything else is shared with the main application.
pub fn entitlements_for_bundle(entitlements: &Dictionary, bundle_id: &str) -> Dictionary {
    let mut res = entitlements.clone();

    let prefix = entitlements
        .get(APPLICATION_IDENTIFIER)
        .and_then(|v| v.as_string())
        .and_then(|s| s.split_once('.'))
        .map(|(prefix, _)| prefix);

    if let Some(prefix) = prefix {
        res.insert(
            APPLICATION_IDENTIFIER.into(),
            Value::String(format!("{}.{}", prefix, bundle_id)),
        );
    }

    res
}

/// Write entitlements as an XML plist.
pub fn write_entitlements(entitlements: &Dictionary, path: &Path) -> Result<(), ResignError> {
    Value::Dictionary(entitlements.clone()).to_file_xml(path)?;

    Ok(())
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::provisioning::{test::profile_data, ProvisioningProfile},
    };

    fn profile() -> ProvisioningProfile {
        ProvisioningProfile::parse(profile_data()).unwrap()
    }

    fn string<'a>(d: &'a Dictionary, key: &str) -> Option<&'a str> {
        d.get(key).and_then(|v| v.as_string())
    }

    #[test]
    fn from_profile() -> Result<(), ResignError> {
        let profile = profile();
        let e = compute_entitlements(Some(&profile), &EntitlementOptions::default(), None)?
            .unwrap();

        assert_eq!(
            string(&e, APPLICATION_IDENTIFIER),
            Some("ABCDE12345.com.example.*")
        );
        assert_eq!(e.get("get-task-allow"), Some(&Value::Boolean(true)));

        Ok(())
    }

    #[test]
    fn bundle_id_rewrite() -> Result<(), ResignError> {
        let profile = profile();
        let e = compute_entitlements(
            Some(&profile),
            &EntitlementOptions::default(),
            Some("com.example.renamed"),
        )?
        .unwrap();

        assert_eq!(
            string(&e, APPLICATION_IDENTIFIER),
            Some("ABCDE12345.com.example.renamed")
        );

        Ok(())
    }

    #[test]
    fn massaging() -> Result<(), ResignError> {
        let profile = profile();
        let e = compute_entitlements(
            Some(&profile),
            &EntitlementOptions {
                massage: true,
                ..Default::default()
            },
            None,
        )?
        .unwrap();

        assert!(e.get("com.apple.developer.icloud-services").is_none());
        assert_eq!(string(&e, TEAM_IDENTIFIER), Some("ABCDE12345"));
        assert_eq!(
            e.get(KEYCHAIN_ACCESS_GROUPS),
            Some(&Value::Array(vec![Value::String("ABCDE12345.*".into())]))
        );

        Ok(())
    }

    #[test]
    fn access_group() -> Result<(), ResignError> {
        let profile = profile();
        let options = EntitlementOptions {
            access_group: Some("ABCDE12345.com.example.shared".into()),
            ..Default::default()
        };

        let e = compute_entitlements(Some(&profile), &options, None)?.unwrap();
        assert_eq!(
            e.get(KEYCHAIN_ACCESS_GROUPS),
            Some(&Value::Array(vec![
                Value::String("ABCDE12345.*".into()),
                Value::String("ABCDE12345.com.example.shared".into()),
            ]))
        );

        let mut empty = Dictionary::new();
        add_access_group(&mut empty, "G");
        add_access_group(&mut empty, "G");
        assert_eq!(
            empty.get(KEYCHAIN_ACCESS_GROUPS),
            Some(&Value::Array(vec![Value::String("G".into())]))
        );

        Ok(())
    }

    #[test]
    fn file_overrides_profile() -> Result<(), ResignError> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("e.plist");

        let mut d = Dictionary::new();
        d.insert(
            APPLICATION_IDENTIFIER.into(),
            Value::String("ZZZ.com.other".into()),
        );
        write_entitlements(&d, &path)?;

        let options = EntitlementOptions {
            file: Some(path),
            ..Default::default()
        };

        let e = compute_entitlements(None, &options, None)?.unwrap();
        assert_eq!(string(&e, APPLICATION_IDENTIFIER), Some("ZZZ.com.other"));

        let e = compute_entitlements(None, &options, Some("com.renamed"))?.unwrap();
        assert_eq!(string(&e, APPLICATION_IDENTIFIER), Some("ZZZ.com.renamed"));

        Ok(())
    }

    #[test]
    fn nested_bundle() -> Result<(), ResignError> {
        let profile = profile();
        let e = compute_entitlements(
            Some(&profile),
            &EntitlementOptions::default(),
            Some("com.example.demo"),
        )?
        .unwrap();

        let ext = entitlements_for_bundle(&e, "com.example.demo.share");
        assert_eq!(
            string(&ext, APPLICATION_IDENTIFIER),
            Some("ABCDE12345.com.example.demo.share")
        );
        assert_eq!(ext.get("get-task-allow"), e.get("get-task-allow"));
        assert_eq!(
            string(&e, APPLICATION_IDENTIFIER),
            Some("ABCDE12345.com.example.demo")
        );

        // Without an application identifier there's nothing to derive.
        let mut bare = Dictionary::new();
        bare.insert("get-task-allow".into(), Value::Boolean(true));
        assert_eq!(entitlements_for_bundle(&bare, "com.example.x"), bare);

        Ok(())
    }

    #[test]
    fn no_source() -> Result<(), ResignError> {
        assert!(compute_entitlements(None, &EntitlementOptions::default(), None)?.is_none());

        Ok(())
    }
}
