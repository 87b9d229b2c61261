// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning profiles.
//!
//! A provisioning profile (`.mobileprovision`) is a CMS signed data structure
//! wrapping an XML plist. We only read the plist; the CMS signature is not
//! verified.

use {
    crate::error::ResignError,
    chrono::{DateTime, Utc},
    cryptographic_message_syntax::SignedData,
    log::debug,
    std::{io::Cursor, path::Path},
};

/// File name of the profile installed inside bundles.
pub const EMBEDDED_PROFILE_NAME: &str = "embedded.mobileprovision";

/// A parsed provisioning profile.
#[derive(Clone, Debug)]
pub struct ProvisioningProfile {
    /// Raw profile data, as installed into bundles.
    data: Vec<u8>,
    plist: plist::Dictionary,
}

impl ProvisioningProfile {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ResignError> {
        Self::parse(std::fs::read(path.as_ref())?)
    }

    /// Parse profile data.
    ///
    /// The plist is taken from the CMS signed content. If the data isn't
    /// valid CMS, the first embedded XML plist is used instead.
    pub fn parse(data: Vec<u8>) -> Result<Self, ResignError> {
        let content = match SignedData::parse_ber(&data) {
            Ok(signed_data) => signed_data.signed_content().map(|c| c.to_vec()),
            Err(e) => {
                debug!("provisioning profile is not CMS ({}); scanning for plist", e);
                None
            }
        };

        let xml = content
            .or_else(|| find_xml_plist(&data).map(|x| x.to_vec()))
            .ok_or_else(|| {
                ResignError::ProvisioningProfile("no property list found in profile".into())
            })?;

        let plist = plist::Value::from_reader(Cursor::new(xml))?
            .into_dictionary()
            .ok_or_else(|| {
                ResignError::ProvisioningProfile("property list is not a dictionary".into())
            })?;

        Ok(Self { data, plist })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn plist(&self) -> &plist::Dictionary {
        &self.plist
    }

    fn string(&self, key: &str) -> Option<&str> {
        self.plist.get(key).and_then(|v| v.as_string())
    }

    fn first_string(&self, key: &str) -> Option<&str> {
        self.plist
            .get(key)
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_string())
    }

    pub fn name(&self) -> Option<&str> {
        self.string("Name")
    }

    pub fn uuid(&self) -> Option<&str> {
        self.string("UUID")
    }

    pub fn team_identifier(&self) -> Option<&str> {
        self.first_string("TeamIdentifier")
    }

    /// Prefix for application identifiers. Usually the team identifier.
    pub fn app_id_prefix(&self) -> Option<&str> {
        self.first_string("ApplicationIdentifierPrefix")
            .or_else(|| self.team_identifier())
    }

    pub fn entitlements(&self) -> Option<&plist::Dictionary> {
        self.plist
            .get("Entitlements")
            .and_then(|v| v.as_dictionary())
    }

    /// `application-identifier` entitlement. e.g. `ABCDE12345.com.example.*`.
    pub fn application_identifier(&self) -> Option<&str> {
        self.entitlements()
            .and_then(|e| e.get("application-identifier"))
            .and_then(|v| v.as_string())
    }

    pub fn provisioned_devices(&self) -> Vec<&str> {
        self.plist
            .get("ProvisionedDevices")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_string()).collect())
            .unwrap_or_default()
    }

    pub fn expiration_date(&self) -> Option<DateTime<Utc>> {
        self.plist
            .get("ExpirationDate")
            .and_then(|v| v.as_date())
            .map(|d| DateTime::<Utc>::from(std::time::SystemTime::from(d)))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date().map_or(false, |d| d < now)
    }

    /// Whether this profile can sign an application with the bundle identifier.
    ///
    /// The application identifier is `<prefix>.<pattern>`, where the pattern is
    /// an exact identifier or ends in `*`.
    pub fn allows_bundle_id(&self, bundle_id: &str) -> bool {
        let Some(app_id) = self.application_identifier() else {
            return false;
        };

        let pattern = match self.app_id_prefix() {
            Some(prefix) => app_id
                .strip_prefix(prefix)
                .and_then(|s| s.strip_prefix('.'))
                .unwrap_or(app_id),
            None => app_id.split_once('.').map_or(app_id, |(_, rest)| rest),
        };

        match pattern.strip_suffix('*') {
            Some(prefix) => bundle_id.starts_with(prefix),
            None => pattern == bundle_id,
        }
    }

    /// Write the profile into a bundle as `embedded.mobileprovision`.
    pub fn install(&self, bundle_dir: &Path) -> Result<(), ResignError> {
        std::fs::write(bundle_dir.join(EMBEDDED_PROFILE_NAME), &self.data)?;

        Ok(())
    }
}

/// Find the span of an XML plist inside arbitrary data.
fn find_xml_plist(data: &[u8]) -> Option<&[u8]> {
    const START: &[u8] = b"<?xml";
    const END: &[u8] = b"</plist>";

    let start = data.windows(START.len()).position(|w| w == START)?;
    let end = data[start..]
        .windows(END.len())
        .position(|w| w == END)?
        + start
        + END.len();

    Some(&data[start..end])
}
