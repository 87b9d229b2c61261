// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        error::ResignError,
        settings::{
            EntitlementOptions, ManifestOptions, ResignSettings, StripOptions, VerificationMode,
        },
        tools::ToolPaths,
    },
    figment::{
        providers::{Env, Format, Serialized, Toml},
        Figment,
    },
    ipa_bundles::SigningMode,
    log::debug,
    serde::{Deserialize, Serialize},
    std::{
        ops::{Deref, DerefMut},
        path::{Path, PathBuf},
    },
};

/// Configuration file profile definition.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Configuration for the sign command.
    #[serde(default)]
    pub sign: SignConfig,

    /// Locations of external programs.
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Configuration for the sign command.
///
/// Unset values fall through to lower priority sources.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SignConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keychain: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobileprovision: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerificationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_verification_errors: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_codesign_errors: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_zip_errors: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_encrypted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_binaries: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub massage_entitlements: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_family: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_http: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_supported_devices: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub without_watchapp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub without_plugins: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub without_xctests: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_temporary: Option<bool>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codesign: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<PathBuf>,
}

impl ToolsConfig {
    pub fn tool_paths(&self) -> ToolPaths {
        let defaults = ToolPaths::default();

        ToolPaths {
            codesign: self.codesign.clone().unwrap_or(defaults.codesign),
            security: self.security.clone().unwrap_or(defaults.security),
        }
    }
}

impl Config {
    /// Convert to settings for a re-signing session.
    ///
    /// The result still needs validation.
    pub fn resign_settings(&self, output: Option<PathBuf>) -> ResignSettings {
        let s = &self.sign;
        let flag = |v: Option<bool>| v.unwrap_or(false);

        ResignSettings {
            identity: s.identity.clone().unwrap_or_default(),
            keychain: s.keychain.clone(),
            mobileprovision: s.mobileprovision.clone(),
            output,
            signing_mode: if flag(s.parallel) {
                SigningMode::Parallel
            } else {
                SigningMode::Serial
            },
            verification: s.verify.unwrap_or_default(),
            ignore_verification_errors: flag(s.ignore_verification_errors),
            ignore_codesign_errors: flag(s.ignore_codesign_errors),
            ignore_zip_errors: flag(s.ignore_zip_errors),
            allow_encrypted: flag(s.allow_encrypted),
            all_binaries: flag(s.all_binaries),
            sign_retries: s.sign_retries.unwrap_or(0),
            strip: StripOptions {
                watch_app: flag(s.without_watchapp),
                plugins: flag(s.without_plugins),
                xctests: flag(s.without_xctests),
            },
            manifest: ManifestOptions {
                bundle_id: s.bundle_id.clone(),
                force_family: flag(s.force_family),
                remove_supported_devices: flag(s.remove_supported_devices),
                allow_http: flag(s.allow_http),
                min_os_version: s.min_os_version.clone(),
            },
            entitlements: EntitlementOptions {
                file: s.entitlements.clone(),
                massage: flag(s.massage_entitlements),
                access_group: s.access_group.clone(),
            },
            keep_temporary: flag(s.keep_temporary),
            tools: self.tools.tool_paths(),
        }
    }
}

/// Used to instantiate [Config] instances.
#[derive(Clone)]
pub struct ConfigBuilder {
    loader: Figment,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            loader: Figment::new(),
        }
    }
}

impl Deref for ConfigBuilder {
    type Target = Figment;

    fn deref(&self) -> &Self::Target {
        &self.loader
    }
}

impl DerefMut for ConfigBuilder {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.loader
    }
}

impl ConfigBuilder {
    /// Add the $XDG_CONFIG/ipa-resign/ipa-resign.toml user config file if it exists.
    pub fn with_user_config_file(mut self) -> Self {
        if let Some(base) = dirs::config_dir() {
            let p = base.join("ipa-resign").join("ipa-resign.toml");
            debug!("registering user config file: {}", p.display());

            self.loader = self.loader.merge(Toml::file(p).nested());
        }

        self
    }

    /// Merge a config file from `pwd`/ipa-resign.toml.
    pub fn with_cwd_config_file(mut self) -> Self {
        if let Ok(cwd) = std::env::current_dir() {
            let p = cwd.join("ipa-resign.toml");
            debug!("registering cwd config file: {}", p.display());

            self.loader = self.loader.merge(Toml::file(p).nested());
        }

        self
    }

    /// Merge with environment variables.
    ///
    /// `IPA_RESIGN_SIGN__IDENTITY` maps to `sign.identity`. Must be called
    /// after [Self::profile()] so variables apply to the selected profile.
    pub fn with_env_prefix(mut self) -> Self {
        debug!("registering IPA_RESIGN_ environment variable config source");
        let env = Env::prefixed("IPA_RESIGN_")
            .split("__")
            .profile(self.loader.profile().to_string());

        self.loader = self.loader.merge(env);
        self
    }

    /// Add a TOML config file to this instance.
    pub fn toml_file(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        debug!("registering custom config file: {}", path.display());
        self.loader = self.loader.merge(Toml::file(path).nested());
        self
    }

    /// Add a TOML string config to this instance.
    pub fn toml_string(mut self, data: &str) -> Self {
        debug!("registering TOML string config data");
        self.loader = self.loader.merge(Toml::string(data).nested());
        self
    }

    /// Merge a [Config] struct into this builder.
    pub fn with_config_struct(mut self, config: Config) -> Self {
        debug!("registering config struct");
        let serialized = Serialized::defaults(config).profile(self.loader.profile().to_string());

        self.loader = self.loader.merge(serialized);
        self
    }

    /// Load the named profile instead of the `[default]` profile.
    pub fn profile(mut self, profile: String) -> Self {
        self.loader = self.loader.select(profile);
        self
    }

    /// Obtain a config profile.
    pub fn config(self) -> Result<Config, ResignError> {
        Ok(self.loader.extract()?)
    }
}

#[cfg(test)]
mod test {
    use {super::*, indoc::indoc};

    #[test]
    fn default_config() {
        let c = ConfigBuilder::default().config().unwrap();

        assert_eq!(c, Config::default());

        let s = c.resign_settings(None);
        assert_eq!(s.signing_mode, SigningMode::Serial);
        assert_eq!(s.tools, ToolPaths::default());
        assert!(s.identity.is_empty());
    }

    #[test]
    fn sign_config() {
        let c = ConfigBuilder::default()
            .toml_string(indoc! {r#"
                [default.sign]
                identity = "Apple Development: Jane Doe (ABCDE12345)"
                parallel = true
                verify = "per-file-and-final"
                sign_retries = 2
                bundle_id = "com.example.renamed"
                without_watchapp = true

                [default.tools]
                codesign = "/opt/bin/codesign"
            "#})
            .config()
            .unwrap();

        assert_eq!(
            c.sign.identity.as_deref(),
            Some("Apple Development: Jane Doe (ABCDE12345)")
        );

        let s = c.resign_settings(Some("/out.ipa".into()));
        assert_eq!(s.signing_mode, SigningMode::Parallel);
        assert_eq!(s.verification, VerificationMode::PerFileAndFinal);
        assert_eq!(s.sign_retries, 2);
        assert_eq!(s.manifest.bundle_id.as_deref(), Some("com.example.renamed"));
        assert!(s.strip.watch_app);
        assert!(!s.strip.plugins);
        assert_eq!(s.output, Some(PathBuf::from("/out.ipa")));
        assert_eq!(s.tools.codesign, PathBuf::from("/opt/bin/codesign"));
        assert_eq!(s.tools.security, PathBuf::from("/usr/bin/security"));
    }

    #[test]
    fn unknown_key() {
        assert!(ConfigBuilder::default()
            .toml_string(indoc! {r#"
                [default.sign]
                identiy = "typo"
            "#})
            .config()
            .is_err());
    }

    #[test]
    fn profiles_and_overrides() {
        let data = indoc! {r#"
            [default.sign]
            identity = "Default"
            ignore_zip_errors = true

            [release.sign]
            identity = "Release"
        "#};

        let c = ConfigBuilder::default()
            .toml_string(data)
            .profile("release".into())
            .config()
            .unwrap();
        assert_eq!(c.sign.identity.as_deref(), Some("Release"));
        // Values not in the selected profile come from the default profile.
        assert_eq!(c.sign.ignore_zip_errors, Some(true));

        let c = ConfigBuilder::default()
            .toml_string(data)
            .with_config_struct(Config {
                sign: SignConfig {
                    identity: Some("Command Line".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .config()
            .unwrap();
        assert_eq!(c.sign.identity.as_deref(), Some("Command Line"));
        assert_eq!(c.sign.ignore_zip_errors, Some(true));
    }
}
