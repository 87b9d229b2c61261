// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End to end re-signing of an application.

use {
    crate::{
        archive::{compress, copy_tree, extract},
        entitlements::{compute_entitlements, entitlements_for_bundle, write_entitlements},
        error::{ResignError, Stage, StageContext},
        events::{EventListener, LogListener, SigningEvent},
        manifest::{apply_manifest_fixes, InfoPlist},
        orchestrator::{OrchestratorOptions, SigningOrchestrator, SigningPlan, SigningReport},
        provisioning::ProvisioningProfile,
        settings::ResignSettings,
        strip::strip_bundle,
        tools::{CodesignTool, SignRequest, SigningTool},
    },
    ipa_bundles::{BundleWalker, DiscoveredBundle, MachOInfo},
    log::info,
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// What is being re-signed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InputKind {
    /// A zip archive holding `Payload/<name>.app`.
    Ipa,
    /// An application directory.
    AppDirectory,
}

impl InputKind {
    pub fn detect(input: &Path) -> Result<Self, ResignError> {
        let extension = input
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());

        match extension.as_deref() {
            Some("ipa") if input.is_file() => Ok(Self::Ipa),
            Some("app") if input.is_dir() => Ok(Self::AppDirectory),
            _ => Err(ResignError::UnsupportedInput(input.to_path_buf())),
        }
    }
}

/// Result of a successful session.
#[derive(Clone, Debug)]
pub struct ResignOutcome {
    /// The written `.ipa` or `.app`.
    pub output: PathBuf,
    pub report: SigningReport,
    /// Non-fatal problems, including those from signing.
    pub warnings: Vec<String>,
    /// Retained workspace directory, if requested.
    pub workspace: Option<PathBuf>,
}

/// Find the single `.app` directory under `Payload/`.
pub fn find_payload_app(root: &Path) -> Result<PathBuf, ResignError> {
    let payload = root.join("Payload");

    if !payload.is_dir() {
        return Err(ResignError::NoAppBundle(root.to_path_buf()));
    }

    let mut apps = vec![];
    for entry in std::fs::read_dir(&payload)? {
        let path = entry?.path();

        if path.is_dir() && path.extension().map_or(false, |e| e == "app") {
            apps.push(path);
        }
    }

    match apps.len() {
        0 => Err(ResignError::NoAppBundle(payload)),
        1 => Ok(apps.remove(0)),
        _ => Err(ResignError::MultipleAppBundles(payload)),
    }
}

/// Runs the re-signing pipeline for one input.
pub struct ResignSession<T: SigningTool> {
    settings: ResignSettings,
    tool: Arc<T>,
    listener: Arc<dyn EventListener>,
}

impl ResignSession<CodesignTool> {
    /// Session using `codesign` at the configured tool paths, logging progress.
    pub fn with_codesign(settings: ResignSettings) -> Self {
        let tool = CodesignTool::new(settings.tools.clone());

        Self::new(settings, Arc::new(tool), Arc::new(LogListener))
    }
}

impl<T: SigningTool> ResignSession<T> {
    pub fn new(settings: ResignSettings, tool: Arc<T>, listener: Arc<dyn EventListener>) -> Self {
        Self {
            settings,
            tool,
            listener,
        }
    }

    pub fn settings(&self) -> &ResignSettings {
        &self.settings
    }

    fn begin(&self, stage: Stage) {
        self.listener.on_event(&SigningEvent::StageStarted(stage));
    }

    fn warn(&self, message: String, warnings: &mut Vec<String>) {
        self.listener.on_event(&SigningEvent::Warning(message.clone()));
        warnings.push(message);
    }

    async fn check_identity(&self) -> Result<(), ResignError> {
        let identities = self
            .tool
            .identities(self.settings.keychain.as_deref())
            .await?;

        if identities.iter().any(|i| i.matches(&self.settings.identity)) {
            Ok(())
        } else {
            Err(ResignError::IdentityNotFound(self.settings.identity.clone()))
        }
    }

    /// Install the provisioning profile, warning about apparent mismatches.
    fn provision(
        &self,
        bundle: &DiscoveredBundle,
        warnings: &mut Vec<String>,
    ) -> Result<Option<ProvisioningProfile>, ResignError> {
        let Some(path) = &self.settings.mobileprovision else {
            return Ok(None);
        };

        let profile = ProvisioningProfile::from_path(path)?;
        info!(
            "using provisioning profile {} ({})",
            profile.name().unwrap_or("<unnamed>"),
            profile.uuid().unwrap_or("<no UUID>")
        );

        if profile.is_expired(chrono::Utc::now()) {
            self.warn(
                format!("provisioning profile {} has expired", path.display()),
                warnings,
            );
        }

        let bundle_id = match &self.settings.manifest.bundle_id {
            Some(id) => Some(id.clone()),
            None => InfoPlist::from_bundle(&bundle.root)?
                .bundle_identifier()
                .map(|s| s.to_string()),
        };

        if let Some(bundle_id) = bundle_id {
            if !profile.allows_bundle_id(&bundle_id) {
                self.warn(
                    format!(
                        "provisioning profile application identifier {} does not match bundle identifier {}",
                        profile.application_identifier().unwrap_or("<none>"),
                        bundle_id
                    ),
                    warnings,
                );
            }
        }

        profile.install(&bundle.root)?;
        for extension in &bundle.extensions {
            profile.install(&extension.root)?;
        }

        Ok(Some(profile))
    }

    fn inspect(&self, bundle: &DiscoveredBundle, warnings: &mut Vec<String>) -> Result<(), ResignError> {
        let info = MachOInfo::from_path(&bundle.executable)?;
        info!(
            "main executable architectures: {}",
            info.architectures.join(", ")
        );

        if info.bitcode_only {
            return Err(ResignError::BitcodeOnly(bundle.executable.clone()));
        }

        if info.encrypted {
            if self.settings.allow_encrypted {
                self.warn(
                    format!(
                        "{} is encrypted; the result will not run",
                        bundle.executable.display()
                    ),
                    warnings,
                );
            } else {
                return Err(ResignError::EncryptedBinary(bundle.executable.clone()));
            }
        }

        Ok(())
    }

    /// Write entitlements files, keyed by the bundle root they apply to.
    ///
    /// Nested bundles get their own `application-identifier`.
    fn write_bundle_entitlements(
        &self,
        bundle: &DiscoveredBundle,
        entitlements: &plist::Dictionary,
        dir: &Path,
    ) -> Result<BTreeMap<PathBuf, PathBuf>, ResignError> {
        let mut paths = BTreeMap::new();

        let path = dir.join("entitlements.plist");
        write_entitlements(entitlements, &path)?;
        paths.insert(bundle.root.clone(), path.clone());

        for (i, nested) in bundle
            .extensions
            .iter()
            .chain(bundle.nested_apps.iter())
            .enumerate()
        {
            let nested_path = match &nested.identifier {
                Some(id) => {
                    let nested_path = dir.join(format!("entitlements-{}.plist", i));
                    write_entitlements(&entitlements_for_bundle(entitlements, id), &nested_path)?;
                    nested_path
                }
                None => path.clone(),
            };

            paths.insert(nested.root.clone(), nested_path);
        }

        Ok(paths)
    }

    fn plan(
        &self,
        bundle: &DiscoveredBundle,
        entitlements: &BTreeMap<PathBuf, PathBuf>,
    ) -> Result<SigningPlan, ResignError> {
        let order = bundle.signing_order(self.settings.signing_mode)?;

        Ok(SigningPlan::from_order(&order, |binary| {
            let bundle_root = bundle.bundle_for_executable(binary);

            SignRequest {
                binary: binary.to_path_buf(),
                target: bundle_root.unwrap_or(binary).to_path_buf(),
                identity: self.settings.identity.clone(),
                keychain: self.settings.keychain.clone(),
                entitlements: bundle_root
                    .and_then(|root| entitlements.get(root))
                    .cloned(),
            }
        }))
    }

    /// Downgrade an archive failure to a warning when configured.
    fn zip_result(
        &self,
        res: Result<(), ResignError>,
        warnings: &mut Vec<String>,
    ) -> Result<(), ResignError> {
        match res {
            Err(e) if self.settings.ignore_zip_errors => {
                self.warn(e.to_string(), warnings);
                Ok(())
            }
            res => res,
        }
    }

    /// Re-sign an `.ipa` archive or `.app` directory.
    pub async fn run(&self, input: &Path) -> Result<ResignOutcome, ResignError> {
        let mut warnings = vec![];

        self.begin(Stage::Validate);
        self.settings.validate().stage(Stage::Validate)?;
        let kind = InputKind::detect(input).stage(Stage::Validate)?;
        let output = self.settings.output_path(input);
        if output.starts_with(input) || input.starts_with(&output) {
            return Err(ResignError::InvalidSetting(format!(
                "output {} overlaps input {}",
                output.display(),
                input.display()
            )))
            .stage(Stage::Validate);
        }

        self.begin(Stage::Identity);
        self.check_identity().await.stage(Stage::Identity)?;

        self.begin(Stage::Extract);
        let workspace = tempfile::Builder::new()
            .prefix("ipa-resign-")
            .tempdir()
            .stage(Stage::Extract)?;
        let contents = workspace.path().join("contents");

        let app_dir = match kind {
            InputKind::Ipa => {
                let (src, dest) = (input.to_path_buf(), contents.clone());
                let res = tokio::task::spawn_blocking(move || extract(&src, &dest))
                    .await
                    .map_err(ResignError::from)
                    .and_then(|res| res);
                self.zip_result(res, &mut warnings).stage(Stage::Extract)?;

                find_payload_app(&contents).stage(Stage::Extract)?
            }
            InputKind::AppDirectory => {
                let (src, dest) = (input.to_path_buf(), output.clone());
                tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
                    .await
                    .stage(Stage::Extract)?
                    .stage(Stage::Extract)?;

                output.clone()
            }
        };

        self.begin(Stage::Strip);
        strip_bundle(&app_dir, &self.settings.strip).stage(Stage::Strip)?;

        self.begin(Stage::Manifest);
        apply_manifest_fixes(&app_dir, &self.settings.manifest).stage(Stage::Manifest)?;

        self.begin(Stage::Discover);
        let bundle = BundleWalker::new()
            .all_binaries(self.settings.all_binaries)
            .discover(&app_dir)
            .stage(Stage::Discover)?;

        self.begin(Stage::Inspect);
        self.inspect(&bundle, &mut warnings).stage(Stage::Inspect)?;

        self.begin(Stage::Provision);
        let profile = self
            .provision(&bundle, &mut warnings)
            .stage(Stage::Provision)?;

        self.begin(Stage::Entitlements);
        let entitlements = compute_entitlements(
            profile.as_ref(),
            &self.settings.entitlements,
            self.settings.manifest.bundle_id.as_deref(),
        )
        .stage(Stage::Entitlements)?;
        let entitlement_paths = match entitlements {
            Some(entitlements) => self
                .write_bundle_entitlements(&bundle, &entitlements, workspace.path())
                .stage(Stage::Entitlements)?,
            None => BTreeMap::new(),
        };

        self.begin(Stage::Sign);
        let plan = self
            .plan(&bundle, &entitlement_paths)
            .stage(Stage::Sign)?;
        let orchestrator = SigningOrchestrator::new(
            self.tool.clone(),
            self.listener.clone(),
            OrchestratorOptions::from(&self.settings),
        );
        let report = orchestrator.run(plan).await.stage(Stage::Sign)?;
        warnings.extend(report.warnings.iter().cloned());

        if kind == InputKind::Ipa {
            self.begin(Stage::Archive);
            let (src, dest) = (contents.clone(), output.clone());
            let res = tokio::task::spawn_blocking(move || compress(&src, &dest))
                .await
                .map_err(ResignError::from)
                .and_then(|res| res);
            self.zip_result(res, &mut warnings).stage(Stage::Archive)?;
        }

        let workspace = if self.settings.keep_temporary {
            let path = workspace.into_path();
            info!("keeping workspace {}", path.display());
            Some(path)
        } else {
            None
        };

        self.listener.on_event(&SigningEvent::Finished {
            output: output.clone(),
        });

        Ok(ResignOutcome {
            output,
            report,
            warnings,
            workspace,
        })
    }
}
