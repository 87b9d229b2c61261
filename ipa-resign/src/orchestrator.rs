// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution of signing operations.
//!
//! A [SigningPlan] mirrors a [SigningOrder]: either a flat sequence of
//! requests executed one at a time, or layers whose requests run concurrently
//! with a barrier between layers.

use {
    crate::{
        error::ResignError,
        events::{EventListener, SigningEvent},
        settings::{ResignSettings, VerificationMode},
        tools::{SignRequest, SigningTool},
    },
    ipa_bundles::SigningOrder,
    log::debug,
    std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    },
    tokio::task::JoinSet,
};

/// Signing requests in execution order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SigningPlan {
    Serial(Vec<SignRequest>),
    Layered(Vec<Vec<SignRequest>>),
}

impl SigningPlan {
    /// Derive a plan from a signing order, mapping each binary to a request.
    pub fn from_order(order: &SigningOrder, mut f: impl FnMut(&Path) -> SignRequest) -> Self {
        match order {
            SigningOrder::Serial(paths) => Self::Serial(paths.iter().map(|p| f(p)).collect()),
            SigningOrder::Layered(layers) => Self::Layered(
                layers
                    .iter()
                    .map(|layer| layer.iter().map(|p| f(p)).collect())
                    .collect(),
            ),
        }
    }

    /// All requests, flattened.
    pub fn requests(&self) -> Vec<&SignRequest> {
        match self {
            Self::Serial(requests) => requests.iter().collect(),
            Self::Layered(layers) => layers.iter().flatten().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.requests().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Failure handling and verification knobs.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OrchestratorOptions {
    pub verification: VerificationMode,
    pub ignore_verification_errors: bool,
    pub ignore_codesign_errors: bool,
    pub sign_retries: u32,
    pub keychain: Option<PathBuf>,
}

impl From<&ResignSettings> for OrchestratorOptions {
    fn from(settings: &ResignSettings) -> Self {
        Self {
            verification: settings.verification,
            ignore_verification_errors: settings.ignore_verification_errors,
            ignore_codesign_errors: settings.ignore_codesign_errors,
            sign_retries: settings.sign_retries,
            keychain: settings.keychain.clone(),
        }
    }
}

/// Result of executing a plan.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SigningReport {
    /// Targets signed successfully, in plan order.
    pub signed: Vec<PathBuf>,
    /// Failures that were ignored.
    pub warnings: Vec<String>,
}

#[derive(Debug)]
struct FileOutcome {
    target: PathBuf,
    signed: bool,
    warnings: Vec<String>,
}

impl SigningReport {
    fn record(&mut self, outcome: FileOutcome) {
        if outcome.signed {
            self.signed.push(outcome.target);
        }
        self.warnings.extend(outcome.warnings);
    }
}

/// Runs a [SigningPlan] against a [SigningTool].
pub struct SigningOrchestrator<T: SigningTool> {
    tool: Arc<T>,
    listener: Arc<dyn EventListener>,
    options: OrchestratorOptions,
}

impl<T: SigningTool> Clone for SigningOrchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            tool: self.tool.clone(),
            listener: self.listener.clone(),
            options: self.options.clone(),
        }
    }
}

impl<T: SigningTool> SigningOrchestrator<T> {
    pub fn new(
        tool: Arc<T>,
        listener: Arc<dyn EventListener>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            tool,
            listener,
            options,
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    fn warn(&self, message: String, warnings: &mut Vec<String>) {
        self.listener.on_event(&SigningEvent::Warning(message.clone()));
        warnings.push(message);
    }

    /// Sign one target, retrying and verifying as configured.
    async fn sign_one(&self, request: SignRequest) -> Result<FileOutcome, ResignError> {
        let target = request.target.clone();
        let mut warnings = vec![];

        self.listener.on_event(&SigningEvent::SigningStarted {
            path: target.clone(),
        });

        let mut attempt = 0;
        loop {
            match self.tool.sign(&request).await {
                Ok(()) => break,
                Err(e) if e.is_soft_signing_failure() && attempt < self.options.sign_retries => {
                    attempt += 1;
                    self.listener.on_event(&SigningEvent::Retrying {
                        path: target.clone(),
                        attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) if e.is_soft_signing_failure() && self.options.ignore_codesign_errors => {
                    self.warn(e.to_string(), &mut warnings);

                    return Ok(FileOutcome {
                        target,
                        signed: false,
                        warnings,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        self.listener.on_event(&SigningEvent::Signed {
            path: target.clone(),
        });

        if self.options.verification.per_file() {
            match self
                .tool
                .verify(&target, self.options.keychain.as_deref())
                .await
            {
                Ok(()) => self.listener.on_event(&SigningEvent::Verified {
                    path: target.clone(),
                }),
                Err(e @ ResignError::VerificationFailed { .. })
                    if self.options.ignore_verification_errors =>
                {
                    self.warn(e.to_string(), &mut warnings);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(FileOutcome {
            target,
            signed: true,
            warnings,
        })
    }

    async fn run_serial(
        &self,
        requests: Vec<SignRequest>,
        report: &mut SigningReport,
    ) -> Result<(), ResignError> {
        for request in requests {
            report.record(self.sign_one(request).await?);
        }

        Ok(())
    }

    async fn run_layer(
        &self,
        layer: Vec<SignRequest>,
        report: &mut SigningReport,
    ) -> Result<(), ResignError> {
        let outstanding = Arc::new(AtomicUsize::new(layer.len()));
        let mut tasks = JoinSet::new();

        for (index, request) in layer.into_iter().enumerate() {
            let this = self.clone();
            let outstanding = outstanding.clone();

            tasks.spawn(async move {
                let res = this.sign_one(request).await;
                let remaining = outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
                debug!("{} operations outstanding in layer", remaining);
                (index, res)
            });
        }

        let mut outcomes = vec![];
        let mut first_error = None;

        // Drain everything so in-flight operations finish before reporting.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(outcome))) => outcomes.push((index, outcome)),
                Ok((_, Err(e))) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(ResignError::from(e));
                }
            }
        }

        outcomes.sort_by_key(|(index, _)| *index);
        for (_, outcome) in outcomes {
            report.record(outcome);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Verify each distinct signed target once.
    async fn final_verification(&self, report: &mut SigningReport) -> Result<(), ResignError> {
        let mut seen = BTreeSet::new();
        let mut failed = vec![];

        for target in report.signed.clone() {
            if !seen.insert(target.clone()) {
                continue;
            }

            match self
                .tool
                .verify(&target, self.options.keychain.as_deref())
                .await
            {
                Ok(()) => self.listener.on_event(&SigningEvent::Verified { path: target }),
                Err(e @ ResignError::VerificationFailed { .. }) => {
                    if self.options.ignore_verification_errors {
                        self.warn(e.to_string(), &mut report.warnings);
                    }
                    failed.push(target);
                }
                Err(e) => return Err(e),
            }
        }

        if failed.is_empty() || self.options.ignore_verification_errors {
            Ok(())
        } else {
            Err(ResignError::FinalVerificationFailed(failed))
        }
    }

    /// Execute a plan.
    ///
    /// Serial plans stop at the first unignored failure. Layered plans finish
    /// the current layer and don't start the next one.
    pub async fn run(&self, plan: SigningPlan) -> Result<SigningReport, ResignError> {
        let mut report = SigningReport::default();

        match plan {
            SigningPlan::Serial(requests) => self.run_serial(requests, &mut report).await?,
            SigningPlan::Layered(layers) => {
                for (index, layer) in layers.into_iter().enumerate() {
                    self.listener.on_event(&SigningEvent::LayerStarted {
                        index,
                        size: layer.len(),
                    });
                    self.run_layer(layer, &mut report).await?;
                }
            }
        }

        if self.options.verification.final_pass() {
            self.final_verification(&mut report).await?;
        }

        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use {
        super::*,
        crate::tools::CodeSigningIdentity,
        std::{collections::BTreeMap, sync::Mutex},
        tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver},
    };

    /// In-memory signing tool recording its invocations.
    #[derive(Debug, Default)]
    pub(crate) struct MockTool {
        /// Remaining soft failures per target.
        pub failures: Mutex<BTreeMap<PathBuf, u32>>,
        pub missing_identity: BTreeSet<PathBuf>,
        pub bad_signatures: BTreeSet<PathBuf>,
        pub identities: Vec<CodeSigningIdentity>,
        pub signed: Mutex<Vec<PathBuf>>,
        pub requests: Mutex<Vec<SignRequest>>,
        pub verified: Mutex<Vec<PathBuf>>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl MockTool {
        pub(crate) fn failing(mut self, path: &str, count: u32) -> Self {
            self.failures.get_mut().unwrap().insert(path.into(), count);
            self
        }

        pub(crate) fn signed(&self) -> Vec<PathBuf> {
            self.signed.lock().unwrap().clone()
        }
    }

    impl SigningTool for MockTool {
        async fn sign(&self, request: &SignRequest) -> Result<(), ResignError> {
            let target = request.target.clone();
            self.requests.lock().unwrap().push(request.clone());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.missing_identity.contains(&target) {
                return Err(ResignError::MissingIdentity(target));
            }

            let fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&target) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        true
                    }
                    _ => false,
                }
            };

            if fail {
                Err(ResignError::SigningFailed {
                    path: target,
                    message: "boom".into(),
                })
            } else {
                self.signed.lock().unwrap().push(target);
                Ok(())
            }
        }

        async fn verify(&self, target: &Path, _keychain: Option<&Path>) -> Result<(), ResignError> {
            self.verified.lock().unwrap().push(target.to_path_buf());

            if self.bad_signatures.contains(target) {
                Err(ResignError::VerificationFailed {
                    path: target.to_path_buf(),
                    message: "invalid signature".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn identities(
            &self,
            _keychain: Option<&Path>,
        ) -> Result<Vec<CodeSigningIdentity>, ResignError> {
            Ok(self.identities.clone())
        }
    }

    fn request(path: &str) -> SignRequest {
        SignRequest {
            binary: path.into(),
            target: path.into(),
            identity: "ID".into(),
            keychain: None,
            entitlements: None,
        }
    }

    fn serial(paths: &[&str]) -> SigningPlan {
        SigningPlan::Serial(paths.iter().map(|p| request(p)).collect())
    }

    fn orchestrator(
        tool: MockTool,
        options: OrchestratorOptions,
    ) -> (
        Arc<MockTool>,
        SigningOrchestrator<MockTool>,
        UnboundedReceiver<SigningEvent>,
    ) {
        let tool = Arc::new(tool);
        let (tx, rx) = unbounded_channel();

        (
            tool.clone(),
            SigningOrchestrator::new(tool, Arc::new(tx), options),
            rx,
        )
    }

    fn events(rx: &mut UnboundedReceiver<SigningEvent>) -> Vec<SigningEvent> {
        let mut events = vec![];
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    fn paths(v: &[&str]) -> Vec<PathBuf> {
        v.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn plan_from_order() {
        let order = SigningOrder::Layered(vec![paths(&["/a", "/b"]), paths(&["/main"])]);
        let plan = SigningPlan::from_order(&order, |p| request(&p.display().to_string()));

        assert_eq!(plan.len(), 3);
        assert_eq!(
            plan,
            SigningPlan::Layered(vec![vec![request("/a"), request("/b")], vec![request("/main")]])
        );

        let plan = SigningPlan::from_order(
            &SigningOrder::Serial(paths(&["/a", "/main"])),
            |p| request(&p.display().to_string()),
        );
        assert_eq!(plan, serial(&["/a", "/main"]));
    }

    #[tokio::test]
    async fn serial_order() -> Result<(), ResignError> {
        let (tool, o, mut rx) = orchestrator(MockTool::default(), Default::default());

        let report = o.run(serial(&["/a", "/b", "/main"])).await?;

        assert_eq!(tool.signed(), paths(&["/a", "/b", "/main"]));
        assert_eq!(report.signed, paths(&["/a", "/b", "/main"]));
        assert!(report.warnings.is_empty());
        assert_eq!(tool.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(tool.verified.lock().unwrap().is_empty());

        let events = events(&mut rx);
        assert_eq!(
            events[..2],
            [
                SigningEvent::SigningStarted { path: "/a".into() },
                SigningEvent::Signed { path: "/a".into() },
            ]
        );
        assert_eq!(events.len(), 6);

        Ok(())
    }

    #[tokio::test]
    async fn retries() -> Result<(), ResignError> {
        let options = OrchestratorOptions {
            sign_retries: 2,
            ..Default::default()
        };
        let (tool, o, mut rx) = orchestrator(MockTool::default().failing("/a", 2), options);

        let report = o.run(serial(&["/a", "/main"])).await?;
        assert_eq!(report.signed, paths(&["/a", "/main"]));
        assert_eq!(tool.requests.lock().unwrap().len(), 4);

        let retries = events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SigningEvent::Retrying { .. }))
            .count();
        assert_eq!(retries, 2);

        let options = OrchestratorOptions {
            sign_retries: 1,
            ..Default::default()
        };
        let (tool, o, _rx) = orchestrator(MockTool::default().failing("/a", 2), options);
        assert!(matches!(
            o.run(serial(&["/a", "/main"])).await,
            Err(ResignError::SigningFailed { .. })
        ));
        assert!(tool.signed().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn serial_failure_stops() {
        let (tool, o, _rx) = orchestrator(MockTool::default().failing("/b", 1), Default::default());

        assert!(matches!(
            o.run(serial(&["/a", "/b", "/main"])).await,
            Err(ResignError::SigningFailed { .. })
        ));

        let attempted = tool
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.target.clone())
            .collect::<Vec<_>>();
        assert_eq!(attempted, paths(&["/a", "/b"]));
    }

    #[tokio::test]
    async fn ignored_codesign_errors() -> Result<(), ResignError> {
        let options = OrchestratorOptions {
            ignore_codesign_errors: true,
            ..Default::default()
        };
        let (tool, o, _rx) = orchestrator(MockTool::default().failing("/b", 1), options);

        let report = o.run(serial(&["/a", "/b", "/main"])).await?;
        assert_eq!(report.signed, paths(&["/a", "/main"]));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(tool.signed(), paths(&["/a", "/main"]));

        Ok(())
    }

    #[tokio::test]
    async fn missing_identity_never_ignored() {
        let options = OrchestratorOptions {
            ignore_codesign_errors: true,
            sign_retries: 3,
            ..Default::default()
        };
        let tool = MockTool {
            missing_identity: ["/a".into()].into_iter().collect(),
            ..Default::default()
        };
        let (tool, o, _rx) = orchestrator(tool, options);

        assert!(matches!(
            o.run(serial(&["/a", "/main"])).await,
            Err(ResignError::MissingIdentity(_))
        ));
        assert_eq!(tool.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn layers_run_concurrently() -> Result<(), ResignError> {
        let (tool, o, mut rx) = orchestrator(MockTool::default(), Default::default());

        let plan = SigningPlan::Layered(vec![
            vec![request("/a"), request("/b"), request("/c")],
            vec![request("/d")],
            vec![request("/main")],
        ]);

        let report = o.run(plan).await?;
        assert_eq!(report.signed, paths(&["/a", "/b", "/c", "/d", "/main"]));
        assert_eq!(tool.max_in_flight.load(Ordering::SeqCst), 3);

        let signed = tool.signed();
        assert_eq!(signed[3..], paths(&["/d", "/main"]));

        let layers = events(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SigningEvent::LayerStarted { index, size } => Some((index, size)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(layers, vec![(0, 3), (1, 1), (2, 1)]);

        Ok(())
    }

    #[tokio::test]
    async fn layer_failure_finishes_layer() {
        let (tool, o, _rx) = orchestrator(MockTool::default().failing("/a", 1), Default::default());

        let plan = SigningPlan::Layered(vec![
            vec![request("/a"), request("/b"), request("/c")],
            vec![request("/main")],
        ]);

        assert!(matches!(
            o.run(plan).await,
            Err(ResignError::SigningFailed { .. })
        ));

        let mut signed = tool.signed();
        signed.sort();
        assert_eq!(signed, paths(&["/b", "/c"]));
    }

    #[tokio::test]
    async fn per_file_verification() -> Result<(), ResignError> {
        let tool = || MockTool {
            bad_signatures: ["/b".into()].into_iter().collect(),
            ..Default::default()
        };

        let options = OrchestratorOptions {
            verification: VerificationMode::PerFile,
            ..Default::default()
        };
        let (mock, o, _rx) = orchestrator(tool(), options.clone());
        assert!(matches!(
            o.run(serial(&["/a", "/b", "/main"])).await,
            Err(ResignError::VerificationFailed { .. })
        ));
        assert_eq!(*mock.verified.lock().unwrap(), paths(&["/a", "/b"]));

        let options = OrchestratorOptions {
            ignore_verification_errors: true,
            ..options
        };
        let (_, o, _rx) = orchestrator(tool(), options);
        let report = o.run(serial(&["/a", "/b", "/main"])).await?;
        assert_eq!(report.signed.len(), 3);
        assert_eq!(report.warnings.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn final_verification() -> Result<(), ResignError> {
        let tool = || MockTool {
            bad_signatures: ["/b".into(), "/c".into()].into_iter().collect(),
            ..Default::default()
        };

        let options = OrchestratorOptions {
            verification: VerificationMode::Final,
            ..Default::default()
        };
        let (mock, o, _rx) = orchestrator(tool(), options.clone());

        match o.run(serial(&["/a", "/b", "/c", "/b", "/main"])).await {
            Err(ResignError::FinalVerificationFailed(failed)) => {
                assert_eq!(failed, paths(&["/b", "/c"]));
            }
            res => panic!("unexpected result: {:?}", res),
        }
        // All signing happens before verification; duplicates verify once.
        assert_eq!(mock.signed().len(), 5);
        assert_eq!(*mock.verified.lock().unwrap(), paths(&["/a", "/b", "/c", "/main"]));

        let options = OrchestratorOptions {
            ignore_verification_errors: true,
            ..options
        };
        let (_, o, _rx) = orchestrator(tool(), options);
        let report = o.run(serial(&["/a", "/b", "/c", "/main"])).await?;
        assert_eq!(report.warnings.len(), 2);

        Ok(())
    }
}
