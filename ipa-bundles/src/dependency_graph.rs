// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library dependency graph and signing order.
//!
//! A library must be signed before anything loading it. Binaries are grouped
//! into layers, where each layer only depends on earlier layers. Layers can
//! be signed concurrently; flattening them yields a valid serial order.
//!
//! Binaries not reachable from the main executable (orphans) are still
//! signed. They are layered together with the rest of the bundle, so their
//! own dependencies are honored, and always precede the main executable,
//! which is alone in the final layer.

use {
    crate::{
        error::BundleError,
        macho::MachOInfo,
        resolver::{normalize_path, resolve_library, LibraryLocation},
    },
    log::{debug, warn},
    std::{
        collections::{BTreeMap, BTreeSet, VecDeque},
        path::{Path, PathBuf},
    },
};

/// How signing operations should be scheduled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SigningMode {
    /// One binary at a time.
    #[default]
    Serial,
    /// All binaries in a layer at once.
    Parallel,
}

/// Binaries that may be signed concurrently.
pub type Layer = Vec<PathBuf>;

/// The order in which binaries should be signed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SigningOrder {
    Serial(Vec<PathBuf>),
    Layered(Vec<Layer>),
}

impl SigningOrder {
    /// All binaries in signing order.
    pub fn flatten(&self) -> Vec<&Path> {
        match self {
            Self::Serial(paths) => paths.iter().map(|p| p.as_path()).collect(),
            Self::Layered(layers) => layers.iter().flatten().map(|p| p.as_path()).collect(),
        }
    }

    /// The order as layers. A serial order has one binary per layer.
    pub fn layers(&self) -> Vec<Vec<&Path>> {
        match self {
            Self::Serial(paths) => paths.iter().map(|p| vec![p.as_path()]).collect(),
            Self::Layered(layers) => layers
                .iter()
                .map(|layer| layer.iter().map(|p| p.as_path()).collect())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Serial(paths) => paths.len(),
            Self::Layered(layers) => layers.iter().map(|l| l.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Provides library references of binaries.
pub trait BinarySource {
    /// Raw library references recorded in a binary, in load command order.
    fn library_references(&self, binary: &Path) -> Result<Vec<String>, BundleError>;

    /// Whether a resolved library path exists.
    fn exists(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }
}

/// Reads library references by parsing binaries on the filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct MachOSource;

impl BinarySource for MachOSource {
    fn library_references(&self, binary: &Path) -> Result<Vec<String>, BundleError> {
        Ok(MachOInfo::from_path(binary)?
            .libraries
            .into_iter()
            .map(|l| l.name)
            .collect())
    }
}

/// Dependencies between the binaries of a bundle.
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    main: PathBuf,
    /// Every binary, in discovery order.
    binaries: Vec<PathBuf>,
    /// Binary to the binaries it loads. Every binary has an entry.
    edges: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl DependencyGraph {
    /// Construct an instance by resolving the references of every binary.
    ///
    /// Paths are lexically normalized. `main` must be one of `binaries`.
    pub fn build(
        main: &Path,
        binaries: &[PathBuf],
        source: &impl BinarySource,
    ) -> Result<Self, BundleError> {
        let mut seen = BTreeSet::new();
        let binaries = binaries
            .iter()
            .map(|p| normalize_path(p))
            .filter(|p| seen.insert(p.clone()))
            .collect::<Vec<_>>();
        let main = normalize_path(main);

        if !seen.contains(&main) {
            return Err(BundleError::MainExecutableNotDiscovered(main));
        }

        let mut edges = BTreeMap::new();

        for binary in &binaries {
            let mut deps = BTreeSet::new();

            for reference in source.library_references(binary)? {
                let path = match resolve_library(binary, &reference, &binaries)? {
                    Some(LibraryLocation::Bundle(path)) => normalize_path(&path),
                    Some(LibraryLocation::System(_)) | None => continue,
                };

                if !source.exists(&path) {
                    warn!(
                        "{} (referenced by {}) does not exist; ignoring",
                        path.display(),
                        binary.display()
                    );
                    continue;
                }

                if &path == binary {
                    continue;
                }

                if seen.contains(&path) {
                    deps.insert(path);
                } else {
                    debug!(
                        "{} (referenced by {}) is not a signing candidate",
                        path.display(),
                        binary.display()
                    );
                }
            }

            edges.insert(binary.clone(), deps);
        }

        Ok(Self {
            main,
            binaries,
            edges,
        })
    }

    /// The main executable.
    pub fn main_executable(&self) -> &Path {
        &self.main
    }

    /// Every binary, in discovery order.
    pub fn binaries(&self) -> &[PathBuf] {
        &self.binaries
    }

    /// Binaries loaded directly by `binary`.
    pub fn dependencies(&self, binary: &Path) -> impl Iterator<Item = &Path> {
        self.edges
            .get(binary)
            .into_iter()
            .flat_map(|deps| deps.iter().map(|p| p.as_path()))
    }

    /// Binaries transitively loaded by the main executable, including itself.
    pub fn reachable(&self) -> BTreeSet<PathBuf> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([self.main.clone()]);

        while let Some(node) = queue.pop_front() {
            if !visited.insert(node.clone()) {
                continue;
            }

            queue.extend(
                self.dependencies(&node)
                    .filter(|p| !visited.contains(*p))
                    .map(|p| p.to_path_buf()),
            );
        }

        visited
    }

    /// Binaries not reachable from the main executable, in discovery order.
    pub fn orphans(&self) -> Vec<PathBuf> {
        let reachable = self.reachable();

        self.binaries
            .iter()
            .filter(|p| !reachable.contains(*p))
            .cloned()
            .collect()
    }

    /// Layer a subset of binaries, considering only edges within the subset.
    ///
    /// Layer 0 holds binaries with no dependencies. Each later layer holds
    /// binaries whose dependencies all sit in strictly earlier layers.
    fn layer_subset(&self, nodes: &BTreeSet<PathBuf>) -> Result<Vec<Layer>, BundleError> {
        let mut remaining = self
            .binaries
            .iter()
            .filter(|p| nodes.contains(*p))
            .collect::<Vec<_>>();
        let mut assigned: BTreeSet<PathBuf> = BTreeSet::new();
        let mut layers = vec![];

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<&PathBuf>, Vec<&PathBuf>) =
                remaining.into_iter().partition(|node| {
                    self.dependencies(node)
                        .filter(|dep| nodes.contains(*dep))
                        .all(|dep| assigned.contains(dep))
                });

            if ready.is_empty() {
                return Err(BundleError::DependencyCycle(
                    blocked.into_iter().cloned().collect(),
                ));
            }

            assigned.extend(ready.iter().map(|p| p.to_path_buf()));
            layers.push(ready.into_iter().cloned().collect());
            remaining = blocked;
        }

        Ok(layers)
    }

    /// Layers of every binary. The main executable is alone in the last layer.
    ///
    /// A binary reachable from the main executable that loads the main
    /// executable is a cycle. An orphan loading the main executable can't be
    /// ordered after it; that edge is dropped with a warning.
    pub fn layers(&self) -> Result<Vec<Layer>, BundleError> {
        let reachable = self.reachable();

        let loaders = self
            .binaries
            .iter()
            .filter(|p| **p != self.main)
            .filter(|p| self.dependencies(p.as_path()).any(|dep| dep == self.main.as_path()))
            .collect::<Vec<_>>();

        let cycle = loaders
            .iter()
            .filter(|p| reachable.contains(**p))
            .map(|p| p.to_path_buf())
            .collect::<Vec<_>>();
        if !cycle.is_empty() {
            let mut nodes = vec![self.main.clone()];
            nodes.extend(cycle);
            return Err(BundleError::DependencyCycle(nodes));
        }

        for orphan in loaders {
            warn!(
                "{} loads the main executable; signing it first anyway",
                orphan.display()
            );
        }

        let others = self
            .binaries
            .iter()
            .filter(|p| **p != self.main)
            .cloned()
            .collect::<BTreeSet<_>>();

        let mut layers = self.layer_subset(&others)?;
        layers.push(vec![self.main.clone()]);

        Ok(layers)
    }

    /// Compute the order in which to sign every binary.
    pub fn signing_order(&self, mode: SigningMode) -> Result<SigningOrder, BundleError> {
        let layers = self.layers()?;

        Ok(match mode {
            SigningMode::Serial => SigningOrder::Serial(layers.into_iter().flatten().collect()),
            SigningMode::Parallel => SigningOrder::Layered(layers),
        })
    }
}

/// Compute the signing order of binaries on the filesystem.
pub fn build_order(
    main_executable: &Path,
    all_binaries: &[PathBuf],
    mode: SigningMode,
) -> Result<SigningOrder, BundleError> {
    DependencyGraph::build(main_executable, all_binaries, &MachOSource)?.signing_order(mode)
}
