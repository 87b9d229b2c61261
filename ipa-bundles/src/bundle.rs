// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovery of binaries in application bundles.

use {
    crate::{
        dependency_graph::{DependencyGraph, MachOSource, SigningMode, SigningOrder},
        error::BundleError,
        macho::{sniff_path, MachOInfo},
        resolver::normalize_path,
    },
    log::{debug, info, warn},
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// Read a string key from the `Info.plist` in a directory.
///
/// Returns `None` if the directory has no `Info.plist` or the key is not a string.
pub fn info_plist_string(dir: &Path, key: &str) -> Result<Option<String>, BundleError> {
    let path = dir.join("Info.plist");

    if !path.is_file() {
        return Ok(None);
    }

    let value = plist::Value::from_file(&path)?;

    Ok(value
        .as_dictionary()
        .and_then(|dict| dict.get(key))
        .and_then(|v| v.as_string())
        .map(|s| s.to_string()))
}

/// Like [info_plist_string], but an unreadable `Info.plist` is logged and treated as absent.
fn manifest_string(dir: &Path, key: &str) -> Option<String> {
    info_plist_string(dir, key).unwrap_or_else(|e| {
        warn!("ignoring unreadable {}: {}", dir.join("Info.plist").display(), e);
        None
    })
}

/// A bundle nested inside the main application.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NestedBundle {
    /// Root directory of the bundle. e.g. `PlugIns/Share.appex`.
    pub root: PathBuf,
    /// `CFBundleIdentifier` from its `Info.plist`.
    pub identifier: Option<String>,
    /// Main executable, if it exists on disk.
    pub executable: Option<PathBuf>,
}

impl NestedBundle {
    fn from_dir(root: &Path) -> Self {
        let identifier = manifest_string(root, "CFBundleIdentifier");
        let executable = manifest_string(root, "CFBundleExecutable")
            .map(|name| root.join(name))
            .filter(|p| p.is_file());

        Self {
            root: root.to_path_buf(),
            identifier,
            executable,
        }
    }
}

/// Binaries and bundles found in an application directory.
#[derive(Clone, Debug)]
pub struct DiscoveredBundle {
    /// Root directory of the application. e.g. `Payload/Foo.app`.
    pub root: PathBuf,
    /// The application's main executable.
    pub executable: PathBuf,
    /// Every binary to sign, including the main executable, in discovery order.
    pub binaries: Vec<PathBuf>,
    /// Nested application bundles. e.g. `Watch/Foo.app`.
    pub nested_apps: Vec<NestedBundle>,
    /// App extensions under `PlugIns/`.
    pub extensions: Vec<NestedBundle>,
    /// Mach-O files that will not be signed.
    pub skipped: Vec<PathBuf>,
    /// Dependencies between `binaries`.
    pub graph: DependencyGraph,
}

impl DiscoveredBundle {
    /// Binaries to sign other than the main executable.
    pub fn libraries(&self) -> impl Iterator<Item = &Path> {
        self.binaries
            .iter()
            .filter(move |p| *p != &self.executable)
            .map(|p| p.as_path())
    }

    /// Libraries transitively loaded by the main executable.
    pub fn reachable_libraries(&self) -> Vec<PathBuf> {
        let reachable = self.graph.reachable();

        self.libraries()
            .filter(|p| reachable.contains(*p))
            .map(|p| p.to_path_buf())
            .collect()
    }

    /// Binaries not loaded by the main executable, in discovery order.
    pub fn orphaned_libraries(&self) -> Vec<PathBuf> {
        self.graph.orphans()
    }

    /// Compute the order to sign binaries in.
    pub fn signing_order(&self, mode: SigningMode) -> Result<SigningOrder, BundleError> {
        self.graph.signing_order(mode)
    }

    /// Bundles whose main executable is this binary.
    ///
    /// Returns the bundle root for main executables of the application, nested
    /// applications, and extensions.
    pub fn bundle_for_executable(&self, binary: &Path) -> Option<&Path> {
        if binary == self.executable {
            return Some(&self.root);
        }

        self.nested_apps
            .iter()
            .chain(self.extensions.iter())
            .find(|b| b.executable.as_deref() == Some(binary))
            .map(|b| b.root.as_path())
    }
}

/// Finds the binaries of an application bundle that must be signed.
#[derive(Clone, Debug, Default)]
pub struct BundleWalker {
    all_binaries: bool,
}

impl BundleWalker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign every Mach-O file, not just frameworks and bundle executables.
    pub fn all_binaries(mut self, value: bool) -> Self {
        self.all_binaries = value;
        self
    }

    /// Resolve the main executable of an application directory.
    ///
    /// Uses `CFBundleExecutable` from `Info.plist`, falling back to the
    /// directory name without its `.app` suffix when the manifest is
    /// missing, unreadable, or lacks the key.
    pub fn main_executable(app_dir: &Path) -> Result<PathBuf, BundleError> {
        let name = match manifest_string(app_dir, "CFBundleExecutable") {
            Some(name) => name,
            None => {
                let name = app_dir
                    .file_name()
                    .and_then(|s| s.to_str())
                    .ok_or_else(|| BundleError::MainExecutableNotFound(app_dir.to_path_buf()))?;

                debug!("no CFBundleExecutable; deriving from {}", name);
                name.strip_suffix(".app").unwrap_or(name).to_string()
            }
        };

        let path = app_dir.join(name);

        if path.is_file() {
            Ok(path)
        } else {
            Err(BundleError::MainExecutableNotFound(app_dir.to_path_buf()))
        }
    }

    /// Walk an application directory and classify its binaries.
    pub fn discover(&self, app_dir: impl AsRef<Path>) -> Result<DiscoveredBundle, BundleError> {
        let root = normalize_path(app_dir.as_ref());

        if !root.is_dir() {
            return Err(BundleError::NotDirectory(root));
        }

        let executable = Self::main_executable(&root)?;
        info!("main executable is {}", executable.display());

        // Directory to its CFBundleExecutable.
        let mut bundle_executables = BTreeMap::<PathBuf, Option<String>>::new();
        let mut binaries = vec![];
        let mut skipped = vec![];
        let mut nested_apps = vec![];
        let mut extensions = vec![];

        for entry in walkdir::WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry?;
            let path = entry.path();

            if entry.file_type().is_dir() {
                if path == root {
                    continue;
                }

                let has_manifest = path.join("Info.plist").is_file();

                if has_manifest && path.extension().map_or(false, |e| e == "app") {
                    debug!("found nested app {}", path.display());
                    nested_apps.push(NestedBundle::from_dir(path));
                } else if has_manifest
                    && path
                        .parent()
                        .and_then(|p| p.file_name())
                        .map_or(false, |n| n == "PlugIns")
                {
                    let extension = NestedBundle::from_dir(path);

                    if extension.executable.is_some() {
                        debug!("found extension {}", path.display());
                        extensions.push(extension);
                    } else {
                        warn!("{} has no executable; ignoring", path.display());
                    }
                }

                continue;
            }

            if !entry.file_type().is_file() || !sniff_path(path)? {
                continue;
            }

            // Anything with Mach-O magic that can't be parsed is left alone,
            // unless it is the main executable.
            if let Err(e) = MachOInfo::from_path(path) {
                if path == executable {
                    return Err(e);
                }

                warn!("{} is not a usable Mach-O ({}); not signing it", path.display(), e);
                skipped.push(path.to_path_buf());
                continue;
            }

            let eligible = if path == executable {
                true
            } else {
                let in_frameworks = path
                    .strip_prefix(&root)
                    .map_or(false, |rel| rel.components().any(|c| c.as_os_str() == "Frameworks"));

                in_frameworks || {
                    let dir = path.parent().unwrap_or(&root).to_path_buf();

                    let expected = match bundle_executables.get(&dir) {
                        Some(v) => v.clone(),
                        None => {
                            let v = manifest_string(&dir, "CFBundleExecutable");
                            bundle_executables.insert(dir, v.clone());
                            v
                        }
                    };

                    expected.as_deref() == path.file_name().and_then(|s| s.to_str())
                }
            };

            if eligible || self.all_binaries {
                binaries.push(path.to_path_buf());
            } else {
                warn!(
                    "{} is not a framework or bundle executable; not signing it",
                    path.display()
                );
                skipped.push(path.to_path_buf());
            }
        }

        warn!(
            "found {} binaries to sign in {}",
            binaries.len(),
            root.display()
        );

        let graph = DependencyGraph::build(&executable, &binaries, &MachOSource)?;

        for orphan in graph.orphans() {
            info!(
                "{} is not loaded by the main executable; signing it anyway",
                orphan.display()
            );
        }

        Ok(DiscoveredBundle {
            root,
            executable,
            binaries,
            nested_apps,
            extensions,
            skipped,
            graph,
        })
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::macho_builder::MachOBuilder,
        object::macho::{MH_BUNDLE, MH_DYLIB, MH_EXECUTE},
    };

    fn write_info_plist(dir: &Path, executable: Option<&str>, identifier: &str) {
        let mut dict = plist::Dictionary::new();
        dict.insert("CFBundleIdentifier".into(), identifier.into());
        if let Some(exe) = executable {
            dict.insert("CFBundleExecutable".into(), exe.into());
        }

        std::fs::create_dir_all(dir).unwrap();
        plist::Value::Dictionary(dict)
            .to_file_xml(dir.join("Info.plist"))
            .unwrap();
    }

    fn write_macho(path: &Path, builder: MachOBuilder) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, builder.write_macho().unwrap()).unwrap();
    }

    /// Lay out a representative application.
    fn create_app(root: &Path) -> PathBuf {
        let app = root.join("Payload").join("Demo.app");

        write_info_plist(&app, Some("Demo"), "com.example.demo");
        write_macho(
            &app.join("Demo"),
            MachOBuilder::new_aarch64(MH_EXECUTE)
                .load_dylib("/usr/lib/libSystem.B.dylib")
                .load_dylib("@rpath/Kit.framework/Kit")
                .rpath("@executable_path/Frameworks"),
        );

        let kit = app.join("Frameworks").join("Kit.framework");
        write_info_plist(&kit, Some("Kit"), "com.example.kit");
        write_macho(
            &kit.join("Kit"),
            MachOBuilder::new_aarch64(MH_DYLIB).load_dylib("@rpath/libswiftCore.dylib"),
        );
        write_macho(
            &app.join("Frameworks").join("libswiftCore.dylib"),
            MachOBuilder::new_aarch64(MH_DYLIB),
        );
        write_macho(
            &app.join("Frameworks").join("libUnused.dylib"),
            MachOBuilder::new_aarch64(MH_DYLIB),
        );

        let ext = app.join("PlugIns").join("Share.appex");
        write_info_plist(&ext, Some("Share"), "com.example.demo.share");
        write_macho(
            &ext.join("Share"),
            MachOBuilder::new_aarch64(MH_EXECUTE).load_dylib("@rpath/Kit.framework/Kit"),
        );

        let watch = app.join("Watch").join("DemoWatch.app");
        write_info_plist(&watch, Some("DemoWatch"), "com.example.demo.watchkitapp");
        write_macho(&watch.join("DemoWatch"), MachOBuilder::new_arm(MH_EXECUTE));

        // A stray Mach-O that isn't a bundle executable or framework.
        write_macho(&app.join("helper"), MachOBuilder::new_aarch64(MH_BUNDLE));

        std::fs::write(app.join("data.bin"), b"not a binary").unwrap();

        app
    }

    #[test]
    fn discover() -> Result<(), BundleError> {
        let td = tempfile::tempdir()?;
        let app = create_app(td.path());

        let bundle = BundleWalker::new().discover(&app)?;

        assert_eq!(bundle.executable, app.join("Demo"));
        assert_eq!(bundle.skipped, vec![app.join("helper")]);
        assert_eq!(
            bundle.binaries,
            vec![
                app.join("Demo"),
                app.join("Frameworks/Kit.framework/Kit"),
                app.join("Frameworks/libUnused.dylib"),
                app.join("Frameworks/libswiftCore.dylib"),
                app.join("PlugIns/Share.appex/Share"),
                app.join("Watch/DemoWatch.app/DemoWatch"),
            ]
        );
        assert_eq!(bundle.libraries().count(), 5);

        assert_eq!(bundle.extensions.len(), 1);
        assert_eq!(
            bundle.extensions[0].identifier.as_deref(),
            Some("com.example.demo.share")
        );
        assert_eq!(bundle.nested_apps.len(), 1);
        assert_eq!(bundle.nested_apps[0].root, app.join("Watch/DemoWatch.app"));

        assert_eq!(
            bundle.reachable_libraries(),
            vec![
                app.join("Frameworks/Kit.framework/Kit"),
                app.join("Frameworks/libswiftCore.dylib"),
            ]
        );
        assert_eq!(
            bundle.orphaned_libraries(),
            vec![
                app.join("Frameworks/libUnused.dylib"),
                app.join("PlugIns/Share.appex/Share"),
                app.join("Watch/DemoWatch.app/DemoWatch"),
            ]
        );

        assert_eq!(
            bundle.bundle_for_executable(&app.join("PlugIns/Share.appex/Share")),
            Some(app.join("PlugIns/Share.appex").as_path())
        );
        assert_eq!(bundle.bundle_for_executable(&app.join("Demo")), Some(app.as_path()));
        assert_eq!(
            bundle.bundle_for_executable(&app.join("Frameworks/libUnused.dylib")),
            None
        );

        Ok(())
    }

    #[test]
    fn signing_order_ends_with_main() -> Result<(), BundleError> {
        let td = tempfile::tempdir()?;
        let app = create_app(td.path());

        let bundle = BundleWalker::new().discover(&app)?;
        let order = bundle.signing_order(SigningMode::Serial)?;
        let flat = order.flatten();

        assert_eq!(flat.len(), bundle.binaries.len());
        assert_eq!(flat.last(), Some(&app.join("Demo").as_path()));

        let pos = |p: &str| flat.iter().position(|x| *x == app.join(p)).unwrap();
        assert!(pos("Frameworks/libswiftCore.dylib") < pos("Frameworks/Kit.framework/Kit"));
        assert!(pos("PlugIns/Share.appex/Share") < pos("Demo"));

        let SigningOrder::Layered(layers) = bundle.signing_order(SigningMode::Parallel)? else {
            panic!("expected layers");
        };
        assert_eq!(layers.last(), Some(&vec![app.join("Demo")]));

        Ok(())
    }

    #[test]
    fn all_binaries() -> Result<(), BundleError> {
        let td = tempfile::tempdir()?;
        let app = create_app(td.path());

        let bundle = BundleWalker::new().all_binaries(true).discover(&app)?;

        assert!(bundle.skipped.is_empty());
        assert!(bundle.binaries.contains(&app.join("helper")));
        assert!(bundle.orphaned_libraries().contains(&app.join("helper")));

        Ok(())
    }

    #[test]
    fn main_executable_fallback() -> Result<(), BundleError> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("Fallback.app");
        write_info_plist(&app, None, "com.example.fallback");
        write_macho(&app.join("Fallback"), MachOBuilder::new_aarch64(MH_EXECUTE));

        assert_eq!(BundleWalker::main_executable(&app)?, app.join("Fallback"));

        let bundle = BundleWalker::new().discover(&app)?;
        assert_eq!(bundle.binaries, vec![app.join("Fallback")]);

        Ok(())
    }

    #[test]
    fn unreadable_manifests() -> Result<(), BundleError> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("Demo.app");
        std::fs::create_dir_all(&app)?;
        std::fs::write(app.join("Info.plist"), b"garbage not a plist")?;
        write_macho(&app.join("Demo"), MachOBuilder::new_aarch64(MH_EXECUTE));

        assert_eq!(BundleWalker::main_executable(&app)?, app.join("Demo"));

        // A corrupt nested manifest doesn't stop discovery either.
        let ext = app.join("PlugIns/Share.appex");
        std::fs::create_dir_all(&ext)?;
        std::fs::write(ext.join("Info.plist"), b"<plist><dict>")?;
        write_macho(&ext.join("Share"), MachOBuilder::new_aarch64(MH_EXECUTE));

        let bundle = BundleWalker::new().discover(&app)?;
        assert_eq!(bundle.executable, app.join("Demo"));
        assert!(bundle.extensions.is_empty());
        assert_eq!(bundle.binaries, vec![app.join("Demo")]);
        assert_eq!(bundle.skipped, vec![ext.join("Share")]);

        Ok(())
    }

    #[test]
    fn unparseable_binaries_skipped() -> Result<(), BundleError> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("Demo.app");
        write_info_plist(&app, Some("Demo"), "com.example.demo");
        write_macho(&app.join("Demo"), MachOBuilder::new_aarch64(MH_EXECUTE));

        // Mach-O magic, but far too short.
        let mut stub = vec![0xcf, 0xfa, 0xed, 0xfe];
        stub.resize(200, 0);
        std::fs::create_dir_all(app.join("Frameworks"))?;
        std::fs::write(app.join("Frameworks/libStub.dylib"), &stub)?;

        // Java class files share the universal binary magic.
        let mut class = vec![0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00, 0x00, 0x34];
        class.resize(8192, 0x41);
        std::fs::write(app.join("Frameworks/Main.class"), &class)?;

        let bundle = BundleWalker::new().discover(&app)?;
        assert_eq!(bundle.binaries, vec![app.join("Demo")]);
        assert_eq!(
            bundle.skipped,
            vec![
                app.join("Frameworks/Main.class"),
                app.join("Frameworks/libStub.dylib"),
            ]
        );

        // A broken main executable is still an error.
        std::fs::write(app.join("Demo"), &stub)?;
        assert!(matches!(
            BundleWalker::new().discover(&app),
            Err(BundleError::Truncated(200))
        ));

        Ok(())
    }

    #[test]
    fn missing_main_executable() -> Result<(), BundleError> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("Empty.app");
        write_info_plist(&app, Some("Nope"), "com.example.empty");

        assert!(matches!(
            BundleWalker::new().discover(&app),
            Err(BundleError::MainExecutableNotFound(_))
        ));
        assert!(matches!(
            BundleWalker::new().discover(td.path().join("missing")),
            Err(BundleError::NotDirectory(_))
        ));

        Ok(())
    }
}
