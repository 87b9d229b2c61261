// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface with the binaries of iOS application bundles.
//!
//! An application bundle (`Foo.app`) contains a main executable and
//! frequently many more Mach-O binaries: embedded frameworks, dynamic
//! libraries, app extensions, and nested applications. Re-signing an
//! application requires signing all of them, and a library must be signed
//! before anything that loads it.
//!
//! [BundleWalker] finds the binaries of a bundle. [MachOInfo] extracts the
//! library references of each. [resolve_library] maps linker-relative
//! references to files in the bundle. [DependencyGraph] combines these into
//! a [SigningOrder]: either a serial list or layers that can each be signed
//! concurrently.

mod bundle;
pub use bundle::*;
mod dependency_graph;
pub use dependency_graph::*;
mod error;
pub use error::*;
mod macho;
pub use macho::*;
pub mod macho_builder;
mod resolver;
pub use resolver::*;
