// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mach-O inspection.
//!
//! Extracts the handful of facts about a binary that matter when re-signing
//! an application: which dynamic libraries it loads, whether it is encrypted
//! or bitcode-only, and what the existing code signature claims about it.

use {
    crate::error::BundleError,
    goblin::mach::{
        cputype::get_arch_name_from_types,
        load_command::{CommandVariant, LoadCommand},
        Mach, MachO, MultiArch,
    },
    log::debug,
    scroll::Pread,
    std::{io::Read, path::Path},
};

/// Inputs shorter than this cannot hold a meaningful Mach-O header and load commands.
pub const MIN_HEADER_SIZE: usize = 4096;

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xfade_0c02;
const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;

/// Offset of `identOffset` within a code directory blob.
const CODE_DIRECTORY_IDENT_OFFSET: usize = 20;

/// Whether data begins with a Mach-O or universal binary magic, in either byte order.
pub fn has_macho_magic(data: &[u8]) -> bool {
    matches!(
        data.get(0..4),
        Some(
            [0xfe, 0xed, 0xfa, 0xce]
                | [0xfe, 0xed, 0xfa, 0xcf]
                | [0xce, 0xfa, 0xed, 0xfe]
                | [0xcf, 0xfa, 0xed, 0xfe]
                | [0xca, 0xfe, 0xba, 0xbe]
                | [0xbe, 0xba, 0xfe, 0xca]
        )
    )
}

/// Whether data is too short to be a complete Mach-O.
pub fn is_truncated(data: &[u8]) -> bool {
    data.len() < MIN_HEADER_SIZE
}

/// Whether the file at a path looks like a Mach-O by sniffing its first 4 bytes.
///
/// Files shorter than 4 bytes are not Mach-O.
pub fn sniff_path(path: &Path) -> Result<bool, BundleError> {
    let mut fh = std::fs::File::open(path)?;
    let mut magic = [0u8; 4];
    let mut read = 0;

    while read < magic.len() {
        let count = fh.read(&mut magic[read..])?;
        if count == 0 {
            return Ok(false);
        }
        read += count;
    }

    Ok(has_macho_magic(&magic))
}

/// How a library is brought in by a load command.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LibraryKind {
    /// `LC_LOAD_DYLIB`.
    Load,
    /// `LC_LOAD_WEAK_DYLIB`.
    Weak,
    /// `LC_REEXPORT_DYLIB`.
    Reexport,
    /// `LC_LOAD_UPWARD_DYLIB`.
    Upward,
    /// `LC_LAZY_LOAD_DYLIB`.
    Lazy,
}

/// A library path as recorded in a load command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LibraryReference {
    pub name: String,
    pub kind: LibraryKind,
}

impl LibraryReference {
    /// Whether this references an absolute path outside the bundle.
    pub fn is_absolute(&self) -> bool {
        self.name.starts_with('/')
    }
}

/// Facts about a Mach-O binary relevant to re-signing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MachOInfo {
    /// Architecture names of every slice. A thin binary has one.
    pub architectures: Vec<String>,
    /// Dynamic library references, in load command order.
    pub libraries: Vec<LibraryReference>,
    /// `LC_RPATH` entries, in load command order.
    pub rpaths: Vec<String>,
    /// An encryption info command has a nonzero `cryptid`.
    pub encrypted: bool,
    /// Only bitcode is present; there is no machine code to run.
    pub bitcode_only: bool,
    /// Identifier from the embedded code directory, if signed.
    pub identifier: Option<String>,
    /// XML entitlements from the embedded signature, if any.
    pub entitlements: Option<String>,
}

impl MachOInfo {
    /// Inspect a binary on the filesystem.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BundleError> {
        let path = path.as_ref();

        if !std::fs::symlink_metadata(path)?.is_file() {
            return Err(BundleError::NotRegularFile(path.to_path_buf()));
        }

        let data = std::fs::read(path)?;

        Self::parse(&data).map_err(|e| match e {
            BundleError::NotMachO(_) => BundleError::NotMachO(path.display().to_string()),
            e => e,
        })
    }

    /// Inspect an in-memory binary.
    ///
    /// Universal binaries are inspected through their first slice.
    pub fn parse(data: &[u8]) -> Result<Self, BundleError> {
        if !has_macho_magic(data) {
            return Err(BundleError::NotMachO("data".into()));
        }
        if is_truncated(data) {
            return Err(BundleError::Truncated(data.len()));
        }

        match Mach::parse(data)? {
            Mach::Binary(macho) => {
                let mut info = Self::from_macho(&macho, data)?;
                info.architectures = vec![arch_name(macho.header.cputype, macho.header.cpusubtype)];

                Ok(info)
            }
            Mach::Fat(multi) => Self::from_fat(&multi, data),
        }
    }

    fn from_fat(multi: &MultiArch, data: &[u8]) -> Result<Self, BundleError> {
        let arches = multi.arches()?;
        let first = arches.first().ok_or(BundleError::EmptyFatBinary)?;

        let start = first.offset as usize;
        let end = start + first.size as usize;
        let slice = data.get(start..end).ok_or_else(|| {
            BundleError::Scroll(scroll::Error::TooBig {
                size: end,
                len: data.len(),
            })
        })?;

        debug!(
            "inspecting first of {} architectures in universal binary",
            arches.len()
        );

        let macho = MachO::parse(slice, 0)?;
        let mut info = Self::from_macho(&macho, slice)?;
        info.architectures = arches
            .iter()
            .map(|arch| arch_name(arch.cputype, arch.cpusubtype))
            .collect();

        Ok(info)
    }

    fn from_macho(macho: &MachO, data: &[u8]) -> Result<Self, BundleError> {
        let mut info = Self::default();

        for lc in &macho.load_commands {
            let (offset, kind) = match &lc.command {
                CommandVariant::LoadDylib(cmd) => (cmd.dylib.name, LibraryKind::Load),
                CommandVariant::LoadWeakDylib(cmd) => (cmd.dylib.name, LibraryKind::Weak),
                CommandVariant::ReexportDylib(cmd) => (cmd.dylib.name, LibraryKind::Reexport),
                CommandVariant::LoadUpwardDylib(cmd) => (cmd.dylib.name, LibraryKind::Upward),
                CommandVariant::LazyLoadDylib(cmd) => (cmd.dylib.name, LibraryKind::Lazy),
                CommandVariant::Rpath(cmd) => {
                    info.rpaths.push(command_string(data, lc, cmd.path)?);
                    continue;
                }
                CommandVariant::EncryptionInfo32(cmd) => {
                    info.encrypted |= cmd.cryptid != 0;
                    continue;
                }
                CommandVariant::EncryptionInfo64(cmd) => {
                    info.encrypted |= cmd.cryptid != 0;
                    continue;
                }
                CommandVariant::CodeSignature(cmd) => {
                    let start = cmd.dataoff as usize;
                    let end = start + cmd.datasize as usize;

                    if let Some(signature) = data.get(start..end) {
                        info.identifier = find_blob(signature, CSMAGIC_CODEDIRECTORY)
                            .map(code_directory_identifier)
                            .transpose()?;
                        info.entitlements = find_blob(signature, CSMAGIC_EMBEDDED_ENTITLEMENTS)
                            .map(entitlements_xml)
                            .transpose()?;
                    } else {
                        debug!("code signature extends beyond end of binary; ignoring");
                    }
                    continue;
                }
                _ => continue,
            };

            info.libraries.push(LibraryReference {
                name: command_string(data, lc, offset)?,
                kind,
            });
        }

        let mut llvm_size = 0;
        let mut text_vm_size = None;

        for segment in macho.segments.iter() {
            match segment.name()? {
                "__LLVM" => llvm_size = segment.vmsize.max(segment.filesize),
                "__TEXT" => text_vm_size = Some(segment.vmsize),
                _ => {}
            }
        }

        info.bitcode_only = llvm_size > 0 && text_vm_size == Some(0);

        Ok(info)
    }

    /// Names of referenced libraries, in load command order.
    pub fn library_names(&self) -> impl Iterator<Item = &str> {
        self.libraries.iter().map(|l| l.name.as_str())
    }
}

fn arch_name(cputype: u32, cpusubtype: u32) -> String {
    get_arch_name_from_types(cputype, cpusubtype)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("cpu-{:#x}", cputype))
}

/// Read the NUL terminated string at `offset` within a load command.
fn command_string(data: &[u8], lc: &LoadCommand, offset: u32) -> Result<String, BundleError> {
    Ok(data
        .pread::<&str>(lc.offset + offset as usize)?
        .to_string())
}

/// Locate the first blob with `magic` inside an embedded signature super blob.
fn find_blob(signature: &[u8], magic: u32) -> Option<&[u8]> {
    let super_magic = signature.pread_with::<u32>(0, scroll::BE).ok()?;
    if super_magic != CSMAGIC_EMBEDDED_SIGNATURE {
        return None;
    }

    let count = signature.pread_with::<u32>(8, scroll::BE).ok()?;

    (0..count as usize).find_map(|i| {
        let offset = signature
            .pread_with::<u32>(12 + i * 8 + 4, scroll::BE)
            .ok()? as usize;
        let blob = signature.get(offset..)?;

        if blob.pread_with::<u32>(0, scroll::BE).ok()? == magic {
            let length = blob.pread_with::<u32>(4, scroll::BE).ok()? as usize;
            blob.get(..length)
        } else {
            None
        }
    })
}

fn code_directory_identifier(blob: &[u8]) -> Result<String, BundleError> {
    let offset = blob.pread_with::<u32>(CODE_DIRECTORY_IDENT_OFFSET, scroll::BE)?;

    Ok(blob.pread::<&str>(offset as usize)?.to_string())
}

fn entitlements_xml(blob: &[u8]) -> Result<String, BundleError> {
    let xml = blob.get(8..).unwrap_or_default();

    Ok(String::from_utf8_lossy(xml).to_string())
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::macho_builder::{write_universal, MachOBuilder},
        object::macho::{MH_DYLIB, MH_EXECUTE},
    };

    #[test]
    fn magic_sniffing() {
        assert!(has_macho_magic(&[0xcf, 0xfa, 0xed, 0xfe]));
        assert!(has_macho_magic(&[0xfe, 0xed, 0xfa, 0xce, 0x00]));
        assert!(has_macho_magic(&[0xca, 0xfe, 0xba, 0xbe]));
        assert!(has_macho_magic(&[0xbe, 0xba, 0xfe, 0xca]));
        assert!(!has_macho_magic(&[0x7f, b'E', b'L', b'F']));
        assert!(!has_macho_magic(&[0xcf, 0xfa]));
    }

    #[test]
    fn truncated() {
        assert!(is_truncated(&[0xcf, 0xfa, 0xed, 0xfe]));
        assert!(is_truncated(&vec![0; MIN_HEADER_SIZE - 1]));
        assert!(!is_truncated(&vec![0; MIN_HEADER_SIZE]));

        let mut data = vec![0xcf, 0xfa, 0xed, 0xfe];
        data.resize(128, 0);
        assert!(matches!(
            MachOInfo::parse(&data),
            Err(BundleError::Truncated(128))
        ));
    }

    #[test]
    fn not_macho() {
        let data = vec![0x42; MIN_HEADER_SIZE];
        assert!(matches!(
            MachOInfo::parse(&data),
            Err(BundleError::NotMachO(_))
        ));
    }

    #[test]
    fn thin_libraries() -> Result<(), BundleError> {
        let data = MachOBuilder::new_aarch64(MH_EXECUTE)
            .load_dylib("/usr/lib/libSystem.B.dylib")
            .load_weak_dylib("@rpath/Weak.framework/Weak")
            .reexport_dylib("@executable_path/Frameworks/libRe.dylib")
            .rpath("@executable_path/Frameworks")
            .write_macho()?;

        let info = MachOInfo::parse(&data)?;

        assert_eq!(info.architectures, vec!["arm64".to_string()]);
        assert_eq!(
            info.libraries,
            vec![
                LibraryReference {
                    name: "/usr/lib/libSystem.B.dylib".into(),
                    kind: LibraryKind::Load
                },
                LibraryReference {
                    name: "@rpath/Weak.framework/Weak".into(),
                    kind: LibraryKind::Weak
                },
                LibraryReference {
                    name: "@executable_path/Frameworks/libRe.dylib".into(),
                    kind: LibraryKind::Reexport
                },
            ]
        );
        assert!(info.libraries[0].is_absolute());
        assert_eq!(info.rpaths, vec!["@executable_path/Frameworks".to_string()]);
        assert!(!info.encrypted);
        assert!(!info.bitcode_only);
        assert_eq!(info.identifier, None);

        Ok(())
    }

    #[test]
    fn fat_uses_first_slice() -> Result<(), BundleError> {
        let data = write_universal(&[
            MachOBuilder::new_aarch64(MH_EXECUTE)
                .load_dylib("X")
                .load_dylib("Y"),
            MachOBuilder::new_x86_64(MH_EXECUTE).load_dylib("Z"),
        ])?;

        let info = MachOInfo::parse(&data)?;

        assert_eq!(info.library_names().collect::<Vec<_>>(), vec!["X", "Y"]);
        assert_eq!(
            info.architectures,
            vec!["arm64".to_string(), "x86_64".to_string()]
        );

        Ok(())
    }

    #[test]
    fn thirty_two_bit() -> Result<(), BundleError> {
        let data = MachOBuilder::new_arm(MH_DYLIB)
            .load_dylib("@rpath/libA.dylib")
            .encryption(1)
            .write_macho()?;

        let info = MachOInfo::parse(&data)?;
        assert_eq!(info.library_names().collect::<Vec<_>>(), vec!["@rpath/libA.dylib"]);
        assert!(info.encrypted);

        Ok(())
    }

    #[test]
    fn encryption() -> Result<(), BundleError> {
        let plain = MachOBuilder::new_aarch64(MH_EXECUTE)
            .encryption(0)
            .write_macho()?;
        assert!(!MachOInfo::parse(&plain)?.encrypted);

        let encrypted = MachOBuilder::new_aarch64(MH_EXECUTE)
            .encryption(1)
            .write_macho()?;
        assert!(MachOInfo::parse(&encrypted)?.encrypted);

        Ok(())
    }

    #[test]
    fn bitcode_only() -> Result<(), BundleError> {
        let data = MachOBuilder::new_aarch64(MH_EXECUTE)
            .bitcode_only(vec![0x42; 64])
            .write_macho()?;
        assert!(MachOInfo::parse(&data)?.bitcode_only);

        // Bitcode alongside machine code is fine.
        let data = MachOBuilder::new_aarch64(MH_EXECUTE)
            .segment("__LLVM", vec![0x42; 64], None)
            .write_macho()?;
        assert!(!MachOInfo::parse(&data)?.bitcode_only);

        Ok(())
    }

    #[test]
    fn signature_identifier_and_entitlements() -> Result<(), BundleError> {
        let xml = "<?xml version=\"1.0\"?><plist version=\"1.0\"><dict/></plist>";
        let data = MachOBuilder::new_aarch64(MH_EXECUTE)
            .load_dylib("@rpath/libFoo.dylib")
            .code_signature("com.example.app", Some(xml))
            .write_macho()?;

        let info = MachOInfo::parse(&data)?;
        assert_eq!(info.identifier.as_deref(), Some("com.example.app"));
        assert_eq!(info.entitlements.as_deref(), Some(xml));

        Ok(())
    }

    #[test]
    fn from_path_rejects_directories() -> Result<(), BundleError> {
        let td = tempfile::tempdir()?;

        assert!(matches!(
            MachOInfo::from_path(td.path()),
            Err(BundleError::NotRegularFile(_))
        ));

        let path = td.path().join("bin");
        std::fs::write(&path, MachOBuilder::new_aarch64(MH_EXECUTE).write_macho()?)?;
        assert!(sniff_path(&path)?);
        assert_eq!(MachOInfo::from_path(&path)?.libraries, vec![]);

        let short = td.path().join("short");
        std::fs::write(&short, [0xcf, 0xfa])?;
        assert!(!sniff_path(&short)?);

        Ok(())
    }
}
