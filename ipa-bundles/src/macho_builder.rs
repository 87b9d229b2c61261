// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mach-O writing.
//!
//! Emits small but structurally valid Mach-O and universal binaries carrying
//! the load commands bundle inspection cares about: library references,
//! run paths, encryption info, and an embedded code signature. Meant for
//! generating fixtures. This is not a linker.

use {
    crate::error::BundleError,
    object::{
        endian::{BigEndian, U32, U64},
        macho::*,
        pod::bytes_of,
        AddressSize, Architecture, Endian, Endianness,
    },
};

/// Code signature super blob magic.
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
/// Code directory blob magic.
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade_0c02;
/// Embedded XML entitlements blob magic.
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;

const CSSLOT_CODEDIRECTORY: u32 = 0;
const CSSLOT_ENTITLEMENTS: u32 = 5;

/// Fixed portion of a code directory we emit. The identifier follows it.
const CODE_DIRECTORY_HEADER_SIZE: usize = 44;

/// Universal binary slices are aligned to 2^14.
const FAT_SLICE_ALIGN: u32 = 14;

fn align_usize(offset: usize, size: usize) -> usize {
    (offset + (size - 1)) & !(size - 1)
}

fn name_bytes(name: &str) -> Result<[u8; 16], BundleError> {
    let mut v = [0; 16];

    v.get_mut(..name.len())
        .ok_or_else(|| BundleError::MachOWrite(format!("segment name too long: {}", name)))?
        .copy_from_slice(name.as_bytes());

    Ok(v)
}

/// A segment to emit. Segments carry no sections.
#[derive(Clone, Debug)]
struct Segment {
    name: String,
    data: Vec<u8>,
    /// Explicit virtual size. Defaults to the file size.
    vm_size: Option<u64>,
}

/// A dynamic library load command to emit.
#[derive(Clone, Debug)]
struct LibraryCommand {
    cmd: u32,
    name: String,
}

/// Content of an embedded code signature.
#[derive(Clone, Debug)]
struct SignatureContent {
    identifier: String,
    entitlements: Option<String>,
}

impl SignatureContent {
    /// Serialize to a big-endian embedded signature super blob.
    fn to_blob(&self) -> Vec<u8> {
        let mut code_directory = vec![0u8; CODE_DIRECTORY_HEADER_SIZE];
        code_directory.extend_from_slice(self.identifier.as_bytes());
        code_directory.push(0);
        let cd_len = code_directory.len() as u32;
        code_directory[0..4].copy_from_slice(&CSMAGIC_CODEDIRECTORY.to_be_bytes());
        code_directory[4..8].copy_from_slice(&cd_len.to_be_bytes());
        // version
        code_directory[8..12].copy_from_slice(&0x20400u32.to_be_bytes());
        // hashOffset points past the identifier; there are no hashes.
        code_directory[16..20].copy_from_slice(&cd_len.to_be_bytes());
        code_directory[20..24].copy_from_slice(&(CODE_DIRECTORY_HEADER_SIZE as u32).to_be_bytes());

        let mut blobs = vec![(CSSLOT_CODEDIRECTORY, code_directory)];

        if let Some(xml) = &self.entitlements {
            let mut blob = Vec::with_capacity(8 + xml.len());
            blob.extend_from_slice(&CSMAGIC_EMBEDDED_ENTITLEMENTS.to_be_bytes());
            blob.extend_from_slice(&((8 + xml.len()) as u32).to_be_bytes());
            blob.extend_from_slice(xml.as_bytes());
            blobs.push((CSSLOT_ENTITLEMENTS, blob));
        }

        let header_len = 12 + blobs.len() * 8;
        let total = header_len + blobs.iter().map(|(_, b)| b.len()).sum::<usize>();

        let mut res = Vec::with_capacity(total);
        res.extend_from_slice(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        res.extend_from_slice(&(total as u32).to_be_bytes());
        res.extend_from_slice(&(blobs.len() as u32).to_be_bytes());

        let mut offset = header_len;
        for (slot, blob) in &blobs {
            res.extend_from_slice(&slot.to_be_bytes());
            res.extend_from_slice(&(offset as u32).to_be_bytes());
            offset += blob.len();
        }
        for (_, blob) in blobs {
            res.extend_from_slice(&blob);
        }

        res
    }
}

/// Constructor of Mach-O binaries.
#[derive(Clone, Debug)]
pub struct MachOBuilder {
    architecture: Architecture,
    endian: Endianness,
    address_size: AddressSize,
    page_size: usize,
    file_type: u32,
    /// Zero virtual size for __TEXT.
    empty_text: bool,
    /// Segments placed between __TEXT and __LINKEDIT.
    extra_segments: Vec<Segment>,
    libraries: Vec<LibraryCommand>,
    rpaths: Vec<String>,
    cryptid: Option<u32>,
    signature: Option<SignatureContent>,
}

impl MachOBuilder {
    /// Create a new instance having the specified architecture and endianness.
    pub fn new(
        architecture: Architecture,
        endianness: Endianness,
        file_type: u32,
    ) -> Result<Self, BundleError> {
        let address_size = architecture.address_size().ok_or_else(|| {
            BundleError::MachOWrite(format!("unknown address size for {:?}", architecture))
        })?;

        Ok(Self {
            architecture,
            endian: endianness,
            address_size,
            page_size: 4096,
            file_type,
            empty_text: false,
            extra_segments: vec![],
            libraries: vec![],
            rpaths: vec![],
            cryptid: None,
            signature: None,
        })
    }

    /// Create a new instance for aarch64.
    pub fn new_aarch64(file_type: u32) -> Self {
        Self {
            architecture: Architecture::Aarch64,
            endian: Endianness::Little,
            address_size: AddressSize::U64,
            page_size: 4096,
            file_type,
            empty_text: false,
            extra_segments: vec![],
            libraries: vec![],
            rpaths: vec![],
            cryptid: None,
            signature: None,
        }
    }

    /// Create a new instance for x86-64.
    pub fn new_x86_64(file_type: u32) -> Self {
        Self {
            architecture: Architecture::X86_64,
            ..Self::new_aarch64(file_type)
        }
    }

    /// Create a new instance for 32-bit ARM.
    pub fn new_arm(file_type: u32) -> Self {
        Self {
            architecture: Architecture::Arm,
            address_size: AddressSize::U32,
            ..Self::new_aarch64(file_type)
        }
    }

    /// Add an `LC_LOAD_DYLIB` command.
    pub fn load_dylib(self, name: impl ToString) -> Self {
        self.library_command(LC_LOAD_DYLIB, name)
    }

    /// Add an `LC_LOAD_WEAK_DYLIB` command.
    pub fn load_weak_dylib(self, name: impl ToString) -> Self {
        self.library_command(LC_LOAD_WEAK_DYLIB, name)
    }

    /// Add an `LC_REEXPORT_DYLIB` command.
    pub fn reexport_dylib(self, name: impl ToString) -> Self {
        self.library_command(LC_REEXPORT_DYLIB, name)
    }

    fn library_command(mut self, cmd: u32, name: impl ToString) -> Self {
        self.libraries.push(LibraryCommand {
            cmd,
            name: name.to_string(),
        });
        self
    }

    /// Add an `LC_RPATH` command.
    pub fn rpath(mut self, path: impl ToString) -> Self {
        self.rpaths.push(path.to_string());
        self
    }

    /// Emit an encryption info command with the given `cryptid`.
    pub fn encryption(mut self, cryptid: u32) -> Self {
        self.cryptid = Some(cryptid);
        self
    }

    /// Add an `__LLVM` segment holding `data` and give `__TEXT` no virtual size.
    ///
    /// This mimics a binary carrying only bitcode.
    pub fn bitcode_only(mut self, data: Vec<u8>) -> Self {
        self.empty_text = true;
        self.segment("__LLVM", data, None)
    }

    /// Add a segment between `__TEXT` and `__LINKEDIT`.
    pub fn segment(mut self, name: impl ToString, data: Vec<u8>, vm_size: Option<u64>) -> Self {
        self.extra_segments.push(Segment {
            name: name.to_string(),
            data,
            vm_size,
        });
        self
    }

    /// Embed a code signature with the given identifier and optional XML entitlements.
    pub fn code_signature(mut self, identifier: impl ToString, entitlements: Option<&str>) -> Self {
        self.signature = Some(SignatureContent {
            identifier: identifier.to_string(),
            entitlements: entitlements.map(|x| x.to_string()),
        });
        self
    }

    /// Resolve the CPU type and subtype for the configured architecture.
    pub fn cpu_type(&self) -> Result<(u32, u32), BundleError> {
        match self.architecture {
            Architecture::Arm => Ok((CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7)),
            Architecture::Aarch64 => Ok((CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL)),
            Architecture::I386 => Ok((CPU_TYPE_X86, CPU_SUBTYPE_I386_ALL)),
            Architecture::X86_64 => Ok((CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL)),
            _ => Err(BundleError::MachOWrite(format!(
                "unhandled architecture: {:?}",
                self.architecture
            ))),
        }
    }

    fn is_64(&self) -> bool {
        self.address_size == AddressSize::U64
    }

    fn mach_header(&self, number_commands: u32, size_of_commands: u32) -> Result<Vec<u8>, BundleError> {
        let endian = self.endian;
        let (cpu_type, cpu_sub_type) = self.cpu_type()?;

        if self.is_64() {
            let magic = if endian.is_big_endian() {
                MH_MAGIC_64
            } else {
                MH_CIGAM_64
            };
            let header = MachHeader64 {
                magic: U32::new(BigEndian, magic),
                cputype: U32::new(endian, cpu_type),
                cpusubtype: U32::new(endian, cpu_sub_type),
                filetype: U32::new(endian, self.file_type),
                ncmds: U32::new(endian, number_commands),
                sizeofcmds: U32::new(endian, size_of_commands),
                flags: U32::new(endian, 0),
                reserved: U32::default(),
            };

            Ok(bytes_of(&header).to_vec())
        } else {
            let magic = if endian.is_big_endian() {
                MH_MAGIC
            } else {
                MH_CIGAM
            };
            let header = MachHeader32 {
                magic: U32::new(BigEndian, magic),
                cputype: U32::new(endian, cpu_type),
                cpusubtype: U32::new(endian, cpu_sub_type),
                filetype: U32::new(endian, self.file_type),
                ncmds: U32::new(endian, number_commands),
                sizeofcmds: U32::new(endian, size_of_commands),
                flags: U32::new(endian, 0),
            };

            Ok(bytes_of(&header).to_vec())
        }
    }

    fn segment_command(
        &self,
        name: &str,
        vm_address: u64,
        vm_size: u64,
        file_offset: usize,
        file_size: usize,
    ) -> Result<Vec<u8>, BundleError> {
        let endian = self.endian;

        if self.is_64() {
            let segment = SegmentCommand64 {
                cmd: U32::new(endian, LC_SEGMENT_64),
                cmdsize: U32::new(endian, std::mem::size_of::<SegmentCommand64<Endianness>>() as u32),
                segname: name_bytes(name)?,
                vmaddr: U64::new(endian, vm_address),
                vmsize: U64::new(endian, vm_size),
                fileoff: U64::new(endian, file_offset as _),
                filesize: U64::new(endian, file_size as _),
                maxprot: U32::new(endian, 0),
                initprot: U32::new(endian, 0),
                nsects: U32::new(endian, 0),
                flags: U32::new(endian, 0),
            };

            Ok(bytes_of(&segment).to_vec())
        } else {
            let segment = SegmentCommand32 {
                cmd: U32::new(endian, LC_SEGMENT),
                cmdsize: U32::new(endian, std::mem::size_of::<SegmentCommand32<Endianness>>() as u32),
                segname: name_bytes(name)?,
                vmaddr: U32::new(endian, vm_address as _),
                vmsize: U32::new(endian, vm_size as _),
                fileoff: U32::new(endian, file_offset as _),
                filesize: U32::new(endian, file_size as _),
                maxprot: U32::new(endian, 0),
                initprot: U32::new(endian, 0),
                nsects: U32::new(endian, 0),
                flags: U32::new(endian, 0),
            };

            Ok(bytes_of(&segment).to_vec())
        }
    }

    fn segment_command_size(&self) -> usize {
        if self.is_64() {
            std::mem::size_of::<SegmentCommand64<Endianness>>()
        } else {
            std::mem::size_of::<SegmentCommand32<Endianness>>()
        }
    }

    /// Size of a command with a trailing NUL terminated string, padded to pointer size.
    fn string_command_size(&self, fixed: usize, s: &str) -> usize {
        align_usize(fixed + s.len() + 1, if self.is_64() { 8 } else { 4 })
    }

    fn string_command(&self, fixed: Vec<u8>, s: &str, size: usize) -> Vec<u8> {
        let mut data = fixed;
        data.extend_from_slice(s.as_bytes());
        data.resize(size, 0);
        data
    }

    fn library_command_data(&self, library: &LibraryCommand) -> Vec<u8> {
        let endian = self.endian;
        let fixed = std::mem::size_of::<DylibCommand<Endianness>>();
        let size = self.string_command_size(fixed, &library.name);

        let command = DylibCommand {
            cmd: U32::new(endian, library.cmd),
            cmdsize: U32::new(endian, size as u32),
            dylib: Dylib {
                name: LcStr {
                    offset: U32::new(endian, fixed as u32),
                },
                timestamp: U32::new(endian, 2),
                current_version: U32::new(endian, 0x10000),
                compatibility_version: U32::new(endian, 0x10000),
            },
        };

        self.string_command(bytes_of(&command).to_vec(), &library.name, size)
    }

    fn rpath_command_data(&self, path: &str) -> Vec<u8> {
        let endian = self.endian;
        let fixed = std::mem::size_of::<RpathCommand<Endianness>>();
        let size = self.string_command_size(fixed, path);

        let command = RpathCommand {
            cmd: U32::new(endian, LC_RPATH),
            cmdsize: U32::new(endian, size as u32),
            path: LcStr {
                offset: U32::new(endian, fixed as u32),
            },
        };

        self.string_command(bytes_of(&command).to_vec(), path, size)
    }

    fn encryption_command_data(&self, cryptid: u32, offset: usize, size: usize) -> Vec<u8> {
        let endian = self.endian;

        if self.is_64() {
            let command = EncryptionInfoCommand64 {
                cmd: U32::new(endian, LC_ENCRYPTION_INFO_64),
                cmdsize: U32::new(
                    endian,
                    std::mem::size_of::<EncryptionInfoCommand64<Endianness>>() as u32,
                ),
                cryptoff: U32::new(endian, offset as u32),
                cryptsize: U32::new(endian, size as u32),
                cryptid: U32::new(endian, cryptid),
                pad: U32::new(endian, 0),
            };
            bytes_of(&command).to_vec()
        } else {
            let command = EncryptionInfoCommand32 {
                cmd: U32::new(endian, LC_ENCRYPTION_INFO),
                cmdsize: U32::new(
                    endian,
                    std::mem::size_of::<EncryptionInfoCommand32<Endianness>>() as u32,
                ),
                cryptoff: U32::new(endian, offset as u32),
                cryptsize: U32::new(endian, size as u32),
                cryptid: U32::new(endian, cryptid),
            };
            bytes_of(&command).to_vec()
        }
    }

    fn encryption_command_size(&self) -> usize {
        if self.is_64() {
            std::mem::size_of::<EncryptionInfoCommand64<Endianness>>()
        } else {
            std::mem::size_of::<EncryptionInfoCommand32<Endianness>>()
        }
    }

    /// Write Mach-O data to a memory buffer.
    pub fn write_macho(&self) -> Result<Vec<u8>, BundleError> {
        let endian = self.endian;

        // Resolve the size of everything preceding segment data first, since
        // file offsets must be expressed in the load commands.
        let header_size = self.mach_header(0, 0)?.len();

        // __PAGEZERO, __TEXT, extras, __LINKEDIT.
        let segment_count = 3 + self.extra_segments.len();
        let mut load_command_size = segment_count * self.segment_command_size();
        let mut number_commands = segment_count;

        let library_commands = self
            .libraries
            .iter()
            .map(|l| self.library_command_data(l))
            .collect::<Vec<_>>();
        let rpath_commands = self
            .rpaths
            .iter()
            .map(|p| self.rpath_command_data(p))
            .collect::<Vec<_>>();

        for data in library_commands.iter().chain(rpath_commands.iter()) {
            number_commands += 1;
            load_command_size += data.len();
        }

        if self.cryptid.is_some() {
            number_commands += 1;
            load_command_size += self.encryption_command_size();
        }

        let signature = self.signature.as_ref().map(|s| s.to_blob());
        if signature.is_some() {
            number_commands += 1;
            load_command_size += std::mem::size_of::<LinkeditDataCommand<Endianness>>();
        }

        let load_commands_end = header_size + load_command_size;

        // __TEXT spans the header and load commands and is padded to a page.
        let text_end = align_usize(load_commands_end + 1, self.page_size);

        let start_address: u64 = if self.is_64() {
            0x1_0000_0000
        } else {
            0x4000
        };

        let mut current_offset = text_end;
        let mut current_address = start_address + text_end as u64;
        let mut extra_layout = Vec::with_capacity(self.extra_segments.len());

        for segment in &self.extra_segments {
            let vm_size = segment.vm_size.unwrap_or(segment.data.len() as u64);
            extra_layout.push((current_offset, current_address, vm_size));
            current_offset = align_usize(current_offset + segment.data.len(), self.page_size);
            current_address += align_usize(vm_size as usize, self.page_size) as u64;
        }

        let linkedit_offset = current_offset;
        let linkedit_data = signature.clone().unwrap_or_else(|| vec![0]);

        let mut buffer = Vec::with_capacity(linkedit_offset + linkedit_data.len());

        buffer.extend_from_slice(&self.mach_header(number_commands as u32, load_command_size as u32)?);
        buffer.extend_from_slice(&self.segment_command("__PAGEZERO", 0, start_address, 0, 0)?);
        buffer.extend_from_slice(&self.segment_command(
            "__TEXT",
            start_address,
            if self.empty_text { 0 } else { text_end as u64 },
            0,
            text_end,
        )?);

        for (segment, (offset, address, vm_size)) in self.extra_segments.iter().zip(&extra_layout) {
            buffer.extend_from_slice(&self.segment_command(
                &segment.name,
                *address,
                *vm_size,
                *offset,
                segment.data.len(),
            )?);
        }

        buffer.extend_from_slice(&self.segment_command(
            "__LINKEDIT",
            current_address,
            linkedit_data.len() as u64,
            linkedit_offset,
            linkedit_data.len(),
        )?);

        for data in library_commands.iter().chain(rpath_commands.iter()) {
            buffer.extend_from_slice(data);
        }

        if let Some(cryptid) = self.cryptid {
            buffer.extend_from_slice(&self.encryption_command_data(
                cryptid,
                load_commands_end,
                text_end - load_commands_end,
            ));
        }

        if let Some(signature) = &signature {
            let command = LinkeditDataCommand {
                cmd: U32::new(endian, LC_CODE_SIGNATURE),
                cmdsize: U32::new(
                    endian,
                    std::mem::size_of::<LinkeditDataCommand<Endianness>>() as u32,
                ),
                dataoff: U32::new(endian, linkedit_offset as u32),
                datasize: U32::new(endian, signature.len() as u32),
            };
            buffer.extend_from_slice(bytes_of(&command));
        }

        if buffer.len() != load_commands_end {
            return Err(BundleError::MachOWrite(format!(
                "load command size mismatch: wrote {} bytes, expected {}",
                buffer.len(),
                load_commands_end
            )));
        }

        buffer.resize(text_end, 0);

        for (segment, (offset, _, _)) in self.extra_segments.iter().zip(&extra_layout) {
            buffer.resize(*offset, 0);
            buffer.extend_from_slice(&segment.data);
        }

        buffer.resize(linkedit_offset, 0);
        buffer.extend_from_slice(&linkedit_data);

        Ok(buffer)
    }
}

/// Write a universal (fat) binary containing each builder's Mach-O in order.
pub fn write_universal(builders: &[MachOBuilder]) -> Result<Vec<u8>, BundleError> {
    let align = 1usize << FAT_SLICE_ALIGN;

    let mut slices = Vec::with_capacity(builders.len());
    for builder in builders {
        slices.push((builder.cpu_type()?, builder.write_macho()?));
    }

    let header = FatHeader {
        magic: U32::new(BigEndian, FAT_MAGIC),
        nfat_arch: U32::new(BigEndian, slices.len() as u32),
    };

    let mut buffer = bytes_of(&header).to_vec();
    let mut offset = align_usize(
        buffer.len() + slices.len() * std::mem::size_of::<FatArch32>(),
        align,
    );

    let mut placements = Vec::with_capacity(slices.len());
    for ((cpu_type, cpu_sub_type), data) in &slices {
        let arch = FatArch32 {
            cputype: U32::new(BigEndian, *cpu_type),
            cpusubtype: U32::new(BigEndian, *cpu_sub_type),
            offset: U32::new(BigEndian, offset as u32),
            size: U32::new(BigEndian, data.len() as u32),
            align: U32::new(BigEndian, FAT_SLICE_ALIGN),
        };
        buffer.extend_from_slice(bytes_of(&arch));
        placements.push(offset);
        offset = align_usize(offset + data.len(), align);
    }

    for (start, (_, data)) in placements.into_iter().zip(slices) {
        buffer.resize(start, 0);
        buffer.extend_from_slice(&data);
    }

    Ok(buffer)
}
