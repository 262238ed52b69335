//! Synthetic image builders shared by the integration suites

#![allow(dead_code)]

use ag_core::config::LoaderConfig;
use ag_loader::pbp::PBP_MAGIC;
use ag_loader::psf::Psf;
use ag_loader::Loader;
use ag_memory::{Allocator, MemoryAccess, MemoryManager, PartitionAllocator};
use std::sync::Arc;

pub const ET_EXEC: u16 = 2;
pub const ET_SCE_PRX: u16 = 0xFFA0;
pub const EM_MIPS: u16 = 8;
pub const EM_PPC: u16 = 20;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_NOBITS: u32 = 8;
pub const SHF_WRITE: u32 = 1;
pub const SHF_ALLOC: u32 = 2;
pub const SHF_EXECINSTR: u32 = 4;

const PT_LOAD: u32 = 1;
const PT_PRX_RELOC: u32 = 0x7000_00A0;

pub struct Segment {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub memsz: u32,
}

pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub flags: u32,
    pub addr: u32,
    pub size: u32,
}

/// Minimal 32-bit little-endian ELF writer
pub struct ElfBuilder {
    pub e_type: u16,
    pub machine: u16,
    pub entry: u32,
    pub segments: Vec<Segment>,
    pub sections: Vec<Section>,
    pub relocations: Vec<(u32, u32)>,
    /// Module descriptor offset inside segment 0, stored PRX-style in its paddr
    pub prx_module_info: Option<u32>,
}

fn align(out: &mut Vec<u8>, to: usize) {
    while out.len() % to != 0 {
        out.push(0);
    }
}

fn put16(out: &mut [u8], at: usize, v: u16) {
    out[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(out: &mut [u8], at: usize, v: u32) {
    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

impl ElfBuilder {
    pub fn new(e_type: u16, entry: u32) -> Self {
        Self {
            e_type,
            machine: EM_MIPS,
            entry,
            segments: Vec::new(),
            sections: Vec::new(),
            relocations: Vec::new(),
            prx_module_info: None,
        }
    }

    pub fn segment(mut self, vaddr: u32, data: Vec<u8>, memsz: u32) -> Self {
        self.segments.push(Segment { vaddr, data, memsz });
        self
    }

    pub fn section(mut self, name: &str, sh_type: u32, flags: u32, addr: u32, size: u32) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            sh_type,
            flags,
            addr,
            size,
        });
        self
    }

    pub fn relocation(mut self, offset: u32, info: u32) -> Self {
        self.relocations.push((offset, info));
        self
    }

    pub fn module_info_at(mut self, offset: u32) -> Self {
        self.prx_module_info = Some(offset);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len() + usize::from(!self.relocations.is_empty());
        let mut out = vec![0u8; 52 + phnum * 32];

        let mut seg_offsets = Vec::new();
        for seg in &self.segments {
            align(&mut out, 16);
            seg_offsets.push(out.len() as u32);
            out.extend_from_slice(&seg.data);
        }

        align(&mut out, 16);
        let reloc_offset = out.len() as u32;
        for (offset, info) in &self.relocations {
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&info.to_le_bytes());
        }

        let mut shoff = 0u32;
        let mut shnum = 0u16;
        if !self.sections.is_empty() {
            let mut strtab = vec![0u8];
            let mut name_offsets = Vec::new();
            for section in &self.sections {
                name_offsets.push(strtab.len() as u32);
                strtab.extend_from_slice(section.name.as_bytes());
                strtab.push(0);
            }
            let strtab_name = strtab.len() as u32;
            strtab.extend_from_slice(b".shstrtab\0");

            let strtab_offset = out.len() as u32;
            out.extend_from_slice(&strtab);
            align(&mut out, 4);

            shoff = out.len() as u32;
            // Null section
            out.extend_from_slice(&[0u8; 40]);
            for (section, name) in self.sections.iter().zip(name_offsets) {
                let mut sh = [0u8; 40];
                put32(&mut sh, 0, name);
                put32(&mut sh, 4, section.sh_type);
                put32(&mut sh, 8, section.flags);
                put32(&mut sh, 12, section.addr);
                put32(&mut sh, 20, section.size);
                put32(&mut sh, 32, 4);
                out.extend_from_slice(&sh);
            }
            let mut sh = [0u8; 40];
            put32(&mut sh, 0, strtab_name);
            put32(&mut sh, 4, 3);
            put32(&mut sh, 16, strtab_offset);
            put32(&mut sh, 20, strtab.len() as u32);
            out.extend_from_slice(&sh);
            shnum = self.sections.len() as u16 + 2;
        }

        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = 1;
        out[5] = 1;
        out[6] = 1;
        put16(&mut out, 16, self.e_type);
        put16(&mut out, 18, self.machine);
        put32(&mut out, 20, 1);
        put32(&mut out, 24, self.entry);
        put32(&mut out, 28, 52);
        put32(&mut out, 32, shoff);
        put16(&mut out, 40, 52);
        put16(&mut out, 42, 32);
        put16(&mut out, 44, phnum as u16);
        put16(&mut out, 46, 40);
        put16(&mut out, 48, shnum);
        put16(&mut out, 50, shnum.saturating_sub(1));

        for (i, (seg, offset)) in self.segments.iter().zip(&seg_offsets).enumerate() {
            let at = 52 + i * 32;
            let paddr = match (i, self.prx_module_info) {
                (0, Some(info)) => offset + info,
                _ => seg.vaddr,
            };
            put32(&mut out, at, PT_LOAD);
            put32(&mut out, at + 4, *offset);
            put32(&mut out, at + 8, seg.vaddr);
            put32(&mut out, at + 12, paddr);
            put32(&mut out, at + 16, seg.data.len() as u32);
            put32(&mut out, at + 20, seg.memsz);
            put32(&mut out, at + 24, 7);
            put32(&mut out, at + 28, 16);
        }
        if !self.relocations.is_empty() {
            let at = 52 + self.segments.len() * 32;
            put32(&mut out, at, PT_PRX_RELOC);
            put32(&mut out, at + 4, reloc_offset);
            put32(&mut out, at + 16, self.relocations.len() as u32 * 8);
        }

        out
    }
}

/// 52-byte module descriptor
pub fn module_info(name: &str, ent: (u32, u32), stub: (u32, u32)) -> Vec<u8> {
    let mut data = Vec::with_capacity(52);
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&[0x01, 0x01]);
    let mut name_buf = [0u8; 28];
    name_buf[..name.len()].copy_from_slice(name.as_bytes());
    data.extend_from_slice(&name_buf);
    for word in [0, ent.0, ent.1, stub.0, stub.1] {
        data.extend_from_slice(&word.to_le_bytes());
    }
    data
}

/// Fixed-address module with at most one export and one import library.
///
/// Segment layout (offsets from `vaddr`):
/// `0x000` text, `0x080` import stubs, `0x100` descriptor, `0x140` names,
/// `0x180` export header, `0x1C0` import header, `0x200` export NIDs and
/// addresses, `0x280` import NIDs.
pub struct LinkedModule {
    pub vaddr: u32,
    pub name: String,
    pub exports: Option<(String, Vec<(u32, u32)>)>,
    pub imports: Option<(String, Vec<u32>)>,
}

impl LinkedModule {
    pub const STUB_TEXT: u32 = 0x080;
    pub const MODULE_INFO: u32 = 0x100;
    const NAMES: u32 = 0x140;
    const ENT: u32 = 0x180;
    const STUB: u32 = 0x1C0;
    const RESIDENT: u32 = 0x200;
    const IMPORT_NIDS: u32 = 0x280;
    pub const SIZE: u32 = 0x300;

    pub fn new(vaddr: u32, name: &str) -> Self {
        Self {
            vaddr,
            name: name.to_string(),
            exports: None,
            imports: None,
        }
    }

    /// Export `(nid, offset from vaddr)` pairs under `library`
    pub fn exports(mut self, library: &str, entries: &[(u32, u32)]) -> Self {
        self.exports = Some((library.to_string(), entries.to_vec()));
        self
    }

    pub fn imports(mut self, library: &str, nids: &[u32]) -> Self {
        self.imports = Some((library.to_string(), nids.to_vec()));
        self
    }

    /// Patch address of import slot `j`
    pub fn stub_addr(&self, j: u32) -> u32 {
        self.vaddr + Self::STUB_TEXT + j * 8
    }

    pub fn build(&self) -> Vec<u8> {
        let v = self.vaddr;
        let mut seg = vec![0u8; Self::SIZE as usize];

        let (ent_end, stub_end) = (
            v + Self::ENT + if self.exports.is_some() { 16 } else { 0 },
            v + Self::STUB + if self.imports.is_some() { 20 } else { 0 },
        );
        let info = module_info(&self.name, (v + Self::ENT, ent_end), (v + Self::STUB, stub_end));
        let at = Self::MODULE_INFO as usize;
        seg[at..at + info.len()].copy_from_slice(&info);

        if let Some((library, entries)) = &self.exports {
            let name_at = Self::NAMES as usize;
            seg[name_at..name_at + library.len()].copy_from_slice(library.as_bytes());

            let h = Self::ENT as usize;
            put32(&mut seg, h, v + Self::NAMES);
            put16(&mut seg, h + 4, 0x0011);
            put16(&mut seg, h + 6, 0x0001);
            seg[h + 8] = 4;
            seg[h + 9] = 0;
            put16(&mut seg, h + 10, entries.len() as u16);
            put32(&mut seg, h + 12, v + Self::RESIDENT);

            let r = Self::RESIDENT as usize;
            let n = entries.len();
            for (i, (nid, offset)) in entries.iter().enumerate() {
                put32(&mut seg, r + i * 4, *nid);
                put32(&mut seg, r + (n + i) * 4, v + offset);
            }
        }

        if let Some((library, nids)) = &self.imports {
            let name_at = Self::NAMES as usize + 0x20;
            seg[name_at..name_at + library.len()].copy_from_slice(library.as_bytes());

            let h = Self::STUB as usize;
            put32(&mut seg, h, v + Self::NAMES + 0x20);
            put16(&mut seg, h + 4, 0x0011);
            put16(&mut seg, h + 6, 0x0009);
            seg[h + 8] = 5;
            seg[h + 9] = 0;
            put16(&mut seg, h + 10, nids.len() as u16);
            put32(&mut seg, h + 12, v + Self::IMPORT_NIDS);
            put32(&mut seg, h + 16, v + Self::STUB_TEXT);

            for (i, nid) in nids.iter().enumerate() {
                put32(&mut seg, Self::IMPORT_NIDS as usize + i * 4, *nid);
            }
        }

        ElfBuilder::new(ET_EXEC, v)
            .segment(v, seg, Self::SIZE)
            .section(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, v, Self::STUB_TEXT)
            .section(".sceStub.text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, v + Self::STUB_TEXT, 0x80)
            .section(".rodata.sceModuleInfo", SHT_PROGBITS, SHF_ALLOC, v + Self::MODULE_INFO, 52)
            .build()
    }
}

/// Wrap `payload` in a PBP with `psf` as its PARAM.SFO
pub fn build_pbp(psf: &Psf, payload: &[u8]) -> Vec<u8> {
    let sfo = psf.generate();
    let sfo_off = 0x28u32;
    let data_off = sfo_off + sfo.len() as u32;

    let mut out = Vec::new();
    out.extend_from_slice(&PBP_MAGIC.to_le_bytes());
    out.extend_from_slice(&0x0001_0000u32.to_le_bytes());
    out.extend_from_slice(&sfo_off.to_le_bytes());
    for _ in 1..8 {
        out.extend_from_slice(&data_off.to_le_bytes());
    }
    out.extend_from_slice(&sfo);
    out.extend_from_slice(payload);
    out
}

pub struct Harness {
    pub mem: Arc<MemoryManager>,
    pub alloc: Arc<PartitionAllocator>,
    pub loader: Loader,
}

pub fn harness() -> Harness {
    ag_core::logging::init_for_tests();
    let mem = MemoryManager::new();
    let alloc = Arc::new(PartitionAllocator::default());
    let loader = Loader::new(
        Arc::clone(&mem) as Arc<dyn MemoryAccess>,
        Arc::clone(&alloc) as Arc<dyn Allocator>,
        LoaderConfig::default(),
    );
    Harness { mem, alloc, loader }
}
