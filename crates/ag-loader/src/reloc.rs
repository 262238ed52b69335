//! PRX relocation
//!
//! Relocation records are `(offset, info)` word pairs. `info` packs the
//! relocation type in bits 0-7, the program header holding the target in
//! bits 8-15 and the program header the symbol is relative to in bits 16-23.

use crate::elf::{pt, sht, Elf32, Elf32Phdr};
use crate::image::RawImage;
use ag_memory::MemoryAccess;
use tracing::{debug, trace, warn};

pub const RELOC_ENTRY_SIZE: usize = 8;

/// MIPS relocation types
pub mod r_mips {
    pub const NONE: u8 = 0;
    pub const R_16: u8 = 1;
    pub const R_32: u8 = 2;
    pub const R_26: u8 = 4;
    pub const HI16: u8 = 5;
    pub const LO16: u8 = 6;
    pub const GPREL16: u8 = 7;
    /// Ends the table
    pub const STOP: u8 = 0xFF;
}

/// One decoded relocation record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    pub offset: u32,
    pub rtype: u8,
    /// Program header the offset is relative to
    pub ofs_base: u8,
    /// Program header the symbol is relative to
    pub addr_base: u8,
}

impl RelocationEntry {
    pub fn new(offset: u32, info: u32) -> Self {
        Self {
            offset,
            rtype: (info & 0xFF) as u8,
            ofs_base: ((info >> 8) & 0xFF) as u8,
            addr_base: ((info >> 16) & 0xFF) as u8,
        }
    }

    pub fn info(&self) -> u32 {
        self.rtype as u32 | (self.ofs_base as u32) << 8 | (self.addr_base as u32) << 16
    }
}

/// Decode up to `count` records starting at `offset`; a table running past
/// the end of the image is cut short
pub fn read_entries(image: &RawImage<'_>, offset: usize, count: usize) -> Vec<RelocationEntry> {
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = offset + i * RELOC_ENTRY_SIZE;
        match (image.read_u32(at), image.read_u32(at + 4)) {
            (Some(r_offset), Some(info)) => entries.push(RelocationEntry::new(r_offset, info)),
            _ => {
                warn!(
                    "Relocation table at 0x{:x} truncated after {} of {} entries",
                    offset, i, count
                );
                break;
            }
        }
    }
    entries
}

/// Applies one relocation table. HI16 state does not carry across tables.
pub struct Relocator<'m> {
    mem: &'m dyn MemoryAccess,
    phdrs: &'m [Elf32Phdr],
    base: u32,
    ahl: u32,
    deferred_hi16: Vec<u32>,
}

impl<'m> Relocator<'m> {
    pub fn new(mem: &'m dyn MemoryAccess, phdrs: &'m [Elf32Phdr], base: u32) -> Self {
        Self {
            mem,
            phdrs,
            base,
            ahl: 0,
            deferred_hi16: Vec::new(),
        }
    }

    /// Apply `entries` in order; returns how many were processed before the
    /// end of the table or a stop record
    pub fn apply_all(&mut self, entries: &[RelocationEntry]) -> usize {
        for (i, entry) in entries.iter().enumerate() {
            trace!(
                "Relocation #{} type={}, offset PH#{}, base PH#{}, offset 0x{:08x}",
                i,
                entry.rtype,
                entry.ofs_base,
                entry.addr_base,
                entry.offset
            );
            if entry.rtype == r_mips::STOP {
                warn!("Special relocation code 0xFF detected, stopping table");
                return i;
            }
            self.apply(entry);
        }
        entries.len()
    }

    fn ph_vaddr(&self, index: u8) -> Option<u32> {
        self.phdrs.get(index as usize).map(|ph| ph.p_vaddr)
    }

    /// Apply a single record
    pub fn apply(&mut self, entry: &RelocationEntry) {
        let (Some(ph_offset), Some(ph_base)) = (self.ph_vaddr(entry.ofs_base), self.ph_vaddr(entry.addr_base))
        else {
            warn!(
                "Relocation at 0x{:08x} references missing program header (PH#{}, PH#{}), skipping",
                entry.offset, entry.ofs_base, entry.addr_base
            );
            return;
        };

        let base = self.base;
        let data_addr = base.wrapping_add(entry.offset).wrapping_add(ph_offset);
        let s = base.wrapping_add(ph_base);

        let word = match self.mem.read_unaligned32(data_addr) {
            Ok(word) => word,
            Err(e) => {
                warn!("Relocation target 0x{:08x} unreadable: {}", data_addr, e);
                return;
            }
        };

        let data = match entry.rtype {
            r_mips::NONE => {
                trace!("R_MIPS_NONE addr=0x{:08x}", data_addr);
                return;
            }
            r_mips::R_16 => (word & 0xFFFF_0000) | (word.wrapping_add(s) & 0xFFFF),
            r_mips::R_32 => word.wrapping_add(s),
            r_mips::R_26 => {
                let targ26 = word & 0x03FF_FFFF;
                let result = (targ26 << 2).wrapping_add(s) >> 2;
                (word & !0x03FF_FFFF) | (result & 0x03FF_FFFF)
            }
            r_mips::HI16 => {
                self.ahl = (word & 0xFFFF) << 16;
                self.deferred_hi16.push(data_addr);
                trace!("R_MIPS_HI16 addr=0x{:08x} deferred", data_addr);
                return;
            }
            r_mips::LO16 => {
                let lo16 = word & 0xFFFF;
                self.ahl = (self.ahl & !0xFFFF) | lo16;
                let result = self.ahl.wrapping_add(s);
                self.resolve_hi16(lo16, s);
                (word & !0xFFFF) | (result & 0xFFFF)
            }
            r_mips::GPREL16 => {
                let rel16 = word & 0xFFFF;
                let gp_addr = base.wrapping_add(entry.offset);
                let gp_offset = gp_addr.wrapping_sub(base & 0xFFFF_0000);
                let result = if rel16 == 0 {
                    s.wrapping_sub(gp_addr)
                } else {
                    let addend = if rel16 & 0x8000 != 0 {
                        ((rel16 & 0x3FFF) + 0x4000) | 0xFFFF_0000
                    } else {
                        rel16
                    };
                    s.wrapping_add(gp_offset)
                        .wrapping_add(addend)
                        .wrapping_sub(gp_addr)
                } as i32;
                if !(-32768..=32768).contains(&result) {
                    warn!("Relocation overflow (R_MIPS_GPREL16) at 0x{:08x}", data_addr);
                }
                (word & !0xFFFF) | (result as u32 & 0xFFFF)
            }
            other => {
                warn!("Unhandled relocation type {} at 0x{:08x}", other, data_addr);
                return;
            }
        };

        trace!(
            "Relocation type {} addr=0x{:08x} before=0x{:08x} after=0x{:08x}",
            entry.rtype,
            data_addr,
            word,
            data
        );
        self.write(data_addr, data);
    }

    /// Patch every pending HI16 now that the matching LO16 is known
    fn resolve_hi16(&mut self, lo16: u32, s: u32) {
        for addr in std::mem::take(&mut self.deferred_hi16) {
            let Ok(word) = self.mem.read_unaligned32(addr) else {
                warn!("Deferred R_MIPS_HI16 target 0x{:08x} unreadable", addr);
                continue;
            };
            let mut result = ((word & 0xFFFF) << 16).wrapping_add(lo16).wrapping_add(s);
            if lo16 & 0x8000 != 0 {
                result = result.wrapping_sub(0x10000);
            }
            if result & 0x8000 != 0 {
                result = result.wrapping_add(0x10000);
            }
            let patched = (word & !0xFFFF) | ((result >> 16) & 0xFFFF);
            trace!("R_MIPS_HILO16 addr=0x{:08x} before=0x{:08x} after=0x{:08x}", addr, word, patched);
            self.write(addr, patched);
        }
    }

    fn write(&self, addr: u32, value: u32) {
        if let Err(e) = self.mem.write_unaligned32(addr, value) {
            warn!("Relocation write to 0x{:08x} failed: {}", addr, e);
        }
    }
}

/// Locate the relocation tables of `elf` and apply them at `base`.
///
/// The first relocation program header wins; without one, every PRX
/// relocation section is applied. Returns the number of records processed.
pub fn relocate(mem: &dyn MemoryAccess, image: &RawImage<'_>, elf: &Elf32, base: u32) -> usize {
    for (i, ph) in elf.phdrs.iter().enumerate() {
        match ph.p_type {
            pt::PRX_RELOC => {
                let count = ph.p_filesz as usize / RELOC_ENTRY_SIZE;
                debug!("PH#{}: relocating {} entries", i, count);
                let entries = read_entries(image, ph.p_offset as usize, count);
                return Relocator::new(mem, &elf.phdrs, base).apply_all(&entries);
            }
            pt::PRX_RELOC2 => warn!("Unimplemented: PH#{}: relocate type 0x700000A1", i),
            _ => {}
        }
    }

    let mut processed = 0;
    for shdr in &elf.shdrs {
        match shdr.sh_type {
            sht::REL => warn!("{}: not relocating section", shdr.name),
            sht::PRXREL => {
                let count = shdr.sh_size as usize / RELOC_ENTRY_SIZE;
                debug!("{}: relocating {} entries", shdr.name, count);
                let entries = read_entries(image, shdr.sh_offset as usize, count);
                processed += Relocator::new(mem, &elf.phdrs, base).apply_all(&entries);
            }
            _ => {}
        }
    }
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::Elf32Shdr;
    use ag_memory::MemoryManager;
    use std::sync::Arc;

    const BASE: u32 = 0x0880_4000;

    fn phdrs() -> Vec<Elf32Phdr> {
        vec![
            Elf32Phdr {
                p_type: pt::LOAD,
                p_vaddr: 0,
                p_memsz: 0x1000,
                ..Default::default()
            },
            Elf32Phdr {
                p_type: pt::LOAD,
                p_vaddr: 0x1000,
                p_memsz: 0x1000,
                ..Default::default()
            },
        ]
    }

    fn entry(offset: u32, rtype: u8, ofs_base: u8, addr_base: u8) -> RelocationEntry {
        RelocationEntry {
            offset,
            rtype,
            ofs_base,
            addr_base,
        }
    }

    fn setup(words: &[(u32, u32)]) -> Arc<MemoryManager> {
        let mem = MemoryManager::new();
        for &(offset, word) in words {
            mem.write32(BASE + offset, word).unwrap();
        }
        mem
    }

    #[test]
    fn test_info_packing() {
        let e = RelocationEntry::new(0x40, 0x0001_0006);
        assert_eq!(e.rtype, r_mips::LO16);
        assert_eq!(e.ofs_base, 0);
        assert_eq!(e.addr_base, 1);
        assert_eq!(e.info(), 0x0001_0006);
    }

    #[test]
    fn test_r32_adds_symbol_base() {
        for original in [0u32, 0x1234, 0xFFFF_FFF0] {
            let mem = setup(&[(0x10, original)]);
            let ph = phdrs();
            Relocator::new(&*mem, &ph, BASE).apply(&entry(0x10, r_mips::R_32, 0, 0));
            assert_eq!(mem.read32(BASE + 0x10).unwrap(), original.wrapping_add(BASE));
        }
    }

    #[test]
    fn test_r32_relative_to_second_header() {
        let mem = setup(&[(0x1010, 0x20)]);
        let ph = phdrs();
        Relocator::new(&*mem, &ph, BASE).apply(&entry(0x10, r_mips::R_32, 1, 1));
        assert_eq!(mem.read32(BASE + 0x1010).unwrap(), 0x20 + BASE + 0x1000);
    }

    #[test]
    fn test_r16_keeps_high_half() {
        let mem = setup(&[(0x20, 0xABCD_0010)]);
        let ph = phdrs();
        Relocator::new(&*mem, &ph, BASE).apply(&entry(0x20, r_mips::R_16, 0, 0));
        assert_eq!(mem.read32(BASE + 0x20).unwrap(), 0xABCD_4010);
    }

    #[test]
    fn test_r26_jump_target() {
        // jal 0x100
        let mem = setup(&[(0x30, 0x0C00_0040)]);
        let ph = phdrs();
        Relocator::new(&*mem, &ph, BASE).apply(&entry(0x30, r_mips::R_26, 0, 0));
        assert_eq!(mem.read32(BASE + 0x30).unwrap(), 0x0C00_0040 | ((BASE >> 2) & 0x03FF_FFFF));
    }

    #[test]
    fn test_hi16_lo16_pair() {
        // lui $a0, 0x0001 ; addiu $a0, $a0, 0x2345
        let mem = setup(&[(0x00, 0x3C04_0001), (0x04, 0x2484_2345)]);
        let ph = phdrs();
        let mut relocator = Relocator::new(&*mem, &ph, BASE);
        relocator.apply_all(&[entry(0x00, r_mips::HI16, 0, 0), entry(0x04, r_mips::LO16, 0, 0)]);
        assert_eq!(mem.read32(BASE).unwrap(), 0x3C04_0881);
        assert_eq!(mem.read32(BASE + 4).unwrap(), 0x2484_6345);
    }

    #[test]
    fn test_hi16_lo16_carry() {
        let mem = setup(&[(0x00, 0x3C04_0001), (0x04, 0x2484_7000)]);
        let ph = phdrs();
        Relocator::new(&*mem, &ph, BASE)
            .apply_all(&[entry(0x00, r_mips::HI16, 0, 0), entry(0x04, r_mips::LO16, 0, 0)]);
        // Low half becomes negative, high half compensates
        assert_eq!(mem.read32(BASE + 4).unwrap(), 0x2484_B000);
        assert_eq!(mem.read32(BASE).unwrap(), 0x3C04_0882);
    }

    #[test]
    fn test_hi16_with_negative_lo16() {
        // 0x0001_0000 + (-0x8000) + S
        let mem = setup(&[(0x00, 0x3C04_0001), (0x04, 0x2484_8000)]);
        let ph = phdrs();
        Relocator::new(&*mem, &ph, BASE)
            .apply_all(&[entry(0x00, r_mips::HI16, 0, 0), entry(0x04, r_mips::LO16, 0, 0)]);
        assert_eq!(mem.read32(BASE + 4).unwrap(), 0x2484_C000);
        assert_eq!(mem.read32(BASE).unwrap(), 0x3C04_0881);

        // Negative low half that relocates to a positive one
        let mem = setup(&[(0x00, 0x3C04_0001), (0x04, 0x2484_C000)]);
        Relocator::new(&*mem, &ph, BASE)
            .apply_all(&[entry(0x00, r_mips::HI16, 0, 0), entry(0x04, r_mips::LO16, 0, 0)]);
        assert_eq!(mem.read32(BASE + 4).unwrap(), 0x2484_0000);
        assert_eq!(mem.read32(BASE).unwrap(), 0x3C04_0881);
    }

    #[test]
    fn test_multiple_hi16_share_lo16() {
        let mem = setup(&[(0x00, 0x3C04_0001), (0x08, 0x3C05_0001), (0x0C, 0x2484_0010)]);
        let ph = phdrs();
        Relocator::new(&*mem, &ph, BASE).apply_all(&[
            entry(0x00, r_mips::HI16, 0, 0),
            entry(0x08, r_mips::HI16, 0, 0),
            entry(0x0C, r_mips::LO16, 0, 0),
        ]);
        assert_eq!(mem.read32(BASE).unwrap(), 0x3C04_0881);
        assert_eq!(mem.read32(BASE + 8).unwrap(), 0x3C05_0881);
        assert_eq!(mem.read32(BASE + 0xC).unwrap(), 0x2484_4010);
    }

    #[test]
    fn test_gprel16_zero_addend() {
        let mem = setup(&[(0x40, 0x8F82_0000)]);
        let ph = phdrs();
        Relocator::new(&*mem, &ph, BASE).apply(&entry(0x40, r_mips::GPREL16, 0, 1));
        // S - GP_ADDR = (BASE + 0x1000) - (BASE + 0x40)
        assert_eq!(mem.read32(BASE + 0x40).unwrap(), 0x8F82_0FC0);
    }

    #[test]
    fn test_gprel16_positive_addend() {
        let mem = setup(&[(0x40, 0x8F82_0010)]);
        let ph = phdrs();
        Relocator::new(&*mem, &ph, BASE).apply(&entry(0x40, r_mips::GPREL16, 0, 0));
        // S + GP_OFFSET + A - GP_ADDR = BASE + (0x4040) + 0x10 - (BASE + 0x40)
        assert_eq!(mem.read32(BASE + 0x40).unwrap(), 0x8F82_4010);
    }

    #[test]
    fn test_gprel16_negative_addend() {
        let mem = setup(&[(0x40, 0x8F82_8010)]);
        let ph = phdrs();
        Relocator::new(&*mem, &ph, BASE).apply(&entry(0x40, r_mips::GPREL16, 0, 0));
        // A = ((0x8010 & 0x3FFF) + 0x4000) | 0xFFFF0000, result -0x7FF0
        assert_eq!(mem.read32(BASE + 0x40).unwrap(), 0x8F82_8010);

        let mem = setup(&[(0x40, 0x8F82_C000)]);
        Relocator::new(&*mem, &ph, BASE).apply(&entry(0x40, r_mips::GPREL16, 0, 0));
        // A = 0xFFFF4000, result -0x8000
        assert_eq!(mem.read32(BASE + 0x40).unwrap(), 0x8F82_8000);
    }

    #[test]
    fn test_stop_and_unknown() {
        let mem = setup(&[(0x00, 0x100), (0x04, 0x200), (0x08, 0x300)]);
        let ph = phdrs();
        let processed = Relocator::new(&*mem, &ph, BASE).apply_all(&[
            entry(0x00, 3, 0, 0),
            entry(0x04, r_mips::R_32, 0, 0),
            entry(0x00, r_mips::STOP, 0, 0),
            entry(0x08, r_mips::R_32, 0, 0),
        ]);
        assert_eq!(processed, 2);
        assert_eq!(mem.read32(BASE).unwrap(), 0x100);
        assert_eq!(mem.read32(BASE + 4).unwrap(), 0x200 + BASE);
        assert_eq!(mem.read32(BASE + 8).unwrap(), 0x300);
    }

    #[test]
    fn test_missing_program_header_skipped() {
        let mem = setup(&[(0x10, 0x55)]);
        let ph = phdrs();
        Relocator::new(&*mem, &ph, BASE).apply(&entry(0x10, r_mips::R_32, 0, 9));
        assert_eq!(mem.read32(BASE + 0x10).unwrap(), 0x55);
    }

    fn table(entries: &[(u32, u32)]) -> Vec<u8> {
        entries
            .iter()
            .flat_map(|&(o, i)| o.to_le_bytes().into_iter().chain(i.to_le_bytes()))
            .collect()
    }

    #[test]
    fn test_relocate_from_program_header() {
        let mem = setup(&[(0x10, 1), (0x14, 2)]);
        let data = table(&[(0x10, r_mips::R_32 as u32), (0x14, r_mips::R_32 as u32)]);
        let image = RawImage::new(&data);

        let mut ph = phdrs();
        ph.push(Elf32Phdr {
            p_type: pt::PRX_RELOC,
            p_offset: 0,
            p_filesz: data.len() as u32,
            ..Default::default()
        });
        // Ignored once a relocation program header exists
        let shdrs = vec![Elf32Shdr {
            sh_type: sht::PRXREL,
            sh_offset: 0,
            sh_size: data.len() as u32,
            ..Default::default()
        }];
        let elf = Elf32 {
            phdrs: ph,
            shdrs,
            ..Default::default()
        };

        assert_eq!(relocate(&*mem, &image, &elf, BASE), 2);
        assert_eq!(mem.read32(BASE + 0x10).unwrap(), 1 + BASE);
        assert_eq!(mem.read32(BASE + 0x14).unwrap(), 2 + BASE);
    }

    #[test]
    fn test_relocate_from_sections() {
        let mem = setup(&[(0x10, 1)]);
        let mut data = vec![0u8; 0x20];
        data.extend(table(&[(0x10, r_mips::R_32 as u32)]));
        let image = RawImage::new(&data);

        let elf = Elf32 {
            phdrs: phdrs(),
            shdrs: vec![
                Elf32Shdr {
                    sh_type: sht::REL,
                    name: ".rel.text".to_string(),
                    ..Default::default()
                },
                Elf32Shdr {
                    sh_type: sht::PRXREL,
                    sh_offset: 0x20,
                    sh_size: 8,
                    name: ".rel.sceStub.text".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(relocate(&*mem, &image, &elf, BASE), 1);
        assert_eq!(mem.read32(BASE + 0x10).unwrap(), 1 + BASE);
    }

    #[test]
    fn test_truncated_table() {
        let data = table(&[(0x10, 2), (0x14, 2)]);
        assert_eq!(read_entries(&RawImage::new(&data[..12]), 0, 2).len(), 1);
        assert_eq!(read_entries(&RawImage::new(&data), 0, 5).len(), 2);
    }
}
