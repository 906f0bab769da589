//! ELF application/module loader (spec.md §4.10, L9): validates a 32-bit
//! big-endian SPARC image, loads its allocatable sections, relocates
//! against the kernel symbol table and the module's own, then hands the
//! resolved entry point to the scheduler as a new task.

extern crate alloc;

pub mod types;

use alloc::string::String;
use alloc::vec::Vec;

use types::*;

use crate::error::{KernelError, KernelResult};

/// A kernel-exported symbol, queried by name (spec.md §6 "ELF input").
#[derive(Clone, Copy)]
pub struct KernelSymbol {
    pub name: &'static str,
    pub addr: u32,
}

#[derive(Clone)]
pub struct Section {
    pub name: String,
    pub addr: u32,
    pub size: u32,
}

#[derive(Clone, Copy)]
struct ModuleSymbol {
    name_offset: u32,
    value: u32,
    shndx: u16,
    sym_type: u8,
}

/// A loaded ELF image, torn down by dropping.
pub struct ElfHandle {
    pub sections: Vec<Section>,
    pub entry: u32,
    base: u32,
    owned: Vec<(*mut u8, usize)>,
    /// Module-local symbols resolved to their final runtime address,
    /// queryable via [`ElfHandle::lookup_symbol`] (spec.md §8 scenario 6).
    symbols: Vec<(String, u32)>,
}

impl ElfHandle {
    pub fn lookup_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn lookup_symbol(&self, name: &str) -> Option<u32> {
        self.symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, addr)| *addr)
    }
}

impl Drop for ElfHandle {
    fn drop(&mut self) {
        for (ptr, len) in self.owned.drain(..) {
            let layout = core::alloc::Layout::from_size_align(len.max(1), 8).unwrap();
            // SAFETY: every entry was allocated with this same layout
            // shape in `load`.
            unsafe { alloc::alloc::dealloc(ptr, layout) };
        }
    }
}

/// Allocates the backing storage a loaded module's sections live in;
/// decouples this module from the concrete page/heap allocator wiring.
pub trait SectionAllocator {
    fn alloc_aligned(&mut self, size: usize, align: usize) -> KernelResult<usize>;
}

/// A default allocator using the host global allocator, for use where no
/// concrete kmalloc/page-map wiring is required (tests, or a simple
/// no-MMU boot path).
pub struct HeapSectionAllocator;

impl SectionAllocator for HeapSectionAllocator {
    fn alloc_aligned(&mut self, size: usize, align: usize) -> KernelResult<usize> {
        let layout = core::alloc::Layout::from_size_align(size.max(1), align)
            .map_err(|_| KernelError::InvalidAddress { addr: 0 })?;
        // SAFETY: layout is non-zero sized (size.max(1)).
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(KernelError::OutOfMemory {
                requested: size,
                available: 0,
            });
        }
        Ok(ptr as usize)
    }
}

/// Validate header, load sections, relocate, and return the handle plus
/// the resolved entry. `image` is the whole ELF file; `kernel_symbols` is
/// the kernel's exported symbol table (spec.md §4.10 steps 1-5).
pub fn load(
    image: &[u8],
    kernel_symbols: &[KernelSymbol],
    allocator: &mut impl SectionAllocator,
) -> KernelResult<ElfHandle> {
    let ehdr = Ehdr::parse(image).ok_or(KernelError::InvalidAddress { addr: 0 })?;
    if ehdr.e_machine != EM_SPARC {
        return Err(KernelError::InvalidAddress { addr: 0 });
    }
    let is_rel = ehdr.e_type == EType::Rel as u16;
    if !is_rel && ehdr.e_type != EType::Exec as u16 {
        return Err(KernelError::InvalidAddress { addr: 0 });
    }

    let shdrs = read_shdrs(image, &ehdr)?;
    let shstrtab = section_bytes(image, &shdrs[ehdr.e_shstrndx as usize]);

    // Find the symbol table + its linked string table, if present.
    let symtab_idx = shdrs.iter().position(|s| s.sh_type == SHT_SYMTAB);
    let (mod_symbols, mod_strtab) = if let Some(idx) = symtab_idx {
        let strtab = section_bytes(image, &shdrs[shdrs[idx].sh_link as usize]);
        (parse_symtab(section_bytes(image, &shdrs[idx])), strtab)
    } else {
        (Vec::new(), &[][..])
    };

    let mut owned = Vec::new();
    let mut result = load_sections(image, &ehdr, &shdrs, shstrtab, allocator, &mut owned);
    let sections = match &mut result {
        Ok(sections) => core::mem::take(sections),
        Err(e) => {
            free_owned(&owned);
            return Err(*e);
        }
    };

    // Base for ET_REL is the first allocated section's runtime address.
    let base = sections.first().map(|s| s.addr).unwrap_or(ehdr.e_entry);

    if let Err(e) = apply_relocations(
        image,
        &ehdr,
        &shdrs,
        &sections,
        shstrtab,
        &mod_symbols,
        mod_strtab,
        kernel_symbols,
    ) {
        free_owned(&owned);
        return Err(e);
    }

    let symbols = resolve_symbols(&mod_symbols, mod_strtab, &shdrs, shstrtab, &sections);

    // Module entry points resolve through the same runtime-address table
    // as any other lookup: a raw `ModuleSymbol::value` is a section-local
    // offset, not a runtime address.
    let entry = if is_rel {
        lookup_resolved_symbol(&symbols, "_module_init")
            .or_else(|| lookup_resolved_symbol(&symbols, "_start"))
            .unwrap_or(ehdr.e_entry)
    } else {
        ehdr.e_entry
    };

    Ok(ElfHandle {
        sections,
        entry,
        base,
        owned,
        symbols,
    })
}

/// Resolve every `STT_FUNC`/`STT_OBJECT` module symbol to its final
/// runtime address: the runtime base of the section it belongs to, plus
/// its in-section value.
fn resolve_symbols(
    mod_symbols: &[ModuleSymbol],
    mod_strtab: &[u8],
    shdrs: &[Shdr],
    shstrtab: &[u8],
    sections: &[Section],
) -> Vec<(String, u32)> {
    let mut out = Vec::new();
    for sym in mod_symbols {
        if !matches!(sym.sym_type, STT_OBJECT | STT_FUNC) {
            continue;
        }
        let Some(shdr) = shdrs.get(sym.shndx as usize) else {
            continue;
        };
        let name = section_name(shstrtab, shdr.sh_name);
        let Some(section) = sections.iter().find(|s| s.name == name) else {
            continue;
        };
        let sym_name = section_name(mod_strtab, sym.name_offset);
        if sym_name.is_empty() {
            continue;
        }
        out.push((sym_name, section.addr + sym.value));
    }
    out
}

fn free_owned(owned: &[(*mut u8, usize)]) {
    for (ptr, len) in owned {
        let layout = core::alloc::Layout::from_size_align((*len).max(1), 8).unwrap();
        // SAFETY: each entry was allocated with this layout shape.
        unsafe { alloc::alloc::dealloc(*ptr, layout) };
    }
}

fn read_shdrs(image: &[u8], ehdr: &Ehdr) -> KernelResult<Vec<Shdr>> {
    let mut out = Vec::with_capacity(ehdr.e_shnum as usize);
    for i in 0..ehdr.e_shnum as usize {
        let off = ehdr.e_shoff as usize + i * ehdr.e_shentsize as usize;
        let end = off + Shdr::SIZE;
        if end > image.len() {
            return Err(KernelError::InvalidAddress { addr: off });
        }
        out.push(Shdr::parse(&image[off..end]));
    }
    Ok(out)
}

fn section_bytes<'a>(image: &'a [u8], shdr: &Shdr) -> &'a [u8] {
    let start = shdr.sh_offset as usize;
    let end = start + shdr.sh_size as usize;
    &image[start..end.min(image.len())]
}

fn section_name<'a>(strtab: &'a [u8], offset: u32) -> String {
    let start = offset as usize;
    let end = strtab[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(strtab.len());
    String::from_utf8_lossy(&strtab[start..end]).into_owned()
}

fn parse_symtab(bytes: &[u8]) -> Vec<ModuleSymbol> {
    bytes
        .chunks_exact(Sym::SIZE)
        .map(|c| {
            let sym = Sym::parse(c);
            ModuleSymbol {
                name_offset: sym.st_name,
                value: sym.st_value,
                shndx: sym.st_shndx,
                sym_type: sym.sym_type(),
            }
        })
        .collect()
}

fn lookup_resolved_symbol(symbols: &[(String, u32)], name: &str) -> Option<u32> {
    symbols
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, addr)| *addr)
}

fn load_sections(
    image: &[u8],
    ehdr: &Ehdr,
    shdrs: &[Shdr],
    shstrtab: &[u8],
    allocator: &mut impl SectionAllocator,
    owned: &mut Vec<(*mut u8, usize)>,
) -> KernelResult<Vec<Section>> {
    let mut sections = Vec::new();
    for shdr in shdrs {
        if shdr.sh_flags & SHF_ALLOC == 0 || shdr.sh_size == 0 {
            continue;
        }
        let align = shdr.sh_addralign.max(1) as usize;
        let runtime_addr = allocator.alloc_aligned(shdr.sh_size as usize, align)?;
        owned.push((runtime_addr as *mut u8, shdr.sh_size as usize));

        if shdr.sh_type == SHT_NOBITS {
            // SAFETY: freshly allocated region of this size.
            unsafe {
                core::ptr::write_bytes(runtime_addr as *mut u8, 0, shdr.sh_size as usize);
            }
        } else {
            let src = section_bytes(image, shdr);
            // SAFETY: dst is the freshly allocated region, src is within
            // the file image and of the same size.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    runtime_addr as *mut u8,
                    src.len(),
                );
            }
        }

        sections.push(Section {
            name: section_name(shstrtab, shdr.sh_name),
            addr: runtime_addr as u32,
            size: shdr.sh_size,
        });
    }
    Ok(sections)
}

#[allow(clippy::too_many_arguments)]
fn apply_relocations(
    image: &[u8],
    ehdr: &Ehdr,
    shdrs: &[Shdr],
    sections: &[Section],
    shstrtab: &[u8],
    mod_symbols: &[ModuleSymbol],
    mod_strtab: &[u8],
    kernel_symbols: &[KernelSymbol],
) -> KernelResult<()> {
    let section_addr_by_name = |name: &str| {
        sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.addr as usize)
    };

    for (i, shdr) in shdrs.iter().enumerate() {
        if shdr.sh_type != SHT_RELA {
            continue;
        }
        let target_shdr = &shdrs[shdr.sh_info as usize];
        let target_name = section_name(shstrtab, target_shdr.sh_name);
        let Some(target_base) = section_addr_by_name(&target_name) else {
            continue;
        };
        let _ = ehdr;
        let _ = i;

        for rela_bytes in section_bytes(image, shdr).chunks_exact(Rela::SIZE) {
            let rela = Rela::parse(rela_bytes);
            let sym = mod_symbols
                .get(rela.r_sym as usize)
                .copied()
                .ok_or(KernelError::NotFound { resource: "symbol" })?;
            let sym_name = section_name(mod_strtab, sym.name_offset);

            let resolved = kernel_symbols
                .iter()
                .find(|k| k.name == sym_name)
                .map(|k| k.addr as usize)
                .or_else(|| {
                    matches!(
                        sym.sym_type,
                        STT_OBJECT | STT_FUNC | STT_COMMON | STT_SECTION
                    )
                    .then_some(sym.value as usize)
                })
                .ok_or(KernelError::NotFound { resource: "symbol" })?;

            let reloc_type =
                RelocType::from_raw(rela.r_type).ok_or(KernelError::NotSupported {
                    operation: "relocation type",
                })?;

            let value = (resolved as i64 + rela.r_addend as i64) as u32;
            let field_addr = (target_base as u32 + rela.r_offset) as usize;
            apply_one_relocation(field_addr, reloc_type, value, field_addr as u32);
        }
    }
    Ok(())
}

fn apply_one_relocation(field_addr: usize, reloc: RelocType, value: u32, pc: u32) {
    // SAFETY: field_addr is within a section this loader just allocated
    // and owns exclusively.
    unsafe {
        match reloc {
            RelocType::None => {}
            RelocType::Rel8 | RelocType::Disp8 => {
                *(field_addr as *mut u8) = value as u8;
            }
            RelocType::Rel16 | RelocType::Disp16 => {
                let p = field_addr as *mut u8;
                let v = (value as u16).to_be_bytes();
                core::ptr::copy_nonoverlapping(v.as_ptr(), p, 2);
            }
            RelocType::Rel32 | RelocType::Disp32 | RelocType::Ua32 => {
                let p = field_addr as *mut u8;
                let v = value.to_be_bytes();
                core::ptr::copy_nonoverlapping(v.as_ptr(), p, 4);
            }
            RelocType::Hi22 => {
                let existing = read_be32(field_addr);
                let imm = (value >> 10) & 0x3fffff;
                write_be32(field_addr, (existing & !0x3fffff) | imm);
            }
            RelocType::Lo10 => {
                let existing = read_be32(field_addr);
                let imm = value & 0x3ff;
                write_be32(field_addr, (existing & !0x3ff) | imm);
            }
            RelocType::Wdisp30 => {
                let disp = (value.wrapping_sub(pc) >> 2) & 0x3fff_ffff;
                let existing = read_be32(field_addr);
                write_be32(field_addr, (existing & !0x3fff_ffff) | disp);
            }
            RelocType::Wdisp22 => {
                let disp = (value.wrapping_sub(pc) >> 2) & 0x3f_ffff;
                let existing = read_be32(field_addr);
                write_be32(field_addr, (existing & !0x3f_ffff) | disp);
            }
            RelocType::Wdisp19 => {
                let disp = (value.wrapping_sub(pc) >> 2) & 0x7_ffff;
                let existing = read_be32(field_addr);
                write_be32(field_addr, (existing & !0x7_ffff) | disp);
            }
            RelocType::Wdisp16 => {
                let disp = (value.wrapping_sub(pc) >> 2) & 0x3fff;
                let existing = read_be32(field_addr);
                write_be32(field_addr, (existing & !0x3fff) | disp);
            }
        }
    }
}

fn read_be32(addr: usize) -> u32 {
    // SAFETY: addr is a valid, 4-byte-aligned field inside an owned
    // section.
    u32::from_be(unsafe { core::ptr::read_volatile(addr as *const u32) })
}

fn write_be32(addr: usize, v: u32) {
    // SAFETY: see `read_be32`.
    unsafe { core::ptr::write_volatile(addr as *mut u32, v.to_be()) };
}


#[cfg(test)]
mod tests {
    use super::*;

    fn put_be32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    fn put_be16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Build a minimal relocatable ELF with one `.text` section containing
    /// a single `do_thing` function symbol, no relocations, so `load`
    /// plus `lookup_symbol` can be exercised end to end.
    fn build_module() -> Vec<u8> {
        let text: Vec<u8> = alloc::vec![0x01, 0x00, 0x00, 0x00]; // one SPARC-ish word
        let shstrtab: &[u8] = b"\0.text\0.symtab\0.strtab\0.shstrtab\0";
        let strtab: &[u8] = b"\0do_thing\0_module_init\0";

        // Two symbols: do_thing (FUNC, in .text, value 0), _module_init
        // (FUNC, in .text, value 0) plus the mandatory null symbol.
        let mut symtab = Vec::new();
        symtab.extend(core::iter::repeat(0u8).take(Sym::SIZE)); // null symbol
        // do_thing
        put_be32(&mut symtab, 1); // name offset into strtab
        put_be32(&mut symtab, 0); // value
        put_be32(&mut symtab, 4); // size
        symtab.push(2); // STT_FUNC
        symtab.push(0);
        put_be16(&mut symtab, 1); // shndx -> .text (section index 1)
        // _module_init
        put_be32(&mut symtab, 10);
        put_be32(&mut symtab, 0);
        put_be32(&mut symtab, 4);
        symtab.push(2);
        symtab.push(0);
        put_be16(&mut symtab, 1);

        let ehdr_size = 52usize;
        let text_off = ehdr_size;
        let symtab_off = text_off + text.len();
        let strtab_off = symtab_off + symtab.len();
        let shstrtab_off = strtab_off + strtab.len();
        let shdrs_off = shstrtab_off + shstrtab.len();

        let mut image = Vec::new();
        image.extend_from_slice(&EI_MAG);
        image.push(ELFCLASS32);
        image.push(ELFDATA2MSB);
        image.extend(core::iter::repeat(0u8).take(10)); // rest of e_ident
        put_be16(&mut image, EType::Rel as u16);
        put_be16(&mut image, EM_SPARC);
        put_be32(&mut image, 1); // e_version
        put_be32(&mut image, 0); // e_entry
        put_be32(&mut image, 0); // e_phoff
        put_be32(&mut image, shdrs_off as u32); // e_shoff
        put_be32(&mut image, 0); // e_flags
        put_be16(&mut image, ehdr_size as u16); // e_ehsize
        put_be16(&mut image, 0); // e_phentsize
        put_be16(&mut image, 0); // e_phnum
        put_be16(&mut image, Shdr::SIZE as u16); // e_shentsize
        put_be16(&mut image, 5); // e_shnum: null, .text, .symtab, .strtab, .shstrtab
        put_be16(&mut image, 4); // e_shstrndx
        assert_eq!(image.len(), ehdr_size);

        image.extend_from_slice(&text);
        image.extend_from_slice(&symtab);
        image.extend_from_slice(&strtab);
        image.extend_from_slice(&shstrtab);

        // Section headers.
        let mut shdr = |name_off: u32, ty: u32, flags: u32, off: u32, size: u32, link: u32| {
            put_be32(&mut image, name_off);
            put_be32(&mut image, ty);
            put_be32(&mut image, flags);
            put_be32(&mut image, 0); // sh_addr
            put_be32(&mut image, off);
            put_be32(&mut image, size);
            put_be32(&mut image, link);
            put_be32(&mut image, 0); // sh_info
            put_be32(&mut image, 4); // sh_addralign
            put_be32(&mut image, 0); // sh_entsize
        };
        shdr(0, 0, 0, 0, 0, 0); // null section
        shdr(1, 1, SHF_ALLOC, text_off as u32, text.len() as u32, 0); // .text
        shdr(7, SHT_SYMTAB, 0, symtab_off as u32, symtab.len() as u32, 3); // .symtab -> strtab idx 3
        shdr(15, 3, 0, strtab_off as u32, strtab.len() as u32, 0); // .strtab
        shdr(23, 3, 0, shstrtab_off as u32, shstrtab.len() as u32, 0); // .shstrtab

        image
    }

    #[test]
    fn load_resolves_module_symbol_within_text_section() {
        let image = build_module();
        let mut allocator = HeapSectionAllocator;
        let handle = load(&image, &[], &mut allocator).unwrap();
        let text = handle.lookup_section(".text").unwrap();
        let addr = handle.lookup_symbol("do_thing").unwrap();
        assert!(addr >= text.addr && addr < text.addr + text.size);
        assert_eq!(handle.entry, handle.lookup_symbol("_module_init").unwrap());
    }
}
