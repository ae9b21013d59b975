//! output chunks: every contiguous region of the output file
//!
//! Each chunk computes its final size and cross-references in
//! `update_shdr`, then emits bytes into its own slice of the output
//! buffer in `copy_buf`. After the layout pass assigns `sh_offset` and
//! `sh_addr`, headers are immutable and `copy_buf` may read any other
//! chunk's finalized header.

use crate::context::{Context, Symbol};
use crate::elf;
use crate::{align_to, BUILDID_SHARD_SIZE, GOT_SIZE, PAGE_SIZE, PLT_SIZE, SHA256_SIZE};
use object::elf::{
    DF_1_NOW, DF_1_PIE, DF_BIND_NOW, DT_DEBUG, DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_FLAGS,
    DT_FLAGS_1, DT_HASH, DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_JMPREL, DT_NEEDED, DT_NULL,
    DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ, DT_RELA, DT_RELAENT, DT_RELASZ, DT_RUNPATH, DT_STRSZ,
    DT_STRTAB, DT_SYMENT, DT_SYMTAB, DT_VERNEED, DT_VERNEEDNUM, DT_VERSYM, ELFCLASS64,
    ELFDATA2LSB, EM_X86_64, ET_DYN, ET_EXEC, EV_CURRENT, NT_GNU_BUILD_ID, PF_R, PF_W, PF_X,
    PT_DYNAMIC, PT_GNU_STACK, PT_INTERP, PT_LOAD, PT_NOTE, PT_PHDR, PT_TLS, R_X86_64_COPY,
    R_X86_64_DTPMOD64, R_X86_64_DTPOFF64, R_X86_64_GLOB_DAT, R_X86_64_IRELATIVE,
    R_X86_64_JUMP_SLOT, R_X86_64_RELATIVE, R_X86_64_TPOFF32, SHF_ALLOC, SHF_EXECINSTR, SHF_GROUP,
    SHF_MERGE, SHF_STRINGS, SHF_TLS, SHF_WRITE, SHT_DYNAMIC, SHT_DYNSYM, SHT_GNU_VERNEED,
    SHT_GNU_VERSYM, SHT_HASH, SHT_NOBITS, SHT_NOTE, SHT_PROGBITS, SHT_RELA, SHT_STRTAB,
    SHT_SYMTAB, SHT_X86_64_UNWIND, STT_GNU_IFUNC,
};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Header,
    Regular,
    Synthetic,
}

/// state common to every output chunk
#[derive(Debug, Clone)]
pub struct ChunkHeader {
    /// section name, a slot in .shstrtab
    pub name: String,
    pub shdr: elf::Shdr,
    pub kind: ChunkKind,
    /// position in the section header table
    pub shndx: u32,
    /// hint to the layout pass that a fresh page begins here
    pub starts_new_ptload: bool,
}

impl ChunkHeader {
    pub fn new(name: &str, kind: ChunkKind) -> Self {
        ChunkHeader {
            name: name.to_string(),
            shdr: elf::Shdr {
                sh_addralign: 1,
                ..Default::default()
            },
            kind,
            shndx: 0,
            starts_new_ptload: false,
        }
    }

    pub fn synthetic(name: &str, sh_type: u32, sh_flags: u64, sh_addralign: u64) -> Self {
        let mut hdr = ChunkHeader::new(name, ChunkKind::Synthetic);
        hdr.shdr.sh_type = sh_type;
        hdr.shdr.sh_flags = sh_flags;
        hdr.shdr.sh_addralign = sh_addralign;
        hdr
    }

    pub fn is_alloc(&self) -> bool {
        self.shdr.sh_flags & SHF_ALLOC as u64 != 0
    }

    pub fn is_nobits(&self) -> bool {
        self.shdr.sh_type == SHT_NOBITS
    }

    pub fn is_tls(&self) -> bool {
        self.shdr.sh_flags & SHF_TLS as u64 != 0
    }
}

/// names all chunk singletons plus the interned section instances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkId {
    Ehdr,
    Phdr,
    Shdr,
    Interp,
    BuildId,
    Output(usize),
    Merged(usize),
    EhFrame,
    Got,
    GotPlt,
    Plt,
    RelDyn,
    RelPlt,
    Dynamic,
    Dynsym,
    Dynstr,
    Hash,
    Versym,
    Verneed,
    Copyrel,
    Symtab,
    Strtab,
    Shstrtab,
}

//
// ELF header
//

pub struct OutputEhdr {
    pub hdr: ChunkHeader,
}

impl Default for OutputEhdr {
    fn default() -> Self {
        let mut hdr = ChunkHeader::new("", ChunkKind::Header);
        hdr.shdr.sh_flags = SHF_ALLOC as u64;
        hdr.shdr.sh_size = elf::EHDR_SIZE;
        hdr.shdr.sh_addralign = 8;
        OutputEhdr { hdr }
    }
}

impl OutputEhdr {
    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        let mut cur = elf::Cursor::new(buf);
        cur.write(&[0x7f, b'E', b'L', b'F']);
        cur.write_u8(ELFCLASS64 as u8);
        cur.write_u8(ELFDATA2LSB as u8);
        cur.write_u8(EV_CURRENT as u8);
        cur.write(&[0; 9]);
        let e_type = if ctx.config.pie || ctx.config.shared {
            ET_DYN
        } else {
            ET_EXEC
        };
        cur.write_u16(e_type);
        cur.write_u16(EM_X86_64);
        cur.write_u32(EV_CURRENT as u32);
        let e_entry = ctx
            .symbols
            .get(&ctx.config.entry)
            .map(|sym| ctx.sym_addr(sym))
            .unwrap_or(0);
        cur.write_u64(e_entry);
        cur.write_u64(ctx.phdr.hdr.shdr.sh_offset);
        cur.write_u64(ctx.shdr.hdr.shdr.sh_offset);
        cur.write_u32(0); // e_flags
        cur.write_u16(elf::EHDR_SIZE as u16);
        cur.write_u16(elf::PHDR_SIZE as u16);
        cur.write_u16((ctx.phdr.hdr.shdr.sh_size / elf::PHDR_SIZE) as u16);
        cur.write_u16(elf::SHDR_SIZE as u16);
        cur.write_u16((ctx.shdr.hdr.shdr.sh_size / elf::SHDR_SIZE) as u16);
        cur.write_u16(ctx.shstrtab.hdr.shndx as u16);
    }
}

//
// section header table
//

pub struct OutputShdr {
    pub hdr: ChunkHeader,
}

impl Default for OutputShdr {
    fn default() -> Self {
        let mut hdr = ChunkHeader::new("", ChunkKind::Header);
        hdr.shdr.sh_addralign = 8;
        OutputShdr { hdr }
    }
}

impl OutputShdr {
    pub fn update_shdr(ctx: &mut Context) {
        let mut size = elf::SHDR_SIZE;
        for &id in &ctx.chunks {
            if ctx.chunk_header(id).kind != ChunkKind::Header {
                size += elf::SHDR_SIZE;
            }
        }
        ctx.shdr.hdr.shdr.sh_size = size;
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        // index 0 is the reserved null record
        let mut cur = elf::Cursor::at(buf, elf::SHDR_SIZE as usize);
        for &id in &ctx.chunks {
            let hdr = ctx.chunk_header(id);
            if hdr.kind != ChunkKind::Header {
                elf::write_shdr(&mut cur, &hdr.shdr);
            }
        }
    }
}

//
// program header table
//

pub fn to_phdr_flags(hdr: &ChunkHeader) -> u32 {
    let mut ret = PF_R;
    if hdr.shdr.sh_flags & SHF_WRITE as u64 != 0 {
        ret |= PF_W;
    }
    if hdr.shdr.sh_flags & SHF_EXECINSTR as u64 != 0 {
        ret |= PF_X;
    }
    ret
}

fn is_bss(hdr: &ChunkHeader) -> bool {
    hdr.is_nobits() && !hdr.is_tls()
}

struct PhdrBuilder<'c, 'a> {
    ctx: &'c Context<'a>,
    vec: Vec<elf::Phdr>,
    load_starts: Vec<ChunkId>,
}

impl<'c, 'a> PhdrBuilder<'c, 'a> {
    fn define(&mut self, p_type: u32, p_flags: u32, min_align: u64, id: ChunkId) {
        let shdr = &self.ctx.chunk_header(id).shdr;
        self.vec.push(elf::Phdr {
            p_type,
            p_flags,
            p_offset: shdr.sh_offset,
            p_vaddr: shdr.sh_addr,
            p_paddr: shdr.sh_addr,
            p_filesz: if shdr.sh_type == SHT_NOBITS {
                0
            } else {
                shdr.sh_size
            },
            p_memsz: shdr.sh_size,
            p_align: min_align.max(shdr.sh_addralign),
        });
        if p_type == PT_LOAD {
            self.load_starts.push(id);
        }
    }

    fn append(&mut self, id: ChunkId) {
        let shdr = &self.ctx.chunk_header(id).shdr;
        let phdr = self.vec.last_mut().unwrap();
        phdr.p_align = phdr.p_align.max(shdr.sh_addralign);
        phdr.p_filesz = if shdr.sh_type == SHT_NOBITS {
            shdr.sh_offset - phdr.p_offset
        } else {
            shdr.sh_offset + shdr.sh_size - phdr.p_offset
        };
        phdr.p_memsz = shdr.sh_addr + shdr.sh_size - phdr.p_vaddr;
    }
}

/// build the program header table from the current chunk state
///
/// Pure with respect to the chunks; invoked once to size the phdr chunk
/// and once to emit it. Also reports which chunks open a PT_LOAD so the
/// layout pass can start them on a fresh page. PT_LOAD grouping stops at
/// the first non-SHF_ALLOC chunk, so the chunk order must place every
/// allocatable chunk before all non-allocatable ones.
pub fn create_phdr(ctx: &Context) -> (Vec<elf::Phdr>, Vec<ChunkId>) {
    let mut b = PhdrBuilder {
        ctx,
        vec: vec![],
        load_starts: vec![],
    };

    // PT_PHDR for the program header itself
    b.define(PT_PHDR, PF_R, 8, ChunkId::Phdr);

    // PT_INTERP
    if ctx.has_chunk(ChunkId::Interp) {
        b.define(PT_INTERP, PF_R, 1, ChunkId::Interp);
    }

    // one PT_NOTE per run of adjacent SHT_NOTE chunks with the same
    // flags and alignment
    let chunks = &ctx.chunks;
    let end = chunks.len();
    let mut i = 0;
    while i < end {
        let first = chunks[i];
        i += 1;
        let hdr = ctx.chunk_header(first);
        if hdr.shdr.sh_type != SHT_NOTE {
            continue;
        }
        let flags = to_phdr_flags(hdr);
        let alignment = hdr.shdr.sh_addralign;
        b.define(PT_NOTE, flags, alignment, first);
        while i < end {
            let hdr = ctx.chunk_header(chunks[i]);
            if hdr.shdr.sh_type != SHT_NOTE
                || to_phdr_flags(hdr) != flags
                || hdr.shdr.sh_addralign != alignment
            {
                break;
            }
            b.append(chunks[i]);
            i += 1;
        }
    }

    // PT_LOAD segments, split on flag boundaries; within a group the
    // non-BSS chunks come first, then BSS extends p_memsz only
    let mut i = 0;
    while i < end {
        let first = chunks[i];
        i += 1;
        let hdr = ctx.chunk_header(first);
        if !hdr.is_alloc() {
            break;
        }
        let flags = to_phdr_flags(hdr);
        b.define(PT_LOAD, flags, PAGE_SIZE, first);

        if !is_bss(hdr) {
            while i < end {
                let hdr = ctx.chunk_header(chunks[i]);
                if is_bss(hdr) || to_phdr_flags(hdr) != flags {
                    break;
                }
                b.append(chunks[i]);
                i += 1;
            }
        }
        while i < end {
            let hdr = ctx.chunk_header(chunks[i]);
            if !is_bss(hdr) || to_phdr_flags(hdr) != flags {
                break;
            }
            b.append(chunks[i]);
            i += 1;
        }
    }

    // PT_TLS spans the contiguous run of SHF_TLS chunks
    let mut i = 0;
    while i < end {
        let first = chunks[i];
        i += 1;
        let hdr = ctx.chunk_header(first);
        if !hdr.is_tls() {
            continue;
        }
        b.define(PT_TLS, to_phdr_flags(hdr), 1, first);
        while i < end && ctx.chunk_header(chunks[i]).is_tls() {
            b.append(chunks[i]);
            i += 1;
        }
    }

    // PT_DYNAMIC
    if ctx.has_chunk(ChunkId::Dynamic) {
        b.define(
            PT_DYNAMIC,
            PF_R | PF_W,
            ctx.dynamic.hdr.shdr.sh_addralign,
            ChunkId::Dynamic,
        );
    }

    // PT_GNU_STACK is a marker with no memory behind it; its presence
    // tells the loader to map the stack non-executable
    b.vec.push(elf::Phdr {
        p_type: PT_GNU_STACK,
        p_flags: PF_R | PF_W,
        ..Default::default()
    });

    (b.vec, b.load_starts)
}

pub struct OutputPhdr {
    pub hdr: ChunkHeader,
}

impl Default for OutputPhdr {
    fn default() -> Self {
        let mut hdr = ChunkHeader::new("", ChunkKind::Header);
        hdr.shdr.sh_flags = SHF_ALLOC as u64;
        hdr.shdr.sh_addralign = 8;
        OutputPhdr { hdr }
    }
}

impl OutputPhdr {
    pub fn update_shdr(ctx: &mut Context) {
        let (vec, load_starts) = create_phdr(ctx);
        ctx.phdr.hdr.shdr.sh_size = vec.len() as u64 * elf::PHDR_SIZE;
        for id in ctx.chunks.clone() {
            ctx.chunk_header_mut(id).starts_new_ptload = false;
        }
        for id in load_starts {
            ctx.chunk_header_mut(id).starts_new_ptload = true;
        }
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        let (vec, _) = create_phdr(ctx);
        let mut cur = elf::Cursor::new(buf);
        for phdr in &vec {
            elf::write_phdr(&mut cur, phdr);
        }
    }
}

//
// .interp
//

pub struct InterpSection {
    pub hdr: ChunkHeader,
}

impl Default for InterpSection {
    fn default() -> Self {
        InterpSection {
            hdr: ChunkHeader::synthetic(".interp", SHT_PROGBITS, SHF_ALLOC as u64, 1),
        }
    }
}

impl InterpSection {
    pub fn update_shdr(ctx: &mut Context) {
        let path = ctx.config.dynamic_linker.as_deref().unwrap_or("");
        ctx.interp.hdr.shdr.sh_size = path.len() as u64 + 1;
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        let path = ctx.config.dynamic_linker.as_deref().unwrap_or("");
        let mut cur = elf::Cursor::new(buf);
        cur.write(path.as_bytes());
        cur.write_u8(0);
    }
}

//
// .rela.dyn
//

pub struct RelDynSection {
    pub hdr: ChunkHeader,
}

impl Default for RelDynSection {
    fn default() -> Self {
        let mut hdr = ChunkHeader::synthetic(".rela.dyn", SHT_RELA, SHF_ALLOC as u64, 8);
        hdr.shdr.sh_entsize = elf::RELA_SIZE;
        RelDynSection { hdr }
    }
}

impl RelDynSection {
    pub fn update_shdr(ctx: &mut Context) {
        ctx.reldyn.hdr.shdr.sh_link = ctx.dynsym.hdr.shndx;

        let mut n = 0u64;
        for &sym in &ctx.got.got_syms {
            let s = &ctx.symbols.syms[sym];
            if s.is_imported || (ctx.is_pic() && s.is_relative()) {
                n += 1;
            }
        }
        n += ctx.got.tlsgd_syms.len() as u64 * 2;
        if ctx.got.tlsld_idx != -1 {
            n += 1;
        }
        for &sym in &ctx.got.gottpoff_syms {
            if ctx.symbols.syms[sym].is_imported {
                n += 1;
            }
        }
        n += ctx.copyrel.symbols.len() as u64;

        for file in &mut ctx.objs {
            file.reldyn_offset = n * elf::RELA_SIZE;
            n += file.num_dynrel;
        }

        ctx.reldyn.hdr.shdr.sh_size = n * elf::RELA_SIZE;
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        let mut cur = elf::Cursor::new(buf);

        for &sym in &ctx.got.got_syms {
            let s = &ctx.symbols.syms[sym];
            if s.is_imported {
                elf::write_rela(
                    &mut cur,
                    &elf::Rela {
                        r_offset: ctx.got_addr(sym),
                        r_type: R_X86_64_GLOB_DAT,
                        r_sym: s.dynsym_idx as u32,
                        r_addend: 0,
                    },
                );
            } else if ctx.is_pic() && s.is_relative() {
                elf::write_rela(
                    &mut cur,
                    &elf::Rela {
                        r_offset: ctx.got_addr(sym),
                        r_type: R_X86_64_RELATIVE,
                        r_sym: 0,
                        r_addend: ctx.sym_addr(sym) as i64,
                    },
                );
            }
        }

        for &sym in &ctx.got.tlsgd_syms {
            let dynsym_idx = ctx.symbols.syms[sym].dynsym_idx as u32;
            elf::write_rela(
                &mut cur,
                &elf::Rela {
                    r_offset: ctx.tlsgd_addr(sym),
                    r_type: R_X86_64_DTPMOD64,
                    r_sym: dynsym_idx,
                    r_addend: 0,
                },
            );
            elf::write_rela(
                &mut cur,
                &elf::Rela {
                    r_offset: ctx.tlsgd_addr(sym) + GOT_SIZE,
                    r_type: R_X86_64_DTPOFF64,
                    r_sym: dynsym_idx,
                    r_addend: 0,
                },
            );
        }

        if ctx.got.tlsld_idx != -1 {
            elf::write_rela(
                &mut cur,
                &elf::Rela {
                    r_offset: ctx.tlsld_addr(),
                    r_type: R_X86_64_DTPMOD64,
                    r_sym: 0,
                    r_addend: 0,
                },
            );
        }

        for &sym in &ctx.got.gottpoff_syms {
            let s = &ctx.symbols.syms[sym];
            if s.is_imported {
                elf::write_rela(
                    &mut cur,
                    &elf::Rela {
                        r_offset: ctx.gottpoff_addr(sym),
                        r_type: R_X86_64_TPOFF32,
                        r_sym: s.dynsym_idx as u32,
                        r_addend: 0,
                    },
                );
            }
        }

        for &sym in &ctx.copyrel.symbols {
            let s = &ctx.symbols.syms[sym];
            elf::write_rela(
                &mut cur,
                &elf::Rela {
                    r_offset: ctx.sym_addr(sym),
                    r_type: R_X86_64_COPY,
                    r_sym: s.dynsym_idx as u32,
                    r_addend: 0,
                },
            );
        }

        // per-file ranges were reserved in update_shdr
        for file in &ctx.objs {
            let mut cur = elf::Cursor::at(buf, file.reldyn_offset as usize);
            for rela in &file.dynrels {
                elf::write_rela(&mut cur, rela);
            }
        }
    }
}

//
// string tables
//

pub struct StrtabSection {
    pub hdr: ChunkHeader,
}

impl Default for StrtabSection {
    fn default() -> Self {
        StrtabSection {
            hdr: ChunkHeader::synthetic(".strtab", SHT_STRTAB, 0, 1),
        }
    }
}

impl StrtabSection {
    pub fn update_shdr(ctx: &mut Context) {
        let mut size = 1;
        for file in &mut ctx.objs {
            file.strtab_offset = size;
            size += file.strtab_size;
        }
        ctx.strtab.hdr.shdr.sh_size = size;
    }
}

pub struct ShstrtabSection {
    pub hdr: ChunkHeader,
}

impl Default for ShstrtabSection {
    fn default() -> Self {
        ShstrtabSection {
            hdr: ChunkHeader::synthetic(".shstrtab", SHT_STRTAB, 0, 1),
        }
    }
}

impl ShstrtabSection {
    pub fn update_shdr(ctx: &mut Context) {
        let mut size = 1;
        for id in ctx.chunks.clone() {
            let hdr = ctx.chunk_header_mut(id);
            if !hdr.name.is_empty() {
                hdr.shdr.sh_name = size as u32;
                size += hdr.name.len() as u64 + 1;
            }
        }
        ctx.shstrtab.hdr.shdr.sh_size = size;
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        buf[0] = 0;
        let mut cur = elf::Cursor::at(buf, 1);
        for &id in &ctx.chunks {
            let hdr = ctx.chunk_header(id);
            if !hdr.name.is_empty() {
                cur.write(hdr.name.as_bytes());
                cur.write_u8(0);
            }
        }
    }
}

pub struct DynstrSection {
    pub hdr: ChunkHeader,
    contents: Vec<String>,
}

impl Default for DynstrSection {
    fn default() -> Self {
        let mut hdr = ChunkHeader::synthetic(".dynstr", SHT_STRTAB, SHF_ALLOC as u64, 1);
        hdr.shdr.sh_size = 1;
        DynstrSection {
            hdr,
            contents: vec![],
        }
    }
}

impl DynstrSection {
    /// return the offset of `s`, appending it on first sight
    pub fn add_string(&mut self, s: &str) -> u32 {
        let mut i = 1;
        for existing in &self.contents {
            if existing == s {
                return i;
            }
            i += existing.len() as u32 + 1;
        }
        self.contents.push(s.to_string());
        self.hdr.shdr.sh_size += s.len() as u64 + 1;
        i
    }

    /// the string must have been added; missing strings are a bug
    pub fn find_string(&self, s: &str) -> u32 {
        let mut i = 1;
        for existing in &self.contents {
            if existing == s {
                return i;
            }
            i += existing.len() as u32 + 1;
        }
        panic!(".dynstr: string {s:?} was never added");
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        buf[0] = 0;
        let mut cur = elf::Cursor::at(buf, 1);
        for s in &ctx.dynstr.contents {
            cur.write(s.as_bytes());
            cur.write_u8(0);
        }
    }
}

//
// .symtab
//

pub struct SymtabSection {
    pub hdr: ChunkHeader,
}

impl Default for SymtabSection {
    fn default() -> Self {
        let mut hdr = ChunkHeader::synthetic(".symtab", SHT_SYMTAB, 0, 8);
        hdr.shdr.sh_entsize = elf::SYM_SIZE;
        SymtabSection { hdr }
    }
}

impl SymtabSection {
    pub fn update_shdr(ctx: &mut Context) {
        let mut size = elf::SYM_SIZE;
        for file in &mut ctx.objs {
            file.local_symtab_offset = size;
            size += file.local_symtab_size;
        }
        let first_global = size;
        for file in &mut ctx.objs {
            file.global_symtab_offset = size;
            size += file.global_symtab_size;
        }
        ctx.symtab.hdr.shdr.sh_size = size;
        ctx.symtab.hdr.shdr.sh_info = (first_global / elf::SYM_SIZE) as u32;
        ctx.symtab.hdr.shdr.sh_link = ctx.strtab.hdr.shndx;
    }

    /// emit .symtab and .strtab together: each file writes its symbol
    /// entries and their names into its reserved slices of both tables
    pub fn copy_buf(ctx: &Context, symtab: &mut [u8], strtab: &mut [u8]) {
        symtab[..elf::SYM_SIZE as usize].fill(0);
        strtab[0] = 0;

        let nfiles = ctx.objs.len();
        let mut ranges = Vec::with_capacity(nfiles * 2);
        for file in &ctx.objs {
            ranges.push((file.local_symtab_offset, file.local_symtab_size));
        }
        for file in &ctx.objs {
            ranges.push((file.global_symtab_offset, file.global_symtab_size));
        }
        let mut slices = elf::carve(symtab, &ranges);
        let globals = slices.split_off(nfiles);
        let locals = slices;

        let name_ranges: Vec<(u64, u64)> = ctx
            .objs
            .iter()
            .map(|file| (file.strtab_offset, file.strtab_size))
            .collect();
        let names = elf::carve(strtab, &name_ranges);

        ctx.objs
            .par_iter()
            .zip(locals)
            .zip(globals)
            .zip(names)
            .for_each(|(((file, l), g), n)| file.write_symtab(ctx, l, g, n));
    }
}

//
// .dynamic
//

pub struct DynamicSection {
    pub hdr: ChunkHeader,
}

impl Default for DynamicSection {
    fn default() -> Self {
        let mut hdr = ChunkHeader::synthetic(
            ".dynamic",
            SHT_DYNAMIC,
            (SHF_ALLOC | SHF_WRITE) as u64,
            8,
        );
        hdr.shdr.sh_entsize = elf::DYN_SIZE;
        DynamicSection { hdr }
    }
}

fn create_dynamic_section(ctx: &Context) -> Vec<u64> {
    let mut vec = vec![];
    let mut define = |tag: u32, val: u64| {
        vec.push(tag as u64);
        vec.push(val);
    };

    for dso in &ctx.dsos {
        define(DT_NEEDED, ctx.dynstr.find_string(&dso.soname) as u64);
    }

    define(DT_RUNPATH, ctx.dynstr.find_string(&ctx.config.rpaths) as u64);
    define(DT_RELA, ctx.reldyn.hdr.shdr.sh_addr);
    define(DT_RELASZ, ctx.reldyn.hdr.shdr.sh_size);
    define(DT_RELAENT, elf::RELA_SIZE);
    define(DT_JMPREL, ctx.relplt.hdr.shdr.sh_addr);
    define(DT_PLTRELSZ, ctx.relplt.hdr.shdr.sh_size);
    define(DT_PLTGOT, ctx.gotplt.hdr.shdr.sh_addr);
    define(DT_PLTREL, DT_RELA as u64);
    define(DT_SYMTAB, ctx.dynsym.hdr.shdr.sh_addr);
    define(DT_SYMENT, elf::SYM_SIZE);
    define(DT_STRTAB, ctx.dynstr.hdr.shdr.sh_addr);
    define(DT_STRSZ, ctx.dynstr.hdr.shdr.sh_size);
    define(DT_HASH, ctx.hash.hdr.shdr.sh_addr);

    let value = |name: &str| {
        ctx.symbols
            .get(name)
            .map(|sym| ctx.symbols.syms[sym].value)
            .unwrap_or(0)
    };
    let init_start = value("__init_array_start");
    let fini_start = value("__fini_array_start");
    define(DT_INIT_ARRAY, init_start);
    define(DT_INIT_ARRAYSZ, value("__init_array_end") - init_start);
    define(DT_FINI_ARRAY, fini_start);
    define(DT_FINI_ARRAYSZ, value("__fini_array_end") - fini_start);

    define(DT_VERSYM, ctx.versym.hdr.shdr.sh_addr);
    define(DT_VERNEED, ctx.verneed.hdr.shdr.sh_addr);
    define(DT_VERNEEDNUM, ctx.verneed.hdr.shdr.sh_info as u64);
    define(DT_DEBUG, 0);

    let find = |name: &str| {
        ctx.chunks
            .iter()
            .find(|&&id| ctx.chunk_header(id).name == name)
            .map(|&id| ctx.chunk_header(id).shdr.sh_addr)
    };
    if let Some(addr) = find(".init") {
        define(DT_INIT, addr);
    }
    if let Some(addr) = find(".fini") {
        define(DT_FINI, addr);
    }

    let mut flags = 0;
    let mut flags1 = 0;
    if ctx.config.pie {
        flags1 |= DF_1_PIE;
    }
    if ctx.config.z_now {
        flags |= DF_BIND_NOW;
        flags1 |= DF_1_NOW;
    }
    if flags != 0 {
        define(DT_FLAGS, flags as u64);
    }
    if flags1 != 0 {
        define(DT_FLAGS_1, flags1 as u64);
    }

    define(DT_NULL, 0);
    vec
}

impl DynamicSection {
    pub fn update_shdr(ctx: &mut Context) {
        ctx.dynamic.hdr.shdr.sh_size = create_dynamic_section(ctx).len() as u64 * 8;
        ctx.dynamic.hdr.shdr.sh_link = ctx.dynstr.hdr.shndx;
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        let mut cur = elf::Cursor::new(buf);
        for word in create_dynamic_section(ctx) {
            cur.write_u64(word);
        }
    }
}

//
// output sections
//

/// strip the per-function/per-object suffix from an input section name
pub fn get_output_name(name: &str) -> &str {
    const COMMON_NAMES: [&str; 10] = [
        ".text.",
        ".data.rel.ro.",
        ".data.",
        ".rodata.",
        ".bss.rel.ro.",
        ".bss.",
        ".init_array.",
        ".fini_array.",
        ".tbss.",
        ".tdata.",
    ];
    for s1 in COMMON_NAMES {
        let s2 = &s1[..s1.len() - 1];
        if name.starts_with(s1) || name == s2 {
            return s2;
        }
    }
    name
}

/// a concatenation of input sections with the same name, type and flags
pub struct OutputSection {
    pub hdr: ChunkHeader,
    /// InputSection ids, in layout order
    pub members: Vec<usize>,
}

impl OutputSection {
    fn new(name: &str, sh_type: u32, sh_flags: u64) -> Self {
        let mut hdr = ChunkHeader::new(name, ChunkKind::Regular);
        hdr.shdr.sh_type = sh_type;
        hdr.shdr.sh_flags = sh_flags;
        OutputSection {
            hdr,
            members: vec![],
        }
    }

    pub fn copy_buf(ctx: &Context, osec: usize, buf: &mut [u8]) {
        let sec = &ctx.output_sections[osec];
        if sec.hdr.shdr.sh_type == SHT_NOBITS {
            return;
        }

        // each member owns the span up to the next member's offset and
        // zero-fills its own trailing padding
        let n = sec.members.len();
        let mut ranges = Vec::with_capacity(n);
        for (i, &isec) in sec.members.iter().enumerate() {
            let start = ctx.input_sections[isec].offset;
            let end = if i + 1 < n {
                ctx.input_sections[sec.members[i + 1]].offset
            } else {
                sec.hdr.shdr.sh_size
            };
            ranges.push((start, end - start));
        }
        let slices = elf::carve(buf, &ranges);

        sec.members
            .par_iter()
            .zip(slices)
            .for_each(|(&isec, slice)| {
                let isec = &ctx.input_sections[isec];
                if isec.sh_type != SHT_NOBITS {
                    isec.copy_buf(ctx, slice);
                    slice[isec.sh_size as usize..].fill(0);
                }
            });
    }
}

/// interned output sections; concurrent `get_instance` calls are
/// serialized by a shared-read / exclusive-write lock
#[derive(Default)]
pub struct OutputSectionRegistry {
    instances: RwLock<Vec<OutputSection>>,
}

impl OutputSectionRegistry {
    pub fn get_instance(&self, name: &str, sh_type: u32, sh_flags: u64) -> usize {
        let sh_type = if name == ".eh_frame" && sh_type == SHT_X86_64_UNWIND {
            SHT_PROGBITS
        } else {
            sh_type
        };
        let name = get_output_name(name);
        let sh_flags = sh_flags & !(SHF_GROUP as u64);

        let find = |instances: &[OutputSection]| {
            instances.iter().position(|osec| {
                osec.hdr.name == name
                    && osec.hdr.shdr.sh_type == sh_type
                    && osec.hdr.shdr.sh_flags & !(SHF_GROUP as u64) == sh_flags
            })
        };

        // fast path under the shared lock
        {
            let instances = self.instances.read().unwrap();
            if let Some(i) = find(&instances) {
                return i;
            }
        }

        // re-check under the exclusive lock, then insert
        let mut instances = self.instances.write().unwrap();
        if let Some(i) = find(&instances) {
            return i;
        }
        instances.push(OutputSection::new(name, sh_type, sh_flags));
        instances.len() - 1
    }

    pub fn into_instances(self) -> Vec<OutputSection> {
        self.instances.into_inner().unwrap()
    }
}

//
// .got, .got.plt, .plt
//

pub struct GotSection {
    pub hdr: ChunkHeader,
    pub got_syms: Vec<usize>,
    pub tlsgd_syms: Vec<usize>,
    pub gottpoff_syms: Vec<usize>,
    pub tlsld_idx: i32,
}

impl Default for GotSection {
    fn default() -> Self {
        let mut hdr =
            ChunkHeader::synthetic(".got", SHT_PROGBITS, (SHF_ALLOC | SHF_WRITE) as u64, 8);
        hdr.shdr.sh_entsize = GOT_SIZE;
        GotSection {
            hdr,
            got_syms: vec![],
            tlsgd_syms: vec![],
            gottpoff_syms: vec![],
            tlsld_idx: -1,
        }
    }
}

impl GotSection {
    pub fn add_got_symbol(&mut self, id: usize, sym: &mut Symbol) {
        assert!(sym.got_idx == -1, "duplicate GOT slot for {}", sym.name);
        sym.got_idx = (self.hdr.shdr.sh_size / GOT_SIZE) as i32;
        self.hdr.shdr.sh_size += GOT_SIZE;
        self.got_syms.push(id);
    }

    pub fn add_gottpoff_symbol(&mut self, id: usize, sym: &mut Symbol) {
        assert!(
            sym.gottpoff_idx == -1,
            "duplicate GOTTPOFF slot for {}",
            sym.name
        );
        sym.gottpoff_idx = (self.hdr.shdr.sh_size / GOT_SIZE) as i32;
        self.hdr.shdr.sh_size += GOT_SIZE;
        self.gottpoff_syms.push(id);
    }

    pub fn add_tlsgd_symbol(&mut self, id: usize, sym: &mut Symbol) {
        assert!(sym.tlsgd_idx == -1, "duplicate TLSGD slot for {}", sym.name);
        sym.tlsgd_idx = (self.hdr.shdr.sh_size / GOT_SIZE) as i32;
        self.hdr.shdr.sh_size += GOT_SIZE * 2;
        self.tlsgd_syms.push(id);
    }

    /// the TLSLD module-id block is shared; allocating twice is a no-op
    pub fn add_tlsld(&mut self) {
        if self.tlsld_idx != -1 {
            return;
        }
        self.tlsld_idx = (self.hdr.shdr.sh_size / GOT_SIZE) as i32;
        self.hdr.shdr.sh_size += GOT_SIZE * 2;
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        // imported and TLS module entries stay zero for the loader
        buf.fill(0);

        for &sym in &ctx.got.got_syms {
            let s = &ctx.symbols.syms[sym];
            if !s.is_imported {
                let idx = s.got_idx as usize * GOT_SIZE as usize;
                buf[idx..idx + 8].copy_from_slice(&ctx.sym_addr(sym).to_le_bytes());
            }
        }

        for &sym in &ctx.got.gottpoff_syms {
            let s = &ctx.symbols.syms[sym];
            if !s.is_imported {
                let idx = s.gottpoff_idx as usize * GOT_SIZE as usize;
                let tpoff = ctx.sym_addr(sym).wrapping_sub(ctx.tls_end);
                buf[idx..idx + 8].copy_from_slice(&tpoff.to_le_bytes());
            }
        }
    }
}

pub struct GotPltSection {
    pub hdr: ChunkHeader,
}

impl Default for GotPltSection {
    fn default() -> Self {
        let mut hdr =
            ChunkHeader::synthetic(".got.plt", SHT_PROGBITS, (SHF_ALLOC | SHF_WRITE) as u64, 8);
        hdr.shdr.sh_entsize = GOT_SIZE;
        // the first three entries are reserved for the loader
        hdr.shdr.sh_size = GOT_SIZE * 3;
        GotPltSection { hdr }
    }
}

impl GotPltSection {
    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        buf.fill(0);

        let dynamic_addr = if ctx.has_chunk(ChunkId::Dynamic) {
            ctx.dynamic.hdr.shdr.sh_addr
        } else {
            0
        };
        buf[0..8].copy_from_slice(&dynamic_addr.to_le_bytes());

        // point each lazy slot at the push instruction of its PLT entry
        for &sym in &ctx.plt.symbols {
            let s = &ctx.symbols.syms[sym];
            if s.gotplt_idx != -1 {
                let idx = s.gotplt_idx as usize * GOT_SIZE as usize;
                let value = ctx.plt_addr(sym) + 6;
                buf[idx..idx + 8].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

pub struct PltSection {
    pub hdr: ChunkHeader,
    pub symbols: Vec<usize>,
}

impl Default for PltSection {
    fn default() -> Self {
        let mut hdr = ChunkHeader::synthetic(
            ".plt",
            SHT_PROGBITS,
            (SHF_ALLOC | SHF_EXECINSTR) as u64,
            16,
        );
        hdr.shdr.sh_entsize = PLT_SIZE;
        // entry 0 is the resolver trampoline
        hdr.shdr.sh_size = PLT_SIZE;
        PltSection { hdr, symbols: vec![] }
    }
}

impl PltSection {
    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        let plt_base = ctx.plt.hdr.shdr.sh_addr;
        let gotplt_base = ctx.gotplt.hdr.shdr.sh_addr;

        let plt0: [u8; 16] = [
            0xff, 0x35, 0, 0, 0, 0, // pushq GOTPLT+8(%rip)
            0xff, 0x25, 0, 0, 0, 0, // jmp *GOTPLT+16(%rip)
            0x0f, 0x1f, 0x40, 0x00, // nop
        ];
        buf[..16].copy_from_slice(&plt0);
        let disp = (gotplt_base as i64 - plt_base as i64 + 2) as u32;
        buf[2..6].copy_from_slice(&disp.to_le_bytes());
        let disp = (gotplt_base as i64 - plt_base as i64 + 4) as u32;
        buf[8..12].copy_from_slice(&disp.to_le_bytes());

        let mut relplt_idx = 0u32;

        for &sym in &ctx.plt.symbols {
            let s = &ctx.symbols.syms[sym];
            let plt_addr = ctx.plt_addr(sym);
            let ent = &mut buf[s.plt_idx as usize * PLT_SIZE as usize..][..PLT_SIZE as usize];

            if s.gotplt_idx != -1 {
                let stub: [u8; 16] = [
                    0xff, 0x25, 0, 0, 0, 0, // jmp   *foo@GOTPLT
                    0x68, 0, 0, 0, 0, // push  $index_in_relplt
                    0xe9, 0, 0, 0, 0, // jmp   PLT[0]
                ];
                ent.copy_from_slice(&stub);
                let disp = (ctx.gotplt_addr(sym) as i64 - plt_addr as i64 - 6) as u32;
                ent[2..6].copy_from_slice(&disp.to_le_bytes());
                ent[7..11].copy_from_slice(&relplt_idx.to_le_bytes());
                relplt_idx += 1;
                let disp = (plt_base as i64 - plt_addr as i64 - 16) as u32;
                ent[12..16].copy_from_slice(&disp.to_le_bytes());
            } else {
                let stub: [u8; 16] = [
                    0xff, 0x25, 0, 0, 0, 0, // jmp   *foo@GOT
                    0x66, 0x66, 0x66, 0x0f, 0x1f, 0x84, 0, 0, 0, 0, // nop
                ];
                ent.copy_from_slice(&stub);
                let disp = (ctx.got_addr(sym) as i64 - plt_addr as i64 - 6) as u32;
                ent[2..6].copy_from_slice(&disp.to_le_bytes());
            }
        }
    }
}

//
// .rela.plt
//

pub struct RelPltSection {
    pub hdr: ChunkHeader,
}

impl Default for RelPltSection {
    fn default() -> Self {
        let mut hdr = ChunkHeader::synthetic(".rela.plt", SHT_RELA, SHF_ALLOC as u64, 8);
        hdr.shdr.sh_entsize = elf::RELA_SIZE;
        RelPltSection { hdr }
    }
}

impl RelPltSection {
    pub fn update_shdr(ctx: &mut Context) {
        ctx.relplt.hdr.shdr.sh_link = ctx.dynsym.hdr.shndx;
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        let mut cur = elf::Cursor::new(buf);

        for &sym in &ctx.plt.symbols {
            let s = &ctx.symbols.syms[sym];
            if !s.has_relplt {
                continue;
            }
            assert!(s.dynsym_idx > 0, "no dynsym entry for {}", s.name);

            let mut rela = elf::Rela {
                r_offset: ctx.gotplt_addr(sym),
                r_type: R_X86_64_JUMP_SLOT,
                r_sym: s.dynsym_idx as u32,
                r_addend: 0,
            };
            if s.esym.st_type == STT_GNU_IFUNC {
                rela.r_type = R_X86_64_IRELATIVE;
                rela.r_addend = ctx.sym_addr(sym) as i64;
            }
            elf::write_rela(&mut cur, &rela);
        }
    }
}

//
// .dynsym
//

pub struct DynsymSection {
    pub hdr: ChunkHeader,
    /// (symbol, offset of its name in .dynstr), in insertion order
    /// until `sort_symbols` partitions it
    pub symbols: Vec<(usize, u32)>,
}

impl Default for DynsymSection {
    fn default() -> Self {
        let mut hdr = ChunkHeader::synthetic(".dynsym", SHT_DYNSYM, SHF_ALLOC as u64, 8);
        hdr.shdr.sh_entsize = elf::SYM_SIZE;
        DynsymSection {
            hdr,
            symbols: vec![],
        }
    }
}

impl DynsymSection {
    /// stable-partition locals before globals, then fix indices;
    /// slot 0 stays reserved
    pub fn sort_symbols(ctx: &mut Context) {
        let mut list = std::mem::take(&mut ctx.dynsym.symbols);
        list.sort_by_key(|&(sym, _)| !ctx.symbols.syms[sym].is_local());

        let num_locals = list
            .iter()
            .filter(|&&(sym, _)| ctx.symbols.syms[sym].is_local())
            .count();
        ctx.dynsym.hdr.shdr.sh_info = num_locals as u32 + 1;

        for (i, &(sym, _)) in list.iter().enumerate() {
            ctx.symbols.syms[sym].dynsym_idx = i as i32 + 1;
        }
        ctx.dynsym.symbols = list;
    }

    pub fn update_shdr(ctx: &mut Context) {
        ctx.dynsym.hdr.shdr.sh_link = ctx.dynstr.hdr.shndx;
        ctx.dynsym.hdr.shdr.sh_size = elf::SYM_SIZE * (ctx.dynsym.symbols.len() as u64 + 1);
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        buf[..elf::SYM_SIZE as usize].fill(0);

        for &(sym, name_offset) in &ctx.dynsym.symbols {
            let s = &ctx.symbols.syms[sym];
            let esym = ctx.to_elf_sym(sym, name_offset);
            let mut cur = elf::Cursor::at(buf, s.dynsym_idx as usize * elf::SYM_SIZE as usize);
            elf::write_sym(&mut cur, &esym);
        }
    }
}

//
// .hash
//

pub struct HashSection {
    pub hdr: ChunkHeader,
}

impl Default for HashSection {
    fn default() -> Self {
        let mut hdr = ChunkHeader::synthetic(".hash", SHT_HASH, SHF_ALLOC as u64, 4);
        hdr.shdr.sh_entsize = 4;
        HashSection { hdr }
    }
}

impl HashSection {
    pub fn update_shdr(ctx: &mut Context) {
        let header_size = 8;
        let num_slots = ctx.dynsym.symbols.len() as u64 + 1;
        ctx.hash.hdr.shdr.sh_size = header_size + num_slots * 8;
        ctx.hash.hdr.shdr.sh_link = ctx.dynsym.hdr.shndx;
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        buf.fill(0);

        let num_slots = ctx.dynsym.symbols.len() + 1;
        let put = |buf: &mut [u8], idx: usize, val: u32| {
            buf[idx * 4..idx * 4 + 4].copy_from_slice(&val.to_le_bytes());
        };
        let get = |buf: &[u8], idx: usize| {
            u32::from_le_bytes(buf[idx * 4..idx * 4 + 4].try_into().unwrap())
        };

        put(buf, 0, num_slots as u32); // nbucket
        put(buf, 1, num_slots as u32); // nchain

        // head-insert each symbol into its bucket's chain
        let buckets = 2;
        let chains = 2 + num_slots;
        for &(sym, _) in &ctx.dynsym.symbols {
            let s = &ctx.symbols.syms[sym];
            let i = object::elf::hash(s.name.as_bytes()) as usize % num_slots;
            let idx = s.dynsym_idx as usize;
            let head = get(buf, buckets + i);
            put(buf, chains + idx, head);
            put(buf, buckets + i, idx as u32);
        }
    }
}

//
// merged sections
//

/// one input section's contribution to a MergedSection
#[derive(Debug, Default)]
pub struct MergeableSection {
    /// offset of this member within the merged output section
    pub offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StringPiece {
    /// owning member, None if the piece was dropped by dedup
    pub isec: Option<usize>,
    pub output_offset: u64,
}

/// deduplicated SHF_MERGE|SHF_STRINGS content
pub struct MergedSection<'a> {
    pub hdr: ChunkHeader,
    pub members: Vec<MergeableSection>,
    pub map: BTreeMap<&'a [u8], StringPiece>,
}

impl<'a> MergedSection<'a> {
    fn new(name: &str, sh_type: u32, sh_flags: u64) -> Self {
        let mut hdr = ChunkHeader::new(name, ChunkKind::Synthetic);
        hdr.shdr.sh_type = sh_type;
        hdr.shdr.sh_flags = sh_flags;
        MergedSection {
            hdr,
            members: vec![],
            map: BTreeMap::new(),
        }
    }

    pub fn add_member(&mut self) -> usize {
        self.members.push(MergeableSection::default());
        self.members.len() - 1
    }

    /// intern one string piece owned by `isec` at `output_offset`
    /// within that member
    pub fn insert(&mut self, data: &'a [u8], isec: usize, output_offset: u64) {
        self.map.entry(data).or_insert(StringPiece {
            isec: Some(isec),
            output_offset,
        });
    }

    pub fn update_shdr(ctx: &mut Context, idx: usize) {
        let sec = &ctx.merged_sections[idx];
        let mut size = 0;
        for (data, piece) in &sec.map {
            if let Some(m) = piece.isec {
                size = size.max(sec.members[m].offset + piece.output_offset + data.len() as u64);
            }
        }
        ctx.merged_sections[idx].hdr.shdr.sh_size = size;
    }

    pub fn copy_buf(ctx: &Context, idx: usize, buf: &mut [u8]) {
        let sec = &ctx.merged_sections[idx];
        for (data, piece) in &sec.map {
            if let Some(m) = piece.isec {
                let off = (sec.members[m].offset + piece.output_offset) as usize;
                buf[off..off + data.len()].copy_from_slice(data);
            }
        }
    }
}

/// interned merged sections, same locking discipline as output sections
#[derive(Default)]
pub struct MergedSectionRegistry<'a> {
    instances: RwLock<Vec<MergedSection<'a>>>,
}

impl<'a> MergedSectionRegistry<'a> {
    pub fn get_instance(&self, name: &str, sh_type: u32, sh_flags: u64) -> usize {
        let name = get_output_name(name);
        let sh_flags = sh_flags & !(SHF_MERGE as u64) & !(SHF_STRINGS as u64);

        let find = |instances: &[MergedSection]| {
            instances.iter().position(|osec| {
                osec.hdr.name == name
                    && osec.hdr.shdr.sh_type == sh_type
                    && osec.hdr.shdr.sh_flags == sh_flags
            })
        };

        {
            let instances = self.instances.read().unwrap();
            if let Some(i) = find(&instances) {
                return i;
            }
        }

        let mut instances = self.instances.write().unwrap();
        if let Some(i) = find(&instances) {
            return i;
        }
        instances.push(MergedSection::new(name, sh_type, sh_flags));
        instances.len() - 1
    }

    pub fn into_instances(self) -> Vec<MergedSection<'a>> {
        self.instances.into_inner().unwrap()
    }
}

//
// .eh_frame
//

pub struct EhFrameSection {
    pub hdr: ChunkHeader,
    /// InputSection ids holding unwind records
    pub members: Vec<usize>,
    contents: Vec<Vec<u8>>,
}

impl Default for EhFrameSection {
    fn default() -> Self {
        EhFrameSection {
            hdr: ChunkHeader::synthetic(".eh_frame", SHT_PROGBITS, SHF_ALLOC as u64, 8),
            members: vec![],
            contents: vec![],
        }
    }
}

impl EhFrameSection {
    /// pre-compute per-member byte arrays; sizes must exist before the
    /// layout pass freezes offsets
    pub fn finalize_contents(ctx: &mut Context) {
        let mut contents = Vec::with_capacity(ctx.ehframe.members.len());
        for &isec in &ctx.ehframe.members {
            let isec = &ctx.input_sections[isec];
            if isec.sh_type == SHT_NOBITS || isec.sh_size == 0 {
                contents.push(vec![]);
                continue;
            }
            let mut buf = vec![0u8; isec.sh_size as usize];
            buf[..isec.data.len()].copy_from_slice(isec.data);
            contents.push(buf);
        }
        ctx.ehframe.contents = contents;
    }

    pub fn update_shdr(ctx: &mut Context) {
        ctx.ehframe.hdr.shdr.sh_size =
            ctx.ehframe.contents.iter().map(|c| c.len() as u64).sum();
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        let mut offset = 0usize;
        for (i, contents) in ctx.ehframe.contents.iter().enumerate() {
            buf[offset..offset + contents.len()].copy_from_slice(contents);
            // unwind pointers become final only now that addresses exist
            let isec = &ctx.input_sections[ctx.ehframe.members[i]];
            let base = ctx.ehframe.hdr.shdr.sh_addr + offset as u64;
            for reloc in &isec.relocs {
                crate::context::apply_reloc(
                    ctx,
                    reloc,
                    base + reloc.offset,
                    &mut buf[offset..offset + contents.len()],
                );
            }
            offset += contents.len();
        }
    }
}

//
// .bss slots for copy relocations
//

pub struct CopyrelSection {
    pub hdr: ChunkHeader,
    pub symbols: Vec<usize>,
}

impl Default for CopyrelSection {
    fn default() -> Self {
        CopyrelSection {
            hdr: ChunkHeader::synthetic(".bss", SHT_NOBITS, (SHF_ALLOC | SHF_WRITE) as u64, 32),
            symbols: vec![],
        }
    }
}

//
// symbol versioning tables, built by the resolution collaborator
//

pub struct VersymSection {
    pub hdr: ChunkHeader,
    pub contents: Vec<u16>,
}

impl Default for VersymSection {
    fn default() -> Self {
        let mut hdr = ChunkHeader::synthetic(".gnu.version", SHT_GNU_VERSYM, SHF_ALLOC as u64, 2);
        hdr.shdr.sh_entsize = 2;
        VersymSection {
            hdr,
            contents: vec![],
        }
    }
}

impl VersymSection {
    pub fn update_shdr(ctx: &mut Context) {
        ctx.versym.hdr.shdr.sh_size = ctx.versym.contents.len() as u64 * 2;
        ctx.versym.hdr.shdr.sh_link = ctx.dynsym.hdr.shndx;
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        let mut cur = elf::Cursor::new(buf);
        for &val in &ctx.versym.contents {
            cur.write_u16(val);
        }
    }
}

pub struct VerneedSection {
    pub hdr: ChunkHeader,
    pub contents: Vec<u8>,
}

impl Default for VerneedSection {
    fn default() -> Self {
        VerneedSection {
            hdr: ChunkHeader::synthetic(".gnu.version_r", SHT_GNU_VERNEED, SHF_ALLOC as u64, 8),
            contents: vec![],
        }
    }
}

impl VerneedSection {
    pub fn update_shdr(ctx: &mut Context) {
        ctx.verneed.hdr.shdr.sh_size = ctx.verneed.contents.len() as u64;
        ctx.verneed.hdr.shdr.sh_link = ctx.dynstr.hdr.shndx;
    }

    pub fn copy_buf(ctx: &Context, buf: &mut [u8]) {
        buf[..ctx.verneed.contents.len()].copy_from_slice(&ctx.verneed.contents);
    }
}

//
// .note.gnu.build-id
//

pub struct BuildIdSection {
    pub hdr: ChunkHeader,
}

impl Default for BuildIdSection {
    fn default() -> Self {
        let mut hdr =
            ChunkHeader::synthetic(".note.gnu.build-id", SHT_NOTE, SHF_ALLOC as u64, 4);
        // 16-byte note header plus the digest
        hdr.shdr.sh_size = 16 + SHA256_SIZE as u64;
        BuildIdSection { hdr }
    }
}

impl BuildIdSection {
    pub fn copy_buf(_ctx: &Context, buf: &mut [u8]) {
        buf.fill(0);
        let mut cur = elf::Cursor::new(buf);
        cur.write_u32(4); // name size
        cur.write_u32(SHA256_SIZE as u32); // hash size
        cur.write_u32(NT_GNU_BUILD_ID);
        cur.write(b"GNU\0");
    }

    /// hash the otherwise-final image in 1 MiB shards, then hash the
    /// concatenated shard digests into the build-id slot
    pub fn write_buildid(&self, buf: &mut [u8], filesize: u64) {
        let num_shards = filesize / BUILDID_SHARD_SIZE + 1;
        let image = &buf[..filesize as usize];
        let shards: Vec<[u8; SHA256_SIZE]> = (0..num_shards)
            .into_par_iter()
            .map(|i| {
                let begin = (i * BUILDID_SHARD_SIZE) as usize;
                let size = if i < num_shards - 1 {
                    BUILDID_SHARD_SIZE
                } else {
                    filesize % BUILDID_SHARD_SIZE
                } as usize;
                Sha256::digest(&image[begin..begin + size]).into()
            })
            .collect();

        let mut hasher = Sha256::new();
        for shard in &shards {
            hasher.update(shard);
        }
        let digest: [u8; SHA256_SIZE] = hasher.finalize().into();

        let slot = self.hdr.shdr.sh_offset as usize + 16;
        buf[slot..slot + SHA256_SIZE].copy_from_slice(&digest);
    }
}

//
// symbol-request entry points; callers serialize this phase
//

impl<'a> Context<'a> {
    pub fn is_pic(&self) -> bool {
        self.config.pie || self.config.shared
    }

    pub fn add_got_symbol(&mut self, sym: usize) {
        let s = &mut self.symbols.syms[sym];
        self.got.add_got_symbol(sym, s);
    }

    pub fn add_gottpoff_symbol(&mut self, sym: usize) {
        let s = &mut self.symbols.syms[sym];
        self.got.add_gottpoff_symbol(sym, s);
    }

    pub fn add_tlsgd_symbol(&mut self, sym: usize) {
        {
            let s = &mut self.symbols.syms[sym];
            self.got.add_tlsgd_symbol(sym, s);
        }
        self.add_dynsym_symbol(sym);
    }

    pub fn add_tlsld(&mut self) {
        self.got.add_tlsld();
    }

    /// the central PLT allocator: a symbol without a GOT slot also gets
    /// a got.plt slot, a rela.plt slot and a dynsym entry
    pub fn add_plt_symbol(&mut self, sym: usize) {
        let needs_gotplt;
        {
            let s = &mut self.symbols.syms[sym];
            assert!(s.plt_idx == -1, "duplicate PLT entry for {}", s.name);
            s.plt_idx = (self.plt.hdr.shdr.sh_size / PLT_SIZE) as i32;
            self.plt.hdr.shdr.sh_size += PLT_SIZE;
            self.plt.symbols.push(sym);

            needs_gotplt = s.got_idx == -1;
            if needs_gotplt {
                s.gotplt_idx = (self.gotplt.hdr.shdr.sh_size / GOT_SIZE) as i32;
                self.gotplt.hdr.shdr.sh_size += GOT_SIZE;
                s.has_relplt = true;
                self.relplt.hdr.shdr.sh_size += elf::RELA_SIZE;
            }
        }
        if needs_gotplt {
            self.add_dynsym_symbol(sym);
        }
    }

    /// idempotent; reserves the name slot in .dynstr at insert time
    pub fn add_dynsym_symbol(&mut self, sym: usize) {
        let s = &mut self.symbols.syms[sym];
        if s.dynsym_idx != -1 {
            return;
        }
        s.dynsym_idx = -2;
        let name_offset = self.dynstr.add_string(&s.name);
        self.dynsym.symbols.push((sym, name_offset));
    }

    /// reserve a .bss slot that receives a runtime copy of an imported
    /// data symbol
    pub fn add_copyrel_symbol(&mut self, sym: usize) {
        {
            let s = &mut self.symbols.syms[sym];
            assert!(
                s.is_imported,
                "copy relocation against non-imported symbol {}",
                s.name
            );
            if s.has_copyrel {
                return;
            }
            let size = align_to(
                self.copyrel.hdr.shdr.sh_size,
                self.copyrel.hdr.shdr.sh_addralign,
            );
            s.value = size;
            s.has_copyrel = true;
            self.copyrel.hdr.shdr.sh_size = size + s.esym.st_size;
            self.copyrel.symbols.push(sym);
        }
        self.add_dynsym_symbol(sym);
    }
}

//
// chunk dispatch
//

/// size/link pass entry point; runs once per chunk, sequentially
pub fn update_shdr(ctx: &mut Context, id: ChunkId) {
    match id {
        ChunkId::Phdr => OutputPhdr::update_shdr(ctx),
        ChunkId::Shdr => OutputShdr::update_shdr(ctx),
        ChunkId::Interp => InterpSection::update_shdr(ctx),
        ChunkId::RelDyn => RelDynSection::update_shdr(ctx),
        ChunkId::RelPlt => RelPltSection::update_shdr(ctx),
        ChunkId::Dynamic => DynamicSection::update_shdr(ctx),
        ChunkId::Dynsym => DynsymSection::update_shdr(ctx),
        ChunkId::Hash => HashSection::update_shdr(ctx),
        ChunkId::Versym => VersymSection::update_shdr(ctx),
        ChunkId::Verneed => VerneedSection::update_shdr(ctx),
        ChunkId::Symtab => SymtabSection::update_shdr(ctx),
        ChunkId::Strtab => StrtabSection::update_shdr(ctx),
        ChunkId::Shstrtab => ShstrtabSection::update_shdr(ctx),
        ChunkId::EhFrame => EhFrameSection::update_shdr(ctx),
        ChunkId::Merged(i) => MergedSection::update_shdr(ctx, i),
        // sizes tracked incrementally or fixed at construction
        ChunkId::Ehdr
        | ChunkId::BuildId
        | ChunkId::Got
        | ChunkId::GotPlt
        | ChunkId::Plt
        | ChunkId::Copyrel
        | ChunkId::Dynstr
        | ChunkId::Output(_) => {}
    }
}

/// emit pass entry point; `buf` is this chunk's own slice of the output
pub fn copy_buf(ctx: &Context, id: ChunkId, buf: &mut [u8]) {
    match id {
        ChunkId::Ehdr => OutputEhdr::copy_buf(ctx, buf),
        ChunkId::Phdr => OutputPhdr::copy_buf(ctx, buf),
        ChunkId::Shdr => OutputShdr::copy_buf(ctx, buf),
        ChunkId::Interp => InterpSection::copy_buf(ctx, buf),
        ChunkId::BuildId => BuildIdSection::copy_buf(ctx, buf),
        ChunkId::Got => GotSection::copy_buf(ctx, buf),
        ChunkId::GotPlt => GotPltSection::copy_buf(ctx, buf),
        ChunkId::Plt => PltSection::copy_buf(ctx, buf),
        ChunkId::RelDyn => RelDynSection::copy_buf(ctx, buf),
        ChunkId::RelPlt => RelPltSection::copy_buf(ctx, buf),
        ChunkId::Dynamic => DynamicSection::copy_buf(ctx, buf),
        ChunkId::Dynsym => DynsymSection::copy_buf(ctx, buf),
        ChunkId::Dynstr => DynstrSection::copy_buf(ctx, buf),
        ChunkId::Shstrtab => ShstrtabSection::copy_buf(ctx, buf),
        ChunkId::Hash => HashSection::copy_buf(ctx, buf),
        ChunkId::Versym => VersymSection::copy_buf(ctx, buf),
        ChunkId::Verneed => VerneedSection::copy_buf(ctx, buf),
        ChunkId::EhFrame => EhFrameSection::copy_buf(ctx, buf),
        ChunkId::Output(i) => OutputSection::copy_buf(ctx, i, buf),
        ChunkId::Merged(i) => MergedSection::copy_buf(ctx, i, buf),
        // NOBITS, nothing to emit
        ChunkId::Copyrel => {}
        // emitted jointly by the driver's symtab job
        ChunkId::Symtab | ChunkId::Strtab => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{InputSection, InputSym, ObjectFile, Reloc, RelocTarget};
    use crate::link::emit_output;
    use crate::opt::Opt;
    use object::elf::{
        ET_DYN, R_X86_64_GOTTPOFF, R_X86_64_PLT32, R_X86_64_TLSGD, R_X86_64_TLSLD, STB_GLOBAL,
        STB_LOCAL, STT_FUNC, STT_OBJECT, STT_TLS,
    };

    fn read_u16(buf: &[u8], off: usize) -> u16 {
        u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
    }

    fn read_u32(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
    }

    fn read_u64(buf: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
    }

    fn read_cstr(buf: &[u8], off: usize) -> &str {
        let end = off + buf[off..].iter().position(|&b| b == 0).unwrap();
        std::str::from_utf8(&buf[off..end]).unwrap()
    }

    fn pie_opt() -> Opt {
        Opt {
            pie: true,
            dynamic_linker: Some("/lib64/ld-linux-x86-64.so.2".to_string()),
            ..Opt::default()
        }
    }

    fn import_sym(ctx: &mut Context, name: &str, st_type: u8, st_size: u64) -> usize {
        let id = ctx.symbols.intern(name);
        let sym = &mut ctx.symbols.syms[id];
        sym.is_imported = true;
        sym.esym = InputSym {
            st_bind: STB_GLOBAL,
            st_type,
            st_size,
            undefined: false,
        };
        id
    }

    fn define_sym(ctx: &mut Context, name: &str, st_bind: u8, isec: usize, value: u64) -> usize {
        let id = ctx.symbols.intern(name);
        let sym = &mut ctx.symbols.syms[id];
        sym.value = value;
        sym.input_section = Some(isec);
        sym.esym = InputSym {
            st_bind,
            st_type: STT_FUNC,
            st_size: 0,
            undefined: false,
        };
        id
    }

    fn text_isec(data: &'static [u8], output_section: usize, relocs: Vec<Reloc>) -> InputSection<'static> {
        InputSection {
            file: 0,
            name: ".text".to_string(),
            sh_type: SHT_PROGBITS,
            sh_flags: (SHF_ALLOC | SHF_EXECINSTR) as u64,
            sh_size: data.len() as u64,
            sh_addralign: 16,
            data,
            output_section,
            offset: 0,
            relocs,
        }
    }

    // one object calling an imported puts; expects a single lazy PLT slot
    #[test]
    fn test_minimal_pie_hello() {
        static CODE: [u8; 9] = [0xe8, 0, 0, 0, 0, 0x31, 0xc0, 0x0f, 0x05];

        let mut ctx = Context::new(pie_opt());
        let reg = OutputSectionRegistry::default();
        let text = reg.get_instance(".text", SHT_PROGBITS, (SHF_ALLOC | SHF_EXECINSTR) as u64);
        ctx.output_sections = reg.into_instances();

        let puts = import_sym(&mut ctx, "puts", STT_FUNC, 0);
        ctx.input_sections.push(text_isec(
            &CODE,
            text,
            vec![Reloc {
                offset: 1,
                r_type: R_X86_64_PLT32,
                target: RelocTarget::Symbol(puts),
                addend: -4,
            }],
        ));
        ctx.output_sections[text].members.push(0);
        let start = define_sym(&mut ctx, "_start", STB_GLOBAL, 0, 0);
        ctx.objs.push(ObjectFile {
            name: "hello.o".to_string(),
            sections: vec![0],
            syms: vec![start],
            ..Default::default()
        });
        ctx.objs[0].compute_symtab(&ctx.symbols);

        ctx.add_plt_symbol(puts);
        let buf = emit_output(&mut ctx);

        // the first free slot after the three reserved got.plt entries
        assert_eq!(ctx.symbols.syms[puts].gotplt_idx, 3);
        assert_eq!(ctx.symbols.syms[puts].plt_idx, 1);
        assert!(ctx.symbols.syms[puts].has_relplt);

        // PIE means ET_DYN plus DF_1_PIE
        assert_eq!(read_u16(&buf, 16), ET_DYN);
        let dynamic = create_dynamic_section(&ctx);
        let flags1 = dynamic
            .chunks(2)
            .find(|pair| pair[0] == DT_FLAGS_1 as u64)
            .expect("DT_FLAGS_1 missing");
        assert!(flags1[1] & DF_1_PIE as u64 != 0);

        // exactly one R_X86_64_JUMP_SLOT at puts's got.plt slot
        let relplt = &ctx.relplt.hdr.shdr;
        assert_eq!(relplt.sh_size, elf::RELA_SIZE);
        let off = relplt.sh_offset as usize;
        assert_eq!(read_u64(&buf, off), ctx.gotplt_addr(puts));
        let info = read_u64(&buf, off + 8);
        assert_eq!(info as u32, R_X86_64_JUMP_SLOT);
        assert_eq!((info >> 32) as i32, ctx.symbols.syms[puts].dynsym_idx);

        // PLT[0] pushes GOTPLT+8 and jumps through GOTPLT+16
        let plt = ctx.plt.hdr.shdr.sh_offset as usize;
        assert_eq!(&buf[plt..plt + 2], &[0xff, 0x35]);
        assert_eq!(&buf[plt + 6..plt + 8], &[0xff, 0x25]);
        // puts's entry jumps through its got.plt slot
        assert_eq!(&buf[plt + 16..plt + 18], &[0xff, 0x25]);
        let expect =
            (ctx.gotplt_addr(puts) as i64 - ctx.plt_addr(puts) as i64 - 6) as u32;
        assert_eq!(read_u32(&buf, plt + 18), expect);
        // the lazy slot initially returns to the push in the PLT entry
        let gotplt = ctx.gotplt.hdr.shdr.sh_offset as usize;
        assert_eq!(read_u64(&buf, gotplt + 24), ctx.plt_addr(puts) + 6);

        // the call in .text was routed through the PLT
        let text_shdr = &ctx.output_sections[text].hdr.shdr;
        let disp = read_u32(&buf, text_shdr.sh_offset as usize + 1) as i32;
        assert_eq!(
            (text_shdr.sh_addr as i64 + 5 + disp as i64) as u64,
            ctx.plt_addr(puts)
        );

        // chunks cover disjoint file ranges
        let mut regions: Vec<(u64, u64)> = ctx
            .chunks
            .iter()
            .filter(|&&id| !ctx.chunk_header(id).is_nobits())
            .map(|&id| {
                let shdr = &ctx.chunk_header(id).shdr;
                (shdr.sh_offset, shdr.sh_size)
            })
            .collect();
        regions.sort();
        for w in regions.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0);
        }
        let (last_off, last_size) = *regions.last().unwrap();
        assert!(last_off + last_size <= buf.len() as u64);

        // every PT_LOAD maps a consistent flag group
        let (phdrs, _) = create_phdr(&ctx);
        for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
            assert!(phdr.p_filesz <= phdr.p_memsz);
            for &id in &ctx.chunks {
                let hdr = ctx.chunk_header(id);
                if hdr.is_alloc()
                    && hdr.shdr.sh_addr >= phdr.p_vaddr
                    && hdr.shdr.sh_addr + hdr.shdr.sh_size <= phdr.p_vaddr + phdr.p_memsz
                {
                    assert_eq!(to_phdr_flags(hdr), phdr.p_flags, "chunk {}", hdr.name);
                }
            }
        }
    }

    // TLS model relocations resolve to their GOT slots, PC-relative
    #[test]
    fn test_tls_relocs_patch_got_displacements() {
        static CODE: [u8; 16] = [0x90; 16];

        let mut ctx = Context::new(pie_opt());
        let reg = OutputSectionRegistry::default();
        let text = reg.get_instance(".text", SHT_PROGBITS, (SHF_ALLOC | SHF_EXECINSTR) as u64);
        ctx.output_sections = reg.into_instances();

        let gd = import_sym(&mut ctx, "gd_var", STT_TLS, 8);
        let ie = import_sym(&mut ctx, "ie_var", STT_TLS, 8);
        ctx.input_sections.push(text_isec(
            &CODE,
            text,
            vec![
                Reloc {
                    offset: 2,
                    r_type: R_X86_64_TLSGD,
                    target: RelocTarget::Symbol(gd),
                    addend: -4,
                },
                Reloc {
                    offset: 8,
                    r_type: R_X86_64_GOTTPOFF,
                    target: RelocTarget::Symbol(ie),
                    addend: -4,
                },
                Reloc {
                    offset: 12,
                    r_type: R_X86_64_TLSLD,
                    target: RelocTarget::Symbol(gd),
                    addend: -4,
                },
            ],
        ));
        ctx.output_sections[text].members.push(0);
        ctx.objs.push(ObjectFile {
            name: "tls.o".to_string(),
            sections: vec![0],
            ..Default::default()
        });

        ctx.add_tlsgd_symbol(gd);
        ctx.add_gottpoff_symbol(ie);
        ctx.add_dynsym_symbol(ie);
        ctx.add_tlsld();
        let buf = emit_output(&mut ctx);

        // each displacement points its next instruction at the slot
        let text_shdr = &ctx.output_sections[text].hdr.shdr;
        let target = |offset: usize| {
            let disp = read_u32(&buf, text_shdr.sh_offset as usize + offset) as i32;
            (text_shdr.sh_addr as i64 + offset as i64 + 4 + disp as i64) as u64
        };
        assert_eq!(target(2), ctx.tlsgd_addr(gd));
        assert_eq!(target(8), ctx.gottpoff_addr(ie));
        assert_eq!(target(12), ctx.tlsld_addr());
    }

    // two TLSLD users share one module-id block
    #[test]
    fn test_tlsld_allocation_is_shared() {
        let mut ctx = Context::new(pie_opt());
        ctx.add_tlsld();
        let idx = ctx.got.tlsld_idx;
        ctx.add_tlsld();
        assert_eq!(ctx.got.tlsld_idx, idx);
        assert_eq!(ctx.got.hdr.shdr.sh_size, GOT_SIZE * 2);

        let buf = emit_output(&mut ctx);
        let reldyn = &ctx.reldyn.hdr.shdr;
        assert_eq!(reldyn.sh_size, elf::RELA_SIZE);
        let off = reldyn.sh_offset as usize;
        assert_eq!(read_u64(&buf, off), ctx.tlsld_addr());
        let info = read_u64(&buf, off + 8);
        assert_eq!(info as u32, R_X86_64_DTPMOD64);
        assert_eq!(info >> 32, 0);
    }

    // .bss extends p_memsz but never p_filesz
    #[test]
    fn test_bss_extends_memsz_only() {
        let mut ctx = Context::new(Opt::default());
        let reg = OutputSectionRegistry::default();
        let data = reg.get_instance(".data", SHT_PROGBITS, (SHF_ALLOC | SHF_WRITE) as u64);
        let bss = reg.get_instance(".bss", SHT_NOBITS, (SHF_ALLOC | SHF_WRITE) as u64);
        let rodata = reg.get_instance(".rodata", SHT_PROGBITS, SHF_ALLOC as u64);
        ctx.output_sections = reg.into_instances();
        ctx.chunks = vec![
            ChunkId::Output(data),
            ChunkId::Output(bss),
            ChunkId::Output(rodata),
        ];

        let set = |shdr: &mut elf::Shdr, offset, addr, size| {
            shdr.sh_offset = offset;
            shdr.sh_addr = addr;
            shdr.sh_size = size;
        };
        set(&mut ctx.output_sections[data].hdr.shdr, 0x1000, 0x1000, 0x200);
        set(&mut ctx.output_sections[bss].hdr.shdr, 0x1200, 0x1200, 0x300);
        set(&mut ctx.output_sections[rodata].hdr.shdr, 0x2000, 0x2000, 0x80);

        let (phdrs, _) = create_phdr(&ctx);
        let loads: Vec<&elf::Phdr> = phdrs.iter().filter(|p| p.p_type == PT_LOAD).collect();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].p_flags, PF_R | PF_W);
        assert_eq!(loads[0].p_offset, 0x1000);
        assert_eq!(loads[0].p_filesz, 0x200);
        assert_eq!(loads[0].p_memsz, 0x1200 + 0x300 - 0x1000);
        assert_eq!(loads[1].p_flags, PF_R);
        assert_eq!(loads[1].p_filesz, 0x80);
        assert_eq!(loads[1].p_memsz, 0x80);
    }

    // sixteen racing threads must agree on one canonical instance
    #[test]
    fn test_output_section_interning_race() {
        let reg = OutputSectionRegistry::default();
        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    reg.get_instance(
                        ".text.foo",
                        SHT_PROGBITS,
                        (SHF_ALLOC | SHF_EXECINSTR | SHF_GROUP) as u64,
                    )
                });
            }
        });
        let instances = reg.into_instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].hdr.name, ".text");
        assert_eq!(
            instances[0].hdr.shdr.sh_flags,
            (SHF_ALLOC | SHF_EXECINSTR) as u64
        );
    }

    #[test]
    fn test_output_section_interning_canonicalizes() {
        let reg = OutputSectionRegistry::default();
        let flags = (SHF_ALLOC | SHF_EXECINSTR) as u64;
        let a = reg.get_instance(".text.foo", SHT_PROGBITS, flags);
        let b = reg.get_instance(".text.bar", SHT_PROGBITS, flags | SHF_GROUP as u64);
        let c = reg.get_instance(".text", SHT_PROGBITS, flags);
        assert_eq!(a, b);
        assert_eq!(b, c);

        let d = reg.get_instance(".eh_frame", SHT_X86_64_UNWIND, SHF_ALLOC as u64);
        assert_ne!(a, d);
        let instances = reg.into_instances();
        assert_eq!(instances[d].hdr.shdr.sh_type, SHT_PROGBITS);
    }

    // identical images produce identical build-ids
    #[test]
    fn test_buildid_determinism() {
        let mut a = vec![0u8; 3 * 1024 * 1024 + 123];
        for (i, byte) in a.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let mut b = a.clone();

        let mut sec = BuildIdSection::default();
        sec.hdr.shdr.sh_offset = 64;
        let filesize = a.len() as u64;
        sec.write_buildid(&mut a, filesize);
        sec.write_buildid(&mut b, filesize);

        assert_eq!(a[80..112], b[80..112]);
        assert!(a[80..112].iter().any(|&x| x != 0));
    }

    // an exact shard multiple hashes a zero-byte final shard
    #[test]
    fn test_buildid_exact_shard_multiple() {
        let mut buf = vec![0xabu8; BUILDID_SHARD_SIZE as usize];
        let sec = BuildIdSection::default();
        sec.write_buildid(&mut buf, BUILDID_SHARD_SIZE);
        assert!(buf[16..16 + SHA256_SIZE].iter().any(|&x| x != 0xab));
    }

    // insertion order survives the local/global partition
    #[test]
    fn test_dynsym_stable_partition() {
        let mut ctx = Context::new(pie_opt());
        for (name, st_bind) in [
            ("galpha", STB_GLOBAL),
            ("lbeta", STB_LOCAL),
            ("ggamma", STB_GLOBAL),
            ("ldelta", STB_LOCAL),
        ] {
            let id = ctx.symbols.intern(name);
            ctx.symbols.syms[id].esym.st_bind = st_bind;
            ctx.add_dynsym_symbol(id);
        }
        DynsymSection::sort_symbols(&mut ctx);

        let order: Vec<&str> = ctx
            .dynsym
            .symbols
            .iter()
            .map(|&(sym, _)| ctx.symbols.syms[sym].name.as_str())
            .collect();
        assert_eq!(order, ["lbeta", "ldelta", "galpha", "ggamma"]);
        assert_eq!(ctx.dynsym.hdr.shdr.sh_info, 3);
        for (i, &(sym, _)) in ctx.dynsym.symbols.iter().enumerate() {
            assert_eq!(ctx.symbols.syms[sym].dynsym_idx, i as i32 + 1);
        }

        // re-adding allocates nothing
        let again = ctx.symbols.get("galpha").unwrap();
        ctx.add_dynsym_symbol(again);
        assert_eq!(ctx.dynsym.symbols.len(), 4);
    }

    // every dynsym entry is reachable through its hash chain
    #[test]
    fn test_sysv_hash_chains() {
        let mut ctx = Context::new(pie_opt());
        for name in ["alpha", "beta", "gamma", "delta", "epsilon"] {
            let id = import_sym(&mut ctx, name, STT_FUNC, 0);
            ctx.add_dynsym_symbol(id);
        }
        let buf = emit_output(&mut ctx);

        let base = ctx.hash.hdr.shdr.sh_offset as usize;
        let nbucket = read_u32(&buf, base) as usize;
        assert_eq!(nbucket, ctx.dynsym.symbols.len() + 1);
        assert_eq!(read_u32(&buf, base + 4) as usize, nbucket);

        for &(sym, _) in &ctx.dynsym.symbols {
            let s = &ctx.symbols.syms[sym];
            let bucket = object::elf::hash(s.name.as_bytes()) as usize % nbucket;
            let mut idx = read_u32(&buf, base + 8 + bucket * 4);
            let mut found = false;
            while idx != 0 {
                if idx == s.dynsym_idx as u32 {
                    found = true;
                    break;
                }
                idx = read_u32(&buf, base + 8 + nbucket * 4 + idx as usize * 4);
            }
            assert!(found, "{} unreachable through its hash chain", s.name);
        }
    }

    // the rela.dyn size must count every contribution source
    #[test]
    fn test_reldyn_size_accounts_every_source() {
        static DATA: [u8; 8] = [0; 8];

        let mut ctx = Context::new(pie_opt());
        let reg = OutputSectionRegistry::default();
        let data = reg.get_instance(".data", SHT_PROGBITS, (SHF_ALLOC | SHF_WRITE) as u64);
        ctx.output_sections = reg.into_instances();
        ctx.input_sections.push(InputSection {
            file: 0,
            name: ".data".to_string(),
            sh_type: SHT_PROGBITS,
            sh_flags: (SHF_ALLOC | SHF_WRITE) as u64,
            sh_size: 8,
            sh_addralign: 8,
            data: &DATA,
            output_section: data,
            offset: 0,
            relocs: vec![],
        });

        let g1 = import_sym(&mut ctx, "g1", STT_OBJECT, 8);
        ctx.add_got_symbol(g1);
        ctx.add_dynsym_symbol(g1);

        // locally defined, so PIE emits an R_X86_64_RELATIVE for it
        let g2 = ctx.symbols.intern("g2");
        ctx.symbols.syms[g2].input_section = Some(0);
        ctx.symbols.syms[g2].esym.st_type = STT_OBJECT;
        ctx.add_got_symbol(g2);

        let t1 = import_sym(&mut ctx, "t1", STT_TLS, 8);
        ctx.add_tlsgd_symbol(t1);
        ctx.add_tlsld();
        let t2 = import_sym(&mut ctx, "t2", STT_TLS, 8);
        ctx.add_gottpoff_symbol(t2);
        ctx.add_dynsym_symbol(t2);

        let c1 = import_sym(&mut ctx, "c1", STT_OBJECT, 16);
        ctx.add_copyrel_symbol(c1);

        ctx.objs.push(ObjectFile {
            name: "a.o".to_string(),
            num_dynrel: 2,
            dynrels: vec![elf::Rela::default(); 2],
            ..Default::default()
        });

        RelDynSection::update_shdr(&mut ctx);
        // g1 + g2 + tlsgd pair + tlsld + gottpoff + copyrel + file range
        assert_eq!(
            ctx.reldyn.hdr.shdr.sh_size,
            (1 + 1 + 2 + 1 + 1 + 1 + 2) * elf::RELA_SIZE
        );
        assert_eq!(ctx.objs[0].reldyn_offset, 7 * elf::RELA_SIZE);
    }

    // copyrel slots align, grow and register exactly once
    #[test]
    fn test_copyrel_round_trip() {
        let mut ctx = Context::new(pie_opt());
        let environ = import_sym(&mut ctx, "environ", STT_OBJECT, 8);
        ctx.add_copyrel_symbol(environ);
        assert_eq!(ctx.symbols.syms[environ].value, 0);
        assert!(ctx.symbols.syms[environ].has_copyrel);

        let stdout = import_sym(&mut ctx, "stdout", STT_OBJECT, 8);
        ctx.add_copyrel_symbol(stdout);
        assert_eq!(ctx.symbols.syms[stdout].value, 32);

        ctx.add_copyrel_symbol(environ);
        assert_eq!(ctx.copyrel.symbols.len(), 2);
        assert_eq!(ctx.copyrel.hdr.shdr.sh_size, 40);
        assert_eq!(ctx.dynsym.symbols.len(), 2);
    }

    #[test]
    #[should_panic]
    fn test_duplicate_got_allocation_panics() {
        let mut ctx = Context::new(pie_opt());
        let sym = import_sym(&mut ctx, "dup", STT_OBJECT, 8);
        ctx.add_got_symbol(sym);
        ctx.add_got_symbol(sym);
    }

    #[test]
    fn test_dynstr_add_and_find() {
        let mut dynstr = DynstrSection::default();
        assert_eq!(dynstr.add_string("libc.so.6"), 1);
        assert_eq!(dynstr.add_string("puts"), 11);
        assert_eq!(dynstr.add_string("libc.so.6"), 1);
        assert_eq!(dynstr.find_string("puts"), 11);
        assert_eq!(dynstr.hdr.shdr.sh_size, 1 + 10 + 5);
    }

    #[test]
    #[should_panic]
    fn test_dynstr_find_missing_string() {
        DynstrSection::default().find_string("missing");
    }

    // locals precede globals and names land in each file's strtab slice
    #[test]
    fn test_symtab_partition_and_names() {
        static CODE: [u8; 4] = [0x90; 4];

        let mut ctx = Context::new(Opt::default());
        let reg = OutputSectionRegistry::default();
        let text = reg.get_instance(".text", SHT_PROGBITS, (SHF_ALLOC | SHF_EXECINSTR) as u64);
        ctx.output_sections = reg.into_instances();
        for file in 0..2 {
            ctx.input_sections.push(InputSection {
                file,
                name: ".text".to_string(),
                sh_type: SHT_PROGBITS,
                sh_flags: (SHF_ALLOC | SHF_EXECINSTR) as u64,
                sh_size: 4,
                sh_addralign: 4,
                data: &CODE,
                output_section: text,
                offset: 0,
                relocs: vec![],
            });
            ctx.output_sections[text].members.push(file);
        }

        let a_local = define_sym(&mut ctx, "a_local", STB_LOCAL, 0, 0);
        let a_glob = define_sym(&mut ctx, "a_glob", STB_GLOBAL, 0, 2);
        let b_glob = define_sym(&mut ctx, "b_glob", STB_GLOBAL, 1, 0);
        ctx.objs.push(ObjectFile {
            name: "a.o".to_string(),
            sections: vec![0],
            syms: vec![a_local, a_glob],
            ..Default::default()
        });
        ctx.objs.push(ObjectFile {
            name: "b.o".to_string(),
            sections: vec![1],
            syms: vec![b_glob],
            ..Default::default()
        });
        ctx.objs[0].compute_symtab(&ctx.symbols);
        ctx.objs[1].compute_symtab(&ctx.symbols);

        let buf = emit_output(&mut ctx);

        // one local plus the reserved entry
        assert_eq!(ctx.symtab.hdr.shdr.sh_info, 2);
        assert_eq!(ctx.symtab.hdr.shdr.sh_size, 4 * elf::SYM_SIZE);

        let symtab = ctx.symtab.hdr.shdr.sh_offset as usize;
        let strtab = ctx.strtab.hdr.shdr.sh_offset as usize;

        // entry 1: file a's local
        let st_name = read_u32(&buf, symtab + 24) as usize;
        assert_eq!(read_cstr(&buf, strtab + st_name), "a_local");
        assert_eq!(buf[symtab + 24 + 4] >> 4, STB_LOCAL);

        // entry 2: file a's global, at the partition boundary
        let st_name = read_u32(&buf, symtab + 48) as usize;
        assert_eq!(read_cstr(&buf, strtab + st_name), "a_glob");
        assert_eq!(buf[symtab + 48 + 4] >> 4, STB_GLOBAL);
        let a_glob_value = read_u64(&buf, symtab + 48 + 8);
        assert_eq!(a_glob_value, ctx.sym_addr(a_glob));

        // entry 3: file b's global
        let st_name = read_u32(&buf, symtab + 72) as usize;
        assert_eq!(read_cstr(&buf, strtab + st_name), "b_glob");
    }

    // identical pieces coalesce onto their first occurrence
    #[test]
    fn test_merged_section_dedup_and_emit() {
        let reg = MergedSectionRegistry::default();
        let idx = reg.get_instance(
            ".rodata.str1.1",
            SHT_PROGBITS,
            (SHF_ALLOC | SHF_MERGE | SHF_STRINGS) as u64,
        );
        let mut sections = reg.into_instances();
        assert_eq!(sections[idx].hdr.name, ".rodata");
        assert_eq!(sections[idx].hdr.shdr.sh_flags, SHF_ALLOC as u64);

        let m0 = sections[idx].add_member();
        let hi: &[u8] = b"hi\0";
        let yo: &[u8] = b"yo\0";
        sections[idx].insert(hi, m0, 0);
        sections[idx].insert(yo, m0, 3);
        let m1 = sections[idx].add_member();
        sections[idx].members[m1].offset = 6;
        sections[idx].insert(hi, m1, 0);

        let mut ctx = Context::new(Opt::default());
        ctx.merged_sections = sections;
        ctx.chunks = vec![ChunkId::Merged(idx)];
        MergedSection::update_shdr(&mut ctx, idx);
        assert_eq!(ctx.merged_sections[idx].hdr.shdr.sh_size, 6);

        let mut buf = vec![0xffu8; 6];
        MergedSection::copy_buf(&ctx, idx, &mut buf);
        assert_eq!(&buf, b"hi\0yo\0");
    }

    // emission advances by each member's own size
    #[test]
    fn test_eh_frame_concatenates_members() {
        static CIE: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        static FDE: [u8; 4] = [9, 10, 11, 12];

        let mut ctx = Context::new(Opt::default());
        for data in [&CIE[..], &FDE[..]] {
            let isec = ctx.input_sections.len();
            ctx.input_sections.push(InputSection {
                file: 0,
                name: ".eh_frame".to_string(),
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC as u64,
                sh_size: data.len() as u64,
                sh_addralign: 8,
                data,
                output_section: usize::MAX,
                offset: 0,
                relocs: vec![],
            });
            ctx.ehframe.members.push(isec);
        }

        EhFrameSection::finalize_contents(&mut ctx);
        EhFrameSection::update_shdr(&mut ctx);
        assert_eq!(ctx.ehframe.hdr.shdr.sh_size, 12);

        let mut buf = vec![0u8; 12];
        EhFrameSection::copy_buf(&ctx, &mut buf);
        assert_eq!(&buf[..8], &CIE);
        assert_eq!(&buf[8..], &FDE);
    }

    // the section header table lists every non-header chunk once
    #[test]
    fn test_section_header_table() {
        let mut ctx = Context::new(pie_opt());
        let buf = emit_output(&mut ctx);

        let shoff = ctx.shdr.hdr.shdr.sh_offset as usize;
        let shnum = (ctx.shdr.hdr.shdr.sh_size / elf::SHDR_SIZE) as usize;
        assert_eq!(read_u64(&buf, 40), shoff as u64); // e_shoff
        assert_eq!(read_u16(&buf, 60) as usize, shnum); // e_shnum
        assert_eq!(read_u16(&buf, 62), ctx.shstrtab.hdr.shndx as u16); // e_shstrndx

        // record 0 is all-zero
        assert!(buf[shoff..shoff + 64].iter().all(|&b| b == 0));

        // each record's sh_name resolves in .shstrtab
        let shstrtab = ctx.shstrtab.hdr.shdr.sh_offset as usize;
        let mut names = vec![];
        for i in 1..shnum {
            let rec = shoff + i * 64;
            names.push(read_cstr(&buf, shstrtab + read_u32(&buf, rec) as usize).to_string());
        }
        assert!(names.contains(&".dynsym".to_string()));
        assert!(names.contains(&".shstrtab".to_string()));
        assert!(names.contains(&".interp".to_string()));
    }
}
