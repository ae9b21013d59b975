use crate::chunks::{
    BuildIdSection, ChunkHeader, ChunkId, CopyrelSection, DynamicSection, DynstrSection,
    DynsymSection, EhFrameSection, GotPltSection, GotSection, HashSection, InterpSection,
    MergedSection, OutputEhdr, OutputPhdr, OutputSection, OutputShdr, PltSection, RelDynSection,
    RelPltSection, ShstrtabSection, StrtabSection, SymtabSection, VerneedSection, VersymSection,
};
use crate::elf;
use crate::opt::Opt;
use crate::{GOT_SIZE, PLT_SIZE};
use object::elf::{
    R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_GOTPCREL, R_X86_64_GOTPCRELX,
    R_X86_64_GOTTPOFF, R_X86_64_PC32, R_X86_64_PLT32, R_X86_64_REX_GOTPCRELX, R_X86_64_TLSGD,
    R_X86_64_TLSLD, SHN_ABS, STB_LOCAL, STT_TLS,
};
use std::collections::BTreeMap;

/// the winning input ELF symbol record
#[derive(Debug, Default, Clone, Copy)]
pub struct InputSym {
    pub st_bind: u8,
    pub st_type: u8,
    pub st_size: u64,
    pub undefined: bool,
}

#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub esym: InputSym,
    /// back-pointer into Context::input_sections, a lookup relation
    pub input_section: Option<usize>,
    // slot indices, -1 = absent, -2 = reserved pending ordering
    pub got_idx: i32,
    pub gotplt_idx: i32,
    pub gottpoff_idx: i32,
    pub tlsgd_idx: i32,
    pub plt_idx: i32,
    pub dynsym_idx: i32,
    pub is_imported: bool,
    pub has_copyrel: bool,
    pub has_relplt: bool,
}

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol {
            name: name.to_string(),
            value: 0,
            esym: InputSym::default(),
            input_section: None,
            got_idx: -1,
            gotplt_idx: -1,
            gottpoff_idx: -1,
            tlsgd_idx: -1,
            plt_idx: -1,
            dynsym_idx: -1,
            is_imported: false,
            has_copyrel: false,
            has_relplt: false,
        }
    }

    pub fn is_local(&self) -> bool {
        self.esym.st_bind == STB_LOCAL
    }

    /// address is a fixed offset from the image base
    pub fn is_relative(&self) -> bool {
        !self.is_imported && self.input_section.is_some() && self.esym.st_type != STT_TLS
    }
}

/// symbol registry keyed by name
#[derive(Debug, Default)]
pub struct SymbolTable {
    map: BTreeMap<String, usize>,
    pub syms: Vec<Symbol>,
}

impl SymbolTable {
    /// return the existing symbol or create an undefined one
    pub fn intern(&mut self, name: &str) -> usize {
        if let Some(&id) = self.map.get(name) {
            return id;
        }
        let id = self.syms.len();
        self.syms.push(Symbol::new(name));
        self.map.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }
}

/// relocation against a symbol or an input section
#[derive(Debug)]
pub enum RelocTarget {
    Symbol(usize),
    Section(usize),
}

#[derive(Debug)]
pub struct Reloc {
    /// offset into the input section
    pub offset: u64,
    pub r_type: u32,
    pub target: RelocTarget,
    pub addend: i64,
}

/// a section read from an input object, borrowed from the file arena
#[derive(Debug)]
pub struct InputSection<'a> {
    pub file: usize,
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_size: u64,
    pub sh_addralign: u64,
    pub data: &'a [u8],
    pub output_section: usize,
    /// offset within the output section
    pub offset: u64,
    pub relocs: Vec<Reloc>,
}

/// patch one relocated field; `p` is the field's virtual address and
/// `buf` the containing member's bytes
pub fn apply_reloc(ctx: &Context, reloc: &Reloc, p: u64, buf: &mut [u8]) {
    // symbol (or target section) address
    let s = match reloc.target {
        RelocTarget::Symbol(sym) => match reloc.r_type {
            R_X86_64_PLT32 if ctx.symbols.syms[sym].plt_idx != -1 => ctx.plt_addr(sym),
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => ctx.got_addr(sym),
            R_X86_64_TLSGD => ctx.tlsgd_addr(sym),
            R_X86_64_TLSLD => ctx.tlsld_addr(),
            R_X86_64_GOTTPOFF => ctx.gottpoff_addr(sym),
            _ => ctx.sym_addr(sym),
        },
        RelocTarget::Section(isec) => ctx.isec_addr(isec),
    } as i64;
    // addend
    let a = reloc.addend;
    // pc
    let p = p as i64;

    let loc = reloc.offset as usize;
    match reloc.r_type {
        R_X86_64_64 => {
            buf[loc..loc + 8].copy_from_slice(&s.wrapping_add(a).to_le_bytes());
        }
        R_X86_64_32 => {
            let value = s.wrapping_add(a) as u32;
            buf[loc..loc + 4].copy_from_slice(&value.to_le_bytes());
        }
        R_X86_64_32S => {
            let value = s.wrapping_add(a) as i32;
            buf[loc..loc + 4].copy_from_slice(&value.to_le_bytes());
        }
        R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX
        | R_X86_64_REX_GOTPCRELX | R_X86_64_TLSGD | R_X86_64_TLSLD | R_X86_64_GOTTPOFF => {
            let value = (s.wrapping_add(a).wrapping_sub(p)) as i32;
            buf[loc..loc + 4].copy_from_slice(&value.to_le_bytes());
        }
        other => unimplemented!("relocation type {other}"),
    }
}

impl<'a> InputSection<'a> {
    /// copy contents into this section's slice of the output section,
    /// then patch relocated fields in place
    pub fn copy_buf(&self, ctx: &Context, buf: &mut [u8]) {
        buf[..self.data.len()].copy_from_slice(self.data);
        self.apply_reloc_alloc(ctx, buf);
    }

    pub fn apply_reloc_alloc(&self, ctx: &Context, buf: &mut [u8]) {
        let base = ctx.output_sections[self.output_section].hdr.shdr.sh_addr + self.offset;
        for reloc in &self.relocs {
            apply_reloc(ctx, reloc, base + reloc.offset, buf);
        }
    }
}

/// an already-resolved relocatable object consumed by the output core
#[derive(Debug, Default)]
pub struct ObjectFile {
    pub name: String,
    /// InputSection ids owned by this file
    pub sections: Vec<usize>,
    /// symbols this file defines
    pub syms: Vec<usize>,
    pub strtab_size: u64,
    pub strtab_offset: u64,
    pub local_symtab_size: u64,
    pub local_symtab_offset: u64,
    pub global_symtab_size: u64,
    pub global_symtab_offset: u64,
    /// dynamic relocations this file contributes to .rela.dyn
    pub num_dynrel: u64,
    pub reldyn_offset: u64,
    pub dynrels: Vec<elf::Rela>,
}

/// shared-object dependency
#[derive(Debug)]
pub struct SharedFile {
    pub name: String,
    pub soname: String,
}

/// process-wide linker state, explicitly threaded instead of globals
pub struct Context<'a> {
    pub config: Opt,
    /// order defines the final file layout
    pub chunks: Vec<ChunkId>,
    pub ehdr: OutputEhdr,
    pub phdr: OutputPhdr,
    pub shdr: OutputShdr,
    pub interp: InterpSection,
    pub got: GotSection,
    pub gotplt: GotPltSection,
    pub plt: PltSection,
    pub reldyn: RelDynSection,
    pub relplt: RelPltSection,
    pub dynamic: DynamicSection,
    pub dynsym: DynsymSection,
    pub dynstr: DynstrSection,
    pub hash: HashSection,
    pub versym: VersymSection,
    pub verneed: VerneedSection,
    pub copyrel: CopyrelSection,
    pub buildid: BuildIdSection,
    pub symtab: SymtabSection,
    pub strtab: StrtabSection,
    pub shstrtab: ShstrtabSection,
    pub ehframe: EhFrameSection,
    pub output_sections: Vec<OutputSection>,
    pub merged_sections: Vec<MergedSection<'a>>,
    pub input_sections: Vec<InputSection<'a>>,
    pub symbols: SymbolTable,
    pub objs: Vec<ObjectFile>,
    pub dsos: Vec<SharedFile>,
    /// virtual-address bounds of the TLS image
    pub tls_begin: u64,
    pub tls_end: u64,
}

impl<'a> Context<'a> {
    pub fn new(config: Opt) -> Self {
        let mut ctx = Context {
            config,
            chunks: vec![],
            ehdr: OutputEhdr::default(),
            phdr: OutputPhdr::default(),
            shdr: OutputShdr::default(),
            interp: InterpSection::default(),
            got: GotSection::default(),
            gotplt: GotPltSection::default(),
            plt: PltSection::default(),
            reldyn: RelDynSection::default(),
            relplt: RelPltSection::default(),
            dynamic: DynamicSection::default(),
            dynsym: DynsymSection::default(),
            dynstr: DynstrSection::default(),
            hash: HashSection::default(),
            versym: VersymSection::default(),
            verneed: VerneedSection::default(),
            copyrel: CopyrelSection::default(),
            buildid: BuildIdSection::default(),
            symtab: SymtabSection::default(),
            strtab: StrtabSection::default(),
            shstrtab: ShstrtabSection::default(),
            ehframe: EhFrameSection::default(),
            output_sections: vec![],
            merged_sections: vec![],
            input_sections: vec![],
            symbols: SymbolTable::default(),
            objs: vec![],
            dsos: vec![],
            tls_begin: 0,
            tls_end: 0,
        };
        for name in [
            "__init_array_start",
            "__init_array_end",
            "__fini_array_start",
            "__fini_array_end",
        ] {
            ctx.symbols.intern(name);
        }
        ctx
    }

    pub fn is_dynamic(&self) -> bool {
        self.config.pie
            || self.config.shared
            || self.config.dynamic_linker.is_some()
            || !self.dsos.is_empty()
    }

    pub fn image_base(&self) -> u64 {
        if self.config.pie || self.config.shared {
            0
        } else {
            0x200000
        }
    }

    pub fn has_chunk(&self, id: ChunkId) -> bool {
        self.chunks.contains(&id)
    }

    pub fn chunk_header(&self, id: ChunkId) -> &ChunkHeader {
        match id {
            ChunkId::Ehdr => &self.ehdr.hdr,
            ChunkId::Phdr => &self.phdr.hdr,
            ChunkId::Shdr => &self.shdr.hdr,
            ChunkId::Interp => &self.interp.hdr,
            ChunkId::Got => &self.got.hdr,
            ChunkId::GotPlt => &self.gotplt.hdr,
            ChunkId::Plt => &self.plt.hdr,
            ChunkId::RelDyn => &self.reldyn.hdr,
            ChunkId::RelPlt => &self.relplt.hdr,
            ChunkId::Dynamic => &self.dynamic.hdr,
            ChunkId::Dynsym => &self.dynsym.hdr,
            ChunkId::Dynstr => &self.dynstr.hdr,
            ChunkId::Hash => &self.hash.hdr,
            ChunkId::Versym => &self.versym.hdr,
            ChunkId::Verneed => &self.verneed.hdr,
            ChunkId::Copyrel => &self.copyrel.hdr,
            ChunkId::BuildId => &self.buildid.hdr,
            ChunkId::Symtab => &self.symtab.hdr,
            ChunkId::Strtab => &self.strtab.hdr,
            ChunkId::Shstrtab => &self.shstrtab.hdr,
            ChunkId::EhFrame => &self.ehframe.hdr,
            ChunkId::Output(i) => &self.output_sections[i].hdr,
            ChunkId::Merged(i) => &self.merged_sections[i].hdr,
        }
    }

    pub fn chunk_header_mut(&mut self, id: ChunkId) -> &mut ChunkHeader {
        match id {
            ChunkId::Ehdr => &mut self.ehdr.hdr,
            ChunkId::Phdr => &mut self.phdr.hdr,
            ChunkId::Shdr => &mut self.shdr.hdr,
            ChunkId::Interp => &mut self.interp.hdr,
            ChunkId::Got => &mut self.got.hdr,
            ChunkId::GotPlt => &mut self.gotplt.hdr,
            ChunkId::Plt => &mut self.plt.hdr,
            ChunkId::RelDyn => &mut self.reldyn.hdr,
            ChunkId::RelPlt => &mut self.relplt.hdr,
            ChunkId::Dynamic => &mut self.dynamic.hdr,
            ChunkId::Dynsym => &mut self.dynsym.hdr,
            ChunkId::Dynstr => &mut self.dynstr.hdr,
            ChunkId::Hash => &mut self.hash.hdr,
            ChunkId::Versym => &mut self.versym.hdr,
            ChunkId::Verneed => &mut self.verneed.hdr,
            ChunkId::Copyrel => &mut self.copyrel.hdr,
            ChunkId::BuildId => &mut self.buildid.hdr,
            ChunkId::Symtab => &mut self.symtab.hdr,
            ChunkId::Strtab => &mut self.strtab.hdr,
            ChunkId::Shstrtab => &mut self.shstrtab.hdr,
            ChunkId::EhFrame => &mut self.ehframe.hdr,
            ChunkId::Output(i) => &mut self.output_sections[i].hdr,
            ChunkId::Merged(i) => &mut self.merged_sections[i].hdr,
        }
    }

    /// virtual address of an input section's slot in its output section
    pub fn isec_addr(&self, isec: usize) -> u64 {
        let isec = &self.input_sections[isec];
        self.output_sections[isec.output_section].hdr.shdr.sh_addr + isec.offset
    }

    /// resolved virtual address of a symbol
    pub fn sym_addr(&self, sym: usize) -> u64 {
        let s = &self.symbols.syms[sym];
        if s.has_copyrel {
            return self.copyrel.hdr.shdr.sh_addr + s.value;
        }
        if s.plt_idx != -1 && s.is_imported {
            return self.plt_addr(sym);
        }
        if let Some(isec) = s.input_section {
            return self.isec_addr(isec) + s.value;
        }
        s.value
    }

    pub fn got_addr(&self, sym: usize) -> u64 {
        let s = &self.symbols.syms[sym];
        assert!(s.got_idx != -1, "no GOT slot for {}", s.name);
        self.got.hdr.shdr.sh_addr + s.got_idx as u64 * GOT_SIZE
    }

    pub fn gotplt_addr(&self, sym: usize) -> u64 {
        let s = &self.symbols.syms[sym];
        assert!(s.gotplt_idx != -1, "no GOT.PLT slot for {}", s.name);
        self.gotplt.hdr.shdr.sh_addr + s.gotplt_idx as u64 * GOT_SIZE
    }

    pub fn plt_addr(&self, sym: usize) -> u64 {
        let s = &self.symbols.syms[sym];
        assert!(s.plt_idx != -1, "no PLT entry for {}", s.name);
        self.plt.hdr.shdr.sh_addr + s.plt_idx as u64 * PLT_SIZE
    }

    pub fn tlsgd_addr(&self, sym: usize) -> u64 {
        let s = &self.symbols.syms[sym];
        assert!(s.tlsgd_idx != -1, "no TLSGD slot for {}", s.name);
        self.got.hdr.shdr.sh_addr + s.tlsgd_idx as u64 * GOT_SIZE
    }

    pub fn gottpoff_addr(&self, sym: usize) -> u64 {
        let s = &self.symbols.syms[sym];
        assert!(s.gottpoff_idx != -1, "no GOTTPOFF slot for {}", s.name);
        self.got.hdr.shdr.sh_addr + s.gottpoff_idx as u64 * GOT_SIZE
    }

    pub fn tlsld_addr(&self) -> u64 {
        assert!(self.got.tlsld_idx != -1, "no TLSLD slot allocated");
        self.got.hdr.shdr.sh_addr + self.got.tlsld_idx as u64 * GOT_SIZE
    }

    /// section index for a defined symbol's home section
    pub fn sym_shndx(&self, sym: usize) -> u16 {
        let s = &self.symbols.syms[sym];
        if s.has_copyrel {
            return self.copyrel.hdr.shndx as u16;
        }
        if s.is_imported || s.esym.undefined {
            return 0;
        }
        match s.input_section {
            Some(isec) => {
                let osec = self.input_sections[isec].output_section;
                self.output_sections[osec].hdr.shndx as u16
            }
            None => SHN_ABS,
        }
    }

    /// symtab/dynsym record for a symbol; TLS values are TP-relative
    pub fn to_elf_sym(&self, sym: usize, st_name: u32) -> elf::Sym {
        let s = &self.symbols.syms[sym];
        let mut esym = elf::Sym {
            st_name,
            st_info: (s.esym.st_bind << 4) | (s.esym.st_type & 0xf),
            st_other: 0,
            st_shndx: self.sym_shndx(sym),
            st_value: 0,
            st_size: s.esym.st_size,
        };
        if s.has_copyrel {
            esym.st_value = self.sym_addr(sym);
        } else if s.is_imported || s.esym.undefined {
            esym.st_value = 0;
        } else if s.esym.st_type == STT_TLS {
            esym.st_value = self.sym_addr(sym) - self.tls_begin;
        } else {
            esym.st_value = self.sym_addr(sym);
        }
        esym
    }
}

impl ObjectFile {
    /// size this file's slices of .symtab and .strtab
    pub fn compute_symtab(&mut self, symbols: &SymbolTable) {
        self.strtab_size = 0;
        self.local_symtab_size = 0;
        self.global_symtab_size = 0;
        for &id in &self.syms {
            let sym = &symbols.syms[id];
            self.strtab_size += sym.name.len() as u64 + 1;
            if sym.is_local() {
                self.local_symtab_size += elf::SYM_SIZE;
            } else {
                self.global_symtab_size += elf::SYM_SIZE;
            }
        }
    }

    /// emit this file's symbols into its symtab and strtab slices
    pub fn write_symtab(&self, ctx: &Context, locals: &mut [u8], globals: &mut [u8], names: &mut [u8]) {
        let mut locals = elf::Cursor::new(locals);
        let mut globals = elf::Cursor::new(globals);
        let mut names_cur = elf::Cursor::new(names);
        for &id in &self.syms {
            let sym = &ctx.symbols.syms[id];
            let st_name = self.strtab_offset as u32 + names_cur.pos() as u32;
            names_cur.write(sym.name.as_bytes());
            names_cur.write_u8(0);
            let esym = ctx.to_elf_sym(id, st_name);
            if sym.is_local() {
                elf::write_sym(&mut locals, &esym);
            } else {
                elf::write_sym(&mut globals, &esym);
            }
        }
    }
}
