//! input consumption: turn relocatable objects into core inputs
//!
//! Sections are interned through the output-section registries, symbols
//! land in the symbol registry, and a compact relocation scan turns
//! references into GOT/PLT/copy-relocation requests.

use crate::chunks::{MergedSectionRegistry, OutputSectionRegistry};
use crate::context::{Context, InputSym, ObjectFile, Reloc, RelocTarget, SharedFile};
use crate::opt::{FileOpt, ObjectFileOpt, Opt};
use anyhow::{anyhow, Context as _};
use log::{info, warn};
use object::elf::{
    R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_GOTPCREL, R_X86_64_GOTPCRELX,
    R_X86_64_GOTTPOFF, R_X86_64_PLT32, R_X86_64_REX_GOTPCRELX, R_X86_64_TLSGD, R_X86_64_TLSLD,
    SHF_ALLOC, SHF_MERGE, SHF_STRINGS, SHT_NOBITS, SHT_NOTE, SHT_PROGBITS, STB_GLOBAL, STB_LOCAL,
    STB_WEAK, STT_FUNC, STT_NOTYPE, STT_OBJECT, STT_TLS,
};
use object::{Object, ObjectSection, ObjectSymbol, SectionKind, SymbolKind};
use std::path::PathBuf;

fn lookup_file(name: &str, paths: &Vec<String>) -> anyhow::Result<PathBuf> {
    for path in paths {
        let mut p = PathBuf::from(path);
        p.push(name);
        if p.is_file() {
            info!("File {name} is found at {}", p.display());
            return Ok(p);
        }
    }
    Err(anyhow!("File {name} cannot be found"))
}

/// Resolve library namespec to paths
pub fn path_resolution(opt: &Opt) -> anyhow::Result<Opt> {
    // resolve library to actual files
    let mut opt = opt.clone();
    for obj_file in &mut opt.obj_file {
        // convert ObjectFileOpt::Library to ObjectFileOpt::File
        if let ObjectFileOpt::Library(lib) = obj_file {
            if !lib.link_static {
                // lookup dynamic library first
                let path = format!("lib{}.so", lib.name);
                if let Ok(path) = lookup_file(&path, &opt.search_dir) {
                    *obj_file = ObjectFileOpt::File(FileOpt {
                        name: format!("{}", path.display()),
                        as_needed: lib.as_needed,
                    });
                    continue;
                }
            }

            // lookup static library
            let path = format!("lib{}.a", lib.name);
            let path = lookup_file(&path, &opt.search_dir)?;
            *obj_file = ObjectFileOpt::File(FileOpt {
                name: format!("{}", path.display()),
                as_needed: lib.as_needed,
            });
            continue;
        }
    }
    Ok(opt)
}

fn to_sh_type(kind: SectionKind) -> u32 {
    match kind {
        SectionKind::UninitializedData | SectionKind::UninitializedTls => SHT_NOBITS,
        SectionKind::Note => SHT_NOTE,
        _ => SHT_PROGBITS,
    }
}

fn to_input_sym<'a>(sym: &impl ObjectSymbol<'a>) -> InputSym {
    let st_bind = if sym.is_weak() {
        STB_WEAK
    } else if sym.is_global() {
        STB_GLOBAL
    } else {
        STB_LOCAL
    };
    let st_type = match sym.kind() {
        SymbolKind::Text => STT_FUNC,
        SymbolKind::Data => STT_OBJECT,
        SymbolKind::Tls => STT_TLS,
        _ => STT_NOTYPE,
    };
    InputSym {
        st_bind,
        st_type,
        st_size: sym.size(),
        undefined: sym.is_undefined(),
    }
}

/// parse object files and shared dependencies into the context
pub fn parse_files<'a>(ctx: &mut Context<'a>, inputs: &[(String, &'a [u8])]) -> anyhow::Result<()> {
    let osec_registry = OutputSectionRegistry::default();
    let merged_registry = MergedSectionRegistry::default();
    // (osec, isec) memberships and (merged, data) contributions, applied
    // once the registries are frozen
    let mut members: Vec<(usize, usize)> = vec![];
    let mut mergeables: Vec<(usize, &'a [u8])> = vec![];

    let mut objs = vec![];
    for (name, content) in inputs {
        info!("Parsing {}", name);
        if name.ends_with(".a") {
            // archive
            let ar = object::read::archive::ArchiveFile::parse(*content)
                .context(format!("Parsing file {} as archive", name))?;
            for member in ar.members() {
                let member = member?;
                let member_name = format!("{}/{}", name, std::str::from_utf8(member.name())?);
                info!("Parsing {}", member_name);
                let obj = object::File::parse(member.data(*content)?)
                    .context(format!("Parsing file {} as object", member_name))?;
                objs.push((member_name, obj));
            }
        } else {
            let obj = object::File::parse(*content)
                .context(format!("Parsing file {} as object", name))?;
            objs.push((name.clone(), obj));
        }
    }

    for (name, obj) in objs {
        let elf = match obj {
            object::File::Elf64(elf) => elf,
            _ => return Err(anyhow!("Unsupported format of file {}", name)),
        };

        if elf.kind() == object::ObjectKind::Dynamic {
            parse_shared(ctx, &name, &elf)?;
            continue;
        }

        let file_idx = ctx.objs.len();
        ctx.objs.push(ObjectFile {
            name: name.clone(),
            ..Default::default()
        });

        // input section index => InputSection id
        let mut isec_of_shndx = std::collections::BTreeMap::new();

        for section in elf.sections() {
            let sec_name = section.name()?;
            if sec_name.is_empty() {
                continue;
            }
            let sh_flags = match section.flags() {
                object::SectionFlags::Elf { sh_flags } => sh_flags,
                _ => unreachable!(),
            };
            if sh_flags & SHF_ALLOC as u64 == 0 {
                // non-alloc, skip
                continue;
            }
            let sh_type = to_sh_type(section.kind());
            info!("Handling section {} from {}", sec_name, name);

            let merge_strings = (SHF_MERGE | SHF_STRINGS) as u64;
            if sh_type == SHT_PROGBITS && sh_flags & merge_strings == merge_strings {
                let merged = merged_registry.get_instance(sec_name, sh_type, sh_flags);
                mergeables.push((merged, section.data()?));
                continue;
            }

            let data = if sh_type == SHT_NOBITS {
                &[][..]
            } else {
                section.data()?
            };
            let isec_id = ctx.input_sections.len();
            let mut relocs = vec![];
            for (offset, relocation) in section.relocations() {
                let r_type = match relocation.flags() {
                    object::RelocationFlags::Elf { r_type } => r_type,
                    _ => unreachable!(),
                };
                let target = match relocation.target() {
                    object::RelocationTarget::Symbol(symbol_id) => {
                        let symbol = elf.symbol_by_index(symbol_id)?;
                        if symbol.kind() == SymbolKind::Section {
                            let section_index = symbol.section_index().unwrap();
                            RelocTarget::Section(section_index.0)
                        } else {
                            RelocTarget::Symbol(ctx.symbols.intern(symbol.name()?))
                        }
                    }
                    _ => return Err(anyhow!("Unsupported relocation target in {}", name)),
                };
                relocs.push(Reloc {
                    offset,
                    r_type,
                    target,
                    addend: relocation.addend(),
                });
            }

            let eh_frame = sec_name == ".eh_frame";
            let output_section = if eh_frame {
                usize::MAX
            } else {
                osec_registry.get_instance(sec_name, sh_type, sh_flags)
            };
            ctx.input_sections.push(crate::context::InputSection {
                file: file_idx,
                name: sec_name.to_string(),
                sh_type,
                sh_flags,
                sh_size: section.size(),
                sh_addralign: section.align(),
                data,
                output_section,
                offset: 0,
                relocs,
            });
            isec_of_shndx.insert(section.index().0, isec_id);
            if eh_frame {
                ctx.ehframe.members.push(isec_id);
            } else {
                members.push((output_section, isec_id));
            }
            ctx.objs[file_idx].sections.push(isec_id);
        }

        // section-targeted relocations recorded raw section indices;
        // rewrite them to InputSection ids now that all are known
        for &isec_id in &ctx.objs[file_idx].sections {
            for reloc in &mut ctx.input_sections[isec_id].relocs {
                if let RelocTarget::Section(shndx) = reloc.target {
                    let target = isec_of_shndx
                        .get(&shndx)
                        .copied()
                        .ok_or(anyhow!("Relocation against discarded section in {}", name))?;
                    reloc.target = RelocTarget::Section(target);
                }
            }
        }

        // skip the first symbol which is null
        for symbol in elf.symbols().skip(1) {
            if symbol.is_undefined() || symbol.kind() == SymbolKind::Section {
                if symbol.is_undefined() && !symbol.name()?.is_empty() {
                    let id = ctx.symbols.intern(symbol.name()?);
                    let sym = &mut ctx.symbols.syms[id];
                    if sym.input_section.is_none() {
                        sym.esym.undefined = true;
                    }
                }
                continue;
            }
            let sym_name = symbol.name()?;
            match symbol.section() {
                object::SymbolSection::Section(section_index) => {
                    let Some(&isec) = isec_of_shndx.get(&section_index.0) else {
                        continue;
                    };
                    if ctx.input_sections[isec].output_section == usize::MAX {
                        continue;
                    }
                    info!("Defining symbol {} from {}", sym_name, name);
                    let id = ctx.symbols.intern(sym_name);
                    let sym = &mut ctx.symbols.syms[id];
                    sym.value = symbol.address();
                    sym.input_section = Some(isec);
                    sym.esym = to_input_sym(&symbol);
                    ctx.objs[file_idx].syms.push(id);
                }
                _ => continue,
            }
        }
    }

    // freeze the registries into the context
    ctx.output_sections = osec_registry.into_instances();
    for (osec, isec) in members {
        ctx.output_sections[osec].members.push(isec);
    }

    ctx.merged_sections = merged_registry.into_instances();
    let mut merged_offsets = vec![0u64; ctx.merged_sections.len()];
    for (merged, data) in mergeables {
        let sec = &mut ctx.merged_sections[merged];
        let member = sec.add_member();
        sec.members[member].offset = merged_offsets[merged];
        merged_offsets[merged] += data.len() as u64;
        // split into NUL-terminated pieces; identical pieces coalesce
        // onto their first occurrence
        let mut pos = 0;
        while pos < data.len() {
            let end = data[pos..]
                .iter()
                .position(|&b| b == 0)
                .map(|i| pos + i + 1)
                .unwrap_or(data.len());
            sec.insert(&data[pos..end], member, pos as u64);
            pos = end;
        }
    }

    for file in &mut ctx.objs {
        file.compute_symtab(&ctx.symbols);
    }

    Ok(())
}

/// record a shared dependency and import its exported symbols
fn parse_shared(
    ctx: &mut Context,
    name: &str,
    elf: &object::read::elf::ElfFile64,
) -> anyhow::Result<()> {
    let soname = PathBuf::from(name)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    info!("Adding shared dependency {} ({})", name, soname);

    for symbol in elf.dynamic_symbols() {
        if symbol.is_undefined() || !symbol.is_global() {
            continue;
        }
        let id = ctx.symbols.intern(symbol.name()?);
        let sym = &mut ctx.symbols.syms[id];
        if sym.input_section.is_some() {
            // an object definition wins over the shared library
            continue;
        }
        sym.is_imported = true;
        sym.esym = to_input_sym(&symbol);
        sym.esym.undefined = false;
    }

    ctx.dsos.push(SharedFile {
        name: name.to_string(),
        soname,
    });
    Ok(())
}

/// decide which symbols need GOT/PLT/copy-relocation/TLS entries
pub fn scan_relocations(ctx: &mut Context) {
    enum Request {
        Plt,
        Got,
        Copyrel,
        Tlsgd,
        Tlsld,
        Gottpoff,
    }
    let mut requests = vec![];

    for isec in &ctx.input_sections {
        for reloc in &isec.relocs {
            let RelocTarget::Symbol(sym) = reloc.target else {
                continue;
            };
            match reloc.r_type {
                R_X86_64_PLT32 => {
                    if ctx.symbols.syms[sym].is_imported {
                        requests.push((Request::Plt, sym));
                    }
                }
                R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
                    requests.push((Request::Got, sym));
                }
                R_X86_64_64 | R_X86_64_32 | R_X86_64_32S => {
                    let s = &ctx.symbols.syms[sym];
                    if s.is_imported && s.esym.st_type != STT_FUNC {
                        requests.push((Request::Copyrel, sym));
                    }
                }
                R_X86_64_TLSGD => requests.push((Request::Tlsgd, sym)),
                R_X86_64_TLSLD => requests.push((Request::Tlsld, sym)),
                R_X86_64_GOTTPOFF => requests.push((Request::Gottpoff, sym)),
                _ => {}
            }
        }
    }

    for (request, sym) in requests {
        let (plt_idx, got_idx, tlsgd_idx, gottpoff_idx, has_copyrel) = {
            let s = &ctx.symbols.syms[sym];
            (s.plt_idx, s.got_idx, s.tlsgd_idx, s.gottpoff_idx, s.has_copyrel)
        };
        match request {
            Request::Plt if plt_idx == -1 => ctx.add_plt_symbol(sym),
            Request::Got if got_idx == -1 => {
                ctx.add_got_symbol(sym);
                if ctx.symbols.syms[sym].is_imported {
                    ctx.add_dynsym_symbol(sym);
                }
            }
            Request::Copyrel if !has_copyrel => ctx.add_copyrel_symbol(sym),
            Request::Tlsgd if tlsgd_idx == -1 => ctx.add_tlsgd_symbol(sym),
            Request::Tlsld => ctx.add_tlsld(),
            Request::Gottpoff if gottpoff_idx == -1 => {
                ctx.add_gottpoff_symbol(sym);
                if ctx.symbols.syms[sym].is_imported {
                    ctx.add_dynsym_symbol(sym);
                }
            }
            _ => {}
        }
    }

    // anything still undefined resolves through the dynamic loader or
    // stays weakly zero
    let undefined: Vec<String> = ctx
        .symbols
        .syms
        .iter()
        .filter(|s| s.esym.undefined && !s.is_imported)
        .map(|s| s.name.clone())
        .collect();
    for name in undefined {
        warn!("undefined symbol: {}", name);
    }
}
