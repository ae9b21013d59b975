use crate::chunks::{self, ChunkId, ChunkKind, DynsymSection, EhFrameSection, SymtabSection};
use crate::context::Context;
use crate::elf;
use crate::input;
use crate::layout;
use crate::opt::{ObjectFileOpt, Opt};
use anyhow::{anyhow, Context as _};
use log::{info, warn};
use object::elf::{SHF_EXECINSTR, SHF_WRITE, SHT_NOTE};
use rayon::prelude::*;
use std::os::unix::fs::PermissionsExt;
use typed_arena::Arena;

/// decide which chunks appear in the output, in layout order
pub fn assemble_chunks(ctx: &mut Context) {
    let mut chunks = vec![ChunkId::Ehdr, ChunkId::Phdr];

    if ctx.is_dynamic() && ctx.config.dynamic_linker.is_some() {
        chunks.push(ChunkId::Interp);
    }
    if ctx.config.build_id {
        chunks.push(ChunkId::BuildId);
    }
    for i in 0..ctx.output_sections.len() {
        if !ctx.output_sections[i].members.is_empty() {
            chunks.push(ChunkId::Output(i));
        }
    }
    for i in 0..ctx.merged_sections.len() {
        if !ctx.merged_sections[i].map.is_empty() {
            chunks.push(ChunkId::Merged(i));
        }
    }
    if !ctx.ehframe.members.is_empty() {
        chunks.push(ChunkId::EhFrame);
    }
    if ctx.got.hdr.shdr.sh_size > 0 {
        chunks.push(ChunkId::Got);
    }
    if !ctx.plt.symbols.is_empty() {
        chunks.push(ChunkId::Plt);
    }
    if ctx.is_dynamic() {
        chunks.push(ChunkId::GotPlt);
        chunks.push(ChunkId::RelDyn);
        chunks.push(ChunkId::RelPlt);
        chunks.push(ChunkId::Dynamic);
        chunks.push(ChunkId::Dynsym);
        chunks.push(ChunkId::Dynstr);
        chunks.push(ChunkId::Hash);
    }
    if !ctx.versym.contents.is_empty() {
        chunks.push(ChunkId::Versym);
    }
    if !ctx.verneed.contents.is_empty() {
        chunks.push(ChunkId::Verneed);
    }
    if ctx.copyrel.hdr.shdr.sh_size > 0 {
        chunks.push(ChunkId::Copyrel);
    }
    chunks.push(ChunkId::Symtab);
    chunks.push(ChunkId::Strtab);
    chunks.push(ChunkId::Shstrtab);
    chunks.push(ChunkId::Shdr);

    chunks.sort_by_key(|&id| chunk_rank(ctx, id));
    ctx.chunks = chunks;

    // .dynstr strings referenced by the dynamic section must exist
    // before its first size computation
    if ctx.has_chunk(ChunkId::Dynamic) {
        let rpaths = ctx.config.rpaths.clone();
        ctx.dynstr.add_string(&rpaths);
        let sonames: Vec<String> = ctx.dsos.iter().map(|dso| dso.soname.clone()).collect();
        for soname in sonames {
            ctx.dynstr.add_string(&soname);
        }
    }
}

/// layout precondition: every SHF_ALLOC chunk sorts before all
/// non-alloc chunks, and TLS chunks form one contiguous run
fn chunk_rank(ctx: &Context, id: ChunkId) -> u32 {
    match id {
        ChunkId::Ehdr => 0,
        ChunkId::Phdr => 1,
        ChunkId::Interp => 2,
        ChunkId::Shdr => u32::MAX,
        _ => {
            let hdr = ctx.chunk_header(id);
            if !hdr.is_alloc() {
                return 1000;
            }
            if hdr.shdr.sh_type == SHT_NOTE {
                return 10;
            }
            let writable = hdr.shdr.sh_flags & SHF_WRITE as u64 != 0;
            let exec = hdr.shdr.sh_flags & SHF_EXECINSTR as u64 != 0;
            if !writable && !exec {
                20
            } else if exec {
                30
            } else if hdr.is_tls() {
                if hdr.is_nobits() {
                    41
                } else {
                    40
                }
            } else if !hdr.is_nobits() {
                50
            } else {
                60
            }
        }
    }
}

fn assign_section_indices(ctx: &mut Context) {
    let mut shndx = 1;
    for id in ctx.chunks.clone() {
        let hdr = ctx.chunk_header_mut(id);
        if hdr.kind != ChunkKind::Header {
            hdr.shndx = shndx;
            shndx += 1;
        }
    }
}

/// run the size/link, layout and emit passes and return the image
pub fn emit_output(ctx: &mut Context) -> Vec<u8> {
    assemble_chunks(ctx);
    DynsymSection::sort_symbols(ctx);
    EhFrameSection::finalize_contents(ctx);
    layout::set_isec_offsets(ctx);
    assign_section_indices(ctx);

    for id in ctx.chunks.clone() {
        chunks::update_shdr(ctx, id);
    }

    let filesize = layout::set_osec_offsets(ctx);
    layout::compute_tls_bounds(ctx);
    layout::define_special_symbols(ctx);
    info!("Output layout frozen at {} bytes", filesize);

    let mut buf = vec![0u8; filesize as usize];
    emit(ctx, &mut buf);

    // the content hash goes in last, over the otherwise-final image
    if ctx.has_chunk(ChunkId::BuildId) {
        ctx.buildid.write_buildid(&mut buf, filesize);
    }
    buf
}

enum EmitJob<'b> {
    Chunk(ChunkId, &'b mut [u8]),
    Symtab {
        symtab: &'b mut [u8],
        strtab: &'b mut [u8],
    },
}

/// emit every chunk into its own slice of the output buffer, in parallel
pub fn emit(ctx: &Context, buf: &mut [u8]) {
    let mut list: Vec<(ChunkId, u64, u64)> = ctx
        .chunks
        .iter()
        .filter(|&&id| !ctx.chunk_header(id).is_nobits())
        .map(|&id| {
            let shdr = &ctx.chunk_header(id).shdr;
            (id, shdr.sh_offset, shdr.sh_size)
        })
        .collect();
    list.sort_by_key(|&(_, offset, _)| offset);

    let ranges: Vec<(u64, u64)> = list.iter().map(|&(_, offset, size)| (offset, size)).collect();
    let slices = elf::carve(buf, &ranges);

    // object files write symbol names into .strtab while emitting their
    // .symtab entries, so both slices belong to one job
    let mut pairs: Vec<(ChunkId, &mut [u8])> = list
        .iter()
        .map(|&(id, _, _)| id)
        .zip(slices)
        .collect();
    let mut strtab_slice = pairs
        .iter()
        .position(|&(id, _)| id == ChunkId::Strtab)
        .map(|i| pairs.remove(i).1);

    let mut jobs = vec![];
    for (id, slice) in pairs {
        if id == ChunkId::Symtab {
            jobs.push(EmitJob::Symtab {
                symtab: slice,
                strtab: strtab_slice.take().unwrap(),
            });
        } else {
            jobs.push(EmitJob::Chunk(id, slice));
        }
    }

    jobs.into_par_iter().for_each(|job| match job {
        EmitJob::Chunk(id, slice) => chunks::copy_buf(ctx, id, slice),
        EmitJob::Symtab { symtab, strtab } => SymtabSection::copy_buf(ctx, symtab, strtab),
    });
}

/// Do the actual linking
pub fn link(opt: &Opt) -> anyhow::Result<()> {
    info!("Link with options: {opt:?}");

    let opt = input::path_resolution(opt)?;
    info!("Options after path resolution: {opt:?}");

    let arena = Arena::new();
    let mut inputs: Vec<(String, &[u8])> = vec![];
    for obj_file in &opt.obj_file {
        match obj_file {
            ObjectFileOpt::File(file_opt) => {
                info!("Reading {}", file_opt.name);
                let content = std::fs::read(&file_opt.name)
                    .context(format!("Reading file {}", file_opt.name))?;
                inputs.push((file_opt.name.clone(), arena.alloc_extend(content)));
            }
            ObjectFileOpt::Library(_) => unreachable!("Path resolution is not working"),
            ObjectFileOpt::StartGroup => warn!("--start-group unhandled"),
            ObjectFileOpt::EndGroup => warn!("--end-group unhandled"),
        }
    }

    let output = opt
        .output
        .clone()
        .ok_or(anyhow!("Missing output file name"))?;

    let mut ctx = Context::new(opt);
    input::parse_files(&mut ctx, &inputs)?;
    input::scan_relocations(&mut ctx);

    let buf = emit_output(&mut ctx);

    // done, save to file
    info!("Writing to executable {:?}", output);
    std::fs::write(&output, buf)?;

    // make executable
    let mut perms = std::fs::metadata(&output)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&output, perms)?;

    Ok(())
}
