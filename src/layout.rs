//! the layout pass: freeze file offsets and virtual addresses
//!
//! Runs after the size/link pass. The phdr builder has already marked
//! which chunks open a PT_LOAD; those start on a fresh page so file
//! offsets and addresses stay congruent modulo the page size.

use crate::context::Context;
use crate::{align_to, PAGE_SIZE};

/// assign each input section its slot within its output section and
/// size the output sections accordingly
pub fn set_isec_offsets(ctx: &mut Context) {
    for osec in 0..ctx.output_sections.len() {
        let members = ctx.output_sections[osec].members.clone();
        let mut offset = 0u64;
        let mut align = 1u64;
        for &isec in &members {
            let sec = &mut ctx.input_sections[isec];
            let sec_align = sec.sh_addralign.max(1);
            offset = align_to(offset, sec_align);
            sec.offset = offset;
            offset += sec.sh_size;
            align = align.max(sec_align);
        }
        let shdr = &mut ctx.output_sections[osec].hdr.shdr;
        shdr.sh_size = offset;
        shdr.sh_addralign = shdr.sh_addralign.max(align);
    }
}

/// walk the chunk list assigning `sh_offset` and `sh_addr`; returns the
/// final file size
pub fn set_osec_offsets(ctx: &mut Context) -> u64 {
    let mut fileoff = 0u64;
    let mut vaddr = ctx.image_base();

    for id in ctx.chunks.clone() {
        let hdr = ctx.chunk_header_mut(id);
        let align = hdr.shdr.sh_addralign.max(1);

        if hdr.starts_new_ptload {
            fileoff = align_to(fileoff, PAGE_SIZE);
            vaddr = align_to(vaddr, PAGE_SIZE);
        }
        fileoff = align_to(fileoff, align);
        vaddr = align_to(vaddr, align);

        hdr.shdr.sh_offset = fileoff;
        if hdr.is_alloc() {
            hdr.shdr.sh_addr = vaddr;
        }

        // .tbss occupies address space only as a TLS template; the next
        // chunk may reuse its addresses
        if hdr.is_nobits() && hdr.is_tls() {
            continue;
        }
        if !hdr.is_nobits() {
            fileoff += hdr.shdr.sh_size;
        }
        if hdr.is_alloc() {
            vaddr += hdr.shdr.sh_size;
        }
    }

    fileoff
}

/// record the virtual-address bounds of the TLS image
pub fn compute_tls_bounds(ctx: &mut Context) {
    let mut begin = u64::MAX;
    let mut end = 0u64;
    let mut align = 1u64;
    for &id in &ctx.chunks {
        let hdr = ctx.chunk_header(id);
        if hdr.is_tls() {
            begin = begin.min(hdr.shdr.sh_addr);
            end = end.max(hdr.shdr.sh_addr + hdr.shdr.sh_size);
            align = align.max(hdr.shdr.sh_addralign);
        }
    }
    if begin != u64::MAX {
        ctx.tls_begin = begin;
        ctx.tls_end = align_to(end, align);
    }
}

/// pin the init/fini array boundary symbols to their sections
pub fn define_special_symbols(ctx: &mut Context) {
    for (section, start, end) in [
        (".init_array", "__init_array_start", "__init_array_end"),
        (".fini_array", "__fini_array_start", "__fini_array_end"),
    ] {
        let bounds = ctx
            .chunks
            .iter()
            .map(|&id| ctx.chunk_header(id))
            .find(|hdr| hdr.name == section)
            .map(|hdr| (hdr.shdr.sh_addr, hdr.shdr.sh_addr + hdr.shdr.sh_size));
        if let Some((lo, hi)) = bounds {
            let start = ctx.symbols.intern(start);
            ctx.symbols.syms[start].value = lo;
            let end = ctx.symbols.intern(end);
            ctx.symbols.syms[end].value = hi;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::{ChunkId, OutputSectionRegistry};
    use crate::opt::Opt;
    use object::elf::{SHF_ALLOC, SHF_TLS, SHF_WRITE, SHT_NOBITS, SHT_PROGBITS};

    #[test]
    fn test_ptload_page_alignment() {
        let mut ctx = Context::new(Opt::default());
        ctx.chunks = vec![ChunkId::Ehdr, ChunkId::Phdr, ChunkId::Plt];
        ctx.phdr.hdr.shdr.sh_size = 56 * 3;
        ctx.plt.hdr.shdr.sh_size = 32;
        ctx.plt.hdr.starts_new_ptload = true;

        let filesize = set_osec_offsets(&mut ctx);
        assert_eq!(ctx.ehdr.hdr.shdr.sh_offset, 0);
        assert_eq!(ctx.ehdr.hdr.shdr.sh_addr, 0x200000);
        assert_eq!(ctx.phdr.hdr.shdr.sh_offset, 64);
        assert_eq!(ctx.plt.hdr.shdr.sh_offset, 4096);
        assert_eq!(ctx.plt.hdr.shdr.sh_addr, 0x201000);
        assert_eq!(filesize, 4096 + 32);
    }

    // .tbss is only a TLS template: the chunk after it starts at the
    // same address and file offset
    #[test]
    fn test_tbss_address_space_is_reused() {
        let mut ctx = Context::new(Opt::default());
        let reg = OutputSectionRegistry::default();
        let tbss = reg.get_instance(
            ".tbss",
            SHT_NOBITS,
            (SHF_ALLOC | SHF_WRITE | SHF_TLS) as u64,
        );
        let data = reg.get_instance(".data", SHT_PROGBITS, (SHF_ALLOC | SHF_WRITE) as u64);
        ctx.output_sections = reg.into_instances();
        ctx.output_sections[tbss].hdr.shdr.sh_size = 0x100;
        ctx.output_sections[tbss].hdr.shdr.sh_addralign = 8;
        ctx.output_sections[data].hdr.shdr.sh_size = 0x10;
        ctx.output_sections[data].hdr.shdr.sh_addralign = 8;
        ctx.chunks = vec![ChunkId::Output(tbss), ChunkId::Output(data)];

        let filesize = set_osec_offsets(&mut ctx);
        let tbss_shdr = &ctx.output_sections[tbss].hdr.shdr;
        let data_shdr = &ctx.output_sections[data].hdr.shdr;
        assert_eq!(data_shdr.sh_addr, tbss_shdr.sh_addr);
        assert_eq!(data_shdr.sh_offset, tbss_shdr.sh_offset);
        assert_eq!(filesize, data_shdr.sh_offset + 0x10);
    }

    #[test]
    fn test_nobits_does_not_advance_file_offset() {
        let mut ctx = Context::new(Opt::default());
        ctx.chunks = vec![ChunkId::Got, ChunkId::Copyrel, ChunkId::Shstrtab];
        ctx.got.hdr.shdr.sh_size = 24;
        ctx.got.hdr.starts_new_ptload = true;
        ctx.copyrel.hdr.shdr.sh_size = 100;
        ctx.shstrtab.hdr.shdr.sh_size = 10;

        set_osec_offsets(&mut ctx);
        let bss_off = ctx.copyrel.hdr.shdr.sh_offset;
        // .shstrtab packs right after .bss's file position
        assert_eq!(ctx.shstrtab.hdr.shdr.sh_offset, bss_off);
        // but .bss still owns 100 bytes of address space
        assert_eq!(
            ctx.copyrel.hdr.shdr.sh_addr + 100,
            ctx.got.hdr.shdr.sh_addr + 32 + 100
        );
    }
}
