//! ELF image loading and the module lifecycle.
//!
//! A module moves through the states mapped → relocated → initialized.
//! `dlopen` with `NOW` drives all three before it returns; with `LAZY`
//! the module stays merely mapped until the first `dlsym` that reaches
//! it. `dlclose` walks the states backwards once the reference count
//! drops to zero.

use crate::arch::{
    EHDR_SIZE, EXIDX_ENTRY_SIZE, ElfDyn, ElfPhdr, ElfShdr, ElfSym, PAGE_SIZE, PHDR_SIZE,
    PT_ARM_EXIDX, SHDR_SIZE, align_down, align_up,
};
use crate::error::{
    Result, alloc_error, find_symbol_error, invalid_argument_error, parse_elf_error,
    unknown_handle_error,
};
use crate::kernel::{Kernel, ProtClass};
use crate::lookup::{reverse_lookup_sym, sym_name};
use crate::module::{Dso, HEAD_ID, Handle, ModFlags, OpenFlags, Segment};
use crate::object::{ElfFile, ElfObject};
use crate::reloc::RelocView;
use crate::{DlInfo, Rtld};
use core::ptr::null;
use elf::abi::{EI_NIDENT, EM_ARM, ET_DYN, PT_DYNAMIC, PT_LOAD};
use elf::endian::LittleEndian;
use elf::file::{Class, FileHeader, parse_ident};
use log::debug;

struct ElfHeader {
    ehdr: FileHeader<LittleEndian>,
}

impl ElfHeader {
    fn new(data: &[u8]) -> Result<ElfHeader> {
        let ident_buf = &data[..EI_NIDENT];
        let tail_buf = &data[EI_NIDENT..EHDR_SIZE];
        let ident = parse_ident::<LittleEndian>(ident_buf)
            .map_err(|err| parse_elf_error(err.to_string()))?;
        let ehdr = FileHeader::parse_tail(ident, tail_buf)
            .map_err(|err| parse_elf_error(err.to_string()))?;
        Ok(ElfHeader { ehdr })
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.ehdr.e_type != ET_DYN {
            return Err(parse_elf_error(format!("`{name}` is not a shared library")));
        }
        if self.ehdr.e_machine != EM_ARM {
            return Err(parse_elf_error(format!("`{name}` is not an ARM image")));
        }
        if self.ehdr.class != Class::ELF32 {
            return Err(parse_elf_error(format!("`{name}` is not a 32-bit image")));
        }
        Ok(())
    }
}

fn parse_phdrs<'img>(image: &'img [u8], ehdr: &ElfHeader, name: &str) -> Result<&'img [ElfPhdr]> {
    let off = ehdr.ehdr.e_phoff as usize;
    let num = ehdr.ehdr.e_phnum as usize;
    let entsize = ehdr.ehdr.e_phentsize as usize;
    if entsize != PHDR_SIZE
        || (image.as_ptr() as usize + off) % align_of::<ElfPhdr>() != 0
        || off + num * PHDR_SIZE > image.len()
    {
        return Err(parse_elf_error(format!("`{name}` has malformed program headers")));
    }
    Ok(unsafe { core::slice::from_raw_parts(image.as_ptr().add(off).cast(), num) })
}

fn parse_shdrs<'img>(image: &'img [u8], ehdr: &ElfHeader, name: &str) -> Result<&'img [ElfShdr]> {
    let off = ehdr.ehdr.e_shoff as usize;
    let num = ehdr.ehdr.e_shnum as usize;
    let entsize = ehdr.ehdr.e_shentsize as usize;
    if entsize != SHDR_SIZE
        || (image.as_ptr() as usize + off) % align_of::<ElfShdr>() != 0
        || off + num * SHDR_SIZE > image.len()
    {
        return Err(parse_elf_error(format!("`{name}` has malformed section headers")));
    }
    Ok(unsafe { core::slice::from_raw_parts(image.as_ptr().add(off).cast(), num) })
}

/// NUL-terminated string at `off` in the image, if it is in bounds.
fn str_at(image: &[u8], off: usize) -> Option<&str> {
    let bytes = image.get(off..)?;
    let end = bytes.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&bytes[..end]).ok()
}

#[derive(Default)]
struct Sections {
    dynsym: Option<(u32, u32)>,
    dynstr: Option<u32>,
    hash: Option<u32>,
    init_array: Option<(u32, u32)>,
    fini_array: Option<(u32, u32)>,
}

fn find_sections(image: &[u8], shdrs: &[ElfShdr], shstrndx: usize, name: &str) -> Result<Sections> {
    let shstrtab = shdrs
        .get(shstrndx)
        .map(|shdr| shdr.sh_offset as usize)
        .ok_or_else(|| parse_elf_error(format!("`{name}` has malformed section headers")))?;

    let mut sections = Sections::default();
    for shdr in shdrs {
        let Some(sh_name) = str_at(image, shstrtab + shdr.sh_name as usize) else {
            continue;
        };
        match sh_name {
            ".dynsym" => {
                sections.dynsym = Some((
                    shdr.sh_addr,
                    (shdr.sh_size as usize / size_of::<ElfSym>()) as u32,
                ));
            }
            ".dynstr" => sections.dynstr = Some(shdr.sh_addr),
            // optional: without a hashtab, lookup falls back to a linear scan
            ".hash" => sections.hash = Some(shdr.sh_addr),
            ".init_array" => {
                sections.init_array = Some((shdr.sh_addr, (shdr.sh_size / 4) as u32));
            }
            ".fini_array" => {
                sections.fini_array = Some((shdr.sh_addr, (shdr.sh_size / 4) as u32));
            }
            ".text" => {
                // useful for attaching a debugger
                debug!("`{name}`: text section at image offset {:#x}", shdr.sh_addr);
            }
            _ => {}
        }
    }
    Ok(sections)
}

fn canonical_name(fname: &str) -> String {
    std::fs::canonicalize(fname)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| fname.to_string())
}

fn run_init(dso: &Dso) {
    if dso.init_array != 0 {
        debug!(
            "`{}`: init array {:#010x} has {} entries",
            dso.name, dso.init_array, dso.num_init
        );
        for i in 0..dso.num_init as usize {
            let entry = unsafe { ((dso.init_array + i * 4) as *const u32).read_unaligned() };
            if entry != 0 {
                let ctor: extern "C" fn() = unsafe { core::mem::transmute(entry as usize) };
                ctor();
            }
        }
    }
}

fn run_fini(dso: &mut Dso) {
    if dso.fini_array != 0 {
        debug!(
            "`{}`: fini array {:#010x} has {} entries",
            dso.name, dso.fini_array, dso.num_fini
        );
        for i in (0..dso.num_fini as usize).rev() {
            let entry = unsafe { ((dso.fini_array + i * 4) as *const u32).read_unaligned() };
            if entry != 0 {
                let dtor: extern "C" fn() = unsafe { core::mem::transmute(entry as usize) };
                dtor();
            }
        }
        // one-shot: a second teardown must not run these again
        dso.fini_array = 0;
        dso.num_fini = 0;
    }
    dso.flags.remove(ModFlags::INITIALIZED);
}

impl<K: Kernel> Rtld<K> {
    fn load_object<O: ElfObject>(&mut self, object: &mut O, modname: String) -> Result<Dso> {
        let file_size = match object.size() {
            Ok(size) => size,
            Err(err) => return Err(self.set_error(err)),
        };
        debug!("`{modname}`: total elf size is {file_size}");
        let mut image = vec![0u8; file_size];
        if let Err(err) = object.read(&mut image, 0) {
            return Err(self.set_error(err));
        }
        self.load_image(&image, modname)
    }

    fn load_image(&mut self, image: &[u8], modname: String) -> Result<Dso> {
        if image.len() < EHDR_SIZE {
            return Err(
                self.set_error(parse_elf_error(format!("`{modname}` is not a valid ELF file")))
            );
        }
        let ehdr = match ElfHeader::new(&image[..EHDR_SIZE]) {
            Ok(ehdr) => ehdr,
            Err(_) => {
                return Err(self.set_error(parse_elf_error(format!(
                    "`{modname}` is not a valid ELF file"
                ))));
            }
        };
        if let Err(err) = ehdr.validate(&modname) {
            return Err(self.set_error(err));
        }

        let phdrs = match parse_phdrs(image, &ehdr, &modname) {
            Ok(phdrs) => phdrs,
            Err(err) => return Err(self.set_error(err)),
        };
        let shdrs = match parse_shdrs(image, &ehdr, &modname) {
            Ok(shdrs) => shdrs,
            Err(err) => return Err(self.set_error(err)),
        };
        let sections =
            match find_sections(image, shdrs, ehdr.ehdr.e_shstrndx as usize, &modname) {
                Ok(sections) => sections,
                Err(err) => return Err(self.set_error(err)),
            };
        let (Some((dynsym_addr, num_dynsym)), Some(dynstr_addr)) =
            (sections.dynsym, sections.dynstr)
        else {
            return Err(
                self.set_error(parse_elf_error(format!("no symbol information in `{modname}`")))
            );
        };

        // total size = largest end of a load segment, rounded up to the
        // largest segment alignment
        let mut total = 0usize;
        let mut max_align = PAGE_SIZE;
        let mut num_segs = 0usize;
        let mut dynamic_vaddr = None;
        let mut exidx_phdr = None;
        for phdr in phdrs {
            match phdr.p_type {
                PT_LOAD if phdr.p_memsz > 0 => {
                    total = total.max(phdr.p_vaddr as usize + phdr.p_memsz as usize);
                    max_align = max_align.max(phdr.p_align as usize);
                    num_segs += 1;
                }
                PT_DYNAMIC => dynamic_vaddr = Some(phdr.p_vaddr as usize),
                PT_ARM_EXIDX => {
                    exidx_phdr = Some((
                        phdr.p_vaddr as usize,
                        (phdr.p_memsz as usize / EXIDX_ENTRY_SIZE) as u32,
                    ));
                }
                _ => {}
            }
        }
        let Some(dynamic_vaddr) = dynamic_vaddr else {
            return Err(self.set_error(parse_elf_error(format!(
                "`{modname}` doesn't have a DYNAMIC segment"
            ))));
        };
        let size = align_up(total, max_align);
        debug!("`{modname}`: reserving {size:#x} bytes; {num_segs} segs total");

        let Some(base) = self.vma.alloc(size) else {
            return Err(self.set_error(alloc_error(format!(
                "could not reserve {size:#x} bytes of address space for `{modname}`"
            ))));
        };

        let mut segs = Vec::with_capacity(num_segs);
        for phdr in phdrs {
            if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
                continue;
            }
            if let Err(err) = self.materialize_segment(base, phdr, image, &mut segs) {
                self.release_segments(&mut segs);
                self.vma.free(base);
                return Err(self.set_error(err));
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        let (exidx_vaddr, num_exidx) = exidx_phdr.unwrap_or((0, 0));
        let dso = Dso {
            id,
            name: modname,
            flags: ModFlags::MAPPED,
            refcount: 0,
            base,
            size,
            segs,
            dynamic: (base + dynamic_vaddr) as *const ElfDyn,
            dynsym: (base + dynsym_addr as usize) as *const ElfSym,
            num_dynsym,
            dynstr: (base + dynstr_addr as usize) as *const u8,
            hashtab: sections
                .hash
                .map_or(null(), |addr| (base + addr as usize) as *const u32),
            init_array: sections
                .init_array
                .map_or(0, |(addr, _)| base + addr as usize),
            num_init: sections.init_array.map_or(0, |(_, count)| count),
            fini_array: sections
                .fini_array
                .map_or(0, |(addr, _)| base + addr as usize),
            num_fini: sections.fini_array.map_or(0, |(_, count)| count),
            exidx: if num_exidx != 0 { base + exidx_vaddr } else { 0 },
            num_exidx,
            own_symtab: None,
        };
        debug!("`{}`: base = {base:#010x}", dso.name);
        Ok(dso)
    }

    fn materialize_segment(
        &mut self,
        base: usize,
        phdr: &ElfPhdr,
        image: &[u8],
        segs: &mut Vec<Segment>,
    ) -> Result<()> {
        let seg_base = base + phdr.p_vaddr as usize;
        let page = align_down(seg_base, PAGE_SIZE);
        let end = align_up(seg_base + phdr.p_memsz as usize, PAGE_SIZE);
        let size = end - page;
        let prot = ProtClass::from_phdr_flags(phdr.p_flags);

        let off = phdr.p_offset as usize;
        let filesz = phdr.p_filesz as usize;
        if off + filesz > image.len() {
            return Err(parse_elf_error(format!(
                "segment at {off:#x} extends past the end of the file"
            )));
        }

        let block = match self.kernel.alloc_block("dso_seg", prot, size, page) {
            Ok(block) => block,
            Err(err) => {
                return Err(alloc_error(format!(
                    "could not allocate {size:#x} bytes for segment {}: {err}",
                    segs.len()
                )));
            }
        };
        if let Ok(got) = self.kernel.block_base(block) {
            debug_assert_eq!(got, page);
        }
        let seg = Segment {
            block,
            base: seg_base,
            page,
            end,
            size,
            align: (phdr.p_align as usize).max(PAGE_SIZE),
            prot,
        };
        debug!(
            "segment {}: {:#010x}..{:#010x} size {:#x} align {:#x} prot {:?}",
            segs.len(),
            seg.page,
            seg.end,
            seg.size,
            seg.align,
            seg.prot
        );
        segs.push(seg);

        // zero the backing pages, then lay the file contents over them
        let zero = vec![0u8; size];
        unsafe {
            self.kernel.copy_unchecked(page, zero.as_ptr(), size);
            self.kernel
                .copy_unchecked(seg_base, image.as_ptr().add(off), filesz);
        }
        Ok(())
    }

    fn release_segments(&mut self, segs: &mut Vec<Segment>) {
        while let Some(seg) = segs.pop() {
            if let Err(err) = self.kernel.free_block(seg.block) {
                debug!("failed to free segment block: {err}");
            }
        }
    }

    /// Relocate and initialize a module that is not (or no longer) in the
    /// chain.
    fn finalize_module(&mut self, dso: &mut Dso) -> Result<()> {
        if !dso.flags.contains(ModFlags::RELOCATED) {
            let name = dso.name.clone();
            self.apply_relocs(&name, RelocView::of(dso), false, false)?;
            dso.flags |= ModFlags::RELOCATED;
        }
        if !dso.flags.contains(ModFlags::INITIALIZED) {
            // make the code coherent before jumping anywhere into it
            if let Some(seg) = dso.segs.first() {
                debug!(
                    "`{}`: flushing cache range {:#010x}..{:#010x}",
                    dso.name,
                    seg.base,
                    seg.base + seg.size
                );
                self.kernel.flush_icache(seg.base, seg.size);
            }
            run_init(dso);
            dso.flags |= ModFlags::INITIALIZED;
        }
        Ok(())
    }

    /// Finalize the chain member at `idx`.
    fn finalize_at(&mut self, idx: usize) -> Result<()> {
        // unlink for the duration so the module does not resolve symbols
        // against itself
        let mut dso = self.modules.remove(idx);
        let result = self.finalize_module(&mut dso);
        self.modules.insert(idx, dso);
        result
    }

    fn unload_module(&mut self, mut dso: Dso) {
        debug!("`{}`: unloading", dso.name);
        if dso.flags.contains(ModFlags::INITIALIZED) {
            run_fini(&mut dso);
        }
        debug!("`{}`: unmapping", dso.name);
        self.release_segments(&mut dso.segs);
        self.vma.free(dso.base);
        // owned symbol-table storage drops with the descriptor
    }

    /// Unload every module except the host program and release the host
    /// program's synthesized export table.
    pub fn unload_all(&mut self) {
        while self.modules.len() > 1 {
            let dso = self.modules.remove(1);
            self.unload_module(dso);
        }
        let head = &mut self.modules[0];
        if head.flags.contains(ModFlags::OWN_SYMTAB) {
            head.clear_symtab();
        }
    }

    fn open_object<O: ElfObject>(
        &mut self,
        object: &mut O,
        modname: String,
        flags: OpenFlags,
    ) -> Result<Handle> {
        let mut dso = self.load_object(object, modname)?;
        dso.flags |= ModFlags::from_bits_truncate(flags.bits());
        dso.refcount = 1;

        if !flags.contains(OpenFlags::LAZY) {
            if let Err(err) = self.finalize_module(&mut dso) {
                self.unload_module(dso);
                return Err(err);
            }
        }

        let handle = dso.handle();
        self.modules.insert(1, dso);
        Ok(handle)
    }

    fn find_loaded(&mut self, modname: &str) -> Option<Handle> {
        let dso = self
            .modules
            .iter_mut()
            .find(|dso| !dso.is_head() && dso.name == modname)?;
        debug!("dlopen(): `{modname}` is already loaded, increasing refcount");
        dso.refcount += 1;
        Some(dso.handle())
    }

    /// Load a shared object from a file.
    ///
    /// `None` returns a handle to the host program. Reopening an already
    /// loaded module (by canonicalized path) only bumps its reference
    /// count. Unless [`OpenFlags::LAZY`] is given, the module is
    /// relocated and initialized before the call returns; any failure
    /// after mapping rolls the module back completely.
    pub fn dlopen(&mut self, name: Option<&str>, flags: OpenFlags) -> Result<Handle> {
        // starting work on a new library; clear the error latch
        self.last_error = None;

        let Some(fname) = name else {
            debug!("dlopen(): opening root module");
            return Ok(Handle(HEAD_ID));
        };

        // identify the module by absolute path if possible
        let modname = canonical_name(fname);
        if let Some(handle) = self.find_loaded(&modname) {
            return Ok(handle);
        }

        let mut file = match ElfFile::from_path(fname) {
            Ok(file) => file,
            Err(err) => return Err(self.set_error(err)),
        };
        self.open_object(&mut file, modname, flags)
    }

    /// Load a shared object from any [`ElfObject`], e.g. an image already
    /// in memory. The object's name identifies it for repeat opens.
    pub fn dlopen_object<O: ElfObject>(&mut self, mut object: O, flags: OpenFlags) -> Result<Handle> {
        self.last_error = None;

        let modname = object.file_name().to_string();
        if let Some(handle) = self.find_loaded(&modname) {
            return Ok(handle);
        }
        self.open_object(&mut object, modname, flags)
    }

    /// Drop one reference to a module, unloading it when the count
    /// reaches zero. Closing the host program is a no-op.
    pub fn dlclose(&mut self, handle: Handle) -> Result<()> {
        if handle.0 == HEAD_ID {
            debug!("dlclose(): tried to close main module");
            return Ok(());
        }
        let Some(idx) = self.find_module(handle) else {
            return Err(self.set_error(unknown_handle_error("dlclose(): unknown module handle")));
        };

        let dso = &mut self.modules[idx];
        dso.refcount -= 1;
        if dso.refcount == 0 {
            debug!("`{}`: refcount is 0, unloading", dso.name);
            let dso = self.modules.remove(idx);
            self.unload_module(dso);
        }
        Ok(())
    }

    /// Resolve a symbol name to an address.
    ///
    /// With a specific handle only that module is searched; with `None`
    /// (or the host program's handle) the whole chain is searched in
    /// order, host program first. Modules that are not yet relocated are
    /// finalized on the way; a chain member that fails to finalize is
    /// unloaded and the search continues past it.
    pub fn dlsym(&mut self, handle: Option<Handle>, name: &str) -> Result<usize> {
        if name.is_empty() {
            return Err(self.set_error(invalid_argument_error("dlsym(): empty symbol name")));
        }

        // the head handle means "search the whole chain"
        let handle = handle.filter(|handle| handle.0 != HEAD_ID);

        if let Some(handle) = handle {
            let Some(idx) = self.find_module(handle) else {
                return Err(self.set_error(unknown_handle_error("dlsym(): unknown module handle")));
            };
            if !self.modules[idx].flags.contains(ModFlags::RELOCATED) {
                if let Err(err) = self.finalize_at(idx) {
                    let dso = self.modules.remove(idx);
                    self.unload_module(dso);
                    return Err(err);
                }
            }
            let dso = &self.modules[idx];
            if let Some(addr) = self.lookup_in(dso, name) {
                return Ok(addr);
            }
            let msg = format!("`{}`: symbol `{name}` not found", self.modules[idx].name);
            return Err(self.set_error(find_symbol_error(msg)));
        }

        let mut idx = 0;
        while idx < self.modules.len() {
            if !self.modules[idx].flags.contains(ModFlags::RELOCATED) {
                if self.finalize_at(idx).is_err() {
                    // drop the broken module and keep searching
                    let dso = self.modules.remove(idx);
                    self.unload_module(dso);
                    continue;
                }
            }
            let dso = &self.modules[idx];
            if let Some(addr) = self.lookup_in(dso, name) {
                return Ok(addr);
            }
            idx += 1;
        }
        Err(self.set_error(find_symbol_error(format!(
            "symbol `{name}` not found in any loaded modules"
        ))))
    }

    /// Find the module whose virtual range contains `addr`, together with
    /// the covering symbol if one exists.
    ///
    /// Loaded modules are scanned first and the host program last, since
    /// callers rarely ask about addresses inside the host.
    pub fn dladdr(&self, addr: usize) -> Option<DlInfo<'_>> {
        if addr == 0 {
            return None;
        }
        for dso in self.modules.iter().skip(1).chain(self.modules.first()) {
            if !dso.contains(addr) {
                continue;
            }
            let mut info = DlInfo {
                fname: &dso.name,
                fbase: dso.base,
                sname: None,
                saddr: None,
            };
            if let Some(sym) = reverse_lookup_sym(dso, addr) {
                info.saddr = Some(dso.base + sym.st_value as usize);
                info.sname = Some(unsafe { sym_name(dso.dynstr, sym) });
            }
            return Some(info);
        }
        None
    }

    /// Run the relocation engine over one module with explicit pass
    /// options.
    ///
    /// `dlopen` and `dlsym` drive this internally with both options off;
    /// it is exposed for callers that sequence the passes themselves
    /// (e.g. resolve imports early with `ignore_undef` and finish
    /// later). A module that is already relocated is left untouched.
    pub fn relocate(
        &mut self,
        handle: Handle,
        ignore_undef: bool,
        imports_only: bool,
    ) -> Result<()> {
        let Some(idx) = self.find_module(handle) else {
            return Err(self.set_error(unknown_handle_error("relocate(): unknown module handle")));
        };
        if self.modules[idx].flags.contains(ModFlags::RELOCATED) {
            return Ok(());
        }
        let mut dso = self.modules.remove(idx);
        let name = dso.name.clone();
        let result = self.apply_relocs(&name, RelocView::of(&dso), ignore_undef, imports_only);
        if result.is_ok() {
            dso.flags |= ModFlags::RELOCATED;
        }
        self.modules.insert(idx, dso);
        result
    }

    /// Handle of the module whose load base is `base` (including the
    /// host program).
    pub fn get_handle(&mut self, base: usize) -> Result<Handle> {
        if let Some(dso) = self.modules.iter().find(|dso| dso.base == base) {
            return Ok(dso.handle());
        }
        Err(self.set_error(unknown_handle_error(format!(
            "{base:#010x} is not the base of any loaded module"
        ))))
    }

    /// Load base of a module.
    pub fn get_base(&mut self, handle: Handle) -> Result<usize> {
        if let Some(idx) = self.find_module(handle) {
            return Ok(self.modules[idx].base);
        }
        Err(self.set_error(unknown_handle_error("get_base(): unknown module handle")))
    }

    /// Total virtual size of a module's reservation.
    pub fn get_size(&mut self, handle: Handle) -> Result<usize> {
        if let Some(idx) = self.find_module(handle) {
            return Ok(self.modules[idx].size);
        }
        Err(self.set_error(unknown_handle_error("get_size(): unknown module handle")))
    }

    /// Current flag word of a module descriptor.
    pub fn module_flags(&mut self, handle: Handle) -> Result<ModFlags> {
        if let Some(idx) = self.find_module(handle) {
            return Ok(self.modules[idx].flags);
        }
        Err(self.set_error(unknown_handle_error("module_flags(): unknown module handle")))
    }
}
