//! Module descriptors and the loaded-module chain.

use crate::arch::{ElfDyn, ElfSym};
use crate::exports::SyntheticSymtab;
use crate::kernel::{BlockId, ProtClass};
use bitflags::bitflags;
use core::ptr::null;

/// Id of the host-program descriptor, the permanent head of the chain.
pub(crate) const HEAD_ID: u32 = 0;

/// Opaque reference to a loaded module (or the host program).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) u32);

bitflags! {
    /// Flags accepted by [`Rtld::dlopen`](crate::Rtld::dlopen).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Don't use this module's symbols when resolving others.
        const LOCAL = 0;
        /// Use this module's symbols when resolving others.
        const GLOBAL = 1;
        /// Finalize loading before `dlopen` returns.
        const NOW = 0;
        /// Finalize loading only after `dlsym` is called.
        const LAZY = 2;
    }
}

bitflags! {
    /// Flag word of a module descriptor.
    ///
    /// The low bits mirror the open-mode flags the module was opened
    /// with; the lifecycle state bits live above them.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ModFlags: u32 {
        /// Module symbols participate in downstream resolution.
        const GLOBAL = 1;
        /// Finalization is deferred until the first `dlsym`.
        const LAZY = 2;
        /// All relocations applied (or deliberately skipped).
        const RELOCATED = 1 << 17;
        /// Segments are backed by kernel memory blocks.
        const MAPPED = 1 << 18;
        /// Constructors have run.
        const INITIALIZED = 1 << 19;
        /// The symbol-table storage belongs to this descriptor.
        const OWN_SYMTAB = 1 << 24;
    }
}

/// One loaded `PT_LOAD` segment.
pub(crate) struct Segment {
    /// Kernel allocation backing the segment's page range.
    pub block: BlockId,
    /// Logical base: module base + `p_vaddr`.
    pub base: usize,
    /// `base` rounded down to page alignment.
    pub page: usize,
    /// End of the backing pages.
    pub end: usize,
    /// `end - page`.
    pub size: usize,
    pub align: usize,
    pub prot: ProtClass,
}

/// One loaded shared object (or the host program, for the chain head).
pub(crate) struct Dso {
    pub id: u32,
    pub name: String,
    pub flags: ModFlags,
    pub refcount: u32,

    pub base: usize,
    pub size: usize,

    pub segs: Vec<Segment>,

    pub dynamic: *const ElfDyn,
    pub dynsym: *const ElfSym,
    pub num_dynsym: u32,
    pub dynstr: *const u8,
    /// SysV hash table, null when the image carries none.
    pub hashtab: *const u32,

    /// Address of `.init_array`, 0 when absent.
    pub init_array: usize,
    pub num_init: u32,
    /// Address of `.fini_array`, 0 when absent.
    pub fini_array: usize,
    pub num_fini: u32,

    /// Address of the ARM exception-index table, 0 when absent.
    pub exidx: usize,
    pub num_exidx: u32,

    /// Backing storage when the symbol table was synthesized from an
    /// export list rather than mapped from an image.
    pub own_symtab: Option<SyntheticSymtab>,
}

impl Dso {
    /// The host-program descriptor. It is born fully loaded and is never
    /// unlinked or unloaded.
    pub(crate) fn head(base: usize, size: usize) -> Dso {
        Dso {
            id: HEAD_ID,
            name: "$main".to_string(),
            flags: ModFlags::MAPPED | ModFlags::RELOCATED | ModFlags::INITIALIZED,
            refcount: 1,
            base,
            size,
            segs: Vec::new(),
            dynamic: null(),
            dynsym: null(),
            num_dynsym: 0,
            dynstr: null(),
            hashtab: null(),
            init_array: 0,
            num_init: 0,
            fini_array: 0,
            num_fini: 0,
            exidx: 0,
            num_exidx: 0,
            own_symtab: None,
        }
    }

    #[inline]
    pub(crate) fn handle(&self) -> Handle {
        Handle(self.id)
    }

    #[inline]
    pub(crate) fn is_head(&self) -> bool {
        self.id == HEAD_ID
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Install a synthesized symbol table, taking ownership of its
    /// storage.
    pub(crate) fn install_symtab(&mut self, tab: SyntheticSymtab) {
        let tab = self.own_symtab.insert(tab);
        self.dynsym = tab.symtab.as_ptr();
        self.num_dynsym = tab.symtab.len() as u32;
        self.dynstr = tab.strtab.as_ptr();
        self.hashtab = tab.hashtab.as_ptr();
        self.flags |= ModFlags::OWN_SYMTAB | ModFlags::GLOBAL;
    }

    /// Drop an owned symbol table and forget the dangling pointers.
    pub(crate) fn clear_symtab(&mut self) {
        self.dynsym = null();
        self.num_dynsym = 0;
        self.dynstr = null();
        self.hashtab = null();
        self.own_symtab = None;
        self.flags.remove(ModFlags::OWN_SYMTAB);
    }
}
