//! A userspace runtime dynamic linker for position-independent ELF32
//! shared objects on ARMv7 hosts whose operating system provides no
//! POSIX `dlopen`.
//!
//! A statically linked host program constructs an [`Rtld`] instance from
//! a kernel memory capability ([`kernel::Kernel`]) and a [`Config`]
//! describing its own exports, then loads auxiliary shared objects
//! through the familiar [`dlopen`](Rtld::dlopen)/[`dlsym`](Rtld::dlsym)/
//! [`dlclose`](Rtld::dlclose) surface. Imports of a loaded module
//! resolve, in order, against a user-supplied override table, the host
//! OS's native export tables, the host program's synthesized symbol
//! table, and every previously loaded module.
//!
//! Module load areas are carved out of a reserved virtual-address window
//! by a stack-style allocator; each `PT_LOAD` segment is backed by a
//! kernel memory block of protection class R, RX or RW and populated
//! with a protection-bypassing copy primitive. Only `REL`-style ARM
//! relocations are supported; there is no TLS and no symbol versioning.
//!
//! The loader is single-threaded by contract: nothing here takes locks,
//! and the embedder serializes calls into one instance.

pub mod arch;
mod error;
mod exidx;
pub mod exports;
mod hash;
pub mod kernel;
mod loader;
mod lookup;
mod module;
pub mod object;
mod reloc;
mod vma;

pub use error::{Error, Result};
pub use exports::Export;
pub use hash::elf_hash;
pub use module::{Handle, ModFlags, OpenFlags};
pub use vma::{DEFAULT_VMA_WINDOW, MAX_ALLOCS};

use crate::error::{invalid_argument_error, missing_capability_error};
use crate::kernel::Kernel;
use crate::module::Dso;
use crate::vma::VmaAllocator;
use bitflags::bitflags;
use core::ops::Range;
use log::debug;

bitflags! {
    /// Flags accepted by [`Rtld::new`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct InitFlags: u32 {
        /// The loader is operational.
        const INITIALIZED = 1;
        /// Don't search the host OS's native export tables.
        const NO_SCE_EXPORTS = 2;
    }
}

/// Read-only name→address oracle over the host OS's native export
/// tables.
///
/// The stock OS keeps exports of the main process image in its own
/// module format; an implementation of this trait enumerates them so
/// the loader can use them as a last-resort symbol source.
pub trait SceExports {
    /// The address exported under `name` by the main module, if any.
    fn resolve(&self, name: &str) -> Option<usize>;
}

/// Everything the embedder wires into a loader instance.
pub struct Config {
    /// Virtual-address window module load areas are carved from.
    pub vma_window: Range<usize>,
    /// Load address of the host program (the chain head's base).
    pub host_base: usize,
    /// Size of the host program's image. 0 keeps the host out of
    /// address-containment queries.
    pub host_size: usize,
    /// Bounds of the host program's own exception-index table, used as
    /// the [`find_exidx`](Rtld::find_exidx) fallback.
    pub host_exidx: Option<Range<usize>>,
    /// Default export table, installed at construction and whenever
    /// [`Rtld::set_main_exports`] is called without an explicit list.
    pub exports: Option<Vec<Export>>,
    /// Export table consulted before every other symbol source.
    pub override_exports: Vec<Export>,
    /// The native export oracle, when the platform provides one.
    pub oracle: Option<Box<dyn SceExports>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            vma_window: DEFAULT_VMA_WINDOW,
            host_base: 0,
            host_size: 0,
            host_exidx: None,
            exports: None,
            override_exports: Vec::new(),
            oracle: None,
        }
    }
}

/// Reverse-lookup result of [`Rtld::dladdr`].
#[derive(Debug)]
pub struct DlInfo<'rtld> {
    /// Name of the module containing the address.
    pub fname: &'rtld str,
    /// Load base of that module.
    pub fbase: usize,
    /// Name of the symbol covering the address, if any.
    pub sname: Option<&'rtld str>,
    /// Resolved address of that symbol.
    pub saddr: Option<usize>,
}

/// A loader instance.
///
/// Owns the module chain (whose permanent head represents the host
/// program), the virtual-address arena, the error latch and the kernel
/// capability. All public operations take `&mut self`; the loader is not
/// reentrant.
pub struct Rtld<K: Kernel> {
    pub(crate) kernel: K,
    pub(crate) flags: InitFlags,
    pub(crate) vma: VmaAllocator,
    /// Insertion-ordered chain: head first, then newest to oldest.
    pub(crate) modules: Vec<Dso>,
    pub(crate) oracle: Option<Box<dyn SceExports>>,
    pub(crate) override_exports: Vec<Export>,
    pub(crate) default_exports: Option<Vec<Export>>,
    pub(crate) host_exidx: Option<Range<usize>>,
    pub(crate) last_error: Option<String>,
    pub(crate) next_id: u32,
}

impl<K: Kernel> std::fmt::Debug for Rtld<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rtld").finish_non_exhaustive()
    }
}

impl<K: Kernel> Rtld<K> {
    /// Construct a loader instance.
    ///
    /// Verifies the kernel capability, initializes the address-space
    /// arena, builds the host symbol table from the configured export
    /// list if one is present, and clears the error latch. Fails only
    /// when the capability is unusable.
    pub fn new(mut kernel: K, config: Config, flags: InitFlags) -> Result<Rtld<K>> {
        kernel.probe().map_err(|err| {
            missing_capability_error(format!("kernel memory capability unavailable: {err}"))
        })?;

        let mut rtld = Rtld {
            kernel,
            flags: InitFlags::INITIALIZED | flags,
            vma: VmaAllocator::new(config.vma_window),
            modules: vec![Dso::head(config.host_base, config.host_size)],
            oracle: config.oracle,
            override_exports: config.override_exports,
            default_exports: config.exports,
            host_exidx: config.host_exidx,
            last_error: None,
            next_id: 1,
        };

        // pick up a configured export table; not having one is fine
        let _ = rtld.set_main_exports(None);
        rtld.last_error = None;

        Ok(rtld)
    }

    /// The flags the loader was initialized with, or empty after
    /// [`quit`](Rtld::quit).
    #[inline]
    pub fn init_flags(&self) -> InitFlags {
        self.flags
    }

    /// The latched message of the first failure since the last read.
    /// Reading clears the latch.
    pub fn dlerror(&mut self) -> Option<String> {
        self.last_error.take()
    }

    /// Unload every module and shut the loader down.
    pub fn quit(&mut self) {
        if !self.flags.contains(InitFlags::INITIALIZED) {
            self.set_error(invalid_argument_error("loader is not initialized"));
            return;
        }
        self.unload_all();
        self.flags = InitFlags::empty();
        self.last_error = None;
    }

    /// Number of loaded modules, the host program excluded.
    #[inline]
    pub fn module_count(&self) -> usize {
        self.modules.len() - 1
    }

    /// Bytes still available in the VMA window.
    #[inline]
    pub fn vma_free_bytes(&self) -> usize {
        self.vma.free_bytes()
    }

    /// The window the loader reserves module areas from.
    #[inline]
    pub fn vma_window(&self) -> Range<usize> {
        self.vma.window()
    }

    /// The kernel capability the loader was built with.
    #[inline]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub(crate) fn find_module(&self, handle: Handle) -> Option<usize> {
        self.modules.iter().position(|dso| dso.id == handle.0)
    }

    /// Latch the first failure of the current call sequence and hand the
    /// error back for propagation.
    pub(crate) fn set_error(&mut self, err: Error) -> Error {
        debug!("error: {err}");
        if self.last_error.is_none() {
            self.last_error = Some(err.to_string());
        }
        err
    }
}

impl<K: Kernel> Drop for Rtld<K> {
    fn drop(&mut self) {
        if self.flags.contains(InitFlags::INITIALIZED) {
            self.unload_all();
        }
    }
}
