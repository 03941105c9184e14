//! The host kernel memory capability the loader is generic over.
//!
//! The loader never maps memory itself. Segment backing, teardown,
//! protection-bypassing copies and instruction-cache maintenance all go
//! through an implementation of [`Kernel`] supplied by the embedder.

use crate::Result;
use elf::abi::{PF_R, PF_X};

/// Opaque identifier of a kernel memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Protection class of a kernel memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtClass {
    /// Read-only data.
    R,
    /// Executable code.
    Rx,
    /// Writable data.
    Rw,
}

impl ProtClass {
    /// Derive the block class from ELF segment `p_flags`.
    ///
    /// Anything that is not plain `R` or `R|X` is treated as writable
    /// data.
    pub(crate) fn from_phdr_flags(p_flags: u32) -> ProtClass {
        match p_flags {
            f if f == PF_R => ProtClass::R,
            f if f == PF_R | PF_X => ProtClass::Rx,
            _ => ProtClass::Rw,
        }
    }
}

/// Low-level memory operations provided by the host kernel.
///
/// All addresses passed in are page-aligned. An implementation must
/// honor the exact-placement contract of [`Kernel::alloc_block`]: if the
/// requested virtual address cannot be backed, the call fails rather
/// than mapping the block elsewhere.
pub trait Kernel {
    /// Check that the capability is actually usable.
    ///
    /// Called once while the loader instance is constructed; failure is
    /// fatal to construction.
    fn probe(&mut self) -> Result<()>;

    /// Allocate a block of `size` bytes with protection `prot`, mapped at
    /// exactly the virtual address `at`.
    fn alloc_block(&mut self, name: &str, prot: ProtClass, size: usize, at: usize)
    -> Result<BlockId>;

    /// Release a block previously returned by [`Kernel::alloc_block`].
    fn free_block(&mut self, block: BlockId) -> Result<()>;

    /// Resolve a block handle back to its base address.
    fn block_base(&self, block: BlockId) -> Result<usize>;

    /// Copy `len` bytes to `dst`, ignoring page protections.
    ///
    /// The loader uses this to populate segments whose pages the kernel
    /// has already marked read-only or read-execute.
    ///
    /// # Safety
    /// `dst..dst + len` must lie inside blocks obtained from this
    /// capability and `src` must be valid for `len` bytes.
    unsafe fn copy_unchecked(&mut self, dst: usize, src: *const u8, len: usize);

    /// Make the instruction caches coherent over `base..base + len`.
    fn flush_icache(&mut self, base: usize, len: usize);
}
