//! The ARM `REL` relocation engine.
//!
//! Walks the `DT_REL` array and, when the PLT uses `REL`-style entries,
//! the `DT_JMPREL` array. Resolution failures for non-weak symbols are
//! counted and reported at the end of the pass so that one missing
//! import does not hide the next; an unknown relocation type aborts the
//! pass outright.

use crate::arch::{ArmReloc, ElfDyn, ElfRel, ElfSym};
use crate::error::{Result, relocate_error};
use crate::kernel::Kernel;
use crate::lookup::sym_name;
use crate::module::Dso;
use crate::Rtld;
use elf::abi::{DT_JMPREL, DT_NULL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELSZ};
use log::debug;

/// The raw table pointers the engine needs, detached from the descriptor
/// so that global lookup can walk the chain while a pass is running.
#[derive(Clone, Copy)]
pub(crate) struct RelocView {
    pub base: usize,
    pub dynamic: *const ElfDyn,
    pub dynsym: *const ElfSym,
    pub dynstr: *const u8,
}

impl RelocView {
    pub(crate) fn of(dso: &Dso) -> RelocView {
        RelocView {
            base: dso.base,
            dynamic: dso.dynamic,
            dynsym: dso.dynsym,
            dynstr: dso.dynstr,
        }
    }
}

impl<K: Kernel> Rtld<K> {
    /// Run the module's relocation passes: `DT_REL` first, then
    /// `DT_JMPREL` when `DT_PLTREL` says the PLT uses `REL` entries.
    pub(crate) fn apply_relocs(
        &mut self,
        name: &str,
        view: RelocView,
        ignore_undef: bool,
        imports_only: bool,
    ) -> Result<()> {
        let mut rel: *const ElfRel = core::ptr::null();
        let mut relsz = 0usize;
        let mut jmprel: *const ElfRel = core::ptr::null();
        let mut pltrel = 0i64;
        let mut pltrelsz = 0usize;

        let mut cur = view.dynamic;
        loop {
            let entry = unsafe { cur.read() };
            match i64::from(entry.d_tag) {
                DT_NULL => break,
                DT_REL => rel = (view.base + entry.d_val as usize) as *const ElfRel,
                DT_RELSZ => relsz = entry.d_val as usize,
                DT_JMPREL => jmprel = (view.base + entry.d_val as usize) as *const ElfRel,
                DT_PLTREL => pltrel = i64::from(entry.d_val),
                DT_PLTRELSZ => pltrelsz = entry.d_val as usize,
                _ => {}
            }
            cur = unsafe { cur.add(1) };
        }

        if !rel.is_null() && relsz > 0 {
            let count = relsz / size_of::<ElfRel>();
            debug!("`{name}`: processing {count} entries of .rel.dyn");
            self.process_relocs(name, view, rel, count, ignore_undef, imports_only)?;
        }

        if !jmprel.is_null() && pltrelsz > 0 && pltrel != 0 {
            if pltrel != DT_REL {
                return Err(self.set_error(relocate_error(format!(
                    "`{name}`: unsupported PLT relocation style {pltrel:#x}"
                ))));
            }
            let count = pltrelsz / size_of::<ElfRel>();
            debug!("`{name}`: processing {count} entries of .rel.plt");
            self.process_relocs(name, view, jmprel, count, ignore_undef, imports_only)?;
        }

        Ok(())
    }

    fn process_relocs(
        &mut self,
        name: &str,
        view: RelocView,
        rels: *const ElfRel,
        count: usize,
        ignore_undef: bool,
        imports_only: bool,
    ) -> Result<()> {
        let mut failed = 0usize;

        for i in 0..count {
            let rel = unsafe { rels.add(i).read() };
            let slot = (view.base + rel.r_offset as usize) as *mut u32;
            let symno = rel.r_sym() as usize;
            let mut symval = 0usize;
            let mut symbase = view.base;

            if symno != 0 {
                let sym = unsafe { view.dynsym.add(symno).read() };
                if sym.is_undef() {
                    // external symbol, its value comes from somewhere else
                    let symname = unsafe { sym_name(view.dynstr, &sym) };
                    symbase = 0;
                    match self.lookup_global(symname) {
                        Some(addr) => symval = addr,
                        None => {
                            if sym.is_weak() || ignore_undef {
                                debug!(
                                    "`{name}`: ignoring resolution failure for `{symname}`{}",
                                    if sym.is_weak() { " (weak)" } else { "" }
                                );
                            } else {
                                self.set_error(relocate_error(format!(
                                    "`{name}`: could not resolve symbol `{symname}`"
                                )));
                                failed += 1;
                            }
                            continue;
                        }
                    }
                } else {
                    if imports_only {
                        continue;
                    }
                    symval = sym.st_value as usize;
                }
            } else if imports_only {
                continue;
            }

            let Some(kind) = ArmReloc::from_raw(rel.r_type()) else {
                return Err(self.set_error(relocate_error(format!(
                    "`{name}`: unknown relocation type {}",
                    rel.r_type()
                ))));
            };
            unsafe {
                match kind {
                    ArmReloc::Relative => {
                        slot.write_unaligned(slot.read_unaligned().wrapping_add(symbase as u32));
                    }
                    ArmReloc::Abs32 => {
                        slot.write_unaligned(
                            slot.read_unaligned()
                                .wrapping_add(symbase.wrapping_add(symval) as u32),
                        );
                    }
                    ArmReloc::GlobDat | ArmReloc::JumpSlot => {
                        slot.write_unaligned(symbase.wrapping_add(symval) as u32);
                    }
                    ArmReloc::None => {}
                }
            }
        }

        if failed > 0 {
            return Err(relocate_error(format!(
                "`{name}`: {failed} unresolved symbol(s)"
            )));
        }
        Ok(())
    }
}
