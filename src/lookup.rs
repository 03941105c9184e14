//! Symbol resolution over module descriptors.

use crate::arch::ElfSym;
use crate::hash::elf_hash;
use crate::kernel::Kernel;
use crate::module::{Dso, ModFlags};
use crate::{InitFlags, Rtld};
use core::ffi::CStr;

/// Read a symbol's name out of the module string table.
///
/// # Safety
/// `strtab` must point at a NUL-terminated string table covering
/// `sym.st_name`, and must stay mapped for as long as the returned
/// reference is used.
pub(crate) unsafe fn sym_name(strtab: *const u8, sym: &ElfSym) -> &'static str {
    unsafe {
        let cstr = CStr::from_ptr(strtab.add(sym.st_name as usize).cast());
        core::str::from_utf8_unchecked(cstr.to_bytes())
    }
}

/// Walk the module's SysV hash table for `name`.
fn hashtab_lookup(dso: &Dso, name: &str) -> Option<&'static ElfSym> {
    let hash = elf_hash(name.as_bytes());
    unsafe {
        let nbucket = dso.hashtab.read() as usize;
        if nbucket == 0 {
            return None;
        }
        let buckets = dso.hashtab.add(2);
        let chains = buckets.add(nbucket);
        let mut idx = buckets.add(hash as usize % nbucket).read() as usize;
        while idx != 0 {
            let sym = &*dso.dynsym.add(idx);
            if sym_name(dso.dynstr, sym) == name {
                return Some(sym);
            }
            idx = chains.add(idx).read() as usize;
        }
    }
    None
}

/// Find the symbol-table entry for `name` in one module.
///
/// Uses the hash table when the image carries one, otherwise scans the
/// table linearly starting at index 1 (index 0 is the mandatory
/// undefined symbol).
pub(crate) fn lookup_sym(dso: &Dso, name: &str) -> Option<&'static ElfSym> {
    if dso.dynsym.is_null() || dso.dynstr.is_null() {
        return None;
    }
    if !dso.hashtab.is_null() {
        return hashtab_lookup(dso, name);
    }
    for i in 1..dso.num_dynsym as usize {
        let sym = unsafe { &*dso.dynsym.add(i) };
        if unsafe { sym_name(dso.dynstr, sym) } == name {
            return Some(sym);
        }
    }
    None
}

/// Find the defined symbol whose code or data covers `addr`.
///
/// Only meaningful once the module is relocated; an address matches a
/// symbol when it equals the symbol's resolved address or falls within
/// its `st_size` bytes.
pub(crate) fn reverse_lookup_sym(dso: &Dso, addr: usize) -> Option<&'static ElfSym> {
    if !dso.flags.contains(ModFlags::RELOCATED) || dso.dynsym.is_null() || dso.num_dynsym <= 1 {
        return None;
    }
    for i in 1..dso.num_dynsym as usize {
        let sym = unsafe { &*dso.dynsym.add(i) };
        if sym.is_undef() || sym.st_value == 0 {
            continue;
        }
        let symaddr = dso.base + sym.st_value as usize;
        if addr == symaddr || (addr > symaddr && addr < symaddr + sym.st_size as usize) {
            return Some(sym);
        }
    }
    None
}

impl<K: Kernel> Rtld<K> {
    /// Address of `name` in the host OS's native export tables, unless
    /// that source was disabled at init.
    pub(crate) fn sce_export(&self, name: &str) -> Option<usize> {
        if self.flags.contains(InitFlags::NO_SCE_EXPORTS) {
            return None;
        }
        self.oracle.as_ref()?.resolve(name)
    }

    /// Resolve `name` to an address within one module.
    ///
    /// The host module additionally falls back to the native export
    /// tables when its own symbol table has no match.
    pub(crate) fn lookup_in(&self, dso: &Dso, name: &str) -> Option<usize> {
        if let Some(sym) = lookup_sym(dso, name) {
            if !sym.is_undef() {
                return Some(dso.base + sym.st_value as usize);
            }
        }
        if dso.is_head() {
            return self.sce_export(name);
        }
        None
    }

    /// Resolve `name` against every source, in resolution order: the
    /// override export table, the native export tables, then each module
    /// in chain order starting with the host program.
    pub(crate) fn lookup_global(&self, name: &str) -> Option<usize> {
        if name.is_empty() {
            return None;
        }

        for exp in &self.override_exports {
            if exp.name == name {
                return Some(exp.addr);
            }
        }

        if let Some(addr) = self.sce_export(name) {
            return Some(addr);
        }

        for dso in &self.modules {
            if let Some(sym) = lookup_sym(dso, name) {
                if !sym.is_undef() {
                    return Some(dso.base + sym.st_value as usize);
                }
            }
        }

        None
    }
}
