//! Synthesizing a dynamic symbol table from a host export list.
//!
//! The host program is statically linked and carries no `.dynsym` of its
//! own, so the loader builds one from the `(name, address)` pairs the
//! embedder hands it. The result looks exactly like a mapped table to the
//! lookup machinery: symtab, strtab and a SysV hash table.

use crate::arch::{ElfSym, STN_UNDEF};
use crate::error::{Result, invalid_argument_error};
use crate::hash::elf_hash;
use elf::abi::SHN_ABS;

/// A single `(name, address)` pair exported by the host program.
#[derive(Clone, Debug)]
pub struct Export {
    pub name: String,
    pub addr: usize,
}

impl Export {
    pub fn new(name: impl Into<String>, addr: usize) -> Export {
        Export {
            name: name.into(),
            addr,
        }
    }
}

/// Owned backing storage of a synthesized symbol table.
pub(crate) struct SyntheticSymtab {
    pub symtab: Box<[ElfSym]>,
    pub strtab: Box<[u8]>,
    /// SysV layout: `nbucket`, `nchain`, buckets, chains.
    pub hashtab: Box<[u32]>,
}

/// Build a symbol table, string table and hash table from an export list.
///
/// The table has `N + 1` symbols (index 0 is the mandatory undefined
/// entry); every export gets `st_shndx = SHN_ABS` and an `st_value`
/// relative to `host_base`, so that `base + st_value` reproduces the
/// exported address.
pub(crate) fn symtab_from_exports(exports: &[Export], host_base: usize) -> Result<SyntheticSymtab> {
    if exports.is_empty() {
        return Err(invalid_argument_error("empty export table"));
    }

    let nchain = exports.len() + 1;
    let nbucket = nchain * 2 + 1;

    // string table: a leading NUL, then the names packed back to back
    let names_len: usize = exports.iter().map(|exp| exp.name.len() + 1).sum();
    let mut strtab = Vec::with_capacity(1 + names_len);
    strtab.push(0u8);

    let mut symtab = vec![ElfSym::default(); nchain];
    for (i, exp) in exports.iter().enumerate() {
        let sym = &mut symtab[i + 1];
        sym.st_name = strtab.len() as u32;
        sym.st_shndx = SHN_ABS;
        sym.st_value = exp.addr.wrapping_sub(host_base) as u32;
        strtab.extend_from_slice(exp.name.as_bytes());
        strtab.push(0);
    }

    let mut hashtab = vec![STN_UNDEF; 2 + nbucket + nchain];
    hashtab[0] = nbucket as u32;
    hashtab[1] = nchain as u32;
    let chain_base = 2 + nbucket;
    for i in 0..nchain {
        let name: &[u8] = if i == 0 {
            b""
        } else {
            exports[i - 1].name.as_bytes()
        };
        let hash = elf_hash(name);
        let bucket = 2 + hash as usize % nbucket;
        if hashtab[bucket] == STN_UNDEF {
            hashtab[bucket] = i as u32;
        } else {
            // walk the chain to its end and append
            let mut j = hashtab[bucket] as usize;
            while hashtab[chain_base + j] != STN_UNDEF {
                j = hashtab[chain_base + j] as usize;
            }
            hashtab[chain_base + j] = i as u32;
        }
    }

    Ok(SyntheticSymtab {
        symtab: symtab.into_boxed_slice(),
        strtab: strtab.into_boxed_slice(),
        hashtab: hashtab.into_boxed_slice(),
    })
}

impl<K: crate::kernel::Kernel> crate::Rtld<K> {
    /// Install a symbol table on the host-program descriptor so loaded
    /// modules can resolve imports against the host.
    ///
    /// With `Some(list)` the table is synthesized from that list; with
    /// `None` the export table from [`Config`](crate::Config) is used
    /// instead, and the call fails if none was configured. The host
    /// descriptor takes ownership of the storage.
    pub fn set_main_exports(&mut self, exports: Option<&[Export]>) -> Result<()> {
        let host_base = self.modules[0].base;
        let built = match exports {
            Some(list) => symtab_from_exports(list, host_base),
            None => match self.default_exports.clone() {
                Some(list) => symtab_from_exports(&list, host_base),
                None => Err(invalid_argument_error("no export table available")),
            },
        };
        match built {
            Ok(tab) => {
                self.modules[0].install_symtab(tab);
                Ok(())
            }
            Err(err) => Err(self.set_error(err)),
        }
    }
}
