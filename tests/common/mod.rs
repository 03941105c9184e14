//! Shared fixtures: an arena-backed kernel capability, a map-backed
//! export oracle, and a builder for small synthetic ELF32/ARM shared
//! objects.
//!
//! The images the builder produces are loadable but never executed; the
//! constructor and destructor arrays they carry contain only null
//! entries, so lifecycle tests exercise the full state machine without
//! jumping into fabricated machine code.

#![allow(dead_code)]

use arm_rtld::elf_hash;
use arm_rtld::kernel::{BlockId, Kernel, ProtClass};
use arm_rtld::{Config, Error, InitFlags, Result, Rtld, SceExports};
use elf::abi::{
    DT_HASH, DT_JMPREL, DT_NULL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELENT, DT_RELSZ, DT_STRSZ,
    DT_STRTAB, DT_SYMENT, DT_SYMTAB, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_LOAD, SHT_DYNSYM,
    SHT_FINI_ARRAY, SHT_HASH, SHT_INIT_ARRAY, SHT_STRTAB, STB_GLOBAL, STB_WEAK, STT_FUNC,
};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::ops::Range;

pub const PAGE: usize = 0x1000;
pub const ARENA_LEN: usize = 0x40_000;

// ---------------------------------------------------------------------------
// arena-backed kernel capability

struct Arena {
    ptr: *mut u8,
    layout: Layout,
}

impl Arena {
    fn new(len: usize) -> Arena {
        let layout = Layout::from_size_align(len, PAGE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Arena { ptr, layout }
    }

    fn window(&self) -> Range<usize> {
        let base = self.ptr as usize;
        base..base + self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

struct Block {
    base: usize,
    size: usize,
    live: bool,
}

/// A [`Kernel`] implementation backed by one heap arena that doubles as
/// the loader's VMA window. Blocks are pure bookkeeping; the memory
/// behind them is always mapped, so the "unrestricted" copy is a plain
/// memcpy and cache flushes only count.
pub struct ArenaKernel {
    arena: Arena,
    blocks: Vec<Block>,
    pub flushes: usize,
    pub fail_probe: bool,
}

impl ArenaKernel {
    pub fn new(len: usize) -> ArenaKernel {
        ArenaKernel {
            arena: Arena::new(len),
            blocks: Vec::new(),
            flushes: 0,
            fail_probe: false,
        }
    }

    pub fn window(&self) -> Range<usize> {
        self.arena.window()
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.iter().filter(|block| block.live).count()
    }
}

impl Kernel for ArenaKernel {
    fn probe(&mut self) -> Result<()> {
        if self.fail_probe {
            return Err(Error::MissingCapability {
                msg: "kernel bridge not detected".into(),
            });
        }
        Ok(())
    }

    fn alloc_block(
        &mut self,
        _name: &str,
        _prot: ProtClass,
        size: usize,
        at: usize,
    ) -> Result<BlockId> {
        let window = self.window();
        if at % PAGE != 0 || at < window.start || at + size > window.end {
            return Err(Error::Alloc {
                msg: format!("cannot back {size:#x} bytes at {at:#x}").into(),
            });
        }
        if self
            .blocks
            .iter()
            .any(|block| block.live && at < block.base + block.size && block.base < at + size)
        {
            return Err(Error::Alloc {
                msg: "address range already backed".into(),
            });
        }
        let id = self.blocks.len() as u32;
        self.blocks.push(Block {
            base: at,
            size,
            live: true,
        });
        Ok(BlockId(id))
    }

    fn free_block(&mut self, block: BlockId) -> Result<()> {
        match self.blocks.get_mut(block.0 as usize) {
            Some(rec) if rec.live => {
                rec.live = false;
                Ok(())
            }
            _ => Err(Error::UnknownHandle {
                msg: "no such block".into(),
            }),
        }
    }

    fn block_base(&self, block: BlockId) -> Result<usize> {
        match self.blocks.get(block.0 as usize) {
            Some(rec) if rec.live => Ok(rec.base),
            _ => Err(Error::UnknownHandle {
                msg: "no such block".into(),
            }),
        }
    }

    unsafe fn copy_unchecked(&mut self, dst: usize, src: *const u8, len: usize) {
        unsafe { std::ptr::copy_nonoverlapping(src, dst as *mut u8, len) }
    }

    fn flush_icache(&mut self, _base: usize, _len: usize) {
        self.flushes += 1;
    }
}

// ---------------------------------------------------------------------------
// map-backed export oracle

pub struct MapOracle(pub HashMap<String, usize>);

impl MapOracle {
    pub fn of(pairs: &[(&str, usize)]) -> MapOracle {
        MapOracle(
            pairs
                .iter()
                .map(|(name, addr)| (name.to_string(), *addr))
                .collect(),
        )
    }
}

impl SceExports for MapOracle {
    fn resolve(&self, name: &str) -> Option<usize> {
        self.0.get(name).copied()
    }
}

// ---------------------------------------------------------------------------
// loader construction

pub fn rtld_with_flags(
    flags: InitFlags,
    configure: impl FnOnce(&mut Config),
) -> Rtld<ArenaKernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = ArenaKernel::new(ARENA_LEN);
    let mut config = Config {
        vma_window: kernel.window(),
        ..Config::default()
    };
    configure(&mut config);
    Rtld::new(kernel, config, flags).unwrap()
}

pub fn rtld_with(configure: impl FnOnce(&mut Config)) -> Rtld<ArenaKernel> {
    rtld_with_flags(InitFlags::default(), configure)
}

pub fn new_rtld() -> Rtld<ArenaKernel> {
    rtld_with(|_| {})
}

/// Write an image to a unique temp file and return its path.
pub fn write_image(tag: &str, bytes: &[u8]) -> String {
    let path = std::env::temp_dir().join(format!(
        "arm_rtld_test_{}_{tag}.so",
        std::process::id()
    ));
    std::fs::write(&path, bytes).unwrap();
    path.to_string_lossy().into_owned()
}

pub fn read_slot(base: usize, offset: usize) -> u32 {
    unsafe { ((base + offset) as *const u32).read_unaligned() }
}

// ---------------------------------------------------------------------------
// synthetic ELF32/ARM image builder
//
// Fixed layout, all virtual addresses equal to file offsets:
//   0x0000 ehdr + phdrs          \
//   0x0100 .dynamic               | LOAD 0, R+X
//   0x0200 exception-index table /
//   0x1000 .dynsym               \
//   0x1100 .dynstr                |
//   0x1200 .hash                  |
//   0x1300 .rel.dyn               | LOAD 1, R+W
//   0x1400 .rel.plt               |
//   0x1500 .init_array            |
//   0x1600 .fini_array            |
//   0x1700 relocation slots       |
//   0x1800 .shstrtab              |
//   0x1900 shdrs                 /

const PHOFF: usize = 0x34;
const DYN_OFF: usize = 0x100;
pub const EXIDX_OFF: usize = 0x200;
const DYNSYM_OFF: usize = 0x1000;
const DYNSTR_OFF: usize = 0x1100;
const HASH_OFF: usize = 0x1200;
const RELDYN_OFF: usize = 0x1300;
const RELPLT_OFF: usize = 0x1400;
const INIT_OFF: usize = 0x1500;
const FINI_OFF: usize = 0x1600;
pub const SLOTS_OFF: usize = 0x1700;
const SHSTR_OFF: usize = 0x1800;
const SHOFF: usize = 0x1900;
const IMAGE_LEN: usize = 0x1b00;

/// Reservation size the loader computes for these images.
pub const MODULE_SIZE: usize = 0x2000;

struct SymDef {
    name: String,
    value: u32,
    size: u32,
    info: u8,
    shndx: u16,
}

pub struct ImageBuilder {
    syms: Vec<SymDef>,
    rels: Vec<(u32, u32, u32)>,
    plt_rels: Vec<(u32, u32, u32)>,
    pltrel_tag: i64,
    with_hash: bool,
    init_entries: u32,
    fini_entries: u32,
    exidx_entries: u32,
    slots: Vec<(usize, u32)>,
}

impl Default for ImageBuilder {
    fn default() -> ImageBuilder {
        ImageBuilder::new()
    }
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder {
            syms: Vec::new(),
            rels: Vec::new(),
            plt_rels: Vec::new(),
            pltrel_tag: DT_REL,
            with_hash: true,
            init_entries: 0,
            fini_entries: 0,
            exidx_entries: 0,
            slots: Vec::new(),
        }
    }

    /// A defined global function symbol. Returns its symtab index.
    pub fn export(&mut self, name: &str, value: u32, size: u32) -> u32 {
        self.push_sym(name, value, size, (STB_GLOBAL << 4) | STT_FUNC, 1)
    }

    /// An undefined global (strongly bound) symbol.
    pub fn import(&mut self, name: &str) -> u32 {
        self.push_sym(name, 0, 0, STB_GLOBAL << 4, 0)
    }

    /// An undefined weakly bound symbol.
    pub fn weak_import(&mut self, name: &str) -> u32 {
        self.push_sym(name, 0, 0, STB_WEAK << 4, 0)
    }

    fn push_sym(&mut self, name: &str, value: u32, size: u32, info: u8, shndx: u16) -> u32 {
        self.syms.push(SymDef {
            name: name.to_string(),
            value,
            size,
            info,
            shndx,
        });
        self.syms.len() as u32
    }

    /// A `.rel.dyn` entry.
    pub fn rel(&mut self, offset: usize, symidx: u32, rtype: u32) -> &mut Self {
        self.rels.push((offset as u32, symidx, rtype));
        self
    }

    /// A `.rel.plt` entry.
    pub fn plt_rel(&mut self, offset: usize, symidx: u32, rtype: u32) -> &mut Self {
        self.plt_rels.push((offset as u32, symidx, rtype));
        self
    }

    /// Claim `DT_PLTREL` is `DT_RELA` (an unsupported PLT style).
    pub fn plt_rela_style(&mut self) -> &mut Self {
        self.pltrel_tag = elf::abi::DT_RELA;
        self
    }

    /// Plant a pre-image value at `offset` in the file.
    pub fn slot(&mut self, offset: usize, value: u32) -> &mut Self {
        assert!((SLOTS_OFF..SHSTR_OFF).contains(&offset));
        self.slots.push((offset, value));
        self
    }

    pub fn no_hash(&mut self) -> &mut Self {
        self.with_hash = false;
        self
    }

    /// `.init_array` with `count` null entries.
    pub fn init_array(&mut self, count: u32) -> &mut Self {
        assert!(count <= 0x40);
        self.init_entries = count;
        self
    }

    /// `.fini_array` with `count` null entries.
    pub fn fini_array(&mut self, count: u32) -> &mut Self {
        assert!(count <= 0x40);
        self.fini_entries = count;
        self
    }

    /// An exception-index table with `count` entries.
    pub fn exidx(&mut self, count: u32) -> &mut Self {
        assert!(count <= 0x20);
        self.exidx_entries = count;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        assert!(self.syms.len() < 16);
        let mut img = vec![0u8; IMAGE_LEN];

        // .dynstr
        let mut strtab = vec![0u8];
        let mut name_offs = Vec::new();
        for sym in &self.syms {
            name_offs.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }
        assert!(strtab.len() <= 0x100);
        img[DYNSTR_OFF..DYNSTR_OFF + strtab.len()].copy_from_slice(&strtab);

        // .dynsym
        let nsyms = self.syms.len() + 1;
        for (i, sym) in self.syms.iter().enumerate() {
            let off = DYNSYM_OFF + (i + 1) * 16;
            w32(&mut img, off, name_offs[i]);
            w32(&mut img, off + 4, sym.value);
            w32(&mut img, off + 8, sym.size);
            img[off + 12] = sym.info;
            img[off + 13] = 0;
            w16(&mut img, off + 14, sym.shndx);
        }

        // .hash: nbucket, nchain, buckets, chains
        let nbucket = 4usize;
        if self.with_hash {
            w32(&mut img, HASH_OFF, nbucket as u32);
            w32(&mut img, HASH_OFF + 4, nsyms as u32);
            let buckets = HASH_OFF + 8;
            let chains = buckets + nbucket * 4;
            for i in 0..nsyms {
                let name: &[u8] = if i == 0 {
                    b""
                } else {
                    self.syms[i - 1].name.as_bytes()
                };
                let bucket = buckets + (elf_hash(name) as usize % nbucket) * 4;
                let head = r32(&img, bucket);
                if head == 0 {
                    w32(&mut img, bucket, i as u32);
                } else {
                    let mut j = head as usize;
                    while r32(&img, chains + j * 4) != 0 {
                        j = r32(&img, chains + j * 4) as usize;
                    }
                    w32(&mut img, chains + j * 4, i as u32);
                }
            }
        }

        // relocation tables
        for (i, (offset, symidx, rtype)) in self.rels.iter().enumerate() {
            w32(&mut img, RELDYN_OFF + i * 8, *offset);
            w32(&mut img, RELDYN_OFF + i * 8 + 4, (symidx << 8) | rtype);
        }
        for (i, (offset, symidx, rtype)) in self.plt_rels.iter().enumerate() {
            w32(&mut img, RELPLT_OFF + i * 8, *offset);
            w32(&mut img, RELPLT_OFF + i * 8 + 4, (symidx << 8) | rtype);
        }
        assert!(self.rels.len() <= 0x20 && self.plt_rels.len() <= 0x20);

        // exception-index entries: |31-bit prel offset| cantunwind |
        for i in 0..self.exidx_entries as usize {
            w32(&mut img, EXIDX_OFF + i * 8, 0x7fff_fffe);
            w32(&mut img, EXIDX_OFF + i * 8 + 4, 1);
        }

        // pre-image slot values
        for (offset, value) in &self.slots {
            w32(&mut img, *offset, *value);
        }

        // .dynamic
        let mut dt = DYN_OFF;
        let push_dyn = |img: &mut Vec<u8>, dt: &mut usize, tag: i64, val: u32| {
            w32(img, *dt, tag as u32);
            w32(img, *dt + 4, val);
            *dt += 8;
        };
        push_dyn(&mut img, &mut dt, DT_SYMTAB, DYNSYM_OFF as u32);
        push_dyn(&mut img, &mut dt, DT_SYMENT, 16);
        push_dyn(&mut img, &mut dt, DT_STRTAB, DYNSTR_OFF as u32);
        push_dyn(&mut img, &mut dt, DT_STRSZ, strtab.len() as u32);
        if self.with_hash {
            push_dyn(&mut img, &mut dt, DT_HASH, HASH_OFF as u32);
        }
        if !self.rels.is_empty() {
            push_dyn(&mut img, &mut dt, DT_REL, RELDYN_OFF as u32);
            push_dyn(&mut img, &mut dt, DT_RELSZ, (self.rels.len() * 8) as u32);
            push_dyn(&mut img, &mut dt, DT_RELENT, 8);
        }
        if !self.plt_rels.is_empty() {
            push_dyn(&mut img, &mut dt, DT_JMPREL, RELPLT_OFF as u32);
            push_dyn(&mut img, &mut dt, DT_PLTRELSZ, (self.plt_rels.len() * 8) as u32);
            push_dyn(&mut img, &mut dt, DT_PLTREL, self.pltrel_tag as u32);
        }
        push_dyn(&mut img, &mut dt, DT_NULL, 0);
        let dyn_size = dt - DYN_OFF;

        // section headers + .shstrtab
        struct Sec {
            name: &'static str,
            sh_type: u32,
            addr: usize,
            size: usize,
            link: u32,
            entsize: u32,
        }
        let mut secs = vec![
            Sec { name: ".dynsym", sh_type: SHT_DYNSYM, addr: DYNSYM_OFF, size: nsyms * 16, link: 2, entsize: 16 },
            Sec { name: ".dynstr", sh_type: SHT_STRTAB, addr: DYNSTR_OFF, size: strtab.len(), link: 0, entsize: 0 },
        ];
        if self.with_hash {
            secs.push(Sec { name: ".hash", sh_type: SHT_HASH, addr: HASH_OFF, size: 8 + (nbucket + nsyms) * 4, link: 1, entsize: 4 });
        }
        if self.init_entries > 0 {
            secs.push(Sec { name: ".init_array", sh_type: SHT_INIT_ARRAY, addr: INIT_OFF, size: self.init_entries as usize * 4, link: 0, entsize: 4 });
        }
        if self.fini_entries > 0 {
            secs.push(Sec { name: ".fini_array", sh_type: SHT_FINI_ARRAY, addr: FINI_OFF, size: self.fini_entries as usize * 4, link: 0, entsize: 4 });
        }
        secs.push(Sec { name: ".shstrtab", sh_type: SHT_STRTAB, addr: SHSTR_OFF, size: 0, link: 0, entsize: 0 });

        let mut shstr = vec![0u8];
        let name_offs: Vec<u32> = secs
            .iter()
            .map(|sec| {
                let off = shstr.len() as u32;
                shstr.extend_from_slice(sec.name.as_bytes());
                shstr.push(0);
                off
            })
            .collect();
        let shstrndx = secs.len(); // +1 for the leading null shdr below
        secs.last_mut().unwrap().size = shstr.len();
        assert!(shstr.len() <= 0x100);
        img[SHSTR_OFF..SHSTR_OFF + shstr.len()].copy_from_slice(&shstr);

        // shdr 0 stays zeroed
        for (i, sec) in secs.iter().enumerate() {
            let off = SHOFF + (i + 1) * 40;
            w32(&mut img, off, name_offs[i]);
            w32(&mut img, off + 4, sec.sh_type);
            w32(&mut img, off + 8, 0);
            w32(&mut img, off + 12, sec.addr as u32);
            w32(&mut img, off + 16, sec.addr as u32);
            w32(&mut img, off + 20, sec.size as u32);
            w32(&mut img, off + 24, sec.link);
            w32(&mut img, off + 28, 0);
            w32(&mut img, off + 32, 4);
            w32(&mut img, off + 36, sec.entsize);
        }
        let shnum = secs.len() + 1;
        assert!(SHOFF + shnum * 40 <= IMAGE_LEN);

        // ehdr
        img[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        img[4] = 1; // ELFCLASS32
        img[5] = 1; // ELFDATA2LSB
        img[6] = 1; // EV_CURRENT
        w16(&mut img, 16, 3); // ET_DYN
        w16(&mut img, 18, 40); // EM_ARM
        w32(&mut img, 20, 1);
        w32(&mut img, 24, 0);
        w32(&mut img, 28, PHOFF as u32);
        w32(&mut img, 32, SHOFF as u32);
        w32(&mut img, 36, 0x0500_0000); // EABI v5
        w16(&mut img, 40, 52);
        w16(&mut img, 42, 32);
        w16(&mut img, 46, 40);
        w16(&mut img, 48, shnum as u16);
        w16(&mut img, 50, shstrndx as u16);

        // phdrs
        let mut ph = PHOFF;
        let push_phdr = |img: &mut Vec<u8>,
                             ph: &mut usize,
                             p_type: u32,
                             off: usize,
                             filesz: usize,
                             memsz: usize,
                             flags: u32,
                             align: u32| {
            w32(img, *ph, p_type);
            w32(img, *ph + 4, off as u32);
            w32(img, *ph + 8, off as u32);
            w32(img, *ph + 12, off as u32);
            w32(img, *ph + 16, filesz as u32);
            w32(img, *ph + 20, memsz as u32);
            w32(img, *ph + 24, flags);
            w32(img, *ph + 28, align);
            *ph += 32;
        };
        push_phdr(&mut img, &mut ph, PT_LOAD, 0, 0x1000, 0x1000, PF_R | PF_X, 0x1000);
        push_phdr(
            &mut img,
            &mut ph,
            PT_LOAD,
            0x1000,
            IMAGE_LEN - 0x1000,
            IMAGE_LEN - 0x1000,
            PF_R | PF_W,
            0x1000,
        );
        push_phdr(&mut img, &mut ph, PT_DYNAMIC, DYN_OFF, dyn_size, dyn_size, PF_R, 4);
        let mut phnum = 3;
        if self.exidx_entries > 0 {
            push_phdr(
                &mut img,
                &mut ph,
                0x7000_0001, // PT_ARM_EXIDX
                EXIDX_OFF,
                self.exidx_entries as usize * 8,
                self.exidx_entries as usize * 8,
                PF_R,
                4,
            );
            phnum += 1;
        }
        w16(&mut img, 44, phnum);

        img
    }
}

fn w16(img: &mut [u8], off: usize, val: u16) {
    img[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn w32(img: &mut [u8], off: usize, val: u32) {
    img[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn r32(img: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(img[off..off + 4].try_into().unwrap())
}
