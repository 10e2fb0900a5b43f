//! A re-implementation of just enough of the dynamic linker to enumerate the
//! objects that were loaded into the target. The linker publishes its state
//! through the "rendezvous structure": the main executable's PT_DYNAMIC has a
//! DT_DEBUG entry pointing at `r_debug`, whose `r_map` heads a linked list of
//! `link_map` nodes, one per loaded object. See glibc's elf/link.h.
//!
//! Everything here reads target memory, so every step can fail on a damaged
//! core; walkers log one warning and keep whatever they managed to collect.
use crate::core::elf::{
    self, DT_DEBUG, DT_NULL, DT_STRTAB, DT_SYMENT, DT_SYMTAB, DT_VERSYM, ElfImage, PT_DYNAMIC,
    PT_LOAD, PT_PHDR, Phdr, STT_FUNC, STT_NOTYPE, Sym,
};
use crate::core::mapper::MappedFile;
use crate::core::zip;
use crate::core::{Core, CoreError, Result};
use crate::utils;
use std::path::Path;

/// Sanity cap for walking linked structures out of a corrupt core.
const MAX_LINK_MAPS: usize = 4096;
const MAX_DYN_ENTRIES: u64 = 1024;

/// Mirror of the linker's `link_map` node.
#[derive(Clone)]
pub struct LinkMapEntry {
    /// Virtual address of the node itself.
    pub addr: u64,

    /// Base the object was loaded at.
    pub l_addr: u64,

    pub name: String,

    /// The object's PT_DYNAMIC, when the linker filled it in.
    pub l_ld: u64,
}

impl Core {
    /// Populate `link_maps` from the rendezvous structure. Skippable at every
    /// step: a core whose auxv or linker pages weren't dumped simply ends up
    /// with an empty list (and `exec` can be used to supply the binary).
    pub(crate) fn load_link_maps(&mut self) {
        let debug = match self.r_debug_addr() {
            Ok(addr) => addr,
            Err(CoreError::NotFound(_)) => return, // quietly: not every core has one
            Err(err) => {
                utils::warn(&format!("couldn't locate r_debug: {err}"));
                return;
            }
        };
        self.link_maps = self.walk_link_maps(debug);
    }

    /// The address of `r_debug`, via auxv -> program headers -> PT_DYNAMIC ->
    /// DT_DEBUG.
    fn r_debug_addr(&self) -> Result<u64> {
        let at_phdr = self
            .find_auxv(crate::core::notes::AT_PHDR)
            .ok_or_else(|| CoreError::not_found("AT_PHDR"))?;
        let phnum = self
            .find_auxv(crate::core::notes::AT_PHNUM)
            .ok_or_else(|| CoreError::not_found("AT_PHNUM"))?;
        let wide = self.machine.pointer_bits() == 64;
        let phent = self
            .find_auxv(crate::core::notes::AT_PHENT)
            .unwrap_or(Phdr::size_of(wide) as u64);

        let first = self.read_target_phdr(at_phdr)?;
        let mut dynamic = 0;
        for i in 0..phnum {
            let ph = self.read_target_phdr(at_phdr.wrapping_add(i * phent))?;
            if ph.ptype == PT_DYNAMIC {
                dynamic = at_phdr.wrapping_sub(first.vaddr).wrapping_add(ph.vaddr);
                break;
            }
        }

        let debug = self.find_dynamic_entry(dynamic, DT_DEBUG)?;
        if debug == 0 {
            return Err(CoreError::not_found("DT_DEBUG"));
        }
        Ok(debug)
    }

    fn read_target_phdr(&self, vaddr: u64) -> Result<Phdr> {
        let wide = self.machine.pointer_bits() == 64;
        let bytes = self.space.read(vaddr, Phdr::size_of(wide))?;
        Phdr::new(&bytes, 0, wide)
    }

    /// Scan a dynamic table in target memory for a tag. Returns 0 when the
    /// table ends without finding it.
    fn find_dynamic_entry(&self, dynamic: u64, tag: u64) -> Result<u64> {
        if dynamic == 0 {
            return Err(CoreError::not_found("PT_DYNAMIC"));
        }
        let step = 2 * self.pointer_size();
        let mut at = dynamic;
        for _ in 0..MAX_DYN_ENTRIES {
            let d_tag = self.read_ptr(at)?;
            if d_tag == tag {
                return Ok(self.read_ptr(at + self.pointer_size())?);
            }
            if d_tag == DT_NULL {
                break;
            }
            at += step;
        }
        Ok(0)
    }

    /// Follow `r_debug.r_map` to the end of the list. One broken node ends
    /// the walk with a warning; what came before it is kept.
    fn walk_link_maps(&self, debug: u64) -> Vec<LinkMapEntry> {
        let ptr = self.pointer_size();
        let mut maps = Vec::new();

        // r_debug is { int version; link_map* map; ... }.
        let mut at = match self.read_ptr(debug + ptr) {
            Ok(head) => head,
            Err(err) => {
                utils::warn(&format!("couldn't read r_debug at 0x{debug:x}: {err}"));
                return maps;
            }
        };

        while at != 0 && maps.len() < MAX_LINK_MAPS {
            let node = (|| -> Result<(LinkMapEntry, u64)> {
                let l_addr = self.read_ptr(at)?;
                let l_name = self.read_ptr(at + ptr)?;
                let l_ld = self.read_ptr(at + 2 * ptr)?;
                let l_next = self.read_ptr(at + 3 * ptr)?;
                // A name that doesn't translate isn't fatal to the walk.
                let name = self.read_string(l_name).unwrap_or_default();
                Ok((
                    LinkMapEntry {
                        addr: at,
                        l_addr,
                        name,
                        l_ld,
                    },
                    l_next,
                ))
            })();
            match node {
                Ok((entry, next)) => {
                    maps.push(entry);
                    at = next;
                }
                Err(err) => {
                    utils::warn(&format!("link map walk stopped at 0x{at:x}: {err}"));
                    break;
                }
            }
        }
        maps
    }

    /// The object's dynamic table: from `l_ld` when the linker filled it in,
    /// otherwise by re-parsing the object's program headers at its base.
    fn find_dynamic(&self, entry: &LinkMapEntry) -> Result<u64> {
        if entry.l_ld != 0 {
            return Ok(entry.l_ld);
        }
        let bytes = self.space.read(entry.l_addr, 64)?;
        let ehdr = elf::Ehdr::new(&bytes)?;
        for i in 0..ehdr.num_ph_entries as u64 {
            let ph =
                self.read_target_phdr(entry.l_addr + ehdr.ph_offset + i * ehdr.ph_entry_size as u64)?;
            if ph.ptype == PT_DYNAMIC {
                return Ok(entry.l_addr + ph.vaddr);
            }
        }
        Err(CoreError::not_found("PT_DYNAMIC"))
    }

    /// The object's dynamic symbol table, located from DT_STRTAB / DT_SYMTAB /
    /// DT_SYMENT. There is no hash table in play, so the symbol count is
    /// inferred from the gap between the tables; with an unusual section
    /// order this can over- or under-count.
    fn dynamic_symbols(&self, entry: &LinkMapEntry) -> Result<SymbolView> {
        if entry.l_addr == 0 {
            return Err(CoreError::not_found("load base"));
        }
        let dynamic = self.find_dynamic(entry)?;
        let strtab = self.find_dynamic_entry(dynamic, DT_STRTAB)?;
        let symtab = self.find_dynamic_entry(dynamic, DT_SYMTAB)?;
        let syment = self.find_dynamic_entry(dynamic, DT_SYMENT)?;
        let versym = self.find_dynamic_entry(dynamic, DT_VERSYM)?;
        if syment == 0 || symtab == 0 || strtab == 0 {
            return Err(CoreError::not_found("dynamic symbol table"));
        }

        let upper = if versym != 0 {
            versym.min(strtab)
        } else {
            strtab
        };
        let count = upper
            .checked_sub(symtab)
            .ok_or_else(|| CoreError::not_found("dynamic symbol table"))?
            / syment;

        Ok(SymbolView {
            strtab: entry.l_addr.wrapping_add(strtab),
            symtab: entry.l_addr.wrapping_add(symtab),
            syment,
            count,
        })
    }

    fn read_target_sym(&self, view: &SymbolView, index: u64) -> Result<Sym> {
        let wide = self.machine.pointer_bits() == 64;
        let at = view.symtab.wrapping_add(index * view.syment);
        let bytes = self.space.read(at, Sym::size_of(wide))?;
        Sym::new(&bytes, 0, wide)
    }

    /// First exact match for `name` within one object.
    pub fn lookup_symbol_in(&self, entry: &LinkMapEntry, name: &str) -> Result<u64> {
        let view = self.dynamic_symbols(entry)?;
        for i in 0..view.count {
            let sym = self.read_target_sym(&view, i)?;
            if self.read_string(view.strtab + sym.name as u64)? == name {
                return Ok(entry.l_addr.wrapping_add(sym.value));
            }
        }
        Err(CoreError::not_found(format!("symbol {name}")))
    }

    /// First exact match for `name` across every loaded object.
    pub fn search_symbol(&self, name: &str) -> Result<u64> {
        for entry in &self.link_maps {
            match self.lookup_symbol_in(entry, name) {
                Ok(value) => return Ok(value),
                Err(_) => continue,
            }
        }
        Err(CoreError::not_found(format!("symbol {name}")))
    }

    /// The nearest preceding function symbol for an address, with the offset
    /// into it. Names come back raw; demangling is the caller's problem.
    pub fn nice_symbol(&self, addr: u64) -> Result<(String, u64)> {
        let addr = addr & self.space.vabits_mask();
        let mut best: Option<(String, u64)> = None;

        for entry in &self.link_maps {
            let Ok(view) = self.dynamic_symbols(entry) else {
                continue;
            };
            let vdso = entry.name == "[vdso]";
            for i in 0..view.count {
                let Ok(sym) = self.read_target_sym(&view, i) else {
                    break;
                };
                if sym.value == 0 {
                    continue;
                }
                if sym.stype() != STT_FUNC && !(vdso && sym.stype() == STT_NOTYPE) {
                    continue;
                }
                let value = entry.l_addr.wrapping_add(sym.value);
                if value > addr {
                    continue;
                }
                let delta = addr - value;
                if best.as_ref().is_none_or(|(_, d)| delta <= *d) {
                    match self.read_string(view.strtab + sym.name as u64) {
                        Ok(name) => best = Some((name, delta)),
                        Err(_) => break,
                    }
                }
            }
        }
        best.ok_or_else(|| CoreError::not_found(format!("symbol for 0x{addr:x}")))
    }

    /// Bind the main executable's on-disk bytes into the address space.
    /// `phdr_vaddr` is where its program headers sit in the target, i.e.
    /// AT_PHDR.
    pub fn exec(&mut self, phdr_vaddr: u64, path: &Path) -> Result<()> {
        let image = ElfImage::open(MappedFile::map(path)?)?;
        self.check_image(&image, path)?;

        let phdrs = image.phdrs();
        let first = phdrs
            .first()
            .filter(|ph| ph.ptype == PT_PHDR)
            .ok_or_else(|| CoreError::InvalidElf {
                reason: "executable's PHDR segment isn't first".to_string(),
            })?;
        let base = phdr_vaddr
            .wrapping_sub(image.ehdr.ph_offset)
            .wrapping_sub(first.vaddr.wrapping_sub(first.offset));
        self.replace_blocks(&image, base);
        Ok(())
    }

    /// Bind a shared object's on-disk bytes into the address space, at the
    /// base recorded in its link map entry. `subentry` names a stored `.so`
    /// inside `path` when the object was loaded straight out of an APK.
    pub fn sysroot(&mut self, object: &str, path: &Path, subentry: Option<&str>) -> Result<()> {
        let l_addr = self
            .link_maps
            .iter()
            .find(|m| m.name == object || m.name.ends_with(object))
            .map(|m| m.l_addr)
            .ok_or_else(|| CoreError::not_found(format!("link map for {object}")))?;

        let mapped = match subentry {
            Some(entry) => zip::map_stored_entry(path, entry)?,
            None => MappedFile::map(path)?,
        };
        let image = ElfImage::open(mapped)?;
        self.check_image(&image, path)?;
        self.replace_blocks(&image, l_addr);
        Ok(())
    }

    fn check_image(&self, image: &ElfImage, path: &Path) -> Result<()> {
        utils::require(
            image.ehdr.etype == elf::ET_DYN || image.ehdr.etype == elf::ET_EXEC,
            &format!("{} isn't an executable or shared object", path.display()),
        )?;
        utils::require(
            image.ehdr.machine == self.machine.elf_machine(),
            &format!("{} was built for a different machine", path.display()),
        )?;
        Ok(())
    }

    /// Swap matching non-writable load blocks over to the image's bytes.
    /// Writable segments are never substituted: the target mutated them.
    fn replace_blocks(&mut self, image: &ElfImage, base: u64) {
        for ph in image.phdrs() {
            if ph.ptype != PT_LOAD || ph.flags & elf::PF_W != 0 {
                continue;
            }

            let current = base.wrapping_add(utils::round_down(ph.vaddr, ph.align));
            let Some(id) = self.space.find(current) else {
                utils::warn(&format!("no load block at 0x{current:x}"));
                continue;
            };
            if self.space.block(id).writable() || self.space.block(id).vaddr != current {
                continue;
            }

            let mut page_offset = utils::round_down(ph.offset + image.map.offset(), 0x1000);
            // The kernel's NT_FILE table knows the real mapping offset; trust
            // it when it disagrees (e.g. an .so mapped out of an APK).
            if let Some(vma) = self.find_file(current)
                && vma.offset != page_offset
            {
                page_offset = vma.offset;
            }
            self.space
                .block_mut(id)
                .set_replacement(image.map.clone(), page_offset);
        }
    }

    /// Look up a symbol in a file on disk rather than in the target, scanning
    /// `.dynsym` then `.symtab`.
    pub fn dlsym(&self, path: &Path, symbol: &str) -> Result<u64> {
        let image = ElfImage::open(MappedFile::map(path)?)?;
        image.lookup_symbol(symbol)
    }
}

struct SymbolView {
    strtab: u64,
    symtab: u64,
    syment: u64,
    count: u64,
}
