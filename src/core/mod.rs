//! The analyzer core: everything needed to turn a core file's bytes into a
//! navigable model of the crashed process. A `Core` owns the mapped file,
//! the reconstructed address space, the parsed notes, and the dynamic
//! linker's view of loaded objects. Higher layers (the ART decoders, the
//! commands) only ever touch target memory through it.
//!
//! Quick ELF reference: https://gist.github.com/x0nu11byt3/bcb35c3de461e5fb66173071a2379779
//! Core files only use program headers; sections don't appear in them.
pub mod arch;
pub mod block;
pub mod elf;
pub mod error;
pub mod io;
pub mod linkmap;
pub mod mapper;
pub mod memory;
pub mod notes;
pub mod space;
pub mod zip;

#[cfg(test)]
pub mod testdata;

pub use arch::Machine;
pub use block::LoadBlock;
pub use error::{CoreError, Result};
pub use linkmap::LinkMapEntry;
pub use mapper::MappedFile;
pub use memory::MemoryRef;
pub use notes::{FileRecord, NoteBlock, ThreadRecord};
pub use space::{AddressSpace, BlockId};

use crate::utils;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Returned by `foreach_load_block` callbacks.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Walk {
    Stop,
    Continue,
}

/// One loaded core file. There is one of these per session; commands borrow
/// it for the duration of one command.
pub struct Core {
    pub path: PathBuf,
    pub machine: Machine,
    pub space: AddressSpace,
    pub threads: Vec<ThreadRecord>,
    pub auxv: Vec<(u64, u64)>,
    pub files: Vec<FileRecord>,
    pub link_maps: Vec<LinkMapEntry>,
}

impl Core {
    pub fn load(path: &Path) -> Result<Core> {
        let map = Rc::new(MappedFile::map(path)?);
        let ehdr = elf::Ehdr::new(map.data())?;
        utils::require(ehdr.etype == elf::ET_CORE, "not a core file")?;
        let machine = Machine::from_elf(ehdr.machine)?;
        utils::require(
            machine.pointer_bits() == ehdr.bits,
            "ELF class doesn't match the machine",
        )?;

        let mut core = Core {
            path: path.to_path_buf(),
            machine,
            space: AddressSpace::new(machine),
            threads: Vec::new(),
            auxv: Vec::new(),
            files: Vec::new(),
            link_maps: Vec::new(),
        };

        for ph in elf::parse_phdrs(map.data(), &ehdr) {
            match ph.ptype {
                elf::PT_LOAD => {
                    // Blocks the process couldn't read carry nothing useful.
                    if ph.flags & elf::PF_R == 0 || ph.mem_size == 0 {
                        continue;
                    }
                    let block = LoadBlock::new(&ph, map.clone());
                    if let Err(err) = core.space.add_load_block(block) {
                        utils::warn(&format!("skipping load segment: {err}"));
                    }
                }
                elf::PT_NOTE => {
                    let start = ph.offset as usize;
                    let end = (ph.offset + ph.file_size) as usize;
                    if end > map.data().len() {
                        utils::warn(&format!("note segment at {start} is truncated"));
                        continue;
                    }
                    let parsed = NoteBlock::parse(&map.data()[start..end], machine);
                    core.absorb_note(parsed);
                }
                _ => (),
            }
        }

        // Best effort: a core without an auxv (or with its linker data
        // swapped out) still loads, it just has no object list.
        core.load_link_maps();
        Ok(core)
    }

    fn absorb_note(&mut self, mut block: NoteBlock) {
        self.threads.append(&mut block.threads);
        self.auxv.append(&mut block.auxv);
        self.files.append(&mut block.files);
    }

    pub fn find_auxv(&self, key: u64) -> Option<u64> {
        self.auxv.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// The NT_FILE row covering a virtual address.
    pub fn find_file(&self, vaddr: u64) -> Option<&FileRecord> {
        let vaddr = vaddr & self.space.vabits_mask();
        self.files
            .iter()
            .find(|f| f.start <= vaddr && vaddr < f.end)
    }

    pub fn find_load_block(&self, vaddr: u64) -> Option<&LoadBlock> {
        self.space.find(vaddr).map(|id| self.space.block(id))
    }

    pub fn foreach_load_block(&self, mut cb: impl FnMut(BlockId, &LoadBlock) -> Walk) {
        for (id, block) in self.space.iter() {
            if cb(id, block) == Walk::Stop {
                break;
            }
        }
    }

    pub fn memory_ref(&self, vaddr: u64) -> Result<MemoryRef> {
        self.space.memory_ref(vaddr)
    }

    pub fn translate(&self, vaddr: u64) -> Result<&[u8]> {
        self.space.translate(vaddr)
    }

    pub fn read_ptr(&self, vaddr: u64) -> Result<u64> {
        self.space.read_ptr(vaddr)
    }

    pub fn read_string(&self, vaddr: u64) -> Result<String> {
        self.space.read_string(vaddr)
    }

    pub fn pointer_size(&self) -> u64 {
        self.machine.pointer_size()
    }

    pub fn strip_code_tag(&self, code: u64) -> u64 {
        self.machine.strip_code_tag(code)
    }
}
