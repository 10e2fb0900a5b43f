//! One PT_LOAD's worth of target memory. A block knows where its bytes live
//! (an offset into the core, or a replacement window mapped from an on-disk
//! executable or shared object) and hands out slices of them.
use crate::core::elf::{PF_R, PF_W, PF_X, Phdr};
use crate::core::mapper::MappedFile;
use crate::core::{CoreError, Result};
use std::borrow::Cow;
use std::path::Path;
use std::rc::Rc;

pub struct LoadBlock {
    pub flags: u32,

    /// Offset to the first byte of the segment within the core file.
    pub offset: u64,

    /// Virtual address of the first byte in the segment.
    pub vaddr: u64,

    /// Physical address of the first byte in the segment.
    pub paddr: u64,

    /// Number of bytes present in the backing file.
    pub file_size: u64,

    /// Number of bytes the segment occupied in memory.
    pub mem_size: u64,

    pub align: u64,

    /// The core file ended before this segment's bytes did. Reads past the
    /// backed bytes of a truncated block fail instead of reading zeros.
    pub truncated: bool,

    backing: Rc<MappedFile>,
    backing_offset: u64,
    replaced: bool,
}

impl LoadBlock {
    pub fn new(ph: &Phdr, core_map: Rc<MappedFile>) -> LoadBlock {
        // p_filesz > p_memsz never happens in a well-formed file; clamping
        // keeps the read bounds coherent when it does.
        let file_size = ph.file_size.min(ph.mem_size);
        let truncated = (core_map.len() as u64) < ph.offset.saturating_add(file_size);
        LoadBlock {
            flags: ph.flags,
            offset: ph.offset,
            vaddr: ph.vaddr,
            paddr: ph.paddr,
            file_size,
            mem_size: ph.mem_size,
            align: ph.align,
            truncated,
            backing: core_map,
            backing_offset: ph.offset,
            replaced: false,
        }
    }

    pub fn executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    pub fn writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    pub fn readable(&self) -> bool {
        self.flags & PF_R != 0
    }

    pub fn flags_str(&self) -> String {
        Phdr::flags_str(self.flags)
    }

    pub fn contains(&self, vaddr: u64) -> bool {
        self.vaddr <= vaddr && vaddr < self.vaddr + self.mem_size
    }

    /// Swap the block's bytes for a window of a known-good on-disk copy.
    /// `offset` is relative to the start of that file.
    pub fn set_replacement(&mut self, map: Rc<MappedFile>, offset: u64) {
        self.backing = map;
        self.backing_offset = offset;
        self.truncated = false;
        self.replaced = true;
    }

    /// Path of the replacement file, when one has been attached.
    pub fn replacement(&self) -> Option<&Path> {
        self.replaced.then(|| self.backing.path.as_path())
    }

    /// The bytes actually present for this block. Shorter than `file_size`
    /// when the core was truncated mid-segment.
    fn backed(&self) -> &[u8] {
        let data = self.backing.data();
        let start = (self.backing_offset as usize).min(data.len());
        let len = (self.file_size as usize).min(data.len() - start);
        &data[start..start + len]
    }

    /// The live bytes from `vaddr` to the end of the backed region. Callers
    /// that need the zero-filled tail use `read` instead.
    pub fn translate(&self, vaddr: u64) -> Result<&[u8]> {
        let backed = self.backed();
        let off = vaddr.wrapping_sub(self.vaddr) as usize;
        if !self.contains(vaddr) || off >= backed.len() {
            return Err(CoreError::InvalidAddress { vaddr });
        }
        Ok(&backed[off..])
    }

    /// Read `len` bytes at `vaddr`. Bytes between `file_size` and `mem_size`
    /// were elided from the core and read as zero, unless the block is
    /// truncated, in which case nothing is known about them and the read
    /// fails.
    pub fn read(&self, vaddr: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        let off = vaddr.wrapping_sub(self.vaddr) as usize;
        if !self.contains(vaddr) || off + len > self.mem_size as usize {
            return Err(CoreError::InvalidAddress { vaddr });
        }

        let backed = self.backed();
        if off + len <= backed.len() {
            return Ok(Cow::Borrowed(&backed[off..off + len]));
        }
        if self.truncated {
            return Err(CoreError::InvalidAddress { vaddr });
        }

        let mut bytes = vec![0; len];
        if off < backed.len() {
            let have = backed.len() - off;
            bytes[..have].copy_from_slice(&backed[off..]);
        }
        Ok(Cow::Owned(bytes))
    }
}
