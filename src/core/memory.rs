//! The universal handle for a byte in the target: a virtual address plus the
//! block that owns it. Deliberately not a host pointer, because a block's
//! backing can be swapped for a replacement mmap after the reference was
//! made. References are cheap to copy and may be advanced within their
//! block; reads that wander off the block fail with `InvalidAddress`.
use crate::core::space::{AddressSpace, BlockId};
use crate::core::Result;

#[derive(Copy, Clone, Debug)]
pub struct MemoryRef {
    vaddr: u64,
    block: BlockId,
}

impl MemoryRef {
    pub(crate) fn new(vaddr: u64, block: BlockId) -> MemoryRef {
        MemoryRef { vaddr, block }
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Move the reference forward without re-searching the address space.
    pub fn advance(&mut self, n: u64) {
        self.vaddr += n;
    }

    /// A new reference `n` bytes further into the same block.
    pub fn offset(&self, n: u64) -> MemoryRef {
        MemoryRef {
            vaddr: self.vaddr + n,
            block: self.block,
        }
    }

    pub fn read_u8(&self, space: &AddressSpace, off: u64) -> Result<u8> {
        Ok(space.block(self.block).read(self.vaddr + off, 1)?[0])
    }

    pub fn read_u16(&self, space: &AddressSpace, off: u64) -> Result<u16> {
        let bytes = space.block(self.block).read(self.vaddr + off, 2)?;
        Ok(u16::from_le_bytes(bytes.as_ref().try_into().unwrap()))
    }

    pub fn read_u32(&self, space: &AddressSpace, off: u64) -> Result<u32> {
        let bytes = space.block(self.block).read(self.vaddr + off, 4)?;
        Ok(u32::from_le_bytes(bytes.as_ref().try_into().unwrap()))
    }

    pub fn read_u64(&self, space: &AddressSpace, off: u64) -> Result<u64> {
        let bytes = space.block(self.block).read(self.vaddr + off, 8)?;
        Ok(u64::from_le_bytes(bytes.as_ref().try_into().unwrap()))
    }

    /// Read a word of target pointer width, widened to 64 bits.
    pub fn read_ptr(&self, space: &AddressSpace, off: u64) -> Result<u64> {
        if space.machine().pointer_bits() == 64 {
            self.read_u64(space, off)
        } else {
            Ok(self.read_u32(space, off)? as u64)
        }
    }

    /// The pointer-sized word this reference points at.
    pub fn value(&self, space: &AddressSpace) -> Result<u64> {
        self.read_ptr(space, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arch::Machine;
    use crate::core::block::LoadBlock;
    use crate::core::elf::{PF_R, PT_LOAD, Phdr};
    use crate::core::testdata;
    use std::rc::Rc;

    fn one_block_space(bytes: &[u8]) -> AddressSpace {
        let mut space = AddressSpace::new(Machine::X86_64);
        let map = Rc::new(testdata::map_bytes("memref", bytes));
        let ph = Phdr {
            ptype: PT_LOAD,
            flags: PF_R,
            offset: 0,
            vaddr: 0x4000,
            paddr: 0,
            file_size: bytes.len() as u64,
            mem_size: bytes.len() as u64,
            align: 0x1000,
        };
        space.add_load_block(LoadBlock::new(&ph, map)).unwrap();
        space
    }

    #[test]
    fn typed_reads() {
        let space = one_block_space(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        let r = space.memory_ref(0x4000).unwrap();
        assert_eq!(r.read_u8(&space, 0).unwrap(), 0x11);
        assert_eq!(r.read_u16(&space, 2).unwrap(), 0x4433);
        assert_eq!(r.read_u32(&space, 4).unwrap(), 0x88776655);
        assert_eq!(r.value(&space).unwrap(), 0x8877665544332211);
    }

    #[test]
    fn advance_stays_in_block() {
        let space = one_block_space(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut r = space.memory_ref(0x4000).unwrap();
        r.advance(4);
        assert_eq!(r.read_u8(&space, 0).unwrap(), 5);
        r.advance(8); // now past the block
        assert!(r.read_u8(&space, 0).is_err());
    }
}
