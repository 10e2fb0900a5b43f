//! The reconstructed virtual address space: an ordered, non-overlapping set
//! of load blocks indexed by virtual address. All reads of target memory
//! funnel through here.
use crate::core::arch::Machine;
use crate::core::block::LoadBlock;
use crate::core::memory::MemoryRef;
use crate::core::{CoreError, Result};
use rangemap::RangeMap;
use std::borrow::Cow;

/// Stable handle to a load block. Blocks are never removed so ids stay valid
/// for the life of the session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockId(u32);

pub struct AddressSpace {
    machine: Machine,
    blocks: Vec<LoadBlock>,
    ranges: RangeMap<u64, u32>,
}

impl AddressSpace {
    pub fn new(machine: Machine) -> AddressSpace {
        AddressSpace {
            machine,
            blocks: Vec::new(),
            ranges: RangeMap::new(),
        }
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn vabits_mask(&self) -> u64 {
        self.machine.vabits_mask()
    }

    pub fn add_load_block(&mut self, block: LoadBlock) -> Result<BlockId> {
        let start = block.vaddr;
        let end = block
            .vaddr
            .checked_add(block.mem_size)
            .filter(|end| *end > start)
            .ok_or_else(|| CoreError::InvalidElf {
                reason: format!("load block at 0x{start:x} has a bad size"),
            })?;
        if self.ranges.overlapping(start..end).next().is_some() {
            return Err(CoreError::Overlap { vaddr: start, end });
        }

        let id = BlockId(self.blocks.len() as u32);
        self.ranges.insert(start..end, id.0);
        self.blocks.push(block);
        Ok(id)
    }

    pub fn find(&self, vaddr: u64) -> Option<BlockId> {
        let vaddr = vaddr & self.vabits_mask();
        self.ranges.get(&vaddr).map(|id| BlockId(*id))
    }

    pub fn block(&self, id: BlockId) -> &LoadBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut LoadBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &LoadBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (BlockId(i as u32), b))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_virtual_valid(&self, vaddr: u64) -> bool {
        self.find(vaddr).is_some()
    }

    pub fn is_readable(&self, vaddr: u64, len: u64) -> bool {
        match self.find(vaddr) {
            Some(id) => {
                let block = self.block(id);
                block.readable() && (vaddr & self.vabits_mask()) + len <= block.vaddr + block.mem_size
            }
            None => false,
        }
    }

    pub fn memory_ref(&self, vaddr: u64) -> Result<MemoryRef> {
        let vaddr = vaddr & self.vabits_mask();
        let id = self
            .find(vaddr)
            .ok_or(CoreError::InvalidAddress { vaddr })?;
        Ok(MemoryRef::new(vaddr, id))
    }

    /// The host bytes at which `vaddr`'s contents live, through to the end
    /// of the backed region of its block.
    pub fn translate(&self, vaddr: u64) -> Result<&[u8]> {
        let vaddr = vaddr & self.vabits_mask();
        let id = self
            .find(vaddr)
            .ok_or(CoreError::InvalidAddress { vaddr })?;
        self.block(id).translate(vaddr)
    }

    pub fn read(&self, vaddr: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        let vaddr = vaddr & self.vabits_mask();
        let id = self
            .find(vaddr)
            .ok_or(CoreError::InvalidAddress { vaddr })?;
        self.block(id).read(vaddr, len)
    }

    pub fn read_u8(&self, vaddr: u64) -> Result<u8> {
        Ok(self.read(vaddr, 1)?[0])
    }

    pub fn read_u16(&self, vaddr: u64) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read(vaddr, 2)?.as_ref().try_into().unwrap()))
    }

    pub fn read_u32(&self, vaddr: u64) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read(vaddr, 4)?.as_ref().try_into().unwrap()))
    }

    pub fn read_u64(&self, vaddr: u64) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read(vaddr, 8)?.as_ref().try_into().unwrap()))
    }

    /// Read a word of target pointer width, widened to 64 bits.
    pub fn read_ptr(&self, vaddr: u64) -> Result<u64> {
        if self.machine.pointer_bits() == 64 {
            self.read_u64(vaddr)
        } else {
            Ok(self.read_u32(vaddr)? as u64)
        }
    }

    /// Read a null-terminated string out of target memory. Capped so a
    /// missing terminator in a corrupt core can't run away.
    pub fn read_string(&self, vaddr: u64) -> Result<String> {
        const MAX: usize = 4096;
        let mut s = String::new();
        for i in 0..MAX {
            let byte = self.read_u8(vaddr + i as u64)?;
            if byte == 0 {
                return Ok(s);
            }
            s.push(byte as char);
        }
        Ok(s)
    }
}
